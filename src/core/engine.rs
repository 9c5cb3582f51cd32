//! 暂存上传引擎
//!
//! 一次运行分为：清理 → 扫描远程 → 规划 → 暂存 → 移开旧文件 → 发布 → 收尾。
//! 暂存与发布期间的每一步远程改动都先记入 [`StagingRecord`]，
//! 任一步失败时按记录尽力回滚，再把原始错误包装后返回。

use crate::config::{ChunkConfig, RetryConfig, SyncConfig};
use crate::core::chunked::ChunkedTransfer;
use crate::core::cleaner::ArtifactCleaner;
use crate::core::planner::{UploadPlan, UploadPlanner};
use crate::core::scanner::build_remote;
use crate::core::staging::{backup_name, StagedFile, StagingRecord};
use crate::core::tree::{Decision, FileEntry, FileStatus, FolderEntry};
use crate::error::{Failures, RemoteOp, SyncError};
use crate::storage::{join_remote, RemoteSession, SessionProvider};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 引擎所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Clean,
    Cleaned,
    Staged,
    Published,
    RolledBack,
}

/// 引擎配置
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// 远程目标前缀，空串表示会话当前目录
    pub prefix: String,
    pub overwrite: bool,
    pub chunk: ChunkConfig,
    pub retry: RetryConfig,
}

impl EngineConfig {
    pub fn from_sync_config(config: &SyncConfig) -> Self {
        Self {
            prefix: config.path_prefix.clone(),
            overwrite: config.overwrite,
            chunk: config.chunk.clone(),
            retry: config.retry.clone(),
        }
    }
}

/// 同步报告
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub files_scanned: usize,
    pub uploaded: usize,
    pub overwritten: usize,
    pub skipped: usize,
    /// 已发布但有分块未写入的文件
    pub failed: usize,
    pub bytes_transferred: u64,
    pub chunked_files: usize,
    pub dropped_chunks: usize,
    pub errors: Vec<String>,
}

impl SyncReport {
    /// 没有任何文件需要处理时的报告
    pub fn empty(started_at: DateTime<Utc>, files_scanned: usize) -> Self {
        Self {
            started_at,
            ended_at: Utc::now(),
            files_scanned,
            uploaded: 0,
            overwritten: 0,
            skipped: 0,
            failed: 0,
            bytes_transferred: 0,
            chunked_files: 0,
            dropped_chunks: 0,
            errors: Vec::new(),
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.ended_at - self.started_at
    }
}

/// 传输统计
#[derive(Debug, Default)]
struct RunStats {
    bytes_transferred: u64,
    chunked_files: usize,
    dropped_chunks: usize,
    damaged_files: usize,
    errors: Vec<String>,
}

pub struct StagedUploadEngine {
    session: Arc<dyn RemoteSession>,
    provider: Arc<dyn SessionProvider>,
    config: EngineConfig,
    phase: Phase,
    record: StagingRecord,
    /// 已确认存在的远程目录
    known_dirs: HashSet<String>,
}

impl StagedUploadEngine {
    pub fn new(
        session: Arc<dyn RemoteSession>,
        provider: Arc<dyn SessionProvider>,
        config: EngineConfig,
    ) -> Self {
        Self {
            session,
            provider,
            config,
            phase: Phase::Clean,
            record: StagingRecord::new(),
            known_dirs: HashSet::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        debug!("引擎阶段: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// 把本地目录树同步到远程前缀下
    ///
    /// 返回错误时，本次运行的远程改动已尽力撤销。
    pub async fn run(&mut self, local: FolderEntry) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();
        let files_scanned = local.file_count();
        let prefix = self.config.prefix.clone();
        self.record.clear();
        self.known_dirs.clear();

        self.enter(Phase::Clean);
        let cleanup = ArtifactCleaner::new(self.session.as_ref()).clean(&prefix).await;
        self.enter(Phase::Cleaned);

        let remote = build_remote(self.session.as_ref(), &prefix).await?;
        let mut plan = UploadPlanner::new(&prefix, self.config.overwrite).plan(local, &remote);
        let summary = plan.summary();
        info!(
            "上传计划: 新增 {} 个, 覆盖 {} 个, 跳过 {} 个, 共 {} 字节",
            summary.upload_count, summary.overwrite_count, summary.skip_count, summary.upload_bytes
        );

        let mut stats = RunStats {
            errors: cleanup.failures.clone(),
            ..Default::default()
        };

        if let Err(e) = self.execute(&mut plan, &mut stats).await {
            error!("上传失败，开始回滚: {}", e);
            self.rollback().await;
            for file in plan.files_mut() {
                if file.needs_transfer() {
                    file.status = FileStatus::Failed;
                }
            }
            self.enter(Phase::RolledBack);
            return Err(SyncError::RolledBack(Box::new(e)));
        }

        let finalize_failures = self.finalize().await;
        stats.errors.extend(finalize_failures);
        self.enter(Phase::Published);

        let report = build_report(&plan, started_at, files_scanned, stats);
        info!(
            "同步完成: 上传 {} 个, 覆盖 {} 个, 跳过 {} 个, 传输 {} 字节",
            report.uploaded, report.overwritten, report.skipped, report.bytes_transferred
        );
        Ok(report)
    }

    async fn execute(&mut self, plan: &mut UploadPlan, stats: &mut RunStats) -> Result<(), SyncError> {
        for file in plan.files_mut() {
            if file.needs_transfer() {
                self.stage(file, stats).await?;
            }
        }
        self.enter(Phase::Staged);

        if plan.overwrite {
            self.displace(plan).await?;
        }
        self.publish(plan).await
    }

    /// 以临时名上传单个文件
    async fn stage(&mut self, file: &mut FileEntry, stats: &mut RunStats) -> Result<(), SyncError> {
        let (dir, name) = target_of(file)?;
        let local_path = file
            .local_path
            .clone()
            .ok_or_else(|| SyncError::Path(PathBuf::from(&file.name)))?;

        if file.decision == Decision::Upload && !self.resolve_hidden_collision(file, &dir, &name).await? {
            return Ok(());
        }

        self.ensure_dirs(&dir).await?;

        let staged = StagedFile::new(&dir, &name);
        let temp_path = staged.temp_path();
        // 先登记再传输，传输中断留下的半成品也会被回滚删除
        self.record.record_staged(staged);

        let chunked =
            file.size >= self.config.chunk.threshold_bytes && self.session.supports_random_write();
        if chunked {
            let transfer = ChunkedTransfer::new(
                self.session.clone(),
                self.provider.clone(),
                self.config.chunk.clone(),
                self.config.retry.clone(),
            );
            let report = transfer.transfer(&local_path, &temp_path).await?;
            stats.chunked_files += 1;
            stats.bytes_transferred += report.bytes_written;

            if !report.is_complete() {
                stats.dropped_chunks += report.failed.len();
                if self.config.chunk.strict {
                    if let Some(first) = report.failed.into_iter().next() {
                        return Err(first);
                    }
                } else {
                    stats.damaged_files += 1;
                    error!(
                        "{} 有 {} 个分块未写入，远程文件不完整",
                        temp_path,
                        report.failed.len()
                    );
                    stats.errors.extend(report.failed.iter().map(ToString::to_string));
                }
            }
        } else {
            let written = self
                .session
                .put(&local_path, &temp_path)
                .await
                .map_err(|e| SyncError::remote(RemoteOp::Put, temp_path.as_str(), e))?;
            stats.bytes_transferred += written;
        }

        file.status = FileStatus::Staged;
        debug!("已暂存: {}", temp_path);
        Ok(())
    }

    /// 远程目录树不收录隐藏条目，新增文件的最终路径可能已被占用
    ///
    /// 不覆盖时改为跳过，覆盖时改走备份流程。返回 false 表示无需上传。
    async fn resolve_hidden_collision(
        &self,
        file: &mut FileEntry,
        dir: &str,
        name: &str,
    ) -> Result<bool, SyncError> {
        let final_path = join_remote(dir, name);
        let existing = self
            .session
            .stat(&final_path)
            .await
            .map_err(|e| SyncError::remote(RemoteOp::Stat, final_path.as_str(), e))?;
        if existing.is_none() {
            return Ok(true);
        }

        if self.config.overwrite {
            info!("远程已存在未列出的同名条目，改为覆盖: {}", final_path);
            file.decision = Decision::Overwrite;
            Ok(true)
        } else {
            info!("远程已存在未列出的同名条目，跳过: {}", final_path);
            file.decision = Decision::Skip;
            Ok(false)
        }
    }

    /// 自上而下创建缺失的父目录，遇到已存在的目录即停止向上查找
    async fn ensure_dirs(&mut self, dir: &str) -> Result<(), SyncError> {
        let mut missing = Vec::new();
        let mut current = dir.to_string();

        while !is_root(&current) && !self.known_dirs.contains(&current) {
            let attrs = self
                .session
                .stat(&current)
                .await
                .map_err(|e| SyncError::remote(RemoteOp::Stat, current.as_str(), e))?;
            match attrs {
                Some(attrs) if attrs.is_dir => {
                    self.known_dirs.insert(current.clone());
                    break;
                }
                Some(_) => {
                    return Err(SyncError::remote(
                        RemoteOp::Mkdir,
                        current.as_str(),
                        io::Error::new(io::ErrorKind::AlreadyExists, "a file occupies the directory path"),
                    ));
                }
                None => {
                    let parent = parent_dir(&current);
                    missing.push(current);
                    current = parent;
                }
            }
        }

        for path in missing.into_iter().rev() {
            self.session
                .mkdir(&path)
                .await
                .map_err(|e| SyncError::remote(RemoteOp::Mkdir, path.as_str(), e))?;
            debug!("已创建远程目录: {}", path);
            self.record.record_dir(path.clone());
            self.known_dirs.insert(path);
        }
        Ok(())
    }

    /// 把将被覆盖的旧文件改为备份名
    async fn displace(&mut self, plan: &UploadPlan) -> Result<(), SyncError> {
        for file in plan.files() {
            if file.decision != Decision::Overwrite || file.status != FileStatus::Staged {
                continue;
            }
            let (dir, name) = target_of(file)?;
            let final_path = join_remote(&dir, &name);

            let exists = self
                .session
                .stat(&final_path)
                .await
                .map_err(|e| SyncError::remote(RemoteOp::Stat, final_path.as_str(), e))?;
            if exists.is_none() {
                warn!("待覆盖的文件已不存在，跳过备份: {}", final_path);
                continue;
            }

            let backup_path = join_remote(&dir, &backup_name(&name));
            self.session
                .rename(&final_path, &backup_path)
                .await
                .map_err(|e| SyncError::remote(RemoteOp::Rename, final_path.as_str(), e))?;
            self.record.record_displaced(&dir, &name);
            debug!("已备份: {} -> {}", final_path, backup_path);
        }
        Ok(())
    }

    /// 临时名改为最终名，每个文件的可见性切换是原子的
    async fn publish(&mut self, plan: &mut UploadPlan) -> Result<(), SyncError> {
        for file in plan.files_mut() {
            if file.status != FileStatus::Staged {
                continue;
            }
            let (dir, name) = target_of(file)?;
            let staged = StagedFile::new(&dir, &name);
            let temp_path = staged.temp_path();
            let final_path = staged.final_path();

            self.session
                .rename(&temp_path, &final_path)
                .await
                .map_err(|e| SyncError::remote(RemoteOp::Rename, temp_path.as_str(), e))?;
            self.record.mark_published(&temp_path);
            file.status = FileStatus::Published;
            debug!("已发布: {}", final_path);
        }
        Ok(())
    }

    /// 删除本次产生的备份，失败只记录
    async fn finalize(&mut self) -> Vec<String> {
        let mut failures = Failures::new();
        for displaced in self.record.displaced().to_vec() {
            let backup_path = displaced.backup_path();
            let result = self
                .session
                .remove(&backup_path)
                .await
                .map_err(|e| SyncError::remote(RemoteOp::Remove, backup_path.as_str(), e));
            if failures.absorb("删除备份", result).is_some() {
                debug!("已删除备份: {}", backup_path);
            }
        }
        self.record.clear();
        failures.messages()
    }

    /// 按暂存记录撤销本次运行的远程改动，所有步骤尽力而为
    async fn rollback(&mut self) {
        let mut failures = Failures::new();

        // 1. 已发布的新文件
        for file in self.record.published().to_vec() {
            let final_path = file.final_path();
            let result = self
                .session
                .remove(&final_path)
                .await
                .map_err(|e| SyncError::remote(RemoteOp::Remove, final_path.as_str(), e));
            if failures.absorb("撤销发布", result).is_some() {
                info!("已撤销发布: {}", final_path);
            }
        }

        // 2. 仍以临时名存在的文件，传输未开始时可能不存在
        for file in self.record.staged().to_vec() {
            let temp_path = file.temp_path();
            let result = ignore_not_found(self.session.remove(&temp_path).await)
                .map_err(|e| SyncError::remote(RemoteOp::Remove, temp_path.as_str(), e));
            if failures.absorb("删除临时文件", result).is_some() {
                self.record.forget_staged(&temp_path);
            }
        }

        // 3. 备份改回原名
        for displaced in self.record.displaced().to_vec() {
            let backup_path = displaced.backup_path();
            let final_path = displaced.final_path();
            let result = self
                .session
                .rename(&backup_path, &final_path)
                .await
                .map_err(|e| SyncError::remote(RemoteOp::Rename, backup_path.as_str(), e));
            if failures.absorb("恢复备份", result).is_some() {
                info!("已恢复: {}", final_path);
            }
        }

        // 4. 本次创建的目录，从深到浅，只删空目录
        for dir in self.record.created_dirs_deepest_first().cloned().collect::<Vec<_>>() {
            let listing = self
                .session
                .list_dir(&dir)
                .await
                .map_err(|e| SyncError::remote(RemoteOp::List, dir.as_str(), e));
            match failures.absorb("检查目录", listing) {
                Some(names) if names.is_empty() => {
                    let result = self
                        .session
                        .rmdir(&dir)
                        .await
                        .map_err(|e| SyncError::remote(RemoteOp::Rmdir, dir.as_str(), e));
                    failures.absorb("删除目录", result);
                }
                Some(_) => warn!("目录非空，保留: {}", dir),
                None => {}
            }
        }

        if failures.is_empty() {
            info!("回滚完成");
        } else {
            warn!("回滚有 {} 项未完成，残留将由下次运行清理", failures.len());
        }
        self.record.clear();
        self.known_dirs.clear();
    }
}

fn build_report(
    plan: &UploadPlan,
    started_at: DateTime<Utc>,
    files_scanned: usize,
    stats: RunStats,
) -> SyncReport {
    let mut report = SyncReport::empty(started_at, files_scanned);
    for file in plan.files() {
        match (file.decision, file.status) {
            (Decision::Skip, _) => report.skipped += 1,
            (Decision::Upload, FileStatus::Published) => report.uploaded += 1,
            (Decision::Overwrite, FileStatus::Published) => report.overwritten += 1,
            _ => {}
        }
    }
    report.failed = stats.damaged_files;
    report.bytes_transferred = stats.bytes_transferred;
    report.chunked_files = stats.chunked_files;
    report.dropped_chunks = stats.dropped_chunks;
    report.errors = stats.errors;
    report.ended_at = Utc::now();
    report
}

/// 规划后的文件拆分为（远程目录，文件名）
fn target_of(file: &FileEntry) -> Result<(String, String), SyncError> {
    let remote_path = file.remote_path().ok_or_else(|| {
        SyncError::remote(
            RemoteOp::Put,
            file.name.as_str(),
            io::Error::new(io::ErrorKind::InvalidInput, "file has no planned remote path"),
        )
    })?;
    Ok(split_remote(remote_path))
}

fn split_remote(path: &str) -> (String, String) {
    match path.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((dir, name)) => (dir.to_string(), name.to_string()),
        None => (String::new(), path.to_string()),
    }
}

fn parent_dir(path: &str) -> String {
    split_remote(path).0
}

fn is_root(path: &str) -> bool {
    path.is_empty() || path == "/" || path == "."
}

fn ignore_not_found(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scanner::build_local;
    use crate::storage::{LocalProvider, LocalSession};
    use std::path::Path;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    fn engine(target: &Path, prefix: &str, overwrite: bool) -> StagedUploadEngine {
        let session: Arc<dyn RemoteSession> = Arc::new(LocalSession::new(target).unwrap());
        let provider: Arc<dyn SessionProvider> = Arc::new(LocalProvider::new(target));
        StagedUploadEngine::new(
            session,
            provider,
            EngineConfig {
                prefix: prefix.to_string(),
                overwrite,
                ..Default::default()
            },
        )
    }

    fn leftovers(root: &Path) -> Vec<String> {
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(".sftpsync-"))
            .collect()
    }

    #[test]
    fn test_split_remote() {
        assert_eq!(split_remote("out/sub/b.txt"), ("out/sub".into(), "b.txt".into()));
        assert_eq!(split_remote("/a.txt"), ("/".into(), "a.txt".into()));
        assert_eq!(split_remote("a.txt"), ("".into(), "a.txt".into()));
        assert_eq!(parent_dir("out"), "");
    }

    #[tokio::test]
    async fn test_upload_creates_directories_and_publishes() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write(src.path(), "a.txt", b"aaa");
        write(src.path(), "sub/deep/b.txt", b"bb");

        let mut engine = engine(dst.path(), "out/data", false);
        let local = build_local(src.path()).await.unwrap();
        let report = engine.run(local).await.unwrap();

        assert_eq!(engine.phase(), Phase::Published);
        assert_eq!(report.uploaded, 2);
        assert_eq!(report.bytes_transferred, 5);
        assert_eq!(std::fs::read(dst.path().join("out/data/a.txt")).unwrap(), b"aaa");
        assert_eq!(std::fs::read(dst.path().join("out/data/sub/deep/b.txt")).unwrap(), b"bb");
        assert!(leftovers(dst.path()).is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_and_drops_backup() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write(src.path(), "a.txt", b"new");
        write(dst.path(), "out/a.txt", b"old");

        let mut engine = engine(dst.path(), "out", true);
        let report = engine.run(build_local(src.path()).await.unwrap()).await.unwrap();

        assert_eq!(report.overwritten, 1);
        assert_eq!(std::fs::read(dst.path().join("out/a.txt")).unwrap(), b"new");
        assert!(leftovers(dst.path()).is_empty());
    }

    #[tokio::test]
    async fn test_failure_rolls_back_temps_and_created_dirs() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write(src.path(), "a.txt", b"a");
        write(src.path(), "new/deep/c.txt", b"c");
        write(src.path(), "zz/d.txt", b"d");
        // 远程同名路径是文件，创建目录 out/zz 时失败
        write(dst.path(), "out/zz", b"not a dir");

        let mut engine = engine(dst.path(), "out", false);
        let err = engine
            .run(build_local(src.path()).await.unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::RolledBack(_)));
        assert_eq!(engine.phase(), Phase::RolledBack);
        assert!(!dst.path().join("out/a.txt").exists());
        assert!(!dst.path().join("out/new").exists());
        assert!(dst.path().join("out/zz").is_file());
        assert!(leftovers(dst.path()).is_empty());
    }

    #[tokio::test]
    async fn test_existing_hidden_target_is_skipped_or_overwritten() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write(src.path(), ".htaccess", b"new");
        write(src.path(), "a.txt", b"a");
        write(dst.path(), "out/.htaccess", b"old");

        let report = engine(dst.path(), "out", false)
            .run(build_local(src.path()).await.unwrap())
            .await
            .unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(std::fs::read(dst.path().join("out/.htaccess")).unwrap(), b"old");

        let report = engine(dst.path(), "out", true)
            .run(build_local(src.path()).await.unwrap())
            .await
            .unwrap();
        assert_eq!(report.overwritten, 2);
        assert_eq!(report.skipped, 0);
        assert_eq!(std::fs::read(dst.path().join("out/.htaccess")).unwrap(), b"new");
        assert!(leftovers(dst.path()).is_empty());
    }

    #[tokio::test]
    async fn test_large_files_use_chunked_transfer() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
        write(src.path(), "big.bin", &data);
        write(src.path(), "small.txt", b"s");

        let session: Arc<dyn RemoteSession> = Arc::new(LocalSession::new(dst.path()).unwrap());
        let provider: Arc<dyn SessionProvider> = Arc::new(LocalProvider::new(dst.path()));
        let mut engine = StagedUploadEngine::new(
            session,
            provider,
            EngineConfig {
                prefix: "out".into(),
                chunk: ChunkConfig {
                    threshold_bytes: 1024,
                    workers: 4,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let report = engine.run(build_local(src.path()).await.unwrap()).await.unwrap();

        assert_eq!(report.chunked_files, 1);
        assert_eq!(report.dropped_chunks, 0);
        assert_eq!(std::fs::read(dst.path().join("out/big.bin")).unwrap(), data);
        assert_eq!(std::fs::read(dst.path().join("out/small.txt")).unwrap(), b"s");
    }
}

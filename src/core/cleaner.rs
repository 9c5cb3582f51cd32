use crate::core::staging::{BACKUP_SUFFIX, STAGING_DIR_MARKER, TEMP_SUFFIX};
use crate::error::{Failures, RemoteOp, SyncError};
use crate::storage::{join_remote, RemoteSession};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tracing::{debug, info};

/// 清理结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    /// 从备份恢复的文件
    pub restored: Vec<String>,
    /// 删除的临时文件
    pub removed_temps: Vec<String>,
    /// 原名处已有文件、因而删除的过期备份
    pub removed_backups: Vec<String>,
    /// 删除的暂存目录
    pub removed_dirs: Vec<String>,
    pub failures: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.restored.is_empty()
            && self.removed_temps.is_empty()
            && self.removed_backups.is_empty()
            && self.removed_dirs.is_empty()
    }
}

enum BackupOutcome {
    Restored,
    Discarded,
}

/// 遗留产物清理器
///
/// 每次传输前运行，把上一次中断的运行留下的备份恢复、临时文件删除。
/// 单个操作失败只记录，不会中断整个清理；残留会在下次运行时再处理。
pub struct ArtifactCleaner<'a> {
    session: &'a dyn RemoteSession,
}

impl<'a> ArtifactCleaner<'a> {
    pub fn new(session: &'a dyn RemoteSession) -> Self {
        Self { session }
    }

    pub async fn clean(&self, root: &str) -> CleanupReport {
        let mut report = CleanupReport::default();
        let mut failures = Failures::new();

        let exists = failures.absorb(
            "检查清理根目录",
            self.session
                .stat(root)
                .await
                .map_err(|e| SyncError::remote(RemoteOp::Stat, root, e)),
        );
        match exists {
            Some(Some(attrs)) if attrs.is_dir => {
                info!("清理遗留产物: {}", root);
                self.clean_dir(root.to_string(), &mut report, &mut failures)
                    .await;
            }
            Some(_) => debug!("清理根目录不存在，跳过: {}", root),
            None => {}
        }

        report.failures = failures.messages();
        if !report.is_clean() || !report.failures.is_empty() {
            info!(
                "清理完成: 恢复 {} 个, 删除临时文件 {} 个, 删除过期备份 {} 个, 删除目录 {} 个, 失败 {} 个",
                report.restored.len(),
                report.removed_temps.len(),
                report.removed_backups.len(),
                report.removed_dirs.len(),
                report.failures.len()
            );
        }
        report
    }

    fn clean_dir<'b>(
        &'b self,
        dir: String,
        report: &'b mut CleanupReport,
        failures: &'b mut Failures,
    ) -> BoxFuture<'b, ()> {
        async move {
            let Some(entries) = failures.absorb(
                "列出目录",
                self.session
                    .list_dir_attr(&dir)
                    .await
                    .map_err(|e| SyncError::remote(RemoteOp::List, dir.as_str(), e)),
            ) else {
                return;
            };

            // 1. 原名缺失时从备份恢复；原名存在说明发布已完成，备份作废
            for (name, attrs) in &entries {
                if attrs.is_dir {
                    continue;
                }
                let Some(original) = name.strip_suffix(BACKUP_SUFFIX) else {
                    continue;
                };
                let backup_path = join_remote(&dir, name);
                let original_path = join_remote(&dir, original);
                match self.settle_backup(&backup_path, &original_path, failures).await {
                    Some(BackupOutcome::Restored) => report.restored.push(original_path),
                    Some(BackupOutcome::Discarded) => report.removed_backups.push(backup_path),
                    None => {}
                }
            }

            // 2. 临时文件一律删除
            for (name, attrs) in &entries {
                if attrs.is_dir || !name.ends_with(TEMP_SUFFIX) {
                    continue;
                }
                let temp_path = join_remote(&dir, name);
                let removed = failures.absorb(
                    "删除临时文件",
                    self.session
                        .remove(&temp_path)
                        .await
                        .map_err(|e| SyncError::remote(RemoteOp::Remove, temp_path.as_str(), e)),
                );
                if removed.is_some() {
                    debug!("已删除临时文件: {}", temp_path);
                    report.removed_temps.push(temp_path);
                }
            }

            // 3. 递归子目录
            for (name, attrs) in &entries {
                if !attrs.is_dir {
                    continue;
                }
                let child = join_remote(&dir, name);
                self.clean_dir(child.clone(), report, failures).await;

                // 4. 已清空的暂存目录
                if name.ends_with(STAGING_DIR_MARKER) {
                    self.remove_if_empty(&child, report, failures).await;
                }
            }
        }
        .boxed()
    }

    async fn settle_backup(
        &self,
        backup_path: &str,
        original_path: &str,
        failures: &mut Failures,
    ) -> Option<BackupOutcome> {
        let existing = failures.absorb(
            "检查原文件",
            self.session
                .stat(original_path)
                .await
                .map_err(|e| SyncError::remote(RemoteOp::Stat, original_path, e)),
        )?;

        if existing.is_some() {
            failures.absorb(
                "删除过期备份",
                self.session
                    .remove(backup_path)
                    .await
                    .map_err(|e| SyncError::remote(RemoteOp::Remove, backup_path, e)),
            )?;
            info!("原文件已存在，删除过期备份: {}", backup_path);
            return Some(BackupOutcome::Discarded);
        }

        failures.absorb(
            "从备份恢复",
            self.session
                .rename(backup_path, original_path)
                .await
                .map_err(|e| SyncError::remote(RemoteOp::Rename, backup_path, e)),
        )?;
        info!("已从备份恢复: {}", original_path);
        Some(BackupOutcome::Restored)
    }

    async fn remove_if_empty(
        &self,
        dir: &str,
        report: &mut CleanupReport,
        failures: &mut Failures,
    ) {
        let listing = failures.absorb(
            "检查暂存目录",
            self.session
                .list_dir(dir)
                .await
                .map_err(|e| SyncError::remote(RemoteOp::List, dir, e)),
        );
        match listing {
            Some(names) if names.is_empty() => {
                let removed = failures.absorb(
                    "删除暂存目录",
                    self.session
                        .rmdir(dir)
                        .await
                        .map_err(|e| SyncError::remote(RemoteOp::Rmdir, dir, e)),
                );
                if removed.is_some() {
                    debug!("已删除暂存目录: {}", dir);
                    report.removed_dirs.push(dir.to_string());
                }
            }
            Some(_) => debug!("暂存目录非空，保留: {}", dir),
            None => {}
        }
    }
}

//! 大文件分块并行传输
//!
//! 文件按 worker 数切成连续区间，每个 worker 独立打开本地与远程文件，
//! 定位到自己的偏移后顺序写入。区间互不重叠，写入无需加锁；
//! 只有"由谁创建远程文件"这一步用互斥锁串行化。

use crate::config::{ChunkConfig, RetryConfig};
use crate::core::retry::acquire_with_retry;
use crate::error::{is_transient_io, RemoteOp, SyncError};
use crate::storage::{OpenMode, RemoteFile, RemoteSession, SessionProvider};
use futures::future::join_all;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// 字节区间 [start, end)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkRange {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }
}

/// 把 `size` 字节切成 `workers` 段连续区间，余数并入最后一段
pub fn split_ranges(size: u64, workers: usize) -> Vec<ChunkRange> {
    let n = workers.max(1) as u64;
    let base = size / n;
    (0..n)
        .map(|i| {
            let start = i * base;
            let end = if i == n - 1 { size } else { start + base };
            ChunkRange {
                index: i as usize,
                start,
                end,
            }
        })
        .collect()
}

/// 分块传输结果
#[derive(Debug, Default)]
pub struct ChunkReport {
    pub size: u64,
    pub bytes_written: u64,
    /// 未完成的区间
    pub failed: Vec<SyncError>,
}

impl ChunkReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

struct WorkerContext {
    session: Arc<dyn RemoteSession>,
    provider: Arc<dyn SessionProvider>,
    local_path: PathBuf,
    remote_path: String,
    /// 远程文件是否已被某个 worker 创建
    created: Mutex<bool>,
    buffer_size: usize,
    reopen_delay: Duration,
    retry: RetryConfig,
}

pub struct ChunkedTransfer {
    session: Arc<dyn RemoteSession>,
    provider: Arc<dyn SessionProvider>,
    config: ChunkConfig,
    retry: RetryConfig,
}

impl ChunkedTransfer {
    pub fn new(
        session: Arc<dyn RemoteSession>,
        provider: Arc<dyn SessionProvider>,
        config: ChunkConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            session,
            provider,
            config,
            retry,
        }
    }

    /// 并行传输 `local_path` 到 `remote_path`，等待所有 worker 结束
    ///
    /// 单个 worker 失败不会中止其他 worker，也不会让本调用返回错误，
    /// 只记录在 `ChunkReport::failed` 中，由调用方决定如何处理。
    pub async fn transfer(&self, local_path: &Path, remote_path: &str) -> Result<ChunkReport, SyncError> {
        let size = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| SyncError::local(local_path, e))?
            .len();
        let ranges = split_ranges(size, self.config.workers);

        info!(
            "分块传输 {} -> {} ({} 字节, {} 个 worker)",
            local_path.display(),
            remote_path,
            size,
            ranges.len()
        );

        let ctx = Arc::new(WorkerContext {
            session: self.session.clone(),
            provider: self.provider.clone(),
            local_path: local_path.to_path_buf(),
            remote_path: remote_path.to_string(),
            created: Mutex::new(false),
            buffer_size: self.config.buffer_size.max(1),
            reopen_delay: self.config.reopen_delay(),
            retry: self.retry.clone(),
        });

        let handles: Vec<_> = ranges
            .iter()
            .map(|&range| {
                let ctx = ctx.clone();
                tokio::spawn(async move { run_worker(&ctx, range).await })
            })
            .collect();

        let mut report = ChunkReport {
            size,
            ..Default::default()
        };
        for (range, result) in ranges.iter().zip(join_all(handles).await) {
            let failure = match result {
                Ok(Ok(written)) => {
                    report.bytes_written += written;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("worker task aborted: {}", e),
            };
            error!(
                "分块 #{} [{}, {}) 传输失败，该区间未写入: {}",
                range.index, range.start, range.end, failure
            );
            report.failed.push(SyncError::ChunkWorker {
                path: remote_path.to_string(),
                start: range.start,
                end: range.end,
                reason: failure,
            });
        }

        Ok(report)
    }
}

/// 打开远程文件：第一个成功打开的 worker 负责创建，其余以不截断方式打开
///
/// 锁只覆盖"决定模式 + 打开"这一步；重连等待期间释放，其他 worker 可以继续打开。
async fn open_remote(
    ctx: &WorkerContext,
) -> Result<(Box<dyn RemoteFile>, Arc<dyn RemoteSession>), SyncError> {
    let open_err = |e| SyncError::remote(RemoteOp::Open, ctx.remote_path.as_str(), e);

    {
        let mut created = ctx.created.lock().await;
        match ctx.session.open(&ctx.remote_path, open_mode(*created)).await {
            Ok(file) => {
                *created = true;
                return Ok((file, ctx.session.clone()));
            }
            Err(e) if is_transient_io(&e) => {
                warn!(
                    "打开远程文件失败，{:?} 后重连重试: {} ({})",
                    ctx.reopen_delay, ctx.remote_path, e
                );
            }
            Err(e) => return Err(open_err(e)),
        }
    }

    tokio::time::sleep(ctx.reopen_delay).await;
    let fresh = acquire_with_retry(ctx.provider.as_ref(), &ctx.retry).await?;

    // 等待期间其他 worker 可能已创建文件，重新决定模式
    let mut created = ctx.created.lock().await;
    let file = fresh
        .open(&ctx.remote_path, open_mode(*created))
        .await
        .map_err(open_err)?;
    *created = true;
    Ok((file, fresh))
}

fn open_mode(created: bool) -> OpenMode {
    if created {
        OpenMode::ReadWriteNoTruncate
    } else {
        OpenMode::Create
    }
}

async fn run_worker(ctx: &WorkerContext, range: ChunkRange) -> Result<u64, SyncError> {
    let mut local = tokio::fs::File::open(&ctx.local_path)
        .await
        .map_err(|e| SyncError::local(&ctx.local_path, e))?;
    local
        .seek(std::io::SeekFrom::Start(range.start))
        .await
        .map_err(|e| SyncError::local(&ctx.local_path, e))?;

    // 会话需在写完前保持存活
    let (mut remote, _session) = open_remote(ctx).await?;
    let write_err = |e| SyncError::remote(RemoteOp::Write, ctx.remote_path.as_str(), e);

    remote.set_pipelined(true);
    remote.seek(range.start).await.map_err(write_err)?;

    let mut buf = vec![0u8; ctx.buffer_size];
    let mut remaining = range.len();
    let mut written = 0u64;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        local
            .read_exact(&mut buf[..want])
            .await
            .map_err(|e| SyncError::local(&ctx.local_path, e))?;
        remote.write_all(&buf[..want]).await.map_err(write_err)?;
        remaining -= want as u64;
        written += want as u64;
    }

    remote.close().await.map_err(write_err)?;
    debug!(
        "分块 #{} 完成: [{}, {}) {} 字节",
        range.index, range.start, range.end, written
    );
    Ok(written)
}

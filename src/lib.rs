pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use crate::config::SyncConfig;
pub use crate::core::{EngineConfig, StagedUploadEngine, SyncReport};
pub use crate::error::SyncError;

use chrono::Utc;
use std::sync::Arc;
use storage::SessionProvider;
use tracing::info;

/// 按配置执行一次完整同步
pub async fn run(config: &SyncConfig) -> Result<SyncReport, SyncError> {
    let provider = storage::create_provider(config)?;
    run_with_provider(config, provider).await
}

/// 使用指定的会话获取者执行同步
///
/// 本地目录不存在时在任何远程操作之前失败；没有文件时不建立连接。
pub async fn run_with_provider(
    config: &SyncConfig,
    provider: Arc<dyn SessionProvider>,
) -> Result<SyncReport, SyncError> {
    let started_at = Utc::now();

    let local = crate::core::build_local(&config.input_path).await?;
    if local.file_count() == 0 {
        info!("没有需要上传的文件: {}", config.input_path.display());
        return Ok(SyncReport::empty(started_at, 0));
    }

    let session = crate::core::acquire_with_retry(provider.as_ref(), &config.retry).await?;
    info!("已连接 {}", session.name());

    let mut engine =
        StagedUploadEngine::new(session, provider, EngineConfig::from_sync_config(config));
    let mut report = engine.run(local).await?;
    report.started_at = started_at;
    Ok(report)
}

//! 会话获取的指数退避重连

use crate::config::RetryConfig;
use crate::error::{is_transient_io, SyncError};
use crate::storage::{RemoteSession, SessionProvider};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 指数退避计算：initial * 2^n，封顶 max
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.initial_backoff(), config.max_backoff())
    }

    /// 下一次重试前的等待时长
    pub fn next_backoff(&mut self) -> Duration {
        let multiplier = 2u32.saturating_pow(self.attempt);
        self.attempt += 1;
        self.initial.saturating_mul(multiplier).min(self.max)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// 获取会话，遇到传输层错误时按退避重试
///
/// 非传输层错误（认证失败、配置错误等）立即返回。
pub async fn acquire_with_retry(
    provider: &dyn SessionProvider,
    config: &RetryConfig,
) -> Result<Arc<dyn RemoteSession>, SyncError> {
    let mut backoff = ExponentialBackoff::from_config(config);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        info!("正在连接 {} (第 {}/{} 次)", provider.name(), attempts, config.max_attempts);

        match provider.acquire().await {
            Ok(session) => return Ok(session),
            Err(e) if is_transient_io(&e) && attempts < config.max_attempts => {
                let delay = backoff.next_backoff();
                warn!("连接意外断开，{:?} 后重试: {}", delay, e);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                warn!("连接失败 (已尝试 {} 次): {}", attempts, e);
                return Err(SyncError::Connection {
                    attempts,
                    source: e,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalSession;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        failures_left: AtomicU32,
        kind: io::ErrorKind,
        calls: AtomicU32,
        root: tempfile::TempDir,
    }

    impl FlakyProvider {
        fn new(failures: u32, kind: io::ErrorKind) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                kind,
                calls: AtomicU32::new(0),
                root: tempfile::TempDir::new().unwrap(),
            }
        }
    }

    #[async_trait]
    impl SessionProvider for FlakyProvider {
        async fn acquire(&self) -> io::Result<Arc<dyn RemoteSession>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(io::Error::new(self.kind, "flaky"));
            }
            Ok(Arc::new(LocalSession::new(self.root.path())?) as Arc<dyn RemoteSession>)
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut b = ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(10));
        assert_eq!(b.next_backoff(), Duration::from_secs(2));
        assert_eq!(b.next_backoff(), Duration::from_secs(4));
        assert_eq!(b.next_backoff(), Duration::from_secs(8));
        assert_eq!(b.next_backoff(), Duration::from_secs(10));
        assert_eq!(b.next_backoff(), Duration::from_secs(10));
        assert_eq!(b.attempt(), 5);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let provider = FlakyProvider::new(2, io::ErrorKind::ConnectionReset);
        let session = acquire_with_retry(&provider, &fast_config(6)).await;
        assert!(session.is_ok());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let provider = FlakyProvider::new(10, io::ErrorKind::UnexpectedEof);
        let err = acquire_with_retry(&provider, &fast_config(3)).await.err().unwrap();
        assert!(matches!(err, SyncError::Connection { attempts: 3, .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_error_fails_immediately() {
        let provider = FlakyProvider::new(1, io::ErrorKind::PermissionDenied);
        let err = acquire_with_retry(&provider, &fast_config(6)).await.err().unwrap();
        assert!(matches!(err, SyncError::Connection { attempts: 1, .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }
}

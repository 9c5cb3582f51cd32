//! 应用配置模块

use crate::error::SyncError;
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 目标后端
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Sftp,
    Local,
}

/// 分块并行传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// 并行 worker 数
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// 达到该大小（字节）的文件走分块传输
    #[serde(default = "default_threshold_bytes")]
    pub threshold_bytes: u64,
    /// 单次写入缓冲区大小
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// 打开失败后重连前的等待（毫秒）
    #[serde(default = "default_reopen_delay_ms")]
    pub reopen_delay_ms: u64,
    /// 任一分块失败即判定整个文件失败
    #[serde(default)]
    pub strict: bool,
}

fn default_workers() -> usize {
    5
}

fn default_threshold_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_buffer_size() -> usize {
    32 * 1024
}

fn default_reopen_delay_ms() -> u64 {
    1000
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            threshold_bytes: default_threshold_bytes(),
            buffer_size: default_buffer_size(),
            reopen_delay_ms: default_reopen_delay_ms(),
            strict: false,
        }
    }
}

impl ChunkConfig {
    pub fn reopen_delay(&self) -> Duration {
        Duration::from_millis(self.reopen_delay_ms)
    }
}

/// 会话获取的重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    6
}

fn default_initial_backoff_ms() -> u64 {
    2000
}

fn default_max_backoff_ms() -> u64 {
    64_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// 同步任务配置（JSON 文件）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub input_path: PathBuf,
    #[serde(default)]
    pub path_prefix: String,
    #[serde(default)]
    pub overwrite: bool,

    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub private_key_file: Option<String>,
    /// sftp 的根目录，或 local 后端的目标目录
    #[serde(default)]
    pub remote_root: Option<String>,

    #[serde(default)]
    pub chunk: ChunkConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_port() -> u16 {
    22
}

impl SyncConfig {
    /// 从 JSON 文件加载并校验
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {}", path.display(), e))?;
        let config = Self::from_json(&content)?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let config: SyncConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.chunk.workers == 0 {
            return Err(SyncError::Config("chunk.workers must be at least 1".into()));
        }
        if self.chunk.buffer_size == 0 {
            return Err(SyncError::Config("chunk.buffer_size must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_config() {
        let config = SyncConfig::from_json(
            r#"{"input_path": "/data/out", "host": "h", "username": "u"}"#,
        )
        .unwrap();
        assert_eq!(config.path_prefix, "");
        assert!(!config.overwrite);
        assert_eq!(config.backend, Backend::Sftp);
        assert_eq!(config.port, 22);
        assert_eq!(config.chunk.workers, 5);
        assert_eq!(config.chunk.buffer_size, 32 * 1024);
        assert_eq!(config.retry.max_attempts, 6);
        assert!(config.log.enabled);
    }

    #[test]
    fn test_nested_overrides() {
        let config = SyncConfig::from_json(
            r#"{
                "input_path": "in",
                "path_prefix": "/exports/",
                "overwrite": true,
                "backend": "local",
                "remote_root": "/mnt/target",
                "chunk": {"workers": 3, "strict": true},
                "log": {"level": "debug"}
            }"#,
        )
        .unwrap();
        assert!(config.overwrite);
        assert_eq!(config.backend, Backend::Local);
        assert_eq!(config.chunk.workers, 3);
        assert!(config.chunk.strict);
        assert_eq!(config.chunk.threshold_bytes, 64 * 1024 * 1024);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn test_rejects_zero_workers() {
        let result = SyncConfig::from_json(r#"{"input_path": "in", "chunk": {"workers": 0}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_input_path_is_error() {
        assert!(SyncConfig::from_json(r#"{"path_prefix": "x"}"#).is_err());
    }
}

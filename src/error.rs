//! 错误分类

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

/// 远程操作类型（用于错误上下文）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    Stat,
    List,
    Mkdir,
    Rmdir,
    Remove,
    Rename,
    Open,
    Write,
    Put,
    ChangeDir,
}

impl fmt::Display for RemoteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteOp::Stat => "stat",
            RemoteOp::List => "listdir",
            RemoteOp::Mkdir => "mkdir",
            RemoteOp::Rmdir => "rmdir",
            RemoteOp::Remove => "remove",
            RemoteOp::Rename => "rename",
            RemoteOp::Open => "open",
            RemoteOp::Write => "write",
            RemoteOp::Put => "put",
            RemoteOp::ChangeDir => "chdir",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("input path {} does not exist", .0.display())]
    Path(PathBuf),

    #[error("could not acquire remote session after {attempts} attempt(s): {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("remote {op} failed for '{path}': {source}")]
    RemoteIo {
        op: RemoteOp,
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("local I/O failed for {}: {source}", .path.display())]
    LocalIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("chunk [{start}, {end}) of '{path}' was not transferred: {reason}")]
    ChunkWorker {
        path: String,
        start: u64,
        end: u64,
        reason: String,
    },

    #[error("upload failed and was rolled back: {0}")]
    RolledBack(#[source] Box<SyncError>),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    pub fn remote(op: RemoteOp, path: impl Into<String>, source: io::Error) -> Self {
        SyncError::RemoteIo {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn local(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SyncError::LocalIo {
            path: path.into(),
            source,
        }
    }

    /// 是否为可通过重连恢复的传输层错误
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::RemoteIo { source, .. } | SyncError::Connection { source, .. } => {
                is_transient_io(source)
            }
            _ => false,
        }
    }
}

/// 连接被断开、超时等传输层错误
pub fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
            | io::ErrorKind::NotConnected
    )
}

/// 尽力而为阶段的失败收集器
///
/// 清理、回滚、收尾这类阶段中，单个操作失败只记录日志并继续；
/// 致命错误则直接以 `Err` 返回，不经过这里。
#[derive(Debug, Default)]
pub struct Failures {
    errors: Vec<SyncError>,
}

impl Failures {
    pub fn new() -> Self {
        Self::default()
    }

    /// 吸收一个可恢复的结果：失败时记录并返回 `None`
    pub fn absorb<T>(&mut self, what: &str, result: Result<T, SyncError>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("{}失败（继续执行）: {}", what, e);
                self.errors.push(e);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.to_string()).collect()
    }

    pub fn into_inner(self) -> Vec<SyncError> {
        self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let reset = SyncError::remote(
            RemoteOp::Open,
            "a.bin",
            io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
        );
        let denied = SyncError::remote(
            RemoteOp::Open,
            "a.bin",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(reset.is_transient());
        assert!(!denied.is_transient());
        assert!(!SyncError::Config("x".into()).is_transient());
    }

    #[test]
    fn test_failures_absorb_keeps_going() {
        let mut failures = Failures::new();
        let ok: Option<u32> = failures.absorb("stat", Ok(3));
        assert_eq!(ok, Some(3));

        let err: Option<()> = failures.absorb(
            "remove",
            Err(SyncError::remote(
                RemoteOp::Remove,
                "x",
                io::Error::new(io::ErrorKind::Other, "boom"),
            )),
        );
        assert!(err.is_none());
        assert_eq!(failures.len(), 1);
        assert!(failures.messages()[0].contains("remove"));
    }

    #[test]
    fn test_rolled_back_message_keeps_cause() {
        let cause = SyncError::remote(
            RemoteOp::Put,
            "dir/a.txt",
            io::Error::new(io::ErrorKind::Other, "disk full"),
        );
        let wrapped = SyncError::RolledBack(Box::new(cause));
        let msg = wrapped.to_string();
        assert!(msg.contains("rolled back"));
        assert!(msg.contains("disk full"));
    }
}

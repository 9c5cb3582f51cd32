use super::{OpenMode, RemoteAttrs, RemoteFile, RemoteSession, SessionProvider, WorkingDir};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};

/// 以本地目录为根的会话（挂载盘、测试）
pub struct LocalSession {
    base_path: PathBuf,
    cwd: WorkingDir,
    name: String,
}

impl LocalSession {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", base_path.display());
        Ok(Self {
            base_path,
            cwd: WorkingDir::new(),
            name,
        })
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let relative = self.cwd.resolve(path);
        if relative.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(relative)
        }
    }

    fn attrs(metadata: &std::fs::Metadata) -> RemoteAttrs {
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);
        RemoteAttrs {
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            is_dir: metadata.is_dir(),
            modified_time: modified,
        }
    }
}

#[async_trait]
impl RemoteSession for LocalSession {
    async fn stat(&self, path: &str) -> io::Result<Option<RemoteAttrs>> {
        match fs::metadata(self.resolve_path(path)).await {
            Ok(metadata) => Ok(Some(Self::attrs(&metadata))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_dir_attr(&self, path: &str) -> io::Result<Vec<(String, RemoteAttrs)>> {
        let mut entries = fs::read_dir(self.resolve_path(path)).await?;
        let mut result = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            result.push((name, Self::attrs(&metadata)));
        }
        Ok(result)
    }

    async fn mkdir(&self, path: &str) -> io::Result<()> {
        fs::create_dir(self.resolve_path(path)).await
    }

    async fn rmdir(&self, path: &str) -> io::Result<()> {
        fs::remove_dir(self.resolve_path(path)).await
    }

    async fn remove(&self, path: &str) -> io::Result<()> {
        fs::remove_file(self.resolve_path(path)).await
    }

    async fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        let target = self.resolve_path(to);
        // 与 SFTP 语义保持一致：不覆盖已存在的目标
        if fs::symlink_metadata(&target).await.is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("rename target exists: {}", to),
            ));
        }
        fs::rename(self.resolve_path(from), target).await
    }

    async fn open(&self, path: &str, mode: OpenMode) -> io::Result<Box<dyn RemoteFile>> {
        let mut options = fs::OpenOptions::new();
        options.write(true).read(true);
        match mode {
            OpenMode::Create => {
                options.create(true).truncate(true);
            }
            OpenMode::ReadWriteNoTruncate => {
                options.create(false).truncate(false);
            }
        }
        let file = options.open(self.resolve_path(path)).await?;
        Ok(Box::new(LocalFile {
            writer: BufWriter::new(file),
            pipelined: false,
        }))
    }

    async fn put(&self, local_path: &Path, remote_path: &str) -> io::Result<u64> {
        fs::copy(local_path, self.resolve_path(remote_path)).await
    }

    fn working_dir(&self) -> String {
        format!("/{}", self.cwd.get())
    }

    async fn change_dir(&self, path: &str) -> io::Result<()> {
        let target = self.cwd.resolve(path);
        let metadata = fs::metadata(self.resolve_path(path)).await?;
        if !metadata.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("not a directory: {}", path),
            ));
        }
        self.cwd.set(target);
        Ok(())
    }

    fn restore_dir(&self, path: String) {
        self.cwd.set(path);
    }

    fn supports_random_write(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 本地文件句柄
///
/// 流水线模式下写入先进入缓冲区，仅在 seek/close 时落盘；否则每次写入后立即 flush。
struct LocalFile {
    writer: BufWriter<fs::File>,
    pipelined: bool,
}

#[async_trait]
impl RemoteFile for LocalFile {
    async fn seek(&mut self, offset: u64) -> io::Result<()> {
        self.writer.flush().await?;
        self.writer.get_mut().seek(io::SeekFrom::Start(offset)).await?;
        Ok(())
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.writer.write_all(buf).await?;
        if !self.pipelined {
            self.writer.flush().await?;
        }
        Ok(())
    }

    fn set_pipelined(&mut self, enabled: bool) {
        self.pipelined = enabled;
    }

    async fn close(mut self: Box<Self>) -> io::Result<()> {
        self.writer.flush().await?;
        self.writer.get_mut().sync_all().await
    }
}

/// 每次获取都返回同一根目录上的新会话
pub struct LocalProvider {
    root: PathBuf,
    name: String,
}

impl LocalProvider {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let name = format!("local:{}", root.display());
        Self { root, name }
    }
}

#[async_trait]
impl SessionProvider for LocalProvider {
    async fn acquire(&self) -> io::Result<Arc<dyn RemoteSession>> {
        Ok(Arc::new(LocalSession::new(&self.root)?) as Arc<dyn RemoteSession>)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

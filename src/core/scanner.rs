use crate::core::tree::{segments, FileEntry, FolderEntry};
use crate::error::{RemoteOp, SyncError};
use crate::storage::{join_remote, RemoteSession};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 以该字符开头的远程条目被视为隐藏，不收录进远程目录树
///
/// 本地的点文件照常上传；远程一侧看不到它们，冲突由引擎在暂存/发布时处理。
const HIDDEN_MARKER: char = '.';

fn is_hidden(name: &str) -> bool {
    name.starts_with(HIDDEN_MARKER)
}

/// 扫描本地目录，生成目录树
pub async fn build_local(root: &Path) -> Result<FolderEntry, SyncError> {
    if !root.exists() {
        return Err(SyncError::Path(root.to_path_buf()));
    }

    let base = root.to_path_buf();
    info!("开始扫描本地目录: {}", base.display());

    // 使用 spawn_blocking 避免阻塞 async runtime
    let tree = tokio::task::spawn_blocking(move || walk_local(&base))
        .await
        .map_err(|e| SyncError::local(root, std::io::Error::new(std::io::ErrorKind::Other, e)))?;

    info!("本地扫描完成: {} 个文件", tree.file_count());
    Ok(tree)
}

fn walk_local(base: &Path) -> FolderEntry {
    let mut tree = FolderEntry::root();
    let mut skipped = 0usize;

    let walker = WalkDir::new(base).follow_links(false).min_depth(1);

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("跳过无法读取的条目: {}", e);
                skipped += 1;
                continue;
            }
        };

        let relative = match entry.path().strip_prefix(base) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let Some((name, parents)) = parts.split_last() else {
            continue;
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            tree.folder_mut_by_segments(parts.iter().map(String::as_str));
        } else if file_type.is_file() {
            let size = match entry.metadata() {
                Ok(m) => m.len(),
                Err(e) => {
                    warn!("无法读取文件元数据 {}: {}", entry.path().display(), e);
                    skipped += 1;
                    continue;
                }
            };
            let folder = tree.folder_mut_by_segments(parents.iter().map(String::as_str));
            folder.insert_file(FileEntry::local(
                name.clone(),
                PathBuf::from(entry.path()),
                size,
            ));
        } else {
            debug!("跳过非普通文件: {}", entry.path().display());
        }
    }

    if skipped > 0 {
        warn!("本地扫描跳过 {} 个条目", skipped);
    }
    tree
}

/// 扫描远程目录，生成目录树
///
/// 期间会切换会话工作目录到 `root_path`，退出时无论成功与否都恢复原目录。
/// 任一目录列表失败都会返回错误，不完整的远程视图会导致错误的比较结果。
pub async fn build_remote(
    session: &dyn RemoteSession,
    root_path: &str,
) -> Result<FolderEntry, SyncError> {
    let mut tree = FolderEntry::root();

    let root_attrs = session
        .stat(root_path)
        .await
        .map_err(|e| SyncError::remote(RemoteOp::Stat, root_path, e))?;
    match root_attrs {
        None => {
            info!("远程目录不存在，视为空: {}", root_path);
            return Ok(tree);
        }
        Some(attrs) if !attrs.is_dir => {
            return Err(SyncError::remote(
                RemoteOp::List,
                root_path,
                std::io::Error::new(std::io::ErrorKind::Other, "remote prefix is not a directory"),
            ));
        }
        Some(_) => {}
    }

    let previous = session.working_dir();
    let _restore = scopeguard::guard(previous, |prev| {
        debug!("恢复远程工作目录: {}", prev);
        session.restore_dir(prev);
    });

    if !root_path.is_empty() {
        session
            .change_dir(root_path)
            .await
            .map_err(|e| SyncError::remote(RemoteOp::ChangeDir, root_path, e))?;
    }

    info!("开始扫描远程目录: {} ({})", root_path, session.name());

    // 按目录逐层展开，避免异步递归
    let mut pending = vec![String::new()];
    while let Some(relative) = pending.pop() {
        let list_path = relative.trim_start_matches('/').to_string();
        let entries = session
            .list_dir_attr(&list_path)
            .await
            .map_err(|e| SyncError::remote(RemoteOp::List, join_remote(root_path, &list_path), e))?;

        let folder = tree.folder_mut_by_segments(segments(&relative));
        for (name, attrs) in entries {
            if is_hidden(&name) {
                continue;
            }
            if attrs.is_dir {
                let child = folder.child_mut(&name);
                pending.push(child.relative_path.clone());
            } else {
                let remote_path = format!("{}/{}", folder_remote_dir(root_path, &relative), name);
                folder.insert_file(FileEntry::remote(name, remote_path, attrs.size));
            }
        }
    }

    info!("远程扫描完成: {} 个文件", tree.file_count());
    Ok(tree)
}

/// 目录在远程的完整路径：前缀 + 相对路径
pub fn folder_remote_dir(prefix: &str, relative_path: &str) -> String {
    format!("{}{}", prefix.trim_end_matches('/'), relative_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalSession;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    #[tokio::test]
    async fn test_build_local_missing_root() {
        let err = build_local(Path::new("/definitely/not/here")).await.unwrap_err();
        assert!(matches!(err, SyncError::Path(_)));
    }

    #[tokio::test]
    async fn test_build_local_tree_includes_dotfiles() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", b"a");
        write(dir.path(), "sub/b.txt", b"bb");
        write(dir.path(), ".env", b"secret");
        write(dir.path(), ".git/config", b"c");
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();

        let tree = build_local(dir.path()).await.unwrap();
        assert_eq!(tree.file_count(), 4);
        assert_eq!(tree.files[".env"].size, 6);
        assert!(tree.find_folder("/.git").unwrap().files.contains_key("config"));
        let a = &tree.files["a.txt"];
        assert_eq!(a.size, 1);
        assert!(a.remote_path().is_none());
        assert_eq!(a.local_path.as_deref(), Some(dir.path().join("a.txt").as_path()));
        assert!(tree.find_folder("/empty").is_some());
        assert_eq!(tree.find_folder("/sub").unwrap().files["b.txt"].size, 2);
    }

    #[tokio::test]
    async fn test_build_remote_skips_hidden_and_restores_cwd() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "out/a.txt", b"a");
        write(dir.path(), "out/.hidden", b"h");
        write(dir.path(), "out/.cache/x", b"x");
        write(dir.path(), "out/sub/b.txt", b"bb");
        let session = LocalSession::new(dir.path()).unwrap();

        let tree = build_remote(&session, "out").await.unwrap();
        assert_eq!(session.working_dir(), "/");
        assert_eq!(tree.file_count(), 2);
        assert!(tree.find_folder("/.cache").is_none());
        assert!(!tree.files.contains_key(".hidden"));

        let b = &tree.find_folder("/sub").unwrap().files["b.txt"];
        assert_eq!(b.remote_path(), Some("out/sub/b.txt"));
        assert_eq!(b.size, 2);
    }

    #[tokio::test]
    async fn test_build_remote_missing_prefix_is_empty() {
        let dir = TempDir::new().unwrap();
        let session = LocalSession::new(dir.path()).unwrap();
        let tree = build_remote(&session, "nothing/here").await.unwrap();
        assert!(tree.is_empty());
    }

    #[test]
    fn test_folder_remote_dir() {
        assert_eq!(folder_remote_dir("", ""), "");
        assert_eq!(folder_remote_dir("out/", "/sub"), "out/sub");
        assert_eq!(folder_remote_dir("/", "/sub"), "/sub");
    }
}

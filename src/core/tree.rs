//! 目录树模型

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// 传输决定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Decision {
    Upload,
    Overwrite,
    Skip,
}

/// 单个文件在本次运行中的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileStatus {
    Pending,
    Staged,
    Published,
    Failed,
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileStatus::Pending => write!(f, "pending"),
            FileStatus::Staged => write!(f, "staged"),
            FileStatus::Published => write!(f, "published"),
            FileStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    /// 本地存在时的路径
    pub local_path: Option<PathBuf>,
    remote_path: Option<String>,
    pub size: u64,
    pub decision: Decision,
    pub status: FileStatus,
}

impl FileEntry {
    /// 本地文件，尚未规划
    pub fn local(name: impl Into<String>, local_path: PathBuf, size: u64) -> Self {
        Self {
            name: name.into(),
            local_path: Some(local_path),
            remote_path: None,
            size,
            decision: Decision::Upload,
            status: FileStatus::Pending,
        }
    }

    /// 远程文件，仅用于比较
    pub fn remote(name: impl Into<String>, remote_path: String, size: u64) -> Self {
        Self {
            name: name.into(),
            local_path: None,
            remote_path: Some(remote_path),
            size,
            decision: Decision::Skip,
            status: FileStatus::Pending,
        }
    }

    pub fn remote_path(&self) -> Option<&str> {
        self.remote_path.as_deref()
    }

    /// 设置远程路径，只允许设置一次
    pub fn assign_remote_path(&mut self, path: String) {
        assert!(
            self.remote_path.is_none(),
            "remote path of '{}' assigned twice",
            self.name
        );
        self.remote_path = Some(path);
    }

    pub fn needs_transfer(&self) -> bool {
        matches!(self.decision, Decision::Upload | Decision::Overwrite)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FolderEntry {
    pub name: String,
    /// 相对根的路径，根为 `""`，子目录为 `父路径 + "/" + 名称`
    pub relative_path: String,
    /// 父目录的 relative_path（只用于诊断）
    pub parent: Option<String>,
    pub folders: BTreeMap<String, FolderEntry>,
    pub files: BTreeMap<String, FileEntry>,
}

impl FolderEntry {
    pub fn root() -> Self {
        Self::default()
    }

    /// 取得或创建子目录
    pub fn child_mut(&mut self, name: &str) -> &mut FolderEntry {
        let relative_path = format!("{}/{}", self.relative_path, name);
        let parent = self.relative_path.clone();
        self.folders
            .entry(name.to_string())
            .or_insert_with(|| FolderEntry {
                name: name.to_string(),
                relative_path,
                parent: Some(parent),
                folders: BTreeMap::new(),
                files: BTreeMap::new(),
            })
    }

    /// 按路径段逐级取得或创建目录
    pub fn folder_mut_by_segments<'a, I>(&mut self, segments: I) -> &mut FolderEntry
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut current = self;
        for segment in segments {
            current = current.child_mut(segment);
        }
        current
    }

    /// 按相对路径查找目录，任一段不存在则返回 `None`
    pub fn find_folder(&self, relative_path: &str) -> Option<&FolderEntry> {
        let mut current = self;
        for segment in segments(relative_path) {
            current = current.folders.get(segment)?;
        }
        Some(current)
    }

    pub fn insert_file(&mut self, file: FileEntry) {
        self.files.insert(file.name.clone(), file);
    }

    /// 先序遍历：先本目录文件，再递归子目录
    pub fn walk_files(&self) -> Vec<(&FolderEntry, &FileEntry)> {
        let mut out = Vec::new();
        Self::collect(self, &mut out);
        out
    }

    fn collect<'a>(folder: &'a FolderEntry, out: &mut Vec<(&'a FolderEntry, &'a FileEntry)>) {
        for file in folder.files.values() {
            out.push((folder, file));
        }
        for child in folder.folders.values() {
            Self::collect(child, out);
        }
    }

    /// 与 `walk_files` 同序的可变遍历
    pub fn walk_files_mut(&mut self) -> Vec<&mut FileEntry> {
        let mut out = Vec::new();
        Self::collect_mut(self, &mut out);
        out
    }

    fn collect_mut<'a>(folder: &'a mut FolderEntry, out: &mut Vec<&'a mut FileEntry>) {
        out.extend(folder.files.values_mut());
        for child in folder.folders.values_mut() {
            Self::collect_mut(child, out);
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
            + self
                .folders
                .values()
                .map(FolderEntry::file_count)
                .sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.file_count() == 0
    }
}

/// 拆分相对路径为非空段
pub fn segments(relative_path: &str) -> impl Iterator<Item = &str> {
    relative_path.split('/').filter(|s| !s.is_empty())
}

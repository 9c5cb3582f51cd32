//! 暂存记录 - 本次运行对远程所做改动的撤销日志
//!
//! 每一步远程操作前后都同步更新，回滚只依据这里的内容。

use crate::storage::join_remote;

/// 临时文件后缀（上传中）
pub const TEMP_SUFFIX: &str = ".sftpsync-tmp";
/// 备份后缀（覆盖前被移开的旧文件）
pub const BACKUP_SUFFIX: &str = ".sftpsync-bak";
/// 暂存目录标记（只用于存放中间产物的目录，清空后可删除）
pub const STAGING_DIR_MARKER: &str = ".sftpsync-staging";

pub fn temp_name(final_name: &str) -> String {
    format!("{}{}", final_name, TEMP_SUFFIX)
}

pub fn backup_name(final_name: &str) -> String {
    format!("{}{}", final_name, BACKUP_SUFFIX)
}

/// 一个已开始上传的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub dir: String,
    pub temp_name: String,
    pub final_name: String,
}

impl StagedFile {
    pub fn new(dir: &str, final_name: &str) -> Self {
        Self {
            dir: dir.to_string(),
            temp_name: temp_name(final_name),
            final_name: final_name.to_string(),
        }
    }

    pub fn temp_path(&self) -> String {
        join_remote(&self.dir, &self.temp_name)
    }

    pub fn final_path(&self) -> String {
        join_remote(&self.dir, &self.final_name)
    }
}

/// 一个被移开的旧文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplacedFile {
    pub dir: String,
    pub final_name: String,
}

impl DisplacedFile {
    pub fn final_path(&self) -> String {
        join_remote(&self.dir, &self.final_name)
    }

    pub fn backup_path(&self) -> String {
        join_remote(&self.dir, &backup_name(&self.final_name))
    }
}

#[derive(Debug, Default)]
pub struct StagingRecord {
    /// 仍以临时名存在的文件
    staged: Vec<StagedFile>,
    /// 已发布到最终名的文件
    published: Vec<StagedFile>,
    displaced: Vec<DisplacedFile>,
    /// 本次运行创建的目录，按创建顺序（从根到叶）
    created_dirs: Vec<String>,
}

impl StagingRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dir(&mut self, path: String) {
        self.created_dirs.push(path);
    }

    pub fn record_staged(&mut self, file: StagedFile) {
        self.staged.push(file);
    }

    pub fn record_displaced(&mut self, dir: &str, final_name: &str) {
        self.displaced.push(DisplacedFile {
            dir: dir.to_string(),
            final_name: final_name.to_string(),
        });
    }

    /// 临时文件已改名为最终名
    pub fn mark_published(&mut self, temp_path: &str) {
        if let Some(pos) = self.staged.iter().position(|f| f.temp_path() == temp_path) {
            let file = self.staged.remove(pos);
            self.published.push(file);
        }
    }

    /// 临时文件已删除
    pub fn forget_staged(&mut self, temp_path: &str) {
        self.staged.retain(|f| f.temp_path() != temp_path);
    }

    pub fn staged(&self) -> &[StagedFile] {
        &self.staged
    }

    pub fn published(&self) -> &[StagedFile] {
        &self.published
    }

    pub fn displaced(&self) -> &[DisplacedFile] {
        &self.displaced
    }

    /// 删除顺序：从叶到根
    pub fn created_dirs_deepest_first(&self) -> impl Iterator<Item = &String> {
        self.created_dirs.iter().rev()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
            && self.published.is_empty()
            && self.displaced.is_empty()
            && self.created_dirs.is_empty()
    }

    pub fn clear(&mut self) {
        self.staged.clear();
        self.published.clear();
        self.displaced.clear();
        self.created_dirs.clear();
    }
}

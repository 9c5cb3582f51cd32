use crate::core::tree::{Decision, FileEntry, FolderEntry};
use serde::Serialize;
use tracing::debug;

/// 规划完成的上传计划
///
/// 每个文件都已设置远程路径与传输决定；之后只有 `status` 会被引擎修改。
#[derive(Debug, Clone)]
pub struct UploadPlan {
    pub root: FolderEntry,
    pub prefix: String,
    pub overwrite: bool,
}

/// 计划统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub upload_count: usize,
    pub overwrite_count: usize,
    pub skip_count: usize,
    pub upload_bytes: u64,
}

impl PlanSummary {
    pub fn transfer_count(&self) -> usize {
        self.upload_count + self.overwrite_count
    }
}

impl UploadPlan {
    /// 按树序（先文件后子目录）返回所有文件
    pub fn files(&self) -> Vec<&FileEntry> {
        self.root.walk_files().into_iter().map(|(_, f)| f).collect()
    }

    pub fn files_mut(&mut self) -> Vec<&mut FileEntry> {
        self.root.walk_files_mut()
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for file in self.files() {
            match file.decision {
                Decision::Upload => {
                    summary.upload_count += 1;
                    summary.upload_bytes += file.size;
                }
                Decision::Overwrite => {
                    summary.overwrite_count += 1;
                    summary.upload_bytes += file.size;
                }
                Decision::Skip => summary.skip_count += 1,
            }
        }
        summary
    }
}

/// 上传规划器：对比本地与远程目录树，为每个本地文件确定去向与动作
#[derive(Debug, Clone)]
pub struct UploadPlanner {
    prefix: String,
    overwrite: bool,
}

impl UploadPlanner {
    pub fn new(remote_prefix: &str, overwrite: bool) -> Self {
        Self {
            prefix: remote_prefix.trim_end_matches('/').to_string(),
            overwrite,
        }
    }

    /// 纯计算，不做任何远程 I/O
    pub fn plan(&self, mut local: FolderEntry, remote: &FolderEntry) -> UploadPlan {
        self.plan_folder(&mut local, Some(remote));
        UploadPlan {
            root: local,
            prefix: self.prefix.clone(),
            overwrite: self.overwrite,
        }
    }

    fn plan_folder(&self, folder: &mut FolderEntry, remote: Option<&FolderEntry>) {
        for file in folder.files.values_mut() {
            // 已规划过的文件不再处理
            if file.remote_path().is_some() {
                continue;
            }
            file.assign_remote_path(format!(
                "{}{}/{}",
                self.prefix, folder.relative_path, file.name
            ));

            let exists_remotely = remote.is_some_and(|r| r.files.contains_key(&file.name));
            file.decision = match (exists_remotely, self.overwrite) {
                (true, false) => Decision::Skip,
                (true, true) => Decision::Overwrite,
                (false, _) => Decision::Upload,
            };
            debug!("规划: {:?} {}", file.decision, file.remote_path().unwrap_or_default());
        }

        for (name, child) in folder.folders.iter_mut() {
            let remote_child = remote.and_then(|r| r.folders.get(name));
            self.plan_folder(child, remote_child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn local_tree() -> FolderEntry {
        let mut root = FolderEntry::root();
        root.insert_file(FileEntry::local("a.txt", PathBuf::from("in/a.txt"), 1));
        root.child_mut("sub")
            .insert_file(FileEntry::local("b.txt", PathBuf::from("in/sub/b.txt"), 2));
        root
    }

    fn remote_with_b() -> FolderEntry {
        let mut root = FolderEntry::root();
        root.child_mut("sub")
            .insert_file(FileEntry::remote("b.txt", "out/sub/b.txt".into(), 2));
        root
    }

    #[test]
    fn test_empty_remote_uploads_everything() {
        let plan = UploadPlanner::new("out", false).plan(local_tree(), &FolderEntry::root());
        let files = plan.files();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.decision == Decision::Upload));
        assert_eq!(files[0].remote_path(), Some("out/a.txt"));
        assert_eq!(files[1].remote_path(), Some("out/sub/b.txt"));
        assert_eq!(plan.summary().upload_bytes, 3);
    }

    #[test]
    fn test_existing_remote_is_skipped_without_overwrite() {
        let plan = UploadPlanner::new("out/", false).plan(local_tree(), &remote_with_b());
        let summary = plan.summary();
        assert_eq!(summary.upload_count, 1);
        assert_eq!(summary.skip_count, 1);
        let b = &plan.root.find_folder("/sub").unwrap().files["b.txt"];
        assert_eq!(b.decision, Decision::Skip);
    }

    #[test]
    fn test_existing_remote_is_overwritten_with_overwrite() {
        let plan = UploadPlanner::new("out", true).plan(local_tree(), &remote_with_b());
        let b = &plan.root.find_folder("/sub").unwrap().files["b.txt"];
        assert_eq!(b.decision, Decision::Overwrite);
        assert_eq!(plan.summary().overwrite_count, 1);
        assert_eq!(plan.summary().transfer_count(), 2);
    }

    #[test]
    fn test_empty_prefix_paths() {
        let plan = UploadPlanner::new("", false).plan(local_tree(), &FolderEntry::root());
        let paths: Vec<_> = plan.files().iter().map(|f| f.remote_path().unwrap().to_string()).collect();
        assert_eq!(paths, vec!["/a.txt", "/sub/b.txt"]);
    }

    #[test]
    fn test_already_planned_entries_are_untouched() {
        let mut local = local_tree();
        local
            .files
            .get_mut("a.txt")
            .unwrap()
            .assign_remote_path("elsewhere/a.txt".into());
        let plan = UploadPlanner::new("out", false).plan(local, &FolderEntry::root());
        assert_eq!(plan.root.files["a.txt"].remote_path(), Some("elsewhere/a.txt"));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let first = UploadPlanner::new("out", true).plan(local_tree(), &remote_with_b());
        let second = UploadPlanner::new("out", true).plan(local_tree(), &remote_with_b());
        let a: Vec<_> = first.files().iter().map(|f| (f.remote_path().map(String::from), f.decision)).collect();
        let b: Vec<_> = second.files().iter().map(|f| (f.remote_path().map(String::from), f.decision)).collect();
        assert_eq!(a, b);
    }
}

pub mod chunked;
pub mod cleaner;
pub mod engine;
pub mod planner;
pub mod retry;
pub mod scanner;
pub mod staging;
pub mod tree;

pub use chunked::{split_ranges, ChunkRange, ChunkReport, ChunkedTransfer};
pub use cleaner::{ArtifactCleaner, CleanupReport};
pub use engine::{EngineConfig, Phase, StagedUploadEngine, SyncReport};
pub use planner::{PlanSummary, UploadPlan, UploadPlanner};
pub use retry::{acquire_with_retry, ExponentialBackoff};
pub use scanner::{build_local, build_remote};
pub use staging::{StagingRecord, BACKUP_SUFFIX, STAGING_DIR_MARKER, TEMP_SUFFIX};
pub use tree::{Decision, FileEntry, FileStatus, FolderEntry};

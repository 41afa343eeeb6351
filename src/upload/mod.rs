//! Resumable segmented upload engine

pub mod manifest;
pub mod planner;
pub mod pool;
pub mod recovery;
pub mod segment;
pub mod session;

pub use manifest::{CommitPolicy, ManifestEntry, SegmentManifest};
pub use planner::{plan, PlanRequest, PlanWarning, SegmentPlan};
pub use pool::{NoopObserver, PoolReport, ProgressObserver, UploadJob, WorkerPool};
pub use recovery::{resume_point, session_matches, RecoveryLog, RecoveryRecord};
pub use segment::Segment;
pub use session::{ResumeState, SessionOptions, UploadReport, UploadSession};

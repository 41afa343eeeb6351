//! SLO Uploader - resumable segmented uploads to OpenStack Swift
//!
//! This crate uploads one large local file as a Static Large Object:
//! - Segmentation planning within the storage segment limit
//! - Bounded concurrent segment upload with a disk budget
//! - Crash-durable recovery log for resuming interrupted runs
//! - Manifest assembly and commit

pub mod error;
pub mod metrics;
pub mod prompt;
pub mod storage;
pub mod upload;

pub use error::{Result, SloError};
pub use upload::{SessionOptions, UploadSession};

/// One megabyte as used for segment sizes
pub const MEGABYTE: u64 = 1024 * 1024;

/// Maximum segments the storage service accepts in one manifest
pub const SEGMENT_LIMIT: u32 = 1000;

/// Default segment size in MB
pub const DEFAULT_SEGMENT_SIZE_MB: u64 = 1;

/// Default number of concurrent segment workers
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default number of manifest commit attempts
pub const DEFAULT_COMMIT_ATTEMPTS: u32 = 9;

/// Name of the scratch directory created under the temp root
pub const TEMP_DIR_NAME: &str = "temp";

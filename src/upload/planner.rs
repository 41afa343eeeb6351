//! Segmentation planning
//!
//! Turns a file size and the requested segment size, concurrency and disk
//! budget into a plan the storage service will accept. Pure and
//! deterministic: a resumed run must derive the same plan as the run it
//! continues.

use std::fmt;
use tracing::warn;

use crate::error::{Result, SloError};
use crate::{MEGABYTE, SEGMENT_LIMIT};

/// Inputs to [`plan`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanRequest {
    /// Source file size in bytes
    pub file_size: u64,
    /// Requested segment size in MB
    pub segment_size_mb: u64,
    /// Requested number of concurrent workers
    pub concurrency: usize,
    /// Local scratch budget in MB; `None` means unbounded
    pub max_disk_space_mb: Option<u64>,
}

/// Adjustment the planner made to the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanWarning {
    /// The requested segment size needed more than [`SEGMENT_LIMIT`] segments
    SegmentSizeRaised { requested_mb: u64, planned_mb: u64 },
    /// Concurrency was lowered to fit the disk budget
    ConcurrencyReduced { requested: usize, planned: usize },
    /// Even one worker exceeds the disk budget
    DiskBudgetTooSmall { budget_mb: u64, required_mb: u64 },
}

impl fmt::Display for PlanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanWarning::SegmentSizeRaised {
                requested_mb,
                planned_mb,
            } => write!(
                f,
                "Unable to use {}MB as segment size due to the {} segment limit, using {}MB",
                requested_mb, SEGMENT_LIMIT, planned_mb
            ),
            PlanWarning::ConcurrencyReduced { requested, planned } => write!(
                f,
                "Unable to use {} concurrent workers within the disk limit, using {}",
                requested, planned
            ),
            PlanWarning::DiskBudgetTooSmall {
                budget_mb,
                required_mb,
            } => write!(
                f,
                "Unable to stay within {}MB of disk space, minimum required is {}MB",
                budget_mb, required_mb
            ),
        }
    }
}

/// How a file is split and how many segments are in flight at once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    pub file_size: u64,
    pub total_segments: u32,
    pub segment_size_mb: u64,
    pub concurrency: usize,
    pub warnings: Vec<PlanWarning>,
}

impl SegmentPlan {
    /// Segment size in bytes
    pub fn segment_bytes(&self) -> u64 {
        self.segment_size_mb.saturating_mul(MEGABYTE)
    }

    /// Byte offset of a 1-based segment
    pub fn segment_offset(&self, sequence: u32) -> u64 {
        u64::from(sequence.saturating_sub(1)).saturating_mul(self.segment_bytes())
    }

    /// Byte length of a 1-based segment; the last one may be short
    pub fn segment_len(&self, sequence: u32) -> u64 {
        if sequence == 0 || sequence > self.total_segments {
            return 0;
        }
        let offset = self.segment_offset(sequence);
        self.segment_bytes().min(self.file_size - offset)
    }

    /// Upper bound on local scratch space in bytes
    pub fn scratch_bound(&self) -> u64 {
        (self.concurrency as u64).saturating_mul(self.segment_bytes())
    }
}

fn segment_count(file_size: u64, segment_bytes: u64) -> u64 {
    file_size.div_ceil(segment_bytes)
}

/// Compute a valid segment layout and concurrency level
pub fn plan(request: PlanRequest) -> Result<SegmentPlan> {
    if request.segment_size_mb == 0 {
        return Err(SloError::InvalidConfig {
            reason: "segment size must be at least 1MB".into(),
        });
    }
    if request.concurrency == 0 {
        return Err(SloError::InvalidConfig {
            reason: "concurrency must be at least 1".into(),
        });
    }

    let segment_bytes = request.segment_size_mb.checked_mul(MEGABYTE).ok_or_else(|| {
        SloError::InvalidConfig {
            reason: format!("segment size of {}MB is too large", request.segment_size_mb),
        }
    })?;

    let mut warnings = Vec::new();
    let mut segment_size_mb = request.segment_size_mb;
    let mut total = segment_count(request.file_size, segment_bytes);

    if total > u64::from(SEGMENT_LIMIT) {
        let min_segment_bytes = request.file_size.div_ceil(u64::from(SEGMENT_LIMIT));
        segment_size_mb = min_segment_bytes.div_ceil(MEGABYTE);
        total = segment_count(request.file_size, segment_size_mb * MEGABYTE);

        if total > u64::from(SEGMENT_LIMIT) {
            return Err(SloError::InvalidConfig {
                reason: format!(
                    "cannot split {} bytes into at most {} segments",
                    request.file_size, SEGMENT_LIMIT
                ),
            });
        }

        let warning = PlanWarning::SegmentSizeRaised {
            requested_mb: request.segment_size_mb,
            planned_mb: segment_size_mb,
        };
        warn!("{}", warning);
        warnings.push(warning);
    }

    let mut concurrency = request.concurrency;
    if let Some(budget_mb) = request.max_disk_space_mb.filter(|&mb| mb > 0) {
        if (concurrency as u64).saturating_mul(segment_size_mb) > budget_mb {
            let fitted = (budget_mb / segment_size_mb) as usize;
            if fitted < 1 {
                concurrency = 1;
                let warning = PlanWarning::DiskBudgetTooSmall {
                    budget_mb,
                    required_mb: segment_size_mb,
                };
                warn!("{}", warning);
                warnings.push(warning);
            } else {
                concurrency = fitted;
                let warning = PlanWarning::ConcurrencyReduced {
                    requested: request.concurrency,
                    planned: fitted,
                };
                warn!("{}", warning);
                warnings.push(warning);
            }
        }
    }

    Ok(SegmentPlan {
        file_size: request.file_size,
        total_segments: total as u32,
        segment_size_mb,
        concurrency,
        warnings,
    })
}

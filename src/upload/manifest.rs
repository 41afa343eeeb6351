//! Manifest assembly and commit
//!
//! The manifest is the commit marker: until it is stored, the segments are
//! just loose objects and the run can be resumed.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

use super::recovery::RecoveryRecord;
use crate::error::{Result, SloError};
use crate::storage::ObjectStore;

/// One segment reference in a static large object manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// `<segments container>/<destination>`
    pub path: String,
    /// MD5 hex of the segment content
    pub etag: String,
    /// Segment length in bytes
    pub size_bytes: u64,
}

/// Ordered, gap-free manifest covering every planned segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentManifest {
    entries: Vec<ManifestEntry>,
}

impl SegmentManifest {
    /// Build the manifest from log records in any arrival order
    ///
    /// Records are ordered by sequence, never by arrival. A sequence logged
    /// twice keeps its latest record. Every sequence in `1..=total` must be
    /// present exactly once in the result.
    pub fn assemble<I>(records: I, total: u32, segments_container: &str) -> Result<Self>
    where
        I: IntoIterator<Item = RecoveryRecord>,
    {
        let mut records: Vec<(usize, RecoveryRecord)> = records.into_iter().enumerate().collect();
        // Stable on arrival so the latest duplicate ends up last
        records.sort_by_key(|(arrival, record)| (record.sequence, *arrival));

        let mut ordered: Vec<RecoveryRecord> = Vec::with_capacity(records.len());
        for (_, record) in records {
            match ordered.last_mut() {
                Some(prev) if prev.sequence == record.sequence => {
                    warn!("Segment {} logged more than once, using latest", record.sequence);
                    *prev = record;
                }
                _ => ordered.push(record),
            }
        }

        if ordered.len() != total as usize {
            return Err(SloError::ManifestInvalid {
                reason: format!(
                    "{} of {} segments logged, missing {:?}",
                    ordered.len(),
                    total,
                    missing(&ordered, total)
                ),
            });
        }
        for (expected, record) in (1..=total).zip(&ordered) {
            if record.sequence != expected {
                return Err(SloError::ManifestInvalid {
                    reason: format!(
                        "segment {} is not part of a {} segment upload",
                        record.sequence, total
                    ),
                });
            }
        }

        let entries = ordered
            .into_iter()
            .map(|record| ManifestEntry {
                path: format!("{}/{}", segments_container, record.destination),
                etag: record.checksum,
                size_bytes: record.size,
            })
            .collect();

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes described by the manifest
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    /// Serialize to the JSON array the storage service expects
    pub fn to_json(&self) -> Result<Bytes> {
        serde_json::to_vec(&self.entries)
            .map(Bytes::from)
            .map_err(|e| SloError::ManifestInvalid {
                reason: format!("Serialization failed: {}", e),
            })
    }
}

fn missing(ordered: &[RecoveryRecord], total: u32) -> Vec<u32> {
    (1..=total)
        .filter(|seq| ordered.binary_search_by_key(seq, |r| r.sequence).is_err())
        .collect()
}

/// Retry schedule for the manifest commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self {
            attempts: crate::DEFAULT_COMMIT_ATTEMPTS,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl CommitPolicy {
    /// Delay after failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Store the manifest as `<container>/<object_name>`
///
/// Returns the ETag of the assembled object.
pub async fn commit(
    store: &dyn ObjectStore,
    container: &str,
    object_name: &str,
    manifest: &SegmentManifest,
    policy: CommitPolicy,
) -> Result<String> {
    if manifest.is_empty() {
        return Err(SloError::ManifestInvalid {
            reason: format!("no segments to commit for {}", object_name),
        });
    }
    let body = manifest.to_json()?;
    let attempts = policy.attempts.max(1);

    let mut attempt = 1;
    loop {
        match store.put_manifest(container, object_name, body.clone()).await {
            Ok(etag) => {
                info!(
                    "Committed {}/{} from {} segments",
                    container,
                    object_name,
                    manifest.len()
                );
                return Ok(etag);
            }
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    "Manifest commit attempt {}/{} failed: {}, retrying in {:?}",
                    attempt, attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(SloError::CommitFailed {
                    attempts: attempt,
                    message: e.to_string(),
                })
            }
        }
    }
}

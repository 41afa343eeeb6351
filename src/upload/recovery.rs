//! Recovery log
//!
//! Append-only text file with one line per segment that reached storage:
//!
//! ```text
//! <sequence>:<destination>:<md5 hex>:<bytes>
//! ```
//!
//! Lines arrive in completion order, not sequence order. The log is the
//! only state a resumed run trusts; nothing is carried over in memory.

use std::collections::BTreeSet;
use std::fs;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::planner::SegmentPlan;
use super::segment::{segment_name, SEGMENTS_SUFFIX};
use crate::error::{Result, SloError};

/// File name of the log inside the temp directory
pub const LOG_FILE_NAME: &str = "upload_cache";

const DELIMITER: char = ':';

/// One completed segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRecord {
    pub sequence: u32,
    pub destination: String,
    pub checksum: String,
    pub size: u64,
}

impl RecoveryRecord {
    /// Serialize as a single newline-terminated line
    pub fn to_line(&self) -> String {
        format!(
            "{}{d}{}{d}{}{d}{}\n",
            segment_name(self.sequence),
            self.destination,
            self.checksum,
            self.size,
            d = DELIMITER
        )
    }

    /// Parse one line (without its newline)
    ///
    /// The destination may itself contain the delimiter, so the sequence is
    /// taken from the left and the checksum and size from the right.
    pub fn parse(line: &str) -> Option<Self> {
        let (sequence, rest) = line.split_once(DELIMITER)?;
        let (rest, size) = rest.rsplit_once(DELIMITER)?;
        let (destination, checksum) = rest.rsplit_once(DELIMITER)?;

        if sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let sequence: u32 = sequence.parse().ok().filter(|&s| s > 0)?;
        let size: u64 = size.parse().ok()?;

        let is_digest = checksum.len() == 32
            && checksum
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !is_digest || destination.is_empty() {
            return None;
        }

        Some(Self {
            sequence,
            destination: destination.to_string(),
            checksum: checksum.to_string(),
            size,
        })
    }

    /// Object name encoded in the destination (`<name>_segments/<seq>`)
    pub fn object_name(&self) -> Option<&str> {
        let (prefix, _) = self.destination.rsplit_once('/')?;
        prefix.strip_suffix(SEGMENTS_SUFFIX)
    }
}

/// Lazy iterator over the records of a log
///
/// A malformed line yields [`SloError::LogCorruption`].
pub struct RecordIter {
    lines: Option<Lines<BufReader<fs::File>>>,
    line: usize,
    path: PathBuf,
}

impl Iterator for RecordIter {
    type Item = Result<RecoveryRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = match self.lines.as_mut()?.next()? {
            Ok(line) => line,
            Err(source) => {
                self.lines = None;
                return Some(Err(SloError::RecoveryLogIo {
                    path: self.path.clone(),
                    source,
                }));
            }
        };
        self.line += 1;

        Some(RecoveryRecord::parse(&line).ok_or_else(|| SloError::LogCorruption {
            line: self.line,
            content: line,
        }))
    }
}

/// Durable record of completed segments, shared by all workers
pub struct RecoveryLog {
    path: PathBuf,
    writer: Mutex<Option<File>>,
}

impl RecoveryLog {
    /// Log stored at `path`
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            writer: Mutex::new(None),
        }
    }

    /// Log stored in `temp_dir` under [`LOG_FILE_NAME`]
    pub fn in_dir(temp_dir: &Path) -> Self {
        Self::new(temp_dir.join(LOG_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a log from an earlier run is present
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Append one record
    ///
    /// The whole line is written and synced while holding the lock, so
    /// concurrent appenders never interleave and a record is either fully
    /// present or absent.
    pub async fn append(&self, record: &RecoveryRecord) -> Result<()> {
        let io_err = |source: std::io::Error| SloError::RecoveryLogIo {
            path: self.path.clone(),
            source,
        };
        let line = record.to_line();

        let mut writer = self.writer.lock().await;
        if writer.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(io_err)?;
            *writer = Some(file);
        }
        if let Some(file) = writer.as_mut() {
            file.write_all(line.as_bytes()).await.map_err(io_err)?;
            file.sync_data().await.map_err(io_err)?;
        }

        debug!("Logged segment {}", record.sequence);
        Ok(())
    }

    /// Start a fresh pass over the log; a missing log yields nothing
    pub fn scan(&self) -> Result<RecordIter> {
        let lines = match fs::File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file).lines()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(SloError::RecoveryLogIo {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        Ok(RecordIter {
            lines,
            line: 0,
            path: self.path.clone(),
        })
    }

    /// Whether the log holds anything; an earlier run made progress
    pub fn has_records(&self) -> bool {
        fs::metadata(&self.path).is_ok_and(|meta| meta.len() > 0)
    }

    /// All records, failing on the first malformed line
    pub fn records(&self) -> Result<Vec<RecoveryRecord>> {
        self.scan()?.collect()
    }

    /// [`records`](Self::records) on the blocking pool, for async callers
    pub async fn load(&self) -> Result<Vec<RecoveryRecord>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || RecoveryLog::new(path).records())
            .await
            .map_err(|e| SloError::Internal {
                message: format!("recovery log reader failed: {}", e),
            })?
    }

    /// First sequence not yet logged contiguously from 1
    pub fn resume_point(&self) -> Result<u32> {
        let mut sequences = Vec::new();
        for record in self.scan()? {
            sequences.push(record?.sequence);
        }
        Ok(resume_point(sequences))
    }

    /// Delete the log file
    pub async fn remove(&self) -> Result<()> {
        *self.writer.lock().await = None;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SloError::RecoveryLogIo {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

/// First sequence number not present contiguously from 1
///
/// Empty input gives 1; `1..=n` gives `n + 1`.
pub fn resume_point<I>(sequences: I) -> u32
where
    I: IntoIterator<Item = u32>,
{
    let distinct: BTreeSet<u32> = sequences.into_iter().collect();
    let mut next = 1;
    for sequence in distinct {
        if sequence == next {
            next += 1;
        } else if sequence > next {
            break;
        }
    }
    next
}

/// Check that logged records belong to this file and segment layout
pub fn check_session(
    records: &[RecoveryRecord],
    object_name: &str,
    plan: &SegmentPlan,
) -> Result<()> {
    for record in records {
        let logged_name = record.object_name().unwrap_or_default();
        if logged_name != object_name {
            return Err(SloError::SessionMismatch {
                reason: format!(
                    "log is for {:?}, current file is {:?}",
                    logged_name, object_name
                ),
            });
        }
        if record.sequence > plan.total_segments {
            return Err(SloError::SessionMismatch {
                reason: format!(
                    "segment {} is beyond the planned {} segments",
                    record.sequence, plan.total_segments
                ),
            });
        }
        let expected = plan.segment_len(record.sequence);
        if record.size != expected {
            return Err(SloError::SessionMismatch {
                reason: format!(
                    "segment {} was {} bytes, {}MB segments give {} bytes",
                    record.sequence, record.size, plan.segment_size_mb, expected
                ),
            });
        }
    }
    Ok(())
}

/// Whether logged records belong to this file and segment layout
pub fn session_matches(
    records: &[RecoveryRecord],
    object_name: &str,
    plan: &SegmentPlan,
) -> bool {
    check_session(records, object_name, plan).is_ok()
}

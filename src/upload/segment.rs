//! Segment model
//!
//! A segment is a byte range of the source file, staged in a local scratch
//! file before upload and removed once it is recorded in the recovery log.

use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::planner::SegmentPlan;
use crate::error::{Result, SloError};

/// Suffix of the pseudo-folder (and container) holding segments
pub const SEGMENTS_SUFFIX: &str = "_segments";

/// Zero-padded segment name, e.g. `0007`
pub fn segment_name(sequence: u32) -> String {
    format!("{:04}", sequence)
}

/// Storage object name for a source file (its final path component)
pub fn object_name(source: &Path) -> Result<String> {
    source
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| SloError::InvalidConfig {
            reason: format!("{} has no usable file name", source.display()),
        })
}

/// Segment path inside the segments container, e.g. `big.iso_segments/0007`
pub fn destination_path(object_name: &str, sequence: u32) -> String {
    format!("{}{}/{}", object_name, SEGMENTS_SUFFIX, segment_name(sequence))
}

/// Lowercase hex MD5 digest
pub fn checksum(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// One planned segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub sequence: u32,
    pub offset: u64,
    pub len: u64,
    pub temp_path: PathBuf,
    pub destination: String,
}

impl Segment {
    /// Describe segment `sequence` of `plan`
    pub fn new(plan: &SegmentPlan, sequence: u32, object_name: &str, temp_dir: &Path) -> Self {
        Self {
            sequence,
            offset: plan.segment_offset(sequence),
            len: plan.segment_len(sequence),
            temp_path: temp_dir.join(segment_name(sequence)),
            destination: destination_path(object_name, sequence),
        }
    }

    /// Copy this segment's byte range of `source` into its scratch file
    pub async fn materialize(&self, source: &Path) -> Result<()> {
        let io_err = |source: std::io::Error| SloError::SegmentIo {
            sequence: self.sequence,
            source,
        };

        let mut input = File::open(source).await.map_err(io_err)?;
        input
            .seek(SeekFrom::Start(self.offset))
            .await
            .map_err(io_err)?;

        let mut output = File::create(&self.temp_path).await.map_err(io_err)?;
        let copied = tokio::io::copy(&mut input.take(self.len), &mut output)
            .await
            .map_err(io_err)?;
        if copied != self.len {
            return Err(io_err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read {} of {} bytes at offset {}", copied, self.len, self.offset),
            )));
        }

        output.flush().await.map_err(io_err)?;
        Ok(())
    }

    /// Load the scratch file for upload
    pub async fn read(&self) -> Result<Bytes> {
        tokio::fs::read(&self.temp_path)
            .await
            .map(Bytes::from)
            .map_err(|source| SloError::SegmentIo {
                sequence: self.sequence,
                source,
            })
    }

    /// Remove the scratch file; a file that is already gone is fine
    pub async fn purge(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.temp_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SloError::SegmentIo {
                sequence: self.sequence,
                source,
            }),
        }
    }
}

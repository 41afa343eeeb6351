//! Upload session orchestration
//!
//! Plans the upload, inspects the recovery log left by an earlier run,
//! drives the worker pool and commits the manifest. The temp directory
//! (recovery log plus scratch files) lives exactly as long as the upload
//! is unfinished.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::manifest::{commit, CommitPolicy, SegmentManifest};
use super::planner::{plan, PlanRequest, SegmentPlan};
use super::pool::{PoolReport, ProgressObserver, UploadJob, WorkerPool};
use super::recovery::{check_session, resume_point, RecoveryLog};
use super::segment::{object_name, SEGMENTS_SUFFIX};
use crate::error::{Result, SloError};
use crate::metrics::{MetricsSnapshot, UploadMetrics};
use crate::storage::ObjectStore;
use crate::{DEFAULT_CONCURRENCY, DEFAULT_SEGMENT_SIZE_MB, TEMP_DIR_NAME};

/// Everything a session needs to know about the requested upload
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Local file to upload
    pub source: PathBuf,
    /// Destination container for the assembled object
    pub container: String,
    /// Requested segment size in MB
    pub segment_size_mb: u64,
    /// Requested number of concurrent workers
    pub concurrency: usize,
    /// Local scratch budget in MB; `None` or 0 means unbounded
    pub max_disk_space_mb: Option<u64>,
    /// Directory under which the temp directory is created; defaults to
    /// the current directory
    pub temp_root: Option<PathBuf>,
    /// Manifest commit retry schedule
    pub commit: CommitPolicy,
}

impl SessionOptions {
    pub fn new(source: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            container: container.into(),
            segment_size_mb: DEFAULT_SEGMENT_SIZE_MB,
            concurrency: DEFAULT_CONCURRENCY,
            max_disk_space_mb: None,
            temp_root: None,
            commit: CommitPolicy::default(),
        }
    }
}

/// What the recovery log says about earlier runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeState {
    /// No earlier progress
    Fresh,
    /// An earlier run of this same upload logged `logged` segments
    ///
    /// A `resume_point` past the last segment means only the commit is
    /// left.
    Resumable { resume_point: u32, logged: usize },
    /// The log belongs to a different file or segment size
    Mismatched { reason: String },
}

/// Summary of a committed upload
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub container: String,
    pub object_name: String,
    /// ETag of the assembled object as reported by storage
    pub etag: String,
    pub total_segments: u32,
    /// Segments uploaded by this run
    pub uploaded: usize,
    /// Segments an earlier run had already uploaded
    pub reused: usize,
    pub total_bytes: u64,
    pub metrics: MetricsSnapshot,
}

impl fmt::Display for UploadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}: {} bytes in {} segments ({} uploaded, {} reused)",
            self.container,
            self.object_name,
            self.total_bytes,
            self.total_segments,
            self.uploaded,
            self.reused
        )
    }
}

/// One upload of one file, possibly continuing an earlier run
pub struct UploadSession {
    options: SessionOptions,
    plan: SegmentPlan,
    object_name: String,
    temp_dir: PathBuf,
    log: Arc<RecoveryLog>,
    resume: ResumeState,
    metrics: Arc<UploadMetrics>,
}

impl UploadSession {
    /// Validate the options, plan the upload and inspect earlier progress
    ///
    /// Creates nothing on disk.
    pub fn prepare(options: SessionOptions) -> Result<Self> {
        if options.container.is_empty() {
            return Err(SloError::InvalidConfig {
                reason: "container name is empty".into(),
            });
        }

        let metadata =
            std::fs::metadata(&options.source).map_err(|source| SloError::SourceUnavailable {
                path: options.source.clone(),
                source,
            })?;
        if !metadata.is_file() {
            return Err(SloError::InvalidConfig {
                reason: format!("{} is not a regular file", options.source.display()),
            });
        }
        if metadata.len() == 0 {
            return Err(SloError::InvalidConfig {
                reason: format!("{} is empty", options.source.display()),
            });
        }

        let object_name = object_name(&options.source)?;
        let plan = plan(PlanRequest {
            file_size: metadata.len(),
            segment_size_mb: options.segment_size_mb,
            concurrency: options.concurrency,
            max_disk_space_mb: options.max_disk_space_mb,
        })?;

        let temp_root = match &options.temp_root {
            Some(root) => root.clone(),
            None => std::env::current_dir().map_err(|e| SloError::InvalidConfig {
                reason: format!("cannot determine current directory: {}", e),
            })?,
        };
        let temp_dir = temp_root.join(TEMP_DIR_NAME);
        let log = Arc::new(RecoveryLog::in_dir(&temp_dir));
        let resume = inspect(&log, &object_name, &plan)?;

        info!(
            "Planned {} ({} bytes) as {} x {}MB segments, {} workers, {:?}",
            object_name,
            plan.file_size,
            plan.total_segments,
            plan.segment_size_mb,
            plan.concurrency,
            resume
        );

        Ok(Self {
            options,
            plan,
            object_name,
            temp_dir,
            log,
            resume,
            metrics: Arc::new(UploadMetrics::new()),
        })
    }

    pub fn plan(&self) -> &SegmentPlan {
        &self.plan
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    pub fn container(&self) -> &str {
        &self.options.container
    }

    /// Container holding the individual segments
    pub fn segments_container(&self) -> String {
        format!("{}{}", self.options.container, SEGMENTS_SUFFIX)
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn recovery_log(&self) -> &RecoveryLog {
        &self.log
    }

    pub fn resume_state(&self) -> &ResumeState {
        &self.resume
    }

    pub fn metrics(&self) -> &Arc<UploadMetrics> {
        &self.metrics
    }

    /// Whether the recovery log holds uploaded segments a rerun would reuse
    pub fn has_progress(&self) -> bool {
        self.log.has_records()
    }

    /// Share of segments already logged, in percent
    pub fn percent_complete(&self) -> u32 {
        match &self.resume {
            ResumeState::Resumable { logged, .. } if self.plan.total_segments > 0 => {
                (*logged as u64 * 100 / u64::from(self.plan.total_segments)) as u32
            }
            _ => 0,
        }
    }

    /// Forget earlier progress and start again from segment 1
    pub async fn discard_progress(&mut self) -> Result<()> {
        warn!("Discarding earlier progress in {}", self.temp_dir.display());
        self.log.remove().await?;
        remove_temp_dir(&self.temp_dir).await?;
        self.resume = ResumeState::Fresh;
        Ok(())
    }

    /// Upload every missing segment, then commit the manifest
    pub async fn run(
        &self,
        store: Arc<dyn ObjectStore>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<UploadReport> {
        let pool = self.upload_segments(store.clone(), observer).await?;
        if !pool.is_complete() {
            return Err(SloError::IncompleteUpload {
                failed: pool.failed_sequences(),
                total: self.plan.total_segments,
            });
        }

        let uploaded = pool.completed.len();
        self.commit(store.as_ref(), uploaded).await
    }

    /// Upload the segments not yet in the recovery log
    pub async fn upload_segments(
        &self,
        store: Arc<dyn ObjectStore>,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<PoolReport> {
        if let ResumeState::Mismatched { reason } = &self.resume {
            return Err(SloError::SessionMismatch {
                reason: reason.clone(),
            });
        }

        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|source| SloError::RecoveryLogIo {
                path: self.temp_dir.clone(),
                source,
            })?;

        // Read again: the log is the only source of truth
        let records = self.log.load().await?;
        check_session(&records, &self.object_name, &self.plan)?;
        let logged: HashSet<u32> = records.iter().map(|r| r.sequence).collect();
        let start = resume_point(logged.iter().copied());

        if start > self.plan.total_segments {
            info!("All {} segments already uploaded", self.plan.total_segments);
            return Ok(PoolReport {
                skipped: logged.len(),
                ..Default::default()
            });
        }

        let segments_container = self.segments_container();
        store.create_container(&segments_container).await?;

        let pool = WorkerPool::new(
            store,
            self.log.clone(),
            UploadJob {
                source: self.options.source.clone(),
                object_name: self.object_name.clone(),
                segments_container,
                temp_dir: self.temp_dir.clone(),
            },
            self.plan.concurrency,
        )
        .with_observer(observer)
        .with_metrics(self.metrics.clone());

        let mut report = pool.run(&self.plan, start, &logged).await?;
        // Logged sequences below the resume point were never visited
        report.skipped = logged.len();
        Ok(report)
    }

    /// Assemble the manifest from the log and store it
    ///
    /// On success the temp directory is removed. On failure everything is
    /// kept so the commit can be repeated.
    pub async fn commit(&self, store: &dyn ObjectStore, uploaded: usize) -> Result<UploadReport> {
        let records = self.log.load().await?;
        let logged = records.len();
        let segments_container = self.segments_container();
        let manifest =
            SegmentManifest::assemble(records, self.plan.total_segments, &segments_container)?;

        let etag = commit(
            store,
            &self.options.container,
            &self.object_name,
            &manifest,
            self.options.commit,
        )
        .await?;

        // The object is committed; leftovers only cost disk space
        if let Err(e) = self.log.remove().await {
            warn!("Upload committed but recovery log remains: {}", e);
        }
        if let Err(e) = remove_temp_dir(&self.temp_dir).await {
            warn!("Upload committed but temp directory remains: {}", e);
        }

        Ok(UploadReport {
            container: self.options.container.clone(),
            object_name: self.object_name.clone(),
            etag,
            total_segments: self.plan.total_segments,
            uploaded,
            reused: logged.saturating_sub(uploaded),
            total_bytes: manifest.total_bytes(),
            metrics: self.metrics.snapshot(),
        })
    }
}

fn inspect(log: &RecoveryLog, object_name: &str, plan: &SegmentPlan) -> Result<ResumeState> {
    let records = log.records()?;
    if records.is_empty() {
        return Ok(ResumeState::Fresh);
    }

    match check_session(&records, object_name, plan) {
        Ok(()) => {
            let logged: HashSet<u32> = records.iter().map(|r| r.sequence).collect();
            Ok(ResumeState::Resumable {
                resume_point: resume_point(logged.iter().copied()),
                logged: logged.len(),
            })
        }
        Err(SloError::SessionMismatch { reason }) => {
            warn!("Recovery log does not match this upload: {}", reason);
            Ok(ResumeState::Mismatched { reason })
        }
        Err(e) => Err(e),
    }
}

async fn remove_temp_dir(temp_dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(temp_dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SloError::RecoveryLogIo {
            path: temp_dir.to_path_buf(),
            source,
        }),
    }
}

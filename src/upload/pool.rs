//! Bounded segment worker pool
//!
//! At most `concurrency` segments are in flight. Each worker owns its
//! segment from materialize through purge; the recovery log is the only
//! state the workers share.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::planner::SegmentPlan;
use super::recovery::{RecoveryLog, RecoveryRecord};
use super::segment::{checksum, Segment};
use crate::error::{Result, SloError};
use crate::metrics::UploadMetrics;
use crate::storage::ObjectStore;

/// Receives per-segment outcomes as workers finish
pub trait ProgressObserver: Send + Sync {
    fn segment_completed(&self, sequence: u32, bytes: u64);

    fn segment_failed(&self, _sequence: u32, _error: &SloError) {}
}

/// Observer that ignores everything
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn segment_completed(&self, _sequence: u32, _bytes: u64) {}
}

/// Immutable description of the upload handed to every worker
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub source: PathBuf,
    pub object_name: String,
    pub segments_container: String,
    pub temp_dir: PathBuf,
}

/// Outcome of one pool run
#[derive(Debug, Default)]
pub struct PoolReport {
    /// Sequences uploaded and logged during this run
    pub completed: Vec<u32>,
    /// Sequences left unlogged, with the reason
    pub failed: Vec<(u32, SloError)>,
    /// Sequences skipped because an earlier run already logged them
    pub skipped: usize,
}

impl PoolReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_sequences(&self) -> Vec<u32> {
        self.failed.iter().map(|(seq, _)| *seq).collect()
    }
}

/// Scheduler for segment workers
pub struct WorkerPool {
    store: Arc<dyn ObjectStore>,
    log: Arc<RecoveryLog>,
    job: Arc<UploadJob>,
    semaphore: Arc<Semaphore>,
    metrics: Arc<UploadMetrics>,
    observer: Arc<dyn ProgressObserver>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        log: Arc<RecoveryLog>,
        job: UploadJob,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            log,
            job: Arc::new(job),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            metrics: Arc::new(UploadMetrics::new()),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<UploadMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<UploadMetrics> {
        &self.metrics
    }

    /// Upload segments `start..=plan.total_segments`, skipping `logged`
    ///
    /// Blocks for a free slot before launching each segment and waits for
    /// every launched worker before returning. Segment failures are
    /// collected in the report; they never stop other segments.
    pub async fn run(
        &self,
        plan: &SegmentPlan,
        start: u32,
        logged: &HashSet<u32>,
    ) -> Result<PoolReport> {
        let mut report = PoolReport::default();
        let mut handles: Vec<(u32, JoinHandle<Result<u64>>)> = Vec::new();

        info!(
            "Uploading segments {}..={} with {} workers",
            start, plan.total_segments, plan.concurrency
        );

        for sequence in start.max(1)..=plan.total_segments {
            if logged.contains(&sequence) {
                debug!("Segment {} already logged, skipping", sequence);
                report.skipped += 1;
                continue;
            }

            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| SloError::Internal {
                    message: format!("worker slots closed: {}", e),
                })?;

            let segment = Segment::new(plan, sequence, &self.job.object_name, &self.job.temp_dir);
            let worker = SegmentWorker {
                store: self.store.clone(),
                log: self.log.clone(),
                job: self.job.clone(),
                metrics: self.metrics.clone(),
                observer: self.observer.clone(),
            };
            handles.push((sequence, tokio::spawn(worker.run(segment, permit))));
        }

        for (sequence, handle) in handles {
            match handle.await {
                Ok(Ok(_)) => report.completed.push(sequence),
                Ok(Err(e)) => report.failed.push((sequence, e)),
                Err(e) => {
                    let err = SloError::Internal {
                        message: format!("segment {} worker panicked: {}", sequence, e),
                    };
                    self.metrics.segments_failed.inc();
                    self.observer.segment_failed(sequence, &err);
                    report.failed.push((sequence, err));
                }
            }
        }

        info!(
            "Pool finished: {} uploaded, {} failed, {} skipped",
            report.completed.len(),
            report.failed.len(),
            report.skipped
        );
        Ok(report)
    }
}

/// Marks a worker as active for as long as it is alive
struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
    metrics: Arc<UploadMetrics>,
}

impl WorkerSlot {
    fn enter(permit: OwnedSemaphorePermit, metrics: Arc<UploadMetrics>) -> Self {
        metrics.active_workers.inc();
        Self {
            _permit: permit,
            metrics,
        }
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.metrics.active_workers.dec();
    }
}

struct SegmentWorker {
    store: Arc<dyn ObjectStore>,
    log: Arc<RecoveryLog>,
    job: Arc<UploadJob>,
    metrics: Arc<UploadMetrics>,
    observer: Arc<dyn ProgressObserver>,
}

impl SegmentWorker {
    async fn run(self, segment: Segment, permit: OwnedSemaphorePermit) -> Result<u64> {
        let _slot = WorkerSlot::enter(permit, self.metrics.clone());

        match self.process(&segment).await {
            Ok(bytes) => {
                self.metrics.segments_uploaded.inc();
                self.metrics.bytes_uploaded.inc_by(bytes);
                self.observer.segment_completed(segment.sequence, bytes);
                Ok(bytes)
            }
            Err(e) => {
                error!("Segment {} failed: {}", segment.sequence, e);
                self.metrics.segments_failed.inc();
                self.observer.segment_failed(segment.sequence, &e);
                Err(e)
            }
        }
    }

    async fn process(&self, segment: &Segment) -> Result<u64> {
        let scratch = segment.len as i64;
        self.metrics.scratch_bytes.add(scratch);
        let result = self.upload_and_log(segment).await;
        if result.is_err() {
            // Unlogged segments are rebuilt from the source on resume
            if let Err(e) = segment.purge().await {
                warn!("Scratch file of failed segment {} remains: {}", segment.sequence, e);
            }
        }
        self.metrics.scratch_bytes.sub(scratch);
        result
    }

    async fn upload_and_log(&self, segment: &Segment) -> Result<u64> {
        let record = self.upload(segment).await?;
        self.log.append(&record).await?;

        // Only logged segments lose their scratch file
        if let Err(e) = segment.purge().await {
            warn!("Segment {} uploaded but scratch file remains: {}", segment.sequence, e);
        }
        Ok(record.size)
    }

    async fn upload(&self, segment: &Segment) -> Result<RecoveryRecord> {
        segment.materialize(&self.job.source).await?;
        let data = segment.read().await?;
        let digest = checksum(&data);
        let size = data.len() as u64;

        debug!(
            "Uploading segment {} ({} bytes) to {}/{}",
            segment.sequence, size, self.job.segments_container, segment.destination
        );
        let etag = self
            .store
            .put_object(&self.job.segments_container, &segment.destination, data, &digest)
            .await?;

        if !etag.is_empty() && etag != digest {
            return Err(SloError::ChecksumMismatch {
                path: format!("{}/{}", self.job.segments_container, segment.destination),
                expected: digest,
                actual: etag,
            });
        }

        Ok(RecoveryRecord {
            sequence: segment.sequence,
            destination: segment.destination.clone(),
            checksum: digest,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::planner::{plan, PlanRequest};
    use crate::MEGABYTE;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingStore {
        objects: Mutex<HashMap<String, Bytes>>,
    }

    #[async_trait]
    impl ObjectStore for RecordingStore {
        async fn create_container(&self, _container: &str) -> Result<()> {
            Ok(())
        }

        async fn put_object(
            &self,
            _container: &str,
            path: &str,
            data: Bytes,
            _etag: &str,
        ) -> Result<String> {
            if path.ends_with("0002") {
                return Err(SloError::StorageError {
                    message: "injected".into(),
                });
            }
            let etag = checksum(&data);
            self.objects.lock().insert(path.to_string(), data);
            Ok(etag)
        }

        async fn put_manifest(
            &self,
            _container: &str,
            _path: &str,
            _manifest: Bytes,
        ) -> Result<String> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_unlogged() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("data.bin");
        std::fs::write(&source, vec![7u8; (3 * MEGABYTE) as usize]).unwrap();
        let temp_dir = dir.path().join("temp");
        std::fs::create_dir(&temp_dir).unwrap();

        let plan = plan(PlanRequest {
            file_size: 3 * MEGABYTE,
            segment_size_mb: 1,
            concurrency: 2,
            max_disk_space_mb: None,
        })
        .unwrap();

        let store = Arc::new(RecordingStore::default());
        let log = Arc::new(RecoveryLog::in_dir(&temp_dir));
        let pool = WorkerPool::new(
            store.clone(),
            log.clone(),
            UploadJob {
                source,
                object_name: "data.bin".into(),
                segments_container: "c_segments".into(),
                temp_dir: temp_dir.clone(),
            },
            plan.concurrency,
        );

        let report = pool.run(&plan, 1, &HashSet::new()).await.unwrap();
        let mut completed = report.completed.clone();
        completed.sort();
        assert_eq!(completed, vec![1, 3]);
        assert_eq!(report.failed_sequences(), vec![2]);

        let logged: Vec<u32> = log.records().unwrap().iter().map(|r| r.sequence).collect();
        assert!(!logged.contains(&2));
        assert_eq!(log.resume_point().unwrap(), 2);

        // Scratch files are gone whether the segment made it or not
        assert!(!temp_dir.join("0001").exists());
        assert!(!temp_dir.join("0002").exists());

        let snapshot = pool.metrics().snapshot();
        assert_eq!(snapshot.segments_uploaded, 2);
        assert_eq!(snapshot.segments_failed, 1);
        assert!(snapshot.peak_active_workers <= 2);
        assert_eq!(pool.metrics().active_workers.get(), 0);
    }

    #[tokio::test]
    async fn test_logged_sequences_are_skipped() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("data.bin");
        std::fs::write(&source, vec![1u8; 10]).unwrap();

        let plan = plan(PlanRequest {
            file_size: 10,
            segment_size_mb: 1,
            concurrency: 1,
            max_disk_space_mb: None,
        })
        .unwrap();

        let store = Arc::new(RecordingStore::default());
        let pool = WorkerPool::new(
            store.clone(),
            Arc::new(RecoveryLog::in_dir(dir.path())),
            UploadJob {
                source,
                object_name: "data.bin".into(),
                segments_container: "c_segments".into(),
                temp_dir: dir.path().to_path_buf(),
            },
            1,
        );

        let report = pool.run(&plan, 1, &HashSet::from([1])).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(report.completed.is_empty());
        assert!(store.objects.lock().is_empty());
    }
}

//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use slo_uploader::storage::ObjectStore;
use slo_uploader::upload::segment::checksum;
use slo_uploader::upload::{CommitPolicy, ManifestEntry};
use slo_uploader::{Result, SessionOptions, SloError};

type Hook = Box<dyn Fn() + Send + Sync>;

/// In-memory object store with failure injection
#[derive(Default)]
pub struct MemoryStore {
    containers: Mutex<BTreeSet<String>>,
    objects: Mutex<BTreeMap<String, Bytes>>,
    manifests: Mutex<BTreeMap<String, Bytes>>,
    uploads: Mutex<Vec<String>>,
    failing_paths: Mutex<HashSet<String>>,
    manifest_failures: AtomicU32,
    container_failures: AtomicBool,
    after_manifest: Mutex<Option<Hook>>,
    jitter: bool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay each upload by a sequence-dependent amount so completions
    /// arrive out of order
    pub fn with_jitter() -> Self {
        Self {
            jitter: true,
            ..Self::default()
        }
    }

    /// Fail every upload whose object path ends with `suffix`
    pub fn fail_path(&self, suffix: &str) {
        self.failing_paths.lock().insert(suffix.to_string());
    }

    pub fn heal(&self) {
        self.failing_paths.lock().clear();
        self.container_failures.store(false, Ordering::SeqCst);
    }

    /// Make container creation fail until healed
    pub fn fail_containers(&self) {
        self.container_failures.store(true, Ordering::SeqCst);
    }

    /// Fail the next `count` manifest uploads
    pub fn fail_manifest(&self, count: u32) {
        self.manifest_failures.store(count, Ordering::SeqCst);
    }

    /// Run `hook` once a manifest has been stored
    pub fn after_manifest<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.after_manifest.lock() = Some(Box::new(hook));
    }

    /// Object paths in upload order
    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().clone()
    }

    pub fn object(&self, container: &str, path: &str) -> Option<Bytes> {
        self.objects.lock().get(&format!("{}/{}", container, path)).cloned()
    }

    pub fn has_container(&self, container: &str) -> bool {
        self.containers.lock().contains(container)
    }

    pub fn manifest(&self, container: &str, path: &str) -> Option<Vec<ManifestEntry>> {
        self.manifests
            .lock()
            .get(&format!("{}/{}", container, path))
            .map(|body| serde_json::from_slice(body).unwrap())
    }

    /// Concatenate the segments a manifest refers to
    pub fn assemble(&self, manifest: &[ManifestEntry]) -> Vec<u8> {
        let objects = self.objects.lock();
        manifest
            .iter()
            .flat_map(|entry| objects[&entry.path].to_vec())
            .collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn create_container(&self, container: &str) -> Result<()> {
        if self.container_failures.load(Ordering::SeqCst) {
            return Err(SloError::StorageError {
                message: format!("injected failure creating {}", container),
            });
        }
        self.containers.lock().insert(container.to_string());
        Ok(())
    }

    async fn put_object(
        &self,
        container: &str,
        path: &str,
        data: Bytes,
        etag: &str,
    ) -> Result<String> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if self.jitter {
            let sequence: u64 = path.rsplit('/').next().and_then(|s| s.parse().ok()).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis((sequence * 7) % 13)).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_paths.lock().iter().any(|s| path.ends_with(s.as_str())) {
            return Err(SloError::StorageError {
                message: format!("injected failure for {}", path),
            });
        }
        if !self.containers.lock().contains(container) {
            return Err(SloError::StorageError {
                message: format!("no container {}", container),
            });
        }

        let actual = checksum(&data);
        if actual != etag {
            return Err(SloError::ChecksumMismatch {
                path: path.to_string(),
                expected: etag.to_string(),
                actual,
            });
        }

        self.uploads.lock().push(path.to_string());
        self.objects.lock().insert(format!("{}/{}", container, path), data);
        Ok(actual)
    }

    async fn put_manifest(&self, container: &str, path: &str, manifest: Bytes) -> Result<String> {
        let remaining = self.manifest_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.manifest_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SloError::StorageError {
                message: "injected manifest failure".into(),
            });
        }

        let etag = checksum(&manifest);
        self.manifests.lock().insert(format!("{}/{}", container, path), manifest);
        if let Some(hook) = self.after_manifest.lock().as_ref() {
            hook();
        }
        Ok(etag)
    }
}

/// Deterministic, non-repeating file content
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

/// Write `data` as `name` inside `dir`
pub fn write_source(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

/// Session options rooted in `dir` with fast commit retries
pub fn options(dir: &Path, source: PathBuf, concurrency: usize) -> SessionOptions {
    SessionOptions {
        concurrency,
        temp_root: Some(dir.to_path_buf()),
        commit: CommitPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        ..SessionOptions::new(source, "archive")
    }
}

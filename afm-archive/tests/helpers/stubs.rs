//! Test doubles for the external collaborators

use afm_archive::models::{CalibrationRole, ContentHash};
use afm_archive::services::{CloudStore, DirectoryCloudStore, FrameCombiner};
use afm_archive::ArchiveResult;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Deterministic combiner: the master is the concatenation of its inputs
pub struct StubCombiner {
    quality: Mutex<f64>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl StubCombiner {
    pub fn new(quality: f64) -> Self {
        Self {
            quality: Mutex::new(quality),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_quality(&self, quality: f64) {
        *self.quality.lock().unwrap() = quality;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameCombiner for StubCombiner {
    async fn combine(&self, role: CalibrationRole, inputs: &[PathBuf], output: &Path) -> ArchiveResult<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut combined = format!("MASTER {}\n", role).into_bytes();
        for input in inputs {
            combined.extend(tokio::fs::read(input).await?);
        }
        tokio::fs::write(output, combined).await?;

        // Slow finish, after the output is already on disk
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let quality = *self.quality.lock().unwrap();
        Ok(quality)
    }
}

/// Directory-backed store whose verification can be made to fail or stall
pub struct FlakyCloudStore {
    inner: DirectoryCloudStore,
    mismatches: AtomicUsize,
    verify_delay: Mutex<Option<Duration>>,
    uploads: AtomicUsize,
    verifies: AtomicUsize,
}

impl FlakyCloudStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            inner: DirectoryCloudStore::new(root),
            mismatches: AtomicUsize::new(0),
            verify_delay: Mutex::new(None),
            uploads: AtomicUsize::new(0),
            verifies: AtomicUsize::new(0),
        }
    }

    /// The next `n` verifications report a hash mismatch
    pub fn fail_next_verifications(&self, n: usize) {
        self.mismatches.store(n, Ordering::SeqCst);
    }

    pub fn set_verify_delay(&self, delay: Duration) {
        *self.verify_delay.lock().unwrap() = Some(delay);
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn verifies(&self) -> usize {
        self.verifies.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudStore for FlakyCloudStore {
    async fn upload(&self, local: &Path, hash: &ContentHash) -> ArchiveResult<String> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.inner.upload(local, hash).await
    }

    async fn verify(&self, location: &str, expected: &ContentHash) -> ArchiveResult<bool> {
        self.verifies.fetch_add(1, Ordering::SeqCst);
        let delay = *self.verify_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let forced_mismatch = self
            .mismatches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced_mismatch {
            return Ok(false);
        }
        self.inner.verify(location, expected).await
    }
}

//! External collaborators: cloud storage and frame combination
//!
//! The archive only depends on the traits. `DirectoryCloudStore` mirrors
//! files into a directory (typically a mounted bucket) and `CommandCombiner`
//! delegates stacking to an external program.

use crate::error::{ArchiveError, ArchiveResult};
use crate::models::{CalibrationRole, ContentHash};
use crate::services::hasher;
use afm_common::config::ArchiveConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;

/// Upload and verification contract of a durable remote store
#[async_trait]
pub trait CloudStore: Send + Sync {
    /// Start an upload of `local`; returns the remote location
    async fn upload(&self, local: &Path, hash: &ContentHash) -> ArchiveResult<String>;

    /// True only when the remote copy at `location` hashes to `expected`
    async fn verify(&self, location: &str, expected: &ContentHash) -> ArchiveResult<bool>;
}

/// Cloud store backed by a local or mounted directory
///
/// Objects land at `<root>/<hash>/<file name>`.
pub struct DirectoryCloudStore {
    root: PathBuf,
}

impl DirectoryCloudStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl CloudStore for DirectoryCloudStore {
    async fn upload(&self, local: &Path, hash: &ContentHash) -> ArchiveResult<String> {
        let file_name = local
            .file_name()
            .ok_or_else(|| ArchiveError::InvalidInput(format!("{} has no file name", local.display())))?;
        let dir = self.root.join(hash.as_str());
        tokio::fs::create_dir_all(&dir).await?;

        let remote = dir.join(file_name);
        tokio::fs::copy(local, &remote).await?;

        tracing::debug!(hash = %hash.short(), remote = %remote.display(), "Uploaded to directory store");
        Ok(remote.to_string_lossy().to_string())
    }

    async fn verify(&self, location: &str, expected: &ContentHash) -> ArchiveResult<bool> {
        let remote = Path::new(location);
        if !remote.starts_with(&self.root) {
            return Ok(false);
        }
        match hasher::hash_file(remote).await {
            Ok(actual) => Ok(&actual == expected),
            Err(ArchiveError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Stacking of calibration frames into one master
#[async_trait]
pub trait FrameCombiner: Send + Sync {
    /// Combine `inputs` into `output`; returns the quality score of the result
    async fn combine(&self, role: CalibrationRole, inputs: &[PathBuf], output: &Path) -> ArchiveResult<f64>;
}

/// Runs `<program> <output> <inputs...>` and reads the quality score from the
/// last non-empty line of its standard output
pub struct CommandCombiner {
    program: String,
    args: Vec<String>,
}

impl CommandCombiner {
    /// `command` is split on whitespace; the first word is the program
    pub fn from_command_line(command: &str) -> ArchiveResult<Self> {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| ArchiveError::InvalidInput("combine_command is empty".to_string()))?;
        Ok(Self {
            program,
            args: words.collect(),
        })
    }
}

#[async_trait]
impl FrameCombiner for CommandCombiner {
    async fn combine(&self, role: CalibrationRole, inputs: &[PathBuf], output: &Path) -> ArchiveResult<f64> {
        tracing::info!(
            program = %self.program,
            role = %role,
            inputs = inputs.len(),
            output = %output.display(),
            "Running combine command"
        );

        let result = Command::new(&self.program)
            .args(&self.args)
            .arg(output)
            .args(inputs)
            .env("AFM_MASTER_TYPE", role.as_str())
            .kill_on_drop(true)
            .output()
            .await?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(ArchiveError::Common(afm_common::Error::Internal(format!(
                "{} exited with {}: {}",
                self.program,
                result.status,
                stderr.trim()
            ))));
        }
        if !tokio::fs::try_exists(output).await? {
            return Err(ArchiveError::Common(afm_common::Error::Internal(format!(
                "{} did not write {}",
                self.program,
                output.display()
            ))));
        }

        parse_quality_score(&String::from_utf8_lossy(&result.stdout)).ok_or_else(|| {
            ArchiveError::Common(afm_common::Error::Internal(format!(
                "{} printed no quality score",
                self.program
            )))
        })
    }
}

/// Stand-in for a collaborator the configuration does not provide
///
/// Every call fails with the name of the missing setting.
pub struct Unconfigured {
    setting: &'static str,
}

impl Unconfigured {
    pub fn new(setting: &'static str) -> Self {
        Self { setting }
    }

    fn error(&self) -> ArchiveError {
        ArchiveError::InvalidInput(format!("{} is not set in the configuration", self.setting))
    }
}

#[async_trait]
impl CloudStore for Unconfigured {
    async fn upload(&self, _local: &Path, _hash: &ContentHash) -> ArchiveResult<String> {
        Err(self.error())
    }

    async fn verify(&self, _location: &str, _expected: &ContentHash) -> ArchiveResult<bool> {
        Err(self.error())
    }
}

#[async_trait]
impl FrameCombiner for Unconfigured {
    async fn combine(&self, _role: CalibrationRole, _inputs: &[PathBuf], _output: &Path) -> ArchiveResult<f64> {
        Err(self.error())
    }
}

/// Combiner named by `combine_command`
pub fn combiner_from_config(config: &ArchiveConfig) -> ArchiveResult<Arc<dyn FrameCombiner>> {
    Ok(match config.combine_command.as_deref() {
        Some(command) => Arc::new(CommandCombiner::from_command_line(command)?),
        None => Arc::new(Unconfigured::new("combine_command")),
    })
}

/// Cloud store rooted at `cloud_root`
pub fn cloud_from_config(config: &ArchiveConfig) -> Arc<dyn CloudStore> {
    match &config.cloud_root {
        Some(root) => Arc::new(DirectoryCloudStore::new(root.clone())),
        None => Arc::new(Unconfigured::new("cloud_root")),
    }
}

fn parse_quality_score(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<f64>().ok())
        .filter(|score| score.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quality_score_uses_last_line() {
        assert_eq!(parse_quality_score("stacking 20 frames\nrejected 1\n0.87\n\n"), Some(0.87));
        assert_eq!(parse_quality_score("done\n"), None);
        assert_eq!(parse_quality_score(""), None);
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandCombiner::from_command_line("   ").is_err());
        let combiner = CommandCombiner::from_command_line("siril-stack --median").unwrap();
        assert_eq!(combiner.program, "siril-stack");
        assert_eq!(combiner.args, vec!["--median".to_string()]);
    }

    #[tokio::test]
    async fn test_unconfigured_collaborators_name_the_setting() {
        let config = ArchiveConfig::with_roots("/in", "/repo");
        let cloud = cloud_from_config(&config);
        let err = cloud.upload(Path::new("/in/a.fits"), &ContentHash::of_bytes(b"a")).await.unwrap_err();
        assert!(err.to_string().contains("cloud_root"));

        let combiner = combiner_from_config(&config).unwrap();
        let err = combiner
            .combine(CalibrationRole::Bias, &[], Path::new("/repo/out.fits"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("combine_command"));
    }

    #[tokio::test]
    async fn test_directory_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("dark_001.fits");
        std::fs::write(&local, b"dark frame bytes").unwrap();
        let hash = ContentHash::of_bytes(b"dark frame bytes");

        let store = DirectoryCloudStore::new(dir.path().join("cloud"));
        let location = store.upload(&local, &hash).await.unwrap();

        assert!(store.verify(&location, &hash).await.unwrap());
        assert!(!store.verify(&location, &ContentHash::of_bytes(b"other")).await.unwrap());
    }

    #[tokio::test]
    async fn test_directory_store_missing_object_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryCloudStore::new(dir.path());
        let missing = dir.path().join("nothing/here.fits");
        let hash = ContentHash::of_bytes(b"x");
        assert!(!store.verify(&missing.to_string_lossy(), &hash).await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_combiner_runs_program() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("combine.sh");
        std::fs::write(&script, "#!/bin/sh\nout=\"$1\"\nshift\ncat \"$@\" > \"$out\"\necho 0.75\n").unwrap();

        let a = dir.path().join("a.fits");
        let b = dir.path().join("b.fits");
        std::fs::write(&a, b"A").unwrap();
        std::fs::write(&b, b"B").unwrap();
        let output = dir.path().join("master.fits");

        let combiner = CommandCombiner::from_command_line(&format!("sh {}", script.display())).unwrap();
        let score = combiner
            .combine(CalibrationRole::Dark, &[a, b], &output)
            .await
            .unwrap();

        assert_eq!(score, 0.75);
        assert_eq!(std::fs::read(&output).unwrap(), b"AB");
    }
}

//! Collaborator interfaces of the orchestrator.
//!
//! Everything the workflow needs from the outside world is reached through
//! the traits below so the whole station can run against test doubles.
//! Filesystem-backed implementations are provided for the feature-file
//! locator and the history store; remote coordination, printing, lamp state
//! and the generic programming backends stay external and are only consumed
//! here at their interface boundary.

use crate::broker::CancelToken;
use crate::error::RunError;
use crate::run::ServiceTagRequest;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use regex::RegexBuilder;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Result of one feature-file search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    /// At least one file matched; `matches` carries every matching name so
    /// the caller can detect ambiguous results.
    Found {
        path: PathBuf,
        matches: Vec<String>,
    },
    NotFound,
    /// The search did not finish within its budget. Not an error: the
    /// workflow continues along its documented fallback path.
    TimedOut,
}

/// Locates and reads feature definition files.
#[async_trait]
pub trait FeatureFileLocator: Send + Sync {
    async fn find(&self, dir: &Path, nc12: &str, timeout: Duration) -> Result<SearchOutcome>;

    /// Read a found file. `None` means the read timed out.
    async fn read(&self, path: &Path, timeout: Duration) -> Result<Option<String>>;
}

/// Directory scan matching `<nc12>*.xml` / `<nc12>*.txt`, case-insensitive.
pub struct FsFeatureFileLocator;

#[async_trait]
impl FeatureFileLocator for FsFeatureFileLocator {
    async fn find(&self, dir: &Path, nc12: &str, timeout: Duration) -> Result<SearchOutcome> {
        let pattern = RegexBuilder::new(&format!("{}.*?\\.(xml|txt)$", regex::escape(nc12)))
            .case_insensitive(true)
            .build()
            .context("invalid feature file pattern")?;

        let scan = async {
            let mut entries = tokio::fs::read_dir(dir).await?;
            let mut matches = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if pattern.is_match(&name) {
                    matches.push(name);
                }
            }
            Ok::<Vec<String>, std::io::Error>(matches)
        };

        match tokio::time::timeout(timeout, scan).await {
            Err(_) => Ok(SearchOutcome::TimedOut),
            Ok(Err(err)) => Err(err).context("feature file search failed"),
            Ok(Ok(matches)) if matches.is_empty() => Ok(SearchOutcome::NotFound),
            Ok(Ok(mut matches)) => {
                matches.sort();
                Ok(SearchOutcome::Found {
                    path: dir.join(&matches[0]),
                    matches,
                })
            }
        }
    }

    async fn read(&self, path: &Path, timeout: Duration) -> Result<Option<String>> {
        match tokio::time::timeout(timeout, tokio::fs::read_to_string(path)).await {
            Err(_) => Ok(None),
            Ok(result) => Ok(Some(result.context("feature file read failed")?)),
        }
    }
}

/// Remote production coordinator.
#[async_trait]
pub trait RemoteCoordinator: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn acquire_service_tag(&self, request: &ServiceTagRequest) -> Result<String>;

    /// Best-effort give-back after a failed or cancelled run.
    async fn release_service_tag(&self, result_id: &str, nc12: Option<&str>, service_tag: &str);
}

/// Coordinator stub for stations running without a remote link.
pub struct OfflineCoordinator;

#[async_trait]
impl RemoteCoordinator for OfflineCoordinator {
    fn is_connected(&self) -> bool {
        false
    }

    async fn acquire_service_tag(&self, _request: &ServiceTagRequest) -> Result<String> {
        Err(anyhow::anyhow!("remote coordinator is offline"))
    }

    async fn release_service_tag(&self, _result_id: &str, _nc12: Option<&str>, _service_tag: &str) {
    }
}

/// Persists finished run records plus content-addressed feature files.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Atomically persist a run snapshot. When a feature file hash is
    /// present, the content is written once to content-addressed storage;
    /// an "already exists" outcome is not an error.
    async fn save(&self, snapshot: &Value, feature: Option<(&str, &str)>) -> Result<()>;
}

/// Flat-directory store: one JSON file per run, one content file per digest.
pub struct FsHistoryStore {
    records_dir: PathBuf,
    feature_db_dir: PathBuf,
}

impl FsHistoryStore {
    pub fn new(records_dir: impl Into<PathBuf>, feature_db_dir: impl Into<PathBuf>) -> Self {
        Self {
            records_dir: records_dir.into(),
            feature_db_dir: feature_db_dir.into(),
        }
    }
}

#[async_trait]
impl HistoryStore for FsHistoryStore {
    async fn save(&self, snapshot: &Value, feature: Option<(&str, &str)>) -> Result<()> {
        if let Some((hash, content)) = feature {
            tokio::fs::create_dir_all(&self.feature_db_dir).await?;
            let path = self.feature_db_dir.join(hash);
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    let mut file = file;
                    tokio::io::AsyncWriteExt::write_all(&mut file, content.as_bytes()).await?;
                    debug!("stored feature file {}", hash);
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err).context("feature file store failed"),
            }
        }

        let id = snapshot
            .get("_id")
            .and_then(Value::as_str)
            .context("run snapshot has no _id")?;

        tokio::fs::create_dir_all(&self.records_dir).await?;
        let final_path = self.records_dir.join(format!("{}.json", id));
        let tmp_path = self.records_dir.join(format!("{}.json.tmp", id));
        tokio::fs::write(&tmp_path, serde_json::to_vec_pretty(snapshot)?).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }
}

/// Label printer for acquired service tags.
#[async_trait]
pub trait Printer: Send + Sync {
    async fn print(&self, service_tag: &str) -> Result<()>;
}

pub struct NoopPrinter;

#[async_trait]
impl Printer for NoopPrinter {
    async fn print(&self, _service_tag: &str) -> Result<()> {
        Ok(())
    }
}

/// Fractional progress callback shared by the programming backends.
pub type ProgressFn<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// Generic serial/parallel device programming backend.
#[async_trait]
pub trait DeviceProgrammer: Send + Sync {
    async fn program(
        &self,
        feature: &str,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<(), RunError>;
}

/// Backend stub reporting the programmer as unavailable.
pub struct UnavailableProgrammer;

#[async_trait]
impl DeviceProgrammer for UnavailableProgrammer {
    async fn program(
        &self,
        _feature: &str,
        _progress: ProgressFn<'_>,
        _cancel: &CancelToken,
    ) -> Result<(), RunError> {
        Err(RunError::code("PROGRAMMER_UNAVAILABLE"))
    }
}

/// Payloads produced by the remote provisioning backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningFiles {
    pub order: String,
    pub input: String,
    pub result: String,
}

/// Remote provisioning backend handing back up to three payload files.
#[async_trait]
pub trait RemoteProvisioner: Send + Sync {
    async fn provision(
        &self,
        nc12: &str,
        progress: ProgressFn<'_>,
        cancel: &CancelToken,
    ) -> Result<ProvisioningFiles, RunError>;
}

/// External lamp-state resource polled by the fluorescent-lamp monitor.
#[async_trait]
pub trait LampStateSource: Send + Sync {
    /// Current on/off state of the resource, or `None` when unreachable.
    async fn read(&self, resource: &str) -> Option<bool>;
}

/// Lamp source for stations without fluorescent-lamp instrumentation.
pub struct NullLampSource;

#[async_trait]
impl LampStateSource for NullLampSource {
    async fn read(&self, _resource: &str) -> Option<bool> {
        None
    }
}

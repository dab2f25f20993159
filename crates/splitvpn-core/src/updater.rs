//! Updater proxy (SPEC_FULL.md §4.13): download + checksum verify + staged
//! restart, exposed through a narrow trait so the HTTP layer can drive it
//! without knowing the concrete update mechanism.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::RwLock;

use splitvpn_types::{Categorized, ErrorCategory, UpdateJob, UpdateState, UpdateStatus};

use crate::layout::atomic_write;

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no update check has completed yet")]
    NotChecked,
}

impl Categorized for UpdaterError {
    fn category(&self) -> ErrorCategory {
        match self {
            UpdaterError::ChecksumMismatch { .. } => ErrorCategory::Integrity,
            UpdaterError::Request(_) => ErrorCategory::Dependency,
            UpdaterError::NotChecked => ErrorCategory::Conflict,
            UpdaterError::Io(_) | UpdaterError::Json(_) => ErrorCategory::Internal,
        }
    }
}

/// A release descriptor as reported by the update manifest endpoint.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ReleaseManifest {
    pub tag: String,
    pub download_url: String,
    pub sha256: String,
}

/// Narrow capability interface over the real update mechanism (spec §9
/// "polymorphism over external systems"), so the HTTP layer can be tested
/// against an in-memory fake.
#[async_trait::async_trait]
pub trait Updater: Send + Sync {
    async fn status(&self) -> UpdateStatus;
    async fn check(&self) -> Result<UpdateStatus, UpdaterError>;
    async fn apply(&self) -> Result<UpdateStatus, UpdaterError>;
}

struct Inner {
    status: UpdateStatus,
    job: Option<UpdateJob>,
}

/// Default updater: checks a manifest URL, stages the downloaded artifact
/// under `updates/<tag>/`, verifies its SHA-256 against the manifest, and
/// persists status to `update-status.json`/`update-job.json` (mode `0600`)
/// without performing a real firmware restart.
pub struct DefaultUpdater {
    http: reqwest::Client,
    manifest_url: String,
    updates_dir: PathBuf,
    current_version: String,
    inner: RwLock<Inner>,
}

impl DefaultUpdater {
    pub fn new(manifest_url: String, updates_dir: PathBuf, current_version: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            manifest_url,
            updates_dir,
            current_version: current_version.clone(),
            inner: RwLock::new(Inner {
                status: UpdateStatus {
                    current_version,
                    latest_version: None,
                    state: UpdateState::Idle,
                    progress_percent: 0,
                    last_error: None,
                    checked_at: None,
                },
                job: None,
            }),
        }
    }

    async fn persist_status(&self) -> Result<(), UpdaterError> {
        let inner = self.inner.read().await;
        let bytes = serde_json::to_vec_pretty(&inner.status)?;
        atomic_write(&self.updates_dir.join("update-status.json"), &bytes, 0o600).await?;
        if let Some(job) = &inner.job {
            let bytes = serde_json::to_vec_pretty(job)?;
            atomic_write(&self.updates_dir.join("update-job.json"), &bytes, 0o600).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Updater for DefaultUpdater {
    async fn status(&self) -> UpdateStatus {
        self.inner.read().await.status.clone()
    }

    #[tracing::instrument(skip(self))]
    async fn check(&self) -> Result<UpdateStatus, UpdaterError> {
        {
            let mut inner = self.inner.write().await;
            inner.status.state = UpdateState::Checking;
        }

        let result = self
            .http
            .get(&self.manifest_url)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .and_then(|r| r.error_for_status());

        let mut inner = self.inner.write().await;
        match result {
            Ok(resp) => match resp.json::<ReleaseManifest>().await {
                Ok(manifest) => {
                    inner.status.latest_version = Some(manifest.tag);
                    inner.status.state = UpdateState::Idle;
                    inner.status.last_error = None;
                }
                Err(e) => {
                    inner.status.state = UpdateState::Failed;
                    inner.status.last_error = Some(e.to_string());
                }
            },
            Err(e) => {
                inner.status.state = UpdateState::Failed;
                inner.status.last_error = Some(e.to_string());
            }
        }
        inner.status.checked_at = Some(chrono::Utc::now());
        let snapshot = inner.status.clone();
        drop(inner);
        self.persist_status().await?;
        Ok(snapshot)
    }

    #[tracing::instrument(skip(self))]
    async fn apply(&self) -> Result<UpdateStatus, UpdaterError> {
        let latest = {
            let inner = self.inner.read().await;
            inner
                .status
                .latest_version
                .clone()
                .ok_or(UpdaterError::NotChecked)?
        };

        let manifest: ReleaseManifest = self
            .http
            .get(&self.manifest_url)
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .json()
            .await?;

        {
            let mut inner = self.inner.write().await;
            inner.status.state = UpdateState::Downloading;
            inner.job = Some(UpdateJob {
                tag: manifest.tag.clone(),
                state: UpdateState::Downloading,
                progress_percent: 0,
                checksum: None,
                started_at: chrono::Utc::now(),
            });
        }
        self.persist_status().await?;

        let bytes = self
            .http
            .get(&manifest.download_url)
            .timeout(Duration::from_secs(120))
            .send()
            .await?
            .bytes()
            .await?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let actual = hex::encode(hasher.finalize());

        if actual != manifest.sha256 {
            let mut inner = self.inner.write().await;
            inner.status.state = UpdateState::Failed;
            inner.status.last_error = Some(format!(
                "checksum mismatch: expected {}, got {actual}",
                manifest.sha256
            ));
            drop(inner);
            self.persist_status().await?;
            return Err(UpdaterError::ChecksumMismatch {
                expected: manifest.sha256,
                actual,
            });
        }

        let stage_dir = self.updates_dir.join(&manifest.tag);
        tokio::fs::create_dir_all(&stage_dir).await?;
        atomic_write(&stage_dir.join("artifact.bin"), &bytes, 0o644).await?;

        {
            let mut inner = self.inner.write().await;
            inner.status.state = UpdateState::Staged;
            inner.status.current_version = latest;
            if let Some(job) = &mut inner.job {
                job.state = UpdateState::Staged;
                job.progress_percent = 100;
                job.checksum = Some(actual);
            }
        }
        self.persist_status().await?;
        Ok(self.inner.read().await.status.clone())
    }
}

pub type SharedUpdater = Arc<dyn Updater>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn apply_before_check_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let updater = DefaultUpdater::new(
            "http://127.0.0.1:1/manifest.json".to_string(),
            dir.path().to_path_buf(),
            "1.0.0".to_string(),
        );

        let err = updater.apply().await.unwrap_err();
        assert!(matches!(err, UpdaterError::NotChecked));
    }

    #[tokio::test]
    async fn initial_status_reports_current_version_idle() {
        let dir = tempfile::tempdir().unwrap();
        let updater = DefaultUpdater::new(
            "http://127.0.0.1:1/manifest.json".to_string(),
            dir.path().to_path_buf(),
            "1.2.3".to_string(),
        );

        let status = updater.status().await;
        assert_eq!(status.current_version, "1.2.3");
        assert!(matches!(status.state, UpdateState::Idle));
        assert!(status.latest_version.is_none());
    }
}

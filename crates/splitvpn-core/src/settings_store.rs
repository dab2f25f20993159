//! Settings store: atomic `settings.json` read/write with auth-field
//! preservation (SPEC_FULL.md §4.8).

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use splitvpn_types::{Categorized, ErrorCategory, Settings};

use crate::layout::{atomic_write, Layout};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings file: {0}")]
    Parse(#[from] serde_json::Error),
}

impl Categorized for SettingsError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Internal
    }
}

/// Owns the in-memory settings and persists them atomically on write.
#[derive(Clone)]
pub struct SettingsStore {
    layout: Arc<Layout>,
    current: Arc<RwLock<Settings>>,
}

impl SettingsStore {
    /// Load `settings.json`, falling back to defaults if it does not exist.
    pub async fn load(layout: Arc<Layout>) -> Result<Self, SettingsError> {
        let path = layout.settings_path();
        let settings = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            layout,
            current: Arc::new(RwLock::new(settings)),
        })
    }

    pub async fn get(&self) -> Settings {
        self.current.read().await.clone()
    }

    pub async fn get_scrubbed(&self) -> Settings {
        self.current.read().await.scrubbed()
    }

    /// Merge `patch` onto the current settings, preserving auth fields when
    /// the patch omits them (never let a client null out `authPasswordHash`
    /// or `authToken` by omission), then persist atomically.
    pub async fn update(&self, mut patch: Settings) -> Result<Settings, SettingsError> {
        let mut guard = self.current.write().await;
        if patch.auth_password_hash.is_none() {
            patch.auth_password_hash = guard.auth_password_hash.clone();
        }
        if patch.auth_token.is_none() {
            patch.auth_token = guard.auth_token.clone();
        }
        let bytes = serde_json::to_vec_pretty(&patch)?;
        atomic_write(&self.layout.settings_path(), &bytes, 0o600).await?;
        *guard = patch.clone();
        Ok(patch)
    }

    /// Persist whatever is currently in memory (used after in-place auth
    /// field mutation, e.g. password change / token regeneration).
    pub async fn save_current(&self) -> Result<(), SettingsError> {
        let snapshot = self.current.read().await.clone();
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        atomic_write(&self.layout.settings_path(), &bytes, 0o600).await?;
        Ok(())
    }

    pub async fn set_auth_password_hash(&self, hash: String) -> Result<(), SettingsError> {
        {
            let mut guard = self.current.write().await;
            guard.auth_password_hash = Some(hash);
        }
        self.save_current().await
    }

    pub async fn set_auth_token(&self, token: String) -> Result<(), SettingsError> {
        {
            let mut guard = self.current.write().await;
            guard.auth_token = Some(token);
        }
        self.save_current().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_preserves_auth_fields_on_omission() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Arc::new(Layout::new(dir.path(), None));
        let store = SettingsStore::load(layout).await.unwrap();
        store
            .set_auth_token("secret-token".to_string())
            .await
            .unwrap();

        let mut patch = store.get().await;
        patch.auth_token = None;
        patch.wan_interface = "eth1".to_string();
        let saved = store.update(patch).await.unwrap();

        assert_eq!(saved.auth_token.as_deref(), Some("secret-token"));
        assert_eq!(saved.wan_interface, "eth1");
    }

    #[tokio::test]
    async fn scrubbed_omits_auth_fields() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Arc::new(Layout::new(dir.path(), None));
        let store = SettingsStore::load(layout).await.unwrap();
        store
            .set_auth_password_hash("hash".to_string())
            .await
            .unwrap();

        let scrubbed = store.get_scrubbed().await;
        assert!(scrubbed.auth_password_hash.is_none());
    }
}

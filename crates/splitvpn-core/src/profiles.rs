//! VPN profile manager (spec §4.4).

use std::collections::BTreeSet;
use std::sync::Arc;

use base64::Engine;
use thiserror::Error;
use tokio::sync::RwLock;

use splitvpn_types::{
    Categorized, ErrorCategory, Profile, ProfileType, SupportingFile, UpsertProfileRequest,
};

use crate::layout::{atomic_write, Layout};
use crate::unitctl::UnitController;

const MIN_FWMARK: u32 = 200; // 0xC8, spec §4.1 "Marks ≥ 0xC8 (200)"
const MAX_FWMARK: u32 = 0xFFFF;

#[derive(Debug, Error)]
pub enum VpnError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("vpn profile not found: {0}")]
    NotFound(String),
    #[error("vpn profile already exists: {0}")]
    AlreadyExists(String),
    #[error("fwmark allocation conflict")]
    AllocationConflict,
    #[error("fwmark allocation exhausted")]
    AllocationExhausted,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error(transparent)]
    Unit(#[from] crate::unitctl::UnitError),
}

impl Categorized for VpnError {
    fn category(&self) -> ErrorCategory {
        match self {
            VpnError::Validation(_) => ErrorCategory::Validation,
            VpnError::NotFound(_) => ErrorCategory::NotFound,
            VpnError::AlreadyExists(_) | VpnError::AllocationConflict => ErrorCategory::Conflict,
            VpnError::AllocationExhausted => ErrorCategory::Conflict,
            VpnError::Io(_) | VpnError::Base64(_) => ErrorCategory::Internal,
            VpnError::Unit(e) => e.category(),
        }
    }
}

/// Reject path traversal, non-portable characters, and length > 64
/// (spec §4.4 "ValidateName").
pub fn validate_name(name: &str) -> Result<(), VpnError> {
    if name.is_empty() || name.len() > 64 {
        return Err(VpnError::Validation(
            "name must be 1-64 characters".to_string(),
        ));
    }
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(VpnError::Validation(
            "name must not contain path separators".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err(VpnError::Validation(
            "name must match [A-Za-z0-9._-]".to_string(),
        ));
    }
    Ok(())
}

struct ProfileState {
    profiles: std::collections::BTreeMap<String, Profile>,
    used_marks: BTreeSet<u32>,
}

/// Validates, persists, and allocates identifiers for VPN profiles.
pub struct VpnManager<U: UnitController> {
    layout: Arc<Layout>,
    unit_controller: U,
    state: RwLock<ProfileState>,
}

impl<U: UnitController> VpnManager<U> {
    /// Load existing profiles from `<data-dir>/vpns/*/vpn.conf` at startup.
    pub async fn load(layout: Arc<Layout>, unit_controller: U) -> Result<Self, VpnError> {
        let mut profiles = std::collections::BTreeMap::new();
        let mut used_marks = BTreeSet::new();

        let vpns_dir = layout.vpns_dir();
        if let Ok(mut entries) = tokio::fs::read_dir(&vpns_dir).await {
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let meta_path = entry.path().join("profile.json");
                let Ok(bytes) = tokio::fs::read(&meta_path).await else {
                    continue;
                };
                let profile: Profile = serde_json::from_slice(&bytes)
                    .map_err(|e| VpnError::Validation(format!("corrupt profile metadata: {e}")))?;
                if !used_marks.insert(profile.fwmark) {
                    return Err(VpnError::AllocationConflict);
                }
                profiles.insert(profile.name.clone(), profile);
            }
        }

        Ok(Self {
            layout,
            unit_controller,
            state: RwLock::new(ProfileState {
                profiles,
                used_marks,
            }),
        })
    }

    pub async fn list(&self) -> Vec<Profile> {
        self.state.read().await.profiles.values().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Result<Profile, VpnError> {
        self.state
            .read()
            .await
            .profiles
            .get(name)
            .cloned()
            .ok_or_else(|| VpnError::NotFound(name.to_string()))
    }

    /// Smallest integer >= 200 not currently in use (spec §4.4 "fwmark allocation").
    fn allocate_mark(used: &BTreeSet<u32>) -> Result<u32, VpnError> {
        for candidate in MIN_FWMARK..=MAX_FWMARK {
            if !used.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(VpnError::AllocationExhausted)
    }

    #[tracing::instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create(&self, req: UpsertProfileRequest) -> Result<Profile, VpnError> {
        validate_name(&req.name)?;
        let mut guard = self.state.write().await;
        if guard.profiles.contains_key(&req.name) {
            return Err(VpnError::AlreadyExists(req.name));
        }
        let fwmark = Self::allocate_mark(&guard.used_marks)?;

        let supporting_files = decode_supporting_files(&req.supporting_files)?;
        let profile = Profile {
            name: req.name.clone(),
            profile_type: req.profile_type,
            config: req.config,
            config_file: req.config_file,
            supporting_files,
            interface_name: req.interface_name,
            bound_interface: req.bound_interface,
            fwmark,
            autostart: req.autostart,
        };

        self.write_profile_files(&profile).await?;
        guard.used_marks.insert(fwmark);
        guard.profiles.insert(profile.name.clone(), profile.clone());
        tracing::info!(fwmark, "created vpn profile");
        Ok(profile)
    }

    #[tracing::instrument(skip(self, req), fields(name = %name))]
    pub async fn update(
        &self,
        name: &str,
        req: UpsertProfileRequest,
    ) -> Result<Profile, VpnError> {
        validate_name(name)?;
        let mut guard = self.state.write().await;
        let existing = guard
            .profiles
            .get(name)
            .cloned()
            .ok_or_else(|| VpnError::NotFound(name.to_string()))?;

        let supporting_files = decode_supporting_files(&req.supporting_files)?;
        let profile = Profile {
            name: name.to_string(),
            profile_type: req.profile_type,
            config: req.config,
            config_file: req.config_file,
            supporting_files,
            interface_name: req.interface_name,
            bound_interface: req.bound_interface,
            fwmark: existing.fwmark, // stable for the profile's lifetime
            autostart: req.autostart,
        };

        self.write_profile_files(&profile).await?;
        guard.profiles.insert(profile.name.clone(), profile.clone());
        Ok(profile)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<Vec<String>, VpnError> {
        let mut warnings = Vec::new();
        let mut guard = self.state.write().await;
        let profile = guard
            .profiles
            .remove(name)
            .ok_or_else(|| VpnError::NotFound(name.to_string()))?;

        if let Err(e) = self.unit_controller.stop(name).await {
            warnings.push(format!("failed to stop service for {name}: {e}"));
        }

        let dir = self.layout.vpn_dir(name);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }

        guard.used_marks.remove(&profile.fwmark);
        Ok(warnings)
    }

    async fn write_profile_files(&self, profile: &Profile) -> Result<(), VpnError> {
        let dir = self.layout.vpn_dir(&profile.name);
        tokio::fs::create_dir_all(&dir).await?;

        let config_name = profile.config_file.clone().unwrap_or_else(|| match profile.profile_type {
            ProfileType::Wireguard => "wg.conf".to_string(),
            ProfileType::Openvpn => "client.ovpn".to_string(),
        });
        atomic_write(&dir.join(&config_name), profile.config.as_bytes(), 0o644).await?;

        for file in &profile.supporting_files {
            atomic_write(&dir.join(&file.name), &file.contents, 0o600).await?;
        }

        let metadata = serde_json::to_vec_pretty(profile)
            .map_err(|e| VpnError::Validation(format!("failed to serialize profile: {e}")))?;
        atomic_write(&dir.join("profile.json"), &metadata, 0o600).await?;

        let autostart_path = dir.join(".autostart");
        if profile.autostart {
            atomic_write(&autostart_path, b"1", 0o644).await?;
        } else {
            let _ = tokio::fs::remove_file(&autostart_path).await;
        }

        Ok(())
    }

    /// Drive the profile's unit through the controller (spec §6
    /// `/api/configs/{name}/start|stop|restart`). `UnitError` is wrapped so
    /// callers see one error type for the whole profile surface.
    pub async fn start_unit(&self, name: &str) -> Result<(), VpnError> {
        self.require(name).await?;
        self.unit_controller.start(name).await?;
        Ok(())
    }

    pub async fn stop_unit(&self, name: &str) -> Result<(), VpnError> {
        self.require(name).await?;
        self.unit_controller.stop(name).await?;
        Ok(())
    }

    pub async fn restart_unit(&self, name: &str) -> Result<(), VpnError> {
        self.require(name).await?;
        self.unit_controller.restart(name).await?;
        Ok(())
    }

    pub async fn is_active(&self, name: &str) -> Result<bool, VpnError> {
        self.require(name).await?;
        Ok(self.unit_controller.is_active(name).await?)
    }

    async fn require(&self, name: &str) -> Result<(), VpnError> {
        if self.state.read().await.profiles.contains_key(name) {
            Ok(())
        } else {
            Err(VpnError::NotFound(name.to_string()))
        }
    }

    pub async fn set_autostart(&self, name: &str, enabled: bool) -> Result<(), VpnError> {
        let mut guard = self.state.write().await;
        let profile = guard
            .profiles
            .get_mut(name)
            .ok_or_else(|| VpnError::NotFound(name.to_string()))?;
        profile.autostart = enabled;
        let profile = profile.clone();
        drop(guard);
        self.write_profile_files(&profile).await
    }
}

fn decode_supporting_files(
    inputs: &[splitvpn_types::profile::SupportingFileInput],
) -> Result<Vec<SupportingFile>, VpnError> {
    inputs
        .iter()
        .map(|input| {
            let contents = base64::engine::general_purpose::STANDARD.decode(&input.contents)?;
            Ok(SupportingFile {
                name: input.name.clone(),
                contents,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unitctl::NoopUnitController;

    #[test]
    fn validate_name_rejects_traversal() {
        assert!(validate_name("../etc").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"a".repeat(65)).is_err());
        assert!(validate_name("sgp-1.primary").is_ok());
    }

    #[tokio::test]
    async fn create_allocates_stable_increasing_marks() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Arc::new(Layout::new(dir.path(), None));
        let mgr = VpnManager::load(layout, NoopUnitController).await.unwrap();

        let p1 = mgr
            .create(UpsertProfileRequest {
                name: "sgp".to_string(),
                profile_type: ProfileType::Wireguard,
                config: "[Interface]".to_string(),
                config_file: None,
                supporting_files: vec![],
                interface_name: None,
                bound_interface: None,
                autostart: false,
            })
            .await
            .unwrap();
        let p2 = mgr
            .create(UpsertProfileRequest {
                name: "us".to_string(),
                profile_type: ProfileType::Wireguard,
                config: "[Interface]".to_string(),
                config_file: None,
                supporting_files: vec![],
                interface_name: None,
                bound_interface: None,
                autostart: false,
            })
            .await
            .unwrap();

        assert_eq!(p1.fwmark, 200);
        assert_eq!(p2.fwmark, 201);
        assert_ne!(p1.fwmark, p2.fwmark);
    }

    #[tokio::test]
    async fn create_duplicate_name_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Arc::new(Layout::new(dir.path(), None));
        let mgr = VpnManager::load(layout, NoopUnitController).await.unwrap();
        let req = UpsertProfileRequest {
            name: "sgp".to_string(),
            profile_type: ProfileType::Wireguard,
            config: "[Interface]".to_string(),
            config_file: None,
            supporting_files: vec![],
            interface_name: None,
            bound_interface: None,
            autostart: false,
        };
        mgr.create(req.clone()).await.unwrap();
        let err = mgr.create(req).await.unwrap_err();
        assert!(matches!(err, VpnError::AlreadyExists(_)));
    }
}

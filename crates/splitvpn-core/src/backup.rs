//! Backup / restore orchestration (spec §4.6).

use base64::Engine;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;

use splitvpn_types::{
    BackupSnapshot, Categorized, ErrorCategory, Profile, SupportingFileInput, UpsertProfileRequest,
    BACKUP_FORMAT, BACKUP_VERSION,
};

use crate::compiler::{self, CompilerError};
use crate::prewarm::PrewarmEngine;
use crate::profiles::{VpnError, VpnManager};
use crate::resolver::{ResolverError, ResolverScheduler};
use crate::routing_store::{RoutingStore, RoutingStoreError};
use crate::settings_store::{SettingsError, SettingsStore};
use crate::unitctl::UnitController;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("unsupported snapshot format/version")]
    InvalidSnapshot,
    #[error("group validation failed: {0}")]
    GroupValidation(#[from] CompilerError),
    #[error(transparent)]
    Vpn(#[from] VpnError),
    #[error(transparent)]
    Routing(#[from] RoutingStoreError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Resolver(#[from] ResolverError),
    #[error("import failed ({cause}) and rollback also failed ({rollback_cause})")]
    RollbackFailed {
        cause: String,
        rollback_cause: String,
    },
    #[error("import failed and was rolled back: {0}")]
    RolledBack(String),
}

impl Categorized for BackupError {
    fn category(&self) -> ErrorCategory {
        match self {
            BackupError::InvalidSnapshot => ErrorCategory::InvalidSnapshot,
            BackupError::GroupValidation(e) => e.category(),
            BackupError::Vpn(e) => e.category(),
            BackupError::Routing(e) => e.category(),
            BackupError::Settings(_) => ErrorCategory::Internal,
            BackupError::Resolver(e) => e.category(),
            BackupError::RollbackFailed { .. } | BackupError::RolledBack(_) => {
                ErrorCategory::Internal
            }
        }
    }
}

/// Produces and restores [`BackupSnapshot`]s against the live engine state,
/// serialized by a single mutex (spec §4.6 "under the backup mutex").
pub struct BackupManager<U: UnitController> {
    settings: SettingsStore,
    vpns: std::sync::Arc<VpnManager<U>>,
    routing: std::sync::Arc<RoutingStore>,
    resolver: std::sync::Arc<ResolverScheduler>,
    prewarm: std::sync::Arc<PrewarmEngine>,
    mutex: Mutex<()>,
}

impl<U: UnitController> BackupManager<U> {
    pub fn new(
        settings: SettingsStore,
        vpns: std::sync::Arc<VpnManager<U>>,
        routing: std::sync::Arc<RoutingStore>,
        resolver: std::sync::Arc<ResolverScheduler>,
        prewarm: std::sync::Arc<PrewarmEngine>,
    ) -> Self {
        Self {
            settings,
            vpns,
            routing,
            resolver,
            prewarm,
            mutex: Mutex::new(()),
        }
    }

    /// Export the whole control-plane state (spec §4.6 "Export"). Read-only,
    /// no side effects.
    #[tracing::instrument(skip(self))]
    pub async fn export(&self) -> BackupSnapshot {
        let _guard = self.mutex.lock().await;

        let mut vpns = self.vpns.list().await;
        vpns.sort_by(|a, b| a.name.cmp(&b.name));

        let mut groups = self.routing.list().await;
        groups.sort_by(|a, b| a.name.cmp(&b.name));

        let mut resolver_snapshot = self.resolver.snapshot().await;
        resolver_snapshot.sort_by(|a, b| {
            (a.selector.selector_type as u8, &a.selector.key)
                .cmp(&(b.selector.selector_type as u8, &b.selector.key))
        });

        BackupSnapshot {
            format: BACKUP_FORMAT.to_string(),
            version: BACKUP_VERSION,
            exported_at: Utc::now(),
            settings: self.settings.get().await,
            vpns,
            groups,
            resolver_snapshot,
            extra: Default::default(),
        }
    }

    /// Restore `snapshot`, pausing the resolver and pre-warm schedulers for
    /// the duration, with best-effort rollback on failure (spec §4.6).
    #[tracing::instrument(skip(self, snapshot))]
    pub async fn import(&self, snapshot: BackupSnapshot) -> Result<Vec<String>, BackupError> {
        if !snapshot.is_supported_format() {
            return Err(BackupError::InvalidSnapshot);
        }
        let _guard = self.mutex.lock().await;
        self.resolver.stop();
        self.prewarm.stop();

        let rollback = self.export().await;
        let result = self.apply(snapshot).await;

        let warnings = match result {
            Ok(warnings) => {
                self.resolver.start_again();
                self.prewarm.start_again();
                return Ok(warnings);
            }
            Err(cause) => {
                tracing::warn!(error = %cause, "import failed, attempting rollback");
                match self.apply(rollback).await {
                    Ok(_) => Err(BackupError::RolledBack(cause.to_string())),
                    Err(rollback_cause) => Err(BackupError::RollbackFailed {
                        cause: cause.to_string(),
                        rollback_cause: rollback_cause.to_string(),
                    }),
                }
            }
        };
        self.resolver.start_again();
        self.prewarm.start_again();
        warnings
    }

    async fn apply(&self, snapshot: BackupSnapshot) -> Result<Vec<String>, BackupError> {
        let mut warnings = Vec::new();

        self.routing.replace_all(Vec::new()).await?;

        for profile in self.vpns.list().await {
            if let Ok(stop_warnings) = self.vpns.delete(&profile.name).await {
                warnings.extend(stop_warnings);
            }
        }

        for profile in &snapshot.vpns {
            let req = to_upsert_request(profile);
            self.vpns.create(req).await?;
            self.vpns
                .set_autostart(&profile.name, profile.autostart)
                .await?;
        }

        let known_vpns: std::collections::HashSet<String> =
            snapshot.vpns.iter().map(|p| p.name.clone()).collect();
        let mut groups = Vec::new();
        for group in &snapshot.groups {
            if !known_vpns.contains(&group.egress_vpn) {
                return Err(BackupError::GroupValidation(CompilerError::GroupValidation(
                    format!("group {} references missing egress vpn", group.name),
                )));
            }
            let mut normalized = group.clone();
            compiler::normalize_group(&mut normalized)?;
            groups.push(normalized);
        }
        self.routing.replace_all(groups).await?;

        self.resolver
            .restore_cache(snapshot.resolver_snapshot.clone())
            .await?;
        self.settings.update(snapshot.settings).await?;

        Ok(warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    use splitvpn_types::{DomainGroup, ProfileType, ResolverSelector, SelectorType, UpsertGroupRequest};

    use crate::layout::Layout;
    use crate::unitctl::NoopUnitController;

    async fn test_manager() -> BackupManager<NoopUnitController> {
        let dir = tempfile::tempdir().unwrap();
        let layout = StdArc::new(Layout::new(dir.path(), None));
        let pool = crate::db::test_pool().await;

        let settings = SettingsStore::load(StdArc::clone(&layout)).await.unwrap();
        let vpns = StdArc::new(VpnManager::load(layout, NoopUnitController).await.unwrap());
        let routing = StdArc::new(RoutingStore::load(pool.clone()).await.unwrap());
        let resolver = StdArc::new(
            ResolverScheduler::load(
                pool,
                4,
                crate::resolver::ResolverTimeouts {
                    default: std::time::Duration::from_secs(1),
                    asn: std::time::Duration::from_secs(1),
                },
                true,
                true,
                true,
            )
            .await
            .unwrap(),
        );
        let prewarm = StdArc::new(PrewarmEngine::new(
            4,
            std::time::Duration::from_secs(1),
            "svpn".to_string(),
        ));

        BackupManager::new(settings, vpns, routing, resolver, prewarm)
    }

    /// Spec §8 "Backup round-trip: for any snapshot E that validates,
    /// Export(Apply(E)) = normalize(E)".
    #[tokio::test]
    async fn import_then_export_round_trips_vpns_groups_and_resolver_cache() {
        let manager = test_manager().await;

        manager
            .vpns
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
        manager
            .routing
            .create(UpsertGroupRequest {
                name: "Streaming".to_string(),
                egress_vpn: "sgp".to_string(),
                rules: vec![splitvpn_types::RoutingRule {
                    exact_domains: vec!["example.com".to_string()],
                    ..Default::default()
                }],
            })
            .await
            .unwrap();

        let original = manager.export().await;
        assert_eq!(original.vpns.len(), 1);
        assert_eq!(original.groups.len(), 1);

        let warnings = manager.import(original.clone()).await.unwrap();
        assert!(warnings.is_empty() || warnings.iter().all(|w| !w.is_empty()));

        let reimported = manager.export().await;
        assert_eq!(reimported.vpns.len(), original.vpns.len());
        assert_eq!(
            reimported.vpns[0].name, original.vpns[0].name,
            "vpn identity survives round-trip"
        );
        assert_eq!(reimported.vpns[0].fwmark, original.vpns[0].fwmark);
        assert_eq!(reimported.groups.len(), original.groups.len());
        assert_eq!(reimported.groups[0].name, original.groups[0].name);
        assert_eq!(
            reimported.groups[0].rules[0].exact_domains,
            original.groups[0].rules[0].exact_domains
        );
    }

    /// Resolver snapshot entries must survive an import too — this is the
    /// gap `ResolverScheduler::restore_cache` closes (spec §4.6 step 6).
    #[tokio::test]
    async fn import_restores_resolver_snapshot() {
        let manager = test_manager().await;
        manager
            .vpns
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

        let mut snapshot = manager.export().await;
        let mut values = splitvpn_types::ResolverValues::default();
        values.insert("1.1.1.1/32".parse().unwrap());
        snapshot.resolver_snapshot = vec![splitvpn_types::ResolverCacheEntry {
            selector: ResolverSelector::new(SelectorType::Domain, "example.com"),
            values,
            last_success_at: None,
            error_count: 0,
        }];

        manager.import(snapshot.clone()).await.unwrap();
        let exported = manager.export().await;
        assert_eq!(exported.resolver_snapshot.len(), 1);
        assert_eq!(
            exported.resolver_snapshot[0].selector.key,
            "example.com"
        );
    }

    #[tokio::test]
    async fn import_rejects_unsupported_format() {
        let manager = test_manager().await;
        let mut snapshot = manager.export().await;
        snapshot.format = "some-other-format".to_string();
        let err = manager.import(snapshot).await.unwrap_err();
        assert!(matches!(err, BackupError::InvalidSnapshot));
    }

    #[tokio::test]
    async fn import_rejects_group_with_missing_egress_vpn() {
        let manager = test_manager().await;
        let mut snapshot = manager.export().await;
        snapshot.groups.push(DomainGroup {
            id: 1,
            name: "Orphan".to_string(),
            egress_vpn: "nonexistent".to_string(),
            rules: vec![],
        });

        let err = manager.import(snapshot).await.unwrap_err();
        assert!(matches!(err, BackupError::RolledBack(_)));
        // rollback should have restored the empty pre-import state
        assert!(manager.export().await.groups.is_empty());
    }
}

fn to_upsert_request(profile: &Profile) -> UpsertProfileRequest {
    UpsertProfileRequest {
        name: profile.name.clone(),
        profile_type: profile.profile_type,
        config: profile.config.clone(),
        config_file: profile.config_file.clone(),
        supporting_files: profile
            .supporting_files
            .iter()
            .map(|f| SupportingFileInput {
                name: f.name.clone(),
                contents: base64::engine::general_purpose::STANDARD.encode(&f.contents),
            })
            .collect(),
        interface_name: profile.interface_name.clone(),
        bound_interface: profile.bound_interface.clone(),
        autostart: profile.autostart,
    }
}

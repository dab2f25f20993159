//! Shared application state and the glue that wires the core engine's
//! components together for one HTTP request (spec §2 "Glue" row; spec §9
//! names these interfaces, this module is the wiring behind them).

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use splitvpn_core::{
    AnyUnitController, BackupManager, Broadcaster, DeviceDirectory, FlowInspector, Layout,
    LatencyProber, PrewarmEngine, ResolverScheduler, RoutingStore, SettingsStore, StatsCollector,
    Updater, VpnManager,
};
use splitvpn_core::compiler::{self, CompiledRule, IpsetSnapshot};
use splitvpn_core::ipset;
use splitvpn_types::{Profile, SupportingFileInput, UpsertProfileRequest};

const IPSET_SNAPSHOT_DEADLINE: Duration = Duration::from_secs(4);

pub struct AppState {
    pub layout: Arc<Layout>,
    pub db: SqlitePool,
    pub settings: SettingsStore,
    pub vpns: Arc<VpnManager<AnyUnitController>>,
    pub routing: Arc<RoutingStore>,
    pub resolver: Arc<ResolverScheduler>,
    pub prewarm: Arc<PrewarmEngine>,
    pub flow: Arc<FlowInspector>,
    pub backup: Arc<BackupManager<AnyUnitController>>,
    pub broadcaster: Broadcaster,
    pub stats: Arc<StatsCollector>,
    pub latency: Arc<LatencyProber>,
    pub devices: Arc<DeviceDirectory>,
    pub updater: Arc<dyn Updater>,
    pub current_version: String,
}

impl AppState {
    /// Interfaces the stats collector should poll: the configured WAN plus
    /// every profile's declared interface (spec §4.7).
    pub async fn tracked_interfaces(&self) -> Vec<String> {
        let settings = self.settings.get().await;
        let mut interfaces = vec![settings.wan_interface.clone()];
        for profile in self.vpns.list().await {
            if let Some(name) = profile.interface_name {
                interfaces.push(name);
            }
        }
        interfaces.sort();
        interfaces.dedup();
        interfaces
    }

    /// Build the default SSE `message` payload (spec §6 "default `message`:
    /// `UpdatePayload = {stats, latency, configs, errors}`"), shared by the
    /// periodic broadcast tick and the SSE handler's immediate first frame.
    pub async fn build_update_payload(&self) -> serde_json::Value {
        let interfaces = self.tracked_interfaces().await;
        let stats = self.stats.poll(&interfaces).await;
        let latency = self.latency.samples().await;
        let configs = self.vpns.list().await;

        let mut statuses = std::collections::HashMap::new();
        for profile in &configs {
            if let Ok(active) = self.vpns.is_active(&profile.name).await {
                statuses.insert(profile.name.clone(), active);
            }
        }

        serde_json::json!({
            "stats": {
                "byInterface": stats.by_interface,
                "correctedRxBps": stats.corrected_rx_bps,
                "correctedTxBps": stats.corrected_tx_bps,
            },
            "latency": latency,
            "configs": statuses,
            "errors": [],
        })
    }

    /// Compile every rule across every group whose `egressVpn` is `profile`
    /// (spec §4.5 step 2), reading a fresh ipset snapshot for the rules'
    /// derived set names (spec §4.1 "Build SourcePrefixes").
    pub async fn compile_profile_rules(&self, profile: &str, fwmark: u32) -> Vec<CompiledRule> {
        let prefix = self.settings.get().await.set_name_prefix;
        let groups = self.routing.list().await;
        let resolver_cache = self.resolver.cache_values().await;
        let prewarm_cache = self.prewarm.cache().await;

        let mut set_names = Vec::new();
        for group in &groups {
            if group.egress_vpn != profile {
                continue;
            }
            for (index, _) in group.rules.iter().enumerate() {
                let pair = compiler::set_name_pair(&prefix, &group.name, index);
                set_names.extend([
                    pair.source_v4,
                    pair.source_v6,
                    pair.destination_v4,
                    pair.destination_v6,
                ]);
            }
        }

        let ipsets = ipset::snapshot(&set_names, IPSET_SNAPSHOT_DEADLINE)
            .await
            .unwrap_or_else(|_| IpsetSnapshot::default());

        let mut compiled = Vec::new();
        for group in &groups {
            if group.egress_vpn != profile {
                continue;
            }
            for (index, rule) in group.rules.iter().enumerate() {
                compiled.push(compiler::compile_rule(
                    &prefix,
                    group,
                    index,
                    rule,
                    &resolver_cache,
                    &prewarm_cache,
                    &ipsets,
                    fwmark,
                ));
            }
        }
        compiled
    }
}

/// Rebuild an [`UpsertProfileRequest`] from a stored [`Profile`] (spec §4.6
/// import path reuses the same shape; the config-file edit endpoint needs
/// it too since `VpnManager::update` only accepts the upsert contract).
pub fn to_upsert_request(profile: &Profile) -> UpsertProfileRequest {
    use base64::Engine;

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

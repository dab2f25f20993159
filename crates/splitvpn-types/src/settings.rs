//! Settings, updater, latency, and device-directory data model.
//!
//! These types back the "ambient stack" collaborators named in spec §1 as
//! external, and specified in full in SPEC_FULL.md §4.8–§4.13.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One EDNS Client Subnet query profile used by the pre-warm engine
/// (spec §4.3: "ECS profiles are `label=cidr` pairs").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcsProfile {
    pub label: String,
    pub cidr: String,
}

/// Full `settings.json` shape (spec §6 filesystem layout, SPEC_FULL.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_wan_interface")]
    pub wan_interface: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_history_length")]
    pub history_length: usize,
    #[serde(default = "default_latency_interval")]
    pub latency_interval_seconds: u64,
    #[serde(default = "default_resolver_interval")]
    pub resolver_interval_seconds: u64,
    #[serde(default = "default_resolver_parallelism")]
    pub resolver_parallelism: usize,
    #[serde(default = "default_resolver_timeout")]
    pub resolver_timeout_seconds: u64,
    #[serde(default = "default_resolver_asn_timeout")]
    pub resolver_asn_timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub resolver_domain_enabled: bool,
    #[serde(default = "default_true")]
    pub resolver_wildcard_enabled: bool,
    #[serde(default = "default_true")]
    pub resolver_asn_enabled: bool,
    #[serde(default = "default_prewarm_interval")]
    pub prewarm_interval_seconds: u64,
    #[serde(default = "default_prewarm_parallelism")]
    pub prewarm_parallelism: usize,
    #[serde(default = "default_prewarm_doh_timeout")]
    pub prewarm_doh_timeout_seconds: u64,
    #[serde(default)]
    pub prewarm_extra_nameservers: Vec<String>,
    #[serde(default)]
    pub prewarm_ecs_profiles: Vec<EcsProfile>,
    #[serde(default = "default_set_name_prefix")]
    pub set_name_prefix: String,
    /// Argon2 hash of the admin password. Omitted from the scrubbed view
    /// returned by `GET /api/settings`.
    #[serde(default)]
    pub auth_password_hash: Option<String>,
    /// Bearer/session token. Omitted from the scrubbed view.
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_bind_addr() -> String {
    "127.0.0.1:8091".to_string()
}
fn default_wan_interface() -> String {
    "eth0".to_string()
}
fn default_poll_interval() -> u64 {
    2
}
fn default_history_length() -> usize {
    120
}
fn default_latency_interval() -> u64 {
    30
}
fn default_resolver_interval() -> u64 {
    600
}
fn default_resolver_parallelism() -> usize {
    4
}
fn default_resolver_timeout() -> u64 {
    10
}
fn default_resolver_asn_timeout() -> u64 {
    10
}
fn default_prewarm_interval() -> u64 {
    600
}
fn default_prewarm_parallelism() -> usize {
    8
}
fn default_prewarm_doh_timeout() -> u64 {
    12
}
fn default_set_name_prefix() -> String {
    "svpn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            wan_interface: default_wan_interface(),
            poll_interval_seconds: default_poll_interval(),
            history_length: default_history_length(),
            latency_interval_seconds: default_latency_interval(),
            resolver_interval_seconds: default_resolver_interval(),
            resolver_parallelism: default_resolver_parallelism(),
            resolver_timeout_seconds: default_resolver_timeout(),
            resolver_asn_timeout_seconds: default_resolver_asn_timeout(),
            resolver_domain_enabled: true,
            resolver_wildcard_enabled: true,
            resolver_asn_enabled: true,
            prewarm_interval_seconds: default_prewarm_interval(),
            prewarm_parallelism: default_prewarm_parallelism(),
            prewarm_doh_timeout_seconds: default_prewarm_doh_timeout(),
            prewarm_extra_nameservers: Vec::new(),
            prewarm_ecs_profiles: Vec::new(),
            set_name_prefix: default_set_name_prefix(),
            auth_password_hash: None,
            auth_token: None,
        }
    }
}

impl Settings {
    /// A copy with auth secrets removed, for `GET /api/settings`.
    pub fn scrubbed(&self) -> Settings {
        Settings {
            auth_password_hash: None,
            auth_token: None,
            ..self.clone()
        }
    }
}

/// Updater job/status contract (spec §6 `/api/update/*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Checking,
    Downloading,
    Verifying,
    Staged,
    Restarting,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub current_version: String,
    pub latest_version: Option<String>,
    pub state: UpdateState,
    pub progress_percent: u8,
    pub last_error: Option<String>,
    pub checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateJob {
    pub tag: String,
    pub state: UpdateState,
    pub progress_percent: u8,
    pub checksum: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// One ping-prober result for a profile (SPEC_FULL.md §4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySample {
    pub profile: String,
    pub rtt_ms: Option<f64>,
    pub reachable: bool,
    pub last_checked_at: DateTime<Utc>,
}

/// A DHCP-lease / device-directory entry (SPEC_FULL.md §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub mac: String,
    pub ip: String,
    pub hostname: Option<String>,
    pub last_seen_at: DateTime<Utc>,
}

/// Dominant no-match reason counters exported by the flow inspector
/// (spec §4.5 "Observability").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticsEntry {
    pub source_prefix: u64,
    pub source_interface: u64,
    pub source_mac: u64,
    pub destination_prefix: u64,
    pub destination_port: u64,
    pub unknown: u64,
}

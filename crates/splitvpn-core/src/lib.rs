//! The routing & flow-analysis engine for a split-tunnel VPN gateway
//! control plane, and the schedulers that keep it coherent (spec §1).

pub mod asn;
pub mod backup;
pub mod broadcast;
pub mod compiler;
pub mod db;
pub mod device;
pub mod dns;
pub mod flow;
pub mod ipset;
pub mod latency;
pub mod layout;
pub mod prewarm;
pub mod profiles;
pub mod resolver;
pub mod routing_store;
pub mod settings_store;
pub mod stats;
pub mod subprocess;
pub mod unitctl;
pub mod updater;

pub use backup::{BackupError, BackupManager};
pub use broadcast::{BroadcastMessage, Broadcaster, Watcher};
pub use compiler::{CompiledRule, CompilerError, IpsetSnapshot, PrewarmCache};
pub use db::DbError;
pub use device::{DeviceDirectory, DeviceError};
pub use dns::DnsError;
pub use flow::{FlowError, FlowInspector, NoMatchReason};
pub use ipset::IpsetError;
pub use latency::{LatencyError, LatencyProber, ProbeTarget};
pub use layout::Layout;
pub use prewarm::{PrewarmEngine, PrewarmError, PrewarmStatus};
pub use profiles::{VpnError, VpnManager};
pub use resolver::{ResolverError, ResolverScheduler, ResolverTimeouts};
pub use routing_store::{RoutingStore, RoutingStoreError};
pub use settings_store::{SettingsError, SettingsStore};
pub use stats::{StatsCollector, StatsError, StatsSnapshot};
pub use unitctl::{
    AnyUnitController, NoopUnitController, SystemdUnitController, UnitController, UnitError,
};
pub use updater::{DefaultUpdater, Updater, UpdaterError};

//! Backup/restore snapshot format (spec §4.6, §6 "Backup file format").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::group::DomainGroup;
use crate::profile::Profile;
use crate::resolver::ResolverCacheEntry;
use crate::settings::Settings;

/// The only snapshot format this version of the control plane accepts.
pub const BACKUP_FORMAT: &str = "split-vpn-webui-backup";
/// The only snapshot version this release accepts (spec §6: "only the
/// current version is accepted").
pub const BACKUP_VERSION: u32 = 1;

/// A self-describing, versioned export of the whole control-plane state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub format: String,
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub settings: Settings,
    pub vpns: Vec<Profile>,
    pub groups: Vec<DomainGroup>,
    pub resolver_snapshot: Vec<ResolverCacheEntry>,
    /// Unknown top-level fields: preserved on export, ignored on import
    /// (spec §6).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BackupSnapshot {
    pub fn is_supported_format(&self) -> bool {
        self.format == BACKUP_FORMAT && self.version == BACKUP_VERSION
    }
}

//! Domain group data model (spec §3 "DomainGroup").

use serde::{Deserialize, Serialize};

use crate::rule::RoutingRule;

/// A named collection of AND-combined rules sharing one egress VPN
/// (spec §3 "DomainGroup").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainGroup {
    pub id: i64,
    pub name: String,
    pub egress_vpn: String,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
}

/// Wire contract for group create/update; `id` is server-assigned on create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertGroupRequest {
    pub name: String,
    pub egress_vpn: String,
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
}

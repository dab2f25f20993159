//! Routing rule data model (spec §3 "RoutingRule", "SetNamePair").

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// Transport protocol a destination port selector applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Both,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Both
    }
}

/// An inclusive destination port range with a protocol filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRange {
    #[serde(default)]
    pub protocol: Protocol,
    pub start: u16,
    pub end: u16,
}

// manual impls so PortRange can derive Ord with a non-Ord Protocol field
impl PartialOrd for Protocol {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Protocol {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        fn rank(p: &Protocol) -> u8 {
            match p {
                Protocol::Tcp => 0,
                Protocol::Udp => 1,
                Protocol::Both => 2,
            }
        }
        rank(self).cmp(&rank(other))
    }
}

/// The user's original, unsplit selector text per category, preserved for
/// round-trip editing in the UI (spec §3 "rawSelectors").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSelectors {
    #[serde(default)]
    pub source_interfaces: String,
    #[serde(default)]
    pub source_cidrs: String,
    #[serde(default)]
    pub excluded_source_cidrs: String,
    #[serde(default)]
    pub source_macs: String,
    #[serde(default)]
    pub destination_cidrs: String,
    #[serde(default)]
    pub excluded_destination_cidrs: String,
    #[serde(default)]
    pub destination_asns: String,
    #[serde(default)]
    pub excluded_asns: String,
    #[serde(default)]
    pub domains: String,
}

/// One AND-combined routing rule within a [`crate::DomainGroup`] (spec §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(default)]
    pub source_interfaces: Vec<String>,
    #[serde(default)]
    pub source_cidrs: Vec<IpNetwork>,
    #[serde(default)]
    pub excluded_source_cidrs: Vec<IpNetwork>,
    #[serde(default)]
    pub source_macs: Vec<String>,
    #[serde(default)]
    pub destination_cidrs: Vec<IpNetwork>,
    #[serde(default)]
    pub excluded_destination_cidrs: Vec<IpNetwork>,
    #[serde(default)]
    pub destination_ports: Vec<PortRange>,
    #[serde(default)]
    pub excluded_destination_ports: Vec<PortRange>,
    #[serde(default)]
    pub destination_asns: Vec<String>,
    #[serde(default)]
    pub excluded_asns: Vec<String>,
    #[serde(default)]
    pub exact_domains: Vec<String>,
    #[serde(default)]
    pub wildcard_domains: Vec<String>,
    #[serde(default)]
    pub exclude_multicast: bool,
    #[serde(default)]
    pub raw_selectors: RawSelectors,
}

impl RoutingRule {
    /// True if this rule has at least one selector of any kind (spec §4.1:
    /// "reject rule with zero selectors").
    pub fn has_any_selector(&self) -> bool {
        !self.source_interfaces.is_empty()
            || !self.source_cidrs.is_empty()
            || !self.source_macs.is_empty()
            || !self.destination_cidrs.is_empty()
            || !self.destination_asns.is_empty()
            || !self.exact_domains.is_empty()
            || !self.wildcard_domains.is_empty()
    }
}

/// The four stable ipset names derived for one `(group, ruleIndex)` pair
/// (spec §3 "SetNamePair").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetNamePair {
    pub source_v4: String,
    pub source_v6: String,
    pub destination_v4: String,
    pub destination_v6: String,
}

//! Selector resolver cache data model (spec §3 "ResolverSelector", "ResolverValues").

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

/// The kind of selector a resolver cache entry expands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorType {
    Domain,
    Wildcard,
    Asn,
}

/// `(type, key)` identifying one thing to resolve to prefixes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct ResolverSelector {
    #[serde(rename = "type")]
    pub selector_type: SelectorType,
    pub key: String,
}

impl ResolverSelector {
    pub fn new(selector_type: SelectorType, key: impl Into<String>) -> Self {
        Self {
            selector_type,
            key: key.into(),
        }
    }
}

/// Resolved v4/v6 prefixes for one selector. Invariant (spec §3): every CIDR
/// is masked to itself, v4/v6 are disjoint, and both sets are deduped+sorted
/// by construction since they are `BTreeSet`s of already-masked networks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverValues {
    pub v4: BTreeSet<IpNetwork>,
    pub v6: BTreeSet<IpNetwork>,
}

impl ResolverValues {
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// Insert a CIDR into the correct family bucket, masking host bits first.
    pub fn insert(&mut self, net: IpNetwork) {
        let masked = mask_network(net);
        match masked {
            IpNetwork::V4(_) => {
                self.v4.insert(masked);
            }
            IpNetwork::V6(_) => {
                self.v6.insert(masked);
            }
        }
    }

    pub fn merge(&mut self, other: &ResolverValues) {
        self.v4.extend(other.v4.iter().copied());
        self.v6.extend(other.v6.iter().copied());
    }
}

/// Zero the host bits of a network so `10.0.0.5/24` becomes `10.0.0.0/24`.
pub fn mask_network(net: IpNetwork) -> IpNetwork {
    match net {
        IpNetwork::V4(v4) => {
            IpNetwork::V4(ipnetwork::Ipv4Network::new(v4.network(), v4.prefix()).unwrap())
        }
        IpNetwork::V6(v6) => {
            IpNetwork::V6(ipnetwork::Ipv6Network::new(v6.network(), v6.prefix()).unwrap())
        }
    }
}

/// One cache entry: the selector, its last-known-good values, and health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverCacheEntry {
    pub selector: ResolverSelector,
    pub values: ResolverValues,
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_network_zeroes_host_bits() {
        let net: IpNetwork = "10.0.0.5/24".parse().unwrap();
        let masked = mask_network(net);
        assert_eq!(masked.to_string(), "10.0.0.0/24");
    }

    #[test]
    fn resolver_values_insert_dedups_and_sorts() {
        let mut values = ResolverValues::default();
        values.insert("1.1.1.1/32".parse().unwrap());
        values.insert("1.1.1.1/32".parse().unwrap());
        values.insert("1.0.0.1/32".parse().unwrap());
        assert_eq!(values.v4.len(), 2);
        let sorted: Vec<_> = values.v4.iter().map(|n| n.to_string()).collect();
        assert_eq!(sorted, vec!["1.0.0.1/32", "1.1.1.1/32"]);
    }
}

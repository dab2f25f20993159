//! Policy compiler (spec §4.1).

use std::collections::HashMap;

use std::hash::{Hash, Hasher};

use ipnetwork::IpNetwork;
use thiserror::Error;

use splitvpn_types::resolver::mask_network;
use splitvpn_types::{
    Categorized, DomainGroup, ErrorCategory, PortRange, Protocol, ResolverSelector,
    ResolverValues, RoutingRule, SelectorType, SetNamePair,
};

#[derive(Debug, Error)]
pub enum CompilerError {
    #[error("group validation failed: {0}")]
    GroupValidation(String),
    #[error("rule needs a fresh set snapshot")]
    RuleNeedsSetSnapshot,
}

impl Categorized for CompilerError {
    fn category(&self) -> ErrorCategory {
        match self {
            CompilerError::GroupValidation(_) => ErrorCategory::Validation,
            CompilerError::RuleNeedsSetSnapshot => ErrorCategory::Dependency,
        }
    }
}

/// A rule after normalization and compilation, ready for the flow inspector
/// and the external applier (spec §4.1).
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub group_name: String,
    pub rule_index: usize,
    pub set_names: SetNamePair,
    pub requires_source_prefix: bool,
    pub requires_destination_prefix: bool,
    pub source_prefixes: Vec<IpNetwork>,
    pub destination_prefixes: Vec<IpNetwork>,
    pub source_interfaces: Vec<String>,
    pub source_macs: Vec<String>,
    pub destination_ports: Vec<PortRange>,
    pub excluded_destination_ports: Vec<PortRange>,
    pub exclude_multicast: bool,
    pub fwmark: u32,
}

/// Live ipset membership snapshot: set name -> member prefixes (spec §4.1
/// "Build SourcePrefixes: union of current ipset v4+v6 members for this
/// rule's source sets").
#[derive(Debug, Clone, Default)]
pub struct IpsetSnapshot {
    pub members: HashMap<String, Vec<IpNetwork>>,
}

/// Pre-warm cache keyed by destination set name (spec §4.3 "merge ... keyed
/// by the destination set name derived by the policy compiler").
#[derive(Debug, Clone, Default)]
pub struct PrewarmCache {
    pub by_set_name: HashMap<String, ResolverValues>,
}

/// Short deterministic hash of `input`, rendered as 6 lowercase hex chars,
/// used to keep set names stable and collision-resistant.
fn short_hash(input: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:06x}", hasher.finish() & 0xFFFFFF)
}

/// Deterministic lower-case slug for a group name: alphanumerics + `-`,
/// collisions resolved by appending a short hash (spec §3 "SetNamePair").
pub fn slugify(group_name: &str) -> String {
    let mut slug: String = group_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        format!("g{}", short_hash(group_name))
    } else {
        slug
    }
}

/// `SetNamePair(group, index)` is pure and total over `(group.name, index)`
/// (spec §3, §8 "Universal invariants").
pub fn set_name_pair(prefix: &str, group_name: &str, rule_index: usize) -> SetNamePair {
    let slug = slugify(group_name);
    // Disambiguate slug collisions (two differently-named groups slugifying
    // to the same string) with a short hash of the *original* name appended.
    let slug_with_salt = format!("{slug}-{}", short_hash(group_name));
    let base = format!("{prefix}_{slug_with_salt}_r{rule_index}");
    SetNamePair {
        source_v4: format!("{base}s4"),
        source_v6: format!("{base}s6"),
        destination_v4: format!("{base}d4"),
        destination_v6: format!("{base}d6"),
    }
}

/// Normalize a MAC address: accepts `aa:bb:cc:dd:ee:ff`, `AA-BB-...`, strips
/// a trailing `# comment` (spec §4.1, §8 boundary behavior).
pub fn normalize_mac(input: &str) -> Result<String, CompilerError> {
    let without_comment = input.split('#').next().unwrap_or("").trim();
    let normalized = without_comment.replace('-', ":").to_lowercase();
    let parts: Vec<&str> = normalized.split(':').collect();
    if parts.len() != 6 || parts.iter().any(|p| p.len() != 2 || !p.chars().all(|c| c.is_ascii_hexdigit())) {
        return Err(CompilerError::GroupValidation(format!(
            "invalid MAC address: {input}"
        )));
    }
    Ok(parts.join(":"))
}

/// Normalize an ASN: `AS` prefix optional, digits only, leading zeros
/// removed, empty rejected (spec §4.1, §8 "as001335 -> AS1335").
pub fn normalize_asn(input: &str) -> Result<String, CompilerError> {
    let trimmed = input.trim();
    let digits = trimmed
        .strip_prefix("AS")
        .or_else(|| trimmed.strip_prefix("as"))
        .unwrap_or(trimmed);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(CompilerError::GroupValidation(format!(
            "invalid ASN: {input}"
        )));
    }
    let value: u64 = digits
        .parse()
        .map_err(|_| CompilerError::GroupValidation(format!("invalid ASN: {input}")))?;
    if value == 0 {
        return Err(CompilerError::GroupValidation(format!(
            "invalid ASN: {input}"
        )));
    }
    Ok(format!("AS{value}"))
}

/// Domain validation accepts standard FQDNs; wildcard form `*.example.com`
/// stores `example.com` (spec §4.1, §8 "*.Example.com -> example.com").
pub fn normalize_domain(input: &str) -> Result<(bool, String), CompilerError> {
    let trimmed = input.trim().to_lowercase();
    let (is_wildcard, domain) = match trimmed.strip_prefix("*.") {
        Some(rest) => (true, rest.to_string()),
        None => (false, trimmed),
    };
    if domain.is_empty()
        || domain.len() > 253
        || !domain
            .split('.')
            .all(|label| !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
    {
        return Err(CompilerError::GroupValidation(format!(
            "invalid domain: {input}"
        )));
    }
    Ok((is_wildcard, domain))
}

/// Normalize and validate every rule in every group (spec §4.1 "Normalization").
pub fn normalize_group(group: &mut DomainGroup) -> Result<(), CompilerError> {
    let name = group.name.trim().to_string();
    if name.is_empty() {
        return Err(CompilerError::GroupValidation(
            "group name must not be empty".to_string(),
        ));
    }
    group.name = name;

    for rule in &mut group.rules {
        normalize_rule(rule)?;
    }
    Ok(())
}

fn normalize_rule(rule: &mut RoutingRule) -> Result<(), CompilerError> {
    rule.source_interfaces = dedup_sorted(
        rule.source_interfaces
            .iter()
            .map(|s| s.trim().to_lowercase())
            .collect(),
    );

    let mut macs = Vec::new();
    for mac in &rule.source_macs {
        macs.push(normalize_mac(mac)?);
    }
    rule.source_macs = dedup_sorted(macs);

    let mut asns = Vec::new();
    for asn in &rule.destination_asns {
        asns.push(normalize_asn(asn)?);
    }
    rule.destination_asns = dedup_sorted(asns);

    let mut excluded_asns = Vec::new();
    for asn in &rule.excluded_asns {
        excluded_asns.push(normalize_asn(asn)?);
    }
    rule.excluded_asns = dedup_sorted(excluded_asns);

    let mut exact = Vec::new();
    let mut wildcard = std::mem::take(&mut rule.wildcard_domains);
    for domain in rule.exact_domains.drain(..) {
        let (is_wildcard, normalized) = normalize_domain(&domain)?;
        if is_wildcard {
            wildcard.push(normalized);
        } else {
            exact.push(normalized);
        }
    }
    // domains already filed under wildcard_domains are re-validated, with or
    // without a redundant leading "*." in their stored form
    let mut wildcard_normalized = Vec::new();
    for domain in wildcard {
        let stripped = domain.strip_prefix("*.").unwrap_or(&domain).to_string();
        let (_, normalized) = normalize_domain(&stripped)?;
        wildcard_normalized.push(normalized);
    }
    rule.exact_domains = dedup_sorted(exact);
    rule.wildcard_domains = dedup_sorted(wildcard_normalized);

    rule.destination_ports = normalize_ports(std::mem::take(&mut rule.destination_ports))?;
    rule.excluded_destination_ports =
        normalize_ports(std::mem::take(&mut rule.excluded_destination_ports))?;

    rule.source_cidrs = dedup_networks(std::mem::take(&mut rule.source_cidrs))
        .into_iter()
        .map(mask_network)
        .collect();
    rule.excluded_source_cidrs = dedup_networks(std::mem::take(&mut rule.excluded_source_cidrs))
        .into_iter()
        .map(mask_network)
        .collect();
    rule.destination_cidrs = dedup_networks(std::mem::take(&mut rule.destination_cidrs))
        .into_iter()
        .map(mask_network)
        .collect();
    rule.excluded_destination_cidrs =
        dedup_networks(std::mem::take(&mut rule.excluded_destination_cidrs))
            .into_iter()
            .map(mask_network)
            .collect();

    if !rule.has_any_selector() {
        return Err(CompilerError::GroupValidation(
            "rule has zero selectors".to_string(),
        ));
    }
    Ok(())
}

fn normalize_ports(ports: Vec<PortRange>) -> Result<Vec<PortRange>, CompilerError> {
    let mut normalized = Vec::new();
    for port in ports {
        if port.start == 0 || port.end == 0 {
            return Err(CompilerError::GroupValidation(
                "ports must be in [1,65535]".to_string(),
            ));
        }
        if port.end < port.start {
            return Err(CompilerError::GroupValidation(
                "port range end must be >= start".to_string(),
            ));
        }
        normalized.push(port);
    }
    normalized.sort();
    normalized.dedup();
    Ok(normalized)
}

fn dedup_sorted(mut items: Vec<String>) -> Vec<String> {
    items.sort();
    items.dedup();
    items
}

fn dedup_networks(mut items: Vec<IpNetwork>) -> Vec<IpNetwork> {
    items.sort_by_key(|n| (n.is_ipv6(), n.ip(), n.prefix()));
    items.dedup();
    items
}

/// Longest-prefix-first ordering for deterministic matching (spec §4.1).
fn sort_longest_prefix_first(prefixes: &mut [IpNetwork]) {
    prefixes.sort_by(|a, b| b.prefix().cmp(&a.prefix()));
}

/// Compile one rule within `group` at `rule_index` against the current
/// resolver cache, pre-warm cache, and ipset snapshot (spec §4.1
/// "Compilation per rule").
pub fn compile_rule(
    prefix: &str,
    group: &DomainGroup,
    rule_index: usize,
    rule: &RoutingRule,
    resolver_cache: &HashMap<ResolverSelector, ResolverValues>,
    prewarm: &PrewarmCache,
    ipsets: &IpsetSnapshot,
    fwmark: u32,
) -> CompiledRule {
    let set_names = set_name_pair(prefix, &group.name, rule_index);

    let requires_source_prefix = !rule.source_cidrs.is_empty();
    let requires_destination_prefix = !rule.destination_cidrs.is_empty()
        || !rule.destination_asns.is_empty()
        || !rule.exact_domains.is_empty()
        || !rule.wildcard_domains.is_empty();

    let mut source_prefixes = Vec::new();
    if requires_source_prefix {
        let mut from_set = ipsets
            .members
            .get(&set_names.source_v4)
            .cloned()
            .unwrap_or_default();
        from_set.extend(ipsets.members.get(&set_names.source_v6).cloned().unwrap_or_default());
        source_prefixes = if from_set.is_empty() {
            rule.source_cidrs.clone()
        } else {
            from_set
        };
        source_prefixes.retain(|p| !rule.excluded_source_cidrs.iter().any(|ex| contains(ex, p)));
    }

    let mut destination_prefixes = Vec::new();
    if requires_destination_prefix {
        let mut from_set = ipsets
            .members
            .get(&set_names.destination_v4)
            .cloned()
            .unwrap_or_default();
        from_set.extend(
            ipsets
                .members
                .get(&set_names.destination_v6)
                .cloned()
                .unwrap_or_default(),
        );
        if from_set.is_empty() {
            destination_prefixes.extend(rule.destination_cidrs.iter().copied());
        } else {
            destination_prefixes = from_set;
        }

        for asn in &rule.destination_asns {
            if let Some(values) = resolver_cache.get(&ResolverSelector::new(SelectorType::Asn, asn)) {
                destination_prefixes.extend(values.v4.iter().copied());
                destination_prefixes.extend(values.v6.iter().copied());
            }
        }
        for domain in &rule.exact_domains {
            if let Some(values) =
                resolver_cache.get(&ResolverSelector::new(SelectorType::Domain, domain))
            {
                destination_prefixes.extend(values.v4.iter().copied());
                destination_prefixes.extend(values.v6.iter().copied());
            }
        }
        for domain in &rule.wildcard_domains {
            if let Some(values) =
                resolver_cache.get(&ResolverSelector::new(SelectorType::Wildcard, domain))
            {
                destination_prefixes.extend(values.v4.iter().copied());
                destination_prefixes.extend(values.v6.iter().copied());
            }
        }
        if let Some(values) = prewarm.by_set_name.get(&set_names.destination_v4) {
            destination_prefixes.extend(values.v4.iter().copied());
        }
        if let Some(values) = prewarm.by_set_name.get(&set_names.destination_v6) {
            destination_prefixes.extend(values.v6.iter().copied());
        }

        destination_prefixes
            .retain(|p| !rule.excluded_destination_cidrs.iter().any(|ex| contains(ex, p)));
        destination_prefixes.sort_by_key(|n| (n.is_ipv6(), n.ip(), n.prefix()));
        destination_prefixes.dedup();
    }

    sort_longest_prefix_first(&mut source_prefixes);
    sort_longest_prefix_first(&mut destination_prefixes);

    CompiledRule {
        group_name: group.name.clone(),
        rule_index,
        set_names,
        requires_source_prefix,
        requires_destination_prefix,
        source_prefixes,
        destination_prefixes,
        source_interfaces: rule.source_interfaces.clone(),
        source_macs: rule.source_macs.clone(),
        destination_ports: rule.destination_ports.clone(),
        excluded_destination_ports: rule.excluded_destination_ports.clone(),
        exclude_multicast: rule.exclude_multicast,
        fwmark,
    }
}

fn contains(container: &IpNetwork, candidate: &IpNetwork) -> bool {
    container.is_ipv4() == candidate.is_ipv4() && container.contains(candidate.ip())
}

/// Collect the set of active selectors referenced by at least one rule
/// across all groups (spec §4.2 "compute the set of active selectors").
pub fn active_selectors(groups: &[DomainGroup]) -> Vec<ResolverSelector> {
    let mut out = Vec::new();
    for group in groups {
        for rule in &group.rules {
            for domain in &rule.exact_domains {
                out.push(ResolverSelector::new(SelectorType::Domain, domain.clone()));
            }
            for domain in &rule.wildcard_domains {
                out.push(ResolverSelector::new(SelectorType::Wildcard, domain.clone()));
            }
            for asn in &rule.destination_asns {
                out.push(ResolverSelector::new(SelectorType::Asn, asn.clone()));
            }
        }
    }
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_name_pair_is_deterministic() {
        let a = set_name_pair("svpn", "Streaming", 0);
        let b = set_name_pair("svpn", "Streaming", 0);
        assert_eq!(a, b);
        let c = set_name_pair("svpn", "Streaming", 1);
        assert_ne!(a.source_v4, c.source_v4);
    }

    #[test]
    fn normalize_mac_strips_comment_and_lowercases() {
        let mac = normalize_mac("AA:BB:CC:DD:EE:FF # phone").unwrap();
        assert_eq!(mac, "aa:bb:cc:dd:ee:ff");
        let mac2 = normalize_mac("AA-BB-CC-DD-EE-FF").unwrap();
        assert_eq!(mac2, "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn normalize_asn_examples() {
        assert_eq!(normalize_asn("as001335").unwrap(), "AS1335");
        assert!(normalize_asn("garbage").is_err());
    }

    #[test]
    fn normalize_domain_wildcard() {
        let (is_wildcard, domain) = normalize_domain("*.Example.com").unwrap();
        assert!(is_wildcard);
        assert_eq!(domain, "example.com");
    }

    #[test]
    fn port_range_rejects_end_before_start() {
        let ports = vec![PortRange {
            protocol: Protocol::Tcp,
            start: 500,
            end: 100,
        }];
        assert!(normalize_ports(ports).is_err());
    }

    fn group_with_rule(rule: RoutingRule) -> DomainGroup {
        DomainGroup {
            id: 1,
            name: "Streaming".to_string(),
            egress_vpn: "sgp".to_string(),
            rules: vec![rule],
        }
    }

    #[test]
    fn compile_rule_prefers_live_ipset_members_over_raw_cidrs() {
        let group = group_with_rule(RoutingRule {
            source_cidrs: vec!["10.0.0.0/24".parse().unwrap()],
            destination_cidrs: vec!["1.1.1.0/24".parse().unwrap()],
            ..Default::default()
        });
        let set_names = set_name_pair("svpn", &group.name, 0);

        let mut ipsets = IpsetSnapshot::default();
        ipsets
            .members
            .insert(set_names.source_v4.clone(), vec!["10.0.0.0/25".parse().unwrap()]);
        ipsets
            .members
            .insert(set_names.destination_v4.clone(), vec!["1.1.1.1/32".parse().unwrap()]);

        let compiled = compile_rule(
            "svpn",
            &group,
            0,
            &group.rules[0],
            &HashMap::new(),
            &PrewarmCache::default(),
            &ipsets,
            100,
        );

        assert_eq!(compiled.source_prefixes, vec!["10.0.0.0/25".parse::<IpNetwork>().unwrap()]);
        assert_eq!(
            compiled.destination_prefixes,
            vec!["1.1.1.1/32".parse::<IpNetwork>().unwrap()]
        );
    }

    #[test]
    fn compile_rule_falls_back_to_raw_cidrs_when_ipset_snapshot_is_empty() {
        let group = group_with_rule(RoutingRule {
            source_cidrs: vec!["10.0.0.0/24".parse().unwrap()],
            ..Default::default()
        });
        let compiled = compile_rule(
            "svpn",
            &group,
            0,
            &group.rules[0],
            &HashMap::new(),
            &PrewarmCache::default(),
            &IpsetSnapshot::default(),
            100,
        );
        assert_eq!(compiled.source_prefixes, vec!["10.0.0.0/24".parse::<IpNetwork>().unwrap()]);
    }

    #[test]
    fn compile_rule_excludes_destination_cidrs_contained_by_exclusion() {
        let group = group_with_rule(RoutingRule {
            destination_cidrs: vec!["1.1.1.0/24".parse().unwrap()],
            excluded_destination_cidrs: vec!["1.1.1.128/25".parse().unwrap()],
            ..Default::default()
        });
        let set_names = set_name_pair("svpn", &group.name, 0);
        let mut ipsets = IpsetSnapshot::default();
        ipsets.members.insert(
            set_names.destination_v4.clone(),
            vec!["1.1.1.10/32".parse().unwrap(), "1.1.1.200/32".parse().unwrap()],
        );

        let compiled = compile_rule(
            "svpn",
            &group,
            0,
            &group.rules[0],
            &HashMap::new(),
            &PrewarmCache::default(),
            &ipsets,
            100,
        );

        assert_eq!(
            compiled.destination_prefixes,
            vec!["1.1.1.10/32".parse::<IpNetwork>().unwrap()]
        );
    }

    #[test]
    fn compile_rule_merges_resolver_cache_and_prewarm_values_for_domain_selector() {
        let group = group_with_rule(RoutingRule {
            exact_domains: vec!["example.com".to_string()],
            ..Default::default()
        });
        let set_names = set_name_pair("svpn", &group.name, 0);

        let mut resolver_values = ResolverValues::default();
        resolver_values.insert("93.184.216.34/32".parse().unwrap());
        let mut resolver_cache = HashMap::new();
        resolver_cache.insert(
            ResolverSelector::new(SelectorType::Domain, "example.com"),
            resolver_values,
        );

        let mut prewarm = PrewarmCache::default();
        let mut prewarm_values = ResolverValues::default();
        prewarm_values.insert("93.184.216.40/32".parse().unwrap());
        prewarm.by_set_name.insert(set_names.destination_v4.clone(), prewarm_values);

        let compiled = compile_rule(
            "svpn",
            &group,
            0,
            &group.rules[0],
            &resolver_cache,
            &prewarm,
            &IpsetSnapshot::default(),
            100,
        );

        assert_eq!(compiled.destination_prefixes.len(), 2);
        assert!(compiled
            .destination_prefixes
            .contains(&"93.184.216.34/32".parse().unwrap()));
        assert!(compiled
            .destination_prefixes
            .contains(&"93.184.216.40/32".parse().unwrap()));
    }

    #[test]
    fn active_selectors_dedups_across_groups_and_sorts() {
        let groups = vec![
            group_with_rule(RoutingRule {
                exact_domains: vec!["b.example.com".to_string()],
                destination_asns: vec!["AS1335".to_string()],
                ..Default::default()
            }),
            group_with_rule(RoutingRule {
                exact_domains: vec!["b.example.com".to_string()],
                wildcard_domains: vec!["example.com".to_string()],
                ..Default::default()
            }),
        ];
        let selectors = active_selectors(&groups);
        assert_eq!(
            selectors,
            vec![
                ResolverSelector::new(SelectorType::Domain, "b.example.com"),
                ResolverSelector::new(SelectorType::Wildcard, "example.com"),
                ResolverSelector::new(SelectorType::Asn, "AS1335"),
            ]
        );
    }
}

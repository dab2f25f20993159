//! Flow inspector (spec §4.5): conntrack snapshot -> per-rule attribution ->
//! throughput sessions.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use rand::RngCore;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::RwLock;

use splitvpn_types::{Categorized, ErrorCategory, FlowRecord, FlowRow, FlowSample, FlowSession};

use crate::compiler::CompiledRule;
use crate::subprocess::{self, Logs, SubprocessError};

const SESSION_TTL: Duration = Duration::from_secs(30 * 60);
const IDLE_RETENTION: Duration = Duration::from_secs(10 * 60);
const POLL_INTERVAL_SECS: f64 = 2.0;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Subprocess(#[from] SubprocessError),
    #[error("session not found for this profile")]
    VpnMismatch,
}

impl Categorized for FlowError {
    fn category(&self) -> ErrorCategory {
        match self {
            FlowError::Subprocess(_) => ErrorCategory::Dependency,
            FlowError::VpnMismatch => ErrorCategory::NotFound,
        }
    }
}

/// Why a flow failed to attribute to any rule, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoMatchReason {
    SourcePrefix,
    SourceInterface,
    SourceMac,
    DestinationPrefix,
    DestinationPort,
    Unknown,
}

/// A device's known MAC, supplied by the device directory (DHCP leases /
/// system JSON command). Source interface is derived separately, by
/// longest-prefix match against the local interface address table (spec
/// §4.5 step 4), not looked up per-device.
#[derive(Debug, Clone, Default)]
pub struct DeviceHint {
    pub mac: Option<String>,
}

pub struct FlowInspector {
    sessions: RwLock<HashMap<String, FlowSession>>,
    no_match_counts: RwLock<HashMap<NoMatchReason, u64>>,
}

impl Default for FlowInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowInspector {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            no_match_counts: RwLock::new(HashMap::new()),
        }
    }

    /// Start a new session for `profile`; allowed to create a second
    /// concurrent session for the same profile (spec §4.5).
    pub async fn start(&self, profile: &str) -> String {
        let id = random_session_id();
        let now = Utc::now();
        self.sessions.write().await.insert(
            id.clone(),
            FlowSession {
                id: id.clone(),
                profile: profile.to_string(),
                flows: HashMap::new(),
                total_upload: 0,
                total_download: 0,
                created_at: now,
                last_touched_at: now,
            },
        );
        id
    }

    pub async fn stop(&self, profile: &str, session_id: &str) -> Result<(), FlowError> {
        self.reap_expired().await;
        let mut sessions = self.sessions.write().await;
        match sessions.get(session_id) {
            Some(s) if s.profile == profile => {
                sessions.remove(session_id);
                Ok(())
            }
            _ => Err(FlowError::VpnMismatch),
        }
    }

    /// Run one collection tick for `profile`/`session_id`: snapshot conntrack,
    /// attribute flows to compiled rules, update the session, and return the
    /// sorted output rows (spec §4.5).
    #[tracing::instrument(skip(self, rules, device_hints, local_interfaces), fields(profile))]
    pub async fn poll(
        &self,
        profile: &str,
        session_id: &str,
        fwmark: u32,
        rules: &[CompiledRule],
        device_hints: &HashMap<std::net::IpAddr, DeviceHint>,
        local_interfaces: &[(IpNetwork, String)],
        command_timeout: Duration,
    ) -> Result<Vec<FlowRow>, FlowError> {
        self.reap_expired().await;

        let mut cmd = Command::new("conntrack");
        cmd.args(["-L"]);
        let output = subprocess::run_stdout(&mut cmd, command_timeout, Logs::Suppress).await?;
        let samples = parse_conntrack(&output);

        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .filter(|s| s.profile == profile)
            .ok_or(FlowError::VpnMismatch)?;
        session.last_touched_at = now;

        let mut seen_keys = Vec::new();
        for sample in &samples {
            let key = sample.key();
            seen_keys.push(key.clone());
            let device = device_hints.get(&sample.src_ip);
            let source_interface = interface_for_ip(local_interfaces, sample.src_ip);
            let rule = attribute(
                sample,
                rules,
                device,
                source_interface.as_deref(),
                fwmark,
                &self.no_match_counts,
            )
            .await;

            match session.flows.get_mut(&key) {
                None => {
                    session.flows.insert(
                        key,
                        FlowRecord {
                            upload_total: 0,
                            download_total: 0,
                            last_upload_bytes: sample.upload_bytes,
                            last_download_bytes: sample.download_bytes,
                            upload_bps: 0.0,
                            download_bps: 0.0,
                            first_seen: now,
                            last_seen: now,
                            rule,
                        },
                    );
                }
                Some(record) => {
                    let upload_delta = sample.upload_bytes.saturating_sub(record.last_upload_bytes);
                    let download_delta =
                        sample.download_bytes.saturating_sub(record.last_download_bytes);
                    let elapsed = (now - record.last_seen)
                        .num_milliseconds()
                        .max((POLL_INTERVAL_SECS * 1000.0) as i64) as f64
                        / 1000.0;

                    record.upload_total += upload_delta;
                    record.download_total += download_delta;
                    record.upload_bps = (upload_delta as f64 * 8.0) / elapsed;
                    record.download_bps = (download_delta as f64 * 8.0) / elapsed;
                    record.last_upload_bytes = sample.upload_bytes;
                    record.last_download_bytes = sample.download_bytes;
                    record.last_seen = now;
                    record.rule = rule;
                }
            }
        }

        // keys absent this tick: zero their throughput, evict if past idle retention
        let idle_cutoff = now - chrono::Duration::from_std(IDLE_RETENTION).unwrap();
        session.flows.retain(|key, record| {
            if seen_keys.contains(key) {
                return true;
            }
            record.upload_bps = 0.0;
            record.download_bps = 0.0;
            record.last_seen > idle_cutoff
        });

        session.total_upload = session.flows.values().map(|r| r.upload_total).sum();
        session.total_download = session.flows.values().map(|r| r.download_total).sum();

        let mut rows: Vec<FlowRow> = session
            .flows
            .iter()
            .map(|(key, record)| FlowRow {
                key: key.clone(),
                record: record.clone(),
            })
            .collect();
        rows.sort_by(|a, b| {
            let a_total = a.record.upload_bps + a.record.download_bps;
            let b_total = b.record.upload_bps + b.record.download_bps;
            b_total
                .partial_cmp(&a_total)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(rows)
    }

    pub async fn no_match_diagnostics(&self) -> HashMap<NoMatchReason, u64> {
        self.no_match_counts.read().await.clone()
    }

    async fn reap_expired(&self) {
        let now = Utc::now();
        let ttl_cutoff = now - chrono::Duration::from_std(SESSION_TTL).unwrap();
        self.sessions
            .write()
            .await
            .retain(|_, session| session.last_touched_at > ttl_cutoff);
    }
}

fn random_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `matchFlowRule` (spec §4.5): first rule whose selectors all match wins,
/// in group order then rule index; otherwise fall back to mark match.
async fn attribute(
    sample: &FlowSample,
    rules: &[CompiledRule],
    device: Option<&DeviceHint>,
    source_interface: Option<&str>,
    fwmark: u32,
    no_match_counts: &RwLock<HashMap<NoMatchReason, u64>>,
) -> Option<String> {
    let mut dominant_reason = NoMatchReason::Unknown;
    for rule in rules {
        if let Some(reason) = match_reason(sample, rule, device, source_interface) {
            dominant_reason = reason;
            continue;
        }
        return Some(format!("{}#{}", rule.group_name, rule.rule_index));
    }

    if let Some(mark) = sample.mark {
        if mark >= 200 && (mark & 0xFFFF) == (fwmark & 0xFFFF) {
            return None;
        }
    }

    *no_match_counts.write().await.entry(dominant_reason).or_insert(0) += 1;
    None
}

/// Returns `None` if `rule` matches `sample`, otherwise the first selector
/// category that failed.
fn match_reason(
    sample: &FlowSample,
    rule: &CompiledRule,
    device: Option<&DeviceHint>,
    source_interface: Option<&str>,
) -> Option<NoMatchReason> {
    if rule.requires_source_prefix
        && !rule.source_prefixes.iter().any(|p| contains(p, sample.src_ip))
    {
        return Some(NoMatchReason::SourcePrefix);
    }
    if !rule.source_interfaces.is_empty() {
        if !source_interface.is_some_and(|i| rule.source_interfaces.iter().any(|si| si == i)) {
            return Some(NoMatchReason::SourceInterface);
        }
    }
    if !rule.source_macs.is_empty() {
        let mac = device.and_then(|d| d.mac.as_deref());
        if !mac.is_some_and(|m| rule.source_macs.iter().any(|sm| sm == m)) {
            return Some(NoMatchReason::SourceMac);
        }
    }
    if rule.requires_destination_prefix
        && !rule
            .destination_prefixes
            .iter()
            .any(|p| contains(p, sample.dst_ip))
    {
        return Some(NoMatchReason::DestinationPrefix);
    }
    if !rule.destination_ports.is_empty()
        && !rule.destination_ports.iter().any(|range| {
            sample.dst_port >= range.start
                && sample.dst_port <= range.end
                && protocol_matches(range.protocol, &sample.protocol)
        })
    {
        return Some(NoMatchReason::DestinationPort);
    }
    None
}

fn protocol_matches(range_protocol: splitvpn_types::Protocol, sample_protocol: &str) -> bool {
    match range_protocol {
        splitvpn_types::Protocol::Both => true,
        splitvpn_types::Protocol::Tcp => sample_protocol.eq_ignore_ascii_case("tcp"),
        splitvpn_types::Protocol::Udp => sample_protocol.eq_ignore_ascii_case("udp"),
    }
}

fn contains(net: &IpNetwork, ip: std::net::IpAddr) -> bool {
    net.is_ipv4() == ip.is_ipv4() && net.contains(ip)
}

/// Likely source interface for `ip`: longest-prefix match against the
/// local interface address table (spec §4.5 step 4).
fn interface_for_ip(local_interfaces: &[(IpNetwork, String)], ip: std::net::IpAddr) -> Option<String> {
    local_interfaces
        .iter()
        .filter(|(net, _)| contains(net, ip))
        .max_by_key(|(net, _)| net.prefix())
        .map(|(_, iface)| iface.clone())
}

/// Parse `conntrack -L` output into deduplicated flow samples (spec §8
/// scenario 2). Each line carries two directional tuples and an optional
/// `mark=` (decimal or `0x…`).
fn parse_conntrack(output: &str) -> Vec<FlowSample> {
    let mut by_key = HashMap::new();
    for line in output.lines() {
        if let Some(sample) = parse_conntrack_line(line) {
            by_key.insert(sample.key(), sample);
        }
    }
    by_key.into_values().collect()
}

fn parse_conntrack_line(line: &str) -> Option<FlowSample> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.is_empty() {
        return None;
    }
    let protocol = tokens[0].to_lowercase();
    if protocol != "tcp" && protocol != "udp" {
        return None;
    }

    let mut src_ip = None;
    let mut dst_ip = None;
    let mut src_port = None;
    let mut dst_port = None;
    let mut upload_bytes = None;
    let mut download_bytes = None;
    let mut mark = None;
    let mut direction = 0;

    for token in &tokens[1..] {
        if let Some((key, value)) = token.split_once('=') {
            match key {
                "src" if direction == 0 => src_ip = value.parse().ok(),
                "dst" if direction == 0 => dst_ip = value.parse().ok(),
                "sport" if direction == 0 => src_port = value.parse().ok(),
                "dport" if direction == 0 => {
                    dst_port = value.parse().ok();
                    direction = 1;
                }
                "bytes" if direction == 1 && upload_bytes.is_none() => {
                    upload_bytes = value.parse().ok();
                }
                "bytes" if direction >= 1 => {
                    download_bytes = value.parse().ok();
                    direction = 2;
                }
                "mark" => {
                    mark = if let Some(hex) = value.strip_prefix("0x") {
                        u32::from_str_radix(hex, 16).ok()
                    } else {
                        value.parse().ok()
                    };
                }
                _ => {}
            }
        }
    }

    Some(FlowSample {
        protocol,
        src_ip: src_ip?,
        src_port: src_port?,
        dst_ip: dst_ip?,
        dst_port: dst_port?,
        upload_bytes: upload_bytes.unwrap_or(0),
        download_bytes: download_bytes.unwrap_or(0),
        mark,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_conntrack_line_reads_both_directions_and_mark() {
        let line = "tcp 6 431999 ESTABLISHED src=10.0.1.10 dst=142.250.74.14 sport=50432 dport=443 packets=30 bytes=10240 src=142.250.74.14 dst=10.0.1.10 sport=443 dport=50432 packets=26 bytes=20480 mark=0x1a";
        let sample = parse_conntrack_line(line).unwrap();
        assert_eq!(sample.src_ip.to_string(), "10.0.1.10");
        assert_eq!(sample.dst_ip.to_string(), "142.250.74.14");
        assert_eq!(sample.src_port, 50432);
        assert_eq!(sample.dst_port, 443);
        assert_eq!(sample.upload_bytes, 10240);
        assert_eq!(sample.download_bytes, 20480);
        assert_eq!(sample.mark, Some(26));
    }

    #[test]
    fn mark_low_16_bit_match() {
        let mark: u32 = 0x1A0169;
        let fwmark: u32 = 0x169;
        assert_eq!(mark & 0xFFFF, fwmark & 0xFFFF);
    }

    #[test]
    fn interface_for_ip_picks_longest_prefix() {
        let interfaces = vec![
            ("10.0.0.0/8".parse().unwrap(), "wan0".to_string()),
            ("10.0.1.0/24".parse().unwrap(), "lan0".to_string()),
        ];
        let iface = interface_for_ip(&interfaces, "10.0.1.10".parse().unwrap());
        assert_eq!(iface.as_deref(), Some("lan0"));
    }

    #[test]
    fn interface_for_ip_none_when_no_prefix_matches() {
        let interfaces = vec![("192.168.1.0/24".parse().unwrap(), "lan0".to_string())];
        let iface = interface_for_ip(&interfaces, "10.0.1.10".parse().unwrap());
        assert!(iface.is_none());
    }

    #[test]
    fn source_interface_rule_matches_via_local_prefix() {
        let sample = FlowSample {
            protocol: "tcp".to_string(),
            src_ip: "10.0.1.10".parse().unwrap(),
            src_port: 1234,
            dst_ip: "1.1.1.1".parse().unwrap(),
            dst_port: 443,
            upload_bytes: 0,
            download_bytes: 0,
            mark: None,
        };
        let mut rule = test_rule();
        rule.source_interfaces = vec!["lan0".to_string()];

        assert_eq!(
            match_reason(&sample, &rule, None, Some("wan0")),
            Some(NoMatchReason::SourceInterface)
        );
        assert_eq!(match_reason(&sample, &rule, None, Some("lan0")), None);
    }

    fn test_rule() -> CompiledRule {
        CompiledRule {
            group_name: "g".to_string(),
            rule_index: 0,
            set_names: splitvpn_types::SetNamePair {
                source_v4: String::new(),
                source_v6: String::new(),
                destination_v4: String::new(),
                destination_v6: String::new(),
            },
            requires_source_prefix: false,
            requires_destination_prefix: false,
            source_prefixes: vec![],
            destination_prefixes: vec![],
            source_interfaces: vec![],
            source_macs: vec![],
            destination_ports: vec![],
            excluded_destination_ports: vec![],
            exclude_multicast: false,
            fwmark: 200,
        }
    }
}

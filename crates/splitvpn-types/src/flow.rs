//! Live flow / throughput data model (spec §3 "FlowSample", "FlowRecord", "FlowSession").

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One conntrack tuple observed during a snapshot tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSample {
    pub protocol: String,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub upload_bytes: u64,
    pub download_bytes: u64,
    pub mark: Option<u32>,
}

impl FlowSample {
    /// `protocol|srcIP|srcPort|dstIP|dstPort`, lower-cased protocol, trimmed IPs
    /// (spec §3 "FlowSample.Key").
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.protocol.to_lowercase(),
            self.src_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port
        )
    }
}

/// Per-session running state for one flow key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    pub upload_total: u64,
    pub download_total: u64,
    pub last_upload_bytes: u64,
    pub last_download_bytes: u64,
    pub upload_bps: f64,
    pub download_bps: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Attributed rule, as `"{group_name}#{rule_index}"`, or `None` if attributed
    /// only via conntrack mark (spec §4.5).
    pub rule: Option<String>,
}

/// A short-lived per-profile aggregation of live flows (spec §3 "FlowSession").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSession {
    pub id: String,
    pub profile: String,
    pub flows: HashMap<String, FlowRecord>,
    pub total_upload: u64,
    pub total_download: u64,
    pub created_at: DateTime<Utc>,
    pub last_touched_at: DateTime<Utc>,
}

/// A display row: one flow, sorted for output (spec §4.5 "Output rows are
/// sorted by current total bits/s desc, ties broken by flow key").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRow {
    pub key: String,
    pub record: FlowRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_sample_key_lowercases_protocol() {
        let sample = FlowSample {
            protocol: "TCP".into(),
            src_ip: "10.0.1.10".parse().unwrap(),
            src_port: 50432,
            dst_ip: "142.250.74.14".parse().unwrap(),
            dst_port: 443,
            upload_bytes: 10240,
            download_bytes: 20480,
            mark: Some(26),
        };
        assert_eq!(sample.key(), "tcp|10.0.1.10|50432|142.250.74.14|443");
    }
}

//! Kernel ipset snapshot reader (spec §4.1, §8 scenario 6).
//!
//! Read-only: the core never programs ipsets itself (spec §9 "kernel state
//! is read-only input to the core"), it only snapshots current membership
//! and set sizes via the `ipset` CLI through [`crate::subprocess`].

use std::collections::HashMap;
use std::time::Duration;

use ipnetwork::IpNetwork;
use thiserror::Error;
use tokio::process::Command;

use splitvpn_types::{Categorized, ErrorCategory};

use crate::compiler::IpsetSnapshot;
use crate::subprocess::{self, Logs, SubprocessError};

#[derive(Debug, Error)]
pub enum IpsetError {
    #[error(transparent)]
    Subprocess(#[from] SubprocessError),
}

impl Categorized for IpsetError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Dependency
    }
}

/// Snapshot the live membership of every set in `set_names`, bounded by
/// `deadline` total (spec §5 "ipset snapshot 4 s"). Sets that do not yet
/// exist in the kernel (not yet programmed by the external applier) are
/// simply absent from the result, not an error.
pub async fn snapshot(set_names: &[String], deadline: Duration) -> Result<IpsetSnapshot, IpsetError> {
    let mut members = HashMap::new();
    let per_set_deadline = deadline / (set_names.len().max(1) as u32);
    for name in set_names {
        let mut cmd = Command::new("ipset");
        cmd.args(["list", name]);
        match subprocess::run_stdout(&mut cmd, per_set_deadline, Logs::Suppress).await {
            Ok(output) => {
                members.insert(name.clone(), parse_members(&output));
            }
            Err(_) => continue,
        }
    }
    Ok(IpsetSnapshot { members })
}

/// Parse the member list out of `ipset list <name>` output: everything
/// after the `Members:` line, one CIDR or bare IP per line.
fn parse_members(output: &str) -> Vec<IpNetwork> {
    let mut prefixes = Vec::new();
    let mut in_members = false;
    for line in output.lines() {
        if in_members {
            let entry = line.trim();
            if entry.is_empty() {
                continue;
            }
            let cidr_text = entry.split_whitespace().next().unwrap_or(entry);
            if let Ok(net) = cidr_text.parse::<IpNetwork>() {
                prefixes.push(net);
            } else if let Ok(ip) = cidr_text.parse::<std::net::IpAddr>() {
                let bits = if ip.is_ipv4() { 32 } else { 128 };
                if let Ok(net) = format!("{ip}/{bits}").parse() {
                    prefixes.push(net);
                }
            }
        } else if line.trim_start().starts_with("Members:") {
            in_members = true;
        }
    }
    prefixes
}

/// Probe the live member count of every set in `set_names` (spec §8
/// scenario 6: `Name: svpn_media_r1d4\nNumber of entries: 12`), bounded by
/// `deadline` total (spec §5 "ipset size probe 5 s").
pub async fn probe_sizes(
    set_names: &[String],
    deadline: Duration,
) -> Result<HashMap<String, u64>, IpsetError> {
    let mut sizes = HashMap::new();
    let per_set_deadline = deadline / (set_names.len().max(1) as u32);
    for name in set_names {
        let mut cmd = Command::new("ipset");
        cmd.args(["list", name, "-t"]);
        if let Ok(output) = subprocess::run_stdout(&mut cmd, per_set_deadline, Logs::Suppress).await {
            if let Some((parsed_name, count)) = parse_size(&output) {
                sizes.insert(parsed_name, count);
            }
        }
    }
    Ok(sizes)
}

fn parse_size(output: &str) -> Option<(String, u64)> {
    let mut name = None;
    let mut count = None;
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Name:") {
            name = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("Number of entries:") {
            count = rest.trim().parse::<u64>().ok();
        }
    }
    match (name, count) {
        (Some(n), Some(c)) => Some((n, c)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_reads_name_and_count() {
        let output = "Name: svpn_media_r1d4\nType: hash:ip\nNumber of entries: 12\nMembers:\n1.1.1.1\n";
        let (name, count) = parse_size(output).unwrap();
        assert_eq!(name, "svpn_media_r1d4");
        assert_eq!(count, 12);
    }

    #[test]
    fn parse_members_reads_cidrs_and_bare_ips() {
        let output = "Name: svpn_media_r1d4\nMembers:\n10.0.0.0/24\n1.1.1.1\n";
        let members = parse_members(output);
        assert_eq!(members.len(), 2);
        assert_eq!(members[1].to_string(), "1.1.1.1/32");
    }
}

//! Device directory (SPEC_FULL.md §4.10): IP <-> MAC resolution by combining
//! a DHCP lease file reader with an optional external system-JSON command.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::RwLock;

use splitvpn_types::{Categorized, DeviceEntry, ErrorCategory};

use crate::subprocess::{self, Logs, SubprocessError};

/// Budget for `ip -o addr show`, same order of magnitude as the other
/// device-directory external commands (spec §5 "device directory external
/// commands 1.5 s").
const LOCAL_INTERFACE_COMMAND_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to read leases file: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Subprocess(#[from] SubprocessError),
}

impl Categorized for DeviceError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Dependency
    }
}

#[derive(Debug, Deserialize)]
struct SystemDeviceEntry {
    mac: String,
    ip: IpAddr,
    #[serde(default)]
    hostname: Option<String>,
}

/// Combines a dnsmasq-style lease file with an optional external
/// system-inventory command into one IP/MAC lookup table, refreshed on
/// demand and protected by a single mutex (spec §5 locking discipline).
pub struct DeviceDirectory {
    leases_path: Option<PathBuf>,
    system_command: Option<String>,
    command_timeout: Duration,
    by_ip: RwLock<HashMap<IpAddr, DeviceEntry>>,
    local_interfaces: RwLock<Vec<(IpNetwork, String)>>,
}

impl DeviceDirectory {
    pub fn new(
        leases_path: Option<PathBuf>,
        system_command: Option<String>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            leases_path,
            system_command,
            command_timeout,
            by_ip: RwLock::new(HashMap::new()),
            local_interfaces: RwLock::new(Vec::new()),
        }
    }

    /// Re-read the lease file, the local interface address table, and (if
    /// configured) invoke the system command, replacing the in-memory
    /// tables (spec §4.5 step 4).
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self) -> Result<(), DeviceError> {
        let mut table = HashMap::new();

        if let Some(path) = &self.leases_path {
            match tokio::fs::read_to_string(path).await {
                Ok(contents) => {
                    for entry in parse_dnsmasq_leases(&contents) {
                        table.insert(entry.ip, entry.device);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(command) = &self.system_command {
            let parts: Vec<&str> = command.split_whitespace().collect();
            if let Some((program, args)) = parts.split_first() {
                let mut cmd = Command::new(program);
                cmd.args(args);
                let output =
                    subprocess::run_stdout(&mut cmd, self.command_timeout, Logs::Suppress).await?;
                if let Ok(entries) = serde_json::from_str::<Vec<SystemDeviceEntry>>(&output) {
                    let now = Utc::now();
                    for entry in entries {
                        table.insert(
                            entry.ip,
                            DeviceEntry {
                                mac: entry.mac,
                                ip: entry.ip.to_string(),
                                hostname: entry.hostname,
                                last_seen_at: now,
                            },
                        );
                    }
                }
            }
        }

        *self.by_ip.write().await = table;

        let mut cmd = Command::new("ip");
        cmd.args(["-o", "addr", "show"]);
        match subprocess::run_stdout(&mut cmd, LOCAL_INTERFACE_COMMAND_TIMEOUT, Logs::Suppress).await
        {
            Ok(output) => {
                *self.local_interfaces.write().await = parse_ip_addr_show(&output);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read local interface addresses");
            }
        }

        Ok(())
    }

    pub async fn lookup(&self, ip: IpAddr) -> Option<DeviceEntry> {
        self.by_ip.read().await.get(&ip).cloned()
    }

    pub async fn list(&self) -> Vec<DeviceEntry> {
        self.by_ip.read().await.values().cloned().collect()
    }

    /// Snapshot of the local interface address table (CIDR, interface name
    /// pairs) for the flow inspector's longest-prefix source-interface
    /// match (spec §4.5 step 4).
    pub async fn local_interfaces(&self) -> Vec<(IpNetwork, String)> {
        self.local_interfaces.read().await.clone()
    }
}

struct LeaseEntry {
    ip: IpAddr,
    device: DeviceEntry,
}

/// Parse dnsmasq's `dnsmasq.leases` format: one lease per line,
/// `<expiry> <mac> <ip> <hostname> <client-id>`.
fn parse_dnsmasq_leases(contents: &str) -> Vec<LeaseEntry> {
    let mut leases = Vec::new();
    for line in contents.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let expiry: i64 = match fields[0].parse() {
            Ok(v) => v,
            Err(_) => continue,
        };
        let Ok(ip) = fields[2].parse::<IpAddr>() else {
            continue;
        };
        let hostname = (fields[3] != "*").then(|| fields[3].to_string());
        leases.push(LeaseEntry {
            ip,
            device: DeviceEntry {
                mac: fields[1].to_lowercase(),
                ip: ip.to_string(),
                hostname,
                last_seen_at: DateTime::from_timestamp(expiry, 0).unwrap_or_else(Utc::now),
            },
        });
    }
    leases
}

/// Parse `ip -o addr show` output: one address per line, e.g.
/// `2: eth0    inet 192.168.1.5/24 brd 192.168.1.255 scope global eth0`.
/// Tolerates unknown trailing fields, same idiom as the conntrack parser.
fn parse_ip_addr_show(output: &str) -> Vec<(IpNetwork, String)> {
    let mut interfaces = Vec::new();
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 4 {
            continue;
        }
        let iface = tokens[1].trim_end_matches(':').to_string();
        let mut idx = 2;
        while idx + 1 < tokens.len() {
            if tokens[idx] == "inet" || tokens[idx] == "inet6" {
                if let Ok(net) = tokens[idx + 1].parse::<IpNetwork>() {
                    interfaces.push((net, iface.clone()));
                }
                break;
            }
            idx += 1;
        }
    }
    interfaces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ip_addr_show_line() {
        let output = "2: eth0    inet 192.168.1.5/24 brd 192.168.1.255 scope global eth0\\       valid_lft forever preferred_lft forever\n";
        let interfaces = parse_ip_addr_show(output);
        assert_eq!(interfaces.len(), 1);
        assert_eq!(interfaces[0].1, "eth0");
        assert_eq!(interfaces[0].0.prefix(), 24);
    }

    #[tokio::test]
    async fn local_interfaces_snapshot_reflects_refreshed_table() {
        let dir = DeviceDirectory::new(None, None, Duration::from_millis(100));
        *dir.local_interfaces.write().await = vec![
            ("10.0.0.0/8".parse().unwrap(), "wan0".to_string()),
            ("10.0.1.0/24".parse().unwrap(), "lan0".to_string()),
        ];
        let snapshot = dir.local_interfaces().await;
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn parses_dnsmasq_lease_line() {
        let contents = "1735689600 aa:bb:cc:dd:ee:ff 10.0.1.10 phone 01:aa:bb:cc:dd:ee:ff\n";
        let leases = parse_dnsmasq_leases(contents);
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].device.mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(leases[0].device.hostname.as_deref(), Some("phone"));
    }

    #[test]
    fn skips_malformed_lines() {
        let leases = parse_dnsmasq_leases("garbage line\n");
        assert!(leases.is_empty());
    }
}

//! Latency prober (SPEC_FULL.md §4.12): periodic `ping -c 1` per profile.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{watch, RwLock};

use splitvpn_types::{Categorized, ErrorCategory, LatencySample};

use crate::subprocess::{self, Logs, SubprocessError};

#[derive(Debug, Error)]
pub enum LatencyError {
    #[error(transparent)]
    Subprocess(#[from] SubprocessError),
}

impl Categorized for LatencyError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Dependency
    }
}

/// One target to probe: a profile name and the interface/host to ping
/// through (its bound interface's egress, or a declared gateway host).
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub profile: String,
    pub host: String,
}

/// Owns the latest [`LatencySample`] per profile and the stop signal for its
/// background task (spec §5 "long-lived workers ... each run on their own
/// task with an explicit stop signal").
pub struct LatencyProber {
    timeout: Duration,
    samples: Arc<RwLock<HashMap<String, LatencySample>>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl LatencyProber {
    pub fn new(timeout: Duration) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            timeout,
            samples: Arc::new(RwLock::new(HashMap::new())),
            stop_tx,
            stop_rx,
        }
    }

    pub async fn samples(&self) -> Vec<LatencySample> {
        self.samples.read().await.values().cloned().collect()
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn start_again(&self) {
        let _ = self.stop_tx.send(false);
    }

    /// Spawn the dedicated background worker, polling every `interval` for
    /// whatever `targets_provider` currently returns (spec §4.12
    /// "interval from `--latency-interval`").
    pub fn spawn(
        self: &Arc<Self>,
        targets_provider: impl Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = Vec<ProbeTarget>> + Send>>
            + Send
            + Sync
            + 'static,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let mut stop_rx = self.stop_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if *stop_rx.borrow() {
                            continue;
                        }
                        let targets = targets_provider().await;
                        this.probe_all(&targets).await;
                    }
                    _ = stop_rx.changed() => {}
                }
            }
        })
    }

    async fn probe_all(&self, targets: &[ProbeTarget]) {
        for target in targets {
            let sample = self.probe_one(target).await;
            self.samples.write().await.insert(target.profile.clone(), sample);
        }
    }

    #[tracing::instrument(skip(self))]
    async fn probe_one(&self, target: &ProbeTarget) -> LatencySample {
        let timeout_secs = self.timeout.as_secs().max(1).to_string();
        let mut cmd = Command::new("ping");
        cmd.args(["-c", "1", "-W", &timeout_secs, &target.host]);

        match subprocess::run_stdout(&mut cmd, self.timeout + Duration::from_millis(200), Logs::Suppress)
            .await
        {
            Ok(output) => LatencySample {
                profile: target.profile.clone(),
                rtt_ms: parse_rtt_ms(&output),
                reachable: true,
                last_checked_at: Utc::now(),
            },
            Err(_) => LatencySample {
                profile: target.profile.clone(),
                rtt_ms: None,
                reachable: false,
                last_checked_at: Utc::now(),
            },
        }
    }
}

/// Extract the round-trip time from a `ping` summary line such as
/// `rtt min/avg/max/mdev = 12.345/12.345/12.345/0.000 ms`.
fn parse_rtt_ms(output: &str) -> Option<f64> {
    let line = output.lines().find(|l| l.contains("min/avg/max"))?;
    let stats = line.split('=').nth(1)?.trim();
    let avg = stats.split_whitespace().next()?.split('/').nth(1)?;
    avg.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_avg_rtt_from_ping_summary() {
        let output = "PING 1.1.1.1\n1 packets transmitted\nrtt min/avg/max/mdev = 10.1/12.345/15.0/1.2 ms";
        assert_eq!(parse_rtt_ms(output), Some(12.345));
    }

    #[test]
    fn returns_none_when_summary_missing() {
        assert_eq!(parse_rtt_ms("no response"), None);
    }
}

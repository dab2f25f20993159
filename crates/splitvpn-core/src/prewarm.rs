//! DNS pre-warm engine (spec §4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use thiserror::Error;
use tokio::sync::{watch, RwLock};

use splitvpn_types::{Categorized, DomainGroup, EcsProfile, ErrorCategory, ResolverValues};

use crate::compiler::{active_selectors, set_name_pair, PrewarmCache};
use crate::dns::{self, Upstream};

#[derive(Debug, Error)]
pub enum PrewarmError {
    #[error("a pre-warm run is already in progress")]
    RunInProgress,
    #[error("no upstream produced an answer")]
    AllUpstreamsFailed,
}

impl Categorized for PrewarmError {
    fn category(&self) -> ErrorCategory {
        match self {
            PrewarmError::RunInProgress => ErrorCategory::Conflict,
            PrewarmError::AllUpstreamsFailed => ErrorCategory::Dependency,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrewarmStatus {
    pub last_run_at: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_ms: Option<u64>,
    pub in_progress: bool,
    pub last_error: Option<String>,
    pub resolved_count: usize,
}

struct Inner {
    cache: PrewarmCache,
    status: PrewarmStatus,
}

/// Proactive DNS expansion to maximize coverage of CDN addresses (spec §4.3).
pub struct PrewarmEngine {
    parallelism: usize,
    timeout: Duration,
    set_name_prefix: String,
    upstreams: RwLock<Vec<String>>,
    ecs_profiles: RwLock<Vec<EcsProfile>>,
    inner: Arc<RwLock<Inner>>,
    running: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl PrewarmEngine {
    pub fn new(parallelism: usize, timeout: Duration, set_name_prefix: String) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            parallelism: parallelism.max(1),
            timeout,
            set_name_prefix,
            upstreams: RwLock::new(Vec::new()),
            ecs_profiles: RwLock::new(Vec::new()),
            inner: Arc::new(RwLock::new(Inner {
                cache: PrewarmCache::default(),
                status: PrewarmStatus::default(),
            })),
            running: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(AtomicBool::new(false)),
            stop_tx,
            stop_rx,
        }
    }

    /// Pause the background loop (used by backup/restore, spec §4.6).
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Resume the background loop after [`Self::stop`].
    pub fn start_again(&self) {
        let _ = self.stop_tx.send(false);
    }

    /// Start the dedicated periodic background worker (spec §4.3 "Interval
    /// `prewarmIntervalSeconds`"). Mirrors `ResolverScheduler::spawn`'s shape.
    pub fn spawn(
        self: &Arc<Self>,
        groups_provider: impl Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = Vec<DomainGroup>> + Send>>
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
                            tracing::debug!("prewarm engine paused, skipping tick");
                            continue;
                        }
                        let groups = groups_provider().await;
                        if let Err(e) = this.run(&groups).await {
                            tracing::warn!(error = %e, "prewarm run failed");
                        }
                    }
                    _ = stop_rx.changed() => {}
                }
            }
        })
    }

    pub async fn configure(&self, upstreams: Vec<String>, ecs_profiles: Vec<EcsProfile>) {
        *self.upstreams.write().await = upstreams;
        *self.ecs_profiles.write().await = ecs_profiles;
    }

    pub async fn cache(&self) -> PrewarmCache {
        PrewarmCache {
            by_set_name: self.inner.read().await.cache.by_set_name.clone(),
        }
    }

    pub async fn status(&self) -> PrewarmStatus {
        self.inner.read().await.status.clone()
    }

    pub fn cancel_run(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub async fn clear(&self) {
        self.inner.write().await.cache = PrewarmCache::default();
    }

    #[tracing::instrument(skip(self, groups))]
    pub async fn run(&self, groups: &[DomainGroup]) -> Result<(), PrewarmError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PrewarmError::RunInProgress);
        }
        self.cancel.store(false, Ordering::SeqCst);
        let start = std::time::Instant::now();
        let result = self.run_inner(groups).await;
        self.running.store(false, Ordering::SeqCst);

        let mut inner = self.inner.write().await;
        inner.status.last_run_at = Some(chrono::Utc::now());
        inner.status.duration_ms = Some(start.elapsed().as_millis() as u64);
        inner.status.in_progress = false;
        inner.status.last_error = result.as_ref().err().map(|e| e.to_string());
        result
    }

    async fn run_inner(&self, groups: &[DomainGroup]) -> Result<(), PrewarmError> {
        let selectors = active_selectors(groups);
        let domain_selectors: Vec<_> = selectors
            .into_iter()
            .filter(|s| {
                matches!(
                    s.selector_type,
                    splitvpn_types::SelectorType::Domain | splitvpn_types::SelectorType::Wildcard
                )
            })
            .collect();

        let upstreams: Vec<Upstream> = self
            .upstreams
            .read()
            .await
            .iter()
            .filter_map(|raw| Upstream::parse(raw).ok())
            .collect();
        if upstreams.is_empty() {
            return Ok(());
        }

        let ecs_profiles = self.ecs_profiles.read().await.clone();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.parallelism));
        let mut tasks = Vec::new();

        for selector in &domain_selectors {
            // one query per (upstream, ecs profile), plus one with no ECS
            let mut ecs_variants: Vec<Option<IpNetwork>> = vec![None];
            for profile in &ecs_profiles {
                if let Ok(net) = profile.cidr.parse() {
                    ecs_variants.push(Some(net));
                }
            }

            for upstream in &upstreams {
                for ecs in &ecs_variants {
                    if self.cancel.load(Ordering::SeqCst) {
                        break;
                    }
                    let permit = Arc::clone(&semaphore);
                    let upstream = upstream.clone();
                    let domain = selector.key.clone();
                    let timeout = self.timeout;
                    let ecs = *ecs;
                    tasks.push(tokio::spawn(async move {
                        let _permit = permit.acquire_owned().await.ok();
                        dns::resolve(&upstream, &domain, timeout, ecs).await.map(|ips| (domain, ips))
                    }));
                }
            }
        }

        let mut any_success = false;
        let mut resolved_by_domain: HashMap<String, ResolverValues> = HashMap::new();
        for task in tasks {
            if let Ok(Ok((domain, ips))) = task.await {
                any_success = true;
                let entry = resolved_by_domain.entry(domain).or_default();
                for ip in ips {
                    let net = match ip {
                        std::net::IpAddr::V4(v4) => {
                            IpNetwork::V4(ipnetwork::Ipv4Network::new(v4, 32).unwrap())
                        }
                        std::net::IpAddr::V6(v6) => {
                            IpNetwork::V6(ipnetwork::Ipv6Network::new(v6, 128).unwrap())
                        }
                    };
                    entry.insert(net);
                }
            }
        }

        if !any_success && !domain_selectors.is_empty() {
            return Err(PrewarmError::AllUpstreamsFailed);
        }

        let mut inner = self.inner.write().await;
        let mut resolved_count = 0;
        for group in groups {
            for (rule_index, rule) in group.rules.iter().enumerate() {
                let set_names = set_name_pair(&self.set_name_prefix, &group.name, rule_index);
                for domain in rule.exact_domains.iter().chain(rule.wildcard_domains.iter()) {
                    if let Some(values) = resolved_by_domain.get(domain) {
                        resolved_count += 1;
                        inner
                            .cache
                            .by_set_name
                            .entry(set_names.destination_v4.clone())
                            .or_default()
                            .merge(values);
                        inner
                            .cache
                            .by_set_name
                            .entry(set_names.destination_v6.clone())
                            .or_default()
                            .merge(values);
                    }
                }
            }
        }
        inner.status.resolved_count = resolved_count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    /// Spec §4.3 "A run is single-flight (ErrRunInProgress)".
    #[tokio::test]
    async fn run_rejects_while_already_in_progress() {
        let engine = PrewarmEngine::new(4, Duration::from_secs(1), "svpn".to_string());
        engine.running.store(true, Ordering::SeqCst);

        let err = engine.run(&[]).await.unwrap_err();
        assert!(matches!(err, PrewarmError::RunInProgress));
    }

    /// With no upstreams configured, a run with no domain selectors
    /// completes successfully rather than reporting `AllUpstreamsFailed`.
    #[tokio::test]
    async fn run_with_no_upstreams_and_no_selectors_succeeds() {
        let engine = PrewarmEngine::new(4, Duration::from_secs(1), "svpn".to_string());
        engine.run(&[]).await.unwrap();
        assert_eq!(engine.status().await.resolved_count, 0);
    }

    #[tokio::test]
    async fn stop_pauses_and_start_again_resumes() {
        let engine = Arc::new(PrewarmEngine::new(4, Duration::from_secs(1), "svpn".to_string()));
        engine.stop();
        assert!(*engine.stop_rx.borrow());
        engine.start_again();
        assert!(!*engine.stop_rx.borrow());
    }

    #[tokio::test]
    async fn clear_empties_cache() {
        let engine = PrewarmEngine::new(4, Duration::from_secs(1), "svpn".to_string());
        engine
            .inner
            .write()
            .await
            .cache
            .by_set_name
            .insert("svpn_x_r0d4".to_string(), ResolverValues::default());
        engine.clear().await;
        assert!(engine.cache().await.by_set_name.is_empty());
    }
}

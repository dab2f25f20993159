//! Selector -> prefix resolver scheduler (spec §4.2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use reqwest::Client;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::{watch, RwLock};

use splitvpn_types::{
    Categorized, DomainGroup, ErrorCategory, ResolverCacheEntry, ResolverSelector, ResolverValues,
    SelectorType,
};

use crate::asn;
use crate::compiler::active_selectors;
use crate::db;

const KV_RESOLVER_CACHE_KEY: &str = "resolver_cache";
const MAX_ASN_PREVIEW_INPUTS: usize = 64;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("a resolver run is already in progress")]
    RunInProgress,
    #[error("validation error: {0}")]
    Validation(String),
    #[error("resolve failed: {0}")]
    Resolve(String),
    #[error(transparent)]
    Asn(#[from] asn::AsnError),
    #[error(transparent)]
    Db(#[from] db::DbError),
}

impl Categorized for ResolverError {
    fn category(&self) -> ErrorCategory {
        match self {
            ResolverError::RunInProgress => ErrorCategory::Conflict,
            ResolverError::Validation(_) => ErrorCategory::Validation,
            ResolverError::Resolve(_) => ErrorCategory::Dependency,
            ResolverError::Asn(_) => ErrorCategory::Dependency,
            ResolverError::Db(_) => ErrorCategory::Internal,
        }
    }
}

/// Per-category resolve timeouts (spec §4.2 "Per-category timeouts override a default").
#[derive(Debug, Clone)]
pub struct ResolverTimeouts {
    pub default: Duration,
    pub asn: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ResolverStatus {
    pub last_run_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub errors: Vec<String>,
    pub in_progress: bool,
    pub counts_by_type: HashMap<SelectorType, usize>,
}

struct Inner {
    cache: HashMap<ResolverSelector, ResolverCacheEntry>,
    status: ResolverStatus,
}

/// A single dedicated worker that periodically expands every active
/// selector into [`ResolverValues`] and publishes the snapshot atomically.
pub struct ResolverScheduler {
    http: Client,
    db: SqlitePool,
    parallelism: usize,
    timeouts: ResolverTimeouts,
    inner: Arc<RwLock<Inner>>,
    running: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    domain_enabled: bool,
    wildcard_enabled: bool,
    asn_enabled: bool,
}

impl ResolverScheduler {
    pub async fn load(
        db: SqlitePool,
        parallelism: usize,
        timeouts: ResolverTimeouts,
        domain_enabled: bool,
        wildcard_enabled: bool,
        asn_enabled: bool,
    ) -> Result<Self, ResolverError> {
        let cache: HashMap<ResolverSelector, ResolverCacheEntry> =
            db::kv_get::<Vec<ResolverCacheEntry>>(&db, KV_RESOLVER_CACHE_KEY)
                .await?
                .unwrap_or_default()
                .into_iter()
                .map(|entry| (entry.selector.clone(), entry))
                .collect();

        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(Self {
            http: Client::new(),
            db,
            parallelism: parallelism.max(1),
            timeouts,
            inner: Arc::new(RwLock::new(Inner {
                cache,
                status: ResolverStatus::default(),
            })),
            running: Arc::new(AtomicBool::new(false)),
            stop_tx,
            stop_rx,
            domain_enabled,
            wildcard_enabled,
            asn_enabled,
        })
    }

    /// Atomic, lock-free-for-the-copy snapshot of the resolver cache (spec
    /// §5 "single atomic publish").
    pub async fn cache_values(&self) -> HashMap<ResolverSelector, ResolverValues> {
        self.inner
            .read()
            .await
            .cache
            .iter()
            .map(|(k, v)| (k.clone(), v.values.clone()))
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<ResolverCacheEntry> {
        self.inner.read().await.cache.values().cloned().collect()
    }

    /// Replace the whole cache with `entries` and persist it immediately
    /// (spec §4.6 import step 6: "apply groups and resolver snapshot via
    /// `ReplaceState`"). Callers are expected to have paused the scheduler
    /// first via [`Self::stop`].
    pub async fn restore_cache(&self, entries: Vec<ResolverCacheEntry>) -> Result<(), ResolverError> {
        let mut inner = self.inner.write().await;
        inner.cache = entries
            .into_iter()
            .map(|entry| (entry.selector.clone(), entry))
            .collect();
        let snapshot: Vec<ResolverCacheEntry> = inner.cache.values().cloned().collect();
        drop(inner);
        db::kv_put(&self.db, KV_RESOLVER_CACHE_KEY, &snapshot).await?;
        Ok(())
    }

    pub async fn status(&self) -> ResolverStatus {
        self.inner.read().await.status.clone()
    }

    /// Pause the background loop (used by backup/restore, spec §4.6).
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Resume the background loop after [`Self::stop`].
    pub fn start_again(&self) {
        let _ = self.stop_tx.send(false);
    }

    /// Start the dedicated background worker. Returns a join handle the
    /// caller should hold to later abort at shutdown.
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
                            tracing::debug!("resolver scheduler paused, skipping tick");
                            continue;
                        }
                        let groups = groups_provider().await;
                        if let Err(e) = this.run_once(&groups).await {
                            tracing::warn!(error = %e, "resolver run failed");
                        }
                    }
                    _ = stop_rx.changed() => {}
                }
            }
        })
    }

    /// Start an out-of-band run (spec §4.2 "TriggerNow").
    #[tracing::instrument(skip(self, groups))]
    pub async fn trigger_now(&self, groups: &[DomainGroup]) -> Result<(), ResolverError> {
        self.run_once(groups).await
    }

    async fn run_once(&self, groups: &[DomainGroup]) -> Result<(), ResolverError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ResolverError::RunInProgress);
        }
        let start = std::time::Instant::now();
        let result = self.run_once_inner(groups).await;
        self.running.store(false, Ordering::SeqCst);

        let mut inner = self.inner.write().await;
        inner.status.last_run_at = Some(Utc::now());
        inner.status.duration_ms = Some(start.elapsed().as_millis() as u64);
        inner.status.in_progress = false;
        if let Err(ref e) = result {
            inner.status.errors.push(e.to_string());
        } else {
            inner.status.errors.clear();
        }
        result
    }

    async fn run_once_inner(&self, groups: &[DomainGroup]) -> Result<(), ResolverError> {
        let active = active_selectors(groups);
        {
            let mut inner = self.inner.write().await;
            inner.status.in_progress = true;
            let mut counts = HashMap::new();
            for selector in &active {
                *counts.entry(selector.selector_type).or_insert(0) += 1;
            }
            inner.status.counts_by_type = counts;
        }

        let active_set: std::collections::HashSet<_> = active.iter().cloned().collect();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.parallelism));
        let mut tasks = Vec::new();

        for selector in active.clone() {
            if !self.category_enabled(selector.selector_type) {
                continue;
            }
            let permit = Arc::clone(&semaphore);
            let http = self.http.clone();
            let timeout = match selector.selector_type {
                SelectorType::Asn => self.timeouts.asn,
                _ => self.timeouts.default,
            };
            tasks.push(tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.ok();
                let result = resolve_selector(&http, &selector, timeout).await;
                (selector, result)
            }));
        }

        let mut resolved = Vec::new();
        for task in tasks {
            if let Ok(pair) = task.await {
                resolved.push(pair);
            }
        }

        let mut inner = self.inner.write().await;
        for (selector, result) in resolved {
            match result {
                Ok(values) => {
                    inner.cache.insert(
                        selector.clone(),
                        ResolverCacheEntry {
                            selector,
                            values,
                            last_success_at: Some(Utc::now()),
                            error_count: 0,
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(selector = ?selector, error = %e, "resolver selector failed, keeping last-known-good");
                    if let Some(entry) = inner.cache.get_mut(&selector) {
                        entry.error_count += 1;
                    } else {
                        inner.cache.insert(
                            selector.clone(),
                            ResolverCacheEntry {
                                selector,
                                values: ResolverValues::default(),
                                last_success_at: None,
                                error_count: 1,
                            },
                        );
                    }
                }
            }
        }

        // evict selectors no longer active
        inner.cache.retain(|selector, _| active_set.contains(selector));

        let snapshot: Vec<ResolverCacheEntry> = inner.cache.values().cloned().collect();
        drop(inner);

        db::kv_put(&self.db, KV_RESOLVER_CACHE_KEY, &snapshot).await?;
        Ok(())
    }

    fn category_enabled(&self, selector_type: SelectorType) -> bool {
        match selector_type {
            SelectorType::Domain => self.domain_enabled,
            SelectorType::Wildcard => self.wildcard_enabled,
            SelectorType::Asn => self.asn_enabled,
        }
    }

    /// Standalone idempotent ASN preview path (spec §4.2): sanitize inputs,
    /// cap at 64, return per-ASN prefix counts.
    #[tracing::instrument(skip(self))]
    pub async fn asn_preview(
        &self,
        raw_asns: &[String],
    ) -> Result<Vec<AsnPreviewItem>, ResolverError> {
        if raw_asns.len() > MAX_ASN_PREVIEW_INPUTS {
            return Err(ResolverError::Validation(format!(
                "at most {MAX_ASN_PREVIEW_INPUTS} ASNs may be previewed at once"
            )));
        }

        let mut sanitized = Vec::new();
        for raw in raw_asns {
            let cleaned = raw.split('#').next().unwrap_or("").trim();
            if !cleaned.is_empty() {
                sanitized.push(
                    crate::compiler::normalize_asn(cleaned)
                        .map_err(|e| ResolverError::Validation(e.to_string()))?,
                );
            }
        }

        let mut items = Vec::new();
        for asn_str in sanitized {
            let values = asn::lookup_prefixes(&self.http, &asn_str, self.timeouts.asn).await?;
            items.push(AsnPreviewItem {
                asn: asn_str,
                entries_v4: values.v4.len(),
                entries_v6: values.v6.len(),
            });
        }
        Ok(items)
    }
}

#[derive(Debug, Clone)]
pub struct AsnPreviewItem {
    pub asn: String,
    pub entries_v4: usize,
    pub entries_v6: usize,
}

async fn resolve_selector(
    http: &Client,
    selector: &ResolverSelector,
    timeout: Duration,
) -> Result<ResolverValues, ResolverError> {
    match selector.selector_type {
        SelectorType::Domain | SelectorType::Wildcard => {
            resolve_domain(&selector.key, timeout).await
        }
        SelectorType::Asn => Ok(asn::lookup_prefixes(http, &selector.key, timeout).await?),
    }
}

async fn resolve_domain(domain: &str, timeout: Duration) -> Result<ResolverValues, ResolverError> {
    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        .map_err(|e| ResolverError::Resolve(e.to_string()))?;
    let fqdn = format!("{domain}.");
    let lookup = tokio::time::timeout(timeout, resolver.lookup_ip(fqdn))
        .await
        .map_err(|_| ResolverError::Resolve("resolve timed out".to_string()))?
        .map_err(|e| ResolverError::Resolve(e.to_string()))?;

    let mut values = ResolverValues::default();
    for ip in lookup.iter() {
        let net = match ip {
            std::net::IpAddr::V4(v4) => ipnetwork::IpNetwork::V4(
                ipnetwork::Ipv4Network::new(v4, 32).expect("32 is a valid v4 prefix"),
            ),
            std::net::IpAddr::V6(v6) => ipnetwork::IpNetwork::V6(
                ipnetwork::Ipv6Network::new(v6, 128).expect("128 is a valid v6 prefix"),
            ),
        };
        values.insert(net);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    async fn test_scheduler() -> ResolverScheduler {
        let pool = crate::db::test_pool().await;
        ResolverScheduler::load(
            pool,
            4,
            ResolverTimeouts {
                default: Duration::from_secs(1),
                asn: Duration::from_secs(1),
            },
            true,
            true,
            true,
        )
        .await
        .unwrap()
    }

    /// Spec §4.2 "TriggerNow ... if a run is already active it fails with
    /// ErrResolverRunInProgress" (§8 scenario 5).
    #[tokio::test]
    async fn trigger_now_rejects_concurrent_run() {
        let scheduler = test_scheduler().await;
        scheduler.running.store(true, Ordering::SeqCst);

        let err = scheduler.trigger_now(&[]).await.unwrap_err();
        assert!(matches!(err, ResolverError::RunInProgress));

        scheduler.running.store(false, Ordering::SeqCst);
        scheduler.trigger_now(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn asn_preview_caps_at_max_inputs() {
        let scheduler = test_scheduler().await;
        let many: Vec<String> = (0..65).map(|i| format!("AS{i}")).collect();
        let err = scheduler.asn_preview(&many).await.unwrap_err();
        assert!(matches!(err, ResolverError::Validation(_)));
    }

    #[tokio::test]
    async fn asn_preview_sanitizes_and_rejects_garbage() {
        let scheduler = test_scheduler().await;
        let err = scheduler
            .asn_preview(&["garbage".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ResolverError::Validation(_)));
    }

    #[tokio::test]
    async fn restore_cache_replaces_and_persists() {
        let scheduler = test_scheduler().await;
        let selector = ResolverSelector::new(SelectorType::Domain, "example.com");
        let mut values = ResolverValues::default();
        values.insert("1.1.1.1/32".parse().unwrap());
        scheduler
            .restore_cache(vec![ResolverCacheEntry {
                selector: selector.clone(),
                values: values.clone(),
                last_success_at: None,
                error_count: 0,
            }])
            .await
            .unwrap();

        let cached = scheduler.cache_values().await;
        assert_eq!(cached.get(&selector), Some(&values));
    }
}

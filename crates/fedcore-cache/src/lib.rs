//! A concurrent, TTL + LRU-bounded cache of per-user Kubernetes clients,
//! keyed by `(clusterName, userEmail)`, with single-flight creation so a
//! burst of requests for the same key never produces a thundering herd
//! against the Kubernetes API.
//!
//! The single-flight group is built on [`futures::future::Shared`]: the
//! first caller for a key builds a boxed future that runs the factory
//! exactly once and stores its own cleanup; every other caller for the same
//! key clones that `Shared` future and awaits the same poll. This mirrors
//! the teacher's `Arc<RwLock<HashMap<...>>>` shared-state shape in
//! `kaniop_operator::controller::context::ContextData` (the per-object
//! error-backoff cache there), generalized to the map-of-entries-plus-map-
//! of-in-flight-groups shape this cache needs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fedcore_error::{Error, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tunables for expiry and capacity; also the cadence of the background
/// eviction sweep.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10 * 60),
            max_entries: 1000,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Why an entry left the cache, for [`CacheMetrics::record_cache_eviction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Manual,
    Expired,
    Lru,
}

/// The four-method metrics recorder the specification's external-interfaces
/// section describes. The core never picks an exporter backend; the host
/// process supplies an implementation (or accepts [`NoopCacheMetrics`]).
pub trait CacheMetrics: Send + Sync {
    fn record_cache_hit(&self, cluster: &str);
    fn record_cache_miss(&self, cluster: &str);
    fn record_cache_eviction(&self, reason: EvictionReason);
    fn set_cache_size(&self, n: usize);
}

/// A metrics sink that discards everything, used when the host process
/// doesn't wire up a real one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCacheMetrics;

impl CacheMetrics for NoopCacheMetrics {
    fn record_cache_hit(&self, _cluster: &str) {}
    fn record_cache_miss(&self, _cluster: &str) {}
    fn record_cache_eviction(&self, _reason: EvictionReason) {}
    fn set_cache_size(&self, _n: usize) {}
}

/// A cached, per-user Kubernetes client bundle for one cluster.
///
/// `clientset` and `dynamic_client` are kept as distinct fields to match
/// the typed-vs-dynamic split the specification describes, but in this
/// client library both are the same underlying [`kube::Client`] handle —
/// unlike a generated clientset, `kube::Client` already serves both typed
/// `Api<K>` and `Api<DynamicObject>` access, so the two fields are cheap
/// clones of one connection rather than independently constructed clients.
#[derive(Clone)]
pub struct CachedClient {
    pub clientset: kube::Client,
    pub dynamic_client: kube::Client,
    pub rest_config: kube::Config,
    pub cluster_name: String,
    pub user_email: String,
    created_at_nanos: u64,
    expiry_nanos: u64,
    last_accessed_nanos: Arc<AtomicU64>,
}

impl std::fmt::Debug for CachedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedClient")
            .field("cluster_name", &self.cluster_name)
            .field("user_email", &self.user_email)
            .field("created_at_nanos", &self.created_at_nanos)
            .field("expiry_nanos", &self.expiry_nanos)
            .finish_non_exhaustive()
    }
}

impl CachedClient {
    pub fn new(
        clientset: kube::Client,
        dynamic_client: kube::Client,
        rest_config: kube::Config,
        cluster_name: impl Into<String>,
        user_email: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        let now = now_nanos();
        Self {
            clientset,
            dynamic_client,
            rest_config,
            cluster_name: cluster_name.into(),
            user_email: user_email.into(),
            created_at_nanos: now,
            expiry_nanos: now.saturating_add(ttl.as_nanos() as u64),
            last_accessed_nanos: Arc::new(AtomicU64::new(now)),
        }
    }

    pub fn created_at_nanos(&self) -> u64 {
        self.created_at_nanos
    }

    fn is_expired_at(&self, now: u64) -> bool {
        now > self.expiry_nanos
    }

    fn touch(&self, now: u64) {
        self.last_accessed_nanos.store(now, Ordering::Relaxed);
    }

    fn last_accessed(&self) -> u64 {
        self.last_accessed_nanos.load(Ordering::Relaxed)
    }
}

fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

fn cache_key(cluster_name: &str, user_email: &str) -> String {
    format!("{cluster_name}|{user_email}")
}

type FactoryResult = Result<Arc<CachedClient>>;
type SharedFactory = Shared<BoxFuture<'static, FactoryResult>>;

struct Inner {
    config: CacheConfig,
    metrics: Arc<dyn CacheMetrics>,
    entries: RwLock<HashMap<String, Arc<CachedClient>>>,
    inflight: Mutex<HashMap<String, SharedFactory>>,
    closed: AtomicBool,
}

/// The per-user client cache. Cheap to clone: internally an `Arc<Inner>`.
#[derive(Clone)]
pub struct ClientCache {
    inner: Arc<Inner>,
    cleanup_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    cleanup_cancel: CancellationToken,
}

impl ClientCache {
    /// Construct the cache and eagerly spawn its background cleanup task.
    pub fn new(config: CacheConfig, metrics: Arc<dyn CacheMetrics>) -> Self {
        tracing::info!(
            ttl_secs = config.ttl.as_secs(),
            max_entries = config.max_entries,
            cleanup_interval_secs = config.cleanup_interval.as_secs(),
            "client cache initialized"
        );
        let inner = Arc::new(Inner {
            config,
            metrics,
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        let cleanup_cancel = CancellationToken::new();
        let handle = spawn_cleanup_task(Arc::clone(&inner), cleanup_cancel.clone());
        Self {
            inner,
            cleanup_handle: Arc::new(Mutex::new(Some(handle))),
            cleanup_cancel,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(Error::ManagerClosed)
        } else {
            Ok(())
        }
    }

    /// Look up `(cluster_name, user_email)`. Absent or expired is a miss.
    /// Lock-free beyond the read lock itself: only the atomic
    /// `last_accessed` field is mutated on a hit.
    pub async fn get(&self, cluster_name: &str, user_email: &str) -> Option<Arc<CachedClient>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return None;
        }
        let key = cache_key(cluster_name, user_email);
        let now = now_nanos();
        let entries = self.inner.entries.read().await;
        match entries.get(&key) {
            Some(entry) if !entry.is_expired_at(now) => {
                entry.touch(now);
                self.inner.metrics.record_cache_hit(cluster_name);
                tracing::debug!(cluster = cluster_name, "cache hit");
                Some(Arc::clone(entry))
            }
            _ => {
                self.inner.metrics.record_cache_miss(cluster_name);
                tracing::debug!(cluster = cluster_name, "cache miss");
                None
            }
        }
    }

    /// Insert `client`, evicting the least-recently-accessed entry first if
    /// the cache is already at `max_entries`.
    pub async fn set(&self, client: CachedClient) -> Result<Arc<CachedClient>> {
        self.ensure_open()?;
        let key = cache_key(&client.cluster_name, &client.user_email);
        let entry = Arc::new(client);
        let mut entries = self.inner.entries.write().await;
        self.evict_for_capacity(&mut entries, &key);
        entries.insert(key, Arc::clone(&entry));
        self.inner.metrics.set_cache_size(entries.len());
        tracing::debug!(
            cluster = %entry.cluster_name,
            cache_size = entries.len(),
            "cached client stored"
        );
        Ok(entry)
    }

    fn evict_for_capacity(&self, entries: &mut HashMap<String, Arc<CachedClient>>, incoming_key: &str) {
        if entries.contains_key(incoming_key) || entries.len() < self.inner.config.max_entries {
            return;
        }
        if let Some(lru_key) = entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed())
            .map(|(key, _)| key.clone())
        {
            entries.remove(&lru_key);
            self.inner.metrics.record_cache_eviction(EvictionReason::Lru);
            tracing::debug!(key = %lru_key, "evicted least-recently-used cache entry");
        }
    }

    /// Fast-path `get`; on miss, join (or start) a single-flight group for
    /// `key`. `factory` runs at most once per group; every waiter — whether
    /// it arrived before or after the factory started — observes the same
    /// `Ok`/`Err` outcome.
    pub async fn get_or_create<F, Fut>(
        &self,
        cluster_name: &str,
        user_email: &str,
        factory: F,
    ) -> Result<Arc<CachedClient>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<CachedClient>> + Send + 'static,
    {
        self.ensure_open()?;
        if let Some(hit) = self.get(cluster_name, user_email).await {
            return Ok(hit);
        }

        let key = cache_key(cluster_name, user_email);
        let shared = {
            let mut inflight = self.inner.inflight.lock().await;
            match inflight.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let cache = self.clone();
                    let owned_key = key.clone();
                    let cluster_name = cluster_name.to_string();
                    let user_email = user_email.to_string();
                    let fut: BoxFuture<'static, FactoryResult> = Box::pin(async move {
                        // A sibling single-flight group may have populated
                        // the cache between our miss above and now.
                        if let Some(hit) = cache.get(&cluster_name, &user_email).await {
                            cache.inner.inflight.lock().await.remove(&owned_key);
                            return Ok(hit);
                        }
                        let outcome = factory().await;
                        let result = match outcome {
                            Ok(client) => cache.set(client).await,
                            Err(err) => Err(err),
                        };
                        cache.inner.inflight.lock().await.remove(&owned_key);
                        result
                    });
                    let shared = fut.shared();
                    inflight.insert(key, shared.clone());
                    shared
                }
            }
        };

        shared.await
    }

    /// Remove one key; records a `manual` eviction if it was present.
    pub async fn delete(&self, cluster_name: &str, user_email: &str) -> Result<()> {
        self.ensure_open()?;
        let key = cache_key(cluster_name, user_email);
        let mut entries = self.inner.entries.write().await;
        if entries.remove(&key).is_some() {
            self.inner.metrics.record_cache_eviction(EvictionReason::Manual);
            self.inner.metrics.set_cache_size(entries.len());
            tracing::debug!(cluster = cluster_name, "cache entry deleted manually");
        }
        Ok(())
    }

    /// Remove every entry for `cluster_name`, across all users.
    pub async fn delete_by_cluster(&self, cluster_name: &str) -> Result<()> {
        self.ensure_open()?;
        let prefix = format!("{cluster_name}|");
        let mut entries = self.inner.entries.write().await;
        let victims: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        let evicted = victims.len();
        for key in victims {
            entries.remove(&key);
            self.inner.metrics.record_cache_eviction(EvictionReason::Manual);
        }
        self.inner.metrics.set_cache_size(entries.len());
        if evicted > 0 {
            tracing::debug!(cluster = cluster_name, evicted, "cache entries deleted by cluster");
        }
        Ok(())
    }

    /// Current entry count. Always in `[0, max_entries]`.
    pub async fn size(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    /// Idempotent. Stops the cleanup task, clears the map, and marks the
    /// cache closed; every subsequent operation becomes a no-op / miss.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cleanup_cancel.cancel();
        if let Some(handle) = self.cleanup_handle.lock().await.take() {
            let _ = handle.await;
        }
        self.inner.entries.write().await.clear();
        self.inner.inflight.lock().await.clear();
        tracing::info!("client cache closed");
    }
}

fn spawn_cleanup_task(inner: Arc<Inner>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.cleanup_interval);
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let now = now_nanos();
                    let mut entries = inner.entries.write().await;
                    let expired: Vec<String> = entries
                        .iter()
                        .filter(|(_, entry)| entry.is_expired_at(now))
                        .map(|(key, _)| key.clone())
                        .collect();
                    for key in &expired {
                        entries.remove(key);
                        inner.metrics.record_cache_eviction(EvictionReason::Expired);
                    }
                    if !expired.is_empty() {
                        inner.metrics.set_cache_size(entries.len());
                        tracing::debug!(count = expired.len(), "cleanup swept expired cache entries");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client(cluster: &str, user: &str, ttl: Duration) -> CachedClient {
        let rest_config = kube::Config::new("https://127.0.0.1:6443".parse().unwrap());
        let client = kube::Client::try_from(rest_config.clone()).unwrap();
        CachedClient::new(client.clone(), client, rest_config, cluster, user, ttl)
    }

    #[tokio::test]
    async fn fresh_cache_is_a_miss() {
        let cache = ClientCache::new(CacheConfig::default(), Arc::new(NoopCacheMetrics));
        assert!(cache.get("c", "u@x.com").await.is_none());
    }

    #[tokio::test]
    async fn set_then_get_is_a_hit() {
        let cache = ClientCache::new(CacheConfig::default(), Arc::new(NoopCacheMetrics));
        cache
            .set(test_client("c", "u@x.com", Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(cache.get("c", "u@x.com").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let cache = ClientCache::new(CacheConfig::default(), Arc::new(NoopCacheMetrics));
        cache
            .set(test_client("c", "u@x.com", Duration::from_secs(300)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(360)).await;
        assert!(cache.get("c", "u@x.com").await.is_none());
    }

    #[tokio::test]
    async fn lru_eviction_at_capacity() {
        let config = CacheConfig {
            max_entries: 3,
            ..CacheConfig::default()
        };
        let cache = ClientCache::new(config, Arc::new(NoopCacheMetrics));
        cache.set(test_client("c1", "u", Duration::from_secs(60))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.set(test_client("c2", "u", Duration::from_secs(60))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.set(test_client("c3", "u", Duration::from_secs(60))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Touch c1 so c2 becomes the least-recently-accessed entry.
        assert!(cache.get("c1", "u").await.is_some());
        tokio::time::sleep(Duration::from_millis(5)).await;

        cache.set(test_client("c4", "u", Duration::from_secs(60))).await.unwrap();

        assert!(cache.get("c2", "u").await.is_none());
        assert!(cache.get("c1", "u").await.is_some());
        assert!(cache.get("c3", "u").await.is_some());
        assert!(cache.get("c4", "u").await.is_some());
        assert_eq!(cache.size().await, 3);
    }

    #[tokio::test]
    async fn get_or_create_invokes_factory_once_on_repeat_calls() {
        let cache = ClientCache::new(CacheConfig::default(), Arc::new(NoopCacheMetrics));
        let calls = Arc::new(AtomicU64::new(0));

        let build = {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(test_client("c", "u@x.com", Duration::from_secs(60)))
                }
            }
        };
        let first = cache.get_or_create("c", "u@x.com", build.clone()).await.unwrap();
        let second = cache.get_or_create("c", "u@x.com", build).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn concurrent_get_or_create_single_flights_the_factory() {
        let cache = Arc::new(ClientCache::new(CacheConfig::default(), Arc::new(NoopCacheMetrics)));
        let calls = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_create("c", "u@x.com", move || {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(test_client("c", "u@x.com", Duration::from_secs(60)))
                        }
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delete_removes_a_single_key() {
        let cache = ClientCache::new(CacheConfig::default(), Arc::new(NoopCacheMetrics));
        cache.set(test_client("c", "u@x.com", Duration::from_secs(60))).await.unwrap();
        cache.delete("c", "u@x.com").await.unwrap();
        assert!(cache.get("c", "u@x.com").await.is_none());
    }

    #[tokio::test]
    async fn delete_by_cluster_removes_every_user() {
        let cache = ClientCache::new(CacheConfig::default(), Arc::new(NoopCacheMetrics));
        cache.set(test_client("c", "a@x.com", Duration::from_secs(60))).await.unwrap();
        cache.set(test_client("c", "b@x.com", Duration::from_secs(60))).await.unwrap();
        cache.set(test_client("other", "a@x.com", Duration::from_secs(60))).await.unwrap();
        cache.delete_by_cluster("c").await.unwrap();
        assert!(cache.get("c", "a@x.com").await.is_none());
        assert!(cache.get("c", "b@x.com").await.is_none());
        assert!(cache.get("other", "a@x.com").await.is_some());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_further_writes() {
        let cache = ClientCache::new(CacheConfig::default(), Arc::new(NoopCacheMetrics));
        cache.set(test_client("c", "u@x.com", Duration::from_secs(60))).await.unwrap();
        cache.close().await;
        cache.close().await;
        assert!(cache.get("c", "u@x.com").await.is_none());
        assert!(matches!(
            cache.set(test_client("c", "u@x.com", Duration::from_secs(60))).await,
            Err(Error::ManagerClosed)
        ));
    }

    #[tokio::test]
    async fn size_never_exceeds_capacity() {
        let config = CacheConfig {
            max_entries: 5,
            ..CacheConfig::default()
        };
        let cache = ClientCache::new(config, Arc::new(NoopCacheMetrics));
        for i in 0..20 {
            cache
                .set(test_client(&format!("c{i}"), "u@x.com", Duration::from_secs(60)))
                .await
                .unwrap();
        }
        assert!(cache.size().await <= 5);
    }
}

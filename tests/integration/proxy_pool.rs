use async_trait::async_trait;
use chrono::Duration;
use imobi_core::Result;
use imobi_scrapers::{
    ProxyPoolConfig, ProxyPoolManager, ProxyProvider, ProxyRecord, ReplacementQuota,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

struct FakeProvider {
    proxies: Mutex<Vec<ProxyRecord>>,
    quota: Mutex<ReplacementQuota>,
    replacement_calls: AtomicU64,
    on_demand_calls: AtomicU64,
}

impl FakeProvider {
    fn new(proxies: Vec<ProxyRecord>, quota: ReplacementQuota) -> Arc<Self> {
        Arc::new(Self {
            proxies: Mutex::new(proxies),
            quota: Mutex::new(quota),
            replacement_calls: AtomicU64::new(0),
            on_demand_calls: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl ProxyProvider for FakeProvider {
    async fn list_proxies(&self) -> Result<Vec<ProxyRecord>> {
        Ok(self.proxies.lock().unwrap().clone())
    }

    async fn request_replacement(&self, _remote_id: &str, _reason: &str) -> Result<bool> {
        self.replacement_calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn quota_status(&self) -> Result<ReplacementQuota> {
        Ok(*self.quota.lock().unwrap())
    }

    async fn request_on_demand_refresh(&self) -> Result<bool> {
        self.on_demand_calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

fn record(address: &str) -> ProxyRecord {
    ProxyRecord {
        address: address.to_string(),
        username: "user".to_string(),
        password: "pass".to_string(),
        remote_id: format!("r-{}", address),
        country_code: "RO".to_string(),
    }
}

fn fast_config() -> ProxyPoolConfig {
    ProxyPoolConfig {
        quarantine_tiers: [
            Duration::milliseconds(40),
            Duration::milliseconds(80),
            Duration::milliseconds(120),
        ],
        on_demand_cooldown: Duration::seconds(300),
        ..ProxyPoolConfig::default()
    }
}

fn quota(limit: u64, used: u64) -> ReplacementQuota {
    ReplacementQuota {
        limit,
        used,
        reset_date: None,
    }
}

#[tokio::test]
async fn test_pools_stay_disjoint() {
    let provider = FakeProvider::new(
        vec![record("a:1"), record("b:2"), record("c:3")],
        quota(10, 0),
    );
    let pool = ProxyPoolManager::new(provider, fast_config());
    pool.refresh().await.unwrap();
    pool.check_quota().await;

    pool.record_failure("a:1", 429).await;
    pool.record_failure("b:2", 407).await;

    // Every address sits in exactly one pool.
    assert_eq!(pool.active_count(), 1);
    assert!(pool.is_quarantined("a:1"));
    assert!(!pool.is_blacklisted("a:1"));
    assert!(pool.is_blacklisted("b:2"));
    assert!(!pool.is_quarantined("b:2"));
    assert!(!pool.is_quarantined("c:3"));
    assert!(!pool.is_blacklisted("c:3"));
}

#[tokio::test]
async fn test_quarantined_proxy_returns_after_duration() {
    let provider = FakeProvider::new(vec![record("a:1"), record("b:2")], quota(10, 0));
    let pool = ProxyPoolManager::new(provider, fast_config());
    pool.refresh().await.unwrap();

    pool.record_failure("a:1", 429).await;
    assert!(pool.is_quarantined("a:1"));
    assert_eq!(pool.active_count(), 1);

    // Severity 1 is 40ms in the test config.
    tokio::time::sleep(std::time::Duration::from_millis(70)).await;
    pool.select_proxy().await.unwrap();

    assert!(!pool.is_quarantined("a:1"));
    assert_eq!(pool.active_count(), 2);
}

#[tokio::test]
async fn test_empty_refresh_preserves_active_pool() {
    let provider = FakeProvider::new(vec![record("a:1"), record("b:2")], quota(10, 0));
    let pool = ProxyPoolManager::new(provider.clone(), fast_config());
    pool.refresh().await.unwrap();
    assert_eq!(pool.active_count(), 2);

    provider.proxies.lock().unwrap().clear();
    pool.refresh().await.unwrap();

    assert_eq!(pool.active_count(), 2);
}

#[tokio::test]
async fn test_replacement_quota_is_never_exceeded() {
    let provider = FakeProvider::new(
        vec![record("a:1"), record("b:2"), record("c:3"), record("d:4")],
        quota(1, 0),
    );
    let pool = ProxyPoolManager::new(provider.clone(), fast_config());
    pool.refresh().await.unwrap();
    pool.check_quota().await;

    // Three proxies each earn a replacement-worthy double block.
    for address in ["a:1", "b:2", "c:3"] {
        pool.record_failure(address, 403).await;
        pool.record_failure(address, 403).await;
    }

    assert_eq!(provider.replacement_calls.load(Ordering::SeqCst), 1);
    let quota = pool.quota();
    assert!(quota.used <= quota.limit);
    assert_eq!(quota.used, 1);
}

#[tokio::test]
async fn test_emergency_recovery_force_releases_soonest() {
    let provider = FakeProvider::new(vec![record("a:1")], quota(10, 0));
    let pool = ProxyPoolManager::new(provider, fast_config());
    pool.refresh().await.unwrap();

    pool.record_failure("a:1", 429).await;
    assert_eq!(pool.active_count(), 0);
    assert_eq!(pool.quarantined_count(), 1);

    // The quarantine timer has not expired; emergency recovery overrides it.
    let recovered = pool.select_proxy().await.expect("recovery expected");
    assert_eq!(recovered.address, "a:1");
    assert_eq!(pool.active_count(), 1);
    assert_eq!(pool.quarantined_count(), 0);
}

#[tokio::test]
async fn test_exhausted_provider_yields_none_and_respects_cooldown() {
    let provider = FakeProvider::new(Vec::new(), quota(10, 0));
    let pool = ProxyPoolManager::new(provider.clone(), fast_config());
    let _ = pool.refresh().await;

    assert!(pool.select_proxy().await.is_none());
    assert_eq!(provider.on_demand_calls.load(Ordering::SeqCst), 1);

    // Within the cooldown no second on-demand refresh goes out.
    assert!(pool.select_proxy().await.is_none());
    assert_eq!(provider.on_demand_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_summary_counts() {
    let provider = FakeProvider::new(
        vec![record("a:1"), record("b:2"), record("c:3")],
        quota(20, 5),
    );
    let pool = ProxyPoolManager::new(provider, fast_config());
    pool.refresh().await.unwrap();
    pool.check_quota().await;

    pool.record_success("a:1", Some(0.5));
    pool.record_failure("b:2", 429).await;

    let summary = pool.summary();
    assert_eq!(summary.active_count, 2);
    assert_eq!(summary.quarantine_count, 1);
    assert_eq!(summary.blacklist_count, 0);
    assert_eq!(summary.quota_remaining, 15);
    assert_eq!(summary.top_proxies[0].address, "a:1");
}

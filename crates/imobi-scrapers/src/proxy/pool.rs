use super::{
    ProxyMetrics, ProxyPoolConfig, ProxyProvider, ProxyRecord, QuarantineLedger, ReplacementQuota,
};
use chrono::{DateTime, Utc};
use imobi_core::Result;
use parking_lot::Mutex;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Relative sampling weights for the ranked selection tiers.
const TIER_WEIGHTS: (u64, u64, u64) = (5, 3, 1);

struct PoolState {
    active: Vec<ProxyRecord>,
    quarantine: QuarantineLedger,
    blacklist: HashSet<String>,
    metrics: HashMap<String, ProxyMetrics>,
    quota: ReplacementQuota,
    last_refresh: Option<DateTime<Utc>>,
    /// When set, a post-replacement refresh is due at this time.
    refresh_due: Option<DateTime<Utc>>,
    last_on_demand: Option<DateTime<Utc>>,
    selections: u64,
}

struct ReplacementTicket {
    address: String,
    remote_id: String,
    reason: &'static str,
}

/// Health summary of one proxy, for the close-of-run report.
#[derive(Debug, Clone)]
pub struct TopProxy {
    pub address: String,
    pub success_rate: f64,
    pub success_count: u64,
    pub failure_count: u64,
}

/// Pool snapshot published at spider-close time.
#[derive(Debug, Clone)]
pub struct PoolSummary {
    pub active_count: usize,
    pub quarantine_count: usize,
    pub blacklist_count: usize,
    pub quota_remaining: u64,
    pub top_proxies: Vec<TopProxy>,
}

impl std::fmt::Display for PoolSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "proxy pool: {} active, {} quarantined, {} blacklisted, {} replacements left",
            self.active_count, self.quarantine_count, self.blacklist_count, self.quota_remaining
        )?;
        for proxy in &self.top_proxies {
            writeln!(
                f,
                "  {} - {:.1}% ({} ok / {} failed)",
                proxy.address,
                proxy.success_rate * 100.0,
                proxy.success_count,
                proxy.failure_count
            )?;
        }
        Ok(())
    }
}

/// Self-healing pool of rotating proxies.
///
/// All pool state lives behind one mutex; provider I/O happens outside it so
/// a slow provider round trip never blocks proxy selection. Callers must
/// report every fetch outcome exactly once through [`record_success`] /
/// [`record_failure`] or health scores stop converging.
///
/// [`record_success`]: ProxyPoolManager::record_success
/// [`record_failure`]: ProxyPoolManager::record_failure
pub struct ProxyPoolManager {
    provider: Arc<dyn ProxyProvider>,
    config: ProxyPoolConfig,
    state: Mutex<PoolState>,
}

impl ProxyPoolManager {
    pub fn new(provider: Arc<dyn ProxyProvider>, config: ProxyPoolConfig) -> Self {
        let quarantine = QuarantineLedger::new(config.quarantine_tiers);
        Self {
            provider,
            config,
            state: Mutex::new(PoolState {
                active: Vec::new(),
                quarantine,
                blacklist: HashSet::new(),
                metrics: HashMap::new(),
                quota: ReplacementQuota::default(),
                last_refresh: None,
                refresh_due: None,
                last_on_demand: None,
                selections: 0,
            }),
        }
    }

    /// Pull a fresh list from the provider and replace the active pool with
    /// every candidate that is not blacklisted.
    ///
    /// A failed or empty pull leaves the previous pool intact; quarantine is
    /// cleared and metrics reset only when the provider actually delivered.
    /// Returns the active pool size after the call.
    pub async fn refresh(&self) -> Result<usize> {
        let candidates = match self.provider.list_proxies().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "proxy refresh failed; keeping previous pool");
                let mut state = self.state.lock();
                state.last_refresh = Some(Utc::now());
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        state.last_refresh = Some(Utc::now());
        state.refresh_due = None;

        if candidates.is_empty() {
            warn!(
                active = state.active.len(),
                "provider returned no proxies; keeping previous pool"
            );
            return Ok(state.active.len());
        }

        let fresh: Vec<ProxyRecord> = candidates
            .into_iter()
            .filter(|record| !state.blacklist.contains(&record.address))
            .collect();
        state.active = fresh;
        state.quarantine.clear();
        state.metrics.clear();

        info!(
            active = state.active.len(),
            blacklisted = state.blacklist.len(),
            "proxy pool refreshed"
        );
        Ok(state.active.len())
    }

    pub fn should_refresh(&self) -> bool {
        let state = self.state.lock();
        let now = Utc::now();

        if let Some(due) = state.refresh_due {
            if due <= now {
                return true;
            }
        }
        match state.last_refresh {
            None => true,
            Some(last) => now - last >= self.config.refresh_interval,
        }
    }

    /// Hand out a proxy for one outbound fetch.
    ///
    /// Runs quarantine recovery first, then tiered weighted sampling over the
    /// active pool. An empty pool triggers the emergency recovery cascade;
    /// `None` means even that failed and the caller should skip this request.
    pub async fn select_proxy(&self) -> Option<ProxyRecord> {
        let (check_refresh, check_quota) = {
            let mut state = self.state.lock();
            state.selections += 1;
            let selections = state.selections;
            (
                selections % self.config.refresh_check_every == 0,
                selections % self.config.quota_check_every == 0,
            )
        };

        if check_refresh && self.should_refresh() {
            // Failure is already logged and non-fatal: the old pool stays.
            let _ = self.refresh().await;
        }
        if check_quota {
            self.check_quota().await;
        }

        {
            let mut state = self.state.lock();
            let now = Utc::now();
            Self::recover_quarantined_locked(&mut state, now);
            if !state.active.is_empty() {
                return Self::pick_locked(&state, self.config.min_pool_for_tiering);
            }
        }

        warn!("active proxy pool is empty; starting emergency recovery");
        self.emergency_recovery().await
    }

    /// Report a successful fetch through a proxy.
    pub fn record_success(&self, address: &str, response_time_secs: Option<f64>) {
        let mut state = self.state.lock();
        let metrics = state.metrics.entry(address.to_string()).or_default();
        metrics.record_success(Utc::now());
        if let Some(seconds) = response_time_secs {
            metrics.push_response_time(seconds);
        }
    }

    /// Report a failed fetch. `status_code` 0 stands for transport-level
    /// errors with no HTTP response.
    pub async fn record_failure(&self, address: &str, status_code: u16) {
        let ticket = {
            let mut state = self.state.lock();
            let now = Utc::now();
            match status_code {
                403 => {
                    let blocked = {
                        let metrics = state.metrics.entry(address.to_string()).or_default();
                        metrics.record_block(now);
                        metrics.blocked_count
                    };
                    warn!(proxy = address, blocked, "proxy blocked by target site");
                    Self::quarantine_locked(&mut state, address, blocked, now);
                    if blocked >= 2 {
                        Self::replacement_ticket_locked(&state, address, "blocked")
                    } else {
                        None
                    }
                }
                407 => {
                    // The proxy itself rejected our credentials; it is not
                    // coming back. No quarantine step.
                    warn!(proxy = address, "proxy authentication failed; blacklisting");
                    let ticket = Self::replacement_ticket_locked(&state, address, "auth_failed");
                    Self::blacklist_locked(&mut state, address);
                    ticket
                }
                429 | 503 => {
                    state
                        .metrics
                        .entry(address.to_string())
                        .or_default()
                        .record_failure(now);
                    debug!(proxy = address, status_code, "proxy rate limited; short quarantine");
                    Self::quarantine_locked(&mut state, address, 1, now);
                    None
                }
                _ => {
                    let failures = {
                        let metrics = state.metrics.entry(address.to_string()).or_default();
                        metrics.record_failure(now);
                        metrics.failure_count
                    };
                    if failures >= self.config.max_other_failures {
                        debug!(
                            proxy = address,
                            failures, "proxy failing repeatedly; quarantining"
                        );
                        Self::quarantine_locked(&mut state, address, 2, now);
                    }
                    None
                }
            }
        };

        if let Some(ticket) = ticket {
            self.request_replacement(ticket).await;
        }
    }

    fn quarantine_locked(state: &mut PoolState, address: &str, severity: u64, now: DateTime<Utc>) {
        if let Some(position) = state.active.iter().position(|r| r.address == address) {
            let record = state.active.remove(position);
            info!(proxy = address, severity, "quarantining proxy");
            state.quarantine.insert(record, severity, now);
        } else if state.quarantine.contains(address) {
            state.quarantine.escalate(address, severity, now);
        }
        // Blacklisted or unknown addresses have nothing to quarantine.
    }

    fn blacklist_locked(state: &mut PoolState, address: &str) {
        state.active.retain(|record| record.address != address);
        state.quarantine.remove(address);
        state.blacklist.insert(address.to_string());
    }

    fn recover_quarantined_locked(state: &mut PoolState, now: DateTime<Utc>) {
        for record in state.quarantine.release_due(now) {
            info!(proxy = %record.address, "quarantine expired; reinstating proxy");
            state
                .metrics
                .entry(record.address.clone())
                .or_default()
                .halve_blocked_count();
            state.active.push(record);
        }
    }

    /// Tiered weighted sampling over the active pool, ranked by empirical
    /// success rate: the top 20% draws with weight 5, the next 30% with
    /// weight 3, the remainder with weight 1. Small pools fall back to a
    /// uniform draw since ranking noise would dominate.
    fn pick_locked(state: &PoolState, min_pool_for_tiering: usize) -> Option<ProxyRecord> {
        let n = state.active.len();
        if n == 0 {
            return None;
        }

        let mut rng = rand::thread_rng();
        if n < min_pool_for_tiering {
            let index = rng.gen_range(0..n);
            return Some(state.active[index].clone());
        }

        let mut ranked: Vec<(usize, f64)> = state
            .active
            .iter()
            .enumerate()
            .map(|(index, record)| {
                let rate = state
                    .metrics
                    .get(&record.address)
                    .map(|m| m.success_rate())
                    .unwrap_or(0.5);
                (index, rate)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

        let top_end = ((n as f64) * 0.2).ceil() as usize;
        let mid_end = ((n as f64) * 0.5).ceil() as usize;

        let mut cumulative = Vec::with_capacity(n);
        let mut total = 0u64;
        for rank in 0..n {
            total += if rank < top_end {
                TIER_WEIGHTS.0
            } else if rank < mid_end {
                TIER_WEIGHTS.1
            } else {
                TIER_WEIGHTS.2
            };
            cumulative.push(total);
        }

        let draw = rng.gen_range(0..total);
        let position = cumulative.partition_point(|&c| c <= draw);
        let (index, _) = ranked[position];
        Some(state.active[index].clone())
    }

    /// Recovery cascade for an empty active pool: force-release the soonest
    /// quarantine entry, then an on-demand provider refresh (cooldown
    /// permitting), then clear the blacklist and refresh as a last resort.
    pub async fn emergency_recovery(&self) -> Option<ProxyRecord> {
        {
            let mut state = self.state.lock();
            if let Some(record) = state.quarantine.force_release_soonest() {
                warn!(proxy = %record.address, "emergency recovery: force-releasing quarantined proxy");
                state
                    .metrics
                    .entry(record.address.clone())
                    .or_default()
                    .halve_blocked_count();
                state.active.push(record.clone());
                return Some(record);
            }
        }

        let cooldown_passed = {
            let mut state = self.state.lock();
            let now = Utc::now();
            let passed = state
                .last_on_demand
                .map_or(true, |last| now - last >= self.config.on_demand_cooldown);
            if passed {
                state.last_on_demand = Some(now);
            }
            passed
        };

        if cooldown_passed {
            info!("emergency recovery: requesting on-demand proxy refresh");
            match self.provider.request_on_demand_refresh().await {
                Ok(true) => {
                    let _ = self.refresh().await;
                }
                Ok(false) => warn!("provider declined on-demand refresh"),
                Err(e) => warn!(error = %e, "on-demand refresh failed"),
            }

            let state = self.state.lock();
            if !state.active.is_empty() {
                return Self::pick_locked(&state, self.config.min_pool_for_tiering);
            }
        }

        {
            let mut state = self.state.lock();
            if !state.blacklist.is_empty() {
                warn!(
                    count = state.blacklist.len(),
                    "emergency recovery: clearing blacklist"
                );
                state.blacklist.clear();
            }
        }
        let _ = self.refresh().await;

        let state = self.state.lock();
        Self::pick_locked(&state, self.config.min_pool_for_tiering)
    }

    /// Refresh the local quota mirror from the provider.
    pub async fn check_quota(&self) {
        match self.provider.quota_status().await {
            Ok(quota) => {
                let mut state = self.state.lock();
                state.quota = quota;
                debug!(
                    used = quota.used,
                    limit = quota.limit,
                    "replacement quota updated"
                );
            }
            Err(e) => warn!(error = %e, "quota status check failed"),
        }
    }

    fn replacement_ticket_locked(
        state: &PoolState,
        address: &str,
        reason: &'static str,
    ) -> Option<ReplacementTicket> {
        let record = state
            .active
            .iter()
            .find(|r| r.address == address)
            .or_else(|| state.quarantine.get(address).map(|entry| &entry.record))?;

        Some(ReplacementTicket {
            address: address.to_string(),
            remote_id: record.remote_id.clone(),
            reason,
        })
    }

    async fn request_replacement(&self, ticket: ReplacementTicket) -> bool {
        {
            let state = self.state.lock();
            if state.quota.exhausted() {
                warn!(
                    proxy = %ticket.address,
                    used = state.quota.used,
                    limit = state.quota.limit,
                    "replacement quota exhausted; skipping request"
                );
                return false;
            }
        }

        match self
            .provider
            .request_replacement(&ticket.remote_id, ticket.reason)
            .await
        {
            Ok(true) => {
                let mut state = self.state.lock();
                if state.quota.exhausted() {
                    // A concurrent replacement consumed the last slot while
                    // ours was in flight.
                    return false;
                }
                state.quota.used += 1;
                Self::blacklist_locked(&mut state, &ticket.address);
                state.refresh_due = Some(Utc::now() + self.config.replacement_provision_delay);
                info!(
                    proxy = %ticket.address,
                    used = state.quota.used,
                    "replacement requested; refresh scheduled"
                );
                true
            }
            Ok(false) => {
                warn!(proxy = %ticket.address, "provider declined replacement");
                false
            }
            Err(e) => {
                warn!(proxy = %ticket.address, error = %e, "replacement request failed");
                false
            }
        }
    }

    pub fn summary(&self) -> PoolSummary {
        let state = self.state.lock();
        let mut top: Vec<TopProxy> = state
            .metrics
            .iter()
            .filter(|(_, m)| m.success_count + m.failure_count > 0)
            .map(|(address, m)| TopProxy {
                address: address.clone(),
                success_rate: m.success_rate(),
                success_count: m.success_count,
                failure_count: m.failure_count,
            })
            .collect();
        top.sort_by(|a, b| {
            b.success_rate
                .partial_cmp(&a.success_rate)
                .unwrap_or(Ordering::Equal)
        });
        top.truncate(5);

        PoolSummary {
            active_count: state.active.len(),
            quarantine_count: state.quarantine.len(),
            blacklist_count: state.blacklist.len(),
            quota_remaining: state.quota.remaining(),
            top_proxies: top,
        }
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn quarantined_count(&self) -> usize {
        self.state.lock().quarantine.len()
    }

    pub fn blacklisted_count(&self) -> usize {
        self.state.lock().blacklist.len()
    }

    pub fn is_quarantined(&self, address: &str) -> bool {
        self.state.lock().quarantine.contains(address)
    }

    pub fn is_blacklisted(&self, address: &str) -> bool {
        self.state.lock().blacklist.contains(address)
    }

    pub fn quota(&self) -> ReplacementQuota {
        self.state.lock().quota
    }
}

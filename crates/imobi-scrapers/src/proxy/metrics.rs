use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Ring-buffer capacity for per-proxy response time samples.
const RESPONSE_TIME_CAPACITY: usize = 100;

/// Rolling health counters for one proxy address. Reset only on an explicit
/// pool refresh.
#[derive(Debug, Clone, Default)]
pub struct ProxyMetrics {
    pub success_count: u64,
    pub failure_count: u64,
    /// 403-class failures specifically.
    pub blocked_count: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    response_times: VecDeque<f64>,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.success_count += 1;
        self.last_success_at = Some(now);
        // Transient penalties self-heal one step per success.
        self.blocked_count = self.blocked_count.saturating_sub(1);
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failure_count += 1;
        self.last_failure_at = Some(now);
    }

    pub fn record_block(&mut self, now: DateTime<Utc>) {
        self.blocked_count += 1;
        self.last_failure_at = Some(now);
    }

    pub fn push_response_time(&mut self, seconds: f64) {
        if self.response_times.len() == RESPONSE_TIME_CAPACITY {
            self.response_times.pop_front();
        }
        self.response_times.push_back(seconds);
    }

    /// Empirical success ratio; unseen proxies get a neutral 0.5 prior so
    /// they are explored instead of being ranked last.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.5
        } else {
            self.success_count as f64 / total as f64
        }
    }

    pub fn avg_response_time(&self) -> Option<f64> {
        if self.response_times.is_empty() {
            return None;
        }
        Some(self.response_times.iter().sum::<f64>() / self.response_times.len() as f64)
    }

    /// Applied when a proxy returns from quarantine: a fresh-ish start.
    pub fn halve_blocked_count(&mut self) {
        self.blocked_count /= 2;
    }
}

use super::ProxyRecord;
use async_trait::async_trait;
use chrono::NaiveDate;
use imobi_core::{ImobiError, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

/// Mirror of the provider-side replacement budget. `used` only grows until
/// the provider resets it server-side; we learn about the reset through a
/// fresh quota status call, never by computing it locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplacementQuota {
    pub limit: u64,
    pub used: u64,
    pub reset_date: Option<NaiveDate>,
}

impl ReplacementQuota {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    pub fn exhausted(&self) -> bool {
        self.used >= self.limit
    }
}

/// Upstream proxy provider operations consumed by the pool manager. The
/// manager performs no other network I/O.
#[async_trait]
pub trait ProxyProvider: Send + Sync {
    /// Current proxy list. An empty list is a valid (degraded) answer.
    async fn list_proxies(&self) -> Result<Vec<ProxyRecord>>;

    /// Ask for one proxy to be swapped out. `Ok(true)` means the provider
    /// accepted the request; provisioning happens asynchronously on their
    /// side.
    async fn request_replacement(&self, remote_id: &str, reason: &str) -> Result<bool>;

    async fn quota_status(&self) -> Result<ReplacementQuota>;

    /// Out-of-band full-list refresh. Rate limited client-side by the pool.
    async fn request_on_demand_refresh(&self) -> Result<bool>;
}

const API_TIMEOUT: Duration = Duration::from_secs(10);
const PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
struct ProxyListResponse {
    results: Vec<ProxyListEntry>,
}

#[derive(Debug, Deserialize)]
struct ProxyListEntry {
    id: String,
    username: String,
    password: String,
    proxy_address: String,
    port: u16,
    valid: bool,
    #[serde(default)]
    country_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionResponse {
    proxy_replacements_total: u64,
    proxy_replacements_used: u64,
    #[serde(default)]
    reset_date: Option<NaiveDate>,
}

/// Webshare API client. Token auth, JSON end to end.
pub struct WebshareClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl WebshareClient {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(API_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.api_key)
    }
}

#[async_trait]
impl ProxyProvider for WebshareClient {
    async fn list_proxies(&self) -> Result<Vec<ProxyRecord>> {
        let url = format!("{}/proxy/list/", self.api_url);
        let page_size = PAGE_SIZE.to_string();
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .query(&[("mode", "direct"), ("page_size", page_size.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "proxy list request failed");
            return Err(ImobiError::Scraping(format!(
                "proxy list request returned {}",
                response.status()
            )));
        }

        let parsed: ProxyListResponse = response.json().await?;
        let records: Vec<ProxyRecord> = parsed
            .results
            .into_iter()
            .filter(|entry| entry.valid)
            .map(|entry| ProxyRecord {
                address: format!("{}:{}", entry.proxy_address, entry.port),
                username: entry.username,
                password: entry.password,
                remote_id: entry.id,
                country_code: entry.country_code.unwrap_or_else(|| "ZZ".to_string()),
            })
            .collect();

        info!(count = records.len(), "fetched proxy list from provider");
        Ok(records)
    }

    async fn request_replacement(&self, remote_id: &str, reason: &str) -> Result<bool> {
        let url = format!("{}/proxy/replace/", self.api_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(&serde_json::json!({ "proxy": remote_id, "reason": reason }))
            .send()
            .await?;

        let accepted = response.status().is_success();
        if accepted {
            info!(remote_id, reason, "proxy replacement accepted by provider");
        } else {
            warn!(remote_id, status = %response.status(), "proxy replacement rejected");
        }
        Ok(accepted)
    }

    async fn quota_status(&self) -> Result<ReplacementQuota> {
        let url = format!("{}/subscription/", self.api_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await?
            .error_for_status()?;

        let parsed: SubscriptionResponse = response.json().await?;
        Ok(ReplacementQuota {
            limit: parsed.proxy_replacements_total,
            used: parsed.proxy_replacements_used,
            reset_date: parsed.reset_date,
        })
    }

    async fn request_on_demand_refresh(&self) -> Result<bool> {
        let url = format!("{}/proxy/list/refresh/", self.api_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        Ok(response.status().is_success())
    }
}

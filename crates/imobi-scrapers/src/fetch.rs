use crate::proxy::ProxyRecord;
use async_trait::async_trait;
use imobi_core::Result;
use parking_lot::Mutex;
use reqwest::redirect::Policy;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const MAX_REDIRECTS: usize = 10;

/// What came back from fetching one URL, redirects already followed.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status_code: u16,
    pub body: String,
    pub requested_url: String,
    pub final_url: String,
    pub redirect_chain: Vec<String>,
}

impl PageResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn was_redirected(&self) -> bool {
        !self.redirect_chain.is_empty() || self.final_url != self.requested_url
    }
}

/// Boundary to whatever performs the actual HTTP round trip. The proxy pool
/// never fetches anything itself; it only hands records to callers of this.
#[async_trait]
pub trait FetchExecutor: Send + Sync {
    async fn fetch(&self, url: &str, proxy: Option<&ProxyRecord>) -> Result<PageResponse>;
}

/// reqwest-backed fetch executor. Builds a client per call so the proxy can
/// differ between requests.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    timeout: Duration,
    user_agent: String,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FetchExecutor for HttpFetcher {
    async fn fetch(&self, url: &str, proxy: Option<&ProxyRecord>) -> Result<PageResponse> {
        let chain: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let policy_chain = chain.clone();
        let policy = Policy::custom(move |attempt| {
            policy_chain.lock().push(attempt.url().to_string());
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.stop()
            } else {
                attempt.follow()
            }
        });

        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .redirect(policy)
            .user_agent(&self.user_agent);

        if let Some(proxy) = proxy {
            debug!(proxy = %proxy.address, url, "fetching via proxy");
            builder = builder.proxy(
                reqwest::Proxy::all(proxy.base_url())?
                    .basic_auth(&proxy.username, &proxy.password),
            );
        } else {
            debug!(url, "fetching directly");
        }

        let client = builder.build()?;
        let response = client.get(url).send().await?;

        let status_code = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response.text().await?;
        let redirect_chain = chain.lock().clone();

        Ok(PageResponse {
            status_code,
            body,
            requested_url: url.to_string(),
            final_url,
            redirect_chain,
        })
    }
}

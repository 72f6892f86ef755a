pub mod fetch;
pub mod imobiliare;
pub mod proxy;
pub mod status;

use async_trait::async_trait;
use imobi_core::{Result, ScrapedListing};
use sha2::{Digest, Sha256};

pub use fetch::{FetchExecutor, HttpFetcher, PageResponse};
pub use imobiliare::ImobiliareScraper;
pub use proxy::{
    PoolSummary, ProxyMetrics, ProxyPoolConfig, ProxyPoolManager, ProxyProvider, ProxyRecord,
    QuarantineEntry, QuarantineLedger, ReplacementQuota, TopProxy, WebshareClient,
};
pub use status::PropertyStatusDetector;

/// Maximum stored fingerprint length; matches the storage column width.
const FINGERPRINT_MAX_LEN: usize = 64;

/// Stable deduplication key for a listing: SHA-256 of `source_externalId`,
/// hex-encoded and truncated to the storage width.
pub fn fingerprint(source: &str, external_id: &str) -> String {
    let digest = Sha256::digest(format!("{}_{}", source, external_id).as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(FINGERPRINT_MAX_LEN);
    encoded
}

/// A site scraper that can be driven by the crawl loop.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// Collect listings across up to `max_pages` pages, fetching detail
    /// pages with at most `concurrency` requests in flight.
    async fn scrape_listings(&self, max_pages: u32, concurrency: usize)
        -> Result<Vec<ScrapedListing>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_and_bounded() {
        let a = fingerprint("imobiliare_ro", "X7C0300DO");
        let b = fingerprint("imobiliare_ro", "X7C0300DO");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_distinguishes_sources() {
        assert_ne!(
            fingerprint("imobiliare_ro", "123"),
            fingerprint("storia_ro", "123")
        );
    }
}

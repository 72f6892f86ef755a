use crate::fetch::{FetchExecutor, PageResponse};
use crate::proxy::ProxyPoolManager;
use crate::status::PropertyStatusDetector;
use crate::{fingerprint, ListingSource};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use imobi_core::{DealType, ImobiError, PropertyStatus, Result, ScrapedListing};
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{debug, info, warn};

pub const SOURCE: &str = "imobiliare_ro";
const BASE_URL: &str = "https://www.imobiliare.ro";

/// Fetch attempts per URL; a retry always reports the previous outcome and
/// draws a fresh proxy.
const MAX_FETCH_ATTEMPTS: u32 = 2;

fn rooms_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)\s*camer").expect("rooms pattern"))
}

fn surface_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:[.,]\d+)?)\s*mp").expect("surface pattern"))
}

fn floor_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"etaj(?:ul)?\s*(\d+)").expect("floor pattern"))
}

fn date_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,2})\.(\d{1,2})\.(\d{4})").expect("date pattern"))
}

/// Scraper for imobiliare.ro. Listing pages give card summaries; detail
/// pages carry a JSON-LD payload that fills in the rest.
pub struct ImobiliareScraper {
    fetcher: Arc<dyn FetchExecutor>,
    pool: Option<Arc<ProxyPoolManager>>,
    base_url: String,
    deal_type: DealType,
}

impl ImobiliareScraper {
    pub fn new(
        fetcher: Arc<dyn FetchExecutor>,
        pool: Option<Arc<ProxyPoolManager>>,
        deal_type: DealType,
    ) -> Self {
        Self {
            fetcher,
            pool,
            base_url: BASE_URL.to_string(),
            deal_type,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn listing_url(&self, page: u32) -> String {
        let segment = match self.deal_type {
            DealType::Rent => "inchirieri-apartamente",
            DealType::Buy => "vanzari-apartamente",
        };
        format!("{}/{}?pagina={}", self.base_url, segment, page)
    }

    /// Fetch one URL through the pool, reporting the outcome exactly once
    /// per attempt. Proxy-class failures retry once with a fresh proxy;
    /// other responses are returned as-is for the status detector.
    async fn fetch_page(&self, url: &str) -> Result<PageResponse> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let proxy = match &self.pool {
                Some(pool) => pool.select_proxy().await,
                None => None,
            };
            let started = Instant::now();

            match self.fetcher.fetch(url, proxy.as_ref()).await {
                Ok(response) => {
                    if let (Some(pool), Some(proxy)) = (&self.pool, &proxy) {
                        if response.is_success() {
                            pool.record_success(
                                &proxy.address,
                                Some(started.elapsed().as_secs_f64()),
                            );
                        } else {
                            pool.record_failure(&proxy.address, response.status_code).await;
                        }
                    }

                    let proxy_class_failure =
                        matches!(response.status_code, 403 | 407 | 429 | 503);
                    if proxy_class_failure && attempt < MAX_FETCH_ATTEMPTS {
                        warn!(
                            url,
                            status = response.status_code,
                            attempt,
                            "proxy-class failure; retrying with a fresh proxy"
                        );
                        continue;
                    }
                    return Ok(response);
                }
                Err(e) => {
                    if let (Some(pool), Some(proxy)) = (&self.pool, &proxy) {
                        pool.record_failure(&proxy.address, 0).await;
                    }
                    if attempt >= MAX_FETCH_ATTEMPTS {
                        return Err(e);
                    }
                    warn!(url, attempt, error = %e, "fetch failed; retrying");
                }
            }
        }
    }

    /// One listing page: card summaries plus whether a next page exists.
    pub async fn scrape_page(&self, page: u32) -> Result<(Vec<ScrapedListing>, bool)> {
        let url = self.listing_url(page);
        let response = self.fetch_page(&url).await?;

        if !response.is_success() {
            return Err(ImobiError::Scraping(format!(
                "listing page {} returned {}",
                url, response.status_code
            )));
        }

        let (cards, has_next) = self.parse_listing_page(&response.body)?;
        info!(page, cards = cards.len(), has_next, "parsed listing page");
        Ok((cards, has_next))
    }

    fn parse_listing_page(&self, body: &str) -> Result<(Vec<ScrapedListing>, bool)> {
        let document = Html::parse_document(body);
        let card_selector = parse_selector(".listing-card")?;
        let link_selector = parse_selector("a.listing-card__link")?;
        let title_selector = parse_selector(".listing-card__title")?;
        let price_selector = parse_selector(".listing-card__price")?;
        let location_selector = parse_selector(".listing-card__location")?;

        let mut listings = Vec::new();
        for card in document.select(&card_selector) {
            let Some(href) = card
                .select(&link_selector)
                .next()
                .and_then(|a| a.value().attr("href"))
            else {
                debug!("listing card without link; skipping");
                continue;
            };
            let url = absolutize(&self.base_url, href);

            let Some(external_id) = extract_external_id(&url) else {
                warn!(url = %url, "could not derive external id; skipping card");
                continue;
            };

            let title = card
                .select(&title_selector)
                .next()
                .map(|t| collect_text(&t))
                .filter(|t| !t.is_empty());

            let mut listing = ScrapedListing {
                fingerprint: fingerprint(SOURCE, &external_id),
                source: SOURCE.to_string(),
                external_id,
                url,
                title,
                deal_type: Some(self.deal_type),
                property_type: Some("apartment".to_string()),
                ..Default::default()
            };

            if let Some(price_text) = card.select(&price_selector).next().map(|p| collect_text(&p))
            {
                apply_price_text(&mut listing, &price_text);
            }
            if let Some(location) = card
                .select(&location_selector)
                .next()
                .map(|l| collect_text(&l))
                .filter(|l| !l.is_empty())
            {
                let mut parts = location.splitn(2, ',').map(|s| s.trim().to_string());
                listing.neighborhood = parts.next().filter(|s| !s.is_empty());
                listing.city = parts.next().filter(|s| !s.is_empty());
            }

            listings.push(listing);
        }

        let next_selector = parse_selector("a.pagination__next")?;
        let disabled_selector = parse_selector("a.pagination__next.pagination__next--disabled")?;
        let has_next = document.select(&next_selector).next().is_some()
            && document.select(&disabled_selector).next().is_none();

        Ok((listings, has_next))
    }

    /// Fetch a detail page and classify it. Parse failures degrade the item
    /// instead of erroring: the detector downgrades incomplete listings.
    pub async fn scrape_detail(&self, card: &ScrapedListing) -> Result<ScrapedListing> {
        let response = self.fetch_page(&card.url).await?;

        let parsed = if response.is_success() {
            self.parse_detail_page(&response.body, &card.url)
        } else {
            None
        };

        let mut listing = match parsed {
            Some(detail) => merge_listing(card.clone(), detail),
            None => card.clone(),
        };
        listing.status = Some(PropertyStatusDetector::detect(&response, Some(&listing)));
        Ok(listing)
    }

    fn parse_detail_page(&self, body: &str, url: &str) -> Option<ScrapedListing> {
        let document = Html::parse_document(body);
        let external_id = extract_external_id(url)?;

        let mut listing = ScrapedListing {
            fingerprint: fingerprint(SOURCE, &external_id),
            source: SOURCE.to_string(),
            external_id,
            url: url.to_string(),
            deal_type: Some(self.deal_type),
            property_type: Some("apartment".to_string()),
            ..Default::default()
        };

        if let Some(jsonld) = extract_jsonld(&document) {
            listing.title = jsonld
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string);
            listing.description = jsonld
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string);

            if let Some(offers) = jsonld.get("offers") {
                let price = offers.get("price").and_then(|p| match p {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.replace(',', ".").parse().ok(),
                    _ => None,
                });
                let currency = offers
                    .get("priceCurrency")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                match (price, currency.to_uppercase().as_str()) {
                    (Some(p), "RON" | "LEI") => listing.price_ron = Some(p),
                    (Some(p), "EUR") => listing.price_eur = Some(p),
                    _ => {}
                }
            }

            if let Some(address) = jsonld.get("address") {
                listing.city = address
                    .get("addressLocality")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                listing.county = address
                    .get("addressRegion")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                listing.address = address
                    .get("streetAddress")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
        }

        // CSS fallbacks for whatever JSON-LD left out.
        if listing.title.is_none() {
            listing.title = select_text(&document, "h1.listing-title");
        }
        if listing.price_ron.is_none() && listing.price_eur.is_none() {
            if let Some(price_text) = select_text(&document, ".listing-price") {
                apply_price_text(&mut listing, &price_text);
            }
        }

        let characteristics = select_text(&document, ".listing-characteristics")
            .or_else(|| select_text(&document, ".listing-details"))
            .unwrap_or_default()
            .to_lowercase();

        if let Some(caps) = rooms_regex().captures(&characteristics) {
            listing.room_count = caps[1].parse().ok();
        } else if characteristics.contains("garsoniera") || characteristics.contains("garsonieră")
        {
            listing.room_count = Some(1);
        }
        if let Some(caps) = surface_regex().captures(&characteristics) {
            listing.square_meters = caps[1].replace(',', ".").parse().ok();
        }
        if let Some(caps) = floor_regex().captures(&characteristics) {
            listing.floor = caps[1].parse().ok();
        } else if characteristics.contains("parter") {
            listing.floor = Some(0);
        }

        if let Some(available) = select_text(&document, ".listing-availability") {
            listing.available_date = parse_romanian_date(&available);
        }

        if listing.title.is_none() && listing.price_ron.is_none() && listing.price_eur.is_none() {
            debug!(url, "detail page yielded no usable fields");
            return None;
        }
        Some(listing)
    }
}

#[async_trait]
impl ListingSource for ImobiliareScraper {
    fn source_name(&self) -> &'static str {
        SOURCE
    }

    /// Walk listing pages, then fan detail fetches out with bounded
    /// concurrency. Listings that fail validation are dropped with a
    /// warning, never propagated as errors.
    async fn scrape_listings(&self, max_pages: u32, concurrency: usize) -> Result<Vec<ScrapedListing>> {
        let mut cards = Vec::new();
        let mut page = 1;

        loop {
            match self.scrape_page(page).await {
                Ok((mut page_cards, has_next)) => {
                    cards.append(&mut page_cards);
                    if !has_next || page >= max_pages {
                        break;
                    }
                    page += 1;
                }
                Err(e) => {
                    warn!(page, error = %e, "listing page failed; stopping pagination");
                    break;
                }
            }
        }

        info!(cards = cards.len(), pages = page, "collected listing cards");

        let detailed: Vec<ScrapedListing> = stream::iter(cards)
            .map(|card| async move {
                match self.scrape_detail(&card).await {
                    Ok(listing) => Some(listing),
                    Err(e) => {
                        warn!(url = %card.url, error = %e, "detail fetch failed; keeping card data");
                        Some(card)
                    }
                }
            })
            .buffer_unordered(concurrency.max(1))
            .filter_map(|listing| async move { listing })
            .collect()
            .await;

        let mut valid = Vec::with_capacity(detailed.len());
        for mut listing in detailed {
            if listing.external_id.trim().is_empty() || listing.fingerprint.trim().is_empty() {
                warn!(url = %listing.url, "listing without identity; dropping");
                continue;
            }
            if listing.status.is_none() {
                listing.status = Some(PropertyStatus::Active);
            }
            valid.push(listing);
        }

        Ok(valid)
    }
}

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| ImobiError::Scraping(e.to_string()))
}

fn collect_text(element: &scraper::ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn select_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .next()
        .map(|e| collect_text(&e))
        .filter(|t| !t.is_empty())
}

fn absolutize(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), href.trim_start_matches('/'))
    }
}

/// Derive the stable listing id from a detail URL: the last path segment,
/// e.g. ".../oferta/apartament-2-camere-X7C0300DO" -> "X7C0300DO" when the
/// slug is dash-separated, the whole segment otherwise.
fn extract_external_id(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .last()?
        .to_string();
    let candidate = segment.rsplit('-').next().unwrap_or(&segment);
    let id = if candidate.len() >= 6 {
        candidate
    } else {
        &segment
    };
    Some(id.to_string())
}

/// Parse a Romanian price string into the right currency slot, e.g.
/// "3.500 lei / luna" or "1.450 €".
fn apply_price_text(listing: &mut ScrapedListing, text: &str) {
    let lower = text.to_lowercase();
    let digits: String = lower
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',')
        .collect();
    let normalized = digits.replace(',', ".");
    let Ok(value) = normalized.parse::<f64>() else {
        return;
    };

    if lower.contains('€') || lower.contains("eur") {
        listing.price_eur = Some(value);
    } else if lower.contains("lei") || lower.contains("ron") {
        listing.price_ron = Some(value);
    }
}

fn parse_romanian_date(text: &str) -> Option<NaiveDate> {
    let lower = text.to_lowercase();
    if lower.contains("imediat") {
        return Some(chrono::Utc::now().date_naive());
    }
    let caps = date_regex().captures(&lower)?;
    let day: u32 = caps[1].parse().ok()?;
    let month: u32 = caps[2].parse().ok()?;
    let year: i32 = caps[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// JSON-LD block describing the listing, if the page carries one.
fn extract_jsonld(document: &Html) -> Option<Value> {
    let selector = Selector::parse("script[type=\"application/ld+json\"]").ok()?;
    for script in document.select(&selector) {
        let raw = script.text().collect::<String>();
        let Ok(value) = serde_json::from_str::<Value>(&raw) else {
            continue;
        };
        let candidates = match &value {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };
        for candidate in candidates {
            let type_matches = candidate
                .get("@type")
                .and_then(Value::as_str)
                .map(|t| matches!(t, "Apartment" | "House" | "Product" | "Offer" | "RealEstateListing"))
                .unwrap_or(false);
            if type_matches {
                return Some(candidate);
            }
        }
    }
    None
}

/// Detail fields win over card fields wherever both are present.
fn merge_listing(card: ScrapedListing, detail: ScrapedListing) -> ScrapedListing {
    ScrapedListing {
        fingerprint: card.fingerprint,
        source: card.source,
        external_id: card.external_id,
        url: card.url,
        title: detail.title.or(card.title),
        description: detail.description.or(card.description),
        property_type: detail.property_type.or(card.property_type),
        deal_type: detail.deal_type.or(card.deal_type),
        status: detail.status.or(card.status),
        price_ron: detail.price_ron.or(card.price_ron),
        price_eur: detail.price_eur.or(card.price_eur),
        city: detail.city.or(card.city),
        county: detail.county.or(card.county),
        neighborhood: detail.neighborhood.or(card.neighborhood),
        address: detail.address.or(card.address),
        square_meters: detail.square_meters.or(card.square_meters),
        room_count: detail.room_count.or(card.room_count),
        floor: detail.floor.or(card.floor),
        available_date: detail.available_date.or(card.available_date),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::HttpFetcher;

    const LISTING_PAGE: &str = r#"
        <html><body>
          <div class="listing-card">
            <a class="listing-card__link"
               href="/inchirieri-apartamente/oferta/apartament-2-camere-X7C0300DO"></a>
            <h2 class="listing-card__title">Apartament 2 camere, Aviatiei</h2>
            <span class="listing-card__price">3.500 lei / luna</span>
            <span class="listing-card__location">Aviatiei, Bucuresti</span>
          </div>
          <div class="listing-card">
            <a class="listing-card__link"
               href="/inchirieri-apartamente/oferta/garsoniera-centru-X9B1200AB"></a>
            <h2 class="listing-card__title">Garsoniera ultracentral</h2>
            <span class="listing-card__price">1.450 &euro;</span>
            <span class="listing-card__location">Centru, Cluj-Napoca</span>
          </div>
          <a class="pagination__next" href="?pagina=2">next</a>
        </body></html>
    "#;

    const DETAIL_PAGE: &str = r#"
        <html><head>
          <script type="application/ld+json">
          {
            "@type": "Apartment",
            "name": "Apartament 2 camere, Aviatiei",
            "description": "Decomandat, renovat recent",
            "offers": {"price": "3500", "priceCurrency": "RON"},
            "address": {
              "addressLocality": "Bucuresti",
              "addressRegion": "Bucuresti",
              "streetAddress": "Strada Avionului 12"
            }
          }
          </script>
        </head><body>
          <div class="listing-characteristics">2 camere, 54 mp, etaj 3</div>
          <div class="listing-availability">disponibil de la 01.09.2026</div>
        </body></html>
    "#;

    fn scraper() -> ImobiliareScraper {
        ImobiliareScraper::new(Arc::new(HttpFetcher::new()), None, DealType::Rent)
    }

    #[test]
    fn test_parse_listing_page() {
        let (listings, has_next) = scraper().parse_listing_page(LISTING_PAGE).unwrap();
        assert_eq!(listings.len(), 2);
        assert!(has_next);

        let first = &listings[0];
        assert_eq!(first.external_id, "X7C0300DO");
        assert_eq!(first.title.as_deref(), Some("Apartament 2 camere, Aviatiei"));
        assert_eq!(first.price_ron, Some(3500.0));
        assert_eq!(first.neighborhood.as_deref(), Some("Aviatiei"));
        assert_eq!(first.city.as_deref(), Some("Bucuresti"));
        assert_eq!(first.fingerprint.len(), 64);

        let second = &listings[1];
        assert_eq!(second.price_eur, Some(1450.0));
        assert_eq!(second.price_ron, None);
    }

    #[test]
    fn test_parse_listing_page_without_next() {
        let body = LISTING_PAGE.replace(
            "class=\"pagination__next\"",
            "class=\"pagination__next pagination__next--disabled\"",
        );
        let (_, has_next) = scraper().parse_listing_page(&body).unwrap();
        assert!(!has_next);
    }

    #[test]
    fn test_parse_detail_page_jsonld() {
        let listing = scraper()
            .parse_detail_page(
                DETAIL_PAGE,
                "https://www.imobiliare.ro/inchirieri-apartamente/oferta/apartament-2-camere-X7C0300DO",
            )
            .unwrap();

        assert_eq!(listing.external_id, "X7C0300DO");
        assert_eq!(listing.title.as_deref(), Some("Apartament 2 camere, Aviatiei"));
        assert_eq!(listing.description.as_deref(), Some("Decomandat, renovat recent"));
        assert_eq!(listing.price_ron, Some(3500.0));
        assert_eq!(listing.city.as_deref(), Some("Bucuresti"));
        assert_eq!(listing.room_count, Some(2));
        assert_eq!(listing.square_meters, Some(54.0));
        assert_eq!(listing.floor, Some(3));
        assert_eq!(
            listing.available_date,
            NaiveDate::from_ymd_opt(2026, 9, 1)
        );
    }

    #[test]
    fn test_parse_detail_page_empty_yields_none() {
        assert!(scraper()
            .parse_detail_page("<html><body></body></html>", "https://x.ro/oferta/abc-123456")
            .is_none());
    }

    #[test]
    fn test_price_parsing() {
        let mut listing = ScrapedListing::default();
        apply_price_text(&mut listing, "3.500 lei / luna");
        assert_eq!(listing.price_ron, Some(3500.0));

        let mut listing = ScrapedListing::default();
        apply_price_text(&mut listing, "1.450 €");
        assert_eq!(listing.price_eur, Some(1450.0));

        let mut listing = ScrapedListing::default();
        apply_price_text(&mut listing, "pret la cerere");
        assert_eq!(listing.price_ron, None);
        assert_eq!(listing.price_eur, None);
    }

    #[test]
    fn test_external_id_extraction() {
        assert_eq!(
            extract_external_id(
                "https://www.imobiliare.ro/inchirieri-apartamente/oferta/apartament-2-camere-X7C0300DO"
            )
            .as_deref(),
            Some("X7C0300DO")
        );
        assert_eq!(
            extract_external_id("https://www.imobiliare.ro/oferta/12345678?sursa=lista").as_deref(),
            Some("12345678")
        );
        assert_eq!(extract_external_id("https://www.imobiliare.ro/"), None);
    }

    #[test]
    fn test_merge_prefers_detail_fields() {
        let card = ScrapedListing {
            fingerprint: "fp".to_string(),
            external_id: "id".to_string(),
            title: Some("Card title".to_string()),
            price_ron: Some(100.0),
            ..Default::default()
        };
        let detail = ScrapedListing {
            title: Some("Detail title".to_string()),
            square_meters: Some(54.0),
            ..Default::default()
        };

        let merged = merge_listing(card, detail);
        assert_eq!(merged.title.as_deref(), Some("Detail title"));
        assert_eq!(merged.price_ron, Some(100.0));
        assert_eq!(merged.square_meters, Some(54.0));
        assert_eq!(merged.fingerprint, "fp");
    }

    #[test]
    fn test_listing_urls_per_deal_type() {
        let rent = scraper();
        assert!(rent.listing_url(2).ends_with("/inchirieri-apartamente?pagina=2"));

        let buy = ImobiliareScraper::new(Arc::new(HttpFetcher::new()), None, DealType::Buy);
        assert!(buy.listing_url(1).ends_with("/vanzari-apartamente?pagina=1"));
    }

    #[test]
    fn test_romanian_date_parsing() {
        assert_eq!(
            parse_romanian_date("disponibil de la 15.10.2026"),
            NaiveDate::from_ymd_opt(2026, 10, 15)
        );
        assert!(parse_romanian_date("disponibil imediat").is_some());
        assert!(parse_romanian_date("indisponibil").is_none());
    }
}

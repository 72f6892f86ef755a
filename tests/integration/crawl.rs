use async_trait::async_trait;
use imobi_core::{Database, DealType, PropertyStatus, Result};
use imobi_scrapers::{
    FetchExecutor, ImobiliareScraper, ListingSource, PageResponse, ProxyRecord,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

const BASE: &str = "https://test.local";

/// Serves canned pages; everything else is a 404 with an error page body.
struct StubFetcher {
    pages: Mutex<HashMap<String, (u16, String)>>,
}

impl StubFetcher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(HashMap::new()),
        })
    }

    fn set_page(&self, url: &str, status: u16, body: &str) {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, body.to_string()));
    }
}

#[async_trait]
impl FetchExecutor for StubFetcher {
    async fn fetch(&self, url: &str, _proxy: Option<&ProxyRecord>) -> Result<PageResponse> {
        let (status_code, body) = self
            .pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or((404, "<html>pagina nu a fost gasita</html>".to_string()));

        Ok(PageResponse {
            status_code,
            body,
            requested_url: url.to_string(),
            final_url: url.to_string(),
            redirect_chain: Vec::new(),
        })
    }
}

fn listing_page(cards: &[(&str, &str, &str)], has_next: bool) -> String {
    let mut body = String::from("<html><body>");
    for (slug, title, price) in cards {
        body.push_str(&format!(
            r#"<div class="listing-card">
                 <a class="listing-card__link" href="/inchirieri-apartamente/oferta/{}"></a>
                 <h2 class="listing-card__title">{}</h2>
                 <span class="listing-card__price">{}</span>
                 <span class="listing-card__location">Aviatiei, Bucuresti</span>
               </div>"#,
            slug, title, price
        ));
    }
    if has_next {
        body.push_str(r#"<a class="pagination__next" href="?pagina=2">next</a>"#);
    }
    body.push_str("</body></html>");
    body
}

fn detail_page(title: &str, price_ron: u32) -> String {
    format!(
        r#"<html><head>
             <script type="application/ld+json">
             {{"@type": "Apartment", "name": "{}",
               "description": "Decomandat, etaj intermediar",
               "offers": {{"price": "{}", "priceCurrency": "RON"}},
               "address": {{"addressLocality": "Bucuresti"}}}}
             </script>
           </head><body>
             <div class="listing-characteristics">2 camere, 54 mp, etaj 3</div>
           </body></html>"#,
        title, price_ron
    )
}

fn scraper(fetcher: Arc<StubFetcher>) -> ImobiliareScraper {
    ImobiliareScraper::new(fetcher, None, DealType::Rent).with_base_url(BASE)
}

#[tokio::test]
async fn test_crawl_persists_listings() {
    let fetcher = StubFetcher::new();
    fetcher.set_page(
        &format!("{}/inchirieri-apartamente?pagina=1", BASE),
        200,
        &listing_page(
            &[
                ("apartament-aviatiei-AA111111", "Apartament Aviatiei", "3.500 lei"),
                ("apartament-centru-BB222222", "Apartament Centru", "4.200 lei"),
            ],
            false,
        ),
    );
    fetcher.set_page(
        &format!("{}/inchirieri-apartamente/oferta/apartament-aviatiei-AA111111", BASE),
        200,
        &detail_page("Apartament Aviatiei", 3500),
    );
    fetcher.set_page(
        &format!("{}/inchirieri-apartamente/oferta/apartament-centru-BB222222", BASE),
        200,
        &detail_page("Apartament Centru", 4200),
    );

    let dir = tempdir().unwrap();
    let db = Database::new(dir.path().join("test.db")).await.unwrap();

    let scraper = scraper(fetcher);
    let listings = scraper.scrape_listings(1, 4).await.unwrap();
    assert_eq!(listings.len(), 2);

    let job_id = db.create_scrape_job(scraper.source_name()).await.unwrap();
    for listing in &listings {
        db.upsert_listing(listing, Some(job_id)).await.unwrap();
    }
    db.close_scrape_job(job_id, listings.len() as i64).await.unwrap();

    assert_eq!(db.count_properties().await.unwrap(), 2);
    let stored = db
        .list_properties(Some(PropertyStatus::Active), None, None, None, false, 10, 0)
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);

    let aviatiei = stored
        .iter()
        .find(|p| p.external_id == "AA111111")
        .expect("aviatiei listing stored");
    assert_eq!(aviatiei.price_ron, Some(3500.0));
    assert_eq!(aviatiei.room_count, Some(2));
    assert_eq!(aviatiei.square_meters, Some(54.0));
    assert_eq!(aviatiei.city.as_deref(), Some("Bucuresti"));
}

#[tokio::test]
async fn test_recrawl_detects_price_drop() {
    let fetcher = StubFetcher::new();
    let listing_url = format!("{}/inchirieri-apartamente?pagina=1", BASE);
    let detail_url = format!(
        "{}/inchirieri-apartamente/oferta/apartament-aviatiei-AA111111",
        BASE
    );

    fetcher.set_page(
        &listing_url,
        200,
        &listing_page(
            &[("apartament-aviatiei-AA111111", "Apartament Aviatiei", "3.500 lei")],
            false,
        ),
    );
    fetcher.set_page(&detail_url, 200, &detail_page("Apartament Aviatiei", 3500));

    let dir = tempdir().unwrap();
    let db = Database::new(dir.path().join("test.db")).await.unwrap();
    let scraper = scraper(fetcher.clone());

    for listing in scraper.scrape_listings(1, 4).await.unwrap() {
        db.upsert_listing(&listing, None).await.unwrap();
    }

    // Price drops by 10% before the second crawl.
    fetcher.set_page(
        &listing_url,
        200,
        &listing_page(
            &[("apartament-aviatiei-AA111111", "Apartament Aviatiei", "3.150 lei")],
            false,
        ),
    );
    fetcher.set_page(&detail_url, 200, &detail_page("Apartament Aviatiei", 3150));

    for listing in scraper.scrape_listings(1, 4).await.unwrap() {
        db.upsert_listing(&listing, None).await.unwrap();
    }

    let drops = db.recent_price_drops(10).await.unwrap();
    assert_eq!(drops.len(), 1);
    let property = &drops[0];
    assert_eq!(property.price_ron, Some(3150.0));
    assert_eq!(property.previous_price_ron, Some(3500.0));
    assert_eq!(property.price_change_percentage, Some(-10.0));
    assert!(property.price_drop_alert);
    assert_eq!(property.price_change_count, 1);
}

#[tokio::test]
async fn test_gone_detail_page_marks_inactive() {
    let fetcher = StubFetcher::new();
    fetcher.set_page(
        &format!("{}/inchirieri-apartamente?pagina=1", BASE),
        200,
        &listing_page(
            &[("apartament-disparut-CC333333", "Apartament Disparut", "2.000 lei")],
            false,
        ),
    );
    // No detail page registered: the stub answers 404.

    let dir = tempdir().unwrap();
    let db = Database::new(dir.path().join("test.db")).await.unwrap();

    let listings = scraper(fetcher).scrape_listings(1, 4).await.unwrap();
    assert_eq!(listings.len(), 1);
    assert_eq!(listings[0].status, Some(PropertyStatus::Inactive));

    db.upsert_listing(&listings[0], None).await.unwrap();
    let property = db
        .get_property(&listings[0].fingerprint)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(property.status, PropertyStatus::Inactive);
    // Card-level data is still preserved for operators.
    assert_eq!(property.price_ron, Some(2000.0));
}

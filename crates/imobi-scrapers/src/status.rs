use crate::fetch::PageResponse;
use imobi_core::{PropertyStatus, ScrapedListing};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Anti-bot challenge markers. Any hit means the fetch was intercepted, not
/// that the listing is gone.
const ANTIBOT_MARKERS: &[&str] = &[
    "just a moment",
    "checking your browser",
    "cf-browser-verification",
    "ddos protection by cloudflare",
    "verificam browserul",
    "attention required",
];

/// URL fragments that identify search/listing/home pages. A redirect landing
/// on one of these means the ad itself no longer exists.
const SEARCH_URL_PATTERNS: &[&str] = &[
    "/cauta",
    "/rezultate",
    "/inchirieri-",
    "/vanzari-",
    "/search",
    "/results",
    "/home",
];

/// Keywords marking a listing as gone, per language.
const INACTIVE_KEYWORDS: &[&str] = &[
    // Romanian
    "anuntul nu mai este activ",
    "anunțul nu mai este activ",
    "anunt expirat",
    "anunț expirat",
    "nu mai este disponibil",
    "anuntul a fost sters",
    "anunțul a fost șters",
    "oferta nu mai este valabila",
    "pagina nu a fost gasita",
    // English
    "no longer available",
    "listing expired",
    "listing has been removed",
    "ad has been deleted",
    "not found",
];

/// Keywords marking a listing as taken but still rendered.
const RENTED_KEYWORDS: &[&str] = &[
    // Romanian
    "a fost inchiriat",
    "a fost închiriat",
    "deja inchiriat",
    "deja închiriat",
    "a fost vandut",
    "a fost vândut",
    "rezervat",
    // English
    "already rented",
    "let agreed",
    "under offer",
];

/// A status keyword only counts when property vocabulary appears nearby;
/// otherwise navigation and boilerplate produce false positives.
const PROPERTY_CONTEXT_TERMS: &[&str] = &[
    "apartament",
    "garsoniera",
    "garsonieră",
    "proprietate",
    "imobil",
    "anunt",
    "anunț",
    "oferta",
    "ofertă",
    "property",
    "listing",
    "apartment",
];

/// Window, in bytes of lowercased text, scanned around a keyword for context
/// terms.
const CONTEXT_WINDOW: usize = 200;

/// Minimum populated non-metadata fields for a parsed item to count as a
/// live listing.
const MIN_POPULATED_FIELDS: usize = 2;

fn trailing_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/\d{5,}/?$").expect("trailing id pattern"))
}

/// Classifies a fetched page as active/inactive/rented/blocked.
///
/// Rules run in strict precedence order and the first decisive signal wins;
/// a later rule can never override an earlier verdict.
pub struct PropertyStatusDetector;

impl PropertyStatusDetector {
    pub fn detect(response: &PageResponse, item: Option<&ScrapedListing>) -> PropertyStatus {
        debug!(url = %response.requested_url, "detecting property status");

        if let Some(status) = Self::check_http_status(response) {
            info!(
                code = response.status_code,
                status = %status,
                "status decided by HTTP code"
            );
            return status;
        }

        if let Some(status) = Self::check_redirects(response) {
            info!(final_url = %response.final_url, status = %status, "status decided by redirect");
            return status;
        }

        if let Some(status) = Self::check_antibot(response) {
            info!(status = %status, "anti-bot challenge detected");
            return status;
        }

        if let Some(status) = Self::check_content(response) {
            info!(status = %status, "status decided by page content");
            return status;
        }

        if let Some(item) = item {
            if let Some(status) = Self::check_data_completeness(item) {
                info!(
                    external_id = %item.external_id,
                    status = %status,
                    "status decided by data completeness"
                );
                return status;
            }
        }

        PropertyStatus::Active
    }

    fn check_http_status(response: &PageResponse) -> Option<PropertyStatus> {
        match response.status_code {
            404 | 410 => Some(PropertyStatus::Inactive),
            code if code >= 500 => Some(PropertyStatus::Blocked),
            _ => None,
        }
    }

    fn check_redirects(response: &PageResponse) -> Option<PropertyStatus> {
        if !response.was_redirected() {
            return None;
        }

        let final_url = response.final_url.to_lowercase();
        let on_search_page = SEARCH_URL_PATTERNS
            .iter()
            .any(|pattern| final_url.contains(pattern));

        // A detail URL can legitimately contain e.g. "/inchirieri-"; only a
        // missing trailing listing id makes the redirect decisive.
        if on_search_page && !trailing_id_regex().is_match(&final_url) {
            return Some(PropertyStatus::Inactive);
        }
        None
    }

    fn check_antibot(response: &PageResponse) -> Option<PropertyStatus> {
        let body = response.body.to_lowercase();
        if ANTIBOT_MARKERS.iter().any(|marker| body.contains(marker)) {
            return Some(PropertyStatus::Blocked);
        }
        None
    }

    fn check_content(response: &PageResponse) -> Option<PropertyStatus> {
        let body = response.body.to_lowercase();

        // Rented keywords first: they are the more specific signal.
        for keyword in RENTED_KEYWORDS {
            if Self::keyword_in_context(&body, keyword) {
                return Some(PropertyStatus::Rented);
            }
        }

        for keyword in INACTIVE_KEYWORDS {
            if Self::keyword_in_context(&body, keyword) {
                return Some(PropertyStatus::Inactive);
            }
        }

        None
    }

    fn check_data_completeness(item: &ScrapedListing) -> Option<PropertyStatus> {
        if !item.has_identity() {
            return Some(PropertyStatus::Inactive);
        }
        if item.populated_field_count() < MIN_POPULATED_FIELDS {
            return Some(PropertyStatus::Inactive);
        }
        None
    }

    /// True when `keyword` appears in `text` with property vocabulary within
    /// the surrounding window.
    fn keyword_in_context(text: &str, keyword: &str) -> bool {
        let Some(position) = text.find(keyword) else {
            return false;
        };

        let start = floor_char_boundary(text, position.saturating_sub(CONTEXT_WINDOW));
        let end = ceil_char_boundary(text, (position + keyword.len() + CONTEXT_WINDOW).min(text.len()));
        let context = &text[start..end];

        PROPERTY_CONTEXT_TERMS.iter().any(|term| context.contains(term))
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Row};
use std::str::FromStr;

mod changes;
mod db;
mod display;
mod graph;
mod price;

pub use changes::{detect_changes, FieldChange, TRACKED_FIELDS};
pub use db::{ChangeLogEntry, Database, UpsertOutcome};
pub use display::{create_drops_table, create_property_table, PropertyTableRow};
pub use graph::PriceGraph;
pub use price::{
    apply_price_update, seed_initial_price, PriceChange, PRICE_DROP_ALERT_THRESHOLD,
    PRICE_HISTORY_CAP,
};

pub type Result<T> = std::result::Result<T, ImobiError>;

#[derive(Debug, thiserror::Error)]
pub enum ImobiError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Scraping error: {0}")]
    Scraping(String),
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

/// Lifecycle state of a listing as observed by the scraper.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum PropertyStatus {
    #[default]
    Active,
    Inactive,
    Rented,
    Blocked,
    Pending,
}

impl PropertyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyStatus::Active => "active",
            PropertyStatus::Inactive => "inactive",
            PropertyStatus::Rented => "rented",
            PropertyStatus::Blocked => "blocked",
            PropertyStatus::Pending => "pending",
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for PropertyStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <String as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for PropertyStatus {
    fn decode(
        value: sqlx::sqlite::SqliteValueRef<'r>,
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let text = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        PropertyStatus::from_str(text).map_err(Into::into)
    }
}

impl sqlx::Encode<'_, sqlx::Sqlite> for PropertyStatus {
    fn encode_by_ref(
        &self,
        args: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'_>>,
    ) -> sqlx::encode::IsNull {
        args.push(sqlx::sqlite::SqliteArgumentValue::Text(
            self.as_str().into(),
        ));
        sqlx::encode::IsNull::No
    }
}

impl std::fmt::Display for PropertyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PropertyStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" | "ad_active" => Ok(PropertyStatus::Active),
            "inactive" | "non_active" | "removed" | "expired" => Ok(PropertyStatus::Inactive),
            "rented" => Ok(PropertyStatus::Rented),
            "blocked" => Ok(PropertyStatus::Blocked),
            "pending" | "pending_viewing" => Ok(PropertyStatus::Pending),
            _ => Err(format!("Unknown property status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DealType {
    #[default]
    Rent,
    Buy,
}

impl DealType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealType::Rent => "rent",
            DealType::Buy => "buy",
        }
    }
}

impl std::fmt::Display for DealType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DealType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rent" | "inchiriere" | "inchirieri" => Ok(DealType::Rent),
            "buy" | "sale" | "vanzare" | "vanzari" => Ok(DealType::Buy),
            _ => Err(format!("Unknown deal type: {}", s)),
        }
    }
}

/// One step of recorded price movement. Old values only; the new values are
/// whatever the property carried after the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryEntry {
    pub changed_at: DateTime<Utc>,
    pub old_ron: Option<f64>,
    pub old_eur: Option<f64>,
}

/// Persisted property record with price-tracking state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub id: Option<i64>,
    pub fingerprint: String,
    pub source: String,
    pub external_id: String,
    pub url: String,

    pub title: Option<String>,
    pub description: Option<String>,
    pub property_type: Option<String>,
    pub deal_type: Option<DealType>,
    pub status: PropertyStatus,

    pub price_ron: Option<f64>,
    pub price_eur: Option<f64>,
    pub previous_price_ron: Option<f64>,
    pub previous_price_eur: Option<f64>,
    pub price_change_ron: Option<f64>,
    pub price_change_percentage: Option<f64>,
    pub price_last_changed: Option<DateTime<Utc>>,
    pub price_change_count: i64,
    pub highest_price_ron: Option<f64>,
    pub lowest_price_ron: Option<f64>,
    pub price_history: Vec<PriceHistoryEntry>,
    pub price_drop_alert: bool,

    pub city: Option<String>,
    pub county: Option<String>,
    pub neighborhood: Option<String>,
    pub address: Option<String>,
    pub square_meters: Option<f64>,
    pub room_count: Option<i32>,
    pub floor: Option<i32>,
    pub available_date: Option<NaiveDate>,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, sqlx::sqlite::SqliteRow> for Property {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let history_json: String = row.try_get("price_history")?;
        let price_history: Vec<PriceHistoryEntry> =
            serde_json::from_str(&history_json).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        let deal_type: Option<String> = row.try_get("deal_type")?;
        let deal_type = deal_type
            .as_deref()
            .map(DealType::from_str)
            .transpose()
            .map_err(|e| sqlx::Error::Decode(e.into()))?;

        Ok(Property {
            id: row.try_get("id")?,
            fingerprint: row.try_get("fingerprint")?,
            source: row.try_get("source")?,
            external_id: row.try_get("external_id")?,
            url: row.try_get("url")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            property_type: row.try_get("property_type")?,
            deal_type,
            status: row.try_get("status")?,
            price_ron: row.try_get("price_ron")?,
            price_eur: row.try_get("price_eur")?,
            previous_price_ron: row.try_get("previous_price_ron")?,
            previous_price_eur: row.try_get("previous_price_eur")?,
            price_change_ron: row.try_get("price_change_ron")?,
            price_change_percentage: row.try_get("price_change_percentage")?,
            price_last_changed: row.try_get("price_last_changed")?,
            price_change_count: row.try_get("price_change_count")?,
            highest_price_ron: row.try_get("highest_price_ron")?,
            lowest_price_ron: row.try_get("lowest_price_ron")?,
            price_history,
            price_drop_alert: row.try_get("price_drop_alert")?,
            city: row.try_get("city")?,
            county: row.try_get("county")?,
            neighborhood: row.try_get("neighborhood")?,
            address: row.try_get("address")?,
            square_meters: row.try_get("square_meters")?,
            room_count: row.try_get("room_count")?,
            floor: row.try_get("floor")?,
            available_date: row.try_get("available_date")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Fields produced by one scrape of a listing page. Optional fields that come
/// back `None` mean "the page did not carry this", never "clear the stored
/// value".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapedListing {
    pub fingerprint: String,
    pub source: String,
    pub external_id: String,
    pub url: String,

    pub title: Option<String>,
    pub description: Option<String>,
    pub property_type: Option<String>,
    pub deal_type: Option<DealType>,
    pub status: Option<PropertyStatus>,

    pub price_ron: Option<f64>,
    pub price_eur: Option<f64>,

    pub city: Option<String>,
    pub county: Option<String>,
    pub neighborhood: Option<String>,
    pub address: Option<String>,
    pub square_meters: Option<f64>,
    pub room_count: Option<i32>,
    pub floor: Option<i32>,
    pub available_date: Option<NaiveDate>,
}

impl ScrapedListing {
    /// Count of populated descriptive fields, excluding identity and
    /// metadata. Used by the status detector's completeness check.
    pub fn populated_field_count(&self) -> usize {
        let mut count = 0;
        count += self.description.is_some() as usize;
        count += self.property_type.is_some() as usize;
        count += self.price_ron.is_some() as usize;
        count += self.price_eur.is_some() as usize;
        count += self.city.is_some() as usize;
        count += self.county.is_some() as usize;
        count += self.neighborhood.is_some() as usize;
        count += self.address.is_some() as usize;
        count += self.square_meters.is_some() as usize;
        count += self.room_count.is_some() as usize;
        count += self.floor.is_some() as usize;
        count += self.available_date.is_some() as usize;
        count
    }

    pub fn has_identity(&self) -> bool {
        !self.external_id.trim().is_empty()
            && self
                .title
                .as_deref()
                .map(|t| !t.trim().is_empty())
                .unwrap_or(false)
    }
}

/// Property paired with its rendered price graph for table output.
#[derive(Debug, Clone)]
pub struct PropertyDisplay {
    pub property: Property,
    pub graph: Option<PriceGraph>,
}

impl PropertyDisplay {
    pub fn new(property: Property) -> Self {
        let graph = PriceGraph::from_property(&property);
        Self { property, graph }
    }
}

#[cfg(test)]
pub(crate) fn test_property(fingerprint: &str, price_ron: Option<f64>) -> Property {
    Property {
        id: Some(1),
        fingerprint: fingerprint.to_string(),
        source: "imobiliare_ro".to_string(),
        external_id: "X7C0300DO".to_string(),
        url: "https://www.imobiliare.ro/inchirieri-apartamente/X7C0300DO".to_string(),
        title: Some("Apartament 2 camere, Aviatiei".to_string()),
        description: None,
        property_type: Some("apartment".to_string()),
        deal_type: Some(DealType::Rent),
        status: PropertyStatus::Active,
        price_ron,
        price_eur: None,
        previous_price_ron: None,
        previous_price_eur: None,
        price_change_ron: None,
        price_change_percentage: None,
        price_last_changed: None,
        price_change_count: 0,
        highest_price_ron: price_ron,
        lowest_price_ron: price_ron,
        price_history: Vec::new(),
        price_drop_alert: false,
        city: Some("Bucuresti".to_string()),
        county: None,
        neighborhood: Some("Aviatiei".to_string()),
        address: None,
        square_meters: Some(54.0),
        room_count: Some(2),
        floor: Some(3),
        available_date: None,
        created_at: Utc::now(),
        updated_at: None,
    }
}

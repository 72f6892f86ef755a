use crate::{
    apply_price_update, detect_changes, seed_initial_price, FieldChange, ImobiError, PriceChange,
    Property, PropertyStatus, Result, ScrapedListing,
};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, QueryBuilder, Row, Sqlite};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub struct Database {
    pool: SqlitePool,
}

/// What happened to a listing when it was folded into the database.
#[derive(Debug)]
pub struct UpsertOutcome {
    pub property_id: i64,
    pub created: bool,
    pub changes: Vec<FieldChange>,
    pub price_change: Option<PriceChange>,
}

/// One persisted change-log row.
#[derive(Debug, Clone)]
pub struct ChangeLogEntry {
    pub fingerprint: String,
    pub changes: serde_json::Value,
    pub change_count: i64,
    pub changed_at: DateTime<Utc>,
    pub scrape_job_id: Option<i64>,
}

impl Database {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if !db_path.exists() {
            fs::write(db_path, "")?;
        }

        let db_url = format!("sqlite:{}", db_path.to_string_lossy());
        let pool = SqlitePool::connect(&db_url).await?;
        let db = Self { pool };
        db.migrate().await?;

        Ok(db)
    }

    // For testing purposes only
    #[cfg(test)]
    pub(crate) async fn test_connection() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<()> {
        debug!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS properties (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fingerprint TEXT NOT NULL UNIQUE,
                source TEXT NOT NULL,
                external_id TEXT NOT NULL,
                url TEXT NOT NULL,
                title TEXT,
                description TEXT,
                property_type TEXT,
                deal_type TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                price_ron REAL,
                price_eur REAL,
                previous_price_ron REAL,
                previous_price_eur REAL,
                price_change_ron REAL,
                price_change_percentage REAL,
                price_last_changed DATETIME,
                price_change_count INTEGER NOT NULL DEFAULT 0,
                highest_price_ron REAL,
                lowest_price_ron REAL,
                price_history TEXT NOT NULL DEFAULT '[]',
                price_drop_alert INTEGER NOT NULL DEFAULT 0,
                city TEXT,
                county TEXT,
                neighborhood TEXT,
                address TEXT,
                square_meters REAL,
                room_count INTEGER,
                floor INTEGER,
                available_date DATE,
                created_at DATETIME NOT NULL,
                updated_at DATETIME,
                UNIQUE(source, external_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_properties_status ON properties(status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS property_changes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                property_id INTEGER NOT NULL,
                fingerprint TEXT NOT NULL,
                changes TEXT NOT NULL,
                change_count INTEGER NOT NULL,
                changed_at DATETIME NOT NULL,
                scrape_job_id INTEGER,
                FOREIGN KEY(property_id) REFERENCES properties(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_property_changes_fingerprint \
             ON property_changes(fingerprint)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scrape_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scraper_name TEXT NOT NULL,
                started_at DATETIME NOT NULL,
                ended_at DATETIME,
                total_listings INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn create_scrape_job(&self, scraper_name: &str) -> Result<i64> {
        let id = sqlx::query(
            "INSERT INTO scrape_jobs (scraper_name, started_at) VALUES (?, ?) RETURNING id",
        )
        .bind(scraper_name)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?
        .get::<i64, _>(0);

        info!(job_id = id, scraper = scraper_name, "scrape job started");
        Ok(id)
    }

    pub async fn close_scrape_job(&self, job_id: i64, total_listings: i64) -> Result<()> {
        sqlx::query("UPDATE scrape_jobs SET ended_at = ?, total_listings = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(total_listings)
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        info!(job_id, total_listings, "scrape job closed");
        Ok(())
    }

    /// Fold one scraped listing into the database.
    ///
    /// New fingerprints insert a seeded record. Known fingerprints are
    /// diffed, price-tracked, and updated additively: a `None` incoming
    /// field never clears a stored value. The whole read-modify-write runs
    /// in one transaction keyed by the fingerprint.
    pub async fn upsert_listing(
        &self,
        listing: &ScrapedListing,
        job_id: Option<i64>,
    ) -> Result<UpsertOutcome> {
        if listing.fingerprint.trim().is_empty() {
            return Err(ImobiError::Scraping(format!(
                "listing {} has no fingerprint",
                listing.url
            )));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<Sqlite, Property>(
            "SELECT * FROM properties WHERE fingerprint = ?",
        )
        .bind(&listing.fingerprint)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            None => {
                let property = Self::property_from_listing(listing, now);
                let history_json = serde_json::to_string(&property.price_history)?;

                let id = sqlx::query(
                    r#"
                    INSERT INTO properties (
                        fingerprint, source, external_id, url,
                        title, description, property_type, deal_type, status,
                        price_ron, price_eur,
                        previous_price_ron, previous_price_eur,
                        price_change_ron, price_change_percentage,
                        price_last_changed, price_change_count,
                        highest_price_ron, lowest_price_ron,
                        price_history, price_drop_alert,
                        city, county, neighborhood, address,
                        square_meters, room_count, floor, available_date,
                        created_at, updated_at
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    RETURNING id
                    "#,
                )
                .bind(&property.fingerprint)
                .bind(&property.source)
                .bind(&property.external_id)
                .bind(&property.url)
                .bind(&property.title)
                .bind(&property.description)
                .bind(&property.property_type)
                .bind(property.deal_type.map(|d| d.as_str()))
                .bind(property.status)
                .bind(property.price_ron)
                .bind(property.price_eur)
                .bind(property.previous_price_ron)
                .bind(property.previous_price_eur)
                .bind(property.price_change_ron)
                .bind(property.price_change_percentage)
                .bind(property.price_last_changed)
                .bind(property.price_change_count)
                .bind(property.highest_price_ron)
                .bind(property.lowest_price_ron)
                .bind(&history_json)
                .bind(property.price_drop_alert)
                .bind(&property.city)
                .bind(&property.county)
                .bind(&property.neighborhood)
                .bind(&property.address)
                .bind(property.square_meters)
                .bind(property.room_count)
                .bind(property.floor)
                .bind(property.available_date)
                .bind(property.created_at)
                .bind(property.updated_at)
                .fetch_one(&mut *tx)
                .await?
                .get::<i64, _>(0);

                debug!(fingerprint = %listing.fingerprint, id, "created property");

                UpsertOutcome {
                    property_id: id,
                    created: true,
                    changes: Vec::new(),
                    price_change: None,
                }
            }
            Some(mut property) => {
                let changes = detect_changes(&property, listing);
                let price_change =
                    apply_price_update(&mut property, listing.price_ron, listing.price_eur, now);

                Self::apply_non_price_fields(&mut property, listing);
                property.updated_at = Some(now);

                let history_json = serde_json::to_string(&property.price_history)?;
                let id = property.id.ok_or_else(|| {
                    ImobiError::Scraping("loaded property without row id".to_string())
                })?;

                sqlx::query(
                    r#"
                    UPDATE properties SET
                        url = ?,
                        title = ?,
                        description = ?,
                        property_type = ?,
                        deal_type = ?,
                        status = ?,
                        price_ron = ?,
                        price_eur = ?,
                        previous_price_ron = ?,
                        previous_price_eur = ?,
                        price_change_ron = ?,
                        price_change_percentage = ?,
                        price_last_changed = ?,
                        price_change_count = ?,
                        highest_price_ron = ?,
                        lowest_price_ron = ?,
                        price_history = ?,
                        price_drop_alert = ?,
                        city = ?,
                        county = ?,
                        neighborhood = ?,
                        address = ?,
                        square_meters = ?,
                        room_count = ?,
                        floor = ?,
                        available_date = ?,
                        updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&property.url)
                .bind(&property.title)
                .bind(&property.description)
                .bind(&property.property_type)
                .bind(property.deal_type.map(|d| d.as_str()))
                .bind(property.status)
                .bind(property.price_ron)
                .bind(property.price_eur)
                .bind(property.previous_price_ron)
                .bind(property.previous_price_eur)
                .bind(property.price_change_ron)
                .bind(property.price_change_percentage)
                .bind(property.price_last_changed)
                .bind(property.price_change_count)
                .bind(property.highest_price_ron)
                .bind(property.lowest_price_ron)
                .bind(&history_json)
                .bind(property.price_drop_alert)
                .bind(&property.city)
                .bind(&property.county)
                .bind(&property.neighborhood)
                .bind(&property.address)
                .bind(property.square_meters)
                .bind(property.room_count)
                .bind(property.floor)
                .bind(property.available_date)
                .bind(property.updated_at)
                .bind(id)
                .execute(&mut *tx)
                .await?;

                if !changes.is_empty() {
                    let changes_json = serde_json::to_string(&changes)?;
                    sqlx::query(
                        r#"
                        INSERT INTO property_changes (
                            property_id, fingerprint, changes, change_count,
                            changed_at, scrape_job_id
                        )
                        VALUES (?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(id)
                    .bind(&property.fingerprint)
                    .bind(&changes_json)
                    .bind(changes.len() as i64)
                    .bind(now)
                    .bind(job_id)
                    .execute(&mut *tx)
                    .await?;

                    debug!(
                        fingerprint = %property.fingerprint,
                        fields = changes.len(),
                        "recorded property changes"
                    );
                }

                UpsertOutcome {
                    property_id: id,
                    created: false,
                    changes,
                    price_change,
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    fn property_from_listing(listing: &ScrapedListing, now: DateTime<Utc>) -> Property {
        let mut property = Property {
            id: None,
            fingerprint: listing.fingerprint.clone(),
            source: listing.source.clone(),
            external_id: listing.external_id.clone(),
            url: listing.url.clone(),
            title: listing.title.clone(),
            description: listing.description.clone(),
            property_type: listing.property_type.clone(),
            deal_type: listing.deal_type,
            status: listing.status.unwrap_or_default(),
            price_ron: listing.price_ron,
            price_eur: listing.price_eur,
            previous_price_ron: None,
            previous_price_eur: None,
            price_change_ron: None,
            price_change_percentage: None,
            price_last_changed: None,
            price_change_count: 0,
            highest_price_ron: None,
            lowest_price_ron: None,
            price_history: Vec::new(),
            price_drop_alert: false,
            city: listing.city.clone(),
            county: listing.county.clone(),
            neighborhood: listing.neighborhood.clone(),
            address: listing.address.clone(),
            square_meters: listing.square_meters,
            room_count: listing.room_count,
            floor: listing.floor,
            available_date: listing.available_date,
            created_at: now,
            updated_at: Some(now),
        };
        seed_initial_price(&mut property);
        property
    }

    /// Overwrite stored fields with non-null incoming values. Price fields
    /// are handled by the tracker; here they only fill in when the stored
    /// side had nothing to diff against (missing or zero).
    fn apply_non_price_fields(property: &mut Property, listing: &ScrapedListing) {
        if let Some(v) = &listing.title {
            property.title = Some(v.clone());
        }
        if let Some(v) = &listing.description {
            property.description = Some(v.clone());
        }
        if let Some(v) = &listing.property_type {
            property.property_type = Some(v.clone());
        }
        if let Some(v) = listing.deal_type {
            property.deal_type = Some(v);
        }
        if let Some(v) = listing.status {
            property.status = v;
        }
        if let Some(v) = &listing.city {
            property.city = Some(v.clone());
        }
        if let Some(v) = &listing.county {
            property.county = Some(v.clone());
        }
        if let Some(v) = &listing.neighborhood {
            property.neighborhood = Some(v.clone());
        }
        if let Some(v) = &listing.address {
            property.address = Some(v.clone());
        }
        if let Some(v) = listing.square_meters {
            property.square_meters = Some(v);
        }
        if let Some(v) = listing.room_count {
            property.room_count = Some(v);
        }
        if let Some(v) = listing.floor {
            property.floor = Some(v);
        }
        if let Some(v) = listing.available_date {
            property.available_date = Some(v);
        }

        if let Some(v) = listing.price_ron {
            if property.price_ron.map_or(true, |p| p <= 0.0) {
                property.price_ron = Some(v);
                property.highest_price_ron.get_or_insert(v);
                property.lowest_price_ron.get_or_insert(v);
            }
        }
        if let Some(v) = listing.price_eur {
            if property.price_eur.map_or(true, |p| p <= 0.0) {
                property.price_eur = Some(v);
            }
        }
    }

    pub async fn get_property(&self, fingerprint: &str) -> Result<Option<Property>> {
        let property =
            sqlx::query_as::<Sqlite, Property>("SELECT * FROM properties WHERE fingerprint = ?")
                .bind(fingerprint)
                .fetch_optional(&self.pool)
                .await?;
        Ok(property)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn list_properties(
        &self,
        status: Option<PropertyStatus>,
        city: Option<&str>,
        min_price: Option<f64>,
        max_price: Option<f64>,
        drops_only: bool,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Property>> {
        let mut query_builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM properties WHERE 1=1");

        if let Some(status) = status {
            query_builder.push(" AND status = ");
            query_builder.push_bind(status.as_str());
        }

        if let Some(city) = city {
            query_builder.push(" AND city = ");
            query_builder.push_bind(city.to_string());
        }

        if let Some(min_price) = min_price {
            query_builder.push(" AND price_ron >= ");
            query_builder.push_bind(min_price);
        }

        if let Some(max_price) = max_price {
            query_builder.push(" AND price_ron <= ");
            query_builder.push_bind(max_price);
        }

        if drops_only {
            query_builder.push(" AND price_drop_alert = 1");
        }

        query_builder.push(" ORDER BY updated_at DESC");
        query_builder.push(" LIMIT ");
        query_builder.push_bind(limit);
        query_builder.push(" OFFSET ");
        query_builder.push_bind(offset);

        let query = query_builder.build_query_as::<Property>();
        let properties = query.fetch_all(&self.pool).await?;

        Ok(properties)
    }

    /// Properties whose most recent change tripped the drop alert, newest
    /// change first.
    pub async fn recent_price_drops(&self, limit: i64) -> Result<Vec<Property>> {
        let properties = sqlx::query_as::<Sqlite, Property>(
            r#"
            SELECT * FROM properties
            WHERE price_drop_alert = 1
            ORDER BY price_last_changed DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(properties)
    }

    pub async fn changes_for(&self, fingerprint: &str, limit: i64) -> Result<Vec<ChangeLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT fingerprint, changes, change_count, changed_at, scrape_job_id
            FROM property_changes
            WHERE fingerprint = ?
            ORDER BY changed_at DESC
            LIMIT ?
            "#,
        )
        .bind(fingerprint)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let changes_json: String = row.try_get("changes")?;
            entries.push(ChangeLogEntry {
                fingerprint: row.try_get("fingerprint")?,
                changes: serde_json::from_str(&changes_json)?,
                change_count: row.try_get("change_count")?,
                changed_at: row.try_get("changed_at")?,
                scrape_job_id: row.try_get("scrape_job_id")?,
            });
        }

        Ok(entries)
    }

    pub async fn status_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM properties GROUP BY status ORDER BY COUNT(*) DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_properties(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM properties")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_drop_alerts(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM properties WHERE price_drop_alert = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn count_change_entries(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM property_changes")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

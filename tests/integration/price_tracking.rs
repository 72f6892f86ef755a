use imobi_core::{Database, ScrapedListing};
use tempfile::tempdir;

fn listing(price_ron: Option<f64>, price_eur: Option<f64>) -> ScrapedListing {
    ScrapedListing {
        fingerprint: "test_property_001".to_string(),
        source: "imobiliare_ro".to_string(),
        external_id: "test_001".to_string(),
        url: "https://www.imobiliare.ro/inchirieri-apartamente/oferta/test-001".to_string(),
        title: Some("Apartament de test".to_string()),
        property_type: Some("apartment".to_string()),
        price_ron,
        price_eur,
        city: Some("Bucuresti".to_string()),
        ..Default::default()
    }
}

async fn test_db() -> (Database, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let db = Database::new(dir.path().join("test.db")).await.unwrap();
    (db, dir)
}

#[tokio::test]
async fn test_price_drop_sets_alert_and_history() {
    let (db, _dir) = test_db().await;

    db.upsert_listing(&listing(Some(1000.0), Some(200.0)), None)
        .await
        .unwrap();
    let outcome = db
        .upsert_listing(&listing(Some(900.0), Some(180.0)), None)
        .await
        .unwrap();

    let change = outcome.price_change.expect("price change expected");
    assert_eq!(change.change_ron, Some(-100.0));
    assert_eq!(change.percentage, Some(-10.0));

    let property = db.get_property("test_property_001").await.unwrap().unwrap();
    assert!(property.price_drop_alert);
    assert_eq!(property.price_change_count, 1);
    assert_eq!(property.price_history.len(), 1);
    assert_eq!(property.price_history[0].old_ron, Some(1000.0));
    assert_eq!(property.price_history[0].old_eur, Some(200.0));
    assert_eq!(property.previous_price_ron, Some(1000.0));
    assert_eq!(property.highest_price_ron, Some(1000.0));
    assert_eq!(property.lowest_price_ron, Some(900.0));
}

#[tokio::test]
async fn test_unchanged_price_is_noop() {
    let (db, _dir) = test_db().await;

    db.upsert_listing(&listing(Some(1000.0), None), None)
        .await
        .unwrap();
    let before = db.get_property("test_property_001").await.unwrap().unwrap();

    let outcome = db
        .upsert_listing(&listing(Some(1000.0), None), None)
        .await
        .unwrap();
    assert!(outcome.price_change.is_none());
    assert!(outcome.changes.is_empty());

    let after = db.get_property("test_property_001").await.unwrap().unwrap();
    assert_eq!(after.price_change_count, before.price_change_count);
    assert_eq!(after.price_history.len(), before.price_history.len());
    assert_eq!(after.price_drop_alert, before.price_drop_alert);
}

#[tokio::test]
async fn test_identical_update_applied_twice_counts_once() {
    let (db, _dir) = test_db().await;

    db.upsert_listing(&listing(Some(1000.0), None), None)
        .await
        .unwrap();
    db.upsert_listing(&listing(Some(900.0), None), None)
        .await
        .unwrap();
    // Same incoming values again: no additional history or count.
    db.upsert_listing(&listing(Some(900.0), None), None)
        .await
        .unwrap();

    let property = db.get_property("test_property_001").await.unwrap().unwrap();
    assert_eq!(property.price_change_count, 1);
    assert_eq!(property.price_history.len(), 1);
}

#[tokio::test]
async fn test_alert_is_not_sticky() {
    let (db, _dir) = test_db().await;

    db.upsert_listing(&listing(Some(1000.0), None), None)
        .await
        .unwrap();
    db.upsert_listing(&listing(Some(900.0), None), None)
        .await
        .unwrap();
    assert!(db
        .get_property("test_property_001")
        .await
        .unwrap()
        .unwrap()
        .price_drop_alert);

    // A later increase must clear the alert in the same update cycle.
    db.upsert_listing(&listing(Some(1100.0), None), None)
        .await
        .unwrap();
    let property = db.get_property("test_property_001").await.unwrap().unwrap();
    assert!(!property.price_drop_alert);
    assert_eq!(property.price_change_count, 2);
}

#[tokio::test]
async fn test_null_incoming_field_never_clears() {
    let (db, _dir) = test_db().await;

    let mut first = listing(Some(1000.0), None);
    first.square_meters = Some(54.0);
    first.description = Some("Renovat recent".to_string());
    db.upsert_listing(&first, None).await.unwrap();

    // Re-scrape carries no square_meters/description at all.
    let second = listing(Some(1000.0), None);
    let outcome = db.upsert_listing(&second, None).await.unwrap();
    assert!(outcome.changes.is_empty());

    let property = db.get_property("test_property_001").await.unwrap().unwrap();
    assert_eq!(property.square_meters, Some(54.0));
    assert_eq!(property.description.as_deref(), Some("Renovat recent"));
}

#[tokio::test]
async fn test_dual_currency_prefers_ron_percentage() {
    let (db, _dir) = test_db().await;

    db.upsert_listing(&listing(Some(1000.0), Some(200.0)), None)
        .await
        .unwrap();
    // RON -10%, EUR -50%.
    db.upsert_listing(&listing(Some(900.0), Some(100.0)), None)
        .await
        .unwrap();

    let property = db.get_property("test_property_001").await.unwrap().unwrap();
    assert_eq!(property.price_change_percentage, Some(-10.0));
    assert_eq!(property.price_eur, Some(100.0));
    assert_eq!(property.previous_price_eur, Some(200.0));
}

use crate::{Property, ScrapedListing};
use serde::Serialize;
use serde_json::Value;

/// Fields compared between a stored property and a fresh scrape. Anything
/// outside this list never produces a change-log entry.
pub const TRACKED_FIELDS: [&str; 9] = [
    "price_ron",
    "price_eur",
    "status",
    "title",
    "description",
    "square_meters",
    "room_count",
    "floor",
    "available_date",
];

/// A single observed field transition, with values captured as JSON for the
/// change log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub field: &'static str,
    pub old: Value,
    pub new: Value,
}

fn diff<T>(changes: &mut Vec<FieldChange>, field: &'static str, old: Option<&T>, new: Option<&T>)
where
    T: PartialEq + Serialize,
{
    // An absent incoming value means "no update", not "clear the field".
    let Some(new_value) = new else {
        return;
    };
    if old == Some(new_value) {
        return;
    }

    changes.push(FieldChange {
        field,
        old: old
            .and_then(|v| serde_json::to_value(v).ok())
            .unwrap_or(Value::Null),
        new: serde_json::to_value(new_value).unwrap_or(Value::Null),
    });
}

/// Compare a persisted property against freshly scraped fields and report the
/// transitions over the tracked-field set.
pub fn detect_changes(existing: &Property, incoming: &ScrapedListing) -> Vec<FieldChange> {
    let mut changes = Vec::new();

    diff(
        &mut changes,
        "price_ron",
        existing.price_ron.as_ref(),
        incoming.price_ron.as_ref(),
    );
    diff(
        &mut changes,
        "price_eur",
        existing.price_eur.as_ref(),
        incoming.price_eur.as_ref(),
    );
    diff(
        &mut changes,
        "status",
        Some(&existing.status),
        incoming.status.as_ref(),
    );
    diff(
        &mut changes,
        "title",
        existing.title.as_ref(),
        incoming.title.as_ref(),
    );
    diff(
        &mut changes,
        "description",
        existing.description.as_ref(),
        incoming.description.as_ref(),
    );
    diff(
        &mut changes,
        "square_meters",
        existing.square_meters.as_ref(),
        incoming.square_meters.as_ref(),
    );
    diff(
        &mut changes,
        "room_count",
        existing.room_count.as_ref(),
        incoming.room_count.as_ref(),
    );
    diff(
        &mut changes,
        "floor",
        existing.floor.as_ref(),
        incoming.floor.as_ref(),
    );
    diff(
        &mut changes,
        "available_date",
        existing.available_date.as_ref(),
        incoming.available_date.as_ref(),
    );

    changes
}

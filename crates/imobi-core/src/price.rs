use crate::{PriceHistoryEntry, Property};
use chrono::{DateTime, Utc};
use tracing::warn;

/// A change of at least this percentage downward raises the drop alert.
pub const PRICE_DROP_ALERT_THRESHOLD: f64 = -5.0;

/// The stored history is truncated to this many entries, oldest first.
pub const PRICE_HISTORY_CAP: usize = 200;

/// Computed movement for one update cycle. RON is the primary currency; when
/// both currencies move, the RON percentage is the one recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceChange {
    pub old_ron: Option<f64>,
    pub new_ron: Option<f64>,
    pub old_eur: Option<f64>,
    pub new_eur: Option<f64>,
    pub change_ron: Option<f64>,
    pub change_eur: Option<f64>,
    pub percentage: Option<f64>,
}

struct CurrencyDelta {
    old: f64,
    new: f64,
    delta: f64,
    percentage: f64,
}

/// Compare old and new price for one currency. A missing or zero old price
/// can never produce a delta, which also guards the percentage division.
fn currency_delta(old: Option<f64>, new: Option<f64>) -> Option<CurrencyDelta> {
    let (old, new) = (old?, new?);
    if old <= 0.0 || old == new {
        return None;
    }
    let delta = new - old;
    Some(CurrencyDelta {
        old,
        new,
        delta,
        percentage: delta / old * 100.0,
    })
}

/// Initialize the price-tracking state of a freshly created property. Both
/// watermarks start at the initial price; history starts empty.
pub fn seed_initial_price(property: &mut Property) {
    property.highest_price_ron = property.price_ron;
    property.lowest_price_ron = property.price_ron;
    property.previous_price_ron = None;
    property.previous_price_eur = None;
    property.price_change_ron = None;
    property.price_change_percentage = None;
    property.price_last_changed = None;
    property.price_change_count = 0;
    property.price_history = Vec::new();
    property.price_drop_alert = false;
}

/// Fold a freshly scraped pair of prices into the property's tracking state.
///
/// Returns `None` when neither currency moved; the call is then a strict
/// no-op so repeated scrapes of an unchanged listing never grow the history.
pub fn apply_price_update(
    property: &mut Property,
    new_ron: Option<f64>,
    new_eur: Option<f64>,
    now: DateTime<Utc>,
) -> Option<PriceChange> {
    let ron = currency_delta(property.price_ron, new_ron);
    let eur = currency_delta(property.price_eur, new_eur);

    if ron.is_none() && eur.is_none() {
        return None;
    }

    // Record the pre-change values before touching anything.
    property.price_history.push(PriceHistoryEntry {
        changed_at: now,
        old_ron: property.price_ron,
        old_eur: property.price_eur,
    });
    if property.price_history.len() > PRICE_HISTORY_CAP {
        let excess = property.price_history.len() - PRICE_HISTORY_CAP;
        property.price_history.drain(..excess);
    }

    let change = PriceChange {
        old_ron: ron.as_ref().map(|c| c.old),
        new_ron: ron.as_ref().map(|c| c.new),
        old_eur: eur.as_ref().map(|c| c.old),
        new_eur: eur.as_ref().map(|c| c.new),
        change_ron: ron.as_ref().map(|c| c.delta),
        change_eur: eur.as_ref().map(|c| c.delta),
        // RON wins when both currencies changed in the same cycle.
        percentage: ron
            .as_ref()
            .map(|c| c.percentage)
            .or_else(|| eur.as_ref().map(|c| c.percentage)),
    };

    if let Some(c) = &ron {
        property.previous_price_ron = Some(c.old);
        property.price_ron = Some(c.new);
        property.highest_price_ron = Some(match property.highest_price_ron {
            Some(high) => high.max(c.new),
            None => c.new,
        });
        property.lowest_price_ron = Some(match property.lowest_price_ron {
            Some(low) => low.min(c.new),
            None => c.new,
        });
    }
    if let Some(c) = &eur {
        property.previous_price_eur = Some(c.old);
        property.price_eur = Some(c.new);
    }

    property.price_change_ron = change.change_ron;
    property.price_change_percentage = change.percentage;
    property.price_change_count += 1;
    property.price_last_changed = Some(now);

    // Recomputed on every change: a later rise clears a previous alert.
    property.price_drop_alert = change
        .percentage
        .map(|p| p <= PRICE_DROP_ALERT_THRESHOLD)
        .unwrap_or(false);

    if property.price_drop_alert {
        warn!(
            fingerprint = %property.fingerprint,
            old = ?change.old_ron.or(change.old_eur),
            new = ?change.new_ron.or(change.new_eur),
            percentage = ?change.percentage,
            "significant price drop detected"
        );
    }

    Some(change)
}

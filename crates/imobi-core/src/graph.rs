use crate::Property;
use chrono::{DateTime, Utc};
use rasciigraph::{plot, Config};
use serde::{Deserialize, Serialize};

/// Chronological RON price points reconstructed from a property's stored
/// history plus its current price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceGraph {
    pub points: Vec<(f64, DateTime<Utc>)>,
}

impl PriceGraph {
    pub fn new(points: Vec<(f64, DateTime<Utc>)>) -> Self {
        Self { points }
    }

    /// Build the RON series for a property. History entries carry the price
    /// as it was before each change; the current price closes the series.
    pub fn from_property(property: &Property) -> Option<Self> {
        let mut points: Vec<(f64, DateTime<Utc>)> = property
            .price_history
            .iter()
            .filter_map(|entry| entry.old_ron.map(|price| (price, entry.changed_at)))
            .collect();

        let current = property.price_ron?;
        points.push((
            current,
            property.updated_at.unwrap_or(property.created_at),
        ));

        Some(Self::new(points))
    }

    pub fn to_ascii_graph(&self, width: usize, height: usize) -> String {
        if self.points.is_empty() {
            return "No hist".to_string();
        }

        // Plot in thousands of RON, rounded.
        let prices: Vec<f64> = self
            .points
            .iter()
            .map(|(price, _)| (*price / 1000.0).round())
            .collect();

        let config = Config::default()
            .with_width(width as u32)
            .with_height(height as u32);
        let graph = plot(prices, config);

        graph
            .lines()
            .map(|line| format!("{:width$}", line, width = width))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

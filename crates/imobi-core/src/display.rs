use crate::{Property, PropertyDisplay};
use colored::Colorize;
use tabled::settings::{object::Columns, Modify, Style, Width};
use tabled::{Table, Tabled};

#[derive(Tabled)]
pub struct PropertyTableRow {
    #[tabled(rename = "Title")]
    pub title: String,
    #[tabled(rename = "RON", display_with = "display_right_10")]
    pub price_ron: String,
    #[tabled(rename = "Change", display_with = "display_right_8")]
    pub change: String,
    #[tabled(rename = "Status")]
    pub status: String,
    #[tabled(rename = "History", display_with = "display_right_12")]
    pub price_history: String,
    #[tabled(rename = "Rooms", display_with = "display_right_5")]
    pub rooms: String,
    #[tabled(rename = "City")]
    pub city: String,
}

fn display_right_12(s: &str) -> String {
    format!("{:>12}", s)
}

fn display_right_10(s: &str) -> String {
    format!("{:>10}", s)
}

fn display_right_8(s: &str) -> String {
    format!("{:>8}", s)
}

fn display_right_5(s: &str) -> String {
    format!("{:>5}", s)
}

fn format_change(property: &Property) -> String {
    match property.price_change_percentage {
        Some(pct) if property.price_drop_alert => format!("{:+.1}%", pct).red().to_string(),
        Some(pct) if pct < 0.0 => format!("{:+.1}%", pct).yellow().to_string(),
        Some(pct) => format!("{:+.1}%", pct),
        None => "-".to_string(),
    }
}

impl PropertyTableRow {
    pub fn from_property_display(display: &PropertyDisplay, graph_height: u8) -> Self {
        let history = display
            .graph
            .as_ref()
            .map(|g| g.to_ascii_graph(12, graph_height as usize).replace('\n', " "))
            .unwrap_or_else(|| "No hist".to_string());

        let price_str = display
            .property
            .price_ron
            .map(|p| format!("{:.0}", p))
            .unwrap_or_else(|| "N/A".to_string());

        let rooms_str = display
            .property
            .room_count
            .map(|r| r.to_string())
            .unwrap_or_else(|| "N/A".to_string());

        Self {
            title: display
                .property
                .title
                .clone()
                .unwrap_or_else(|| "(untitled)".to_string()),
            price_ron: price_str,
            change: format_change(&display.property),
            status: display.property.status.to_string(),
            price_history: history,
            rooms: rooms_str,
            city: display
                .property
                .city
                .clone()
                .unwrap_or_else(|| "N/A".to_string()),
        }
    }
}

pub fn create_property_table(displays: &[PropertyDisplay], graph_height: u8) -> String {
    let table_rows: Vec<PropertyTableRow> = displays
        .iter()
        .map(|d| PropertyTableRow::from_property_display(d, graph_height))
        .collect();

    let mut table = Table::new(&table_rows);

    table
        .with(Style::modern())
        .with(Modify::new(Columns::single(0)).with(Width::truncate(40)))
        .with(Modify::new(Columns::single(1)).with(Width::truncate(10)))
        .with(Modify::new(Columns::single(2)).with(Width::truncate(8)))
        .with(Modify::new(Columns::single(3)).with(Width::truncate(8)))
        .with(Modify::new(Columns::single(4)).with(Width::truncate(12)))
        .with(Modify::new(Columns::single(5)).with(Width::truncate(5)))
        .with(Modify::new(Columns::single(6)).with(Width::wrap(24)));

    table.to_string()
}

#[derive(Tabled)]
struct DropTableRow {
    #[tabled(rename = "Fingerprint")]
    fingerprint: String,
    #[tabled(rename = "Title")]
    title: String,
    #[tabled(rename = "Old RON", display_with = "display_right_10")]
    old_price: String,
    #[tabled(rename = "New RON", display_with = "display_right_10")]
    new_price: String,
    #[tabled(rename = "Change", display_with = "display_right_8")]
    change: String,
}

/// Table of properties whose last change raised the drop alert.
pub fn create_drops_table(properties: &[Property]) -> String {
    let rows: Vec<DropTableRow> = properties
        .iter()
        .map(|p| DropTableRow {
            fingerprint: p.fingerprint.chars().take(12).collect(),
            title: p.title.clone().unwrap_or_else(|| "(untitled)".to_string()),
            old_price: p
                .previous_price_ron
                .map(|v| format!("{:.0}", v))
                .unwrap_or_else(|| "-".to_string()),
            new_price: p
                .price_ron
                .map(|v| format!("{:.0}", v))
                .unwrap_or_else(|| "-".to_string()),
            change: p
                .price_change_percentage
                .map(|v| format!("{:+.1}%", v))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let mut table = Table::new(&rows);
    table
        .with(Style::modern())
        .with(Modify::new(Columns::single(1)).with(Width::truncate(44)));

    table.to_string()
}

use clap::{Parser, Subcommand, ValueEnum};
use imobi_core::{
    create_drops_table, create_property_table, Database, DealType, PropertyDisplay, PropertyStatus,
    Result,
};
use imobi_scrapers::{
    HttpFetcher, ImobiliareScraper, ListingSource, ProxyPoolConfig, ProxyPoolManager,
    WebshareClient,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const WEBSHARE_API_URL: &str = "https://proxy.webshare.io/api/v2";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl imobiliare.ro listings into the database
    #[command(about = "Crawl imobiliare.ro listings into the database")]
    Crawl(CrawlCommand),

    /// List stored properties
    #[command(about = "List stored properties with price-change columns")]
    List(ListCommand),

    /// Export stored properties to CSV
    #[command(about = "Export stored properties to CSV")]
    Export(ExportCommand),

    /// Show the recorded price history of one property
    #[command(about = "Show the recorded price history of one property")]
    History(HistoryCommand),

    /// Show monitoring counters
    #[command(about = "Show status counts and recent price drops")]
    Stats(StatsCommand),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliDealType {
    Rent,
    Buy,
}

impl From<CliDealType> for DealType {
    fn from(value: CliDealType) -> Self {
        match value {
            CliDealType::Rent => DealType::Rent,
            CliDealType::Buy => DealType::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliStatus {
    Active,
    Inactive,
    Rented,
    Blocked,
    Pending,
}

impl From<CliStatus> for PropertyStatus {
    fn from(value: CliStatus) -> Self {
        match value {
            CliStatus::Active => PropertyStatus::Active,
            CliStatus::Inactive => PropertyStatus::Inactive,
            CliStatus::Rented => PropertyStatus::Rented,
            CliStatus::Blocked => PropertyStatus::Blocked,
            CliStatus::Pending => PropertyStatus::Pending,
        }
    }
}

#[derive(Parser)]
struct CrawlCommand {
    /// Deal type to crawl (-t, --deal-type)
    #[arg(short = 't', long, value_enum, default_value_t = CliDealType::Rent)]
    deal_type: CliDealType,

    /// Maximum number of listing pages (-c, --max-pages)
    #[arg(short = 'c', long, default_value_t = 5)]
    max_pages: u32,

    /// Concurrent detail fetches (-j, --concurrency)
    #[arg(short = 'j', long, default_value_t = 8)]
    concurrency: usize,

    /// Skip the proxy pool and fetch directly
    #[arg(long)]
    no_proxy: bool,

    /// Database file path (-d, --database)
    #[arg(short = 'd', long, default_value = "imobi.db")]
    database: PathBuf,
}

#[derive(Parser)]
struct ListCommand {
    /// Database file path (-d, --database)
    #[arg(short = 'd', long, default_value = "imobi.db")]
    database: PathBuf,

    /// Status to filter by (-s, --status)
    #[arg(short = 's', long, value_enum)]
    status: Option<CliStatus>,

    /// City to filter by (-C, --city)
    #[arg(short = 'C', long)]
    city: Option<String>,

    /// Minimum RON price (-p, --min-price)
    #[arg(short = 'p', long)]
    min_price: Option<f64>,

    /// Maximum RON price (-P, --max-price)
    #[arg(short = 'P', long)]
    max_price: Option<f64>,

    /// Only properties with an active price-drop alert
    #[arg(long)]
    drops_only: bool,

    /// Maximum number of rows (-l, --limit)
    #[arg(short = 'l', long, default_value_t = 20)]
    limit: i64,

    /// Number of rows to skip (-o, --offset)
    #[arg(short = 'o', long, default_value_t = 0)]
    offset: i64,

    /// Height of the price history graph in lines (-g, --graph-height)
    #[arg(short = 'g', long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=5))]
    graph_height: u8,
}

#[derive(Parser)]
struct ExportCommand {
    /// Output file path (-o, --output)
    #[arg(short = 'o', long, default_value = "properties.csv")]
    output: PathBuf,

    /// Database file path (-d, --database)
    #[arg(short = 'd', long, default_value = "imobi.db")]
    database: PathBuf,
}

#[derive(Parser)]
struct HistoryCommand {
    /// Property fingerprint
    fingerprint: String,

    /// Database file path (-d, --database)
    #[arg(short = 'd', long, default_value = "imobi.db")]
    database: PathBuf,
}

#[derive(Parser)]
struct StatsCommand {
    /// Database file path (-d, --database)
    #[arg(short = 'd', long, default_value = "imobi.db")]
    database: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Crawl(cmd) => crawl(cmd).await?,
        Commands::List(cmd) => list(cmd).await?,
        Commands::Export(cmd) => export(cmd).await?,
        Commands::History(cmd) => history(cmd).await?,
        Commands::Stats(cmd) => stats(cmd).await?,
    }

    Ok(())
}

async fn crawl(cmd: CrawlCommand) -> Result<()> {
    let db = Database::new(&cmd.database).await?;

    let pool = if cmd.no_proxy {
        None
    } else {
        match std::env::var("WEBSHARE_API_KEY") {
            Ok(api_key) => {
                let provider = Arc::new(WebshareClient::new(WEBSHARE_API_URL, api_key)?);
                let pool = Arc::new(ProxyPoolManager::new(provider, ProxyPoolConfig::default()));
                let active = pool.refresh().await.unwrap_or(0);
                pool.check_quota().await;
                if active == 0 {
                    warn!("proxy pool is empty after initial refresh");
                }
                Some(pool)
            }
            Err(_) => {
                warn!("WEBSHARE_API_KEY not set; crawling without proxies");
                None
            }
        }
    };

    let scraper = ImobiliareScraper::new(
        Arc::new(HttpFetcher::new()),
        pool.clone(),
        cmd.deal_type.into(),
    );

    let job_id = db.create_scrape_job(scraper.source_name()).await?;
    let listings = scraper
        .scrape_listings(cmd.max_pages, cmd.concurrency)
        .await?;

    let mut saved = 0i64;
    let mut created = 0i64;
    let mut price_changes = 0i64;
    for listing in &listings {
        match db.upsert_listing(listing, Some(job_id)).await {
            Ok(outcome) => {
                saved += 1;
                if outcome.created {
                    created += 1;
                }
                if outcome.price_change.is_some() {
                    price_changes += 1;
                }
            }
            Err(e) => warn!(fingerprint = %listing.fingerprint, error = %e, "failed to save listing"),
        }
    }

    db.close_scrape_job(job_id, saved).await?;
    info!(saved, created, price_changes, "crawl finished");

    if let Some(pool) = pool {
        println!("{}", pool.summary());
    }

    Ok(())
}

async fn list(cmd: ListCommand) -> Result<()> {
    let db = Database::new(&cmd.database).await?;
    let properties = db
        .list_properties(
            cmd.status.map(Into::into),
            cmd.city.as_deref(),
            cmd.min_price,
            cmd.max_price,
            cmd.drops_only,
            cmd.limit,
            cmd.offset,
        )
        .await?;

    let displays: Vec<PropertyDisplay> = properties.into_iter().map(PropertyDisplay::new).collect();
    println!("{}", create_property_table(&displays, cmd.graph_height));
    Ok(())
}

async fn export(cmd: ExportCommand) -> Result<()> {
    let db = Database::new(&cmd.database).await?;
    let properties = db
        .list_properties(None, None, None, None, false, i64::MAX, 0)
        .await?;

    let mut writer = csv::Writer::from_path(&cmd.output)?;
    writer.write_record([
        "Fingerprint",
        "Title",
        "Status",
        "Price (RON)",
        "Price (EUR)",
        "Change %",
        "City",
        "Rooms",
        "URL",
    ])?;
    for property in &properties {
        writer.write_record([
            property.fingerprint.clone(),
            property.title.clone().unwrap_or_default(),
            property.status.to_string(),
            property
                .price_ron
                .map(|v| v.to_string())
                .unwrap_or_default(),
            property
                .price_eur
                .map(|v| v.to_string())
                .unwrap_or_default(),
            property
                .price_change_percentage
                .map(|v| format!("{:.2}", v))
                .unwrap_or_default(),
            property.city.clone().unwrap_or_default(),
            property
                .room_count
                .map(|v| v.to_string())
                .unwrap_or_default(),
            property.url.clone(),
        ])?;
    }
    writer.flush()?;

    info!(count = properties.len(), output = %cmd.output.display(), "export complete");
    Ok(())
}

async fn history(cmd: HistoryCommand) -> Result<()> {
    let db = Database::new(&cmd.database).await?;
    let Some(property) = db.get_property(&cmd.fingerprint).await? else {
        println!("No property with fingerprint {}", cmd.fingerprint);
        return Ok(());
    };

    println!(
        "{} ({})",
        property.title.as_deref().unwrap_or("(untitled)"),
        property.status
    );
    println!(
        "current: {} RON / {} EUR, {} recorded changes",
        property
            .price_ron
            .map(|v| format!("{:.0}", v))
            .unwrap_or_else(|| "-".to_string()),
        property
            .price_eur
            .map(|v| format!("{:.0}", v))
            .unwrap_or_else(|| "-".to_string()),
        property.price_change_count
    );
    if let (Some(high), Some(low)) = (property.highest_price_ron, property.lowest_price_ron) {
        println!("range: {:.0} - {:.0} RON", low, high);
    }

    for entry in &property.price_history {
        println!(
            "  {}  RON {}  EUR {}",
            entry.changed_at.format("%Y-%m-%d %H:%M"),
            entry
                .old_ron
                .map(|v| format!("{:.0}", v))
                .unwrap_or_else(|| "-".to_string()),
            entry
                .old_eur
                .map(|v| format!("{:.0}", v))
                .unwrap_or_else(|| "-".to_string()),
        );
    }

    let display = PropertyDisplay::new(property);
    if let Some(graph) = &display.graph {
        println!("\n{}", graph.to_ascii_graph(40, 5));
    }

    let changes = db.changes_for(&cmd.fingerprint, 10).await?;
    if !changes.is_empty() {
        println!("\nrecent field changes:");
        for entry in changes {
            println!(
                "  {}  {} field(s): {}",
                entry.changed_at.format("%Y-%m-%d %H:%M"),
                entry.change_count,
                entry.changes
            );
        }
    }

    Ok(())
}

async fn stats(cmd: StatsCommand) -> Result<()> {
    let db = Database::new(&cmd.database).await?;

    println!("properties: {}", db.count_properties().await?);
    for (status, count) in db.status_counts().await? {
        println!("  {:10} {}", status, count);
    }
    println!("recorded change events: {}", db.count_change_entries().await?);
    println!("active price-drop alerts: {}", db.count_drop_alerts().await?);

    let drops = db.recent_price_drops(10).await?;
    if !drops.is_empty() {
        println!("\nrecent price drops:");
        println!("{}", create_drops_table(&drops));
    }

    Ok(())
}

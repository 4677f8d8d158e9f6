//! Perfi: crypto cost-basis accounting from the command line
//!
//! Usage:
//!   perfi import-chain --address 0x.. --chain avalanche --file txs.json
//!   perfi group-transactions --entity alice
//!   perfi generate-costbasis --entity alice
//!   perfi generate-8949 --entity alice --year 2022

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use engine::{
    write_locked_lots, AssetImport, DailyPriceFeed, Engine, EngineConfig, EngineError, FiatRates,
    RawImport, RegenerateOptions, ReportFormat, TxLogicalType,
};
use persistence::repository::{EntityRepository, SettingRepository};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tracing::{error, info};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "perfi")]
#[command(about = "Cost-basis accounting for crypto portfolios", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage entities
    Entity {
        #[command(subcommand)]
        command: EntityCommands,
    },
    /// Manage addresses
    Address {
        #[command(subcommand)]
        command: AddressCommands,
    },
    /// Read or write a setting
    Setting {
        #[command(subcommand)]
        command: SettingCommands,
    },
    /// Load asset_price / asset_tx rows from a JSON file
    ImportAssets {
        #[arg(long)]
        file: PathBuf,
    },
    /// Load raw on-chain records for an address and rebuild its ledgers
    ImportChain {
        #[arg(long)]
        address: String,
        #[arg(long)]
        chain: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Load an exchange export for an account and rebuild its ledgers
    ImportExchange {
        /// Account identifier the export belongs to
        #[arg(long)]
        address: String,
        /// Exchange name, e.g. coinbase or kraken
        #[arg(long)]
        exchange: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Group ledgers into logical transactions and type them
    GroupTransactions {
        #[arg(long)]
        entity: String,
    },
    /// Regenerate cost-basis lots, disposals and income
    GenerateCostbasis {
        #[arg(long)]
        entity: String,
        /// Only process logicals in this reporting year
        #[arg(long)]
        year: Option<i32>,
        /// Keep existing rows and continue from this tx_logical id
        #[arg(long)]
        resume_from: Option<String>,
    },
    /// Lock the lots of a year and export them
    CloseYear {
        #[arg(long)]
        entity: String,
        #[arg(long)]
        year: i32,
        /// Output directory
        #[arg(long, default_value = "output")]
        output: PathBuf,
        /// csv or json
        #[arg(long, default_value = "csv")]
        format: String,
    },
    /// Write Form 8949, income and open lots for a year
    Generate8949 {
        #[arg(long)]
        entity: String,
        #[arg(long)]
        year: i32,
        /// Output directory
        #[arg(long, default_value = "output")]
        output: PathBuf,
        /// csv or json
        #[arg(long, default_value = "csv")]
        format: String,
    },
    /// Edit a ledger
    Ledger {
        #[command(subcommand)]
        command: LedgerCommands,
    },
    /// Edit a logical transaction
    Logical {
        #[command(subcommand)]
        command: LogicalCommands,
    },
}

#[derive(Subcommand)]
enum EntityCommands {
    Create {
        name: String,
        #[arg(long)]
        note: Option<String>,
    },
    List,
}

#[derive(Subcommand)]
enum AddressCommands {
    Add {
        #[arg(long)]
        entity: String,
        #[arg(long)]
        label: String,
        #[arg(long)]
        chain: String,
        #[arg(long)]
        address: String,
    },
    List {
        #[arg(long)]
        entity: String,
    },
}

#[derive(Subcommand)]
enum SettingCommands {
    Get { key: String },
    Set { key: String, value: String },
}

#[derive(Subcommand)]
enum LedgerCommands {
    /// Move a ledger into another logical
    Move {
        #[arg(long)]
        id: String,
        #[arg(long)]
        to: String,
    },
    UpdateType {
        #[arg(long)]
        id: String,
        #[arg(long = "type")]
        tx_ledger_type: String,
    },
    UpdatePrice {
        #[arg(long)]
        id: String,
        #[arg(long)]
        price: Decimal,
        #[arg(long, default_value = "manual")]
        source: String,
    },
}

#[derive(Subcommand)]
enum LogicalCommands {
    SetType {
        #[arg(long)]
        id: String,
        #[arg(long = "type")]
        tx_logical_type: String,
    },
    AddFlag {
        #[arg(long)]
        id: String,
        #[arg(long)]
        flag: String,
    },
    RemoveFlag {
        #[arg(long)]
        id: String,
        #[arg(long)]
        flag: String,
    },
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let default = if verbose {
        "debug,engine=debug,persistence=debug"
    } else {
        "info,engine=info,persistence=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_logging(cli.verbose);

    if let Err(e) = run(cli.command).await {
        error!("{:#}", e);
        if let Some(EngineError::Interrupted {
            last_tx_logical_id, ..
        }) = e.downcast_ref::<EngineError>()
        {
            println!("The last in-progress tx_logical_id was: {}", last_tx_logical_id);
        }
        std::process::exit(1);
    }
    Ok(())
}

async fn run(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Entity { command } => cmd_entity(command).await,
        Commands::Address { command } => cmd_address(command).await,
        Commands::Setting { command } => cmd_setting(command).await,
        Commands::ImportAssets { file } => {
            let assets: AssetImport = read_json(&file)?;
            let mut engine = open_engine().await?;
            engine.import_assets(&assets).await?;
            println!(
                "Imported {} prices and {} token mappings",
                assets.prices.len(),
                assets.txs.len()
            );
            Ok(())
        }
        Commands::ImportChain {
            address,
            chain,
            file,
        } => {
            let records: Vec<RawImport> = read_json(&file)?;
            let engine = open_engine().await?;
            let ledgers = engine.import_chain(&address, &chain, &records).await?;
            println!("{} records stored, {} ledgers rebuilt for {}", records.len(), ledgers, address);
            Ok(())
        }
        Commands::ImportExchange {
            address,
            exchange,
            file,
        } => {
            let records: Vec<RawImport> = read_json(&file)?;
            let engine = open_engine().await?;
            let ledgers = engine.import_exchange(&address, &exchange, &records).await?;
            println!("{} records stored, {} ledgers rebuilt for {}", records.len(), ledgers, address);
            Ok(())
        }
        Commands::GroupTransactions { entity } => {
            let engine = open_engine().await?;
            let summary = engine.group_transactions(&entity).await?;
            println!(
                "Addresses: {} | Logicals: {} | Untyped: {} | Ledgers moved: {}",
                summary.addresses, summary.logicals, summary.untyped, summary.ledgers_moved
            );
            Ok(())
        }
        Commands::GenerateCostbasis {
            entity,
            year,
            resume_from,
        } => cmd_generate_costbasis(&entity, year, resume_from).await,
        Commands::CloseYear {
            entity,
            year,
            output,
            format,
        } => {
            let format: ReportFormat = format.parse()?;
            let engine = open_engine().await?;
            let lots = engine.close_year(&entity, year).await?;
            let path = write_locked_lots(&lots, &entity, year, &output, format)?;
            println!("Locked {} lots for {} in {}", lots.len(), entity, year);
            println!("Exported to {}", path.display());
            Ok(())
        }
        Commands::Generate8949 {
            entity,
            year,
            output,
            format,
        } => cmd_generate_8949(&entity, year, &output, &format).await,
        Commands::Ledger { command } => cmd_ledger(command).await,
        Commands::Logical { command } => cmd_logical(command).await,
    }
}

async fn open_database() -> anyhow::Result<persistence::Database> {
    let db_path = std::env::var("PERFI_DB_PATH").unwrap_or_else(|_| "data/perfi.db".to_string());
    let db = persistence::Database::new(&db_path)
        .await
        .map_err(|e| anyhow::anyhow!("Database initialization failed: {}", e))?;
    info!("Database opened: {}", db_path);
    Ok(db)
}

async fn open_engine() -> anyhow::Result<Engine> {
    let db = open_database().await?;

    let prices = match std::env::var("PERFI_PRICES_PATH") {
        Ok(path) => DailyPriceFeed::load(&path)
            .with_context(|| format!("Failed to load prices from {}", path))?,
        Err(_) => DailyPriceFeed::new(),
    };
    let fiat = match std::env::var("PERFI_FIAT_RATES_PATH") {
        Ok(path) => FiatRates::load(&path)
            .with_context(|| format!("Failed to load fiat rates from {}", path))?,
        Err(_) => FiatRates::new(),
    };

    let engine = Engine::new(db, Box::new(prices), fiat, EngineConfig::default())
        .await
        .context("Failed to start engine")?;
    Ok(engine)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

// ============================================================================
// Entities, addresses, settings
// ============================================================================

async fn cmd_entity(command: EntityCommands) -> anyhow::Result<()> {
    match command {
        EntityCommands::Create { name, note } => {
            let engine = open_engine().await?;
            let entity = engine.create_entity(&name, note.as_deref()).await?;
            println!("Created entity {} (id {})", entity.name, entity.id);
        }
        EntityCommands::List => {
            let db = open_database().await?;
            let entities = EntityRepository::new(db.pool()).list().await?;
            println!("  {:>4}  {:<24} {}", "id", "name", "note");
            println!("  {}", "-".repeat(50));
            for e in entities {
                println!("  {:>4}  {:<24} {}", e.id, e.name, e.note.unwrap_or_default());
            }
        }
    }
    Ok(())
}

async fn cmd_address(command: AddressCommands) -> anyhow::Result<()> {
    match command {
        AddressCommands::Add {
            entity,
            label,
            chain,
            address,
        } => {
            let engine = open_engine().await?;
            let record = engine.add_address(&entity, &label, &chain, &address).await?;
            println!("Added {} ({}) to {}", record.address, record.chain, entity);
        }
        AddressCommands::List { entity } => {
            let db = open_database().await?;
            let addresses = EntityRepository::new(db.pool())
                .addresses_for_entity(&entity)
                .await?;
            println!("  {:<16} {:<12} {}", "label", "chain", "address");
            println!("  {}", "-".repeat(75));
            for a in addresses {
                println!("  {:<16} {:<12} {}", a.label, a.chain, a.address);
            }
        }
    }
    Ok(())
}

async fn cmd_setting(command: SettingCommands) -> anyhow::Result<()> {
    let db = open_database().await?;
    let repo = SettingRepository::new(db.pool());
    match command {
        SettingCommands::Get { key } => match repo.get(&key).await? {
            Some(value) => println!("{} = {}", key, value),
            None => println!("{} is not set", key),
        },
        SettingCommands::Set { key, value } => {
            repo.set(&key, &value).await?;
            println!("{} = {}", key, value);
        }
    }
    Ok(())
}

// ============================================================================
// Cost basis and reports
// ============================================================================

async fn cmd_generate_costbasis(
    entity: &str,
    year: Option<i32>,
    resume_from: Option<String>,
) -> anyhow::Result<()> {
    println!("\n=== Perfi v{} ===", APP_VERSION);
    let engine = open_engine().await?;
    let options = RegenerateOptions { year, resume_from };
    let summary = engine.regenerate_costbasis(entity, &options).await?;

    println!("\nCostbasis for {}:", entity);
    println!("  Logicals processed: {}", summary.processed);
    println!("  Logicals skipped:   {}", summary.skipped);
    println!("  Lots:               {}", summary.lots);
    println!("  Disposals:          {}", summary.disposals);
    println!("  Income rows:        {}", summary.income);
    Ok(())
}

async fn cmd_generate_8949(
    entity: &str,
    year: i32,
    output: &Path,
    format: &str,
) -> anyhow::Result<()> {
    let format: ReportFormat = format.parse()?;
    let engine = open_engine().await?;
    let report = engine.form_8949(entity, year).await?;
    let files = report.write(output, format)?;

    println!("\nForm 8949 for {} ({}):", entity, year);
    println!(
        "  Short-term: {} | Long-term: {} | Income: {} | Open lots: {}",
        report.short_term.len(),
        report.long_term.len(),
        report.income.len(),
        report.lots.len()
    );
    println!("  Net gain: {:+.2}", report.total_gain());
    for f in files {
        println!("  Wrote {}", f.display());
    }
    Ok(())
}

// ============================================================================
// Manual edits
// ============================================================================

async fn cmd_ledger(command: LedgerCommands) -> anyhow::Result<()> {
    let engine = open_engine().await?;
    match command {
        LedgerCommands::Move { id, to } => {
            engine.move_ledger(&id, &to).await?;
            println!("Moved {} to {}", id, to);
        }
        LedgerCommands::UpdateType { id, tx_ledger_type } => {
            engine.update_ledger_type(&id, &tx_ledger_type).await?;
            println!("{} is now {}", id, tx_ledger_type);
        }
        LedgerCommands::UpdatePrice { id, price, source } => {
            engine.update_ledger_price(&id, price, &source).await?;
            println!("{} priced at {} ({})", id, price, source);
        }
    }
    Ok(())
}

async fn cmd_logical(command: LogicalCommands) -> anyhow::Result<()> {
    let engine = open_engine().await?;
    match command {
        LogicalCommands::SetType {
            id,
            tx_logical_type,
        } => {
            let parsed: TxLogicalType = tx_logical_type.parse()?;
            engine.update_logical_type(&id, parsed).await?;
            println!("{} is now {}", id, parsed);
        }
        LogicalCommands::AddFlag { id, flag } => {
            engine.add_logical_flag(&id, &flag).await?;
            println!("Flagged {} with {}", id, flag);
        }
        LogicalCommands::RemoveFlag { id, flag } => {
            engine.remove_logical_flag(&id, &flag).await?;
            println!("Removed {} from {}", flag, id);
        }
    }
    Ok(())
}

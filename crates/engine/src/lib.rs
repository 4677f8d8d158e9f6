//! Perfi engine: crypto cost-basis accounting
//!
//! Turns raw chain and exchange records into ledgers and logical
//! transactions, then derives cost-basis lots, disposals and income.
//! Provides:
//! - Asset registry with like-kind, wrapped and fixed-price tables
//! - Ledger builder and logical grouper/typer
//! - Replayable event log for user edits
//! - Cost-basis generator with HIFO/FIFO/LIFO/LOW lot matching
//! - Form 8949 and locked-lot exports

pub mod asset;
pub mod config;
pub mod costbasis;
pub mod engine;
pub mod error;
pub mod events;
pub mod ledger;
pub mod logical;
pub mod price;
pub mod raw;
pub mod report;
pub mod types;

// Re-exports for convenience
pub use asset::AssetRegistry;
pub use config::EngineConfig;
pub use costbasis::{CostbasisGenerator, LotBook};
pub use engine::{AssetImport, Engine, GroupSummary, RawImport, RegenerateOptions, RegenerateSummary};
pub use error::{EngineError, EngineResult, LogicalError};
pub use events::{Event, EventAction, EventLog};
pub use ledger::LedgerBuilder;
pub use logical::{load_logicals, Classification, Classifier};
pub use price::{DailyPriceFeed, FiatRates, PriceFeed};
pub use raw::RawIngestRecord;
pub use report::{write_locked_lots, Form8949Row, ReportFormat, TaxReport};
pub use types::*;

//! Year-end exports
//!
//! Form 8949 rows split by holding period, income for the year, open lots,
//! and the flat export of lots locked when a year is closed. Everything is
//! written as CSV files or as a single JSON document.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, FixedOffset};
use persistence::repository::{CostbasisRepository, FlagRepository, TxLogicalRepository};
use persistence::SqlitePool;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{
    CostbasisDisposal, CostbasisIncome, CostbasisLot, FlagName, FlagTarget, CLOSE_TO_ZERO,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Csv,
    Json,
}

impl FromStr for ReportFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            other => Err(EngineError::InvalidRecord(format!("unknown report format {other}"))),
        }
    }
}

/// One line of Form 8949
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Form8949Row {
    pub description: String,
    pub date_acquired: String,
    pub date_sold: String,
    pub proceeds: Decimal,
    pub cost_basis: Decimal,
    pub gain: Decimal,
    pub tx_ledger_id: String,
    pub basis_tx_ledger_id: String,
    pub price_source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaxReport {
    pub entity: String,
    pub year: i32,
    pub short_term: Vec<Form8949Row>,
    pub long_term: Vec<Form8949Row>,
    pub income: Vec<CostbasisIncome>,
    pub lots: Vec<CostbasisLot>,
}

fn format_date(timestamp: i64, offset_hours: i32) -> String {
    let offset = FixedOffset::east_opt(offset_hours * 3600)
        .or_else(|| FixedOffset::east_opt(0));
    match (DateTime::from_timestamp(timestamp, 0), offset) {
        (Some(dt), Some(offset)) => dt.with_timezone(&offset).format("%m/%d/%Y").to_string(),
        _ => timestamp.to_string(),
    }
}

impl TaxReport {
    /// Assemble a report from rows already restricted to the year.
    /// Disposals carrying `hidden_from_8949` are left out.
    pub fn build(
        config: &EngineConfig,
        entity: &str,
        year: i32,
        disposals: &[CostbasisDisposal],
        income: Vec<CostbasisIncome>,
        lots: Vec<CostbasisLot>,
    ) -> Self {
        let mut short_term = Vec::new();
        let mut long_term = Vec::new();
        for d in disposals {
            if d.flags.contains(&FlagName::HiddenFrom8949) {
                debug!(tx_ledger_id = %d.tx_ledger_id, "Hidden from 8949");
                continue;
            }
            let row = Form8949Row {
                description: format!("{} {}", d.amount.normalize(), d.symbol),
                date_acquired: format_date(d.basis_timestamp, config.reporting_offset_hours),
                date_sold: format_date(d.timestamp, config.reporting_offset_hours),
                proceeds: d.total_usd.round_dp(2),
                cost_basis: d.basis_usd.round_dp(2),
                gain: d.gain_usd().round_dp(2),
                tx_ledger_id: d.tx_ledger_id.clone(),
                basis_tx_ledger_id: d.basis_tx_ledger_id.clone(),
                price_source: d.price_source.clone(),
            };
            if config.is_long_term(d.duration_held) {
                long_term.push(row);
            } else {
                short_term.push(row);
            }
        }

        Self {
            entity: entity.to_string(),
            year,
            short_term,
            long_term,
            income,
            lots: lots
                .into_iter()
                .filter(|l| l.current_amount > CLOSE_TO_ZERO)
                .collect(),
        }
    }

    /// Read the year's disposals, income and open lots for an entity
    pub async fn load(
        pool: &SqlitePool,
        config: &EngineConfig,
        entity: &str,
        year: i32,
    ) -> EngineResult<Self> {
        let (start, end) = config.year_bounds(year);
        let costbasis = CostbasisRepository::new(pool);

        let mut disposals = costbasis
            .disposals_for_entity(entity, start, end)
            .await?
            .into_iter()
            .map(CostbasisDisposal::try_from)
            .collect::<EngineResult<Vec<_>>>()?;
        mark_hidden(pool, &mut disposals).await?;

        let income = costbasis
            .income_for_entity(entity, start, end)
            .await?
            .into_iter()
            .map(CostbasisIncome::try_from)
            .collect::<EngineResult<Vec<_>>>()?;
        let lots = costbasis
            .lots_for_entity(entity)
            .await?
            .into_iter()
            .map(CostbasisLot::try_from)
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(Self::build(config, entity, year, &disposals, income, lots))
    }

    pub fn total_gain(&self) -> Decimal {
        self.short_term
            .iter()
            .chain(&self.long_term)
            .map(|r| r.gain)
            .sum()
    }

    /// Write the report into `dir`, returning the files created
    pub fn write(&self, dir: &Path, format: ReportFormat) -> EngineResult<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let written = match format {
            ReportFormat::Json => {
                let path = dir.join(format!("8949_{}_{}.json", self.entity, self.year));
                std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
                vec![path]
            }
            ReportFormat::Csv => {
                let short = dir.join("8949_short.csv");
                std::fs::write(&short, form_8949_csv(&self.short_term))?;
                let long = dir.join("8949_long.csv");
                std::fs::write(&long, form_8949_csv(&self.long_term))?;
                let income = dir.join("income.csv");
                std::fs::write(&income, income_csv(&self.income))?;
                let lots = dir.join("lots.csv");
                std::fs::write(&lots, lots_csv(&self.lots)?)?;
                vec![short, long, income, lots]
            }
        };
        info!(
            entity = %self.entity,
            year = self.year,
            short_term = self.short_term.len(),
            long_term = self.long_term.len(),
            income = self.income.len(),
            "8949 written"
        );
        Ok(written)
    }
}

/// Attach `hidden_from_8949` to disposals flagged directly or through the
/// logical their ledger belongs to
async fn mark_hidden(pool: &SqlitePool, disposals: &mut [CostbasisDisposal]) -> EngineResult<()> {
    let flags = FlagRepository::new(pool);
    let hidden_name = FlagName::HiddenFrom8949.as_str();
    let hidden_ids: HashSet<String> = flags
        .list_by_type(FlagTarget::CostbasisDisposal.as_str())
        .await?
        .into_iter()
        .filter(|f| f.name == hidden_name)
        .map(|f| f.target_id)
        .collect();
    let hidden_logicals: HashSet<String> = flags
        .list_by_type(FlagTarget::TxLogical.as_str())
        .await?
        .into_iter()
        .filter(|f| f.name == hidden_name)
        .map(|f| f.target_id)
        .collect();

    let logicals = TxLogicalRepository::new(pool);
    for d in disposals.iter_mut() {
        let mut hidden = d
            .id
            .is_some_and(|id| hidden_ids.contains(&id.to_string()));
        if !hidden && !hidden_logicals.is_empty() {
            hidden = logicals
                .logical_id_for_ledger(&d.tx_ledger_id)
                .await?
                .is_some_and(|id| hidden_logicals.contains(&id));
        }
        if hidden && !d.flags.contains(&FlagName::HiddenFrom8949) {
            d.flags.push(FlagName::HiddenFrom8949);
        }
    }
    Ok(())
}

/// Write the lots locked for `year` as a flat export
pub fn write_locked_lots(
    lots: &[CostbasisLot],
    entity: &str,
    year: i32,
    dir: &Path,
    format: ReportFormat,
) -> EngineResult<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = match format {
        ReportFormat::Csv => {
            let path = dir.join(format!("locked_lots_{entity}_{year}.csv"));
            std::fs::write(&path, lots_csv(lots)?)?;
            path
        }
        ReportFormat::Json => {
            let path = dir.join(format!("locked_lots_{entity}_{year}.json"));
            std::fs::write(&path, serde_json::to_string_pretty(lots)?)?;
            path
        }
    };
    info!(entity = %entity, year, lots = lots.len(), path = %path.display(), "Locked lots exported");
    Ok(path)
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_line(out: &mut String, fields: &[String]) {
    let line: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
    let _ = writeln!(out, "{}", line.join(","));
}

fn form_8949_csv(rows: &[Form8949Row]) -> String {
    let mut out = String::new();
    csv_line(
        &mut out,
        &[
            "description", "date_acquired", "date_sold", "proceeds", "cost_basis", "gain",
            "tx_ledger_id", "basis_tx_ledger_id", "price_source",
        ]
        .map(String::from),
    );
    for r in rows {
        csv_line(
            &mut out,
            &[
                r.description.clone(),
                r.date_acquired.clone(),
                r.date_sold.clone(),
                r.proceeds.to_string(),
                r.cost_basis.to_string(),
                r.gain.to_string(),
                r.tx_ledger_id.clone(),
                r.basis_tx_ledger_id.clone(),
                r.price_source.clone(),
            ],
        );
    }
    out
}

fn income_csv(rows: &[CostbasisIncome]) -> String {
    let mut out = String::new();
    csv_line(
        &mut out,
        &["timestamp", "address", "symbol", "amount", "price", "net_usd", "tx_ledger_id"]
            .map(String::from),
    );
    for i in rows {
        csv_line(
            &mut out,
            &[
                i.timestamp.to_string(),
                i.address.clone(),
                i.symbol.clone(),
                i.amount.normalize().to_string(),
                i.price.normalize().to_string(),
                i.net_usd.round_dp(2).to_string(),
                i.tx_ledger_id.clone(),
            ],
        );
    }
    out
}

fn lots_csv(lots: &[CostbasisLot]) -> EngineResult<String> {
    let mut out = String::new();
    csv_line(
        &mut out,
        &[
            "tx_ledger_id", "entity", "address", "chain", "asset_price_id", "symbol",
            "asset_tx_id", "original_amount", "current_amount", "price_usd", "basis_usd",
            "timestamp", "receipt", "price_source", "locked_for_year", "history",
        ]
        .map(String::from),
    );
    for l in lots {
        csv_line(
            &mut out,
            &[
                l.tx_ledger_id.clone(),
                l.entity.clone(),
                l.address.clone(),
                l.chain.clone(),
                l.asset_price_id.clone().unwrap_or_default(),
                l.symbol.clone().unwrap_or_default(),
                l.asset_tx_id.clone(),
                l.original_amount.normalize().to_string(),
                l.current_amount.normalize().to_string(),
                l.price_usd.normalize().to_string(),
                l.basis_usd.normalize().to_string(),
                l.timestamp.to_string(),
                u8::from(l.receipt).to_string(),
                l.price_source.clone(),
                l.locked_for_year.map(|y| y.to_string()).unwrap_or_default(),
                serde_json::to_string(&l.history)?,
            ],
        );
    }
    Ok(out)
}

//! Cost-basis lots, lot matching and the generator
//!
//! A [`LotBook`] holds an entity's lots in memory while the generator walks
//! its logicals. Every logical runs inside a savepoint so a logical that
//! cannot be handled leaves no partial lots or disposals behind; the book is
//! flushed to the database after each committed logical.

mod generator;
mod pricing;

#[cfg(test)]
mod tests;

pub use generator::CostbasisGenerator;
pub use pricing::{PriceQuote, Pricer};

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use persistence::repository::{CostbasisRepository, FlagRepository, TxLedgerRepository};
use persistence::{decimal_to_text, SqlitePool};
use rust_decimal::Decimal;
use tracing::debug;

use crate::error::EngineResult;
use crate::types::{
    CostbasisDisposal, CostbasisIncome, CostbasisLot, FlagTarget, LotAlgorithm, Source,
    CLOSE_TO_ZERO,
};

/// How lots are matched to a ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LotKey {
    /// Like-kind match on the canonical price id
    PriceId(String),
    /// Exact token on one chain
    Token { chain: String, asset_tx_id: String },
}

impl LotKey {
    fn matches(&self, lot: &CostbasisLot) -> bool {
        match self {
            LotKey::PriceId(id) => lot.asset_price_id.as_deref() == Some(id.as_str()),
            LotKey::Token { chain, asset_tx_id } => {
                lot.chain == *chain && lot.asset_tx_id.eq_ignore_ascii_case(asset_tx_id)
            }
        }
    }
}

/// A price written back onto a ledger
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerPriceUpdate {
    pub tx_ledger_id: String,
    pub price_usd: Decimal,
    pub price_source: String,
}

#[derive(Debug, Default)]
struct Savepoint {
    lots: usize,
    disposals: usize,
    income: usize,
    price_updates: usize,
    /// Lots as they were before their first change in this savepoint
    originals: HashMap<usize, CostbasisLot>,
}

#[derive(Debug, Default)]
pub struct LotBook {
    entity: String,
    lots: Vec<CostbasisLot>,
    index: HashMap<String, usize>,
    dirty: BTreeSet<usize>,
    disposals: Vec<CostbasisDisposal>,
    income: Vec<CostbasisIncome>,
    price_updates: Vec<LedgerPriceUpdate>,
    flushed_disposals: usize,
    flushed_income: usize,
    flushed_price_updates: usize,
    savepoint: Option<Savepoint>,
}

impl LotBook {
    pub fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            ..Default::default()
        }
    }

    /// Book seeded with lots that are already persisted
    pub fn with_lots(entity: &str, lots: Vec<CostbasisLot>) -> Self {
        let mut book = Self::new(entity);
        for lot in lots {
            book.index.insert(lot.tx_ledger_id.clone(), book.lots.len());
            book.lots.push(lot);
        }
        book
    }

    pub async fn load(pool: &SqlitePool, entity: &str) -> EngineResult<Self> {
        let lots = CostbasisRepository::new(pool)
            .lots_for_entity(entity)
            .await?
            .into_iter()
            .map(CostbasisLot::try_from)
            .collect::<EngineResult<Vec<_>>>()?;
        debug!(entity = %entity, lots = lots.len(), "Loaded costbasis lots");
        Ok(Self::with_lots(entity, lots))
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn lots(&self) -> &[CostbasisLot] {
        &self.lots
    }

    pub fn lot(&self, tx_ledger_id: &str) -> Option<&CostbasisLot> {
        self.index.get(tx_ledger_id).map(|&i| &self.lots[i])
    }

    pub fn disposals(&self) -> &[CostbasisDisposal] {
        &self.disposals
    }

    pub fn income(&self) -> &[CostbasisIncome] {
        &self.income
    }

    pub fn price_updates(&self) -> &[LedgerPriceUpdate] {
        &self.price_updates
    }

    /// Open lots for `key` acquired at or before `timestamp`, best first
    pub fn matching(&self, key: &LotKey, timestamp: i64, algorithm: LotAlgorithm) -> Vec<usize> {
        let mut found: Vec<usize> = self
            .lots
            .iter()
            .enumerate()
            .filter(|(_, lot)| {
                lot.timestamp <= timestamp
                    && lot.current_amount > CLOSE_TO_ZERO
                    && key.matches(lot)
            })
            .map(|(i, _)| i)
            .collect();

        let lots = &self.lots;
        found.sort_by(|&a, &b| {
            let (a, b) = (&lots[a], &lots[b]);
            let order = match algorithm {
                LotAlgorithm::Hifo => b
                    .price_usd
                    .cmp(&a.price_usd)
                    .then(a.timestamp.cmp(&b.timestamp)),
                LotAlgorithm::Low => a
                    .price_usd
                    .cmp(&b.price_usd)
                    .then(a.timestamp.cmp(&b.timestamp)),
                LotAlgorithm::Fifo => a.timestamp.cmp(&b.timestamp),
                LotAlgorithm::Lifo => b.timestamp.cmp(&a.timestamp),
            };
            match order {
                Ordering::Equal => a.tx_ledger_id.cmp(&b.tx_ledger_id),
                other => other,
            }
        });
        found
    }

    pub(crate) fn lot_at(&self, idx: usize) -> &CostbasisLot {
        &self.lots[idx]
    }

    /// Add a lot. A lot keyed by the same ledger is replaced.
    pub(crate) fn insert_lot(&mut self, lot: CostbasisLot) -> usize {
        if let Some(&idx) = self.index.get(&lot.tx_ledger_id) {
            debug!(tx_ledger_id = %lot.tx_ledger_id, "Replacing costbasis lot");
            self.remember(idx);
            self.lots[idx] = lot;
            self.dirty.insert(idx);
            return idx;
        }
        let idx = self.lots.len();
        self.index.insert(lot.tx_ledger_id.clone(), idx);
        self.lots.push(lot);
        self.dirty.insert(idx);
        idx
    }

    /// Take `amount` out of a lot's current amount
    pub(crate) fn draw(&mut self, idx: usize, amount: Decimal) {
        self.remember(idx);
        let lot = &mut self.lots[idx];
        lot.current_amount -= amount;
        self.dirty.insert(idx);
    }

    pub(crate) fn push_disposal(&mut self, disposal: CostbasisDisposal) {
        self.disposals.push(disposal);
    }

    pub(crate) fn push_income(&mut self, income: CostbasisIncome) {
        self.income.push(income);
    }

    pub(crate) fn queue_price_update(&mut self, update: LedgerPriceUpdate) {
        self.price_updates.push(update);
    }

    fn remember(&mut self, idx: usize) {
        if let Some(sp) = &mut self.savepoint {
            if idx < sp.lots {
                sp.originals
                    .entry(idx)
                    .or_insert_with(|| self.lots[idx].clone());
            }
        }
    }

    pub(crate) fn begin(&mut self) {
        self.savepoint = Some(Savepoint {
            lots: self.lots.len(),
            disposals: self.disposals.len(),
            income: self.income.len(),
            price_updates: self.price_updates.len(),
            originals: HashMap::new(),
        });
    }

    pub(crate) fn commit(&mut self) {
        self.savepoint = None;
    }

    /// Undo everything since [`Self::begin`]
    pub(crate) fn rollback(&mut self) {
        let Some(sp) = self.savepoint.take() else {
            return;
        };
        for lot in self.lots.drain(sp.lots..) {
            self.index.remove(&lot.tx_ledger_id);
        }
        for (idx, lot) in sp.originals {
            self.lots[idx] = lot;
        }
        self.disposals.truncate(sp.disposals);
        self.income.truncate(sp.income);
        self.price_updates.truncate(sp.price_updates);
        let len = self.lots.len();
        self.dirty.retain(|&i| i < len);
    }

    /// Write changed lots and new disposals, income, flags and ledger
    /// prices. Disposals get their row ids assigned here.
    pub async fn flush(&mut self, pool: &SqlitePool) -> EngineResult<()> {
        let costbasis = CostbasisRepository::new(pool);
        let flags = FlagRepository::new(pool);

        for idx in std::mem::take(&mut self.dirty) {
            let lot = &self.lots[idx];
            costbasis.upsert_lot(&lot.to_record()?).await?;
            for flag in &lot.flags {
                flags
                    .add(
                        FlagTarget::CostbasisLot.as_str(),
                        &lot.tx_ledger_id,
                        Source::Perfi.as_str(),
                        flag.as_str(),
                        Some(flag.description()),
                    )
                    .await?;
            }
        }

        for disposal in &mut self.disposals[self.flushed_disposals..] {
            let id = costbasis.insert_disposal(&disposal.to_record()).await?;
            disposal.id = Some(id);
            for flag in &disposal.flags {
                flags
                    .add(
                        FlagTarget::CostbasisDisposal.as_str(),
                        &id.to_string(),
                        Source::Perfi.as_str(),
                        flag.as_str(),
                        Some(flag.description()),
                    )
                    .await?;
            }
        }
        self.flushed_disposals = self.disposals.len();

        for income in &mut self.income[self.flushed_income..] {
            income.id = Some(costbasis.insert_income(&income.to_record()).await?);
        }
        self.flushed_income = self.income.len();

        let ledgers = TxLedgerRepository::new(pool);
        for update in &self.price_updates[self.flushed_price_updates..] {
            ledgers
                .update_price(
                    &update.tx_ledger_id,
                    &decimal_to_text(update.price_usd),
                    &update.price_source,
                )
                .await?;
        }
        self.flushed_price_updates = self.price_updates.len();
        Ok(())
    }
}

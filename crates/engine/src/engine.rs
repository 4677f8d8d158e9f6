//! Pipeline driver
//!
//! `Engine` owns the database, asset registry and price feeds and runs the
//! stages for one entity: raw import, ledger rebuild, grouping and typing,
//! cost-basis regeneration, manual edits and year closing.

use persistence::repository::{
    AddressRecord, AssetPriceRecord, AssetRepository, AssetTxRecord, CostbasisRepository,
    EntityRecord, EntityRepository, EventRepository, FlagRepository, NewAddress,
    SettingRepository, TxChainRepository, TxLedgerRepository, TxLogicalRepository,
};
use persistence::{Database, SqlitePool};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::asset::AssetRegistry;
use crate::config::{EngineConfig, REPORTING_OFFSET_SETTING};
use crate::costbasis::{CostbasisGenerator, LotBook};
use crate::error::{EngineError, EngineResult};
use crate::events::{
    EventAction, EventLog, LedgerMoved, LedgerPriceUpdated, LedgerTypeUpdated, LogicalFlag,
    LogicalTypeUpdated, LotsLocked,
};
use crate::ledger::LedgerBuilder;
use crate::logical::{group_by_hash, load_logicals, Classifier};
use crate::price::{FiatRates, PriceFeed};
use crate::raw::{RawIngestRecord, IMPORT_CHAIN_PREFIX};
use crate::report::TaxReport;
use crate::types::{CostbasisLot, FlagTarget, Source, TxLedger, TxLogicalType};

/// One raw transaction as handed over by an ingester
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawImport {
    pub hash: String,
    pub timestamp: i64,
    pub payload: serde_json::Value,
}

/// Asset registry rows as handed over by an ingester
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetImport {
    #[serde(default)]
    pub prices: Vec<AssetPriceRecord>,
    #[serde(default)]
    pub txs: Vec<AssetTxRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct RegenerateOptions {
    /// Only process logicals in this reporting year
    pub year: Option<i32>,
    /// Keep existing rows and continue from this logical
    pub resume_from: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegenerateSummary {
    pub processed: usize,
    pub skipped: usize,
    pub lots: usize,
    pub disposals: usize,
    pub income: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupSummary {
    pub addresses: usize,
    pub ledgers_moved: usize,
    pub logicals: usize,
    pub untyped: usize,
}

pub struct Engine {
    db: Database,
    registry: AssetRegistry,
    prices: Box<dyn PriceFeed>,
    fiat: FiatRates,
    config: EngineConfig,
}

impl Engine {
    /// Load the asset registry and apply stored settings over `config`
    pub async fn new(
        db: Database,
        prices: Box<dyn PriceFeed>,
        fiat: FiatRates,
        mut config: EngineConfig,
    ) -> EngineResult<Self> {
        let registry = AssetRegistry::load(db.pool()).await?;
        if let Some(value) = SettingRepository::new(db.pool())
            .get(REPORTING_OFFSET_SETTING)
            .await?
        {
            match value.trim().parse::<i32>() {
                Ok(hours) => config.reporting_offset_hours = hours,
                Err(e) => warn!(value = %value, error = %e, "Ignoring invalid reporting offset"),
            }
        }
        Ok(Self {
            db,
            registry,
            prices,
            fiat,
            config,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        self.db.pool()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &AssetRegistry {
        &self.registry
    }

    fn events(&self) -> EventLog<'_> {
        EventLog::new(self.db.pool(), &self.config)
    }

    // ========================================================================
    // Entities and addresses
    // ========================================================================

    pub async fn create_entity(&self, name: &str, note: Option<&str>) -> EngineResult<EntityRecord> {
        let entity = EntityRepository::new(self.pool()).create(name, note).await?;
        info!(entity = %name, "Entity created");
        Ok(entity)
    }

    pub async fn add_address(
        &self,
        entity: &str,
        label: &str,
        chain: &str,
        address: &str,
    ) -> EngineResult<AddressRecord> {
        let repo = EntityRepository::new(self.pool());
        let owner = repo.get_by_name(entity).await?;
        let record = repo
            .add_address(
                owner.id,
                &NewAddress {
                    label,
                    chain,
                    address,
                    address_type: "account",
                    source: Source::Manual.as_str(),
                },
            )
            .await?;
        info!(entity = %entity, address = %address, chain = %chain, "Address added");
        Ok(record)
    }

    // ========================================================================
    // Imports
    // ========================================================================

    /// Upsert asset registry rows and reload the registry
    pub async fn import_assets(&mut self, assets: &AssetImport) -> EngineResult<()> {
        let repo = AssetRepository::new(self.db.pool());
        for p in &assets.prices {
            repo.upsert_price(p).await?;
        }
        for t in &assets.txs {
            repo.upsert_tx(t).await?;
        }
        self.registry = AssetRegistry::load(self.db.pool()).await?;
        info!(prices = assets.prices.len(), txs = assets.txs.len(), "Assets imported");
        Ok(())
    }

    /// Store raw on-chain records for an address and rebuild its ledgers
    pub async fn import_chain(
        &self,
        address: &str,
        chain: &str,
        records: &[RawImport],
    ) -> EngineResult<usize> {
        self.store_raw(address, chain, records).await?;
        self.rebuild_ledgers(address).await
    }

    /// Store exchange-import records under `import.<exchange>` and rebuild
    pub async fn import_exchange(
        &self,
        address: &str,
        exchange: &str,
        records: &[RawImport],
    ) -> EngineResult<usize> {
        let chain = format!("{IMPORT_CHAIN_PREFIX}{}", exchange.to_lowercase());
        self.store_raw(address, &chain, records).await?;
        self.rebuild_ledgers(address).await
    }

    async fn store_raw(&self, address: &str, chain: &str, records: &[RawImport]) -> EngineResult<()> {
        let repo = TxChainRepository::new(self.pool());
        for r in records {
            let record = RawIngestRecord::encode(chain, address, &r.hash, r.timestamp, &r.payload)?;
            repo.upsert(&record).await?;
        }
        info!(address = %address, chain = %chain, records = records.len(), "Raw records stored");
        Ok(())
    }

    /// Replace every ledger of an address with ones derived from its raw
    /// records. Returns the number of ledgers written.
    pub async fn rebuild_ledgers(&self, address: &str) -> EngineResult<usize> {
        let chains = TxChainRepository::new(self.pool());
        let ledgers = TxLedgerRepository::new(self.pool());
        let builder = LedgerBuilder::new(&self.registry, &*self.prices, &self.fiat);

        let mut written = 0;
        for chain in chains.chains_for_address(address).await? {
            let mut records = Vec::new();
            for raw in chains.list_for_address(&chain, address).await? {
                match RawIngestRecord::decode(&raw) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(chain = %chain, hash = %raw.hash, error = %e, "Skipping undecodable record"),
                }
            }
            let built = builder.build(&records)?;

            ledgers.delete_for_address(&chain, address).await?;
            for t in &built {
                ledgers.insert(&t.to_record()).await?;
            }
            debug!(chain = %chain, address = %address, ledgers = built.len(), "Ledgers rebuilt");
            written += built.len();
        }
        info!(address = %address, ledgers = written, "Ledgers rebuilt");
        Ok(written)
    }

    // ========================================================================
    // Grouping
    // ========================================================================

    /// Put each ledger of an address in its own logical, then merge ledgers
    /// sharing a hash through machine `tx_ledger_moved` events
    async fn group_address(&self, address: &str) -> EngineResult<usize> {
        let pool = self.pool();
        EventRepository::new(pool)
            .delete_machine_moves_for_address(address)
            .await?;
        FlagRepository::new(pool)
            .delete_logical_flags_for_address(address)
            .await?;
        let logicals = TxLogicalRepository::new(pool);
        logicals.delete_for_address(address).await?;

        let ledgers = TxLedgerRepository::new(pool)
            .list_for_address(address)
            .await?
            .into_iter()
            .map(TxLedger::try_from)
            .collect::<EngineResult<Vec<_>>>()?;
        for t in &ledgers {
            logicals.insert_singleton(&t.id, t.timestamp, &t.address).await?;
        }

        let moves = group_by_hash(&ledgers);
        let log = self.events();
        for (tx_ledger_id, from_tx_logical_id, to_tx_logical_id) in &moves {
            log.record(
                Source::Perfi,
                EventAction::LedgerMoved(LedgerMoved {
                    tx_ledger_id: tx_ledger_id.clone(),
                    from_tx_logical_id: from_tx_logical_id.clone(),
                    to_tx_logical_id: to_tx_logical_id.clone(),
                }),
            )
            .await?;
        }
        debug!(address = %address, ledgers = ledgers.len(), moves = moves.len(), "Grouped address");
        Ok(moves.len())
    }

    /// Rebuild the logicals of every address of an entity, replay user
    /// edits and type each logical
    pub async fn group_transactions(&self, entity: &str) -> EngineResult<GroupSummary> {
        let pool = self.pool();
        let addresses = EntityRepository::new(pool).addresses_for_entity(entity).await?;
        let mut summary = GroupSummary {
            addresses: addresses.len(),
            ..Default::default()
        };
        for a in &addresses {
            summary.ledgers_moved += self.group_address(&a.address).await?;
        }

        let log = self.events();
        log.replay(|e| {
            matches!(
                e.action,
                EventAction::LedgerMoved(_)
                    | EventAction::LedgerTypeUpdated(_)
                    | EventAction::LedgerPriceUpdated(_)
                    | EventAction::LogicalFlagAdded(_)
                    | EventAction::LogicalFlagRemoved(_)
            )
        })
        .await?;

        let classifier = Classifier::new(&self.registry, addresses.iter().map(|a| a.address.as_str()));
        let logical_repo = TxLogicalRepository::new(pool);
        let flag_repo = FlagRepository::new(pool);
        for logical in load_logicals(pool, entity, None, None).await? {
            let c = classifier.classify(&logical);
            logical_repo
                .update_type(&logical.id, c.tx_logical_type.map(|t| t.as_str()))
                .await?;
            for flag in &c.flags {
                flag_repo
                    .add(
                        FlagTarget::TxLogical.as_str(),
                        &logical.id,
                        Source::Perfi.as_str(),
                        flag.as_str(),
                        Some(flag.description()),
                    )
                    .await?;
            }
            if c.tx_logical_type.is_none() {
                summary.untyped += 1;
            }
            summary.logicals += 1;
        }

        log.replay(|e| matches!(e.action, EventAction::LogicalTypeUpdated(_)))
            .await?;

        info!(
            entity = %entity,
            logicals = summary.logicals,
            untyped = summary.untyped,
            moved = summary.ledgers_moved,
            "Transactions grouped"
        );
        Ok(summary)
    }

    // ========================================================================
    // Cost basis
    // ========================================================================

    /// Regenerate lots, disposals and income for an entity. A logical the
    /// generator cannot handle is logged and skipped; a storage failure
    /// stops the run and names the logical in progress.
    pub async fn regenerate_costbasis(
        &self,
        entity: &str,
        options: &RegenerateOptions,
    ) -> EngineResult<RegenerateSummary> {
        let pool = self.pool();
        EntityRepository::new(pool).get_by_name(entity).await?;

        if options.resume_from.is_none() {
            // flag deletion joins on the lot and disposal rows
            FlagRepository::new(pool).delete_costbasis_flags(entity).await?;
            CostbasisRepository::new(pool).delete_for_entity(entity).await?;
        }

        let (start, end) = match options.year {
            Some(year) => {
                let (start, end) = self.config.year_bounds(year);
                (Some(start), Some(end))
            }
            None => (None, None),
        };
        let logicals = load_logicals(pool, entity, start, end).await?;
        let mut book = LotBook::load(pool, entity).await?;
        let generator = CostbasisGenerator::new(&self.registry, &*self.prices, &self.config);

        info!(
            entity = %entity,
            logicals = logicals.len(),
            year = ?options.year,
            resume_from = ?options.resume_from,
            "Regenerating costbasis"
        );

        let mut summary = RegenerateSummary::default();
        let mut waiting = options.resume_from.as_deref();
        for logical in &logicals {
            if let Some(id) = waiting {
                if logical.id != id {
                    continue;
                }
                waiting = None;
            }

            debug!(tx_logical_id = %logical.id, tx_logical_type = ?logical.tx_logical_type, "Processing logical");
            match generator.process(&mut book, logical) {
                Ok(()) => summary.processed += 1,
                Err(e) => {
                    error!(tx_logical_id = %logical.id, error = %e, "Skipping logical");
                    summary.skipped += 1;
                }
            }
            book.flush(pool)
                .await
                .map_err(|e| EngineError::Interrupted {
                    last_tx_logical_id: logical.id.clone(),
                    source: Box::new(e),
                })?;
        }

        if let Some(id) = waiting {
            return Err(EngineError::NotFound(format!("tx_logical {id}")));
        }

        self.events()
            .replay(|e| matches!(&e.action, EventAction::CostbasisLotsLocked(p) if p.entity_name == entity))
            .await?;

        summary.lots = book.lots().len();
        summary.disposals = book.disposals().len();
        summary.income = book.income().len();
        info!(
            entity = %entity,
            processed = summary.processed,
            skipped = summary.skipped,
            lots = summary.lots,
            disposals = summary.disposals,
            income = summary.income,
            "Costbasis regenerated"
        );
        Ok(summary)
    }

    // ========================================================================
    // Manual edits
    // ========================================================================

    pub async fn move_ledger(&self, tx_ledger_id: &str, to_tx_logical_id: &str) -> EngineResult<()> {
        let from = TxLogicalRepository::new(self.pool())
            .logical_id_for_ledger(tx_ledger_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("tx_ledger {tx_ledger_id}")))?;
        self.events()
            .record(
                Source::Manual,
                EventAction::LedgerMoved(LedgerMoved {
                    tx_ledger_id: tx_ledger_id.to_string(),
                    from_tx_logical_id: from,
                    to_tx_logical_id: to_tx_logical_id.to_string(),
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn update_ledger_type(&self, tx_ledger_id: &str, tx_ledger_type: &str) -> EngineResult<()> {
        let ledger = TxLedgerRepository::new(self.pool())
            .get(tx_ledger_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("tx_ledger {tx_ledger_id}")))?;
        self.events()
            .record(
                Source::Manual,
                EventAction::LedgerTypeUpdated(LedgerTypeUpdated {
                    tx_ledger_id: tx_ledger_id.to_string(),
                    tx_ledger_type_old: ledger.tx_ledger_type,
                    tx_ledger_type_new: tx_ledger_type.to_string(),
                }),
            )
            .await?;
        Ok(())
    }

    /// Set a ledger's price by hand. Refused when the lot it opened is locked.
    pub async fn update_ledger_price(
        &self,
        tx_ledger_id: &str,
        price_usd: Decimal,
        price_source: &str,
    ) -> EngineResult<()> {
        TxLedgerRepository::new(self.pool())
            .get(tx_ledger_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("tx_ledger {tx_ledger_id}")))?;
        if let Some(lot) = CostbasisRepository::new(self.pool()).get_lot(tx_ledger_id).await? {
            if let Some(year) = lot.locked_for_year {
                return Err(EngineError::Locked {
                    tx_ledger_id: tx_ledger_id.to_string(),
                    year: year as i32,
                });
            }
        }
        self.events()
            .record(
                Source::Manual,
                EventAction::LedgerPriceUpdated(LedgerPriceUpdated {
                    tx_ledger_id: tx_ledger_id.to_string(),
                    price_usd_new: price_usd,
                    price_source_new: price_source.to_string(),
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn update_logical_type(
        &self,
        tx_logical_id: &str,
        tx_logical_type: TxLogicalType,
    ) -> EngineResult<()> {
        let logical = TxLogicalRepository::new(self.pool())
            .get(tx_logical_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("tx_logical {tx_logical_id}")))?;
        self.events()
            .record(
                Source::Manual,
                EventAction::LogicalTypeUpdated(LogicalTypeUpdated {
                    tx_logical_id: tx_logical_id.to_string(),
                    tx_logical_type_old: logical.tx_logical_type,
                    tx_logical_type_new: tx_logical_type.as_str().to_string(),
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn add_logical_flag(&self, tx_logical_id: &str, flag: &str) -> EngineResult<()> {
        self.logical_flag(tx_logical_id, flag, true).await
    }

    pub async fn remove_logical_flag(&self, tx_logical_id: &str, flag: &str) -> EngineResult<()> {
        self.logical_flag(tx_logical_id, flag, false).await
    }

    async fn logical_flag(&self, tx_logical_id: &str, flag: &str, add: bool) -> EngineResult<()> {
        TxLogicalRepository::new(self.pool())
            .get(tx_logical_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("tx_logical {tx_logical_id}")))?;
        let payload = LogicalFlag {
            tx_logical_id: tx_logical_id.to_string(),
            flag_value: flag.to_string(),
        };
        let action = if add {
            EventAction::LogicalFlagAdded(payload)
        } else {
            EventAction::LogicalFlagRemoved(payload)
        };
        self.events().record(Source::Manual, action).await?;
        Ok(())
    }

    // ========================================================================
    // Year end
    // ========================================================================

    /// Lock the lots a year touched and return them
    pub async fn close_year(&self, entity: &str, year: i32) -> EngineResult<Vec<CostbasisLot>> {
        EntityRepository::new(self.pool()).get_by_name(entity).await?;
        self.events()
            .record(
                Source::Manual,
                EventAction::CostbasisLotsLocked(LotsLocked {
                    entity_name: entity.to_string(),
                    year,
                }),
            )
            .await?;
        self.locked_lots(entity, year).await
    }

    pub async fn locked_lots(&self, entity: &str, year: i32) -> EngineResult<Vec<CostbasisLot>> {
        CostbasisRepository::new(self.pool())
            .locked_lots(entity, year)
            .await?
            .into_iter()
            .map(CostbasisLot::try_from)
            .collect()
    }

    pub async fn form_8949(&self, entity: &str, year: i32) -> EngineResult<TaxReport> {
        EntityRepository::new(self.pool()).get_by_name(entity).await?;
        TaxReport::load(self.pool(), &self.config, entity, year).await
    }
}

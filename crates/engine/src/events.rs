//! Event log
//!
//! User and machine edits are recorded as events and replayed over
//! regenerated state in `(timestamp, insertion)` order. Applying an event
//! twice leaves the same state as applying it once.

use persistence::repository::{
    CostbasisRepository, EventRecord, EventRepository, FlagRepository, TxLedgerRepository,
    TxLogicalRepository,
};
use persistence::{decimal_to_text, SqlitePool};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{FlagName, FlagTarget, Source};

/// Version written into every event payload
pub const EVENT_VERSION: i64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerMoved {
    pub tx_ledger_id: String,
    pub from_tx_logical_id: String,
    pub to_tx_logical_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerTypeUpdated {
    pub tx_ledger_id: String,
    pub tx_ledger_type_old: Option<String>,
    pub tx_ledger_type_new: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerPriceUpdated {
    pub tx_ledger_id: String,
    pub price_usd_new: Decimal,
    pub price_source_new: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalTypeUpdated {
    pub tx_logical_id: String,
    pub tx_logical_type_old: Option<String>,
    pub tx_logical_type_new: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalFlag {
    pub tx_logical_id: String,
    pub flag_value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotsLocked {
    pub entity_name: String,
    pub year: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventAction {
    LedgerMoved(LedgerMoved),
    LedgerTypeUpdated(LedgerTypeUpdated),
    LedgerPriceUpdated(LedgerPriceUpdated),
    LogicalTypeUpdated(LogicalTypeUpdated),
    LogicalFlagAdded(LogicalFlag),
    LogicalFlagRemoved(LogicalFlag),
    CostbasisLotsLocked(LotsLocked),
}

pub const LEDGER_MOVED: &str = "tx_ledger_moved";
pub const LEDGER_TYPE_UPDATED: &str = "tx_ledger_type_updated";
pub const LEDGER_PRICE_UPDATED: &str = "tx_ledger_price_updated";
pub const LOGICAL_TYPE_UPDATED: &str = "tx_logical_type_updated";
pub const LOGICAL_FLAG_ADDED: &str = "tx_logical_flag_added";
pub const LOGICAL_FLAG_REMOVED: &str = "tx_logical_flag_removed";
pub const COSTBASIS_LOTS_LOCKED: &str = "costbasis_lots_locked";

fn with_version<T: Serialize>(payload: &T) -> EngineResult<String> {
    let mut value = serde_json::to_value(payload)?;
    if let Value::Object(map) = &mut value {
        map.insert("version".to_string(), Value::from(EVENT_VERSION));
    }
    Ok(value.to_string())
}

fn parse<T: DeserializeOwned>(data: &str) -> EngineResult<T> {
    Ok(serde_json::from_str(data)?)
}

impl EventAction {
    pub fn name(&self) -> &'static str {
        match self {
            EventAction::LedgerMoved(_) => LEDGER_MOVED,
            EventAction::LedgerTypeUpdated(_) => LEDGER_TYPE_UPDATED,
            EventAction::LedgerPriceUpdated(_) => LEDGER_PRICE_UPDATED,
            EventAction::LogicalTypeUpdated(_) => LOGICAL_TYPE_UPDATED,
            EventAction::LogicalFlagAdded(_) => LOGICAL_FLAG_ADDED,
            EventAction::LogicalFlagRemoved(_) => LOGICAL_FLAG_REMOVED,
            EventAction::CostbasisLotsLocked(_) => COSTBASIS_LOTS_LOCKED,
        }
    }

    /// JSON payload as stored in `event.data`
    pub fn to_data(&self) -> EngineResult<String> {
        match self {
            EventAction::LedgerMoved(p) => with_version(p),
            EventAction::LedgerTypeUpdated(p) => with_version(p),
            EventAction::LedgerPriceUpdated(p) => with_version(p),
            EventAction::LogicalTypeUpdated(p) => with_version(p),
            EventAction::LogicalFlagAdded(p) | EventAction::LogicalFlagRemoved(p) => with_version(p),
            EventAction::CostbasisLotsLocked(p) => with_version(p),
        }
    }

    pub fn from_parts(action: &str, data: &str) -> EngineResult<Self> {
        match action {
            LEDGER_MOVED => Ok(EventAction::LedgerMoved(parse(data)?)),
            LEDGER_TYPE_UPDATED => Ok(EventAction::LedgerTypeUpdated(parse(data)?)),
            LEDGER_PRICE_UPDATED => Ok(EventAction::LedgerPriceUpdated(parse(data)?)),
            LOGICAL_TYPE_UPDATED => Ok(EventAction::LogicalTypeUpdated(parse(data)?)),
            LOGICAL_FLAG_ADDED => Ok(EventAction::LogicalFlagAdded(parse(data)?)),
            LOGICAL_FLAG_REMOVED => Ok(EventAction::LogicalFlagRemoved(parse(data)?)),
            COSTBASIS_LOTS_LOCKED => Ok(EventAction::CostbasisLotsLocked(parse(data)?)),
            other => Err(EngineError::UnknownEventAction(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: String,
    pub source: Source,
    pub action: EventAction,
    pub timestamp: i64,
}

impl Event {
    pub fn new(source: Source, action: EventAction) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source,
            action,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn to_record(&self) -> EngineResult<EventRecord> {
        Ok(EventRecord {
            id: self.id.clone(),
            source: self.source.as_str().to_string(),
            action: self.action.name().to_string(),
            data: self.action.to_data()?,
            timestamp: self.timestamp,
        })
    }
}

impl TryFrom<EventRecord> for Event {
    type Error = EngineError;

    fn try_from(record: EventRecord) -> EngineResult<Self> {
        let source = if record.source == Source::Manual.as_str() {
            Source::Manual
        } else {
            Source::Perfi
        };
        Ok(Self {
            action: EventAction::from_parts(&record.action, &record.data)?,
            id: record.id,
            source,
            timestamp: record.timestamp,
        })
    }
}

pub struct EventLog<'a> {
    pool: &'a SqlitePool,
    config: &'a EngineConfig,
}

impl<'a> EventLog<'a> {
    pub fn new(pool: &'a SqlitePool, config: &'a EngineConfig) -> Self {
        Self { pool, config }
    }

    /// Record an event without applying it
    pub async fn append(&self, source: Source, action: EventAction) -> EngineResult<Event> {
        let event = Event::new(source, action);
        EventRepository::new(self.pool).insert(&event.to_record()?).await?;
        debug!(event_id = %event.id, action = event.action.name(), "Appended event");
        Ok(event)
    }

    /// Record an event and apply it at once
    pub async fn record(&self, source: Source, action: EventAction) -> EngineResult<Event> {
        let event = self.append(source, action).await?;
        self.apply(&event).await?;
        Ok(event)
    }

    pub async fn apply(&self, event: &Event) -> EngineResult<()> {
        match &event.action {
            EventAction::LedgerMoved(p) => {
                TxLogicalRepository::new(self.pool)
                    .move_ledger(&p.tx_ledger_id, &p.from_tx_logical_id, &p.to_tx_logical_id)
                    .await?;
            }
            EventAction::LedgerTypeUpdated(p) => {
                TxLedgerRepository::new(self.pool)
                    .update_type(&p.tx_ledger_id, &p.tx_ledger_type_new)
                    .await?;
            }
            EventAction::LedgerPriceUpdated(p) => {
                TxLedgerRepository::new(self.pool)
                    .update_price(
                        &p.tx_ledger_id,
                        &decimal_to_text(p.price_usd_new),
                        &p.price_source_new,
                    )
                    .await?;
            }
            EventAction::LogicalTypeUpdated(p) => {
                TxLogicalRepository::new(self.pool)
                    .update_type(&p.tx_logical_id, Some(&p.tx_logical_type_new))
                    .await?;
            }
            EventAction::LogicalFlagAdded(p) => {
                let description = FlagName::ALL
                    .iter()
                    .find(|f| f.as_str() == p.flag_value)
                    .map(|f| f.description());
                FlagRepository::new(self.pool)
                    .add(
                        FlagTarget::TxLogical.as_str(),
                        &p.tx_logical_id,
                        event.source.as_str(),
                        &p.flag_value,
                        description,
                    )
                    .await?;
            }
            EventAction::LogicalFlagRemoved(p) => {
                FlagRepository::new(self.pool)
                    .remove(FlagTarget::TxLogical.as_str(), &p.tx_logical_id, &p.flag_value)
                    .await?;
            }
            EventAction::CostbasisLotsLocked(p) => {
                let (start, end) = self.config.year_bounds(p.year);
                let locked = CostbasisRepository::new(self.pool)
                    .lock_lots(&p.entity_name, p.year, start, end)
                    .await?;
                info!(entity = %p.entity_name, year = p.year, locked, "Locked costbasis lots");
            }
        }
        Ok(())
    }

    /// Every event in replay order. An unknown action is fatal.
    pub async fn list(&self) -> EngineResult<Vec<Event>> {
        EventRepository::new(self.pool)
            .list()
            .await?
            .into_iter()
            .map(Event::try_from)
            .collect()
    }

    /// Apply the events accepted by `filter`, in replay order
    pub async fn replay<F>(&self, filter: F) -> EngineResult<usize>
    where
        F: Fn(&Event) -> bool,
    {
        let mut applied = 0;
        for event in self.list().await? {
            if filter(&event) {
                self.apply(&event).await?;
                applied += 1;
            }
        }
        debug!(applied, "Replayed events");
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistence::repository::{TxLedgerRecord, TxLogicalRepository};
    use persistence::Database;
    use rust_decimal_macros::dec;

    fn ledger(id: &str) -> TxLedgerRecord {
        TxLedgerRecord {
            id: id.into(),
            chain: "avalanche".into(),
            address: "0xme".into(),
            hash: "0xh".into(),
            from_address: "0xme".into(),
            to_address: "0xdex".into(),
            from_address_name: None,
            to_address_name: None,
            asset_tx_id: "avax".into(),
            isfee: 0,
            amount: "1".into(),
            timestamp: 1,
            direction: "OUT".into(),
            tx_ledger_type: None,
            asset_price_id: None,
            symbol: None,
            price_usd: None,
            price_source: None,
        }
    }

    async fn setup(db: &Database) {
        let ledgers = TxLedgerRepository::new(db.pool());
        let logicals = TxLogicalRepository::new(db.pool());
        for id in ["a", "b"] {
            ledgers.insert(&ledger(id)).await.unwrap();
            logicals.insert_singleton(id, 1, "0xme").await.unwrap();
        }
    }

    #[test]
    fn test_payload_carries_version() {
        let action = EventAction::LogicalFlagAdded(LogicalFlag {
            tx_logical_id: "x".into(),
            flag_value: "ignored_from_costbasis".into(),
        });
        let data: Value = serde_json::from_str(&action.to_data().unwrap()).unwrap();
        assert_eq!(data["version"], 1);
        assert_eq!(data["flag_value"], "ignored_from_costbasis");
        assert_eq!(EventAction::from_parts(action.name(), &action.to_data().unwrap()).unwrap(), action);
    }

    #[test]
    fn test_unknown_action_is_fatal() {
        let err = EventAction::from_parts("tx_logical_renamed", "{}").unwrap_err();
        assert!(matches!(err, EngineError::UnknownEventAction(_)));
    }

    #[tokio::test]
    async fn test_move_replay_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        setup(&db).await;
        let config = EngineConfig::default();
        let log = EventLog::new(db.pool(), &config);

        log.record(
            Source::Perfi,
            EventAction::LedgerMoved(LedgerMoved {
                tx_ledger_id: "b".into(),
                from_tx_logical_id: "b".into(),
                to_tx_logical_id: "a".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(log.replay(|_| true).await.unwrap(), 1);

        let logicals = TxLogicalRepository::new(db.pool());
        assert_eq!(logicals.get("a").await.unwrap().unwrap().count, 2);
        assert_eq!(logicals.get("b").await.unwrap().unwrap().count, 0);
        assert_eq!(logicals.logical_id_for_ledger("b").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_price_and_type_updates() {
        let db = Database::in_memory().await.unwrap();
        setup(&db).await;
        let config = EngineConfig::default();
        let log = EventLog::new(db.pool(), &config);

        log.record(
            Source::Manual,
            EventAction::LedgerPriceUpdated(LedgerPriceUpdated {
                tx_ledger_id: "a".into(),
                price_usd_new: dec!(20),
                price_source_new: "manual".into(),
            }),
        )
        .await
        .unwrap();
        log.record(
            Source::Manual,
            EventAction::LogicalTypeUpdated(LogicalTypeUpdated {
                tx_logical_id: "a".into(),
                tx_logical_type_old: None,
                tx_logical_type_new: "gift".into(),
            }),
        )
        .await
        .unwrap();

        let row = TxLedgerRepository::new(db.pool()).get("a").await.unwrap().unwrap();
        assert_eq!(row.price_usd.as_deref(), Some("20"));
        let logical = TxLogicalRepository::new(db.pool()).get("a").await.unwrap().unwrap();
        assert_eq!(logical.tx_logical_type.as_deref(), Some("gift"));
    }

    #[tokio::test]
    async fn test_flag_add_then_remove_replays_to_removed() {
        let db = Database::in_memory().await.unwrap();
        setup(&db).await;
        let config = EngineConfig::default();
        let log = EventLog::new(db.pool(), &config);
        let flag = LogicalFlag {
            tx_logical_id: "a".into(),
            flag_value: FlagName::IgnoredFromCostbasis.as_str().into(),
        };

        log.record(Source::Manual, EventAction::LogicalFlagAdded(flag.clone()))
            .await
            .unwrap();
        log.record(Source::Manual, EventAction::LogicalFlagRemoved(flag))
            .await
            .unwrap();
        log.replay(|_| true).await.unwrap();

        let flags = FlagRepository::new(db.pool())
            .list_for_target("TxLogical", "a")
            .await
            .unwrap();
        assert!(flags.is_empty());
    }
}

//! Price lookups
//!
//! The feed is pre-warmed by an external job, so lookups are synchronous
//! reads of in-memory day tables.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, NaiveDate};
use rust_decimal::Decimal;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::types::FIAT_PREFIX;

/// USD price of a canonical asset at a moment
pub trait PriceFeed: Send + Sync {
    fn price_at(&self, asset_price_id: &str, timestamp: i64) -> Option<Decimal>;
}

fn utc_day(timestamp: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(timestamp, 0).map(|dt| dt.date_naive())
}

type DayTable = HashMap<String, BTreeMap<NaiveDate, Decimal>>;

fn parse_day_table(json: &str) -> EngineResult<DayTable> {
    let raw: HashMap<String, BTreeMap<String, Decimal>> = serde_json::from_str(json)?;
    let mut table = DayTable::new();
    for (id, days) in raw {
        let mut parsed = BTreeMap::new();
        for (day, price) in days {
            let day = NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                .map_err(|e| EngineError::InvalidRecord(format!("price day {day}: {e}")))?;
            parsed.insert(day, price);
        }
        table.insert(id, parsed);
    }
    Ok(table)
}

/// One closing price per asset per UTC day
#[derive(Debug, Default, Clone)]
pub struct DailyPriceFeed {
    prices: DayTable,
}

impl DailyPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `{asset_price_id: {"YYYY-MM-DD": price}}`
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let prices = parse_day_table(json)?;
        debug!(assets = prices.len(), "Loaded daily prices");
        Ok(Self { prices })
    }

    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn insert(&mut self, asset_price_id: &str, timestamp: i64, price: Decimal) {
        if let Some(day) = utc_day(timestamp) {
            self.prices
                .entry(asset_price_id.to_string())
                .or_default()
                .insert(day, price);
        }
    }
}

impl PriceFeed for DailyPriceFeed {
    fn price_at(&self, asset_price_id: &str, timestamp: i64) -> Option<Decimal> {
        let day = utc_day(timestamp)?;
        self.prices.get(asset_price_id)?.get(&day).copied()
    }
}

/// USD per unit of fiat currencies, by day
#[derive(Debug, Default, Clone)]
pub struct FiatRates {
    rates: DayTable,
}

impl FiatRates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `{currency: {"YYYY-MM-DD": usd_per_unit}}`
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let rates = parse_day_table(json)?
            .into_iter()
            .map(|(currency, days)| (currency.to_uppercase(), days))
            .collect();
        Ok(Self { rates })
    }

    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn insert(&mut self, currency: &str, timestamp: i64, usd_per_unit: Decimal) {
        if let Some(day) = utc_day(timestamp) {
            self.rates
                .entry(currency.to_uppercase())
                .or_default()
                .insert(day, usd_per_unit);
        }
    }

    /// USD value of one unit of a `FIAT:XXX` asset (or a bare currency code)
    pub fn usd_rate(&self, asset_tx_id: &str, timestamp: i64) -> Option<Decimal> {
        let currency = asset_tx_id
            .strip_prefix(FIAT_PREFIX)
            .unwrap_or(asset_tx_id)
            .to_uppercase();
        if currency == "USD" {
            return Some(Decimal::ONE);
        }
        let day = utc_day(timestamp)?;
        self.rates.get(&currency)?.get(&day).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const DAY: i64 = 86_400;

    #[test]
    fn test_daily_lookup_uses_utc_day() {
        let feed = DailyPriceFeed::from_json(
            r#"{"avalanche-2": {"1970-01-02": "5", "1970-01-03": 10}}"#,
        )
        .unwrap();
        assert_eq!(feed.price_at("avalanche-2", DAY), Some(dec!(5)));
        assert_eq!(feed.price_at("avalanche-2", DAY + 3600), Some(dec!(5)));
        assert_eq!(feed.price_at("avalanche-2", 2 * DAY), Some(dec!(10)));
        assert_eq!(feed.price_at("avalanche-2", 3 * DAY), None);
        assert_eq!(feed.price_at("bitcoin", DAY), None);
    }

    #[test]
    fn test_bad_day_is_rejected() {
        assert!(DailyPriceFeed::from_json(r#"{"x": {"yesterday": "1"}}"#).is_err());
    }

    #[test]
    fn test_fiat_rates() {
        let mut fiat = FiatRates::from_json(r#"{"eur": {"1970-01-01": "1.1"}}"#).unwrap();
        assert_eq!(fiat.usd_rate("FIAT:USD", 0), Some(Decimal::ONE));
        assert_eq!(fiat.usd_rate("FIAT:EUR", 10), Some(dec!(1.1)));
        assert_eq!(fiat.usd_rate("FIAT:GBP", 10), None);
        fiat.insert("gbp", DAY, dec!(1.3));
        assert_eq!(fiat.usd_rate("GBP", DAY), Some(dec!(1.3)));
    }
}

//! Ledger builder
//!
//! Turns raw ingest records into value-movement legs. Ids are content
//! hashes, so rebuilding from the same raw data reproduces the same rows.

use std::collections::HashSet;

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::asset::{normalize_chain, AssetRegistry};
use crate::error::{EngineError, EngineResult};
use crate::price::{FiatRates, PriceFeed};
use crate::raw::{ChainItem, ChainPayload, ChainTxInfo, ExchangeLeg, ExchangePayload, RawIngestRecord};
use crate::types::{Direction, TxLedger, FIAT_PREFIX};

pub const SOURCE_EXPLICIT_PRICE: &str = "exchange_export_file_explicit_price";
pub const SOURCE_EXPLICIT_COSTBASIS: &str = "exchange_export_file_explicit_costbasis";
pub const SOURCE_EXPLICIT_PROCEEDS: &str = "exchange_export_file_explicit_proceeds";
pub const SOURCE_EXCHANGE_USD: &str = "exchange_file_usd";
pub const SOURCE_FIAT_RATE: &str = "exchange_file_fiat_rate";

/// Ledger type for an on-chain action name
pub fn ledger_type_name(name: Option<&str>, cate_id: Option<&str>) -> Option<String> {
    match name.filter(|n| !n.is_empty()) {
        Some("harvest" | "claim_rewards") => Some("claimed_reward".to_string()),
        Some("deposit" | "depositETH") => Some("deposit".to_string()),
        Some("withdraw" | "withdrawETH") => Some("withdraw".to_string()),
        Some("repay") => Some("loan_repay".to_string()),
        Some(other) => Some(other.to_string()),
        None => cate_id.filter(|c| !c.is_empty()).map(str::to_string),
    }
}

pub struct LedgerBuilder<'a> {
    registry: &'a AssetRegistry,
    prices: &'a dyn PriceFeed,
    fiat: &'a FiatRates,
}

struct LegSpec<'s> {
    chain: &'s str,
    address: &'s str,
    hash: &'s str,
    timestamp: i64,
    direction: Direction,
    isfee: bool,
    from_address: String,
    to_address: String,
    asset_tx_id: String,
    amount: Decimal,
    tx_ledger_type: Option<String>,
    symbol: Option<String>,
}

impl<'a> LedgerBuilder<'a> {
    pub fn new(registry: &'a AssetRegistry, prices: &'a dyn PriceFeed, fiat: &'a FiatRates) -> Self {
        Self {
            registry,
            prices,
            fiat,
        }
    }

    /// Build every leg of an address's raw records. A content hash seen
    /// twice in one run is fatal.
    pub fn build(&self, records: &[RawIngestRecord]) -> EngineResult<Vec<TxLedger>> {
        let mut ledgers = Vec::new();
        for record in records {
            match record {
                RawIngestRecord::Exchange {
                    chain,
                    address,
                    hash,
                    timestamp,
                    payload,
                } => self.exchange_legs(chain, address, hash, *timestamp, payload, &mut ledgers),
                RawIngestRecord::Chain {
                    chain,
                    address,
                    hash,
                    timestamp,
                    payload,
                } => match normalize_chain(chain) {
                    Some(chain) => self.chain_legs(chain, address, hash, *timestamp, payload, &mut ledgers),
                    None => warn!(chain = %chain, hash = %hash, "Unknown chain, skipping record"),
                },
            }
        }

        let mut seen = HashSet::new();
        for t in &ledgers {
            if !seen.insert(t.id.as_str()) {
                return Err(EngineError::DuplicateLedgerId {
                    id: t.id.clone(),
                    hash: t.hash.clone(),
                });
            }
        }
        debug!(records = records.len(), ledgers = ledgers.len(), "Built ledgers");
        Ok(ledgers)
    }

    fn exchange_legs(
        &self,
        chain: &str,
        address: &str,
        hash: &str,
        timestamp: i64,
        payload: &ExchangePayload,
        out: &mut Vec<TxLedger>,
    ) {
        let sides = [
            (Direction::Out, &payload.sends),
            (Direction::In, &payload.receives),
        ];
        for (direction, legs) in sides {
            for leg in legs {
                if leg.amount < Decimal::ZERO {
                    warn!(hash = %hash, asset = %leg.asset_tx_id, "Negative amount, skipping leg");
                    continue;
                }
                let mut t = self.leg(LegSpec {
                    chain,
                    address,
                    hash,
                    timestamp,
                    direction,
                    isfee: leg.isfee == 1 && direction == Direction::Out,
                    from_address: leg.from_address.clone(),
                    to_address: leg.to_address.clone(),
                    asset_tx_id: leg.asset_tx_id.clone(),
                    amount: leg.amount,
                    tx_ledger_type: Some(leg.tx_ledger_type.clone()),
                    symbol: leg.symbol.clone(),
                });
                if let Some((price, source)) = self.exchange_price(&t, leg) {
                    t.price_usd = Some(price);
                    t.price_source = Some(source);
                } else {
                    self.assign_feed_price(&mut t);
                }
                out.push(t);
            }
        }
    }

    fn exchange_price(&self, t: &TxLedger, leg: &ExchangeLeg) -> Option<(Decimal, String)> {
        if let Some(price) = leg.price_usd {
            let source = leg
                .price_source
                .clone()
                .unwrap_or_else(|| SOURCE_EXPLICIT_PRICE.to_string());
            return Some((price, source));
        }
        if !t.amount.is_zero() {
            let explicit = match t.direction {
                Direction::In => leg
                    .costbasis_including_fees_usd
                    .map(|usd| (usd, SOURCE_EXPLICIT_COSTBASIS)),
                Direction::Out => leg
                    .proceeds_after_fees_usd
                    .map(|usd| (usd, SOURCE_EXPLICIT_PROCEEDS)),
                Direction::Approve => None,
            };
            if let Some((usd, source)) = explicit {
                return Some((usd / t.amount, source.to_string()));
            }
        }
        if t.is_fiat() {
            let rate = self.fiat.usd_rate(&t.asset_tx_id, t.timestamp)?;
            let source = if rate == Decimal::ONE && t.asset_tx_id.ends_with("USD") {
                SOURCE_EXCHANGE_USD
            } else {
                SOURCE_FIAT_RATE
            };
            return Some((rate, source.to_string()));
        }
        None
    }

    fn chain_legs(
        &self,
        chain: &str,
        address: &str,
        hash: &str,
        timestamp: i64,
        payload: &ChainPayload,
        out: &mut Vec<TxLedger>,
    ) {
        let tx = payload.tx.as_ref();
        let tx_ledger_type = ledger_type_name(
            tx.and_then(|t| t.name.as_deref()),
            payload.cate_id.as_deref(),
        );

        for item in &payload.receives {
            let from = item.from_addr.clone().unwrap_or_default();
            if let Some(t) = self.item_leg(chain, address, hash, timestamp, item, Direction::In, from, address.to_string(), &tx_ledger_type) {
                out.push(t);
            }
        }
        for item in &payload.sends {
            let to = item.to_addr.clone().unwrap_or_default();
            if let Some(t) = self.item_leg(chain, address, hash, timestamp, item, Direction::Out, address.to_string(), to, &tx_ledger_type) {
                out.push(t);
            }
        }

        if payload.cate_id.as_deref() == Some("approve") {
            match &payload.token_approve {
                Some(approve) => {
                    let to = approve
                        .spender
                        .clone()
                        .or_else(|| tx.map(|t| t.to_addr.clone()))
                        .unwrap_or_default();
                    let t = self.leg(LegSpec {
                        chain,
                        address,
                        hash,
                        timestamp,
                        direction: Direction::Approve,
                        isfee: false,
                        from_address: address.to_string(),
                        to_address: to,
                        asset_tx_id: approve.token_id.clone(),
                        amount: approve.value,
                        tx_ledger_type: Some("approval".to_string()),
                        symbol: self.registry.tx_symbol(chain, &approve.token_id).map(str::to_string),
                    });
                    out.push(t);
                }
                None => warn!(hash = %hash, "Approve without token_approve, skipping leg"),
            }
        }

        if let Some(info) = tx {
            if info.from_addr.eq_ignore_ascii_case(address) {
                if let Some(t) = self.fee_leg(chain, address, hash, timestamp, info) {
                    out.push(t);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn item_leg(
        &self,
        chain: &str,
        address: &str,
        hash: &str,
        timestamp: i64,
        item: &ChainItem,
        direction: Direction,
        from_address: String,
        to_address: String,
        tx_ledger_type: &Option<String>,
    ) -> Option<TxLedger> {
        let Some(asset_tx_id) = item.asset_tx_id() else {
            warn!(hash = %hash, "Leg has no token id, skipping");
            return None;
        };
        if item.amount < Decimal::ZERO {
            warn!(hash = %hash, asset = %asset_tx_id, "Negative amount, skipping leg");
            return None;
        }
        let symbol = item
            .symbol()
            .or_else(|| self.registry.tx_symbol(chain, asset_tx_id))
            .map(str::to_string);
        let mut t = self.leg(LegSpec {
            chain,
            address,
            hash,
            timestamp,
            direction,
            isfee: false,
            from_address,
            to_address,
            asset_tx_id: asset_tx_id.to_string(),
            amount: item.amount,
            tx_ledger_type: tx_ledger_type.clone(),
            symbol,
        });
        self.assign_feed_price(&mut t);
        Some(t)
    }

    fn fee_leg(&self, chain: &str, address: &str, hash: &str, timestamp: i64, info: &ChainTxInfo) -> Option<TxLedger> {
        let amount = info.eth_gas_fee?;
        let asset_tx_id = match self.registry.fee_asset(chain) {
            Some(asset) => asset.to_string(),
            None => match &info.fee_token_id {
                Some(token) => token.clone(),
                None => {
                    warn!(chain = %chain, hash = %hash, "No fee asset for chain, skipping fee");
                    return None;
                }
            },
        };
        let symbol = self.registry.tx_symbol(chain, &asset_tx_id).map(str::to_string);
        let mut t = self.leg(LegSpec {
            chain,
            address,
            hash,
            timestamp,
            direction: Direction::Out,
            isfee: true,
            from_address: info.from_addr.clone(),
            to_address: info.to_addr.clone(),
            asset_tx_id,
            amount,
            tx_ledger_type: Some("fee".to_string()),
            symbol,
        });
        self.assign_feed_price(&mut t);
        Some(t)
    }

    fn leg(&self, parts: LegSpec<'_>) -> TxLedger {
        let id = TxLedger::compute_id(
            parts.chain,
            parts.address,
            parts.hash,
            &parts.from_address,
            &parts.to_address,
            &parts.asset_tx_id,
            parts.isfee,
            parts.amount,
        );
        let asset_price_id = if parts.asset_tx_id.starts_with(FIAT_PREFIX) {
            None
        } else {
            self.registry
                .direct_price_id(parts.chain, &parts.asset_tx_id)
                .map(str::to_string)
        };
        TxLedger {
            id,
            chain: parts.chain.to_string(),
            address: parts.address.to_string(),
            hash: parts.hash.to_string(),
            from_address: parts.from_address,
            to_address: parts.to_address,
            from_address_name: None,
            to_address_name: None,
            asset_tx_id: parts.asset_tx_id,
            isfee: parts.isfee,
            amount: parts.amount,
            timestamp: parts.timestamp,
            direction: parts.direction,
            tx_ledger_type: parts.tx_ledger_type,
            asset_price_id,
            symbol: parts.symbol,
            price_usd: None,
            price_source: None,
        }
    }

    /// Registry map then the price feed; leaves the price unset on a miss
    fn assign_feed_price(&self, t: &mut TxLedger) {
        if t.direction == Direction::Approve {
            return;
        }
        let Some(mapped) = self.registry.map_ledger(t, false) else {
            return;
        };
        if let Some(price) = self.prices.price_at(&mapped.asset_price_id, t.timestamp) {
            t.price_usd = Some(price);
            t.price_source = Some(format!(
                "map asset {}:{} -> {}",
                t.chain, t.asset_tx_id, mapped.asset_price_id
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price::DailyPriceFeed;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn decode(chain: &str, hash: &str, payload: serde_json::Value) -> RawIngestRecord {
        let record = RawIngestRecord::encode(chain, "0xMe", hash, 86_400, &payload).unwrap();
        RawIngestRecord::decode(&record).unwrap()
    }

    fn swap_payload(sender: &str) -> serde_json::Value {
        json!({
            "cate_id": null,
            "tx": {"from_addr": sender, "to_addr": "0xdex", "eth_gas_fee": "0.01", "name": "swapExactAVAXForTokens"},
            "sends": [{"amount": "1", "to_addr": "0xdex", "_token": {"id": "avax", "symbol": "AVAX"}}],
            "receives": [{"amount": "10", "from_addr": "0xdex", "token_id": "0xjoe"}]
        })
    }

    #[test]
    fn test_ledger_type_names() {
        assert_eq!(ledger_type_name(Some("harvest"), None).as_deref(), Some("claimed_reward"));
        assert_eq!(ledger_type_name(Some("depositETH"), None).as_deref(), Some("deposit"));
        assert_eq!(ledger_type_name(Some("withdrawETH"), None).as_deref(), Some("withdraw"));
        assert_eq!(ledger_type_name(Some("repay"), None).as_deref(), Some("loan_repay"));
        assert_eq!(ledger_type_name(None, Some("receive")).as_deref(), Some("receive"));
        assert_eq!(ledger_type_name(Some(""), None), None);
    }

    #[test]
    fn test_chain_record_builds_legs_and_fee() {
        let registry = AssetRegistry::new();
        let mut prices = DailyPriceFeed::new();
        prices.insert("avalanche-2", 86_400, dec!(20));
        let fiat = FiatRates::new();
        let builder = LedgerBuilder::new(&registry, &prices, &fiat);

        let ledgers = builder.build(&[decode("avax", "0xh", swap_payload("0xME"))]).unwrap();
        assert_eq!(ledgers.len(), 3);

        let fee = ledgers.iter().find(|t| t.isfee).unwrap();
        assert_eq!(fee.asset_tx_id, "avax");
        assert_eq!(fee.amount, dec!(0.01));
        assert_eq!(fee.tx_ledger_type.as_deref(), Some("fee"));
        assert_eq!(fee.chain, "avalanche");

        let send = ledgers.iter().find(|t| t.direction == Direction::Out && !t.isfee).unwrap();
        assert_eq!(send.price_usd, Some(dec!(20)));
        assert_eq!(
            send.price_source.as_deref(),
            Some("map asset avalanche:avax -> avalanche-2")
        );
        let receive = ledgers.iter().find(|t| t.direction == Direction::In).unwrap();
        assert_eq!(receive.from_address, "0xdex");
        assert_eq!(receive.price_usd, None);
    }

    #[test]
    fn test_no_fee_when_someone_else_sent() {
        let registry = AssetRegistry::new();
        let prices = DailyPriceFeed::new();
        let fiat = FiatRates::new();
        let builder = LedgerBuilder::new(&registry, &prices, &fiat);
        let ledgers = builder.build(&[decode("avalanche", "0xh", swap_payload("0xother"))]).unwrap();
        assert!(ledgers.iter().all(|t| !t.isfee));
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let registry = AssetRegistry::new();
        let prices = DailyPriceFeed::new();
        let fiat = FiatRates::new();
        let builder = LedgerBuilder::new(&registry, &prices, &fiat);
        let first = builder.build(&[decode("avalanche", "0xh", swap_payload("0xme"))]).unwrap();
        let second = builder.build(&[decode("avalanche", "0xh", swap_payload("0xme"))]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_duplicate_id_is_fatal() {
        let registry = AssetRegistry::new();
        let prices = DailyPriceFeed::new();
        let fiat = FiatRates::new();
        let builder = LedgerBuilder::new(&registry, &prices, &fiat);
        let record = decode("avalanche", "0xh", swap_payload("0xme"));
        let err = builder.build(&[record.clone(), record]).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateLedgerId { .. }));
    }

    #[test]
    fn test_approval_leg() {
        let registry = AssetRegistry::new();
        let prices = DailyPriceFeed::new();
        let fiat = FiatRates::new();
        let builder = LedgerBuilder::new(&registry, &prices, &fiat);
        let payload = json!({
            "cate_id": "approve",
            "tx": {"from_addr": "0xme", "to_addr": "0xjoe", "eth_gas_fee": "0.001", "name": "approve"},
            "token_approve": {"token_id": "0xjoe", "value": "1000", "spender": "0xrouter"}
        });
        let ledgers = builder.build(&[decode("avalanche", "0xa", payload)]).unwrap();
        let approve = ledgers.iter().find(|t| t.direction == Direction::Approve).unwrap();
        assert_eq!(approve.amount, dec!(1000));
        assert_eq!(approve.to_address, "0xrouter");
        assert_eq!(approve.tx_ledger_type.as_deref(), Some("approval"));
        assert_eq!(ledgers.len(), 2);
    }

    #[test]
    fn test_exchange_prices() {
        let registry = AssetRegistry::new();
        let prices = DailyPriceFeed::new();
        let fiat = FiatRates::new();
        let builder = LedgerBuilder::new(&registry, &prices, &fiat);
        let payload = json!({
            "sends": [
                {"asset_tx_id": "FIAT:USD", "amount": "100", "tx_ledger_type": "Coinbase.Buy"},
                {"asset_tx_id": "ETH", "amount": "2", "tx_ledger_type": "Coinbase.Sell", "proceeds_after_fees_usd": "3000"}
            ],
            "receives": [
                {"asset_tx_id": "BTC", "amount": "0.01", "tx_ledger_type": "Coinbase.Buy", "cost_basis_including_fees_usd": "101"},
                {"asset_tx_id": "SOL", "amount": "1", "tx_ledger_type": "Coinbase.Buy", "price": "40"}
            ]
        });
        let ledgers = builder.build(&[decode("import.coinbase", "cb-1", payload)]).unwrap();
        let by_asset = |id: &str| ledgers.iter().find(|t| t.asset_tx_id == id).unwrap();

        assert_eq!(by_asset("FIAT:USD").price_usd, Some(Decimal::ONE));
        assert_eq!(by_asset("FIAT:USD").price_source.as_deref(), Some(SOURCE_EXCHANGE_USD));
        assert_eq!(by_asset("ETH").price_usd, Some(dec!(1500)));
        assert_eq!(by_asset("ETH").price_source.as_deref(), Some(SOURCE_EXPLICIT_PROCEEDS));
        assert_eq!(by_asset("BTC").price_usd, Some(dec!(10100)));
        assert_eq!(by_asset("BTC").price_source.as_deref(), Some(SOURCE_EXPLICIT_COSTBASIS));
        assert_eq!(by_asset("SOL").price_source.as_deref(), Some(SOURCE_EXPLICIT_PRICE));
        assert_eq!(by_asset("BTC").chain, "import.coinbase");
    }
}

//! Price resolution for the legs of one logical

use rust_decimal::Decimal;
use tracing::warn;

use crate::asset::AssetRegistry;
use crate::price::PriceFeed;
use crate::types::{TxLedger, TxLogicalType};

pub const SOURCE_FIXED: &str = "fixed_price";
pub const SOURCE_LEDGER: &str = "tx_ledger";
pub const SOURCE_BORROW_RECEIPT: &str = "borrow_receipt";
pub const SOURCE_REPAY_RECEIPT: &str = "repay_receipt";
pub const SOURCE_WITHDRAW_RECEIPT: &str = "withdraw_receipt";
pub const SOURCE_LP_DERIVED: &str = "lp_derived";
pub const SOURCE_UNKNOWN: &str = "price_unknown";
pub const SOURCE_AUTO_RECONCILED: &str = "auto_reconciled";

/// A resolved USD price and where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    pub price: Decimal,
    pub source: String,
}

impl PriceQuote {
    pub fn new(price: Decimal, source: impl Into<String>) -> Self {
        Self {
            price,
            source: source.into(),
        }
    }

    fn unknown() -> Self {
        Self::new(Decimal::ZERO, SOURCE_UNKNOWN)
    }

    pub fn is_zero(&self) -> bool {
        self.price.is_zero()
    }
}

/// Prices legs in the context of their logical
pub struct Pricer<'a> {
    registry: &'a AssetRegistry,
    prices: &'a dyn PriceFeed,
    kind: Option<TxLogicalType>,
    ins: &'a [&'a TxLedger],
    outs: &'a [&'a TxLedger],
}

impl<'a> Pricer<'a> {
    pub fn new(
        registry: &'a AssetRegistry,
        prices: &'a dyn PriceFeed,
        kind: Option<TxLogicalType>,
        ins: &'a [&'a TxLedger],
        outs: &'a [&'a TxLedger],
    ) -> Self {
        Self {
            registry,
            prices,
            kind,
            ins,
            outs,
        }
    }

    /// Logical types whose legs are receipts or pool tokens. Guessing by
    /// symbol would mistake them for the underlying asset.
    fn allows_symbol_fallback(&self) -> bool {
        !matches!(
            self.kind,
            Some(
                TxLogicalType::Deposit
                    | TxLogicalType::Withdraw
                    | TxLogicalType::Borrow
                    | TxLogicalType::Repay
                    | TxLogicalType::Lp
            )
        )
    }

    /// Price of a leg, falling back through derivation and type rules
    pub fn price(&self, t: &TxLedger) -> PriceQuote {
        if let Some(quote) = self.known_price(t, self.allows_symbol_fallback()) {
            return quote;
        }

        if let ([tin], [tout]) = (self.ins, self.outs) {
            if let Some(quote) = self.derive(t, tin, tout) {
                return quote;
            }
        }

        let in_logical = self.ins.iter().chain(self.outs).any(|l| l.id == t.id);
        if !in_logical {
            return PriceQuote::unknown();
        }

        match self.kind {
            Some(TxLogicalType::Borrow) => PriceQuote::new(Decimal::ZERO, SOURCE_BORROW_RECEIPT),
            Some(TxLogicalType::Repay) => PriceQuote::new(Decimal::ZERO, SOURCE_REPAY_RECEIPT),
            Some(TxLogicalType::Withdraw) => {
                PriceQuote::new(Decimal::ZERO, SOURCE_WITHDRAW_RECEIPT)
            }
            Some(TxLogicalType::Lp) => self.lp_price(t).unwrap_or_else(PriceQuote::unknown),
            _ => {
                if !(self.ins.len() == 1 && self.outs.is_empty()) {
                    warn!(
                        tx_ledger_id = %t.id,
                        asset_tx_id = %t.asset_tx_id,
                        "No way to price leg"
                    );
                }
                PriceQuote::unknown()
            }
        }
    }

    /// Prices that need no other leg: fixed table, the ledger itself, then
    /// the feed through the registry
    pub fn known_price(&self, t: &TxLedger, symbol_fallback: bool) -> Option<PriceQuote> {
        if let Some(price) = self.registry.fixed_price(&t.chain, &t.asset_tx_id) {
            return Some(PriceQuote::new(price, SOURCE_FIXED));
        }

        if let Some(price) = t.price_usd {
            let source = t.price_source.as_deref().unwrap_or(SOURCE_LEDGER);
            return Some(PriceQuote::new(price, source));
        }

        if let Some(mapped) = self.registry.map_ledger(t, false) {
            if let Some(price) = self.prices.price_at(&mapped.asset_price_id, t.timestamp) {
                let source = format!(
                    "map asset {}:{} -> {}",
                    t.chain, t.asset_tx_id, mapped.asset_price_id
                );
                return Some(PriceQuote::new(price, source));
            }
        }

        if let Some(price_id) = self.registry.direct_price_id(&t.chain, &t.asset_tx_id) {
            if let Some(price) = self.prices.price_at(price_id, t.timestamp) {
                let source = format!("asset_tx {}:{} -> {}", t.chain, t.asset_tx_id, price_id);
                return Some(PriceQuote::new(price, source));
            }
        }

        if symbol_fallback {
            if let Some(mapped) = self.registry.map_ledger(t, true) {
                if let Some(price) = self.prices.price_at(&mapped.asset_price_id, t.timestamp) {
                    let symbol = mapped.symbol.as_deref().unwrap_or(t.label());
                    let source = format!("mapped symbol {} -> {}", symbol, mapped.asset_price_id);
                    return Some(PriceQuote::new(price, source));
                }
            }
        }

        None
    }

    /// Feed price of a token without any logical context
    pub fn feed_price(&self, t: &TxLedger) -> Option<Decimal> {
        self.known_price(t, false).map(|q| q.price)
    }

    /// Value one side of a one-in one-out logical by the other side
    fn derive(&self, t: &TxLedger, tin: &TxLedger, tout: &TxLedger) -> Option<PriceQuote> {
        let (other, tag) = if t.id == tin.id {
            (tout, "derived:out")
        } else if t.id == tout.id {
            (tin, "derived:in")
        } else {
            return None;
        };
        if t.amount.is_zero() {
            return None;
        }
        let other_price = self.known_price(other, self.allows_symbol_fallback())?;
        let price = other.amount * other_price.price / t.amount;
        let source = format!(
            "{tag} - {} {} @ {}",
            other.amount.normalize(),
            other.label(),
            other_price.price.normalize()
        );
        Some(PriceQuote::new(price, source))
    }

    /// Whether this lp logical deposits into a pool
    pub fn is_lp_entry(&self) -> bool {
        self.kind == Some(TxLogicalType::Lp) && self.ins.len() == 1 && self.outs.len() >= 2
    }

    /// Pool-token price from the value of the tokens on the other side
    fn lp_price(&self, t: &TxLedger) -> Option<PriceQuote> {
        let (priced_side, lp_leg) = if self.ins.len() == 1 && self.outs.len() >= 2 {
            (self.outs, self.ins[0])
        } else if self.ins.len() >= 2 && self.outs.len() == 1 {
            (self.ins, self.outs[0])
        } else {
            return None;
        };
        if lp_leg.id != t.id || lp_leg.amount.is_zero() {
            return None;
        }

        let total: Decimal = priced_side
            .iter()
            .filter_map(|leg| self.known_price(leg, true).map(|q| q.price * leg.amount))
            .sum();
        if total.is_zero() {
            return None;
        }
        Some(PriceQuote::new(total / lp_leg.amount, SOURCE_LP_DERIVED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price::DailyPriceFeed;
    use crate::types::Direction;
    use persistence::repository::{AssetPriceRecord, AssetTxRecord};
    use rust_decimal_macros::dec;

    fn leg(id: &str, direction: Direction, asset: &str, amount: Decimal) -> TxLedger {
        TxLedger {
            id: id.into(),
            chain: "avalanche".into(),
            address: "0xme".into(),
            hash: "0xh".into(),
            from_address: "0xme".into(),
            to_address: "0xdex".into(),
            from_address_name: None,
            to_address_name: None,
            asset_tx_id: asset.into(),
            isfee: false,
            amount,
            timestamp: 86_400,
            direction,
            tx_ledger_type: None,
            asset_price_id: None,
            symbol: None,
            price_usd: None,
            price_source: None,
        }
    }

    fn registry() -> AssetRegistry {
        AssetRegistry::from_records(
            vec![
                AssetPriceRecord {
                    id: "avalanche-2".into(),
                    source: "coingecko".into(),
                    symbol: "AVAX".into(),
                    name: "Avalanche".into(),
                    market_cap: Some("1000".into()),
                },
                AssetPriceRecord {
                    id: "joe".into(),
                    source: "coingecko".into(),
                    symbol: "JOE".into(),
                    name: "JOE".into(),
                    market_cap: Some("10".into()),
                },
            ],
            vec![AssetTxRecord {
                chain: "avalanche".into(),
                id: "0xpng".into(),
                asset_price_id: None,
                symbol: Some("JOE".into()),
                name: None,
            }],
        )
    }

    fn feed() -> DailyPriceFeed {
        let mut feed = DailyPriceFeed::new();
        feed.insert("avalanche-2", 86_400, dec!(5));
        feed.insert("joe", 86_400, dec!(2));
        feed
    }

    #[test]
    fn test_fixed_then_ledger_then_feed() {
        let mut registry = registry();
        registry.add_fixed_price("avalanche", "0xspam", dec!(0));
        let feed = feed();
        let pricer = Pricer::new(&registry, &feed, Some(TxLogicalType::Receive), &[], &[]);

        let spam = leg("s", Direction::In, "0xspam", dec!(1));
        assert_eq!(pricer.price(&spam).source, SOURCE_FIXED);

        let mut explicit = leg("e", Direction::In, "avax", dec!(1));
        explicit.price_usd = Some(dec!(7));
        assert_eq!(pricer.price(&explicit), PriceQuote::new(dec!(7), SOURCE_LEDGER));

        let avax = leg("a", Direction::In, "avax", dec!(1));
        let quote = pricer.price(&avax);
        assert_eq!(quote.price, dec!(5));
        assert_eq!(quote.source, "map asset avalanche:avax -> avalanche-2");
    }

    #[test]
    fn test_symbol_fallback_skipped_for_receipt_types() {
        let registry = registry();
        let feed = feed();
        let png = leg("p", Direction::In, "0xpng", dec!(1));

        let receive = Pricer::new(&registry, &feed, Some(TxLogicalType::Receive), &[], &[]);
        assert_eq!(receive.price(&png).source, "mapped symbol JOE -> joe");

        let deposit = Pricer::new(&registry, &feed, Some(TxLogicalType::Deposit), &[], &[]);
        assert!(deposit.known_price(&png, deposit.allows_symbol_fallback()).is_none());
    }

    #[test]
    fn test_derives_from_the_other_side() {
        let registry = registry();
        let feed = feed();
        let tout = leg("o", Direction::Out, "avax", dec!(2));
        let tin = leg("i", Direction::In, "0xnew", dec!(20));
        let ins = [&tin];
        let outs = [&tout];
        let pricer = Pricer::new(&registry, &feed, Some(TxLogicalType::Swap), &ins, &outs);

        let quote = pricer.price(&tin);
        assert_eq!(quote.price, dec!(0.5));
        assert!(quote.source.starts_with("derived:out - "));
    }

    #[test]
    fn test_receipt_fallbacks_and_unknown() {
        let registry = registry();
        let feed = feed();
        let receipt = leg("r", Direction::In, "0xdebt", dec!(1));
        let asset = leg("a", Direction::In, "avax", dec!(1));
        let ins = [&asset, &receipt];
        let borrow = Pricer::new(&registry, &feed, Some(TxLogicalType::Borrow), &ins, &[]);
        assert_eq!(borrow.price(&receipt).source, SOURCE_BORROW_RECEIPT);

        let only = [&receipt];
        let receive = Pricer::new(&registry, &feed, Some(TxLogicalType::Receive), &only, &[]);
        assert_eq!(receive.price(&receipt), PriceQuote::unknown());
    }

    #[test]
    fn test_lp_entry_price() {
        let registry = registry();
        let feed = feed();
        let avax = leg("a", Direction::Out, "avax", dec!(1));
        let joe = leg("j", Direction::Out, "0xpng", dec!(5));
        let lp = leg("l", Direction::In, "0xlp", dec!(3));
        let ins = [&lp];
        let outs = [&avax, &joe];
        let pricer = Pricer::new(&registry, &feed, Some(TxLogicalType::Lp), &ins, &outs);

        assert!(pricer.is_lp_entry());
        // 1 AVAX @ 5 + 5 JOE @ 2 over 3 pool tokens
        assert_eq!(pricer.price(&lp), PriceQuote::new(dec!(5), SOURCE_LP_DERIVED));
    }
}

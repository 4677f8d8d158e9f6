use persistence::repository::AssetPriceRecord;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::{CostbasisGenerator, LotBook};
use crate::asset::AssetRegistry;
use crate::config::EngineConfig;
use crate::error::LogicalError;
use crate::price::DailyPriceFeed;
use crate::types::{
    CostbasisDisposal, CostbasisLot, Direction, FlagName, TxLedger, TxLogical, TxLogicalType,
};

const AVAX: &str = "avax";
const WAVAX: &str = "0xb31f66aa3c1e785363f0875a1b74e27b85fd66c7";
const USDC: &str = "0xb97ef9ef8734c71904d8002f8b6bc66dd9c48a6e";
const USDC_E: &str = "0xa7d7079b0fead91f3e65f86e8915cb59c1a4c664";
const JOE: &str = "0x6e84a6216ea6dacc71ee8e6b0a5b7322eebc0fdd";

fn day(n: i64) -> i64 {
    n * 86_400
}

fn leg(id: &str, direction: Direction, asset: &str, amount: Decimal, timestamp: i64) -> TxLedger {
    let (from, to) = match direction {
        Direction::In => ("0xdex", "0xme"),
        _ => ("0xme", "0xdex"),
    };
    TxLedger {
        id: id.into(),
        chain: "avalanche".into(),
        address: "0xme".into(),
        hash: format!("hash-{timestamp}"),
        from_address: from.into(),
        to_address: to.into(),
        from_address_name: None,
        to_address_name: None,
        asset_tx_id: asset.into(),
        isfee: false,
        amount,
        timestamp,
        direction,
        tx_ledger_type: None,
        asset_price_id: None,
        symbol: None,
        price_usd: None,
        price_source: None,
    }
}

fn tin(id: &str, asset: &str, amount: Decimal, timestamp: i64) -> TxLedger {
    leg(id, Direction::In, asset, amount, timestamp)
}

fn tout(id: &str, asset: &str, amount: Decimal, timestamp: i64) -> TxLedger {
    leg(id, Direction::Out, asset, amount, timestamp)
}

fn fee(id: &str, asset: &str, amount: Decimal, timestamp: i64) -> TxLedger {
    let mut t = tout(id, asset, amount, timestamp);
    t.isfee = true;
    t
}

fn logical(id: &str, kind: TxLogicalType, tx_ledgers: Vec<TxLedger>) -> TxLogical {
    TxLogical {
        id: id.into(),
        count: tx_ledgers.len() as i64,
        description: None,
        note: None,
        timestamp: tx_ledgers.first().map(|t| t.timestamp).unwrap_or_default(),
        address: "0xme".into(),
        tx_logical_type: Some(kind),
        tx_ledgers,
        flags: Vec::new(),
    }
}

fn price_record(id: &str, symbol: &str) -> AssetPriceRecord {
    AssetPriceRecord {
        id: id.into(),
        source: "coingecko".into(),
        symbol: symbol.into(),
        name: symbol.into(),
        market_cap: None,
    }
}

struct Harness {
    registry: AssetRegistry,
    feed: DailyPriceFeed,
    config: EngineConfig,
    book: LotBook,
}

impl Harness {
    fn new() -> Self {
        Self {
            registry: AssetRegistry::from_records(
                vec![
                    price_record("avalanche-2", "AVAX"),
                    price_record("usd-coin", "USDC"),
                ],
                Vec::new(),
            ),
            feed: DailyPriceFeed::new(),
            config: EngineConfig::default(),
            book: LotBook::new("alice"),
        }
    }

    fn price(&mut self, asset_price_id: &str, on: i64, price: Decimal) {
        self.feed.insert(asset_price_id, day(on), price);
    }

    fn run(&mut self, logical: TxLogical) -> Result<(), LogicalError> {
        CostbasisGenerator::new(&self.registry, &self.feed, &self.config)
            .process(&mut self.book, &logical)
    }

    fn lots_of(&self, asset_price_id: &str) -> Vec<&CostbasisLot> {
        self.book
            .lots()
            .iter()
            .filter(|l| l.asset_price_id.as_deref() == Some(asset_price_id))
            .collect()
    }

    fn lot(&self, tx_ledger_id: &str) -> &CostbasisLot {
        self.book.lot(tx_ledger_id).unwrap()
    }

    fn disposals_of(&self, symbol: &str) -> Vec<&CostbasisDisposal> {
        self.book
            .disposals()
            .iter()
            .filter(|d| d.symbol == symbol)
            .collect()
    }
}

fn receive(h: &mut Harness, id: &str, asset: &str, amount: Decimal, on: i64) {
    h.run(logical(id, TxLogicalType::Receive, vec![tin(id, asset, amount, day(on))]))
        .unwrap();
}

#[test]
fn test_overdraw_creates_reconciliation_lot() {
    let mut h = Harness::new();
    h.price("avalanche-2", 1, dec!(1));
    h.price("avalanche-2", 2, dec!(5));
    h.price("avalanche-2", 3, dec!(10));

    receive(&mut h, "r1", AVAX, dec!(5), 1);
    h.run(logical(
        "s1",
        TxLogicalType::Swap,
        vec![tout("s1-out", AVAX, dec!(1), day(2)), tin("s1-in", JOE, dec!(10), day(2))],
    ))
    .unwrap();
    h.run(logical(
        "s2",
        TxLogicalType::Swap,
        vec![tout("s2-out", AVAX, dec!(10), day(3)), tin("s2-in", JOE, dec!(200), day(3))],
    ))
    .unwrap();

    let lots = h.lots_of("avalanche-2");
    assert_eq!(lots.len(), 2);
    assert!(lots.iter().all(|l| l.current_amount.is_zero()));

    let reconciled = h.lot("s2-out");
    assert_eq!(reconciled.original_amount, dec!(6));
    assert_eq!(reconciled.basis_usd, dec!(0));
    assert!(reconciled.flags.contains(&FlagName::AutoReconciled));

    let disposals = h.disposals_of("AVAX");
    let amounts: Vec<Decimal> = disposals.iter().map(|d| d.amount).collect();
    assert_eq!(amounts, vec![dec!(1), dec!(4), dec!(6)]);
    assert_eq!((disposals[0].basis_usd, disposals[0].total_usd), (dec!(1), dec!(5)));
    assert_eq!((disposals[1].basis_usd, disposals[1].total_usd), (dec!(4), dec!(40)));
    assert_eq!((disposals[2].basis_usd, disposals[2].total_usd), (dec!(0), dec!(60)));
    assert_eq!(disposals[2].basis_tx_ledger_id, "s2-out");

    // duration is measured from the lot each disposal drew on
    assert_eq!(disposals[1].duration_held, day(3) - day(1));
    assert_eq!(disposals[2].duration_held, 0);

    // JOE priced from the AVAX given up
    assert_eq!(h.lot("s1-in").price_usd, dec!(0.5));
}

#[test]
fn test_wrap_then_dispose_uses_native_lot() {
    let mut h = Harness::new();
    h.price("avalanche-2", 1, dec!(1));
    h.price("avalanche-2", 3, dec!(2));
    h.price("usd-coin", 3, dec!(1));

    receive(&mut h, "r1", AVAX, dec!(1), 1);
    h.run(logical(
        "w1",
        TxLogicalType::Wrap,
        vec![tout("w1-out", AVAX, dec!(1), day(2)), tin("w1-in", WAVAX, dec!(1), day(2))],
    ))
    .unwrap();
    h.run(logical(
        "s1",
        TxLogicalType::Swap,
        vec![tout("s1-out", WAVAX, dec!(1), day(3)), tin("s1-in", USDC, dec!(2), day(3))],
    ))
    .unwrap();

    assert!(h.book.lots().iter().all(|l| l.asset_tx_id != WAVAX));
    let avax = h.lots_of("avalanche-2");
    assert_eq!(avax.len(), 1);
    assert_eq!(avax[0].current_amount, dec!(0));

    assert_eq!(h.book.disposals().len(), 1);
    let d = &h.book.disposals()[0];
    assert_eq!(d.symbol, "AVAX");
    assert_eq!(d.asset_price_id.as_deref(), Some("avalanche-2"));
    assert_eq!((d.amount, d.basis_usd, d.total_usd), (dec!(1), dec!(1), dec!(2)));
}

#[test]
fn test_deposit_with_change() {
    let mut h = Harness::new();
    h.price("avalanche-2", 1, dec!(1));

    receive(&mut h, "r1", AVAX, dec!(50), 1);
    h.run(logical(
        "d1",
        TxLogicalType::Deposit,
        vec![
            tout("d1-out", AVAX, dec!(10), day(2)),
            tin("d1-change", AVAX, dec!(1), day(2)),
            tin("d1-moo", "0xmooavax", dec!(10), day(2)),
        ],
    ))
    .unwrap();

    assert_eq!(h.lot("r1").current_amount, dec!(50));
    let receipt = h.lot("d1-moo");
    assert!(receipt.receipt);
    assert_eq!(receipt.current_amount, dec!(10));
    assert_eq!(receipt.history[0].amount, dec!(9));
    assert!(h.book.lot("d1-change").is_none());
}

#[test]
fn test_withdrawal_with_interest() {
    let mut h = Harness::new();
    h.price("avalanche-2", 1, dec!(1));
    h.price("avalanche-2", 2, dec!(5));
    h.price("avalanche-2", 3, dec!(6));

    receive(&mut h, "r1", AVAX, dec!(5), 1);
    h.run(logical(
        "d1",
        TxLogicalType::Deposit,
        vec![tout("d1-out", AVAX, dec!(1), day(2)), tin("d1-in", "0xavwavax", dec!(0.9), day(2))],
    ))
    .unwrap();
    h.run(logical(
        "w1",
        TxLogicalType::Withdraw,
        vec![tout("w1-out", "0xavwavax", dec!(0.9), day(3)), tin("w1-in", AVAX, dec!(1.1), day(3))],
    ))
    .unwrap();

    let avax = h.lots_of("avalanche-2");
    assert_eq!(avax.len(), 2);
    assert_eq!(h.lot("r1").current_amount, dec!(5));
    let earned = h.lot("w1-in");
    assert_eq!(earned.current_amount, dec!(0.1));
    assert_eq!(earned.price_usd, dec!(6));

    assert_eq!(h.lot("d1-in").current_amount, dec!(0));

    let income = h.book.income();
    assert_eq!(income.len(), 1);
    assert_eq!(income[0].net_usd, dec!(0.6));
    assert_eq!(income[0].symbol, "AVAX");
    assert_eq!(income[0].amount, dec!(0.1));
}

#[test]
fn test_borrow_and_repay_with_interest() {
    let mut h = Harness::new();
    h.price("avalanche-2", 1, dec!(5));
    h.price("avalanche-2", 2, dec!(5));
    h.price("avalanche-2", 3, dec!(6));

    receive(&mut h, "r1", AVAX, dec!(5), 1);

    let mut borrowed = tin("b1-avax", AVAX, dec!(1), day(2));
    borrowed.asset_price_id = Some("avalanche-2".into());
    h.run(logical(
        "b1",
        TxLogicalType::Borrow,
        vec![borrowed, tin("b1-debt", "0xdebtwavax", dec!(1.2), day(2))],
    ))
    .unwrap();

    let loan = h.lot("b1-avax");
    assert!(!loan.receipt);
    assert_eq!(loan.price_usd, dec!(5));
    assert_eq!(loan.history[0].id, "b1-debt");
    let debt = h.lot("b1-debt");
    assert!(debt.receipt);
    assert_eq!(debt.history[0].id, "b1-avax");

    let mut repaid = tout("p1-avax", AVAX, dec!(1.1), day(3));
    repaid.asset_price_id = Some("avalanche-2".into());
    h.run(logical(
        "p1",
        TxLogicalType::Repay,
        vec![repaid, tout("p1-debt", "0xdebtwavax", dec!(1.2), day(3))],
    ))
    .unwrap();

    // the cheapest, oldest AVAX pays the loan back
    assert_eq!(h.lot("r1").current_amount, dec!(3.9));
    assert_eq!(h.lot("r1").price_usd, dec!(5));
    assert_eq!(h.lot("b1-avax").current_amount, dec!(1));
    assert_eq!(h.lot("b1-debt").current_amount, dec!(0));

    assert!(h.book.disposals().is_empty());
    assert!(h.book.income().iter().all(|i| i.net_usd <= Decimal::ZERO));
    assert_eq!(h.book.income()[0].amount, dec!(-0.1));
}

#[test]
fn test_like_kind_usdc_across_token_ids() {
    let mut h = Harness::new();
    h.price("usd-coin", 1, dec!(1));
    h.price("usd-coin", 2, dec!(1));

    receive(&mut h, "r1", USDC, dec!(1), 1);
    receive(&mut h, "r2", USDC_E, dec!(1), 1);
    h.run(logical("sp1", TxLogicalType::Spend, vec![tout("sp1-out", USDC, dec!(1.5), day(2))]))
        .unwrap();

    let lots = h.lots_of("usd-coin");
    assert_eq!(lots.len(), 2);
    let left: Decimal = lots.iter().map(|l| l.current_amount).sum();
    assert_eq!(left, dec!(0.5));
    assert!(lots.iter().all(|l| !l.flags.contains(&FlagName::AutoReconciled)));

    let disposals = h.book.disposals();
    assert_eq!(disposals.len(), 2);
    assert!(disposals
        .iter()
        .all(|d| d.asset_price_id.as_deref() == Some("usd-coin")));
    let total: Decimal = disposals.iter().map(|d| d.amount).sum();
    assert_eq!(total, dec!(1.5));
}

#[test]
fn test_sending_a_receipt_unwinds_the_deposit() {
    let mut h = Harness::new();
    h.price("avalanche-2", 1, dec!(1));
    h.price("avalanche-2", 2, dec!(5));

    receive(&mut h, "r1", AVAX, dec!(5), 1);
    h.run(logical(
        "d1",
        TxLogicalType::Deposit,
        vec![tout("d1-out", AVAX, dec!(1), day(2)), tin("d1-in", "0xavavax", dec!(1), day(2))],
    ))
    .unwrap();
    h.run(logical("s1", TxLogicalType::Send, vec![tout("s1-out", "0xavavax", dec!(0.5), day(3))]))
        .unwrap();

    assert_eq!(h.lot("d1-in").current_amount, dec!(0.5));
    assert_eq!(h.lot("r1").current_amount, dec!(4.5));
    assert!(h.book.disposals().is_empty());
}

#[test]
fn test_receipt_disposal_uses_underlying_basis() {
    let mut h = Harness::new();
    h.price("avalanche-2", 1, dec!(1));
    h.price("avalanche-2", 2, dec!(5));
    h.price("usd-coin", 3, dec!(1));

    receive(&mut h, "r1", AVAX, dec!(5), 1);
    h.run(logical(
        "d1",
        TxLogicalType::Deposit,
        vec![tout("d1-out", AVAX, dec!(1), day(2)), tin("d1-in", "0xavavax", dec!(2), day(2))],
    ))
    .unwrap();
    h.run(logical(
        "s1",
        TxLogicalType::Swap,
        vec![tout("s1-out", "0xavavax", dec!(1), day(3)), tin("s1-in", USDC, dec!(3), day(3))],
    ))
    .unwrap();

    let disposals = h.book.disposals();
    assert_eq!(disposals.len(), 1);
    assert_eq!(disposals[0].basis_usd, dec!(2.5));
    assert_eq!(disposals[0].total_usd, dec!(3));
    assert_eq!(h.lot("d1-in").current_amount, dec!(1));
    assert_eq!(h.lot("r1").current_amount, dec!(4.5));
}

#[test]
fn test_fee_is_counted_once() {
    let mut h = Harness::new();
    h.price("avalanche-2", 1, dec!(1));
    h.price("avalanche-2", 2, dec!(5));

    receive(&mut h, "r1", AVAX, dec!(5), 1);
    h.run(logical(
        "s1",
        TxLogicalType::Swap,
        vec![
            tout("s1-out", AVAX, dec!(1), day(2)),
            tin("s1-in", JOE, dec!(10), day(2)),
            fee("s1-fee", AVAX, dec!(0.25), day(2)),
        ],
    ))
    .unwrap();

    assert_eq!(h.lot("s1-in").basis_usd, dec!(6.25));
    let disposals = h.book.disposals();
    assert_eq!(disposals.len(), 1);
    assert_eq!(disposals[0].total_usd, dec!(3.75));
    assert_eq!(disposals[0].basis_usd, dec!(1));
    assert_eq!(h.lot("r1").current_amount, dec!(3.75));
}

#[test]
fn test_ledger_price_wins_over_feed() {
    let mut h = Harness::new();
    h.price("avalanche-2", 1, dec!(100));

    let mut bought = tin("r1", AVAX, dec!(2), day(1));
    bought.price_usd = Some(dec!(10));
    h.run(logical("r1", TxLogicalType::Receive, vec![bought])).unwrap();

    let mut sold = tout("sp1", AVAX, dec!(2), day(2));
    sold.price_usd = Some(dec!(5));
    h.run(logical("sp1", TxLogicalType::Spend, vec![sold])).unwrap();

    let lot = h.lot("r1");
    assert_eq!(lot.basis_usd, dec!(20));
    assert_eq!(lot.price_source, "tx_ledger");
    let d = &h.book.disposals()[0];
    assert_eq!((d.basis_usd, d.total_usd), (dec!(20), dec!(10)));
}

#[test]
fn test_unpriced_receive_is_flagged() {
    let mut h = Harness::new();
    receive(&mut h, "r1", "0xspam", dec!(1000), 1);

    let lot = h.lot("r1");
    assert_eq!(lot.price_usd, dec!(0));
    assert_eq!(lot.price_source, "price_unknown");
    assert_eq!(lot.flags, vec![FlagName::ZeroPrice]);
}

#[test]
fn test_send_is_not_a_disposal() {
    let mut h = Harness::new();
    h.price("avalanche-2", 1, dec!(1));
    receive(&mut h, "r1", AVAX, dec!(5), 1);
    h.run(logical("s1", TxLogicalType::Send, vec![tout("s1-out", AVAX, dec!(2), day(2))]))
        .unwrap();

    assert_eq!(h.lot("r1").current_amount, dec!(3));
    assert!(h.book.disposals().is_empty());
}

#[test]
fn test_flags_skip_or_hide() {
    let mut h = Harness::new();
    h.price("avalanche-2", 1, dec!(1));
    h.price("avalanche-2", 2, dec!(2));

    let mut ignored = logical("r0", TxLogicalType::Receive, vec![tin("r0", AVAX, dec!(9), day(1))]);
    ignored.flags.push(FlagName::IgnoredFromCostbasis.as_str().into());
    h.run(ignored).unwrap();
    assert!(h.book.lots().is_empty());

    receive(&mut h, "r1", AVAX, dec!(1), 1);
    let mut hidden = logical("sp1", TxLogicalType::Spend, vec![tout("sp1-out", AVAX, dec!(1), day(2))]);
    hidden.flags.push(FlagName::HiddenFrom8949.as_str().into());
    h.run(hidden).unwrap();

    let d = &h.book.disposals()[0];
    assert_eq!(d.total_usd, dec!(2));
    assert_eq!(d.flags, vec![FlagName::HiddenFrom8949]);
}

#[test]
fn test_lp_entry_prices_pool_token() {
    let mut h = Harness::new();
    h.price("avalanche-2", 1, dec!(5));
    h.price("usd-coin", 1, dec!(1));

    receive(&mut h, "r1", AVAX, dec!(1), 1);
    receive(&mut h, "r2", USDC, dec!(5), 1);
    h.run(logical(
        "lp1",
        TxLogicalType::Lp,
        vec![
            tout("lp1-avax", AVAX, dec!(1), day(1)),
            tout("lp1-usdc", USDC, dec!(5), day(1)),
            tin("lp1-in", "0xjlp", dec!(2), day(1)),
        ],
    ))
    .unwrap();

    let pool = h.lot("lp1-in");
    assert_eq!(pool.price_usd, dec!(5));
    assert_eq!(pool.price_source, "lp_derived");
    assert_eq!(h.book.price_updates()[0].tx_ledger_id, "lp1-in");

    let total: Decimal = h.book.disposals().iter().map(|d| d.total_usd).sum();
    assert_eq!(total, dec!(10));
}

#[test]
fn test_failed_logical_leaves_book_untouched() {
    let mut h = Harness::new();
    h.price("avalanche-2", 1, dec!(1));
    receive(&mut h, "r1", AVAX, dec!(5), 1);

    let err = h
        .run(logical(
            "s1",
            TxLogicalType::Swap,
            vec![
                tout("s1-a", AVAX, dec!(1), day(2)),
                tout("s1-b", USDC, dec!(1), day(2)),
                tin("s1-in", JOE, dec!(10), day(2)),
                fee("s1-fee", AVAX, dec!(0.1), day(2)),
            ],
        ))
        .unwrap_err();
    assert!(matches!(err, LogicalError::UnhandledShape { kind: "swap", .. }));
    assert_eq!(h.book.lots().len(), 1);
    assert_eq!(h.lot("r1").current_amount, dec!(5));

    let err = h
        .run(logical(
            "d1",
            TxLogicalType::Deposit,
            vec![
                tout("d1-out", AVAX, dec!(1), day(3)),
                tin("d1-a", "0xreceipt-a", dec!(1), day(3)),
                tin("d1-b", "0xreceipt-b", dec!(1), day(3)),
            ],
        ))
        .unwrap_err();
    assert_eq!(err, LogicalError::MultipleDepositReceipts);

    let err = h
        .run(logical(
            "b1",
            TxLogicalType::Borrow,
            vec![tin("b1-a", "0xa", dec!(1), day(3)), tin("b1-b", "0xb", dec!(1), day(3))],
        ))
        .unwrap_err();
    assert_eq!(err, LogicalError::AmbiguousLoan);

    let mut untyped = logical("u1", TxLogicalType::Receive, vec![tin("u1", AVAX, dec!(1), day(3))]);
    untyped.tx_logical_type = None;
    assert_eq!(h.run(untyped).unwrap_err(), LogicalError::Untyped);
    assert_eq!(h.book.lots().len(), 1);
}

#[test]
fn test_fiat_purchase_creates_lot_only() {
    let mut h = Harness::new();
    h.price("avalanche-2", 1, dec!(20));

    let mut usd = tout("t1-usd", "FIAT:USD", dec!(100), day(1));
    usd.price_usd = Some(dec!(1));
    h.run(logical(
        "t1",
        TxLogicalType::Trade,
        vec![usd, tin("t1-avax", AVAX, dec!(5), day(1))],
    ))
    .unwrap();

    assert_eq!(h.lot("t1-avax").basis_usd, dec!(100));
    assert!(h.book.lot("t1-usd").is_none());
    assert!(h.book.disposals().is_empty());
}

#[test]
fn test_swap_proceeds_capped_by_value_received() {
    let mut h = Harness::new();
    h.price("avalanche-2", 1, dec!(1));
    h.price("avalanche-2", 2, dec!(2));
    h.price("usd-coin", 3, dec!(1));

    receive(&mut h, "r1", AVAX, dec!(1), 1);
    receive(&mut h, "r2", AVAX, dec!(1), 2);

    // the OUT carries a price far above what came back
    let mut sold = tout("s1-out", AVAX, dec!(2), day(3));
    sold.price_usd = Some(dec!(100));
    h.run(logical(
        "s1",
        TxLogicalType::Swap,
        vec![sold, tin("s1-in", USDC, dec!(10), day(3))],
    ))
    .unwrap();

    let disposals = h.disposals_of("AVAX");
    assert_eq!(disposals.len(), 2);
    let received = dec!(10) * dec!(1);
    let total: Decimal = disposals.iter().map(|d| d.total_usd).sum();
    assert!(total <= received);
    assert_eq!(total, dec!(10));
    assert!(disposals.iter().all(|d| d.total_usd >= Decimal::ZERO));

    let basis: Decimal = disposals.iter().map(|d| d.basis_usd).sum();
    assert_eq!(basis, dec!(3));
    assert_eq!(h.lot("s1-in").basis_usd, dec!(10));
}

/// Deposit one `asset` for one `receipt` on day `on`
fn deposit_into(h: &mut Harness, id: &str, asset: &str, receipt: &str, on: i64) {
    h.run(logical(
        id,
        TxLogicalType::Deposit,
        vec![
            tout(&format!("{id}-out"), asset, dec!(1), day(on)),
            tin(&format!("{id}-in"), receipt, dec!(1), day(on)),
        ],
    ))
    .unwrap();
}

#[test]
fn test_receipt_unwind_stops_at_depth_limit() {
    let mut h = Harness::new();
    h.price("avalanche-2", 1, dec!(1));

    receive(&mut h, "r1", AVAX, dec!(5), 1);
    deposit_into(&mut h, "d1", AVAX, "0xreceipt-a", 2);
    deposit_into(&mut h, "d2", "0xreceipt-a", "0xreceipt-b", 3);
    deposit_into(&mut h, "d3", "0xreceipt-b", "0xreceipt-c", 4);
    deposit_into(&mut h, "d4", "0xreceipt-c", "0xreceipt-d", 5);

    h.run(logical("s1", TxLogicalType::Send, vec![tout("s1-out", "0xreceipt-d", dec!(1), day(6))]))
        .unwrap();

    // d, c and b unwind; the fourth level is abandoned
    assert_eq!(h.lot("d4-in").current_amount, dec!(0));
    assert_eq!(h.lot("d3-in").current_amount, dec!(0));
    assert_eq!(h.lot("d2-in").current_amount, dec!(0));
    assert_eq!(h.lot("d1-in").current_amount, dec!(1));
    assert_eq!(h.lot("r1").current_amount, dec!(5));

    assert_eq!(h.book.lots().len(), 5);
    assert!(h.book.lots().iter().all(|l| !l.flags.contains(&FlagName::AutoReconciled)));
    assert!(h.book.disposals().is_empty());
}

#[test]
fn test_receipt_unwind_reaches_underlying_within_limit() {
    let mut h = Harness::new();
    h.price("avalanche-2", 1, dec!(1));

    receive(&mut h, "r1", AVAX, dec!(5), 1);
    deposit_into(&mut h, "d1", AVAX, "0xreceipt-a", 2);
    deposit_into(&mut h, "d2", "0xreceipt-a", "0xreceipt-b", 3);
    deposit_into(&mut h, "d3", "0xreceipt-b", "0xreceipt-c", 4);

    h.run(logical("s1", TxLogicalType::Send, vec![tout("s1-out", "0xreceipt-c", dec!(1), day(5))]))
        .unwrap();

    assert_eq!(h.lot("d3-in").current_amount, dec!(0));
    assert_eq!(h.lot("d2-in").current_amount, dec!(0));
    assert_eq!(h.lot("d1-in").current_amount, dec!(0));
    assert_eq!(h.lot("r1").current_amount, dec!(4));
    assert!(h.book.disposals().is_empty());
}

#[test]
fn test_receipt_referring_to_itself_is_not_unwound() {
    let mut h = Harness::new();

    // a vault that hands back the token it was given
    receive(&mut h, "r1", "0xloop", dec!(1), 1);
    deposit_into(&mut h, "d1", "0xloop", "0xloop", 2);
    assert_eq!(h.lot("d1-in").history[0].asset_tx_id, "0xloop");

    h.run(logical("s1", TxLogicalType::Send, vec![tout("s1-out", "0xloop", dec!(2), day(3))]))
        .unwrap();

    assert_eq!(h.book.lots().len(), 2);
    assert!(h.book.lots().iter().all(|l| l.current_amount.is_zero()));
    assert!(h.book.lots().iter().all(|l| !l.flags.contains(&FlagName::AutoReconciled)));
    assert!(h.book.disposals().is_empty());
}

#[test]
fn test_wrap_then_unwrap_changes_nothing_but_the_fee() {
    let mut h = Harness::new();
    h.price("avalanche-2", 1, dec!(1));
    h.price("avalanche-2", 2, dec!(3));
    h.price("avalanche-2", 3, dec!(4));

    receive(&mut h, "r1", AVAX, dec!(1), 1);
    h.run(logical(
        "w1",
        TxLogicalType::Wrap,
        vec![tout("w1-out", AVAX, dec!(1), day(2)), tin("w1-in", WAVAX, dec!(1), day(2))],
    ))
    .unwrap();
    h.run(logical(
        "u1",
        TxLogicalType::Unwrap,
        vec![
            tout("u1-out", WAVAX, dec!(1), day(3)),
            tin("u1-in", AVAX, dec!(1), day(3)),
            fee("u1-fee", AVAX, dec!(0.01), day(3)),
        ],
    ))
    .unwrap();

    assert!(h.book.disposals().is_empty());
    assert_eq!(h.book.lots().len(), 1);
    let lot = h.lot("r1");
    assert_eq!(lot.current_amount, dec!(0.99));
    assert_eq!((lot.price_usd, lot.basis_usd), (dec!(1), dec!(1)));
}

//! Cost-basis generation for one logical at a time

use rust_decimal::Decimal;
use tracing::{debug, error, warn};

use super::pricing::{PriceQuote, Pricer, SOURCE_AUTO_RECONCILED, SOURCE_LP_DERIVED};
use super::{LedgerPriceUpdate, LotBook, LotKey};
use crate::asset::AssetRegistry;
use crate::config::EngineConfig;
use crate::error::LogicalError;
use crate::price::PriceFeed;
use crate::types::{
    CostbasisDisposal, CostbasisIncome, CostbasisLot, FlagName, LotAlgorithm, TxLedger,
    TxLogical, TxLogicalType, CLOSE_TO_ZERO,
};

/// Symbol on disposals whose asset cannot be named
const UNKNOWN_SYMBOL: &str = "__UNKNOWN__";

/// Price source of receipt lots created at zero cost
const SOURCE_DEPOSIT_RECEIPT: &str = "deposit_receipt";

/// Receipt unwinds nested deeper than this are abandoned
const MAX_UNWIND_DEPTH: usize = 3;

/// Places kept when converting receipt amounts back to the underlying asset
const REDEMPTION_DP: u32 = 9;

pub struct CostbasisGenerator<'a> {
    registry: &'a AssetRegistry,
    prices: &'a dyn PriceFeed,
    config: &'a EngineConfig,
}

impl<'a> CostbasisGenerator<'a> {
    pub fn new(
        registry: &'a AssetRegistry,
        prices: &'a dyn PriceFeed,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            registry,
            prices,
            config,
        }
    }

    /// Apply one logical to the book. On error the book is left exactly as
    /// it was before the call.
    pub fn process(&self, book: &mut LotBook, logical: &TxLogical) -> Result<(), LogicalError> {
        if logical.tx_ledgers.is_empty() {
            return Ok(());
        }
        if logical.has_flag(FlagName::IgnoredFromCostbasis) {
            debug!(tx_logical_id = %logical.id, "Ignored from costbasis");
            return Ok(());
        }

        book.begin();
        let result = Run::new(self, logical, book.entity()).dispatch(book);
        match result {
            Ok(()) => book.commit(),
            Err(_) => book.rollback(),
        }
        result
    }
}

/// State for processing a single logical
struct Run<'g, 'l> {
    gen: &'g CostbasisGenerator<'g>,
    logical: &'l TxLogical,
    entity: String,
    kind: Option<TxLogicalType>,
    ins: Vec<&'l TxLedger>,
    outs: Vec<&'l TxLedger>,
    fee: Option<&'l TxLedger>,
    is_disposal: bool,
    is_ownership_change: bool,
    is_receipt: bool,
    hidden: bool,
    /// Fee value still to be added to a lot's basis
    fee_for_lot: Option<Decimal>,
    /// Fee value still to be taken off a disposal's proceeds
    fee_for_disposal: Option<Decimal>,
    /// What is left of the proceeds cap for this logical
    cap: Option<Decimal>,
    /// Assets of the receipt lots currently being unwound
    stack: Vec<String>,
}

impl<'g, 'l> Run<'g, 'l> {
    fn new(gen: &'g CostbasisGenerator<'g>, logical: &'l TxLogical, entity: &str) -> Self {
        let legs = logical.legs();
        let kind = logical.tx_logical_type;

        let is_disposal = matches!(
            kind,
            Some(TxLogicalType::Lp | TxLogicalType::Swap | TxLogicalType::Spend | TxLogicalType::Disposal)
        ) || (kind == Some(TxLogicalType::Trade)
            && legs.outs.first().is_some_and(|o| !o.is_fiat()));
        let is_ownership_change = is_disposal
            || matches!(
                kind,
                Some(
                    TxLogicalType::Send
                        | TxLogicalType::Receive
                        | TxLogicalType::Yield
                        | TxLogicalType::Income
                        | TxLogicalType::Airdrop
                        | TxLogicalType::Claim
                        | TxLogicalType::Gift
                        | TxLogicalType::Borrow
                )
            );
        let is_receipt = (kind == Some(TxLogicalType::Deposit) && !legs.ins.is_empty())
            || (kind == Some(TxLogicalType::Borrow) && legs.ins.len() > 1);

        let mut run = Self {
            gen,
            logical,
            entity: entity.to_string(),
            kind,
            ins: legs.ins,
            outs: legs.outs,
            fee: legs.fee,
            is_disposal,
            is_ownership_change,
            is_receipt,
            hidden: logical.has_flag(FlagName::HiddenFrom8949),
            fee_for_lot: None,
            fee_for_disposal: None,
            cap: None,
            stack: Vec::new(),
        };

        if let Some(fee) = run.fee {
            let value = fee.amount * run.pricer().price(fee).price;
            if !value.is_zero() {
                run.fee_for_lot = Some(value);
                run.fee_for_disposal = Some(value);
            }
        }
        run
    }

    fn pricer(&self) -> Pricer<'_> {
        Pricer::new(
            self.gen.registry,
            self.gen.prices,
            self.kind,
            &self.ins,
            &self.outs,
        )
    }

    fn lot_algorithm(&self) -> LotAlgorithm {
        self.gen.config.lot_algorithm
    }

    fn dispatch(&mut self, book: &mut LotBook) -> Result<(), LogicalError> {
        use TxLogicalType::*;

        match self.kind {
            Some(SelfTransfer) => {}
            Some(Trade) if self.outs.first().is_some_and(|o| o.is_fiat()) => {
                self.create_lots(book)
            }
            Some(Wrap | Unwrap) => {}
            Some(Deposit) => self.deposit(book)?,
            Some(Withdraw) => self.withdraw(book),
            Some(Borrow) => self.borrow(book)?,
            Some(Repay) => self.repay(book)?,
            Some(Gift) => self.gift(book),
            _ if self.is_disposal => self.dispose(book)?,
            Some(Yield | Airdrop | Income) => {
                for t in self.ins.clone() {
                    self.income(book, t);
                }
            }
            // gas paid for a contract interaction
            _ if self.ins.is_empty() && self.outs.is_empty() => {}
            Some(Receive) => self.create_lots(book),
            Some(Send) => {
                for t in self.outs.clone() {
                    self.drawdown(book, t, self.lot_algorithm(), self.is_disposal);
                }
            }
            Some(other) => return Err(LogicalError::UnsupportedType(other.to_string())),
            None => return Err(LogicalError::Untyped),
        }

        if let Some(fee) = self.fee {
            if !fee.is_fiat() && fee.amount > CLOSE_TO_ZERO {
                self.drawdown(book, fee, self.lot_algorithm(), false);
            }
        }
        Ok(())
    }

    fn unhandled(&self, kind: &'static str) -> LogicalError {
        LogicalError::UnhandledShape {
            kind,
            ins: self.ins.len(),
            outs: self.outs.len(),
        }
    }

    /// Canonical price id and symbol a lot for `t` is filed under
    fn lot_identity(&self, t: &TxLedger) -> (Option<String>, Option<String>) {
        match self.gen.registry.map_ledger(t, false) {
            Some(mapped) => (
                Some(mapped.asset_price_id),
                mapped.symbol.or_else(|| t.symbol.clone()),
            ),
            None => (t.asset_price_id.clone(), t.symbol.clone()),
        }
    }

    fn lot_key(&self, t: &TxLedger) -> LotKey {
        match self.lot_identity(t).0 {
            Some(id) => LotKey::PriceId(id),
            None => LotKey::Token {
                chain: t.chain.clone(),
                asset_tx_id: t.asset_tx_id.clone(),
            },
        }
    }

    fn zero_price_flags(quote: &PriceQuote) -> Vec<FlagName> {
        if quote.is_zero() {
            vec![FlagName::ZeroPrice]
        } else {
            Vec::new()
        }
    }

    fn create_lot(
        &mut self,
        book: &mut LotBook,
        t: &TxLedger,
        quote: &PriceQuote,
        receipt: bool,
        history: Vec<TxLedger>,
        flags: Vec<FlagName>,
    ) -> usize {
        let (asset_price_id, symbol) = self.lot_identity(t);
        let fee = self.fee_for_lot.take().unwrap_or_default();
        let lot = CostbasisLot {
            tx_ledger_id: t.id.clone(),
            entity: self.entity.clone(),
            address: t.address.clone(),
            chain: t.chain.clone(),
            asset_price_id,
            symbol,
            asset_tx_id: t.asset_tx_id.clone(),
            original_amount: t.amount,
            current_amount: t.amount,
            price_usd: quote.price,
            basis_usd: quote.price * t.amount + fee,
            timestamp: t.timestamp,
            history,
            receipt,
            price_source: quote.source.clone(),
            locked_for_year: None,
            flags,
        };
        debug!(
            tx_ledger_id = %lot.tx_ledger_id,
            amount = %lot.original_amount,
            asset = %t.label(),
            basis_usd = %lot.basis_usd,
            "Lot created"
        );
        book.insert_lot(lot)
    }

    /// Ledgers a receipt minted by `t` stands in for
    fn receipt_history(&self, t: &TxLedger) -> Vec<TxLedger> {
        if self.kind == Some(TxLogicalType::Borrow) {
            self.ins
                .iter()
                .filter(|l| l.id != t.id)
                .map(|l| (*l).clone())
                .collect()
        } else {
            self.outs.iter().map(|l| (*l).clone()).collect()
        }
    }

    fn create_lots(&mut self, book: &mut LotBook) {
        let lp_entry = self.pricer().is_lp_entry();
        for t in self.ins.clone() {
            if t.is_fiat() {
                continue;
            }
            let quote = self.pricer().price(t);
            if lp_entry && quote.source == SOURCE_LP_DERIVED {
                book.queue_price_update(LedgerPriceUpdate {
                    tx_ledger_id: t.id.clone(),
                    price_usd: quote.price,
                    price_source: quote.source.clone(),
                });
            }
            let history = if self.is_receipt {
                self.receipt_history(t)
            } else {
                Vec::new()
            };
            let flags = Self::zero_price_flags(&quote);
            self.create_lot(book, t, &quote, self.is_receipt, history, flags);
        }
    }

    /// Zero-cost lot covering an amount no existing lot could supply
    fn reconcile(
        &mut self,
        book: &mut LotBook,
        t: &TxLedger,
        amount: Decimal,
        history: Vec<TxLedger>,
    ) -> usize {
        warn!(
            tx_logical_id = %self.logical.id,
            tx_ledger_id = %t.id,
            amount = %amount,
            asset = %t.label(),
            "Not enough lots; creating a reconciliation lot"
        );
        let (asset_price_id, symbol) = self.lot_identity(t);
        book.insert_lot(CostbasisLot {
            tx_ledger_id: t.id.clone(),
            entity: self.entity.clone(),
            address: t.address.clone(),
            chain: t.chain.clone(),
            asset_price_id,
            symbol,
            asset_tx_id: t.asset_tx_id.clone(),
            original_amount: amount,
            current_amount: Decimal::ZERO,
            price_usd: Decimal::ZERO,
            basis_usd: Decimal::ZERO,
            timestamp: t.timestamp,
            history,
            receipt: false,
            price_source: SOURCE_AUTO_RECONCILED.to_string(),
            locked_for_year: None,
            flags: vec![FlagName::AutoReconciled],
        })
    }

    /// Per-unit basis of a lot. Receipts are valued through the asset they
    /// were minted for, at the time they were minted.
    fn basis_price(&self, lot: &CostbasisLot) -> Decimal {
        let history = match lot.history.first() {
            Some(h) if lot.receipt => h,
            _ => return lot.price_usd,
        };
        let underlying = self
            .pricer()
            .feed_price(history)
            .filter(|p| !p.is_zero())
            .and_then(|p| (p * history.amount).checked_div(lot.original_amount));
        match underlying {
            Some(price) => price,
            None => {
                error!(
                    tx_logical_id = %self.logical.id,
                    tx_ledger_id = %history.id,
                    "No price for the asset behind a receipt; using the lot price"
                );
                lot.price_usd
            }
        }
    }

    /// Proceeds of one disposal after the fee and the per-logical cap
    fn disposal_total(&mut self, t: &TxLedger, gross: Decimal) -> Decimal {
        let mut total = gross;
        if !t.isfee {
            if let Some(fee) = self.fee_for_disposal.take() {
                total -= fee;
            }
        }
        if let Some(cap) = self.cap {
            if total > cap {
                error!(
                    tx_logical_id = %self.logical.id,
                    tx_ledger_id = %t.id,
                    total_usd = %total,
                    max_disposal_usd = %cap,
                    "Disposal exceeds the value received; clamping"
                );
                total = cap;
            }
            self.cap = Some(cap - total);
        }
        total
    }

    /// Price id and symbol a disposal of `t` is reported under
    fn disposal_asset(&self, t: &TxLedger, from_receipt: bool) -> (Option<String>, String) {
        if !from_receipt {
            if let Some(mapped) = self.gen.registry.map_ledger(t, false) {
                let symbol = mapped
                    .symbol
                    .or_else(|| t.symbol.clone())
                    .unwrap_or_else(|| UNKNOWN_SYMBOL.to_string());
                return (Some(mapped.asset_price_id), symbol);
            }
        }
        let asset_price_id = t
            .symbol
            .as_deref()
            .and_then(|s| self.gen.registry.price_id_for_symbol(s))
            .map(str::to_string)
            .or_else(|| t.asset_price_id.clone());
        let symbol = t.symbol.clone().unwrap_or_else(|| UNKNOWN_SYMBOL.to_string());
        (asset_price_id, symbol)
    }

    #[allow(clippy::too_many_arguments)]
    fn record_disposal(
        &mut self,
        book: &mut LotBook,
        t: &TxLedger,
        basis: (&str, i64),
        from_receipt: bool,
        amount: Decimal,
        basis_usd: Decimal,
        sale: &PriceQuote,
    ) {
        let (basis_tx_ledger_id, basis_timestamp) = basis;
        let total_usd = self.disposal_total(t, amount * sale.price);
        let (asset_price_id, symbol) = self.disposal_asset(t, from_receipt);
        let flags = if self.hidden {
            vec![FlagName::HiddenFrom8949]
        } else {
            Vec::new()
        };
        debug!(
            tx_ledger_id = %t.id,
            basis_tx_ledger_id = %basis_tx_ledger_id,
            amount = %amount,
            symbol = %symbol,
            basis_usd = %basis_usd,
            total_usd = %total_usd,
            "Disposal"
        );
        book.push_disposal(CostbasisDisposal {
            id: None,
            entity: self.entity.clone(),
            address: t.address.clone(),
            asset_price_id,
            symbol,
            amount,
            timestamp: t.timestamp,
            duration_held: t.timestamp - basis_timestamp,
            basis_timestamp,
            basis_tx_ledger_id: basis_tx_ledger_id.to_string(),
            basis_usd,
            total_usd,
            tx_ledger_id: t.id.clone(),
            price_source: sale.source.clone(),
            flags,
        });
    }

    /// Draw the asset behind a receipt back out of its own lots
    fn unwind(&mut self, book: &mut LotBook, lot: &CostbasisLot, history: &TxLedger, take: Decimal) {
        let asset = lot.asset_tx_id.to_lowercase();
        let underlying = history.asset_tx_id.to_lowercase();
        if self.stack.len() >= MAX_UNWIND_DEPTH {
            error!(
                tx_logical_id = %self.logical.id,
                tx_ledger_id = %lot.tx_ledger_id,
                depth = self.stack.len(),
                "Receipt unwind too deep; skipping"
            );
            return;
        }
        if underlying == asset || self.stack.contains(&underlying) {
            error!(
                tx_logical_id = %self.logical.id,
                tx_ledger_id = %lot.tx_ledger_id,
                asset = %underlying,
                "Receipt history refers back to itself; skipping unwind"
            );
            return;
        }
        let Some(share) = take.checked_div(lot.original_amount) else {
            return;
        };

        let mut redeemed = history.clone();
        redeemed.amount = share * history.amount;
        self.stack.push(asset);
        let algorithm = self.gen.config.unwind_algorithm;
        self.drawdown(book, &redeemed, algorithm, false);
        self.stack.pop();
    }

    /// Subtract `t.amount` from matching lots, writing disposals when
    /// `is_disposal`, and cover any shortfall with a reconciliation lot
    fn drawdown(&mut self, book: &mut LotBook, t: &TxLedger, algorithm: LotAlgorithm, is_disposal: bool) {
        let candidates = book.matching(&self.lot_key(t), t.timestamp, algorithm);
        let sale = if is_disposal && self.is_ownership_change {
            Some(self.pricer().price(t))
        } else {
            None
        };

        let mut left = t.amount;
        for idx in candidates {
            if left <= CLOSE_TO_ZERO {
                break;
            }
            let lot = book.lot_at(idx).clone();
            let take = left.min(lot.current_amount);
            if take <= Decimal::ZERO {
                continue;
            }

            if self.is_ownership_change {
                let basis_price = self.basis_price(&lot);
                if lot.receipt {
                    if let Some(history) = lot.history.first() {
                        self.unwind(book, &lot, history, take);
                    }
                }
                if let Some(sale) = &sale {
                    self.record_disposal(
                        book,
                        t,
                        (lot.tx_ledger_id.as_str(), lot.timestamp),
                        lot.receipt,
                        take,
                        take * basis_price,
                        sale,
                    );
                }
            }

            book.draw(idx, take);
            left -= take;
        }

        if left > CLOSE_TO_ZERO {
            self.reconcile(book, t, left, Vec::new());
            if let Some(sale) = &sale {
                self.record_disposal(
                    book,
                    t,
                    (t.id.as_str(), t.timestamp),
                    false,
                    left,
                    Decimal::ZERO,
                    sale,
                );
            }
        }
    }

    /// Income on an incoming leg, plus a lot when something was received
    fn income(&mut self, book: &mut LotBook, t: &TxLedger) {
        let quote = self.pricer().price(t);
        let symbol = self
            .lot_identity(t)
            .1
            .unwrap_or_else(|| UNKNOWN_SYMBOL.to_string());
        let net_usd = t.amount * quote.price;
        debug!(tx_ledger_id = %t.id, symbol = %symbol, net_usd = %net_usd, "Income");
        book.push_income(CostbasisIncome {
            id: None,
            entity: self.entity.clone(),
            address: t.address.clone(),
            net_usd,
            symbol,
            timestamp: t.timestamp,
            tx_ledger_id: t.id.clone(),
            price: quote.price,
            amount: t.amount,
        });
        if t.amount > Decimal::ZERO {
            let flags = Self::zero_price_flags(&quote);
            self.create_lot(book, t, &quote, false, Vec::new(), flags);
        }
    }

    /// Maximum proceeds of a disposal: what came in, if all of it is priced
    fn max_disposal(&self) -> Option<Decimal> {
        if self.ins.is_empty() {
            return None;
        }
        let pricer = self.pricer();
        self.ins.iter().try_fold(Decimal::ZERO, |sum, t| {
            let quote = pricer.price(t);
            (!quote.is_zero()).then(|| sum + quote.price * t.amount)
        })
    }

    fn dispose(&mut self, book: &mut LotBook) -> Result<(), LogicalError> {
        if self.kind == Some(TxLogicalType::Swap) && self.outs.len() != 1 {
            return Err(self.unhandled("swap"));
        }
        self.cap = self.max_disposal();
        for t in self.outs.clone() {
            self.drawdown(book, t, self.lot_algorithm(), true);
        }
        self.create_lots(book);
        Ok(())
    }

    fn gift(&mut self, book: &mut LotBook) {
        for t in self.outs.clone() {
            self.drawdown(book, t, self.lot_algorithm(), self.is_disposal);
        }
        match self.ins.len() {
            0 => {}
            1 => {
                self.is_receipt = true;
                self.create_lots(book);
            }
            n => warn!(
                tx_logical_id = %self.logical.id,
                ins = n,
                "Gift with more than one incoming leg"
            ),
        }
    }

    fn deposit(&mut self, book: &mut LotBook) -> Result<(), LogicalError> {
        match (self.outs.len(), self.ins.len()) {
            (1, 1) | (0, 1) => self.create_lots(book),
            // nothing minted for the deposit
            (1, 0) => {}
            (1, 2) => {
                let deposit = self.outs[0];
                let mut actual = deposit.amount;
                let mut wrapped = Vec::new();
                let mut receipts = Vec::new();
                for &r in &self.ins {
                    if r.asset_tx_id.eq_ignore_ascii_case(&deposit.asset_tx_id) {
                        // change handed straight back
                        actual -= r.amount;
                    } else if self.gen.registry.is_wrapped(&r.chain, &r.asset_tx_id).is_some() {
                        wrapped.push(r);
                        actual -= r.amount;
                    } else {
                        receipts.push(r);
                    }
                }
                let receipt = match receipts.as_slice() {
                    [] => return Err(LogicalError::MissingDepositReceipt),
                    [r] => *r,
                    _ => return Err(LogicalError::MultipleDepositReceipts),
                };

                let zero = PriceQuote::new(Decimal::ZERO, SOURCE_DEPOSIT_RECEIPT);
                for w in wrapped {
                    self.create_lot(book, w, &zero, true, vec![deposit.clone()], Vec::new());
                }
                let mut history = deposit.clone();
                history.amount = actual;
                self.create_lot(book, receipt, &zero, true, vec![history], Vec::new());
            }
            _ => return Err(self.unhandled("deposit")),
        }
        Ok(())
    }

    fn withdraw(&mut self, book: &mut LotBook) {
        // no receipt handed back, or nothing received
        let (Some(&t), Some(&received)) = (self.outs.first(), self.ins.first()) else {
            return;
        };

        let underlying = self.lot_key(received);
        let mut remaining: Decimal = self
            .ins
            .iter()
            .filter(|l| self.lot_key(l) == underlying)
            .map(|l| l.amount)
            .sum();
        let mut receipt_left = t.amount;

        for idx in book.matching(&self.lot_key(t), t.timestamp, self.lot_algorithm()) {
            if receipt_left <= CLOSE_TO_ZERO {
                break;
            }
            let lot = book.lot_at(idx).clone();
            let take = receipt_left.min(lot.current_amount);
            let Some(history) = lot.history.first() else {
                warn!(
                    tx_logical_id = %self.logical.id,
                    tx_ledger_id = %lot.tx_ledger_id,
                    "Withdrawal against a lot without history; no income computed"
                );
                book.draw(idx, take);
                return;
            };
            remaining -= redeemed_amount(take, lot.original_amount, history.amount);
            book.draw(idx, take);
            receipt_left -= take;
        }

        let mut history = received.clone();
        history.amount = remaining;
        if receipt_left > CLOSE_TO_ZERO {
            self.reconcile(book, t, receipt_left, vec![history.clone()]);
        }
        if !remaining.is_zero() {
            self.income(book, &history);
        }
    }

    /// Which of two legs is the loan asset and which the loan receipt
    fn split_loan(&self, legs: &[&'l TxLedger]) -> Option<(&'l TxLedger, &'l TxLedger)> {
        let &[a, b] = legs else {
            return None;
        };
        match (a.asset_price_id.is_some(), b.asset_price_id.is_some()) {
            (true, false) => return Some((a, b)),
            (false, true) => return Some((b, a)),
            _ => {}
        }
        let pricer = self.pricer();
        let priced = |t: &TxLedger| pricer.feed_price(t).is_some_and(|p| !p.is_zero());
        match (priced(a), priced(b)) {
            (true, false) => Some((a, b)),
            (false, true) => Some((b, a)),
            _ => None,
        }
    }

    fn borrow(&mut self, book: &mut LotBook) -> Result<(), LogicalError> {
        match self.ins.len() {
            1 => {
                self.is_receipt = false;
                self.create_lots(book);
                return Ok(());
            }
            2 => {}
            _ => return Err(self.unhandled("borrow")),
        }
        let ins = self.ins.clone();
        let (asset, receipt) = self.split_loan(&ins).ok_or(LogicalError::AmbiguousLoan)?;

        let quote = self.pricer().price(asset);
        let flags = Self::zero_price_flags(&quote);
        self.create_lot(book, asset, &quote, false, vec![receipt.clone()], flags.clone());
        self.create_lot(book, receipt, &quote, true, vec![asset.clone()], flags);
        Ok(())
    }

    fn repay(&mut self, book: &mut LotBook) -> Result<(), LogicalError> {
        if self.outs.len() > 2 {
            return Err(self.unhandled("repay"));
        }

        let mut asset = None;
        let mut receipt = None;
        for &o in &self.outs {
            if o.asset_price_id.is_some() {
                asset = Some(o);
            } else {
                receipt = Some(o);
            }
        }
        if asset.is_none() {
            for &o in &self.outs {
                let found = book.matching(&self.lot_key(o), o.timestamp, self.lot_algorithm());
                if let Some(&idx) = found.first() {
                    let lot = book.lot_at(idx);
                    if lot.receipt && !lot.history.is_empty() {
                        receipt = Some(o);
                    } else {
                        asset = Some(o);
                    }
                }
            }
        }
        let (Some(asset), Some(receipt)) = (asset, receipt) else {
            return Err(LogicalError::AmbiguousLoan);
        };
        if asset.id == receipt.id
            || asset.amount <= CLOSE_TO_ZERO
            || receipt.amount <= CLOSE_TO_ZERO
        {
            return Err(LogicalError::AmbiguousLoan);
        }

        let ratio_repay = receipt.amount / asset.amount;
        let mut receipt_left = receipt.amount;
        let mut originally_borrowed = Decimal::ZERO;

        let receipt_lots = book.matching(&self.lot_key(receipt), receipt.timestamp, self.lot_algorithm());
        for idx in receipt_lots {
            if receipt_left <= CLOSE_TO_ZERO {
                break;
            }
            let lot = book.lot_at(idx).clone();
            let take = receipt_left.min(lot.current_amount);
            let share = take.checked_div(lot.original_amount).unwrap_or(Decimal::ONE);
            let ratio_borrowed = lot
                .history
                .first()
                .and_then(|h| lot.original_amount.checked_div(h.amount))
                .filter(|r| !r.is_zero())
                .unwrap_or(Decimal::ONE);
            originally_borrowed += (share * take / ratio_borrowed).round_dp(REDEMPTION_DP);

            let mut repaid = asset.clone();
            repaid.amount = (share * take / ratio_repay).round_dp(REDEMPTION_DP);
            let algorithm = self.gen.config.unwind_algorithm;
            self.drawdown(book, &repaid, algorithm, self.is_disposal);

            book.draw(idx, take);
            receipt_left -= take;
        }

        let balance = originally_borrowed - asset.amount;
        let mut history = asset.clone();
        history.amount = balance;
        if receipt_left > CLOSE_TO_ZERO {
            self.reconcile(book, receipt, receipt_left, vec![history.clone()]);
        }
        if !balance.is_zero() {
            self.income(book, &history);
        }
        Ok(())
    }
}

/// Underlying asset released by redeeming `take` of a receipt lot
fn redeemed_amount(take: Decimal, original: Decimal, underlying: Decimal) -> Decimal {
    let ratio = original.checked_div(underlying).filter(|r| !r.is_zero());
    let share = take.checked_div(original);
    match (ratio, share) {
        (Some(ratio), Some(share)) => (share * take / ratio).round_dp(REDEMPTION_DP),
        _ => take,
    }
}

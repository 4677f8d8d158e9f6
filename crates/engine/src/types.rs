//! Domain types for ledgers, logicals and cost-basis records

use std::fmt;
use std::str::FromStr;

use persistence::repository::{
    DisposalRecord, IncomeRecord, LotRecord, TxLedgerRecord, TxLogicalRecord,
};
use persistence::{decimal_to_text, text_to_decimal};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult};

/// Anything at or below this is treated as zero
pub const CLOSE_TO_ZERO: Decimal = Decimal::from_parts(1, 0, 0, false, 16);

/// Fiat legs carry an asset id of the form `FIAT:USD`
pub const FIAT_PREFIX: &str = "FIAT:";

/// Direction of a ledger leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    In,
    Out,
    Approve,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
            Direction::Approve => "APPROVE",
        }
    }
}

impl FromStr for Direction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN" => Ok(Direction::In),
            "OUT" => Ok(Direction::Out),
            "APPROVE" => Ok(Direction::Approve),
            other => Err(EngineError::InvalidRecord(format!("direction {other}"))),
        }
    }
}

/// Classification of a logical transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxLogicalType {
    Approval,
    Borrow,
    Repay,
    Deposit,
    Withdraw,
    Disposal,
    Lp,
    Swap,
    Spend,
    Yield,
    Airdrop,
    Income,
    Claim,
    Gift,
    Trade,
    SelfTransfer,
    Receive,
    Send,
    Wrap,
    Unwrap,
}

impl TxLogicalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxLogicalType::Approval => "approval",
            TxLogicalType::Borrow => "borrow",
            TxLogicalType::Repay => "repay",
            TxLogicalType::Deposit => "deposit",
            TxLogicalType::Withdraw => "withdraw",
            TxLogicalType::Disposal => "disposal",
            TxLogicalType::Lp => "lp",
            TxLogicalType::Swap => "swap",
            TxLogicalType::Spend => "spend",
            TxLogicalType::Yield => "yield",
            TxLogicalType::Airdrop => "airdrop",
            TxLogicalType::Income => "income",
            TxLogicalType::Claim => "claim",
            TxLogicalType::Gift => "gift",
            TxLogicalType::Trade => "trade",
            TxLogicalType::SelfTransfer => "self_transfer",
            TxLogicalType::Receive => "receive",
            TxLogicalType::Send => "send",
            TxLogicalType::Wrap => "wrap",
            TxLogicalType::Unwrap => "unwrap",
        }
    }

    pub const ALL: [TxLogicalType; 20] = [
        TxLogicalType::Approval,
        TxLogicalType::Borrow,
        TxLogicalType::Repay,
        TxLogicalType::Deposit,
        TxLogicalType::Withdraw,
        TxLogicalType::Disposal,
        TxLogicalType::Lp,
        TxLogicalType::Swap,
        TxLogicalType::Spend,
        TxLogicalType::Yield,
        TxLogicalType::Airdrop,
        TxLogicalType::Income,
        TxLogicalType::Claim,
        TxLogicalType::Gift,
        TxLogicalType::Trade,
        TxLogicalType::SelfTransfer,
        TxLogicalType::Receive,
        TxLogicalType::Send,
        TxLogicalType::Wrap,
        TxLogicalType::Unwrap,
    ];
}

impl fmt::Display for TxLogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxLogicalType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TxLogicalType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EngineError::InvalidRecord(format!("tx_logical_type {s}")))
    }
}

/// Flag names the engine itself understands. Manual flags may use any name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagName {
    UnknownSend,
    ZeroPrice,
    AutoReconciled,
    IgnoredFromCostbasis,
    HiddenFrom8949,
}

impl FlagName {
    pub const ALL: [FlagName; 5] = [
        FlagName::UnknownSend,
        FlagName::ZeroPrice,
        FlagName::AutoReconciled,
        FlagName::IgnoredFromCostbasis,
        FlagName::HiddenFrom8949,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FlagName::UnknownSend => "unknown_send",
            FlagName::ZeroPrice => "zero_price",
            FlagName::AutoReconciled => "auto_reconciled",
            FlagName::IgnoredFromCostbasis => "ignored_from_costbasis",
            FlagName::HiddenFrom8949 => "hidden_from_8949",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            FlagName::UnknownSend => "This send may be a PAYMENT or GIFT",
            FlagName::ZeroPrice => "Couldn't establish a cost basis price for asset (set to $0)",
            FlagName::AutoReconciled => {
                "Ran out of costbasis lots for asset; created a zero cost reconciliation lot"
            }
            FlagName::IgnoredFromCostbasis => "Skipped during costbasis generation",
            FlagName::HiddenFrom8949 => "Excluded from Form 8949 output",
        }
    }
}

impl fmt::Display for FlagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who created a flag or an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Perfi,
    Manual,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Perfi => "perfi",
            Source::Manual => "manual",
        }
    }
}

/// `target_type` values of the flag table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagTarget {
    TxLogical,
    CostbasisLot,
    CostbasisDisposal,
}

impl FlagTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagTarget::TxLogical => "TxLogical",
            FlagTarget::CostbasisLot => "CostbasisLot",
            FlagTarget::CostbasisDisposal => "CostbasisDisposal",
        }
    }
}

/// Lot ordering used when drawing down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LotAlgorithm {
    Hifo,
    Fifo,
    Lifo,
    Low,
}

/// One value-movement leg of a chain or exchange transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxLedger {
    pub id: String,
    pub chain: String,
    pub address: String,
    pub hash: String,
    pub from_address: String,
    pub to_address: String,
    pub from_address_name: Option<String>,
    pub to_address_name: Option<String>,
    pub asset_tx_id: String,
    pub isfee: bool,
    pub amount: Decimal,
    pub timestamp: i64,
    pub direction: Direction,
    pub tx_ledger_type: Option<String>,
    pub asset_price_id: Option<String>,
    pub symbol: Option<String>,
    pub price_usd: Option<Decimal>,
    pub price_source: Option<String>,
}

impl TxLedger {
    /// Content hash over the fields that identify a leg
    #[allow(clippy::too_many_arguments)]
    pub fn compute_id(
        chain: &str,
        address: &str,
        hash: &str,
        from_address: &str,
        to_address: &str,
        asset_tx_id: &str,
        isfee: bool,
        amount: Decimal,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(chain.as_bytes());
        hasher.update(address.as_bytes());
        hasher.update(hash.as_bytes());
        hasher.update(from_address.as_bytes());
        hasher.update(to_address.as_bytes());
        hasher.update(asset_tx_id.as_bytes());
        hasher.update(if isfee { b"1" } else { b"0" });
        hasher.update(amount.normalize().to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn is_fiat(&self) -> bool {
        self.asset_tx_id.starts_with(FIAT_PREFIX)
    }

    pub fn is_fee(&self) -> bool {
        self.isfee && self.direction == Direction::Out
    }

    pub fn label(&self) -> &str {
        self.symbol.as_deref().unwrap_or(&self.asset_tx_id)
    }

    pub fn to_record(&self) -> TxLedgerRecord {
        TxLedgerRecord {
            id: self.id.clone(),
            chain: self.chain.clone(),
            address: self.address.clone(),
            hash: self.hash.clone(),
            from_address: self.from_address.clone(),
            to_address: self.to_address.clone(),
            from_address_name: self.from_address_name.clone(),
            to_address_name: self.to_address_name.clone(),
            asset_tx_id: self.asset_tx_id.clone(),
            isfee: i64::from(self.isfee),
            amount: decimal_to_text(self.amount),
            timestamp: self.timestamp,
            direction: self.direction.as_str().to_string(),
            tx_ledger_type: self.tx_ledger_type.clone(),
            asset_price_id: self.asset_price_id.clone(),
            symbol: self.symbol.clone(),
            price_usd: self.price_usd.map(decimal_to_text),
            price_source: self.price_source.clone(),
        }
    }
}

impl TryFrom<TxLedgerRecord> for TxLedger {
    type Error = EngineError;

    fn try_from(r: TxLedgerRecord) -> EngineResult<Self> {
        Ok(Self {
            amount: text_to_decimal(&r.amount)?,
            price_usd: r.price_usd.as_deref().map(text_to_decimal).transpose()?,
            direction: r.direction.parse()?,
            isfee: r.isfee != 0,
            id: r.id,
            chain: r.chain,
            address: r.address,
            hash: r.hash,
            from_address: r.from_address,
            to_address: r.to_address,
            from_address_name: r.from_address_name,
            to_address_name: r.to_address_name,
            asset_tx_id: r.asset_tx_id,
            timestamp: r.timestamp,
            tx_ledger_type: r.tx_ledger_type,
            asset_price_id: r.asset_price_id,
            symbol: r.symbol,
            price_source: r.price_source,
        })
    }
}

/// A group of ledgers that together form one user-level action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxLogical {
    pub id: String,
    pub count: i64,
    pub description: Option<String>,
    pub note: Option<String>,
    pub timestamp: i64,
    pub address: String,
    pub tx_logical_type: Option<TxLogicalType>,
    pub tx_ledgers: Vec<TxLedger>,
    /// Names of all flags on this logical, machine and manual
    pub flags: Vec<String>,
}

/// Ledgers of a logical split by role
#[derive(Debug, Default)]
pub struct Legs<'a> {
    pub ins: Vec<&'a TxLedger>,
    pub outs: Vec<&'a TxLedger>,
    pub others: Vec<&'a TxLedger>,
    pub fee: Option<&'a TxLedger>,
}

impl TxLogical {
    pub fn from_record(
        record: TxLogicalRecord,
        tx_ledgers: Vec<TxLedger>,
        flags: Vec<String>,
    ) -> Self {
        let tx_logical_type = record
            .tx_logical_type
            .as_deref()
            .and_then(|t| t.parse().ok());
        Self {
            id: record.id,
            count: record.count,
            description: record.description,
            note: record.note,
            timestamp: record.timestamp,
            address: record.address,
            tx_logical_type,
            tx_ledgers,
            flags,
        }
    }

    /// Split into ins, outs, others and the fee leg
    pub fn legs(&self) -> Legs<'_> {
        let mut legs = Legs::default();
        for t in &self.tx_ledgers {
            if t.is_fee() && legs.fee.is_none() {
                legs.fee = Some(t);
            } else if t.direction == Direction::In {
                legs.ins.push(t);
            } else if t.direction == Direction::Out && !t.isfee {
                legs.outs.push(t);
            } else {
                legs.others.push(t);
            }
        }
        legs
    }

    pub fn has_flag(&self, flag: FlagName) -> bool {
        self.flags.iter().any(|f| f == flag.as_str())
    }
}

/// An acquisition of an asset that later drawdowns consume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostbasisLot {
    pub tx_ledger_id: String,
    pub entity: String,
    pub address: String,
    pub chain: String,
    pub asset_price_id: Option<String>,
    pub symbol: Option<String>,
    pub asset_tx_id: String,
    pub original_amount: Decimal,
    pub current_amount: Decimal,
    pub price_usd: Decimal,
    pub basis_usd: Decimal,
    pub timestamp: i64,
    /// Ledgers this receipt stands in for
    pub history: Vec<TxLedger>,
    pub receipt: bool,
    pub price_source: String,
    pub locked_for_year: Option<i32>,
    #[serde(skip)]
    pub flags: Vec<FlagName>,
}

impl CostbasisLot {
    pub fn to_record(&self) -> EngineResult<LotRecord> {
        Ok(LotRecord {
            tx_ledger_id: self.tx_ledger_id.clone(),
            entity: self.entity.clone(),
            address: self.address.clone(),
            chain: self.chain.clone(),
            asset_price_id: self.asset_price_id.clone(),
            symbol: self.symbol.clone(),
            asset_tx_id: self.asset_tx_id.clone(),
            original_amount: decimal_to_text(self.original_amount),
            current_amount: decimal_to_text(self.current_amount),
            price_usd: decimal_to_text(self.price_usd),
            basis_usd: decimal_to_text(self.basis_usd),
            timestamp: self.timestamp,
            history: serde_json::to_string(&self.history)?,
            receipt: i64::from(self.receipt),
            price_source: self.price_source.clone(),
            locked_for_year: self.locked_for_year.map(i64::from),
        })
    }
}

impl TryFrom<LotRecord> for CostbasisLot {
    type Error = EngineError;

    fn try_from(r: LotRecord) -> EngineResult<Self> {
        Ok(Self {
            original_amount: text_to_decimal(&r.original_amount)?,
            current_amount: text_to_decimal(&r.current_amount)?,
            price_usd: text_to_decimal(&r.price_usd)?,
            basis_usd: text_to_decimal(&r.basis_usd)?,
            history: serde_json::from_str(&r.history)?,
            receipt: r.receipt != 0,
            locked_for_year: r.locked_for_year.and_then(|y| i32::try_from(y).ok()),
            tx_ledger_id: r.tx_ledger_id,
            entity: r.entity,
            address: r.address,
            chain: r.chain,
            asset_price_id: r.asset_price_id,
            symbol: r.symbol,
            asset_tx_id: r.asset_tx_id,
            timestamp: r.timestamp,
            price_source: r.price_source,
            flags: Vec::new(),
        })
    }
}

/// A taxable event drawn against one lot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostbasisDisposal {
    pub id: Option<i64>,
    pub entity: String,
    pub address: String,
    pub asset_price_id: Option<String>,
    pub symbol: String,
    pub amount: Decimal,
    pub timestamp: i64,
    pub duration_held: i64,
    pub basis_timestamp: i64,
    pub basis_tx_ledger_id: String,
    pub basis_usd: Decimal,
    pub total_usd: Decimal,
    pub tx_ledger_id: String,
    pub price_source: String,
    #[serde(skip)]
    pub flags: Vec<FlagName>,
}

impl CostbasisDisposal {
    pub fn to_record(&self) -> DisposalRecord {
        DisposalRecord {
            id: self.id,
            entity: self.entity.clone(),
            address: self.address.clone(),
            asset_price_id: self.asset_price_id.clone(),
            symbol: self.symbol.clone(),
            amount: decimal_to_text(self.amount),
            timestamp: self.timestamp,
            duration_held: self.duration_held,
            basis_timestamp: self.basis_timestamp,
            basis_tx_ledger_id: self.basis_tx_ledger_id.clone(),
            basis_usd: decimal_to_text(self.basis_usd),
            total_usd: decimal_to_text(self.total_usd),
            tx_ledger_id: self.tx_ledger_id.clone(),
            price_source: self.price_source.clone(),
        }
    }

    pub fn gain_usd(&self) -> Decimal {
        self.total_usd - self.basis_usd
    }
}

impl TryFrom<DisposalRecord> for CostbasisDisposal {
    type Error = EngineError;

    fn try_from(r: DisposalRecord) -> EngineResult<Self> {
        Ok(Self {
            amount: text_to_decimal(&r.amount)?,
            basis_usd: text_to_decimal(&r.basis_usd)?,
            total_usd: text_to_decimal(&r.total_usd)?,
            id: r.id,
            entity: r.entity,
            address: r.address,
            asset_price_id: r.asset_price_id,
            symbol: r.symbol,
            timestamp: r.timestamp,
            duration_held: r.duration_held,
            basis_timestamp: r.basis_timestamp,
            basis_tx_ledger_id: r.basis_tx_ledger_id,
            tx_ledger_id: r.tx_ledger_id,
            price_source: r.price_source,
            flags: Vec::new(),
        })
    }
}

/// Income recognized on receipt of an asset (or a loss on a repayment)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostbasisIncome {
    pub id: Option<i64>,
    pub entity: String,
    pub address: String,
    pub net_usd: Decimal,
    pub symbol: String,
    pub timestamp: i64,
    pub tx_ledger_id: String,
    pub price: Decimal,
    pub amount: Decimal,
}

impl CostbasisIncome {
    pub fn to_record(&self) -> IncomeRecord {
        IncomeRecord {
            id: self.id,
            entity: self.entity.clone(),
            address: self.address.clone(),
            net_usd: decimal_to_text(self.net_usd),
            symbol: self.symbol.clone(),
            timestamp: self.timestamp,
            tx_ledger_id: self.tx_ledger_id.clone(),
            price: decimal_to_text(self.price),
            amount: decimal_to_text(self.amount),
        }
    }
}

impl TryFrom<IncomeRecord> for CostbasisIncome {
    type Error = EngineError;

    fn try_from(r: IncomeRecord) -> EngineResult<Self> {
        Ok(Self {
            net_usd: text_to_decimal(&r.net_usd)?,
            price: text_to_decimal(&r.price)?,
            amount: text_to_decimal(&r.amount)?,
            id: r.id,
            entity: r.entity,
            address: r.address,
            symbol: r.symbol,
            timestamp: r.timestamp,
            tx_ledger_id: r.tx_ledger_id,
        })
    }
}

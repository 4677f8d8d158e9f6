//! Logical grouping and classification
//!
//! Ledgers sharing a hash are grouped under the logical of the earliest
//! one. Each logical is then typed from its raw action name, falling back
//! to the shape of its ins and outs.

use std::collections::{BTreeMap, HashSet};

use persistence::repository::{FlagRepository, TxLedgerRepository, TxLogicalRepository};
use persistence::SqlitePool;
use tracing::{debug, warn};

use crate::asset::AssetRegistry;
use crate::error::EngineResult;
use crate::types::{FlagName, FlagTarget, TxLedger, TxLogical, TxLogicalType};

/// Juicebox terminal; payments to it are gifts
const JUICEBOX: &str = "0xd569d3cce55b71a8a3f3c418c329a66e5f714431";

/// Raw action names that map straight onto a logical type
const ACTION_TYPES: &[(TxLogicalType, &[&str])] = &[
    (TxLogicalType::Borrow, &["borrow", "borrowETH"]),
    (TxLogicalType::Repay, &["repay", "loan_repay", "repayETH"]),
    (
        TxLogicalType::Deposit,
        &[
            "deposit",
            "depositBNB",
            "depositETH",
            "depositAll",
            "depositWithPermit",
            "stake",
            "depositERC20",
            "depositFor",
            "depositEtherFor",
            "depositERC20ForUser",
            "depositTokenByAddress",
            "depositCollateral",
            "depositERC20ToByChainId",
            "depositMultiple",
            "depositDai",
        ],
    ),
    (
        TxLogicalType::Withdraw,
        &[
            "redeem",
            "withdraw",
            "widthdraw",
            "withdrawNative",
            "withdrawAll",
            "withdrawAllBNB",
            "withdrawBNB",
            "withdrawAndHarvest",
            "withdrawCollateral",
            "withdrawFromSP",
            "withdrawLocked",
            "exit",
            "unstake",
        ],
    ),
    (TxLogicalType::Disposal, &["disposal"]),
    (
        TxLogicalType::Lp,
        &[
            "lp",
            "add_liquidity",
            "remove_liquidity_imbalance",
            "addLiquidity",
            "addLiquidityETH",
            "multicall",
            "ZapIn",
            "remove_liquidity",
            "remove_liquidity_one_coin",
            "removeLiquidity",
            "removeLiquidityOneToken",
            "removeLiquidityETHWithPermit",
            "DepositInEth",
        ],
    ),
    (
        TxLogicalType::Swap,
        &[
            "swap",
            "swapExactTokensForETH",
            "swapExactTokensForTokens",
            "swapExactETHForTokens",
            "swapTokensForExactTokens",
        ],
    ),
    (
        TxLogicalType::Yield,
        &["claimRewards", "claimed_reward", "getReward", "yield"],
    ),
    (TxLogicalType::Approval, &["approve", "approval"]),
];

/// Families matched by prefix once the exact names miss
const ACTION_PREFIXES: &[(&str, TxLogicalType)] = &[
    ("swap", TxLogicalType::Swap),
    ("borrow", TxLogicalType::Borrow),
    ("repay", TxLogicalType::Repay),
    ("deposit", TxLogicalType::Deposit),
    ("withdraw", TxLogicalType::Withdraw),
];

const EXCHANGE_TRADES: &[&str] = &[
    "coinbasepro.buy",
    "coinbasepro.sell",
    "coinbasepro.trade",
    "kraken.trade",
    "gemini.buy",
    "gemini.sell",
    "coinbase.buy",
    "coinbase.sell",
    "coinbase.convert",
];

/// Exchange action suffixes (after the `Exchange.` prefix)
const EXCHANGE_SELF_TRANSFERS: &[&str] = &[
    "deposit",
    "withdrawal",
    "send",
    "receive",
    "transfer",
    "credit",
    "debit",
];
const EXCHANGE_INCOME: &[&str] = &["rewards income", "coinbase earn", "reward"];
const EXCHANGE_AIRDROPS: &[&str] = &["airdrop"];

/// Result of typing one logical
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Classification {
    pub tx_logical_type: Option<TxLogicalType>,
    pub flags: Vec<FlagName>,
}

impl Classification {
    fn typed(t: TxLogicalType) -> Self {
        Self {
            tx_logical_type: Some(t),
            flags: Vec::new(),
        }
    }
}

/// `(ledger, from_logical, to_logical)` moves that put every ledger of a
/// hash under the earliest ledger's singleton. Input must be sorted by
/// timestamp with fees after legs.
pub fn group_by_hash(ledgers: &[TxLedger]) -> Vec<(String, String, String)> {
    let mut groups: BTreeMap<(&str, &str), &str> = BTreeMap::new();
    let mut moves = Vec::new();
    for t in ledgers {
        let key = (t.address.as_str(), t.hash.as_str());
        match groups.get(&key) {
            Some(head) => moves.push((t.id.clone(), t.id.clone(), head.to_string())),
            None => {
                groups.insert(key, t.id.as_str());
            }
        }
    }
    moves
}

fn action_type(name: &str) -> Option<TxLogicalType> {
    ACTION_TYPES
        .iter()
        .find(|(_, names)| names.contains(&name))
        .map(|(t, _)| *t)
        .or_else(|| {
            ACTION_PREFIXES
                .iter()
                .find(|(prefix, _)| name.starts_with(prefix))
                .map(|(_, t)| *t)
        })
}

fn exchange_type(name: &str) -> Option<TxLogicalType> {
    let lower = name.to_lowercase();
    if EXCHANGE_TRADES.contains(&lower.as_str()) {
        return Some(TxLogicalType::Trade);
    }
    let (_, action) = lower.split_once('.')?;
    if EXCHANGE_SELF_TRANSFERS.contains(&action) {
        Some(TxLogicalType::SelfTransfer)
    } else if EXCHANGE_INCOME.contains(&action) {
        Some(TxLogicalType::Income)
    } else if EXCHANGE_AIRDROPS.contains(&action) {
        Some(TxLogicalType::Airdrop)
    } else {
        None
    }
}

/// Types logicals against one entity's address set
pub struct Classifier<'a> {
    registry: &'a AssetRegistry,
    addresses: HashSet<String>,
}

impl<'a> Classifier<'a> {
    pub fn new<I, S>(registry: &'a AssetRegistry, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            registry,
            addresses: addresses
                .into_iter()
                .map(|a| a.as_ref().to_lowercase())
                .collect(),
        }
    }

    fn is_own(&self, address: &str) -> bool {
        self.addresses.contains(&address.to_lowercase())
    }

    pub fn classify(&self, logical: &TxLogical) -> Classification {
        if logical.tx_ledgers.is_empty() {
            return Classification::default();
        }

        let legs = logical.legs();
        let ledger_types: HashSet<Option<&str>> = logical
            .tx_ledgers
            .iter()
            .filter(|t| t.tx_ledger_type.as_deref() != Some("fee") && !t.is_fee())
            .map(|t| t.tx_ledger_type.as_deref())
            .collect();

        // fee only
        if ledger_types.is_empty() {
            return Classification::default();
        }

        let action = if ledger_types.len() > 1 {
            warn!(
                tx_logical_id = %logical.id,
                types = ?ledger_types,
                "Multiple ledger types in one logical, typing by shape"
            );
            None
        } else {
            ledger_types.into_iter().next().flatten()
        };

        if let Some(name) = action {
            if matches!(name, "approve" | "approval") && legs.ins.is_empty() && legs.outs.is_empty() {
                return Classification::typed(TxLogicalType::Approval);
            }
        }

        if legs.ins.len() == 1 && legs.outs.len() == 1 && legs.ins[0].amount == legs.outs[0].amount {
            let (tin, tout) = (legs.ins[0], legs.outs[0]);
            if self.registry.is_native(&tout.chain, &tout.asset_tx_id)
                && self.registry.is_wrapped(&tin.chain, &tin.asset_tx_id).is_some()
                && !self.registry.is_native(&tin.chain, &tin.asset_tx_id)
            {
                return Classification::typed(TxLogicalType::Wrap);
            }
            if self.registry.is_native(&tin.chain, &tin.asset_tx_id)
                && self.registry.is_wrapped(&tout.chain, &tout.asset_tx_id).is_some()
                && !self.registry.is_native(&tout.chain, &tout.asset_tx_id)
            {
                return Classification::typed(TxLogicalType::Unwrap);
            }
        }

        if let Some(name) = action {
            if let Some(t) = action_type(name) {
                return Classification::typed(t);
            }

            if name == "mint" {
                return match (legs.ins.len(), legs.outs.len()) {
                    (1, 1) => Classification::typed(TxLogicalType::Deposit),
                    (1, 2) => Classification::typed(TxLogicalType::Lp),
                    _ => Classification::default(),
                };
            }
        }

        if legs.outs.iter().any(|t| t.to_address.eq_ignore_ascii_case(JUICEBOX)) {
            return Classification::typed(TxLogicalType::Gift);
        }

        if let Some(name) = action {
            if name == "airdrop" {
                return Classification::typed(TxLogicalType::Airdrop);
            }
            if let Some(t) = exchange_type(name) {
                return Classification::typed(t);
            }
        }

        self.classify_by_shape(logical)
    }

    fn classify_by_shape(&self, logical: &TxLogical) -> Classification {
        let legs = logical.legs();

        if !legs.ins.is_empty() && legs.outs.is_empty() {
            if legs.ins.iter().all(|t| self.is_own(&t.from_address)) {
                return Classification::typed(TxLogicalType::SelfTransfer);
            }
            return Classification::typed(TxLogicalType::Receive);
        }

        if !legs.outs.is_empty() && legs.ins.is_empty() {
            if legs.outs.iter().all(|t| self.is_own(&t.to_address)) {
                return Classification::typed(TxLogicalType::SelfTransfer);
            }
            let mut c = Classification::typed(TxLogicalType::Send);
            if !self.is_own(&legs.outs[0].to_address) {
                c.flags.push(FlagName::UnknownSend);
            }
            return c;
        }

        if legs.ins.is_empty() && legs.outs.is_empty() && legs.others.is_empty() {
            return Classification::default();
        }

        match (legs.ins.len(), legs.outs.len()) {
            (1, 1) => {
                if legs.ins[0].is_fiat() || legs.outs[0].is_fiat() {
                    Classification::typed(TxLogicalType::Trade)
                } else {
                    Classification::typed(TxLogicalType::Swap)
                }
            }
            (1, n) if n > 1 => Classification::typed(TxLogicalType::Lp),
            (n, 1) if n >= 1 => Classification::typed(TxLogicalType::Lp),
            (ins, outs) => {
                warn!(tx_logical_id = %logical.id, ins, outs, "Unknown logical shape");
                Classification::default()
            }
        }
    }
}

/// Load an entity's logicals with their ledgers and flags, in processing order
pub async fn load_logicals(
    pool: &SqlitePool,
    entity: &str,
    start: Option<i64>,
    end: Option<i64>,
) -> EngineResult<Vec<TxLogical>> {
    let logical_repo = TxLogicalRepository::new(pool);
    let ledger_repo = TxLedgerRepository::new(pool);
    let flag_repo = FlagRepository::new(pool);

    let records = logical_repo.list_for_entity(entity, start, end).await?;
    let mut logicals = Vec::with_capacity(records.len());
    for record in records {
        let ledgers = ledger_repo
            .list_for_logical(&record.id)
            .await?
            .into_iter()
            .map(TxLedger::try_from)
            .collect::<EngineResult<Vec<_>>>()?;
        let flags = flag_repo
            .list_for_target(FlagTarget::TxLogical.as_str(), &record.id)
            .await?
            .into_iter()
            .map(|f| f.name)
            .collect();
        if let Some(t) = &record.tx_logical_type {
            if t.parse::<TxLogicalType>().is_err() {
                warn!(tx_logical_id = %record.id, tx_logical_type = %t, "Unknown logical type");
            }
        }
        logicals.push(TxLogical::from_record(record, ledgers, flags));
    }
    debug!(entity = %entity, logicals = logicals.len(), "Loaded logicals");
    Ok(logicals)
}

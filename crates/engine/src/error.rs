//! Engine error types

use persistence::DbError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("duplicate ledger id {id} for hash {hash}")]
    DuplicateLedgerId { id: String, hash: String },

    #[error("unknown event action: {0}")]
    UnknownEventAction(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("costbasis lot {tx_ledger_id} is locked for {year}")]
    Locked { tx_ledger_id: String, year: i32 },

    #[error("costbasis generation stopped at tx_logical {last_tx_logical_id}: {source}")]
    Interrupted {
        last_tx_logical_id: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Problems that abandon a single logical; generation moves on to the next one
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LogicalError {
    #[error("don't know how to handle a {kind} with {ins} ins and {outs} outs")]
    UnhandledShape {
        kind: &'static str,
        ins: usize,
        outs: usize,
    },

    #[error("cannot tell the loan asset from the loan receipt")]
    AmbiguousLoan,

    #[error("no deposit receipt left after counting change")]
    MissingDepositReceipt,

    #[error("multiple deposit receipts left after counting change")]
    MultipleDepositReceipts,

    #[error("no type assigned to a logical with ledgers")]
    Untyped,

    #[error("unsupported logical type {0}")]
    UnsupportedType(String),
}

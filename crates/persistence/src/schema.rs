//! Database schema definitions

/// SQL to create all tables
/// NOTE: All prices/amounts stored as TEXT to preserve rust_decimal::Decimal precision
pub const CREATE_TABLES: &str = r#"
-- Entities own addresses
CREATE TABLE IF NOT EXISTS entity (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    note TEXT
);

CREATE TABLE IF NOT EXISTS address (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    label TEXT NOT NULL,
    chain TEXT NOT NULL,
    address TEXT NOT NULL,
    type TEXT NOT NULL DEFAULT 'account',
    source TEXT NOT NULL DEFAULT 'manual',
    entity_id INTEGER NOT NULL REFERENCES entity(id),
    ord INTEGER NOT NULL DEFAULT 1,
    UNIQUE(chain, address)
);

CREATE TABLE IF NOT EXISTS setting (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Raw ingester output, payload is zlib-compressed JSON
CREATE TABLE IF NOT EXISTS tx_chain (
    chain TEXT NOT NULL,
    address TEXT NOT NULL,
    hash TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    raw_data BLOB NOT NULL,
    PRIMARY KEY (chain, address, hash)
);

CREATE TABLE IF NOT EXISTS tx_ledger (
    id TEXT PRIMARY KEY,
    chain TEXT NOT NULL,
    address TEXT NOT NULL,
    hash TEXT NOT NULL,
    from_address TEXT NOT NULL,
    to_address TEXT NOT NULL,
    from_address_name TEXT,
    to_address_name TEXT,
    asset_tx_id TEXT NOT NULL,
    isfee INTEGER NOT NULL DEFAULT 0,
    amount TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    direction TEXT NOT NULL,
    tx_ledger_type TEXT,
    asset_price_id TEXT,
    symbol TEXT,
    price_usd TEXT,
    price_source TEXT
);

CREATE TABLE IF NOT EXISTS tx_logical (
    id TEXT PRIMARY KEY,
    count INTEGER NOT NULL DEFAULT 0,
    description TEXT,
    note TEXT,
    timestamp INTEGER NOT NULL,
    address TEXT NOT NULL,
    tx_logical_type TEXT
);

CREATE TABLE IF NOT EXISTS tx_rel_ledger_logical (
    tx_ledger_id TEXT NOT NULL,
    tx_logical_id TEXT NOT NULL,
    ord INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (tx_ledger_id, tx_logical_id)
);

-- Price identifiers (coingecko style ids)
CREATE TABLE IF NOT EXISTS asset_price (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL DEFAULT 'manual',
    symbol TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    market_cap TEXT
);

-- Chain-scoped token identifiers
CREATE TABLE IF NOT EXISTS asset_tx (
    chain TEXT NOT NULL,
    id TEXT NOT NULL,
    asset_price_id TEXT,
    symbol TEXT,
    name TEXT,
    PRIMARY KEY (chain, id)
);

CREATE TABLE IF NOT EXISTS costbasis_lot (
    tx_ledger_id TEXT PRIMARY KEY,
    entity TEXT NOT NULL,
    address TEXT NOT NULL,
    chain TEXT NOT NULL,
    asset_price_id TEXT,
    symbol TEXT,
    asset_tx_id TEXT NOT NULL,
    original_amount TEXT NOT NULL,
    current_amount TEXT NOT NULL,
    price_usd TEXT NOT NULL,
    basis_usd TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    history TEXT NOT NULL DEFAULT '[]',
    receipt INTEGER NOT NULL DEFAULT 0,
    price_source TEXT NOT NULL DEFAULT '',
    locked_for_year INTEGER
);

CREATE TABLE IF NOT EXISTS costbasis_disposal (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity TEXT NOT NULL,
    address TEXT NOT NULL,
    asset_price_id TEXT,
    symbol TEXT NOT NULL,
    amount TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    duration_held INTEGER NOT NULL,
    basis_timestamp INTEGER NOT NULL,
    basis_tx_ledger_id TEXT NOT NULL,
    basis_usd TEXT NOT NULL,
    total_usd TEXT NOT NULL,
    tx_ledger_id TEXT NOT NULL,
    price_source TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS costbasis_income (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity TEXT NOT NULL,
    address TEXT NOT NULL,
    net_usd TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    tx_ledger_id TEXT NOT NULL,
    price TEXT NOT NULL,
    amount TEXT NOT NULL
);

-- Append-only user and machine edits, replayed by (timestamp, rowid)
CREATE TABLE IF NOT EXISTS event (
    id TEXT PRIMARY KEY,
    source TEXT NOT NULL,
    action TEXT NOT NULL,
    data TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS flag (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target_type TEXT NOT NULL,
    target_id TEXT NOT NULL,
    source TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    created_at INTEGER DEFAULT (strftime('%s', 'now')),
    UNIQUE(target_type, target_id, name)
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_address_entity ON address(entity_id);
CREATE INDEX IF NOT EXISTS idx_tx_ledger_address ON tx_ledger(chain, address);
CREATE INDEX IF NOT EXISTS idx_tx_ledger_hash ON tx_ledger(hash);
CREATE INDEX IF NOT EXISTS idx_tx_logical_address ON tx_logical(address, timestamp);
CREATE INDEX IF NOT EXISTS idx_rel_logical ON tx_rel_ledger_logical(tx_logical_id);
CREATE INDEX IF NOT EXISTS idx_asset_price_symbol ON asset_price(symbol);
CREATE INDEX IF NOT EXISTS idx_lot_entity ON costbasis_lot(entity, timestamp);
CREATE INDEX IF NOT EXISTS idx_disposal_entity ON costbasis_disposal(entity, timestamp);
CREATE INDEX IF NOT EXISTS idx_income_entity ON costbasis_income(entity, timestamp);
CREATE INDEX IF NOT EXISTS idx_event_order ON event(timestamp);
CREATE INDEX IF NOT EXISTS idx_flag_target ON flag(target_type, target_id)
"#;

/// Column additions for databases created before these fields existed
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE tx_ledger ADD COLUMN price_source TEXT",
    "ALTER TABLE costbasis_lot ADD COLUMN price_source TEXT NOT NULL DEFAULT ''",
    "ALTER TABLE costbasis_lot ADD COLUMN locked_for_year INTEGER",
    "ALTER TABLE costbasis_disposal ADD COLUMN price_source TEXT NOT NULL DEFAULT ''",
];

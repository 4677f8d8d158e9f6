//! Raw ingester payloads
//!
//! `tx_chain.raw_data` holds zlib-compressed JSON. On-chain records follow
//! the debank history shape; exchange imports (chain `import.<name>`) carry
//! ready-made send and receive legs.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use persistence::repository::TxChainRecord;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Chain prefix of exchange imports
pub const IMPORT_CHAIN_PREFIX: &str = "import.";

/// Decompressed payloads larger than this are rejected
const MAX_PAYLOAD_BYTES: u64 = 64 * 1024 * 1024;

pub fn compress(bytes: &[u8]) -> EngineResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

pub fn decompress(bytes: &[u8]) -> EngineResult<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(bytes)
        .take(MAX_PAYLOAD_BYTES + 1)
        .read_to_end(&mut out)?;
    if out.len() as u64 > MAX_PAYLOAD_BYTES {
        return Err(EngineError::InvalidRecord(format!(
            "raw payload exceeds {MAX_PAYLOAD_BYTES} bytes"
        )));
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    #[serde(default)]
    pub chain: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// One send or receive of an on-chain transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainItem {
    pub amount: Decimal,
    #[serde(default)]
    pub from_addr: Option<String>,
    #[serde(default)]
    pub to_addr: Option<String>,
    #[serde(default)]
    pub token_id: Option<String>,
    #[serde(rename = "_token", default)]
    pub token: Option<Token>,
}

impl ChainItem {
    /// Token id from the embedded token, falling back to the bare id
    pub fn asset_tx_id(&self) -> Option<&str> {
        self.token
            .as_ref()
            .map(|t| t.id.as_str())
            .or(self.token_id.as_deref())
    }

    pub fn symbol(&self) -> Option<&str> {
        self.token.as_ref().and_then(|t| t.symbol.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTxInfo {
    pub from_addr: String,
    #[serde(default)]
    pub to_addr: String,
    #[serde(default)]
    pub eth_gas_fee: Option<Decimal>,
    #[serde(default)]
    pub usd_gas_fee: Option<Decimal>,
    #[serde(default)]
    pub name: Option<String>,
    /// Gas token for chains that charge per transaction (boba)
    #[serde(default)]
    pub fee_token_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenApprove {
    pub token_id: String,
    pub value: Decimal,
    #[serde(default)]
    pub spender: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainPayload {
    #[serde(default)]
    pub cate_id: Option<String>,
    #[serde(default)]
    pub tx: Option<ChainTxInfo>,
    #[serde(default)]
    pub sends: Vec<ChainItem>,
    #[serde(default)]
    pub receives: Vec<ChainItem>,
    #[serde(default)]
    pub token_approve: Option<TokenApprove>,
}

/// One leg of an exchange import, already directional
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeLeg {
    pub asset_tx_id: String,
    pub amount: Decimal,
    pub tx_ledger_type: String,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub from_address: String,
    #[serde(default)]
    pub to_address: String,
    #[serde(default)]
    pub isfee: i64,
    #[serde(default, alias = "price")]
    pub price_usd: Option<Decimal>,
    #[serde(default)]
    pub price_source: Option<String>,
    #[serde(default, alias = "cost_basis_including_fees_usd")]
    pub costbasis_including_fees_usd: Option<Decimal>,
    #[serde(default)]
    pub proceeds_after_fees_usd: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePayload {
    #[serde(default)]
    pub sends: Vec<ExchangeLeg>,
    #[serde(default)]
    pub receives: Vec<ExchangeLeg>,
}

/// Decoded raw record
#[derive(Debug, Clone, PartialEq)]
pub enum RawIngestRecord {
    Chain {
        chain: String,
        address: String,
        hash: String,
        timestamp: i64,
        payload: ChainPayload,
    },
    Exchange {
        chain: String,
        address: String,
        hash: String,
        timestamp: i64,
        payload: ExchangePayload,
    },
}

impl RawIngestRecord {
    pub fn decode(record: &TxChainRecord) -> EngineResult<Self> {
        let json = decompress(&record.raw_data)?;
        let chain = record.chain.clone();
        let address = record.address.clone();
        let hash = record.hash.clone();
        let timestamp = record.timestamp;
        if record.chain.starts_with(IMPORT_CHAIN_PREFIX) {
            Ok(Self::Exchange {
                payload: serde_json::from_slice(&json)?,
                chain,
                address,
                hash,
                timestamp,
            })
        } else {
            Ok(Self::Chain {
                payload: serde_json::from_slice(&json)?,
                chain,
                address,
                hash,
                timestamp,
            })
        }
    }

    /// Build a storable record from an uncompressed JSON payload
    pub fn encode(
        chain: &str,
        address: &str,
        hash: &str,
        timestamp: i64,
        payload: &serde_json::Value,
    ) -> EngineResult<TxChainRecord> {
        Ok(TxChainRecord {
            chain: chain.to_string(),
            address: address.to_string(),
            hash: hash.to_string(),
            timestamp,
            raw_data: compress(&serde_json::to_vec(payload)?)?,
        })
    }

    pub fn hash(&self) -> &str {
        match self {
            Self::Chain { hash, .. } | Self::Exchange { hash, .. } => hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_compression_round_trip() {
        let data = br#"{"sends":[],"receives":[]}"#;
        let packed = compress(data).unwrap();
        assert_eq!(decompress(&packed).unwrap(), data.to_vec());
        assert!(decompress(b"not zlib").is_err());
    }

    #[test]
    fn test_decode_chain_record() {
        let payload = json!({
            "cate_id": "swap",
            "tx": {"from_addr": "0xme", "to_addr": "0xdex", "eth_gas_fee": "0.01", "name": "swapExactAVAXForTokens"},
            "sends": [{"amount": 1.5, "to_addr": "0xdex", "_token": {"id": "avax", "chain": "avax", "symbol": "AVAX"}}],
            "receives": [{"amount": "10", "from_addr": "0xdex", "token_id": "0xjoe"}]
        });
        let record = RawIngestRecord::encode("avalanche", "0xme", "0xh", 7, &payload).unwrap();
        let RawIngestRecord::Chain { payload, timestamp, .. } = RawIngestRecord::decode(&record).unwrap() else {
            panic!("expected an on-chain record");
        };
        assert_eq!(timestamp, 7);
        assert_eq!(payload.sends[0].amount, dec!(1.5));
        assert_eq!(payload.sends[0].asset_tx_id(), Some("avax"));
        assert_eq!(payload.receives[0].asset_tx_id(), Some("0xjoe"));
        assert_eq!(payload.tx.unwrap().eth_gas_fee, Some(dec!(0.01)));
    }

    #[test]
    fn test_decode_exchange_record() {
        let payload = json!({
            "sends": [{"asset_tx_id": "FIAT:USD", "amount": "100", "tx_ledger_type": "Coinbase.Buy",
                       "from_address": "coinbase", "to_address": "coinbase"}],
            "receives": [{"asset_tx_id": "BTC", "amount": "0.01", "tx_ledger_type": "Coinbase.Buy",
                          "cost_basis_including_fees_usd": "101"}]
        });
        let record = RawIngestRecord::encode("import.coinbase", "coinbase-1", "cb-1", 1, &payload).unwrap();
        let RawIngestRecord::Exchange { payload, .. } = RawIngestRecord::decode(&record).unwrap() else {
            panic!("expected an exchange record");
        };
        assert_eq!(payload.receives[0].costbasis_including_fees_usd, Some(dec!(101)));
        assert_eq!(payload.sends[0].isfee, 0);
    }
}

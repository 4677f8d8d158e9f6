//! Asset registry
//!
//! Resolves chain-scoped token ids to the canonical price ids that prices
//! are looked up under and that like-kind lot matching keys on.

use std::collections::HashMap;

use persistence::repository::{AssetPriceRecord, AssetRepository, AssetTxRecord};
use persistence::{text_to_decimal, SqlitePool};
use rust_decimal::Decimal;
use tracing::debug;

use crate::error::EngineResult;
use crate::types::TxLedger;

/// Source short names to canonical chain names
const CHAIN_SHORT_NAMES: &[(&str, &str)] = &[
    ("arb", "arbitrum"),
    ("astar", "astar"),
    ("aurora", "aurora"),
    ("avax", "avalanche"),
    ("base", "base"),
    ("bsc", "binancesc"),
    ("btt", "btt"),
    ("boba", "boba"),
    ("brise", "bitgert"),
    ("canto", "canto"),
    ("celo", "celo"),
    ("cfx", "conflux"),
    ("ckb", "godwoken"),
    ("core", "core"),
    ("cro", "cronos"),
    ("dfk", "dfk"),
    ("doge", "dogechain"),
    ("eos", "eos-evm"),
    ("era", "zksync-era"),
    ("eth", "ethereum"),
    ("etc", "ethereum-classic"),
    ("evmos", "evmos"),
    ("flr", "flare"),
    ("ftm", "fantom"),
    ("fsn", "fusion"),
    ("fuse", "fuse"),
    ("heco", "heco"),
    ("hmy", "harmony"),
    ("iotx", "iotex"),
    ("kava", "kava"),
    ("kcc", "kcc"),
    ("klay", "klaytn"),
    ("linea", "linea"),
    ("loot", "loot"),
    ("lyx", "lukso"),
    ("mada", "milkomeda-c1"),
    ("manta", "manta"),
    ("matic", "polygon"),
    ("metis", "metis"),
    ("mobm", "moonbeam"),
    ("movr", "moonriver"),
    ("mnt", "mantle"),
    ("mtr", "meter"),
    ("nova", "arbitrum-nova"),
    ("oas", "oasys"),
    ("op", "optimism"),
    ("opbnb", "opbnb"),
    ("okt", "okc"),
    ("palm", "palm"),
    ("pls", "pulse"),
    ("pgn", "pgn"),
    ("pze", "polygon-zkevm"),
    ("ron", "ronin"),
    ("rose", "oasis-emerald"),
    ("rsk", "rsk"),
    ("sbch", "smartbch"),
    ("sgb", "songbird"),
    ("shib", "shibarium"),
    ("sdn", "shiden"),
    ("step", "step"),
    ("tenet", "tenet"),
    ("tlos", "telos"),
    ("tomb", "tomb"),
    ("wan", "wanchain"),
    ("wemix", "wemix"),
    ("xdai", "xdai"),
    ("zora", "zora"),
];

/// Native gas asset per canonical chain
const FEE_ASSETS: &[(&str, &str)] = &[
    ("arbitrum", "arb"),
    ("avalanche", "avax"),
    ("binancesc", "bsc"),
    ("ethereum", "eth"),
    ("fantom", "ftm"),
    ("harmony", "one"),
    ("metis", "metis"),
    ("optimism", "op"),
    ("polygon", "matic"),
    ("xdai", "xdai"),
];

/// `chain:contract` of a wrapped native token to the native asset_tx_id
const WRAPPED_TOKENS: &[(&str, &str)] = &[
    ("ethereum:0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2", "eth"),
    ("ethereum:eth", "eth"),
    ("avalanche:0xb31f66aa3c1e785363f0875a1b74e27b85fd66c7", "avax"),
    ("avalanche:avax", "avax"),
    ("fantom:0x21be370d5312f44cb42ce377bc9b8a0cef1a4c83", "ftm"),
    ("fantom:ftm", "ftm"),
    ("harmony:0x21be370d5312f44cb42ce377bc9b8a0cef1a4c83", "one"),
    ("harmony:one", "one"),
    ("arbitrum:0x82af49447d8a07e3bd95bd0d56f35241523fbab1", "aeth"),
    ("optimism:0x82af49447d8a07e3bd95bd0d56f35241523fbab1", "oeth"),
];

/// Tokens pinned to a price, mostly unlisted tokens worth nothing
const FIXED_PRICE_TOKENS: &[(&str, &str)] = &[
    ("polygon:0x0e25f83f02aaa2c15ddd53d7197066659683a9b0", "0"),
    ("polygon:0x034d706c3af9d11f0ba90d9967947abeda7a5758", "0"),
];

/// Keys that must be matched as one underlying asset
const LIKE_KIND: &[(&str, &str)] = &[
    // natives and their wrapped forms
    ("avalanche:avax", "avalanche-2"),
    ("avalanche:0xb31f66aa3c1e785363f0875a1b74e27b85fd66c7", "avalanche-2"),
    ("arbitrum:arb", "ethereum"),
    ("binancesc:bsc", "binancecoin"),
    ("ethereum:eth", "ethereum"),
    ("ethereum:0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2", "ethereum"),
    ("fantom:ftm", "fantom"),
    ("fantom:0x21be370d5312f44cb42ce377bc9b8a0cef1a4c83", "fantom"),
    ("harmony:0x21be370d5312f44cb42ce377bc9b8a0cef1a4c83", "one"),
    ("metis:metis", "metis-token"),
    ("optimism:op", "ethereum"),
    ("polygon:matic", "matic-network"),
    ("xdai:xdai", "xdai"),
    // stables and bridged tokens
    ("avalanche:0xb97ef9ef8734c71904d8002f8b6bc66dd9c48a6e", "usd-coin"),
    ("avalanche:0xa7d7079b0fead91f3e65f86e8915cb59c1a4c664", "usd-coin"),
    ("avalanche:0x46a51127c3ce23fb7ab1de06226147f446e4a857", "usd-coin"),
    ("avalanche:0xc7198437980c041c805a1edcba50c1ce5db95118", "tether"),
    ("avalanche:0x50b7545627a5162f82a992c33b87adc75187b218", "bitcoin"),
    ("avalanche:0xd62eff4221f83f05843ab1f645f7c0b4e38a6b49", "ethereum"),
    ("avalanche:0x63a72806098bd3d9520cc43356dd78afe5d386d9", "aave"),
    ("ethereum:0x7fc66500c84a76ad7e9c93437bfc5ac33e2ddae9", "aave"),
    ("fantom:0x6362496bef53458b20548a35a2101214ee2be3e0", "fantom"),
    ("fantom:0x328a7b4d538a2b3942653a9983fda3c12c571141", "usd-coin"),
    ("fantom:0x8d11ec38a3eb5e956b052f67da8bdc9bef8abf3e", "dai"),
    ("polygon:0x104592a158490a9228070e0a8e5343b499e125d0", "frax"),
    // exchange imports
    ("import:aave", "aave"),
    ("import:alcx", "alchemix"),
    ("import:algo", "algorand"),
    ("import:amp", "amp-token"),
    ("import:atom", "cosmos"),
    ("import:avax", "avalanche-2"),
    ("import:bal", "balancer"),
    ("import:bat", "basic-attention-token"),
    ("import:bch", "bitcoin-cash"),
    ("import:bsv", "bitcoin-cash-sv"),
    ("import:btc", "bitcoin"),
    ("import:cgld", "celo"),
    ("import:clv", "clover-finance"),
    ("import:crv", "curve-dao-token"),
    ("import:comp", "compound-coin"),
    ("import:dai", "dai"),
    ("import:dcr", "decred"),
    ("import:eth", "ethereum"),
    ("import:eth2", "ethereum"),
    ("import:fet", "fetch-ai"),
    ("import:forth", "ampleforth-governance-token"),
    ("import:ftm", "fantom"),
    ("import:glm", "golem"),
    ("import:grt", "the-graph"),
    ("import:icp", "internet-computer"),
    ("import:lrc", "loopring"),
    ("import:ltc", "litecoin"),
    ("import:matic", "matic-network"),
    ("import:metis", "metis-token"),
    ("import:mkr", "maker"),
    ("import:nu", "nucypher"),
    ("import:omg", "omisego"),
    ("import:skl", "skale"),
    ("import:sol", "solana"),
    ("import:sushi", "sushi"),
    ("import:usdc", "usd-coin"),
    ("import:ust", "terrausd"),
    ("import:xlm", "stellar"),
    ("import:xmr", "monero"),
    ("import:xtz", "tezos"),
    ("import:zec", "zcash"),
];

/// Canonical chain name for a source short name. Unknown names pass
/// through only if they are already canonical.
pub fn normalize_chain(name: &str) -> Option<&'static str> {
    let name = name.trim().to_lowercase();
    CHAIN_SHORT_NAMES
        .iter()
        .find(|(short, long)| *short == name || *long == name)
        .map(|(_, long)| *long)
}

/// Exchange imports all share one synthetic chain for like-kind lookups
fn registry_chain(chain: &str) -> &str {
    if chain.starts_with("import.") || chain == "import" {
        "import"
    } else {
        chain
    }
}

fn key(chain: &str, asset_tx_id: &str) -> String {
    format!("{}:{}", registry_chain(chain), asset_tx_id.to_lowercase())
}

/// Result of mapping a chain token onto a price id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedAsset {
    pub asset_price_id: String,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone)]
struct PriceEntry {
    symbol: String,
    market_cap: Decimal,
}

#[derive(Debug, Default, Clone)]
pub struct AssetRegistry {
    prices: HashMap<String, PriceEntry>,
    txs: HashMap<String, AssetTxRecord>,
    /// lowercase symbol -> price ids, highest market cap first
    by_symbol: HashMap<String, Vec<String>>,
    like_kind: HashMap<String, String>,
    fixed: HashMap<String, Decimal>,
    wrapped: HashMap<String, String>,
}

impl AssetRegistry {
    /// Registry with only the built-in tables
    pub fn new() -> Self {
        Self::from_records(Vec::new(), Vec::new())
    }

    pub async fn load(pool: &SqlitePool) -> EngineResult<Self> {
        let repo = AssetRepository::new(pool);
        let prices = repo.list_prices().await?;
        let txs = repo.list_txs().await?;
        debug!(prices = prices.len(), txs = txs.len(), "Loaded asset registry");
        Ok(Self::from_records(prices, txs))
    }

    pub fn from_records(prices: Vec<AssetPriceRecord>, txs: Vec<AssetTxRecord>) -> Self {
        let mut registry = Self {
            like_kind: LIKE_KIND
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            wrapped: WRAPPED_TOKENS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            fixed: FIXED_PRICE_TOKENS
                .iter()
                .filter_map(|(k, v)| text_to_decimal(v).ok().map(|p| (k.to_string(), p)))
                .collect(),
            ..Default::default()
        };
        for p in prices {
            registry.add_price(p);
        }
        for t in txs {
            registry.add_tx(t);
        }
        registry
    }

    pub fn add_price(&mut self, record: AssetPriceRecord) {
        let market_cap = record
            .market_cap
            .as_deref()
            .and_then(|m| text_to_decimal(m).ok())
            .unwrap_or_default();
        let symbol_key = record.symbol.to_lowercase();
        self.prices.insert(
            record.id.clone(),
            PriceEntry {
                symbol: record.symbol,
                market_cap,
            },
        );

        let ids = self.by_symbol.entry(symbol_key).or_default();
        if !ids.contains(&record.id) {
            ids.push(record.id);
        }
        let prices = &self.prices;
        ids.sort_by(|a, b| {
            let cap = |id: &String| prices.get(id).map(|p| p.market_cap).unwrap_or_default();
            cap(b).cmp(&cap(a)).then_with(|| a.cmp(b))
        });
    }

    pub fn add_tx(&mut self, record: AssetTxRecord) {
        self.txs.insert(key(&record.chain, &record.id), record);
    }

    /// Pin a token to a fixed price
    pub fn add_fixed_price(&mut self, chain: &str, asset_tx_id: &str, price: Decimal) {
        self.fixed.insert(key(chain, asset_tx_id), price);
    }

    pub fn add_like_kind(&mut self, chain: &str, asset_tx_id: &str, asset_price_id: &str) {
        self.like_kind
            .insert(key(chain, asset_tx_id), asset_price_id.to_string());
    }

    pub fn fixed_price(&self, chain: &str, asset_tx_id: &str) -> Option<Decimal> {
        self.fixed.get(&key(chain, asset_tx_id)).copied()
    }

    /// Native asset a wrapped token stands for
    pub fn is_wrapped(&self, chain: &str, asset_tx_id: &str) -> Option<&str> {
        self.wrapped
            .get(&key(chain, asset_tx_id))
            .map(String::as_str)
    }

    /// Whether the asset is the chain's own native coin
    pub fn is_native(&self, chain: &str, asset_tx_id: &str) -> bool {
        let id = asset_tx_id.to_lowercase();
        self.wrapped
            .iter()
            .any(|(k, v)| *v == id && k.split_once(':').map(|(c, _)| c) == Some(chain))
    }

    /// Gas asset of a chain. Boba charges gas per transaction, so its
    /// fee asset comes from the raw record instead.
    pub fn fee_asset(&self, chain: &str) -> Option<&'static str> {
        FEE_ASSETS
            .iter()
            .find(|(c, _)| *c == chain)
            .map(|(_, asset)| *asset)
    }

    pub fn symbol_for_price_id(&self, asset_price_id: &str) -> Option<&str> {
        self.prices.get(asset_price_id).map(|p| p.symbol.as_str())
    }

    /// Largest listed asset carrying a symbol
    pub fn price_id_for_symbol(&self, symbol: &str) -> Option<&str> {
        self.by_symbol
            .get(&symbol.to_lowercase())
            .and_then(|ids| ids.first())
            .map(String::as_str)
    }

    /// Symbol recorded in `asset_tx` for a chain token
    pub fn tx_symbol(&self, chain: &str, asset_tx_id: &str) -> Option<&str> {
        self.txs
            .get(&key(chain, asset_tx_id))
            .and_then(|t| t.symbol.as_deref())
    }

    /// `asset_tx_id -> asset_price_id` straight from the asset_tx table
    pub fn direct_price_id(&self, chain: &str, asset_tx_id: &str) -> Option<&str> {
        self.txs
            .get(&key(chain, asset_tx_id))
            .and_then(|t| t.asset_price_id.as_deref())
    }

    /// Map a chain token onto its price id: like-kind table, then the
    /// asset_tx join, then (only when asked) the largest listed asset
    /// sharing its symbol.
    pub fn map_asset(&self, chain: &str, asset_tx_id: &str, symbol_fallback: bool) -> Option<MappedAsset> {
        self.resolve(chain, asset_tx_id, symbol_fallback, None)
    }

    /// [`Self::map_asset`] for a ledger; the ledger's own symbol is the
    /// last resort for the symbol fallback
    pub fn map_ledger(&self, t: &TxLedger, symbol_fallback: bool) -> Option<MappedAsset> {
        self.resolve(&t.chain, &t.asset_tx_id, symbol_fallback, t.symbol.as_deref())
    }

    fn resolve(
        &self,
        chain: &str,
        asset_tx_id: &str,
        symbol_fallback: bool,
        ledger_symbol: Option<&str>,
    ) -> Option<MappedAsset> {
        let k = key(chain, asset_tx_id);

        if let Some(price_id) = self.like_kind.get(&k) {
            return Some(MappedAsset {
                asset_price_id: price_id.clone(),
                symbol: self.symbol_for_price_id(price_id).map(str::to_string),
            });
        }

        let tx = self.txs.get(&k);
        if let Some(tx) = tx {
            if let Some(price_id) = &tx.asset_price_id {
                let symbol = self
                    .symbol_for_price_id(price_id)
                    .map(str::to_string)
                    .or_else(|| tx.symbol.clone());
                if symbol.is_some() {
                    return Some(MappedAsset {
                        asset_price_id: price_id.clone(),
                        symbol,
                    });
                }
            }
        }

        if !symbol_fallback {
            return None;
        }

        let symbol = tx.and_then(|t| t.symbol.as_deref()).or(ledger_symbol)?;
        let price_id = self.by_symbol.get(&symbol.to_lowercase())?.first()?;
        Some(MappedAsset {
            asset_price_id: price_id.clone(),
            symbol: self.symbol_for_price_id(price_id).map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const USDC: &str = "0xb97ef9ef8734c71904d8002f8b6bc66dd9c48a6e";
    const USDC_E: &str = "0xa7d7079b0fead91f3e65f86e8915cb59c1a4c664";
    const WAVAX: &str = "0xb31f66aa3c1e785363f0875a1b74e27b85fd66c7";

    fn price(id: &str, symbol: &str, cap: Option<&str>) -> AssetPriceRecord {
        AssetPriceRecord {
            id: id.into(),
            source: "coingecko".into(),
            symbol: symbol.into(),
            name: id.into(),
            market_cap: cap.map(Into::into),
        }
    }

    fn tx(chain: &str, id: &str, price_id: Option<&str>, symbol: Option<&str>) -> AssetTxRecord {
        AssetTxRecord {
            chain: chain.into(),
            id: id.into(),
            asset_price_id: price_id.map(Into::into),
            symbol: symbol.map(Into::into),
            name: None,
        }
    }

    fn registry() -> AssetRegistry {
        AssetRegistry::from_records(
            vec![
                price("avalanche-2", "AVAX", Some("9000000000")),
                price("usd-coin", "USDC", Some("50000000000")),
                price("joe", "JOE", Some("100000000")),
                price("joe-clone", "JOE", Some("1000")),
            ],
            vec![
                tx("avalanche", "0x6e84a6216ea6dacc71ee8e6b0a5b7322eebc0fdd", Some("joe"), Some("JOE")),
                tx("avalanche", "0xunpriced", None, Some("JOE")),
            ],
        )
    }

    #[test]
    fn test_normalize_chain() {
        assert_eq!(normalize_chain("avax"), Some("avalanche"));
        assert_eq!(normalize_chain("FTM"), Some("fantom"));
        assert_eq!(normalize_chain("era"), Some("zksync-era"));
        assert_eq!(normalize_chain("avalanche"), Some("avalanche"));
        assert_eq!(normalize_chain("nowhere"), None);
    }

    #[test]
    fn test_like_kind_usdc_and_wavax() {
        let r = registry();
        let native = r.map_asset("avalanche", USDC, false).unwrap();
        let bridged = r.map_asset("avalanche", USDC_E, false).unwrap();
        assert_eq!(native, bridged);
        assert_eq!(native.symbol.as_deref(), Some("USDC"));

        let wavax = r.map_asset("avalanche", &WAVAX.to_uppercase(), false).unwrap();
        assert_eq!(wavax.asset_price_id, "avalanche-2");
        assert_eq!(r.is_wrapped("avalanche", WAVAX), Some("avax"));
        assert!(r.is_native("avalanche", "avax"));
        assert!(!r.is_native("avalanche", WAVAX));
    }

    #[test]
    fn test_exchange_imports_share_a_chain() {
        let r = registry();
        let mapped = r.map_asset("import.coinbase", "AVAX", false).unwrap();
        assert_eq!(mapped.asset_price_id, "avalanche-2");
    }

    #[test]
    fn test_symbol_fallback_only_when_asked() {
        let r = registry();
        assert!(r.map_asset("avalanche", "0xunpriced", false).is_none());
        let mapped = r.map_asset("avalanche", "0xunpriced", true).unwrap();
        // largest market cap wins
        assert_eq!(mapped.asset_price_id, "joe");
    }

    #[test]
    fn test_fixed_price_and_fee_asset() {
        let mut r = registry();
        assert_eq!(
            r.fixed_price("polygon", "0x0e25f83f02aaa2c15ddd53d7197066659683a9b0"),
            Some(Decimal::ZERO)
        );
        r.add_fixed_price("avalanche", "0xpeg", dec!(1));
        assert_eq!(r.fixed_price("avalanche", "0xPEG"), Some(dec!(1)));
        assert_eq!(r.fee_asset("avalanche"), Some("avax"));
        assert_eq!(r.fee_asset("boba"), None);
    }
}

use std::path::Path;

use serde::Deserialize;

use crate::error::{CoreError, Result};

/// Decimal precision for a canonical asset symbol. Used by the double-entry
/// backend to shift human-readable decimals to smallest-unit integers.
pub fn precision_for(symbol: &str) -> u32 {
    match symbol {
        "USD" => 2,
        "USDC" | "USDT" => 6,
        "BTC" => 8,
        "ETH" => 18,
        "SOL" => 9,
        _ => 6,
    }
}

/// Known asset symbols, used by the double-entry backend when it needs to
/// enumerate the symbol universe (e.g. reverse address lookups).
pub const KNOWN_SYMBOLS: &[&str] = &["USD", "USDC", "USDT", "BTC", "ETH", "SOL"];

/// Maps the Exchange's network-specific symbol variants to the canonical
/// symbol balances are keyed by. Unknown symbols pass through unchanged.
///
/// The address index is the authoritative source of the canonical symbol
/// (it was fixed at provisioning time); this table is the fallback for
/// events that cannot be resolved through an address.
pub fn canonical_symbol(symbol: &str) -> &str {
    match symbol {
        "SPLUSDC" | "AVAUSDC" | "ARBUSDC" | "BASEUSDC" => "USDC",
        "BASEETH" => "ETH",
        other => other,
    }
}

/// One monitored (symbol, network) pair from the assets file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AssetConfig {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub network: String,
}

#[derive(Debug, Deserialize)]
struct AssetsFile {
    #[serde(default)]
    assets: Vec<AssetConfig>,
}

/// Loads the assets file (`assets:` list of `{symbol, network}` records).
/// Both fields are required on every record.
pub fn load_asset_config(path: impl AsRef<Path>) -> Result<Vec<AssetConfig>> {
    let path = path.as_ref();
    let display = path.display().to_string();

    let raw = std::fs::read_to_string(path).map_err(|source| CoreError::AssetsRead {
        path: display.clone(),
        source,
    })?;

    let parsed: AssetsFile =
        serde_yaml::from_str(&raw).map_err(|source| CoreError::AssetsParse {
            path: display,
            source,
        })?;

    for (i, asset) in parsed.assets.iter().enumerate() {
        if asset.symbol.is_empty() {
            return Err(CoreError::AssetsMissingField(i, "symbol"));
        }
        if asset.network.is_empty() {
            return Err(CoreError::AssetsMissingField(i, "network"));
        }
    }

    Ok(parsed.assets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn canonical_symbol_maps_network_variants() {
        assert_eq!(canonical_symbol("BASEUSDC"), "USDC");
        assert_eq!(canonical_symbol("SPLUSDC"), "USDC");
        assert_eq!(canonical_symbol("AVAUSDC"), "USDC");
        assert_eq!(canonical_symbol("ARBUSDC"), "USDC");
        assert_eq!(canonical_symbol("BASEETH"), "ETH");
        // canonical symbols and unknowns pass through
        assert_eq!(canonical_symbol("USDC"), "USDC");
        assert_eq!(canonical_symbol("DOGE"), "DOGE");
    }

    #[test]
    fn precision_table() {
        assert_eq!(precision_for("USD"), 2);
        assert_eq!(precision_for("USDC"), 6);
        assert_eq!(precision_for("BTC"), 8);
        assert_eq!(precision_for("ETH"), 18);
        assert_eq!(precision_for("SOL"), 9);
        assert_eq!(precision_for("UNKNOWN"), 6);
    }

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn load_asset_config_parses_valid_file() {
        let path = write_temp(
            "subledger-assets-valid.yaml",
            "assets:\n  - symbol: USDC\n    network: base-mainnet\n  - symbol: ETH\n    network: ethereum-mainnet\n",
        );
        let assets = load_asset_config(&path).unwrap();
        assert_eq!(assets.len(), 2);
        assert_eq!(assets[0].symbol, "USDC");
        assert_eq!(assets[1].network, "ethereum-mainnet");
    }

    #[test]
    fn load_asset_config_rejects_missing_network() {
        let path = write_temp(
            "subledger-assets-missing.yaml",
            "assets:\n  - symbol: USDC\n",
        );
        let err = load_asset_config(&path).unwrap_err();
        assert!(matches!(err, CoreError::AssetsMissingField(0, "network")));
    }
}

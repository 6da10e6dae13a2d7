// Configuration loading and boundary validation.
//
// A `config.toml` file is deserialized into typed sections; there is no
// global config value; `main` reads this once and hands the pieces to the
// values it constructs. Tracked addresses come from a separate JSON file
// (an array of hex addresses) and are validated here: a malformed address
// rejects the whole configuration.

use std::fs;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::telemetry::TelemetryConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

const DEFAULT_MAX_REORG_DEPTH: u64 = 512;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub node: NodeSection,
    pub store: StoreSection,
    #[serde(default)]
    pub indexer: IndexerSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    /// Websocket RPC endpoint of the upstream node.
    pub ws_endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    /// Path of the SQLite index database.
    pub path: String,
}

impl StoreSection {
    pub fn expanded_path(&self) -> String {
        shellexpand::tilde(&self.path).into_owned()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexerSection {
    /// Optional JSON file with an array of addresses to track balances for.
    pub tracked_addresses_file: Option<String>,
    /// Bound on ancestor walks during gap fill and reorg decisions.
    pub max_reorg_depth: u64,
}

impl Default for IndexerSection {
    fn default() -> Self {
        Self {
            tracked_addresses_file: None,
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { bind: "0.0.0.0:3005".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub log_level: String,
    pub log_format: String,
    pub log_file: Option<String>,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            log_file: None,
        }
    }
}

impl AppConfig {
    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: self.telemetry.log_level.clone(),
            log_format: self.telemetry.log_format.clone(),
            log_file: self.telemetry.log_file.clone(),
        }
    }

    /// Load the tracked-address list named by the configuration, or an
    /// empty list when none is configured.
    pub fn tracked_addresses(&self) -> Result<Vec<String>> {
        match &self.indexer.tracked_addresses_file {
            Some(path) if !path.is_empty() => {
                tracked_addresses_from_file(&shellexpand::tilde(path))
            }
            _ => Ok(Vec::new()),
        }
    }
}

pub fn load(path: &str) -> Result<AppConfig> {
    let settings = ::config::Config::builder()
        .add_source(::config::File::with_name(path))
        .build()
        .map_err(|err| Error::invalid_input(format!("loading {}: {}", path, err)))?;

    settings
        .try_deserialize()
        .map_err(|err| Error::invalid_input(format!("parsing {}: {}", path, err)))
}

/// Read a JSON array of hex addresses. Every entry must be 20-byte
/// 0x-prefixed hex.
pub fn tracked_addresses_from_file(path: &str) -> Result<Vec<String>> {
    let body = fs::read_to_string(path)
        .map_err(|err| Error::invalid_input(format!("reading {}: {}", path, err)))?;
    let addresses: Vec<String> = serde_json::from_str(&body)
        .map_err(|err| Error::invalid_input(format!("parsing {}: {}", path, err)))?;

    for address in &addresses {
        if !is_hex_address(address) {
            return Err(Error::invalid_input(format!(
                "tracked address {} is not 20-byte 0x-prefixed hex",
                address
            )));
        }
    }

    Ok(addresses)
}

/// A 20-byte 0x-prefixed hex address.
pub fn is_hex_address(address: &str) -> bool {
    let digits = match address.strip_prefix("0x") {
        Some(digits) => digits,
        None => return false,
    };
    digits.len() == 40 && digits.bytes().all(|byte| byte.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn validates_addresses() {
        assert!(is_hex_address("0x00112233445566778899aabbccddeeff00112233"));
        assert!(is_hex_address("0x00112233445566778899AABBCCDDEEFF00112233"));
        assert!(!is_hex_address("00112233445566778899aabbccddeeff00112233"));
        assert!(!is_hex_address("0x0011"));
        assert!(!is_hex_address("0x00112233445566778899aabbccddeeff0011223g"));
    }

    #[test]
    fn reads_tracked_addresses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"["0x00112233445566778899aabbccddeeff00112233"]"#).unwrap();

        let addresses = tracked_addresses_from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(addresses.len(), 1);
    }

    #[test]
    fn rejects_malformed_tracked_address() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"["0xnot-an-address"]"#).unwrap();

        let err = tracked_addresses_from_file(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn loads_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[node]\nws_endpoint = \"ws://127.0.0.1:8546\"\n\n[store]\npath = \"index.db\"\n",
        )
        .unwrap();

        let loaded = load(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.node.ws_endpoint, "ws://127.0.0.1:8546");
        assert_eq!(loaded.indexer.max_reorg_depth, 512);
        assert_eq!(loaded.server.bind, "0.0.0.0:3005");
        assert!(loaded.tracked_addresses().unwrap().is_empty());
    }
}

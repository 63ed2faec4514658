//! Pairing persistence
//!
//! Stores what the app must remember across launches: which boards were
//! bonded over BLE, and the name/password for boards reachable over the
//! local network. Saved as TOML under the platform config directory.

use crate::transfer::PeripheralIdentity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A board bonded over BLE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondedPeripheralRecord {
    pub name: String,
    pub identity: Uuid,
}

/// Credentials for a board on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiCredentialRecord {
    pub name: String,
    pub host_name: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairingStore {
    #[serde(default)]
    pub bonded: Vec<BondedPeripheralRecord>,
    #[serde(default)]
    pub wifi: Vec<WifiCredentialRecord>,
}

impl PairingStore {
    fn store_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("boardlink")
            .join("pairings.toml")
    }

    /// Load the store, falling back to an empty one when the file is missing
    /// or unreadable.
    pub fn load() -> Self {
        Self::load_from(&Self::store_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(store) => {
                        tracing::debug!("loaded pairings from {}", path.display());
                        return store;
                    }
                    Err(e) => {
                        tracing::warn!("failed to parse pairings: {e}, starting empty");
                    }
                },
                Err(e) => {
                    tracing::warn!("failed to read pairings file: {e}, starting empty");
                }
            }
        }
        Self::default()
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::store_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        tracing::debug!("saved pairings to {}", path.display());
        Ok(())
    }

    /// Record a bond, replacing any earlier record for the same peripheral.
    pub fn remember_bonded(&mut self, name: &str, identity: Uuid) {
        self.bonded.retain(|r| r.identity != identity);
        self.bonded.push(BondedPeripheralRecord {
            name: name.to_string(),
            identity,
        });
    }

    /// Record network credentials, keyed by host name.
    pub fn remember_wifi(&mut self, name: &str, host_name: &str, password: Option<String>) {
        self.wifi.retain(|r| r.host_name != host_name);
        self.wifi.push(WifiCredentialRecord {
            name: name.to_string(),
            host_name: host_name.to_string(),
            password,
        });
    }

    pub fn password_for_host(&self, host_name: &str) -> Option<String> {
        self.wifi
            .iter()
            .find(|r| r.host_name == host_name)
            .and_then(|r| r.password.clone())
    }

    pub fn bonded_identities(&self) -> Vec<Uuid> {
        self.bonded.iter().map(|r| r.identity).collect()
    }

    /// The saved display name for a peripheral, if any.
    pub fn name_for(&self, identity: &PeripheralIdentity) -> Option<String> {
        match identity {
            PeripheralIdentity::Ble(id) => self
                .bonded
                .iter()
                .find(|r| r.identity == *id)
                .map(|r| r.name.clone()),
            PeripheralIdentity::Wifi { host, .. } => self
                .wifi
                .iter()
                .find(|r| r.host_name == *host)
                .map(|r| r.name.clone()),
        }
    }
}

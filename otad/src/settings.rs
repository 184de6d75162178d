//! Persisted agent settings.
//!
//! All durable agent state lives in one TOML file with `[network]`,
//! `[api]`, `[polling]`, `[update]` and `[storage]` sections. The file
//! holds both operator configuration (server address, polling
//! interval, download dir) and the scheduling state the machine
//! maintains (last/first poll, retry counter, extra interval, last
//! installed package uid).
//!
//! Only the state machine mutates settings, through
//! [`SettingsStore::apply`], which persists before committing: a
//! failed write leaves the previous value visible.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use otad_updates::InstallMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::AgentError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub network: NetworkSettings,
    pub api: ApiSettings,
    pub polling: PollingSettings,
    pub update: UpdateSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Base URL of the update server
    pub server_address: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            server_address: "http://localhost:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: 8313,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    /// Enable periodic update checks
    pub enabled: bool,

    /// Regular probe interval (seconds)
    pub interval_secs: u64,

    /// One-shot server-requested override of the next probe interval
    /// (seconds, 0 = none)
    pub extra_interval_secs: u64,

    /// When this device first started polling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_poll: Option<DateTime<Utc>>,

    /// When the server was last probed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_poll: Option<DateTime<Utc>>,

    /// Probes since the last one that produced an update
    pub retries: u32,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 86_400,
            extra_interval_secs: 0,
            first_poll: None,
            last_poll: None,
            retries: 0,
        }
    }
}

impl PollingSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSettings {
    /// Where downloaded objects are stored, named by their SHA-256
    pub download_dir: PathBuf,

    /// Install modes this device accepts
    pub supported_install_modes: Vec<InstallMode>,

    /// Fingerprint of the most recently *started* install. Guards
    /// against redoing a side-effecting install after a crash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_installed_package_uid: Option<String>,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("/var/lib/otad/downloads"),
            supported_install_modes: vec![
                InstallMode::Copy,
                InstallMode::Flash,
                InstallMode::Imxkobs,
                InstallMode::Raw,
            ],
            last_installed_package_uid: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Refuse installs that would write to storage
    pub read_only: bool,

    /// File persisting the active slot index
    pub slot_file: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            read_only: false,
            slot_file: PathBuf::from("/var/lib/otad/active-slot"),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            network: NetworkSettings::default(),
            api: ApiSettings::default(),
            polling: PollingSettings::default(),
            update: UpdateSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;

        let settings: Settings =
            toml::from_str(&contents).context("failed to parse settings file")?;
        settings.validate()?;

        Ok(settings)
    }

    /// Write settings to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self).context("failed to serialize settings")?;
        fs::write(path, contents)
            .with_context(|| format!("failed to write settings file {}", path.display()))?;

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.polling.enabled && self.polling.interval_secs == 0 {
            anyhow::bail!("polling.interval_secs must be greater than zero when polling is enabled");
        }
        Ok(())
    }
}

/// Owner of the persisted settings value.
///
/// Mutations go through [`apply`](Self::apply): the mutation runs on a
/// copy, the copy is persisted, and only a successful persist commits
/// it. Readers therefore always see either the pre- or post-mutation
/// snapshot, never a torn or unpersisted one.
pub struct SettingsStore {
    path: PathBuf,
    current: Settings,
}

impl SettingsStore {
    /// Open the settings file, creating it with defaults when absent.
    pub fn open(path: &Path) -> Result<Self> {
        let current = if path.exists() {
            Settings::load(path)?
        } else {
            info!("settings file {} not found, writing defaults", path.display());
            let settings = Settings::default();
            settings.save(path)?;
            settings
        };

        Ok(Self {
            path: path.to_path_buf(),
            current,
        })
    }

    pub fn get(&self) -> &Settings {
        &self.current
    }

    pub fn snapshot(&self) -> Settings {
        self.current.clone()
    }

    /// Mutate and persist, or fail without changing the visible value.
    pub fn apply<F>(&mut self, mutate: F) -> crate::error::Result<()>
    where
        F: FnOnce(&mut Settings),
    {
        let mut next = self.current.clone();
        mutate(&mut next);

        next.save(&self.path)
            .map_err(|e| AgentError::SettingsPersist(e.to_string()))?;

        self.current = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.polling.enabled);
        assert_eq!(settings.polling.interval_secs, 86_400);
        assert_eq!(settings.polling.extra_interval_secs, 0);
        assert_eq!(settings.polling.retries, 0);
        assert!(settings.polling.last_poll.is_none());
        assert!(settings.update.last_installed_package_uid.is_none());
        assert!(!settings.storage.read_only);
    }

    #[test]
    fn test_persist_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otad.toml");

        let mut settings = Settings::default();
        settings.polling.interval_secs = 600;
        settings.polling.retries = 3;
        settings.polling.last_poll = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap());
        settings.polling.first_poll = Some(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());
        settings.update.last_installed_package_uid = Some("ab".repeat(32));

        settings.save(&path).unwrap();
        let reloaded = Settings::load(&path).unwrap();
        assert_eq!(settings, reloaded);
    }

    #[test]
    fn test_zero_interval_rejected_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otad.toml");

        let mut settings = Settings::default();
        settings.polling.interval_secs = 0;
        settings.save(&path).unwrap();

        assert!(Settings::load(&path).is_err());

        // Disabled polling tolerates a zero interval.
        settings.polling.enabled = false;
        settings.save(&path).unwrap();
        assert!(Settings::load(&path).is_ok());
    }

    #[test]
    fn test_store_creates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otad.toml");

        let store = SettingsStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.get().polling.interval_secs, 86_400);
    }

    #[test]
    fn test_apply_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otad.toml");

        let mut store = SettingsStore::open(&path).unwrap();
        store
            .apply(|s| {
                s.polling.retries = 7;
                s.polling.extra_interval_secs = 120;
            })
            .unwrap();

        assert_eq!(store.get().polling.retries, 7);

        let reloaded = Settings::load(&path).unwrap();
        assert_eq!(reloaded.polling.retries, 7);
        assert_eq!(reloaded.polling.extra_interval_secs, 120);
    }

    #[test]
    fn test_apply_rolls_back_on_persist_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("otad.toml");

        let mut store = SettingsStore::open(&path).unwrap();

        // Make the path unwritable by turning it into a directory.
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        let result = store.apply(|s| s.polling.retries = 99);
        assert!(matches!(result, Err(AgentError::SettingsPersist(_))));

        // The in-memory value was not committed.
        assert_eq!(store.get().polling.retries, 0);
    }
}

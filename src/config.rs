use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_qr_limit() -> u32 {
    30
}

fn default_qr_color() -> String {
    "#198754".to_string()
}

fn default_import_window_days() -> i64 {
    1000
}

fn default_recovery_sweep_secs() -> u64 {
    30
}

fn default_group_ttl_secs() -> u64 {
    3600
}

fn default_group_sweep_secs() -> u64 {
    3600
}

fn default_auth_save_secs() -> u64 {
    5
}

fn default_reconnect_step_secs() -> u64 {
    2
}

fn default_reconnect_max_secs() -> u64 {
    30
}

fn default_cache_ttl_secs() -> u64 {
    6 * 3600
}

fn default_auth_dir() -> PathBuf {
    PathBuf::from("instances")
}

/// Which entity kinds the relational store persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveFlags {
    pub credentials: bool,
    pub chats: bool,
    pub contacts: bool,
    pub messages: bool,
    pub message_updates: bool,
    pub labels: bool,
}

impl Default for SaveFlags {
    fn default() -> Self {
        Self {
            credentials: true,
            chats: true,
            contacts: true,
            messages: true,
            message_updates: true,
            labels: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub enabled: bool,
    pub url: String,
    pub save: SaveFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Persist credentials into the cache service instead of the
    /// database/filesystem.
    pub save_credentials: bool,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            save_credentials: false,
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QrConfig {
    /// QR events issued before the pairing attempt is refused for good.
    pub limit: u32,
    /// Dark-module color of the rendered artifact.
    pub color: String,
}

impl Default for QrConfig {
    fn default() -> Self {
        Self {
            limit: default_qr_limit(),
            color: default_qr_color(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: Option<String>,
    /// Embed media payloads as base64 in `messages.upsert` fan-out.
    pub base64: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Linear backoff step, multiplied by the consecutive error count.
    pub step_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            step_secs: default_reconnect_step_secs(),
            max_delay_secs: default_reconnect_max_secs(),
        }
    }
}

impl ReconnectConfig {
    pub fn delay_for(&self, error_count: u32) -> Duration {
        let secs = (u64::from(error_count) * self.step_secs).min(self.max_delay_secs);
        Duration::from_secs(secs)
    }
}

/// Process-wide engine configuration, shared by every instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub qr: QrConfig,
    pub webhook: WebhookConfig,
    pub reconnect: ReconnectConfig,

    /// Directory for the file credential backend (one subdirectory per
    /// instance).
    pub auth_dir: PathBuf,

    /// History-set cutoff window. A CRM-configured smaller window wins
    /// when the CRM bridge is active.
    pub import_window_days: i64,
    pub crm_import_window_days: Option<i64>,

    pub recovery_sweep_secs: u64,
    pub group_metadata_ttl_secs: u64,
    pub group_sweep_secs: u64,
    pub auth_save_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            qr: QrConfig::default(),
            webhook: WebhookConfig::default(),
            reconnect: ReconnectConfig::default(),
            auth_dir: default_auth_dir(),
            import_window_days: default_import_window_days(),
            crm_import_window_days: None,
            recovery_sweep_secs: default_recovery_sweep_secs(),
            group_metadata_ttl_secs: default_group_ttl_secs(),
            group_sweep_secs: default_group_sweep_secs(),
            auth_save_interval_secs: default_auth_save_secs(),
        }
    }
}

impl EngineConfig {
    /// Effective history cutoff window in days.
    pub fn effective_import_window_days(&self, crm_active: bool) -> i64 {
        match (crm_active, self.crm_import_window_days) {
            (true, Some(days)) => days.min(self.import_window_days),
            _ => self.import_window_days,
        }
    }

    pub fn group_metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.group_metadata_ttl_secs)
    }
}

/// Per-instance behavior toggles, re-read for every batch so settings
/// changes apply without a reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSettings {
    /// Drop all group-scoped traffic before any store write.
    pub groups_ignore: bool,
    /// Mark incoming chat messages read on arrival.
    pub read_messages: bool,
    /// Mark incoming status-broadcast events read on arrival.
    pub read_status: bool,
    pub sync_full_history: bool,
    pub always_online: bool,
    pub reject_call: bool,
    /// Text sent back when a call is rejected, if non-empty.
    pub msg_call: Option<String>,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            groups_ignore: false,
            read_messages: false,
            read_status: false,
            sync_full_history: false,
            always_online: false,
            reject_call: false,
            msg_call: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_deserialize_from_empty_object() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.qr.limit, 30);
        assert_eq!(config.import_window_days, 1000);
        assert_eq!(config.recovery_sweep_secs, 30);
        assert!(!config.database.enabled);
    }

    #[test]
    fn crm_window_only_applies_when_smaller_and_active() {
        let mut config = EngineConfig::default();
        config.crm_import_window_days = Some(60);
        assert_eq!(config.effective_import_window_days(true), 60);
        assert_eq!(config.effective_import_window_days(false), 1000);

        config.crm_import_window_days = Some(5000);
        assert_eq!(config.effective_import_window_days(true), 1000);
    }

    #[test]
    fn reconnect_backoff_is_linear_and_capped() {
        let reconnect = ReconnectConfig::default();
        assert_eq!(reconnect.delay_for(0), Duration::from_secs(0));
        assert_eq!(reconnect.delay_for(3), Duration::from_secs(6));
        assert_eq!(reconnect.delay_for(100), Duration::from_secs(30));
    }
}

//! Configuration surface (§6) plus the Client configuration (§3).
//!
//! Layered the way the teacher's `DaemonConfig::new` documents: CLI/env >
//! TOML file > built-in default. `TomlConfig` mirrors `config/mod.rs`'s
//! all-`Option<T>` overlay struct.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use crate::secret::Secret;

const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 5;
const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 3;
const DEFAULT_RETRY_MAX: u32 = 3;
const DEFAULT_RETRY_BACKOFF_SECS: u64 = 1;

/// `{data_dir}/config.toml` — every field optional, overridden by CLI/env.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    pub scan_timeout_secs: Option<u64>,
    pub connection_timeout_secs: Option<u64>,
    pub response_timeout_secs: Option<u64>,
    pub retry_max: Option<u32>,
    pub retry_backoff_secs: Option<u64>,
    pub restore_identifier: Option<String>,
}

impl TomlConfig {
    pub fn load(data_dir: &Path) -> Option<Self> {
        let path = data_dir.join("config.toml");
        let contents = std::fs::read_to_string(&path).ok()?;
        match toml::from_str::<Self>(&contents) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                tracing::error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
                None
            }
        }
    }
}

/// Everything the presentation engine needs for one instance (§3 Client
/// configuration + §6 Configuration surface). Immutable for the engine's
/// lifetime.
#[derive(Clone)]
pub struct EngineConfig {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub device_id: Secret<[u8; 16]>,
    pub device_key: Secret<[u8; 16]>,
    pub credential: Secret<String>,
    pub scan_timeout: Duration,
    pub connection_timeout: Duration,
    pub response_timeout: Duration,
    pub retry_max: u32,
    pub retry_backoff: Duration,
    pub restore_identifier: Option<String>,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("service_uuid", &self.service_uuid)
            .field("characteristic_uuid", &self.characteristic_uuid)
            .field("device_id", &self.device_id)
            .field("device_key", &self.device_key)
            .field("credential", &self.credential)
            .field("scan_timeout", &self.scan_timeout)
            .field("connection_timeout", &self.connection_timeout)
            .field("response_timeout", &self.response_timeout)
            .field("retry_max", &self.retry_max)
            .field("retry_backoff", &self.retry_backoff)
            .field("restore_identifier", &self.restore_identifier)
            .finish()
    }
}

/// Builder-style constructor mirroring `DaemonConfig::new`'s
/// CLI/env-over-TOML-over-default precedence rule.
pub struct EngineConfigOverrides {
    pub scan_timeout_secs: Option<u64>,
    pub connection_timeout_secs: Option<u64>,
    pub response_timeout_secs: Option<u64>,
    pub retry_max: Option<u32>,
    pub retry_backoff_secs: Option<u64>,
    pub restore_identifier: Option<String>,
}

impl EngineConfig {
    /// `device_id`, `device_key`, and `credential` are provisioned
    /// externally (§1 Out-of-scope: key provisioning/enrollment) and are
    /// never read from `config.toml`.
    pub fn new(
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        device_id: [u8; 16],
        device_key: [u8; 16],
        credential: String,
        overrides: EngineConfigOverrides,
        toml: Option<TomlConfig>,
    ) -> Self {
        let toml = toml.unwrap_or_default();

        let scan_timeout_secs = overrides
            .scan_timeout_secs
            .or(toml.scan_timeout_secs)
            .unwrap_or(DEFAULT_SCAN_TIMEOUT_SECS);
        let connection_timeout_secs = overrides
            .connection_timeout_secs
            .or(toml.connection_timeout_secs)
            .unwrap_or(DEFAULT_CONNECTION_TIMEOUT_SECS);
        let response_timeout_secs = overrides
            .response_timeout_secs
            .or(toml.response_timeout_secs)
            .unwrap_or(DEFAULT_RESPONSE_TIMEOUT_SECS);
        let retry_max = overrides.retry_max.or(toml.retry_max).unwrap_or(DEFAULT_RETRY_MAX);
        let retry_backoff_secs = overrides
            .retry_backoff_secs
            .or(toml.retry_backoff_secs)
            .unwrap_or(DEFAULT_RETRY_BACKOFF_SECS);
        let restore_identifier = overrides.restore_identifier.or(toml.restore_identifier);

        Self {
            service_uuid,
            characteristic_uuid,
            device_id: Secret::new(device_id),
            device_key: Secret::new(device_key),
            credential: Secret::new(credential),
            scan_timeout: Duration::from_secs(scan_timeout_secs),
            connection_timeout: Duration::from_secs(connection_timeout_secs),
            response_timeout: Duration::from_secs(response_timeout_secs),
            retry_max: retry_max.max(1),
            retry_backoff: Duration::from_secs(retry_backoff_secs),
            restore_identifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(overrides: EngineConfigOverrides) -> EngineConfig {
        EngineConfig::new(
            Uuid::nil(),
            Uuid::nil(),
            [0u8; 16],
            [1u8; 16],
            "cred".to_string(),
            overrides,
            None,
        )
    }

    fn no_overrides() -> EngineConfigOverrides {
        EngineConfigOverrides {
            scan_timeout_secs: None,
            connection_timeout_secs: None,
            response_timeout_secs: None,
            retry_max: None,
            retry_backoff_secs: None,
            restore_identifier: None,
        }
    }

    #[test]
    fn defaults_match_spec_table() {
        let cfg = base(no_overrides());
        assert_eq!(cfg.scan_timeout, Duration::from_secs(30));
        assert_eq!(cfg.connection_timeout, Duration::from_secs(5));
        assert_eq!(cfg.response_timeout, Duration::from_secs(3));
        assert_eq!(cfg.retry_max, 3);
        assert_eq!(cfg.retry_backoff, Duration::from_secs(1));
    }

    #[test]
    fn cli_overrides_beat_toml_and_defaults() {
        let toml = TomlConfig {
            scan_timeout_secs: Some(10),
            retry_max: Some(5),
            ..Default::default()
        };
        let mut overrides = no_overrides();
        overrides.scan_timeout_secs = Some(7);
        let cfg = EngineConfig::new(
            Uuid::nil(),
            Uuid::nil(),
            [0u8; 16],
            [1u8; 16],
            "cred".to_string(),
            overrides,
            Some(toml),
        );
        assert_eq!(cfg.scan_timeout, Duration::from_secs(7)); // CLI wins
        assert_eq!(cfg.retry_max, 5); // TOML wins over default
    }

    #[test]
    fn debug_never_prints_device_key_or_credential() {
        let cfg = base(no_overrides());
        let dump = format!("{cfg:?}");
        assert!(!dump.contains("cred"));
        assert!(dump.contains("REDACTED"));
    }
}

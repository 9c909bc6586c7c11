//! Application configuration.
//!
//! Structure comes from a TOML file; secrets come from the environment
//! and are never written to disk. A missing or invalid required value
//! aborts startup before any detector runs.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use autosell_broker::{AccountCredentials, KisApiConfig};
use autosell_core::ModeSchedule;
use autosell_dispatch::MarginTable;
use autosell_poller::{PollingConfig, RateLimitConfig};
use autosell_stream::StreamConfig;
use rust_decimal::Decimal;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Persisted records older than this are not resumed on restart.
    #[serde(default = "default_retention_minutes")]
    pub retention_minutes: i64,
    /// Dedup ledger entries older than this are swept.
    #[serde(default = "default_dedup_retention_minutes")]
    pub dedup_retention_minutes: i64,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("data/order-state.json")
}
fn default_retention_minutes() -> i64 {
    60
}
fn default_dedup_retention_minutes() -> i64 {
    60
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            retention_minutes: default_retention_minutes(),
            dedup_retention_minutes: default_dedup_retention_minutes(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub api: KisApiConfig,
    #[serde(default)]
    pub schedule: ModeSchedule,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub strategy: MarginTable,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Cannot read config file {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| AppError::Config(format!("Invalid config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let s = &self.schedule;
        if s.streaming.is_empty() && s.aggressive.is_empty() && s.smart.is_empty() {
            return Err(AppError::Config(
                "Schedule has no mode windows; the engine would never act".to_string(),
            ));
        }

        for margin in [
            self.strategy.aggressive,
            self.strategy.streaming,
            self.strategy.smart,
        ] {
            if margin < Decimal::ZERO {
                return Err(AppError::Config(format!(
                    "Profit margins must be non-negative, got {margin}"
                )));
            }
        }

        if self.persistence.retention_minutes <= 0 {
            return Err(AppError::Config(
                "persistence.retention_minutes must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Secrets pulled from the environment at startup.
#[derive(Debug, Clone)]
pub struct Secrets {
    pub credentials: AccountCredentials,
    pub access_token: String,
    pub approval_key: String,
}

impl Secrets {
    /// Required: `KIS_APP_KEY`, `KIS_APP_SECRET`, `KIS_ACCOUNT_NO`,
    /// `KIS_ACCESS_TOKEN`, `KIS_APPROVAL_KEY`.
    pub fn from_env() -> AppResult<Self> {
        let app_key = require_env("KIS_APP_KEY")?;
        let app_secret = require_env("KIS_APP_SECRET")?;
        let account_no = require_env("KIS_ACCOUNT_NO")?;
        let access_token = require_env("KIS_ACCESS_TOKEN")?;
        let approval_key = require_env("KIS_APPROVAL_KEY")?;

        let (cano, acnt_prdt_cd) =
            AccountCredentials::parse_account_no(&account_no).map_err(AppError::Config)?;

        Ok(Self {
            credentials: AccountCredentials {
                app_key,
                app_secret,
                cano,
                acnt_prdt_cd,
            },
            access_token,
            approval_key,
        })
    }
}

fn require_env(name: &str) -> AppResult<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::Config(format!(
            "Required environment variable {name} is not set"
        ))),
    }
}

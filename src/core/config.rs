use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::platform::{NativePlatform, Platform};

/// Service configuration, loaded from `config.toml` in the data directory.
/// Every field has a conservative default so a fresh install runs without
/// any manual editing (on-chain collaborators default to demo mode).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub pipeline: PipelineConfig,
    pub wager: WagerConfig,
    pub wallets: WalletConfig,
    pub announcer: AnnouncerConfig,
    pub collaborators: CollaboratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// Token required on run-control routes. Wager routes stay public.
    pub internal_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 17950,
            internal_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_runs_per_day: u32,
    /// Minimum spacing between run *starts*, in milliseconds.
    pub cooldown_ms: i64,
    /// Cron expression for the autonomous daily trigger; None disables it.
    pub auto_run_cron: Option<String>,
    pub calibrate_attempts: u32,
    pub calibrate_backoff_ms: u64,
    /// Process name of the external build tool, used by the orphan sweep.
    pub builder_process_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_runs_per_day: 3,
            cooldown_ms: 4 * 60 * 60 * 1000,
            auto_run_cron: Some("0 0 16 * * *".to_string()),
            calibrate_attempts: 3,
            calibrate_backoff_ms: 15_000,
            builder_process_name: "forgebuild".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WagerConfig {
    pub min_stake: u64,
    pub max_stake: u64,
    /// Winning payout as basis points of the stake (19_400 = 1.94x).
    pub payout_multiplier_bps: u32,
    pub commitment_ttl_ms: i64,
    /// Hard daily cap on net payout losses before new commitments are refused.
    pub daily_loss_cap: u64,
    /// Per-operation payout cap; anything above is queued for manual release.
    pub payout_cap_per_tx: u64,
    /// Max share of the live hot balance one payout may consume, in bps.
    pub hot_spend_cap_bps: u32,
}

impl Default for WagerConfig {
    fn default() -> Self {
        Self {
            min_stake: 10_000_000,
            max_stake: 1_000_000_000,
            payout_multiplier_bps: 19_400,
            commitment_ttl_ms: 2 * 60 * 1000,
            daily_loss_cap: 5_000_000_000,
            payout_cap_per_tx: 2_000_000_000,
            hot_spend_cap_bps: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub reserve_address: String,
    pub hot_address: String,
    pub airlock_address: String,
    pub burn_address: String,
    /// Hot balance below which a top-up from reserve fires.
    pub hot_low_water: u64,
    pub hot_top_up_amount: u64,
    /// Daily cap on total funds moved out of the reserve.
    pub reserve_daily_move_cap: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            reserve_address: String::new(),
            hot_address: String::new(),
            airlock_address: String::new(),
            burn_address: String::new(),
            hot_low_water: 2_000_000_000,
            hot_top_up_amount: 5_000_000_000,
            reserve_daily_move_cap: 20_000_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnouncerConfig {
    /// Kept below the platform's documented hard limit to leave headroom.
    pub max_posts_per_day: u32,
    pub min_interval_ms: i64,
    pub endpoint: Option<String>,
}

impl Default for AnnouncerConfig {
    fn default() -> Self {
        Self {
            max_posts_per_day: 15,
            min_interval_ms: 30 * 60 * 1000,
            endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorConfig {
    pub planner_endpoint: Option<String>,
    /// Command line used to launch the external builder.
    pub build_command: String,
    pub deploy_endpoint: Option<String>,
    pub renderer_endpoint: Option<String>,
    /// On-chain initializer endpoint; None means every run ships in demo mode.
    pub chain_endpoint: Option<String>,
    pub ledger_endpoint: Option<String>,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            planner_endpoint: None,
            build_command: "forgebuild --spec -".to_string(),
            deploy_endpoint: None,
            renderer_endpoint: None,
            chain_endpoint: None,
            ledger_endpoint: None,
        }
    }
}

impl Config {
    /// Load `config.toml` from `data_dir`, writing the default file first if
    /// none exists so operators have something to edit.
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("config.toml");
        if !path.exists() {
            let default = Config::default();
            let rendered =
                toml::to_string_pretty(&default).context("serializing default config")?;
            std::fs::create_dir_all(data_dir)?;
            std::fs::write(&path, rendered)?;
            NativePlatform::restrict_file_permissions(&path);
            return Ok(default);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_announcer_below_platform_limit() {
        let config = Config::default();
        assert!(config.announcer.max_posts_per_day < 17);
        assert!(config.announcer.min_interval_ms >= 60_000);
    }

    #[test]
    fn load_or_create_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = Config::load_or_create(dir.path()).unwrap();
        assert!(dir.path().join("config.toml").exists());
        let second = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(first.api.port, second.api.port);
        assert_eq!(first.wager.min_stake, second.wager.min_stake);
    }

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[wager]\nmin_stake = 42\n",
        )
        .unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config.wager.min_stake, 42);
        assert_eq!(config.api.port, ApiConfig::default().port);
    }
}

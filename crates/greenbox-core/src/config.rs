//! Configuration — TOML file with per-section defaults, plus per-run overrides

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::energy::PowerAssumptions;
use crate::image::ImageRecipe;
use crate::sandbox::ResourceLimits;

/// Environment variable that overrides the config file location
pub const CONFIG_ENV: &str = "GREENBOX_CONFIG";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub runner: RunnerConfig,
    pub image: ImageConfig,
    pub fetch: FetchConfig,
    /// Required before any run; there is no sensible default power model
    pub power: Option<PowerAssumptions>,
    /// Grid carbon intensity in grams CO2 per kWh
    pub co2_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub max_concurrent_runs: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1234,
            cors_origins: vec!["http://localhost:3000".to_string()],
            max_concurrent_runs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub image: String,
    pub container_prefix: String,
    pub user: String,
    pub workdir: String,
    pub code_entrypoint: Option<String>,
    pub wait_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub sample_interval_ms: u64,
    pub max_log_bytes: usize,
    pub limits: ResourceLimits,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            image: "python-sandbox:latest".to_string(),
            container_prefix: "greenbox-run-".to_string(),
            user: "appuser".to_string(),
            workdir: "/app".to_string(),
            code_entrypoint: None,
            wait_timeout_secs: 60,
            stop_timeout_secs: 10,
            sample_interval_ms: 1000,
            max_log_bytes: 1024 * 1024,
            limits: ResourceLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub recipe: ImageRecipe,
    /// Directory holding the dependency manifest for the full recipe
    pub build_context: PathBuf,
    pub manifest: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            recipe: ImageRecipe::Full,
            build_context: PathBuf::from("."),
            manifest: "requirements.txt".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub api_base: String,
    /// Downloaded repositories land under this directory
    pub workspace_root: PathBuf,
    pub branches: Vec<String>,
    pub timeout_secs: u64,
    pub max_archive_mb: u64,
    /// Cap on the total size of the files written out of the archive
    pub max_extracted_mb: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            workspace_root: PathBuf::from("workspace"),
            branches: vec!["main".to_string(), "master".to_string()],
            timeout_secs: 60,
            max_archive_mb: 100,
            max_extracted_mb: 500,
        }
    }
}

/// Default config location: `$GREENBOX_CONFIG`, else `~/.greenbox/config.toml`
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".greenbox").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("greenbox.toml"))
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            info!(
                "No config file at {}, using defaults",
                path.display()
            );
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        let limits = &self.runner.limits;
        if limits.cpu_period == 0 {
            bail!("runner.limits.cpu_period must be greater than zero");
        }
        if limits.cpu_quota == 0 {
            bail!("runner.limits.cpu_quota must be greater than zero");
        }
        if limits.memory_mb == 0 {
            bail!("runner.limits.memory_mb must be greater than zero");
        }
        if self.runner.image.trim().is_empty() {
            bail!("runner.image cannot be empty");
        }
        if self.runner.sample_interval_ms == 0 {
            bail!("runner.sample_interval_ms must be greater than zero");
        }
        if self.runner.wait_timeout_secs == 0 {
            bail!("runner.wait_timeout_secs must be greater than zero");
        }
        if self.server.port == 0 {
            bail!("server.port must be greater than zero");
        }
        if self.server.max_concurrent_runs == 0 {
            bail!("server.max_concurrent_runs must be greater than zero");
        }
        if self.fetch.branches.is_empty() {
            bail!("fetch.branches must name at least one branch");
        }
        if let Some(power) = &self.power {
            check_power_value("power.cpu_per_core_watt", power.cpu_per_core_watt)?;
            check_power_value("power.ram_per_gb_watt", power.ram_per_gb_watt)?;
            check_power_value("power.baseline_container_watt", power.baseline_container_watt)?;
        }
        if let Some(rate) = self.co2_rate {
            check_power_value("co2_rate", rate)?;
        }
        Ok(())
    }

    /// Merge a per-run patch over this config without touching the file
    pub fn resolve(&self, patch: &RunPatch) -> Result<ResolvedRun, ConfigError> {
        let entrypoint = patch
            .code_entrypoint
            .clone()
            .or_else(|| self.runner.code_entrypoint.clone())
            .filter(|e| !e.trim().is_empty())
            .ok_or(ConfigError::Missing("code_entrypoint"))?;

        let base = self.power.as_ref();
        let over = patch.power_assumptions.as_ref();

        let pick = |key: &'static str,
                    from_patch: Option<f64>,
                    from_base: Option<f64>|
         -> Result<f64, ConfigError> {
            let value = from_patch
                .or(from_base)
                .ok_or(ConfigError::Missing(key))?;
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("expected a non-negative number, got {}", value),
                });
            }
            Ok(value)
        };

        let power = PowerAssumptions {
            notes: over
                .and_then(|p| p.notes.clone())
                .or_else(|| base.map(|b| b.notes.clone()))
                .unwrap_or_default(),
            cpu_per_core_watt: pick(
                "power_assumptions.cpu_per_core_watt",
                over.and_then(|p| p.cpu_per_core_watt),
                base.map(|b| b.cpu_per_core_watt),
            )?,
            ram_per_gb_watt: pick(
                "power_assumptions.ram_per_gb_watt",
                over.and_then(|p| p.ram_per_gb_watt),
                base.map(|b| b.ram_per_gb_watt),
            )?,
            baseline_container_watt: pick(
                "power_assumptions.baseline_container_watt",
                over.and_then(|p| p.baseline_container_watt),
                base.map(|b| b.baseline_container_watt),
            )?,
        };

        let co2_rate = match patch.co2_rate.or(self.co2_rate) {
            Some(rate) if !rate.is_finite() || rate < 0.0 => {
                return Err(ConfigError::Invalid {
                    key: "co2_rate",
                    reason: format!("expected a non-negative number, got {}", rate),
                });
            }
            other => other,
        };

        debug!(
            "Resolved run: entrypoint={}, co2_rate={:?}",
            entrypoint, co2_rate
        );

        Ok(ResolvedRun {
            entrypoint,
            power,
            co2_rate,
            code_dir_relative: patch.user_code_dir_relative.clone(),
        })
    }
}

fn check_power_value(key: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        bail!("{} must be a non-negative number, got {}", key, value);
    }
    Ok(())
}

/// Why a per-run patch could not be resolved into a complete run
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("missing required key '{0}'")]
    Missing(&'static str),
    #[error("invalid value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Per-run overrides supplied by a client. Unknown keys are rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunPatch {
    #[serde(default)]
    pub user_code_dir_relative: Option<String>,
    #[serde(default)]
    pub code_entrypoint: Option<String>,
    #[serde(default)]
    pub power_assumptions: Option<PowerPatch>,
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub co2_rate: Option<f64>,
}

/// Partial power model; missing keys fall back to the config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowerPatch {
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub cpu_per_core_watt: Option<f64>,
    #[serde(default)]
    pub ram_per_gb_watt: Option<f64>,
    #[serde(default)]
    pub baseline_container_watt: Option<f64>,
}

/// A config merged with a patch, complete enough to run
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRun {
    pub entrypoint: String,
    pub power: PowerAssumptions,
    pub co2_rate: Option<f64>,
    pub code_dir_relative: Option<String>,
}

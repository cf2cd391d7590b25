//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Tool configuration: logging, calculation defaults, placement criteria."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use lvgrid_calc_engine::{
    options::SimulationOptions,
    placement::{CompensatorSearchCriteria, RegulatorSearchCriteria},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::logging::LogFormat;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_reports_directory() -> PathBuf {
    PathBuf::from("target/reports")
}

/// Primary configuration object for the LV grid tools.
///
/// Every section is optional; an empty file yields the engine defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Defaults for each calculation; project files and CLI flags override them.
    #[serde(default)]
    pub calculation: SimulationOptions,
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub reports: ReportsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "LVGRID_CONFIG";

    /// Load configuration from disk, respecting the `LVGRID_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.calculation
            .validate()
            .context("invalid [calculation] section")?;
        self.placement.validate()?;
        if self.reports.directory.as_os_str().is_empty() {
            return Err(anyhow!("reports directory must not be empty"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlacementConfig {
    #[serde(default)]
    pub compensator: CompensatorSearchCriteria,
    #[serde(default)]
    pub regulator: RegulatorSearchCriteria,
}

impl PlacementConfig {
    pub fn validate(&self) -> Result<()> {
        let compensator = &self.compensator;
        if compensator.min_normalized_impedance > compensator.max_normalized_impedance {
            return Err(anyhow!(
                "compensator impedance window is inverted ({} > {})",
                compensator.min_normalized_impedance,
                compensator.max_normalized_impedance
            ));
        }
        let regulator = &self.regulator;
        if regulator.min_normalized_impedance > regulator.max_normalized_impedance {
            return Err(anyhow!(
                "regulator impedance window is inverted ({} > {})",
                regulator.min_normalized_impedance,
                regulator.max_normalized_impedance
            ));
        }
        if compensator.max_distance_m < 0.0 || regulator.max_distance_m < 0.0 {
            return Err(anyhow!("placement distance caps cannot be negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportsConfig {
    #[serde(default = "default_reports_directory")]
    pub directory: PathBuf,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            directory: default_reports_directory(),
        }
    }
}

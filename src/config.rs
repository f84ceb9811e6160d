// ⚙️ Configuration
//
// Settings sources, highest priority first:
//   1. --config flag
//   2. HOUSING_RECONCILE_CONFIG environment variable
//   3. ./reconcile.toml if present
//   4. Built-in defaults
// The --db flag overrides whatever database path the settings carry.

use crate::error::{Error, Result};
use crate::store::SecondaryIndex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CONFIG_ENV_VAR: &str = "HOUSING_RECONCILE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "reconcile.toml";

/// Deployment environment a pass runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    HousingProduction,
    HousingProductionReadonly,
    HousingStaging,
    HousingDevelopment,
    BaseDevelopment,
    BaseStaging,
    BaseProduction,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::HousingProduction => "housing-production",
            Stage::HousingProductionReadonly => "housing-production-readonly",
            Stage::HousingStaging => "housing-staging",
            Stage::HousingDevelopment => "housing-development",
            Stage::BaseDevelopment => "base-development",
            Stage::BaseStaging => "base-staging",
            Stage::BaseProduction => "base-production",
        }
    }

    /// Short environment name used in parameter paths and file names
    pub fn env_name(&self) -> &'static str {
        match self {
            Stage::HousingDevelopment | Stage::BaseDevelopment => "development",
            Stage::HousingStaging | Stage::BaseStaging => "staging",
            Stage::HousingProduction | Stage::HousingProductionReadonly | Stage::BaseProduction => {
                "production"
            }
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Stage::HousingProductionReadonly)
    }

    pub fn default_database_path(&self) -> PathBuf {
        PathBuf::from("data").join(format!("{}.db", self.as_str()))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableNames {
    pub tenures: String,
    pub assets: String,
    pub persons: String,
}

impl Default for TableNames {
    fn default() -> Self {
        TableNames {
            tenures: "TenureInformation".to_string(),
            assets: "Assets".to_string(),
            persons: "Persons".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexNames {
    pub assets: String,
    pub tenures: String,
}

impl Default for IndexNames {
    fn default() -> Self {
        IndexNames {
            assets: "assets".to_string(),
            tenures: "tenures".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Stage database; `data/<stage>.db` when unset
    pub database_path: Option<PathBuf>,
    pub tables: TableNames,
    pub search_indexes: IndexNames,
    /// Secondary index on the asset table keyed by property reference
    pub asset_index: SecondaryIndex,
    pub page_size: usize,
    pub progress_every: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_path: None,
            tables: TableNames::default(),
            search_indexes: IndexNames::default(),
            asset_index: SecondaryIndex::new("AssetId", "assetId"),
            page_size: 100,
            progress_every: 10,
        }
    }
}

impl Settings {
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(text).map_err(|e| Error::Config(format!("Invalid settings: {}", e)))?;
        if settings.page_size == 0 {
            return Err(Error::Config("page_size must be at least 1".to_string()));
        }
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        let settings = Self::from_toml(&text)?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Pick the settings file by priority. `env_value` is the contents of
    /// `HOUSING_RECONCILE_CONFIG`, passed in so resolution stays testable.
    pub fn locate(flag: Option<&Path>, env_value: Option<&str>, working_dir: &Path) -> Option<PathBuf> {
        if let Some(path) = flag {
            return Some(path.to_path_buf());
        }
        if let Some(value) = env_value.filter(|v| !v.trim().is_empty()) {
            return Some(PathBuf::from(value));
        }
        let local = working_dir.join(DEFAULT_CONFIG_FILE);
        local.is_file().then_some(local)
    }

    pub fn resolve(flag: Option<&Path>, env_value: Option<&str>, working_dir: &Path) -> Result<Self> {
        match Self::locate(flag, env_value, working_dir) {
            Some(path) => Self::from_file(&path),
            None => {
                debug!("No settings file found, using defaults");
                Ok(Settings::default())
            }
        }
    }

    pub fn database_path(&self, stage: Stage) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| stage.default_database_path())
    }
}

//! TOML-based configuration for cubesync.
//!
//! Supports a config file (cubesync.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [layout]
//! base_layout_enabled = true
//! max_combinations = 4096
//!
//! [computed_column]
//! max_name_length = 100
//! display_name_symbols = " _-()%?."
//! auto_adjust = false
//!
//! [store]
//! path = "${HOME}/.cubesync/metadata.db"
//! max_retries = 5
//!
//! [reload]
//! submit_jobs = true
//! ```

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Variable to point at a config file explicitly.
pub const CONFIG_ENV: &str = "CUBESYNC_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("no config file at {0}")]
    FileNotFound(PathBuf),

    #[error("cannot read {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("environment variable {0} is not set")]
    MissingEnvVar(String),

    #[error("{0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub layout: LayoutSettings,
    pub computed_column: ComputedColumnSettings,
    pub store: StoreSettings,
    pub reload: ReloadSettings,
}

/// Layout expansion settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LayoutSettings {
    /// Emit a base layout holding every dimension and measure.
    pub base_layout_enabled: bool,

    /// Upper bound on cuboid combinations per aggregation group.
    pub max_combinations: usize,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            base_layout_enabled: true,
            max_combinations: 4096,
        }
    }
}

/// Computed column naming and conflict settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ComputedColumnSettings {
    pub max_name_length: usize,

    /// Punctuation allowed in display names besides letters and digits.
    pub display_name_symbols: String,

    /// Rename adjustable conflicts instead of rejecting the model.
    pub auto_adjust: bool,
}

impl Default for ComputedColumnSettings {
    fn default() -> Self {
        Self {
            max_name_length: 100,
            display_name_symbols: " _-()%?.".to_string(),
            auto_adjust: false,
        }
    }
}

/// Metadata store settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreSettings {
    /// SQLite database path (supports ${ENV_VAR} expansion).
    pub path: String,

    /// Attempts per transaction before giving up on version conflicts.
    pub max_retries: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: "${HOME}/.cubesync/metadata.db".to_string(),
            max_retries: 5,
        }
    }
}

impl StoreSettings {
    /// Get the store path with environment variables expanded.
    pub fn resolved_path(&self) -> Result<PathBuf, SettingsError> {
        let expanded = expand_env_vars(&self.path)?;
        if expanded.trim().is_empty() {
            return Err(SettingsError::InvalidConfig(
                "store.path must not be empty".to_string(),
            ));
        }
        Ok(PathBuf::from(expanded))
    }
}

/// Reload behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReloadSettings {
    /// Submit build jobs for layouts added or invalidated by a reload.
    pub submit_jobs: bool,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self { submit_jobs: true }
    }
}

impl Settings {
    /// Read and validate one TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => SettingsError::FileNotFound(path.to_path_buf()),
            _ => SettingsError::ReadError {
                path: path.to_path_buf(),
                source,
            },
        })?;
        let settings: Settings =
            toml::from_str(&content).map_err(|source| SettingsError::ParseError {
                path: path.to_path_buf(),
                source,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Settings from `$CUBESYNC_CONFIG`, else the first of `./cubesync.toml`
    /// and `<config dir>/cubesync/config.toml` that exists, else defaults.
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(explicit) = env::var(CONFIG_ENV) {
            return Self::from_file(explicit);
        }
        let candidates = std::iter::once(PathBuf::from("cubesync.toml"))
            .chain(dirs::config_dir().map(|dir| dir.join("cubesync").join("config.toml")));
        for candidate in candidates {
            if candidate.is_file() {
                tracing::debug!(path = %candidate.display(), "loading settings");
                return Self::from_file(&candidate);
            }
        }
        Ok(Settings::default())
    }

    fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |what: &str| Err(SettingsError::InvalidConfig(format!("{} must be positive", what)));
        if self.layout.max_combinations == 0 {
            return invalid("layout.max_combinations");
        }
        if self.computed_column.max_name_length == 0 {
            return invalid("computed_column.max_name_length");
        }
        Ok(())
    }
}

static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}]*)\}|\$([A-Za-z0-9_]+)").expect("valid env reference pattern")
});

/// Substitute `${VAR}` and `$VAR` with the variable's value. A `$` not
/// followed by a name is kept as is.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut missing = None;
    let expanded = ENV_REF.replace_all(s, |caps: &Captures<'_>| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map_or("", |m| m.as_str());
        env::var(name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| name.to_string());
            String::new()
        })
    });
    match missing {
        Some(name) => Err(SettingsError::MissingEnvVar(name)),
        None => Ok(expanded.into_owned()),
    }
}

//! # Configuration Loading
//!
//! Layers configuration from defaults, an optional TOML file and environment
//! variables, then validates the result.
//!
//! Environment variables use the loader's prefix followed by the field path, with
//! `__` separating nesting levels so field names may keep their underscores:
//! `SEQBUS_DISPATCH__KEYED_POOL__LANES=512`.

use crate::{
    config::{schema::SeqbusConfig, validator::ConfigValidator},
    Error, Result,
};
use std::{
    collections::BTreeMap,
    env,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

const CONFIG_FILE_NAMES: [&str; 2] = ["seqbus.toml", "config.toml"];
const NESTING_SEPARATOR: &str = "__";

/// Builds a [`SeqbusConfig`] from defaults, a TOML file and the environment.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
    explicit_file: Option<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    /// Create a loader that searches the working directory, `./config` and the
    /// user configuration directory.
    pub fn new() -> Self {
        let mut search_paths = vec![PathBuf::from("."), PathBuf::from("./config")];
        if let Some(dir) = dirs::config_dir() {
            search_paths.push(dir.join("seqbus"));
        }
        Self { search_paths, explicit_file: None, env_prefix: "SEQBUS".to_string() }
    }

    /// Also look for `seqbus.toml` or `config.toml` in `dir`.
    pub fn with_path(mut self, dir: impl AsRef<Path>) -> Self {
        self.search_paths.push(dir.as_ref().into());
        self
    }

    /// Load this file instead of searching. A missing file is an error.
    pub fn with_file(mut self, file: impl AsRef<Path>) -> Self {
        self.explicit_file = Some(file.as_ref().into());
        self
    }

    /// Prefix that environment overrides must carry. Defaults to `SEQBUS`.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Directories searched when no explicit file is set.
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Current environment prefix.
    pub fn env_prefix(&self) -> &str {
        &self.env_prefix
    }

    /// Resolve every layer and validate the result.
    pub fn load(&self) -> Result<SeqbusConfig> {
        info!("Loading configuration");

        let mut layered = toml::Value::try_from(SeqbusConfig::default())
            .map_err(|e| Error::config(format!("Failed to serialize default config: {e}")))?;
        debug!("Starting from built-in defaults");

        if let Some(path) = self.locate_file()? {
            let overlay = Self::read_toml(&path)?;
            Self::overlay(&mut layered, overlay);
            info!(path = %path.display(), "Loaded configuration file");
        } else {
            debug!("No configuration file found, using defaults and environment");
        }

        let applied = self.apply_env_vars(&mut layered, env::vars());
        debug!(count = applied, "Applied environment variables");

        let config: SeqbusConfig = layered
            .try_into()
            .map_err(|e| Error::config(format!("Failed to deserialize config: {e}")))?;

        ConfigValidator::validate(&config)?;

        info!(strategy = %config.dispatch.strategy, "Configuration loaded and validated");
        Ok(config)
    }

    /// Parse and validate a TOML document without touching files or the environment
    pub fn load_from_str(content: &str) -> Result<SeqbusConfig> {
        let config: SeqbusConfig = toml::from_str(content)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Write `config` as pretty TOML to `path`.
    pub fn save_to_file<P: AsRef<Path>>(config: &SeqbusConfig, path: P) -> Result<()> {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| Error::config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), rendered).map_err(|e| {
            Error::config(format!("Failed to write config to {}: {e}", path.as_ref().display()))
        })?;

        info!(path = %path.as_ref().display(), "Configuration saved");
        Ok(())
    }

    fn locate_file(&self) -> Result<Option<PathBuf>> {
        if let Some(file) = &self.explicit_file {
            if !file.exists() {
                return Err(Error::config(format!(
                    "Configuration file {} does not exist",
                    file.display()
                )));
            }
            return Ok(Some(file.clone()));
        }

        for dir in &self.search_paths {
            for name in CONFIG_FILE_NAMES {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    debug!(path = %candidate.display(), "Found config file");
                    return Ok(Some(candidate));
                }
            }
        }

        Ok(None)
    }

    fn read_toml(path: &Path) -> Result<toml::Value> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        text.parse::<toml::Value>().map_err(|e| {
            Error::config(format!("Failed to parse config file {}: {e}", path.display()))
        })
    }

    fn overlay(base: &mut toml::Value, top: toml::Value) {
        match (base, top) {
            (toml::Value::Table(lower), toml::Value::Table(upper)) => {
                for (key, value) in upper {
                    match lower.get_mut(&key) {
                        Some(existing) if existing.is_table() && value.is_table() => {
                            Self::overlay(existing, value);
                        },
                        _ => {
                            lower.insert(key, value);
                        },
                    }
                }
            },
            (base, top) => *base = top,
        }
    }

    /// Apply every variable carrying this loader's prefix. Returns how many applied.
    fn apply_env_vars<I>(&self, config: &mut toml::Value, vars: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let prefix = self.env_prefix.clone() + "_";
        // Sorted so that overlapping keys apply deterministically.
        let matching: BTreeMap<String, String> = vars
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&prefix).map(|rest| (rest.to_lowercase(), value))
            })
            .collect();

        let mut applied = 0;
        for (key, value) in matching {
            let parts: Vec<&str> = key.split(NESTING_SEPARATOR).filter(|p| !p.is_empty()).collect();
            if parts.is_empty() {
                warn!(variable = %key, "Ignoring environment variable with empty path");
                continue;
            }
            Self::set_nested_value(config, &parts, &value);
            applied += 1;
        }
        applied
    }

    fn set_nested_value(config: &mut toml::Value, parts: &[&str], value: &str) {
        let toml::Value::Table(table) = config else {
            return;
        };

        match parts {
            [] => {},
            [leaf] => {
                table.insert((*leaf).to_string(), Self::parse_env_value(value));
            },
            [head, rest @ ..] => {
                let entry = table
                    .entry((*head).to_string())
                    .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
                Self::set_nested_value(entry, rest, value);
            },
        }
    }

    /// Narrowest TOML type the raw text parses as: bool, integer, float, then string.
    fn parse_env_value(value: &str) -> toml::Value {
        if let Ok(flag) = value.parse::<bool>() {
            return toml::Value::Boolean(flag);
        }
        if let Ok(n) = value.parse::<i64>() {
            return toml::Value::Integer(n);
        }
        if let Ok(x) = value.parse::<f64>() {
            return toml::Value::Float(x);
        }
        toml::Value::String(value.to_string())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

//! Configuration management for kiln
//!
//! Settings are layered: defaults, then the global file, then a `kiln.toml`
//! in the build context, then command-line flags (applied by the CLI).

pub mod schema;

pub use schema::Config;

use crate::error::{KilnError, KilnResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Name of the per-project config file inside a build context
pub const LOCAL_CONFIG_FILE: &str = "kiln.toml";

/// Environment variable overriding the global config path
pub const CONFIG_ENV: &str = "KILN_CONFIG";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager, honoring `KILN_CONFIG`
    pub fn new() -> Self {
        let config_path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_config_path);
        Self { config_path }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiln")
            .join("config.toml")
    }

    /// Load the global configuration, using defaults if the file is missing
    pub async fn load(&self) -> KilnResult<Config> {
        let table = self.load_table(&self.config_path).await?;
        decode(table, &self.config_path)
    }

    /// Load the global configuration with the context's `kiln.toml` merged
    /// over it, table by table
    pub async fn load_for_context(&self, context: &Path) -> KilnResult<Config> {
        let mut merged = self.load_table(&self.config_path).await?;
        let local_path = context.join(LOCAL_CONFIG_FILE);
        let local = self.load_table(&local_path).await?;
        if !local.is_empty() {
            debug!(path = %local_path.display(), "merging project config");
        }
        merge_tables(&mut merged, local);
        decode(merged, &local_path)
    }

    async fn load_table(&self, path: &Path) -> KilnResult<toml::Table> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(toml::Table::new());
        }
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| KilnError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str::<toml::Table>(&content).map_err(|e| KilnError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> KilnResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            KilnError::io(format!("writing config to {}", self.config_path.display()), e)
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Set a dotted key such as `cache.ttl_days` in the global file.
    ///
    /// The value is parsed as a TOML value when possible and stored as a
    /// string otherwise. The result must still form a valid configuration.
    pub async fn set(&self, key: &str, value: &str) -> KilnResult<Config> {
        let mut table = self.load_table(&self.config_path).await?;
        set_dotted(&mut table, key, parse_value(value), &self.config_path)?;
        let config = decode(table, &self.config_path)?;
        self.save(&config).await?;
        Ok(config)
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> KilnResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| KilnError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

fn decode(table: toml::Table, path: &Path) -> KilnResult<Config> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| KilnError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Merge `overlay` into `base`. Nested tables merge key by key; any other
/// value replaces what was there.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn parse_value(raw: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("value = {}", raw))
        .ok()
        .and_then(|mut t| t.remove("value"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

fn set_dotted(table: &mut toml::Table, key: &str, value: toml::Value, path: &Path) -> KilnResult<()> {
    let invalid = |reason: String| KilnError::ConfigInvalid {
        path: path.to_path_buf(),
        reason,
    };
    let (sections, leaf) = match key.rsplit_once('.') {
        Some((sections, leaf)) => (sections.split('.').collect::<Vec<_>>(), leaf),
        None => return Err(invalid(format!("key '{}' must be of the form section.name", key))),
    };

    let mut current = table;
    for section in sections {
        let entry = current
            .entry(section.to_string())
            .or_insert_with(|| toml::Value::Table(toml::Table::new()));
        current = match entry {
            toml::Value::Table(t) => t,
            _ => return Err(invalid(format!("'{}' is not a table", section))),
        };
    }
    current.insert(leaf.to_string(), value);
    Ok(())
}

//! Configuration schema for kiln
//!
//! The global file lives at `~/.config/kiln/config.toml`. A `kiln.toml` in
//! the build context is merged over it.

use crate::family::RuntimeFamily;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Image build settings
    pub build: BuildConfig,

    /// Layer cache settings
    pub cache: CacheConfig,

    /// Local registry settings
    pub registry: RegistryConfig,

    pub python: PythonConfig,

    pub node: NodeConfig,

    pub php: PhpConfig,
}

/// General application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Image build settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Base image reference, or "scratch"
    pub base_image: String,

    /// Dependency destination. Defaults per runtime: `/env` for Python,
    /// `/srv` otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,

    /// Where the application source is placed
    pub app_destination: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<Vec<String>>,

    /// Concurrent per-package builds
    pub jobs: usize,

    /// Force a runtime instead of detecting it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeFamily>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            base_image: "scratch".to_string(),
            destination: None,
            app_destination: "/srv".to_string(),
            entrypoint: None,
            exposed_ports: None,
            jobs: 4,
            runtime: None,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable layer caching (default: true)
    pub enabled: bool,

    /// Share entries across targets through `global_repository`
    pub global: bool,

    /// Per-target cache repository; `<target>/cache` when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,

    pub global_repository: String,

    /// Bump to invalidate every entry
    pub version: String,

    /// Entries older than this are treated as misses
    pub ttl_days: u32,

    /// Cache dependencies one package at a time where supported
    pub per_package: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global: false,
            repository: None,
            global_repository: "kiln-global-cache".to_string(),
            version: "v1".to_string(),
            ttl_days: 7,
            per_package: false,
        }
    }
}

/// Local registry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Root of the on-disk registry
    pub path: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("kiln")
                .join("registry"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PythonConfig {
    /// Interpreter used to create the virtualenv and run pip
    pub interpreter: String,

    /// Version recorded in the interpreter cache key
    pub version: String,
}

impl Default for PythonConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            version: "3".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub tool: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tool: "npm".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhpConfig {
    pub tool: String,
}

impl Default for PhpConfig {
    fn default() -> Self {
        Self {
            tool: "composer".to_string(),
        }
    }
}

//! Runtime family detection
//!
//! Detects which package manager drives an application from the dependency
//! descriptors present in its build context, and knows each family's cache
//! namespaces, vendor directories and build hook conventions.

use crate::context::BuildContext;
use crate::error::{KilnError, KilnResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Name of the descriptor script run as a build hook
pub const BUILD_HOOK: &str = "prepare-image";

/// Supported runtime families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeFamily {
    /// pip (requirements.txt)
    Python,
    /// npm (package.json, package-lock.json)
    Node,
    /// composer (composer.json, composer.lock)
    Php,
}

impl RuntimeFamily {
    /// Descriptor files in the fixed order used for cache keys
    pub fn descriptors(&self) -> &'static [&'static str] {
        match self {
            Self::Python => &["requirements.txt"],
            Self::Node => &["package.json", "package-lock.json"],
            Self::Php => &["composer.json", "composer.lock"],
        }
    }

    /// Directories removed from the scratch tree before installing
    pub fn vendor_dirs(&self) -> &'static [&'static str] {
        match self {
            Self::Python => &[],
            Self::Node => &["node_modules"],
            Self::Php => &["vendor"],
        }
    }

    /// Environment set while a build hook runs
    pub fn dev_env(&self) -> Option<(&'static str, &'static str)> {
        match self {
            Self::Python => None,
            Self::Node => Some(("NODE_ENV", "development")),
            Self::Php => Some(("COMPOSER_DEV_MODE", "1")),
        }
    }

    /// Where dependencies land inside the image unless configured otherwise
    pub fn default_destination(&self) -> &'static str {
        match self {
            Self::Python => "/env",
            Self::Node | Self::Php => "/srv",
        }
    }

    /// Whether an interpreter layer is built below the dependencies
    pub fn has_interpreter(&self) -> bool {
        matches!(self, Self::Python)
    }

    /// Whether dependencies can be cached one package at a time
    pub fn supports_per_package(&self) -> bool {
        matches!(self, Self::Python | Self::Node)
    }

    pub fn interpreter_namespace(&self) -> String {
        format!("{}-interpreter", self)
    }

    pub fn dependency_namespace(&self) -> String {
        format!("{}-dependencies", self)
    }

    pub fn package_namespace(&self) -> String {
        format!("{}-package", self)
    }

    /// All families in detection priority order
    pub fn all() -> &'static [Self] {
        &[Self::Python, Self::Node, Self::Php]
    }

    /// First family with a descriptor present in the context
    pub fn detect(context: &dyn BuildContext) -> Option<Self> {
        let family = Self::all()
            .iter()
            .copied()
            .find(|f| f.descriptors().iter().any(|d| context.contains(d)));
        debug!(family = ?family, "detected runtime family");
        family
    }

    /// Descriptor files present in the context, in fixed order
    pub fn present_descriptors(&self, context: &dyn BuildContext) -> Vec<&'static str> {
        self.descriptors()
            .iter()
            .copied()
            .filter(|d| context.contains(d))
            .collect()
    }

    /// Whether the primary descriptor declares the build hook script
    pub fn declares_hook(&self, context: &dyn BuildContext) -> KilnResult<bool> {
        let descriptor = match self {
            Self::Python => return Ok(false),
            Self::Node => "package.json",
            Self::Php => "composer.json",
        };
        if !context.contains(descriptor) {
            return Ok(false);
        }
        let bytes = context.get_file(descriptor)?;
        let value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| KilnError::DescriptorInvalid {
                path: descriptor.to_string(),
                reason: e.to_string(),
            })?;
        Ok(value
            .get("scripts")
            .and_then(|s| s.get(BUILD_HOOK))
            .is_some())
    }
}

impl fmt::Display for RuntimeFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Python => "python",
            Self::Node => "node",
            Self::Php => "php",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for RuntimeFamily {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" | "pip" => Ok(Self::Python),
            "node" | "npm" => Ok(Self::Node),
            "php" | "composer" => Ok(Self::Php),
            other => Err(KilnError::User(format!("unknown runtime '{}'", other))),
        }
    }
}

//! CLI argument definitions using clap derive

use crate::family::RuntimeFamily;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

/// Kiln - daemonless, layer-cached image builder
///
/// Builds OCI images for Python, Node and PHP applications without a
/// container daemon, reusing dependency layers across builds.
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build an application directory into an image
    Build(BuildArgs),

    /// Inspect and prune the layer cache
    Cache(CacheArgs),

    /// Show or edit configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions {
        /// Target shell
        shell: Shell,
    },
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Application directory (defaults to current directory)
    #[arg(default_value = ".")]
    pub context: PathBuf,

    /// Target image reference (repository:tag)
    #[arg(short, long)]
    pub target: String,

    /// Base image reference, or "scratch"
    #[arg(short, long)]
    pub base: Option<String>,

    /// Write an OCI layout tarball instead of pushing
    #[arg(long)]
    pub tarball: Option<PathBuf>,

    /// Force a runtime instead of detecting it
    #[arg(long)]
    pub runtime: Option<RuntimeFamily>,

    /// Disable the layer cache for this build
    #[arg(long)]
    pub no_cache: bool,

    /// Share cache entries across targets
    #[arg(long, conflicts_with = "no_cache")]
    pub global_cache: bool,

    /// Cache dependencies one package at a time where supported
    #[arg(long, conflicts_with = "no_cache")]
    pub per_package: bool,

    /// Image entrypoint (repeat for each argument)
    #[arg(long, num_args = 1..)]
    pub entrypoint: Option<Vec<String>>,

    /// Exposed port, e.g. 8080 or 53/udp
    #[arg(short, long = "port")]
    pub ports: Vec<String>,

    /// Dependency destination inside the image
    #[arg(long)]
    pub destination: Option<String>,

    /// Concurrent per-package builds
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Abort the build after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Output format for the build report
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., cache.ttl_days)
        key: String,
        /// Value to set
        value: String,
    },
}

/// Output format for listings and reports
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Cache repository (defaults to the global cache repository)
    #[arg(short, long, global = true)]
    pub repository: Option<String>,

    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cache entries
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Remove old cache entries
    Gc {
        /// Remove entries older than N days (default: cache.ttl_days)
        #[arg(long)]
        days: Option<u32>,

        /// Dry run - show what would be removed
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove every cache entry
    Clear {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_build() {
        let cli = Cli::parse_from([
            "kiln", "build", "app", "--target", "team/app:v1", "--port", "8080", "--no-cache",
        ]);
        match cli.command {
            Commands::Build(args) => {
                assert_eq!(args.context, PathBuf::from("app"));
                assert_eq!(args.target, "team/app:v1");
                assert_eq!(args.ports, vec!["8080"]);
                assert!(args.no_cache);
                assert!(args.tarball.is_none());
            }
            _ => panic!("expected Build command"),
        }
    }

    #[test]
    fn cli_parses_build_runtime_and_entrypoint() {
        let cli = Cli::parse_from([
            "kiln", "build", "--target", "app", "--runtime", "node", "--entrypoint", "node",
            "server.js",
        ]);
        match cli.command {
            Commands::Build(args) => {
                assert_eq!(args.runtime, Some(RuntimeFamily::Node));
                assert_eq!(
                    args.entrypoint,
                    Some(vec!["node".to_string(), "server.js".to_string()])
                );
                assert_eq!(args.context, PathBuf::from("."));
            }
            _ => panic!("expected Build command"),
        }
    }

    #[test]
    fn no_cache_conflicts_with_global_cache() {
        let result = Cli::try_parse_from([
            "kiln", "build", "--target", "app", "--no-cache", "--global-cache",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_parses_cache_gc() {
        let cli = Cli::parse_from(["kiln", "cache", "gc", "--days", "3", "--dry-run"]);
        match cli.command {
            Commands::Cache(CacheArgs {
                action: CacheAction::Gc { days, dry_run },
                ..
            }) => {
                assert_eq!(days, Some(3));
                assert!(dry_run);
            }
            _ => panic!("expected Cache Gc command"),
        }
    }

    #[test]
    fn cli_parses_config_set() {
        let cli = Cli::parse_from(["kiln", "config", "set", "cache.ttl_days", "14"]);
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigArgs {
                action: Some(ConfigAction::Set { .. })
            })
        ));
    }

    #[test]
    fn cli_parses_completions() {
        let cli = Cli::parse_from(["kiln", "completions", "bash"]);
        assert!(matches!(
            cli.command,
            Commands::Completions { shell: Shell::Bash }
        ));
    }
}

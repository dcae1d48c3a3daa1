use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ConfigOverrides;
use crate::scheduler::ExhaustedPolicy;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (searched for in the standard locations when omitted)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Set log level (overrides the config file)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Set log format, text or json (overrides the config file)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Increase verbosity
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize configuration file
    Init {
        /// Don't prompt for input, use defaults
        #[arg(long)]
        no_prompt: bool,

        /// Force overwrite if config file exists
        #[arg(long)]
        force: bool,
    },

    /// List configured endpoints in failover order
    Endpoints {
        /// Show quota usage recorded in this checkpoint
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Dispatch a batch of requests read as JSON lines
    Run {
        /// File holding one request per line (stdin when omitted)
        #[arg(long)]
        requests: Option<PathBuf>,

        /// Where to persist concurrency and quota state between runs
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Answer every request locally instead of contacting endpoints
        #[arg(long)]
        dry_run: bool,

        /// Lower bound on in-flight requests
        #[arg(long)]
        min_concurrency: Option<usize>,

        /// Upper bound on in-flight requests
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Per-request timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Drop requests that find every endpoint exhausted instead of requeueing them
        #[arg(long)]
        drop_exhausted: bool,
    },
}

impl Commands {
    /// Config values set on the command line
    #[must_use]
    pub const fn overrides(&self) -> ConfigOverrides {
        match self {
            Self::Run {
                min_concurrency,
                max_concurrency,
                timeout,
                drop_exhausted,
                ..
            } => ConfigOverrides {
                min_concurrency: *min_concurrency,
                max_concurrency: *max_concurrency,
                timeout_seconds: *timeout,
                on_exhausted: if *drop_exhausted {
                    Some(ExhaustedPolicy::Drop)
                } else {
                    None
                },
            },
            Self::Init { .. } | Self::Endpoints { .. } => ConfigOverrides {
                min_concurrency: None,
                max_concurrency: None,
                timeout_seconds: None,
                on_exhausted: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_overrides() {
        let cli = Cli::parse_from([
            "turnstile",
            "run",
            "--max-concurrency",
            "4",
            "--timeout",
            "3",
            "--drop-exhausted",
        ]);
        let overrides = cli.command.overrides();
        assert_eq!(overrides.max_concurrency, Some(4));
        assert_eq!(overrides.min_concurrency, None);
        assert_eq!(overrides.timeout_seconds, Some(3));
        assert_eq!(overrides.on_exhausted, Some(ExhaustedPolicy::Drop));
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::parse_from(["turnstile", "endpoints", "--config", "/tmp/t.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/t.toml")));
        assert_eq!(cli.command.overrides(), ConfigOverrides::default());
    }
}

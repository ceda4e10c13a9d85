use clap::{Parser, Subcommand};

use std::path::PathBuf;

use super::constants::{
    ENV_AGENT, ENV_API_KEY, ENV_CONFIG, ENV_SCOPE, ENV_SOURCE, ENV_TIME_RANGE, ENV_TIMEOUT_SECS,
    ENV_URL,
};
use crate::data::types::TimeRange;

#[derive(Parser)]
#[command(name = "storewatch")]
#[command(version, about = "Live telemetry for agent sessions", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Telemetry backend base URL
    #[arg(long, short = 'u', global = true, env = ENV_URL)]
    pub url: Option<String>,

    /// API key sent as a bearer token
    #[arg(long, global = true, env = ENV_API_KEY, hide_env_values = true)]
    pub api_key: Option<String>,

    /// Store/tenant scope to watch
    #[arg(long, short = 's', global = true, env = ENV_SCOPE)]
    pub scope: Option<String>,

    /// Fetch timeout in seconds
    #[arg(long, global = true, env = ENV_TIMEOUT_SECS)]
    pub timeout_secs: Option<u64>,

    /// Time range: 1h, 24h, 7d or FROM..TO (RFC 3339)
    #[arg(long, short = 'r', global = true, env = ENV_TIME_RANGE, value_parser = parse_time_range)]
    pub range: Option<TimeRange>,

    /// Only sessions from this source
    #[arg(long, global = true, env = ENV_SOURCE)]
    pub source: Option<String>,

    /// Only sessions run by this agent
    #[arg(long, global = true, env = ENV_AGENT)]
    pub agent: Option<String>,

    /// Only sessions with at least one failed span
    #[arg(long, global = true)]
    pub only_errors: bool,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,
}

/// Parse time range from CLI/env string
fn parse_time_range(s: &str) -> Result<TimeRange, String> {
    s.parse::<TimeRange>()
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Follow the scope live and log a summary on every change (default command)
    Watch,
    /// Print stats for the current filters as JSON
    Stats,
    /// Compare one span with its tool's recent history
    Compare {
        /// Span id from the current window
        span_id: String,
    },
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub scope: Option<String>,
    pub timeout_secs: Option<u64>,
    pub range: Option<TimeRange>,
    pub source: Option<String>,
    pub agent: Option<String>,
    pub only_errors: Option<bool>,
    pub config: Option<PathBuf>,
}

impl From<Cli> for CliConfig {
    fn from(cli: Cli) -> Self {
        Self {
            url: cli.url,
            api_key: cli.api_key,
            scope: cli.scope,
            timeout_secs: cli.timeout_secs,
            range: cli.range,
            source: cli.source,
            agent: cli.agent,
            // An absent flag leaves the file config in charge
            only_errors: cli.only_errors.then_some(true),
            config: cli.config,
        }
    }
}

/// Parse CLI arguments and return config with command
pub fn parse() -> (CliConfig, Option<Commands>) {
    let mut cli = Cli::parse();
    let command = cli.command.take();
    (CliConfig::from(cli), command)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_from(args: &[&str]) -> (CliConfig, Option<Commands>) {
        let mut cli = Cli::try_parse_from(args).unwrap();
        let command = cli.command.take();
        (CliConfig::from(cli), command)
    }

    #[test]
    fn test_default_command_is_none() {
        let (config, command) = parse_from(&["storewatch"]);
        assert!(command.is_none());
        assert!(config.only_errors.is_none());
    }

    #[test]
    fn test_compare_with_global_flags() {
        let (config, command) =
            parse_from(&["storewatch", "compare", "span-9", "--scope", "store-1", "-r", "7d"]);
        assert_eq!(
            command,
            Some(Commands::Compare {
                span_id: "span-9".into()
            })
        );
        assert_eq!(config.scope.as_deref(), Some("store-1"));
        assert_eq!(config.range, Some(TimeRange::Last7Days));
    }

    #[test]
    fn test_only_errors_flag() {
        let (config, command) = parse_from(&["storewatch", "stats", "--only-errors"]);
        assert_eq!(command, Some(Commands::Stats));
        assert_eq!(config.only_errors, Some(true));
    }

    #[test]
    fn test_invalid_range_rejected() {
        assert!(Cli::try_parse_from(["storewatch", "--range", "3w"]).is_err());
    }
}

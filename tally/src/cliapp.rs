//! Definition of the command line interface.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tally_analytics::{Operation, ResourceId};

/// Usage analytics aggregation for downloadable resources.
#[derive(Debug, Parser)]
#[command(name = "tally", version, max_term_width = 79)]
pub struct Cli {
    /// The path to the config folder.
    #[arg(long, short = 'c', global = true, env = "TALLY_CONFIG", default_value = ".")]
    pub config: PathBuf,

    /// Redis server URL, replacing the configured redis section.
    #[arg(long, global = true, env = "TALLY_REDIS_URL")]
    pub redis_url: Option<String>,

    /// The log level, one of "error", "warn", "info", "debug", "trace" or "off".
    #[arg(long, global = true, env = "TALLY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Offset of the service timezone east of UTC in seconds.
    #[arg(long, global = true, env = "TALLY_UTC_OFFSET", allow_hyphen_values = true)]
    pub utc_offset: Option<String>,

    /// Seconds granted to services to drain on a graceful shutdown.
    #[arg(long, global = true, env = "TALLY_SHUTDOWN_TIMEOUT")]
    pub shutdown_timeout: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the ingestion and compaction services.
    ///
    /// This runs in the foreground until it receives a termination signal. With `--events`, it
    /// records one JSON event per line and shuts down gracefully at the end of the input.
    Run {
        /// Newline-delimited JSON events to record, or `-` for stdin.
        #[arg(long)]
        events: Option<PathBuf>,
    },

    /// Run a single compaction pass and print its report.
    Compact {
        /// Stop scanning after this many seconds.
        #[arg(long)]
        deadline_secs: Option<u64>,
    },

    /// Record a single access and print whether it was the client's first today.
    Record(RecordArgs),

    /// Query aggregated statistics.
    #[command(subcommand)]
    Query(QueryCommand),

    /// Manage the configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

/// A resource and operation pair.
#[derive(Args, Clone, Copy, Debug)]
pub struct Target {
    /// The resource identifier.
    #[arg(long)]
    pub resource: ResourceId,

    /// The operation: "download", "update" or "page_view".
    #[arg(long)]
    pub operation: Operation,
}

#[derive(Args, Debug)]
pub struct RecordArgs {
    #[command(flatten)]
    pub target: Target,

    /// Client address.
    #[arg(long)]
    pub ip: std::net::IpAddr,

    /// Authenticated user, `0` for anonymous.
    #[arg(long)]
    pub subject: Option<i64>,

    /// Client user agent.
    #[arg(long, default_value = "")]
    pub user_agent: String,

    /// Token identifying an anonymous visitor.
    #[arg(long, default_value = "")]
    pub token: String,
}

#[derive(Debug, Subcommand)]
pub enum QueryCommand {
    /// Daily unique visitors, unique users and page views.
    Day {
        #[command(flatten)]
        target: Target,

        /// Number of days to return.
        #[arg(long, default_value = "7")]
        days: u32,

        /// Last day of the series, defaults to today.
        #[arg(long)]
        end: Option<NaiveDate>,
    },

    /// Page views per minute over the realtime window.
    Realtime {
        #[command(flatten)]
        target: Target,
    },

    /// Unique visitors over the seven days before a date.
    Weekly {
        #[command(flatten)]
        target: Target,

        /// Day after the window, defaults to today.
        #[arg(long)]
        end: Option<NaiveDate>,
    },

    /// Resources with the most folded realtime views on a day.
    Rank {
        /// The operation: "download", "update" or "page_view".
        #[arg(long)]
        operation: Operation,

        /// The day, defaults to today.
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Maximum number of resources.
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// All-time page views of a resource.
    Total {
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration as YAML.
    Show,
}

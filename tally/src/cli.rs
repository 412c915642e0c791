use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tally_analytics::{
    Analytics, AnalyticsHandle, AnalyticsStore, Clock, CompactionReport, Event, LogSink,
    MemoryStore, Operation, RedisStore, ResourceId, SystemClock,
};
use tally_config::{Config, OverridableConfig};
use tally_redis::AsyncRedisPool;
use tally_system::Controller;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use crate::cliapp::{Cli, Command, ConfigCommand, QueryCommand, RecordArgs};
use crate::setup;

/// A line of the event input of `tally run --events`.
///
/// Events without a timestamp are stamped on arrival.
#[derive(Debug, Deserialize)]
struct EventLine {
    resource: ResourceId,
    operation: Operation,
    #[serde(default)]
    subject_id: Option<i64>,
    client_ip: IpAddr,
    #[serde(default)]
    user_agent: String,
    #[serde(default)]
    dedup_token: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl EventLine {
    fn into_event(self, now: DateTime<Utc>) -> Event {
        Event {
            resource: self.resource,
            operation: self.operation,
            subject_id: self.subject_id,
            client_ip: self.client_ip,
            user_agent: self.user_agent,
            dedup_token: self.dedup_token,
            timestamp: self.timestamp.unwrap_or(now),
        }
    }
}

#[derive(Debug, Serialize)]
struct RecordOutput {
    first_today: bool,
}

#[derive(Debug, Serialize)]
struct ReportOutput {
    sketches_scanned: u64,
    snapshots_written: u64,
    expiries_set: u64,
    realtime_keys_scanned: u64,
    minutes_folded: u64,
    complete: bool,
}

impl From<CompactionReport> for ReportOutput {
    fn from(report: CompactionReport) -> Self {
        Self {
            sketches_scanned: report.sketches_scanned,
            snapshots_written: report.snapshots_written,
            expiries_set: report.expiries_set,
            realtime_keys_scanned: report.realtime_keys_scanned,
            minutes_folded: report.minutes_folded,
            complete: report.complete,
        }
    }
}

#[derive(Debug, Serialize)]
struct RankEntry {
    resource: ResourceId,
    views: u64,
}

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_path(&cli.config)?;
    config.apply_override(OverridableConfig {
        redis_url: cli.redis_url,
        log_level: cli.log_level,
        utc_offset_secs: cli.utc_offset,
        shutdown_timeout: cli.shutdown_timeout,
    })?;

    if let Command::Config(ConfigCommand::Show) = cli.command {
        return print_raw(&config.to_yaml_string()?);
    }

    setup::check_config(&config)?;
    setup::init_logging(&config);
    setup::init_metrics(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("tally")
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;

    runtime.block_on(dispatch(config, cli.command))
}

/// Selects the store and runs the command on it.
async fn dispatch(config: Config, command: Command) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match config.redis() {
        Some(redis) => {
            let pool = AsyncRedisPool::from_config(redis).context("invalid redis configuration")?;
            run_command(RedisStore::new(pool), &config, clock, command).await
        }
        None => {
            tally_log::warn!("no redis configured, analytics are kept in memory and lost on exit");
            let store = MemoryStore::new(clock.clone());
            run_command(store, &config, clock, command).await
        }
    }
}

async fn run_command<S: AnalyticsStore>(
    store: S,
    config: &Config,
    clock: Arc<dyn Clock>,
    command: Command,
) -> Result<()> {
    let analytics = Analytics::new(store, config.analytics().clone(), clock)?;

    match command {
        Command::Run { events } => run(&analytics, config, events.as_deref()).await,
        Command::Compact { deadline_secs } => {
            let deadline = deadline_secs
                .map(Duration::from_secs)
                .or(config.analytics().compaction_deadline())
                .map(|deadline| tokio::time::Instant::now() + deadline);

            let report = analytics.compactor().run_once(deadline).await?;
            print_json(&ReportOutput::from(report))
        }
        Command::Record(args) => record(&analytics, args).await,
        Command::Query(query) => run_query(&analytics, query).await,
        Command::Config(ConfigCommand::Show) => print_raw(&config.to_yaml_string()?),
    }
}

async fn run<S: AnalyticsStore>(
    analytics: &Analytics<S>,
    config: &Config,
    events: Option<&Path>,
) -> Result<()> {
    setup::dump_spawn_infos(config);

    let controller = Controller::new(config.shutdown_timeout());
    let (handle, ingestion) = analytics.start_ingestion(LogSink, controller.shutdown_handle());
    let (_compaction, compaction) = analytics.start_compaction(controller.shutdown_handle());

    let shutdown = match events {
        Some(path) => {
            tokio::select! {
                result = feed_events(&handle, analytics, path) => {
                    result?;
                    tally_log::info!("end of event input, shutting down");
                    controller.shutdown(Some(controller.timeout()));
                    controller.shutdown_handle().notified().await
                }
                result = controller.wait_for_signal() => result?,
            }
        }
        None => controller.wait_for_signal().await?,
    };

    // Drop the last sender so the ingestion service only waits for queued events.
    drop(handle);

    match shutdown.timeout {
        Some(timeout) => {
            if tokio::time::timeout(timeout, join_services(ingestion, compaction))
                .await
                .is_err()
            {
                tally_log::warn!("services did not stop within {}s", timeout.as_secs());
            }
        }
        None => tally_log::info!("forced shutdown, queued events are dropped"),
    }

    Ok(())
}

async fn join_services(ingestion: JoinHandle<()>, compaction: JoinHandle<()>) {
    let (ingestion, compaction) = tokio::join!(ingestion, compaction);
    for result in [ingestion, compaction] {
        if let Err(error) = result {
            tally_log::error!(error = &error as &dyn std::error::Error, "service panicked");
        }
    }
}

/// Enqueues events from newline-delimited JSON until the end of the input.
///
/// Invalid lines are logged and skipped.
async fn feed_events<S: AnalyticsStore>(
    handle: &AnalyticsHandle,
    analytics: &Analytics<S>,
    path: &Path,
) -> Result<()> {
    let reader: Box<dyn AsyncRead + Send + Unpin> = if path.as_os_str() == "-" {
        Box::new(tokio::io::stdin())
    } else {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("failed to open event input {}", path.display()))?;
        Box::new(file)
    };

    let mut lines = BufReader::new(reader).lines();
    let mut line_no = 0u64;
    let mut enqueued = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let event = match serde_json::from_str::<EventLine>(&line) {
            Ok(event) => event.into_event(analytics.calendar().now()),
            Err(error) => {
                tally_log::warn!(
                    error = &error as &dyn std::error::Error,
                    line = line_no,
                    "skipping invalid event"
                );
                continue;
            }
        };

        // The response is not needed, the ingestion service logs failures.
        handle.enqueue(event).await?;
        enqueued += 1;
    }

    tally_log::info!("enqueued {enqueued} events");
    Ok(())
}

async fn record<S: AnalyticsStore>(analytics: &Analytics<S>, args: RecordArgs) -> Result<()> {
    let event = Event {
        resource: args.target.resource,
        operation: args.target.operation,
        subject_id: args.subject,
        client_ip: args.ip,
        user_agent: args.user_agent,
        dedup_token: args.token,
        timestamp: analytics.calendar().now(),
    };

    let first_today = analytics.recorder().apply(&event).await?;
    print_json(&RecordOutput { first_today })
}

async fn run_query<S: AnalyticsStore>(analytics: &Analytics<S>, query: QueryCommand) -> Result<()> {
    let assembler = analytics.query();
    let today = analytics.calendar().today();

    match query {
        QueryCommand::Day { target, days, end } => {
            let end = end.unwrap_or(today);
            let series = assembler
                .day_series(target.resource, target.operation, days, end)
                .await?;
            print_json(&series)
        }
        QueryCommand::Realtime { target } => {
            let series = assembler
                .realtime_series(target.resource, target.operation)
                .await?;
            print_json(&series)
        }
        QueryCommand::Weekly { target, end } => {
            let end = end.unwrap_or(today);
            let visitors = assembler
                .weekly_unique(target.resource, target.operation, end)
                .await?;
            print_json(&visitors)
        }
        QueryCommand::Rank {
            operation,
            date,
            limit,
        } => {
            let rank = assembler
                .daily_rank(operation, date.unwrap_or(today), limit)
                .await?;
            let rank: Vec<_> = rank
                .into_iter()
                .map(|(resource, views)| RankEntry { resource, views })
                .collect();
            print_json(&rank)
        }
        QueryCommand::Total { target } => {
            let total = assembler
                .total_views(target.resource, target.operation)
                .await?;
            print_json(&total)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    print_raw(&json)
}

fn print_raw(output: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", output.trim_end())?;
    Ok(())
}

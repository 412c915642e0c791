use anyhow::{Context, Result};
use tally_config::Config;
use tally_statsd::MetricsConfig;

/// Validates settings that parse fine but cannot work at runtime.
pub fn check_config(config: &Config) -> Result<()> {
    let analytics = config.analytics();

    if analytics.key_prefix.is_empty() || analytics.key_prefix.contains('*') {
        anyhow::bail!(
            "the configured `analytics.key_prefix` must be non-empty and must not contain '*'"
        );
    }

    if u64::from(analytics.realtime_minutes()) * 60 > 86_400 {
        anyhow::bail!("the configured `analytics.realtime_minutes` must not exceed one day");
    }

    Ok(())
}

/// Initializes the logging system.
pub fn init_logging(config: &Config) {
    tally_log::init(config.logging());
}

/// Prints spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().as_os_str().is_empty() {
        tally_log::info!("launching tally without config folder");
    } else {
        tally_log::info!(
            "launching tally from config folder {}",
            config.path().display()
        );
    }

    let analytics = config.analytics();
    tally_log::info!("  log level: {}", config.logging().level);
    tally_log::info!("  key prefix: {}", analytics.key_prefix);
    tally_log::info!("  utc offset: {}s", analytics.utc_offset_secs);
    match config.redis() {
        Some(_) => tally_log::info!("  store: redis"),
        None => tally_log::info!("  store: memory"),
    }
}

/// Initializes the metric system.
pub fn init_metrics(config: &Config) -> Result<()> {
    let metrics = config.metrics();
    let Some(host) = metrics.statsd.as_deref() else {
        return Ok(());
    };

    let mut default_tags = metrics.default_tags.clone();
    if let Some(hostname_tag) = metrics.hostname_tag.as_deref()
        && let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok())
    {
        default_tags.insert(hostname_tag.to_owned(), hostname);
    }

    tally_statsd::init(MetricsConfig {
        prefix: metrics.prefix.clone(),
        host: host.to_owned(),
        default_tags,
        sample_rate: metrics.sample_rate,
    })
    .context("failed to initialize metrics")?;

    Ok(())
}

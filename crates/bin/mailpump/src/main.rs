//! Main entrypoint.

use std::time::Duration;

use color_eyre::eyre::{WrapErr as _, eyre};
use tokio::sync::mpsc;

use config_core::{LogFormat, PumpSettings};
use flag_counter::FlagCounter;

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;

    let mode = std::env::args().nth(1).unwrap_or_else(|| "run".to_string());
    match mode.as_str() {
        "run" => run().await,
        "run-multi" => run_multi().await,
        other => Err(eyre!("unknown command: {other} (expected run or run-multi)")),
    }
}

/// Single source, single destination, configured from the environment.
async fn run() -> color_eyre::eyre::Result<()> {
    let config = config_load::run_from_env()?;
    init_logging(&config.log_level, config.log_format);

    tracing::info!(
        source_url = %config.source.url,
        source_username = %config.source.username,
        source_auth_method = ?config.source.auth_method,
        dest_url = %config.dest.url,
        dest_username = %config.dest.username,
        dest_auth_method = ?config.dest.auth_method,
        log_level = %config.log_level,
        log_format = ?config.log_format,
        "starting"
    );

    let source = config
        .source
        .resolve()
        .await
        .wrap_err("resolving source configuration")?;
    let dest = config
        .dest
        .resolve()
        .await
        .wrap_err("resolving destination configuration")?;

    let mut stop = FlagCounter::new();
    let (done_tx, mut done_rx) = mpsc::channel(1);

    let (idle_fallback_interval, batch_size, fetch_buffer_size, fetch_max_interval) =
        knobs(&config.settings);
    let pump = pump::MailPump::new(pump::Config {
        source,
        dest,
        idle_fallback_interval,
        batch_size,
        fetch_buffer_size,
        fetch_max_interval,
        disable_deletions: config.settings.disable_deletions,
        stop: stop.gate(),
        done: done_tx,
    });

    wait_for_shutdown(&mut stop, &mut done_rx).await?;
    pump.close().await;
    tracing::info!("pump terminated");

    Ok(())
}

/// Many sources, one destination, configured from a JSON file.
async fn run_multi() -> color_eyre::eyre::Result<()> {
    let path = match std::env::args().nth(2) {
        Some(path) => path,
        None => envfury::or("MAILPUMP_CONFIG", "config.json".to_string())?,
    };

    let config = if path == "-" {
        config_load::load_multi_from_stdin().await?
    } else {
        config_load::load_multi_from_path(&path).await?
    };

    init_logging(
        config.log_level.as_deref().unwrap_or("info"),
        config.log_format.unwrap_or_default(),
    );

    let destination = config
        .destination
        .resolve()
        .await
        .wrap_err("resolving destination configuration")?;

    let mut sources = Vec::with_capacity(config.sources.len());
    let mut target_mailboxes = Vec::with_capacity(config.sources.len());
    for (name, entry) in &config.sources {
        tracing::info!(
            source = %name,
            url = %entry.connection.url,
            target_mailbox = %entry.target_mailbox,
            "configuring source"
        );

        let connection = entry
            .connection
            .resolve()
            .await
            .wrap_err_with(|| format!("resolving source {name}"))?;

        let (idle_fallback_interval, batch_size, fetch_buffer_size, fetch_max_interval) =
            knobs(&entry.settings);
        sources.push(multi_pump::SourceConfig {
            connection,
            idle_fallback_interval,
            batch_size,
            fetch_buffer_size,
            fetch_max_interval,
            disable_deletions: entry.settings.disable_deletions,
        });
        target_mailboxes.push(entry.target_mailbox.clone());
    }

    let mut stop = FlagCounter::new();
    let (done_tx, mut done_rx) = mpsc::channel(1);

    let pump = multi_pump::MultiPump::new(multi_pump::Config {
        destination,
        sources,
        target_mailboxes,
        stop: stop.gate(),
        done: done_tx,
    })?;

    wait_for_shutdown(&mut stop, &mut done_rx).await?;
    pump.close().await;
    tracing::info!("pump terminated");

    Ok(())
}

/// Convert configured knobs into durations and sizes.
fn knobs(
    settings: &PumpSettings,
) -> (
    Option<Duration>,
    Option<usize>,
    Option<usize>,
    Option<Duration>,
) {
    (
        settings.idle_fallback_interval_secs.map(Duration::from_secs),
        settings.batch_size,
        settings.fetch_buffer_size,
        settings.fetch_max_interval_secs.map(Duration::from_secs),
    )
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
    }
}

/// Block until the pump finishes or an interrupt asks it to stop.
///
/// The first SIGINT/SIGTERM requests a graceful stop; a second one forces
/// the process down.
async fn wait_for_shutdown(
    stop: &mut FlagCounter,
    done_rx: &mut mpsc::Receiver<()>,
) -> color_eyre::eyre::Result<()> {
    let mut sigint =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let mut sigcount = 0u32;
    loop {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
            _ = done_rx.recv() => return Ok(()),
        }

        sigcount += 1;
        if sigcount > 1 {
            tracing::warn!("received interrupt, forcing exit");
            std::process::exit(1);
        }

        tracing::info!("received interrupt");
        stop.flag();
    }
}

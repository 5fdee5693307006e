// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! droverd: the drover reconciliation daemon binary.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use drover_core::Config;
use drover_daemon::DaemonRuntime;

#[derive(Debug, Parser)]
#[command(name = "droverd", version, about = "Fleet reconciliation and provisioning daemon")]
struct Args {
    /// Path to the configuration file
    #[arg(long, short = 'c', default_value = "drover.toml")]
    config: PathBuf,

    /// Run a single reconciliation cycle and exit
    #[arg(long)]
    once: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(&args.config);
    let mut config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if args.once {
        config.daemon.interval_secs = 0;
    }

    if args.validate {
        fmt().with_env_filter(default_filter()).with_writer(std::io::stderr).init();
        config.validate().context("configuration invalid")?;
        println!(
            "configuration OK: {} rule(s), {} detector(s), {} notifier(s), interval {}s",
            config.rules.len(),
            config.detectors.len(),
            config.notifiers.len(),
            config.daemon.interval_secs,
        );
        return Ok(());
    }

    let _guard = init_tracing(&config.daemon.log_dir)?;
    config.validate().context("configuration invalid")?;

    let config_dir =
        config_path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    let daemon = DaemonRuntime::start(config, &config_dir)?;

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    info!(config = %config_path.display(), "droverd starting");
    daemon.run(cancel).await?;

    Ok(())
}

/// Fall back to the user-level config when the default path is absent.
fn resolve_config_path(requested: &Path) -> PathBuf {
    if requested.exists() {
        return requested.to_path_buf();
    }
    if requested == Path::new("drover.toml") {
        if let Some(dir) = dirs::config_dir() {
            let user_config = dir.join("drover").join("drover.toml");
            if user_config.exists() {
                return user_config;
            }
        }
    }
    requested.to_path_buf()
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Log to stderr and to an append-only file under the log directory.
fn init_tracing(log_dir: &Path) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::never(log_dir, "droverd.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(default_filter())
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();

    Ok(guard)
}

/// Bridge termination signals into loop cancellation.
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let sigterm = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm => info!("received SIGTERM"),
        }
        cancel.cancel();
    });
}

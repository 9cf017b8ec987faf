#![doc = include_str!("../README.md")]

mod harness;

use anyhow::Context;
use clap::Parser;
use harness::config::{CliArgs, RunnerConfig};
use harness::scenario::{Platform, run_selected};
use harness::telemetry::{self, init_telemetry};
use stampede::VerdictSet;
use stampede_client::{HttpCouponApi, HttpRowCounter, RedisObserver};
use std::{process::ExitCode, sync::Arc};
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = RunnerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let outcome = run(&config, &cancel).await;
    if let Ok(verdicts) = &outcome {
        telemetry::record_verdicts(verdicts);
    }
    providers.shutdown();
    let verdicts = outcome?;

    println!("{verdicts}");
    if verdicts.all_passed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

async fn run(config: &RunnerConfig, cancel: &CancellationToken) -> anyhow::Result<VerdictSet> {
    let api = HttpCouponApi::new(config.http.clone()).context("invalid platform URL")?;
    let kv = RedisObserver::connect(&config.redis_url, config.redis_timeout)
        .await
        .context("failed to connect to redis")?;
    let rows = config
        .shard_count_url
        .as_deref()
        .map(|url| HttpRowCounter::new(url, config.settings.shard_count, config.http.timeout))
        .transpose()
        .context("invalid SHARD_COUNT_URL")?;

    let platform = Platform::new(Arc::new(api), kv, rows);
    run_selected(
        config.scenario,
        &platform,
        &config.plan,
        &config.settings,
        cancel,
    )
    .await
}

fn log_startup_info(_config: &RunnerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!("Running `{}` with full config: {:#?}", _config.scenario, _config);
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Running `{}` against {} with {} workers",
            _config.scenario,
            _config.http.engine_url,
            _config.settings.pool.concurrency
        );
    }
}

/// Cancels the run on Ctrl+C or SIGTERM. In-flight bursts drain within their
/// shutdown grace and pending polls stop at their next suspension point.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Failed to install SIGTERM handler: {_e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(_e) = signal::ctrl_c().await {
            #[cfg(feature = "tracing")]
            tracing::warn!("Failed to install Ctrl+C handler: {_e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
        () = cancel.cancelled() => return,
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Cancelling the run...");
    cancel.cancel();
}

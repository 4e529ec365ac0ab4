//! Process entrypoint (§5): `dotenv().ok()`, install tracing, parse CLI,
//! load config (C1), build `Context` (C3 storage + connector registry),
//! run one warm-up cycle, then hand off to the scheduler (C8) until
//! SIGINT/SIGTERM.

use anyhow::{Context as _, Result};
use clap::Parser;
use crypto_collector::config::Config;
use crypto_collector::connector::binance::BinanceRestConnector;
use crypto_collector::connector::Connector;
use crypto_collector::context::{ConnectorRegistry, Context};
use crypto_collector::scheduler::{Cadence, JobDefaults, Scheduler};
use crypto_collector::storage::{PersistenceConfig, Storage};
use crypto_collector::{metrics, orchestrator};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "crypto-collector", version, about = "Multi-source crypto-market data ingestion and quality pipeline")]
struct Cli {
    /// Path to the TOML file of `[[collector]]` declarations (§4.C1).
    #[arg(long, env = "COLLECTOR_CONFIG", default_value = "collectors.toml")]
    config: PathBuf,

    /// Run one warm-up cycle then exit, instead of starting the scheduler.
    #[arg(long)]
    once: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("RUST_LOG")
        .or_else(|_| EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_connectors(cfg: &Config) -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();
    let mut source_names: std::collections::HashSet<&str> =
        cfg.collectors.iter().map(|c| c.source_name.as_str()).collect();
    // Only "binance" has a concrete connector in this implementation (§4.C2);
    // other declared sources register no connector and are skipped at
    // dispatch time with a logged warning, never aborting startup.
    if source_names.remove("binance") {
        registry.register("binance", Arc::new(BinanceRestConnector::new()) as Arc<dyn Connector>);
    }
    registry
}

/// The canonical job table (§4.C8, supplemented from original_source's
/// `main.py`). Every handler is wrapped identically by `Scheduler::fire`'s
/// own instrumentation, so each closure here only does the work.
fn register_jobs(scheduler: &mut Scheduler, ctx: Arc<Context>, interval_secs: u64) -> Result<()> {
    let cancel = CancellationToken::new();

    {
        let ctx = Arc::clone(&ctx);
        let cancel = cancel.clone();
        scheduler.register("ohlcv_collect", Cadence::interval_secs(interval_secs), move || {
            let ctx = Arc::clone(&ctx);
            let cancel = cancel.clone();
            async move {
                orchestrator::run_collection_cycle(&ctx, &cancel).await;
                Ok(())
            }
        });
    }
    {
        let ctx = Arc::clone(&ctx);
        scheduler.register("whale_collect", Cadence::interval_secs(600), move || {
            let ctx = Arc::clone(&ctx);
            async move {
                orchestrator::run_whale_cycle(&ctx).await;
                Ok(())
            }
        });
    }
    {
        let ctx = Arc::clone(&ctx);
        scheduler.register("oi_collect", Cadence::interval_secs(300), move || {
            let ctx = Arc::clone(&ctx);
            async move {
                orchestrator::run_open_interest_cycle(&ctx).await;
                Ok(())
            }
        });
    }
    {
        let ctx = Arc::clone(&ctx);
        scheduler.register("funding_collect", Cadence::interval_secs(300), move || {
            let ctx = Arc::clone(&ctx);
            async move {
                orchestrator::run_funding_rate_cycle(&ctx).await;
                Ok(())
            }
        });
    }
    {
        let ctx = Arc::clone(&ctx);
        scheduler.register(
            "rich_list_collect",
            Cadence::cron("15 0 * * *").context("parsing rich_list_collect cadence")?,
            move || {
                let ctx = Arc::clone(&ctx);
                async move {
                    orchestrator::run_rich_list_cycle(&ctx).await;
                    Ok(())
                }
            },
        );
    }
    {
        let ctx = Arc::clone(&ctx);
        scheduler.register(
            "events_collect",
            Cadence::cron("0 */6 * * *").context("parsing events_collect cadence")?,
            move || {
                let ctx = Arc::clone(&ctx);
                async move {
                    orchestrator::run_events_cycle(&ctx).await;
                    Ok(())
                }
            },
        );
    }
    {
        let ctx = Arc::clone(&ctx);
        scheduler.register("fear_greed_collect", Cadence::interval_secs(6 * 3600), move || {
            let ctx = Arc::clone(&ctx);
            async move {
                orchestrator::run_fear_greed_cycle(&ctx).await;
                Ok(())
            }
        });
    }
    {
        let ctx = Arc::clone(&ctx);
        scheduler.register(
            "etf_flows_collect",
            Cadence::cron_tz("5 17-23 * * mon-fri", chrono_tz::America::New_York)
                .context("parsing etf_flows_collect cadence")?,
            move || {
                let ctx = Arc::clone(&ctx);
                async move {
                    orchestrator::run_etf_flows_cycle(&ctx).await;
                    Ok(())
                }
            },
        );
    }
    {
        let ctx = Arc::clone(&ctx);
        scheduler.register("etf_freshness_check", Cadence::interval_secs(3600), move || {
            let ctx = Arc::clone(&ctx);
            async move {
                orchestrator::run_etf_freshness_check(&ctx).await;
                Ok(())
            }
        });
    }
    {
        let ctx = Arc::clone(&ctx);
        scheduler.register("signal_scan", Cadence::interval_secs(300), move || {
            let ctx = Arc::clone(&ctx);
            async move {
                crypto_collector::signals::run_signal_scan(
                    &ctx,
                    &crypto_collector::signals::SignalThresholds::default(),
                )
                .await?;
                Ok(())
            }
        });
    }
    {
        let ctx = Arc::clone(&ctx);
        scheduler.register("quality_check", Cadence::interval_secs(600), move || {
            let ctx = Arc::clone(&ctx);
            async move {
                orchestrator::run_quality_check(&ctx, 1).await;
                Ok(())
            }
        });
    }
    {
        let ctx = Arc::clone(&ctx);
        scheduler.register("cvd_calibration", Cadence::interval_secs(900), move || {
            let ctx = Arc::clone(&ctx);
            async move {
                orchestrator::run_cvd_calibration_cycle(&ctx).await;
                Ok(())
            }
        });
    }
    {
        let ctx = Arc::clone(&ctx);
        scheduler.register("backfill", Cadence::interval_secs(300), move || {
            let ctx = Arc::clone(&ctx);
            async move {
                orchestrator::run_backfill_cycle(&ctx, 10).await;
                Ok(())
            }
        });
    }

    Ok(())
}

/// Warm-up sequence run once at startup regardless of `--once` (§5):
/// mirrors original_source's `main()`, which primes OHLCV, whale, OI,
/// funding, and a first signal scan before the scheduler takes over.
async fn run_warmup(ctx: &Context) {
    let cancel = CancellationToken::new();
    orchestrator::run_collection_cycle(ctx, &cancel).await;
    orchestrator::run_whale_cycle(ctx).await;
    orchestrator::run_open_interest_cycle(ctx).await;
    orchestrator::run_funding_rate_cycle(ctx).await;
    if let Err(e) = crypto_collector::signals::run_signal_scan(
        ctx,
        &crypto_collector::signals::SignalThresholds::default(),
    )
    .await
    {
        tracing::error!(error = %e, "warm-up signal scan failed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let cfg = Config::load(&cli.config).context("loading collector configuration")?;
    let metrics_handle = metrics::install_recorder()?;
    metrics::record_startup_gauges(env!("CARGO_PKG_VERSION"));

    let db = Storage::open(std::path::Path::new(&cfg.sqlite_path), PersistenceConfig::default())
        .context("opening storage")?;
    let connectors = build_connectors(&cfg);
    let ctx = Arc::new(Context::new(db, connectors, cfg.collectors.clone()));

    let metrics_port = cfg.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_handle, metrics_port).await {
            tracing::error!(error = %e, "metrics server exited");
        }
    });

    info!("running warm-up collection cycle");
    run_warmup(&ctx).await;

    if cli.once {
        info!("--once specified, exiting after warm-up");
        return Ok(());
    }

    let mut scheduler = Scheduler::new(JobDefaults::default());
    register_jobs(&mut scheduler, Arc::clone(&ctx), cfg.collector_interval_seconds)?;
    info!(jobs = scheduler.job_count(), "starting scheduler");

    let shutdown = Arc::new(AtomicBool::new(false));
    let scheduler = Arc::new(scheduler);
    let run_handle = tokio::spawn(Arc::clone(&scheduler).run(Arc::clone(&shutdown)));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining in-flight jobs");
    shutdown.store(true, Ordering::SeqCst);
    // Give in-flight handlers a grace period before the process exits
    // (§5's "wait in-flight jobs with grace").
    let _ = tokio::time::timeout(Duration::from_secs(30), run_handle).await;

    metrics::record_shutdown();
    info!("shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

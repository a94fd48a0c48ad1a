//! `crawld`: the master/slave CLI front-end over `crawl-core`.
//!
//! Two positional arguments select the config file and the role (§6 "CLI
//! surface"). The master additionally runs bootstrap once and drives the
//! Pass Controller; every role runs `workers` worker tasks, minus one slot
//! reserved for the Pass Controller on the master.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;

use crawl_core::config::{CrawlConfig, Role};
use crawl_core::coord_store::redis::RedisCoordStore;
use crawl_core::coord_store::CoordStore;
use crawl_core::exclusion::{ExclusionFilter, ExclusionRuleSet};
use crawl_core::pass_controller::{PassController, StubBogonFetcher, SystemSeedResolver};
use crawl_core::worker::Worker;

/// The source system's default coordination store: a local Redis instance,
/// selecting the database configured under `[crawl] db`.
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1/";

#[derive(Parser, Debug)]
#[command(name = "crawld", about = "Distributed Bitcoin-family peer-to-peer crawl coordinator")]
struct Cli {
    /// Path to the sectioned INI config file.
    config: PathBuf,

    /// Either `master` (runs bootstrap and the Pass Controller) or `slave`.
    role: String,
}

/// Sets up leveled, append-mode file logging at the configured `logfile`
/// path (the spec's `[crawl] logfile`/`debug` keys), mirroring the source
/// system's `logging.basicConfig(filename=..., filemode='a')`. Returns the
/// non-blocking writer's guard, which must stay alive for the log to flush.
fn init_tracing(logfile: &str, debug: bool) -> Result<WorkerGuard> {
    let default_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let path = Path::new(logfile);
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().ok_or_else(|| eyre!("logfile path has no file name: {logfile}"))?;
    let appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt().with_env_filter(filter).with_writer(non_blocking).with_ansi(false).init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    // §6 "CLI surface": usage errors exit 1, not clap's default 2.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            e.print()?;
            std::process::exit(1);
        }
    };

    let role = match Role::parse(&cli.role) {
        Ok(role) => role,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let config = CrawlConfig::load(&cli.config, role).map_err(|e| eyre!(e))?;

    let _log_guard = init_tracing(&config.logfile, config.debug)?;
    tokio::fs::create_dir_all(&config.crawl_dir).await?;

    let store: Arc<dyn CoordStore> =
        Arc::new(RedisCoordStore::connect(DEFAULT_REDIS_URL, config.db).await.map_err(|e| eyre!(e))?);

    let filter = ExclusionFilter::new_handle(ExclusionFilter::new_shared());
    filter.publish(ExclusionRuleSet::unloaded());

    let shutdown = Arc::new(AtomicBool::new(false));
    install_shutdown_handler(shutdown.clone());

    let pass_controller = if config.role.is_master() {
        let pc = Arc::new(PassController::new(
            config.clone(),
            store.clone(),
            filter.clone(),
            Arc::new(SystemSeedResolver),
            Arc::new(StubBogonFetcher),
        ));
        pc.bootstrap().await.map_err(|e| eyre!(e))?;
        Some(pc)
    } else {
        None
    };

    let worker_slots = if config.role.is_master() { config.workers.saturating_sub(1) } else { config.workers };

    let client_factory = Arc::new(crawl_core::peer_client::StubPeerClientFactory);

    let mut handles = Vec::with_capacity(worker_slots + 1);
    for id in 0..worker_slots {
        let worker = Worker::new(id, config.clone(), store.clone(), filter.clone(), client_factory.clone());
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    if let Some(pc) = pass_controller {
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move { pc.run(shutdown).await }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "worker task panicked");
        }
    }

    Ok(())
}

/// Installs a SIGINT handler that lets in-flight worker tasks finish their
/// current iteration rather than aborting the process immediately (§5
/// "Cancellation & timeouts").
fn install_shutdown_handler(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, waiting for in-flight sessions to finish");
            shutdown.store(true, Ordering::Relaxed);
        }
    });
}

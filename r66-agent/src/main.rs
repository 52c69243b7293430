//! R66 agent daemon.
//!
//! Wires the shaper, a loopback block transport, the optional in-memory
//! store and the [`InternalRunner`], then runs until interrupted.
//!
//! Usage:
//!   r66-agent --host-id hosta --base-dir /srv/r66 --submit default=report.csv
//!
//! Signals:
//!   SIGINT  — two-phase stop: refuse new work, drain, then abort the rest
//!   SIGHUP  — reload the commander (unix only)

use std::sync::Arc;
use std::time::Duration;

// ---

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ---

use r66_domain::{BlockTransportPtr, TransferKey, TransferRecord};
use r66_engine::{EngineContext, InternalRunner, StorePtr, TaskRegistry};
use r66_shaper::GlobalChannelShaper;
use r66_sim::MemoryStore;

// ---

mod config;
mod local_transport;
mod rules;

// ---

use config::{Config, StoreMode};
use local_transport::LocalBlockTransport;
use rules::load_rules;

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    let cfg = Config::parse();

    let no_color = std::env::var("EMACS").is_ok()
        || std::env::var("NO_COLOR").is_ok()
        || std::env::var("CARGO_TERM_COLOR").as_deref() == Ok("never")
        || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    tracing_subscriber::fmt()
        .with_target(false)
        .with_ansi(!no_color)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %cfg.host_id,
        "r66-agent starting",
    );

    // Directories.
    let paths = cfg.paths();
    for dir in [
        &paths.in_path,
        &paths.out_path,
        &paths.work_path,
        &paths.arch_path,
    ] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    info!(home = %paths.home.display(), "directories ready");

    let rules = load_rules(cfg.rules.as_deref(), &TaskRegistry::with_defaults())?;
    info!(count = rules.len(), "rules loaded");

    // Shaping and the data stage.
    let shaper = GlobalChannelShaper::new(cfg.shaper());
    shaper.start();
    let transport: BlockTransportPtr = Arc::new(LocalBlockTransport::new(
        shaper.clone(),
        paths.out_path.clone(),
        cfg.peer_in_dir(),
    ));

    let store: Option<StorePtr> = match cfg.store {
        StoreMode::Memory => Some(Arc::new(MemoryStore::default())),
        StoreMode::None => None,
    };

    let ctx = EngineContext::new(
        cfg.host_id.clone(),
        paths,
        cfg.engine(),
        shaper,
        transport,
        store,
    );
    for rule in rules {
        ctx.rules().insert(rule);
    }

    // Startup requests.
    for req in &cfg.submit {
        if ctx.rules().get(&req.rule).is_none() {
            anyhow::bail!("--submit names unknown rule {}", req.rule);
        }
        let key = TransferKey {
            requested: cfg.peer_id.clone(),
            requester: cfg.host_id.clone(),
            transfer_id: ctx.new_transfer_id().await?,
        };
        let record = TransferRecord::new(&cfg.host_id, key, &req.rule, true, &req.file)
            .with_block_size(cfg.block_size);
        ctx.submit_request(record).await?;
    }

    let runner = InternalRunner::new(ctx.clone()).await;
    info!(
        max_workers = ctx.settings().max_workers,
        delay_ms = ctx.settings().commander_delay_ms,
        "runner started",
    );

    wait_for_shutdown(&runner).await?;

    // Two-phase stop.
    runner.prepare_stop();
    let drained = runner
        .drain(Duration::from_secs(cfg.drain_timeout_secs))
        .await;
    if !drained {
        tracing::warn!(active = runner.active_count(), "drain timed out, aborting transfers");
    }
    runner.stop().await;
    info!("shut down");

    Ok(())
}

// ---

/// Block until SIGINT. SIGHUP reloads the commander meanwhile.
#[cfg(unix)]
async fn wait_for_shutdown(runner: &InternalRunner) -> anyhow::Result<()> {
    // ---
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                r?;
                info!("interrupt received, stopping");
                return Ok(());
            }
            _ = hangup.recv() => {
                info!("hangup received, reloading");
                runner.reload().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_runner: &InternalRunner) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("interrupt received, stopping");
    Ok(())
}

//! `warrend`: the container-management daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use warren_core::{DaemonConfig, Engine};
use warren_daemon::server;

#[derive(Debug, Parser)]
#[command(name = "warrend", about = "warren container-management daemon", version)]
struct Args {
    /// Configuration file; defaults apply when absent.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Listening socket path, overriding the configuration.
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Log debug details.
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if args.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => DaemonConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }

    Engine::become_subreaper().context("becoming a child subreaper")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let engine = Engine::new(config).context("building engine")?;

    engine.restore_all().context("restoring containers")?;

    for _ in 0..engine.config.daemon.event_workers {
        tokio::spawn(Arc::clone(&engine).run_event_worker());
    }
    tokio::spawn(Arc::clone(&engine).run_reaper());
    engine.start_rotation();

    let listener = server::bind(&engine).context("binding control socket")?;

    tokio::select! {
        () = server::serve(engine, listener) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for shutdown signal")?;
            info!("shutting down");
        }
    }
    Ok(())
}

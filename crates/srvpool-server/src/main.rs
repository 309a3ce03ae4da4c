#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use server::config::{CliArgs, ServerConfig};
use server::tcp::{EchoHandler, SharedHandler, TcpServer};
use server::telemetry::init_telemetry;
use srvpool::{CancellationToken, FieldKind, Pool, Server, SharedServer};
use std::sync::Arc;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    init_telemetry(config.log_format)?;
    log_startup_info(&config);

    let servers: Vec<Arc<TcpServer>> = config
        .servers
        .iter()
        .map(|spec| {
            Arc::new(TcpServer::new(&spec.name, &spec.bind, &spec.expose).with_grace(config.grace))
        })
        .collect();
    let pool = Pool::with_config(config.pool)
        .seeded(
            servers
                .iter()
                .map(|s| Arc::clone(s) as SharedServer<SharedHandler>),
        )
        .await;

    let handler: SharedHandler = Arc::new(EchoHandler::default());
    if let Err(e) = pool.listen(handler).await {
        tracing::error!("{e}");
        if !pool.is_running(true) {
            anyhow::bail!("no server could start listening");
        }
    }

    for bind in pool.list(FieldKind::Name, FieldKind::BindAddress, "", ".*") {
        tracing::info!("Serving on {bind}");
    }
    for server in &servers {
        if let Err(e) = server.health_check() {
            tracing::warn!("{} is unhealthy: {e}", server.name());
        }
    }

    let token = CancellationToken::new();

    #[cfg(unix)]
    let reloader = tokio::spawn(restart_on_hangup(pool.clone(), token.child_token()));

    let notice = pool.wait_notify(token.clone()).await;
    tracing::info!("Pool stopped after {notice}");

    token.cancel();
    #[cfg(unix)]
    {
        if let Err(e) = reloader.await {
            tracing::error!("Restart task failed: {e}");
        }
    }

    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting server pool with full config: {:#?}", config);
    } else {
        tracing::info!(
            "Starting server pool with {} server(s), concurrency {}",
            config.servers.len(),
            config.pool.concurrency
        );
    }
}

/// Restarts every server each time the process receives `SIGHUP`.
#[cfg(unix)]
async fn restart_on_hangup(pool: Pool<SharedHandler>, token: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::warn!("SIGHUP restarts are disabled: {e}");
            return;
        }
    };

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                tracing::info!("Received SIGHUP signal, restarting servers");
                let report = pool.fan_out(srvpool::Lifecycle::Restart).await;
                if !report.is_complete() {
                    tracing::warn!(
                        "{} of {} server(s) did not finish restarting in time",
                        report.abandoned(),
                        report.members
                    );
                }
            }
        }
    }
}

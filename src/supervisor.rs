//! Service Supervisor (C5): wires C1–C4 together, owns process lifetime.
//!
//! Startup and shutdown order are grounded on
//! `examples/original_source/pkg/service/server.go` and
//! `examples/original_source/pkg/service/service.go` (init logger, build
//! router, start election + scheduler, serve, then reverse order on signal).

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{config::Config, election, ingress, liveness::Liveness, scheduler::Scheduler};

/// Runs the forwarder to completion. Returns `Ok(())` on a clean shutdown,
/// `Err` if startup itself failed (bad config, unreachable backend).
pub async fn run(cfg: Config) -> Result<(), crate::error::Error> {
    init_logging(&cfg.log_level);

    let identity = uuid::Uuid::new_v4().to_string();
    tracing::info!(%identity, elector = %cfg.elector, election_enabled = cfg.election_enabled, "starting");

    let election = election::build(&cfg, identity).await?;
    let forwarder = Arc::new(crate::ingress::forward::Forwarder::new(&cfg.remote_write)?);
    let liveness = Arc::new(Liveness::new());

    // First acquisition attempt happens synchronously before the scheduler's
    // retry loop takes over, so a replica that wins the lock at boot doesn't
    // wait a full retry-period before it starts forwarding.
    if cfg.election_enabled {
        match election.start_leading(election.heartbeat()).await {
            Ok(()) => tracing::info!("acquired lock at startup"),
            Err(election::ElectionError::NotLeader) => tracing::info!("starting as follower"),
            Err(e) => tracing::warn!(error = %e, "initial start_leading failed, scheduler will retry"),
        }
    }

    let scheduler = Scheduler::start(
        election.clone(),
        liveness.clone(),
        cfg.prometheus_scrape_interval,
        cfg.grace(),
    );

    let state = ingress::IngressState {
        liveness,
        election: election.clone(),
        election_enabled: cfg.election_enabled,
        forwarder,
    };
    let router = ingress::router(state);

    let listener = TcpListener::bind(("0.0.0.0", cfg.port))
        .await
        .map_err(|e| crate::error::Error::ConfigInvalid(format!("binding port {}: {e}", cfg.port)))?;
    tracing::info!(port = cfg.port, "listening");

    // The cancellation token is the single signal `with_graceful_shutdown`
    // waits on. Awaiting `serve` as `&mut` on a pinned binding (rather than
    // moving it into the `select!` body) means that when the signal branch
    // below wins, `serve` is not dropped along with it — it keeps running so
    // it can actually observe `cancel.cancel()` and drain, instead of being
    // torn down before it ever sees the cancellation that was just sent.
    let cancel = CancellationToken::new();
    let serve = axum::serve(listener, router).with_graceful_shutdown({
        let cancel = cancel.clone();
        async move { cancel.cancelled().await }
    });
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => {
            if let Err(e) = result {
                tracing::error!(error = %e, "http server exited with error");
            }
        }
        _ = wait_for_shutdown_signal() => {
            tracing::info!("shutdown signal received, draining");
            cancel.cancel();
            match tokio::time::timeout(std::time::Duration::from_secs(10), serve).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "http server exited with error"),
                Err(_) => tracing::warn!("graceful drain exceeded 10s, forcing shutdown"),
            }
        }
    }

    scheduler.shutdown().await;

    if cfg.election_enabled {
        if let Err(e) = election.release(election.heartbeat()).await {
            tracing::warn!(error = %e, "release during shutdown failed");
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}

fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("install SIGQUIT handler");

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
        _ = sigquit.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

use std::sync::Arc;

use corkboard_proxy::config::Config;
use corkboard_proxy::dispatcher::dispatch;
use corkboard_proxy::observer::RotatingFile;
use corkboard_proxy::state::AppState;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let config = Config::from_args(std::env::args());
    init_tracing(&config.log_path);

    info!(
        bind = %config.bind_addr(),
        blocklist = %config.blocklist_path.display(),
        "corkboard-proxy starting"
    );

    let state = AppState::new(&config);
    let listener = match TcpListener::bind(config.bind_addr()).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, addr = %config.bind_addr(), "failed to bind");
            std::process::exit(1);
        }
    };

    let shutdown = Arc::new(Notify::new());
    tokio::spawn(wait_for_signal(shutdown.clone()));

    info!(
        exact_blocked = state.policy.exact_count(),
        suffix_blocked = state.policy.suffix_count(),
        "listening"
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            dispatch(socket, addr.to_string(), state).await;
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to accept connection");
                    }
                }
            }
            _ = shutdown.notified() => {
                break;
            }
        }
    }

    let summary = state.metrics.summary();
    let cache_stats = state.cache.stats().await;
    info!(
        uptime_secs = summary.uptime_secs,
        total_requests = summary.total_requests,
        blocked_requests = summary.blocked_requests,
        allowed_requests = summary.allowed_requests,
        cache_entries = cache_stats.entries,
        cache_hit_rate = cache_stats.hit_rate(),
        "shutting down"
    );
}

async fn wait_for_signal(shutdown: Arc<Notify>) {
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    shutdown.notify_one();
}

fn init_tracing(log_path: &std::path::Path) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let console_layer = tracing_subscriber::fmt::layer().with_target(false);

    match RotatingFile::open(log_path) {
        Ok(rotating) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(rotating)
                .with_ansi(false)
                .with_target(false);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .with(file_layer)
                .init();
        }
        Err(err) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .init();
            warn!(error = %err, path = %log_path.display(), "could not open log file, logging to console only");
        }
    }
}

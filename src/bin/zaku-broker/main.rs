mod args;

use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::{signal, time};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use args::Args;
use zaku_broker::config::Config;
use zaku_broker::engine::{JobEngine, PubSubEngine};
use zaku_broker::gc::ExpirationWatcher;
use zaku_broker::server::{self, AppState};
use zaku_broker::store::mi::{build_client, RedisIndex};
use zaku_broker::store::ps::MongoPayloads;

const PS_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            eprintln!("warning: failed to load .env: {err}");
        }
    }

    let args = Args::parse();

    if args.verbose {
        tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let config = match Config::from_raw(args.into()) {
        Ok(c) => c,
        Err(error) => {
            error!(%error, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    let index = match RedisIndex::connect(&config.prefix, &config.redis).await {
        Ok(index) => Arc::new(index),
        Err(error) => {
            error!(%error, "could not reach the metadata index at startup");
            return ExitCode::from(111);
        }
    };

    let payloads = match MongoPayloads::connect(&config.mongo).await {
        Ok(payloads) => Arc::new(payloads),
        Err(error) => {
            error!(%error, "could not construct a payload store client at startup");
            return ExitCode::from(111);
        }
    };

    let ps_healthy_at_start = payloads.health_check().await;
    if !ps_healthy_at_start {
        warn!("payload store failed its startup health check; publish will fall back to direct delivery until it recovers");
    }

    let ew_client = match build_client(&config.redis).await {
        Ok(client) => client,
        Err(error) => {
            error!(%error, "could not build a dedicated redis client for the expiration watcher");
            return ExitCode::from(111);
        }
    };
    let redis_db = match &config.redis {
        zaku_broker::config::RedisTarget::Direct { db, .. } => *db,
        zaku_broker::config::RedisTarget::Sentinel { db, .. } => *db,
    };
    let (watcher, tracker) = ExpirationWatcher::new(ew_client, redis_db, payloads.clone());

    let jobs = Arc::new(JobEngine::new(
        config.prefix.clone(),
        index.clone(),
        payloads.clone(),
    ));
    let pubsub = Arc::new(
        PubSubEngine::new(
            config.prefix.clone(),
            index.clone(),
            index.clone(),
            payloads.clone(),
        )
        .with_marker_tracker(tracker),
    );
    if !ps_healthy_at_start {
        pubsub.ps_availability_handle().store(false, Ordering::SeqCst);
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            }
            shutdown.cancel();
        });
    }

    tokio::spawn(watcher.run(shutdown.clone()));
    tokio::spawn(spawn_ps_reconnect_task(
        payloads,
        pubsub.ps_availability_handle(),
        shutdown.clone(),
    ));

    let state = AppState {
        jobs,
        pubsub,
        config: Arc::new(config.clone()),
    };
    let router = server::build_router(state);

    let listener = match bind_listener(&config).await {
        Ok(l) => l,
        Err(error) => {
            error!(%error, "failed to bind listener");
            return ExitCode::from(111);
        }
    };
    info!(addr = ?listener.local_addr().ok(), "listening");

    let serve_result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await;

    match serve_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "server exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn bind_listener(config: &Config) -> Result<TcpListener> {
    if config.free_port {
        kill_port_squatter(config.port).await;
    }
    TcpListener::bind((config.host, config.port))
        .await
        .context("binding HTTP listener")
}

/// Kills whatever process is already listening on `port`, the Rust
/// equivalent of the original's `killport.kill_ports`. Shells out to `lsof`
/// rather than pulling in a process-inspection crate for one startup-time
/// check; a missing `lsof` just means the preflight is a no-op and the
/// subsequent bind fails with its usual "address in use" error.
async fn kill_port_squatter(port: u16) {
    let output = tokio::process::Command::new("lsof")
        .args(["-t", "-i", &format!("tcp:{port}")])
        .output()
        .await;

    let Ok(output) = output else {
        warn!(port, "could not invoke lsof to preflight-check for a port squatter");
        return;
    };

    for pid in String::from_utf8_lossy(&output.stdout).split_whitespace() {
        info!(pid, port, "killing process squatting on configured port");
        let _ = tokio::process::Command::new("kill")
            .args(["-9", pid])
            .status()
            .await;
    }

    time::sleep(Duration::from_millis(10)).await;
}

/// Polls the payload store's health until it recovers, then flips
/// `ps_available` back on so `PubSubEngine::publish` resumes trying
/// PS-indirection. Runs for the lifetime of the process; shutdown just
/// stops the polling, it doesn't need to finish any in-flight work.
async fn spawn_ps_reconnect_task(
    payloads: Arc<MongoPayloads>,
    ps_available: Arc<std::sync::atomic::AtomicBool>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = time::sleep(PS_RECONNECT_INTERVAL) => {}
        }

        if ps_available.load(Ordering::SeqCst) {
            continue;
        }

        if payloads.health_check().await {
            ps_available.store(true, Ordering::SeqCst);
            info!("payload store reconnected; resuming PS-indirection for publish");
        }
    }
}

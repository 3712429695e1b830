//! statesink daemon.
//!
//! Single long-running process: connects to the stream store and the
//! durable store, arbitrates responsibility with its peers, and while
//! responsible runs the replication subtree (dump listener, initial sync,
//! runtime updates, history sync, retention) under one cancellable scope.
//! Handover or a fresh producer dump tears the subtree down; the next
//! takeover builds a fresh one.

use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use statesink::config::{Config, RetentionConfig};
use statesink::db::Db;
use statesink::entity::Registry;
use statesink::history::retention::Retention;
use statesink::history::HistorySync;
use statesink::redis::dump::DumpSignals;
use statesink::redis::{heartbeat, RedisClient, RUNTIME_STREAM};
use statesink::sync::runtime::RuntimeUpdates;
use statesink::sync::InitialSync;
use statesink::telemetry::Telemetry;
use statesink::types::Binary;
use statesink::{ha, Error};

fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_env("STATESINK_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for any shutdown signal. SIGHUP means the same as SIGTERM here:
/// this engine does not support reload.
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
    };
    Ok(name)
}

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("statesink: {err}");
            std::process::exit(2);
        }
    };

    init_tracing(&config.logging.level);

    if let Err(err) = run(config).await {
        error!(error = %err, "Fatal error");
        eprintln!("statesink: fatal error: {err}");
        let mut source = err.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Error> {
    info!("Starting statesink");

    let telemetry = Arc::new(Telemetry::default());
    let root = CancellationToken::new();

    // Signal handling cancels the root scope; everything below observes it.
    {
        let root = root.clone();
        tokio::spawn(async move {
            match shutdown_signal().await {
                Ok(name) => info!(signal = name, "Exiting due to signal"),
                Err(err) => error!(error = %err, "Can't install signal handlers"),
            }
            root.cancel();
        });
    }

    let db = Db::connect(&root, &config.database, telemetry.clone()).await?;
    let redis = RedisClient::connect(&root, &config.redis, telemetry.clone()).await?;
    let registry = Arc::new(Registry::config());

    let (heartbeat_rx, heartbeat_handle) =
        heartbeat::listen(redis.clone(), root.child_token());
    let (mut ha_events, mut ha_handle) = ha::start(db.clone(), heartbeat_rx, root.child_token());

    // Fatal errors from the replication subtree arrive here; anything that
    // is not a cancellation crashes the process.
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<Error>(1);
    let mut active: Option<CancellationToken> = None;

    let result: Result<(), Error> = loop {
        tokio::select! {
            _ = root.cancelled() => break Ok(()),

            Some(err) = fatal_rx.recv() => break Err(err),

            result = &mut ha_handle => {
                // The arbiter only returns on cancellation, watcher
                // shutdown, or a non-retryable error.
                break match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) if err.is_cancelled() => Ok(()),
                    Ok(Err(err)) => Err(err),
                    Err(join) => Err(Error::Config(format!("HA arbiter panicked: {join}"))),
                };
            }

            // One ordered channel: a handover can never be overtaken by an
            // older takeover, so a standby replica never keeps a stale
            // replication subtree running.
            maybe_event = ha_events.recv() => {
                let Some(event) = maybe_event else { break Ok(()) };
                match event {
                    ha::HaEvent::Takeover(env) => {
                        if let Some(token) = active.take() {
                            token.cancel();
                        }
                        let token = root.child_token();
                        active = Some(token.clone());
                        tokio::spawn(ha_subtree(
                            db.clone(),
                            redis.clone(),
                            registry.clone(),
                            config.retention.clone(),
                            token,
                            env,
                            fatal_tx.clone(),
                        ));
                    }
                    ha::HaEvent::Handover => {
                        if let Some(token) = active.take() {
                            token.cancel();
                        }
                    }
                }
            }
        }
    };

    root.cancel();
    if let Some(token) = active.take() {
        token.cancel();
    }

    // Surface a heartbeat-watcher failure that ended the run indirectly.
    if let Ok(Err(err)) = heartbeat_handle.await {
        if !err.is_cancelled() {
            return Err(err);
        }
    }

    result.map(|()| info!("Shut down cleanly"))
}

/// The cyclic ha-scope: build a sync generation, tear it down when a new
/// producer dump invalidates it, rebuild. Ends with the scope.
async fn ha_subtree(
    db: Db,
    redis: RedisClient,
    registry: Arc<Registry>,
    retention: RetentionConfig,
    token: CancellationToken,
    env: Binary,
    fatal: mpsc::Sender<Error>,
) {
    while !token.is_cancelled() {
        let generation = token.child_token();
        match sync_generation(&db, &redis, &registry, &retention, &generation, &env).await {
            Ok(true) => {
                info!("Producer config dump invalidated the sync, rebuilding");
            }
            Ok(false) => return,
            Err(err) if err.is_cancelled() => return,
            Err(err) => {
                let _ = fatal.send(err).await;
                return;
            }
        }
    }
}

/// One sync generation. Returns `Ok(true)` when a new dump forced a
/// restart, `Ok(false)` on scope cancellation.
async fn sync_generation(
    db: &Db,
    redis: &RedisClient,
    registry: &Arc<Registry>,
    retention: &RetentionConfig,
    token: &CancellationToken,
    env: &Binary,
) -> Result<bool, Error> {
    let (dump, dump_handle) = DumpSignals::start(redis.clone(), token.clone());

    // The runtime cursor must be captured before the snapshot below;
    // captured after, events applied during the snapshot would be lost.
    let cursor = redis.stream_last_id(token, RUNTIME_STREAM).await?;

    tokio::select! {
        _ = token.cancelled() => return Ok(false),
        done = dump.wait_done() => done?,
    }

    let restart = Arc::new(AtomicBool::new(false));
    let mut group: JoinSet<Result<(), Error>> = JoinSet::new();

    // Edge watcher: a newly started dump cancels this generation.
    {
        let in_progress = dump.in_progress();
        let generation = token.clone();
        let restart = restart.clone();
        group.spawn(async move {
            tokio::select! {
                _ = generation.cancelled() => {}
                _ = in_progress.cancelled() => {
                    restart.store(true, Ordering::SeqCst);
                    generation.cancel();
                }
            }
            Ok(())
        });
    }

    {
        let sync = InitialSync::new(db.clone(), redis.clone(), registry.clone());
        let token = token.clone();
        let env = env.clone();
        group.spawn(async move { sync.run(&token, &env).await });
    }

    {
        let updates = RuntimeUpdates::new(db.clone(), redis.clone(), registry.clone());
        let token = token.clone();
        let env = env.clone();
        group.spawn(async move { updates.run(&token, &env, cursor).await });
    }

    {
        let history = HistorySync::new(db.clone(), redis.clone());
        let token = token.clone();
        let env = env.clone();
        group.spawn(async move { history.run(&token, &env).await });
    }

    {
        let cleanup = Retention::new(db.clone(), retention.clone());
        let token = token.clone();
        let env = env.clone();
        group.spawn(async move { cleanup.run(&token, &env).await });
    }

    // First real error cancels the generation; the rest drain.
    let mut first_error: Option<Error> = None;
    while let Some(joined) = group.join_next().await {
        let failed = match joined {
            Ok(Ok(())) => None,
            Ok(Err(err)) if err.is_cancelled() => None,
            Ok(Err(err)) => Some(err),
            Err(join) => Some(Error::Config(format!("sync worker panicked: {join}"))),
        };
        if let Some(err) = failed {
            if first_error.is_none() {
                token.cancel();
                first_error = Some(err);
            } else {
                error!(error = %err, "Additional sync failure while shutting down");
            }
        }
    }

    match dump_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) if err.is_cancelled() => {}
        Ok(Err(err)) => {
            if first_error.is_none() {
                first_error = Some(err);
            }
        }
        Err(join) => {
            if first_error.is_none() {
                first_error = Some(Error::Config(format!("dump listener panicked: {join}")));
            }
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }
    Ok(restart.load(Ordering::SeqCst))
}

use std::env;
use std::sync::Arc;

use anyhow::{Context, Error};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, Instrument};

use reportq::broker::{Connection, RedisBroker};
use reportq::config::{Config, ReportSettings};
use reportq::db::DbHandle;
use reportq::dispatcher::default_registry;
use reportq::sink::{spawn_error_logger, ErrorSink};
use reportq::supervisor::{self, ConsumeOptions};
use reportq::telemetry;

#[instrument(skip_all)]
async fn setup(config: Config, cancel_token: CancellationToken) -> Result<(), Error> {
    let db = DbHandle::new(
        &config.database_url,
        config.db_max_connections,
        &config.table_log,
    )
    .await
    .context("connecting to database")?;
    db.ensure_log_table()
        .await
        .context("preparing job log table")?;

    let (sink, faults) = ErrorSink::channel();
    spawn_error_logger(faults);

    let broker = RedisBroker::connect(&config.redis_url)
        .await
        .context("connecting to redis")?;
    let connection = Connection::open(&config.connection_name, Arc::new(broker), sink)
        .await
        .context("opening broker connection")?;

    let db = Arc::new(db);
    let registry = default_registry(
        db.clone(),
        db,
        Arc::new(ReportSettings::from(&config)),
        config.test_workers,
        config.report_workers,
    );

    let options = ConsumeOptions {
        prefetch_limit: config.prefetch_limit,
        poll_interval: config.poll_interval(),
    };
    supervisor::serve(cancel_token, connection, &registry, options)
        .instrument(info_span!("supervisor"))
        .await
}

fn watch_signals(token: CancellationToken) -> Result<(), Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigquit.recv() => info!("Received SIGQUIT"),
        }
        token.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "reportq=debug");
    }

    let config = Config::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;
    debug!(
        table_log = %config.table_log,
        output_location = %config.output_location.display(),
        prefetch_limit = config.prefetch_limit,
        poll_interval_ms = config.poll_interval_ms,
        "Loaded configuration"
    );

    let token = CancellationToken::new();
    watch_signals(token.clone())?;

    let result = setup(config, token).await;
    match &result {
        Ok(()) => info!("Shutting down."),
        Err(err) => error!("Worker failed: {err:#}"),
    }
    telemetry::shutdown();

    result
}

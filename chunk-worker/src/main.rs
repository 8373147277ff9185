use std::sync::Arc;

use chunk_common::metrics::{serve, setup_metrics_recorder, setup_metrics_routes};
use chunk_common::store::PgStore;
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chunk_worker::blob::LocalBlobStore;
use chunk_worker::config::Config;
use chunk_worker::handlers::app;
use chunk_worker::pipeline::{ChunkPipeline, PipelineSettings, RunOutcome};

async fn shutdown() -> Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("shutting down");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;
    let catalog = config
        .stream_catalog()
        .wrap_err("invalid data stream configuration")?;

    let store = PgStore::new(&config.pool_config())
        .await
        .wrap_err("failed to connect to postgres")?;
    if config.run_migrations {
        store
            .run_migrations()
            .await
            .wrap_err("failed to run migrations")?;
    }

    let pipeline = Arc::new(ChunkPipeline::new(
        store,
        LocalBlobStore::new(&config.blob_root),
        catalog,
        PipelineSettings {
            quantum: config.chunk_timeslice_quantum,
            batch_size: config.batch_size,
            stale_lock_warning: config.stale_lock_warning(),
        },
    ));

    if config.run_once {
        return match pipeline.run_once().await? {
            RunOutcome::Skipped => {
                info!("another run holds the processing lock, nothing to do");
                Ok(())
            }
            RunOutcome::Completed(summary) => {
                info!(
                    processed = summary.processed(),
                    failed = summary.failed,
                    "chunking run complete"
                );
                Ok(())
            }
        };
    }

    let recorder_handle = setup_metrics_recorder()?;
    let router = setup_metrics_routes(app(pipeline.clone()), recorder_handle);
    let bind = config.bind();
    info!(bind = %bind, "starting chunk worker");

    let pipeline_loop = {
        let pipeline = pipeline.clone();
        let interval = config.run_interval.0;
        tokio::spawn(async move { pipeline.run(interval).await })
    };
    let http_server = tokio::spawn(async move { serve(router, &bind).await });

    tokio::select! {
        res = pipeline_loop => {
            error!("chunking loop exited");
            if let Err(e) = res {
                error!("chunking loop failed with: {}", e);
            }
        }
        res = http_server => {
            error!("http server exited");
            match res {
                Ok(Err(e)) => error!("server failed with: {}", e),
                Err(e) => error!("server task failed with: {}", e),
                Ok(Ok(())) => {}
            }
        }
        res = shutdown() => res?,
    }

    info!("exiting");
    Ok(())
}

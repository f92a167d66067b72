//! MediaSync ETL - Main entry point

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use mediasync_common::logging::{init_logging, LogConfig, LogLevel};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use mediasync_etl::config::StateBackend;
use mediasync_etl::{
    Cli, Commands, ElasticsearchLoader, EtlConfig, EtlError, EtlProcess, JsonFileStorage, MediaLayout,
    MediaPackager, PackagingOutcome, PackagingScheduler, PostgresExtractor, PostgresStorage, State,
    StateCommand, StateStorage, Transformer,
};

/// How long in-flight packaging jobs may run after shutdown is requested.
const PACKAGING_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut builder = LogConfig::builder()
        .log_file_prefix("mediasync-etl")
        .filter_directives("mediasync_etl=info,sqlx=warn");
    if cli.verbose {
        builder = builder.level(LogLevel::Debug);
    }
    // Environment variables take precedence
    let log_config = builder.build().merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    let mut config = match &cli.env_file {
        Some(path) => EtlConfig::load_from(path)?,
        None => EtlConfig::load()?,
    };
    if let Some(pack_size) = cli.pack_size {
        config.sync.pack_size = pack_size;
    }
    if let Some(index) = &cli.index {
        config.sync.index_name = index.clone();
    }
    config.validate()?;

    let result = match &cli.command {
        None | Some(Commands::Run) => run(config).await,
        Some(Commands::State { command }) => inspect_state(&config, command).await,
        Some(Commands::Package { video, audio, id }) => {
            package_once(&config, video, audio, id.unwrap_or_else(Uuid::new_v4)).await
        },
        Some(Commands::EnsureIndex) => ensure_index(&config).await,
    };

    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    result
}

async fn connect_database(config: &EtlConfig) -> Result<PgPool, EtlError> {
    let options = &config.database.connect_options();
    let database = &config.database;
    let pool = config
        .retry
        .run("connect postgres", move || async move {
            PgPoolOptions::new()
                .max_connections(database.max_connections)
                .acquire_timeout(database.connect_timeout())
                .connect_with(options.clone())
                .await
                .map_err(EtlError::from)
        })
        .await?;

    info!(
        host = %config.database.host,
        port = config.database.port,
        dbname = %config.database.dbname,
        "Database connection pool established"
    );
    Ok(pool)
}

async fn open_state(config: &EtlConfig, pool: Option<&PgPool>) -> Result<State<Box<dyn StateStorage>>> {
    let storage: Box<dyn StateStorage> = match config.state.backend {
        StateBackend::Json => {
            info!(file = %config.state.file.display(), "Using file checkpoint store");
            Box::new(JsonFileStorage::new(&config.state.file))
        },
        StateBackend::Postgres => {
            let pool = match pool {
                Some(pool) => pool.clone(),
                None => connect_database(config).await?,
            };
            info!(table = %config.state.table, "Using database checkpoint store");
            Box::new(PostgresStorage::connect(pool, &config.state.table).await?)
        },
    };
    Ok(State::new(storage))
}

fn elastic_loader(config: &EtlConfig) -> Result<ElasticsearchLoader, EtlError> {
    ElasticsearchLoader::new(
        config.elastic.address(),
        &config.sync.index_name,
        config.elastic.timeout(),
        config.retry.clone(),
    )
}

async fn run(config: EtlConfig) -> Result<()> {
    info!(index = %config.sync.index_name, elastic = %config.elastic.address(), "Starting MediaSync ETL");

    let pool = connect_database(&config).await?;
    let state = open_state(&config, Some(&pool)).await?;

    let loader = elastic_loader(&config)?;
    loader.ensure_index().await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    // Packaging gets its own token so running encodes can finish after the
    // sync loop stops.
    let packager = if config.packaging.enabled {
        let packager = MediaPackager::new(&config.packaging, CancellationToken::new());
        match packager.converter().locate_encoder() {
            Some(path) => info!(encoder = %path.display(), "Media packaging enabled"),
            None => warn!(encoder = %config.packaging.ffmpeg_path, "Encoder not found on PATH, packaging jobs will fail"),
        }
        Some(packager)
    } else {
        info!("Media packaging disabled (PACKAGING_ENABLED=false)");
        None
    };

    let transformer = Transformer::new(
        &config.sync.index_name,
        MediaLayout::from_config(&config.packaging),
        packager
            .clone()
            .map(|p| Arc::new(p) as Arc<dyn PackagingScheduler>),
    );

    let mut process = EtlProcess::new(
        Arc::new(PostgresExtractor::new(pool.clone(), config.retry.clone())),
        transformer,
        Arc::new(loader),
        state,
        config.sync.clone(),
        shutdown,
    );

    let result = process.run().await;

    if let Some(packager) = packager {
        info!(in_flight = packager.in_flight(), "Waiting for packaging jobs");
        if !packager.shutdown(PACKAGING_GRACE).await {
            warn!("Packaging jobs were cancelled before completion");
        }
    }
    pool.close().await;

    info!("MediaSync ETL shut down gracefully");
    Ok(result?)
}

async fn inspect_state(config: &EtlConfig, command: &StateCommand) -> Result<()> {
    let state = open_state(config, None).await?;

    match command {
        StateCommand::Show => {
            let checkpoint = state.storage().retrieve_state().await?;
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        },
        StateCommand::Get { key } => match state.get_state(key).await? {
            Some(value) => println!("{}", value),
            None => println!("{} is not set", key),
        },
    }
    Ok(())
}

async fn package_once(config: &EtlConfig, video: &str, audio: &str, id: Uuid) -> Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let packager = MediaPackager::new(&config.packaging, cancel);
    let job = MediaLayout::from_config(&config.packaging).job_for(id, video, audio);
    info!(content_id = %id, video = %job.video_path.display(), audio = %job.audio_path.display(), "Packaging");

    match packager.package(&job).await {
        PackagingOutcome::Packaged { manifest, .. } => {
            println!("{}", manifest.display());
            Ok(())
        },
        PackagingOutcome::ContainerKept { manifest, container, error, .. } => {
            warn!(container = %container.display(), %error, "Container left on disk");
            println!("{}", manifest.display());
            Ok(())
        },
        PackagingOutcome::Skipped { .. } => {
            println!("Packaging skipped: {:?} output is not implemented", config.packaging.format);
            Ok(())
        },
        PackagingOutcome::ContainerFailed { error, .. } => anyhow::bail!("Container build failed: {}", error),
        PackagingOutcome::ManifestFailed { container, error, .. } => anyhow::bail!(
            "Manifest generation failed ({} kept): {}",
            container.display(),
            error
        ),
        PackagingOutcome::Cancelled { .. } => anyhow::bail!("Packaging cancelled"),
    }
}

async fn ensure_index(config: &EtlConfig) -> Result<()> {
    let loader = elastic_loader(config)?;
    if loader.ensure_index().await? {
        println!("Created index {}", loader.index());
    } else {
        println!("Index {} already exists", loader.index());
    }
    Ok(())
}

/// Cancel `token` on Ctrl+C or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    token.cancel();
}

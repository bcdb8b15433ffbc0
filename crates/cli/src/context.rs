//! Staged construction of the resources a command needs: options, the
//! catalogue pool, the decoder ring, and session factories. Each command
//! builds only as far as it has to.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use berth_api::Options;
use berth_core::paths::Paths;
use berth_core::secrets::{DecoderRing, KmsKeyService};
use berth_db::DbPool;
use berth_engine::systemd::SystemctlClient;
use berth_engine::{docker, SessionFactory};

/// Load and validate the options file.
pub fn load_options() -> Result<Options> {
    Options::load().context("unable to load options")
}

/// Connect the catalogue pool and verify it answers.
pub async fn connect_db(options: &Options) -> Result<DbPool> {
    tracing::info!("Connecting to database.");
    let pool = berth_db::create_pool(&options.database_url)
        .await
        .context("unable to connect to database")?;
    berth_db::health_check(&pool)
        .await
        .context("database health check failed")?;
    Ok(pool)
}

/// Build the decoder ring and prove the envelope round-trips under the
/// configured master key.
pub async fn build_ring(options: &Options) -> Result<DecoderRing> {
    tracing::info!(key_id = %options.master_key_id, "Creating decoder ring.");
    let keys = KmsKeyService::connect(&options.master_key_id, &options.aws_region).await;
    let ring = DecoderRing::new(Arc::new(keys));
    ring.verify_roundtrip()
        .await
        .context("decoder ring round-trip failed")?;
    Ok(ring)
}

/// Assemble a session factory over live connections.
pub fn build_factory(options: &Options, db: DbPool, ring: DecoderRing) -> Result<SessionFactory> {
    let docker = docker::connect(options.docker_api_version.as_deref())
        .context("unable to create container runtime client")?;
    let argv0 = std::env::current_exe()
        .context("unable to resolve own executable path")?
        .to_string_lossy()
        .into_owned();

    Ok(SessionFactory::new(
        db,
        ring,
        docker,
        Arc::new(SystemctlClient::new()),
        Paths::default(),
        argv0,
    ))
}

/// The full stack in one call: options, database, ring, factory.
pub async fn full_stack() -> Result<(Options, SessionFactory)> {
    let options = load_options()?;
    let db = connect_db(&options).await?;
    let ring = build_ring(&options).await?;
    let factory = build_factory(&options, db, ring)?;
    Ok((options, factory))
}

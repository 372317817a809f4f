use std::sync::Arc;

use anyhow::{Context, Result};
use facegate_core::{Collaborators, FaceIdentityService, MemoryIndex, VectorIndex};
use facegate_vision::FaceModels;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod dbus_interface;
mod engine;
mod sqlite_index;
mod tokens;
mod users;

use config::{BusKind, Config, IndexBackend};
use dbus_interface::{AdminPolicy, IdentityService, BUS_NAME, OBJECT_PATH};
use sqlite_index::SqliteIndex;
use tokens::SessionTokens;
use users::SqliteUserStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        model = %config.model,
        device = %config.device,
        collection = %config.collection,
        match_threshold = config.match_threshold,
        allow_duplicate_faces = config.allow_duplicate_faces,
        index_backend = ?config.index_backend,
        "configuration loaded"
    );

    // Models load synchronously so a missing file fails startup, not the first request.
    let models = FaceModels::load(&config.model_dir, &config.model, config.device()?)
        .context("loading face models")?;
    let engine = engine::spawn_engine(models)?;

    let conn = db::open(&config.db_path).await?;
    let users = Arc::new(SqliteUserStore::new(conn.clone()));
    users
        .bootstrap_admin(&config.admin_username)
        .await
        .context("bootstrapping administrator account")?;

    let index: Arc<dyn VectorIndex> = match config.index_backend {
        IndexBackend::Sqlite => Arc::new(SqliteIndex::new(conn.clone(), config.embedding_dimension)),
        IndexBackend::Memory => {
            tracing::warn!("memory index selected; enrollments are lost on exit");
            let index = MemoryIndex::new();
            index.create_collection(&config.collection, config.embedding_dimension);
            Arc::new(index)
        }
    };

    let service = Arc::new(FaceIdentityService::new(
        Collaborators {
            detector: Arc::new(engine.clone()),
            extractor: Arc::new(engine),
            index,
            users,
        },
        config.core_settings(),
    ));
    let tokens = Arc::new(SessionTokens::new(conn, config.token_ttl()));

    let (builder, admin) = match config.bus {
        BusKind::System => (zbus::connection::Builder::system()?, AdminPolicy::RootOnly),
        BusKind::Session => (zbus::connection::Builder::session()?, AdminPolicy::AnyCaller),
    };
    let _bus = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, IdentityService::new(service, tokens, admin))?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, ?admin, "facegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}

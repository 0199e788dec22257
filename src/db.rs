use crate::config::AppConfig;
use crate::errors::ServiceError;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;
use std::time::Duration;
use tracing::{debug, error, info};

pub type DbPool = DatabaseConnection;

/// Pool sizing and timeouts taken from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl From<&AppConfig> for PoolSettings {
    fn from(cfg: &AppConfig) -> Self {
        let max_connections = cfg.db_max_connections.max(1);
        Self {
            url: cfg.database_url.clone(),
            max_connections,
            min_connections: cfg.db_min_connections.min(max_connections),
            connect_timeout: Duration::from_secs(cfg.db_connect_timeout_secs),
            idle_timeout: Duration::from_secs(cfg.db_idle_timeout_secs),
            acquire_timeout: Duration::from_secs(cfg.db_acquire_timeout_secs),
        }
    }
}

/// Opens the pool. Row locks (`FOR UPDATE`) are only honoured on Postgres;
/// SQLite serialises writers on its own.
pub async fn connect(settings: &PoolSettings) -> Result<DbPool, ServiceError> {
    debug!(
        max_connections = settings.max_connections,
        min_connections = settings.min_connections,
        "Opening settlement database pool"
    );

    let mut opt = ConnectOptions::new(settings.url.clone());
    opt.max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .connect_timeout(settings.connect_timeout)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(settings.idle_timeout)
        .sqlx_logging(false);

    let pool = Database::connect(opt).await.map_err(|e| {
        error!(error = %e, "Could not open settlement database");
        ServiceError::DatabaseError(e)
    })?;

    info!(backend = ?pool.get_database_backend(), "Settlement database ready");
    Ok(pool)
}

pub async fn establish_connection_from_app_config(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    connect(&PoolSettings::from(cfg)).await
}

/// Applies every pending migration from [`crate::migrator::Migrator`].
pub async fn run_migrations(db: &DbPool) -> Result<(), DbErr> {
    let pending = crate::migrator::Migrator::get_pending_migrations(db).await?.len();
    info!(pending, "Applying settlement schema migrations");
    crate::migrator::Migrator::up(db, None).await.map_err(|e| {
        error!(error = %e, "Schema migration failed");
        e
    })
}

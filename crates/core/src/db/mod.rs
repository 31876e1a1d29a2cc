//! Local PostgreSQL access: pool construction, schema bootstrap, and the two
//! store traits the engines talk through.

pub mod catalog;
pub mod readings;

pub use catalog::{CatalogStore, PgCatalogStore};
pub use readings::{PgReadingStore, ReadingStore};

use deadpool_postgres::{Pool, Runtime};
use tokio_postgres::NoTls;

use crate::config::AgentConfig;
use crate::error::DbError;

/// Build the shared connection pool. Sized by `DB_POOL_SIZE`; every engine
/// borrows from this one pool and no transaction outlives a cycle.
pub fn create_pool(config: &AgentConfig) -> Result<Pool, DbError> {
    let mut pool_config = deadpool_postgres::Config::new();
    pool_config.url = Some(config.database_url.clone());
    pool_config.pool = Some(deadpool_postgres::PoolConfig::new(config.db_pool_size));
    Ok(pool_config.create_pool(Some(Runtime::Tokio1), NoTls)?)
}

/// The mirrored tables plus the outbox, with the unique constraints the
/// engines rely on. Safe to run on every startup.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenant (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    street      TEXT,
    city        TEXT,
    postal_code TEXT,
    country     TEXT,
    active      BOOLEAN NOT NULL DEFAULT TRUE,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS device (
    id           TEXT PRIMARY KEY,
    manufacturer TEXT NOT NULL,
    model_number TEXT NOT NULL,
    device_type  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS register (
    id                 TEXT PRIMARY KEY,
    device_model_id    TEXT NOT NULL,
    register_number    INTEGER NOT NULL,
    field_name         TEXT NOT NULL,
    unit               TEXT NOT NULL,
    data_type          TEXT NOT NULL,
    bacnet_object_type INTEGER NOT NULL,
    bacnet_instance    BIGINT NOT NULL,
    property           BIGINT NOT NULL,
    active             BOOLEAN NOT NULL DEFAULT TRUE,
    UNIQUE (device_model_id, register_number)
);

CREATE TABLE IF NOT EXISTS meter (
    meter_id         TEXT NOT NULL,
    meter_element_id INTEGER NOT NULL,
    name             TEXT NOT NULL,
    ip               TEXT NOT NULL,
    port             INTEGER NOT NULL,
    active           BOOLEAN NOT NULL DEFAULT TRUE,
    device_model_id  TEXT NOT NULL,
    tenant_id        TEXT NOT NULL,
    location_id      TEXT,
    PRIMARY KEY (meter_id, meter_element_id)
);
CREATE INDEX IF NOT EXISTS meter_active_idx ON meter (active);

CREATE TABLE IF NOT EXISTS meter_reading (
    id              BIGSERIAL PRIMARY KEY,
    meter_id        TEXT NOT NULL,
    element_id      INTEGER NOT NULL,
    timestamp       TIMESTAMPTZ NOT NULL,
    data_point      TEXT NOT NULL,
    value           DOUBLE PRECISION NOT NULL,
    unit            TEXT NOT NULL,
    is_synchronized BOOLEAN NOT NULL DEFAULT FALSE,
    sync_status     TEXT NOT NULL DEFAULT 'pending',
    retry_count     INTEGER NOT NULL DEFAULT 0,
    last_error      TEXT,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (meter_id, element_id, timestamp, data_point)
);
CREATE INDEX IF NOT EXISTS meter_reading_sync_idx ON meter_reading (sync_status, created_at);
CREATE INDEX IF NOT EXISTS meter_reading_created_idx ON meter_reading (created_at);

CREATE TABLE IF NOT EXISTS device_register (
    device_model_id TEXT NOT NULL,
    register_id     TEXT NOT NULL,
    active          BOOLEAN NOT NULL DEFAULT TRUE,
    PRIMARY KEY (device_model_id, register_id)
);
"#;

/// Create the local tables and indexes if they do not exist yet.
pub async fn bootstrap_schema(pool: &Pool) -> Result<(), DbError> {
    let client = pool.get().await?;
    client.batch_execute(SCHEMA).await?;
    tracing::debug!("local schema bootstrapped");
    Ok(())
}

/// Cheap liveness probe for `GET /health`.
pub async fn ping(pool: &Pool) -> bool {
    match pool.get().await {
        Ok(client) => client.simple_query("SELECT 1").await.is_ok(),
        Err(_) => false,
    }
}

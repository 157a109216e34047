use std::path::{Path, PathBuf};

use surrealdb::engine::local::{Db, Mem, SurrealKv};
use surrealdb::Surreal;

use crate::store::StoreError;

/// Wrapper around the SurrealDB handle.
/// Clone is cheap (Arc internally).
#[derive(Clone)]
pub struct DbHandle {
    pub db: Surreal<Db>,
}

/// Database file inside the data directory.
pub fn db_path(data_dir: &Path) -> Result<PathBuf, std::io::Error> {
    std::fs::create_dir_all(data_dir)?;
    Ok(data_dir.join("kip-sync.db"))
}

/// Open the on-disk database and run migrations.
pub async fn init(data_dir: &Path) -> Result<DbHandle, StoreError> {
    let path = db_path(data_dir).map_err(|e| StoreError::DbError(format!("data dir: {e}")))?;
    let db = Surreal::new::<SurrealKv>(path).await.map_err(|e| StoreError::DbError(e.to_string()))?;
    prepare(db).await
}

/// Throwaway in-memory database, used by tests.
pub async fn init_memory() -> Result<DbHandle, StoreError> {
    let db = Surreal::new::<Mem>(()).await.map_err(|e| StoreError::DbError(e.to_string()))?;
    prepare(db).await
}

async fn prepare(db: Surreal<Db>) -> Result<DbHandle, StoreError> {
    db.use_ns("kip")
        .use_db("sync")
        .await
        .map_err(|e| StoreError::DbError(e.to_string()))?;

    run_migrations(&db).await?;

    Ok(DbHandle { db })
}

/// Run schema migrations. DEFINE statements are idempotent.
async fn run_migrations(db: &Surreal<Db>) -> Result<(), StoreError> {
    db.query(SCHEMA_V1)
        .await
        .map_err(|e| StoreError::DbError(e.to_string()))?
        .check()
        .map_err(|e| StoreError::DbError(e.to_string()))?;
    Ok(())
}

const SCHEMA_V1: &str = "
    DEFINE TABLE OVERWRITE job SCHEMAFULL;
    DEFINE FIELD OVERWRITE task_id ON job TYPE int;
    DEFINE FIELD OVERWRITE connection_id ON job TYPE int;
    DEFINE FIELD OVERWRITE trigger ON job TYPE string;
    DEFINE FIELD OVERWRITE status ON job TYPE string;
    DEFINE FIELD OVERWRITE start_time ON job TYPE string;
    DEFINE FIELD OVERWRITE end_time ON job TYPE option<string>;
    DEFINE FIELD OVERWRITE files_transferred ON job TYPE int DEFAULT 0;
    DEFINE FIELD OVERWRITE bytes_transferred ON job TYPE int DEFAULT 0;
    DEFINE FIELD OVERWRITE files_deleted ON job TYPE int DEFAULT 0;
    DEFINE FIELD OVERWRITE error_count ON job TYPE int DEFAULT 0;
    DEFINE FIELD OVERWRITE error_message ON job TYPE option<string>;
    DEFINE INDEX OVERWRITE idx_job_task ON job FIELDS task_id;

    DEFINE TABLE OVERWRITE job_log SCHEMAFULL;
    DEFINE FIELD OVERWRITE job ON job_log TYPE string;
    DEFINE FIELD OVERWRITE seq ON job_log TYPE int;
    DEFINE FIELD OVERWRITE level ON job_log TYPE string;
    DEFINE FIELD OVERWRITE action ON job_log TYPE string;
    DEFINE FIELD OVERWRITE path ON job_log TYPE string;
    DEFINE FIELD OVERWRITE size ON job_log TYPE int;
    DEFINE FIELD OVERWRITE timestamp ON job_log TYPE string;
    DEFINE FIELD OVERWRITE message ON job_log TYPE string DEFAULT '';
    DEFINE INDEX OVERWRITE idx_job_log_job ON job_log FIELDS job;
";

use std::str::FromStr;

use sqlx::{Error, Pool, Sqlite, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions};
use utils::assets::db_path;

pub mod models;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Clone)]
pub struct DBService {
    pub pool: Pool<Sqlite>,
}

impl DBService {
    pub async fn new() -> Result<DBService, Error> {
        let database_url = format!("sqlite://{}", db_path().to_string_lossy());
        let options = SqliteConnectOptions::from_str(&database_url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        MIGRATOR.run(&pool).await?;
        tracing::debug!("Database ready at {}", db_path().display());
        Ok(DBService { pool })
    }

    /// Wrap an existing pool (used by tests running against in-memory SQLite).
    pub fn from_pool(pool: Pool<Sqlite>) -> DBService {
        DBService { pool }
    }
}

//! Shared helpers for model and service tests.

use std::str::FromStr;

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

/// In-memory SQLite pool with the real migrations applied.
///
/// A single connection keeps the in-memory database alive for the whole
/// test.
pub async fn setup_test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("invalid sqlite config")
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("failed to open sqlite memory db");

    crate::MIGRATOR
        .run(&pool)
        .await
        .expect("failed to run migrations");

    pool
}

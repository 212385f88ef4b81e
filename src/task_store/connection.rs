//! SQLite pool setup: WAL journal mode, foreign keys enabled, bounded
//! connection pool with a busy timeout so concurrent readers never see
//! `SQLITE_BUSY` under normal load.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use crate::errors::{DomainError, DomainResult};
use crate::task_store::migrations::{all_embedded_migrations, Migrator};

/// Opens (creating if necessary) a SQLite database at `path`, applies
/// embedded migrations, and returns a ready connection pool.
pub async fn connect(path: &str) -> DomainResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(path)
        .map_err(|e| DomainError::Database(e.to_string()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(10)
        .idle_timeout(Duration::from_secs(30))
        .max_lifetime(Duration::from_secs(1800))
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await?;

    Migrator::new(pool.clone())
        .run(all_embedded_migrations())
        .await
        .map_err(|e| DomainError::Database(e.to_string()))?;

    Ok(pool)
}

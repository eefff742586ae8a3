pub mod account;
pub mod category;
pub mod connection;
pub mod goal;
pub mod txn;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Error as SqlxError;
use thiserror::Error;

pub use account::Reconciled;
pub use goal::ContributionOutcome;
pub use txn::PendingCount;

#[derive(Debug, Error)]
pub enum Error {
    #[error("conflicting data already exists")]
    AlreadyExists,
    #[error("no matching row found")]
    NotFound,
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Database(#[from] SqlxError),
    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        self.to_string() == other.to_string()
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// Maps a failed insert to `AlreadyExists` when a uniqueness constraint was
/// the cause. SQLite reports primary-key conflicts as 1555 and secondary
/// unique indexes as 2067.
pub(crate) fn map_insert_error(err: SqlxError) -> Error {
    if let SqlxError::Database(ref db) = err {
        if matches!(db.code().as_deref(), Some("1555") | Some("2067")) {
            return Error::AlreadyExists;
        }
    }

    Error::Database(err)
}

pub(crate) fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

pub struct SqliteStore {
    conn: Arc<sqlx::pool::Pool<sqlx::sqlite::Sqlite>>,
}

impl SqliteStore {
    pub async fn new(uri: &str) -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new().connect(uri).await?;

        let mut conn = pool.acquire().await?;
        sqlx::migrate!("./migrations").run(&mut conn).await?;

        Ok(Self {
            conn: Arc::new(pool),
        })
    }

    pub fn connections(&mut self) -> connection::Store {
        connection::Store::new(self)
    }

    pub fn accounts(&mut self) -> account::Store {
        account::Store::new(self)
    }

    pub fn txns(&mut self) -> txn::Store {
        txn::Store::new(self)
    }

    pub fn categories(&mut self) -> category::Store {
        category::Store::new(self)
    }

    pub fn goals(&mut self) -> goal::Store {
        goal::Store::new(self)
    }
}

//! Storage backends for recall.
//!
//! Every backend implements [`Db`], which bundles the scheduler-facing
//! [`Catalog`] and [`ProgressStore`] traits with the catalog CRUD the
//! surrounding application needs. [`BackendConfig`] picks one from the
//! environment.

mod memory;
mod postgres;
mod sqlite;

use std::path::{Path, PathBuf};

use chrono::{DateTime, SubsecRound, Utc};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use recall_core::{Card, Catalog, FlashcardSet, ProgressStore};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use self::postgres::PostgresDb;
pub use sqlite::SqliteDb;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("postgres error: {0}")]
    Postgres(#[from] ::postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("failed to create TLS connector: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("{0}")]
    Config(String),

    #[error("{0} lock poisoned")]
    Poisoned(&'static str),

    /// A stored row could not be decoded into a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("set {0} does not exist")]
    UnknownSet(Uuid),
}

impl From<DbError> for recall_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Corrupt(message) => recall_core::Error::InvalidInput(message),
            other => recall_core::Error::store(other),
        }
    }
}

/// A complete backend: scheduler seams plus catalog maintenance.
pub trait Db: Catalog + ProgressStore + Send + Sync {
    fn init(&self) -> DbResult<()>;
    fn create_set(&self, owner_id: &str, title: &str, is_public: bool) -> DbResult<FlashcardSet>;
    fn add_card(&self, set_id: Uuid, question: &str, answer: &str) -> DbResult<Card>;
    /// Sets visible to the user, oldest first.
    fn list_sets(&self, user_id: &str) -> DbResult<Vec<FlashcardSet>>;
    /// Removes the card along with every progress and review-log row for it.
    fn delete_card(&self, card_id: Uuid) -> DbResult<()>;
    /// Removes all progress and review-log rows owned by the user.
    fn delete_user_progress(&self, user_id: &str) -> DbResult<usize>;
}

/// Which backend to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Sqlite(PathBuf),
    Postgres(String),
    Memory,
}

impl BackendConfig {
    /// Read `BACKEND`, `DATABASE_URL` and `RECALL_DB_PATH`.
    ///
    /// SQLite at `default_path` is used when `BACKEND` is unset.
    pub fn from_env(default_path: &Path) -> DbResult<Self> {
        let backend = std::env::var("BACKEND").unwrap_or_else(|_| "sqlite".to_string());
        Self::from_parts(
            &backend,
            std::env::var("DATABASE_URL").ok(),
            std::env::var("RECALL_DB_PATH").ok().map(PathBuf::from),
            default_path,
        )
    }

    fn from_parts(
        backend: &str,
        database_url: Option<String>,
        db_path: Option<PathBuf>,
        default_path: &Path,
    ) -> DbResult<Self> {
        match backend {
            "sqlite" => Ok(BackendConfig::Sqlite(
                db_path.unwrap_or_else(|| default_path.to_path_buf()),
            )),
            "postgres" => database_url.map(BackendConfig::Postgres).ok_or_else(|| {
                DbError::Config("DATABASE_URL is required for postgres".to_string())
            }),
            "memory" => Ok(BackendConfig::Memory),
            other => Err(DbError::Config(format!("Unknown BACKEND '{other}'"))),
        }
    }

    /// Connect and create the schema.
    pub fn open(&self) -> DbResult<Box<dyn Db>> {
        let db: Box<dyn Db> = match self {
            BackendConfig::Sqlite(path) => Box::new(SqliteDb::open(path)?),
            BackendConfig::Postgres(url) => {
                let connector = MakeTlsConnector::new(TlsConnector::new()?);
                Box::new(PostgresDb::connect(url, connector)?)
            }
            BackendConfig::Memory => Box::new(MemoryStore::new()),
        };
        db.init()?;
        Ok(db)
    }
}

/// Current time at the microsecond precision every backend stores.
pub(crate) fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Microseconds since the Unix epoch. Integer order is time order across
/// chrono's whole range, including years past 9999.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn decode_ts(column: &str, value: i64) -> DbResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(value)
        .ok_or_else(|| DbError::Corrupt(format!("{column} out of range: {value}")))
}

pub(crate) fn decode_uuid(column: &str, value: &str) -> DbResult<Uuid> {
    Uuid::parse_str(value).map_err(|err| DbError::Corrupt(format!("{column} '{value}': {err}")))
}

pub(crate) fn decode_count(column: &str, value: i64) -> DbResult<u32> {
    u32::try_from(value).map_err(|_| DbError::Corrupt(format!("{column} out of range: {value}")))
}

pub(crate) fn decode_quality(value: Option<i64>) -> DbResult<Option<u8>> {
    value
        .map(|quality| {
            u8::try_from(quality)
                .ok()
                .filter(|quality| *quality <= 5)
                .ok_or_else(|| DbError::Corrupt(format!("quality out of range: {quality}")))
        })
        .transpose()
}

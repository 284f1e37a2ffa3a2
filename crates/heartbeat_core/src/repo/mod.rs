//! Repository layer: SQLite persistence for pipeline state and documents.
//!
//! # Responsibility
//! - Persist the observer cursor and the installation identity.
//! - Provide the keyed document store the sinks write through.
//!
//! # Invariants
//! - Keys are upserted; a later write to the same key replaces the earlier one.
//! - Read paths reject corrupt persisted values instead of masking them.

use crate::db::DbError;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod document_repo;
pub mod state_repo;

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for state and document persistence.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    InvalidData(String),
    InvalidInput(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::InvalidData(_) | Self::InvalidInput(_) => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

pub(crate) fn lock_conn<T>(conn: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic mid-statement leaves SQLite itself consistent.
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

//! redb-backed persistence for found studies and received images

pub mod database_manager;
pub mod store;

use thiserror::Error;

pub use database_manager::DatabaseManager;
pub use store::RedbStore;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database registry lock poisoned: {0}")]
    Lock(String),
}

impl From<PersistenceError> for dimse::DimseError {
    fn from(e: PersistenceError) -> Self {
        dimse::DimseError::Persistence(e.to_string())
    }
}

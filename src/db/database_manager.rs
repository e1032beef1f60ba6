use once_cell::sync::OnceCell;
use redb::{Database, TableDefinition};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::PersistenceError;

/// Global database manager for handling shared database instances.
/// redb holds an exclusive lock per file, so every user of a path shares one handle.
static GLOBAL_DB_MANAGER: OnceCell<DatabaseManager> = OnceCell::new();

/// Maps database file paths to their shared `Arc<Database>` instances
pub struct DatabaseManager {
    databases: Mutex<HashMap<PathBuf, Arc<Database>>>,
}

impl DatabaseManager {
    fn new() -> Self {
        Self {
            databases: Mutex::new(HashMap::new()),
        }
    }

    /// Get the global database manager instance
    pub fn global() -> &'static DatabaseManager {
        GLOBAL_DB_MANAGER.get_or_init(DatabaseManager::new)
    }

    /// Get or create the shared database instance for a path
    pub fn get_or_create_database(&self, db_path: &Path) -> Result<Arc<Database>, PersistenceError> {
        let db_path_buf = db_path.to_path_buf();
        let mut map = self
            .databases
            .lock()
            .map_err(|e| PersistenceError::Lock(e.to_string()))?;

        if let Some(existing_db) = map.get(&db_path_buf) {
            tracing::debug!("Reusing database instance for {}", db_path_buf.display());
            return Ok(existing_db.clone());
        }

        let db = Self::create_database(&db_path_buf)?;
        map.insert(db_path_buf, db.clone());
        Ok(db)
    }

    fn create_database(db_path: &Path) -> Result<Arc<Database>, PersistenceError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        tracing::info!("Opening database {}", db_path.display());
        Ok(Arc::new(Database::create(db_path)?))
    }

    /// Create the given tables if they do not exist yet
    pub fn initialize_tables(
        &self,
        db: &Database,
        table_definitions: &[TableDefinition<&'static str, &'static str>],
    ) -> Result<(), PersistenceError> {
        let write_txn = db.begin_write()?;
        for table_def in table_definitions {
            write_txn.open_table(*table_def)?;
        }
        write_txn.commit()?;

        tracing::debug!("Initialized {} tables", table_definitions.len());
        Ok(())
    }

    /// Paths of the databases currently open
    pub fn open_paths(&self) -> Result<Vec<PathBuf>, PersistenceError> {
        let map = self
            .databases
            .lock()
            .map_err(|e| PersistenceError::Lock(e.to_string()))?;
        Ok(map.keys().cloned().collect())
    }

    /// Forget the shared instance for a path; it closes once the last handle drops
    pub fn close_database(&self, db_path: &Path) -> Result<bool, PersistenceError> {
        let mut map = self
            .databases
            .lock()
            .map_err(|e| PersistenceError::Lock(e.to_string()))?;

        let removed = map.remove(db_path).is_some();
        if removed {
            tracing::info!("Closed database {}", db_path.display());
        }
        Ok(removed)
    }
}

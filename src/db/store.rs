use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dimse::{FoundStudy, ImageRecord, Insert, PersistenceAdapter, Retrieval};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{DatabaseManager, PersistenceError};

/// Studies found by C-FIND, keyed by StudyInstanceUID
const STUDIES_FIND: TableDefinition<&str, &str> = TableDefinition::new("studies_find");
/// Stored images, keyed by SOPInstanceUID
const IMAGES: TableDefinition<&str, &str> = TableDefinition::new("images");

/// Persistence adapter over a redb file.
///
/// Records are stored as JSON. Inserts check for the key inside the same
/// write transaction, so concurrent duplicate deliveries resolve to exactly
/// one `Inserted`.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").field("path", &self.path).finish()
    }
}

impl RedbStore {
    /// Open or create the database at `path`, sharing the handle with other
    /// stores on the same path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let manager = DatabaseManager::global();
        let db = manager.get_or_create_database(&path)?;
        manager.initialize_tables(&db, &[STUDIES_FIND, IMAGES])?;
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn insert_new<T: Serialize>(
        &self,
        table: TableDefinition<&str, &str>,
        key: &str,
        value: &T,
    ) -> Result<Insert, PersistenceError> {
        let json = serde_json::to_string(value)?;
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(table)?;
            if table.get(key)?.is_some() {
                Insert::Duplicate
            } else {
                table.insert(key, json.as_str())?;
                Insert::Inserted
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    fn get<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &str>,
        key: &str,
    ) -> Result<Option<T>, PersistenceError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        match table.get(key)? {
            Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
            None => Ok(None),
        }
    }

    fn all<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &str>,
    ) -> Result<Vec<T>, PersistenceError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        let mut values = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            values.push(serde_json::from_str(value.value())?);
        }
        Ok(values)
    }

    pub fn found_study(&self, study_uid: &str) -> Result<Option<FoundStudy>, PersistenceError> {
        self.get(STUDIES_FIND, study_uid)
    }

    pub fn found_studies(&self) -> Result<Vec<FoundStudy>, PersistenceError> {
        self.all(STUDIES_FIND)
    }

    pub fn image(&self, sop_uid: &str) -> Result<Option<ImageRecord>, PersistenceError> {
        self.get(IMAGES, sop_uid)
    }

    pub fn images(&self) -> Result<Vec<ImageRecord>, PersistenceError> {
        self.all(IMAGES)
    }

    pub fn image_count(&self) -> Result<u64, PersistenceError> {
        let read_txn = self.db.begin_read()?;
        Ok(read_txn.open_table(IMAGES)?.len()?)
    }

    fn mark_retrieved(&self, study_uid: &str) -> Result<Retrieval, PersistenceError> {
        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(STUDIES_FIND)?;
            let existing = table.get(study_uid)?.map(|v| v.value().to_string());
            match existing {
                None => Retrieval::NotFound,
                Some(json) => {
                    let mut study: FoundStudy = serde_json::from_str(&json)?;
                    if study.retrieved_on.is_some() {
                        Retrieval::AlreadyRetrieved
                    } else {
                        study.retrieved_on = Some(Utc::now());
                        let json = serde_json::to_string(&study)?;
                        table.insert(study_uid, json.as_str())?;
                        Retrieval::Marked
                    }
                }
            }
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    fn pending(&self) -> Result<Vec<String>, PersistenceError> {
        let mut pending: Vec<String> = self
            .found_studies()?
            .into_iter()
            .filter(|s| s.retrieved_on.is_none())
            .map(|s| s.study_uid)
            .collect();
        pending.sort();
        Ok(pending)
    }
}

impl PersistenceAdapter for RedbStore {
    fn add_found_study(&self, study: &FoundStudy) -> dimse::Result<Insert> {
        Ok(self.insert_new(STUDIES_FIND, &study.study_uid, study)?)
    }

    fn add_image(&self, image: &ImageRecord) -> dimse::Result<Insert> {
        Ok(self.insert_new(IMAGES, &image.sop_uid, image)?)
    }

    fn update_retrieved_study(&self, study_uid: &str) -> dimse::Result<Retrieval> {
        Ok(self.mark_retrieved(study_uid)?)
    }

    fn studies_pending_move(&self) -> dimse::Result<Vec<String>> {
        Ok(self.pending()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn image(sop_uid: &str, study_uid: &str) -> ImageRecord {
        ImageRecord {
            sop_uid: sop_uid.to_string(),
            sop_class_uid: None,
            series_uid: None,
            study_uid: Some(study_uid.to_string()),
            patient_id: Some("PAT1".to_string()),
            study_date: None,
            modality: Some("CT".to_string()),
            manufacturer: None,
            institution: Some("unknown_20210105".to_string()),
            filepath: None,
            received_on: Utc::now(),
        }
    }

    #[test]
    fn test_found_study_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(dir.path().join("pacs.redb")).unwrap();

        let study = FoundStudy::new("1.2.3");
        assert_eq!(store.add_found_study(&study).unwrap(), Insert::Inserted);
        assert_eq!(store.add_found_study(&study).unwrap(), Insert::Duplicate);
        assert_eq!(store.add_found_study(&FoundStudy::new("1.2.4")).unwrap(), Insert::Inserted);
        assert_eq!(store.studies_pending_move().unwrap(), vec!["1.2.3", "1.2.4"]);

        assert_eq!(store.update_retrieved_study("1.2.3").unwrap(), Retrieval::Marked);
        assert_eq!(store.update_retrieved_study("1.2.3").unwrap(), Retrieval::AlreadyRetrieved);
        assert_eq!(store.update_retrieved_study("9.9.9").unwrap(), Retrieval::NotFound);
        assert_eq!(store.studies_pending_move().unwrap(), vec!["1.2.4"]);
        assert!(store.found_study("1.2.3").unwrap().unwrap().retrieved_on.is_some());
    }

    #[test]
    fn test_images_are_keyed_by_sop_uid() {
        let dir = TempDir::new().unwrap();
        let store = RedbStore::open(dir.path().join("pacs.redb")).unwrap();

        assert_eq!(store.add_image(&image("1.1", "1.2.3")).unwrap(), Insert::Inserted);
        assert_eq!(store.add_image(&image("1.1", "1.2.3")).unwrap(), Insert::Duplicate);
        assert_eq!(store.add_image(&image("1.2", "1.2.3")).unwrap(), Insert::Inserted);
        assert_eq!(store.image_count().unwrap(), 2);
        assert_eq!(store.image("1.2").unwrap().unwrap().modality.as_deref(), Some("CT"));
        assert!(store.image("7.7").unwrap().is_none());
    }

    #[test]
    fn test_reopen_shares_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pacs.redb");
        let first = RedbStore::open(&path).unwrap();
        first.add_found_study(&FoundStudy::new("5.5")).unwrap();

        let second = RedbStore::open(&path).unwrap();
        assert_eq!(second.found_studies().unwrap().len(), 1);
        assert_eq!(second.path(), path.as_path());
    }
}

//! Common types for DIMSE operations

use dicom_core::{Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{DimseError, Result};

/// DIMSE status codes used across the engine
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const PENDING: u16 = 0xFF00;
    pub const PENDING_WARNING: u16 = 0xFF01;
    pub const CANCEL: u16 = 0xFE00;

    /// Generic failure, also reported when the remote never produced a status
    pub const FAILURE: u16 = 0xC000;
    /// Sentinel reported for a move whose association never produced a status
    pub const MOVE_FAILED: u16 = FAILURE;
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;

    /// Storage SCP: dataset could not be decoded
    pub const UNABLE_TO_DECODE: u16 = 0xC215;
    /// Storage SCP: file could not be written
    pub const UNABLE_TO_PROCESS: u16 = 0xC216;
    /// Storage SCP: file written but not recorded by the persistence adapter
    pub const UNABLE_TO_RECORD: u16 = 0xC217;

    /// Whether the status announces more responses to come
    pub fn is_pending(status: u16) -> bool {
        status == PENDING || status == PENDING_WARNING
    }
}

/// DICOM query/retrieve levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryLevel {
    /// Patient level, keyed by PatientID
    Patient,
    /// Study level, keyed by StudyInstanceUID
    Study,
}

impl QueryLevel {
    /// Identifier element that names one resource at this level
    pub fn key_tag(&self) -> Tag {
        match self {
            QueryLevel::Patient => tags::PATIENT_ID,
            QueryLevel::Study => tags::STUDY_INSTANCE_UID,
        }
    }

    pub fn key_vr(&self) -> VR {
        match self {
            QueryLevel::Patient => VR::LO,
            QueryLevel::Study => VR::UI,
        }
    }
}

impl std::fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryLevel::Patient => write!(f, "PATIENT"),
            QueryLevel::Study => write!(f, "STUDY"),
        }
    }
}

impl std::str::FromStr for QueryLevel {
    type Err = DimseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PATIENT" => Ok(QueryLevel::Patient),
            "STUDY" => Ok(QueryLevel::Study),
            _ => Err(DimseError::config(format!("Invalid query level: {}", s))),
        }
    }
}

/// Directory nesting used when persisting received objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StorageSortKey {
    /// `<root>/<PatientID>/<StudyInstanceUID>/<SeriesInstanceUID>/<SOPInstanceUID>.dcm`
    #[default]
    Patient,
    /// `<root>/<StudyInstanceUID>/<SeriesInstanceUID>/<SOPInstanceUID>.dcm`
    Study,
    /// `<root>/<SOPInstanceUID>.dcm`
    Image,
}

impl StorageSortKey {
    /// Compute the destination path for an object with the given identifiers
    pub fn path_for(&self, root: &Path, ids: &ObjectIds) -> PathBuf {
        let mut path = root.to_path_buf();
        match self {
            StorageSortKey::Patient => {
                path.push(path_component(&ids.patient_id));
                path.push(path_component(&ids.study_uid));
                path.push(path_component(&ids.series_uid));
            }
            StorageSortKey::Study => {
                path.push(path_component(&ids.study_uid));
                path.push(path_component(&ids.series_uid));
            }
            StorageSortKey::Image => {}
        }
        path.push(format!("{}.dcm", path_component(&ids.sop_uid)));
        path
    }
}

impl std::fmt::Display for StorageSortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageSortKey::Patient => write!(f, "PATIENT"),
            StorageSortKey::Study => write!(f, "STUDY"),
            StorageSortKey::Image => write!(f, "IMAGE"),
        }
    }
}

impl std::str::FromStr for StorageSortKey {
    type Err = DimseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PATIENT" => Ok(StorageSortKey::Patient),
            "STUDY" => Ok(StorageSortKey::Study),
            "IMAGE" => Ok(StorageSortKey::Image),
            _ => Err(DimseError::config(format!("Invalid storage sort key: {}", s))),
        }
    }
}

// PatientID is free text; keep it from escaping the storage root.
fn path_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Identifiers that address one stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectIds {
    pub patient_id: String,
    pub study_uid: String,
    pub series_uid: String,
    pub sop_uid: String,
}

impl ObjectIds {
    /// Read the four identifiers from a dataset; all must be present
    pub fn from_dataset(obj: &InMemDicomObject) -> Result<Self> {
        let get = |tag: Tag, name: &str| {
            element_str(obj, tag)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| DimseError::Decode(format!("dataset has no {}", name)))
        };
        Ok(Self {
            patient_id: get(tags::PATIENT_ID, "PatientID")?,
            study_uid: get(tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?,
            series_uid: get(tags::SERIES_INSTANCE_UID, "SeriesInstanceUID")?,
            sop_uid: get(tags::SOP_INSTANCE_UID, "SOPInstanceUID")?,
        })
    }
}

/// Read an element as a trimmed string
pub fn element_str(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches(['\0', ' ']).trim_start().to_string())
}

/// A C-FIND key the query engine knows how to request
#[derive(Debug, Clone, Copy)]
pub struct SearchField {
    pub name: &'static str,
    pub tag: Tag,
    pub vr: VR,
}

const fn field(name: &'static str, tag: Tag, vr: VR) -> SearchField {
    SearchField { name, tag, vr }
}

/// Keys always sent with a query, in this order
pub const SEARCH_FIELDS: [&str; 3] = ["Modality", "PatientName", "StudyDate"];

/// Every key that can be requested from a C-FIND
pub const SUPPORTED_FIELDS: &[SearchField] = &[
    field("PatientName", tags::PATIENT_NAME, VR::PN),
    field("PatientID", tags::PATIENT_ID, VR::LO),
    field("PatientBirthDate", tags::PATIENT_BIRTH_DATE, VR::DA),
    field("PatientSex", tags::PATIENT_SEX, VR::CS),
    field("PatientAge", tags::PATIENT_AGE, VR::AS),
    field("StudyInstanceUID", tags::STUDY_INSTANCE_UID, VR::UI),
    field("StudyDate", tags::STUDY_DATE, VR::DA),
    field("StudyTime", tags::STUDY_TIME, VR::TM),
    field("StudyID", tags::STUDY_ID, VR::SH),
    field("StudyDescription", tags::STUDY_DESCRIPTION, VR::LO),
    field("AccessionNumber", tags::ACCESSION_NUMBER, VR::SH),
    field("Modality", tags::MODALITY, VR::CS),
    field("ModalitiesInStudy", tags::MODALITIES_IN_STUDY, VR::CS),
    field("InstitutionName", tags::INSTITUTION_NAME, VR::LO),
    field("ReferringPhysicianName", tags::REFERRING_PHYSICIAN_NAME, VR::PN),
    field("NumberOfStudyRelatedSeries", tags::NUMBER_OF_STUDY_RELATED_SERIES, VR::IS),
    field("NumberOfStudyRelatedInstances", tags::NUMBER_OF_STUDY_RELATED_INSTANCES, VR::IS),
    field("SeriesInstanceUID", tags::SERIES_INSTANCE_UID, VR::UI),
    field("SeriesDescription", tags::SERIES_DESCRIPTION, VR::LO),
    field("BodyPartExamined", tags::BODY_PART_EXAMINED, VR::CS),
    field("Manufacturer", tags::MANUFACTURER, VR::LO),
];

/// Resolve a field name against [`SUPPORTED_FIELDS`]
pub fn lookup_field(name: &str) -> Result<SearchField> {
    SUPPORTED_FIELDS
        .iter()
        .find(|f| f.name == name)
        .copied()
        .ok_or_else(|| DimseError::invalid_query(format!("unsupported search field: {}", name)))
}

/// One record returned by a C-FIND, keyed by field name.
///
/// Every requested field is present; fields the remote omitted are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindResult {
    values: BTreeMap<String, Option<String>>,
}

impl FindResult {
    /// Extract `fields` from a response identifier
    pub fn from_identifier(identifier: &InMemDicomObject, fields: &[SearchField]) -> Self {
        let values = fields
            .iter()
            .map(|f| (f.name.to_string(), element_str(identifier, f.tag)))
            .collect();
        Self { values }
    }

    /// Value of a field, `None` when absent or not requested
    pub fn get(&self, field: &str) -> Option<&str> {
        self.values.get(field).and_then(|v| v.as_deref())
    }

    /// Set a field value
    pub fn insert(&mut self, field: impl Into<String>, value: Option<String>) {
        self.values.insert(field.into(), value);
    }

    /// Whether `field` is part of this record (even as null)
    pub fn contains(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    pub fn values(&self) -> &BTreeMap<String, Option<String>> {
        &self.values
    }

    pub fn into_values(self) -> BTreeMap<String, Option<String>> {
        self.values
    }
}

impl FromIterator<(String, Option<String>)> for FindResult {
    fn from_iter<I: IntoIterator<Item = (String, Option<String>)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Sub-operation counters reported in C-MOVE responses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubOperations {
    pub remaining: Option<u16>,
    pub completed: Option<u16>,
    pub failed: Option<u16>,
    pub warning: Option<u16>,
}

/// Result of moving one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveOutcome {
    /// DIMSE status, or [`status::MOVE_FAILED`] when none was received
    pub status: u16,
    /// PatientID or StudyInstanceUID that was requested
    pub identifier: String,
    pub sub_operations: SubOperations,
}

impl MoveOutcome {
    /// Synthetic outcome for a move that never got a status from the remote
    pub fn failed(identifier: impl Into<String>) -> Self {
        Self {
            status: status::MOVE_FAILED,
            identifier: identifier.into(),
            sub_operations: SubOperations::default(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == status::SUCCESS
    }

    pub fn is_pending(&self) -> bool {
        status::is_pending(self.status)
    }
}

/// Status returned by the remote for one C-STORE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatus {
    pub status: u16,
}

impl StoreStatus {
    pub fn is_success(&self) -> bool {
        self.status == status::SUCCESS
    }
}

/// An object the Storage SCP has written to disk
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub path: PathBuf,
    pub ids: ObjectIds,
    pub sop_class_uid: String,
    pub transfer_syntax: String,
    /// AE title of the node that sent the object
    pub calling_ae: String,
    pub dataset: InMemDicomObject,
}

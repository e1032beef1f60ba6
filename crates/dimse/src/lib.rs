//! DIMSE (DICOM Message Service Element) engine
//!
//! Client and server sides of the DICOM network services used by the
//! collection pipeline.
//!
//! # Features
//! - Association lifecycle with guaranteed release
//! - C-ECHO and windowed, sharded C-FIND (SCU)
//! - C-MOVE with a daily time window and a Storage SCP receiving the results
//! - C-STORE of files and directory trees (SCU)
//! - Storage SCP persisting objects under a configurable layout
//! - Persistence adapter boundary for found studies and received images

pub mod association;
pub mod config;
pub mod error;
pub mod find;
pub mod message;
pub mod persistence;
pub mod retrieve;
pub mod scp;
pub mod scu;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::{DicomNode, DimseConfig};
pub use error::{DimseError, Result};
pub use find::{date_windows, DateWindow, FindQuery};
pub use persistence::{FoundStudy, ImageRecord, Insert, MemoryPersistence, PersistenceAdapter, Retrieval};
pub use retrieve::{MoveRequest, MoveWindow};
pub use scp::{StorageOptions, StoreCallback, StoreHandler, StoreScp};
pub use scu::DimseScu;
pub use types::{
    status, FindResult, MoveOutcome, ObjectIds, QueryLevel, StorageSortKey, StoreStatus,
    StoredObject,
};

/// Default DICOM port (non-TLS)
pub const DEFAULT_DIMSE_PORT: u16 = 11112;

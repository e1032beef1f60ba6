//! DICOM collection pipeline: query an archive, pull studies into a local
//! store, push files back out and index what landed on disk.
//!
//! The network engines live in the `dimse` crate. This crate wires them to
//! configuration, logging, the redb store and the bulk file processor.

pub mod collect;
pub mod config;
pub mod db;
pub mod error;
pub mod io;
pub mod logging;
pub mod parse;

pub use config::Config;
pub use db::RedbStore;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use parse::{DicomTag, DicomTagGroup, TagTransform, TagValue};

//! Transmission engine (C-STORE, client side)

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use dicom_dictionary_std::tags;
use dicom_object::OpenFileOptions;
use futures::stream::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::association::{Association, ContextProposal, STORAGE_TRANSFER_SYNTAXES};
use crate::config::DicomNode;
use crate::message::{encode_dataset, store_rq};
use crate::scu::DimseScu;
use crate::types::{status, StoreStatus};
use crate::{DimseError, Result};

/// The upper layer allows at most 128 presentation contexts per association
const MAX_CONTEXTS: usize = 128;

/// Status reported for files the association cannot carry
pub const SOP_CLASS_NOT_SUPPORTED: u16 = 0x0122;

const STATUS_CHANNEL_CAPACITY: usize = 32;

/// Header facts learned from a file before the association is opened
#[derive(Debug, Clone, PartialEq, Eq)]
struct PreparedFile {
    path: PathBuf,
    sop_class_uid: String,
    sop_instance_uid: String,
    transfer_syntax: String,
}

fn is_native(ts: &str) -> bool {
    STORAGE_TRANSFER_SYNTAXES.contains(&ts)
}

/// Every regular file at or under `path`
pub fn collect_files(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    WalkDir::new(path)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

fn prepare(path: &Path) -> Option<PreparedFile> {
    let obj = match OpenFileOptions::new().read_until(tags::PIXEL_DATA).open_file(path) {
        Ok(obj) => obj,
        Err(e) => {
            debug!(path = %path.display(), "Skipping non-DICOM file: {}", e);
            return None;
        }
    };
    let meta = obj.meta();
    Some(PreparedFile {
        path: path.to_path_buf(),
        sop_class_uid: meta.media_storage_sop_class_uid().trim_end_matches('\0').to_string(),
        sop_instance_uid: meta.media_storage_sop_instance_uid().trim_end_matches('\0').to_string(),
        transfer_syntax: meta.transfer_syntax().trim_end_matches('\0').to_string(),
    })
}

/// One proposal per SOP class with the native syntaxes, plus one per
/// (SOP class, encapsulated syntax) pair actually present
fn proposals_for(files: &[PreparedFile]) -> Vec<ContextProposal> {
    let mut seen = HashSet::new();
    let mut proposals = Vec::new();
    for file in files {
        let key = if is_native(&file.transfer_syntax) {
            (file.sop_class_uid.clone(), None)
        } else {
            (file.sop_class_uid.clone(), Some(file.transfer_syntax.clone()))
        };
        if !seen.insert(key.clone()) {
            continue;
        }
        let proposal = match key.1 {
            None => ContextProposal::new(key.0, &STORAGE_TRANSFER_SYNTAXES),
            Some(ts) => ContextProposal::new(key.0, &[ts.as_str()]),
        };
        if proposals.len() == MAX_CONTEXTS {
            warn!("More than {} presentation contexts needed, some files will be refused", MAX_CONTEXTS);
            break;
        }
        proposals.push(proposal);
    }
    proposals
}

impl DimseScu {
    /// Send one file or every file under a directory to `node`.
    ///
    /// Files that do not decode as DICOM are skipped and produce no item.
    /// One association carries the whole call. It is opened before this
    /// returns, so an unreachable node is an error here rather than a
    /// stream item.
    pub async fn send_path(
        &self,
        node: &DicomNode,
        path: impl AsRef<Path>,
    ) -> Result<impl Stream<Item = (PathBuf, StoreStatus)>> {
        node.require_network_info()?;
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(DimseError::config(format!("{} does not exist", path.display())));
        }

        let local = self.config.local.clone();
        let remote = node.clone();
        let config = self.config.clone();
        let (files, association) = tokio::task::spawn_blocking(move || -> Result<_> {
            let files: Vec<PreparedFile> = collect_files(&path).iter().filter_map(|p| prepare(p)).collect();
            if files.is_empty() {
                return Ok((files, None));
            }
            let proposals = proposals_for(&files);
            let association = Association::open(&local, &remote, &proposals, &config)?;
            Ok((files, Some(association)))
        })
        .await
        .map_err(|e| DimseError::internal(format!("C-STORE setup task failed: {}", e)))??;

        info!("Sending {} file(s) to {}", files.len(), node);

        let (tx, rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
        if let Some(association) = association {
            tokio::task::spawn_blocking(move || send_files(association, files, &tx));
        }
        Ok(ReceiverStream::new(rx))
    }
}

fn send_files(
    mut association: Association,
    files: Vec<PreparedFile>,
    tx: &mpsc::Sender<(PathBuf, StoreStatus)>,
) {
    let mut broken = false;
    let mut sent = 0usize;
    for file in files {
        let code = if broken {
            status::FAILURE
        } else {
            match send_one(&mut association, &file) {
                Ok(code) => code,
                Err(DimseError::Decode(e)) => {
                    debug!(path = %file.path.display(), "Skipping undecodable file: {}", e);
                    continue;
                }
                Err(e @ DimseError::Connection(_)) => {
                    warn!("C-STORE association lost: {}", e);
                    broken = true;
                    status::FAILURE
                }
                Err(e) => {
                    warn!(path = %file.path.display(), "C-STORE failed: {}", e);
                    status::FAILURE
                }
            }
        };
        if code == status::SUCCESS {
            sent += 1;
        }
        if tx.blocking_send((file.path, StoreStatus { status: code })).is_err() {
            debug!("C-STORE consumer went away, stopping");
            break;
        }
    }
    info!(peer = association.peer(), sent, "C-STORE batch finished");
    if let Err(e) = association.release() {
        debug!("Release after C-STORE failed: {}", e);
    }
}

fn send_one(association: &mut Association, file: &PreparedFile) -> Result<u16> {
    let contexts: Vec<_> = association
        .accepted_contexts()
        .iter()
        .filter(|c| c.abstract_syntax == file.sop_class_uid)
        .cloned()
        .collect();
    let context = contexts
        .iter()
        .find(|c| c.transfer_syntax == file.transfer_syntax)
        .or_else(|| {
            if is_native(&file.transfer_syntax) {
                contexts.iter().find(|c| is_native(&c.transfer_syntax))
            } else {
                None
            }
        });
    let Some(context) = context else {
        warn!(
            path = %file.path.display(),
            sop_class = %file.sop_class_uid,
            "No accepted presentation context for file"
        );
        return Ok(SOP_CLASS_NOT_SUPPORTED);
    };

    let obj = dicom_object::open_file(&file.path)
        .map_err(|e| DimseError::Decode(format!("{}: {}", file.path.display(), e)))?;
    let data = encode_dataset(&obj, &context.transfer_syntax)?;

    let message_id = association.next_message_id();
    association.send_message(
        context.id,
        &store_rq(message_id, &file.sop_class_uid, &file.sop_instance_uid),
        Some(&data),
    )?;
    let response = association.receive_message()?;
    response
        .status()
        .ok_or_else(|| DimseError::operation_failed("C-STORE response without status"))
}

//! Storage SCP (C-STORE, server side)
//!
//! The listener runs on tokio; each association is handed to a blocking
//! task that drives the dicom-ul server association until release.

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dicom_dictionary_std::{tags, uids};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::association::server::ServerAssociationOptions;
use dicom_ul::association::Association;
use dicom_ul::pdu::Pdu;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DicomNode, DimseConfig};
use crate::message::{
    command_field, decode_dataset, echo_rsp, message_pdus, store_rsp, unrecognized_rsp,
    DimseMessage, MessageAssembler,
};
use crate::persistence::{ImageRecord, Insert, PersistenceAdapter, Retrieval};
use crate::types::{status, ObjectIds, StorageSortKey, StoredObject};
use crate::{DimseError, Result};

/// Called after an object has been stored
pub type StoreCallback = Arc<dyn Fn(&StoredObject) + Send + Sync>;

/// Where and how received objects are persisted
#[derive(Clone)]
pub struct StorageOptions {
    pub root: PathBuf,
    pub sort_by: StorageSortKey,
    pub persistence: Option<Arc<dyn PersistenceAdapter>>,
    pub callbacks: Vec<StoreCallback>,
}

impl StorageOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sort_by: StorageSortKey::default(),
            persistence: None,
            callbacks: Vec::new(),
        }
    }

    pub fn with_sort_by(mut self, sort_by: StorageSortKey) -> Self {
        self.sort_by = sort_by;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn PersistenceAdapter>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_callback(mut self, callback: StoreCallback) -> Self {
        self.callbacks.push(callback);
        self
    }
}

/// An incoming C-STORE as received on the wire
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub transfer_syntax: String,
    pub calling_ae: String,
    /// Data set encoded in `transfer_syntax`
    pub data: Vec<u8>,
}

/// Per-reception handler: decode, write, record, notify
pub struct StoreHandler {
    options: StorageOptions,
}

impl StoreHandler {
    pub fn new(options: StorageOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Handle one reception and return the DIMSE status to answer with
    pub fn handle(&self, event: &StoreEvent) -> u16 {
        match self.store(event) {
            Ok(_) => status::SUCCESS,
            Err(code) => code,
        }
    }

    /// Like [`StoreHandler::handle`], returning the stored object on success.
    ///
    /// Persistence failures return [`status::UNABLE_TO_RECORD`] but leave
    /// the written file in place.
    pub fn store(&self, event: &StoreEvent) -> std::result::Result<StoredObject, u16> {
        let dataset = decode_dataset(&event.data, &event.transfer_syntax).map_err(|e| {
            warn!(sop_uid = %event.sop_instance_uid, "Unable to decode received object: {}", e);
            status::UNABLE_TO_DECODE
        })?;
        let file_obj = dataset
            .clone()
            .with_exact_meta(
                FileMetaTableBuilder::new()
                    .media_storage_sop_class_uid(event.sop_class_uid.as_str())
                    .media_storage_sop_instance_uid(event.sop_instance_uid.as_str())
                    .transfer_syntax(event.transfer_syntax.trim_end_matches('\0'))
                    .build()
                    .map_err(|e| {
                        warn!(sop_uid = %event.sop_instance_uid, "Unable to build file meta: {}", e);
                        status::UNABLE_TO_DECODE
                    })?,
            );

        let ids = ObjectIds::from_dataset(&dataset).map_err(|e| {
            warn!(sop_uid = %event.sop_instance_uid, "Received object lacks identifiers: {}", e);
            status::UNABLE_TO_DECODE
        })?;
        let path = self.options.sort_by.path_for(&self.options.root, &ids);

        write_atomically(&path, |file| {
            file_obj
                .write_all(file)
                .map_err(|e| DimseError::Storage(e.to_string()))
        })
        .map_err(|e| {
            error!(path = %path.display(), "Failed to write received object: {}", e);
            status::UNABLE_TO_PROCESS
        })?;
        debug!(path = %path.display(), calling_ae = %event.calling_ae, "Stored object");

        if let Some(persistence) = &self.options.persistence {
            record(persistence.as_ref(), &dataset, &ids, &path).map_err(|e| {
                error!(sop_uid = %ids.sop_uid, "Failed to record received object: {}", e);
                status::UNABLE_TO_RECORD
            })?;
        }

        let stored = StoredObject {
            path,
            ids,
            sop_class_uid: event.sop_class_uid.clone(),
            transfer_syntax: event.transfer_syntax.clone(),
            calling_ae: event.calling_ae.clone(),
            dataset,
        };
        for callback in &self.options.callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&stored))).is_err() {
                error!(sop_uid = %stored.ids.sop_uid, "Post-store callback panicked");
            }
        }
        Ok(stored)
    }
}

fn record(
    persistence: &dyn PersistenceAdapter,
    dataset: &InMemDicomObject,
    ids: &ObjectIds,
    path: &Path,
) -> Result<()> {
    let image = ImageRecord::from_dataset(dataset, None, Some(path))?;
    if persistence.add_image(&image)? == Insert::Duplicate {
        debug!(sop_uid = %ids.sop_uid, "Image already recorded");
    }
    if persistence.update_retrieved_study(&ids.study_uid)? == Retrieval::Marked {
        info!(study_uid = %ids.study_uid, "Study marked as retrieved");
    }
    Ok(())
}

/// Write through a temporary file in the target directory, then rename.
/// The final path never holds a partial file.
pub fn write_atomically<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut std::fs::File) -> Result<()>,
{
    let dir = path
        .parent()
        .ok_or_else(|| DimseError::Storage(format!("{} has no parent directory", path.display())))?;
    let io_error = |e: std::io::Error| DimseError::Storage(format!("{}: {}", dir.display(), e));
    std::fs::create_dir_all(dir).map_err(io_error)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".incoming-")
        .suffix(".part")
        .tempfile_in(dir)
        .map_err(io_error)?;
    write(tmp.as_file_mut())?;
    tmp.as_file_mut().flush().map_err(io_error)?;
    tmp.persist(path)
        .map_err(|e| DimseError::Storage(format!("rename to {}: {}", path.display(), e.error)))?;
    Ok(())
}

struct RunningScp {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Storage SCP
pub struct StoreScp {
    node: DicomNode,
    config: DimseConfig,
    handler: Arc<StoreHandler>,
    active_associations: Arc<RwLock<u32>>,
    running: Option<RunningScp>,
}

impl StoreScp {
    /// An SCP answering as `node` and listening on its port
    pub fn new(node: DicomNode, config: DimseConfig, options: StorageOptions) -> Self {
        Self {
            node,
            config,
            handler: Arc::new(StoreHandler::new(options)),
            active_associations: Arc::new(RwLock::new(0)),
            running: None,
        }
    }

    pub fn handler(&self) -> &StoreHandler {
        &self.handler
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Address the listener is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Start listening in the background
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.running.is_some() {
            return Err(DimseError::AlreadyRunning(format!(
                "storage SCP {} is already running",
                self.node.ae_title
            )));
        }
        self.node.validate()?;
        self.config.validate()?;
        let port = self.node.port.ok_or_else(|| {
            DimseError::config(format!("node {} has no port to listen on", self.node.ae_title))
        })?;

        let addr = SocketAddr::new(self.config.bind_addr, port);
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            "Starting storage SCP on {} (AET: {}, root: {})",
            local_addr,
            self.node.ae_title,
            self.handler.options.root.display()
        );

        let shutdown = CancellationToken::new();
        let context = Arc::new(AssociationContext {
            ae_title: self.node.ae_title.clone(),
            max_pdu: self.config.max_pdu_for(&self.node),
            enable_echo: self.config.enable_echo,
            handler: Arc::clone(&self.handler),
        });
        let task = tokio::spawn(accept_loop(
            listener,
            context,
            Arc::clone(&self.active_associations),
            self.config.max_associations,
            shutdown.clone(),
        ));

        self.running = Some(RunningScp {
            shutdown,
            task,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Run until `signal` completes, then shut down
    pub async fn serve<F>(&mut self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        self.shutdown().await;
        Ok(())
    }

    /// Stop accepting associations; a stopped SCP shuts down as a no-op
    pub async fn shutdown(&mut self) {
        if let Some(running) = self.running.take() {
            info!("Shutting down storage SCP {}", self.node.ae_title);
            running.shutdown.cancel();
            if let Err(e) = running.task.await {
                warn!("Storage SCP listener ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for StoreScp {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown.cancel();
        }
    }
}

struct AssociationContext {
    ae_title: String,
    max_pdu: u32,
    enable_echo: bool,
    handler: Arc<StoreHandler>,
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<AssociationContext>,
    active: Arc<RwLock<u32>>,
    max_associations: u32,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer_addr) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                error!("Error accepting connection: {}", e);
                continue;
            }
        };
        debug!("Accepted connection from {}", peer_addr);

        {
            let mut count = active.write().await;
            if *count >= max_associations {
                warn!(
                    "Maximum associations reached, rejecting connection from {}",
                    peer_addr
                );
                drop(stream);
                continue;
            }
            *count += 1;
        }

        let socket = match stream.into_std().and_then(|s| {
            s.set_nonblocking(false)?;
            Ok(s)
        }) {
            Ok(socket) => socket,
            Err(e) => {
                error!("Cannot hand over connection from {}: {}", peer_addr, e);
                *active.write().await -= 1;
                continue;
            }
        };

        let context = Arc::clone(&context);
        let active = Arc::clone(&active);
        tokio::spawn(async move {
            let result =
                tokio::task::spawn_blocking(move || handle_association(socket, peer_addr, &context))
                    .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Error handling association from {}: {}", peer_addr, e),
                Err(e) => error!("Association task for {} failed: {}", peer_addr, e),
            }
            *active.write().await -= 1;
        });
    }
    debug!("Storage SCP listener stopped");
}

fn handle_association(
    socket: std::net::TcpStream,
    peer_addr: SocketAddr,
    context: &AssociationContext,
) -> Result<()> {
    // Any storage SOP class is accepted, including those newer than the
    // dictionary; commands other than C-STORE and C-ECHO are refused per message.
    let mut options = ServerAssociationOptions::new()
        .accept_any()
        .ae_title(context.ae_title.as_str())
        .max_pdu_length(context.max_pdu)
        .promiscuous(true);
    if context.enable_echo {
        options = options.with_abstract_syntax(uids::VERIFICATION);
    }
    for ts in TransferSyntaxRegistry.iter() {
        if !ts.is_unsupported() {
            options = options.with_transfer_syntax(ts.uid());
        }
    }

    let mut association = options
        .establish(socket)
        .map_err(|e| DimseError::connection(format!("negotiation with {} failed: {}", peer_addr, e)))?;

    let calling_ae = association.peer_ae_title().trim().to_string();
    let transfer_syntaxes: HashMap<u8, String> = association
        .presentation_contexts()
        .iter()
        .map(|pc| (pc.id, pc.transfer_syntax.trim_end_matches('\0').to_string()))
        .collect();
    info!("Association from {} ({}) established", peer_addr, calling_ae);

    let mut assembler = MessageAssembler::new();
    loop {
        let pdu = association
            .receive()
            .map_err(|e| DimseError::connection(format!("receive from {}: {}", peer_addr, e)))?;
        match pdu {
            Pdu::PData { data } => {
                for pdv in data {
                    let Some(message) = assembler.push(pdv)? else {
                        continue;
                    };
                    let (pc_id, response) =
                        respond(message, &transfer_syntaxes, &calling_ae, context);
                    // Responses are bare command sets; they fit any negotiated PDU size.
                    for pdu in message_pdus(pc_id, &response, None, 0)? {
                        association.send(&pdu).map_err(|e| {
                            DimseError::connection(format!("send to {}: {}", peer_addr, e))
                        })?;
                    }
                }
            }
            Pdu::ReleaseRQ => {
                association.send(&Pdu::ReleaseRP).map_err(|e| {
                    DimseError::connection(format!("release reply to {}: {}", peer_addr, e))
                })?;
                info!("Association from {} released", peer_addr);
                return Ok(());
            }
            Pdu::AbortRQ { .. } => {
                warn!("Association from {} aborted", peer_addr);
                return Ok(());
            }
            other => {
                return Err(DimseError::operation_failed(format!(
                    "unexpected PDU from {}: {:?}",
                    peer_addr, other
                )));
            }
        }
    }
}

fn respond(
    message: DimseMessage,
    transfer_syntaxes: &HashMap<u8, String>,
    calling_ae: &str,
    context: &AssociationContext,
) -> (u8, InMemDicomObject) {
    let pc_id = message.presentation_context_id;
    let message_id = message.message_id().unwrap_or(0);
    let field = message.command_field().unwrap_or(0);

    let response = match field {
        command_field::C_ECHO_RQ if context.enable_echo => echo_rsp(message_id, status::SUCCESS),
        command_field::C_STORE_RQ => {
            let sop_class_uid = message.command_str(tags::AFFECTED_SOP_CLASS_UID).unwrap_or_default();
            let sop_instance_uid = message
                .command_str(tags::AFFECTED_SOP_INSTANCE_UID)
                .unwrap_or_default();
            let code = match (transfer_syntaxes.get(&pc_id), message.data) {
                (Some(ts), Some(data)) => context.handler.handle(&StoreEvent {
                    sop_class_uid: sop_class_uid.clone(),
                    sop_instance_uid: sop_instance_uid.clone(),
                    transfer_syntax: ts.clone(),
                    calling_ae: calling_ae.to_string(),
                    data,
                }),
                _ => status::UNABLE_TO_DECODE,
            };
            store_rsp(message_id, &sop_class_uid, &sop_instance_uid, code)
        }
        other => {
            warn!("Unsupported DIMSE command {:#06X} from {}", other, calling_ae);
            unrecognized_rsp(other, message_id)
        }
    };
    (pc_id, response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::encode_dataset;
    use crate::persistence::MemoryPersistence;
    use dicom_core::{DataElement, PrimitiveValue, VR};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ct_dataset(sop_uid: &str) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uids::CT_IMAGE_STORAGE)),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop_uid)),
            DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("PAT1")),
            DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3")),
            DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.4")),
            DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")),
        ])
    }

    fn event(sop_uid: &str) -> StoreEvent {
        StoreEvent {
            sop_class_uid: uids::CT_IMAGE_STORAGE.to_string(),
            sop_instance_uid: sop_uid.to_string(),
            transfer_syntax: uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            calling_ae: "MODALITY".to_string(),
            data: encode_dataset(&ct_dataset(sop_uid), uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap(),
        }
    }

    fn files_under(root: &Path) -> Vec<PathBuf> {
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    }

    #[test]
    fn test_duplicate_delivery_leaves_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Arc::new(MemoryPersistence::new());
        let handler = StoreHandler::new(
            StorageOptions::new(dir.path()).with_persistence(persistence.clone()),
        );

        assert_eq!(handler.handle(&event("1.2.3.4.5")), status::SUCCESS);
        assert_eq!(handler.handle(&event("1.2.3.4.5")), status::SUCCESS);

        let files = files_under(dir.path());
        assert_eq!(
            files,
            vec![dir.path().join("PAT1/1.2.3/1.2.3.4/1.2.3.4.5.dcm")]
        );
        assert_eq!(persistence.image_count(), 1);
    }

    #[test]
    fn test_image_sort_writes_flat_file() {
        let dir = tempfile::tempdir().unwrap();
        let handler =
            StoreHandler::new(StorageOptions::new(dir.path()).with_sort_by(StorageSortKey::Image));
        let stored = handler.store(&event("9.8.7")).unwrap();
        assert_eq!(stored.path, dir.path().join("9.8.7.dcm"));
        assert!(dicom_object::open_file(&stored.path).is_ok());
    }

    #[test]
    fn test_garbage_is_unable_to_decode() {
        let dir = tempfile::tempdir().unwrap();
        let handler = StoreHandler::new(StorageOptions::new(dir.path()));
        let mut bad = event("1.1");
        bad.data = vec![0xFF, 0x00, 0x13];
        assert_eq!(handler.handle(&bad), status::UNABLE_TO_DECODE);
        assert!(files_under(dir.path()).is_empty());
    }

    #[test]
    fn test_missing_identifiers_are_unable_to_decode() {
        let dir = tempfile::tempdir().unwrap();
        let handler = StoreHandler::new(StorageOptions::new(dir.path()));
        let mut dataset = ct_dataset("2.2");
        dataset.remove_element(tags::PATIENT_ID);
        let mut no_patient = event("2.2");
        no_patient.data = encode_dataset(&dataset, uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();

        assert_eq!(handler.handle(&no_patient), status::UNABLE_TO_DECODE);
        assert!(files_under(dir.path()).is_empty());
    }

    #[test]
    fn test_unwritable_root_is_unable_to_process() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("occupied");
        std::fs::write(&root, b"not a directory").unwrap();
        let handler = StoreHandler::new(StorageOptions::new(&root));

        assert_eq!(handler.handle(&event("3.3")), status::UNABLE_TO_PROCESS);
    }

    struct BrokenStore;

    impl PersistenceAdapter for BrokenStore {
        fn add_found_study(&self, _: &crate::persistence::FoundStudy) -> Result<Insert> {
            Err(DimseError::Persistence("down".into()))
        }
        fn add_image(&self, _: &ImageRecord) -> Result<Insert> {
            Err(DimseError::Persistence("down".into()))
        }
        fn update_retrieved_study(&self, _: &str) -> Result<Retrieval> {
            Err(DimseError::Persistence("down".into()))
        }
        fn studies_pending_move(&self) -> Result<Vec<String>> {
            Err(DimseError::Persistence("down".into()))
        }
    }

    #[test]
    fn test_persistence_failure_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let handler = StoreHandler::new(
            StorageOptions::new(dir.path())
                .with_sort_by(StorageSortKey::Study)
                .with_persistence(Arc::new(BrokenStore)),
        );
        assert_eq!(handler.handle(&event("5.5")), status::UNABLE_TO_RECORD);
        assert_eq!(
            files_under(dir.path()),
            vec![dir.path().join("1.2.3/1.2.3.4/5.5.dcm")]
        );
    }

    #[test]
    fn test_panicking_callback_keeps_success() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = StoreHandler::new(
            StorageOptions::new(dir.path())
                .with_callback(Arc::new(|_: &StoredObject| panic!("callback bug")))
                .with_callback(Arc::new(move |stored: &StoredObject| {
                    assert_eq!(stored.ids.sop_uid, "7.7");
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
        );
        assert_eq!(handler.handle(&event("7.7")), status::SUCCESS);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_double_start_and_idempotent_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DimseConfig::default();
        config.bind_addr = "127.0.0.1".parse().unwrap();
        let mut scp = StoreScp::new(
            DicomNode::new("STORE_SCP").with_port(0),
            config,
            StorageOptions::new(dir.path()),
        );

        let addr = scp.start().await.unwrap();
        assert!(scp.is_running());
        assert_eq!(scp.local_addr(), Some(addr));
        assert!(matches!(scp.start().await, Err(DimseError::AlreadyRunning(_))));

        scp.shutdown().await;
        assert!(!scp.is_running());
        scp.shutdown().await;
    }

    #[tokio::test]
    async fn test_listen_node_needs_port() {
        let dir = tempfile::tempdir().unwrap();
        let mut scp = StoreScp::new(
            DicomNode::new("NO_PORT"),
            DimseConfig::default(),
            StorageOptions::new(dir.path()),
        );
        assert!(matches!(scp.start().await, Err(DimseError::Config(_))));
    }
}

//! Retrieval engine (C-MOVE)

use std::time::Duration;

use chrono::{Local, NaiveTime};
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::association::{move_sop_class, Association, ContextProposal};
use crate::config::{DicomNode, DimseConfig};
use crate::message::{encode_dataset, move_rq, DimseMessage};
use crate::scp::{StorageOptions, StoreScp};
use crate::scu::DimseScu;
use crate::types::{status, MoveOutcome, QueryLevel, SubOperations};
use crate::{DimseError, Result};

/// How often a closed move window is re-checked
pub const MOVE_POLL_INTERVAL: Duration = Duration::from_secs(20);

const OUTCOME_CHANNEL_CAPACITY: usize = 32;

/// Daily time-of-day window during which moves may run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MoveWindow {
    start: Option<NaiveTime>,
    end: Option<NaiveTime>,
}

impl MoveWindow {
    /// A window that is always open
    pub fn always() -> Self {
        Self::default()
    }

    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    /// Parse `HH`, `HH:MM` or `HH:MM:SS` bounds; both or neither must be given
    pub fn parse(start: Option<&str>, end: Option<&str>) -> Result<Self> {
        match (start, end) {
            (None, None) => Ok(Self::always()),
            (Some(start), Some(end)) => Ok(Self::new(parse_time(start)?, parse_time(end)?)),
            _ => Err(DimseError::config(
                "move window needs both a start and an end time, or neither",
            )),
        }
    }

    pub fn start(&self) -> Option<NaiveTime> {
        self.start
    }

    pub fn end(&self) -> Option<NaiveTime> {
        self.end
    }

    /// Whether moves are allowed at `now`.
    ///
    /// A window whose end is after its start is open strictly between the
    /// two. Otherwise it wraps past midnight. Equal bounds mean always open.
    pub fn is_open_at(&self, now: NaiveTime) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) if start != end => {
                if end > start {
                    start < now && now < end
                } else {
                    now > start || now < end
                }
            }
            _ => true,
        }
    }

    /// Whether moves are allowed right now (local time)
    pub fn can_query(&self) -> bool {
        self.is_open_at(Local::now().time())
    }
}

impl std::fmt::Display for MoveWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.start, self.end) {
            (Some(start), Some(end)) => write!(f, "{}-{}", start.format("%H:%M:%S"), end.format("%H:%M:%S")),
            _ => write!(f, "always"),
        }
    }
}

/// Parse a time of day given as `HH`, `HH:MM` or `HH:MM:SS`
pub fn parse_time(value: &str) -> Result<NaiveTime> {
    let value = value.trim();
    let parsed = match value.matches(':').count() {
        0 => value
            .parse::<u32>()
            .ok()
            .and_then(|h| NaiveTime::from_hms_opt(h, 0, 0)),
        1 => NaiveTime::parse_from_str(value, "%H:%M").ok(),
        2 => NaiveTime::parse_from_str(value, "%H:%M:%S").ok(),
        _ => None,
    };
    parsed.ok_or_else(|| DimseError::config(format!("invalid time of day '{}'", value)))
}

/// A batch of resources to move
#[derive(Clone)]
pub struct MoveRequest {
    pub query_level: QueryLevel,
    /// PatientIDs or StudyInstanceUIDs, moved in this order
    pub identifiers: Vec<String>,
    /// Defaults to the local node
    pub destination: Option<DicomNode>,
    pub window: MoveWindow,
    /// Also report pending sub-operation updates
    pub progress: bool,
    /// Where the SCP running during the batch stores what it receives
    pub storage: StorageOptions,
}

impl MoveRequest {
    pub fn new<I, S>(query_level: QueryLevel, identifiers: I, storage: StorageOptions) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            query_level,
            identifiers: identifiers.into_iter().map(Into::into).collect(),
            destination: None,
            window: MoveWindow::always(),
            progress: false,
            storage,
        }
    }

    pub fn with_destination(mut self, destination: DicomNode) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_window(mut self, window: MoveWindow) -> Self {
        self.window = window;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }
}

impl DimseScu {
    /// Move every resource of `request` from `node` to the destination.
    ///
    /// A Storage SCP bound to the destination node runs for the whole
    /// batch. Each identifier yields its final [`MoveOutcome`] (plus
    /// pending updates when progress is requested). A resource whose
    /// association fails yields [`status::MOVE_FAILED`] and the batch
    /// continues. Configuration problems are returned before any network
    /// activity.
    pub async fn move_resources(
        &self,
        node: &DicomNode,
        request: MoveRequest,
    ) -> Result<impl Stream<Item = MoveOutcome>> {
        node.require_network_info()?;
        let destination = request
            .destination
            .clone()
            .unwrap_or_else(|| self.config.local.clone());
        destination.validate()?;
        if !destination.has_port() {
            return Err(DimseError::config(format!(
                "destination node {} has no port to receive on",
                destination.ae_title
            )));
        }

        let mut scp = StoreScp::new(destination.clone(), self.config.clone(), request.storage.clone());
        scp.start().await?;

        info!(
            "Moving {} {} resource(s) from {} to {} (window: {})",
            request.identifiers.len(),
            request.query_level,
            node,
            destination.ae_title,
            request.window
        );

        let (tx, rx) = mpsc::channel(OUTCOME_CHANNEL_CAPACITY);
        let local = self.config.local.clone();
        let remote = node.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            'batch: for identifier in request.identifiers {
                while !request.window.can_query() {
                    info!("Outside move window {}, waiting", request.window);
                    tokio::select! {
                        _ = tx.closed() => break 'batch,
                        _ = tokio::time::sleep(MOVE_POLL_INTERVAL) => {}
                    }
                }

                let job = MoveJob {
                    local: local.clone(),
                    remote: remote.clone(),
                    config: config.clone(),
                    destination_aet: destination.ae_title.clone(),
                    level: request.query_level,
                    identifier,
                    progress: request.progress,
                };
                let tx = tx.clone();
                let keep_going = tokio::task::spawn_blocking(move || {
                    job.run(&mut |outcome| tx.blocking_send(outcome).is_ok())
                })
                .await
                .unwrap_or_else(|e| {
                    warn!("C-MOVE task failed: {}", e);
                    true
                });
                if !keep_going {
                    debug!("C-MOVE consumer went away, stopping batch");
                    break;
                }
            }
            scp.shutdown().await;
        });

        Ok(ReceiverStream::new(rx))
    }
}

struct MoveJob {
    local: DicomNode,
    remote: DicomNode,
    config: DimseConfig,
    destination_aet: String,
    level: QueryLevel,
    identifier: String,
    progress: bool,
}

impl MoveJob {
    /// Move one resource; returns false when the consumer stopped listening
    fn run(&self, emit: &mut dyn FnMut(MoveOutcome) -> bool) -> bool {
        match self.request(emit) {
            Ok(keep_going) => keep_going,
            Err(e) => {
                warn!(identifier = %self.identifier, "C-MOVE failed: {}", e);
                emit(MoveOutcome::failed(self.identifier.clone()))
            }
        }
    }

    fn identifier_dataset(&self) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(
                tags::QUERY_RETRIEVE_LEVEL,
                VR::CS,
                PrimitiveValue::from(self.level.to_string()),
            ),
            DataElement::new(
                self.level.key_tag(),
                self.level.key_vr(),
                PrimitiveValue::from(self.identifier.as_str()),
            ),
        ])
    }

    fn request(&self, emit: &mut dyn FnMut(MoveOutcome) -> bool) -> Result<bool> {
        let sop_class = move_sop_class(self.level);
        let mut association = Association::open(
            &self.local,
            &self.remote,
            &[ContextProposal::retrieve(self.level)],
            &self.config,
        )?;
        let pc = association.require_context(sop_class)?;

        let data = encode_dataset(&self.identifier_dataset(), &pc.transfer_syntax)?;
        let message_id = association.next_message_id();
        association.send_message(
            pc.id,
            &move_rq(message_id, sop_class, &self.destination_aet),
            Some(&data),
        )?;

        loop {
            let response = association.receive_message()?;
            let code = response
                .status()
                .ok_or_else(|| DimseError::operation_failed("C-MOVE response without status"))?;
            let outcome = MoveOutcome {
                status: code,
                identifier: self.identifier.clone(),
                sub_operations: sub_operations(&response),
            };

            if status::is_pending(code) {
                debug!(identifier = %self.identifier, remaining = ?outcome.sub_operations.remaining, "C-MOVE pending");
                if self.progress && !emit(outcome) {
                    return Ok(false);
                }
                continue;
            }

            info!(
                identifier = %self.identifier,
                status = %format!("{:#06X}", code),
                completed = ?outcome.sub_operations.completed,
                failed = ?outcome.sub_operations.failed,
                "C-MOVE finished"
            );
            let keep_going = emit(outcome);
            if let Err(e) = association.release() {
                debug!("Release after C-MOVE failed: {}", e);
            }
            return Ok(keep_going);
        }
    }
}

fn sub_operations(response: &DimseMessage) -> SubOperations {
    SubOperations {
        remaining: response.command_u16(tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
        completed: response.command_u16(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
        failed: response.command_u16(tags::NUMBER_OF_FAILED_SUBOPERATIONS),
        warning: response.command_u16(tags::NUMBER_OF_WARNING_SUBOPERATIONS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_overnight_window() {
        let window = MoveWindow::parse(Some("20:00"), Some("07:00")).unwrap();
        assert!(!window.is_open_at(t(16, 0)));
        assert!(window.is_open_at(t(22, 0)));
        assert!(window.is_open_at(t(3, 30)));
        assert!(!window.is_open_at(t(7, 30)));
    }

    #[test]
    fn test_daytime_window_is_exclusive() {
        let window = MoveWindow::new(t(9, 0), t(17, 0));
        assert!(window.is_open_at(t(12, 0)));
        assert!(!window.is_open_at(t(9, 0)));
        assert!(!window.is_open_at(t(17, 0)));
        assert!(!window.is_open_at(t(18, 0)));
    }

    #[test]
    fn test_equal_bounds_and_no_bounds_are_always_open() {
        assert!(MoveWindow::new(t(8, 0), t(8, 0)).is_open_at(t(3, 0)));
        assert!(MoveWindow::always().can_query());
    }

    #[test]
    fn test_half_configured_window_is_rejected() {
        assert!(MoveWindow::parse(Some("20"), None).is_err());
        assert!(MoveWindow::parse(None, Some("07:00")).is_err());
    }

    #[test]
    fn test_time_formats() {
        assert_eq!(parse_time("20").unwrap(), t(20, 0));
        assert_eq!(parse_time("07:30").unwrap(), t(7, 30));
        assert_eq!(parse_time("07:30:15").unwrap(), NaiveTime::from_hms_opt(7, 30, 15).unwrap());
        assert!(parse_time("25").is_err());
        assert!(parse_time("noon").is_err());
    }

    #[tokio::test]
    async fn test_destination_without_port_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let scu = DimseScu::new(DimseConfig::default());
        let remote = DicomNode::remote("PACS", "127.0.0.1", 104);
        let request = MoveRequest::new(QueryLevel::Study, ["1.2.3"], StorageOptions::new(dir.path()));

        let result = scu.move_resources(&remote, request).await;
        assert!(matches!(result, Err(DimseError::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_archive_yields_sentinel_per_resource() {
        let dir = tempfile::tempdir().unwrap();
        let dead_port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = DimseConfig::with_local(DicomNode::new("LOCAL").with_address("127.0.0.1", 0));
        config.bind_addr = "127.0.0.1".parse().unwrap();
        config.connect_timeout_ms = 500;
        let scu = DimseScu::new(config);
        let remote = DicomNode::remote("PACS", "127.0.0.1", dead_port);
        let request = MoveRequest::new(QueryLevel::Patient, ["P1", "P2"], StorageOptions::new(dir.path()));

        let outcomes: Vec<MoveOutcome> = scu
            .move_resources(&remote, request)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(
            outcomes,
            vec![MoveOutcome::failed("P1"), MoveOutcome::failed("P2")]
        );
    }
}

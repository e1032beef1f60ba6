//! Client association lifecycle
//!
//! An [`Association`] is opened for one logical operation and released when
//! it goes out of scope, whichever way the operation ends.

use std::collections::VecDeque;
use std::net::TcpStream;

use dicom_dictionary_std::uids;
use dicom_object::InMemDicomObject;
use dicom_ul::association::client::{ClientAssociation, ClientAssociationOptions};
use dicom_ul::pdu::{PDataValue, Pdu};
use tracing::{debug, warn};

use crate::config::{DicomNode, DimseConfig};
use crate::error::{DimseError, Result};
use crate::message::{message_pdus, DimseMessage, MessageAssembler};
use crate::types::QueryLevel;

/// Transfer syntaxes offered for query/retrieve and verification contexts
pub const QUERY_TRANSFER_SYNTAXES: [&str; 2] = [
    uids::EXPLICIT_VR_LITTLE_ENDIAN,
    uids::IMPLICIT_VR_LITTLE_ENDIAN,
];

/// Transfer syntaxes offered for storage of native (uncompressed) data
pub const STORAGE_TRANSFER_SYNTAXES: [&str; 4] = [
    uids::EXPLICIT_VR_LITTLE_ENDIAN,
    uids::IMPLICIT_VR_LITTLE_ENDIAN,
    uids::DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN,
    // Explicit VR Big Endian, retired but still sent by older modalities
    "1.2.840.10008.1.2.2",
];

/// A presentation context to propose
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextProposal {
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

impl ContextProposal {
    pub fn new(abstract_syntax: impl Into<String>, transfer_syntaxes: &[&str]) -> Self {
        Self {
            abstract_syntax: abstract_syntax.into(),
            transfer_syntaxes: transfer_syntaxes.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn verification() -> Self {
        Self::new(uids::VERIFICATION, &QUERY_TRANSFER_SYNTAXES)
    }

    /// Patient Root FIND at patient level, Study Root FIND at study level
    pub fn find(level: QueryLevel) -> Self {
        Self::new(find_sop_class(level), &QUERY_TRANSFER_SYNTAXES)
    }

    pub fn retrieve(level: QueryLevel) -> Self {
        Self::new(move_sop_class(level), &QUERY_TRANSFER_SYNTAXES)
    }
}

pub fn find_sop_class(level: QueryLevel) -> &'static str {
    match level {
        QueryLevel::Patient => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
        QueryLevel::Study => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
    }
}

pub fn move_sop_class(level: QueryLevel) -> &'static str {
    match level {
        QueryLevel::Patient => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
        QueryLevel::Study => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
    }
}

/// A presentation context the remote accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

/// An established client association
pub struct Association {
    inner: Option<ClientAssociation<TcpStream>>,
    accepted: Vec<AcceptedContext>,
    peer: String,
    max_send_pdu: u32,
    message_id: u16,
    assembler: MessageAssembler,
    backlog: VecDeque<PDataValue>,
}

impl Association {
    /// Negotiate an association with `remote`.
    ///
    /// Unreachable hosts and rejected negotiations both come back as
    /// [`DimseError::Connection`].
    pub fn open(
        local: &DicomNode,
        remote: &DicomNode,
        proposals: &[ContextProposal],
        config: &DimseConfig,
    ) -> Result<Self> {
        let address = remote.socket_address()?;
        if proposals.is_empty() {
            return Err(DimseError::internal("no presentation contexts to propose"));
        }

        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(local.ae_title.as_str())
            .called_ae_title(remote.ae_title.as_str())
            .max_pdu_length(config.max_pdu_for(local))
            .connection_timeout(config.connect_timeout_for(remote))
            .read_timeout(config.association_timeout());
        for proposal in proposals {
            options = options.with_presentation_context(
                proposal.abstract_syntax.as_str(),
                proposal
                    .transfer_syntaxes
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>(),
            );
        }

        debug!(
            peer = %address,
            called_ae = %remote.ae_title,
            calling_ae = %local.ae_title,
            contexts = proposals.len(),
            "Requesting association"
        );

        let inner = options.establish_with(&address).map_err(|e| {
            DimseError::connection(format!("association with {} failed: {}", remote, e))
        })?;

        // Proposed contexts carry ids 1, 3, 5... in proposal order.
        let accepted: Vec<AcceptedContext> = inner
            .presentation_contexts()
            .iter()
            .filter_map(|pc| {
                let index = (pc.id as usize).checked_sub(1)? / 2;
                proposals.get(index).map(|p| AcceptedContext {
                    id: pc.id,
                    abstract_syntax: p.abstract_syntax.clone(),
                    transfer_syntax: pc.transfer_syntax.trim_end_matches('\0').to_string(),
                })
            })
            .collect();
        let max_send_pdu = inner.acceptor_max_pdu_length();

        debug!(peer = %address, accepted = accepted.len(), "Association established");

        Ok(Self {
            inner: Some(inner),
            accepted,
            peer: address,
            max_send_pdu,
            message_id: 0,
            assembler: MessageAssembler::new(),
            backlog: VecDeque::new(),
        })
    }

    /// Address of the remote node
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn accepted_contexts(&self) -> &[AcceptedContext] {
        &self.accepted
    }

    /// First accepted context for an abstract syntax
    pub fn context_for(&self, abstract_syntax: &str) -> Option<&AcceptedContext> {
        self.accepted
            .iter()
            .find(|c| c.abstract_syntax == abstract_syntax)
    }

    /// Like [`Association::context_for`], failing when the remote declined it
    pub fn require_context(&self, abstract_syntax: &str) -> Result<AcceptedContext> {
        self.context_for(abstract_syntax).cloned().ok_or_else(|| {
            DimseError::connection(format!(
                "{} did not accept presentation context {}",
                self.peer, abstract_syntax
            ))
        })
    }

    /// Allocate the next message id on this association
    pub fn next_message_id(&mut self) -> u16 {
        self.message_id = self.message_id.wrapping_add(1).max(1);
        self.message_id
    }

    fn inner_mut(&mut self) -> Result<&mut ClientAssociation<TcpStream>> {
        self.inner
            .as_mut()
            .ok_or_else(|| DimseError::connection(format!("association with {} is closed", self.peer)))
    }

    /// Send a command and optional encoded data set on a presentation context
    pub fn send_message(
        &mut self,
        pc_id: u8,
        command: &InMemDicomObject,
        data: Option<&[u8]>,
    ) -> Result<()> {
        let pdus = message_pdus(pc_id, command, data, self.max_send_pdu)?;
        let peer = self.peer.clone();
        let inner = self.inner_mut()?;
        for pdu in &pdus {
            inner
                .send(pdu)
                .map_err(|e| DimseError::connection(format!("send to {} failed: {}", peer, e)))?;
        }
        Ok(())
    }

    /// Block until the next complete DIMSE message arrives
    pub fn receive_message(&mut self) -> Result<DimseMessage> {
        loop {
            while let Some(pdv) = self.backlog.pop_front() {
                if let Some(message) = self.assembler.push(pdv)? {
                    return Ok(message);
                }
            }

            let peer = self.peer.clone();
            let pdu = self
                .inner_mut()?
                .receive()
                .map_err(|e| DimseError::connection(format!("receive from {} failed: {}", peer, e)))?;

            match pdu {
                Pdu::PData { data } => self.backlog.extend(data),
                Pdu::AbortRQ { .. } => {
                    warn!(peer = %peer, "Association aborted by peer");
                    self.inner = None;
                    return Err(DimseError::connection(format!("{} aborted the association", peer)));
                }
                Pdu::ReleaseRQ => {
                    if let Some(mut inner) = self.inner.take() {
                        if let Err(e) = inner.send(&Pdu::ReleaseRP) {
                            debug!(peer = %peer, "Release reply failed: {}", e);
                        }
                    }
                    return Err(DimseError::connection(format!(
                        "{} released the association mid-operation",
                        peer
                    )));
                }
                other => {
                    return Err(DimseError::operation_failed(format!(
                        "unexpected PDU from {}: {:?}",
                        peer, other
                    )));
                }
            }
        }
    }

    /// Release the association; a closed association releases as a no-op
    pub fn release(mut self) -> Result<()> {
        match self.inner.take() {
            Some(inner) => inner.release().map_err(|e| {
                DimseError::connection(format!("release of {} failed: {}", self.peer, e))
            }),
            None => Ok(()),
        }
    }
}

impl Drop for Association {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            if let Err(e) = inner.release() {
                debug!(peer = %self.peer, "Association release on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_context_follows_level() {
        assert_eq!(
            ContextProposal::find(QueryLevel::Patient).abstract_syntax,
            uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND
        );
        assert_eq!(
            ContextProposal::retrieve(QueryLevel::Study).abstract_syntax,
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE
        );
    }

    #[test]
    fn test_open_without_address_is_config_error() {
        let config = DimseConfig::default();
        let result = Association::open(
            &config.local,
            &DicomNode::new("NOWHERE"),
            &[ContextProposal::verification()],
            &config,
        );
        assert!(matches!(result, Err(DimseError::Config(_))));
    }

    #[test]
    fn test_unreachable_remote_is_connection_error() {
        // Bind then drop to get a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = DimseConfig::default();
        config.connect_timeout_ms = 1_000;
        let remote = DicomNode::remote("NOBODY", "127.0.0.1", port);
        let result = Association::open(
            &config.local,
            &remote,
            &[ContextProposal::verification()],
            &config,
        );
        assert!(matches!(result, Err(DimseError::Connection(_))));
    }
}

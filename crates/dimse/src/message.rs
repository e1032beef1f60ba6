//! DIMSE message codec
//!
//! Command sets are always Implicit VR Little Endian. Data sets use the
//! transfer syntax negotiated for their presentation context.

use dicom_core::{DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::{TransferSyntax, TransferSyntaxIndex};
use dicom_object::mem::InMemElement;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};

use crate::error::{DimseError, Result};
use crate::types::SubOperations;

/// Command Field values
pub mod command_field {
    pub const C_STORE_RQ: u16 = 0x0001;
    pub const C_STORE_RSP: u16 = 0x8001;
    pub const C_FIND_RQ: u16 = 0x0020;
    pub const C_FIND_RSP: u16 = 0x8020;
    pub const C_MOVE_RQ: u16 = 0x0021;
    pub const C_MOVE_RSP: u16 = 0x8021;
    pub const C_ECHO_RQ: u16 = 0x0030;
    pub const C_ECHO_RSP: u16 = 0x8030;
}

/// CommandDataSetType value meaning "no data set follows"
pub const NO_DATA_SET: u16 = 0x0101;
const DATA_SET_PRESENT: u16 = 0x0000;

const PRIORITY_MEDIUM: u16 = 0x0000;

// PDV item header: 4 byte length, context id, message control header.
const PDV_HEADER_LEN: usize = 6;
const FALLBACK_MAX_PDU: u32 = 16_384;

/// A complete DIMSE message: command set plus optional encoded data set
#[derive(Debug, Clone)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: InMemDicomObject,
    pub data: Option<Vec<u8>>,
}

impl DimseMessage {
    pub fn command_field(&self) -> Option<u16> {
        command_u16(&self.command, tags::COMMAND_FIELD)
    }

    pub fn status(&self) -> Option<u16> {
        command_u16(&self.command, tags::STATUS)
    }

    pub fn message_id(&self) -> Option<u16> {
        command_u16(&self.command, tags::MESSAGE_ID)
    }

    pub fn command_str(&self, tag: Tag) -> Option<String> {
        crate::types::element_str(&self.command, tag)
    }

    pub fn command_u16(&self, tag: Tag) -> Option<u16> {
        command_u16(&self.command, tag)
    }
}

fn command_u16(command: &InMemDicomObject, tag: Tag) -> Option<u16> {
    command.element(tag).ok()?.to_int::<u16>().ok()
}

fn us(tag: Tag, value: u16) -> InMemElement {
    DataElement::new(tag, VR::US, PrimitiveValue::from(value))
}

fn ui(tag: Tag, value: &str) -> InMemElement {
    DataElement::new(tag, VR::UI, PrimitiveValue::from(value))
}

fn data_set_type(has_data: bool) -> u16 {
    if has_data {
        DATA_SET_PRESENT
    } else {
        NO_DATA_SET
    }
}

/// C-ECHO-RQ
pub fn echo_rq(message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, dicom_dictionary_std::uids::VERIFICATION),
        us(tags::COMMAND_FIELD, command_field::C_ECHO_RQ),
        us(tags::MESSAGE_ID, message_id),
        us(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET),
    ])
}

/// C-ECHO-RSP
pub fn echo_rsp(responding_to: u16, status: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, dicom_dictionary_std::uids::VERIFICATION),
        us(tags::COMMAND_FIELD, command_field::C_ECHO_RSP),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, responding_to),
        us(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET),
        us(tags::STATUS, status),
    ])
}

/// C-FIND-RQ; the identifier follows as a data set
pub fn find_rq(message_id: u16, sop_class_uid: &str) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, command_field::C_FIND_RQ),
        us(tags::MESSAGE_ID, message_id),
        us(tags::PRIORITY, PRIORITY_MEDIUM),
        us(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT),
    ])
}

/// C-FIND-RSP
pub fn find_rsp(responding_to: u16, sop_class_uid: &str, status: u16, has_data: bool) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, command_field::C_FIND_RSP),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, responding_to),
        us(tags::COMMAND_DATA_SET_TYPE, data_set_type(has_data)),
        us(tags::STATUS, status),
    ])
}

/// C-MOVE-RSP; counters that are `None` are left out
pub fn move_rsp(
    responding_to: u16,
    sop_class_uid: &str,
    status: u16,
    sub_operations: &SubOperations,
) -> InMemDicomObject {
    let counters = [
        (tags::NUMBER_OF_REMAINING_SUBOPERATIONS, sub_operations.remaining),
        (tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, sub_operations.completed),
        (tags::NUMBER_OF_FAILED_SUBOPERATIONS, sub_operations.failed),
        (tags::NUMBER_OF_WARNING_SUBOPERATIONS, sub_operations.warning),
    ];
    InMemDicomObject::command_from_element_iter(
        [
            ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
            us(tags::COMMAND_FIELD, command_field::C_MOVE_RSP),
            us(tags::MESSAGE_ID_BEING_RESPONDED_TO, responding_to),
            us(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET),
            us(tags::STATUS, status),
        ]
        .into_iter()
        .chain(
            counters
                .into_iter()
                .filter_map(|(tag, count)| count.map(|n| us(tag, n))),
        ),
    )
}

/// C-MOVE-RQ; the identifier follows as a data set
pub fn move_rq(message_id: u16, sop_class_uid: &str, destination_aet: &str) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, command_field::C_MOVE_RQ),
        us(tags::MESSAGE_ID, message_id),
        us(tags::PRIORITY, PRIORITY_MEDIUM),
        us(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT),
        DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            PrimitiveValue::from(destination_aet),
        ),
    ])
}

/// C-STORE-RQ; the object follows as a data set
pub fn store_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, command_field::C_STORE_RQ),
        us(tags::MESSAGE_ID, message_id),
        us(tags::PRIORITY, PRIORITY_MEDIUM),
        us(tags::COMMAND_DATA_SET_TYPE, DATA_SET_PRESENT),
        ui(tags::AFFECTED_SOP_INSTANCE_UID, sop_instance_uid),
    ])
}

/// C-STORE-RSP
pub fn store_rsp(
    responding_to: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, command_field::C_STORE_RSP),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, responding_to),
        us(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET),
        us(tags::STATUS, status),
        ui(tags::AFFECTED_SOP_INSTANCE_UID, sop_instance_uid),
    ])
}

/// Response to a command this engine does not serve
pub fn unrecognized_rsp(request_field: u16, responding_to: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        us(tags::COMMAND_FIELD, request_field | 0x8000),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, responding_to),
        us(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET),
        us(tags::STATUS, crate::types::status::UNRECOGNIZED_OPERATION),
    ])
}

/// Look up a transfer syntax by UID
pub fn transfer_syntax(uid: &str) -> Result<&'static TransferSyntax> {
    let uid = uid.trim_end_matches(['\0', ' ']);
    TransferSyntaxRegistry
        .get(uid)
        .ok_or_else(|| DimseError::Decode(format!("unknown transfer syntax {}", uid)))
}

pub fn encode_command(command: &InMemDicomObject) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    command
        .write_dataset_with_ts(&mut bytes, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| DimseError::Encode(format!("command set: {}", e)))?;
    Ok(bytes)
}

pub fn decode_command(bytes: &[u8]) -> Result<InMemDicomObject> {
    InMemDicomObject::read_dataset_with_ts(bytes, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| DimseError::Decode(format!("command set: {}", e)))
}

pub fn encode_dataset(obj: &InMemDicomObject, ts_uid: &str) -> Result<Vec<u8>> {
    let ts = transfer_syntax(ts_uid)?;
    let mut bytes = Vec::new();
    obj.write_dataset_with_ts(&mut bytes, ts)
        .map_err(|e| DimseError::Encode(e.to_string()))?;
    Ok(bytes)
}

/// Decode a data set in the negotiated transfer syntax.
///
/// Bytes that yield no element at all are an error, not an empty data set.
pub fn decode_dataset(bytes: &[u8], ts_uid: &str) -> Result<InMemDicomObject> {
    let ts = transfer_syntax(ts_uid)?;
    let obj = InMemDicomObject::read_dataset_with_ts(bytes, ts)
        .map_err(|e| DimseError::Decode(e.to_string()))?;
    if !bytes.is_empty() && obj.iter().next().is_none() {
        return Err(DimseError::Decode(format!(
            "{} bytes decoded to no data elements",
            bytes.len()
        )));
    }
    Ok(obj)
}

/// Largest PDV payload that fits a peer's maximum PDU length
pub fn max_fragment_len(max_pdu: u32) -> usize {
    let max_pdu = if max_pdu == 0 { FALLBACK_MAX_PDU } else { max_pdu };
    (max_pdu as usize).saturating_sub(PDV_HEADER_LEN).max(1)
}

/// Split one encoded command or data set into P-DATA-TF PDUs
pub fn fragment(pc_id: u8, value_type: PDataValueType, bytes: &[u8], max_pdu: u32) -> Vec<Pdu> {
    let chunk_len = max_fragment_len(max_pdu);
    if bytes.is_empty() {
        return vec![Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type,
                is_last: true,
                data: Vec::new(),
            }],
        }];
    }
    let chunks = bytes.chunks(chunk_len);
    let count = chunks.len();
    chunks
        .enumerate()
        .map(|(i, chunk)| Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc_id,
                value_type: value_type.clone(),
                is_last: i + 1 == count,
                data: chunk.to_vec(),
            }],
        })
        .collect()
}

/// Encode a message into the PDUs that carry it
pub fn message_pdus(
    pc_id: u8,
    command: &InMemDicomObject,
    data: Option<&[u8]>,
    max_pdu: u32,
) -> Result<Vec<Pdu>> {
    let mut pdus = fragment(pc_id, PDataValueType::Command, &encode_command(command)?, max_pdu);
    if let Some(data) = data {
        pdus.extend(fragment(pc_id, PDataValueType::Data, data, max_pdu));
    }
    Ok(pdus)
}

/// Reassembles PDV fragments into complete messages
#[derive(Debug, Default)]
pub struct MessageAssembler {
    command: Vec<u8>,
    data: Vec<u8>,
    pending_command: Option<(u8, InMemDicomObject)>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one PDV; returns a message once its last fragment has arrived
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<DimseMessage>> {
        match pdv.value_type {
            PDataValueType::Command => {
                if self.pending_command.is_some() {
                    return Err(DimseError::operation_failed(
                        "command fragment received while waiting for a data set",
                    ));
                }
                self.command.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }
                let command = decode_command(&std::mem::take(&mut self.command))?;
                let has_data =
                    command_u16(&command, tags::COMMAND_DATA_SET_TYPE) != Some(NO_DATA_SET);
                if has_data {
                    self.pending_command = Some((pdv.presentation_context_id, command));
                    Ok(None)
                } else {
                    Ok(Some(DimseMessage {
                        presentation_context_id: pdv.presentation_context_id,
                        command,
                        data: None,
                    }))
                }
            }
            PDataValueType::Data => {
                if self.pending_command.is_none() {
                    return Err(DimseError::operation_failed(
                        "data fragment received before its command set",
                    ));
                }
                self.data.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }
                let (pc_id, command) = match self.pending_command.take() {
                    Some(pending) => pending,
                    None => return Err(DimseError::internal("assembler lost its command set")),
                };
                Ok(Some(DimseMessage {
                    presentation_context_id: pc_id,
                    command,
                    data: Some(std::mem::take(&mut self.data)),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pdvs(pdus: Vec<Pdu>) -> Vec<PDataValue> {
        pdus.into_iter()
            .flat_map(|pdu| match pdu {
                Pdu::PData { data } => data,
                other => panic!("unexpected PDU {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_echo_message_reassembles() {
        let pdus = message_pdus(1, &echo_rq(7), None, 16_384).unwrap();
        let mut assembler = MessageAssembler::new();
        let mut messages = Vec::new();
        for pdv in pdvs(pdus) {
            if let Some(msg) = assembler.push(pdv).unwrap() {
                messages.push(msg);
            }
        }
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].command_field(), Some(command_field::C_ECHO_RQ));
        assert_eq!(messages[0].message_id(), Some(7));
        assert!(messages[0].data.is_none());
    }

    #[test]
    fn test_large_data_set_is_fragmented_by_peer_pdu() {
        let data = vec![0xAB_u8; 10_000];
        let pdus = message_pdus(3, &store_rq(1, "1.2", "1.2.3"), Some(&data), 4096).unwrap();
        assert!(pdus.len() >= 4);

        let mut assembler = MessageAssembler::new();
        let mut complete = None;
        for pdv in pdvs(pdus) {
            assert!(pdv.data.len() <= max_fragment_len(4096));
            if let Some(msg) = assembler.push(pdv).unwrap() {
                complete = Some(msg);
            }
        }
        let msg = complete.expect("message should complete");
        assert_eq!(msg.presentation_context_id, 3);
        assert_eq!(msg.data.as_deref(), Some(&data[..]));
        assert_eq!(msg.command_str(tags::AFFECTED_SOP_INSTANCE_UID).as_deref(), Some("1.2.3"));
    }

    #[test]
    fn test_data_without_command_is_rejected() {
        let mut assembler = MessageAssembler::new();
        let pdv = PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; 4],
        };
        assert!(assembler.push(pdv).is_err());
    }

    #[test]
    fn test_status_is_read_from_response() {
        let bytes = encode_command(&store_rsp(4, "1.2", "1.2.3", 0xC215)).unwrap();
        let command = decode_command(&bytes).unwrap();
        let msg = DimseMessage {
            presentation_context_id: 1,
            command,
            data: None,
        };
        assert_eq!(msg.status(), Some(0xC215));
        assert_eq!(msg.command_u16(tags::MESSAGE_ID_BEING_RESPONDED_TO), Some(4));
    }

    #[test]
    fn test_move_response_carries_set_counters_only() {
        let counters = SubOperations {
            remaining: Some(3),
            completed: Some(1),
            failed: None,
            warning: None,
        };
        let command = move_rsp(9, "1.2.840.10008.5.1.4.1.2.2.2", 0xFF00, &counters);
        let msg = DimseMessage {
            presentation_context_id: 1,
            command,
            data: None,
        };
        assert_eq!(msg.command_field(), Some(command_field::C_MOVE_RSP));
        assert_eq!(msg.status(), Some(0xFF00));
        assert_eq!(msg.command_u16(tags::NUMBER_OF_REMAINING_SUBOPERATIONS), Some(3));
        assert_eq!(msg.command_u16(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS), Some(1));
        assert_eq!(msg.command_u16(tags::NUMBER_OF_FAILED_SUBOPERATIONS), None);
    }

    #[test]
    fn test_truncated_bytes_do_not_decode() {
        let ts = dicom_dictionary_std::uids::EXPLICIT_VR_LITTLE_ENDIAN;
        let err = decode_dataset(&[0xFF, 0x00, 0x13], ts).unwrap_err();
        assert!(matches!(err, DimseError::Decode(_)));
    }
}

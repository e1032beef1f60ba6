use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::InMemDicomObject;
use dicom_ul::association::server::ServerAssociationOptions;
use dicom_ul::pdu::Pdu;
use dimse::message::{
    command_field, decode_dataset, encode_dataset, find_rsp, message_pdus, MessageAssembler,
};
use dimse::types::element_str;
use dimse::{status, DicomNode, DimseConfig, DimseError, DimseScu, FindQuery};
use futures::StreamExt;

/// Archive that answers C-FIND shards by the first letter of PatientName:
/// `d` matches one study, `x` fails, everything else matches nothing.
fn spawn_mock_archive(seen: Arc<Mutex<Vec<String>>>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            let mut association = match ServerAssociationOptions::new()
                .accept_any()
                .ae_title("MOCK_PACS")
                .with_abstract_syntax(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND)
                .with_transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .with_transfer_syntax(uids::IMPLICIT_VR_LITTLE_ENDIAN)
                .establish(stream)
            {
                Ok(association) => association,
                Err(_) => continue,
            };
            let syntaxes: HashMap<u8, String> = association
                .presentation_contexts()
                .iter()
                .map(|pc| (pc.id, pc.transfer_syntax.trim_end_matches('\0').to_string()))
                .collect();

            let mut assembler = MessageAssembler::new();
            while let Ok(pdu) = association.receive() {
                match pdu {
                    Pdu::PData { data } => {
                        for pdv in data {
                            let Ok(Some(message)) = assembler.push(pdv) else { continue };
                            if message.command_field() != Some(command_field::C_FIND_RQ) {
                                continue;
                            }
                            let pc_id = message.presentation_context_id;
                            let ts = &syntaxes[&pc_id];
                            let identifier =
                                decode_dataset(message.data.as_deref().unwrap(), ts).unwrap();
                            let name = element_str(&identifier, tags::PATIENT_NAME).unwrap_or_default();
                            seen.lock().unwrap().push(name.clone());

                            let id = message.message_id().unwrap();
                            let sop = uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND;
                            let mut replies = Vec::new();
                            match name.as_str() {
                                "d*" => {
                                    let found = InMemDicomObject::from_element_iter([
                                        DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from("DOE^JANE")),
                                        DataElement::new(tags::STUDY_DATE, VR::DA, PrimitiveValue::from("20210105")),
                                        DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")),
                                        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from("1.2.3.4")),
                                    ]);
                                    let data = encode_dataset(&found, ts).unwrap();
                                    replies.extend(
                                        message_pdus(pc_id, &find_rsp(id, sop, status::PENDING, true), Some(&data), 0)
                                            .unwrap(),
                                    );
                                    replies.extend(
                                        message_pdus(pc_id, &find_rsp(id, sop, status::SUCCESS, false), None, 0)
                                            .unwrap(),
                                    );
                                }
                                "x*" => replies.extend(
                                    message_pdus(pc_id, &find_rsp(id, sop, 0xC001, false), None, 0).unwrap(),
                                ),
                                _ => replies.extend(
                                    message_pdus(pc_id, &find_rsp(id, sop, status::SUCCESS, false), None, 0)
                                        .unwrap(),
                                ),
                            }
                            for reply in replies {
                                if association.send(&reply).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Pdu::ReleaseRQ => {
                        let _ = association.send(&Pdu::ReleaseRP);
                        break;
                    }
                    _ => break,
                }
            }
        }
    });

    port
}

fn scu() -> DimseScu {
    let mut config = DimseConfig::with_local(DicomNode::new("FINDER"));
    config.bind_addr = "127.0.0.1".parse().unwrap();
    DimseScu::new(config)
}

#[tokio::test]
async fn sharded_find_collects_matches_and_reports_failed_shard() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let port = spawn_mock_archive(seen.clone());
    let node = DicomNode::remote("MOCK_PACS", "127.0.0.1", port);

    let query = FindQuery::study(NaiveDate::from_ymd_opt(2021, 1, 5).unwrap())
        .with_modality("CT")
        .with_field("StudyInstanceUID");
    let items: Vec<_> = scu().find(&node, query).await.unwrap().collect().await;

    let (found, failed): (Vec<_>, Vec<_>) = items.into_iter().partition(|r| r.is_ok());
    assert_eq!(found.len(), 1);
    let record = found.into_iter().next().unwrap().unwrap();
    assert_eq!(record.get("PatientName"), Some("DOE^JANE"));
    assert_eq!(record.get("StudyInstanceUID"), Some("1.2.3.4"));
    assert_eq!(record.get("StudyDate"), Some("20210105"));

    assert_eq!(failed.len(), 1);
    assert!(matches!(failed[0], Err(DimseError::OperationFailed(_))));

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 26);
    assert_eq!(seen.first().map(String::as_str), Some("a*"));
    assert_eq!(seen.last().map(String::as_str), Some("z*"));
}

#[tokio::test]
async fn dropping_the_stream_stops_the_scan() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let port = spawn_mock_archive(seen.clone());
    let node = DicomNode::remote("MOCK_PACS", "127.0.0.1", port);

    let query = FindQuery::study(NaiveDate::from_ymd_opt(2021, 1, 5).unwrap());
    let mut stream = Box::pin(scu().find(&node, query).await.unwrap());
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.get("PatientName"), Some("DOE^JANE"));
    drop(stream);

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    assert!(seen.lock().unwrap().len() < 26);
}

#![allow(dead_code)]

use std::path::Path;

use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};

/// Minimal CT image with the identifiers the pipeline keys on
pub fn ct_image(patient_id: &str, study_uid: &str, sop_uid: &str) -> InMemDicomObject {
    InMemDicomObject::from_element_iter([
        DataElement::new(tags::SOP_CLASS_UID, VR::UI, PrimitiveValue::from(uids::CT_IMAGE_STORAGE)),
        DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop_uid)),
        DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from(patient_id)),
        DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from("DOE^JANE")),
        DataElement::new(tags::PATIENT_AGE, VR::AS, PrimitiveValue::from("042Y")),
        DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, PrimitiveValue::from(study_uid)),
        DataElement::new(tags::SERIES_INSTANCE_UID, VR::UI, PrimitiveValue::from(format!("{}.1", study_uid))),
        DataElement::new(tags::STUDY_DATE, VR::DA, PrimitiveValue::from("20210105")),
        DataElement::new(tags::MODALITY, VR::CS, PrimitiveValue::from("CT")),
    ])
}

pub fn write_dicom(path: &Path, obj: InMemDicomObject) {
    let sop_uid = obj
        .element(tags::SOP_INSTANCE_UID)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let file = obj
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
                .media_storage_sop_class_uid(uids::CT_IMAGE_STORAGE)
                .media_storage_sop_instance_uid(sop_uid),
        )
        .unwrap();
    file.write_to_file(path).unwrap();
}

pub fn write_ct(path: &Path, patient_id: &str, study_uid: &str, sop_uid: &str) {
    write_dicom(path, ct_image(patient_id, study_uid, sop_uid));
}

/// A file with a `.dcm` name that is not DICOM
pub fn write_garbage(path: &Path) {
    std::fs::write(path, b"this is not a DICOM file").unwrap();
}

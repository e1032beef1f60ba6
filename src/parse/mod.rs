//! Tag-extraction schema
//!
//! A [`DicomTagGroup`] names the values to pull out of each DICOM file and
//! how to convert them. Groups are usually loaded from the `[[tags]]`
//! section of the configuration file or from a JSON document.

pub mod convert;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::NaiveDateTime;
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, OpenFileOptions};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::parse::convert::{age_to_years, str_to_datetime};

/// Column added to parsed records when the file path is requested
pub const PATH_COLUMN: &str = "dicom_path";

/// Values extracted from one file, keyed by alias
pub type TagRecord = BTreeMap<String, Option<TagValue>>;

/// A value extracted from a dataset
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Text(String),
    Integer(i64),
    Float(f64),
    DateTime(NaiveDateTime),
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagValue::Text(s) => f.write_str(s),
            TagValue::Integer(i) => write!(f, "{}", i),
            TagValue::Float(x) => write!(f, "{}", x),
            TagValue::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

// Datetimes serialize the same way they display in CSV output.
impl Serialize for TagValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TagValue::Text(s) => serializer.serialize_str(s),
            TagValue::Integer(i) => serializer.serialize_i64(*i),
            TagValue::Float(x) => serializer.serialize_f64(*x),
            TagValue::DateTime(_) => serializer.collect_str(self),
        }
    }
}

/// Conversion applied to a raw tag value
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagTransform {
    /// Keep the raw string
    #[default]
    Identity,
    String,
    Integer,
    Float,
    /// DICOM date or datetime
    Date,
    /// DICOM age string to whole years
    AgeYears,
    /// Registered in code; `None` keeps the raw value
    #[serde(skip)]
    Custom(fn(&str) -> Option<TagValue>),
}

impl TagTransform {
    /// Apply the conversion; a value that does not convert is kept as text
    pub fn apply(&self, raw: &str) -> TagValue {
        let converted = match self {
            TagTransform::Identity | TagTransform::String => None,
            TagTransform::Integer => raw.trim().parse().ok().map(TagValue::Integer),
            TagTransform::Float => raw.trim().parse().ok().map(TagValue::Float),
            TagTransform::Date => str_to_datetime(raw).ok().map(TagValue::DateTime),
            TagTransform::AgeYears => age_to_years(raw).ok().map(|y| TagValue::Integer(y.into())),
            TagTransform::Custom(f) => f(raw),
        };
        converted.unwrap_or_else(|| TagValue::Text(raw.to_string()))
    }
}

/// One value to extract.
///
/// `tag_name` lists alternatives tried in order; the first non-empty value
/// wins. A dotted name such as `ReferencedStudySequence.ReferencedSOPInstanceUID`
/// reads from the first item of the sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DicomTag {
    #[serde(deserialize_with = "one_or_many")]
    pub tag_name: Vec<String>,
    #[serde(default)]
    pub tag_alias: Option<String>,
    #[serde(default)]
    pub default_val: Option<String>,
    #[serde(default)]
    pub transform: TagTransform,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(name) => vec![name],
        OneOrMany::Many(names) => names,
    })
}

impl DicomTag {
    pub fn new(tag_name: impl Into<String>) -> Self {
        Self {
            tag_name: vec![tag_name.into()],
            tag_alias: None,
            default_val: None,
            transform: TagTransform::Identity,
        }
    }

    /// Another name to try when the previous ones are empty
    pub fn or_name(mut self, tag_name: impl Into<String>) -> Self {
        self.tag_name.push(tag_name.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.tag_alias = Some(alias.into());
        self
    }

    pub fn with_default(mut self, default_val: impl Into<String>) -> Self {
        self.default_val = Some(default_val.into());
        self
    }

    pub fn with_transform(mut self, transform: TagTransform) -> Self {
        self.transform = transform;
        self
    }

    /// Output column name: the alias, or the first tag name
    pub fn alias(&self) -> &str {
        self.tag_alias
            .as_deref()
            .filter(|a| !a.is_empty())
            .or_else(|| self.tag_name.first().map(String::as_str))
            .unwrap_or_default()
    }

    /// Extract and convert this tag's value from `obj`
    pub fn value(&self, obj: &InMemDicomObject) -> Option<TagValue> {
        self.tag_name
            .iter()
            .find_map(|name| lookup(obj, name))
            .map(|raw| self.transform.apply(&raw))
            .or_else(|| self.default_val.clone().map(TagValue::Text))
    }
}

fn lookup(obj: &InMemDicomObject, path: &str) -> Option<String> {
    match path.split_once('.') {
        Some((sequence, rest)) => {
            let items = obj.element_by_name(sequence).ok()?.items()?;
            lookup(items.first()?, rest)
        }
        None => {
            let value = obj.element_by_name(path).ok()?.to_str().ok()?;
            let value = value.trim_end_matches(['\0', ' ']).trim_start();
            (!value.is_empty()).then(|| value.to_string())
        }
    }
}

/// The set of tags extracted from every file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DicomTagGroup {
    pub tags: Vec<DicomTag>,
}

impl DicomTagGroup {
    pub fn new(tags: Vec<DicomTag>) -> Self {
        Self { tags }
    }

    /// Load a group from a JSON document of the form `{"tags": [...]}`
    pub fn from_json_file(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Column names in schema order
    pub fn aliases(&self) -> Vec<String> {
        self.tags.iter().map(|t| t.alias().to_string()).collect()
    }

    pub fn parse(&self, obj: &InMemDicomObject) -> TagRecord {
        self.tags
            .iter()
            .map(|tag| (tag.alias().to_string(), tag.value(obj)))
            .collect()
    }

    /// Read a file up to its pixel data and extract the group's tags
    pub fn parse_file(&self, path: &Path) -> Result<TagRecord, dicom_object::ReadError> {
        let obj = OpenFileOptions::new()
            .read_until(tags::PIXEL_DATA)
            .open_file(path)?;
        Ok(self.parse(&obj))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use dicom_core::value::DataSetSequence;
    use dicom_core::{DataElement, PrimitiveValue, VR};

    fn dataset() -> InMemDicomObject {
        let referenced = InMemDicomObject::from_element_iter([DataElement::new(
            tags::REFERENCED_SOP_INSTANCE_UID,
            VR::UI,
            PrimitiveValue::from("1.2.3.99"),
        )]);
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::PATIENT_NAME, VR::PN, PrimitiveValue::from("DOE^JANE")),
            DataElement::new(tags::PATIENT_ID, VR::LO, PrimitiveValue::from("")),
            DataElement::new(tags::OTHER_PATIENT_I_DS, VR::LO, PrimitiveValue::from("ALT-7")),
            DataElement::new(tags::PATIENT_AGE, VR::AS, PrimitiveValue::from("045Y")),
            DataElement::new(tags::STUDY_DATE, VR::DA, PrimitiveValue::from("20210105")),
            DataElement::new(tags::SERIES_NUMBER, VR::IS, PrimitiveValue::from("3")),
            DataElement::new(
                tags::REFERENCED_STUDY_SEQUENCE,
                VR::SQ,
                DataSetSequence::from(vec![referenced]),
            ),
        ])
    }

    #[test]
    fn test_alternatives_and_defaults() {
        let obj = dataset();
        let id = DicomTag::new("PatientID").or_name("OtherPatientIDs").with_alias("pid");
        assert_eq!(id.alias(), "pid");
        assert_eq!(id.value(&obj), Some(TagValue::Text("ALT-7".into())));

        let missing = DicomTag::new("Manufacturer").with_default("unknown");
        assert_eq!(missing.alias(), "Manufacturer");
        assert_eq!(missing.value(&obj), Some(TagValue::Text("unknown".into())));
        assert_eq!(DicomTag::new("InstitutionName").value(&obj), None);
    }

    #[test]
    fn test_transforms() {
        let obj = dataset();
        let date = DicomTag::new("StudyDate").with_transform(TagTransform::Date);
        let expected = NaiveDate::from_ymd_opt(2021, 1, 5).unwrap().and_hms_opt(0, 0, 0).unwrap();
        assert_eq!(date.value(&obj), Some(TagValue::DateTime(expected)));
        assert_eq!(date.value(&obj).unwrap().to_string(), "2021-01-05 00:00:00");

        let age = DicomTag::new("PatientAge").with_transform(TagTransform::AgeYears);
        assert_eq!(age.value(&obj), Some(TagValue::Integer(45)));

        let number = DicomTag::new("SeriesNumber").with_transform(TagTransform::Integer);
        assert_eq!(number.value(&obj), Some(TagValue::Integer(3)));

        // A failed conversion keeps the raw value.
        let bad = DicomTag::new("PatientName").with_transform(TagTransform::Date);
        assert_eq!(bad.value(&obj), Some(TagValue::Text("DOE^JANE".into())));

        fn family_name(raw: &str) -> Option<TagValue> {
            raw.split('^').next().map(|s| TagValue::Text(s.to_string()))
        }
        let custom = DicomTag::new("PatientName").with_transform(TagTransform::Custom(family_name));
        assert_eq!(custom.value(&obj), Some(TagValue::Text("DOE".into())));
    }

    #[test]
    fn test_nested_sequence_lookup() {
        let obj = dataset();
        let nested = DicomTag::new("ReferencedStudySequence.ReferencedSOPInstanceUID");
        assert_eq!(nested.value(&obj), Some(TagValue::Text("1.2.3.99".into())));
        assert_eq!(DicomTag::new("ReferencedStudySequence.PatientID").value(&obj), None);
    }

    #[test]
    fn test_group_from_json() {
        let group: DicomTagGroup = serde_json::from_str(
            r#"{"tags": [
                {"tag_name": "PatientName", "tag_alias": "name"},
                {"tag_name": ["PatientID", "OtherPatientIDs"], "default_val": "none"},
                {"tag_name": "StudyDate", "transform": "date"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(group.aliases(), vec!["name", "PatientID", "StudyDate"]);

        let record = group.parse(&dataset());
        assert_eq!(record["name"], Some(TagValue::Text("DOE^JANE".into())));
        assert_eq!(record["PatientID"], Some(TagValue::Text("ALT-7".into())));
        assert!(matches!(record["StudyDate"], Some(TagValue::DateTime(_))));
    }

    #[test]
    fn test_datetime_serializes_like_csv() {
        let dt = NaiveDate::from_ymd_opt(2021, 1, 5).unwrap().and_hms_opt(8, 30, 0).unwrap();
        let json = serde_json::to_string(&TagValue::DateTime(dt)).unwrap();
        assert_eq!(json, "\"2021-01-05 08:30:00\"");
    }
}

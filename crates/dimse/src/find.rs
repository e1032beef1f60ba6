//! Query engine (C-FIND)
//!
//! A query is split into date windows of at most 16 days, and each window
//! into 26 shards on the first letter of PatientName. Every shard runs on
//! its own association.

use chrono::NaiveDate;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::association::{find_sop_class, Association, ContextProposal};
use crate::config::{DicomNode, DimseConfig};
use crate::message::{decode_dataset, encode_dataset, find_rq};
use crate::scu::DimseScu;
use crate::types::{lookup_field, status, FindResult, QueryLevel, SearchField, SEARCH_FIELDS};
use crate::{DimseError, Result};

/// Days added to a window's first day to get its last day
pub const WINDOW_SPAN_DAYS: i64 = 15;

const RESULT_CHANNEL_CAPACITY: usize = 64;

/// Inclusive date range sent as one StudyDate matching key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    /// `YYYYMMDD` for a single day, `YYYYMMDD-YYYYMMDD` otherwise
    pub fn to_dicom_range(&self) -> String {
        if self.start == self.end {
            self.start.format("%Y%m%d").to_string()
        } else {
            format!("{}-{}", self.start.format("%Y%m%d"), self.end.format("%Y%m%d"))
        }
    }

    /// Number of days covered, both ends included
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

/// Split `[start, end]` into consecutive windows of at most 16 days
pub fn date_windows(start: NaiveDate, end: NaiveDate) -> Vec<DateWindow> {
    let mut windows = Vec::new();
    let mut current = start;
    while current <= end {
        let upper = (current + chrono::Duration::days(WINDOW_SPAN_DAYS)).min(end);
        windows.push(DateWindow { start: current, end: upper });
        match upper.succ_opt() {
            Some(next) => current = next,
            None => break,
        }
    }
    windows
}

/// One (window, letter) unit of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    pub window: DateWindow,
    pub letter: char,
}

impl std::fmt::Display for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}*", self.window.to_dicom_range(), self.letter)
    }
}

/// Parameters of a C-FIND scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindQuery {
    pub query_level: QueryLevel,
    pub start_date: NaiveDate,
    /// Defaults to `start_date`
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub modality: Option<String>,
    /// Return keys requested on top of the search fields
    #[serde(default)]
    pub fields: Vec<String>,
}

impl FindQuery {
    pub fn new(query_level: QueryLevel, start_date: NaiveDate) -> Self {
        Self {
            query_level,
            start_date,
            end_date: None,
            modality: None,
            fields: Vec::new(),
        }
    }

    /// Create a new patient-level query
    pub fn patient(start_date: NaiveDate) -> Self {
        Self::new(QueryLevel::Patient, start_date)
    }

    /// Create a new study-level query
    pub fn study(start_date: NaiveDate) -> Self {
        Self::new(QueryLevel::Study, start_date)
    }

    pub fn with_end_date(mut self, end_date: NaiveDate) -> Self {
        self.end_date = Some(end_date);
        self
    }

    pub fn with_modality(mut self, modality: impl Into<String>) -> Self {
        self.modality = Some(modality.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn end_date(&self) -> NaiveDate {
        self.end_date.unwrap_or(self.start_date)
    }

    /// Check dates and field names
    pub fn validate(&self) -> Result<()> {
        if self.end_date() < self.start_date {
            return Err(DimseError::invalid_query(format!(
                "end date {} is before start date {}",
                self.end_date(),
                self.start_date
            )));
        }
        self.result_fields().map(|_| ())
    }

    /// Search fields followed by requested fields, without duplicates
    pub fn result_fields(&self) -> Result<Vec<SearchField>> {
        let mut fields: Vec<SearchField> = Vec::new();
        for name in SEARCH_FIELDS.iter().copied().chain(self.fields.iter().map(String::as_str)) {
            let field = lookup_field(name)?;
            if !fields.iter().any(|f| f.name == field.name) {
                fields.push(field);
            }
        }
        Ok(fields)
    }

    /// Column names of the records this query yields
    pub fn column_names(&self) -> Result<Vec<String>> {
        Ok(self
            .result_fields()?
            .into_iter()
            .map(|f| f.name.to_string())
            .collect())
    }

    /// Shards in execution order: windows first, then letters
    pub fn shards(&self) -> Vec<Shard> {
        date_windows(self.start_date, self.end_date())
            .into_iter()
            .flat_map(|window| ('a'..='z').map(move |letter| Shard { window, letter }))
            .collect()
    }

    /// Identifier data set sent for one shard
    pub fn identifier(&self, shard: &Shard, fields: &[SearchField]) -> InMemDicomObject {
        let mut obj = InMemDicomObject::new_empty();
        for field in fields {
            obj.put(DataElement::new(field.tag, field.vr, PrimitiveValue::Empty));
        }
        obj.put(DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from(self.query_level.to_string()),
        ));
        obj.put(DataElement::new(
            tags::MODALITY,
            VR::CS,
            PrimitiveValue::from(self.modality.clone().unwrap_or_default()),
        ));
        obj.put(DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            PrimitiveValue::from(format!("{}*", shard.letter)),
        ));
        obj.put(DataElement::new(
            tags::STUDY_DATE,
            VR::DA,
            PrimitiveValue::from(shard.window.to_dicom_range()),
        ));
        obj
    }
}

impl DimseScu {
    /// Run a windowed, sharded C-FIND against `node`.
    ///
    /// Validation happens before any network activity. The returned stream
    /// yields records as they arrive; a shard that fails yields one `Err`
    /// and the scan moves on. Dropping the stream stops the scan and
    /// releases the current association.
    pub async fn find(
        &self,
        node: &DicomNode,
        query: FindQuery,
    ) -> Result<impl Stream<Item = Result<FindResult>>> {
        node.require_network_info()?;
        query.validate()?;
        let fields = query.result_fields()?;

        info!(
            "Sending C-FIND to {} (level: {}, {} to {})",
            node,
            query.query_level,
            query.start_date,
            query.end_date()
        );

        let (tx, rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let local = self.config.local.clone();
        let remote = node.clone();
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || {
            for shard in query.shards() {
                if tx.is_closed() {
                    debug!("C-FIND consumer went away, stopping scan");
                    break;
                }
                let identifier = query.identifier(&shard, &fields);
                let mut emit = |result: FindResult| tx.blocking_send(Ok(result)).is_ok();
                match run_shard(&local, &remote, &config, query.query_level, &identifier, &fields, &mut emit) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        warn!(shard = %shard, "C-FIND shard failed: {}", e);
                        if tx.blocking_send(Err(shard_error(e, &shard))).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}

fn shard_error(e: DimseError, shard: &Shard) -> DimseError {
    match e {
        DimseError::Connection(msg) => DimseError::Connection(format!("shard {}: {}", shard, msg)),
        DimseError::OperationFailed(msg) => {
            DimseError::OperationFailed(format!("shard {}: {}", shard, msg))
        }
        DimseError::Decode(msg) => DimseError::Decode(format!("shard {}: {}", shard, msg)),
        other => other,
    }
}

/// Run one shard; `Ok(false)` means the consumer stopped listening
fn run_shard(
    local: &DicomNode,
    remote: &DicomNode,
    config: &DimseConfig,
    level: QueryLevel,
    identifier: &InMemDicomObject,
    fields: &[SearchField],
    emit: &mut dyn FnMut(FindResult) -> bool,
) -> Result<bool> {
    let sop_class = find_sop_class(level);
    let mut association = Association::open(local, remote, &[ContextProposal::find(level)], config)?;
    let pc = association.require_context(sop_class)?;

    let data = encode_dataset(identifier, &pc.transfer_syntax)?;
    let message_id = association.next_message_id();
    association.send_message(pc.id, &find_rq(message_id, sop_class), Some(&data))?;

    let mut matches = 0usize;
    loop {
        let response = association.receive_message()?;
        let code = response
            .status()
            .ok_or_else(|| DimseError::operation_failed("C-FIND response without status"))?;

        if status::is_pending(code) {
            let Some(data) = response.data.as_deref() else {
                continue;
            };
            match decode_dataset(data, &pc.transfer_syntax) {
                Ok(found) => {
                    matches += 1;
                    if !emit(FindResult::from_identifier(&found, fields)) {
                        return Ok(false);
                    }
                }
                Err(e) => warn!("Skipping undecodable C-FIND match: {}", e),
            }
        } else if code == status::SUCCESS || code == status::CANCEL {
            break;
        } else {
            return Err(DimseError::operation_failed(format!(
                "C-FIND failed with status {:#06X}",
                code
            )));
        }
    }

    debug!(peer = association.peer(), matches, "C-FIND shard completed");
    if let Err(e) = association.release() {
        debug!("Release after C-FIND failed: {}", e);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_month_is_split_into_two_windows() {
        let windows = date_windows(date(2021, 1, 1), date(2021, 2, 1));
        assert_eq!(
            windows,
            vec![
                DateWindow { start: date(2021, 1, 1), end: date(2021, 1, 16) },
                DateWindow { start: date(2021, 1, 17), end: date(2021, 2, 1) },
            ]
        );
        assert!(windows.iter().all(|w| w.days() <= 16));
        assert_eq!(windows[0].to_dicom_range(), "20210101-20210116");
    }

    #[test]
    fn test_windows_cover_range_without_gaps() {
        let start = date(2020, 12, 20);
        let end = date(2021, 3, 3);
        let windows = date_windows(start, end);
        assert_eq!(windows.first().unwrap().start, start);
        assert_eq!(windows.last().unwrap().end, end);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end.succ_opt().unwrap(), pair[1].start);
        }
    }

    #[test]
    fn test_single_day_window() {
        let windows = date_windows(date(2021, 5, 4), date(2021, 5, 4));
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].to_dicom_range(), "20210504");
    }

    #[test]
    fn test_shards_iterate_windows_then_letters() {
        let query = FindQuery::study(date(2021, 1, 1)).with_end_date(date(2021, 2, 1));
        let shards = query.shards();
        assert_eq!(shards.len(), 52);
        assert_eq!(shards[0].letter, 'a');
        assert_eq!(shards[25].letter, 'z');
        assert_eq!(shards[26].window.start, date(2021, 1, 17));
    }

    #[test]
    fn test_identifier_carries_matching_and_return_keys() {
        let query = FindQuery::study(date(2021, 1, 1))
            .with_modality("CT")
            .with_field("StudyInstanceUID");
        let fields = query.result_fields().unwrap();
        let shard = query.shards()[2];
        let obj = query.identifier(&shard, &fields);

        let get = |tag| obj.element(tag).unwrap().to_str().unwrap().trim().to_string();
        assert_eq!(get(tags::PATIENT_NAME), "c*");
        assert_eq!(get(tags::MODALITY), "CT");
        assert_eq!(get(tags::STUDY_DATE), "20210101");
        assert_eq!(get(tags::QUERY_RETRIEVE_LEVEL), "STUDY");
        assert!(obj.element(tags::STUDY_INSTANCE_UID).is_ok());
    }

    #[test]
    fn test_result_fields_deduplicate() {
        let query = FindQuery::patient(date(2021, 1, 1)).with_fields(["PatientName", "PatientID"]);
        assert_eq!(
            query.column_names().unwrap(),
            vec!["Modality", "PatientName", "StudyDate", "PatientID"]
        );
    }

    #[tokio::test]
    async fn test_end_before_start_is_rejected() {
        let scu = DimseScu::new(DimseConfig::default());
        let node = DicomNode::remote("PACS", "127.0.0.1", 104);
        let query = FindQuery::study(date(2021, 2, 1)).with_end_date(date(2021, 1, 1));
        let result = scu.find(&node, query).await;
        assert!(matches!(result, Err(DimseError::InvalidQuery(_))));
    }

    #[tokio::test]
    async fn test_unknown_field_is_rejected() {
        let scu = DimseScu::new(DimseConfig::default());
        let node = DicomNode::remote("PACS", "127.0.0.1", 104);
        let query = FindQuery::study(date(2021, 2, 1)).with_field("ShoeSize");
        assert!(matches!(
            scu.find(&node, query).await,
            Err(DimseError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_node_without_address_is_rejected() {
        let scu = DimseScu::new(DimseConfig::default());
        let query = FindQuery::study(date(2021, 2, 1));
        assert!(matches!(
            scu.find(&DicomNode::new("PACS"), query).await,
            Err(DimseError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_node_yields_one_error_per_shard() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = DimseConfig::default();
        config.connect_timeout_ms = 500;
        let scu = DimseScu::new(config);
        let node = DicomNode::remote("PACS", "127.0.0.1", port);

        let items: Vec<_> = scu
            .find(&node, FindQuery::study(date(2021, 1, 1)))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 26);
        assert!(items.iter().all(|item| matches!(item, Err(DimseError::Connection(_)))));
    }
}

//! Conversions between DICOM string forms and chrono values

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("Invalid DICOM date or datetime: '{0}'")]
    InvalidDate(String),

    #[error("Invalid DICOM time: '{0}'")]
    InvalidTime(String),

    #[error("Invalid DICOM age string: '{0}'")]
    InvalidAge(String),
}

/// Parse a DICOM `DA` (`YYYYMMDD`) or `DT` (`YYYYMMDDHHMMSS.FFFFFF&ZZXX`) value.
///
/// A UTC offset, when present, is dropped and the local wall time kept.
pub fn str_to_datetime(value: &str) -> Result<NaiveDateTime, ConvertError> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y%m%d") {
        return Ok(date.and_time(NaiveTime::MIN));
    }
    if let Ok(datetime) = NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%S%.f") {
        return Ok(datetime);
    }
    DateTime::parse_from_str(value, "%Y%m%d%H%M%S%.f%z")
        .map(|dt| dt.naive_local())
        .map_err(|_| ConvertError::InvalidDate(value.to_string()))
}

/// Parse a DICOM `TM` value: `HH[MM[SS[.FFFFFF]]]`
pub fn str_to_time(value: &str) -> Result<NaiveTime, ConvertError> {
    let invalid = || ConvertError::InvalidTime(value.to_string());
    let trimmed = value.trim();
    let (clock, fraction) = match trimmed.split_once('.') {
        Some((clock, fraction)) => (clock, Some(fraction)),
        None => (trimmed, None),
    };
    if !clock.is_ascii() || clock.len() % 2 != 0 || clock.is_empty() || clock.len() > 6 {
        return Err(invalid());
    }
    // A fraction is only allowed after full seconds.
    if fraction.is_some() && clock.len() != 6 {
        return Err(invalid());
    }

    let mut parts = [0u32; 3];
    for (i, part) in parts.iter_mut().enumerate().take(clock.len() / 2) {
        *part = clock[i * 2..i * 2 + 2].parse().map_err(|_| invalid())?;
    }
    let micros = match fraction {
        None => 0,
        Some(f) if !f.is_empty() && f.len() <= 6 && f.bytes().all(|b| b.is_ascii_digit()) => {
            format!("{:0<6}", f).parse::<u32>().map_err(|_| invalid())?
        }
        Some(_) => return Err(invalid()),
    };
    NaiveTime::from_hms_micro_opt(parts[0], parts[1], parts[2], micros).ok_or_else(invalid)
}

/// Format a datetime as a DICOM `DA`, or as a `DT` when it carries a time
/// of day or `use_time` is set
pub fn datetime_to_str(value: &NaiveDateTime, use_time: bool) -> String {
    let midnight = value.time() == NaiveTime::MIN && value.nanosecond() == 0;
    if use_time || !midnight {
        value.format("%Y%m%d%H%M%S.%6f").to_string()
    } else {
        value.format("%Y%m%d").to_string()
    }
}

/// Convert a DICOM `AS` value (`nnnD`, `nnnW`, `nnnM` or `nnnY`) to whole years.
///
/// Uses 365 days, 52 weeks and 12 months per year.
pub fn age_to_years(value: &str) -> Result<u32, ConvertError> {
    let invalid = || ConvertError::InvalidAge(value.to_string());
    let value = value.trim();
    if value.len() != 4 || !value.is_ascii() {
        return Err(invalid());
    }
    let (number, unit) = value.split_at(3);
    let number: u32 = number.parse().map_err(|_| invalid())?;
    match unit.to_ascii_uppercase().as_str() {
        "D" => Ok(number / 365),
        "W" => Ok(number / 52),
        "M" => Ok(number / 12),
        "Y" => Ok(number),
        _ => Err(invalid()),
    }
}

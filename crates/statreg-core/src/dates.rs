//! Timestamp normalization and lenient release-date parsing.

use chrono::{DateTime, Month, NaiveDate, NaiveDateTime};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateError {
    #[error("empty date value")]
    Empty,
    #[error("unrecognized date value: {0:?}")]
    Unrecognized(String),
}

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%:z",
];

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"];

/// Parses an ISO-8601 style timestamp and returns it as naive UTC.
///
/// Offset-bearing values (including a literal `Z`) are converted to UTC.
/// Values without any offset are taken to already be UTC.
pub fn normalize_timestamp(raw: &str) -> Result<NaiveDateTime, DateError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(DateError::Empty);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Ok(parsed.naive_utc());
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(text, fmt) {
            return Ok(parsed.naive_utc());
        }
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, fmt) {
            return Ok(parsed);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| DateError::Unrecognized(text.to_string()))
}

/// Pulls a calendar date out of free text such as `"Tuesday 12th July 2022 9:30am"`.
///
/// A month name and a four digit year are required. A missing day of month
/// defaults to the 1st. Clock times and unrelated words are ignored.
pub fn parse_fuzzy_date(raw: &str) -> Result<NaiveDate, DateError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(DateError::Empty);
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
            return Ok(date);
        }
    }
    if let Ok(ts) = normalize_timestamp(text) {
        return Ok(ts.date());
    }

    let mut day: Option<u32> = None;
    let mut month: Option<Month> = None;
    let mut year: Option<i32> = None;

    for word in text.split_whitespace() {
        if word.contains(':') {
            continue;
        }
        for token in word
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            if let Some(number) = numeric_token(token) {
                if number >= 1000 && token.len() == 4 && year.is_none() {
                    year = i32::try_from(number).ok();
                } else if (1..=31).contains(&number) && day.is_none() {
                    day = Some(number);
                }
                continue;
            }
            if month.is_none() {
                month = token.to_ascii_lowercase().parse::<Month>().ok();
            }
        }
    }

    match (year, month) {
        (Some(year), Some(month)) => {
            NaiveDate::from_ymd_opt(year, month.number_from_month(), day.unwrap_or(1))
                .ok_or_else(|| DateError::Unrecognized(text.to_string()))
        }
        _ => Err(DateError::Unrecognized(text.to_string())),
    }
}

/// Accepts plain digits or digits with an English ordinal suffix (`1st`, `22nd`).
fn numeric_token(token: &str) -> Option<u32> {
    let digits_end = token
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    if digits_end == 0 {
        return None;
    }
    let (digits, suffix) = token.split_at(digits_end);
    if !matches!(
        suffix.to_ascii_lowercase().as_str(),
        "" | "st" | "nd" | "rd" | "th"
    ) {
        return None;
    }
    digits.parse().ok()
}

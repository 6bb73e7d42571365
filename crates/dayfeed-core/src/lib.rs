//! Core domain model for dayfeed: target windows, URL templates, typed rows
//! and the per-date aggregate document.

use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "dayfeed-core";

/// Document field holding the natural key of an aggregate document.
pub const TARGET_DATE_FIELD: &str = "target_date";
pub const CREATED_AT_FIELD: &str = "created_at";
pub const UPDATED_AT_FIELD: &str = "updated_at";
pub const ROWS_FIELD: &str = "rows";

const DASHED_FORMAT: &str = "%Y-%m-%d";
const COMPACT_FORMAT: &str = "%Y%m%d";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlError {
    #[error("invalid date format: {input:?} (expected YYYY-MM-DD)")]
    InvalidDateFormat { input: String },
    #[error("invalid url template {template:?}: {detail}")]
    InvalidTemplate { template: String, detail: String },
}

/// Parse a strict `YYYY-MM-DD` civil date.
pub fn parse_dashed_date(input: &str) -> Result<NaiveDate, UrlError> {
    let invalid = || UrlError::InvalidDateFormat {
        input: input.to_string(),
    };
    let date = NaiveDate::parse_from_str(input, DASHED_FORMAT).map_err(|_| invalid())?;
    // chrono accepts single-digit months and days; the wire format does not.
    if date.format(DASHED_FORMAT).to_string() != input {
        return Err(invalid());
    }
    Ok(date)
}

/// The civil date (and optional end date) a run fetches data for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetWindow {
    start: NaiveDate,
    end: Option<NaiveDate>,
}

impl TargetWindow {
    pub fn new(start: NaiveDate, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    pub fn parse(start: &str, end: Option<&str>) -> Result<Self, UrlError> {
        let start = parse_dashed_date(start)?;
        let end = end.map(parse_dashed_date).transpose()?;
        Ok(Self { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> Option<NaiveDate> {
        self.end
    }

    /// Start date as `YYYYMMDD`.
    pub fn compact(&self) -> String {
        self.start.format(COMPACT_FORMAT).to_string()
    }

    /// Start date as `YYYY-MM-DD`.
    pub fn dashed(&self) -> String {
        self.start.format(DASHED_FORMAT).to_string()
    }

    pub fn end_compact(&self) -> Option<String> {
        self.end.map(|d| d.format(COMPACT_FORMAT).to_string())
    }

    pub fn end_dashed(&self) -> Option<String> {
        self.end.map(|d| d.format(DASHED_FORMAT).to_string())
    }

    /// Placeholder values available to a URL template for this window.
    pub fn substitutions(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![("date", self.compact()), ("date_dashed", self.dashed())];
        if let (Some(compact), Some(dashed)) = (self.end_compact(), self.end_dashed()) {
            out.push(("end_date", compact));
            out.push(("end_date_dashed", dashed));
        }
        out
    }

    /// Fill `template` (`{date}`, `{date_dashed}`, `{end_date}`,
    /// `{end_date_dashed}`; `{{` and `}}` escape braces).
    pub fn render(&self, template: &str) -> Result<String, UrlError> {
        render_template(template, &self.substitutions())
    }
}

impl std::fmt::Display for TargetWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}..{}", self.start, end),
            None => write!(f, "{}", self.start),
        }
    }
}

pub fn render_template(template: &str, values: &[(&str, String)]) -> Result<String, UrlError> {
    let invalid = |detail: String| UrlError::InvalidTemplate {
        template: template.to_string(),
        detail,
    };

    let mut out = String::with_capacity(template.len() + 16);
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if !closed {
                    return Err(invalid("unterminated placeholder".to_string()));
                }
                let value = values
                    .iter()
                    .find(|(key, _)| *key == name)
                    .map(|(_, v)| v)
                    .ok_or_else(|| invalid(format!("no value for placeholder {{{name}}}")))?;
                out.push_str(value);
            }
            '}' => return Err(invalid("unmatched '}'".to_string())),
            other => out.push(other),
        }
    }
    Ok(out)
}

/// A coerced CSV field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// Normalized field name -> typed value, in source column order.
pub type NormalizedRow = IndexMap<String, FieldValue>;

/// The single stored record for one target date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDocument {
    pub target_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    pub rows: Vec<NormalizedRow>,
}

impl AggregateDocument {
    pub fn new(target_date: DateTime<Utc>, created_at: DateTime<Utc>, rows: Vec<NormalizedRow>) -> Self {
        Self {
            target_date,
            created_at,
            updated_at: None,
            rows,
        }
    }
}

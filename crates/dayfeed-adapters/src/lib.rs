//! Feed schemas + the row normalizer that turns a raw `;`-separated payload
//! into typed rows.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use dayfeed_core::{FieldValue, NormalizedRow};
use encoding_rs::WINDOWS_1252;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "dayfeed-adapters";

pub const DEFAULT_TIMEZONE: &str = "Europe/Warsaw";
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y%m%d";
pub const DEFAULT_DELIMITER: char = ';';
/// Marks the repeated hour on the day clocks go back.
pub const DUPLICATE_HOUR_MARKER: &str = "2A";

const NON_BREAKING_SPACES: [char; 2] = ['\u{a0}', '\u{202f}'];
/// Bytes the Windows-1252 code page leaves unassigned.
const WINDOWS_1252_UNDEFINED: [u8; 5] = [0x81, 0x8d, 0x8f, 0x90, 0x9d];

fn default_timestamp_format() -> String {
    DEFAULT_TIMESTAMP_FORMAT.to_string()
}

fn default_null_markers() -> Vec<String> {
    vec!["-".to_string(), String::new()]
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

fn default_delimiter() -> char {
    DEFAULT_DELIMITER
}

/// Column typing rules for one feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSchema {
    #[serde(default)]
    pub int_columns: Vec<String>,
    #[serde(default)]
    pub float_columns: Vec<String>,
    #[serde(default)]
    pub timestamp_columns: Vec<String>,
    /// Timestamp columns holding wall-clock time in `timezone`.
    #[serde(default)]
    pub utc_columns: Vec<String>,
    /// Timestamp column -> integer column with hours to add before UTC conversion.
    #[serde(default)]
    pub hour_offsets: BTreeMap<String, String>,
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
    /// Integer column carrying a 1-indexed hour of day.
    #[serde(default)]
    pub hour_column: Option<String>,
    #[serde(default = "default_null_markers")]
    pub null_markers: Vec<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl Default for FeedSchema {
    fn default() -> Self {
        Self {
            int_columns: Vec::new(),
            float_columns: Vec::new(),
            timestamp_columns: Vec::new(),
            utc_columns: Vec::new(),
            hour_offsets: BTreeMap::new(),
            timestamp_format: default_timestamp_format(),
            hour_column: None,
            null_markers: default_null_markers(),
            timezone: default_timezone(),
            delimiter: default_delimiter(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("column {column:?} is declared as both {first} and {second}")]
    OverlappingColumn {
        column: String,
        first: &'static str,
        second: &'static str,
    },
    #[error("utc column {0:?} is not a timestamp column")]
    UtcColumnNotTimestamp(String),
    #[error("hour offset source {0:?} is not a timestamp column")]
    OffsetColumnNotTimestamp(String),
    #[error("hour offset companion {0:?} is not an integer column")]
    OffsetCompanionNotInteger(String),
    #[error("hour column {0:?} is not an integer column")]
    HourColumnNotInteger(String),
    #[error("unknown timezone {name:?}: {detail}")]
    UnknownTimezone { name: String, detail: String },
    #[error("delimiter {0:?} must be a single ASCII character")]
    InvalidDelimiter(char),
    #[error("timestamp format must not be empty")]
    EmptyTimestampFormat,
}

impl FeedSchema {
    pub fn validate(&self) -> Result<(), SchemaError> {
        let groups: [(&'static str, &Vec<String>); 3] = [
            ("integer", &self.int_columns),
            ("float", &self.float_columns),
            ("timestamp", &self.timestamp_columns),
        ];
        let mut seen: HashMap<&str, &'static str> = HashMap::new();
        for (kind, columns) in groups {
            for column in columns {
                if let Some(first) = seen.insert(column.as_str(), kind) {
                    return Err(SchemaError::OverlappingColumn {
                        column: column.clone(),
                        first,
                        second: kind,
                    });
                }
            }
        }

        if let Some(column) = self
            .utc_columns
            .iter()
            .find(|c| !self.timestamp_columns.contains(c))
        {
            return Err(SchemaError::UtcColumnNotTimestamp(column.clone()));
        }
        for (source, companion) in &self.hour_offsets {
            if !self.timestamp_columns.contains(source) {
                return Err(SchemaError::OffsetColumnNotTimestamp(source.clone()));
            }
            if !self.int_columns.contains(companion) {
                return Err(SchemaError::OffsetCompanionNotInteger(companion.clone()));
            }
        }
        if let Some(hour) = &self.hour_column {
            if !self.int_columns.contains(hour) {
                return Err(SchemaError::HourColumnNotInteger(hour.clone()));
            }
        }
        if !self.delimiter.is_ascii() {
            return Err(SchemaError::InvalidDelimiter(self.delimiter));
        }
        if self.timestamp_format.is_empty() {
            return Err(SchemaError::EmptyTimestampFormat);
        }
        self.tz()?;
        Ok(())
    }

    pub fn tz(&self) -> Result<Tz, SchemaError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| SchemaError::UnknownTimezone {
                name: self.timezone.clone(),
                detail: e.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoercionKind {
    Integer,
    Float,
    Timestamp,
}

impl std::fmt::Display for CoercionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoercionKind::Integer => write!(f, "integer"),
            CoercionKind::Float => write!(f, "float"),
            CoercionKind::Timestamp => write!(f, "timestamp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("column {column:?}: cannot read {value:?} as {kind}")]
pub struct RowCoercionError {
    pub column: String,
    pub value: String,
    pub kind: CoercionKind,
}

/// A source line that was dropped during normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    pub line: u64,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Windows1252,
    Utf8Lossy,
}

#[derive(Debug, Clone)]
pub struct NormalizeReport {
    pub rows: Vec<NormalizedRow>,
    pub dropped: Vec<RowError>,
    pub rows_read: usize,
    pub encoding: TextEncoding,
}

/// Header-keyed raw fields of one source line.
pub type RawRow = IndexMap<String, String>;

/// Decode as Windows-1252, falling back to lossy UTF-8 when the payload
/// holds a byte the code page does not assign.
pub fn decode_payload(bytes: &[u8]) -> (Cow<'_, str>, TextEncoding) {
    if bytes.iter().any(|b| WINDOWS_1252_UNDEFINED.contains(b)) {
        return (String::from_utf8_lossy(bytes), TextEncoding::Utf8Lossy);
    }
    let (text, _) = WINDOWS_1252.decode_without_bom_handling(bytes);
    (text, TextEncoding::Windows1252)
}

/// Spaces become underscores, then non-ASCII is folded to ASCII.
pub fn normalize_field_name(name: &str) -> String {
    deunicode::deunicode(&name.replace(' ', "_"))
}

/// Interpret `naive` as wall-clock time in `tz`. Ambiguous times resolve to
/// standard time; times inside a DST gap use the offset in force before it.
pub fn local_to_utc(tz: &Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(_, standard) => standard.with_timezone(&Utc),
        LocalResult::None => {
            let offset_secs = naive
                .checked_sub_signed(TimeDelta::hours(3))
                .and_then(|before| tz.from_local_datetime(&before).earliest())
                .map(|dt| dt.offset().fix().local_minus_utc())
                .unwrap_or(0);
            let utc = naive
                .checked_sub_signed(TimeDelta::seconds(i64::from(offset_secs)))
                .unwrap_or(naive);
            Utc.from_utc_datetime(&utc)
        }
    }
}

/// Local midnight of `date` in `tz`, as UTC.
pub fn local_midnight_utc(tz: &Tz, date: NaiveDate) -> DateTime<Utc> {
    local_to_utc(tz, date.and_time(chrono::NaiveTime::MIN))
}

pub fn load_payload_file(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// Applies a validated [`FeedSchema`] to payloads and rows.
#[derive(Debug, Clone)]
pub struct RowNormalizer {
    schema: FeedSchema,
    tz: Tz,
    int_columns: HashSet<String>,
    float_columns: HashSet<String>,
    timestamp_columns: HashSet<String>,
    utc_columns: HashSet<String>,
}

impl RowNormalizer {
    pub fn new(schema: FeedSchema) -> Result<Self, SchemaError> {
        schema.validate()?;
        let tz = schema.tz()?;
        let set = |cols: &[String]| cols.iter().cloned().collect::<HashSet<_>>();
        Ok(Self {
            int_columns: set(&schema.int_columns),
            float_columns: set(&schema.float_columns),
            timestamp_columns: set(&schema.timestamp_columns),
            utc_columns: set(&schema.utc_columns),
            tz,
            schema,
        })
    }

    pub fn schema(&self) -> &FeedSchema {
        &self.schema
    }

    pub fn tz(&self) -> &Tz {
        &self.tz
    }

    /// Decode, split and coerce a downloaded payload. Bad rows are dropped
    /// and reported; the batch itself never fails.
    pub fn normalize(&self, payload: Vec<u8>) -> NormalizeReport {
        let (text, encoding) = decode_payload(&payload);
        if encoding == TextEncoding::Utf8Lossy {
            warn!("payload is not valid windows-1252; decoded as lossy utf-8");
        }

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.schema.delimiter as u8)
            .flexible(true)
            .has_headers(true)
            .from_reader(text.as_bytes());

        let mut report = NormalizeReport {
            rows: Vec::new(),
            dropped: Vec::new(),
            rows_read: 0,
            encoding,
        };

        let headers: Vec<String> = match reader.headers() {
            Ok(headers) => headers
                .iter()
                .map(|h| h.trim_start_matches('\u{feff}').to_string())
                .collect(),
            Err(err) => {
                warn!(error = %err, "cannot read header line");
                report.dropped.push(RowError {
                    line: 1,
                    message: format!("header: {err}"),
                });
                return report;
            }
        };

        for (idx, result) in reader.records().enumerate() {
            report.rows_read += 1;
            let fallback_line = idx as u64 + 2;
            let record = match result {
                Ok(record) => record,
                Err(err) => {
                    let line = err.position().map(|p| p.line()).unwrap_or(fallback_line);
                    warn!(line, error = %err, "dropping unparseable line");
                    report.dropped.push(RowError {
                        line,
                        message: format!("csv: {err}"),
                    });
                    continue;
                }
            };
            let line = record.position().map(|p| p.line()).unwrap_or(fallback_line);

            let raw: RawRow = headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.clone(), v.to_string()))
                .collect();

            match self.normalize_row(&raw) {
                Ok(row) => report.rows.push(row),
                Err(err) => {
                    warn!(line, error = %err, "dropping row");
                    report.dropped.push(RowError {
                        line,
                        message: err.to_string(),
                    });
                }
            }
        }

        debug!(
            rows_read = report.rows_read,
            rows_kept = report.rows.len(),
            rows_dropped = report.dropped.len(),
            "normalized payload"
        );
        report
    }

    /// Pure per-row transform; declared columns absent from the row come out null.
    pub fn normalize_row(&self, row: &RawRow) -> Result<NormalizedRow, RowCoercionError> {
        let field = |column: &str| row.get(column).map(String::as_str).unwrap_or("");

        let mut typed: HashMap<&str, FieldValue> = HashMap::new();
        let mut ints: HashMap<&str, Option<i64>> = HashMap::new();

        for column in &self.schema.int_columns {
            let value = self.coerce_int(column, field(column))?;
            ints.insert(column.as_str(), value);
            typed.insert(column.as_str(), value.map(FieldValue::Int).unwrap_or(FieldValue::Null));
        }

        for column in &self.schema.float_columns {
            let value = self.coerce_float(column, field(column))?;
            typed.insert(column.as_str(), value.map(FieldValue::Float).unwrap_or(FieldValue::Null));
        }

        for column in &self.schema.timestamp_columns {
            let offset_hours = self
                .schema
                .hour_offsets
                .get(column)
                .and_then(|companion| ints.get(companion.as_str()).copied().flatten());
            let value = self.coerce_timestamp(column, field(column), offset_hours)?;
            typed.insert(
                column.as_str(),
                value.map(FieldValue::Timestamp).unwrap_or(FieldValue::Null),
            );
        }

        let mut out = NormalizedRow::with_capacity(row.len() + typed.len());
        for (column, raw) in row {
            let value = typed
                .remove(column.as_str())
                .unwrap_or_else(|| FieldValue::Text(raw.clone()));
            out.insert(normalize_field_name(column), value);
        }
        let declared = self
            .schema
            .int_columns
            .iter()
            .chain(&self.schema.float_columns)
            .chain(&self.schema.timestamp_columns);
        for column in declared {
            if let Some(value) = typed.remove(column.as_str()) {
                out.insert(normalize_field_name(column), value);
            }
        }
        Ok(out)
    }

    fn is_null(&self, value: &str) -> bool {
        self.schema.null_markers.iter().any(|m| m == value)
    }

    pub fn coerce_int(&self, column: &str, value: &str) -> Result<Option<i64>, RowCoercionError> {
        if self.is_null(value) {
            return Ok(None);
        }
        let is_hour = self.schema.hour_column.as_deref() == Some(column);
        if is_hour && value == DUPLICATE_HOUR_MARKER {
            return Ok(Some(2));
        }
        let cleaned: String = value.chars().filter(|c| !NON_BREAKING_SPACES.contains(c)).collect();
        let parsed = cleaned.trim().parse::<i64>().ok();
        let shifted = if is_hour { parsed.and_then(|h| h.checked_sub(1)) } else { parsed };
        shifted.map(Some).ok_or_else(|| RowCoercionError {
            column: column.to_string(),
            value: value.to_string(),
            kind: CoercionKind::Integer,
        })
    }

    pub fn coerce_float(&self, column: &str, value: &str) -> Result<Option<f64>, RowCoercionError> {
        if self.is_null(value) {
            return Ok(None);
        }
        let cleaned: String = value
            .chars()
            .filter(|c| !NON_BREAKING_SPACES.contains(c))
            .map(|c| if c == ',' { '.' } else { c })
            .collect();
        cleaned
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| RowCoercionError {
                column: column.to_string(),
                value: value.to_string(),
                kind: CoercionKind::Float,
            })
    }

    pub fn coerce_timestamp(
        &self,
        column: &str,
        value: &str,
        offset_hours: Option<i64>,
    ) -> Result<Option<DateTime<Utc>>, RowCoercionError> {
        if self.is_null(value) {
            return Ok(None);
        }
        let format = &self.schema.timestamp_format;
        let parsed = NaiveDateTime::parse_from_str(value, format)
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(value, format)
                    .ok()
                    .map(|d| d.and_time(chrono::NaiveTime::MIN))
            })
            .ok_or_else(|| RowCoercionError {
                column: column.to_string(),
                value: value.to_string(),
                kind: CoercionKind::Timestamp,
            })?;

        let mut local = parsed;
        let mut convert = self.utc_columns.contains(column);
        if let Some(hours) = offset_hours {
            local = TimeDelta::try_hours(hours)
                .and_then(|delta| local.checked_add_signed(delta))
                .ok_or_else(|| RowCoercionError {
                    column: column.to_string(),
                    value: format!("{value} +{hours}h"),
                    kind: CoercionKind::Timestamp,
                })?;
            convert = true;
        }

        Ok(Some(if convert {
            local_to_utc(&self.tz, local)
        } else {
            Utc.from_utc_datetime(&local)
        }))
    }

    pub fn is_declared(&self, column: &str) -> bool {
        self.int_columns.contains(column)
            || self.float_columns.contains(column)
            || self.timestamp_columns.contains(column)
    }
}

/// Convenience wrapper: validate `schema` and normalize `payload` with it.
pub fn normalize(payload: Vec<u8>, schema: &FeedSchema) -> Result<NormalizeReport, SchemaError> {
    Ok(RowNormalizer::new(schema.clone())?.normalize(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn market_schema() -> FeedSchema {
        FeedSchema {
            int_columns: vec!["Godzina".into(), "Wolumen".into()],
            float_columns: vec!["Cena".into()],
            timestamp_columns: vec!["Doba".into()],
            utc_columns: vec!["Doba".into()],
            hour_offsets: BTreeMap::from([("Doba".to_string(), "Godzina".to_string())]),
            timestamp_format: "%Y%m%d".into(),
            hour_column: Some("Godzina".into()),
            ..FeedSchema::default()
        }
    }

    fn normalizer(schema: FeedSchema) -> RowNormalizer {
        RowNormalizer::new(schema).expect("valid schema")
    }

    fn raw(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn hour_column_is_shifted_to_zero_based() {
        let n = normalizer(market_schema());
        assert_eq!(n.coerce_int("Godzina", "2A").unwrap(), Some(2));
        assert_eq!(n.coerce_int("Godzina", "5").unwrap(), Some(4));
        assert_eq!(n.coerce_int("Godzina", "1").unwrap(), Some(0));
        assert_eq!(n.coerce_int("Godzina", "-").unwrap(), None);
        assert_eq!(n.coerce_int("Godzina", "").unwrap(), None);
        assert!(n.coerce_int("Godzina", "abc").is_err());
    }

    #[test]
    fn plain_integers_strip_non_breaking_spaces() {
        let n = normalizer(market_schema());
        assert_eq!(n.coerce_int("Wolumen", "12\u{a0}345").unwrap(), Some(12345));
        assert_eq!(n.coerce_int("Wolumen", "5").unwrap(), Some(5));
        assert_eq!(n.coerce_int("Wolumen", "2A").unwrap_err().kind, CoercionKind::Integer);
    }

    #[test]
    fn floats_accept_decimal_comma() {
        let n = normalizer(market_schema());
        assert_eq!(n.coerce_float("Cena", "1234,56").unwrap(), Some(1234.56));
        assert_eq!(n.coerce_float("Cena", "1\u{a0}234,56").unwrap(), Some(1234.56));
        assert_eq!(n.coerce_float("Cena", "-").unwrap(), None);
        assert_eq!(n.coerce_float("Cena", "").unwrap(), None);
        assert!(n.coerce_float("Cena", "n/a").is_err());
        assert!(n.coerce_float("Cena", "NaN").is_err());
    }

    #[test]
    fn custom_null_markers_replace_the_defaults() {
        let schema = FeedSchema {
            null_markers: vec!["NA".into()],
            ..market_schema()
        };
        let n = normalizer(schema);
        assert_eq!(n.coerce_float("Cena", "NA").unwrap(), None);
        assert!(n.coerce_float("Cena", "-").is_err());
    }

    #[test]
    fn utc_columns_convert_from_warsaw_wall_clock() {
        let schema = FeedSchema {
            timestamp_columns: vec!["Czas".into()],
            utc_columns: vec!["Czas".into()],
            timestamp_format: "%Y-%m-%d %H:%M".into(),
            ..FeedSchema::default()
        };
        let n = normalizer(schema);
        assert_eq!(
            n.coerce_timestamp("Czas", "2024-01-15 12:00", None).unwrap(),
            Some(utc("2024-01-15T11:00:00Z"))
        );
        assert_eq!(
            n.coerce_timestamp("Czas", "2024-07-15 12:00", None).unwrap(),
            Some(utc("2024-07-15T10:00:00Z"))
        );
    }

    #[test]
    fn dst_edges_follow_standard_time() {
        let tz: Tz = DEFAULT_TIMEZONE.parse().unwrap();
        let at = |s: &str| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap();
        // 02:30 happens twice on 2024-10-27; the standard-time reading wins.
        assert_eq!(local_to_utc(&tz, at("2024-10-27 02:30")), utc("2024-10-27T01:30:00Z"));
        // 02:30 never happens on 2024-03-31.
        assert_eq!(local_to_utc(&tz, at("2024-03-31 02:30")), utc("2024-03-31T01:30:00Z"));
        assert_eq!(
            local_midnight_utc(&tz, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()),
            utc("2024-01-14T23:00:00Z")
        );
    }

    #[test]
    fn hour_offset_is_added_before_conversion() {
        let n = normalizer(market_schema());
        let row = n
            .normalize_row(&raw(&[("Doba", "20240115"), ("Godzina", "14"), ("Cena", "410,5")]))
            .unwrap();
        assert_eq!(row["Godzina"], FieldValue::Int(13));
        // 2024-01-15 13:00 CET
        assert_eq!(row["Doba"], FieldValue::Timestamp(utc("2024-01-15T12:00:00Z")));

        let row = n
            .normalize_row(&raw(&[("Doba", "20240115"), ("Godzina", "-"), ("Cena", "1")]))
            .unwrap();
        assert_eq!(row["Godzina"], FieldValue::Null);
        // No offset, still a utc column: local midnight.
        assert_eq!(row["Doba"], FieldValue::Timestamp(utc("2024-01-14T23:00:00Z")));
    }

    #[test]
    fn timestamps_without_conversion_are_read_as_utc() {
        let schema = FeedSchema {
            timestamp_columns: vec!["Data".into()],
            ..FeedSchema::default()
        };
        let n = normalizer(schema);
        assert_eq!(
            n.coerce_timestamp("Data", "20240115", None).unwrap(),
            Some(utc("2024-01-15T00:00:00Z"))
        );
        assert_eq!(n.coerce_timestamp("Data", "-", None).unwrap(), None);
        assert_eq!(
            n.coerce_timestamp("Data", "15.01.2024", None).unwrap_err().kind,
            CoercionKind::Timestamp
        );
    }

    #[test]
    fn normalize_row_never_mutates_input_and_folds_keys() {
        let n = normalizer(market_schema());
        let input = raw(&[
            ("Doba", "20240115"),
            ("Godzina", "1"),
            ("Cena", "400,00"),
            ("Wolumen obrotów", "abc"),
        ]);
        let before = input.clone();
        let row = n.normalize_row(&input).unwrap();
        assert_eq!(input, before);

        let keys: Vec<&str> = row.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["Doba", "Godzina", "Cena", "Wolumen_obrotow", "Wolumen"]);
        assert_eq!(row["Wolumen_obrotow"], FieldValue::Text("abc".into()));
        // Declared but absent from the source row.
        assert_eq!(row["Wolumen"], FieldValue::Null);
    }

    #[test]
    fn field_names_are_ascii_folded() {
        assert_eq!(normalize_field_name("Cena średnia"), "Cena_srednia");
        assert_eq!(normalize_field_name("Źródło danych"), "Zrodlo_danych");
        assert_eq!(normalize_field_name("Godzina"), "Godzina");
    }

    #[test]
    fn bad_rows_are_dropped_and_the_batch_continues() {
        let n = normalizer(market_schema());
        let payload = b"Doba;Godzina;Cena;Wolumen\n\
20240115;1;400,10;10\n\
20240115;abc;401,20;11\n\
20240115;3;x;12\n\
20240115;4;403,40;13\n"
            .to_vec();
        let report = n.normalize(payload);
        assert_eq!(report.rows_read, 4);
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.dropped.len(), 2);
        assert_eq!(report.dropped[0].line, 3);
        assert_eq!(report.dropped[1].line, 4);
        assert_eq!(report.rows[0]["Godzina"], FieldValue::Int(0));
        assert_eq!(report.rows[1]["Godzina"], FieldValue::Int(3));
        assert_eq!(report.rows[1]["Cena"], FieldValue::Float(403.4));
    }

    #[test]
    fn out_of_range_hours_drop_only_their_row() {
        let n = normalizer(market_schema());
        let payload = b"Doba;Godzina\n\
20240115;1\n\
20240115;10000000000\n\
20240115;3\n"
            .to_vec();
        let report = n.normalize(payload);
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].line, 3);
        assert!(report.dropped[0].message.contains("timestamp"));

        let report = n.normalize(b"Doba;Godzina\n20240115;1\n20240115;-9223372036854775808\n20240115;3\n".to_vec());
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.dropped.len(), 1);
        assert!(report.dropped[0].message.contains("integer"));
        assert_eq!(report.rows[1]["Godzina"], FieldValue::Int(2));
    }

    #[test]
    fn utf8_payload_falls_back_when_not_windows_1252() {
        let payload = "Doba;Godzina;Miasto\n20240115;1;Łódź\n".as_bytes().to_vec();
        let report = normalizer(market_schema()).normalize(payload);
        assert_eq!(report.encoding, TextEncoding::Utf8Lossy);
        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.rows[0]["Miasto"], FieldValue::Text("Łódź".into()));

        let (text, encoding) = decode_payload(&[b'a', 0x81]);
        assert_eq!(encoding, TextEncoding::Utf8Lossy);
        assert_eq!(text, "a\u{fffd}");
    }

    #[test]
    fn windows_1252_payload_with_nbsp_and_diacritics() {
        let mut payload = b"Doba;Godzina;Cena;Wolumen;Uwagi do obrot".to_vec();
        payload.extend_from_slice(&[0xF3]);
        payload.extend_from_slice(b"w\r\n20240115;2A;1");
        payload.push(0xA0);
        payload.extend_from_slice(b"234,56;7");
        payload.push(0xA0);
        payload.extend_from_slice(b"000;-\r\n");

        let report = normalize(payload, &market_schema()).unwrap();
        assert_eq!(report.encoding, TextEncoding::Windows1252);
        assert_eq!(report.rows.len(), 1);
        let row = &report.rows[0];
        assert_eq!(row["Godzina"], FieldValue::Int(2));
        assert_eq!(row["Cena"], FieldValue::Float(1234.56));
        assert_eq!(row["Wolumen"], FieldValue::Int(7000));
        assert_eq!(row["Uwagi_do_obrotow"], FieldValue::Text("-".into()));
        // 2024-01-15 02:00 CET
        assert_eq!(row["Doba"], FieldValue::Timestamp(utc("2024-01-15T01:00:00Z")));
    }

    #[test]
    fn normalized_rows_serialize_with_nulls() {
        let n = normalizer(market_schema());
        let row = n
            .normalize_row(&raw(&[("Doba", "-"), ("Godzina", "-"), ("Cena", "-"), ("Wolumen", "")]))
            .unwrap();
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"Doba": null, "Godzina": null, "Cena": null, "Wolumen": null})
        );
    }

    #[test]
    fn schema_validation_rejects_inconsistent_declarations() {
        let overlapping = FeedSchema {
            float_columns: vec!["Godzina".into()],
            ..market_schema()
        };
        assert!(matches!(
            overlapping.validate(),
            Err(SchemaError::OverlappingColumn { .. })
        ));

        let bad_companion = FeedSchema {
            hour_offsets: BTreeMap::from([("Doba".to_string(), "Cena".to_string())]),
            ..market_schema()
        };
        assert_eq!(
            bad_companion.validate(),
            Err(SchemaError::OffsetCompanionNotInteger("Cena".into()))
        );

        let bad_tz = FeedSchema {
            timezone: "Mars/Olympus".into(),
            ..market_schema()
        };
        assert!(matches!(bad_tz.validate(), Err(SchemaError::UnknownTimezone { .. })));

        let bad_utc = FeedSchema {
            utc_columns: vec!["Cena".into()],
            ..market_schema()
        };
        assert_eq!(bad_utc.validate(), Err(SchemaError::UtcColumnNotTimestamp("Cena".into())));
    }

    #[test]
    fn empty_payload_yields_no_rows() {
        let report = normalizer(market_schema()).normalize(Vec::new());
        assert!(report.rows.is_empty());
        assert_eq!(report.rows_read, 0);
    }

    #[test]
    fn loads_payload_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"Doba;Godzina\n").unwrap();
        let bytes = load_payload_file(file.path()).unwrap();
        assert_eq!(bytes, b"Doba;Godzina\n");
        assert!(load_payload_file("/definitely/not/here.csv").is_err());
    }
}

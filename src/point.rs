//! The Point data type and its storage-row codec.
//!
//! A Point is one time-series observation: a timestamp, a measurement name,
//! a tag set (string/string metadata) and a field set (typed values). Points
//! are serialized to flat rows of strings for the storage layer and parsed
//! back on read.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Timelike, Utc};

use crate::error::TinyFluxError;

/// Measurement used when a point does not specify one.
pub const DEFAULT_MEASUREMENT: &str = "_default";

/// Tag set: string keys to string values. A BTreeMap keeps serialization
/// deterministic.
pub type TagSet = BTreeMap<String, String>;

/// Field set: string keys to typed values.
pub type FieldSet = BTreeMap<String, FieldValue>;

/// A serialized point: timestamp, measurement, then interleaved prefixed
/// key/value pairs.
pub type Row = Vec<String>;

const TAG_PREFIX: &str = "__tag__";
const FIELD_PREFIX: &str = "__field__";
const COMPACT_TAG_PREFIX: &str = "t_";
const COMPACT_FIELD_PREFIX: &str = "f_";

/// A field value. The numeric kind is preserved exactly: integers stay
/// integers and floats stay floats through a serialize/parse cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl FieldValue {
    /// Compares two field values where an ordering is defined: numeric kinds
    /// compare numerically (cross-kind included), booleans with booleans,
    /// strings lexicographically. Mismatched kinds have no ordering.
    pub fn partial_cmp_value(&self, other: &FieldValue) -> Option<Ordering> {
        use FieldValue::*;
        match (self, other) {
            (Integer(a), Integer(b)) => Some(a.cmp(b)),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Integer(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Str(a), Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    fn serialize(&self) -> String {
        match self {
            FieldValue::Integer(i) => i.to_string(),
            // Debug formatting keeps a decimal point on integral floats, so
            // 0.0 round-trips as a float and never collapses to "0".
            FieldValue::Float(f) => format!("{:?}", f),
            FieldValue::Bool(true) => "True".to_string(),
            FieldValue::Bool(false) => "False".to_string(),
            FieldValue::Str(s) => s.clone(),
        }
    }

    fn parse(raw: &str) -> FieldValue {
        match raw {
            "True" => return FieldValue::Bool(true),
            "False" => return FieldValue::Bool(false),
            _ => {}
        }
        if let Ok(i) = raw.parse::<i64>() {
            return FieldValue::Integer(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            return FieldValue::Float(f);
        }
        FieldValue::Str(raw.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Integer(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

/// A single time-series observation.
///
/// `time` is `None` for an unstamped point; the engine stamps it with the
/// current UTC time on first insert. Timestamps are always held in UTC.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub time: Option<DateTime<Utc>>,
    pub measurement: String,
    pub tags: TagSet,
    pub fields: FieldSet,
}

impl Default for Point {
    fn default() -> Self {
        Point::new()
    }
}

impl Point {
    /// Creates an unstamped point with the default measurement and empty
    /// tag and field sets.
    pub fn new() -> Self {
        Point {
            time: None,
            measurement: DEFAULT_MEASUREMENT.to_string(),
            tags: TagSet::new(),
            fields: FieldSet::new(),
        }
    }

    /// Sets the timestamp, normalizing to UTC.
    pub fn with_time<Tz: TimeZone>(mut self, time: DateTime<Tz>) -> Self {
        self.time = Some(time.with_timezone(&Utc));
        self
    }

    /// Sets the timestamp from a naive datetime, interpreted as local time
    /// and converted to UTC.
    pub fn with_naive_time(mut self, time: NaiveDateTime) -> Self {
        let local = Local
            .from_local_datetime(&time)
            .earliest()
            .unwrap_or_else(|| Local.from_utc_datetime(&time));
        self.time = Some(local.with_timezone(&Utc));
        self
    }

    pub fn with_measurement(mut self, name: impl Into<String>) -> Self {
        self.measurement = name.into();
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Serializes this point to a storage row.
    ///
    /// `compact_keys` selects the short `t_`/`f_` key prefixes instead of the
    /// full `__tag__`/`__field__` ones. Readers accept either.
    pub fn to_row(&self, compact_keys: bool) -> Row {
        let (tag_prefix, field_prefix) = if compact_keys {
            (COMPACT_TAG_PREFIX, COMPACT_FIELD_PREFIX)
        } else {
            (TAG_PREFIX, FIELD_PREFIX)
        };

        let mut row = Vec::with_capacity(2 + 2 * (self.tags.len() + self.fields.len()));
        row.push(self.time.map(format_timestamp).unwrap_or_default());
        row.push(self.measurement.clone());

        for (key, value) in &self.tags {
            row.push(format!("{}{}", tag_prefix, key));
            row.push(value.clone());
        }
        for (key, value) in &self.fields {
            row.push(format!("{}{}", field_prefix, key));
            row.push(value.serialize());
        }

        row
    }

    /// Parses a storage row back into a point. `row_id` is used only for
    /// error reporting.
    pub fn from_row(row_id: usize, row: &[String]) -> Result<Point, TinyFluxError> {
        if row.len() < 2 {
            return Err(TinyFluxError::MalformedRow {
                row: row_id,
                reason: format!("expected at least 2 columns, got {}", row.len()),
            });
        }

        let time = if row[0].is_empty() {
            None
        } else {
            Some(
                parse_timestamp(&row[0]).ok_or_else(|| TinyFluxError::MalformedRow {
                    row: row_id,
                    reason: format!("unparseable timestamp {:?}", row[0]),
                })?,
            )
        };

        let mut point = Point {
            time,
            measurement: row[1].clone(),
            tags: TagSet::new(),
            fields: FieldSet::new(),
        };

        let mut i = 2;
        while i + 1 < row.len() {
            let key = &row[i];
            let value = &row[i + 1];
            if let Some(tag_key) = strip_tag_prefix(key) {
                point.tags.insert(tag_key.to_string(), value.clone());
            } else if let Some(field_key) = strip_field_prefix(key) {
                point
                    .fields
                    .insert(field_key.to_string(), FieldValue::parse(value));
            } else {
                return Err(TinyFluxError::MalformedRow {
                    row: row_id,
                    reason: format!("column {:?} carries no tag or field prefix", key),
                });
            }
            i += 2;
        }

        if i != row.len() {
            return Err(TinyFluxError::MalformedRow {
                row: row_id,
                reason: "dangling key column without a value".to_string(),
            });
        }

        Ok(point)
    }
}

fn strip_tag_prefix(key: &str) -> Option<&str> {
    key.strip_prefix(TAG_PREFIX)
        .or_else(|| key.strip_prefix(COMPACT_TAG_PREFIX))
}

fn strip_field_prefix(key: &str) -> Option<&str> {
    key.strip_prefix(FIELD_PREFIX)
        .or_else(|| key.strip_prefix(COMPACT_FIELD_PREFIX))
}

/// Canonical timestamp form: RFC 3339 UTC with microsecond precision.
pub(crate) fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Accepts the canonical form, any RFC 3339 offset form, and naive ISO
/// strings (treated as UTC, matching rows written by older tooling).
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Current UTC time truncated to microseconds, the precision rows carry.
/// Engine-stamped points therefore survive a serialize/parse cycle exactly.
pub(crate) fn utc_now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    now.with_nanosecond(now.nanosecond() / 1_000 * 1_000)
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 8, 28, 7, 0, 0).unwrap()
    }

    #[test]
    fn new_point_is_unstamped_with_defaults() {
        let p = Point::new();
        assert_eq!(p.time, None);
        assert_eq!(p.measurement, DEFAULT_MEASUREMENT);
        assert!(p.tags.is_empty());
        assert!(p.fields.is_empty());
    }

    #[test]
    fn with_time_normalizes_to_utc() {
        let la = chrono::FixedOffset::west_opt(7 * 3600).unwrap();
        let p = Point::new().with_time(la.with_ymd_and_hms(2020, 8, 28, 0, 0, 0).unwrap());
        assert_eq!(p.time, Some(sample_time()));
    }

    #[test]
    fn round_trip_full_prefixes() {
        let p = Point::new()
            .with_time(sample_time())
            .with_measurement("air quality")
            .with_tag("city", "LA")
            .with_field("aqi", 112);
        let row = p.to_row(false);
        assert_eq!(row[0], "2020-08-28T07:00:00.000000Z");
        assert_eq!(row[2], "__tag__city");
        assert_eq!(Point::from_row(0, &row).unwrap(), p);
    }

    #[test]
    fn round_trip_compact_prefixes() {
        let p = Point::new()
            .with_time(sample_time())
            .with_tag("room", "bedroom")
            .with_field("temp", 21.5)
            .with_field("on", true)
            .with_field("note", "ok");
        let row = p.to_row(true);
        assert_eq!(row[2], "t_room");
        assert_eq!(Point::from_row(0, &row).unwrap(), p);
    }

    #[test]
    fn empty_tag_value_round_trips() {
        let p = Point::new().with_time(sample_time()).with_tag("empty", "");
        let row = p.to_row(false);
        assert_eq!(row[3], "");
        assert_eq!(Point::from_row(0, &row).unwrap(), p);
    }

    #[test]
    fn zero_float_keeps_its_kind() {
        let p = Point::new().with_time(sample_time()).with_field("zero", 0.0);
        let row = p.to_row(false);
        assert_eq!(row[3], "0.0");
        let parsed = Point::from_row(0, &row).unwrap();
        assert_eq!(parsed.fields["zero"], FieldValue::Float(0.0));
    }

    #[test]
    fn integer_and_float_kinds_are_distinct() {
        assert_eq!(FieldValue::parse("112"), FieldValue::Integer(112));
        assert_eq!(FieldValue::parse("112.0"), FieldValue::Float(112.0));
        assert_eq!(FieldValue::parse("-3"), FieldValue::Integer(-3));
        assert_eq!(FieldValue::parse("hello"), FieldValue::Str("hello".to_string()));
    }

    #[test]
    fn unstamped_point_serializes_empty_timestamp() {
        let p = Point::new().with_field("x", 1);
        let row = p.to_row(false);
        assert_eq!(row[0], "");
        assert_eq!(Point::from_row(0, &row).unwrap().time, None);
    }

    #[test]
    fn reader_accepts_offset_and_naive_timestamps() {
        let offset = parse_timestamp("2020-08-28T00:00:00.000000-07:00").unwrap();
        assert_eq!(offset, sample_time());
        let naive = parse_timestamp("2020-08-28T07:00:00.000000").unwrap();
        assert_eq!(naive, sample_time());
    }

    #[test]
    fn cross_kind_numeric_comparison() {
        let a = FieldValue::Integer(112);
        let b = FieldValue::Float(112.0);
        assert_eq!(a.partial_cmp_value(&b), Some(Ordering::Equal));
        assert_eq!(
            FieldValue::Str("x".into()).partial_cmp_value(&FieldValue::Integer(1)),
            None
        );
    }

    #[test]
    fn malformed_rows_are_rejected() {
        let bare = vec!["2020-08-28T07:00:00.000000Z".to_string()];
        assert!(Point::from_row(3, &bare).is_err());

        let bad_key = vec![
            String::new(),
            "m".to_string(),
            "noprefix".to_string(),
            "v".to_string(),
        ];
        assert!(matches!(
            Point::from_row(7, &bad_key),
            Err(TinyFluxError::MalformedRow { row: 7, .. })
        ));
    }
}

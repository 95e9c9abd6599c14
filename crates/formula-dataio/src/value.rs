//! Cell values, serial dates and the row abstraction shared by the parser and writer.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::error::DataIoError;
use crate::mapping::CellKind;

const MILLIS_PER_DAY: i64 = 86_400_000;

/// Largest OLE automation date (`9999-12-31`, exclusive upper bound).
const MAX_OA_DATE: f64 = 2_958_466.0;
/// Smallest OLE automation date (`0100-01-01`, exclusive lower bound).
const MIN_OA_DATE: f64 = -657_435.0;

/// Text format used for dates read out of a sheet.
pub const DATE_TEXT_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

fn oa_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1899, 12, 30)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Convert a timestamp into its OLE automation serial (days since 1899-12-30).
///
/// Negative serials keep the time of day as a positive fraction, matching how spreadsheet
/// applications encode pre-epoch date-times.
pub fn to_oa_date(value: NaiveDateTime) -> f64 {
    let mut millis = (value - oa_epoch()).num_milliseconds();
    if millis < 0 {
        let frac = millis % MILLIS_PER_DAY;
        if frac != 0 {
            millis -= (MILLIS_PER_DAY + frac) * 2;
        }
    }
    millis as f64 / MILLIS_PER_DAY as f64
}

/// Convert an OLE automation serial back into a timestamp, rounded to the millisecond.
pub fn from_oa_date(serial: f64) -> Option<NaiveDateTime> {
    if !serial.is_finite() || serial <= MIN_OA_DATE || serial >= MAX_OA_DATE {
        return None;
    }
    let half = if serial >= 0.0 { 0.5 } else { -0.5 };
    let mut millis = (serial * MILLIS_PER_DAY as f64 + half) as i64;
    if millis < 0 {
        millis -= (millis % MILLIS_PER_DAY) * 2;
    }
    oa_epoch().checked_add_signed(Duration::milliseconds(millis))
}

/// Render a timestamp the way parsed date cells are reported.
pub fn format_date(value: NaiveDateTime) -> String {
    value.format(DATE_TEXT_FORMAT).to_string()
}

/// Format a float the shortest way that round-trips (`45000.5`, `3`, `-0.25`).
pub(crate) fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// A value produced by a row for one column.
///
/// This is a closed set: the writer infers a [`CellKind`] from the variant instead of from a
/// runtime type.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CellValue {
    #[default]
    Empty,
    Integer(i64),
    Float(f64),
    Date(NaiveDateTime),
    Text(String),
    Bool(bool),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    /// The formatting kind implied by the value alone.
    pub fn inferred_kind(&self) -> CellKind {
        match self {
            CellValue::Integer(_) => CellKind::Number,
            CellValue::Float(_) => CellKind::Decimal,
            CellValue::Date(_) => CellKind::Date,
            CellValue::Empty | CellValue::Text(_) | CellValue::Bool(_) => CellKind::General,
        }
    }

    /// Text as written into a cell. Booleans use `True`/`False`.
    pub fn to_text(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Integer(v) => v.to_string(),
            CellValue::Float(v) => format_number(*v),
            CellValue::Date(v) => format_date(*v),
            CellValue::Text(s) => s.clone(),
            CellValue::Bool(true) => "True".to_string(),
            CellValue::Bool(false) => "False".to_string(),
        }
    }

    /// Interpret the value as a timestamp (dates pass through, text is parsed).
    pub fn as_date(&self) -> Option<NaiveDateTime> {
        match self {
            CellValue::Date(v) => Some(*v),
            CellValue::Text(s) => parse_date(s),
            _ => None,
        }
    }
}

/// Parse common date/time spellings: ISO-8601 and US `m/d/Y`, with or without a time.
pub fn parse_date(text: &str) -> Option<NaiveDateTime> {
    const DATE_TIME_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
        "%m/%d/%Y %H:%M:%S",
        "%m/%d/%Y %I:%M:%S %p",
        "%m/%d/%Y %H:%M",
        "%m/%d/%Y %I:%M %p",
    ];
    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d", "%d-%b-%Y", "%B %d, %Y"];

    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    for fmt in DATE_TIME_FORMATS {
        if let Ok(v) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(v);
        }
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        CellValue::Integer(v)
    }
}

impl From<i32> for CellValue {
    fn from(v: i32) -> Self {
        CellValue::Integer(i64::from(v))
    }
}

impl From<u32> for CellValue {
    fn from(v: u32) -> Self {
        CellValue::Integer(i64::from(v))
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        CellValue::Float(v)
    }
}

impl From<bool> for CellValue {
    fn from(v: bool) -> Self {
        CellValue::Bool(v)
    }
}

impl From<NaiveDateTime> for CellValue {
    fn from(v: NaiveDateTime) -> Self {
        CellValue::Date(v)
    }
}

impl From<NaiveDate> for CellValue {
    fn from(v: NaiveDate) -> Self {
        v.and_hms_opt(0, 0, 0)
            .map(CellValue::Date)
            .unwrap_or(CellValue::Empty)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        CellValue::Text(v.to_string())
    }
}

impl From<String> for CellValue {
    fn from(v: String) -> Self {
        CellValue::Text(v)
    }
}

impl<T: Into<CellValue>> From<Option<T>> for CellValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(CellValue::Empty)
    }
}

impl From<&serde_json::Value> for CellValue {
    fn from(v: &serde_json::Value) -> Self {
        use serde_json::Value;
        match v {
            Value::Null => CellValue::Empty,
            Value::Bool(b) => CellValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => CellValue::Integer(i),
                None => n.as_f64().map(CellValue::Float).unwrap_or(CellValue::Empty),
            },
            Value::String(s) => CellValue::Text(s.clone()),
            other => CellValue::Text(other.to_string()),
        }
    }
}

/// A row handed to the writer: a shape (field names) plus lookup by name.
///
/// Lookups are case-insensitive.
pub trait RowSource {
    /// Field names in declaration order; used to generate headers.
    fn field_names(&self) -> Vec<String>;

    fn get(&self, name: &str) -> Option<CellValue>;
}

impl<T: RowSource + ?Sized> RowSource for &T {
    fn field_names(&self) -> Vec<String> {
        (**self).field_names()
    }

    fn get(&self, name: &str) -> Option<CellValue> {
        (**self).get(name)
    }
}

impl RowSource for serde_json::Map<String, serde_json::Value> {
    fn field_names(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }

    fn get(&self, name: &str) -> Option<CellValue> {
        self.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| CellValue::from(value))
    }
}

/// An ordered list of named values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, CellValue)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<CellValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Replace the value of an existing field (case-insensitive) or append a new one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<CellValue>) {
        let name = name.into();
        let value = value.into();
        match self
            .fields
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(&name))
        {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn fields(&self) -> &[(String, CellValue)] {
        &self.fields
    }

    /// Build a record from any serializable struct or map, keeping field declaration order.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, DataIoError> {
        match serde_json::to_value(value)? {
            serde_json::Value::Object(map) => Ok(map
                .iter()
                .fold(Record::new(), |rec, (k, v)| rec.with(k.clone(), CellValue::from(v)))),
            other => Err(DataIoError::Invalid(format!(
                "expected a struct or map to build a record, found {other}"
            ))),
        }
    }
}

impl RowSource for Record {
    fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|(name, _)| name.clone()).collect()
    }

    fn get(&self, name: &str) -> Option<CellValue> {
        self.fields
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }
}

impl<K: Into<String>, V: Into<CellValue>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Record::new(), |rec, (k, v)| rec.with(k, v))
    }
}

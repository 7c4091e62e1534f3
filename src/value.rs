// ABOUTME: Scalar values and ordered records flowing from extraction to load
// ABOUTME: Provides text rendering for binding and watermark encoding of cursor values

use base64::Engine;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};

/// A nullable scalar extracted from the source.
///
/// Rows are untyped at extraction: the variant reflects what the driver
/// returned, not the declared column type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    DateTimeTz(DateTime<FixedOffset>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Render the value as text for binding to the destination.
    ///
    /// The destination casts the text to the column's declared type, so the
    /// rendering must be something the warehouse parses for that type.
    /// Returns `None` for null.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(n) => Some(n.to_string()),
            Value::UInt(n) => Some(n.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::String(s) => Some(s.clone()),
            Value::Bytes(b) => Some(match std::str::from_utf8(b) {
                Ok(s) => s.to_string(),
                Err(_) => base64::engine::general_purpose::STANDARD.encode(b),
            }),
            Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Value::Time(t) => Some(t.format("%H:%M:%S%.f").to_string()),
            Value::DateTime(dt) => Some(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Value::DateTimeTz(dt) => Some(dt.to_rfc3339()),
        }
    }

    /// Encode the value as a watermark string comparable by the source.
    ///
    /// Naive date-times use the `YYYY-MM-DD HH:MM:SS[.ffffff]` form the source
    /// accepts in comparisons. Returns `None` for null, which cannot bound a page.
    pub fn to_watermark(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::DateTime(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            other => other.to_text(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(dt: NaiveDateTime) -> Self {
        Value::DateTime(dt)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// An ordered mapping from column name to value.
///
/// Order is insertion order; after column alignment it is the canonical
/// column order of the run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Builder-style insert, mostly for tests and fixtures.
    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.insert(column, value.into());
        self
    }

    /// Set a column, replacing an existing value in place.
    pub fn insert(&mut self, column: &str, value: Value) {
        if let Some(slot) = self.fields.iter_mut().find(|(name, _)| name == column) {
            slot.1 = value;
        } else {
            self.fields.push((column.to_string(), value));
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, v)| (name.as_str(), v))
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.fields.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Apply `f` to every value, keeping column order.
    pub fn map_values(self, mut f: impl FnMut(Value) -> Value) -> Self {
        Self {
            fields: self
                .fields
                .into_iter()
                .map(|(name, v)| (name, f(v)))
                .collect(),
        }
    }

    /// Remove and return a column's value.
    pub fn take(&mut self, column: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(name, _)| name == column)?;
        Some(self.fields.remove(idx).1)
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (name, value) in iter {
            record.insert(&name, value);
        }
        record
    }
}

// ABOUTME: Canonical destination types and the source-type lookup that produces them
// ABOUTME: Also defines column descriptors shared by the extractor, reconciler, and loader

pub mod reconciler;

pub use reconciler::{SchemaDiff, SchemaReconciler, TypeMismatch};

use std::fmt;

/// The fixed set of destination-side column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalType {
    Integer,
    Float,
    Decimal,
    String,
    Timestamp,
    Date,
    Time,
}

impl CanonicalType {
    /// Name used when comparing against the destination's reported schema.
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalType::Integer => "INT64",
            CanonicalType::Float => "FLOAT64",
            CanonicalType::Decimal => "NUMERIC",
            CanonicalType::String => "STRING",
            CanonicalType::Timestamp => "TIMESTAMP",
            CanonicalType::Date => "DATE",
            CanonicalType::Time => "TIME",
        }
    }

    /// Parse a canonical name as produced by [`CanonicalType::as_str`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "INT64" => Some(CanonicalType::Integer),
            "FLOAT64" => Some(CanonicalType::Float),
            "NUMERIC" => Some(CanonicalType::Decimal),
            "STRING" => Some(CanonicalType::String),
            "TIMESTAMP" => Some(CanonicalType::Timestamp),
            "DATE" => Some(CanonicalType::Date),
            "TIME" => Some(CanonicalType::Time),
            _ => None,
        }
    }
}

impl fmt::Display for CanonicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a declared source column type to its canonical destination type.
///
/// Lowercases the declaration, strips everything from the first `(` and any
/// trailing modifiers (`unsigned`, `zerofill`), then looks up the base name.
/// Unknown types fall back to [`CanonicalType::String`]; this never fails.
///
/// # Examples
///
/// ```
/// # use warehouse_replicator::schema::{canonical_type, CanonicalType};
/// assert_eq!(canonical_type("bigint(20) unsigned"), CanonicalType::Integer);
/// assert_eq!(canonical_type("DECIMAL(10,2)"), CanonicalType::Decimal);
/// assert_eq!(canonical_type("geometry"), CanonicalType::String);
/// ```
pub fn canonical_type(source_type: &str) -> CanonicalType {
    let lowered = source_type.trim().to_ascii_lowercase();
    let base = lowered
        .split('(')
        .next()
        .unwrap_or_default()
        .split_whitespace()
        .next()
        .unwrap_or_default();

    match base {
        "int" | "integer" | "bigint" | "smallint" | "tinyint" | "mediumint" => {
            CanonicalType::Integer
        }
        "float" | "double" => CanonicalType::Float,
        "decimal" => CanonicalType::Decimal,
        "varchar" | "char" | "text" | "longtext" | "mediumtext" | "tinytext" | "json"
        | "enum" => CanonicalType::String,
        "datetime" | "timestamp" => CanonicalType::Timestamp,
        "date" => CanonicalType::Date,
        "time" => CanonicalType::Time,
        _ => CanonicalType::String,
    }
}

/// A source column as produced by schema discovery.
///
/// The order of descriptors returned by discovery is the canonical column
/// order for the rest of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub source_type: String,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, source_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_type: source_type.into(),
        }
    }

    pub fn canonical_type(&self) -> CanonicalType {
        canonical_type(&self.source_type)
    }
}

/// A column of the live destination table.
///
/// `data_type` is the warehouse's type translated to a canonical name where
/// one exists, otherwise the native type verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestColumn {
    pub name: String,
    pub data_type: String,
}

impl DestColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Destination table name plus the typed columns it is expected to carry.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<(String, CanonicalType)>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, columns: Vec<(String, CanonicalType)>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Build a spec from discovered source columns, in discovery order.
    pub fn from_descriptors(name: impl Into<String>, columns: &[ColumnDescriptor]) -> Self {
        Self::new(
            name,
            columns
                .iter()
                .map(|c| (c.name.clone(), c.canonical_type()))
                .collect(),
        )
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|(name, _)| name.clone()).collect()
    }
}

//! Typed record model for the reading and state-change streams.
//!
//! Rows arrive from the store as loosely-typed text cells. They are validated
//! against a fixed [`RecordSchema`] per stream kind at the fetch boundary, so
//! everything downstream works with typed, explicitly optional fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// A single typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Borrow the value as a string slice if it is textual.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as a bool if it is boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

/// Declared type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Int,
    Float,
    Bool,
}

impl ValueKind {
    /// Parse a raw text cell into a typed value.
    pub fn parse(self, field: &str, raw: &str) -> Result<Value, SchemaError> {
        let invalid = || SchemaError::InvalidValue {
            field: field.to_string(),
            kind: self,
            raw: raw.to_string(),
        };

        match self {
            ValueKind::Str => Ok(Value::Str(raw.to_string())),
            ValueKind::Int => raw.trim().parse().map(Value::Int).map_err(|_| invalid()),
            ValueKind::Float => raw.trim().parse().map(Value::Float).map_err(|_| invalid()),
            ValueKind::Bool => match raw.trim() {
                "true" | "True" | "TRUE" => Ok(Value::Bool(true)),
                "false" | "False" | "FALSE" => Ok(Value::Bool(false)),
                _ => Err(invalid()),
            },
        }
    }
}

/// Named field values with a deterministic column order.
pub type Fields = BTreeMap<String, Value>;

/// Which stream a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Readings,
    StateChanges,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Readings => f.write_str("readings"),
            StreamKind::StateChanges => f.write_str("state changes"),
        }
    }
}

/// One timestamped row from the high-frequency production stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    /// Fields declared by the reading schema
    pub fields: Fields,
    /// Undeclared fields carried through untouched
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: Fields,
}

impl Reading {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            fields: Fields::new(),
            extra: Fields::new(),
        }
    }

    /// Builder-style helper to set a declared field.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// A transition to a new batch/product regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub timestamp: DateTime<Utc>,
    pub attributes: Fields,
}

impl StateChange {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            attributes: Fields::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }
}

/// A reading plus the attributes of the regime active at its timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedReading {
    pub reading: Reading,
    pub attributes: Fields,
}

impl AnnotatedReading {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.reading.timestamp
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

/// Attribute name identifying the active batch.
pub const BATCH_ID: &str = "batch_id";

/// Value carried by readings that precede every recorded state change.
pub const UNSET: &str = "unset";

/// The sentinel attribute set for readings with no preceding state change.
pub fn unset_attributes() -> Fields {
    let mut attrs = Fields::new();
    attrs.insert(BATCH_ID.to_string(), Value::Str(UNSET.to_string()));
    attrs
}

/// Returns the index of the first timestamp that is smaller than its
/// predecessor, or `None` when the sequence is non-decreasing.
pub fn first_unsorted<I>(timestamps: I) -> Option<usize>
where
    I: IntoIterator<Item = DateTime<Utc>>,
{
    let mut prev: Option<DateTime<Utc>> = None;
    for (idx, ts) in timestamps.into_iter().enumerate() {
        if prev.is_some_and(|p| ts < p) {
            return Some(idx);
        }
        prev = Some(ts);
    }
    None
}

/// Declared field of a stream schema.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: ValueKind,
    pub required: bool,
}

/// How undeclared fields are treated during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownFields {
    Reject,
    PassThrough,
}

/// Fixed field set for one stream kind.
#[derive(Debug, Clone, Copy)]
pub struct RecordSchema {
    pub kind: StreamKind,
    pub fields: &'static [FieldSpec],
    pub unknown: UnknownFields,
}

/// Validation failures at the fetch boundary.
#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("missing required field '{0}'")]
    MissingField(String),
    #[error("field '{field}' is not a valid {kind:?}: '{raw}'")]
    InvalidValue {
        field: String,
        kind: ValueKind,
        raw: String,
    },
    #[error("unknown field '{0}'")]
    UnknownField(String),
}

/// Schema of the production reading stream.
pub const READING_SCHEMA: RecordSchema = RecordSchema {
    kind: StreamKind::Readings,
    fields: &[
        FieldSpec {
            name: "machine_name",
            kind: ValueKind::Str,
            required: true,
        },
        FieldSpec {
            name: "status",
            kind: ValueKind::Str,
            required: false,
        },
        FieldSpec {
            name: "running",
            kind: ValueKind::Bool,
            required: false,
        },
        FieldSpec {
            name: "count",
            kind: ValueKind::Int,
            required: false,
        },
    ],
    unknown: UnknownFields::PassThrough,
};

/// Schema of the batch changeover stream.
pub const STATE_CHANGE_SCHEMA: RecordSchema = RecordSchema {
    kind: StreamKind::StateChanges,
    fields: &[
        FieldSpec {
            name: BATCH_ID,
            kind: ValueKind::Str,
            required: true,
        },
        FieldSpec {
            name: "product_id",
            kind: ValueKind::Str,
            required: false,
        },
        FieldSpec {
            name: "expiry",
            kind: ValueKind::Str,
            required: false,
        },
    ],
    unknown: UnknownFields::Reject,
};

impl RecordSchema {
    fn spec(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Validate raw text cells, splitting them into declared and extra fields.
    ///
    /// Empty cells are treated as absent.
    pub fn validate<'a, I>(&self, raw: I) -> Result<(Fields, Fields), SchemaError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut declared = Fields::new();
        let mut extra = Fields::new();

        for (name, cell) in raw {
            if cell.is_empty() {
                continue;
            }
            match self.spec(name) {
                Some(spec) => {
                    declared.insert(name.to_string(), spec.kind.parse(name, cell)?);
                }
                None => match self.unknown {
                    UnknownFields::Reject => {
                        return Err(SchemaError::UnknownField(name.to_string()))
                    }
                    UnknownFields::PassThrough => {
                        extra.insert(name.to_string(), Value::Str(cell.to_string()));
                    }
                },
            }
        }

        if let Some(missing) = self
            .fields
            .iter()
            .find(|f| f.required && !declared.contains_key(f.name))
        {
            return Err(SchemaError::MissingField(missing.name.to_string()));
        }

        Ok((declared, extra))
    }

    /// Validate a raw row into a [`Reading`].
    pub fn reading<'a, I>(&self, timestamp: DateTime<Utc>, raw: I) -> Result<Reading, SchemaError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let (fields, extra) = self.validate(raw)?;
        Ok(Reading {
            timestamp,
            fields,
            extra,
        })
    }

    /// Validate a raw row into a [`StateChange`]. Extra fields are dropped.
    pub fn state_change<'a, I>(
        &self,
        timestamp: DateTime<Utc>,
        raw: I,
    ) -> Result<StateChange, SchemaError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let (attributes, _) = self.validate(raw)?;
        Ok(StateChange {
            timestamp,
            attributes,
        })
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Structured points and their line-protocol rendering.
//!
//! A [`Point`] is turned into a single protocol line before it enters the write buffer:
//!
//! ```text
//! measurement[,tag=value...] field=value[,field=value...] [timestamp]
//! ```
//!
//! Tags and fields are emitted sorted by key. Default tags configured on the pipeline are
//! merged into the tag set, with tags set on the point taking precedence.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::precision::WritePrecision;
use crate::tags::DefaultTags;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    UInteger(u64),
    Boolean(bool),
    String(String),
}

/// When a point is stamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PointTime {
    /// Current time in the write precision, taken at serialization.
    #[default]
    Now,
    /// Explicit timestamp, already in the write precision.
    At(i64),
    /// No timestamp, the server assigns one.
    Omitted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    time: PointTime,
}

impl Point {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            time: PointTime::default(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn float_field(mut self, key: impl Into<String>, value: f64) -> Self {
        self.fields.insert(key.into(), FieldValue::Float(value));
        self
    }

    pub fn integer_field(mut self, key: impl Into<String>, value: i64) -> Self {
        self.fields.insert(key.into(), FieldValue::Integer(value));
        self
    }

    pub fn unsigned_field(mut self, key: impl Into<String>, value: u64) -> Self {
        self.fields.insert(key.into(), FieldValue::UInteger(value));
        self
    }

    pub fn boolean_field(mut self, key: impl Into<String>, value: bool) -> Self {
        self.fields.insert(key.into(), FieldValue::Boolean(value));
        self
    }

    pub fn string_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), FieldValue::String(value.into()));
        self
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.time = PointTime::At(timestamp);
        self
    }

    pub fn without_timestamp(mut self) -> Self {
        self.time = PointTime::Omitted;
        self
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Renders the point as one protocol line.
    ///
    /// Returns `None` when the point has no writable field: line protocol requires at
    /// least one, and non-finite floats cannot be represented.
    pub fn to_line(&self, precision: WritePrecision, default_tags: &DefaultTags) -> Option<String> {
        let mut fields = String::new();
        for (key, value) in &self.fields {
            if key.is_empty() {
                continue;
            }
            let start = fields.len();
            if !fields.is_empty() {
                fields.push(',');
            }
            fields.push_str(&escape_key(key));
            fields.push('=');
            let rendered = match value {
                FieldValue::Float(v) if v.is_finite() => write!(fields, "{v}"),
                FieldValue::Float(_) => {
                    fields.truncate(start);
                    continue;
                }
                FieldValue::Integer(v) => write!(fields, "{v}i"),
                FieldValue::UInteger(v) => write!(fields, "{v}u"),
                FieldValue::Boolean(v) => write!(fields, "{v}"),
                FieldValue::String(v) => write!(fields, "\"{}\"", escape_string_field(v)),
            };
            if rendered.is_err() {
                fields.truncate(start);
            }
        }
        if fields.is_empty() {
            return None;
        }

        let mut line = escape_measurement(&self.measurement);
        let mut tags: BTreeMap<&str, &str> = default_tags
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        for (k, v) in &self.tags {
            tags.insert(k.as_str(), v.as_str());
        }
        for (key, value) in tags {
            if key.is_empty() || value.is_empty() {
                continue;
            }
            line.push(',');
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&escape_key(value));
        }
        line.push(' ');
        line.push_str(&fields);

        match self.time {
            PointTime::Now => {
                let _ = write!(line, " {}", precision.now());
            }
            PointTime::At(ts) => {
                let _ = write!(line, " {ts}");
            }
            PointTime::Omitted => {}
        }
        Some(line)
    }
}

/// Escapes a measurement name: commas and spaces.
pub(crate) fn escape_measurement(value: &str) -> String {
    escape(value, &[',', ' '])
}

/// Escapes a tag key, tag value or field key: commas, equal signs and spaces.
pub(crate) fn escape_key(value: &str) -> String {
    escape(value, &[',', '=', ' '])
}

fn escape_string_field(value: &str) -> String {
    escape(value, &['"', '\\'])
}

fn escape(value: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c if special.contains(&c) => {
                escaped.push('\\');
                escaped.push(c);
            }
            c => escaped.push(c),
        }
    }
    escaped
}

//! Typed access to the group/item/property value bags exposed over the wire.
//!
//! Every manager exposes its state as string-keyed properties carried as
//! MessagePack values. The helpers here do the type checking shared by all
//! of them so a mismatched value fails with `TypeMismatch` instead of being
//! coerced.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use rmpv::Value;
use std::fmt;
use thiserror::Error;

pub const GROUP_NONE: &str = "";
pub const GROUP_APP: &str = "app";
pub const GROUP_GROUP: &str = "grp";
pub const GROUP_GLOBAL: &str = "glo";
pub const GROUP_SCHEDULE: &str = "sch";
pub const GROUP_ALERT: &str = "alr";

/// Wire format for timestamps (`yyyy-MM-dd HH:mm:ss`).
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Bool,
    Int,
    StringList,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::String => "string",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::StringList => "string list",
        };
        f.write_str(name)
    }
}

/// Failure reading or writing a single property.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PropertyError {
    #[error("unknown item '{0}'")]
    UnknownItem(String),
    #[error("unknown property '{0}'")]
    UnknownProperty(String),
    #[error("property '{property}' expects a {expected} value")]
    TypeMismatch { property: String, expected: ValueKind },
    #[error("property '{0}' is read-only")]
    ReadOnly(String),
    #[error("invalid value for '{property}': {reason}")]
    InvalidValue { property: String, reason: String },
}

/// Business-rule failure on a registry operation (add/delete/rename).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("'{0}' already exists")]
    AlreadyExists(String),
    #[error("'{0}' does not exist")]
    NotFound(String),
    #[error("'{0}' is not a valid name")]
    InvalidName(String),
}

/// Rejects empty names and names containing the `;` list separator.
pub fn validate_name(name: &str) -> Result<(), ManagerError> {
    if name.trim().is_empty() || name.contains(';') {
        return Err(ManagerError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn mismatch(property: &str, expected: ValueKind) -> PropertyError {
    PropertyError::TypeMismatch {
        property: property.to_string(),
        expected,
    }
}

pub fn expect_string(property: &str, value: &Value) -> Result<String, PropertyError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| mismatch(property, ValueKind::String))
}

pub fn expect_bool(property: &str, value: &Value) -> Result<bool, PropertyError> {
    value.as_bool().ok_or_else(|| mismatch(property, ValueKind::Bool))
}

pub fn expect_int(property: &str, value: &Value) -> Result<i64, PropertyError> {
    value.as_i64().ok_or_else(|| mismatch(property, ValueKind::Int))
}

pub fn expect_string_list(property: &str, value: &Value) -> Result<Vec<String>, PropertyError> {
    let items = value
        .as_array()
        .ok_or_else(|| mismatch(property, ValueKind::StringList))?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| mismatch(property, ValueKind::StringList))
        })
        .collect()
}

/// Checks `value` against an inclusive range, reporting the bounds on failure.
pub fn expect_in_range(property: &str, value: i64, min: i64, max: i64) -> Result<i64, PropertyError> {
    if value < min || value > max {
        return Err(PropertyError::InvalidValue {
            property: property.to_string(),
            reason: format!("{value} not in {min}..={max}"),
        });
    }
    Ok(value)
}

pub fn string_list<I, S>(items: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Value::Array(items.into_iter().map(|s| Value::from(s.into())).collect())
}

/// Formats an optional timestamp for the wire; unset is the empty string.
pub fn format_datetime(ts: Option<&DateTime<Local>>) -> String {
    ts.map(|t| t.format(DATETIME_FORMAT).to_string())
        .unwrap_or_default()
}

/// Parses a wire timestamp. Empty or unparsable text is unset.
pub fn parse_datetime(text: &str) -> Option<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(text.trim(), DATETIME_FORMAT).ok()?;
    Local.from_local_datetime(&naive).earliest()
}

/// Serde adapter storing an optional timestamp in wire format, so settings
/// files and JSON exports carry the same text the properties report.
pub mod wire_datetime {
    use super::{format_datetime, parse_datetime};
    use chrono::{DateTime, Local};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &Option<DateTime<Local>>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_datetime(ts.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Local>>, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(parse_datetime(&text))
    }
}

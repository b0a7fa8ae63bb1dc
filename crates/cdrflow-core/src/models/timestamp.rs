//! Event timestamp encodings
//!
//! Call events carry their timestamp either as a structured object produced
//! by the traffic source's clock helper or as free text such as
//! `"Jan 08 2015 10:30:00 CEST"`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// The `Event-Timestamp` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventTimestamp {
    /// `{"t": 1419350815635, "Y": 2014, "M": 12, ...}`
    Structured(StructuredTimestamp),
    /// Free text containing a date and usually a zone abbreviation
    Textual(String),
    /// Any other JSON value (numbers, arrays, ...). Never valid.
    Unrecognized(Value),
}

impl EventTimestamp {
    pub fn textual(raw: impl Into<String>) -> Self {
        EventTimestamp::Textual(raw.into())
    }

    pub fn structured(epoch_ms: i64) -> Self {
        EventTimestamp::Structured(StructuredTimestamp {
            epoch_ms: Some(Value::from(epoch_ms)),
            ..Default::default()
        })
    }
}

/// Broken-down timestamp with its epoch value in `t`
///
/// Only `t` is used for normalization; the calendar parts are informational.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredTimestamp {
    /// Milliseconds since the epoch. Kept as a raw value because senders
    /// have been seen to put strings here. `None` only when `t` is absent;
    /// an explicit `null` is `Some(Value::Null)`.
    #[serde(
        rename = "t",
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub epoch_ms: Option<Value>,

    #[serde(rename = "Y", default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i64>,

    #[serde(rename = "M", default, skip_serializing_if = "Option::is_none")]
    pub month: Option<i64>,

    #[serde(rename = "D", default, skip_serializing_if = "Option::is_none")]
    pub day: Option<i64>,

    #[serde(rename = "h", default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<i64>,

    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<i64>,

    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub second: Option<i64>,

    #[serde(rename = "z", default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl StructuredTimestamp {
    /// Textual form of `t`, as the digits check needs it
    pub fn epoch_digits(&self) -> Option<String> {
        match self.epoch_ms.as_ref()? {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }
}

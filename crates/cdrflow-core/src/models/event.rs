//! Call event model
//!
//! A `CallEvent` is the payload of one queue message: the accounting record
//! of a SIP call leg starting (`INVITE`) or stopping (`BYE`). Fields the
//! pipeline does not inspect are preserved in `extra` so persisted documents
//! keep the full original event.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::attempt::Attempt;
use super::timestamp::EventTimestamp;

/// Which end of the call the event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
    /// Any other value. Fails the SIP method check.
    #[serde(other)]
    Unknown,
}

impl Action {
    /// Action named by a wire value; anything unexpected is `Unknown`
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "start" => Action::Start,
            "stop" => Action::Stop,
            _ => Action::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Unknown => "unknown",
        }
    }

    /// The SIP method a well-formed event of this action carries
    pub fn expected_sip_method(&self) -> Option<&'static str> {
        match self {
            Action::Start => Some("INVITE"),
            Action::Stop => Some("BYE"),
            Action::Unknown => None,
        }
    }
}

/// One call accounting event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    #[serde(
        default,
        deserialize_with = "lenient_action",
        skip_serializing_if = "Option::is_none"
    )]
    pub action: Option<Action>,

    #[serde(
        rename = "Acct-Session-Id",
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub session_id: Option<String>,

    #[serde(
        rename = "Event-Timestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<EventTimestamp>,

    /// Canonical ISO-8601 form cached by the timestamp normalizer
    #[serde(
        rename = "Event-Timestamp-ISO",
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp_iso: Option<String>,

    #[serde(
        rename = "Sip-Method",
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub sip_method: Option<String>,

    #[serde(
        rename = "Sip-To-User",
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub to_user: Option<String>,

    #[serde(
        rename = "Sip-From-User",
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub from_user: Option<String>,

    /// Reporting delay in seconds. Senders use both numbers and strings.
    #[serde(
        rename = "Acct-Delay-Time",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub delay: Option<Value>,

    /// Failed attempts, oldest first
    #[serde(rename = "retry", default, skip_serializing_if = "Vec::is_empty")]
    pub retry_history: Vec<Attempt>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CallEvent {
    /// Reporting delay in whole seconds
    ///
    /// Strings are read up to the first non-digit (`"5s"` is 5). Absent,
    /// negative or non-numeric values count as 0.
    pub fn delay_seconds(&self) -> i64 {
        let parsed = match &self.delay {
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
            Some(Value::String(s)) => leading_integer(s),
            _ => None,
        };
        parsed.filter(|d| *d >= 0).unwrap_or(0)
    }

    /// Number of failed attempts recorded so far
    pub fn attempts(&self) -> usize {
        self.retry_history.len()
    }

    /// Session id for log lines
    pub fn session_label(&self) -> &str {
        self.session_id.as_deref().unwrap_or("<none>")
    }
}

/// Read a text field the way loosely typed senders fill it: numbers and
/// booleans become their text, `null` counts as absent, and nested values
/// keep their JSON text so the field checks report them.
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    })
}

/// Any non-text action is kept as `Unknown` and fails the SIP method check
fn lenient_action<'de, D>(deserializer: D) -> Result<Option<Action>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(Action::from_wire(&s)),
        _ => Some(Action::Unknown),
    })
}

fn leading_integer(raw: &str) -> Option<i64> {
    let trimmed = raw.trim_start();
    let (sign, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().ok().map(|v| sign * v)
}

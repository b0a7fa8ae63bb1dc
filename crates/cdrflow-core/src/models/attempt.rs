//! Retry history entries
//!
//! Each failed pass through the pipeline appends one `Attempt` to the event.
//! On the wire an attempt is `{"date", "invalid", "description"}`: when the
//! attempt has a single cause both `invalid` and `description` are scalars,
//! with several causes both are arrays of the same length. A cause that names
//! more than one field (both phone parties missing) writes its `invalid`
//! entry as an array of names.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::failure::Failure;

/// One cause recorded in an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptCause {
    pub fields: Vec<String>,
    pub reason: String,
}

impl From<&Failure> for AttemptCause {
    fn from(failure: &Failure) -> Self {
        Self {
            fields: failure.fields.clone(),
            reason: failure.reason.clone(),
        }
    }
}

/// A failed pass through the pipeline
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawAttempt")]
pub struct Attempt {
    pub timestamp: DateTime<Utc>,
    /// Never empty
    causes: Vec<AttemptCause>,
}

impl Attempt {
    /// Build an attempt from the failures of one pass. Returns `None` when
    /// there is nothing to record.
    pub fn from_failures(failures: &[Failure], timestamp: DateTime<Utc>) -> Option<Self> {
        if failures.is_empty() {
            return None;
        }
        Some(Self {
            timestamp,
            causes: failures.iter().map(AttemptCause::from).collect(),
        })
    }

    pub fn causes(&self) -> &[AttemptCause] {
        &self.causes
    }

    /// `invalid` as written on the wire
    pub fn invalid_fields(&self) -> Value {
        let entries: Vec<Value> = self.causes.iter().map(|c| fields_value(&c.fields)).collect();
        scalar_or_array(entries)
    }

    /// `description` as written on the wire
    pub fn reasons(&self) -> Value {
        let entries: Vec<Value> = self
            .causes
            .iter()
            .map(|c| Value::String(c.reason.clone()))
            .collect();
        scalar_or_array(entries)
    }

    pub fn is_multi_cause(&self) -> bool {
        self.causes.len() > 1
    }
}

fn fields_value(fields: &[String]) -> Value {
    match fields {
        [single] => Value::String(single.clone()),
        many => Value::Array(many.iter().cloned().map(Value::String).collect()),
    }
}

fn scalar_or_array(mut entries: Vec<Value>) -> Value {
    if entries.len() == 1 {
        entries.remove(0)
    } else {
        Value::Array(entries)
    }
}

impl Serialize for Attempt {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Attempt", 3)?;
        state.serialize_field("date", &self.timestamp)?;
        state.serialize_field("invalid", &self.invalid_fields())?;
        state.serialize_field("description", &self.reasons())?;
        state.end()
    }
}

#[derive(Deserialize)]
struct RawAttempt {
    date: DateTime<Utc>,
    #[serde(default)]
    invalid: Value,
    #[serde(default)]
    description: Value,
}

impl TryFrom<RawAttempt> for Attempt {
    type Error = String;

    fn try_from(raw: RawAttempt) -> Result<Self, Self::Error> {
        // `description` decides the shape: an array means one entry per cause.
        let causes = match raw.description {
            Value::Array(reasons) => {
                let invalid = match raw.invalid {
                    Value::Array(items) => items,
                    other => return Err(format!("expected {} invalid entries, got {}", reasons.len(), other)),
                };
                if invalid.len() != reasons.len() {
                    return Err(format!(
                        "attempt has {} invalid entries but {} descriptions",
                        invalid.len(),
                        reasons.len()
                    ));
                }
                invalid
                    .into_iter()
                    .zip(reasons)
                    .map(|(fields, reason)| cause_from_values(fields, reason))
                    .collect::<Result<Vec<_>, _>>()?
            }
            reason => vec![cause_from_values(raw.invalid, reason)?],
        };

        if causes.is_empty() {
            return Err("attempt without causes".to_string());
        }

        Ok(Attempt {
            timestamp: raw.date,
            causes,
        })
    }
}

fn cause_from_values(fields: Value, reason: Value) -> Result<AttemptCause, String> {
    let fields = match fields {
        Value::String(s) => vec![s],
        Value::Array(items) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                other => Err(format!("invalid field name: {}", other)),
            })
            .collect::<Result<Vec<_>, _>>()?,
        Value::Null => Vec::new(),
        other => vec![other.to_string()],
    };
    let reason = match reason {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    };
    Ok(AttemptCause { fields, reason })
}

//! Persisted call documents
//!
//! A validated start event is stored as a `StartRecord`. When the matching
//! stop event arrives the two are merged into the final `CallRecord`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::CallEvent;

/// Stored start of a call, waiting for its stop event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRecord {
    #[serde(rename = "session")]
    pub session_id: String,

    #[serde(rename = "start")]
    pub start_event: CallEvent,

    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
}

impl StartRecord {
    pub fn new(session_id: impl Into<String>, start_event: CallEvent) -> Self {
        Self {
            session_id: session_id.into(),
            start_event,
            created_at: Utc::now(),
        }
    }
}

/// Completed call: start and stop events with the computed duration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    #[serde(rename = "session")]
    pub session_id: String,

    #[serde(rename = "start")]
    pub start_event: CallEvent,

    #[serde(rename = "stop")]
    pub stop_event: CallEvent,

    /// Billable seconds, never negative
    #[serde(rename = "duration")]
    pub duration_seconds: f64,

    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,

    #[serde(rename = "modified")]
    pub modified_at: DateTime<Utc>,
}

impl CallRecord {
    /// Merge a fetched start record with its stop event.
    ///
    /// Returns `None` for a negative duration; such a call must not be stored.
    pub fn merge(start: StartRecord, stop_event: CallEvent, duration_seconds: f64) -> Option<Self> {
        if duration_seconds < 0.0 || duration_seconds.is_nan() {
            return None;
        }
        Some(Self {
            session_id: start.session_id,
            start_event: start.start_event,
            stop_event,
            duration_seconds,
            created_at: start.created_at,
            modified_at: Utc::now(),
        })
    }
}

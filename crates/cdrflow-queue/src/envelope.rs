//! Message envelope
//!
//! Each list entry is a JSON object `{"routing_key": ..., "payload": ...}`
//! where `payload` is the call event.

use cdrflow_core::models::{CallEvent, RoutingKey};
use cdrflow_core::AppResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub routing_key: String,
    pub payload: Value,
}

/// Result of reading one list entry
#[derive(Debug)]
pub enum Decoded {
    Message {
        routing_key: String,
        event: CallEvent,
    },
    /// The entry cannot be processed; `routing_key` is set when at least the
    /// envelope could be read
    Malformed {
        routing_key: Option<String>,
        reason: String,
    },
}

pub fn encode(routing_key: &RoutingKey, event: &CallEvent) -> AppResult<String> {
    let envelope = Envelope {
        routing_key: routing_key.to_string(),
        payload: serde_json::to_value(event)?,
    };
    Ok(serde_json::to_string(&envelope)?)
}

pub fn decode(raw: &str) -> Decoded {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            return Decoded::Malformed {
                routing_key: None,
                reason: format!("unreadable envelope: {}", e),
            }
        }
    };

    if !envelope.payload.is_object() {
        return Decoded::Malformed {
            routing_key: Some(envelope.routing_key),
            reason: "payload is not an object".to_string(),
        };
    }

    match serde_json::from_value::<CallEvent>(envelope.payload) {
        Ok(event) => Decoded::Message {
            routing_key: envelope.routing_key,
            event,
        },
        Err(e) => Decoded::Malformed {
            routing_key: Some(envelope.routing_key),
            reason: format!("unreadable payload: {}", e),
        },
    }
}

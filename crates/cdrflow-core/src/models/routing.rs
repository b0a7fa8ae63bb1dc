//! Routing keys and the queue ladder
//!
//! Every message travels under a routing key of the form
//! `[retry.|rejected.]call.{start|stop}`. The prefix selects the stage of the
//! ladder, the suffix the call leg.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Position on the retry ladder. Ordered: `Primary < Retry < Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStage {
    Primary,
    Retry,
    Rejected,
}

impl QueueStage {
    pub const ALL: [QueueStage; 3] = [QueueStage::Primary, QueueStage::Retry, QueueStage::Rejected];

    /// Stages whose queues are consumed by the pipeline
    pub const LIVE: [QueueStage; 2] = [QueueStage::Primary, QueueStage::Retry];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStage::Primary => "primary",
            QueueStage::Retry => "retry",
            QueueStage::Rejected => "rejected",
        }
    }

    /// Routing key prefix, including the trailing dot
    pub fn key_prefix(&self) -> &'static str {
        match self {
            QueueStage::Primary => "",
            QueueStage::Retry => "retry.",
            QueueStage::Rejected => "rejected.",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStage::Rejected)
    }
}

impl fmt::Display for QueueStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The call leg a routing key addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallLeg {
    Start,
    Stop,
}

impl CallLeg {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallLeg::Start => "start",
            CallLeg::Stop => "stop",
        }
    }
}

/// A parsed routing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    pub stage: QueueStage,
    pub leg: CallLeg,
}

impl RoutingKey {
    pub fn new(stage: QueueStage, leg: CallLeg) -> Self {
        Self { stage, leg }
    }

    pub fn primary(leg: CallLeg) -> Self {
        Self::new(QueueStage::Primary, leg)
    }

    /// Same leg on `stage`, never moving back down the ladder
    pub fn escalate_to(&self, stage: QueueStage) -> Self {
        Self::new(self.stage.max(stage), self.leg)
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}call.{}", self.stage.key_prefix(), self.leg.as_str())
    }
}

impl FromStr for RoutingKey {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stage, rest) = if let Some(rest) = s.strip_prefix("retry.") {
            (QueueStage::Retry, rest)
        } else if let Some(rest) = s.strip_prefix("rejected.") {
            (QueueStage::Rejected, rest)
        } else {
            (QueueStage::Primary, s)
        };

        let leg = match rest {
            "call.start" => CallLeg::Start,
            "call.stop" => CallLeg::Stop,
            _ => return Err(AppError::UnknownRoutingKey(s.to_string())),
        };

        Ok(Self { stage, leg })
    }
}

impl Serialize for RoutingKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoutingKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

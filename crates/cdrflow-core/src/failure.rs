//! Recoverable per-event failures
//!
//! A `Failure` describes why a single call event could not be accepted at
//! some stage of the pipeline. Every kind is recoverable: it is written into
//! the event's retry history and the event moves one rung down the ladder.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MissingField,
    InvalidTimestamp,
    SipMethodMismatch,
    InvalidPhoneFormat,
    IdenticalParties,
    NegativeDuration,
    ExternalStoreError,
    PublishError,
}

impl FailureKind {
    /// Short code written to logs
    pub fn code(&self) -> &'static str {
        match self {
            FailureKind::MissingField => "MISPROP",
            FailureKind::InvalidTimestamp => "ITMSMP",
            FailureKind::SipMethodMismatch => "ISPMTD",
            FailureKind::InvalidPhoneFormat | FailureKind::IdenticalParties => "IPHN",
            FailureKind::NegativeDuration => "IDUR",
            FailureKind::ExternalStoreError => "EXTERR",
            FailureKind::PublishError => "MSNPUB",
        }
    }
}

/// One reason an event was not accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    /// Names of the offending fields. Usually one; `MissingField` may list several.
    pub fields: Vec<String>,
    pub reason: String,
}

impl Failure {
    pub fn new(kind: FailureKind, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            fields: vec![field.into()],
            reason: reason.into(),
        }
    }

    /// A missing-property failure naming every absent field at once
    pub fn missing<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: FailureKind::MissingField,
            fields: fields.into_iter().map(Into::into).collect(),
            reason: "property missing".to_string(),
        }
    }

    pub fn invalid_timestamp(reason: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidTimestamp, "timestamp", reason)
    }

    pub fn negative_duration(duration_secs: f64) -> Self {
        Self::new(
            FailureKind::NegativeDuration,
            "duration",
            format!("duration is negative: {}s", duration_secs),
        )
    }

    /// A store failure attributed to a specific field (e.g. the session id
    /// that could not be found)
    pub fn store(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(FailureKind::ExternalStoreError, field, reason)
    }

    /// Wrap an infrastructure error raised by the document store
    pub fn external_store(err: &AppError) -> Self {
        Self::store("service", err.to_string())
    }

    /// Wrap an infrastructure error raised while publishing
    pub fn publish(err: &AppError) -> Self {
        Self::new(FailureKind::PublishError, "publish", err.to_string())
    }

    /// The primary field name, for log lines
    pub fn field_label(&self) -> String {
        self.fields.join(", ")
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]: {}",
            self.kind.code(),
            self.field_label(),
            self.reason
        )
    }
}

//! Event validator
//!
//! Stateless checks over the fields of a single call event. All checks run
//! on every event and every failure is reported, so one retry attempt can
//! record several causes at once.

use cdrflow_core::models::{fields, CallEvent};
use cdrflow_core::{Failure, FailureKind};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, instrument};

use crate::constants::{ANONYMOUS_CALLER, PHONE_PATTERN};
use crate::timestamp::TimestampNormalizer;

static PHONE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(PHONE_PATTERN).expect("phone pattern is a valid regex"));

/// Runs the timestamp, SIP method and phone checks
#[derive(Debug, Clone)]
pub struct Validator {
    normalizer: TimestampNormalizer,
}

impl Validator {
    pub fn new(normalizer: TimestampNormalizer) -> Self {
        Self { normalizer }
    }

    pub fn normalizer(&self) -> &TimestampNormalizer {
        &self.normalizer
    }

    /// Validate an event. An empty vector means the event is valid.
    ///
    /// Takes the event mutably because timestamp normalization may cache the
    /// canonical ISO form on it.
    #[instrument(skip(self, event), fields(session = %event.session_label()))]
    pub fn validate(&self, event: &mut CallEvent) -> Vec<Failure> {
        let mut failures = Vec::new();

        if let Err(failure) = self.normalizer.normalize(event) {
            failures.push(failure);
        }
        if let Some(failure) = check_sip_method(event) {
            failures.push(failure);
        }
        failures.extend(check_phones(event));

        if failures.is_empty() {
            debug!("Event is valid");
        } else {
            for failure in &failures {
                debug!("Validation failed: {}", failure);
            }
        }
        failures
    }
}

/// `start` must carry `INVITE` and `stop` must carry `BYE`
pub fn check_sip_method(event: &CallEvent) -> Option<Failure> {
    let Some(action) = event.action else {
        return Some(Failure::missing([fields::ACTION]));
    };
    let Some(method) = event.sip_method.as_deref() else {
        return Some(Failure::missing([fields::SIP_METHOD]));
    };

    if action.expected_sip_method() == Some(method) {
        return None;
    }
    Some(Failure::new(
        FailureKind::SipMethodMismatch,
        fields::SIP_METHOD,
        format!("{} has Sip-Method = {}", action.as_str(), method),
    ))
}

/// Both parties must be present, differ, and look like phone numbers. The
/// calling party may be `Anonymous`.
pub fn check_phones(event: &CallEvent) -> Vec<Failure> {
    let mut missing = Vec::new();
    if event.to_user.is_none() {
        missing.push(fields::TO_USER);
    }
    if event.from_user.is_none() {
        missing.push(fields::FROM_USER);
    }
    if !missing.is_empty() {
        return vec![Failure::missing(missing)];
    }

    let to_user = event.to_user.as_deref().unwrap_or_default();
    let from_user = event.from_user.as_deref().unwrap_or_default();

    if to_user == from_user {
        return vec![Failure::new(
            FailureKind::IdenticalParties,
            "phone number",
            "Sip-To-User === Sip-From-User",
        )];
    }

    let mut failures = Vec::new();
    if !is_phone_number(to_user) {
        failures.push(invalid_format(fields::TO_USER, to_user));
    }
    if from_user != ANONYMOUS_CALLER && !is_phone_number(from_user) {
        failures.push(invalid_format(fields::FROM_USER, from_user));
    }
    failures
}

pub fn is_phone_number(raw: &str) -> bool {
    PHONE_REGEX.is_match(raw)
}

fn invalid_format(field: &str, value: &str) -> Failure {
    Failure::new(
        FailureKind::InvalidPhoneFormat,
        field,
        format!("invalid format: {}", value),
    )
}

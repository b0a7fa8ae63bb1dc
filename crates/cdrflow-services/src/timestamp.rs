//! Timestamp normalizer
//!
//! Turns the `Event-Timestamp` of a call event into epoch milliseconds.
//! Two encodings are accepted:
//! - the structured `{"t": <ms>, ...}` object, read from `t`
//! - free text, parsed directly or after swapping a zone abbreviation such
//!   as `CEST` for its `GMT+0200` offset
//!
//! When an abbreviation had to be resolved the canonical ISO-8601 form is
//! cached on the event as `Event-Timestamp-ISO`, so later passes over the
//! same raw value skip the resolution.

use cdrflow_core::models::{fields, CallEvent, EventTimestamp, StructuredTimestamp};
use cdrflow_core::{Failure, PipelineConfig};
use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, Utc};
use tracing::{debug, warn};

use crate::constants::EPOCH_MS_DIGITS;

/// Formats carrying an explicit `GMT±HHMM` offset
const OFFSET_FORMATS: &[&str] = &[
    "%b %d %Y %H:%M:%S GMT%z",
    "%a %b %d %Y %H:%M:%S GMT%z",
    "%d %b %Y %H:%M:%S GMT%z",
    "%Y-%m-%d %H:%M:%S GMT%z",
    "%Y-%m-%d %H:%M:%S %z",
];

/// Formats without an offset, read as UTC
const NAIVE_FORMATS: &[&str] = &[
    "%b %d %Y %H:%M:%S",
    "%b %d %Y %H:%M:%S GMT",
    "%b %d %Y %H:%M:%S UTC",
    "%a %b %d %Y %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
];

/// Parses event timestamps into epoch milliseconds
#[derive(Debug, Clone)]
pub struct TimestampNormalizer {
    config: PipelineConfig,
}

impl TimestampNormalizer {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Epoch milliseconds of the event, caching the ISO form when a zone
    /// abbreviation was resolved.
    ///
    /// The raw `Event-Timestamp` is always required. A cached ISO form only
    /// stands in for the abbreviation lookup of a textual value that carries
    /// a known abbreviation, and is held to the same digits and floor rules.
    pub fn normalize(&self, event: &mut CallEvent) -> Result<i64, Failure> {
        let resolved = match event.timestamp.as_ref() {
            None => return Err(Failure::missing([fields::TIMESTAMP])),
            Some(EventTimestamp::Structured(structured)) => {
                return self.from_structured(structured, event.session_label())
            }
            Some(EventTimestamp::Textual(raw)) => {
                if let Some(cached) = self.from_cache(raw, event.timestamp_iso.as_deref()) {
                    return cached;
                }
                self.from_text(raw)?
            }
            Some(EventTimestamp::Unrecognized(_)) => {
                return Err(Failure::invalid_timestamp("timestamp property is invalid"))
            }
        };

        let epoch_ms = resolved.instant.timestamp_millis();
        if resolved.via_abbreviation {
            event.timestamp_iso = Some(to_iso(&resolved.instant));
        }
        Ok(epoch_ms)
    }

    /// Epoch value of a cached ISO form, if `raw` is a value whose
    /// resolution would have produced one
    fn from_cache(&self, raw: &str, iso: Option<&str>) -> Option<Result<i64, Failure>> {
        let iso = iso?;
        if parse_direct(raw).is_some() || !self.has_known_abbreviation(raw) {
            return None;
        }
        match DateTime::parse_from_rfc3339(iso) {
            Ok(dt) => Some(self.check_epoch_ms(&dt.timestamp_millis().to_string())),
            Err(e) => {
                debug!("Ignoring unreadable {} '{}': {}", fields::TIMESTAMP_ISO, iso, e);
                None
            }
        }
    }

    fn has_known_abbreviation(&self, raw: &str) -> bool {
        find_zone_abbreviation(raw)
            .map(|(start, end)| self.config.zone_offset_hours(&raw[start..end]).is_some())
            .unwrap_or(false)
    }

    fn from_structured(&self, ts: &StructuredTimestamp, session: &str) -> Result<i64, Failure> {
        if ts.epoch_ms.is_none() {
            return Err(Failure::missing([format!("{}[t]", fields::TIMESTAMP)]));
        }
        let digits = ts
            .epoch_digits()
            .ok_or_else(|| Failure::invalid_timestamp("timestamp value in ms is invalid"))?;
        let epoch_ms = self.check_epoch_ms(&digits)?;

        warn!(session = %session, "timestamp is object");
        Ok(epoch_ms)
    }

    fn from_text(&self, raw: &str) -> Result<Resolved, Failure> {
        if let Some(instant) = parse_direct(raw) {
            self.check_epoch_ms(&instant.timestamp_millis().to_string())?;
            return Ok(Resolved {
                instant,
                via_abbreviation: false,
            });
        }

        let instant = self
            .resolve_abbreviation(raw)
            .ok_or_else(|| Failure::invalid_timestamp("timestamp property is invalid"))?;
        self.check_epoch_ms(&instant.timestamp_millis().to_string())?;
        Ok(Resolved {
            instant,
            via_abbreviation: true,
        })
    }

    /// Replace the first zone abbreviation with its GMT offset and re-parse
    fn resolve_abbreviation(&self, raw: &str) -> Option<DateTime<Utc>> {
        let (start, end) = find_zone_abbreviation(raw)?;
        let abbreviation = &raw[start..end];

        let Some(offset_hours) = self.config.zone_offset_hours(abbreviation) else {
            warn!(notice = %format!("abbreviation is unknown: {}", abbreviation), "timezone abbreviation used in date");
            return None;
        };

        let gmt = gmt_offset(offset_hours);
        warn!(notice = %format!("{} is parsed as {}", abbreviation, gmt), "timezone abbreviation used in date");

        let rewritten = format!("{}{}{}", &raw[..start], gmt, &raw[end..]);
        parse_direct(&rewritten)
    }

    /// Millisecond values must be exactly 13 digits and not before the floor
    fn check_epoch_ms(&self, digits: &str) -> Result<i64, Failure> {
        let invalid = || Failure::invalid_timestamp("timestamp value in ms is invalid");

        if digits.len() != EPOCH_MS_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let epoch_ms: i64 = digits.parse().map_err(|_| invalid())?;
        if epoch_ms < self.config.timestamp_floor_epoch_ms {
            return Err(invalid());
        }
        Ok(epoch_ms)
    }
}

struct Resolved {
    instant: DateTime<Utc>,
    via_abbreviation: bool,
}

fn to_iso(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn gmt_offset(hours: i32) -> String {
    let sign = if hours < 0 { '-' } else { '+' };
    format!("GMT{}{:02}00", sign, hours.abs())
}

/// Parse a date string in one of the accepted explicit formats
fn parse_direct(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::<FixedOffset>::parse_from_str(raw, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Byte range of the first run of 3-4 uppercase ASCII letters that is not
/// immediately followed by `+`. A 4-letter run followed by `+` falls back to
/// its first 3 letters only if the fourth is not `+` either, so `GMT+0200`
/// never matches.
fn find_zone_abbreviation(raw: &str) -> Option<(usize, usize)> {
    let bytes = raw.as_bytes();
    for start in 0..bytes.len() {
        let run = bytes[start..]
            .iter()
            .take(4)
            .take_while(|b| b.is_ascii_uppercase())
            .count();
        for len in (3..=run).rev() {
            let end = start + len;
            if bytes.get(end) != Some(&b'+') {
                return Some((start, end));
            }
        }
    }
    None
}

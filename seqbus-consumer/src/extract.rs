//! Aggregate ID extraction from inbound records.
//!
//! Sources are tried in priority order:
//!
//! 1. the headers `X-Aggregate-ID`, `x-aggregate-id`, `Aggregate-ID`, `aggregate-id`
//! 2. the record key
//! 3. the subject, split on `.` and scanned from the last segment to the first
//!
//! The first candidate that passes [`validate_aggregate_id`] wins. Invalid
//! candidates are skipped rather than reported.

use crate::error::{ConsumerError, Result};
use std::collections::HashMap;

/// Header names checked for an explicit aggregate ID, in order.
pub const AGGREGATE_ID_HEADERS: [&str; 4] =
    ["X-Aggregate-ID", "x-aggregate-id", "Aggregate-ID", "aggregate-id"];

/// Longest accepted aggregate ID, in characters.
pub const MAX_AGGREGATE_ID_LEN: usize = 256;

/// Check that a trimmed `id` is non-empty, at most 256 characters, and uses only
/// `A-Z a-z 0-9 : _ - . /`.
pub fn validate_aggregate_id(id: &str) -> Result<()> {
    let id = id.trim();
    if id.is_empty() {
        return Err(invalid("aggregate_id cannot be empty"));
    }
    if id.chars().count() > MAX_AGGREGATE_ID_LEN {
        return Err(invalid(format!("aggregate_id too long (max {MAX_AGGREGATE_ID_LEN} characters)")));
    }
    if let Some(c) = id.chars().find(|c| !is_allowed(*c)) {
        return Err(invalid(format!("aggregate_id contains invalid character: {c}")));
    }
    Ok(())
}

/// Find the aggregate ID of a record.
pub fn extract_aggregate_id(
    headers: &HashMap<String, String>,
    key: Option<&[u8]>,
    subject: Option<&str>,
) -> Result<String> {
    for name in AGGREGATE_ID_HEADERS {
        if let Some(found) = headers.get(name).and_then(|value| accept(value)) {
            return Ok(found);
        }
    }

    if let Some(found) = key.and_then(|key| std::str::from_utf8(key).ok()).and_then(accept) {
        return Ok(found);
    }

    if let Some(found) = subject.and_then(|subject| subject.rsplit('.').find_map(accept)) {
        return Ok(found);
    }

    Err(ConsumerError::AggregateIdNotFound)
}

fn accept(candidate: &str) -> Option<String> {
    let trimmed = candidate.trim();
    validate_aggregate_id(trimmed).ok().map(|()| trimmed.to_string())
}

const fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.' | '/')
}

fn invalid(reason: impl Into<String>) -> ConsumerError {
    ConsumerError::InvalidAggregateId { reason: reason.into() }
}

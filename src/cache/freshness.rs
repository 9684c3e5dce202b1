//! Freshness evaluation for stored responses.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::http::Response;

/// Where a stored entry sits in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  /// Younger than the refresh threshold
  Fresh,
  /// Still valid, but old enough to refresh in the background
  RefreshDue,
  /// Older than max age, or age unknown
  Expired,
}

impl Freshness {
  pub fn is_valid(&self) -> bool {
    !matches!(self, Freshness::Expired)
  }
}

/// Age of an entry stored at `stored_at`. Clock skew into the future counts as zero.
pub fn age(stored_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
  (now - stored_at).to_std().unwrap_or(Duration::ZERO)
}

/// Expired iff `now - stored_at > max_age`.
pub fn is_expired(stored_at: DateTime<Utc>, max_age: Duration, now: DateTime<Utc>) -> bool {
  age(stored_at, now) > max_age
}

/// Classify a stored response against its policy.
///
/// `threshold` is the fraction of `max_age` after which a background refresh is due.
pub fn evaluate(
  response: &Response,
  max_age: Duration,
  threshold: f64,
  now: DateTime<Utc>,
) -> Freshness {
  let Some(stored_at) = response.stored_at() else {
    return Freshness::Expired;
  };

  if is_expired(stored_at, max_age, now) {
    return Freshness::Expired;
  }

  if age(stored_at, now) > max_age.mul_f64(threshold) {
    Freshness::RefreshDue
  } else {
    Freshness::Fresh
  }
}

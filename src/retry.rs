//! Retry with exponential backoff and jitter for learner-profile writes.
//!
//! Only transient `StoreError`s are retried; the caller decides what a final
//! failure means (for profile writes: "progress not saved").

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tracing::warn;

use crate::error::StoreError;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
  /// Total tries including the first one.
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self { max_attempts: 3, base_delay_ms: 50, max_delay_ms: 1_000 }
  }
}

impl RetryPolicy {
  /// Delay before try `attempt + 1` (attempt is 1-based): capped exponential
  /// plus up to 50% random jitter.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let exp = self.base_delay_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
    let capped = exp.min(self.max_delay_ms);
    let jitter = if capped > 1 { rand::thread_rng().gen_range(0..=capped / 2) } else { 0 };
    Duration::from_millis(capped.saturating_add(jitter).min(self.max_delay_ms.max(1)))
  }
}

pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, op: &str, mut f: F) -> Result<T, StoreError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, StoreError>>,
{
  let max_attempts = policy.max_attempts.max(1);
  let mut attempt = 1;
  loop {
    match f().await {
      Ok(v) => return Ok(v),
      Err(e) if e.is_transient() && attempt < max_attempts => {
        let delay = policy.delay_for(attempt);
        warn!(target: "tutor_backend", %op, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Store call failed; retrying");
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(e) => return Err(e),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn fast() -> RetryPolicy {
    RetryPolicy { max_attempts: 3, base_delay_ms: 1, max_delay_ms: 2 }
  }

  #[tokio::test]
  async fn transient_errors_are_retried_until_success() {
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let out = with_backoff(&fast(), "test", || async move {
      if calls.fetch_add(1, Ordering::SeqCst) < 2 {
        Err(StoreError::Unavailable("blip".into()))
      } else {
        Ok(7)
      }
    })
    .await;
    assert_eq!(out, Ok(7));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn gives_up_after_max_attempts() {
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let out: Result<(), _> = with_backoff(&fast(), "test", || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Err(StoreError::Unavailable("down".into()))
    })
    .await;
    assert!(out.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn permanent_errors_are_not_retried() {
    let counter = AtomicU32::new(0);
    let calls = &counter;
    let out: Result<(), _> = with_backoff(&fast(), "test", || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Err(StoreError::Rejected("bad".into()))
    })
    .await;
    assert_eq!(out, Err(StoreError::Rejected("bad".into())));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn delays_grow_and_stay_capped() {
    let policy = RetryPolicy { max_attempts: 5, base_delay_ms: 10, max_delay_ms: 100 };
    assert!(policy.delay_for(1) >= Duration::from_millis(10));
    assert!(policy.delay_for(3) >= Duration::from_millis(40));
    assert!(policy.delay_for(30) <= Duration::from_millis(100));
  }
}

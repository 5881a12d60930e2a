//! Per-learner misconception frequency, recency and confidence.
//!
//! `running_confidence` is an exponential moving average:
//! `running' = (1 - w) * running + w * confidence`, seeded with the first
//! observed confidence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use crate::domain::MisconceptionRecord;
use crate::error::StoreError;
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::ProfileStore;

pub const DEFAULT_WEIGHT: f64 = 0.3;

/// Judges that omit a confidence are taken at their word.
const DEFAULT_CONFIDENCE: f64 = 1.0;

pub fn fold(
  prior: Option<&MisconceptionRecord>,
  tag: &str,
  confidence: f64,
  weight: f64,
  at: DateTime<Utc>,
) -> MisconceptionRecord {
  match prior {
    None => MisconceptionRecord {
      tag: tag.to_string(),
      count: 1,
      first_seen: at,
      last_seen: at,
      running_confidence: confidence,
    },
    Some(r) => MisconceptionRecord {
      tag: r.tag.clone(),
      count: r.count.saturating_add(1),
      first_seen: r.first_seen,
      last_seen: at.max(r.last_seen),
      running_confidence: (1.0 - weight) * r.running_confidence + weight * confidence,
    },
  }
}

#[derive(Clone)]
pub struct MisconceptionTracker {
  store: Arc<dyn ProfileStore>,
  weight: f64,
  retry: RetryPolicy,
}

impl MisconceptionTracker {
  pub fn new(store: Arc<dyn ProfileStore>, weight: f64, retry: RetryPolicy) -> Self {
    let weight = if weight.is_finite() { weight.clamp(0.0, 1.0) } else { DEFAULT_WEIGHT };
    Self { store, weight, retry }
  }

  /// No-op (returns `None`) when `tag` is absent or blank. Only the put is
  /// retried; callers hold the learner's lock.
  #[instrument(level = "debug", skip(self), fields(%learner_id))]
  pub async fn record(
    &self,
    learner_id: &str,
    tag: Option<&str>,
    confidence: Option<f64>,
    at: DateTime<Utc>,
  ) -> Result<Option<MisconceptionRecord>, StoreError> {
    let Some(tag) = tag.map(str::trim).filter(|t| !t.is_empty()) else {
      return Ok(None);
    };
    let confidence = confidence.filter(|c| c.is_finite()).unwrap_or(DEFAULT_CONFIDENCE).clamp(0.0, 1.0);

    let prior = with_backoff(&self.retry, "get_misconception", || self.store.get_misconception(learner_id, tag)).await?;
    let record = fold(prior.as_ref(), tag, confidence, self.weight, at);
    with_backoff(&self.retry, "put_misconception", || self.store.put_misconception(learner_id, record.clone())).await?;
    debug!(target: "session", %learner_id, %tag, count = record.count, running_confidence = record.running_confidence, "Misconception recorded");
    Ok(Some(record))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::InMemoryProfileStore;
  use chrono::Duration;

  #[tokio::test]
  async fn absent_tag_is_a_no_op() {
    let store = Arc::new(InMemoryProfileStore::new());
    let tracker = MisconceptionTracker::new(store.clone(), DEFAULT_WEIGHT, RetryPolicy::default());
    assert_eq!(tracker.record("l1", None, Some(0.9), Utc::now()).await.unwrap(), None);
    assert_eq!(tracker.record("l1", Some("  "), Some(0.9), Utc::now()).await.unwrap(), None);
    assert!(store.get_misconceptions("l1").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn repeated_tags_accumulate_with_moving_average() {
    let store = Arc::new(InMemoryProfileStore::new());
    let tracker = MisconceptionTracker::new(store.clone(), 0.3, RetryPolicy::default());
    let t0 = Utc::now();
    let t1 = t0 + Duration::seconds(30);

    let first = tracker.record("l1", Some("adds_instead_of_multiplies"), Some(0.5), t0).await.unwrap().unwrap();
    assert_eq!(first.count, 1);
    assert_eq!(first.running_confidence, 0.5);

    let second = tracker.record("l1", Some("adds_instead_of_multiplies"), Some(1.0), t1).await.unwrap().unwrap();
    assert_eq!(second.count, 2);
    assert_eq!(second.first_seen, t0);
    assert_eq!(second.last_seen, t1);
    assert!((second.running_confidence - 0.65).abs() < 1e-12);
  }

  #[tokio::test]
  async fn missing_or_wild_confidence_is_bounded() {
    let store = Arc::new(InMemoryProfileStore::new());
    let tracker = MisconceptionTracker::new(store, 0.3, RetryPolicy::default());
    let a = tracker.record("l1", Some("sign_error"), None, Utc::now()).await.unwrap().unwrap();
    assert_eq!(a.running_confidence, 1.0);
    let b = tracker.record("l1", Some("sign_error"), Some(42.0), Utc::now()).await.unwrap().unwrap();
    assert!((0.0..=1.0).contains(&b.running_confidence));
  }

  #[tokio::test]
  async fn tags_are_tracked_per_learner() {
    let store = Arc::new(InMemoryProfileStore::new());
    let tracker = MisconceptionTracker::new(store.clone(), 0.3, RetryPolicy::default());
    tracker.record("l1", Some("sign_error"), Some(0.8), Utc::now()).await.unwrap();
    tracker.record("l2", Some("sign_error"), Some(0.8), Utc::now()).await.unwrap();
    assert_eq!(store.get_misconceptions("l1").await.unwrap().len(), 1);
    assert_eq!(store.get_misconceptions("l1").await.unwrap()[0].count, 1);
  }
}

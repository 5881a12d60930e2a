//! Hint escalation: failing attempt `n` earns ladder level `n`, capped at the
//! step's highest level.

use crate::domain::{Hint, Step};

/// `attempts` counts submissions on the current step, including the one that
/// just failed. Zero attempts or an empty ladder yield no hint.
pub fn next_hint(step: &Step, attempts: u32) -> Option<&Hint> {
  if attempts == 0 {
    return None;
  }
  let level = attempts.min(step.max_hint_level());
  step.hints.iter().find(|h| h.level == level)
}

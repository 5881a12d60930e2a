//! Symbolic-equivalence stage.
//!
//! `EquivalenceEngine` is the CAS capability; `EquivalenceAdjudicator` wraps
//! one with a fixed time budget and folds every failure (timeout, parse
//! error, `Unknown`) into `Inconclusive` so the pipeline falls through.
//!
//! The built-in engine, `SampledEquivalence`, decides equality by evaluating
//! both expressions at seeded pseudo-random points. Two expressions that agree
//! on many random points are treated as identical (polynomial identity
//! testing); a single disagreement proves they differ. A response that
//! introduces variables the target never mentions is left `Unknown`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::domain::Outcome;
use crate::expr::{parse_statement, BinaryOp, Expr, ParseError, Statement};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Equivalence {
  Equivalent,
  NotEquivalent,
  Unknown,
}

#[derive(Debug, Error)]
pub enum EquivalenceError {
  #[error("could not parse expression: {0}")]
  Parse(#[from] ParseError),
  #[error("equivalence engine failed: {0}")]
  Engine(String),
}

/// Computer-algebra capability: are `a` and `b` mathematically equal?
#[async_trait]
pub trait EquivalenceEngine: Send + Sync {
  async fn equivalent(&self, a: &str, b: &str) -> Result<Equivalence, EquivalenceError>;
}

// ---------------------------------------------------------------------------
// Adjudicator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EquivalenceAdjudicator {
  engine: Arc<dyn EquivalenceEngine>,
  budget: Duration,
}

impl EquivalenceAdjudicator {
  pub fn new(engine: Arc<dyn EquivalenceEngine>, budget: Duration) -> Self {
    Self { engine, budget }
  }

  /// `Correct` if any target is equivalent, `Incorrect` only if every target
  /// is conclusively different, otherwise `Inconclusive`.
  #[instrument(level = "debug", skip(self, response, targets), fields(targets = targets.len(), budget_ms = self.budget.as_millis() as u64))]
  pub async fn adjudicate(&self, response: &str, targets: &[String]) -> Outcome {
    if targets.is_empty() {
      return Outcome::Inconclusive;
    }
    let run = async {
      let mut all_different = true;
      for target in targets {
        match self.engine.equivalent(response, target).await {
          Ok(Equivalence::Equivalent) => return Outcome::Correct,
          Ok(Equivalence::NotEquivalent) => {}
          Ok(Equivalence::Unknown) => all_different = false,
          Err(e) => {
            debug!(target: "session", error = %e, "Equivalence engine could not decide");
            all_different = false;
          }
        }
      }
      if all_different { Outcome::Incorrect } else { Outcome::Inconclusive }
    };

    match tokio::time::timeout(self.budget, run).await {
      Ok(outcome) => outcome,
      Err(_) => {
        warn!(target: "session", budget_ms = self.budget.as_millis() as u64, "Equivalence check timed out");
        Outcome::Inconclusive
      }
    }
  }
}

// ---------------------------------------------------------------------------
// Built-in sampling engine
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct SampledEquivalence {
  pub samples: usize,
  pub tolerance: f64,
  pub seed: u64,
}

impl Default for SampledEquivalence {
  fn default() -> Self {
    Self { samples: 24, tolerance: 1e-9, seed: 0x5EED_CA5 }
  }
}

#[async_trait]
impl EquivalenceEngine for SampledEquivalence {
  async fn equivalent(&self, a: &str, b: &str) -> Result<Equivalence, EquivalenceError> {
    let engine = self.clone();
    let (a, b) = (a.to_string(), b.to_string());
    tokio::task::spawn_blocking(move || engine.check(&a, &b))
      .await
      .map_err(|e| EquivalenceError::Engine(e.to_string()))?
  }
}

impl SampledEquivalence {
  /// `a` is the learner response and `b` the target.
  pub fn check(&self, a: &str, b: &str) -> Result<Equivalence, EquivalenceError> {
    let lhs = parse_statement(a)?;
    let rhs = parse_statement(b)?;
    if !lhs.vars().is_subset(&rhs.vars()) {
      return Ok(Equivalence::Unknown);
    }
    Ok(match (&lhs, &rhs) {
      (Statement::Expr(x), Statement::Expr(y)) => self.compare(&lhs, &rhs, x, y, false),
      (Statement::Equation(l1, r1), Statement::Equation(l2, r2)) => {
        let d1 = difference(l1, r1);
        let d2 = difference(l2, r2);
        self.compare(&lhs, &rhs, &d1, &d2, true)
      }
      // An equation against a bare expression needs interpretation.
      _ => Equivalence::Unknown,
    })
  }

  /// With `up_to_scale`, `x` must equal `k * y` for one non-zero constant `k`.
  fn compare(&self, sa: &Statement, sb: &Statement, x: &Expr, y: &Expr, up_to_scale: bool) -> Equivalence {
    let mut vars = sa.vars();
    vars.extend(sb.vars());

    let mut rng = StdRng::seed_from_u64(self.seed);
    let mut valid = 0usize;
    let mut scale: Option<f64> = None;
    let mut env = HashMap::new();

    for _ in 0..self.samples {
      for v in &vars {
        // Avoid the neighbourhood of zero and small integers where
        // coincidences are most likely.
        let magnitude: f64 = rng.gen_range(0.37..9.7);
        let sign = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        env.insert(*v, magnitude * sign);
      }
      let (Some(p), Some(q)) = (x.eval(&env), y.eval(&env)) else {
        continue;
      };
      valid += 1;

      let q = if up_to_scale {
        if q.abs() <= self.tolerance {
          if p.abs() > self.tolerance * p.abs().max(1.0) {
            return Equivalence::NotEquivalent;
          }
          continue;
        }
        let k = *scale.get_or_insert(p / q);
        if k.abs() <= self.tolerance {
          return Equivalence::NotEquivalent;
        }
        q * k
      } else {
        q
      };

      if !approx_eq(p, q, self.tolerance) {
        return Equivalence::NotEquivalent;
      }
    }

    if valid * 2 < self.samples {
      return Equivalence::Unknown;
    }
    Equivalence::Equivalent
  }
}

fn difference(l: &Expr, r: &Expr) -> Expr {
  Expr::Binary(BinaryOp::Sub, Box::new(l.clone()), Box::new(r.clone()))
}

fn approx_eq(a: f64, b: f64, tolerance: f64) -> bool {
  (a - b).abs() <= tolerance * a.abs().max(b.abs()).max(1.0)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn engine() -> SampledEquivalence {
    SampledEquivalence::default()
  }

  #[test]
  fn equal_forms_are_equivalent() {
    assert_eq!(engine().check("4+b", "b+4").unwrap(), Equivalence::Equivalent);
    assert_eq!(engine().check("2(b+3)", "2b+6").unwrap(), Equivalence::Equivalent);
    assert_eq!(engine().check("(x+1)^2", "x^2+2x+1").unwrap(), Equivalence::Equivalent);
    assert_eq!(engine().check("6/3", "2").unwrap(), Equivalence::Equivalent);
  }

  #[test]
  fn different_forms_are_not() {
    assert_eq!(engine().check("4b", "b+4").unwrap(), Equivalence::NotEquivalent);
    assert_eq!(engine().check("b-4", "4-b").unwrap(), Equivalence::NotEquivalent);
    assert_eq!(engine().check("9", "10").unwrap(), Equivalence::NotEquivalent);
  }

  #[test]
  fn equations_compare_up_to_scale() {
    assert_eq!(engine().check("2x = 10", "x = 5").unwrap(), Equivalence::Equivalent);
    assert_eq!(engine().check("x = 5", "5 = x").unwrap(), Equivalence::Equivalent);
    assert_eq!(engine().check("x = 4", "x = 5").unwrap(), Equivalence::NotEquivalent);
  }

  #[test]
  fn mixed_shapes_and_undefined_values_are_unknown() {
    assert_eq!(engine().check("x = 5", "5").unwrap(), Equivalence::Unknown);
    assert_eq!(engine().check("1/(x-x)", "x").unwrap(), Equivalence::Unknown);
  }

  #[test]
  fn foreign_variables_are_unknown() {
    assert_eq!(engine().check("b + c", "b+4").unwrap(), Equivalence::Unknown);
    assert_eq!(engine().check("y + 4", "b+4").unwrap(), Equivalence::Unknown);
    assert_eq!(engine().check("8", "b+4").unwrap(), Equivalence::NotEquivalent);
  }

  #[test]
  fn unparseable_input_is_an_error() {
    assert!(matches!(engine().check("b+", "b+4"), Err(EquivalenceError::Parse(_))));
    assert!(matches!(engine().check("b+4", "b % 4"), Err(EquivalenceError::Parse(_))));
    assert!(matches!(engine().check("b + four", "b+4"), Err(EquivalenceError::Parse(_))));
  }

  struct SlowEngine;

  #[async_trait]
  impl EquivalenceEngine for SlowEngine {
    async fn equivalent(&self, _a: &str, _b: &str) -> Result<Equivalence, EquivalenceError> {
      tokio::time::sleep(Duration::from_secs(30)).await;
      Ok(Equivalence::Equivalent)
    }
  }

  struct Scripted {
    answers: Vec<Equivalence>,
    calls: AtomicUsize,
  }

  #[async_trait]
  impl EquivalenceEngine for Scripted {
    async fn equivalent(&self, _a: &str, _b: &str) -> Result<Equivalence, EquivalenceError> {
      let i = self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(self.answers[i % self.answers.len()])
    }
  }

  #[tokio::test]
  async fn timeout_is_inconclusive() {
    let adjudicator = EquivalenceAdjudicator::new(Arc::new(SlowEngine), Duration::from_millis(20));
    assert_eq!(adjudicator.adjudicate("4b", &["b+4".into()]).await, Outcome::Inconclusive);
  }

  #[tokio::test]
  async fn any_equivalent_target_wins() {
    let engine = Arc::new(Scripted {
      answers: vec![Equivalence::NotEquivalent, Equivalence::Equivalent],
      calls: AtomicUsize::new(0),
    });
    let adjudicator = EquivalenceAdjudicator::new(engine.clone(), Duration::from_secs(1));
    let targets = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    assert_eq!(adjudicator.adjudicate("x", &targets).await, Outcome::Correct);
    assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn unknown_target_keeps_result_open() {
    let engine = Arc::new(Scripted {
      answers: vec![Equivalence::NotEquivalent, Equivalence::Unknown],
      calls: AtomicUsize::new(0),
    });
    let adjudicator = EquivalenceAdjudicator::new(engine, Duration::from_secs(1));
    let targets = vec!["a".to_string(), "b".to_string()];
    assert_eq!(adjudicator.adjudicate("x", &targets).await, Outcome::Inconclusive);
  }

  #[tokio::test]
  async fn parse_failure_is_inconclusive() {
    let adjudicator = EquivalenceAdjudicator::new(Arc::new(engine()), Duration::from_secs(2));
    assert_eq!(adjudicator.adjudicate("b+", &["b+4".into()]).await, Outcome::Inconclusive);
    assert_eq!(adjudicator.adjudicate("4b", &["b+4".into()]).await, Outcome::Incorrect);
    assert_eq!(adjudicator.adjudicate("four more than b", &["b+4".into()]).await, Outcome::Inconclusive);
  }
}

//! Literal / regex acceptable-answer matching.
//!
//! A match is conclusive (`Correct`); no match is `Inconclusive`, never
//! `Incorrect`, because a later stage may still accept the answer.

use tracing::trace;

use crate::domain::{AnswerPattern, EvaluationRule, Outcome};
use crate::expr::parse_statement;
use crate::normalize::compact;

/// `normalized` must come from [`crate::normalize::normalize`].
pub fn match_rules(normalized: &str, rule: &EvaluationRule) -> Outcome {
  let response = compact(normalized);
  if response.is_empty() {
    return Outcome::Inconclusive;
  }

  // Parsed lazily: only literal patterns need the structural comparison.
  let mut response_canonical: Option<Option<String>> = None;

  for pattern in &rule.patterns {
    let matched = match pattern {
      AnswerPattern::Literal { text, parsed } => {
        if compact(text) == response {
          true
        } else if let Some(theirs) = parsed {
          let ours = response_canonical
            .get_or_insert_with(|| parse_statement(&response).ok().map(|s| s.canonical(&rule.commutative)));
          ours.as_deref() == Some(theirs.canonical(&rule.commutative).as_str())
        } else {
          false
        }
      }
      AnswerPattern::Regex { regex, .. } => regex.is_match(&response) || regex.is_match(normalized),
    };
    if matched {
      trace!(target: "session", ?pattern, "Rule matched");
      return Outcome::Correct;
    }
  }
  Outcome::Inconclusive
}

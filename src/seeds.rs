//! Built-in items that keep the service useful without an external item bank.

use std::collections::BTreeSet;

use crate::domain::{AnswerPattern, EvaluationRule, Hint, Item, Scoring, Step};
use crate::expr::BinaryOp;

fn hints(texts: &[&str]) -> Vec<Hint> {
  texts
    .iter()
    .enumerate()
    .map(|(i, t)| Hint { level: i as u32 + 1, text: (*t).to_string() })
    .collect()
}

/// Minimal introductory algebra set.
pub fn seed_items() -> Vec<Item> {
  vec![
    Item {
      id: "ALG-S1-E1".into(),
      title: "Marbles in a bag".into(),
      topic: "Algebra".into(),
      sub_topic: "1.1 Introduction to Algebra".into(),
      problem_text: "Bob has b marbles. His friend gives him 4 more marbles.".into(),
      skill: "algebra.expressions".into(),
      subskills: BTreeSet::from(["writing_expressions".to_string(), "substitution".to_string()]),
      scoring: Scoring { base_xp: 10, no_hint_bonus: 5 },
      steps: vec![
        Step {
          id: "s1".into(),
          prompt: "Write an expression for the number of marbles Bob has now.".into(),
          rule: EvaluationRule {
            patterns: vec![AnswerPattern::literal("b + 4")],
            commutative: vec![BinaryOp::Add],
            algebraic_equivalence: true,
            llm_fallback: true,
            reference_answer: Some("b + 4".into()),
          },
          hints: hints(&[
            "Bob starts with b marbles. Does getting more marbles make the total bigger or smaller?",
            "Getting 4 more means you add 4 to what Bob already has.",
          ]),
        },
        Step {
          id: "s2".into(),
          prompt: "If b = 6, how many marbles does Bob have now?".into(),
          rule: EvaluationRule {
            patterns: vec![AnswerPattern::literal("10")],
            commutative: vec![],
            algebraic_equivalence: true,
            llm_fallback: false,
            reference_answer: None,
          },
          hints: hints(&[
            "Use your expression from the last step.",
            "Replace b with 6 in b + 4.",
            "Work out 6 + 4.",
          ]),
        },
      ],
    },
    Item {
      id: "ALG-S1-E2".into(),
      title: "Collecting like terms".into(),
      topic: "Algebra".into(),
      sub_topic: "1.2 Simplifying Expressions".into(),
      problem_text: "Simplify y + y + y.".into(),
      skill: "algebra.simplifying".into(),
      subskills: BTreeSet::from(["like_terms".to_string()]),
      scoring: Scoring { base_xp: 10, no_hint_bonus: 5 },
      steps: vec![Step {
        id: "s1".into(),
        prompt: "Write y + y + y in its simplest form.".into(),
        rule: EvaluationRule {
          patterns: vec![AnswerPattern::literal("3y")],
          commutative: vec![BinaryOp::Mul],
          algebraic_equivalence: true,
          llm_fallback: true,
          reference_answer: Some("3y".into()),
        },
        hints: hints(&[
          "How many y's are being added together?",
          "Three lots of y can be written as a number times y.",
        ]),
      }],
    },
  ]
}

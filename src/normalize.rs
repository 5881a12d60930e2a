//! Canonicalizes raw learner text before any comparison.
//!
//! Trims, lower-cases, maps unicode operators to ASCII, replaces spoken
//! operator words ("times", "divided by", ...) with symbols and collapses
//! whitespace. Total: any input yields some output.

use std::sync::LazyLock;

use regex::Regex;

/// Word synonyms, longest phrases first so "divided by" wins over "divide".
static SYNONYMS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
  [
    (r"\bis equal to\b", " = "),
    (r"\bdivided by\b", " / "),
    (r"\bmultiplied by\b", " * "),
    (r"\bto the power of\b", " ^ "),
    (r"\bsquared\b", " ^ 2 "),
    (r"\bcubed\b", " ^ 3 "),
    (r"\bdivide\b", " / "),
    (r"\bover\b", " / "),
    (r"\btimes\b", " * "),
    (r"\bplus\b", " + "),
    (r"\badd\b", " + "),
    (r"\bminus\b", " - "),
    (r"\bsubtract\b", " - "),
    (r"\bequals\b", " = "),
  ]
  .into_iter()
  .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
  .collect()
});

pub fn normalize(raw: &str) -> String {
  let mut text: String = raw
    .trim()
    .to_lowercase()
    .chars()
    .map(|c| match c {
      '×' | '·' | '∙' => '*',
      '÷' => '/',
      '−' | '–' | '—' => '-',
      '＋' => '+',
      '＝' => '=',
      other => other,
    })
    .collect();

  for (re, replacement) in SYNONYMS.iter() {
    if re.is_match(&text) {
      text = re.replace_all(&text, *replacement).into_owned();
    }
  }

  text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized text with every space removed, for spacing-blind comparison.
pub fn compact(normalized: &str) -> String {
  normalized.chars().filter(|c| !c.is_whitespace()).collect()
}

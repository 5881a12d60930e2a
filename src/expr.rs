//! Small arithmetic expression language for learner answers.
//!
//! Grammar (lowest to highest precedence):
//!   statement := sum ('=' sum)?
//!   sum       := product (('+' | '-') product)*
//!   product   := unary (('*' | '/') unary | <implicit> unary)*
//!   unary     := ('-' | '+') unary | power
//!   power     := primary ('^' unary)?
//!   primary   := number | variable | func '(' sum ')' | '(' sum ')'
//!
//! Variables are single letters and `4b` reads as a product. Any other run of
//! letters is rejected unless it names a function, so prose never parses.
//! Implicit multiplication applies before a variable, function or parenthesis.
//! Input is capped at `MAX_TOKENS` tokens and `MAX_DEPTH` nested operands.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_TOKENS: usize = 256;
pub const MAX_DEPTH: usize = 48;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
  Add,
  Sub,
  Mul,
  Div,
  Pow,
}

impl BinaryOp {
  pub fn symbol(self) -> char {
    match self {
      Self::Add => '+',
      Self::Sub => '-',
      Self::Mul => '*',
      Self::Div => '/',
      Self::Pow => '^',
    }
  }

  pub fn from_symbol(s: &str) -> Option<Self> {
    match s.trim() {
      "+" | "add" => Some(Self::Add),
      "-" | "sub" => Some(Self::Sub),
      "*" | "mul" => Some(Self::Mul),
      "/" | "div" => Some(Self::Div),
      "^" | "pow" => Some(Self::Pow),
      _ => None,
    }
  }

  fn associative(self) -> bool {
    matches!(self, Self::Add | Self::Mul)
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Func {
  Sqrt,
  Abs,
}

impl Func {
  fn from_name(name: &str) -> Option<Self> {
    match name {
      "sqrt" => Some(Self::Sqrt),
      "abs" => Some(Self::Abs),
      _ => None,
    }
  }

  fn name(self) -> &'static str {
    match self {
      Self::Sqrt => "sqrt",
      Self::Abs => "abs",
    }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
  Num(f64),
  Var(char),
  Neg(Box<Expr>),
  Call(Func, Box<Expr>),
  Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
  Expr(Expr),
  Equation(Expr, Expr),
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ParseError {
  #[error("unexpected character '{0}' at {1}")]
  UnexpectedChar(char, usize),
  #[error("unexpected end of input")]
  UnexpectedEnd,
  #[error("unexpected token at {0}")]
  UnexpectedToken(usize),
  #[error("invalid number '{0}'")]
  InvalidNumber(String),
  #[error("empty expression")]
  Empty,
  #[error("unknown word '{0}' at {1}")]
  UnknownWord(String, usize),
  #[error("expression longer than {MAX_TOKENS} tokens")]
  TooLong,
  #[error("expression nested deeper than {MAX_DEPTH} levels")]
  TooDeep,
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Tok {
  Num(f64),
  Var(char),
  Func(Func),
  Op(char),
  LParen,
  RParen,
  Eq,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Tok)>, ParseError> {
  let chars: Vec<char> = input.chars().collect();
  let mut out = Vec::new();
  let mut i = 0;
  while i < chars.len() {
    let c = chars[i];
    if c.is_whitespace() {
      i += 1;
      continue;
    }
    if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) {
      let start = i;
      while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        i += 1;
      }
      let text: String = chars[start..i].iter().collect();
      let value = text.parse::<f64>().map_err(|_| ParseError::InvalidNumber(text.clone()))?;
      out.push((start, Tok::Num(value)));
      continue;
    }
    if c.is_alphabetic() {
      let start = i;
      while i < chars.len() && chars[i].is_alphabetic() {
        i += 1;
      }
      let word: String = chars[start..i].iter().collect();
      let tok = match Func::from_name(&word) {
        Some(f) => Tok::Func(f),
        None if i - start == 1 => Tok::Var(c),
        None => return Err(ParseError::UnknownWord(word, start)),
      };
      out.push((start, tok));
      continue;
    }
    let tok = match c {
      '+' | '-' | '*' | '/' | '^' => Tok::Op(c),
      '(' | '[' => Tok::LParen,
      ')' | ']' => Tok::RParen,
      '=' => Tok::Eq,
      _ => return Err(ParseError::UnexpectedChar(c, i)),
    };
    out.push((i, tok));
    i += 1;
  }
  if out.len() > MAX_TOKENS {
    return Err(ParseError::TooLong);
  }
  Ok(out)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
  toks: Vec<(usize, Tok)>,
  pos: usize,
  depth: usize,
}

impl Parser {
  fn peek(&self) -> Option<&Tok> {
    self.toks.get(self.pos).map(|(_, t)| t)
  }

  fn offset(&self) -> usize {
    self.toks.get(self.pos).map(|(o, _)| *o).unwrap_or(usize::MAX)
  }

  fn next(&mut self) -> Option<Tok> {
    let t = self.toks.get(self.pos).map(|(_, t)| t.clone());
    self.pos += 1;
    t
  }

  fn statement(&mut self) -> Result<Statement, ParseError> {
    let lhs = self.sum()?;
    if self.peek() == Some(&Tok::Eq) {
      self.pos += 1;
      let rhs = self.sum()?;
      self.finish()?;
      return Ok(Statement::Equation(lhs, rhs));
    }
    self.finish()?;
    Ok(Statement::Expr(lhs))
  }

  fn finish(&self) -> Result<(), ParseError> {
    if self.pos < self.toks.len() {
      return Err(ParseError::UnexpectedToken(self.offset()));
    }
    Ok(())
  }

  fn sum(&mut self) -> Result<Expr, ParseError> {
    let mut lhs = self.product()?;
    while let Some(Tok::Op(c @ ('+' | '-'))) = self.peek().cloned() {
      self.pos += 1;
      let rhs = self.product()?;
      let op = if c == '+' { BinaryOp::Add } else { BinaryOp::Sub };
      lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
  }

  fn product(&mut self) -> Result<Expr, ParseError> {
    let mut lhs = self.unary()?;
    loop {
      match self.peek() {
        Some(Tok::Op(c @ ('*' | '/'))) => {
          let op = if *c == '*' { BinaryOp::Mul } else { BinaryOp::Div };
          self.pos += 1;
          let rhs = self.unary()?;
          lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Some(Tok::Var(_)) | Some(Tok::Func(_)) | Some(Tok::LParen) => {
          let rhs = self.power()?;
          lhs = Expr::Binary(BinaryOp::Mul, Box::new(lhs), Box::new(rhs));
        }
        _ => return Ok(lhs),
      }
    }
  }

  // Every nesting path (parentheses, exponents, signs) passes through here.
  fn unary(&mut self) -> Result<Expr, ParseError> {
    if self.depth >= MAX_DEPTH {
      return Err(ParseError::TooDeep);
    }
    self.depth += 1;
    let out = self.signed();
    self.depth -= 1;
    out
  }

  fn signed(&mut self) -> Result<Expr, ParseError> {
    match self.peek() {
      Some(Tok::Op('-')) => {
        self.pos += 1;
        Ok(Expr::Neg(Box::new(self.unary()?)))
      }
      Some(Tok::Op('+')) => {
        self.pos += 1;
        self.unary()
      }
      _ => self.power(),
    }
  }

  fn power(&mut self) -> Result<Expr, ParseError> {
    let base = self.primary()?;
    if self.peek() == Some(&Tok::Op('^')) {
      self.pos += 1;
      let exp = self.unary()?;
      return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exp)));
    }
    Ok(base)
  }

  fn primary(&mut self) -> Result<Expr, ParseError> {
    let at = self.offset();
    match self.next() {
      Some(Tok::Num(n)) => Ok(Expr::Num(n)),
      Some(Tok::Var(v)) => Ok(Expr::Var(v)),
      Some(Tok::Func(f)) => {
        if self.next() != Some(Tok::LParen) {
          return Err(ParseError::UnexpectedToken(at));
        }
        let arg = self.sum()?;
        self.close()?;
        Ok(Expr::Call(f, Box::new(arg)))
      }
      Some(Tok::LParen) => {
        let inner = self.sum()?;
        self.close()?;
        Ok(inner)
      }
      Some(_) => Err(ParseError::UnexpectedToken(at)),
      None => Err(ParseError::UnexpectedEnd),
    }
  }

  fn close(&mut self) -> Result<(), ParseError> {
    let at = self.offset();
    match self.next() {
      Some(Tok::RParen) => Ok(()),
      Some(_) => Err(ParseError::UnexpectedToken(at)),
      None => Err(ParseError::UnexpectedEnd),
    }
  }
}

pub fn parse_statement(input: &str) -> Result<Statement, ParseError> {
  let toks = tokenize(input)?;
  if toks.is_empty() {
    return Err(ParseError::Empty);
  }
  Parser { toks, pos: 0, depth: 0 }.statement()
}

// ---------------------------------------------------------------------------
// Evaluation and canonical form
// ---------------------------------------------------------------------------

impl Expr {
  /// None when the value is undefined (division by zero, sqrt of a negative).
  pub fn eval(&self, env: &HashMap<char, f64>) -> Option<f64> {
    let v = match self {
      Self::Num(n) => *n,
      Self::Var(c) => *env.get(c)?,
      Self::Neg(e) => -e.eval(env)?,
      Self::Call(Func::Sqrt, e) => e.eval(env)?.sqrt(),
      Self::Call(Func::Abs, e) => e.eval(env)?.abs(),
      Self::Binary(op, l, r) => {
        let (a, b) = (l.eval(env)?, r.eval(env)?);
        match op {
          BinaryOp::Add => a + b,
          BinaryOp::Sub => a - b,
          BinaryOp::Mul => a * b,
          BinaryOp::Div => a / b,
          BinaryOp::Pow => a.powf(b),
        }
      }
    };
    v.is_finite().then_some(v)
  }

  pub fn collect_vars(&self, out: &mut BTreeSet<char>) {
    match self {
      Self::Num(_) => {}
      Self::Var(c) => {
        out.insert(*c);
      }
      Self::Neg(e) | Self::Call(_, e) => e.collect_vars(out),
      Self::Binary(_, l, r) => {
        l.collect_vars(out);
        r.collect_vars(out);
      }
    }
  }

  /// Fully parenthesized rendering in which the operands of the given
  /// operators are sorted, so `b+4` and `4+b` agree when `+` is listed.
  pub fn canonical(&self, commutative: &[BinaryOp]) -> String {
    match self {
      Self::Num(n) => format_number(*n),
      Self::Var(c) => c.to_string(),
      Self::Neg(e) => format!("(-{})", e.canonical(commutative)),
      Self::Call(f, e) => format!("{}({})", f.name(), e.canonical(commutative)),
      Self::Binary(op, l, r) if commutative.contains(op) => {
        let mut parts = Vec::new();
        if op.associative() {
          self.flatten(*op, &mut parts);
        } else {
          parts.push(l.as_ref());
          parts.push(r.as_ref());
        }
        let mut rendered: Vec<String> = parts.iter().map(|p| p.canonical(commutative)).collect();
        rendered.sort();
        format!("({})", rendered.join(&op.symbol().to_string()))
      }
      Self::Binary(op, l, r) => {
        format!("({}{}{})", l.canonical(commutative), op.symbol(), r.canonical(commutative))
      }
    }
  }

  fn flatten<'a>(&'a self, op: BinaryOp, out: &mut Vec<&'a Expr>) {
    match self {
      Self::Binary(o, l, r) if *o == op => {
        l.flatten(op, out);
        r.flatten(op, out);
      }
      other => out.push(other),
    }
  }
}

impl Statement {
  pub fn canonical(&self, commutative: &[BinaryOp]) -> String {
    match self {
      Self::Expr(e) => e.canonical(commutative),
      Self::Equation(l, r) => format!("{}={}", l.canonical(commutative), r.canonical(commutative)),
    }
  }

  pub fn vars(&self) -> BTreeSet<char> {
    let mut out = BTreeSet::new();
    match self {
      Self::Expr(e) => e.collect_vars(&mut out),
      Self::Equation(l, r) => {
        l.collect_vars(&mut out);
        r.collect_vars(&mut out);
      }
    }
    out
  }
}

impl fmt::Display for Statement {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.canonical(&[]))
  }
}

fn format_number(n: f64) -> String {
  if n.fract() == 0.0 && n.abs() < 1e15 {
    format!("{}", n as i64)
  } else {
    format!("{n}")
  }
}

//! Math layer: arithmetic expressions and sums.
//!
//! `evaluate` supports `+`, `-`, `*`, `/`, parentheses, decimals and unary
//! minus through a small recursive-descent parser.

use async_trait::async_trait;
use layerflow_core::{Layer, LayerError, Value};
use std::iter::Peekable;
use std::str::Chars;

use crate::{text_arg, unknown};

pub struct MathLayer;

#[async_trait]
impl Layer for MathLayer {
    fn description(&self) -> &str {
        "Arithmetic. evaluate {expression} computes e.g. '(2 + 3) * 4'; sum {values} adds a list of numbers."
    }

    fn functions(&self) -> Vec<String> {
        vec!["evaluate".into(), "sum".into()]
    }

    async fn invoke(&self, function: &str, args: Value) -> Result<Value, LayerError> {
        match function {
            "evaluate" => {
                let expression = text_arg(&args, "expression")?;
                evaluate(&expression)
                    .map(Value::Num)
                    .map_err(|reason| LayerError::InvocationFailed {
                        layer: "math".into(),
                        function: "evaluate".into(),
                        reason,
                    })
            }
            "sum" => {
                let values = args.get("values").ok_or_else(|| {
                    LayerError::InvalidArguments("Missing 'values' argument".into())
                })?;
                sum(values).map(Value::Num)
            }
            other => Err(unknown("math", other)),
        }
    }
}

/// Add up a list of numbers (numeric strings count). A newline-separated
/// string, as produced by an upstream list, is split first.
fn sum(values: &Value) -> Result<f64, LayerError> {
    let items: Vec<Value> = match values {
        Value::List(items) => items.clone(),
        Value::Str(s) => s.lines().filter(|l| !l.trim().is_empty()).map(Value::text).collect(),
        Value::Num(n) => vec![Value::Num(*n)],
        Value::Map(_) => {
            return Err(LayerError::InvalidArguments("'values' must be a list".into()));
        }
    };

    items.iter().try_fold(0.0, |acc, item| {
        item.as_f64()
            .map(|n| acc + n)
            .ok_or_else(|| LayerError::InvalidArguments(format!("'{item}' is not a number")))
    })
}

// --- Expression evaluator ---

/// Evaluate an arithmetic expression.
pub fn evaluate(expr: &str) -> Result<f64, String> {
    let mut parser = ExprParser {
        chars: expr.chars().peekable(),
    };
    let value = parser.expr()?;
    parser.skip_ws();
    match parser.chars.peek() {
        None => Ok(value),
        Some(c) => Err(format!("Unexpected character: '{c}'")),
    }
}

struct ExprParser<'a> {
    chars: Peekable<Chars<'a>>,
}

impl ExprParser<'_> {
    fn skip_ws(&mut self) {
        while self.chars.peek().is_some_and(|c| c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.chars.peek() == Some(&expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    // expr = term (('+' | '-') term)*
    fn expr(&mut self) -> Result<f64, String> {
        let mut acc = self.term()?;
        loop {
            if self.eat('+') {
                acc += self.term()?;
            } else if self.eat('-') {
                acc -= self.term()?;
            } else {
                return Ok(acc);
            }
        }
    }

    // term = factor (('*' | '/') factor)*
    fn term(&mut self) -> Result<f64, String> {
        let mut acc = self.factor()?;
        loop {
            if self.eat('*') {
                acc *= self.factor()?;
            } else if self.eat('/') {
                let divisor = self.factor()?;
                if divisor == 0.0 {
                    return Err("Division by zero".into());
                }
                acc /= divisor;
            } else {
                return Ok(acc);
            }
        }
    }

    // factor = '-' factor | '(' expr ')' | number
    fn factor(&mut self) -> Result<f64, String> {
        if self.eat('-') {
            return Ok(-self.factor()?);
        }
        if self.eat('(') {
            let inner = self.expr()?;
            if !self.eat(')') {
                return Err("Expected closing parenthesis".into());
            }
            return Ok(inner);
        }
        self.number()
    }

    fn number(&mut self) -> Result<f64, String> {
        self.skip_ws();
        let mut digits = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                digits.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        if digits.is_empty() {
            return match self.chars.peek() {
                Some(c) => Err(format!("Unexpected character: '{c}'")),
                None => Err("Unexpected end of expression".into()),
            };
        }
        digits
            .parse()
            .map_err(|_| format!("Invalid number: {digits}"))
    }
}

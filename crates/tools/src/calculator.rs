//! Calculator tool: evaluates arithmetic and percentage changes.
//!
//! Supports `+`, `-`, `*`, `/`, `%` (remainder), `^` (power, right
//! associative), parentheses and unary negation through a
//! recursive-descent parser. The `percent_change` operation computes
//! `(to - from) / from * 100`.

use async_trait::async_trait;
use marlin_core::error::ToolError;
use marlin_core::tool::{Tool, ToolResult};

use crate::validation::{check_limits, required_f64, required_str};

pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate a mathematical expression (+, -, *, /, %, ^, parentheses) or compute the \
         percentage change between two values."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "operation": {
                    "type": "string",
                    "enum": ["evaluate", "percent_change"],
                    "description": "What to compute (default 'evaluate')",
                    "default": "evaluate"
                },
                "expression": {
                    "type": "string",
                    "description": "For 'evaluate': the expression, e.g. '(2 + 3) * 4'"
                },
                "from": {
                    "type": "number",
                    "description": "For 'percent_change': the earlier value"
                },
                "to": {
                    "type": "number",
                    "description": "For 'percent_change': the later value"
                }
            }
        })
    }

    fn capabilities(&self) -> Vec<String> {
        [
            "calculate", "calculator", "compute", "math", "percent", "percentage", "change",
            "difference", "ratio", "sum", "average", "growth", "vs",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        check_limits(&arguments)?;
        let operation = arguments["operation"].as_str().unwrap_or("evaluate");

        let outcome = match operation {
            "evaluate" => {
                let expr = required_str(&arguments, "expression")?;
                evaluate(expr).map(|value| (value, format_number(value)))
            }
            "percent_change" => {
                let from = required_f64(&arguments, "from")?;
                let to = required_f64(&arguments, "to")?;
                percent_change(from, to).map(|value| (value, format!("{value:.2}%")))
            }
            other => {
                return Err(ToolError::InvalidArguments(format!(
                    "Unknown operation '{other}'; expected 'evaluate' or 'percent_change'"
                )));
            }
        };

        Ok(match outcome {
            Ok((value, formatted)) => ToolResult::success(serde_json::json!({
                "result": value,
                "formatted": formatted,
            })),
            Err(e) => ToolResult::failure(format!("Error: {e}")),
        })
    }
}

/// Percentage change from `from` to `to`.
pub fn percent_change(from: f64, to: f64) -> Result<f64, String> {
    if from == 0.0 {
        return Err("Percentage change from zero is undefined".into());
    }
    Ok((to - from) / from.abs() * 100.0)
}

// Trailing `.0` dropped for integers.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

// ── Recursive-descent expression evaluator ────────────────────────────────

/// Evaluate a mathematical expression string.
pub fn evaluate(expr: &str) -> Result<f64, String> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser::new(&tokens);
    let result = parser.parse_expr()?;
    if let Some(tok) = parser.peek() {
        return Err(format!("Unexpected token at position {}: {tok:?}", parser.pos));
    }
    if !result.is_finite() {
        return Err("Result is not a finite number".into());
    }
    Ok(result)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        let simple = match c {
            c if c.is_whitespace() => None,
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' => Some(Token::Star),
            '/' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            '^' => Some(Token::Caret),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            c if c.is_ascii_digit() || c == '.' => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if !(d.is_ascii_digit() || d == '.') {
                        break;
                    }
                    end = i + d.len_utf8();
                    chars.next();
                }
                let literal = &input[start..end];
                let num: f64 = literal
                    .parse()
                    .map_err(|_| format!("Invalid number: {literal}"))?;
                tokens.push(Token::Number(num));
                continue;
            }
            c => return Err(format!("Unexpected character: '{c}'")),
        };
        if let Some(tok) = simple {
            tokens.push(tok);
        }
        chars.next();
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<&'a Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    // expr = term (('+' | '-') term)*
    fn parse_expr(&mut self) -> Result<f64, String> {
        let mut left = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.consume();
                    left += self.parse_term()?;
                }
                Some(Token::Minus) => {
                    self.consume();
                    left -= self.parse_term()?;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    // term = unary (('*' | '/' | '%') unary)*
    fn parse_term(&mut self) -> Result<f64, String> {
        let mut left = self.parse_unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.consume();
                    left *= self.parse_unary()?;
                }
                Some(Token::Slash) => {
                    self.consume();
                    let right = self.parse_unary()?;
                    if right == 0.0 {
                        return Err("Division by zero".into());
                    }
                    left /= right;
                }
                Some(Token::Percent) => {
                    self.consume();
                    let right = self.parse_unary()?;
                    if right == 0.0 {
                        return Err("Remainder by zero".into());
                    }
                    left %= right;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    // unary = '-' unary | power
    fn parse_unary(&mut self) -> Result<f64, String> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            return Ok(-self.parse_unary()?);
        }
        self.parse_power()
    }

    // power = primary ('^' unary)?
    fn parse_power(&mut self) -> Result<f64, String> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    // primary = NUMBER | '(' expr ')'
    fn parse_primary(&mut self) -> Result<f64, String> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(*n),
            Some(Token::LParen) => {
                let val = self.parse_expr()?;
                match self.consume() {
                    Some(Token::RParen) => Ok(val),
                    _ => Err("Expected closing parenthesis".into()),
                }
            }
            Some(tok) => Err(format!("Unexpected token: {tok:?}")),
            None => Err("Unexpected end of expression".into()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

//! Restricted condition evaluator for conditional steps.
//!
//! Conditions are boolean expressions over resolved `${...}` references and
//! literals, with comparison operators (`==`, `!=`, `>`, `>=`, `<`, `<=`),
//! logical operators (`&&`, `||`, `!`), and nothing else. The grammar is
//! deliberately closed: no parentheses, no function calls, no arithmetic,
//! no bare identifiers. There is no code-execution surface here -- the
//! evaluator never touches anything outside the run context.
//!
//! Precedence, loosest first: `||`, `&&`, comparisons, unary `!`.
//! Comparisons do not chain (`a > b > c` is an error). `&&` and `||`
//! short-circuit: a skipped operand must still parse, but its references
//! are never resolved and its types are not checked.

use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::EngineError;
use crate::resolver;

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ref(String),
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    AndAnd,
    OrOr,
    Bang,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Ref(path) => write!(f, "${{{path}}}"),
            Token::Number(n) => write!(f, "{n}"),
            Token::Str(s) => write!(f, "'{s}'"),
            Token::Bool(b) => write!(f, "{b}"),
            Token::Null => write!(f, "null"),
            Token::AndAnd => write!(f, "&&"),
            Token::OrOr => write!(f, "||"),
            Token::Bang => write!(f, "!"),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
        }
    }
}

fn tokenize(expression: &str) -> Result<Vec<Token>, EngineError> {
    let error = |reason: String| EngineError::Evaluation {
        expression: expression.to_string(),
        reason,
    };

    let chars: Vec<char> = expression.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,

            '(' | ')' => {
                return Err(error(
                    "parentheses are not supported in conditions".to_string(),
                ));
            }

            '$' => {
                if chars.get(i + 1) != Some(&'{') {
                    return Err(error("'$' must start a '${...}' reference".to_string()));
                }
                let start = i + 2;
                let mut j = start;
                while j < chars.len() && chars[j] != '}' {
                    j += 1;
                }
                if j == chars.len() {
                    return Err(error("unterminated '${' reference".to_string()));
                }
                let path: String = chars[start..j].iter().collect();
                tokens.push(Token::Ref(path.trim().to_string()));
                i = j + 1;
            }

            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j == chars.len() {
                    return Err(error("unterminated string literal".to_string()));
                }
                tokens.push(Token::Str(chars[start..j].iter().collect()));
                i = j + 1;
            }

            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err(error("single '&' is not an operator".to_string()));
                }
            }

            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err(error("single '|' is not an operator".to_string()));
                }
            }

            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(error("'=' is not an operator (did you mean '==')".to_string()));
                }
            }

            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }

            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }

            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }

            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                let mut j = i + 1;
                while j < chars.len() && (chars[j].is_ascii_digit() || chars[j] == '.') {
                    j += 1;
                }
                let text: String = chars[start..j].iter().collect();
                let number: f64 = text
                    .parse()
                    .map_err(|_| error(format!("invalid number literal '{text}'")))?;
                tokens.push(Token::Number(number));
                i = j;
            }

            c if c.is_ascii_alphabetic() => {
                let start = i;
                let mut j = i + 1;
                while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
                    j += 1;
                }
                let word: String = chars[start..j].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    "null" => tokens.push(Token::Null),
                    other => {
                        return Err(error(format!(
                            "bare identifier '{other}' is not allowed (references use '${{...}}')"
                        )));
                    }
                }
                i = j;
            }

            other => {
                return Err(error(format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser / evaluator
// ---------------------------------------------------------------------------

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    ctx: &'a ExecutionContext,
    /// True while parsing an operand whose value cannot affect the result
    /// (`true || rhs`, `false && rhs`). The operand must still parse, but
    /// its references are not resolved and its types are not checked.
    skipping: bool,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: String) -> EngineError {
        EngineError::Evaluation {
            expression: self.expression.to_string(),
            reason,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    /// or_expr := and_expr ( "||" and_expr )*  -- short-circuits.
    fn parse_or(&mut self) -> Result<Value, EngineError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.advance();
            let lhs_bool = self.require_bool(&lhs, "||")?;
            let outer = self.skipping;
            self.skipping = outer || lhs_bool;
            let rhs = self.parse_and()?;
            self.skipping = outer;
            lhs = if lhs_bool {
                Value::Bool(true)
            } else {
                Value::Bool(self.require_bool(&rhs, "||")?)
            };
        }
        Ok(lhs)
    }

    /// and_expr := cmp_expr ( "&&" cmp_expr )*  -- short-circuits.
    fn parse_and(&mut self) -> Result<Value, EngineError> {
        let mut lhs = self.parse_comparison()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.advance();
            let lhs_bool = self.require_bool(&lhs, "&&")?;
            let outer = self.skipping;
            self.skipping = outer || !lhs_bool;
            let rhs = self.parse_comparison()?;
            self.skipping = outer;
            lhs = if lhs_bool {
                Value::Bool(self.require_bool(&rhs, "&&")?)
            } else {
                Value::Bool(false)
            };
        }
        Ok(lhs)
    }

    /// cmp_expr := unary ( cmp_op unary )?  -- comparisons do not chain.
    fn parse_comparison(&mut self) -> Result<Value, EngineError> {
        let lhs = self.parse_unary()?;

        let op = match self.peek() {
            Some(
                token @ (Token::Eq | Token::Ne | Token::Gt | Token::Ge | Token::Lt | Token::Le),
            ) => token.clone(),
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_unary()?;

        // Reject a > b > c outright rather than mis-parsing it.
        if let Some(
            next @ (Token::Eq | Token::Ne | Token::Gt | Token::Ge | Token::Lt | Token::Le),
        ) = self.peek()
        {
            return Err(self.error(format!(
                "comparison operators do not chain (found '{next}' after a comparison)"
            )));
        }

        if self.skipping {
            return Ok(Value::Bool(false));
        }

        let result = match op {
            Token::Eq => values_equal(&lhs, &rhs),
            Token::Ne => !values_equal(&lhs, &rhs),
            Token::Gt | Token::Ge | Token::Lt | Token::Le => {
                let (a, b) = match (lhs.as_f64(), rhs.as_f64()) {
                    (Some(a), Some(b)) => (a, b),
                    _ => {
                        return Err(self.error(format!(
                            "'{op}' requires numbers, got {} and {}",
                            type_name(&lhs),
                            type_name(&rhs)
                        )));
                    }
                };
                match op {
                    Token::Gt => a > b,
                    Token::Ge => a >= b,
                    Token::Lt => a < b,
                    Token::Le => a <= b,
                    _ => unreachable!(),
                }
            }
            _ => unreachable!(),
        };

        Ok(Value::Bool(result))
    }

    /// unary := "!" unary | atom
    fn parse_unary(&mut self) -> Result<Value, EngineError> {
        if self.peek() == Some(&Token::Bang) {
            self.advance();
            let operand = self.parse_unary()?;
            let value = self.require_bool(&operand, "!")?;
            return Ok(Value::Bool(!value));
        }
        self.parse_atom()
    }

    /// atom := number | string | true | false | null | ${ref}
    fn parse_atom(&mut self) -> Result<Value, EngineError> {
        match self.advance() {
            Some(Token::Number(n)) => {
                Ok(serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null))
            }
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Bool(b)) => Ok(Value::Bool(b)),
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::Ref(path)) => {
                if self.skipping {
                    Ok(Value::Null)
                } else {
                    resolver::resolve_path(&path, self.ctx)
                }
            }
            Some(other) => Err(self.error(format!("expected a value, found '{other}'"))),
            None => Err(self.error("expression ended where a value was expected".to_string())),
        }
    }

    fn require_bool(&self, value: &Value, operator: &str) -> Result<bool, EngineError> {
        if self.skipping {
            return Ok(false);
        }
        value.as_bool().ok_or_else(|| {
            self.error(format!(
                "'{operator}' requires booleans, got {}",
                type_name(value)
            ))
        })
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    // Numbers compare numerically so 1 == 1.0 regardless of representation.
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    a == b
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Syntax-only check used at definition load time: tokenizes the condition
/// so malformed expressions (parentheses, bare identifiers, bad operators)
/// fail validation instead of surfacing mid-run. Reference resolution and
/// typing still happen at evaluation time.
pub fn check_syntax(expression: &str) -> Result<(), EngineError> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(EngineError::Evaluation {
            expression: expression.to_string(),
            reason: "empty condition".to_string(),
        });
    }
    Ok(())
}

/// Evaluate a condition expression to a boolean against the run context.
///
/// Reference failures surface as reference errors; anything structural or
/// type-related is an evaluation error naming the expression.
pub fn evaluate_condition(expression: &str, ctx: &ExecutionContext) -> Result<bool, EngineError> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(EngineError::Evaluation {
            expression: expression.to_string(),
            reason: "empty condition".to_string(),
        });
    }

    let mut parser = Parser {
        expression,
        tokens,
        pos: 0,
        ctx,
        skipping: false,
    };
    let result = parser.parse_or()?;

    if parser.pos != parser.tokens.len() {
        let trailing = &parser.tokens[parser.pos];
        return Err(parser.error(format!("unexpected trailing '{trailing}'")));
    }

    result
        .as_bool()
        .ok_or_else(|| parser.error(format!("condition evaluated to {}, not a boolean", type_name(&result))))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

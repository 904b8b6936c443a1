//! Install/detect condition evaluation against the variable store.
//!
//! Grammar: bare variable references, quoted string literals, integer
//! and `vX.Y.Z.W` version literals, comparison operators
//! (`=`, `<>`, `<`, `>`, `<=`, `>=`), unary `NOT`, infix `AND`/`OR`
//! (keywords case-insensitive), and parentheses. A bare variable is
//! truthy when it exists and is non-zero / non-empty. Comparisons
//! coerce the right operand to the left operand's type.

use crate::{
    error::{EmberError, EmberResult},
    variable::{VariableValue, Variables},
    version::Version,
};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(i64),
    Version(Version),
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
    Not,
    Open,
    Close,
}

#[derive(Debug, Clone)]
enum Expr {
    Operand(Operand),
    Compare(Operand, CompareOp, Operand),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone)]
enum Operand {
    Variable(String),
    Literal(VariableValue),
}

#[derive(Debug, Clone, Copy)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

/// Evaluates `condition` against `variables`. An empty or whitespace
/// condition is vacuously true.
pub fn evaluate(condition: &str, variables: &Variables) -> EmberResult<bool> {
    if condition.trim().is_empty() {
        return Ok(true);
    }

    let tokens = tokenize(condition)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(EmberError::Condition(format!(
            "unexpected trailing input in condition '{condition}'"
        )));
    }
    eval_expr(&expr, variables)
}

fn tokenize(input: &str) -> EmberResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '<' => {
                chars.next();
                match chars.peek() {
                    Some('>') => {
                        chars.next();
                        tokens.push(Token::Ne);
                    }
                    Some('=') => {
                        chars.next();
                        tokens.push(Token::Le);
                    }
                    _ => tokens.push(Token::Lt),
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => value.push(c),
                        None => {
                            return Err(EmberError::Condition(
                                "unterminated string literal".to_string(),
                            ))
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut value = String::new();
                value.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        value.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = value.parse::<i64>().map_err(|_| {
                    EmberError::Condition(format!("invalid number '{value}'"))
                })?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut word = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' || d == '.' {
                        word.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.to_ascii_uppercase().as_str() {
                    "AND" => tokens.push(Token::And),
                    "OR" => tokens.push(Token::Or),
                    "NOT" => tokens.push(Token::Not),
                    _ => {
                        // vX.Y version literal
                        if word.starts_with('v')
                            && word.len() > 1
                            && word[1..].chars().all(|c| c.is_ascii_digit() || c == '.')
                        {
                            tokens.push(Token::Version(word.parse()?));
                        } else {
                            tokens.push(Token::Ident(word));
                        }
                    }
                }
            }
            other => {
                return Err(EmberError::Condition(format!(
                    "unexpected character '{other}'"
                )))
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> EmberResult<Expr> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> EmberResult<Expr> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> EmberResult<Expr> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> EmberResult<Expr> {
        if matches!(self.peek(), Some(Token::Open)) {
            self.next();
            let inner = self.parse_or()?;
            match self.next() {
                Some(Token::Close) => return Ok(inner),
                _ => {
                    return Err(EmberError::Condition(
                        "expected closing parenthesis".to_string(),
                    ))
                }
            }
        }

        let left = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Ne) => CompareOp::Ne,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::Le) => CompareOp::Le,
            Some(Token::Ge) => CompareOp::Ge,
            _ => return Ok(Expr::Operand(left)),
        };
        self.next();
        let right = self.parse_operand()?;
        Ok(Expr::Compare(left, op, right))
    }

    fn parse_operand(&mut self) -> EmberResult<Operand> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(Operand::Variable(name)),
            Some(Token::Str(value)) => Ok(Operand::Literal(VariableValue::String(value))),
            Some(Token::Number(value)) => Ok(Operand::Literal(VariableValue::Numeric(value))),
            Some(Token::Version(value)) => Ok(Operand::Literal(VariableValue::Version(value))),
            other => Err(EmberError::Condition(format!(
                "expected operand, found {other:?}"
            ))),
        }
    }
}

fn operand_value(operand: &Operand, variables: &Variables) -> VariableValue {
    match operand {
        Operand::Literal(value) => value.clone(),
        Operand::Variable(name) => variables.get_value(name).unwrap_or(VariableValue::None),
    }
}

fn truthy(value: &VariableValue) -> bool {
    match value {
        VariableValue::None => false,
        VariableValue::Numeric(n) => *n != 0,
        VariableValue::String(s) => !s.is_empty(),
        VariableValue::Version(v) => v.as_raw() != 0,
    }
}

fn eval_expr(expr: &Expr, variables: &Variables) -> EmberResult<bool> {
    match expr {
        Expr::Operand(operand) => Ok(truthy(&operand_value(operand, variables))),
        Expr::Not(inner) => Ok(!eval_expr(inner, variables)?),
        Expr::And(left, right) => {
            Ok(eval_expr(left, variables)? && eval_expr(right, variables)?)
        }
        Expr::Or(left, right) => {
            Ok(eval_expr(left, variables)? || eval_expr(right, variables)?)
        }
        Expr::Compare(left, op, right) => {
            let left = operand_value(left, variables);
            let right = operand_value(right, variables);
            let ordering = compare(&left, &right)?;
            Ok(match op {
                CompareOp::Eq => ordering == std::cmp::Ordering::Equal,
                CompareOp::Ne => ordering != std::cmp::Ordering::Equal,
                CompareOp::Lt => ordering == std::cmp::Ordering::Less,
                CompareOp::Gt => ordering == std::cmp::Ordering::Greater,
                CompareOp::Le => ordering != std::cmp::Ordering::Greater,
                CompareOp::Ge => ordering != std::cmp::Ordering::Less,
            })
        }
    }
}

/// Compares with coercion toward the left operand's type. A type-none
/// operand compares as the neutral value of the other side's type.
fn compare(
    left: &VariableValue,
    right: &VariableValue,
) -> EmberResult<std::cmp::Ordering> {
    use VariableValue::*;

    Ok(match (left, right) {
        (Numeric(a), b) => a.cmp(&coerce_numeric(b)?),
        (Version(a), b) => a.cmp(&coerce_version(b)?),
        (String(a), String(b)) => a.cmp(b),
        (String(a), Numeric(b)) => a.cmp(&b.to_string()),
        (String(a), Version(b)) => a.cmp(&b.to_string()),
        (None, b) => match b {
            Numeric(_) => 0i64.cmp(&coerce_numeric(b)?),
            Version(_) => crate::version::Version::default().cmp(&coerce_version(b)?),
            String(s) => "".cmp(s.as_str()),
            None => std::cmp::Ordering::Equal,
        },
        (a, None) => compare(&None, a)?.reverse(),
    })
}

fn coerce_numeric(value: &VariableValue) -> EmberResult<i64> {
    match value {
        VariableValue::Numeric(n) => Ok(*n),
        VariableValue::Version(v) => Ok(v.as_raw() as i64),
        VariableValue::String(s) => s.trim().parse::<i64>().map_err(|_| {
            EmberError::Condition(format!("cannot compare '{s}' as a number"))
        }),
        VariableValue::None => Ok(0),
    }
}

fn coerce_version(value: &VariableValue) -> EmberResult<Version> {
    match value {
        VariableValue::Version(v) => Ok(*v),
        VariableValue::Numeric(n) => Ok(Version::from_raw(*n as u64)),
        VariableValue::String(s) => s.parse(),
        VariableValue::None => Ok(Version::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::evaluate;
    use crate::variable::Variables;

    fn store() -> Variables {
        let vars = Variables::empty();
        vars.set_numeric("Installed", 1, false).unwrap();
        vars.set_numeric("Zero", 0, false).unwrap();
        vars.set_string("Edition", "pro", false).unwrap();
        vars.set_version("OsVer", "6.2.0.0".parse().unwrap(), false)
            .unwrap();
        vars
    }

    #[test]
    fn test_empty_condition_is_true() {
        assert!(evaluate("", &store()).unwrap());
        assert!(evaluate("   ", &store()).unwrap());
    }

    #[test]
    fn test_bare_variable_truthiness() {
        let vars = store();
        assert!(evaluate("Installed", &vars).unwrap());
        assert!(!evaluate("Zero", &vars).unwrap());
        assert!(!evaluate("Missing", &vars).unwrap());
    }

    #[test]
    fn test_comparisons() {
        let vars = store();
        assert!(evaluate("Installed = 1", &vars).unwrap());
        assert!(evaluate("Installed <> 0", &vars).unwrap());
        assert!(evaluate("Edition = \"pro\"", &vars).unwrap());
        assert!(evaluate("OsVer >= v6.1", &vars).unwrap());
        assert!(!evaluate("OsVer > v6.2", &vars).unwrap());
    }

    #[test]
    fn test_boolean_operators_and_precedence() {
        let vars = store();
        assert!(evaluate("Installed = 1 AND Edition = \"pro\"", &vars).unwrap());
        assert!(evaluate("Zero = 1 OR Installed = 1", &vars).unwrap());
        assert!(evaluate("NOT Zero", &vars).unwrap());
        // AND binds tighter than OR
        assert!(evaluate("Zero AND Missing OR Installed", &vars).unwrap());
        assert!(evaluate("not (installed and Zero)", &vars).unwrap());
    }

    #[test]
    fn test_missing_variable_compares_as_neutral() {
        let vars = store();
        assert!(evaluate("Missing = 0", &vars).unwrap());
        assert!(evaluate("Missing = \"\"", &vars).unwrap());
    }

    #[test]
    fn test_parse_errors() {
        let vars = store();
        assert!(evaluate("(Installed", &vars).is_err());
        assert!(evaluate("Installed = ", &vars).is_err());
        assert!(evaluate("\"open", &vars).is_err());
        assert!(evaluate("Installed ? 1", &vars).is_err());
    }
}

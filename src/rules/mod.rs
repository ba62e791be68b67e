// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 cilocal contributors

//! Rule evaluation
//!
//! Decides a job's `when` and `allow_failure` from its ordered rule list.
//! The `if:` grammar is tokenized and evaluated directly; no substring of
//! user input ever reaches a shell or interpreter.
//!
//! Grammar: operands are `$VAR`, quoted strings, `null` and `/regex/`
//! literals; operators `==`, `!=`, `=~`, `!~` joined by `&&`/`||` with
//! left-to-right evaluation and no precedence distinction; parentheses
//! group.

use regex::Regex;

use crate::errors::{CilocalError, CilocalResult};
use crate::pipeline::config::RuleSpec;
use crate::pipeline::job::When;
use crate::variables::Scope;

/// Result of evaluating a rule list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    pub when: When,
    pub allow_failure: bool,
}

/// Evaluate an ordered rule list under `scope`.
///
/// The first matching rule contributes its `when` (default `on_success`)
/// and `allow_failure` (default `false`). A rule without `if:` always
/// matches. No match at all yields `when: never`.
pub fn evaluate(rules: &[RuleSpec], scope: &Scope) -> CilocalResult<RuleOutcome> {
    for rule in rules {
        let matched = match &rule.if_expr {
            Some(expr) => evaluate_if(expr, scope)?,
            None => true,
        };

        if matched {
            let when = match &rule.when {
                Some(w) => When::parse(w)?,
                None => When::OnSuccess,
            };
            return Ok(RuleOutcome {
                when,
                allow_failure: rule.allow_failure.unwrap_or(false),
            });
        }
    }

    Ok(RuleOutcome {
        when: When::Never,
        allow_failure: false,
    })
}

/// Evaluate a single `if:` expression to a boolean.
pub fn evaluate_if(expr: &str, scope: &Scope) -> CilocalResult<bool> {
    let tokens = tokenize(expr).map_err(|message| CilocalError::RuleSyntax {
        expression: expr.to_string(),
        message,
    })?;

    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        scope,
    };

    let value = parser.expression().map_err(|message| CilocalError::RuleSyntax {
        expression: expr.to_string(),
        message,
    })?;

    if parser.pos != tokens.len() {
        return Err(CilocalError::RuleSyntax {
            expression: expr.to_string(),
            message: "trailing tokens after expression".to_string(),
        });
    }

    Ok(value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Var(String),
    Str(String),
    Regex(String),
    Null,
    Eq,
    Ne,
    Match,
    NotMatch,
    And,
    Or,
    LParen,
    RParen,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '$' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
                {
                    end += 1;
                }
                if end == start {
                    return Err("'$' must be followed by a variable name".to_string());
                }
                tokens.push(Token::Var(chars[start..end].iter().collect()));
                i = end;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end == chars.len() {
                    return Err("unterminated string literal".to_string());
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '/' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && !(chars[end] == '/' && chars[end - 1] != '\\') {
                    end += 1;
                }
                if end == chars.len() {
                    return Err("unterminated regex literal".to_string());
                }
                let pattern: String = chars[start..end].iter().collect();
                // Optional trailing flags; only `i` is honored.
                let mut flags_end = end + 1;
                let mut insensitive = false;
                while flags_end < chars.len() && chars[flags_end].is_ascii_alphabetic() {
                    if chars[flags_end] == 'i' {
                        insensitive = true;
                    }
                    flags_end += 1;
                }
                let pattern = if insensitive {
                    format!("(?i){pattern}")
                } else {
                    pattern
                };
                tokens.push(Token::Regex(pattern));
                i = flags_end;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else if chars.get(i + 1) == Some(&'~') {
                    tokens.push(Token::Match);
                    i += 2;
                } else {
                    return Err("expected '==' or '=~'".to_string());
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else if chars.get(i + 1) == Some(&'~') {
                    tokens.push(Token::NotMatch);
                    i += 2;
                } else {
                    return Err("expected '!=' or '!~'".to_string());
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err("expected '&&'".to_string());
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err("expected '||'".to_string());
                }
            }
            _ if c.is_ascii_alphabetic() => {
                let start = i;
                let mut end = i;
                while end < chars.len() && chars[end].is_ascii_alphanumeric() {
                    end += 1;
                }
                let word: String = chars[start..end].iter().collect();
                if word == "null" {
                    tokens.push(Token::Null);
                    i = end;
                } else {
                    return Err(format!("unexpected word '{word}'"));
                }
            }
            _ => return Err(format!("unexpected character '{c}'")),
        }
    }

    Ok(tokens)
}

/// Operand of a comparison
enum Operand {
    /// A string value or null; variables resolve here
    Value(Option<String>),
    /// A regex literal, only valid on the right of `=~`/`!~`
    Pattern(String),
    /// The result of a parenthesized sub-expression
    Bool(bool),
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    scope: &'a Scope,
}

impl<'a> Parser<'a> {
    /// Comparisons joined by `&&`/`||`, strictly left-to-right.
    fn expression(&mut self) -> Result<bool, String> {
        let mut acc = self.comparison()?;

        while let Some(token) = self.tokens.get(self.pos) {
            match token {
                Token::And => {
                    self.pos += 1;
                    let rhs = self.comparison()?;
                    acc = acc && rhs;
                }
                Token::Or => {
                    self.pos += 1;
                    let rhs = self.comparison()?;
                    acc = acc || rhs;
                }
                _ => break,
            }
        }

        Ok(acc)
    }

    fn comparison(&mut self) -> Result<bool, String> {
        let left = self.operand()?;

        match self.tokens.get(self.pos) {
            Some(Token::Eq) => {
                self.pos += 1;
                let right = self.operand()?;
                Ok(Self::value_of(left)? == Self::value_of(right)?)
            }
            Some(Token::Ne) => {
                self.pos += 1;
                let right = self.operand()?;
                Ok(Self::value_of(left)? != Self::value_of(right)?)
            }
            Some(Token::Match) => {
                self.pos += 1;
                self.regex_match(left, false)
            }
            Some(Token::NotMatch) => {
                self.pos += 1;
                self.regex_match(left, true)
            }
            _ => Self::truthy(left),
        }
    }

    fn operand(&mut self) -> Result<Operand, String> {
        let token = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| "unexpected end of expression".to_string())?;
        self.pos += 1;

        match token {
            Token::Var(name) => Ok(Operand::Value(self.scope.get(name).cloned())),
            Token::Str(s) => Ok(Operand::Value(Some(s.clone()))),
            Token::Null => Ok(Operand::Value(None)),
            Token::Regex(p) => Ok(Operand::Pattern(p.clone())),
            Token::LParen => {
                let value = self.expression()?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(Operand::Bool(value))
                    }
                    _ => Err("expected ')'".to_string()),
                }
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }

    fn regex_match(&mut self, left: Operand, negate: bool) -> Result<bool, String> {
        let pattern = match self.operand()? {
            Operand::Pattern(p) => p,
            Operand::Value(Some(s)) => s,
            _ => return Err("right side of '=~' must be a regex".to_string()),
        };

        let subject = match left {
            Operand::Value(Some(s)) => s,
            // null on the left short-circuits to false for both =~ and !~
            Operand::Value(None) => return Ok(false),
            _ => return Err("left side of '=~' must be a string".to_string()),
        };

        let regex = Regex::new(&pattern).map_err(|e| format!("invalid regex: {e}"))?;
        let matched = regex.is_match(&subject);
        Ok(if negate { !matched } else { matched })
    }

    fn value_of(op: Operand) -> Result<Option<String>, String> {
        match op {
            Operand::Value(v) => Ok(v),
            Operand::Pattern(_) => Err("regex literal only valid with '=~' or '!~'".to_string()),
            Operand::Bool(_) => Err("cannot compare a grouped expression to a value".to_string()),
        }
    }

    fn truthy(op: Operand) -> Result<bool, String> {
        match op {
            Operand::Value(Some(s)) => Ok(!s.is_empty()),
            Operand::Value(None) => Ok(false),
            Operand::Bool(b) => Ok(b),
            Operand::Pattern(_) => Err("regex literal cannot stand alone".to_string()),
        }
    }
}

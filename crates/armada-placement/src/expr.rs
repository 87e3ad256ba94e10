//! Constraint and affinity expressions: `key==value`, `key!=value`, and the
//! soft forms `key==~value` / `key!=~value`.
//!
//! A value is matched as a case-insensitive glob (`*` wildcard) unless it is
//! wrapped in slashes, in which case it is a regular expression.

use regex::Regex;

use crate::error::{PlacementError, PlacementResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub key: String,
    pub op: Op,
    pub value: String,
    /// Soft expressions are dropped when they would leave no candidate.
    pub soft: bool,
    matcher: Regex,
}

impl Expr {
    pub fn parse(input: &str) -> PlacementResult<Self> {
        let invalid = |reason: &str| PlacementError::InvalidExpression {
            expr: input.to_string(),
            reason: reason.to_string(),
        };

        let (idx, op) = match (input.find("=="), input.find("!=")) {
            (Some(a), Some(b)) if b < a => (b, Op::Ne),
            (Some(a), _) => (a, Op::Eq),
            (None, Some(b)) => (b, Op::Ne),
            (None, None) => return Err(invalid("missing operator")),
        };

        let key = input[..idx].trim();
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(invalid("bad key"));
        }

        let mut value = &input[idx + 2..];
        let soft = value.starts_with('~');
        if soft {
            value = &value[1..];
        }
        let value = value.trim();
        if value.is_empty() {
            return Err(invalid("empty value"));
        }

        let pattern = if value.len() > 2 && value.starts_with('/') && value.ends_with('/') {
            value[1..value.len() - 1].to_string()
        } else {
            let quoted = regex::escape(value).replace(r"\*", ".*");
            format!("(?i)^{quoted}$")
        };
        let matcher = Regex::new(&pattern).map_err(|e| invalid(&e.to_string()))?;

        Ok(Self {
            key: key.to_string(),
            op,
            value: value.to_string(),
            soft,
            matcher,
        })
    }

    /// Evaluate against the values a target exposes for `key`.
    /// A target with no value for the key only satisfies `!=`.
    pub fn matches<'a>(&self, values: impl IntoIterator<Item = &'a str>) -> bool {
        let hit = values.into_iter().any(|v| self.matcher.is_match(v));
        match self.op {
            Op::Eq => hit,
            Op::Ne => !hit,
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self.op {
            Op::Eq => "==",
            Op::Ne => "!=",
        };
        let soft = if self.soft { "~" } else { "" };
        write!(f, "{}{op}{soft}{}", self.key, self.value)
    }
}

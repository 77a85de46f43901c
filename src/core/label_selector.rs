//! Kubernetes-style label selector expressions.
//!
//! Supported requirement forms, comma separated and AND-combined:
//! `k=v`, `k==v`, `k!=v`, `k in (a, b)`, `k notin (a, b)`, `k` and `!k`.

use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid label selector {selector:?}: {reason}")]
pub struct SelectorParseError {
    pub selector: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, values) => labels.get(k).is_some_and(|l| values.contains(l)),
            Requirement::NotIn(k, values) => !labels.get(k).is_some_and(|l| values.contains(l)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    /// An empty selector matches every label set.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// True when `labels` satisfies every selector in `selectors`.
    pub fn matches_all(
        selectors: &[String],
        labels: &BTreeMap<String, String>,
    ) -> Result<bool, SelectorParseError> {
        for raw in selectors {
            if !raw.parse::<LabelSelector>()?.matches(labels) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason: &str| SelectorParseError {
            selector: s.to_string(),
            reason: reason.to_string(),
        };

        let mut requirements = Vec::new();
        for clause in split_clauses(s) {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            requirements.push(parse_requirement(clause).map_err(|reason| err(&reason))?);
        }
        Ok(Self { requirements })
    }
}

/// Split on commas that are not inside a `( ... )` value set.
fn split_clauses(s: &str) -> Vec<&str> {
    let mut clauses = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                clauses.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    clauses.push(&s[start..]);
    clauses
}

fn parse_requirement(clause: &str) -> Result<Requirement, String> {
    if let Some(key) = clause.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(valid_key(key)?));
    }
    if let Some((k, v)) = clause.split_once("!=") {
        return Ok(Requirement::NotEquals(valid_key(k)?, v.trim().to_string()));
    }
    if let Some((k, v)) = clause.split_once("==") {
        return Ok(Requirement::Equals(valid_key(k)?, v.trim().to_string()));
    }
    if let Some((k, v)) = clause.split_once('=') {
        return Ok(Requirement::Equals(valid_key(k)?, v.trim().to_string()));
    }
    if let Some(open) = clause.find('(') {
        let head: Vec<&str> = clause[..open].split_whitespace().collect();
        let values = clause[open + 1..]
            .strip_suffix(')')
            .ok_or_else(|| "unterminated value set".to_string())?
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        return match head.as_slice() {
            [key, "in"] => Ok(Requirement::In(valid_key(key)?, values)),
            [key, "notin"] => Ok(Requirement::NotIn(valid_key(key)?, values)),
            _ => Err("expected `in` or `notin` before value set".to_string()),
        };
    }
    Ok(Requirement::Exists(valid_key(clause)?))
}

fn valid_key(key: &str) -> Result<String, String> {
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(format!("invalid key {key:?}"));
    }
    Ok(key.to_string())
}

//! Kubernetes-style label selectors: `a=b,c!=d,e in (x,y),f notin (z),g,!h`.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches<'a, F>(&self, get: &F) -> bool
    where
        F: Fn(&str) -> Option<&'a str>,
    {
        match self {
            Requirement::Equals(k, v) => get(k) == Some(v.as_str()),
            // `!=` and `notin` also match objects without the key
            Requirement::NotEquals(k, v) => get(k) != Some(v.as_str()),
            Requirement::In(k, vs) => get(k).map(|x| vs.iter().any(|v| v == x)).unwrap_or(false),
            Requirement::NotIn(k, vs) => get(k).map(|x| !vs.iter().any(|v| v == x)).unwrap_or(true),
            Requirement::Exists(k) => get(k).is_some(),
            Requirement::DoesNotExist(k) => get(k).is_none(),
        }
    }
}

/// Conjunction of requirements. The empty selector matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LabelSelector {
    pub requirements: Vec<Requirement>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("empty key in requirement {0:?}")]
    EmptyKey(String),
    #[error("unterminated value set in {0:?}")]
    Unterminated(String),
    #[error("invalid requirement {0:?}")]
    Invalid(String),
}

impl LabelSelector {
    pub fn everything() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.requirements.is_empty() }

    pub fn parse(s: &str) -> Result<Self, SelectorError> {
        let mut requirements = Vec::new();
        for part in split_top_level(s)? {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            requirements.push(parse_requirement(part)?);
        }
        Ok(Self { requirements })
    }

    /// Match against a `(key, value)` label list.
    pub fn matches(&self, labels: &[(String, String)]) -> bool {
        let get = |k: &str| labels.iter().find(|(lk, _)| lk == k).map(|(_, v)| v.as_str());
        self.requirements.iter().all(|r| r.matches(&get))
    }
}

// Split on commas that are not inside a `( ... )` value set.
fn split_top_level(s: &str) -> Result<Vec<&str>, SelectorError> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(SelectorError::Invalid(s.to_string()));
                }
            }
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SelectorError::Unterminated(s.to_string()));
    }
    out.push(&s[start..]);
    Ok(out)
}

fn key_of(raw: &str, part: &str) -> Result<String, SelectorError> {
    let k = raw.trim();
    if k.is_empty() || k.contains(char::is_whitespace) {
        return Err(SelectorError::EmptyKey(part.to_string()));
    }
    Ok(k.to_string())
}

fn value_set(raw: &str, part: &str) -> Result<Vec<String>, SelectorError> {
    let raw = raw.trim();
    let inner = raw
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| SelectorError::Unterminated(part.to_string()))?;
    Ok(inner.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect())
}

fn parse_requirement(part: &str) -> Result<Requirement, SelectorError> {
    if let Some(rest) = part.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist(key_of(rest, part)?));
    }
    if let Some((k, v)) = part.split_once("!=") {
        return Ok(Requirement::NotEquals(key_of(k, part)?, v.trim().to_string()));
    }
    if let Some((k, v)) = part.split_once("==") {
        return Ok(Requirement::Equals(key_of(k, part)?, v.trim().to_string()));
    }
    if let Some((k, v)) = part.split_once('=') {
        return Ok(Requirement::Equals(key_of(k, part)?, v.trim().to_string()));
    }
    if let Some((k, v)) = part.split_once(" notin ") {
        return Ok(Requirement::NotIn(key_of(k, part)?, value_set(v, part)?));
    }
    if let Some((k, v)) = part.split_once(" in ") {
        return Ok(Requirement::In(key_of(k, part)?, value_set(v, part)?));
    }
    if part.contains('(') || part.contains(')') {
        return Err(SelectorError::Invalid(part.to_string()));
    }
    Ok(Requirement::Exists(key_of(part, part)?))
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .requirements
            .iter()
            .map(|r| match r {
                Requirement::Equals(k, v) => format!("{}={}", k, v),
                Requirement::NotEquals(k, v) => format!("{}!={}", k, v),
                Requirement::In(k, vs) => format!("{} in ({})", k, vs.join(",")),
                Requirement::NotIn(k, vs) => format!("{} notin ({})", k, vs.join(",")),
                Requirement::Exists(k) => k.clone(),
                Requirement::DoesNotExist(k) => format!("!{}", k),
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

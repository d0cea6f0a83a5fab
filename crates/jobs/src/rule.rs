//! Mutual-exclusion rules.

use std::fmt;

use serde::{Deserialize, Serialize};

use forgegen_core::{CoreError, CoreResult};

/// A resource or key that jobs contend on.
///
/// Two jobs whose rules conflict never run at the same time. `conflicts_with` is
/// reflexive for every valid rule and symmetric. A job without a rule (`None`)
/// conflicts with nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Rule {
    /// Opaque key; conflicts only with an equal key.
    Key(String),
    /// Slash-separated resource path. A folder conflicts with everything beneath
    /// it; the empty path is the workspace root.
    Resource(String),
    /// Conflicts if any member conflicts.
    Multi(Vec<Rule>),
}

impl Rule {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    /// Resource rule; accepts `/` or `\` separators and ignores empty segments.
    pub fn resource(path: impl AsRef<str>) -> Self {
        let normalized = path
            .as_ref()
            .split(['/', '\\'])
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Self::Resource(normalized)
    }

    /// Combine rules; nested multi-rules are flattened.
    pub fn multi(rules: impl IntoIterator<Item = Rule>) -> Self {
        let mut flat = Vec::new();
        for rule in rules {
            match rule {
                Rule::Multi(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        Self::Multi(flat)
    }

    pub fn conflicts_with(&self, other: &Rule) -> bool {
        match (self, other) {
            (Rule::Multi(rules), _) => rules.iter().any(|rule| rule.conflicts_with(other)),
            (_, Rule::Multi(rules)) => rules.iter().any(|rule| self.conflicts_with(rule)),
            (Rule::Key(a), Rule::Key(b)) => a == b,
            (Rule::Resource(a), Rule::Resource(b)) => {
                is_same_or_beneath(a, b) || is_same_or_beneath(b, a)
            }
            _ => false,
        }
    }

    /// Reject rules that could not conflict with themselves.
    pub fn validate(&self) -> CoreResult<()> {
        match self {
            Rule::Key(key) if key.trim().is_empty() => {
                Err(CoreError::invalid_rule("key rule must not be empty"))
            }
            Rule::Multi(rules) if rules.is_empty() => {
                Err(CoreError::invalid_rule("multi rule must have at least one member"))
            }
            Rule::Multi(rules) => rules.iter().try_for_each(Rule::validate),
            _ => Ok(()),
        }
    }
}

fn is_same_or_beneath(ancestor: &str, path: &str) -> bool {
    ancestor.is_empty()
        || path
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Key(key) => write!(f, "key:{key}"),
            Rule::Resource(path) => write!(f, "resource:/{path}"),
            Rule::Multi(rules) => {
                f.write_str("multi[")?;
                for (i, rule) in rules.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{rule}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// `conflicts_with` lifted over optional rules.
pub fn rules_conflict(a: Option<&Rule>, b: Option<&Rule>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.conflicts_with(b),
        _ => false,
    }
}

//! Family tokens: explicit, serializable job grouping.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

const WILDCARD: &str = "*";
const SUFFIX_WILDCARD: &str = ".*";

/// Token naming a family of jobs.
///
/// A job carries the tokens of every family it belongs to. A token used for
/// querying (waiting, finding, canceling) may be a pattern:
///
/// - `*` matches every family
/// - `codegen.*` matches `codegen` and any `codegen.…` family
/// - anything else matches by equality
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FamilyToken(String);

impl FamilyToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Token matching every family.
    pub fn any() -> Self {
        Self(WILDCARD.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this token is a pattern rather than a concrete family.
    pub fn is_pattern(&self) -> bool {
        self.0 == WILDCARD || self.0.ends_with(SUFFIX_WILDCARD)
    }

    /// Check that the token can be carried by a job.
    ///
    /// Membership tokens must be non-empty and must not be patterns.
    pub fn validate_membership(&self) -> CoreResult<()> {
        if self.0.trim().is_empty() {
            return Err(CoreError::invalid_family("family token must not be empty"));
        }
        if self.is_pattern() {
            return Err(CoreError::invalid_family(format!(
                "`{}` is a pattern; jobs must belong to concrete families",
                self.0
            )));
        }
        Ok(())
    }

    /// Does this (query) token select the `member` family?
    pub fn matches(&self, member: &FamilyToken) -> bool {
        if self.0 == WILDCARD {
            return true;
        }
        if let Some(prefix) = self.0.strip_suffix(SUFFIX_WILDCARD) {
            return member.0 == prefix
                || member
                    .0
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('.'));
        }
        self.0 == member.0
    }
}

impl core::fmt::Display for FamilyToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FamilyToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for FamilyToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl FromStr for FamilyToken {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(CoreError::invalid_family("family token must not be empty"));
        }
        Ok(Self::new(s))
    }
}

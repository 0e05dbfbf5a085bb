//! Structured rule violations
//!
//! Every failed rule is reported as an ordered, non-empty list of
//! [`RuleViolation`] values so callers can fix all problems in one round trip.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which rule family produced a violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleKind {
    Validity,
    Compatibility,
    Integrity,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKind::Validity => write!(f, "VALIDITY"),
            RuleKind::Compatibility => write!(f, "COMPATIBILITY"),
            RuleKind::Integrity => write!(f, "INTEGRITY"),
        }
    }
}

/// Finer classification inside a rule family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCause {
    /// Content could not be parsed at all
    ParseError,
    /// Content parsed but broke a FULL-level rule
    Semantic,
    /// Structural difference not allowed by the compatibility level
    Incompatible,
    /// A declared reference could not be resolved
    UnresolvedReference,
    /// A reference was declared more than once
    DuplicateReference,
}

/// One reason a piece of content failed a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleViolation {
    pub kind: RuleKind,
    pub cause: ViolationCause,
    /// Human-readable description
    pub description: String,
    /// Location inside the content (JSON pointer, `Message.field`, `line:col`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Zero-based index of the prior version this violation was found against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_version: Option<usize>,
}

impl RuleViolation {
    pub fn new(kind: RuleKind, cause: ViolationCause, description: impl Into<String>) -> Self {
        Self {
            kind,
            cause,
            description: description.into(),
            context: None,
            prior_version: None,
        }
    }

    pub fn parse_error(description: impl Into<String>) -> Self {
        Self::new(RuleKind::Validity, ViolationCause::ParseError, description)
    }

    pub fn semantic(description: impl Into<String>, context: impl Into<String>) -> Self {
        Self::new(RuleKind::Validity, ViolationCause::Semantic, description).at(context)
    }

    pub fn incompatible(description: impl Into<String>, context: impl Into<String>) -> Self {
        Self::new(RuleKind::Compatibility, ViolationCause::Incompatible, description).at(context)
    }

    pub fn unresolved_reference(coordinate: &str) -> Self {
        Self::new(
            RuleKind::Integrity,
            ViolationCause::UnresolvedReference,
            format!("Reference '{}' could not be resolved", coordinate),
        )
        .at(coordinate)
    }

    /// Attach a location; empty locations are ignored
    pub fn at(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        self.context = if context.is_empty() { None } else { Some(context) };
        self
    }

    pub fn against_prior(mut self, index: usize) -> Self {
        self.prior_version = Some(index);
        self
    }
}

impl fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.description)?;
        if let Some(context) = &self.context {
            write!(f, " (at {})", context)?;
        }
        if let Some(index) = self.prior_version {
            write!(f, " [prior version #{}]", index)?;
        }
        Ok(())
    }
}

/// Ordered, non-empty list of violations
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RuleViolations(Vec<RuleViolation>);

impl RuleViolations {
    /// `None` when there is nothing to report
    pub fn new(violations: Vec<RuleViolation>) -> Option<Self> {
        if violations.is_empty() {
            None
        } else {
            Some(Self(violations))
        }
    }

    pub fn single(violation: RuleViolation) -> Self {
        Self(vec![violation])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; present for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn first(&self) -> &RuleViolation {
        &self.0[0]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RuleViolation> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[RuleViolation] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<RuleViolation> {
        self.0
    }

    pub fn count_of(&self, kind: RuleKind) -> usize {
        self.0.iter().filter(|v| v.kind == kind).count()
    }

    /// Tag every violation with the prior version it was found against
    pub fn against_prior(self, index: usize) -> Self {
        Self(self.0.into_iter().map(|v| v.against_prior(index)).collect())
    }
}

impl<'a> IntoIterator for &'a RuleViolations {
    type Item = &'a RuleViolation;
    type IntoIter = std::slice::Iter<'a, RuleViolation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for RuleViolations {
    type Item = RuleViolation;
    type IntoIter = std::vec::IntoIter<RuleViolation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for RuleViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", v)?;
        }
        Ok(())
    }
}

/// Outcome of evaluating rules against content
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Verdict<T = ()> {
    Accepted(T),
    Rejected(RuleViolations),
}

impl<T> Verdict<T> {
    /// Accepted when `violations` is empty
    pub fn from_findings(value: T, violations: Vec<RuleViolation>) -> Self {
        match RuleViolations::new(violations) {
            None => Verdict::Accepted(value),
            Some(v) => Verdict::Rejected(v),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted(_))
    }

    pub fn violations(&self) -> Option<&RuleViolations> {
        match self {
            Verdict::Accepted(_) => None,
            Verdict::Rejected(v) => Some(v),
        }
    }

    pub fn into_result(self) -> Result<T, RuleViolations> {
        match self {
            Verdict::Accepted(value) => Ok(value),
            Verdict::Rejected(v) => Err(v),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Verdict<U> {
        match self {
            Verdict::Accepted(value) => Verdict::Accepted(f(value)),
            Verdict::Rejected(v) => Verdict::Rejected(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_is_not_a_violation_set() {
        assert!(RuleViolations::new(Vec::new()).is_none());
    }

    #[test]
    fn test_order_is_preserved() {
        let v = RuleViolations::new(vec![
            RuleViolation::semantic("first", "a"),
            RuleViolation::semantic("second", "b"),
        ])
        .unwrap();
        let descriptions: Vec<_> = v.iter().map(|v| v.description.as_str()).collect();
        assert_eq!(descriptions, vec!["first", "second"]);
    }

    #[test]
    fn test_display_includes_context_and_prior() {
        let v = RuleViolation::incompatible("Field 'y' added without default", "A.y").against_prior(2);
        let s = v.to_string();
        assert!(s.contains("COMPATIBILITY"));
        assert!(s.contains("A.y"));
        assert!(s.contains("#2"));
    }

    #[test]
    fn test_verdict_from_findings() {
        assert!(Verdict::from_findings(1, Vec::new()).is_accepted());
        let rejected = Verdict::from_findings(1, vec![RuleViolation::parse_error("bad")]);
        assert_eq!(rejected.violations().unwrap().len(), 1);
    }
}

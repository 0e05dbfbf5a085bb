//! Schema compatibility checking
//!
//! Each format's differ reports the structural changes between a prior
//! version and a candidate as [`SchemaChange`] values, each classified by the
//! direction it breaks. [`check_compatibility`] then keeps the changes that
//! matter for the requested [`CompatibilityLevel`] and turns them into
//! COMPATIBILITY violations.

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact::ArtifactType;
use crate::budget::StageBudget;
use crate::content::Content;
use crate::error::{panic_message, Result};
use crate::formats;
use crate::references::ReferenceMap;
use crate::rules::CompatibilityLevel;
use crate::violation::{RuleKind, RuleViolation, ViolationCause};

/// One version taking part in a comparison, with its resolved references
#[derive(Debug, Clone, Copy)]
pub struct VersionedContent<'a> {
    pub content: &'a Content,
    pub references: &'a ReferenceMap,
}

impl<'a> VersionedContent<'a> {
    pub fn new(content: &'a Content, references: &'a ReferenceMap) -> Self {
        Self { content, references }
    }
}

/// Which readers a change breaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Breaks {
    /// Safe in both directions
    None,
    /// The new schema can no longer read data written with the old one
    Backward,
    /// The old schema can no longer read data written with the new one
    Forward,
    Both,
}

impl Breaks {
    pub fn from_directions(backward: bool, forward: bool) -> Self {
        match (backward, forward) {
            (false, false) => Breaks::None,
            (true, false) => Breaks::Backward,
            (false, true) => Breaks::Forward,
            (true, true) => Breaks::Both,
        }
    }

    pub fn backward(&self) -> bool {
        matches!(self, Breaks::Backward | Breaks::Both)
    }

    pub fn forward(&self) -> bool {
        matches!(self, Breaks::Forward | Breaks::Both)
    }

    pub fn union(self, other: Breaks) -> Breaks {
        Breaks::from_directions(
            self.backward() || other.backward(),
            self.forward() || other.forward(),
        )
    }

    /// Whether `level` rejects this change
    pub fn violates(&self, level: CompatibilityLevel) -> bool {
        (level.checks_backward() && self.backward()) || (level.checks_forward() && self.forward())
    }
}

/// A detected change between schema versions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChange {
    /// Type of change
    pub change_type: ChangeType,
    /// Path to the changed element (e.g., "Invoice.total", "/properties/name")
    pub path: String,
    /// Old value (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    /// New value (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    pub breaks: Breaks,
    /// Human-readable description
    pub description: String,
}

impl SchemaChange {
    pub fn new(
        change_type: ChangeType,
        path: impl Into<String>,
        breaks: Breaks,
        description: impl Into<String>,
    ) -> Self {
        Self {
            change_type,
            path: path.into(),
            old_value: None,
            new_value: None,
            breaks,
            description: description.into(),
        }
    }

    pub fn with_values(mut self, old: impl Into<String>, new: impl Into<String>) -> Self {
        self.old_value = Some(old.into());
        self.new_value = Some(new.into());
        self
    }

    /// One side could not be parsed, so nothing can be said about compatibility
    pub fn unparsable(side: &str, message: impl std::fmt::Display) -> Self {
        Self::new(
            ChangeType::Unparsable,
            "",
            Breaks::Both,
            format!("Unable to parse {} schema: {}", side, message),
        )
    }

    fn into_violation(self, prior_index: usize) -> RuleViolation {
        let cause = if self.change_type == ChangeType::Unparsable {
            ViolationCause::ParseError
        } else {
            ViolationCause::Incompatible
        };
        RuleViolation::new(RuleKind::Compatibility, cause, self.description)
            .at(self.path)
            .against_prior(prior_index)
    }
}

/// Type of schema change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// A new field was added
    FieldAdded,
    /// A field was removed
    FieldRemoved,
    /// A field's type changed
    TypeChanged,
    /// A field number or name was reused for something else
    FieldReused,
    /// A field's optionality or cardinality changed
    OptionalityChanged,
    /// Default value added, removed or changed
    DefaultChanged,
    /// Enum variant added
    EnumVariantAdded,
    /// Enum variant removed
    EnumVariantRemoved,
    /// A named type or definition was added
    TypeAdded,
    /// A named type or definition was removed
    TypeRemoved,
    /// A named type's name changed
    NameChanged,
    /// An operation, path or channel was removed
    OperationRemoved,
    /// A constraint was tightened or relaxed
    ConstraintChanged,
    /// A version could not be parsed
    Unparsable,
}

/// Collapse changes reported once per direction into one change per
/// `(path, change_type)`, keeping the first description and the union of the
/// broken directions. Order of first appearance is preserved.
pub(crate) fn merge_directional(changes: Vec<SchemaChange>) -> Vec<SchemaChange> {
    let mut merged: Vec<SchemaChange> = Vec::with_capacity(changes.len());
    for change in changes {
        match merged
            .iter_mut()
            .find(|m| m.path == change.path && m.change_type == change.change_type)
        {
            Some(existing) => existing.breaks = existing.breaks.union(change.breaks),
            None => merged.push(change),
        }
    }
    merged
}

/// Structural changes from `prior` to `candidate`
///
/// A differ that panics is reported as an unparsable change rather than
/// unwinding past the engine.
pub fn diff_versions(
    artifact_type: ArtifactType,
    prior: VersionedContent<'_>,
    candidate: VersionedContent<'_>,
    budget: &StageBudget,
) -> Result<Vec<SchemaChange>> {
    let diff = formats::rules_for(artifact_type).diff;
    match catch_unwind(AssertUnwindSafe(|| diff(prior, candidate, budget))) {
        Ok(result) => result,
        Err(payload) => Ok(vec![SchemaChange::unparsable(
            "either",
            panic_message(payload.as_ref()),
        )]),
    }
}

/// Check `candidate` against `priors` (oldest first) at `level`
///
/// Non-transitive levels consult only the newest prior; transitive levels
/// consult all of them. Every violation carries the zero-based index of the
/// prior it was found against.
pub fn check_compatibility(
    artifact_type: ArtifactType,
    level: CompatibilityLevel,
    candidate: VersionedContent<'_>,
    priors: &[VersionedContent<'_>],
    budget: &StageBudget,
) -> Result<Vec<RuleViolation>> {
    if level == CompatibilityLevel::None || priors.is_empty() {
        return Ok(Vec::new());
    }

    let first = if level.is_transitive() { 0 } else { priors.len() - 1 };
    let mut violations = Vec::new();

    for (index, prior) in priors.iter().enumerate().skip(first) {
        budget.check()?;
        let changes = diff_versions(artifact_type, *prior, candidate, budget)?;
        let total = changes.len();
        let before = violations.len();
        violations.extend(
            changes
                .into_iter()
                .filter(|c| c.breaks.violates(level))
                .map(|c| c.into_violation(index)),
        );
        debug!(
            %artifact_type,
            %level,
            prior = index,
            changes = total,
            violations = violations.len() - before,
            "Compared against prior version"
        );
    }

    Ok(violations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Stage;

    fn budget() -> StageBudget {
        StageBudget::unbounded(Stage::CheckingCompatibility)
    }

    fn record(fields: &str) -> Content {
        Content::from_string(format!(r#"{{"type":"record","name":"A","fields":[{}]}}"#, fields))
    }

    #[test]
    fn test_breaks_filtering() {
        assert!(Breaks::Backward.violates(CompatibilityLevel::Backward));
        assert!(!Breaks::Backward.violates(CompatibilityLevel::Forward));
        assert!(Breaks::Forward.violates(CompatibilityLevel::FullTransitive));
        assert!(!Breaks::Both.violates(CompatibilityLevel::None));
        assert_eq!(Breaks::Backward.union(Breaks::Forward), Breaks::Both);
    }

    #[test]
    fn test_no_priors_always_compatible() {
        let refs = ReferenceMap::empty();
        let garbage = Content::from_string("{{{");
        for level in CompatibilityLevel::ALL {
            for t in ArtifactType::ALL {
                let violations =
                    check_compatibility(t, level, VersionedContent::new(&garbage, &refs), &[], &budget()).unwrap();
                assert!(violations.is_empty());
            }
        }
    }

    #[test]
    fn test_none_never_inspects_content() {
        let refs = ReferenceMap::empty();
        let garbage = Content::from_string("{{{");
        let prior = record(r#"{"name":"x","type":"int"}"#);
        let violations = check_compatibility(
            ArtifactType::Avro,
            CompatibilityLevel::None,
            VersionedContent::new(&garbage, &refs),
            &[VersionedContent::new(&prior, &refs)],
            &budget(),
        )
        .unwrap();
        assert!(violations.is_empty());
    }

    #[test]
    fn test_transitive_consults_every_prior() {
        let refs = ReferenceMap::empty();
        let v1 = record(r#"{"name":"x","type":"int"}"#);
        // Reads v2 fine, but cannot read v1 data: z has no default and v1 never wrote it
        let candidate = record(
            r#"{"name":"x","type":"int"},{"name":"y","type":"string","default":""},{"name":"z","type":"long"}"#,
        );
        let v2_with_z = record(
            r#"{"name":"x","type":"int"},{"name":"y","type":"string","default":""},{"name":"z","type":"long"}"#,
        );
        let priors = [VersionedContent::new(&v1, &refs), VersionedContent::new(&v2_with_z, &refs)];

        let latest_only = check_compatibility(
            ArtifactType::Avro,
            CompatibilityLevel::Backward,
            VersionedContent::new(&candidate, &refs),
            &priors,
            &budget(),
        )
        .unwrap();
        assert!(latest_only.is_empty());

        let transitive = check_compatibility(
            ArtifactType::Avro,
            CompatibilityLevel::BackwardTransitive,
            VersionedContent::new(&candidate, &refs),
            &priors,
            &budget(),
        )
        .unwrap();
        assert_eq!(transitive.len(), 1);
        assert_eq!(transitive[0].prior_version, Some(0));
        assert!(transitive[0].description.contains('z'));
    }

    #[test]
    fn test_unparsable_prior_is_reported() {
        let refs = ReferenceMap::empty();
        let prior = Content::from_string("not json");
        let candidate = record(r#"{"name":"x","type":"int"}"#);
        let violations = check_compatibility(
            ArtifactType::Avro,
            CompatibilityLevel::Forward,
            VersionedContent::new(&candidate, &refs),
            &[VersionedContent::new(&prior, &refs)],
            &budget(),
        )
        .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].cause, ViolationCause::ParseError);
        assert_eq!(violations[0].kind, RuleKind::Compatibility);
    }
}

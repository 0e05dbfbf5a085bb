//! Rule Executor
//!
//! Runs one request through the fixed stage sequence:
//!
//! ```text
//! RESOLVING_CONFIG -> RESOLVING_REFERENCES -> CANONICALIZING -> VALIDATING
//!     -> CHECKING_COMPATIBILITY -> DONE
//! ```
//!
//! Reference resolution, validation, and compatibility checking may end the
//! request in FAILED. Only the stage that failed contributes violations; later
//! stages are not run. The executor holds limits but no rule configuration,
//! and it never persists anything.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifact::ArtifactType;
use crate::budget::StageBudget;
use crate::canonical::canonicalize_within;
use crate::checksum::Checksum;
use crate::compatibility::{self, VersionedContent};
use crate::config::{EngineConfig, LimitsConfig};
use crate::content::{CanonicalContent, Content};
use crate::error::{Result, RuleError};
use crate::formats;
use crate::references::{resolve_references, ReferenceLookup, ReferenceMap, ResolveOptions};
use crate::rules::{
    resolve_configuration, ArtifactScope, CompatibilityLevel, IntegrityRule, RuleConfiguration,
    RuleSettingsSource, ValidityLevel,
};
use crate::violation::{RuleViolations, Verdict};

/// States of one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    ResolvingConfig,
    ResolvingReferences,
    Canonicalizing,
    Validating,
    CheckingCompatibility,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ResolvingConfig => "RESOLVING_CONFIG",
            Stage::ResolvingReferences => "RESOLVING_REFERENCES",
            Stage::Canonicalizing => "CANONICALIZING",
            Stage::Validating => "VALIDATING",
            Stage::CheckingCompatibility => "CHECKING_COMPATIBILITY",
            Stage::Done => "DONE",
            Stage::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered record of the stages a request passed through
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageTrace(Vec<Stage>);

impl StageTrace {
    fn push(&mut self, stage: Stage) {
        self.0.push(stage);
    }

    pub fn stages(&self) -> &[Stage] {
        &self.0
    }

    /// Final state, if the request finished
    pub fn outcome(&self) -> Option<Stage> {
        self.0.last().copied().filter(Stage::is_terminal)
    }
}

impl fmt::Display for StageTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(Stage::as_str).collect();
        f.write_str(&names.join(" -> "))
    }
}

/// Result of a request that passed every enabled rule
#[derive(Debug, Clone)]
pub struct Accepted {
    /// Canonical form, for caller-side deduplication
    pub canonical: CanonicalContent,
    /// Configuration the request was evaluated under
    pub configuration: RuleConfiguration,
    pub trace: StageTrace,
}

impl Accepted {
    /// Digest of the canonical content
    pub fn digest(&self) -> &Checksum {
        self.canonical.digest()
    }
}

/// Orchestrates the per-format rules for one request at a time
///
/// Holds only resource limits, so a single executor can serve any number of
/// concurrent requests.
#[derive(Debug, Clone, Default)]
pub struct RuleExecutor {
    config: EngineConfig,
}

impl RuleExecutor {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Full pipeline for registering a new version of an artifact
    ///
    /// `priors` is ordered oldest first. Rule settings are resolved for
    /// `scope` from `settings`; nothing configured means no rules.
    pub fn validate_and_check(
        &self,
        artifact_type: ArtifactType,
        candidate: &Content,
        scope: &ArtifactScope,
        priors: &[Content],
        settings: &dyn RuleSettingsSource,
        lookup: &dyn ReferenceLookup,
    ) -> Result<Verdict<Accepted>> {
        let mut run = Run::new(artifact_type, &self.config.limits, lookup);

        run.enter(Stage::ResolvingConfig);
        let configuration = resolve_configuration(settings, scope)?;
        debug!(
            artifact = %scope.key(),
            validity = %configuration.validity,
            compatibility = %configuration.compatibility,
            integrity = configuration.integrity.len(),
            "Resolved rule configuration"
        );

        let references = match run.resolve(candidate, &configuration, None)? {
            Verdict::Accepted(references) => references,
            Verdict::Rejected(violations) => return Ok(run.fail(violations)),
        };

        let budget = run.enter(Stage::Canonicalizing);
        let canonical = canonicalize_within(artifact_type, candidate, &budget)?;

        if let Some(violations) = run.validate(configuration.validity, candidate, &references)? {
            return Ok(run.fail(violations));
        }

        if let Some(violations) = run.check(configuration.compatibility, &configuration, candidate, &references, priors)? {
            return Ok(run.fail(violations));
        }

        let trace = run.finish();
        info!(
            %artifact_type,
            artifact = %scope.key(),
            digest = %canonical.digest(),
            "Content accepted"
        );
        Ok(Verdict::Accepted(Accepted {
            canonical,
            configuration,
            trace,
        }))
    }

    /// Validate `content` at `level` without any compatibility check
    pub fn validate_only(
        &self,
        artifact_type: ArtifactType,
        content: &Content,
        level: ValidityLevel,
        lookup: &dyn ReferenceLookup,
    ) -> Result<Verdict<StageTrace>> {
        let mut run = Run::new(artifact_type, &self.config.limits, lookup);
        let configuration = RuleConfiguration::new(level, CompatibilityLevel::None);
        run.enter(Stage::ResolvingConfig);

        let references = match run.resolve(content, &configuration, None)? {
            Verdict::Accepted(references) => references,
            Verdict::Rejected(violations) => return Ok(run.fail(violations)),
        };

        if let Some(violations) = run.validate(level, content, &references)? {
            return Ok(run.fail(violations));
        }
        Ok(Verdict::Accepted(run.finish()))
    }

    /// Is `candidate` compatible with `priors` (oldest first) at `level`
    ///
    /// References are resolved for the candidate and for every prior that is
    /// compared.
    pub fn check_compatibility_only(
        &self,
        artifact_type: ArtifactType,
        candidate: &Content,
        priors: &[Content],
        level: CompatibilityLevel,
        lookup: &dyn ReferenceLookup,
    ) -> Result<Verdict<StageTrace>> {
        let mut run = Run::new(artifact_type, &self.config.limits, lookup);
        let configuration = RuleConfiguration::new(ValidityLevel::None, level);
        run.enter(Stage::ResolvingConfig);

        if level == CompatibilityLevel::None || priors.is_empty() {
            return Ok(Verdict::Accepted(run.finish()));
        }

        let references = match run.resolve(candidate, &configuration, None)? {
            Verdict::Accepted(references) => references,
            Verdict::Rejected(violations) => return Ok(run.fail(violations)),
        };

        if let Some(violations) = run.check(level, &configuration, candidate, &references, priors)? {
            return Ok(run.fail(violations));
        }
        Ok(Verdict::Accepted(run.finish()))
    }
}

/// State of one request as it moves through the stages
struct Run<'a> {
    artifact_type: ArtifactType,
    limits: &'a LimitsConfig,
    lookup: &'a dyn ReferenceLookup,
    trace: StageTrace,
}

impl<'a> Run<'a> {
    fn new(artifact_type: ArtifactType, limits: &'a LimitsConfig, lookup: &'a dyn ReferenceLookup) -> Self {
        Self {
            artifact_type,
            limits,
            lookup,
            trace: StageTrace::default(),
        }
    }

    fn enter(&mut self, stage: Stage) -> StageBudget {
        debug!(artifact_type = %self.artifact_type, %stage, "Entering stage");
        self.trace.push(stage);
        StageBudget::start(stage, self.limits)
    }

    fn current(&self) -> Stage {
        self.trace.stages().last().copied().unwrap_or(Stage::ResolvingConfig)
    }

    fn fail<T>(mut self, violations: RuleViolations) -> Verdict<T> {
        info!(
            artifact_type = %self.artifact_type,
            stage = %self.current(),
            violations = violations.len(),
            "Content rejected"
        );
        self.trace.push(Stage::Failed);
        Verdict::Rejected(violations)
    }

    fn finish(mut self) -> StageTrace {
        self.trace.push(Stage::Done);
        self.trace
    }

    fn check_size(&self, budget: &StageBudget, content: &Content) -> Result<()> {
        if content.len() > self.limits.max_content_bytes {
            warn!(
                artifact_type = %self.artifact_type,
                size = content.len(),
                limit = self.limits.max_content_bytes,
                "Content too large"
            );
            return Err(budget.exhausted(format!(
                "content is {} bytes, limit is {}",
                content.len(),
                self.limits.max_content_bytes
            )));
        }
        Ok(())
    }

    fn resolve_options(&self, configuration: &RuleConfiguration, prior: Option<usize>) -> ResolveOptions {
        ResolveOptions {
            transitive: self.artifact_type.needs_transitive_references()
                || configuration.integrity_enabled(IntegrityRule::RefsExist),
            // Priors were accepted under whatever rules applied at the time
            reject_duplicates: prior.is_none() && configuration.integrity_enabled(IntegrityRule::NoDuplicates),
            max_depth: self.limits.max_reference_depth,
        }
    }

    /// RESOLVING_REFERENCES for the candidate (`prior == None`) or one prior
    fn resolve(
        &mut self,
        content: &Content,
        configuration: &RuleConfiguration,
        prior: Option<usize>,
    ) -> Result<Verdict<ReferenceMap>> {
        let budget = match prior {
            None => self.enter(Stage::ResolvingReferences),
            Some(_) => StageBudget::start(Stage::CheckingCompatibility, self.limits),
        };
        self.check_size(&budget, content)?;

        let options = self.resolve_options(configuration, prior);
        let verdict = resolve_references(self.artifact_type, content, self.lookup, &options, &budget)?;
        Ok(match (verdict, prior) {
            (Verdict::Rejected(violations), Some(index)) => Verdict::Rejected(violations.against_prior(index)),
            (verdict, _) => verdict,
        })
    }

    /// VALIDATING; `Some` carries the violations found
    fn validate(
        &mut self,
        level: ValidityLevel,
        content: &Content,
        references: &ReferenceMap,
    ) -> Result<Option<RuleViolations>> {
        let budget = self.enter(Stage::Validating);
        if level == ValidityLevel::None {
            return Ok(None);
        }
        let violations = formats::validate(self.artifact_type, level, content, references, &budget)?;
        debug!(artifact_type = %self.artifact_type, %level, violations = violations.len(), "Validated");
        Ok(RuleViolations::new(violations))
    }

    /// CHECKING_COMPATIBILITY against the priors `level` consults
    fn check(
        &mut self,
        level: CompatibilityLevel,
        configuration: &RuleConfiguration,
        candidate: &Content,
        references: &ReferenceMap,
        priors: &[Content],
    ) -> Result<Option<RuleViolations>> {
        let budget = self.enter(Stage::CheckingCompatibility);
        if level == CompatibilityLevel::None || priors.is_empty() {
            return Ok(None);
        }

        // Only the newest prior matters for non-transitive levels; the others
        // keep their position so violations report the right index.
        let first = if level.is_transitive() { 0 } else { priors.len() - 1 };
        let mut prior_references = Vec::with_capacity(priors.len());
        for (index, prior) in priors.iter().enumerate() {
            if index < first {
                prior_references.push(ReferenceMap::empty());
                continue;
            }
            match self.resolve(prior, configuration, Some(index))? {
                Verdict::Accepted(references) => prior_references.push(references),
                Verdict::Rejected(violations) => return Ok(Some(violations)),
            }
        }

        let versioned: Vec<VersionedContent<'_>> = priors
            .iter()
            .zip(&prior_references)
            .map(|(content, references)| VersionedContent::new(content, references))
            .collect();
        let violations = compatibility::check_compatibility(
            self.artifact_type,
            level,
            VersionedContent::new(candidate, references),
            &versioned,
            &budget,
        )?;
        Ok(RuleViolations::new(violations))
    }
}

impl From<&RuleError> for Stage {
    /// Stage an error was raised in, `FAILED` when unknown
    fn from(error: &RuleError) -> Self {
        match error {
            RuleError::ResourceExhausted { stage, .. } => *stage,
            RuleError::LookupFailed { .. } => Stage::ResolvingReferences,
            RuleError::Configuration(_) => Stage::ResolvingConfig,
            _ => Stage::Failed,
        }
    }
}

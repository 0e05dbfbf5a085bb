//! Rule levels and layered rule configuration
//!
//! Effective settings for a request are merged per rule family:
//! artifact-level settings win over group-level settings, which win over the
//! global defaults. Nothing configured at any layer means "no rule".
//!
//! ## Example settings file
//! ```toml
//! [global]
//! validity = "SYNTAX_ONLY"
//!
//! [groups.payments]
//! compatibility = "BACKWARD"
//! integrity = ["NO_DUPLICATES"]
//!
//! [artifacts."payments/Invoice"]
//! compatibility = "FULL_TRANSITIVE"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuleError};

/// How deeply content is validated. Higher levels are supersets of lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ValidityLevel {
    #[default]
    None,
    SyntaxOnly,
    Full,
}

impl ValidityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidityLevel::None => "NONE",
            ValidityLevel::SyntaxOnly => "SYNTAX_ONLY",
            ValidityLevel::Full => "FULL",
        }
    }
}

impl FromStr for ValidityLevel {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "NONE" => Ok(ValidityLevel::None),
            "SYNTAX_ONLY" | "SYNTAX" => Ok(ValidityLevel::SyntaxOnly),
            "FULL" => Ok(ValidityLevel::Full),
            other => Err(RuleError::Configuration(format!("unknown validity level: '{}'", other))),
        }
    }
}

/// Direction(s) in which two schema versions must interoperate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CompatibilityLevel {
    #[default]
    None,
    /// New schema can read data written with the preceding version
    Backward,
    BackwardTransitive,
    /// Preceding version's readers can read data written with the new schema
    Forward,
    ForwardTransitive,
    /// Backward and forward
    Full,
    FullTransitive,
}

impl CompatibilityLevel {
    pub const ALL: [CompatibilityLevel; 7] = [
        CompatibilityLevel::None,
        CompatibilityLevel::Backward,
        CompatibilityLevel::BackwardTransitive,
        CompatibilityLevel::Forward,
        CompatibilityLevel::ForwardTransitive,
        CompatibilityLevel::Full,
        CompatibilityLevel::FullTransitive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CompatibilityLevel::None => "NONE",
            CompatibilityLevel::Backward => "BACKWARD",
            CompatibilityLevel::BackwardTransitive => "BACKWARD_TRANSITIVE",
            CompatibilityLevel::Forward => "FORWARD",
            CompatibilityLevel::ForwardTransitive => "FORWARD_TRANSITIVE",
            CompatibilityLevel::Full => "FULL",
            CompatibilityLevel::FullTransitive => "FULL_TRANSITIVE",
        }
    }

    /// Whether every prior version is consulted, not only the latest
    pub fn is_transitive(&self) -> bool {
        matches!(
            self,
            CompatibilityLevel::BackwardTransitive
                | CompatibilityLevel::ForwardTransitive
                | CompatibilityLevel::FullTransitive
        )
    }

    pub fn checks_backward(&self) -> bool {
        matches!(
            self,
            CompatibilityLevel::Backward
                | CompatibilityLevel::BackwardTransitive
                | CompatibilityLevel::Full
                | CompatibilityLevel::FullTransitive
        )
    }

    pub fn checks_forward(&self) -> bool {
        matches!(
            self,
            CompatibilityLevel::Forward
                | CompatibilityLevel::ForwardTransitive
                | CompatibilityLevel::Full
                | CompatibilityLevel::FullTransitive
        )
    }
}

impl FromStr for CompatibilityLevel {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "NONE" => Ok(CompatibilityLevel::None),
            "BACKWARD" => Ok(CompatibilityLevel::Backward),
            "BACKWARD_TRANSITIVE" => Ok(CompatibilityLevel::BackwardTransitive),
            "FORWARD" => Ok(CompatibilityLevel::Forward),
            "FORWARD_TRANSITIVE" => Ok(CompatibilityLevel::ForwardTransitive),
            "FULL" => Ok(CompatibilityLevel::Full),
            "FULL_TRANSITIVE" => Ok(CompatibilityLevel::FullTransitive),
            other => Err(RuleError::Configuration(format!(
                "unknown compatibility level: '{}'",
                other
            ))),
        }
    }
}

/// Reference integrity checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IntegrityRule {
    /// A reference coordinate may be declared only once per document
    NoDuplicates,
    /// Every reference reachable through referenced content must resolve
    RefsExist,
}

impl IntegrityRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrityRule::NoDuplicates => "NO_DUPLICATES",
            IntegrityRule::RefsExist => "REFS_EXIST",
        }
    }
}

impl FromStr for IntegrityRule {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "NO_DUPLICATES" => Ok(IntegrityRule::NoDuplicates),
            "REFS_EXIST" => Ok(IntegrityRule::RefsExist),
            other => Err(RuleError::Configuration(format!("unknown integrity rule: '{}'", other))),
        }
    }
}

fn normalize(s: &str) -> String {
    s.trim().replace(['-', ' '], "_").to_ascii_uppercase()
}

macro_rules! string_conversions {
    ($($ty:ty),*) => {$(
        impl TryFrom<String> for $ty {
            type Error = RuleError;
            fn try_from(s: String) -> Result<Self> {
                s.parse()
            }
        }

        impl From<$ty> for String {
            fn from(level: $ty) -> String {
                level.as_str().to_string()
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    )*};
}

string_conversions!(ValidityLevel, CompatibilityLevel, IntegrityRule);

/// Rule settings configured at one layer. Unset fields fall through.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity: Option<ValidityLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatibility: Option<CompatibilityLevel>,
    /// Integrity rule names; `FULL` enables all, `NONE` disables all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<Vec<String>>,
}

impl RuleSettings {
    pub fn validity(level: ValidityLevel) -> Self {
        Self { validity: Some(level), ..Default::default() }
    }

    pub fn compatibility(level: CompatibilityLevel) -> Self {
        Self { compatibility: Some(level), ..Default::default() }
    }

    pub fn with_validity(mut self, level: ValidityLevel) -> Self {
        self.validity = Some(level);
        self
    }

    pub fn with_compatibility(mut self, level: CompatibilityLevel) -> Self {
        self.compatibility = Some(level);
        self
    }

    pub fn with_integrity(mut self, rules: &[&str]) -> Self {
        self.integrity = Some(rules.iter().map(|r| r.to_string()).collect());
        self
    }

    fn integrity_rules(&self) -> Result<Option<BTreeSet<IntegrityRule>>> {
        let Some(names) = &self.integrity else {
            return Ok(None);
        };
        let normalized: Vec<String> = names.iter().map(|n| normalize(n)).collect();
        let has_none = normalized.iter().any(|n| n == "NONE");
        if has_none && normalized.len() > 1 {
            return Err(RuleError::Configuration(format!(
                "integrity rules {:?} combine NONE with other rules",
                names
            )));
        }
        let mut rules = BTreeSet::new();
        for name in &normalized {
            match name.as_str() {
                "NONE" => {}
                "FULL" => {
                    rules.insert(IntegrityRule::NoDuplicates);
                    rules.insert(IntegrityRule::RefsExist);
                }
                other => {
                    rules.insert(other.parse()?);
                }
            }
        }
        Ok(Some(rules))
    }
}

/// Identifies the artifact a request is about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactScope {
    pub group: Option<String>,
    pub artifact_id: String,
}

impl ArtifactScope {
    pub const DEFAULT_GROUP: &'static str = "default";

    pub fn new(group: Option<&str>, artifact_id: impl Into<String>) -> Self {
        Self {
            group: group.map(String::from),
            artifact_id: artifact_id.into(),
        }
    }

    pub fn group_name(&self) -> &str {
        self.group.as_deref().unwrap_or(Self::DEFAULT_GROUP)
    }

    /// `group/artifact` key used by [`LayeredRuleSettings`]
    pub fn key(&self) -> String {
        format!("{}/{}", self.group_name(), self.artifact_id)
    }
}

/// Read-only access to layered rule settings owned by the caller
pub trait RuleSettingsSource: Send + Sync {
    fn global_settings(&self) -> Option<RuleSettings>;
    fn group_settings(&self, group: &str) -> Option<RuleSettings>;
    fn artifact_settings(&self, scope: &ArtifactScope) -> Option<RuleSettings>;
}

/// In-memory snapshot of layered settings, loadable from TOML
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayeredRuleSettings {
    #[serde(default)]
    pub global: RuleSettings,
    #[serde(default)]
    pub groups: BTreeMap<String, RuleSettings>,
    /// Keyed by `group/artifact`
    #[serde(default)]
    pub artifacts: BTreeMap<String, RuleSettings>,
}

impl LayeredRuleSettings {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn with_global(mut self, settings: RuleSettings) -> Self {
        self.global = settings;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>, settings: RuleSettings) -> Self {
        self.groups.insert(group.into(), settings);
        self
    }

    pub fn with_artifact(mut self, scope: &ArtifactScope, settings: RuleSettings) -> Self {
        self.artifacts.insert(scope.key(), settings);
        self
    }
}

impl RuleSettingsSource for LayeredRuleSettings {
    fn global_settings(&self) -> Option<RuleSettings> {
        Some(self.global.clone())
    }

    fn group_settings(&self, group: &str) -> Option<RuleSettings> {
        self.groups.get(group).cloned()
    }

    fn artifact_settings(&self, scope: &ArtifactScope) -> Option<RuleSettings> {
        self.artifacts.get(&scope.key()).cloned()
    }
}

/// Effective, fully resolved settings for one request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuleConfiguration {
    pub validity: ValidityLevel,
    pub compatibility: CompatibilityLevel,
    pub integrity: BTreeSet<IntegrityRule>,
}

impl RuleConfiguration {
    pub fn new(validity: ValidityLevel, compatibility: CompatibilityLevel) -> Self {
        Self {
            validity,
            compatibility,
            integrity: BTreeSet::new(),
        }
    }

    pub fn with_integrity(mut self, rule: IntegrityRule) -> Self {
        self.integrity.insert(rule);
        self
    }

    pub fn integrity_enabled(&self, rule: IntegrityRule) -> bool {
        self.integrity.contains(&rule)
    }
}

/// Merge the layers for `scope`: artifact > group > global, per rule family
pub fn resolve_configuration(
    source: &dyn RuleSettingsSource,
    scope: &ArtifactScope,
) -> Result<RuleConfiguration> {
    // Most specific first
    let layers: Vec<RuleSettings> = [
        source.artifact_settings(scope),
        source.group_settings(scope.group_name()),
        source.global_settings(),
    ]
    .into_iter()
    .flatten()
    .collect();

    let validity = layers.iter().find_map(|l| l.validity).unwrap_or_default();
    let compatibility = layers.iter().find_map(|l| l.compatibility).unwrap_or_default();

    let mut integrity = BTreeSet::new();
    for layer in &layers {
        if let Some(rules) = layer.integrity_rules()? {
            integrity = rules;
            break;
        }
    }

    Ok(RuleConfiguration {
        validity,
        compatibility,
        integrity,
    })
}

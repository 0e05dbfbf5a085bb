//! Registry Rules
//!
//! Validation and compatibility rule engine for a schema/API artifact
//! registry. Given submitted content, its artifact type, its prior versions,
//! and layered rule settings, the engine decides whether the content may be
//! registered and computes a canonical digest for deduplication.
//!
//! ## Features
//!
//! - **Canonicalization**: representation-insensitive digests per format
//! - **Reference Resolution**: imports and `$ref`s resolved through a caller-supplied lookup
//! - **Validity Rules**: `NONE`, `SYNTAX_ONLY` and `FULL` checks for every artifact type
//! - **Compatibility Rules**: backward, forward and full checks, optionally transitive
//! - **Structured Violations**: every problem found is reported, never just the first
//!
//! ## Architecture
//!
//! ```text
//! RuleExecutor
//! ├── rules          layered settings -> RuleConfiguration
//! ├── references     ReferenceLookup -> ReferenceMap
//! ├── canonical      Content -> CanonicalContent
//! ├── formats/       one FormatRules table per ArtifactType
//! │   ├── avro
//! │   ├── protobuf/
//! │   ├── json_schema
//! │   ├── openapi    (OpenAPI and AsyncAPI)
//! │   ├── graphql
//! │   ├── kconnect
//! │   └── xml        (XML, XSD and WSDL)
//! └── compatibility  SchemaChange classification per level
//! ```
//!
//! ## Example
//!
//! ```
//! use registry_rules::{
//!     ArtifactScope, ArtifactType, CompatibilityLevel, Content, InMemoryLookup,
//!     LayeredRuleSettings, RuleExecutor, RuleSettings, ValidityLevel,
//! };
//!
//! let settings = LayeredRuleSettings::default().with_global(
//!     RuleSettings::validity(ValidityLevel::Full).with_compatibility(CompatibilityLevel::Backward),
//! );
//! let v1 = Content::from_string(r#"{"type":"record","name":"A","fields":[{"name":"x","type":"int"}]}"#);
//!
//! let verdict = RuleExecutor::default()
//!     .validate_and_check(
//!         ArtifactType::Avro,
//!         &v1,
//!         &ArtifactScope::new(None, "a"),
//!         &[],
//!         &settings,
//!         &InMemoryLookup::new(),
//!     )
//!     .unwrap();
//! assert!(verdict.is_accepted());
//! ```

pub mod artifact;
pub mod budget;
pub mod canonical;
pub mod checksum;
pub mod compatibility;
pub mod config;
pub mod content;
pub mod error;
pub mod executor;
pub mod formats;
pub mod references;
pub mod rules;
pub mod violation;

pub use artifact::ArtifactType;
pub use canonical::{canonicalize, canonicalize_within};
pub use checksum::Checksum;
pub use compatibility::{check_compatibility, Breaks, ChangeType, SchemaChange, VersionedContent};
pub use config::EngineConfig;
pub use content::{CanonicalContent, Content, ContentType};
pub use error::{Result, RuleError};
pub use executor::{Accepted, RuleExecutor, Stage, StageTrace};
pub use references::{
    resolve_references, InMemoryLookup, LookupError, ReferenceCoordinate, ReferenceLookup, ReferenceMap,
};
pub use rules::{
    resolve_configuration, ArtifactScope, CompatibilityLevel, IntegrityRule, LayeredRuleSettings,
    RuleConfiguration, RuleSettings, RuleSettingsSource, ValidityLevel,
};
pub use violation::{RuleKind, RuleViolation, RuleViolations, Verdict, ViolationCause};

//! End-to-end tests for the Rule Executor
//!
//! Each test drives a full request through `RuleExecutor` the way the
//! registry's REST layer would: layered settings, a lookup capability, and
//! the prior versions of the artifact.

use std::time::Duration;

use registry_rules::references::CountingLookup;
use registry_rules::{
    ArtifactScope, ArtifactType, CompatibilityLevel, Content, EngineConfig, InMemoryLookup, LayeredRuleSettings,
    LookupError, ReferenceCoordinate, RuleError, RuleExecutor, RuleKind, RuleSettings, Stage, ValidityLevel, Verdict,
    ViolationCause,
};

fn scope() -> ArtifactScope {
    ArtifactScope::new(Some("sales"), "order")
}

fn rules(validity: ValidityLevel, compatibility: CompatibilityLevel) -> LayeredRuleSettings {
    LayeredRuleSettings::default().with_global(RuleSettings::validity(validity).with_compatibility(compatibility))
}

fn register(
    artifact_type: ArtifactType,
    candidate: &str,
    priors: &[&str],
    settings: &LayeredRuleSettings,
) -> Verdict<registry_rules::Accepted> {
    let priors: Vec<Content> = priors.iter().map(|p| Content::from_string(*p)).collect();
    RuleExecutor::default()
        .validate_and_check(
            artifact_type,
            &Content::from_string(candidate),
            &scope(),
            &priors,
            settings,
            &InMemoryLookup::new(),
        )
        .unwrap()
}

// =============================================================================
// Avro registration scenario
// =============================================================================

const AVRO_V1: &str = r#"{"type":"record","name":"A","fields":[{"name":"x","type":"int"}]}"#;
const AVRO_V2: &str = r#"{"type":"record","name":"A","fields":[{"name":"x","type":"int"},{"name":"y","type":"string"}]}"#;
const AVRO_V2_DEFAULT: &str =
    r#"{"type":"record","name":"A","fields":[{"name":"x","type":"int"},{"name":"y","type":"string","default":""}]}"#;

#[test]
fn test_first_version_is_accepted() {
    let verdict = register(ArtifactType::Avro, AVRO_V1, &[], &rules(ValidityLevel::Full, CompatibilityLevel::Backward));
    let accepted = verdict.into_result().unwrap();
    assert_eq!(accepted.trace.outcome(), Some(Stage::Done));
    assert_eq!(accepted.digest().as_str().len(), 64);
}

#[test]
fn test_added_field_without_default_breaks_backward() {
    let verdict = register(
        ArtifactType::Avro,
        AVRO_V2,
        &[AVRO_V1],
        &rules(ValidityLevel::Full, CompatibilityLevel::Backward),
    );

    let violations = verdict.violations().expect("v2 must be rejected");
    assert_eq!(violations.len(), 1, "{}", violations);
    let violation = violations.first();
    assert_eq!(violation.kind, RuleKind::Compatibility);
    assert!(
        violation.description.contains('y') || violation.context.as_deref().is_some_and(|c| c.contains('y')),
        "{}",
        violation
    );
    assert_eq!(violation.prior_version, Some(0));
}

#[test]
fn test_added_field_with_default_is_backward_compatible() {
    let verdict = register(
        ArtifactType::Avro,
        AVRO_V2_DEFAULT,
        &[AVRO_V1],
        &rules(ValidityLevel::Full, CompatibilityLevel::Backward),
    );
    assert!(verdict.is_accepted(), "{:?}", verdict.violations());
}

#[test]
fn test_transitive_level_checks_every_prior() {
    // v1 has no `y`; v2 added it with a default; v3 drops the default.
    // v3 can read v2 data but not v1 data.
    let v3 = AVRO_V2;
    let settings = rules(ValidityLevel::Full, CompatibilityLevel::BackwardTransitive);
    let verdict = register(ArtifactType::Avro, v3, &[AVRO_V1, AVRO_V2_DEFAULT], &settings);

    let violations = verdict.violations().expect("v1 is incompatible");
    assert!(violations.iter().all(|v| v.prior_version == Some(0)), "{}", violations);

    let only_latest = register(
        ArtifactType::Avro,
        v3,
        &[AVRO_V1, AVRO_V2_DEFAULT],
        &rules(ValidityLevel::Full, CompatibilityLevel::Backward),
    );
    assert!(only_latest.is_accepted(), "{:?}", only_latest.violations());
}

#[test]
fn test_artifact_settings_override_global() {
    let settings = rules(ValidityLevel::Full, CompatibilityLevel::Backward)
        .with_artifact(&scope(), RuleSettings::compatibility(CompatibilityLevel::None));
    let verdict = register(ArtifactType::Avro, AVRO_V2, &[AVRO_V1], &settings);
    let accepted = verdict.into_result().unwrap();
    assert_eq!(accepted.configuration.compatibility, CompatibilityLevel::None);
    assert_eq!(accepted.configuration.validity, ValidityLevel::Full);
}

// =============================================================================
// Short-circuiting
// =============================================================================

#[test]
fn test_malformed_json_schema_is_one_parse_error_and_skips_compatibility() {
    let lookup = CountingLookup::new(InMemoryLookup::new().with("prior.json", r#"{"type": "object"}"#));
    let prior = Content::from_string(r#"{"properties": {"a": {"$ref": "prior.json"}}}"#);
    let verdict = RuleExecutor::default()
        .validate_and_check(
            ArtifactType::Json,
            &Content::from_string(r#"{"type": "object", "properties": {"a": {"type": "string"}"#),
            &scope(),
            &[prior],
            &rules(ValidityLevel::SyntaxOnly, CompatibilityLevel::Backward),
            &lookup,
        )
        .unwrap();

    let violations = verdict.violations().expect("malformed content is rejected");
    assert_eq!(violations.len(), 1);
    assert_eq!(violations.first().kind, RuleKind::Validity);
    assert_eq!(violations.first().cause, ViolationCause::ParseError);
    // The prior declares a reference; resolving it would mean compatibility ran
    assert_eq!(lookup.calls(), 0);
}

#[test]
fn test_missing_reference_is_one_integrity_violation() {
    let lookup = CountingLookup::new(InMemoryLookup::new());
    let verdict = RuleExecutor::default()
        .validate_and_check(
            ArtifactType::Json,
            &Content::from_string(r#"{"type": "object", "properties": {"m": {"$ref": "money.json#/Money"}}}"#),
            &scope(),
            &[Content::from_string(r#"{"type": "object"}"#)],
            &rules(ValidityLevel::Full, CompatibilityLevel::Full),
            &lookup,
        )
        .unwrap();

    let violations = verdict.violations().unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations.count_of(RuleKind::Integrity), 1);
    assert_eq!(violations.count_of(RuleKind::Validity), 0);
    assert_eq!(violations.count_of(RuleKind::Compatibility), 0);
    assert_eq!(violations.first().cause, ViolationCause::UnresolvedReference);
    assert_eq!(lookup.calls(), 1);
}

#[test]
fn test_invalid_content_skips_compatibility() {
    let invalid_v2 = r#"{"type":"record","name":"A","fields":[{"name":"x","type":"int"},{"name":"x","type":"string"}]}"#;
    let verdict = register(
        ArtifactType::Avro,
        invalid_v2,
        &[AVRO_V1],
        &rules(ValidityLevel::Full, CompatibilityLevel::Full),
    );
    let violations = verdict.violations().unwrap();
    assert!(violations.count_of(RuleKind::Validity) >= 1);
    assert_eq!(violations.count_of(RuleKind::Compatibility), 0);
}

#[test]
fn test_all_violations_are_reported() {
    let proto = "syntax = \"proto3\";\nmessage A {\n  string a = 1;\n  int32 b = 1;\n  Missing c = 3;\n}\nenum E {\n  E_ONE = 1;\n}\n";
    let verdict = register(ArtifactType::Protobuf, proto, &[], &rules(ValidityLevel::Full, CompatibilityLevel::None));
    let violations = verdict.violations().unwrap();
    assert_eq!(violations.len(), 3, "{}", violations);
    assert_eq!(violations.count_of(RuleKind::Validity), 3);
}

// =============================================================================
// References
// =============================================================================

#[test]
fn test_avro_named_type_from_reference() {
    let order = r#"{"type":"record","name":"Order","fields":[{"name":"ship_to","type":"Address"}]}"#;
    let address = r#"{"type":"record","name":"Address","fields":[{"name":"street","type":"string"}]}"#;
    let lookup = InMemoryLookup::new().with("Address", address);

    let verdict = RuleExecutor::default()
        .validate_only(ArtifactType::Avro, &Content::from_string(order), ValidityLevel::Full, &lookup)
        .unwrap();
    assert!(verdict.is_accepted(), "{:?}", verdict.violations());
}

#[test]
fn test_refs_exist_follows_nested_references() {
    let invoice = r#"{"type": "object", "properties": {"total": {"$ref": "money.json"}}}"#;
    let money = r#"{"type": "object", "properties": {"currency": {"$ref": "currency.json"}}}"#;
    let lookup = CountingLookup::new(InMemoryLookup::new().with("money.json", money));
    let direct_only = rules(ValidityLevel::Full, CompatibilityLevel::None);
    let transitive = LayeredRuleSettings::default().with_global(
        RuleSettings::validity(ValidityLevel::Full).with_integrity(&["REFS_EXIST"]),
    );

    let executor = RuleExecutor::default();
    let candidate = Content::from_string(invoice);
    let verdict = executor
        .validate_and_check(ArtifactType::Json, &candidate, &scope(), &[], &direct_only, &lookup)
        .unwrap();
    assert!(verdict.is_accepted(), "{:?}", verdict.violations());
    assert_eq!(lookup.calls(), 1);

    let verdict = executor
        .validate_and_check(ArtifactType::Json, &candidate, &scope(), &[], &transitive, &lookup)
        .unwrap();
    let violations = verdict.violations().expect("currency.json is missing");
    assert_eq!(violations.first().kind, RuleKind::Integrity);
    assert!(violations.first().description.contains("currency.json"));
}

#[test]
fn test_no_duplicates_rejects_repeated_imports() {
    let proto = "syntax = \"proto3\";\nimport \"common.proto\";\nimport \"common.proto\";\nmessage A { Money m = 1; }\n";
    let common = "syntax = \"proto3\";\nmessage Money { int64 units = 1; }\n";
    let lookup = InMemoryLookup::new().with("common.proto", common);
    let settings = LayeredRuleSettings::default()
        .with_global(RuleSettings::validity(ValidityLevel::Full).with_integrity(&["NO_DUPLICATES"]));

    let verdict = RuleExecutor::default()
        .validate_and_check(ArtifactType::Protobuf, &Content::from_string(proto), &scope(), &[], &settings, &lookup)
        .unwrap();
    let violations = verdict.violations().unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations.first().cause, ViolationCause::DuplicateReference);

    let relaxed = rules(ValidityLevel::Full, CompatibilityLevel::None);
    let verdict = RuleExecutor::default()
        .validate_and_check(ArtifactType::Protobuf, &Content::from_string(proto), &scope(), &[], &relaxed, &lookup)
        .unwrap();
    assert!(verdict.is_accepted(), "{:?}", verdict.violations());
}

#[test]
fn test_unavailable_lookup_is_an_error() {
    let lookup = |_: &ReferenceCoordinate| -> Result<Content, LookupError> {
        Err(LookupError::Unavailable("storage offline".to_string()))
    };
    let err = RuleExecutor::default()
        .validate_only(
            ArtifactType::Json,
            &Content::from_string(r#"{"$ref": "other.json"}"#),
            ValidityLevel::Full,
            &lookup,
        )
        .unwrap_err();
    assert!(matches!(err, RuleError::LookupFailed { .. }));
}

#[test]
fn test_panicking_lookup_is_an_error() {
    let lookup = |_: &ReferenceCoordinate| -> Result<Content, LookupError> { panic!("lookup bug") };
    let err = RuleExecutor::default()
        .validate_only(
            ArtifactType::Json,
            &Content::from_string(r#"{"$ref": "other.json"}"#),
            ValidityLevel::Full,
            &lookup,
        )
        .unwrap_err();
    assert!(err.to_string().contains("lookup bug"), "{}", err);
}

// =============================================================================
// Resource limits and configuration errors
// =============================================================================

#[test]
fn test_expired_deadline_is_resource_exhausted() {
    let executor = RuleExecutor::new(EngineConfig::default().with_stage_timeout(Duration::ZERO));
    let err = executor
        .validate_only(
            ArtifactType::Protobuf,
            &Content::from_string("syntax = \"proto3\"; message A { string a = 1; }"),
            ValidityLevel::Full,
            &InMemoryLookup::new(),
        )
        .unwrap_err();
    assert!(err.is_resource_exhausted(), "{}", err);
}

#[test]
fn test_deeply_nested_content_is_resource_exhausted() {
    let mut schema = String::from(r#""string""#);
    for _ in 0..110 {
        schema = format!(r#"{{"type": "array", "items": {}}}"#, schema);
    }
    let result = RuleExecutor::default().validate_only(
        ArtifactType::Avro,
        &Content::from_string(schema),
        ValidityLevel::Full,
        &InMemoryLookup::new(),
    );
    match result {
        Err(err) => assert!(err.is_resource_exhausted(), "{}", err),
        // serde_json's own recursion limit may reject it first
        Ok(verdict) => assert_eq!(verdict.violations().unwrap().first().cause, ViolationCause::ParseError),
    }
}

#[test]
fn test_contradictory_integrity_rules_are_a_configuration_error() {
    let settings = LayeredRuleSettings::default()
        .with_global(RuleSettings::default().with_integrity(&["NONE", "REFS_EXIST"]));
    let err = RuleExecutor::default()
        .validate_and_check(
            ArtifactType::Json,
            &Content::from_string("{}"),
            &scope(),
            &[],
            &settings,
            &InMemoryLookup::new(),
        )
        .unwrap_err();
    assert!(matches!(err, RuleError::Configuration(_)));
}

// =============================================================================
// Standalone compatibility checks
// =============================================================================

#[test]
fn test_check_compatibility_only_without_priors() {
    let executor = RuleExecutor::default();
    for level in CompatibilityLevel::ALL {
        let verdict = executor
            .check_compatibility_only(
                ArtifactType::Graphql,
                &Content::from_string("type Query { a: Int }"),
                &[],
                level,
                &InMemoryLookup::new(),
            )
            .unwrap();
        assert!(verdict.is_accepted());
    }
}

#[test]
fn test_check_compatibility_only_forward() {
    let old = r#"{"type": "object", "properties": {"a": {"type": "string"}}, "additionalProperties": false}"#;
    let new = r#"{"type": "object", "properties": {"a": {"type": "string"}, "b": {"type": "integer"}}, "additionalProperties": false}"#;
    let executor = RuleExecutor::default();
    let run = |level| {
        executor
            .check_compatibility_only(
                ArtifactType::Json,
                &Content::from_string(new),
                &[Content::from_string(old)],
                level,
                &InMemoryLookup::new(),
            )
            .unwrap()
    };

    assert!(run(CompatibilityLevel::Backward).is_accepted());
    assert!(!run(CompatibilityLevel::Forward).is_accepted());
    assert!(!run(CompatibilityLevel::Full).is_accepted());
    assert!(run(CompatibilityLevel::None).is_accepted());
}

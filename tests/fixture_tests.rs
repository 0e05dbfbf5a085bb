//! Fixture Tests for Every Artifact Type
//!
//! Realistic documents under `tests/fixtures/` must pass FULL validation,
//! canonicalize deterministically, and be classified correctly against their
//! later versions.

use std::path::{Path, PathBuf};

use registry_rules::{
    canonicalize, ArtifactType, CompatibilityLevel, Content, InMemoryLookup, RuleExecutor, RuleKind, ValidityLevel,
};

fn fixtures_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn fixture(relative: &str) -> Content {
    let path = fixtures_path().join(relative);
    Content::from_bytes(std::fs::read(&path).unwrap_or_else(|e| panic!("{}: {}", path.display(), e)))
}

fn refs() -> InMemoryLookup {
    InMemoryLookup::from_directory(fixtures_path().join("refs")).unwrap()
}

const VALID: &[(ArtifactType, &str)] = &[
    (ArtifactType::Avro, "avro/order_v1.avsc"),
    (ArtifactType::Avro, "avro/order_v2.avsc"),
    (ArtifactType::Protobuf, "protobuf/user_v1.proto"),
    (ArtifactType::Protobuf, "protobuf/user_v2_reserved.proto"),
    (ArtifactType::Json, "json/customer.schema.json"),
    (ArtifactType::Json, "json/invoice.schema.json"),
    (ArtifactType::Openapi, "openapi/petstore.yaml"),
    (ArtifactType::Asyncapi, "asyncapi/orders.yaml"),
    (ArtifactType::Graphql, "graphql/blog.graphql"),
    (ArtifactType::Kconnect, "kconnect/user.json"),
    (ArtifactType::Xml, "xml/note.xml"),
    (ArtifactType::Xsd, "xsd/order.xsd"),
    (ArtifactType::Wsdl, "wsdl/stock.wsdl"),
];

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_fixtures_pass_full_validation() {
    let executor = RuleExecutor::default();
    let lookup = refs();
    for (artifact_type, file) in VALID {
        for level in [ValidityLevel::SyntaxOnly, ValidityLevel::Full] {
            let verdict = executor
                .validate_only(*artifact_type, &fixture(file), level, &lookup)
                .unwrap();
            assert!(verdict.is_accepted(), "{} at {}: {:?}", file, level, verdict.violations());
        }
    }
}

#[test]
fn test_fixture_types_are_detected() {
    for (artifact_type, file) in VALID {
        assert_eq!(ArtifactType::detect(&fixture(file)), Some(*artifact_type), "{}", file);
    }
}

#[test]
fn test_external_ref_requires_the_document() {
    let verdict = RuleExecutor::default()
        .validate_only(
            ArtifactType::Json,
            &fixture("json/invoice.schema.json"),
            ValidityLevel::Full,
            &InMemoryLookup::new(),
        )
        .unwrap();
    assert_eq!(verdict.violations().unwrap().first().kind, RuleKind::Integrity);
}

#[test]
fn test_truncated_fixtures_fail_syntax() {
    let executor = RuleExecutor::default();
    for (artifact_type, file) in VALID {
        // Binary garbage after a valid prefix breaks every text format
        let content = fixture(file);
        let mut bytes = content.bytes()[..content.len() / 2].to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe, 0x00]);
        let verdict = executor
            .validate_only(*artifact_type, &Content::from_bytes(bytes), ValidityLevel::SyntaxOnly, &refs())
            .unwrap();
        let violations = verdict.violations().unwrap_or_else(|| panic!("{} should be rejected", file));
        assert_eq!(violations.len(), 1, "{}", file);
    }
}

// =============================================================================
// Canonicalization
// =============================================================================

#[test]
fn test_fixture_canonical_forms_are_stable() {
    for (artifact_type, file) in VALID {
        let content = fixture(file);
        let once = canonicalize(*artifact_type, &content);
        let twice = canonicalize(*artifact_type, once.as_content());
        assert_eq!(once.bytes(), twice.bytes(), "{}", file);
        assert_eq!(canonicalize(*artifact_type, &content).digest(), once.digest(), "{}", file);
    }
}

#[test]
fn test_graphql_formatting_does_not_change_digest() {
    let original = fixture("graphql/blog.graphql");
    let squashed = Content::from_string(original.as_str().unwrap().split_whitespace().collect::<Vec<_>>().join(" "));
    assert_eq!(
        canonicalize(ArtifactType::Graphql, &original).digest(),
        canonicalize(ArtifactType::Graphql, &squashed).digest()
    );
}

// =============================================================================
// Compatibility
// =============================================================================

fn compatible(artifact_type: ArtifactType, prior: &str, candidate: &str, level: CompatibilityLevel) -> bool {
    RuleExecutor::default()
        .check_compatibility_only(artifact_type, &fixture(candidate), &[fixture(prior)], level, &refs())
        .unwrap()
        .is_accepted()
}

#[test]
fn test_avro_fixture_evolution() {
    assert!(compatible(ArtifactType::Avro, "avro/order_v1.avsc", "avro/order_v2.avsc", CompatibilityLevel::Full));
    assert!(!compatible(
        ArtifactType::Avro,
        "avro/order_v2.avsc",
        "avro/order_v3_breaking.avsc",
        CompatibilityLevel::Backward
    ));
    assert!(compatible(
        ArtifactType::Avro,
        "avro/order_v2.avsc",
        "avro/order_v3_breaking.avsc",
        CompatibilityLevel::Forward
    ));
}

#[test]
fn test_protobuf_field_removal_needs_reservation() {
    assert!(!compatible(
        ArtifactType::Protobuf,
        "protobuf/user_v1.proto",
        "protobuf/user_v2_breaking.proto",
        CompatibilityLevel::Backward
    ));
    assert!(compatible(
        ArtifactType::Protobuf,
        "protobuf/user_v1.proto",
        "protobuf/user_v2_reserved.proto",
        CompatibilityLevel::Backward
    ));
}

#[test]
fn test_every_fixture_is_compatible_with_itself() {
    for (artifact_type, file) in VALID {
        assert!(compatible(*artifact_type, file, file, CompatibilityLevel::FullTransitive), "{}", file);
    }
}

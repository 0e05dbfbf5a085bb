//! Per-format rules
//!
//! Every [`ArtifactType`] maps to one static [`FormatRules`] table holding
//! its canonicalizer, reference extractor, validator and differ. The mapping
//! is an exhaustive `match`, so adding a type without rules does not compile.

pub mod avro;
pub mod graphql;
pub mod json_schema;
pub mod kconnect;
pub mod openapi;
pub mod protobuf;
pub mod xml;

use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::Value;

use crate::artifact::ArtifactType;
use crate::budget::StageBudget;
use crate::compatibility::{SchemaChange, VersionedContent};
use crate::content::Content;
use crate::error::{panic_message, Result};
use crate::references::{ReferenceCoordinate, ReferenceMap};
use crate::rules::ValidityLevel;
use crate::violation::RuleViolation;

/// Normalized bytes, or `None` when the content does not parse
pub type CanonicalizeFn = fn(&Content, &StageBudget) -> Result<Option<Vec<u8>>>;
/// Declared reference coordinates in document order
pub type ExtractReferencesFn = fn(&Content) -> Vec<ReferenceCoordinate>;
pub type ValidateFn = fn(&Content, ValidityLevel, &ReferenceMap, &StageBudget) -> Result<Vec<RuleViolation>>;
/// Changes from the first (prior) version to the second (candidate)
pub type DiffFn = fn(VersionedContent<'_>, VersionedContent<'_>, &StageBudget) -> Result<Vec<SchemaChange>>;

/// Capability set for one artifact type
pub struct FormatRules {
    pub artifact_type: ArtifactType,
    pub canonicalize: CanonicalizeFn,
    pub extract_references: ExtractReferencesFn,
    pub validate: ValidateFn,
    pub diff: DiffFn,
}

pub fn rules_for(artifact_type: ArtifactType) -> &'static FormatRules {
    match artifact_type {
        ArtifactType::Avro => &avro::RULES,
        ArtifactType::Protobuf => &protobuf::RULES,
        ArtifactType::Json => &json_schema::RULES,
        ArtifactType::Openapi => &openapi::OPENAPI_RULES,
        ArtifactType::Asyncapi => &openapi::ASYNCAPI_RULES,
        ArtifactType::Graphql => &graphql::RULES,
        ArtifactType::Kconnect => &kconnect::RULES,
        ArtifactType::Wsdl => &xml::WSDL_RULES,
        ArtifactType::Xsd => &xml::XSD_RULES,
        ArtifactType::Xml => &xml::XML_RULES,
    }
}

/// Run the validator for `artifact_type` at `level`
///
/// `NONE` performs no work. A validator that panics on hostile input is
/// reported as a parse error instead of unwinding.
pub fn validate(
    artifact_type: ArtifactType,
    level: ValidityLevel,
    content: &Content,
    references: &ReferenceMap,
    budget: &StageBudget,
) -> Result<Vec<RuleViolation>> {
    if level == ValidityLevel::None {
        return Ok(Vec::new());
    }
    let validate = rules_for(artifact_type).validate;
    match catch_unwind(AssertUnwindSafe(|| validate(content, level, references, budget))) {
        Ok(result) => result,
        Err(payload) => Ok(vec![RuleViolation::parse_error(format!(
            "Invalid {} content: {}",
            artifact_type,
            panic_message(payload.as_ref())
        ))]),
    }
}

// Shared helpers for the JSON-shaped formats

pub(crate) fn utf8(content: &Content) -> std::result::Result<&str, RuleViolation> {
    content
        .text()
        .ok_or_else(|| RuleViolation::parse_error("Content is not valid UTF-8"))
}

/// Parse JSON, mapping failure to a single located parse error
pub(crate) fn parse_json(content: &Content) -> std::result::Result<Value, RuleViolation> {
    let text = utf8(content)?;
    serde_json::from_str(text).map_err(|e| {
        RuleViolation::parse_error(format!("Invalid JSON: {}", e))
            .at(format!("{}:{}", e.line(), e.column()))
    })
}

/// Parse JSON, falling back to YAML for documents that are not JSON
pub(crate) fn parse_json_or_yaml(content: &Content) -> std::result::Result<Value, RuleViolation> {
    let text = utf8(content)?;
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return parse_json(content);
    }
    let value: Value = serde_yaml::from_str(text).map_err(|e| {
        let violation = RuleViolation::parse_error(format!("Invalid YAML: {}", e));
        match e.location() {
            Some(loc) => violation.at(format!("{}:{}", loc.line(), loc.column())),
            None => violation,
        }
    })?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(RuleViolation::parse_error("Document root must be a mapping"))
    }
}

/// RFC 8785 canonical form of a JSON value
pub(crate) fn canonical_json(value: &Value) -> Option<Vec<u8>> {
    serde_json_canonicalizer::to_vec(value).ok()
}

/// Every `$ref` string in `value` with the JSON pointer where it appears
pub(crate) fn collect_refs(value: &Value) -> Vec<(String, String)> {
    let mut refs = Vec::new();
    walk_refs(value, &mut String::new(), &mut refs);
    refs
}

fn walk_refs(value: &Value, path: &mut String, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(r)) = map.get("$ref") {
                out.push((path.clone(), r.clone()));
            }
            for (key, child) in map {
                let len = path.len();
                path.push('/');
                path.push_str(&escape_pointer(key));
                walk_refs(child, path, out);
                path.truncate(len);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                let len = path.len();
                path.push_str(&format!("/{}", i));
                walk_refs(child, path, out);
                path.truncate(len);
            }
        }
        _ => {}
    }
}

pub(crate) fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Split `doc.json#/a/b` into the document part and the fragment
pub(crate) fn split_ref(reference: &str) -> (&str, Option<&str>) {
    match reference.split_once('#') {
        Some((doc, fragment)) => (doc, Some(fragment)),
        None => (reference, None),
    }
}

/// Resolve a `#...` fragment against a document
pub(crate) fn resolve_fragment<'v>(document: &'v Value, fragment: Option<&str>) -> Option<&'v Value> {
    match fragment {
        None | Some("") | Some("/") => Some(document),
        Some(pointer) if pointer.starts_with('/') => document.pointer(pointer),
        // plain-name fragments are anchors we do not index
        Some(_) => Some(document),
    }
}

/// External document coordinates named by `$ref`s, fragments stripped
pub(crate) fn external_ref_documents(value: &Value) -> Vec<ReferenceCoordinate> {
    collect_refs(value)
        .into_iter()
        .filter_map(|(_, r)| {
            let (doc, _) = split_ref(&r);
            (!doc.is_empty() && !is_remote(doc)).then(|| ReferenceCoordinate::new(doc))
        })
        .collect()
}

/// Absolute URLs are identifiers we never fetch
pub(crate) fn is_remote(document: &str) -> bool {
    document.starts_with("http://") || document.starts_with("https://") || document.starts_with("urn:")
}

/// Local `$ref`s that do not resolve inside `document`
pub(crate) fn dangling_local_refs(document: &Value) -> Vec<RuleViolation> {
    collect_refs(document)
        .into_iter()
        .filter(|(_, r)| r.starts_with('#'))
        .filter(|(_, r)| resolve_fragment(document, split_ref(r).1).is_none())
        .map(|(path, r)| {
            RuleViolation::semantic(format!("$ref '{}' does not resolve within the document", r), path)
        })
        .collect()
}

/// Value of a JSON object as a `&str`, if present
pub(crate) fn str_field<'v>(value: &'v Value, key: &str) -> Option<&'v str> {
    value.get(key).and_then(Value::as_str)
}

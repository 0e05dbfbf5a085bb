//! OpenAPI (and Swagger 2.0) and AsyncAPI documents, as JSON or YAML

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::artifact::ArtifactType;
use crate::budget::StageBudget;
use crate::compatibility::{Breaks, ChangeType, SchemaChange, VersionedContent};
use crate::content::Content;
use crate::error::Result;
use crate::references::{ReferenceCoordinate, ReferenceMap};
use crate::rules::ValidityLevel;
use crate::violation::RuleViolation;

use super::json_schema::{dedup, external_ref_violations, SchemaDiff, SchemaDocument};
use super::{canonical_json, dangling_local_refs, escape_pointer, external_ref_documents, parse_json_or_yaml, str_field, FormatRules};

pub static OPENAPI_RULES: FormatRules = FormatRules {
    artifact_type: ArtifactType::Openapi,
    canonicalize,
    extract_references,
    validate: validate_openapi,
    diff: diff_openapi,
};

pub static ASYNCAPI_RULES: FormatRules = FormatRules {
    artifact_type: ArtifactType::Asyncapi,
    canonicalize,
    extract_references,
    validate: validate_asyncapi,
    diff: diff_asyncapi,
};

const HTTP_METHODS: &[&str] = &["get", "put", "post", "delete", "options", "head", "patch", "trace"];

fn path_parameter() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{[^}/]+\}").unwrap())
}

/// `/users/{id}` and `/users/{userId}` route the same requests
fn normalize_path(path: &str) -> String {
    path_parameter().replace_all(path.trim_end_matches('/'), "{}").into_owned()
}

fn canonicalize(content: &Content, budget: &StageBudget) -> Result<Option<Vec<u8>>> {
    budget.check()?;
    Ok(parse_json_or_yaml(content).ok().and_then(|value| canonical_json(&value)))
}

fn extract_references(content: &Content) -> Vec<ReferenceCoordinate> {
    let Ok(value) = parse_json_or_yaml(content) else {
        return Vec::new();
    };
    dedup(external_ref_documents(&value))
}

fn require(document: &Value, pointer: &str, out: &mut Vec<RuleViolation>) {
    let present = document.pointer(pointer).is_some_and(|v| !v.is_null());
    if !present {
        out.push(RuleViolation::semantic(
            format!("Required field '{}' is missing", pointer.trim_start_matches('/').replace('/', ".")),
            pointer,
        ));
    }
}

/// `operationId`s must be unique across the document
fn duplicate_operation_ids<'v>(operations: impl Iterator<Item = (String, &'v Value)>) -> Vec<RuleViolation> {
    let mut seen: HashMap<&str, String> = HashMap::new();
    let mut violations = Vec::new();
    for (location, operation) in operations {
        let Some(id) = str_field(operation, "operationId") else { continue };
        if let Some(first) = seen.get(id) {
            violations.push(RuleViolation::semantic(
                format!("operationId '{}' is already used at '{}'", id, first),
                format!("{}/operationId", location),
            ));
        } else {
            seen.insert(id, location);
        }
    }
    violations
}

fn openapi_operations(document: &Value) -> Vec<(String, &Value)> {
    let Some(paths) = document.get("paths").and_then(Value::as_object) else {
        return Vec::new();
    };
    paths
        .iter()
        .flat_map(|(path, item)| {
            HTTP_METHODS.iter().filter_map(move |method| {
                item.get(*method)
                    .map(|op| (format!("/paths/{}/{}", escape_pointer(path), method), op))
            })
        })
        .collect()
}

fn validate_openapi(content: &Content, level: ValidityLevel, references: &ReferenceMap, budget: &StageBudget) -> Result<Vec<RuleViolation>> {
    let document = match parse_json_or_yaml(content) {
        Ok(v) => v,
        Err(violation) => return Ok(vec![violation]),
    };
    if level < ValidityLevel::Full {
        return Ok(Vec::new());
    }

    let mut violations = Vec::new();
    if document.get("openapi").is_none() && document.get("swagger").is_none() {
        violations.push(RuleViolation::semantic(
            "Required field 'openapi' (or 'swagger' for 2.0 documents) is missing",
            "/openapi",
        ));
    }
    require(&document, "/info/title", &mut violations);
    require(&document, "/info/version", &mut violations);
    require(&document, "/paths", &mut violations);
    budget.check()?;

    if let Some(paths) = document.get("paths").and_then(Value::as_object) {
        let mut templates: BTreeMap<String, &str> = BTreeMap::new();
        for path in paths.keys() {
            if !path.starts_with('/') {
                violations.push(RuleViolation::semantic(
                    format!("Path '{}' must begin with '/'", path),
                    format!("/paths/{}", escape_pointer(path)),
                ));
            }
            if let Some(first) = templates.insert(normalize_path(path), path) {
                violations.push(RuleViolation::semantic(
                    format!("Path '{}' is equivalent to '{}' once parameter names are ignored", path, first),
                    format!("/paths/{}", escape_pointer(path)),
                ));
            }
        }
    }

    violations.extend(duplicate_operation_ids(openapi_operations(&document).into_iter()));
    violations.extend(dangling_local_refs(&document));
    violations.extend(external_ref_violations(&document, references));
    Ok(violations)
}

fn asyncapi_operations(document: &Value) -> Vec<(String, &Value)> {
    let mut operations = Vec::new();
    // 2.x nests publish/subscribe under channels, 3.x has a top-level map
    if let Some(channels) = document.get("channels").and_then(Value::as_object) {
        for (name, channel) in channels {
            for action in ["publish", "subscribe"] {
                if let Some(op) = channel.get(action) {
                    operations.push((format!("/channels/{}/{}", escape_pointer(name), action), op));
                }
            }
        }
    }
    if let Some(ops) = document.get("operations").and_then(Value::as_object) {
        for (name, op) in ops {
            operations.push((format!("/operations/{}", escape_pointer(name)), op));
        }
    }
    operations
}

fn validate_asyncapi(content: &Content, level: ValidityLevel, references: &ReferenceMap, budget: &StageBudget) -> Result<Vec<RuleViolation>> {
    let document = match parse_json_or_yaml(content) {
        Ok(v) => v,
        Err(violation) => return Ok(vec![violation]),
    };
    if level < ValidityLevel::Full {
        return Ok(Vec::new());
    }

    let mut violations = Vec::new();
    require(&document, "/asyncapi", &mut violations);
    require(&document, "/info/title", &mut violations);
    require(&document, "/info/version", &mut violations);
    require(&document, "/channels", &mut violations);
    budget.check()?;

    violations.extend(duplicate_operation_ids(asyncapi_operations(&document).into_iter()));
    violations.extend(dangling_local_refs(&document));
    violations.extend(external_ref_violations(&document, references));
    Ok(violations)
}

type Parsed = std::result::Result<(SchemaDocument, SchemaDocument), SchemaChange>;

fn load(prior: VersionedContent<'_>, candidate: VersionedContent<'_>) -> Parsed {
    let old = parse_json_or_yaml(prior.content).map_err(|v| SchemaChange::unparsable("prior", v.description))?;
    let new = parse_json_or_yaml(candidate.content).map_err(|v| SchemaChange::unparsable("candidate", v.description))?;
    Ok((
        SchemaDocument::new(old, prior.references),
        SchemaDocument::new(new, candidate.references),
    ))
}

fn removed(change_type: ChangeType, path: String, description: String) -> SchemaChange {
    SchemaChange::new(change_type, path, Breaks::Backward, description)
}

/// Schema-level diff of every component schema present in both versions
fn diff_component_schemas(
    old: &SchemaDocument,
    new: &SchemaDocument,
    container: &str,
    budget: &StageBudget,
    changes: &mut Vec<SchemaChange>,
) -> Result<()> {
    let (Some(old_schemas), Some(new_schemas)) = (
        old.root().pointer(container).and_then(Value::as_object),
        new.root().pointer(container).and_then(Value::as_object),
    ) else {
        return Ok(());
    };

    let mut differ = SchemaDiff::new(old, new, budget);
    for (name, old_schema) in old_schemas {
        let path = format!("{}/{}", container, escape_pointer(name));
        match new_schemas.get(name) {
            Some(new_schema) => differ.node(&path, old_schema, new_schema, 0)?,
            None => changes.push(removed(
                ChangeType::TypeRemoved,
                path,
                format!("Component schema '{}' was removed", name),
            )),
        }
    }
    changes.extend(differ.finish());
    Ok(())
}

fn diff_openapi(prior: VersionedContent<'_>, candidate: VersionedContent<'_>, budget: &StageBudget) -> Result<Vec<SchemaChange>> {
    let (old, new) = match load(prior, candidate) {
        Ok(docs) => docs,
        Err(change) => return Ok(vec![change]),
    };
    let mut changes = Vec::new();

    let empty = serde_json::Map::new();
    let old_paths = old.root().get("paths").and_then(Value::as_object).unwrap_or(&empty);
    let new_paths = new.root().get("paths").and_then(Value::as_object).unwrap_or(&empty);
    let new_by_template: HashMap<String, &Value> = new_paths.iter().map(|(p, v)| (normalize_path(p), v)).collect();

    for (path, old_item) in old_paths {
        budget.check()?;
        let pointer = format!("/paths/{}", escape_pointer(path));
        let Some(new_item) = new_by_template.get(&normalize_path(path)) else {
            changes.push(removed(ChangeType::OperationRemoved, pointer, format!("Path '{}' was removed", path)));
            continue;
        };
        for method in HTTP_METHODS {
            if old_item.get(*method).is_some() && new_item.get(*method).is_none() {
                changes.push(removed(
                    ChangeType::OperationRemoved,
                    format!("{}/{}", pointer, method),
                    format!("Operation {} {} was removed", method.to_uppercase(), path),
                ));
            }
        }
    }

    diff_component_schemas(&old, &new, "/components/schemas", budget, &mut changes)?;
    diff_component_schemas(&old, &new, "/definitions", budget, &mut changes)?;
    Ok(changes)
}

fn diff_asyncapi(prior: VersionedContent<'_>, candidate: VersionedContent<'_>, budget: &StageBudget) -> Result<Vec<SchemaChange>> {
    let (old, new) = match load(prior, candidate) {
        Ok(docs) => docs,
        Err(change) => return Ok(vec![change]),
    };
    let mut changes = Vec::new();

    if let Some(old_channels) = old.root().get("channels").and_then(Value::as_object) {
        let new_channels = new.root().get("channels").and_then(Value::as_object);
        for (name, old_channel) in old_channels {
            budget.check()?;
            let pointer = format!("/channels/{}", escape_pointer(name));
            let Some(new_channel) = new_channels.and_then(|c| c.get(name)) else {
                changes.push(removed(ChangeType::OperationRemoved, pointer, format!("Channel '{}' was removed", name)));
                continue;
            };
            for action in ["publish", "subscribe"] {
                if old_channel.get(action).is_some() && new_channel.get(action).is_none() {
                    changes.push(removed(
                        ChangeType::OperationRemoved,
                        format!("{}/{}", pointer, action),
                        format!("Operation '{}' on channel '{}' was removed", action, name),
                    ));
                }
            }
        }
    }

    if let Some(old_ops) = old.root().get("operations").and_then(Value::as_object) {
        let new_ops = new.root().get("operations").and_then(Value::as_object);
        for name in old_ops.keys().filter(|k| !new_ops.is_some_and(|ops| ops.contains_key(k.as_str()))) {
            changes.push(removed(
                ChangeType::OperationRemoved,
                format!("/operations/{}", escape_pointer(name)),
                format!("Operation '{}' was removed", name),
            ));
        }
    }

    diff_component_schemas(&old, &new, "/components/schemas", budget, &mut changes)?;
    Ok(changes)
}

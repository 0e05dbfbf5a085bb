//! Kafka Connect schemas in their JSON form

use serde_json::Value;

use crate::artifact::ArtifactType;
use crate::budget::StageBudget;
use crate::compatibility::{Breaks, ChangeType, SchemaChange, VersionedContent};
use crate::content::Content;
use crate::error::Result;
use crate::references::{ReferenceCoordinate, ReferenceMap};
use crate::rules::ValidityLevel;
use crate::violation::RuleViolation;

use super::{canonical_json, parse_json, str_field, FormatRules};

pub static RULES: FormatRules = FormatRules {
    artifact_type: ArtifactType::Kconnect,
    canonicalize,
    extract_references,
    validate,
    diff,
};

const PRIMITIVES: &[&str] = &[
    "int8", "int16", "int32", "int64", "float32", "float64", "boolean", "string", "bytes",
];

fn canonicalize(content: &Content, budget: &StageBudget) -> Result<Option<Vec<u8>>> {
    budget.check()?;
    Ok(parse_json(content).ok().and_then(|value| canonical_json(&value)))
}

fn extract_references(_content: &Content) -> Vec<ReferenceCoordinate> {
    Vec::new()
}

fn is_optional(schema: &Value) -> bool {
    schema.get("optional").and_then(Value::as_bool).unwrap_or(false)
}

fn has_default(schema: &Value) -> bool {
    schema.get("default").is_some_and(|d| !d.is_null())
}

fn fields(schema: &Value) -> &[Value] {
    schema.get("fields").and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
}

fn child_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}

fn validate(content: &Content, level: ValidityLevel, _references: &ReferenceMap, budget: &StageBudget) -> Result<Vec<RuleViolation>> {
    let value = match parse_json(content) {
        Ok(v) => v,
        Err(violation) => return Ok(vec![violation]),
    };
    if level < ValidityLevel::Full {
        return Ok(Vec::new());
    }
    let mut violations = Vec::new();
    check_schema(&value, "", 0, budget, &mut violations)?;
    Ok(violations)
}

fn check_schema(schema: &Value, path: &str, depth: usize, budget: &StageBudget, out: &mut Vec<RuleViolation>) -> Result<()> {
    budget.check_depth(depth)?;
    let context = if path.is_empty() { "$" } else { path };

    let Some(kind) = str_field(schema, "type") else {
        out.push(RuleViolation::semantic("Schema must declare a string 'type'", context));
        return Ok(());
    };
    if let Some(optional) = schema.get("optional") {
        if !optional.is_boolean() {
            out.push(RuleViolation::semantic("'optional' must be a boolean", context));
        }
    }

    match kind {
        "struct" => {
            let Some(list) = schema.get("fields").and_then(Value::as_array) else {
                out.push(RuleViolation::semantic("A struct schema must have a 'fields' array", context));
                return Ok(());
            };
            let mut seen = std::collections::HashSet::new();
            for (index, field) in list.iter().enumerate() {
                let Some(name) = str_field(field, "field") else {
                    out.push(RuleViolation::semantic(
                        format!("Field {} of struct has no 'field' name", index),
                        context,
                    ));
                    continue;
                };
                if !seen.insert(name) {
                    out.push(RuleViolation::semantic(
                        format!("Field '{}' is declared more than once", name),
                        child_path(path, name),
                    ));
                }
                check_schema(field, &child_path(path, name), depth + 1, budget, out)?;
            }
        }
        "array" => match schema.get("items") {
            Some(items) => check_schema(items, &child_path(path, "items"), depth + 1, budget, out)?,
            None => out.push(RuleViolation::semantic("An array schema must have 'items'", context)),
        },
        "map" => {
            for part in ["keys", "values"] {
                match schema.get(part) {
                    Some(inner) => check_schema(inner, &child_path(path, part), depth + 1, budget, out)?,
                    None => out.push(RuleViolation::semantic(format!("A map schema must have '{}'", part), context)),
                }
            }
        }
        primitive if PRIMITIVES.contains(&primitive) => {}
        other => out.push(RuleViolation::semantic(format!("Unknown schema type '{}'", other), context)),
    }
    Ok(())
}

fn diff(prior: VersionedContent<'_>, candidate: VersionedContent<'_>, budget: &StageBudget) -> Result<Vec<SchemaChange>> {
    let old = match parse_json(prior.content) {
        Ok(v) => v,
        Err(v) => return Ok(vec![SchemaChange::unparsable("prior", v.description)]),
    };
    let new = match parse_json(candidate.content) {
        Ok(v) => v,
        Err(v) => return Ok(vec![SchemaChange::unparsable("candidate", v.description)]),
    };
    let mut changes = Vec::new();
    diff_schema("", &old, &new, 0, budget, &mut changes)?;
    Ok(changes)
}

fn diff_schema(path: &str, old: &Value, new: &Value, depth: usize, budget: &StageBudget, out: &mut Vec<SchemaChange>) -> Result<()> {
    budget.check_depth(depth)?;
    let (old_type, new_type) = (str_field(old, "type"), str_field(new, "type"));
    if old_type != new_type {
        let (from, to) = (old_type.unwrap_or("none"), new_type.unwrap_or("none"));
        out.push(
            SchemaChange::new(
                ChangeType::TypeChanged,
                path,
                Breaks::Both,
                format!("Type of '{}' changed from {} to {}", display(path), from, to),
            )
            .with_values(from, to),
        );
        return Ok(());
    }

    match (is_optional(old), is_optional(new)) {
        (true, false) if !path.is_empty() => out.push(SchemaChange::new(
            ChangeType::OptionalityChanged,
            path,
            Breaks::Backward,
            format!("'{}' is no longer optional", display(path)),
        )),
        (false, true) if !path.is_empty() => out.push(SchemaChange::new(
            ChangeType::OptionalityChanged,
            path,
            Breaks::Forward,
            format!("'{}' became optional", display(path)),
        )),
        _ => {}
    }

    match old_type {
        Some("struct") => {
            let (old_fields, new_fields) = (fields(old), fields(new));
            for old_field in old_fields {
                let Some(name) = str_field(old_field, "field") else { continue };
                let field_path = child_path(path, name);
                match new_fields.iter().find(|f| str_field(f, "field") == Some(name)) {
                    Some(new_field) => diff_schema(&field_path, old_field, new_field, depth + 1, budget, out)?,
                    None => out.push(SchemaChange::new(
                        ChangeType::FieldRemoved,
                        &field_path,
                        Breaks::from_directions(false, !is_optional(old_field) && !has_default(old_field)),
                        format!("Field '{}' was removed", field_path),
                    )),
                }
            }
            for new_field in new_fields {
                let Some(name) = str_field(new_field, "field") else { continue };
                let existed = old_fields.iter().any(|f| str_field(f, "field") == Some(name));
                if !existed {
                    let field_path = child_path(path, name);
                    let required = !is_optional(new_field) && !has_default(new_field);
                    out.push(SchemaChange::new(
                        ChangeType::FieldAdded,
                        &field_path,
                        Breaks::from_directions(required, false),
                        if required {
                            format!("Field '{}' was added without being optional or having a default", field_path)
                        } else {
                            format!("Optional field '{}' was added", field_path)
                        },
                    ));
                }
            }
        }
        Some("array") => {
            if let (Some(o), Some(n)) = (old.get("items"), new.get("items")) {
                diff_schema(&child_path(path, "items"), o, n, depth + 1, budget, out)?;
            }
        }
        Some("map") => {
            for part in ["keys", "values"] {
                if let (Some(o), Some(n)) = (old.get(part), new.get(part)) {
                    diff_schema(&child_path(path, part), o, n, depth + 1, budget, out)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn display(path: &str) -> &str {
    if path.is_empty() {
        "$"
    } else {
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Stage;
    use serde_json::json;

    fn validate_full(schema: Value) -> Vec<RuleViolation> {
        validate(
            &Content::from_string(schema.to_string()),
            ValidityLevel::Full,
            &ReferenceMap::empty(),
            &StageBudget::unbounded(Stage::Validating),
        )
        .unwrap()
    }

    fn changes(old: Value, new: Value) -> Vec<SchemaChange> {
        let refs = ReferenceMap::empty();
        let (old, new) = (Content::from_string(old.to_string()), Content::from_string(new.to_string()));
        diff(
            VersionedContent::new(&old, &refs),
            VersionedContent::new(&new, &refs),
            &StageBudget::unbounded(Stage::CheckingCompatibility),
        )
        .unwrap()
    }

    fn user(extra: Value) -> Value {
        let mut fields = vec![
            json!({"field": "id", "type": "int64", "optional": false}),
            json!({"field": "email", "type": "string", "optional": true}),
        ];
        if !extra.is_null() {
            fields.push(extra);
        }
        json!({"type": "struct", "name": "User", "optional": false, "fields": fields})
    }

    #[test]
    fn test_valid_struct() {
        assert!(validate_full(user(json!({"field": "tags", "type": "array", "items": {"type": "string"}}))).is_empty());
    }

    #[test]
    fn test_shape_errors() {
        let violations = validate_full(json!({
            "type": "struct",
            "fields": [
                {"field": "a", "type": "int32"},
                {"field": "a", "type": "int32"},
                {"type": "string"},
                {"field": "m", "type": "map", "keys": {"type": "string"}},
                {"field": "x", "type": "decimal", "optional": "yes"}
            ]
        }));
        assert_eq!(violations.len(), 5, "{:?}", violations);
    }

    #[test]
    fn test_field_added_without_optional() {
        let found = changes(user(Value::Null), user(json!({"field": "age", "type": "int32"})));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].breaks, Breaks::Backward);

        let optional = changes(user(Value::Null), user(json!({"field": "age", "type": "int32", "optional": true})));
        assert_eq!(optional[0].breaks, Breaks::None);
    }

    #[test]
    fn test_field_removed_and_type_changed() {
        let old = user(json!({"field": "age", "type": "int32"}));
        let new = json!({"type": "struct", "name": "User", "fields": [
            {"field": "id", "type": "string", "optional": false},
            {"field": "email", "type": "string", "optional": true}
        ]});
        let found = changes(old, new);
        let kinds: Vec<(ChangeType, Breaks)> = found.iter().map(|c| (c.change_type, c.breaks)).collect();
        assert_eq!(kinds, vec![(ChangeType::TypeChanged, Breaks::Both), (ChangeType::FieldRemoved, Breaks::Forward)]);
    }
}

//! JSON Schema documents
//!
//! Validation compiles the schema with `jsonschema`, which checks it against
//! its draft's meta-schema, then checks every `$ref`. Compatibility compares
//! the sets of instances each version accepts: a change that rejects data
//! the prior version accepted breaks backward, one that produces data the
//! prior version would reject breaks forward.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::algo::kosaraju_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;

use crate::artifact::ArtifactType;
use crate::budget::StageBudget;
use crate::compatibility::{Breaks, ChangeType, SchemaChange, VersionedContent};
use crate::content::Content;
use crate::error::Result;
use crate::references::{ReferenceCoordinate, ReferenceMap};
use crate::rules::ValidityLevel;
use crate::violation::RuleViolation;

use super::{
    canonical_json, collect_refs, dangling_local_refs, escape_pointer, external_ref_documents, is_remote, parse_json,
    resolve_fragment, split_ref, FormatRules,
};

pub static RULES: FormatRules = FormatRules {
    artifact_type: ArtifactType::Json,
    canonicalize,
    extract_references,
    validate,
    diff,
};

const MAX_REF_HOPS: usize = 32;

/// Keywords allowed beside `$ref` in a node that is nothing but a reference
const ANNOTATIONS: &[&str] = &["$ref", "title", "description", "$comment"];

fn canonicalize(content: &Content, budget: &StageBudget) -> Result<Option<Vec<u8>>> {
    budget.check()?;
    Ok(parse_json(content).ok().and_then(|value| canonical_json(&value)))
}

fn extract_references(content: &Content) -> Vec<ReferenceCoordinate> {
    let Ok(value) = parse_json(content) else {
        return Vec::new();
    };
    dedup(external_ref_documents(&value))
}

/// One document may point into the same external file many times
pub(crate) fn dedup(coordinates: Vec<ReferenceCoordinate>) -> Vec<ReferenceCoordinate> {
    let mut seen = HashSet::new();
    coordinates.into_iter().filter(|c| seen.insert(c.clone())).collect()
}

fn validate(content: &Content, level: ValidityLevel, references: &ReferenceMap, budget: &StageBudget) -> Result<Vec<RuleViolation>> {
    let value = match parse_json(content) {
        Ok(v) => v,
        Err(violation) => return Ok(vec![violation]),
    };
    if level < ValidityLevel::Full {
        return Ok(Vec::new());
    }

    let mut violations = Vec::new();
    if !value.is_object() && !value.is_boolean() {
        violations.push(RuleViolation::semantic("A JSON Schema must be an object or a boolean", ""));
        return Ok(violations);
    }

    if let Err(error) = jsonschema::JSONSchema::compile(&value) {
        violations.push(RuleViolation::semantic(
            format!("Schema does not conform to its meta-schema: {}", error),
            error.instance_path.to_string(),
        ));
    }
    budget.check()?;

    violations.extend(dangling_local_refs(&value));
    violations.extend(external_ref_violations(&value, references));
    violations.extend(reference_cycles(&value));
    Ok(violations)
}

/// External `$ref`s must name a supplied reference and a fragment that exists in it
pub(crate) fn external_ref_violations(document: &Value, references: &ReferenceMap) -> Vec<RuleViolation> {
    let mut parsed: HashMap<&str, Option<Value>> = HashMap::new();
    let mut violations = Vec::new();

    for (path, reference) in collect_refs(document) {
        let (doc, fragment) = split_ref(&reference);
        if doc.is_empty() || is_remote(doc) {
            continue;
        }
        let Some((key, content)) = references.iter().find(|(k, _)| k.as_str() == doc) else {
            violations.push(RuleViolation::semantic(
                format!("$ref '{}' names a document that was not supplied as a reference", reference),
                path,
            ));
            continue;
        };
        let target = parsed
            .entry(key.as_str())
            .or_insert_with(|| parse_json(content).ok());
        match target {
            None => violations.push(RuleViolation::semantic(
                format!("Referenced document '{}' is not valid JSON", doc),
                path,
            )),
            Some(target) if resolve_fragment(target, fragment).is_none() => {
                violations.push(RuleViolation::semantic(
                    format!("$ref '{}' does not resolve in the referenced document", reference),
                    path,
                ))
            }
            Some(_) => {}
        }
    }
    violations
}

fn is_pure_ref(node: &Value) -> bool {
    node.as_object()
        .is_some_and(|map| map.contains_key("$ref") && map.keys().all(|k| ANNOTATIONS.contains(&k.as_str())))
}

/// Chains of nodes that are only `$ref`s and lead back to themselves
fn reference_cycles(document: &Value) -> Vec<RuleViolation> {
    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut nodes: HashMap<String, NodeIndex> = HashMap::new();
    let mut pending = Vec::new();

    for (path, reference) in collect_refs(document) {
        let Some(pointer) = reference.strip_prefix('#') else { continue };
        if !document.pointer(&path).is_some_and(is_pure_ref) {
            continue;
        }
        let index = graph.add_node(path.clone());
        nodes.insert(path.clone(), index);
        pending.push((index, pointer.trim_end_matches('/').to_string()));
    }

    let mut self_loops = BTreeSet::new();
    for (from, target) in pending {
        if let Some(&to) = nodes.get(&target) {
            graph.add_edge(from, to, ());
            if from == to {
                self_loops.insert(from);
            }
        }
    }

    let mut cycles: Vec<Vec<String>> = kosaraju_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || scc.iter().any(|i| self_loops.contains(i)))
        .map(|scc| {
            let mut members: Vec<String> = scc.into_iter().filter_map(|i| graph.node_weight(i).cloned()).collect();
            members.sort();
            members
        })
        .collect();
    cycles.sort();

    cycles
        .into_iter()
        .map(|members| {
            let shown: Vec<String> = members.iter().map(|m| format!("#{}", m)).collect();
            RuleViolation::semantic(
                format!("$ref cycle with no schema in between: {}", shown.join(" -> ")),
                members[0].clone(),
            )
        })
        .collect()
}

/// A schema document with its external references parsed, for following `$ref`s
pub(crate) struct SchemaDocument {
    root: Value,
    external: HashMap<String, Value>,
}

impl SchemaDocument {
    pub fn new(root: Value, references: &ReferenceMap) -> Self {
        let external = references
            .iter()
            .filter_map(|(k, c)| parse_json(c).ok().map(|v| (k.as_str().to_string(), v)))
            .collect();
        Self { root, external }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Follow `$ref` until a node with content is reached; unresolvable refs stay as they are
    pub fn deref<'a>(&'a self, mut node: &'a Value) -> &'a Value {
        let mut current_doc = &self.root;
        for _ in 0..MAX_REF_HOPS {
            let Some(reference) = node.get("$ref").and_then(Value::as_str) else {
                return node;
            };
            let (doc, fragment) = split_ref(reference);
            if !doc.is_empty() {
                match self.external.get(doc) {
                    Some(external) => current_doc = external,
                    None => return node,
                }
            }
            match resolve_fragment(current_doc, fragment) {
                Some(target) if !std::ptr::eq(target, node) => node = target,
                _ => return node,
            }
        }
        node
    }
}

fn diff(prior: VersionedContent<'_>, candidate: VersionedContent<'_>, budget: &StageBudget) -> Result<Vec<SchemaChange>> {
    let old = match parse_json(prior.content) {
        Ok(v) => SchemaDocument::new(v, prior.references),
        Err(v) => return Ok(vec![SchemaChange::unparsable("prior", v.description)]),
    };
    let new = match parse_json(candidate.content) {
        Ok(v) => SchemaDocument::new(v, candidate.references),
        Err(v) => return Ok(vec![SchemaChange::unparsable("candidate", v.description)]),
    };
    let mut differ = SchemaDiff::new(&old, &new, budget);
    differ.node("", old.root(), new.root(), 0)?;
    Ok(differ.finish())
}

/// Recursive structural comparison of two schema nodes
pub(crate) struct SchemaDiff<'a> {
    old: &'a SchemaDocument,
    new: &'a SchemaDocument,
    budget: &'a StageBudget,
    visited: HashSet<(usize, usize)>,
    changes: Vec<SchemaChange>,
}

impl<'a> SchemaDiff<'a> {
    pub fn new(old: &'a SchemaDocument, new: &'a SchemaDocument, budget: &'a StageBudget) -> Self {
        Self {
            old,
            new,
            budget,
            visited: HashSet::new(),
            changes: Vec::new(),
        }
    }

    pub fn finish(self) -> Vec<SchemaChange> {
        self.changes
    }

    pub fn node(&mut self, path: &str, old: &'a Value, new: &'a Value, depth: usize) -> Result<()> {
        self.budget.check_depth(depth)?;
        let old = self.old.deref(old);
        let new = self.new.deref(new);
        let key = (old as *const Value as usize, new as *const Value as usize);
        if !self.visited.insert(key) {
            return Ok(());
        }

        self.types(path, old, new);
        self.enums(path, old, new);
        self.bounds(path, old, new);
        self.object(path, old, new, depth)?;

        if let (Some(old_items), Some(new_items)) = (old.get("items"), new.get("items")) {
            if old_items.is_object() && new_items.is_object() {
                self.node(&format!("{}/items", path), old_items, new_items, depth + 1)?;
            }
        }
        Ok(())
    }

    fn push(&mut self, change: SchemaChange) {
        self.changes.push(change);
    }

    fn types(&mut self, path: &str, old: &Value, new: &Value) {
        let (old_types, new_types) = (type_set(old), type_set(new));
        let (backward, forward) = match (&old_types, &new_types) {
            (None, None) => return,
            (None, Some(_)) => (true, false),
            (Some(_), None) => (false, true),
            (Some(o), Some(n)) => (
                o.iter().any(|t| !accepts(n, t)),
                n.iter().any(|t| !accepts(o, t)),
            ),
        };
        if !backward && !forward {
            return;
        }
        let show = |t: &Option<BTreeSet<String>>| match t {
            Some(set) => set.iter().cloned().collect::<Vec<_>>().join("|"),
            None => "any".to_string(),
        };
        let (from, to) = (show(&old_types), show(&new_types));
        let verb = match (backward, forward) {
            (true, false) => "narrowed",
            (false, true) => "widened",
            _ => "changed",
        };
        self.push(
            SchemaChange::new(
                ChangeType::TypeChanged,
                path,
                Breaks::from_directions(backward, forward),
                format!("Type at '{}' {} from {} to {}", display(path), verb, from, to),
            )
            .with_values(from, to),
        );
    }

    fn enums(&mut self, path: &str, old: &Value, new: &Value) {
        let (Some(old_values), Some(new_values)) = (
            old.get("enum").and_then(Value::as_array),
            new.get("enum").and_then(Value::as_array),
        ) else {
            return;
        };
        for value in old_values.iter().filter(|v| !new_values.contains(v)) {
            self.push(SchemaChange::new(
                ChangeType::EnumVariantRemoved,
                path,
                Breaks::Backward,
                format!("Enum value {} was removed at '{}'", value, display(path)),
            ));
        }
        for value in new_values.iter().filter(|v| !old_values.contains(v)) {
            self.push(SchemaChange::new(
                ChangeType::EnumVariantAdded,
                path,
                Breaks::Forward,
                format!("Enum value {} was added at '{}'", value, display(path)),
            ));
        }
    }

    fn bounds(&mut self, path: &str, old: &Value, new: &Value) {
        const UPPER: &[&str] = &["maximum", "exclusiveMaximum", "maxLength", "maxItems", "maxProperties"];
        const LOWER: &[&str] = &["minimum", "exclusiveMinimum", "minLength", "minItems", "minProperties"];

        for (keyword, is_upper) in UPPER.iter().map(|k| (k, true)).chain(LOWER.iter().map(|k| (k, false))) {
            let old_bound = old.get(*keyword).and_then(Value::as_f64);
            let new_bound = new.get(*keyword).and_then(Value::as_f64);
            let (tightened, relaxed) = match (old_bound, new_bound) {
                (None, None) => continue,
                (None, Some(_)) => (true, false),
                (Some(_), None) => (false, true),
                (Some(o), Some(n)) if is_upper => (n < o, n > o),
                (Some(o), Some(n)) => (n > o, n < o),
            };
            if !tightened && !relaxed {
                continue;
            }
            let show = |b: Option<f64>| b.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string());
            self.push(
                SchemaChange::new(
                    ChangeType::ConstraintChanged,
                    format!("{}/{}", path, keyword),
                    Breaks::from_directions(tightened, relaxed),
                    format!(
                        "'{}' at '{}' was {} from {} to {}",
                        keyword,
                        display(path),
                        if tightened { "tightened" } else { "relaxed" },
                        show(old_bound),
                        show(new_bound)
                    ),
                )
                .with_values(show(old_bound), show(new_bound)),
            );
        }
    }

    fn object(&mut self, path: &str, old: &'a Value, new: &'a Value, depth: usize) -> Result<()> {
        let old_props = old.get("properties").and_then(Value::as_object);
        let new_props = new.get("properties").and_then(Value::as_object);
        let (old_required, new_required) = (required_set(old), required_set(new));
        let (old_closed, new_closed) = (is_closed(old), is_closed(new));

        for (name, old_prop) in old_props.into_iter().flatten() {
            let prop_path = format!("{}/properties/{}", path, escape_pointer(name));
            match new_props.and_then(|p| p.get(name)) {
                Some(new_prop) => self.node(&prop_path, old_prop, new_prop, depth + 1)?,
                None => self.push(SchemaChange::new(
                    ChangeType::FieldRemoved,
                    &prop_path,
                    Breaks::from_directions(new_closed, false),
                    format!("Property '{}' was removed at '{}'", name, display(path)),
                )),
            }
        }
        let existed = |name: &str| old_props.is_some_and(|p| p.contains_key(name));
        for name in new_props.into_iter().flat_map(|p| p.keys()).filter(|k| !existed(k.as_str())) {
            self.push(SchemaChange::new(
                ChangeType::FieldAdded,
                format!("{}/properties/{}", path, escape_pointer(name)),
                Breaks::from_directions(false, old_closed),
                format!("Property '{}' was added at '{}'", name, display(path)),
            ));
        }

        for name in new_required.difference(&old_required) {
            let description = if existed(name) {
                format!("Optional property '{}' became required at '{}'", name, display(path))
            } else {
                format!("Required property '{}' was added at '{}'", name, display(path))
            };
            self.push(SchemaChange::new(
                ChangeType::OptionalityChanged,
                format!("{}/required/{}", path, escape_pointer(name)),
                Breaks::Backward,
                description,
            ));
        }
        for name in old_required.difference(&new_required) {
            self.push(SchemaChange::new(
                ChangeType::OptionalityChanged,
                format!("{}/required/{}", path, escape_pointer(name)),
                Breaks::Forward,
                format!("Property '{}' is no longer required at '{}'", name, display(path)),
            ));
        }

        match (old_closed, new_closed) {
            (false, true) => self.push(SchemaChange::new(
                ChangeType::ConstraintChanged,
                format!("{}/additionalProperties", path),
                Breaks::Backward,
                format!("Additional properties are no longer allowed at '{}'", display(path)),
            )),
            (true, false) => self.push(SchemaChange::new(
                ChangeType::ConstraintChanged,
                format!("{}/additionalProperties", path),
                Breaks::Forward,
                format!("Additional properties are now allowed at '{}'", display(path)),
            )),
            _ => {}
        }
        Ok(())
    }
}

fn display(path: &str) -> &str {
    if path.is_empty() {
        "/"
    } else {
        path
    }
}

fn type_set(schema: &Value) -> Option<BTreeSet<String>> {
    match schema.get("type")? {
        Value::String(t) => Some(BTreeSet::from([t.clone()])),
        Value::Array(types) => Some(types.iter().filter_map(Value::as_str).map(str::to_string).collect()),
        _ => None,
    }
}

/// Whether a type set accepts every instance of type `t`
fn accepts(types: &BTreeSet<String>, t: &str) -> bool {
    types.contains(t) || (t == "integer" && types.contains("number"))
}

fn required_set(schema: &Value) -> BTreeSet<String> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn is_closed(schema: &Value) -> bool {
    schema.get("additionalProperties") == Some(&Value::Bool(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Stage;
    use crate::violation::ViolationCause;
    use serde_json::json;

    fn validate_full(schema: &Value, references: &ReferenceMap) -> Vec<RuleViolation> {
        validate(
            &Content::from_string(schema.to_string()),
            ValidityLevel::Full,
            references,
            &StageBudget::unbounded(Stage::Validating),
        )
        .unwrap()
    }

    fn changes(old: &Value, new: &Value) -> Vec<SchemaChange> {
        let refs = ReferenceMap::empty();
        let (old, new) = (Content::from_string(old.to_string()), Content::from_string(new.to_string()));
        diff(
            VersionedContent::new(&old, &refs),
            VersionedContent::new(&new, &refs),
            &StageBudget::unbounded(Stage::CheckingCompatibility),
        )
        .unwrap()
    }

    #[test]
    fn test_malformed_json_is_one_parse_error() {
        let violations = validate(
            &Content::from_string("{\"type\": \"object\",,}"),
            ValidityLevel::SyntaxOnly,
            &ReferenceMap::empty(),
            &StageBudget::unbounded(Stage::Validating),
        )
        .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].cause, ViolationCause::ParseError);
        assert!(violations[0].context.as_deref().is_some_and(|c| c.starts_with("1:")));
    }

    #[test]
    fn test_meta_schema_violation() {
        let violations = validate_full(&json!({"type": "object", "properties": {"a": {"type": 12}}}), &ReferenceMap::empty());
        assert_eq!(violations.len(), 1);
        assert!(violations[0].description.contains("meta-schema"));
    }

    #[test]
    fn test_local_and_external_refs() {
        let schema = json!({
            "definitions": {"name": {"type": "string"}},
            "properties": {
                "a": {"$ref": "#/definitions/name"},
                "b": {"$ref": "#/definitions/missing"},
                "c": {"$ref": "common.json#/definitions/id"},
                "d": {"$ref": "common.json#/definitions/nope"},
                "e": {"$ref": "https://example.com/remote.json"}
            }
        });
        let refs = ReferenceMap::from_entries([(
            "common.json",
            Content::from_string(json!({"definitions": {"id": {"type": "integer"}}}).to_string()),
        )]);
        let violations = validate_full(&schema, &refs);
        let contexts: Vec<&str> = violations.iter().filter_map(|v| v.context.as_deref()).collect();
        assert_eq!(contexts, vec!["/properties/b", "/properties/d"]);

        let missing = validate_full(&schema, &ReferenceMap::empty());
        assert_eq!(missing.len(), 3);
    }

    #[test]
    fn test_pure_ref_cycle_detected() {
        let schema = json!({
            "definitions": {
                "a": {"$ref": "#/definitions/b"},
                "b": {"$ref": "#/definitions/a"},
                "tree": {"type": "object", "properties": {"children": {"type": "array", "items": {"$ref": "#/definitions/tree"}}}}
            }
        });
        let violations = validate_full(&schema, &ReferenceMap::empty());
        assert_eq!(violations.len(), 1, "{:?}", violations);
        assert!(violations[0].description.contains("#/definitions/a -> #/definitions/b"));
    }

    #[test]
    fn test_references_are_deduplicated() {
        let content = Content::from_string(
            json!({"properties": {"a": {"$ref": "x.json#/a"}, "b": {"$ref": "x.json#/b"}, "c": {"$ref": "#/d"}}})
                .to_string(),
        );
        assert_eq!(extract_references(&content), vec![ReferenceCoordinate::new("x.json")]);
    }

    #[test]
    fn test_property_and_required_changes() {
        let v1 = json!({"type": "object", "properties": {"id": {"type": "string"}, "note": {"type": "string"}}, "required": ["id"]});
        let v2 = json!({"type": "object", "properties": {"id": {"type": "string"}, "email": {"type": "string"}}, "required": ["id", "email"]});
        let found = changes(&v1, &v2);

        let required: Vec<&SchemaChange> = found.iter().filter(|c| c.change_type == ChangeType::OptionalityChanged).collect();
        assert_eq!(required.len(), 1);
        assert_eq!(required[0].breaks, Breaks::Backward);
        assert_eq!(required[0].path, "/required/email");

        // open content model: adding or removing a property breaks nobody
        assert!(found
            .iter()
            .filter(|c| matches!(c.change_type, ChangeType::FieldAdded | ChangeType::FieldRemoved))
            .all(|c| c.breaks == Breaks::None));
    }

    #[test]
    fn test_type_narrowing_and_widening() {
        let v1 = json!({"properties": {"n": {"type": "number"}}});
        let v2 = json!({"properties": {"n": {"type": "integer"}}});
        let narrowed = changes(&v1, &v2);
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed[0].breaks, Breaks::Backward);
        assert_eq!(narrowed[0].path, "/properties/n");

        let widened = changes(&v2, &v1);
        assert_eq!(widened[0].breaks, Breaks::Forward);
    }

    #[test]
    fn test_closed_content_and_enums() {
        let v1 = json!({"type": "object", "properties": {"s": {"enum": ["a", "b"]}}});
        let v2 = json!({"type": "object", "properties": {"s": {"enum": ["a", "c"]}}, "additionalProperties": false});
        let found = changes(&v1, &v2);
        let kinds: Vec<(ChangeType, Breaks)> = found.iter().map(|c| (c.change_type, c.breaks)).collect();
        assert!(kinds.contains(&(ChangeType::EnumVariantRemoved, Breaks::Backward)));
        assert!(kinds.contains(&(ChangeType::EnumVariantAdded, Breaks::Forward)));
        assert!(kinds.contains(&(ChangeType::ConstraintChanged, Breaks::Backward)));
    }

    #[test]
    fn test_recursive_schemas_terminate() {
        let tree = json!({
            "definitions": {"node": {"type": "object", "properties": {"kids": {"type": "array", "items": {"$ref": "#/definitions/node"}}}}},
            "$ref": "#/definitions/node"
        });
        assert!(changes(&tree, &tree).is_empty());
    }

    #[test]
    fn test_nested_array_items_are_compared() {
        let v1 = json!({"properties": {"xs": {"type": "array", "items": {"type": "object", "properties": {"v": {"type": "string"}}}}}});
        let v2 = json!({"properties": {"xs": {"type": "array", "items": {"type": "object", "properties": {"v": {"type": "boolean"}}}}}});
        let found = changes(&v1, &v2);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, "/properties/xs/items/properties/v");
        assert_eq!(found[0].breaks, Breaks::Both);
    }
}

//! Apache Avro schemas
//!
//! Syntax is checked with `apache-avro`. Semantic checks and compatibility
//! run over a small structural model parsed from the schema JSON, with named
//! types from resolved references merged in.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::artifact::ArtifactType;
use crate::budget::StageBudget;
use crate::compatibility::{merge_directional, Breaks, ChangeType, SchemaChange, VersionedContent};
use crate::content::Content;
use crate::error::{Result, RuleError};
use crate::executor::Stage;
use crate::references::{ReferenceCoordinate, ReferenceMap};
use crate::rules::ValidityLevel;
use crate::violation::RuleViolation;

use super::{canonical_json, parse_json, str_field, FormatRules};

pub static RULES: FormatRules = FormatRules {
    artifact_type: ArtifactType::Avro,
    canonicalize,
    extract_references,
    validate,
    diff,
};

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Primitive {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    Bytes,
    String,
}

impl Primitive {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "null" => Primitive::Null,
            "boolean" => Primitive::Boolean,
            "int" => Primitive::Int,
            "long" => Primitive::Long,
            "float" => Primitive::Float,
            "double" => Primitive::Double,
            "bytes" => Primitive::Bytes,
            "string" => Primitive::String,
            _ => return None,
        })
    }

    fn name(&self) -> &'static str {
        match self {
            Primitive::Null => "null",
            Primitive::Boolean => "boolean",
            Primitive::Int => "int",
            Primitive::Long => "long",
            Primitive::Float => "float",
            Primitive::Double => "double",
            Primitive::Bytes => "bytes",
            Primitive::String => "string",
        }
    }

    /// Whether data written as `self` can be read as `reader`
    fn promotes_to(self, reader: Primitive) -> bool {
        use Primitive::*;
        self == reader
            || matches!(
                (self, reader),
                (Int, Long | Float | Double) | (Long, Float | Double) | (Float, Double) | (String, Bytes) | (Bytes, String)
            )
    }
}

#[derive(Debug, Clone)]
enum AvroType {
    Primitive(Primitive),
    Array(Box<AvroType>),
    Map(Box<AvroType>),
    Union(Vec<AvroType>),
    /// Full name of a record, enum or fixed
    Named(String),
}

#[derive(Debug, Clone)]
struct Field {
    name: String,
    aliases: Vec<String>,
    schema: AvroType,
    default: Option<Value>,
}

#[derive(Debug, Clone)]
enum NamedType {
    Record { name: String, aliases: Vec<String>, fields: Vec<Field> },
    Enum { name: String, aliases: Vec<String>, symbols: Vec<String>, default: Option<String> },
    Fixed { name: String, aliases: Vec<String>, size: u64 },
}

impl NamedType {
    fn name(&self) -> &str {
        match self {
            NamedType::Record { name, .. } | NamedType::Enum { name, .. } | NamedType::Fixed { name, .. } => name,
        }
    }

    fn aliases(&self) -> &[String] {
        match self {
            NamedType::Record { aliases, .. } | NamedType::Enum { aliases, .. } | NamedType::Fixed { aliases, .. } => {
                aliases
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            NamedType::Record { .. } => "record",
            NamedType::Enum { .. } => "enum",
            NamedType::Fixed { .. } => "fixed",
        }
    }
}

fn full_name(name: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() && !name.contains('.') => format!("{}.{}", ns, name),
        _ => name.to_string(),
    }
}

fn simple_name(full: &str) -> &str {
    full.rsplit('.').next().unwrap_or(full)
}

fn namespace_of(full: &str) -> Option<&str> {
    full.rsplit_once('.').map(|(ns, _)| ns)
}

enum ParseFailure {
    Invalid(String),
    Exhausted(RuleError),
}

impl From<RuleError> for ParseFailure {
    fn from(e: RuleError) -> Self {
        ParseFailure::Exhausted(e)
    }
}

type ParseResult<T> = std::result::Result<T, ParseFailure>;

fn invalid<T>(message: impl Into<String>) -> ParseResult<T> {
    Err(ParseFailure::Invalid(message.into()))
}

/// Builds the structural model and records semantic findings on the way
struct SchemaParser<'b> {
    budget: &'b StageBudget,
    named: HashMap<String, NamedType>,
    /// Named-type uses with the path they appear at
    uses: Vec<(String, String)>,
    findings: Vec<RuleViolation>,
}

impl<'b> SchemaParser<'b> {
    fn new(budget: &'b StageBudget) -> Self {
        Self {
            budget,
            named: HashMap::new(),
            uses: Vec::new(),
            findings: Vec::new(),
        }
    }

    fn check_name(&mut self, name: &str, what: &str, path: &str) {
        if !name_pattern().is_match(name) {
            self.findings.push(RuleViolation::semantic(
                format!("Invalid {} name '{}'", what, name),
                path,
            ));
        }
    }

    fn check_namespace(&mut self, namespace: &str, path: &str) {
        if namespace.is_empty() {
            return;
        }
        if namespace.split('.').any(|part| !name_pattern().is_match(part)) {
            self.findings.push(RuleViolation::semantic(
                format!("Invalid namespace '{}'", namespace),
                path,
            ));
        }
    }

    fn parse(&mut self, value: &Value, namespace: Option<&str>, path: &str, depth: usize) -> ParseResult<AvroType> {
        self.budget.check_depth(depth)?;
        match value {
            Value::String(name) => Ok(self.type_reference(name, namespace, path)),
            Value::Array(branches) => self.parse_union(branches, namespace, path, depth),
            Value::Object(_) => self.parse_object(value, namespace, path, depth),
            other => invalid(format!("'{}' is not a valid Avro type at {}", other, display_path(path))),
        }
    }

    fn type_reference(&mut self, name: &str, namespace: Option<&str>, path: &str) -> AvroType {
        match Primitive::from_name(name) {
            Some(p) => AvroType::Primitive(p),
            None => {
                let full = full_name(name, namespace);
                self.uses.push((full.clone(), path.to_string()));
                AvroType::Named(full)
            }
        }
    }

    fn parse_union(&mut self, branches: &[Value], namespace: Option<&str>, path: &str, depth: usize) -> ParseResult<AvroType> {
        let mut parsed = Vec::with_capacity(branches.len());
        let mut seen = HashSet::new();
        for branch in branches {
            let t = self.parse(branch, namespace, path, depth + 1)?;
            if matches!(t, AvroType::Union(_)) {
                self.findings.push(RuleViolation::semantic("Unions may not immediately contain other unions", path));
            }
            let key = union_key(&t);
            if !seen.insert(key.clone()) {
                self.findings.push(RuleViolation::semantic(
                    format!("Union contains more than one '{}' branch", key),
                    path,
                ));
            }
            parsed.push(t);
        }
        Ok(AvroType::Union(parsed))
    }

    fn parse_object(&mut self, value: &Value, namespace: Option<&str>, path: &str, depth: usize) -> ParseResult<AvroType> {
        let type_value = match value.get("type") {
            Some(t) => t,
            None => return invalid(format!("Missing 'type' at {}", display_path(path))),
        };
        let type_name = match type_value {
            Value::String(s) => s.as_str(),
            // {"type": {...}} or {"type": [...]} wraps another schema
            nested => return self.parse(nested, namespace, path, depth + 1),
        };
        match type_name {
            "record" | "error" => self.parse_record(value, namespace, path, depth),
            "enum" => self.parse_enum(value, namespace, path),
            "fixed" => self.parse_fixed(value, namespace, path),
            "array" => match value.get("items") {
                Some(items) => Ok(AvroType::Array(Box::new(self.parse(items, namespace, path, depth + 1)?))),
                None => invalid(format!("Array at {} has no 'items'", display_path(path))),
            },
            "map" => match value.get("values") {
                Some(values) => Ok(AvroType::Map(Box::new(self.parse(values, namespace, path, depth + 1)?))),
                None => invalid(format!("Map at {} has no 'values'", display_path(path))),
            },
            other => Ok(self.type_reference(other, namespace, path)),
        }
    }

    /// Name, effective namespace and aliases of a named type definition
    fn named_header(&mut self, value: &Value, namespace: Option<&str>, path: &str) -> ParseResult<(String, Vec<String>)> {
        let name = match str_field(value, "name") {
            Some(n) => n,
            None => return invalid(format!("Named type at {} has no 'name'", display_path(path))),
        };
        let explicit_ns = str_field(value, "namespace");
        let full = if name.contains('.') {
            name.to_string()
        } else {
            full_name(name, explicit_ns.or(namespace))
        };
        self.check_name(simple_name(&full), "type", path);
        if let Some(ns) = namespace_of(&full) {
            self.check_namespace(ns, path);
        }
        let aliases = string_array(value.get("aliases"))
            .into_iter()
            .map(|a| full_name(&a, namespace_of(&full)))
            .collect();
        if self.named.contains_key(&full) {
            self.findings.push(RuleViolation::semantic(
                format!("Type '{}' is defined more than once", full),
                path,
            ));
        }
        Ok((full, aliases))
    }

    fn parse_record(&mut self, value: &Value, namespace: Option<&str>, path: &str, depth: usize) -> ParseResult<AvroType> {
        let (name, aliases) = self.named_header(value, namespace, path)?;
        let fields_value = match value.get("fields").and_then(Value::as_array) {
            Some(f) => f,
            None => return invalid(format!("Record '{}' has no 'fields' array", name)),
        };
        // register early so the record can refer to itself
        self.named.insert(
            name.clone(),
            NamedType::Record { name: name.clone(), aliases: aliases.clone(), fields: Vec::new() },
        );

        let record_ns = namespace_of(&name).map(str::to_string);
        let record_simple = simple_name(&name).to_string();
        let mut fields = Vec::with_capacity(fields_value.len());
        let mut seen = HashSet::new();
        for field in fields_value {
            self.budget.check()?;
            let field_name = match str_field(field, "name") {
                Some(n) => n.to_string(),
                None => return invalid(format!("Field in record '{}' has no 'name'", name)),
            };
            let field_path = format!("{}.{}", record_simple, field_name);
            self.check_name(&field_name, "field", &field_path);
            if !seen.insert(field_name.clone()) {
                self.findings.push(RuleViolation::semantic(
                    format!("Duplicate field name '{}' in record '{}'", field_name, name),
                    &field_path,
                ));
            }
            let field_type = match field.get("type") {
                Some(t) => t,
                None => return invalid(format!("Field '{}' has no 'type'", field_path)),
            };
            let schema = self.parse(field_type, record_ns.as_deref(), &field_path, depth + 1)?;
            fields.push(Field {
                name: field_name,
                aliases: string_array(field.get("aliases")),
                schema,
                default: field.get("default").cloned(),
            });
        }

        self.named.insert(name.clone(), NamedType::Record { name: name.clone(), aliases, fields });
        Ok(AvroType::Named(name))
    }

    fn parse_enum(&mut self, value: &Value, namespace: Option<&str>, path: &str) -> ParseResult<AvroType> {
        let (name, aliases) = self.named_header(value, namespace, path)?;
        let symbols_value = match value.get("symbols").and_then(Value::as_array) {
            Some(s) => s,
            None => return invalid(format!("Enum '{}' has no 'symbols' array", name)),
        };
        let mut symbols = Vec::with_capacity(symbols_value.len());
        let mut seen = HashSet::new();
        for symbol in symbols_value {
            let symbol = match symbol.as_str() {
                Some(s) => s.to_string(),
                None => return invalid(format!("Enum '{}' has a non-string symbol", name)),
            };
            let symbol_path = format!("{}.{}", simple_name(&name), symbol);
            self.check_name(&symbol, "enum symbol", &symbol_path);
            if !seen.insert(symbol.clone()) {
                self.findings.push(RuleViolation::semantic(
                    format!("Duplicate symbol '{}' in enum '{}'", symbol, name),
                    symbol_path,
                ));
            }
            symbols.push(symbol);
        }
        let default = str_field(value, "default").map(str::to_string);
        if let Some(d) = &default {
            if !symbols.contains(d) {
                self.findings.push(RuleViolation::semantic(
                    format!("Default '{}' of enum '{}' is not one of its symbols", d, name),
                    simple_name(&name),
                ));
            }
        }
        self.named.insert(name.clone(), NamedType::Enum { name: name.clone(), aliases, symbols, default });
        Ok(AvroType::Named(name))
    }

    fn parse_fixed(&mut self, value: &Value, namespace: Option<&str>, path: &str) -> ParseResult<AvroType> {
        let (name, aliases) = self.named_header(value, namespace, path)?;
        let size = match value.get("size").and_then(Value::as_u64) {
            Some(s) => s,
            None => return invalid(format!("Fixed '{}' has no valid 'size'", name)),
        };
        self.named.insert(name.clone(), NamedType::Fixed { name: name.clone(), aliases, size });
        Ok(AvroType::Named(name))
    }
}

fn string_array(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn union_key(t: &AvroType) -> String {
    match t {
        AvroType::Primitive(p) => p.name().to_string(),
        AvroType::Array(_) => "array".to_string(),
        AvroType::Map(_) => "map".to_string(),
        AvroType::Union(_) => "union".to_string(),
        AvroType::Named(n) => n.clone(),
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "the schema root"
    } else {
        path
    }
}

/// Parsed schema plus every named type visible to it
struct AvroModel {
    root: AvroType,
    named: HashMap<String, NamedType>,
    uses: Vec<(String, String)>,
    findings: Vec<RuleViolation>,
}

impl AvroModel {
    fn parse(value: &Value, references: &ReferenceMap, budget: &StageBudget) -> ParseResult<Self> {
        let mut parser = SchemaParser::new(budget);
        let root = parser.parse(value, None, "", 0)?;
        let mut named = parser.named;
        for (name, definition) in referenced_types(references, budget)? {
            named.entry(name).or_insert(definition);
        }
        Ok(Self {
            root,
            named,
            uses: parser.uses,
            findings: parser.findings,
        })
    }

    /// Resolve a named-type use, falling back to the unqualified name
    fn lookup(&self, name: &str) -> Option<&NamedType> {
        self.named
            .get(name)
            .or_else(|| self.named.get(simple_name(name)))
    }
}

/// Named types defined by referenced schemas; unparsable references are skipped
fn referenced_types(references: &ReferenceMap, budget: &StageBudget) -> ParseResult<HashMap<String, NamedType>> {
    let mut named = HashMap::new();
    for content in references.contents() {
        let Ok(value) = parse_json(content) else { continue };
        let mut parser = SchemaParser::new(budget);
        match parser.parse(&value, None, "", 0) {
            Ok(_) => named.extend(parser.named),
            Err(ParseFailure::Exhausted(e)) => return Err(ParseFailure::Exhausted(e)),
            Err(ParseFailure::Invalid(_)) => {}
        }
    }
    Ok(named)
}

fn canonicalize(content: &Content, budget: &StageBudget) -> Result<Option<Vec<u8>>> {
    budget.check()?;
    let Ok(value) = parse_json(content) else {
        return Ok(None);
    };
    Ok(canonical_json(&value))
}

/// Named types used but not defined locally, first use first
fn extract_references(content: &Content) -> Vec<ReferenceCoordinate> {
    let Ok(value) = parse_json(content) else {
        return Vec::new();
    };
    let budget = StageBudget::unbounded(Stage::ResolvingReferences);
    let mut parser = SchemaParser::new(&budget);
    if parser.parse(&value, None, "", 0).is_err() {
        return Vec::new();
    }
    let mut seen = HashSet::new();
    parser
        .uses
        .iter()
        .filter(|(name, _)| !parser.named.contains_key(name) && !parser.named.contains_key(simple_name(name)))
        .filter(|(name, _)| seen.insert(name.clone()))
        .map(|(name, _)| ReferenceCoordinate::new(name.clone()))
        .collect()
}

fn syntax_check(text: &str, value: &Value, references: &ReferenceMap) -> std::result::Result<(), String> {
    let named_root = value.is_object() && value.get("name").is_some();
    if references.is_empty() {
        return apache_avro::Schema::parse_str(text).map(|_| ()).map_err(|e| e.to_string());
    }
    if !named_root {
        // parse_list only accepts named schemas; the structural parse covers the rest
        return Ok(());
    }
    let mut inputs: Vec<&str> = references
        .contents()
        .filter_map(Content::text)
        .filter(|t| {
            serde_json::from_str::<Value>(t)
                .map(|v| v.is_object() && v.get("name").is_some())
                .unwrap_or(false)
        })
        .collect();
    inputs.push(text);
    apache_avro::Schema::parse_list(&inputs).map(|_| ()).map_err(|e| e.to_string())
}

fn validate(content: &Content, level: ValidityLevel, references: &ReferenceMap, budget: &StageBudget) -> Result<Vec<RuleViolation>> {
    let value = match parse_json(content) {
        Ok(v) => v,
        Err(violation) => return Ok(vec![violation]),
    };
    let text = content.text().unwrap_or_default();
    if let Err(message) = syntax_check(text, &value, references) {
        return Ok(vec![RuleViolation::parse_error(format!("Invalid Avro schema: {}", message))]);
    }
    budget.check()?;

    let model = match AvroModel::parse(&value, references, budget) {
        Ok(m) => m,
        Err(ParseFailure::Invalid(message)) => {
            return Ok(vec![RuleViolation::parse_error(format!("Invalid Avro schema: {}", message))])
        }
        Err(ParseFailure::Exhausted(e)) => return Err(e),
    };
    if level < ValidityLevel::Full {
        return Ok(Vec::new());
    }

    let mut violations = model.findings.clone();
    for (name, path) in &model.uses {
        if model.lookup(name).is_none() {
            violations.push(RuleViolation::semantic(
                format!("Named type '{}' is not defined and was not supplied as a reference", name),
                path,
            ));
        }
    }
    check_defaults(&model, budget, &mut violations)?;
    Ok(violations)
}

fn check_defaults(model: &AvroModel, budget: &StageBudget, out: &mut Vec<RuleViolation>) -> Result<()> {
    let mut records: Vec<&NamedType> = model.named.values().collect();
    records.sort_by(|a, b| a.name().cmp(b.name()));
    for definition in records {
        let NamedType::Record { name, fields, .. } = definition else { continue };
        for field in fields {
            budget.check()?;
            let Some(default) = &field.default else { continue };
            if !default_matches(model, &field.schema, default, 0) {
                out.push(RuleViolation::semantic(
                    format!(
                        "Default value {} of field '{}' does not match its type {}",
                        default,
                        field.name,
                        describe(&field.schema)
                    ),
                    format!("{}.{}", simple_name(name), field.name),
                ));
            }
        }
    }
    Ok(())
}

fn default_matches(model: &AvroModel, schema: &AvroType, value: &Value, depth: usize) -> bool {
    if depth > 64 {
        return true;
    }
    match schema {
        AvroType::Primitive(p) => match p {
            Primitive::Null => value.is_null(),
            Primitive::Boolean => value.is_boolean(),
            Primitive::Int | Primitive::Long => value.is_i64() || value.is_u64(),
            Primitive::Float | Primitive::Double => value.is_number(),
            Primitive::Bytes | Primitive::String => value.is_string(),
        },
        // union defaults match the first branch
        AvroType::Union(branches) => branches
            .first()
            .is_some_and(|first| default_matches(model, first, value, depth + 1)),
        AvroType::Array(items) => value
            .as_array()
            .is_some_and(|a| a.iter().all(|v| default_matches(model, items, v, depth + 1))),
        AvroType::Map(values) => value
            .as_object()
            .is_some_and(|m| m.values().all(|v| default_matches(model, values, v, depth + 1))),
        AvroType::Named(name) => match model.lookup(name) {
            None => true,
            Some(NamedType::Enum { symbols, .. }) => value.as_str().is_some_and(|s| symbols.iter().any(|x| x == s)),
            Some(NamedType::Fixed { size, .. }) => value.as_str().is_some_and(|s| s.chars().count() as u64 == *size),
            Some(NamedType::Record { fields, .. }) => value.as_object().is_some_and(|obj| {
                fields.iter().all(|f| match obj.get(&f.name) {
                    Some(v) => default_matches(model, &f.schema, v, depth + 1),
                    None => f.default.is_some(),
                })
            }),
        },
    }
}

fn describe(t: &AvroType) -> String {
    match t {
        AvroType::Primitive(p) => p.name().to_string(),
        AvroType::Array(items) => format!("array<{}>", describe(items)),
        AvroType::Map(values) => format!("map<{}>", describe(values)),
        AvroType::Union(branches) => format!(
            "[{}]",
            branches.iter().map(describe).collect::<Vec<_>>().join(", ")
        ),
        AvroType::Named(n) => n.clone(),
    }
}

fn load_model(version: VersionedContent<'_>, budget: &StageBudget) -> Result<std::result::Result<AvroModel, String>> {
    let value = match parse_json(version.content) {
        Ok(v) => v,
        Err(violation) => return Ok(Err(violation.description)),
    };
    match AvroModel::parse(&value, version.references, budget) {
        Ok(model) => Ok(Ok(model)),
        Err(ParseFailure::Invalid(message)) => Ok(Err(message)),
        Err(ParseFailure::Exhausted(e)) => Err(e),
    }
}

fn diff(prior: VersionedContent<'_>, candidate: VersionedContent<'_>, budget: &StageBudget) -> Result<Vec<SchemaChange>> {
    let old = match load_model(prior, budget)? {
        Ok(m) => m,
        Err(message) => return Ok(vec![SchemaChange::unparsable("prior", message)]),
    };
    let new = match load_model(candidate, budget)? {
        Ok(m) => m,
        Err(message) => return Ok(vec![SchemaChange::unparsable("candidate", message)]),
    };

    // Backward: the new schema reads data written with the old one
    let mut backward = SchemaResolution::new(&new, &old, Breaks::Backward, budget);
    backward.resolve(&new.root, &old.root, "", 0)?;
    // Forward: the old schema reads data written with the new one
    let mut forward = SchemaResolution::new(&old, &new, Breaks::Forward, budget);
    forward.resolve(&old.root, &new.root, "", 0)?;

    let mut changes = backward.changes;
    changes.extend(forward.changes);
    Ok(merge_directional(changes))
}

/// Reader/writer schema resolution, recording every failure as a change
struct SchemaResolution<'m> {
    reader: &'m AvroModel,
    writer: &'m AvroModel,
    breaks: Breaks,
    budget: &'m StageBudget,
    visited: HashSet<(String, String)>,
    changes: Vec<SchemaChange>,
}

impl<'m> SchemaResolution<'m> {
    fn new(reader: &'m AvroModel, writer: &'m AvroModel, breaks: Breaks, budget: &'m StageBudget) -> Self {
        Self {
            reader,
            writer,
            breaks,
            budget,
            visited: HashSet::new(),
            changes: Vec::new(),
        }
    }

    /// True when the reader is the new schema
    fn reader_is_new(&self) -> bool {
        self.breaks == Breaks::Backward
    }

    fn push(&mut self, change_type: ChangeType, path: &str, description: String) {
        self.changes.push(SchemaChange::new(change_type, path, self.breaks, description));
    }

    fn type_changed(&mut self, reader: &AvroType, writer: &AvroType, path: &str) {
        let (old, new) = if self.reader_is_new() {
            (describe(writer), describe(reader))
        } else {
            (describe(reader), describe(writer))
        };
        let change = SchemaChange::new(
            ChangeType::TypeChanged,
            path,
            self.breaks,
            format!("Type of '{}' changed from {} to {}", display_path(path), old, new),
        )
        .with_values(old, new);
        self.changes.push(change);
    }

    fn resolve(&mut self, reader: &AvroType, writer: &AvroType, path: &str, depth: usize) -> Result<()> {
        self.budget.check_depth(depth)?;
        match (reader, writer) {
            (_, AvroType::Union(writer_branches)) => {
                for branch in writer_branches {
                    let target = match reader {
                        AvroType::Union(reader_branches) => reader_branches.iter().find(|b| self.matches(b, branch)),
                        single => self.matches(single, branch).then_some(single),
                    };
                    match target {
                        Some(r) => self.resolve(r, branch, path, depth + 1)?,
                        None => {
                            let (reader_side, writer_side) = self.sides();
                            self.push(
                                ChangeType::TypeChanged,
                                path,
                                format!(
                                    "The {} schema cannot read the '{}' branch written by the {} schema at '{}'",
                                    reader_side,
                                    describe(branch),
                                    writer_side,
                                    display_path(path)
                                ),
                            );
                        }
                    }
                }
            }
            (AvroType::Union(reader_branches), _) => {
                match reader_branches.iter().find(|b| self.matches(b, writer)) {
                    Some(r) => self.resolve(r, writer, path, depth + 1)?,
                    None => self.type_changed(reader, writer, path),
                }
            }
            (AvroType::Primitive(r), AvroType::Primitive(w)) => {
                if !w.promotes_to(*r) {
                    self.type_changed(reader, writer, path);
                }
            }
            (AvroType::Array(r), AvroType::Array(w)) => {
                self.resolve(r, w, &format!("{}[]", path), depth + 1)?;
            }
            (AvroType::Map(r), AvroType::Map(w)) => {
                self.resolve(r, w, &format!("{}{{}}", path), depth + 1)?;
            }
            (AvroType::Named(r), AvroType::Named(w)) => self.resolve_named(r, w, path, depth)?,
            _ => self.type_changed(reader, writer, path),
        }
        Ok(())
    }

    fn sides(&self) -> (&'static str, &'static str) {
        if self.reader_is_new() {
            ("new", "old")
        } else {
            ("old", "new")
        }
    }

    /// Shallow match used to pick a union branch
    fn matches(&self, reader: &AvroType, writer: &AvroType) -> bool {
        match (reader, writer) {
            (AvroType::Primitive(r), AvroType::Primitive(w)) => w.promotes_to(*r),
            (AvroType::Array(_), AvroType::Array(_)) | (AvroType::Map(_), AvroType::Map(_)) => true,
            (AvroType::Named(r), AvroType::Named(w)) => match (self.reader.lookup(r), self.writer.lookup(w)) {
                (Some(rd), Some(wd)) => rd.kind() == wd.kind() && names_match(rd, wd),
                _ => simple_name(r) == simple_name(w),
            },
            _ => false,
        }
    }

    fn resolve_named(&mut self, reader_name: &str, writer_name: &str, path: &str, depth: usize) -> Result<()> {
        let (Some(reader), Some(writer)) = (
            self.reader.lookup(reader_name).cloned(),
            self.writer.lookup(writer_name).cloned(),
        ) else {
            // unresolved names are a validity problem, not a compatibility one
            return Ok(());
        };
        if !self.visited.insert((reader.name().to_string(), writer.name().to_string())) {
            return Ok(());
        }
        let type_path = if path.is_empty() { simple_name(reader.name()).to_string() } else { path.to_string() };

        if reader.kind() != writer.kind() {
            self.push(
                ChangeType::TypeChanged,
                &type_path,
                format!(
                    "'{}' changed from {} to {}",
                    simple_name(reader.name()),
                    self.old_of(&reader, &writer).kind(),
                    self.new_of(&reader, &writer).kind()
                ),
            );
            return Ok(());
        }
        if !names_match(&reader, &writer) {
            let (old, new) = (self.old_of(&reader, &writer).name(), self.new_of(&reader, &writer).name());
            let change = SchemaChange::new(
                ChangeType::NameChanged,
                &type_path,
                self.breaks,
                format!("Type name changed from '{}' to '{}' without an alias", old, new),
            )
            .with_values(old, new);
            self.changes.push(change);
            return Ok(());
        }

        match (&reader, &writer) {
            (
                NamedType::Record { name, fields: reader_fields, .. },
                NamedType::Record { fields: writer_fields, .. },
            ) => {
                let record = simple_name(name).to_string();
                for field in reader_fields {
                    self.budget.check()?;
                    let field_path = format!("{}.{}", record, field.name);
                    let written = writer_fields
                        .iter()
                        .find(|w| w.name == field.name || field.aliases.contains(&w.name));
                    match written {
                        Some(w) => self.resolve(&field.schema, &w.schema, &field_path, depth + 1)?,
                        None if field.default.is_none() => {
                            let (change_type, description) = if self.reader_is_new() {
                                (
                                    ChangeType::FieldAdded,
                                    format!("Field '{}' was added to record '{}' without a default value", field.name, record),
                                )
                            } else {
                                (
                                    ChangeType::FieldRemoved,
                                    format!(
                                        "Field '{}' was removed from record '{}' but the old schema has no default for it",
                                        field.name, record
                                    ),
                                )
                            };
                            self.push(change_type, &field_path, description);
                        }
                        None => {}
                    }
                }
            }
            (
                NamedType::Enum { name, symbols: reader_symbols, default, .. },
                NamedType::Enum { symbols: writer_symbols, .. },
            ) => {
                if default.is_some() {
                    return Ok(());
                }
                let enum_name = simple_name(name).to_string();
                for symbol in writer_symbols.iter().filter(|s| !reader_symbols.contains(s)) {
                    let symbol_path = format!("{}.{}", enum_name, symbol);
                    let (change_type, description) = if self.reader_is_new() {
                        (
                            ChangeType::EnumVariantRemoved,
                            format!("Symbol '{}' was removed from enum '{}'", symbol, enum_name),
                        )
                    } else {
                        (
                            ChangeType::EnumVariantAdded,
                            format!(
                                "Symbol '{}' was added to enum '{}' and the old schema has no default",
                                symbol, enum_name
                            ),
                        )
                    };
                    self.push(change_type, &symbol_path, description);
                }
            }
            (NamedType::Fixed { size: reader_size, .. }, NamedType::Fixed { size: writer_size, .. }) => {
                if reader_size != writer_size {
                    let (old, new) = if self.reader_is_new() {
                        (writer_size, reader_size)
                    } else {
                        (reader_size, writer_size)
                    };
                    let change = SchemaChange::new(
                        ChangeType::TypeChanged,
                        &type_path,
                        self.breaks,
                        format!("Size of fixed '{}' changed from {} to {}", simple_name(reader.name()), old, new),
                    )
                    .with_values(old.to_string(), new.to_string());
                    self.changes.push(change);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn old_of<'a>(&self, reader: &'a NamedType, writer: &'a NamedType) -> &'a NamedType {
        if self.reader_is_new() {
            writer
        } else {
            reader
        }
    }

    fn new_of<'a>(&self, reader: &'a NamedType, writer: &'a NamedType) -> &'a NamedType {
        if self.reader_is_new() {
            reader
        } else {
            writer
        }
    }
}

/// Unqualified names match, or the reader lists the writer's name as an alias
fn names_match(reader: &NamedType, writer: &NamedType) -> bool {
    simple_name(reader.name()) == simple_name(writer.name())
        || reader
            .aliases()
            .iter()
            .any(|a| a == writer.name() || simple_name(a) == simple_name(writer.name()))
}

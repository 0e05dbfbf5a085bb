//! Protocol Buffers IDL (`.proto`)
//!
//! There is no protobuf compiler in the dependency tree, so `.proto` files
//! are handled by a small hand-written lexer and parser ([`parser`]) that
//! understands proto2 and proto3 declarations. Options, extensions and
//! custom option values are skipped rather than interpreted.

mod compat;
mod parser;

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::artifact::ArtifactType;
use crate::budget::StageBudget;
use crate::content::Content;
use crate::error::Result;
use crate::executor::Stage;
use crate::references::{ReferenceCoordinate, ReferenceMap};
use crate::rules::ValidityLevel;
use crate::violation::RuleViolation;

use super::{utf8, FormatRules};
use parser::{EnumDef, Label, MessageDef, ParseFailure, ProtoFile, Syntax, FIELD_NUMBER_MAX};

pub static RULES: FormatRules = FormatRules {
    artifact_type: ArtifactType::Protobuf,
    canonicalize,
    extract_references,
    validate,
    diff: compat::diff,
};

const WELL_KNOWN_IMPORT_PREFIX: &str = "google/protobuf/";
const WELL_KNOWN_PACKAGE_PREFIX: &str = "google.protobuf.";
const IMPLEMENTATION_RESERVED: std::ops::RangeInclusive<i64> = 19_000..=19_999;

const SCALARS: &[&str] = &[
    "double", "float", "int32", "int64", "uint32", "uint64", "sint32", "sint64", "fixed32", "fixed64",
    "sfixed32", "sfixed64", "bool", "string", "bytes",
];

pub(crate) fn is_scalar(type_name: &str) -> bool {
    SCALARS.contains(&type_name)
}

/// Messages and enums of a file keyed by fully qualified name (no leading dot)
pub(crate) struct Definitions<'f> {
    pub messages: BTreeMap<String, &'f MessageDef>,
    pub enums: BTreeMap<String, &'f EnumDef>,
}

impl<'f> Definitions<'f> {
    pub fn of(file: &'f ProtoFile) -> Self {
        let mut definitions = Definitions {
            messages: BTreeMap::new(),
            enums: BTreeMap::new(),
        };
        let package = file.package.clone().unwrap_or_default();
        for message in &file.messages {
            definitions.add_message(&package, message);
        }
        for def in &file.enums {
            definitions.enums.insert(qualify(&package, &def.name), def);
        }
        definitions
    }

    fn add_message(&mut self, scope: &str, message: &'f MessageDef) {
        let name = qualify(scope, &message.name);
        for nested in &message.messages {
            self.add_message(&name, nested);
        }
        for def in &message.enums {
            self.enums.insert(qualify(&name, &def.name), def);
        }
        self.messages.insert(name, message);
    }

    fn names(&self) -> impl Iterator<Item = &String> {
        self.messages.keys().chain(self.enums.keys())
    }
}

pub(crate) fn qualify(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", scope, name)
    }
}

fn parse_file(content: &Content, budget: &StageBudget) -> Result<std::result::Result<ProtoFile, RuleViolation>> {
    let text = match utf8(content) {
        Ok(t) => t,
        Err(violation) => return Ok(Err(violation)),
    };
    match parser::parse(text, budget) {
        Ok(file) => Ok(Ok(file)),
        Err(ParseFailure::Syntax(e)) => Ok(Err(RuleViolation::parse_error(format!(
            "Invalid Protobuf schema: {}",
            e.message
        ))
        .at(e.location()))),
        Err(ParseFailure::Exhausted(e)) => Err(e),
    }
}

/// Token stream of a file that parses, without comments or layout
fn canonicalize(content: &Content, budget: &StageBudget) -> Result<Option<Vec<u8>>> {
    budget.check()?;
    let Some(text) = content.text() else {
        return Ok(None);
    };
    match parser::parse(text, budget) {
        Ok(_) => {}
        Err(ParseFailure::Syntax(_)) => return Ok(None),
        Err(ParseFailure::Exhausted(e)) => return Err(e),
    }
    let Ok(tokens) = parser::tokenize(text) else {
        return Ok(None);
    };
    let texts: Vec<String> = tokens.iter().map(|t| t.token.text()).collect();
    Ok(Some(texts.join(" ").into_bytes()))
}

fn extract_references(content: &Content) -> Vec<ReferenceCoordinate> {
    let budget = StageBudget::unbounded(Stage::ResolvingReferences);
    let Some(text) = content.text() else {
        return Vec::new();
    };
    let Ok(file) = parser::parse(text, &budget) else {
        return Vec::new();
    };
    file.imports
        .iter()
        .filter(|i| !i.path.starts_with(WELL_KNOWN_IMPORT_PREFIX))
        .map(|i| ReferenceCoordinate::new(i.path.clone()))
        .collect()
}

fn validate(content: &Content, level: ValidityLevel, references: &ReferenceMap, budget: &StageBudget) -> Result<Vec<RuleViolation>> {
    let file = match parse_file(content, budget)? {
        Ok(f) => f,
        Err(violation) => return Ok(vec![violation]),
    };
    if level < ValidityLevel::Full {
        return Ok(Vec::new());
    }

    let mut violations = Vec::new();
    check_duplicate_definitions(&file, &mut violations);
    let local = Definitions::of(&file);

    for (name, message) in &local.messages {
        budget.check()?;
        check_message(&file, name, message, &mut violations);
    }
    for (name, def) in &local.enums {
        check_enum(&file, name, def, &mut violations);
    }

    // Everything reachable through imports, parsed from the resolved references
    let imported: Vec<ProtoFile> = references
        .contents()
        .filter_map(|c| c.text())
        .filter_map(|text| parser::parse(text, budget).ok())
        .collect();
    let mut known: HashSet<String> = local.names().cloned().collect();
    for file in &imported {
        known.extend(Definitions::of(file).names().cloned());
    }
    check_type_references(&file, &local, &known, &mut violations);

    Ok(violations)
}

/// Messages and enums must not share a fully qualified name
fn check_duplicate_definitions(file: &ProtoFile, out: &mut Vec<RuleViolation>) {
    let package = file.package.clone().unwrap_or_default();
    let mut lines: HashMap<String, usize> = HashMap::new();
    for message in &file.messages {
        declare_message(&package, message, &mut lines, out);
    }
    for def in &file.enums {
        declare(qualify(&package, &def.name), def.line, &mut lines, out);
    }
}

fn declare_message(scope: &str, message: &MessageDef, lines: &mut HashMap<String, usize>, out: &mut Vec<RuleViolation>) {
    let name = qualify(scope, &message.name);
    declare(name.clone(), message.line, lines, out);
    for nested in &message.messages {
        declare_message(&name, nested, lines, out);
    }
    for def in &message.enums {
        declare(qualify(&name, &def.name), def.line, lines, out);
    }
}

fn declare(name: String, line: usize, lines: &mut HashMap<String, usize>, out: &mut Vec<RuleViolation>) {
    match lines.get(&name) {
        Some(first) => out.push(RuleViolation::semantic(
            format!("'{}' is already defined at line {}", name, first),
            format!("{} (line {})", name, line),
        )),
        None => {
            lines.insert(name, line);
        }
    }
}

fn check_message(file: &ProtoFile, name: &str, message: &MessageDef, out: &mut Vec<RuleViolation>) {
    let mut numbers: HashMap<i64, &str> = HashMap::new();
    let mut names: HashSet<&str> = HashSet::new();

    for field in &message.fields {
        let context = format!("{}.{} (line {})", name, field.name, field.line);

        if !names.insert(field.name.as_str()) {
            out.push(RuleViolation::semantic(
                format!("Field name '{}' is declared more than once in message '{}'", field.name, name),
                &context,
            ));
        }
        if let Some(previous) = numbers.insert(field.number, field.name.as_str()) {
            out.push(RuleViolation::semantic(
                format!(
                    "Field number {} of '{}' is already used by '{}' in message '{}'",
                    field.number, field.name, previous, name
                ),
                &context,
            ));
        }
        if field.number < 1 || field.number > FIELD_NUMBER_MAX {
            out.push(RuleViolation::semantic(
                format!("Field number {} is outside the range 1 to {}", field.number, FIELD_NUMBER_MAX),
                &context,
            ));
        } else if IMPLEMENTATION_RESERVED.contains(&field.number) {
            out.push(RuleViolation::semantic(
                format!(
                    "Field number {} falls in the range 19000 to 19999 reserved for the protobuf implementation",
                    field.number
                ),
                &context,
            ));
        }
        if message.reserved.number(field.number) {
            out.push(RuleViolation::semantic(
                format!("Field '{}' uses reserved field number {}", field.name, field.number),
                &context,
            ));
        }
        if message.reserved.name(&field.name) {
            out.push(RuleViolation::semantic(
                format!("Field name '{}' is reserved in message '{}'", field.name, name),
                &context,
            ));
        }
        if file.syntax == Syntax::Proto3 && field.label == Label::Required {
            out.push(RuleViolation::semantic(
                format!("Required fields are not allowed in proto3 ('{}')", field.name),
                &context,
            ));
        }
        if let Some((key, _)) = &field.map_types {
            let valid_key = is_scalar(key) && !matches!(key.as_str(), "float" | "double" | "bytes");
            if !valid_key {
                out.push(RuleViolation::semantic(
                    format!("Map key type '{}' must be an integral or string type", key),
                    &context,
                ));
            }
        }
    }
}

fn check_enum(file: &ProtoFile, name: &str, def: &EnumDef, out: &mut Vec<RuleViolation>) {
    match def.values.first() {
        None => out.push(RuleViolation::semantic(
            format!("Enum '{}' must declare at least one value", name),
            format!("{} (line {})", name, def.line),
        )),
        Some(first) if file.syntax == Syntax::Proto3 && first.number != 0 => {
            out.push(RuleViolation::semantic(
                format!("The first value of proto3 enum '{}' must be zero", name),
                format!("{}.{} (line {})", name, first.name, first.line),
            ))
        }
        Some(_) => {}
    }

    let mut numbers: HashMap<i64, &str> = HashMap::new();
    let mut names: HashSet<&str> = HashSet::new();
    for value in &def.values {
        let context = format!("{}.{} (line {})", name, value.name, value.line);
        if !names.insert(value.name.as_str()) {
            out.push(RuleViolation::semantic(
                format!("Enum value '{}' is declared more than once in '{}'", value.name, name),
                &context,
            ));
        }
        if let Some(previous) = numbers.insert(value.number, value.name.as_str()) {
            if !def.allow_alias {
                out.push(RuleViolation::semantic(
                    format!(
                        "Enum value {} of '{}' duplicates '{}'; set allow_alias to permit aliases",
                        value.number, value.name, previous
                    ),
                    &context,
                ));
            }
        }
        if def.reserved.number(value.number) || def.reserved.name(&value.name) {
            out.push(RuleViolation::semantic(
                format!("Enum value '{}' uses a reserved name or number", value.name),
                &context,
            ));
        }
    }
}

/// Resolve a type name the way protoc does, innermost scope first
pub(crate) fn resolve_type(type_name: &str, scope: &str, known: &HashSet<String>) -> Option<String> {
    if let Some(absolute) = type_name.strip_prefix('.') {
        return known.contains(absolute).then(|| absolute.to_string());
    }
    let mut scope = scope.to_string();
    loop {
        let candidate = qualify(&scope, type_name);
        if known.contains(&candidate) {
            return Some(candidate);
        }
        if scope.is_empty() {
            return None;
        }
        match scope.rfind('.') {
            Some(i) => scope.truncate(i),
            None => scope.clear(),
        }
    }
}

fn is_well_known(type_name: &str) -> bool {
    type_name.trim_start_matches('.').starts_with(WELL_KNOWN_PACKAGE_PREFIX)
}

fn check_type_references(file: &ProtoFile, local: &Definitions<'_>, known: &HashSet<String>, out: &mut Vec<RuleViolation>) {
    let mut unresolved = |type_name: &str, scope: &str, context: String| {
        if is_scalar(type_name) || is_well_known(type_name) {
            return;
        }
        if resolve_type(type_name, scope, known).is_none() {
            out.push(RuleViolation::semantic(
                format!("Type '{}' is not defined in this file or its imports", type_name),
                context,
            ));
        }
    };

    for (name, message) in &local.messages {
        for field in &message.fields {
            let type_name = match &field.map_types {
                Some((_, value)) => value.as_str(),
                None => field.type_name.as_str(),
            };
            unresolved(type_name, name, format!("{}.{} (line {})", name, field.name, field.line));
        }
    }

    let package = file.package.clone().unwrap_or_default();
    for service in &file.services {
        for rpc in &service.rpcs {
            let context = format!("{}.{} (line {})", qualify(&package, &service.name), rpc.name, rpc.line);
            unresolved(&rpc.input, &package, context.clone());
            unresolved(&rpc.output, &package, context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::violation::ViolationCause;

    fn run(source: &str, level: ValidityLevel, references: &ReferenceMap) -> Vec<RuleViolation> {
        validate(
            &Content::from_string(source),
            level,
            references,
            &StageBudget::unbounded(Stage::Validating),
        )
        .unwrap()
    }

    fn full(source: &str) -> Vec<RuleViolation> {
        run(source, ValidityLevel::Full, &ReferenceMap::empty())
    }

    #[test]
    fn test_valid_file_passes() {
        let violations = full(
            r#"
            syntax = "proto3";
            package shop.v1;
            import "google/protobuf/timestamp.proto";
            message Order {
                reserved 3;
                string id = 1;
                repeated Item items = 2;
                google.protobuf.Timestamp placed_at = 4;
                Status status = 5;
                map<string, Item> by_sku = 6;
                message Item { string sku = 1; int32 qty = 2; }
            }
            enum Status { STATUS_UNSPECIFIED = 0; PLACED = 1; }
            service Orders { rpc Get (Order) returns (.shop.v1.Order); }
            "#,
        );
        assert!(violations.is_empty(), "{:?}", violations);
    }

    #[test]
    fn test_syntax_error_is_single_located_violation() {
        let violations = run("syntax = \"proto3\";\nmessage {", ValidityLevel::SyntaxOnly, &ReferenceMap::empty());
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].cause, ViolationCause::ParseError);
        assert_eq!(violations[0].context.as_deref(), Some("2:9"));
    }

    #[test]
    fn test_syntax_only_ignores_semantics() {
        let source = "syntax = \"proto3\"; message A { string a = 1; string b = 1; }";
        assert!(run(source, ValidityLevel::SyntaxOnly, &ReferenceMap::empty()).is_empty());
        assert_eq!(full(source).len(), 1);
    }

    #[test]
    fn test_field_number_rules() {
        let violations = full(
            "syntax = \"proto3\"; message A { reserved 2, 10 to 12; reserved \"old\"; \
             string a = 0; string b = 2; string c = 11; string old = 3; string d = 19500; string e = 536870912; }",
        );
        let descriptions: Vec<&str> = violations.iter().map(|v| v.description.as_str()).collect();
        assert_eq!(violations.len(), 6, "{:?}", descriptions);
        assert!(descriptions.iter().any(|d| d.contains("19000 to 19999")));
        assert!(descriptions.iter().any(|d| d.contains("'old' is reserved")));
    }

    #[test]
    fn test_enum_rules() {
        let violations = full("syntax = \"proto3\"; enum E { ONE = 1; TWO = 1; }");
        assert_eq!(violations.len(), 2);

        let aliased = full("syntax = \"proto3\"; enum E { option allow_alias = true; ZERO = 0; NONE = 0; }");
        assert!(aliased.is_empty(), "{:?}", aliased);

        // proto2 enums need not start at zero
        assert!(full("syntax = \"proto2\"; enum E { ONE = 1; }").is_empty());
    }

    #[test]
    fn test_duplicate_definitions() {
        let violations = full(
            "syntax = \"proto3\";\nmessage A { string a = 1; }\nmessage A { string b = 1; }\n\
             message B { enum E { Y = 0; } message E {} }",
        );
        assert_eq!(violations.len(), 2, "{:?}", violations);
        assert_eq!(violations[0].description, "'A' is already defined at line 2");
        assert_eq!(violations[0].context.as_deref(), Some("A (line 3)"));
        assert!(violations[1].description.starts_with("'B.E' is already defined"));
    }

    #[test]
    fn test_empty_enum_reports_its_line() {
        let violations = full("syntax = \"proto2\";\n\nenum Empty {}");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].context.as_deref(), Some("Empty (line 3)"));
    }

    #[test]
    fn test_required_in_proto3() {
        let violations = full("syntax = \"proto3\"; message A { required string a = 1; }");
        assert_eq!(violations.len(), 1);
        assert!(violations[0].description.contains("proto3"));
    }

    #[test]
    fn test_undefined_types_consider_imports() {
        let source = "syntax = \"proto3\"; package app; import \"common/money.proto\"; \
                      message Price { common.Money amount = 1; Missing other = 2; }";
        let violations = full(source);
        assert_eq!(violations.len(), 2);

        let refs = ReferenceMap::from_entries([(
            "common/money.proto",
            Content::from_string("syntax = \"proto3\"; package common; message Money { int64 units = 1; }"),
        )]);
        let violations = run(source, ValidityLevel::Full, &refs);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].description.contains("Missing"));
    }

    #[test]
    fn test_resolve_type_scopes() {
        let known: HashSet<String> = ["a.b.Outer", "a.b.Outer.Inner", "a.Other"].iter().map(|s| s.to_string()).collect();
        assert_eq!(resolve_type("Inner", "a.b.Outer", &known).as_deref(), Some("a.b.Outer.Inner"));
        assert_eq!(resolve_type("Other", "a.b.Outer", &known).as_deref(), Some("a.Other"));
        assert_eq!(resolve_type(".a.Other", "x", &known).as_deref(), Some("a.Other"));
        assert_eq!(resolve_type("Inner", "a", &known), None);
    }

    #[test]
    fn test_references_skip_well_known_and_keep_duplicates() {
        let content = Content::from_string(
            "syntax = \"proto3\"; import \"google/protobuf/any.proto\"; import \"a.proto\"; import \"a.proto\";",
        );
        let refs = extract_references(&content);
        assert_eq!(refs, vec![ReferenceCoordinate::new("a.proto"), ReferenceCoordinate::new("a.proto")]);
    }

    #[test]
    fn test_canonical_form_drops_comments_and_whitespace() {
        let a = Content::from_string("syntax = \"proto3\";\n// comment\nmessage A {\n  string x = 1;\n}\n");
        let b = Content::from_string("syntax=\"proto3\"; /* c */ message A{string x=1;}");
        let budget = StageBudget::unbounded(Stage::Canonicalizing);
        let ca = canonicalize(&a, &budget).unwrap().unwrap();
        assert_eq!(ca, canonicalize(&b, &budget).unwrap().unwrap());
        assert_eq!(canonicalize(&Content::from_bytes(ca.clone()), &budget).unwrap().unwrap(), ca);
    }

    #[test]
    fn test_canonical_form_requires_a_parse() {
        let budget = StageBudget::unbounded(Stage::Canonicalizing);
        // Tokenizes cleanly but is not a valid file
        assert_eq!(canonicalize(&Content::from_string("message {  oops"), &budget).unwrap(), None);
        assert_eq!(canonicalize(&Content::from_string("syntax = \"proto3\"; message A { string = 1; }"), &budget).unwrap(), None);
    }
}

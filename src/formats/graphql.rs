//! GraphQL SDL schemas, parsed with `graphql-parser`

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use graphql_parser::schema::{Definition, Document, Field, InputValue, Type, TypeDefinition};
use regex::Regex;

use crate::artifact::ArtifactType;
use crate::budget::StageBudget;
use crate::compatibility::{Breaks, ChangeType, SchemaChange, VersionedContent};
use crate::content::Content;
use crate::error::Result;
use crate::references::{ReferenceCoordinate, ReferenceMap};
use crate::rules::ValidityLevel;
use crate::violation::RuleViolation;

use super::{utf8, FormatRules};

pub static RULES: FormatRules = FormatRules {
    artifact_type: ArtifactType::Graphql,
    canonicalize,
    extract_references,
    validate,
    diff,
};

const BUILTIN_SCALARS: &[&str] = &["Int", "Float", "String", "Boolean", "ID"];

type Schema<'a> = Document<'a, String>;

fn error_position() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+):(\d+)").unwrap())
}

/// Deepest bracket nesting in the text; the parser recurses once per level
///
/// Brackets inside comments, strings and block strings do not count.
fn bracket_depth(text: &str) -> usize {
    const BLOCK_QUOTE: &[u8] = b"\"\"\"";
    const ESCAPED_BLOCK_QUOTE: &[u8] = b"\\\"\"\"";

    let bytes = text.as_bytes();
    let (mut i, mut depth, mut max) = (0usize, 0usize, 0usize);
    while i < bytes.len() {
        match bytes[i] {
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' && bytes[i] != b'\r' {
                    i += 1;
                }
                continue;
            }
            b'"' if bytes[i..].starts_with(BLOCK_QUOTE) => {
                i += BLOCK_QUOTE.len();
                while i < bytes.len() && !bytes[i..].starts_with(BLOCK_QUOTE) {
                    i += if bytes[i..].starts_with(ESCAPED_BLOCK_QUOTE) { ESCAPED_BLOCK_QUOTE.len() } else { 1 };
                }
                i += BLOCK_QUOTE.len();
                continue;
            }
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' && bytes[i] != b'\n' {
                    i += if bytes[i] == b'\\' { 2 } else { 1 };
                }
                i += 1;
                continue;
            }
            b'{' | b'[' | b'(' => {
                depth += 1;
                max = max.max(depth);
            }
            b'}' | b']' | b')' => depth = depth.saturating_sub(1),
            _ => {}
        }
        i += 1;
    }
    max
}

fn parse<'a>(text: &'a str, budget: &StageBudget) -> Result<std::result::Result<Schema<'a>, RuleViolation>> {
    budget.check_depth(bracket_depth(text))?;
    Ok(graphql_parser::parse_schema::<String>(text).map_err(|e| {
        let message = e.to_string();
        let violation = RuleViolation::parse_error(format!("Invalid GraphQL schema: {}", message.trim()));
        match error_position().captures(&message) {
            Some(caps) => violation.at(format!("{}:{}", &caps[1], &caps[2])),
            None => violation,
        }
    }))
}

fn canonicalize(content: &Content, budget: &StageBudget) -> Result<Option<Vec<u8>>> {
    let Some(text) = content.text() else {
        return Ok(None);
    };
    Ok(parse(text, budget)?.ok().map(|document| document.to_string().into_bytes()))
}

fn extract_references(_content: &Content) -> Vec<ReferenceCoordinate> {
    Vec::new()
}

fn type_name<'d>(def: &'d TypeDefinition<'_, String>) -> &'d str {
    match def {
        TypeDefinition::Scalar(t) => &t.name,
        TypeDefinition::Object(t) => &t.name,
        TypeDefinition::Interface(t) => &t.name,
        TypeDefinition::Union(t) => &t.name,
        TypeDefinition::Enum(t) => &t.name,
        TypeDefinition::InputObject(t) => &t.name,
    }
}

fn kind(def: &TypeDefinition<'_, String>) -> &'static str {
    match def {
        TypeDefinition::Scalar(_) => "scalar",
        TypeDefinition::Object(_) => "type",
        TypeDefinition::Interface(_) => "interface",
        TypeDefinition::Union(_) => "union",
        TypeDefinition::Enum(_) => "enum",
        TypeDefinition::InputObject(_) => "input",
    }
}

fn base_type<'t>(t: &'t Type<'_, String>) -> &'t str {
    match t {
        Type::NamedType(name) => name,
        Type::ListType(inner) | Type::NonNullType(inner) => base_type(inner),
    }
}

fn type_definitions<'d, 'a>(document: &'d Schema<'a>) -> impl Iterator<Item = &'d TypeDefinition<'a, String>> {
    document.definitions.iter().filter_map(|d| match d {
        Definition::TypeDefinition(t) => Some(t),
        _ => None,
    })
}

fn validate(content: &Content, level: ValidityLevel, _references: &ReferenceMap, budget: &StageBudget) -> Result<Vec<RuleViolation>> {
    let text = match utf8(content) {
        Ok(t) => t,
        Err(violation) => return Ok(vec![violation]),
    };
    let document = match parse(text, budget)? {
        Ok(d) => d,
        Err(violation) => return Ok(vec![violation]),
    };
    if level < ValidityLevel::Full {
        return Ok(Vec::new());
    }

    let mut violations = Vec::new();
    let mut types: BTreeMap<&str, &TypeDefinition<'_, String>> = BTreeMap::new();
    for def in type_definitions(&document) {
        let name = type_name(def);
        if BUILTIN_SCALARS.contains(&name) || types.contains_key(name) {
            violations.push(RuleViolation::semantic(format!("Type '{}' is defined more than once", name), name));
        } else {
            types.insert(name, def);
        }
    }
    // (referenced type, where) pairs, checked once every definition is known
    let mut uses: Vec<(&str, String)> = Vec::new();
    for def in types.values() {
        budget.check()?;
        let owner = type_name(def);
        match def {
            TypeDefinition::Object(t) => {
                check_fields(owner, &t.fields, &mut uses, &mut violations);
                for interface in &t.implements_interfaces {
                    uses.push((interface, format!("{} implements {}", owner, interface)));
                }
            }
            TypeDefinition::Interface(t) => check_fields(owner, &t.fields, &mut uses, &mut violations),
            TypeDefinition::Union(t) => {
                for member in &t.types {
                    uses.push((member, format!("{} = {}", owner, member)));
                }
            }
            TypeDefinition::InputObject(t) => {
                for field in &t.fields {
                    uses.push((base_type(&field.value_type), format!("{}.{}", owner, field.name)));
                }
            }
            TypeDefinition::Scalar(_) | TypeDefinition::Enum(_) => {}
        }
    }
    for definition in &document.definitions {
        if let Definition::SchemaDefinition(schema) = definition {
            for root in [&schema.query, &schema.mutation, &schema.subscription].into_iter().flatten() {
                uses.push((root, format!("schema {}", root)));
            }
        }
    }
    for (name, context) in uses {
        if !BUILTIN_SCALARS.contains(&name) && !types.contains_key(name) {
            violations.push(RuleViolation::semantic(format!("Type '{}' is not defined", name), context));
        }
    }

    for def in types.values() {
        let TypeDefinition::Object(object) = def else { continue };
        for interface_name in &object.implements_interfaces {
            match types.get(interface_name.as_str()) {
                Some(TypeDefinition::Interface(interface)) => {
                    for field in &interface.fields {
                        if !object.fields.iter().any(|f| f.name == field.name) {
                            violations.push(RuleViolation::semantic(
                                format!(
                                    "Type '{}' implements '{}' but does not declare its field '{}'",
                                    object.name, interface_name, field.name
                                ),
                                format!("{}.{}", object.name, field.name),
                            ));
                        }
                    }
                }
                Some(other) => violations.push(RuleViolation::semantic(
                    format!(
                        "Type '{}' implements '{}', which is {} and not an interface",
                        object.name,
                        interface_name,
                        kind(other)
                    ),
                    object.name.clone(),
                )),
                None => {}
            }
        }
    }

    Ok(violations)
}

fn check_fields<'d>(
    owner: &str,
    fields: &'d [Field<'_, String>],
    uses: &mut Vec<(&'d str, String)>,
    violations: &mut Vec<RuleViolation>,
) {
    let mut seen = HashSet::new();
    for field in fields {
        let context = format!("{}.{}", owner, field.name);
        if !seen.insert(field.name.as_str()) {
            violations.push(RuleViolation::semantic(
                format!("Field '{}' is declared more than once in '{}'", field.name, owner),
                &context,
            ));
        }
        uses.push((base_type(&field.field_type), context.clone()));
        for argument in &field.arguments {
            uses.push((base_type(&argument.value_type), format!("{}({})", context, argument.name)));
        }
    }
}

fn is_required(value: &InputValue<'_, String>) -> bool {
    matches!(value.value_type, Type::NonNullType(_)) && value.default_value.is_none()
}

fn diff(prior: VersionedContent<'_>, candidate: VersionedContent<'_>, budget: &StageBudget) -> Result<Vec<SchemaChange>> {
    let old_text = match utf8(prior.content) {
        Ok(t) => t,
        Err(v) => return Ok(vec![SchemaChange::unparsable("prior", v.description)]),
    };
    let new_text = match utf8(candidate.content) {
        Ok(t) => t,
        Err(v) => return Ok(vec![SchemaChange::unparsable("candidate", v.description)]),
    };
    let old = match parse(old_text, budget)? {
        Ok(d) => d,
        Err(v) => return Ok(vec![SchemaChange::unparsable("prior", v.description)]),
    };
    let new = match parse(new_text, budget)? {
        Ok(d) => d,
        Err(v) => return Ok(vec![SchemaChange::unparsable("candidate", v.description)]),
    };

    let new_types: BTreeMap<&str, &TypeDefinition<'_, String>> = type_definitions(&new).map(|t| (type_name(t), t)).collect();
    let mut changes = Vec::new();

    for old_def in type_definitions(&old) {
        budget.check()?;
        let name = type_name(old_def);
        let Some(new_def) = new_types.get(name) else {
            changes.push(SchemaChange::new(
                ChangeType::TypeRemoved,
                name,
                Breaks::Backward,
                format!("Type '{}' was removed", name),
            ));
            continue;
        };
        match (old_def, new_def) {
            (TypeDefinition::Object(o), TypeDefinition::Object(n)) => diff_fields(name, &o.fields, &n.fields, &mut changes),
            (TypeDefinition::Interface(o), TypeDefinition::Interface(n)) => {
                diff_fields(name, &o.fields, &n.fields, &mut changes)
            }
            (TypeDefinition::Enum(o), TypeDefinition::Enum(n)) => {
                for value in o.values.iter().filter(|v| !n.values.iter().any(|nv| nv.name == v.name)) {
                    changes.push(SchemaChange::new(
                        ChangeType::EnumVariantRemoved,
                        format!("{}.{}", name, value.name),
                        Breaks::Backward,
                        format!("Enum value '{}' was removed from '{}'", value.name, name),
                    ));
                }
            }
            (TypeDefinition::Union(o), TypeDefinition::Union(n)) => {
                for member in o.types.iter().filter(|m| !n.types.contains(m)) {
                    changes.push(SchemaChange::new(
                        ChangeType::EnumVariantRemoved,
                        format!("{}.{}", name, member),
                        Breaks::Backward,
                        format!("Type '{}' was removed from union '{}'", member, name),
                    ));
                }
            }
            (TypeDefinition::InputObject(o), TypeDefinition::InputObject(n)) => {
                diff_input_fields(name, &o.fields, &n.fields, &mut changes)
            }
            (TypeDefinition::Scalar(_), TypeDefinition::Scalar(_)) => {}
            (o, n) => changes.push(
                SchemaChange::new(
                    ChangeType::TypeChanged,
                    name,
                    Breaks::Both,
                    format!("'{}' changed from {} to {}", name, kind(o), kind(n)),
                )
                .with_values(kind(o), kind(n)),
            ),
        }
    }

    Ok(changes)
}

fn diff_fields(owner: &str, old: &[Field<'_, String>], new: &[Field<'_, String>], out: &mut Vec<SchemaChange>) {
    for old_field in old {
        let path = format!("{}.{}", owner, old_field.name);
        let Some(new_field) = new.iter().find(|f| f.name == old_field.name) else {
            out.push(SchemaChange::new(
                ChangeType::FieldRemoved,
                path,
                Breaks::Backward,
                format!("Field '{}' was removed from '{}'", old_field.name, owner),
            ));
            continue;
        };

        let (old_type, new_type) = (old_field.field_type.to_string(), new_field.field_type.to_string());
        if old_type != new_type {
            out.push(
                SchemaChange::new(
                    ChangeType::TypeChanged,
                    &path,
                    Breaks::Both,
                    format!("Field '{}' changed type from '{}' to '{}'", path, old_type, new_type),
                )
                .with_values(old_type, new_type),
            );
        }

        for argument in &new_field.arguments {
            let existed = old_field.arguments.iter().any(|a| a.name == argument.name);
            if !existed && is_required(argument) {
                out.push(SchemaChange::new(
                    ChangeType::FieldAdded,
                    format!("{}({})", path, argument.name),
                    Breaks::Backward,
                    format!("Required argument '{}' was added to field '{}'", argument.name, path),
                ));
            }
        }
    }
}

fn diff_input_fields(owner: &str, old: &[InputValue<'_, String>], new: &[InputValue<'_, String>], out: &mut Vec<SchemaChange>) {
    for new_field in new {
        let path = format!("{}.{}", owner, new_field.name);
        match old.iter().find(|f| f.name == new_field.name) {
            None if is_required(new_field) => out.push(SchemaChange::new(
                ChangeType::FieldAdded,
                path,
                Breaks::Backward,
                format!("Non-null input field '{}' was added to '{}'", new_field.name, owner),
            )),
            Some(old_field) if old_field.value_type.to_string() != new_field.value_type.to_string() => {
                let (from, to) = (old_field.value_type.to_string(), new_field.value_type.to_string());
                out.push(
                    SchemaChange::new(
                        ChangeType::TypeChanged,
                        &path,
                        Breaks::Both,
                        format!("Input field '{}' changed type from '{}' to '{}'", path, from, to),
                    )
                    .with_values(from, to),
                )
            }
            _ => {}
        }
    }
    for old_field in old.iter().filter(|f| !new.iter().any(|n| n.name == f.name)) {
        out.push(SchemaChange::new(
            ChangeType::FieldRemoved,
            format!("{}.{}", owner, old_field.name),
            Breaks::Forward,
            format!("Input field '{}' was removed from '{}'", old_field.name, owner),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Stage;
    use crate::violation::ViolationCause;

    fn validate_full(text: &str) -> Vec<RuleViolation> {
        validate(
            &Content::from_string(text),
            ValidityLevel::Full,
            &ReferenceMap::empty(),
            &StageBudget::unbounded(Stage::Validating),
        )
        .unwrap()
    }

    fn changes(old: &str, new: &str) -> Vec<SchemaChange> {
        let refs = ReferenceMap::empty();
        let (old, new) = (Content::from_string(old), Content::from_string(new));
        diff(
            VersionedContent::new(&old, &refs),
            VersionedContent::new(&new, &refs),
            &StageBudget::unbounded(Stage::CheckingCompatibility),
        )
        .unwrap()
    }

    const SCHEMA: &str = r#"
        schema { query: Query }
        interface Node { id: ID! }
        type User implements Node { id: ID! name: String posts(first: Int): [Post!]! }
        type Post implements Node { id: ID! title: String! author: User }
        enum Role { ADMIN EDITOR VIEWER }
        input UserFilter { role: Role name: String }
        union SearchResult = User | Post
        type Query { user(id: ID!): User search(filter: UserFilter): [SearchResult] }
    "#;

    #[test]
    fn test_valid_schema() {
        let violations = validate_full(SCHEMA);
        assert!(violations.is_empty(), "{:?}", violations);
    }

    #[test]
    fn test_syntax_error_location() {
        let violations = validate_full("type Query {\n  user: \n}");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].cause, ViolationCause::ParseError);
        assert!(violations[0].context.is_some());
    }

    #[test]
    fn test_undefined_and_duplicate_types() {
        let violations = validate_full("type Query { a: Missing } type Query { b: Int } type T { x: Int x: Int }");
        let descriptions: Vec<&str> = violations.iter().map(|v| v.description.as_str()).collect();
        assert_eq!(violations.len(), 3, "{:?}", descriptions);
        assert!(descriptions.iter().any(|d| d.contains("'Query' is defined more than once")));
        assert!(descriptions.iter().any(|d| d.contains("'Missing' is not defined")));
        assert!(descriptions.iter().any(|d| d.contains("'x' is declared more than once")));
    }

    #[test]
    fn test_interface_consistency() {
        let violations = validate_full(
            "interface Node { id: ID! } type A implements Node { name: String } type B implements A { id: ID! }",
        );
        assert_eq!(violations.len(), 2, "{:?}", violations);
        assert!(violations.iter().any(|v| v.description.contains("does not declare its field 'id'")));
        assert!(violations.iter().any(|v| v.description.contains("not an interface")));
    }

    #[test]
    fn test_canonical_form_is_stable() {
        let content = Content::from_string("type   Query{a:Int\n\n b : String}");
        let budget = StageBudget::unbounded(Stage::Canonicalizing);
        let once = canonicalize(&content, &budget).unwrap().unwrap();
        let twice = canonicalize(&Content::from_bytes(once.clone()), &budget).unwrap().unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_breaking_changes() {
        let v2 = SCHEMA
            .replace("enum Role { ADMIN EDITOR VIEWER }", "enum Role { ADMIN VIEWER }")
            .replace("title: String! ", "")
            .replace("posts(first: Int)", "posts(first: Int, after: String!)")
            .replace("input UserFilter { role: Role name: String }", "input UserFilter { role: Role name: String org: ID! }")
            .replace("author: User", "author: User!");
        let found = changes(SCHEMA, &v2);
        let kinds: Vec<(ChangeType, &str)> = found.iter().map(|c| (c.change_type, c.path.as_str())).collect();
        assert!(kinds.contains(&(ChangeType::EnumVariantRemoved, "Role.EDITOR")));
        assert!(kinds.contains(&(ChangeType::FieldRemoved, "Post.title")));
        assert!(kinds.contains(&(ChangeType::FieldAdded, "User.posts(after)")));
        assert!(kinds.contains(&(ChangeType::FieldAdded, "UserFilter.org")));
        assert!(kinds.contains(&(ChangeType::TypeChanged, "Post.author")));
        assert_eq!(found.len(), 5);
    }

    #[test]
    fn test_removed_type() {
        let found = changes("type Query { a: Int } type Extra { b: Int }", "type Query { a: Int }");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].change_type, ChangeType::TypeRemoved);
        assert_eq!(found[0].breaks, Breaks::Backward);
    }

    #[test]
    fn test_deep_nesting_is_exhausted_not_overflowed() {
        let text = format!("type Query {{ a: {}Int{} }}", "[".repeat(10_000), "]".repeat(10_000));
        let result = validate(
            &Content::from_string(text),
            ValidityLevel::SyntaxOnly,
            &ReferenceMap::empty(),
            &StageBudget::unbounded(Stage::Validating),
        );
        assert!(result.unwrap_err().is_resource_exhausted());
    }

    #[test]
    fn test_brackets_in_comments_and_strings_do_not_nest() {
        let text = format!(
            "# {}\n\"\"\"\nSee {} for details\n\"\"\"\ntype Query {{\n  \"{}\" a: Int\n}}",
            "(".repeat(200),
            "[".repeat(200),
            "{".repeat(200),
        );
        assert_eq!(bracket_depth(&text), 1);
        let violations = validate(
            &Content::from_string(text),
            ValidityLevel::SyntaxOnly,
            &ReferenceMap::empty(),
            &StageBudget::unbounded(Stage::Validating),
        )
        .unwrap();
        assert!(violations.is_empty(), "{:?}", violations);
    }

    #[test]
    fn test_bracket_depth_counts_real_nesting() {
        assert_eq!(bracket_depth("type Query { a(x: [[Int]]): Int }"), 4);
        assert_eq!(bracket_depth("type Query { a: Int } # {{{"), 1);
        assert_eq!(bracket_depth("\"unterminated [[["), 0);
        assert_eq!(bracket_depth(r#"""" a \""" [[ """ type Q { a: Int }"#), 1);
    }
}

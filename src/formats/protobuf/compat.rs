//! Wire-level evolution rules for `.proto` files
//!
//! Messages, enums and services are matched by fully qualified name and
//! fields by number, which is what the binary encoding keys on.

use std::collections::HashMap;

use crate::budget::StageBudget;
use crate::compatibility::{Breaks, ChangeType, SchemaChange, VersionedContent};
use crate::error::Result;

use super::parser::{EnumDef, FieldDef, Label, MessageDef, ProtoFile, ServiceDef};
use super::{is_scalar, parse_file, qualify, Definitions};

/// Scalars that decode each other's encoding without loss of framing
fn wire_group(type_name: &str) -> Option<u8> {
    Some(match type_name {
        "int32" | "uint32" | "int64" | "uint64" | "bool" => 0,
        "sint32" | "sint64" => 1,
        "fixed32" | "sfixed32" => 2,
        "fixed64" | "sfixed64" => 3,
        "string" | "bytes" => 4,
        "float" => 5,
        "double" => 6,
        _ => return None,
    })
}

fn simple_name(type_name: &str) -> &str {
    type_name.rsplit('.').next().unwrap_or(type_name)
}

fn wire_compatible(old: &FieldDef, new: &FieldDef) -> bool {
    match (&old.map_types, &new.map_types) {
        (Some((ok, ov)), Some((nk, nv))) => return ok == nk && types_compatible(ov, nv),
        (None, None) => {}
        _ => return false,
    }
    types_compatible(&old.type_name, &new.type_name)
}

fn types_compatible(old: &str, new: &str) -> bool {
    if old == new {
        return true;
    }
    match (is_scalar(old), is_scalar(new)) {
        (true, true) => wire_group(old) == wire_group(new),
        (false, false) => simple_name(old) == simple_name(new),
        _ => false,
    }
}

fn load(side: &str, version: VersionedContent<'_>, budget: &StageBudget) -> Result<std::result::Result<ProtoFile, SchemaChange>> {
    Ok(parse_file(version.content, budget)?.map_err(|v| SchemaChange::unparsable(side, v.description)))
}

pub(super) fn diff(prior: VersionedContent<'_>, candidate: VersionedContent<'_>, budget: &StageBudget) -> Result<Vec<SchemaChange>> {
    let old_file = match load("prior", prior, budget)? {
        Ok(f) => f,
        Err(change) => return Ok(vec![change]),
    };
    let new_file = match load("candidate", candidate, budget)? {
        Ok(f) => f,
        Err(change) => return Ok(vec![change]),
    };
    let old = Definitions::of(&old_file);
    let new = Definitions::of(&new_file);
    let mut changes = Vec::new();

    for (name, old_message) in &old.messages {
        budget.check()?;
        match new.messages.get(name) {
            Some(new_message) => diff_message(name, old_message, new_message, &mut changes),
            None => changes.push(SchemaChange::new(
                ChangeType::TypeRemoved,
                name.clone(),
                Breaks::Backward,
                format!("Message '{}' was removed", name),
            )),
        }
    }

    for (name, old_enum) in &old.enums {
        match new.enums.get(name) {
            Some(new_enum) => diff_enum(name, old_enum, new_enum, &mut changes),
            None => changes.push(SchemaChange::new(
                ChangeType::TypeRemoved,
                name.clone(),
                Breaks::Backward,
                format!("Enum '{}' was removed", name),
            )),
        }
    }

    let package = old_file.package.clone().unwrap_or_default();
    for old_service in &old_file.services {
        let new_service = new_file.services.iter().find(|s| s.name == old_service.name);
        diff_service(&qualify(&package, &old_service.name), old_service, new_service, &mut changes);
    }

    Ok(changes)
}

fn diff_message(name: &str, old: &MessageDef, new: &MessageDef, out: &mut Vec<SchemaChange>) {
    let new_by_number: HashMap<i64, &FieldDef> = new.fields.iter().map(|f| (f.number, f)).collect();
    let old_by_number: HashMap<i64, &FieldDef> = old.fields.iter().map(|f| (f.number, f)).collect();

    for old_field in &old.fields {
        let path = format!("{}.{}", name, old_field.name);
        let Some(new_field) = new_by_number.get(&old_field.number) else {
            let reserved = new.reserved.number(old_field.number) && new.reserved.name(&old_field.name);
            if !reserved {
                out.push(SchemaChange::new(
                    ChangeType::FieldRemoved,
                    &path,
                    Breaks::Backward,
                    format!(
                        "Field '{}' (number {}) was removed from message '{}' without reserving its number and name",
                        old_field.name, old_field.number, name
                    ),
                ));
            }
            if old_field.label == Label::Required {
                out.push(SchemaChange::new(
                    ChangeType::OptionalityChanged,
                    &path,
                    Breaks::Forward,
                    format!("Required field '{}' was removed from message '{}'", old_field.name, name),
                ));
            }
            continue;
        };

        if new_field.name != old_field.name {
            out.push(
                SchemaChange::new(
                    ChangeType::FieldReused,
                    &path,
                    Breaks::Both,
                    format!(
                        "Field number {} in message '{}' was '{}' and is now '{}'",
                        old_field.number, name, old_field.name, new_field.name
                    ),
                )
                .with_values(&old_field.name, &new_field.name),
            );
        }

        if !wire_compatible(old_field, new_field) {
            out.push(
                SchemaChange::new(
                    ChangeType::TypeChanged,
                    &path,
                    Breaks::Both,
                    format!(
                        "Field '{}' in message '{}' changed type from '{}' to '{}'",
                        old_field.name, name, old_field.type_name, new_field.type_name
                    ),
                )
                .with_values(&old_field.type_name, &new_field.type_name),
            );
        }

        let was_repeated = old_field.label == Label::Repeated;
        let is_repeated = new_field.label == Label::Repeated;
        if was_repeated != is_repeated {
            out.push(
                SchemaChange::new(
                    ChangeType::OptionalityChanged,
                    &path,
                    Breaks::Both,
                    format!(
                        "Field '{}' in message '{}' changed label from {} to {}",
                        old_field.name,
                        name,
                        old_field.label.as_str(),
                        new_field.label.as_str()
                    ),
                )
                .with_values(old_field.label.as_str(), new_field.label.as_str()),
            );
        }

        if let Some(oneof) = &new_field.oneof {
            let joined_existing = old_field.oneof.as_ref() != Some(oneof)
                && old.fields.iter().any(|f| f.oneof.as_ref() == Some(oneof));
            if joined_existing {
                out.push(
                    SchemaChange::new(
                        ChangeType::OptionalityChanged,
                        &path,
                        Breaks::Both,
                        format!(
                            "Field '{}' in message '{}' moved into the existing oneof '{}'",
                            old_field.name, name, oneof
                        ),
                    )
                    .with_values(old_field.oneof.as_deref().unwrap_or("none"), oneof.as_str()),
                );
            }
        }

        match (old_field.label == Label::Required, new_field.label == Label::Required) {
            (false, true) => out.push(SchemaChange::new(
                ChangeType::OptionalityChanged,
                &path,
                Breaks::Backward,
                format!("Field '{}' in message '{}' became required", old_field.name, name),
            )),
            (true, false) => out.push(SchemaChange::new(
                ChangeType::OptionalityChanged,
                &path,
                Breaks::Forward,
                format!("Field '{}' in message '{}' is no longer required", old_field.name, name),
            )),
            _ => {}
        }
    }

    for new_field in &new.fields {
        if old_by_number.contains_key(&new_field.number) {
            continue;
        }
        let path = format!("{}.{}", name, new_field.name);
        if old.reserved.number(new_field.number) || old.reserved.name(&new_field.name) {
            out.push(SchemaChange::new(
                ChangeType::FieldReused,
                &path,
                Breaks::Both,
                format!(
                    "Field '{}' (number {}) reuses a number or name reserved in message '{}'",
                    new_field.name, new_field.number, name
                ),
            ));
        }
        if new_field.label == Label::Required {
            out.push(SchemaChange::new(
                ChangeType::FieldAdded,
                &path,
                Breaks::Backward,
                format!("Required field '{}' was added to message '{}'", new_field.name, name),
            ));
        }
    }
}

fn diff_enum(name: &str, old: &EnumDef, new: &EnumDef, out: &mut Vec<SchemaChange>) {
    for old_value in &old.values {
        let path = format!("{}.{}", name, old_value.name);
        match new.values.iter().find(|v| v.name == old_value.name) {
            None => out.push(SchemaChange::new(
                ChangeType::EnumVariantRemoved,
                path,
                Breaks::Backward,
                format!("Enum value '{}' was removed from '{}'", old_value.name, name),
            )),
            Some(new_value) if new_value.number != old_value.number => out.push(
                SchemaChange::new(
                    ChangeType::FieldReused,
                    path,
                    Breaks::Both,
                    format!(
                        "Enum value '{}' in '{}' changed number from {} to {}",
                        old_value.name, name, old_value.number, new_value.number
                    ),
                )
                .with_values(old_value.number.to_string(), new_value.number.to_string()),
            ),
            Some(_) => {}
        }
    }
}

fn diff_service(name: &str, old: &ServiceDef, new: Option<&ServiceDef>, out: &mut Vec<SchemaChange>) {
    let Some(new) = new else {
        out.push(SchemaChange::new(
            ChangeType::OperationRemoved,
            name,
            Breaks::Backward,
            format!("Service '{}' was removed", name),
        ));
        return;
    };
    for old_rpc in &old.rpcs {
        let path = format!("{}.{}", name, old_rpc.name);
        let Some(new_rpc) = new.rpcs.iter().find(|r| r.name == old_rpc.name) else {
            out.push(SchemaChange::new(
                ChangeType::OperationRemoved,
                path,
                Breaks::Backward,
                format!("RPC '{}' was removed from service '{}'", old_rpc.name, name),
            ));
            continue;
        };
        let signature_changed = simple_name(&old_rpc.input) != simple_name(&new_rpc.input)
            || simple_name(&old_rpc.output) != simple_name(&new_rpc.output)
            || old_rpc.client_streaming != new_rpc.client_streaming
            || old_rpc.server_streaming != new_rpc.server_streaming;
        if signature_changed {
            out.push(SchemaChange::new(
                ChangeType::TypeChanged,
                path,
                Breaks::Both,
                format!("RPC '{}' in service '{}' changed its request or response type", old_rpc.name, name),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Content;
    use crate::executor::Stage;
    use crate::references::ReferenceMap;

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

    const V1: &str = "syntax = \"proto3\"; package p; message A { string id = 1; int32 count = 2; repeated string tags = 3; }";

    #[test]
    fn test_identical_and_added_fields() {
        assert!(changes(V1, V1).is_empty());
        let added = "syntax = \"proto3\"; package p; message A { string id = 1; int32 count = 2; repeated string tags = 3; bool ok = 4; }";
        assert!(changes(V1, added).is_empty());
    }

    #[test]
    fn test_removed_field_must_be_reserved() {
        let removed = "syntax = \"proto3\"; package p; message A { string id = 1; repeated string tags = 3; }";
        let found = changes(V1, removed);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].change_type, ChangeType::FieldRemoved);
        assert_eq!(found[0].path, "p.A.count");

        let reserved = "syntax = \"proto3\"; package p; message A { reserved 2; reserved \"count\"; string id = 1; repeated string tags = 3; }";
        assert!(changes(V1, reserved).is_empty());
    }

    #[test]
    fn test_number_reuse_and_type_change() {
        let reused = "syntax = \"proto3\"; package p; message A { string id = 1; string label = 2; repeated string tags = 3; }";
        let found = changes(V1, reused);
        let kinds: Vec<ChangeType> = found.iter().map(|c| c.change_type).collect();
        assert_eq!(kinds, vec![ChangeType::FieldReused, ChangeType::TypeChanged]);
        assert!(found.iter().all(|c| c.breaks == Breaks::Both));
    }

    #[test]
    fn test_wire_compatible_widening_is_allowed() {
        let widened = "syntax = \"proto3\"; package p; message A { bytes id = 1; int64 count = 2; repeated string tags = 3; }";
        assert!(changes(V1, widened).is_empty());
    }

    #[test]
    fn test_label_change() {
        let singular = "syntax = \"proto3\"; package p; message A { string id = 1; int32 count = 2; string tags = 3; }";
        let found = changes(V1, singular);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].change_type, ChangeType::OptionalityChanged);
        assert_eq!(found[0].old_value.as_deref(), Some("repeated"));
    }

    #[test]
    fn test_oneof_membership() {
        let old = "syntax = \"proto3\"; message A { string id = 1; oneof key { string a = 2; string b = 3; } }";
        let joined = "syntax = \"proto3\"; message A { oneof key { string id = 1; string a = 2; string b = 3; } }";
        let found = changes(old, joined);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, "A.id");
        assert_eq!(found[0].breaks, Breaks::Both);
        assert_eq!(found[0].new_value.as_deref(), Some("key"));

        // A new oneof wrapping one existing field keeps the wire format
        let wrapped = "syntax = \"proto3\"; message A { oneof ident { string id = 1; } oneof key { string a = 2; string b = 3; } }";
        assert!(changes(old, wrapped).is_empty());
    }

    #[test]
    fn test_proto2_required_changes() {
        let old = "syntax = \"proto2\"; message A { required string id = 1; }";
        let relaxed = "syntax = \"proto2\"; message A { optional string id = 1; }";
        let found = changes(old, relaxed);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].breaks, Breaks::Forward);

        let added = "syntax = \"proto2\"; message A { required string id = 1; required int32 v = 2; }";
        let found = changes(old, added);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].change_type, ChangeType::FieldAdded);
        assert_eq!(found[0].breaks, Breaks::Backward);
    }

    #[test]
    fn test_removed_types_values_and_rpcs() {
        let old = "syntax = \"proto3\"; message A {} message B {} enum E { E0 = 0; E1 = 1; } \
                   service S { rpc Get (A) returns (B); rpc Put (A) returns (B); }";
        let new = "syntax = \"proto3\"; message A {} enum E { E0 = 0; } service S { rpc Get (A) returns (A); }";
        let found = changes(old, new);
        let kinds: Vec<ChangeType> = found.iter().map(|c| c.change_type).collect();
        assert!(kinds.contains(&ChangeType::TypeRemoved));
        assert!(kinds.contains(&ChangeType::EnumVariantRemoved));
        assert!(kinds.contains(&ChangeType::OperationRemoved));
        assert!(kinds.contains(&ChangeType::TypeChanged));
    }

    #[test]
    fn test_unparsable_candidate() {
        let found = changes(V1, "message {");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].change_type, ChangeType::Unparsable);
    }
}

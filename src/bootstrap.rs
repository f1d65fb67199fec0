//! Hand-built meta-descriptor.
//!
//! Loading user schemas requires decoding a serialized
//! `google.protobuf.FileDescriptorSet`, which is itself a protobuf
//! message. The defs for that message cannot be loaded from a
//! descriptor, so they are constructed here directly, covering the
//! subset of `descriptor.proto` this runtime consumes. The frozen set
//! is built once and shared for the life of the process.

use std::sync::OnceLock;

use crate::defs::{DefPool, FieldBuilder, FrozenSet, Label, MessageDef, Syntax};
use crate::wire::FieldType;
use crate::{Error, Result};

const PKG: &str = "google.protobuf";

fn msg_field(name: &str, number: u32, type_name: &str) -> FieldBuilder {
    FieldBuilder::new(name, number, FieldType::Message, Label::Optional)
        .subdef_name(&format!("{PKG}.{type_name}"))
}

fn rep_msg_field(name: &str, number: u32, type_name: &str) -> FieldBuilder {
    FieldBuilder::new(name, number, FieldType::Message, Label::Repeated)
        .subdef_name(&format!("{PKG}.{type_name}"))
}

fn build_meta() -> Result<FrozenSet> {
    let mut pool = DefPool::new();

    let set = pool.add_msg(&format!("{PKG}.FileDescriptorSet"))?;
    pool.add_field(set, rep_msg_field("file", 1, "FileDescriptorProto"))?;

    let file = pool.add_msg(&format!("{PKG}.FileDescriptorProto"))?;
    pool.add_field(
        file,
        FieldBuilder::new("name", 1, FieldType::String, Label::Optional),
    )?;
    pool.add_field(
        file,
        FieldBuilder::new("package", 2, FieldType::String, Label::Optional),
    )?;
    pool.add_field(
        file,
        FieldBuilder::new("dependency", 3, FieldType::String, Label::Repeated),
    )?;
    pool.add_field(file, rep_msg_field("message_type", 4, "DescriptorProto"))?;
    pool.add_field(file, rep_msg_field("enum_type", 5, "EnumDescriptorProto"))?;
    pool.add_field(
        file,
        FieldBuilder::new("syntax", 12, FieldType::String, Label::Optional),
    )?;

    let msg = pool.add_msg(&format!("{PKG}.DescriptorProto"))?;
    pool.add_field(
        msg,
        FieldBuilder::new("name", 1, FieldType::String, Label::Optional),
    )?;
    pool.add_field(msg, rep_msg_field("field", 2, "FieldDescriptorProto"))?;
    pool.add_field(msg, rep_msg_field("nested_type", 3, "DescriptorProto"))?;
    pool.add_field(msg, rep_msg_field("enum_type", 4, "EnumDescriptorProto"))?;
    pool.add_field(msg, msg_field("options", 7, "MessageOptions"))?;
    pool.add_field(msg, rep_msg_field("oneof_decl", 8, "OneofDescriptorProto"))?;

    let field = pool.add_msg(&format!("{PKG}.FieldDescriptorProto"))?;
    pool.add_field(
        field,
        FieldBuilder::new("name", 1, FieldType::String, Label::Optional),
    )?;
    pool.add_field(
        field,
        FieldBuilder::new("number", 3, FieldType::Int32, Label::Optional),
    )?;
    // label and type are enums in descriptor.proto; the raw numbers are
    // all this loader needs.
    pool.add_field(
        field,
        FieldBuilder::new("label", 4, FieldType::Int32, Label::Optional),
    )?;
    pool.add_field(
        field,
        FieldBuilder::new("type", 5, FieldType::Int32, Label::Optional),
    )?;
    pool.add_field(
        field,
        FieldBuilder::new("type_name", 6, FieldType::String, Label::Optional),
    )?;
    pool.add_field(
        field,
        FieldBuilder::new("default_value", 7, FieldType::String, Label::Optional),
    )?;
    pool.add_field(field, msg_field("options", 8, "FieldOptions"))?;
    pool.add_field(
        field,
        FieldBuilder::new("oneof_index", 9, FieldType::Int32, Label::Optional),
    )?;
    pool.add_field(
        field,
        FieldBuilder::new("json_name", 10, FieldType::String, Label::Optional),
    )?;

    let fopts = pool.add_msg(&format!("{PKG}.FieldOptions"))?;
    pool.add_field(
        fopts,
        FieldBuilder::new("packed", 2, FieldType::Bool, Label::Optional),
    )?;
    pool.add_field(
        fopts,
        FieldBuilder::new("lazy", 5, FieldType::Bool, Label::Optional),
    )?;

    let mopts = pool.add_msg(&format!("{PKG}.MessageOptions"))?;
    pool.add_field(
        mopts,
        FieldBuilder::new("map_entry", 7, FieldType::Bool, Label::Optional),
    )?;

    let en = pool.add_msg(&format!("{PKG}.EnumDescriptorProto"))?;
    pool.add_field(
        en,
        FieldBuilder::new("name", 1, FieldType::String, Label::Optional),
    )?;
    pool.add_field(en, rep_msg_field("value", 2, "EnumValueDescriptorProto"))?;

    let env = pool.add_msg(&format!("{PKG}.EnumValueDescriptorProto"))?;
    pool.add_field(
        env,
        FieldBuilder::new("name", 1, FieldType::String, Label::Optional),
    )?;
    pool.add_field(
        env,
        FieldBuilder::new("number", 2, FieldType::Int32, Label::Optional),
    )?;

    let oneof = pool.add_msg(&format!("{PKG}.OneofDescriptorProto"))?;
    pool.add_field(
        oneof,
        FieldBuilder::new("name", 1, FieldType::String, Label::Optional),
    )?;

    for id in [set, file, msg, field, fopts, mopts, en, env, oneof] {
        pool.msg_set_syntax(id, Syntax::Proto2);
    }

    pool.freeze(crate::DEFAULT_MAX_NESTING)
}

fn meta() -> &'static Result<FrozenSet> {
    static META: OnceLock<Result<FrozenSet>> = OnceLock::new();
    META.get_or_init(build_meta)
}

/// The frozen def for `google.protobuf.FileDescriptorSet`.
pub(crate) fn file_descriptor_set_def() -> Result<MessageDef> {
    let set = match meta() {
        Ok(set) => set,
        Err(e) => return Err(e.clone()),
    };
    set.msgs
        .iter()
        .find(|m| m.full_name() == "google.protobuf.FileDescriptorSet")
        .cloned()
        .ok_or_else(|| Error::failed("meta-descriptor is missing FileDescriptorSet".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_descriptor_freezes() {
        let set = file_descriptor_set_def().unwrap();
        let file = set.field_by_name("file").unwrap();
        assert!(file.is_repeated());
        let file_def = file.message_subdef().unwrap();
        assert_eq!(file_def.full_name(), "google.protobuf.FileDescriptorProto");
        let msg_def = file_def
            .field_by_name("message_type")
            .unwrap()
            .message_subdef()
            .unwrap();
        // DescriptorProto nests through itself via nested_type.
        assert_eq!(
            msg_def
                .field_by_name("nested_type")
                .unwrap()
                .message_subdef()
                .unwrap()
                .full_name(),
            msg_def.full_name()
        );
    }

    #[test]
    fn field_descriptor_carries_loader_fields() {
        let set = file_descriptor_set_def().unwrap();
        let field_def = set
            .field_by_name("file")
            .unwrap()
            .message_subdef()
            .unwrap()
            .field_by_name("message_type")
            .unwrap()
            .message_subdef()
            .unwrap()
            .field_by_name("field")
            .unwrap()
            .message_subdef()
            .unwrap();
        for name in [
            "name",
            "number",
            "label",
            "type",
            "type_name",
            "default_value",
            "oneof_index",
            "json_name",
        ] {
            assert!(field_def.field_by_name(name).is_some(), "missing {name}");
        }
    }
}

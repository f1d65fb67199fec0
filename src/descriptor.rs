//! Loader for serialized `google.protobuf.FileDescriptorSet` payloads.
//!
//! The loader is self-hosting: the descriptor bytes are decoded by the
//! same bytecode VM as any other message, driven by the hand-built
//! meta-descriptor in [`bootstrap`](crate::bootstrap). The decoded tree
//! is then replayed into a [`DefPool`] and merged into a
//! [`SymbolTable`], one pool per descriptor set so that references
//! between files in the same set resolve without ordering concerns.

use log::debug;

use crate::arena::Arena;
use crate::bootstrap;
use crate::defs::{DefaultValue, DefPool, FieldBuilder, Label, MsgId, Syntax};
use crate::fill::decode_message;
use crate::message::Message;
use crate::symtab::SymbolTable;
use crate::wire::FieldType;
use crate::{Error, Result};

/// Decodes a `FileDescriptorSet` and adds every file it contains to
/// `tab`. The whole set is one atomic add.
pub fn load_descriptor_set(tab: &mut SymbolTable, bytes: &[u8]) -> Result<()> {
    let set_def = bootstrap::file_descriptor_set_def()?;
    let arena = Arena::new();
    let set = decode_message(&arena, &set_def, bytes)?;

    let mut pool = DefPool::new();
    let file_f = req_field(&set, "file")?;
    if let Some(files) = set.get_array(&file_f) {
        for i in 0..files.len() {
            load_file(&mut pool, &files.get_message(i))?;
        }
    }
    tab.add(pool)
}

fn req_field(msg: &Message, name: &str) -> Result<crate::defs::FieldDef> {
    msg.def()
        .field_by_name(name)
        .ok_or_else(|| Error::failed(format!("meta-descriptor lacks field {name}")))
}

fn get_str(msg: &Message, name: &str) -> Result<Option<String>> {
    let f = req_field(msg, name)?;
    if !msg.has(&f) {
        return Ok(None);
    }
    let bytes = msg.get_bytes(&f).unwrap_or_default();
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| Error::failed(format!("descriptor field {name} is not UTF-8")))
}

fn load_file(pool: &mut DefPool, file: &Message) -> Result<()> {
    let name = get_str(file, "name")?.unwrap_or_default();
    let package = get_str(file, "package")?.unwrap_or_default();
    let syntax = match get_str(file, "syntax")?.as_deref() {
        Some("proto3") => Syntax::Proto3,
        Some("proto2") | Some("") | None => Syntax::Proto2,
        Some(other) => {
            return Err(Error::failed(format!("unknown syntax {other:?} in {name}")))
        }
    };
    debug!("loading file descriptor {name} (package {package:?})");
    let file_id = pool.add_file(&name, &package, syntax);

    let dep_f = req_field(file, "dependency")?;
    if let Some(deps) = file.get_array(&dep_f) {
        for i in 0..deps.len() {
            let dep = String::from_utf8(deps.get_bytes(i))
                .map_err(|_| Error::failed(format!("bad dependency name in {name}")))?;
            pool.file_add_dep(file_id, &dep);
        }
    }

    let msg_f = req_field(file, "message_type")?;
    if let Some(msgs) = file.get_array(&msg_f) {
        for i in 0..msgs.len() {
            let id = load_message(pool, &msgs.get_message(i), &package, syntax)?;
            pool.file_add_msg(file_id, id);
        }
    }
    let enum_f = req_field(file, "enum_type")?;
    if let Some(enums) = file.get_array(&enum_f) {
        for i in 0..enums.len() {
            let id = load_enum(pool, &enums.get_message(i), &package)?;
            pool.file_add_enum(file_id, id);
        }
    }
    Ok(())
}

fn scoped(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_owned()
    } else {
        format!("{scope}.{name}")
    }
}

fn load_message(
    pool: &mut DefPool,
    desc: &Message,
    scope: &str,
    syntax: Syntax,
) -> Result<MsgId> {
    let name = get_str(desc, "name")?
        .ok_or_else(|| Error::failed("message descriptor has no name".into()))?;
    let full_name = scoped(scope, &name);
    let id = pool.add_msg(&full_name)?;
    pool.msg_set_syntax(id, syntax);

    let opts_f = req_field(desc, "options")?;
    if let Some(opts) = desc.get_message(&opts_f) {
        let me_f = req_field(&opts, "map_entry")?;
        if opts.get_bool(&me_f) {
            pool.msg_set_map_entry(id, true);
        }
    }

    let nested_f = req_field(desc, "nested_type")?;
    if let Some(nested) = desc.get_array(&nested_f) {
        for i in 0..nested.len() {
            load_message(pool, &nested.get_message(i), &full_name, syntax)?;
        }
    }
    let enum_f = req_field(desc, "enum_type")?;
    if let Some(enums) = desc.get_array(&enum_f) {
        for i in 0..enums.len() {
            load_enum(pool, &enums.get_message(i), &full_name)?;
        }
    }

    // Oneof members are collected per declaration index and added as a
    // unit; plain fields go straight into the message.
    let oneof_count = {
        let f = req_field(desc, "oneof_decl")?;
        desc.get_array(&f).map(|a| a.len()).unwrap_or(0)
    };
    let mut oneof_members: Vec<Vec<FieldBuilder>> = vec![Vec::new(); oneof_count];

    let field_f = req_field(desc, "field")?;
    if let Some(fields) = desc.get_array(&field_f) {
        for i in 0..fields.len() {
            let fd = fields.get_message(i);
            let (builder, oneof_index) = load_field(&fd, &full_name)?;
            match oneof_index {
                Some(idx) if (idx as usize) < oneof_count => {
                    oneof_members[idx as usize].push(builder);
                }
                Some(idx) => {
                    return Err(Error::failed(format!(
                        "oneof index {idx} out of range in {full_name}"
                    )))
                }
                None => pool.add_field(id, builder)?,
            }
        }
    }

    let decl_f = req_field(desc, "oneof_decl")?;
    if let Some(decls) = desc.get_array(&decl_f) {
        for (i, members) in oneof_members.into_iter().enumerate() {
            let decl = decls.get_message(i);
            let oneof_name = get_str(&decl, "name")?
                .ok_or_else(|| Error::failed("oneof declaration has no name".into()))?;
            pool.add_oneof(id, &oneof_name, members)?;
        }
    }
    Ok(id)
}

fn load_field(desc: &Message, container: &str) -> Result<(FieldBuilder, Option<i32>)> {
    let name = get_str(desc, "name")?
        .ok_or_else(|| Error::failed(format!("field in {container} has no name")))?;
    let number_f = req_field(desc, "number")?;
    let number = desc.get_int32(&number_f);
    if number <= 0 {
        return Err(Error::failed(format!(
            "field {container}.{name} has number {number}"
        )));
    }
    let ty_f = req_field(desc, "type")?;
    let ty = FieldType::from_descriptor(desc.get_int32(&ty_f))?;
    let label_f = req_field(desc, "label")?;
    let label = match desc.get_int32(&label_f) {
        0 | 1 => Label::Optional,
        2 => Label::Required,
        3 => Label::Repeated,
        other => {
            return Err(Error::failed(format!(
                "field {container}.{name} has label {other}"
            )))
        }
    };

    let mut builder = FieldBuilder::new(&name, number as u32, ty, label);
    if let Some(type_name) = get_str(desc, "type_name")? {
        builder = builder.subdef_name(type_name.trim_start_matches('.'));
    }
    if let Some(json_name) = get_str(desc, "json_name")? {
        builder = builder.json_name(&json_name);
    }
    if let Some(default) = get_str(desc, "default_value")? {
        builder = builder.default_value(parse_default(&default, ty, &name, container)?);
    }

    let opts_f = req_field(desc, "options")?;
    if let Some(opts) = desc.get_message(&opts_f) {
        let packed_f = req_field(&opts, "packed")?;
        if opts.has(&packed_f) {
            builder = builder.packed(opts.get_bool(&packed_f));
        }
        let lazy_f = req_field(&opts, "lazy")?;
        if opts.get_bool(&lazy_f) {
            builder = builder.lazy(true);
        }
    }

    let oneof_f = req_field(desc, "oneof_index")?;
    let oneof_index = if desc.has(&oneof_f) {
        Some(desc.get_int32(&oneof_f))
    } else {
        None
    };
    Ok((builder, oneof_index))
}

/// Parses a descriptor `default_value` string into a typed default.
/// String and bytes defaults are carried verbatim.
fn parse_default(s: &str, ty: FieldType, name: &str, container: &str) -> Result<DefaultValue> {
    let bad = || Error::failed(format!("bad default {s:?} for {container}.{name}"));
    Ok(match ty {
        FieldType::Bool => match s {
            "true" => DefaultValue::Bool(true),
            "false" => DefaultValue::Bool(false),
            _ => return Err(bad()),
        },
        FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 => {
            DefaultValue::Int32(s.parse().map_err(|_| bad())?)
        }
        FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64 => {
            DefaultValue::Int64(s.parse().map_err(|_| bad())?)
        }
        FieldType::UInt32 | FieldType::Fixed32 => {
            DefaultValue::UInt32(s.parse().map_err(|_| bad())?)
        }
        FieldType::UInt64 | FieldType::Fixed64 => {
            DefaultValue::UInt64(s.parse().map_err(|_| bad())?)
        }
        FieldType::Float => DefaultValue::Float(parse_f32(s).ok_or_else(bad)?),
        FieldType::Double => DefaultValue::Double(parse_f64(s).ok_or_else(bad)?),
        FieldType::Enum => DefaultValue::EnumName(s.to_owned()),
        FieldType::String | FieldType::Bytes => DefaultValue::Bytes(s.as_bytes().to_vec()),
        FieldType::Message | FieldType::Group => return Err(bad()),
    })
}

fn parse_f32(s: &str) -> Option<f32> {
    match s {
        "inf" => Some(f32::INFINITY),
        "-inf" => Some(f32::NEG_INFINITY),
        "nan" => Some(f32::NAN),
        _ => s.parse().ok(),
    }
}

fn parse_f64(s: &str) -> Option<f64> {
    match s {
        "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        "nan" => Some(f64::NAN),
        _ => s.parse().ok(),
    }
}

fn load_enum(pool: &mut DefPool, desc: &Message, scope: &str) -> Result<crate::defs::EnumId> {
    let name = get_str(desc, "name")?
        .ok_or_else(|| Error::failed("enum descriptor has no name".into()))?;
    let full_name = scoped(scope, &name);
    let id = pool.add_enum(&full_name)?;
    let value_f = req_field(desc, "value")?;
    let mut first: Option<i32> = None;
    if let Some(values) = desc.get_array(&value_f) {
        for i in 0..values.len() {
            let v = values.get_message(i);
            let vname = get_str(&v, "name")?
                .ok_or_else(|| Error::failed(format!("enum value in {full_name} has no name")))?;
            let num_f = req_field(&v, "number")?;
            let number = v.get_int32(&num_f);
            pool.enum_add_value(id, &vname, number)?;
            if first.is_none() {
                first = Some(number);
            }
        }
    }
    if let Some(number) = first {
        pool.enum_set_default(id, number);
    }
    Ok(id)
}

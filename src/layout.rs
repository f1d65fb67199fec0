//! Computes the in-memory layout of a message from its frozen definition.
//!
//! A layout assigns every field a fixed byte offset inside a flat payload:
//! hasbit bytes first, then non-oneof fields at size-aligned offsets, then
//! one case tag plus one shared data slot per oneof. Scalars are stored
//! inline; strings, submessages, arrays, and maps are stored as 4-byte
//! handles into the arena's value store (0 means unset).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};

use crate::defs::{MessageDef, ResolvedDefault, Syntax};
use crate::wire::FieldType;

/// Bytes occupied by one field's payload slot.
pub(crate) fn slot_size(ty: FieldType, repeated: bool) -> u32 {
    if repeated {
        return HANDLE_SIZE;
    }
    match ty {
        FieldType::Bool => 1,
        FieldType::Float
        | FieldType::Int32
        | FieldType::UInt32
        | FieldType::SInt32
        | FieldType::Fixed32
        | FieldType::SFixed32
        | FieldType::Enum => 4,
        FieldType::Double
        | FieldType::Int64
        | FieldType::UInt64
        | FieldType::SInt64
        | FieldType::Fixed64
        | FieldType::SFixed64 => 8,
        FieldType::String | FieldType::Bytes | FieldType::Message | FieldType::Group => {
            HANDLE_SIZE
        }
    }
}

pub(crate) const HANDLE_SIZE: u32 = 4;

#[derive(Debug, Clone, Copy)]
pub(crate) struct FieldLayout {
    pub offset: u32,
    pub hasbit: Option<u32>,
    pub oneof: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct OneofLayout {
    pub case_offset: u32,
    pub data_offset: u32,
}

/// The frozen layout of one message type.
pub struct MessageLayout {
    def: MessageDef,
    size: u32,
    hasbit_count: u32,
    is_proto2: bool,
    pub(crate) fields: Vec<FieldLayout>,
    pub(crate) oneofs: Vec<OneofLayout>,
    /// Size-length template a fresh message is copied from. Proto2 scalar
    /// defaults are pre-filled; handles and hasbits are zero.
    pub(crate) default_msg: Vec<u8>,
}

impl MessageLayout {
    pub fn new(def: &MessageDef) -> Arc<MessageLayout> {
        let is_proto2 = def.syntax() == Syntax::Proto2;
        let mut fields = vec![
            FieldLayout {
                offset: 0,
                hasbit: None,
                oneof: None,
            };
            def.field_count()
        ];

        // Hasbits first, so the bitmap sits at the start of the payload.
        let mut hasbit_count = 0u32;
        for f in def.fields() {
            if f.has_presence() && f.containing_oneof().is_none() {
                fields[f.index() as usize].hasbit = Some(hasbit_count);
                hasbit_count += 1;
            }
        }
        let mut size = hasbit_count.div_ceil(8);

        for f in def.fields() {
            if let Some(o) = f.containing_oneof() {
                fields[f.index() as usize].oneof = Some(o.index());
                continue;
            }
            let slot = slot_size(f.field_type(), f.is_repeated());
            size = align_up(size, slot);
            fields[f.index() as usize].offset = size;
            size += slot;
        }

        let mut oneofs = Vec::with_capacity(def.oneof_count());
        for o in def.oneofs() {
            let max_slot = o
                .fields()
                .map(|f| slot_size(f.field_type(), false))
                .max()
                .unwrap_or(HANDLE_SIZE);
            size = align_up(size, 4);
            let case_offset = size;
            size += 4;
            size = align_up(size, max_slot);
            let data_offset = size;
            size += max_slot;
            oneofs.push(OneofLayout {
                case_offset,
                data_offset,
            });
            for f in o.fields() {
                fields[f.index() as usize].offset = data_offset;
            }
        }

        size = align_up(size, 8);

        let mut layout = MessageLayout {
            def: def.clone(),
            size,
            hasbit_count,
            is_proto2,
            fields,
            oneofs,
            default_msg: vec![0; size as usize],
        };
        if is_proto2 {
            layout.fill_defaults();
        }
        Arc::new(layout)
    }

    pub fn def(&self) -> &MessageDef {
        &self.def
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn hasbit_count(&self) -> u32 {
        self.hasbit_count
    }

    pub fn is_proto2(&self) -> bool {
        self.is_proto2
    }

    pub(crate) fn field(&self, index: u32) -> &FieldLayout {
        &self.fields[index as usize]
    }

    /// Writes proto2 scalar defaults into the template. Oneof members and
    /// handle-typed fields stay zero.
    fn fill_defaults(&mut self) {
        let def = self.def.clone();
        for f in def.fields() {
            let fl = self.fields[f.index() as usize];
            if fl.oneof.is_some() || f.is_repeated() {
                continue;
            }
            let ofs = fl.offset as usize;
            let buf = &mut self.default_msg;
            match f.resolved_default() {
                ResolvedDefault::None | ResolvedDefault::Bytes(_) => {}
                ResolvedDefault::Int32(v) => LittleEndian::write_i32(&mut buf[ofs..], *v),
                ResolvedDefault::UInt32(v) => LittleEndian::write_u32(&mut buf[ofs..], *v),
                ResolvedDefault::Int64(v) => LittleEndian::write_i64(&mut buf[ofs..], *v),
                ResolvedDefault::UInt64(v) => LittleEndian::write_u64(&mut buf[ofs..], *v),
                ResolvedDefault::Float(v) => LittleEndian::write_f32(&mut buf[ofs..], *v),
                ResolvedDefault::Double(v) => LittleEndian::write_f64(&mut buf[ofs..], *v),
                ResolvedDefault::Bool(v) => buf[ofs] = u8::from(*v),
                ResolvedDefault::Enum(v) => LittleEndian::write_i32(&mut buf[ofs..], *v),
            }
        }
    }
}

fn align_up(ofs: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two() || align == 1);
    (ofs + align - 1) & !(align - 1)
}

/// Caches one layout per message definition. Layouts are built on first
/// request and live as long as some user holds the returned `Arc`.
#[derive(Default)]
pub struct LayoutCache {
    layouts: Mutex<HashMap<MessageDef, Arc<MessageLayout>>>,
}

impl LayoutCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, def: &MessageDef) -> Arc<MessageLayout> {
        let mut layouts = match self.layouts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            layouts
                .entry(def.clone())
                .or_insert_with(|| MessageLayout::new(def)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{DefPool, FieldBuilder, Label};

    fn freeze_one(configure: impl FnOnce(&mut DefPool, crate::defs::MsgId)) -> MessageDef {
        let mut pool = DefPool::new();
        let m = pool.add_msg("test.M").unwrap();
        configure(&mut pool, m);
        pool.freeze(64).unwrap().msgs.swap_remove(0)
    }

    #[test]
    fn proto3_scalars_have_no_hasbits() {
        let def = freeze_one(|pool, m| {
            pool.msg_set_syntax(m, Syntax::Proto3);
            pool.add_field(m, FieldBuilder::new("a", 1, FieldType::Int32, Label::Optional))
                .unwrap();
            pool.add_field(m, FieldBuilder::new("b", 2, FieldType::Int64, Label::Optional))
                .unwrap();
        });
        let layout = MessageLayout::new(&def);
        assert_eq!(layout.hasbit_count(), 0);
        // int32 at 0, int64 aligned to 8.
        assert_eq!(layout.field(0).offset, 0);
        assert_eq!(layout.field(1).offset, 8);
        assert_eq!(layout.size(), 16);
    }

    #[test]
    fn proto2_scalars_get_hasbits_and_defaults() {
        let def = freeze_one(|pool, m| {
            pool.add_field(
                m,
                FieldBuilder::new("a", 1, FieldType::Int32, Label::Optional)
                    .default_value(crate::defs::DefaultValue::Int32(42)),
            )
            .unwrap();
            pool.add_field(m, FieldBuilder::new("ok", 2, FieldType::Bool, Label::Optional))
                .unwrap();
        });
        let layout = MessageLayout::new(&def);
        assert_eq!(layout.hasbit_count(), 2);
        assert!(layout.is_proto2());
        let a = layout.field(def.field_by_name("a").unwrap().index());
        assert_eq!(a.hasbit, Some(0));
        // Hasbit byte occupies offset 0; int32 aligns to 4.
        assert_eq!(a.offset, 4);
        assert_eq!(
            LittleEndian::read_i32(&layout.default_msg[a.offset as usize..]),
            42
        );
    }

    #[test]
    fn oneof_shares_one_data_slot() {
        let def = freeze_one(|pool, m| {
            pool.msg_set_syntax(m, Syntax::Proto3);
            pool.add_oneof(
                m,
                "u",
                vec![
                    FieldBuilder::new("a", 1, FieldType::Int32, Label::Optional),
                    FieldBuilder::new("b", 2, FieldType::Double, Label::Optional),
                ],
            )
            .unwrap();
        });
        let layout = MessageLayout::new(&def);
        assert_eq!(layout.oneofs.len(), 1);
        let o = layout.oneofs[0];
        let a = layout.field(def.field_by_name("a").unwrap().index());
        let b = layout.field(def.field_by_name("b").unwrap().index());
        assert_eq!(a.offset, o.data_offset);
        assert_eq!(b.offset, o.data_offset);
        // Data slot sized for the double member.
        assert_eq!(o.data_offset % 8, 0);
        assert_eq!(layout.size() % 8, 0);
    }

    #[test]
    fn repeated_and_string_fields_use_handles() {
        let def = freeze_one(|pool, m| {
            pool.msg_set_syntax(m, Syntax::Proto3);
            pool.add_field(m, FieldBuilder::new("s", 1, FieldType::String, Label::Optional))
                .unwrap();
            pool.add_field(m, FieldBuilder::new("r", 2, FieldType::Int64, Label::Repeated))
                .unwrap();
        });
        let layout = MessageLayout::new(&def);
        assert_eq!(layout.field(0).offset, 0);
        assert_eq!(layout.field(1).offset, 4);
        assert_eq!(layout.size(), 8);
    }

    #[test]
    fn cache_returns_same_layout() {
        let def = freeze_one(|pool, m| {
            pool.add_field(m, FieldBuilder::new("a", 1, FieldType::Int32, Label::Optional))
                .unwrap();
        });
        let cache = LayoutCache::new();
        let l1 = cache.get(&def);
        let l2 = cache.get(&def);
        assert!(Arc::ptr_eq(&l1, &l2));
    }
}

//! Bridges between sink events and in-memory [`Message`] storage.
//!
//! [`MessageSink`] is the write side: it implements [`Sink`] and
//! materializes whatever the decoder delivers into arena-backed message
//! instances, folding map entry submessages into their map at entry end.
//! [`walk_message`] is the read side: it replays a message's contents as
//! sink events in ascending field-number order, which drives the encoder
//! and the text and JSON printers.

use std::sync::Arc;

use crate::arena::Arena;
use crate::bytecode::Program;
use crate::decoder::decode_full;
use crate::defs::{FieldDef, MessageDef};
use crate::handlers::{selector, HandlerCache, HandlerType, Handlers, Selector};
use crate::layout::LayoutCache;
use crate::message::{MapKey, MapRef, MapValue, Message};
use crate::sink::Sink;
use crate::wire::FieldType;
use crate::{Error, Result};

#[derive(Clone, Copy)]
enum SeqState<'a> {
    Array(crate::message::ArrayRef<'a>),
    Map(MapRef<'a>),
}

struct Scope<'a> {
    msg: Message<'a>,
    handlers: Arc<Handlers>,
    seq: Option<SeqState<'a>>,
    /// Set when `msg` is a detached map entry to fold in at entry end.
    fold_into: Option<MapRef<'a>>,
}

/// A [`Sink`] that fills an arena-allocated message tree.
pub struct MessageSink<'a> {
    arena: &'a Arena,
    root: Message<'a>,
    layouts: LayoutCache,
    handler_cache: HandlerCache,
    scopes: Vec<Scope<'a>>,
    str_buf: Vec<u8>,
}

impl<'a> MessageSink<'a> {
    pub fn new(arena: &'a Arena, def: &MessageDef) -> MessageSink<'a> {
        let layouts = LayoutCache::new();
        let handler_cache = HandlerCache::new();
        let root = Message::new(arena, &layouts.get(def));
        let handlers = handler_cache.get(def);
        MessageSink {
            arena,
            root,
            layouts,
            handler_cache,
            scopes: vec![Scope {
                msg: root,
                handlers,
                seq: None,
                fold_into: None,
            }],
            str_buf: Vec::new(),
        }
    }

    /// The message being filled. Valid to read once decoding succeeds.
    pub fn root(&self) -> Message<'a> {
        self.root
    }

    fn scope(&self) -> Result<&Scope<'a>> {
        self.scopes
            .last()
            .ok_or_else(|| Error::failed("event outside any message scope".into()))
    }

    fn field(&self, sel: Selector) -> Result<FieldDef> {
        let scope = self.scope()?;
        scope
            .handlers
            .field(sel)
            .ok_or_else(|| Error::failed("selector does not name a field here".into()))
    }

    fn array_target(&self) -> Option<crate::message::ArrayRef<'a>> {
        match self.scopes.last()?.seq {
            Some(SeqState::Array(arr)) => Some(arr),
            _ => None,
        }
    }
}

impl<'a> Sink for MessageSink<'a> {
    fn put_int32(&mut self, sel: Selector, v: i32) -> Result<()> {
        let f = self.field(sel)?;
        match self.array_target() {
            Some(arr) => arr.push_int32(v),
            None => self.scope()?.msg.set_int32(&f, v),
        }
        Ok(())
    }

    fn put_int64(&mut self, sel: Selector, v: i64) -> Result<()> {
        let f = self.field(sel)?;
        match self.array_target() {
            Some(arr) => arr.push_int64(v),
            None => self.scope()?.msg.set_int64(&f, v),
        }
        Ok(())
    }

    fn put_uint32(&mut self, sel: Selector, v: u32) -> Result<()> {
        let f = self.field(sel)?;
        match self.array_target() {
            Some(arr) => arr.push_uint32(v),
            None => self.scope()?.msg.set_uint32(&f, v),
        }
        Ok(())
    }

    fn put_uint64(&mut self, sel: Selector, v: u64) -> Result<()> {
        let f = self.field(sel)?;
        match self.array_target() {
            Some(arr) => arr.push_uint64(v),
            None => self.scope()?.msg.set_uint64(&f, v),
        }
        Ok(())
    }

    fn put_float(&mut self, sel: Selector, v: f32) -> Result<()> {
        let f = self.field(sel)?;
        match self.array_target() {
            Some(arr) => arr.push_float(v),
            None => self.scope()?.msg.set_float(&f, v),
        }
        Ok(())
    }

    fn put_double(&mut self, sel: Selector, v: f64) -> Result<()> {
        let f = self.field(sel)?;
        match self.array_target() {
            Some(arr) => arr.push_double(v),
            None => self.scope()?.msg.set_double(&f, v),
        }
        Ok(())
    }

    fn put_bool(&mut self, sel: Selector, v: bool) -> Result<()> {
        let f = self.field(sel)?;
        match self.array_target() {
            Some(arr) => arr.push_bool(v),
            None => self.scope()?.msg.set_bool(&f, v),
        }
        Ok(())
    }

    fn start_str(&mut self, sel: Selector, _size_hint: u64) -> Result<()> {
        self.field(sel)?;
        self.str_buf.clear();
        Ok(())
    }

    fn put_string(&mut self, _sel: Selector, bytes: &[u8]) -> Result<usize> {
        self.str_buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn end_str(&mut self, sel: Selector) -> Result<()> {
        let f = self.field(sel)?;
        let buf = std::mem::take(&mut self.str_buf);
        match self.array_target() {
            Some(arr) => arr.push_bytes(buf),
            None => self.scope()?.msg.set_bytes(&f, &buf),
        }
        Ok(())
    }

    fn start_seq(&mut self, sel: Selector) -> Result<()> {
        let f = self.field(sel)?;
        let msg = self.scope()?.msg;
        let state = if f.is_map() {
            SeqState::Map(msg.get_or_create_map(&f))
        } else {
            SeqState::Array(msg.get_or_create_array(&f))
        };
        if let Some(scope) = self.scopes.last_mut() {
            scope.seq = Some(state);
        }
        Ok(())
    }

    fn end_seq(&mut self, _sel: Selector) -> Result<()> {
        match self.scopes.last_mut() {
            Some(scope) if scope.seq.is_some() => {
                scope.seq = None;
                Ok(())
            }
            _ => Err(Error::failed("sequence ended without matching start".into())),
        }
    }

    fn start_submsg(&mut self, sel: Selector) -> Result<()> {
        let f = self.field(sel)?;
        let sub = f
            .message_subdef()
            .ok_or_else(|| Error::failed("submessage event on a non-message field".into()))?;
        let layout = self.layouts.get(&sub);
        let handlers = self.handler_cache.get(&sub);
        let scope = self.scope()?;
        let (msg, fold_into) = match scope.seq {
            // Map entries stay detached; they become a map slot at end.
            Some(SeqState::Map(map)) => (Message::new(self.arena, &layout), Some(map)),
            Some(SeqState::Array(arr)) => (arr.push_message(&layout), None),
            None => (scope.msg.get_or_create_message(&f, &layout), None),
        };
        self.scopes.push(Scope {
            msg,
            handlers,
            seq: None,
            fold_into,
        });
        Ok(())
    }

    fn end_submsg(&mut self, _sel: Selector) -> Result<()> {
        if self.scopes.len() < 2 {
            return Err(Error::failed("submessage ended without matching start".into()));
        }
        let scope = match self.scopes.pop() {
            Some(s) => s,
            None => return Err(Error::failed("submessage ended without matching start".into())),
        };
        if let Some(map) = scope.fold_into {
            fold_map_entry(&scope.msg, &map, &self.layouts)?;
        }
        Ok(())
    }

    fn unknown(&mut self, bytes: &[u8]) -> Result<()> {
        self.scope()?.msg.append_unknown(bytes);
        Ok(())
    }
}

/// Moves a decoded map entry into its map: last entry with a given key
/// wins. Missing key or value fields take their default values.
fn fold_map_entry(entry: &Message, map: &MapRef, layouts: &LayoutCache) -> Result<()> {
    let def = entry.def();
    let kf = def
        .field_by_number(1)
        .ok_or_else(|| Error::failed("map entry has no key field".into()))?;
    let vf = def
        .field_by_number(2)
        .ok_or_else(|| Error::failed("map entry has no value field".into()))?;
    let key = map_key_of(entry, &kf);
    match vf.field_type() {
        FieldType::Message | FieldType::Group => {
            match entry.get_message(&vf) {
                Some(m) => map.insert_raw(key.canonical(), MapValue::Msg(m.handle)),
                None => {
                    // Entry with no value field: the value is an empty
                    // message of the declared type.
                    let sub = vf
                        .message_subdef()
                        .ok_or_else(|| Error::failed("map value field lacks a message type".into()))?;
                    let fresh = Message::new(entry.arena(), &layouts.get(&sub));
                    map.insert_raw(key.canonical(), MapValue::Msg(fresh.handle));
                }
            }
        }
        FieldType::String | FieldType::Bytes => {
            map.insert_bytes(&key, &entry.get_bytes(&vf).unwrap_or_default())
        }
        _ => map.insert_scalar(&key, scalar_bits(entry, &vf)),
    }
    Ok(())
}

fn map_key_of(entry: &Message, kf: &FieldDef) -> MapKey {
    match kf.field_type() {
        FieldType::Bool => MapKey::Bool(entry.get_bool(kf)),
        FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 => {
            MapKey::Int32(entry.get_int32(kf))
        }
        FieldType::UInt32 | FieldType::Fixed32 => MapKey::UInt32(entry.get_uint32(kf)),
        FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64 => {
            MapKey::Int64(entry.get_int64(kf))
        }
        FieldType::UInt64 | FieldType::Fixed64 => MapKey::UInt64(entry.get_uint64(kf)),
        _ => MapKey::String(entry.get_bytes(kf).unwrap_or_default()),
    }
}

/// The raw 64-bit storage form of a scalar field's current value.
fn scalar_bits(msg: &Message, f: &FieldDef) -> u64 {
    match f.field_type() {
        FieldType::Bool => u64::from(msg.get_bool(f)),
        FieldType::Float => u64::from(msg.get_float(f).to_bits()),
        FieldType::Double => msg.get_double(f).to_bits(),
        FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 | FieldType::Enum => {
            u64::from(msg.get_int32(f) as u32)
        }
        FieldType::UInt32 | FieldType::Fixed32 => u64::from(msg.get_uint32(f)),
        FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64 => msg.get_int64(f) as u64,
        _ => msg.get_uint64(f),
    }
}

/// Replays a message as sink events, fields in ascending number order,
/// unknown bytes last. Fields with no effective presence (unset proto2
/// fields, zero proto3 scalars, empty repeateds, inactive oneof members)
/// produce no events.
pub fn walk_message(msg: &Message, sink: &mut dyn Sink) -> Result<()> {
    sink.start_msg()?;
    let def = msg.def();
    for f in def.fields_by_number() {
        if f.is_map() {
            walk_map(msg, &f, sink)?;
        } else if f.is_repeated() {
            walk_repeated(msg, &f, sink)?;
        } else if msg.has(&f) {
            walk_singular(msg, &f, sink)?;
        }
    }
    let unknown = msg.unknown();
    if !unknown.is_empty() {
        sink.unknown(&unknown)?;
    }
    sink.end_msg()
}

fn req_selector(f: &FieldDef, ty: HandlerType) -> Result<Selector> {
    selector(f, ty).ok_or_else(|| Error::failed("field does not support this event".into()))
}

fn walk_singular(msg: &Message, f: &FieldDef, sink: &mut dyn Sink) -> Result<()> {
    if f.is_submessage() {
        if let Some(sub) = msg.get_message(f) {
            sink.start_submsg(req_selector(f, HandlerType::StartSubMsg)?)?;
            walk_message(&sub, sink)?;
            sink.end_submsg(req_selector(f, HandlerType::EndSubMsg)?)?;
        }
    } else if f.is_string() {
        let bytes = msg.get_bytes(f).unwrap_or_default();
        put_str_events(f, &bytes, sink)?;
    } else {
        put_scalar_event(sink, Selector(f.selector_base()), f.field_type(), scalar_bits(msg, f))?;
    }
    Ok(())
}

fn put_str_events(f: &FieldDef, bytes: &[u8], sink: &mut dyn Sink) -> Result<()> {
    sink.start_str(req_selector(f, HandlerType::StartStr)?, bytes.len() as u64)?;
    if !bytes.is_empty() {
        let sel = req_selector(f, HandlerType::String)?;
        let consumed = sink.put_string(sel, bytes)?;
        if consumed < bytes.len() {
            return Err(Error::from_kind(crate::ErrorKind::ShortStringHandler));
        }
    }
    sink.end_str(req_selector(f, HandlerType::EndStr)?)
}

/// Emits one scalar value from its raw 64-bit storage form.
fn put_scalar_event(
    sink: &mut dyn Sink,
    sel: Selector,
    ty: FieldType,
    bits: u64,
) -> Result<()> {
    match ty {
        FieldType::Bool => sink.put_bool(sel, bits != 0),
        FieldType::Float => sink.put_float(sel, f32::from_bits(bits as u32)),
        FieldType::Double => sink.put_double(sel, f64::from_bits(bits)),
        FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 | FieldType::Enum => {
            sink.put_int32(sel, bits as u32 as i32)
        }
        FieldType::UInt32 | FieldType::Fixed32 => sink.put_uint32(sel, bits as u32),
        FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64 => {
            sink.put_int64(sel, bits as i64)
        }
        _ => sink.put_uint64(sel, bits),
    }
}

fn walk_repeated(msg: &Message, f: &FieldDef, sink: &mut dyn Sink) -> Result<()> {
    let arr = match msg.get_array(f) {
        Some(arr) if !arr.is_empty() => arr,
        _ => return Ok(()),
    };
    sink.start_seq(req_selector(f, HandlerType::StartSeq)?)?;
    for i in 0..arr.len() {
        if f.is_submessage() {
            let sub = arr.get_message(i);
            sink.start_submsg(req_selector(f, HandlerType::StartSubMsg)?)?;
            walk_message(&sub, sink)?;
            sink.end_submsg(req_selector(f, HandlerType::EndSubMsg)?)?;
        } else if f.is_string() {
            put_str_events(f, &arr.get_bytes(i), sink)?;
        } else {
            let bits = array_bits(&arr, f.field_type(), i);
            put_scalar_event(sink, Selector(f.selector_base()), f.field_type(), bits)?;
        }
    }
    sink.end_seq(req_selector(f, HandlerType::EndSeq)?)
}

fn array_bits(arr: &crate::message::ArrayRef, ty: FieldType, i: usize) -> u64 {
    match ty {
        FieldType::Bool => u64::from(arr.get_bool(i)),
        FieldType::Float => u64::from(arr.get_float(i).to_bits()),
        FieldType::Double => arr.get_double(i).to_bits(),
        FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 | FieldType::Enum => {
            u64::from(arr.get_int32(i) as u32)
        }
        FieldType::UInt32 | FieldType::Fixed32 => u64::from(arr.get_uint32(i)),
        FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64 => arr.get_int64(i) as u64,
        _ => arr.get_uint64(i),
    }
}

/// Emits one map field as a run of entry submessages, ordered by the
/// canonical form of the key.
fn walk_map(msg: &Message, f: &FieldDef, sink: &mut dyn Sink) -> Result<()> {
    let map = match msg.get_map(f) {
        Some(m) if !m.is_empty() => m,
        _ => return Ok(()),
    };
    let entry_def = f
        .message_subdef()
        .ok_or_else(|| Error::failed("map field lacks an entry type".into()))?;
    let kf = entry_def
        .field_by_number(1)
        .ok_or_else(|| Error::failed("map entry has no key field".into()))?;
    let vf = entry_def
        .field_by_number(2)
        .ok_or_else(|| Error::failed("map entry has no value field".into()))?;
    let startsub = req_selector(f, HandlerType::StartSubMsg)?;
    let endsub = req_selector(f, HandlerType::EndSubMsg)?;
    sink.start_seq(req_selector(f, HandlerType::StartSeq)?)?;
    for key in map.keys() {
        sink.start_submsg(startsub)?;
        sink.start_msg()?;
        put_map_key(sink, &kf, &key)?;
        match vf.field_type() {
            FieldType::Message | FieldType::Group => {
                if let Some(sub) = map.get_message(&key) {
                    sink.start_submsg(req_selector(&vf, HandlerType::StartSubMsg)?)?;
                    walk_message(&sub, sink)?;
                    sink.end_submsg(req_selector(&vf, HandlerType::EndSubMsg)?)?;
                }
            }
            FieldType::String | FieldType::Bytes => {
                let bytes = map.get_bytes(&key).unwrap_or_default();
                put_str_events(&vf, &bytes, sink)?;
            }
            ty => {
                let bits = map.get_scalar(&key).unwrap_or(0);
                put_scalar_event(sink, Selector(vf.selector_base()), ty, bits)?;
            }
        }
        sink.end_msg()?;
        sink.end_submsg(endsub)?;
    }
    sink.end_seq(req_selector(f, HandlerType::EndSeq)?)
}

fn put_map_key(sink: &mut dyn Sink, kf: &FieldDef, key: &MapKey) -> Result<()> {
    let sel = Selector(kf.selector_base());
    match key {
        MapKey::Bool(b) => sink.put_bool(sel, *b),
        MapKey::Int32(v) => sink.put_int32(sel, *v),
        MapKey::Int64(v) => sink.put_int64(sel, *v),
        MapKey::UInt32(v) => sink.put_uint32(sel, *v),
        MapKey::UInt64(v) => sink.put_uint64(sel, *v),
        MapKey::String(s) => put_str_events(kf, s, sink),
    }
}

/// Decodes one complete buffer into a fresh arena-backed message.
pub fn decode_message<'a>(
    arena: &'a Arena,
    def: &MessageDef,
    bytes: &[u8],
) -> Result<Message<'a>> {
    let program = Program::compile(def);
    let mut sink = MessageSink::new(arena, def);
    decode_full(&program, bytes, &mut sink)?;
    Ok(sink.root())
}

/// Encodes a message to wire bytes by replaying it into an [`Encoder`].
///
/// [`Encoder`]: crate::encoder::Encoder
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    let mut enc = crate::encoder::Encoder::new(Handlers::new(&msg.def()));
    walk_message(msg, &mut enc)?;
    enc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{DefPool, FieldBuilder, FrozenSet, Label, Syntax};

    fn scalar_pool() -> FrozenSet {
        let mut pool = DefPool::new();
        let m = pool.add_msg("t.Test").unwrap();
        pool.msg_set_syntax(m, Syntax::Proto3);
        pool.add_field(m, FieldBuilder::new("a", 1, FieldType::Int32, Label::Optional))
            .unwrap();
        pool.add_field(m, FieldBuilder::new("s", 2, FieldType::String, Label::Optional))
            .unwrap();
        pool.freeze(64).unwrap()
    }

    #[test]
    fn decode_fills_scalar_and_string() {
        let frozen = scalar_pool();
        let def = &frozen.msgs[0];
        let arena = Arena::new();
        let msg = decode_message(&arena, def, &[0x08, 0x96, 0x01, 0x12, 0x02, b'h', b'i'])
            .unwrap();
        let a = def.field_by_name("a").unwrap();
        let s = def.field_by_name("s").unwrap();
        assert_eq!(msg.get_int32(&a), 150);
        assert_eq!(msg.get_bytes(&s).unwrap(), b"hi");
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let frozen = scalar_pool();
        let def = &frozen.msgs[0];
        let arena = Arena::new();
        let bytes = [0x08, 0x96, 0x01, 0x12, 0x02, b'h', b'i'];
        let msg = decode_message(&arena, def, &bytes).unwrap();
        assert_eq!(encode_message(&msg).unwrap(), bytes);
    }

    #[test]
    fn proto3_zero_scalars_are_not_encoded() {
        let frozen = scalar_pool();
        let def = &frozen.msgs[0];
        let arena = Arena::new();
        let layouts = LayoutCache::new();
        let msg = Message::new(&arena, &layouts.get(def));
        let a = def.field_by_name("a").unwrap();
        msg.set_int32(&a, 0);
        assert_eq!(encode_message(&msg).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn proto2_explicit_zero_is_encoded() {
        let mut pool = DefPool::new();
        let m = pool.add_msg("t.Two").unwrap();
        pool.add_field(m, FieldBuilder::new("a", 1, FieldType::Int32, Label::Optional))
            .unwrap();
        let frozen = pool.freeze(64).unwrap();
        let def = &frozen.msgs[0];
        let arena = Arena::new();
        let layouts = LayoutCache::new();
        let msg = Message::new(&arena, &layouts.get(def));
        let a = def.field_by_name("a").unwrap();
        msg.set_int32(&a, 0);
        assert_eq!(encode_message(&msg).unwrap(), vec![0x08, 0x00]);
    }

    #[test]
    fn oneof_later_field_displaces_earlier() {
        let mut pool = DefPool::new();
        let m = pool.add_msg("t.O").unwrap();
        pool.msg_set_syntax(m, Syntax::Proto3);
        pool.add_oneof(
            m,
            "choice",
            vec![
                FieldBuilder::new("num", 1, FieldType::Int32, Label::Optional),
                FieldBuilder::new("text", 2, FieldType::String, Label::Optional),
            ],
        )
        .unwrap();
        let frozen = pool.freeze(64).unwrap();
        let def = &frozen.msgs[0];
        let arena = Arena::new();
        // num = 7, then text = "hi": the string wins.
        let msg =
            decode_message(&arena, def, &[0x08, 0x07, 0x12, 0x02, b'h', b'i']).unwrap();
        let num = def.field_by_name("num").unwrap();
        let text = def.field_by_name("text").unwrap();
        assert!(!msg.has(&num));
        assert_eq!(msg.get_bytes(&text).unwrap(), b"hi");
        // Re-encoding emits only the active member.
        assert_eq!(
            encode_message(&msg).unwrap(),
            vec![0x12, 0x02, b'h', b'i']
        );
    }

    #[test]
    fn unknown_fields_are_retained_and_re_emitted() {
        let frozen = scalar_pool();
        let def = &frozen.msgs[0];
        let arena = Arena::new();
        // Known field 1 plus unknown varint field 4.
        let msg = decode_message(&arena, def, &[0x08, 0x05, 0x20, 0x63]).unwrap();
        assert_eq!(msg.unknown(), vec![0x20, 0x63]);
        assert_eq!(encode_message(&msg).unwrap(), vec![0x08, 0x05, 0x20, 0x63]);
    }

    #[test]
    fn repeated_submessages_accumulate() {
        let mut pool = DefPool::new();
        let inner = pool.add_msg("t.Inner").unwrap();
        pool.msg_set_syntax(inner, Syntax::Proto3);
        pool.add_field(
            inner,
            FieldBuilder::new("v", 1, FieldType::Int32, Label::Optional),
        )
        .unwrap();
        let outer = pool.add_msg("t.Outer").unwrap();
        pool.msg_set_syntax(outer, Syntax::Proto3);
        pool.add_field(
            outer,
            FieldBuilder::new("items", 1, FieldType::Message, Label::Repeated)
                .subdef_msg(inner),
        )
        .unwrap();
        let frozen = pool.freeze(64).unwrap();
        let def = &frozen.msgs[1];
        let arena = Arena::new();
        let bytes = [0x0a, 0x02, 0x08, 0x01, 0x0a, 0x02, 0x08, 0x02];
        let msg = decode_message(&arena, def, &bytes).unwrap();
        let items = def.field_by_name("items").unwrap();
        let arr = msg.get_array(&items).unwrap();
        assert_eq!(arr.len(), 2);
        let v = frozen.msgs[0].field_by_name("v").unwrap();
        assert_eq!(arr.get_message(0).get_int32(&v), 1);
        assert_eq!(arr.get_message(1).get_int32(&v), 2);
        assert_eq!(encode_message(&msg).unwrap(), bytes);
    }

    #[test]
    fn map_entries_fold_with_last_key_winning() {
        let mut pool = DefPool::new();
        let m = pool.add_msg("t.HasMap").unwrap();
        pool.msg_set_syntax(m, Syntax::Proto3);
        pool.add_map_field(
            m,
            "counts",
            1,
            FieldType::String,
            FieldBuilder::new("value", 2, FieldType::Int32, Label::Optional),
        )
        .unwrap();
        let frozen = pool.freeze(64).unwrap();
        let def = frozen
            .msgs
            .iter()
            .find(|d| d.full_name() == "t.HasMap")
            .unwrap();
        let arena = Arena::new();
        // {"a": 1}, {"a": 2}: the second entry wins.
        let bytes = [
            0x0a, 0x05, 0x0a, 0x01, b'a', 0x10, 0x01, // entry a=1
            0x0a, 0x05, 0x0a, 0x01, b'a', 0x10, 0x02, // entry a=2
        ];
        let msg = decode_message(&arena, def, &bytes).unwrap();
        let counts = def.field_by_name("counts").unwrap();
        let map = msg.get_map(&counts).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(
            map.get_scalar(&MapKey::String(b"a".to_vec())),
            Some(2)
        );
        // Re-encoding emits one canonical entry.
        assert_eq!(
            encode_message(&msg).unwrap(),
            vec![0x0a, 0x05, 0x0a, 0x01, b'a', 0x10, 0x02]
        );
    }

    #[test]
    fn walk_and_refill_produces_equal_message() {
        let frozen = scalar_pool();
        let def = &frozen.msgs[0];
        let arena = Arena::new();
        let original =
            decode_message(&arena, def, &[0x08, 0x2a, 0x12, 0x03, b'a', b'b', b'c']).unwrap();
        let mut copy_sink = MessageSink::new(&arena, def);
        walk_message(&original, &mut copy_sink).unwrap();
        assert!(original.deep_eq(&copy_sink.root()));
    }
}

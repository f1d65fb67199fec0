//! Wire-format encoder, driven through the [`Sink`] event interface.
//!
//! Length prefixes for submessages and strings are not known until the
//! region ends, so the encoder buffers payload bytes in one contiguous
//! buffer and records an item list of byte runs interleaved with prefix
//! slots. Ending a delimited region fills in its slot and folds the
//! region's size (plus the prefix's own encoded width) into the parent,
//! and [`Encoder::finish`] assembles the final byte string in one pass
//! over the items. Nothing is re-encoded.
//!
//! The encoder writes exactly the events it is given. Presence policy
//! (skipping unset proto2 fields, zero-valued proto3 fields, inactive
//! oneof members) belongs to whatever drives it, such as
//! [`crate::fill::walk_message`].

use std::sync::Arc;

use crate::handlers::{HandlerCache, Handlers, Selector};
use crate::sink::Sink;
use crate::wire::{
    make_tag, put_fixed32, put_fixed64, put_varint, varint_size, zigzag_encode_32,
    zigzag_encode_64, FieldType, WireType,
};
use crate::{defs::FieldDef, Error, Result};

enum Item {
    /// A run of already-final bytes in the payload buffer.
    Bytes { start: usize, len: usize },
    /// A varint length prefix whose value is filled in at region end.
    Prefix(usize),
}

struct Frame {
    /// Encoded size of the region so far, nested prefixes included.
    msglen: u64,
    /// Slot to fill when the region closes; the root has none.
    prefix: Option<usize>,
}

/// Encodes one message from sink events. Create with the handlers for
/// the root message type, drive it, then call [`Encoder::finish`].
pub struct Encoder {
    handlers: Vec<Arc<Handlers>>,
    cache: HandlerCache,
    buf: Vec<u8>,
    items: Vec<Item>,
    prefixes: Vec<u64>,
    stack: Vec<Frame>,
    /// Whether each currently open sequence writes per-element tags.
    seqs: Vec<bool>,
}

impl Encoder {
    pub fn new(handlers: Arc<Handlers>) -> Encoder {
        Encoder {
            handlers: vec![handlers],
            cache: HandlerCache::new(),
            buf: Vec::new(),
            items: Vec::new(),
            prefixes: Vec::new(),
            stack: vec![Frame {
                msglen: 0,
                prefix: None,
            }],
            seqs: Vec::new(),
        }
    }

    /// Assembles and returns the encoded bytes.
    pub fn finish(self) -> Result<Vec<u8>> {
        if self.stack.len() != 1 || self.handlers.len() != 1 || !self.seqs.is_empty() {
            return Err(Error::failed("message events ended mid-region".into()));
        }
        let mut out = Vec::with_capacity(self.stack[0].msglen as usize);
        for item in &self.items {
            match *item {
                Item::Bytes { start, len } => out.extend_from_slice(&self.buf[start..start + len]),
                Item::Prefix(idx) => put_varint(self.prefixes[idx], &mut out),
            }
        }
        Ok(out)
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let start = self.buf.len();
        self.buf.extend_from_slice(bytes);
        if let Some(Item::Bytes { start: s, len }) = self.items.last_mut() {
            if *s + *len == start {
                *len += bytes.len();
                self.bump(bytes.len() as u64);
                return;
            }
        }
        self.items.push(Item::Bytes {
            start,
            len: bytes.len(),
        });
        self.bump(bytes.len() as u64);
    }

    fn bump(&mut self, n: u64) {
        if let Some(frame) = self.stack.last_mut() {
            frame.msglen += n;
        }
    }

    fn start_delim(&mut self) {
        let idx = self.prefixes.len();
        self.prefixes.push(0);
        self.items.push(Item::Prefix(idx));
        self.stack.push(Frame {
            msglen: 0,
            prefix: Some(idx),
        });
    }

    fn end_delim(&mut self) -> Result<()> {
        let frame = match self.stack.pop() {
            Some(f) if f.prefix.is_some() => f,
            _ => return Err(Error::failed("delimited region ended without matching start".into())),
        };
        let idx = frame.prefix.unwrap_or(0);
        self.prefixes[idx] = frame.msglen;
        self.bump(frame.msglen + varint_size(frame.msglen) as u64);
        Ok(())
    }

    fn field(&self, sel: Selector) -> Result<FieldDef> {
        self.handlers
            .last()
            .and_then(|h| h.field(sel))
            .ok_or_else(|| Error::failed("selector does not name a field here".into()))
    }

    fn put_tag(&mut self, f: &FieldDef, wt: WireType) {
        let mut tmp = Vec::with_capacity(5);
        put_varint(u64::from(make_tag(f.number(), wt)), &mut tmp);
        self.put_bytes(&tmp);
    }

    fn in_packed_run(&self) -> bool {
        self.seqs.last().copied() == Some(false)
    }

    /// Writes one scalar in the field's declared wire representation,
    /// with a tag unless inside a packed run.
    fn put_scalar(&mut self, sel: Selector, raw: u64) -> Result<()> {
        let f = self.field(sel)?;
        let wt = f.field_type().native_wire_type();
        if !self.in_packed_run() {
            self.put_tag(&f, wt);
        }
        let mut tmp = Vec::with_capacity(10);
        match f.field_type() {
            FieldType::Fixed32 | FieldType::SFixed32 | FieldType::Float => {
                put_fixed32(raw as u32, &mut tmp)
            }
            FieldType::Fixed64 | FieldType::SFixed64 | FieldType::Double => {
                put_fixed64(raw, &mut tmp)
            }
            _ => put_varint(raw, &mut tmp),
        }
        self.put_bytes(&tmp);
        Ok(())
    }
}

impl Sink for Encoder {
    fn put_int32(&mut self, sel: Selector, v: i32) -> Result<()> {
        let f = self.field(sel)?;
        let raw = match f.field_type() {
            FieldType::SInt32 => u64::from(zigzag_encode_32(v)),
            // Negative int32 and enum values sign-extend to ten bytes.
            _ => v as i64 as u64,
        };
        self.put_scalar(sel, raw)
    }

    fn put_int64(&mut self, sel: Selector, v: i64) -> Result<()> {
        let f = self.field(sel)?;
        let raw = match f.field_type() {
            FieldType::SInt64 => zigzag_encode_64(v),
            _ => v as u64,
        };
        self.put_scalar(sel, raw)
    }

    fn put_uint32(&mut self, sel: Selector, v: u32) -> Result<()> {
        self.put_scalar(sel, u64::from(v))
    }

    fn put_uint64(&mut self, sel: Selector, v: u64) -> Result<()> {
        self.put_scalar(sel, v)
    }

    fn put_float(&mut self, sel: Selector, v: f32) -> Result<()> {
        self.put_scalar(sel, u64::from(v.to_bits()))
    }

    fn put_double(&mut self, sel: Selector, v: f64) -> Result<()> {
        self.put_scalar(sel, v.to_bits())
    }

    fn put_bool(&mut self, sel: Selector, v: bool) -> Result<()> {
        self.put_scalar(sel, u64::from(v))
    }

    fn start_str(&mut self, sel: Selector, _size_hint: u64) -> Result<()> {
        let f = self.field(sel)?;
        self.put_tag(&f, WireType::Delimited);
        self.start_delim();
        Ok(())
    }

    fn put_string(&mut self, _sel: Selector, bytes: &[u8]) -> Result<usize> {
        self.put_bytes(bytes);
        Ok(bytes.len())
    }

    fn end_str(&mut self, _sel: Selector) -> Result<()> {
        self.end_delim()
    }

    fn start_seq(&mut self, sel: Selector) -> Result<()> {
        let f = self.field(sel)?;
        let tagged = !f.is_packed();
        if !tagged {
            self.put_tag(&f, WireType::Delimited);
            self.start_delim();
        }
        self.seqs.push(tagged);
        Ok(())
    }

    fn end_seq(&mut self, _sel: Selector) -> Result<()> {
        match self.seqs.pop() {
            Some(true) => Ok(()),
            Some(false) => self.end_delim(),
            None => Err(Error::failed("sequence ended without matching start".into())),
        }
    }

    fn start_submsg(&mut self, sel: Selector) -> Result<()> {
        let f = self.field(sel)?;
        let sub = f
            .message_subdef()
            .ok_or_else(|| Error::failed("submessage event on a non-message field".into()))?;
        if f.field_type() == FieldType::Group {
            self.put_tag(&f, WireType::StartGroup);
        } else {
            self.put_tag(&f, WireType::Delimited);
            self.start_delim();
        }
        self.handlers.push(self.cache.get(&sub));
        Ok(())
    }

    fn end_submsg(&mut self, sel: Selector) -> Result<()> {
        if self.handlers.len() < 2 {
            return Err(Error::failed("submessage ended without matching start".into()));
        }
        self.handlers.pop();
        let f = self.field(sel)?;
        if f.field_type() == FieldType::Group {
            self.put_tag(&f, WireType::EndGroup);
            Ok(())
        } else {
            self.end_delim()
        }
    }

    fn unknown(&mut self, bytes: &[u8]) -> Result<()> {
        self.put_bytes(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{DefPool, FieldBuilder, FrozenSet, Label, MessageDef, Syntax};
    use crate::handlers::{selector, HandlerType};
    use crate::wire::FieldType;

    fn handlers_for(def: &MessageDef) -> Arc<Handlers> {
        Handlers::new(def)
    }

    fn value_sel(def: &MessageDef, name: &str) -> Selector {
        let f = def.field_by_name(name).unwrap();
        Selector(f.selector_base())
    }

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
    fn encodes_varint_scalar() {
        let frozen = scalar_pool();
        let def = &frozen.msgs[0];
        let mut enc = Encoder::new(handlers_for(def));
        enc.start_msg().unwrap();
        enc.put_int32(value_sel(def, "a"), 150).unwrap();
        enc.end_msg().unwrap();
        assert_eq!(enc.finish().unwrap(), vec![0x08, 0x96, 0x01]);
    }

    #[test]
    fn negative_int32_takes_ten_bytes() {
        let frozen = scalar_pool();
        let def = &frozen.msgs[0];
        let mut enc = Encoder::new(handlers_for(def));
        enc.put_int32(value_sel(def, "a"), -1).unwrap();
        let out = enc.finish().unwrap();
        assert_eq!(out.len(), 11);
        assert_eq!(out[0], 0x08);
        assert!(out[1..].iter().take(9).all(|b| *b == 0xff));
        assert_eq!(out[10], 0x01);
    }

    #[test]
    fn encodes_string_with_length_prefix() {
        let frozen = scalar_pool();
        let def = &frozen.msgs[0];
        let f = def.field_by_name("s").unwrap();
        let start = selector(&f, HandlerType::StartStr).unwrap();
        let put = selector(&f, HandlerType::String).unwrap();
        let end = selector(&f, HandlerType::EndStr).unwrap();
        let mut enc = Encoder::new(handlers_for(def));
        enc.start_str(start, 2).unwrap();
        // Fragmented delivery still yields one prefixed region.
        enc.put_string(put, b"h").unwrap();
        enc.put_string(put, b"i").unwrap();
        enc.end_str(end).unwrap();
        assert_eq!(enc.finish().unwrap(), vec![0x12, 0x02, b'h', b'i']);
    }

    fn submsg_pool() -> FrozenSet {
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
            FieldBuilder::new("inner", 2, FieldType::Message, Label::Optional).subdef_msg(inner),
        )
        .unwrap();
        pool.freeze(64).unwrap()
    }

    #[test]
    fn encodes_submessage_with_deferred_length() {
        let frozen = submsg_pool();
        let outer = &frozen.msgs[1];
        let inner = &frozen.msgs[0];
        let f = outer.field_by_name("inner").unwrap();
        let startsub = selector(&f, HandlerType::StartSubMsg).unwrap();
        let endsub = selector(&f, HandlerType::EndSubMsg).unwrap();
        let mut enc = Encoder::new(handlers_for(outer));
        enc.start_submsg(startsub).unwrap();
        enc.put_int32(value_sel(inner, "v"), 42).unwrap();
        enc.end_submsg(endsub).unwrap();
        assert_eq!(enc.finish().unwrap(), vec![0x12, 0x02, 0x08, 0x2a]);
    }

    #[test]
    fn packed_sequence_shares_one_tag() {
        let mut pool = DefPool::new();
        let m = pool.add_msg("t.P").unwrap();
        pool.msg_set_syntax(m, Syntax::Proto3);
        pool.add_field(m, FieldBuilder::new("d", 3, FieldType::Int32, Label::Repeated))
            .unwrap();
        let frozen = pool.freeze(64).unwrap();
        let def = &frozen.msgs[0];
        let f = def.field_by_name("d").unwrap();
        assert!(f.is_packed());
        let startseq = selector(&f, HandlerType::StartSeq).unwrap();
        let endseq = selector(&f, HandlerType::EndSeq).unwrap();
        let sel = value_sel(def, "d");
        let mut enc = Encoder::new(handlers_for(def));
        enc.start_seq(startseq).unwrap();
        for v in [3, 270, 86942] {
            enc.put_int32(sel, v).unwrap();
        }
        enc.end_seq(endseq).unwrap();
        assert_eq!(
            enc.finish().unwrap(),
            vec![0x1a, 0x06, 0x03, 0x8e, 0x02, 0x9e, 0xa7, 0x05]
        );
    }

    #[test]
    fn unpacked_sequence_tags_every_element() {
        let mut pool = DefPool::new();
        let m = pool.add_msg("t.P").unwrap();
        // proto2: repeated scalars default to unpacked.
        pool.add_field(m, FieldBuilder::new("d", 3, FieldType::Int32, Label::Repeated))
            .unwrap();
        let frozen = pool.freeze(64).unwrap();
        let def = &frozen.msgs[0];
        let f = def.field_by_name("d").unwrap();
        assert!(!f.is_packed());
        let startseq = selector(&f, HandlerType::StartSeq).unwrap();
        let endseq = selector(&f, HandlerType::EndSeq).unwrap();
        let sel = value_sel(def, "d");
        let mut enc = Encoder::new(handlers_for(def));
        enc.start_seq(startseq).unwrap();
        enc.put_int32(sel, 1).unwrap();
        enc.put_int32(sel, 2).unwrap();
        enc.end_seq(endseq).unwrap();
        assert_eq!(enc.finish().unwrap(), vec![0x18, 0x01, 0x18, 0x02]);
    }

    #[test]
    fn group_uses_start_and_end_tags() {
        let mut pool = DefPool::new();
        let g = pool.add_msg("t.G").unwrap();
        pool.add_field(g, FieldBuilder::new("v", 1, FieldType::Int32, Label::Optional))
            .unwrap();
        let m = pool.add_msg("t.M").unwrap();
        pool.add_field(
            m,
            FieldBuilder::new("grp", 1, FieldType::Group, Label::Optional).subdef_msg(g),
        )
        .unwrap();
        let frozen = pool.freeze(64).unwrap();
        let outer = &frozen.msgs[1];
        let inner = &frozen.msgs[0];
        let f = outer.field_by_name("grp").unwrap();
        let startsub = selector(&f, HandlerType::StartSubMsg).unwrap();
        let endsub = selector(&f, HandlerType::EndSubMsg).unwrap();
        let mut enc = Encoder::new(handlers_for(outer));
        enc.start_submsg(startsub).unwrap();
        enc.put_int32(value_sel(inner, "v"), 1).unwrap();
        enc.end_submsg(endsub).unwrap();
        assert_eq!(enc.finish().unwrap(), vec![0x0b, 0x08, 0x01, 0x0c]);
    }

    #[test]
    fn unbalanced_events_fail_at_finish() {
        let frozen = submsg_pool();
        let outer = &frozen.msgs[1];
        let f = outer.field_by_name("inner").unwrap();
        let startsub = selector(&f, HandlerType::StartSubMsg).unwrap();
        let mut enc = Encoder::new(handlers_for(outer));
        enc.start_submsg(startsub).unwrap();
        assert!(enc.finish().is_err());
    }
}

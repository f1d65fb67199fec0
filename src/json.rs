//! JSON mapping.
//!
//! The printer is a [`Sink`] fed by
//! [`walk_message`](crate::fill::walk_message); the parser is a
//! recursive-descent reader that emits the same events into any sink.
//! Field names follow the canonical JSON mapping (camelCase), but the
//! parser also accepts the original proto names. Sixty-four-bit
//! integers print as quoted strings; `bytes` print as standard base64.

use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};

use crate::defs::{FieldDef, MessageDef};
use crate::handlers::{selector, HandlerCache, HandlerType, Handlers, Selector};
use crate::message::Message;
use crate::sink::Sink;
use crate::wire::FieldType;
use crate::{Error, Result};

/* Printer ******************************************************************/

enum Region {
    Msg { first: bool },
    Array { first: bool },
    /// A map field printed as a JSON object; entry submessages are
    /// flattened into `"key": value` members.
    Map { first: bool },
    MapEntry,
}

pub struct JsonPrinter {
    handlers: Vec<Arc<Handlers>>,
    cache: HandlerCache,
    out: String,
    regions: Vec<Region>,
    /// Pending bytes of the string field currently being delivered.
    str_buf: Vec<u8>,
    str_field: Option<FieldDef>,
    /// Set when the next `start_msg` belongs to a map entry, whose
    /// object braces are written by the enclosing map region instead.
    entry_pending: bool,
}

impl JsonPrinter {
    pub fn new(handlers: Arc<Handlers>) -> JsonPrinter {
        JsonPrinter {
            handlers: vec![handlers],
            cache: HandlerCache::new(),
            out: String::new(),
            regions: Vec::new(),
            str_buf: Vec::new(),
            str_field: None,
            entry_pending: false,
        }
    }

    pub fn finish(self) -> String {
        self.out
    }

    fn field(&self, sel: Selector) -> Result<FieldDef> {
        self.handlers
            .last()
            .and_then(|h| h.field(sel))
            .ok_or_else(|| Error::failed("selector does not name a field here".into()))
    }

    fn in_map_object(&self) -> bool {
        matches!(self.regions.last(), Some(Region::Map { .. }))
    }

    /// Writes the separator and, inside objects, the member name.
    fn begin_value(&mut self, f: &FieldDef) -> Result<()> {
        match self.regions.last_mut() {
            Some(Region::Msg { first }) => {
                if !*first {
                    self.out.push(',');
                }
                *first = false;
                push_json_string(f.json_name().as_bytes(), &mut self.out);
                self.out.push(':');
            }
            Some(Region::Array { first }) | Some(Region::Map { first }) => {
                if !*first {
                    self.out.push(',');
                }
                *first = false;
            }
            Some(Region::MapEntry) => {
                // Field 1 is the key, field 2 the value; the key was
                // already written as the member name.
                if f.number() == 2 {
                    self.out.push(':');
                }
            }
            None => {}
        }
        Ok(())
    }

    fn put_map_key(&mut self, text: &str) {
        push_json_string(text.as_bytes(), &mut self.out);
    }

    fn in_map_entry_key(&self, f: &FieldDef) -> bool {
        matches!(self.regions.last(), Some(Region::MapEntry)) && f.number() == 1
    }
}

impl Sink for JsonPrinter {
    fn start_msg(&mut self) -> Result<()> {
        // Map entries are flattened; only real messages open an object.
        if self.entry_pending {
            self.entry_pending = false;
        } else {
            self.out.push('{');
            self.regions.push(Region::Msg { first: true });
        }
        Ok(())
    }

    fn end_msg(&mut self) -> Result<()> {
        if matches!(self.regions.last(), Some(Region::Msg { .. })) {
            self.regions.pop();
            self.out.push('}');
        }
        Ok(())
    }

    fn put_int32(&mut self, sel: Selector, v: i32) -> Result<()> {
        let f = self.field(sel)?;
        if self.in_map_entry_key(&f) {
            self.begin_value(&f)?;
            self.put_map_key(&v.to_string());
            return Ok(());
        }
        if f.field_type() == FieldType::Enum {
            let rendered = match f.enum_subdef().and_then(|e| {
                e.name_by_value(v).map(str::to_owned)
            }) {
                Some(name) => {
                    let mut s = String::new();
                    push_json_string(name.as_bytes(), &mut s);
                    s
                }
                None => v.to_string(),
            };
            self.begin_value(&f)?;
            self.out.push_str(&rendered);
            return Ok(());
        }
        self.begin_value(&f)?;
        self.out.push_str(&v.to_string());
        Ok(())
    }

    fn put_int64(&mut self, sel: Selector, v: i64) -> Result<()> {
        let f = self.field(sel)?;
        self.begin_value(&f)?;
        if self.in_map_entry_key(&f) {
            self.put_map_key(&v.to_string());
        } else {
            // 64-bit values exceed IEEE double precision; quote them.
            self.out.push_str(&format!("\"{v}\""));
        }
        Ok(())
    }

    fn put_uint32(&mut self, sel: Selector, v: u32) -> Result<()> {
        let f = self.field(sel)?;
        self.begin_value(&f)?;
        if self.in_map_entry_key(&f) {
            self.put_map_key(&v.to_string());
        } else {
            self.out.push_str(&v.to_string());
        }
        Ok(())
    }

    fn put_uint64(&mut self, sel: Selector, v: u64) -> Result<()> {
        let f = self.field(sel)?;
        self.begin_value(&f)?;
        if self.in_map_entry_key(&f) {
            self.put_map_key(&v.to_string());
        } else {
            self.out.push_str(&format!("\"{v}\""));
        }
        Ok(())
    }

    fn put_float(&mut self, sel: Selector, v: f32) -> Result<()> {
        let f = self.field(sel)?;
        self.begin_value(&f)?;
        self.out.push_str(&json_float(f64::from(v)));
        Ok(())
    }

    fn put_double(&mut self, sel: Selector, v: f64) -> Result<()> {
        let f = self.field(sel)?;
        self.begin_value(&f)?;
        self.out.push_str(&json_float(v));
        Ok(())
    }

    fn put_bool(&mut self, sel: Selector, v: bool) -> Result<()> {
        let f = self.field(sel)?;
        self.begin_value(&f)?;
        if self.in_map_entry_key(&f) {
            self.put_map_key(if v { "true" } else { "false" });
        } else {
            self.out.push_str(if v { "true" } else { "false" });
        }
        Ok(())
    }

    fn start_str(&mut self, sel: Selector, _size_hint: u64) -> Result<()> {
        self.str_field = Some(self.field(sel)?);
        self.str_buf.clear();
        Ok(())
    }

    fn put_string(&mut self, _sel: Selector, bytes: &[u8]) -> Result<usize> {
        self.str_buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn end_str(&mut self, _sel: Selector) -> Result<()> {
        let f = self
            .str_field
            .take()
            .ok_or_else(|| Error::failed("string ended without matching start".into()))?;
        let buf = std::mem::take(&mut self.str_buf);
        self.begin_value(&f)?;
        if self.in_map_entry_key(&f) {
            push_json_string(&buf, &mut self.out);
        } else if f.field_type() == FieldType::Bytes {
            let mut s = String::new();
            s.push('"');
            s.push_str(&general_purpose::STANDARD.encode(&buf));
            s.push('"');
            self.out.push_str(&s);
        } else {
            push_json_string(&buf, &mut self.out);
        }
        Ok(())
    }

    fn start_seq(&mut self, sel: Selector) -> Result<()> {
        let f = self.field(sel)?;
        self.begin_value(&f)?;
        if f.is_map() {
            self.out.push('{');
            self.regions.push(Region::Map { first: true });
        } else {
            self.out.push('[');
            self.regions.push(Region::Array { first: true });
        }
        Ok(())
    }

    fn end_seq(&mut self, _sel: Selector) -> Result<()> {
        match self.regions.pop() {
            Some(Region::Array { .. }) => self.out.push(']'),
            Some(Region::Map { .. }) => self.out.push('}'),
            _ => return Err(Error::failed("sequence ended without matching start".into())),
        }
        Ok(())
    }

    fn start_submsg(&mut self, sel: Selector) -> Result<()> {
        let f = self.field(sel)?;
        let sub = f
            .message_subdef()
            .ok_or_else(|| Error::failed("submessage event on a non-message field".into()))?;
        self.begin_value(&f)?;
        if self.in_map_object() {
            self.regions.push(Region::MapEntry);
            self.entry_pending = true;
        }
        self.handlers.push(self.cache.get(&sub));
        Ok(())
    }

    fn end_submsg(&mut self, _sel: Selector) -> Result<()> {
        if self.handlers.len() < 2 {
            return Err(Error::failed("submessage ended without matching start".into()));
        }
        self.handlers.pop();
        if matches!(self.regions.last(), Some(Region::MapEntry)) {
            self.regions.pop();
        }
        Ok(())
    }

    fn unknown(&mut self, _bytes: &[u8]) -> Result<()> {
        // Unknown fields have no JSON names.
        Ok(())
    }
}

fn json_float(v: f64) -> String {
    if v.is_nan() {
        "\"NaN\"".to_owned()
    } else if v.is_infinite() {
        if v < 0.0 {
            "\"-Infinity\"".to_owned()
        } else {
            "\"Infinity\"".to_owned()
        }
    } else if v == v.trunc() && v.abs() < 1e15 {
        format!("{v:.0}")
    } else {
        format!("{v}")
    }
}

fn push_json_string(bytes: &[u8], out: &mut String) {
    out.push('"');
    for ch in String::from_utf8_lossy(bytes).chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Renders `msg` as a JSON object.
pub fn print_message(msg: &Message) -> Result<String> {
    let mut printer = JsonPrinter::new(Handlers::new(&msg.def()));
    crate::fill::walk_message(msg, &mut printer)?;
    Ok(printer.finish())
}

/* Parser *******************************************************************/

struct Reader<'s> {
    bytes: &'s [u8],
    pos: usize,
}

impl<'s> Reader<'s> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Result<u8> {
        let b = self
            .peek()
            .ok_or_else(|| syntax_err("unexpected end of JSON input".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, b: u8) -> Result<()> {
        self.skip_ws();
        let got = self.bump()?;
        if got != b {
            return Err(syntax_err(format!(
                "expected {:?} at offset {}, found {:?}",
                b as char,
                self.pos - 1,
                got as char
            )));
        }
        Ok(())
    }

    fn try_consume(&mut self, b: u8) -> bool {
        self.skip_ws();
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn consume_literal(&mut self, lit: &str) -> bool {
        if self.bytes[self.pos..].starts_with(lit.as_bytes()) {
            self.pos += lit.len();
            true
        } else {
            false
        }
    }

    /// Parses a JSON string (the opening quote already consumed is not
    /// assumed; this consumes the whole token).
    fn string(&mut self) -> Result<String> {
        self.expect(b'"')?;
        let mut out = String::new();
        loop {
            let b = self.bump()?;
            match b {
                b'"' => return Ok(out),
                b'\\' => match self.bump()? {
                    b'"' => out.push('"'),
                    b'\\' => out.push('\\'),
                    b'/' => out.push('/'),
                    b'b' => out.push('\u{0008}'),
                    b'f' => out.push('\u{000c}'),
                    b'n' => out.push('\n'),
                    b'r' => out.push('\r'),
                    b't' => out.push('\t'),
                    b'u' => {
                        let first = self.hex4()?;
                        let code = if (0xd800..0xdc00).contains(&first) {
                            // Surrogate pair.
                            if !(self.try_consume(b'\\') && self.try_consume(b'u')) {
                                return Err(syntax_err(
                                    "unpaired surrogate in JSON string".into(),
                                ));
                            }
                            let second = self.hex4()?;
                            if !(0xdc00..0xe000).contains(&second) {
                                return Err(syntax_err(
                                    "unpaired surrogate in JSON string".into(),
                                ));
                            }
                            0x10000 + ((first - 0xd800) << 10) + (second - 0xdc00)
                        } else {
                            first
                        };
                        out.push(
                            char::from_u32(code).ok_or_else(|| {
                                syntax_err("invalid unicode escape".into())
                            })?,
                        );
                    }
                    other => {
                        return Err(syntax_err(format!(
                            "bad escape \\{}",
                            other as char
                        )))
                    }
                },
                // Multi-byte UTF-8 passes through untouched.
                _ => {
                    let start = self.pos - 1;
                    let len = utf8_len(b)?;
                    self.pos = start + len;
                    if self.pos > self.bytes.len() {
                        return Err(syntax_err("unexpected end of JSON input".into()));
                    }
                    let s = std::str::from_utf8(&self.bytes[start..self.pos])
                        .map_err(|_| syntax_err("invalid UTF-8 in JSON string".into()))?;
                    out.push_str(s);
                }
            }
        }
    }

    fn hex4(&mut self) -> Result<u32> {
        let mut v = 0u32;
        for _ in 0..4 {
            let b = self.bump()?;
            let d = (b as char)
                .to_digit(16)
                .ok_or_else(|| syntax_err("bad hex digit in unicode escape".into()))?;
            v = v * 16 + d;
        }
        Ok(v)
    }

    /// The raw text of a number token.
    fn number_token(&mut self) -> Result<&'s str> {
        self.skip_ws();
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(b'0'..=b'9' | b'.' | b'e' | b'E' | b'+' | b'-')) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(syntax_err(format!("expected number at offset {start}")));
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| syntax_err("invalid number token".into()))
    }

    /// Skips one complete JSON value. The lenient parse mode uses this
    /// to step over unknown object members.
    fn skip_value(&mut self) -> Result<()> {
        self.skip_ws();
        match self.peek() {
            Some(b'"') => {
                self.string()?;
            }
            Some(b'{') => {
                self.expect(b'{')?;
                if !self.try_consume(b'}') {
                    loop {
                        self.string()?;
                        self.expect(b':')?;
                        self.skip_value()?;
                        if !self.try_consume(b',') {
                            break;
                        }
                    }
                    self.expect(b'}')?;
                }
            }
            Some(b'[') => {
                self.expect(b'[')?;
                if !self.try_consume(b']') {
                    loop {
                        self.skip_value()?;
                        if !self.try_consume(b',') {
                            break;
                        }
                    }
                    self.expect(b']')?;
                }
            }
            Some(b't') if self.consume_literal("true") => {}
            Some(b'f') if self.consume_literal("false") => {}
            Some(b'n') if self.consume_literal("null") => {}
            _ => {
                self.number_token()?;
            }
        }
        Ok(())
    }
}

fn utf8_len(first: u8) -> Result<usize> {
    match first {
        0x00..=0x7f => Ok(1),
        0xc0..=0xdf => Ok(2),
        0xe0..=0xef => Ok(3),
        0xf0..=0xf7 => Ok(4),
        _ => Err(syntax_err("invalid UTF-8 in JSON string".into())),
    }
}

struct Parser<'s> {
    rd: Reader<'s>,
    ignore_unknown: bool,
}

impl<'s> Parser<'s> {
    fn parse_object(&mut self, def: &MessageDef, sink: &mut dyn Sink) -> Result<()> {
        sink.start_msg()?;
        self.rd.expect(b'{')?;
        if !self.rd.try_consume(b'}') {
            loop {
                let key = self.rd.string()?;
                self.rd.expect(b':')?;
                match find_field(def, &key) {
                    Some(f) => self.parse_field(&f, sink)?,
                    None if self.ignore_unknown => self.rd.skip_value()?,
                    None => {
                        return Err(Error {
                            kind: crate::ErrorKind::UnknownJsonField,
                            extra: format!("{key:?} in {}", def.full_name()),
                        })
                    }
                }
                if !self.rd.try_consume(b',') {
                    break;
                }
            }
            self.rd.expect(b'}')?;
        }
        sink.end_msg()
    }

    fn parse_field(&mut self, f: &FieldDef, sink: &mut dyn Sink) -> Result<()> {
        self.rd.skip_ws();
        if self.rd.peek() == Some(b'n') && self.rd.consume_literal("null") {
            // null means "absent".
            return Ok(());
        }
        if f.is_map() {
            return self.parse_map(f, sink);
        }
        if f.is_repeated() {
            let start = req_selector(f, HandlerType::StartSeq)?;
            let end = req_selector(f, HandlerType::EndSeq)?;
            sink.start_seq(start)?;
            self.rd.expect(b'[')?;
            if !self.rd.try_consume(b']') {
                loop {
                    self.parse_single(f, sink)?;
                    if !self.rd.try_consume(b',') {
                        break;
                    }
                }
                self.rd.expect(b']')?;
            }
            return sink.end_seq(end);
        }
        self.parse_single(f, sink)
    }

    fn parse_map(&mut self, f: &FieldDef, sink: &mut dyn Sink) -> Result<()> {
        let entry = f
            .message_subdef()
            .ok_or_else(|| Error::failed("map field lacks an entry type".into()))?;
        let kf = entry
            .field_by_number(1)
            .ok_or_else(|| Error::failed("map entry has no key field".into()))?;
        let vf = entry
            .field_by_number(2)
            .ok_or_else(|| Error::failed("map entry has no value field".into()))?;
        sink.start_seq(req_selector(f, HandlerType::StartSeq)?)?;
        let startsub = req_selector(f, HandlerType::StartSubMsg)?;
        let endsub = req_selector(f, HandlerType::EndSubMsg)?;
        self.rd.expect(b'{')?;
        if !self.rd.try_consume(b'}') {
            loop {
                let key = self.rd.string()?;
                self.rd.expect(b':')?;
                sink.start_submsg(startsub)?;
                sink.start_msg()?;
                self.emit_map_key(&kf, &key, sink)?;
                self.parse_single(&vf, sink)?;
                sink.end_msg()?;
                sink.end_submsg(endsub)?;
                if !self.rd.try_consume(b',') {
                    break;
                }
            }
            self.rd.expect(b'}')?;
        }
        sink.end_seq(req_selector(f, HandlerType::EndSeq)?)
    }

    /// Converts a JSON object key to the map entry's key field events.
    fn emit_map_key(&mut self, kf: &FieldDef, key: &str, sink: &mut dyn Sink) -> Result<()> {
        let sel = Selector(kf.selector_base());
        let bad = || Error::failed(format!("bad map key {key:?}"));
        match kf.field_type() {
            FieldType::Bool => sink.put_bool(
                sel,
                match key {
                    "true" => true,
                    "false" => false,
                    _ => return Err(bad()),
                },
            ),
            FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 => {
                sink.put_int32(sel, key.parse().map_err(|_| bad())?)
            }
            FieldType::UInt32 | FieldType::Fixed32 => {
                sink.put_uint32(sel, key.parse().map_err(|_| bad())?)
            }
            FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64 => {
                sink.put_int64(sel, key.parse().map_err(|_| bad())?)
            }
            FieldType::UInt64 | FieldType::Fixed64 => {
                sink.put_uint64(sel, key.parse().map_err(|_| bad())?)
            }
            _ => put_str_value(kf, key.as_bytes(), sink),
        }
    }

    /// One non-repeated value of `f`'s type.
    fn parse_single(&mut self, f: &FieldDef, sink: &mut dyn Sink) -> Result<()> {
        self.rd.skip_ws();
        let sel = Selector(f.selector_base());
        match f.field_type() {
            FieldType::Message | FieldType::Group => {
                let sub = f
                    .message_subdef()
                    .ok_or_else(|| Error::failed("submessage field lacks a type".into()))?;
                sink.start_submsg(req_selector(f, HandlerType::StartSubMsg)?)?;
                self.parse_object(&sub, sink)?;
                sink.end_submsg(req_selector(f, HandlerType::EndSubMsg)?)
            }
            FieldType::String => {
                let s = self.rd.string()?;
                put_str_value(f, s.as_bytes(), sink)
            }
            FieldType::Bytes => {
                let s = self.rd.string()?;
                let decoded = general_purpose::STANDARD
                    .decode(s.as_bytes())
                    .map_err(|e| Error {
                        kind: crate::ErrorKind::InvalidBase64,
                        extra: e.to_string(),
                    })?;
                put_str_value(f, &decoded, sink)
            }
            FieldType::Bool => {
                if self.rd.consume_literal("true") {
                    sink.put_bool(sel, true)
                } else if self.rd.consume_literal("false") {
                    sink.put_bool(sel, false)
                } else {
                    Err(syntax_err("expected boolean".into()))
                }
            }
            FieldType::Enum => {
                if self.rd.peek() == Some(b'"') {
                    let name = self.rd.string()?;
                    let e = f
                        .enum_subdef()
                        .ok_or_else(|| Error::failed("enum field lacks a type".into()))?;
                    let v = e.value_by_name(&name).ok_or_else(|| {
                        Error::failed(format!("unknown enum value {name:?}"))
                    })?;
                    sink.put_int32(sel, v)
                } else {
                    sink.put_int32(sel, self.int_token()?)
                }
            }
            FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 => {
                sink.put_int32(sel, self.int_token()?)
            }
            FieldType::UInt32 | FieldType::Fixed32 => sink.put_uint32(sel, self.int_token()?),
            FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64 => {
                sink.put_int64(sel, self.int_token()?)
            }
            FieldType::UInt64 | FieldType::Fixed64 => sink.put_uint64(sel, self.int_token()?),
            FieldType::Float => sink.put_float(sel, self.float_token()? as f32),
            FieldType::Double => {
                let v = self.float_token()?;
                sink.put_double(sel, v)
            }
        }
    }

    /// An integer, either a bare number or the quoted form.
    fn int_token<T: std::str::FromStr>(&mut self) -> Result<T> {
        self.rd.skip_ws();
        let text = if self.rd.peek() == Some(b'"') {
            self.rd.string()?
        } else {
            self.rd.number_token()?.to_owned()
        };
        text.parse().map_err(|_| {
            range_err(format!("number {text:?} does not fit the field type"))
        })
    }

    fn float_token(&mut self) -> Result<f64> {
        self.rd.skip_ws();
        if self.rd.peek() == Some(b'"') {
            let s = self.rd.string()?;
            return match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                _ => s
                    .parse()
                    .map_err(|_| syntax_err(format!("bad number {s:?}"))),
            };
        }
        let text = self.rd.number_token()?;
        text.parse()
            .map_err(|_| syntax_err(format!("bad number {text:?}")))
    }
}

fn put_str_value(f: &FieldDef, bytes: &[u8], sink: &mut dyn Sink) -> Result<()> {
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

fn req_selector(f: &FieldDef, ty: HandlerType) -> Result<Selector> {
    selector(f, ty).ok_or_else(|| Error::failed("field does not support this event".into()))
}

fn syntax_err(extra: String) -> Error {
    Error {
        kind: crate::ErrorKind::JsonSyntax,
        extra,
    }
}

fn range_err(extra: String) -> Error {
    Error {
        kind: crate::ErrorKind::ValueOutOfRange,
        extra,
    }
}

/// Accepts the canonical JSON name first, then the original proto name.
fn find_field(def: &MessageDef, key: &str) -> Option<FieldDef> {
    def.fields()
        .find(|f| f.json_name() == key)
        .or_else(|| def.field_by_name(key))
}

fn parse(def: &MessageDef, json: &str, sink: &mut dyn Sink, ignore_unknown: bool) -> Result<()> {
    let mut parser = Parser {
        rd: Reader {
            bytes: json.as_bytes(),
            pos: 0,
        },
        ignore_unknown,
    };
    parser.parse_object(def, sink)?;
    parser.rd.skip_ws();
    if parser.rd.peek().is_some() {
        return Err(syntax_err("trailing data after JSON value".into()));
    }
    Ok(())
}

/// Parses a JSON object into sink events shaped by `def`.
///
/// Object members naming no field of `def` are an error; see
/// [`parse_json_ignoring_unknown`] for the tolerant mode.
pub fn parse_json(def: &MessageDef, json: &str, sink: &mut dyn Sink) -> Result<()> {
    parse(def, json, sink, false)
}

/// Like [`parse_json`], but steps over object members that name no
/// field of the enclosing message instead of failing.
pub fn parse_json_ignoring_unknown(
    def: &MessageDef,
    json: &str,
    sink: &mut dyn Sink,
) -> Result<()> {
    parse(def, json, sink, true)
}

/// Parses JSON into a fresh arena-backed message.
pub fn parse_message<'a>(
    arena: &'a crate::arena::Arena,
    def: &MessageDef,
    json: &str,
) -> Result<Message<'a>> {
    let mut sink = crate::fill::MessageSink::new(arena, def);
    parse_json(def, json, &mut sink)?;
    Ok(sink.root())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::defs::{DefPool, FieldBuilder, Label, Syntax};
    use crate::fill::decode_message;

    fn demo_def() -> crate::defs::FrozenSet {
        let mut pool = DefPool::new();
        let m = pool.add_msg("t.Demo").unwrap();
        pool.msg_set_syntax(m, Syntax::Proto3);
        pool.add_field(
            m,
            FieldBuilder::new("my_id", 1, FieldType::Int32, Label::Optional),
        )
        .unwrap();
        pool.add_field(
            m,
            FieldBuilder::new("name", 2, FieldType::String, Label::Optional),
        )
        .unwrap();
        pool.add_field(
            m,
            FieldBuilder::new("big", 3, FieldType::Int64, Label::Optional),
        )
        .unwrap();
        pool.add_field(
            m,
            FieldBuilder::new("data", 4, FieldType::Bytes, Label::Optional),
        )
        .unwrap();
        pool.add_field(
            m,
            FieldBuilder::new("nums", 5, FieldType::Int32, Label::Repeated),
        )
        .unwrap();
        pool.freeze(64).unwrap()
    }

    #[test]
    fn prints_camel_case_names_and_quoted_64bit() {
        let frozen = demo_def();
        let def = &frozen.msgs[0];
        let arena = Arena::new();
        let msg = decode_message(
            &arena,
            def,
            &[0x08, 0x07, 0x12, 0x02, b'h', b'i', 0x18, 0x80, 0x02],
        )
        .unwrap();
        assert_eq!(
            print_message(&msg).unwrap(),
            r#"{"myId":7,"name":"hi","big":"256"}"#
        );
    }

    #[test]
    fn bytes_print_as_base64() {
        let frozen = demo_def();
        let def = &frozen.msgs[0];
        let arena = Arena::new();
        let msg = decode_message(&arena, def, &[0x22, 0x03, 0x01, 0x02, 0x03]).unwrap();
        assert_eq!(print_message(&msg).unwrap(), r#"{"data":"AQID"}"#);
    }

    #[test]
    fn repeated_fields_print_as_arrays() {
        let frozen = demo_def();
        let def = &frozen.msgs[0];
        let arena = Arena::new();
        let msg = decode_message(&arena, def, &[0x2a, 0x03, 0x01, 0x02, 0x03]).unwrap();
        assert_eq!(print_message(&msg).unwrap(), r#"{"nums":[1,2,3]}"#);
    }

    #[test]
    fn parser_accepts_camel_and_original_names() {
        let frozen = demo_def();
        let def = &frozen.msgs[0];
        let arena = Arena::new();
        let a = parse_message(&arena, def, r#"{"myId": 7}"#).unwrap();
        let b = parse_message(&arena, def, r#"{"my_id": 7}"#).unwrap();
        assert!(a.deep_eq(&b));
        let f = def.field_by_name("my_id").unwrap();
        assert_eq!(a.get_int32(&f), 7);
    }

    #[test]
    fn parser_accepts_quoted_and_bare_numbers() {
        let frozen = demo_def();
        let def = &frozen.msgs[0];
        let arena = Arena::new();
        let a = parse_message(&arena, def, r#"{"big": "42"}"#).unwrap();
        let b = parse_message(&arena, def, r#"{"big": 42}"#).unwrap();
        assert!(a.deep_eq(&b));
    }

    #[test]
    fn round_trip_through_json() {
        let frozen = demo_def();
        let def = &frozen.msgs[0];
        let arena = Arena::new();
        let bytes = [
            0x08, 0x07, 0x12, 0x02, b'h', b'i', 0x22, 0x02, 0xff, 0x00, 0x2a, 0x02, 0x01,
            0x02,
        ];
        let msg = decode_message(&arena, def, &bytes).unwrap();
        let json = print_message(&msg).unwrap();
        let back = parse_message(&arena, def, &json).unwrap();
        assert!(msg.deep_eq(&back));
    }

    #[test]
    fn unknown_member_is_an_error() {
        let frozen = demo_def();
        let def = &frozen.msgs[0];
        let arena = Arena::new();
        assert!(parse_message(&arena, def, r#"{"nope": 1}"#).is_err());
    }

    #[test]
    fn lenient_parse_steps_over_unknown_members() {
        let frozen = demo_def();
        let def = &frozen.msgs[0];
        let arena = Arena::new();
        let json = r#"{
            "nope": {"deep": [1, "two", {"x": null}], "flag": true},
            "myId": 7,
            "also_not_a_field": [[], "s"],
            "name": "hi"
        }"#;
        let mut sink = crate::fill::MessageSink::new(&arena, def);
        parse_json_ignoring_unknown(def, json, &mut sink).unwrap();
        let msg = sink.root();
        let id = def.field_by_name("my_id").unwrap();
        let name = def.field_by_name("name").unwrap();
        assert_eq!(msg.get_int32(&id), 7);
        assert_eq!(msg.get_bytes(&name).unwrap(), b"hi");
    }

    #[test]
    fn string_escapes_round_trip() {
        let frozen = demo_def();
        let def = &frozen.msgs[0];
        let arena = Arena::new();
        let msg = parse_message(&arena, def, r#"{"name": "a\nbA😀"}"#).unwrap();
        let f = def.field_by_name("name").unwrap();
        assert_eq!(msg.get_bytes(&f).unwrap(), "a\nbA😀".as_bytes());
    }

    #[test]
    fn maps_print_and_parse_as_objects() {
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
        let msg = parse_message(&arena, def, r#"{"counts": {"a": 1, "b": 2}}"#).unwrap();
        let printed = print_message(&msg).unwrap();
        assert_eq!(printed, r#"{"counts":{"a":1,"b":2}}"#);
        let back = parse_message(&arena, def, &printed).unwrap();
        assert!(msg.deep_eq(&back));
    }
}

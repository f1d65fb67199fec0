//! Text-format printer.
//!
//! [`TextPrinter`] is a [`Sink`]: fed from the decoder or from
//! [`walk_message`](crate::fill::walk_message), it renders `name: value`
//! lines with `name { ... }` blocks for submessages. A single-line mode
//! replaces newlines and indentation with single spaces.

use std::sync::Arc;

use crate::defs::FieldDef;
use crate::handlers::{HandlerCache, Handlers, Selector};
use crate::message::Message;
use crate::sink::Sink;
use crate::wire::FieldType;
use crate::{Error, Result};

pub struct TextPrinter {
    handlers: Vec<Arc<Handlers>>,
    cache: HandlerCache,
    out: String,
    indent: usize,
    single_line: bool,
}

impl TextPrinter {
    pub fn new(handlers: Arc<Handlers>) -> TextPrinter {
        TextPrinter::with_single_line(handlers, false)
    }

    pub fn with_single_line(handlers: Arc<Handlers>, single_line: bool) -> TextPrinter {
        TextPrinter {
            handlers: vec![handlers],
            cache: HandlerCache::new(),
            out: String::new(),
            indent: 0,
            single_line,
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

    fn begin_line(&mut self, name: &str) {
        if self.single_line {
            if !self.out.is_empty() && !self.out.ends_with(' ') {
                self.out.push(' ');
            }
        } else {
            for _ in 0..self.indent {
                self.out.push_str("  ");
            }
        }
        self.out.push_str(name);
    }

    fn end_line(&mut self) {
        if !self.single_line {
            self.out.push('\n');
        }
    }

    fn put_value(&mut self, sel: Selector, value: &str) -> Result<()> {
        let f = self.field(sel)?;
        self.begin_line(f.name());
        self.out.push_str(": ");
        self.out.push_str(value);
        self.end_line();
        Ok(())
    }
}

impl Sink for TextPrinter {
    fn put_int32(&mut self, sel: Selector, v: i32) -> Result<()> {
        let f = self.field(sel)?;
        if f.field_type() == FieldType::Enum {
            // Symbolic if the number is a member, numeric otherwise.
            let rendered = f
                .enum_subdef()
                .and_then(|e| e.name_by_value(v).map(str::to_owned))
                .unwrap_or_else(|| v.to_string());
            return self.put_value(sel, &rendered);
        }
        self.put_value(sel, &v.to_string())
    }

    fn put_int64(&mut self, sel: Selector, v: i64) -> Result<()> {
        self.put_value(sel, &v.to_string())
    }

    fn put_uint32(&mut self, sel: Selector, v: u32) -> Result<()> {
        self.put_value(sel, &v.to_string())
    }

    fn put_uint64(&mut self, sel: Selector, v: u64) -> Result<()> {
        self.put_value(sel, &v.to_string())
    }

    fn put_float(&mut self, sel: Selector, v: f32) -> Result<()> {
        self.put_value(sel, &format_float(f64::from(v)))
    }

    fn put_double(&mut self, sel: Selector, v: f64) -> Result<()> {
        self.put_value(sel, &format_float(v))
    }

    fn put_bool(&mut self, sel: Selector, v: bool) -> Result<()> {
        self.put_value(sel, if v { "true" } else { "false" })
    }

    fn start_str(&mut self, sel: Selector, _size_hint: u64) -> Result<()> {
        let f = self.field(sel)?;
        self.begin_line(f.name());
        self.out.push_str(": \"");
        Ok(())
    }

    fn put_string(&mut self, _sel: Selector, bytes: &[u8]) -> Result<usize> {
        escape_into(bytes, &mut self.out);
        Ok(bytes.len())
    }

    fn end_str(&mut self, _sel: Selector) -> Result<()> {
        self.out.push('"');
        self.end_line();
        Ok(())
    }

    fn start_seq(&mut self, _sel: Selector) -> Result<()> {
        Ok(())
    }

    fn end_seq(&mut self, _sel: Selector) -> Result<()> {
        Ok(())
    }

    fn start_submsg(&mut self, sel: Selector) -> Result<()> {
        let f = self.field(sel)?;
        let sub = f
            .message_subdef()
            .ok_or_else(|| Error::failed("submessage event on a non-message field".into()))?;
        self.begin_line(f.name());
        self.out.push_str(" {");
        self.end_line();
        self.indent += 1;
        self.handlers.push(self.cache.get(&sub));
        Ok(())
    }

    fn end_submsg(&mut self, _sel: Selector) -> Result<()> {
        if self.handlers.len() < 2 {
            return Err(Error::failed("submessage ended without matching start".into()));
        }
        self.handlers.pop();
        self.indent -= 1;
        if self.single_line {
            self.out.push_str(" }");
        } else {
            self.begin_line("}");
            self.end_line();
        }
        Ok(())
    }

    fn unknown(&mut self, _bytes: &[u8]) -> Result<()> {
        // Unknown fields carry no names; the text form omits them.
        Ok(())
    }
}

fn format_float(v: f64) -> String {
    if v.is_nan() {
        "nan".to_owned()
    } else if v.is_infinite() {
        if v < 0.0 { "-inf".to_owned() } else { "inf".to_owned() }
    } else if v == v.trunc() && v.abs() < 1e15 {
        format!("{v:.0}")
    } else {
        format!("{v}")
    }
}

/// C-style escaping: named escapes for the common control characters,
/// `\xNN` for other non-printable bytes.
fn escape_into(bytes: &[u8], out: &mut String) {
    for &b in bytes {
        match b {
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                out.push_str(&format!("\\x{b:02x}"));
            }
        }
    }
}

/// Renders `msg` in multi-line text format.
pub fn print_message(msg: &Message) -> Result<String> {
    print_with_mode(msg, false)
}

/// Renders `msg` on one line.
pub fn print_message_single_line(msg: &Message) -> Result<String> {
    print_with_mode(msg, true)
}

fn print_with_mode(msg: &Message, single_line: bool) -> Result<String> {
    let mut printer = TextPrinter::with_single_line(Handlers::new(&msg.def()), single_line);
    crate::fill::walk_message(msg, &mut printer)?;
    Ok(printer.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::defs::{DefPool, FieldBuilder, Label, Syntax};
    use crate::fill::decode_message;

    fn demo_def() -> crate::defs::FrozenSet {
        let mut pool = DefPool::new();
        let inner = pool.add_msg("t.Inner").unwrap();
        pool.msg_set_syntax(inner, Syntax::Proto3);
        pool.add_field(
            inner,
            FieldBuilder::new("v", 1, FieldType::Int32, Label::Optional),
        )
        .unwrap();
        let m = pool.add_msg("t.Demo").unwrap();
        pool.msg_set_syntax(m, Syntax::Proto3);
        pool.add_field(m, FieldBuilder::new("id", 1, FieldType::Int32, Label::Optional))
            .unwrap();
        pool.add_field(
            m,
            FieldBuilder::new("name", 2, FieldType::String, Label::Optional),
        )
        .unwrap();
        pool.add_field(
            m,
            FieldBuilder::new("inner", 3, FieldType::Message, Label::Optional).subdef_msg(inner),
        )
        .unwrap();
        pool.freeze(64).unwrap()
    }

    #[test]
    fn prints_scalars_and_strings() {
        let frozen = demo_def();
        let def = frozen.msgs.iter().find(|d| d.full_name() == "t.Demo").unwrap();
        let arena = Arena::new();
        let msg = decode_message(
            &arena,
            def,
            &[0x08, 0x2a, 0x12, 0x03, b'h', b'i', b'\n'],
        )
        .unwrap();
        assert_eq!(print_message(&msg).unwrap(), "id: 42\nname: \"hi\\n\"\n");
    }

    #[test]
    fn prints_submessages_as_blocks() {
        let frozen = demo_def();
        let def = frozen.msgs.iter().find(|d| d.full_name() == "t.Demo").unwrap();
        let arena = Arena::new();
        let msg = decode_message(&arena, def, &[0x1a, 0x02, 0x08, 0x07]).unwrap();
        assert_eq!(print_message(&msg).unwrap(), "inner {\n  v: 7\n}\n");
    }

    #[test]
    fn single_line_mode_uses_spaces() {
        let frozen = demo_def();
        let def = frozen.msgs.iter().find(|d| d.full_name() == "t.Demo").unwrap();
        let arena = Arena::new();
        let msg =
            decode_message(&arena, def, &[0x08, 0x01, 0x1a, 0x02, 0x08, 0x07]).unwrap();
        assert_eq!(
            print_message_single_line(&msg).unwrap(),
            "id: 1 inner { v: 7 }"
        );
    }

    #[test]
    fn enum_values_print_symbolically() {
        let mut pool = DefPool::new();
        let e = pool.add_enum("t.Color").unwrap();
        pool.enum_add_value(e, "RED", 0).unwrap();
        pool.enum_add_value(e, "GREEN", 1).unwrap();
        let m = pool.add_msg("t.Paint").unwrap();
        pool.msg_set_syntax(m, Syntax::Proto3);
        pool.add_field(
            m,
            FieldBuilder::new("color", 1, FieldType::Enum, Label::Optional).subdef_enum(e),
        )
        .unwrap();
        let frozen = pool.freeze(64).unwrap();
        let def = &frozen.msgs[0];
        let arena = Arena::new();
        let green = decode_message(&arena, def, &[0x08, 0x01]).unwrap();
        assert_eq!(print_message(&green).unwrap(), "color: GREEN\n");
        // Out-of-range numbers fall back to digits.
        let other = decode_message(&arena, def, &[0x08, 0x09]).unwrap();
        assert_eq!(print_message(&other).unwrap(), "color: 9\n");
    }
}

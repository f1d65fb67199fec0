//! The event-stream interface between parsers, printers, and messages.
//!
//! A [`Sink`] receives a parse-event stream for one root message: scalar
//! values, string fragments, and scope transitions, each tagged with the
//! selector assigned to the field at freeze time. Decoders and message
//! walkers produce the stream; message fillers, encoders, and the text and
//! JSON printers consume it. The closure-typing discipline of a handler
//! table becomes ordinary trait dispatch here, so mismatches are caught at
//! compile time.
//!
//! Contract, in stream order:
//! - `start_msg` opens the root; `end_msg` closes it.
//! - Repeated fields wrap their elements in `start_seq`/`end_seq`.
//! - String fields arrive as `start_str`, any number of `put_string`
//!   fragments, then `end_str`. A fragment handler reports how many bytes
//!   it consumed; consuming fewer than offered is an error at the driver.
//! - Submessages nest via `start_submsg`/`end_submsg`. The sink is
//!   responsible for tracking its own scope stack.
//! - `unknown` delivers the raw wire bytes of one unrecognized field.
//! - Any `Err` aborts the stream; [`ErrorKind::HandlerBreak`] is the
//!   conventional kind for a sink-initiated abort.
//!
//! [`ErrorKind::HandlerBreak`]: crate::ErrorKind::HandlerBreak

use crate::handlers::Selector;
use crate::Result;

pub trait Sink {
    fn start_msg(&mut self) -> Result<()> {
        Ok(())
    }

    fn end_msg(&mut self) -> Result<()> {
        Ok(())
    }

    fn put_int32(&mut self, sel: Selector, v: i32) -> Result<()>;
    fn put_int64(&mut self, sel: Selector, v: i64) -> Result<()>;
    fn put_uint32(&mut self, sel: Selector, v: u32) -> Result<()>;
    fn put_uint64(&mut self, sel: Selector, v: u64) -> Result<()>;
    fn put_float(&mut self, sel: Selector, v: f32) -> Result<()>;
    fn put_double(&mut self, sel: Selector, v: f64) -> Result<()>;
    fn put_bool(&mut self, sel: Selector, v: bool) -> Result<()>;

    /// Opens a string value. `size_hint` is the delimited length when the
    /// producer knows it up front, or 0.
    fn start_str(&mut self, sel: Selector, size_hint: u64) -> Result<()>;

    /// Delivers one fragment and returns the number of bytes consumed.
    fn put_string(&mut self, sel: Selector, bytes: &[u8]) -> Result<usize>;

    fn end_str(&mut self, sel: Selector) -> Result<()>;

    fn start_seq(&mut self, sel: Selector) -> Result<()>;
    fn end_seq(&mut self, sel: Selector) -> Result<()>;

    fn start_submsg(&mut self, sel: Selector) -> Result<()>;
    fn end_submsg(&mut self, sel: Selector) -> Result<()>;

    /// One unrecognized field, as raw wire bytes (tag included).
    fn unknown(&mut self, bytes: &[u8]) -> Result<()> {
        let _ = bytes;
        Ok(())
    }
}

/// A sink that counts events, for tests and diagnostics.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct EventCounter {
    pub values: usize,
    pub strings: usize,
    pub submsgs: usize,
    pub seqs: usize,
    pub unknowns: usize,
}

impl Sink for EventCounter {
    fn put_int32(&mut self, _sel: Selector, _v: i32) -> Result<()> {
        self.values += 1;
        Ok(())
    }

    fn put_int64(&mut self, _sel: Selector, _v: i64) -> Result<()> {
        self.values += 1;
        Ok(())
    }

    fn put_uint32(&mut self, _sel: Selector, _v: u32) -> Result<()> {
        self.values += 1;
        Ok(())
    }

    fn put_uint64(&mut self, _sel: Selector, _v: u64) -> Result<()> {
        self.values += 1;
        Ok(())
    }

    fn put_float(&mut self, _sel: Selector, _v: f32) -> Result<()> {
        self.values += 1;
        Ok(())
    }

    fn put_double(&mut self, _sel: Selector, _v: f64) -> Result<()> {
        self.values += 1;
        Ok(())
    }

    fn put_bool(&mut self, _sel: Selector, _v: bool) -> Result<()> {
        self.values += 1;
        Ok(())
    }

    fn start_str(&mut self, _sel: Selector, _size_hint: u64) -> Result<()> {
        Ok(())
    }

    fn put_string(&mut self, _sel: Selector, bytes: &[u8]) -> Result<usize> {
        Ok(bytes.len())
    }

    fn end_str(&mut self, _sel: Selector) -> Result<()> {
        self.strings += 1;
        Ok(())
    }

    fn start_seq(&mut self, _sel: Selector) -> Result<()> {
        Ok(())
    }

    fn end_seq(&mut self, _sel: Selector) -> Result<()> {
        self.seqs += 1;
        Ok(())
    }

    fn start_submsg(&mut self, _sel: Selector) -> Result<()> {
        Ok(())
    }

    fn end_submsg(&mut self, _sel: Selector) -> Result<()> {
        self.submsgs += 1;
        Ok(())
    }

    fn unknown(&mut self, _bytes: &[u8]) -> Result<()> {
        self.unknowns += 1;
        Ok(())
    }
}

//! Streaming bytecode interpreter that drives a [`Sink`] from wire data.
//!
//! Input arrives in arbitrarily sized buffers through [`Decoder::feed`];
//! the interpreter suspends whenever a value straddles a buffer boundary
//! and resumes on the next call. At most [`RESIDUAL_MAX`] unconsumed
//! bytes are buffered across calls: every instruction either completes
//! fully or consumes nothing, so the carried tail is never longer than
//! one tag plus one scalar value.
//!
//! [`Decoder::feed`] returns the count of bytes logically consumed. The
//! count can exceed the buffer's length: that happens when a large
//! unknown delimited field is being skipped, and it tells the caller to
//! drop that many bytes before feeding again.

use log::trace;

use crate::bytecode::{Method, Op, Program, ValueKind, DISPATCH_ENDMSG};
use crate::sink::Sink;
use crate::wire::{read_fixed32, read_fixed64, zigzag_decode_32, zigzag_decode_64, WireType};
use crate::{Error, ErrorKind, Result, MAX_FIELD_NUMBER};

/// Upper bound on bytes carried between [`Decoder::feed`] calls.
pub const RESIDUAL_MAX: usize = 16;

const NONDELIMITED: u64 = u64::MAX;
const MAX_VARINT_ENCODED_LEN: usize = 10;

struct Frame {
    /// Absolute stream offset one past the frame's last byte, or
    /// `NONDELIMITED` for frames bounded by a tag or by end of stream.
    end_ofs: u64,
    /// Field number whose END_GROUP tag closes this frame; 0 otherwise.
    group_num: u32,
    /// Index of the method whose dispatch table is active here.
    method: u32,
}

/// Why the interpreter stopped before reaching a `Halt`.
enum Exit {
    /// Out of input with an instruction half-satisfied.
    Suspend,
    /// Input exhausted mid-skip; the caller owes us this many more bytes.
    SkipAhead(u64),
    Error(Error),
}

impl From<Error> for Exit {
    fn from(e: Error) -> Exit {
        Exit::Error(e)
    }
}

type VmResult<T> = std::result::Result<T, Exit>;

/// Input for one `feed` call: the residual tail carried from the last
/// call followed by the caller's buffer, addressed as one stream.
struct Input<'b> {
    segs: [&'b [u8]; 2],
    pos: usize,
    /// Absolute stream offset of `segs[0][0]`.
    base: u64,
}

impl<'b> Input<'b> {
    fn len(&self) -> usize {
        self.segs[0].len() + self.segs[1].len()
    }

    fn avail(&self) -> usize {
        self.len() - self.pos
    }

    fn absolute(&self) -> u64 {
        self.base + self.pos as u64
    }

    fn byte(&self, i: usize) -> u8 {
        let first = self.segs[0].len();
        if i < first {
            self.segs[0][i]
        } else {
            self.segs[1][i - first]
        }
    }

    /// The contiguous run starting at the current position.
    fn contiguous(&self) -> &'b [u8] {
        let first = self.segs[0].len();
        if self.pos < first {
            &self.segs[0][self.pos..]
        } else {
            &self.segs[1][self.pos - first..]
        }
    }

    fn copy_range(&self, start: usize, end: usize) -> Vec<u8> {
        (start..end).map(|i| self.byte(i)).collect()
    }

    /// Reads a varint at `p` without committing the position.
    fn peek_varint(&self, mut p: usize) -> VmResult<(u64, usize)> {
        let mut val = 0u64;
        let mut shift = 0u32;
        loop {
            if p >= self.len() {
                return Err(Exit::Suspend);
            }
            let b = self.byte(p);
            p += 1;
            val |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok((val, p));
            }
            shift += 7;
            if shift >= 7 * MAX_VARINT_ENCODED_LEN as u32 {
                return Err(Error::from_kind(ErrorKind::UnterminatedVarint).into());
            }
        }
    }

    fn peek_fixed(&self, p: usize, n: usize) -> VmResult<(u64, usize)> {
        if p + n > self.len() {
            return Err(Exit::Suspend);
        }
        let bytes = self.copy_range(p, p + n);
        let v = if n == 4 {
            u64::from(read_fixed32(&bytes))
        } else {
            read_fixed64(&bytes)
        };
        Ok((v, p + n))
    }
}

/// A resumable decoder executing one compiled [`Program`].
pub struct Decoder<'p> {
    program: &'p Program,
    pc: usize,
    call_stack: Vec<usize>,
    frames: Vec<Frame>,
    max_nesting: usize,
    residual: Vec<u8>,
    /// Absolute stream offset of the first residual byte (or of the next
    /// byte the caller will feed, when the residual is empty).
    bufstart_ofs: u64,
    completed: bool,
}

impl<'p> Decoder<'p> {
    pub fn new(program: &'p Program) -> Decoder<'p> {
        Decoder::with_max_nesting(program, crate::DEFAULT_MAX_NESTING)
    }

    pub fn with_max_nesting(program: &'p Program, max_nesting: usize) -> Decoder<'p> {
        let method = program.root_method();
        Decoder {
            program,
            pc: program.method(method).base as usize,
            call_stack: vec![0],
            frames: vec![Frame {
                end_ofs: NONDELIMITED,
                group_num: 0,
                method,
            }],
            max_nesting,
            residual: Vec::new(),
            bufstart_ofs: 0,
            completed: false,
        }
    }

    /// Feeds one buffer and returns the count of bytes logically
    /// consumed, which exceeds `buf.len()` when the decoder wants the
    /// caller to drop bytes before the next call.
    pub fn feed(&mut self, buf: &[u8], sink: &mut dyn Sink) -> Result<u64> {
        if self.completed {
            return Err(Error::failed("input after end of message".into()));
        }
        let residual = std::mem::take(&mut self.residual);
        let mut input = Input {
            segs: [&residual, buf],
            pos: 0,
            base: self.bufstart_ofs,
        };
        let size = residual.len() + buf.len();
        match self.run(&mut input, sink) {
            Ok(()) => {
                self.bufstart_ofs = input.base + size as u64;
                Ok(buf.len() as u64)
            }
            Err(Exit::Suspend) => {
                let tail = input.copy_range(input.pos, size);
                if tail.len() > RESIDUAL_MAX {
                    return Err(Error::failed("too much pending data at suspend point".into()));
                }
                self.bufstart_ofs = input.absolute();
                self.residual = tail;
                Ok(buf.len() as u64)
            }
            Err(Exit::SkipAhead(extra)) => {
                trace!("skipping {extra} bytes past the end of this buffer");
                self.bufstart_ofs = input.base + size as u64 + extra;
                Ok(buf.len() as u64 + extra)
            }
            Err(Exit::Error(e)) => Err(e),
        }
    }

    /// Signals end of input, closing the top-level message.
    ///
    /// Fails if the stream stopped partway through a field, inside a
    /// group, or inside a delimited region that promised more bytes.
    pub fn end(&mut self, sink: &mut dyn Sink) -> Result<()> {
        if self.completed {
            return Ok(());
        }
        if !self.residual.is_empty() {
            return Err(Error::from_kind(ErrorKind::UnexpectedEof));
        }
        // Frames bounded only by end of stream end here. Group frames
        // stay open: a missing END_GROUP tag is an error.
        let end = self.bufstart_ofs;
        for frame in &mut self.frames {
            if frame.end_ofs == NONDELIMITED && frame.group_num == 0 {
                frame.end_ofs = end;
            }
        }
        // A suspended tag read sits just past its delimitation check;
        // back up so the now-final region boundary is noticed.
        if matches!(self.program.ops[self.pc], Op::Tag { .. } | Op::Dispatch) {
            while !matches!(self.program.ops[self.pc], Op::CheckDelim(_)) {
                self.pc -= 1;
            }
        }
        let mut input = Input {
            segs: [&[], &[]],
            pos: 0,
            base: end,
        };
        match self.run(&mut input, sink) {
            Ok(()) => Ok(()),
            Err(Exit::Suspend) | Err(Exit::SkipAhead(_)) => {
                Err(Error::from_kind(ErrorKind::UnexpectedEof))
            }
            Err(Exit::Error(e)) => Err(e),
        }
    }

    /// True once the top-level message has been fully delivered.
    pub fn completed(&self) -> bool {
        self.completed
    }

    fn top(&self) -> &Frame {
        // The root frame is never popped.
        self.frames.last().unwrap()
    }

    fn delim_reached(&self, input: &Input) -> bool {
        let end = self.top().end_ofs;
        end != NONDELIMITED && input.absolute() >= end
    }

    fn run(&mut self, input: &mut Input, sink: &mut dyn Sink) -> VmResult<()> {
        loop {
            match self.program.ops[self.pc].clone() {
                Op::Value { kind, sel } => {
                    self.op_value(input, sink, kind, sel)?;
                    self.pc += 1;
                }
                Op::StartMsg => {
                    sink.start_msg()?;
                    self.pc += 1;
                }
                Op::EndMsg => {
                    sink.end_msg()?;
                    self.pc += 1;
                }
                Op::StartSeq(sel) => {
                    sink.start_seq(sel)?;
                    self.pc += 1;
                }
                Op::EndSeq(sel) => {
                    sink.end_seq(sel)?;
                    self.pc += 1;
                }
                Op::StartSubMsg(sel) => {
                    sink.start_submsg(sel)?;
                    self.pc += 1;
                }
                Op::EndSubMsg(sel) => {
                    sink.end_submsg(sel)?;
                    self.pc += 1;
                }
                Op::StartStr(sel) => {
                    let hint = self.top().end_ofs - input.absolute();
                    sink.start_str(sel, hint)?;
                    self.pc += 1;
                }
                Op::StrFrag(sel) => {
                    if self.op_strfrag(input, sink, sel)? {
                        self.pc += 1;
                    } else {
                        return Err(Exit::Suspend);
                    }
                }
                Op::EndStr(sel) => {
                    sink.end_str(sel)?;
                    self.pc += 1;
                }
                Op::PushLenDelim => {
                    let (len, p) = input.peek_varint(input.pos)?;
                    let end = input.base + p as u64 + len;
                    self.push_frame(end, 0)?;
                    input.pos = p;
                    self.pc += 1;
                }
                Op::PushTagDelim(group_num) => {
                    let end = self.top().end_ofs;
                    self.push_frame(end, group_num)?;
                    self.pc += 1;
                }
                Op::Pop => {
                    self.frames.pop();
                    self.pc += 1;
                }
                Op::CheckDelim(target) => {
                    if self.delim_reached(input) {
                        self.pc = target as usize;
                    } else {
                        self.pc += 1;
                    }
                }
                Op::Branch(target) => {
                    self.pc = target as usize;
                }
                Op::Tag { tag, tag_len, jump } => {
                    let n = usize::from(tag_len);
                    let mut matched = 0;
                    while matched < n {
                        if input.pos + matched >= input.len() {
                            // Prefix matches so far; cannot tell yet.
                            return Err(Exit::Suspend);
                        }
                        if input.byte(input.pos + matched) != (tag >> (8 * matched)) as u8 {
                            break;
                        }
                        matched += 1;
                    }
                    if matched == n {
                        input.pos += n;
                        self.pc += 1;
                    } else {
                        self.pc = jump as usize;
                    }
                }
                Op::Call(target) => {
                    self.call_stack.push(self.pc + 1);
                    self.pc = target as usize;
                }
                Op::Ret => {
                    // The stack bottom holds the Halt at pc 0.
                    self.pc = self.call_stack.pop().unwrap_or(0);
                }
                Op::SetDispatch(method) => {
                    if let Some(frame) = self.frames.last_mut() {
                        frame.method = method;
                    }
                    self.pc += 1;
                }
                Op::Dispatch => {
                    self.op_dispatch(input, sink)?;
                }
                Op::Halt => {
                    self.completed = true;
                    return Ok(());
                }
            }
        }
    }

    fn push_frame(&mut self, end_ofs: u64, group_num: u32) -> VmResult<()> {
        if self.frames.len() >= self.max_nesting {
            return Err(Error::from_kind(ErrorKind::NestingTooDeep).into());
        }
        let parent = self.top();
        if parent.end_ofs != NONDELIMITED && end_ofs != NONDELIMITED && end_ofs > parent.end_ofs {
            return Err(Error::from_kind(ErrorKind::SubmessageExtendsPastParent).into());
        }
        let method = parent.method;
        self.frames.push(Frame {
            end_ofs,
            group_num,
            method,
        });
        Ok(())
    }

    fn op_value(
        &mut self,
        input: &mut Input,
        sink: &mut dyn Sink,
        kind: ValueKind,
        sel: crate::handlers::Selector,
    ) -> VmResult<()> {
        let (raw, p) = match kind {
            ValueKind::Double | ValueKind::Fixed64 | ValueKind::SFixed64 => {
                input.peek_fixed(input.pos, 8)?
            }
            ValueKind::Float | ValueKind::Fixed32 | ValueKind::SFixed32 => {
                input.peek_fixed(input.pos, 4)?
            }
            _ => input.peek_varint(input.pos)?,
        };
        let end = self.top().end_ofs;
        if end != NONDELIMITED && input.base + p as u64 > end {
            return Err(Error::failed("value extends past enclosing delimited region".into()).into());
        }
        match kind {
            ValueKind::Double => sink.put_double(sel, f64::from_bits(raw))?,
            ValueKind::Float => sink.put_float(sel, f32::from_bits(raw as u32))?,
            ValueKind::Int64 => sink.put_int64(sel, raw as i64)?,
            ValueKind::UInt64 | ValueKind::Fixed64 => sink.put_uint64(sel, raw)?,
            ValueKind::Int32 => sink.put_int32(sel, raw as u32 as i32)?,
            ValueKind::Fixed32 | ValueKind::UInt32 => sink.put_uint32(sel, raw as u32)?,
            ValueKind::Bool => sink.put_bool(sel, raw != 0)?,
            ValueKind::SFixed32 => sink.put_int32(sel, raw as u32 as i32)?,
            ValueKind::SFixed64 => sink.put_int64(sel, raw as i64)?,
            ValueKind::SInt32 => sink.put_int32(sel, zigzag_decode_32(raw as u32))?,
            ValueKind::SInt64 => sink.put_int64(sel, zigzag_decode_64(raw))?,
        }
        input.pos = p;
        Ok(())
    }

    /// Delivers string bytes up to the frame's end. Returns true when the
    /// whole string has been delivered, false to suspend for more input.
    fn op_strfrag(
        &mut self,
        input: &mut Input,
        sink: &mut dyn Sink,
        sel: crate::handlers::Selector,
    ) -> VmResult<bool> {
        let end = self.top().end_ofs;
        loop {
            let remaining = end - input.absolute();
            if remaining == 0 {
                return Ok(true);
            }
            if input.avail() == 0 {
                return Ok(false);
            }
            let run = input.contiguous();
            let take = run.len().min(remaining as usize);
            let consumed = sink.put_string(sel, &run[..take])?;
            if consumed < take {
                return Err(Error::from_kind(ErrorKind::ShortStringHandler).into());
            }
            input.pos += take;
        }
    }

    fn op_dispatch(&mut self, input: &mut Input, sink: &mut dyn Sink) -> VmResult<()> {
        let (tag, p) = input.peek_varint(input.pos)?;
        if tag > u64::from(u32::MAX) {
            return Err(Error::from_kind(ErrorKind::VarintOverflow).into());
        }
        let fieldnum = (tag >> 3) as u32;
        let wt_raw = (tag & 7) as u8;
        let wt = WireType::from_u8(wt_raw)?;
        let program = self.program;
        let method = program.method(self.top().method);

        if wt == WireType::EndGroup {
            if fieldnum != self.top().group_num || fieldnum == 0 {
                return Err(Error::from_kind(ErrorKind::UnmatchedEndGroup).into());
            }
            input.pos = p;
            self.pc = endmsg_pc(method);
            return Ok(());
        }

        if let Some(&entry) = method.dispatch.get(u64::from(fieldnum)) {
            let ofs = entry >> 16;
            if wt_raw == (entry & 0xff) as u8 {
                input.pos = p;
                self.pc = (method.base as u64 + ofs) as usize;
                return Ok(());
            }
            if wt_raw == ((entry >> 8) & 0xff) as u8 {
                if let Some(&alt) = method
                    .dispatch
                    .get(u64::from(fieldnum) + u64::from(MAX_FIELD_NUMBER))
                {
                    input.pos = p;
                    self.pc = (method.base as u64 + alt) as usize;
                    return Ok(());
                }
            }
        }

        self.skip_unknown(input, sink, fieldnum, wt, p)?;
        // The enclosing region can end right after an unknown field, so
        // revisit the delimitation check that precedes this instruction.
        self.pc -= 1;
        Ok(())
    }

    /// Consumes one unrecognized field, delivering its full bytes (tag
    /// included) to the sink when they are at hand. Oversized delimited
    /// values are skipped without buffering and without delivery.
    fn skip_unknown(
        &mut self,
        input: &mut Input,
        sink: &mut dyn Sink,
        fieldnum: u32,
        wt: WireType,
        value_start: usize,
    ) -> VmResult<()> {
        if fieldnum == 0 || fieldnum > MAX_FIELD_NUMBER {
            return Err(Error::from_kind(ErrorKind::InvalidFieldNumber).into());
        }
        trace!("skipping unknown field {fieldnum} with wire type {wt:?}");
        let frame_end = self.top().end_ofs;
        let field_start = input.pos;
        let value_end = match wt {
            WireType::Varint => input.peek_varint(value_start)?.1,
            WireType::Bits64 => input.peek_fixed(value_start, 8)?.1,
            WireType::Bits32 => input.peek_fixed(value_start, 4)?.1,
            WireType::Delimited => {
                let (len, p) = input.peek_varint(value_start)?;
                let end = p as u64 + len;
                if frame_end != NONDELIMITED && input.base + end > frame_end {
                    return Err(
                        Error::from_kind(ErrorKind::SubmessageExtendsPastParent).into()
                    );
                }
                if end > input.len() as u64 {
                    // Too big to hold; drop it and ask the caller to
                    // discard the rest.
                    let extra = end - input.len() as u64;
                    input.pos = input.len();
                    return Err(Exit::SkipAhead(extra));
                }
                end as usize
            }
            WireType::StartGroup => self.skip_group(input, fieldnum, value_start)?,
            WireType::EndGroup => {
                return Err(Error::from_kind(ErrorKind::UnmatchedEndGroup).into())
            }
        };
        if frame_end != NONDELIMITED && input.base + value_end as u64 > frame_end {
            return Err(Error::from_kind(ErrorKind::SubmessageExtendsPastParent).into());
        }
        let bytes = input.copy_range(field_start, value_end);
        sink.unknown(&bytes)?;
        input.pos = value_end;
        Ok(())
    }

    /// Scans past an unknown group, returning the position just after its
    /// END_GROUP tag. Consumes nothing on suspension.
    fn skip_group(&self, input: &Input, group_num: u32, mut p: usize) -> VmResult<usize> {
        let mut open: Vec<u32> = vec![group_num];
        while let Some(&innermost) = open.last() {
            let (tag, next) = input.peek_varint(p)?;
            if tag > u64::from(u32::MAX) {
                return Err(Error::from_kind(ErrorKind::VarintOverflow).into());
            }
            let fieldnum = (tag >> 3) as u32;
            if fieldnum == 0 || fieldnum > MAX_FIELD_NUMBER {
                return Err(Error::from_kind(ErrorKind::InvalidFieldNumber).into());
            }
            p = next;
            match WireType::from_u8((tag & 7) as u8)? {
                WireType::Varint => p = input.peek_varint(p)?.1,
                WireType::Bits64 => p = input.peek_fixed(p, 8)?.1,
                WireType::Bits32 => p = input.peek_fixed(p, 4)?.1,
                WireType::Delimited => {
                    let (len, after) = input.peek_varint(p)?;
                    let end = after as u64 + len;
                    if end > input.len() as u64 {
                        return Err(Exit::Suspend);
                    }
                    p = end as usize;
                }
                WireType::StartGroup => {
                    if open.len() >= self.max_nesting {
                        return Err(Error::from_kind(ErrorKind::NestingTooDeep).into());
                    }
                    open.push(fieldnum);
                }
                WireType::EndGroup => {
                    if fieldnum != innermost {
                        return Err(Error::from_kind(ErrorKind::UnmatchedEndGroup).into());
                    }
                    open.pop();
                }
            }
        }
        Ok(p)
    }
}

/// Decodes a complete in-memory buffer in one shot.
pub fn decode_full(program: &Program, buf: &[u8], sink: &mut dyn Sink) -> Result<()> {
    let mut decoder = Decoder::new(program);
    let consumed = decoder.feed(buf, sink)?;
    if consumed > buf.len() as u64 {
        return Err(Error::from_kind(ErrorKind::UnexpectedEof));
    }
    decoder.end(sink)
}

fn endmsg_pc(method: &Method) -> usize {
    // Every compiled method registers its end sequence under key 0.
    let ofs = method.dispatch.get(DISPATCH_ENDMSG).copied().unwrap_or(0);
    (method.base as u64 + ofs) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Program;
    use crate::defs::{DefPool, FieldBuilder, FrozenSet, Label, Syntax};
    use crate::handlers::Selector;
    use crate::wire::FieldType;

    /// Records every event with its selector for order assertions.
    /// String bytes show up twice: one `frag/` event per delivered chunk
    /// and one accumulated `str/` event at end-of-string.
    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        cur_str: Vec<u8>,
    }

    impl Sink for Recorder {
        fn start_msg(&mut self) -> crate::Result<()> {
            self.events.push("startmsg".into());
            Ok(())
        }
        fn end_msg(&mut self) -> crate::Result<()> {
            self.events.push("endmsg".into());
            Ok(())
        }
        fn put_int32(&mut self, sel: Selector, v: i32) -> crate::Result<()> {
            self.events.push(format!("int32/{}={v}", sel.0));
            Ok(())
        }
        fn put_int64(&mut self, sel: Selector, v: i64) -> crate::Result<()> {
            self.events.push(format!("int64/{}={v}", sel.0));
            Ok(())
        }
        fn put_uint32(&mut self, sel: Selector, v: u32) -> crate::Result<()> {
            self.events.push(format!("uint32/{}={v}", sel.0));
            Ok(())
        }
        fn put_uint64(&mut self, sel: Selector, v: u64) -> crate::Result<()> {
            self.events.push(format!("uint64/{}={v}", sel.0));
            Ok(())
        }
        fn put_float(&mut self, sel: Selector, v: f32) -> crate::Result<()> {
            self.events.push(format!("float/{}={v}", sel.0));
            Ok(())
        }
        fn put_double(&mut self, sel: Selector, v: f64) -> crate::Result<()> {
            self.events.push(format!("double/{}={v}", sel.0));
            Ok(())
        }
        fn put_bool(&mut self, sel: Selector, v: bool) -> crate::Result<()> {
            self.events.push(format!("bool/{}={v}", sel.0));
            Ok(())
        }
        fn start_str(&mut self, sel: Selector, hint: u64) -> crate::Result<()> {
            self.events.push(format!("startstr/{}:{hint}", sel.0));
            Ok(())
        }
        fn put_string(&mut self, sel: Selector, bytes: &[u8]) -> crate::Result<usize> {
            self.events.push(format!(
                "frag/{}={}",
                sel.0,
                String::from_utf8_lossy(bytes)
            ));
            self.cur_str.extend_from_slice(bytes);
            Ok(bytes.len())
        }
        fn end_str(&mut self, sel: Selector) -> crate::Result<()> {
            let s = String::from_utf8_lossy(&self.cur_str).into_owned();
            self.cur_str.clear();
            self.events.push(format!("str/{}={s}", sel.0));
            self.events.push(format!("endstr/{}", sel.0));
            Ok(())
        }
        fn start_seq(&mut self, sel: Selector) -> crate::Result<()> {
            self.events.push(format!("startseq/{}", sel.0));
            Ok(())
        }
        fn end_seq(&mut self, sel: Selector) -> crate::Result<()> {
            self.events.push(format!("endseq/{}", sel.0));
            Ok(())
        }
        fn start_submsg(&mut self, sel: Selector) -> crate::Result<()> {
            self.events.push(format!("startsub/{}", sel.0));
            Ok(())
        }
        fn end_submsg(&mut self, sel: Selector) -> crate::Result<()> {
            self.events.push(format!("endsub/{}", sel.0));
            Ok(())
        }
        fn unknown(&mut self, bytes: &[u8]) -> crate::Result<()> {
            self.events.push(format!("unknown:{bytes:02x?}"));
            Ok(())
        }
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

    fn decode(frozen: &FrozenSet, idx: usize, bytes: &[u8]) -> Vec<String> {
        let prog = Program::compile(&frozen.msgs[idx]);
        let mut rec = Recorder::default();
        decode_full(&prog, bytes, &mut rec).unwrap();
        rec.events
    }

    #[test]
    fn decodes_varint_scalar() {
        let frozen = scalar_pool();
        let events = decode(&frozen, 0, &[0x08, 0x96, 0x01]);
        assert!(events.contains(&"int32/3=150".to_string()));
        assert_eq!(events.first().map(String::as_str), Some("startmsg"));
        assert_eq!(events.last().map(String::as_str), Some("endmsg"));
    }

    #[test]
    fn decodes_string_field() {
        let frozen = scalar_pool();
        let events = decode(&frozen, 0, &[0x12, 0x02, b'h', b'i']);
        assert!(events.iter().any(|e| e.starts_with("startstr/")));
        assert!(events.iter().any(|e| e.ends_with("=hi")));
        assert!(events.iter().any(|e| e.starts_with("endstr/")));
    }

    #[test]
    fn resumes_across_split_varint() {
        let frozen = scalar_pool();
        let prog = Program::compile(&frozen.msgs[0]);
        let mut rec = Recorder::default();
        let mut dec = Decoder::new(&prog);
        // Split in the middle of the value varint.
        assert_eq!(dec.feed(&[0x08, 0x96], &mut rec).unwrap(), 2);
        assert_eq!(dec.feed(&[0x01], &mut rec).unwrap(), 1);
        dec.end(&mut rec).unwrap();
        assert!(rec.events.contains(&"int32/3=150".to_string()));
    }

    #[test]
    fn resumes_string_across_buffers_in_fragments() {
        let frozen = scalar_pool();
        let prog = Program::compile(&frozen.msgs[0]);
        let mut rec = Recorder::default();
        let mut dec = Decoder::new(&prog);
        dec.feed(&[0x12, 0x04, b'a', b'b'], &mut rec).unwrap();
        dec.feed(&[b'c', b'd'], &mut rec).unwrap();
        dec.end(&mut rec).unwrap();
        let frags: Vec<&String> = rec
            .events
            .iter()
            .filter(|e| e.starts_with("frag/"))
            .collect();
        assert_eq!(frags.len(), 2);
        assert!(frags[0].ends_with("=ab"));
        assert!(frags[1].ends_with("=cd"));
        assert!(rec.events.iter().any(|e| e.ends_with("=abcd") && e.starts_with("str/")));
    }

    #[test]
    fn byte_at_a_time_feeding_matches_one_shot() {
        let frozen = scalar_pool();
        let prog = Program::compile(&frozen.msgs[0]);
        let bytes = [0x08, 0x96, 0x01, 0x12, 0x02, b'h', b'i'];

        let mut whole = Recorder::default();
        decode_full(&prog, &bytes, &mut whole).unwrap();

        let mut split = Recorder::default();
        let mut dec = Decoder::new(&prog);
        for b in bytes {
            dec.feed(&[b], &mut split).unwrap();
        }
        dec.end(&mut split).unwrap();
        // Fragment boundaries differ by construction; everything else
        // must be identical.
        let visible = |events: &[String]| -> Vec<String> {
            events
                .iter()
                .filter(|e| !e.starts_with("frag/"))
                .cloned()
                .collect()
        };
        assert_eq!(visible(&whole.events), visible(&split.events));
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
    fn decodes_nested_submessage() {
        let frozen = submsg_pool();
        let events = decode(&frozen, 1, &[0x12, 0x03, 0x08, 0x2a]);
        let startsub = events.iter().position(|e| e.starts_with("startsub")).unwrap();
        let value = events.iter().position(|e| e == "int32/3=42").unwrap();
        let endsub = events.iter().position(|e| e.starts_with("endsub")).unwrap();
        assert!(startsub < value && value < endsub);
        // Inner start/end message events bracket the value too.
        assert_eq!(events.iter().filter(|e| *e == "startmsg").count(), 2);
        assert_eq!(events.iter().filter(|e| *e == "endmsg").count(), 2);
    }

    #[test]
    fn submessage_longer_than_parent_is_rejected() {
        let frozen = submsg_pool();
        let prog = Program::compile(&frozen.msgs[1]);
        let mut rec = Recorder::default();
        // Outer field 2 wraps a 2-byte region whose content claims a
        // 3-byte field of its own.
        let bytes = [0x12, 0x02, 0x12, 0x03];
        let err = decode_err(&prog, &bytes, &mut rec);
        assert!(matches!(
            err.kind,
            ErrorKind::SubmessageExtendsPastParent | ErrorKind::UnexpectedEof
        ));
    }

    fn decode_err(prog: &Program, bytes: &[u8], rec: &mut Recorder) -> Error {
        match decode_full(prog, bytes, rec) {
            Ok(()) => panic!("expected decode failure"),
            Err(e) => e,
        }
    }

    #[test]
    fn packed_repeated_values_arrive_in_one_sequence() {
        let mut pool = DefPool::new();
        let m = pool.add_msg("t.P").unwrap();
        pool.msg_set_syntax(m, Syntax::Proto3);
        pool.add_field(m, FieldBuilder::new("d", 3, FieldType::Int32, Label::Repeated))
            .unwrap();
        let frozen = pool.freeze(64).unwrap();
        // 3, 270, 86942 packed in field 3.
        let events = decode(&frozen, 0, &[0x1a, 0x06, 0x03, 0x8e, 0x02, 0x9e, 0xa7, 0x05]);
        let values: Vec<&String> = events.iter().filter(|e| e.starts_with("int32/")).collect();
        assert_eq!(values.len(), 3);
        assert!(values[0].ends_with("=3"));
        assert!(values[1].ends_with("=270"));
        assert!(values[2].ends_with("=86942"));
        assert_eq!(events.iter().filter(|e| e.starts_with("startseq")).count(), 1);
        assert_eq!(events.iter().filter(|e| e.starts_with("endseq")).count(), 1);
    }

    #[test]
    fn unpacked_encoding_of_packable_field_is_accepted() {
        let mut pool = DefPool::new();
        let m = pool.add_msg("t.P").unwrap();
        pool.msg_set_syntax(m, Syntax::Proto3);
        pool.add_field(m, FieldBuilder::new("d", 3, FieldType::Int32, Label::Repeated))
            .unwrap();
        let frozen = pool.freeze(64).unwrap();
        let events = decode(&frozen, 0, &[0x18, 0x01, 0x18, 0x02]);
        let values: Vec<&String> = events.iter().filter(|e| e.starts_with("int32/")).collect();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn unknown_field_is_skipped_and_delivered() {
        let frozen = scalar_pool();
        // Field 1 = 5, then unknown field 4 (varint) = 99.
        let events = decode(&frozen, 0, &[0x08, 0x05, 0x20, 0x63]);
        assert!(events.contains(&"int32/3=5".to_string()));
        assert!(events.iter().any(|e| e.starts_with("unknown:")));
        assert_eq!(events.last().map(String::as_str), Some("endmsg"));
    }

    #[test]
    fn group_fields_decode_as_submessages() {
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
        // START_GROUP(1), v=1, END_GROUP(1).
        let events = decode(&frozen, 1, &[0x0b, 0x08, 0x01, 0x0c]);
        assert!(events.iter().any(|e| e.starts_with("startsub")));
        assert!(events.contains(&"int32/3=1".to_string()));
        assert!(events.iter().any(|e| e.starts_with("endsub")));
    }

    #[test]
    fn unmatched_end_group_is_an_error() {
        let frozen = scalar_pool();
        let prog = Program::compile(&frozen.msgs[0]);
        let mut rec = Recorder::default();
        let err = decode_err(&prog, &[0x0c], &mut rec);
        assert_eq!(err.kind, ErrorKind::UnmatchedEndGroup);
    }

    #[test]
    fn truncated_stream_fails_at_end() {
        let frozen = scalar_pool();
        let prog = Program::compile(&frozen.msgs[0]);
        let mut rec = Recorder::default();
        let mut dec = Decoder::new(&prog);
        dec.feed(&[0x08], &mut rec).unwrap();
        assert_eq!(
            dec.end(&mut rec).unwrap_err().kind,
            ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn oversized_unknown_delimited_field_reports_skip_ahead() {
        let frozen = scalar_pool();
        let prog = Program::compile(&frozen.msgs[0]);
        let mut rec = Recorder::default();
        let mut dec = Decoder::new(&prog);
        // Unknown field 4, delimited, claiming 100 bytes with none present.
        let consumed = dec.feed(&[0x22, 0x64], &mut rec).unwrap();
        assert_eq!(consumed, 2 + 100);
        // Caller drops 100 bytes, then the stream continues normally.
        dec.feed(&[0x08, 0x07], &mut rec).unwrap();
        dec.end(&mut rec).unwrap();
        assert!(rec.events.contains(&"int32/3=7".to_string()));
    }

    #[test]
    fn long_unknown_group_split_across_feeds_is_rejected() {
        let frozen = scalar_pool();
        let prog = Program::compile(&frozen.msgs[0]);
        let mut rec = Recorder::default();
        let mut dec = Decoder::new(&prog);
        // Unknown group (field 4) wrapping a delimited field whose 20-byte
        // payload is cut off by the end of the feed. Group skipping holds
        // its position at the group tag, so everything since it is pending
        // at the suspend point and overflows the residual buffer.
        let mut bytes = vec![0x23, 0x2a, 0x14];
        bytes.extend_from_slice(&[0u8; 15]);
        let err = dec.feed(&bytes, &mut rec).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Failed);
        assert!(err.extra.contains("pending"));
    }

    #[test]
    fn empty_input_is_a_valid_empty_message() {
        let frozen = scalar_pool();
        let prog = Program::compile(&frozen.msgs[0]);
        let mut rec = Recorder::default();
        let mut dec = Decoder::new(&prog);
        dec.end(&mut rec).unwrap();
        assert_eq!(rec.events, vec!["startmsg".to_string(), "endmsg".to_string()]);
        assert!(dec.completed());
    }

    #[test]
    fn nesting_limit_is_enforced() {
        let mut pool = DefPool::new();
        let a = pool.add_msg("t.A").unwrap();
        pool.add_field(
            a,
            FieldBuilder::new("a", 1, FieldType::Message, Label::Optional).subdef_msg(a),
        )
        .unwrap();
        let frozen = pool.freeze(64).unwrap();
        let prog = Program::compile(&frozen.msgs[0]);
        // Deeply nested: each level is field 1, delimited.
        let mut bytes = Vec::new();
        for _ in 0..8 {
            let mut level = vec![0x0a, bytes.len() as u8];
            level.extend_from_slice(&bytes);
            bytes = level;
        }
        let mut rec = Recorder::default();
        let mut dec = Decoder::with_max_nesting(&prog, 4);
        let err = match dec.feed(&bytes, &mut rec) {
            Err(e) => e,
            Ok(_) => dec.end(&mut rec).unwrap_err(),
        };
        assert_eq!(err.kind, ErrorKind::NestingTooDeep);
    }
}

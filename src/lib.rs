// Copyright (c) 2024 the wirebuf authors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! # wirebuf
//!
//! A schema-driven [Protocol Buffers](https://protobuf.dev) runtime.
//!
//! The crate consumes a descriptor-defined message schema (either built
//! programmatically through [`defs::DefPool`] or loaded from a serialized
//! `google.protobuf.FileDescriptorSet` through [`descriptor`]) and
//! encodes/decodes message instances to and from the protobuf wire format.
//!
//! Decoding is performed by a resumable bytecode interpreter
//! ([`decoder::Decoder`]) compiled per message type ([`bytecode`]), which
//! drives a stream of typed field events into a [`sink::Sink`]. Encoding
//! reverses the flow: a walker ([`fill::walk_message`]) produces the same
//! events from an in-memory [`message`] and the [`encoder::Encoder`] sink
//! turns them back into bytes.

pub mod arena;
pub mod bytecode;
pub mod decoder;
pub mod defs;
pub mod descriptor;
pub mod encoder;
pub mod fill;
pub mod handlers;
pub mod json;
pub mod layout;
pub mod message;
pub mod sink;
pub mod symtab;
pub mod text;
pub mod wire;

mod bootstrap;
mod freeze;
mod table;

use core::fmt;

/// Field numbers are 29-bit; this is the largest legal value.
pub const MAX_FIELD_NUMBER: u32 = (1 << 29) - 1;

/// Default limit on nesting of submessages and groups while decoding.
pub const DEFAULT_MAX_NESTING: usize = 64;

/// Things that can go wrong when building descriptors or running the codec.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Generic failure; details are in the error's `extra` string.
    Failed,

    // -- malformed input ----------------------------------------------------
    /// A varint ran past the 10-byte maximum without terminating.
    UnterminatedVarint,
    /// A 32-bit varint (tag or length) did not fit in 32 bits.
    VarintOverflow,
    /// The input ended inside a value or inside a delimited region.
    UnexpectedEof,
    /// A length-delimited field extends past the end of its parent.
    SubmessageExtendsPastParent,
    /// Nesting of submessages/groups exceeded the configured limit.
    NestingTooDeep,
    /// A tag carried field number zero or above the 29-bit maximum.
    InvalidFieldNumber,
    /// A tag carried a wire type not in {0,1,2,3,4,5}.
    InvalidWireType(u8),
    /// An END_GROUP tag did not match the innermost open group.
    UnmatchedEndGroup,

    // -- schema violations --------------------------------------------------
    /// Two definitions claimed the same fullname, or two fields in one
    /// container claimed the same name or number.
    DuplicateSymbol,
    /// A symbolic subdef name was still unresolved at freeze time.
    UnresolvedSymbol,
    /// A field was frozen without a name, number, or type.
    IncompleteField,
    /// An enum definition had no values, or its default is not a member.
    BadEnum,
    /// `lazy` was set on a field that is not a length-delimited submessage.
    BadLazyField,
    /// A field whose subdef is a map entry was not repeated.
    BadMapField,
    /// A oneof member was not OPTIONAL, or already belonged to a oneof.
    BadOneofField,

    // -- handler / pipeline errors ------------------------------------------
    /// A start handler aborted the current message.
    HandlerBreak,
    /// A string handler consumed fewer bytes than it was offered.
    ShortStringHandler,

    // -- value conversion ----------------------------------------------------
    /// A JSON or text scalar did not fit the target field type.
    ValueOutOfRange,
    /// Invalid base64 in a JSON `bytes` field.
    InvalidBase64,
    /// Syntax error in a JSON document.
    JsonSyntax,
    /// A field name in a JSON object did not match the schema.
    UnknownJsonField,
}

/// Crate-wide error type: an [`ErrorKind`] plus free-form context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub extra: String,
}

impl Error {
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            extra: String::new(),
        }
    }

    /// Shorthand for a `Failed` error with a message.
    pub fn failed(extra: String) -> Self {
        Self {
            kind: ErrorKind::Failed,
            extra,
        }
    }
}

impl fmt::Write for Error {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.extra.push_str(s);
        Ok(())
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Failed => write!(f, "failed"),
            Self::UnterminatedVarint => write!(f, "unterminated varint"),
            Self::VarintOverflow => write!(f, "varint overflowed 32 bits"),
            Self::UnexpectedEof => write!(f, "unexpected end of input"),
            Self::SubmessageExtendsPastParent => {
                write!(f, "delimited field extends past enclosing region")
            }
            Self::NestingTooDeep => write!(f, "nesting too deep"),
            Self::InvalidFieldNumber => write!(f, "invalid field number"),
            Self::InvalidWireType(wt) => write!(f, "invalid wire type {wt}"),
            Self::UnmatchedEndGroup => write!(f, "unmatched END_GROUP tag"),
            Self::DuplicateSymbol => write!(f, "duplicate symbol"),
            Self::UnresolvedSymbol => write!(f, "unresolved type name"),
            Self::IncompleteField => write!(f, "field is missing a name, number, or type"),
            Self::BadEnum => write!(f, "enum has no values or a bad default"),
            Self::BadLazyField => write!(f, "lazy is only valid on message fields"),
            Self::BadMapField => write!(f, "map entry field must be repeated"),
            Self::BadOneofField => write!(f, "oneof member must be optional and unclaimed"),
            Self::HandlerBreak => write!(f, "handler aborted the message"),
            Self::ShortStringHandler => write!(f, "string handler consumed too few bytes"),
            Self::ValueOutOfRange => write!(f, "value out of range for field type"),
            Self::InvalidBase64 => write!(f, "invalid base64"),
            Self::JsonSyntax => write!(f, "JSON syntax error"),
            Self::UnknownJsonField => write!(f, "unknown field name in JSON object"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.extra.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.extra)
        }
    }
}

impl std::error::Error for Error {
    fn description(&self) -> &str {
        "wirebuf error"
    }
}

pub type Result<T> = core::result::Result<T, Error>;

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

//! Wire-format primitives: wire types, varints, zigzag, and tags.

use byteorder::{ByteOrder, LittleEndian};

use crate::{Error, ErrorKind, Result, MAX_FIELD_NUMBER};

/// The 3-bit framing category of a field on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireType {
    Varint = 0,
    Bits64 = 1,
    Delimited = 2,
    StartGroup = 3,
    EndGroup = 4,
    Bits32 = 5,
}

impl WireType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Varint),
            1 => Ok(Self::Bits64),
            2 => Ok(Self::Delimited),
            3 => Ok(Self::StartGroup),
            4 => Ok(Self::EndGroup),
            5 => Ok(Self::Bits32),
            other => Err(Error::from_kind(ErrorKind::InvalidWireType(other))),
        }
    }
}

/// The thirteen wire-level (descriptor) field types that are not groups or
/// end-group markers, plus the composite ones. Numbering matches
/// `google.protobuf.FieldDescriptorProto.Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum FieldType {
    Double = 1,
    Float = 2,
    Int64 = 3,
    UInt64 = 4,
    Int32 = 5,
    Fixed64 = 6,
    Fixed32 = 7,
    Bool = 8,
    String = 9,
    Group = 10,
    Message = 11,
    Bytes = 12,
    UInt32 = 13,
    Enum = 14,
    SFixed32 = 15,
    SFixed64 = 16,
    SInt32 = 17,
    SInt64 = 18,
}

impl FieldType {
    pub fn from_descriptor(v: i32) -> Result<Self> {
        match v {
            1 => Ok(Self::Double),
            2 => Ok(Self::Float),
            3 => Ok(Self::Int64),
            4 => Ok(Self::UInt64),
            5 => Ok(Self::Int32),
            6 => Ok(Self::Fixed64),
            7 => Ok(Self::Fixed32),
            8 => Ok(Self::Bool),
            9 => Ok(Self::String),
            10 => Ok(Self::Group),
            11 => Ok(Self::Message),
            12 => Ok(Self::Bytes),
            13 => Ok(Self::UInt32),
            14 => Ok(Self::Enum),
            15 => Ok(Self::SFixed32),
            16 => Ok(Self::SFixed64),
            17 => Ok(Self::SInt32),
            18 => Ok(Self::SInt64),
            _ => Err(Error::failed(format!("bad descriptor type {v}"))),
        }
    }

    /// The wire type this field type natively encodes with (repeated
    /// primitives may alternatively appear packed, i.e. `Delimited`).
    pub fn native_wire_type(self) -> WireType {
        match self {
            Self::Double | Self::Fixed64 | Self::SFixed64 => WireType::Bits64,
            Self::Float | Self::Fixed32 | Self::SFixed32 => WireType::Bits32,
            Self::Int32
            | Self::Int64
            | Self::UInt32
            | Self::UInt64
            | Self::SInt32
            | Self::SInt64
            | Self::Bool
            | Self::Enum => WireType::Varint,
            Self::String | Self::Bytes | Self::Message => WireType::Delimited,
            Self::Group => WireType::StartGroup,
        }
    }

    /// True for types that may appear in a packed repeated field.
    pub fn is_packable(self) -> bool {
        !matches!(
            self,
            Self::String | Self::Bytes | Self::Message | Self::Group
        )
    }

    pub fn is_string(self) -> bool {
        matches!(self, Self::String | Self::Bytes)
    }

    pub fn is_submessage(self) -> bool {
        matches!(self, Self::Message | Self::Group)
    }

    /// The integer sub-format: VARIABLE, FIXED, or ZIGZAG.
    pub fn int_format(self) -> Option<IntFormat> {
        match self {
            Self::Int32 | Self::Int64 | Self::UInt32 | Self::UInt64 | Self::Enum | Self::Bool => {
                Some(IntFormat::Variable)
            }
            Self::Fixed32 | Self::Fixed64 | Self::SFixed32 | Self::SFixed64 => {
                Some(IntFormat::Fixed)
            }
            Self::SInt32 | Self::SInt64 => Some(IntFormat::Zigzag),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntFormat {
    Variable,
    Fixed,
    Zigzag,
}

/// Longest legal varint: 10 bytes of payload.
pub const MAX_VARINT_LEN: usize = 10;

/// Encodes `v` as a varint into `buf`, returning the number of bytes written.
pub fn encode_varint(mut v: u64, buf: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut i = 0;
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf[i] = byte;
            return i + 1;
        }
        buf[i] = byte | 0x80;
        i += 1;
    }
}

/// Appends a varint to a byte vector.
pub fn put_varint(v: u64, out: &mut Vec<u8>) {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let n = encode_varint(v, &mut buf);
    out.extend_from_slice(&buf[..n]);
}

/// Number of bytes `v` occupies as a varint.
pub fn varint_size(v: u64) -> usize {
    if v == 0 {
        1
    } else {
        (64 - v.leading_zeros() as usize).div_ceil(7)
    }
}

/// Decodes one varint from the front of `buf`. Returns the value and the
/// number of bytes consumed. Errors if the varint is unterminated within
/// `buf` (`UnexpectedEof`) or overlong (`UnterminatedVarint`).
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut v: u64 = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(Error::from_kind(ErrorKind::UnterminatedVarint));
        }
        // Bits above position 63 fall off the end, matching the reference
        // decoders' tolerance for non-canonical tenth bytes.
        v |= u64::from(byte & 0x7f) << (7 * i as u64).min(63);
        if byte & 0x80 == 0 {
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(Error::from_kind(ErrorKind::UnterminatedVarint));
            }
            return Ok((v, i + 1));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        return Err(Error::from_kind(ErrorKind::UnterminatedVarint));
    }
    Err(Error::from_kind(ErrorKind::UnexpectedEof))
}

pub fn zigzag_encode_32(v: i32) -> u32 {
    ((v << 1) ^ (v >> 31)) as u32
}

pub fn zigzag_encode_64(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

pub fn zigzag_decode_32(v: u32) -> i32 {
    ((v >> 1) as i32) ^ -((v & 1) as i32)
}

pub fn zigzag_decode_64(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// Builds the varint tag value for `(field_number, wire_type)`.
pub fn make_tag(field_number: u32, wire_type: WireType) -> u32 {
    debug_assert!(field_number >= 1 && field_number <= MAX_FIELD_NUMBER);
    (field_number << 3) | wire_type as u32
}

/// The pre-encoded bytes of a tag, packed little-endian into a u64 with the
/// encoded length alongside. Tags are at most 5 bytes.
pub fn encoded_tag(field_number: u32, wire_type: WireType) -> (u64, usize) {
    let mut buf = [0u8; MAX_VARINT_LEN];
    let n = encode_varint(u64::from(make_tag(field_number, wire_type)), &mut buf);
    debug_assert!(n <= 5);
    let mut packed = [0u8; 8];
    packed[..n].copy_from_slice(&buf[..n]);
    (LittleEndian::read_u64(&packed), n)
}

pub fn read_fixed32(buf: &[u8]) -> u32 {
    LittleEndian::read_u32(&buf[..4])
}

pub fn read_fixed64(buf: &[u8]) -> u64 {
    LittleEndian::read_u64(&buf[..8])
}

pub fn put_fixed32(v: u32, out: &mut Vec<u8>) {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, v);
    out.extend_from_slice(&b);
}

pub fn put_fixed64(v: u64, out: &mut Vec<u8>) {
    let mut b = [0u8; 8];
    LittleEndian::write_u64(&mut b, v);
    out.extend_from_slice(&b);
}

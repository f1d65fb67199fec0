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

//! Dynamic message instances backed by an [`Arena`].
//!
//! A [`Message`] is a flat payload laid out by a [`MessageLayout`]: scalars
//! inline, everything variable-size (strings, submessages, arrays, maps)
//! behind a 4-byte handle into the arena's value store. Handle 0 means
//! unset, so a freshly zeroed payload is a valid empty message.
//!
//! Accessors are typed; the caller is responsible for matching the field's
//! declared type, as a generated-code layer would.

use std::collections::BTreeMap;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::arena::{Arena, RawRange};
use crate::defs::{FieldDef, MessageDef};
use crate::layout::MessageLayout;
use crate::wire::FieldType;

pub(crate) struct MsgInstance {
    pub layout: Arc<MessageLayout>,
    pub range: RawRange,
    /// Raw wire bytes of fields that did not match the descriptor.
    pub unknown: Vec<u8>,
}

/// Typed element storage for one repeated field.
pub(crate) enum ArrayData {
    I32(Vec<i32>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    U64(Vec<u64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Bool(Vec<bool>),
    Bytes(Vec<Vec<u8>>),
    Msg(Vec<u32>),
}

impl ArrayData {
    fn for_type(ty: FieldType) -> ArrayData {
        match ty {
            FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 | FieldType::Enum => {
                ArrayData::I32(Vec::new())
            }
            FieldType::UInt32 | FieldType::Fixed32 => ArrayData::U32(Vec::new()),
            FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64 => {
                ArrayData::I64(Vec::new())
            }
            FieldType::UInt64 | FieldType::Fixed64 => ArrayData::U64(Vec::new()),
            FieldType::Float => ArrayData::F32(Vec::new()),
            FieldType::Double => ArrayData::F64(Vec::new()),
            FieldType::Bool => ArrayData::Bool(Vec::new()),
            FieldType::String | FieldType::Bytes => ArrayData::Bytes(Vec::new()),
            FieldType::Message | FieldType::Group => ArrayData::Msg(Vec::new()),
        }
    }

    fn len(&self) -> usize {
        match self {
            ArrayData::I32(v) => v.len(),
            ArrayData::U32(v) => v.len(),
            ArrayData::I64(v) => v.len(),
            ArrayData::U64(v) => v.len(),
            ArrayData::F32(v) => v.len(),
            ArrayData::F64(v) => v.len(),
            ArrayData::Bool(v) => v.len(),
            ArrayData::Bytes(v) => v.len(),
            ArrayData::Msg(v) => v.len(),
        }
    }
}

pub(crate) struct ArrayInstance {
    pub elem: FieldType,
    pub data: ArrayData,
}

/// A map value in canonical storage form. Scalars are stored as the raw
/// bits of the value widened to 64 bits.
#[derive(Clone, PartialEq)]
pub(crate) enum MapValue {
    Scalar(u64),
    Bytes(Vec<u8>),
    Msg(u32),
}

pub(crate) struct MapInstance {
    pub key_ty: FieldType,
    pub val_ty: FieldType,
    /// Keyed by the canonical byte form of the key, so iteration order is
    /// deterministic.
    pub entries: BTreeMap<Vec<u8>, MapValue>,
}

/// Slab storage for everything a 4-byte handle can refer to. A handle is
/// the slab index plus one.
#[derive(Default)]
pub(crate) struct ValueStore {
    pub strings: Vec<Vec<u8>>,
    pub msgs: Vec<MsgInstance>,
    pub arrays: Vec<ArrayInstance>,
    pub maps: Vec<MapInstance>,
}

/// A typed map key. The canonical byte form (native little-endian bytes
/// for integers, one byte for bool, the raw bytes for strings) is the
/// map's internal key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MapKey {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    String(Vec<u8>),
}

impl MapKey {
    pub(crate) fn is_valid_key_type(ty: FieldType) -> bool {
        matches!(
            ty,
            FieldType::Bool
                | FieldType::Int32
                | FieldType::Int64
                | FieldType::UInt32
                | FieldType::UInt64
                | FieldType::SInt32
                | FieldType::SInt64
                | FieldType::Fixed32
                | FieldType::Fixed64
                | FieldType::SFixed32
                | FieldType::SFixed64
                | FieldType::String
        )
    }

    pub(crate) fn canonical(&self) -> Vec<u8> {
        match self {
            MapKey::Bool(b) => vec![u8::from(*b)],
            MapKey::Int32(v) => v.to_le_bytes().to_vec(),
            MapKey::Int64(v) => v.to_le_bytes().to_vec(),
            MapKey::UInt32(v) => v.to_le_bytes().to_vec(),
            MapKey::UInt64(v) => v.to_le_bytes().to_vec(),
            MapKey::String(s) => s.clone(),
        }
    }

    /// Reconstructs a key from its canonical bytes given the declared type.
    pub(crate) fn from_canonical(ty: FieldType, bytes: &[u8]) -> MapKey {
        match ty {
            FieldType::Bool => MapKey::Bool(bytes[0] != 0),
            FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 => {
                MapKey::Int32(LittleEndian::read_i32(bytes))
            }
            FieldType::UInt32 | FieldType::Fixed32 => MapKey::UInt32(LittleEndian::read_u32(bytes)),
            FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64 => {
                MapKey::Int64(LittleEndian::read_i64(bytes))
            }
            FieldType::UInt64 | FieldType::Fixed64 => MapKey::UInt64(LittleEndian::read_u64(bytes)),
            _ => MapKey::String(bytes.to_vec()),
        }
    }
}

/// A handle to one message instance in an arena.
#[derive(Clone, Copy)]
pub struct Message<'a> {
    arena: &'a Arena,
    pub(crate) handle: u32,
}

impl std::fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl<'a> Message<'a> {
    /// Allocates a fresh message with the layout's default contents.
    pub fn new(arena: &'a Arena, layout: &Arc<MessageLayout>) -> Message<'a> {
        let range = arena.alloc(None, layout.size() as usize);
        arena.write(range, 0, &layout.default_msg);
        let handle = {
            let mut store = arena.values.borrow_mut();
            store.msgs.push(MsgInstance {
                layout: Arc::clone(layout),
                range,
                unknown: Vec::new(),
            });
            store.msgs.len() as u32
        };
        Message { arena, handle }
    }

    pub(crate) fn from_handle(arena: &'a Arena, handle: u32) -> Message<'a> {
        debug_assert!(handle != 0);
        Message { arena, handle }
    }

    pub fn arena(&self) -> &'a Arena {
        self.arena
    }

    pub fn layout(&self) -> Arc<MessageLayout> {
        let store = self.arena.values.borrow();
        Arc::clone(&store.msgs[self.handle as usize - 1].layout)
    }

    pub fn def(&self) -> MessageDef {
        self.layout().def().clone()
    }

    fn range(&self) -> RawRange {
        let store = self.arena.values.borrow();
        store.msgs[self.handle as usize - 1].range
    }

    fn read_bytes_at<const N: usize>(&self, ofs: u32) -> [u8; N] {
        let mut buf = [0u8; N];
        self.arena.read(self.range(), ofs as usize, &mut buf);
        buf
    }

    fn write_bytes_at(&self, ofs: u32, bytes: &[u8]) {
        self.arena.write(self.range(), ofs as usize, bytes);
    }

    fn read_u32_at(&self, ofs: u32) -> u32 {
        u32::from_le_bytes(self.read_bytes_at::<4>(ofs))
    }

    fn write_u32_at(&self, ofs: u32, v: u32) {
        self.write_bytes_at(ofs, &v.to_le_bytes());
    }

    fn read_u64_at(&self, ofs: u32) -> u64 {
        u64::from_le_bytes(self.read_bytes_at::<8>(ofs))
    }

    fn write_u64_at(&self, ofs: u32, v: u64) {
        self.write_bytes_at(ofs, &v.to_le_bytes());
    }

    fn field_offset(&self, f: &FieldDef) -> u32 {
        self.layout().field(f.index()).offset
    }

    /// Marks presence: sets the hasbit, or claims the oneof by writing the
    /// field number into the case slot. Switching the active member zeroes
    /// the shared data slot so stale payload cannot leak through.
    fn mark_set(&self, f: &FieldDef) {
        let layout = self.layout();
        let fl = *layout.field(f.index());
        if let Some(oneof) = fl.oneof {
            let ol = layout.oneofs[oneof as usize];
            let prev = self.read_u32_at(ol.case_offset);
            if prev != f.number() {
                let width = self
                    .def()
                    .oneof(oneof as usize)
                    .fields()
                    .map(|m| crate::layout::slot_size(m.field_type(), false))
                    .max()
                    .unwrap_or(crate::layout::HANDLE_SIZE);
                self.write_bytes_at(ol.data_offset, &vec![0u8; width as usize]);
                self.write_u32_at(ol.case_offset, f.number());
            }
        } else if let Some(bit) = fl.hasbit {
            let mut byte = self.read_bytes_at::<1>(bit / 8);
            byte[0] |= 1 << (bit % 8);
            self.write_bytes_at(bit / 8, &byte);
        }
    }

    /// Presence test. Fields with explicit presence consult the hasbit or
    /// oneof case; other fields report whether the value differs from the
    /// default (nonzero scalar, nonempty string/array/map).
    pub fn has(&self, f: &FieldDef) -> bool {
        let layout = self.layout();
        let fl = *layout.field(f.index());
        if let Some(oneof) = fl.oneof {
            return self.read_u32_at(layout.oneofs[oneof as usize].case_offset) == f.number();
        }
        if let Some(bit) = fl.hasbit {
            return self.read_bytes_at::<1>(bit / 8)[0] & (1 << (bit % 8)) != 0;
        }
        if f.is_repeated() {
            return match self.get_array(f) {
                Some(a) => !a.is_empty(),
                None => false,
            };
        }
        match f.field_type() {
            FieldType::String | FieldType::Bytes => {
                self.get_bytes(f).map(|b| !b.is_empty()).unwrap_or(false)
            }
            FieldType::Message | FieldType::Group => self.read_u32_at(fl.offset) != 0,
            FieldType::Bool => self.read_bytes_at::<1>(fl.offset)[0] != 0,
            ty => match crate::layout::slot_size(ty, false) {
                4 => self.read_u32_at(fl.offset) != 0,
                _ => self.read_u64_at(fl.offset) != 0,
            },
        }
    }

    /// The field number of a oneof's active member, or 0 if none is set.
    pub fn oneof_case(&self, oneof_index: u32) -> u32 {
        let layout = self.layout();
        self.read_u32_at(layout.oneofs[oneof_index as usize].case_offset)
    }

    pub fn get_int32(&self, f: &FieldDef) -> i32 {
        self.read_u32_at(self.field_offset(f)) as i32
    }

    pub fn set_int32(&self, f: &FieldDef, v: i32) {
        self.mark_set(f);
        self.write_u32_at(self.field_offset(f), v as u32);
    }

    pub fn get_uint32(&self, f: &FieldDef) -> u32 {
        self.read_u32_at(self.field_offset(f))
    }

    pub fn set_uint32(&self, f: &FieldDef, v: u32) {
        self.mark_set(f);
        self.write_u32_at(self.field_offset(f), v);
    }

    pub fn get_int64(&self, f: &FieldDef) -> i64 {
        self.read_u64_at(self.field_offset(f)) as i64
    }

    pub fn set_int64(&self, f: &FieldDef, v: i64) {
        self.mark_set(f);
        self.write_u64_at(self.field_offset(f), v as u64);
    }

    pub fn get_uint64(&self, f: &FieldDef) -> u64 {
        self.read_u64_at(self.field_offset(f))
    }

    pub fn set_uint64(&self, f: &FieldDef, v: u64) {
        self.mark_set(f);
        self.write_u64_at(self.field_offset(f), v);
    }

    pub fn get_float(&self, f: &FieldDef) -> f32 {
        f32::from_bits(self.read_u32_at(self.field_offset(f)))
    }

    pub fn set_float(&self, f: &FieldDef, v: f32) {
        self.mark_set(f);
        self.write_u32_at(self.field_offset(f), v.to_bits());
    }

    pub fn get_double(&self, f: &FieldDef) -> f64 {
        f64::from_bits(self.read_u64_at(self.field_offset(f)))
    }

    pub fn set_double(&self, f: &FieldDef, v: f64) {
        self.mark_set(f);
        self.write_u64_at(self.field_offset(f), v.to_bits());
    }

    pub fn get_bool(&self, f: &FieldDef) -> bool {
        self.read_bytes_at::<1>(self.field_offset(f))[0] != 0
    }

    pub fn set_bool(&self, f: &FieldDef, v: bool) {
        self.mark_set(f);
        self.write_bytes_at(self.field_offset(f), &[u8::from(v)]);
    }

    /// Returns the string/bytes payload, or None when the field is unset.
    pub fn get_bytes(&self, f: &FieldDef) -> Option<Vec<u8>> {
        let handle = self.read_u32_at(self.field_offset(f));
        if handle == 0 {
            return None;
        }
        let store = self.arena.values.borrow();
        Some(store.strings[handle as usize - 1].clone())
    }

    pub fn set_bytes(&self, f: &FieldDef, v: &[u8]) {
        self.mark_set(f);
        let ofs = self.field_offset(f);
        let handle = self.read_u32_at(ofs);
        let mut store = self.arena.values.borrow_mut();
        if handle != 0 {
            store.strings[handle as usize - 1] = v.to_vec();
        } else {
            store.strings.push(v.to_vec());
            let handle = store.strings.len() as u32;
            drop(store);
            self.write_u32_at(ofs, handle);
        }
    }

    pub fn get_message(&self, f: &FieldDef) -> Option<Message<'a>> {
        let handle = self.read_u32_at(self.field_offset(f));
        if handle == 0 {
            None
        } else {
            Some(Message::from_handle(self.arena, handle))
        }
    }

    /// Returns the submessage, creating it (and marking presence) if unset.
    pub fn get_or_create_message(
        &self,
        f: &FieldDef,
        layout: &Arc<MessageLayout>,
    ) -> Message<'a> {
        if let Some(m) = self.get_message(f) {
            return m;
        }
        self.mark_set(f);
        let sub = Message::new(self.arena, layout);
        self.write_u32_at(self.field_offset(f), sub.handle);
        sub
    }

    pub fn get_array(&self, f: &FieldDef) -> Option<ArrayRef<'a>> {
        let handle = self.read_u32_at(self.field_offset(f));
        if handle == 0 {
            None
        } else {
            Some(ArrayRef {
                arena: self.arena,
                handle,
            })
        }
    }

    pub fn get_or_create_array(&self, f: &FieldDef) -> ArrayRef<'a> {
        if let Some(a) = self.get_array(f) {
            return a;
        }
        let handle = {
            let mut store = self.arena.values.borrow_mut();
            store.arrays.push(ArrayInstance {
                elem: f.field_type(),
                data: ArrayData::for_type(f.field_type()),
            });
            store.arrays.len() as u32
        };
        self.write_u32_at(self.field_offset(f), handle);
        ArrayRef {
            arena: self.arena,
            handle,
        }
    }

    pub fn get_map(&self, f: &FieldDef) -> Option<MapRef<'a>> {
        let handle = self.read_u32_at(self.field_offset(f));
        if handle == 0 {
            None
        } else {
            Some(MapRef {
                arena: self.arena,
                handle,
            })
        }
    }

    pub fn get_or_create_map(&self, f: &FieldDef) -> MapRef<'a> {
        if let Some(m) = self.get_map(f) {
            return m;
        }
        let entry = f
            .message_subdef()
            .filter(|m| m.is_map_entry())
            .unwrap_or_else(|| self.def());
        let key_ty = entry
            .field_by_number(1)
            .map(|k| k.field_type())
            .unwrap_or(FieldType::String);
        let val_ty = entry
            .field_by_number(2)
            .map(|v| v.field_type())
            .unwrap_or(FieldType::String);
        let handle = {
            let mut store = self.arena.values.borrow_mut();
            store.maps.push(MapInstance {
                key_ty,
                val_ty,
                entries: BTreeMap::new(),
            });
            store.maps.len() as u32
        };
        self.write_u32_at(self.field_offset(f), handle);
        MapRef {
            arena: self.arena,
            handle,
        }
    }

    /// Clears a field back to its default: resets hasbit/oneof case and
    /// zeroes the payload slot.
    pub fn clear(&self, f: &FieldDef) {
        let layout = self.layout();
        let fl = *layout.field(f.index());
        if let Some(oneof) = fl.oneof {
            let ol = layout.oneofs[oneof as usize];
            if self.read_u32_at(ol.case_offset) == f.number() {
                self.write_u32_at(ol.case_offset, 0);
            } else {
                return;
            }
        } else if let Some(bit) = fl.hasbit {
            let mut byte = self.read_bytes_at::<1>(bit / 8);
            byte[0] &= !(1 << (bit % 8));
            self.write_bytes_at(bit / 8, &byte);
        }
        let slot = crate::layout::slot_size(f.field_type(), f.is_repeated());
        self.write_bytes_at(fl.offset, &vec![0u8; slot as usize]);
    }

    pub fn append_unknown(&self, bytes: &[u8]) {
        let mut store = self.arena.values.borrow_mut();
        store.msgs[self.handle as usize - 1]
            .unknown
            .extend_from_slice(bytes);
    }

    pub fn unknown(&self) -> Vec<u8> {
        let store = self.arena.values.borrow();
        store.msgs[self.handle as usize - 1].unknown.clone()
    }

    /// Deep structural equality over known fields (unknown bytes excluded).
    pub fn deep_eq(&self, other: &Message) -> bool {
        let def = self.def();
        if def != other.def() {
            return false;
        }
        for f in def.fields() {
            if self.has(&f) != other.has(&f) {
                return false;
            }
            if !self.has(&f) {
                continue;
            }
            if f.is_map() {
                let (a, b) = (self.get_or_create_map(&f), other.get_or_create_map(&f));
                if !a.deep_eq(&b) {
                    return false;
                }
            } else if f.is_repeated() {
                let (a, b) = (self.get_or_create_array(&f), other.get_or_create_array(&f));
                if !a.deep_eq(&b) {
                    return false;
                }
            } else if f.is_submessage() {
                match (self.get_message(&f), other.get_message(&f)) {
                    (Some(a), Some(b)) => {
                        if !a.deep_eq(&b) {
                            return false;
                        }
                    }
                    (None, None) => {}
                    _ => return false,
                }
            } else if !scalar_eq(self, other, &f) {
                return false;
            }
        }
        true
    }
}

fn scalar_eq(a: &Message, b: &Message, f: &FieldDef) -> bool {
    match f.field_type() {
        FieldType::Bool => a.get_bool(f) == b.get_bool(f),
        FieldType::Float => a.get_float(f).to_bits() == b.get_float(f).to_bits(),
        FieldType::Double => a.get_double(f).to_bits() == b.get_double(f).to_bits(),
        FieldType::String | FieldType::Bytes => a.get_bytes(f) == b.get_bytes(f),
        FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 | FieldType::Enum => {
            a.get_int32(f) == b.get_int32(f)
        }
        FieldType::UInt32 | FieldType::Fixed32 => a.get_uint32(f) == b.get_uint32(f),
        FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64 => {
            a.get_int64(f) == b.get_int64(f)
        }
        _ => a.get_uint64(f) == b.get_uint64(f),
    }
}

/// A handle to a repeated field's element storage.
#[derive(Clone, Copy)]
pub struct ArrayRef<'a> {
    arena: &'a Arena,
    handle: u32,
}

macro_rules! array_accessors {
    ($push:ident, $get:ident, $variant:ident, $ty:ty) => {
        pub fn $push(&self, v: $ty) {
            let mut store = self.arena.values.borrow_mut();
            match &mut store.arrays[self.handle as usize - 1].data {
                ArrayData::$variant(vec) => vec.push(v),
                _ => panic!(concat!(stringify!($push), " on mistyped array")),
            }
        }

        pub fn $get(&self, i: usize) -> $ty {
            let store = self.arena.values.borrow();
            match &store.arrays[self.handle as usize - 1].data {
                ArrayData::$variant(vec) => vec[i].clone(),
                _ => panic!(concat!(stringify!($get), " on mistyped array")),
            }
        }
    };
}

impl<'a> ArrayRef<'a> {
    pub fn len(&self) -> usize {
        let store = self.arena.values.borrow();
        store.arrays[self.handle as usize - 1].data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element_type(&self) -> FieldType {
        let store = self.arena.values.borrow();
        store.arrays[self.handle as usize - 1].elem
    }

    array_accessors!(push_int32, get_int32, I32, i32);
    array_accessors!(push_uint32, get_uint32, U32, u32);
    array_accessors!(push_int64, get_int64, I64, i64);
    array_accessors!(push_uint64, get_uint64, U64, u64);
    array_accessors!(push_float, get_float, F32, f32);
    array_accessors!(push_double, get_double, F64, f64);
    array_accessors!(push_bool, get_bool, Bool, bool);
    array_accessors!(push_bytes, get_bytes, Bytes, Vec<u8>);

    /// Appends a fresh submessage element and returns it.
    pub fn push_message(&self, layout: &Arc<MessageLayout>) -> Message<'a> {
        let msg = Message::new(self.arena, layout);
        let mut store = self.arena.values.borrow_mut();
        match &mut store.arrays[self.handle as usize - 1].data {
            ArrayData::Msg(vec) => vec.push(msg.handle),
            _ => panic!("push_message on mistyped array"),
        }
        msg
    }

    pub fn get_message(&self, i: usize) -> Message<'a> {
        let store = self.arena.values.borrow();
        match &store.arrays[self.handle as usize - 1].data {
            ArrayData::Msg(vec) => Message::from_handle(self.arena, vec[i]),
            _ => panic!("get_message on mistyped array"),
        }
    }

    pub fn deep_eq(&self, other: &ArrayRef) -> bool {
        if self.len() != other.len() || self.element_type() != other.element_type() {
            return false;
        }
        let n = self.len();
        match self.element_type() {
            FieldType::Message | FieldType::Group => {
                (0..n).all(|i| self.get_message(i).deep_eq(&other.get_message(i)))
            }
            FieldType::String | FieldType::Bytes => {
                (0..n).all(|i| self.get_bytes(i) == other.get_bytes(i))
            }
            FieldType::Bool => (0..n).all(|i| self.get_bool(i) == other.get_bool(i)),
            FieldType::Float => {
                (0..n).all(|i| self.get_float(i).to_bits() == other.get_float(i).to_bits())
            }
            FieldType::Double => {
                (0..n).all(|i| self.get_double(i).to_bits() == other.get_double(i).to_bits())
            }
            FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 | FieldType::Enum => {
                (0..n).all(|i| self.get_int32(i) == other.get_int32(i))
            }
            FieldType::UInt32 | FieldType::Fixed32 => {
                (0..n).all(|i| self.get_uint32(i) == other.get_uint32(i))
            }
            FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64 => {
                (0..n).all(|i| self.get_int64(i) == other.get_int64(i))
            }
            _ => (0..n).all(|i| self.get_uint64(i) == other.get_uint64(i)),
        }
    }
}

/// A handle to a map field's entry storage.
#[derive(Clone, Copy)]
pub struct MapRef<'a> {
    arena: &'a Arena,
    handle: u32,
}

impl<'a> MapRef<'a> {
    pub fn len(&self) -> usize {
        let store = self.arena.values.borrow();
        store.maps[self.handle as usize - 1].entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn key_type(&self) -> FieldType {
        let store = self.arena.values.borrow();
        store.maps[self.handle as usize - 1].key_ty
    }

    pub fn value_type(&self) -> FieldType {
        let store = self.arena.values.borrow();
        store.maps[self.handle as usize - 1].val_ty
    }

    /// All keys in iteration order (stable between mutations).
    pub fn keys(&self) -> Vec<MapKey> {
        let store = self.arena.values.borrow();
        let map = &store.maps[self.handle as usize - 1];
        map.entries
            .keys()
            .map(|k| MapKey::from_canonical(map.key_ty, k))
            .collect()
    }

    pub fn contains(&self, key: &MapKey) -> bool {
        let store = self.arena.values.borrow();
        store.maps[self.handle as usize - 1]
            .entries
            .contains_key(&key.canonical())
    }

    pub fn remove(&self, key: &MapKey) -> bool {
        let mut store = self.arena.values.borrow_mut();
        store.maps[self.handle as usize - 1]
            .entries
            .remove(&key.canonical())
            .is_some()
    }

    pub(crate) fn insert_raw(&self, key: Vec<u8>, value: MapValue) {
        let mut store = self.arena.values.borrow_mut();
        store.maps[self.handle as usize - 1]
            .entries
            .insert(key, value);
    }

    fn get_raw(&self, key: &MapKey) -> Option<MapValue> {
        let store = self.arena.values.borrow();
        store.maps[self.handle as usize - 1]
            .entries
            .get(&key.canonical())
            .cloned()
    }

    pub fn insert_scalar(&self, key: &MapKey, bits: u64) {
        self.insert_raw(key.canonical(), MapValue::Scalar(bits));
    }

    pub fn insert_bytes(&self, key: &MapKey, v: &[u8]) {
        self.insert_raw(key.canonical(), MapValue::Bytes(v.to_vec()));
    }

    /// Inserts a fresh message value for the key, replacing any old one.
    pub fn insert_message(&self, key: &MapKey, layout: &Arc<MessageLayout>) -> Message<'a> {
        let msg = Message::new(self.arena, layout);
        self.insert_raw(key.canonical(), MapValue::Msg(msg.handle));
        msg
    }

    /// Raw scalar bits for the key, interpreted by the value type.
    pub fn get_scalar(&self, key: &MapKey) -> Option<u64> {
        match self.get_raw(key)? {
            MapValue::Scalar(bits) => Some(bits),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &MapKey) -> Option<Vec<u8>> {
        match self.get_raw(key)? {
            MapValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn get_message(&self, key: &MapKey) -> Option<Message<'a>> {
        match self.get_raw(key)? {
            MapValue::Msg(h) => Some(Message::from_handle(self.arena, h)),
            _ => None,
        }
    }

    pub fn deep_eq(&self, other: &MapRef) -> bool {
        if self.len() != other.len() || self.value_type() != other.value_type() {
            return false;
        }
        for key in self.keys() {
            let eq = match (self.get_raw(&key), other.get_raw(&key)) {
                (Some(MapValue::Msg(a)), Some(MapValue::Msg(b))) => {
                    Message::from_handle(self.arena, a)
                        .deep_eq(&Message::from_handle(other.arena, b))
                }
                (Some(a), Some(b)) => a == b,
                _ => false,
            };
            if !eq {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{DefPool, DefaultValue, FieldBuilder, Label, Syntax};
    use crate::layout::LayoutCache;

    fn test_pool() -> crate::defs::FrozenSet {
        let mut pool = DefPool::new();
        let inner = pool.add_msg("t.Inner").unwrap();
        pool.msg_set_syntax(inner, Syntax::Proto3);
        pool.add_field(inner, FieldBuilder::new("v", 1, FieldType::Int32, Label::Optional))
            .unwrap();
        let m = pool.add_msg("t.M").unwrap();
        pool.msg_set_syntax(m, Syntax::Proto3);
        pool.add_field(m, FieldBuilder::new("i", 1, FieldType::Int32, Label::Optional))
            .unwrap();
        pool.add_field(m, FieldBuilder::new("s", 2, FieldType::String, Label::Optional))
            .unwrap();
        pool.add_field(
            m,
            FieldBuilder::new("sub", 3, FieldType::Message, Label::Optional).subdef_msg(inner),
        )
        .unwrap();
        pool.add_field(m, FieldBuilder::new("r", 4, FieldType::Int64, Label::Repeated))
            .unwrap();
        pool.add_oneof(
            m,
            "u",
            vec![
                FieldBuilder::new("a", 5, FieldType::Int32, Label::Optional),
                FieldBuilder::new("b", 6, FieldType::String, Label::Optional),
            ],
        )
        .unwrap();
        pool.add_map_field(
            m,
            "counts",
            7,
            FieldType::String,
            FieldBuilder::new("v", 2, FieldType::Int64, Label::Optional),
        )
        .unwrap();
        pool.freeze(64).unwrap()
    }

    #[test]
    fn scalar_round_trip() {
        let frozen = test_pool();
        let def = &frozen.msgs[1];
        let cache = LayoutCache::new();
        let arena = Arena::new();
        let msg = Message::new(&arena, &cache.get(def));
        let i = def.field_by_name("i").unwrap();
        assert!(!msg.has(&i));
        assert_eq!(msg.get_int32(&i), 0);
        msg.set_int32(&i, -5);
        assert!(msg.has(&i));
        assert_eq!(msg.get_int32(&i), -5);
    }

    #[test]
    fn string_set_and_overwrite() {
        let frozen = test_pool();
        let def = &frozen.msgs[1];
        let cache = LayoutCache::new();
        let arena = Arena::new();
        let msg = Message::new(&arena, &cache.get(def));
        let s = def.field_by_name("s").unwrap();
        assert_eq!(msg.get_bytes(&s), None);
        msg.set_bytes(&s, b"hello");
        assert_eq!(msg.get_bytes(&s).unwrap(), b"hello");
        msg.set_bytes(&s, b"bye");
        assert_eq!(msg.get_bytes(&s).unwrap(), b"bye");
    }

    #[test]
    fn submessage_lazily_created() {
        let frozen = test_pool();
        let def = &frozen.msgs[1];
        let cache = LayoutCache::new();
        let arena = Arena::new();
        let msg = Message::new(&arena, &cache.get(def));
        let subf = def.field_by_name("sub").unwrap();
        assert!(msg.get_message(&subf).is_none());
        let sub_layout = cache.get(&subf.message_subdef().unwrap());
        let sub = msg.get_or_create_message(&subf, &sub_layout);
        let v = sub.def().field_by_name("v").unwrap();
        sub.set_int32(&v, 9);
        assert_eq!(msg.get_message(&subf).unwrap().get_int32(&v), 9);
    }

    #[test]
    fn oneof_members_displace_each_other() {
        let frozen = test_pool();
        let def = &frozen.msgs[1];
        let cache = LayoutCache::new();
        let arena = Arena::new();
        let msg = Message::new(&arena, &cache.get(def));
        let a = def.field_by_name("a").unwrap();
        let b = def.field_by_name("b").unwrap();
        msg.set_int32(&a, 7);
        assert!(msg.has(&a));
        assert_eq!(msg.oneof_case(0), 5);
        msg.set_bytes(&b, b"hi");
        assert!(!msg.has(&a));
        assert!(msg.has(&b));
        assert_eq!(msg.oneof_case(0), 6);
        assert_eq!(msg.get_bytes(&b).unwrap(), b"hi");
    }

    #[test]
    fn repeated_push_and_get() {
        let frozen = test_pool();
        let def = &frozen.msgs[1];
        let cache = LayoutCache::new();
        let arena = Arena::new();
        let msg = Message::new(&arena, &cache.get(def));
        let r = def.field_by_name("r").unwrap();
        assert!(msg.get_array(&r).is_none());
        let arr = msg.get_or_create_array(&r);
        arr.push_int64(3);
        arr.push_int64(-270);
        assert_eq!(arr.len(), 2);
        assert_eq!(arr.get_int64(1), -270);
        assert!(msg.has(&r));
    }

    #[test]
    fn map_insert_replace_and_iterate() {
        let frozen = test_pool();
        let def = &frozen.msgs[1];
        let cache = LayoutCache::new();
        let arena = Arena::new();
        let msg = Message::new(&arena, &cache.get(def));
        let f = def.field_by_name("counts").unwrap();
        let map = msg.get_or_create_map(&f);
        let k1 = MapKey::String(b"one".to_vec());
        let k2 = MapKey::String(b"two".to_vec());
        map.insert_scalar(&k1, 1);
        map.insert_scalar(&k2, 2);
        map.insert_scalar(&k1, 10);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get_scalar(&k1), Some(10));
        assert!(map.remove(&k2));
        assert_eq!(map.len(), 1);
        assert_eq!(map.keys(), vec![k1]);
    }

    #[test]
    fn proto2_defaults_visible_through_getters() {
        let mut pool = DefPool::new();
        let m = pool.add_msg("t.P").unwrap();
        pool.add_field(
            m,
            FieldBuilder::new("x", 1, FieldType::Int32, Label::Optional)
                .default_value(DefaultValue::Int32(41)),
        )
        .unwrap();
        let frozen = pool.freeze(64).unwrap();
        let cache = LayoutCache::new();
        let arena = Arena::new();
        let msg = Message::new(&arena, &cache.get(&frozen.msgs[0]));
        let x = frozen.msgs[0].field_by_name("x").unwrap();
        assert!(!msg.has(&x));
        assert_eq!(msg.get_int32(&x), 41);
        msg.set_int32(&x, 0);
        assert!(msg.has(&x));
        assert_eq!(msg.get_int32(&x), 0);
    }

    #[test]
    fn deep_eq_detects_differences() {
        let frozen = test_pool();
        let def = &frozen.msgs[1];
        let cache = LayoutCache::new();
        let arena = Arena::new();
        let layout = cache.get(def);
        let m1 = Message::new(&arena, &layout);
        let m2 = Message::new(&arena, &layout);
        let i = def.field_by_name("i").unwrap();
        assert!(m1.deep_eq(&m2));
        m1.set_int32(&i, 1);
        assert!(!m1.deep_eq(&m2));
        m2.set_int32(&i, 1);
        assert!(m1.deep_eq(&m2));
    }
}

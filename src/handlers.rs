//! Selector assignment and per-message handler tables.
//!
//! Every field of a frozen message owns a contiguous block of selector
//! slots, assigned at freeze time: `[startseq][endseq]` for repeated
//! fields, then the value (or string trio) slot, with STARTSUBMSG
//! selectors packed at the front of the table so the same index addresses
//! the per-field submessage slot. Three static selectors (start/end of
//! message and unknown fields) precede everything.
//!
//! A [`Handlers`] table inverts the mapping: given a selector seen on the
//! wire-event stream, it answers which field and event kind it stands for.
//! Tables are memoized per message definition by a [`HandlerCache`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::defs::{FieldDef, MessageDef, STATIC_SELECTOR_COUNT};
use crate::wire::FieldType;

/// An index into a message's handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Selector(pub u32);

impl Selector {
    pub const START_MSG: Selector = Selector(crate::defs::STARTMSG_SELECTOR);
    pub const END_MSG: Selector = Selector(crate::defs::ENDMSG_SELECTOR);
    pub const UNKNOWN: Selector = Selector(crate::defs::UNKNOWN_SELECTOR);
}

/// The full set of event kinds a field can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerType {
    Int32,
    Int64,
    UInt32,
    UInt64,
    Float,
    Double,
    Bool,
    StartStr,
    String,
    EndStr,
    StartSeq,
    EndSeq,
    StartSubMsg,
    EndSubMsg,
}

/// The value event kind for a scalar field type, if it has one.
pub fn value_handler_type(ty: FieldType) -> Option<HandlerType> {
    Some(match ty {
        FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 | FieldType::Enum => {
            HandlerType::Int32
        }
        FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64 => HandlerType::Int64,
        FieldType::UInt32 | FieldType::Fixed32 => HandlerType::UInt32,
        FieldType::UInt64 | FieldType::Fixed64 => HandlerType::UInt64,
        FieldType::Float => HandlerType::Float,
        FieldType::Double => HandlerType::Double,
        FieldType::Bool => HandlerType::Bool,
        FieldType::String | FieldType::Bytes | FieldType::Message | FieldType::Group => {
            return None
        }
    })
}

/// Computes the selector for one event kind of one field, or None when the
/// field kind does not produce that event.
pub fn selector(f: &FieldDef, ty: HandlerType) -> Option<Selector> {
    let base = f.selector_base();
    let sel = match ty {
        HandlerType::Int32
        | HandlerType::Int64
        | HandlerType::UInt32
        | HandlerType::UInt64
        | HandlerType::Float
        | HandlerType::Double
        | HandlerType::Bool => {
            if value_handler_type(f.field_type()) != Some(ty) {
                return None;
            }
            base
        }
        HandlerType::String => {
            if !f.is_string() {
                return None;
            }
            base
        }
        HandlerType::StartStr => {
            if !f.is_string() {
                return None;
            }
            base + 1
        }
        HandlerType::EndStr => {
            if !f.is_string() {
                return None;
            }
            base + 2
        }
        HandlerType::StartSeq => {
            if !f.is_repeated() {
                return None;
            }
            base - 2
        }
        HandlerType::EndSeq => {
            if !f.is_repeated() {
                return None;
            }
            base - 1
        }
        HandlerType::StartSubMsg => {
            if !f.is_submessage() {
                return None;
            }
            // Packed at the start of the table so the selector doubles as
            // the submessage-field slot index.
            f.index() + STATIC_SELECTOR_COUNT
        }
        HandlerType::EndSubMsg => {
            if !f.is_submessage() {
                return None;
            }
            base
        }
    };
    Some(Selector(sel))
}

/// What one slot of a handler table stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMeaning {
    Unset,
    Static,
    /// Field event: frozen field index plus the event kind.
    Field(u32, HandlerType),
}

/// The frozen selector table of one message definition.
pub struct Handlers {
    def: MessageDef,
    slots: Vec<SlotMeaning>,
}

impl Handlers {
    pub fn new(def: &MessageDef) -> Arc<Handlers> {
        let mut slots = vec![SlotMeaning::Unset; def.selector_count() as usize];
        slots[Selector::START_MSG.0 as usize] = SlotMeaning::Static;
        slots[Selector::END_MSG.0 as usize] = SlotMeaning::Static;
        slots[Selector::UNKNOWN.0 as usize] = SlotMeaning::Static;
        for f in def.fields() {
            let idx = f.index();
            let mut fill = |ty: HandlerType| {
                if let Some(sel) = selector(&f, ty) {
                    debug_assert_eq!(slots[sel.0 as usize], SlotMeaning::Unset);
                    slots[sel.0 as usize] = SlotMeaning::Field(idx, ty);
                }
            };
            if let Some(v) = value_handler_type(f.field_type()) {
                fill(v);
            }
            fill(HandlerType::String);
            fill(HandlerType::StartStr);
            fill(HandlerType::EndStr);
            fill(HandlerType::StartSeq);
            fill(HandlerType::EndSeq);
            fill(HandlerType::StartSubMsg);
            fill(HandlerType::EndSubMsg);
        }
        Arc::new(Handlers {
            def: def.clone(),
            slots,
        })
    }

    pub fn def(&self) -> &MessageDef {
        &self.def
    }

    pub fn selector_count(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn meaning(&self, sel: Selector) -> SlotMeaning {
        self.slots
            .get(sel.0 as usize)
            .copied()
            .unwrap_or(SlotMeaning::Unset)
    }

    /// The field a selector belongs to.
    pub fn field(&self, sel: Selector) -> Option<FieldDef> {
        match self.meaning(sel) {
            SlotMeaning::Field(idx, _) => Some(self.def.field(idx as usize)),
            _ => None,
        }
    }

    /// The submessage definition behind a STARTSUBMSG selector.
    pub fn subdef(&self, sel: Selector) -> Option<MessageDef> {
        match self.meaning(sel) {
            SlotMeaning::Field(idx, HandlerType::StartSubMsg) => {
                self.def.field(idx as usize).message_subdef()
            }
            _ => None,
        }
    }
}

/// Memoizes one [`Handlers`] table per message definition. Cyclic message
/// graphs are fine: tables reference submessages by definition, and the
/// cache resolves them on demand.
#[derive(Default)]
pub struct HandlerCache {
    tables: Mutex<HashMap<MessageDef, Arc<Handlers>>>,
}

impl HandlerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, def: &MessageDef) -> Arc<Handlers> {
        let mut tables = match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            tables
                .entry(def.clone())
                .or_insert_with(|| Handlers::new(def)),
        )
    }
}

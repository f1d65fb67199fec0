//! Compiles frozen message definitions into decoder bytecode.
//!
//! One [`Program`] holds the bytecode and dispatch tables for a root
//! message and every message reachable from it. Each message gets one
//! method: a straight-line fast path that speculates fields arrive in
//! declaration order (checked by tag-compare ops that fall back to the
//! dispatch sequence on mismatch), plus a dispatch table keyed by field
//! number for out-of-order fields.
//!
//! Dispatch values pack `(offset << 16) | (wiretype2 << 8) | wiretype1`,
//! where the offset is relative to the method base. When a field accepts
//! two wire types (packed and unpacked repeated primitives), the second
//! offset lives at key `fieldnum + MAX_FIELD_NUMBER`. Key 0 holds the
//! offset of the method's end-of-message sequence, reached when a group's
//! END_GROUP tag arrives.

use std::collections::{HashMap, HashSet};

use crate::defs::{FieldDef, MessageDef};
use crate::handlers::{selector, HandlerType, Selector};
use crate::table::IntTable;
use crate::wire::{encoded_tag, FieldType, WireType};
use crate::MAX_FIELD_NUMBER;

/// Scalar parse flavor; enums parse as int32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueKind {
    Double,
    Float,
    Int64,
    UInt64,
    Int32,
    Fixed64,
    Fixed32,
    Bool,
    UInt32,
    SFixed32,
    SFixed64,
    SInt32,
    SInt64,
}

impl ValueKind {
    fn from_type(ty: FieldType) -> Option<ValueKind> {
        Some(match ty {
            FieldType::Double => ValueKind::Double,
            FieldType::Float => ValueKind::Float,
            FieldType::Int64 => ValueKind::Int64,
            FieldType::UInt64 => ValueKind::UInt64,
            FieldType::Int32 | FieldType::Enum => ValueKind::Int32,
            FieldType::Fixed64 => ValueKind::Fixed64,
            FieldType::Fixed32 => ValueKind::Fixed32,
            FieldType::Bool => ValueKind::Bool,
            FieldType::UInt32 => ValueKind::UInt32,
            FieldType::SFixed32 => ValueKind::SFixed32,
            FieldType::SFixed64 => ValueKind::SFixed64,
            FieldType::SInt32 => ValueKind::SInt32,
            FieldType::SInt64 => ValueKind::SInt64,
            _ => return None,
        })
    }
}

/// One VM instruction. Jump targets are absolute instruction indexes.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Op {
    /// Parse one scalar value and deliver it through the selector.
    Value { kind: ValueKind, sel: Selector },
    StartMsg,
    EndMsg,
    StartSeq(Selector),
    EndSeq(Selector),
    StartSubMsg(Selector),
    EndSubMsg(Selector),
    StartStr(Selector),
    /// Stream string bytes up to the current delimited end.
    StrFrag(Selector),
    EndStr(Selector),
    /// Read a length prefix and push a delimited frame ending there.
    PushLenDelim,
    /// Push a frame bounded by a tag, not a length: the argument is the
    /// group field number to match against END_GROUP (0 for sequences).
    PushTagDelim(u32),
    Pop,
    /// Jump if the current frame's delimited region is exhausted.
    CheckDelim(u32),
    Branch(u32),
    /// Compare the next bytes against an encoded tag: consume on match,
    /// jump without consuming on mismatch.
    Tag { tag: u64, tag_len: u8, jump: u32 },
    Call(u32),
    Ret,
    /// Make the given method's dispatch table the active one for the
    /// current frame.
    SetDispatch(u32),
    /// Read a tag and jump through the active dispatch table; unmatched
    /// fields are skipped, delivered as unknown, and dispatch repeats.
    Dispatch,
    Halt,
}

pub(crate) const DISPATCH_ENDMSG: u64 = 0;

pub(crate) fn pack_dispatch(ofs: u64, wt1: u8, wt2: u8) -> u64 {
    (ofs << 16) | (u64::from(wt2) << 8) | u64::from(wt1)
}

pub(crate) struct Method {
    pub def: MessageDef,
    pub base: u32,
    pub dispatch: IntTable<u64>,
}

/// Compiled bytecode for a root message and everything reachable from it.
pub struct Program {
    pub(crate) ops: Vec<Op>,
    pub(crate) methods: Vec<Method>,
    by_def: HashMap<MessageDef, u32>,
}

impl Program {
    /// Compiles the root message and all reachable submessage types.
    pub fn compile(root: &MessageDef) -> Program {
        let mut defs = Vec::new();
        let mut seen = HashSet::new();
        find_methods(root, &mut defs, &mut seen);

        // Call targets need every method's base, which is only known
        // after a full emission. Emission length does not depend on the
        // targets, so a second pass with the first pass's bases links
        // every call, including calls into cycles.
        let (_, bases) = compile_pass(&defs, &HashMap::new());
        let ((ops, methods), linked_bases) = compile_pass(&defs, &bases);
        debug_assert_eq!(bases, linked_bases);

        let by_def = defs
            .iter()
            .enumerate()
            .map(|(i, d)| (d.clone(), i as u32))
            .collect();
        Program {
            ops,
            methods,
            by_def,
        }
    }

    pub(crate) fn method_for(&self, def: &MessageDef) -> Option<u32> {
        self.by_def.get(def).copied()
    }

    pub(crate) fn method(&self, id: u32) -> &Method {
        &self.methods[id as usize]
    }

    /// The method for the message the program was compiled against.
    pub fn root_method(&self) -> u32 {
        0
    }
}

fn compile_pass(
    defs: &[MessageDef],
    bases: &HashMap<MessageDef, u32>,
) -> ((Vec<Op>, Vec<Method>), HashMap<MessageDef, u32>) {
    let mut c = Compiler::new();
    let mut methods = Vec::with_capacity(defs.len());
    for (idx, def) in defs.iter().enumerate() {
        methods.push(c.compile_method(def, idx as u32, bases));
    }
    let out_bases = methods
        .iter()
        .map(|m: &Method| (m.def.clone(), m.base))
        .collect();
    ((c.ops, methods), out_bases)
}

fn find_methods(def: &MessageDef, out: &mut Vec<MessageDef>, seen: &mut HashSet<MessageDef>) {
    if !seen.insert(def.clone()) {
        return;
    }
    out.push(def.clone());
    for f in def.fields() {
        if let Some(sub) = f.message_subdef() {
            find_methods(&sub, out, seen);
        }
    }
}

const UNLINKED: u32 = u32::MAX;

const MAX_LABEL: usize = 5;
const LABEL_DISPATCH: usize = 0;
const LABEL_LOOPSTART: usize = 1;
const LABEL_LOOPBREAK: usize = 2;
const LABEL_FIELD: usize = 3;
const LABEL_ENDMSG: usize = 4;

/// A jump destination by label: forward references are patched when the
/// label is next defined, backward references resolve immediately.
#[derive(Clone, Copy)]
enum LabelRef {
    Fwd(usize),
    Back(usize),
}

struct Compiler {
    ops: Vec<Op>,
    fwd: [Vec<usize>; MAX_LABEL],
    back: [Option<u32>; MAX_LABEL],
}

impl Compiler {
    fn new() -> Compiler {
        let mut c = Compiler {
            ops: Vec::new(),
            fwd: Default::default(),
            back: [None; MAX_LABEL],
        };
        // The bottom of every call stack points here.
        c.ops.push(Op::Halt);
        c
    }

    fn pc(&self) -> u32 {
        self.ops.len() as u32
    }

    /// Defines a label at the current pc, patching pending forward refs.
    fn label(&mut self, label: usize) {
        let here = self.pc();
        for idx in std::mem::take(&mut self.fwd[label]) {
            set_target(&mut self.ops[idx], here);
        }
        self.back[label] = Some(here);
    }

    fn put(&mut self, op: Op) {
        self.ops.push(op);
    }

    /// Emits an op whose jump target is a label reference.
    fn put_jump(&mut self, mut op: Op, dest: LabelRef) {
        let idx = self.ops.len();
        match dest {
            LabelRef::Back(label) => {
                // Backward labels are always defined before use.
                set_target(&mut op, self.back[label].unwrap_or(0));
                self.ops.push(op);
            }
            LabelRef::Fwd(label) => {
                self.ops.push(op);
                self.fwd[label].push(idx);
            }
        }
    }

    fn put_checktag(&mut self, fnum: u32, wt: WireType, dest: LabelRef) {
        let (tag, tag_len) = encoded_tag(fnum, wt);
        self.put_jump(
            Op::Tag {
                tag,
                tag_len: tag_len as u8,
                jump: 0,
            },
            dest,
        );
    }

    fn put_push(&mut self, f: &FieldDef) {
        if f.field_type() == FieldType::Message {
            self.put(Op::PushLenDelim);
        } else {
            self.put(Op::PushTagDelim(f.number()));
        }
    }

    /// Records the current pc as the dispatch target for (field, wiretype).
    fn dispatch_target(&mut self, method: &mut Method, fnum: u32, wt: WireType) {
        let ofs = u64::from(self.pc() - method.base);
        let key = u64::from(fnum);
        if let Some(&old) = method.dispatch.get(key) {
            debug_assert_eq!((old >> 8) & 0xff, 0);
            method
                .dispatch
                .insert(key, old | (u64::from(wt as u8) << 8));
            method
                .dispatch
                .insert(key + u64::from(MAX_FIELD_NUMBER), ofs);
        } else {
            method.dispatch.insert(key, pack_dispatch(ofs, wt as u8, 0));
        }
    }

    fn compile_method(
        &mut self,
        def: &MessageDef,
        method_idx: u32,
        bases: &HashMap<MessageDef, u32>,
    ) -> Method {
        self.fwd = Default::default();
        self.back = [None; MAX_LABEL];

        let mut method = Method {
            def: def.clone(),
            base: self.pc(),
            dispatch: IntTable::new(),
        };
        self.put(Op::SetDispatch(method_idx));
        self.put(Op::StartMsg);
        self.label(LABEL_FIELD);

        let mut have_field = false;
        for f in def.fields() {
            have_field = true;
            if f.is_submessage() {
                self.compile_submsg_field(&mut method, &f, bases);
            } else if f.is_string() {
                self.compile_string_field(&mut method, &f);
            } else {
                self.compile_primitive_field(&mut method, &f);
            }
        }

        // In-order flow falls out of the last field; retry it (its tag
        // check falls through to dispatch on mismatch). With no fields
        // there is nothing to speculate on, so go straight to dispatch.
        if have_field {
            self.put_jump(Op::Branch(0), LabelRef::Back(LABEL_FIELD));
        } else {
            self.put_jump(Op::Branch(0), LabelRef::Fwd(LABEL_DISPATCH));
        }

        self.label(LABEL_DISPATCH);
        self.put_jump(Op::CheckDelim(0), LabelRef::Fwd(LABEL_ENDMSG));
        self.put(Op::Dispatch);

        self.label(LABEL_ENDMSG);
        method
            .dispatch
            .insert(DISPATCH_ENDMSG, u64::from(self.pc() - method.base));
        self.put(Op::EndMsg);
        self.put(Op::Ret);
        method
    }

    fn compile_submsg_field(
        &mut self,
        method: &mut Method,
        f: &FieldDef,
        bases: &HashMap<MessageDef, u32>,
    ) {
        let sub = match f.message_subdef() {
            Some(sub) => sub,
            None => return,
        };
        let sub_base = bases.get(&sub).copied().unwrap_or(UNLINKED);
        let wt = if f.field_type() == FieldType::Message {
            WireType::Delimited
        } else {
            WireType::StartGroup
        };
        let startsub = sel_of(f, HandlerType::StartSubMsg);
        let endsub = sel_of(f, HandlerType::EndSubMsg);

        self.label(LABEL_FIELD);
        if f.is_repeated() {
            let startseq = sel_of(f, HandlerType::StartSeq);
            let endseq = sel_of(f, HandlerType::EndSeq);
            self.put_jump(Op::CheckDelim(0), LabelRef::Fwd(LABEL_ENDMSG));
            self.put_checktag(f.number(), wt, LabelRef::Fwd(LABEL_DISPATCH));
            self.dispatch_target(method, f.number(), wt);
            self.put(Op::PushTagDelim(0));
            self.put(Op::StartSeq(startseq));
            self.label(LABEL_LOOPSTART);
            self.put_push(f);
            self.put(Op::StartSubMsg(startsub));
            self.put(Op::Call(sub_base));
            self.put(Op::Pop);
            self.put(Op::EndSubMsg(endsub));
            self.put_jump(Op::CheckDelim(0), LabelRef::Fwd(LABEL_LOOPBREAK));
            self.put_checktag(f.number(), wt, LabelRef::Fwd(LABEL_LOOPBREAK));
            self.put_jump(Op::Branch(0), LabelRef::Back(LABEL_LOOPSTART));
            self.label(LABEL_LOOPBREAK);
            self.put(Op::Pop);
            self.put(Op::EndSeq(endseq));
        } else {
            self.put_jump(Op::CheckDelim(0), LabelRef::Fwd(LABEL_ENDMSG));
            self.put_checktag(f.number(), wt, LabelRef::Fwd(LABEL_DISPATCH));
            self.dispatch_target(method, f.number(), wt);
            self.put_push(f);
            self.put(Op::StartSubMsg(startsub));
            self.put(Op::Call(sub_base));
            self.put(Op::Pop);
            self.put(Op::EndSubMsg(endsub));
        }
    }

    fn compile_string_field(&mut self, method: &mut Method, f: &FieldDef) {
        let startstr = sel_of(f, HandlerType::StartStr);
        let putstr = sel_of(f, HandlerType::String);
        let endstr = sel_of(f, HandlerType::EndStr);

        self.label(LABEL_FIELD);
        if f.is_repeated() {
            let startseq = sel_of(f, HandlerType::StartSeq);
            let endseq = sel_of(f, HandlerType::EndSeq);
            self.put_jump(Op::CheckDelim(0), LabelRef::Fwd(LABEL_ENDMSG));
            self.put_checktag(f.number(), WireType::Delimited, LabelRef::Fwd(LABEL_DISPATCH));
            self.dispatch_target(method, f.number(), WireType::Delimited);
            self.put(Op::PushTagDelim(0));
            self.put(Op::StartSeq(startseq));
            self.label(LABEL_LOOPSTART);
            self.put(Op::PushLenDelim);
            self.put(Op::StartStr(startstr));
            self.put(Op::StrFrag(putstr));
            self.put(Op::Pop);
            self.put(Op::EndStr(endstr));
            self.put_jump(Op::CheckDelim(0), LabelRef::Fwd(LABEL_LOOPBREAK));
            self.put_checktag(f.number(), WireType::Delimited, LabelRef::Fwd(LABEL_LOOPBREAK));
            self.put_jump(Op::Branch(0), LabelRef::Back(LABEL_LOOPSTART));
            self.label(LABEL_LOOPBREAK);
            self.put(Op::Pop);
            self.put(Op::EndSeq(endseq));
        } else {
            self.put_jump(Op::CheckDelim(0), LabelRef::Fwd(LABEL_ENDMSG));
            self.put_checktag(f.number(), WireType::Delimited, LabelRef::Fwd(LABEL_DISPATCH));
            self.dispatch_target(method, f.number(), WireType::Delimited);
            self.put(Op::PushLenDelim);
            self.put(Op::StartStr(startstr));
            self.put(Op::StrFrag(putstr));
            self.put(Op::Pop);
            self.put(Op::EndStr(endstr));
        }
    }

    fn compile_primitive_field(&mut self, method: &mut Method, f: &FieldDef) {
        let kind = match ValueKind::from_type(f.field_type()) {
            Some(kind) => kind,
            None => return,
        };
        let sel = Selector(f.selector_base());
        let wt = f.field_type().native_wire_type();

        self.label(LABEL_FIELD);
        if f.is_repeated() {
            let startseq = sel_of(f, HandlerType::StartSeq);
            let endseq = sel_of(f, HandlerType::EndSeq);
            // Packed entry point: one length-delimited run of values.
            self.put_jump(Op::CheckDelim(0), LabelRef::Fwd(LABEL_ENDMSG));
            self.put_checktag(f.number(), WireType::Delimited, LabelRef::Fwd(LABEL_DISPATCH));
            self.dispatch_target(method, f.number(), WireType::Delimited);
            self.put(Op::PushLenDelim);
            self.put(Op::StartSeq(startseq));
            self.label(LABEL_LOOPSTART);
            self.put(Op::Value { kind, sel });
            self.put_jump(Op::CheckDelim(0), LabelRef::Fwd(LABEL_LOOPBREAK));
            self.put_jump(Op::Branch(0), LabelRef::Back(LABEL_LOOPSTART));
            // Unpacked entry point: one tag per element.
            self.dispatch_target(method, f.number(), wt);
            self.put(Op::PushTagDelim(0));
            self.put(Op::StartSeq(startseq));
            self.label(LABEL_LOOPSTART);
            self.put(Op::Value { kind, sel });
            self.put_jump(Op::CheckDelim(0), LabelRef::Fwd(LABEL_LOOPBREAK));
            self.put_checktag(f.number(), wt, LabelRef::Fwd(LABEL_LOOPBREAK));
            self.put_jump(Op::Branch(0), LabelRef::Back(LABEL_LOOPSTART));
            self.label(LABEL_LOOPBREAK);
            self.put(Op::Pop);
            self.put(Op::EndSeq(endseq));
        } else {
            self.put_jump(Op::CheckDelim(0), LabelRef::Fwd(LABEL_ENDMSG));
            self.put_checktag(f.number(), wt, LabelRef::Fwd(LABEL_DISPATCH));
            self.dispatch_target(method, f.number(), wt);
            self.put(Op::Value { kind, sel });
        }
    }
}

fn sel_of(f: &FieldDef, ty: HandlerType) -> Selector {
    selector(f, ty).unwrap_or(Selector(0))
}

fn set_target(op: &mut Op, target: u32) {
    match op {
        Op::CheckDelim(t) | Op::Branch(t) | Op::Call(t) => *t = target,
        Op::Tag { jump, .. } => *jump = target,
        _ => unreachable!("not a jump op"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{DefPool, FieldBuilder, Label, Syntax};

    fn freeze(configure: impl FnOnce(&mut DefPool)) -> crate::defs::FrozenSet {
        let mut pool = DefPool::new();
        configure(&mut pool);
        pool.freeze(64).unwrap()
    }

    #[test]
    fn halt_occupies_slot_zero() {
        let frozen = freeze(|pool| {
            let m = pool.add_msg("t.M").unwrap();
            pool.msg_set_syntax(m, Syntax::Proto3);
            pool.add_field(m, FieldBuilder::new("x", 1, FieldType::Int32, Label::Optional))
                .unwrap();
        });
        let prog = Program::compile(&frozen.msgs[0]);
        assert_eq!(prog.ops[0], Op::Halt);
        assert_eq!(prog.method(0).base, 1);
        assert_eq!(prog.ops[1], Op::SetDispatch(0));
        assert_eq!(prog.ops[2], Op::StartMsg);
    }

    #[test]
    fn dispatch_entry_packs_offset_and_wire_type() {
        let frozen = freeze(|pool| {
            let m = pool.add_msg("t.M").unwrap();
            pool.msg_set_syntax(m, Syntax::Proto3);
            pool.add_field(m, FieldBuilder::new("x", 1, FieldType::Int32, Label::Optional))
                .unwrap();
        });
        let prog = Program::compile(&frozen.msgs[0]);
        let m = prog.method(0);
        let v = *m.dispatch.get(1).unwrap();
        assert_eq!(v & 0xff, WireType::Varint as u64);
        assert_eq!((v >> 8) & 0xff, 0);
        let ofs = (v >> 16) as u32;
        assert!(matches!(
            prog.ops[(m.base + ofs) as usize],
            Op::Value { kind: ValueKind::Int32, .. }
        ));
        assert!(m.dispatch.get(DISPATCH_ENDMSG).is_some());
    }

    #[test]
    fn repeated_primitive_has_packed_and_unpacked_entries() {
        let frozen = freeze(|pool| {
            let m = pool.add_msg("t.M").unwrap();
            pool.msg_set_syntax(m, Syntax::Proto3);
            pool.add_field(m, FieldBuilder::new("r", 3, FieldType::Int32, Label::Repeated))
                .unwrap();
        });
        let prog = Program::compile(&frozen.msgs[0]);
        let m = prog.method(0);
        let v = *m.dispatch.get(3).unwrap();
        // Primary is packed (delimited), secondary the native wire type.
        assert_eq!(v & 0xff, WireType::Delimited as u64);
        assert_eq!((v >> 8) & 0xff, WireType::Varint as u64);
        assert!(m.dispatch.get(3 + u64::from(MAX_FIELD_NUMBER)).is_some());
    }

    #[test]
    fn calls_link_to_submessage_methods_across_cycles() {
        let frozen = freeze(|pool| {
            let a = pool.add_msg("t.A").unwrap();
            let b = pool.add_msg("t.B").unwrap();
            pool.add_field(
                a,
                FieldBuilder::new("b", 1, FieldType::Message, Label::Optional).subdef_msg(b),
            )
            .unwrap();
            pool.add_field(
                b,
                FieldBuilder::new("a", 1, FieldType::Message, Label::Optional).subdef_msg(a),
            )
            .unwrap();
        });
        let prog = Program::compile(&frozen.msgs[0]);
        assert_eq!(prog.methods.len(), 2);
        let bases: Vec<u32> = prog.methods.iter().map(|m| m.base).collect();
        for op in &prog.ops {
            if let Op::Call(target) = op {
                assert!(bases.contains(target), "unlinked call target {target}");
            }
        }
    }

    #[test]
    fn group_field_pushes_tag_delimited_frame() {
        let frozen = freeze(|pool| {
            let g = pool.add_msg("t.G").unwrap();
            pool.add_field(g, FieldBuilder::new("v", 1, FieldType::Int32, Label::Optional))
                .unwrap();
            let m = pool.add_msg("t.M").unwrap();
            pool.add_field(
                m,
                FieldBuilder::new("grp", 1, FieldType::Group, Label::Optional).subdef_msg(g),
            )
            .unwrap();
        });
        let prog = Program::compile(&frozen.msgs[1]);
        assert!(prog.ops.iter().any(|op| *op == Op::PushTagDelim(1)));
        let mid = prog.method_for(&frozen.msgs[1]).unwrap();
        let v = *prog.method(mid).dispatch.get(1).unwrap();
        assert_eq!(v & 0xff, WireType::StartGroup as u64);
    }

    #[test]
    fn every_method_ends_with_endmsg_ret() {
        let frozen = freeze(|pool| {
            let inner = pool.add_msg("t.I").unwrap();
            pool.add_field(inner, FieldBuilder::new("v", 1, FieldType::Int64, Label::Optional))
                .unwrap();
            let m = pool.add_msg("t.M").unwrap();
            pool.add_field(
                m,
                FieldBuilder::new("i", 1, FieldType::Message, Label::Optional).subdef_msg(inner),
            )
            .unwrap();
            pool.add_field(m, FieldBuilder::new("s", 2, FieldType::String, Label::Repeated))
                .unwrap();
        });
        let prog = Program::compile(&frozen.msgs[1]);
        for m in &prog.methods {
            let end_ofs = *m.dispatch.get(DISPATCH_ENDMSG).unwrap() as u32;
            assert_eq!(prog.ops[(m.base + end_ofs) as usize], Op::EndMsg);
            assert_eq!(prog.ops[(m.base + end_ofs + 1) as usize], Op::Ret);
        }
    }

    #[test]
    fn empty_message_branches_to_dispatch() {
        let frozen = freeze(|pool| {
            pool.add_msg("t.Empty").unwrap();
        });
        let prog = Program::compile(&frozen.msgs[0]);
        let m = prog.method(0);
        // SetDispatch, StartMsg, Branch, CheckDelim, Dispatch, ...
        let branch_pc = m.base + 2;
        match prog.ops[branch_pc as usize] {
            Op::Branch(target) => assert!(target > branch_pc, "must not loop on itself"),
            ref op => panic!("expected branch, got {op:?}"),
        }
    }
}

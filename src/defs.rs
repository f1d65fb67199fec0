//! The descriptor model: messages, fields, enums, oneofs, and files.
//!
//! Definitions are born mutable inside a [`DefPool`] (the single shared
//! mutable scope) and become immutable by freezing. Freezing validates the
//! whole pool, resolves symbolic subdef names, sorts fields so submessage
//! fields occupy the lowest indexes, assigns handler selector bases, and
//! splits the pool into per-SCC shared groups (see `freeze`). Frozen defs
//! are cheap handles (`Arc` + index) that are safe to share across threads.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::freeze::{find_sccs, Node};
use crate::table::{IntTable, StrTable};
use crate::wire::FieldType;
use crate::{Error, ErrorKind, Result, MAX_FIELD_NUMBER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Optional,
    Required,
    Repeated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    Proto2,
    Proto3,
}

/// A typed default value for a field. Enum defaults may be carried by name
/// (the "is_string" form) and are resolved to a number at freeze time.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Int64(i64),
    UInt64(u64),
    Int32(i32),
    UInt32(u32),
    Bool(bool),
    Float(f32),
    Double(f64),
    Bytes(Vec<u8>),
    EnumName(String),
    EnumNumber(i32),
}

/// Identifiers for mutable defs inside a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgId(pub(crate) u32);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnumId(pub(crate) u32);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub(crate) u32);

/// What a composite field points at before resolution.
#[derive(Debug, Clone, PartialEq)]
enum SubdefTarget {
    None,
    Msg(MsgId),
    Enum(EnumId),
    Name(String),
}

/// A field definition under construction.
#[derive(Debug, Clone)]
pub struct FieldBuilder {
    name: String,
    number: u32,
    ty: FieldType,
    label: Label,
    packed: Option<bool>,
    lazy: bool,
    is_extension: bool,
    subdef: SubdefTarget,
    default: Option<DefaultValue>,
    json_name: Option<String>,
}

impl FieldBuilder {
    pub fn new(name: &str, number: u32, ty: FieldType, label: Label) -> Self {
        Self {
            name: name.to_owned(),
            number,
            ty,
            label,
            packed: None,
            lazy: false,
            is_extension: false,
            subdef: SubdefTarget::None,
            default: None,
            json_name: None,
        }
    }

    pub fn packed(mut self, packed: bool) -> Self {
        self.packed = Some(packed);
        self
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn extension(mut self, is_extension: bool) -> Self {
        self.is_extension = is_extension;
        self
    }

    /// Sets the subdef by symbolic name, resolved when the pool is frozen
    /// (or added to a symbol table). Leading '.' means fully qualified.
    pub fn subdef_name(mut self, name: &str) -> Self {
        self.subdef = SubdefTarget::Name(name.to_owned());
        self
    }

    pub fn subdef_msg(mut self, msg: MsgId) -> Self {
        self.subdef = SubdefTarget::Msg(msg);
        self
    }

    pub fn subdef_enum(mut self, e: EnumId) -> Self {
        self.subdef = SubdefTarget::Enum(e);
        self
    }

    pub fn default_value(mut self, v: DefaultValue) -> Self {
        self.default = Some(v);
        self
    }

    pub fn json_name(mut self, name: &str) -> Self {
        self.json_name = Some(name.to_owned());
        self
    }
}

#[derive(Debug, Clone)]
struct OneofBuilder {
    name: String,
    fields: Vec<u32>, // declaration indexes into MsgBuilder::fields
}

#[derive(Debug)]
struct MsgBuilder {
    full_name: String,
    syntax: Syntax,
    map_entry: bool,
    fields: Vec<FieldBuilder>,
    field_oneof: Vec<Option<u32>>,
    by_number: IntTable<u32>,
    by_name: StrTable<u32>,
    oneofs: Vec<OneofBuilder>,
}

#[derive(Debug)]
struct EnumBuilder {
    full_name: String,
    values: Vec<(String, i32)>,
    by_name: StrTable<i32>,
    by_number: IntTable<u32>, // first value index for a number
    default: Option<i32>,
}

#[derive(Debug)]
struct FileBuilder {
    name: String,
    package: String,
    syntax: Syntax,
    msgs: Vec<MsgId>,
    enums: Vec<EnumId>,
    deps: Vec<String>,
}

/// The mutable scope that owns definitions until they are frozen.
#[derive(Default)]
pub struct DefPool {
    msgs: Vec<MsgBuilder>,
    enums: Vec<EnumBuilder>,
    files: Vec<FileBuilder>,
    by_full_name: HashMap<String, Node>,
}

impl DefPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_msg(&mut self, full_name: &str) -> Result<MsgId> {
        self.claim_name(full_name)?;
        let id = MsgId(self.msgs.len() as u32);
        self.msgs.push(MsgBuilder {
            full_name: full_name.to_owned(),
            syntax: Syntax::Proto2,
            map_entry: false,
            fields: Vec::new(),
            field_oneof: Vec::new(),
            by_number: IntTable::new(),
            by_name: StrTable::new(),
            oneofs: Vec::new(),
        });
        self.by_full_name
            .insert(full_name.to_owned(), Node::Msg(id.0));
        Ok(id)
    }

    pub fn add_enum(&mut self, full_name: &str) -> Result<EnumId> {
        self.claim_name(full_name)?;
        let id = EnumId(self.enums.len() as u32);
        self.enums.push(EnumBuilder {
            full_name: full_name.to_owned(),
            values: Vec::new(),
            by_name: StrTable::new(),
            by_number: IntTable::new(),
            default: None,
        });
        self.by_full_name
            .insert(full_name.to_owned(), Node::Enum(id.0));
        Ok(id)
    }

    pub fn add_file(&mut self, name: &str, package: &str, syntax: Syntax) -> FileId {
        let id = FileId(self.files.len() as u32);
        self.files.push(FileBuilder {
            name: name.to_owned(),
            package: package.to_owned(),
            syntax,
            msgs: Vec::new(),
            enums: Vec::new(),
            deps: Vec::new(),
        });
        id
    }

    pub fn file_add_msg(&mut self, file: FileId, msg: MsgId) {
        self.files[file.0 as usize].msgs.push(msg);
        let syntax = self.files[file.0 as usize].syntax;
        self.msgs[msg.0 as usize].syntax = syntax;
    }

    pub fn file_add_enum(&mut self, file: FileId, e: EnumId) {
        self.files[file.0 as usize].enums.push(e);
    }

    pub fn file_add_dep(&mut self, file: FileId, dep: &str) {
        self.files[file.0 as usize].deps.push(dep.to_owned());
    }

    pub fn msg_set_syntax(&mut self, msg: MsgId, syntax: Syntax) {
        self.msgs[msg.0 as usize].syntax = syntax;
    }

    pub fn msg_set_map_entry(&mut self, msg: MsgId, map_entry: bool) {
        self.msgs[msg.0 as usize].map_entry = map_entry;
    }

    pub fn msg_full_name(&self, msg: MsgId) -> &str {
        &self.msgs[msg.0 as usize].full_name
    }

    /// Adds a field to a message, checking name and number collisions.
    pub fn add_field(&mut self, msg: MsgId, field: FieldBuilder) -> Result<()> {
        self.add_field_inner(msg, field, None)
    }

    fn add_field_inner(
        &mut self,
        msg: MsgId,
        field: FieldBuilder,
        oneof: Option<u32>,
    ) -> Result<()> {
        if field.number == 0 || field.number > MAX_FIELD_NUMBER {
            return Err(Error::from_kind(ErrorKind::InvalidFieldNumber));
        }
        let m = &mut self.msgs[msg.0 as usize];
        let idx = m.fields.len() as u32;
        if m.by_number.contains_key(u64::from(field.number)) {
            let mut e = Error::from_kind(ErrorKind::DuplicateSymbol);
            use fmt::Write;
            let _ = write!(e, "field number {} in {}", field.number, m.full_name);
            return Err(e);
        }
        if m.by_name.contains_key(field.name.as_bytes()) {
            let mut e = Error::from_kind(ErrorKind::DuplicateSymbol);
            use fmt::Write;
            let _ = write!(e, "field name {} in {}", field.name, m.full_name);
            return Err(e);
        }
        m.by_number.insert(u64::from(field.number), idx);
        m.by_name.insert(field.name.as_bytes(), idx);
        m.fields.push(field);
        m.field_oneof.push(oneof);
        Ok(())
    }

    /// Adds a oneof and its member fields atomically. Every member must be
    /// OPTIONAL and must not already belong to another oneof.
    pub fn add_oneof(&mut self, msg: MsgId, name: &str, fields: Vec<FieldBuilder>) -> Result<()> {
        for f in &fields {
            if f.label != Label::Optional {
                return Err(Error::from_kind(ErrorKind::BadOneofField));
            }
        }
        let oneof_index = {
            let m = &mut self.msgs[msg.0 as usize];
            if m.oneofs.iter().any(|o| o.name == name) {
                return Err(Error::from_kind(ErrorKind::DuplicateSymbol));
            }
            m.oneofs.push(OneofBuilder {
                name: name.to_owned(),
                fields: Vec::new(),
            });
            (m.oneofs.len() - 1) as u32
        };
        for f in fields {
            let decl_idx = self.msgs[msg.0 as usize].fields.len() as u32;
            self.add_field_inner(msg, f, Some(oneof_index))?;
            self.msgs[msg.0 as usize].oneofs[oneof_index as usize]
                .fields
                .push(decl_idx);
        }
        Ok(())
    }

    /// Builds the synthetic two-field entry message for a map field and adds
    /// the repeated entry field to `msg`. The value field's name and number
    /// are forced to the map-entry shape (`value` = 2).
    pub fn add_map_field(
        &mut self,
        msg: MsgId,
        name: &str,
        number: u32,
        key_ty: FieldType,
        value_field: FieldBuilder,
    ) -> Result<MsgId> {
        if !crate::message::MapKey::is_valid_key_type(key_ty) {
            return Err(Error::failed(format!("bad map key type {key_ty:?}")));
        }
        let entry_name = format!(
            "{}.{}Entry",
            self.msgs[msg.0 as usize].full_name,
            upper_camel(name)
        );
        let syntax = self.msgs[msg.0 as usize].syntax;
        let entry = self.add_msg(&entry_name)?;
        self.msg_set_syntax(entry, syntax);
        self.msg_set_map_entry(entry, true);
        self.add_field(
            entry,
            FieldBuilder::new("key", 1, key_ty, Label::Optional),
        )?;
        let mut value_field = value_field;
        value_field.name = "value".to_owned();
        value_field.number = 2;
        value_field.label = Label::Optional;
        self.add_field(entry, value_field)?;
        self.add_field(
            msg,
            FieldBuilder::new(name, number, FieldType::Message, Label::Repeated)
                .subdef_msg(entry),
        )?;
        Ok(entry)
    }

    fn claim_name(&mut self, full_name: &str) -> Result<()> {
        if self.by_full_name.contains_key(full_name) {
            let mut e = Error::from_kind(ErrorKind::DuplicateSymbol);
            use fmt::Write;
            let _ = write!(e, "{full_name}");
            return Err(e);
        }
        Ok(())
    }

    /// Freezes the pool standalone; symbolic subdef names resolve only
    /// against the pool's own definitions.
    pub fn freeze(self, max_depth: usize) -> Result<FrozenSet> {
        self.freeze_with_resolver(max_depth, &|_| None)
    }

    /// Freezes the pool, resolving symbolic names first against the pool and
    /// then through `external` (typically a symbol table's lookup).
    pub(crate) fn freeze_with_resolver(
        self,
        max_depth: usize,
        external: &dyn Fn(&str) -> Option<SymDef>,
    ) -> Result<FrozenSet> {
        Freezer::run(self, max_depth, external)
    }
}

/// A frozen def from outside the pool being frozen.
#[derive(Clone)]
pub enum SymDef {
    Msg(MessageDef),
    Enum(EnumDef),
}

/// Everything a freeze produced, indexed parallel to the pool's ids.
pub struct FrozenSet {
    pub msgs: Vec<MessageDef>,
    pub enums: Vec<EnumDef>,
    pub files: Vec<FileDef>,
}

impl std::fmt::Debug for FrozenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrozenSet")
            .field("msgs", &self.msgs.len())
            .field("enums", &self.enums.len())
            .field("files", &self.files.len())
            .finish()
    }
}

/* Frozen representation ****************************************************/

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ResolvedDefault {
    None,
    Int64(i64),
    UInt64(u64),
    Int32(i32),
    UInt32(u32),
    Bool(bool),
    Float(f32),
    Double(f64),
    Bytes(Vec<u8>),
    Enum(i32),
}

#[derive(Clone)]
pub(crate) enum SubdefRef {
    None,
    LocalMsg(u32),
    LocalEnum(u32),
    ForeignMsg(MessageDef),
    ForeignEnum(EnumDef),
}

pub(crate) struct FrozenField {
    pub name: String,
    pub json_name: String,
    pub number: u32,
    pub ty: FieldType,
    pub label: Label,
    pub packed: bool,
    pub lazy: bool,
    pub is_extension: bool,
    pub subdef: SubdefRef,
    pub default: ResolvedDefault,
    pub oneof_index: Option<u32>,
    pub index: u32,
    pub selector_base: u32,
}

pub(crate) struct FrozenOneof {
    pub name: String,
    /// Frozen-order field indexes of the members.
    pub fields: Vec<u32>,
}

pub(crate) struct FrozenMsg {
    pub full_name: String,
    pub syntax: Syntax,
    pub map_entry: bool,
    /// Fields in frozen order: submessage fields first, then by number.
    pub fields: Vec<FrozenField>,
    /// Frozen-order indexes sorted by ascending field number.
    pub number_order: Vec<u32>,
    pub by_number: IntTable<u32>,
    pub by_name: StrTable<u32>,
    pub oneofs: Vec<FrozenOneof>,
    pub submsg_field_count: u32,
    pub selector_count: u32,
}

pub(crate) struct FrozenEnum {
    pub full_name: String,
    pub values: Vec<(String, i32)>,
    pub by_name: StrTable<i32>,
    pub by_number: IntTable<u32>,
    pub default: i32,
}

/// One immutable SCC group. All defs in the group share this allocation;
/// the group's `Arc` count is the shared refcount of the component.
pub(crate) struct DefGroup {
    pub msgs: Vec<FrozenMsg>,
    pub enums: Vec<FrozenEnum>,
}

/// A frozen message definition.
#[derive(Clone)]
pub struct MessageDef {
    pub(crate) group: Arc<DefGroup>,
    pub(crate) idx: u32,
}

/// A frozen enum definition.
#[derive(Clone)]
pub struct EnumDef {
    pub(crate) group: Arc<DefGroup>,
    pub(crate) idx: u32,
}

/// A frozen field definition (owned by its containing message).
#[derive(Clone)]
pub struct FieldDef {
    pub(crate) group: Arc<DefGroup>,
    pub(crate) msg: u32,
    pub(crate) idx: u32,
}

/// A frozen oneof definition.
#[derive(Clone)]
pub struct OneofDef {
    pub(crate) group: Arc<DefGroup>,
    pub(crate) msg: u32,
    pub(crate) idx: u32,
}

struct FileInner {
    name: String,
    package: String,
    syntax: Syntax,
    msgs: Vec<MessageDef>,
    enums: Vec<EnumDef>,
    deps: Vec<String>,
}

/// A frozen file definition: named lists of defs and dependencies.
#[derive(Clone)]
pub struct FileDef {
    inner: Arc<FileInner>,
}

impl FileDef {
    pub fn name(&self) -> &str {
        &self.inner.name
    }
    pub fn package(&self) -> &str {
        &self.inner.package
    }
    pub fn syntax(&self) -> Syntax {
        self.inner.syntax
    }
    pub fn messages(&self) -> &[MessageDef] {
        &self.inner.msgs
    }
    pub fn enums(&self) -> &[EnumDef] {
        &self.inner.enums
    }
    pub fn dependencies(&self) -> &[String] {
        &self.inner.deps
    }
}

impl PartialEq for MessageDef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.group, &other.group) && self.idx == other.idx
    }
}
impl Eq for MessageDef {}
impl Hash for MessageDef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.group) as usize).hash(state);
        self.idx.hash(state);
    }
}
impl fmt::Debug for MessageDef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MessageDef({})", self.full_name())
    }
}

impl PartialEq for EnumDef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.group, &other.group) && self.idx == other.idx
    }
}
impl Eq for EnumDef {}
impl fmt::Debug for EnumDef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "EnumDef({})", self.full_name())
    }
}

impl MessageDef {
    fn raw(&self) -> &FrozenMsg {
        &self.group.msgs[self.idx as usize]
    }

    pub fn full_name(&self) -> &str {
        &self.raw().full_name
    }

    pub fn syntax(&self) -> Syntax {
        self.raw().syntax
    }

    pub fn is_map_entry(&self) -> bool {
        self.raw().map_entry
    }

    pub fn field_count(&self) -> usize {
        self.raw().fields.len()
    }

    /// Field by frozen index (submessage fields occupy the lowest indexes).
    pub fn field(&self, index: usize) -> FieldDef {
        assert!(index < self.field_count());
        FieldDef {
            group: Arc::clone(&self.group),
            msg: self.idx,
            idx: index as u32,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = FieldDef> + '_ {
        (0..self.field_count()).map(move |i| self.field(i))
    }

    /// Fields in ascending field-number order (the canonical encode order).
    pub fn fields_by_number(&self) -> impl Iterator<Item = FieldDef> + '_ {
        self.raw()
            .number_order
            .iter()
            .map(move |&i| self.field(i as usize))
    }

    pub fn field_by_number(&self, number: u32) -> Option<FieldDef> {
        self.raw()
            .by_number
            .get(u64::from(number))
            .map(|&i| self.field(i as usize))
    }

    pub fn field_by_name(&self, name: &str) -> Option<FieldDef> {
        self.raw()
            .by_name
            .get(name.as_bytes())
            .map(|&i| self.field(i as usize))
    }

    pub fn oneof_count(&self) -> usize {
        self.raw().oneofs.len()
    }

    pub fn oneof(&self, index: usize) -> OneofDef {
        assert!(index < self.oneof_count());
        OneofDef {
            group: Arc::clone(&self.group),
            msg: self.idx,
            idx: index as u32,
        }
    }

    pub fn oneofs(&self) -> impl Iterator<Item = OneofDef> + '_ {
        (0..self.oneof_count()).map(move |i| self.oneof(i))
    }

    pub fn oneof_by_name(&self, name: &str) -> Option<OneofDef> {
        (0..self.oneof_count())
            .find(|&i| self.raw().oneofs[i].name == name)
            .map(|i| self.oneof(i))
    }

    pub fn submsg_field_count(&self) -> u32 {
        self.raw().submsg_field_count
    }

    pub fn selector_count(&self) -> u32 {
        self.raw().selector_count
    }
}

impl EnumDef {
    fn raw(&self) -> &FrozenEnum {
        &self.group.enums[self.idx as usize]
    }

    pub fn full_name(&self) -> &str {
        &self.raw().full_name
    }

    pub fn default(&self) -> i32 {
        self.raw().default
    }

    pub fn value_count(&self) -> usize {
        self.raw().values.len()
    }

    pub fn value_by_name(&self, name: &str) -> Option<i32> {
        self.raw().by_name.get(name.as_bytes()).copied()
    }

    pub fn name_by_value(&self, number: i32) -> Option<&str> {
        self.raw()
            .by_number
            .get(number as u32 as u64)
            .map(|&i| self.raw().values[i as usize].0.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, i32)> {
        self.raw().values.iter().map(|(n, v)| (n.as_str(), *v))
    }
}

impl FieldDef {
    pub(crate) fn raw(&self) -> &FrozenField {
        &self.group.msgs[self.msg as usize].fields[self.idx as usize]
    }

    pub fn name(&self) -> &str {
        &self.raw().name
    }

    /// The JSON mapping name: camelCased unless explicitly overridden.
    pub fn json_name(&self) -> &str {
        &self.raw().json_name
    }

    pub fn number(&self) -> u32 {
        self.raw().number
    }

    pub fn field_type(&self) -> FieldType {
        self.raw().ty
    }

    pub fn label(&self) -> Label {
        self.raw().label
    }

    pub fn is_repeated(&self) -> bool {
        self.raw().label == Label::Repeated
    }

    pub fn is_packed(&self) -> bool {
        self.raw().packed
    }

    pub fn is_lazy(&self) -> bool {
        self.raw().lazy
    }

    pub fn is_extension(&self) -> bool {
        self.raw().is_extension
    }

    pub fn is_string(&self) -> bool {
        self.raw().ty.is_string()
    }

    pub fn is_submessage(&self) -> bool {
        self.raw().ty.is_submessage()
    }

    /// True for a repeated message field whose subdef is a map entry.
    pub fn is_map(&self) -> bool {
        self.is_repeated()
            && self
                .message_subdef()
                .map(|m| m.is_map_entry())
                .unwrap_or(false)
    }

    /// Index in frozen order; submessage fields have the lowest indexes.
    pub fn index(&self) -> u32 {
        self.raw().index
    }

    pub fn selector_base(&self) -> u32 {
        self.raw().selector_base
    }

    pub fn containing_type(&self) -> MessageDef {
        MessageDef {
            group: Arc::clone(&self.group),
            idx: self.msg,
        }
    }

    pub fn containing_oneof(&self) -> Option<OneofDef> {
        self.raw().oneof_index.map(|i| OneofDef {
            group: Arc::clone(&self.group),
            msg: self.msg,
            idx: i,
        })
    }

    pub fn message_subdef(&self) -> Option<MessageDef> {
        match &self.raw().subdef {
            SubdefRef::LocalMsg(i) => Some(MessageDef {
                group: Arc::clone(&self.group),
                idx: *i,
            }),
            SubdefRef::ForeignMsg(m) => Some(m.clone()),
            _ => None,
        }
    }

    pub fn enum_subdef(&self) -> Option<EnumDef> {
        match &self.raw().subdef {
            SubdefRef::LocalEnum(i) => Some(EnumDef {
                group: Arc::clone(&self.group),
                idx: *i,
            }),
            SubdefRef::ForeignEnum(e) => Some(e.clone()),
            _ => None,
        }
    }

    /// Presence semantics for layout purposes: proto2 scalars and all
    /// submessage fields have presence; repeated fields never do.
    pub fn has_presence(&self) -> bool {
        if self.is_repeated() {
            return false;
        }
        if self.is_submessage() {
            return true;
        }
        self.containing_type().syntax() == Syntax::Proto2
    }

    pub(crate) fn resolved_default(&self) -> &ResolvedDefault {
        &self.raw().default
    }
}

impl OneofDef {
    fn raw(&self) -> &FrozenOneof {
        &self.group.msgs[self.msg as usize].oneofs[self.idx as usize]
    }

    pub fn name(&self) -> &str {
        &self.raw().name
    }

    pub fn containing_type(&self) -> MessageDef {
        MessageDef {
            group: Arc::clone(&self.group),
            idx: self.msg,
        }
    }

    pub fn index(&self) -> u32 {
        self.idx
    }

    pub fn field_count(&self) -> usize {
        self.raw().fields.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = FieldDef> + '_ {
        self.raw().fields.iter().map(move |&i| FieldDef {
            group: Arc::clone(&self.group),
            msg: self.msg,
            idx: i,
        })
    }

    pub fn field_by_name(&self, name: &str) -> Option<FieldDef> {
        self.fields().find(|f| f.name() == name)
    }
}

/* The freeze pass itself ***************************************************/

/// Resolution result for one field's subdef, before groups exist.
#[derive(Clone)]
enum Resolved {
    None,
    PoolMsg(u32),
    PoolEnum(u32),
    ExtMsg(MessageDef),
    ExtEnum(EnumDef),
}

struct Freezer {
    pool: DefPool,
    resolved: Vec<Vec<Resolved>>, // per message, per declaration-order field
}

impl Freezer {
    fn run(
        pool: DefPool,
        max_depth: usize,
        external: &dyn Fn(&str) -> Option<SymDef>,
    ) -> Result<FrozenSet> {
        let mut fz = Freezer {
            resolved: Vec::with_capacity(pool.msgs.len()),
            pool,
        };
        fz.resolve_all(external)?;
        fz.validate_all()?;

        let msg_count = fz.pool.msgs.len();
        let enum_count = fz.pool.enums.len();
        let resolved = fz.resolved.clone();
        let succ = move |n: Node| -> Vec<Node> {
            match n {
                Node::Msg(i) => resolved[i as usize]
                    .iter()
                    .filter_map(|r| match r {
                        Resolved::PoolMsg(j) => Some(Node::Msg(*j)),
                        Resolved::PoolEnum(j) => Some(Node::Enum(*j)),
                        _ => None,
                    })
                    .collect(),
                Node::Enum(_) => vec![],
            }
        };
        let sccs = find_sccs(msg_count, enum_count, &succ, max_depth)?;
        fz.build_groups(sccs)
    }

    fn resolve_all(&mut self, external: &dyn Fn(&str) -> Option<SymDef>) -> Result<()> {
        for m in 0..self.pool.msgs.len() {
            let mut row = Vec::with_capacity(self.pool.msgs[m].fields.len());
            for f in 0..self.pool.msgs[m].fields.len() {
                let target = self.pool.msgs[m].fields[f].subdef.clone();
                let r = match target {
                    SubdefTarget::None => Resolved::None,
                    SubdefTarget::Msg(id) => Resolved::PoolMsg(id.0),
                    SubdefTarget::Enum(id) => Resolved::PoolEnum(id.0),
                    SubdefTarget::Name(name) => {
                        let scope = self.pool.msgs[m].full_name.clone();
                        self.resolve_name(&scope, &name, external)?
                    }
                };
                row.push(r);
            }
            self.resolved.push(row);
        }
        Ok(())
    }

    /// C-style scoped resolution: a leading '.' is fully qualified;
    /// otherwise search the enclosing scopes from innermost outward.
    fn resolve_name(
        &self,
        scope: &str,
        name: &str,
        external: &dyn Fn(&str) -> Option<SymDef>,
    ) -> Result<Resolved> {
        let try_one = |candidate: &str| -> Option<Resolved> {
            if let Some(node) = self.pool.by_full_name.get(candidate) {
                return Some(match node {
                    Node::Msg(i) => Resolved::PoolMsg(*i),
                    Node::Enum(i) => Resolved::PoolEnum(*i),
                });
            }
            external(candidate).map(|d| match d {
                SymDef::Msg(m) => Resolved::ExtMsg(m),
                SymDef::Enum(e) => Resolved::ExtEnum(e),
            })
        };

        if let Some(absolute) = name.strip_prefix('.') {
            if let Some(r) = try_one(absolute) {
                return Ok(r);
            }
        } else {
            let mut prefix = scope;
            loop {
                let candidate = if prefix.is_empty() {
                    name.to_owned()
                } else {
                    format!("{prefix}.{name}")
                };
                if let Some(r) = try_one(&candidate) {
                    return Ok(r);
                }
                match prefix.rfind('.') {
                    Some(pos) => prefix = &prefix[..pos],
                    None => {
                        if prefix.is_empty() {
                            break;
                        }
                        prefix = "";
                    }
                }
            }
        }
        let mut e = Error::from_kind(ErrorKind::UnresolvedSymbol);
        use fmt::Write;
        let _ = write!(e, "{name} (referenced from {scope})");
        Err(e)
    }

    fn validate_all(&self) -> Result<()> {
        for e in &self.pool.enums {
            if e.values.is_empty() {
                let mut err = Error::from_kind(ErrorKind::BadEnum);
                use fmt::Write;
                let _ = write!(err, "{} has no values", e.full_name);
                return Err(err);
            }
            if let Some(d) = e.default {
                if !e.by_number.contains_key(d as u32 as u64) {
                    return Err(Error::from_kind(ErrorKind::BadEnum));
                }
            }
        }
        for (m, msg) in self.pool.msgs.iter().enumerate() {
            for (i, f) in msg.fields.iter().enumerate() {
                self.validate_field(m, i, msg, f)?;
            }
        }
        Ok(())
    }

    fn validate_field(
        &self,
        m: usize,
        i: usize,
        msg: &MsgBuilder,
        f: &FieldBuilder,
    ) -> Result<()> {
        let fail = |kind: ErrorKind| -> Error {
            let mut e = Error::from_kind(kind);
            use fmt::Write;
            let _ = write!(e, "field {} in {}", f.name, msg.full_name);
            e
        };
        if f.name.is_empty() || f.number == 0 {
            return Err(fail(ErrorKind::IncompleteField));
        }
        if f.lazy && f.ty != FieldType::Message {
            return Err(fail(ErrorKind::BadLazyField));
        }
        let resolved = &self.resolved[m][i];
        match (f.ty.is_submessage(), f.ty == FieldType::Enum, resolved) {
            (true, _, Resolved::PoolMsg(_) | Resolved::ExtMsg(_)) => {}
            (_, true, Resolved::PoolEnum(_) | Resolved::ExtEnum(_)) => {}
            (false, false, Resolved::None) => {}
            _ => return Err(fail(ErrorKind::UnresolvedSymbol)),
        }
        // Enum defaults carried by name must be members of the enum.
        if let Some(DefaultValue::EnumName(name)) = &f.default {
            let found = match resolved {
                Resolved::PoolEnum(j) => self.pool.enums[*j as usize]
                    .by_name
                    .contains_key(name.as_bytes()),
                Resolved::ExtEnum(e) => e.value_by_name(name).is_some(),
                _ => false,
            };
            if !found {
                return Err(fail(ErrorKind::BadEnum));
            }
        }
        // A field whose subdef is a map entry must be repeated.
        let subdef_is_mapentry = match resolved {
            Resolved::PoolMsg(j) => self.pool.msgs[*j as usize].map_entry,
            Resolved::ExtMsg(sub) => sub.is_map_entry(),
            _ => false,
        };
        if subdef_is_mapentry && f.label != Label::Repeated {
            return Err(fail(ErrorKind::BadMapField));
        }
        if f.packed == Some(true) && !(f.label == Label::Repeated && f.ty.is_packable()) {
            return Err(fail(ErrorKind::IncompleteField));
        }
        Ok(())
    }

    fn build_groups(self, sccs: crate::freeze::SccResult) -> Result<FrozenSet> {
        let Freezer { pool, resolved } = self;
        let msg_count = pool.msgs.len();
        let enum_count = pool.enums.len();

        // Local index of each pool def within its component's group.
        let mut msg_local = vec![0u32; msg_count];
        let mut enum_local = vec![0u32; enum_count];
        for component in &sccs.components {
            let (mut mi, mut ei) = (0u32, 0u32);
            for &n in component {
                match n {
                    Node::Msg(i) => {
                        msg_local[i as usize] = mi;
                        mi += 1;
                    }
                    Node::Enum(i) => {
                        enum_local[i as usize] = ei;
                        ei += 1;
                    }
                }
            }
        }

        let mut groups: Vec<Arc<DefGroup>> = Vec::with_capacity(sccs.components.len());
        for (comp_id, component) in sccs.components.iter().enumerate() {
            let mut group = DefGroup {
                msgs: Vec::new(),
                enums: Vec::new(),
            };
            for &n in component {
                match n {
                    Node::Msg(i) => {
                        let frozen = freeze_msg(
                            &pool,
                            &resolved,
                            i as usize,
                            comp_id as u32,
                            &sccs,
                            &msg_local,
                            &enum_local,
                            &groups,
                        )?;
                        group.msgs.push(frozen);
                    }
                    Node::Enum(i) => {
                        group.enums.push(freeze_enum(&pool.enums[i as usize]));
                    }
                }
            }
            groups.push(Arc::new(group));
        }

        let msgs: Vec<MessageDef> = (0..msg_count)
            .map(|i| MessageDef {
                group: Arc::clone(&groups[sccs.msg_component[i] as usize]),
                idx: msg_local[i],
            })
            .collect();
        let enums: Vec<EnumDef> = (0..enum_count)
            .map(|i| EnumDef {
                group: Arc::clone(&groups[sccs.enum_component[i] as usize]),
                idx: enum_local[i],
            })
            .collect();
        let files = pool
            .files
            .iter()
            .map(|fb| FileDef {
                inner: Arc::new(FileInner {
                    name: fb.name.clone(),
                    package: fb.package.clone(),
                    syntax: fb.syntax,
                    msgs: fb.msgs.iter().map(|id| msgs[id.0 as usize].clone()).collect(),
                    enums: fb
                        .enums
                        .iter()
                        .map(|id| enums[id.0 as usize].clone())
                        .collect(),
                    deps: fb.deps.clone(),
                }),
            })
            .collect();

        Ok(FrozenSet { msgs, enums, files })
    }
}

/// All submessage fields rank below all other fields; within each half,
/// fields are ordered by number.
fn field_rank(f: &FieldBuilder) -> u32 {
    let high_bit = 1 << 30;
    debug_assert!(f.number < high_bit);
    if f.ty.is_submessage() {
        f.number
    } else {
        f.number | high_bit
    }
}

/// Static (per-message, field-independent) selectors.
pub(crate) const STARTMSG_SELECTOR: u32 = 0;
pub(crate) const ENDMSG_SELECTOR: u32 = 1;
pub(crate) const UNKNOWN_SELECTOR: u32 = 2;
pub(crate) const STATIC_SELECTOR_COUNT: u32 = 3;

fn selector_base_offset(f: &FieldBuilder) -> u32 {
    if f.label == Label::Repeated {
        2
    } else {
        0
    }
}

fn selector_count_of(f: &FieldBuilder) -> u32 {
    let mut ret = 1;
    if f.label == Label::Repeated {
        ret += 2; // STARTSEQ/ENDSEQ
    }
    if f.ty.is_string() {
        ret += 2; // STARTSTR/ENDSTR alongside STRING
    }
    if f.ty.is_submessage() && f.lazy {
        ret += 3; // lazy fields also expose the string trio
    }
    ret
}

#[allow(clippy::too_many_arguments)]
fn freeze_msg(
    pool: &DefPool,
    resolved: &[Vec<Resolved>],
    m: usize,
    comp_id: u32,
    sccs: &crate::freeze::SccResult,
    msg_local: &[u32],
    enum_local: &[u32],
    groups: &[Arc<DefGroup>],
) -> Result<FrozenMsg> {
    let mb = &pool.msgs[m];

    // Sort fields by rank; the position becomes the frozen index.
    let mut order: Vec<u32> = (0..mb.fields.len() as u32).collect();
    order.sort_by_key(|&i| field_rank(&mb.fields[i as usize]));

    let submsg_field_count = mb
        .fields
        .iter()
        .filter(|f| f.ty.is_submessage())
        .count() as u32;

    let mut fields = Vec::with_capacity(mb.fields.len());
    let mut by_number = IntTable::new();
    let mut by_name = StrTable::new();
    let mut oneof_members: Vec<Vec<u32>> = vec![Vec::new(); mb.oneofs.len()];
    let mut selector = STATIC_SELECTOR_COUNT + submsg_field_count;

    for (frozen_idx, &decl_idx) in order.iter().enumerate() {
        let fb = &mb.fields[decl_idx as usize];
        let r = &resolved[m][decl_idx as usize];

        let subdef = match r {
            Resolved::None => SubdefRef::None,
            Resolved::PoolMsg(j) => {
                if sccs.msg_component[*j as usize] == comp_id {
                    SubdefRef::LocalMsg(msg_local[*j as usize])
                } else {
                    SubdefRef::ForeignMsg(MessageDef {
                        group: Arc::clone(&groups[sccs.msg_component[*j as usize] as usize]),
                        idx: msg_local[*j as usize],
                    })
                }
            }
            Resolved::PoolEnum(j) => {
                if sccs.enum_component[*j as usize] == comp_id {
                    SubdefRef::LocalEnum(enum_local[*j as usize])
                } else {
                    SubdefRef::ForeignEnum(EnumDef {
                        group: Arc::clone(&groups[sccs.enum_component[*j as usize] as usize]),
                        idx: enum_local[*j as usize],
                    })
                }
            }
            Resolved::ExtMsg(d) => SubdefRef::ForeignMsg(d.clone()),
            Resolved::ExtEnum(d) => SubdefRef::ForeignEnum(d.clone()),
        };

        let default = resolve_default(pool, fb, r)?;
        let packed = fb
            .packed
            .unwrap_or(fb.label == Label::Repeated && fb.ty.is_packable()
                && mb.syntax == Syntax::Proto3);

        let selector_base = selector + selector_base_offset(fb);
        selector += selector_count_of(fb);

        if let Some(oneof) = mb.field_oneof[decl_idx as usize] {
            oneof_members[oneof as usize].push(frozen_idx as u32);
        }
        by_number.insert(u64::from(fb.number), frozen_idx as u32);
        by_name.insert(fb.name.as_bytes(), frozen_idx as u32);

        fields.push(FrozenField {
            name: fb.name.clone(),
            json_name: fb
                .json_name
                .clone()
                .unwrap_or_else(|| camel_case(&fb.name)),
            number: fb.number,
            ty: fb.ty,
            label: fb.label,
            packed,
            lazy: fb.lazy,
            is_extension: fb.is_extension,
            subdef,
            default,
            oneof_index: mb.field_oneof[decl_idx as usize],
            index: frozen_idx as u32,
            selector_base,
        });
    }

    let mut number_order: Vec<u32> = (0..fields.len() as u32).collect();
    number_order.sort_by_key(|&i| fields[i as usize].number);

    let oneofs = mb
        .oneofs
        .iter()
        .zip(oneof_members)
        .map(|(ob, members)| FrozenOneof {
            name: ob.name.clone(),
            fields: members,
        })
        .collect();

    Ok(FrozenMsg {
        full_name: mb.full_name.clone(),
        syntax: mb.syntax,
        map_entry: mb.map_entry,
        fields,
        number_order,
        by_number,
        by_name,
        oneofs,
        submsg_field_count,
        selector_count: selector,
    })
}

fn resolve_default(
    pool: &DefPool,
    fb: &FieldBuilder,
    r: &Resolved,
) -> Result<ResolvedDefault> {
    let Some(d) = &fb.default else {
        // Enum fields default to the enum's own default value.
        if fb.ty == FieldType::Enum {
            return Ok(match r {
                Resolved::PoolEnum(j) => {
                    let eb = &pool.enums[*j as usize];
                    ResolvedDefault::Enum(eb.default.unwrap_or(eb.values[0].1))
                }
                Resolved::ExtEnum(e) => ResolvedDefault::Enum(e.default()),
                _ => ResolvedDefault::None,
            });
        }
        return Ok(ResolvedDefault::None);
    };
    Ok(match d {
        DefaultValue::Int64(v) => ResolvedDefault::Int64(*v),
        DefaultValue::UInt64(v) => ResolvedDefault::UInt64(*v),
        DefaultValue::Int32(v) => ResolvedDefault::Int32(*v),
        DefaultValue::UInt32(v) => ResolvedDefault::UInt32(*v),
        DefaultValue::Bool(v) => ResolvedDefault::Bool(*v),
        DefaultValue::Float(v) => ResolvedDefault::Float(*v),
        DefaultValue::Double(v) => ResolvedDefault::Double(*v),
        DefaultValue::Bytes(v) => ResolvedDefault::Bytes(v.clone()),
        DefaultValue::EnumNumber(v) => ResolvedDefault::Enum(*v),
        DefaultValue::EnumName(name) => {
            let number = match r {
                Resolved::PoolEnum(j) => pool.enums[*j as usize]
                    .by_name
                    .get(name.as_bytes())
                    .copied(),
                Resolved::ExtEnum(e) => e.value_by_name(name),
                _ => None,
            };
            // Membership was checked during validation.
            ResolvedDefault::Enum(number.ok_or_else(|| Error::from_kind(ErrorKind::BadEnum))?)
        }
    })
}

fn freeze_enum(eb: &EnumBuilder) -> FrozenEnum {
    FrozenEnum {
        full_name: eb.full_name.clone(),
        values: eb.values.clone(),
        by_name: eb.by_name.clone(),
        by_number: eb.by_number.clone(),
        default: eb.default.unwrap_or(eb.values[0].1),
    }
}

impl DefPool {
    pub fn enum_add_value(&mut self, e: EnumId, name: &str, number: i32) -> Result<()> {
        let eb = &mut self.enums[e.0 as usize];
        if eb.by_name.contains_key(name.as_bytes()) {
            return Err(Error::from_kind(ErrorKind::DuplicateSymbol));
        }
        let idx = eb.values.len() as u32;
        eb.by_name.insert(name.as_bytes(), number);
        if !eb.by_number.contains_key(number as u32 as u64) {
            eb.by_number.insert(number as u32 as u64, idx);
        }
        eb.values.push((name.to_owned(), number));
        Ok(())
    }

    pub fn enum_set_default(&mut self, e: EnumId, number: i32) {
        self.enums[e.0 as usize].default = Some(number);
    }
}

/// The JSON name transform: upper-case the character following each
/// underscore, then delete the underscore.
pub fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for c in name.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Map entry message names capitalize the first letter as well.
fn upper_camel(name: &str) -> String {
    let camel = camel_case(name);
    let mut chars = camel.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => camel,
    }
}

//! A symbol table of frozen definitions.
//!
//! A [`SymbolTable`] accumulates frozen message and enum defs keyed by
//! fullname. Pools are added atomically: either every definition in the
//! pool freezes and lands in the table, or the table is left untouched.
//! Cross-pool references resolve through the table, so files can be
//! loaded one dependency at a time.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use log::debug;

use crate::defs::{DefPool, EnumDef, FileDef, MessageDef, SymDef};
use crate::{Error, ErrorKind, Result};

pub struct SymbolTable {
    syms: HashMap<String, SymDef>,
    files: Vec<FileDef>,
    max_depth: usize,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable::with_max_depth(crate::DEFAULT_MAX_NESTING)
    }

    /// `max_depth` bounds the depth of the message reference graph
    /// accepted at freeze time.
    pub fn with_max_depth(max_depth: usize) -> SymbolTable {
        SymbolTable {
            syms: HashMap::new(),
            files: Vec::new(),
            max_depth,
        }
    }

    /// Freezes `pool` and merges its definitions into the table.
    ///
    /// Symbolic references in the pool resolve first against the pool
    /// itself, then against defs already in the table. The merge is
    /// atomic: a freeze failure or a fullname collision with an existing
    /// entry leaves the table unchanged.
    pub fn add(&mut self, pool: DefPool) -> Result<()> {
        let frozen = pool.freeze_with_resolver(self.max_depth, &|name| {
            self.syms.get(name).cloned()
        })?;
        for m in &frozen.msgs {
            if self.syms.contains_key(m.full_name()) {
                let mut e = Error::from_kind(ErrorKind::DuplicateSymbol);
                use core::fmt::Write;
                let _ = write!(e, "{}", m.full_name());
                return Err(e);
            }
        }
        for en in &frozen.enums {
            if self.syms.contains_key(en.full_name()) {
                let mut e = Error::from_kind(ErrorKind::DuplicateSymbol);
                use core::fmt::Write;
                let _ = write!(e, "{}", en.full_name());
                return Err(e);
            }
        }
        debug!(
            "symtab add: {} messages, {} enums, {} files",
            frozen.msgs.len(),
            frozen.enums.len(),
            frozen.files.len()
        );
        for m in frozen.msgs {
            match self.syms.entry(m.full_name().to_owned()) {
                Entry::Vacant(slot) => {
                    slot.insert(SymDef::Msg(m));
                }
                // Unreachable after the collision scan; freeze guarantees
                // uniqueness within one pool.
                Entry::Occupied(_) => {}
            }
        }
        for en in frozen.enums {
            if let Entry::Vacant(slot) = self.syms.entry(en.full_name().to_owned()) {
                slot.insert(SymDef::Enum(en));
            }
        }
        self.files.extend(frozen.files);
        Ok(())
    }

    pub fn lookup(&self, full_name: &str) -> Option<&SymDef> {
        self.syms.get(full_name)
    }

    pub fn lookup_msg(&self, full_name: &str) -> Option<MessageDef> {
        match self.syms.get(full_name) {
            Some(SymDef::Msg(m)) => Some(m.clone()),
            _ => None,
        }
    }

    pub fn lookup_enum(&self, full_name: &str) -> Option<EnumDef> {
        match self.syms.get(full_name) {
            Some(SymDef::Enum(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Files in the order their pools were added.
    pub fn files(&self) -> &[FileDef] {
        &self.files
    }

    pub fn symbol_count(&self) -> usize {
        self.syms.len()
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        SymbolTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{FieldBuilder, Label, Syntax};
    use crate::wire::FieldType;

    #[test]
    fn lookup_finds_added_messages() {
        let mut pool = DefPool::new();
        let m = pool.add_msg("pkg.Person").unwrap();
        pool.add_field(m, FieldBuilder::new("id", 1, FieldType::Int32, Label::Optional))
            .unwrap();
        let mut tab = SymbolTable::new();
        tab.add(pool).unwrap();
        let person = tab.lookup_msg("pkg.Person").unwrap();
        assert_eq!(person.full_name(), "pkg.Person");
        assert!(tab.lookup_msg("pkg.Missing").is_none());
    }

    #[test]
    fn references_resolve_across_pools() {
        let mut first = DefPool::new();
        let addr = first.add_msg("pkg.Address").unwrap();
        first
            .add_field(
                addr,
                FieldBuilder::new("city", 1, FieldType::String, Label::Optional),
            )
            .unwrap();
        let mut tab = SymbolTable::new();
        tab.add(first).unwrap();

        let mut second = DefPool::new();
        let person = second.add_msg("pkg.Person").unwrap();
        second
            .add_field(
                person,
                FieldBuilder::new("home", 1, FieldType::Message, Label::Optional)
                    .subdef_name("pkg.Address"),
            )
            .unwrap();
        tab.add(second).unwrap();

        let person = tab.lookup_msg("pkg.Person").unwrap();
        let home = person.field_by_name("home").unwrap();
        assert_eq!(
            home.message_subdef().unwrap().full_name(),
            "pkg.Address"
        );
    }

    #[test]
    fn duplicate_fullname_rejects_whole_pool() {
        let mut first = DefPool::new();
        first.add_msg("pkg.A").unwrap();
        let mut tab = SymbolTable::new();
        tab.add(first).unwrap();

        let mut second = DefPool::new();
        second.add_msg("pkg.B").unwrap();
        second.add_msg("pkg.A").unwrap();
        let err = tab.add(second).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateSymbol);
        // Nothing from the failed pool landed.
        assert!(tab.lookup_msg("pkg.B").is_none());
        assert_eq!(tab.symbol_count(), 1);
    }

    #[test]
    fn unresolved_reference_fails_the_add() {
        let mut pool = DefPool::new();
        let m = pool.add_msg("pkg.Person").unwrap();
        pool.add_field(
            m,
            FieldBuilder::new("home", 1, FieldType::Message, Label::Optional)
                .subdef_name("pkg.Nowhere"),
        )
        .unwrap();
        let mut tab = SymbolTable::new();
        let err = tab.add(pool).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnresolvedSymbol);
        assert_eq!(tab.symbol_count(), 0);
    }

    #[test]
    fn files_accumulate_in_add_order() {
        let mut pool = DefPool::new();
        let f = pool.add_file("a.proto", "pkg", Syntax::Proto3);
        let m = pool.add_msg("pkg.A").unwrap();
        pool.file_add_msg(f, m);
        let mut tab = SymbolTable::new();
        tab.add(pool).unwrap();
        assert_eq!(tab.files().len(), 1);
        assert_eq!(tab.files()[0].name(), "a.proto");
    }
}

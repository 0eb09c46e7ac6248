//! The global symbol table: external names mapped to indirect binding slots,
//! with the per-name "best current definition" rule.
//!
//! The table owns the slot allocator for the indirect binding table. A slot
//! is created the first time a name is referenced and is never removed; its
//! entry graduates from unresolved to an atom as definitions arrive.

use std::collections::HashMap;

use crate::atom::{Atom, AtomId, Combine, Definition};
use crate::error::{Diagnostics, Error, Result};
use crate::input::Ordinal;
use crate::options::CommonsMode;
use crate::strpool::{Name, StringPool};

/// How `add` reacts when two non-weak regular definitions collide
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateTreatment {
    Error,
    Warning,
    Suppress,
}

/// Relative strength of a definition; stronger replaces weaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Strength {
    Undefined,
    Proxy,
    Tentative,
    RegularWeak,
    RegularStrong,
}

fn strength(atom: &Atom) -> Strength {
    match atom.definition {
        Definition::Proxy => Strength::Proxy,
        Definition::Tentative => Strength::Tentative,
        Definition::Absolute => Strength::RegularStrong,
        Definition::Regular => match atom.combine {
            Combine::Never => Strength::RegularStrong,
            _ => Strength::RegularWeak,
        },
    }
}

/// Name to indirect-binding-slot map plus the slot table itself
#[derive(Debug)]
pub struct SymbolTable {
    by_name: HashMap<Name, u32>,
    /// slot -> name, for diagnostics and LINKEDIT bind records
    slot_names: Vec<Name>,
    /// the indirect binding table: dense slot -> resolved atom
    indirect: Vec<Option<AtomId>>,
    by_content: HashMap<u64, Vec<u32>>,
    by_references: HashMap<u64, Vec<u32>>,
    commons_mode: CommonsMode,
    update_count: u32,
}

impl SymbolTable {
    pub fn new(commons_mode: CommonsMode) -> Self {
        SymbolTable {
            by_name: HashMap::new(),
            slot_names: Vec::new(),
            indirect: Vec::new(),
            by_content: HashMap::new(),
            by_references: HashMap::new(),
            commons_mode,
            update_count: 0,
        }
    }

    /// Bumped every time a slot is created or rebound; the resolver polls
    /// this to know when library searching has converged
    pub fn update_count(&self) -> u32 {
        self.update_count
    }

    pub fn slot_count(&self) -> u32 {
        self.indirect.len() as u32
    }

    /// Idempotent: creates an unresolved slot if the name is new
    pub fn find_slot_for_name(&mut self, name: Name) -> u32 {
        if let Some(&slot) = self.by_name.get(&name) {
            return slot;
        }
        let slot = self.indirect.len() as u32;
        self.indirect.push(None);
        self.slot_names.push(name);
        self.by_name.insert(name, slot);
        self.update_count = self.update_count.wrapping_add(1);
        slot
    }

    /// Content-keyed coalescing for literals and CFIs: returns the slot and
    /// the already-installed atom if one with identical content exists
    pub fn find_slot_for_content(&mut self, id: AtomId, atoms: &[Atom]) -> (u32, Option<AtomId>) {
        let hash = atoms[id.0 as usize].content_hash();
        if let Some(slots) = self.by_content.get(&hash) {
            for &slot in slots {
                if let Some(existing) = self.indirect[slot as usize] {
                    if same_content(&atoms[existing.0 as usize], &atoms[id.0 as usize]) {
                        return (slot, Some(existing));
                    }
                }
            }
        }
        let slot = self.new_anonymous_slot(id);
        self.by_content.entry(hash).or_default().push(slot);
        (slot, None)
    }

    /// Reference-keyed coalescing (ICF-style): content plus outgoing fixups
    pub fn find_slot_for_references(&mut self, id: AtomId, atoms: &[Atom]) -> (u32, Option<AtomId>) {
        let hash = references_hash(&atoms[id.0 as usize]);
        if let Some(slots) = self.by_references.get(&hash) {
            for &slot in slots {
                if let Some(existing) = self.indirect[slot as usize] {
                    if same_references(&atoms[existing.0 as usize], &atoms[id.0 as usize]) {
                        return (slot, Some(existing));
                    }
                }
            }
        }
        let slot = self.new_anonymous_slot(id);
        self.by_references.entry(hash).or_default().push(slot);
        (slot, None)
    }

    fn new_anonymous_slot(&mut self, id: AtomId) -> u32 {
        let slot = self.indirect.len() as u32;
        self.indirect.push(Some(id));
        // content slots have no name of their own; reuse the atom's if any
        self.slot_names.push(Name(u32::MAX));
        self.update_count = self.update_count.wrapping_add(1);
        slot
    }

    /// Installs `id` at its name's slot, applying the priority rule.
    /// Returns true if the new atom became the slot's definition; the loser
    /// (if any) is marked `coalesced_away`.
    pub fn add(
        &mut self,
        id: AtomId,
        atoms: &mut [Atom],
        ordinal_of: &dyn Fn(&Atom) -> Ordinal,
        duplicates: DuplicateTreatment,
        pool: &StringPool,
        diag: &mut Diagnostics,
    ) -> Result<bool> {
        let name = atoms[id.0 as usize]
            .name
            .expect("atom added to symbol table must be named");
        let slot = self.find_slot_for_name(name);
        let Some(existing) = self.indirect[slot as usize] else {
            self.indirect[slot as usize] = Some(id);
            self.update_count = self.update_count.wrapping_add(1);
            return Ok(true);
        };
        if existing == id {
            return Ok(true);
        }
        // an atom that already lost coalescing (or was replaced by LTO
        // codegen) never blocks a new definition
        if atoms[existing.0 as usize].coalesced_away {
            self.indirect[slot as usize] = Some(id);
            self.update_count = self.update_count.wrapping_add(1);
            return Ok(true);
        }

        let use_new = self.pick_new(existing, id, atoms, ordinal_of, duplicates, pool, diag)?;
        if use_new {
            atoms[existing.0 as usize].coalesced_away = true;
            self.indirect[slot as usize] = Some(id);
            self.update_count = self.update_count.wrapping_add(1);
        } else {
            atoms[id.0 as usize].coalesced_away = true;
        }
        Ok(use_new)
    }

    fn pick_new(
        &self,
        existing_id: AtomId,
        new_id: AtomId,
        atoms: &[Atom],
        ordinal_of: &dyn Fn(&Atom) -> Ordinal,
        duplicates: DuplicateTreatment,
        pool: &StringPool,
        diag: &mut Diagnostics,
    ) -> Result<bool> {
        let existing = &atoms[existing_id.0 as usize];
        let new = &atoms[new_id.0 as usize];
        let es = strength(existing);
        let ns = strength(new);
        let name = pool.resolve(new.name.unwrap());

        // two strong regular definitions is a duplicate symbol
        if es == Strength::RegularStrong && ns == Strength::RegularStrong {
            // absolute definitions never coalesce either
            match duplicates {
                DuplicateTreatment::Error => {
                    return Err(Error::Resolve(format!("duplicate symbol {name}")));
                }
                DuplicateTreatment::Warning => {
                    diag.warning(format!("duplicate symbol {name} (keeping first definition)"));
                    return Ok(false);
                }
                DuplicateTreatment::Suppress => return Ok(false),
            }
        }

        if ns != es {
            // among tentatives the rule is size, not strength
            return Ok(ns > es);
        }

        match ns {
            Strength::Tentative => {
                // largest size wins, then max alignment
                if new.size() != existing.size() {
                    Ok(new.size() > existing.size())
                } else if new.alignment.power_of_2 != existing.alignment.power_of_2 {
                    Ok(new.alignment.power_of_2 > existing.alignment.power_of_2)
                } else {
                    Ok(ordinal_of(new) < ordinal_of(existing))
                }
            }
            Strength::Proxy => Ok(ordinal_of(new) < ordinal_of(existing)),
            // both weak: lower file ordinal wins
            _ => Ok(ordinal_of(new) < ordinal_of(existing)),
        }
    }

    /// A dylib definition arriving via the -commons use_dylibs second-chance
    /// scan: replaces the tentative at the slot
    pub fn replace_tentative_with_proxy(&mut self, name: Name, proxy: AtomId, atoms: &mut [Atom]) {
        if self.commons_mode != CommonsMode::UseDylibs {
            return;
        }
        if let Some(&slot) = self.by_name.get(&name) {
            if let Some(existing) = self.indirect[slot as usize] {
                if atoms[existing.0 as usize].definition == Definition::Tentative {
                    atoms[existing.0 as usize].coalesced_away = true;
                    self.indirect[slot as usize] = Some(proxy);
                    self.update_count = self.update_count.wrapping_add(1);
                }
            }
        }
    }

    /// Is the name defined (slot exists and is bound)?
    pub fn has_name(&self, name: Name) -> bool {
        self.by_name
            .get(&name)
            .is_some_and(|&slot| self.indirect[slot as usize].is_some())
    }

    pub fn slot_for_name(&self, name: Name) -> Option<u32> {
        self.by_name.get(&name).copied()
    }

    pub fn atom_for_name(&self, name: Name) -> Option<AtomId> {
        self.by_name
            .get(&name)
            .and_then(|&slot| self.indirect[slot as usize])
    }

    pub fn atom_for_slot(&self, slot: u32) -> Option<AtomId> {
        self.indirect[slot as usize]
    }

    pub fn name_for_slot(&self, slot: u32) -> Option<Name> {
        let name = self.slot_names[slot as usize];
        if name == Name(u32::MAX) { None } else { Some(name) }
    }

    pub fn bind_slot(&mut self, slot: u32, id: AtomId) {
        self.indirect[slot as usize] = Some(id);
        self.update_count = self.update_count.wrapping_add(1);
    }

    /// Names with a slot but no definition, in slot order
    pub fn undefines(&self) -> Vec<Name> {
        let mut undefs = Vec::new();
        for (slot, entry) in self.indirect.iter().enumerate() {
            if entry.is_none() {
                let name = self.slot_names[slot];
                if name != Name(u32::MAX) {
                    undefs.push(name);
                }
            }
        }
        undefs
    }

    pub fn has_tentative_definitions(&self, atoms: &[Atom]) -> bool {
        self.indirect.iter().any(|entry| {
            entry.is_some_and(|id| atoms[id.0 as usize].definition == Definition::Tentative)
        })
    }

    pub fn tentative_defs(&self, atoms: &[Atom]) -> Vec<Name> {
        let mut tents = Vec::new();
        for entry in self.indirect.iter() {
            if let Some(id) = entry {
                let atom = &atoms[id.0 as usize];
                if atom.definition == Definition::Tentative {
                    if let Some(name) = atom.name {
                        tents.push(name);
                    }
                }
            }
        }
        tents
    }

    /// Forget undefined slots whose names are not in the keep set; used after
    /// dead-stripping removes the only referrers
    pub fn remove_dead_undefs(&mut self, keep: &dyn Fn(Name) -> bool) {
        let dead: Vec<Name> = self
            .by_name
            .iter()
            .filter(|&(name, &slot)| self.indirect[slot as usize].is_none() && !keep(*name))
            .map(|(&name, _)| name)
            .collect();
        for name in dead {
            if let Some(slot) = self.by_name.remove(&name) {
                self.slot_names[slot as usize] = Name(u32::MAX);
            }
        }
    }

    /// Unbind slots whose atoms did not survive dead-stripping
    pub fn remove_dead_atoms(&mut self, atoms: &[Atom]) {
        for entry in self.indirect.iter_mut() {
            if let Some(id) = entry {
                if !atoms[id.0 as usize].live {
                    *entry = None;
                }
            }
        }
        self.update_count = self.update_count.wrapping_add(1);
    }

    /// Final consistency check: every named global definition occupies its
    /// own slot (the priority rule already errored on true duplicates)
    pub fn check_duplicate_symbols(&self, atoms: &[Atom], pool: &StringPool) -> Result<()> {
        for (slot, entry) in self.indirect.iter().enumerate() {
            if let Some(id) = entry {
                let atom = &atoms[id.0 as usize];
                if let Some(name) = atom.name {
                    let canonical = self.slot_names[slot];
                    if canonical != Name(u32::MAX) && canonical != name && !atom.alias {
                        return Err(Error::Resolve(format!(
                            "symbol table slot for {} bound to atom named {}",
                            pool.resolve(canonical),
                            pool.resolve(name)
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Hands the finished indirect binding table to the internal state
    pub fn take_indirect_table(&mut self) -> Vec<Option<AtomId>> {
        std::mem::take(&mut self.indirect)
    }

    pub fn indirect_table(&self) -> &[Option<AtomId>] {
        &self.indirect
    }
}

fn same_content(a: &Atom, b: &Atom) -> bool {
    a.size() == b.size() && a.raw_content() == b.raw_content() && a.fixups.len() == b.fixups.len()
}

fn same_references(a: &Atom, b: &Atom) -> bool {
    if !same_content(a, b) {
        return false;
    }
    a.fixups
        .iter()
        .zip(b.fixups.iter())
        .all(|(fa, fb)| fa.kind == fb.kind && fa.offset_in_atom == fb.offset_in_atom && fa.binding == fb.binding)
}

fn references_hash(atom: &Atom) -> u64 {
    let mut h = atom.content_hash();
    for fixup in &atom.fixups {
        let tag = match fixup.binding {
            crate::atom::FixupBinding::DirectlyBound(id) => 0x1_0000_0000u64 | u64::from(id.0),
            crate::atom::FixupBinding::IndirectlyBound(slot) => 0x2_0000_0000u64 | u64::from(slot),
            crate::atom::FixupBinding::ByNameUnbound(name) => 0x3_0000_0000u64 | u64::from(name.0),
            crate::atom::FixupBinding::ByContentBound(id) => 0x4_0000_0000u64 | u64::from(id.0),
            crate::atom::FixupBinding::None => 0,
        };
        h = h.rotate_left(13) ^ tag;
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{AtomContent, Section, SectionType};
    use crate::constants::{SECT_TEXT, SEG_TEXT};

    fn named_atom(pool: &mut StringPool, name: &str, definition: Definition, combine: Combine) -> Atom {
        let mut atom = Atom::new(
            Section::new(SEG_TEXT, SECT_TEXT, SectionType::Code),
            definition,
            AtomContent::Bytes(vec![0; 8]),
        );
        atom.name = Some(pool.intern(name));
        atom.combine = combine;
        atom.scope = crate::atom::Scope::Global;
        atom
    }

    fn fixed_ordinal(_: &Atom) -> Ordinal {
        Ordinal::from_arg_list(0)
    }

    #[test]
    fn round_trip_add_then_find() {
        let mut pool = StringPool::new();
        let mut atoms = vec![named_atom(&mut pool, "_foo", Definition::Regular, Combine::Never)];
        let mut table = SymbolTable::new(CommonsMode::IgnoreDylibs);
        let mut diag = Diagnostics::default();
        let name = atoms[0].name.unwrap();
        table
            .add(AtomId(0), &mut atoms, &fixed_ordinal, DuplicateTreatment::Error, &pool, &mut diag)
            .unwrap();
        let slot = table.find_slot_for_name(name);
        assert_eq!(table.atom_for_slot(slot), Some(AtomId(0)));
        assert_eq!(table.atom_for_name(name), Some(AtomId(0)));
    }

    #[test]
    fn strong_beats_weak() {
        let mut pool = StringPool::new();
        let mut atoms = vec![
            named_atom(&mut pool, "_foo", Definition::Regular, Combine::ByName),
            named_atom(&mut pool, "_foo", Definition::Regular, Combine::Never),
        ];
        let mut table = SymbolTable::new(CommonsMode::IgnoreDylibs);
        let mut diag = Diagnostics::default();
        table
            .add(AtomId(0), &mut atoms, &fixed_ordinal, DuplicateTreatment::Error, &pool, &mut diag)
            .unwrap();
        table
            .add(AtomId(1), &mut atoms, &fixed_ordinal, DuplicateTreatment::Error, &pool, &mut diag)
            .unwrap();
        let name = atoms[1].name.unwrap();
        assert_eq!(table.atom_for_name(name), Some(AtomId(1)));
        assert!(atoms[0].coalesced_away);
        assert!(!atoms[1].coalesced_away);
        // and the reverse order keeps the strong one
        let mut atoms2 = vec![
            named_atom(&mut pool, "_bar", Definition::Regular, Combine::Never),
            named_atom(&mut pool, "_bar", Definition::Regular, Combine::ByName),
        ];
        let mut table2 = SymbolTable::new(CommonsMode::IgnoreDylibs);
        table2
            .add(AtomId(0), &mut atoms2, &fixed_ordinal, DuplicateTreatment::Error, &pool, &mut diag)
            .unwrap();
        table2
            .add(AtomId(1), &mut atoms2, &fixed_ordinal, DuplicateTreatment::Error, &pool, &mut diag)
            .unwrap();
        assert_eq!(table2.atom_for_name(atoms2[0].name.unwrap()), Some(AtomId(0)));
        assert!(atoms2[1].coalesced_away);
    }

    #[test]
    fn duplicate_strong_is_error() {
        let mut pool = StringPool::new();
        let mut atoms = vec![
            named_atom(&mut pool, "_foo", Definition::Regular, Combine::Never),
            named_atom(&mut pool, "_foo", Definition::Regular, Combine::Never),
        ];
        let mut table = SymbolTable::new(CommonsMode::IgnoreDylibs);
        let mut diag = Diagnostics::default();
        table
            .add(AtomId(0), &mut atoms, &fixed_ordinal, DuplicateTreatment::Error, &pool, &mut diag)
            .unwrap();
        assert!(
            table
                .add(AtomId(1), &mut atoms, &fixed_ordinal, DuplicateTreatment::Error, &pool, &mut diag)
                .is_err()
        );
        // suppressed duplicates keep the first
        let mut diag = Diagnostics::default();
        let mut table = SymbolTable::new(CommonsMode::IgnoreDylibs);
        atoms[0].coalesced_away = false;
        atoms[1].coalesced_away = false;
        table
            .add(AtomId(0), &mut atoms, &fixed_ordinal, DuplicateTreatment::Suppress, &pool, &mut diag)
            .unwrap();
        let kept = table
            .add(AtomId(1), &mut atoms, &fixed_ordinal, DuplicateTreatment::Suppress, &pool, &mut diag)
            .unwrap();
        assert!(!kept);
        assert!(atoms[1].coalesced_away);
    }

    #[test]
    fn biggest_tentative_wins() {
        let mut pool = StringPool::new();
        let mut small = named_atom(&mut pool, "_common", Definition::Tentative, Combine::ByName);
        small.content = AtomContent::Zeroes(8);
        let mut big = named_atom(&mut pool, "_common", Definition::Tentative, Combine::ByName);
        big.content = AtomContent::Zeroes(16);
        let mut atoms = vec![small, big];
        let mut table = SymbolTable::new(CommonsMode::IgnoreDylibs);
        let mut diag = Diagnostics::default();
        table
            .add(AtomId(0), &mut atoms, &fixed_ordinal, DuplicateTreatment::Error, &pool, &mut diag)
            .unwrap();
        table
            .add(AtomId(1), &mut atoms, &fixed_ordinal, DuplicateTreatment::Error, &pool, &mut diag)
            .unwrap();
        assert_eq!(table.atom_for_name(atoms[1].name.unwrap()), Some(AtomId(1)));
    }

    #[test]
    fn real_definition_beats_proxy() {
        let mut pool = StringPool::new();
        let mut atoms = vec![
            named_atom(&mut pool, "_puts", Definition::Proxy, Combine::Never),
            named_atom(&mut pool, "_puts", Definition::Regular, Combine::Never),
        ];
        atoms[0].content = AtomContent::Zeroes(0);
        let mut table = SymbolTable::new(CommonsMode::IgnoreDylibs);
        let mut diag = Diagnostics::default();
        table
            .add(AtomId(0), &mut atoms, &fixed_ordinal, DuplicateTreatment::Error, &pool, &mut diag)
            .unwrap();
        table
            .add(AtomId(1), &mut atoms, &fixed_ordinal, DuplicateTreatment::Error, &pool, &mut diag)
            .unwrap();
        assert_eq!(table.atom_for_name(atoms[1].name.unwrap()), Some(AtomId(1)));
        assert!(atoms[0].coalesced_away);
    }

    #[test]
    fn content_coalescing_finds_twin() {
        let mut pool = StringPool::new();
        let mut a = named_atom(&mut pool, "_lit1", Definition::Regular, Combine::ByNameAndContent);
        a.content = AtomContent::Bytes(b"hello\0\0\0".to_vec());
        let mut b = named_atom(&mut pool, "_lit2", Definition::Regular, Combine::ByNameAndContent);
        b.content = AtomContent::Bytes(b"hello\0\0\0".to_vec());
        let atoms = vec![a, b];
        let mut table = SymbolTable::new(CommonsMode::IgnoreDylibs);
        let (slot1, existing1) = table.find_slot_for_content(AtomId(0), &atoms);
        assert!(existing1.is_none());
        let (slot2, existing2) = table.find_slot_for_content(AtomId(1), &atoms);
        assert_eq!(slot1, slot2);
        assert_eq!(existing2, Some(AtomId(0)));
    }

    #[test]
    fn undefines_lists_unbound_names() {
        let mut pool = StringPool::new();
        let missing = pool.intern("_missing");
        let mut table = SymbolTable::new(CommonsMode::IgnoreDylibs);
        table.find_slot_for_name(missing);
        assert_eq!(table.undefines(), vec![missing]);
        assert!(!table.has_name(missing));
    }
}

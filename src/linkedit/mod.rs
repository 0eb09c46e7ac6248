//! The LINKEDIT emitter: dyld info streams, the export trie, classic
//! relocations, the symbol/string/indirect tables, function starts,
//! data-in-code, split-seg info, stabs, and the content UUID.

use std::collections::HashMap;
use std::ops::Range;

use md5::{Digest, Md5};
use scroll::{IOwrite, Pwrite, SizeWith};

use crate::atom::{
    AtomId, Combine, ContentType, Definition, FixupBinding, FixupKind, Scope, SectionType,
    SymbolTableInclusion, WeakImportState,
};
use crate::constants::*;
use crate::error::{Error, Result};
use crate::options::{Options, OutputKind, UndefinedTreatment};
use crate::state::LinkState;
use crate::symbol_table::SymbolTable;

pub mod dyld_info;
pub mod export_trie;
pub mod relocs;

use dyld_info::{BindEntry, OrdinalMap, RebaseEntry, SegmentMap};
use export_trie::{ExportEntry, ExportKind};
use relocs::{RelocCluster, SectionRelocs, SymbolIndexes};

/// A symbolic-debugging entry carried through from a relocatable input
#[derive(Debug, Clone)]
pub struct Stab {
    pub atom: Option<AtomId>,
    pub typ: u8,
    pub other: u8,
    pub desc: u16,
    pub value: u64,
    pub string: String,
}

#[repr(C)]
#[derive(Clone, Copy, Default, Pwrite, IOwrite, SizeWith)]
pub struct Nlist32 {
    /// index into the string table
    pub n_strx: u32,
    /// type flag
    pub n_type: u8,
    /// section number or NO_SECT
    pub n_sect: u8,
    /// see <mach-o/stab.h>
    pub n_desc: u16,
    /// value of this symbol (or stab offset)
    pub n_value: u32,
}

pub const SIZEOF_NLIST_32: usize = 12;

#[repr(C)]
#[derive(Clone, Copy, Default, Pwrite, IOwrite, SizeWith)]
pub struct Nlist64 {
    /// index into the string table
    pub n_strx: u32,
    /// type flag
    pub n_type: u8,
    /// section number or NO_SECT
    pub n_sect: u8,
    /// see <mach-o/stab.h>
    pub n_desc: u16,
    /// value of this symbol (or stab offset)
    pub n_value: u64,
}

pub const SIZEOF_NLIST_64: usize = 16;

impl From<Nlist64> for Nlist32 {
    /// Narrows a symbol record for a 32-bit output; addresses on those
    /// targets always fit 32 bits
    fn from(nlist: Nlist64) -> Self {
        Nlist32 {
            n_strx: nlist.n_strx,
            n_type: nlist.n_type,
            n_sect: nlist.n_sect,
            n_desc: nlist.n_desc,
            n_value: nlist.n_value as u32,
        }
    }
}

/// Everything LINKEDIT-shaped the writer concatenates after the sections
#[derive(Debug, Default)]
pub struct Linkedit {
    pub rebase_info: Vec<u8>,
    pub bind_info: Vec<u8>,
    pub weak_bind_info: Vec<u8>,
    pub lazy_bind_info: Vec<u8>,
    pub export_trie: Vec<u8>,
    /// lazy pointer address -> offset of its lazy bind record; the fixup
    /// applier consumes this for SetLazyOffset
    pub lazy_binding_offsets: HashMap<u64, u32>,

    pub symbol_table: Vec<u8>,
    pub string_pool: Vec<u8>,
    pub indirect_symbol_table: Vec<u8>,
    pub local_symbol_count: u32,
    pub external_symbol_count: u32,
    pub undefined_symbol_count: u32,
    /// symbol-table index per atom, for relocs and indirect entries
    pub symbol_indexes: HashMap<AtomId, u32>,

    /// per final-section relocation entries (object-file output only)
    pub section_relocs: Vec<SectionRelocs>,

    pub function_starts: Vec<u8>,
    pub data_in_code: Vec<u8>,
    pub split_seg_info: Vec<u8>,

    /// byte range of the stabs nlist entries within `symbol_table`
    pub stabs_nlist_range: Range<usize>,
    /// byte range of the stabs strings within `string_pool`
    pub stabs_string_range: Range<usize>,
}

impl SymbolIndexes for Linkedit {
    fn symbol_index(&self, atom: AtomId) -> Option<u32> {
        self.symbol_indexes.get(&atom).copied()
    }
}

/// Drives LINKEDIT emission after layout and fixup targets are final
pub struct LinkeditWriter<'a> {
    pub opts: &'a Options,
    pub table: &'a SymbolTable,
}

impl<'a> LinkeditWriter<'a> {
    pub fn new(opts: &'a Options, table: &'a SymbolTable) -> Self {
        LinkeditWriter { opts, table }
    }

    pub fn emit(&self, state: &mut LinkState) -> Result<Linkedit> {
        let mut out = Linkedit::default();
        assign_macho_sections(state);
        self.emit_symbol_table(state, &mut out)?;
        self.emit_indirect_symbol_table(state, &mut out)?;
        if self.opts.output_kind == OutputKind::ObjectFile {
            self.emit_section_relocs(state, &mut out)?;
        } else if self.opts.make_compressed_dyld_info {
            self.emit_dyld_info(state, &mut out)?;
        }
        self.emit_export_trie(state, &mut out);
        self.emit_function_starts(state, &mut out);
        self.emit_data_in_code(state, &mut out)?;
        if self.opts.shared_region_eligible {
            self.emit_split_seg_info(state, &mut out)?;
        }
        Ok(out)
    }

    // ---- symbol table ----

    fn emit_symbol_table(&self, state: &mut LinkState, out: &mut Linkedit) -> Result<()> {
        let final_image = self.opts.output_kind.is_final_image();
        let mut locals: Vec<AtomId> = Vec::new();
        let mut globals: Vec<AtomId> = Vec::new();
        let mut undefs: Vec<AtomId> = Vec::new();
        for sect in &state.sections {
            for &id in &sect.atoms {
                let atom = state.atom(id);
                if atom.name.is_none() {
                    continue;
                }
                match atom.inclusion {
                    SymbolTableInclusion::NotIn => continue,
                    SymbolTableInclusion::NotInFinalLinkedImages if final_image => continue,
                    _ => {}
                }
                match atom.definition {
                    Definition::Proxy => undefs.push(id),
                    _ if atom.scope == Scope::Global && !atom.auto_hide => globals.push(id),
                    _ if atom.scope == Scope::LinkageUnit && self.opts.keep_private_externs => {
                        globals.push(id)
                    }
                    _ => locals.push(id),
                }
            }
        }
        // each partition is alphabetical by name
        let by_name = |state: &LinkState, ids: &mut Vec<AtomId>| {
            ids.sort_by(|&a, &b| {
                let an = state.pool.resolve(state.atom(a).name.unwrap());
                let bn = state.pool.resolve(state.atom(b).name.unwrap());
                an.cmp(bn)
            });
        };
        by_name(state, &mut locals);
        by_name(state, &mut globals);
        by_name(state, &mut undefs);

        // 32-bit architectures carry 12-byte nlist records, 64-bit 16-byte
        let is_64 = self.opts.architecture & cputype::CPU_ARCH_ABI64 != 0;
        let nlist_size = if is_64 { SIZEOF_NLIST_64 } else { SIZEOF_NLIST_32 };

        // string pool index 0 is traditionally a single space
        let mut strings: Vec<u8> = vec![b' ', 0];
        let mut nlists: Vec<Nlist64> = Vec::new();

        // stabs come first among the locals
        let stabs_string_start = strings.len();
        let stabs_nlist_start = 0usize;
        for stab in &state.stabs {
            let n_strx = if stab.string.is_empty() {
                0
            } else {
                add_string(&mut strings, &stab.string)
            };
            let n_value = match stab.atom {
                Some(id) if state.atom(id).has_final_address() => state.atom(id).final_address(),
                _ => stab.value,
            };
            nlists.push(Nlist64 {
                n_strx,
                n_type: stab.typ,
                n_sect: stab.atom.map(|id| state.atom(id).macho_section).unwrap_or(NO_SECT),
                n_desc: stab.desc,
                n_value,
            });
        }
        let stabs_nlist_end = nlists.len() * nlist_size;
        let stabs_string_end = strings.len();

        let ordinals = self.dylib_ordinals(state);
        for &id in locals.iter().chain(globals.iter()).chain(undefs.iter()) {
            let index = nlists.len() as u32;
            out.symbol_indexes.insert(id, index);
            nlists.push(self.nlist_for(state, id, &mut strings, &ordinals)?);
        }

        let mut bytes = vec![0u8; nlists.len() * nlist_size];
        let mut offset = 0usize;
        for nlist in &nlists {
            if is_64 {
                bytes.pwrite_with(*nlist, offset, scroll::LE)?;
            } else {
                bytes.pwrite_with(Nlist32::from(*nlist), offset, scroll::LE)?;
            }
            offset += nlist_size;
        }
        out.symbol_table = bytes;
        out.string_pool = strings;
        out.local_symbol_count = (state.stabs.len() + locals.len()) as u32;
        out.external_symbol_count = globals.len() as u32;
        out.undefined_symbol_count = undefs.len() as u32;
        out.stabs_nlist_range = stabs_nlist_start..stabs_nlist_end;
        out.stabs_string_range = stabs_string_start..stabs_string_end;
        Ok(())
    }

    fn nlist_for(
        &self,
        state: &LinkState,
        id: AtomId,
        strings: &mut Vec<u8>,
        ordinals: &HashMap<u32, u8>,
    ) -> Result<Nlist64> {
        let atom = state.atom(id);
        let name = state.pool.resolve(atom.name.unwrap());
        let n_strx = add_string(strings, name);
        let mut n_desc = 0u16;
        if atom.thumb {
            n_desc |= N_ARM_THUMB_DEF;
        }
        if atom.dead_strip == crate::atom::DeadStrip::Never
            && self.opts.output_kind == OutputKind::ObjectFile
        {
            n_desc |= N_NO_DEAD_STRIP;
        }
        match atom.definition {
            Definition::Proxy => {
                if atom.weak_import == WeakImportState::True {
                    n_desc |= N_WEAK_REF;
                }
                let ordinal = atom
                    .file
                    .and_then(|f| ordinals.get(&f).copied())
                    .unwrap_or(if self.opts.undefined_treatment == UndefinedTreatment::DynamicLookup {
                        DYNAMIC_LOOKUP_ORDINAL
                    } else {
                        SELF_LIBRARY_ORDINAL
                    });
                n_desc |= u16::from(ordinal) << 8;
                Ok(Nlist64 {
                    n_strx,
                    n_type: N_UNDF | N_EXT,
                    n_sect: NO_SECT,
                    n_desc,
                    n_value: 0,
                })
            }
            Definition::Absolute => {
                let n_type = N_ABS
                    | if atom.scope == Scope::Global { N_EXT } else { 0 }
                    | if atom.scope == Scope::LinkageUnit { N_PEXT | N_EXT } else { 0 };
                Ok(Nlist64 {
                    n_strx,
                    n_type,
                    n_sect: NO_SECT,
                    n_desc,
                    n_value: atom.object_address,
                })
            }
            Definition::Regular | Definition::Tentative => {
                if atom.combine == Combine::ByName {
                    n_desc |= N_WEAK_DEF;
                }
                let mut n_type = N_SECT;
                match atom.scope {
                    Scope::Global => n_type |= N_EXT,
                    Scope::LinkageUnit if self.opts.keep_private_externs => {
                        n_type |= N_PEXT | N_EXT;
                    }
                    _ => {}
                }
                if atom.macho_section == 0 {
                    return Err(Error::Linkedit(format!(
                        "symbol {name} has no assigned output section"
                    )));
                }
                Ok(Nlist64 {
                    n_strx,
                    n_type,
                    n_sect: atom.macho_section,
                    n_desc,
                    n_value: atom.final_address(),
                })
            }
        }
    }

    /// file index -> two-level namespace ordinal (1-based, high byte of n_desc)
    fn dylib_ordinals(&self, state: &LinkState) -> HashMap<u32, u8> {
        let mut map = HashMap::new();
        let mut next = 1u8;
        for dylib in &state.dylibs {
            if dylib.is_dead {
                continue;
            }
            map.insert(dylib.file_index, next);
            next = next.saturating_add(1);
        }
        map
    }

    // ---- indirect symbol table ----

    fn emit_indirect_symbol_table(&self, state: &mut LinkState, out: &mut Linkedit) -> Result<()> {
        let mut words: Vec<u32> = Vec::new();
        for sect_ix in 0..state.sections.len() {
            let typ = state.sections[sect_ix].typ();
            let wants_entries = matches!(
                typ,
                SectionType::Stub
                    | SectionType::StubClose
                    | SectionType::LazyPointer
                    | SectionType::LazyPointerClose
                    | SectionType::LazyDylibPointer
                    | SectionType::NonLazyPointer
                    | SectionType::TLVPointers
            );
            if !wants_entries {
                continue;
            }
            state.sections[sect_ix].indirect_sym_index = Some(words.len() as u32);
            let atom_ids = state.sections[sect_ix].atoms.clone();
            for id in atom_ids {
                let target = first_bound_target(state, self.table, id);
                let word = match target {
                    Some(target) => {
                        let tatom = state.atom(target);
                        if tatom.definition == Definition::Absolute {
                            INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS
                        } else if tatom.scope != Scope::Global || tatom.auto_hide {
                            INDIRECT_SYMBOL_LOCAL
                        } else {
                            out.symbol_indexes
                                .get(&target)
                                .copied()
                                .ok_or_else(|| {
                                    Error::Linkedit(format!(
                                        "indirect symbol not assigned for atom {}",
                                        target.0
                                    ))
                                })?
                        }
                    }
                    None => INDIRECT_SYMBOL_LOCAL,
                };
                words.push(word);
            }
        }
        let mut bytes = vec![0u8; words.len() * 4];
        let mut offset = 0;
        for word in words {
            bytes.pwrite_with(word, offset, scroll::LE)?;
            offset += 4;
        }
        out.indirect_symbol_table = bytes;
        Ok(())
    }

    // ---- dyld info ----

    fn emit_dyld_info(&self, state: &mut LinkState, out: &mut Linkedit) -> Result<()> {
        let segments = SegmentMap::from_state(state);
        let mut ordinal_map = OrdinalMap::new();
        // assign ordinals in load order so they match the load commands
        for dylib in &state.dylibs {
            if !dylib.is_dead {
                ordinal_map.ordinal_for(&dylib.install_path);
            }
        }
        let mut rebases: Vec<RebaseEntry> = Vec::new();
        let mut binds: Vec<BindEntry> = Vec::new();
        let mut lazy_binds: Vec<BindEntry> = Vec::new();
        let mut weak_binds: Vec<BindEntry> = Vec::new();

        for sect_ix in 0..state.sections.len() {
            let sect_type = state.sections[sect_ix].typ();
            let in_read_only_seg = state.sections[sect_ix].segment_name() == SEG_TEXT;
            let atom_ids = state.sections[sect_ix].atoms.clone();
            for id in atom_ids {
                // regular atoms that override a dylib's weak definition get a
                // strong-override record dyld uses to pick this image
                {
                    let atom = state.atom(id);
                    if atom.scope == Scope::Global && atom.overrides_dylib_weak_def {
                        weak_binds.push(BindEntry {
                            typ: BIND_TYPE_OVERRIDE_OF_WEAKDEF_IN_DYLIB,
                            ordinal: 0,
                            symbol_name: state.pool.resolve(atom.name.unwrap()).to_string(),
                            weak_import: false,
                            strong_override: atom.combine == Combine::Never,
                            address: atom.final_address(),
                            addend: 0,
                        });
                    }
                }
                for cluster in decompose_clusters(state, self.table, id) {
                    let Some(target) = cluster.target else { continue };
                    if cluster.minus_target.is_some() {
                        // pointer differences are position-independent
                        continue;
                    }
                    let is_pointer_store = match cluster.store_kind {
                        Some(kind) if kind.is_pc_rel_store() => {
                            // pc-relative stores never need records; a proxy
                            // target went through a stub
                            continue;
                        }
                        Some(kind) => matches!(kind.store_size(), Some(4) | Some(8)),
                        None => false,
                    };
                    if !is_pointer_store && !cluster.lazy {
                        continue;
                    }
                    let address = state.atom(id).final_address() + u64::from(cluster.offset_in_atom);
                    let (t_def, t_scope, t_combine, t_name, t_weak) = {
                        let t = state.atom(target);
                        (t.definition, t.scope, t.combine, t.name, t.weak_import)
                    };
                    let weak_import = cluster.weak_import || t_weak == WeakImportState::True;
                    match t_def {
                        Definition::Proxy => {
                            let name = state.pool.resolve(t_name.unwrap()).to_string();
                            let ordinal = self.proxy_ordinal(state, target, &mut ordinal_map);
                            let entry = BindEntry {
                                typ: BIND_TYPE_POINTER,
                                ordinal,
                                symbol_name: name,
                                weak_import,
                                strong_override: false,
                                address,
                                addend: cluster.target_addend,
                            };
                            let lazy = cluster.lazy
                                || sect_type == SectionType::LazyPointer
                                || sect_type == SectionType::LazyPointerClose;
                            if lazy && !self.opts.bind_at_load {
                                lazy_binds.push(entry);
                            } else {
                                if in_read_only_seg {
                                    state.sections[sect_ix].has_external_relocs = true;
                                }
                                binds.push(entry);
                            }
                        }
                        Definition::Regular | Definition::Tentative => {
                            let mut needs_rebase = self.opts.output_slidable();
                            let mut needs_bind = false;
                            let mut needs_weak_bind = false;
                            if t_scope == Scope::Global {
                                let name = state.pool.resolve(t_name.unwrap());
                                if t_combine == Combine::ByName && t_def == Definition::Regular {
                                    needs_weak_bind = true;
                                } else if self.opts.interposable(name) {
                                    needs_rebase = false;
                                    needs_bind = true;
                                }
                            }
                            if needs_rebase {
                                if in_read_only_seg {
                                    state.sections[sect_ix].has_local_relocs = true;
                                }
                                rebases.push(RebaseEntry {
                                    typ: if in_read_only_seg
                                        && cluster.store_kind.and_then(FixupKind::store_size)
                                            == Some(4)
                                    {
                                        REBASE_TYPE_TEXT_ABSOLUTE32
                                    } else {
                                        REBASE_TYPE_POINTER
                                    },
                                    address,
                                });
                            }
                            let name = match t_name {
                                Some(n) => state.pool.resolve(n),
                                None => "",
                            };
                            if needs_bind {
                                binds.push(BindEntry {
                                    typ: BIND_TYPE_POINTER,
                                    ordinal: i32::from(BIND_SPECIAL_DYLIB_SELF),
                                    symbol_name: name.to_string(),
                                    weak_import: false,
                                    strong_override: false,
                                    address,
                                    addend: cluster.target_addend,
                                });
                            }
                            if needs_weak_bind {
                                weak_binds.push(BindEntry {
                                    typ: BIND_TYPE_POINTER,
                                    ordinal: 0,
                                    symbol_name: name.to_string(),
                                    weak_import: false,
                                    strong_override: false,
                                    address,
                                    addend: cluster.target_addend,
                                });
                            }
                        }
                        Definition::Absolute => {}
                    }
                }
            }
        }

        out.rebase_info = dyld_info::encode_rebase_info(&mut rebases, &segments, 8)?;
        out.bind_info = dyld_info::encode_bind_info(&mut binds, &segments)?;
        let (lazy_stream, lazy_offsets) = dyld_info::encode_lazy_bind_info(&lazy_binds, &segments)?;
        out.lazy_bind_info = lazy_stream;
        out.lazy_binding_offsets = lazy_offsets;
        out.weak_bind_info = dyld_info::encode_weak_bind_info(&mut weak_binds, &segments)?;
        Ok(())
    }

    fn proxy_ordinal(&self, state: &LinkState, proxy: AtomId, ordinals: &mut OrdinalMap) -> i32 {
        let atom = state.atom(proxy);
        if let Some(file) = atom.file {
            if let Some(dylib) = state.dylibs.iter().find(|d| d.file_index == file) {
                return ordinals.ordinal_for(&dylib.install_path);
            }
        }
        if self.opts.undefined_treatment == UndefinedTreatment::DynamicLookup {
            i32::from(BIND_SPECIAL_DYLIB_FLAT_LOOKUP)
        } else {
            i32::from(BIND_SPECIAL_DYLIB_SELF)
        }
    }

    // ---- export trie ----

    fn emit_export_trie(&self, state: &LinkState, out: &mut Linkedit) {
        if self.opts.output_kind == OutputKind::ObjectFile
            || self.opts.output_kind == OutputKind::StaticExecutable
            || self.opts.output_kind == OutputKind::Preload
        {
            return;
        }
        let mh_address = state.mach_header_address();
        let mut exports: Vec<ExportEntry> = Vec::new();
        for sect in &state.sections {
            for &id in &sect.atoms {
                let atom = state.atom(id);
                if atom.scope != Scope::Global || atom.auto_hide {
                    continue;
                }
                let Some(name) = atom.name else { continue };
                let name = state.pool.resolve(name).to_string();
                if !self.opts.should_export(&name) {
                    continue;
                }
                match atom.definition {
                    Definition::Proxy => {
                        // a global proxy means a re-export of the dylib symbol
                        let ordinal = atom
                            .file
                            .and_then(|f| {
                                state.dylibs.iter().position(|d| d.file_index == f)
                            })
                            .map(|pos| pos as u32 + 1)
                            .unwrap_or(0);
                        exports.push(ExportEntry {
                            name: name.clone(),
                            flags: EXPORT_SYMBOL_FLAGS_KIND_REGULAR | EXPORT_SYMBOL_FLAGS_REEXPORT,
                            kind: ExportKind::ReExport { ordinal, import_name: name },
                        });
                    }
                    Definition::Absolute => {
                        exports.push(ExportEntry {
                            name,
                            flags: EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE,
                            kind: ExportKind::Regular { address: atom.object_address },
                        });
                    }
                    Definition::Regular | Definition::Tentative => {
                        let mut flags = if sect.typ() == SectionType::TLVDefs {
                            EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL
                        } else {
                            EXPORT_SYMBOL_FLAGS_KIND_REGULAR
                        };
                        if atom.combine == Combine::ByName {
                            flags |= EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION;
                        }
                        if atom.content_type == ContentType::Resolver {
                            flags |= EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER;
                            exports.push(ExportEntry {
                                name,
                                flags,
                                kind: ExportKind::Resolver {
                                    address: atom.final_address() - mh_address,
                                    resolver_address: atom.final_address() - mh_address,
                                },
                            });
                            continue;
                        }
                        exports.push(ExportEntry {
                            name,
                            flags,
                            kind: ExportKind::Regular {
                                address: atom.final_address() - mh_address,
                            },
                        });
                    }
                }
            }
        }
        out.export_trie = export_trie::encode_export_trie(exports);
    }

    // ---- classic relocations ----

    fn emit_section_relocs(&self, state: &mut LinkState, out: &mut Linkedit) -> Result<()> {
        let mut all: Vec<SectionRelocs> = (0..state.sections.len())
            .map(|_| SectionRelocs::default())
            .collect();
        for sect_ix in 0..state.sections.len() {
            let atom_ids = state.sections[sect_ix].atoms.clone();
            for id in atom_ids {
                for cluster in decompose_clusters(state, self.table, id) {
                    let (Some(target), Some(store_kind)) = (cluster.target, cluster.store_kind)
                    else {
                        continue;
                    };
                    let reloc_cluster = RelocCluster {
                        atom: id,
                        offset_in_atom: cluster.offset_in_atom,
                        store_kind,
                        target,
                        minus_target: cluster.minus_target,
                        target_addend: cluster.target_addend,
                    };
                    relocs::add_section_relocs(
                        self.opts,
                        state,
                        sect_ix,
                        &mut all[sect_ix],
                        &reloc_cluster,
                        out,
                    )?;
                }
            }
        }
        out.section_relocs = all;
        Ok(())
    }

    // ---- function starts / data in code / split seg ----

    fn emit_function_starts(&self, state: &LinkState, out: &mut Linkedit) {
        let mh_address = state.mach_header_address();
        let mut addresses: Vec<u64> = Vec::new();
        for sect in &state.sections {
            if sect.typ() != SectionType::Code {
                continue;
            }
            for &id in &sect.atoms {
                let atom = state.atom(id);
                if atom.content_type == ContentType::BranchIsland
                    || atom.inclusion == SymbolTableInclusion::NotIn
                {
                    continue;
                }
                // thumb bit marks interworking entry points
                let mut address = atom.final_address();
                if atom.thumb {
                    address |= 1;
                }
                addresses.push(address);
            }
        }
        addresses.sort_unstable();
        let mut stream = Vec::new();
        let mut prev = mh_address;
        for address in addresses {
            dyld_info::append_uleb128(&mut stream, address - prev);
            prev = address;
        }
        if !stream.is_empty() {
            stream.push(0);
        }
        out.function_starts = stream;
    }

    fn emit_data_in_code(&self, state: &mut LinkState, out: &mut Linkedit) -> Result<()> {
        // DICE_KIND_* values from <mach-o/loader.h>
        fn dice_kind(kind: FixupKind) -> u16 {
            match kind {
                FixupKind::DataInCodeStartData => 1,
                FixupKind::DataInCodeStartJT8 => 2,
                FixupKind::DataInCodeStartJT16 => 3,
                FixupKind::DataInCodeStartJT32 => 4,
                FixupKind::DataInCodeStartJTA32 => 5,
                _ => 0,
            }
        }
        let mh_address = state.mach_header_address();
        let mut entries: Vec<(u32, u16, u16)> = Vec::new();
        for sect in &state.sections {
            for &id in &sect.atoms {
                let atom = state.atom(id);
                let mut open: Option<(u32, u16)> = None;
                for fixup in &atom.fixups {
                    if !fixup.kind.is_data_in_code() {
                        continue;
                    }
                    let offset =
                        (atom.final_address() + u64::from(fixup.offset_in_atom) - mh_address) as u32;
                    if fixup.kind == FixupKind::DataInCodeEnd {
                        if let Some((start, kind)) = open.take() {
                            entries.push((start, (offset - start) as u16, kind));
                        }
                    } else {
                        open = Some((offset, dice_kind(fixup.kind)));
                    }
                }
            }
        }
        state.has_data_in_code = !entries.is_empty();
        let mut bytes = vec![0u8; entries.len() * 8];
        let mut offset = 0;
        for (off, len, kind) in entries {
            bytes.pwrite_with(off, offset, scroll::LE)?;
            bytes.pwrite_with(len, offset + 4, scroll::LE)?;
            bytes.pwrite_with(kind, offset + 6, scroll::LE)?;
            offset += 8;
        }
        out.data_in_code = bytes;
        Ok(())
    }

    /// Records every `__TEXT` fixup whose target lives in another segment.
    /// For ARM low/high-16 pairs the carry-producing half is marked.
    fn emit_split_seg_info(&self, state: &LinkState, out: &mut Linkedit) -> Result<()> {
        let segments = SegmentMap::from_state(state);
        // reference kind -> pointer locations
        let mut by_kind: Vec<(u8, Vec<u64>)> = Vec::new();
        let mut add = |kind: u8, address: u64| {
            for (k, list) in by_kind.iter_mut() {
                if *k == kind {
                    list.push(address);
                    return;
                }
            }
            by_kind.push((kind, vec![address]));
        };
        for sect in &state.sections {
            if sect.segment_name() != SEG_TEXT {
                continue;
            }
            for &id in &sect.atoms {
                for cluster in decompose_clusters(state, self.table, id) {
                    let (Some(target), Some(store_kind)) = (cluster.target, cluster.store_kind)
                    else {
                        continue;
                    };
                    let target_atom = state.atom(target);
                    if !target_atom.has_final_address() {
                        continue;
                    }
                    let (src_seg, _) = segments.locate(state.atom(id).final_address())?;
                    let (dst_seg, _) = match segments.locate(target_atom.final_address()) {
                        Ok(loc) => loc,
                        Err(_) => continue,
                    };
                    if src_seg == dst_seg {
                        continue;
                    }
                    let address = state.atom(id).final_address() + u64::from(cluster.offset_in_atom);
                    let kind = match store_kind {
                        FixupKind::StoreARMLow16 | FixupKind::StoreThumbLow16 => 2,
                        // the high half carries the borrow from the low half
                        FixupKind::StoreARMHigh16 | FixupKind::StoreThumbHigh16 => 3,
                        _ => 1,
                    };
                    add(kind, address);
                }
            }
        }
        let mut stream = Vec::new();
        for (kind, mut addresses) in by_kind {
            addresses.sort_unstable();
            stream.push(kind);
            let mut prev = 0u64;
            for address in addresses {
                dyld_info::append_uleb128(&mut stream, address - prev);
                prev = address;
            }
            stream.push(0);
        }
        if !stream.is_empty() {
            stream.push(0);
        }
        out.split_seg_info = stream;
        Ok(())
    }
}

/// Walks every atom giving each non-hidden section its 1-based Mach-O
/// section ordinal
pub fn assign_macho_sections(state: &mut LinkState) {
    let mut ordinal = 0u8;
    for sect_ix in 0..state.sections.len() {
        if state.sections[sect_ix].is_hidden() {
            continue;
        }
        ordinal = ordinal.saturating_add(1);
        let atom_ids = state.sections[sect_ix].atoms.clone();
        for id in atom_ids {
            state.atom_mut(id).macho_section = ordinal;
        }
    }
}

/// One decomposed fixup cluster: the target, subtrahend, addends, and the
/// storing fixup, gathered the way the LINKEDIT walk needs them
pub struct DecomposedCluster {
    pub offset_in_atom: u32,
    pub target: Option<AtomId>,
    pub minus_target: Option<AtomId>,
    pub target_addend: i64,
    pub minus_target_addend: i64,
    pub store_kind: Option<FixupKind>,
    pub weak_import: bool,
    /// the cluster's target was set by LazyTarget: this is the lazy binding
    /// of a lazy pointer, evaluated by dyld on first call
    pub lazy: bool,
}

/// Splits an atom's fixup stream into clusters with targets resolved
pub fn decompose_clusters(
    state: &LinkState,
    table: &SymbolTable,
    id: AtomId,
) -> Vec<DecomposedCluster> {
    let mut clusters = Vec::new();
    let atom = state.atom(id);
    let mut current: Option<DecomposedCluster> = None;
    for fixup in &atom.fixups {
        if fixup.cluster.is_first() {
            current = Some(DecomposedCluster {
                offset_in_atom: fixup.offset_in_atom,
                target: None,
                minus_target: None,
                target_addend: 0,
                minus_target_addend: 0,
                store_kind: None,
                weak_import: false,
                lazy: false,
            });
        }
        let Some(cluster) = current.as_mut() else { continue };
        let resolve = |binding: FixupBinding| -> Option<AtomId> {
            match binding {
                FixupBinding::DirectlyBound(t) | FixupBinding::ByContentBound(t) => Some(t),
                FixupBinding::IndirectlyBound(slot) => table.atom_for_slot(slot),
                _ => None,
            }
        };
        if fixup.kind.sets_target() {
            if let Some(t) = resolve(fixup.binding) {
                cluster.target = Some(t);
                cluster.weak_import |= fixup.weak_import;
            }
            if fixup.kind == FixupKind::LazyTarget {
                cluster.lazy = true;
            }
        }
        match fixup.kind {
            FixupKind::AddAddend(a) => cluster.target_addend = a,
            FixupKind::SubtractAddend(a) => cluster.minus_target_addend = a,
            FixupKind::SubtractTargetAddress => {
                cluster.minus_target = resolve(fixup.binding);
            }
            _ => {}
        }
        if fixup.kind.is_store() {
            cluster.store_kind = Some(fixup.kind);
        }
        if fixup.cluster.is_last() {
            clusters.push(current.take().unwrap());
        }
    }
    clusters
}

/// First atom a fixup of `id` is bound to, for indirect-table emission
fn first_bound_target(state: &LinkState, table: &SymbolTable, id: AtomId) -> Option<AtomId> {
    state.atom(id).fixups.iter().find_map(|f| match f.binding {
        FixupBinding::DirectlyBound(t) | FixupBinding::ByContentBound(t) => Some(t),
        FixupBinding::IndirectlyBound(slot) => table.atom_for_slot(slot),
        FixupBinding::ByNameUnbound(n) => table.atom_for_name(n),
        FixupBinding::None => None,
    })
}

fn add_string(strings: &mut Vec<u8>, s: &str) -> u32 {
    let offset = strings.len() as u32;
    strings.extend_from_slice(s.as_bytes());
    strings.push(0);
    offset
}

/// Digests the image bytes into a content UUID, excluding the stabs ranges
/// so debug builds of identical code hash identically, then forces the
/// RFC 4122 version and variant bits.
pub fn content_uuid(image: &[u8], exclude: &[Range<usize>]) -> [u8; 16] {
    let mut hasher = Md5::new();
    let mut pos = 0usize;
    let mut ranges: Vec<&Range<usize>> = exclude.iter().filter(|r| !r.is_empty()).collect();
    ranges.sort_by_key(|r| r.start);
    for range in ranges {
        if range.start > pos {
            hasher.update(&image[pos..range.start.min(image.len())]);
        }
        pos = range.end.min(image.len()).max(pos);
    }
    if pos < image.len() {
        hasher.update(&image[pos..]);
    }
    let digest = hasher.finalize();
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&digest);
    // set the version to 3 (MD5) and the variant to RFC 4122
    uuid[6] = (uuid[6] & 0x0F) | 0x30;
    uuid[8] = (uuid[8] & 0x3F) | 0x80;
    uuid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_sets_rfc4122_bits() {
        let uuid = content_uuid(b"some image bytes", &[]);
        assert_eq!(uuid[6] & 0xF0, 0x30);
        assert_eq!(uuid[8] & 0xC0, 0x80);
    }

    #[test]
    fn uuid_ignores_excluded_ranges() {
        let a = content_uuid(b"AAAAstabsBBBB", &[(4..9)]);
        let b = content_uuid(b"AAAAstubsBBBB", &[(4..9)]);
        let c = content_uuid(b"AAAAstabsBBBB", &[]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn string_pool_appends_nul_terminated() {
        let mut strings = vec![b' ', 0];
        let a = add_string(&mut strings, "_main");
        let b = add_string(&mut strings, "_x");
        assert_eq!(a, 2);
        assert_eq!(b, 8);
        assert_eq!(&strings[2..8], b"_main\0".as_slice());
    }
}

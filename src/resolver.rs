//! The resolver drives atom ingestion and graph closure: undefined symbols
//! are chased through libraries, tentative definitions get their second
//! chance, dead atoms are stripped, aliases are synced, and every surviving
//! atom lands in its final section.

use std::collections::{HashMap, HashSet};

use crate::atom::{
    Atom, AtomContent, AtomId, Combine, ContentType, DeadStrip, Definition, Fixup, FixupBinding,
    FixupKind, Scope, Section, SectionType, SymbolTableInclusion,
};
use crate::error::{Diagnostics, Error, Result};
use crate::input::{InputSet, Ordinal, SearchHit};
use crate::options::{CommonsMode, Options, OutputKind, UndefinedTreatment};
use crate::state::{DylibRecord, LinkState};
use crate::strpool::Name;
use crate::symbol_table::{DuplicateTreatment, SymbolTable};

/// Link-time-optimization backend hook. The real codegen lives outside the
/// core; it receives the names of live LTO-provisional atoms and returns the
/// machine-code atoms it produced, names interned into `pool` at handover.
pub trait LtoBackend {
    fn compile(
        &mut self,
        live_symbols: &[String],
        pool: &mut crate::strpool::StringPool,
    ) -> Result<Vec<Atom>>;
}

/// Drives resolution from parsed inputs to a populated [`LinkState`]
pub struct Resolver<'a> {
    opts: &'a Options,
    inputs: &'a mut dyn InputSet,
    pub state: LinkState,
    pub symbol_table: SymbolTable,
    pub diag: Diagnostics,
    /// the flat atom list, in ingestion order
    atoms: Vec<AtomId>,
    file_ordinals: HashMap<u32, Ordinal>,
    initial_undefine_names: Vec<Name>,
    loaded_archive_paths: Vec<String>,
    completed_initial_files: bool,
    have_aliases: bool,
    have_llvm_objs: bool,
    lto_finished: bool,
}

impl<'a> Resolver<'a> {
    pub fn new(opts: &'a Options, inputs: &'a mut dyn InputSet) -> Self {
        Resolver {
            opts,
            inputs,
            state: LinkState::new(),
            symbol_table: SymbolTable::new(opts.commons_mode),
            diag: Diagnostics::new(opts.fatal_warnings),
            atoms: Vec::new(),
            file_ordinals: HashMap::new(),
            initial_undefine_names: Vec::new(),
            loaded_archive_paths: Vec::new(),
            completed_initial_files: false,
            have_aliases: false,
            have_llvm_objs: false,
            lto_finished: false,
        }
    }

    /// Runs every resolution phase in order
    pub fn resolve(&mut self, lto: Option<&mut dyn LtoBackend>) -> Result<()> {
        self.initialize_state();
        self.build_atom_list()?;
        self.add_initial_undefines();
        self.fill_in_helpers()?;
        self.resolve_all_undefines()?;
        if self.opts.dead_code_strip {
            self.dead_strip_optimize();
        }
        self.check_undefines(false)?;
        self.check_dylib_symbol_collisions();
        if self.have_aliases {
            self.sync_aliases();
        }
        self.remove_coalesced_away_atoms();
        self.fill_in_entry_point()?;
        self.link_time_optimize(lto)?;
        self.fill_in_internal_state();
        self.tweak_weakness();
        self.symbol_table.check_duplicate_symbols(&self.state.atoms, &self.state.pool)?;
        self.build_archives_list();
        Ok(())
    }

    /// Surrenders the populated state and table to the caller (the writer)
    pub fn into_parts(mut self) -> (LinkState, SymbolTable, Diagnostics) {
        self.state.indirect_binding_table = self.symbol_table.indirect_table().to_vec();
        (self.state, self.symbol_table, self.diag)
    }

    pub fn live_atoms(&self) -> &[AtomId] {
        &self.atoms
    }

    // ---- phase 1 ----

    fn initialize_state(&mut self) {
        self.state.cpu_subtype = self.opts.sub_architecture;
    }

    // ---- phase 2 ----

    fn build_atom_list(&mut self) -> Result<()> {
        struct InitialFile {
            index: u32,
            ordinal: Ordinal,
            atoms: Vec<Atom>,
            swift_version: u32,
            objc_constraint: u32,
            path: String,
            linker_options: Vec<Vec<String>>,
        }
        let mut files: Vec<InitialFile> = Vec::new();
        for (index, f) in self.inputs.initial_files().into_iter().enumerate() {
            files.push(InitialFile {
                index: index as u32,
                ordinal: f.ordinal(),
                atoms: f.atoms(&mut self.state.pool),
                swift_version: f.swift_version(),
                objc_constraint: f.objc_constraint(),
                path: f.path().to_string(),
                linker_options: f.linker_options(),
            });
        }
        for file in files {
            self.file_ordinals.insert(file.index, file.ordinal);
            for option in &file.linker_options {
                self.do_linker_option(option, &file.path);
            }
            if file.swift_version != 0 {
                if self.state.swift_version == 0 {
                    self.state.swift_version = file.swift_version;
                } else if self.state.swift_version != file.swift_version {
                    self.diag.warning(format!(
                        "object files built with different Swift versions ({} and {})",
                        self.state.swift_version, file.swift_version
                    ));
                }
            }
            if file.objc_constraint != 0 {
                self.state.has_objc = true;
                self.state.objc_constraint = self.state.objc_constraint.max(file.objc_constraint);
            }
            self.ingest_atoms(file.atoms, Some(file.index))?;
        }
        // dylib records for ordinal assignment and weak-def scanning
        let dylibs: Vec<DylibRecord> = self
            .inputs
            .dylibs()
            .into_iter()
            .map(|(file_index, d)| DylibRecord {
                install_path: d.install_path().to_string(),
                current_version: d.current_version(),
                compatibility_version: d.compatibility_version(),
                timestamp: d.timestamp(),
                linkage: d.linkage(),
                has_weak_externals: d.has_weak_externals(),
                is_dead: d.is_dead(),
                file_index,
            })
            .collect();
        self.state.dylibs = dylibs;
        self.completed_initial_files = true;
        Ok(())
    }

    /// Accumulates one LC_LINKER_OPTION vector from an object file
    fn do_linker_option(&mut self, option: &[String], file_name: &str) {
        match option {
            [single] => {
                if let Some(lib) = single.strip_prefix("-l") {
                    if !self.state.linker_option_libraries.iter().any(|l| l == lib) {
                        self.state.linker_option_libraries.push(lib.to_string());
                    }
                } else {
                    self.diag.warning(format!(
                        "unknown linker option from object file ignored: '{single}' in {file_name}"
                    ));
                }
            }
            [flag, framework] if flag == "-framework" => {
                if !self.state.linker_option_frameworks.iter().any(|f| f == framework) {
                    self.state.linker_option_frameworks.push(framework.clone());
                }
            }
            _ => {
                self.diag.warning(format!(
                    "unknown linker option from object file ignored, starting with: '{}' from {file_name}",
                    option.first().map(String::as_str).unwrap_or("")
                ));
            }
        }
    }

    /// Moves a batch of parsed atoms into the arena. `DirectlyBound` and
    /// `ByContentBound` fixups arrive with file-local indices and are rebased
    /// onto the arena here.
    fn ingest_atoms(&mut self, parsed: Vec<Atom>, file_index: Option<u32>) -> Result<Vec<AtomId>> {
        let base = self.state.atoms.len() as u32;
        let mut ids = Vec::with_capacity(parsed.len());
        for mut atom in parsed {
            atom.file = file_index;
            for fixup in atom.fixups.iter_mut() {
                match fixup.binding {
                    FixupBinding::DirectlyBound(local) => {
                        fixup.binding = FixupBinding::DirectlyBound(AtomId(base + local.0));
                    }
                    FixupBinding::ByContentBound(local) => {
                        fixup.binding = FixupBinding::ByContentBound(AtomId(base + local.0));
                    }
                    _ => {}
                }
            }
            ids.push(self.state.push_atom(atom)?);
        }
        for &id in &ids {
            self.do_atom(id)?;
        }
        Ok(ids)
    }

    /// Every atom enters the link through here exactly once
    fn do_atom(&mut self, id: AtomId) -> Result<()> {
        self.atoms.push(id);

        // sanity-check alignment: modulus must fit under the power of two
        {
            let atom = self.state.atom(id);
            let align = atom.alignment;
            if u64::from(align.modulus) >= (1u64 << align.power_of_2) {
                return Err(Error::Malformed(format!(
                    "atom alignment modulus {} not below 2^{}",
                    align.modulus, align.power_of_2
                )));
            }
        }

        self.adjust_scope(id)?;

        // kernel workaround: static kernels use 'l' labels in assembly
        {
            let atom = self.state.atom(id);
            if atom.inclusion == SymbolTableInclusion::NotInFinalLinkedImages
                && self.opts.output_kind == OutputKind::StaticExecutable
            {
                if let Some(name) = atom.name {
                    let s = self.state.pool.resolve(name);
                    if s.starts_with('l') && !s.starts_with("ltmp") {
                        self.state.atom_mut(id).inclusion = SymbolTableInclusion::In;
                    }
                }
            }
        }

        // tell the symbol table about non-static atoms
        let (scope, name) = {
            let atom = self.state.atom(id);
            (atom.scope, atom.name)
        };
        if scope != Scope::TranslationUnit && name.is_some() {
            let duplicates = if self.opts.dead_code_strip {
                if self.opts.allow_dead_duplicates {
                    DuplicateTreatment::Suppress
                } else if self.completed_initial_files {
                    DuplicateTreatment::Warning
                } else {
                    DuplicateTreatment::Error
                }
            } else {
                DuplicateTreatment::Error
            };
            let ordinals = &self.file_ordinals;
            let ordinal_of = move |atom: &Atom| -> Ordinal {
                atom.file
                    .and_then(|f| ordinals.get(&f).copied())
                    .unwrap_or(Ordinal::lto(0xFFFF))
            };
            self.symbol_table.add(
                id,
                &mut self.state.atoms,
                &ordinal_of,
                duplicates,
                &self.state.pool,
                &mut self.diag,
            )?;

            // push command-line aliases when the real name arrives
            if !self.opts.aliases.is_empty() {
                let atom_name = self.state.pool.resolve(name.unwrap()).to_string();
                let pairs: Vec<_> = self
                    .opts
                    .aliases
                    .iter()
                    .filter(|p| p.real_name == atom_name)
                    .cloned()
                    .collect();
                for pair in pairs {
                    if pair.real_name == pair.alias {
                        self.diag.warning(format!("ignoring alias of itself '{}'", pair.real_name));
                        continue;
                    }
                    self.make_alias_atom(id, &pair.alias)?;
                    self.have_aliases = true;
                }
            }
        }

        self.convert_references_to_indirect(id);

        let content_type = self.state.atom(id).content_type;
        if content_type == ContentType::LTOtemporary {
            self.have_llvm_objs = true;
        }
        if self.state.atom(id).alias || self.state.atom(id).section.typ == SectionType::TempAlias {
            self.have_aliases = true;
        }
        Ok(())
    }

    /// Applies export/re-export lists to the atom's visibility
    fn adjust_scope(&mut self, id: AtomId) -> Result<()> {
        if !self.opts.has_export_restrict_list() && !self.opts.has_re_export_list() {
            return Ok(());
        }
        let (scope, name, definition) = {
            let atom = self.state.atom(id);
            (atom.scope, atom.name, atom.definition)
        };
        let Some(name) = name else { return Ok(()) };
        let name_str = self.state.pool.resolve(name).to_string();
        match scope {
            Scope::TranslationUnit => {}
            Scope::LinkageUnit => {
                if self.opts.has_export_mask_list() && self.opts.should_export(&name_str) {
                    if self.opts.output_kind == OutputKind::ObjectFile {
                        return Err(Error::Resolve(format!("cannot export hidden symbol {name_str}")));
                    }
                    if definition == Definition::Proxy {
                        // an export list names a symbol that lives in a dylib
                        if self.opts.can_re_export_symbols() {
                            self.state.atom_mut(id).scope = Scope::Global;
                        } else {
                            self.diag.warning(format!(
                                "target OS does not support re-exporting symbol {}",
                                demangle(&name_str)
                            ));
                        }
                    } else {
                        self.diag
                            .warning(format!("cannot export hidden symbol {}", demangle(&name_str)));
                    }
                } else if self.opts.should_re_export(&name_str) {
                    if definition == Definition::Proxy {
                        if self.opts.can_re_export_symbols() {
                            self.state.atom_mut(id).scope = Scope::Global;
                        } else {
                            self.diag.warning(format!(
                                "target OS does not support re-exporting symbol {}",
                                demangle(&name_str)
                            ));
                        }
                    } else {
                        return Err(Error::Resolve(format!(
                            "requested re-export symbol {} is not from a dylib",
                            demangle(&name_str)
                        )));
                    }
                }
            }
            Scope::Global => {
                if !self.opts.should_export(&name_str) {
                    self.state.atom_mut(id).scope = Scope::LinkageUnit;
                } else if self.opts.should_re_export(&name_str)
                    && self.opts.can_re_export_symbols()
                    && definition != Definition::Proxy
                {
                    return Err(Error::Resolve(format!(
                        "requested re-export symbol {} is not from a dylib",
                        demangle(&name_str)
                    )));
                }
            }
        }
        Ok(())
    }

    /// Rewrites by-name and by-content fixup bindings to indirect slots
    fn convert_references_to_indirect(&mut self, id: AtomId) {
        let final_image = self.opts.output_kind != OutputKind::ObjectFile;
        let fixup_count = self.state.atom(id).fixups.len();
        for i in 0..fixup_count {
            let (kind, binding) = {
                let f = &self.state.atom(id).fixups[i];
                (f.kind, f.binding)
            };
            match binding {
                FixupBinding::ByNameUnbound(name) => {
                    if kind.is_dtrace_probe() && final_image {
                        // in final linked images the probe reference vanishes
                        self.state.atom_mut(id).fixups[i].binding = FixupBinding::None;
                    } else {
                        let slot = self.symbol_table.find_slot_for_name(name);
                        self.state.atom_mut(id).fixups[i].binding = FixupBinding::IndirectlyBound(slot);
                    }
                }
                FixupBinding::ByContentBound(target) => {
                    let combine = self.state.atom(target).combine;
                    let slot = match combine {
                        Combine::ByNameAndContent => {
                            self.symbol_table.find_slot_for_content(target, &self.state.atoms).0
                        }
                        Combine::ByNameAndReferences => {
                            self.symbol_table.find_slot_for_references(target, &self.state.atoms).0
                        }
                        _ => {
                            // wrong combine mode for bind-by-content; bind direct
                            self.state.atom_mut(id).fixups[i].binding =
                                FixupBinding::DirectlyBound(target);
                            continue;
                        }
                    };
                    self.state.atom_mut(id).fixups[i].binding = FixupBinding::IndirectlyBound(slot);
                }
                _ => {}
            }
        }
    }

    // ---- phase 3 ----

    fn add_initial_undefines(&mut self) {
        for undef in &self.opts.initial_undefines {
            let name = self.state.pool.intern(undef);
            self.symbol_table.find_slot_for_name(name);
            self.initial_undefine_names.push(name);
        }
        if self.opts.needs_entry_point() {
            if let Some(entry) = &self.opts.entry_name {
                let name = self.state.pool.intern(entry);
                self.symbol_table.find_slot_for_name(name);
                self.initial_undefine_names.push(name);
            }
        }
    }

    // ---- phase 4 ----

    /// Resolves the stub/lazy binding helper names against libraries
    fn fill_in_helpers(&mut self) -> Result<()> {
        let needs_stub_helper = matches!(
            self.opts.output_kind,
            OutputKind::DynamicExecutable | OutputKind::DynamicLibrary | OutputKind::DynamicBundle
        );
        if !needs_stub_helper {
            return Ok(());
        }
        if self.opts.make_compressed_dyld_info {
            self.state.compressed_fast_binder = self.resolve_helper("dyld_stub_binder")?;
        } else {
            self.state.classic_binder = self.resolve_helper("__dyld_func_lookup")?;
            self.state.lazy_binder = self.resolve_helper("dyld_lazy_binder")?;
        }
        Ok(())
    }

    fn resolve_helper(&mut self, helper: &str) -> Result<Option<AtomId>> {
        let name = self.state.pool.intern(helper);
        if !self.symbol_table.has_name(name) {
            if let Some(hit) =
                self.inputs.search_libraries(helper, &mut self.state.pool, true, false, false)?
            {
                self.ingest_search_hit(hit)?;
            }
        }
        Ok(self.symbol_table.atom_for_name(name))
    }

    fn ingest_search_hit(&mut self, hit: SearchHit) -> Result<Vec<AtomId>> {
        self.file_ordinals.insert(hit.file_index, hit.ordinal);
        if hit.from_archive {
            if self.opts.trace_archives {
                log::debug!("[Logging for XBS] Used static archive: {}", hit.path);
            }
            self.loaded_archive_paths.push(hit.path);
        }
        self.ingest_atoms(hit.atoms, Some(hit.file_index))
    }

    // ---- phase 5 ----

    fn resolve_current_undefines(&mut self) -> Result<()> {
        let undefs = self.symbol_table.undefines();
        for name in undefs {
            // a load for a previous undefine may have defined this one too
            if self.symbol_table.has_name(name) {
                continue;
            }
            let name_str = self.state.pool.resolve(name).to_string();
            if let Some(hit) =
                self.inputs.search_libraries(&name_str, &mut self.state.pool, true, true, false)?
            {
                self.ingest_search_hit(hit)?;
            }
            if !self.symbol_table.has_name(name) && self.opts.output_kind != OutputKind::ObjectFile {
                if let Some(id) = self.make_boundary_atom(&name_str)? {
                    let slot = self.symbol_table.find_slot_for_name(name);
                    self.symbol_table.bind_slot(slot, id);
                }
            }
        }
        Ok(())
    }

    fn resolve_all_undefines(&mut self) -> Result<()> {
        // keep resolving undefines and tentative overrides until no more
        // undefines were added in the last pass
        let mut gen_count = u32::MAX;
        while gen_count != self.symbol_table.update_count() {
            let mut inner = u32::MAX;
            while inner != self.symbol_table.update_count() {
                inner = self.symbol_table.update_count();
                self.resolve_current_undefines()?;
            }
            gen_count = inner;

            // search archives (and dylibs under -commons use_dylibs) for
            // overrides of common symbols
            if self.symbol_table.has_tentative_definitions(&self.state.atoms) {
                let search_dylibs = self.opts.commons_mode == CommonsMode::UseDylibs;
                let tents = self.symbol_table.tentative_defs(&self.state.atoms);
                for tent in tents {
                    let Some(cur) = self.symbol_table.atom_for_name(tent) else { continue };
                    if self.state.atom(cur).definition != Definition::Tentative {
                        continue;
                    }
                    let tent_str = self.state.pool.resolve(tent).to_string();
                    if let Some(hit) = self.inputs.search_libraries(
                        &tent_str,
                        &mut self.state.pool,
                        search_dylibs,
                        true,
                        true,
                    )? {
                        let ids = self.ingest_search_hit(hit)?;
                        if search_dylibs {
                            for id in ids {
                                if self.state.atom(id).definition == Definition::Proxy
                                    && self.state.atom(id).name == Some(tent)
                                {
                                    self.symbol_table.replace_tentative_with_proxy(
                                        tent,
                                        id,
                                        &mut self.state.atoms,
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }

        // auto-linked libraries named by LC_LINKER_OPTION get one more try
        // at the remaining undefines
        if !self.state.linker_option_libraries.is_empty()
            || !self.state.linker_option_frameworks.is_empty()
        {
            for name in self.symbol_table.undefines() {
                if self.symbol_table.has_name(name) {
                    continue;
                }
                let name_str = self.state.pool.resolve(name).to_string();
                if let Some(hit) =
                    self.inputs.search_libraries(&name_str, &mut self.state.pool, true, true, false)?
                {
                    self.ingest_search_hit(hit)?;
                }
            }
        }

        // create proxies as needed for the undefined treatment in effect
        if self.opts.undefined_treatment != UndefinedTreatment::Error
            || self.opts.output_kind == OutputKind::ObjectFile
        {
            for name in self.symbol_table.undefines() {
                let name_str = self.state.pool.resolve(name).to_string();
                // "-r -exported_symbol _foo" with _foo undefined must error
                let make_proxy = !(self.opts.output_kind == OutputKind::ObjectFile
                    && self.opts.has_export_mask_list()
                    && self.opts.should_export(&name_str));
                if make_proxy {
                    self.make_undefined_proxy(name)?;
                }
            }
        }

        // -U allowed undefines become proxies too
        if self.opts.some_allowed_undefines() {
            for name in self.symbol_table.undefines() {
                let name_str = self.state.pool.resolve(name).to_string();
                if self.opts.allowed_undefined(&name_str) {
                    self.make_undefined_proxy(name)?;
                }
            }
        }
        Ok(())
    }

    // ---- phase 6: dead stripping ----

    fn dead_strip_optimize(&mut self) {
        let preserve_coalescables = self.have_llvm_objs && !self.lto_finished;

        for id in &self.atoms {
            self.state.atom_mut(*id).live = false;
        }

        // collect roots, and the live-support atoms for the second pass
        let mut roots: Vec<AtomId> = Vec::new();
        let mut if_references_live: Vec<AtomId> = Vec::new();
        if let Some(entry) = &self.opts.entry_name {
            if let Some(name) = self.state.pool.get(entry) {
                if let Some(id) = self.symbol_table.atom_for_name(name) {
                    roots.push(id);
                }
            }
        }
        for name in &self.initial_undefine_names {
            if let Some(id) = self.symbol_table.atom_for_name(*name) {
                roots.push(id);
            }
        }
        for binder in [
            self.state.stub_binder,
            self.state.lazy_binder,
            self.state.classic_binder,
            self.state.compressed_fast_binder,
        ]
        .into_iter()
        .flatten()
        {
            roots.push(binder);
        }
        let globals_are_roots = self.opts.all_globals_are_dead_strip_roots();
        for &id in &self.atoms {
            let atom = self.state.atom(id);
            match atom.dead_strip {
                DeadStrip::Never => roots.push(id),
                DeadStrip::IfReferencesLive => if_references_live.push(id),
                DeadStrip::Normal => {}
            }
            if globals_are_roots && atom.scope == Scope::Global {
                if let Some(name) = atom.name {
                    let name_str = self.state.pool.resolve(name).to_string();
                    if self.opts.should_export(&name_str) {
                        roots.push(id);
                    }
                }
            }
            // before LTO codegen, coalescable and provisional atoms survive
            if preserve_coalescables
                && (atom.combine != Combine::Never || atom.content_type == ContentType::LTOtemporary)
            {
                roots.push(id);
            }
        }

        for root in roots {
            self.mark_live(root);
        }

        // second pass: live-support atoms become live iff a target is live
        let mut changed = true;
        while changed {
            changed = false;
            for &id in &if_references_live {
                if self.state.atom(id).live {
                    continue;
                }
                let targets = self.fixup_targets(id);
                if targets.iter().any(|&t| self.state.atom(t).live) {
                    self.mark_live(id);
                    changed = true;
                }
            }
        }

        // sweep
        let before = self.atoms.len();
        let state = &self.state;
        self.atoms.retain(|&id| state.atom(id).live);
        log::debug!("dead-strip removed {} of {} atoms", before - self.atoms.len(), before);
        self.symbol_table.remove_dead_atoms(&self.state.atoms);
        let keep: HashSet<Name> = self.initial_undefine_names.iter().copied().collect();
        self.symbol_table.remove_dead_undefs(&|name| keep.contains(&name));
    }

    /// BFS from `root` through fixup targets
    fn mark_live(&mut self, root: AtomId) {
        let mut worklist = vec![root];
        while let Some(id) = worklist.pop() {
            if self.state.atom(id).live {
                continue;
            }
            self.state.atom_mut(id).live = true;
            for target in self.fixup_targets(id) {
                if !self.state.atom(target).live {
                    worklist.push(target);
                }
            }
        }
    }

    /// Targets an atom's fixups keep alive
    fn fixup_targets(&self, id: AtomId) -> Vec<AtomId> {
        let mut targets = Vec::new();
        for fixup in &self.state.atom(id).fixups {
            let propagates = fixup.kind.sets_target()
                || matches!(
                    fixup.kind,
                    FixupKind::None
                        | FixupKind::NoneFollowOn
                        | FixupKind::NoneGroupSubordinate
                        | FixupKind::NoneGroupSubordinateFDE
                        | FixupKind::NoneGroupSubordinateLSDA
                        | FixupKind::NoneGroupSubordinatePersonality
                        | FixupKind::SubtractTargetAddress
                );
            if !propagates {
                continue;
            }
            match fixup.binding {
                FixupBinding::DirectlyBound(t) | FixupBinding::ByContentBound(t) => targets.push(t),
                FixupBinding::IndirectlyBound(slot) => {
                    if let Some(t) = self.symbol_table.atom_for_slot(slot) {
                        targets.push(t);
                    }
                }
                FixupBinding::ByNameUnbound(name) => {
                    if let Some(t) = self.symbol_table.atom_for_name(name) {
                        targets.push(t);
                    }
                }
                FixupBinding::None => {}
            }
        }
        targets
    }

    // ---- phase 7 ----

    fn check_undefines(&mut self, force_error: bool) -> Result<()> {
        let mut unresolved: Vec<Name> = self.symbol_table.undefines();
        if self.opts.dead_code_strip {
            // only undefines referenced from live atoms (or forced) count
            let mut live_refs: HashSet<u32> = HashSet::new();
            for &id in &self.atoms {
                for fixup in &self.state.atom(id).fixups {
                    if let FixupBinding::IndirectlyBound(slot) = fixup.binding {
                        live_refs.insert(slot);
                    }
                }
            }
            let keep: HashSet<Name> = self.initial_undefine_names.iter().copied().collect();
            unresolved.retain(|&name| {
                keep.contains(&name)
                    || self
                        .symbol_table
                        .slot_for_name(name)
                        .is_some_and(|slot| live_refs.contains(&slot))
            });
        }
        if unresolved.is_empty() {
            return Ok(());
        }
        let treatment = if force_error {
            UndefinedTreatment::Error
        } else {
            self.opts.undefined_treatment
        };
        match treatment {
            UndefinedTreatment::Suppress | UndefinedTreatment::DynamicLookup => Ok(()),
            UndefinedTreatment::Warning => {
                for name in unresolved {
                    let msg = self.undefined_diagnostic(name);
                    self.diag.warning(msg);
                }
                Ok(())
            }
            UndefinedTreatment::Error => {
                let mut lines = vec![format!(
                    "Undefined symbols for architecture {}:",
                    crate::constants::cputype::cpu_type_to_str(self.opts.architecture)
                )];
                for name in unresolved {
                    lines.push(self.undefined_diagnostic(name));
                }
                Err(Error::Resolve(lines.join("\n")))
            }
        }
    }

    /// Formats one undefined-symbol diagnostic: up to six referrers, a
    /// "maybe you meant" substring hint, and a mangling hint
    fn undefined_diagnostic(&self, name: Name) -> String {
        let name_str = self.state.pool.resolve(name);
        let mut out = format!("  \"{}\", referenced from:", demangle(name_str));
        let slot = self.symbol_table.slot_for_name(name);
        let mut referrers = 0usize;
        for &id in &self.atoms {
            if referrers >= 6 {
                out.push_str("\n      ...");
                break;
            }
            let atom = self.state.atom(id);
            let refers = atom.fixups.iter().any(|f| match f.binding {
                FixupBinding::IndirectlyBound(s) => Some(s) == slot,
                FixupBinding::ByNameUnbound(n) => n == name,
                _ => false,
            });
            if refers {
                let referrer = atom
                    .name
                    .map(|n| demangle(self.state.pool.resolve(n)))
                    .unwrap_or_else(|| "anonymous atom".to_string());
                out.push_str(&format!("\n      {referrer}"));
                referrers += 1;
            }
        }
        if referrers == 0 {
            out.push_str("\n      -u command line option");
        }
        // fuzzy hint: a known symbol containing (or contained in) the name
        let needle = name_str.trim_start_matches('_');
        if needle.len() > 2 {
            for &id in &self.atoms {
                if let Some(other) = self.state.atom(id).name {
                    if other == name {
                        continue;
                    }
                    let other_str = self.state.pool.resolve(other);
                    if other_str.contains(needle) || needle.contains(other_str.trim_start_matches('_'))
                    {
                        out.push_str(&format!("\n     (maybe you meant: {})", demangle(other_str)));
                        break;
                    }
                }
            }
        }
        if name_str.starts_with("__Z") || name_str.starts_with("_Z") {
            out.push_str(
                "\n     (symbol appears to be a C++ mangled name; \
                 was the reference compiled as C?)",
            );
        }
        out
    }

    // ---- phase 8 ----

    /// Marks regular globals that override a weak external in a loaded dylib,
    /// and warns about tentative definitions shadowed by dylib exports
    fn check_dylib_symbol_collisions(&mut self) {
        let dylibs = self.inputs.dylibs();
        let mut overrides: Vec<AtomId> = Vec::new();
        let mut tentative_warnings: Vec<String> = Vec::new();
        for &id in &self.atoms {
            let atom = self.state.atom(id);
            let Some(name) = atom.name else { continue };
            if atom.scope != Scope::Global {
                continue;
            }
            let name_str = self.state.pool.resolve(name);
            match atom.definition {
                Definition::Regular if atom.combine == Combine::Never => {
                    // each dylib scan reads the table and writes one bit;
                    // scans are independent per dylib
                    if dylibs
                        .iter()
                        .filter(|(_, d)| d.has_weak_externals())
                        .any(|(_, d)| d.has_weak_definition(name_str))
                    {
                        overrides.push(id);
                    }
                }
                Definition::Tentative => {
                    if dylibs.iter().any(|(_, d)| d.has_definition(name_str)) {
                        tentative_warnings.push(format!(
                            "tentative definition of '{name_str}' conflicts with a definition in a linked dylib"
                        ));
                    }
                }
                _ => {}
            }
        }
        for id in overrides {
            self.state.atom_mut(id).overrides_dylib_weak_def = true;
            self.state.overrides_weak_external_symbols = true;
        }
        if self.opts.warn_commons {
            for msg in tentative_warnings {
                self.diag.warning(msg);
            }
        }
    }

    // ---- phase 9 ----

    /// Copies attributes from each alias target into the alias atom,
    /// preserving the alias's global scope
    fn sync_aliases(&mut self) {
        let alias_ids: Vec<AtomId> = self
            .atoms
            .iter()
            .copied()
            .filter(|&id| self.state.atom(id).alias)
            .collect();
        for id in alias_ids {
            let target = self.state.atom(id).fixups.iter().find_map(|f| {
                if f.kind != FixupKind::NoneFollowOn {
                    return None;
                }
                match f.binding {
                    FixupBinding::DirectlyBound(t) => Some(t),
                    FixupBinding::IndirectlyBound(slot) => self.symbol_table.atom_for_slot(slot),
                    FixupBinding::ByNameUnbound(n) => self.symbol_table.atom_for_name(n),
                    _ => None,
                }
            });
            let Some(target) = target else { continue };
            let (section, combine, content_type, alignment, thumb, definition) = {
                let t = self.state.atom(target);
                (t.section.clone(), t.combine, t.content_type, t.alignment, t.thumb, t.definition)
            };
            let alias = self.state.atom_mut(id);
            alias.section = section;
            alias.combine = combine;
            alias.content_type = content_type;
            alias.alignment = alignment;
            alias.thumb = thumb;
            alias.definition = definition;
            alias.scope = Scope::Global;
        }
    }

    // ---- phase 10 ----

    fn remove_coalesced_away_atoms(&mut self) {
        let state = &self.state;
        self.atoms.retain(|&id| !state.atom(id).coalesced_away);
    }

    // ---- phase 11 ----

    fn fill_in_entry_point(&mut self) -> Result<()> {
        if !self.opts.needs_entry_point() {
            return Ok(());
        }
        let Some(entry) = &self.opts.entry_name else { return Ok(()) };
        let name = self.state.pool.intern(entry);
        match self.symbol_table.atom_for_name(name) {
            Some(id) => {
                self.state.entry_point = Some(id);
                Ok(())
            }
            None => Err(Error::Resolve(format!("entry point ({entry}) undefined"))),
        }
    }

    // ---- phase 12 ----

    /// Re-enters the resolver with atoms produced by LTO codegen
    fn link_time_optimize(&mut self, lto: Option<&mut dyn LtoBackend>) -> Result<()> {
        if !self.have_llvm_objs || self.lto_finished {
            return Ok(());
        }
        let Some(backend) = lto else {
            return Err(Error::Resolve(
                "bitcode atoms present but no LTO backend was supplied".into(),
            ));
        };
        let live: Vec<String> = self
            .atoms
            .iter()
            .filter(|&&id| self.state.atom(id).content_type == ContentType::LTOtemporary)
            .filter_map(|&id| self.state.atom(id).name)
            .map(|n| self.state.pool.resolve(n).to_string())
            .collect();
        let produced = backend.compile(&live, &mut self.state.pool)?;
        self.lto_finished = true;

        // provisional atoms lose to the machine code that replaced them
        for &id in &self.atoms.clone() {
            if self.state.atom(id).content_type == ContentType::LTOtemporary {
                self.state.atom_mut(id).coalesced_away = true;
            }
        }
        let lto_index = u32::MAX;
        self.file_ordinals.insert(lto_index, Ordinal::lto(0));
        self.ingest_atoms(produced, Some(lto_index))?;
        self.remove_coalesced_away_atoms();
        self.resolve_all_undefines()?;
        if self.opts.dead_code_strip {
            self.dead_strip_optimize();
        }
        self.check_undefines(true)?;
        Ok(())
    }

    // ---- phase 13 ----

    fn fill_in_internal_state(&mut self) {
        let ids: Vec<AtomId> = self.atoms.clone();
        for id in ids {
            self.state.add_atom_to_section(id, self.opts);
        }
    }

    // ---- phase 14 ----

    /// Applies -force_symbol_weak / -force_symbol_not_weak overrides
    fn tweak_weakness(&mut self) {
        if self.opts.force_weak_list.is_empty() && self.opts.force_not_weak_list.is_empty() {
            return;
        }
        for &id in &self.atoms {
            let (name, definition, combine) = {
                let atom = self.state.atom(id);
                (atom.name, atom.definition, atom.combine)
            };
            let Some(name) = name else { continue };
            if definition != Definition::Regular {
                continue;
            }
            let name_str = self.state.pool.resolve(name).to_string();
            if combine == Combine::Never && self.opts.force_weak_list.contains(&name_str) {
                self.state.atom_mut(id).combine = Combine::ByName;
            } else if combine == Combine::ByName && self.opts.force_not_weak_list.contains(&name_str) {
                self.state.atom_mut(id).combine = Combine::Never;
            }
        }
    }

    // ---- phase 15 ----

    fn build_archives_list(&mut self) {
        if self.opts.trace_archives {
            for path in &self.loaded_archive_paths {
                log::debug!("loaded archive member: {path}");
            }
        }
    }

    /// Graphviz dump of the live atom graph, for -dot_output
    pub fn write_dot_output(&self) -> String {
        let mut out = String::from("digraph dg\n{\n");
        for &id in &self.atoms {
            let atom = self.state.atom(id);
            let label = atom
                .name
                .map(|n| self.state.pool.resolve(n).to_string())
                .unwrap_or_else(|| format!("atom{}", id.0));
            out.push_str(&format!("\tn{} [label=\"{label}\"];\n", id.0));
        }
        out.push('\n');
        for &id in &self.atoms {
            for target in self.fixup_targets(id) {
                out.push_str(&format!("\tn{} -> n{};\n", id.0, target.0));
            }
        }
        out.push_str("}\n");
        out
    }

    // ---- synthesized atoms ----

    fn make_undefined_proxy(&mut self, name: Name) -> Result<AtomId> {
        let mut atom = Atom::new(
            Section::hidden("__TEXT", "__import", SectionType::ImportProxies),
            Definition::Proxy,
            AtomContent::Zeroes(0),
        );
        atom.name = Some(name);
        atom.scope = Scope::Global;
        atom.combine = Combine::Never;
        atom.inclusion = SymbolTableInclusion::In;
        let id = self.state.push_atom(atom)?;
        self.do_atom(id)?;
        Ok(id)
    }

    fn make_alias_atom(&mut self, real: AtomId, alias_name: &str) -> Result<AtomId> {
        let name = self.state.pool.intern(alias_name);
        let mut atom = Atom::new(
            Section::hidden("__LD", "__aliases", SectionType::TempAlias),
            Definition::Regular,
            AtomContent::Zeroes(0),
        );
        atom.name = Some(name);
        atom.alias = true;
        atom.scope = Scope::Global;
        atom.combine = Combine::Never;
        atom.inclusion = SymbolTableInclusion::In;
        atom.fixups.push(Fixup::new(
            0,
            crate::atom::Cluster::K1of1,
            FixupKind::NoneFollowOn,
            FixupBinding::DirectlyBound(real),
        ));
        let id = self.state.push_atom(atom)?;
        self.do_atom(id)?;
        Ok(id)
    }

    /// Synthesizes `section$start$SEG$SECT` / `section$end$...` /
    /// `segment$start$SEG` / `segment$end$SEG` boundary atoms
    fn make_boundary_atom(&mut self, undef: &str) -> Result<Option<AtomId>> {
        let (start, rest) = if let Some(rest) = undef.strip_prefix("section$start$") {
            (true, rest)
        } else if let Some(rest) = undef.strip_prefix("section$end$") {
            (false, rest)
        } else if let Some(rest) = undef.strip_prefix("segment$start$") {
            let id = self.make_segment_boundary(undef, rest, true)?;
            return Ok(Some(id));
        } else if let Some(rest) = undef.strip_prefix("segment$end$") {
            let id = self.make_segment_boundary(undef, rest, false)?;
            return Ok(Some(id));
        } else {
            return Ok(None);
        };
        let Some((seg, sect)) = rest.split_once('$') else {
            return Err(Error::Resolve(format!(
                "invalid section boundary symbol '{undef}'"
            )));
        };
        let name = self.state.pool.intern(undef);
        let mut atom = Atom::new(
            Section::new(seg, sect, SectionType::Unclassified),
            Definition::Regular,
            AtomContent::Zeroes(0),
        );
        atom.name = Some(name);
        atom.scope = Scope::LinkageUnit;
        atom.content_type = if start {
            ContentType::SectionStart
        } else {
            ContentType::SectionEnd
        };
        atom.dead_strip = DeadStrip::Never;
        let id = self.state.push_atom(atom)?;
        self.do_atom(id)?;
        Ok(Some(id))
    }

    fn make_segment_boundary(&mut self, undef: &str, seg: &str, start: bool) -> Result<AtomId> {
        if seg.is_empty() {
            return Err(Error::Resolve(format!(
                "invalid segment boundary symbol '{undef}'"
            )));
        }
        let name = self.state.pool.intern(undef);
        let section = if start {
            Section::hidden(seg, "__start", SectionType::FirstSection)
        } else {
            Section::hidden(seg, "__end", SectionType::LastSection)
        };
        let mut atom = Atom::new(section, Definition::Regular, AtomContent::Zeroes(0));
        atom.name = Some(name);
        atom.scope = Scope::LinkageUnit;
        atom.content_type = if start {
            ContentType::SectionStart
        } else {
            ContentType::SectionEnd
        };
        atom.dead_strip = DeadStrip::Never;
        let id = self.state.push_atom(atom)?;
        self.do_atom(id)?;
        Ok(id)
    }
}

/// Best-effort Itanium-ABI demangling for diagnostics: nested names are
/// rendered as `a::b::c()`; anything unrecognized is returned untouched.
pub fn demangle(symbol: &str) -> String {
    let mangled = symbol.strip_prefix('_').unwrap_or(symbol);
    let Some(rest) = mangled.strip_prefix("_Z") else {
        return symbol.to_string();
    };
    let mut parts: Vec<String> = Vec::new();
    let mut chars = rest.char_indices().peekable();
    let bytes = rest.as_bytes();
    let mut i = match chars.peek() {
        Some((_, 'N')) => 1,
        _ => 0,
    };
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        let mut len = 0usize;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            len = len * 10 + (bytes[i] - b'0') as usize;
            i += 1;
        }
        if i + len > bytes.len() || len == 0 {
            return symbol.to_string();
        }
        parts.push(rest[i..i + len].to_string());
        i += len;
    }
    if parts.is_empty() {
        return symbol.to_string();
    }
    format!("{}()", parts.join("::"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demangle_simple_names() {
        assert_eq!(demangle("__Z3foov"), "foo()");
        assert_eq!(demangle("__ZN3bar3bazEv"), "bar::baz()");
        assert_eq!(demangle("_plain_c"), "_plain_c");
        assert_eq!(demangle("_main"), "_main");
    }
}

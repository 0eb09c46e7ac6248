//! The internal state of a link in progress: the atom arena, the final
//! sections with their classification and ordering rules, resolved dylibs,
//! the indirect binding table, and the entry point.

use std::collections::HashMap;

use crate::atom::{Atom, AtomId, ContentType, Section, SectionType, validate_fixups};
use crate::error::Result;
use crate::input::DylibLinkage;
use crate::linkedit::Stab;
use crate::options::{Options, OutputKind};
use crate::strpool::StringPool;

/// Index of a final section in [`LinkState::sections`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectIx(pub u32);

/// An output section: a bucket of atoms with computed layout
#[derive(Debug)]
pub struct FinalSection {
    pub section: Section,
    pub atoms: Vec<AtomId>,
    pub address: u64,
    pub file_offset: u64,
    pub size: u64,
    /// log2 of the section alignment
    pub alignment: u8,
    /// pad bytes inserted before this section so file offsets mirror addresses
    pub alignment_padding_bytes: u64,
    pub has_local_relocs: bool,
    pub has_external_relocs: bool,
    /// first entry in the indirect symbol table, for stub/pointer sections
    pub indirect_sym_index: Option<u32>,
    segment_order: u32,
    section_order: u32,
}

impl FinalSection {
    fn new(section: Section, segment_order: u32, section_order: u32) -> Self {
        FinalSection {
            section,
            atoms: Vec::new(),
            address: 0,
            file_offset: 0,
            size: 0,
            alignment: 0,
            alignment_padding_bytes: 0,
            has_local_relocs: false,
            has_external_relocs: false,
            indirect_sym_index: None,
            segment_order,
            section_order,
        }
    }

    pub fn segment_name(&self) -> &str {
        &self.section.segment_name
    }
    pub fn section_name(&self) -> &str {
        &self.section.section_name
    }
    pub fn typ(&self) -> SectionType {
        self.section.typ
    }
    pub fn is_hidden(&self) -> bool {
        self.section.hidden
    }
}

/// A dylib that made it into the link, in command-line order
#[derive(Debug, Clone)]
pub struct DylibRecord {
    pub install_path: String,
    pub current_version: u32,
    pub compatibility_version: u32,
    pub timestamp: u32,
    pub linkage: DylibLinkage,
    pub has_weak_externals: bool,
    /// unused and eligible for dead-dylib elimination
    pub is_dead: bool,
    /// index into the input set's file table
    pub file_index: u32,
}

/// Everything the writer needs once the core is done
#[derive(Debug, Default)]
pub struct LinkState {
    pub pool: StringPool,
    pub atoms: Vec<Atom>,
    pub sections: Vec<FinalSection>,
    section_map: HashMap<(String, String), usize>,
    segments_seen: Vec<String>,
    atoms_ordered: bool,

    pub dylibs: Vec<DylibRecord>,
    pub indirect_binding_table: Vec<Option<AtomId>>,
    pub entry_point: Option<AtomId>,

    // synthesized binding helpers, resolved by fill_in_helpers
    pub stub_binder: Option<AtomId>,
    pub lazy_binder: Option<AtomId>,
    pub classic_binder: Option<AtomId>,
    pub compressed_fast_binder: Option<AtomId>,

    pub stabs: Vec<Stab>,

    pub cpu_subtype: u32,
    pub swift_version: u32,
    pub objc_constraint: u32,
    pub has_objc: bool,
    pub has_weak_external_symbols: bool,
    pub has_thread_local_variable_definitions: bool,
    pub overrides_weak_external_symbols: bool,
    pub has_data_in_code: bool,

    /// libraries named by LC_LINKER_OPTION in object files (-lFoo)
    pub linker_option_libraries: Vec<String>,
    /// frameworks named by LC_LINKER_OPTION in object files
    pub linker_option_frameworks: Vec<String>,
}

impl LinkState {
    pub fn new() -> Self {
        LinkState::default()
    }

    /// Moves an atom into the arena, returning its id. Fixup clusters are
    /// validated here; atoms never enter the link malformed.
    pub fn push_atom(&mut self, atom: Atom) -> Result<AtomId> {
        validate_fixups(&atom)?;
        let id = AtomId(self.atoms.len() as u32);
        self.atoms.push(atom);
        Ok(id)
    }

    pub fn atom(&self, id: AtomId) -> &Atom {
        &self.atoms[id.0 as usize]
    }

    pub fn atom_mut(&mut self, id: AtomId) -> &mut Atom {
        &mut self.atoms[id.0 as usize]
    }

    /// After the ordering pass has run, new atoms must respect trailing
    /// section$end$ markers
    pub fn mark_atoms_ordered(&mut self) {
        self.atoms_ordered = true;
    }

    /// Buckets an atom into its final section, creating the section on first
    /// use. In final-image mode some input sections coalesce; in -r mode
    /// sections pass through (after -rename_section rules).
    pub fn add_atom_to_section(&mut self, id: AtomId, opts: &Options) -> SectIx {
        let input_section = self.atoms[id.0 as usize].section.clone();
        let content_type = self.atoms[id.0 as usize].content_type;
        let ix = self.final_section_for(&input_section, opts);
        let sect = &mut self.sections[ix.0 as usize];
        if content_type == ContentType::SectionStart {
            // section$start$ markers anchor the front of the section
            sect.atoms.insert(0, id);
            return ix;
        }
        if self.atoms_ordered
            && sect.atoms.len() > 1
            && self
                .atoms
                .get(sect.atoms.last().unwrap().0 as usize)
                .map(|a| a.content_type == ContentType::SectionEnd)
                .unwrap_or(false)
        {
            // insert before the trailing section$end$ atom, never after it
            let end_atom = sect.atoms.pop().unwrap();
            sect.atoms.push(id);
            sect.atoms.push(end_atom);
        } else {
            sect.atoms.push(id);
        }
        ix
    }

    /// The final section an input section maps to, creating it if needed
    pub fn final_section_for(&mut self, input: &Section, opts: &Options) -> SectIx {
        if let Some(&ix) = self.section_map.get(&input.key()) {
            return SectIx(ix as u32);
        }
        let output = if opts.output_kind.is_final_image() {
            output_section(input, opts.merge_zero_fill)
        } else {
            object_output_section(input, opts)
        };
        if output.key() != input.key() {
            // coalesced: alias the input key onto the output's final section
            let ix = self.final_section_for(&output, opts);
            self.section_map.insert(input.key(), ix.0 as usize);
            return ix;
        }
        let obj_file = !opts.output_kind.is_final_image();
        let seg_order = segment_order(&output, obj_file, &mut self.segments_seen);
        let sect_order = section_order(&output, self.section_map.len() as u32);
        let ix = self.sections.len();
        self.sections.push(FinalSection::new(output.clone(), seg_order, sect_order));
        self.section_map.insert(output.key(), ix);
        SectIx(ix as u32)
    }

    pub fn section_index_of(&self, section: &Section) -> Option<SectIx> {
        self.section_map.get(&section.key()).map(|&ix| SectIx(ix as u32))
    }

    /// Stable sort by (segment rank, section rank); input order breaks ties
    pub fn sort_sections(&mut self) {
        // sections were created in first-seen order; the map indexes survive
        // the permutation below because they are re-pointed afterwards
        let mut order: Vec<usize> = (0..self.sections.len()).collect();
        order.sort_by_key(|&i| {
            (self.sections[i].segment_order, self.sections[i].section_order, i)
        });
        let mut remap = vec![0usize; self.sections.len()];
        for (new_ix, &old_ix) in order.iter().enumerate() {
            remap[old_ix] = new_ix;
        }
        let mut sorted = Vec::with_capacity(self.sections.len());
        for &old_ix in &order {
            sorted.push(std::mem::replace(
                &mut self.sections[old_ix],
                FinalSection::new(Section::new("", "", SectionType::Unclassified), 0, 0),
            ));
        }
        self.sections = sorted;
        for ix in self.section_map.values_mut() {
            *ix = remap[*ix];
        }
    }

    /// The address the Mach-O header lands at (start of __TEXT)
    pub fn mach_header_address(&self) -> u64 {
        for sect in &self.sections {
            if sect.typ() == SectionType::MachHeader {
                return sect.address;
            }
        }
        // no explicit header section: first __TEXT section address
        for sect in &self.sections {
            if sect.segment_name() == crate::constants::SEG_TEXT {
                return sect.address;
            }
        }
        0
    }

    /// The final section containing `address`, if any
    pub fn section_containing(&self, address: u64) -> Option<&FinalSection> {
        self.sections
            .iter()
            .find(|s| s.address <= address && address < s.address + s.size)
    }
}

/// Coalescing table for final linked images
fn output_section(sect: &Section, merge_zero_fill: bool) -> Section {
    use crate::constants::{SEG_DATA, SEG_IMPORT, SEG_TEXT};
    match sect.typ {
        SectionType::Literal4 | SectionType::Literal8 | SectionType::Literal16 => {
            Section::new(SEG_TEXT, "__const", SectionType::Unclassified)
        }
        SectionType::Unclassified => {
            if sect.segment_name == SEG_DATA {
                if sect.section_name == "__datacoal_nt" {
                    return Section::new(SEG_DATA, "__data", SectionType::Unclassified);
                }
                if sect.section_name == "__const_coal" {
                    return Section::new(SEG_DATA, "__const", SectionType::Unclassified);
                }
            } else if sect.segment_name == SEG_TEXT && sect.section_name == "__const_coal" {
                return Section::new(SEG_TEXT, "__const", SectionType::Unclassified);
            }
            sect.clone()
        }
        SectionType::ZeroFill if merge_zero_fill => {
            Section::new(SEG_DATA, "__zerofill", SectionType::ZeroFill)
        }
        SectionType::Code => {
            if sect.segment_name == SEG_TEXT
                && (sect.section_name == "__textcoal_nt" || sect.section_name == "__StaticInit")
            {
                return Section::new(SEG_TEXT, "__text", SectionType::Code);
            }
            sect.clone()
        }
        SectionType::NonLazyPointer => {
            if (sect.segment_name == SEG_DATA && sect.section_name == "__nl_symbol_ptr")
                || (sect.segment_name == SEG_IMPORT && sect.section_name == "__pointers")
            {
                return Section::new(SEG_DATA, "__nl_symbol_ptr", SectionType::NonLazyPointer);
            }
            sect.clone()
        }
        SectionType::TentativeDefs => {
            if merge_zero_fill {
                Section::new(SEG_DATA, "__zerofill", SectionType::ZeroFill)
            } else {
                Section::new(SEG_DATA, "__common", SectionType::ZeroFill)
            }
        }
        _ => sect.clone(),
    }
}

/// In -r mode almost everything passes through unchanged
fn object_output_section(sect: &Section, opts: &Options) -> Section {
    for rename in &opts.section_renames {
        if sect.section_name == rename.from_section && sect.segment_name == rename.from_segment {
            return Section::new(&rename.to_segment, &rename.to_section, sect.typ);
        }
    }
    // the only section that ever changes is __tentative -> __common with -d
    if sect.typ == SectionType::TentativeDefs && opts.make_tentative_definitions_real {
        return Section::new(crate::constants::SEG_DATA, "__common", SectionType::ZeroFill);
    }
    sect.clone()
}

fn segment_order(sect: &Section, obj_file: bool, segments_seen: &mut Vec<String>) -> u32 {
    match sect.segment_name.as_str() {
        "__PAGEZERO" => return 0,
        "__HEADER" => return 0, // only used with -preload
        "__TEXT" => return 1,
        // in -r mode, want __DATA last so zerofill sections are at end
        "__DATA" => return if obj_file { 5 } else { 2 },
        "__OBJC" => return 3,
        "__IMPORT" => return 4,
        _ => {}
    }
    // lay out non-standard segments in the order seen, after the standard set
    for (i, seen) in segments_seen.iter().enumerate() {
        if seen == &sect.segment_name {
            return i as u32 + 10;
        }
    }
    segments_seen.push(sect.segment_name.clone());
    segments_seen.len() as u32 - 1 + 10
}

fn section_order(sect: &Section, sections_seen: u32) -> u32 {
    const MAX: u32 = u32::MAX;
    match sect.typ {
        SectionType::FirstSection => return 0,
        SectionType::MachHeader => return 1,
        SectionType::LastSection => return MAX,
        _ => {}
    }
    if sect.segment_name == "__TEXT" {
        return match sect.typ {
            // __text is always the first code section
            SectionType::Code => {
                if sect.section_name == "__text" {
                    10
                } else {
                    11
                }
            }
            SectionType::Stub => 12,
            SectionType::StubHelper => 13,
            SectionType::LSDA => MAX - 3,
            SectionType::UnwindInfo => MAX - 2,
            SectionType::CFI => MAX - 1,
            SectionType::StubClose => MAX,
            _ => sections_seen + 20,
        };
    }
    if sect.segment_name == "__DATA" {
        return match sect.typ {
            SectionType::LazyPointerClose => 8,
            SectionType::DyldInfo => 9,
            SectionType::NonLazyPointer => 10,
            SectionType::LazyPointer => 11,
            SectionType::InitializerPointers => 12,
            SectionType::TerminatorPointers => 13,
            // TLV zero-fill must follow TLV initial values
            SectionType::TLVInitialValues => MAX - 4,
            SectionType::TLVZeroFill => MAX - 3,
            SectionType::ZeroFill => {
                // __huge is always the last zerofill section
                if sect.section_name == "__huge" {
                    MAX - 1
                } else {
                    MAX - 2
                }
            }
            _ => match sect.section_name.as_str() {
                "__const" => 14,
                // keep the objc metadata sections tightly packed
                "__objc_classlist" => 20,
                "__objc_nlclslist" => 21,
                "__objc_catlist" => 22,
                "__objc_protolist" => 23,
                "__objc_imageinfo" => 24,
                "__objc_const" => 25,
                "__objc_selrefs" => 26,
                "__objc_msgrefs" => 27,
                "__objc_protorefs" => 28,
                "__objc_classrefs" => 29,
                "__objc_superrefs" => 30,
                "__objc_data" => 31,
                _ => sections_seen + 40,
            },
        };
    }
    // zerofill in any other segment goes to the end of the segment
    if sect.typ == SectionType::ZeroFill {
        return MAX - 1;
    }
    sections_seen + 20
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomContent;
    use crate::atom::Definition;
    use crate::constants::cputype::CPU_TYPE_X86_64;

    fn opts() -> Options {
        Options::new(OutputKind::DynamicExecutable, CPU_TYPE_X86_64)
    }

    fn atom_in(state: &mut LinkState, seg: &str, sect: &str, typ: SectionType) -> AtomId {
        let atom = Atom::new(
            Section::new(seg, sect, typ),
            Definition::Regular,
            AtomContent::Bytes(vec![0; 4]),
        );
        state.push_atom(atom).unwrap()
    }

    #[test]
    fn coalesces_datacoal_into_data() {
        let mut state = LinkState::new();
        let opts = opts();
        let a = atom_in(&mut state, "__DATA", "__datacoal_nt", SectionType::Unclassified);
        let b = atom_in(&mut state, "__DATA", "__data", SectionType::Unclassified);
        let ix_a = state.add_atom_to_section(a, &opts);
        let ix_b = state.add_atom_to_section(b, &opts);
        assert_eq!(ix_a, ix_b);
        assert_eq!(state.sections[ix_a.0 as usize].section_name(), "__data");
    }

    #[test]
    fn tentative_defs_land_in_common() {
        let mut state = LinkState::new();
        let opts = opts();
        let a = atom_in(&mut state, "__DATA", "__tent", SectionType::TentativeDefs);
        let ix = state.add_atom_to_section(a, &opts);
        assert_eq!(state.sections[ix.0 as usize].section_name(), "__common");
        assert_eq!(state.sections[ix.0 as usize].typ(), SectionType::ZeroFill);

        let mut merged = LinkState::new();
        let mut o2 = opts.clone();
        o2.merge_zero_fill = true;
        let b = atom_in(&mut merged, "__DATA", "__tent", SectionType::TentativeDefs);
        let ix2 = merged.add_atom_to_section(b, &o2);
        assert_eq!(merged.sections[ix2.0 as usize].section_name(), "__zerofill");
    }

    #[test]
    fn object_mode_passes_sections_through() {
        let mut state = LinkState::new();
        let opts = Options::new(OutputKind::ObjectFile, CPU_TYPE_X86_64);
        let a = atom_in(&mut state, "__DATA", "__datacoal_nt", SectionType::Unclassified);
        let ix = state.add_atom_to_section(a, &opts);
        assert_eq!(state.sections[ix.0 as usize].section_name(), "__datacoal_nt");
    }

    #[test]
    fn section_sort_order() {
        let mut state = LinkState::new();
        let opts = opts();
        let data = atom_in(&mut state, "__DATA", "__data", SectionType::Unclassified);
        let zerofill = atom_in(&mut state, "__DATA", "__bss", SectionType::ZeroFill);
        let huge = atom_in(&mut state, "__DATA", "__huge", SectionType::ZeroFill);
        let text = atom_in(&mut state, "__TEXT", "__text", SectionType::Code);
        let stubs = atom_in(&mut state, "__TEXT", "__stubs", SectionType::Stub);
        for id in [data, zerofill, huge, text, stubs] {
            state.add_atom_to_section(id, &opts);
        }
        state.sort_sections();
        let names: Vec<(String, String)> = state
            .sections
            .iter()
            .map(|s| (s.segment_name().to_string(), s.section_name().to_string()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("__TEXT".to_string(), "__text".to_string()),
                ("__TEXT".to_string(), "__stubs".to_string()),
                ("__DATA".to_string(), "__data".to_string()),
                ("__DATA".to_string(), "__bss".to_string()),
                ("__DATA".to_string(), "__huge".to_string()),
            ]
        );
    }

    #[test]
    fn user_segments_order_as_seen() {
        let mut state = LinkState::new();
        let opts = opts();
        let a = atom_in(&mut state, "__MYSEG", "__stuff", SectionType::Unclassified);
        let b = atom_in(&mut state, "__OTHER", "__stuff", SectionType::Unclassified);
        let t = atom_in(&mut state, "__TEXT", "__text", SectionType::Code);
        for id in [a, b, t] {
            state.add_atom_to_section(id, &opts);
        }
        state.sort_sections();
        assert_eq!(state.sections[0].segment_name(), "__TEXT");
        assert_eq!(state.sections[1].segment_name(), "__MYSEG");
        assert_eq!(state.sections[2].segment_name(), "__OTHER");
    }

    #[test]
    fn section_end_insertion_contract() {
        let mut state = LinkState::new();
        let opts = opts();
        let first = atom_in(&mut state, "__TEXT", "__text", SectionType::Code);
        let end = {
            let mut atom = Atom::new(
                Section::new("__TEXT", "__text", SectionType::Code),
                Definition::Regular,
                AtomContent::Bytes(vec![]),
            );
            atom.content_type = ContentType::SectionEnd;
            state.push_atom(atom).unwrap()
        };
        state.add_atom_to_section(first, &opts);
        state.add_atom_to_section(end, &opts);
        state.mark_atoms_ordered();
        let late = atom_in(&mut state, "__TEXT", "__text", SectionType::Code);
        let ix = state.add_atom_to_section(late, &opts);
        let atoms = &state.sections[ix.0 as usize].atoms;
        assert_eq!(atoms.len(), 3);
        assert_eq!(atoms[1], late);
        assert_eq!(atoms[2], end);
    }
}

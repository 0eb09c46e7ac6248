//! The layout engine: section sizes and alignments, address assignment
//! (fixed segments first, then flowing), and file offsets.

use crate::atom::{Alignment, AtomAddress, Combine, Definition, Scope, SectionType, SymbolTableInclusion};
use crate::error::{Diagnostics, Error, Result};
use crate::options::{Options, OutputKind};
use crate::state::LinkState;

/// Runs all three layout passes and stamps atom final addresses.
/// Returns the total file size.
pub fn layout(state: &mut LinkState, opts: &Options, diag: &mut Diagnostics) -> Result<u64> {
    set_section_sizes_and_alignments(state, opts, diag);
    assign_section_addresses(state, opts)?;
    assign_atom_addresses(state);
    assign_file_offsets(state, opts)
}

/// Pass 1: walk each section's atoms computing offsets, sizes, and the
/// section alignment
pub fn set_section_sizes_and_alignments(state: &mut LinkState, opts: &Options, diag: &mut Diagnostics) {
    for sect_ix in 0..state.sections.len() {
        let (typ, seg_name, sect_name) = {
            let s = &state.sections[sect_ix];
            (s.typ(), s.segment_name().to_string(), s.section_name().to_string())
        };
        if typ == SectionType::AbsoluteSymbols {
            // absolute symbols need their final address to be their value
            let atom_ids: Vec<_> = state.sections[sect_ix].atoms.clone();
            for id in atom_ids {
                let value = state.atom(id).object_address;
                state.atom_mut(id).address = AtomAddress::SectionOffset(value);
            }
            continue;
        }
        let mut max_alignment = 0u8;
        let mut offset = 0u64;
        let atom_ids: Vec<_> = state.sections[sect_ix].atoms.clone();
        for id in atom_ids {
            let atom = state.atom(id);
            let mut align = atom.alignment;
            let mut page_per_atom = false;
            if opts.page_align_data_atoms && seg_name == "__DATA" {
                // most objc sections cannot be padded
                let mut contiguous_objc = sect_name.starts_with("__objc_");
                if sect_name == "__objc_const" || sect_name == "__objc_data" {
                    contiguous_objc = false;
                }
                match typ {
                    SectionType::Unclassified | SectionType::TentativeDefs | SectionType::ZeroFill
                        if !contiguous_objc =>
                    {
                        page_per_atom = true;
                        if align.power_of_2 < 12 {
                            align = Alignment::new(12);
                        }
                    }
                    _ => {}
                }
            }
            if align.power_of_2 > max_alignment {
                max_alignment = align.power_of_2;
            }
            offset = align.round_up(offset);
            // LINKEDIT atoms are laid out later
            if typ != SectionType::LinkEdit {
                let size = atom.size();
                state.atom_mut(id).address = AtomAddress::SectionOffset(offset);
                offset += size;
                if page_per_atom {
                    offset = (offset + 4095) & !4095u64;
                }
            }
            let atom = state.atom(id);
            if atom.scope == Scope::Global
                && atom.definition == Definition::Regular
                && atom.combine == Combine::ByName
                && matches!(
                    atom.inclusion,
                    SymbolTableInclusion::In | SymbolTableInclusion::InAndNeverStrip
                )
            {
                let name = atom.name.map(|n| state.pool.resolve(n).to_string()).unwrap_or_default();
                state.has_weak_external_symbols = true;
                if opts.warn_weak_exports {
                    diag.warning(format!("weak external symbol: {name}"));
                }
            }
        }
        let sect = &mut state.sections[sect_ix];
        sect.size = offset;
        // section alignment is that of the contained atom with the greatest
        // alignment, unless -sectalign overrides
        sect.alignment = max_alignment;
        if opts.has_custom_section_alignment(&seg_name, &sect_name) {
            sect.alignment = opts.custom_section_alignment(&seg_name, &sect_name);
        }
        // each atom in __eh_frame has zero alignment so they pack, but the
        // section itself starts on a pointer boundary
        if typ == SectionType::CFI {
            sect.alignment = 3;
        }
        if typ == SectionType::TLVDefs {
            state.has_thread_local_variable_definitions = true;
        }
    }
}

fn page_align(addr: u64, page_size: u64) -> u64 {
    (addr + page_size - 1) & !(page_size - 1)
}

/// Pass 2: addresses. Segments with -segaddr are placed first; the rest flow
/// from the end of __TEXT, page-aligning at each segment transition.
pub fn assign_section_addresses(state: &mut LinkState, opts: &Options) -> Result<()> {
    let hidden_occupy = opts.output_kind != OutputKind::ObjectFile && opts.output_kind != OutputKind::Preload;
    let page_aligned = opts.output_kind != OutputKind::ObjectFile;

    let mut address = 0u64;
    let mut last_seg = String::new();
    let mut floating_start = opts.base_address;

    // first pass: segments with fixed start addresses
    for ix in 0..state.sections.len() {
        let seg_name = state.sections[ix].segment_name().to_string();
        if !opts.has_custom_segment_address(&seg_name) {
            continue;
        }
        if page_aligned && last_seg != seg_name {
            address = opts.custom_segment_address(&seg_name);
            last_seg = seg_name.clone();
        }
        let unaligned = address;
        let alignment = 1u64 << state.sections[ix].alignment;
        address = (unaligned + alignment - 1) & !(alignment - 1);
        {
            let sect = &mut state.sections[ix];
            sect.address = address;
            sect.alignment_padding_bytes = address - unaligned;
        }
        check_max_address(state, ix, opts)?;
        let sect = &state.sections[ix];
        if !sect.is_hidden() || hidden_occupy {
            address += sect.size;
        }
        // if the TEXT segment address is fixed, flow other segments after it
        if seg_name == "__TEXT" {
            floating_start = address;
        }
    }

    // second pass: sections contiguous with the previous segment
    let mut address = floating_start;
    let mut last_seg = String::new();
    let mut overlap: Option<(usize, usize)> = None;
    for ix in 0..state.sections.len() {
        let seg_name = state.sections[ix].segment_name().to_string();
        if opts.has_custom_segment_address(&seg_name) {
            continue;
        }
        if opts.output_kind == OutputKind::Preload && state.sections[ix].typ() == SectionType::MachHeader {
            state.sections[ix].alignment_padding_bytes = 0;
            continue;
        }
        if page_aligned && last_seg != seg_name {
            if !last_seg.is_empty() {
                address = page_align(address, opts.seg_page_size(&last_seg));
            }
            address = page_align(address, opts.segment_alignment);
            last_seg = seg_name.clone();
        }
        let unaligned = address;
        let alignment = 1u64 << state.sections[ix].alignment;
        address = (unaligned + alignment - 1) & !(alignment - 1);
        {
            let sect = &mut state.sections[ix];
            sect.address = address;
            sect.alignment_padding_bytes = address - unaligned;
        }
        check_max_address(state, ix, opts)?;

        // a flowed section must not overlap a fixed-address one
        for other in 0..state.sections.len() {
            if !opts.has_custom_segment_address(state.sections[other].segment_name()) {
                continue;
            }
            let (a, b) = (&state.sections[ix], &state.sections[other]);
            let collides = if a.address > b.address {
                b.address + b.size > a.address
            } else {
                a.address + a.size > b.address
            };
            if collides {
                overlap = Some((ix, other));
            }
        }

        let sect = &state.sections[ix];
        if !sect.is_hidden() || hidden_occupy {
            address += sect.size;
        }
    }

    if let Some((flow, fixed)) = overlap {
        dump_section_layout(state);
        return Err(Error::Layout(format!(
            "Section ({}/{}) overlaps fixed address section ({}/{})",
            state.sections[flow].segment_name(),
            state.sections[flow].section_name(),
            state.sections[fixed].segment_name(),
            state.sections[fixed].section_name()
        )));
    }
    Ok(())
}

fn check_max_address(state: &LinkState, ix: usize, opts: &Options) -> Result<()> {
    let sect = &state.sections[ix];
    if sect.address + sect.size > opts.max_address
        && opts.output_kind != OutputKind::ObjectFile
        && opts.output_kind != OutputKind::StaticExecutable
    {
        return Err(Error::Layout(format!(
            "section {} (address=0x{:08X}, size={}) would make the output executable exceed available address range",
            sect.section_name(),
            sect.address,
            sect.size
        )));
    }
    Ok(())
}

/// Transitions every laid-out atom from section offset to final address
pub fn assign_atom_addresses(state: &mut LinkState) {
    for ix in 0..state.sections.len() {
        let base = state.sections[ix].address;
        let atom_ids: Vec<_> = state.sections[ix].atoms.clone();
        let absolute = state.sections[ix].typ() == SectionType::AbsoluteSymbols;
        for id in atom_ids {
            if let AtomAddress::SectionOffset(off) = state.atom(id).address {
                let addr = if absolute { off } else { base + off };
                state.atom_mut(id).address = AtomAddress::Final(addr);
            }
        }
    }
}

/// Pass 3: file offsets. Zerofill-like sections take no disk space (offset
/// zero) but still absorb alignment padding. Returns the total file size.
pub fn assign_file_offsets(state: &mut LinkState, opts: &Options) -> Result<u64> {
    let page_aligned = opts.output_kind != OutputKind::ObjectFile;
    let mut file_offset = 0u64;
    let mut last_seg = String::new();
    for ix in 0..state.sections.len() {
        let zero = has_zero_for_file_offset(state.sections[ix].typ(), opts);
        if zero {
            // fileoff of zerofill sections is moot, historically zero
            let pad = state.sections[ix].alignment_padding_bytes;
            let sect = &mut state.sections[ix];
            sect.file_offset = 0;
            file_offset += pad;
        } else {
            let seg_name = state.sections[ix].segment_name().to_string();
            if page_aligned && !last_seg.is_empty() && last_seg != seg_name {
                file_offset = page_align(file_offset, opts.seg_page_size(&last_seg));
            }
            last_seg = seg_name;
            file_offset += state.sections[ix].alignment_padding_bytes;
            let sect = &mut state.sections[ix];
            sect.file_offset = file_offset;
            file_offset += sect.size;
        }
        log::debug!(
            "fileoffset=0x{:08X}, address=0x{:08X}, size={}, section={},{}",
            state.sections[ix].file_offset,
            state.sections[ix].address,
            state.sections[ix].size,
            state.sections[ix].segment_name(),
            state.sections[ix].section_name()
        );
    }
    Ok(file_offset)
}

fn has_zero_for_file_offset(typ: SectionType, opts: &Options) -> bool {
    match typ {
        SectionType::ZeroFill | SectionType::TLVZeroFill => opts.optimize_zero_fill,
        SectionType::PageZero | SectionType::Stack | SectionType::TentativeDefs => true,
        _ => false,
    }
}

/// Dumps the full section table to the log; called before layout errors
pub fn dump_section_layout(state: &LinkState) {
    log::error!("final section layout:");
    for sect in &state.sections {
        if sect.is_hidden() {
            continue;
        }
        log::error!(
            "    {}/{} addr=0x{:08X}, size=0x{:08X}, fileOffset=0x{:08X}, align=2^{}",
            sect.segment_name(),
            sect.section_name(),
            sect.address,
            sect.size,
            sect.file_offset,
            sect.alignment
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{Atom, AtomContent, Section};
    use crate::constants::cputype::CPU_TYPE_X86_64;
    use crate::state::LinkState;

    fn opts() -> Options {
        Options::new(OutputKind::DynamicExecutable, CPU_TYPE_X86_64)
    }

    fn push(state: &mut LinkState, o: &Options, seg: &str, sect: &str, typ: SectionType, size: u64, align: u8) {
        let mut atom = Atom::new(Section::new(seg, sect, typ), Definition::Regular, AtomContent::Bytes(vec![0; size as usize]));
        atom.alignment = Alignment::new(align);
        let id = state.push_atom(atom).unwrap();
        state.add_atom_to_section(id, o);
    }

    #[test]
    fn offsets_respect_alignment() {
        let mut state = LinkState::new();
        let o = opts();
        push(&mut state, &o, "__TEXT", "__text", SectionType::Code, 10, 0);
        push(&mut state, &o, "__TEXT", "__text", SectionType::Code, 16, 4);
        let mut diag = Diagnostics::default();
        set_section_sizes_and_alignments(&mut state, &o, &mut diag);
        let sect = &state.sections[0];
        assert_eq!(state.atom(sect.atoms[0]).section_offset(), 0);
        assert_eq!(state.atom(sect.atoms[1]).section_offset(), 16);
        assert_eq!(sect.size, 32);
        assert_eq!(sect.alignment, 4);
    }

    #[test]
    fn segments_page_align_and_mirror_file_offsets() {
        let mut state = LinkState::new();
        let o = opts();
        push(&mut state, &o, "__TEXT", "__text", SectionType::Code, 0x120, 2);
        push(&mut state, &o, "__DATA", "__data", SectionType::Unclassified, 0x40, 3);
        push(&mut state, &o, "__DATA", "__bss", SectionType::ZeroFill, 0x100, 3);
        state.sort_sections();
        let mut diag = Diagnostics::default();
        let total = layout(&mut state, &o, &mut diag).unwrap();
        let text = &state.sections[0];
        let data = &state.sections[1];
        let bss = &state.sections[2];
        assert_eq!(text.address, o.base_address);
        assert_eq!(data.address % o.segment_alignment, 0);
        // P3: fileOffset and address agree modulo the page size
        assert_eq!(data.file_offset % o.segment_alignment, data.address % o.segment_alignment);
        assert_eq!(bss.file_offset, 0);
        assert_eq!(total, data.file_offset + data.size);
    }

    #[test]
    fn layout_is_idempotent() {
        let mut state = LinkState::new();
        let o = opts();
        push(&mut state, &o, "__TEXT", "__text", SectionType::Code, 100, 2);
        push(&mut state, &o, "__DATA", "__data", SectionType::Unclassified, 64, 3);
        state.sort_sections();
        let mut diag = Diagnostics::default();
        let total1 = layout(&mut state, &o, &mut diag).unwrap();
        let addrs1: Vec<u64> = state.sections.iter().map(|s| s.address).collect();
        let offs1: Vec<u64> = state.sections.iter().map(|s| s.file_offset).collect();
        let total2 = layout(&mut state, &o, &mut diag).unwrap();
        let addrs2: Vec<u64> = state.sections.iter().map(|s| s.address).collect();
        let offs2: Vec<u64> = state.sections.iter().map(|s| s.file_offset).collect();
        assert_eq!(total1, total2);
        assert_eq!(addrs1, addrs2);
        assert_eq!(offs1, offs2);
    }

    #[test]
    fn fixed_segment_overlap_is_fatal() {
        let mut state = LinkState::new();
        let mut o = opts();
        o.base_address = 0x1000;
        // pin __DATA right on top of where __TEXT will flow
        o.custom_segment_addresses.insert("__DATA".into(), 0x1000);
        push(&mut state, &o, "__TEXT", "__text", SectionType::Code, 0x2000, 2);
        push(&mut state, &o, "__DATA", "__data", SectionType::Unclassified, 0x100, 3);
        state.sort_sections();
        let mut diag = Diagnostics::default();
        assert!(layout(&mut state, &o, &mut diag).is_err());
    }

    #[test]
    fn custom_segment_address_honored() {
        let mut state = LinkState::new();
        let mut o = opts();
        o.custom_segment_addresses.insert("__DATA".into(), 0x20_0000);
        push(&mut state, &o, "__TEXT", "__text", SectionType::Code, 0x100, 2);
        push(&mut state, &o, "__DATA", "__data", SectionType::Unclassified, 0x40, 3);
        state.sort_sections();
        let mut diag = Diagnostics::default();
        layout(&mut state, &o, &mut diag).unwrap();
        let data = state.sections.iter().find(|s| s.section_name() == "__data").unwrap();
        assert_eq!(data.address, 0x20_0000);
    }

    #[test]
    fn page_align_data_atoms() {
        let mut state = LinkState::new();
        let mut o = opts();
        o.page_align_data_atoms = true;
        push(&mut state, &o, "__DATA", "__data", SectionType::Unclassified, 8, 0);
        push(&mut state, &o, "__DATA", "__data", SectionType::Unclassified, 8, 0);
        let mut diag = Diagnostics::default();
        set_section_sizes_and_alignments(&mut state, &o, &mut diag);
        let sect = &state.sections[0];
        assert_eq!(state.atom(sect.atoms[0]).section_offset(), 0);
        assert_eq!(state.atom(sect.atoms[1]).section_offset(), 4096);
    }

    #[test]
    fn cfi_section_forced_to_pointer_alignment() {
        let mut state = LinkState::new();
        let o = opts();
        push(&mut state, &o, "__TEXT", "__eh_frame", SectionType::CFI, 24, 0);
        let mut diag = Diagnostics::default();
        set_section_sizes_and_alignments(&mut state, &o, &mut diag);
        assert_eq!(state.sections[0].alignment, 3);
    }
}

//! Classic section relocations, emitted when producing an object file (-r).
//!
//! Each fixup cluster that stores a runtime-visible address becomes one (or,
//! for differences and half-word pairs, two) relocation entries, external or
//! local per architecture-specific rules.

use scroll::{IOwrite, Pwrite, SizeWith};

use crate::atom::{AtomId, Definition, FixupKind, Scope};
use crate::constants::cputype::{CPU_TYPE_ARM, CPU_TYPE_I386, CPU_TYPE_X86_64};
use crate::constants::*;
use crate::error::{Error, Result};
use crate::options::Options;
use crate::state::LinkState;

// Format of a relocation entry of a Mach-O file.  Modified from the 4.3BSD
// format.  The r_address is an offset from the start of the section the
// relocation entry is for, not an address.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pwrite, IOwrite, SizeWith)]
pub struct RelocationInfo {
    /// offset in the section to what is being relocated
    pub r_address: i32,
    pub r_info: u32,
}

pub const SIZEOF_RELOCATION_INFO: usize = 8;

impl RelocationInfo {
    pub fn new(address: i32, symbolnum: u32, pcrel: bool, length: u8, external: bool, typ: u8) -> Self {
        let r_info = (symbolnum & 0x00FF_FFFF)
            | (u32::from(pcrel) << 24)
            | (u32::from(length & 0x3) << 25)
            | (u32::from(external) << 27)
            | (u32::from(typ & 0xF) << 28);
        RelocationInfo { r_address: address, r_info }
    }
    /// symbol index if `r_extern` == 1 or section ordinal if `r_extern` == 0
    #[inline]
    pub fn r_symbolnum(&self) -> u32 {
        self.r_info & 0x00FF_FFFF
    }
    /// was relocated pc relative already
    #[inline]
    pub fn r_pcrel(&self) -> bool {
        self.r_info & 0x0100_0000 != 0
    }
    /// 0=byte, 1=word, 2=long, 3=quad
    #[inline]
    pub fn r_length(&self) -> u8 {
        ((self.r_info >> 25) & 0x3) as u8
    }
    /// whether this relocation is for a symbol or a section
    #[inline]
    pub fn is_extern(&self) -> bool {
        self.r_info & 0x0800_0000 != 0
    }
    /// machine specific relocation type
    #[inline]
    pub fn r_type(&self) -> u8 {
        ((self.r_info >> 28) & 0xF) as u8
    }
}

/// Relocations for one final section, in emission order
#[derive(Debug, Default)]
pub struct SectionRelocs {
    pub entries: Vec<RelocationInfo>,
}

/// One decomposed fixup cluster, as the LINKEDIT walk hands it over
pub struct RelocCluster {
    pub atom: AtomId,
    pub offset_in_atom: u32,
    pub store_kind: FixupKind,
    pub target: AtomId,
    pub minus_target: Option<AtomId>,
    pub target_addend: i64,
}

/// Symbol-index lookup the reloc emitter needs from the symbol table writer
pub trait SymbolIndexes {
    fn symbol_index(&self, atom: AtomId) -> Option<u32>;
}

/// Must the reference be emitted as an external relocation?
fn must_be_external(opts: &Options, state: &LinkState, target: AtomId, store_kind: FixupKind) -> bool {
    let atom = state.atom(target);
    if atom.definition == Definition::Proxy || atom.definition == Definition::Tentative {
        return true;
    }
    match opts.architecture {
        // x86_64 relocations are external for every named target
        CPU_TYPE_X86_64 => atom.name.is_some() && atom.scope != Scope::TranslationUnit,
        // arm branches that switch mode must stay external so a later link
        // can re-patch bl/blx
        CPU_TYPE_ARM => match store_kind {
            FixupKind::StoreARMBranch24
            | FixupKind::StoreTargetAddressARMBranch24
            | FixupKind::StoreThumbBranch22
            | FixupKind::StoreTargetAddressThumbBranch22 => {
                atom.scope == Scope::Global || atom.thumb
            }
            _ => atom.scope == Scope::Global && atom.combine != crate::atom::Combine::Never,
        },
        // i386 TLV references are external
        CPU_TYPE_I386 => {
            matches!(
                store_kind,
                FixupKind::StoreX86Abs32TLVLoad | FixupKind::StoreX86Abs32TLVLoadNowLEA
            ) || atom.scope == Scope::Global && atom.definition == Definition::Proxy
        }
        _ => atom.scope == Scope::Global,
    }
}

fn reloc_length(store_kind: FixupKind) -> u8 {
    match store_kind.store_size() {
        Some(1) => RELOC_LENGTH_BYTE,
        Some(2) => RELOC_LENGTH_WORD,
        Some(8) => RELOC_LENGTH_QUAD,
        _ => RELOC_LENGTH_LONG,
    }
}

fn reloc_type(opts: &Options, store_kind: FixupKind, external: bool) -> u8 {
    match opts.architecture {
        CPU_TYPE_X86_64 => match store_kind {
            FixupKind::StoreX86BranchPCRel32 | FixupKind::StoreTargetAddressX86BranchPCRel32 => {
                X86_64_RELOC_BRANCH
            }
            FixupKind::StoreX86PCRel32GOTLoad
            | FixupKind::StoreTargetAddressX86PCRel32GOTLoad
            | FixupKind::StoreX86PCRel32GOTLoadNowLEA
            | FixupKind::StoreTargetAddressX86PCRel32GOTLoadNowLEA => X86_64_RELOC_GOT_LOAD,
            FixupKind::StoreX86PCRel32GOT => X86_64_RELOC_GOT,
            FixupKind::StoreX86PCRel32TLVLoad | FixupKind::StoreX86PCRel32TLVLoadNowLEA => {
                X86_64_RELOC_TLV
            }
            FixupKind::StoreX86PCRel32 | FixupKind::StoreTargetAddressX86PCRel32 => X86_64_RELOC_SIGNED,
            _ => X86_64_RELOC_UNSIGNED,
        },
        CPU_TYPE_ARM => match store_kind {
            FixupKind::StoreARMBranch24 | FixupKind::StoreTargetAddressARMBranch24 => ARM_RELOC_BR24,
            FixupKind::StoreThumbBranch22 | FixupKind::StoreTargetAddressThumbBranch22 => {
                ARM_THUMB_RELOC_BR22
            }
            FixupKind::StoreARMLow16
            | FixupKind::StoreARMHigh16
            | FixupKind::StoreThumbLow16
            | FixupKind::StoreThumbHigh16 => ARM_RELOC_HALF,
            _ => ARM_RELOC_VANILLA,
        },
        _ => {
            if matches!(
                store_kind,
                FixupKind::StoreX86Abs32TLVLoad | FixupKind::StoreX86Abs32TLVLoadNowLEA
            ) && external
            {
                GENERIC_RELOC_TLV
            } else {
                GENERIC_RELOC_VANILLA
            }
        }
    }
}

/// Turns one store cluster into classic relocation entries for its section
pub fn add_section_relocs(
    opts: &Options,
    state: &mut LinkState,
    sect_ix: usize,
    relocs: &mut SectionRelocs,
    cluster: &RelocCluster,
    indexes: &dyn SymbolIndexes,
) -> Result<()> {
    if state.sections[sect_ix].is_hidden() {
        return Ok(());
    }
    // pc-relative stores within the linkage unit need no record
    let target_def = state.atom(cluster.target).definition;
    if cluster.store_kind.is_pc_rel_store()
        && target_def != Definition::Proxy
        && cluster.minus_target.is_none()
        && opts.architecture == CPU_TYPE_X86_64
    {
        // x86_64 -r output still records pc-rel branches so a later link can
        // retarget them; other pcrel stores to local targets are final
        if !matches!(
            cluster.store_kind,
            FixupKind::StoreX86BranchPCRel32
                | FixupKind::StoreTargetAddressX86BranchPCRel32
                | FixupKind::StoreX86PCRel32GOTLoad
                | FixupKind::StoreTargetAddressX86PCRel32GOTLoad
                | FixupKind::StoreX86PCRel32TLVLoad
        ) {
            return Ok(());
        }
    }

    let section_address = state.sections[sect_ix].address;
    let atom_address = state.atom(cluster.atom).final_address();
    let reloc_address = (atom_address + u64::from(cluster.offset_in_atom) - section_address) as i32;
    let pcrel = cluster.store_kind.is_pc_rel_store();
    let length = reloc_length(cluster.store_kind);

    // pointer difference: SECTDIFF-style pair of relocations
    if let Some(minus) = cluster.minus_target {
        if state.atom(minus).definition == Definition::Proxy
            || state.atom(cluster.target).definition == Definition::Proxy
        {
            return Err(Error::Linkedit(
                "pointer difference to a dylib symbol cannot be encoded".into(),
            ));
        }
        let typ = match opts.architecture {
            CPU_TYPE_X86_64 => X86_64_RELOC_SUBTRACTOR,
            CPU_TYPE_ARM => ARM_RELOC_SECTDIFF,
            _ => GENERIC_RELOC_SECTDIFF,
        };
        let minus_index = indexes
            .symbol_index(minus)
            .ok_or_else(|| Error::Linkedit("subtrahend has no symbol table entry".into()))?;
        relocs.entries.push(RelocationInfo::new(reloc_address, minus_index, false, length, true, typ));
        let target_index = indexes
            .symbol_index(cluster.target)
            .ok_or_else(|| Error::Linkedit("difference target has no symbol table entry".into()))?;
        relocs.entries.push(RelocationInfo::new(
            reloc_address,
            target_index,
            false,
            length,
            true,
            if opts.architecture == CPU_TYPE_X86_64 { X86_64_RELOC_UNSIGNED } else { GENERIC_RELOC_PAIR },
        ));
        mark_reloc_bits(state, sect_ix, true);
        return Ok(());
    }

    let external = must_be_external(opts, state, cluster.target, cluster.store_kind);
    let typ = reloc_type(opts, cluster.store_kind, external);
    if external {
        let index = indexes.symbol_index(cluster.target).ok_or_else(|| {
            Error::Linkedit(format!(
                "external relocation target has no symbol table entry (atom {})",
                cluster.target.0
            ))
        })?;
        relocs.entries.push(RelocationInfo::new(reloc_address, index, pcrel, length, true, typ));
    } else {
        // local relocation: r_symbolnum is the target's 1-based section index
        let section_ordinal = u32::from(state.atom(cluster.target).macho_section);
        if section_ordinal == 0 && state.atom(cluster.target).definition != Definition::Absolute {
            return Err(Error::Linkedit(format!(
                "local relocation target not assigned a section ordinal (atom {})",
                cluster.target.0
            )));
        }
        let symbolnum = if state.atom(cluster.target).definition == Definition::Absolute {
            u32::from(R_ABS)
        } else {
            section_ordinal
        };
        relocs.entries.push(RelocationInfo::new(reloc_address, symbolnum, pcrel, length, false, typ));
    }
    mark_reloc_bits(state, sect_ix, external);
    Ok(())
}

fn mark_reloc_bits(state: &mut LinkState, sect_ix: usize, external: bool) {
    if external {
        state.sections[sect_ix].has_external_relocs = true;
    } else {
        state.sections[sect_ix].has_local_relocs = true;
    }
}

/// Absolute relocation type for Mach-O files
pub const R_ABS: u8 = 0;

/// Serializes relocation entries little-endian, as the writer expects
pub fn relocs_to_bytes(relocs: &[RelocationInfo]) -> Result<Vec<u8>> {
    let mut out = vec![0u8; relocs.len() * SIZEOF_RELOCATION_INFO];
    let mut offset = 0;
    for reloc in relocs {
        out.pwrite_with(*reloc, offset, scroll::LE)?;
        offset += SIZEOF_RELOCATION_INFO;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_bit_packing() {
        let reloc = RelocationInfo::new(0x40, 7, true, RELOC_LENGTH_LONG, true, X86_64_RELOC_BRANCH);
        assert_eq!(reloc.r_address, 0x40);
        assert_eq!(reloc.r_symbolnum(), 7);
        assert!(reloc.r_pcrel());
        assert_eq!(reloc.r_length(), RELOC_LENGTH_LONG);
        assert!(reloc.is_extern());
        assert_eq!(reloc.r_type(), X86_64_RELOC_BRANCH);
    }

    #[test]
    fn serialization_is_8_bytes_le() {
        let reloc = RelocationInfo::new(0x10, 1, false, RELOC_LENGTH_QUAD, true, X86_64_RELOC_UNSIGNED);
        let bytes = relocs_to_bytes(&[reloc]).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[0..4], 0x10i32.to_le_bytes().as_slice());
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), reloc.r_info);
    }
}

//! The atom model: the indivisible units the link-editor shuffles around,
//! and the fixups that stitch them together.
//!
//! An atom is one function, one literal, one variable, or one
//! compiler-generated blob. Atoms live in a single arena owned by
//! [`crate::state::LinkState`] and reference each other only through
//! [`AtomId`] indices or indirect-binding slots, never by pointer.

use crate::strpool::Name;

/// Index of an atom in the link-wide arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomId(pub u32);

/// The alignment requirement of an atom: its start address must satisfy
/// `addr mod 2^power_of_2 == modulus`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    pub power_of_2: u8,
    pub modulus: u32,
}

impl Alignment {
    pub fn new(power_of_2: u8) -> Self {
        Alignment { power_of_2, modulus: 0 }
    }
    pub fn with_modulus(power_of_2: u8, modulus: u32) -> Self {
        Alignment { power_of_2, modulus }
    }
    /// Smallest offset >= `offset` satisfying this alignment
    pub fn round_up(self, offset: u64) -> u64 {
        let alignment = 1u64 << self.power_of_2;
        let current = offset % alignment;
        let required = u64::from(self.modulus);
        if current == required {
            offset
        } else if required > current {
            offset + (required - current)
        } else {
            offset + (required + alignment - current)
        }
    }
}

impl Default for Alignment {
    fn default() -> Self {
        Alignment::new(0)
    }
}

/// How a section's atoms are interpreted; drives classification, layout,
/// and LINKEDIT emission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionType {
    Unclassified,
    Code,
    PageZero,
    ImportProxies,
    LinkEdit,
    MachHeader,
    Stack,
    Literal4,
    Literal8,
    Literal16,
    CString,
    CStringPointer,
    ZeroFill,
    TentativeDefs,
    LazyPointer,
    LazyPointerClose,
    AbsoluteSymbols,
    NonLazyPointer,
    DyldInfo,
    LazyDylibPointer,
    StubHelper,
    InitializerPointers,
    TerminatorPointers,
    LSDA,
    UnwindInfo,
    CFI,
    Stub,
    StubClose,
    ObjC1Classes,
    ObjCClassRefs,
    DtraceDOF,
    InterposingTuples,
    TLVDefs,
    TLVInitialValues,
    TLVZeroFill,
    TLVPointers,
    TLVInitializerPointers,
    TempAlias,
    TempLTO,
    FirstSection,
    LastSection,
    SectionStart,
    SectionEnd,
    Debug,
}

impl SectionType {
    /// Sections whose content occupies no bytes in the output file
    pub fn is_zero_fill_like(self) -> bool {
        matches!(
            self,
            SectionType::ZeroFill
                | SectionType::TLVZeroFill
                | SectionType::PageZero
                | SectionType::Stack
                | SectionType::TentativeDefs
        )
    }
}

/// An input section descriptor: equality is by segment and section name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Section {
    pub segment_name: String,
    pub section_name: String,
    pub typ: SectionType,
    pub hidden: bool,
}

impl Section {
    pub fn new(segment: &str, section: &str, typ: SectionType) -> Self {
        Section {
            segment_name: segment.into(),
            section_name: section.into(),
            typ,
            hidden: false,
        }
    }
    pub fn hidden(segment: &str, section: &str, typ: SectionType) -> Self {
        Section {
            segment_name: segment.into(),
            section_name: section.into(),
            typ,
            hidden: true,
        }
    }
    /// Key used by the classifier: sections are the "same" if segment and
    /// section names match
    pub fn key(&self) -> (String, String) {
        (self.segment_name.clone(), self.section_name.clone())
    }
}

/// Where the atom's definition comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Definition {
    /// defined in an object file being linked
    Regular,
    /// a common block whose size/alignment may merge with other declarations
    Tentative,
    /// an absolute address, not part of any section's layout
    Absolute,
    /// defined in a dylib; resolved by dyld at runtime
    Proxy,
}

/// Coalescing discipline for same-named or same-content atoms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combine {
    Never,
    ByName,
    ByNameAndContent,
    ByNameAndReferences,
}

/// Symbol visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum Scope {
    TranslationUnit,
    LinkageUnit,
    Global,
}

/// Classifies specialized atoms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Unclassified,
    Zerofill,
    CString,
    CFI,
    LSDA,
    SectionStart,
    SectionEnd,
    BranchIsland,
    LazyPointer,
    Stub,
    NonLazyPointer,
    StubHelper,
    Resolver,
    StubClose,
    LazyPointerClose,
    UnwindInfo,
    TLV,
    TLVZeroFill,
    TLVInitialValue,
    TLVInitializerPointers,
    TLVPointer,
    LTOtemporary,
}

/// Whether (and how) the atom lands in the output symbol table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolTableInclusion {
    NotIn,
    NotInFinalLinkedImages,
    In,
    InAndNeverStrip,
    InAsAbsolute,
    InWithRandomAutoStripLabel,
}

/// Tri-state weak-import marker, meaningful only on proxies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeakImportState {
    Unset,
    True,
    False,
}

/// Dead-strip behavior of an atom
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadStrip {
    Normal,
    /// never strip (S_ATTR_NO_DEAD_STRIP, -u names, exported roots)
    Never,
    /// live iff any of its targets is live (S_ATTR_LIVE_SUPPORT)
    IfReferencesLive,
}

/// Address state machine: an atom first knows its offset within its output
/// section, then (one-way, per layout pass) its final address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomAddress {
    Unassigned,
    SectionOffset(u64),
    Final(u64),
}

/// Content bytes of an atom
#[derive(Debug, Clone)]
pub enum AtomContent {
    /// bytes carried from the input file
    Bytes(Vec<u8>),
    /// zerofill / tentative content of the given size
    Zeroes(u64),
    /// synthesized by a pass; bytes are produced at fixup-application time
    Synthesized(u64),
}

impl AtomContent {
    pub fn size(&self) -> u64 {
        match self {
            AtomContent::Bytes(b) => b.len() as u64,
            AtomContent::Zeroes(n) | AtomContent::Synthesized(n) => *n,
        }
    }
}

/// The linker's indivisible unit
#[derive(Debug, Clone)]
pub struct Atom {
    pub name: Option<Name>,
    pub section: Section,
    pub definition: Definition,
    pub combine: Combine,
    pub scope: Scope,
    pub content_type: ContentType,
    pub inclusion: SymbolTableInclusion,
    pub alignment: Alignment,
    pub dead_strip: DeadStrip,
    pub thumb: bool,
    pub alias: bool,
    pub auto_hide: bool,
    pub weak_import: WeakImportState,
    /// address of the atom in its source file, for stable ordering
    pub object_address: u64,
    pub content: AtomContent,
    pub fixups: Vec<Fixup>,
    /// index of the file that contributed the atom (into the resolver's
    /// file table); None for synthesized atoms
    pub file: Option<u32>,

    // mutable link state, owned by the arena
    pub address: AtomAddress,
    pub live: bool,
    pub coalesced_away: bool,
    pub overrides_dylib_weak_def: bool,
    /// 1-based index into the final section table, assigned late
    pub macho_section: u8,
}

impl Atom {
    pub fn new(section: Section, definition: Definition, content: AtomContent) -> Self {
        Atom {
            name: None,
            section,
            definition,
            combine: Combine::Never,
            scope: Scope::TranslationUnit,
            content_type: ContentType::Unclassified,
            inclusion: SymbolTableInclusion::NotIn,
            alignment: Alignment::default(),
            dead_strip: DeadStrip::Normal,
            thumb: false,
            alias: false,
            auto_hide: false,
            weak_import: WeakImportState::Unset,
            object_address: 0,
            content,
            fixups: Vec::new(),
            file: None,
            address: AtomAddress::Unassigned,
            live: false,
            coalesced_away: false,
            overrides_dylib_weak_def: false,
            macho_section: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.content.size()
    }

    /// Offset of the atom within its final section; panics before layout
    pub fn section_offset(&self) -> u64 {
        match self.address {
            AtomAddress::SectionOffset(off) => off,
            AtomAddress::Final(_) => panic!("atom already has a final address"),
            AtomAddress::Unassigned => panic!("atom has no section offset yet"),
        }
    }

    pub fn final_address(&self) -> u64 {
        match self.address {
            AtomAddress::Final(addr) => addr,
            _ => panic!("atom has no final address yet"),
        }
    }

    pub fn has_final_address(&self) -> bool {
        matches!(self.address, AtomAddress::Final(_))
    }

    /// Copies the atom's raw content into `buf` (which must be `size()` long)
    pub fn copy_raw_content(&self, buf: &mut [u8]) {
        match &self.content {
            AtomContent::Bytes(b) => buf.copy_from_slice(b),
            AtomContent::Zeroes(_) | AtomContent::Synthesized(_) => buf.fill(0),
        }
    }

    pub fn raw_content(&self) -> Option<&[u8]> {
        match &self.content {
            AtomContent::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Hash of the atom's content plus its references, for by-content
    /// coalescing of literals and CFIs
    pub fn content_hash(&self) -> u64 {
        // FNV-1a over content bytes then fixup kinds/offsets
        let mut h: u64 = 0xcbf29ce484222325;
        let mut eat = |byte: u8| {
            h ^= u64::from(byte);
            h = h.wrapping_mul(0x100000001b3);
        };
        if let AtomContent::Bytes(bytes) = &self.content {
            for &b in bytes {
                eat(b);
            }
        } else {
            for &b in self.size().to_le_bytes().iter() {
                eat(b);
            }
        }
        for fixup in &self.fixups {
            for &b in fixup.offset_in_atom.to_le_bytes().iter() {
                eat(b);
            }
        }
        h
    }
}

/// Position of a fixup within its cluster (1-of-1 through 5-of-5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cluster {
    K1of1,
    K1of2,
    K2of2,
    K1of3,
    K2of3,
    K3of3,
    K1of4,
    K2of4,
    K3of4,
    K4of4,
    K1of5,
    K2of5,
    K3of5,
    K4of5,
    K5of5,
}

impl Cluster {
    pub fn is_first(self) -> bool {
        matches!(
            self,
            Cluster::K1of1 | Cluster::K1of2 | Cluster::K1of3 | Cluster::K1of4 | Cluster::K1of5
        )
    }
    pub fn is_last(self) -> bool {
        matches!(
            self,
            Cluster::K1of1 | Cluster::K2of2 | Cluster::K3of3 | Cluster::K4of4 | Cluster::K5of5
        )
    }
    /// The cluster position that must precede this one
    pub fn predecessor(self) -> Option<Cluster> {
        match self {
            Cluster::K2of2 => Some(Cluster::K1of2),
            Cluster::K2of3 => Some(Cluster::K1of3),
            Cluster::K3of3 => Some(Cluster::K2of3),
            Cluster::K2of4 => Some(Cluster::K1of4),
            Cluster::K3of4 => Some(Cluster::K2of4),
            Cluster::K4of4 => Some(Cluster::K3of4),
            Cluster::K2of5 => Some(Cluster::K1of5),
            Cluster::K3of5 => Some(Cluster::K2of5),
            Cluster::K4of5 => Some(Cluster::K3of5),
            Cluster::K5of5 => Some(Cluster::K4of5),
            _ => None,
        }
    }
}

/// What a fixup's target is bound to, if anything
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupBinding {
    None,
    /// named reference not yet assigned a slot
    ByNameUnbound(Name),
    /// bound to a specific atom in the arena
    DirectlyBound(AtomId),
    /// resolved through the indirect binding table
    IndirectlyBound(u32),
    /// bound to an atom whose content keys the coalescing
    ByContentBound(AtomId),
}

/// One linker operation at a byte offset within an atom. A cluster of these
/// evaluates an arithmetic expression over an accumulator and stores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    None,
    /// no store; keeps the target atom alive and adjacent (aliases, stubs)
    NoneFollowOn,
    /// no store; liveness group membership (CFI/LSDA)
    NoneGroupSubordinate,
    NoneGroupSubordinateFDE,
    NoneGroupSubordinateLSDA,
    NoneGroupSubordinatePersonality,

    // value-forming
    SetTargetAddress,
    SubtractTargetAddress,
    AddAddend(i64),
    SubtractAddend(i64),
    /// target address minus Mach-O header address
    SetTargetImageOffset,
    SetTargetSectionOffset,
    SetTargetTLVTemplateOffset,
    LazyTarget,
    /// accumulator = lazy-binding info offset for the target lazy pointer
    SetLazyOffset,

    // pointer stores
    Store8,
    StoreLittleEndian16,
    StoreLittleEndianLow24of32,
    StoreLittleEndian32,
    StoreLittleEndian64,
    StoreBigEndian16,
    StoreBigEndianLow24of32,
    StoreBigEndian32,
    StoreBigEndian64,

    // x86 branches and pc-relative stores
    StoreX86BranchPCRel8,
    StoreX86BranchPCRel32,
    StoreX86PCRel8,
    StoreX86PCRel16,
    StoreX86PCRel32,
    StoreX86PCRel32GOTLoad,
    StoreX86PCRel32GOTLoadNowLEA,
    StoreX86PCRel32GOT,
    StoreX86PCRel32TLVLoad,
    StoreX86PCRel32TLVLoadNowLEA,
    StoreX86Abs32TLVLoad,
    StoreX86Abs32TLVLoadNowLEA,

    // ARM and thumb
    StoreARMBranch24,
    StoreThumbBranch22,
    StoreARMLoad12,
    StoreARMLow16,
    StoreARMHigh16,
    StoreThumbLow16,
    StoreThumbHigh16,

    // dtrace probe site rewrites
    StoreX86DtraceCallSiteNop,
    StoreX86DtraceIsEnableSiteClear,
    StoreARMDtraceCallSiteNop,
    StoreARMDtraceIsEnableSiteClear,
    StoreThumbDtraceCallSiteNop,
    StoreThumbDtraceIsEnableSiteClear,
    DtraceExtra,

    // combined set-target-address + store forms, as parsers emit them
    StoreTargetAddressLittleEndian32,
    StoreTargetAddressLittleEndian64,
    StoreTargetAddressBigEndian32,
    StoreTargetAddressBigEndian64,
    StoreTargetAddressX86PCRel32,
    StoreTargetAddressX86BranchPCRel32,
    StoreTargetAddressX86PCRel32GOTLoad,
    StoreTargetAddressX86PCRel32GOTLoadNowLEA,
    StoreTargetAddressARMBranch24,
    StoreTargetAddressThumbBranch22,
    StoreTargetAddressARMLoad12,

    // data-in-code markers, consumed by the LINKEDIT emitter only
    DataInCodeStartData,
    DataInCodeStartJT8,
    DataInCodeStartJT16,
    DataInCodeStartJT32,
    DataInCodeStartJTA32,
    DataInCodeEnd,
}

impl FixupKind {
    /// Does this kind assign the cluster's target?
    pub fn sets_target(self) -> bool {
        matches!(
            self,
            FixupKind::SetTargetAddress
                | FixupKind::SetTargetImageOffset
                | FixupKind::SetTargetSectionOffset
                | FixupKind::SetTargetTLVTemplateOffset
                | FixupKind::LazyTarget
                | FixupKind::StoreTargetAddressLittleEndian32
                | FixupKind::StoreTargetAddressLittleEndian64
                | FixupKind::StoreTargetAddressBigEndian32
                | FixupKind::StoreTargetAddressBigEndian64
                | FixupKind::StoreTargetAddressX86PCRel32
                | FixupKind::StoreTargetAddressX86BranchPCRel32
                | FixupKind::StoreTargetAddressX86PCRel32GOTLoad
                | FixupKind::StoreTargetAddressX86PCRel32GOTLoadNowLEA
                | FixupKind::StoreTargetAddressARMBranch24
                | FixupKind::StoreTargetAddressThumbBranch22
                | FixupKind::StoreTargetAddressARMLoad12
        )
    }

    /// Does this kind write bytes into the atom's content?
    pub fn is_store(self) -> bool {
        use FixupKind::*;
        !matches!(
            self,
            None | NoneFollowOn
                | NoneGroupSubordinate
                | NoneGroupSubordinateFDE
                | NoneGroupSubordinateLSDA
                | NoneGroupSubordinatePersonality
                | SetTargetAddress
                | SubtractTargetAddress
                | AddAddend(_)
                | SubtractAddend(_)
                | SetTargetImageOffset
                | SetTargetSectionOffset
                | SetTargetTLVTemplateOffset
                | LazyTarget
                | SetLazyOffset
                | DtraceExtra
                | DataInCodeStartData
                | DataInCodeStartJT8
                | DataInCodeStartJT16
                | DataInCodeStartJT32
                | DataInCodeStartJTA32
                | DataInCodeEnd
        )
    }

    /// Stores that produce a pc-relative value (never need rebase/bind)
    pub fn is_pc_rel_store(self) -> bool {
        use FixupKind::*;
        matches!(
            self,
            StoreX86BranchPCRel8
                | StoreX86BranchPCRel32
                | StoreX86PCRel8
                | StoreX86PCRel16
                | StoreX86PCRel32
                | StoreX86PCRel32GOTLoad
                | StoreX86PCRel32GOTLoadNowLEA
                | StoreX86PCRel32GOT
                | StoreX86PCRel32TLVLoad
                | StoreX86PCRel32TLVLoadNowLEA
                | StoreARMBranch24
                | StoreThumbBranch22
                | StoreARMLoad12
                | StoreTargetAddressX86PCRel32
                | StoreTargetAddressX86BranchPCRel32
                | StoreTargetAddressX86PCRel32GOTLoad
                | StoreTargetAddressX86PCRel32GOTLoadNowLEA
                | StoreTargetAddressARMBranch24
                | StoreTargetAddressThumbBranch22
                | StoreTargetAddressARMLoad12
        )
    }

    pub fn is_dtrace_probe(self) -> bool {
        use FixupKind::*;
        matches!(
            self,
            StoreX86DtraceCallSiteNop
                | StoreX86DtraceIsEnableSiteClear
                | StoreARMDtraceCallSiteNop
                | StoreARMDtraceIsEnableSiteClear
                | StoreThumbDtraceCallSiteNop
                | StoreThumbDtraceIsEnableSiteClear
                | DtraceExtra
        )
    }

    pub fn is_data_in_code(self) -> bool {
        use FixupKind::*;
        matches!(
            self,
            DataInCodeStartData
                | DataInCodeStartJT8
                | DataInCodeStartJT16
                | DataInCodeStartJT32
                | DataInCodeStartJTA32
                | DataInCodeEnd
        )
    }

    /// Size in bytes of the value a pointer store writes, if it is one
    pub fn store_size(self) -> Option<u8> {
        use FixupKind::*;
        match self {
            Store8 => Some(1),
            StoreLittleEndian16 | StoreBigEndian16 => Some(2),
            StoreLittleEndianLow24of32 | StoreBigEndianLow24of32 => Some(3),
            StoreLittleEndian32 | StoreBigEndian32 | StoreTargetAddressLittleEndian32
            | StoreTargetAddressBigEndian32 => Some(4),
            StoreLittleEndian64 | StoreBigEndian64 | StoreTargetAddressLittleEndian64
            | StoreTargetAddressBigEndian64 => Some(8),
            _ => Option::None,
        }
    }
}

/// One linker operation at a byte offset within its containing atom
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    pub offset_in_atom: u32,
    pub cluster: Cluster,
    pub kind: FixupKind,
    pub binding: FixupBinding,
    pub weak_import: bool,
    /// classic-reloc object output: only the addend is stored in content
    pub content_addend_only: bool,
    /// store the delta to the addend, not the full target address
    pub content_delta_to_addend_only: bool,
    pub content_ignores_addend: bool,
}

impl Fixup {
    pub fn new(offset_in_atom: u32, cluster: Cluster, kind: FixupKind, binding: FixupBinding) -> Self {
        Fixup {
            offset_in_atom,
            cluster,
            kind,
            binding,
            weak_import: false,
            content_addend_only: false,
            content_delta_to_addend_only: false,
            content_ignores_addend: false,
        }
    }
}

/// Validates cluster structure of an atom's fixup stream: exactly one first
/// and one last per cluster, monotone continuation, shared cluster offset.
pub fn validate_fixups(atom: &Atom) -> crate::error::Result<()> {
    let mut last_was_cluster_end = true;
    let mut last_cluster = Cluster::K1of1;
    let mut cur_cluster_offset = 0u32;
    for fixup in &atom.fixups {
        if fixup.offset_in_atom != 0 && u64::from(fixup.offset_in_atom) > atom.size() {
            return Err(crate::error::Error::Malformed(format!(
                "fixup offset {} beyond atom size {}",
                fixup.offset_in_atom,
                atom.size()
            )));
        }
        if fixup.cluster.is_first() {
            if !last_was_cluster_end {
                return Err(crate::error::Error::Malformed(
                    "fixup cluster started before previous cluster ended".into(),
                ));
            }
            cur_cluster_offset = fixup.offset_in_atom;
        } else {
            if last_was_cluster_end {
                return Err(crate::error::Error::Malformed(
                    "fixup cluster continuation without a first member".into(),
                ));
            }
            if fixup.offset_in_atom != cur_cluster_offset {
                return Err(crate::error::Error::Malformed(
                    "fixup cluster members disagree on offset".into(),
                ));
            }
            if fixup.cluster.predecessor() != Some(last_cluster) {
                return Err(crate::error::Error::Malformed(
                    "fixup cluster members out of order".into(),
                ));
            }
        }
        last_was_cluster_end = fixup.cluster.is_last();
        last_cluster = fixup.cluster;
    }
    if !last_was_cluster_end {
        return Err(crate::error::Error::Malformed(
            "last fixup was not end of cluster".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{SECT_TEXT, SEG_TEXT};

    fn code_atom(size: u64) -> Atom {
        Atom::new(
            Section::new(SEG_TEXT, SECT_TEXT, SectionType::Code),
            Definition::Regular,
            AtomContent::Bytes(vec![0u8; size as usize]),
        )
    }

    #[test]
    fn alignment_round_up() {
        let a = Alignment::new(4);
        assert_eq!(a.round_up(0), 0);
        assert_eq!(a.round_up(1), 16);
        assert_eq!(a.round_up(16), 16);
        let m = Alignment::with_modulus(3, 2);
        assert_eq!(m.round_up(0), 2);
        assert_eq!(m.round_up(3), 10);
        assert_eq!(m.round_up(10), 10);
    }

    #[test]
    fn cluster_validation_accepts_well_formed() {
        let mut atom = code_atom(16);
        atom.fixups.push(Fixup::new(
            4,
            Cluster::K1of2,
            FixupKind::SetTargetAddress,
            FixupBinding::IndirectlyBound(0),
        ));
        atom.fixups.push(Fixup::new(
            4,
            Cluster::K2of2,
            FixupKind::StoreLittleEndian32,
            FixupBinding::None,
        ));
        assert!(validate_fixups(&atom).is_ok());
    }

    #[test]
    fn cluster_validation_rejects_dangling() {
        let mut atom = code_atom(16);
        atom.fixups.push(Fixup::new(
            4,
            Cluster::K1of2,
            FixupKind::SetTargetAddress,
            FixupBinding::IndirectlyBound(0),
        ));
        assert!(validate_fixups(&atom).is_err());
    }

    #[test]
    fn cluster_validation_rejects_offset_mismatch() {
        let mut atom = code_atom(16);
        atom.fixups.push(Fixup::new(
            4,
            Cluster::K1of2,
            FixupKind::SetTargetAddress,
            FixupBinding::IndirectlyBound(0),
        ));
        atom.fixups.push(Fixup::new(
            8,
            Cluster::K2of2,
            FixupKind::StoreLittleEndian32,
            FixupBinding::None,
        ));
        assert!(validate_fixups(&atom).is_err());
    }

    #[test]
    fn content_hash_distinguishes_bytes() {
        let a = code_atom(8);
        let mut b = code_atom(8);
        if let AtomContent::Bytes(bytes) = &mut b.content {
            bytes[0] = 0xff;
        }
        assert_ne!(a.content_hash(), b.content_hash());
    }
}

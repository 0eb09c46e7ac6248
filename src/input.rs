//! Contracts between the core and the file-format parsers.
//!
//! Parsers (Mach-O objects, archives, dylibs/TBDs, bitcode) live outside the
//! core; they hand over [`crate::atom::Atom`] values whose `DirectlyBound`
//! fixups use *file-local* atom indices. The resolver rebases those indices
//! into the link-wide arena on ingestion.

use crate::atom::Atom;
use crate::error::Result;
use crate::strpool::StringPool;

/// A 64-bit lexicographic key defining symbol precedence between input files:
/// `partition (16) | major (16) | minor (16) | counter (16)`.
///
/// Lower ordinals win ties during symbol resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ordinal(u64);

impl Ordinal {
    const ARG_LIST_PARTITION: u64 = 0;
    const INDIRECT_DYLIB_PARTITION: u64 = 1;
    const LINKER_OPTION_PARTITION: u64 = 2;
    const LTO_PARTITION: u64 = 3;

    fn make(partition: u64, major: u64, minor: u64, counter: u64) -> Self {
        Ordinal(partition << 48 | (major & 0xFFFF) << 32 | (minor & 0xFFFF) << 16 | (counter & 0xFFFF))
    }

    /// File named directly on the command line at argv index `argv_index`
    pub fn from_arg_list(argv_index: u16) -> Self {
        Ordinal::make(Self::ARG_LIST_PARTITION, u64::from(argv_index), 0, 0)
    }

    /// File from a -filelist: orders after direct args at the same position
    pub fn from_file_list(argv_index: u16, filelist_index: u16) -> Self {
        Ordinal::make(
            Self::ARG_LIST_PARTITION,
            u64::from(argv_index),
            u64::from(filelist_index),
            0,
        )
    }

    /// Dylib loaded implicitly through a re-export chain
    pub fn indirect_dylib(counter: u16) -> Self {
        Ordinal::make(Self::INDIRECT_DYLIB_PARTITION, 0, 0, u64::from(counter))
    }

    /// Library named by an LC_LINKER_OPTION in an object file
    pub fn linker_option(counter: u16) -> Self {
        Ordinal::make(Self::LINKER_OPTION_PARTITION, 0, 0, u64::from(counter))
    }

    /// Atoms produced by LTO codegen order after everything else
    pub fn lto(counter: u16) -> Self {
        Ordinal::make(Self::LTO_PARTITION, 0, 0, u64::from(counter))
    }

    /// An archive member keeps its archive's position plus a member index
    pub fn archive_member(self, member_index: u16) -> Self {
        Ordinal(self.0 | u64::from(member_index))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Relocatable,
    Dylib,
    Archive,
    Other,
}

/// How a dylib ended up in the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DylibLinkage {
    Explicit,
    Implicit,
    LazyLoad,
    WeakLink,
    ReExport,
    Upward,
}

/// An input file, already parsed
pub trait File {
    fn path(&self) -> &str;
    fn ordinal(&self) -> Ordinal;
    fn kind(&self) -> FileKind;
    /// The file's initial atom contribution. Atom names are interned into
    /// the link-wide `pool` at handover; `DirectlyBound` fixups use
    /// file-local atom indices.
    fn atoms(&self, pool: &mut StringPool) -> Vec<Atom>;
    fn swift_version(&self) -> u32 {
        0
    }
    fn objc_constraint(&self) -> u32 {
        0
    }
    /// LC_LINKER_OPTION vectors, e.g. `["-framework", "Foundation"]`
    fn linker_options(&self) -> Vec<Vec<String>> {
        Vec::new()
    }
}

/// A .o contribution
pub trait RelocatableFile: File {
    fn has_debug_info(&self) -> bool {
        false
    }
    /// stabs carried through to the output symbol table
    fn stabs(&self) -> &[crate::linkedit::Stab] {
        &[]
    }
    fn can_scatter_atoms(&self) -> bool {
        true
    }
    /// did LTO produce provisional atoms that need codegen?
    fn is_lto(&self) -> bool {
        false
    }
}

/// A dylib (or TBD stub) contribution
pub trait DylibFile: File {
    fn install_path(&self) -> &str;
    fn timestamp(&self) -> u32 {
        0
    }
    fn current_version(&self) -> u32 {
        0x10000
    }
    fn compatibility_version(&self) -> u32 {
        0x10000
    }
    fn linkage(&self) -> DylibLinkage {
        DylibLinkage::Explicit
    }
    /// does the dylib export a weak definition of `name`?
    fn has_weak_definition(&self, name: &str) -> bool;
    /// does the dylib export any weak definitions at all?
    fn has_weak_externals(&self) -> bool;
    /// does the dylib export `name` (weak or not)?
    fn has_definition(&self, name: &str) -> bool;
    /// marked dead by the unused-dylib pass
    fn is_dead(&self) -> bool {
        false
    }
}

/// A static archive: members load just-in-time when a search hits them
pub trait ArchiveFile: File {
    /// Atoms of the member defining `name`, or empty if none does
    fn just_in_time_atoms(&self, name: &str, pool: &mut StringPool) -> Vec<Atom>;
    /// Same, but only members containing nothing but data; used by the
    /// tentative-definition override search
    fn just_in_time_data_only_atoms(&self, name: &str, pool: &mut StringPool) -> Vec<Atom>;
}

/// The outcome of one library-search probe
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// atoms contributed by the archive member or dylib export
    pub atoms: Vec<Atom>,
    pub ordinal: Ordinal,
    /// index of the providing file in the input set's file table
    pub file_index: u32,
    /// display path of the providing file (archive members include the
    /// member name, e.g. `libm.a(sin.o)`)
    pub path: String,
    /// true when the hit loaded an archive member
    pub from_archive: bool,
}

/// The library-search half of the parser collaborator.
///
/// `search_libraries` probes dylibs and/or archives for a definition of
/// `name` in the configured search mode, returning the loaded atoms (an
/// archive member may drag in many) or None.
pub trait InputSet {
    /// Every initially-listed file, in ordinal order
    fn initial_files(&self) -> Vec<&dyn File>;

    /// dylib records for ordinal assignment and weak-def scanning, paired
    /// with their file-table index (the same index space [`SearchHit`] uses)
    fn dylibs(&self) -> Vec<(u32, &dyn DylibFile)>;

    /// Probe libraries for `name`. `data_symbol_only` restricts archive
    /// member loading to data-only members (tentative-override search).
    /// Names in any returned atoms are interned into `pool`.
    fn search_libraries(
        &mut self,
        name: &str,
        pool: &mut StringPool,
        search_dylibs: bool,
        search_archives: bool,
        data_symbol_only: bool,
    ) -> Result<Option<SearchHit>>;
}

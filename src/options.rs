//! The immutable options record the link-editor core consumes.
//!
//! Option parsing itself is an external collaborator; what arrives here is
//! the already-digested configuration. Environment variables that supply
//! defaults when no flag was given are read once in [`Options::from_env`].

use std::collections::HashMap;
use std::env;

use crate::constants::cputype::*;
use crate::constants::PATH_MAX;

/// What kind of Mach-O image is being produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    DynamicExecutable,
    StaticExecutable,
    DynamicLibrary,
    DynamicBundle,
    ObjectFile,
    Dyld,
    Preload,
    KextBundle,
}

impl OutputKind {
    /// Final linked images get section coalescing; -r output does not
    pub fn is_final_image(self) -> bool {
        self != OutputKind::ObjectFile
    }
}

/// Policy for symbols still undefined after resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndefinedTreatment {
    Error,
    Warning,
    Suppress,
    DynamicLookup,
}

/// Policy for mismatched weak references across files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeakReferenceMismatchTreatment {
    Error,
    Weak,
    NonWeak,
}

/// -commons mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommonsMode {
    /// tentative definitions merge with archive members only
    IgnoreDylibs,
    /// a dylib definition may override a tentative definition
    UseDylibs,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterposeMode {
    None,
    AllExternal,
    Some,
}

/// -exported_symbols_list / -unexported_symbols_list configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    Default,
    Some,
    DontExportSome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibrarySearchMode {
    /// classic: in each search dir, prefer the dylib over the archive
    DylibAndArchiveEachDir,
    /// search every dir for dylibs first, then every dir for archives
    AllDirsDylibsThenArchives,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameSpace {
    TwoLevel,
    Flat,
    ForceFlat,
}

/// A -alias real new pair
#[derive(Debug, Clone)]
pub struct AliasPair {
    pub real_name: String,
    pub alias: String,
}

/// A -rename_section mapping applied in -r mode
#[derive(Debug, Clone)]
pub struct SectionRename {
    pub from_segment: String,
    pub from_section: String,
    pub to_segment: String,
    pub to_section: String,
}

/// A list of symbol names, possibly containing shell-glob patterns.
///
/// Literal names hit a hash set; wildcard patterns are scanned linearly
/// after the hash miss, matching ld's behavior.
#[derive(Debug, Clone, Default)]
pub struct SymbolSet {
    literals: std::collections::HashSet<String>,
    patterns: Vec<String>,
}

impl SymbolSet {
    pub fn new() -> Self {
        SymbolSet::default()
    }

    pub fn insert(&mut self, name: &str) {
        if name.contains(['*', '?', '[']) {
            self.patterns.push(name.to_string());
        } else {
            self.literals.insert(name.to_string());
        }
    }

    pub fn contains(&self, symbol: &str) -> bool {
        if self.literals.contains(symbol) {
            return true;
        }
        self.patterns.iter().any(|p| wildcard_match(p, symbol))
    }

    pub fn is_empty(&self) -> bool {
        self.literals.is_empty() && self.patterns.is_empty()
    }

    pub fn iter_literals(&self) -> impl Iterator<Item = &str> {
        self.literals.iter().map(|s| s.as_str())
    }
}

/// Shell-glob matching with `*`, `?`, `[a-z]` character classes, and
/// backslash escapes
pub fn wildcard_match(pattern: &str, symbol: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = symbol.chars().collect();
    match_here(&p, &s)
}

fn match_here(p: &[char], s: &[char]) -> bool {
    match p.first() {
        None => s.is_empty(),
        Some('*') => {
            // greedy star: try every suffix
            for skip in 0..=s.len() {
                if match_here(&p[1..], &s[skip..]) {
                    return true;
                }
            }
            false
        }
        Some('?') => !s.is_empty() && match_here(&p[1..], &s[1..]),
        Some('[') => {
            let Some(&c) = s.first() else { return false };
            let mut i = 1;
            let negate = p.get(i) == Some(&'^');
            if negate {
                i += 1;
            }
            let mut matched = false;
            while i < p.len() && p[i] != ']' {
                if p.get(i + 1) == Some(&'-') && i + 2 < p.len() && p[i + 2] != ']' {
                    if p[i] <= c && c <= p[i + 2] {
                        matched = true;
                    }
                    i += 3;
                } else {
                    if p[i] == c {
                        matched = true;
                    }
                    i += 1;
                }
            }
            if i >= p.len() {
                // unterminated class never matches
                return false;
            }
            if matched != negate {
                match_here(&p[i + 1..], &s[1..])
            } else {
                false
            }
        }
        Some('\\') => match p.get(1) {
            Some(&esc) => s.first() == Some(&esc) && match_here(&p[2..], &s[1..]),
            None => false,
        },
        Some(&lit) => s.first() == Some(&lit) && match_here(&p[1..], &s[1..]),
    }
}

/// The full knob set the core observes. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Options {
    pub output_kind: OutputKind,
    pub architecture: u32,
    pub sub_architecture: u32,
    pub force_subtype_all: bool,
    pub allow_sub_architecture_mismatches: bool,
    /// armv7 and friends can use thumb2 encodings
    pub prefer_sub_architecture: bool,

    pub undefined_treatment: UndefinedTreatment,
    pub weak_reference_mismatch_treatment: WeakReferenceMismatchTreatment,
    pub commons_mode: CommonsMode,
    pub name_space: NameSpace,

    pub dead_code_strip: bool,
    pub allow_dead_duplicates: bool,
    pub interpose_mode: InterposeMode,
    pub allow_text_relocs: bool,
    pub warn_text_relocs: bool,
    pub keep_private_externs: bool,

    pub export_mode: ExportMode,
    pub export_list: SymbolSet,
    pub dont_export_list: SymbolSet,
    pub re_export_list: SymbolSet,
    pub interpose_list: SymbolSet,
    pub force_weak_list: SymbolSet,
    pub force_not_weak_list: SymbolSet,
    pub allowed_undefined_list: SymbolSet,

    pub base_address: u64,
    pub max_address: u64,
    pub segment_alignment: u64,
    pub custom_segment_addresses: HashMap<String, u64>,
    pub custom_segment_page_sizes: HashMap<String, u64>,
    pub custom_section_alignments: HashMap<(String, String), u8>,
    pub section_renames: Vec<SectionRename>,

    pub merge_zero_fill: bool,
    pub page_align_data_atoms: bool,
    pub optimize_zero_fill: bool,
    pub make_tentative_definitions_real: bool,

    pub make_compressed_dyld_info: bool,
    pub shared_region_eligible: bool,
    pub add_compact_unwind_encoding: bool,
    pub position_independent_executable: bool,
    pub bind_at_load: bool,
    /// warn instead of error for 32-bit absolute overflow on i386/arm
    pub allow_32bit_overflow: bool,

    pub library_search_mode: LibrarySearchMode,

    pub aliases: Vec<AliasPair>,
    pub initial_undefines: Vec<String>,
    pub entry_name: Option<String>,
    pub install_path: Option<String>,

    pub headerpad_max_install_names: bool,
    pub warn_weak_exports: bool,
    pub warn_commons: bool,
    pub fatal_warnings: bool,

    pub trace_archives: bool,
    pub trace_dylibs: bool,
    /// override path for the dynamic linker (LD_DYLD_PATH)
    pub dyld_path: Option<String>,
    /// path of a segment-address table file (LD_SEG_ADDR_TABLE)
    pub seg_addr_table_path: Option<String>,
    /// OS deployment target when no -macosx_version_min style flag was given
    pub deployment_target: Option<String>,
}

impl Options {
    /// A plain dynamic-executable configuration for the given architecture
    pub fn new(output_kind: OutputKind, architecture: u32) -> Self {
        let base_address = match (output_kind, architecture) {
            (OutputKind::DynamicExecutable, CPU_TYPE_X86_64) => 0x1_0000_0000,
            (OutputKind::DynamicExecutable, _) => 0x1000,
            _ => 0,
        };
        let max_address = if architecture & CPU_ARCH_ABI64 != 0 {
            u64::MAX
        } else {
            0xFFFF_FFFF
        };
        Options {
            output_kind,
            architecture,
            sub_architecture: 0,
            force_subtype_all: false,
            allow_sub_architecture_mismatches: false,
            prefer_sub_architecture: false,
            undefined_treatment: UndefinedTreatment::Error,
            weak_reference_mismatch_treatment: WeakReferenceMismatchTreatment::NonWeak,
            commons_mode: CommonsMode::IgnoreDylibs,
            name_space: NameSpace::TwoLevel,
            dead_code_strip: false,
            allow_dead_duplicates: false,
            interpose_mode: InterposeMode::None,
            allow_text_relocs: false,
            warn_text_relocs: false,
            keep_private_externs: false,
            export_mode: ExportMode::Default,
            export_list: SymbolSet::new(),
            dont_export_list: SymbolSet::new(),
            re_export_list: SymbolSet::new(),
            interpose_list: SymbolSet::new(),
            force_weak_list: SymbolSet::new(),
            force_not_weak_list: SymbolSet::new(),
            allowed_undefined_list: SymbolSet::new(),
            base_address,
            max_address,
            segment_alignment: 0x1000,
            custom_segment_addresses: HashMap::new(),
            custom_segment_page_sizes: HashMap::new(),
            custom_section_alignments: HashMap::new(),
            section_renames: Vec::new(),
            merge_zero_fill: false,
            page_align_data_atoms: false,
            optimize_zero_fill: true,
            make_tentative_definitions_real: false,
            make_compressed_dyld_info: output_kind != OutputKind::ObjectFile
                && output_kind != OutputKind::StaticExecutable
                && output_kind != OutputKind::Preload,
            shared_region_eligible: false,
            add_compact_unwind_encoding: true,
            position_independent_executable: false,
            bind_at_load: false,
            allow_32bit_overflow: output_kind != OutputKind::StaticExecutable
                && output_kind != OutputKind::Preload,
            library_search_mode: LibrarySearchMode::DylibAndArchiveEachDir,
            aliases: Vec::new(),
            initial_undefines: Vec::new(),
            entry_name: match output_kind {
                OutputKind::DynamicExecutable | OutputKind::StaticExecutable => {
                    Some("_main".to_string())
                }
                _ => None,
            },
            install_path: None,
            headerpad_max_install_names: false,
            warn_weak_exports: false,
            warn_commons: false,
            fatal_warnings: false,
            trace_archives: false,
            trace_dylibs: false,
            dyld_path: None,
            seg_addr_table_path: None,
            deployment_target: None,
        }
    }

    /// Same as [`Options::new`] but with debug knobs and defaults pulled from
    /// the environment, matching classic ld behavior when a flag was absent
    pub fn from_env(output_kind: OutputKind, architecture: u32) -> Self {
        let mut opts = Options::new(output_kind, architecture);
        opts.trace_archives = env::var_os("LD_TRACE_ARCHIVES").is_some();
        opts.trace_dylibs = env::var_os("LD_TRACE_DYLIBS").is_some();
        if env::var_os("LD_DEAD_STRIP").is_some() {
            opts.dead_code_strip = true;
        }
        if env::var_os("LD_WARN_COMMONS").is_some() {
            opts.warn_commons = true;
        }
        opts.dyld_path = env::var("LD_DYLD_PATH").ok();
        opts.seg_addr_table_path = env::var("LD_SEG_ADDR_TABLE").ok();
        // a deployment-target variable is only a default when no flag gave one
        for var in [
            "MACOSX_DEPLOYMENT_TARGET",
            "IPHONEOS_DEPLOYMENT_TARGET",
            "IOS_DEPLOYMENT_TARGET",
        ] {
            if let Ok(version) = env::var(var) {
                opts.deployment_target = Some(version);
                break;
            }
        }
        if env::var_os("LD_PRINT_OPTIONS").is_some() {
            log::debug!("options: {opts:?}");
        }
        opts
    }

    pub fn has_custom_segment_address(&self, segment: &str) -> bool {
        self.custom_segment_addresses.contains_key(segment)
    }

    pub fn custom_segment_address(&self, segment: &str) -> u64 {
        self.custom_segment_addresses.get(segment).copied().unwrap_or(0)
    }

    pub fn seg_page_size(&self, segment: &str) -> u64 {
        self.custom_segment_page_sizes
            .get(segment)
            .copied()
            .unwrap_or(self.segment_alignment)
    }

    pub fn has_custom_section_alignment(&self, segment: &str, section: &str) -> bool {
        self.custom_section_alignments
            .contains_key(&(segment.to_string(), section.to_string()))
    }

    pub fn custom_section_alignment(&self, segment: &str, section: &str) -> u8 {
        self.custom_section_alignments
            .get(&(segment.to_string(), section.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Should this global symbol be visible outside the linkage unit?
    pub fn should_export(&self, symbol: &str) -> bool {
        match self.export_mode {
            ExportMode::Default => true,
            ExportMode::Some => self.export_list.contains(symbol),
            ExportMode::DontExportSome => !self.dont_export_list.contains(symbol),
        }
    }

    pub fn should_re_export(&self, symbol: &str) -> bool {
        self.re_export_list.contains(symbol)
    }

    pub fn has_export_restrict_list(&self) -> bool {
        self.export_mode != ExportMode::Default
    }

    pub fn has_export_mask_list(&self) -> bool {
        self.export_mode == ExportMode::Some
    }

    pub fn has_re_export_list(&self) -> bool {
        !self.re_export_list.is_empty()
    }

    pub fn interposable(&self, symbol: &str) -> bool {
        match self.interpose_mode {
            InterposeMode::None => false,
            InterposeMode::AllExternal => true,
            InterposeMode::Some => self.interpose_list.contains(symbol),
        }
    }

    pub fn allowed_undefined(&self, symbol: &str) -> bool {
        self.allowed_undefined_list.contains(symbol)
    }

    pub fn some_allowed_undefines(&self) -> bool {
        !self.allowed_undefined_list.is_empty()
    }

    /// Can the final image slide at load time?
    pub fn output_slidable(&self) -> bool {
        match self.output_kind {
            OutputKind::DynamicExecutable => self.position_independent_executable,
            OutputKind::StaticExecutable | OutputKind::Preload => false,
            OutputKind::DynamicLibrary
            | OutputKind::DynamicBundle
            | OutputKind::ObjectFile
            | OutputKind::Dyld
            | OutputKind::KextBundle => true,
        }
    }

    /// In dylibs/bundles without an export list every global is a
    /// dead-strip root
    pub fn all_globals_are_dead_strip_roots(&self) -> bool {
        match self.output_kind {
            OutputKind::DynamicLibrary | OutputKind::DynamicBundle | OutputKind::ObjectFile => true,
            _ => false,
        }
    }

    /// Whether the target OS supports re-exporting individual symbols
    pub fn can_re_export_symbols(&self) -> bool {
        // the predicate is explicit rather than inferred from deployment
        // targets; drivers for older OSes construct Options accordingly
        self.output_kind == OutputKind::DynamicLibrary
    }

    pub fn needs_entry_point(&self) -> bool {
        matches!(
            self.output_kind,
            OutputKind::DynamicExecutable | OutputKind::StaticExecutable | OutputKind::Preload
        )
    }

    pub fn arch_supports_thumb2(&self) -> bool {
        matches!(
            self.sub_architecture,
            CPU_SUBTYPE_ARM_V7 | CPU_SUBTYPE_ARM_V7F | CPU_SUBTYPE_ARM_V7S | CPU_SUBTYPE_ARM_V7K
        )
    }

    /// Bytes reserved before the first section so install names can grow
    pub fn minimum_header_pad(&self, dylib_count: u64) -> u64 {
        if !self.headerpad_max_install_names {
            return 0;
        }
        let extra = if self.output_kind == OutputKind::DynamicLibrary {
            1
        } else {
            0
        };
        (dylib_count + extra) * PATH_MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_literals() {
        assert!(wildcard_match("_main", "_main"));
        assert!(!wildcard_match("_main", "_maim"));
        assert!(!wildcard_match("_main", "_main2"));
    }

    #[test]
    fn wildcard_star_and_question() {
        assert!(wildcard_match("_objc_*", "_objc_msgSend"));
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("_?oo", "_foo"));
        assert!(!wildcard_match("_?oo", "_fooo"));
        assert!(wildcard_match("*Send", "_objc_msgSend"));
    }

    #[test]
    fn wildcard_classes() {
        assert!(wildcard_match("_[a-c]at", "_bat"));
        assert!(!wildcard_match("_[a-c]at", "_dat"));
        assert!(wildcard_match("_[^a-c]at", "_dat"));
        assert!(wildcard_match("_v[12]", "_v1"));
        // unterminated class never matches
        assert!(!wildcard_match("_[a", "_a"));
    }

    #[test]
    fn wildcard_escapes() {
        assert!(wildcard_match(r"_a\*b", "_a*b"));
        assert!(!wildcard_match(r"_a\*b", "_axb"));
    }

    #[test]
    fn export_modes() {
        let mut opts = Options::new(OutputKind::DynamicLibrary, CPU_TYPE_X86_64);
        assert!(opts.should_export("_anything"));
        opts.export_mode = ExportMode::Some;
        opts.export_list.insert("_keep*");
        assert!(opts.should_export("_keep_me"));
        assert!(!opts.should_export("_drop_me"));
        opts.export_mode = ExportMode::DontExportSome;
        opts.dont_export_list.insert("_private");
        assert!(opts.should_export("_keep_me"));
        assert!(!opts.should_export("_private"));
    }

    #[test]
    fn header_pad() {
        let mut opts = Options::new(OutputKind::DynamicLibrary, CPU_TYPE_X86_64);
        assert_eq!(opts.minimum_header_pad(3), 0);
        opts.headerpad_max_install_names = true;
        assert_eq!(opts.minimum_header_pad(3), 4 * PATH_MAX);
    }
}

//! Mach-O constants the link-editor emits, straight out of <mach-o/loader.h>,
//! <mach-o/nlist.h>, and <mach-o/reloc.h>

// The flags field of a section structure is separated into two parts a section
// type and section attributes.  The section types are mutually exclusive (it
// can only have one type) but the section attributes are not (it may have more
// than one attribute).
pub const SECTION_TYPE: u32 = 0x000000ff; // 256 section types
pub const SECTION_ATTRIBUTES: u32 = 0xffffff00; //  24 section attributes

// Constants for the type of a section
pub const S_REGULAR: u32 = 0x0; // regular section
pub const S_ZEROFILL: u32 = 0x1; // zero fill on demand section
pub const S_CSTRING_LITERALS: u32 = 0x2; // section with only literal C strings
pub const S_4BYTE_LITERALS: u32 = 0x3; // section with only 4 byte literals
pub const S_8BYTE_LITERALS: u32 = 0x4; // section with only 8 byte literals
pub const S_LITERAL_POINTERS: u32 = 0x5; // section with only pointers to literals
pub const S_NON_LAZY_SYMBOL_POINTERS: u32 = 0x6; // section with only non-lazy symbol pointers
pub const S_LAZY_SYMBOL_POINTERS: u32 = 0x7; // section with only lazy symbol pointers
pub const S_SYMBOL_STUBS: u32 = 0x8; // section with only symbol stubs, byte size of stub in the reserved2 field
pub const S_MOD_INIT_FUNC_POINTERS: u32 = 0x9; // section with only function pointers for initialization
pub const S_MOD_TERM_FUNC_POINTERS: u32 = 0xa; // section with only function pointers for termination
pub const S_COALESCED: u32 = 0xb; // section contains symbols that are to be coalesced
pub const S_GB_ZEROFILL: u32 = 0xc; // zero fill on demand section that can be larger than 4 gigabytes
pub const S_INTERPOSING: u32 = 0xd; // section with only pairs of function pointers for interposing
pub const S_16BYTE_LITERALS: u32 = 0xe; // section with only 16 byte literals
pub const S_DTRACE_DOF: u32 = 0xf; // section contains DTrace Object Format
pub const S_LAZY_DYLIB_SYMBOL_POINTERS: u32 = 0x10; // lazy symbol pointers to lazy loaded dylibs

// Section types to support thread local variables
pub const S_THREAD_LOCAL_REGULAR: u32 = 0x11; // template of initial values for TLVs
pub const S_THREAD_LOCAL_ZEROFILL: u32 = 0x12; // template of initial values for TLVs
pub const S_THREAD_LOCAL_VARIABLES: u32 = 0x13; // TLV descriptors
pub const S_THREAD_LOCAL_VARIABLE_POINTERS: u32 = 0x14; // pointers to TLV descriptors
pub const S_THREAD_LOCAL_INIT_FUNCTION_POINTERS: u32 = 0x15; // functions to call to initialize TLV values

// Constants for the section attributes part of the flags field of a section
// structure.
pub const SECTION_ATTRIBUTES_USR: u32 = 0xff000000; // User setable attributes
pub const S_ATTR_PURE_INSTRUCTIONS: u32 = 0x80000000; // section contains only true machine instructions
pub const S_ATTR_NO_TOC: u32 = 0x40000000; // coalesced symbols not to be in a ranlib table of contents
pub const S_ATTR_STRIP_STATIC_SYMS: u32 = 0x20000000; // ok to strip static symbols with MH_DYLDLINK
pub const S_ATTR_NO_DEAD_STRIP: u32 = 0x10000000; // no dead stripping
pub const S_ATTR_LIVE_SUPPORT: u32 = 0x08000000; // blocks are live if they reference live blocks
pub const S_ATTR_SELF_MODIFYING_CODE: u32 = 0x04000000; // used with i386 code stubs written on by dyld
pub const S_ATTR_DEBUG: u32 = 0x02000000; // debug section
pub const SECTION_ATTRIBUTES_SYS: u32 = 0x00ffff00; // system setable attributes
pub const S_ATTR_SOME_INSTRUCTIONS: u32 = 0x00000400; // section contains some machine instructions
pub const S_ATTR_EXT_RELOC: u32 = 0x00000200; // section has external relocation entries
pub const S_ATTR_LOC_RELOC: u32 = 0x00000100; // section has local relocation entries

// The currently known segment names and the section names in those segments
pub const SEG_PAGEZERO: &str = "__PAGEZERO"; // catches NULL references for MH_EXECUTE files
pub const SEG_TEXT: &str = "__TEXT"; // the traditional UNIX text segment
pub const SECT_TEXT: &str = "__text"; // the real text part of the text section
pub const SEG_DATA: &str = "__DATA"; // the traditional UNIX data segment
pub const SECT_DATA: &str = "__data"; // the real initialized data section
pub const SECT_BSS: &str = "__bss"; // the real uninitialized data section
pub const SECT_COMMON: &str = "__common"; // common symbols are allocated here by the link editor
pub const SEG_OBJC: &str = "__OBJC"; // objective-C runtime segment
pub const SEG_IMPORT: &str = "__IMPORT"; // self-modifying (i386) jump stubs
pub const SEG_LINKEDIT: &str = "__LINKEDIT"; // structs created and maintained by the link editor
pub const SEG_UNIXSTACK: &str = "__UNIXSTACK"; // the unix stack segment

// Constants for the n_type field in an nlist entry
pub const N_STAB: u8 = 0xe0; // if any of these bits set, a symbolic debugging entry
pub const N_PEXT: u8 = 0x10; // private external symbol bit
pub const N_TYPE: u8 = 0x0e; // mask for the type bits
pub const N_EXT: u8 = 0x01; // external symbol bit, set for external symbols
pub const N_UNDF: u8 = 0x0; // undefined, n_sect == NO_SECT
pub const N_ABS: u8 = 0x2; // absolute, n_sect == NO_SECT
pub const N_SECT: u8 = 0xe; // defined in section number n_sect
pub const N_INDR: u8 = 0xa; // indirect

pub const NO_SECT: u8 = 0; // symbol is not in any section

// Constants for the n_desc field
pub const N_WEAK_REF: u16 = 0x0040; // symbol is weak referenced
pub const N_WEAK_DEF: u16 = 0x0080; // coalesced symbol is a weak definition
pub const N_ARM_THUMB_DEF: u16 = 0x0008; // symbol is a Thumb function (ARM)
pub const N_SYMBOL_RESOLVER: u16 = 0x0100; // address is to a resolver function
pub const N_ALT_ENTRY: u16 = 0x0200; // symbol is pinned to the previous content
pub const N_NO_DEAD_STRIP: u16 = 0x0020; // symbol is not to be dead stripped
pub const REFERENCED_DYNAMICALLY: u16 = 0x0010;

pub const REFERENCE_FLAG_UNDEFINED_NON_LAZY: u16 = 0;
pub const REFERENCE_FLAG_UNDEFINED_LAZY: u16 = 1;

/// ordinal is packed into the high 8 bits of n_desc for two-level images
pub const SELF_LIBRARY_ORDINAL: u8 = 0x0;
pub const DYNAMIC_LOOKUP_ORDINAL: u8 = 0xfe;
pub const EXECUTABLE_ORDINAL: u8 = 0xff;

// The special values in the indirect symbol table
pub const INDIRECT_SYMBOL_LOCAL: u32 = 0x80000000;
pub const INDIRECT_SYMBOL_ABS: u32 = 0x40000000;

// Constants for dyld compressed rebase info
pub const REBASE_TYPE_POINTER: u8 = 1;
pub const REBASE_TYPE_TEXT_ABSOLUTE32: u8 = 2;
pub const REBASE_TYPE_TEXT_PCREL32: u8 = 3;

pub const REBASE_OPCODE_MASK: u8 = 0xF0;
pub const REBASE_IMMEDIATE_MASK: u8 = 0x0F;
pub const REBASE_OPCODE_DONE: u8 = 0x00;
pub const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
pub const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
pub const REBASE_OPCODE_ADD_ADDR_ULEB: u8 = 0x30;
pub const REBASE_OPCODE_ADD_ADDR_IMM_SCALED: u8 = 0x40;
pub const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES: u8 = 0x60;
pub const REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB: u8 = 0x70;
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB: u8 = 0x80;

// Constants for dyld compressed bind info
pub const BIND_TYPE_POINTER: u8 = 1;
pub const BIND_TYPE_TEXT_ABSOLUTE32: u8 = 2;
pub const BIND_TYPE_TEXT_PCREL32: u8 = 3;
pub const BIND_TYPE_OVERRIDE_OF_WEAKDEF_IN_DYLIB: u8 = 0;

pub const BIND_SPECIAL_DYLIB_SELF: i8 = 0;
pub const BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE: i8 = -1;
pub const BIND_SPECIAL_DYLIB_FLAT_LOOKUP: i8 = -2;

pub const BIND_SYMBOL_FLAGS_WEAK_IMPORT: u8 = 0x1;
pub const BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION: u8 = 0x8;

pub const BIND_OPCODE_MASK: u8 = 0xF0;
pub const BIND_IMMEDIATE_MASK: u8 = 0x0F;
pub const BIND_OPCODE_DONE: u8 = 0x00;
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
pub const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
pub const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
pub const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
pub const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
pub const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
pub const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
pub const BIND_OPCODE_DO_BIND: u8 = 0x90;
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xA0;
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xB0;
pub const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xC0;

// Constants for the flags of an export trie terminal
pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;
pub const EXPORT_SYMBOL_FLAGS_KIND_REGULAR: u64 = 0x00;
pub const EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL: u64 = 0x01;
pub const EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE: u64 = 0x02;
pub const EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION: u64 = 0x04;
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;
pub const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

// Relocation r_length values
pub const RELOC_LENGTH_BYTE: u8 = 0;
pub const RELOC_LENGTH_WORD: u8 = 1;
pub const RELOC_LENGTH_LONG: u8 = 2;
pub const RELOC_LENGTH_QUAD: u8 = 3;

// Generic (i386) relocation r_types
pub const GENERIC_RELOC_VANILLA: u8 = 0;
pub const GENERIC_RELOC_PAIR: u8 = 1;
pub const GENERIC_RELOC_SECTDIFF: u8 = 2;
pub const GENERIC_RELOC_LOCAL_SECTDIFF: u8 = 4;
pub const GENERIC_RELOC_TLV: u8 = 5;

// x86_64 relocation r_types
pub const X86_64_RELOC_UNSIGNED: u8 = 0; // for absolute addresses
pub const X86_64_RELOC_SIGNED: u8 = 1; // for signed 32-bit displacement
pub const X86_64_RELOC_BRANCH: u8 = 2; // a CALL/JMP instruction with 32-bit displacement
pub const X86_64_RELOC_GOT_LOAD: u8 = 3; // a MOVQ load of a GOT entry
pub const X86_64_RELOC_GOT: u8 = 4; // other GOT references
pub const X86_64_RELOC_SUBTRACTOR: u8 = 5; // must be followed by a X86_64_RELOC_UNSIGNED
pub const X86_64_RELOC_SIGNED_1: u8 = 6; // signed 32-bit displacement with a -1 addend
pub const X86_64_RELOC_SIGNED_2: u8 = 7; // signed 32-bit displacement with a -2 addend
pub const X86_64_RELOC_SIGNED_4: u8 = 8; // signed 32-bit displacement with a -4 addend
pub const X86_64_RELOC_TLV: u8 = 9; // with TLV entry

// ARM relocation r_types
pub const ARM_RELOC_VANILLA: u8 = 0;
pub const ARM_RELOC_PAIR: u8 = 1;
pub const ARM_RELOC_SECTDIFF: u8 = 2;
pub const ARM_RELOC_LOCAL_SECTDIFF: u8 = 3;
pub const ARM_RELOC_BR24: u8 = 5;
pub const ARM_THUMB_RELOC_BR22: u8 = 6;
pub const ARM_RELOC_HALF: u8 = 8;
pub const ARM_RELOC_HALF_SECTDIFF: u8 = 9;

pub mod cputype {

    pub const CPU_ARCH_MASK: u32 = 0xff000000;
    pub const CPU_ARCH_ABI64: u32 = 0x01000000;
    pub const CPU_TYPE_X86: u32 = 7;
    pub const CPU_TYPE_I386: u32 = CPU_TYPE_X86;
    pub const CPU_TYPE_ARM: u32 = 12;
    pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
    pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

    pub const CPU_SUBTYPE_ARM_V4T: u32 = 5;
    pub const CPU_SUBTYPE_ARM_V6: u32 = 6;
    pub const CPU_SUBTYPE_ARM_V5TEJ: u32 = 7;
    pub const CPU_SUBTYPE_ARM_V7: u32 = 9;
    pub const CPU_SUBTYPE_ARM_V7F: u32 = 10;
    pub const CPU_SUBTYPE_ARM_V7S: u32 = 11;
    pub const CPU_SUBTYPE_ARM_V7K: u32 = 12;

    #[inline(always)]
    pub fn cpu_type_to_str(cputype: u32) -> &'static str {
        match cputype {
            CPU_TYPE_ARM64 => "ARM64",
            CPU_TYPE_X86_64 => "x86-64",
            CPU_TYPE_ARM => "ARM",
            CPU_TYPE_X86 => "x86",
            _ => "UNIMPLEMENTED CPUTYPE",
        }
    }
}

/// PATH_MAX on darwin, used by -headerpad_max_install_names
pub const PATH_MAX: u64 = 1024;

//! # machlink
//!
//! The core of a Mach-O static link-editor: everything between parsing and
//! byte-writing. Hand it parsed input files and an immutable [`options::Options`]
//! record and it will:
//!
//! - resolve symbols across objects, archives, and dylibs ([`resolver`]),
//!   with coalescing, tentative-definition merging, dead-stripping, and
//!   LTO re-entry;
//! - classify and order output sections, then lay them out with addresses
//!   and file offsets ([`state`], [`layout`]);
//! - apply every fixup cluster to the section bytes, inserting ARM branch
//!   islands where `__text` outgrows the branch range ([`apply`],
//!   [`passes::branch_island`]);
//! - emit the LINKEDIT streams: rebase/bind/lazy/weak dyld info, the export
//!   trie, classic relocations for `-r`, symbol/string/indirect tables,
//!   function starts, data-in-code, split-seg info, and the content UUID
//!   ([`linkedit`]).
//!
//! What it deliberately does not do: parse bytes on disk (see the traits in
//! [`input`] for the parser contract), parse command lines, write files, or
//! reserve codesign space. Those live in the surrounding tool.
//!
//! ```rust,ignore
//! use machlink::{link, options::{Options, OutputKind}};
//!
//! let opts = Options::new(OutputKind::DynamicExecutable, machlink::constants::cputype::CPU_TYPE_X86_64);
//! let output = link(&opts, &mut inputs, None)?;
//! // hand output.state, output.linkedit, and output.section_bytes to a writer
//! ```

pub mod apply;
pub mod atom;
pub mod constants;
pub mod error;
pub mod input;
pub mod layout;
pub mod linkedit;
pub mod options;
pub mod passes;
pub mod resolver;
pub mod state;
pub mod strpool;
pub mod symbol_table;

pub use error::{Diagnostics, Error, Result};

use atom::SectionType;
use input::InputSet;
use linkedit::{Linkedit, LinkeditWriter};
use options::Options;
use resolver::{LtoBackend, Resolver};
use state::LinkState;
use symbol_table::SymbolTable;

/// Everything the downstream writer needs to serialize an image
#[derive(Debug)]
pub struct LinkOutput {
    pub state: LinkState,
    pub table: SymbolTable,
    pub linkedit: Linkedit,
    /// content bytes per final section, fixups applied; zerofill-like and
    /// hidden sections carry an empty vector
    pub section_bytes: Vec<Vec<u8>>,
    pub total_file_size: u64,
    pub diagnostics: Diagnostics,
}

/// Runs the whole core: resolution, passes, layout, LINKEDIT emission, and
/// fixup application, in that order.
pub fn link(
    opts: &Options,
    inputs: &mut dyn InputSet,
    lto: Option<&mut dyn LtoBackend>,
) -> Result<LinkOutput> {
    let mut resolver = Resolver::new(opts, inputs);
    resolver.resolve(lto)?;
    let (mut state, table, mut diag) = resolver.into_parts();

    state.sort_sections();
    passes::branch_island::do_pass(opts, &mut state, &table)?;
    // passes may have added atoms; refresh the frozen indirect table
    state.indirect_binding_table = table.indirect_table().to_vec();

    let total_file_size = layout::layout(&mut state, opts, &mut diag)?;

    let writer = LinkeditWriter::new(opts, &table);
    let linkedit = writer.emit(&mut state)?;

    let mut applier = apply::FixupApplier::new(opts, &state);
    applier.lazy_binding_info_offsets = linkedit.lazy_binding_offsets.clone();
    let mut section_bytes: Vec<Vec<u8>> = Vec::with_capacity(state.sections.len());
    for sect_ix in 0..state.sections.len() {
        let sect = &state.sections[sect_ix];
        if sect.is_hidden() || sect.typ().is_zero_fill_like() || sect.typ() == SectionType::AbsoluteSymbols
        {
            section_bytes.push(Vec::new());
            continue;
        }
        let mut bytes = vec![0u8; sect.size as usize];
        if sect.typ() == SectionType::Code {
            // pad between code atoms with no-ops, not zeroes
            apply::copy_no_ops(opts.architecture, &mut bytes, false);
        }
        for &id in &sect.atoms {
            let atom = state.atom(id);
            let start = (atom.final_address() - sect.address) as usize;
            let end = start + atom.size() as usize;
            atom.copy_raw_content(&mut bytes[start..end]);
            applier.apply(id, &mut bytes[start..end], &mut diag)?;
        }
        section_bytes.push(bytes);
    }

    diag.finish()?;
    Ok(LinkOutput {
        state,
        table,
        linkedit,
        section_bytes,
        total_file_size,
        diagnostics: diag,
    })
}

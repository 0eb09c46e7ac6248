//! Branch island insertion.
//!
//! ARM branches reach +/-32MB (thumb2 +/-16MB, thumb1 +/-4MB). When `__text`
//! grows past the limit, regions of trampoline "islands" are placed every
//! `kBetweenRegions` bytes; an out-of-range branch is retargeted to the
//! island chain that hops toward its real target.
//!
//! If too many islands are added to one region the section could grow enough
//! to push other branches out of range; regions are spaced conservatively
//! (2MB of slack per region) to make that effectively impossible.

use std::collections::HashMap;

use crate::atom::{
    Alignment, Atom, AtomContent, AtomId, Cluster, Combine, ContentType, Definition, Fixup,
    FixupBinding, FixupKind, Scope, Section, SectionType, SymbolTableInclusion,
};
use crate::constants::cputype::CPU_TYPE_ARM;
use crate::error::Result;
use crate::options::{Options, OutputKind};
use crate::state::LinkState;
use crate::symbol_table::SymbolTable;

/// A branch destination: an atom plus an interior offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TargetAndOffset {
    atom: AtomId,
    offset: u32,
}

fn text_size_when_might_need_islands(opts: &Options, seen_thumb_branch: bool) -> u64 {
    if !seen_thumb_branch {
        32_000_000 // ARM can branch +/- 32MB
    } else if opts.prefer_sub_architecture && opts.arch_supports_thumb2() {
        16_000_000 // thumb2 can branch +/- 16MB
    } else {
        4_000_000 // thumb1 can branch +/- 4MB
    }
}

fn max_distance_between_islands(opts: &Options, seen_thumb_branch: bool) -> u64 {
    if !seen_thumb_branch {
        30 * 1024 * 1024 // 2MB of branch islands per 32MB
    } else if opts.prefer_sub_architecture && opts.arch_supports_thumb2() {
        14 * 1024 * 1024 // 2MB of branch islands per 16MB
    } else {
        3_500_000 // 0.5MB of branch islands per 4MB
    }
}

fn is_island_branch_kind(kind: FixupKind) -> bool {
    matches!(
        kind,
        FixupKind::StoreARMBranch24
            | FixupKind::StoreThumbBranch22
            | FixupKind::StoreTargetAddressARMBranch24
            | FixupKind::StoreTargetAddressThumbBranch22
    )
}

/// Inserts branch islands into `__text` if the section is large enough to
/// need them. Runs after section sorting, before final layout.
pub fn do_pass(opts: &Options, state: &mut LinkState, table: &SymbolTable) -> Result<()> {
    // only make branch islands in final linked images, and only ARM needs them
    if opts.output_kind == OutputKind::ObjectFile || opts.architecture != CPU_TYPE_ARM {
        return Ok(());
    }

    let Some(text_ix) = state
        .sections
        .iter()
        .position(|s| s.section_name() == "__text")
    else {
        return Ok(());
    };

    // assign tentative section offsets, watch for thumb branches
    let atom_ids: Vec<AtomId> = state.sections[text_ix].atoms.clone();
    let mut has_thumb_branches = false;
    let mut offset = 0u64;
    let mut offsets: HashMap<AtomId, u64> = HashMap::new();
    for &id in &atom_ids {
        let atom = state.atom(id);
        for fixup in &atom.fixups {
            if matches!(
                fixup.kind,
                FixupKind::StoreThumbBranch22 | FixupKind::StoreTargetAddressThumbBranch22
            ) {
                has_thumb_branches = true;
            }
        }
        offset = atom.alignment.round_up(offset);
        offsets.insert(id, offset);
        offset += atom.size();
    }
    let total_text_size = offset;
    if total_text_size < text_size_when_might_need_islands(opts, has_thumb_branches) {
        return Ok(());
    }
    log::debug!("__text section size={total_text_size}, might need branch islands");

    let between_regions = max_distance_between_islands(opts, has_thumb_branches);
    let num_regions = (total_text_size / between_regions) as usize;
    if num_regions == 0 {
        return Ok(());
    }

    // the last safe insertion point before each region boundary
    let mut insertion_points: Vec<usize> = Vec::with_capacity(num_regions);
    for region in 1..=num_regions {
        let boundary = region as u64 * between_regions;
        let mut point = atom_ids.len() - 1;
        for (i, &id) in atom_ids.iter().enumerate() {
            if offsets[&id] + state.atom(id).size() <= boundary {
                point = i;
            } else {
                break;
            }
        }
        insertion_points.push(point);
    }

    // region index -> target -> island atom for that region
    let mut region_islands: Vec<HashMap<TargetAndOffset, AtomId>> =
        (0..num_regions).map(|_| HashMap::new()).collect();

    for &id in &atom_ids {
        let fixup_count = state.atom(id).fixups.len();
        for f_ix in 0..fixup_count {
            let (kind, binding, offset_in_atom) = {
                let f = &state.atom(id).fixups[f_ix];
                (f.kind, f.binding, f.offset_in_atom)
            };
            if !is_island_branch_kind(kind) {
                continue;
            }
            let target = match binding {
                FixupBinding::DirectlyBound(t) => t,
                FixupBinding::IndirectlyBound(slot) => match table.atom_for_slot(slot) {
                    Some(t) => t,
                    None => continue,
                },
                _ => continue,
            };
            // only branches within __text need islands
            let Some(&dst_off) = offsets.get(&target) else { continue };
            let src_off = offsets[&id] + u64::from(offset_in_atom);
            let src_region = (src_off / between_regions) as usize;
            let dst_region = (dst_off / between_regions) as usize;
            if src_region == dst_region {
                continue;
            }
            let final_target = TargetAndOffset { atom: target, offset: 0 };

            // build the chain from the destination side back toward the
            // source, so each island knows its next hop
            let mut next_hop = target;
            let regions: Vec<usize> = if dst_region > src_region {
                // forward branch: islands at boundaries src_region+1..=dst_region
                (src_region + 1..=dst_region.min(num_regions)).rev().collect()
            } else {
                // backward branch
                (dst_region + 1..=src_region.min(num_regions)).collect()
            };
            for region in regions {
                let island_ix = region - 1; // region r sits at boundary r*between_regions
                if island_ix >= num_regions {
                    continue;
                }
                if let Some(&existing) = region_islands[island_ix].get(&final_target) {
                    next_hop = existing;
                    continue;
                }
                let island_off = (island_ix as u64 + 1) * between_regions;
                let island = make_branch_island(
                    opts,
                    state,
                    island_ix,
                    next_hop,
                    final_target,
                    island_off,
                    dst_off,
                )?;
                // place the island after the region's insertion point
                let point = insertion_points[island_ix];
                let pos = state.sections[text_ix]
                    .atoms
                    .iter()
                    .position(|&a| a == atom_ids[point])
                    .unwrap_or(state.sections[text_ix].atoms.len() - 1);
                state.sections[text_ix].atoms.insert(pos + 1, island);
                region_islands[island_ix].insert(final_target, island);
                next_hop = island;
            }
            // retarget the original branch to the first hop
            state.atom_mut(id).fixups[f_ix].binding = FixupBinding::DirectlyBound(next_hop);
        }
    }

    let created: usize = region_islands.iter().map(|m| m.len()).sum();
    if created > 0 {
        log::debug!("added {created} branch islands to __text");
    }
    Ok(())
}

/// Synthesizes one island atom of the flavor the target mode requires
fn make_branch_island(
    opts: &Options,
    state: &mut LinkState,
    island_region: usize,
    next_target: AtomId,
    final_target: TargetAndOffset,
    island_off: u64,
    final_target_off: u64,
) -> Result<AtomId> {
    let target_name = state
        .atom(final_target.atom)
        .name
        .map(|n| state.pool.resolve(n).to_string())
        .unwrap_or_else(|| format!("atom{}", final_target.atom.0));
    let name = if final_target.offset == 0 {
        if island_region == 0 {
            format!("{target_name}.island")
        } else {
            format!("{target_name}.island.{}", island_region + 1)
        }
    } else {
        format!("{target_name}_plus_{}.island.{}", final_target.offset, island_region)
    };
    let name = state.pool.intern(&name);

    let target_is_thumb = state.atom(final_target.atom).thumb;
    let thumb2 = opts.prefer_sub_architecture && opts.arch_supports_thumb2();

    // an ARM branch reaches farther than the thumb spacing used for regions:
    // jump straight to the final target when it is in range, skipping hops
    let reach = if target_is_thumb && thumb2 {
        16_777_214i64
    } else {
        33_554_428i64
    };
    let skip_delta = final_target_off as i64 - island_off as i64;
    let skip_through = skip_delta.abs() < reach;
    let chain_target = if skip_through { final_target.atom } else { next_target };

    let atom = match (target_is_thumb, thumb2, opts.output_slidable()) {
        (true, true, _) => {
            // thumb2-to-thumb: one 32-bit b.w, patched by the applier
            let mut a = island_atom(name, AtomContent::Bytes(0x9000_F000u32.to_le_bytes().to_vec()), 1);
            a.thumb = true;
            a.fixups = vec![
                Fixup::new(0, Cluster::K1of2, FixupKind::SetTargetAddress, FixupBinding::DirectlyBound(chain_target)),
                Fixup::new(0, Cluster::K2of2, FixupKind::StoreThumbBranch22, FixupBinding::None),
            ];
            a
        }
        (true, false, true) => {
            // no large-displacement thumb1 branch exists; four ARM words
            // do a pc-relative load and bx, straight to the final target
            let mut bytes = Vec::with_capacity(16);
            bytes.extend_from_slice(&0xE59F_C004u32.to_le_bytes()); // ldr ip, pc + 4
            bytes.extend_from_slice(&0xE08F_C00Cu32.to_le_bytes()); // add ip, pc, ip
            bytes.extend_from_slice(&0xE12F_FF1Cu32.to_le_bytes()); // bx ip
            bytes.extend_from_slice(&0u32.to_le_bytes()); // .long target-this
            let mut a = island_atom(name, AtomContent::Bytes(bytes), 2);
            let self_placeholder = AtomId(state.atoms.len() as u32); // this island's own id
            a.fixups = vec![
                Fixup::new(12, Cluster::K1of4, FixupKind::SetTargetAddress, FixupBinding::DirectlyBound(final_target.atom)),
                Fixup::new(12, Cluster::K2of4, FixupKind::SubtractTargetAddress, FixupBinding::DirectlyBound(self_placeholder)),
                Fixup::new(12, Cluster::K3of4, FixupKind::AddAddend(-12), FixupBinding::None),
                Fixup::new(12, Cluster::K4of4, FixupKind::StoreLittleEndian32, FixupBinding::None),
            ];
            a
        }
        (true, false, false) => {
            // non-slidable: absolute address load
            let mut bytes = Vec::with_capacity(8);
            bytes.extend_from_slice(&0xE51F_F004u32.to_le_bytes()); // ldr pc, [pc, #-4]
            bytes.extend_from_slice(&0u32.to_le_bytes()); // .long target
            let mut a = island_atom(name, AtomContent::Bytes(bytes), 2);
            a.fixups = vec![
                Fixup::new(4, Cluster::K1of2, FixupKind::SetTargetAddress, FixupBinding::DirectlyBound(final_target.atom)),
                Fixup::new(4, Cluster::K2of2, FixupKind::StoreLittleEndian32, FixupBinding::None),
            ];
            a
        }
        (false, _, _) => {
            // arm-to-arm: one b instruction
            let mut a = island_atom(name, AtomContent::Bytes(0xEA00_0000u32.to_le_bytes().to_vec()), 2);
            a.fixups = vec![
                Fixup::new(0, Cluster::K1of2, FixupKind::SetTargetAddress, FixupBinding::DirectlyBound(chain_target)),
                Fixup::new(0, Cluster::K2of2, FixupKind::StoreARMBranch24, FixupBinding::None),
            ];
            a
        }
    };
    state.push_atom(atom)
}

fn island_atom(name: crate::strpool::Name, content: AtomContent, align_p2: u8) -> Atom {
    let mut atom = Atom::new(
        Section::new("__TEXT", "__text", SectionType::Code),
        Definition::Regular,
        content,
    );
    atom.name = Some(name);
    atom.combine = Combine::Never;
    atom.scope = Scope::LinkageUnit;
    atom.content_type = ContentType::BranchIsland;
    atom.inclusion = SymbolTableInclusion::In;
    atom.alignment = Alignment::new(align_p2);
    atom
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::cputype::{CPU_SUBTYPE_ARM_V7, CPU_TYPE_X86_64};
    use crate::error::Diagnostics;
    use crate::options::CommonsMode;

    fn arm_opts() -> Options {
        let mut opts = Options::new(OutputKind::DynamicExecutable, CPU_TYPE_ARM);
        opts.sub_architecture = CPU_SUBTYPE_ARM_V7;
        opts.prefer_sub_architecture = true;
        opts.base_address = 0x1000;
        opts
    }

    fn thumb_fn(state: &mut LinkState, name: &str, size: u64) -> AtomId {
        let interned = state.pool.intern(name);
        let mut atom = Atom::new(
            Section::new("__TEXT", "__text", SectionType::Code),
            Definition::Regular,
            AtomContent::Bytes(vec![0; size as usize]),
        );
        atom.name = Some(interned);
        atom.thumb = true;
        atom.alignment = Alignment::new(2);
        state.push_atom(atom).unwrap()
    }

    #[test]
    fn small_text_needs_no_islands() {
        let opts = arm_opts();
        let mut state = LinkState::new();
        let table = SymbolTable::new(CommonsMode::IgnoreDylibs);
        let a = thumb_fn(&mut state, "_a", 0x1000);
        state.add_atom_to_section(a, &opts);
        let before = state.atoms.len();
        do_pass(&opts, &mut state, &table).unwrap();
        assert_eq!(state.atoms.len(), before);
    }

    #[test]
    fn non_arm_arch_skips_pass() {
        let opts = Options::new(OutputKind::DynamicExecutable, CPU_TYPE_X86_64);
        let mut state = LinkState::new();
        let table = SymbolTable::new(CommonsMode::IgnoreDylibs);
        let a = thumb_fn(&mut state, "_a", 0x100);
        state.add_atom_to_section(a, &opts);
        let before = state.atoms.len();
        do_pass(&opts, &mut state, &table).unwrap();
        assert_eq!(state.atoms.len(), before);
    }

    #[test]
    fn out_of_range_thumb_branch_gets_island() {
        let opts = arm_opts();
        let mut state = LinkState::new();
        let table = SymbolTable::new(CommonsMode::IgnoreDylibs);

        // a 40MB __text: caller at 0, a sea of filler, callee at 36MB,
        // out of thumb2 +/-16MB range
        let caller = thumb_fn(&mut state, "_caller", 0x10);
        let filler_a = thumb_fn(&mut state, "_filler_a", 0x20_0000);
        let filler_b = thumb_fn(&mut state, "_filler_b", 0x20_0000);
        let mut fillers = vec![filler_a, filler_b];
        for i in 2..18 {
            fillers.push(thumb_fn(&mut state, &format!("_filler_{i}"), 0x20_0000));
        }
        let callee = thumb_fn(&mut state, "_callee", 0x10);
        // bl from _caller to _callee
        state.atom_mut(caller).fixups = vec![
            Fixup::new(0, Cluster::K1of2, FixupKind::SetTargetAddress, FixupBinding::DirectlyBound(callee)),
            Fixup::new(0, Cluster::K2of2, FixupKind::StoreThumbBranch22, FixupBinding::None),
        ];
        state.add_atom_to_section(caller, &opts);
        for f in fillers {
            state.add_atom_to_section(f, &opts);
        }
        state.add_atom_to_section(callee, &opts);

        do_pass(&opts, &mut state, &table).unwrap();

        // the branch was retargeted to an island
        let new_binding = state.atom(caller).fixups[0].binding;
        let FixupBinding::DirectlyBound(island) = new_binding else {
            panic!("branch not retargeted");
        };
        assert_ne!(island, callee);
        let island_atom = state.atom(island);
        assert_eq!(island_atom.content_type, ContentType::BranchIsland);
        assert!(island_atom.thumb);
        assert_eq!(island_atom.size(), 4);
        let name = state.pool.resolve(island_atom.name.unwrap());
        assert!(name.starts_with("_callee.island"));
        // the island's own branch leads to the callee (directly or via hops)
        let mut hop = island;
        for _ in 0..8 {
            let next = match state.atom(hop).fixups[0].binding {
                FixupBinding::DirectlyBound(t) => t,
                _ => panic!("island fixup not direct"),
            };
            if next == callee {
                return;
            }
            hop = next;
        }
        panic!("island chain never reaches the callee");
    }

    #[test]
    fn island_chain_is_laid_out_and_encodable() {
        let opts = arm_opts();
        let mut state = LinkState::new();
        let table = SymbolTable::new(CommonsMode::IgnoreDylibs);
        let caller = thumb_fn(&mut state, "_caller", 0x10);
        let mut fillers = Vec::new();
        for i in 0..18 {
            fillers.push(thumb_fn(&mut state, &format!("_f{i}"), 0x20_0000));
        }
        let callee = thumb_fn(&mut state, "_callee", 0x10);
        state.atom_mut(caller).fixups = vec![
            Fixup::new(0, Cluster::K1of2, FixupKind::SetTargetAddress, FixupBinding::DirectlyBound(callee)),
            Fixup::new(0, Cluster::K2of2, FixupKind::StoreThumbBranch22, FixupBinding::None),
        ];
        state.add_atom_to_section(caller, &opts);
        for f in fillers {
            state.add_atom_to_section(f, &opts);
        }
        state.add_atom_to_section(callee, &opts);
        do_pass(&opts, &mut state, &table).unwrap();

        let mut diag = Diagnostics::default();
        crate::layout::layout(&mut state, &opts, &mut diag).unwrap();

        // every branch in the graph must now be encodable
        let applier = crate::apply::FixupApplier::new(&opts, &state);
        let text_atoms: Vec<AtomId> = state.sections[0].atoms.clone();
        for id in text_atoms {
            let size = state.atom(id).size() as usize;
            let mut buffer = vec![0u8; size];
            state.atom(id).copy_raw_content(&mut buffer);
            if state.atom(id).content_type == ContentType::BranchIsland
                || id == AtomId(0)
            {
                applier.apply(id, &mut buffer, &mut diag).unwrap();
            }
        }
    }
}

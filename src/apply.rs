//! The fixup applier: a small interpreter over each atom's fixup cluster
//! stream. A cluster computes a signed 64-bit accumulator and finally stores
//! it into the atom's content bytes, range-checked and instruction-aware.

use std::collections::HashMap;

use scroll::{Pread, Pwrite, BE, LE};

use crate::atom::{AtomId, FixupBinding, FixupKind};
use crate::constants::cputype::{CPU_TYPE_ARM, CPU_TYPE_I386};
use crate::error::{Diagnostics, Error, Result};
use crate::layout::dump_section_layout;
use crate::options::{Options, OutputKind};
use crate::state::LinkState;

/// Applies fixups for one link; holds the header address and the lazy
/// binding offsets the LINKEDIT emitter computed
pub struct FixupApplier<'a> {
    pub opts: &'a Options,
    pub state: &'a LinkState,
    pub mh_address: u64,
    /// lazy pointer final address -> offset into the lazy binding info
    pub lazy_binding_info_offsets: HashMap<u64, u32>,
}

impl<'a> FixupApplier<'a> {
    pub fn new(opts: &'a Options, state: &'a LinkState) -> Self {
        FixupApplier {
            opts,
            state,
            mh_address: state.mach_header_address(),
            lazy_binding_info_offsets: HashMap::new(),
        }
    }

    /// Walks `atom`'s fixups, mutating `buffer` (the atom's content bytes,
    /// already filled by `copy_raw_content`)
    pub fn apply(&self, id: AtomId, buffer: &mut [u8], diag: &mut Diagnostics) -> Result<()> {
        let atom = self.state.atom(id);
        let mut accumulator: i64 = 0;
        let mut to_target: Option<AtomId> = None;
        let mut thumb_target = false;
        for fixup in &atom.fixups {
            let loc = fixup.offset_in_atom as usize;
            match fixup.kind {
                FixupKind::None
                | FixupKind::NoneFollowOn
                | FixupKind::NoneGroupSubordinate
                | FixupKind::NoneGroupSubordinateFDE
                | FixupKind::NoneGroupSubordinateLSDA
                | FixupKind::NoneGroupSubordinatePersonality
                | FixupKind::LazyTarget
                | FixupKind::DtraceExtra
                | FixupKind::DataInCodeStartData
                | FixupKind::DataInCodeStartJT8
                | FixupKind::DataInCodeStartJT16
                | FixupKind::DataInCodeStartJT32
                | FixupKind::DataInCodeStartJTA32
                | FixupKind::DataInCodeEnd => {}

                FixupKind::SetTargetAddress => {
                    let (addr, target) = self.address_of(fixup)?;
                    to_target = target;
                    thumb_target = self.target_is_thumb(target);
                    accumulator = addr as i64;
                    if thumb_target {
                        accumulator |= 1;
                    }
                    if fixup.content_addend_only || fixup.content_delta_to_addend_only {
                        accumulator = 0;
                    }
                }
                FixupKind::SubtractTargetAddress => {
                    let (addr, _) = self.address_of(fixup)?;
                    if !fixup.content_addend_only {
                        accumulator -= addr as i64;
                    }
                }
                FixupKind::AddAddend(addend) => {
                    // ARM jump tables contain interior .long pointers; those
                    // must not carry the thumb bit even if the atom is thumb
                    if thumb_target && to_target == Some(id) && (addend as i32) > 0 {
                        accumulator &= -2;
                    }
                    if !fixup.content_ignores_addend {
                        accumulator += addend;
                    }
                }
                FixupKind::SubtractAddend(addend) => {
                    if !fixup.content_ignores_addend {
                        accumulator -= addend;
                    }
                }
                FixupKind::SetTargetImageOffset => {
                    let (addr, target) = self.address_of(fixup)?;
                    to_target = target;
                    accumulator = addr as i64 - self.mh_address as i64;
                }
                FixupKind::SetTargetSectionOffset => {
                    accumulator = self.section_offset_of(fixup)? as i64;
                }
                FixupKind::SetTargetTLVTemplateOffset => {
                    accumulator = self.tlv_template_offset_of(fixup)? as i64;
                }
                FixupKind::SetLazyOffset => {
                    let (addr, _) = self.address_of(fixup)?;
                    accumulator = self
                        .lazy_binding_info_offsets
                        .get(&addr)
                        .copied()
                        .map(i64::from)
                        .ok_or_else(|| {
                            Error::Linkedit(format!(
                                "no lazy binding info recorded for lazy pointer at 0x{addr:08X}"
                            ))
                        })?;
                }

                FixupKind::Store8 => {
                    buffer[loc] = buffer[loc].wrapping_add(accumulator as u8);
                }
                FixupKind::StoreLittleEndian16 => {
                    buffer.pwrite_with::<u16>(accumulator as u16, loc, LE)?;
                }
                FixupKind::StoreLittleEndianLow24of32 => {
                    let old: u32 = buffer.pread_with(loc, LE)?;
                    let new = (old & 0xFF00_0000) | ((accumulator as u32) & 0x00FF_FFFF);
                    buffer.pwrite_with::<u32>(new, loc, LE)?;
                }
                FixupKind::StoreLittleEndian32 => {
                    self.range_check_absolute32(accumulator, id, fixup, diag)?;
                    buffer.pwrite_with::<u32>(accumulator as u32, loc, LE)?;
                }
                FixupKind::StoreLittleEndian64 => {
                    buffer.pwrite_with::<u64>(accumulator as u64, loc, LE)?;
                }
                FixupKind::StoreBigEndian16 => {
                    buffer.pwrite_with::<u16>(accumulator as u16, loc, BE)?;
                }
                FixupKind::StoreBigEndianLow24of32 => {
                    let old: u32 = buffer.pread_with(loc, BE)?;
                    let new = (old & 0xFF00_0000) | ((accumulator as u32) & 0x00FF_FFFF);
                    buffer.pwrite_with::<u32>(new, loc, BE)?;
                }
                FixupKind::StoreBigEndian32 => {
                    self.range_check_absolute32(accumulator, id, fixup, diag)?;
                    buffer.pwrite_with::<u32>(accumulator as u32, loc, BE)?;
                }
                FixupKind::StoreBigEndian64 => {
                    buffer.pwrite_with::<u64>(accumulator as u64, loc, BE)?;
                }

                FixupKind::StoreX86PCRel8 | FixupKind::StoreX86BranchPCRel8 => {
                    let delta = if fixup.content_addend_only {
                        accumulator
                    } else {
                        accumulator - (atom.final_address() + u64::from(fixup.offset_in_atom) + 1) as i64
                    };
                    // the one asymmetric window: a full byte of negative reach
                    self.range_check(delta, -128, 127, "8-bit reference", "+/-127B", id, fixup)?;
                    buffer[loc] = delta as u8;
                }
                FixupKind::StoreX86PCRel16 => {
                    let delta = if fixup.content_addend_only {
                        accumulator
                    } else {
                        accumulator - (atom.final_address() + u64::from(fixup.offset_in_atom) + 2) as i64
                    };
                    self.range_check(delta, -0x7FFF, 0x7FFF, "16-bit reference", "+/-32KB", id, fixup)?;
                    buffer.pwrite_with::<u16>(delta as u16, loc, LE)?;
                }
                FixupKind::StoreX86BranchPCRel32 => {
                    let delta = if fixup.content_addend_only {
                        accumulator
                    } else {
                        accumulator - (atom.final_address() + u64::from(fixup.offset_in_atom) + 4) as i64
                    };
                    self.range_check(delta, -0x7FFF_FFFF, 0x7FFF_FFFF, "32-bit branch", "+/-2GB", id, fixup)?;
                    buffer.pwrite_with::<u32>(delta as u32, loc, LE)?;
                }
                FixupKind::StoreX86PCRel32
                | FixupKind::StoreX86PCRel32GOTLoad
                | FixupKind::StoreX86PCRel32GOT
                | FixupKind::StoreX86PCRel32TLVLoad => {
                    let delta = if fixup.content_addend_only {
                        accumulator
                    } else {
                        accumulator - (atom.final_address() + u64::from(fixup.offset_in_atom) + 4) as i64
                    };
                    self.range_check_rip32(delta, id, fixup)?;
                    buffer.pwrite_with::<u32>(delta as u32, loc, LE)?;
                }
                FixupKind::StoreX86Abs32TLVLoad => {
                    buffer.pwrite_with::<u32>(accumulator as u32, loc, LE)?;
                }
                FixupKind::StoreX86Abs32TLVLoadNowLEA => {
                    // TLV entry optimized away; movl becomes an immediate mov
                    self.rewrite_opcode_byte(buffer, loc, 1, 0xA1, 0xB8, "TLV load", "movl")?;
                    buffer.pwrite_with::<u32>(accumulator as u32, loc, LE)?;
                }
                FixupKind::StoreX86PCRel32GOTLoadNowLEA => {
                    // GOT entry optimized away; movq becomes leaq
                    self.rewrite_opcode_byte(buffer, loc, 2, 0x8B, 0x8D, "GOT load", "movq")?;
                    let delta =
                        accumulator - (atom.final_address() + u64::from(fixup.offset_in_atom) + 4) as i64;
                    self.range_check_rip32(delta, id, fixup)?;
                    buffer.pwrite_with::<u32>(delta as u32, loc, LE)?;
                }
                FixupKind::StoreX86PCRel32TLVLoadNowLEA => {
                    self.rewrite_opcode_byte(buffer, loc, 2, 0x8B, 0x8D, "TLV load", "movq")?;
                    let delta =
                        accumulator - (atom.final_address() + u64::from(fixup.offset_in_atom) + 4) as i64;
                    self.range_check_rip32(delta, id, fixup)?;
                    buffer.pwrite_with::<u32>(delta as u32, loc, LE)?;
                }

                FixupKind::StoreARMLoad12 | FixupKind::StoreTargetAddressARMLoad12 => {
                    if fixup.kind == FixupKind::StoreTargetAddressARMLoad12 {
                        let (addr, target) = self.address_of(fixup)?;
                        to_target = target;
                        accumulator = addr as i64;
                    }
                    let delta =
                        accumulator - (atom.final_address() + u64::from(fixup.offset_in_atom) + 8) as i64;
                    self.range_check(
                        delta,
                        -4092,
                        4092,
                        "ARM ldr 12-bit displacement",
                        "+/-4096B",
                        id,
                        fixup,
                    )?;
                    let instruction: u32 = buffer.pread_with(loc, LE)?;
                    let new = if delta >= 0 {
                        (instruction & 0xFFFF_F000) | ((delta as u32) & 0xFFF)
                    } else {
                        (instruction & 0xFF7F_F000) | (((-delta) as u32) & 0xFFF)
                    };
                    buffer.pwrite_with::<u32>(new, loc, LE)?;
                }

                FixupKind::StoreARMBranch24 | FixupKind::StoreTargetAddressARMBranch24 => {
                    if fixup.kind == FixupKind::StoreTargetAddressARMBranch24 {
                        let (addr, target) = self.address_of(fixup)?;
                        to_target = target;
                        thumb_target = self.target_is_thumb(target);
                        accumulator = addr as i64;
                        if thumb_target {
                            accumulator |= 1;
                        }
                        if fixup.content_delta_to_addend_only {
                            accumulator = 0;
                        }
                    }
                    self.store_arm_branch24(id, fixup, accumulator, thumb_target, buffer)?;
                }

                FixupKind::StoreThumbBranch22 | FixupKind::StoreTargetAddressThumbBranch22 => {
                    if fixup.kind == FixupKind::StoreTargetAddressThumbBranch22 {
                        let (addr, target) = self.address_of(fixup)?;
                        to_target = target;
                        thumb_target = self.target_is_thumb(target);
                        accumulator = addr as i64;
                        if thumb_target {
                            accumulator |= 1;
                        }
                        if fixup.content_delta_to_addend_only {
                            accumulator = 0;
                        }
                    }
                    self.store_thumb_branch22(id, fixup, accumulator, thumb_target, buffer)?;
                }

                FixupKind::StoreARMLow16 => {
                    let imm4 = ((accumulator as u32) & 0x0000_F000) >> 12;
                    let imm12 = (accumulator as u32) & 0x0000_0FFF;
                    let instruction: u32 = buffer.pread_with(loc, LE)?;
                    let new = (instruction & 0xFFF0_F000) | (imm4 << 16) | imm12;
                    buffer.pwrite_with::<u32>(new, loc, LE)?;
                }
                FixupKind::StoreARMHigh16 => {
                    let imm4 = ((accumulator as u32) & 0xF000_0000) >> 28;
                    let imm12 = ((accumulator as u32) & 0x0FFF_0000) >> 16;
                    let instruction: u32 = buffer.pread_with(loc, LE)?;
                    let new = (instruction & 0xFFF0_F000) | (imm4 << 16) | imm12;
                    buffer.pwrite_with::<u32>(new, loc, LE)?;
                }
                FixupKind::StoreThumbLow16 => {
                    let acc = accumulator as u32;
                    let imm4 = (acc & 0x0000_F000) >> 12;
                    let i = (acc & 0x0000_0800) >> 11;
                    let imm3 = (acc & 0x0000_0700) >> 8;
                    let imm8 = acc & 0x0000_00FF;
                    let instruction: u32 = buffer.pread_with(loc, LE)?;
                    let new = (instruction & 0x8F00_FBF0) | imm4 | (i << 10) | (imm3 << 28) | (imm8 << 16);
                    buffer.pwrite_with::<u32>(new, loc, LE)?;
                }
                FixupKind::StoreThumbHigh16 => {
                    let acc = accumulator as u32;
                    let imm4 = (acc & 0xF000_0000) >> 28;
                    let i = (acc & 0x0800_0000) >> 27;
                    let imm3 = (acc & 0x0700_0000) >> 24;
                    let imm8 = (acc & 0x00FF_0000) >> 16;
                    let instruction: u32 = buffer.pread_with(loc, LE)?;
                    let new = (instruction & 0x8F00_FBF0) | imm4 | (i << 10) | (imm3 << 28) | (imm8 << 16);
                    buffer.pwrite_with::<u32>(new, loc, LE)?;
                }

                FixupKind::StoreX86DtraceCallSiteNop => {
                    if self.opts.output_kind != OutputKind::ObjectFile {
                        // call site becomes a 1-byte nop plus a 4-byte nop
                        buffer[loc - 1] = 0x90;
                        buffer[loc] = 0x0F;
                        buffer[loc + 1] = 0x1F;
                        buffer[loc + 2] = 0x40;
                        buffer[loc + 3] = 0x00;
                    }
                }
                FixupKind::StoreX86DtraceIsEnableSiteClear => {
                    if self.opts.output_kind != OutputKind::ObjectFile {
                        // call site becomes xorl eax,eax plus nops
                        buffer[loc - 1] = 0x33;
                        buffer[loc] = 0xC0;
                        buffer[loc + 1] = 0x90;
                        buffer[loc + 2] = 0x90;
                        buffer[loc + 3] = 0x90;
                    }
                }
                FixupKind::StoreARMDtraceCallSiteNop => {
                    if self.opts.output_kind != OutputKind::ObjectFile {
                        buffer.pwrite_with::<u32>(0xE1A0_0000, loc, LE)?;
                    }
                }
                FixupKind::StoreARMDtraceIsEnableSiteClear => {
                    if self.opts.output_kind != OutputKind::ObjectFile {
                        // eor r0, r0, r0
                        buffer.pwrite_with::<u32>(0xE020_0000, loc, LE)?;
                    }
                }
                FixupKind::StoreThumbDtraceCallSiteNop => {
                    if self.opts.output_kind != OutputKind::ObjectFile {
                        // 32-bit blx site becomes two thumb nops
                        buffer.pwrite_with::<u32>(0x46C0_46C0, loc, LE)?;
                    }
                }
                FixupKind::StoreThumbDtraceIsEnableSiteClear => {
                    if self.opts.output_kind != OutputKind::ObjectFile {
                        buffer.pwrite_with::<u32>(0x46C0_4040, loc, LE)?;
                    }
                }

                FixupKind::StoreTargetAddressLittleEndian32 => {
                    let (addr, target) = self.address_of(fixup)?;
                    to_target = target;
                    thumb_target = self.target_is_thumb(target);
                    accumulator = addr as i64;
                    if thumb_target {
                        accumulator |= 1;
                    }
                    if fixup.content_addend_only {
                        accumulator = 0;
                    }
                    self.range_check_absolute32(accumulator, id, fixup, diag)?;
                    buffer.pwrite_with::<u32>(accumulator as u32, loc, LE)?;
                }
                FixupKind::StoreTargetAddressLittleEndian64 => {
                    let (addr, target) = self.address_of(fixup)?;
                    to_target = target;
                    accumulator = addr as i64;
                    if fixup.content_addend_only {
                        accumulator = 0;
                    }
                    buffer.pwrite_with::<u64>(accumulator as u64, loc, LE)?;
                }
                FixupKind::StoreTargetAddressBigEndian32 => {
                    let (addr, target) = self.address_of(fixup)?;
                    to_target = target;
                    accumulator = addr as i64;
                    if fixup.content_addend_only {
                        accumulator = 0;
                    }
                    buffer.pwrite_with::<u32>(accumulator as u32, loc, BE)?;
                }
                FixupKind::StoreTargetAddressBigEndian64 => {
                    let (addr, target) = self.address_of(fixup)?;
                    to_target = target;
                    accumulator = addr as i64;
                    if fixup.content_addend_only {
                        accumulator = 0;
                    }
                    buffer.pwrite_with::<u64>(accumulator as u64, loc, BE)?;
                }
                FixupKind::StoreTargetAddressX86PCRel32
                | FixupKind::StoreTargetAddressX86BranchPCRel32
                | FixupKind::StoreTargetAddressX86PCRel32GOTLoad => {
                    let (addr, target) = self.address_of(fixup)?;
                    to_target = target;
                    accumulator = addr as i64;
                    if fixup.content_delta_to_addend_only {
                        accumulator = 0;
                    }
                    let delta = if fixup.content_addend_only {
                        0
                    } else {
                        accumulator - (atom.final_address() + u64::from(fixup.offset_in_atom) + 4) as i64
                    };
                    self.range_check_rip32(delta, id, fixup)?;
                    buffer.pwrite_with::<u32>(delta as u32, loc, LE)?;
                }
                FixupKind::StoreTargetAddressX86PCRel32GOTLoadNowLEA => {
                    self.rewrite_opcode_byte(buffer, loc, 2, 0x8B, 0x8D, "GOT load", "movq")?;
                    let (addr, target) = self.address_of(fixup)?;
                    to_target = target;
                    accumulator = addr as i64;
                    let delta =
                        accumulator - (atom.final_address() + u64::from(fixup.offset_in_atom) + 4) as i64;
                    self.range_check_rip32(delta, id, fixup)?;
                    buffer.pwrite_with::<u32>(delta as u32, loc, LE)?;
                }
            }
        }
        Ok(())
    }

    fn store_arm_branch24(
        &self,
        id: AtomId,
        fixup: &crate::atom::Fixup,
        accumulator: i64,
        thumb_target: bool,
        buffer: &mut [u8],
    ) -> Result<()> {
        let atom = self.state.atom(id);
        let loc = fixup.offset_in_atom as usize;
        // the ARM pipeline adds +8 to the pc
        let delta = accumulator - (atom.final_address() + u64::from(fixup.offset_in_atom) + 8) as i64;
        if delta > 33_554_428 || delta < -33_554_432 {
            dump_section_layout(self.state);
            return Err(Error::Fixup(format!(
                "b/bl/blx ARM branch out of range ({delta} max is +/-32MB): from {} (0x{:08X}) to {} (0x{:08X})",
                self.atom_name(id),
                atom.final_address(),
                self.target_name(fixup),
                accumulator
            )));
        }
        let instruction: u32 = buffer.pread_with(loc, LE)?;
        // make sure we call arm with bl, thumb with blx
        let is_bl = (instruction & 0xFF00_0000) == 0xEB00_0000;
        let is_blx = (instruction & 0xFE00_0000) == 0xFA00_0000;
        let is_b = !is_blx && (instruction & 0x0F00_0000) == 0x0A00_0000;
        let new = if is_bl && thumb_target {
            let disp = ((delta >> 2) as u32) & 0x00FF_FFFF;
            let h_bit = ((delta << 23) as u32) & 0x0100_0000;
            0xFA00_0000 | h_bit | disp
        } else if is_blx && !thumb_target {
            let disp = ((delta >> 2) as u32) & 0x00FF_FFFF;
            0xEB00_0000 | disp
        } else if is_b && thumb_target {
            if fixup.content_delta_to_addend_only {
                (instruction & 0xFF00_0000) | (((delta >> 2) as u32) & 0x00FF_FFFF)
            } else {
                return Err(Error::Fixup(format!(
                    "no pc-rel bx arm instruction. Can't fix up branch to {} in {}",
                    self.target_name(fixup),
                    self.atom_name(id)
                )));
            }
        } else if !is_bl && !is_blx && thumb_target {
            return Err(Error::Fixup(format!(
                "don't know how to convert instruction {instruction:x} referencing {} to thumb",
                self.target_name(fixup)
            )));
        } else {
            (instruction & 0xFF00_0000) | (((delta >> 2) as u32) & 0x00FF_FFFF)
        };
        buffer.pwrite_with::<u32>(new, loc, LE)?;
        Ok(())
    }

    fn store_thumb_branch22(
        &self,
        id: AtomId,
        fixup: &crate::atom::Fixup,
        mut accumulator: i64,
        thumb_target: bool,
        buffer: &mut [u8],
    ) -> Result<()> {
        let atom = self.state.atom(id);
        let loc = fixup.offset_in_atom as usize;
        let instruction: u32 = buffer.pread_with(loc, LE)?;
        let is_bl = (instruction & 0xD000_F800) == 0xD000_F000;
        let is_blx = (instruction & 0xD000_F800) == 0xC000_F000;
        let is_b = (instruction & 0xD000_F800) == 0x9000_F000;
        // blx cannot have the low bit set: copy bit[1] of the base address so
        // the displacement stays a multiple of 4
        if !thumb_target && !fixup.content_delta_to_addend_only {
            accumulator &= -3;
            accumulator |= ((atom.final_address() + u64::from(fixup.offset_in_atom)) & 2) as i64;
        }
        // the thumb pipeline adds +4 to the pc
        let delta = accumulator - (atom.final_address() + u64::from(fixup.offset_in_atom) + 4) as i64;
        let thumb2 = self.opts.prefer_sub_architecture && self.opts.arch_supports_thumb2();
        if thumb2 {
            if delta > 16_777_214 || delta < -16_777_216 {
                dump_section_layout(self.state);
                return Err(Error::Fixup(format!(
                    "b/bl/blx thumb2 branch out of range ({delta} max is +/-16MB): from {} (0x{:08X}) to {} (0x{:08X})",
                    self.atom_name(id),
                    atom.final_address(),
                    self.target_name(fixup),
                    accumulator
                )));
            }
        } else if delta > 4_194_302 || delta < -4_194_304 {
            dump_section_layout(self.state);
            return Err(Error::Fixup(format!(
                "b/bl/blx thumb1 branch out of range ({delta} max is +/-4MB): from {} (0x{:08X}) to {} (0x{:08X})",
                self.atom_name(id),
                atom.final_address(),
                self.target_name(fixup),
                accumulator
            )));
        }
        let new = if thumb2 {
            // two halfwords: low 16 bits carry the high displacement bits,
            // high 16 bits differentiate bl/blx and carry the low bits
            let s = ((delta >> 24) as u32) & 0x1;
            let i1 = ((delta >> 23) as u32) & 0x1;
            let i2 = ((delta >> 22) as u32) & 0x1;
            let imm10 = ((delta >> 12) as u32) & 0x3FF;
            let imm11 = ((delta >> 1) as u32) & 0x7FF;
            let j1 = u32::from(i1 == s);
            let j2 = u32::from(i2 == s);
            let opcode = if is_bl || is_blx {
                if thumb_target { 0xD000_F000 } else { 0xC000_F000 }
            } else if is_b {
                if !thumb_target && !fixup.content_delta_to_addend_only {
                    return Err(Error::Fixup(format!(
                        "armv7 has no pc-rel bx thumb instruction. Can't fix up branch to {} in {}",
                        self.target_name(fixup),
                        self.atom_name(id)
                    )));
                }
                0x9000_F000
            } else {
                if !thumb_target {
                    return Err(Error::Fixup(format!(
                        "don't know how to convert branch instruction {instruction:x} referencing {} to bx",
                        self.target_name(fixup)
                    )));
                }
                0x9000_F000
            };
            let next_disp = (j1 << 13) | (j2 << 11) | imm11;
            let first_disp = (s << 10) | imm10;
            opcode | (next_disp << 16) | first_disp
        } else {
            let first_disp = ((delta >> 12) as u32) & 0x7FF;
            let next_disp = ((delta >> 1) as u32) & 0x7FF;
            let opcode = if is_bl && !thumb_target {
                0xE800_F000
            } else if is_blx && thumb_target {
                0xF800_F000
            } else if is_b {
                if !thumb_target && !fixup.content_delta_to_addend_only {
                    return Err(Error::Fixup(format!(
                        "armv6 has no pc-rel bx thumb instruction. Can't fix up branch to {} in {}",
                        self.target_name(fixup),
                        self.atom_name(id)
                    )));
                }
                0x9000_F000
            } else {
                instruction & 0xF800_F800
            };
            opcode | (next_disp << 16) | first_disp
        };
        buffer.pwrite_with::<u32>(new, loc, LE)?;
        Ok(())
    }

    /// Resolves a fixup's target to its final address
    fn address_of(&self, fixup: &crate::atom::Fixup) -> Result<(u64, Option<AtomId>)> {
        if !self.opts.make_compressed_dyld_info && fixup.content_addend_only {
            // classic external relocations keep only the addend in content
            return Ok((0, None));
        }
        let target = match fixup.binding {
            FixupBinding::None => {
                return Err(Error::Fixup("unexpected fixup binding None".into()));
            }
            FixupBinding::ByNameUnbound(_) => {
                return Err(Error::Fixup("unexpected unbound fixup binding".into()));
            }
            FixupBinding::DirectlyBound(t) | FixupBinding::ByContentBound(t) => t,
            FixupBinding::IndirectlyBound(slot) => self
                .state
                .indirect_binding_table
                .get(slot as usize)
                .copied()
                .flatten()
                .ok_or_else(|| {
                    Error::Malformed(format!("indirect binding slot {slot} not assigned"))
                })?,
        };
        let atom = self.state.atom(target);
        if !atom.has_final_address() {
            return Err(Error::Fixup(format!(
                "reference to symbol (which has not been assigned an address) {}",
                self.atom_name(target)
            )));
        }
        Ok((atom.final_address(), Some(target)))
    }

    fn target_is_thumb(&self, target: Option<AtomId>) -> bool {
        target.is_some_and(|t| self.state.atom(t).thumb)
    }

    fn section_offset_of(&self, fixup: &crate::atom::Fixup) -> Result<u64> {
        let (address, _) = self.address_of(fixup)?;
        self.state
            .section_containing(address)
            .map(|sect| address - sect.address)
            .ok_or_else(|| Error::Fixup("section not found for section offset".into()))
    }

    fn tlv_template_offset_of(&self, fixup: &crate::atom::Fixup) -> Result<u64> {
        let (address, _) = self.address_of(fixup)?;
        for sect in &self.state.sections {
            match sect.typ() {
                crate::atom::SectionType::TLVInitialValues
                | crate::atom::SectionType::TLVZeroFill => {
                    return Ok(address - sect.address);
                }
                _ => {}
            }
        }
        Err(Error::Fixup("section not found for TLV template offset".into()))
    }

    fn rewrite_opcode_byte(
        &self,
        buffer: &mut [u8],
        loc: usize,
        back: usize,
        expect: u8,
        replace: u8,
        what: &str,
        insn: &str,
    ) -> Result<()> {
        if self.opts.output_kind == OutputKind::ObjectFile {
            return Err(Error::Fixup(format!(
                "{what} optimization not valid in object file output"
            )));
        }
        if loc < back || buffer[loc - back] != expect {
            return Err(Error::Fixup(format!(
                "{what} reloc does not point to a {insn} instruction"
            )));
        }
        buffer[loc - back] = replace;
        Ok(())
    }

    fn range_check(
        &self,
        displacement: i64,
        lower: i64,
        upper: i64,
        what: &str,
        window: &str,
        id: AtomId,
        fixup: &crate::atom::Fixup,
    ) -> Result<()> {
        if displacement > upper || displacement < lower {
            dump_section_layout(self.state);
            return Err(Error::Fixup(format!(
                "{what} out of range ({displacement} max is {window}): from {} (0x{:08X}) to {} (0x{:08X})",
                self.atom_name(id),
                self.state.atom(id).final_address(),
                self.target_name(fixup),
                self.address_of(fixup).map(|(a, _)| a).unwrap_or(0)
            )));
        }
        Ok(())
    }

    fn range_check_rip32(&self, displacement: i64, id: AtomId, fixup: &crate::atom::Fixup) -> Result<()> {
        self.range_check(
            displacement,
            -0x7FFF_FFFF,
            0x7FFF_FFFF,
            "32-bit RIP relative reference",
            "+/-2GB",
            id,
            fixup,
        )
    }

    fn range_check_absolute32(
        &self,
        value: i64,
        id: AtomId,
        fixup: &crate::atom::Fixup,
        diag: &mut Diagnostics,
    ) -> Result<()> {
        const FOUR_GIG: i64 = 0xFFFF_FFFF;
        if value <= FOUR_GIG {
            return Ok(());
        }
        // 32-bit archs lose sign information in the assembler, so userland
        // overflow is only a warning there (an explicit knob, not inferred)
        if (self.opts.architecture == CPU_TYPE_ARM || self.opts.architecture == CPU_TYPE_I386)
            && self.opts.allow_32bit_overflow
        {
            diag.warning(format!(
                "32-bit absolute address out of range (0x{value:08X} max is 4GB): from {} + 0x{:08X}",
                self.atom_name(id),
                fixup.offset_in_atom
            ));
            return Ok(());
        }
        dump_section_layout(self.state);
        Err(Error::Fixup(format!(
            "32-bit absolute address out of range (0x{value:08X} max is 4GB): from {} + 0x{:08X} (0x{:08X}) to {}",
            self.atom_name(id),
            fixup.offset_in_atom,
            self.state.atom(id).final_address(),
            self.target_name(fixup)
        )))
    }

    fn atom_name(&self, id: AtomId) -> String {
        self.state
            .atom(id)
            .name
            .map(|n| self.state.pool.resolve(n).to_string())
            .unwrap_or_else(|| format!("atom#{}", id.0))
    }

    fn target_name(&self, fixup: &crate::atom::Fixup) -> String {
        match fixup.binding {
            FixupBinding::DirectlyBound(t) | FixupBinding::ByContentBound(t) => self.atom_name(t),
            FixupBinding::IndirectlyBound(slot) => self
                .state
                .indirect_binding_table
                .get(slot as usize)
                .copied()
                .flatten()
                .map(|t| self.atom_name(t))
                .unwrap_or_else(|| format!("slot#{slot}")),
            FixupBinding::ByNameUnbound(_) | FixupBinding::None => "unbound target".to_string(),
        }
    }
}

/// Fills padding between code atoms with architecture-appropriate no-ops
pub fn copy_no_ops(architecture: u32, buffer: &mut [u8], thumb: bool) {
    use crate::constants::cputype::{CPU_TYPE_X86, CPU_TYPE_X86_64};
    match architecture {
        CPU_TYPE_X86 | CPU_TYPE_X86_64 => buffer.fill(0x90),
        CPU_TYPE_ARM => {
            if thumb {
                for chunk in buffer.chunks_exact_mut(2) {
                    chunk.copy_from_slice(&0x46C0u16.to_le_bytes());
                }
            } else {
                for chunk in buffer.chunks_exact_mut(4) {
                    chunk.copy_from_slice(&0xE1A0_0000u32.to_le_bytes());
                }
            }
        }
        _ => buffer.fill(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{
        Atom, AtomAddress, AtomContent, Cluster, Definition, Fixup, Section, SectionType,
    };
    use crate::constants::cputype::CPU_TYPE_X86_64;

    fn fixture() -> (Options, LinkState) {
        let opts = Options::new(OutputKind::DynamicExecutable, CPU_TYPE_X86_64);
        let state = LinkState::new();
        (opts, state)
    }

    fn code_atom(state: &mut LinkState, addr: u64, bytes: Vec<u8>) -> AtomId {
        let mut atom = Atom::new(
            Section::new("__TEXT", "__text", SectionType::Code),
            Definition::Regular,
            AtomContent::Bytes(bytes),
        );
        atom.address = AtomAddress::Final(addr);
        state.push_atom(atom).unwrap()
    }

    #[test]
    fn pointer_store_little_endian64() {
        let (opts, mut state) = fixture();
        let target = code_atom(&mut state, 0x1_0000_2000, vec![0; 8]);
        let source = code_atom(&mut state, 0x1_0000_1000, vec![0; 8]);
        state.atom_mut(source).fixups = vec![
            Fixup::new(
                0,
                Cluster::K1of2,
                FixupKind::SetTargetAddress,
                FixupBinding::DirectlyBound(target),
            ),
            Fixup::new(0, Cluster::K2of2, FixupKind::StoreLittleEndian64, FixupBinding::None),
        ];
        let applier = FixupApplier::new(&opts, &state);
        let mut buffer = vec![0u8; 8];
        let mut diag = Diagnostics::default();
        applier.apply(source, &mut buffer, &mut diag).unwrap();
        assert_eq!(u64::from_le_bytes(buffer.try_into().unwrap()), 0x1_0000_2000);
    }

    #[test]
    fn branch_pcrel32_displacement() {
        let (opts, mut state) = fixture();
        let target = code_atom(&mut state, 0x1000, vec![0; 4]);
        // call at offset 1 (opcode byte at 0), next insn at atom+5
        let source = code_atom(&mut state, 0x2000, vec![0xE8, 0, 0, 0, 0]);
        state.atom_mut(source).fixups = vec![
            Fixup::new(
                1,
                Cluster::K1of2,
                FixupKind::SetTargetAddress,
                FixupBinding::DirectlyBound(target),
            ),
            Fixup::new(1, Cluster::K2of2, FixupKind::StoreX86BranchPCRel32, FixupBinding::None),
        ];
        let applier = FixupApplier::new(&opts, &state);
        let mut buffer = state.atom(source).raw_content().unwrap().to_vec();
        let mut diag = Diagnostics::default();
        applier.apply(source, &mut buffer, &mut diag).unwrap();
        let disp = i32::from_le_bytes(buffer[1..5].try_into().unwrap());
        assert_eq!(disp, 0x1000 - (0x2000 + 1 + 4));
    }

    #[test]
    fn addend_applies_to_accumulator() {
        let (opts, mut state) = fixture();
        let target = code_atom(&mut state, 0x4000, vec![0; 4]);
        let source = code_atom(&mut state, 0x2000, vec![0; 8]);
        state.atom_mut(source).fixups = vec![
            Fixup::new(
                0,
                Cluster::K1of3,
                FixupKind::SetTargetAddress,
                FixupBinding::DirectlyBound(target),
            ),
            Fixup::new(0, Cluster::K2of3, FixupKind::AddAddend(0x10), FixupBinding::None),
            Fixup::new(0, Cluster::K3of3, FixupKind::StoreLittleEndian64, FixupBinding::None),
        ];
        let applier = FixupApplier::new(&opts, &state);
        let mut buffer = vec![0u8; 8];
        let mut diag = Diagnostics::default();
        applier.apply(source, &mut buffer, &mut diag).unwrap();
        assert_eq!(u64::from_le_bytes(buffer.try_into().unwrap()), 0x4010);
    }

    #[test]
    fn got_load_rewrites_movq_to_leaq() {
        let (opts, mut state) = fixture();
        let target = code_atom(&mut state, 0x3000, vec![0; 8]);
        // movq 0(%rip),%rax = 48 8B 05 <disp32>
        let source = code_atom(&mut state, 0x2000, vec![0x48, 0x8B, 0x05, 0, 0, 0, 0]);
        state.atom_mut(source).fixups = vec![
            Fixup::new(
                3,
                Cluster::K1of2,
                FixupKind::SetTargetAddress,
                FixupBinding::DirectlyBound(target),
            ),
            Fixup::new(
                3,
                Cluster::K2of2,
                FixupKind::StoreX86PCRel32GOTLoadNowLEA,
                FixupBinding::None,
            ),
        ];
        let applier = FixupApplier::new(&opts, &state);
        let mut buffer = state.atom(source).raw_content().unwrap().to_vec();
        let mut diag = Diagnostics::default();
        applier.apply(source, &mut buffer, &mut diag).unwrap();
        assert_eq!(buffer[1], 0x8D);
        let disp = i32::from_le_bytes(buffer[3..7].try_into().unwrap());
        assert_eq!(disp, 0x3000 - (0x2000 + 3 + 4));
    }

    #[test]
    fn got_load_rewrite_rejects_wrong_opcode() {
        let (opts, mut state) = fixture();
        let target = code_atom(&mut state, 0x3000, vec![0; 8]);
        let source = code_atom(&mut state, 0x2000, vec![0x48, 0x89, 0x05, 0, 0, 0, 0]);
        state.atom_mut(source).fixups = vec![
            Fixup::new(
                3,
                Cluster::K1of2,
                FixupKind::SetTargetAddress,
                FixupBinding::DirectlyBound(target),
            ),
            Fixup::new(
                3,
                Cluster::K2of2,
                FixupKind::StoreX86PCRel32GOTLoadNowLEA,
                FixupBinding::None,
            ),
        ];
        let applier = FixupApplier::new(&opts, &state);
        let mut buffer = state.atom(source).raw_content().unwrap().to_vec();
        let mut diag = Diagnostics::default();
        assert!(applier.apply(source, &mut buffer, &mut diag).is_err());
    }

    #[test]
    fn pcrel8_out_of_range_errors() {
        let (opts, mut state) = fixture();
        let target = code_atom(&mut state, 0x4000, vec![0; 4]);
        let source = code_atom(&mut state, 0x2000, vec![0xEB, 0]);
        state.atom_mut(source).fixups = vec![
            Fixup::new(
                1,
                Cluster::K1of2,
                FixupKind::SetTargetAddress,
                FixupBinding::DirectlyBound(target),
            ),
            Fixup::new(1, Cluster::K2of2, FixupKind::StoreX86BranchPCRel8, FixupBinding::None),
        ];
        let applier = FixupApplier::new(&opts, &state);
        let mut buffer = vec![0xEB, 0];
        let mut diag = Diagnostics::default();
        let err = applier.apply(source, &mut buffer, &mut diag).unwrap_err();
        assert!(format!("{err}").contains("out of range"));
    }

    #[test]
    fn rip32_window_is_symmetric() {
        let (opts, mut state) = fixture();
        let target = code_atom(&mut state, 0x2004, vec![0; 4]);
        // delta = 0x2004 - (0x8000_2000 + 4) = -0x8000_0000: one past the edge
        let source = code_atom(&mut state, 0x8000_2000, vec![0; 4]);
        state.atom_mut(source).fixups = vec![
            Fixup::new(
                0,
                Cluster::K1of2,
                FixupKind::SetTargetAddress,
                FixupBinding::DirectlyBound(target),
            ),
            Fixup::new(0, Cluster::K2of2, FixupKind::StoreX86PCRel32, FixupBinding::None),
        ];
        let applier = FixupApplier::new(&opts, &state);
        let mut buffer = vec![0u8; 4];
        let mut diag = Diagnostics::default();
        let err = applier.apply(source, &mut buffer, &mut diag).unwrap_err();
        assert!(format!("{err}").contains("out of range"));

        // delta = -0x7FFF_FFFF is the last reachable negative displacement
        let near = code_atom(&mut state, 0x8000_1FFF, vec![0; 4]);
        state.atom_mut(near).fixups = vec![
            Fixup::new(
                0,
                Cluster::K1of2,
                FixupKind::SetTargetAddress,
                FixupBinding::DirectlyBound(target),
            ),
            Fixup::new(0, Cluster::K2of2, FixupKind::StoreX86PCRel32, FixupBinding::None),
        ];
        let applier = FixupApplier::new(&opts, &state);
        let mut buffer = vec![0u8; 4];
        applier.apply(near, &mut buffer, &mut diag).unwrap();
        assert_eq!(i32::from_le_bytes(buffer.try_into().unwrap()), -0x7FFF_FFFF);
    }

    #[test]
    fn arm_bl_to_thumb_becomes_blx() {
        let mut opts = Options::new(OutputKind::DynamicExecutable, CPU_TYPE_ARM);
        opts.base_address = 0;
        let mut state = LinkState::new();
        let mut thumb_fn = Atom::new(
            Section::new("__TEXT", "__text", SectionType::Code),
            Definition::Regular,
            AtomContent::Bytes(vec![0; 2]),
        );
        thumb_fn.thumb = true;
        thumb_fn.address = AtomAddress::Final(0x8000);
        let target = state.push_atom(thumb_fn).unwrap();
        // bl encoding EB......
        let source = code_atom(&mut state, 0x4000, vec![0xFE, 0xFF, 0xFF, 0xEB]);
        state.atom_mut(source).fixups = vec![
            Fixup::new(
                0,
                Cluster::K1of2,
                FixupKind::SetTargetAddress,
                FixupBinding::DirectlyBound(target),
            ),
            Fixup::new(0, Cluster::K2of2, FixupKind::StoreARMBranch24, FixupBinding::None),
        ];
        let applier = FixupApplier::new(&opts, &state);
        let mut buffer = state.atom(source).raw_content().unwrap().to_vec();
        let mut diag = Diagnostics::default();
        applier.apply(source, &mut buffer, &mut diag).unwrap();
        let instruction = u32::from_le_bytes(buffer.try_into().unwrap());
        // rewritten to blx (FA opcode space)
        assert_eq!(instruction & 0xFE00_0000, 0xFA00_0000);
        // displacement: thumb bit set then cleared by encoding; pc+8
        let disp = ((0x8001 | 1) & !1) - (0x4000 + 0 + 8);
        assert_eq!(instruction & 0x00FF_FFFF, ((disp >> 2) as u32) & 0x00FF_FFFF);
    }

    #[test]
    fn arm_low_high16_packing() {
        let mut opts = Options::new(OutputKind::DynamicExecutable, CPU_TYPE_ARM);
        opts.base_address = 0;
        let mut state = LinkState::new();
        let target = code_atom(&mut state, 0x1234_5678, vec![0; 4]);
        // movw r1, #0 = E3001000 ; movt r1, #0 = E3401000
        let source = code_atom(&mut state, 0x4000, vec![0x00, 0x10, 0x00, 0xE3, 0x00, 0x10, 0x40, 0xE3]);
        state.atom_mut(source).fixups = vec![
            Fixup::new(
                0,
                Cluster::K1of2,
                FixupKind::SetTargetAddress,
                FixupBinding::DirectlyBound(target),
            ),
            Fixup::new(0, Cluster::K2of2, FixupKind::StoreARMLow16, FixupBinding::None),
            Fixup::new(
                4,
                Cluster::K1of2,
                FixupKind::SetTargetAddress,
                FixupBinding::DirectlyBound(target),
            ),
            Fixup::new(4, Cluster::K2of2, FixupKind::StoreARMHigh16, FixupBinding::None),
        ];
        let applier = FixupApplier::new(&opts, &state);
        let mut buffer = state.atom(source).raw_content().unwrap().to_vec();
        let mut diag = Diagnostics::default();
        applier.apply(source, &mut buffer, &mut diag).unwrap();
        let movw = u32::from_le_bytes(buffer[0..4].try_into().unwrap());
        let movt = u32::from_le_bytes(buffer[4..8].try_into().unwrap());
        // movw imm4:imm12 = 0x5678
        assert_eq!((movw >> 16) & 0xF, 0x5);
        assert_eq!(movw & 0xFFF, 0x678);
        // movt imm4:imm12 = 0x1234
        assert_eq!((movt >> 16) & 0xF, 0x1);
        assert_eq!(movt & 0xFFF, 0x234);
    }

    #[test]
    fn dtrace_call_site_becomes_nops() {
        let (opts, mut state) = fixture();
        let source = code_atom(&mut state, 0x2000, vec![0xE8, 0, 0, 0, 0]);
        state.atom_mut(source).fixups = vec![Fixup::new(
            1,
            Cluster::K1of1,
            FixupKind::StoreX86DtraceCallSiteNop,
            FixupBinding::None,
        )];
        let applier = FixupApplier::new(&opts, &state);
        let mut buffer = state.atom(source).raw_content().unwrap().to_vec();
        let mut diag = Diagnostics::default();
        applier.apply(source, &mut buffer, &mut diag).unwrap();
        assert_eq!(buffer, vec![0x90, 0x0F, 0x1F, 0x40, 0x00]);
    }
}

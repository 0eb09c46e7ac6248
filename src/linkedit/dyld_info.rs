//! Compressed dyld info: rebase, bind, lazy-bind, and weak-bind opcode
//! streams, plus the dylib ordinal map and the LEB128 encoders they share.

use std::collections::HashMap;

use crate::constants::*;
use crate::error::{Error, Result};

pub fn append_uleb128(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

pub fn append_sleb128(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        out.push(if done { byte } else { byte | 0x80 });
        if done {
            break;
        }
    }
}

/// Output segments, for turning an address into (segment index, offset)
#[derive(Debug, Default)]
pub struct SegmentMap {
    /// (name, start address, size) in layout order
    pub segments: Vec<(String, u64, u64)>,
}

impl SegmentMap {
    /// Builds the map from the final sections of a laid-out link
    pub fn from_state(state: &crate::state::LinkState) -> Self {
        let mut segments: Vec<(String, u64, u64)> = Vec::new();
        for sect in &state.sections {
            if sect.is_hidden() {
                continue;
            }
            let end = sect.address + sect.size;
            if let Some(last) = segments.last_mut() {
                if last.0 == sect.segment_name() {
                    last.2 = end - last.1;
                    continue;
                }
            }
            segments.push((sect.segment_name().to_string(), sect.address, sect.size));
        }
        SegmentMap { segments }
    }

    pub fn locate(&self, address: u64) -> Result<(u8, u64)> {
        for (i, (_, start, size)) in self.segments.iter().enumerate() {
            if *start <= address && address < start + size {
                return Ok((i as u8, address - start));
            }
        }
        Err(Error::Linkedit(format!(
            "address 0x{address:08X} not in any segment"
        )))
    }

    pub fn index_of(&self, segment: &str) -> Option<u8> {
        self.segments.iter().position(|(n, _, _)| n == segment).map(|i| i as u8)
    }
}

/// Assigns dylib ordinals 1..N in first-seen order
#[derive(Debug, Default)]
pub struct OrdinalMap {
    by_path: HashMap<String, i32>,
    next: i32,
}

impl OrdinalMap {
    pub fn new() -> Self {
        OrdinalMap { by_path: HashMap::new(), next: 1 }
    }
    pub fn ordinal_for(&mut self, install_path: &str) -> i32 {
        if let Some(&ord) = self.by_path.get(install_path) {
            return ord;
        }
        let ord = self.next;
        self.next += 1;
        self.by_path.insert(install_path.to_string(), ord);
        ord
    }
    pub fn count(&self) -> i32 {
        self.next - 1
    }
}

/// One slidable pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebaseEntry {
    pub typ: u8,
    pub address: u64,
}

/// One dyld binding
#[derive(Debug, Clone)]
pub struct BindEntry {
    pub typ: u8,
    /// positive dylib ordinal or one of the BIND_SPECIAL_DYLIB_* values
    pub ordinal: i32,
    pub symbol_name: String,
    pub weak_import: bool,
    /// BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION on strong weak-def overrides
    pub strong_override: bool,
    pub address: u64,
    pub addend: i64,
}

/// Encodes the rebase stream: runs of pointers become one opcode
pub fn encode_rebase_info(
    entries: &mut Vec<RebaseEntry>,
    segments: &SegmentMap,
    pointer_size: u64,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    if entries.is_empty() {
        return Ok(out);
    }
    entries.sort_by_key(|e| (e.typ, e.address));
    let mut cur_type = 0u8;
    let mut cur_seg = u8::MAX;
    let mut cur_offset = 0u64;
    let mut i = 0usize;
    while i < entries.len() {
        let entry = entries[i];
        if entry.typ != cur_type {
            out.push(REBASE_OPCODE_SET_TYPE_IMM | entry.typ);
            cur_type = entry.typ;
        }
        let (seg, offset) = segments.locate(entry.address)?;
        if seg != cur_seg {
            out.push(REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | seg);
            append_uleb128(&mut out, offset);
            cur_seg = seg;
        } else if offset != cur_offset {
            out.push(REBASE_OPCODE_ADD_ADDR_ULEB);
            append_uleb128(&mut out, offset - cur_offset);
        }
        // count the run of consecutive pointers of the same type
        let mut run = 1u64;
        while i + (run as usize) < entries.len() {
            let next = entries[i + run as usize];
            if next.typ != entry.typ || next.address != entry.address + run * pointer_size {
                break;
            }
            run += 1;
        }
        if run < 16 {
            out.push(REBASE_OPCODE_DO_REBASE_IMM_TIMES | run as u8);
        } else {
            out.push(REBASE_OPCODE_DO_REBASE_ULEB_TIMES);
            append_uleb128(&mut out, run);
        }
        cur_offset = offset + run * pointer_size;
        i += run as usize;
    }
    out.push(REBASE_OPCODE_DONE);
    Ok(out)
}

fn append_bind_ordinal(out: &mut Vec<u8>, ordinal: i32) {
    if ordinal <= 0 {
        // special ordinals are encoded as negative immediates
        out.push(BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | ((ordinal as u8) & BIND_IMMEDIATE_MASK));
    } else if ordinal <= 15 {
        out.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | ordinal as u8);
    } else {
        out.push(BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB);
        append_uleb128(out, ordinal as u64);
    }
}

fn append_bind_symbol(out: &mut Vec<u8>, name: &str, flags: u8) {
    out.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM | flags);
    out.extend_from_slice(name.as_bytes());
    out.push(0);
}

/// Encodes the regular bind stream, deduplicating state-setting opcodes
pub fn encode_bind_info(entries: &mut Vec<BindEntry>, segments: &SegmentMap) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    if entries.is_empty() {
        return Ok(out);
    }
    entries.sort_by(|a, b| {
        (a.ordinal, &a.symbol_name, a.address).cmp(&(b.ordinal, &b.symbol_name, b.address))
    });
    let mut cur_ordinal = i32::MIN;
    let mut cur_symbol: Option<(&str, u8)> = None;
    let mut cur_type = 0u8;
    let mut cur_addend = 0i64;
    let mut cur_seg = u8::MAX;
    let mut cur_offset = 0u64;
    for entry in entries.iter() {
        if entry.ordinal != cur_ordinal {
            append_bind_ordinal(&mut out, entry.ordinal);
            cur_ordinal = entry.ordinal;
        }
        let flags = if entry.weak_import { BIND_SYMBOL_FLAGS_WEAK_IMPORT } else { 0 };
        if cur_symbol != Some((entry.symbol_name.as_str(), flags)) {
            append_bind_symbol(&mut out, &entry.symbol_name, flags);
            cur_symbol = Some((entry.symbol_name.as_str(), flags));
        }
        if entry.typ != cur_type {
            out.push(BIND_OPCODE_SET_TYPE_IMM | entry.typ);
            cur_type = entry.typ;
        }
        if entry.addend != cur_addend {
            out.push(BIND_OPCODE_SET_ADDEND_SLEB);
            append_sleb128(&mut out, entry.addend);
            cur_addend = entry.addend;
        }
        let (seg, offset) = segments.locate(entry.address)?;
        if seg != cur_seg {
            out.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | seg);
            append_uleb128(&mut out, offset);
            cur_seg = seg;
        } else if offset != cur_offset {
            out.push(BIND_OPCODE_ADD_ADDR_ULEB);
            append_uleb128(&mut out, offset.wrapping_sub(cur_offset));
        }
        out.push(BIND_OPCODE_DO_BIND);
        cur_offset = offset + 8; // DO_BIND advances by pointer size
    }
    out.push(BIND_OPCODE_DONE);
    Ok(out)
}

/// Encodes the lazy bind stream: each entry is self-contained so dyld can
/// evaluate it on first call. Returns the stream plus the offset of each
/// entry keyed by lazy pointer address (consumed by SetLazyOffset fixups).
pub fn encode_lazy_bind_info(
    entries: &[BindEntry],
    segments: &SegmentMap,
) -> Result<(Vec<u8>, HashMap<u64, u32>)> {
    let mut out = Vec::new();
    let mut offsets = HashMap::new();
    for entry in entries {
        offsets.insert(entry.address, out.len() as u32);
        let (seg, offset) = segments.locate(entry.address)?;
        out.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | seg);
        append_uleb128(&mut out, offset);
        append_bind_ordinal(&mut out, entry.ordinal);
        let flags = if entry.weak_import { BIND_SYMBOL_FLAGS_WEAK_IMPORT } else { 0 };
        append_bind_symbol(&mut out, &entry.symbol_name, flags);
        out.push(BIND_OPCODE_DO_BIND);
        out.push(BIND_OPCODE_DONE);
    }
    Ok((out, offsets))
}

/// Encodes the weak bind stream: sorted by symbol name so dyld can merge
/// across images; strong overrides carry the non-weak-definition flag and
/// bind nothing themselves
pub fn encode_weak_bind_info(entries: &mut Vec<BindEntry>, segments: &SegmentMap) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    if entries.is_empty() {
        return Ok(out);
    }
    entries.sort_by(|a, b| a.symbol_name.cmp(&b.symbol_name).then(a.address.cmp(&b.address)));
    let mut cur_symbol: Option<(&str, u8)> = None;
    let mut cur_type = 0u8;
    let mut cur_seg = u8::MAX;
    let mut cur_offset = 0u64;
    for entry in entries.iter() {
        let flags = if entry.strong_override {
            BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION
        } else {
            0
        };
        if cur_symbol != Some((entry.symbol_name.as_str(), flags)) {
            append_bind_symbol(&mut out, &entry.symbol_name, flags);
            cur_symbol = Some((entry.symbol_name.as_str(), flags));
        }
        if entry.strong_override {
            // the symbol opcode alone tells dyld this image wins
            continue;
        }
        if entry.typ != cur_type {
            out.push(BIND_OPCODE_SET_TYPE_IMM | entry.typ);
            cur_type = entry.typ;
        }
        let (seg, offset) = segments.locate(entry.address)?;
        if seg != cur_seg {
            out.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | seg);
            append_uleb128(&mut out, offset);
            cur_seg = seg;
        } else if offset != cur_offset {
            out.push(BIND_OPCODE_ADD_ADDR_ULEB);
            append_uleb128(&mut out, offset.wrapping_sub(cur_offset));
        }
        out.push(BIND_OPCODE_DO_BIND);
        cur_offset = offset + 8;
    }
    out.push(BIND_OPCODE_DONE);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segmap() -> SegmentMap {
        SegmentMap {
            segments: vec![
                ("__TEXT".into(), 0x1000, 0x1000),
                ("__DATA".into(), 0x3000, 0x1000),
            ],
        }
    }

    #[test]
    fn uleb_sleb_encoding() {
        let mut out = Vec::new();
        append_uleb128(&mut out, 0);
        append_uleb128(&mut out, 127);
        append_uleb128(&mut out, 128);
        assert_eq!(out, vec![0x00, 0x7F, 0x80, 0x01]);
        let mut out = Vec::new();
        append_sleb128(&mut out, -1);
        assert_eq!(out, vec![0x7F]);
        let mut out = Vec::new();
        append_sleb128(&mut out, 64);
        assert_eq!(out, vec![0xC0, 0x00]);
    }

    #[test]
    fn rebase_run_compresses() {
        let segments = segmap();
        let mut entries = vec![
            RebaseEntry { typ: REBASE_TYPE_POINTER, address: 0x3000 },
            RebaseEntry { typ: REBASE_TYPE_POINTER, address: 0x3008 },
            RebaseEntry { typ: REBASE_TYPE_POINTER, address: 0x3010 },
        ];
        let stream = encode_rebase_info(&mut entries, &segments, 8).unwrap();
        assert_eq!(
            stream,
            vec![
                REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
                REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
                0x00,
                REBASE_OPCODE_DO_REBASE_IMM_TIMES | 3,
                REBASE_OPCODE_DONE,
            ]
        );
    }

    #[test]
    fn bind_stream_shape() {
        let segments = segmap();
        let mut entries = vec![BindEntry {
            typ: BIND_TYPE_POINTER,
            ordinal: 1,
            symbol_name: "_malloc".into(),
            weak_import: false,
            strong_override: false,
            address: 0x3010,
            addend: 0,
        }];
        let stream = encode_bind_info(&mut entries, &segments).unwrap();
        let mut expected = vec![BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 1];
        expected.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
        expected.extend_from_slice(b"_malloc\0");
        expected.push(BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER);
        expected.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1);
        expected.push(0x10);
        expected.push(BIND_OPCODE_DO_BIND);
        expected.push(BIND_OPCODE_DONE);
        assert_eq!(stream, expected);
    }

    #[test]
    fn lazy_bind_records_offsets() {
        let segments = segmap();
        let entries = vec![
            BindEntry {
                typ: BIND_TYPE_POINTER,
                ordinal: 1,
                symbol_name: "_puts".into(),
                weak_import: false,
                strong_override: false,
                address: 0x3000,
                addend: 0,
            },
            BindEntry {
                typ: BIND_TYPE_POINTER,
                ordinal: 2,
                symbol_name: "_printf".into(),
                weak_import: false,
                strong_override: false,
                address: 0x3008,
                addend: 0,
            },
        ];
        let (stream, offsets) = encode_lazy_bind_info(&entries, &segments).unwrap();
        assert_eq!(offsets[&0x3000], 0);
        assert!(offsets[&0x3008] > 0);
        assert_eq!(stream[offsets[&0x3008] as usize], BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1);
    }

    #[test]
    fn weak_bind_strong_override() {
        let segments = segmap();
        let mut entries = vec![BindEntry {
            typ: BIND_TYPE_OVERRIDE_OF_WEAKDEF_IN_DYLIB,
            ordinal: 0,
            symbol_name: "_foo".into(),
            weak_import: false,
            strong_override: true,
            address: 0x1000,
            addend: 0,
        }];
        let stream = encode_weak_bind_info(&mut entries, &segments).unwrap();
        let mut expected =
            vec![BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM | BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION];
        expected.extend_from_slice(b"_foo\0");
        expected.push(BIND_OPCODE_DONE);
        assert_eq!(stream, expected);
    }

    #[test]
    fn ordinal_map_first_seen_order() {
        let mut map = OrdinalMap::new();
        assert_eq!(map.ordinal_for("/usr/lib/libSystem.B.dylib"), 1);
        assert_eq!(map.ordinal_for("/usr/lib/libc++.dylib"), 2);
        assert_eq!(map.ordinal_for("/usr/lib/libSystem.B.dylib"), 1);
        assert_eq!(map.count(), 2);
    }
}

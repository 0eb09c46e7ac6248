//! The export trie: exported symbol names become a suffix-compressed prefix
//! tree whose leaves carry flags and an address (or a re-export target).
//!
//! Offsets are uleb128-encoded and self-referential, so emission iterates
//! until the offsets reach a fixpoint.

use crate::linkedit::dyld_info::append_uleb128;

/// What an exported symbol resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportKind {
    /// a regular (or weak, or thread-local) definition at an image offset
    Regular { address: u64 },
    /// re-exported from another dylib, possibly under a different name
    ReExport { ordinal: u32, import_name: String },
    /// a stub with a resolver function
    Resolver { address: u64, resolver_address: u64 },
}

#[derive(Debug, Clone)]
pub struct ExportEntry {
    pub name: String,
    /// EXPORT_SYMBOL_FLAGS_* bits
    pub flags: u64,
    pub kind: ExportKind,
}

#[derive(Default)]
struct Node {
    terminal: Option<(u64, ExportKind)>,
    /// (edge substring, child index)
    children: Vec<(String, usize)>,
    trie_offset: u64,
}

struct Trie {
    nodes: Vec<Node>,
}

impl Trie {
    fn new() -> Self {
        Trie { nodes: vec![Node::default()] }
    }

    fn insert(&mut self, name: &str, flags: u64, kind: ExportKind) {
        let mut node = 0usize;
        let mut rest = name;
        'outer: while !rest.is_empty() {
            for ci in 0..self.nodes[node].children.len() {
                let edge = self.nodes[node].children[ci].0.clone();
                let common = common_prefix_len(&edge, rest);
                if common == 0 {
                    continue;
                }
                if common == edge.len() {
                    // descend through the whole edge
                    node = self.nodes[node].children[ci].1;
                    rest = &rest[common..];
                    continue 'outer;
                }
                // split the edge at the common prefix
                let child = self.nodes[node].children[ci].1;
                let mid = self.nodes.len();
                self.nodes.push(Node::default());
                self.nodes[mid].children.push((edge[common..].to_string(), child));
                self.nodes[node].children[ci] = (edge[..common].to_string(), mid);
                node = mid;
                rest = &rest[common..];
                continue 'outer;
            }
            // no edge shares a prefix: append a leaf
            let leaf = self.nodes.len();
            self.nodes.push(Node::default());
            self.nodes[node].children.push((rest.to_string(), leaf));
            node = leaf;
            rest = "";
        }
        self.nodes[node].terminal = Some((flags, kind));
    }

    fn terminal_payload(&self, node: usize) -> Vec<u8> {
        let mut payload = Vec::new();
        let Some((flags, kind)) = &self.nodes[node].terminal else {
            return payload;
        };
        append_uleb128(&mut payload, *flags);
        match kind {
            ExportKind::Regular { address } => append_uleb128(&mut payload, *address),
            ExportKind::ReExport { ordinal, import_name } => {
                append_uleb128(&mut payload, u64::from(*ordinal));
                payload.extend_from_slice(import_name.as_bytes());
                payload.push(0);
            }
            ExportKind::Resolver { address, resolver_address } => {
                append_uleb128(&mut payload, *address);
                append_uleb128(&mut payload, *resolver_address);
            }
        }
        payload
    }

    fn node_bytes(&self, node: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let payload = self.terminal_payload(node);
        append_uleb128(&mut out, payload.len() as u64);
        out.extend_from_slice(&payload);
        out.push(self.nodes[node].children.len() as u8);
        for (edge, child) in &self.nodes[node].children {
            out.extend_from_slice(edge.as_bytes());
            out.push(0);
            append_uleb128(&mut out, self.nodes[*child].trie_offset);
        }
        out
    }

    fn encode(&mut self) -> Vec<u8> {
        // offsets shrink or grow as ulebs change width; iterate to fixpoint
        let order: Vec<usize> = (0..self.nodes.len()).collect();
        loop {
            let mut offset = 0u64;
            let mut stable = true;
            for &n in &order {
                if self.nodes[n].trie_offset != offset {
                    self.nodes[n].trie_offset = offset;
                    stable = false;
                }
                offset += self.node_bytes(n).len() as u64;
            }
            if stable {
                break;
            }
        }
        let mut out = Vec::new();
        for &n in &order {
            out.extend_from_slice(&self.node_bytes(n));
        }
        out
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

/// Builds the export trie byte stream from the export list
pub fn encode_export_trie(mut exports: Vec<ExportEntry>) -> Vec<u8> {
    if exports.is_empty() {
        return Vec::new();
    }
    // deterministic layout regardless of resolution order
    exports.sort_by(|a, b| a.name.cmp(&b.name));
    let mut trie = Trie::new();
    for export in exports {
        trie.insert(&export.name, export.flags, export.kind);
    }
    trie.encode()
}

/// Decoding helper used by the tests (and any consumer that wants to verify
/// a trie round-trips): looks up one symbol in an encoded trie
pub fn trie_lookup(trie: &[u8], symbol: &str) -> Option<(u64, u64)> {
    let mut offset = 0usize;
    let mut rest = symbol.as_bytes();
    loop {
        let (terminal_size, mut p) = read_uleb128(trie, offset)?;
        if rest.is_empty() {
            if terminal_size == 0 {
                return None;
            }
            let (flags, q) = read_uleb128(trie, p)?;
            let (address, _) = read_uleb128(trie, q)?;
            return Some((flags, address));
        }
        p += terminal_size as usize;
        let child_count = *trie.get(p)?;
        p += 1;
        let mut matched = false;
        for _ in 0..child_count {
            let edge_start = p;
            while *trie.get(p)? != 0 {
                p += 1;
            }
            let edge = &trie[edge_start..p];
            p += 1;
            let (child_offset, q) = read_uleb128(trie, p)?;
            p = q;
            if rest.starts_with(edge) {
                rest = &rest[edge.len()..];
                offset = child_offset as usize;
                matched = true;
                break;
            }
        }
        if !matched {
            return None;
        }
    }
}

fn read_uleb128(bytes: &[u8], mut offset: usize) -> Option<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(offset)?;
        offset += 1;
        result |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some((result, offset));
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::*;

    fn regular(name: &str, address: u64) -> ExportEntry {
        ExportEntry {
            name: name.into(),
            flags: EXPORT_SYMBOL_FLAGS_KIND_REGULAR,
            kind: ExportKind::Regular { address },
        }
    }

    #[test]
    fn empty_exports_empty_trie() {
        assert!(encode_export_trie(Vec::new()).is_empty());
    }

    #[test]
    fn single_symbol_roundtrips() {
        let trie = encode_export_trie(vec![regular("_main", 0x1000)]);
        assert_eq!(trie_lookup(&trie, "_main"), Some((EXPORT_SYMBOL_FLAGS_KIND_REGULAR, 0x1000)));
        assert_eq!(trie_lookup(&trie, "_mai"), None);
        assert_eq!(trie_lookup(&trie, "_mainn"), None);
    }

    #[test]
    fn shared_prefixes_split() {
        let trie = encode_export_trie(vec![
            regular("_foo", 0x100),
            regular("_foobar", 0x200),
            regular("_fork", 0x300),
            regular("_main", 0x400),
        ]);
        assert_eq!(trie_lookup(&trie, "_foo").unwrap().1, 0x100);
        assert_eq!(trie_lookup(&trie, "_foobar").unwrap().1, 0x200);
        assert_eq!(trie_lookup(&trie, "_fork").unwrap().1, 0x300);
        assert_eq!(trie_lookup(&trie, "_main").unwrap().1, 0x400);
        assert_eq!(trie_lookup(&trie, "_fo"), None);
    }

    #[test]
    fn weak_flag_survives() {
        let trie = encode_export_trie(vec![ExportEntry {
            name: "_weakling".into(),
            flags: EXPORT_SYMBOL_FLAGS_KIND_REGULAR | EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION,
            kind: ExportKind::Regular { address: 0x500 },
        }]);
        let (flags, address) = trie_lookup(&trie, "_weakling").unwrap();
        assert_eq!(flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION, EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION);
        assert_eq!(address, 0x500);
    }
}

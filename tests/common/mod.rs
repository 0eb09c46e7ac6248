//! Shared synthetic-input builders: in-memory object files, dylibs, and
//! archives implementing the parser-side traits the core consumes.
#![allow(dead_code)]

use machlink::atom::*;
use machlink::input::*;
use machlink::strpool::StringPool;

/// Surface `log` output (layout dumps, dead-strip traces) when tests run
/// with `--nocapture`
pub fn init_logging() {
    let _ = stderrlog::new().verbosity(3).init();
}

/// A parsed atom plus the name strings that get interned at handover
#[derive(Clone)]
pub struct ProtoAtom {
    pub name: Option<String>,
    pub atom: Atom,
    /// fixup index -> symbol name for ByNameUnbound bindings
    pub fixup_names: Vec<(usize, String)>,
}

impl ProtoAtom {
    pub fn realize(&self, pool: &mut StringPool) -> Atom {
        let mut atom = self.atom.clone();
        if let Some(name) = &self.name {
            atom.name = Some(pool.intern(name));
        }
        for (index, name) in &self.fixup_names {
            atom.fixups[*index].binding = FixupBinding::ByNameUnbound(pool.intern(name));
        }
        atom
    }
}

/// A global function atom in `__TEXT,__text`
pub fn func(name: &str, size: u64) -> ProtoAtom {
    let mut atom = Atom::new(
        Section::new("__TEXT", "__text", SectionType::Code),
        Definition::Regular,
        AtomContent::Bytes(vec![0; size as usize]),
    );
    atom.scope = Scope::Global;
    atom.combine = Combine::Never;
    atom.inclusion = SymbolTableInclusion::In;
    ProtoAtom { name: Some(name.to_string()), atom, fixup_names: Vec::new() }
}

/// A global data atom in `__DATA,__data`
pub fn data(name: &str, bytes: Vec<u8>) -> ProtoAtom {
    let mut atom = Atom::new(
        Section::new("__DATA", "__data", SectionType::Unclassified),
        Definition::Regular,
        AtomContent::Bytes(bytes),
    );
    atom.scope = Scope::Global;
    atom.combine = Combine::Never;
    atom.alignment = Alignment::new(3);
    atom.inclusion = SymbolTableInclusion::In;
    ProtoAtom { name: Some(name.to_string()), atom, fixup_names: Vec::new() }
}

/// A tentative definition (common block)
pub fn tentative(name: &str, size: u64, align_p2: u8) -> ProtoAtom {
    let mut atom = Atom::new(
        Section::new("__DATA", "__tent", SectionType::TentativeDefs),
        Definition::Tentative,
        AtomContent::Zeroes(size),
    );
    atom.scope = Scope::Global;
    atom.combine = Combine::ByName;
    atom.alignment = Alignment::new(align_p2);
    atom.inclusion = SymbolTableInclusion::In;
    ProtoAtom { name: Some(name.to_string()), atom, fixup_names: Vec::new() }
}

/// Adds a `call target` cluster at `offset` (x86 pc-rel branch)
pub fn add_call(proto: &mut ProtoAtom, offset: u32, target: &str) {
    let first = proto.atom.fixups.len();
    proto.atom.fixups.push(Fixup::new(
        offset,
        Cluster::K1of2,
        FixupKind::SetTargetAddress,
        FixupBinding::None,
    ));
    proto.atom.fixups.push(Fixup::new(
        offset,
        Cluster::K2of2,
        FixupKind::StoreX86BranchPCRel32,
        FixupBinding::None,
    ));
    proto.fixup_names.push((first, target.to_string()));
}

/// Adds a 64-bit pointer-to-target cluster at `offset`
pub fn add_pointer(proto: &mut ProtoAtom, offset: u32, target: &str) {
    let first = proto.atom.fixups.len();
    proto.atom.fixups.push(Fixup::new(
        offset,
        Cluster::K1of2,
        FixupKind::SetTargetAddress,
        FixupBinding::None,
    ));
    proto.atom.fixups.push(Fixup::new(
        offset,
        Cluster::K2of2,
        FixupKind::StoreLittleEndian64,
        FixupBinding::None,
    ));
    proto.fixup_names.push((first, target.to_string()));
}

pub struct TestObject {
    pub path: String,
    pub ordinal: Ordinal,
    pub protos: Vec<ProtoAtom>,
}

impl TestObject {
    pub fn new(path: &str, argv_index: u16, protos: Vec<ProtoAtom>) -> Self {
        TestObject {
            path: path.to_string(),
            ordinal: Ordinal::from_arg_list(argv_index),
            protos,
        }
    }
}

impl File for TestObject {
    fn path(&self) -> &str {
        &self.path
    }
    fn ordinal(&self) -> Ordinal {
        self.ordinal
    }
    fn kind(&self) -> FileKind {
        FileKind::Relocatable
    }
    fn atoms(&self, pool: &mut StringPool) -> Vec<Atom> {
        self.protos.iter().map(|p| p.realize(pool)).collect()
    }
}

pub struct TestDylib {
    pub install_path: String,
    pub ordinal: Ordinal,
    /// (symbol, is weak definition)
    pub exports: Vec<(String, bool)>,
}

impl TestDylib {
    pub fn new(install_path: &str, argv_index: u16, exports: &[(&str, bool)]) -> Self {
        TestDylib {
            install_path: install_path.to_string(),
            ordinal: Ordinal::from_arg_list(argv_index),
            exports: exports.iter().map(|(n, w)| (n.to_string(), *w)).collect(),
        }
    }
}

impl File for TestDylib {
    fn path(&self) -> &str {
        &self.install_path
    }
    fn ordinal(&self) -> Ordinal {
        self.ordinal
    }
    fn kind(&self) -> FileKind {
        FileKind::Dylib
    }
    fn atoms(&self, _pool: &mut StringPool) -> Vec<Atom> {
        Vec::new()
    }
}

impl DylibFile for TestDylib {
    fn install_path(&self) -> &str {
        &self.install_path
    }
    fn has_weak_definition(&self, name: &str) -> bool {
        self.exports.iter().any(|(n, weak)| *weak && n == name)
    }
    fn has_weak_externals(&self) -> bool {
        self.exports.iter().any(|(_, weak)| *weak)
    }
    fn has_definition(&self, name: &str) -> bool {
        self.exports.iter().any(|(n, _)| n == name)
    }
}

pub struct TestMember {
    pub member_name: String,
    pub data_only: bool,
    pub protos: Vec<ProtoAtom>,
    pub loaded: bool,
}

pub struct TestArchive {
    pub path: String,
    pub ordinal: Ordinal,
    pub members: Vec<TestMember>,
}

impl TestArchive {
    pub fn new(path: &str, argv_index: u16) -> Self {
        TestArchive {
            path: path.to_string(),
            ordinal: Ordinal::from_arg_list(argv_index),
            members: Vec::new(),
        }
    }
    pub fn member(mut self, member_name: &str, data_only: bool, protos: Vec<ProtoAtom>) -> Self {
        self.members.push(TestMember {
            member_name: member_name.to_string(),
            data_only,
            protos,
            loaded: false,
        });
        self
    }
}

/// The whole input set: objects are initial files; dylibs and archives are
/// searched on demand
pub struct TestInputs {
    pub objects: Vec<TestObject>,
    pub dylib_files: Vec<TestDylib>,
    pub archives: Vec<TestArchive>,
    next_member_file_index: u32,
}

impl TestInputs {
    pub fn new(objects: Vec<TestObject>) -> Self {
        TestInputs {
            objects,
            dylib_files: Vec::new(),
            archives: Vec::new(),
            next_member_file_index: 0,
        }
    }
    pub fn with_dylib(mut self, dylib: TestDylib) -> Self {
        self.dylib_files.push(dylib);
        self
    }
    pub fn with_archive(mut self, archive: TestArchive) -> Self {
        self.archives.push(archive);
        self
    }
    fn dylib_file_index(&self, dylib_pos: usize) -> u32 {
        (self.objects.len() + dylib_pos) as u32
    }
}

impl InputSet for TestInputs {
    fn initial_files(&self) -> Vec<&dyn File> {
        self.objects.iter().map(|o| o as &dyn File).collect()
    }

    fn dylibs(&self) -> Vec<(u32, &dyn DylibFile)> {
        self.dylib_files
            .iter()
            .enumerate()
            .map(|(i, d)| (self.dylib_file_index(i), d as &dyn DylibFile))
            .collect()
    }

    fn search_libraries(
        &mut self,
        name: &str,
        pool: &mut StringPool,
        search_dylibs: bool,
        search_archives: bool,
        data_symbol_only: bool,
    ) -> machlink::Result<Option<SearchHit>> {
        if search_dylibs {
            for (i, dylib) in self.dylib_files.iter().enumerate() {
                if let Some((_, weak)) = dylib.exports.iter().find(|(n, _)| n == name) {
                    let mut proxy = Atom::new(
                        Section::hidden("__TEXT", "__import", SectionType::ImportProxies),
                        Definition::Proxy,
                        AtomContent::Zeroes(0),
                    );
                    proxy.name = Some(pool.intern(name));
                    proxy.scope = Scope::Global;
                    proxy.combine = if *weak { Combine::ByName } else { Combine::Never };
                    proxy.inclusion = SymbolTableInclusion::In;
                    return Ok(Some(SearchHit {
                        atoms: vec![proxy],
                        ordinal: dylib.ordinal,
                        file_index: self.dylib_file_index(i),
                        path: dylib.install_path.clone(),
                        from_archive: false,
                    }));
                }
            }
        }
        if search_archives {
            let base = (self.objects.len() + self.dylib_files.len()) as u32;
            for archive in self.archives.iter_mut() {
                for (m, member) in archive.members.iter_mut().enumerate() {
                    if member.loaded {
                        continue;
                    }
                    if data_symbol_only && !member.data_only {
                        continue;
                    }
                    let defines = member
                        .protos
                        .iter()
                        .any(|p| p.name.as_deref() == Some(name));
                    if !defines {
                        continue;
                    }
                    member.loaded = true;
                    self.next_member_file_index += 1;
                    let file_index = base + self.next_member_file_index;
                    return Ok(Some(SearchHit {
                        atoms: member.protos.iter().map(|p| p.realize(pool)).collect(),
                        ordinal: archive.ordinal.archive_member(m as u16 + 1),
                        file_index,
                        path: format!("{}({})", archive.path, member.member_name),
                        from_archive: true,
                    }));
                }
            }
        }
        Ok(None)
    }
}

//! Minimal in-memory PE32+ image builder for parser tests
//!
//! Assembles just enough of a valid image for pelite to parse: DOS/NT
//! headers, one `.rdata` section, and optional export, import, delay-load
//! and resource directories. Function addresses point at dummy RVAs; the
//! fixture is never executed.

const SECTION_RVA: u32 = 0x1000;
const SECTION_FILE_OFFSET: u32 = 0x400;

fn rva(section_offset: u32) -> u32 {
    SECTION_RVA + section_offset
}

fn align4(x: u32) -> u32 {
    (x + 3) & !3
}

fn align8(x: u32) -> u32 {
    (x + 7) & !7
}

enum ExportSpec {
    Named(String),
    OrdinalOnly,
    Forward { name: String, target: String },
}

enum ImportSpec {
    Name(String),
    Ordinal(u16),
}

struct DelayImportSpec {
    dll: String,
    imports: Vec<ImportSpec>,
    rva_based: bool,
}

pub(crate) struct TestImage {
    machine: u16,
    image_base: u64,
    exports: Vec<ExportSpec>,
    imports: Vec<(String, Vec<ImportSpec>)>,
    delay_imports: Vec<DelayImportSpec>,
    manifest: Option<Vec<u8>>,
}

impl TestImage {
    pub(crate) fn new() -> Self {
        Self {
            machine: 0x8664,
            image_base: 0x1_8000_0000,
            exports: Vec::new(),
            imports: Vec::new(),
            delay_imports: Vec::new(),
            manifest: None,
        }
    }

    pub(crate) fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub(crate) fn image_base(mut self, base: u64) -> Self {
        self.image_base = base;
        self
    }

    pub(crate) fn export(mut self, name: &str) -> Self {
        self.exports.push(ExportSpec::Named(name.to_owned()));
        self
    }

    pub(crate) fn export_by_ordinal(mut self) -> Self {
        self.exports.push(ExportSpec::OrdinalOnly);
        self
    }

    pub(crate) fn forwarded_export(mut self, name: &str, target: &str) -> Self {
        self.exports.push(ExportSpec::Forward {
            name: name.to_owned(),
            target: target.to_owned(),
        });
        self
    }

    pub(crate) fn import_dll(mut self, dll: &str, names: &[&str]) -> Self {
        self.imports.push((
            dll.to_owned(),
            names
                .iter()
                .map(|n| ImportSpec::Name((*n).to_owned()))
                .collect(),
        ));
        self
    }

    pub(crate) fn import_dll_by_ordinal(mut self, dll: &str, ordinal: u16) -> Self {
        self.imports
            .push((dll.to_owned(), vec![ImportSpec::Ordinal(ordinal)]));
        self
    }

    pub(crate) fn delay_import_dll(mut self, dll: &str, names: &[&str]) -> Self {
        self.delay_imports.push(DelayImportSpec {
            dll: dll.to_owned(),
            imports: names
                .iter()
                .map(|n| ImportSpec::Name((*n).to_owned()))
                .collect(),
            rva_based: true,
        });
        self
    }

    /// Delay-load descriptor with Attributes bit 0 clear: every pointer field
    /// and every by-name thunk holds a virtual address instead of an RVA
    pub(crate) fn legacy_delay_import_dll(mut self, dll: &str, names: &[&str]) -> Self {
        self.delay_imports.push(DelayImportSpec {
            dll: dll.to_owned(),
            imports: names
                .iter()
                .map(|n| ImportSpec::Name((*n).to_owned()))
                .collect(),
            rva_based: false,
        });
        self
    }

    pub(crate) fn manifest(mut self, bytes: &[u8]) -> Self {
        self.manifest = Some(bytes.to_vec());
        self
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let mut w = SectionWriter::new();
        let mut dirs = [(0u32, 0u32); 16];
        write_exports(&mut w, &self.exports, &mut dirs);
        write_imports(&mut w, &self.imports, &mut dirs);
        write_delay_imports(&mut w, &self.delay_imports, self.image_base, &mut dirs);
        if let Some(manifest) = &self.manifest {
            write_resources(&mut w, manifest, &mut dirs);
        }
        assemble_file(self.machine, self.image_base, &w.data, &dirs)
    }
}

struct SectionWriter {
    data: Vec<u8>,
}

impl SectionWriter {
    fn new() -> Self {
        // a small reserved prologue so the section is never empty
        Self { data: vec![0; 16] }
    }

    fn pos(&self) -> u32 {
        self.data.len() as u32
    }

    fn align(&mut self, alignment: usize) {
        while self.data.len() % alignment != 0 {
            self.data.push(0);
        }
    }

    fn u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.data.extend_from_slice(v);
    }
}

fn intern(pool: &mut Vec<u8>, s: &str) -> u32 {
    let off = pool.len() as u32;
    pool.extend_from_slice(s.as_bytes());
    pool.push(0);
    off
}

/// u16 hint followed by the symbol name
fn intern_hint_name(pool: &mut Vec<u8>, s: &str) -> u32 {
    if pool.len() % 2 == 1 {
        pool.push(0);
    }
    let off = pool.len() as u32;
    pool.push(0);
    pool.push(0);
    pool.extend_from_slice(s.as_bytes());
    pool.push(0);
    off
}

fn write_exports(w: &mut SectionWriter, exports: &[ExportSpec], dirs: &mut [(u32, u32); 16]) {
    if exports.is_empty() {
        return;
    }
    w.align(8);
    let n = exports.len() as u32;
    let n_named = exports
        .iter()
        .filter(|e| !matches!(e, ExportSpec::OrdinalOnly))
        .count() as u32;

    let dir_off = w.pos();
    let functions_off = dir_off + 40;
    let names_off = functions_off + 4 * n;
    let ordinals_off = names_off + 4 * n_named;
    let strings_off = align4(ordinals_off + 2 * n_named);

    let mut pool = Vec::new();
    let dll_name_rel = intern(&mut pool, "fixture.dll");
    let mut name_rels: Vec<(u32, u32)> = Vec::new(); // (function index, pool offset)
    let mut func_rvas = Vec::new();
    for (i, e) in exports.iter().enumerate() {
        match e {
            ExportSpec::Named(name) => {
                name_rels.push((i as u32, intern(&mut pool, name)));
                func_rvas.push(0x9000 + 0x10 * i as u32);
            }
            ExportSpec::OrdinalOnly => func_rvas.push(0x9000 + 0x10 * i as u32),
            ExportSpec::Forward { name, target } => {
                name_rels.push((i as u32, intern(&mut pool, name)));
                // forwarder: the function RVA points back into the export
                // data directory, at the "Module.Function" string
                func_rvas.push(rva(strings_off + intern(&mut pool, target)));
            }
        }
    }
    let block_len = strings_off + pool.len() as u32 - dir_off;

    // IMAGE_EXPORT_DIRECTORY
    w.u32(0);
    w.u32(0);
    w.u16(0);
    w.u16(0);
    w.u32(rva(strings_off + dll_name_rel));
    w.u32(1); // ordinal base
    w.u32(n);
    w.u32(n_named);
    w.u32(rva(functions_off));
    w.u32(rva(names_off));
    w.u32(rva(ordinals_off));

    for f in &func_rvas {
        w.u32(*f);
    }
    for (_, rel) in &name_rels {
        w.u32(rva(strings_off + rel));
    }
    for (index, _) in &name_rels {
        w.u16(*index as u16);
    }
    w.align(4);
    debug_assert_eq!(w.pos(), strings_off);
    w.bytes(&pool);

    dirs[0] = (rva(dir_off), block_len);
}

fn write_imports(
    w: &mut SectionWriter,
    dlls: &[(String, Vec<ImportSpec>)],
    dirs: &mut [(u32, u32); 16],
) {
    if dlls.is_empty() {
        return;
    }
    w.align(8);
    let desc_off = w.pos();
    let ndll = dlls.len() as u32;

    let mut off = desc_off + 20 * (ndll + 1);
    let mut int_offs = Vec::new();
    let mut iat_offs = Vec::new();
    for (_, specs) in dlls {
        off = align8(off);
        int_offs.push(off);
        off += 8 * (specs.len() as u32 + 1);
        iat_offs.push(off);
        off += 8 * (specs.len() as u32 + 1);
    }
    let strings_off = align4(off);

    let mut pool = Vec::new();
    let mut dll_name_rels = Vec::new();
    let mut thunks_per_dll: Vec<Vec<u64>> = Vec::new();
    for (dll, specs) in dlls {
        dll_name_rels.push(intern(&mut pool, dll));
        let thunks = specs
            .iter()
            .map(|s| match s {
                ImportSpec::Name(name) => {
                    rva(strings_off + intern_hint_name(&mut pool, name)) as u64
                }
                ImportSpec::Ordinal(ord) => 0x8000_0000_0000_0000u64 | *ord as u64,
            })
            .collect();
        thunks_per_dll.push(thunks);
    }

    // IMAGE_IMPORT_DESCRIPTOR table plus null terminator
    for i in 0..dlls.len() {
        w.u32(rva(int_offs[i]));
        w.u32(0);
        w.u32(0);
        w.u32(rva(strings_off + dll_name_rels[i]));
        w.u32(rva(iat_offs[i]));
    }
    w.bytes(&[0; 20]);

    for (i, thunks) in thunks_per_dll.iter().enumerate() {
        w.align(8);
        debug_assert_eq!(w.pos(), int_offs[i]);
        for t in thunks {
            w.u64(*t);
        }
        w.u64(0);
        debug_assert_eq!(w.pos(), iat_offs[i]);
        for t in thunks {
            w.u64(*t);
        }
        w.u64(0);
    }
    w.align(4);
    debug_assert_eq!(w.pos(), strings_off);
    w.bytes(&pool);

    dirs[1] = (rva(desc_off), 20 * (ndll + 1));
}

fn write_delay_imports(
    w: &mut SectionWriter,
    dlls: &[DelayImportSpec],
    image_base: u64,
    dirs: &mut [(u32, u32); 16],
) {
    if dlls.is_empty() {
        return;
    }
    // legacy descriptor fields are 32-bit virtual addresses; the fixture
    // image base has to fit them
    debug_assert!(dlls.iter().all(|d| d.rva_based) || image_base < 1u64 << 32);
    w.align(8);
    let desc_off = w.pos();
    let ndll = dlls.len() as u32;

    let mut off = desc_off + 32 * (ndll + 1);
    off = align8(off);
    let handles_off = off;
    off += 8 * ndll;
    let mut int_offs = Vec::new();
    for d in dlls {
        off = align8(off);
        int_offs.push(off);
        off += 8 * (d.imports.len() as u32 + 1);
    }
    let strings_off = align4(off);

    let mut pool = Vec::new();
    let mut dll_name_rels = Vec::new();
    let mut thunks_per_dll: Vec<Vec<u64>> = Vec::new();
    for d in dlls {
        dll_name_rels.push(intern(&mut pool, &d.dll));
        let thunks = d
            .imports
            .iter()
            .map(|s| match s {
                ImportSpec::Name(name) => {
                    let name_rva = rva(strings_off + intern_hint_name(&mut pool, name)) as u64;
                    if d.rva_based {
                        name_rva
                    } else {
                        image_base + name_rva
                    }
                }
                ImportSpec::Ordinal(ord) => 0x8000_0000_0000_0000u64 | *ord as u64,
            })
            .collect();
        thunks_per_dll.push(thunks);
    }

    // IMAGE_DELAYLOAD_DESCRIPTOR table plus null terminator
    for (i, d) in dlls.iter().enumerate() {
        let field = |r: u32| {
            if d.rva_based {
                r
            } else {
                (image_base as u32).wrapping_add(r)
            }
        };
        w.u32(d.rva_based as u32);
        w.u32(field(rva(strings_off + dll_name_rels[i])));
        w.u32(field(rva(handles_off + 8 * i as u32)));
        w.u32(field(rva(int_offs[i]))); // IAT, unused by the fixture
        w.u32(field(rva(int_offs[i])));
        w.u32(0);
        w.u32(0);
        w.u32(0);
    }
    w.bytes(&[0; 32]);

    w.align(8);
    debug_assert_eq!(w.pos(), handles_off);
    for _ in 0..ndll {
        w.u64(0);
    }
    for (i, thunks) in thunks_per_dll.iter().enumerate() {
        w.align(8);
        debug_assert_eq!(w.pos(), int_offs[i]);
        for t in thunks {
            w.u64(*t);
        }
        w.u64(0);
    }
    w.align(4);
    debug_assert_eq!(w.pos(), strings_off);
    w.bytes(&pool);

    dirs[13] = (rva(desc_off), 32 * (ndll + 1));
}

fn write_resources(w: &mut SectionWriter, manifest: &[u8], dirs: &mut [(u32, u32); 16]) {
    w.align(8);
    let block_off = w.pos();

    let dir_header = |w: &mut SectionWriter| {
        w.u32(0);
        w.u32(0);
        w.u16(0);
        w.u16(0);
        w.u16(0);
        w.u16(1); // one ID entry
    };

    // root -> type 24 (RT_MANIFEST) -> name 1 -> language 1033 -> data
    dir_header(w);
    w.u32(24);
    w.u32(0x8000_0000 | 24);
    dir_header(w);
    w.u32(1);
    w.u32(0x8000_0000 | 48);
    dir_header(w);
    w.u32(1033);
    w.u32(72);
    // IMAGE_RESOURCE_DATA_ENTRY
    w.u32(rva(block_off + 88));
    w.u32(manifest.len() as u32);
    w.u32(0);
    w.u32(0);
    debug_assert_eq!(w.pos(), block_off + 88);
    w.bytes(manifest);

    dirs[2] = (rva(block_off), 88 + manifest.len() as u32);
}

fn assemble_file(machine: u16, image_base: u64, section: &[u8], dirs: &[(u32, u32); 16]) -> Vec<u8> {
    let vsize = section.len() as u32;
    let raw_size = (vsize + 0x1ff) & !0x1ff;

    let mut f: Vec<u8> = Vec::with_capacity((SECTION_FILE_OFFSET + raw_size) as usize);
    let p16 = |f: &mut Vec<u8>, v: u16| f.extend_from_slice(&v.to_le_bytes());
    let p32 = |f: &mut Vec<u8>, v: u32| f.extend_from_slice(&v.to_le_bytes());
    let p64 = |f: &mut Vec<u8>, v: u64| f.extend_from_slice(&v.to_le_bytes());

    // DOS header, e_lfanew at 0x3c
    f.extend_from_slice(b"MZ");
    f.resize(0x3c, 0);
    p32(&mut f, 0x80);
    f.resize(0x80, 0);

    // COFF header
    f.extend_from_slice(b"PE\0\0");
    p16(&mut f, machine);
    p16(&mut f, 1); // one section
    p32(&mut f, 0);
    p32(&mut f, 0);
    p32(&mut f, 0);
    p16(&mut f, 240); // size of optional header (PE32+)
    p16(&mut f, 0x2022); // EXECUTABLE_IMAGE | LARGE_ADDRESS_AWARE | DLL

    // optional header
    p16(&mut f, 0x20b);
    f.push(14);
    f.push(0);
    p32(&mut f, 0); // SizeOfCode
    p32(&mut f, raw_size); // SizeOfInitializedData
    p32(&mut f, 0);
    p32(&mut f, 0); // AddressOfEntryPoint
    p32(&mut f, SECTION_RVA); // BaseOfCode
    p64(&mut f, image_base); // ImageBase
    p32(&mut f, 0x1000); // SectionAlignment
    p32(&mut f, 0x200); // FileAlignment
    p16(&mut f, 6);
    p16(&mut f, 0);
    p16(&mut f, 0);
    p16(&mut f, 0);
    p16(&mut f, 6);
    p16(&mut f, 0);
    p32(&mut f, 0); // Win32VersionValue
    p32(&mut f, 0x10000); // SizeOfImage
    p32(&mut f, SECTION_FILE_OFFSET); // SizeOfHeaders
    p32(&mut f, 0); // CheckSum
    p16(&mut f, 3); // Subsystem: console
    p16(&mut f, 0x160); // DllCharacteristics
    p64(&mut f, 0x10_0000);
    p64(&mut f, 0x1000);
    p64(&mut f, 0x10_0000);
    p64(&mut f, 0x1000);
    p32(&mut f, 0); // LoaderFlags
    p32(&mut f, 16); // NumberOfRvaAndSizes
    for (va, size) in dirs {
        p32(&mut f, *va);
        p32(&mut f, *size);
    }

    // section header
    f.extend_from_slice(b".rdata\0\0");
    p32(&mut f, vsize);
    p32(&mut f, SECTION_RVA);
    p32(&mut f, raw_size);
    p32(&mut f, SECTION_FILE_OFFSET);
    p32(&mut f, 0);
    p32(&mut f, 0);
    p16(&mut f, 0);
    p16(&mut f, 0);
    p32(&mut f, 0x4000_0040); // INITIALIZED_DATA | READ

    f.resize(SECTION_FILE_OFFSET as usize, 0);
    f.extend_from_slice(section);
    f.resize((SECTION_FILE_OFFSET + raw_size) as usize, 0);
    f
}

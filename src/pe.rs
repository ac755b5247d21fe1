//! Structural PE/COFF access through the pelite library
//!
//! Everything is decoded eagerly into plain data at load time: exports (with
//! forwarder strings), ordinary and delay-load imports, the section table and
//! the embedded manifest resource. No relocation, no execution.

use crate::common::{path_to_string, LookupError};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const DIR_EXPORT: usize = 0;
const DIR_DELAY_IMPORT: usize = 13;

/// COFF machine types the resolution engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MachineType {
    I386,
    Amd64,
    ArmNt,
    Arm64,
}

impl MachineType {
    fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0x014c => Some(Self::I386),
            0x01c4 => Some(Self::ArmNt),
            0x8664 => Some(Self::Amd64),
            0xaa64 => Some(Self::Arm64),
            _ => None,
        }
    }

    pub fn is_64bit(&self) -> bool {
        matches!(self, Self::Amd64 | Self::Arm64)
    }
}

/// One row of the section table
#[derive(Debug, Clone, Serialize)]
pub struct SectionInfo {
    pub name: String,
    pub virtual_address: u32,
    pub virtual_size: u32,
    pub raw_size: u32,
    pub characteristics: u32,
}

/// One entry of the export directory
///
/// Exactly one of `virtual_address` and `forwarded_name` is present: a
/// forwarded export carries its "Module.Function" target instead of an
/// address inside the image.
#[derive(Debug, Clone, Serialize)]
pub struct PeExport {
    pub ordinal: u32,
    pub name: Option<String>,
    pub virtual_address: Option<u32>,
    pub forwarded_name: Option<String>,
}

/// What an import table entry refers to inside the exporting module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ImportTarget {
    Name(String),
    Ordinal(u16),
}

#[derive(Debug, Clone, Serialize)]
pub struct PeImport {
    pub target: ImportTarget,
    pub delay_load: bool,
}

/// Imports grouped by owning module, in first-occurrence directory order
#[derive(Debug, Clone, Serialize)]
pub struct PeImportDll {
    pub name: String,
    pub imports: Vec<PeImport>,
}

/// Parsed, immutable view of one PE binary
#[derive(Debug, Clone, Serialize)]
pub struct PeImage {
    path: PathBuf,
    machine: MachineType,
    internal_name: Option<String>,
    sections: Vec<SectionInfo>,
    exports: Vec<PeExport>,
    imports: Vec<PeImportDll>,
    #[serde(skip)]
    manifest: Vec<u8>,
}

struct ParsedImage {
    machine: u16,
    internal_name: Option<String>,
    sections: Vec<SectionInfo>,
    exports: Vec<PeExport>,
    imports: Vec<(String, Vec<PeImport>)>,
    delay_imports: Vec<(String, Vec<PeImport>)>,
    manifest: Vec<u8>,
}

/// IMAGE_DELAYLOAD_DESCRIPTOR; pelite does not model the delay-load directory
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct DelayLoadDescriptor {
    attributes: u32,
    dll_name_rva: u32,
    module_handle_rva: u32,
    import_address_table_rva: u32,
    import_name_table_rva: u32,
    bound_import_table_rva: u32,
    unload_information_table_rva: u32,
    time_date_stamp: u32,
}

unsafe impl dataview::Pod for DelayLoadDescriptor {}

/// IMAGE_EXPORT_DIRECTORY, decoded manually to reach the raw function,
/// name and ordinal tables
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ExportDirectory {
    characteristics: u32,
    time_date_stamp: u32,
    major_version: u16,
    minor_version: u16,
    name_rva: u32,
    ordinal_base: u32,
    number_of_functions: u32,
    number_of_names: u32,
    functions_rva: u32,
    names_rva: u32,
    name_ordinals_rva: u32,
}

unsafe impl dataview::Pod for ExportDirectory {}

macro_rules! pe_parser {
    ($mod_name:ident, $pe_mod:ident, $thunk:ty, $ordinal_flag:expr) => {
        mod $mod_name {
            use super::{
                DelayLoadDescriptor, ExportDirectory, ImportTarget, ParsedImage, PeExport,
                PeImport, SectionInfo, DIR_DELAY_IMPORT, DIR_EXPORT,
            };
            use crate::common::LookupError;
            use pelite::$pe_mod::imports::Import;
            use pelite::$pe_mod::{Pe, PeFile};
            use std::collections::HashMap;

            fn bad_string() -> LookupError {
                LookupError::ScanError("non-UTF-8 string in a PE directory".to_owned())
            }

            pub(super) fn parse(pe: PeFile<'_>) -> Result<ParsedImage, LookupError> {
                Ok(ParsedImage {
                    machine: pe.file_header().Machine,
                    internal_name: internal_name(pe),
                    sections: sections(pe),
                    exports: exports(pe)?,
                    imports: imports(pe)?,
                    delay_imports: delay_imports(pe)?,
                    manifest: manifest(pe),
                })
            }

            /// DLL name recorded in the export directory, if any
            fn internal_name(pe: PeFile<'_>) -> Option<String> {
                pe.exports()
                    .ok()
                    .and_then(|e| e.dll_name().ok())
                    .and_then(|n| n.to_str().ok())
                    .map(str::to_owned)
            }

            fn sections(pe: PeFile<'_>) -> Vec<SectionInfo> {
                pe.section_headers()
                    .iter()
                    .map(|sh| SectionInfo {
                        name: String::from_utf8_lossy(&sh.Name)
                            .trim_end_matches('\0')
                            .to_string(),
                        virtual_address: sh.VirtualAddress,
                        virtual_size: sh.VirtualSize,
                        raw_size: sh.SizeOfRawData,
                        characteristics: sh.Characteristics,
                    })
                    .collect()
            }

            fn exports(pe: PeFile<'_>) -> Result<Vec<PeExport>, LookupError> {
                // no export directory, e.g. in case of an executable
                let dd = match pe.data_directory().get(DIR_EXPORT) {
                    Some(dd) if dd.VirtualAddress != 0 && dd.Size != 0 => *dd,
                    _ => return Ok(Vec::new()),
                };
                let dir: &ExportDirectory = pe.derva(dd.VirtualAddress)?;

                let functions: &[u32] = if dir.number_of_functions != 0 {
                    pe.derva_slice(dir.functions_rva, dir.number_of_functions as usize)?
                } else {
                    &[]
                };
                let (names, ordinals): (&[u32], &[u16]) = if dir.number_of_names != 0 {
                    (
                        pe.derva_slice(dir.names_rva, dir.number_of_names as usize)?,
                        pe.derva_slice(dir.name_ordinals_rva, dir.number_of_names as usize)?,
                    )
                } else {
                    (&[], &[])
                };

                // a function RVA pointing back into the export data directory
                // is a forwarder string, not code
                let (fwd_start, fwd_end) =
                    (dd.VirtualAddress, dd.VirtualAddress.wrapping_add(dd.Size));

                let mut names_by_index: HashMap<usize, String> = HashMap::new();
                for (&name_rva, &index) in names.iter().zip(ordinals) {
                    if let Some(name) = pe
                        .derva_c_str(name_rva)
                        .ok()
                        .and_then(|s| s.to_str().ok())
                    {
                        names_by_index.insert(index as usize, name.to_owned());
                    }
                }

                let base = dir.ordinal_base;
                let mut out = Vec::new();
                for (index, &func_rva) in functions.iter().enumerate() {
                    if func_rva == 0 {
                        // unused ordinal slot
                        continue;
                    }
                    let ordinal = base + index as u32;
                    let name = names_by_index.get(&index).cloned();
                    if func_rva >= fwd_start && func_rva < fwd_end {
                        let forwarded_name = pe
                            .derva_c_str(func_rva)
                            .ok()
                            .and_then(|s| s.to_str().ok())
                            .map(str::to_owned);
                        out.push(PeExport {
                            ordinal,
                            name,
                            virtual_address: None,
                            forwarded_name,
                        });
                    } else {
                        out.push(PeExport {
                            ordinal,
                            name,
                            virtual_address: Some(func_rva),
                            forwarded_name: None,
                        });
                    }
                }
                Ok(out)
            }

            fn imports(pe: PeFile<'_>) -> Result<Vec<(String, Vec<PeImport>)>, LookupError> {
                let imports = match pe.imports() {
                    Ok(imports) => imports,
                    Err(pelite::Error::Null) => return Ok(Vec::new()),
                    Err(e) => return Err(LookupError::PEError(e)),
                };
                let mut out = Vec::new();
                for desc in imports.iter() {
                    let dll_name = desc
                        .dll_name()?
                        .to_str()
                        .map_err(|_| bad_string())?
                        .to_owned();
                    let mut entries = Vec::new();
                    for imp in desc.int()? {
                        match imp? {
                            Import::ByName { hint: _, name } => entries.push(PeImport {
                                target: ImportTarget::Name(
                                    name.to_str().map_err(|_| bad_string())?.to_owned(),
                                ),
                                delay_load: false,
                            }),
                            Import::ByOrdinal { ord } => entries.push(PeImport {
                                target: ImportTarget::Ordinal(ord),
                                delay_load: false,
                            }),
                        }
                    }
                    out.push((dll_name, entries));
                }
                Ok(out)
            }

            fn delay_imports(
                pe: PeFile<'_>,
            ) -> Result<Vec<(String, Vec<PeImport>)>, LookupError> {
                let dd = match pe.data_directory().get(DIR_DELAY_IMPORT) {
                    Some(dd) if dd.VirtualAddress != 0 && dd.Size != 0 => *dd,
                    _ => return Ok(Vec::new()),
                };
                let image_base = pe.optional_header().ImageBase as u64;
                // descriptor fields are RVAs when bit 0 of Attributes is set;
                // legacy images store virtual addresses instead
                let rebase = |field: u32, rva_based: bool| -> u32 {
                    if rva_based || field == 0 {
                        field
                    } else {
                        (field as u64).wrapping_sub(image_base) as u32
                    }
                };

                let mut out = Vec::new();
                let mut desc_rva = dd.VirtualAddress;
                loop {
                    let desc: &DelayLoadDescriptor = pe.derva(desc_rva)?;
                    if desc.dll_name_rva == 0 {
                        break;
                    }
                    let rva_based = desc.attributes & 1 != 0;
                    let dll_name = pe
                        .derva_c_str(rebase(desc.dll_name_rva, rva_based))?
                        .to_str()
                        .map_err(|_| bad_string())?
                        .to_owned();

                    let mut entries = Vec::new();
                    let mut thunk_rva = rebase(desc.import_name_table_rva, rva_based);
                    if thunk_rva != 0 {
                        loop {
                            let thunk: $thunk = *pe.derva::<$thunk>(thunk_rva)?;
                            if thunk == 0 {
                                break;
                            }
                            if thunk & $ordinal_flag != 0 {
                                entries.push(PeImport {
                                    target: ImportTarget::Ordinal(thunk as u16),
                                    delay_load: true,
                                });
                            } else {
                                // IMAGE_IMPORT_BY_NAME: u16 hint, then the name;
                                // legacy thunks hold virtual addresses too
                                let name_rva = if rva_based {
                                    (thunk as u32) & 0x7fff_ffff
                                } else {
                                    (thunk as u64).wrapping_sub(image_base) as u32
                                };
                                let name = pe
                                    .derva_c_str(name_rva + 2)?
                                    .to_str()
                                    .map_err(|_| bad_string())?
                                    .to_owned();
                                entries.push(PeImport {
                                    target: ImportTarget::Name(name),
                                    delay_load: true,
                                });
                            }
                            thunk_rva += std::mem::size_of::<$thunk>() as u32;
                        }
                    }
                    out.push((dll_name, entries));
                    desc_rva += std::mem::size_of::<DelayLoadDescriptor>() as u32;
                }
                Ok(out)
            }

            fn manifest(pe: PeFile<'_>) -> Vec<u8> {
                match pe.resources() {
                    Ok(resources) => resources
                        .manifest()
                        .map(|text| text.as_bytes().to_vec())
                        .unwrap_or_default(),
                    Err(_) => Vec::new(),
                }
            }
        }
    };
}

pe_parser!(parse32, pe32, u32, 0x8000_0000u32);
pe_parser!(parse64, pe64, u64, 0x8000_0000_0000_0000u64);

impl PeImage {
    /// Parse the binary at the given path
    ///
    /// Fails with [`LookupError::InvalidImage`] when the file is not a
    /// well-formed PE/COFF image or declares a machine type the engine does
    /// not support.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LookupError> {
        let path = path.as_ref().to_owned();
        let content = fs_err::read(&path)?;
        Self::parse(path, &content)
    }

    pub(crate) fn parse(path: PathBuf, content: &[u8]) -> Result<Self, LookupError> {
        let pefile = pelite::PeFile::from_bytes(content).map_err(|e| {
            LookupError::InvalidImage {
                path: path_to_string(&path),
                reason: e.to_string(),
            }
        })?;
        let parsed = match pefile {
            pelite::Wrap::T32(pe) => parse32::parse(pe),
            pelite::Wrap::T64(pe) => parse64::parse(pe),
        }?;
        let machine = MachineType::from_raw(parsed.machine).ok_or_else(|| {
            LookupError::InvalidImage {
                path: path_to_string(&path),
                reason: format!("unsupported machine type 0x{:04x}", parsed.machine),
            }
        })?;
        Ok(Self {
            path,
            machine,
            internal_name: parsed.internal_name,
            sections: parsed.sections,
            exports: parsed.exports,
            imports: merge_import_groups(parsed.imports, parsed.delay_imports),
            manifest: parsed.manifest,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn machine(&self) -> MachineType {
        self.machine
    }

    /// DLL name as recorded in the export directory headers
    ///
    /// This should match the dependency name specified in the import table of
    /// files depending on this DLL
    pub fn internal_name(&self) -> Option<&str> {
        self.internal_name.as_deref()
    }

    pub fn sections(&self) -> &[SectionInfo] {
        &self.sections
    }

    /// Exports in ascending ordinal order, exactly as stored in the export
    /// directory
    pub fn exports(&self) -> &[PeExport] {
        &self.exports
    }

    /// One group per distinct imported module, in first-occurrence order;
    /// delay-loaded imports are merged into their module's group and tagged
    pub fn imports(&self) -> &[PeImportDll] {
        &self.imports
    }

    /// Raw bytes of the RT_MANIFEST resource; empty when the image embeds no
    /// manifest (which is not an error)
    pub fn manifest_bytes(&self) -> &[u8] {
        &self.manifest
    }
}

fn merge_import_groups(
    ordinary: Vec<(String, Vec<PeImport>)>,
    delayed: Vec<(String, Vec<PeImport>)>,
) -> Vec<PeImportDll> {
    let mut out: Vec<PeImportDll> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for (name, entries) in ordinary.into_iter().chain(delayed) {
        match index.entry(name.to_lowercase()) {
            Entry::Occupied(e) => out[*e.get()].imports.extend(entries),
            Entry::Vacant(e) => {
                e.insert(out.len());
                out.push(PeImportDll {
                    name,
                    imports: entries,
                });
            }
        }
    }
    out
}

/// Get a humanly-readable version of an (imported or exported) symbol
pub fn demangle_symbol(symbol: &str) -> Result<String, LookupError> {
    let flags =
        msvc_demangler::DemangleFlags::llvm() | msvc_demangler::DemangleFlags::NO_MS_KEYWORDS;
    msvc_demangler::demangle(symbol, flags)
        .map_err(|_| LookupError::DemanglingError(symbol.to_owned()))
}

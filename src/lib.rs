//! depscope is a static reimplementation of the dependency resolution the
//! Windows loader performs when a PE binary starts: it parses exports,
//! imports and the embedded manifest out of the file, consults the ApiSet
//! schema and the KnownDlls list, and probes the side-by-side store for the
//! declared assemblies, all without loading any code.
//!
//! It runs on Windows against the live system, and on other platforms
//! against a mounted Windows partition.

pub mod apiset;
pub mod common;
pub mod knowndlls;
pub mod manifest;
pub mod pe;
pub mod sxs;
pub mod system;

#[cfg(test)]
mod testpe;

pub use apiset::{
    get_api_set_schema, is_api_set_name, lookup_api_set, parse_apiset, resolve_api_set,
    ApisetMap,
};
pub use common::{decanonicalize, path_to_string, readable_canonical_path, LookupError};
pub use knowndlls::{get_known_dlls, KnownDllSet};
pub use manifest::{decode_manifest_bytes, manifest_text};
pub use pe::{
    demangle_symbol, ImportTarget, MachineType, PeExport, PeImage, PeImport, PeImportDll,
    SectionInfo,
};
pub use sxs::{
    dependent_assemblies, parse_sxs_manifest, sxs_entries, AssemblyIdentity, AssemblyVersion,
    SxsContext, SxsEntry, SxsProbe, DEFAULT_SXS_PROBE_ORDER, UNRESOLVED_SXS_PATH,
};
pub use system::WindowsSystem;

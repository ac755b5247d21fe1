//! Side-by-side (SxS) assembly resolution
//!
//! Binaries declare the assemblies they want in their embedded manifest; the
//! loader then probes, in order, the application directory (private
//! assemblies), the WinSxS store, publisher policies (version redirects) and
//! the KnownDlls/ApiSet shortcut. Resolution failures are a property of the
//! single dependency, not of the binary: an assembly that cannot be located
//! is reported with the conventional "???" placeholder path.

use crate::apiset::{is_api_set_name, resolve_api_set, ApisetMap};
use crate::common::{path_to_string, LookupError};
use crate::knowndlls::KnownDllSet;
use crate::manifest::manifest_text;
use crate::pe::{MachineType, PeImage};
use crate::system::{WinFileSystemCache, WindowsSystem};
use multimap::MultiMap;
use regex::Regex;
use serde::Serialize;
use std::cell::{OnceCell, RefCell};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

/// Placeholder path reported for a declared assembly that could not be found
pub const UNRESOLVED_SXS_PATH: &str = "???";

/// Four-part assembly version, e.g. 6.0.9600.16384
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssemblyVersion(pub [u16; 4]);

impl AssemblyVersion {
    pub fn major(&self) -> u16 {
        self.0[0]
    }

    pub fn minor(&self) -> u16 {
        self.0[1]
    }
}

impl FromStr for AssemblyVersion {
    type Err = LookupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed =
            || LookupError::ScanError(format!("malformed assembly version {:?}", s));
        let mut parts = [0u16; 4];
        let mut tokens = s.split('.');
        for p in parts.iter_mut() {
            *p = tokens
                .next()
                .and_then(|t| t.trim().parse().ok())
                .ok_or_else(malformed)?;
        }
        if tokens.next().is_some() {
            return Err(malformed());
        }
        Ok(Self(parts))
    }
}

impl std::fmt::Display for AssemblyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl Serialize for AssemblyVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Identity of one declared assembly, as spelled in an assemblyIdentity node
///
/// A literal "*" for the architecture or language means "whatever fits" and
/// is normalized to None.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssemblyIdentity {
    pub name: String,
    pub version: Option<AssemblyVersion>,
    pub architecture: Option<String>,
    pub public_key_token: Option<String>,
    pub language: Option<String>,
}

impl AssemblyIdentity {
    fn from_node(node: roxmltree::Node) -> Option<Self> {
        let wildcard_to_none = |attr: &str| {
            node.attribute(attr)
                .filter(|v| *v != "*")
                .map(str::to_owned)
        };
        Some(Self {
            name: node.attribute("name")?.to_owned(),
            version: node.attribute("version").and_then(|v| v.parse().ok()),
            architecture: wildcard_to_none("processorArchitecture"),
            public_key_token: node.attribute("publicKeyToken").map(str::to_owned),
            language: wildcard_to_none("language"),
        })
    }
}

/// The probing steps of assembly resolution, in configurable order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SxsProbe {
    /// {appdir}\{name}.dll and {appdir}\{name}\{name}.dll
    PrivateAssembly,
    /// WinSxS store directories matching the declared version line
    SxsStore,
    /// Publisher policy redirects applied, then the store again
    PublisherPolicy,
    /// The plain "{name}.dll" as a KnownDll or ApiSet contract
    KnownDllOrApiSet,
}

pub const DEFAULT_SXS_PROBE_ORDER: [SxsProbe; 4] = [
    SxsProbe::PrivateAssembly,
    SxsProbe::SxsStore,
    SxsProbe::PublisherPolicy,
    SxsProbe::KnownDllOrApiSet,
];

/// Resolution outcome for one declared assembly
#[derive(Debug, Clone, Serialize)]
pub struct SxsEntry {
    pub identity: AssemblyIdentity,
    /// Full path of the resolved DLL, or [`UNRESOLVED_SXS_PATH`]
    pub path: String,
    /// Which probe succeeded; None when unresolved
    pub via: Option<SxsProbe>,
}

impl SxsEntry {
    pub fn is_resolved(&self) -> bool {
        self.via.is_some()
    }
}

/// Parse a manifest as XML
///
/// The original manifest text travels with the error so that callers can
/// show it for diagnosis.
pub fn parse_sxs_manifest(text: &str) -> Result<roxmltree::Document<'_>, LookupError> {
    roxmltree::Document::parse(text).map_err(|source| LookupError::MalformedManifest {
        source,
        content: text.to_owned(),
    })
}

/// All assemblies declared as dependencies, in document order
pub fn dependent_assemblies(doc: &roxmltree::Document) -> Vec<AssemblyIdentity> {
    doc.descendants()
        .filter(|n| n.tag_name().name() == "dependentAssembly")
        .filter_map(|dep| {
            dep.children()
                .find(|c| c.tag_name().name() == "assemblyIdentity")
        })
        .filter_map(AssemblyIdentity::from_node)
        .collect()
}

/// One assembly present in the WinSxS store, decoded from its directory name
///
/// Store directories are named
/// `{arch}_{name}_{token}_{version}_{language}_{hash}`.
#[derive(Debug, Clone)]
struct StoreAssembly {
    architecture: String,
    name: String,
    public_key_token: String,
    version: AssemblyVersion,
    language: String,
    dir: PathBuf,
}

impl StoreAssembly {
    fn from_dir(dir: PathBuf) -> Option<Self> {
        static STORE_DIR_RE: OnceLock<Regex> = OnceLock::new();
        let re = STORE_DIR_RE.get_or_init(|| {
            Regex::new(r"^([^_]+)_(.+)_([0-9a-f]{16})_((?:\d+\.){3}\d+)_([^_]*)_([^_]+)$")
                .unwrap()
        });
        let dir_name = dir.file_name()?.to_string_lossy().to_lowercase();
        let caps = re.captures(&dir_name)?;
        Some(Self {
            architecture: caps[1].to_owned(),
            name: caps[2].to_owned(),
            public_key_token: caps[3].to_owned(),
            version: caps[4].parse().ok()?,
            language: if caps[5].is_empty() {
                "none".to_owned()
            } else {
                caps[5].to_owned()
            },
            dir,
        })
    }
}

enum VersionFilter {
    /// Same major.minor as declared; the highest build wins
    Line(u16, u16),
    /// Exactly this version (after a policy redirect)
    Exact(AssemblyVersion),
    Any,
}

impl VersionFilter {
    fn admits(&self, v: AssemblyVersion) -> bool {
        match self {
            Self::Line(major, minor) => v.major() == *major && v.minor() == *minor,
            Self::Exact(want) => v == *want,
            Self::Any => true,
        }
    }
}

/// Everything needed to resolve the assemblies of one binary
///
/// The directories and tables are injectable, so resolution works the same
/// against the live system, a mounted Windows partition or a test tree.
pub struct SxsContext {
    pub app_dir: PathBuf,
    pub sys_dir: Option<PathBuf>,
    pub winsxs_dir: Option<PathBuf>,
    pub apiset_map: Option<Arc<ApisetMap>>,
    pub known_dlls: Option<Arc<KnownDllSet>>,
    probe_order: Vec<SxsProbe>,
    fs_cache: RefCell<WinFileSystemCache>,
    store_index: OnceCell<MultiMap<String, StoreAssembly>>,
}

impl SxsContext {
    /// Context for a binary, using the host system (or the Windows
    /// installation found on the binary's partition)
    pub fn for_image(image: &PeImage) -> Result<Self, LookupError> {
        let app_dir = image
            .path()
            .parent()
            .map(Path::to_owned)
            .unwrap_or_else(|| PathBuf::from("."));
        #[cfg(windows)]
        let system = WindowsSystem::current().ok();
        #[cfg(not(windows))]
        let system = WindowsSystem::from_exe_location(image.path())?;

        let apiset_map = crate::apiset::get_api_set_schema().ok();
        let known_dlls = crate::knowndlls::get_known_dlls(!image.machine().is_64bit()).ok();
        Ok(Self {
            app_dir,
            sys_dir: system.as_ref().map(|s| s.sys_dir.clone()),
            winsxs_dir: system.and_then(|s| s.winsxs_dir),
            apiset_map,
            known_dlls,
            probe_order: DEFAULT_SXS_PROBE_ORDER.to_vec(),
            fs_cache: RefCell::new(WinFileSystemCache::new()),
            store_index: OnceCell::new(),
        })
    }

    /// Context over explicit directories, without touching any OS table
    pub fn for_directories(
        app_dir: PathBuf,
        sys_dir: Option<PathBuf>,
        winsxs_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            app_dir,
            sys_dir,
            winsxs_dir,
            apiset_map: None,
            known_dlls: None,
            probe_order: DEFAULT_SXS_PROBE_ORDER.to_vec(),
            fs_cache: RefCell::new(WinFileSystemCache::new()),
            store_index: OnceCell::new(),
        }
    }

    pub fn with_probe_order(mut self, order: &[SxsProbe]) -> Self {
        self.probe_order = order.to_vec();
        self
    }

    pub fn with_apiset_map(mut self, map: Arc<ApisetMap>) -> Self {
        self.apiset_map = Some(map);
        self
    }

    pub fn with_known_dlls(mut self, known_dlls: Arc<KnownDllSet>) -> Self {
        self.known_dlls = Some(known_dlls);
        self
    }

    /// Run the probes in their configured order; first hit wins
    pub fn resolve_assembly(
        &self,
        identity: &AssemblyIdentity,
        machine: MachineType,
    ) -> Option<(PathBuf, SxsProbe)> {
        for &probe in &self.probe_order {
            let found = match probe {
                SxsProbe::PrivateAssembly => self.probe_private(identity),
                SxsProbe::SxsStore => self.probe_store(identity, machine),
                SxsProbe::PublisherPolicy => self.probe_policy(identity, machine),
                SxsProbe::KnownDllOrApiSet => self.probe_known(identity),
            };
            if let Some(path) = found {
                return Some((path, probe));
            }
        }
        None
    }

    fn probe_private(&self, identity: &AssemblyIdentity) -> Option<PathBuf> {
        let dll_name = format!("{}.dll", identity.name);
        let mut cache = self.fs_cache.borrow_mut();
        if let Ok(Some(p)) = cache.test_file_in_folder_case_insensitive(&dll_name, &self.app_dir)
        {
            return Some(p);
        }
        let subdir = self.app_dir.join(&identity.name);
        cache
            .test_file_in_folder_case_insensitive(&dll_name, subdir)
            .unwrap_or(None)
    }

    fn probe_store(&self, identity: &AssemblyIdentity, machine: MachineType) -> Option<PathBuf> {
        let filter = match identity.version {
            Some(v) => VersionFilter::Line(v.major(), v.minor()),
            None => VersionFilter::Any,
        };
        self.best_store_match(identity, machine, &filter)
            .and_then(|asm| self.dll_in_assembly_dir(&identity.name, &asm.dir))
    }

    /// Apply publisher policy redirects, then look for the redirected version
    /// in the store
    fn probe_policy(&self, identity: &AssemblyIdentity, machine: MachineType) -> Option<PathBuf> {
        let declared = identity.version?;
        let token = identity.public_key_token.as_deref()?;
        let manifests_dir = self.winsxs_dir.as_ref()?.join("Manifests");

        // policy files are named like store dirs, with the assembly name
        // replaced by policy.{major}.{minor}.{name}
        let pattern = manifests_dir.join(format!(
            "*_policy.{}.{}.{}_{}_*.manifest",
            declared.major(),
            declared.minor(),
            identity.name.to_lowercase(),
            token.to_lowercase(),
        ));
        let options = glob::MatchOptions {
            case_sensitive: false,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        for policy_path in glob::glob_with(&pattern.to_string_lossy(), options)
            .ok()?
            .filter_map(Result::ok)
        {
            let text = match fs_err::read_to_string(&policy_path) {
                Ok(text) => text,
                Err(_) => continue,
            };
            let doc = match roxmltree::Document::parse(&text) {
                Ok(doc) => doc,
                // a broken policy file doesn't break resolution
                Err(_) => continue,
            };
            for redirect in doc
                .descendants()
                .filter(|n| n.tag_name().name() == "bindingRedirect")
            {
                let Some((lo, hi)) = redirect.attribute("oldVersion").and_then(parse_version_range)
                else {
                    continue;
                };
                let Some(new_version) = redirect
                    .attribute("newVersion")
                    .and_then(|v| v.parse::<AssemblyVersion>().ok())
                else {
                    continue;
                };
                if declared < lo || declared > hi {
                    continue;
                }
                if let Some(asm) =
                    self.best_store_match(identity, machine, &VersionFilter::Exact(new_version))
                {
                    if let Some(p) = self.dll_in_assembly_dir(&identity.name, &asm.dir) {
                        return Some(p);
                    }
                }
            }
        }
        None
    }

    fn probe_known(&self, identity: &AssemblyIdentity) -> Option<PathBuf> {
        let sys_dir = self.sys_dir.as_ref()?;
        let dll_name = if identity.name.to_lowercase().ends_with(".dll") {
            identity.name.clone()
        } else {
            format!("{}.dll", identity.name)
        };
        if is_api_set_name(&dll_name) {
            let map = self.apiset_map.as_ref()?;
            return resolve_api_set(map, &dll_name, Some(sys_dir));
        }
        if self.known_dlls.as_ref().is_some_and(|kd| kd.contains(&dll_name)) {
            return self
                .fs_cache
                .borrow_mut()
                .test_file_in_folder_case_insensitive(&dll_name, sys_dir)
                .unwrap_or(None);
        }
        None
    }

    fn store_index(&self) -> &MultiMap<String, StoreAssembly> {
        self.store_index.get_or_init(|| {
            let mut index = MultiMap::new();
            let Some(winsxs_dir) = &self.winsxs_dir else {
                return index;
            };
            let Ok(entries) = fs_err::read_dir(winsxs_dir) else {
                return index;
            };
            for entry in entries.filter_map(Result::ok) {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                if let Some(asm) = StoreAssembly::from_dir(path) {
                    index.insert(asm.name.clone(), asm);
                }
            }
            index
        })
    }

    /// Best store candidate for an identity: name, token, architecture and
    /// language must fit; among the versions the filter admits, an exact
    /// language match beats the "none" fallback, then the highest version
    /// wins
    fn best_store_match(
        &self,
        identity: &AssemblyIdentity,
        machine: MachineType,
        filter: &VersionFilter,
    ) -> Option<StoreAssembly> {
        let wanted_arch = identity
            .architecture
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_else(|| arch_name(machine).to_owned());
        let wanted_lang = identity.language.as_deref().map(str::to_lowercase);

        self.store_index()
            .get_vec(&identity.name.to_lowercase())?
            .iter()
            .filter(|asm| asm.architecture == wanted_arch)
            .filter(|asm| match identity.public_key_token.as_deref() {
                Some(token) => asm.public_key_token == token.to_lowercase(),
                None => true,
            })
            .filter(|asm| match &wanted_lang {
                Some(lang) => asm.language == *lang || asm.language == "none",
                None => true,
            })
            .filter(|asm| filter.admits(asm.version))
            .max_by_key(|asm| {
                let exact_lang = wanted_lang.as_deref() == Some(asm.language.as_str());
                (exact_lang, asm.version)
            })
            .cloned()
    }

    /// Locate the DLL inside a store directory: the assembly's own name if a
    /// DLL of that name exists, otherwise the first DLL in the directory;
    /// a directory holding no DLL at all is a miss, not a resolution
    fn dll_in_assembly_dir(&self, assembly_name: &str, dir: &Path) -> Option<PathBuf> {
        if let Ok(Some(p)) = self
            .fs_cache
            .borrow_mut()
            .test_file_in_folder_case_insensitive(format!("{}.dll", assembly_name), dir)
        {
            return Some(p);
        }
        let mut dlls: Vec<PathBuf> = fs_err::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| e.path())
                    .filter(|p| {
                        p.extension()
                            .map(|e| e.eq_ignore_ascii_case("dll"))
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        dlls.sort();
        dlls.into_iter().next()
    }
}

/// "1.0.0.0-1.9.9.9" (inclusive) or a single version
fn parse_version_range(s: &str) -> Option<(AssemblyVersion, AssemblyVersion)> {
    match s.split_once('-') {
        Some((lo, hi)) => Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?)),
        None => {
            let v: AssemblyVersion = s.trim().parse().ok()?;
            Some((v, v))
        }
    }
}

fn arch_name(machine: MachineType) -> &'static str {
    match machine {
        MachineType::I386 => "x86",
        MachineType::Amd64 => "amd64",
        MachineType::ArmNt => "arm",
        MachineType::Arm64 => "arm64",
    }
}

/// Resolve every assembly the binary's manifest declares
///
/// Returns one entry per declaration, in manifest order; a binary without a
/// manifest yields an empty list. Only a malformed manifest is an error —
/// an assembly that cannot be located produces an entry with the "???" path.
pub fn sxs_entries(image: &PeImage, ctx: &SxsContext) -> Result<Vec<SxsEntry>, LookupError> {
    let Some(text) = manifest_text(image) else {
        return Ok(Vec::new());
    };
    let doc = parse_sxs_manifest(&text)?;
    let entries = dependent_assemblies(&doc)
        .into_iter()
        .map(|identity| match ctx.resolve_assembly(&identity, image.machine()) {
            Some((path, via)) => SxsEntry {
                identity,
                path: path_to_string(path),
                via: Some(via),
            },
            None => SxsEntry {
                identity,
                path: UNRESOLVED_SXS_PATH.to_owned(),
                via: None,
            },
        })
        .collect();
    Ok(entries)
}

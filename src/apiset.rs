/*!
Fun with MS Api Set Schemas

The schema maps virtual contract names ("api-ms-win-*", "ext-ms-*") to the
host DLLs actually implementing them. It is parsed once per process from the
`.apiset` section of apisetschema.dll and cached immutably.

Resources:

* https://ofekshilon.com/2016/03/27/on-api-ms-win-xxxxx-dll-and-other-dependency-walker-glitches/
* https://blog.quarkslab.com/runtime-dll-name-resolution-apisetschema-part-i.html
* https://lucasg.github.io/2017/10/15/Api-set-resolution/
* https://www.geoffchappell.com/studies/windows/win32/apisetschema/index.htm

 */

use crate::common::LookupError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Virtual contract name (lowercase, no .dll) -> ordered host DLL candidates
pub type ApisetMap = HashMap<String, Vec<String>>;

static SCHEMA: OnceLock<Result<Arc<ApisetMap>, String>> = OnceLock::new();

/// Process-wide ApiSet schema, loaded from the host system on first access
///
/// The load happens exactly once, even under concurrent first accesses; the
/// outcome (schema or failure) is cached and every later call observes it.
pub fn get_api_set_schema() -> Result<Arc<ApisetMap>, LookupError> {
    let cached = SCHEMA.get_or_init(|| {
        host_schema_path()
            .and_then(|p| parse_apiset(&p))
            .map(Arc::new)
            .map_err(|e| e.to_string())
    });
    match cached {
        Ok(map) => Ok(map.clone()),
        Err(e) => Err(LookupError::SystemTable(e.clone())),
    }
}

fn host_schema_path() -> Result<PathBuf, LookupError> {
    #[cfg(windows)]
    {
        Ok(crate::system::get_system_directory()?.join("apisetschema.dll"))
    }
    #[cfg(not(windows))]
    {
        Err(LookupError::SystemTable(
            "no host ApiSet schema outside Windows; parse one from a mounted system directory"
                .to_owned(),
        ))
    }
}

/// Parse the ApiSet schema from a given apisetschema.dll
///
/// Explicit entry point for mounted Windows partitions and tests; does not
/// touch the process-wide cache.
pub fn parse_apiset<P: AsRef<Path>>(apisetschema_path: P) -> Result<ApisetMap, LookupError> {
    let content = fs_err::read(apisetschema_path.as_ref())?;
    let pefile = pelite::pe64::PeFile::from_bytes(&content)?;
    let map = nt_apiset::ApiSetMap::try_from_pe64(pefile).map_err(table_err)?;
    let mut entries = ApisetMap::new();
    for namespace_entry in map.namespace_entries().map_err(table_err)? {
        // entry names and values are UTF-16; decoding can fail on its own
        let name = namespace_entry
            .name()
            .map_err(table_err)?
            .to_string()
            .map_err(table_err)?
            .to_lowercase();
        let mut hosts = Vec::new();
        for value_entry in namespace_entry.value_entries().map_err(table_err)? {
            let host = value_entry
                .value()
                .map_err(table_err)?
                .to_string()
                .map_err(table_err)?;
            hosts.push(host);
        }
        entries.insert(name, hosts);
    }
    Ok(entries)
}

fn table_err<E: std::fmt::Display>(e: E) -> LookupError {
    LookupError::SystemTable(format!("ApiSet schema: {e}"))
}

/// Key used in the schema map for a (possibly decorated) dependency name
fn contract_key(library: &str) -> String {
    library.to_lowercase().trim_end_matches(".dll").to_owned()
}

/// Quick syntactic test for names subject to ApiSet virtualization
pub fn is_api_set_name(library: &str) -> bool {
    let lower = library.to_lowercase();
    lower.starts_with("api-") || lower.starts_with("ext-")
}

/// Host DLL candidates for a virtual contract name; case-insensitive, a
/// trailing .dll in the query is ignored
pub fn lookup_api_set<'a>(map: &'a ApisetMap, library: &str) -> Option<&'a [String]> {
    map.get(&contract_key(library)).map(|v| v.as_slice())
}

/// Resolve a virtual name to the first listed host DLL that exists on disk
///
/// Many virtual names are conditionally implemented; no existing host is
/// reported as None, not as an error.
pub fn resolve_api_set(
    map: &ApisetMap,
    library: &str,
    sys_dir: Option<&Path>,
) -> Option<PathBuf> {
    let hosts = lookup_api_set(map, library)?;
    let sys_dir = sys_dir?;
    hosts
        .iter()
        .filter(|h| !h.is_empty())
        .map(|h| sys_dir.join(h))
        .find(|p| p.is_file())
}

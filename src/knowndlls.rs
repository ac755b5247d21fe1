//! Membership in the loader's KnownDlls lists
//!
//! KnownDlls are pre-mapped system libraries the loader binds from the system
//! directory without any path search, so they can't be overridden or
//! hijacked. In contrast to reading the registry key
//! `HKLM\SYSTEM\CurrentControlSet\Control\Session Manager\KnownDLLs`,
//! listing the NT object directory `\KnownDlls` gives the transitively closed
//! list, so dependencies of the listed DLLs don't need a separate walk
//! (https://lucasg.github.io/2017/06/07/listing-known-dlls/).

use crate::common::LookupError;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

/// Names of the section objects in one KnownDlls object directory, lowercase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownDllSet {
    names: HashSet<String>,
}

impl KnownDllSet {
    /// Build a set from explicit names; used for mounted systems and tests
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .map(|n| n.as_ref().to_lowercase())
                .collect(),
        }
    }

    /// Case-insensitive membership test by DLL base name
    pub fn contains(&self, library: &str) -> bool {
        self.names.contains(&library.to_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|s| s.as_str())
    }
}

static NATIVE: OnceLock<Result<Arc<KnownDllSet>, String>> = OnceLock::new();
static WOW64: OnceLock<Result<Arc<KnownDllSet>, String>> = OnceLock::new();

/// Process-wide KnownDlls list, enumerated from the OS on first access
///
/// `wow64` selects `\KnownDlls32` (the list seen by 32-bit processes on a
/// 64-bit system) instead of `\KnownDlls`. Each list is read exactly once;
/// the outcome is cached for the lifetime of the process. Outside Windows
/// both lists are empty.
pub fn get_known_dlls(wow64: bool) -> Result<Arc<KnownDllSet>, LookupError> {
    let cache = if wow64 { &WOW64 } else { &NATIVE };
    let cached = cache.get_or_init(|| {
        read_known_dlls(wow64)
            .map(Arc::new)
            .map_err(|e| e.to_string())
    });
    match cached {
        Ok(set) => Ok(set.clone()),
        Err(e) => Err(LookupError::SystemTable(e.clone())),
    }
}

#[cfg(not(windows))]
fn read_known_dlls(_wow64: bool) -> Result<KnownDllSet, LookupError> {
    Ok(KnownDllSet::default())
}

/// Enumerate the Section objects in \KnownDlls or \KnownDlls32
#[cfg(windows)]
fn read_known_dlls(wow64: bool) -> Result<KnownDllSet, LookupError> {
    extern crate ntapi;
    extern crate winapi;

    use ntapi::ntobapi::{
        DIRECTORY_QUERY, OBJECT_DIRECTORY_INFORMATION, POBJECT_DIRECTORY_INFORMATION,
    };
    use ntapi::ntrtl::RtlNtStatusToDosError;
    use std::ffi::OsString;
    use std::mem::size_of;
    use std::os::windows::prelude::*;
    use std::ptr::null_mut;
    use winapi::shared::ntdef::{
        FALSE, HANDLE, NTSTATUS, NT_SUCCESS, OBJECT_ATTRIBUTES, TRUE, ULONG, UNICODE_STRING,
        USHORT, WCHAR,
    };

    unsafe fn u16_ptr_to_string(ptr: *const u16) -> OsString {
        let len = (0..).take_while(|&i| *ptr.offset(i) != 0).count();
        let slice = std::slice::from_raw_parts(ptr, len);

        OsString::from_wide(slice)
    }

    let object_path = if wow64 { "\\KnownDlls32" } else { "\\KnownDlls" };
    // must outlive the UNICODE_STRING pointing into it
    let name_buffer: Vec<WCHAR> = object_path.encode_utf16().collect();

    let object_name = UNICODE_STRING {
        Length: (name_buffer.len() * size_of::<WCHAR>()) as USHORT,
        MaximumLength: (name_buffer.len() * size_of::<WCHAR>()) as USHORT,
        Buffer: name_buffer.as_ptr() as *mut _,
    };

    let mut oa: OBJECT_ATTRIBUTES = OBJECT_ATTRIBUTES {
        Length: size_of::<OBJECT_ATTRIBUTES>() as ULONG,
        RootDirectory: null_mut(),
        ObjectName: &object_name as *const _ as *mut _,
        Attributes: 0,
        SecurityDescriptor: null_mut(),
        SecurityQualityOfService: null_mut(),
    };

    let mut names = HashSet::new();

    let mut dir_handle: HANDLE = null_mut();
    let mut status: NTSTATUS;
    unsafe {
        status =
            ntapi::ntobapi::NtOpenDirectoryObject(&mut dir_handle, DIRECTORY_QUERY, &mut oa);
    }
    if !NT_SUCCESS(status) {
        let raw_err =
            std::io::Error::from_raw_os_error(unsafe { RtlNtStatusToDosError(status) } as i32);
        return Err(LookupError::SystemTable(format!(
            "failed to open {}: {}",
            object_path, raw_err
        )));
    }

    let mut first_time = TRUE;
    let mut context: ULONG = 0;
    let mut buffer_size: u32 = 0x200;
    let mut return_length: u32 = 0;
    let mut buffer_vec: Vec<u8> = vec![0; buffer_size as usize];
    unsafe {
        loop {
            loop {
                let buffer: POBJECT_DIRECTORY_INFORMATION =
                    buffer_vec.as_mut_ptr() as POBJECT_DIRECTORY_INFORMATION;
                status = ntapi::ntobapi::NtQueryDirectoryObject(
                    dir_handle,
                    buffer as *mut winapi::ctypes::c_void,
                    buffer_size,
                    FALSE,
                    first_time,
                    &mut context,
                    &mut return_length,
                );
                if status != winapi::shared::ntstatus::STATUS_MORE_ENTRIES {
                    break;
                }

                // at least one entry fits? otherwise grow the buffer and retry
                if (*buffer).Name.Buffer != null_mut() {
                    break;
                }

                buffer_size *= 2;
                buffer_vec = vec![0; buffer_size as usize];
            }

            let mut i: usize = 0;

            loop {
                let info: POBJECT_DIRECTORY_INFORMATION = buffer_vec
                    .as_ptr()
                    .offset((size_of::<OBJECT_DIRECTORY_INFORMATION>() * i) as isize)
                    as POBJECT_DIRECTORY_INFORMATION;

                if (*info).Name.Buffer == null_mut() {
                    break;
                }

                // the directory also holds the KnownDllPath symlink; only
                // Section objects are mapped DLLs
                if u16_ptr_to_string((*info).TypeName.Buffer) == OsString::from("Section") {
                    let name = u16_ptr_to_string((*info).Name.Buffer);
                    names.insert(name.to_string_lossy().to_lowercase());
                }

                i += 1;
            }

            if status != winapi::shared::ntstatus::STATUS_MORE_ENTRIES {
                break;
            }

            first_time = FALSE;
        }

        winapi::um::handleapi::CloseHandle(dir_handle);
    }

    Ok(KnownDllSet { names })
}

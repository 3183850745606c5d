//! Dynamic library loading
//!
//! A [`Library`] owns one handle returned by the platform loader. The Unix
//! implementation goes through `dlopen`/`dlsym`/`dlclose` from `libc`, the
//! Windows one through `LoadLibraryW`/`GetProcAddress`/`FreeLibrary`. Both
//! report failures as distinct [`LoadError`] variants; nothing outside this
//! module sees a platform handle or a platform error API.
//!
//! Modules are opened with immediate binding and global symbol visibility
//! (`RTLD_NOW | RTLD_GLOBAL`): the generated parser and the host process
//! share the host runtime's extension ABI.

use std::ffi::{c_void, CString};
use std::path::{Path, PathBuf};

use super::error::LoadError;

/// Logging macros - no-op when logging feature is disabled
#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => {};
}

/// Logging macros - use log crate when logging feature is enabled
#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($($arg:tt)*) => { log::debug!($($arg)*) };
}

/// An open shared library
#[derive(Debug)]
pub struct Library {
    handle: *mut c_void,
    path: PathBuf,
}

impl Library {
    /// Open the shared library at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LoadError::NotFound {
                path: path.display().to_string(),
            });
        }

        log_debug!("opening parser module {}", path.display());
        let handle = unsafe { platform::open(path)? };

        Ok(Self {
            handle,
            path: path.to_path_buf(),
        })
    }

    /// Path the library was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve an exported symbol
    pub fn resolve(&self, symbol: &str) -> Result<*mut c_void, LoadError> {
        self.resolve_optional(symbol)
            .ok_or_else(|| LoadError::MissingSymbol {
                symbol: symbol.to_string(),
            })
    }

    /// Resolve an exported symbol that the module may legitimately omit
    pub fn resolve_optional(&self, symbol: &str) -> Option<*mut c_void> {
        let name = CString::new(symbol).ok()?;
        let address = unsafe { platform::resolve(self.handle, &name) };
        if address.is_null() {
            None
        } else {
            Some(address)
        }
    }

    /// Unload the library
    pub fn close(mut self) -> Result<(), LoadError> {
        let handle = std::mem::replace(&mut self.handle, std::ptr::null_mut());
        log_debug!("closing parser module {}", self.path.display());
        unsafe { platform::close(handle) }
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            let _ = unsafe { platform::close(self.handle) };
        }
    }
}

#[cfg(unix)]
mod platform {
    use std::ffi::{c_void, CStr, CString};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use super::LoadError;

    /// Clear and return the pending `dlerror` message, if any
    fn take_error() -> Option<String> {
        let msg = unsafe { libc::dlerror() };
        if msg.is_null() {
            None
        } else {
            Some(unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned())
        }
    }

    pub(super) unsafe fn open(path: &Path) -> Result<*mut c_void, LoadError> {
        let c_path =
            CString::new(path.as_os_str().as_bytes()).map_err(|_| LoadError::InvalidPath {
                path: path.display().to_string(),
            })?;

        take_error();
        let handle = libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL);
        if handle.is_null() {
            return Err(LoadError::InvalidImage {
                path: path.display().to_string(),
                reason: take_error().unwrap_or_else(|| "unknown dlopen failure".to_string()),
            });
        }
        Ok(handle)
    }

    pub(super) unsafe fn resolve(handle: *mut c_void, name: &CStr) -> *mut c_void {
        take_error();
        let address = libc::dlsym(handle, name.as_ptr());
        take_error();
        address
    }

    pub(super) unsafe fn close(handle: *mut c_void) -> Result<(), LoadError> {
        take_error();
        if libc::dlclose(handle) != 0 {
            return Err(LoadError::CloseFailed {
                reason: take_error().unwrap_or_else(|| "unknown dlclose failure".to_string()),
            });
        }
        Ok(())
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::{c_void, CStr};
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;

    use super::LoadError;

    #[link(name = "kernel32")]
    extern "system" {
        fn LoadLibraryW(name: *const u16) -> *mut c_void;
        fn GetProcAddress(module: *mut c_void, name: *const i8) -> *mut c_void;
        fn FreeLibrary(module: *mut c_void) -> i32;
        fn GetLastError() -> u32;
        fn SetLastError(code: u32);
    }

    fn last_error() -> String {
        format!("Windows error {}", unsafe { GetLastError() })
    }

    pub(super) unsafe fn open(path: &Path) -> Result<*mut c_void, LoadError> {
        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
        if wide[..wide.len() - 1].contains(&0) {
            return Err(LoadError::InvalidPath {
                path: path.display().to_string(),
            });
        }

        SetLastError(0);
        let handle = LoadLibraryW(wide.as_ptr());
        if handle.is_null() {
            return Err(LoadError::InvalidImage {
                path: path.display().to_string(),
                reason: last_error(),
            });
        }
        Ok(handle)
    }

    pub(super) unsafe fn resolve(handle: *mut c_void, name: &CStr) -> *mut c_void {
        SetLastError(0);
        GetProcAddress(handle, name.as_ptr() as *const i8)
    }

    pub(super) unsafe fn close(handle: *mut c_void) -> Result<(), LoadError> {
        SetLastError(0);
        if FreeLibrary(handle) == 0 {
            return Err(LoadError::CloseFailed {
                reason: last_error(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Module file naming
// ============================================================================

/// Platform file name of a compiled module with the given stem
///
/// `calc-parser` becomes `libcalc-parser.so` on Linux,
/// `libcalc-parser.dylib` on macOS and `calc-parser.dll` on Windows.
pub fn library_filename(stem: &str) -> String {
    format!(
        "{}{}{}",
        std::env::consts::DLL_PREFIX,
        stem,
        std::env::consts::DLL_SUFFIX
    )
}

/// Full path of a compiled module inside a build directory
pub fn engine_library_path(build_dir: impl AsRef<Path>, stem: &str) -> PathBuf {
    build_dir.as_ref().join(library_filename(stem))
}

/// Default engine stem for a grammar defined in `module`
pub fn default_engine_name(module: &str) -> String {
    format!("{}-parser", module)
}

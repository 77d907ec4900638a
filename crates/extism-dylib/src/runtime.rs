//! Runtime handle: locates the native shared library, binds its
//! exports, and hands out the call surface everything else borrows.
//!
//! There is no process-global instance. Construct a [`Runtime`] once,
//! clone it freely (clones share the loaded library), and pass it to
//! whatever builds plugins or host functions.

use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::sys;

/// Environment variable naming a directory to search ahead of the
/// platform defaults.
pub const LIBRARY_DIR_ENV: &str = "EXTISM_LIB_DIR";

/// Platform file name of the native runtime library.
fn soname() -> &'static str {
    if cfg!(target_os = "macos") {
        "libextism.dylib"
    } else if cfg!(windows) {
        "extism.dll"
    } else {
        "libextism.so"
    }
}

/// Candidate paths to probe, in precedence order.
fn candidate_paths(override_dir: Option<PathBuf>) -> Vec<PathBuf> {
    let name = soname();
    let mut candidates = Vec::new();
    if let Some(dir) = override_dir {
        candidates.push(dir.join(name));
    }
    if cfg!(windows) {
        if let Some(path) = std::env::var_os("PATH") {
            candidates.extend(std::env::split_paths(&path).map(|dir| dir.join(name)));
        }
    } else {
        candidates.push(PathBuf::from("/usr/local/lib").join(name));
        candidates.push(PathBuf::from("/usr/lib").join(name));
    }
    candidates
}

/// A loaded native runtime.
///
/// Cheap to clone; all clones share one library binding. Dropping the
/// last clone leaves the library mapped, as unloading a library with
/// live native callbacks is not sound.
#[derive(Clone)]
pub struct Runtime {
    api: Arc<sys::Api>,
}

impl Runtime {
    /// Locate and load the native library from the standard locations,
    /// honoring [`LIBRARY_DIR_ENV`] first.
    pub fn load() -> Result<Self> {
        #[cfg(not(any(unix, windows)))]
        return Err(Error::UnsupportedPlatform(
            std::env::consts::OS.to_string(),
        ));

        #[cfg(any(unix, windows))]
        {
            let override_dir = std::env::var_os(LIBRARY_DIR_ENV).map(PathBuf::from);
            let candidates = candidate_paths(override_dir);
            for candidate in &candidates {
                if candidate.is_file() {
                    return Self::from_path(candidate);
                }
            }
            Err(Error::Load {
                searched: candidates
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect(),
            })
        }
    }

    /// Load the native library from an explicit path.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let api = Arc::new(sys::Api::open(path)?);
        let runtime = Self { api };
        tracing::info!(
            path = %path.display(),
            version = %runtime.version(),
            "loaded native runtime"
        );
        Ok(runtime)
    }

    pub(crate) fn api(&self) -> &Arc<sys::Api> {
        &self.api
    }

    /// Path the library was loaded from.
    pub fn library_path(&self) -> &Path {
        self.api.path()
    }

    /// Version string reported by the native runtime.
    pub fn version(&self) -> String {
        let ptr = unsafe { (self.api.version)() };
        if ptr.is_null() {
            return String::new();
        }
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }

    /// Route the native runtime's own log output to a file.
    ///
    /// `level` is a plain level (`error`, `warn`, `info`, `debug`,
    /// `trace`) or a filter string such as `extism=trace`.
    /// Process-wide: affects every runtime clone.
    pub fn set_log_file(&self, path: impl AsRef<Path>, level: &str) -> Result<()> {
        let path = path.as_ref();
        let c_path = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| Error::Logging("log file path contains a nul byte".to_string()))?;
        let c_level = CString::new(level)
            .map_err(|_| Error::Logging("log level contains a nul byte".to_string()))?;
        let ok = unsafe { (self.api.log_file)(c_path.as_ptr(), c_level.as_ptr()) };
        if !ok {
            return Err(Error::Logging(format!(
                "native runtime rejected log file {} at level {level:?}",
                path.display()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("library_path", &self.library_path())
            .finish()
    }
}

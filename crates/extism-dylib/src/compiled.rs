//! Precompiled plugins: validate and compile a manifest once, then
//! stamp out independent instances cheaply.

use std::ffi::c_char;
use std::fmt;
use std::ptr;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::host::HostFunction;
use crate::manifest::Manifest;
use crate::plugin::{Plugin, take_new_error};
use crate::runtime::Runtime;
use crate::sys;

/// A compiled plugin template.
///
/// Instances created from it share nothing at runtime: each has its own
/// memory, config, and call state. The template and all its instances
/// share the same host function set.
pub struct CompiledPlugin {
    handle: *mut sys::ExtismCompiledPlugin,
    functions: Arc<[HostFunction]>,
    api: Arc<sys::Api>,
}

// Safety: the handle is read-only after construction; instantiation is
// the only operation and the native runtime permits it concurrently.
unsafe impl Send for CompiledPlugin {}
unsafe impl Sync for CompiledPlugin {}

impl CompiledPlugin {
    /// Compile a manifest ahead of instantiation.
    ///
    /// WASI exposure is fixed at compile time; fuel limits apply per
    /// instance and are not available through this path.
    pub fn new(
        runtime: &Runtime,
        manifest: &Manifest,
        functions: Vec<HostFunction>,
        with_wasi: bool,
    ) -> Result<Self> {
        let encoded = manifest.to_json()?;
        let api = runtime.api().clone();
        let functions: Arc<[HostFunction]> = functions.into();
        let raw_functions: Vec<*const sys::ExtismFunction> =
            functions.iter().map(|f| f.raw()).collect();

        let mut err: *mut c_char = ptr::null_mut();
        let handle = unsafe {
            (api.compiled_plugin_new)(
                encoded.as_ptr(),
                encoded.len() as sys::Size,
                raw_functions.as_ptr(),
                raw_functions.len() as sys::Size,
                with_wasi,
                &mut err,
            )
        };
        if handle.is_null() {
            return Err(Error::PluginLoad {
                message: take_new_error(&api, err),
            });
        }

        tracing::debug!(wasi = with_wasi, "compiled plugin");
        Ok(Self {
            handle,
            functions,
            api,
        })
    }

    /// Create a fresh, independent instance of the compiled plugin.
    pub fn instantiate(&self) -> Result<Plugin> {
        let mut err: *mut c_char = ptr::null_mut();
        let handle = unsafe { (self.api.plugin_new_from_compiled)(self.handle, &mut err) };
        if handle.is_null() {
            return Err(Error::PluginLoad {
                message: take_new_error(&self.api, err),
            });
        }
        Ok(Plugin::from_raw_parts(
            handle,
            self.functions.clone(),
            self.api.clone(),
        ))
    }
}

impl Drop for CompiledPlugin {
    fn drop(&mut self) {
        unsafe { (self.api.compiled_plugin_free)(self.handle) };
    }
}

impl fmt::Debug for CompiledPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledPlugin")
            .field("functions", &self.functions.len())
            .finish_non_exhaustive()
    }
}

//! Plugin lifecycle: instantiation, guest calls, config updates,
//! cancellation.
//!
//! A [`Plugin`] owns a native instance handle. Calls take `&mut self`,
//! so a single instance never has two calls in flight; the only shared
//! piece is [`CancelHandle`], which the native runtime documents as
//! safe to trigger from another thread while a call runs.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString, c_char, c_void};
use std::fmt;
use std::ptr;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::host::HostFunction;
use crate::manifest::Manifest;
use crate::runtime::Runtime;
use crate::sys;

/// Instantiation options shared by plain and precompiled construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct PluginOptions {
    pub(crate) with_wasi: bool,
    pub(crate) fuel_limit: Option<u64>,
}

impl PluginOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose WASI imports to the guest.
    pub fn with_wasi(mut self, with_wasi: bool) -> Self {
        self.with_wasi = with_wasi;
        self
    }

    /// Cap execution at `fuel` units of work; exhausted calls fail.
    pub fn with_fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }
}

pub(crate) struct PluginInner {
    handle: *mut sys::ExtismPlugin,
    /// Host functions referenced by the instance's import table. Held
    /// for the full instance lifetime and drained for failures after
    /// every call.
    functions: Arc<[HostFunction]>,
    api: Arc<sys::Api>,
}

// Safety: the handle is only used for calls through &mut Plugin, apart
// from cancellation, which the native ABI allows concurrently.
unsafe impl Send for PluginInner {}
unsafe impl Sync for PluginInner {}

impl Drop for PluginInner {
    fn drop(&mut self) {
        unsafe { (self.api.plugin_free)(self.handle) };
    }
}

/// A loaded wasm plugin instance.
///
/// `Send` but not `Sync`: ownership may move between threads, but the
/// native handle must not be probed from two threads at once. Use
/// [`CancelHandle`] for the one cross-thread operation the runtime
/// supports.
pub struct Plugin {
    inner: Arc<PluginInner>,
    // keeps Plugin !Sync while staying Send
    _not_sync: std::marker::PhantomData<std::cell::Cell<()>>,
}

/// Read and free an instantiation error the native runtime handed back.
pub(crate) fn take_new_error(api: &sys::Api, err: *mut c_char) -> String {
    if err.is_null() {
        return "unknown instantiation failure".to_string();
    }
    let message = unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned();
    unsafe { (api.plugin_new_error_free)(err) };
    message
}

/// Render a 16-byte instance id in canonical UUID form.
fn format_id(bytes: &[u8]) -> String {
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

impl Plugin {
    /// Instantiate a plugin from a manifest.
    ///
    /// `functions` are the host functions the guest may import; they
    /// stay alive as long as any instance or cancel handle does.
    pub fn new(
        runtime: &Runtime,
        manifest: &Manifest,
        functions: Vec<HostFunction>,
        options: PluginOptions,
    ) -> Result<Self> {
        let encoded = manifest.to_json()?;
        Self::from_bytes(runtime, encoded.as_bytes(), functions, options)
    }

    /// Instantiate from raw manifest JSON or a bare wasm module.
    pub fn from_bytes(
        runtime: &Runtime,
        data: &[u8],
        functions: Vec<HostFunction>,
        options: PluginOptions,
    ) -> Result<Self> {
        let api = runtime.api().clone();
        let functions: Arc<[HostFunction]> = functions.into();
        let raw_functions: Vec<*const sys::ExtismFunction> =
            functions.iter().map(|f| f.raw()).collect();

        let mut err: *mut c_char = ptr::null_mut();
        let handle = unsafe {
            match options.fuel_limit {
                Some(fuel) => (api.plugin_new_with_fuel_limit)(
                    data.as_ptr(),
                    data.len() as sys::Size,
                    raw_functions.as_ptr(),
                    raw_functions.len() as sys::Size,
                    options.with_wasi,
                    fuel,
                    &mut err,
                ),
                None => (api.plugin_new)(
                    data.as_ptr(),
                    data.len() as sys::Size,
                    raw_functions.as_ptr(),
                    raw_functions.len() as sys::Size,
                    options.with_wasi,
                    &mut err,
                ),
            }
        };
        if handle.is_null() {
            return Err(Error::PluginLoad {
                message: take_new_error(&api, err),
            });
        }

        let plugin = Self {
            inner: Arc::new(PluginInner {
                handle,
                functions,
                api,
            }),
            _not_sync: std::marker::PhantomData,
        };
        tracing::debug!(id = %plugin.id(), wasi = options.with_wasi, "instantiated plugin");
        Ok(plugin)
    }

    pub(crate) fn from_raw_parts(
        handle: *mut sys::ExtismPlugin,
        functions: Arc<[HostFunction]>,
        api: Arc<sys::Api>,
    ) -> Self {
        Self {
            inner: Arc::new(PluginInner {
                handle,
                functions,
                api,
            }),
            _not_sync: std::marker::PhantomData,
        }
    }

    /// Invoke an exported guest function and return its output bytes.
    pub fn call(&mut self, function: &str, input: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        self.invoke(function, input.as_ref(), None)
    }

    /// Like [`call`](Self::call), but makes `context` retrievable by
    /// host functions for the duration of this call via
    /// [`CurrentPlugin::host_context`](crate::CurrentPlugin::host_context).
    pub fn call_with_host_context<T: Serialize>(
        &mut self,
        function: &str,
        input: impl AsRef<[u8]>,
        context: &T,
    ) -> Result<Vec<u8>> {
        let payload =
            serde_json::to_vec(context).map_err(|err| Error::HostContext(err.to_string()))?;
        self.invoke(function, input.as_ref(), Some(payload))
    }

    fn invoke(&mut self, function: &str, input: &[u8], context: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let c_function = CString::new(function).map_err(|_| Error::Call {
            function: function.to_string(),
            message: "function name contains a nul byte".to_string(),
        })?;

        // clear this thread's failures left over from an earlier
        // aborted call; other threads' in-flight calls keep theirs
        for host_function in self.inner.functions.iter() {
            let _ = host_function.take_failure();
        }

        tracing::debug!(function, input_len = input.len(), "calling plugin");
        let rc = unsafe {
            match &context {
                // the payload outlives the call; host functions read it
                // through the current-plugin accessor
                Some(payload) => (self.inner.api.plugin_call_with_host_context)(
                    self.inner.handle,
                    c_function.as_ptr(),
                    input.as_ptr(),
                    input.len() as sys::Size,
                    payload as *const Vec<u8> as *mut c_void,
                ),
                None => (self.inner.api.plugin_call)(
                    self.inner.handle,
                    c_function.as_ptr(),
                    input.as_ptr(),
                    input.len() as sys::Size,
                ),
            }
        };

        // a host-side failure explains the call's outcome better than
        // the guest trap it induced
        if let Some(message) = self
            .inner
            .functions
            .iter()
            .find_map(|f| f.take_failure())
        {
            return Err(Error::Call {
                function: function.to_string(),
                message,
            });
        }

        if rc != 0 {
            let detail = unsafe { self.inner.api.last_error(self.inner.handle) }
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(Error::Call {
                function: function.to_string(),
                message: format!("code = {rc}, error = {detail}"),
            });
        }

        let length = unsafe { (self.inner.api.plugin_output_length)(self.inner.handle) };
        if length == 0 {
            return Ok(Vec::new());
        }
        let data = unsafe { (self.inner.api.plugin_output_data)(self.inner.handle) };
        if data.is_null() {
            return Err(Error::Call {
                function: function.to_string(),
                message: "output buffer unavailable".to_string(),
            });
        }
        Ok(unsafe { std::slice::from_raw_parts(data, length as usize) }.to_vec())
    }

    /// Whether the guest exports `function`.
    pub fn function_exists(&self, function: &str) -> bool {
        let Ok(c_function) = CString::new(function) else {
            return false;
        };
        unsafe { (self.inner.api.plugin_function_exists)(self.inner.handle, c_function.as_ptr()) }
    }

    /// Reset guest memory and wipe persisted vars. Returns false when
    /// the instance cannot continue and should be rebuilt.
    pub fn reset(&mut self) -> bool {
        unsafe { (self.inner.api.plugin_reset)(self.inner.handle) }
    }

    /// Replace the plugin's config map for subsequent calls.
    pub fn update_config(&mut self, config: &BTreeMap<String, String>) -> Result<()> {
        let encoded = serde_json::to_vec(config).map_err(|err| Error::PluginLoad {
            message: format!("failed to encode config: {err}"),
        })?;
        let ok = unsafe {
            (self.inner.api.plugin_config)(
                self.inner.handle,
                encoded.as_ptr(),
                encoded.len() as sys::Size,
            )
        };
        if !ok {
            let detail = unsafe { self.inner.api.last_error(self.inner.handle) }
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(Error::PluginLoad {
                message: format!("failed to update config: {detail}"),
            });
        }
        Ok(())
    }

    /// Let guest HTTP requests observe response headers.
    pub fn allow_http_response_headers(&mut self) {
        unsafe { (self.inner.api.plugin_allow_http_response_headers)(self.inner.handle) };
    }

    /// Stable instance identifier in UUID form.
    pub fn id(&self) -> String {
        let ptr = unsafe { (self.inner.api.plugin_id)(self.inner.handle) };
        if ptr.is_null() {
            return String::new();
        }
        let bytes = unsafe { std::slice::from_raw_parts(ptr, 16) };
        format_id(bytes)
    }

    /// Handle for aborting an in-flight call from another thread.
    ///
    /// Keeps the instance alive even if the [`Plugin`] is dropped.
    pub fn cancel_handle(&self) -> CancelHandle {
        let handle = unsafe { (self.inner.api.plugin_cancel_handle)(self.inner.handle) };
        CancelHandle {
            handle,
            plugin: self.inner.clone(),
        }
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin").field("id", &self.id()).finish()
    }
}

/// Cancels the owning plugin's in-flight call.
pub struct CancelHandle {
    handle: *const sys::ExtismCancelHandle,
    plugin: Arc<PluginInner>,
}

// Safety: cancellation is the one operation the native runtime permits
// concurrently with a running call.
unsafe impl Send for CancelHandle {}
unsafe impl Sync for CancelHandle {}

impl CancelHandle {
    /// Request cancellation; returns whether the runtime accepted it.
    pub fn cancel(&self) -> bool {
        unsafe { (self.plugin.api.plugin_cancel)(self.handle) }
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle").finish_non_exhaustive()
    }
}

//! Raw ABI surface of the Extism shared library.
//!
//! Everything in this module mirrors the C contract one to one: value
//! layouts are `#[repr(C)]`, handles are opaque, and the [`Api`] struct
//! binds each exported symbol exactly once via `libloading`. Safe
//! wrappers live in the sibling modules; nothing here is exported from
//! the crate.

use std::ffi::{c_char, c_void};
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};

use crate::error::{Error, Result};

/// `ExtismSize` in the C header.
pub(crate) type Size = u64;

/// `ExtismMemoryHandle`: an offset into a plugin's linear memory.
pub(crate) type RawMemoryHandle = u64;

/// Payload of a native tagged value (`ExtismValUnion`).
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) union ExtismValUnion {
    pub i32_: i32,
    pub i64_: i64,
    pub f32_: f32,
    pub f64_: f64,
}

/// Native tagged value (`ExtismVal`). The tag is the C enum
/// `ExtismValType`, an `int` on every supported platform.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ExtismVal {
    pub t: i32,
    pub v: ExtismValUnion,
}

/// Opaque plugin instance handle.
#[repr(C)]
pub(crate) struct ExtismPlugin {
    _private: [u8; 0],
}

/// Opaque precompiled-plugin handle.
#[repr(C)]
pub(crate) struct ExtismCompiledPlugin {
    _private: [u8; 0],
}

/// Opaque handle to the plugin whose call is currently executing.
#[repr(C)]
pub(crate) struct ExtismCurrentPlugin {
    _private: [u8; 0],
}

/// Opaque host-function descriptor handle.
#[repr(C)]
pub(crate) struct ExtismFunction {
    _private: [u8; 0],
}

/// Opaque cooperative-cancellation handle.
#[repr(C)]
pub(crate) struct ExtismCancelHandle {
    _private: [u8; 0],
}

/// Trampoline signature the native runtime invokes for a registered
/// host function.
pub(crate) type ExtismFunctionType = unsafe extern "C" fn(
    plugin: *mut ExtismCurrentPlugin,
    inputs: *const ExtismVal,
    n_inputs: Size,
    outputs: *mut ExtismVal,
    n_outputs: Size,
    user_data: *mut c_void,
);

pub(crate) type FreeUserDataFn = unsafe extern "C" fn(*mut c_void);

type PluginNewFn = unsafe extern "C" fn(
    *const u8,
    Size,
    *const *const ExtismFunction,
    Size,
    bool,
    *mut *mut c_char,
) -> *mut ExtismPlugin;
type PluginNewWithFuelLimitFn = unsafe extern "C" fn(
    *const u8,
    Size,
    *const *const ExtismFunction,
    Size,
    bool,
    u64,
    *mut *mut c_char,
) -> *mut ExtismPlugin;
type CompiledPluginNewFn = unsafe extern "C" fn(
    *const u8,
    Size,
    *const *const ExtismFunction,
    Size,
    bool,
    *mut *mut c_char,
) -> *mut ExtismCompiledPlugin;
type PluginNewFromCompiledFn =
    unsafe extern "C" fn(*const ExtismCompiledPlugin, *mut *mut c_char) -> *mut ExtismPlugin;
type PluginNewErrorFreeFn = unsafe extern "C" fn(*mut c_char);
type PluginFreeFn = unsafe extern "C" fn(*mut ExtismPlugin);
type CompiledPluginFreeFn = unsafe extern "C" fn(*mut ExtismCompiledPlugin);
type PluginCallFn =
    unsafe extern "C" fn(*mut ExtismPlugin, *const c_char, *const u8, Size) -> i32;
type PluginCallWithHostContextFn =
    unsafe extern "C" fn(*mut ExtismPlugin, *const c_char, *const u8, Size, *mut c_void) -> i32;
type PluginErrorFn = unsafe extern "C" fn(*mut ExtismPlugin) -> *const c_char;
type PluginOutputLengthFn = unsafe extern "C" fn(*mut ExtismPlugin) -> Size;
type PluginOutputDataFn = unsafe extern "C" fn(*mut ExtismPlugin) -> *const u8;
type PluginFunctionExistsFn = unsafe extern "C" fn(*mut ExtismPlugin, *const c_char) -> bool;
type PluginResetFn = unsafe extern "C" fn(*mut ExtismPlugin) -> bool;
type PluginCancelHandleFn =
    unsafe extern "C" fn(*const ExtismPlugin) -> *const ExtismCancelHandle;
type PluginCancelFn = unsafe extern "C" fn(*const ExtismCancelHandle) -> bool;
type PluginConfigFn = unsafe extern "C" fn(*mut ExtismPlugin, *const u8, Size) -> bool;
type PluginIdFn = unsafe extern "C" fn(*mut ExtismPlugin) -> *const u8;
type PluginAllowHttpResponseHeadersFn = unsafe extern "C" fn(*mut ExtismPlugin);
type FunctionNewFn = unsafe extern "C" fn(
    *const c_char,
    *const i32,
    Size,
    *const i32,
    Size,
    ExtismFunctionType,
    *mut c_void,
    Option<FreeUserDataFn>,
) -> *mut ExtismFunction;
type FunctionFreeFn = unsafe extern "C" fn(*mut ExtismFunction);
type FunctionSetNamespaceFn = unsafe extern "C" fn(*mut ExtismFunction, *const c_char);
type CurrentPluginMemoryFn = unsafe extern "C" fn(*mut ExtismCurrentPlugin) -> *mut u8;
type CurrentPluginMemoryAllocFn =
    unsafe extern "C" fn(*mut ExtismCurrentPlugin, Size) -> RawMemoryHandle;
type CurrentPluginMemoryLengthFn =
    unsafe extern "C" fn(*mut ExtismCurrentPlugin, RawMemoryHandle) -> Size;
type CurrentPluginMemoryFreeFn =
    unsafe extern "C" fn(*mut ExtismCurrentPlugin, RawMemoryHandle);
type CurrentPluginHostContextFn =
    unsafe extern "C" fn(*mut ExtismCurrentPlugin) -> *mut c_void;
type LogFileFn = unsafe extern "C" fn(*const c_char, *const c_char) -> bool;
type VersionFn = unsafe extern "C" fn() -> *const c_char;

macro_rules! bind {
    ($lib:expr, $name:literal) => {
        unsafe { $lib.get(concat!($name, "\0").as_bytes()) }.map_err(|source| Error::Symbol {
            symbol: $name,
            source,
        })?
    };
}

/// Typed call surface over the shared library's exports.
///
/// The backing [`Library`] is leaked on open: the runtime handle is
/// process-wide state that the OS reclaims at process exit, so the
/// symbols may safely carry the `'static` lifetime.
#[derive(Debug)]
pub(crate) struct Api {
    pub plugin_new: Symbol<'static, PluginNewFn>,
    pub plugin_new_with_fuel_limit: Symbol<'static, PluginNewWithFuelLimitFn>,
    pub compiled_plugin_new: Symbol<'static, CompiledPluginNewFn>,
    pub plugin_new_from_compiled: Symbol<'static, PluginNewFromCompiledFn>,
    pub plugin_new_error_free: Symbol<'static, PluginNewErrorFreeFn>,
    pub plugin_free: Symbol<'static, PluginFreeFn>,
    pub compiled_plugin_free: Symbol<'static, CompiledPluginFreeFn>,
    pub plugin_call: Symbol<'static, PluginCallFn>,
    pub plugin_call_with_host_context: Symbol<'static, PluginCallWithHostContextFn>,
    pub plugin_error: Symbol<'static, PluginErrorFn>,
    pub plugin_output_length: Symbol<'static, PluginOutputLengthFn>,
    pub plugin_output_data: Symbol<'static, PluginOutputDataFn>,
    pub plugin_function_exists: Symbol<'static, PluginFunctionExistsFn>,
    pub plugin_reset: Symbol<'static, PluginResetFn>,
    pub plugin_cancel_handle: Symbol<'static, PluginCancelHandleFn>,
    pub plugin_cancel: Symbol<'static, PluginCancelFn>,
    pub plugin_config: Symbol<'static, PluginConfigFn>,
    pub plugin_id: Symbol<'static, PluginIdFn>,
    pub plugin_allow_http_response_headers: Symbol<'static, PluginAllowHttpResponseHeadersFn>,
    pub function_new: Symbol<'static, FunctionNewFn>,
    pub function_free: Symbol<'static, FunctionFreeFn>,
    pub function_set_namespace: Symbol<'static, FunctionSetNamespaceFn>,
    pub current_plugin_memory: Symbol<'static, CurrentPluginMemoryFn>,
    pub current_plugin_memory_alloc: Symbol<'static, CurrentPluginMemoryAllocFn>,
    pub current_plugin_memory_length: Symbol<'static, CurrentPluginMemoryLengthFn>,
    pub current_plugin_memory_free: Symbol<'static, CurrentPluginMemoryFreeFn>,
    pub current_plugin_host_context: Symbol<'static, CurrentPluginHostContextFn>,
    pub log_file: Symbol<'static, LogFileFn>,
    pub version: Symbol<'static, VersionFn>,
    path: PathBuf,
}

impl Api {
    /// Open the shared library at `path` and bind every export this
    /// binding consumes. Fails if the library cannot be opened or any
    /// required symbol is missing.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let library = unsafe { Library::new(path) }.map_err(|source| Error::LibraryOpen {
            path: path.display().to_string(),
            source,
        })?;
        let library: &'static Library = Box::leak(Box::new(library));

        Ok(Self {
            plugin_new: bind!(library, "extism_plugin_new"),
            plugin_new_with_fuel_limit: bind!(library, "extism_plugin_new_with_fuel_limit"),
            compiled_plugin_new: bind!(library, "extism_compiled_plugin_new"),
            plugin_new_from_compiled: bind!(library, "extism_plugin_new_from_compiled"),
            plugin_new_error_free: bind!(library, "extism_plugin_new_error_free"),
            plugin_free: bind!(library, "extism_plugin_free"),
            compiled_plugin_free: bind!(library, "extism_compiled_plugin_free"),
            plugin_call: bind!(library, "extism_plugin_call"),
            plugin_call_with_host_context: bind!(library, "extism_plugin_call_with_host_context"),
            plugin_error: bind!(library, "extism_error"),
            plugin_output_length: bind!(library, "extism_plugin_output_length"),
            plugin_output_data: bind!(library, "extism_plugin_output_data"),
            plugin_function_exists: bind!(library, "extism_plugin_function_exists"),
            plugin_reset: bind!(library, "extism_plugin_reset"),
            plugin_cancel_handle: bind!(library, "extism_plugin_cancel_handle"),
            plugin_cancel: bind!(library, "extism_plugin_cancel"),
            plugin_config: bind!(library, "extism_plugin_config"),
            plugin_id: bind!(library, "extism_plugin_id"),
            plugin_allow_http_response_headers: bind!(
                library,
                "extism_plugin_allow_http_response_headers"
            ),
            function_new: bind!(library, "extism_function_new"),
            function_free: bind!(library, "extism_function_free"),
            function_set_namespace: bind!(library, "extism_function_set_namespace"),
            current_plugin_memory: bind!(library, "extism_current_plugin_memory"),
            current_plugin_memory_alloc: bind!(library, "extism_current_plugin_memory_alloc"),
            current_plugin_memory_length: bind!(library, "extism_current_plugin_memory_length"),
            current_plugin_memory_free: bind!(library, "extism_current_plugin_memory_free"),
            current_plugin_host_context: bind!(library, "extism_current_plugin_host_context"),
            log_file: bind!(library, "extism_log_file"),
            version: bind!(library, "extism_version"),
            path: path.to_path_buf(),
        })
    }

    /// Path the library was loaded from.
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Read the plugin's last error string, if any.
    ///
    /// # Safety
    /// `plugin` must be a live handle returned by this library.
    pub(crate) unsafe fn last_error(&self, plugin: *mut ExtismPlugin) -> Option<String> {
        let ptr = unsafe { (self.plugin_error)(plugin) };
        if ptr.is_null() {
            return None;
        }
        let text = unsafe { std::ffi::CStr::from_ptr(ptr) };
        Some(text.to_string_lossy().into_owned())
    }
}

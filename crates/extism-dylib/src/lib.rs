//! Dynamic binding to the Extism native runtime.
//!
//! Loads `libextism` at runtime via `libloading` and exposes a safe,
//! handle-based API for running sandboxed wasm plugins: build a
//! [`Manifest`], instantiate a [`Plugin`] (optionally precompiled as a
//! [`CompiledPlugin`]), call its exports, and extend guests with
//! [`HostFunction`]s whose signatures are validated up front.
//!
//! ```no_run
//! use extism_dylib::{Manifest, PathWasmSource, Plugin, PluginOptions, Runtime};
//!
//! # fn main() -> extism_dylib::Result<()> {
//! let runtime = Runtime::load()?;
//! let manifest = Manifest::new(PathWasmSource::new("count_vowels.wasm")?);
//! let mut plugin = Plugin::new(&runtime, &manifest, vec![], PluginOptions::new())?;
//! let output = plugin.call("count_vowels", "Hello, world!")?;
//! println!("{}", String::from_utf8_lossy(&output));
//! # Ok(())
//! # }
//! ```

mod compiled;
mod current;
mod error;
mod host;
mod manifest;
mod memory;
mod plugin;
mod runtime;
mod sys;
mod values;

pub use compiled::CompiledPlugin;
pub use current::CurrentPlugin;
pub use error::{Error, Result};
pub use host::{DEFAULT_NAMESPACE, HostFunction, HostOutput, HostValue, ParamKind};
pub use manifest::{
    DataWasmSource, HttpMethod, Manifest, MemoryOptions, PathWasmSource, UrlWasmSource, WasmSource,
};
pub use memory::{MemoryArena, MemoryHandle};
pub use plugin::{CancelHandle, Plugin, PluginOptions};
pub use runtime::{LIBRARY_DIR_ENV, Runtime};
pub use values::{Val, ValType};

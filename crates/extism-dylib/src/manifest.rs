//! Plugin manifest and its canonical JSON encoding.
//!
//! The manifest describes the wasm sources a plugin is built from and
//! the runtime constraints applied to it (memory, allowed hosts and
//! paths, config values, call timeout). It is pure data: the native
//! runtime consumes the JSON produced by [`Manifest::to_json`].

use std::collections::BTreeMap;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// HTTP method for a URL wasm source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

/// A wasm source loaded from a file on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathWasmSource {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl PathWasmSource {
    /// Create a source from a file path. The path is canonicalized and
    /// must exist; the logical name defaults to the file stem.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let resolved = std::fs::canonicalize(path).map_err(|_| Error::PluginLoad {
            message: format!("path not found: '{}'", path.display()),
        })?;
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned());
        Ok(Self {
            path: resolved.display().to_string(),
            name,
            hash: None,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }
}

/// A wasm source fetched from a URL by the native runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlWasmSource {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<HttpMethod>,
}

impl UrlWasmSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: None,
            hash: None,
            headers: BTreeMap::new(),
            method: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }
}

/// A wasm source carried inline as raw bytes, base64-encoded on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataWasmSource {
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl DataWasmSource {
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        Self {
            data: BASE64.encode(bytes.as_ref()),
            name: None,
            hash: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }
}

/// One entry of the manifest's `wasm` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WasmSource {
    Path(PathWasmSource),
    Url(UrlWasmSource),
    Data(DataWasmSource),
}

impl From<PathWasmSource> for WasmSource {
    fn from(source: PathWasmSource) -> Self {
        WasmSource::Path(source)
    }
}

impl From<UrlWasmSource> for WasmSource {
    fn from(source: UrlWasmSource) -> Self {
        WasmSource::Url(source)
    }
}

impl From<DataWasmSource> for WasmSource {
    fn from(source: DataWasmSource) -> Self {
        WasmSource::Data(source)
    }
}

/// Memory constraints for the wasm runtime, in 64 KB pages and bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_http_response_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_var_bytes: Option<u64>,
}

impl MemoryOptions {
    fn is_unset(&self) -> bool {
        *self == Self::default()
    }
}

/// Blueprint for a plugin: wasm sources plus runtime constraints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub wasm: Vec<WasmSource>,
    #[serde(skip_serializing_if = "MemoryOptions::is_unset", default)]
    pub memory: MemoryOptions,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub allowed_hosts: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub allowed_paths: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub config: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Manifest {
    /// Create a manifest from a single wasm source.
    pub fn new(source: impl Into<WasmSource>) -> Self {
        Self {
            wasm: vec![source.into()],
            ..Self::default()
        }
    }

    /// Create a manifest from an in-memory wasm binary.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        Self::new(DataWasmSource::new(bytes))
    }

    pub fn with_source(mut self, source: impl Into<WasmSource>) -> Self {
        self.wasm.push(source.into());
        self
    }

    pub fn with_memory_options(mut self, memory: MemoryOptions) -> Self {
        self.memory = memory;
        self
    }

    /// Cap the plugin's linear memory, in 64 KB pages.
    pub fn with_memory_max_pages(mut self, pages: u32) -> Self {
        self.memory.max_pages = Some(pages);
        self
    }

    pub fn with_allowed_host(mut self, pattern: impl Into<String>) -> Self {
        self.allowed_hosts.push(pattern.into());
        self
    }

    pub fn with_allowed_path(mut self, src: impl Into<String>, dest: impl Into<String>) -> Self {
        self.allowed_paths.insert(src.into(), dest.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Wall-clock bound on each call, enforced by the native runtime.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Encode to the canonical JSON the native runtime consumes.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::PluginLoad {
            message: format!("failed to encode manifest: {e}"),
        })
    }
}

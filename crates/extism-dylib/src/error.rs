//! Error types for the binding layer.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the binding layer.
///
/// Native diagnostics are carried verbatim in the message fields; the
/// native runtime owns their wording (timeouts, fuel exhaustion, traps).
#[derive(Debug, Error)]
pub enum Error {
    /// The native shared library could not be located on any search path.
    /// Not retryable without fixing the environment.
    #[error("failed to locate the extism shared library; searched: {}", searched.join(", "))]
    Load { searched: Vec<String> },

    /// The current platform has no known shared library name.
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// The shared library exists but could not be opened.
    #[error("failed to open native library {path}: {source}")]
    LibraryOpen {
        path: String,
        #[source]
        source: libloading::Error,
    },

    /// A required export is missing from the shared library.
    #[error("failed to bind native symbol `{symbol}`: {source}")]
    Symbol {
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },

    /// Manifest encoding or native compile/instantiate failure. The
    /// manifest may be corrected and retried.
    #[error("unable to load plugin: {message}")]
    PluginLoad { message: String },

    /// A call into a plugin export failed, either with a nonzero native
    /// status or because a host function reported an error during the call.
    #[error("call to `{function}` failed: {message}")]
    Call { function: String, message: String },

    /// A host function's declared parameters disagree with its wasm
    /// signature. Raised at registration time only.
    #[error("invalid host function signature: {0}")]
    ArgumentValidation(String),

    /// A value kind this bridge cannot marshal was encountered.
    #[error("unsupported value type: {0}")]
    UnsupportedType(String),

    /// A plugin linear-memory operation failed.
    #[error("plugin memory error: {0}")]
    Memory(String),

    /// The call host context could not be encoded or decoded.
    #[error("host context error: {0}")]
    HostContext(String),

    /// The native runtime rejected a log-routing request.
    #[error("failed to configure native logging: {0}")]
    Logging(String),
}

impl Error {
    /// Native diagnostic text for load/call errors, when present.
    pub fn native_message(&self) -> Option<&str> {
        match self {
            Error::PluginLoad { message } | Error::Call { message, .. } => Some(message),
            _ => None,
        }
    }
}

//! Host function bridge.
//!
//! Wraps a host callback as a native-callable function descriptor.
//! Signatures are validated declaratively at registration via
//! [`ParamKind`] descriptors; at invocation time the bridge marshals
//! native values into [`HostValue`]s (dereferencing declared string
//! offsets through the plugin's memory) and the callback's
//! [`HostOutput`] back into the declared output slot.
//!
//! Boundary safety contract: nothing unwinds across the `extern "C"`
//! trampoline. Callback errors and panics are caught, logged, recorded
//! in the descriptor's per-thread failure slot, and the declared
//! outputs are zeroed so the native call completes deterministically.
//! The owning [`Plugin`](crate::Plugin) drains its thread's slot after
//! every call and surfaces it as [`Error::Call`].

use std::collections::HashMap;
use std::ffi::{CString, c_void};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::current::CurrentPlugin;
use crate::error::{Error, Result};
use crate::memory::{MemoryArena, MemoryHandle};
use crate::runtime::Runtime;
use crate::sys;
use crate::values::{Val, ValType, write_to_slot, zero_slot};

/// Namespace plugins import host functions from unless overridden.
pub const DEFAULT_NAMESPACE: &str = "extism:host/user";

/// Declared kind of one callback parameter.
///
/// This replaces any runtime probing of the callback: whether an `i64`
/// input is a raw integer or a memory-block offset to dereference is
/// stated here explicitly, and mismatches fail at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// The current-plugin accessor. Only legal in the leading position;
    /// carried implicitly by the callback's first argument rather than
    /// consuming an input slot.
    Context,
    /// A raw integer; pairs with `I32` or `I64` inputs.
    Integer,
    /// A raw float; pairs with `F32` or `F64` inputs.
    Float,
    /// An `I64` input interpreted as a memory-block offset; the block's
    /// bytes are read and passed instead of the raw value.
    StringOffset,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::Context => write!(f, "context"),
            ParamKind::Integer => write!(f, "integer"),
            ParamKind::Float => write!(f, "float"),
            ParamKind::StringOffset => write!(f, "string-offset"),
        }
    }
}

/// A marshaled argument as seen by a host callback.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    /// The dereferenced contents of a declared string offset.
    Bytes(Vec<u8>),
}

impl HostValue {
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            HostValue::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HostValue::I32(v) => Some(*v as i64),
            HostValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            HostValue::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::F32(v) => Some(*v as f64),
            HostValue::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            HostValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Bytes interpreted as UTF-8, when this is a dereferenced block.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }
}

/// Result a host callback hands back to the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum HostOutput {
    /// No result; the declared output slot, if any, is zeroed.
    None,
    /// A numeric result written directly into the output slot.
    Value(Val),
    /// Bytes written into a freshly allocated memory block whose offset
    /// becomes the output.
    Bytes(Vec<u8>),
}

impl From<()> for HostOutput {
    fn from(_: ()) -> Self {
        HostOutput::None
    }
}

impl From<Val> for HostOutput {
    fn from(v: Val) -> Self {
        HostOutput::Value(v)
    }
}

impl From<i32> for HostOutput {
    fn from(v: i32) -> Self {
        HostOutput::Value(Val::I32(v))
    }
}

impl From<i64> for HostOutput {
    fn from(v: i64) -> Self {
        HostOutput::Value(Val::I64(v))
    }
}

impl From<f32> for HostOutput {
    fn from(v: f32) -> Self {
        HostOutput::Value(Val::F32(v))
    }
}

impl From<f64> for HostOutput {
    fn from(v: f64) -> Self {
        HostOutput::Value(Val::F64(v))
    }
}

impl From<Vec<u8>> for HostOutput {
    fn from(v: Vec<u8>) -> Self {
        HostOutput::Bytes(v)
    }
}

impl From<&[u8]> for HostOutput {
    fn from(v: &[u8]) -> Self {
        HostOutput::Bytes(v.to_vec())
    }
}

impl From<String> for HostOutput {
    fn from(v: String) -> Self {
        HostOutput::Bytes(v.into_bytes())
    }
}

impl From<&str> for HostOutput {
    fn from(v: &str) -> Self {
        HostOutput::Bytes(v.as_bytes().to_vec())
    }
}

/// Callback signature for host functions. Executes synchronously on
/// the thread running the plugin call; must not re-enter `call()` on
/// the same plugin instance.
pub type HostFunctionCallback =
    dyn Fn(&mut CurrentPlugin<'_>, &[HostValue]) -> Result<HostOutput> + Send + Sync;

/// Check a declarative signature at registration time.
///
/// Returns whether the leading parameter is the context accessor.
fn validate_signature(
    name: &str,
    params: &[ParamKind],
    inputs: &[ValType],
    outputs: &[ValType],
) -> Result<bool> {
    let context = matches!(params.first(), Some(ParamKind::Context));
    let value_params = if context { &params[1..] } else { params };

    if value_params.contains(&ParamKind::Context) {
        return Err(Error::ArgumentValidation(format!(
            "{name}: a context parameter is only allowed in the leading position"
        )));
    }
    if value_params.len() != inputs.len() {
        return Err(Error::ArgumentValidation(format!(
            "{name}: {} value parameter(s) declared for {} input type(s)",
            value_params.len(),
            inputs.len()
        )));
    }

    for (position, (param, ty)) in value_params.iter().zip(inputs).enumerate() {
        if !ty.is_numeric() {
            return Err(Error::ArgumentValidation(format!(
                "{name}: input #{position} has unsupported type {ty}"
            )));
        }
        let compatible = match param {
            ParamKind::Integer => matches!(ty, ValType::I32 | ValType::I64),
            ParamKind::StringOffset => matches!(ty, ValType::I64),
            ParamKind::Float => matches!(ty, ValType::F32 | ValType::F64),
            ParamKind::Context => unreachable!("rejected above"),
        };
        if !compatible {
            return Err(Error::ArgumentValidation(format!(
                "{name}: parameter #{position} is declared {param} but the input type is {ty}"
            )));
        }
    }

    match outputs {
        [] => {}
        [ty] if ty.is_numeric() => {}
        [ty] => {
            return Err(Error::ArgumentValidation(format!(
                "{name}: output has unsupported type {ty}"
            )));
        }
        _ => {
            return Err(Error::ArgumentValidation(format!(
                "{name}: at most one output may be declared, got {}",
                outputs.len()
            )));
        }
    }

    Ok(context)
}

/// Convert native input values into callback arguments, dereferencing
/// declared string offsets through the arena. `params` excludes any
/// leading context descriptor.
fn marshal_inputs(
    params: &[ParamKind],
    inputs: &[sys::ExtismVal],
    arena: &mut dyn MemoryArena,
) -> Result<Vec<HostValue>> {
    if params.len() != inputs.len() {
        return Err(Error::UnsupportedType(format!(
            "native supplied {} input(s) for {} declared parameter(s)",
            inputs.len(),
            params.len()
        )));
    }

    let mut args = Vec::with_capacity(inputs.len());
    for (position, (param, raw)) in params.iter().zip(inputs).enumerate() {
        let value = Val::from_raw(raw)?;
        let arg = match (param, value) {
            (ParamKind::StringOffset, Val::I64(offset)) => {
                HostValue::Bytes(arena.read_block(MemoryHandle(offset as u64))?)
            }
            (ParamKind::Integer, Val::I32(v)) => HostValue::I32(v),
            (ParamKind::Integer, Val::I64(v)) => HostValue::I64(v),
            (ParamKind::Float, Val::F32(v)) => HostValue::F32(v),
            (ParamKind::Float, Val::F64(v)) => HostValue::F64(v),
            (param, value) => {
                return Err(Error::UnsupportedType(format!(
                    "input #{position}: {} value for {param} parameter",
                    value.ty()
                )));
            }
        };
        args.push(arg);
    }
    Ok(args)
}

/// Write the callback's result into the declared output slots.
fn marshal_output(
    output: HostOutput,
    slots: &mut [sys::ExtismVal],
    arena: &mut dyn MemoryArena,
) -> Result<()> {
    match slots {
        [] => Ok(()),
        [slot] => match output {
            HostOutput::None => {
                zero_slot(slot);
                Ok(())
            }
            HostOutput::Value(value) => write_to_slot(value, slot),
            HostOutput::Bytes(bytes) => {
                let handle = arena.write_block(&bytes)?;
                write_to_slot(Val::I64(handle.offset() as i64), slot)
            }
        },
        _ => Err(Error::UnsupportedType(format!(
            "cannot marshal a result into {} output slots",
            slots.len()
        ))),
    }
}

/// Per-thread failure capture for one host function descriptor.
///
/// One descriptor can serve concurrent calls when several instances of
/// a compiled plugin share it; callbacks run synchronously on the
/// thread driving the call, so keying by thread id keeps each call's
/// failure visible only to the thread that will drain it.
#[derive(Default)]
pub(crate) struct FailureSlot {
    slots: Mutex<HashMap<ThreadId, String>>,
}

impl FailureSlot {
    fn record(&self, message: String) {
        self.slots.lock().insert(thread::current().id(), message);
    }

    /// Take the failure recorded on the current thread, if any.
    pub(crate) fn take(&self) -> Option<String> {
        self.slots.lock().remove(&thread::current().id())
    }
}

struct HostFunctionState {
    name: String,
    /// Parameter descriptors with any leading context stripped.
    value_params: Vec<ParamKind>,
    callback: Box<HostFunctionCallback>,
    api: Arc<sys::Api>,
    failure: Arc<FailureSlot>,
}

fn run_callback(
    state: &HostFunctionState,
    plugin: *mut sys::ExtismCurrentPlugin,
    inputs: &[sys::ExtismVal],
    outputs: &mut [sys::ExtismVal],
) -> Result<()> {
    let mut current = CurrentPlugin::new(&state.api, plugin);
    let args = marshal_inputs(&state.value_params, inputs, &mut current)?;
    let output = (state.callback)(&mut current, &args)?;
    marshal_output(output, outputs, &mut current)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "host function panicked".to_string()
    }
}

/// Entry point the native runtime calls. Never unwinds.
unsafe extern "C" fn dispatch(
    plugin: *mut sys::ExtismCurrentPlugin,
    inputs: *const sys::ExtismVal,
    n_inputs: sys::Size,
    outputs: *mut sys::ExtismVal,
    n_outputs: sys::Size,
    user_data: *mut c_void,
) {
    // Safety: user_data is the Box<HostFunctionState> registered with
    // this descriptor; the runtime frees it via `release_state` only
    // after the descriptor itself is freed.
    let state = unsafe { &*(user_data as *const HostFunctionState) };

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let inputs = if inputs.is_null() {
            &[][..]
        } else {
            unsafe { std::slice::from_raw_parts(inputs, n_inputs as usize) }
        };
        let outputs = if outputs.is_null() {
            &mut [][..]
        } else {
            unsafe { std::slice::from_raw_parts_mut(outputs, n_outputs as usize) }
        };
        run_callback(state, plugin, inputs, outputs)
    }));

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err.to_string()),
        Err(payload) => Some(panic_message(payload)),
    };

    if let Some(message) = failure {
        tracing::error!(
            function = %state.name,
            %message,
            "host function failed; completing native call with zeroed outputs"
        );
        if !outputs.is_null() {
            let outputs = unsafe { std::slice::from_raw_parts_mut(outputs, n_outputs as usize) };
            for slot in outputs.iter_mut() {
                zero_slot(slot);
            }
        }
        state.failure.record(message);
    }
}

unsafe extern "C" fn release_state(user_data: *mut c_void) {
    if !user_data.is_null() {
        // Safety: created by Box::into_raw in HostFunction::new; the
        // runtime calls this exactly once, when the descriptor is freed.
        drop(unsafe { Box::from_raw(user_data as *mut HostFunctionState) });
    }
}

/// A host function registered into plugins' import tables.
///
/// Owns the native descriptor and the callback state; dropping it
/// releases both. Plugins built with this function keep it alive for
/// their whole lifetime.
pub struct HostFunction {
    name: String,
    handle: *mut sys::ExtismFunction,
    failure: Arc<FailureSlot>,
    api: Arc<sys::Api>,
}

// Safety: the native descriptor is immutable after registration apart
// from set_namespace, which takes &mut self; the callback state is
// Send + Sync by construction.
unsafe impl Send for HostFunction {}
unsafe impl Sync for HostFunction {}

impl HostFunction {
    /// Register a host function with the native runtime.
    ///
    /// `params` describes the callback's view of the wasm `inputs`:
    /// an optional leading [`ParamKind::Context`], then one descriptor
    /// per input slot. Any disagreement between the two fails here with
    /// [`Error::ArgumentValidation`]; invocation never re-validates.
    ///
    /// The function is registered under [`DEFAULT_NAMESPACE`]; call
    /// [`set_namespace`](Self::set_namespace) before constructing the
    /// owning plugin to override.
    pub fn new(
        runtime: &Runtime,
        name: &str,
        inputs: &[ValType],
        outputs: &[ValType],
        params: &[ParamKind],
        callback: impl Fn(&mut CurrentPlugin<'_>, &[HostValue]) -> Result<HostOutput>
        + Send
        + Sync
        + 'static,
    ) -> Result<Self> {
        let context = validate_signature(name, params, inputs, outputs)?;
        let value_params = params[usize::from(context)..].to_vec();

        let c_name = CString::new(name).map_err(|_| {
            Error::ArgumentValidation(format!("{name:?}: name contains a nul byte"))
        })?;
        let api = runtime.api().clone();
        let failure = Arc::new(FailureSlot::default());
        let state = Box::new(HostFunctionState {
            name: name.to_string(),
            value_params,
            callback: Box::new(callback),
            api: api.clone(),
            failure: failure.clone(),
        });

        let raw_inputs: Vec<i32> = inputs.iter().map(|t| t.to_raw()).collect();
        let raw_outputs: Vec<i32> = outputs.iter().map(|t| t.to_raw()).collect();
        let user_data = Box::into_raw(state) as *mut c_void;

        let handle = unsafe {
            (api.function_new)(
                c_name.as_ptr(),
                raw_inputs.as_ptr(),
                raw_inputs.len() as sys::Size,
                raw_outputs.as_ptr(),
                raw_outputs.len() as sys::Size,
                dispatch,
                user_data,
                Some(release_state),
            )
        };
        if handle.is_null() {
            // the runtime never took ownership of the state
            unsafe { release_state(user_data) };
            return Err(Error::ArgumentValidation(format!(
                "{name}: native runtime rejected the function descriptor"
            )));
        }

        tracing::debug!(function = name, "registered host function");

        let mut function = Self {
            name: name.to_string(),
            handle,
            failure,
            api,
        };
        function.set_namespace(DEFAULT_NAMESPACE)?;
        Ok(function)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Override the import namespace. Takes effect for plugins
    /// constructed after this call.
    pub fn set_namespace(&mut self, namespace: &str) -> Result<()> {
        let c_namespace = CString::new(namespace).map_err(|_| {
            Error::ArgumentValidation(format!("namespace {namespace:?} contains a nul byte"))
        })?;
        unsafe { (self.api.function_set_namespace)(self.handle, c_namespace.as_ptr()) };
        Ok(())
    }

    pub(crate) fn raw(&self) -> *const sys::ExtismFunction {
        self.handle
    }

    /// Take the failure recorded by an invocation on this thread, if
    /// any. Failures recorded by other threads' calls are untouched.
    pub(crate) fn take_failure(&self) -> Option<String> {
        self.failure.take()
    }
}

impl Drop for HostFunction {
    fn drop(&mut self) {
        unsafe { (self.api.function_free)(self.handle) };
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

//! Access to the plugin whose call is currently executing.

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::memory::{MemoryArena, MemoryHandle};
use crate::sys;

/// Borrowed view of the plugin that is calling the running host
/// function.
///
/// Only valid for the duration of that call: the native handle it wraps
/// is owned by the runtime's call frame, which is why instances are
/// created by the bridge and handed to callbacks by reference. All
/// memory tokens obtained through it share that scope.
pub struct CurrentPlugin<'a> {
    handle: *mut sys::ExtismCurrentPlugin,
    api: &'a sys::Api,
}

impl<'a> CurrentPlugin<'a> {
    pub(crate) fn new(api: &'a sys::Api, handle: *mut sys::ExtismCurrentPlugin) -> Self {
        Self { handle, api }
    }

    /// A deep copy of the host context attached to the enclosing call,
    /// or `None` when the call was made without one.
    ///
    /// The caller's original value is serialized once per call; each
    /// retrieval decodes a fresh copy, so mutations here never reach
    /// the caller.
    pub fn host_context<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let ptr = unsafe { (self.api.current_plugin_host_context)(self.handle) };
        if ptr.is_null() {
            return Ok(None);
        }
        // Safety: the pointer is the serialized payload installed by
        // `Plugin::call_with_host_context`, alive for the whole call.
        let payload = unsafe { &*(ptr as *const Vec<u8>) };
        serde_json::from_slice(payload)
            .map(Some)
            .map_err(|e| Error::HostContext(format!("failed to decode payload: {e}")))
    }

    fn memory_base(&self) -> Result<*mut u8> {
        let base = unsafe { (self.api.current_plugin_memory)(self.handle) };
        if base.is_null() {
            return Err(Error::Memory("plugin memory is not mapped".to_string()));
        }
        Ok(base)
    }

    /// Length recorded by the runtime for the block at `handle`; 0 for
    /// offsets that never came from an allocation.
    pub fn block_length(&self, handle: MemoryHandle) -> u64 {
        unsafe { (self.api.current_plugin_memory_length)(self.handle, handle.0) }
    }
}

impl MemoryArena for CurrentPlugin<'_> {
    fn read_block(&mut self, handle: MemoryHandle) -> Result<Vec<u8>> {
        let len = self.block_length(handle);
        if len == 0 {
            return Ok(Vec::new());
        }
        let base = self.memory_base()?;
        // Safety: the runtime vouches for `len` bytes at this offset.
        let bytes =
            unsafe { std::slice::from_raw_parts(base.add(handle.0 as usize), len as usize) };
        Ok(bytes.to_vec())
    }

    fn allocate_block(&mut self, size: u64) -> Result<MemoryHandle> {
        let offset = unsafe { (self.api.current_plugin_memory_alloc)(self.handle, size) };
        if offset == 0 && size > 0 {
            return Err(Error::Memory(format!("failed to allocate {size} bytes")));
        }
        Ok(MemoryHandle(offset))
    }

    fn fill_block(&mut self, handle: MemoryHandle, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let len = self.block_length(handle);
        if (data.len() as u64) > len {
            return Err(Error::Memory(format!(
                "write of {} bytes into {len}-byte block",
                data.len()
            )));
        }
        let base = self.memory_base()?;
        // Safety: bounds checked against the runtime's recorded length.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                base.add(handle.0 as usize),
                data.len(),
            );
        }
        Ok(())
    }

    fn free_block(&mut self, handle: MemoryHandle) -> Result<()> {
        unsafe { (self.api.current_plugin_memory_free)(self.handle, handle.0) };
        Ok(())
    }
}

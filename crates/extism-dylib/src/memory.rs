//! Linear-memory access for plugin instances.
//!
//! A plugin's sandboxed memory is treated as an opaque arena: the only
//! valid keys into it are [`MemoryHandle`] tokens returned by allocate
//! and write operations. Tokens are scoped to the instance that issued
//! them and become invalid once that instance is reset or freed; they
//! are never raw addresses.

use crate::error::Result;

/// Opaque token for a block in a plugin's linear memory.
///
/// Only meaningful to the [`MemoryArena`] that issued it, and only
/// until that arena's instance is reset or freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryHandle(pub(crate) u64);

impl MemoryHandle {
    /// Raw offset value, as passed across the native ABI.
    pub fn offset(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for MemoryHandle {
    fn from(offset: u64) -> Self {
        Self(offset)
    }
}

/// Offset-based block operations on a plugin's linear memory.
///
/// Implemented by [`CurrentPlugin`](crate::CurrentPlugin) over the
/// native runtime; the trait seam keeps the host-function marshaling
/// logic testable against an in-memory arena.
pub trait MemoryArena {
    /// Read the full block at `handle`. The block length is recorded by
    /// the arena; exactly that many bytes are returned.
    fn read_block(&mut self, handle: MemoryHandle) -> Result<Vec<u8>>;

    /// Allocate a fresh block of `size` bytes.
    fn allocate_block(&mut self, size: u64) -> Result<MemoryHandle>;

    /// Overwrite the block at `handle` with `data`. The block must be
    /// at least `data.len()` bytes long.
    fn fill_block(&mut self, handle: MemoryHandle, data: &[u8]) -> Result<()>;

    /// Release a previously allocated block.
    fn free_block(&mut self, handle: MemoryHandle) -> Result<()>;

    /// Allocate a block sized for `data` and fill it, returning the new
    /// block's token.
    fn write_block(&mut self, data: &[u8]) -> Result<MemoryHandle> {
        let handle = self.allocate_block(data.len() as u64)?;
        self.fill_block(handle, data)?;
        Ok(handle)
    }
}

use log::debug;
use memmap2::{Mmap, MmapMut};

use super::asm::CodeSink;
use crate::error::ExprError;

/// Writable code buffer in anonymous mapped memory. Grows by doubling.
pub struct CodeBuffer {
    map: MmapMut,
    len: usize,
}

impl CodeBuffer {
    pub fn with_capacity(capacity: usize) -> Result<Self, ExprError> {
        let map = MmapMut::map_anon(capacity.max(16)).map_err(|e| {
            debug!("code buffer allocation of {} bytes failed: {}", capacity, e);
            ExprError::AllocFailed
        })?;
        Ok(Self { map, len: 0 })
    }

    pub fn capacity(&self) -> usize {
        self.map.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map[..self.len]
    }

    fn reserve(&mut self, extra: usize) -> Result<(), ExprError> {
        let needed = self.len + extra;
        if needed <= self.map.len() {
            return Ok(());
        }
        let mut capacity = self.map.len();
        while capacity < needed {
            capacity *= 2;
        }
        let mut grown = MmapMut::map_anon(capacity).map_err(|e| {
            debug!("code buffer growth to {} bytes failed: {}", capacity, e);
            ExprError::AllocFailed
        })?;
        grown[..self.len].copy_from_slice(&self.map[..self.len]);
        debug!("code buffer grew {} -> {} bytes", self.map.len(), capacity);
        self.map = grown;
        Ok(())
    }

    /// Turns the buffer executable. The mapping keeps its address.
    pub fn finalize(self) -> Result<ExecBuffer, ExprError> {
        let len = self.len;
        let map = self.map.make_exec().map_err(|e| {
            debug!("making code executable failed: {}", e);
            ExprError::AllocFailed
        })?;
        Ok(ExecBuffer { map, len })
    }
}

impl CodeSink for CodeBuffer {
    fn put(&mut self, bytes: &[u8]) -> Result<(), ExprError> {
        self.reserve(bytes.len())?;
        self.map[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }

    fn offset(&self) -> usize {
        self.len
    }

    fn patch(&mut self, at: usize, bytes: &[u8]) {
        if at + bytes.len() <= self.len {
            self.map[at..at + bytes.len()].copy_from_slice(bytes);
        }
    }
}

/// Read-only executable mapping holding finished code.
pub struct ExecBuffer {
    map: Mmap,
    len: usize,
}

impl ExecBuffer {
    pub fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map[..self.len]
    }
}

impl std::fmt::Debug for ExecBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecBuffer")
            .field("addr", &self.map.as_ptr())
            .field("len", &self.len)
            .finish()
    }
}

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Owned, tagged byte slabs.

use crate::{Buffer, MemoryKind};

/// A single owned slab with a declared memory kind.
///
/// This is the storage behind warmup data, null-request padding, and
/// response outputs. The slab is zero-initialized on creation; callers
/// write through [`AllocatedMemory::mutable_buffer`].
pub struct AllocatedMemory {
    data: Vec<u8>,
    kind: MemoryKind,
    memory_id: i64,
}

impl AllocatedMemory {
    /// Allocates a zeroed slab of `byte_size` bytes.
    pub fn new(byte_size: usize, kind: MemoryKind, memory_id: i64) -> Self {
        Self {
            data: vec![0u8; byte_size],
            kind,
            memory_id,
        }
    }

    /// Wraps an existing byte vector without copying.
    pub fn from_vec(data: Vec<u8>, kind: MemoryKind, memory_id: i64) -> Self {
        Self {
            data,
            kind,
            memory_id,
        }
    }

    /// Returns the slab size in bytes.
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    /// Returns the memory kind tag.
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    /// Returns the device id (0 for host kinds).
    pub fn memory_id(&self) -> i64 {
        self.memory_id
    }

    /// Returns a raw pointer to the start of the slab.
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    /// Returns the slab contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Returns the slab for writing.
    pub fn mutable_buffer(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Returns the slab as a [`Buffer`] view. Only index 0 exists.
    pub fn buffer_at(&self, idx: usize) -> Option<Buffer> {
        if idx != 0 {
            return None;
        }
        Some(Buffer {
            ptr: self.data.as_ptr(),
            byte_size: self.data.len(),
            kind: self.kind,
            memory_id: self.memory_id,
        })
    }
}

impl std::fmt::Debug for AllocatedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatedMemory")
            .field("byte_size", &self.data.len())
            .field("kind", &self.kind)
            .field("memory_id", &self.memory_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zeroed() {
        let m = AllocatedMemory::new(32, MemoryKind::Host, 0);
        assert_eq!(m.byte_size(), 32);
        assert!(m.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_then_read() {
        let mut m = AllocatedMemory::new(4, MemoryKind::HostPinned, 0);
        m.mutable_buffer().copy_from_slice(&[9, 8, 7, 6]);
        assert_eq!(m.as_slice(), &[9, 8, 7, 6]);
        assert_eq!(m.kind(), MemoryKind::HostPinned);
    }

    #[test]
    fn test_from_vec() {
        let m = AllocatedMemory::from_vec(vec![1, 2, 3], MemoryKind::Host, 0);
        assert_eq!(m.byte_size(), 3);
        assert_eq!(m.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_single_buffer_view() {
        let m = AllocatedMemory::new(8, MemoryKind::Device, 2);
        let b = m.buffer_at(0).unwrap();
        assert_eq!(b.byte_size, 8);
        assert_eq!(b.kind, MemoryKind::Device);
        assert_eq!(b.memory_id, 2);
        assert!(m.buffer_at(1).is_none());
    }
}

// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Memory-kind tags and the raw buffer view.

/// Where a buffer lives.
///
/// The runtime itself only ever allocates host memory; `HostPinned` and
/// `Device` are tags that travel with the buffer so the compute backend
/// can pick the right transfer path. Device buffers additionally carry a
/// 64-bit `memory_id` identifying the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Plain pageable host memory.
    Host,
    /// Page-locked host memory.
    HostPinned,
    /// Device-resident memory.
    Device,
}

impl MemoryKind {
    /// Returns a short label for logs and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryKind::Host => "host",
            MemoryKind::HostPinned => "host-pinned",
            MemoryKind::Device => "device",
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw view of one contiguous buffer: pointer, length, and location.
///
/// `Buffer` does not own the bytes it points at. The appending side
/// guarantees the backing memory outlives every request holding the view;
/// dereferencing is therefore gated behind the `unsafe` [`Buffer::as_slice`].
#[derive(Debug, Clone, Copy)]
pub struct Buffer {
    /// Start of the buffer. May dangle once the owner frees it.
    pub ptr: *const u8,
    /// Length in bytes.
    pub byte_size: usize,
    /// Location tag.
    pub kind: MemoryKind,
    /// Device id for `Device` buffers, 0 otherwise.
    pub memory_id: i64,
}

impl Buffer {
    /// Reinterprets the view as a byte slice.
    ///
    /// # Safety
    /// The caller must ensure the backing memory is still live, points at
    /// `byte_size` readable bytes, and is host-accessible.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.byte_size)
    }
}

// Buffers cross from scheduler threads to backend threads. The pointer is
// only dereferenced under the liveness contract stated above.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

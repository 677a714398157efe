/*
 * SPDX-FileCopyrightText: 2024-2025 dhtbsign developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::path::Path;

pub const ZEROS: [u8; 16384] = [0u8; 16384];

/// Reverse the byte order of a 16-bit word.
///
/// The vbmeta header and chain descriptor records store every multi-byte
/// integer most-significant-byte-first, while the codec in
/// [`crate::format::vbmeta`] performs a naive little-endian fixed-layout
/// read. Callers apply these helpers to exactly the fields they consume
/// arithmetically and leave reserved/opaque fields untouched so that
/// re-encoding round-trips them bit-for-bit. The boot image header is
/// natively little-endian and needs no correction.
///
/// Fields that require a swap:
/// - `RawHeader::authentication_data_block_size` (64-bit)
/// - `RawHeader::algorithm_type` (32-bit)
/// - `RawChainDescriptor::tag` (64-bit, only when displayed)
/// - `RawChainDescriptor::rollback_index_location` (32-bit)
/// - `RawChainDescriptor::partition_name_len` (32-bit)
/// - `RawChainDescriptor::public_key_len` (32-bit)
#[inline]
pub fn swap_bytes_16(value: u16) -> u16 {
    value.swap_bytes()
}

/// Reverse the byte order of a 32-bit word. See [`swap_bytes_16`].
#[inline]
pub fn swap_bytes_32(value: u32) -> u32 {
    value.swap_bytes()
}

/// Reverse the byte order of a 64-bit word. See [`swap_bytes_16`].
#[inline]
pub fn swap_bytes_64(value: u64) -> u64 {
    value.swap_bytes()
}

/// Get the non-empty parent of a path. If the path has no parent in the string,
/// then `.` is returned. This does not perform any filesystem operations.
pub fn parent_path(path: &Path) -> &Path {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            return parent;
        }
    }

    Path::new(".")
}

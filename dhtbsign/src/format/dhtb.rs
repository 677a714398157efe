/*
 * SPDX-FileCopyrightText: 2024-2025 dhtbsign developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs,
    io::{self, Seek, SeekFrom, Write},
    path::Path,
};

use ring::digest;
use thiserror::Error;
use tracing::debug;

use crate::{stream::WriteZerosExt, util};

pub const MAGIC: [u8; 4] = *b"DHTB";
pub const VERSION: u32 = 1;

/// Size of the vendor wrapper that precedes the payload in the oldest
/// container layout, and of the reserved region that holds the trailer in
/// the newer ones.
pub const WRAPPER_SIZE: usize = 512;

/// Bytes of the trailer record itself: magic, version word, SHA-256 digest,
/// marker bytes, and the declared padding size.
pub const TRAILER_SIZE: usize = 52;

/// Fallback used when a container carries no DHTB marker to probe.
pub const DEFAULT_PADDING_SIZE: u32 = 0x1000;

const DIGEST_OFFSET: usize = 8;
const PADDING_FIELD_OFFSET: usize = 0x30;

/// Trailer location in the 1 MiB container layouts.
const MIRROR_OFFSET: usize = (1 << 20) - WRAPPER_SIZE;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported firmware version: {0}")]
    UnsupportedVersion(u32),
    #[error("Payload of {0} bytes does not fit in {1} byte container")]
    PayloadTooLarge(usize, u64),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// One of the five mutually exclusive container layouts, keyed by the target
/// firmware's major version. These byte layouts are a bit-exact contract
/// with the device's bootloader; do not change them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TrailerProfile {
    pub version: u32,
    /// Exact size of the produced container.
    pub total_size: u64,
    /// Offset of the trailer record. Zero means the trailer leads and the
    /// payload begins at [`WRAPPER_SIZE`].
    pub trailer_offset: u64,
    /// Padding size the re-signed metadata was built with, echoed in the
    /// trailer.
    pub declared_size: u32,
    marker: [u8; 8],
    extras: &'static [(u64, &'static [u8])],
}

const PROFILE_V8: TrailerProfile = TrailerProfile {
    version: 8,
    total_size: 12288,
    trailer_offset: 0,
    declared_size: 0x3000,
    marker: [0; 8],
    extras: &[],
};

const PROFILE_V9: TrailerProfile = TrailerProfile {
    version: 9,
    total_size: 1 << 20,
    trailer_offset: MIRROR_OFFSET as u64,
    declared_size: 0x4000,
    marker: [0; 8],
    extras: &[],
};

const PROFILE_V10: TrailerProfile = TrailerProfile {
    version: 10,
    declared_size: 0x5000,
    ..PROFILE_V9
};

const PROFILE_V11: TrailerProfile = TrailerProfile {
    version: 11,
    extras: &[(0xFFE3D, b"\x50")],
    ..PROFILE_V10
};

const PROFILE_V13: TrailerProfile = TrailerProfile {
    version: 13,
    marker: [0xcc, 0xcc, 0xcc, 0xcc, 0xaa, 0xaa, 0xaa, 0xaa],
    extras: &[(0xFFE4D, b"\x50"), (0xFFE50, b"\x60\x52")],
    ..PROFILE_V10
};

impl TrailerProfile {
    /// Look up the layout for a firmware major version. Only versions 8, 9,
    /// 10, 11, and 13 ever shipped this container format.
    pub fn for_version(version: u32) -> Result<Self> {
        match version {
            8 => Ok(PROFILE_V8),
            9 => Ok(PROFILE_V9),
            10 => Ok(PROFILE_V10),
            11 => Ok(PROFILE_V11),
            13 => Ok(PROFILE_V13),
            v => Err(Error::UnsupportedVersion(v)),
        }
    }

    /// Offset of the payload within the container.
    pub fn payload_offset(&self) -> u64 {
        if self.trailer_offset == 0 {
            WRAPPER_SIZE as u64
        } else {
            0
        }
    }

    fn payload_capacity(&self) -> u64 {
        if self.trailer_offset == 0 {
            self.total_size - WRAPPER_SIZE as u64
        } else {
            self.trailer_offset
        }
    }

    fn trailer_bytes(&self, payload_digest: &[u8]) -> [u8; TRAILER_SIZE] {
        let mut out = [0u8; TRAILER_SIZE];
        out[..4].copy_from_slice(&MAGIC);
        out[4..8].copy_from_slice(&VERSION.to_le_bytes());
        out[DIGEST_OFFSET..DIGEST_OFFSET + 32].copy_from_slice(payload_digest);
        out[40..48].copy_from_slice(&self.marker);
        out[PADDING_FIELD_OFFSET..PADDING_FIELD_OFFSET + 4]
            .copy_from_slice(&self.declared_size.to_le_bytes());
        out
    }

    /// Write the complete container for `payload` to `writer`. The output is
    /// always exactly [`Self::total_size`] bytes. The digest embedded in the
    /// trailer is always SHA-256, independent of the metadata's signing
    /// algorithm.
    pub fn write_container(&self, mut writer: impl Write + Seek, payload: &[u8]) -> Result<()> {
        if payload.len() as u64 > self.payload_capacity() {
            return Err(Error::PayloadTooLarge(payload.len(), self.total_size));
        }

        let sha = digest::digest(&digest::SHA256, payload);
        let trailer = self.trailer_bytes(sha.as_ref());

        if self.trailer_offset == 0 {
            writer.write_all(&trailer)?;
            writer.write_zeros_exact((WRAPPER_SIZE - TRAILER_SIZE) as u64)?;
            writer.write_all(payload)?;
            writer.write_zeros_exact(
                self.total_size - WRAPPER_SIZE as u64 - payload.len() as u64,
            )?;
        } else {
            writer.write_all(payload)?;
            writer.write_zeros_exact(self.trailer_offset - payload.len() as u64)?;
            writer.write_all(&trailer)?;
            writer.write_zeros_exact(
                self.total_size - self.trailer_offset - TRAILER_SIZE as u64,
            )?;

            for (offset, bytes) in self.extras {
                writer.seek(SeekFrom::Start(*offset))?;
                writer.write_all(bytes)?;
            }
        }

        Ok(())
    }

    /// Replace the signed metadata blob at `path` with the full container
    /// wrapping it. The rewrite goes through a temporary file in the same
    /// directory and an atomic rename; the original layout shifts every
    /// offset when the trailer leads, so an in-place patch is never safe.
    pub fn wrap_in_place(&self, path: &Path) -> Result<()> {
        let payload = fs::read(path)?;

        debug!(
            "Wrapping {} byte payload of {path:?} in version {} container",
            payload.len(),
            self.version
        );

        let mut temp_file = tempfile::NamedTempFile::new_in(util::parent_path(path))?;
        self.write_container(temp_file.as_file_mut(), &payload)?;
        temp_file.persist(path).map_err(|e| e.error)?;

        Ok(())
    }
}

/// Outcome of probing a container for the vendor padding size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PaddingSize {
    pub size: u32,
    /// The DHTB marker was absent and [`DEFAULT_PADDING_SIZE`] was
    /// substituted. Callers decide whether that is worth a warning.
    pub used_default: bool,
}

fn read_u32_le(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

/// Probe a metadata container for the padding size the vendor wrapper
/// declares. An unwrapped container has the trailer leading at offset 0; a
/// 1 MiB container mirrors it near the end.
pub fn probe_padding_size(buf: &[u8]) -> PaddingSize {
    for base in [0, MIRROR_OFFSET] {
        if buf.get(base..base + 4) == Some(&MAGIC) {
            if let Some(size) = read_u32_le(buf, base + PADDING_FIELD_OFFSET) {
                return PaddingSize {
                    size,
                    used_default: false,
                };
            }
        }
    }

    PaddingSize {
        size: DEFAULT_PADDING_SIZE,
        used_default: true,
    }
}

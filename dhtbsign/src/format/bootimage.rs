/*
 * SPDX-FileCopyrightText: 2024-2025 dhtbsign developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fmt, fs,
    io::{self, Read, Write},
    mem,
    ops::Range,
    path::Path,
};

use bstr::ByteSlice;
use thiserror::Error;
use tracing::debug;
use zerocopy::{little_endian, FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::{dhtb, padding, padding::ZeroPadding},
    stream::FromReader,
    util,
};

pub const BOOT_MAGIC: [u8; 8] = *b"ANDROID!";
pub const BOOT_NAME_SIZE: usize = 16;
pub const BOOT_ARGS_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Buffer has {1} bytes at offset, but {0:?} record needs {2}")]
    Truncated(&'static str, usize, usize),
    #[error("Invalid boot image magic: {0:?}")]
    InvalidMagic([u8; 8]),
    #[error("Page size must not be zero")]
    PageSizeZero,
    #[error("Segment sizes overflowed during total size calculation")]
    IntOverflow,
    #[error("Image has {0} bytes, but payload needs {1}")]
    PayloadPastEnd(usize, usize),
    #[error("Failed to read boot image data: {0}")]
    DataRead(&'static str, #[source] io::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the legacy (v0) boot/recovery image header.
///
/// Unlike the vbmeta records, every integer here is natively little-endian,
/// so the naive fixed-layout read needs no byte-order correction. `unused1`
/// is vendor-reserved; on sprd devices a non-zero value is the size of an
/// extra vendor-appended segment that follows the second stage.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
pub struct RawHeader {
    /// Magic value. This should be equal to [`BOOT_MAGIC`].
    pub magic: [u8; 8],
    pub kernel_size: little_endian::U32,
    pub kernel_addr: little_endian::U32,
    pub ramdisk_size: little_endian::U32,
    pub ramdisk_addr: little_endian::U32,
    pub second_size: little_endian::U32,
    pub second_addr: little_endian::U32,
    pub tags_addr: little_endian::U32,
    pub page_size: little_endian::U32,
    pub unused1: little_endian::U32,
    pub unused2: little_endian::U32,
    pub name: [u8; BOOT_NAME_SIZE],
    pub cmdline: [u8; BOOT_ARGS_SIZE],
    pub id: [little_endian::U32; 8],
}

impl RawHeader {
    pub const SIZE: usize = mem::size_of::<Self>();

    /// Read the fixed-width header record starting at `offset`.
    pub fn decode(buf: &[u8], offset: usize) -> Result<Self> {
        let tail = buf.get(offset..).unwrap_or_default();
        let (raw, _) = Self::read_from_prefix(tail)
            .map_err(|_| Error::Truncated("RawHeader", tail.len(), Self::SIZE))?;

        if raw.magic != BOOT_MAGIC {
            return Err(Error::InvalidMagic(raw.magic));
        }

        Ok(raw)
    }

    /// Exact inverse of [`Self::decode`].
    pub fn encode(&self) -> &[u8] {
        self.as_bytes()
    }

    /// On-disk size of the meaningful payload: the header page plus each
    /// present segment rounded up independently to the page size. Everything
    /// past this is flash padding or garbage.
    pub fn total_size(&self) -> Result<u64> {
        let page_size = u64::from(self.page_size.get());
        if page_size == 0 {
            return Err(Error::PageSizeZero);
        }

        // The header occupies one full page.
        let mut size = page_size;

        for segment in [
            self.kernel_size.get(),
            self.ramdisk_size.get(),
            self.second_size.get(),
        ] {
            size = size
                .checked_add(
                    padding::round(u64::from(segment), page_size).ok_or(Error::IntOverflow)?,
                )
                .ok_or(Error::IntOverflow)?;
        }

        // sprd extra segment.
        let extra = self.unused1.get();
        if extra != 0 {
            size = size
                .checked_add(padding::round(u64::from(extra), page_size).ok_or(Error::IntOverflow)?)
                .ok_or(Error::IntOverflow)?;
        }

        Ok(size)
    }
}

impl<R: Read> FromReader<R> for RawHeader {
    type Error = Error;

    fn from_reader(mut reader: R) -> Result<Self> {
        let raw =
            Self::read_from_io(&mut reader).map_err(|e| Error::DataRead("RawHeader", e))?;

        if raw.magic != BOOT_MAGIC {
            return Err(Error::InvalidMagic(raw.magic));
        }

        Ok(raw)
    }
}

impl fmt::Display for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Boot image header:")?;
        writeln!(f, "- Kernel size:          {}", self.kernel_size.get())?;
        writeln!(f, "- Kernel address:       {:#x}", self.kernel_addr.get())?;
        writeln!(f, "- Ramdisk size:         {}", self.ramdisk_size.get())?;
        writeln!(f, "- Ramdisk address:      {:#x}", self.ramdisk_addr.get())?;
        writeln!(f, "- Second stage size:    {}", self.second_size.get())?;
        writeln!(f, "- Second stage address: {:#x}", self.second_addr.get())?;
        writeln!(f, "- Kernel tags address:  {:#x}", self.tags_addr.get())?;
        writeln!(f, "- Page size:            {}", self.page_size.get())?;
        writeln!(f, "- Vendor extra size:    {}", self.unused1.get())?;
        writeln!(
            f,
            "- Name:                 {:?}",
            self.name.trim_end_padding().as_bstr()
        )?;
        write!(
            f,
            "- Kernel cmdline:       {:?}",
            self.cmdline.trim_end_padding().as_bstr()
        )
    }
}

/// Locate the meaningful payload within a raw dump: an optional DHTB vendor
/// wrapper is skipped and everything past [`RawHeader::total_size`] is
/// discarded.
pub fn payload_range(buf: &[u8]) -> Result<Range<usize>> {
    let base = if buf.starts_with(&dhtb::MAGIC) {
        dhtb::WRAPPER_SIZE
    } else {
        0
    };

    let header = RawHeader::decode(buf, base)?;
    let total = header.total_size()? as usize;

    let end = base.checked_add(total).ok_or(Error::IntOverflow)?;
    if end > buf.len() {
        return Err(Error::PayloadPastEnd(buf.len(), end));
    }

    Ok(base..end)
}

/// Replace the raw dump at `path` with its trimmed payload. The rewrite goes
/// through a temporary file in the same directory and an atomic rename, so
/// an interrupted run never leaves a half-written image. Trimming an
/// already-trimmed image is a no-op.
///
/// Returns the size of the trimmed payload.
pub fn trim_in_place(path: &Path) -> Result<u64> {
    let buf = fs::read(path)?;
    let range = payload_range(&buf)?;

    debug!(
        "Boot payload of {path:?} spans {}..{} of {} bytes",
        range.start,
        range.end,
        buf.len()
    );

    let payload_size = range.len() as u64;
    if range == (0..buf.len()) {
        return Ok(payload_size);
    }

    let mut temp_file = tempfile::NamedTempFile::new_in(util::parent_path(path))?;
    temp_file.write_all(&buf[range])?;
    temp_file.persist(path).map_err(|e| e.error)?;

    Ok(payload_size)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;

    use super::*;

    fn make_image(
        page_size: u32,
        kernel_size: u32,
        ramdisk_size: u32,
        second_size: u32,
        extra_size: u32,
        trailing_garbage: usize,
    ) -> Vec<u8> {
        let mut buf = Vec::new();

        buf.extend_from_slice(&BOOT_MAGIC);
        for value in [
            kernel_size,
            0x8000,
            ramdisk_size,
            0x9000,
            second_size,
            0xa000,
            0xb000,
            page_size,
            extra_size,
            0,
        ] {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        buf.extend_from_slice(&[0u8; BOOT_NAME_SIZE]);
        buf.extend_from_slice(&[0u8; BOOT_ARGS_SIZE]);
        buf.extend_from_slice(&[0u8; 32]); // id

        // Header page, segments, then garbage.
        let header = RawHeader::decode(&buf, 0).unwrap();
        let total = header.total_size().unwrap() as usize;
        buf.resize(total + trailing_garbage, 0xff);

        buf
    }

    #[test]
    fn record_size() {
        assert_eq!(RawHeader::SIZE, 608);
    }

    #[test]
    fn total_size_rounds_segments_independently() {
        let buf = make_image(2048, 5000, 100, 0, 0, 0);
        let header = RawHeader::decode(&buf, 0).unwrap();

        // 5000 -> 6144, 100 -> 2048, plus the 2048-byte header page.
        assert_eq!(header.total_size().unwrap(), 2048 + 6144 + 2048);
    }

    #[test]
    fn total_size_includes_vendor_extra() {
        let buf = make_image(2048, 2048, 0, 0, 1, 0);
        let header = RawHeader::decode(&buf, 0).unwrap();

        assert_eq!(header.total_size().unwrap(), 2048 + 2048 + 2048);
    }

    #[test]
    fn zero_page_size() {
        let buf = make_image(2048, 0, 0, 0, 0, 0);
        let mut header = RawHeader::decode(&buf, 0).unwrap();
        header.page_size = little_endian::U32::new(0);

        assert_matches!(header.total_size(), Err(Error::PageSizeZero));
    }

    #[test]
    fn bad_magic() {
        let mut buf = make_image(2048, 0, 0, 0, 0, 0);
        buf[..8].copy_from_slice(b"NOTABOOT");

        assert_matches!(payload_range(&buf), Err(Error::InvalidMagic(_)));
    }

    #[test]
    fn header_round_trip() {
        let buf = make_image(2048, 5000, 100, 0, 0, 0);
        let header = RawHeader::decode(&buf, 0).unwrap();

        assert_eq!(header.encode(), &buf[..RawHeader::SIZE]);

        let streamed = RawHeader::from_reader(Cursor::new(&buf)).unwrap();
        assert_eq!(streamed.encode(), header.encode());
    }

    #[test]
    fn payload_range_skips_wrapper_and_garbage() {
        let inner = make_image(2048, 4096, 2048, 0, 0, 512);
        let mut buf = vec![0u8; dhtb::WRAPPER_SIZE];
        buf[..4].copy_from_slice(&dhtb::MAGIC);
        buf.extend_from_slice(&inner);

        let range = payload_range(&buf).unwrap();
        assert_eq!(range.start, dhtb::WRAPPER_SIZE);
        assert_eq!(range.len(), 2048 + 4096 + 2048);
    }

    #[test]
    fn payload_longer_than_dump() {
        let buf = make_image(2048, 5000, 0, 0, 0, 0);
        let truncated = &buf[..buf.len() - 1];

        assert_matches!(
            payload_range(truncated),
            Err(Error::PayloadPastEnd(_, _))
        );
    }

    #[test]
    fn trim_is_idempotent() {
        let image = make_image(2048, 4096, 2048, 0, 0, 1024);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot.img");
        fs::write(&path, &image).unwrap();

        let size = trim_in_place(&path).unwrap();
        let trimmed = fs::read(&path).unwrap();
        assert_eq!(trimmed.len() as u64, size);
        assert_eq!(trimmed, image[..size as usize]);

        // A second trim must leave the file untouched.
        trim_in_place(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), trimmed);
    }
}

/*
 * SPDX-FileCopyrightText: 2024-2025 dhtbsign developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{fmt, mem, str::Utf8Error};

use bstr::ByteSlice;
use thiserror::Error;
use zerocopy::{little_endian, FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{
    format::{dhtb, padding, padding::ZeroPadding},
    util,
};

pub const HEADER_MAGIC: [u8; 4] = *b"AVB0";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Buffer has {1} bytes at offset, but {0:?} record needs {2}")]
    Truncated(&'static str, usize, usize),
    #[error("Invalid vbmeta header magic: {0:?}")]
    InvalidMagic([u8; 4]),
    #[error("Chain descriptor run exceeds buffer bounds at offset {0}")]
    MalformedChain(usize),
    #[error("{0:?} field is not UTF-8 encoded: {data:?}", data = .2.as_bstr())]
    StringNotUtf8(&'static str, #[source] Utf8Error, Vec<u8>),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the vbmeta image header.
///
/// Every multi-byte integer is stored most-significant-byte-first. The codec
/// deliberately performs a naive little-endian fixed-layout read and no
/// implicit conversion: callers apply [`util::swap_bytes_32`] /
/// [`util::swap_bytes_64`] to the fields they consume arithmetically (this
/// crate only consumes `authentication_data_block_size` and
/// `algorithm_type`) and round-trip everything else unexamined. See the
/// field list on [`util::swap_bytes_16`].
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
pub struct RawHeader {
    /// Magic value. This should be equal to [`HEADER_MAGIC`].
    pub magic: [u8; 4],
    pub required_libavb_version_major: little_endian::U32,
    pub required_libavb_version_minor: little_endian::U32,
    pub authentication_data_block_size: little_endian::U64,
    pub auxiliary_data_block_size: little_endian::U64,
    pub algorithm_type: little_endian::U32,
    pub hash_offset: little_endian::U64,
    pub hash_size: little_endian::U64,
    pub signature_offset: little_endian::U64,
    pub signature_size: little_endian::U64,
    pub public_key_offset: little_endian::U64,
    pub public_key_size: little_endian::U64,
    pub public_key_metadata_offset: little_endian::U64,
    pub public_key_metadata_size: little_endian::U64,
    pub descriptors_offset: little_endian::U64,
    pub descriptors_size: little_endian::U64,
    pub rollback_index: little_endian::U64,
    pub flags: little_endian::U32,
    pub rollback_index_location: little_endian::U32,
    pub release_string: [u8; 48],
    pub reserved: [u8; 80],
}

impl RawHeader {
    pub const SIZE: usize = mem::size_of::<Self>();

    /// Read the fixed-width header record starting at `offset`.
    pub fn decode(buf: &[u8], offset: usize) -> Result<Self> {
        let tail = buf.get(offset..).unwrap_or_default();
        let (raw, _) = Self::read_from_prefix(tail)
            .map_err(|_| Error::Truncated("RawHeader", tail.len(), Self::SIZE))?;

        Ok(raw)
    }

    /// Like [`Self::decode`], but additionally validates the magic.
    pub fn decode_checked(buf: &[u8], offset: usize) -> Result<Self> {
        let raw = Self::decode(buf, offset)?;
        if raw.magic != HEADER_MAGIC {
            return Err(Error::InvalidMagic(raw.magic));
        }

        Ok(raw)
    }

    /// Exact inverse of [`Self::decode`].
    pub fn encode(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("magic", &self.magic.as_bstr())
            .field(
                "authentication_data_block_size",
                &util::swap_bytes_64(self.authentication_data_block_size.get()),
            )
            .field(
                "auxiliary_data_block_size",
                &util::swap_bytes_64(self.auxiliary_data_block_size.get()),
            )
            .field(
                "algorithm_type",
                &util::swap_bytes_32(self.algorithm_type.get()),
            )
            .field(
                "rollback_index",
                &util::swap_bytes_64(self.rollback_index.get()),
            )
            .field(
                "release_string",
                &self.release_string.trim_end_padding().as_bstr(),
            )
            .finish_non_exhaustive()
    }
}

/// Raw on-disk layout for the fixed region of a chain partition descriptor.
/// The variable-length partition name and public key immediately follow,
/// then zero padding up to the next 8-byte boundary. Same naive-read
/// convention as [`RawHeader`].
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
pub struct RawChainDescriptor {
    pub tag: little_endian::U64,
    pub num_bytes_following: little_endian::U64,
    pub rollback_index_location: little_endian::U32,
    pub partition_name_len: little_endian::U32,
    pub public_key_len: little_endian::U32,
    pub flags: little_endian::U32,
    pub reserved: [u8; 60],
}

impl RawChainDescriptor {
    pub const SIZE: usize = mem::size_of::<Self>();

    /// Read the fixed-width descriptor record starting at `offset`.
    pub fn decode(buf: &[u8], offset: usize) -> Result<Self> {
        let tail = buf.get(offset..).unwrap_or_default();
        let (raw, _) = Self::read_from_prefix(tail)
            .map_err(|_| Error::Truncated("RawChainDescriptor", tail.len(), Self::SIZE))?;

        Ok(raw)
    }

    /// Exact inverse of [`Self::decode`].
    pub fn encode(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for RawChainDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawChainDescriptor")
            .field("tag", &util::swap_bytes_64(self.tag.get()))
            .field(
                "rollback_index_location",
                &util::swap_bytes_32(self.rollback_index_location.get()),
            )
            .field(
                "partition_name_len",
                &util::swap_bytes_32(self.partition_name_len.get()),
            )
            .field(
                "public_key_len",
                &util::swap_bytes_32(self.public_key_len.get()),
            )
            .finish_non_exhaustive()
    }
}

/// Byte offset of the vbmeta header within `buf`, accounting for an optional
/// DHTB vendor wrapper prefix.
pub fn header_offset(buf: &[u8]) -> usize {
    if buf.starts_with(&dhtb::MAGIC) {
        dhtb::WRAPPER_SIZE
    } else {
        0
    }
}

/// Offset of the first descriptor record: the header's fixed region plus the
/// authentication data block. A declared block size that overflows the
/// address space cannot be a valid descriptor region.
pub fn descriptors_offset(base: usize, header: &RawHeader) -> Result<usize> {
    let auth_block_size =
        util::swap_bytes_64(header.authentication_data_block_size.get());

    usize::try_from(auth_block_size)
        .ok()
        .and_then(|size| base.checked_add(RawHeader::SIZE)?.checked_add(size))
        .ok_or(Error::MalformedChain(base))
}

/// One walked chain partition: the descriptor's fields that matter to
/// re-signing plus the variable-length data that followed the fixed region.
#[derive(Clone, Eq, PartialEq)]
pub struct ChainEntry {
    pub rollback_index_location: u32,
    pub partition_name: String,
    pub public_key: Vec<u8>,
    /// Offset one past the record, including its alignment padding. This is
    /// where the next record begins.
    pub end_offset: usize,
}

impl fmt::Debug for ChainEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainEntry")
            .field("rollback_index_location", &self.rollback_index_location)
            .field("partition_name", &self.partition_name)
            .field("public_key", &hex::encode(&self.public_key))
            .field("end_offset", &self.end_offset)
            .finish()
    }
}

/// Walks the run of chain partition descriptors that begins at
/// `start_offset`.
///
/// The container carries no record count for the run. The first record's tag
/// defines the expected tag; the run ends at the first record whose tag
/// differs, which belongs to a different region and is not consumed. The
/// header's declared descriptor-region size is intentionally not consulted,
/// matching the layout the target bootloaders were built against.
///
/// The walk is finite and non-restartable; construct a new walker to re-walk
/// from `start_offset`.
pub struct ChainWalker<'a> {
    buf: &'a [u8],
    pos: usize,
    sentinel_tag: Option<u64>,
    done: bool,
}

impl<'a> ChainWalker<'a> {
    pub fn new(buf: &'a [u8], start_offset: usize) -> Self {
        Self {
            buf,
            pos: start_offset,
            sentinel_tag: None,
            done: false,
        }
    }

    fn walk_one(&mut self) -> Result<Option<ChainEntry>> {
        let raw = RawChainDescriptor::decode(self.buf, self.pos)
            .map_err(|_| Error::MalformedChain(self.pos))?;

        match self.sentinel_tag {
            None => self.sentinel_tag = Some(raw.tag.get()),
            Some(tag) if tag != raw.tag.get() => return Ok(None),
            Some(_) => {}
        }

        let name_len = util::swap_bytes_32(raw.partition_name_len.get()) as usize;
        let key_len = util::swap_bytes_32(raw.public_key_len.get()) as usize;

        let body = self.pos + RawChainDescriptor::SIZE;
        let name = self
            .buf
            .get(body..body + name_len)
            .ok_or(Error::MalformedChain(body))?;
        let public_key = self
            .buf
            .get(body + name_len..body + name_len + key_len)
            .ok_or(Error::MalformedChain(body + name_len))?;

        let partition_name = std::str::from_utf8(name)
            .map_err(|e| Error::StringNotUtf8("partition_name", e, name.to_vec()))?
            .to_owned();

        // Records are aligned to 8 bytes.
        let record_len = RawChainDescriptor::SIZE + name_len + key_len;
        let end_offset = self.pos
            + padding::round(record_len, 8).ok_or(Error::MalformedChain(self.pos))?;

        self.pos = end_offset;

        Ok(Some(ChainEntry {
            rollback_index_location: util::swap_bytes_32(raw.rollback_index_location.get()),
            partition_name,
            public_key: public_key.to_vec(),
            end_offset,
        }))
    }
}

impl Iterator for ChainWalker<'_> {
    type Item = Result<ChainEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.walk_one() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Collect the full descriptor run starting at `start_offset`.
pub fn walk_chain(buf: &[u8], start_offset: usize) -> Result<Vec<ChainEntry>> {
    ChainWalker::new(buf, start_offset).collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn push_header(buf: &mut Vec<u8>, algorithm_type: u32, auth_block_size: u64) {
        buf.extend_from_slice(&HEADER_MAGIC);
        buf.extend_from_slice(&1u32.to_be_bytes()); // version major
        buf.extend_from_slice(&0u32.to_be_bytes()); // version minor
        buf.extend_from_slice(&auth_block_size.to_be_bytes());
        buf.extend_from_slice(&0u64.to_be_bytes()); // aux block size
        buf.extend_from_slice(&algorithm_type.to_be_bytes());
        buf.extend_from_slice(&[0u8; 80]); // offset/size fields
        buf.extend_from_slice(&0u64.to_be_bytes()); // rollback index
        buf.extend_from_slice(&[0u8; 8]); // flags + rollback index location
        buf.extend_from_slice(&[0u8; 48]); // release string
        buf.extend_from_slice(&[0u8; 80]); // reserved
    }

    fn push_chain_descriptor(buf: &mut Vec<u8>, tag: u64, ril: u32, name: &[u8], key: &[u8]) {
        let start = buf.len();

        buf.extend_from_slice(&tag.to_be_bytes());
        buf.extend_from_slice(&0u64.to_be_bytes()); // num_bytes_following
        buf.extend_from_slice(&ril.to_be_bytes());
        buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
        buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes()); // flags
        buf.extend_from_slice(&[0u8; 60]); // reserved
        buf.extend_from_slice(name);
        buf.extend_from_slice(key);

        while (buf.len() - start) % 8 != 0 {
            buf.push(0);
        }
    }

    #[test]
    fn record_sizes() {
        assert_eq!(RawHeader::SIZE, 256);
        assert_eq!(RawChainDescriptor::SIZE, 92);
    }

    #[test]
    fn header_round_trip() {
        let mut buf = Vec::new();
        push_header(&mut buf, 2, 576);

        let header = RawHeader::decode_checked(&buf, 0).unwrap();
        assert_eq!(header.encode(), &buf[..]);

        // The naive read must be corrected by an explicit swap.
        assert_eq!(util::swap_bytes_32(header.algorithm_type.get()), 2);
        assert_eq!(
            util::swap_bytes_64(header.authentication_data_block_size.get()),
            576
        );
    }

    #[test]
    fn chain_descriptor_round_trip() {
        let mut buf = Vec::new();
        push_chain_descriptor(&mut buf, 4, 7, b"boot", &[0xaa; 10]);

        let raw = RawChainDescriptor::decode(&buf, 0).unwrap();
        assert_eq!(raw.encode(), &buf[..RawChainDescriptor::SIZE]);

        assert_eq!(util::swap_bytes_64(raw.tag.get()), 4);
        assert_eq!(util::swap_bytes_32(raw.rollback_index_location.get()), 7);
        assert_eq!(util::swap_bytes_32(raw.partition_name_len.get()), 4);
        assert_eq!(util::swap_bytes_32(raw.public_key_len.get()), 10);
    }

    #[test]
    fn descriptors_offset_overflow() {
        let mut buf = Vec::new();
        push_header(&mut buf, 2, u64::MAX - 8);

        let header = RawHeader::decode_checked(&buf, 0).unwrap();
        assert_matches!(
            descriptors_offset(0, &header),
            Err(Error::MalformedChain(0))
        );
    }

    #[test]
    fn header_truncated() {
        let buf = vec![0u8; RawHeader::SIZE - 1];
        assert_matches!(
            RawHeader::decode(&buf, 0),
            Err(Error::Truncated("RawHeader", _, _))
        );
        assert_matches!(
            RawHeader::decode(&buf, buf.len() + 10),
            Err(Error::Truncated("RawHeader", 0, _))
        );
    }

    #[test]
    fn header_bad_magic() {
        let mut buf = Vec::new();
        push_header(&mut buf, 0, 0);
        buf[..4].copy_from_slice(b"XXXX");

        assert_matches!(
            RawHeader::decode_checked(&buf, 0),
            Err(Error::InvalidMagic(m)) if m == *b"XXXX"
        );
    }

    #[test]
    fn chain_run_ends_at_tag_mismatch() {
        let mut buf = Vec::new();
        push_header(&mut buf, 2, 0);

        let start = buf.len();
        push_chain_descriptor(&mut buf, 4, 1, b"boot", &[0xaa; 10]);
        push_chain_descriptor(&mut buf, 4, 2, b"recovery", &[0xbb; 17]);
        push_chain_descriptor(&mut buf, 4, 3, b"dtbo", &[0xcc; 8]);
        // Terminator: a record from a different region.
        push_chain_descriptor(&mut buf, 2, 9, b"ignored", &[0xdd; 4]);

        let header = RawHeader::decode_checked(&buf, 0).unwrap();
        let entries = walk_chain(&buf, descriptors_offset(0, &header).unwrap()).unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].partition_name, "boot");
        assert_eq!(entries[0].rollback_index_location, 1);
        assert_eq!(entries[0].public_key, vec![0xaa; 10]);
        assert_eq!(entries[1].partition_name, "recovery");
        assert_eq!(entries[2].partition_name, "dtbo");
        assert_eq!(entries[2].rollback_index_location, 3);

        // Records advance by 8-byte-aligned strides.
        let first_stride = entries[0].end_offset - start;
        assert_eq!(first_stride % 8, 0);
        assert_eq!(
            first_stride,
            (RawChainDescriptor::SIZE + 4 + 10).next_multiple_of(8)
        );
    }

    #[test]
    fn chain_walk_is_lazy_and_nonrestartable() {
        let mut buf = Vec::new();
        push_chain_descriptor(&mut buf, 4, 1, b"boot", &[0x11; 4]);
        push_chain_descriptor(&mut buf, 7, 0, b"stop", &[]);

        let mut walker = ChainWalker::new(&buf, 0);
        assert_eq!(
            walker.next().unwrap().unwrap().partition_name,
            "boot"
        );
        assert!(walker.next().is_none());
        assert!(walker.next().is_none());
    }

    #[test]
    fn chain_out_of_bounds() {
        let mut buf = Vec::new();
        // Name length that runs far past the end of the buffer.
        push_chain_descriptor(&mut buf, 4, 1, b"boot", &[0x11; 4]);
        buf[20..24].copy_from_slice(&0x10000u32.to_be_bytes());

        assert_matches!(walk_chain(&buf, 0), Err(Error::MalformedChain(_)));

        // Truncated descriptor record mid-run.
        let mut buf = Vec::new();
        push_chain_descriptor(&mut buf, 4, 1, b"boot", &[0x11; 4]);
        buf.extend_from_slice(&4u64.to_be_bytes());

        assert_matches!(walk_chain(&buf, 0), Err(Error::MalformedChain(_)));
    }

    #[test]
    fn wrapped_header_offset() {
        let mut buf = vec![0u8; dhtb::WRAPPER_SIZE];
        buf[..4].copy_from_slice(&dhtb::MAGIC);
        push_header(&mut buf, 1, 0);

        assert_eq!(header_offset(&buf), dhtb::WRAPPER_SIZE);
        let header = RawHeader::decode_checked(&buf, header_offset(&buf)).unwrap();
        assert_eq!(util::swap_bytes_32(header.algorithm_type.get()), 1);

        assert_eq!(header_offset(b"AVB0"), 0);
    }
}

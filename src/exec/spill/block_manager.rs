// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! On-disk layout of a spill channel.
//!
//! ```text
//! block*  := header(20B) payload(stored_len)
//! footer  := "SMJF" version:u16 key_len:u16 record_count:u64
//!            block_count:u64 data_length:u64 first_key last_key
//! trailer := footer_len:u32 "SMJT"
//! ```
//!
//! The payload of all blocks, decompressed and concatenated, is a stream of
//! records `key[key_len] row_len:u32 row[row_len]`. Records may straddle
//! block boundaries.

use std::io::{Read, Write};
use std::path::Path;

use crate::common::error::{SmjError, SmjResult};
use crate::exec::expr::NormalizedKey;
use crate::runtime::memory_manager::MemorySegment;

const BLOCK_MAGIC: [u8; 4] = *b"SMJB";
pub const BLOCK_HEADER_LEN: usize = 20;
const FOOTER_MAGIC: [u8; 4] = *b"SMJF";
const TRAILER_MAGIC: [u8; 4] = *b"SMJT";
const FOOTER_VERSION: u16 = 1;
pub const TRAILER_LEN: usize = 8;
const FOOTER_FIXED_LEN: usize = 4 + 2 + 2 + 8 + 8 + 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpillCodec {
    None,
    Lz4,
}

impl SpillCodec {
    pub fn as_u8(self) -> u8 {
        match self {
            SpillCodec::None => 0,
            SpillCodec::Lz4 => 1,
        }
    }
}

impl TryFrom<u8> for SpillCodec {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SpillCodec::None),
            1 => Ok(SpillCodec::Lz4),
            other => Err(format!("unknown spill codec: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub codec: SpillCodec,
    pub uncompressed_len: u32,
    pub stored_len: u32,
    pub crc32c: u32,
}

impl BlockHeader {
    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_LEN] {
        let mut buf = [0u8; BLOCK_HEADER_LEN];
        buf[..4].copy_from_slice(&BLOCK_MAGIC);
        buf[4] = self.codec.as_u8();
        buf[8..12].copy_from_slice(&self.uncompressed_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.stored_len.to_le_bytes());
        buf[16..20].copy_from_slice(&self.crc32c.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, String> {
        if buf.len() < BLOCK_HEADER_LEN {
            return Err("spill block header is too small".to_string());
        }
        if buf[..4] != BLOCK_MAGIC {
            return Err("spill block header magic mismatch".to_string());
        }
        let codec = SpillCodec::try_from(buf[4])?;
        if buf[5..8] != [0, 0, 0] {
            return Err("spill block header reserved bytes must be 0".to_string());
        }
        let uncompressed_len = read_u32(&buf[8..12]);
        let stored_len = read_u32(&buf[12..16]);
        let crc32c = read_u32(&buf[16..20]);
        if codec == SpillCodec::None && stored_len != uncompressed_len {
            return Err(format!(
                "raw spill block stores {stored_len} bytes but declares {uncompressed_len}"
            ));
        }
        Ok(Self {
            codec,
            uncompressed_len,
            stored_len,
            crc32c,
        })
    }
}

fn read_u16(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[0], buf[1]])
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn read_u64(buf: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(b)
}

/// Trailing channel metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFooter {
    pub key_len: u16,
    pub record_count: u64,
    pub block_count: u64,
    /// Bytes of the block region, headers included.
    pub data_length: u64,
    pub first_key: Option<NormalizedKey>,
    pub last_key: Option<NormalizedKey>,
}

impl ChannelFooter {
    pub fn to_bytes(&self) -> Vec<u8> {
        let key_len = self.key_len as usize;
        let mut buf = Vec::with_capacity(FOOTER_FIXED_LEN + 2 * key_len + TRAILER_LEN);
        buf.extend_from_slice(&FOOTER_MAGIC);
        buf.extend_from_slice(&FOOTER_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.key_len.to_le_bytes());
        buf.extend_from_slice(&self.record_count.to_le_bytes());
        buf.extend_from_slice(&self.block_count.to_le_bytes());
        buf.extend_from_slice(&self.data_length.to_le_bytes());
        for key in [&self.first_key, &self.last_key] {
            let bytes = key.as_ref().map(|k| k.as_bytes()).unwrap_or(&[]);
            let mut padded = vec![0u8; key_len];
            let n = bytes.len().min(key_len);
            padded[..n].copy_from_slice(&bytes[..n]);
            buf.extend_from_slice(&padded);
        }
        let footer_len = buf.len() as u32;
        buf.extend_from_slice(&footer_len.to_le_bytes());
        buf.extend_from_slice(&TRAILER_MAGIC);
        buf
    }

    /// Parse the footer body (without the trailer).
    pub fn from_bytes(buf: &[u8]) -> Result<Self, String> {
        if buf.len() < FOOTER_FIXED_LEN {
            return Err("spill channel footer is too small".to_string());
        }
        if buf[..4] != FOOTER_MAGIC {
            return Err("spill channel footer magic mismatch".to_string());
        }
        let version = read_u16(&buf[4..6]);
        if version != FOOTER_VERSION {
            return Err(format!("unsupported spill channel version: {version}"));
        }
        let key_len = read_u16(&buf[6..8]);
        let record_count = read_u64(&buf[8..16]);
        let block_count = read_u64(&buf[16..24]);
        let data_length = read_u64(&buf[24..32]);
        let keys_len = 2 * key_len as usize;
        if buf.len() != FOOTER_FIXED_LEN + keys_len {
            return Err(format!(
                "spill channel footer length {} does not match key length {key_len}",
                buf.len()
            ));
        }
        let (first_key, last_key) = if record_count == 0 {
            (None, None)
        } else {
            let start = FOOTER_FIXED_LEN;
            let mid = start + key_len as usize;
            (
                Some(NormalizedKey::from_slice(&buf[start..mid])),
                Some(NormalizedKey::from_slice(&buf[mid..mid + key_len as usize])),
            )
        };
        Ok(Self {
            key_len,
            record_count,
            block_count,
            data_length,
            first_key,
            last_key,
        })
    }

    /// Parse the 8-byte trailer, returning the footer body length.
    pub fn parse_trailer(buf: &[u8]) -> Result<usize, String> {
        if buf.len() != TRAILER_LEN {
            return Err("spill channel trailer has wrong size".to_string());
        }
        if buf[4..8] != TRAILER_MAGIC {
            return Err("spill channel trailer magic mismatch".to_string());
        }
        Ok(read_u32(&buf[..4]) as usize)
    }
}

/// Encode and write one block. Incompressible payloads are stored raw.
/// Returns the number of bytes written, header included.
pub fn write_block<W: Write>(
    writer: &mut W,
    payload: &[u8],
    compress: bool,
    path: &Path,
) -> SmjResult<(BlockHeader, usize)> {
    let compressed = if compress {
        Some(lz4_flex::block::compress(payload))
    } else {
        None
    };
    let (codec, stored): (SpillCodec, &[u8]) = match &compressed {
        Some(c) if c.len() < payload.len() => (SpillCodec::Lz4, c.as_slice()),
        _ => (SpillCodec::None, payload),
    };
    let header = BlockHeader {
        codec,
        uncompressed_len: payload.len() as u32,
        stored_len: stored.len() as u32,
        crc32c: crc32c::crc32c(stored),
    };
    writer
        .write_all(&header.to_bytes())
        .map_err(|e| SmjError::spill_io("write spill block header", path, e))?;
    writer
        .write_all(stored)
        .map_err(|e| SmjError::spill_io("write spill block", path, e))?;
    Ok((header, BLOCK_HEADER_LEN + stored.len()))
}

/// Read the next block into `segment`, decompressing through `scratch`.
/// Returns the decoded length and the on-disk size of the block.
pub fn read_block<R: Read>(
    reader: &mut R,
    segment: &mut MemorySegment,
    scratch: &mut Vec<u8>,
    path: &Path,
) -> SmjResult<(usize, usize)> {
    let mut header_buf = [0u8; BLOCK_HEADER_LEN];
    reader
        .read_exact(&mut header_buf)
        .map_err(|e| SmjError::spill_io("read spill block header", path, e))?;
    let header = BlockHeader::from_bytes(&header_buf).map_err(|e| SmjError::corrupt(path, e))?;
    let uncompressed = header.uncompressed_len as usize;
    let stored = header.stored_len as usize;
    if uncompressed > segment.len() || stored > segment.len() {
        return Err(SmjError::corrupt(
            path,
            format!(
                "block of {uncompressed} bytes ({stored} stored) exceeds the {} byte read buffer",
                segment.len()
            ),
        ));
    }

    match header.codec {
        SpillCodec::None => {
            let target = &mut segment.as_mut_slice()[..stored];
            reader
                .read_exact(target)
                .map_err(|e| SmjError::spill_io("read spill block", path, e))?;
            check_crc(&header, target, path)?;
        }
        SpillCodec::Lz4 => {
            scratch.resize(stored, 0);
            reader
                .read_exact(scratch.as_mut_slice())
                .map_err(|e| SmjError::spill_io("read spill block", path, e))?;
            check_crc(&header, scratch, path)?;
            let n = lz4_flex::block::decompress_into(
                scratch,
                &mut segment.as_mut_slice()[..uncompressed],
            )
            .map_err(|e| SmjError::corrupt(path, format!("lz4 decompress failed: {e}")))?;
            if n != uncompressed {
                return Err(SmjError::corrupt(
                    path,
                    format!("block decompressed to {n} bytes, header says {uncompressed}"),
                ));
            }
        }
    }
    Ok((uncompressed, BLOCK_HEADER_LEN + stored))
}

fn check_crc(header: &BlockHeader, stored: &[u8], path: &Path) -> SmjResult<()> {
    let actual = crc32c::crc32c(stored);
    if actual != header.crc32c {
        return Err(SmjError::corrupt(
            path,
            format!(
                "block checksum mismatch: expected {:08x}, got {actual:08x}",
                header.crc32c
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory_manager::MemoryManager;
    use std::io::Cursor;
    use std::path::PathBuf;

    #[test]
    fn compressible_block_uses_lz4() {
        let mm = MemoryManager::new(4096, 1024).unwrap();
        let path = PathBuf::from("mem");
        let payload = vec![7u8; 900];
        let mut out = Vec::new();
        let (header, written) = write_block(&mut out, &payload, true, &path).unwrap();
        assert_eq!(header.codec, SpillCodec::Lz4);
        assert_eq!(written, out.len());

        let mut seg = mm.acquire(1).unwrap().pop().unwrap();
        let mut scratch = Vec::new();
        let (len, consumed) =
            read_block(&mut Cursor::new(out), &mut seg, &mut scratch, &path).unwrap();
        assert_eq!(len, 900);
        assert_eq!(consumed, written);
        assert!(seg.as_slice()[..900].iter().all(|b| *b == 7));
    }

    #[test]
    fn incompressible_block_is_stored_raw() {
        let path = PathBuf::from("mem");
        let payload: Vec<u8> = (0..64u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let mut out = Vec::new();
        let (header, _) = write_block(&mut out, &payload, true, &path).unwrap();
        assert_eq!(header.codec, SpillCodec::None);
        assert_eq!(header.stored_len, header.uncompressed_len);
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let mm = MemoryManager::new(4096, 1024).unwrap();
        let path = PathBuf::from("mem");
        let mut out = Vec::new();
        write_block(&mut out, b"hello spill channel", false, &path).unwrap();
        let last = out.len() - 1;
        out[last] ^= 0xff;
        let mut seg = mm.acquire(1).unwrap().pop().unwrap();
        let err = read_block(&mut Cursor::new(out), &mut seg, &mut Vec::new(), &path).unwrap_err();
        assert!(matches!(err, SmjError::CorruptChannel(_)));
    }

    #[test]
    fn footer_round_trips_with_trailer() {
        let footer = ChannelFooter {
            key_len: 9,
            record_count: 3,
            block_count: 1,
            data_length: 120,
            first_key: Some(NormalizedKey::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9])),
            last_key: Some(NormalizedKey::from_slice(&[9, 9, 9, 9, 9, 9, 9, 9, 9])),
        };
        let bytes = footer.to_bytes();
        let body_len = ChannelFooter::parse_trailer(&bytes[bytes.len() - TRAILER_LEN..]).unwrap();
        assert_eq!(body_len, bytes.len() - TRAILER_LEN);
        let parsed = ChannelFooter::from_bytes(&bytes[..body_len]).unwrap();
        assert_eq!(parsed, footer);
    }
}

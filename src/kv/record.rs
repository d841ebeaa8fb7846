//! On-disk record framing for segment files.
//!
//! Header (32 bytes, big-endian):
//! `[key_len u32][value_len u32][timestamp u64][flags u8][compression u8][crc32 u32][reserved 10]`
//! followed by the key and the stored (possibly compressed) value. The
//! checksum covers key and stored value.

use super::{CompressionType, KvError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher as Crc32;
use lz4::EncoderBuilder;
use std::io::{Read, Write};

pub const HEADER_SIZE: usize = 32;
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone)]
pub struct StorageRecord {
    pub key: Bytes,
    pub value: Bytes,
    pub compression: CompressionType,
    pub timestamp: u64,
}

/// Why a byte range could not be parsed as a record.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Fewer bytes than the header announces; a torn write.
    Incomplete,
    ChecksumMismatch,
    InvalidHeader(String),
}

impl StorageRecord {
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.key.len() + self.value.len()
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        let mut hasher = Crc32::new();
        hasher.update(&self.key);
        hasher.update(&self.value);
        let checksum = hasher.finalize();

        buf.put_u32(self.key.len() as u32);
        buf.put_u32(self.value.len() as u32);
        buf.put_u64(self.timestamp);
        buf.put_u8(0);
        buf.put_u8(self.compression.to_u8());
        buf.put_u32(checksum);
        buf.put_bytes(0, 10);

        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
    }

    /// Parse one record from the front of `data`, returning it with the
    /// number of bytes it occupies.
    pub fn parse(data: &[u8], verify: bool) -> std::result::Result<(Self, usize), ParseError> {
        if data.len() < HEADER_SIZE {
            return Err(ParseError::Incomplete);
        }
        let mut header = &data[..HEADER_SIZE];
        let key_len = header.get_u32() as usize;
        let value_len = header.get_u32() as usize;
        let timestamp = header.get_u64();
        let _flags = header.get_u8();
        let compression = CompressionType::from_u8(header.get_u8())
            .ok_or_else(|| ParseError::InvalidHeader("unknown compression type".to_string()))?;
        let checksum = header.get_u32();

        let total = HEADER_SIZE + key_len + value_len;
        if data.len() < total {
            return Err(ParseError::Incomplete);
        }
        let key = &data[HEADER_SIZE..HEADER_SIZE + key_len];
        let value = &data[HEADER_SIZE + key_len..total];

        if verify {
            let mut hasher = Crc32::new();
            hasher.update(key);
            hasher.update(value);
            if hasher.finalize() != checksum {
                return Err(ParseError::ChecksumMismatch);
            }
        }

        Ok((
            Self {
                key: Bytes::copy_from_slice(key),
                value: Bytes::copy_from_slice(value),
                compression,
                timestamp,
            },
            total,
        ))
    }

    /// The value as written by the caller.
    pub fn decoded_value(&self) -> Result<Bytes> {
        decompress(&self.value, self.compression)
    }
}

impl CompressionType {
    pub fn to_u8(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Lz4 => 1,
            CompressionType::Zstd => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Lz4),
            2 => Some(CompressionType::Zstd),
            _ => None,
        }
    }
}

/// Key and value lengths must fit the u32 header fields.
pub fn frame_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| KvError::ValueTooLarge {
        size: len,
        max: u32::MAX as usize,
    })
}

pub fn compress(data: &[u8], compression: CompressionType) -> Result<Bytes> {
    match compression {
        CompressionType::None => Ok(Bytes::copy_from_slice(data)),
        CompressionType::Lz4 => {
            let mut encoder = EncoderBuilder::new()
                .build(Vec::new())
                .map_err(|e| KvError::Compression(format!("lz4 encoder: {}", e)))?;
            encoder.write_all(data)?;
            let (compressed, result) = encoder.finish();
            result.map_err(|e| KvError::Compression(format!("lz4 finish: {}", e)))?;
            Ok(Bytes::from(compressed))
        }
        CompressionType::Zstd => {
            let compressed = zstd::stream::encode_all(std::io::Cursor::new(data), ZSTD_LEVEL)
                .map_err(|e| KvError::Compression(format!("zstd encode: {}", e)))?;
            Ok(Bytes::from(compressed))
        }
    }
}

pub fn decompress(data: &[u8], compression: CompressionType) -> Result<Bytes> {
    match compression {
        CompressionType::None => Ok(Bytes::copy_from_slice(data)),
        CompressionType::Lz4 => {
            let mut decoder = lz4::Decoder::new(data)
                .map_err(|e| KvError::Compression(format!("lz4 decoder: {}", e)))?;
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| KvError::Compression(format!("lz4 decode: {}", e)))?;
            Ok(Bytes::from(decompressed))
        }
        CompressionType::Zstd => {
            let decompressed = zstd::stream::decode_all(data)
                .map_err(|e| KvError::Compression(format!("zstd decode: {}", e)))?;
            Ok(Bytes::from(decompressed))
        }
    }
}

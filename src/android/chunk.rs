//! Chunk headers and the byte cursor shared by the decode and audit paths.
//!
//! Every record in an Android binary XML document starts with the same 8-byte
//! header: `type: u16`, `header_size: u16`, `total_size: u32`, all little-endian.

use crate::android::error::{AxmlError, AxmlResult};
use serde::Serialize;

pub const RES_NULL_TYPE: u16 = 0x0000;
pub const RES_STRING_POOL_TYPE: u16 = 0x0001;
pub const RES_XML_TYPE: u16 = 0x0003;
pub const RES_XML_START_NAMESPACE_TYPE: u16 = 0x0100;
pub const RES_XML_END_NAMESPACE_TYPE: u16 = 0x0101;
pub const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
pub const RES_XML_END_ELEMENT_TYPE: u16 = 0x0103;
pub const RES_XML_CDATA_TYPE: u16 = 0x0104;
pub const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;

/// Size of the generic chunk header.
pub const CHUNK_HEADER_SIZE: usize = 8;

/// String index meaning "no string".
pub const NO_ENTRY_INDEX: u32 = 0xFFFF_FFFF;

/// Closed set of chunk types the decoder knows about, plus everything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChunkType {
    Null,
    StringPool,
    Xml,
    StartNamespace,
    EndNamespace,
    StartElement,
    EndElement,
    CData,
    ResourceMap,
    Unknown(u16),
}

impl ChunkType {
    pub fn from_u16(value: u16) -> Self {
        match value {
            RES_NULL_TYPE => ChunkType::Null,
            RES_STRING_POOL_TYPE => ChunkType::StringPool,
            RES_XML_TYPE => ChunkType::Xml,
            RES_XML_START_NAMESPACE_TYPE => ChunkType::StartNamespace,
            RES_XML_END_NAMESPACE_TYPE => ChunkType::EndNamespace,
            RES_XML_START_ELEMENT_TYPE => ChunkType::StartElement,
            RES_XML_END_ELEMENT_TYPE => ChunkType::EndElement,
            RES_XML_CDATA_TYPE => ChunkType::CData,
            RES_XML_RESOURCE_MAP_TYPE => ChunkType::ResourceMap,
            other => ChunkType::Unknown(other),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            ChunkType::Null => RES_NULL_TYPE,
            ChunkType::StringPool => RES_STRING_POOL_TYPE,
            ChunkType::Xml => RES_XML_TYPE,
            ChunkType::StartNamespace => RES_XML_START_NAMESPACE_TYPE,
            ChunkType::EndNamespace => RES_XML_END_NAMESPACE_TYPE,
            ChunkType::StartElement => RES_XML_START_ELEMENT_TYPE,
            ChunkType::EndElement => RES_XML_END_ELEMENT_TYPE,
            ChunkType::CData => RES_XML_CDATA_TYPE,
            ChunkType::ResourceMap => RES_XML_RESOURCE_MAP_TYPE,
            ChunkType::Unknown(v) => *v,
        }
    }

    /// Types that win over a shifted read overlapping their header.
    pub fn is_known(&self) -> bool {
        !matches!(self, ChunkType::Null | ChunkType::Unknown(_))
    }
}

/// The fixed header shared by every chunk, plus the offset it was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ChunkHeader {
    pub chunk_type: u16,
    pub header_size: u16,
    pub total_size: u32,
    #[serde(skip)]
    pub start: usize,
}

impl ChunkHeader {
    /// Read a header at `offset` without moving any cursor.
    pub fn parse(data: &[u8], offset: usize) -> AxmlResult<Self> {
        let mut reader = BinaryReader::at(data, offset);
        Self::read(&mut reader)
    }

    /// Read exactly 8 bytes at the cursor.
    ///
    /// Fails with [`AxmlError::TruncatedHeader`] when fewer than 8 bytes remain; callers
    /// decide from the position whether that is the end of the document or damage.
    pub fn read(reader: &mut BinaryReader<'_>) -> AxmlResult<Self> {
        let start = reader.position();
        if reader.remaining() < CHUNK_HEADER_SIZE {
            return Err(AxmlError::TruncatedHeader {
                offset: start,
                available: reader.remaining(),
            });
        }
        let chunk_type = reader.read_u16()?;
        let header_size = reader.read_u16()?;
        let total_size = reader.read_u32()?;
        Ok(ChunkHeader {
            chunk_type,
            header_size,
            total_size,
            start,
        })
    }

    pub fn kind(&self) -> ChunkType {
        ChunkType::from_u16(self.chunk_type)
    }

    /// `8 <= header_size <= total_size`
    pub fn is_plausible(&self) -> bool {
        CHUNK_HEADER_SIZE <= self.header_size as usize && self.header_size as u32 <= self.total_size
    }

    /// The whole declared chunk lies inside a buffer of `len` bytes.
    pub fn fits(&self, len: usize) -> bool {
        self.end() <= len
    }

    /// Whether a scan may stop here: the header is self-consistent and fits `data`, whatever
    /// its type. Past the scan origin a candidate also yields to a known chunk header that
    /// starts inside its own 8 header bytes, since a read one byte before a real header in
    /// a large buffer is often size-consistent.
    pub fn is_resync_candidate(&self, data: &[u8], at_origin: bool) -> bool {
        if !self.is_plausible() || !self.fits(data.len()) {
            return false;
        }
        at_origin || !overlaps_known_header(data, self.start)
    }

    pub fn end(&self) -> usize {
        self.start.saturating_add(self.total_size as usize)
    }

    pub fn body_start(&self) -> usize {
        self.start.saturating_add(self.header_size as usize)
    }

    /// The bytes of this chunk that are actually present in `data`.
    pub fn slice<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.start.min(data.len());
        let end = self.end().min(data.len());
        &data[start..end]
    }
}

fn overlaps_known_header(data: &[u8], start: usize) -> bool {
    (start + 1..start + CHUNK_HEADER_SIZE).any(|pos| {
        ChunkHeader::parse(data, pos).is_ok_and(|header| {
            header.kind().is_known() && header.is_plausible() && header.fits(data.len())
        })
    })
}

/// Scan forward from `from` for the first offset holding a usable header.
///
/// Android skips chunks it does not understand, so any type is accepted as long as the
/// sizes make sense. The scan moves one byte at a time and is bounded by the buffer.
pub fn locate_next_chunk(data: &[u8], from: usize) -> Option<usize> {
    let mut pos = from;
    while pos.saturating_add(CHUNK_HEADER_SIZE) <= data.len() {
        match ChunkHeader::parse(data, pos) {
            Ok(header) if header.is_resync_candidate(data, pos == from) => return Some(pos),
            Ok(_) => pos += 1,
            Err(_) => return None,
        }
    }
    None
}

/// Bounds-checked little-endian cursor over an in-memory buffer.
pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BinaryReader { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        BinaryReader { data, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    fn take(&mut self, len: usize) -> AxmlResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(AxmlError::Truncated {
                offset: self.pos,
                needed: len,
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> AxmlResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> AxmlResult<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> AxmlResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_bytes(&mut self, len: usize) -> AxmlResult<&'a [u8]> {
        self.take(len)
    }

    /// Move forward by `len` bytes, stopping at the end of the buffer.
    pub fn skip(&mut self, len: usize) {
        self.pos = self.pos.saturating_add(len).min(self.data.len());
    }

    pub fn seek(&mut self, offset: usize) -> AxmlResult<()> {
        if offset > self.data.len() {
            return Err(AxmlError::MalformedDocument(format!(
                "Attempted to seek to 0x{offset:x} past end of document (0x{:x})",
                self.data.len()
            )));
        }
        self.pos = offset;
        Ok(())
    }
}

pub(crate) fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn align_to_four(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

/// Write a chunk header with a zero size and return where the chunk starts.
pub(crate) fn begin_chunk(buf: &mut Vec<u8>, chunk_type: u16, header_size: u16) -> usize {
    let start = buf.len();
    write_u16(buf, chunk_type);
    write_u16(buf, header_size);
    write_u32(buf, 0);
    start
}

/// Pad to a 4-byte boundary and patch the size of the chunk begun at `chunk_start`.
pub(crate) fn finalize_chunk(buf: &mut Vec<u8>, chunk_start: usize) {
    align_to_four(buf);
    let size = (buf.len() - chunk_start) as u32;
    buf[chunk_start + 4..chunk_start + 8].copy_from_slice(&size.to_le_bytes());
}

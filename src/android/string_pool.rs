//! The global string table of a binary XML document.
//!
//! Strings are located lazily through the offset table so that callers can either decode
//! the whole pool once or fetch a single string by index.

use crate::android::chunk::{
    align_to_four, begin_chunk, finalize_chunk, write_u16, write_u32, BinaryReader, ChunkHeader,
    NO_ENTRY_INDEX, RES_STRING_POOL_TYPE,
};
use crate::android::error::AxmlResult;
use bitflags::bitflags;
use log::{debug, warn};
use std::collections::BTreeMap;

/// Size of a string pool header: chunk header plus five `u32` fields.
pub const STRING_POOL_HEADER_SIZE: u16 = 28;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct StringPoolFlags: u32 {
        const SORTED = 0x0000_0001;
        const UTF8 = 0x0000_0100;
    }
}

#[derive(Clone, Debug, Default)]
pub struct StringPool {
    start: usize,
    header_size: u16,
    declared_size: u32,
    declared_count: u32,
    style_count: u32,
    flags: StringPoolFlags,
    strings_start: u32,
    styles_start: u32,
    offsets: Vec<u32>,
    raw_data: Vec<u8>,
}

impl StringPool {
    /// A pool with no strings; every lookup misses.
    pub fn empty() -> Self {
        StringPool::default()
    }

    /// Parse the pool described by `header` out of `data`.
    ///
    /// Never fails: a pool whose own header is cut short is treated as empty, and an offset
    /// table running past the available bytes is shortened to what is present.
    pub fn parse(data: &[u8], header: &ChunkHeader) -> Self {
        let raw_data = header.slice(data).to_vec();
        let mut reader = BinaryReader::at(&raw_data, 8);
        let (declared_count, style_count, flags, strings_start, styles_start) =
            match read_pool_fields(&mut reader) {
                Ok(fields) => fields,
                Err(err) => {
                    warn!(
                        "[string-pool] header at 0x{:x} unreadable ({err}); using an empty pool",
                        header.start
                    );
                    return StringPool {
                        start: header.start,
                        header_size: header.header_size,
                        declared_size: header.total_size,
                        ..StringPool::default()
                    };
                }
            };

        let table_start = header.header_size as usize;
        let slots = (strings_start as usize).saturating_sub(table_start) / 4;
        let mut real_count = slots.saturating_sub(style_count as usize);
        let available = raw_data.len().saturating_sub(table_start) / 4;
        if real_count > available {
            debug!(
                "[string-pool] offset table wants {real_count} slots, only {available} present"
            );
            real_count = available;
        }
        if real_count != declared_count as usize {
            debug!(
                "[string-pool] declared {declared_count} strings, offset table holds {real_count}"
            );
        }

        let mut reader = BinaryReader::at(&raw_data, table_start);
        let mut offsets = Vec::with_capacity(real_count);
        for _ in 0..real_count {
            match reader.read_u32() {
                Ok(offset) => offsets.push(offset),
                Err(_) => break,
            }
        }

        StringPool {
            start: header.start,
            header_size: header.header_size,
            declared_size: header.total_size,
            declared_count,
            style_count,
            flags: StringPoolFlags::from_bits_retain(flags),
            strings_start,
            styles_start,
            offsets,
            raw_data,
        }
    }

    /// Number of strings actually addressable through the offset table.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// The count written in the pool header, which tampered files may inflate.
    pub fn declared_count(&self) -> u32 {
        self.declared_count
    }

    pub fn style_count(&self) -> u32 {
        self.style_count
    }

    pub fn flags(&self) -> StringPoolFlags {
        self.flags
    }

    pub fn is_utf8(&self) -> bool {
        self.flags.contains(StringPoolFlags::UTF8)
    }

    pub fn strings_start(&self) -> u32 {
        self.strings_start
    }

    pub fn styles_start(&self) -> u32 {
        self.styles_start
    }

    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    pub fn raw_data(&self) -> &[u8] {
        &self.raw_data
    }

    /// Absolute offset of the pool chunk in the document.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Absolute offset the pool header claims the chunk ends at.
    pub fn declared_end(&self) -> usize {
        self.start.saturating_add(self.declared_size as usize)
    }

    /// Absolute offset just past the last string's terminator, bounded by the bytes present.
    pub fn strings_end(&self) -> usize {
        let relative = self
            .offsets
            .iter()
            .filter_map(|&offset| self.decode_span(offset).map(|(_, end)| end))
            .max()
            .unwrap_or(self.strings_start as usize)
            .min(self.raw_data.len());
        self.start + relative
    }

    /// Decode every string in declaration order. Unreadable entries become empty strings.
    pub fn decode_all(&self) -> Vec<String> {
        self.offsets
            .iter()
            .map(|&offset| self.decode_span(offset).map(|(text, _)| text).unwrap_or_default())
            .collect()
    }

    /// Decode one string, reading its offset slot straight from the pool bytes.
    pub fn string_at(&self, idx: u32) -> Option<String> {
        if idx == NO_ENTRY_INDEX || idx as usize >= self.offsets.len() {
            return None;
        }
        let slot = (self.header_size as usize).checked_add(idx as usize * 4)?;
        let offset = BinaryReader::at(&self.raw_data, slot).read_u32().ok()?;
        self.decode_span(offset).map(|(text, _)| text)
    }

    /// Decoded text and the pool-relative offset just past its terminator.
    fn decode_span(&self, offset: u32) -> Option<(String, usize)> {
        let start = (self.strings_start as usize).checked_add(offset as usize)?;
        if start >= self.raw_data.len() {
            debug!(
                "[string-pool] string offset 0x{offset:x} lies past the pool (0x{:x} bytes)",
                self.raw_data.len()
            );
            return None;
        }
        if self.is_utf8() {
            self.decode_utf8(start)
        } else {
            self.decode_utf16(start)
        }
    }

    /// Single length byte, one skipped byte, then that many bytes of UTF-8.
    fn decode_utf8(&self, start: usize) -> Option<(String, usize)> {
        let mut reader = BinaryReader::at(&self.raw_data, start);
        let len = reader.read_u8().ok()?;
        reader.skip(1);
        let len = (len as usize).min(reader.remaining());
        let text = String::from_utf8_lossy(reader.read_bytes(len).ok()?).into_owned();
        reader.skip(1);
        Some((text, reader.position()))
    }

    fn decode_utf16(&self, start: usize) -> Option<(String, usize)> {
        let mut reader = BinaryReader::at(&self.raw_data, start);
        let first = reader.read_u16().ok()?;
        let units = if first & 0x8000 != 0 {
            let second = reader.read_u16().ok()?;
            let combined = (((first & 0x7FFF) as usize) << 16) | second as usize;
            if combined.saturating_mul(2) > reader.remaining() {
                warn!(
                    "[string-pool] two-part length {combined} at 0x{:x} exceeds the pool",
                    self.start + start
                );
                return Some((String::new(), reader.position()));
            }
            combined
        } else {
            (first as usize).min(reader.remaining() / 2)
        };
        let bytes = reader.read_bytes(units * 2).ok()?;
        let code_units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        reader.skip(2);
        Some((String::from_utf16_lossy(&code_units), reader.position()))
    }
}

/// `(string_count, style_count, flags, strings_start, styles_start)`
fn read_pool_fields(reader: &mut BinaryReader<'_>) -> AxmlResult<(u32, u32, u32, u32, u32)> {
    Ok((
        reader.read_u32()?,
        reader.read_u32()?,
        reader.read_u32()?,
        reader.read_u32()?,
        reader.read_u32()?,
    ))
}

/// Interning pool writer used by the encoder.
#[derive(Debug, Default)]
pub struct StringPoolBuilder {
    strings: Vec<String>,
    indices: BTreeMap<String, u32>,
    utf8: bool,
}

impl StringPoolBuilder {
    pub fn new() -> Self {
        StringPoolBuilder::default()
    }

    /// Emit the pool with the UTF-8 flag set instead of UTF-16.
    pub fn with_utf8(mut self, utf8: bool) -> Self {
        self.utf8 = utf8;
        self
    }

    pub fn intern(&mut self, value: impl AsRef<str>) -> u32 {
        let value = value.as_ref();
        if let Some(&idx) = self.indices.get(value) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(value.to_string());
        self.indices.insert(value.to_string(), idx);
        idx
    }

    pub fn index_of(&self, value: &str) -> Option<u32> {
        self.indices.get(value).copied()
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn to_chunk(&self) -> Vec<u8> {
        let string_count = self.strings.len() as u32;
        let strings_start = STRING_POOL_HEADER_SIZE as u32 + string_count * 4;

        let mut string_data = Vec::new();
        let mut offsets = Vec::with_capacity(self.strings.len());
        for s in &self.strings {
            offsets.push(string_data.len() as u32);
            if self.utf8 {
                write_utf8_string(&mut string_data, s);
            } else {
                write_utf16_string(&mut string_data, s);
            }
        }
        align_to_four(&mut string_data);

        let flags = if self.utf8 {
            StringPoolFlags::UTF8
        } else {
            StringPoolFlags::empty()
        };

        let mut chunk = Vec::new();
        let start = begin_chunk(&mut chunk, RES_STRING_POOL_TYPE, STRING_POOL_HEADER_SIZE);
        write_u32(&mut chunk, string_count);
        write_u32(&mut chunk, 0); // style count
        write_u32(&mut chunk, flags.bits());
        write_u32(&mut chunk, strings_start);
        write_u32(&mut chunk, 0); // styles start
        for offset in offsets {
            write_u32(&mut chunk, offset);
        }
        chunk.extend_from_slice(&string_data);
        finalize_chunk(&mut chunk, start);
        chunk
    }
}

fn write_utf16_string(buf: &mut Vec<u8>, text: &str) {
    let units: Vec<u16> = text.encode_utf16().collect();
    let len = units.len();
    if len < 0x8000 {
        write_u16(buf, len as u16);
    } else {
        write_u16(buf, 0x8000 | ((len >> 16) as u16 & 0x7FFF));
        write_u16(buf, (len & 0xFFFF) as u16);
    }
    for unit in units {
        write_u16(buf, unit);
    }
    write_u16(buf, 0);
}

fn write_utf8_length(buf: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        buf.push(len as u8);
    } else {
        buf.push(0x80 | ((len >> 8) as u8 & 0x7F));
        buf.push((len & 0xFF) as u8);
    }
}

fn write_utf8_string(buf: &mut Vec<u8>, text: &str) {
    write_utf8_length(buf, text.chars().count());
    write_utf8_length(buf, text.len());
    buf.extend_from_slice(text.as_bytes());
    buf.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_chunk(chunk: &[u8]) -> StringPool {
        let header = ChunkHeader::parse(chunk, 0).unwrap();
        StringPool::parse(chunk, &header)
    }

    #[test]
    fn utf16_pool_decodes_in_order() {
        let mut builder = StringPoolBuilder::new();
        builder.intern("manifest");
        builder.intern("package");
        builder.intern("com.example");
        let pool = parse_chunk(&builder.to_chunk());

        assert_eq!(pool.len(), 3);
        assert_eq!(pool.declared_count(), 3);
        assert!(!pool.is_utf8());
        assert_eq!(pool.decode_all(), vec!["manifest", "package", "com.example"]);
        assert_eq!(pool.string_at(2).as_deref(), Some("com.example"));
        assert_eq!(pool.string_at(3), None);
        assert_eq!(pool.string_at(NO_ENTRY_INDEX), None);
    }

    #[test]
    fn utf8_pool_uses_first_length_byte() {
        let mut builder = StringPoolBuilder::new().with_utf8(true);
        builder.intern("uses-sdk");
        let pool = parse_chunk(&builder.to_chunk());
        assert!(pool.is_utf8());
        assert_eq!(pool.string_at(0).as_deref(), Some("uses-sdk"));
    }

    #[test]
    fn utf8_invalid_bytes_are_replaced() {
        let mut builder = StringPoolBuilder::new().with_utf8(true);
        builder.intern("ab");
        let mut chunk = builder.to_chunk();
        let data_start = (STRING_POOL_HEADER_SIZE as usize) + 4;
        chunk[data_start + 2] = 0xFF;
        let pool = parse_chunk(&chunk);
        assert_eq!(pool.string_at(0).as_deref(), Some("\u{FFFD}b"));
    }

    #[test]
    fn offset_past_end_is_none() {
        let mut builder = StringPoolBuilder::new();
        builder.intern("a");
        let mut chunk = builder.to_chunk();
        let slot = STRING_POOL_HEADER_SIZE as usize;
        chunk[slot..slot + 4].copy_from_slice(&0x0010_0000u32.to_le_bytes());
        let pool = parse_chunk(&chunk);
        assert_eq!(pool.string_at(0), None);
        assert_eq!(pool.decode_all(), vec![String::new()]);
    }

    #[test]
    fn two_part_length_is_combined_and_bounded() {
        let mut builder = StringPoolBuilder::new();
        builder.intern("abcd");
        let mut chunk = builder.to_chunk();
        let data_start = (STRING_POOL_HEADER_SIZE as usize) + 4;

        // ((0x8000 & 0x7FFF) << 16) | 2 == 2 code units: fits, reads "cd"'s slot onward.
        chunk[data_start..data_start + 2].copy_from_slice(&0x8000u16.to_le_bytes());
        chunk[data_start + 2..data_start + 4].copy_from_slice(&2u16.to_le_bytes());
        let pool = parse_chunk(&chunk);
        assert_eq!(pool.string_at(0).as_deref(), Some("bc"));

        // ((0x8001 & 0x7FFF) << 16) | 0 == 65536 code units: past the pool, empty.
        chunk[data_start..data_start + 2].copy_from_slice(&0x8001u16.to_le_bytes());
        chunk[data_start + 2..data_start + 4].copy_from_slice(&0u16.to_le_bytes());
        let pool = parse_chunk(&chunk);
        assert_eq!(pool.string_at(0).as_deref(), Some(""));
    }

    #[test]
    fn real_count_follows_offset_table() {
        let mut builder = StringPoolBuilder::new();
        builder.intern("a");
        builder.intern("b");
        let mut chunk = builder.to_chunk();
        chunk[8..12].copy_from_slice(&40u32.to_le_bytes());
        let pool = parse_chunk(&chunk);
        assert_eq!(pool.declared_count(), 40);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.string_at(1).as_deref(), Some("b"));
    }

    #[test]
    fn truncated_header_gives_empty_pool() {
        let chunk = [0x01, 0x00, 0x1C, 0x00, 0x40, 0x00, 0x00, 0x00, 0x02, 0x00];
        let pool = parse_chunk(&chunk);
        assert!(pool.is_empty());
        assert_eq!(pool.string_at(0), None);
    }
}

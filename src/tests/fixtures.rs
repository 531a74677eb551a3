use crate::android::chunk::{write_u16, write_u32};
use crate::android::encoder::EncodedChunks;
use crc32fast::Hasher as Crc32;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::Write;

#[derive(Clone)]
struct FixtureEntry {
    name: String,
    local_name: String,
    local_method: u16,
    central_method: u16,
    crc32: u32,
    payload: Vec<u8>,
    uncompressed_size: u32,
    zero_local_sizes: bool,
    local_extra: Vec<u8>,
    local_only: bool,
}

/// In-memory ZIP writer whose local and central headers can be made to disagree.
#[derive(Clone)]
pub struct ArchiveBuilder {
    entries: Vec<FixtureEntry>,
    eocd_copies: usize,
}

fn deflate_bytes(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("deflate into memory");
    encoder.finish().expect("finish deflate")
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        ArchiveBuilder {
            entries: Vec::new(),
            eocd_copies: 1,
        }
    }

    fn push(mut self, name: &str, data: &[u8], payload: Vec<u8>, method: u16) -> Self {
        let mut crc = Crc32::new();
        crc.update(data);
        self.entries.push(FixtureEntry {
            name: name.to_string(),
            local_name: name.to_string(),
            local_method: method,
            central_method: method,
            crc32: crc.finalize(),
            payload,
            uncompressed_size: data.len() as u32,
            zero_local_sizes: false,
            local_extra: Vec::new(),
            local_only: false,
        });
        self
    }

    fn edit(mut self, name: &str, f: impl FnOnce(&mut FixtureEntry)) -> Self {
        let entry = self
            .entries
            .iter_mut()
            .rev()
            .find(|entry| entry.name == name)
            .expect("fixture entry exists");
        f(entry);
        self
    }

    pub fn stored(self, name: &str, data: &[u8]) -> Self {
        self.stored_as(name, data, 0)
    }

    pub fn deflated(self, name: &str, data: &[u8]) -> Self {
        self.deflated_as(name, data, 8)
    }

    /// Store `data` uncompressed but declare `method` in both headers.
    pub fn stored_as(self, name: &str, data: &[u8], method: u16) -> Self {
        self.push(name, data, data.to_vec(), method)
    }

    /// Deflate `data` but declare `method` in both headers.
    pub fn deflated_as(self, name: &str, data: &[u8], method: u16) -> Self {
        self.push(name, data, deflate_bytes(data), method)
    }

    /// Zero the CRC and both sizes in the local header, as a data descriptor writer would.
    pub fn zero_local_sizes(self, name: &str) -> Self {
        self.edit(name, |entry| entry.zero_local_sizes = true)
    }

    pub fn local_name(self, name: &str, local_name: &str) -> Self {
        self.edit(name, |entry| entry.local_name = local_name.to_string())
    }

    pub fn local_method(self, name: &str, method: u16) -> Self {
        self.edit(name, |entry| entry.local_method = method)
    }

    pub fn central_method(self, name: &str, method: u16) -> Self {
        self.edit(name, |entry| entry.central_method = method)
    }

    pub fn local_extra(self, name: &str, extra: &[u8]) -> Self {
        self.edit(name, |entry| entry.local_extra = extra.to_vec())
    }

    /// Leave the entry out of the central directory.
    pub fn local_only(self, name: &str) -> Self {
        self.edit(name, |entry| entry.local_only = true)
    }

    /// Write the end of central directory record twice.
    pub fn duplicate_eocd(mut self) -> Self {
        self.eocd_copies += 1;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut offsets = Vec::new();
        for entry in &self.entries {
            offsets.push(buf.len() as u32);
            let (crc32, compressed, uncompressed) = if entry.zero_local_sizes {
                (0, 0, 0)
            } else {
                (entry.crc32, entry.payload.len() as u32, entry.uncompressed_size)
            };
            write_u32(&mut buf, 0x04034b50);
            write_u16(&mut buf, 20);
            write_u16(&mut buf, 0);
            write_u16(&mut buf, entry.local_method);
            write_u16(&mut buf, 0);
            write_u16(&mut buf, 0);
            write_u32(&mut buf, crc32);
            write_u32(&mut buf, compressed);
            write_u32(&mut buf, uncompressed);
            write_u16(&mut buf, entry.local_name.len() as u16);
            write_u16(&mut buf, entry.local_extra.len() as u16);
            buf.extend_from_slice(entry.local_name.as_bytes());
            buf.extend_from_slice(&entry.local_extra);
            buf.extend_from_slice(&entry.payload);
        }

        let central_offset = buf.len() as u32;
        let mut count = 0u16;
        for (entry, offset) in self.entries.iter().zip(offsets) {
            if entry.local_only {
                continue;
            }
            count += 1;
            write_u32(&mut buf, 0x02014b50);
            write_u16(&mut buf, 0x031E);
            write_u16(&mut buf, 20);
            write_u16(&mut buf, 0);
            write_u16(&mut buf, entry.central_method);
            write_u16(&mut buf, 0);
            write_u16(&mut buf, 0);
            write_u32(&mut buf, entry.crc32);
            write_u32(&mut buf, entry.payload.len() as u32);
            write_u32(&mut buf, entry.uncompressed_size);
            write_u16(&mut buf, entry.name.len() as u16);
            write_u16(&mut buf, 0);
            write_u16(&mut buf, 0);
            write_u16(&mut buf, 0);
            write_u16(&mut buf, 0);
            write_u32(&mut buf, 0o644 << 16);
            write_u32(&mut buf, offset);
            buf.extend_from_slice(entry.name.as_bytes());
        }
        let central_size = buf.len() as u32 - central_offset;

        for _ in 0..self.eocd_copies {
            write_u32(&mut buf, 0x06054b50);
            write_u16(&mut buf, 0);
            write_u16(&mut buf, 0);
            write_u16(&mut buf, count);
            write_u16(&mut buf, count);
            write_u32(&mut buf, central_size);
            write_u32(&mut buf, central_offset);
            write_u16(&mut buf, 0);
        }
        buf
    }
}

/// Append `count` zero bytes after node `index`, as packers do to break naive parsers.
pub fn pad_after_node(chunks: &EncodedChunks, index: usize, count: usize) -> Vec<u8> {
    let mut chunks = chunks.clone();
    chunks.nodes[index].extend(std::iter::repeat(0u8).take(count));
    chunks.assemble()
}

/// Set the declared size of node `index` to zero without moving any bytes.
pub fn zero_node_size(chunks: &EncodedChunks, index: usize) -> Vec<u8> {
    let mut chunks = chunks.clone();
    chunks.nodes[index][4..8].copy_from_slice(&0u32.to_le_bytes());
    chunks.assemble()
}

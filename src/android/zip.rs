//! Raw ZIP structure reader for APK files.
//!
//! Unlike a regular unzip library this keeps both copies of every entry's metadata, the
//! local file header and the central directory record, because the differences between
//! them are what tampered APKs exploit.

use byteorder::{LittleEndian, ReadBytesExt};
use flate2::read::DeflateDecoder;
use log::{debug, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Cursor, Read};
use std::path::Path;

/// Result alias for APK (ZIP) operations.
pub type ApkZipResult<T> = Result<T, ApkZipError>;

/// Errors surfaced while reading APK archive structures.
#[derive(Debug)]
pub enum ApkZipError {
    Io(io::Error),
    MissingEndOfCentralDirectory,
    Truncated { offset: usize, needed: usize },
    MissingEntry(String),
    Inflate(String),
}

impl fmt::Display for ApkZipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApkZipError::Io(err) => write!(f, "I/O error: {err}"),
            ApkZipError::MissingEndOfCentralDirectory => {
                write!(f, "No end of central directory record found")
            }
            ApkZipError::Truncated { offset, needed } => {
                write!(f, "Archive truncated reading {needed} bytes at 0x{offset:x}")
            }
            ApkZipError::MissingEntry(name) => write!(f, "Entry '{name}' not found"),
            ApkZipError::Inflate(msg) => write!(f, "Inflate failed: {msg}"),
        }
    }
}

impl std::error::Error for ApkZipError {}

impl From<io::Error> for ApkZipError {
    fn from(value: io::Error) -> Self {
        ApkZipError::Io(value)
    }
}

pub const LOCAL_FILE_HEADER_SIGNATURE: &[u8] = b"PK\x03\x04";
pub const CENTRAL_DIRECTORY_SIGNATURE: &[u8] = b"PK\x01\x02";
pub const END_OF_CENTRAL_DIRECTORY_SIGNATURE: &[u8] = b"PK\x05\x06";

/// Fixed part of a local file header.
pub const LOCAL_FILE_HEADER_SIZE: usize = 30;
/// Fixed part of a central directory record.
pub const CENTRAL_DIRECTORY_ENTRY_SIZE: usize = 46;
/// Fixed part of the end of central directory record.
pub const END_OF_CENTRAL_DIRECTORY_SIZE: usize = 22;

pub const MANIFEST_NAME: &str = "AndroidManifest.xml";

pub const METHOD_STORED: u16 = 0;
pub const METHOD_DEFLATED: u16 = 8;

fn slice_at(raw: &[u8], offset: usize, len: usize) -> ApkZipResult<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| raw.get(offset..end))
        .ok_or(ApkZipError::Truncated {
            offset,
            needed: len,
        })
}

/// Fields stored in both the local header and the central directory record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EntryFields {
    pub version_needed: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub file_name_length: u16,
    pub extra_field_length: u16,
    pub file_name: String,
    #[serde(skip)]
    pub extra_field: Vec<u8>,
}

impl EntryFields {
    /// Names of the fields whose values differ, sorted.
    pub fn differing_fields(&self, other: &EntryFields) -> Vec<&'static str> {
        let mut fields = Vec::new();
        let mut check = |name: &'static str, differs: bool| {
            if differs {
                fields.push(name);
            }
        };
        check("version_needed", self.version_needed != other.version_needed);
        check("flags", self.flags != other.flags);
        check("compression_method", self.compression_method != other.compression_method);
        check("last_mod_time", self.last_mod_time != other.last_mod_time);
        check("last_mod_date", self.last_mod_date != other.last_mod_date);
        check("crc32", self.crc32 != other.crc32);
        check("compressed_size", self.compressed_size != other.compressed_size);
        check("uncompressed_size", self.uncompressed_size != other.uncompressed_size);
        check("file_name_length", self.file_name_length != other.file_name_length);
        check("extra_field_length", self.extra_field_length != other.extra_field_length);
        check("file_name", self.file_name != other.file_name);
        check("extra_field", self.extra_field != other.extra_field);
        fields.sort_unstable();
        fields
    }
}

/// Shared tail of both header layouts, from the version-needed field through the sizes.
fn read_common(cursor: &mut Cursor<&[u8]>) -> io::Result<EntryFields> {
    Ok(EntryFields {
        version_needed: cursor.read_u16::<LittleEndian>()?,
        flags: cursor.read_u16::<LittleEndian>()?,
        compression_method: cursor.read_u16::<LittleEndian>()?,
        last_mod_time: cursor.read_u16::<LittleEndian>()?,
        last_mod_date: cursor.read_u16::<LittleEndian>()?,
        crc32: cursor.read_u32::<LittleEndian>()?,
        compressed_size: cursor.read_u32::<LittleEndian>()?,
        uncompressed_size: cursor.read_u32::<LittleEndian>()?,
        file_name_length: cursor.read_u16::<LittleEndian>()?,
        extra_field_length: cursor.read_u16::<LittleEndian>()?,
        ..EntryFields::default()
    })
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LocalFileHeader {
    /// Offset of the header signature in the archive.
    pub offset: usize,
    #[serde(flatten)]
    pub fields: EntryFields,
}

impl LocalFileHeader {
    pub fn parse(raw: &[u8], offset: usize) -> ApkZipResult<Self> {
        let fixed = slice_at(raw, offset, LOCAL_FILE_HEADER_SIZE)?;
        if &fixed[0..4] != LOCAL_FILE_HEADER_SIGNATURE {
            return Err(ApkZipError::MissingEntry(format!(
                "no local file header at 0x{offset:x}"
            )));
        }
        let mut cursor = Cursor::new(&fixed[4..]);
        let mut fields = read_common(&mut cursor)?;

        let name_start = offset + LOCAL_FILE_HEADER_SIZE;
        let name = slice_at(raw, name_start, fields.file_name_length as usize)?;
        let extra_start = name_start + name.len();
        let extra = slice_at(raw, extra_start, fields.extra_field_length as usize)?;
        fields.file_name = String::from_utf8_lossy(name).into_owned();
        fields.extra_field = extra.to_vec();

        Ok(LocalFileHeader { offset, fields })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CentralDirectoryEntry {
    pub version_made_by: u16,
    #[serde(flatten)]
    pub fields: EntryFields,
    pub comment_length: u16,
    pub disk_number: u16,
    pub internal_attributes: u16,
    pub external_attributes: u32,
    pub local_header_offset: u32,
    pub comment: String,
}

impl CentralDirectoryEntry {
    /// Parse the record at `offset`, returning it with the offset of the next record.
    pub fn parse(raw: &[u8], offset: usize) -> ApkZipResult<(Self, usize)> {
        let fixed = slice_at(raw, offset, CENTRAL_DIRECTORY_ENTRY_SIZE)?;
        if &fixed[0..4] != CENTRAL_DIRECTORY_SIGNATURE {
            return Err(ApkZipError::MissingEntry(format!(
                "no central directory record at 0x{offset:x}"
            )));
        }
        let mut cursor = Cursor::new(&fixed[4..]);
        let version_made_by = cursor.read_u16::<LittleEndian>()?;
        let mut fields = read_common(&mut cursor)?;
        let comment_length = cursor.read_u16::<LittleEndian>()?;
        let disk_number = cursor.read_u16::<LittleEndian>()?;
        let internal_attributes = cursor.read_u16::<LittleEndian>()?;
        let external_attributes = cursor.read_u32::<LittleEndian>()?;
        let local_header_offset = cursor.read_u32::<LittleEndian>()?;

        let mut next = offset + CENTRAL_DIRECTORY_ENTRY_SIZE;
        let name = slice_at(raw, next, fields.file_name_length as usize)?;
        next += name.len();
        let extra = slice_at(raw, next, fields.extra_field_length as usize)?;
        next += extra.len();
        let comment = slice_at(raw, next, comment_length as usize)?;
        next += comment.len();
        fields.file_name = String::from_utf8_lossy(name).into_owned();
        fields.extra_field = extra.to_vec();

        Ok((
            CentralDirectoryEntry {
                version_made_by,
                fields,
                comment_length,
                disk_number,
                internal_attributes,
                external_attributes,
                local_header_offset,
                comment: String::from_utf8_lossy(comment).into_owned(),
            },
            next,
        ))
    }
}

/// End of Central Directory (EOCD) - 22 bytes minimum
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EndOfCentralDirectory {
    pub offset: usize,
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    /// Search backwards for the last record, over at most the maximum comment span.
    pub fn find(raw: &[u8]) -> ApkZipResult<Self> {
        if raw.len() < END_OF_CENTRAL_DIRECTORY_SIZE {
            return Err(ApkZipError::MissingEndOfCentralDirectory);
        }
        let last = raw.len() - END_OF_CENTRAL_DIRECTORY_SIZE;
        let first = last.saturating_sub(u16::MAX as usize);
        let offset = (first..=last)
            .rev()
            .find(|&pos| &raw[pos..pos + 4] == END_OF_CENTRAL_DIRECTORY_SIGNATURE)
            .ok_or(ApkZipError::MissingEndOfCentralDirectory)?;

        let mut cursor = Cursor::new(&raw[offset + 4..offset + END_OF_CENTRAL_DIRECTORY_SIZE]);
        Ok(EndOfCentralDirectory {
            offset,
            disk_number: cursor.read_u16::<LittleEndian>()?,
            disk_with_cd: cursor.read_u16::<LittleEndian>()?,
            disk_entries: cursor.read_u16::<LittleEndian>()?,
            total_entries: cursor.read_u16::<LittleEndian>()?,
            cd_size: cursor.read_u32::<LittleEndian>()?,
            cd_offset: cursor.read_u32::<LittleEndian>()?,
            comment_len: cursor.read_u16::<LittleEndian>()?,
        })
    }
}

/// How an entry's data actually had to be read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActualCompression {
    Stored,
    Deflated,
    /// Unknown method, data turned out to be raw deflate.
    DeflatedTampered,
    /// Unknown method, data did not inflate and was taken as stored.
    StoredTampered,
}

impl ActualCompression {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActualCompression::Stored => "stored",
            ActualCompression::Deflated => "deflated",
            ActualCompression::DeflatedTampered => "deflated_tampered",
            ActualCompression::StoredTampered => "stored_tampered",
        }
    }

    pub fn is_tampered(&self) -> bool {
        matches!(
            self,
            ActualCompression::DeflatedTampered | ActualCompression::StoredTampered
        )
    }
}

impl fmt::Display for ActualCompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn inflate(data: &[u8]) -> ApkZipResult<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|err| ApkZipError::Inflate(err.to_string()))?;
    Ok(out)
}

/// Read the data of one entry, using the central record to locate it.
///
/// Sizes come from the local header unless either of them is zero, in which case the
/// central record's sizes are used.
pub fn extract_entry(
    raw: &[u8],
    local: &LocalFileHeader,
    central: &CentralDirectoryEntry,
) -> ApkZipResult<(Vec<u8>, ActualCompression)> {
    let sizes = if local.fields.compressed_size == 0 || local.fields.uncompressed_size == 0 {
        &central.fields
    } else {
        &local.fields
    };
    let data_offset = central.local_header_offset as usize
        + LOCAL_FILE_HEADER_SIZE
        + local.fields.file_name_length as usize
        + local.fields.extra_field_length as usize;

    let stored = || slice_at(raw, data_offset, sizes.uncompressed_size as usize).map(<[u8]>::to_vec);

    match local.fields.compression_method {
        METHOD_STORED => Ok((stored()?, ActualCompression::Stored)),
        METHOD_DEFLATED => {
            let compressed = slice_at(raw, data_offset, sizes.compressed_size as usize)?;
            Ok((inflate(compressed)?, ActualCompression::Deflated))
        }
        method => {
            let inflated = slice_at(raw, data_offset, sizes.compressed_size as usize)
                .and_then(inflate);
            match inflated {
                Ok(data) => {
                    debug!(
                        "[zip] {} declares method {method} but inflates",
                        local.fields.file_name
                    );
                    Ok((data, ActualCompression::DeflatedTampered))
                }
                Err(err) => {
                    debug!(
                        "[zip] {} declares method {method} and does not inflate ({err})",
                        local.fields.file_name
                    );
                    Ok((stored()?, ActualCompression::StoredTampered))
                }
            }
        }
    }
}

/// Both header collections of an archive, keyed by file name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ZipEntries {
    pub local: BTreeMap<String, LocalFileHeader>,
    pub central: BTreeMap<String, CentralDirectoryEntry>,
}

impl ZipEntries {
    pub fn from_file(path: impl AsRef<Path>) -> ApkZipResult<(Vec<u8>, Self)> {
        let raw = fs::read(path)?;
        let entries = Self::parse(&raw)?;
        Ok((raw, entries))
    }

    /// Parse the central directory, the local header each record points at, then any other
    /// local header in front of the central directory that no record mentions.
    ///
    /// A record or local header that cannot be read ends up missing from its collection
    /// rather than failing the whole archive; only a missing end of central directory does.
    pub fn parse(raw: &[u8]) -> ApkZipResult<Self> {
        let eocd = EndOfCentralDirectory::find(raw)?;
        debug!(
            "[zip] EOCD at 0x{:x}: {} entries, directory at 0x{:x}",
            eocd.offset, eocd.total_entries, eocd.cd_offset
        );

        let mut entries = ZipEntries::default();
        // Header and data spans already accounted for; the scan below skips them.
        let mut spans = Vec::new();
        let mut offset = eocd.cd_offset as usize;
        for index in 0..eocd.total_entries {
            let (entry, next) = match CentralDirectoryEntry::parse(raw, offset) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!("[zip] central directory record {index} unreadable: {err}");
                    break;
                }
            };
            offset = next;

            let local_offset = entry.local_header_offset as usize;
            match LocalFileHeader::parse(raw, local_offset) {
                Ok(local) => {
                    let data_start = local_offset
                        + LOCAL_FILE_HEADER_SIZE
                        + local.fields.file_name_length as usize
                        + local.fields.extra_field_length as usize;
                    let size = local.fields.compressed_size.max(entry.fields.compressed_size);
                    spans.push(local_offset..data_start + size as usize);
                    entries.local.insert(local.fields.file_name.clone(), local);
                }
                Err(err) => warn!(
                    "[zip] local header for '{}' unreadable: {err}",
                    entry.fields.file_name
                ),
            }
            entries.central.insert(entry.fields.file_name.clone(), entry);
        }

        let scan_end = (eocd.cd_offset as usize).min(raw.len());
        let mut pos = 0;
        while pos + LOCAL_FILE_HEADER_SIZE <= scan_end {
            if let Some(span) = spans.iter().find(|span| span.contains(&pos)) {
                pos = span.end;
                continue;
            }
            if &raw[pos..pos + 4] == LOCAL_FILE_HEADER_SIGNATURE {
                if let Ok(local) = LocalFileHeader::parse(raw, pos) {
                    let data_end = pos
                        + LOCAL_FILE_HEADER_SIZE
                        + local.fields.file_name_length as usize
                        + local.fields.extra_field_length as usize
                        + local.fields.compressed_size as usize;
                    spans.push(pos..data_end);
                    if !entries.local.contains_key(&local.fields.file_name) {
                        debug!(
                            "[zip] local header for '{}' at 0x{pos:x} has no directory record",
                            local.fields.file_name
                        );
                        entries.local.insert(local.fields.file_name.clone(), local);
                    }
                }
            }
            pos += 1;
        }

        Ok(entries)
    }

    /// Extract a named entry present in both collections.
    pub fn extract(&self, raw: &[u8], name: &str) -> ApkZipResult<(Vec<u8>, ActualCompression)> {
        let local = self
            .local
            .get(name)
            .ok_or_else(|| ApkZipError::MissingEntry(name.to_string()))?;
        let central = self
            .central
            .get(name)
            .ok_or_else(|| ApkZipError::MissingEntry(name.to_string()))?;
        extract_entry(raw, local, central)
    }

    /// The binary `AndroidManifest.xml` of the archive.
    pub fn manifest_bytes(&self, raw: &[u8]) -> ApkZipResult<Vec<u8>> {
        Ok(self.extract(raw, MANIFEST_NAME)?.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures::ArchiveBuilder;

    #[test]
    fn reads_both_header_collections() {
        let raw = ArchiveBuilder::new()
            .stored("res/raw/a.txt", b"hello")
            .deflated(MANIFEST_NAME, &[7u8; 300])
            .build();
        let entries = ZipEntries::parse(&raw).unwrap();
        assert_eq!(entries.local.len(), 2);
        assert_eq!(entries.central.len(), 2);
        let local = &entries.local[MANIFEST_NAME];
        let central = &entries.central[MANIFEST_NAME];
        assert_eq!(local.fields.compression_method, METHOD_DEFLATED);
        assert!(local.fields.differing_fields(&central.fields).is_empty());
        assert_eq!(entries.manifest_bytes(&raw).unwrap(), vec![7u8; 300]);
    }

    #[test]
    fn missing_eocd_is_an_error() {
        assert!(matches!(
            ZipEntries::parse(b"PK\x03\x04 not really a zip file"),
            Err(ApkZipError::MissingEndOfCentralDirectory)
        ));
    }

    #[test]
    fn unknown_method_is_detected_by_trial_inflate() {
        let raw = ArchiveBuilder::new()
            .deflated_as("a.bin", &[1u8; 64], 0x1234)
            .stored_as("b.bin", b"plain bytes", 0x4321)
            .build();
        let entries = ZipEntries::parse(&raw).unwrap();
        let (a, how_a) = entries.extract(&raw, "a.bin").unwrap();
        assert_eq!(a, vec![1u8; 64]);
        assert_eq!(how_a, ActualCompression::DeflatedTampered);
        let (b, how_b) = entries.extract(&raw, "b.bin").unwrap();
        assert_eq!(b, b"plain bytes".to_vec());
        assert_eq!(how_b, ActualCompression::StoredTampered);
        assert!(how_b.is_tampered());
    }

    #[test]
    fn zero_local_sizes_fall_back_to_central() {
        let raw = ArchiveBuilder::new()
            .stored("a.txt", b"abc")
            .zero_local_sizes("a.txt")
            .build();
        let entries = ZipEntries::parse(&raw).unwrap();
        let fields = &entries.local["a.txt"].fields;
        assert_eq!(fields.compressed_size, 0);
        assert_eq!(
            fields.differing_fields(&entries.central["a.txt"].fields),
            vec!["compressed_size", "crc32", "uncompressed_size"]
        );
        assert_eq!(entries.extract(&raw, "a.txt").unwrap().0, b"abc".to_vec());
    }
}

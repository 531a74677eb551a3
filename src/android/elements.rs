//! The element stream that follows the string pool and resource map.

use crate::android::chunk::{locate_next_chunk, BinaryReader, ChunkHeader, ChunkType};
use crate::android::error::{AxmlError, AxmlResult};
use log::{debug, warn};

/// Size of the attribute extension that opens a start-element body.
pub const ATTRIBUTE_EXTENSION_SIZE: u16 = 20;
/// Size of one attribute record: three string indices plus a typed value.
pub const ATTRIBUTE_SIZE: u16 = 20;

pub const TYPE_NULL: u8 = 0x00;
pub const TYPE_REFERENCE: u8 = 0x01;
pub const TYPE_ATTRIBUTE: u8 = 0x02;
pub const TYPE_STRING: u8 = 0x03;
pub const TYPE_FLOAT: u8 = 0x04;
pub const TYPE_DIMENSION: u8 = 0x05;
pub const TYPE_FRACTION: u8 = 0x06;
pub const TYPE_INT_DEC: u8 = 0x10;
pub const TYPE_INT_HEX: u8 = 0x11;
pub const TYPE_INT_BOOLEAN: u8 = 0x12;
pub const TYPE_INT_COLOR_ARGB8: u8 = 0x1c;
pub const TYPE_INT_COLOR_RGB8: u8 = 0x1d;
pub const TYPE_INT_COLOR_ARGB4: u8 = 0x1e;
pub const TYPE_INT_COLOR_RGB4: u8 = 0x1f;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    Null,
    Reference,
    Attribute,
    String,
    Float,
    Dimension,
    Fraction,
    IntDec,
    IntHex,
    Boolean,
    ColorArgb8,
    ColorRgb8,
    ColorArgb4,
    ColorRgb4,
    Other(u8),
}

impl DataType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            TYPE_NULL => DataType::Null,
            TYPE_REFERENCE => DataType::Reference,
            TYPE_ATTRIBUTE => DataType::Attribute,
            TYPE_STRING => DataType::String,
            TYPE_FLOAT => DataType::Float,
            TYPE_DIMENSION => DataType::Dimension,
            TYPE_FRACTION => DataType::Fraction,
            TYPE_INT_DEC => DataType::IntDec,
            TYPE_INT_HEX => DataType::IntHex,
            TYPE_INT_BOOLEAN => DataType::Boolean,
            TYPE_INT_COLOR_ARGB8 => DataType::ColorArgb8,
            TYPE_INT_COLOR_RGB8 => DataType::ColorRgb8,
            TYPE_INT_COLOR_ARGB4 => DataType::ColorArgb4,
            TYPE_INT_COLOR_RGB4 => DataType::ColorRgb4,
            other => DataType::Other(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            DataType::Null => TYPE_NULL,
            DataType::Reference => TYPE_REFERENCE,
            DataType::Attribute => TYPE_ATTRIBUTE,
            DataType::String => TYPE_STRING,
            DataType::Float => TYPE_FLOAT,
            DataType::Dimension => TYPE_DIMENSION,
            DataType::Fraction => TYPE_FRACTION,
            DataType::IntDec => TYPE_INT_DEC,
            DataType::IntHex => TYPE_INT_HEX,
            DataType::Boolean => TYPE_INT_BOOLEAN,
            DataType::ColorArgb8 => TYPE_INT_COLOR_ARGB8,
            DataType::ColorRgb8 => TYPE_INT_COLOR_RGB8,
            DataType::ColorArgb4 => TYPE_INT_COLOR_ARGB4,
            DataType::ColorRgb4 => TYPE_INT_COLOR_RGB4,
            DataType::Other(v) => *v,
        }
    }
}

/// `Res_value`: size, reserved byte, data type, payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypedValue {
    pub size: u16,
    pub res0: u8,
    pub data_type: DataType,
    pub data: u32,
}

impl TypedValue {
    fn read(reader: &mut BinaryReader<'_>) -> AxmlResult<Self> {
        Ok(TypedValue {
            size: reader.read_u16()?,
            res0: reader.read_u8()?,
            data_type: DataType::from_u8(reader.read_u8()?),
            data: reader.read_u32()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attribute {
    pub namespace: u32,
    pub name: u32,
    pub raw_value: u32,
    pub typed_value: TypedValue,
}

impl Attribute {
    fn read(reader: &mut BinaryReader<'_>) -> AxmlResult<Self> {
        Ok(Attribute {
            namespace: reader.read_u32()?,
            name: reader.read_u32()?,
            raw_value: reader.read_u32()?,
            typed_value: TypedValue::read(reader)?,
        })
    }
}

/// Chunk header plus the line number and comment every node carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeHeader {
    pub chunk: ChunkHeader,
    pub line_number: u32,
    pub comment: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Namespace {
    pub node: NodeHeader,
    pub prefix: u32,
    pub uri: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttributeExtension {
    pub namespace: u32,
    pub name: u32,
    pub attribute_start: u16,
    pub attribute_size: u16,
    pub attribute_count: u16,
    pub id_index: u16,
    pub class_index: u16,
    pub style_index: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartElement {
    pub node: NodeHeader,
    pub extension: AttributeExtension,
    pub attributes: Vec<Attribute>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndElement {
    pub node: NodeHeader,
    pub namespace: u32,
    pub name: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CData {
    pub node: NodeHeader,
    pub data: u32,
    pub typed_value: TypedValue,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownChunk {
    pub header: ChunkHeader,
    pub raw: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Element {
    StartNamespace(Namespace),
    EndNamespace(Namespace),
    StartElement(StartElement),
    EndElement(EndElement),
    CData(CData),
    Unknown(UnknownChunk),
}

impl Element {
    /// Materialise the chunk described by `header`.
    ///
    /// Reads are confined to the bytes of the chunk itself, so a record that claims more
    /// than its chunk holds fails with [`AxmlError::Truncated`] instead of reading into the
    /// next chunk. Types outside the node set come back as [`Element::Unknown`].
    pub fn parse(data: &[u8], header: &ChunkHeader) -> AxmlResult<Element> {
        let kind = header.kind();
        let chunk = header.slice(data);
        if !matches!(
            kind,
            ChunkType::StartNamespace
                | ChunkType::EndNamespace
                | ChunkType::StartElement
                | ChunkType::EndElement
                | ChunkType::CData
        ) {
            return Ok(Element::Unknown(UnknownChunk {
                header: *header,
                raw: chunk.to_vec(),
            }));
        }

        let mut reader = BinaryReader::at(chunk, 8);
        let node = NodeHeader {
            chunk: *header,
            line_number: reader.read_u32()?,
            comment: reader.read_u32()?,
        };
        reader.seek(header.header_size as usize).map_err(|_| AxmlError::Truncated {
            offset: header.start,
            needed: header.header_size as usize,
        })?;

        let element = match kind {
            ChunkType::StartNamespace | ChunkType::EndNamespace => {
                let namespace = Namespace {
                    node,
                    prefix: reader.read_u32()?,
                    uri: reader.read_u32()?,
                };
                if kind == ChunkType::StartNamespace {
                    Element::StartNamespace(namespace)
                } else {
                    Element::EndNamespace(namespace)
                }
            }
            ChunkType::StartElement => Element::StartElement(read_start_element(node, &mut reader)?),
            ChunkType::EndElement => Element::EndElement(EndElement {
                node,
                namespace: reader.read_u32()?,
                name: reader.read_u32()?,
            }),
            _ => Element::CData(CData {
                node,
                data: reader.read_u32()?,
                typed_value: TypedValue::read(&mut reader)?,
            }),
        };
        Ok(element)
    }

    pub fn chunk_header(&self) -> &ChunkHeader {
        match self {
            Element::StartNamespace(ns) | Element::EndNamespace(ns) => &ns.node.chunk,
            Element::StartElement(start) => &start.node.chunk,
            Element::EndElement(end) => &end.node.chunk,
            Element::CData(cdata) => &cdata.node.chunk,
            Element::Unknown(unknown) => &unknown.header,
        }
    }
}

fn read_start_element(node: NodeHeader, reader: &mut BinaryReader<'_>) -> AxmlResult<StartElement> {
    let extension = AttributeExtension {
        namespace: reader.read_u32()?,
        name: reader.read_u32()?,
        attribute_start: reader.read_u16()?,
        attribute_size: reader.read_u16()?,
        attribute_count: reader.read_u16()?,
        id_index: reader.read_u16()?,
        class_index: reader.read_u16()?,
        style_index: reader.read_u16()?,
    };

    if extension.attribute_start > ATTRIBUTE_EXTENSION_SIZE {
        reader.skip((extension.attribute_start - ATTRIBUTE_EXTENSION_SIZE) as usize);
    }
    let stride = extension.attribute_size.max(ATTRIBUTE_SIZE) as usize;

    let mut attributes = Vec::with_capacity(extension.attribute_count as usize);
    for _ in 0..extension.attribute_count {
        let record_start = reader.position();
        attributes.push(Attribute::read(reader)?);
        reader.seek(record_start + stride).map_err(|_| AxmlError::Truncated {
            offset: node.chunk.start + record_start,
            needed: stride,
        })?;
    }

    Ok(StartElement {
        node,
        extension,
        attributes,
    })
}

/// Tolerant walk of the element stream starting at `start`.
///
/// Leading garbage before a chunk is skipped by [`locate_next_chunk`], chunks outside the
/// node set and chunks that fail to parse are logged and dropped. With `limit`, the walk
/// stops once that many elements have been collected.
pub fn process_elements(data: &[u8], start: usize, limit: Option<usize>) -> Vec<Element> {
    let mut elements = Vec::new();
    let mut pos = start;

    while limit.map_or(true, |limit| elements.len() < limit) {
        let Some(next) = locate_next_chunk(data, pos) else {
            if pos < data.len() {
                debug!("[axml] {} trailing bytes at 0x{pos:x} hold no chunk", data.len() - pos);
            }
            break;
        };
        if next != pos {
            debug!("[axml] resynchronised past {} bytes at 0x{pos:x}", next - pos);
        }
        let header = match ChunkHeader::parse(data, next) {
            Ok(header) => header,
            Err(_) => break,
        };
        pos = header.end().min(data.len());

        match Element::parse(data, &header) {
            Ok(Element::Unknown(unknown)) => {
                warn!(
                    "[axml] skipping unknown chunk type 0x{:04x} at 0x{:x}",
                    unknown.header.chunk_type, unknown.header.start
                );
            }
            Ok(element) => elements.push(element),
            Err(err) => {
                warn!("[axml] skipping malformed chunk at 0x{:x}: {err}", header.start);
            }
        }
    }

    elements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::android::chunk::{
        begin_chunk, finalize_chunk, write_u16, write_u32, NO_ENTRY_INDEX,
        RES_XML_END_ELEMENT_TYPE, RES_XML_START_ELEMENT_TYPE,
    };

    fn start_element(attribute_start: u16, attribute_size: u16, attrs: &[(u32, u32)]) -> Vec<u8> {
        let mut buf = Vec::new();
        let start = begin_chunk(&mut buf, RES_XML_START_ELEMENT_TYPE, 16);
        write_u32(&mut buf, 1);
        write_u32(&mut buf, NO_ENTRY_INDEX);
        write_u32(&mut buf, NO_ENTRY_INDEX);
        write_u32(&mut buf, 0);
        write_u16(&mut buf, attribute_start);
        write_u16(&mut buf, attribute_size);
        write_u16(&mut buf, attrs.len() as u16);
        write_u16(&mut buf, 0);
        write_u16(&mut buf, 0);
        write_u16(&mut buf, 0);
        buf.extend(std::iter::repeat(0xAB).take(attribute_start.saturating_sub(20) as usize));
        for (name, data) in attrs {
            write_u32(&mut buf, NO_ENTRY_INDEX);
            write_u32(&mut buf, *name);
            write_u32(&mut buf, NO_ENTRY_INDEX);
            write_u16(&mut buf, 8);
            buf.push(0);
            buf.push(TYPE_INT_DEC);
            write_u32(&mut buf, *data);
            buf.extend(std::iter::repeat(0xCD).take(attribute_size.saturating_sub(20) as usize));
        }
        finalize_chunk(&mut buf, start);
        buf
    }

    fn end_element(name: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        let start = begin_chunk(&mut buf, RES_XML_END_ELEMENT_TYPE, 16);
        write_u32(&mut buf, 2);
        write_u32(&mut buf, NO_ENTRY_INDEX);
        write_u32(&mut buf, NO_ENTRY_INDEX);
        write_u32(&mut buf, name);
        finalize_chunk(&mut buf, start);
        buf
    }

    #[test]
    fn attribute_start_and_stride_are_honoured() {
        let data = start_element(28, 24, &[(1, 7), (2, 9)]);
        let header = ChunkHeader::parse(&data, 0).unwrap();
        let Element::StartElement(start) = Element::parse(&data, &header).unwrap() else {
            panic!("expected a start element");
        };
        assert_eq!(start.node.line_number, 1);
        assert_eq!(start.extension.attribute_count, 2);
        let names: Vec<u32> = start.attributes.iter().map(|a| a.name).collect();
        assert_eq!(names, vec![1, 2]);
        assert_eq!(start.attributes[1].typed_value.data, 9);
        assert_eq!(start.attributes[1].typed_value.data_type, DataType::IntDec);
    }

    #[test]
    fn attribute_count_past_chunk_is_truncated() {
        let mut data = start_element(20, 20, &[(1, 7)]);
        data[28..30].copy_from_slice(&5u16.to_le_bytes());
        let header = ChunkHeader::parse(&data, 0).unwrap();
        assert!(matches!(
            Element::parse(&data, &header),
            Err(AxmlError::Truncated { .. })
        ));
    }

    #[test]
    fn walk_skips_padding_and_unknown_chunks() {
        let mut data = start_element(20, 20, &[]);
        data.extend_from_slice(&[0u8; 5]);
        data.extend_from_slice(&[0x77, 0x07, 0x08, 0x00, 0x0C, 0x00, 0x00, 0x00, 0, 0, 0, 0]);
        data.extend_from_slice(&end_element(4));

        let elements = process_elements(&data, 0, None);
        assert_eq!(elements.len(), 2);
        assert!(matches!(elements[0], Element::StartElement(_)));
        assert!(matches!(elements[1], Element::EndElement(EndElement { name: 4, .. })));
    }

    #[test]
    fn walk_stops_at_limit() {
        let mut data = start_element(20, 20, &[]);
        data.extend_from_slice(&start_element(20, 20, &[]));
        data.extend_from_slice(&end_element(4));
        assert_eq!(process_elements(&data, 0, Some(2)).len(), 2);
        assert_eq!(process_elements(&data, 0, None).len(), 3);
    }

    #[test]
    fn data_types_keep_unknown_codes() {
        assert_eq!(DataType::from_u8(0x12), DataType::Boolean);
        assert_eq!(DataType::from_u8(0x42), DataType::Other(0x42));
        assert_eq!(DataType::Other(0x42).as_u8(), 0x42);
    }
}

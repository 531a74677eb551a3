//! Text XML to binary XML.
//!
//! A small reference encoder: it is what the decoder's output is checked against for
//! rendering stability, and what test fixtures are built from. Values are stored typed only
//! when their text is exactly what the decoder would print for that type, so a
//! decode/encode/decode cycle reproduces the same text.

use crate::android::chunk::{
    begin_chunk, finalize_chunk, write_u16, write_u32, NO_ENTRY_INDEX, RES_XML_CDATA_TYPE,
    RES_XML_END_ELEMENT_TYPE, RES_XML_END_NAMESPACE_TYPE, RES_XML_RESOURCE_MAP_TYPE,
    RES_XML_START_ELEMENT_TYPE, RES_XML_START_NAMESPACE_TYPE, RES_XML_TYPE,
};
use crate::android::elements::{
    ATTRIBUTE_EXTENSION_SIZE, ATTRIBUTE_SIZE, TYPE_ATTRIBUTE, TYPE_INT_BOOLEAN, TYPE_INT_DEC,
    TYPE_INT_HEX, TYPE_REFERENCE, TYPE_STRING,
};
use crate::android::error::{AxmlError, AxmlResult};
use crate::android::render::{android_attribute_id, ANDROID_NAMESPACE_URI, ANDROID_PREFIX};
use crate::android::string_pool::StringPoolBuilder;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

const NODE_HEADER_SIZE: u16 = 16;

/// The chunks of an encoded document, kept apart so callers can splice bytes between them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodedChunks {
    pub string_pool: Vec<u8>,
    pub resource_map: Vec<u8>,
    /// Namespace, element and text chunks in document order.
    pub nodes: Vec<Vec<u8>>,
}

impl EncodedChunks {
    /// Concatenate everything behind an outer document header.
    pub fn assemble(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let start = begin_chunk(&mut buf, RES_XML_TYPE, 8);
        buf.extend_from_slice(&self.string_pool);
        buf.extend_from_slice(&self.resource_map);
        for node in &self.nodes {
            buf.extend_from_slice(node);
        }
        finalize_chunk(&mut buf, start);
        buf
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Encoder {
    utf8: bool,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder::default()
    }

    /// Write the string pool as UTF-8 instead of UTF-16.
    pub fn with_utf8(mut self, utf8: bool) -> Self {
        self.utf8 = utf8;
        self
    }

    pub fn encode(&self, xml: &str) -> AxmlResult<Vec<u8>> {
        Ok(self.encode_chunks(xml)?.assemble())
    }

    pub fn encode_chunks(&self, xml: &str) -> AxmlResult<EncodedChunks> {
        let document = parse_document(xml)?;

        let mut pool = StringPoolBuilder::new().with_utf8(self.utf8);
        let mut resource_ids = Vec::new();
        collect_resource_names(&document.root, &document.namespaces, &mut pool, &mut resource_ids);
        for (prefix, uri) in &document.namespaces {
            pool.intern(prefix);
            pool.intern(uri);
        }
        collect_strings(&document.root, &document.namespaces, &mut pool);

        let resource_map = if resource_ids.is_empty() {
            Vec::new()
        } else {
            let mut buf = Vec::new();
            let start = begin_chunk(&mut buf, RES_XML_RESOURCE_MAP_TYPE, 8);
            for id in &resource_ids {
                write_u32(&mut buf, *id);
            }
            finalize_chunk(&mut buf, start);
            buf
        };

        let mut writer = NodeWriter {
            pool: &pool,
            namespaces: &document.namespaces,
            nodes: Vec::new(),
            line: 1,
        };
        for (prefix, uri) in &document.namespaces {
            writer.namespace(RES_XML_START_NAMESPACE_TYPE, prefix, uri);
        }
        writer.element(&document.root)?;
        for (prefix, uri) in document.namespaces.iter().rev() {
            writer.namespace(RES_XML_END_NAMESPACE_TYPE, prefix, uri);
        }

        Ok(EncodedChunks {
            string_pool: pool.to_chunk(),
            resource_map,
            nodes: writer.nodes,
        })
    }
}

/// Encode with the default options.
pub fn encode(xml: &str) -> AxmlResult<Vec<u8>> {
    Encoder::new().encode(xml)
}

pub fn encode_chunks(xml: &str) -> AxmlResult<EncodedChunks> {
    Encoder::new().encode_chunks(xml)
}

#[derive(Clone, Debug)]
struct XmlAttribute {
    prefix: Option<String>,
    name: String,
    value: String,
}

#[derive(Clone, Debug)]
struct XmlNode {
    prefix: Option<String>,
    name: String,
    attributes: Vec<XmlAttribute>,
    text: Option<String>,
    children: Vec<XmlNode>,
}

struct XmlDocument {
    root: XmlNode,
    /// `(prefix, uri)` in order of declaration, one entry per prefix.
    namespaces: Vec<(String, String)>,
}

fn split_qname(name: &str) -> (Option<String>, String) {
    match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, name.to_string()),
    }
}

fn utf8(bytes: &[u8]) -> AxmlResult<&str> {
    std::str::from_utf8(bytes).map_err(|err| AxmlError::Xml(err.to_string()))
}

fn declare(namespaces: &mut Vec<(String, String)>, prefix: &str, uri: &str) {
    if !namespaces.iter().any(|(known, _)| known == prefix) {
        namespaces.push((prefix.to_string(), uri.to_string()));
    }
}

fn read_node(start: &BytesStart<'_>, namespaces: &mut Vec<(String, String)>) -> AxmlResult<XmlNode> {
    let (prefix, name) = split_qname(utf8(start.name().as_ref())?);
    let mut attributes = Vec::new();
    for attr in start.attributes().with_checks(false) {
        let attr = attr?;
        let key = utf8(attr.key.as_ref())?;
        let value = attr.unescape_value()?.into_owned();
        if let Some(declared) = key.strip_prefix("xmlns:") {
            declare(namespaces, declared, &value);
            continue;
        }
        if key == "xmlns" {
            continue;
        }
        let (prefix, name) = split_qname(key);
        attributes.push(XmlAttribute {
            prefix,
            name,
            value,
        });
    }
    Ok(XmlNode {
        prefix,
        name,
        attributes,
        text: None,
        children: Vec::new(),
    })
}

fn attach(stack: &mut [XmlNode], root: &mut Option<XmlNode>, node: XmlNode) -> AxmlResult<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
        Ok(())
    } else if root.is_none() {
        *root = Some(node);
        Ok(())
    } else {
        Err(AxmlError::MalformedDocument(
            "Multiple root elements".to_string(),
        ))
    }
}

fn parse_document(xml: &str) -> AxmlResult<XmlDocument> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;
    let mut namespaces = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                let node = read_node(&start, &mut namespaces)?;
                stack.push(node);
            }
            Event::Empty(start) => {
                let node = read_node(&start, &mut namespaces)?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::End(_) => {
                let node = stack.pop().ok_or_else(|| {
                    AxmlError::MalformedDocument("Unbalanced end tag".to_string())
                })?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    let content = text.unescape()?.into_owned();
                    current.text.get_or_insert_with(String::new).push_str(&content);
                }
            }
            Event::CData(text) => {
                if let Some(current) = stack.last_mut() {
                    let content = utf8(text.as_ref())?;
                    current.text.get_or_insert_with(String::new).push_str(content);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(AxmlError::MalformedDocument(
            "Unclosed XML elements".to_string(),
        ));
    }
    let root =
        root.ok_or_else(|| AxmlError::MalformedDocument("Document has no root element".to_string()))?;

    Ok(XmlDocument { root, namespaces })
}

fn namespace_uri(namespaces: &[(String, String)], prefix: &str) -> AxmlResult<String> {
    if let Some((_, uri)) = namespaces.iter().find(|(known, _)| known == prefix) {
        return Ok(uri.clone());
    }
    if prefix == ANDROID_PREFIX {
        return Ok(ANDROID_NAMESPACE_URI.to_string());
    }
    Err(AxmlError::MalformedDocument(format!(
        "Undeclared namespace prefix '{prefix}'"
    )))
}

/// Android attribute names with a framework id go first so the resource map lines up.
fn collect_resource_names(
    node: &XmlNode,
    namespaces: &[(String, String)],
    pool: &mut StringPoolBuilder,
    ids: &mut Vec<u32>,
) {
    for attr in &node.attributes {
        let Some(prefix) = attr.prefix.as_deref() else {
            continue;
        };
        let is_android = namespace_uri(namespaces, prefix)
            .map(|uri| uri == ANDROID_NAMESPACE_URI)
            .unwrap_or(false);
        if !is_android || pool.index_of(&attr.name).is_some() {
            continue;
        }
        if let Some(id) = android_attribute_id(&attr.name) {
            pool.intern(&attr.name);
            ids.push(id);
        }
    }
    for child in &node.children {
        collect_resource_names(child, namespaces, pool, ids);
    }
}

fn collect_strings(node: &XmlNode, namespaces: &[(String, String)], pool: &mut StringPoolBuilder) {
    if let Some(prefix) = node.prefix.as_deref() {
        if let Ok(uri) = namespace_uri(namespaces, prefix) {
            pool.intern(uri);
        }
    }
    pool.intern(&node.name);
    for attr in &node.attributes {
        if let Some(prefix) = attr.prefix.as_deref() {
            if let Ok(uri) = namespace_uri(namespaces, prefix) {
                pool.intern(uri);
            }
        }
        pool.intern(&attr.name);
        if typed_value(&attr.value).is_none() {
            pool.intern(&attr.value);
        }
    }
    if let Some(text) = &node.text {
        pool.intern(text);
    }
    for child in &node.children {
        collect_strings(child, namespaces, pool);
    }
}

fn canonical_hex(digits: &str) -> Option<u32> {
    if digits.len() != 8 {
        return None;
    }
    let value = u32::from_str_radix(digits, 16).ok()?;
    (format!("{value:08X}") == digits).then_some(value)
}

/// Type and payload for text the decoder would print back unchanged, `None` for strings.
fn typed_value(text: &str) -> Option<(u8, u32)> {
    match text {
        "true" => return Some((TYPE_INT_BOOLEAN, 0xFFFF_FFFF)),
        "false" => return Some((TYPE_INT_BOOLEAN, 0)),
        _ => {}
    }
    if let Ok(number) = text.parse::<i32>() {
        if number.to_string() == text {
            return Some((TYPE_INT_DEC, number as u32));
        }
    }
    if let Some(digits) = text.strip_prefix("0x") {
        return canonical_hex(digits).map(|value| (TYPE_INT_HEX, value));
    }
    if let Some(digits) = text.strip_prefix('@') {
        return canonical_hex(digits).map(|value| (TYPE_REFERENCE, value));
    }
    if let Some(digits) = text.strip_prefix('?') {
        return canonical_hex(digits).map(|value| (TYPE_ATTRIBUTE, value));
    }
    None
}

struct NodeWriter<'a> {
    pool: &'a StringPoolBuilder,
    namespaces: &'a [(String, String)],
    nodes: Vec<Vec<u8>>,
    line: u32,
}

impl<'a> NodeWriter<'a> {
    fn index(&self, value: &str) -> AxmlResult<u32> {
        self.pool.index_of(value).ok_or_else(|| {
            AxmlError::MalformedDocument(format!("String '{value}' missing from pool"))
        })
    }

    fn namespace_index(&self, prefix: Option<&str>) -> AxmlResult<u32> {
        match prefix {
            Some(prefix) => self.index(&namespace_uri(self.namespaces, prefix)?),
            None => Ok(NO_ENTRY_INDEX),
        }
    }

    fn begin_node(&mut self, chunk_type: u16) -> (Vec<u8>, usize) {
        let mut buf = Vec::new();
        let start = begin_chunk(&mut buf, chunk_type, NODE_HEADER_SIZE);
        write_u32(&mut buf, self.line);
        write_u32(&mut buf, NO_ENTRY_INDEX);
        self.line += 1;
        (buf, start)
    }

    fn finish_node(&mut self, mut buf: Vec<u8>, start: usize) {
        finalize_chunk(&mut buf, start);
        self.nodes.push(buf);
    }

    fn namespace(&mut self, chunk_type: u16, prefix: &str, uri: &str) {
        let prefix_idx = self.pool.index_of(prefix).unwrap_or(NO_ENTRY_INDEX);
        let uri_idx = self.pool.index_of(uri).unwrap_or(NO_ENTRY_INDEX);
        let (mut buf, start) = self.begin_node(chunk_type);
        write_u32(&mut buf, prefix_idx);
        write_u32(&mut buf, uri_idx);
        self.finish_node(buf, start);
    }

    fn element(&mut self, node: &XmlNode) -> AxmlResult<()> {
        let ns_idx = self.namespace_index(node.prefix.as_deref())?;
        let name_idx = self.index(&node.name)?;

        let (mut buf, start) = self.begin_node(RES_XML_START_ELEMENT_TYPE);
        write_u32(&mut buf, ns_idx);
        write_u32(&mut buf, name_idx);
        write_u16(&mut buf, ATTRIBUTE_EXTENSION_SIZE);
        write_u16(&mut buf, ATTRIBUTE_SIZE);
        write_u16(&mut buf, node.attributes.len() as u16);
        write_u16(&mut buf, 0); // id index
        write_u16(&mut buf, 0); // class index
        write_u16(&mut buf, 0); // style index
        for attr in &node.attributes {
            let (raw_value, data_type, data) = match typed_value(&attr.value) {
                Some((data_type, data)) => (NO_ENTRY_INDEX, data_type, data),
                None => {
                    let idx = self.index(&attr.value)?;
                    (idx, TYPE_STRING, idx)
                }
            };
            write_u32(&mut buf, self.namespace_index(attr.prefix.as_deref())?);
            write_u32(&mut buf, self.index(&attr.name)?);
            write_u32(&mut buf, raw_value);
            write_u16(&mut buf, 8);
            buf.push(0);
            buf.push(data_type);
            write_u32(&mut buf, data);
        }
        self.finish_node(buf, start);

        if let Some(text) = &node.text {
            let idx = self.index(text)?;
            let (mut buf, start) = self.begin_node(RES_XML_CDATA_TYPE);
            write_u32(&mut buf, idx);
            write_u16(&mut buf, 8);
            buf.push(0);
            buf.push(TYPE_STRING);
            write_u32(&mut buf, idx);
            self.finish_node(buf, start);
        }

        for child in &node.children {
            self.element(child)?;
        }

        let (mut buf, start) = self.begin_node(RES_XML_END_ELEMENT_TYPE);
        write_u32(&mut buf, ns_idx);
        write_u32(&mut buf, name_idx);
        self.finish_node(buf, start);
        Ok(())
    }
}

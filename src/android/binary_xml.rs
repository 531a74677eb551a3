//! Decoding of `AndroidManifest.xml` and other binary XML documents to text.

use crate::android::chunk::{ChunkHeader, ChunkType, CHUNK_HEADER_SIZE, NO_ENTRY_INDEX};
use crate::android::elements::{process_elements, Element, StartElement};
use crate::android::error::AxmlResult;
use crate::android::render::{
    attribute_name, namespace_prefix, render_value, StringLookup, ANDROID_NAMESPACE_URI,
    ANDROID_PREFIX,
};
use crate::android::resource_map::{locate_after_pool, ResourceMap};
use crate::android::string_pool::StringPool;
use log::{debug, warn};
use quick_xml::escape::escape;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Elements read by the lite path when the caller has no preference.
pub const DEFAULT_LITE_ELEMENTS: usize = 3;

/// Everything that precedes the element stream.
#[derive(Clone, Debug)]
pub struct Prelude {
    pub header: ChunkHeader,
    pub string_pool: StringPool,
    pub resource_map: ResourceMap,
    /// Offset the element stream is expected to start at.
    pub elements_start: usize,
}

/// Read the outer header, the string pool and the resource map.
///
/// Fails only when `data` cannot hold the outer 8-byte header.
pub fn parse_prelude(data: &[u8]) -> AxmlResult<Prelude> {
    let header = ChunkHeader::parse(data, 0)?;
    if header.kind() != ChunkType::Xml {
        warn!(
            "[axml] document starts with chunk type 0x{:04x}, expected 0x0003",
            header.chunk_type
        );
    }

    let pool_start = if header.is_plausible() {
        header.header_size as usize
    } else {
        CHUNK_HEADER_SIZE
    };

    let pool_header = match ChunkHeader::parse(data, pool_start) {
        Ok(pool_header) => pool_header,
        Err(err) => {
            warn!("[axml] no string pool: {err}");
            return Ok(Prelude {
                header,
                string_pool: StringPool::empty(),
                resource_map: ResourceMap::default(),
                elements_start: data.len(),
            });
        }
    };
    if pool_header.kind() != ChunkType::StringPool {
        warn!(
            "[axml] expected a string pool at 0x{pool_start:x}, found type 0x{:04x}",
            pool_header.chunk_type
        );
        return Ok(Prelude {
            header,
            string_pool: StringPool::empty(),
            resource_map: ResourceMap::default(),
            elements_start: pool_start,
        });
    }

    let string_pool = StringPool::parse(data, &pool_header);
    let (resource_map, elements_start) = locate_after_pool(data, &string_pool);
    debug!(
        "[axml] {} strings, {} resource ids, elements at 0x{elements_start:x}",
        string_pool.len(),
        resource_map.len()
    );

    Ok(Prelude {
        header,
        string_pool,
        resource_map,
        elements_start,
    })
}

/// A fully decoded binary XML document.
#[derive(Clone, Debug)]
pub struct ManifestDocument {
    header: ChunkHeader,
    string_pool: StringPool,
    resource_map: ResourceMap,
    strings: Vec<String>,
    elements: Vec<Element>,
}

impl ManifestDocument {
    pub fn from_bytes(data: &[u8]) -> AxmlResult<Self> {
        let prelude = parse_prelude(data)?;
        let strings = prelude.string_pool.decode_all();
        let elements = process_elements(data, prelude.elements_start, None);
        Ok(ManifestDocument {
            header: prelude.header,
            string_pool: prelude.string_pool,
            resource_map: prelude.resource_map,
            strings,
            elements,
        })
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn string_pool(&self) -> &StringPool {
        &self.string_pool
    }

    pub fn resource_map(&self) -> &ResourceMap {
        &self.resource_map
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// Rebuild the textual document.
    pub fn to_xml(&self) -> String {
        Reconstructor::new(&self.strings, &self.resource_map).run(&self.elements)
    }
}

/// Decode `data` and return the textual manifest.
pub fn get_manifest(data: &[u8]) -> AxmlResult<String> {
    Ok(ManifestDocument::from_bytes(data)?.to_xml())
}

/// Attribute name to rendered value for the first `elements` elements.
///
/// Strings are fetched one at a time from the pool. When several elements carry the same
/// attribute name, the first one read wins.
pub fn get_manifest_lite(data: &[u8], elements: usize) -> AxmlResult<BTreeMap<String, String>> {
    let prelude = parse_prelude(data)?;
    let pool = &prelude.string_pool;
    let mut attributes = BTreeMap::new();

    for element in process_elements(data, prelude.elements_start, Some(elements)) {
        let Element::StartElement(start) = element else {
            continue;
        };
        for (index, attr) in start.attributes.iter().enumerate() {
            let name = attribute_name(attr, index, pool, &prelude.resource_map);
            if name.contains('\n') {
                continue;
            }
            attributes
                .entry(name)
                .or_insert_with(|| render_value(attr, pool));
        }
    }

    Ok(attributes)
}

/// The handful of manifest facts most callers want.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PackageInfo {
    pub package: Option<String>,
    pub version_code: Option<String>,
    pub version_name: Option<String>,
    pub min_sdk_version: Option<String>,
    pub target_sdk_version: Option<String>,
}

impl PackageInfo {
    pub fn from_lite(data: &[u8]) -> AxmlResult<Self> {
        Ok(Self::from_attributes(&get_manifest_lite(data, DEFAULT_LITE_ELEMENTS)?))
    }

    pub fn from_attributes(attributes: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| attributes.get(key).filter(|v| !v.is_empty()).cloned();
        PackageInfo {
            package: get("package"),
            version_code: get("versionCode"),
            version_name: get("versionName"),
            min_sdk_version: get("minSdkVersion"),
            target_sdk_version: get("targetSdkVersion"),
        }
    }
}

/// Folds an element sequence into text.
struct Reconstructor<'a> {
    strings: &'a [String],
    resources: &'a ResourceMap,
    /// Open `(prefix, uri)` bindings, innermost last.
    bindings: Vec<(String, String)>,
    /// Prefixes already given an `xmlns:` declaration.
    declared: BTreeSet<String>,
    depth: usize,
    out: String,
}

impl<'a> Reconstructor<'a> {
    fn new(strings: &'a [String], resources: &'a ResourceMap) -> Self {
        Reconstructor {
            strings,
            resources,
            bindings: Vec::new(),
            declared: BTreeSet::new(),
            depth: 0,
            out: String::new(),
        }
    }

    fn run(mut self, elements: &[Element]) -> String {
        let strings = self.strings;
        for element in elements {
            match element {
                Element::StartNamespace(ns) => {
                    let prefix = strings.lookup_or_empty(ns.prefix).into_owned();
                    let uri = strings.lookup_or_empty(ns.uri).into_owned();
                    self.bindings.push((prefix, uri));
                }
                Element::EndNamespace(_) => {
                    self.bindings.pop();
                }
                Element::StartElement(start) => self.start_element(start),
                Element::EndElement(end) => {
                    self.depth = self.depth.saturating_sub(1);
                    let name = self.qualified_name(end.namespace, end.name, &mut Vec::new());
                    self.out.push_str("</");
                    self.out.push_str(&name);
                    self.out.push('>');
                    if self.depth > 0 {
                        self.out.push('\n');
                    }
                }
                Element::CData(cdata) => {
                    if self.out.ends_with('\n') {
                        self.out.pop();
                        let text = strings.lookup_or_empty(cdata.data);
                        self.out.push_str(&escape(text.as_ref()));
                    }
                }
                Element::Unknown(_) => {}
            }
        }
        self.out
    }

    fn start_element(&mut self, start: &StartElement) {
        let strings = self.strings;
        let mut declarations = Vec::new();
        let tag = self.qualified_name(
            start.extension.namespace,
            start.extension.name,
            &mut declarations,
        );

        let mut rendered = Vec::with_capacity(start.attributes.len());
        for (index, attr) in start.attributes.iter().enumerate() {
            let name = attribute_name(attr, index, strings, self.resources);
            if name.contains('\n') {
                warn!(
                    "[axml] dropping attribute {index} of <{tag}>: name contains a newline"
                );
                continue;
            }
            let name = if attr.namespace == NO_ENTRY_INDEX {
                name
            } else {
                let uri = strings.lookup(attr.namespace);
                let prefix = self.prefix_for(uri.as_deref(), &mut declarations);
                format!("{prefix}:{name}")
            };
            rendered.push((name, render_value(attr, strings)));
        }

        self.out.push('<');
        self.out.push_str(&tag);
        for (prefix, uri) in &declarations {
            self.out.push_str(&format!(" xmlns:{prefix}=\"{}\"", escape(uri.as_str())));
        }
        for (name, value) in &rendered {
            self.out.push_str(&format!(" {name}=\"{value}\""));
        }
        self.out.push_str(">\n");
        self.depth += 1;
    }

    fn qualified_name(
        &mut self,
        namespace: u32,
        name: u32,
        declarations: &mut Vec<(String, String)>,
    ) -> String {
        let strings = self.strings;
        let local = strings.lookup_or_empty(name).into_owned();
        if namespace == NO_ENTRY_INDEX {
            return local;
        }
        let uri = strings.lookup(namespace);
        let prefix = self.prefix_for(uri.as_deref(), declarations);
        format!("{prefix}:{local}")
    }

    /// Prefix for `uri`, queuing an `xmlns:` declaration the first time a prefix is used.
    fn prefix_for(&mut self, uri: Option<&str>, declarations: &mut Vec<(String, String)>) -> String {
        let prefix = namespace_prefix(uri, &self.bindings);
        if self.declared.insert(prefix.clone()) {
            let uri = match uri.filter(|uri| !uri.is_empty()) {
                Some(uri) if prefix != ANDROID_PREFIX || uri == ANDROID_NAMESPACE_URI => {
                    uri.to_string()
                }
                _ => ANDROID_NAMESPACE_URI.to_string(),
            };
            declarations.push((prefix.clone(), uri));
        }
        prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::android::encoder::encode_chunks;
    use crate::android::error::AxmlError;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = r#"<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.example.app" android:versionCode="7" android:versionName="1.2">
<uses-sdk android:minSdkVersion="21" android:targetSdkVersion="34">
</uses-sdk>
<application android:label="@7F0A0001" android:debuggable="false">
<activity android:name=".Main">
</activity>
</application>
</manifest>"#;

    fn encoded() -> Vec<u8> {
        encode_chunks(MANIFEST).unwrap().assemble()
    }

    #[test]
    fn reconstructs_text_manifest() {
        assert_eq!(get_manifest(&encoded()).unwrap(), MANIFEST);
    }

    #[test]
    fn lite_reads_first_elements_only() {
        let lite = get_manifest_lite(&encoded(), DEFAULT_LITE_ELEMENTS).unwrap();
        assert_eq!(lite.get("package").map(String::as_str), Some("com.example.app"));
        assert_eq!(lite.get("versionCode").map(String::as_str), Some("7"));
        assert_eq!(lite.get("minSdkVersion").map(String::as_str), Some("21"));
        assert!(!lite.contains_key("label"));
    }

    #[test]
    fn package_info_from_lite() {
        let info = PackageInfo::from_lite(&encoded()).unwrap();
        assert_eq!(info.package.as_deref(), Some("com.example.app"));
        assert_eq!(info.version_name.as_deref(), Some("1.2"));
        assert_eq!(info.target_sdk_version.as_deref(), Some("34"));
    }

    #[test]
    fn outer_header_truncation_is_fatal() {
        assert!(matches!(
            get_manifest(&[0x03, 0x00, 0x08]),
            Err(AxmlError::TruncatedHeader { .. })
        ));
    }

    #[test]
    fn header_only_document_is_empty() {
        let data = [0x03, 0x00, 0x08, 0x00, 0x08, 0x00, 0x00, 0x00];
        let document = ManifestDocument::from_bytes(&data).unwrap();
        assert!(document.string_pool().is_empty());
        assert!(document.elements().is_empty());
        assert_eq!(document.to_xml(), "");
    }

    #[test]
    fn cdata_is_spliced_into_opening_tag() {
        let xml = "<resources>\n<string>a &amp; b</string>\n</resources>";
        let data = encode_chunks(xml).unwrap().assemble();
        assert_eq!(get_manifest(&data).unwrap(), xml);
    }
}

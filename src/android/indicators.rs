//! Structural tamper indicators for APK archives and binary manifests.
//!
//! Findings are data, not errors: every audit returns a [`TamperReport`] in which a missing
//! key means the anomaly was not observed.

use crate::android::binary_xml::parse_prelude;
use crate::android::chunk::{ChunkHeader, CHUNK_HEADER_SIZE, RES_XML_END_NAMESPACE_TYPE, RES_XML_TYPE};
use crate::android::elements::{Element, ATTRIBUTE_EXTENSION_SIZE, ATTRIBUTE_SIZE};
use crate::android::error::AxmlResult;
use crate::android::zip::{
    extract_entry, ApkZipResult, EntryFields, ZipEntries, END_OF_CENTRAL_DIRECTORY_SIGNATURE,
    METHOD_DEFLATED, METHOD_STORED,
};
use log::{debug, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// One piece of evidence in a report.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Evidence {
    Flag(bool),
    Count(u64),
    Keys(Vec<String>),
    Text(String),
    Nested(BTreeMap<String, Evidence>),
}

/// Indicator name to evidence.
pub type TamperReport = BTreeMap<String, Evidence>;

/// Fields that legitimately differ between local and central headers when a data
/// descriptor or alignment padding is in use.
const NOISY_FIELDS: &[&str] = &[
    "compressed_size",
    "crc32",
    "extra_field",
    "extra_field_length",
    "uncompressed_size",
];

/// Knobs for the audits. The numeric defaults come from observed evasion samples.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AuditConfig {
    /// Compare every header field and report duplicate end-of-archive records.
    pub strict: bool,
    /// Compression methods that are not worth reporting.
    pub accepted_compression_methods: Vec<u16>,
    /// Bytes skipped past an end-namespace chunk whose declared size is too small.
    pub end_namespace_skip: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            strict: false,
            accepted_compression_methods: vec![METHOD_STORED, METHOD_DEFLATED],
            end_namespace_skip: 24,
        }
    }
}

impl AuditConfig {
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_accepted_compression_methods(mut self, methods: Vec<u16>) -> Self {
        self.accepted_compression_methods = methods;
        self
    }

    pub fn with_end_namespace_skip(mut self, skip: usize) -> Self {
        self.end_namespace_skip = skip;
        self
    }

    fn accepts(&self, method: u16) -> bool {
        self.accepted_compression_methods.contains(&method)
    }
}

/// Number of end-of-central-directory signatures anywhere in `raw`.
pub fn count_eocd(raw: &[u8]) -> usize {
    raw.windows(END_OF_CENTRAL_DIRECTORY_SIGNATURE.len())
        .filter(|window| *window == END_OF_CENTRAL_DIRECTORY_SIGNATURE)
        .count()
}

fn differing_headers(local: &EntryFields, central: &EntryFields, strict: bool) -> Vec<String> {
    local
        .differing_fields(central)
        .into_iter()
        .filter(|field| strict || !NOISY_FIELDS.contains(field))
        .map(str::to_string)
        .collect()
}

/// Compare the two header collections of an archive.
pub fn zip_tampering_indicators(
    raw: &[u8],
    entries: &ZipEntries,
    config: &AuditConfig,
) -> TamperReport {
    let mut report = TamperReport::new();

    let eocd_count = count_eocd(raw);
    if config.strict && eocd_count > 1 {
        report.insert("eocd_count".to_string(), Evidence::Count(eocd_count as u64));
    }

    if entries.central.contains_key("") {
        report.insert("empty_keys".to_string(), Evidence::Flag(true));
    }

    let local_names: BTreeSet<&String> = entries.local.keys().collect();
    let central_names: BTreeSet<&String> = entries.central.keys().collect();
    let unique: Vec<String> = local_names
        .symmetric_difference(&central_names)
        .map(|name| name.to_string())
        .collect();
    if !unique.is_empty() {
        report.insert("unique_entries".to_string(), Evidence::Keys(unique));
    }

    for name in local_names.union(&central_names) {
        let local = entries.local.get(*name);
        let central = entries.central.get(*name);
        let mut evidence = BTreeMap::new();

        if let Some(central) = central {
            if !config.accepts(central.fields.compression_method) {
                evidence.insert(
                    "central compression method".to_string(),
                    Evidence::Count(central.fields.compression_method as u64),
                );
            }
        }
        if let Some(local) = local {
            if !config.accepts(local.fields.compression_method) {
                evidence.insert(
                    "local compression method".to_string(),
                    Evidence::Count(local.fields.compression_method as u64),
                );
            }
        }

        if let (Some(local), Some(central)) = (local, central) {
            if !evidence.is_empty() {
                let actual = match extract_entry(raw, local, central) {
                    Ok((_, actual)) => actual.as_str().to_string(),
                    Err(err) => {
                        debug!("[audit] could not extract '{name}': {err}");
                        format!("unreadable: {err}")
                    }
                };
                evidence.insert(
                    "actual compression method".to_string(),
                    Evidence::Text(actual),
                );
            }
            let differing = differing_headers(&local.fields, &central.fields, config.strict);
            if !differing.is_empty() {
                evidence.insert("differing headers".to_string(), Evidence::Keys(differing));
            }
        }

        if !evidence.is_empty() {
            report.insert(name.to_string(), Evidence::Nested(evidence));
        }
    }

    report
}

/// Re-walk a binary manifest recording every structural deviation.
///
/// Fails only when `data` cannot hold the outer 8-byte header.
pub fn manifest_tampering_indicators(data: &[u8], config: &AuditConfig) -> AxmlResult<TamperReport> {
    let mut report = TamperReport::new();
    let prelude = parse_prelude(data)?;

    if prelude.header.chunk_type != RES_XML_TYPE {
        report.insert(
            "unexpected_starting_signature_of_androidmanifest".to_string(),
            Evidence::Text(format!("0x{:04x}", prelude.header.chunk_type)),
        );
    }

    let pool = &prelude.string_pool;
    if pool.declared_count() as usize != pool.len() {
        let mut counts = BTreeMap::new();
        counts.insert("string_count".to_string(), Evidence::Count(pool.declared_count() as u64));
        counts.insert("real_string_count".to_string(), Evidence::Count(pool.len() as u64));
        report.insert("string_pool".to_string(), Evidence::Nested(counts));
    }

    let mut dummy_data = false;
    let mut zero_size_end_namespace = false;
    let mut malformed = false;
    let mut unexpected_size = false;
    let mut unexpected_start = false;
    let mut empty_names = false;
    let mut unknown_types = BTreeSet::new();

    let mut pos = prelude.elements_start;
    let mut resyncing = false;
    while pos.saturating_add(CHUNK_HEADER_SIZE) <= data.len() {
        let header = ChunkHeader::parse(data, pos)?;
        if !header.is_resync_candidate(data, !resyncing) {
            if header.chunk_type == RES_XML_END_NAMESPACE_TYPE
                && (header.total_size as usize) < CHUNK_HEADER_SIZE
            {
                debug!(
                    "[audit] end namespace at 0x{pos:x} declares {} bytes",
                    header.total_size
                );
                zero_size_end_namespace = true;
                pos = pos.saturating_add(config.end_namespace_skip.max(1));
                resyncing = false;
                continue;
            }
            if !resyncing {
                debug!("[audit] no chunk at 0x{pos:x}, scanning");
            }
            dummy_data = true;
            resyncing = true;
            pos += 1;
            continue;
        }
        resyncing = false;
        pos = header.end();

        match Element::parse(data, &header) {
            Ok(Element::Unknown(unknown)) => {
                unknown_types.insert(format!("0x{:04x}", unknown.header.chunk_type));
            }
            Ok(Element::StartElement(start)) => {
                if !start.attributes.is_empty() {
                    unexpected_size |= start.extension.attribute_size != ATTRIBUTE_SIZE;
                    unexpected_start |= start.extension.attribute_start != ATTRIBUTE_EXTENSION_SIZE;
                }
                empty_names |= start
                    .attributes
                    .iter()
                    .any(|attr| pool.string_at(attr.name).is_some_and(|name| name.is_empty()));
            }
            Ok(_) => {}
            Err(err) => {
                warn!("[audit] malformed chunk at 0x{:x}: {err}", header.start);
                malformed = true;
            }
        }
    }
    if pos < data.len() {
        debug!("[audit] {} trailing bytes after the last chunk", data.len() - pos);
    }

    let flags = [
        ("dummy_data_between_elements", dummy_data),
        ("zero_size_header_for_namespace_end_nodes", zero_size_end_namespace),
        ("malformed_element_chunk", malformed),
        ("unexpected_attribute_size", unexpected_size),
        ("unexpected_attribute_start", unexpected_start),
        ("unexpected_attribute_names", empty_names),
    ];
    for (key, observed) in flags {
        if observed {
            report.insert(key.to_string(), Evidence::Flag(true));
        }
    }
    if !unknown_types.is_empty() {
        report.insert(
            "unknown_chunk_type".to_string(),
            Evidence::Keys(unknown_types.into_iter().collect()),
        );
    }

    Ok(report)
}

/// Combined archive and manifest findings for one APK.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ApkTamperReport {
    pub zip: TamperReport,
    /// `None` when the manifest could not be extracted or is too short to audit.
    pub manifest: Option<TamperReport>,
}

/// Audit the archive structure and its `AndroidManifest.xml`.
///
/// Fails only when the archive has no readable central directory.
pub fn apk_tampering_check(raw: &[u8], config: &AuditConfig) -> ApkZipResult<ApkTamperReport> {
    let entries = ZipEntries::parse(raw)?;
    let zip = zip_tampering_indicators(raw, &entries, config);

    let manifest = match entries.manifest_bytes(raw) {
        Ok(bytes) => match manifest_tampering_indicators(&bytes, config) {
            Ok(report) => Some(report),
            Err(err) => {
                warn!("[audit] manifest too short to audit: {err}");
                None
            }
        },
        Err(err) => {
            warn!("[audit] manifest not extracted: {err}");
            None
        }
    };

    Ok(ApkTamperReport { zip, manifest })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_every_eocd_signature() {
        let mut raw = b"PK\x05\x06".to_vec();
        raw.extend_from_slice(b"junkPK\x05\x06PK\x05");
        assert_eq!(count_eocd(&raw), 2);
        assert_eq!(count_eocd(b"PK"), 0);
    }

    #[test]
    fn noisy_fields_only_count_when_strict() {
        let local = EntryFields {
            crc32: 0,
            flags: 8,
            ..EntryFields::default()
        };
        let central = EntryFields {
            crc32: 0xDEAD_BEEF,
            ..EntryFields::default()
        };
        assert_eq!(differing_headers(&local, &central, false), vec!["flags"]);
        assert_eq!(differing_headers(&local, &central, true), vec!["crc32", "flags"]);
    }

    #[test]
    fn config_builders() {
        let config = AuditConfig::default()
            .with_strict(true)
            .with_accepted_compression_methods(vec![0])
            .with_end_namespace_skip(16);
        assert!(config.strict);
        assert!(config.accepts(0));
        assert!(!config.accepts(8));
        assert_eq!(config.end_namespace_skip, 16);
    }

    #[test]
    fn evidence_serialises_untagged() {
        let mut report = TamperReport::new();
        report.insert("flag".into(), Evidence::Flag(true));
        report.insert("count".into(), Evidence::Count(2));
        report.insert("keys".into(), Evidence::Keys(vec!["a".into()]));
        assert_eq!(
            serde_json::to_string(&report).unwrap(),
            r#"{"count":2,"flag":true,"keys":["a"]}"#
        );
    }
}

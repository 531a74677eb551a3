//! Android binary XML and APK archive handling.

pub mod error;

pub mod binary_xml;
pub mod chunk;
pub mod elements;
pub mod encoder;
pub mod indicators;
pub mod render;
pub mod resource_map;
pub mod string_pool;
pub mod zip;

pub use binary_xml::{get_manifest, get_manifest_lite, ManifestDocument, PackageInfo};
pub use encoder::{encode, Encoder};
pub use error::{AxmlError, AxmlResult};
pub use indicators::{
    apk_tampering_check, manifest_tampering_indicators, zip_tampering_indicators, ApkTamperReport,
    AuditConfig, Evidence, TamperReport,
};
pub use zip::{ApkZipError, ApkZipResult, ZipEntries};

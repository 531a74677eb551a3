//! # apkinspect
//!
//! Decode Android binary XML (AXML) manifests back into text and report structural
//! tampering in APK archives and their manifests.
//!
//! ```no_run
//!  use apkinspect::android::{get_manifest, ZipEntries};
//!
//!  let (raw, entries) = ZipEntries::from_file("app.apk").unwrap();
//!  let manifest = entries.manifest_bytes(&raw).unwrap();
//!  println!("{}", get_manifest(&manifest).unwrap());
//! ```
//!

pub mod android;
#[cfg(test)]
mod tests;

pub use android::{
    apk_tampering_check, get_manifest, get_manifest_lite, AuditConfig, AxmlError, PackageInfo,
    ZipEntries,
};

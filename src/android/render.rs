//! Textual rendering of attribute values, names and namespace prefixes.
//!
//! Shared by the full reconstruction, which works on a decoded string table, and the lite
//! path, which looks strings up one at a time in the pool.

use crate::android::chunk::NO_ENTRY_INDEX;
use crate::android::elements::{Attribute, DataType};
use crate::android::resource_map::ResourceMap;
use crate::android::string_pool::StringPool;
use quick_xml::escape::escape;
use std::borrow::Cow;

pub const ANDROID_NAMESPACE_URI: &str = "http://schemas.android.com/apk/res/android";
pub const ANDROID_PREFIX: &str = "android";

/// Framework attribute ids for the manifest attributes the lite path and encoder care about.
const ANDROID_ATTRIBUTE_IDS: &[(&str, u32)] = &[
    ("label", 0x0101_0001),
    ("icon", 0x0101_0002),
    ("name", 0x0101_0003),
    ("minSdkVersion", 0x0101_020c),
    ("versionCode", 0x0101_021b),
    ("versionName", 0x0101_021c),
    ("targetSdkVersion", 0x0101_0270),
];

pub fn android_attribute_id(name: &str) -> Option<u32> {
    ANDROID_ATTRIBUTE_IDS
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, id)| *id)
}

pub fn android_attribute_name(id: u32) -> Option<&'static str> {
    ANDROID_ATTRIBUTE_IDS
        .iter()
        .find(|(_, known)| *known == id)
        .map(|(name, _)| *name)
}

/// Index-based access to document strings.
pub trait StringLookup {
    fn lookup(&self, idx: u32) -> Option<Cow<'_, str>>;

    fn lookup_or_empty(&self, idx: u32) -> Cow<'_, str> {
        self.lookup(idx).unwrap_or(Cow::Borrowed(""))
    }
}

impl StringLookup for [String] {
    fn lookup(&self, idx: u32) -> Option<Cow<'_, str>> {
        if idx == NO_ENTRY_INDEX {
            return None;
        }
        self.get(idx as usize).map(|s| Cow::Borrowed(s.as_str()))
    }
}

impl StringLookup for Vec<String> {
    fn lookup(&self, idx: u32) -> Option<Cow<'_, str>> {
        self.as_slice().lookup(idx)
    }
}

impl StringLookup for StringPool {
    fn lookup(&self, idx: u32) -> Option<Cow<'_, str>> {
        self.string_at(idx).map(Cow::Owned)
    }
}

/// Render the typed value of `attr` the way Android prints it.
pub fn render_value<S: StringLookup + ?Sized>(attr: &Attribute, strings: &S) -> String {
    let value = &attr.typed_value;
    match value.data_type {
        DataType::Null => String::new(),
        DataType::Reference => format!("@{:08X}", value.data),
        DataType::Attribute => format!("?{:08X}", value.data),
        DataType::String => strings
            .lookup(value.data)
            .or_else(|| strings.lookup(attr.raw_value))
            .map(|text| escape(text.as_ref()).into_owned())
            .unwrap_or_else(|| value.data.to_string()),
        DataType::Float => strings
            .lookup(value.data)
            .or_else(|| strings.lookup(attr.raw_value))
            .map(|text| escape(text.as_ref()).into_owned())
            .unwrap_or_else(|| format!("{:.1}", f32::from_bits(value.data))),
        DataType::IntHex => format!("0x{:08X}", value.data),
        DataType::Boolean => {
            if value.data != 0 {
                "true".to_string()
            } else {
                "false".to_string()
            }
        }
        DataType::IntDec => (value.data as i32).to_string(),
        _ => value.data.to_string(),
    }
}

/// Name of the attribute at `index` within its element.
///
/// An empty or missing name string falls back to the resource map id, then to a
/// placeholder built from the position.
pub fn attribute_name<S: StringLookup + ?Sized>(
    attr: &Attribute,
    index: usize,
    strings: &S,
    resources: &ResourceMap,
) -> String {
    match strings.lookup(attr.name) {
        Some(name) if !name.is_empty() => name.into_owned(),
        _ => resources
            .get(attr.name)
            .and_then(android_attribute_name)
            .map(str::to_string)
            .unwrap_or_else(|| format!("unknown_attribute_{index}")),
    }
}

/// Prefix for a namespace URI given the currently open `(prefix, uri)` bindings.
///
/// Innermost binding wins. An unbound URI uses its last path segment, and a URI that
/// cannot be resolved at all is treated as the Android namespace.
pub fn namespace_prefix(uri: Option<&str>, bindings: &[(String, String)]) -> String {
    let Some(uri) = uri.filter(|uri| !uri.is_empty()) else {
        return ANDROID_PREFIX.to_string();
    };
    if let Some((prefix, _)) = bindings.iter().rev().find(|(_, bound)| bound == uri) {
        if !prefix.is_empty() {
            return prefix.clone();
        }
    }
    uri.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && !segment.contains(':'))
        .unwrap_or(ANDROID_PREFIX)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::android::elements::TypedValue;

    fn attr(data_type: DataType, data: u32, raw_value: u32) -> Attribute {
        Attribute {
            namespace: NO_ENTRY_INDEX,
            name: 0,
            raw_value,
            typed_value: TypedValue {
                size: 8,
                res0: 0,
                data_type,
                data,
            },
        }
    }

    #[test]
    fn renders_typed_values() {
        let strings: Vec<String> = vec!["com.example".into(), "a<b".into()];
        assert_eq!(render_value(&attr(DataType::Null, 5, NO_ENTRY_INDEX), &strings), "");
        assert_eq!(
            render_value(&attr(DataType::Reference, 0x7f01_0000, NO_ENTRY_INDEX), &strings),
            "@7F010000"
        );
        assert_eq!(
            render_value(&attr(DataType::Attribute, 0x0101_0000, NO_ENTRY_INDEX), &strings),
            "?01010000"
        );
        assert_eq!(render_value(&attr(DataType::IntHex, 10, NO_ENTRY_INDEX), &strings), "0x0000000A");
        assert_eq!(render_value(&attr(DataType::Boolean, 0xFFFF_FFFF, NO_ENTRY_INDEX), &strings), "true");
        assert_eq!(render_value(&attr(DataType::Boolean, 0, NO_ENTRY_INDEX), &strings), "false");
        assert_eq!(render_value(&attr(DataType::IntDec, u32::MAX, NO_ENTRY_INDEX), &strings), "-1");
        assert_eq!(render_value(&attr(DataType::ColorArgb8, u32::MAX, NO_ENTRY_INDEX), &strings), "4294967295");
        assert_eq!(render_value(&attr(DataType::String, 0, 0), &strings), "com.example");
        assert_eq!(render_value(&attr(DataType::String, 1, 1), &strings), "a&lt;b");
    }

    #[test]
    fn string_and_float_fall_back_to_raw_value() {
        let strings: Vec<String> = vec!["fallback".into()];
        assert_eq!(render_value(&attr(DataType::String, 9, 0), &strings), "fallback");
        assert_eq!(render_value(&attr(DataType::String, 9, 8), &strings), "9");
        assert_eq!(render_value(&attr(DataType::Float, 0x3fc0_0000, 3), &strings), "1.5");
    }

    #[test]
    fn attribute_names_never_fail() {
        let strings: Vec<String> = vec!["".into(), "label".into()];
        let resources = ResourceMap::default();
        let mut a = attr(DataType::Null, 0, NO_ENTRY_INDEX);
        a.name = 1;
        assert_eq!(attribute_name(&a, 0, &strings, &resources), "label");
        a.name = 0;
        assert_eq!(attribute_name(&a, 3, &strings, &resources), "unknown_attribute_3");
        a.name = 40;
        assert_eq!(attribute_name(&a, 1, &strings, &resources), "unknown_attribute_1");
    }

    #[test]
    fn prefixes_resolve_through_bindings() {
        let bindings = vec![
            ("android".to_string(), ANDROID_NAMESPACE_URI.to_string()),
            ("app".to_string(), "http://schemas.android.com/apk/res-auto".to_string()),
        ];
        assert_eq!(namespace_prefix(Some(ANDROID_NAMESPACE_URI), &bindings), "android");
        assert_eq!(
            namespace_prefix(Some("http://schemas.android.com/apk/res-auto"), &bindings),
            "app"
        );
        assert_eq!(namespace_prefix(Some("http://schemas.android.com/tools"), &[]), "tools");
        assert_eq!(namespace_prefix(None, &bindings), "android");
        assert_eq!(namespace_prefix(Some("urn:x"), &[]), "android");
    }
}

//! Canonical value model
//!
//! `StoredValue` is the one dynamic value type shared by the global store,
//! the persisted JSON/YAML documents, module configuration and the scripting
//! bridge. Every other representation converts to and from this type; no two
//! foreign representations convert directly to each other.
//!
//! Serialization goes through hand-written serde impls so that both
//! `serde_json` and `serde_yaml` map their documents onto the same tree.
//! The only lossy steps are numeric: an unsigned integer above `i64::MAX`
//! read from either format widens to `Double`, and a non-finite `Double`
//! saves as JSON `null`. YAML keeps `.nan`, `.inf` and `-.inf` as doubles.

use indexmap::IndexMap;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::fmt;

/// Ordered string-keyed mapping of values.
pub type Mapping = IndexMap<String, StoredValue>;

/// A dynamically-typed, tree-shaped value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum StoredValue {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Sequence(Vec<StoredValue>),
    Mapping(Mapping),
}

impl StoredValue {
    /// Name of the variant, used in log messages.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::Sequence(_) => "sequence",
            Self::Mapping(_) => "mapping",
        }
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[inline]
    pub const fn is_mapping(&self) -> bool {
        matches!(self, Self::Mapping(_))
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value as a double; integers widen.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[StoredValue]> {
        match self {
            Self::Sequence(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&Mapping> {
        match self {
            Self::Mapping(map) => Some(map),
            _ => None,
        }
    }

    /// Look up `key` if this value is a mapping.
    pub fn get(&self, key: &str) -> Option<&StoredValue> {
        self.as_mapping().and_then(|map| map.get(key))
    }

    /// Render a scalar as plain text.
    ///
    /// Strings are returned verbatim, booleans as `true`/`false` and numbers
    /// in their shortest form. Null, sequences and mappings have no plain
    /// text form and yield `None`.
    pub fn to_plain_string(&self) -> Option<String> {
        match self {
            Self::Bool(b) => Some(b.to_string()),
            Self::Integer(i) => Some(i.to_string()),
            Self::Double(d) => Some(d.to_string()),
            Self::String(s) => Some(s.clone()),
            Self::Null | Self::Sequence(_) | Self::Mapping(_) => None,
        }
    }
}

impl fmt::Display for StoredValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(text) => f.write_str(&text),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

impl From<bool> for StoredValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for StoredValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for StoredValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u32> for StoredValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for StoredValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for StoredValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for StoredValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<StoredValue>> for StoredValue {
    fn from(value: Vec<StoredValue>) -> Self {
        Self::Sequence(value)
    }
}

impl From<Mapping> for StoredValue {
    fn from(value: Mapping) -> Self {
        Self::Mapping(value)
    }
}

impl<T: Into<StoredValue>> FromIterator<T> for StoredValue {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::Sequence(iter.into_iter().map(Into::into).collect())
    }
}

// ============================================================================
// Configuration accessors
// ============================================================================

/// Read a boolean from a configuration mapping, falling back to `default`.
pub fn get_bool(map: &Mapping, key: &str, default: bool) -> bool {
    map.get(key).and_then(StoredValue::as_bool).unwrap_or(default)
}

/// Read an integer from a configuration mapping, falling back to `default`.
///
/// Doubles with an integral value are accepted, since YAML authors
/// frequently write `timeout: 30.0`.
pub fn get_integer(map: &Mapping, key: &str, default: i64) -> i64 {
    match map.get(key) {
        Some(StoredValue::Integer(i)) => *i,
        Some(StoredValue::Double(d)) if d.fract() == 0.0 => *d as i64,
        _ => default,
    }
}

// ============================================================================
// Serde
// ============================================================================

impl Serialize for StoredValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Integer(i) => serializer.serialize_i64(*i),
            Self::Double(d) => serializer.serialize_f64(*d),
            Self::String(s) => serializer.serialize_str(s),
            Self::Sequence(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Mapping(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for StoredValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(StoredValueVisitor)
    }
}

struct StoredValueVisitor;

impl<'de> Visitor<'de> for StoredValueVisitor {
    type Value = StoredValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a null, boolean, number, string, sequence or mapping")
    }

    fn visit_unit<E: de::Error>(self) -> Result<StoredValue, E> {
        Ok(StoredValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<StoredValue, E> {
        Ok(StoredValue::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<StoredValue, D::Error> {
        StoredValue::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<StoredValue, E> {
        Ok(StoredValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<StoredValue, E> {
        Ok(StoredValue::Integer(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<StoredValue, E> {
        Ok(match i64::try_from(v) {
            Ok(i) => StoredValue::Integer(i),
            Err(_) => StoredValue::Double(v as f64),
        })
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<StoredValue, E> {
        Ok(StoredValue::Double(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<StoredValue, E> {
        Ok(StoredValue::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<StoredValue, E> {
        Ok(StoredValue::String(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<StoredValue, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(StoredValue::Sequence(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<StoredValue, A::Error> {
        let mut map = Mapping::with_capacity(access.size_hint().unwrap_or(0));
        while let Some(MapKey(key)) = access.next_key()? {
            let value = access.next_value()?;
            map.insert(key, value);
        }
        Ok(StoredValue::Mapping(map))
    }
}

/// Mapping key; YAML allows scalar keys such as `1` or `true`, which are
/// stored under their textual form.
struct MapKey(String);

impl<'de> Deserialize<'de> for MapKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(MapKeyVisitor)
    }
}

struct MapKeyVisitor;

impl Visitor<'_> for MapKeyVisitor {
    type Value = MapKey;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a scalar mapping key")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<MapKey, E> {
        Ok(MapKey(v.to_string()))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<MapKey, E> {
        Ok(MapKey(v.to_string()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<MapKey, E> {
        Ok(MapKey(v.to_string()))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<MapKey, E> {
        Ok(MapKey(v.to_string()))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<MapKey, E> {
        Ok(MapKey(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<MapKey, E> {
        Ok(MapKey(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StoredValue {
        let mut inner = Mapping::new();
        inner.insert("c".to_string(), StoredValue::Integer(1));
        inner.insert("ratio".to_string(), StoredValue::Double(0.5));
        let mut outer = Mapping::new();
        outer.insert("b".to_string(), StoredValue::Mapping(inner));
        outer.insert(
            "list".to_string(),
            StoredValue::from_iter(["x", "y"]),
        );
        outer.insert("none".to_string(), StoredValue::Null);
        StoredValue::Mapping(outer)
    }

    #[test]
    fn test_json_tree_shape() {
        let value: StoredValue = serde_json::from_str(
            r#"{"b": {"c": 1, "ratio": 0.5}, "list": ["x", "y"], "none": null}"#,
        )
        .unwrap();
        assert_eq!(value, sample());
    }

    #[test]
    fn test_yaml_tree_shape() {
        let yaml = "b:\n  c: 1\n  ratio: 0.5\nlist:\n  - x\n  - y\nnone: ~\n";
        let value: StoredValue = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(value, sample());
    }

    #[test]
    fn test_mapping_preserves_insertion_order() {
        let value: StoredValue = serde_json::from_str(r#"{"z": 1, "a": 2, "m": 3}"#).unwrap();
        let keys: Vec<&str> = value
            .as_mapping()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn test_huge_unsigned_widens_to_double() {
        let value: StoredValue = serde_json::from_str("18446744073709551615").unwrap();
        assert!(matches!(value, StoredValue::Double(_)));

        let value: StoredValue = serde_json::from_str("9223372036854775807").unwrap();
        assert_eq!(value, StoredValue::Integer(i64::MAX));
    }

    #[test]
    fn test_yaml_scalar_keys_become_strings() {
        let value: StoredValue = serde_yaml::from_str("1: one\ntrue: yes-value\n").unwrap();
        assert_eq!(value.get("1"), Some(&StoredValue::from("one")));
        assert_eq!(value.get("true"), Some(&StoredValue::from("yes-value")));
    }

    #[test]
    fn test_plain_string_rendering() {
        assert_eq!(StoredValue::Bool(true).to_plain_string().as_deref(), Some("true"));
        assert_eq!(StoredValue::Integer(-3).to_plain_string().as_deref(), Some("-3"));
        assert_eq!(StoredValue::from("en_US").to_plain_string().as_deref(), Some("en_US"));
        assert_eq!(StoredValue::Null.to_plain_string(), None);
        assert_eq!(sample().to_plain_string(), None);
    }

    #[test]
    fn test_config_accessors() {
        let map: StoredValue =
            serde_yaml::from_str("dontChroot: true\ntimeout: 30.0\nbad: [1]\n").unwrap();
        let map = map.as_mapping().unwrap();
        assert!(get_bool(map, "dontChroot", false));
        assert!(!get_bool(map, "missing", false));
        assert_eq!(get_integer(map, "timeout", 10), 30);
        assert_eq!(get_integer(map, "bad", 10), 10);
    }

    #[test]
    fn test_display_is_compact_json() {
        assert_eq!(StoredValue::from_iter([1i64, 2]).to_string(), "[1,2]");
        assert_eq!(StoredValue::Null.to_string(), "null");
    }
}

//! `StoredValue` <-> Rhai `Dynamic`
//!
//! Rhai object maps are ordered by key, so mappings passed through a script
//! come back sorted.

use crate::value::{Mapping, StoredValue};
use rhai::{Array, Dynamic, Map};

pub fn to_dynamic(value: &StoredValue) -> Dynamic {
    match value {
        StoredValue::Null => Dynamic::UNIT,
        StoredValue::Bool(b) => Dynamic::from_bool(*b),
        StoredValue::Integer(i) => Dynamic::from_int(*i),
        StoredValue::Double(d) => Dynamic::from_float(*d),
        StoredValue::String(s) => Dynamic::from(s.clone()),
        StoredValue::Sequence(items) => Dynamic::from_array(items.iter().map(to_dynamic).collect()),
        StoredValue::Mapping(map) => Dynamic::from_map(mapping_to_map(map)),
    }
}

pub fn mapping_to_map(map: &Mapping) -> Map {
    map.iter()
        .map(|(k, v)| (k.as_str().into(), to_dynamic(v)))
        .collect()
}

/// Convert a script value; function pointers and custom types are rejected
/// with the offending type name.
pub fn from_dynamic(value: Dynamic) -> Result<StoredValue, String> {
    if value.is_unit() {
        return Ok(StoredValue::Null);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(StoredValue::Bool(b));
    }
    if let Ok(i) = value.as_int() {
        return Ok(StoredValue::Integer(i));
    }
    if let Ok(f) = value.as_float() {
        return Ok(StoredValue::Double(f));
    }
    if let Ok(c) = value.as_char() {
        return Ok(StoredValue::String(c.to_string()));
    }
    if value.is_string() {
        return value
            .into_string()
            .map(StoredValue::String)
            .map_err(|t| format!("cannot store a value of type {}", t));
    }

    let type_name = value.type_name();
    if let Some(items) = value.clone().try_cast::<Array>() {
        return items
            .into_iter()
            .map(from_dynamic)
            .collect::<Result<Vec<_>, _>>()
            .map(StoredValue::Sequence);
    }
    if let Some(map) = value.try_cast::<Map>() {
        return map_to_mapping(map).map(StoredValue::Mapping);
    }
    Err(format!("cannot store a value of type {}", type_name))
}

pub fn map_to_mapping(map: Map) -> Result<Mapping, String> {
    map.into_iter()
        .map(|(k, v)| from_dynamic(v).map(|v| (k.to_string(), v)))
        .collect()
}

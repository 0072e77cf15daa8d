//! The typed value tree that carries every inter-component payload.
//!
//! [`Value`] is a closed sum over the payload shapes the runtime moves
//! between components: scalars, strings, raw bytes, ordered arrays,
//! insertion-ordered maps, and n-dimensional tensors. JSON is the canonical
//! encoding; bytes and tensor data cross the JSON boundary as base64.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValueError;

/// Element type code for an n-dimensional array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DTypeCode {
    /// Signed integer lanes.
    Int,
    /// Unsigned integer lanes.
    UInt,
    /// IEEE-754 float lanes.
    Float,
}

/// Element type of an n-dimensional array: code, bit width, vector lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DType {
    /// The element kind.
    pub code: DTypeCode,
    /// Bits per lane (8, 16, 32, or 64).
    pub bits: u8,
    /// Number of lanes per element (1 for scalars).
    pub lanes: u16,
}

impl DType {
    /// Bytes occupied by a single element.
    pub fn element_bytes(&self) -> usize {
        (self.bits as usize / 8) * self.lanes as usize
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self.code {
            DTypeCode::Int => "int",
            DTypeCode::UInt => "uint",
            DTypeCode::Float => "float",
        };
        if self.lanes == 1 {
            write!(f, "{}{}", code, self.bits)
        } else {
            write!(f, "{}{}x{}", code, self.bits, self.lanes)
        }
    }
}

/// An n-dimensional array with a flat byte buffer.
///
/// The buffer length is validated against `shape` and `dtype` on
/// construction, so a well-typed `NdArray` is always internally consistent.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    shape: Vec<usize>,
    dtype: DType,
    data: Vec<u8>,
}

impl NdArray {
    /// Build an array, validating that `data` holds exactly
    /// `shape.product() * dtype.element_bytes()` bytes.
    pub fn new(shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> Result<Self, ValueError> {
        let elements: usize = shape.iter().product();
        let expected = elements * dtype.element_bytes();
        if data.len() != expected {
            return Err(ValueError::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape, dtype, data })
    }

    /// Build a 1-D float32 array from host values.
    pub fn from_f32(values: &[f32]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self {
            shape: vec![values.len()],
            dtype: DType {
                code: DTypeCode::Float,
                bits: 32,
                lanes: 1,
            },
            data,
        }
    }

    /// View the buffer as little-endian f32 values.
    ///
    /// Returns `TypeMismatch` unless the dtype is `float32x1`.
    pub fn as_f32(&self) -> Result<Vec<f32>, ValueError> {
        if self.dtype
            != (DType {
                code: DTypeCode::Float,
                bits: 32,
                lanes: 1,
            })
        {
            return Err(ValueError::TypeMismatch {
                expected: "float32 ndarray",
                actual: self.dtype.to_string(),
            });
        }
        Ok(self
            .data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// The array shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// The element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// The raw byte buffer.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Insertion-ordered string-keyed map of values.
pub type ValueMap = IndexMap<String, Value>;

/// The tagged value union all inter-component payloads are expressed in.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// Unsigned 64-bit integer.
    UInt(u64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes. Crosses the JSON boundary as base64.
    Bytes(Vec<u8>),
    /// Ordered array of values.
    Array(Vec<Value>),
    /// String-keyed map preserving insertion order.
    Map(ValueMap),
    /// N-dimensional array. Serializes as `{shape, dtype, data}`.
    NdArray(NdArray),
}

impl Value {
    /// Parse a JSON document into a value tree.
    ///
    /// JSON types map one-to-one: integral numbers become `Int` (or `UInt`
    /// when they exceed `i64`), fractional numbers become `Double`, objects
    /// become insertion-ordered maps.
    pub fn from_json(text: &str) -> Result<Self, ValueError> {
        let json: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ValueError::Parse(e.to_string()))?;
        Ok(Self::from(json))
    }

    /// Encode the value tree as a JSON string. Map keys keep their
    /// insertion order.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_string())
    }

    /// Build a map value from key/value pairs.
    pub fn map<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build an array value.
    pub fn array<I: IntoIterator<Item = Value>>(items: I) -> Self {
        Value::Array(items.into_iter().collect())
    }

    /// Human-readable name of the variant, used in type errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::NdArray(_) => "ndarray",
        }
    }

    /// True when the value is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrow as a string, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow as a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Coerce to `i64`. `UInt` values within range convert.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Coerce to `u64`. Non-negative `Int` values convert.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Coerce to `f64` from any numeric variant.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Borrow as bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Borrow as an array.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Borrow as a map.
    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Borrow as an n-dimensional array.
    pub fn as_ndarray(&self) -> Option<&NdArray> {
        match self {
            Value::NdArray(a) => Some(a),
            _ => None,
        }
    }

    /// Typed downcast to a string, with a `TypeMismatch` error on failure.
    pub fn try_str(&self) -> Result<&str, ValueError> {
        self.as_str().ok_or_else(|| self.mismatch("string"))
    }

    /// Typed downcast to a bool.
    pub fn try_bool(&self) -> Result<bool, ValueError> {
        self.as_bool().ok_or_else(|| self.mismatch("bool"))
    }

    /// Typed downcast to an `i64`.
    pub fn try_i64(&self) -> Result<i64, ValueError> {
        self.as_i64().ok_or_else(|| self.mismatch("int"))
    }

    /// Typed downcast to a `u64`.
    pub fn try_u64(&self) -> Result<u64, ValueError> {
        self.as_u64().ok_or_else(|| self.mismatch("uint"))
    }

    /// Typed downcast to an `f64`.
    pub fn try_f64(&self) -> Result<f64, ValueError> {
        self.as_f64().ok_or_else(|| self.mismatch("double"))
    }

    /// Typed downcast to a map.
    pub fn try_map(&self) -> Result<&ValueMap, ValueError> {
        self.as_map().ok_or_else(|| self.mismatch("map"))
    }

    /// Typed downcast to an array.
    pub fn try_array(&self) -> Result<&[Value], ValueError> {
        self.as_array().ok_or_else(|| self.mismatch("array"))
    }

    /// Look up a key in a map value. `None` for missing keys and
    /// non-map values.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Index into an array value.
    pub fn at(&self, index: usize) -> Option<&Value> {
        self.as_array().and_then(|a| a.get(index))
    }

    fn mismatch(&self, expected: &'static str) -> ValueError {
        ValueError::TypeMismatch {
            expected,
            actual: self.type_name().to_string(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else {
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        serde_json::Value::from(&value)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::UInt(v) => serializer.serialize_u64(*v),
            Value::Float(v) => serializer.serialize_f32(*v),
            Value::Double(v) => serializer.serialize_f64(*v),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_str(&BASE64.encode(b)),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::NdArray(array) => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("shape", array.shape())?;
                map.serialize_entry("dtype", &array.dtype())?;
                map.serialize_entry("data", &BASE64.encode(array.data()))?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON value")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_none<E: de::Error>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_bool<E: de::Error>(self, b: bool) -> Result<Value, E> {
                Ok(Value::Bool(b))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
                Ok(Value::Int(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
                if let Ok(i) = i64::try_from(v) {
                    Ok(Value::Int(i))
                } else {
                    Ok(Value::UInt(v))
                }
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
                Ok(Value::Double(v))
            }

            fn visit_str<E: de::Error>(self, s: &str) -> Result<Value, E> {
                Ok(Value::Str(s.to_owned()))
            }

            fn visit_string<E: de::Error>(self, s: String) -> Result<Value, E> {
                Ok(Value::Str(s))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(Value::Array(items))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Value, A::Error> {
                let mut entries = ValueMap::new();
                while let Some((k, v)) = access.next_entry::<String, Value>()? {
                    entries.insert(k, v);
                }
                Ok(Value::Map(entries))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip_preserves_key_order() {
        let value = Value::map([
            ("zebra", Value::Int(1)),
            ("alpha", Value::Int(2)),
            ("mid", Value::Int(3)),
        ]);
        let json = value.to_json();
        assert_eq!(json, r#"{"zebra":1,"alpha":2,"mid":3}"#);
        let back = Value::from_json(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn bytes_encode_as_base64() {
        let value = Value::Bytes(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(value.to_json(), r#""3q2+7w==""#);
    }

    #[test]
    fn ndarray_serializes_shape_dtype_data() {
        let array = NdArray::from_f32(&[1.0, 2.0]);
        let json = Value::NdArray(array).to_json();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["shape"], serde_json::json!([2]));
        assert_eq!(parsed["dtype"]["bits"], 32);
        assert!(parsed["data"].is_string());
    }

    #[test]
    fn ndarray_rejects_wrong_byte_count() {
        let dtype = DType {
            code: DTypeCode::Float,
            bits: 32,
            lanes: 1,
        };
        let err = NdArray::new(vec![3], dtype, vec![0u8; 8]).unwrap_err();
        assert!(matches!(err, ValueError::ShapeMismatch { .. }));
    }

    #[test]
    fn downcast_mismatch_names_both_types() {
        let err = Value::Int(3).try_str().unwrap_err();
        match err {
            ValueError::TypeMismatch { expected, actual } => {
                assert_eq!(expected, "string");
                assert_eq!(actual, "int");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parse_error_on_invalid_json() {
        assert!(matches!(
            Value::from_json("{not json"),
            Err(ValueError::Parse(_))
        ));
    }

    #[test]
    fn numeric_coercions() {
        assert_eq!(Value::UInt(7).as_i64(), Some(7));
        assert_eq!(Value::Int(-1).as_u64(), None);
        assert_eq!(Value::Float(1.5).as_f64(), Some(1.5));
    }

    #[test]
    fn get_and_at_navigate_nested_trees() {
        let value = Value::map([(
            "items",
            Value::array([Value::Str("a".into()), Value::Str("b".into())]),
        )]);
        assert_eq!(
            value.get("items").and_then(|v| v.at(1)).and_then(Value::as_str),
            Some("b")
        );
        assert!(value.get("missing").is_none());
    }

    #[test]
    fn large_u64_survives_roundtrip() {
        let big = u64::MAX - 1;
        let back = Value::from_json(&Value::UInt(big).to_json()).unwrap();
        assert_eq!(back.as_u64(), Some(big));
    }

    #[test]
    fn f32_ndarray_view() {
        let array = NdArray::from_f32(&[0.25, -3.5]);
        assert_eq!(array.as_f32().unwrap(), vec![0.25, -3.5]);
    }
}

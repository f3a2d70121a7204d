use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};

pub type Map = BTreeMap<String, Value>;

/// The dynamic value flowing through the pipeline. Sources produce it,
/// middlewares transform it, and configuration trees are made of it.
/// Nothing in the runtime assumes a schema beyond the shape tags here.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Sequence(Vec<Value>),
    Map(Map),
}

impl Value {
    /// Shape tag used in type-mismatch errors.
    pub fn shape(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
            Value::Sequence(_) => "sequence",
            Value::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_sequence(&self) -> Option<&[Value]> {
        match self {
            Value::Sequence(s) => Some(s),
            _ => None,
        }
    }

    /// Map lookup; `Null` for missing keys and non-map values.
    pub fn get(&self, key: &str) -> &Value {
        match self {
            Value::Map(m) => m.get(key).unwrap_or(&Value::Null),
            _ => &Value::Null,
        }
    }

    pub fn from_yaml(yaml: serde_yaml::Value) -> Value {
        match yaml {
            serde_yaml::Value::Null => Value::Null,
            serde_yaml::Value::Bool(b) => Value::Bool(b),
            serde_yaml::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else if let Some(u) = n.as_u64() {
                    Value::Integer(u as i64)
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_yaml::Value::String(s) => Value::String(s),
            serde_yaml::Value::Sequence(seq) => {
                Value::Sequence(seq.into_iter().map(Value::from_yaml).collect())
            }
            serde_yaml::Value::Mapping(mapping) => {
                let mut map = Map::new();
                for (k, v) in mapping {
                    map.insert(yaml_key_to_string(k), Value::from_yaml(v));
                }
                Value::Map(map)
            }
            serde_yaml::Value::Tagged(tagged) => Value::from_yaml(tagged.value),
        }
    }

    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Integer(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(seq) => {
                Value::Sequence(seq.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(obj) => {
                let mut map = Map::new();
                for (k, v) in obj {
                    map.insert(k, Value::from_json(v));
                }
                Value::Map(map)
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(x) => serde_json::Number::from_f64(*x)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
            Value::Timestamp(t) => {
                serde_json::Value::String(t.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Value::Sequence(seq) => {
                serde_json::Value::Array(seq.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

fn yaml_key_to_string(key: serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s,
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        other => match Value::from_yaml(other).to_json() {
            serde_json::Value::String(s) => s,
            json => json.to_string(),
        },
    }
}

/// The stringification used wherever an arbitrary value becomes a line of
/// text: `treatOutputAsBody`, tap lines, kafka publishing, the lambda
/// fallback response. Scalars print bare; containers print as JSON.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            Value::Timestamp(t) => write!(f, "{}", t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Value::Sequence(_) | Value::Map(_) => {
                let json = self.to_json();
                match serde_json::to_string(&json) {
                    Ok(s) => write!(f, "{s}"),
                    Err(_) => Err(fmt::Error),
                }
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<Vec<Value>> for Value {
    fn from(seq: Vec<Value>) -> Self {
        Value::Sequence(seq)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Map(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_round_trip_shapes() {
        let yaml: serde_yaml::Value = serde_yaml::from_str(
            r#"
source:
  http:
    address: ":8080"
    base64EncodeBody: true
middleware:
  - timeout
  - key: body
fn:
  pool:
    concurrency: 4
    maxWait: 250ms
"#,
        )
        .unwrap();

        let value = Value::from_yaml(yaml);
        let map = value.as_map().unwrap();
        assert_eq!(
            map["source"].get("http").get("address").as_str(),
            Some(":8080")
        );
        assert_eq!(
            map["source"].get("http").get("base64EncodeBody").as_bool(),
            Some(true)
        );
        assert_eq!(map["middleware"].as_sequence().unwrap().len(), 2);
        assert_eq!(map["fn"].get("pool").get("concurrency").as_i64(), Some(4));
    }

    #[test]
    fn display_prints_scalars_bare_and_containers_as_json() {
        assert_eq!(Value::from("hello").to_string(), "hello");
        assert_eq!(Value::from(42i64).to_string(), "42");
        assert_eq!(Value::Null.to_string(), "");
        assert_eq!(Value::Map(Map::new()).to_string(), "{}");

        let mut map = Map::new();
        map.insert("a".to_string(), Value::from(1i64));
        assert_eq!(Value::Map(map).to_string(), r#"{"a":1}"#);
    }

    #[test]
    fn json_conversions_preserve_numbers() {
        let json: serde_json::Value = serde_json::from_str(r#"{"a":{"b":42},"c":1.5}"#).unwrap();
        let value = Value::from_json(json.clone());
        assert_eq!(value.get("a").get("b").as_i64(), Some(42));
        assert_eq!(value.get("c"), &Value::Float(1.5));
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn get_on_non_map_is_null() {
        assert!(Value::from("x").get("k").is_null());
        assert!(Value::Null.get("k").is_null());
    }
}

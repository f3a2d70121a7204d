use std::time::Duration;

use errors::{ConfigError, Error, ErrorKind, Result};
use serde::de::DeserializeOwned;

use crate::model::{Map, Value};

/// The capability set a component may expose to configuration dispatch.
///
/// Every shape-specific method defaults to delegating to
/// `configure_generic`, and `configure_generic` defaults to a
/// type-mismatch error, so a component only overrides the shapes it
/// understands. `configure_empty` succeeds by default unless the
/// component declares `requires_config`.
pub trait Configurable {
    fn requires_config(&self) -> bool {
        false
    }

    fn configure_empty(&mut self) -> Result<()> {
        if self.requires_config() {
            return Err(ConfigError::Missing(type_label::<Self>().to_string()).into());
        }
        Ok(())
    }

    fn configure_string(&mut self, value: String) -> Result<()> {
        self.configure_generic(Value::String(value))
    }

    fn configure_integer(&mut self, value: i64) -> Result<()> {
        self.configure_generic(Value::Integer(value))
    }

    fn configure_float(&mut self, value: f64) -> Result<()> {
        self.configure_generic(Value::Float(value))
    }

    fn configure_bool(&mut self, value: bool) -> Result<()> {
        self.configure_generic(Value::Bool(value))
    }

    fn configure_map(&mut self, value: Map) -> Result<()> {
        self.configure_generic(Value::Map(value))
    }

    fn configure_sequence(&mut self, value: Vec<Value>) -> Result<()> {
        self.configure_generic(Value::Sequence(value))
    }

    fn configure_generic(&mut self, value: Value) -> Result<()> {
        Err(ConfigError::Shape {
            target: type_label::<Self>().to_string(),
            shape: value.shape(),
        }
        .into())
    }
}

fn type_label<T: ?Sized>() -> &'static str {
    let name = std::any::type_name::<T>();
    name.rsplit("::").next().unwrap_or(name)
}

/// Applies `config` to `target`, selecting the single capability that
/// matches the value's runtime shape. YAML `null` counts as absent.
pub fn configure(target: &mut dyn Configurable, config: Option<Value>) -> Result<()> {
    match config {
        None | Some(Value::Null) => target.configure_empty(),
        Some(Value::String(s)) => target.configure_string(s),
        Some(Value::Integer(i)) => target.configure_integer(i),
        Some(Value::Float(x)) => target.configure_float(x),
        Some(Value::Bool(b)) => target.configure_bool(b),
        Some(Value::Map(m)) => target.configure_map(m),
        Some(Value::Sequence(seq)) => target.configure_sequence(seq),
        Some(other) => target.configure_generic(other),
    }
}

/// Returns the sole entry of `map`, or a cardinality error.
pub fn single_pair(map: Map) -> Result<(String, Value)> {
    let mut entries = map.into_iter();
    match (entries.next(), entries.next()) {
        (Some(pair), None) => Ok(pair),
        _ => Err(ConfigError::SingleEntry.into()),
    }
}

/// Decodes a configuration map into a typed struct. Unknown keys are
/// ignored, matching the loose decoding the config format promises.
pub fn decode_map<T: DeserializeOwned>(map: Map) -> Result<T> {
    let json = Value::Map(map).to_json();
    serde_json::from_value(json)
        .map_err(|e| Error::with_message(ErrorKind::TypeMismatch, "decoding configuration", Some(e)))
}

/// Parses duration strings of the `100ms` / `30s` / `5m` / `1h` family,
/// including compounds such as `1m30s`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err(Error::parse("empty duration"));
    }

    let mut total = Duration::ZERO;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if digits == 0 || digits == rest.len() {
            return Err(Error::parse(format!("invalid duration {trimmed:?}")));
        }
        let (number, tail) = rest.split_at(digits);
        let value: f64 = number
            .parse()
            .map_err(|_| Error::parse(format!("invalid duration {trimmed:?}")))?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, remainder) = tail.split_at(unit_len);
        let nanos_per_unit = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3_600e9,
            _ => return Err(Error::parse(format!("unknown duration unit {unit:?} in {trimmed:?}"))),
        };
        total += Duration::from_nanos((value * nanos_per_unit) as u64);
        rest = remainder;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use errors::ErrorKind;

    #[derive(Default)]
    struct StringOnly {
        value: Option<String>,
    }

    impl Configurable for StringOnly {
        fn configure_string(&mut self, value: String) -> Result<()> {
            self.value = Some(value);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RequiresConfig;

    impl Configurable for RequiresConfig {
        fn requires_config(&self) -> bool {
            true
        }

        fn configure_map(&mut self, _value: Map) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct GenericFallback {
        seen: Option<&'static str>,
    }

    impl Configurable for GenericFallback {
        fn configure_generic(&mut self, value: Value) -> Result<()> {
            self.seen = Some(value.shape());
            Ok(())
        }
    }

    #[derive(Default)]
    struct EmptyAware {
        configured: bool,
    }

    impl Configurable for EmptyAware {
        fn configure_empty(&mut self) -> Result<()> {
            self.configured = true;
            Ok(())
        }
    }

    #[test]
    fn string_shape_selects_string_capability() {
        let mut target = StringOnly::default();
        configure(&mut target, Some(Value::from("hello"))).unwrap();
        assert_eq!(target.value.as_deref(), Some("hello"));
    }

    #[test]
    fn missing_capability_falls_back_to_generic() {
        let mut target = GenericFallback::default();
        configure(&mut target, Some(Value::from(42i64))).unwrap();
        assert_eq!(target.seen, Some("integer"));

        configure(&mut target, Some(Value::Sequence(vec![]))).unwrap();
        assert_eq!(target.seen, Some("sequence"));
    }

    #[test]
    fn missing_capability_without_generic_is_type_mismatch() {
        let mut target = StringOnly::default();
        let err = configure(&mut target, Some(Value::from(true))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert!(err.to_string().contains("StringOnly"));
        assert!(err.to_string().contains("bool"));
    }

    #[test]
    fn absent_config_without_requirement_succeeds() {
        let mut target = StringOnly::default();
        configure(&mut target, None).unwrap();
        assert!(target.value.is_none());
    }

    #[test]
    fn absent_config_with_requirement_is_missing_config() {
        let mut target = RequiresConfig;
        let err = configure(&mut target, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingConfig);
    }

    #[test]
    fn yaml_null_counts_as_absent() {
        let mut target = EmptyAware::default();
        configure(&mut target, Some(Value::Null)).unwrap();
        assert!(target.configured);
    }

    #[test]
    fn single_pair_accepts_exactly_one_entry() {
        let mut map = Map::new();
        map.insert("timeout".to_string(), Value::from("5s"));
        let (key, value) = single_pair(map).unwrap();
        assert_eq!(key, "timeout");
        assert_eq!(value.as_str(), Some("5s"));
    }

    #[test]
    fn single_pair_rejects_zero_and_many() {
        let err = single_pair(Map::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cardinality);

        let mut map = Map::new();
        map.insert("a".to_string(), Value::Null);
        map.insert("b".to_string(), Value::Null);
        let err = single_pair(map).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cardinality);
    }

    #[test]
    fn parse_duration_units_and_compounds() {
        use std::time::Duration;

        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(
            parse_duration("1.5s").unwrap(),
            Duration::from_millis(1500)
        );

        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10parsecs").is_err());
    }

    #[test]
    fn decode_map_ignores_unknown_keys() {
        #[derive(serde::Deserialize)]
        struct Sample {
            name: String,
            #[serde(default)]
            count: i64,
        }

        let mut map = Map::new();
        map.insert("name".to_string(), Value::from("x"));
        map.insert("extra".to_string(), Value::from(true));
        let sample: Sample = decode_map(map).unwrap();
        assert_eq!(sample.name, "x");
        assert_eq!(sample.count, 0);
    }
}

// Lenient serde helpers for venue payloads. Both venues send numbers either as
// JSON numbers or as decimal strings depending on the endpoint.

use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;

fn value_to_string(v: Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accepts `"123"` or `123`.
pub fn string_or_number<'de, D>(d: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(d)?;
    value_to_string(v).ok_or_else(|| de::Error::custom("expected a string or a number"))
}

pub fn opt_string_or_number<'de, D>(d: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        v => value_to_string(v)
            .map(Some)
            .ok_or_else(|| de::Error::custom("expected a string or a number")),
    }
}

pub fn u64_flex<'de, D>(d: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = string_or_number(d)?;
    s.trim().parse::<u64>().map_err(de::Error::custom)
}

pub fn opt_u64_flex<'de, D>(d: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match opt_string_or_number(d)? {
        None => Ok(None),
        Some(s) => s.trim().parse::<u64>().map(Some).map_err(de::Error::custom),
    }
}

pub fn f64_flex<'de, D>(d: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = string_or_number(d)?;
    s.trim().parse::<f64>().map_err(de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Probe {
        #[serde(deserialize_with = "u64_flex")]
        seq: u64,
        #[serde(deserialize_with = "f64_flex")]
        px: f64,
        #[serde(default, deserialize_with = "opt_string_or_number")]
        code: Option<String>,
    }

    #[test]
    fn test_accepts_strings_and_numbers() {
        let a: Probe = serde_json::from_str(r#"{"seq":"42","px":"19.10","code":"000000"}"#).unwrap();
        let b: Probe = serde_json::from_str(r#"{"seq":42,"px":19.1,"code":-1021}"#).unwrap();
        assert_eq!(a.seq, 42);
        assert_eq!(b.seq, 42);
        assert_eq!(a.px, b.px);
        assert_eq!(a.code.as_deref(), Some("000000"));
        assert_eq!(b.code.as_deref(), Some("-1021"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(serde_json::from_str::<Probe>(r#"{"seq":"abc","px":"1"}"#).is_err());
        assert!(serde_json::from_str::<Probe>(r#"{"seq":1,"px":[1]}"#).is_err());
    }
}

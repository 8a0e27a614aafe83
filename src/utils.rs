use std::time::Duration;
use serde::{Deserialize, Deserializer, Serializer};
use crate::errors::{Result, StreamError};

/// Parse a duration string like "8s", "500ms", "2m" into a std Duration
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(StreamError::config("Empty duration string"));
    }

    humantime::parse_duration(s)
        .map_err(|e| StreamError::config(format!("Invalid duration '{}': {}", s, e)))
}

/// serde helpers so config files can say `readiness_timeout = "8s"`
pub mod duration_str {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }
}

/// Decode captured process output leniently and cap it at `limit` bytes.
pub fn lossy_prefix(bytes: &[u8], limit: usize) -> String {
    let end = bytes.len().min(limit);
    String::from_utf8_lossy(&bytes[..end]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("8s").unwrap(), Duration::from_secs(8));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration(" 33ms ").unwrap(), Duration::from_millis(33));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_lossy_prefix() {
        assert_eq!(lossy_prefix(b"  camera busy\n", 500), "camera busy");
        assert_eq!(lossy_prefix(b"abcdef", 3), "abc");
        // invalid utf-8 is replaced, not rejected
        assert_eq!(lossy_prefix(&[b'o', b'k', 0xFF], 500), "ok\u{FFFD}");
    }
}

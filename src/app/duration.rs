use std::time::Duration;

use anyhow::{Result, bail};

/// Parse a duration string of the form `1h30m`, `3s`, `500ms`.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if value.is_empty() {
        bail!("empty duration");
    }

    let bytes = value.as_bytes();
    let mut total = Duration::ZERO;
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if start == i {
            bail!("malformed duration {value:?}");
        }
        let number: u64 = value[start..i].parse()?;

        let unit_start = i;
        while i < bytes.len() && !bytes[i].is_ascii_digit() {
            i += 1;
        }

        total += match &value[unit_start..i] {
            "h" => Duration::from_secs(number * 3600),
            "m" => Duration::from_secs(number * 60),
            "s" => Duration::from_secs(number),
            "ms" => Duration::from_millis(number),
            unit => bail!("unknown duration unit {unit:?} in {value:?}"),
        };
    }

    Ok(total)
}

/// Render a duration in the same compact form `parse_duration` accepts.
pub fn format_duration(value: Duration) -> String {
    let millis = value.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }

    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }

    let mut secs = value.as_secs();
    let hours = secs / 3600;
    secs %= 3600;
    let minutes = secs / 60;
    secs %= 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if secs > 0 || out.is_empty() {
        out.push_str(&format!("{secs}s"));
    }

    out
}

/// Serde adapter so durations serialize as the string form used by alias
/// files and the introspection view.
pub mod duration_string {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_composite() {
        assert_eq!(
            parse_duration("1h30m10s").unwrap(),
            Duration::from_secs(3600 + 30 * 60 + 10)
        );
    }

    #[test]
    fn test_parse_millis() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("tens").is_err());
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn test_format_round_trip() {
        for s in ["3s", "10s", "1m30s", "2h", "1h2m3s", "500ms", "0s"] {
            let d = parse_duration(s).unwrap();
            assert_eq!(format_duration(d), s, "round-trip failed for {s}");
        }
    }
}

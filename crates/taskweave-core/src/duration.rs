//! Go-style duration strings (`"5m"`, `"2h"`, `"1h30m"`, `"500ms"`).
//!
//! Config files and workflow documents express intervals this way. Parsing is
//! strict: an empty string, a missing unit, or an unknown unit is an error.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::{Error, Result};

#[allow(clippy::expect_used)]
static WHOLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d+(?:\.\d+)?(?:ms|h|m|s))+$").expect("static regex is valid")
});
#[allow(clippy::expect_used)]
static PART_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)(ms|h|m|s)").expect("static regex is valid")
});

/// Parse a duration string such as `"1h30m"` or `"1.5s"`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid(input, "empty duration"));
    }
    if !WHOLE_RE.is_match(trimmed) {
        return Err(invalid(input, "expected <number><unit> groups with units ms, s, m, h"));
    }

    let mut total = 0.0_f64;
    for caps in PART_RE.captures_iter(trimmed) {
        let value: f64 = caps[1]
            .parse()
            .map_err(|_| invalid(input, "number out of range"))?;
        let scale = match &caps[2] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            other => return Err(invalid(input, &format!("unknown unit {other:?}"))),
        };
        total += value * scale;
    }

    Duration::try_from_secs_f64(total).map_err(|e| invalid(input, &e.to_string()))
}

/// Parse `input`, falling back to `default` when it is empty or malformed.
///
/// Returns the fallback reason alongside so callers can log it.
pub fn parse_duration_or(input: &str, default: Duration) -> (Duration, Option<Error>) {
    if input.trim().is_empty() {
        return (default, None);
    }
    match parse_duration(input) {
        Ok(d) => (d, None),
        Err(e) => (default, Some(e)),
    }
}

/// Render a duration compactly: `"2h0m0s"`, `"5m30s"`, `"1.2s"`, `"350ms"`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if d.is_zero() {
        "0s".to_string()
    } else if secs >= 60 {
        let hours = secs / 3600;
        let minutes = (secs % 3600) / 60;
        let rest = secs % 60;
        if hours > 0 {
            format!("{hours}h{minutes}m{rest}s")
        } else {
            format!("{minutes}m{rest}s")
        }
    } else if secs > 0 {
        let tenths = d.subsec_millis() / 100;
        if tenths == 0 {
            format!("{secs}s")
        } else {
            format!("{secs}.{tenths}s")
        }
    } else {
        format!("{}ms", d.subsec_millis())
    }
}

fn invalid(input: &str, reason: &str) -> Error {
    Error::Duration {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_units() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn parses_compound_and_fractional() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration(" 10s ").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "   ", "5", "m5", "5 minutes", "5d", "-5m", "1h30"] {
            assert!(parse_duration(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn error_names_the_input() {
        let err = parse_duration("soon").unwrap_err();
        assert!(err.to_string().contains("\"soon\""));
    }

    #[test]
    fn fallback_reports_reason() {
        let default = Duration::from_secs(300);
        let (d, err) = parse_duration_or("bogus", default);
        assert_eq!(d, default);
        assert!(err.is_some());

        let (d, err) = parse_duration_or("", default);
        assert_eq!(d, default);
        assert!(err.is_none());

        let (d, err) = parse_duration_or("1m", default);
        assert_eq!(d, Duration::from_secs(60));
        assert!(err.is_none());
    }

    #[test]
    fn formats_compactly() {
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h0m0s");
        assert_eq!(format_duration(Duration::from_secs(330)), "5m30s");
        assert_eq!(format_duration(Duration::from_millis(1200)), "1.2s");
        assert_eq!(format_duration(Duration::from_secs(3)), "3s");
        assert_eq!(format_duration(Duration::from_millis(350)), "350ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }
}

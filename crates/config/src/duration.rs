//! Human-friendly duration strings used throughout the config file.

use std::time::Duration;

/// Parse a duration string into milliseconds.
///
/// Supported suffixes: `ms`, `s`, `m`, `h`, `d`.
/// Examples: `"500ms"`, `"30s"`, `"10m"`, `"2h"`.
pub fn parse_duration_ms(input: &str) -> Result<u64, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("empty duration string".into());
    }

    let Some(split) = input.find(|c: char| c.is_ascii_alphabetic()) else {
        return Err(format!("duration missing unit suffix (ms/s/m/h/d): {input}"));
    };
    let (num_str, suffix) = input.split_at(split);

    let value: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number in duration: {num_str}"))?;

    if value == 0 {
        return Err("duration must be > 0".into());
    }

    let multiplier = match suffix {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return Err(format!("unknown duration suffix: {suffix} (expected ms/s/m/h/d)")),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("duration overflows: {input}"))
}

/// Parse a named config field into a [`Duration`].
pub(crate) fn parse_field(field: &str, value: &str) -> crate::Result<Duration> {
    parse_duration_ms(value)
        .map(Duration::from_millis)
        .map_err(|message| crate::Error::invalid_duration(field, message))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("500ms", 500)]
    #[case("30s", 30_000)]
    #[case("10m", 600_000)]
    #[case("2h", 7_200_000)]
    #[case("1d", 86_400_000)]
    #[case("  60s ", 60_000)]
    fn parses_supported_suffixes(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(parse_duration_ms(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("100")]
    #[case("0s")]
    #[case("10x")]
    #[case("abc")]
    fn rejects_malformed(#[case] input: &str) {
        assert!(parse_duration_ms(input).is_err());
    }

    #[test]
    fn field_errors_name_the_field() {
        let err = parse_field("mirror.base_interval", "soon").unwrap_err();
        assert!(err.to_string().contains("mirror.base_interval"));
    }
}

//! Wire codec for lease and expiration deltas.
//!
//! Durations cross the wire as `[DD] [HH:[MM:]]SS[.uuuuuu]` strings, e.g.
//! `"3 00:30:00"` for three days and thirty minutes or `"90"` for ninety
//! seconds. These are plain codec functions in the serialization layer; the
//! domain works exclusively with [`chrono::Duration`].

use chrono::Duration;

use crate::error::{Error, Result};

const MICROS_PER_SECOND: i64 = 1_000_000;

/// Formats a duration in the wire form.
///
/// Days are included only when non-zero; microseconds only when non-zero.
/// Negative durations carry a leading `-`.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let total_micros = duration.num_microseconds().unwrap_or(i64::MAX);
    let sign = if total_micros < 0 { "-" } else { "" };
    let total_micros = total_micros.abs();

    let total_seconds = total_micros / MICROS_PER_SECOND;
    let micros = total_micros % MICROS_PER_SECOND;
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;

    let mut out = String::new();
    out.push_str(sign);
    if days > 0 {
        out.push_str(&format!("{days} "));
    }
    out.push_str(&format!("{hours:02}:{minutes:02}:{seconds:02}"));
    if micros > 0 {
        out.push_str(&format!(".{micros:06}"));
    }
    out
}

/// Parses a duration from the wire form.
///
/// Accepted shapes: `SS`, `MM:SS`, `HH:MM:SS`, each optionally preceded by
/// a day count and followed by a fractional-second part of up to six
/// digits. A single leading `-` negates the whole duration.
///
/// # Errors
///
/// Returns [`Error::InvalidDuration`] on any other shape.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_duration("empty string"));
    }

    let (negative, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };

    let mut parts = rest.split_whitespace();
    let first = parts
        .next()
        .ok_or_else(|| Error::invalid_duration("empty string"))?;
    let (days, clock) = match parts.next() {
        Some(clock) => (parse_int(first, "day count")?, clock),
        None => (0, first),
    };
    if parts.next().is_some() {
        return Err(Error::invalid_duration(format!(
            "too many space-separated fields in {trimmed:?}"
        )));
    }

    let (clock, micros) = match clock.split_once('.') {
        Some((clock, frac)) => (clock, parse_fraction(frac)?),
        None => (clock, 0),
    };

    let fields: Vec<&str> = clock.split(':').collect();
    let (hours, minutes, seconds) = match fields.as_slice() {
        [s] => (0, 0, parse_int(s, "seconds")?),
        [m, s] => (0, parse_int(m, "minutes")?, parse_int(s, "seconds")?),
        [h, m, s] => (
            parse_int(h, "hours")?,
            parse_int(m, "minutes")?,
            parse_int(s, "seconds")?,
        ),
        _ => {
            return Err(Error::invalid_duration(format!(
                "too many clock fields in {clock:?}"
            )))
        }
    };

    if minutes >= 60 || seconds >= 60 {
        return Err(Error::invalid_duration(format!(
            "minutes and seconds must be below 60 in {clock:?}"
        )));
    }

    let total_micros = ((days * 86_400 + hours * 3_600 + minutes * 60 + seconds)
        * MICROS_PER_SECOND)
        + micros;
    let signed = if negative { -total_micros } else { total_micros };
    Ok(Duration::microseconds(signed))
}

fn parse_int(text: &str, what: &str) -> Result<i64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::invalid_duration(format!(
            "{what} must be a non-negative integer, got {text:?}"
        )));
    }
    text.parse::<i64>()
        .map_err(|e| Error::invalid_duration(format!("{what} {text:?}: {e}")))
}

fn parse_fraction(frac: &str) -> Result<i64> {
    if frac.is_empty() || frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::invalid_duration(format!(
            "fractional seconds must be 1-6 digits, got {frac:?}"
        )));
    }
    // Right-pad to microsecond precision: ".5" means 500000us.
    let padded = format!("{frac:0<6}");
    padded
        .parse::<i64>()
        .map_err(|e| Error::invalid_duration(format!("fraction {frac:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_seconds() {
        assert_eq!(parse_duration("90").unwrap(), Duration::seconds(90));
    }

    #[test]
    fn parses_minutes_and_seconds() {
        assert_eq!(parse_duration("30:00").unwrap(), Duration::minutes(30));
    }

    #[test]
    fn parses_full_clock() {
        assert_eq!(
            parse_duration("01:30:00").unwrap(),
            Duration::minutes(90)
        );
    }

    #[test]
    fn parses_days() {
        assert_eq!(
            parse_duration("3 00:30:00").unwrap(),
            Duration::days(3) + Duration::minutes(30)
        );
    }

    #[test]
    fn parses_microseconds() {
        assert_eq!(
            parse_duration("00:00:01.5").unwrap(),
            Duration::microseconds(1_500_000)
        );
        assert_eq!(
            parse_duration("00:00:00.000001").unwrap(),
            Duration::microseconds(1)
        );
    }

    #[test]
    fn parses_negative() {
        assert_eq!(parse_duration("-00:01:00").unwrap(), Duration::minutes(-1));
    }

    #[test]
    fn rejects_malformed() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("1:2:3:4").is_err());
        assert!(parse_duration("00:99:00").is_err());
        assert!(parse_duration("1 2 3").is_err());
        assert!(parse_duration("00:00:00.1234567").is_err());
    }

    #[test]
    fn formats_and_reparses() {
        for duration in [
            Duration::seconds(0),
            Duration::seconds(59),
            Duration::minutes(90),
            Duration::days(3) + Duration::minutes(30),
            Duration::microseconds(1_500_000),
            Duration::minutes(-5),
        ] {
            let wire = format_duration(duration);
            assert_eq!(parse_duration(&wire).unwrap(), duration, "wire {wire}");
        }
    }

    #[test]
    fn format_omits_zero_days_and_micros() {
        assert_eq!(format_duration(Duration::minutes(90)), "01:30:00");
        assert_eq!(
            format_duration(Duration::days(1) + Duration::seconds(1)),
            "1 00:00:01"
        );
    }
}

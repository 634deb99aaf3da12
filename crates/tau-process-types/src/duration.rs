//! ISO-8601 duration parsing for the `PnDTnHnMn.nS` subset.

use chrono::TimeDelta;
use thiserror::Error;

const SECONDS_PER_MINUTE: i64 = 60;
const SECONDS_PER_HOUR: i64 = 60 * SECONDS_PER_MINUTE;
const SECONDS_PER_DAY: i64 = 24 * SECONDS_PER_HOUR;

/// Error returned when a duration string is not valid ISO-8601.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid ISO-8601 duration '{input}': {reason}")]
pub struct DurationParseError {
    pub input: String,
    pub reason: &'static str,
}

/// Parses `[-+]PnDTnHnMn.nS` into a signed duration.
///
/// Units are case-insensitive, each unit may appear once and in order, and a
/// fractional part is only allowed on seconds (up to nine digits).
pub fn parse_iso8601_duration(input: &str) -> Result<TimeDelta, DurationParseError> {
    let fail = |reason| DurationParseError {
        input: input.to_string(),
        reason,
    };

    let text = input.trim().to_ascii_uppercase();
    let (negative, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(&text)),
    };
    let Some(rest) = rest.strip_prefix('P') else {
        return Err(fail("missing 'P' designator"));
    };

    let (date_part, time_part) = match rest.split_once('T') {
        Some((date, time)) => {
            if time.is_empty() {
                return Err(fail("'T' must be followed by a time component"));
            }
            (date, Some(time))
        }
        None => (rest, None),
    };

    let mut seconds: i64 = 0;
    let mut nanos: i64 = 0;
    let mut components = 0usize;

    if !date_part.is_empty() {
        let Some(days) = date_part.strip_suffix('D') else {
            return Err(fail("only days are allowed before 'T'"));
        };
        let days = parse_whole(days).ok_or_else(|| fail("invalid day count"))?;
        seconds = days
            .checked_mul(SECONDS_PER_DAY)
            .ok_or_else(|| fail("duration overflows"))?;
        components += 1;
    }

    if let Some(mut time) = time_part {
        for (unit, scale) in [('H', SECONDS_PER_HOUR), ('M', SECONDS_PER_MINUTE)] {
            if let Some(index) = time.find(unit) {
                let value = parse_whole(&time[..index]).ok_or_else(|| fail("invalid number"))?;
                let value = value
                    .checked_mul(scale)
                    .ok_or_else(|| fail("duration overflows"))?;
                seconds = seconds
                    .checked_add(value)
                    .ok_or_else(|| fail("duration overflows"))?;
                time = &time[index + 1..];
                components += 1;
            }
        }
        if !time.is_empty() {
            let Some(value) = time.strip_suffix('S') else {
                return Err(fail("unexpected trailing characters"));
            };
            let (whole, fraction) = match value.split_once(['.', ',']) {
                Some((whole, fraction)) => (whole, Some(fraction)),
                None => (value, None),
            };
            let whole = parse_whole(whole).ok_or_else(|| fail("invalid seconds"))?;
            seconds = seconds
                .checked_add(whole)
                .ok_or_else(|| fail("duration overflows"))?;
            if let Some(fraction) = fraction {
                if fraction.is_empty()
                    || fraction.len() > 9
                    || !fraction.bytes().all(|b| b.is_ascii_digit())
                {
                    return Err(fail("invalid fractional seconds"));
                }
                let padded = format!("{fraction:0<9}");
                nanos = padded.parse().map_err(|_| fail("invalid fractional seconds"))?;
                if whole < 0 || value.starts_with('-') {
                    nanos = -nanos;
                }
            }
            components += 1;
        }
    }

    if components == 0 {
        return Err(fail("no duration components"));
    }

    let delta = TimeDelta::try_seconds(seconds)
        .and_then(|delta| delta.checked_add(&TimeDelta::nanoseconds(nanos)))
        .ok_or_else(|| fail("duration overflows"))?;
    Ok(if negative { -delta } else { delta })
}

fn parse_whole(value: &str) -> Option<i64> {
    let digits = value.strip_prefix(['-', '+']).unwrap_or(value);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::parse_iso8601_duration;

    #[test]
    fn parses_common_forms() {
        let cases = [
            ("PT30S", 30),
            ("PT1M", 60),
            ("PT1H30M", 5_400),
            ("P2D", 172_800),
            ("P1DT1S", 86_401),
            ("pt15m", 900),
            ("PT1.5S", 1),
            ("-PT10S", -10),
        ];
        for (input, expected) in cases {
            let parsed = parse_iso8601_duration(input).expect(input);
            assert_eq!(parsed.num_seconds(), expected, "{input}");
        }
    }

    #[test]
    fn keeps_fractional_seconds() {
        let parsed = parse_iso8601_duration("PT0.25S").expect("parse");
        assert_eq!(parsed.num_milliseconds(), 250);
    }

    #[test]
    fn rejects_malformed_input() {
        for input in ["", "30", "P", "PT", "P1H", "PT1X", "PT1.S", "PTS", "P1DT", "PT1M1H"] {
            assert!(
                parse_iso8601_duration(input).is_err(),
                "{input:?} must be rejected"
            );
        }
    }
}

//! Small shared helpers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Failure to parse an ISO-8601 duration.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid ISO-8601 duration: {input:?}")]
pub struct DurationParseError {
    input: String,
}

impl DurationParseError {
    fn new(input: &str) -> Self {
        Self {
            input: input.to_string(),
        }
    }
}

/// Parse an ISO-8601 duration of the `PnW` / `PnDTnHnMnS` shape.
///
/// Supports weeks, days, hours, minutes, and seconds; seconds may carry a
/// fractional part. Year and month designators are rejected because their
/// length depends on a calendar anchor this crate does not have.
///
/// # Errors
///
/// [`DurationParseError`] for anything that is not a valid, non-negative
/// duration with at least one component.
pub fn parse_iso8601_duration(input: &str) -> Result<Duration, DurationParseError> {
    let err = || DurationParseError::new(input);

    let body = input.strip_prefix('P').ok_or_else(err)?;
    let (date_part, time_part) = match body.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (body, None),
    };
    if date_part.is_empty() && time_part.is_none_or(str::is_empty) {
        return Err(err());
    }

    fn parse_components(
        input: &str,
        part: &str,
        units: &[(char, f64)],
        allow_fraction: char,
        total: &mut f64,
    ) -> Result<(), DurationParseError> {
        let err = || DurationParseError::new(input);
        let mut rest = part;
        let mut last_unit_index = None;
        while !rest.is_empty() {
            let digits_end = rest
                .find(|c: char| !c.is_ascii_digit() && c != '.')
                .ok_or_else(err)?;
            let (number, tail) = rest.split_at(digits_end);
            let unit = tail.chars().next().ok_or_else(err)?;
            let index = units
                .iter()
                .position(|(u, _)| *u == unit)
                .ok_or_else(err)?;
            // Components must appear at most once, in declining order.
            if last_unit_index.is_some_and(|last| index <= last) {
                return Err(err());
            }
            last_unit_index = Some(index);
            if number.contains('.') && unit != allow_fraction {
                return Err(err());
            }
            let value: f64 = number.parse().map_err(|_| err())?;
            let (_, scale) = units.get(index).ok_or_else(err)?;
            *total += value * scale;
            rest = tail.get(1..).ok_or_else(err)?;
        }
        Ok(())
    }

    let mut total = 0.0_f64;
    parse_components(
        input,
        date_part,
        &[('W', 604_800.0), ('D', 86_400.0)],
        '\0',
        &mut total,
    )?;
    if let Some(time) = time_part {
        if time.is_empty() {
            return Err(err());
        }
        parse_components(
            input,
            time,
            &[('H', 3600.0), ('M', 60.0), ('S', 1.0)],
            'S',
            &mut total,
        )?;
    }

    if !total.is_finite() {
        return Err(err());
    }
    Ok(Duration::from_secs_f64(total))
}

/// Current unix time in whole seconds.
#[must_use]
pub fn unix_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_time_components() {
        assert_eq!(
            parse_iso8601_duration("PT1S").unwrap(),
            Duration::from_secs(1)
        );
        assert_eq!(
            parse_iso8601_duration("PT5M").unwrap(),
            Duration::from_secs(300)
        );
        assert_eq!(
            parse_iso8601_duration("PT2H30M").unwrap(),
            Duration::from_secs(9000)
        );
        assert_eq!(
            parse_iso8601_duration("PT3.5S").unwrap(),
            Duration::from_millis(3500)
        );
    }

    #[test]
    fn parses_date_components() {
        assert_eq!(
            parse_iso8601_duration("P1D").unwrap(),
            Duration::from_secs(86_400)
        );
        assert_eq!(
            parse_iso8601_duration("P2W").unwrap(),
            Duration::from_secs(2 * 604_800)
        );
        assert_eq!(
            parse_iso8601_duration("P1DT12H").unwrap(),
            Duration::from_secs(86_400 + 12 * 3600)
        );
    }

    #[test]
    fn rejects_malformed_inputs() {
        for bad in [
            "", "P", "PT", "1S", "PT1X", "P1Y", "P1M", "-PT1S", "PT1.5M", "PTS", "PT1M1H",
            "PT1S1S", "P1DT",
        ] {
            assert!(
                parse_iso8601_duration(bad).is_err(),
                "{bad:?} should not parse"
            );
        }
    }
}

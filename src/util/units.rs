//! Size and duration value parsing.
//!
//! The directive-based configuration *grammar* is out of scope (§1), but the
//! scalar value parsers it would call into (`2m` for `client_max_body_size`,
//! `30s` for a timeout) are self-contained ambient utilities independent of
//! that grammar, and §8 names exact boundary behaviors for them.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeParseError {
    #[error("empty size value")]
    Empty,
    #[error("invalid digits in size value")]
    InvalidDigits,
    #[error("unknown size unit {0:?}")]
    UnknownUnit(char),
    #[error("size value overflows the parser's 32-bit unit-scaled range")]
    Overflow,
}

/// Parse a size value like `"512"`, `"2k"`, `"4M"`, `"1G"` into a byte count.
///
/// A bare number (no unit suffix) is accepted up to `i64::MAX`. Once a unit
/// suffix is present the scaled result must still fit in 32 bits — the
/// historical `ssize_t` width this parser's unit path was sized for — so
/// `"2147483648"` (2^31, no unit) succeeds but `"2147483648K"` overflows.
pub fn parse_size_bytes(input: &str) -> Result<i64, SizeParseError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(SizeParseError::Empty);
    }

    let (digits, unit) = match input.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&input[..input.len() - 1], Some(c)),
        Some(_) => (input, None),
        None => return Err(SizeParseError::Empty),
    };

    let mantissa: i64 = digits.parse().map_err(|_| SizeParseError::InvalidDigits)?;

    let Some(unit) = unit else {
        return Ok(mantissa);
    };

    let scale: i64 = match unit.to_ascii_lowercase() {
        'k' => 1024,
        'm' => 1024 * 1024,
        'g' => 1024 * 1024 * 1024,
        other => return Err(SizeParseError::UnknownUnit(other)),
    };

    let scaled = mantissa
        .checked_mul(scale)
        .ok_or(SizeParseError::Overflow)?;
    if scaled > i32::MAX as i64 {
        return Err(SizeParseError::Overflow);
    }
    Ok(scaled)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("empty duration value")]
    Empty,
    #[error("invalid digits in duration component {0:?}")]
    InvalidDigits(String),
    #[error("unknown duration unit {0:?}")]
    UnknownUnit(String),
    #[error("duration units must appear in strictly decreasing order, with no unit's value \
             reaching the next larger unit's rollover")]
    StepOrder,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct UnitRank(u8);

/// Units in descending-period order, with the per-unit value bound before it
/// would roll over into the next larger unit (`None` = unbounded, as years
/// are the largest unit this parser knows).
const UNITS: &[(&str, u64, Option<u64>)] = &[
    ("y", 365 * 24 * 3600 * 1000, None),
    ("M", 30 * 24 * 3600 * 1000, Some(11)),
    ("w", 7 * 24 * 3600 * 1000, Some(4)),
    ("d", 24 * 3600 * 1000, Some(6)),
    ("h", 3600 * 1000, Some(23)),
    ("m", 60 * 1000, Some(59)),
    ("s", 1000, Some(59)),
    ("ms", 1, Some(999)),
];

/// Parse a duration value like `"30s"`, `"1y 6M"`, `"500ms"` into
/// milliseconds. Components must name units in the strictly decreasing order
/// of [`UNITS`], and each component's value must stay below that unit's
/// rollover bound (§8: `"1y 12M"` fails because 12 months would itself be a
/// year).
pub fn parse_duration_ms(input: &str) -> Result<u64, DurationParseError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(DurationParseError::Empty);
    }

    let mut total: u64 = 0;
    let mut last_rank: Option<usize> = None;

    for component in input.split_whitespace() {
        let split_at = component
            .find(|c: char| c.is_ascii_alphabetic())
            .ok_or_else(|| DurationParseError::UnknownUnit(component.to_string()))?;
        let (digits, unit) = component.split_at(split_at);

        let value: u64 = digits
            .parse()
            .map_err(|_| DurationParseError::InvalidDigits(digits.to_string()))?;

        let rank = UNITS
            .iter()
            .position(|(name, _, _)| *name == unit)
            .ok_or_else(|| DurationParseError::UnknownUnit(unit.to_string()))?;

        if let Some(last) = last_rank {
            if rank <= last {
                return Err(DurationParseError::StepOrder);
            }
        }
        last_rank = Some(rank);

        let (_, ms_per_unit, bound) = UNITS[rank];
        if let Some(bound) = bound {
            if value > bound {
                return Err(DurationParseError::StepOrder);
            }
        }

        total += value * ms_per_unit;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_large_number_succeeds() {
        assert_eq!(parse_size_bytes("2147483648").unwrap(), 2147483648);
    }

    #[test]
    fn unit_suffixed_overflow_is_rejected() {
        assert_eq!(
            parse_size_bytes("2147483648K"),
            Err(SizeParseError::Overflow)
        );
    }

    #[test]
    fn small_unit_suffixed_value_succeeds() {
        assert_eq!(parse_size_bytes("4k").unwrap(), 4096);
        assert_eq!(parse_size_bytes("2M").unwrap(), 2 * 1024 * 1024);
    }

    #[test]
    fn duration_step_order_violation_is_rejected() {
        assert_eq!(parse_duration_ms("1y 12M"), Err(DurationParseError::StepOrder));
    }

    #[test]
    fn duration_parses_descending_units() {
        assert_eq!(
            parse_duration_ms("1y 6M").unwrap(),
            365 * 24 * 3600 * 1000 + 6 * 30 * 24 * 3600 * 1000
        );
        assert_eq!(parse_duration_ms("30s").unwrap(), 30_000);
    }

    #[test]
    fn duration_rejects_out_of_order_units() {
        assert_eq!(parse_duration_ms("1s 1h"), Err(DurationParseError::StepOrder));
    }
}

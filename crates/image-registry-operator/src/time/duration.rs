use std::{
    borrow::Cow,
    fmt::Display,
    num::ParseIntError,
    ops::{Add, Deref},
    str::FromStr,
};

use schemars::{JsonSchema, Schema, SchemaGenerator, json_schema};
use snafu::{ResultExt, Snafu};
use strum::IntoEnumIterator;

#[derive(Debug, PartialEq, Snafu)]
#[snafu(module)]
pub enum ParseDurationError {
    #[snafu(display("duration must be a non-empty ASCII string"))]
    InvalidInput,

    #[snafu(display("unexpected character {chr:?}"))]
    UnexpectedCharacter { chr: char },

    #[snafu(display("value {value} has no unit"))]
    MissingUnit { value: u64 },

    #[snafu(display("unknown unit {unit:?}"))]
    UnknownUnit { unit: String },

    #[snafu(display("unit {current} must come before {previous}"))]
    UnitOrder {
        previous: DurationUnit,
        current: DurationUnit,
    },

    #[snafu(display("unit {unit} was specified more than once"))]
    DuplicateUnit { unit: DurationUnit },

    #[snafu(display("failed to parse value"))]
    ParseValue { source: ParseIntError },

    #[snafu(display("duration is too large"))]
    Overflow,
}

/// A human readable duration such as `24h`, `10m` or `1d2h30s`.
///
/// Fragments consist of a number followed by a [`DurationUnit`] and must be
/// ordered from the largest to the smallest unit. The value is stored with
/// millisecond precision.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(std::time::Duration);

impl Duration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(std::time::Duration::from_secs(secs))
    }

    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    pub const fn from_hours(hours: u64) -> Self {
        Self::from_mins(hours * 60)
    }

    pub fn saturating_mul(self, rhs: u32) -> Self {
        Self(self.0.saturating_mul(rhs))
    }
}

impl Add for Duration {
    type Output = Self;

    /// Saturates at the maximum duration instead of overflowing.
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl FromStr for Duration {
    type Err = ParseDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use parse_duration_error::*;

        let input = s.trim();
        if input.is_empty() || !input.is_ascii() {
            return InvalidInputSnafu.fail();
        }

        let mut rest = input;
        let mut millis: u64 = 0;
        let mut previous: Option<DurationUnit> = None;

        while !rest.is_empty() {
            let digits_end = rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rest.len());
            if digits_end == 0 {
                let chr = rest.chars().next().unwrap_or_default();
                return UnexpectedCharacterSnafu { chr }.fail();
            }
            let value = rest[..digits_end].parse::<u64>().context(ParseValueSnafu)?;
            rest = &rest[digits_end..];

            let unit_end = rest
                .find(|c: char| !c.is_ascii_alphabetic())
                .unwrap_or(rest.len());
            if unit_end == 0 {
                return match rest.chars().next() {
                    Some(chr) => UnexpectedCharacterSnafu { chr }.fail(),
                    None => MissingUnitSnafu { value }.fail(),
                };
            }
            let unit = &rest[..unit_end];
            let unit = unit
                .parse::<DurationUnit>()
                .map_err(|_| ParseDurationError::UnknownUnit {
                    unit: unit.to_owned(),
                })?;
            rest = &rest[unit_end..];

            if let Some(previous) = previous {
                if unit == previous {
                    return DuplicateUnitSnafu { unit }.fail();
                }
                if unit < previous {
                    return UnitOrderSnafu {
                        previous,
                        current: unit,
                    }
                    .fail();
                }
            }
            previous = Some(unit);

            millis = value
                .checked_mul(unit.millis())
                .and_then(|fragment| millis.checked_add(fragment))
                .ok_or(ParseDurationError::Overflow)?;
        }

        Ok(Self(std::time::Duration::from_millis(millis)))
    }
}

impl Display for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut millis = self.0.as_millis();
        if millis == 0 {
            return write!(f, "0{}", DurationUnit::Seconds);
        }

        for unit in DurationUnit::iter() {
            let unit_millis = u128::from(unit.millis());
            let whole = millis / unit_millis;
            if whole > 0 {
                write!(f, "{whole}{unit}")?;
            }
            millis %= unit_millis;
        }

        Ok(())
    }
}

impl Deref for Duration {
    type Target = std::time::Duration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<std::time::Duration> for Duration {
    fn from(value: std::time::Duration) -> Self {
        Self(value)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(value: Duration) -> Self {
        value.0
    }
}

impl JsonSchema for Duration {
    fn schema_name() -> Cow<'static, str> {
        "Duration".into()
    }

    fn json_schema(_: &mut SchemaGenerator) -> Schema {
        json_schema!({
            "type": "string",
            "description": "A human readable duration like `24h` or `1d12h`",
        })
    }
}

/// Units accepted in a [`Duration`], from the largest to the smallest.
///
/// The variant order is relied upon for parsing and formatting.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    strum::EnumString,
    strum::Display,
    strum::EnumIter,
)]
pub enum DurationUnit {
    #[strum(serialize = "d")]
    Days,

    #[strum(serialize = "h")]
    Hours,

    #[strum(serialize = "m")]
    Minutes,

    #[strum(serialize = "s")]
    Seconds,

    #[strum(serialize = "ms")]
    Milliseconds,
}

impl DurationUnit {
    const fn millis(self) -> u64 {
        match self {
            Self::Days => 86_400_000,
            Self::Hours => 3_600_000,
            Self::Minutes => 60_000,
            Self::Seconds => 1_000,
            Self::Milliseconds => 1,
        }
    }
}

//! Human-readable resource quantities.
//!
//! Accepts the notation used by Kubernetes resource requests:
//!
//! - binary suffixes: `Ki Mi Gi Ti Pi Ei`
//! - decimal suffixes: `n u m k M G T P E` (and none)
//! - exponent notation: `1e3`, `2.5E-3`
//!
//! Values are held with nano precision; anything finer is rounded up.

use crate::error::{HarnessError, Result};
use regex::Regex;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static QUANTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([+-]?)([0-9]*)(?:\.([0-9]*))?(Ki|Mi|Gi|Ti|Pi|Ei|[eE][+-]?[0-9]+|[numkMGTPE])?$")
        .expect("static quantity pattern compiles")
});

const NANOS_PER_UNIT: i128 = 1_000_000_000;

/// A non-negative quantity such as `512Mi` or `0.5`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quantity {
    nanos: i128,
    original: String,
}

impl Quantity {
    /// Parse a quantity string.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] naming the input if it is malformed,
    /// negative, or too large to represent.
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            HarnessError::config(format!("invalid quantity {:?}: {}", input, reason))
        };

        let trimmed = input.trim();
        let caps = QUANTITY
            .captures(trimmed)
            .ok_or_else(|| invalid("expected a number with an optional unit suffix"))?;

        let whole = caps.get(2).map_or("", |m| m.as_str());
        let fraction = caps.get(3).map_or("", |m| m.as_str());
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid("missing digits"));
        }
        let negative = caps.get(1).is_some_and(|m| m.as_str() == "-");
        if negative && whole.chars().chain(fraction.chars()).any(|c| c != '0') {
            return Err(invalid("must not be negative"));
        }

        let (binary, exponent) = match caps.get(4).map(|m| m.as_str()) {
            None => (1, 0),
            Some("Ki") => (1i128 << 10, 0),
            Some("Mi") => (1 << 20, 0),
            Some("Gi") => (1 << 30, 0),
            Some("Ti") => (1 << 40, 0),
            Some("Pi") => (1 << 50, 0),
            Some("Ei") => (1 << 60, 0),
            Some("n") => (1, -9),
            Some("u") => (1, -6),
            Some("m") => (1, -3),
            Some("k") => (1, 3),
            Some("M") => (1, 6),
            Some("G") => (1, 9),
            Some("T") => (1, 12),
            Some("P") => (1, 15),
            Some("E") => (1, 18),
            Some(exp) => {
                let exp = exp[1..]
                    .parse::<i32>()
                    .map_err(|_| invalid("exponent out of range"))?;
                (1, exp)
            }
        };

        let mantissa: i128 = format!("{}{}", whole, fraction)
            .parse()
            .map_err(|_| invalid("too many digits"))?;

        // value = mantissa * binary * 10^(exponent - fraction digits)
        let scale = exponent
            .checked_add(9)
            .and_then(|e| e.checked_sub(i32::try_from(fraction.len()).ok()?))
            .ok_or_else(|| invalid("exponent out of range"))?;

        let scaled = mantissa
            .checked_mul(binary)
            .ok_or_else(|| invalid("too large"))?;

        let nanos = if scale >= 0 {
            let factor = 10i128
                .checked_pow(scale.unsigned_abs())
                .ok_or_else(|| invalid("too large"))?;
            scaled.checked_mul(factor).ok_or_else(|| invalid("too large"))?
        } else {
            match 10i128.checked_pow(scale.unsigned_abs()) {
                Some(divisor) => div_ceil(scaled, divisor),
                // Smaller than one nano: anything non-zero rounds up to it.
                None => i128::from(scaled > 0),
            }
        };

        if nanos > i128::from(i64::MAX) * NANOS_PER_UNIT {
            return Err(invalid("too large"));
        }

        Ok(Self {
            nanos,
            original: trimmed.to_string(),
        })
    }

    /// Value in whole units, rounded up.
    pub fn value(&self) -> i64 {
        saturate(div_ceil(self.nanos, NANOS_PER_UNIT))
    }

    /// Value in thousandths, rounded up.
    pub fn milli_value(&self) -> i64 {
        saturate(div_ceil(self.nanos, 1_000_000))
    }

    /// Value in billionths.
    pub fn nano_value(&self) -> i64 {
        saturate(self.nanos)
    }

    /// Whether the quantity is zero.
    pub fn is_zero(&self) -> bool {
        self.nanos == 0
    }
}

fn div_ceil(value: i128, divisor: i128) -> i128 {
    let quotient = value / divisor;
    if value % divisor > 0 { quotient + 1 } else { quotient }
}

fn saturate(value: i128) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl FromStr for Quantity {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.original)
    }
}

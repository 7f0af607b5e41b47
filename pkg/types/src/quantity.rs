use anyhow::{Result, bail};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::str::FromStr;

/// A Kubernetes-style resource quantity (`"2"`, `"500m"`, `"512Mi"`, `"1.5G"`, `"1e3"`).
///
/// Stored as signed milli-units so CPU fractions and byte counts share one
/// representation. Arithmetic saturates instead of overflowing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity {
    millis: i128,
}

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: [(&str, i32); 10] = [
    ("n", -9),
    ("u", -6),
    ("m", -3),
    ("", 0),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

impl Quantity {
    pub const ZERO: Quantity = Quantity { millis: 0 };

    pub fn from_millis(millis: i128) -> Self {
        Self { millis }
    }

    pub fn from_units(units: i64) -> Self {
        Self {
            millis: i128::from(units) * 1000,
        }
    }

    pub fn millis(&self) -> i128 {
        self.millis
    }

    pub fn is_zero(&self) -> bool {
        self.millis == 0
    }

    pub fn is_positive(&self) -> bool {
        self.millis > 0
    }

    /// `self - rhs`, never below zero.
    pub fn sub_clamped(self, rhs: Quantity) -> Quantity {
        Quantity {
            millis: self.millis.saturating_sub(rhs.millis).max(0),
        }
    }

    pub fn clamp_non_negative(self) -> Quantity {
        Quantity {
            millis: self.millis.max(0),
        }
    }
}

impl Add for Quantity {
    type Output = Quantity;
    fn add(self, rhs: Quantity) -> Self::Output {
        Quantity {
            millis: self.millis.saturating_add(rhs.millis),
        }
    }
}

impl AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Quantity) {
        *self = *self + rhs;
    }
}

impl Sub for Quantity {
    type Output = Quantity;
    fn sub(self, rhs: Quantity) -> Self::Output {
        Quantity {
            millis: self.millis.saturating_sub(rhs.millis),
        }
    }
}

impl std::iter::Sum for Quantity {
    fn sum<I: Iterator<Item = Quantity>>(iter: I) -> Self {
        iter.fold(Quantity::ZERO, |acc, q| acc + q)
    }
}

/// Split `"1.5Gi"` into `("1.5", "Gi")`.
fn split_quantity(s: &str) -> (&str, &str) {
    let pos = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    s.split_at(pos)
}

/// Multiplier of a suffix as a `numerator / denominator` pair.
fn suffix_multiplier(suffix: &str) -> Result<(i128, i128)> {
    if let Some((_, power)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Ok((1024i128.pow(*power), 1));
    }
    if let Some((_, exp)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Ok(decimal_multiplier(*exp));
    }
    if let Some(exp) = suffix.strip_prefix(['e', 'E']) {
        let exp: i32 = match exp.parse() {
            Ok(e) => e,
            Err(_) => bail!("invalid exponent in suffix {:?}", suffix),
        };
        if !(-18..=18).contains(&exp) {
            bail!("exponent {} out of range", exp);
        }
        return Ok(decimal_multiplier(exp));
    }
    bail!("unknown quantity suffix {:?}", suffix)
}

fn decimal_multiplier(exp: i32) -> (i128, i128) {
    if exp >= 0 {
        (10i128.pow(exp.unsigned_abs()), 1)
    } else {
        (1, 10i128.pow(exp.unsigned_abs()))
    }
}

impl FromStr for Quantity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            bail!("quantity must not be empty");
        }
        let (number, suffix) = split_quantity(s);
        let (negative, number) = match number.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, number.strip_prefix('+').unwrap_or(number)),
        };
        let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && frac.is_empty() {
            bail!("quantity {:?} has no digits", s);
        }
        if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
            bail!("quantity {:?} is not a number", s);
        }
        if frac.len() > 18 {
            bail!("quantity {:?} has too many fractional digits", s);
        }

        let digits = format!("{}{}", whole, frac);
        let mantissa: i128 = match digits.parse() {
            Ok(m) => m,
            Err(_) => bail!("quantity {:?} is too large", s),
        };
        let (num, den) = suffix_multiplier(suffix)?;
        let den = den * 10i128.pow(frac.len() as u32);

        // Sub-milli precision rounds up, matching Kubernetes.
        let Some(millis) = mantissa
            .checked_mul(1000)
            .and_then(|m| m.checked_mul(num))
            .and_then(|scaled| scaled.checked_add(den - 1))
            .map(|rounded| rounded / den)
        else {
            bail!("quantity {:?} is too large", s);
        };
        Ok(Quantity {
            millis: if negative { -millis } else { millis },
        })
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.millis % 1000 != 0 {
            return write!(f, "{}m", self.millis);
        }
        let units = self.millis / 1000;
        if units == 0 {
            return f.write_str("0");
        }
        let abs = units.abs();
        if abs % 1024 == 0 {
            let (suffix, power) = BINARY_SUFFIXES
                .iter()
                .rev()
                .find(|(_, p)| abs % 1024i128.pow(*p) == 0)
                .copied()
                .unwrap_or(("Ki", 1));
            return write!(f, "{}{}", units / 1024i128.pow(power), suffix);
        }
        if abs % 1000 == 0 {
            let (suffix, exp) = DECIMAL_SUFFIXES
                .iter()
                .rev()
                .filter(|(_, e)| *e > 0)
                .find(|(_, e)| abs % 10i128.pow(e.unsigned_abs()) == 0)
                .copied()
                .unwrap_or(("k", 3));
            return write!(f, "{}{}", units / 10i128.pow(exp.unsigned_abs()), suffix);
        }
        write!(f, "{}", units)
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct QuantityVisitor;

impl Visitor<'_> for QuantityVisitor {
    type Value = Quantity;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a resource quantity string or integer")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Quantity, E> {
        v.parse().map_err(|e: anyhow::Error| E::custom(e))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Quantity, E> {
        Ok(Quantity::from_millis(i128::from(v) * 1000))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Quantity, E> {
        Ok(Quantity::from_units(v))
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(QuantityVisitor)
    }
}

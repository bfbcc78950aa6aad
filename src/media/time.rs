//! Exact rational time arithmetic
//!
//! Container timestamps are carried as exact rational milliseconds so that an
//! audio block of 1024 samples at 48 kHz (21.333... ms) accumulates no drift.
//! Conversion into a track's integer time base happens once, in the muxer.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};

/// Reduced fraction with a positive denominator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    num: i64,
    den: i64,
}

impl Rational {
    /// Build a reduced fraction. A zero denominator is clamped to 1.
    pub fn new(num: i64, den: i64) -> Self {
        if den == 0 {
            return Self { num, den: 1 };
        }
        let sign = if den < 0 { -1 } else { 1 };
        let g = gcd(num.unsigned_abs(), den.unsigned_abs()).max(1) as i64;
        Self {
            num: sign * num / g,
            den: sign * den / g,
        }
    }

    pub fn num(&self) -> i64 {
        self.num
    }

    pub fn den(&self) -> i64 {
        self.den
    }

    pub fn as_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    fn from_wide(num: i128, den: i128) -> Self {
        let sign = if den < 0 { -1 } else { 1 };
        let g = gcd_wide(num.unsigned_abs(), den.unsigned_abs()).max(1) as i128;
        let num = sign * num / g;
        let den = sign * den / g;
        Self {
            num: num.clamp(i64::MIN as i128, i64::MAX as i128) as i64,
            den: den.clamp(1, i64::MAX as i128) as i64,
        }
    }
}

impl Ord for Rational {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.num as i128 * other.den as i128;
        let rhs = other.num as i128 * self.den as i128;
        lhs.cmp(&rhs)
    }
}

impl PartialOrd for Rational {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add for Rational {
    type Output = Rational;

    fn add(self, rhs: Rational) -> Rational {
        let num = self.num as i128 * rhs.den as i128 + rhs.num as i128 * self.den as i128;
        let den = self.den as i128 * rhs.den as i128;
        Rational::from_wide(num, den)
    }
}

impl Sub for Rational {
    type Output = Rational;

    fn sub(self, rhs: Rational) -> Rational {
        self + Rational::new(-rhs.num, rhs.den)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Presentation time in exact rational milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Rational);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(Rational { num: 0, den: 1 });

    pub fn from_millis(ms: i64) -> Self {
        Self(Rational::new(ms, 1))
    }

    /// `num / den` milliseconds
    pub fn from_ratio(num: i64, den: i64) -> Self {
        Self(Rational::new(num, den))
    }

    /// `frame_index * 1000 / frame_rate`
    pub fn from_frame_index(frame_index: u64, frame_rate: u32) -> Self {
        Self(Rational::from_wide(
            frame_index as i128 * 1000,
            frame_rate.max(1) as i128,
        ))
    }

    /// `sample_count * 1000 / sample_rate`
    pub fn from_sample_count(sample_count: u64, sample_rate: u32) -> Self {
        Self(Rational::from_wide(
            sample_count as i128 * 1000,
            sample_rate.max(1) as i128,
        ))
    }

    pub fn as_rational(&self) -> Rational {
        self.0
    }

    pub fn as_millis_f64(&self) -> f64 {
        self.0.as_f64()
    }

    /// Convert into ticks of `time_base` seconds, rounding to nearest with
    /// ties away from zero.
    pub fn to_ticks(&self, time_base: Rational) -> i64 {
        // ticks = (num / den) ms / 1000 / (tb.num / tb.den)
        let num = self.0.num as i128 * time_base.den as i128;
        let den = self.0.den as i128 * 1000 * time_base.num.max(1) as i128;
        let ticks = div_round_nearest(num, den);
        ticks.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    /// Timestamp of `ticks` in `time_base` seconds
    pub fn from_ticks(ticks: i64, time_base: Rational) -> Self {
        Self(Rational::from_wide(
            ticks as i128 * time_base.num as i128 * 1000,
            time_base.den as i128,
        ))
    }
}

impl Add for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Timestamp) -> Timestamp {
        Timestamp(self.0 + rhs.0)
    }
}

impl Sub for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Timestamp) -> Timestamp {
        Timestamp(self.0 - rhs.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}ms", self.as_millis_f64())
    }
}

fn div_round_nearest(num: i128, den: i128) -> i128 {
    let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
    if num >= 0 {
        (2 * num + den) / (2 * den)
    } else {
        -((-2 * num + den) / (2 * den))
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

fn gcd_wide(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

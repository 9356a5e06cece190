//! Integer micro-dollar amounts
//!
//! All spend arithmetic happens in micro-dollars (1e-6 USD) so that many
//! small increments never accumulate floating-point drift. USD floats only
//! appear at the edges: config caps, telemetry and webhook payloads.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MICROS_PER_USD: u64 = 1_000_000;

/// Non-negative amount of money in micro-dollars
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MicroUsd(u64);

impl MicroUsd {
    pub const ZERO: Self = Self(0);

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Convert a USD float, rounding to the nearest micro-dollar.
    ///
    /// Negative and non-finite inputs clamp to zero.
    pub fn from_usd(usd: f64) -> Self {
        if !usd.is_finite() || usd <= 0.0 {
            return Self::ZERO;
        }
        let micros = (usd * MICROS_PER_USD as f64).round();
        if micros >= u64::MAX as f64 {
            Self(u64::MAX)
        } else {
            Self(micros as u64)
        }
    }

    /// Convert an exact decimal USD amount, rounding to the nearest micro-dollar
    pub fn from_decimal_usd(usd: Decimal) -> Self {
        if usd <= Decimal::ZERO {
            return Self::ZERO;
        }
        let micros = (usd * Decimal::from(MICROS_PER_USD)).round();
        Self(micros.to_u64().unwrap_or(u64::MAX))
    }

    pub fn to_usd(self) -> f64 {
        self.0 as f64 / MICROS_PER_USD as f64
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Apply a signed micro-dollar delta, never going below zero
    pub fn apply_delta(self, delta: i128) -> Self {
        let next = i128::from(self.0).saturating_add(delta);
        if next <= 0 {
            Self::ZERO
        } else {
            Self(u64::try_from(next).unwrap_or(u64::MAX))
        }
    }

    /// Signed difference `self - other` in micro-dollars
    pub fn delta_from(self, other: Self) -> i128 {
        i128::from(self.0) - i128::from(other.0)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for MicroUsd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.6}", self.to_usd())
    }
}

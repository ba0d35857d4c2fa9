//! # Money Module
//!
//! Provides the `Money` type for order totals.
//!
//! ## Why Integer Money?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  THE FLOATING POINT PROBLEM                                             │
//! │                                                                         │
//! │  In floating point:                                                     │
//! │    0.1 + 0.2 = 0.30000000000000004  ❌ WRONG!                           │
//! │                                                                         │
//! │  OUR SOLUTION: Integer minor units                                      │
//! │    Prices travel as i64 minor units (15000 = 150.00) through the       │
//! │    sync queue, the wire and both stores. Nothing ever parses a float.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use tally_core::money::Money;
//!
//! let price = Money::from_minor(15000);
//! let line = price.multiply_quantity(3);
//! assert_eq!(line.minor(), 45000);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

// =============================================================================
// Money Type
// =============================================================================

/// A monetary value in the smallest currency unit.
///
/// Signed so that refunds and voids can be expressed as negative lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(i64);

impl Money {
    /// Creates a Money value from minor units.
    #[inline]
    pub const fn from_minor(minor: i64) -> Self {
        Money(minor)
    }

    /// Returns the value in minor units.
    #[inline]
    pub const fn minor(&self) -> i64 {
        self.0
    }

    /// Returns zero money value.
    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    /// Multiplies money by a quantity.
    ///
    /// ## User Workflow
    /// ```text
    /// Menu item: Latte 250.00
    /// Quantity: 2
    ///      │
    ///      ▼
    /// multiply_quantity(2) ← THIS FUNCTION
    ///      │
    ///      ▼
    /// Line Total: 500.00
    /// ```
    #[inline]
    pub const fn multiply_quantity(&self, qty: i64) -> Self {
        Money(self.0 * qty)
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

/// Two-decimal rendering for log lines; presentation formats on its own.
impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        write!(f, "{}{}.{:02}", sign, (self.0 / 100).abs(), (self.0 % 100).abs())
    }
}

impl Default for Money {
    fn default() -> Self {
        Money::zero()
    }
}

impl Add for Money {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), Add::add)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Money::from_minor(1099).to_string(), "10.99");
        assert_eq!(Money::from_minor(500).to_string(), "5.00");
        assert_eq!(Money::from_minor(-550).to_string(), "-5.50");
        assert_eq!(Money::zero().to_string(), "0.00");
    }

    #[test]
    fn test_sum_of_lines() {
        let total: Money = [1000, 250, -50].into_iter().map(Money::from_minor).sum();
        assert_eq!(total.minor(), 1200);
    }

    #[test]
    fn test_multiply_quantity() {
        let unit_price = Money::from_minor(299);
        assert_eq!(unit_price.multiply_quantity(3).minor(), 897);
    }
}

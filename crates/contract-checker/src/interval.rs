//! Unsigned 64-bit interval domain

use std::fmt;

use crate::semantics::{BinaryOp, Relation, Truth, ValueDomain};

/// Inclusive range `[min, max]` of unsigned 64-bit values; `min <= max` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    min: u64,
    max: u64,
}

impl Interval {
    pub const TOP: Interval = Interval {
        min: 0,
        max: u64::MAX,
    };

    /// Returns `None` if `min > max`.
    pub fn new(min: u64, max: u64) -> Option<Self> {
        (min <= max).then_some(Self { min, max })
    }

    pub fn constant(value: u64) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn is_top(&self) -> bool {
        *self == Self::TOP
    }

    pub fn as_constant(&self) -> Option<u64> {
        (self.min == self.max).then_some(self.min)
    }

    pub fn contains(&self, value: u64) -> bool {
        self.min <= value && value <= self.max
    }

    pub fn meet(&self, other: &Interval) -> Option<Interval> {
        Interval::new(self.min.max(other.min), self.max.min(other.max))
    }

    pub fn hull(&self, other: &Interval) -> Interval {
        Interval {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    fn is_disjoint(&self, other: &Interval) -> bool {
        self.max < other.min || other.max < self.min
    }

    /// Number of concrete values minus one.
    fn width(&self) -> u64 {
        self.max - self.min
    }

    fn add(&self, rhs: &Interval) -> Interval {
        let (lo, lo_wrapped) = self.min.overflowing_add(rhs.min);
        let (hi, hi_wrapped) = self.max.overflowing_add(rhs.max);
        // Both ends wrapping the same number of times keeps the order
        if lo_wrapped == hi_wrapped {
            Interval { min: lo, max: hi }
        } else {
            Interval::TOP
        }
    }

    fn sub(&self, rhs: &Interval) -> Interval {
        let (lo, lo_wrapped) = self.min.overflowing_sub(rhs.max);
        let (hi, hi_wrapped) = self.max.overflowing_sub(rhs.min);
        if lo_wrapped == hi_wrapped {
            Interval { min: lo, max: hi }
        } else {
            Interval::TOP
        }
    }

    fn mul(&self, rhs: &Interval) -> Interval {
        match (self.min.checked_mul(rhs.min), self.max.checked_mul(rhs.max)) {
            (Some(min), Some(max)) => Interval { min, max },
            _ => Interval::TOP,
        }
    }

    /// Smallest all-ones mask covering every value of both operands.
    fn covering_mask(&self, rhs: &Interval) -> u64 {
        let high = self.max.max(rhs.max);
        match high.checked_next_power_of_two() {
            Some(p) if p != high => p - 1,
            Some(p) => p.checked_mul(2).map_or(u64::MAX, |q| q - 1),
            None => u64::MAX,
        }
    }

    fn bitwise(&self, op: BinaryOp, rhs: &Interval) -> Interval {
        if let (Some(a), Some(b)) = (self.as_constant(), rhs.as_constant()) {
            let value = match op {
                BinaryOp::And => a & b,
                BinaryOp::Or => a | b,
                _ => a ^ b,
            };
            return Interval::constant(value);
        }
        match op {
            BinaryOp::And => Interval {
                min: 0,
                max: self.max.min(rhs.max),
            },
            BinaryOp::Or => Interval {
                min: self.min.max(rhs.min),
                max: self.covering_mask(rhs),
            },
            _ => Interval {
                min: 0,
                max: self.covering_mask(rhs),
            },
        }
    }

    fn shift(&self, op: BinaryOp, rhs: &Interval) -> Interval {
        let Some(amount) = rhs.as_constant() else {
            return match op {
                BinaryOp::Shr => Interval {
                    min: 0,
                    max: self.max,
                },
                _ => Interval::TOP,
            };
        };
        if amount >= 64 {
            return Interval::constant(0);
        }
        match op {
            BinaryOp::Shr => Interval {
                min: self.min >> amount,
                max: self.max >> amount,
            },
            _ if u64::from(self.max.leading_zeros()) >= amount => Interval {
                min: self.min << amount,
                max: self.max << amount,
            },
            _ => Interval::TOP,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_constant() {
            Some(value) => write!(f, "{}", value),
            None if self.is_top() => f.write_str("T"),
            None => write!(f, "[{}, {}]", self.min, self.max),
        }
    }
}

/// Interval abstraction of machine words.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalDomain;

impl ValueDomain for IntervalDomain {
    type Value = Interval;

    fn name(&self) -> &'static str {
        "interval"
    }

    fn top(&self) -> Interval {
        Interval::TOP
    }

    fn constant(&self, value: u64) -> Interval {
        Interval::constant(value)
    }

    fn range(&self, min: u64, max: u64) -> Interval {
        Interval::new(min.min(max), max.max(min)).unwrap_or(Interval::TOP)
    }

    fn arithmetic(&self, op: BinaryOp, lhs: &Interval, rhs: &Interval) -> Interval {
        match op {
            BinaryOp::Add => lhs.add(rhs),
            BinaryOp::Sub => lhs.sub(rhs),
            BinaryOp::Mul => lhs.mul(rhs),
            BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => lhs.bitwise(op, rhs),
            BinaryOp::Shl | BinaryOp::Shr => lhs.shift(op, rhs),
        }
    }

    fn compare(&self, relation: Relation, lhs: &Interval, rhs: &Interval) -> Truth {
        let decide = |always: bool, never: bool| match (always, never) {
            (true, _) => Truth::True,
            (_, true) => Truth::False,
            _ => Truth::Unknown,
        };
        match relation {
            Relation::Eq => decide(
                lhs.as_constant().is_some() && lhs == rhs,
                lhs.is_disjoint(rhs),
            ),
            Relation::Ne => decide(
                lhs.is_disjoint(rhs),
                lhs.as_constant().is_some() && lhs == rhs,
            ),
            Relation::Lt => decide(lhs.max < rhs.min, lhs.min >= rhs.max),
            Relation::Le => decide(lhs.max <= rhs.min, lhs.min > rhs.max),
            Relation::Gt => decide(lhs.min > rhs.max, lhs.max <= rhs.min),
            Relation::Ge => decide(lhs.min >= rhs.max, lhs.max < rhs.min),
            Relation::In => decide(self.includes(rhs, lhs), lhs.is_disjoint(rhs)),
        }
    }

    fn refine(&self, relation: Relation, lhs: &Interval, rhs: &Interval) -> Option<Interval> {
        match relation {
            Relation::Eq | Relation::In => lhs.meet(rhs),
            Relation::Ne => match rhs.as_constant() {
                Some(value) if lhs.as_constant() == Some(value) => None,
                Some(value) if lhs.min == value => Interval::new(value + 1, lhs.max),
                Some(value) if lhs.max == value => Interval::new(lhs.min, value - 1),
                _ => Some(*lhs),
            },
            Relation::Lt => {
                let bound = rhs.max.checked_sub(1)?;
                Interval::new(lhs.min, lhs.max.min(bound))
            }
            Relation::Le => Interval::new(lhs.min, lhs.max.min(rhs.max)),
            Relation::Gt => {
                let bound = rhs.min.checked_add(1)?;
                Interval::new(lhs.min.max(bound), lhs.max)
            }
            Relation::Ge => Interval::new(lhs.min.max(rhs.min), lhs.max),
        }
    }

    fn join(&self, lhs: &Interval, rhs: &Interval) -> Interval {
        lhs.hull(rhs)
    }

    fn includes(&self, outer: &Interval, inner: &Interval) -> bool {
        outer.min <= inner.min && inner.max <= outer.max
    }

    fn as_constant(&self, value: &Interval) -> Option<u64> {
        value.as_constant()
    }

    fn enumerate(&self, value: &Interval, limit: usize) -> Option<Vec<u64>> {
        let count = usize::try_from(value.width()).ok()?.checked_add(1)?;
        (count <= limit).then(|| (value.min..=value.max).collect())
    }
}

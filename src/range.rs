//! Ordered set of integer intervals, used to report in which slices an
//! entry's data lands.

use crate::bigint::Bigint;
use std::fmt;

/// Set of closed intervals kept sorted and coalesced.
#[derive(Clone, Debug, Default)]
pub struct Range {
    segments: Vec<(Bigint, Bigint)>,
}

impl Range {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a single value to the set.
    pub fn add(&mut self, value: Bigint) {
        self.add_interval(value.clone(), value);
    }

    /// Adds the closed interval `[low, high]` to the set.
    pub fn add_interval(&mut self, low: Bigint, high: Bigint) {
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        self.segments.push((low, high));
        self.normalize();
    }

    /// Tells whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    fn normalize(&mut self) {
        self.segments.sort_by(|a, b| a.0.cmp(&b.0));
        let mut merged: Vec<(Bigint, Bigint)> = Vec::with_capacity(self.segments.len());
        for (low, high) in self.segments.drain(..) {
            match merged.last_mut() {
                // coalesce touching and overlapping segments
                Some(last) if low <= &last.1 + &Bigint::from(1u64) => {
                    if high > last.1 {
                        last.1 = high;
                    }
                }
                _ => merged.push((low, high)),
            }
        }
        self.segments = merged;
    }
}

impl fmt::Display for Range {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (low, high) in &self.segments {
            if !first {
                write!(fmt, ",")?;
            }
            first = false;
            if low == high {
                write!(fmt, "{low}")?;
            } else {
                write!(fmt, "{low}-{high}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalescing() {
        let mut r = Range::new();
        r.add(Bigint::from(3u64));
        r.add(Bigint::from(1u64));
        r.add(Bigint::from(2u64));
        r.add(Bigint::from(7u64));
        assert_eq!(r.to_string(), "1-3,7");
        r.add_interval(Bigint::from(4u64), Bigint::from(6u64));
        assert_eq!(r.to_string(), "1-7");
    }
}

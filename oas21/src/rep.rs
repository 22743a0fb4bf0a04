//!
//! # Oasis Repetition Model
//!
//! A [Repetition] describes the displacement sequence of an array of
//! identically-shaped objects: either a regular two-dimensional lattice or an
//! explicit, irregular list of displacements. Repetitions are value types,
//! cloned freely, and serve double duty as the writer's modal deduplication
//! key: two structurally-equal repetitions encode as a single wire entry plus
//! a "reuse previous" marker.
//!
//! The twelve wire forms (repetition types 0 through 11) all expand into one
//! of the two in-memory variants; encoding picks the cheapest applicable form.
//!

// Crates.io
use serde::{Deserialize, Serialize};

// Local Imports
use crate::data::OasVector;

///
/// # Oasis Repetition
///
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum Repetition {
    /// A regular lattice: positions `i*a + j*b` for `i in [0, n)`, `j in [0, m)`.
    /// Degenerates to a single point when `n == m == 1`.
    Regular {
        a: OasVector,
        b: OasVector,
        n: u64,
        m: u64,
    },
    /// An ordered list of displacements from the origin.
    /// The origin itself is implicit; `size()` is the list length plus one.
    Irregular(Vec<OasVector>),
}
impl Default for Repetition {
    /// The singular repetition: one position, at the origin
    fn default() -> Self {
        Self::row(OasVector::zero(), 1)
    }
}
impl Repetition {
    /// Create a single-axis row repetition: `n` positions spaced by `a`
    pub fn row(a: OasVector, n: u64) -> Self {
        Self::Regular {
            a,
            b: OasVector::zero(),
            n,
            m: 1,
        }
    }
    /// Regular-lattice accessor. Returns `(a, b, n, m)` for regular repetitions.
    pub fn is_regular(&self) -> Option<(OasVector, OasVector, u64, u64)> {
        match self {
            Self::Regular { a, b, n, m } => Some((*a, *b, *n, *m)),
            Self::Irregular(_) => None,
        }
    }
    /// Irregular-list accessor. Returns the explicit displacements,
    /// excluding the implicit origin.
    pub fn is_irregular(&self) -> Option<&[OasVector]> {
        match self {
            Self::Regular { .. } => None,
            Self::Irregular(pts) => Some(pts),
        }
    }
    /// Total number of positions, always at least one.
    /// Saturates rather than wrapping on absurd lattice dimensions.
    pub fn size(&self) -> usize {
        match self {
            Self::Regular { n, m, .. } => {
                let n = usize::try_from(*n).unwrap_or(usize::MAX);
                let m = usize::try_from(*m).unwrap_or(usize::MAX);
                n.saturating_mul(m)
            }
            Self::Irregular(pts) => pts.len() + 1,
        }
    }
    /// Iterate over all displacements, the origin first.
    /// Finite, and restartable by calling `iterate` again.
    pub fn iterate(&self) -> RepIter {
        RepIter { rep: self, idx: 0 }
    }
}

/// # Repetition Iterator
///
/// Yields each displacement of a [Repetition] in order, beginning with the
/// zero vector. Borrows the repetition for its lifetime.
pub struct RepIter<'r> {
    rep: &'r Repetition,
    idx: usize,
}
impl<'r> Iterator for RepIter<'r> {
    type Item = OasVector;
    fn next(&mut self) -> Option<OasVector> {
        match self.rep {
            Repetition::Regular { a, b, n, .. } => {
                let n = usize::try_from(*n).unwrap_or(usize::MAX);
                if self.idx >= self.rep.size() {
                    return None;
                }
                let i = (self.idx % n) as i64;
                let j = (self.idx / n) as i64;
                self.idx += 1;
                Some(a.scaled(i) + b.scaled(j))
            }
            Repetition::Irregular(pts) => {
                if self.idx > pts.len() {
                    return None;
                }
                let v = if self.idx == 0 {
                    OasVector::zero()
                } else {
                    pts[self.idx - 1]
                };
                self.idx += 1;
                Some(v)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::OasPoint;

    #[test]
    fn regular_lattice_iterates() {
        let rep = Repetition::Regular {
            a: OasPoint::new(10, 0),
            b: OasPoint::new(0, 5),
            n: 3,
            m: 2,
        };
        assert_eq!(rep.size(), 6);
        let pts: Vec<_> = rep.iterate().collect();
        assert_eq!(pts.len(), 6);
        assert_eq!(pts[0], OasPoint::zero());
        assert_eq!(pts[1], OasPoint::new(10, 0));
        assert_eq!(pts[3], OasPoint::new(0, 5));
        assert_eq!(pts[5], OasPoint::new(20, 5));
        // Restartable: a second call yields the same sequence
        assert_eq!(rep.iterate().collect::<Vec<_>>(), pts);
    }
    #[test]
    fn singular_lattice_is_one_point() {
        let rep = Repetition::Regular {
            a: OasPoint::new(10, 0),
            b: OasPoint::new(0, 5),
            n: 1,
            m: 1,
        };
        assert_eq!(rep.size(), 1);
        assert_eq!(rep.iterate().collect::<Vec<_>>(), vec![OasPoint::zero()]);
    }
    #[test]
    fn oversized_lattice_saturates() {
        let rep = Repetition::Regular {
            a: OasPoint::new(1, 0),
            b: OasPoint::new(0, 1),
            n: u64::MAX,
            m: u64::MAX,
        };
        assert_eq!(rep.size(), usize::MAX);
        assert_eq!(rep.iterate().next(), Some(OasPoint::zero()));
    }
    #[test]
    fn irregular_yields_origin_first() {
        let rep = Repetition::Irregular(vec![OasPoint::new(3, 4), OasPoint::new(-1, 7)]);
        assert_eq!(rep.size(), 3);
        let pts: Vec<_> = rep.iterate().collect();
        assert_eq!(
            pts,
            vec![OasPoint::zero(), OasPoint::new(3, 4), OasPoint::new(-1, 7)]
        );
    }
}

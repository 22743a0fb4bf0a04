//!
//! # Shape & Instance Compression
//!
//! The writer-side pass that turns runs of identically-shaped objects into
//! [Repetition]s. Objects are bucketed by a caller-supplied structural key,
//! i.e. the object with its position stripped, and each bucket's ordered
//! displacement list is searched for regular lattices at a selectable
//! thoroughness level:
//!
//! * level 0 never groups; every displacement is emitted singular;
//! * level 1 tries only the nearest following displacement as a lattice
//!   vector, one cheap pass;
//! * level N tries the N nearest following displacements as candidates, and
//!   additionally attempts a second lattice vector for 2D grids.
//!
//! Grouping is deterministic for a fixed input order and level: candidates
//! are generated in insertion order and ties keep the first candidate found.
//!

// Std-Lib Imports
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

// Local Imports
use crate::data::{OasError, OasResult, OasVector};
use crate::rep::Repetition;

/// A compressed group: the base displacement plus an optional [Repetition]
/// covering every member relative to that base.
pub type Group = (OasVector, Option<Repetition>);

/// Caller-supplied cancellation poll, checked between buckets
pub type CancelFn<'f> = &'f dyn Fn() -> bool;

///
/// # Shape Compressor
///
/// One instance per structural kind the writer emits. Buckets preserve
/// insertion order; [Compressor::flush] converts each into groups and
/// discards the instance.
///
pub struct Compressor<K: Eq + Hash + Clone> {
    /// Search thoroughness
    level: u8,
    /// Bucket keys, in first-seen order
    keys: Vec<K>,
    /// Key-to-bucket index
    index: HashMap<K, usize>,
    /// Displacement lists, parallel to `keys`
    buckets: Vec<Vec<OasVector>>,
}
impl<K: Eq + Hash + Clone> Compressor<K> {
    /// Create a new, empty compressor at thoroughness `level`
    pub fn new(level: u8) -> Self {
        Self {
            level,
            keys: Vec::new(),
            index: HashMap::new(),
            buckets: Vec::new(),
        }
    }
    /// Append `displacement` to the bucket for `key`
    pub fn add(&mut self, key: K, displacement: OasVector) {
        let idx = match self.index.get(&key) {
            Some(idx) => *idx,
            None => {
                let idx = self.buckets.len();
                self.keys.push(key.clone());
                self.index.insert(key, idx);
                self.buckets.push(Vec::new());
                idx
            }
        };
        self.buckets[idx].push(displacement);
    }
    /// Convert every bucket into its groups, in first-seen key order.
    /// Polls `cancel` between buckets.
    pub fn flush(self, cancel: Option<CancelFn>) -> OasResult<Vec<(K, Vec<Group>)>> {
        let mut out = Vec::with_capacity(self.keys.len());
        for (key, bucket) in self.keys.into_iter().zip(self.buckets.into_iter()) {
            if let Some(cancel) = cancel {
                if cancel() {
                    return Err(OasError::Cancelled);
                }
            }
            let mut groups = Vec::new();
            flush_bucket(&bucket, self.level, &mut groups);
            out.push((key, groups));
        }
        Ok(out)
    }
}

/// Convert one bucket's ordered displacement list into [Group]s
fn flush_bucket(points: &[OasVector], level: u8, out: &mut Vec<Group>) {
    if level == 0 || points.len() < 2 {
        out.extend(points.iter().map(|p| (*p, None)));
        return;
    }
    // Unused indices per coordinate, consumed front-first to keep
    // emission order stable
    let mut avail: HashMap<OasVector, VecDeque<usize>> = HashMap::new();
    for (i, p) in points.iter().enumerate() {
        avail.entry(*p).or_default().push_back(i);
    }
    let mut used = vec![false; points.len()];
    let present = |avail: &HashMap<OasVector, VecDeque<usize>>, q: &OasVector| {
        avail.get(q).map(|d| !d.is_empty()).unwrap_or(false)
    };
    let consume = |avail: &mut HashMap<OasVector, VecDeque<usize>>,
                   used: &mut Vec<bool>,
                   q: &OasVector| {
        if let Some(deque) = avail.get_mut(q) {
            if let Some(idx) = deque.pop_front() {
                used[idx] = true;
            }
        }
    };
    for start in 0..points.len() {
        if used[start] {
            continue;
        }
        let p0 = points[start];
        // Candidate lattice vectors: the `level` nearest-in-order distinct
        // displacements following p0
        let mut candidates: Vec<OasVector> = Vec::new();
        for j in start + 1..points.len() {
            if candidates.len() >= usize::from(level) {
                break;
            }
            if used[j] || points[j] == p0 {
                continue;
            }
            let v = points[j] - p0;
            if !candidates.contains(&v) {
                candidates.push(v);
            }
        }
        // Longest chain along any candidate; first-found wins ties
        let mut best: Option<(u64, OasVector)> = None;
        for v in &candidates {
            let mut k = 1u64;
            let mut q = p0 + *v;
            while present(&avail, &q) {
                k += 1;
                q += *v;
            }
            if k >= 2 && best.map(|(bk, _)| k > bk).unwrap_or(true) {
                best = Some((k, *v));
            }
        }
        let (n, v) = match best {
            Some(b) => b,
            None => {
                consume(&mut avail, &mut used, &p0);
                out.push((p0, None));
                continue;
            }
        };
        // Above level 1, try extending the chain into a 2D grid along a
        // second candidate vector
        let mut grid: Option<(u64, OasVector)> = None;
        if level >= 2 {
            for w in candidates.iter().filter(|w| **w != v) {
                let mut m = 1u64;
                'rows: loop {
                    let row_base = p0 + w.scaled(m as i64);
                    for i in 0..n {
                        if !present(&avail, &(row_base + v.scaled(i as i64))) {
                            break 'rows;
                        }
                    }
                    m += 1;
                }
                if m >= 2 {
                    grid = Some((m, *w));
                    break;
                }
            }
        }
        let rep = match grid {
            Some((m, w)) => {
                for j in 0..m {
                    for i in 0..n {
                        let q = p0 + v.scaled(i as i64) + w.scaled(j as i64);
                        consume(&mut avail, &mut used, &q);
                    }
                }
                Repetition::Regular {
                    a: v,
                    b: w,
                    n,
                    m,
                }
            }
            None => {
                for i in 0..n {
                    consume(&mut avail, &mut used, &(p0 + v.scaled(i as i64)));
                }
                Repetition::row(v, n)
            }
        };
        out.push((p0, Some(rep)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::OasPoint;

    fn pt(x: i64, y: i64) -> OasVector {
        OasPoint::new(x, y)
    }
    fn total_groups(flushed: &[(&str, Vec<Group>)]) -> usize {
        flushed.iter().map(|(_, g)| g.len()).sum()
    }

    #[test]
    fn level_zero_never_groups() {
        let mut comp = Compressor::new(0);
        for y in [0, 10, 20] {
            comp.add("box", pt(0, y));
        }
        let flushed = comp.flush(None).unwrap();
        assert_eq!(total_groups(&flushed), 3);
        assert!(flushed[0].1.iter().all(|(_, rep)| rep.is_none()));
    }
    #[test]
    fn three_boxes_become_one_row() {
        let mut comp = Compressor::new(1);
        for y in [0, 10, 20] {
            comp.add("box", pt(0, y));
        }
        let flushed = comp.flush(None).unwrap();
        assert_eq!(flushed.len(), 1);
        let groups = &flushed[0].1;
        assert_eq!(groups.len(), 1);
        let (base, rep) = &groups[0];
        assert_eq!(*base, pt(0, 0));
        assert_eq!(rep.as_ref().unwrap().size(), 3);
        let (a, _, n, m) = rep.as_ref().unwrap().is_regular().unwrap();
        assert_eq!((a, n, m), (pt(0, 10), 3, 1));
    }
    #[test]
    fn irregular_leftover_stays_singular() {
        let mut comp = Compressor::new(1);
        for y in [0, 10, 20, 35] {
            comp.add("box", pt(0, y));
        }
        let flushed = comp.flush(None).unwrap();
        let groups = &flushed[0].1;
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].1.as_ref().unwrap().size(), 3);
        assert_eq!(groups[1], (pt(0, 35), None));
    }
    #[test]
    fn deeper_search_finds_the_grid() {
        // 2 columns x 3 rows, row-major insertion order
        let grid: Vec<OasVector> = (0..3)
            .flat_map(|j| (0..2).map(move |i| pt(10 * i, 5 * j)))
            .collect();
        let mut one = Compressor::new(1);
        let mut two = Compressor::new(2);
        for p in &grid {
            one.add("via", *p);
            two.add("via", *p);
        }
        let one = one.flush(None).unwrap();
        let two = two.flush(None).unwrap();
        // Level 2 covers the grid in a single lattice
        assert_eq!(two[0].1.len(), 1);
        let (_, rep) = &two[0].1[0];
        assert_eq!(rep.as_ref().unwrap().size(), 6);
        // And never emits more groups than the shallower search
        assert!(total_groups(&two) <= total_groups(&one));
    }
    #[test]
    fn grouping_is_deterministic() {
        let pts = [pt(0, 0), pt(7, 3), pt(0, 10), pt(14, 6), pt(0, 20), pt(3, 1)];
        let run = || {
            let mut comp = Compressor::new(2);
            for p in &pts {
                comp.add("shape", *p);
            }
            comp.flush(None).unwrap()
        };
        assert_eq!(run(), run());
    }
    #[test]
    fn cancellation_aborts_the_flush() {
        let mut comp = Compressor::new(1);
        comp.add("box", pt(0, 0));
        let cancel = || true;
        assert!(matches!(
            comp.flush(Some(&cancel)),
            Err(OasError::Cancelled)
        ));
    }
    #[test]
    fn buckets_are_keyed_structurally() {
        let mut comp = Compressor::new(1);
        comp.add("box-a", pt(0, 0));
        comp.add("box-b", pt(0, 10));
        comp.add("box-a", pt(0, 10));
        comp.add("box-a", pt(0, 20));
        let flushed = comp.flush(None).unwrap();
        assert_eq!(flushed.len(), 2);
        // box-a's three points group; box-b's lone point stays singular
        assert_eq!(flushed[0].0, "box-a");
        assert_eq!(flushed[0].1.len(), 1);
        assert_eq!(flushed[1].1, vec![(pt(0, 10), None)]);
    }
}

//! The distributed point array.
//!
//! Conceptually the build operates on one global array of 3-d points,
//! the concatenation of every process's local points in rank order.
//! [`GlobalIndexing`] maps a global index to its owning process;
//! [`PointBuffer`] holds this process's slice twice over, so a partition
//! step can write its redistributed points into the *next* array while
//! reading from *current*, then swap the two in O(1).

use crate::comm::{Communicator, SubGroup};
use crate::constants::TAG_INDEX_LISTS;
use crate::geometry::{BoundingBox, Point};

/// Per-process extents of the global index space.
pub struct GlobalIndexing {
    start: Vec<i64>,
    end: Vec<i64>,
    count: Vec<i64>,
    total: i64,
}

impl GlobalIndexing {
    /// Gather every process's point count and broadcast the directory, so
    /// that each process can resolve any global index.
    pub fn build<C: Communicator>(local_count: i64, comm: &C) -> Self {
        let world = SubGroup::new(comm, 0, comm.size() - 1, TAG_INDEX_LISTS);

        let mut counts = vec![0_i64; comm.size()];
        world.all_gather(&[local_count], &mut counts);

        Self::from_counts(&counts)
    }

    /// Build the directory from already known per-process counts.
    pub fn from_counts(counts: &[i64]) -> Self {
        let mut start = Vec::with_capacity(counts.len());
        let mut end = Vec::with_capacity(counts.len());

        let mut total = 0_i64;
        for &count in counts {
            debug_assert!(count >= 0);
            start.push(total);
            end.push(total + count - 1);
            total += count;
        }

        Self {
            start,
            end,
            count: counts.to_vec(),
            total,
        }
    }

    /// Total number of points in the global array.
    pub fn total(&self) -> i64 {
        self.total
    }

    /// First global index owned by process `p`.
    pub fn start(&self, p: usize) -> i64 {
        self.start[p]
    }

    /// Last global index owned by process `p`; one less than `start` for a
    /// process without points.
    pub fn end(&self, p: usize) -> i64 {
        self.end[p]
    }

    /// Number of points owned by process `p`.
    pub fn count(&self, p: usize) -> i64 {
        self.count[p]
    }

    /// The process owning global index `g`, by bisection of the start
    /// offsets. `None` if `g` is outside the global array.
    pub fn owner(&self, g: i64) -> Option<usize> {
        if g < 0 || g >= self.total {
            return None;
        }

        // Last process whose range starts at or before g. Processes without
        // points share their start offset with a non-empty successor, so
        // the last match is the owner.
        let p = self.start.partition_point(|&s| s <= g) - 1;
        debug_assert!(self.count[p] > 0 && g <= self.end[p]);
        Some(p)
    }
}

/// This process's slice of the global point array, double buffered.
pub struct PointBuffer {
    start: i64,
    end: i64,
    current: Vec<f32>,
    next: Vec<f32>,
}

impl PointBuffer {
    /// Copy the local points into a fresh double buffer. `start` is the
    /// global index of the first local point.
    pub fn new(points: &[Point], start: i64) -> Self {
        let current = Point::to_flat(points).to_vec();
        let next = vec![0.0_f32; current.len()];

        Self {
            start,
            end: start + points.len() as i64 - 1,
            current,
            next,
        }
    }

    /// True if global index `g` lives in this buffer.
    pub fn owns(&self, g: i64) -> bool {
        g >= self.start && g <= self.end
    }

    fn offset(&self, g: i64) -> usize {
        debug_assert!(self.owns(g));
        ((g - self.start) * 3) as usize
    }

    /// Coordinate along `dim` of the point at global index `g`.
    pub fn value(&self, g: i64, dim: usize) -> f32 {
        self.current[self.offset(g) + dim]
    }

    /// The point at global index `g`.
    pub fn triple(&self, g: i64) -> [f32; 3] {
        let at = self.offset(g);
        [self.current[at], self.current[at + 1], self.current[at + 2]]
    }

    /// Overwrite the point at global index `g`.
    pub fn set_triple(&mut self, g: i64, value: [f32; 3]) {
        let at = self.offset(g);
        self.current[at..at + 3].copy_from_slice(&value);
    }

    /// Swap the two local points at global indices `g1` and `g2`.
    pub fn exchange_local(&mut self, g1: i64, g2: i64) {
        let tmp = self.triple(g1);
        let other = self.triple(g2);
        self.set_triple(g1, other);
        self.set_triple(g2, tmp);
    }

    /// Swap the points at `g1` and `g2` where one of them may live on a
    /// remote process. Both owners must call this with the same arguments;
    /// processes owning neither index must not call it.
    pub fn exchange_global<C: Communicator>(
        &mut self,
        comm: &C,
        g1: i64,
        g2: i64,
        owner1: usize,
        owner2: usize,
        tag: i32,
    ) {
        let me = comm.rank();

        if owner1 == me && owner2 == me {
            self.exchange_local(g1, g2);
        } else if owner1 == me {
            let mine = self.triple(g1);
            comm.send(&mine, owner2, tag);
            let mut theirs = [0.0_f32; 3];
            comm.receive(&mut theirs, owner2, tag);
            self.set_triple(g1, theirs);
        } else if owner2 == me {
            let mine = self.triple(g2);
            let mut theirs = [0.0_f32; 3];
            comm.receive(&mut theirs, owner1, tag);
            comm.send(&mine, owner1, tag);
            self.set_triple(g2, theirs);
        }
    }

    /// A run of `npoints` contiguous points of the current array starting
    /// at global index `g`.
    pub fn current_run(&self, g: i64, npoints: i64) -> &[f32] {
        let at = self.offset(g);
        &self.current[at..at + (npoints * 3) as usize]
    }

    /// The matching writable run of the next array.
    pub fn next_run_mut(&mut self, g: i64, npoints: i64) -> &mut [f32] {
        let at = self.offset(g);
        &mut self.next[at..at + (npoints * 3) as usize]
    }

    /// Copy a run of points from the current into the next array, both
    /// local.
    pub fn transfer_local(&mut self, from: i64, to: i64, npoints: i64) {
        let src = self.offset(from);
        let dst = self.offset(to);
        let n = (npoints * 3) as usize;
        self.next[dst..dst + n].copy_from_slice(&self.current[src..src + n]);
    }

    /// Copy the whole current array into the next array, preserving the
    /// portions a partition step does not touch.
    pub fn copy_current_to_next(&mut self) {
        self.next.copy_from_slice(&self.current);
    }

    /// Make the next array current without copying.
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.current, &mut self.next);
    }

    /// Per-axis minimum and maximum over the local points with global
    /// indices in `[l, r]`.
    ///
    /// A process whose range misses `[l, r]` entirely contributes inverted
    /// extremes taken from `fallback` (the root region), which are the
    /// identity of the min/max reductions this feeds.
    pub fn local_min_max(&self, l: i64, r: i64, fallback: &BoundingBox) -> ([f32; 3], [f32; 3]) {
        let from = l.max(self.start);
        let to = r.min(self.end);

        if from > to {
            let mut min = [0.0_f32; 3];
            let mut max = [0.0_f32; 3];
            for d in 0..3 {
                min[d] = fallback.max(d) as f32;
                max[d] = fallback.min(d) as f32;
            }
            return (min, max);
        }

        let mut min = self.triple(from);
        let mut max = min;

        for g in from + 1..=to {
            let v = self.triple(g);
            for d in 0..3 {
                if v[d] < min[d] {
                    min[d] = v[d];
                } else if v[d] > max[d] {
                    max[d] = v[d];
                }
            }
        }

        (min, max)
    }
}

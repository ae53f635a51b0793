//! Parallel construction of the region tree.
//!
//! The build is bulk synchronous: every process walks the same queue of
//! pending regions, and the contiguous group of processes owning a
//! region's index range forms a sub-group that selects the median,
//! redistributes the points around it and computes the child bounds.
//! Processes outside the group skip the region and catch up during tree
//! completion.

use std::collections::VecDeque;

use crate::buffer::{GlobalIndexing, PointBuffer};
use crate::comm::{Communicator, SubGroup};
use crate::constants::{ALL_DIRECTIONS, NDIM, NO_DIM, TAG_PARAMETERS, TAG_ROOT_DIVISION};
use crate::geometry::{BoundingBox, Point};
use crate::timing::Timing;
use crate::tree::{KdNode, KdTree};
use crate::types::{BuildConfig, Error};

impl KdTree {
    /// Collectively build the tree over the distributed point set.
    ///
    /// `points` is this process's share of the global array; it is copied
    /// into a working buffer and left untouched. `volume` optionally fixes
    /// the root bounds (it must contain every point); by default the
    /// global point bounds are used. Every process must call `build` with
    /// the same tunables; rank 0's win otherwise.
    pub fn build<C: Communicator>(
        points: &[Point],
        volume: Option<BoundingBox>,
        config: &BuildConfig,
        comm: &C,
    ) -> Result<KdTree, Error> {
        let config = check_parameters(config, comm)?;
        let timing = Timing::new(config.timing);
        let build_scope = timing.scope("build tree");

        let volume = volume_bounds(points, volume, comm)?;

        let dir = GlobalIndexing::build(points.len() as i64, comm);
        if dir.total() == 0 {
            return Err(Error::DegenerateVolume);
        }

        let buffer = PointBuffer::new(points, dir.start(comm.rank()));

        let tree = KdTree {
            nodes: Vec::new(),
            root: 0,
            region_nodes: Vec::new(),
            num_processes: comm.size(),
            my_rank: comm.rank(),
            total_points: dir.total(),
            assignment: config.assignment,
            region_to_process: Vec::new(),
            process_to_regions: Vec::new(),
            data_location: Vec::new(),
            process_list: Vec::new(),
            cell_count_list: Vec::new(),
            parallel_region_list: Vec::new(),
        };

        let mut ctx = BuildContext {
            comm,
            config,
            dir,
            buffer,
            volume,
            tree,
            timing,
        };

        ctx.breadth_first_divide();
        ctx.complete_tree();

        let mut tree = ctx.into_tree();
        tree.build_region_list();
        tree.update_region_assignment();
        tree.create_process_data_tables(points, comm)?;

        drop(build_scope);
        Ok(tree)
    }
}

/// Broadcast rank 0's tunables and adopt them on disagreement, so that
/// every process builds with the same parameters.
fn check_parameters<C: Communicator>(config: &BuildConfig, comm: &C) -> Result<BuildConfig, Error> {
    let world = SubGroup::new(comm, 0, comm.size() - 1, TAG_PARAMETERS);

    let mine = config.encode();
    let mut params = mine;
    world.broadcast(&mut params, 0);

    let agreed = if params != mine {
        log::warn!(
            "(process {}) changing runtime parameters to match process 0",
            comm.rank()
        );
        BuildConfig::decode(&params)
    } else {
        config.clone()
    };

    if agreed.valid_directions & ALL_DIRECTIONS == 0 {
        return Err(Error::InvalidParameters("no valid split directions"));
    }

    Ok(agreed)
}

/// Compute the padded bounds of the whole volume, or fail on a degenerate
/// input.
fn volume_bounds<C: Communicator>(
    points: &[Point],
    user: Option<BoundingBox>,
    comm: &C,
) -> Result<BoundingBox, Error> {
    let world = SubGroup::new(comm, 0, comm.size() - 1, TAG_PARAMETERS);

    let local = user.or_else(|| BoundingBox::from_points(points));

    // One reduction gets both extremes: minimize the mins alongside the
    // negated maxes.
    let mut packed = [f64::MAX; 6];
    if let Some(bounds) = local {
        for d in 0..NDIM {
            packed[d] = bounds.min(d);
            packed[NDIM + d] = -bounds.max(d);
        }
    }
    let mut reduced = [0.0_f64; 6];
    world.all_reduce_min(&packed, &mut reduced);

    let min = [reduced[0], reduced[1], reduced[2]];
    let max = [-reduced[3], -reduced[4], -reduced[5]];

    if min[0] > max[0] {
        // No process contributed bounds at all.
        return Err(Error::DegenerateVolume);
    }

    let mut diff = [0.0_f64; 3];
    let mut a_little = 0.0_f64;
    for d in 0..NDIM {
        diff[d] = max[d] - min[d];
        a_little = a_little.max(diff[d]);
    }
    a_little /= 100.0;
    if a_little <= 0.0 {
        log::error!("(process {}) volume bounds: degenerate volume", comm.rank());
        return Err(Error::DegenerateVolume);
    }

    // Push flat axes out by a visible amount and the others by a hair, so
    // no point sits exactly on the outer boundary.
    let fudge = a_little * 10e-4;
    let mut bounds = BoundingBox::from_min_max(min, max);
    for d in 0..NDIM {
        if diff[d] <= 0.0 {
            bounds.set_min(d, min[d] - a_little);
            bounds.set_max(d, max[d] + a_little);
        } else {
            bounds.set_min(d, min[d] - fudge);
            bounds.set_max(d, max[d] + fudge);
        }
    }

    Ok(bounds)
}

/// Vote on a local failure flag: the sum of flags is broadcast back, so
/// either every process continues or every process abandons the phase.
pub(crate) fn all_check_for_failure<C: Communicator>(
    world: &SubGroup<'_, C>,
    local_fail: bool,
    phase: &'static str,
) -> Result<(), Error> {
    let mut vote = [0_i32];
    world.all_reduce_sum(&[local_fail as i32], &mut vote);

    if vote[0] != 0 {
        if local_fail {
            log::warn!("{phase} failed on this process");
        } else {
            log::warn!("{phase} failed on a remote process");
        }
        return Err(Error::RemoteFailure { phase });
    }
    Ok(())
}

/// Working state of one build, dropped when the tree is done.
pub(crate) struct BuildContext<'a, C: Communicator> {
    pub comm: &'a C,
    pub config: BuildConfig,
    pub dir: GlobalIndexing,
    pub buffer: PointBuffer,
    pub volume: BoundingBox,
    pub tree: KdTree,
    pub timing: Timing,
}

impl<'a, C: Communicator> BuildContext<'a, C> {
    pub fn into_tree(self) -> KdTree {
        self.tree
    }

    /// Divide regions in breadth-first order until every pending region
    /// refuses further division.
    pub fn breadth_first_divide(&mut self) {
        let _scope = self.timing.scope("breadth-first divide");

        let root = self.tree.push_node(KdNode::new(
            self.volume,
            self.volume,
            self.dir.total(),
        ));
        debug_assert_eq!(root, self.tree.root);

        let mut queue = VecDeque::new();
        queue.push_back((root, 0_i64, 0_usize, TAG_ROOT_DIVISION));

        while let Some((node, l, level, tag)) = queue.pop_front() {
            if let Some(midpt) = self.divide_region(node, l, level, tag) {
                let left = self.tree.node(node).left.unwrap();
                let right = self.tree.node(node).right.unwrap();
                queue.push_back((left, l, level + 1, tag << 1));
                queue.push_back((right, midpt, level + 1, (tag << 1) | 1));
            }
        }
    }

    /// True if a region of `num_points` points at `level` may be divided
    /// further under the configured limits.
    fn divide_test(&self, num_points: i64, level: usize) -> bool {
        if level >= self.config.max_level || level >= 62 {
            return false;
        }

        let min_cells = self.config.min_cells;
        if min_cells > 0 && min_cells > num_points / 2 {
            return false;
        }

        // Region counts assume balanced division, as the breadth-first
        // order produces.
        let nregions_now = 1_i64 << level;
        let nregions_next = nregions_now << 1;
        let or_less = self.config.number_of_regions_or_less;
        let or_more = self.config.number_of_regions_or_more;
        if or_less > 0 && nregions_next > or_less {
            return false;
        }
        if or_more > 0 && nregions_now >= or_more {
            return false;
        }

        true
    }

    /// The permitted dimension in which the node's data extends furthest.
    fn select_cut_direction(&self, node: usize) -> usize {
        let data_bounds = self.tree.node(node).data_bounds;

        let mut dim = NO_DIM;
        let mut largest = f64::NEG_INFINITY;
        for d in 0..NDIM {
            if self.config.valid_directions & (1 << d) == 0 {
                continue;
            }
            let extent = data_bounds.extent(d);
            if extent > largest {
                largest = extent;
                dim = d;
            }
        }
        dim
    }

    /// Divide one region at the median of its longest axis, creating its
    /// two children. Returns the global index of the first point of the
    /// right child, or `None` if the region stays a leaf on this process.
    fn divide_region(&mut self, node: usize, l: i64, level: usize, tag: i32) -> Option<i64> {
        let num_points = self.tree.node(node).num_points;
        if !self.divide_test(num_points, level) {
            return None;
        }

        let r = l + num_points - 1;

        if num_points < 2 {
            return self.divide_small_node(node, l, num_points);
        }

        let comm = self.comm;
        let me = comm.rank();
        let p1 = self.dir.owner(l).unwrap();
        let p2 = self.dir.owner(r).unwrap();

        if me < p1 || me > p2 {
            return None;
        }

        let sub = SubGroup::new(comm, p1, p2, tag);

        let maxdim = self.select_cut_direction(node);
        self.tree.node_mut(node).dim = maxdim;

        let mut midpt = self.select(&sub, maxdim, l, r);
        let mut used_dim = maxdim;

        if midpt < l + 1 {
            // No spread along the longest axis. Try the remaining
            // permitted dimensions in order.
            log::debug!(
                "could not divide along dimension {maxdim} in [{l}, {r}], midpt {midpt}"
            );
            let mut candidate: i64 = -1;
            'retry: while midpt < l + 1 {
                loop {
                    candidate += 1;
                    if candidate as usize >= NDIM {
                        // Coincident points. Split the index range in the
                        // middle so both subtrees are non-empty.
                        log::debug!("coincident points in [{l}, {r}]");
                        used_dim = maxdim;
                        self.tree.node_mut(node).dim = maxdim;
                        midpt = (l + r) / 2 + 1;
                        break 'retry;
                    }
                    if candidate as usize != maxdim
                        && self.config.valid_directions & (1 << candidate) != 0
                    {
                        break;
                    }
                }
                used_dim = candidate as usize;
                self.tree.node_mut(node).dim = used_dim;
                midpt = self.select(&sub, used_dim, l, r);
            }
        }

        let (lmin, lmax, rmin, rmax) = self.global_data_bounds(&sub, l, midpt, r);

        // Cut halfway between the sibling data boxes; the slab between
        // them puts any point exactly on the cut on one definite side.
        let coord = 0.5 * (lmax[used_dim] as f64 + rmin[used_dim] as f64);

        let parent_bounds = self.tree.node(node).bounds;
        let mut left_bounds = parent_bounds;
        left_bounds.set_max(used_dim, coord);
        let mut right_bounds = parent_bounds;
        right_bounds.set_min(used_dim, coord);

        let left = self.tree.push_node(KdNode::new(
            left_bounds,
            widen(lmin, lmax),
            midpt - l,
        ));
        let right = self.tree.push_node(KdNode::new(
            right_bounds,
            widen(rmin, rmax),
            r - midpt + 1,
        ));
        let parent = self.tree.node_mut(node);
        parent.left = Some(left);
        parent.right = Some(right);

        Some(midpt)
    }

    /// Division of a region with fewer than two points. Only the owner of
    /// the region's first index participates, so no collective is needed;
    /// the point (if any) goes to the left child.
    fn divide_small_node(&mut self, node: usize, l: i64, num_points: i64) -> Option<i64> {
        let owner = self.dir.owner(l)?;
        if owner != self.comm.rank() {
            return None;
        }

        let maxdim = self.select_cut_direction(node);
        self.tree.node_mut(node).dim = maxdim;

        let bounds = self.tree.node(node).bounds;
        let value = self.buffer.triple(l);

        let coord = if num_points > 0 {
            value[maxdim] as f64
        } else {
            0.5 * (bounds.min(maxdim) + bounds.max(maxdim))
        };

        let mut left_bounds = bounds;
        left_bounds.set_max(maxdim, coord);
        let mut right_bounds = bounds;
        right_bounds.set_min(maxdim, coord);

        // Data bounds sit tightly around the single point; an empty child
        // thus carries data bounds outside its own region, which nothing
        // downstream reads.
        let data_bounds = widen(value, value);

        let left = self
            .tree
            .push_node(KdNode::new(left_bounds, data_bounds, num_points));
        let right = self.tree.push_node(KdNode::new(right_bounds, data_bounds, 0));
        let parent = self.tree.node_mut(node);
        parent.left = Some(left);
        parent.right = Some(right);

        // Both children stay owned by this process, which is the only one
        // that did not cull this part of the tree.
        Some(l)
    }

    /// Tight global bounds of the candidate children `[l, k-1]` and
    /// `[k, r]`, reduced over the sub-group.
    fn global_data_bounds(
        &self,
        sub: &SubGroup<'a, C>,
        l: i64,
        k: i64,
        r: i64,
    ) -> ([f32; 3], [f32; 3], [f32; 3], [f32; 3]) {
        let fallback = self.tree.node(self.tree.root).bounds;

        let (left_min, left_max) = self.buffer.local_min_max(l, k - 1, &fallback);
        let (right_min, right_max) = self.buffer.local_min_max(k, r, &fallback);

        let mut lmin = [0.0_f32; 3];
        let mut lmax = [0.0_f32; 3];
        let mut rmin = [0.0_f32; 3];
        let mut rmax = [0.0_f32; 3];

        sub.all_reduce_min(&left_min, &mut lmin);
        sub.all_reduce_max(&left_max, &mut lmax);
        sub.all_reduce_min(&right_min, &mut rmin);
        sub.all_reduce_max(&right_max, &mut rmax);

        (lmin, lmax, rmin, rmax)
    }
}

fn widen(min: [f32; 3], max: [f32; 3]) -> BoundingBox {
    BoundingBox::from_min_max(
        [min[0] as f64, min[1] as f64, min[2] as f64],
        [max[0] as f64, max[1] as f64, max[2] as f64],
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::comm::local::run_cluster;
    use crate::types::RegionAssignment;

    #[test]
    fn test_volume_bounds_padding() {
        let bounds = run_cluster(2, |comm| {
            let points = if comm.rank() == 0 {
                vec![Point::new([0.0, 0.0, 0.0]), Point::new([4.0, 1.0, 0.0])]
            } else {
                vec![Point::new([2.0, 2.0, 0.0])]
            };
            volume_bounds(&points, None, &comm).unwrap()
        });

        for b in bounds {
            // Largest extent is 4, so flat z gets pushed out by 0.04 and
            // the other axes by 0.00004.
            assert!((b.min(2) - (-0.04)).abs() < 1e-12);
            assert!((b.max(2) - 0.04).abs() < 1e-12);
            assert!(b.min(0) < 0.0 && b.min(0) > -0.001);
            assert!(b.max(0) > 4.0 && b.max(0) < 4.001);
            assert!(b.contains(0.0, 0.0, 0.0));
            assert!(b.contains(4.0, 1.0, 0.0));
        }
    }

    #[test]
    fn test_volume_bounds_degenerate() {
        run_cluster(2, |comm| {
            let points = vec![Point::new([5.0, 5.0, 5.0]); 3];
            assert!(matches!(
                volume_bounds(&points, None, &comm),
                Err(Error::DegenerateVolume)
            ));

            // A caller-supplied degenerate box fails the same way.
            let flat = BoundingBox::new([5.0, 5.0, 5.0, 5.0, 5.0, 5.0]);
            assert!(matches!(
                volume_bounds(&points, Some(flat), &comm),
                Err(Error::DegenerateVolume)
            ));
        });
    }

    #[test]
    fn test_parameter_agreement() {
        let configs = run_cluster(2, |comm| {
            let mut config = BuildConfig::default();
            if comm.rank() == 1 {
                // Disagreeing tunables are overridden by rank 0's.
                config.min_cells = 7;
                config.assignment = RegionAssignment::RoundRobin;
            }
            check_parameters(&config, &comm).unwrap()
        });

        for config in configs {
            assert_eq!(config.min_cells, 100);
            assert_eq!(config.assignment, RegionAssignment::Contiguous);
        }
    }

    #[test]
    fn test_failure_vote() {
        let votes = run_cluster(3, |comm| {
            let world = SubGroup::new(&comm, 0, 2, 77);
            all_check_for_failure(&world, comm.rank() == 1, "unit test")
        });

        assert!(votes.iter().all(|v| v.is_err()));
    }
}

//! Region-to-process assignment and the data location tables.
//!
//! Assignment is a pure function of the finished tree and the process
//! count, so switching policies never touches the tree itself. The data
//! tables record which processes physically hold points of which regions;
//! they are built once per build, collectively, and are independent of
//! the assignment.

use std::fmt;

use itertools::Itertools;

use crate::build::all_check_for_failure;
use crate::comm::{Communicator, SubGroup};
use crate::constants::TAG_TABLES;
use crate::geometry::Point;
use crate::tree::KdTree;
use crate::types::{Error, RegionAssignment};

impl KdTree {
    /// Re-apply the configured assignment policy.
    pub(crate) fn update_region_assignment(&mut self) {
        match self.assignment {
            RegionAssignment::None => {
                self.region_to_process.clear();
                self.process_to_regions = vec![Vec::new(); self.num_processes];
            }
            RegionAssignment::Contiguous => self.assign_regions_contiguous(),
            RegionAssignment::RoundRobin => self.assign_regions_round_robin(),
            // The user's map arrives through assign_regions.
            RegionAssignment::UserDefined => {}
        }
    }

    /// Assign region `r` to process `r mod P`.
    pub fn assign_regions_round_robin(&mut self) {
        self.assignment = RegionAssignment::RoundRobin;
        self.fill_round_robin();
    }

    fn fill_round_robin(&mut self) {
        let nprocs = self.num_processes;
        self.region_to_process = (0..self.num_regions()).map(|r| r % nprocs).collect();
        self.build_region_lists_for_processes();
    }

    /// Assign whole subtrees to processes so each process receives a
    /// contiguous interval of region ids and spatially adjacent regions
    /// land on numerically adjacent processes.
    pub fn assign_regions_contiguous(&mut self) {
        self.assignment = RegionAssignment::Contiguous;

        let nprocs = self.num_processes;
        let nregions = self.num_regions();

        if nregions <= nprocs {
            // One region per process is already contiguous.
            self.fill_round_robin();
            return;
        }

        // Largest level with at most P subtrees.
        let mut floor_log = 0;
        while (nprocs >> (floor_log + 1)) > 0 {
            floor_log += 1;
        }
        let npow = 1_usize << floor_log;

        let subtrees = self.nodes_at_level(floor_log);
        self.region_to_process = vec![0; nregions];

        if nprocs == npow {
            for (proc, &node) in subtrees.iter().enumerate() {
                self.assign_subtree(node, proc);
            }
        } else {
            // P lies strictly between 2^floor_log and 2^(floor_log + 1).
            // Hand out whole subtrees until as many subtree halves remain
            // as processes, then split each remaining subtree in two.
            let mut halves_left = (npow << 1) as i64;
            let mut procs_left = nprocs as i64;
            let mut proc = 0_usize;

            for &node in &subtrees {
                let left = self.nodes[node].left;
                let right = self.nodes[node].right;

                if halves_left > procs_left || left.is_none() {
                    self.assign_subtree(node, proc);
                    procs_left -= 1;
                    proc += 1;
                } else {
                    self.assign_subtree(left.unwrap(), proc);
                    self.assign_subtree(right.unwrap(), proc + 1);
                    procs_left -= 2;
                    proc += 2;
                }
                halves_left -= 2;
            }
        }

        self.build_region_lists_for_processes();
    }

    fn assign_subtree(&mut self, node: usize, proc: usize) {
        for region in self.regions_below(node) {
            self.region_to_process[region] = proc;
        }
    }

    /// Install a caller-supplied region-to-process map.
    pub fn assign_regions(&mut self, map: &[usize]) -> Result<(), Error> {
        if map.len() != self.num_regions() {
            return Err(Error::InvalidAssignment(format!(
                "map covers {} regions, tree has {}",
                map.len(),
                self.num_regions()
            )));
        }
        if let Some(&bad) = map.iter().find(|&&p| p >= self.num_processes) {
            return Err(Error::InvalidAssignment(format!(
                "process id {bad} out of range for {} processes",
                self.num_processes
            )));
        }

        self.assignment = RegionAssignment::UserDefined;
        self.region_to_process = map.to_vec();
        self.build_region_lists_for_processes();
        Ok(())
    }

    fn build_region_lists_for_processes(&mut self) {
        let mut lists = vec![Vec::new(); self.num_processes];
        for (region, &proc) in self.region_to_process.iter().enumerate() {
            lists[proc].push(region);
        }
        self.process_to_regions = lists;
    }

    /// Tally the containing region of every local point, then gather the
    /// per-process presence map and point counts everywhere.
    pub(crate) fn create_process_data_tables<C: Communicator>(
        &mut self,
        points: &[Point],
        comm: &C,
    ) -> Result<(), Error> {
        let world = SubGroup::new(comm, 0, comm.size() - 1, TAG_TABLES);
        let nregions = self.num_regions();
        let nprocs = self.num_processes;

        let mut counts = vec![0_i64; nregions];
        let mut bad_point = None;
        for (offset, point) in points.iter().enumerate() {
            let [x, y, z] = point.coords();
            match self.region_of(x as f64, y as f64, z as f64) {
                Some(region) => counts[region] += 1,
                None => {
                    log::error!(
                        "(process {}) local point {offset} is outside every region",
                        comm.rank()
                    );
                    bad_point = Some(offset as i64);
                    break;
                }
            }
        }

        let vote = all_check_for_failure(&world, bad_point.is_some(), "process data tables");
        if let Some(offset) = bad_point {
            return Err(Error::RegionLookup(offset));
        }
        vote?;

        let my_map: Vec<u8> = counts.iter().map(|&c| (c > 0) as u8).collect();
        let mut map = vec![0_u8; nregions * nprocs];
        world.all_gather(&my_map, &mut map);
        self.data_location = map;

        let mut all_counts = vec![0_i64; nregions * nprocs];
        world.all_gather(&counts, &mut all_counts);

        let mut process_list = vec![Vec::new(); nregions];
        let mut cell_count_list = vec![Vec::new(); nregions];
        let mut parallel_region_list = vec![Vec::new(); nprocs];

        for proc in 0..nprocs {
            for region in 0..nregions {
                let count = all_counts[proc * nregions + region];
                if count > 0 {
                    process_list[region].push(proc);
                    cell_count_list[region].push(count);
                    parallel_region_list[proc].push(region);
                }
            }
        }

        self.process_list = process_list;
        self.cell_count_list = cell_count_list;
        self.parallel_region_list = parallel_region_list;

        Ok(())
    }

    /// The active assignment policy.
    pub fn assignment(&self) -> RegionAssignment {
        self.assignment
    }

    /// The process responsible for region `r`, under the active policy.
    pub fn process_of_region(&self, region: usize) -> Option<usize> {
        self.region_to_process.get(region).copied()
    }

    /// The regions assigned to a process, ascending. Empty for an unknown
    /// process or when no assignment is active.
    pub fn regions_of_process(&self, process: usize) -> &[usize] {
        self.process_to_regions
            .get(process)
            .map_or(&[], |regions| regions.as_slice())
    }

    /// True if the process physically holds points inside the region.
    pub fn has_data(&self, process: usize, region: usize) -> bool {
        if process >= self.num_processes || region >= self.num_regions() {
            return false;
        }
        self.data_location[process * self.num_regions() + region] != 0
    }

    /// Number of points of region `r` held by the process.
    pub fn cell_count(&self, process: usize, region: usize) -> i64 {
        let Some(list) = self.process_list.get(region) else {
            return 0;
        };
        match list.iter().position(|&p| p == process) {
            Some(at) => self.cell_count_list[region][at],
            None => 0,
        }
    }

    /// The processes holding points of region `r`, ascending.
    pub fn processes_with_data(&self, region: usize) -> &[usize] {
        self.process_list
            .get(region)
            .map_or(&[], |list| list.as_slice())
    }

    /// Point counts parallel to [`processes_with_data`](Self::processes_with_data).
    pub fn cell_counts_for_region(&self, region: usize) -> &[i64] {
        self.cell_count_list
            .get(region)
            .map_or(&[], |list| list.as_slice())
    }

    /// The regions a process holds points for, ascending.
    pub fn regions_with_data(&self, process: usize) -> &[usize] {
        self.parallel_region_list
            .get(process)
            .map_or(&[], |list| list.as_slice())
    }

    /// Number of processes holding points of region `r`.
    pub fn num_processes_in_region(&self, region: usize) -> usize {
        self.processes_with_data(region).len()
    }

    /// Processes in front-to-back order of their assigned regions as seen
    /// along a direction of projection.
    pub fn view_order_processes_in_direction(&self, direction: [f64; 3]) -> Vec<usize> {
        self.processes_from_region_order(self.view_order_regions_in_direction(direction))
    }

    /// Processes in front-to-back order of their assigned regions as seen
    /// from a camera position.
    pub fn view_order_processes_from_position(&self, position: [f64; 3]) -> Vec<usize> {
        self.processes_from_region_order(self.view_order_regions_from_position(position))
    }

    fn processes_from_region_order(&self, regions: Vec<usize>) -> Vec<usize> {
        let mut seen = vec![false; self.num_processes];
        let mut order = Vec::new();

        for region in regions {
            let Some(&proc) = self.region_to_process.get(region) else {
                continue;
            };
            if !seen[proc] {
                seen[proc] = true;
                order.push(proc);
            }
        }

        order
    }
}

impl fmt::Display for KdTree {
    /// Summarize the assignment and data tables, one region per line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "k-d tree: {} points, {} regions, {} processes",
            self.total_points,
            self.num_regions(),
            self.num_processes
        )?;

        for region in 0..self.num_regions() {
            let owner = self
                .process_of_region(region)
                .map_or("-".to_string(), |p| p.to_string());
            let holders = self
                .processes_with_data(region)
                .iter()
                .zip(self.cell_counts_for_region(region))
                .map(|(p, c)| format!("{p}: {c}"))
                .join(", ");
            writeln!(
                f,
                "  region {region} ({} points) -> process {owner} [{holders}]",
                self.region_num_points(region)
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::geometry::BoundingBox;
    use crate::tree::KdNode;

    // A complete binary tree of the given depth with 2^depth regions.
    fn complete_tree(depth: usize, num_processes: usize) -> KdTree {
        let bounds = BoundingBox::new([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);

        let mut tree = KdTree {
            nodes: Vec::new(),
            root: 0,
            region_nodes: Vec::new(),
            num_processes,
            my_rank: 0,
            total_points: 1 << depth,
            assignment: RegionAssignment::None,
            region_to_process: Vec::new(),
            process_to_regions: Vec::new(),
            data_location: Vec::new(),
            process_list: Vec::new(),
            cell_count_list: Vec::new(),
            parallel_region_list: Vec::new(),
        };

        fn grow(tree: &mut KdTree, index: usize, depth: usize, bounds: BoundingBox) {
            if depth == 0 {
                return;
            }
            let mid = 0.5 * (bounds.min(0) + bounds.max(0));
            let mut left_bounds = bounds;
            left_bounds.set_max(0, mid);
            let mut right_bounds = bounds;
            right_bounds.set_min(0, mid);

            let points = tree.nodes[index].num_points;
            let left = tree.push_node(KdNode::new(left_bounds, left_bounds, points / 2));
            let right = tree.push_node(KdNode::new(right_bounds, right_bounds, points / 2));
            tree.nodes[index].dim = 0;
            tree.nodes[index].left = Some(left);
            tree.nodes[index].right = Some(right);

            grow(tree, left, depth - 1, left_bounds);
            grow(tree, right, depth - 1, right_bounds);
        }

        tree.push_node(KdNode::new(bounds, bounds, 1 << depth));
        grow(&mut tree, 0, depth, bounds);
        tree.build_region_list();
        tree
    }

    #[test]
    fn test_round_robin() {
        let mut tree = complete_tree(4, 4);
        tree.assign_regions_round_robin();

        let expected: Vec<usize> = (0..16).map(|r| r % 4).collect();
        assert_eq!(tree.region_to_process, expected);
        assert_eq!(tree.regions_of_process(2), &[2, 6, 10, 14]);
        assert_eq!(tree.assignment(), RegionAssignment::RoundRobin);
    }

    #[test]
    fn test_contiguous_power_of_two() {
        let mut tree = complete_tree(4, 4);
        tree.assign_regions_contiguous();

        let expected: Vec<usize> = (0..16).map(|r| r / 4).collect();
        assert_eq!(tree.region_to_process, expected);
        assert_eq!(tree.regions_of_process(2), &[8, 9, 10, 11]);
    }

    #[test]
    fn test_contiguous_odd_process_count() {
        let mut tree = complete_tree(4, 3);
        tree.assign_regions_contiguous();

        // Two level-1 subtrees of 8 regions; the first goes whole to
        // process 0, the second is split between processes 1 and 2.
        let mut expected = vec![0; 8];
        expected.extend(vec![1; 4]);
        expected.extend(vec![2; 4]);
        assert_eq!(tree.region_to_process, expected);

        // Each process owns one contiguous interval.
        for p in 0..3 {
            let regions = tree.regions_of_process(p);
            assert!(regions.windows(2).all(|w| w[1] == w[0] + 1));
        }
    }

    #[test]
    fn test_contiguous_few_regions() {
        let mut tree = complete_tree(2, 8);
        tree.assign_regions_contiguous();

        // Fewer regions than processes falls back to one region each but
        // keeps the contiguous label.
        assert_eq!(tree.region_to_process, vec![0, 1, 2, 3]);
        assert_eq!(tree.assignment(), RegionAssignment::Contiguous);
    }

    #[test]
    fn test_assignment_round_trip() {
        let mut tree = complete_tree(3, 4);
        tree.assign_regions_contiguous();

        for p in 0..4 {
            for &r in tree.regions_of_process(p) {
                assert_eq!(tree.process_of_region(r), Some(p));
            }
        }
    }

    #[test]
    fn test_user_defined_map() {
        let mut tree = complete_tree(2, 2);

        assert!(tree.assign_regions(&[0, 1, 0]).is_err()); // wrong length
        assert!(tree.assign_regions(&[0, 1, 2, 0]).is_err()); // bad process

        tree.assign_regions(&[1, 1, 0, 0]).unwrap();
        assert_eq!(tree.assignment(), RegionAssignment::UserDefined);
        assert_eq!(tree.regions_of_process(0), &[2, 3]);
        assert_eq!(tree.regions_of_process(1), &[0, 1]);
        assert_eq!(tree.process_of_region(0), Some(1));
    }

    #[test]
    fn test_view_order_processes() {
        let mut tree = complete_tree(3, 4);
        tree.assign_regions_contiguous();

        // Looking along +x the regions come in id order, so processes do
        // as well; along -x everything reverses.
        assert_eq!(
            tree.view_order_processes_in_direction([1.0, 0.0, 0.0]),
            vec![0, 1, 2, 3]
        );
        assert_eq!(
            tree.view_order_processes_in_direction([-1.0, 0.0, 0.0]),
            vec![3, 2, 1, 0]
        );

        // Round robin interleaves the regions, so the front-to-back
        // process order repeats each process once, in first-touch order.
        tree.assign_regions_round_robin();
        assert_eq!(
            tree.view_order_processes_in_direction([1.0, 0.0, 0.0]),
            vec![0, 1, 2, 3]
        );
        assert_eq!(
            tree.view_order_processes_from_position([10.0, 0.5, 0.5]),
            vec![3, 2, 1, 0]
        );
    }
}

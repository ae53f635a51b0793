//! The region tree.
//!
//! Nodes live in an arena indexed by `usize`, with child links as indices;
//! the build only ever walks downward, so there are no parent references.
//! After a successful build the tree is bitwise identical on every
//! process: the terminal leaves are the regions, numbered left to right.

use crate::constants::{NDIM, NO_DIM, PACKED_NODE_LEN};
use crate::geometry::BoundingBox;
use crate::types::RegionAssignment;

/// One node of the region tree.
#[derive(Clone, Debug)]
pub(crate) struct KdNode {
    /// The rectangular slab of space this node owns.
    pub bounds: BoundingBox,
    /// Tight bounding box of the points actually inside the region.
    pub data_bounds: BoundingBox,
    /// Number of points in this subtree; -1 while the node is a sentinel
    /// awaiting its contents during completion.
    pub num_points: i64,
    /// Split dimension, `NO_DIM` for leaves and for nodes this process did
    /// not divide itself.
    pub dim: usize,
    pub left: Option<usize>,
    pub right: Option<usize>,
    /// Region id, set on leaves once the tree is complete.
    pub region_id: Option<usize>,
}

impl KdNode {
    pub fn new(bounds: BoundingBox, data_bounds: BoundingBox, num_points: i64) -> Self {
        Self {
            bounds,
            data_bounds,
            num_points,
            dim: NO_DIM,
            left: None,
            right: None,
            region_id: None,
        }
    }

    pub fn sentinel() -> Self {
        Self::new(BoundingBox::sentinel(), BoundingBox::sentinel(), -1)
    }

    pub fn is_leaf(&self) -> bool {
        self.left.is_none()
    }
}

/// The parallel k-d tree: the region tree plus the assignment and data
/// location tables derived from it.
///
/// Built collectively through [`KdTree::build`](KdTree::build); afterwards
/// all queries are local and read-only.
pub struct KdTree {
    pub(crate) nodes: Vec<KdNode>,
    pub(crate) root: usize,
    /// Region id to arena index of the leaf.
    pub(crate) region_nodes: Vec<usize>,
    pub(crate) num_processes: usize,
    pub(crate) my_rank: usize,
    pub(crate) total_points: i64,
    pub(crate) assignment: RegionAssignment,
    pub(crate) region_to_process: Vec<usize>,
    pub(crate) process_to_regions: Vec<Vec<usize>>,
    /// Process-major `P x R` map of which processes hold points in which
    /// regions.
    pub(crate) data_location: Vec<u8>,
    /// Per region, the processes holding points of that region, ascending.
    pub(crate) process_list: Vec<Vec<usize>>,
    /// Per region, the point counts parallel to `process_list`.
    pub(crate) cell_count_list: Vec<Vec<i64>>,
    /// Per process, the regions it holds points for, ascending.
    pub(crate) parallel_region_list: Vec<Vec<usize>>,
}

impl KdTree {
    pub(crate) fn node(&self, index: usize) -> &KdNode {
        &self.nodes[index]
    }

    pub(crate) fn node_mut(&mut self, index: usize) -> &mut KdNode {
        &mut self.nodes[index]
    }

    pub(crate) fn push_node(&mut self, node: KdNode) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// The number of regions (terminal leaves).
    pub fn num_regions(&self) -> usize {
        self.region_nodes.len()
    }

    /// The number of cooperating processes the tree was built on.
    pub fn num_processes(&self) -> usize {
        self.num_processes
    }

    /// Total number of points across all processes.
    pub fn num_points(&self) -> i64 {
        self.total_points
    }

    /// Bounds of the whole decomposed volume.
    pub fn bounds(&self) -> BoundingBox {
        self.nodes[self.root].bounds
    }

    /// Region bounds of region `r`.
    pub fn region_bounds(&self, r: usize) -> Option<BoundingBox> {
        self.region_nodes.get(r).map(|&n| self.nodes[n].bounds)
    }

    /// Tight bounds of the points inside region `r`.
    pub fn region_data_bounds(&self, r: usize) -> Option<BoundingBox> {
        self.region_nodes
            .get(r)
            .map(|&n| self.nodes[n].data_bounds)
    }

    /// Number of points in region `r`.
    pub fn region_num_points(&self, r: usize) -> i64 {
        self.region_nodes
            .get(r)
            .map_or(0, |&n| self.nodes[n].num_points)
    }

    /// Depth of the tree; 0 for a single-leaf tree.
    pub fn depth(&self) -> usize {
        fn depth_below(nodes: &[KdNode], index: usize) -> usize {
            match (nodes[index].left, nodes[index].right) {
                (Some(l), Some(r)) => 1 + depth_below(nodes, l).max(depth_below(nodes, r)),
                _ => 0,
            }
        }
        depth_below(&self.nodes, self.root)
    }

    /// The coordinate of the cut between the children of an internal node.
    pub(crate) fn division_position(&self, index: usize) -> f64 {
        let node = &self.nodes[index];
        let left = node.left.expect("division position of a leaf");
        self.nodes[left].bounds.max(node.dim)
    }

    /// The region containing the point, or `None` outside the decomposed
    /// volume. Points exactly on a cut belong to the right-hand region.
    pub fn region_of(&self, x: f64, y: f64, z: f64) -> Option<usize> {
        if !self.nodes[self.root].bounds.contains(x, y, z) {
            return None;
        }

        let p = [x, y, z];
        let mut index = self.root;

        while !self.nodes[index].is_leaf() {
            let node = &self.nodes[index];
            debug_assert!(node.dim < NDIM);
            index = if p[node.dim] < self.division_position(index) {
                node.left.unwrap()
            } else {
                node.right.unwrap()
            };
        }

        self.nodes[index].region_id
    }

    /// Number the leaves left to right and record them as the regions.
    pub(crate) fn build_region_list(&mut self) {
        let mut leaves = Vec::new();
        self.collect_leaves(self.root, &mut leaves);

        for (id, &index) in leaves.iter().enumerate() {
            self.nodes[index].region_id = Some(id);
        }
        self.region_nodes = leaves;
    }

    pub(crate) fn collect_leaves(&self, index: usize, out: &mut Vec<usize>) {
        match (self.nodes[index].left, self.nodes[index].right) {
            (Some(l), Some(r)) => {
                self.collect_leaves(l, out);
                self.collect_leaves(r, out);
            }
            _ => out.push(index),
        }
    }

    /// Region ids of all leaves below `index`, left to right.
    pub(crate) fn regions_below(&self, index: usize) -> Vec<usize> {
        let mut leaves = Vec::new();
        self.collect_leaves(index, &mut leaves);
        leaves
            .into_iter()
            .filter_map(|n| self.nodes[n].region_id)
            .collect()
    }

    /// The subtree roots `level` levels below the root, left to right. A
    /// leaf above that level stands in for its missing subtree.
    pub(crate) fn nodes_at_level(&self, level: usize) -> Vec<usize> {
        let mut out = Vec::new();
        self.walk_to_level(self.root, level, &mut out);
        out
    }

    fn walk_to_level(&self, index: usize, level: usize, out: &mut Vec<usize>) {
        match (self.nodes[index].left, self.nodes[index].right) {
            (Some(l), Some(r)) if level > 0 => {
                self.walk_to_level(l, level - 1, out);
                self.walk_to_level(r, level - 1, out);
            }
            _ => out.push(index),
        }
    }

    /// Unlink everything below a node, making it a leaf. The orphaned
    /// arena slots become unreachable; every walk starts at the root.
    pub(crate) fn delete_descendants(&mut self, index: usize) {
        let node = &mut self.nodes[index];
        node.left = None;
        node.right = None;
    }

    /// Pack an internal node's division record: the split dimension, the
    /// two child point counts, and the children's region and data extents,
    /// axis interleaved.
    pub(crate) fn pack_node(&self, index: usize) -> [f64; PACKED_NODE_LEN] {
        let node = &self.nodes[index];
        let left = &self.nodes[node.left.expect("packing a leaf")];
        let right = &self.nodes[node.right.unwrap()];

        let mut data = [0.0_f64; PACKED_NODE_LEN];
        data[0] = node.dim as f64;
        data[1] = left.num_points as f64;
        data[2] = right.num_points as f64;

        let mut v = 3;
        for i in 0..NDIM {
            data[v] = left.bounds.min(i);
            data[v + 1] = left.bounds.max(i);
            data[v + 2] = left.data_bounds.min(i);
            data[v + 3] = left.data_bounds.max(i);
            data[v + 4] = right.bounds.min(i);
            data[v + 5] = right.bounds.max(i);
            data[v + 6] = right.data_bounds.min(i);
            data[v + 7] = right.data_bounds.max(i);
            v += 8;
        }

        data
    }

    /// Unpack a division record received from the node's owner.
    pub(crate) fn unpack_node(&mut self, index: usize, data: &[f64; PACKED_NODE_LEN]) {
        let left = self.nodes[index].left.expect("unpacking a leaf");
        let right = self.nodes[index].right.unwrap();

        self.nodes[index].dim = data[0] as usize;
        self.nodes[left].num_points = data[1] as i64;
        self.nodes[right].num_points = data[2] as i64;

        let mut lmin = [0.0; 3];
        let mut lmax = [0.0; 3];
        let mut lmin_data = [0.0; 3];
        let mut lmax_data = [0.0; 3];
        let mut rmin = [0.0; 3];
        let mut rmax = [0.0; 3];
        let mut rmin_data = [0.0; 3];
        let mut rmax_data = [0.0; 3];

        let mut v = 3;
        for i in 0..NDIM {
            lmin[i] = data[v];
            lmax[i] = data[v + 1];
            lmin_data[i] = data[v + 2];
            lmax_data[i] = data[v + 3];
            rmin[i] = data[v + 4];
            rmax[i] = data[v + 5];
            rmin_data[i] = data[v + 6];
            rmax_data[i] = data[v + 7];
            v += 8;
        }

        self.nodes[left].bounds = BoundingBox::from_min_max(lmin, lmax);
        self.nodes[left].data_bounds = BoundingBox::from_min_max(lmin_data, lmax_data);
        self.nodes[right].bounds = BoundingBox::from_min_max(rmin, rmax);
        self.nodes[right].data_bounds = BoundingBox::from_min_max(rmin_data, rmax_data);
    }

    /// Serialize the tree into the packed division records in preorder,
    /// preceded by the root's own record. Two identical trees serialize to
    /// bitwise-identical sequences, which is how the cross-process
    /// identity of a finished build is verified.
    pub fn packed_serialization(&self) -> Vec<f64> {
        let root = &self.nodes[self.root];
        let mut out = Vec::new();

        out.push(self.total_points as f64);
        out.extend_from_slice(&root.bounds.coordinates());
        out.extend_from_slice(&root.data_bounds.coordinates());
        self.pack_preorder(self.root, &mut out);

        out
    }

    fn pack_preorder(&self, index: usize, out: &mut Vec<f64>) {
        if self.nodes[index].is_leaf() {
            return;
        }
        out.extend_from_slice(&self.pack_node(index));
        self.pack_preorder(self.nodes[index].left.unwrap(), out);
        self.pack_preorder(self.nodes[index].right.unwrap(), out);
    }

    /// Front-to-back ordering of all regions as seen along a direction of
    /// projection.
    pub fn view_order_regions_in_direction(&self, direction: [f64; 3]) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.num_regions());
        self.view_order(self.root, &mut out, &|tree, index| {
            direction[tree.nodes[index].dim] >= 0.0
        });
        out
    }

    /// Front-to-back ordering of all regions as seen from a camera
    /// position.
    pub fn view_order_regions_from_position(&self, position: [f64; 3]) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.num_regions());
        self.view_order(self.root, &mut out, &|tree, index| {
            position[tree.nodes[index].dim] < tree.division_position(index)
        });
        out
    }

    fn view_order(
        &self,
        index: usize,
        out: &mut Vec<usize>,
        left_first: &dyn Fn(&KdTree, usize) -> bool,
    ) {
        let node = &self.nodes[index];
        match (node.left, node.right) {
            (Some(l), Some(r)) => {
                let (near, far) = if left_first(self, index) { (l, r) } else { (r, l) };
                self.view_order(near, out, left_first);
                self.view_order(far, out, left_first);
            }
            _ => {
                if let Some(region) = node.region_id {
                    out.push(region);
                }
            }
        }
    }

    /// Write the region boxes as hexahedron cells in legacy VTK format,
    /// for visual inspection of a decomposition.
    pub fn export_to_vtk(&self, file_path: &str) -> Result<(), vtkio::Error> {
        use vtkio::model::*;

        let nregions = self.num_regions();
        // Each region box has 8 corners with 3 coordinates each.
        let mut points = Vec::<f64>::with_capacity(24 * nregions);
        let mut connectivity = Vec::<u64>::with_capacity(8 * nregions);
        let mut offsets = Vec::<u64>::with_capacity(nregions);

        let mut count = 0;
        for (region, &node) in self.region_nodes.iter().enumerate() {
            let corners = self.nodes[node].bounds.corners();

            offsets.push(8 * (1 + region) as u64);

            for corner in &corners {
                points.extend_from_slice(corner);
                connectivity.push(count);
                count += 1;
            }
        }

        let vtk_file = vtkio::Vtk {
            version: Version::new((1, 0)),
            title: String::new(),
            byte_order: ByteOrder::LittleEndian,
            file_path: None,
            data: DataSet::inline(UnstructuredGridPiece {
                points: IOBuffer::F64(points),
                cells: Cells {
                    cell_verts: VertexNumbers::XML {
                        connectivity,
                        offsets,
                    },
                    types: vec![CellType::Hexahedron; nregions],
                },
                data: Attributes {
                    point: vec![],
                    cell: vec![],
                },
            }),
        };

        vtk_file.export_ascii(file_path)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::NO_DIM;

    // A hand-built two-level tree: the root splits x at 0.5, the left
    // child splits y at 0.25.
    fn sample_tree() -> KdTree {
        let whole = BoundingBox::new([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);

        let mut tree = KdTree {
            nodes: Vec::new(),
            root: 0,
            region_nodes: Vec::new(),
            num_processes: 1,
            my_rank: 0,
            total_points: 10,
            assignment: RegionAssignment::None,
            region_to_process: Vec::new(),
            process_to_regions: Vec::new(),
            data_location: Vec::new(),
            process_list: Vec::new(),
            cell_count_list: Vec::new(),
            parallel_region_list: Vec::new(),
        };

        tree.push_node(KdNode::new(whole, whole, 10));

        let left_bounds = BoundingBox::new([0.0, 0.0, 0.0, 0.5, 1.0, 1.0]);
        let right_bounds = BoundingBox::new([0.5, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let left = tree.push_node(KdNode::new(left_bounds, left_bounds, 6));
        let right = tree.push_node(KdNode::new(right_bounds, right_bounds, 4));
        tree.nodes[0].dim = 0;
        tree.nodes[0].left = Some(left);
        tree.nodes[0].right = Some(right);

        let ll_bounds = BoundingBox::new([0.0, 0.0, 0.0, 0.5, 0.25, 1.0]);
        let lr_bounds = BoundingBox::new([0.0, 0.25, 0.0, 0.5, 1.0, 1.0]);
        let ll = tree.push_node(KdNode::new(ll_bounds, ll_bounds, 2));
        let lr = tree.push_node(KdNode::new(lr_bounds, lr_bounds, 4));
        tree.nodes[left].dim = 1;
        tree.nodes[left].left = Some(ll);
        tree.nodes[left].right = Some(lr);

        tree.build_region_list();
        tree
    }

    #[test]
    fn test_region_list() {
        let tree = sample_tree();

        assert_eq!(tree.num_regions(), 3);
        assert_eq!(tree.depth(), 2);
        assert_eq!(tree.region_num_points(0), 2);
        assert_eq!(tree.region_num_points(1), 4);
        assert_eq!(tree.region_num_points(2), 4);
        assert_eq!(
            tree.region_bounds(2).unwrap().coordinates(),
            [0.5, 0.0, 0.0, 1.0, 1.0, 1.0]
        );
        assert!(tree.region_bounds(3).is_none());
    }

    #[test]
    fn test_region_of() {
        let tree = sample_tree();

        assert_eq!(tree.region_of(0.1, 0.1, 0.5), Some(0));
        assert_eq!(tree.region_of(0.1, 0.8, 0.5), Some(1));
        assert_eq!(tree.region_of(0.9, 0.5, 0.5), Some(2));
        // A point on a cut goes right.
        assert_eq!(tree.region_of(0.5, 0.5, 0.5), Some(2));
        assert_eq!(tree.region_of(0.1, 0.25, 0.5), Some(1));
        // Outside the volume.
        assert_eq!(tree.region_of(1.5, 0.5, 0.5), None);
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let tree = sample_tree();
        let packed = tree.pack_node(0);

        let mut other = sample_tree();
        // Wipe the division data of the copy, then restore it from the
        // packed record.
        other.nodes[0].dim = NO_DIM;
        let (l, r) = (other.nodes[0].left.unwrap(), other.nodes[0].right.unwrap());
        other.nodes[l].num_points = -1;
        other.nodes[r].num_points = -1;
        other.nodes[l].bounds = BoundingBox::sentinel();
        other.unpack_node(0, &packed);

        assert_eq!(other.nodes[0].dim, 0);
        assert_eq!(other.nodes[l].num_points, 6);
        assert_eq!(other.nodes[r].num_points, 4);
        assert_eq!(
            other.nodes[l].bounds.coordinates(),
            tree.nodes[l].bounds.coordinates()
        );
        assert_eq!(other.packed_serialization(), tree.packed_serialization());
    }

    #[test]
    fn test_view_order() {
        let tree = sample_tree();

        // Looking along +x: the left subtree (regions 0, 1) is in front.
        assert_eq!(
            tree.view_order_regions_in_direction([1.0, 0.0, 0.0]),
            vec![0, 1, 2]
        );
        // Looking along -x: region 2 first.
        assert_eq!(
            tree.view_order_regions_in_direction([-1.0, 0.0, 0.0]),
            vec![2, 0, 1]
        );
        // From a position inside region 1.
        assert_eq!(
            tree.view_order_regions_from_position([0.2, 0.9, 0.5]),
            vec![1, 0, 2]
        );
    }

    #[test]
    fn test_nodes_at_level() {
        let tree = sample_tree();

        assert_eq!(tree.nodes_at_level(0), vec![0]);
        assert_eq!(tree.nodes_at_level(1).len(), 2);
        // The right child is a leaf above level 2 and stands in for its
        // missing subtree.
        assert_eq!(tree.nodes_at_level(2).len(), 3);
    }
}

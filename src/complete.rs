//! Tree completion.
//!
//! After the breadth-first divide each process holds only the part of the
//! tree it participated in. Completion first makes the tree *shape*
//! identical everywhere by filling missing subtrees with sentinel nodes
//! down to the global depth, then reduces every node's contents to rank 0,
//! reconciles the region boundaries there and broadcasts the result. The
//! round trip through rank 0 is deliberate: letting each node's first
//! owner broadcast directly would accumulate different floating point
//! drift on different processes, and the finished trees would no longer
//! be bitwise identical.

use crate::build::BuildContext;
use crate::comm::{Communicator, SubGroup};
use crate::constants::{NDIM, NO_DIM, PACKED_NODE_LEN, TAG_COMPLETE, TAG_NODE_DATA};
use crate::tree::KdNode;

impl<'a, C: Communicator> BuildContext<'a, C> {
    /// Reconcile the partial trees into one tree, identical on every
    /// process.
    pub(crate) fn complete_tree(&mut self) {
        let _scope = self.timing.scope("complete tree");

        let comm = self.comm;
        let world = SubGroup::new(comm, 0, comm.size() - 1, TAG_COMPLETE);

        let my_depth = self.tree.depth() as i64;
        let mut depth = [0_i64];
        world.all_reduce_max(&[my_depth], &mut depth);

        self.fill_out_tree(self.tree.root, depth[0] as usize);

        let mut sources = vec![0_i32; comm.size()];
        self.reduce_data(self.tree.root, &world, &mut sources);

        if comm.rank() == 0 {
            self.fix_region_boundaries(self.tree.root);
        }

        self.broadcast_data(self.tree.root, &world);
    }

    /// Extend the local tree to a complete binary tree of the given depth
    /// by attaching sentinel children below every missing subtree.
    fn fill_out_tree(&mut self, index: usize, depth: usize) {
        if depth == 0 {
            return;
        }

        if self.tree.node(index).left.is_none() {
            let left = self.tree.push_node(KdNode::sentinel());
            let right = self.tree.push_node(KdNode::sentinel());
            let node = self.tree.node_mut(index);
            node.left = Some(left);
            node.right = Some(right);
        }

        self.fill_out_tree(self.tree.node(index).left.unwrap(), depth - 1);
        self.fill_out_tree(self.tree.node(index).right.unwrap(), depth - 1);
    }

    /// Preorder walk delivering each node's division record to rank 0.
    ///
    /// A contiguous group of processes divided each node; the first of
    /// them sends the record if rank 0 does not have it itself. A node
    /// divided by no process at all has only sentinels below it, which
    /// every process prunes.
    fn reduce_data(&mut self, index: usize, world: &SubGroup<'a, C>, sources: &mut [i32]) {
        if self.tree.node(index).left.is_none() {
            return;
        }

        let comm = self.comm;
        let i_have = (self.tree.node(index).dim < NO_DIM) as i32;
        world.all_gather(&[i_have], sources);

        if sources[0] == 0 {
            match sources.iter().position(|&s| s != 0) {
                None => {
                    self.tree.delete_descendants(index);
                    return;
                }
                Some(owner) => {
                    if owner == comm.rank() {
                        let data = self.tree.pack_node(index);
                        comm.send(&data, 0, TAG_NODE_DATA);
                    } else if comm.rank() == 0 {
                        let mut data = [0.0_f64; PACKED_NODE_LEN];
                        comm.receive(&mut data, owner, TAG_NODE_DATA);
                        self.tree.unpack_node(index, &data);
                    }
                }
            }
        }

        self.reduce_data(self.tree.node(index).left.unwrap(), world, sources);
        self.reduce_data(self.tree.node(index).right.unwrap(), world, sources);
    }

    /// Rewrite child bounds from the parent's so sibling regions meet
    /// exactly on the split plane and inherit the parent's extents along
    /// the other axes, removing accumulated floating point drift.
    fn fix_region_boundaries(&mut self, index: usize) {
        if self.tree.node(index).left.is_none() {
            return;
        }

        let node = self.tree.node(index).clone();
        let split_dim = node.dim;
        let left = node.left.unwrap();
        let right = node.right.unwrap();

        for d in 0..NDIM {
            let parent_min = node.bounds.min(d);
            let parent_max = node.bounds.max(d);

            if self.tree.node(left).bounds.min(d) != parent_min {
                self.tree.node_mut(left).bounds.set_min(d, parent_min);
            }
            if self.tree.node(right).bounds.max(d) != parent_max {
                self.tree.node_mut(right).bounds.set_max(d, parent_max);
            }

            if d != split_dim {
                // The dimension this node did not divide along.
                if self.tree.node(left).bounds.max(d) != parent_max {
                    self.tree.node_mut(left).bounds.set_max(d, parent_max);
                }
                if self.tree.node(right).bounds.min(d) != parent_min {
                    self.tree.node_mut(right).bounds.set_min(d, parent_min);
                }
            } else {
                let right_min = self.tree.node(right).bounds.min(d);
                if self.tree.node(left).bounds.max(d) != right_min {
                    self.tree.node_mut(left).bounds.set_max(d, right_min);
                }
            }
        }

        self.fix_region_boundaries(left);
        self.fix_region_boundaries(right);
    }

    /// Preorder broadcast of rank 0's reconciled node records.
    fn broadcast_data(&mut self, index: usize, world: &SubGroup<'a, C>) {
        if self.tree.node(index).left.is_none() {
            return;
        }

        let mut data = if self.comm.rank() == 0 {
            self.tree.pack_node(index)
        } else {
            [0.0_f64; PACKED_NODE_LEN]
        };

        world.broadcast(&mut data, 0);

        if self.comm.rank() > 0 {
            self.tree.unpack_node(index, &data);
        }

        self.broadcast_data(self.tree.node(index).left.unwrap(), world);
        self.broadcast_data(self.tree.node(index).right.unwrap(), world);
    }
}

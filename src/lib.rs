//! A parallel k-d tree library.
//!
//! This library partitions a 3-d point set distributed across cooperating
//! processes into disjoint axis-aligned rectangular regions. Each process
//! owns a contiguous chunk of a globally indexed point sequence; after the
//! build every process holds the same complete [KdTree](crate::tree::KdTree)
//! and the same assignment of regions to processes.
//!
//! The tree is built by recursive median subdivision. Medians of the
//! distributed array are found with the selection algorithm of Floyd and
//! Rivest, implemented on top of a three-way pivot partition that
//! redistributes points between the owning processes through a double
//! buffered point array. Because each internal node is divided only by
//! the contiguous group of processes owning its index range, a completion
//! phase reconciles the partial trees through rank 0 and broadcasts one
//! bit-identical result to everyone.
//!
//! The build is written against a minimal [Communicator](crate::comm::Communicator)
//! surface. Two backends ship with the crate: a shared-memory backend
//! running the process group as threads of one program, and an MPI
//! adapter behind the `mpi` cargo feature for real clusters.
//!
//! ## Using the library.
//!
//! Each process contributes its local points and identical tunables:
//! ```
//! use parkd::comm::local::run_cluster;
//! use parkd::comm::Communicator;
//! use parkd::{generate_random_points, BuildConfig, KdTree};
//! use rand::prelude::*;
//! use rand_chacha::ChaCha8Rng;
//!
//! let trees = run_cluster(2, |comm| {
//!     let mut rng = ChaCha8Rng::seed_from_u64(comm.rank() as u64);
//!     let points = generate_random_points(500, &mut rng);
//!
//!     KdTree::build(&points, None, &BuildConfig::default(), &comm).unwrap()
//! });
//!
//! // Every process ends up with the same decomposition.
//! assert!(trees[0].num_regions() >= 2);
//! assert_eq!(
//!     trees[0].packed_serialization(),
//!     trees[1].packed_serialization()
//! );
//! ```
//! On a cluster the same code runs against `comm::mpi::NativeComm`
//! wrapping the MPI world communicator, one process per rank.
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

mod assign;
pub mod buffer;
mod build;
pub mod comm;
mod complete;
pub mod constants;
pub mod geometry;
mod select;
mod timing;
pub mod tools;
pub mod tree;
pub mod types;

pub use crate::geometry::{BoundingBox, Point};
pub use crate::tools::generate_random_points;
pub use crate::tree::KdTree;
pub use crate::types::{BuildConfig, Error, RegionAssignment};

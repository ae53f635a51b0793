//! Build a tree across real MPI ranks.
//!
//! Run with e.g. `mpirun -n 4 cargo run --example mpi_build --features mpi`.

use parkd::comm::mpi::NativeComm;
use parkd::comm::Communicator;
use parkd::{generate_random_points, BuildConfig, KdTree};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

pub fn main() {
    let universe = mpi::initialize().unwrap();
    let comm = NativeComm::new(universe.world());

    let mut rng = ChaCha8Rng::seed_from_u64(comm.rank() as u64);
    let npoints = 100000;

    let points = generate_random_points(npoints, &mut rng);

    let config = BuildConfig {
        min_cells: 1000,
        timing: true,
        ..Default::default()
    };

    let tree = KdTree::build(&points, None, &config, &comm).expect("build failed");

    let total: i64 = (0..tree.num_regions())
        .map(|r| tree.region_num_points(r))
        .sum();
    assert_eq!(total, (npoints * comm.size()) as i64);

    for r in 0..tree.num_regions() {
        let held = tree.cell_count(comm.rank(), r);
        if held > 0 {
            assert!(tree.has_data(comm.rank(), r));
        }
    }

    if comm.rank() == 0 {
        println!("{tree}");
        println!("no errors were found in the distributed tree.");
    }
}

//! Build a tree on a thread-backed process group and check it.
//!
//! Runs without any MPI launcher: `cargo run --example local_cluster`.

use parkd::comm::local::run_cluster;
use parkd::comm::Communicator;
use parkd::{generate_random_points, BuildConfig, KdTree};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

pub fn main() {
    let nprocs = 4;
    let npoints = 20000;

    let config = BuildConfig {
        min_cells: 500,
        ..Default::default()
    };

    let trees = run_cluster(nprocs, move |comm| {
        let mut rng = ChaCha8Rng::seed_from_u64(comm.rank() as u64);
        let points = generate_random_points(npoints, &mut rng);

        KdTree::build(&points, None, &config, &comm).expect("build failed")
    });

    // All processes must hold the identical tree.
    let reference = trees[0].packed_serialization();
    for tree in &trees[1..] {
        assert_eq!(tree.packed_serialization(), reference);
    }

    let tree = &trees[0];
    let total: i64 = (0..tree.num_regions())
        .map(|r| tree.region_num_points(r))
        .sum();
    assert_eq!(total, (nprocs * npoints) as i64);

    println!("{tree}");
    println!(
        "front-to-back along +x: {:?}",
        tree.view_order_processes_in_direction([1.0, 0.0, 0.0])
    );

    tree.export_to_vtk("regions.vtk").expect("vtk export failed");
    println!("wrote regions.vtk");
}

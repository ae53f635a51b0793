//! End-to-end builds on thread-backed process groups.

use parkd::comm::local::run_cluster;
use parkd::comm::Communicator;
use parkd::{generate_random_points, BoundingBox, BuildConfig, Error, KdTree, Point};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

fn serialization_bits(tree: &KdTree) -> Vec<u64> {
    tree.packed_serialization()
        .iter()
        .map(|v| v.to_bits())
        .collect()
}

/// The invariants any valid build must satisfy, checked through the
/// public query surface.
fn check_invariants(tree: &KdTree, total_points: i64) {
    let nregions = tree.num_regions();
    assert!(nregions >= 1);

    // Point counts of the leaves add up to the global count.
    let count: i64 = (0..nregions).map(|r| tree.region_num_points(r)).sum();
    assert_eq!(count, total_points);

    let root = tree.bounds();
    let root_volume: f64 = (0..3).map(|d| root.extent(d)).product();

    let mut volume = 0.0;
    for r in 0..nregions {
        let bounds = tree.region_bounds(r).unwrap();
        let data = tree.region_data_bounds(r).unwrap();

        for d in 0..3 {
            // Regions stay inside the root volume.
            assert!(bounds.min(d) >= root.min(d) && bounds.max(d) <= root.max(d));
            // Data bounds are contained in region bounds, except in empty
            // regions whose data bounds are a borrowed point.
            if tree.region_num_points(r) > 0 {
                assert!(
                    data.min(d) >= bounds.min(d) - 1e-6 && data.max(d) <= bounds.max(d) + 1e-6,
                    "data bounds of region {r} escape its region bounds along {d}"
                );
            }
        }

        volume += (0..3).map(|d| bounds.extent(d)).product::<f64>();
    }

    // The leaves tile the root bounds: volumes add up (they cannot
    // overlap beyond shared planes since each region sits inside its
    // half of every ancestor cut).
    assert!(
        (volume - root_volume).abs() <= 1e-9 * root_volume,
        "region volumes {volume} do not tile the root volume {root_volume}"
    );

    // Every region centroid maps back to its region.
    for r in 0..nregions {
        let bounds = tree.region_bounds(r).unwrap();
        let center = [
            0.5 * (bounds.min(0) + bounds.max(0)),
            0.5 * (bounds.min(1) + bounds.max(1)),
            0.5 * (bounds.min(2) + bounds.max(2)),
        ];
        assert_eq!(tree.region_of(center[0], center[1], center[2]), Some(r));
    }
}

fn line_points(range: std::ops::Range<i64>) -> Vec<Point> {
    range.map(|i| Point::new([i as f32, 0.0, 0.0])).collect()
}

#[test]
fn test_line_of_points_four_processes() {
    // 4 processes, 8 points each at (i, 0, 0): x is selected everywhere
    // and the leaves split [0, 31] into eight runs of four.
    let config = BuildConfig {
        min_cells: 4,
        number_of_regions_or_less: 8,
        ..Default::default()
    };

    let trees = run_cluster(4, move |comm| {
        let lo = 8 * comm.rank() as i64;
        let points = line_points(lo..lo + 8);
        KdTree::build(&points, None, &config, &comm).unwrap()
    });

    let reference = serialization_bits(&trees[0]);
    for tree in &trees {
        assert_eq!(serialization_bits(tree), reference);
        check_invariants(tree, 32);

        assert_eq!(tree.num_regions(), 8);
        for r in 0..8 {
            assert_eq!(tree.region_num_points(r), 4);
            // Cuts fall midway between neighboring integer coordinates.
            if r < 7 {
                let bounds = tree.region_bounds(r).unwrap();
                assert_eq!(bounds.max(0), 4.0 * r as f64 + 3.5);
            }
            assert_eq!(tree.region_of(4.0 * r as f64 + 1.0, 0.0, 0.0), Some(r));
        }

        // Contiguous assignment gives each process two adjacent regions.
        for p in 0..4 {
            assert_eq!(tree.regions_of_process(p), &[2 * p, 2 * p + 1]);
        }

        // Each region's points live on exactly one process.
        for r in 0..8 {
            let holder = r / 2;
            assert_eq!(tree.processes_with_data(r), &[holder]);
            assert_eq!(tree.cell_count(holder, r), 4);
            assert!(tree.has_data(holder, r));
            assert!(!tree.has_data((holder + 1) % 4, r));
        }
    }
}

#[test]
fn test_coincident_points_fallback() {
    // 2 processes, every point at (1, 2, 3). The build cannot separate
    // the points spatially and falls back to splitting index ranges in
    // the middle.
    let volume = BoundingBox::new([0.0, 0.0, 0.0, 2.0, 4.0, 6.0]);
    let config = BuildConfig {
        min_cells: 2,
        number_of_regions_or_less: 4,
        ..Default::default()
    };

    let trees = run_cluster(2, move |comm| {
        let points = vec![Point::new([1.0, 2.0, 3.0]); 5];
        KdTree::build(&points, Some(volume), &config, &comm).unwrap()
    });

    let reference = serialization_bits(&trees[0]);
    for tree in &trees {
        assert_eq!(serialization_bits(tree), reference);
        check_invariants(tree, 10);

        // The root splits at index 5; the next level splits 5 into 3 + 2.
        assert_eq!(tree.num_regions(), 4);
        assert_eq!(tree.depth(), 2);
        let counts: Vec<i64> = (0..4).map(|r| tree.region_num_points(r)).collect();
        assert_eq!(counts, vec![3, 2, 3, 2]);

        // All leaves carry the identical degenerate data bounds.
        for r in 0..4 {
            assert_eq!(
                tree.region_data_bounds(r).unwrap().coordinates(),
                [1.0, 2.0, 3.0, 1.0, 2.0, 3.0]
            );
        }
    }
}

#[test]
fn test_random_points_three_processes() {
    // 3 processes, 1000 random points, 8 regions.
    let config = BuildConfig {
        min_cells: 2,
        number_of_regions_or_less: 8,
        ..Default::default()
    };

    let trees = run_cluster(3, move |comm| {
        let mut rng = ChaCha8Rng::seed_from_u64(42 + comm.rank() as u64);
        let n = if comm.rank() == 0 { 334 } else { 333 };
        let points = generate_random_points(n, &mut rng);
        KdTree::build(&points, None, &config, &comm).unwrap()
    });

    let reference = serialization_bits(&trees[0]);
    for tree in &trees {
        assert_eq!(serialization_bits(tree), reference);
        check_invariants(tree, 1000);

        assert_eq!(tree.num_regions(), 8);

        // Median splits leave the leaf counts within one of each other.
        let counts: Vec<i64> = (0..8).map(|r| tree.region_num_points(r)).collect();
        let smallest = counts.iter().min().unwrap();
        let largest = counts.iter().max().unwrap();
        assert!(largest - smallest <= 1, "leaf counts {counts:?}");
    }
}

#[test]
fn test_two_points_two_processes() {
    // 2 processes, one point each: the root divides once and each leaf
    // holds one point with degenerate data bounds.
    let config = BuildConfig {
        min_cells: 1,
        ..Default::default()
    };

    let trees = run_cluster(2, move |comm| {
        let c = comm.rank() as f32;
        let points = vec![Point::new([c, c, c])];
        KdTree::build(&points, None, &config, &comm).unwrap()
    });

    let reference = serialization_bits(&trees[0]);
    for tree in &trees {
        assert_eq!(serialization_bits(tree), reference);
        check_invariants(tree, 2);

        assert_eq!(tree.num_regions(), 2);
        assert_eq!(tree.region_num_points(0), 1);
        assert_eq!(tree.region_num_points(1), 1);
        assert_eq!(
            tree.region_data_bounds(0).unwrap().coordinates(),
            [0.0; 6]
        );
        assert_eq!(
            tree.region_data_bounds(1).unwrap().coordinates(),
            [1.0; 6]
        );
    }
}

#[test]
fn test_single_point() {
    let trees = run_cluster(2, |comm| {
        let points = if comm.rank() == 0 {
            vec![Point::new([1.0, 2.0, 3.0])]
        } else {
            Vec::new()
        };
        // The flat cloud needs caller-supplied bounds.
        let volume = BoundingBox::new([0.0, 0.0, 0.0, 4.0, 4.0, 4.0]);
        KdTree::build(&points, Some(volume), &BuildConfig::default(), &comm).unwrap()
    });

    for tree in &trees {
        assert_eq!(tree.num_regions(), 1);
        assert_eq!(tree.region_num_points(0), 1);
        assert_eq!(tree.region_of(1.0, 2.0, 3.0), Some(0));
    }
}

#[test]
fn test_small_node_division() {
    // With min_cells disabled, single-point regions keep dividing through
    // the owner-only path until the region target stops them; the point
    // stays in the leftmost leaf of its branch.
    let config = BuildConfig {
        min_cells: 0,
        number_of_regions_or_less: 4,
        ..Default::default()
    };

    let trees = run_cluster(2, move |comm| {
        let c = comm.rank() as f32;
        let points = vec![Point::new([c, c, c])];
        KdTree::build(&points, None, &config, &comm).unwrap()
    });

    let reference = serialization_bits(&trees[0]);
    for tree in &trees {
        assert_eq!(serialization_bits(tree), reference);
        check_invariants(tree, 2);

        assert_eq!(tree.num_regions(), 4);
        let counts: Vec<i64> = (0..4).map(|r| tree.region_num_points(r)).collect();
        assert_eq!(counts.iter().sum::<i64>(), 2);
        // Each original leaf split into (point, empty).
        assert_eq!(counts, vec![1, 0, 1, 0]);
    }
}

#[test]
fn test_points_on_a_sphere() {
    // A hollow distribution: every region still gets points because the
    // cuts follow medians, not volume.
    let config = BuildConfig {
        min_cells: 25,
        ..Default::default()
    };

    let trees = run_cluster(2, move |comm| {
        let mut rng = ChaCha8Rng::seed_from_u64(5 + comm.rank() as u64);
        let normal = rand_distr::Normal::new(0.0_f32, 1.0).unwrap();
        let points: Vec<Point> = (0..400)
            .map(|_| {
                let x = normal.sample(&mut rng);
                let y = normal.sample(&mut rng);
                let z = normal.sample(&mut rng);
                let norm = (x * x + y * y + z * z).sqrt();
                Point::new([x / norm, y / norm, z / norm])
            })
            .collect();
        KdTree::build(&points, None, &config, &comm).unwrap()
    });

    let reference = serialization_bits(&trees[0]);
    for tree in &trees {
        assert_eq!(serialization_bits(tree), reference);
        check_invariants(tree, 800);
        for r in 0..tree.num_regions() {
            assert!(tree.region_num_points(r) > 0);
        }
    }
}

#[test]
fn test_degenerate_volume() {
    // All points coincide: without usable bounds the build fails on
    // every process and produces no tree.
    run_cluster(2, |comm| {
        let points = vec![Point::new([5.0, 5.0, 5.0]); 4];

        let result = KdTree::build(&points, None, &BuildConfig::default(), &comm);
        assert!(matches!(result, Err(Error::DegenerateVolume)));

        // A degenerate caller-supplied box fails the same way.
        let flat = BoundingBox::new([5.0, 5.0, 5.0, 5.0, 5.0, 5.0]);
        let result = KdTree::build(&points, Some(flat), &BuildConfig::default(), &comm);
        assert!(matches!(result, Err(Error::DegenerateVolume)));
    });
}

#[test]
fn test_empty_input() {
    run_cluster(2, |comm| {
        let result = KdTree::build(&[], None, &BuildConfig::default(), &comm);
        assert!(matches!(result, Err(Error::DegenerateVolume)));
    });
}

#[test]
fn test_build_is_deterministic() {
    let config = BuildConfig {
        min_cells: 8,
        ..Default::default()
    };

    let pairs = run_cluster(3, move |comm| {
        let mut rng = ChaCha8Rng::seed_from_u64(7 + comm.rank() as u64);
        let points = generate_random_points(200, &mut rng);

        let first = KdTree::build(&points, None, &config, &comm).unwrap();
        let second = KdTree::build(&points, None, &config, &comm).unwrap();
        (
            serialization_bits(&first),
            serialization_bits(&second),
        )
    });

    for (first, second) in pairs {
        assert_eq!(first, second);
    }
}

#[test]
fn test_single_process_matches_parallel() {
    // The same global point set, once on one process and once split over
    // two, yields bitwise identical trees.
    let config = BuildConfig {
        min_cells: 4,
        ..Default::default()
    };

    let mut rng = ChaCha8Rng::seed_from_u64(23);
    let all_points = generate_random_points(300, &mut rng);

    let single = {
        let all = all_points.clone();
        let config = config.clone();
        run_cluster(1, move |comm| {
            KdTree::build(&all, None, &config, &comm).unwrap()
        })
    };

    let split = {
        let all = all_points.clone();
        let config = config.clone();
        run_cluster(2, move |comm| {
            let points = if comm.rank() == 0 {
                &all[..150]
            } else {
                &all[150..]
            };
            KdTree::build(points, None, &config, &comm).unwrap()
        })
    };

    assert_eq!(
        serialization_bits(&single[0]),
        serialization_bits(&split[0])
    );
    assert_eq!(
        serialization_bits(&split[0]),
        serialization_bits(&split[1])
    );
}

#[test]
fn test_reassignment_leaves_tree_unchanged() {
    // Scenario: P = 4, R = 16. Swapping policies only rewrites the maps.
    let config = BuildConfig {
        min_cells: 2,
        number_of_regions_or_less: 16,
        number_of_regions_or_more: 16,
        ..Default::default()
    };

    let trees = run_cluster(4, move |comm| {
        let lo = 16 * comm.rank() as i64;
        let points = line_points(lo..lo + 16);
        let mut tree = KdTree::build(&points, None, &config, &comm).unwrap();

        let before = tree.packed_serialization();

        tree.assign_regions_round_robin();
        let round_robin: Vec<usize> = (0..16)
            .map(|r| tree.process_of_region(r).unwrap())
            .collect();
        let rr_of_2 = tree.regions_of_process(2).to_vec();

        tree.assign_regions_contiguous();
        let contiguous: Vec<usize> = (0..16)
            .map(|r| tree.process_of_region(r).unwrap())
            .collect();
        let contig_of_2 = tree.regions_of_process(2).to_vec();

        assert_eq!(tree.packed_serialization(), before);

        (round_robin, rr_of_2, contiguous, contig_of_2)
    });

    for (round_robin, rr_of_2, contiguous, contig_of_2) in trees {
        let expected_rr: Vec<usize> = (0..16).map(|r| r % 4).collect();
        let expected_contig: Vec<usize> = (0..16).map(|r| r / 4).collect();
        assert_eq!(round_robin, expected_rr);
        assert_eq!(contiguous, expected_contig);
        assert_eq!(rr_of_2, vec![2, 6, 10, 14]);
        assert_eq!(contig_of_2, vec![8, 9, 10, 11]);
    }
}

#[test]
fn test_max_level_bounds_depth() {
    let config = BuildConfig {
        min_cells: 1,
        max_level: 2,
        ..Default::default()
    };

    let trees = run_cluster(2, move |comm| {
        let mut rng = ChaCha8Rng::seed_from_u64(99 + comm.rank() as u64);
        let points = generate_random_points(500, &mut rng);
        KdTree::build(&points, None, &config, &comm).unwrap()
    });

    for tree in &trees {
        assert!(tree.depth() <= 2);
        assert_eq!(tree.num_regions(), 4);
        check_invariants(tree, 1000);
    }
}

#[test]
fn test_view_order_covers_all_processes() {
    let config = BuildConfig {
        min_cells: 2,
        number_of_regions_or_less: 8,
        ..Default::default()
    };

    let trees = run_cluster(2, move |comm| {
        let lo = 8 * comm.rank() as i64;
        let points = line_points(lo..lo + 8);
        KdTree::build(&points, None, &config, &comm).unwrap()
    });

    for tree in &trees {
        let forward = tree.view_order_processes_in_direction([1.0, 0.0, 0.0]);
        let backward = tree.view_order_processes_in_direction([-1.0, 0.0, 0.0]);
        assert_eq!(forward, vec![0, 1]);
        assert_eq!(backward, vec![1, 0]);

        let regions = tree.view_order_regions_from_position([100.0, 0.0, 0.0]);
        assert_eq!(regions.len(), tree.num_regions());
        // Seen from far +x the closest region comes first.
        assert_eq!(regions[0], tree.num_regions() - 1);
    }
}

#[test]
fn test_uneven_distribution() {
    // One process holds most of the points, one holds none.
    let config = BuildConfig {
        min_cells: 3,
        ..Default::default()
    };

    let trees = run_cluster(3, move |comm| {
        let points = match comm.rank() {
            0 => line_points(0..20),
            1 => Vec::new(),
            _ => line_points(20..24),
        };
        KdTree::build(&points, None, &config, &comm).unwrap()
    });

    let reference = serialization_bits(&trees[0]);
    for tree in &trees {
        assert_eq!(serialization_bits(tree), reference);
        check_invariants(tree, 24);

        // The empty process holds data for no region.
        assert_eq!(tree.regions_with_data(1), &[] as &[usize]);
        let held: usize = (0..tree.num_regions())
            .map(|r| tree.num_processes_in_region(r))
            .sum();
        assert!(held >= tree.num_regions());
    }
}

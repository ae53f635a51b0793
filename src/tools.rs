//! Utility routines.

use rand::Rng;

use crate::geometry::Point;

/// Generate `npoints` uniformly random points in the unit cube.
///
/// Intended for tests and demos; seed the generator per rank to get a
/// different cloud on each process.
pub fn generate_random_points<R: Rng + ?Sized>(npoints: usize, rng: &mut R) -> Vec<Point> {
    (0..npoints)
        .map(|_| Point::new([rng.gen(), rng.gen(), rng.gen()]))
        .collect()
}

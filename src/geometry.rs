//! Geometry primitives: points and axis-aligned boxes.

use bytemuck::{Pod, Zeroable};

use crate::constants::NDIM;

/// A 3-d point in single precision.
///
/// Points carry no identity beyond their position in the global index
/// space; the build permutes them freely.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(transparent)]
pub struct Point {
    coords: [f32; 3],
}

impl Point {
    /// Create a new point from its coordinates.
    pub fn new(coords: [f32; 3]) -> Self {
        Self { coords }
    }

    /// Return the coordinates of the point.
    pub fn coords(&self) -> [f32; 3] {
        self.coords
    }

    /// Reinterpret a flat `3 * n` coordinate slice as a point slice.
    pub fn from_flat(coords: &[f32]) -> &[Point] {
        assert_eq!(coords.len() % 3, 0);
        bytemuck::cast_slice(coords)
    }

    /// Reinterpret a point slice as a flat `3 * n` coordinate slice.
    pub fn to_flat(points: &[Point]) -> &[f32] {
        bytemuck::cast_slice(points)
    }
}

/// An axis-aligned box in double precision.
///
/// The coordinates are stored as `[xmin, ymin, zmin, xmax, ymax, zmax]`.
/// Both the region bounds and the data bounds of tree nodes use this type.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    coords: [f64; 6],
}

impl BoundingBox {
    /// Create a new box from `[xmin, ymin, zmin, xmax, ymax, zmax]`.
    pub fn new(coords: [f64; 6]) -> Self {
        Self { coords }
    }

    /// Create a box from separate min and max corners.
    pub fn from_min_max(min: [f64; 3], max: [f64; 3]) -> Self {
        Self {
            coords: [min[0], min[1], min[2], max[0], max[1], max[2]],
        }
    }

    /// The box used as a sentinel for tree nodes whose contents have not
    /// been received yet.
    pub(crate) fn sentinel() -> Self {
        Self { coords: [-1.0; 6] }
    }

    /// Return the coordinates as `[xmin, ymin, zmin, xmax, ymax, zmax]`.
    pub fn coordinates(&self) -> [f64; 6] {
        self.coords
    }

    /// Lower bound along `dim`.
    pub fn min(&self, dim: usize) -> f64 {
        self.coords[dim]
    }

    /// Upper bound along `dim`.
    pub fn max(&self, dim: usize) -> f64 {
        self.coords[NDIM + dim]
    }

    pub(crate) fn set_min(&mut self, dim: usize, value: f64) {
        self.coords[dim] = value;
    }

    pub(crate) fn set_max(&mut self, dim: usize, value: f64) {
        self.coords[NDIM + dim] = value;
    }

    /// Extent of the box along `dim`.
    pub fn extent(&self, dim: usize) -> f64 {
        self.max(dim) - self.min(dim)
    }

    /// Return true if the point lies inside the box, boundaries included.
    pub fn contains(&self, x: f64, y: f64, z: f64) -> bool {
        let p = [x, y, z];
        (0..NDIM).all(|d| p[d] >= self.min(d) && p[d] <= self.max(d))
    }

    /// Compute the tight bounding box of a point slice. Returns `None` for
    /// an empty slice.
    pub fn from_points(points: &[Point]) -> Option<BoundingBox> {
        if points.is_empty() {
            return None;
        }

        let mut min = [f64::MAX; 3];
        let mut max = [f64::MIN; 3];

        for point in points {
            for (d, &c) in point.coords().iter().enumerate() {
                min[d] = f64::min(min[d], c as f64);
                max[d] = f64::max(max[d], c as f64);
            }
        }

        Some(BoundingBox::from_min_max(min, max))
    }

    /// Return an ordered list of the eight corners of the box, in the VTK
    /// hexahedron vertex order.
    pub fn corners(&self) -> [[f64; 3]; 8] {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;

        [
            [xmin, ymin, zmin],
            [xmax, ymin, zmin],
            [xmax, ymax, zmin],
            [xmin, ymax, zmin],
            [xmin, ymin, zmax],
            [xmax, ymin, zmax],
            [xmax, ymax, zmax],
            [xmin, ymax, zmax],
        ]
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;

        write!(
            f,
            "(xmin: {}, ymin: {}, zmin: {}, xmax: {}, ymax: {}, zmax: {})",
            xmin, ymin, zmin, xmax, ymax, zmax
        )
    }
}

//! Crate-wide constants.

/// Number of spatial dimensions.
pub const NDIM: usize = 3;

/// Dimension value of a node that has not performed a split.
pub const NO_DIM: usize = 3;

/// Bitmask allowing splits along all three axes.
pub const ALL_DIRECTIONS: u8 = 0b111;

/// Subarray length below which the Floyd-Rivest selection stops sampling
/// and partitions directly.
pub const FR_SAMPLE_THRESHOLD: i64 = 600;

/// Number of doubles in a packed node record: the split dimension, the two
/// child point counts and the two children's region and data extents.
pub const PACKED_NODE_LEN: usize = 27;

/// Collective tag for the parameter agreement phase.
pub const TAG_PARAMETERS: i32 = 0x0000_1000;

/// Collective tag for building the global index directory.
pub const TAG_INDEX_LISTS: i32 = 0x0000_2000;

/// Collective tag for the tree completion phase.
pub const TAG_COMPLETE: i32 = 0x0000_3000;

/// Collective tag for building the process data tables.
pub const TAG_TABLES: i32 = 0x0000_f000;

/// Point-to-point tag for node records sent to rank 0 during completion.
pub const TAG_NODE_DATA: i32 = 0x0000_1111;

/// Tag of the root node's division; children get `tag << 1` and
/// `tag << 1 | 1`, so concurrent sub-groups never share a tag.
pub const TAG_ROOT_DIVISION: i32 = 0x0000_0001;

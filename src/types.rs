//! Build configuration and error types.

use thiserror::Error;

use crate::constants::ALL_DIRECTIONS;

/// Error raised by a failed tree build or an invalid table request.
#[derive(Debug, Error)]
pub enum Error {
    /// The input points span an empty volume. Also raised when there are no
    /// points at all.
    #[error("degenerate volume: input points span an empty bounding box")]
    DegenerateVolume,

    /// A tunable is unusable, e.g. an empty direction mask.
    #[error("invalid build parameters: {0}")]
    InvalidParameters(&'static str),

    /// A user-supplied region assignment references a process that does not
    /// exist or has the wrong length.
    #[error("invalid region assignment: {0}")]
    InvalidAssignment(String),

    /// A process voted failure during a collective phase. Every process
    /// returns this error so the build aborts identically everywhere.
    #[error("build failed during {phase} on this or a remote process")]
    RemoteFailure {
        /// Phase in which the failure vote was cast.
        phase: &'static str,
    },

    /// A local point fell outside every region while tallying the
    /// per-region cell counts.
    #[error("local point {0} is not contained in any region")]
    RegionLookup(i64),
}

/// Policy mapping regions onto processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegionAssignment {
    /// No assignment tables are built.
    None,
    /// Whole subtrees go to single processes so that each process receives a
    /// contiguous interval of region ids.
    #[default]
    Contiguous,
    /// Region `r` is assigned to process `r mod P`.
    RoundRobin,
    /// The caller supplied the map through [`KdTree::assign_regions`].
    ///
    /// [`KdTree::assign_regions`]: crate::tree::KdTree::assign_regions
    UserDefined,
}

impl RegionAssignment {
    pub(crate) fn encode(self) -> i64 {
        match self {
            RegionAssignment::None => 0,
            RegionAssignment::Contiguous => 1,
            RegionAssignment::UserDefined => 2,
            RegionAssignment::RoundRobin => 3,
        }
    }

    pub(crate) fn decode(value: i64) -> Self {
        match value {
            0 => RegionAssignment::None,
            2 => RegionAssignment::UserDefined,
            3 => RegionAssignment::RoundRobin,
            _ => RegionAssignment::Contiguous,
        }
    }
}

/// Tunables of the tree build.
///
/// The parameters must agree on every process; rank 0's values win on
/// disagreement and the overridden processes log a warning.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Bitmask of the axes eligible for splitting, bit `d` for dimension
    /// `d`. Defaults to all three.
    pub valid_directions: u8,
    /// A region is not divided if a child would receive fewer than this
    /// many points. Zero disables the test.
    pub min_cells: i64,
    /// Upper bound on the number of regions; division stops before
    /// exceeding it. Zero means unbounded.
    pub number_of_regions_or_less: i64,
    /// Lower bound on the number of regions; division stops once reached.
    /// Zero means no target.
    pub number_of_regions_or_more: i64,
    /// Maximum tree depth.
    pub max_level: usize,
    /// Region-to-process assignment policy applied after the build.
    pub assignment: RegionAssignment,
    /// Emit event timings through `log::debug!`.
    pub timing: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            valid_directions: ALL_DIRECTIONS,
            min_cells: 100,
            number_of_regions_or_less: 0,
            number_of_regions_or_more: 0,
            max_level: 20,
            assignment: RegionAssignment::default(),
            timing: false,
        }
    }
}

impl BuildConfig {
    /// Encode the scalar tunables for the parameter agreement broadcast.
    pub(crate) fn encode(&self) -> [i64; 7] {
        [
            self.valid_directions as i64,
            self.min_cells,
            self.number_of_regions_or_less,
            self.number_of_regions_or_more,
            self.max_level as i64,
            self.assignment.encode(),
            self.timing as i64,
        ]
    }

    pub(crate) fn decode(params: &[i64; 7]) -> Self {
        Self {
            valid_directions: params[0] as u8,
            min_cells: params[1],
            number_of_regions_or_less: params[2],
            number_of_regions_or_more: params[3],
            max_level: params[4] as usize,
            assignment: RegionAssignment::decode(params[5]),
            timing: params[6] != 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_config_roundtrip() {
        let config = BuildConfig {
            valid_directions: 0b101,
            min_cells: 4,
            number_of_regions_or_less: 8,
            number_of_regions_or_more: 2,
            max_level: 12,
            assignment: RegionAssignment::RoundRobin,
            timing: true,
        };

        let decoded = BuildConfig::decode(&config.encode());

        assert_eq!(decoded.valid_directions, config.valid_directions);
        assert_eq!(decoded.min_cells, config.min_cells);
        assert_eq!(
            decoded.number_of_regions_or_less,
            config.number_of_regions_or_less
        );
        assert_eq!(
            decoded.number_of_regions_or_more,
            config.number_of_regions_or_more
        );
        assert_eq!(decoded.max_level, config.max_level);
        assert_eq!(decoded.assignment, config.assignment);
        assert!(decoded.timing);
    }

    #[test]
    fn test_assignment_encoding() {
        for policy in [
            RegionAssignment::None,
            RegionAssignment::Contiguous,
            RegionAssignment::UserDefined,
            RegionAssignment::RoundRobin,
        ] {
            assert_eq!(RegionAssignment::decode(policy.encode()), policy);
        }
    }
}

use thiserror::Error;

use crate::feature_set::Location;

/// Errors reported by detection, matching and estimation.
///
/// Capacity exhaustion during detection is not an error: the feature set is truncated and a
/// warning is logged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SiftError {
    #[error("failed to allocate {bytes} bytes of temporary memory")]
    AllocationFailed { bytes: usize },

    #[error("temporary memory holds {available} floats but {required} are required")]
    TempMemoryTooSmall { required: usize, available: usize },

    #[error("image of {width}x{height} pixels is too small to build a single octave")]
    ImageTooSmall { width: u32, height: u32 },

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("feature set has no up to date copy on the {0}")]
    NotResident(Location),

    #[error("need at least {required} usable correspondences, found {found}")]
    NotEnoughCorrespondences { found: usize, required: usize },

    #[error("all {trials} sampled models were degenerate")]
    DegenerateFit { trials: usize },
}

//! User-facing errors.
//!
//! Only configuration and I/O problems surface as errors; violations of
//! the tree invariants are bugs and fail hard through assertions.

use thiserror::Error;

use crate::grid::Real;

/// Errors the drivers report before or after the computation proper.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The input file does not exist or cannot be read.
    #[error("cannot read input {0}")]
    UnreadableInput(String),

    /// The integral threshold must be at least as restrictive as the
    /// component threshold.
    #[error("bad integral threshold: theta = {theta} against rho = {rho}")]
    BadIntegralThreshold {
        /// Integral threshold.
        theta: Real,
        /// Component threshold.
        rho: Real,
    },

    /// The requested block count does not tile the domain.
    #[error("{nblocks} blocks cannot tile the domain {shape}")]
    BadDecomposition {
        /// Requested number of blocks.
        nblocks: i64,
        /// Domain shape.
        shape: String,
    },

    /// Output could not be written.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Check the threshold pair the way the connected-components driver does
/// at option parsing: for superlevel sweeps theta must not be below rho,
/// for sublevel sweeps not above.
pub fn validate_thresholds(rho: Real, theta: Real, negate: bool) -> Result<(), TopologyError> {
    if (negate && theta < rho) || (!negate && theta > rho) {
        Err(TopologyError::BadIntegralThreshold { theta, rho })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_threshold_validation() {
        assert!(validate_thresholds(0.5, 0.7, true).is_ok());
        assert!(validate_thresholds(0.5, 0.3, true).is_err());
        assert!(validate_thresholds(0.5, 0.3, false).is_ok());
        assert!(validate_thresholds(0.5, 0.7, false).is_err());
    }
}

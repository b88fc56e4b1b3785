//! Error type shared by the detection and segmentation routines.

use thiserror::Error;

/// Errors raised before any processing starts. No partial output is ever
/// produced alongside one of these.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TreesegError {
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("coordinate arrays differ in length (x={x}, y={y}, z={z})")]
    LengthMismatch { x: usize, y: usize, z: usize },

    #[error("point {index} has a non-finite coordinate")]
    NonFiniteCoordinate { index: usize },
}

impl TreesegError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        TreesegError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    /// True for every variant: all of them describe malformed caller input.
    pub fn is_invalid_parameter(&self) -> bool {
        matches!(
            self,
            TreesegError::InvalidParameter { .. }
                | TreesegError::LengthMismatch { .. }
                | TreesegError::NonFiniteCoordinate { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TreesegError>;

/// Fails unless `value` is finite and strictly positive.
pub(crate) fn require_positive(name: &'static str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(TreesegError::invalid(
            name,
            format!("must be finite and > 0, got {}", value),
        ))
    }
}

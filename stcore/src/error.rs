//! Error types for spatial scoring.
//!
//! Structural problems (empty inputs, mismatched spot sets, malformed thresholds) are fatal and
//! surface immediately. Missing genes are reported through [`SpatialError::MissingGene`] but only
//! collected, never propagated out of a batch.

use thiserror::Error;

/// Unified error type for all core operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpatialError {
    /// None of the supplied coordinate sources yielded usable coordinates.
    #[error("no usable spatial coordinates: {0}")]
    MissingCoordinates(String),

    /// A coordinate table with zero spots was handed to an index build.
    #[error("coordinate table is empty")]
    EmptyCoordinates,

    /// A zero-length input where at least one spot is required.
    #[error("empty input: {what}")]
    EmptyInput { what: String },

    /// Threshold band with `minval > maxval` or non-finite bounds.
    #[error("malformed threshold band [{minval}, {maxval}]")]
    InvalidThreshold { minval: f64, maxval: f64 },

    /// Two tables disagree on their spot set or shape.
    #[error("dimension mismatch in {table}: {detail}")]
    DimensionMismatch { table: String, detail: String },

    /// A ligand or receptor gene is absent from the expression table.
    #[error("gene '{gene}' not found in expression table")]
    MissingGene { gene: String },

    /// The same spot identity appears twice in one table.
    #[error("duplicate spot id '{id}'")]
    DuplicateSpot { id: String },

    /// A tuning parameter is out of its valid range.
    #[error("invalid parameter {name}: {detail}")]
    InvalidParameter { name: String, detail: String },
}

impl SpatialError {
    pub fn empty(what: impl Into<String>) -> Self {
        SpatialError::EmptyInput { what: what.into() }
    }

    pub fn mismatch(table: impl Into<String>, detail: impl Into<String>) -> Self {
        SpatialError::DimensionMismatch {
            table: table.into(),
            detail: detail.into(),
        }
    }

    pub fn parameter(name: impl Into<String>, detail: impl Into<String>) -> Self {
        SpatialError::InvalidParameter {
            name: name.into(),
            detail: detail.into(),
        }
    }

    /// True for errors that a batch recovers from locally.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SpatialError::MissingGene { .. })
    }
}

pub type Result<T> = std::result::Result<T, SpatialError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offender() {
        let e = SpatialError::mismatch("labels", "spot 'AAAC-1' not in coordinate table");
        assert!(e.to_string().contains("labels"));
        assert!(e.to_string().contains("AAAC-1"));

        let e = SpatialError::MissingGene { gene: "CXCL13".into() };
        assert!(e.to_string().contains("CXCL13"));

        let e = SpatialError::InvalidThreshold { minval: f64::NAN, maxval: 0.8 };
        assert_eq!(e.to_string(), "malformed threshold band [NaN, 0.8]");
    }

    #[test]
    fn test_only_missing_gene_is_recoverable() {
        assert!(SpatialError::MissingGene { gene: "X".into() }.is_recoverable());
        assert!(!SpatialError::EmptyCoordinates.is_recoverable());
        assert!(!SpatialError::InvalidThreshold { minval: 1.0, maxval: 0.0 }.is_recoverable());
    }
}

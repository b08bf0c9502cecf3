//! Error types for layer queries.

use std::sync::Arc;

use crate::feature::FeatureId;
use crate::layer::LayerKind;
use crate::LayerId;

/// Recoverable errors returned by layer queries and graph wiring.
///
/// Missing data (no domain features, no section layers, an unresolvable scalar
/// field) is not an error: those queries return empty results instead.
/// Violations of the graph contract (querying a removed layer, re-entering a
/// layer that is already being evaluated) panic rather than return an error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LayerError {
    /// A reconstruct strategy failed for a feature.
    ///
    /// The cache entry for the request is left absent so the next query
    /// retries from scratch.
    #[error("failed to reconstruct feature {feature_id}: {cause}")]
    Reconstruction {
        /// Feature whose reconstruction failed.
        feature_id: FeatureId,
        /// Error reported by the strategy.
        cause: Arc<anyhow::Error>,
    },

    /// A time range could not be discretised into at least one slot.
    #[error("invalid time range (begin {begin}, end {end}, increment {increment})")]
    InvalidTimeRange {
        /// Requested begin time.
        begin: f64,
        /// Requested end time.
        end: f64,
        /// Requested slot increment.
        increment: f64,
    },

    /// A layer parameter is out of range.
    #[error("invalid {name} {value}: {expected}")]
    InvalidParameter {
        /// Name of the parameter.
        name: &'static str,
        /// Rejected value.
        value: f64,
        /// Values that are accepted.
        expected: &'static str,
    },

    /// The layer exists but is not of the kind the operation requires.
    #[error("layer {layer} is a {found:?} layer, expected {expected:?}")]
    UnexpectedLayerKind {
        /// Layer that was addressed.
        layer: LayerId,
        /// Kind the operation requires.
        expected: LayerKind,
        /// Kind of the addressed layer.
        found: LayerKind,
    },

    /// A layer cannot be connected to the given input slot.
    #[error("layer {input} ({kind:?}) cannot be used as {slot} input of layer {layer}")]
    IncompatibleInput {
        /// Layer whose input was being wired.
        layer: LayerId,
        /// Layer offered as input.
        input: LayerId,
        /// Kind of the offered input.
        kind: LayerKind,
        /// Name of the input slot.
        slot: &'static str,
    },
}

impl LayerError {
    /// Wrap a strategy error for `feature_id`.
    pub fn reconstruction(feature_id: FeatureId, err: impl Into<anyhow::Error>) -> Self {
        LayerError::Reconstruction {
            feature_id,
            cause: Arc::new(err.into()),
        }
    }

    /// Attempts to downcast a reconstruction failure to a specific error type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        match self {
            LayerError::Reconstruction { cause, .. } => cause.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = LayerError> = std::result::Result<T, E>;

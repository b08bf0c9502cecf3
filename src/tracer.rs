//! Tracer trait for observing layer evaluation.
//!
//! The graph reports cache hits and misses, invalidations and time-span
//! builds to a [`Tracer`]. The default [`NoopTracer`] ignores everything.
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use layer_flow::{LayerGraph, LayerId, Tracer, TracerRequestKey};
//!
//! #[derive(Default)]
//! struct MissCounter(AtomicUsize);
//!
//! impl Tracer for MissCounter {
//!     fn on_cache_miss(&self, _layer: LayerId, _key: &TracerRequestKey) {
//!         self.0.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//!
//! let counter = Arc::new(MissCounter::default());
//! let graph = LayerGraph::builder().tracer(counter.clone()).build();
//! # let _ = graph;
//! ```

use crate::graph::LayerId;
use crate::time_span::TimeSpanReuse;

/// A layer request described for tracing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TracerRequestKey {
    /// Query name (e.g. "reconstructed_feature_geometries").
    pub query: &'static str,
    /// Debug representation of the (time, params) key.
    pub key_debug: String,
}

impl TracerRequestKey {
    /// Create a new tracer request key.
    #[inline]
    pub fn new(query: &'static str, key_debug: impl Into<String>) -> Self {
        Self {
            query,
            key_debug: key_debug.into(),
        }
    }
}

/// Reason a layer's caches were dropped and its token invalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationReason {
    /// An input layer's subject token changed.
    InputChanged {
        /// The input that changed.
        input: LayerId,
    },
    /// Inputs were connected or disconnected.
    InputsRewired,
    /// Request parameters were replaced.
    ParamsChanged,
    /// A feature collection was added, removed or edited.
    FeatureCollectionsChanged,
    /// The rotation model or anchor plate changed.
    RotationModelChanged,
}

/// Tracer trait for observing layer evaluation.
///
/// All methods have default empty implementations, so you only need to override
/// the events you're interested in.
pub trait Tracer: Send + Sync + 'static {
    /// Called when a request was answered from a layer's cache.
    #[inline]
    fn on_cache_hit(&self, _layer: LayerId, _key: &TracerRequestKey) {}

    /// Called when a request has to be computed.
    #[inline]
    fn on_cache_miss(&self, _layer: LayerId, _key: &TracerRequestKey) {}

    /// Called when a layer drops its caches and invalidates its token.
    #[inline]
    fn on_layer_invalidated(&self, _layer: LayerId, _reason: &InvalidationReason) {}

    /// Called after a time-span table was built.
    #[inline]
    fn on_time_span_built(&self, _layer: LayerId, _reuse: TimeSpanReuse) {}

    /// Called when a topology layer refuses or skips a section input to avoid a cycle.
    #[inline]
    fn on_cyclic_input_skipped(&self, _layer: LayerId, _input: LayerId) {}
}

/// Tracer that discards all events.
///
/// This is the default tracer for [`LayerGraph`](crate::LayerGraph).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingTracer {
        hits: AtomicUsize,
        misses: AtomicUsize,
    }

    impl Tracer for CountingTracer {
        fn on_cache_hit(&self, _layer: LayerId, _key: &TracerRequestKey) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }

        fn on_cache_miss(&self, _layer: LayerId, _key: &TracerRequestKey) {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_counting_tracer() {
        let tracer = CountingTracer::default();
        let layer = LayerId::new(0, 1);
        let key = TracerRequestKey::new("test", "(10Ma, ())");

        tracer.on_cache_miss(layer, &key);
        tracer.on_cache_hit(layer, &key);
        tracer.on_cache_hit(layer, &key);

        assert_eq!(tracer.hits.load(Ordering::Relaxed), 2);
        assert_eq!(tracer.misses.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_tracer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopTracer>();
        assert_send_sync::<Arc<CountingTracer>>();
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{LayerError, Result};
use crate::feature::{Feature, FeatureId};
use crate::layer::ReconstructedFeatureGeometry;

use super::{ReconstructMethod, ReconstructMethodRegistry, ReconstructParams, ReconstructRequest};

/// A reconstruct context shared between cache entries.
pub type SharedReconstructContext = Arc<Mutex<ReconstructContext>>;

#[derive(Debug)]
struct FeatureMethod {
    feature_id: FeatureId,
    method_name: &'static str,
    method: Box<dyn ReconstructMethod>,
}

/// Strategy instances for every feature of a layer under one set of params.
#[derive(Debug)]
pub struct ReconstructContext {
    params: ReconstructParams,
    methods: Vec<FeatureMethod>,
}

impl ReconstructContext {
    /// Pick a strategy for each feature and create its instance.
    ///
    /// Features no strategy accepts are left out.
    pub fn new(
        params: ReconstructParams,
        features: &[Feature],
        registry: &ReconstructMethodRegistry,
    ) -> Self {
        let methods = features
            .iter()
            .filter_map(|feature| {
                let Some(method_type) = registry.select(feature, &params) else {
                    tracing::debug!(feature = %feature.id(), "no reconstruct method accepts feature");
                    return None;
                };
                Some(FeatureMethod {
                    feature_id: feature.id(),
                    method_name: method_type.name(),
                    method: method_type.create(feature, &params),
                })
            })
            .collect();
        Self { params, methods }
    }

    /// Params this context was created for.
    pub fn params(&self) -> &ReconstructParams {
        &self.params
    }

    /// Returns true if the context reconstructs using topologies.
    pub fn uses_topologies(&self) -> bool {
        self.params.reconstruct_using_topologies
    }

    /// Number of features with a strategy.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Returns true if no feature has a strategy.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// `(feature, strategy name)` for every feature in the context.
    pub fn method_names(&self) -> impl Iterator<Item = (FeatureId, &'static str)> + '_ {
        self.methods.iter().map(|m| (m.feature_id, m.method_name))
    }

    /// Run every feature's strategy.
    ///
    /// Stops at the first failing feature.
    pub fn reconstruct(
        &mut self,
        request: &ReconstructRequest<'_>,
    ) -> Result<Vec<ReconstructedFeatureGeometry>> {
        let mut output = Vec::with_capacity(self.methods.len());
        for feature in &mut self.methods {
            let geometries = feature
                .method
                .reconstruct(request)
                .map_err(|err| LayerError::reconstruction(feature.feature_id, err))?;
            output.extend(geometries);
        }
        Ok(output)
    }
}

/// Reconstruct contexts of one layer, keyed by params and held weakly.
///
/// Cache entries hold the strong references, so a context lives exactly as
/// long as some cached result computed with it.
#[derive(Debug, Default)]
pub struct ReconstructContextTable {
    contexts: HashMap<ReconstructParams, Weak<Mutex<ReconstructContext>>>,
}

impl ReconstructContextTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The live context for `params`, or a new one from `create`.
    ///
    /// # Panics
    ///
    /// Panics if `params` reconstruct using topologies and the layer does not,
    /// or the other way round.
    pub fn get_or_create(
        &mut self,
        params: &ReconstructParams,
        layer_uses_topologies: bool,
        create: impl FnOnce() -> ReconstructContext,
    ) -> SharedReconstructContext {
        self.contexts.retain(|_, weak| weak.strong_count() > 0);
        assert_eq!(
            params.reconstruct_using_topologies, layer_uses_topologies,
            "reconstruct context mode does not match the layer's current reconstruct mode"
        );

        if let Some(context) = self.contexts.get(params).and_then(Weak::upgrade) {
            return context;
        }
        let context = Arc::new(Mutex::new(create()));
        self.contexts.insert(*params, Arc::downgrade(&context));
        context
    }

    /// Number of contexts still alive.
    pub fn live_count(&self) -> usize {
        self.contexts
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Forget every context.
    ///
    /// Contexts still held by cache entries stay alive until those entries go.
    pub fn clear(&mut self) {
        self.contexts.clear();
    }
}

use std::sync::Arc;

use crate::cache::BoundedCache;
use crate::error::Result;
use crate::feature::{Feature, FeatureId, FeatureKind, PlateId, WeakFeatureCollections};
use crate::geometry::{DeferredGeometry, Geometry};
use crate::graph::{LayerGraph, LayerGraphConfig, LayerId};
use crate::reconstruct::{
    ReconstructContext, ReconstructContextTable, ReconstructMethodRegistry, ReconstructParams,
    ReconstructRequest, SharedReconstructContext, TopologyTimeSpans,
};
use crate::spatial::{SpatialPartition, SpatialPartitionBuilder};
use crate::time::GeoTime;
use crate::token::ReconstructHandle;
use crate::tracer::InvalidationReason;

use super::{input_layers, poll_inputs, remove_input, InputLayer, LayerKind, LayerNode, ProxyCore};

/// One reconstructed geometry of a feature.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructedFeatureGeometry {
    /// Feature the geometry belongs to.
    pub feature_id: FeatureId,
    /// Plate that carried the geometry.
    pub plate_id: PlateId,
    /// The geometry at the reconstruction time, possibly not yet rotated.
    pub geometry: DeferredGeometry,
}

/// Everything a reconstruct layer produced for one (time, params) request.
#[derive(Debug)]
pub struct ReconstructedGeometries {
    reconstruct_handle: ReconstructHandle,
    time: f64,
    geometries: Vec<ReconstructedFeatureGeometry>,
}

impl ReconstructedGeometries {
    pub(crate) fn new(time: f64, geometries: Vec<ReconstructedFeatureGeometry>) -> Self {
        Self {
            reconstruct_handle: ReconstructHandle::next(),
            time,
            geometries,
        }
    }

    /// Pass that produced these geometries.
    pub fn reconstruct_handle(&self) -> ReconstructHandle {
        self.reconstruct_handle
    }

    /// Reconstruction time.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// All reconstructed geometries.
    pub fn geometries(&self) -> &[ReconstructedFeatureGeometry] {
        &self.geometries
    }

    /// Iterate over the reconstructed geometries.
    pub fn iter(&self) -> std::slice::Iter<'_, ReconstructedFeatureGeometry> {
        self.geometries.iter()
    }

    /// Number of reconstructed geometries.
    pub fn len(&self) -> usize {
        self.geometries.len()
    }

    /// Returns true if nothing was reconstructed.
    pub fn is_empty(&self) -> bool {
        self.geometries.is_empty()
    }

    /// Geometries of one feature.
    pub fn feature(&self, feature_id: FeatureId) -> impl Iterator<Item = &ReconstructedFeatureGeometry> {
        self.geometries
            .iter()
            .filter(move |rfg| rfg.feature_id == feature_id)
    }
}

/// Reconstructed geometries indexed by position.
pub type ReconstructedSpatialPartition = SpatialPartition<ReconstructedFeatureGeometry>;

/// A feature's geometry at present day.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentDayGeometry {
    /// Feature the geometry belongs to.
    pub feature_id: FeatureId,
    /// Reconstruction plate id, if any.
    pub plate_id: Option<PlateId>,
    /// Present-day geometry.
    pub geometry: Arc<Geometry>,
}

type RequestKey = (GeoTime, ReconstructParams);

/// A cache entry keeps the context it was computed with alive.
#[derive(Clone)]
struct CachedReconstruction {
    geometries: Arc<ReconstructedGeometries>,
    _context: Option<SharedReconstructContext>,
}

fn is_reconstructable(feature: &Feature) -> bool {
    matches!(feature.kind(), FeatureKind::Reconstructable)
}

/// Reconstructs features to requested times.
pub(crate) struct ReconstructLayer {
    core: ProxyCore,
    registry: Arc<ReconstructMethodRegistry>,
    features: WeakFeatureCollections,
    reconstruction: Option<InputLayer>,
    topology_surfaces: Vec<InputLayer>,
    params: ReconstructParams,
    cache: BoundedCache<RequestKey, CachedReconstruction>,
    partitions: BoundedCache<RequestKey, (ReconstructHandle, Arc<ReconstructedSpatialPartition>)>,
    contexts: ReconstructContextTable,
    present_day: Option<Arc<Vec<PresentDayGeometry>>>,
    cache_capacity: usize,
    topology_cache_capacity: usize,
    partition_depth: u32,
}

impl ReconstructLayer {
    pub(crate) fn new(
        core: ProxyCore,
        registry: Arc<ReconstructMethodRegistry>,
        config: &LayerGraphConfig,
    ) -> Self {
        Self {
            core,
            registry,
            features: WeakFeatureCollections::default(),
            reconstruction: None,
            topology_surfaces: Vec::new(),
            params: ReconstructParams::default(),
            cache: BoundedCache::new(config.cache_capacity),
            partitions: BoundedCache::new(config.cache_capacity),
            contexts: ReconstructContextTable::new(),
            present_day: None,
            cache_capacity: config.cache_capacity,
            topology_cache_capacity: config.topology_cache_capacity,
            partition_depth: config.spatial_partition_depth,
        }
    }

    fn uses_topologies(&self) -> bool {
        self.params.reconstruct_using_topologies
    }

    fn effective_capacity(&self) -> usize {
        if self.uses_topologies() {
            self.topology_cache_capacity
        } else {
            self.cache_capacity
        }
    }

    pub(crate) fn params(&self) -> ReconstructParams {
        self.params
    }

    /// Replace the current params.
    ///
    /// Switching in or out of topology mode drops every cache and resizes the
    /// result cache; other changes keep the entries, which are keyed by params.
    pub(crate) fn set_params(&mut self, params: ReconstructParams) {
        if params == self.params {
            return;
        }
        let mode_changed = params.reconstruct_using_topologies != self.uses_topologies();
        self.params = params;
        if mode_changed {
            self.clear_caches();
            let capacity = self.effective_capacity();
            self.cache.set_capacity(capacity);
        }
        self.core.invalidate(InvalidationReason::ParamsChanged);
    }

    pub(crate) fn set_reconstruction_input(&mut self, input: Option<LayerId>) {
        self.reconstruction = input.map(InputLayer::new);
        self.invalidate(InvalidationReason::InputsRewired);
    }

    pub(crate) fn set_topology_surface_inputs(&mut self, inputs: &[LayerId]) {
        self.topology_surfaces = input_layers(inputs);
        self.invalidate(InvalidationReason::InputsRewired);
    }

    /// Geometries at `time` with the current params. Populates the result cache.
    pub(crate) fn reconstructed_feature_geometries(
        &mut self,
        graph: &mut LayerGraph,
        time: f64,
    ) -> Result<Arc<ReconstructedGeometries>> {
        let params = self.params;
        self.reconstructed_feature_geometries_with_params(graph, time, &params)
    }

    /// Geometries at `time` with explicit params. Populates the result cache.
    pub(crate) fn reconstructed_feature_geometries_with_params(
        &mut self,
        graph: &mut LayerGraph,
        time: f64,
        params: &ReconstructParams,
    ) -> Result<Arc<ReconstructedGeometries>> {
        self.check_input_layer_proxies(graph);

        let key = (GeoTime::new(time), *params);
        if let Some(cached) = self.cache.get(&key) {
            self.core.cache_hit("reconstructed_feature_geometries", &key);
            return Ok(cached.geometries);
        }
        self.core.cache_miss("reconstructed_feature_geometries", &key);

        let cached = self.reconstruct(graph, time, params)?;
        let geometries = cached.geometries.clone();
        self.cache.insert(key, cached);
        self.core.mark_ready();
        Ok(geometries)
    }

    fn reconstruct(
        &mut self,
        graph: &mut LayerGraph,
        time: f64,
        params: &ReconstructParams,
    ) -> Result<CachedReconstruction> {
        let layer_uses_topologies = self.uses_topologies();
        let (features, registry) = (&self.features, &self.registry);
        let context = self.contexts.get_or_create(params, layer_uses_topologies, || {
            ReconstructContext::new(*params, &features.features(is_reconstructable), registry)
        });

        let Some(reconstruction) = &self.reconstruction else {
            tracing::debug!(layer = %self.core.id, "no reconstruction layer connected");
            return Ok(CachedReconstruction {
                geometries: Arc::new(ReconstructedGeometries::new(time, Vec::new())),
                _context: Some(context),
            });
        };
        let tree = graph.reconstruction_tree(reconstruction.id(), time)?;
        let topologies = if params.reconstruct_using_topologies {
            Some(self.topology_time_spans(graph, params)?)
        } else {
            None
        };

        let geometries = context.lock().reconstruct(&ReconstructRequest {
            time,
            tree: &tree,
            params,
            topologies: topologies.as_ref(),
        })?;
        Ok(CachedReconstruction {
            geometries: Arc::new(ReconstructedGeometries::new(time, geometries)),
            _context: Some(context),
        })
    }

    fn topology_time_spans(
        &self,
        graph: &mut LayerGraph,
        params: &ReconstructParams,
    ) -> Result<TopologyTimeSpans> {
        let range = params.topology_time_range()?;
        let mut spans = TopologyTimeSpans {
            range,
            boundaries: Vec::new(),
            networks: Vec::new(),
        };
        for surface in &self.topology_surfaces {
            match graph.layer_kind(surface.id()) {
                Some(LayerKind::TopologyBoundaryResolver) => spans
                    .boundaries
                    .push(graph.resolved_boundary_time_span(surface.id(), range)?),
                Some(LayerKind::TopologyNetworkResolver) => spans
                    .networks
                    .push(graph.resolved_network_time_span(surface.id(), range)?),
                _ => {}
            }
        }
        Ok(spans)
    }

    /// Spatial partition of the geometries at `time` with the current params.
    /// Populates the result and partition caches.
    pub(crate) fn reconstructed_spatial_partition(
        &mut self,
        graph: &mut LayerGraph,
        time: f64,
    ) -> Result<Arc<ReconstructedSpatialPartition>> {
        let geometries = self.reconstructed_feature_geometries(graph, time)?;
        let key = (GeoTime::new(time), self.params);
        if let Some((handle, partition)) = self.partitions.get(&key) {
            if handle == geometries.reconstruct_handle() {
                self.core.cache_hit("reconstructed_spatial_partition", &key);
                return Ok(partition);
            }
        }
        self.core.cache_miss("reconstructed_spatial_partition", &key);

        let mut builder = SpatialPartitionBuilder::new(self.partition_depth);
        for rfg in geometries.iter() {
            builder.add(rfg.clone(), rfg.geometry.clone());
        }
        let partition = Arc::new(builder.build());
        self.partitions
            .insert(key, (geometries.reconstruct_handle(), partition.clone()));
        Ok(partition)
    }

    /// Present-day geometry of every reconstructable feature. Populates the
    /// present-day cache.
    pub(crate) fn present_day_geometries(&mut self) -> Arc<Vec<PresentDayGeometry>> {
        if let Some(present_day) = &self.present_day {
            return present_day.clone();
        }
        let geometries: Vec<PresentDayGeometry> = self
            .features
            .features(is_reconstructable)
            .into_iter()
            .map(|feature| PresentDayGeometry {
                feature_id: feature.id(),
                plate_id: feature.plate_id(),
                geometry: feature.geometry().clone(),
            })
            .collect();
        let present_day = Arc::new(geometries);
        self.present_day = Some(present_day.clone());
        present_day
    }

    pub(crate) fn live_context_count(&self) -> usize {
        self.contexts.live_count()
    }
}

impl LayerNode for ReconstructLayer {
    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProxyCore {
        &mut self.core
    }

    fn check_input_layer_proxies(&mut self, graph: &mut LayerGraph) {
        let changed = poll_inputs(graph, self.reconstruction.iter_mut());
        // Topology surfaces are only a dependency while reconstructing using topologies.
        let topology_changed = if self.uses_topologies() {
            poll_inputs(graph, self.topology_surfaces.iter_mut())
        } else {
            None
        };
        if let Some(input) = changed.or(topology_changed) {
            self.invalidate(InvalidationReason::InputChanged { input });
        }
    }

    fn clear_caches(&mut self) {
        self.cache.clear();
        self.partitions.clear();
        self.contexts.clear();
        self.present_day = None;
    }

    fn input_ids(&self) -> Vec<LayerId> {
        self.reconstruction
            .iter()
            .chain(&self.topology_surfaces)
            .map(InputLayer::id)
            .collect()
    }

    fn disconnect_input(&mut self, input: LayerId) -> bool {
        let was_reconstruction = self
            .reconstruction
            .as_ref()
            .is_some_and(|r| r.id() == input);
        if was_reconstruction {
            self.reconstruction = None;
        }
        remove_input(&mut self.topology_surfaces, input) || was_reconstruction
    }

    fn feature_collections_mut(&mut self) -> Option<&mut WeakFeatureCollections> {
        Some(&mut self.features)
    }

    fn apply_config(&mut self, config: &LayerGraphConfig) {
        self.cache_capacity = config.cache_capacity;
        self.topology_cache_capacity = config.topology_cache_capacity;
        self.partition_depth = config.spatial_partition_depth;
        let capacity = self.effective_capacity();
        self.cache.set_capacity(capacity);
        self.partitions.set_capacity(config.cache_capacity);
    }
}

//! The layer graph: an arena of layer proxies addressed by [`LayerId`].
//!
//! All wiring, notifications and queries go through [`LayerGraph`]. While a
//! layer is being evaluated its proxy is taken out of the arena, so a layer
//! that (directly or through its inputs) asks itself for a result is detected
//! immediately.

use std::fmt;
use std::sync::Arc;

use slab::Slab;

use crate::error::{LayerError, Result};
use crate::feature::{FeatureCollection, PlateId};
use crate::layer::{
    CrossSections, LayerKind, LayerProxy, LayerState, PresentDayGeometry, ProxyCore,
    ReconstructLayer, ReconstructedGeometries, ReconstructedSpatialPartition,
    ReconstructionLayer, ResolvedScalarField, ResolvedTopologicalBoundaries,
    ResolvedTopologicalNetworks, ScalarFieldLayer, ScalarFieldStatistics, TopologyBoundaryLayer,
    TopologyNetworkLayer, TopologyNetworkParams, VelocityFields, VelocityLayer, VelocityParams,
};
use crate::reconstruct::{ReconstructMethodRegistry, ReconstructMethodType, ReconstructParams};
use crate::rotation::{ReconstructionTree, RotationModel};
use crate::spatial::{DEFAULT_MAX_DEPTH, MAX_DEPTH_LIMIT};
use crate::time::TimeRange;
use crate::time_span::TimeSpanTable;
use crate::token::ChangeToken;
use crate::tracer::{InvalidationReason, NoopTracer, Tracer};

/// Identifies a layer in a [`LayerGraph`].
///
/// Ids are never reused: a layer created after another was removed gets a new
/// generation even if it occupies the same arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LayerId {
    index: u32,
    generation: u32,
}

impl LayerId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Arena slot of the layer.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Generation distinguishing layers that shared the slot.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// Settings shared by every layer of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LayerGraphConfig {
    /// Entries kept per result cache.
    pub cache_capacity: usize,
    /// Result cache capacity of reconstruct layers while they reconstruct
    /// using topologies.
    pub topology_cache_capacity: usize,
    /// Maximum quad-tree depth of spatial partitions, at most [`MAX_DEPTH_LIMIT`].
    pub spatial_partition_depth: u32,
}

impl LayerGraphConfig {
    fn clamped(self) -> Self {
        Self {
            spatial_partition_depth: self.spatial_partition_depth.min(MAX_DEPTH_LIMIT),
            ..self
        }
    }
}

impl Default for LayerGraphConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 16,
            topology_cache_capacity: 1,
            spatial_partition_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`LayerGraph`] with customizable settings.
///
/// # Example
///
/// ```
/// use layer_flow::LayerGraph;
///
/// let graph = LayerGraph::builder()
///     .cache_capacity(32)
///     .spatial_partition_depth(4)
///     .build();
/// assert_eq!(graph.config().cache_capacity, 32);
/// ```
pub struct LayerGraphBuilder {
    config: LayerGraphConfig,
    registry: ReconstructMethodRegistry,
    tracer: Arc<dyn Tracer>,
}

impl Default for LayerGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerGraphBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: LayerGraphConfig::default(),
            registry: ReconstructMethodRegistry::default(),
            tracer: Arc::new(NoopTracer),
        }
    }

    /// Replace every setting at once.
    pub fn config(mut self, config: LayerGraphConfig) -> Self {
        self.config = config;
        self
    }

    /// Entries kept per result cache.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    /// Result cache capacity of reconstruct layers that reconstruct using topologies.
    pub fn topology_cache_capacity(mut self, capacity: usize) -> Self {
        self.config.topology_cache_capacity = capacity;
        self
    }

    /// Maximum quad-tree depth of spatial partitions, clamped to [`MAX_DEPTH_LIMIT`].
    pub fn spatial_partition_depth(mut self, depth: u32) -> Self {
        self.config.spatial_partition_depth = depth;
        self
    }

    /// Add a reconstruct strategy, tried before the built-in ones.
    pub fn register_reconstruct_method(
        mut self,
        method_type: impl ReconstructMethodType + 'static,
    ) -> Self {
        self.registry.register(method_type);
        self
    }

    /// Set the tracer receiving cache and invalidation events.
    pub fn tracer<T: Tracer>(mut self, tracer: Arc<T>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Build the graph.
    pub fn build(self) -> LayerGraph {
        LayerGraph {
            slots: Slab::new(),
            next_generation: 0,
            config: self.config.clamped(),
            registry: Arc::new(self.registry),
            tracer: self.tracer,
        }
    }
}

// ============================================================================
// Graph
// ============================================================================

struct LayerSlot {
    generation: u32,
    kind: LayerKind,
    reconstructs_using_topologies: bool,
    /// `None` while the layer is being evaluated.
    proxy: Option<Box<LayerProxy>>,
}

/// Owns every layer proxy and routes wiring, notifications and queries.
///
/// Query methods take `&mut self` because they populate caches.
///
/// # Panics
///
/// Every method taking a [`LayerId`] panics if that layer has been removed.
/// Queries panic if a layer ends up requesting its own result through its
/// inputs.
pub struct LayerGraph {
    slots: Slab<LayerSlot>,
    next_generation: u32,
    config: LayerGraphConfig,
    registry: Arc<ReconstructMethodRegistry>,
    tracer: Arc<dyn Tracer>,
}

impl Default for LayerGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LayerGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerGraph")
            .field("layers", &self.layer_ids())
            .field("config", &self.config)
            .field("reconstruct_methods", &self.registry.names())
            .finish_non_exhaustive()
    }
}

impl LayerGraph {
    /// Create an empty graph with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for customizing the graph.
    pub fn builder() -> LayerGraphBuilder {
        LayerGraphBuilder::new()
    }

    /// Current settings.
    pub fn config(&self) -> &LayerGraphConfig {
        &self.config
    }

    fn slot(&self, id: LayerId) -> Option<&LayerSlot> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    fn slot_mut(&mut self, id: LayerId) -> Option<&mut LayerSlot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    fn live_slot_mut(&mut self, id: LayerId) -> &mut LayerSlot {
        match self.slot_mut(id) {
            Some(slot) => slot,
            None => panic!("layer {id} has been removed from the graph"),
        }
    }

    fn take_proxy(&mut self, id: LayerId) -> Box<LayerProxy> {
        match self.live_slot_mut(id).proxy.take() {
            Some(proxy) => proxy,
            None => panic!("cyclic layer dependency: layer {id} is already being evaluated"),
        }
    }

    fn proxy_mut(&mut self, id: LayerId) -> &mut LayerProxy {
        match self.live_slot_mut(id).proxy.as_deref_mut() {
            Some(proxy) => proxy,
            None => panic!("cyclic layer dependency: layer {id} is already being evaluated"),
        }
    }

    fn proxy(&self, id: LayerId) -> &LayerProxy {
        let Some(slot) = self.slot(id) else {
            panic!("layer {id} has been removed from the graph");
        };
        match slot.proxy.as_deref() {
            Some(proxy) => proxy,
            None => panic!("cyclic layer dependency: layer {id} is already being evaluated"),
        }
    }

    /// Run `f` with the proxy taken out of its slot.
    fn with_layer<R>(
        &mut self,
        id: LayerId,
        f: impl FnOnce(&mut LayerProxy, &mut LayerGraph) -> R,
    ) -> R {
        let mut proxy = self.take_proxy(id);
        proxy.prune_expired_feature_collections();
        let result = f(&mut *proxy, self);
        if let Some(slot) = self.slot_mut(id) {
            slot.proxy = Some(proxy);
        }
        result
    }

    fn insert_layer(
        &mut self,
        kind: LayerKind,
        create: impl FnOnce(ProxyCore) -> LayerProxy,
    ) -> LayerId {
        self.next_generation += 1;
        let generation = self.next_generation;
        let entry = self.slots.vacant_entry();
        let id = LayerId::new(entry.key() as u32, generation);
        let proxy = create(ProxyCore::new(id, self.tracer.clone()));
        debug_assert_eq!(proxy.kind(), kind);
        entry.insert(LayerSlot {
            generation,
            kind,
            reconstructs_using_topologies: false,
            proxy: Some(Box::new(proxy)),
        });
        tracing::debug!(layer = %id, ?kind, "created layer");
        id
    }

    // ------------------------------------------------------------------------
    // Layers
    // ------------------------------------------------------------------------

    /// Add a layer building reconstruction trees from `rotation_model`.
    pub fn add_reconstruction_layer(&mut self, rotation_model: Arc<dyn RotationModel>) -> LayerId {
        let config = self.config;
        self.insert_layer(LayerKind::Reconstruction, |core| {
            LayerProxy::Reconstruction(ReconstructionLayer::new(core, rotation_model, &config))
        })
    }

    /// Add a layer reconstructing feature geometries.
    pub fn add_reconstruct_layer(&mut self) -> LayerId {
        let (config, registry) = (self.config, self.registry.clone());
        self.insert_layer(LayerKind::Reconstruct, |core| {
            LayerProxy::Reconstruct(ReconstructLayer::new(core, registry, &config))
        })
    }

    /// Add a layer resolving topological boundaries and lines.
    pub fn add_topology_boundary_layer(&mut self) -> LayerId {
        let config = self.config;
        self.insert_layer(LayerKind::TopologyBoundaryResolver, |core| {
            LayerProxy::TopologyBoundaryResolver(TopologyBoundaryLayer::new(core, &config))
        })
    }

    /// Add a layer resolving deforming networks.
    pub fn add_topology_network_layer(&mut self) -> LayerId {
        let config = self.config;
        self.insert_layer(LayerKind::TopologyNetworkResolver, |core| {
            LayerProxy::TopologyNetworkResolver(TopologyNetworkLayer::new(core, &config))
        })
    }

    /// Add a layer calculating velocities.
    pub fn add_velocity_layer(&mut self) -> LayerId {
        let config = self.config;
        self.insert_layer(LayerKind::VelocityFieldCalculator, |core| {
            LayerProxy::VelocityFieldCalculator(VelocityLayer::new(core, &config))
        })
    }

    /// Add a layer resolving scalar fields.
    pub fn add_scalar_field_layer(&mut self) -> LayerId {
        let config = self.config;
        self.insert_layer(LayerKind::ScalarFieldResolver, |core| {
            LayerProxy::ScalarFieldResolver(ScalarFieldLayer::new(core, &config))
        })
    }

    /// Remove a layer, disconnecting it from every layer that used it as input.
    ///
    /// Returns false if the layer was already removed.
    pub fn remove_layer(&mut self, id: LayerId) -> bool {
        if self.slot(id).is_none() {
            return false;
        }
        self.slots.remove(id.index as usize);
        for (_, slot) in self.slots.iter_mut() {
            let Some(proxy) = slot.proxy.as_deref_mut() else {
                continue;
            };
            let node = proxy.node_mut();
            if node.disconnect_input(id) {
                node.invalidate(InvalidationReason::InputsRewired);
            }
        }
        tracing::debug!(layer = %id, "removed layer");
        true
    }

    /// Returns true if the layer has not been removed.
    pub fn contains(&self, id: LayerId) -> bool {
        self.slot(id).is_some()
    }

    /// Kind of the layer, or `None` if it has been removed.
    pub fn layer_kind(&self, id: LayerId) -> Option<LayerKind> {
        self.slot(id).map(|slot| slot.kind)
    }

    /// Lifecycle state of the layer; [`LayerState::Removed`] once it is gone.
    pub fn layer_state(&self, id: LayerId) -> LayerState {
        match self.slot(id) {
            None => LayerState::Removed,
            Some(slot) => slot
                .proxy
                .as_deref()
                .map_or(LayerState::Stale, |proxy| proxy.node().core().state()),
        }
    }

    /// Ids of every layer, in arena order.
    pub fn layer_ids(&self) -> Vec<LayerId> {
        self.slots
            .iter()
            .map(|(index, slot)| LayerId::new(index as u32, slot.generation))
            .collect()
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if the graph has no layers.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Every input layer of `id`, across all of its input slots.
    pub fn inputs(&self, id: LayerId) -> Vec<LayerId> {
        self.proxy(id).node().input_ids()
    }

    /// The layer's subject token, after polling its inputs.
    ///
    /// A consumer holding an observer of this token knows its copy of any
    /// result is out of date once the token no longer matches.
    pub fn subject_token(&mut self, id: LayerId) -> ChangeToken {
        self.with_layer(id, |proxy, graph| proxy.node_mut().subject_token(graph))
    }

    /// Returns true if `id` is a reconstruct layer currently reconstructing
    /// using topologies.
    pub fn reconstructs_using_topologies(&self, id: LayerId) -> bool {
        self.slot(id)
            .is_some_and(|slot| slot.reconstructs_using_topologies)
    }

    // ------------------------------------------------------------------------
    // Wiring
    // ------------------------------------------------------------------------

    fn expect_input_kind(
        &self,
        layer: LayerId,
        input: LayerId,
        allowed: &[LayerKind],
        slot: &'static str,
    ) -> Result<()> {
        let Some(kind) = self.layer_kind(input) else {
            panic!("layer {input} has been removed from the graph");
        };
        if allowed.contains(&kind) {
            Ok(())
        } else {
            tracing::warn!(%layer, %input, ?kind, slot, "rejected incompatible input");
            Err(LayerError::IncompatibleInput {
                layer,
                input,
                kind,
                slot,
            })
        }
    }

    /// Connect (or with `None`, disconnect) the reconstruction layer of a
    /// reconstruct or velocity layer.
    pub fn set_reconstruction_input(
        &mut self,
        layer: LayerId,
        input: Option<LayerId>,
    ) -> Result<()> {
        if let Some(input) = input {
            self.expect_input_kind(layer, input, &[LayerKind::Reconstruction], "reconstruction")?;
        }
        match self.proxy_mut(layer) {
            LayerProxy::Reconstruct(reconstruct) => reconstruct.set_reconstruction_input(input),
            LayerProxy::VelocityFieldCalculator(velocity) => {
                velocity.set_reconstruction_input(input)
            }
            other => return other.as_reconstruct_mut().map(|_| ()),
        }
        Ok(())
    }

    /// Set the topology layers a reconstruct layer uses when it reconstructs
    /// using topologies.
    pub fn set_topology_surface_inputs(&mut self, layer: LayerId, inputs: &[LayerId]) -> Result<()> {
        for &input in inputs {
            self.expect_input_kind(
                layer,
                input,
                &[
                    LayerKind::TopologyBoundaryResolver,
                    LayerKind::TopologyNetworkResolver,
                ],
                "topology surface",
            )?;
        }
        self.proxy_mut(layer)
            .as_reconstruct_mut()?
            .set_topology_surface_inputs(inputs);
        Ok(())
    }

    /// Set the reconstruct layers a topology layer builds its topologies from.
    ///
    /// Reconstruct layers that currently reconstruct using topologies would
    /// form a cycle; they are left out and returned.
    pub fn set_topological_section_inputs(
        &mut self,
        layer: LayerId,
        inputs: &[LayerId],
    ) -> Result<Vec<LayerId>> {
        for &input in inputs {
            self.expect_input_kind(layer, input, &[LayerKind::Reconstruct], "topological section")?;
        }
        let (rejected, accepted): (Vec<LayerId>, Vec<LayerId>) = inputs
            .iter()
            .partition(|&&input| self.reconstructs_using_topologies(input));
        for input in &rejected {
            tracing::warn!(
                %layer,
                %input,
                "rejected section layer that reconstructs using topologies"
            );
        }
        match self.proxy_mut(layer) {
            LayerProxy::TopologyBoundaryResolver(boundary) => boundary.set_sections(&accepted),
            LayerProxy::TopologyNetworkResolver(network) => network.set_sections(&accepted),
            other => return other.as_topology_boundary_mut().map(|_| Vec::new()),
        }
        Ok(rejected)
    }

    /// Set the layers a velocity layer looks domain points up in.
    pub fn set_velocity_surface_inputs(&mut self, layer: LayerId, inputs: &[LayerId]) -> Result<()> {
        for &input in inputs {
            self.expect_input_kind(
                layer,
                input,
                &[
                    LayerKind::Reconstruct,
                    LayerKind::TopologyBoundaryResolver,
                    LayerKind::TopologyNetworkResolver,
                ],
                "velocity surface",
            )?;
        }
        self.proxy_mut(layer)
            .as_velocity_mut()?
            .set_surface_inputs(inputs);
        Ok(())
    }

    /// Set the reconstruct layers a scalar field layer samples along.
    pub fn set_cross_section_inputs(&mut self, layer: LayerId, inputs: &[LayerId]) -> Result<()> {
        for &input in inputs {
            self.expect_input_kind(layer, input, &[LayerKind::Reconstruct], "cross section")?;
        }
        self.proxy_mut(layer)
            .as_scalar_field_mut()?
            .set_cross_section_inputs(inputs);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Feature collections
    // ------------------------------------------------------------------------

    /// Let a layer read `collection`.
    ///
    /// Returns false if the layer kind reads no features or already reads it.
    pub fn add_feature_collection(
        &mut self,
        layer: LayerId,
        collection: &Arc<FeatureCollection>,
    ) -> bool {
        self.proxy_mut(layer).add_feature_collection(collection)
    }

    /// Stop a layer reading `collection`. Returns false if it did not read it.
    pub fn remove_feature_collection(
        &mut self,
        layer: LayerId,
        collection: &Arc<FeatureCollection>,
    ) -> bool {
        self.proxy_mut(layer).remove_feature_collection(collection)
    }

    /// Notify every layer reading `collection` that its features were edited.
    ///
    /// Returns the number of layers invalidated.
    pub fn modified_feature_collection(&mut self, collection: &Arc<FeatureCollection>) -> usize {
        self.slots
            .iter_mut()
            .filter_map(|(_, slot)| slot.proxy.as_deref_mut())
            .map(|proxy| proxy.modified_feature_collection(collection))
            .filter(|&invalidated| invalidated)
            .count()
    }

    // ------------------------------------------------------------------------
    // Params
    // ------------------------------------------------------------------------

    /// Replace the default params of a reconstruct layer.
    ///
    /// Switching in or out of topology mode also invalidates the topology
    /// layers using this layer as a section input, since they only read
    /// sections that do not reconstruct using topologies.
    pub fn set_reconstruct_params(&mut self, layer: LayerId, params: ReconstructParams) -> Result<()> {
        self.proxy_mut(layer).as_reconstruct_mut()?.set_params(params);

        let slot = self.live_slot_mut(layer);
        let mode_changed = slot.reconstructs_using_topologies != params.reconstruct_using_topologies;
        slot.reconstructs_using_topologies = params.reconstruct_using_topologies;
        if mode_changed {
            for (_, slot) in self.slots.iter_mut() {
                let is_topology = matches!(
                    slot.kind,
                    LayerKind::TopologyBoundaryResolver | LayerKind::TopologyNetworkResolver
                );
                let Some(proxy) = slot.proxy.as_deref_mut().filter(|_| is_topology) else {
                    continue;
                };
                let node = proxy.node_mut();
                if node.input_ids().contains(&layer) {
                    node.invalidate(InvalidationReason::InputsRewired);
                }
            }
        }
        Ok(())
    }

    /// Default params of a reconstruct layer.
    pub fn reconstruct_params(&self, layer: LayerId) -> Result<ReconstructParams> {
        Ok(self.proxy(layer).as_reconstruct()?.params())
    }

    /// Replace the default params of a topology network layer.
    ///
    /// Returns [`LayerError::InvalidParameter`] for a negative or non-finite
    /// interpolation power, leaving the current params in place.
    pub fn set_topology_network_params(
        &mut self,
        layer: LayerId,
        params: TopologyNetworkParams,
    ) -> Result<()> {
        params.validate()?;
        self.proxy_mut(layer)
            .as_topology_network_mut()?
            .set_params(params);
        Ok(())
    }

    /// Default params of a topology network layer.
    pub fn topology_network_params(&self, layer: LayerId) -> Result<TopologyNetworkParams> {
        Ok(self.proxy(layer).as_topology_network()?.params())
    }

    /// Replace the default params of a velocity layer.
    ///
    /// Returns [`LayerError::InvalidParameter`] unless `delta_time` is finite
    /// and positive, leaving the current params in place.
    pub fn set_velocity_params(&mut self, layer: LayerId, params: VelocityParams) -> Result<()> {
        params.validate()?;
        self.proxy_mut(layer).as_velocity_mut()?.set_params(params);
        Ok(())
    }

    /// Default params of a velocity layer.
    pub fn velocity_params(&self, layer: LayerId) -> Result<VelocityParams> {
        Ok(self.proxy(layer).as_velocity()?.params())
    }

    // ------------------------------------------------------------------------
    // Rotation
    // ------------------------------------------------------------------------

    /// Replace the rotation model of a reconstruction layer.
    pub fn set_rotation_model(
        &mut self,
        layer: LayerId,
        rotation_model: Arc<dyn RotationModel>,
    ) -> Result<()> {
        self.proxy_mut(layer)
            .as_reconstruction_mut()?
            .set_rotation_model(rotation_model);
        Ok(())
    }

    /// Notify a reconstruction layer that its rotation model was edited in place.
    pub fn modified_rotation_model(&mut self, layer: LayerId) -> Result<()> {
        self.proxy_mut(layer)
            .as_reconstruction_mut()?
            .modified_rotation_model();
        Ok(())
    }

    /// Set the plate a reconstruction layer keeps fixed.
    pub fn set_anchor_plate_id(&mut self, layer: LayerId, anchor_plate_id: PlateId) -> Result<()> {
        self.proxy_mut(layer)
            .as_reconstruction_mut()?
            .set_anchor_plate_id(anchor_plate_id);
        Ok(())
    }

    /// The plate a reconstruction layer keeps fixed.
    pub fn anchor_plate_id(&self, layer: LayerId) -> Result<PlateId> {
        Ok(self.proxy(layer).as_reconstruction()?.anchor_plate_id())
    }

    // ------------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------------

    /// Replace every setting, resizing every cache.
    pub fn set_config(&mut self, config: LayerGraphConfig) {
        let config = config.clamped();
        self.config = config;
        for (_, slot) in self.slots.iter_mut() {
            if let Some(proxy) = slot.proxy.as_deref_mut() {
                proxy.node_mut().apply_config(&config);
            }
        }
        tracing::debug!(?config, "applied layer graph config");
    }

    /// Entries kept per result cache. Shrinking evicts least recently used entries.
    pub fn set_cache_capacity(&mut self, capacity: usize) {
        let config = LayerGraphConfig {
            cache_capacity: capacity,
            ..self.config
        };
        self.set_config(config);
    }

    /// Result cache capacity of reconstruct layers that reconstruct using topologies.
    pub fn set_topology_cache_capacity(&mut self, capacity: usize) {
        let config = LayerGraphConfig {
            topology_cache_capacity: capacity,
            ..self.config
        };
        self.set_config(config);
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Reconstruction tree of a reconstruction layer at `time`. Populates the
    /// layer's tree cache.
    pub fn reconstruction_tree(&mut self, layer: LayerId, time: f64) -> Result<Arc<ReconstructionTree>> {
        self.with_layer(layer, |proxy, _| {
            Ok(proxy.as_reconstruction_mut()?.reconstruction_tree(time))
        })
    }

    /// Reconstructed geometries of a reconstruct layer at `time`, with the
    /// layer's current params. Populates the layer's result cache.
    pub fn reconstructed_feature_geometries(
        &mut self,
        layer: LayerId,
        time: f64,
    ) -> Result<Arc<ReconstructedGeometries>> {
        self.with_layer(layer, |proxy, graph| {
            proxy
                .as_reconstruct_mut()?
                .reconstructed_feature_geometries(graph, time)
        })
    }

    /// Reconstructed geometries of a reconstruct layer at `time` with explicit
    /// params. Populates the layer's result cache.
    ///
    /// # Panics
    ///
    /// Panics if `params` and the layer's current params disagree on whether
    /// to reconstruct using topologies.
    pub fn reconstructed_feature_geometries_with_params(
        &mut self,
        layer: LayerId,
        time: f64,
        params: &ReconstructParams,
    ) -> Result<Arc<ReconstructedGeometries>> {
        self.with_layer(layer, |proxy, graph| {
            proxy
                .as_reconstruct_mut()?
                .reconstructed_feature_geometries_with_params(graph, time, params)
        })
    }

    /// Spatial partition of a reconstruct layer's geometries at `time`.
    /// Populates the layer's result and partition caches.
    pub fn reconstructed_spatial_partition(
        &mut self,
        layer: LayerId,
        time: f64,
    ) -> Result<Arc<ReconstructedSpatialPartition>> {
        self.with_layer(layer, |proxy, graph| {
            proxy
                .as_reconstruct_mut()?
                .reconstructed_spatial_partition(graph, time)
        })
    }

    /// Present-day geometries of a reconstruct layer's features. Populates the
    /// layer's present-day cache.
    pub fn present_day_geometries(&mut self, layer: LayerId) -> Result<Arc<Vec<PresentDayGeometry>>> {
        Ok(self
            .proxy_mut(layer)
            .as_reconstruct_mut()?
            .present_day_geometries())
    }

    /// Number of reconstruct contexts of a reconstruct layer still held by
    /// cache entries.
    pub fn live_reconstruct_contexts(&self, layer: LayerId) -> Result<usize> {
        Ok(self.proxy(layer).as_reconstruct()?.live_context_count())
    }

    /// Boundaries and lines of a topology boundary layer at `time`. Populates
    /// the layer's result cache.
    pub fn resolved_topological_boundaries(
        &mut self,
        layer: LayerId,
        time: f64,
    ) -> Result<Arc<ResolvedTopologicalBoundaries>> {
        self.with_layer(layer, |proxy, graph| {
            proxy
                .as_topology_boundary_mut()?
                .resolved_topological_boundaries(graph, time)
        })
    }

    /// Boundaries of a topology boundary layer at every slot of `range`.
    /// Populates the layer's time-span table.
    pub fn resolved_boundary_time_span(
        &mut self,
        layer: LayerId,
        range: TimeRange,
    ) -> Result<Arc<TimeSpanTable<ResolvedTopologicalBoundaries>>> {
        self.with_layer(layer, |proxy, graph| {
            proxy
                .as_topology_boundary_mut()?
                .resolved_boundary_time_span(graph, range)
        })
    }

    /// Networks of a topology network layer at `time`. Populates the layer's
    /// result cache.
    pub fn resolved_topological_networks(
        &mut self,
        layer: LayerId,
        time: f64,
    ) -> Result<Arc<ResolvedTopologicalNetworks>> {
        self.with_layer(layer, |proxy, graph| {
            proxy
                .as_topology_network_mut()?
                .resolved_topological_networks(graph, time)
        })
    }

    /// Networks of a topology network layer at every slot of `range`.
    /// Populates the layer's time-span table.
    pub fn resolved_network_time_span(
        &mut self,
        layer: LayerId,
        range: TimeRange,
    ) -> Result<Arc<TimeSpanTable<ResolvedTopologicalNetworks>>> {
        self.with_layer(layer, |proxy, graph| {
            proxy
                .as_topology_network_mut()?
                .resolved_network_time_span(graph, range)
        })
    }

    /// Velocity fields of a velocity layer at `time`. Populates the layer's
    /// result cache.
    pub fn velocity_fields(&mut self, layer: LayerId, time: f64) -> Result<Arc<VelocityFields>> {
        self.with_layer(layer, |proxy, graph| {
            proxy.as_velocity_mut()?.velocity_fields(graph, time)
        })
    }

    /// Scalar field of a scalar field layer at `time`, or `None` if no
    /// scalar-field feature is active. Populates the layer's field cache.
    pub fn resolved_scalar_field(
        &mut self,
        layer: LayerId,
        time: f64,
    ) -> Result<Option<Arc<ResolvedScalarField>>> {
        self.with_layer(layer, |proxy, graph| {
            Ok(proxy.as_scalar_field_mut()?.resolved_scalar_field(graph, time))
        })
    }

    /// Cross sections of a scalar field layer at `time`. Populates the layer's
    /// cross-section and field caches.
    pub fn cross_section_geometries(&mut self, layer: LayerId, time: f64) -> Result<Arc<CrossSections>> {
        self.with_layer(layer, |proxy, graph| {
            proxy
                .as_scalar_field_mut()?
                .cross_section_geometries(graph, time)
        })
    }

    /// Statistics of a scalar field layer's samples, computed when its
    /// feature collections last changed or expired.
    pub fn scalar_field_statistics(
        &mut self,
        layer: LayerId,
    ) -> Result<Option<ScalarFieldStatistics>> {
        let proxy = self.proxy_mut(layer);
        proxy.prune_expired_feature_collections();
        Ok(proxy.as_scalar_field()?.statistics())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::EulerPoleRotationModel;

    #[test]
    fn test_ids_are_not_reused() {
        let mut graph = LayerGraph::new();
        let first = graph.add_reconstruct_layer();
        assert!(graph.remove_layer(first));
        let second = graph.add_reconstruct_layer();

        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert!(!graph.contains(first));
        assert_eq!(graph.layer_state(first), LayerState::Removed);
        assert_eq!(graph.layer_state(second), LayerState::Uninitialized);
        assert!(!graph.remove_layer(first));
    }

    #[test]
    fn test_incompatible_input_is_rejected() {
        let mut graph = LayerGraph::new();
        let reconstruct = graph.add_reconstruct_layer();
        let other = graph.add_reconstruct_layer();

        let err = graph
            .set_reconstruction_input(reconstruct, Some(other))
            .unwrap_err();
        assert!(matches!(err, LayerError::IncompatibleInput { slot: "reconstruction", .. }));
    }

    #[test]
    fn test_wrong_layer_kind_is_an_error() {
        let mut graph = LayerGraph::new();
        let rotation = graph.add_reconstruction_layer(Arc::new(EulerPoleRotationModel::new()));
        let err = graph.velocity_fields(rotation, 0.0).unwrap_err();
        assert!(matches!(
            err,
            LayerError::UnexpectedLayerKind {
                expected: LayerKind::VelocityFieldCalculator,
                found: LayerKind::Reconstruction,
                ..
            }
        ));
        // The proxy went back into its slot.
        assert!(graph.reconstruction_tree(rotation, 0.0).is_ok());
    }

    #[test]
    fn test_removing_input_disconnects_it() {
        let mut graph = LayerGraph::new();
        let rotation = graph.add_reconstruction_layer(Arc::new(EulerPoleRotationModel::new()));
        let reconstruct = graph.add_reconstruct_layer();
        graph
            .set_reconstruction_input(reconstruct, Some(rotation))
            .unwrap();
        assert_eq!(graph.inputs(reconstruct), vec![rotation]);

        graph.remove_layer(rotation);
        assert!(graph.inputs(reconstruct).is_empty());
        assert!(graph.reconstructed_feature_geometries(reconstruct, 10.0).unwrap().is_empty());
    }

    #[test]
    #[should_panic(expected = "has been removed from the graph")]
    fn test_query_on_removed_layer_panics() {
        let mut graph = LayerGraph::new();
        let layer = graph.add_reconstruct_layer();
        graph.remove_layer(layer);
        let _ = graph.reconstructed_feature_geometries(layer, 0.0);
    }

    #[test]
    fn test_config_reaches_builder() {
        let graph = LayerGraph::builder()
            .cache_capacity(3)
            .topology_cache_capacity(2)
            .build();
        assert_eq!(
            *graph.config(),
            LayerGraphConfig {
                cache_capacity: 3,
                topology_cache_capacity: 2,
                spatial_partition_depth: DEFAULT_MAX_DEPTH,
            }
        );
    }

    #[test]
    fn test_partition_depth_is_clamped() {
        let mut graph = LayerGraph::builder().spatial_partition_depth(40).build();
        assert_eq!(graph.config().spatial_partition_depth, MAX_DEPTH_LIMIT);

        graph.set_config(LayerGraphConfig {
            spatial_partition_depth: u32::MAX,
            ..*graph.config()
        });
        assert_eq!(graph.config().spatial_partition_depth, MAX_DEPTH_LIMIT);
    }

    #[test]
    fn test_degenerate_velocity_interval_is_rejected() {
        let mut graph = LayerGraph::new();
        let velocity = graph.add_velocity_layer();
        for delta_time in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let params = VelocityParams {
                delta_time,
                ..Default::default()
            };
            let err = graph.set_velocity_params(velocity, params).unwrap_err();
            assert!(matches!(
                err,
                LayerError::InvalidParameter {
                    name: "delta_time",
                    ..
                }
            ));
        }
        assert_eq!(graph.velocity_params(velocity).unwrap(), VelocityParams::default());

        let params = VelocityParams {
            delta_time: 0.5,
            ..Default::default()
        };
        graph.set_velocity_params(velocity, params).unwrap();
        assert_eq!(graph.velocity_params(velocity).unwrap(), params);
    }

    #[test]
    fn test_invalid_interpolation_power_is_rejected() {
        let mut graph = LayerGraph::new();
        let network = graph.add_topology_network_layer();
        for interpolation_power in [-2.0, f64::NAN, f64::NEG_INFINITY] {
            let params = TopologyNetworkParams {
                interpolation_power,
                ..Default::default()
            };
            let err = graph
                .set_topology_network_params(network, params)
                .unwrap_err();
            assert!(matches!(
                err,
                LayerError::InvalidParameter {
                    name: "interpolation_power",
                    ..
                }
            ));
        }
        assert_eq!(
            graph.topology_network_params(network).unwrap(),
            TopologyNetworkParams::default()
        );

        let uniform = TopologyNetworkParams {
            interpolation_power: 0.0,
            ..Default::default()
        };
        graph.set_topology_network_params(network, uniform).unwrap();
        assert_eq!(graph.topology_network_params(network).unwrap(), uniform);
    }
}

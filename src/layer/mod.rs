//! Layer proxies: the nodes of the layer graph.
//!
//! Every proxy owns a [`ChangeToken`] (its subject token), the caches of the
//! results it produced, and a list of input layers each paired with the last
//! token it saw from that input. Proxies never push changes downstream.
//! Instead, every query first polls the inputs; if any input's token moved on,
//! the proxy drops its caches and invalidates its own token, which the layers
//! downstream of it will notice in turn when they are queried.

mod reconstruct;
mod reconstruction;
mod scalar_field;
mod topology_boundary;
mod topology_network;
mod velocity;

pub use reconstruct::{
    PresentDayGeometry, ReconstructedFeatureGeometry, ReconstructedGeometries,
    ReconstructedSpatialPartition,
};
pub use scalar_field::{CrossSection, CrossSections, ResolvedScalarField, ScalarFieldStatistics};
pub use topology_boundary::{
    ResolvedTopologicalBoundaries, ResolvedTopologicalBoundary, ResolvedTopologicalLine,
};
pub use topology_network::{
    NetworkNode, ResolvedTopologicalNetwork, ResolvedTopologicalNetworks, TopologyNetworkParams,
};
pub use velocity::{
    DeltaTimeType, SolveVelocitiesMethod, Velocity, VelocityField, VelocityFields, VelocityParams,
    VelocityPoint, VelocitySource,
};

pub(crate) use reconstruct::ReconstructLayer;
pub(crate) use reconstruction::ReconstructionLayer;
pub(crate) use scalar_field::ScalarFieldLayer;
pub(crate) use topology_boundary::TopologyBoundaryLayer;
pub(crate) use topology_network::TopologyNetworkLayer;
pub(crate) use velocity::VelocityLayer;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{LayerError, Result};
use crate::feature::{FeatureCollection, FeatureId, PlateId, WeakFeatureCollections};
use crate::geometry::{Geometry, UnitVector3};
use crate::graph::{LayerGraph, LayerGraphConfig, LayerId};
use crate::time_span::TimeSpanReuse;
use crate::token::{ChangeToken, TokenObserver};
use crate::tracer::{InvalidationReason, Tracer, TracerRequestKey};

/// The computation a layer performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LayerKind {
    /// Builds reconstruction trees from a rotation model.
    Reconstruction,
    /// Reconstructs feature geometries.
    Reconstruct,
    /// Resolves topological plate boundaries and lines.
    TopologyBoundaryResolver,
    /// Resolves deforming topological networks.
    TopologyNetworkResolver,
    /// Calculates velocities at domain points.
    VelocityFieldCalculator,
    /// Resolves scalar fields and their cross sections.
    ScalarFieldResolver,
}

/// Lifecycle of a layer.
///
/// `Stale` is transient: the next query rebuilds the caches and returns the
/// layer to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerState {
    /// Created but never queried successfully.
    Uninitialized,
    /// Caches reflect the current inputs.
    Ready,
    /// Invalidated since the last successful query.
    Stale,
    /// Removed from the graph; any further query panics.
    Removed,
}

/// State every proxy kind shares: identity, subject token and lifecycle.
pub(crate) struct ProxyCore {
    pub(crate) id: LayerId,
    token: ChangeToken,
    state: LayerState,
    tracer: Arc<dyn Tracer>,
}

impl ProxyCore {
    pub(crate) fn new(id: LayerId, tracer: Arc<dyn Tracer>) -> Self {
        Self {
            id,
            token: ChangeToken::new(),
            state: LayerState::Uninitialized,
            tracer,
        }
    }

    pub(crate) fn token(&self) -> ChangeToken {
        self.token
    }

    pub(crate) fn state(&self) -> LayerState {
        self.state
    }

    pub(crate) fn invalidate(&mut self, reason: InvalidationReason) {
        self.token.invalidate();
        if self.state == LayerState::Ready {
            self.state = LayerState::Stale;
        }
        tracing::debug!(layer = %self.id, ?reason, "invalidated layer");
        self.tracer.on_layer_invalidated(self.id, &reason);
    }

    pub(crate) fn mark_ready(&mut self) {
        self.state = LayerState::Ready;
    }

    pub(crate) fn cache_hit(&self, query: &'static str, key: &impl Debug) {
        self.tracer
            .on_cache_hit(self.id, &TracerRequestKey::new(query, format!("{key:?}")));
    }

    pub(crate) fn cache_miss(&self, query: &'static str, key: &impl Debug) {
        tracing::trace!(layer = %self.id, query, ?key, "cache miss");
        self.tracer
            .on_cache_miss(self.id, &TracerRequestKey::new(query, format!("{key:?}")));
    }

    pub(crate) fn time_span_built(&self, reuse: TimeSpanReuse) {
        tracing::debug!(layer = %self.id, reused = reuse.reused, computed = reuse.computed, "built time span");
        self.tracer.on_time_span_built(self.id, reuse);
    }

    pub(crate) fn cyclic_input_skipped(&self, input: LayerId) {
        tracing::warn!(
            layer = %self.id,
            %input,
            "skipping section layer that reconstructs using topologies"
        );
        self.tracer.on_cyclic_input_skipped(self.id, input);
    }
}

/// An input layer together with the last subject token seen from it.
#[derive(Debug, Clone)]
pub(crate) struct InputLayer {
    id: LayerId,
    observer: TokenObserver,
}

impl InputLayer {
    pub(crate) fn new(id: LayerId) -> Self {
        Self {
            id,
            observer: TokenObserver::default(),
        }
    }

    pub(crate) fn id(&self) -> LayerId {
        self.id
    }
}

pub(crate) fn input_layers(ids: &[LayerId]) -> Vec<InputLayer> {
    let mut inputs: Vec<InputLayer> = Vec::with_capacity(ids.len());
    for &id in ids {
        if !inputs.iter().any(|input| input.id == id) {
            inputs.push(InputLayer::new(id));
        }
    }
    inputs
}

/// Poll each input's subject token and resync the observers.
///
/// Returns the first input whose token had changed. Every input is polled even
/// after a change is found, so all observers end up in sync.
pub(crate) fn poll_inputs<'a>(
    graph: &mut LayerGraph,
    inputs: impl IntoIterator<Item = &'a mut InputLayer>,
) -> Option<LayerId> {
    let mut changed = None;
    for input in inputs {
        let token = graph.subject_token(input.id);
        if !token.is_up_to_date(&input.observer) {
            token.update(&mut input.observer);
            changed.get_or_insert(input.id);
        }
    }
    changed
}

/// Poll section inputs, leaving out any that reconstruct using topologies.
///
/// Skipped inputs are not entered at all, so a section layer that depends on
/// the polling layer cannot close a cycle.
pub(crate) fn poll_section_inputs(
    graph: &mut LayerGraph,
    sections: &mut [InputLayer],
) -> Option<LayerId> {
    let skipped: Vec<LayerId> = sections
        .iter()
        .map(InputLayer::id)
        .filter(|&id| graph.reconstructs_using_topologies(id))
        .collect();
    poll_inputs(
        graph,
        sections.iter_mut().filter(|s| !skipped.contains(&s.id)),
    )
}

/// Remove `input` from `inputs`, returning true if it was present.
pub(crate) fn remove_input(inputs: &mut Vec<InputLayer>, input: LayerId) -> bool {
    let before = inputs.len();
    inputs.retain(|i| i.id != input);
    inputs.len() != before
}

/// A section feature's reconstructed geometry at one time.
#[derive(Debug, Clone)]
pub(crate) struct SectionGeometry {
    pub(crate) plate_id: PlateId,
    pub(crate) geometry: Geometry,
}

/// Reconstruct every section layer at `time`, skipping any that reconstruct
/// using topologies.
pub(crate) fn resolve_section_geometries(
    graph: &mut LayerGraph,
    core: &ProxyCore,
    sections: &[InputLayer],
    time: f64,
) -> Result<HashMap<FeatureId, SectionGeometry>> {
    let mut resolved = HashMap::new();
    for section in sections {
        if graph.reconstructs_using_topologies(section.id) {
            core.cyclic_input_skipped(section.id);
            continue;
        }
        let geometries = graph.reconstructed_feature_geometries(section.id, time)?;
        for rfg in geometries.iter() {
            resolved.insert(
                rfg.feature_id,
                SectionGeometry {
                    plate_id: rfg.plate_id,
                    geometry: rfg.geometry.geometry().into_owned(),
                },
            );
        }
    }
    Ok(resolved)
}

/// Join the section geometries end to end.
///
/// Returns `None` if any section has no geometry at this time. Vertices
/// repeated where two sections meet are kept once.
pub(crate) fn join_sections(
    section_ids: &[FeatureId],
    sections: &HashMap<FeatureId, SectionGeometry>,
) -> Option<Vec<(UnitVector3, PlateId)>> {
    let mut joined: Vec<(UnitVector3, PlateId)> = Vec::new();
    for id in section_ids {
        let section = sections.get(id)?;
        for point in section.geometry.points() {
            let repeated = joined
                .last()
                .is_some_and(|(last, _)| last.angle_to(point) <= 1e-12);
            if !repeated {
                joined.push((*point, section.plate_id));
            }
        }
    }
    Some(joined)
}

/// Interface shared by every proxy kind.
pub(crate) trait LayerNode {
    fn core(&self) -> &ProxyCore;

    fn core_mut(&mut self) -> &mut ProxyCore;

    /// Poll the inputs; on any change drop the caches and invalidate.
    fn check_input_layer_proxies(&mut self, graph: &mut LayerGraph);

    fn clear_caches(&mut self);

    fn input_ids(&self) -> Vec<LayerId> {
        Vec::new()
    }

    fn disconnect_input(&mut self, _input: LayerId) -> bool {
        false
    }

    fn feature_collections_mut(&mut self) -> Option<&mut WeakFeatureCollections> {
        None
    }

    fn apply_config(&mut self, _config: &LayerGraphConfig) {}

    fn invalidate(&mut self, reason: InvalidationReason) {
        self.clear_caches();
        self.core_mut().invalidate(reason);
    }

    fn feature_collections_changed(&mut self) {
        self.invalidate(InvalidationReason::FeatureCollectionsChanged);
    }

    /// The token downstream layers compare against, after polling the inputs.
    fn subject_token(&mut self, graph: &mut LayerGraph) -> ChangeToken {
        self.check_input_layer_proxies(graph);
        self.core().token()
    }
}

/// A node of the layer graph.
pub(crate) enum LayerProxy {
    Reconstruction(ReconstructionLayer),
    Reconstruct(ReconstructLayer),
    TopologyBoundaryResolver(TopologyBoundaryLayer),
    TopologyNetworkResolver(TopologyNetworkLayer),
    VelocityFieldCalculator(VelocityLayer),
    ScalarFieldResolver(ScalarFieldLayer),
}

macro_rules! kind_accessor {
    ($name:ident, $name_mut:ident, $variant:ident, $layer:ty) => {
        #[allow(dead_code)]
        pub(crate) fn $name(&self) -> Result<&$layer> {
            match self {
                LayerProxy::$variant(layer) => Ok(layer),
                other => Err(other.unexpected_kind(LayerKind::$variant)),
            }
        }

        pub(crate) fn $name_mut(&mut self) -> Result<&mut $layer> {
            match self {
                LayerProxy::$variant(layer) => Ok(layer),
                other => Err(other.unexpected_kind(LayerKind::$variant)),
            }
        }
    };
}

impl LayerProxy {
    pub(crate) fn kind(&self) -> LayerKind {
        match self {
            LayerProxy::Reconstruction(_) => LayerKind::Reconstruction,
            LayerProxy::Reconstruct(_) => LayerKind::Reconstruct,
            LayerProxy::TopologyBoundaryResolver(_) => LayerKind::TopologyBoundaryResolver,
            LayerProxy::TopologyNetworkResolver(_) => LayerKind::TopologyNetworkResolver,
            LayerProxy::VelocityFieldCalculator(_) => LayerKind::VelocityFieldCalculator,
            LayerProxy::ScalarFieldResolver(_) => LayerKind::ScalarFieldResolver,
        }
    }

    pub(crate) fn node(&self) -> &dyn LayerNode {
        match self {
            LayerProxy::Reconstruction(layer) => layer,
            LayerProxy::Reconstruct(layer) => layer,
            LayerProxy::TopologyBoundaryResolver(layer) => layer,
            LayerProxy::TopologyNetworkResolver(layer) => layer,
            LayerProxy::VelocityFieldCalculator(layer) => layer,
            LayerProxy::ScalarFieldResolver(layer) => layer,
        }
    }

    pub(crate) fn node_mut(&mut self) -> &mut dyn LayerNode {
        match self {
            LayerProxy::Reconstruction(layer) => layer,
            LayerProxy::Reconstruct(layer) => layer,
            LayerProxy::TopologyBoundaryResolver(layer) => layer,
            LayerProxy::TopologyNetworkResolver(layer) => layer,
            LayerProxy::VelocityFieldCalculator(layer) => layer,
            LayerProxy::ScalarFieldResolver(layer) => layer,
        }
    }

    fn unexpected_kind(&self, expected: LayerKind) -> LayerError {
        LayerError::UnexpectedLayerKind {
            layer: self.node().core().id,
            expected,
            found: self.kind(),
        }
    }

    kind_accessor!(as_reconstruction, as_reconstruction_mut, Reconstruction, ReconstructionLayer);
    kind_accessor!(as_reconstruct, as_reconstruct_mut, Reconstruct, ReconstructLayer);
    kind_accessor!(
        as_topology_boundary,
        as_topology_boundary_mut,
        TopologyBoundaryResolver,
        TopologyBoundaryLayer
    );
    kind_accessor!(
        as_topology_network,
        as_topology_network_mut,
        TopologyNetworkResolver,
        TopologyNetworkLayer
    );
    kind_accessor!(as_velocity, as_velocity_mut, VelocityFieldCalculator, VelocityLayer);
    kind_accessor!(as_scalar_field, as_scalar_field_mut, ScalarFieldResolver, ScalarFieldLayer);

    /// Returns false if the layer kind reads no features or already had the collection.
    pub(crate) fn add_feature_collection(&mut self, collection: &Arc<FeatureCollection>) -> bool {
        let node = self.node_mut();
        let added = node
            .feature_collections_mut()
            .is_some_and(|collections| collections.add(collection));
        if added {
            node.feature_collections_changed();
        }
        added
    }

    pub(crate) fn remove_feature_collection(
        &mut self,
        collection: &Arc<FeatureCollection>,
    ) -> bool {
        let node = self.node_mut();
        let removed = node
            .feature_collections_mut()
            .is_some_and(|collections| collections.remove(collection));
        if removed {
            node.feature_collections_changed();
        }
        removed
    }

    /// Forget feature collections that no longer exist, treating them as removed.
    pub(crate) fn prune_expired_feature_collections(&mut self) -> bool {
        let node = self.node_mut();
        let expired = node
            .feature_collections_mut()
            .map_or(0, WeakFeatureCollections::prune_expired);
        if expired == 0 {
            return false;
        }
        tracing::debug!(layer = %node.core().id, expired, "dropped expired feature collections");
        node.feature_collections_changed();
        true
    }

    pub(crate) fn modified_feature_collection(
        &mut self,
        collection: &Arc<FeatureCollection>,
    ) -> bool {
        let node = self.node_mut();
        let uses = node
            .feature_collections_mut()
            .is_some_and(|collections| collections.contains(collection));
        if uses {
            node.feature_collections_changed();
        }
        uses
    }
}

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::cache::BoundedCache;
use crate::error::{LayerError, Result};
use crate::feature::{Feature, FeatureId, FeatureKind, PlateId, WeakFeatureCollections};
use crate::geometry::{Geometry, Rotation, UnitVector3};
use crate::graph::{LayerGraph, LayerGraphConfig, LayerId};
use crate::time::{GeoTime, TimeRange};
use crate::time_span::TimeSpanTable;
use crate::token::ReconstructHandle;
use crate::tracer::InvalidationReason;

use super::{
    input_layers, join_sections, poll_section_inputs, remove_input, resolve_section_geometries,
    InputLayer, LayerNode, ProxyCore, SectionGeometry,
};

// Closer than this a node takes all the weight.
const COINCIDENT_NODE_ANGLE: f64 = 1e-12;

/// How deforming networks are resolved.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TopologyNetworkParams {
    /// Add the vertices of interior features as network nodes.
    pub include_interior_geometries: bool,
    /// Power of the inverse-distance weighting between nodes.
    pub interpolation_power: f64,
}

impl Default for TopologyNetworkParams {
    fn default() -> Self {
        Self {
            include_interior_geometries: true,
            interpolation_power: 2.0,
        }
    }
}

impl TopologyNetworkParams {
    /// Checks that `interpolation_power` is finite and not negative.
    pub fn validate(&self) -> Result<()> {
        if self.interpolation_power.is_finite() && self.interpolation_power >= 0.0 {
            Ok(())
        } else {
            Err(LayerError::InvalidParameter {
                name: "interpolation_power",
                value: self.interpolation_power,
                expected: "a finite non-negative power",
            })
        }
    }

    fn key(&self) -> (bool, u64) {
        (
            self.include_interior_geometries,
            self.interpolation_power.to_bits(),
        )
    }
}

impl PartialEq for TopologyNetworkParams {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for TopologyNetworkParams {}

impl Hash for TopologyNetworkParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// A vertex of a deforming network and the plate it moves with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkNode {
    /// Position at the resolution time.
    pub position: UnitVector3,
    /// Plate of the section or interior feature the node came from.
    pub plate_id: PlateId,
}

/// A deforming region at one time.
///
/// Motion inside the region is interpolated from the motion of its nodes by
/// inverse-distance weighting.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTopologicalNetwork {
    /// Topological feature.
    pub feature_id: FeatureId,
    /// Plate of the network feature itself.
    pub plate_id: PlateId,
    /// Boundary polygon.
    pub boundary: Geometry,
    /// Boundary vertices followed by interior vertices.
    pub nodes: Vec<NetworkNode>,
    /// Power of the inverse-distance weighting.
    pub interpolation_power: f64,
}

impl ResolvedTopologicalNetwork {
    /// Returns true if `point` lies inside the boundary.
    pub fn contains(&self, point: &UnitVector3) -> bool {
        self.boundary.contains_point(point)
    }

    /// Normalised weight of every node at `point`.
    pub fn node_weights(&self, point: &UnitVector3) -> Vec<f64> {
        let distances: Vec<f64> = self
            .nodes
            .iter()
            .map(|node| node.position.angle_to(point))
            .collect();
        if let Some(index) = distances.iter().position(|&d| d <= COINCIDENT_NODE_ANGLE) {
            let mut weights = vec![0.0; distances.len()];
            weights[index] = 1.0;
            return weights;
        }
        let raw: Vec<f64> = distances
            .iter()
            .map(|d| d.powf(-self.interpolation_power))
            .collect();
        let total: f64 = raw.iter().sum();
        raw.into_iter().map(|w| w / total).collect()
    }

    /// Weighted sum of `value` over the nodes.
    pub fn interpolate(
        &self,
        point: &UnitVector3,
        value: impl Fn(&NetworkNode) -> [f64; 3],
    ) -> [f64; 3] {
        let mut sum = [0.0; 3];
        for (node, weight) in self.nodes.iter().zip(self.node_weights(point)) {
            let v = value(node);
            for (s, c) in sum.iter_mut().zip(v) {
                *s += weight * c;
            }
        }
        sum
    }

    /// Move `point` by blending where each node's plate rotation would take it.
    pub fn advect_point(
        &self,
        point: &UnitVector3,
        stage: impl Fn(PlateId) -> Rotation,
    ) -> UnitVector3 {
        if self.nodes.is_empty() {
            return stage(self.plate_id).rotate(point);
        }
        let mut rotations: HashMap<PlateId, Rotation> = HashMap::new();
        for node in &self.nodes {
            rotations
                .entry(node.plate_id)
                .or_insert_with(|| stage(node.plate_id));
        }
        let [x, y, z] = self.interpolate(point, |node| {
            rotations[&node.plate_id].rotate(point).to_array()
        });
        UnitVector3::from_xyz(x, y, z).unwrap_or(*point)
    }
}

/// Every network resolved by one layer at one time.
#[derive(Debug)]
pub struct ResolvedTopologicalNetworks {
    reconstruct_handle: ReconstructHandle,
    time: f64,
    networks: Vec<ResolvedTopologicalNetwork>,
}

impl ResolvedTopologicalNetworks {
    /// Pass that resolved these networks.
    pub fn reconstruct_handle(&self) -> ReconstructHandle {
        self.reconstruct_handle
    }

    /// Resolution time.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Resolved networks.
    pub fn networks(&self) -> &[ResolvedTopologicalNetwork] {
        &self.networks
    }

    /// The first network containing `point`.
    pub fn network_containing(&self, point: &UnitVector3) -> Option<&ResolvedTopologicalNetwork> {
        self.networks.iter().find(|n| n.contains(point))
    }

    /// Returns true if nothing was resolved.
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

fn is_network_topology(feature: &Feature) -> bool {
    matches!(feature.kind(), FeatureKind::TopologicalNetwork { .. })
}

fn resolve_networks(
    time: f64,
    params: &TopologyNetworkParams,
    topologies: &[Feature],
    sections: &HashMap<FeatureId, SectionGeometry>,
) -> ResolvedTopologicalNetworks {
    let mut networks = Vec::new();
    for feature in topologies {
        let FeatureKind::TopologicalNetwork { boundary, interior } = feature.kind() else {
            continue;
        };
        let Some(joined) = join_sections(boundary, sections) else {
            tracing::trace!(feature = %feature.id(), time, "network boundary section missing");
            continue;
        };
        if joined.len() < 3 {
            continue;
        }
        let mut nodes: Vec<NetworkNode> = joined
            .iter()
            .map(|&(position, plate_id)| NetworkNode { position, plate_id })
            .collect();
        if params.include_interior_geometries {
            for section in interior.iter().filter_map(|id| sections.get(id)) {
                nodes.extend(section.geometry.points().iter().map(|&position| NetworkNode {
                    position,
                    plate_id: section.plate_id,
                }));
            }
        }
        networks.push(ResolvedTopologicalNetwork {
            feature_id: feature.id(),
            plate_id: feature.plate_id().unwrap_or(0),
            boundary: Geometry::Polygon(joined.into_iter().map(|(p, _)| p).collect()),
            nodes,
            interpolation_power: params.interpolation_power,
        });
    }
    ResolvedTopologicalNetworks {
        reconstruct_handle: ReconstructHandle::next(),
        time,
        networks,
    }
}

type RequestKey = (GeoTime, TopologyNetworkParams);

/// Resolves deforming networks from reconstructed sections.
pub(crate) struct TopologyNetworkLayer {
    core: ProxyCore,
    features: WeakFeatureCollections,
    sections: Vec<InputLayer>,
    params: TopologyNetworkParams,
    cache: BoundedCache<RequestKey, Arc<ResolvedTopologicalNetworks>>,
    time_span: Option<(TopologyNetworkParams, Arc<TimeSpanTable<ResolvedTopologicalNetworks>>)>,
}

impl TopologyNetworkLayer {
    pub(crate) fn new(core: ProxyCore, config: &LayerGraphConfig) -> Self {
        Self {
            core,
            features: WeakFeatureCollections::default(),
            sections: Vec::new(),
            params: TopologyNetworkParams::default(),
            cache: BoundedCache::new(config.cache_capacity),
            time_span: None,
        }
    }

    pub(crate) fn params(&self) -> TopologyNetworkParams {
        self.params
    }

    /// Results are keyed by params, so changing them keeps the caches.
    pub(crate) fn set_params(&mut self, params: TopologyNetworkParams) {
        if params == self.params {
            return;
        }
        self.params = params;
        self.core.invalidate(InvalidationReason::ParamsChanged);
    }

    /// Callers have already removed section layers that reconstruct using topologies.
    pub(crate) fn set_sections(&mut self, sections: &[LayerId]) {
        self.sections = input_layers(sections);
        self.invalidate(InvalidationReason::InputsRewired);
    }

    fn resolve(
        graph: &mut LayerGraph,
        core: &ProxyCore,
        features: &WeakFeatureCollections,
        sections: &[InputLayer],
        params: &TopologyNetworkParams,
        time: f64,
    ) -> Result<ResolvedTopologicalNetworks> {
        let topologies: Vec<Feature> = features
            .features(is_network_topology)
            .into_iter()
            .filter(|f| f.is_active_at(time))
            .collect();
        if topologies.is_empty() || sections.is_empty() {
            return Ok(resolve_networks(time, params, &[], &HashMap::new()));
        }
        let section_geometries = resolve_section_geometries(graph, core, sections, time)?;
        Ok(resolve_networks(time, params, &topologies, &section_geometries))
    }

    /// Networks at `time` with the current params. Populates the result cache.
    pub(crate) fn resolved_topological_networks(
        &mut self,
        graph: &mut LayerGraph,
        time: f64,
    ) -> Result<Arc<ResolvedTopologicalNetworks>> {
        self.check_input_layer_proxies(graph);

        let key = (GeoTime::new(time), self.params);
        if let Some(resolved) = self.cache.get(&key) {
            self.core.cache_hit("resolved_topological_networks", &key);
            return Ok(resolved);
        }
        self.core.cache_miss("resolved_topological_networks", &key);

        let resolved = Arc::new(Self::resolve(
            graph,
            &self.core,
            &self.features,
            &self.sections,
            &self.params,
            time,
        )?);
        self.cache.insert(key, resolved.clone());
        self.core.mark_ready();
        Ok(resolved)
    }

    /// Networks resolved at every slot of `range` with the current params.
    /// Populates the time-span table, sharing slots with the previous table
    /// where the params and slot times match.
    pub(crate) fn resolved_network_time_span(
        &mut self,
        graph: &mut LayerGraph,
        range: TimeRange,
    ) -> Result<Arc<TimeSpanTable<ResolvedTopologicalNetworks>>> {
        self.check_input_layer_proxies(graph);

        let params = self.params;
        let previous = match &self.time_span {
            Some((table_params, table)) if *table_params == params => {
                if *table.range() == range {
                    self.core.cache_hit("resolved_network_time_span", &(range, params));
                    return Ok(table.clone());
                }
                Some(table.clone())
            }
            _ => None,
        };
        self.core.cache_miss("resolved_network_time_span", &(range, params));

        let (core, features, sections) = (&self.core, &self.features, &self.sections);
        let (table, reuse) = TimeSpanTable::build(range, previous.as_deref(), |time| {
            Self::resolve(graph, core, features, sections, &params, time).map(Arc::new)
        })?;
        self.core.time_span_built(reuse);

        let table = Arc::new(table);
        self.time_span = Some((params, table.clone()));
        self.core.mark_ready();
        Ok(table)
    }
}

impl LayerNode for TopologyNetworkLayer {
    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProxyCore {
        &mut self.core
    }

    fn check_input_layer_proxies(&mut self, graph: &mut LayerGraph) {
        if let Some(input) = poll_section_inputs(graph, &mut self.sections) {
            self.invalidate(InvalidationReason::InputChanged { input });
        }
    }

    fn clear_caches(&mut self) {
        self.cache.clear();
        self.time_span = None;
    }

    fn input_ids(&self) -> Vec<LayerId> {
        self.sections.iter().map(InputLayer::id).collect()
    }

    fn disconnect_input(&mut self, input: LayerId) -> bool {
        remove_input(&mut self.sections, input)
    }

    fn feature_collections_mut(&mut self) -> Option<&mut WeakFeatureCollections> {
        Some(&mut self.features)
    }

    fn apply_config(&mut self, config: &LayerGraphConfig) {
        self.cache.set_capacity(config.cache_capacity);
    }
}

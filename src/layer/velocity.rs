use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::cache::BoundedCache;
use crate::error::{LayerError, Result};
use crate::feature::{Feature, FeatureId, FeatureKind, PlateId, WeakFeatureCollections};
use crate::geometry::{Geometry, UnitVector3, EARTH_RADIUS_KM};
use crate::graph::{LayerGraph, LayerGraphConfig, LayerId};
use crate::rotation::ReconstructionTree;
use crate::time::GeoTime;
use crate::token::ReconstructHandle;
use crate::tracer::InvalidationReason;

use super::{
    input_layers, poll_inputs, remove_input, InputLayer, LayerKind, LayerNode, ProxyCore,
    ReconstructedSpatialPartition, ResolvedTopologicalBoundaries, ResolvedTopologicalNetworks,
};

// km/Myr to cm/yr.
const KM_PER_MYR_TO_CM_PER_YR: f64 = 0.1;

/// Which interval around the reconstruction time velocities are measured over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeltaTimeType {
    /// From `time + delta` to `time`.
    #[default]
    Older,
    /// From `time` to `time - delta`.
    Younger,
    /// From `time + delta / 2` to `time - delta / 2`.
    Centred,
}

/// How the plate at each domain point is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SolveVelocitiesMethod {
    /// Look the point up in the surface layers: networks, then boundaries,
    /// then static polygons.
    #[default]
    BySurfaces,
    /// Use the plate id of the domain feature.
    ByDomainPlateIds,
}

/// How velocities are calculated.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VelocityParams {
    /// Length of the interval in Myr.
    pub delta_time: f64,
    /// Placement of the interval.
    pub delta_time_type: DeltaTimeType,
    /// Plate lookup.
    pub solve_velocities_method: SolveVelocitiesMethod,
}

impl Default for VelocityParams {
    fn default() -> Self {
        Self {
            delta_time: 1.0,
            delta_time_type: DeltaTimeType::default(),
            solve_velocities_method: SolveVelocitiesMethod::default(),
        }
    }
}

impl VelocityParams {
    /// `(older, younger)` times of the interval at `time`.
    ///
    /// An interval reaching past present day is shifted back to end at 0.
    pub fn time_interval(&self, time: f64) -> (f64, f64) {
        let (older, younger) = match self.delta_time_type {
            DeltaTimeType::Older => (time + self.delta_time, time),
            DeltaTimeType::Younger => (time, time - self.delta_time),
            DeltaTimeType::Centred => (time + self.delta_time / 2.0, time - self.delta_time / 2.0),
        };
        if younger < 0.0 {
            (older - younger, 0.0)
        } else {
            (older, younger)
        }
    }

    /// Checks that `delta_time` is a finite, positive number of Myr.
    pub fn validate(&self) -> Result<()> {
        if self.delta_time.is_finite() && self.delta_time > 0.0 {
            Ok(())
        } else {
            Err(LayerError::InvalidParameter {
                name: "delta_time",
                value: self.delta_time,
                expected: "a finite positive number of Myr",
            })
        }
    }

    fn key(&self) -> (u64, DeltaTimeType, SolveVelocitiesMethod) {
        (
            self.delta_time.to_bits(),
            self.delta_time_type,
            self.solve_velocities_method,
        )
    }
}

impl PartialEq for VelocityParams {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for VelocityParams {}

impl Hash for VelocityParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// A surface velocity in cm/yr, tangent to the sphere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Velocity {
    /// Cartesian components.
    pub vector: [f64; 3],
}

impl Velocity {
    /// Speed in cm/yr.
    pub fn magnitude(&self) -> f64 {
        self.vector.iter().map(|c| c * c).sum::<f64>().sqrt()
    }

    /// `(north, east)` components at `point`.
    pub fn north_east(&self, point: &UnitVector3) -> (f64, f64) {
        let [x, y, z] = point.to_array();
        let lon = y.atan2(x);
        let horizontal = (x * x + y * y).sqrt();
        let east = [-lon.sin(), lon.cos(), 0.0];
        let north = [-z * lon.cos(), -z * lon.sin(), horizontal];
        let dot = |a: [f64; 3]| a.iter().zip(self.vector).map(|(a, b)| a * b).sum::<f64>();
        (dot(north), dot(east))
    }
}

/// Velocity at `point` if it moves with `plate_id`, over `(older, younger)`.
pub(crate) fn plate_velocity(
    tree: &ReconstructionTree,
    plate_id: PlateId,
    point: &UnitVector3,
    (older, younger): (f64, f64),
) -> Velocity {
    let time = tree.time();
    let from = tree.stage_rotation(plate_id, time, older).rotate(point).to_array();
    let to = tree.stage_rotation(plate_id, time, younger).rotate(point).to_array();
    let p = point.to_array();

    let scale = EARTH_RADIUS_KM * KM_PER_MYR_TO_CM_PER_YR / (older - younger);
    let mut v: [f64; 3] = std::array::from_fn(|i| (to[i] - from[i]) * scale);
    let radial: f64 = v.iter().zip(p).map(|(a, b)| a * b).sum();
    for (c, pc) in v.iter_mut().zip(p) {
        *c -= radial * pc;
    }
    Velocity { vector: v }
}

/// What determined the plate motion at a domain point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VelocitySource {
    /// Interpolated inside a deforming network.
    Network(FeatureId),
    /// Inside a resolved plate boundary.
    Boundary(FeatureId),
    /// Inside a reconstructed static polygon.
    StaticPolygon(FeatureId),
    /// The domain feature's own plate id.
    DomainPlateId,
}

/// A domain point and its velocity.
#[derive(Debug, Clone, PartialEq)]
pub struct VelocityPoint {
    /// Domain point.
    pub position: UnitVector3,
    /// `None` if no surface contains the point.
    pub velocity: Option<Velocity>,
    /// Plate the point moves with; `None` inside networks or outside every surface.
    pub plate_id: Option<PlateId>,
    /// `None` if no surface contains the point.
    pub source: Option<VelocitySource>,
}

/// Velocities at the points of one domain feature.
#[derive(Debug, Clone, PartialEq)]
pub struct VelocityField {
    /// Domain feature.
    pub feature_id: FeatureId,
    /// One entry per domain point.
    pub points: Vec<VelocityPoint>,
}

/// Every velocity field computed by one layer for one request.
#[derive(Debug)]
pub struct VelocityFields {
    reconstruct_handle: ReconstructHandle,
    time: f64,
    params: VelocityParams,
    fields: Vec<VelocityField>,
}

impl VelocityFields {
    fn new(time: f64, params: VelocityParams, fields: Vec<VelocityField>) -> Self {
        Self {
            reconstruct_handle: ReconstructHandle::next(),
            time,
            params,
            fields,
        }
    }

    /// Pass that computed these fields.
    pub fn reconstruct_handle(&self) -> ReconstructHandle {
        self.reconstruct_handle
    }

    /// Reconstruction time.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Params the fields were computed with.
    pub fn params(&self) -> &VelocityParams {
        &self.params
    }

    /// One field per domain feature.
    pub fn fields(&self) -> &[VelocityField] {
        &self.fields
    }

    /// Returns true if there were no domain features.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Surface results gathered for one velocity request.
#[derive(Default)]
struct Surfaces {
    networks: Vec<Arc<ResolvedTopologicalNetworks>>,
    boundaries: Vec<Arc<ResolvedTopologicalBoundaries>>,
    static_polygons: Vec<Arc<ReconstructedSpatialPartition>>,
}

impl Surfaces {
    fn velocity_at(
        &self,
        tree: &ReconstructionTree,
        point: &UnitVector3,
        interval: (f64, f64),
    ) -> Option<(Velocity, Option<PlateId>, VelocitySource)> {
        for networks in &self.networks {
            if let Some(network) = networks.network_containing(point) {
                let vector = network.interpolate(point, |node| {
                    plate_velocity(tree, node.plate_id, point, interval).vector
                });
                return Some((
                    Velocity { vector },
                    None,
                    VelocitySource::Network(network.feature_id),
                ));
            }
        }
        for boundaries in &self.boundaries {
            if let Some(boundary) = boundaries.boundary_containing(point) {
                return Some((
                    plate_velocity(tree, boundary.plate_id, point, interval),
                    Some(boundary.plate_id),
                    VelocitySource::Boundary(boundary.feature_id),
                ));
            }
        }
        for partition in &self.static_polygons {
            let polygon = partition
                .query_point(point)
                .into_iter()
                .map(|entry| entry.value())
                .find(|rfg| matches!(*rfg.geometry.geometry(), Geometry::Polygon(_)));
            if let Some(rfg) = polygon {
                return Some((
                    plate_velocity(tree, rfg.plate_id, point, interval),
                    Some(rfg.plate_id),
                    VelocitySource::StaticPolygon(rfg.feature_id),
                ));
            }
        }
        None
    }
}

fn is_velocity_domain(feature: &Feature) -> bool {
    matches!(feature.kind(), FeatureKind::VelocityDomain)
}

type RequestKey = (GeoTime, VelocityParams);

/// Calculates velocities at the points of domain features.
pub(crate) struct VelocityLayer {
    core: ProxyCore,
    features: WeakFeatureCollections,
    reconstruction: Option<InputLayer>,
    surfaces: Vec<InputLayer>,
    params: VelocityParams,
    cache: BoundedCache<RequestKey, Arc<VelocityFields>>,
}

impl VelocityLayer {
    pub(crate) fn new(core: ProxyCore, config: &LayerGraphConfig) -> Self {
        Self {
            core,
            features: WeakFeatureCollections::default(),
            reconstruction: None,
            surfaces: Vec::new(),
            params: VelocityParams::default(),
            cache: BoundedCache::new(config.cache_capacity),
        }
    }

    pub(crate) fn params(&self) -> VelocityParams {
        self.params
    }

    pub(crate) fn set_params(&mut self, params: VelocityParams) {
        if params == self.params {
            return;
        }
        self.params = params;
        self.core.invalidate(InvalidationReason::ParamsChanged);
    }

    pub(crate) fn set_reconstruction_input(&mut self, input: Option<LayerId>) {
        self.reconstruction = input.map(InputLayer::new);
        self.invalidate(InvalidationReason::InputsRewired);
    }

    pub(crate) fn set_surface_inputs(&mut self, inputs: &[LayerId]) {
        self.surfaces = input_layers(inputs);
        self.invalidate(InvalidationReason::InputsRewired);
    }

    /// Velocity fields at `time` with the current params. Populates the result cache.
    pub(crate) fn velocity_fields(
        &mut self,
        graph: &mut LayerGraph,
        time: f64,
    ) -> Result<Arc<VelocityFields>> {
        self.check_input_layer_proxies(graph);

        let key = (GeoTime::new(time), self.params);
        if let Some(fields) = self.cache.get(&key) {
            self.core.cache_hit("velocity_fields", &key);
            return Ok(fields);
        }
        self.core.cache_miss("velocity_fields", &key);

        let fields = Arc::new(self.calculate(graph, time)?);
        self.cache.insert(key, fields.clone());
        self.core.mark_ready();
        Ok(fields)
    }

    fn calculate(&self, graph: &mut LayerGraph, time: f64) -> Result<VelocityFields> {
        let params = self.params;
        let domains: Vec<Feature> = self
            .features
            .features(is_velocity_domain)
            .into_iter()
            .filter(|f| f.is_active_at(time))
            .collect();
        if domains.is_empty() {
            tracing::debug!(layer = %self.core.id, "no velocity domain features");
            return Ok(VelocityFields::new(time, params, Vec::new()));
        }
        let Some(reconstruction) = &self.reconstruction else {
            tracing::debug!(layer = %self.core.id, "no reconstruction layer connected");
            return Ok(VelocityFields::new(time, params, Vec::new()));
        };
        let tree = graph.reconstruction_tree(reconstruction.id(), time)?;
        let interval = params.time_interval(time);

        let surfaces = match params.solve_velocities_method {
            SolveVelocitiesMethod::BySurfaces => self.gather_surfaces(graph, time)?,
            SolveVelocitiesMethod::ByDomainPlateIds => Surfaces::default(),
        };

        let fields = domains
            .iter()
            .map(|domain| {
                let points = domain
                    .geometry()
                    .points()
                    .iter()
                    .map(|point| {
                        let solved = match params.solve_velocities_method {
                            SolveVelocitiesMethod::BySurfaces => {
                                surfaces.velocity_at(&tree, point, interval)
                            }
                            SolveVelocitiesMethod::ByDomainPlateIds => {
                                let plate_id = domain.plate_id().unwrap_or(0);
                                Some((
                                    plate_velocity(&tree, plate_id, point, interval),
                                    Some(plate_id),
                                    VelocitySource::DomainPlateId,
                                ))
                            }
                        };
                        match solved {
                            Some((velocity, plate_id, source)) => VelocityPoint {
                                position: *point,
                                velocity: Some(velocity),
                                plate_id,
                                source: Some(source),
                            },
                            None => VelocityPoint {
                                position: *point,
                                velocity: None,
                                plate_id: None,
                                source: None,
                            },
                        }
                    })
                    .collect();
                VelocityField {
                    feature_id: domain.id(),
                    points,
                }
            })
            .collect();
        Ok(VelocityFields::new(time, params, fields))
    }

    fn gather_surfaces(&self, graph: &mut LayerGraph, time: f64) -> Result<Surfaces> {
        let mut surfaces = Surfaces::default();
        for surface in &self.surfaces {
            let id = surface.id();
            match graph.layer_kind(id) {
                Some(LayerKind::TopologyNetworkResolver) => surfaces
                    .networks
                    .push(graph.resolved_topological_networks(id, time)?),
                Some(LayerKind::TopologyBoundaryResolver) => surfaces
                    .boundaries
                    .push(graph.resolved_topological_boundaries(id, time)?),
                Some(LayerKind::Reconstruct) => surfaces
                    .static_polygons
                    .push(graph.reconstructed_spatial_partition(id, time)?),
                _ => {}
            }
        }
        Ok(surfaces)
    }
}

impl LayerNode for VelocityLayer {
    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProxyCore {
        &mut self.core
    }

    fn check_input_layer_proxies(&mut self, graph: &mut LayerGraph) {
        let inputs = self.reconstruction.iter_mut().chain(self.surfaces.iter_mut());
        if let Some(input) = poll_inputs(graph, inputs) {
            self.invalidate(InvalidationReason::InputChanged { input });
        }
    }

    fn clear_caches(&mut self) {
        self.cache.clear();
    }

    fn input_ids(&self) -> Vec<LayerId> {
        self.reconstruction
            .iter()
            .chain(&self.surfaces)
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
        remove_input(&mut self.surfaces, input) || was_reconstruction
    }

    fn feature_collections_mut(&mut self) -> Option<&mut WeakFeatureCollections> {
        Some(&mut self.features)
    }

    fn apply_config(&mut self, config: &LayerGraphConfig) {
        self.cache.set_capacity(config.cache_capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::LatLonPoint;
    use crate::rotation::EulerPoleRotationModel;

    #[test]
    fn test_time_interval_shifts_at_present_day() {
        let params = VelocityParams {
            delta_time_type: DeltaTimeType::Younger,
            ..Default::default()
        };
        assert_eq!(params.time_interval(10.0), (10.0, 9.0));
        assert_eq!(params.time_interval(0.0), (1.0, 0.0));

        let centred = VelocityParams {
            delta_time: 2.0,
            delta_time_type: DeltaTimeType::Centred,
            ..Default::default()
        };
        assert_eq!(centred.time_interval(10.0), (11.0, 9.0));
    }

    #[test]
    fn test_equatorial_plate_velocity() {
        let mut model = EulerPoleRotationModel::new();
        model.add_constant_rate_plate(1, 0, LatLonPoint::new(90.0, 0.0), 1.0);
        let tree = ReconstructionTree::new(Arc::new(model), 10.0, 0);
        let point = UnitVector3::from_lat_lon(0.0, 10.0);

        let velocity = plate_velocity(&tree, 1, &point, (11.0, 10.0));
        // One degree per Myr at the equator is about 11.1 cm/yr.
        let expected = EARTH_RADIUS_KM * 1f64.to_radians() * 0.1;
        assert!((velocity.magnitude() - expected).abs() < 1e-2);

        let (north, east) = velocity.north_east(&point);
        assert!(north.abs() < 1e-6);
        // Going back in time the plate moves east, so forwards it moves west.
        assert!(east < 0.0);
    }
}

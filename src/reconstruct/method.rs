use std::fmt;
use std::sync::Arc;

use anyhow::Context as _;

use crate::cache::BoundedCache;
use crate::feature::{Feature, FeatureKind, PlateId};
use crate::geometry::{DeferredGeometry, Geometry, Rotation, UnitVector3};
use crate::layer::{
    ReconstructedFeatureGeometry, ResolvedTopologicalBoundaries, ResolvedTopologicalNetworks,
};
use crate::rotation::ReconstructionTree;
use crate::time::{geo_times_equal, GeoTime, TimeRange};
use crate::time_span::TimeSpanTable;

use super::ReconstructParams;

const HALF_STAGE_MEMO_CAPACITY: usize = 32;

/// Resolved topologies over a time span, consumed when reconstructing by topologies.
///
/// Every table shares the same [`TimeRange`].
#[derive(Debug, Clone)]
pub struct TopologyTimeSpans {
    /// Slots shared by every table.
    pub range: TimeRange,
    /// Resolved plate boundaries per slot, one table per boundary layer.
    pub boundaries: Vec<Arc<TimeSpanTable<ResolvedTopologicalBoundaries>>>,
    /// Resolved deforming networks per slot, one table per network layer.
    pub networks: Vec<Arc<TimeSpanTable<ResolvedTopologicalNetworks>>>,
}

impl TopologyTimeSpans {
    /// Move `point` from `from_time` to `to_time` using the topologies of slot `slot`.
    ///
    /// Networks take precedence over boundaries; points outside every
    /// topology move rigidly with `fallback_plate_id`.
    pub fn advect_point(
        &self,
        point: &UnitVector3,
        slot: usize,
        from_time: f64,
        to_time: f64,
        tree: &ReconstructionTree,
        fallback_plate_id: PlateId,
    ) -> UnitVector3 {
        let stage = |plate_id: PlateId| tree.stage_rotation(plate_id, from_time, to_time);

        for table in &self.networks {
            let Some(networks) = table.slot(slot) else {
                continue;
            };
            if let Some(network) = networks.network_containing(point) {
                return network.advect_point(point, &stage);
            }
        }
        for table in &self.boundaries {
            let Some(boundaries) = table.slot(slot) else {
                continue;
            };
            if let Some(boundary) = boundaries.boundary_containing(point) {
                return stage(boundary.plate_id).rotate(point);
            }
        }
        stage(fallback_plate_id).rotate(point)
    }
}

/// Inputs available to a strategy for one reconstruction.
#[derive(Debug, Clone, Copy)]
pub struct ReconstructRequest<'a> {
    /// Reconstruction time.
    pub time: f64,
    /// Plate rotations at `time`.
    pub tree: &'a ReconstructionTree,
    /// Params the context was created with.
    pub params: &'a ReconstructParams,
    /// Resolved topologies, when reconstructing using topologies.
    pub topologies: Option<&'a TopologyTimeSpans>,
}

/// A strategy instance bound to one feature.
///
/// Instances live in a reconstruct context and may keep state between calls,
/// such as memoised rotations or the positions of previous time slots.
pub trait ReconstructMethod: Send + fmt::Debug {
    /// Reconstruct the feature at `request.time`.
    ///
    /// Returns no geometries when the feature does not exist at that time.
    fn reconstruct(
        &mut self,
        request: &ReconstructRequest<'_>,
    ) -> anyhow::Result<Vec<ReconstructedFeatureGeometry>>;
}

/// Decides which features a strategy handles and creates its instances.
pub trait ReconstructMethodType: Send + Sync + fmt::Debug {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Returns true if this strategy can reconstruct `feature` with `params`.
    fn can_reconstruct(&self, feature: &Feature, params: &ReconstructParams) -> bool;

    /// Create a strategy instance for `feature`.
    fn create(&self, feature: &Feature, params: &ReconstructParams) -> Box<dyn ReconstructMethod>;
}

/// An ordered list of strategies; the first that accepts a feature is used.
///
/// Custom strategies are tried before the built-in ones, in registration order.
#[derive(Debug, Clone)]
pub struct ReconstructMethodRegistry {
    types: Vec<Arc<dyn ReconstructMethodType>>,
    num_custom: usize,
}

impl Default for ReconstructMethodRegistry {
    fn default() -> Self {
        Self {
            types: vec![
                Arc::new(ByTopologies),
                Arc::new(HalfStageRotation),
                Arc::new(ByPlateId),
            ],
            num_custom: 0,
        }
    }
}

impl ReconstructMethodRegistry {
    /// A registry holding only the built-in strategies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a strategy ahead of the built-in ones.
    pub fn register(&mut self, method_type: impl ReconstructMethodType + 'static) -> &mut Self {
        self.types.insert(self.num_custom, Arc::new(method_type));
        self.num_custom += 1;
        self
    }

    /// The strategy to use for `feature`.
    pub fn select(
        &self,
        feature: &Feature,
        params: &ReconstructParams,
    ) -> Option<&Arc<dyn ReconstructMethodType>> {
        self.types
            .iter()
            .find(|method_type| method_type.can_reconstruct(feature, params))
    }

    /// Strategy names in selection order.
    pub fn names(&self) -> Vec<&'static str> {
        self.types.iter().map(|t| t.name()).collect()
    }
}

fn is_reconstructable(feature: &Feature) -> bool {
    matches!(feature.kind(), FeatureKind::Reconstructable)
}

fn skip_inactive(feature: &Feature, request: &ReconstructRequest<'_>) -> bool {
    !feature.is_active_at(request.time)
        && !request
            .params
            .reconstruct_by_plate_id_outside_active_time_period
}

/// Rigid rotation by the feature's plate id (plate 0 when absent).
///
/// The output keeps the present-day geometry and the rotation, so vertices are
/// only rotated if a consumer looks at them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByPlateId;

impl ReconstructMethodType for ByPlateId {
    fn name(&self) -> &'static str {
        "by-plate-id"
    }

    fn can_reconstruct(&self, feature: &Feature, _params: &ReconstructParams) -> bool {
        is_reconstructable(feature)
    }

    fn create(&self, feature: &Feature, _params: &ReconstructParams) -> Box<dyn ReconstructMethod> {
        Box::new(ByPlateIdMethod {
            feature: feature.clone(),
        })
    }
}

#[derive(Debug)]
struct ByPlateIdMethod {
    feature: Feature,
}

impl ReconstructMethod for ByPlateIdMethod {
    fn reconstruct(
        &mut self,
        request: &ReconstructRequest<'_>,
    ) -> anyhow::Result<Vec<ReconstructedFeatureGeometry>> {
        if skip_inactive(&self.feature, request) {
            return Ok(Vec::new());
        }
        let plate_id = self.feature.plate_id().unwrap_or(0);
        Ok(vec![ReconstructedFeatureGeometry {
            feature_id: self.feature.id(),
            plate_id,
            geometry: DeferredGeometry::Rotated {
                present_day: self.feature.geometry().clone(),
                rotation: request.tree.rotation(plate_id),
            },
        }])
    }
}

/// Rotation halfway between the left and right plates, as used for spreading ridges.
#[derive(Debug, Clone, Copy, Default)]
pub struct HalfStageRotation;

impl ReconstructMethodType for HalfStageRotation {
    fn name(&self) -> &'static str {
        "half-stage-rotation"
    }

    fn can_reconstruct(&self, feature: &Feature, _params: &ReconstructParams) -> bool {
        is_reconstructable(feature) && feature.left_right_plate_ids().is_some()
    }

    fn create(&self, feature: &Feature, _params: &ReconstructParams) -> Box<dyn ReconstructMethod> {
        Box::new(HalfStageRotationMethod {
            feature: feature.clone(),
            rotations: BoundedCache::new(HALF_STAGE_MEMO_CAPACITY),
        })
    }
}

#[derive(Debug)]
struct HalfStageRotationMethod {
    feature: Feature,
    rotations: BoundedCache<GeoTime, Rotation>,
}

impl ReconstructMethod for HalfStageRotationMethod {
    fn reconstruct(
        &mut self,
        request: &ReconstructRequest<'_>,
    ) -> anyhow::Result<Vec<ReconstructedFeatureGeometry>> {
        if skip_inactive(&self.feature, request) {
            return Ok(Vec::new());
        }
        let (left, right) = self
            .feature
            .left_right_plate_ids()
            .with_context(|| format!("{} has no left/right plate ids", self.feature.id()))?;

        let key = GeoTime::new(request.time);
        let rotation = match self.rotations.get(&key) {
            Some(rotation) => rotation,
            None => {
                let tree = request.tree;
                let rotation = tree.rotation(left).interpolate(&tree.rotation(right), 0.5);
                self.rotations.insert(key, rotation);
                rotation
            }
        };
        Ok(vec![ReconstructedFeatureGeometry {
            feature_id: self.feature.id(),
            plate_id: self.feature.plate_id().unwrap_or(left),
            geometry: DeferredGeometry::Rotated {
                present_day: self.feature.geometry().clone(),
                rotation,
            },
        }])
    }
}

/// Moves vertices slot by slot through resolved topologies.
///
/// Only selected when the params reconstruct using topologies.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByTopologies;

impl ReconstructMethodType for ByTopologies {
    fn name(&self) -> &'static str {
        "by-topologies"
    }

    fn can_reconstruct(&self, feature: &Feature, params: &ReconstructParams) -> bool {
        is_reconstructable(feature) && params.reconstruct_using_topologies
    }

    fn create(&self, feature: &Feature, _params: &ReconstructParams) -> Box<dyn ReconstructMethod> {
        Box::new(ByTopologiesMethod {
            feature: feature.clone(),
            history: None,
        })
    }
}

/// Vertex positions at each slot already visited.
#[derive(Debug)]
struct TopologyHistory {
    range: TimeRange,
    positions: Vec<Arc<Vec<UnitVector3>>>,
}

#[derive(Debug)]
struct ByTopologiesMethod {
    feature: Feature,
    history: Option<TopologyHistory>,
}

impl ByTopologiesMethod {
    fn plate_id(&self) -> PlateId {
        self.feature.plate_id().unwrap_or(0)
    }

    fn rigid(&self, request: &ReconstructRequest<'_>) -> ReconstructedFeatureGeometry {
        let plate_id = self.plate_id();
        ReconstructedFeatureGeometry {
            feature_id: self.feature.id(),
            plate_id,
            geometry: DeferredGeometry::Rotated {
                present_day: self.feature.geometry().clone(),
                rotation: request.tree.rotation(plate_id),
            },
        }
    }

    /// Positions at `slot`, advecting from the last visited slot as needed.
    fn positions_at_slot(
        &mut self,
        spans: &TopologyTimeSpans,
        slot: usize,
        tree: &ReconstructionTree,
    ) -> Arc<Vec<UnitVector3>> {
        let plate_id = self.plate_id();
        let range = spans.range;
        let history = match &mut self.history {
            Some(history) if history.range == range => history,
            history => {
                // Slot 0 is the present-day geometry moved rigidly to the first slot time.
                let to_begin = tree.stage_rotation(plate_id, 0.0, range.begin());
                let initial = self
                    .feature
                    .geometry()
                    .points()
                    .iter()
                    .map(|p| to_begin.rotate(p))
                    .collect();
                history.insert(TopologyHistory {
                    range,
                    positions: vec![Arc::new(initial)],
                })
            }
        };
        while history.positions.len() <= slot {
            let index = history.positions.len() - 1;
            let (from, to) = (range.slot_time(index), range.slot_time(index + 1));
            let previous = &history.positions[index];
            let next = previous
                .iter()
                .map(|p| spans.advect_point(p, index, from, to, tree, plate_id))
                .collect();
            history.positions.push(Arc::new(next));
        }
        history.positions[slot].clone()
    }
}

impl ReconstructMethod for ByTopologiesMethod {
    fn reconstruct(
        &mut self,
        request: &ReconstructRequest<'_>,
    ) -> anyhow::Result<Vec<ReconstructedFeatureGeometry>> {
        if skip_inactive(&self.feature, request) {
            return Ok(Vec::new());
        }
        let Some(spans) = request.topologies else {
            return Ok(vec![self.rigid(request)]);
        };
        let Some(slot) = spans.range.slot_at_or_before(request.time) else {
            return Ok(vec![self.rigid(request)]);
        };

        let positions = self.positions_at_slot(spans, slot, request.tree);
        let slot_time = spans.range.slot_time(slot);
        let points: Vec<UnitVector3> = if geo_times_equal(slot_time, request.time) {
            (*positions).clone()
        } else {
            let plate_id = self.plate_id();
            positions
                .iter()
                .map(|p| spans.advect_point(p, slot, slot_time, request.time, request.tree, plate_id))
                .collect()
        };

        let geometry: Geometry = self.feature.geometry().with_points(points);
        Ok(vec![ReconstructedFeatureGeometry {
            feature_id: self.feature.id(),
            plate_id: self.plate_id(),
            geometry: geometry.into(),
        }])
    }
}

//! In-memory feature data consumed by the layer graph.
//!
//! Feature collections are owned by the application and shared with layers as
//! `Arc`s. Layers only keep `Weak` references, and learn about edits through
//! the graph's `add_feature_collection`, `remove_feature_collection` and
//! `modified_feature_collection` notifications.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::geometry::Geometry;
use crate::time::GEO_TIME_EPSILON;

/// Identifier of a tectonic plate in a rotation model.
pub type PlateId = u32;

static NEXT_FEATURE_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FeatureId(pub u64);

impl FeatureId {
    /// Allocate an identifier not handed out before in this process.
    pub fn next() -> Self {
        FeatureId(NEXT_FEATURE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "feature:{}", self.0)
    }
}

/// The period, in Myr before present, during which a feature exists.
///
/// `begin` is the older bound and `end` the younger one.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ValidTime {
    /// Time the feature appears.
    pub begin: f64,
    /// Time the feature disappears.
    pub end: f64,
}

impl ValidTime {
    /// Valid from the distant past to the distant future.
    pub const ALWAYS: ValidTime = ValidTime {
        begin: f64::INFINITY,
        end: f64::NEG_INFINITY,
    };

    /// Create a valid-time period.
    pub fn new(begin: f64, end: f64) -> Self {
        Self { begin, end }
    }

    /// Returns true if `time` falls within the period.
    pub fn contains(&self, time: f64) -> bool {
        time <= self.begin + GEO_TIME_EPSILON && time >= self.end - GEO_TIME_EPSILON
    }
}

impl Default for ValidTime {
    fn default() -> Self {
        Self::ALWAYS
    }
}

/// What a feature represents, and therefore which layer kind consumes it.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureKind {
    /// Geometry moved rigidly, by half-stage rotation or by topologies.
    Reconstructable,
    /// A closed plate boundary built from reconstructed section features.
    TopologicalBoundary {
        /// Section features joined end to end, in order.
        sections: Vec<FeatureId>,
    },
    /// An open line built from reconstructed section features.
    TopologicalLine {
        /// Section features joined end to end, in order.
        sections: Vec<FeatureId>,
    },
    /// A deforming region bounded by sections, with optional interior geometries.
    TopologicalNetwork {
        /// Boundary section features joined end to end, in order.
        boundary: Vec<FeatureId>,
        /// Features whose vertices become interior network nodes.
        interior: Vec<FeatureId>,
    },
    /// Points at which velocities are calculated.
    VelocityDomain,
    /// Scalar samples, one per vertex of the feature geometry.
    ScalarField {
        /// Sample values.
        samples: Vec<f64>,
    },
}

/// A single feature.
///
/// # Examples
///
/// ```
/// # use layer_flow::{Feature, FeatureId, FeatureKind, Geometry, UnitVector3, ValidTime};
/// let feature = Feature::new(
///     FeatureId(7),
///     FeatureKind::Reconstructable,
///     Geometry::Point(UnitVector3::from_lat_lon(0.0, 0.0)),
/// )
/// .with_plate_id(801)
/// .with_valid_time(ValidTime::new(200.0, 0.0));
///
/// assert!(feature.is_active_at(100.0));
/// assert!(!feature.is_active_at(250.0));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    id: FeatureId,
    kind: FeatureKind,
    geometry: Arc<Geometry>,
    plate_id: Option<PlateId>,
    left_plate_id: Option<PlateId>,
    right_plate_id: Option<PlateId>,
    valid_time: ValidTime,
}

impl Feature {
    /// Create a feature with no plate ids that is always valid.
    pub fn new(id: FeatureId, kind: FeatureKind, geometry: Geometry) -> Self {
        Self {
            id,
            kind,
            geometry: Arc::new(geometry),
            plate_id: None,
            left_plate_id: None,
            right_plate_id: None,
            valid_time: ValidTime::ALWAYS,
        }
    }

    /// Set the reconstruction plate id.
    #[must_use]
    pub fn with_plate_id(mut self, plate_id: PlateId) -> Self {
        self.plate_id = Some(plate_id);
        self
    }

    /// Set the plates on either side, as carried by mid-ocean ridges.
    #[must_use]
    pub fn with_left_right_plate_ids(mut self, left: PlateId, right: PlateId) -> Self {
        self.left_plate_id = Some(left);
        self.right_plate_id = Some(right);
        self
    }

    /// Set the valid-time period.
    #[must_use]
    pub fn with_valid_time(mut self, valid_time: ValidTime) -> Self {
        self.valid_time = valid_time;
        self
    }

    /// Feature identity.
    pub fn id(&self) -> FeatureId {
        self.id
    }

    /// Feature kind.
    pub fn kind(&self) -> &FeatureKind {
        &self.kind
    }

    /// Present-day geometry.
    pub fn geometry(&self) -> &Arc<Geometry> {
        &self.geometry
    }

    /// Reconstruction plate id, if any.
    pub fn plate_id(&self) -> Option<PlateId> {
        self.plate_id
    }

    /// Left and right plate ids, if both are set.
    pub fn left_right_plate_ids(&self) -> Option<(PlateId, PlateId)> {
        self.left_plate_id.zip(self.right_plate_id)
    }

    /// Valid-time period.
    pub fn valid_time(&self) -> ValidTime {
        self.valid_time
    }

    /// Returns true if the feature exists at `time`.
    pub fn is_active_at(&self, time: f64) -> bool {
        self.valid_time.contains(time)
    }
}

/// A named, editable set of features.
///
/// Editing a collection does not notify anyone by itself; call
/// `LayerGraph::modified_feature_collection` afterwards.
#[derive(Debug)]
pub struct FeatureCollection {
    name: String,
    features: RwLock<Vec<Feature>>,
}

impl FeatureCollection {
    /// Create a shared collection.
    pub fn new(name: impl Into<String>, features: Vec<Feature>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            features: RwLock::new(features),
        })
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read access to the features.
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<Feature>> {
        self.features.read()
    }

    /// Write access to the features.
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<Feature>> {
        self.features.write()
    }

    /// Append a feature.
    pub fn add_feature(&self, feature: Feature) {
        self.features.write().push(feature);
    }

    /// Remove the feature with `id`, returning it.
    pub fn remove_feature(&self, id: FeatureId) -> Option<Feature> {
        let mut features = self.features.write();
        let index = features.iter().position(|f| f.id() == id)?;
        Some(features.remove(index))
    }

    /// Replace the feature with the same id, returning the old one.
    pub fn replace_feature(&self, feature: Feature) -> Option<Feature> {
        let mut features = self.features.write();
        let slot = features.iter_mut().find(|f| f.id() == feature.id())?;
        Some(std::mem::replace(slot, feature))
    }

    /// A copy of the feature with `id`.
    pub fn feature(&self, id: FeatureId) -> Option<Feature> {
        self.features.read().iter().find(|f| f.id() == id).cloned()
    }
}

/// The feature collections a layer reads from, held weakly.
#[derive(Debug, Default)]
pub(crate) struct WeakFeatureCollections {
    collections: Vec<Weak<FeatureCollection>>,
}

impl WeakFeatureCollections {
    /// Returns false if the collection was already present.
    pub(crate) fn add(&mut self, collection: &Arc<FeatureCollection>) -> bool {
        if self.contains(collection) {
            return false;
        }
        self.collections.push(Arc::downgrade(collection));
        true
    }

    /// Returns false if the collection was not present.
    pub(crate) fn remove(&mut self, collection: &Arc<FeatureCollection>) -> bool {
        let target = Arc::downgrade(collection);
        let before = self.collections.len();
        self.collections.retain(|weak| !weak.ptr_eq(&target));
        self.collections.len() != before
    }

    /// Drop collections whose last strong reference is gone. Returns the
    /// number dropped.
    pub(crate) fn prune_expired(&mut self) -> usize {
        let before = self.collections.len();
        self.collections.retain(|weak| weak.strong_count() > 0);
        before - self.collections.len()
    }

    pub(crate) fn contains(&self, collection: &Arc<FeatureCollection>) -> bool {
        let target = Arc::downgrade(collection);
        self.collections.iter().any(|weak| weak.ptr_eq(&target))
    }

    /// Copies of the features in live collections that satisfy `filter`.
    pub(crate) fn features(&self, filter: impl Fn(&Feature) -> bool) -> Vec<Feature> {
        self.collections
            .iter()
            .filter_map(Weak::upgrade)
            .flat_map(|collection| {
                collection
                    .read()
                    .iter()
                    .filter(|f| filter(f))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::UnitVector3;

    fn point_feature(id: u64) -> Feature {
        Feature::new(
            FeatureId(id),
            FeatureKind::Reconstructable,
            Geometry::Point(UnitVector3::from_lat_lon(0.0, 0.0)),
        )
    }

    #[test]
    fn test_valid_time_bounds_are_inclusive() {
        let valid = ValidTime::new(100.0, 10.0);
        assert!(valid.contains(100.0));
        assert!(valid.contains(10.0));
        assert!(!valid.contains(100.1));
        assert!(!valid.contains(9.9));
        assert!(ValidTime::ALWAYS.contains(1e9));
    }

    #[test]
    fn test_collection_edits() {
        let collection = FeatureCollection::new("points", vec![point_feature(1), point_feature(2)]);
        assert!(collection.remove_feature(FeatureId(1)).is_some());
        assert!(collection.remove_feature(FeatureId(1)).is_none());

        let replaced = collection.replace_feature(point_feature(2).with_plate_id(9));
        assert_eq!(replaced.and_then(|f| f.plate_id()), None);
        assert_eq!(collection.feature(FeatureId(2)).and_then(|f| f.plate_id()), Some(9));
    }

    #[test]
    fn test_weak_collections_skip_dropped() {
        let kept = FeatureCollection::new("kept", vec![point_feature(1)]);
        let dropped = FeatureCollection::new("dropped", vec![point_feature(2)]);

        let mut weak = WeakFeatureCollections::default();
        assert!(weak.add(&kept));
        assert!(!weak.add(&kept));
        assert!(weak.add(&dropped));
        drop(dropped);

        let ids: Vec<_> = weak.features(|_| true).iter().map(Feature::id).collect();
        assert_eq!(ids, vec![FeatureId(1)]);

        assert!(weak.remove(&kept));
        assert!(weak.features(|_| true).is_empty());
    }
}

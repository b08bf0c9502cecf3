//! Tests for result caching and invalidation of reconstruct layers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use layer_flow::{
    ByPlateId, EulerPoleRotationModel, Feature, FeatureCollection, FeatureId, FeatureKind,
    Geometry, InvalidationReason, LatLonPoint, LayerError, LayerGraph, LayerId, LayerState,
    ReconstructMethod, ReconstructMethodType, ReconstructParams, ReconstructRequest,
    ReconstructedFeatureGeometry, Tracer, TracerRequestKey, UnitVector3, ValidTime,
};

// ============================================================================
// Fixtures
// ============================================================================

const FAILING_PLATE: u32 = 99;

#[derive(Debug)]
struct Counting {
    calls: Arc<AtomicUsize>,
}

impl ReconstructMethodType for Counting {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn can_reconstruct(&self, feature: &Feature, _params: &ReconstructParams) -> bool {
        matches!(feature.kind(), FeatureKind::Reconstructable)
    }

    fn create(&self, feature: &Feature, params: &ReconstructParams) -> Box<dyn ReconstructMethod> {
        Box::new(CountingMethod {
            calls: self.calls.clone(),
            fails: feature.plate_id() == Some(FAILING_PLATE),
            inner: ByPlateId.create(feature, params),
        })
    }
}

#[derive(Debug)]
struct CountingMethod {
    calls: Arc<AtomicUsize>,
    fails: bool,
    inner: Box<dyn ReconstructMethod>,
}

impl ReconstructMethod for CountingMethod {
    fn reconstruct(
        &mut self,
        request: &ReconstructRequest<'_>,
    ) -> anyhow::Result<Vec<ReconstructedFeatureGeometry>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fails {
            anyhow::bail!("no rotation for plate {FAILING_PLATE}");
        }
        self.inner.reconstruct(request)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Hit(LayerId, &'static str),
    Miss(LayerId, &'static str),
    Invalidated(LayerId, InvalidationReason),
}

#[derive(Default)]
struct Recorder(Mutex<Vec<Event>>);

impl Recorder {
    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl Tracer for Recorder {
    fn on_cache_hit(&self, layer: LayerId, key: &TracerRequestKey) {
        self.0.lock().push(Event::Hit(layer, key.query));
    }

    fn on_cache_miss(&self, layer: LayerId, key: &TracerRequestKey) {
        self.0.lock().push(Event::Miss(layer, key.query));
    }

    fn on_layer_invalidated(&self, layer: LayerId, reason: &InvalidationReason) {
        self.0.lock().push(Event::Invalidated(layer, reason.clone()));
    }
}

struct Fixture {
    graph: LayerGraph,
    rotation: LayerId,
    reconstruct: LayerId,
    features: Arc<FeatureCollection>,
    calls: Arc<AtomicUsize>,
    recorder: Arc<Recorder>,
}

impl Fixture {
    fn new(cache_capacity: usize) -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let recorder = Arc::new(Recorder::default());
        let mut graph = LayerGraph::builder()
            .cache_capacity(cache_capacity)
            .register_reconstruct_method(Counting {
                calls: calls.clone(),
            })
            .tracer(recorder.clone())
            .build();

        let mut model = EulerPoleRotationModel::new();
        let pole = LatLonPoint::new(90.0, 0.0);
        model.add_constant_rate_plate(1, 0, pole, 1.0);
        model.add_constant_rate_plate(2, 0, pole, 2.0);

        let rotation = graph.add_reconstruction_layer(Arc::new(model));
        let reconstruct = graph.add_reconstruct_layer();
        graph
            .set_reconstruction_input(reconstruct, Some(rotation))
            .unwrap();

        let features = FeatureCollection::new("points", vec![point_feature(1, 0.0)]);
        assert!(graph.add_feature_collection(reconstruct, &features));
        recorder.take();

        Self {
            graph,
            rotation,
            reconstruct,
            features,
            calls,
            recorder,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn longitudes(&mut self, time: f64) -> Vec<f64> {
        let geometries = self
            .graph
            .reconstructed_feature_geometries(self.reconstruct, time)
            .unwrap();
        geometries
            .iter()
            .map(|rfg| rfg.geometry.geometry().points()[0].to_lat_lon().longitude)
            .collect()
    }
}

fn point_feature(plate_id: u32, longitude: f64) -> Feature {
    Feature::new(
        FeatureId::next(),
        FeatureKind::Reconstructable,
        Geometry::Point(UnitVector3::from_lat_lon(0.0, longitude)),
    )
    .with_plate_id(plate_id)
}

fn assert_close(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} != {expected:?}");
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-9, "{actual:?} != {expected:?}");
    }
}

// ============================================================================
// Cache coherence
// ============================================================================

#[test]
fn test_repeated_query_is_served_from_cache() {
    let mut f = Fixture::new(16);
    let first = f
        .graph
        .reconstructed_feature_geometries(f.reconstruct, 10.0)
        .unwrap();
    let second = f
        .graph
        .reconstructed_feature_geometries(f.reconstruct, 10.0)
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(f.calls(), 1);
    assert_eq!(first.reconstruct_handle(), second.reconstruct_handle());

    let events = f.recorder.take();
    assert!(events.contains(&Event::Miss(f.reconstruct, "reconstructed_feature_geometries")));
    assert!(events.contains(&Event::Hit(f.reconstruct, "reconstructed_feature_geometries")));
}

#[test]
fn test_times_within_tolerance_share_an_entry() {
    let mut f = Fixture::new(16);
    assert_close(&f.longitudes(10.0), &[10.0]);
    f.longitudes(10.0 + 5e-7);
    f.longitudes(10.0 - 1e-6);
    assert_eq!(f.calls(), 1);

    f.longitudes(10.0 + 2e-6);
    assert_eq!(f.calls(), 2);
}

#[test]
fn test_least_recently_used_entry_is_evicted() {
    let mut f = Fixture::new(2);
    f.longitudes(1.0);
    f.longitudes(2.0);
    f.longitudes(1.0);
    assert_eq!(f.calls(), 2);

    // 2.0 is now least recently used.
    f.longitudes(3.0);
    f.longitudes(1.0);
    assert_eq!(f.calls(), 3);
    f.longitudes(2.0);
    assert_eq!(f.calls(), 4);
}

#[test]
fn test_shrinking_capacity_evicts_immediately() {
    let mut f = Fixture::new(4);
    for time in [1.0, 2.0, 3.0] {
        f.longitudes(time);
    }
    f.graph.set_cache_capacity(1);
    f.longitudes(3.0);
    assert_eq!(f.calls(), 3);
    f.longitudes(1.0);
    assert_eq!(f.calls(), 4);
}

#[test]
fn test_params_are_part_of_the_key() {
    let mut f = Fixture::new(16);
    let young = f.features.read()[0].clone();
    f.features
        .replace_feature(young.with_valid_time(ValidTime::new(5.0, 0.0)));
    f.graph.modified_feature_collection(&f.features);

    assert!(f.longitudes(10.0).is_empty());

    let params = ReconstructParams {
        reconstruct_by_plate_id_outside_active_time_period: true,
        ..Default::default()
    };
    let outside = f
        .graph
        .reconstructed_feature_geometries_with_params(f.reconstruct, 10.0, &params)
        .unwrap();
    assert_eq!(outside.len(), 1);

    // Both entries stay cached side by side.
    assert!(f.longitudes(10.0).is_empty());
    f.graph
        .reconstructed_feature_geometries_with_params(f.reconstruct, 10.0, &params)
        .unwrap();
    assert_eq!(f.calls(), 2);
}

#[test]
fn test_contexts_are_released_with_their_entries() {
    let mut f = Fixture::new(4);
    let other = ReconstructParams {
        reconstruct_by_plate_id_outside_active_time_period: true,
        ..Default::default()
    };
    f.longitudes(1.0);
    f.graph
        .reconstructed_feature_geometries_with_params(f.reconstruct, 1.0, &other)
        .unwrap();
    assert_eq!(f.graph.live_reconstruct_contexts(f.reconstruct).unwrap(), 2);

    // Evicts the entry made with the default params.
    f.graph.set_cache_capacity(1);
    assert_eq!(f.graph.live_reconstruct_contexts(f.reconstruct).unwrap(), 1);
}

// ============================================================================
// Invalidation
// ============================================================================

#[test]
fn test_feature_edit_invalidates_layer() {
    let mut f = Fixture::new(16);
    let observer = f.graph.subject_token(f.reconstruct).observer();
    f.longitudes(10.0);

    f.features.add_feature(point_feature(2, 0.0));
    assert_eq!(f.graph.modified_feature_collection(&f.features), 1);
    assert!(!f.graph.subject_token(f.reconstruct).is_up_to_date(&observer));

    let mut longitudes = f.longitudes(10.0);
    longitudes.sort_by(f64::total_cmp);
    assert_close(&longitudes, &[10.0, 20.0]);
}

#[test]
fn test_rotation_change_reaches_downstream_layer() {
    let mut f = Fixture::new(16);
    assert_close(&f.longitudes(10.0), &[10.0]);
    let observer = f.graph.subject_token(f.reconstruct).observer();

    f.graph.set_anchor_plate_id(f.rotation, 1).unwrap();
    assert!(!f.graph.subject_token(f.reconstruct).is_up_to_date(&observer));
    // Relative to plate 1, plate 1 does not move.
    assert_close(&f.longitudes(10.0), &[0.0]);

    let events = f.recorder.take();
    assert!(events.contains(&Event::Invalidated(
        f.reconstruct,
        InvalidationReason::InputChanged { input: f.rotation }
    )));
}

#[test]
fn test_replaced_rotation_model_is_used() {
    let mut f = Fixture::new(16);
    assert_close(&f.longitudes(10.0), &[10.0]);

    let mut model = EulerPoleRotationModel::new();
    model.add_constant_rate_plate(1, 0, LatLonPoint::new(90.0, 0.0), 3.0);
    f.graph
        .set_rotation_model(f.rotation, Arc::new(model))
        .unwrap();
    assert_close(&f.longitudes(10.0), &[30.0]);
}

#[test]
fn test_unchanged_layer_is_not_invalidated() {
    let mut f = Fixture::new(16);
    f.longitudes(10.0);
    let observer = f.graph.subject_token(f.reconstruct).observer();
    f.longitudes(20.0);
    assert!(f.graph.subject_token(f.reconstruct).is_up_to_date(&observer));
}

#[test]
fn test_layer_state_transitions() {
    let mut f = Fixture::new(16);
    assert_eq!(f.graph.layer_state(f.reconstruct), LayerState::Uninitialized);

    f.longitudes(10.0);
    assert_eq!(f.graph.layer_state(f.reconstruct), LayerState::Ready);

    f.graph.modified_feature_collection(&f.features);
    assert_eq!(f.graph.layer_state(f.reconstruct), LayerState::Stale);

    f.longitudes(10.0);
    assert_eq!(f.graph.layer_state(f.reconstruct), LayerState::Ready);

    f.graph.remove_layer(f.reconstruct);
    assert_eq!(f.graph.layer_state(f.reconstruct), LayerState::Removed);
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_failed_reconstruction_is_not_cached() {
    let mut f = Fixture::new(16);
    let failing = point_feature(FAILING_PLATE, 0.0);
    let failing_id = failing.id();
    f.features.add_feature(failing);
    f.graph.modified_feature_collection(&f.features);

    let err = f
        .graph
        .reconstructed_feature_geometries(f.reconstruct, 10.0)
        .unwrap_err();
    assert!(matches!(err, LayerError::Reconstruction { feature_id, .. } if feature_id == failing_id));
    let calls = f.calls();

    f.graph
        .reconstructed_feature_geometries(f.reconstruct, 10.0)
        .unwrap_err();
    assert!(f.calls() > calls);
}

#[test]
#[should_panic(expected = "has been removed from the graph")]
fn test_removed_layer_panics() {
    let mut f = Fixture::new(16);
    f.graph.remove_layer(f.reconstruct);
    f.longitudes(10.0);
}

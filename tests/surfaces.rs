//! Tests for velocity and scalar field layers.

use std::sync::Arc;

use layer_flow::{
    DeltaTimeType, EulerPoleRotationModel, Feature, FeatureCollection, FeatureId, FeatureKind,
    Geometry, LatLonPoint, LayerGraph, LayerId, SolveVelocitiesMethod, TopologyNetworkParams,
    UnitVector3, ValidTime, VelocityParams, VelocitySource, EARTH_RADIUS_KM,
};

// ============================================================================
// Fixtures
// ============================================================================

fn ll(lat: f64, lon: f64) -> UnitVector3 {
    UnitVector3::from_lat_lon(lat, lon)
}

fn ring(points: &[(f64, f64)]) -> Vec<UnitVector3> {
    points.iter().map(|&(lat, lon)| ll(lat, lon)).collect()
}

/// Speed in cm/yr of a point at `latitude` on a plate turning `degrees_per_myr`
/// about the north pole.
fn expected_speed(latitude: f64, degrees_per_myr: f64) -> f64 {
    EARTH_RADIUS_KM * degrees_per_myr.to_radians() * latitude.to_radians().cos() * 0.1
}

struct Fixture {
    graph: LayerGraph,
    rotation: LayerId,
    velocity: LayerId,
    boundary_topology: Arc<FeatureCollection>,
    domain: Arc<FeatureCollection>,
    _collections: Vec<Arc<FeatureCollection>>,
}

impl Fixture {
    /// Plate 1 spins at 1°/Myr and plate 3 at 2°/Myr, both about the north pole.
    ///
    /// A topological box around (0, 0) moves with plate 1 and a static polygon
    /// around (0, 90) with plate 3.
    fn new() -> Self {
        let mut graph = LayerGraph::new();
        let mut model = EulerPoleRotationModel::new();
        let pole = LatLonPoint::new(90.0, 0.0);
        model.add_constant_rate_plate(1, 0, pole, 1.0);
        model.add_constant_rate_plate(3, 0, pole, 2.0);
        let rotation = graph.add_reconstruction_layer(Arc::new(model));

        let sections = graph.add_reconstruct_layer();
        graph.set_reconstruction_input(sections, Some(rotation)).unwrap();
        let section_features = FeatureCollection::new(
            "sections",
            vec![Feature::new(
                FeatureId::next(),
                FeatureKind::Reconstructable,
                Geometry::Polyline(ring(&[(-20.0, -20.0), (-20.0, 20.0), (20.0, 20.0), (20.0, -20.0)])),
            )],
        );
        graph.add_feature_collection(sections, &section_features);

        let section_id = section_features.read()[0].id();
        let boundary_topology = FeatureCollection::new(
            "boundaries",
            vec![Feature::new(
                FeatureId::next(),
                FeatureKind::TopologicalBoundary {
                    sections: vec![section_id],
                },
                Geometry::MultiPoint(Vec::new()),
            )
            .with_plate_id(1)],
        );
        let boundary = graph.add_topology_boundary_layer();
        graph.add_feature_collection(boundary, &boundary_topology);
        graph
            .set_topological_section_inputs(boundary, &[sections])
            .unwrap();

        let static_polygons = graph.add_reconstruct_layer();
        graph
            .set_reconstruction_input(static_polygons, Some(rotation))
            .unwrap();
        let polygon_features = FeatureCollection::new(
            "static polygons",
            vec![Feature::new(
                FeatureId::next(),
                FeatureKind::Reconstructable,
                Geometry::Polygon(ring(&[(-10.0, 80.0), (-10.0, 100.0), (10.0, 100.0), (10.0, 80.0)])),
            )
            .with_plate_id(3)],
        );
        graph.add_feature_collection(static_polygons, &polygon_features);

        let velocity = graph.add_velocity_layer();
        graph.set_reconstruction_input(velocity, Some(rotation)).unwrap();
        graph
            .set_velocity_surface_inputs(velocity, &[boundary, static_polygons])
            .unwrap();
        let domain = FeatureCollection::new(
            "domain",
            vec![Feature::new(
                FeatureId::next(),
                FeatureKind::VelocityDomain,
                Geometry::MultiPoint(ring(&[(0.0, 0.0), (0.0, 90.0), (60.0, -90.0)])),
            )
            .with_plate_id(1)],
        );
        graph.add_feature_collection(velocity, &domain);

        Self {
            graph,
            rotation,
            velocity,
            boundary_topology,
            domain,
            _collections: vec![section_features, polygon_features],
        }
    }
}

// ============================================================================
// Velocities
// ============================================================================

#[test]
fn test_velocities_by_surfaces() {
    let mut f = Fixture::new();
    let fields = f.graph.velocity_fields(f.velocity, 0.0).unwrap();
    assert_eq!(fields.fields().len(), 1);
    let points = &fields.fields()[0].points;
    assert_eq!(points.len(), 3);

    let boundary_id = f.boundary_topology.read()[0].id();
    assert_eq!(points[0].source, Some(VelocitySource::Boundary(boundary_id)));
    assert_eq!(points[0].plate_id, Some(1));
    let speed = points[0].velocity.unwrap().magnitude();
    assert!((speed - expected_speed(0.0, 1.0)).abs() < 1e-2, "{speed}");

    assert!(matches!(points[1].source, Some(VelocitySource::StaticPolygon(_))));
    assert_eq!(points[1].plate_id, Some(3));
    let speed = points[1].velocity.unwrap().magnitude();
    assert!((speed - expected_speed(0.0, 2.0)).abs() < 2e-2, "{speed}");

    // Outside every surface.
    assert_eq!(points[2].velocity, None);
    assert_eq!(points[2].source, None);
}

#[test]
fn test_velocities_by_domain_plate_ids() {
    let mut f = Fixture::new();
    let params = VelocityParams {
        solve_velocities_method: SolveVelocitiesMethod::ByDomainPlateIds,
        ..Default::default()
    };
    f.graph.set_velocity_params(f.velocity, params).unwrap();
    assert_eq!(f.graph.velocity_params(f.velocity).unwrap(), params);

    let fields = f.graph.velocity_fields(f.velocity, 0.0).unwrap();
    let points = &fields.fields()[0].points;
    for point in points {
        assert_eq!(point.source, Some(VelocitySource::DomainPlateId));
        assert_eq!(point.plate_id, Some(1));
    }
    let high = points[2].velocity.unwrap();
    let latitude = points[2].position.to_lat_lon().latitude;
    assert!((high.magnitude() - expected_speed(latitude, 1.0)).abs() < 1e-2);
    let (north, _) = high.north_east(&points[2].position);
    assert!(north.abs() < 1e-6);
}

#[test]
fn test_interval_types_agree_for_constant_rotation() {
    let mut f = Fixture::new();
    let mut speeds = Vec::new();
    for delta_time_type in [DeltaTimeType::Older, DeltaTimeType::Younger, DeltaTimeType::Centred] {
        let params = VelocityParams {
            delta_time_type,
            ..Default::default()
        };
        f.graph.set_velocity_params(f.velocity, params).unwrap();
        let fields = f.graph.velocity_fields(f.velocity, 50.0).unwrap();
        assert_eq!(fields.params().delta_time_type, delta_time_type);
        speeds.push(fields.fields()[0].points[0].velocity.unwrap().magnitude());
    }
    for speed in &speeds {
        assert!((speed - speeds[0]).abs() < 1e-9, "{speeds:?}");
    }
}

#[test]
fn test_velocity_fields_follow_rotation_changes() {
    let mut f = Fixture::new();
    let first = f.graph.velocity_fields(f.velocity, 0.0).unwrap();
    let again = f.graph.velocity_fields(f.velocity, 0.0).unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    f.graph.set_anchor_plate_id(f.rotation, 1).unwrap();
    let anchored = f.graph.velocity_fields(f.velocity, 0.0).unwrap();
    assert!(!Arc::ptr_eq(&first, &anchored));
    let speed = anchored.fields()[0].points[0].velocity.unwrap().magnitude();
    assert!(speed < 1e-9, "{speed}");
}

#[test]
fn test_inactive_domain_yields_no_fields() {
    let mut f = Fixture::new();
    let domain = f.domain.read()[0].clone();
    f.domain
        .replace_feature(domain.with_valid_time(ValidTime::new(10.0, 0.0)));
    f.graph.modified_feature_collection(&f.domain);

    assert!(f.graph.velocity_fields(f.velocity, 20.0).unwrap().is_empty());
    assert!(!f.graph.velocity_fields(f.velocity, 5.0).unwrap().is_empty());
}

#[test]
fn test_velocity_inside_network_is_interpolated() {
    let mut model = EulerPoleRotationModel::new();
    model.add_constant_rate_plate(1, 0, LatLonPoint::new(90.0, 0.0), 1.0);
    let mut graph = LayerGraph::new();
    let rotation = graph.add_reconstruction_layer(Arc::new(model));

    let sections = graph.add_reconstruct_layer();
    graph.set_reconstruction_input(sections, Some(rotation)).unwrap();
    let boundary = Feature::new(
        FeatureId::next(),
        FeatureKind::Reconstructable,
        Geometry::Polyline(ring(&[(-20.0, -20.0), (-20.0, 20.0), (20.0, 20.0), (20.0, -20.0)])),
    );
    let interior = Feature::new(
        FeatureId::next(),
        FeatureKind::Reconstructable,
        Geometry::Point(ll(0.0, 0.0)),
    )
    .with_plate_id(1);
    let topology = Feature::new(
        FeatureId::next(),
        FeatureKind::TopologicalNetwork {
            boundary: vec![boundary.id()],
            interior: vec![interior.id()],
        },
        Geometry::MultiPoint(Vec::new()),
    );
    let section_features = FeatureCollection::new("sections", vec![boundary, interior]);
    graph.add_feature_collection(sections, &section_features);

    let network = graph.add_topology_network_layer();
    let topologies = FeatureCollection::new("networks", vec![topology]);
    graph.add_feature_collection(network, &topologies);
    graph
        .set_topological_section_inputs(network, &[sections])
        .unwrap();

    let resolved = graph.resolved_topological_networks(network, 0.0).unwrap();
    assert_eq!(resolved.networks()[0].nodes.len(), 5);

    let velocity = graph.add_velocity_layer();
    graph.set_reconstruction_input(velocity, Some(rotation)).unwrap();
    graph.set_velocity_surface_inputs(velocity, &[network]).unwrap();
    let domain = FeatureCollection::new(
        "domain",
        vec![Feature::new(
            FeatureId::next(),
            FeatureKind::VelocityDomain,
            Geometry::MultiPoint(ring(&[(0.0, 0.0), (0.0, 10.0)])),
        )],
    );
    graph.add_feature_collection(velocity, &domain);

    let fields = graph.velocity_fields(velocity, 0.0).unwrap();
    let points = &fields.fields()[0].points;
    let full = expected_speed(0.0, 1.0);
    assert!(matches!(points[0].source, Some(VelocitySource::Network(_))));
    assert_eq!(points[0].plate_id, None);
    // On the interior node the node's plate takes all the weight.
    let on_node = points[0].velocity.unwrap().magnitude();
    assert!((on_node - full).abs() < 1e-2, "{on_node}");
    // Elsewhere the static boundary nodes pull the speed down.
    let between = points[1].velocity.unwrap().magnitude();
    assert!(between > 0.0 && between < on_node, "{between}");

    // Without interior nodes only the static boundary is left.
    graph
        .set_topology_network_params(
            network,
            TopologyNetworkParams {
                include_interior_geometries: false,
                ..Default::default()
            },
        )
        .unwrap();
    let resolved = graph.resolved_topological_networks(network, 0.0).unwrap();
    assert_eq!(resolved.networks()[0].nodes.len(), 4);
    let fields = graph.velocity_fields(velocity, 0.0).unwrap();
    let speed = fields.fields()[0].points[0].velocity.unwrap().magnitude();
    assert!(speed < 1e-9, "{speed}");
}

// ============================================================================
// Scalar fields
// ============================================================================

fn scalar_feature(valid_time: ValidTime) -> Feature {
    Feature::new(
        FeatureId::next(),
        FeatureKind::ScalarField {
            samples: vec![1.0, 2.0, 3.0],
        },
        Geometry::MultiPoint(ring(&[(0.0, 0.0), (0.0, 10.0), (0.0, 20.0)])),
    )
    .with_valid_time(valid_time)
}

#[test]
fn test_scalar_field_lookup_and_statistics() {
    let mut graph = LayerGraph::new();
    let layer = graph.add_scalar_field_layer();
    assert_eq!(graph.scalar_field_statistics(layer).unwrap(), None);

    let fields = FeatureCollection::new("field", vec![scalar_feature(ValidTime::new(50.0, 0.0))]);
    graph.add_feature_collection(layer, &fields);

    let statistics = graph.scalar_field_statistics(layer).unwrap().unwrap();
    assert_eq!(statistics.count, 3);
    assert_eq!((statistics.min, statistics.max), (1.0, 3.0));
    assert!((statistics.mean - 2.0).abs() < 1e-12);

    let field = graph.resolved_scalar_field(layer, 10.0).unwrap().unwrap();
    assert_eq!(field.len(), 3);
    assert_eq!(field.value_at(&ll(1.0, 9.0)), Some(2.0));
    assert_eq!(field.value_at(&ll(0.0, 40.0)), Some(3.0));

    assert!(graph.resolved_scalar_field(layer, 100.0).unwrap().is_none());
}

#[test]
fn test_dropped_field_collection_clears_statistics() {
    let mut graph = LayerGraph::new();
    let layer = graph.add_scalar_field_layer();
    let fields = FeatureCollection::new("field", vec![scalar_feature(ValidTime::new(50.0, 0.0))]);
    graph.add_feature_collection(layer, &fields);
    assert!(graph.scalar_field_statistics(layer).unwrap().is_some());
    assert!(graph.resolved_scalar_field(layer, 10.0).unwrap().is_some());

    drop(fields);
    assert_eq!(graph.scalar_field_statistics(layer).unwrap(), None);
    assert!(graph.resolved_scalar_field(layer, 10.0).unwrap().is_none());
}

#[test]
fn test_cross_sections_sample_the_field() {
    let mut model = EulerPoleRotationModel::new();
    model.add_constant_rate_plate(1, 0, LatLonPoint::new(90.0, 0.0), 1.0);

    let mut graph = LayerGraph::new();
    let rotation = graph.add_reconstruction_layer(Arc::new(model));
    let lines = graph.add_reconstruct_layer();
    graph.set_reconstruction_input(lines, Some(rotation)).unwrap();
    let line_features = FeatureCollection::new(
        "lines",
        vec![Feature::new(
            FeatureId::next(),
            FeatureKind::Reconstructable,
            Geometry::Polyline(ring(&[(0.0, -10.0), (0.0, 10.0)])),
        )
        .with_plate_id(1)],
    );
    graph.add_feature_collection(lines, &line_features);

    let layer = graph.add_scalar_field_layer();
    let fields = FeatureCollection::new("field", vec![scalar_feature(ValidTime::ALWAYS)]);
    graph.add_feature_collection(layer, &fields);
    graph.set_cross_section_inputs(layer, &[lines]).unwrap();

    // At 10 Ma the line spans longitudes 0 to 20.
    let sections = graph.cross_section_geometries(layer, 10.0).unwrap();
    assert_eq!(sections.sections().len(), 1);
    assert_eq!(sections.sections()[0].values, vec![Some(1.0), Some(3.0)]);

    // Moving the line is seen through the reconstruct layer.
    let line = line_features.read()[0].clone();
    line_features.replace_feature(line.with_plate_id(0));
    graph.modified_feature_collection(&line_features);
    let moved = graph.cross_section_geometries(layer, 10.0).unwrap();
    assert_eq!(moved.sections()[0].values, vec![Some(1.0), Some(2.0)]);
}

#[test]
fn test_scalar_field_without_features() {
    let mut graph = LayerGraph::new();
    let layer = graph.add_scalar_field_layer();
    assert!(graph.resolved_scalar_field(layer, 0.0).unwrap().is_none());
    let sections = graph.cross_section_geometries(layer, 0.0).unwrap();
    assert!(sections.is_empty());
}

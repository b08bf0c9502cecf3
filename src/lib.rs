#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod cache;
mod error;
mod feature;
mod geometry;
mod graph;
mod layer;
mod reconstruct;
mod rotation;
mod spatial;
mod time;
mod time_span;
mod token;
pub mod tracer;

pub use cache::BoundedCache;
pub use error::{LayerError, Result};
pub use feature::{Feature, FeatureCollection, FeatureId, FeatureKind, PlateId, ValidTime};
pub use geometry::{
    BoundingSmallCircle, DeferredGeometry, Geometry, LatLonPoint, Rotation, UnitVector3,
    EARTH_RADIUS_KM,
};
pub use graph::{LayerGraph, LayerGraphBuilder, LayerGraphConfig, LayerId};
pub use layer::{
    CrossSection, CrossSections, DeltaTimeType, LayerKind, LayerState, NetworkNode,
    PresentDayGeometry, ReconstructedFeatureGeometry, ReconstructedGeometries,
    ReconstructedSpatialPartition, ResolvedScalarField, ResolvedTopologicalBoundaries,
    ResolvedTopologicalBoundary, ResolvedTopologicalLine, ResolvedTopologicalNetwork,
    ResolvedTopologicalNetworks, ScalarFieldStatistics, SolveVelocitiesMethod,
    TopologyNetworkParams, Velocity, VelocityField, VelocityFields, VelocityParams, VelocityPoint,
    VelocitySource,
};
pub use reconstruct::{
    ByPlateId, ByTopologies, HalfStageRotation, ReconstructContext, ReconstructContextTable,
    ReconstructMethod, ReconstructMethodRegistry, ReconstructMethodType, ReconstructParams,
    ReconstructRequest, SharedReconstructContext, TopologyTimeSpans,
};
pub use rotation::{EulerPoleRotationModel, PoleSample, ReconstructionTree, RotationModel};
pub use spatial::{
    PartitionEntry, SpatialPartition, SpatialPartitionBuilder, DEFAULT_MAX_DEPTH, MAX_DEPTH_LIMIT,
};
pub use time::{geo_times_equal, GeoTime, TimeRange, GEO_TIME_EPSILON, MAX_TIME_SLOTS};
pub use time_span::{TimeSpanReuse, TimeSpanTable};
pub use token::{ChangeToken, ReconstructHandle, TokenObserver};
pub use tracer::{InvalidationReason, NoopTracer, Tracer, TracerRequestKey};

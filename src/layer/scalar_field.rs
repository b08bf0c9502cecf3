use std::sync::Arc;

use crate::cache::BoundedCache;
use crate::error::Result;
use crate::feature::{Feature, FeatureId, FeatureKind, WeakFeatureCollections};
use crate::geometry::{Geometry, UnitVector3};
use crate::graph::{LayerGraph, LayerGraphConfig, LayerId};
use crate::spatial::{SpatialPartition, SpatialPartitionBuilder};
use crate::time::GeoTime;
use crate::token::ReconstructHandle;
use crate::tracer::InvalidationReason;

use super::{input_layers, poll_inputs, remove_input, InputLayer, LayerNode, ProxyCore};

/// Summary of every sample in a layer's scalar-field features.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScalarFieldStatistics {
    /// Smallest sample.
    pub min: f64,
    /// Largest sample.
    pub max: f64,
    /// Mean of the samples.
    pub mean: f64,
    /// Population standard deviation of the samples.
    pub standard_deviation: f64,
    /// Number of finite samples.
    pub count: usize,
}

impl ScalarFieldStatistics {
    /// Statistics of the finite values in `samples`, or `None` if there are none.
    pub fn from_samples(samples: impl IntoIterator<Item = f64>) -> Option<Self> {
        let values: Vec<f64> = samples.into_iter().filter(|v| v.is_finite()).collect();
        if values.is_empty() {
            return None;
        }
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        Some(Self {
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            mean,
            standard_deviation: variance.sqrt(),
            count,
        })
    }
}

/// Scalar samples active at one time, indexed for lookup by position.
#[derive(Debug)]
pub struct ResolvedScalarField {
    reconstruct_handle: ReconstructHandle,
    time: f64,
    feature_ids: Vec<FeatureId>,
    samples: Arc<SpatialPartition<f64>>,
}

impl ResolvedScalarField {
    /// Pass that resolved this field.
    pub fn reconstruct_handle(&self) -> ReconstructHandle {
        self.reconstruct_handle
    }

    /// Resolution time.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Scalar-field features that contributed samples.
    pub fn feature_ids(&self) -> &[FeatureId] {
        &self.feature_ids
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if there are no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Value of the sample nearest to `point`.
    pub fn value_at(&self, point: &UnitVector3) -> Option<f64> {
        self.samples.nearest(point).map(|(entry, _)| *entry.value())
    }
}

/// A reconstructed geometry with the field sampled at each vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossSection {
    /// Reconstructed feature.
    pub feature_id: FeatureId,
    /// Geometry at the resolution time.
    pub geometry: Geometry,
    /// Field value at each vertex; `None` when the field is not resolved.
    pub values: Vec<Option<f64>>,
}

/// Every cross section of one layer at one time.
#[derive(Debug)]
pub struct CrossSections {
    reconstruct_handle: ReconstructHandle,
    time: f64,
    sections: Vec<CrossSection>,
}

impl CrossSections {
    /// Pass that computed these cross sections.
    pub fn reconstruct_handle(&self) -> ReconstructHandle {
        self.reconstruct_handle
    }

    /// Resolution time.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Cross sections in input order.
    pub fn sections(&self) -> &[CrossSection] {
        &self.sections
    }

    /// Returns true if there are no cross sections.
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

fn scalar_samples(feature: &Feature) -> Option<&[f64]> {
    match feature.kind() {
        FeatureKind::ScalarField { samples } => Some(samples),
        _ => None,
    }
}

fn is_scalar_field(feature: &Feature) -> bool {
    scalar_samples(feature).is_some()
}

/// Resolves scalar fields and samples them along reconstructed geometries.
pub(crate) struct ScalarFieldLayer {
    core: ProxyCore,
    features: WeakFeatureCollections,
    cross_section_inputs: Vec<InputLayer>,
    statistics: Option<ScalarFieldStatistics>,
    fields: BoundedCache<GeoTime, Option<Arc<ResolvedScalarField>>>,
    cross_sections: BoundedCache<GeoTime, Arc<CrossSections>>,
    partition_depth: u32,
}

impl ScalarFieldLayer {
    pub(crate) fn new(core: ProxyCore, config: &LayerGraphConfig) -> Self {
        Self {
            core,
            features: WeakFeatureCollections::default(),
            cross_section_inputs: Vec::new(),
            statistics: None,
            fields: BoundedCache::new(config.cache_capacity),
            cross_sections: BoundedCache::new(config.cache_capacity),
            partition_depth: config.spatial_partition_depth,
        }
    }

    pub(crate) fn set_cross_section_inputs(&mut self, inputs: &[LayerId]) {
        self.cross_section_inputs = input_layers(inputs);
        self.invalidate(InvalidationReason::InputsRewired);
    }

    pub(crate) fn statistics(&self) -> Option<ScalarFieldStatistics> {
        self.statistics
    }

    /// The field at `time`, or `None` if no scalar-field feature is active.
    /// Populates the field cache.
    pub(crate) fn resolved_scalar_field(
        &mut self,
        graph: &mut LayerGraph,
        time: f64,
    ) -> Option<Arc<ResolvedScalarField>> {
        self.check_input_layer_proxies(graph);
        self.field_at(time)
    }

    fn field_at(&mut self, time: f64) -> Option<Arc<ResolvedScalarField>> {
        let key = GeoTime::new(time);
        if let Some(field) = self.fields.get(&key) {
            self.core.cache_hit("resolved_scalar_field", &key);
            return field;
        }
        self.core.cache_miss("resolved_scalar_field", &key);

        let field = self.resolve(time).map(Arc::new);
        self.fields.insert(key, field.clone());
        self.core.mark_ready();
        field
    }

    fn resolve(&self, time: f64) -> Option<ResolvedScalarField> {
        let features: Vec<Feature> = self
            .features
            .features(is_scalar_field)
            .into_iter()
            .filter(|f| f.is_active_at(time))
            .collect();
        if features.is_empty() {
            tracing::debug!(layer = %self.core.id, time, "no active scalar field");
            return None;
        }

        let mut builder = SpatialPartitionBuilder::new(self.partition_depth);
        for feature in &features {
            let points = feature.geometry().points();
            let samples = scalar_samples(feature).unwrap_or_default();
            if samples.len() != points.len() {
                tracing::warn!(
                    feature = %feature.id(),
                    points = points.len(),
                    samples = samples.len(),
                    "scalar field sample count does not match its points"
                );
            }
            for (point, &value) in points.iter().zip(samples) {
                builder.add(value, Geometry::Point(*point));
            }
        }
        Some(ResolvedScalarField {
            reconstruct_handle: ReconstructHandle::next(),
            time,
            feature_ids: features.iter().map(Feature::id).collect(),
            samples: Arc::new(builder.build()),
        })
    }

    /// Reconstructed geometries of the cross-section inputs at `time`, with
    /// the field sampled at their vertices. Populates the cross-section and
    /// field caches.
    pub(crate) fn cross_section_geometries(
        &mut self,
        graph: &mut LayerGraph,
        time: f64,
    ) -> Result<Arc<CrossSections>> {
        self.check_input_layer_proxies(graph);

        let key = GeoTime::new(time);
        if let Some(sections) = self.cross_sections.get(&key) {
            self.core.cache_hit("cross_section_geometries", &key);
            return Ok(sections);
        }
        self.core.cache_miss("cross_section_geometries", &key);

        let field = self.field_at(time);
        let mut sections = Vec::new();
        for input in &self.cross_section_inputs {
            let geometries = graph.reconstructed_feature_geometries(input.id(), time)?;
            for rfg in geometries.iter() {
                let geometry = rfg.geometry.geometry().into_owned();
                let values = geometry
                    .points()
                    .iter()
                    .map(|p| field.as_ref().and_then(|f| f.value_at(p)))
                    .collect();
                sections.push(CrossSection {
                    feature_id: rfg.feature_id,
                    geometry,
                    values,
                });
            }
        }
        let sections = Arc::new(CrossSections {
            reconstruct_handle: ReconstructHandle::next(),
            time,
            sections,
        });
        self.cross_sections.insert(key, sections.clone());
        self.core.mark_ready();
        Ok(sections)
    }
}

impl LayerNode for ScalarFieldLayer {
    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProxyCore {
        &mut self.core
    }

    fn check_input_layer_proxies(&mut self, graph: &mut LayerGraph) {
        if let Some(input) = poll_inputs(graph, self.cross_section_inputs.iter_mut()) {
            self.invalidate(InvalidationReason::InputChanged { input });
        }
    }

    fn clear_caches(&mut self) {
        self.fields.clear();
        self.cross_sections.clear();
    }

    fn input_ids(&self) -> Vec<LayerId> {
        self.cross_section_inputs.iter().map(InputLayer::id).collect()
    }

    fn disconnect_input(&mut self, input: LayerId) -> bool {
        remove_input(&mut self.cross_section_inputs, input)
    }

    fn feature_collections_mut(&mut self) -> Option<&mut WeakFeatureCollections> {
        Some(&mut self.features)
    }

    fn apply_config(&mut self, config: &LayerGraphConfig) {
        self.partition_depth = config.spatial_partition_depth;
        self.fields.set_capacity(config.cache_capacity);
        self.cross_sections.set_capacity(config.cache_capacity);
    }

    fn feature_collections_changed(&mut self) {
        let features = self.features.features(is_scalar_field);
        self.statistics = ScalarFieldStatistics::from_samples(
            features
                .iter()
                .filter_map(scalar_samples)
                .flat_map(|samples| samples.iter().copied()),
        );
        self.invalidate(InvalidationReason::FeatureCollectionsChanged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics_skip_non_finite_samples() {
        let stats = ScalarFieldStatistics::from_samples([1.0, 2.0, f64::NAN, 3.0, 4.0]).unwrap();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
        assert!((stats.mean - 2.5).abs() < 1e-12);
        assert!((stats.standard_deviation - 1.25f64.sqrt()).abs() < 1e-12);

        assert!(ScalarFieldStatistics::from_samples([f64::NAN]).is_none());
    }
}

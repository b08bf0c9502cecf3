use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::BoundedCache;
use crate::error::Result;
use crate::feature::{Feature, FeatureId, FeatureKind, PlateId, WeakFeatureCollections};
use crate::geometry::{Geometry, UnitVector3};
use crate::graph::{LayerGraph, LayerGraphConfig, LayerId};
use crate::time::{GeoTime, TimeRange};
use crate::time_span::TimeSpanTable;
use crate::token::ReconstructHandle;
use crate::tracer::InvalidationReason;

use super::{
    input_layers, join_sections, poll_section_inputs, remove_input, resolve_section_geometries,
    InputLayer, LayerNode, ProxyCore, SectionGeometry,
};

/// A closed plate boundary assembled from its sections.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTopologicalBoundary {
    /// Topological feature.
    pub feature_id: FeatureId,
    /// Plate the enclosed region moves with.
    pub plate_id: PlateId,
    /// Boundary polygon.
    pub geometry: Geometry,
    /// Section features that contributed, in order.
    pub sections: Vec<FeatureId>,
}

impl ResolvedTopologicalBoundary {
    /// Returns true if `point` lies inside the boundary.
    pub fn contains(&self, point: &UnitVector3) -> bool {
        self.geometry.contains_point(point)
    }
}

/// An open line assembled from its sections.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTopologicalLine {
    /// Topological feature.
    pub feature_id: FeatureId,
    /// Joined polyline.
    pub geometry: Geometry,
    /// Plate of the section each vertex came from.
    pub vertex_plate_ids: Vec<PlateId>,
}

/// Every boundary and line resolved by one layer at one time.
#[derive(Debug)]
pub struct ResolvedTopologicalBoundaries {
    reconstruct_handle: ReconstructHandle,
    time: f64,
    boundaries: Vec<ResolvedTopologicalBoundary>,
    lines: Vec<ResolvedTopologicalLine>,
}

impl ResolvedTopologicalBoundaries {
    /// Pass that resolved these topologies.
    pub fn reconstruct_handle(&self) -> ReconstructHandle {
        self.reconstruct_handle
    }

    /// Resolution time.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Resolved closed boundaries.
    pub fn boundaries(&self) -> &[ResolvedTopologicalBoundary] {
        &self.boundaries
    }

    /// Resolved open lines.
    pub fn lines(&self) -> &[ResolvedTopologicalLine] {
        &self.lines
    }

    /// The first boundary containing `point`.
    pub fn boundary_containing(&self, point: &UnitVector3) -> Option<&ResolvedTopologicalBoundary> {
        self.boundaries.iter().find(|b| b.contains(point))
    }

    /// Returns true if nothing was resolved.
    pub fn is_empty(&self) -> bool {
        self.boundaries.is_empty() && self.lines.is_empty()
    }
}

fn is_boundary_topology(feature: &Feature) -> bool {
    matches!(
        feature.kind(),
        FeatureKind::TopologicalBoundary { .. } | FeatureKind::TopologicalLine { .. }
    )
}

fn resolve_topologies(
    time: f64,
    topologies: &[Feature],
    sections: &HashMap<FeatureId, SectionGeometry>,
) -> ResolvedTopologicalBoundaries {
    let mut boundaries = Vec::new();
    let mut lines = Vec::new();
    for feature in topologies {
        match feature.kind() {
            FeatureKind::TopologicalBoundary { sections: ids } => {
                let Some(joined) = join_sections(ids, sections) else {
                    tracing::trace!(feature = %feature.id(), time, "boundary section missing");
                    continue;
                };
                if joined.len() < 3 {
                    continue;
                }
                boundaries.push(ResolvedTopologicalBoundary {
                    feature_id: feature.id(),
                    plate_id: feature.plate_id().unwrap_or(0),
                    geometry: Geometry::Polygon(joined.into_iter().map(|(p, _)| p).collect()),
                    sections: ids.clone(),
                });
            }
            FeatureKind::TopologicalLine { sections: ids } => {
                let Some(joined) = join_sections(ids, sections) else {
                    continue;
                };
                if joined.len() < 2 {
                    continue;
                }
                let (points, vertex_plate_ids) = joined.into_iter().unzip();
                lines.push(ResolvedTopologicalLine {
                    feature_id: feature.id(),
                    geometry: Geometry::Polyline(points),
                    vertex_plate_ids,
                });
            }
            _ => {}
        }
    }
    ResolvedTopologicalBoundaries {
        reconstruct_handle: ReconstructHandle::next(),
        time,
        boundaries,
        lines,
    }
}

/// Resolves topological plate boundaries and lines from reconstructed sections.
pub(crate) struct TopologyBoundaryLayer {
    core: ProxyCore,
    features: WeakFeatureCollections,
    sections: Vec<InputLayer>,
    cache: BoundedCache<GeoTime, Arc<ResolvedTopologicalBoundaries>>,
    time_span: Option<Arc<TimeSpanTable<ResolvedTopologicalBoundaries>>>,
}

impl TopologyBoundaryLayer {
    pub(crate) fn new(core: ProxyCore, config: &LayerGraphConfig) -> Self {
        Self {
            core,
            features: WeakFeatureCollections::default(),
            sections: Vec::new(),
            cache: BoundedCache::new(config.cache_capacity),
            time_span: None,
        }
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
        time: f64,
    ) -> Result<ResolvedTopologicalBoundaries> {
        let topologies: Vec<Feature> = features
            .features(is_boundary_topology)
            .into_iter()
            .filter(|f| f.is_active_at(time))
            .collect();
        if topologies.is_empty() || sections.is_empty() {
            return Ok(resolve_topologies(time, &[], &HashMap::new()));
        }
        let section_geometries = resolve_section_geometries(graph, core, sections, time)?;
        Ok(resolve_topologies(time, &topologies, &section_geometries))
    }

    /// Boundaries and lines at `time`. Populates the result cache.
    pub(crate) fn resolved_topological_boundaries(
        &mut self,
        graph: &mut LayerGraph,
        time: f64,
    ) -> Result<Arc<ResolvedTopologicalBoundaries>> {
        self.check_input_layer_proxies(graph);

        let key = GeoTime::new(time);
        if let Some(resolved) = self.cache.get(&key) {
            self.core.cache_hit("resolved_topological_boundaries", &key);
            return Ok(resolved);
        }
        self.core.cache_miss("resolved_topological_boundaries", &key);

        let resolved = Arc::new(Self::resolve(
            graph,
            &self.core,
            &self.features,
            &self.sections,
            time,
        )?);
        self.cache.insert(key, resolved.clone());
        self.core.mark_ready();
        Ok(resolved)
    }

    /// Boundaries resolved at every slot of `range`. Populates the time-span
    /// table, sharing slots with the previous table where the times match.
    pub(crate) fn resolved_boundary_time_span(
        &mut self,
        graph: &mut LayerGraph,
        range: TimeRange,
    ) -> Result<Arc<TimeSpanTable<ResolvedTopologicalBoundaries>>> {
        self.check_input_layer_proxies(graph);

        if let Some(table) = self.time_span.as_ref().filter(|t| *t.range() == range) {
            self.core.cache_hit("resolved_boundary_time_span", &range);
            return Ok(table.clone());
        }
        self.core.cache_miss("resolved_boundary_time_span", &range);

        let previous = self.time_span.clone();
        let (core, features, sections) = (&self.core, &self.features, &self.sections);
        let (table, reuse) = TimeSpanTable::build(range, previous.as_deref(), |time| {
            Self::resolve(graph, core, features, sections, time).map(Arc::new)
        })?;
        self.core.time_span_built(reuse);

        let table = Arc::new(table);
        self.time_span = Some(table.clone());
        self.core.mark_ready();
        Ok(table)
    }
}

impl LayerNode for TopologyBoundaryLayer {
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

use std::sync::Arc;

use crate::cache::BoundedCache;
use crate::feature::PlateId;
use crate::graph::{LayerGraph, LayerGraphConfig};
use crate::rotation::{ReconstructionTree, RotationModel};
use crate::time::GeoTime;
use crate::tracer::InvalidationReason;

use super::{LayerNode, ProxyCore};

/// Turns a rotation model into reconstruction trees, one per requested time.
pub(crate) struct ReconstructionLayer {
    core: ProxyCore,
    rotation_model: Arc<dyn RotationModel>,
    anchor_plate_id: PlateId,
    trees: BoundedCache<GeoTime, Arc<ReconstructionTree>>,
}

impl ReconstructionLayer {
    pub(crate) fn new(
        core: ProxyCore,
        rotation_model: Arc<dyn RotationModel>,
        config: &LayerGraphConfig,
    ) -> Self {
        Self {
            core,
            rotation_model,
            anchor_plate_id: 0,
            trees: BoundedCache::new(config.cache_capacity),
        }
    }

    /// The tree at `time`. Populates the tree cache.
    pub(crate) fn reconstruction_tree(&mut self, time: f64) -> Arc<ReconstructionTree> {
        let key = GeoTime::new(time);
        if let Some(tree) = self.trees.get(&key) {
            self.core.cache_hit("reconstruction_tree", &key);
            return tree;
        }
        self.core.cache_miss("reconstruction_tree", &key);
        let tree = Arc::new(ReconstructionTree::new(
            self.rotation_model.clone(),
            time,
            self.anchor_plate_id,
        ));
        self.trees.insert(key, tree.clone());
        self.core.mark_ready();
        tree
    }

    pub(crate) fn set_rotation_model(&mut self, rotation_model: Arc<dyn RotationModel>) {
        self.rotation_model = rotation_model;
        self.invalidate(InvalidationReason::RotationModelChanged);
    }

    /// The rotation model was edited in place.
    pub(crate) fn modified_rotation_model(&mut self) {
        self.invalidate(InvalidationReason::RotationModelChanged);
    }

    pub(crate) fn anchor_plate_id(&self) -> PlateId {
        self.anchor_plate_id
    }

    pub(crate) fn set_anchor_plate_id(&mut self, anchor_plate_id: PlateId) {
        if self.anchor_plate_id == anchor_plate_id {
            return;
        }
        self.anchor_plate_id = anchor_plate_id;
        self.invalidate(InvalidationReason::RotationModelChanged);
    }
}

impl LayerNode for ReconstructionLayer {
    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ProxyCore {
        &mut self.core
    }

    fn check_input_layer_proxies(&mut self, _graph: &mut LayerGraph) {}

    fn clear_caches(&mut self) {
        self.trees.clear();
    }

    fn apply_config(&mut self, config: &LayerGraphConfig) {
        self.trees.set_capacity(config.cache_capacity);
    }
}

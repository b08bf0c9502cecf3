//! Loose cube quad tree over the unit sphere.
//!
//! The sphere is projected onto the six faces of a cube. Each face is the root
//! of a quad tree whose nodes cover a square of face coordinates. Nodes are
//! "loose": the region a node accepts is twice the size of the square it
//! tiles, so that small geometries straddling a tile edge still sink deep into
//! the tree. Every node is bounded by a small circle, and an element is stored
//! at the deepest node whose circle contains the element's bounding circle.

use std::f64::consts::PI;
use std::sync::Arc;

use crate::geometry::{BoundingSmallCircle, DeferredGeometry, Geometry, Rotation, UnitVector3};

/// Default maximum depth of each face's quad tree.
pub const DEFAULT_MAX_DEPTH: u32 = 6;

/// Deepest quad-tree level a partition will build; larger depths are clamped.
///
/// Tile indices at a level are held in a `u32`, and below this level the
/// tiles are smaller than any geometry worth partitioning.
pub const MAX_DEPTH_LIMIT: u32 = 24;

const NUM_FACES: usize = 6;

/// Face index and face coordinates (`u`, `v` in `[-1, 1]`) of a point.
fn cube_face_of(point: &UnitVector3) -> (usize, f64, f64) {
    let c = point.to_array();
    let axis = (0..3)
        .max_by(|&a, &b| c[a].abs().total_cmp(&c[b].abs()))
        .unwrap_or(2);
    let (a, b) = ((axis + 1) % 3, (axis + 2) % 3);
    let face = axis * 2 + usize::from(c[axis] < 0.0);
    let major = c[axis].abs();
    (face, c[a] / major, c[b] / major)
}

/// Point on the sphere at face coordinates (`u`, `v`) of `face`.
fn cube_face_point(face: usize, u: f64, v: f64) -> UnitVector3 {
    let axis = face / 2;
    let sign = if face % 2 == 0 { 1.0 } else { -1.0 };
    let mut c = [0.0; 3];
    c[axis] = sign;
    c[(axis + 1) % 3] = u;
    c[(axis + 2) % 3] = v;
    UnitVector3::from_xyz(c[0], c[1], c[2]).unwrap_or(UnitVector3::NORTH_POLE)
}

fn tile_size(level: u32) -> f64 {
    2.0 / f64::from(1u32 << level)
}

fn tile_index(coordinate: f64, level: u32) -> u32 {
    let tiles = 1u32 << level;
    let index = ((coordinate + 1.0) / tile_size(level)).floor();
    (index.max(0.0) as u32).min(tiles - 1)
}

/// Bounding circle of the loose region of tile (`i`, `j`) at `level` on `face`.
fn loose_node_bounds(face: usize, level: u32, i: u32, j: u32) -> BoundingSmallCircle {
    let size = tile_size(level);
    let uc = -1.0 + (f64::from(i) + 0.5) * size;
    let vc = -1.0 + (f64::from(j) + 0.5) * size;
    let centre = cube_face_point(face, uc, vc);
    // The loose half-extent is twice the tight half-extent.
    let radius = [(-1.0, -1.0), (-1.0, 1.0), (1.0, -1.0), (1.0, 1.0)]
        .iter()
        .map(|&(du, dv)| centre.angle_to(&cube_face_point(face, uc + du * size, vc + dv * size)))
        .fold(0.0, f64::max);
    BoundingSmallCircle::new(centre, radius.min(PI))
}

/// A value stored in a [`SpatialPartition`] with the geometry that positions it.
#[derive(Debug, Clone)]
pub struct PartitionEntry<V> {
    value: V,
    geometry: DeferredGeometry,
    bounds: BoundingSmallCircle,
}

impl<V> PartitionEntry<V> {
    /// The stored value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// The positioning geometry, possibly still unrotated.
    pub fn geometry(&self) -> &DeferredGeometry {
        &self.geometry
    }

    /// Bounding circle of the positioning geometry.
    pub fn bounds(&self) -> &BoundingSmallCircle {
        &self.bounds
    }

    fn intersects(&self, region: &BoundingSmallCircle) -> bool {
        self.bounds.intersects(region) && self.geometry.geometry().intersects(region)
    }
}

#[derive(Debug)]
struct QuadTreeNode {
    bounds: BoundingSmallCircle,
    elements: Vec<usize>,
    children: [Option<Box<QuadTreeNode>>; 4],
}

impl QuadTreeNode {
    fn new(bounds: BoundingSmallCircle) -> Self {
        Self {
            bounds,
            elements: Vec::new(),
            children: [None, None, None, None],
        }
    }

    fn count(&self) -> usize {
        1 + self
            .children
            .iter()
            .flatten()
            .map(|child| child.count())
            .sum::<usize>()
    }
}

/// An immutable spatial index of values positioned by geometry.
///
/// Built with [`SpatialPartitionBuilder`]; a changed input requires a new build.
#[derive(Debug)]
pub struct SpatialPartition<V> {
    max_depth: u32,
    entries: Vec<PartitionEntry<V>>,
    faces: [Option<Box<QuadTreeNode>>; NUM_FACES],
    root_elements: Vec<usize>,
}

impl<V> SpatialPartition<V> {
    fn new(max_depth: u32) -> Self {
        Self {
            max_depth: max_depth.min(MAX_DEPTH_LIMIT),
            entries: Vec::new(),
            faces: Default::default(),
            root_elements: Vec::new(),
        }
    }

    fn insert(&mut self, entry: PartitionEntry<V>) {
        let index = self.entries.len();
        let circle = entry.bounds;
        self.entries.push(entry);

        let (face, u, v) = cube_face_of(circle.centre());
        let root_bounds = loose_node_bounds(face, 0, 0, 0);
        if !root_bounds.contains_circle(&circle) {
            self.root_elements.push(index);
            return;
        }

        let mut node: &mut QuadTreeNode =
            &mut **self.faces[face].get_or_insert_with(|| Box::new(QuadTreeNode::new(root_bounds)));
        let (mut level, mut i, mut j) = (0, 0, 0);
        while level < self.max_depth {
            let (ci, cj) = (tile_index(u, level + 1), tile_index(v, level + 1));
            let child_bounds = loose_node_bounds(face, level + 1, ci, cj);
            if !child_bounds.contains_circle(&circle) {
                break;
            }
            let quadrant = ((ci - 2 * i) * 2 + (cj - 2 * j)) as usize;
            node = &mut **node.children[quadrant]
                .get_or_insert_with(|| Box::new(QuadTreeNode::new(child_bounds)));
            (level, i, j) = (level + 1, ci, cj);
        }
        node.elements.push(index);
    }

    /// Maximum quad-tree depth below each face root.
    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every entry in insertion order.
    pub fn entries(&self) -> &[PartitionEntry<V>] {
        &self.entries
    }

    /// Number of allocated quad-tree nodes across all faces.
    pub fn node_count(&self) -> usize {
        self.faces.iter().flatten().map(|root| root.count()).sum()
    }

    /// Entries whose geometry intersects `region`.
    ///
    /// Node and element bounding circles are tested first; only elements that
    /// pass are tested exactly, which is when a deferred geometry is rotated.
    pub fn query_region(&self, region: &BoundingSmallCircle) -> Vec<&PartitionEntry<V>> {
        let mut found: Vec<usize> = self
            .root_elements
            .iter()
            .copied()
            .filter(|&index| self.entries[index].intersects(region))
            .collect();
        let mut stack: Vec<&QuadTreeNode> = self.faces.iter().flatten().map(|n| &**n).collect();
        while let Some(node) = stack.pop() {
            if !node.bounds.intersects(region) {
                continue;
            }
            found.extend(
                node.elements
                    .iter()
                    .copied()
                    .filter(|&index| self.entries[index].intersects(region)),
            );
            stack.extend(node.children.iter().flatten().map(|child| &**child));
        }
        found.sort_unstable();
        found.into_iter().map(|index| &self.entries[index]).collect()
    }

    /// Entries whose geometry touches `point`.
    pub fn query_point(&self, point: &UnitVector3) -> Vec<&PartitionEntry<V>> {
        self.query_region(&BoundingSmallCircle::new(*point, 0.0))
    }

    /// The entry closest to `point` and its angular distance.
    pub fn nearest(&self, point: &UnitVector3) -> Option<(&PartitionEntry<V>, f64)> {
        let mut best: Option<(usize, f64)> = None;
        let consider = |index: usize, best: &mut Option<(usize, f64)>| {
            let entry = &self.entries[index];
            let limit = best.map_or(f64::INFINITY, |(_, d)| d);
            if entry.bounds.distance_to(point) > limit {
                return;
            }
            let distance = entry.geometry.geometry().distance_to(point);
            if distance < limit {
                *best = Some((index, distance));
            }
        };

        for &index in &self.root_elements {
            consider(index, &mut best);
        }
        let mut stack: Vec<&QuadTreeNode> = self.faces.iter().flatten().map(|n| &**n).collect();
        while let Some(node) = stack.pop() {
            let limit = best.map_or(f64::INFINITY, |(_, d)| d);
            if node.bounds.distance_to(point) > limit {
                continue;
            }
            for &index in &node.elements {
                consider(index, &mut best);
            }
            stack.extend(node.children.iter().flatten().map(|child| &**child));
        }
        best.map(|(index, distance)| (&self.entries[index], distance))
    }
}

/// Builds a [`SpatialPartition`].
///
/// # Examples
///
/// ```
/// # use layer_flow::{Geometry, SpatialPartitionBuilder, UnitVector3};
/// let mut builder = SpatialPartitionBuilder::new(4);
/// builder.add("here", Geometry::Point(UnitVector3::from_lat_lon(10.0, 20.0)));
/// let partition = builder.build();
///
/// let hits = partition.query_point(&UnitVector3::from_lat_lon(10.0, 20.0));
/// assert_eq!(hits.len(), 1);
/// assert_eq!(*hits[0].value(), "here");
/// ```
#[derive(Debug)]
pub struct SpatialPartitionBuilder<V> {
    partition: SpatialPartition<V>,
}

impl<V> SpatialPartitionBuilder<V> {
    /// Start a partition whose face trees are at most `max_depth` levels deep,
    /// clamped to [`MAX_DEPTH_LIMIT`].
    pub fn new(max_depth: u32) -> Self {
        Self {
            partition: SpatialPartition::new(max_depth),
        }
    }

    /// Add a value positioned by a geometry in its final position.
    pub fn add(&mut self, value: V, geometry: impl Into<DeferredGeometry>) -> &mut Self {
        let geometry = geometry.into();
        let bounds = geometry.bounding_small_circle();
        self.partition.insert(PartitionEntry {
            value,
            geometry,
            bounds,
        });
        self
    }

    /// Add a value positioned by `present_day` moved by `rotation`.
    ///
    /// The rotation is applied to the bounding circle only; the vertices are
    /// rotated when a query first needs an exact test against them.
    pub fn add_rotated(
        &mut self,
        value: V,
        present_day: Arc<Geometry>,
        rotation: Rotation,
    ) -> &mut Self {
        self.add(
            value,
            DeferredGeometry::Rotated {
                present_day,
                rotation,
            },
        )
    }

    /// Finish building.
    pub fn build(self) -> SpatialPartition<V> {
        self.partition
    }
}

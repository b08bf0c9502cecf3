//! Rotation models and per-time reconstruction trees.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::feature::PlateId;
use crate::geometry::{LatLonPoint, Rotation};
use crate::token::ReconstructHandle;

// Guards against fixed-plate chains that loop back on themselves.
const MAX_PLATE_CHAIN: usize = 64;

/// Supplies the finite rotation of any plate at any time.
pub trait RotationModel: Send + Sync + fmt::Debug {
    /// Rotation taking `plate_id` from present day to `time`, relative to `anchor_plate_id`.
    fn total_rotation(&self, plate_id: PlateId, time: f64, anchor_plate_id: PlateId) -> Rotation;

    /// Rotation moving a point on `plate_id` from its position at `from_time` to `to_time`.
    fn stage_rotation(
        &self,
        plate_id: PlateId,
        from_time: f64,
        to_time: f64,
        anchor_plate_id: PlateId,
    ) -> Rotation {
        let from = self.total_rotation(plate_id, from_time, anchor_plate_id);
        let to = self.total_rotation(plate_id, to_time, anchor_plate_id);
        to.compose(&from.inverse())
    }
}

/// One total-rotation pole of a plate relative to its fixed plate.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoleSample {
    /// Time in Myr.
    pub time: f64,
    /// Euler pole.
    pub pole: LatLonPoint,
    /// Rotation angle in degrees.
    pub angle: f64,
}

#[derive(Debug, Clone)]
struct RotationSequence {
    fixed_plate_id: PlateId,
    samples: Vec<(f64, Rotation)>,
}

impl RotationSequence {
    fn rotation_at(&self, time: f64) -> Rotation {
        let samples = &self.samples;
        let Some(&(first_time, first)) = samples.first() else {
            return Rotation::identity();
        };
        if time <= first_time {
            return first;
        }
        for pair in samples.windows(2) {
            let ((t0, r0), (t1, r1)) = (pair[0], pair[1]);
            if time <= t1 {
                let span = t1 - t0;
                let t = if span > 0.0 { (time - t0) / span } else { 1.0 };
                return r0.interpolate(&r1, t);
            }
        }
        samples.last().map_or(first, |&(_, last)| last)
    }
}

/// A rotation model built from total-rotation poles.
///
/// Each moving plate has a sequence of poles relative to a fixed plate, with
/// rotations between samples interpolated. Plates without a sequence do not
/// move relative to plate 0.
///
/// # Examples
///
/// ```
/// # use layer_flow::{EulerPoleRotationModel, LatLonPoint, RotationModel, UnitVector3};
/// let mut model = EulerPoleRotationModel::new();
/// model.add_constant_rate_plate(701, 0, LatLonPoint::new(90.0, 0.0), 1.0);
///
/// let rotation = model.total_rotation(701, 10.0, 0);
/// let moved = rotation.rotate(&UnitVector3::from_lat_lon(0.0, 0.0)).to_lat_lon();
/// assert!((moved.longitude - 10.0).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, Default)]
pub struct EulerPoleRotationModel {
    sequences: HashMap<PlateId, RotationSequence>,
}

impl EulerPoleRotationModel {
    /// An empty model in which nothing moves.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pole sequence of `moving_plate_id` relative to `fixed_plate_id`.
    ///
    /// Samples are sorted by time; a present-day identity sample is implied
    /// when none is given.
    pub fn add_plate(
        &mut self,
        moving_plate_id: PlateId,
        fixed_plate_id: PlateId,
        samples: impl IntoIterator<Item = PoleSample>,
    ) -> &mut Self {
        let mut samples: Vec<(f64, Rotation)> = samples
            .into_iter()
            .map(|s| (s.time, Rotation::from_euler_pole(s.pole, s.angle)))
            .collect();
        samples.sort_by(|a, b| a.0.total_cmp(&b.0));
        if samples.first().map_or(true, |&(time, _)| time > 0.0) {
            samples.insert(0, (0.0, Rotation::identity()));
        }
        self.sequences.insert(
            moving_plate_id,
            RotationSequence {
                fixed_plate_id,
                samples,
            },
        );
        self
    }

    /// A plate rotating about a fixed pole at `degrees_per_myr`, defined up to 1000 Ma.
    pub fn add_constant_rate_plate(
        &mut self,
        moving_plate_id: PlateId,
        fixed_plate_id: PlateId,
        pole: LatLonPoint,
        degrees_per_myr: f64,
    ) -> &mut Self {
        // Interpolation takes the shortest path, so keep each step well under half a turn.
        let interval = if degrees_per_myr == 0.0 {
            1000.0
        } else {
            (10.0 / degrees_per_myr.abs()).min(10.0)
        };
        let steps = (1000.0 / interval).ceil() as usize;
        let samples = (0..=steps).map(|step| {
            let time = (step as f64 * interval).min(1000.0);
            PoleSample {
                time,
                pole,
                angle: degrees_per_myr * time,
            }
        });
        self.add_plate(moving_plate_id, fixed_plate_id, samples)
    }

    /// Plate ids with a pole sequence.
    pub fn plate_ids(&self) -> impl Iterator<Item = PlateId> + '_ {
        self.sequences.keys().copied()
    }

    fn absolute_rotation(&self, plate_id: PlateId, time: f64) -> Rotation {
        let mut rotation = Rotation::identity();
        let mut plate = plate_id;
        for _ in 0..MAX_PLATE_CHAIN {
            let Some(sequence) = self.sequences.get(&plate) else {
                return rotation;
            };
            rotation = sequence.rotation_at(time).compose(&rotation);
            if sequence.fixed_plate_id == plate {
                return rotation;
            }
            plate = sequence.fixed_plate_id;
        }
        tracing::warn!(plate_id, "fixed plate chain is cyclic, truncating");
        rotation
    }
}

impl RotationModel for EulerPoleRotationModel {
    fn total_rotation(&self, plate_id: PlateId, time: f64, anchor_plate_id: PlateId) -> Rotation {
        let plate = self.absolute_rotation(plate_id, time);
        if anchor_plate_id == 0 {
            return plate;
        }
        self.absolute_rotation(anchor_plate_id, time)
            .inverse()
            .compose(&plate)
    }
}

/// Rotations of every plate at a single time relative to an anchor plate.
///
/// Plate rotations are computed on first use and remembered.
pub struct ReconstructionTree {
    time: f64,
    anchor_plate_id: PlateId,
    model: Arc<dyn RotationModel>,
    reconstruct_handle: ReconstructHandle,
    rotations: Mutex<HashMap<PlateId, Rotation>>,
}

impl fmt::Debug for ReconstructionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconstructionTree")
            .field("time", &self.time)
            .field("anchor_plate_id", &self.anchor_plate_id)
            .field("reconstruct_handle", &self.reconstruct_handle)
            .finish_non_exhaustive()
    }
}

impl ReconstructionTree {
    /// Create a tree for `time`.
    pub fn new(model: Arc<dyn RotationModel>, time: f64, anchor_plate_id: PlateId) -> Self {
        Self {
            time,
            anchor_plate_id,
            model,
            reconstruct_handle: ReconstructHandle::next(),
            rotations: Mutex::new(HashMap::new()),
        }
    }

    /// Reconstruction time.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Anchor plate.
    pub fn anchor_plate_id(&self) -> PlateId {
        self.anchor_plate_id
    }

    /// Pass that built this tree.
    pub fn reconstruct_handle(&self) -> ReconstructHandle {
        self.reconstruct_handle
    }

    /// The rotation model the tree was built from.
    pub fn model(&self) -> &Arc<dyn RotationModel> {
        &self.model
    }

    /// Total rotation of `plate_id` at this tree's time.
    pub fn rotation(&self, plate_id: PlateId) -> Rotation {
        *self.rotations.lock().entry(plate_id).or_insert_with(|| {
            self.model
                .total_rotation(plate_id, self.time, self.anchor_plate_id)
        })
    }

    /// Stage rotation of `plate_id` between two arbitrary times, using the same
    /// model and anchor.
    pub fn stage_rotation(&self, plate_id: PlateId, from_time: f64, to_time: f64) -> Rotation {
        self.model
            .stage_rotation(plate_id, from_time, to_time, self.anchor_plate_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::UnitVector3;

    fn ll(lat: f64, lon: f64) -> UnitVector3 {
        UnitVector3::from_lat_lon(lat, lon)
    }

    #[test]
    fn test_interpolates_between_samples() {
        let mut model = EulerPoleRotationModel::new();
        model.add_plate(
            101,
            0,
            [PoleSample {
                time: 20.0,
                pole: LatLonPoint::new(90.0, 0.0),
                angle: 40.0,
            }],
        );
        let moved = model.total_rotation(101, 10.0, 0).rotate(&ll(0.0, 0.0));
        assert!((moved.to_lat_lon().longitude - 20.0).abs() < 1e-9);
        // Beyond the last sample the last rotation holds.
        let moved = model.total_rotation(101, 30.0, 0).rotate(&ll(0.0, 0.0));
        assert!((moved.to_lat_lon().longitude - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_plate_chain_and_anchor() {
        let mut model = EulerPoleRotationModel::new();
        let pole = LatLonPoint::new(90.0, 0.0);
        model.add_constant_rate_plate(1, 0, pole, 1.0);
        model.add_constant_rate_plate(2, 1, pole, 2.0);

        let p = ll(0.0, 0.0);
        let absolute = model.total_rotation(2, 10.0, 0).rotate(&p).to_lat_lon();
        assert!((absolute.longitude - 30.0).abs() < 1e-9);

        let relative = model.total_rotation(2, 10.0, 1).rotate(&p).to_lat_lon();
        assert!((relative.longitude - 20.0).abs() < 1e-9);

        assert!(model
            .total_rotation(1, 10.0, 1)
            .approx_eq(&Rotation::identity(), 1e-12));
    }

    #[test]
    fn test_stage_rotation_moves_between_times() {
        let mut model = EulerPoleRotationModel::new();
        model.add_constant_rate_plate(5, 0, LatLonPoint::new(90.0, 0.0), 1.0);
        let tree = ReconstructionTree::new(Arc::new(model), 10.0, 0);

        let at_ten = tree.rotation(5).rotate(&ll(0.0, 0.0));
        let at_four = tree.stage_rotation(5, 10.0, 4.0).rotate(&at_ten);
        assert!((at_four.to_lat_lon().longitude - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_cyclic_fixed_plates_terminate() {
        let mut model = EulerPoleRotationModel::new();
        let pole = LatLonPoint::new(0.0, 0.0);
        model.add_constant_rate_plate(1, 2, pole, 1.0);
        model.add_constant_rate_plate(2, 1, pole, 1.0);
        let _ = model.total_rotation(1, 5.0, 0);
    }
}

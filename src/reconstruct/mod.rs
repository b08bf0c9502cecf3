//! Reconstruct strategies and the per-parameter state they keep.
//!
//! A reconstruct layer asks the [`ReconstructMethodRegistry`] to pick a
//! strategy for each of its features. The chosen strategy instances live in a
//! [`ReconstructContext`], one context per distinct [`ReconstructParams`], and
//! are shared by every time-keyed cache entry computed with those params.

mod context;
mod method;

pub use context::*;
pub use method::*;

use std::hash::{Hash, Hasher};

use crate::error::Result;
use crate::time::TimeRange;

/// Parameters of a reconstruct layer request.
///
/// Float members compare and hash by bit pattern, so params are usable as
/// cache keys.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReconstructParams {
    /// Rigidly rotate features even at times outside their valid period.
    pub reconstruct_by_plate_id_outside_active_time_period: bool,
    /// Move features through the resolved topologies of the layer's
    /// topology surface inputs instead of rigidly by plate id.
    pub reconstruct_using_topologies: bool,
    /// First slot of the topology time span (usually present day).
    pub topology_reconstruction_begin_time: f64,
    /// Exclusive far end of the topology time span.
    pub topology_reconstruction_end_time: f64,
    /// Distance between topology time-span slots, in Myr.
    pub topology_reconstruction_time_increment: f64,
}

impl Default for ReconstructParams {
    fn default() -> Self {
        Self {
            reconstruct_by_plate_id_outside_active_time_period: false,
            reconstruct_using_topologies: false,
            topology_reconstruction_begin_time: 0.0,
            topology_reconstruction_end_time: 100.0,
            topology_reconstruction_time_increment: 1.0,
        }
    }
}

impl ReconstructParams {
    /// The time span over which features are moved through topologies.
    pub fn topology_time_range(&self) -> Result<TimeRange> {
        TimeRange::new(
            self.topology_reconstruction_begin_time,
            self.topology_reconstruction_end_time,
            self.topology_reconstruction_time_increment,
        )
    }

    fn key(&self) -> (bool, bool, u64, u64, u64) {
        (
            self.reconstruct_by_plate_id_outside_active_time_period,
            self.reconstruct_using_topologies,
            self.topology_reconstruction_begin_time.to_bits(),
            self.topology_reconstruction_end_time.to_bits(),
            self.topology_reconstruction_time_increment.to_bits(),
        )
    }
}

impl PartialEq for ReconstructParams {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ReconstructParams {}

impl Hash for ReconstructParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

//! Aggregate key routing.
//!
//! Both pool strategies map a key to `fnv1a_32(key) % lanes`. The mapping depends
//! only on the key bytes and the lane count, so it is stable for the life of a pool
//! and the same key always lands on the same lane.

use crate::error::{DispatchError, Result};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a hash.
#[inline]
#[must_use]
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(FNV_OFFSET_BASIS, |hash, &b| (hash ^ u32::from(b)).wrapping_mul(FNV_PRIME))
}

/// Maps aggregate keys onto a fixed number of lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneRouter {
    lanes: usize,
}

impl LaneRouter {
    /// Create a router over `lanes` lanes.
    pub fn new(lanes: usize) -> Result<Self> {
        if lanes == 0 {
            return Err(DispatchError::config("lane count must be greater than 0"));
        }
        Ok(Self { lanes })
    }

    /// Number of lanes.
    #[must_use]
    pub const fn lanes(&self) -> usize {
        self.lanes
    }

    /// Lane index for `aggregate_id`.
    #[inline]
    #[must_use]
    pub fn route(&self, aggregate_id: &str) -> usize {
        fnv1a_32(aggregate_id.as_bytes()) as usize % self.lanes
    }
}

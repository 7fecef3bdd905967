//! Piece commitment calculation
//!
//! The commitment is computed out of process by the `stream-commp` helper.
//! Calculators are synchronous: they run before any provider call is made.

pub mod convert;
pub mod stream;

use crate::error::Result;
use crate::types::PieceCid;
use serde::{Deserialize, Serialize};

pub use convert::{piece_cid_v2_from_v1, FIL_COMMITMENT_UNSEALED, RAW_CODEC};
pub use stream::StreamCommp;

/// Commitment and sizes for one payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceCidInfo {
    /// Content identifier used on the wire
    pub piece_cid: PieceCid,
    /// Legacy commitment identifier, when the calculator reports one
    pub piece_cid_v1: Option<String>,
    pub payload_size: u64,
    pub unpadded_piece_size: u64,
    pub padded_piece_size: u64,
}

/// Computes the content identifier of a payload
pub trait CommitmentCalculator: Send + Sync {
    fn compute(&self, data: &[u8]) -> Result<PieceCidInfo>;
}

/// Smallest power-of-two piece that holds `payload_size` bytes after Fr32 expansion
pub fn padded_piece_size(payload_size: u64) -> u64 {
    let expanded = payload_size + payload_size.div_ceil(127);
    expanded.max(128).next_power_of_two()
}

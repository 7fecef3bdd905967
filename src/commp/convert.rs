//! Legacy-to-current piece identifier conversion
//!
//! A current piece identifier is a raw CIDv1 whose multihash digest is
//! `varint(padding) ++ tree_height ++ root`, where `root` is the 32-byte
//! commitment carried by the legacy identifier.

use crate::error::{Result, StorageError};
use crate::types::PieceCid;
use cid::multihash::Multihash;
use cid::Cid;

/// Multicodec of legacy commitment identifiers
pub const FIL_COMMITMENT_UNSEALED: u64 = 0xf101;
/// Multihash of legacy commitment identifiers
pub const SHA2_256_TRUNC254_PADDED: u64 = 0x1012;
/// Multihash of current piece identifiers
pub const FR32_SHA256_TRUNC254_PADBINTREE: u64 = 0x1011;
pub const RAW_CODEC: u64 = 0x55;

const NODE_SIZE: u64 = 32;

/// Convert a legacy commitment identifier plus sizes into a current piece identifier
pub fn piece_cid_v2_from_v1(v1: &str, payload_size: u64, padded_size: u64) -> Result<PieceCid> {
    let legacy = Cid::try_from(v1)
        .map_err(|e| StorageError::commitment(format!("invalid commitment CID {}: {}", v1, e)))?;

    if legacy.codec() != FIL_COMMITMENT_UNSEALED
        || legacy.hash().code() != SHA2_256_TRUNC254_PADDED
    {
        return Err(StorageError::commitment(format!(
            "{} is not an unsealed commitment (codec {:#x}, hash {:#x})",
            v1,
            legacy.codec(),
            legacy.hash().code()
        )));
    }

    let root = legacy.hash().digest();
    if root.len() != NODE_SIZE as usize {
        return Err(StorageError::commitment(format!(
            "commitment root has {} bytes, expected {}",
            root.len(),
            NODE_SIZE
        )));
    }

    if padded_size < NODE_SIZE * 4 || !padded_size.is_power_of_two() {
        return Err(StorageError::commitment(format!(
            "padded piece size {} is not a power of two of at least 128",
            padded_size
        )));
    }

    let unpadded = padded_size / 128 * 127;
    let padding = unpadded.checked_sub(payload_size).ok_or_else(|| {
        StorageError::commitment(format!(
            "payload of {} bytes does not fit a {} byte piece",
            payload_size, padded_size
        ))
    })?;
    let height = (padded_size / NODE_SIZE).ilog2() as u8;

    let mut buf = unsigned_varint::encode::u64_buffer();
    let mut digest = unsigned_varint::encode::u64(padding, &mut buf).to_vec();
    digest.push(height);
    digest.extend_from_slice(root);

    let hash = Multihash::<64>::wrap(FR32_SHA256_TRUNC254_PADBINTREE, &digest)
        .map_err(|e| StorageError::commitment(format!("failed to wrap piece digest: {}", e)))?;

    PieceCid::parse(Cid::new_v1(RAW_CODEC, hash).to_string())
}

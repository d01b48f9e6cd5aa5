//! Reed-Solomon FEC over GF(2^8), used by both the video and audio
//! payloaders. `reed-solomon-erasure`'s generator matrix is deterministic,
//! so identical input shards always produce byte-identical parity.

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{HostError, TransientError};

pub const MAX_TOTAL_SHARDS: usize = 255;

/// Encode `data_shards` shards of equal length in place, writing
/// `parity_shards` parity rows after them. `shards[i].len()` must be equal
/// for all `i`.
pub fn encode(shards: &mut [Vec<u8>], data_shards: usize, parity_shards: usize) -> Result<(), HostError> {
    if data_shards + parity_shards > MAX_TOTAL_SHARDS {
        return Err(HostError::Transient(TransientError::FecOverflow {
            shards: data_shards + parity_shards,
        }));
    }
    if shards.len() != data_shards + parity_shards {
        return Err(HostError::Internal(
            "shard count does not match data+parity".into(),
        ));
    }
    let rs = ReedSolomon::new(data_shards, parity_shards)
        .map_err(|e| HostError::Internal(format!("failed to build Reed-Solomon encoder: {e}")))?;
    rs.encode(shards)
        .map_err(|e| HostError::Internal(format!("FEC encode failed: {e}")))
}

/// Reconstruct any missing shards (marked `None` in `shards`) given that
/// at least `data_shards` are present.
pub fn reconstruct(
    shards: &mut [Option<Vec<u8>>],
    data_shards: usize,
    parity_shards: usize,
) -> Result<(), HostError> {
    let rs = ReedSolomon::new(data_shards, parity_shards)
        .map_err(|e| HostError::Internal(format!("failed to build Reed-Solomon encoder: {e}")))?;
    rs.reconstruct(shards)
        .map_err(|e| HostError::Internal(format!("FEC reconstruct failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_produces_deterministic_parity() {
        let data_shards = 4;
        let parity_shards = 2;
        let block_size = 8;
        let mut shards: Vec<Vec<u8>> = (0..data_shards + parity_shards)
            .map(|i| {
                if i < data_shards {
                    vec![i as u8; block_size]
                } else {
                    vec![0u8; block_size]
                }
            })
            .collect();
        encode(&mut shards, data_shards, parity_shards).unwrap();

        let mut shards2: Vec<Vec<u8>> = (0..data_shards + parity_shards)
            .map(|i| {
                if i < data_shards {
                    vec![i as u8; block_size]
                } else {
                    vec![0u8; block_size]
                }
            })
            .collect();
        encode(&mut shards2, data_shards, parity_shards).unwrap();

        assert_eq!(shards, shards2);
    }

    #[test]
    fn reconstructs_single_missing_data_shard() {
        let data_shards = 4;
        let parity_shards = 2;
        let block_size = 16;
        let mut shards: Vec<Vec<u8>> = (0..data_shards + parity_shards)
            .map(|i| vec![(i * 7) as u8; block_size])
            .collect();
        // Zero the data region before encode so the parity is computed
        // over real payload, not the placeholder fill used above.
        for (i, shard) in shards.iter_mut().enumerate().take(data_shards) {
            for (j, byte) in shard.iter_mut().enumerate() {
                *byte = ((i * 31 + j) % 256) as u8;
            }
        }
        encode(&mut shards, data_shards, parity_shards).unwrap();
        let original = shards.clone();

        let mut with_hole: Vec<Option<Vec<u8>>> = shards.into_iter().map(Some).collect();
        with_hole[1] = None;
        reconstruct(&mut with_hole, data_shards, parity_shards).unwrap();

        assert_eq!(with_hole[1].as_ref().unwrap(), &original[1]);
    }

    #[test]
    fn rejects_oversized_shard_count() {
        let mut shards: Vec<Vec<u8>> = (0..200).map(|_| vec![0u8; 4]).collect();
        let err = encode(&mut shards, 120, 80);
        assert!(err.is_err());
    }
}

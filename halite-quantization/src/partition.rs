/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Load-balanced partition of the coordinate axes into PQ chunks.

use halite::{AnnError, AnnResult};

/// Partition `dim` axes into `num_pq_chunks` contiguous groups and return
/// the offset array `O[0..=num_pq_chunks]` with `O[0] = 0`,
/// `O[num_pq_chunks] = dim`.
///
/// Exactly `dim - floor(dim / num_pq_chunks) * num_pq_chunks` groups receive
/// `ceil(dim / num_pq_chunks)` axes; the rest receive the floor. Axes are
/// assigned one at a time to the least-loaded bin whose size is still below
/// the current threshold (the threshold drops from `ceil` to `floor` once
/// enough bins are full), ties broken by the smallest bin index. The fill is
/// fully deterministic, so the partition is reproducible across runs and
/// machines.
pub fn calculate_chunk_offsets(dim: usize, num_pq_chunks: usize) -> AnnResult<Vec<usize>> {
    if num_pq_chunks == 0 || num_pq_chunks > dim {
        return Err(AnnError::invalid_config(format_args!(
            "cannot split {} dimensions into {} chunks",
            dim, num_pq_chunks
        )));
    }

    let low_val = dim / num_pq_chunks;
    let high_val = dim.div_ceil(num_pq_chunks);
    let max_num_high = dim - low_val * num_pq_chunks;
    let mut cur_num_high = 0;
    let mut cur_bin_threshold = high_val;

    let mut bin_sizes = vec![0usize; num_pq_chunks];
    // Per-bin load statistic. Nothing updates it today, so the choice
    // degenerates to the first bin below the threshold; the hook stays for
    // weighted partitioning.
    let bin_loads = vec![0.0f32; num_pq_chunks];

    for _axis in 0..dim {
        let mut cur_best = num_pq_chunks;
        let mut cur_best_load = f32::MAX;
        for (bin, (&load, &size)) in bin_loads.iter().zip(bin_sizes.iter()).enumerate() {
            if load < cur_best_load && size < cur_bin_threshold {
                cur_best = bin;
                cur_best_load = load;
            }
        }
        debug_assert!(cur_best < num_pq_chunks, "every axis must land in a bin");

        bin_sizes[cur_best] += 1;
        if bin_sizes[cur_best] == high_val {
            cur_num_high += 1;
            if cur_num_high == max_num_high {
                cur_bin_threshold = low_val;
            }
        }
    }

    let mut offsets = Vec::with_capacity(num_pq_chunks + 1);
    offsets.push(0);
    for bin in 0..num_pq_chunks {
        offsets.push(offsets[bin] + bin_sizes[bin]);
    }
    debug_assert_eq!(*offsets.last().unwrap(), dim);

    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use halite::AnnErrorKind;

    use super::*;

    #[test]
    fn ten_dims_three_chunks() {
        let offsets = calculate_chunk_offsets(10, 3).unwrap();
        assert_eq!(offsets, vec![0, 4, 7, 10]);
    }

    #[test]
    fn eight_dims_four_chunks() {
        let offsets = calculate_chunk_offsets(8, 4).unwrap();
        assert_eq!(offsets, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn single_chunk_owns_everything() {
        assert_eq!(calculate_chunk_offsets(128, 1).unwrap(), vec![0, 128]);
    }

    #[test]
    fn more_chunks_than_dims_is_invalid() {
        let err = calculate_chunk_offsets(4, 5).unwrap_err();
        assert_eq!(err.kind(), AnnErrorKind::InvalidConfig);
    }

    #[test]
    fn widths_and_counts_hold_across_a_grid() {
        for dim in 1..=96usize {
            for num_chunks in 1..=dim {
                let offsets = calculate_chunk_offsets(dim, num_chunks).unwrap();
                assert_eq!(offsets.len(), num_chunks + 1);
                assert_eq!(offsets[0], 0);
                assert_eq!(offsets[num_chunks], dim);

                let low = dim / num_chunks;
                let high = dim.div_ceil(num_chunks);
                let mut num_high = 0;
                for pair in offsets.windows(2) {
                    let width = pair[1] - pair[0];
                    assert!(width == low || width == high);
                    if width == high {
                        num_high += 1;
                    }
                }
                if low != high {
                    assert_eq!(num_high, dim - low * num_chunks);
                }
            }
        }
    }
}

/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Query-time PQ helpers: gathering codes by vertex id and summing
//! precomputed chunk distances. These run once per candidate batch on the
//! search hot path.

use halite::{utils::IntoUsize, AnnError, AnnResult};

use crate::table::NUM_PQ_CENTROIDS;

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn prefetch_read<T>(ptr: *const T) {
    // SAFETY: prefetching is a hint; any address is allowed.
    unsafe {
        core::arch::x86_64::_mm_prefetch(ptr.cast::<i8>(), core::arch::x86_64::_MM_HINT_T0)
    };
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
fn prefetch_read<T>(_ptr: *const T) {}

/// Gather the PQ codes of `ids` out of the contiguous `N x num_pq_chunks`
/// code array `all_coords` into `out`, one `num_pq_chunks`-byte row per id
/// in order.
pub fn aggregate_coords(
    ids: &[u32],
    all_coords: &[u8],
    num_pq_chunks: usize,
    out: &mut [u8],
) -> AnnResult<()> {
    if out.len() < ids.len() * num_pq_chunks {
        return Err(AnnError::invalid_config(format_args!(
            "coordinate scratch holds {} bytes but {} ids x {} chunks require {}",
            out.len(),
            ids.len(),
            num_pq_chunks,
            ids.len() * num_pq_chunks
        )));
    }

    for (row, &id) in out.chunks_exact_mut(num_pq_chunks).zip(ids.iter()) {
        let src = id.into_usize() * num_pq_chunks;
        row.copy_from_slice(&all_coords[src..src + num_pq_chunks]);
    }

    Ok(())
}

/// Sum precomputed chunk distances for a batch of gathered codes:
/// `dists_out[i] = Σ_chunk pq_dists[chunk * 256 + pq_ids[i * M + chunk]]`.
///
/// `pq_dists` is the `M x 256` table produced by
/// `FixedChunkPQTable::populate_chunk_distances` (or the inner-product
/// variant). The loop runs chunk-major so each chunk's 1 KiB distance row
/// stays hot across the whole batch, and the next row is prefetched while
/// the current one is summed.
pub fn pq_dist_lookup(
    pq_ids: &[u8],
    n_pts: usize,
    pq_nchunks: usize,
    pq_dists: &[f32],
    dists_out: &mut [f32],
) -> AnnResult<()> {
    if pq_ids.len() < n_pts * pq_nchunks {
        return Err(AnnError::invalid_config(format_args!(
            "{} gathered code bytes cannot cover {} points x {} chunks",
            pq_ids.len(),
            n_pts,
            pq_nchunks
        )));
    }
    if pq_dists.len() < pq_nchunks * NUM_PQ_CENTROIDS {
        return Err(AnnError::invalid_config(format_args!(
            "distance table holds {} entries, expected {} chunks x {}",
            pq_dists.len(),
            pq_nchunks,
            NUM_PQ_CENTROIDS
        )));
    }
    let dists_out = dists_out.get_mut(..n_pts).ok_or_else(|| {
        AnnError::invalid_config(format_args!("output buffer shorter than {} points", n_pts))
    })?;

    prefetch_read(dists_out.as_ptr());
    prefetch_read(pq_ids.as_ptr());

    dists_out.fill(0.0);
    for chunk in 0..pq_nchunks {
        let chunk_dists = &pq_dists[NUM_PQ_CENTROIDS * chunk..NUM_PQ_CENTROIDS * (chunk + 1)];
        if chunk < pq_nchunks - 1 {
            prefetch_read(pq_dists[NUM_PQ_CENTROIDS * (chunk + 1)..].as_ptr());
        }
        for (idx, dist) in dists_out.iter_mut().enumerate() {
            let pq_centerid = pq_ids[pq_nchunks * idx + chunk];
            *dist += chunk_dists[pq_centerid.into_usize()];
        }
    }

    Ok(())
}

/// Sum precomputed chunk distances for a single code.
pub fn pq_dist_lookup_single(pq_coordinates: &[u8], pq_dists: &[f32]) -> f32 {
    debug_assert!(pq_dists.len() >= pq_coordinates.len() * NUM_PQ_CENTROIDS);
    std::iter::zip(
        pq_coordinates.iter(),
        pq_dists.chunks(NUM_PQ_CENTROIDS),
    )
    .map(|(&code, chunk_dists)| chunk_dists[code.into_usize()])
    .sum()
}

/// Gather the codes of `vector_ids` and resolve them against the query's
/// distance table in one call; the usual per-batch step of the disk search
/// loop.
pub fn compute_pq_distance(
    vector_ids: &[u32],
    num_pq_chunks: usize,
    pq_dists: &[f32],
    pq_data: &[u8],
    pq_coordinate_scratch: &mut [u8],
    pq_distance_scratch: &mut [f32],
) -> AnnResult<()> {
    aggregate_coords(vector_ids, pq_data, num_pq_chunks, pq_coordinate_scratch)?;
    pq_dist_lookup(
        &pq_coordinate_scratch[..vector_ids.len() * num_pq_chunks],
        vector_ids.len(),
        num_pq_chunks,
        pq_dists,
        pq_distance_scratch,
    )
}

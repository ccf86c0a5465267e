/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Distance kernels and blocked closest-center search.

use halite::{AnnError, AnnResult};
use halite_linalg::{sgemm, Transpose};
use rayon::prelude::*;

// Number of points handed to one BLAS block of the closest-center search.
// Large enough for the three sgemm calls to amortise, small enough that the
// `block x num_centers` distance matrix stays cache-resident.
const POINTS_PER_BLOCK: usize = 512;

/// Squared L2 distance between two equally long slices.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    std::iter::zip(a.iter(), b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

/// Fill `vecs_l2sq[i]` with the squared L2 norm of row `i` of the row-major
/// `num_points x dim` matrix `data`.
pub fn compute_vecs_l2sq(
    vecs_l2sq: &mut [f32],
    data: &[f32],
    num_points: usize,
    dim: usize,
) -> AnnResult<()> {
    if data.len() != num_points * dim || vecs_l2sq.len() != num_points {
        return Err(AnnError::invalid_config(format_args!(
            "norm buffers disagree: {} data elements, {} norms, expected {} points x {} dims",
            data.len(),
            vecs_l2sq.len(),
            num_points,
            dim
        )));
    }

    vecs_l2sq
        .par_iter_mut()
        .enumerate()
        .for_each(|(i, vec_l2sq)| {
            *vec_l2sq = data[i * dim..(i + 1) * dim].iter().map(|x| x * x).sum();
        });

    Ok(())
}

/// Closest-center assignment for one block of points.
///
/// Expands `‖x − c‖² = ‖x‖² + ‖c‖² − 2·x·c` into three `sgemm` calls over
/// the whole block, then takes a row-wise argmin. `dist_matrix` must hold
/// `num_points * num_centers` elements and is clobbered.
#[allow(clippy::too_many_arguments)]
fn compute_closest_centers_in_block(
    data: &[f32],
    num_points: usize,
    dim: usize,
    centers: &[f32],
    num_centers: usize,
    docs_l2sq: &[f32],
    centers_l2sq: &[f32],
    center_index: &mut [u32],
    dist_matrix: &mut [f32],
) {
    let ones_centers: Vec<f32> = vec![1.0; num_centers];
    let ones_points: Vec<f32> = vec![1.0; num_points];

    // dist[i][j] = docs_l2sq[i]
    sgemm(
        Transpose::None,
        Transpose::Ordinary,
        num_points,
        num_centers,
        1,
        1.0,
        docs_l2sq,
        &ones_centers,
        None,
        dist_matrix,
    );

    // dist[i][j] += centers_l2sq[j]
    sgemm(
        Transpose::None,
        Transpose::Ordinary,
        num_points,
        num_centers,
        1,
        1.0,
        &ones_points,
        centers_l2sq,
        Some(1.0),
        dist_matrix,
    );

    // dist[i][j] -= 2 * <data[i], centers[j]>
    sgemm(
        Transpose::None,
        Transpose::Ordinary,
        num_points,
        num_centers,
        dim,
        -2.0,
        data,
        centers,
        Some(1.0),
        dist_matrix,
    );

    let dist_matrix: &[f32] = dist_matrix;
    center_index
        .par_iter_mut()
        .enumerate()
        .for_each(|(i, center_idx)| {
            let row = &dist_matrix[i * num_centers..(i + 1) * num_centers];
            let mut min = f32::MAX;
            let mut min_idx = 0;
            for (j, &distance) in row.iter().enumerate() {
                if distance < min {
                    min = distance;
                    min_idx = j;
                }
            }
            *center_idx = min_idx as u32;
        });
}

/// For each row of the row-major `num_points x dim` matrix `data`, find the
/// nearest of `num_centers` centers (row-major `num_centers x dim`) and
/// write its index into `closest_center`.
///
/// Optionally fills `inverted_index` (one vector of point ids per center,
/// assumed empty on entry) and reuses pre-computed point norms from
/// `pts_norms_squared`. Points are processed in fixed-size blocks so the
/// intermediate distance matrix never exceeds `POINTS_PER_BLOCK x
/// num_centers`.
pub fn compute_closest_centers(
    data: &[f32],
    num_points: usize,
    dim: usize,
    centers: &[f32],
    num_centers: usize,
    closest_center: &mut [u32],
    mut inverted_index: Option<&mut Vec<Vec<usize>>>,
    pts_norms_squared: Option<&[f32]>,
) -> AnnResult<()> {
    if closest_center.len() != num_points {
        return Err(AnnError::invalid_config(format_args!(
            "closest_center has length {} but there are {} points",
            closest_center.len(),
            num_points
        )));
    }

    let docs_l2sq = match pts_norms_squared {
        Some(norms) => norms.to_vec(),
        None => {
            let mut norms = vec![0.0; num_points];
            compute_vecs_l2sq(&mut norms, data, num_points, dim)?;
            norms
        }
    };

    let mut centers_l2sq = vec![0.0; num_centers];
    compute_vecs_l2sq(&mut centers_l2sq, centers, num_centers, dim)?;

    let mut dist_matrix = vec![0.0; POINTS_PER_BLOCK.min(num_points) * num_centers];

    for (block_index, (data_block, docs_l2sq_block)) in data
        .chunks(dim * POINTS_PER_BLOCK)
        .zip(docs_l2sq.chunks(POINTS_PER_BLOCK))
        .enumerate()
    {
        let block_size = data_block.len() / dim;
        let block_start = block_index * POINTS_PER_BLOCK;
        let assignments = &mut closest_center[block_start..block_start + block_size];

        compute_closest_centers_in_block(
            data_block,
            block_size,
            dim,
            centers,
            num_centers,
            docs_l2sq_block,
            &centers_l2sq,
            assignments,
            &mut dist_matrix[..block_size * num_centers],
        );

        if let Some(inverted_index) = inverted_index.as_deref_mut() {
            for (offset, &center) in assignments.iter().enumerate() {
                inverted_index[center as usize].push(block_start + offset);
            }
        }
    }

    Ok(())
}

/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! K-means primitives for PQ training: k-means++ seeding and Lloyd's
//! iterations.

use halite::{AnnError, AnnResult};
use hashbrown::HashSet;
use rand::{
    distr::{Distribution, StandardUniform, Uniform},
    Rng,
};
use rayon::prelude::*;

use crate::math::{compute_closest_centers, compute_vecs_l2sq, squared_l2};

// k-means++ walks a prefix sum over every point per selected pivot, so cap
// the input size where the quadratic-ish cost stops being worth it.
const MAX_KMEANSPP_POINTS: usize = 1 << 23;

/// One Lloyd iteration: assign every point to its nearest center, then move
/// each center to the mean of its members. Returns the summed squared
/// residual of the new assignment.
fn lloyds_iter(
    data: &[f32],
    num_points: usize,
    dim: usize,
    centers: &mut [f32],
    num_centers: usize,
    docs_l2sq: &[f32],
    closest_docs: &mut Vec<Vec<usize>>,
    closest_center: &mut [u32],
) -> AnnResult<f32> {
    closest_docs.iter_mut().for_each(|doc| doc.clear());

    compute_closest_centers(
        data,
        num_points,
        dim,
        centers,
        num_centers,
        closest_center,
        Some(closest_docs),
        Some(docs_l2sq),
    )?;

    centers.fill(0.0);
    centers
        .par_chunks_mut(dim)
        .enumerate()
        .for_each(|(c, center)| {
            if closest_docs[c].is_empty() {
                return;
            }
            // Accumulate in f64: clusters can hold millions of rows.
            let mut cluster_sum = vec![0.0f64; dim];
            for &doc_index in &closest_docs[c] {
                let row = &data[doc_index * dim..(doc_index + 1) * dim];
                for (acc, &value) in cluster_sum.iter_mut().zip(row.iter()) {
                    *acc += value as f64;
                }
            }
            let count = closest_docs[c].len() as f64;
            for (out, sum) in center.iter_mut().zip(cluster_sum.iter()) {
                *out = (*sum / count) as f32;
            }
        });

    let residual = (0..num_points)
        .into_par_iter()
        .map(|d| {
            let cc = closest_center[d] as usize;
            squared_l2(
                &data[d * dim..(d + 1) * dim],
                &centers[cc * dim..(cc + 1) * dim],
            )
        })
        .sum();

    Ok(residual)
}

/// Run Lloyd's algorithm for at most `max_reps` iterations, stopping early
/// once the relative residual improvement drops below `1e-5`.
///
/// `centers` holds the seed centers on entry and the trained centers on
/// exit, row-major `num_centers x dim`. Returns the per-center member
/// lists, the per-point assignment and the final residual.
pub fn run_lloyds(
    data: &[f32],
    num_points: usize,
    dim: usize,
    centers: &mut [f32],
    num_centers: usize,
    max_reps: usize,
) -> AnnResult<(Vec<Vec<usize>>, Vec<u32>, f32)> {
    let mut residual = f32::MAX;
    let mut closest_docs = vec![Vec::new(); num_centers];
    let mut closest_center = vec![0u32; num_points];

    let mut docs_l2sq = vec![0.0; num_points];
    compute_vecs_l2sq(&mut docs_l2sq, data, num_points, dim)?;

    for i in 0..max_reps {
        let old_residual = residual;
        residual = lloyds_iter(
            data,
            num_points,
            dim,
            centers,
            num_centers,
            &docs_l2sq,
            &mut closest_docs,
            &mut closest_center,
        )?;

        if (i != 0 && (old_residual - residual) / residual < 1e-5) || residual < f32::EPSILON {
            break;
        }
    }

    Ok((closest_docs, closest_center, residual))
}

/// Seed `num_centers` pivots with k-means++ dart throwing: each next pivot
/// is sampled with probability proportional to its squared distance from
/// the already chosen set.
///
/// When the data holds fewer distinct points than requested centers, the
/// distinct points are taken and the remainder is filled by uniform
/// resampling.
pub fn kmeanspp_selecting_pivots(
    data: &[f32],
    num_points: usize,
    dim: usize,
    pivot_data: &mut [f32],
    num_centers: usize,
    rng: &mut impl Rng,
) -> AnnResult<()> {
    if num_points > MAX_KMEANSPP_POINTS {
        return Err(AnnError::kmeans_error(format_args!(
            "{} points exceed the k-means++ limit of {}; subsample the training set first",
            num_points, MAX_KMEANSPP_POINTS
        )));
    }
    if pivot_data.len() != num_centers * dim {
        return Err(AnnError::kmeans_error(format_args!(
            "pivot buffer must hold num_centers * dim = {} elements, got {}",
            num_centers * dim,
            pivot_data.len()
        )));
    }

    let int_distribution = Uniform::new(0, num_points)
        .map_err(|_| AnnError::kmeans_error("cannot cluster an empty dataset"))?;

    let mut picked = HashSet::with_capacity(num_centers);

    let init_id = int_distribution.sample(rng);
    picked.insert(init_id);
    pivot_data[0..dim].copy_from_slice(&data[init_id * dim..(init_id + 1) * dim]);

    // dist[i] tracks the squared distance of point i to its nearest pivot
    // chosen so far.
    let mut dist = vec![0.0f32; num_points];
    dist.par_iter_mut().enumerate().for_each(|(i, dist_i)| {
        *dist_i = squared_l2(
            &data[i * dim..(i + 1) * dim],
            &data[init_id * dim..(init_id + 1) * dim],
        );
    });

    for _ in 1..num_centers {
        let sum: f64 = dist
            .iter()
            .map(|&x| if x == f32::INFINITY { f32::MAX } else { x } as f64)
            .sum();

        // Every distinct point is already a pivot; fall through to random
        // refills below.
        if sum == 0.0 {
            break;
        }

        let sample: f64 = StandardUniform.sample(rng);
        let dart_val = sample * sum;

        let mut prefix_sum: f64 = 0.0;
        let mut picked_pivot_id = num_points;
        for (i, &pivot_dist) in dist.iter().enumerate() {
            // The second disjunct picks up distances too small to move the
            // prefix sum in f64.
            if dart_val >= prefix_sum
                && (dart_val < prefix_sum + pivot_dist as f64
                    || (dart_val <= prefix_sum && pivot_dist != 0.0f32))
            {
                if picked.contains(&i) {
                    return Err(AnnError::kmeans_error(
                        "k-means++ sampled an already chosen pivot; zero-distance points must not be reachable",
                    ));
                }
                picked.insert(i);
                picked_pivot_id = i;
                break;
            }
            prefix_sum += pivot_dist as f64;
        }

        if picked_pivot_id == num_points {
            return Err(AnnError::kmeans_error(
                "k-means++ dart landed outside the distance mass",
            ));
        }

        let pivot_offset = (picked.len() - 1) * dim;
        pivot_data[pivot_offset..pivot_offset + dim]
            .copy_from_slice(&data[picked_pivot_id * dim..(picked_pivot_id + 1) * dim]);

        dist.par_iter_mut().enumerate().for_each(|(i, dist_i)| {
            *dist_i = (*dist_i).min(squared_l2(
                &data[i * dim..(i + 1) * dim],
                &data[picked_pivot_id * dim..(picked_pivot_id + 1) * dim],
            ));
        });
    }

    let mut num_picked = picked.len();
    while num_picked < num_centers {
        let random_id = int_distribution.sample(rng);
        num_picked += 1;
        let pivot_offset = (num_picked - 1) * dim;
        pivot_data[pivot_offset..pivot_offset + dim]
            .copy_from_slice(&data[random_id * dim..(random_id + 1) * dim]);
    }

    Ok(())
}

/// k-means++ seeding followed by Lloyd's refinement.
pub fn k_means_clustering(
    data: &[f32],
    num_points: usize,
    dim: usize,
    centers: &mut [f32],
    num_centers: usize,
    max_reps: usize,
    rng: &mut impl Rng,
) -> AnnResult<(Vec<Vec<usize>>, Vec<u32>, f32)> {
    kmeanspp_selecting_pivots(data, num_points, dim, centers, num_centers, rng)?;
    run_lloyds(data, num_points, dim, centers, num_centers, max_reps)
}

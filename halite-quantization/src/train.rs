/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Offline training of PQ and OPQ pivot tables.

use halite::{AnnError, AnnResult};
use halite_linalg::{sgemm, svd_into, Transpose};
use rand::Rng;
use rayon::prelude::*;
use tracing::info;

use crate::{
    kmeans::{kmeanspp_selecting_pivots, run_lloyds},
    partition::calculate_chunk_offsets,
    storage::PQStorage,
    table::NUM_PQ_CENTROIDS,
};

/// Outer rounds of the OPQ alternating minimisation. Each round lowers the
/// reconstruction error in exact arithmetic, so a small fixed count
/// suffices.
pub const MAX_OPQ_ITERS: usize = 20;

/// Lloyd's iterations per chunk inside one OPQ round. The rotation keeps
/// moving, so per-round clustering only needs to track it, not converge.
const NUM_OPQ_LLOYDS_ITERS: usize = 8;

/// Training knobs shared by the PQ and OPQ trainers.
#[derive(Debug, Clone, Copy)]
pub struct PivotTrainingParameters {
    /// Centers per chunk. The rest of the stack assumes
    /// [`NUM_PQ_CENTROIDS`] for byte codes.
    pub num_centers: usize,
    /// Number of chunks `M`.
    pub num_pq_chunks: usize,
    /// Lloyd's iteration cap for plain PQ training.
    pub max_k_means_reps: usize,
    /// Subtract the training-data mean before quantization. Must be `false`
    /// when the table will serve inner-product queries; translation does
    /// not preserve inner products.
    pub make_zero_mean: bool,
}

/// Outcome of a training call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PivotTraining {
    /// Pivots were trained and persisted.
    Trained,
    /// A pivot file with matching shape already exists; nothing was done.
    Skipped,
}

/// Subtract the column mean from every row of `train_data`, leaving the
/// mean in `centroid`.
pub fn move_train_data_by_centroid(
    train_data: &mut [f32],
    num_points: usize,
    dim: usize,
    centroid: &mut [f32],
) {
    assert_eq!(train_data.len(), num_points * dim);
    assert_eq!(centroid.len(), dim);

    centroid.fill(0.0);
    for row in train_data.chunks_exact(dim) {
        for (c, r) in std::iter::zip(centroid.iter_mut(), row.iter()) {
            *c += *r;
        }
    }
    centroid.iter_mut().for_each(|c| *c /= num_points as f32);

    for row in train_data.chunks_exact_mut(dim) {
        for (r, c) in std::iter::zip(row.iter_mut(), centroid.iter()) {
            *r -= *c;
        }
    }
}

/// Copy chunk `chunk_index` (columns `[offsets[i], offsets[i+1])`) out of
/// every row of `data` into a dense `num_points x chunk_size` matrix.
fn extract_chunk(
    data: &[f32],
    num_points: usize,
    dim: usize,
    chunk_start: usize,
    chunk_size: usize,
) -> Vec<f32> {
    let mut result = vec![0.0f32; num_points * chunk_size];
    result
        .par_chunks_mut(chunk_size)
        .enumerate()
        .for_each(|(row, out)| {
            let start = row * dim + chunk_start;
            out.copy_from_slice(&data[start..start + chunk_size]);
        });
    result
}

/// Scatter per-chunk centers (`num_centers x chunk_size`) back into the
/// corresponding columns of the full pivot table.
fn store_chunk_centers(
    full_pivot_data: &mut [f32],
    cur_pivot_data: &[f32],
    num_centers: usize,
    dim: usize,
    chunk_start: usize,
    chunk_size: usize,
) {
    for center in 0..num_centers {
        let dst = center * dim + chunk_start;
        full_pivot_data[dst..dst + chunk_size]
            .copy_from_slice(&cur_pivot_data[center * chunk_size..(center + 1) * chunk_size]);
    }
}

/// Returns `Ok(Some(..))` with the prepared training state, or `Ok(None)`
/// when an existing pivot file with matching shape makes training a no-op.
fn prepare_training(
    train_data: &[f32],
    num_train: usize,
    dim: usize,
    params: &PivotTrainingParameters,
    pq_storage: &PQStorage,
) -> AnnResult<Option<(Vec<f32>, Vec<f32>, Vec<usize>)>> {
    if params.num_pq_chunks > dim {
        return Err(AnnError::invalid_config(format_args!(
            "number of chunks ({}) more than dimension ({})",
            params.num_pq_chunks, dim
        )));
    }
    if train_data.len() != num_train * dim {
        return Err(AnnError::invalid_config(format_args!(
            "training data holds {} values, expected {} points x {} dims",
            train_data.len(),
            num_train,
            dim
        )));
    }

    if pq_storage.pivot_data_exists() {
        let (file_num_centers, file_dim) = pq_storage.read_pivot_metadata()?;
        if file_dim == dim && file_num_centers == params.num_centers {
            info!(
                "PQ pivot file {} exists with matching shape; not generating again",
                pq_storage.pivots_path().display()
            );
            return Ok(None);
        }
    }

    let mut train_data = train_data.to_vec();
    let mut centroid = vec![0.0f32; dim];
    if params.make_zero_mean {
        move_train_data_by_centroid(&mut train_data, num_train, dim, &mut centroid);
    }

    let chunk_offsets = calculate_chunk_offsets(dim, params.num_pq_chunks)?;
    Ok(Some((train_data, centroid, chunk_offsets)))
}

/// Train PQ pivots on `train_data` (`num_train x dim`, row-major) and
/// persist them as a pivot container at the storage's pivot path.
///
/// Each chunk is clustered independently: k-means++ seeding followed by at
/// most `max_k_means_reps` Lloyd's iterations on the `num_train x width`
/// column slice. If a pivot file with matching `(num_centers, dim)` already
/// exists it is left untouched and [`PivotTraining::Skipped`] is returned.
pub fn generate_pq_pivots(
    train_data: &[f32],
    num_train: usize,
    dim: usize,
    params: &PivotTrainingParameters,
    pq_storage: &PQStorage,
    rng: &mut impl Rng,
) -> AnnResult<PivotTraining> {
    let Some((train_data, centroid, chunk_offsets)) =
        prepare_training(train_data, num_train, dim, params, pq_storage)?
    else {
        return Ok(PivotTraining::Skipped);
    };

    let mut full_pivot_data = vec![0.0f32; params.num_centers * dim];

    for chunk in 0..params.num_pq_chunks {
        let chunk_start = chunk_offsets[chunk];
        let chunk_size = chunk_offsets[chunk + 1] - chunk_start;
        if chunk_size == 0 {
            continue;
        }

        info!(
            "Processing chunk {} with dimensions [{}, {})",
            chunk,
            chunk_start,
            chunk_start + chunk_size
        );

        let cur_data = extract_chunk(&train_data, num_train, dim, chunk_start, chunk_size);
        let mut cur_pivot_data = vec![0.0f32; params.num_centers * chunk_size];

        kmeanspp_selecting_pivots(
            &cur_data,
            num_train,
            chunk_size,
            &mut cur_pivot_data,
            params.num_centers,
            rng,
        )?;
        run_lloyds(
            &cur_data,
            num_train,
            chunk_size,
            &mut cur_pivot_data,
            params.num_centers,
            params.max_k_means_reps,
        )?;

        store_chunk_centers(
            &mut full_pivot_data,
            &cur_pivot_data,
            params.num_centers,
            dim,
            chunk_start,
            chunk_size,
        );
    }

    pq_storage.write_pivot_data(
        &full_pivot_data,
        &centroid,
        &chunk_offsets,
        params.num_centers,
        dim,
    )?;

    Ok(PivotTraining::Trained)
}

/// Train OPQ pivots: PQ preceded by a learned orthogonal rotation, found
/// by alternating minimisation over (rotation, quantization).
///
/// Per round: rotate the training data with the current `R`; re-cluster
/// each chunk in the rotated space (k-means++ seeds on the first round,
/// previous centers afterwards); form the correlation `Σ = Xᵀ·X_quant`;
/// take its SVD and set `R ← U·Vᵀ`. The pivot container is written like
/// plain PQ, plus the sibling rotation file.
pub fn generate_opq_pivots(
    train_data: &[f32],
    num_train: usize,
    dim: usize,
    params: &PivotTrainingParameters,
    pq_storage: &PQStorage,
    rng: &mut impl Rng,
) -> AnnResult<PivotTraining> {
    generate_opq_pivots_impl(
        train_data,
        num_train,
        dim,
        params,
        pq_storage,
        rng,
        MAX_OPQ_ITERS,
    )
}

fn generate_opq_pivots_impl(
    train_data: &[f32],
    num_train: usize,
    dim: usize,
    params: &PivotTrainingParameters,
    pq_storage: &PQStorage,
    rng: &mut impl Rng,
    num_opq_iters: usize,
) -> AnnResult<PivotTraining> {
    let Some((train_data, centroid, chunk_offsets)) =
        prepare_training(train_data, num_train, dim, params, pq_storage)?
    else {
        return Ok(PivotTraining::Skipped);
    };

    let mut full_pivot_data = vec![0.0f32; params.num_centers * dim];

    // R starts as the identity.
    let mut rotmat_tr = vec![0.0f32; dim * dim];
    for d in 0..dim {
        rotmat_tr[d * dim + d] = 1.0;
    }

    let mut rotated_train_data = vec![0.0f32; num_train * dim];
    let mut quantized_train_data = vec![0.0f32; num_train * dim];
    let mut correlation_matrix = vec![0.0f32; dim * dim];
    let mut u_matrix = vec![0.0f32; dim * dim];
    let mut vt_matrix = vec![0.0f32; dim * dim];
    let mut singular_values = vec![0.0f32; dim];

    for round in 0..num_opq_iters {
        sgemm(
            Transpose::None,
            Transpose::None,
            num_train,
            dim,
            dim,
            1.0,
            &train_data,
            &rotmat_tr,
            None,
            &mut rotated_train_data,
        );

        for chunk in 0..params.num_pq_chunks {
            let chunk_start = chunk_offsets[chunk];
            let chunk_size = chunk_offsets[chunk + 1] - chunk_start;
            if chunk_size == 0 {
                continue;
            }

            let cur_data =
                extract_chunk(&rotated_train_data, num_train, dim, chunk_start, chunk_size);
            let mut cur_pivot_data = vec![0.0f32; params.num_centers * chunk_size];

            if round == 0 {
                kmeanspp_selecting_pivots(
                    &cur_data,
                    num_train,
                    chunk_size,
                    &mut cur_pivot_data,
                    params.num_centers,
                    rng,
                )?;
            } else {
                // Warm-start from the previous round's centers.
                for center in 0..params.num_centers {
                    let src = center * dim + chunk_start;
                    cur_pivot_data[center * chunk_size..(center + 1) * chunk_size]
                        .copy_from_slice(&full_pivot_data[src..src + chunk_size]);
                }
            }

            let (_closest_docs, closest_center, _residual) = run_lloyds(
                &cur_data,
                num_train,
                chunk_size,
                &mut cur_pivot_data,
                params.num_centers,
                NUM_OPQ_LLOYDS_ITERS,
            )?;

            store_chunk_centers(
                &mut full_pivot_data,
                &cur_pivot_data,
                params.num_centers,
                dim,
                chunk_start,
                chunk_size,
            );

            // Quantized reconstruction of this chunk, scattered back into
            // the full-width buffer for the correlation step.
            for (row, &center) in closest_center.iter().enumerate() {
                let src = center as usize * chunk_size;
                let dst = row * dim + chunk_start;
                quantized_train_data[dst..dst + chunk_size]
                    .copy_from_slice(&cur_pivot_data[src..src + chunk_size]);
            }
        }

        // Σ = Xᵀ · X_quant
        sgemm(
            Transpose::Ordinary,
            Transpose::None,
            dim,
            dim,
            num_train,
            1.0,
            &train_data,
            &quantized_train_data,
            None,
            &mut correlation_matrix,
        );

        svd_into(
            dim,
            dim,
            &correlation_matrix,
            &mut singular_values,
            &mut u_matrix,
            &mut vt_matrix,
        )
        .map_err(|err| {
            AnnError::numeric_failure(format_args!(
                "SVD failed on OPQ iteration {}: {}",
                round, err
            ))
        })?;

        // R ← U · Vᵀ
        sgemm(
            Transpose::None,
            Transpose::None,
            dim,
            dim,
            dim,
            1.0,
            &u_matrix,
            &vt_matrix,
            None,
            &mut rotmat_tr,
        );
    }

    pq_storage.write_pivot_data(
        &full_pivot_data,
        &centroid,
        &chunk_offsets,
        params.num_centers,
        dim,
    )?;
    pq_storage.write_rotation_matrix_data(&rotmat_tr, dim)?;

    Ok(PivotTraining::Trained)
}

#[cfg(test)]
mod tests {
    use halite::AnnErrorKind;
    use rand::{rngs::StdRng, SeedableRng};
    use tempfile::TempDir;

    use super::*;
    use crate::{
        encode::encode_vector_into,
        table::FixedChunkPQTable,
    };

    fn storage_in(dir: &TempDir, stem: &str) -> PQStorage {
        PQStorage::new(
            dir.path().join(format!("{}_pivots.bin", stem)),
            dir.path().join(format!("{}_compressed.bin", stem)),
        )
    }

    #[test]
    fn centering_removes_the_mean() {
        let dim = 4;
        let num_points = 3;
        let mut data = vec![
            1.0, 2.0, 3.0, 4.0, //
            3.0, 2.0, 1.0, 0.0, //
            2.0, 2.0, 2.0, 2.0,
        ];
        let mut centroid = vec![0.0; dim];

        move_train_data_by_centroid(&mut data, num_points, dim, &mut centroid);

        assert_eq!(centroid, vec![2.0, 2.0, 2.0, 2.0]);
        for col in 0..dim {
            let col_sum: f32 = (0..num_points).map(|row| data[row * dim + col]).sum();
            assert!(col_sum.abs() < 1e-6);
        }
    }

    #[test]
    fn more_chunks_than_dims_is_invalid() {
        let dir = TempDir::new().unwrap();
        let params = PivotTrainingParameters {
            num_centers: 2,
            num_pq_chunks: 9,
            max_k_means_reps: 5,
            make_zero_mean: false,
        };
        let err = generate_pq_pivots(
            &vec![0.0; 5 * 8],
            5,
            8,
            &params,
            &storage_in(&dir, "invalid"),
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap_err();
        assert_eq!(err.kind(), AnnErrorKind::InvalidConfig);
    }

    // Exact round trip: D=4, M=2, K=2 on the four corners of two unit
    // squares. Each chunk sees exactly the points {(0,0), (1,1)}, so those
    // must be the centroids and inflation must reproduce the inputs
    // exactly.
    #[test]
    fn pq_round_trip_on_identity_data() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir, "identity");
        let train: Vec<f32> = vec![
            0.0, 0.0, 0.0, 0.0, //
            1.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 1.0, //
            1.0, 1.0, 1.0, 1.0,
        ];
        let params = PivotTrainingParameters {
            num_centers: 2,
            num_pq_chunks: 2,
            max_k_means_reps: 10,
            make_zero_mean: false,
        };

        let outcome = generate_pq_pivots(
            &train,
            4,
            4,
            &params,
            &storage,
            &mut StdRng::seed_from_u64(42),
        )
        .unwrap();
        assert_eq!(outcome, PivotTraining::Trained);

        let (pivots, centroid, chunk_offsets, _) =
            storage.load_pivot_data(2, 2, 4, false).unwrap();
        assert_eq!(chunk_offsets, vec![0, 2, 4]);
        assert!(centroid.iter().all(|&c| c == 0.0));

        // Per chunk the two centers are (0,0) and (1,1), in either order.
        for chunk in 0..2 {
            let mut centers: Vec<Vec<f32>> = (0..2)
                .map(|c| pivots[c * 4 + chunk * 2..c * 4 + chunk * 2 + 2].to_vec())
                .collect();
            centers.sort_by(|a, b| a[0].partial_cmp(&b[0]).unwrap());
            assert_eq!(centers[0], vec![0.0, 0.0]);
            assert_eq!(centers[1], vec![1.0, 1.0]);
        }

        // Encoding each training point and inflating reproduces it exactly.
        // The two trained centers are padded into a full 256-row table; the
        // zero rows only tie (never beat) a real center, and ties resolve
        // to the lower index.
        let mut padded = vec![0.0f32; NUM_PQ_CENTROIDS * 4];
        padded[..pivots.len()].copy_from_slice(&pivots);
        let table =
            FixedChunkPQTable::from_parts(4, padded, centroid, chunk_offsets, None).unwrap();

        for point in train.chunks(4) {
            let mut code = [0u8; 2];
            encode_vector_into(&table, point, &mut code).unwrap();
            assert!(code.iter().all(|&c| c < 2));
            let inflated = table.inflate_vector(&code);
            assert_eq!(&inflated, point);
        }
    }

    #[rstest::rstest]
    #[case(false, 2)]
    #[case(true, 2)]
    #[case(false, 3)]
    #[case(true, 3)]
    fn training_succeeds_across_configurations(
        #[case] make_zero_mean: bool,
        #[case] num_pq_chunks: usize,
    ) {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir, "configs");
        let train: Vec<f32> = vec![
            1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, //
            2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, //
            2.1, 2.1, 2.1, 2.1, 2.1, 2.1, 2.1, 2.1, //
            2.2, 2.2, 2.2, 2.2, 2.2, 2.2, 2.2, 2.2, //
            100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0,
        ];
        let params = PivotTrainingParameters {
            num_centers: 2,
            num_pq_chunks,
            max_k_means_reps: 5,
            make_zero_mean,
        };

        let outcome = generate_pq_pivots(
            &train,
            5,
            8,
            &params,
            &storage,
            &mut StdRng::seed_from_u64(42),
        )
        .unwrap();
        assert_eq!(outcome, PivotTraining::Trained);

        let (pivots, centroid, chunk_offsets, _) = storage
            .load_pivot_data(num_pq_chunks, 2, 8, false)
            .unwrap();
        assert_eq!(pivots.len(), 2 * 8);
        assert_eq!(chunk_offsets.len(), num_pq_chunks + 1);
        if make_zero_mean {
            assert!((centroid[0] - (1.0 + 2.0 + 2.1 + 2.2 + 100.0) / 5.0).abs() < 1e-5);
        } else {
            assert!(centroid.iter().all(|&c| c == 0.0));
        }
    }

    #[test]
    fn existing_matching_pivots_skip_training() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir, "skip");
        let train: Vec<f32> = (0..20 * 8).map(|i| (i % 7) as f32).collect();
        let params = PivotTrainingParameters {
            num_centers: 4,
            num_pq_chunks: 2,
            max_k_means_reps: 5,
            make_zero_mean: true,
        };
        let mut rng = StdRng::seed_from_u64(17);

        assert_eq!(
            generate_pq_pivots(&train, 20, 8, &params, &storage, &mut rng).unwrap(),
            PivotTraining::Trained
        );
        assert_eq!(
            generate_pq_pivots(&train, 20, 8, &params, &storage, &mut rng).unwrap(),
            PivotTraining::Skipped
        );
    }

    #[test]
    fn trained_container_reloads_bit_for_bit() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir, "roundtrip");
        let num_train = 64;
        let dim = 6;
        let train: Vec<f32> = (0..num_train * dim)
            .map(|i| ((i * 37) % 100) as f32 / 10.0)
            .collect();
        let params = PivotTrainingParameters {
            num_centers: 8,
            num_pq_chunks: 3,
            max_k_means_reps: 6,
            make_zero_mean: true,
        };

        generate_pq_pivots(
            &train,
            num_train,
            dim,
            &params,
            &storage,
            &mut StdRng::seed_from_u64(5),
        )
        .unwrap();

        let first = storage.load_pivot_data(3, 8, dim, false).unwrap();
        let second = storage.load_pivot_data(3, 8, dim, false).unwrap();
        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
        assert_eq!(first.2, second.2);

        // The persisted mean matches the arithmetic mean of the data.
        for (col, &mean) in first.1.iter().enumerate() {
            let expected: f32 = (0..num_train)
                .map(|row| train[row * dim + col])
                .sum::<f32>()
                / num_train as f32;
            assert!((mean - expected).abs() < 1e-4);
        }
    }

    // OPQ on rotated clusters: training longer must not end up worse than
    // a single alternation round.
    #[test]
    fn opq_error_does_not_regress_over_rounds() {
        let dim = 4;
        let num_train = 64;

        // A cluster pattern that plain axis-aligned chunks quantize poorly
        // once rotated: four corners spread across all dimensions.
        let corners: [[f32; 4]; 4] = [
            [0.0, 0.0, 0.0, 0.0],
            [1.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 1.0],
            [1.0, 1.0, 1.0, 1.0],
        ];
        let mut rng = StdRng::seed_from_u64(1234);
        let rotation = halite_linalg::random_distance_preserving_matrix(dim, &mut rng);

        let mut train = vec![0.0f32; num_train * dim];
        for (row, out) in train.chunks_mut(dim).enumerate() {
            let corner = &corners[row % 4];
            let jitter = (row / 4) as f32 * 1e-3;
            let point: Vec<f32> = corner.iter().map(|&x| x + jitter).collect();
            sgemm(
                Transpose::None,
                Transpose::None,
                1,
                dim,
                dim,
                1.0,
                &point,
                &rotation,
                None,
                out,
            );
        }

        let params = PivotTrainingParameters {
            num_centers: 4,
            num_pq_chunks: 2,
            max_k_means_reps: 8,
            make_zero_mean: false,
        };

        let dir = TempDir::new().unwrap();
        let reconstruction_error = |rounds: usize, stem: &str| -> f32 {
            let storage = storage_in(&dir, stem);
            generate_opq_pivots_impl(
                &train,
                num_train,
                dim,
                &params,
                &storage,
                &mut StdRng::seed_from_u64(99),
                rounds,
            )
            .unwrap();

            let (pivots, centroid, chunk_offsets, rotmat) =
                storage.load_pivot_data(2, 4, dim, true).unwrap();
            let mut padded = vec![0.0f32; NUM_PQ_CENTROIDS * dim];
            padded[..pivots.len()].copy_from_slice(&pivots);
            let table =
                FixedChunkPQTable::from_parts(dim, padded, centroid, chunk_offsets, rotmat)
                    .unwrap();

            let mut total = 0.0;
            for point in train.chunks(dim) {
                let mut rotated = point.to_vec();
                table.preprocess_query(&mut rotated);
                let mut code = [0u8; 2];
                encode_vector_into(&table, point, &mut code).unwrap();
                total += table.l2_distance(&rotated, &code);
            }
            total
        };

        let after_one = reconstruction_error(1, "opq1");
        let after_many = reconstruction_error(MAX_OPQ_ITERS, "opq20");
        assert!(
            after_many <= after_one + 1e-3,
            "OPQ regressed: {} after {} rounds vs {} after one",
            after_many,
            MAX_OPQ_ITERS,
            after_one
        );
    }
}

/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Streaming compression of a base-vector file into PQ codes.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
};

use bytemuck::Zeroable;
use byteorder::{LittleEndian, ReadBytesExt};
use halite::{utils::convert_types, AnnError, AnnResult};
use halite_linalg::{sgemm, Transpose};
use rayon::prelude::*;
use tracing::info;

use crate::{
    math::{compute_closest_centers, squared_l2},
    storage::PQStorage,
    table::FixedChunkPQTable,
};

/// Rows processed per streaming block. Bounds encoder memory at roughly
/// `BLOCK_SIZE * dim` floats regardless of base file size.
pub const BLOCK_SIZE: usize = 5_000_000;

/// Stream the base-vector file behind `pq_storage`'s data path and write
/// the compressed code file.
///
/// The base file carries a `<u32 N, u32 D>` header and `N * D` elements of
/// `T` (one of `i8`, `u8`, `f32`). Blocks of at most [`BLOCK_SIZE`] rows
/// are widened to `f32`, shifted by `-μ`, rotated when `use_opq` is set,
/// and assigned to their per-chunk closest centers.
///
/// The output file carries a `<u32 N, u32 M>` header; codes are one byte
/// each when `num_centers <= 256` and four bytes otherwise, row-major by
/// point.
pub fn generate_pq_data_from_pivots<T: bytemuck::Pod + Into<f32> + Sync>(
    data_file: &std::path::Path,
    num_centers: usize,
    num_pq_chunks: usize,
    pq_storage: &PQStorage,
    use_opq: bool,
) -> AnnResult<()> {
    let mut base_reader = BufReader::new(File::open(data_file).map_err(|err| {
        AnnError::io_open_failed(std::io::Error::new(
            err.kind(),
            format!("cannot open base file {}: {}", data_file.display(), err),
        ))
    })?);
    let num_points = base_reader.read_u32::<LittleEndian>()? as usize;
    let dim = base_reader.read_u32::<LittleEndian>()? as usize;

    if !pq_storage.pivot_data_exists() {
        return Err(AnnError::missing_pivot_file(format_args!(
            "PQ k-means pivot file {} not found",
            pq_storage.pivots_path().display()
        )));
    }
    let (full_pivot_data, centroid, chunk_offsets, rotmat_tr) =
        pq_storage.load_pivot_data(num_pq_chunks, num_centers, dim, use_opq)?;

    let mut writer = BufWriter::new(pq_storage.create_compressed_writer()?);
    writer.write_all(&(num_points as u32).to_le_bytes())?;
    writer.write_all(&(num_pq_chunks as u32).to_le_bytes())?;

    let block_size = num_points.min(BLOCK_SIZE);
    let num_blocks = num_points.div_ceil(block_size.max(1));

    let mut block_data_t = vec![T::zeroed(); block_size * dim];
    let mut block_data_float = vec![0.0f32; block_size * dim];
    let mut block_data_rotated = vec![0.0f32; if use_opq { block_size * dim } else { 0 }];
    let mut block_compressed = vec![0u32; block_size * num_pq_chunks];

    for block in 0..num_blocks {
        let start_id = block * block_size;
        let end_id = ((block + 1) * block_size).min(num_points);
        let cur_blk_size = end_id - start_id;

        info!("Processing points [{}, {})", start_id, end_id);

        let block_data_t = &mut block_data_t[..cur_blk_size * dim];
        base_reader.read_exact(bytemuck::must_cast_slice_mut::<T, u8>(block_data_t))?;

        // Widen to f32 and shift by the training mean in one pass. The
        // centroid is all-zero unless the pivots were trained with zero
        // centering.
        let block_data = &mut block_data_float[..cur_blk_size * dim];
        block_data
            .par_chunks_mut(dim)
            .zip(block_data_t.par_chunks(dim))
            .for_each(|(dst, src)| {
                for ((d, &s), &c) in dst.iter_mut().zip(src.iter()).zip(centroid.iter()) {
                    *d = s.into() - c;
                }
            });

        let block_data: &[f32] = if let Some(rotmat_tr) = rotmat_tr.as_deref() {
            let rotated = &mut block_data_rotated[..cur_blk_size * dim];
            sgemm(
                Transpose::None,
                Transpose::None,
                cur_blk_size,
                dim,
                dim,
                1.0,
                block_data,
                rotmat_tr,
                None,
                rotated,
            );
            rotated
        } else {
            block_data
        };

        let compressed = &mut block_compressed[..cur_blk_size * num_pq_chunks];
        for chunk in 0..num_pq_chunks {
            let chunk_start = chunk_offsets[chunk];
            let chunk_size = chunk_offsets[chunk + 1] - chunk_start;
            if chunk_size == 0 {
                continue;
            }

            let mut cur_data = vec![0.0f32; cur_blk_size * chunk_size];
            cur_data
                .par_chunks_mut(chunk_size)
                .enumerate()
                .for_each(|(row, out)| {
                    let start = row * dim + chunk_start;
                    out.copy_from_slice(&block_data[start..start + chunk_size]);
                });

            let mut cur_pivot_data = vec![0.0f32; num_centers * chunk_size];
            for center in 0..num_centers {
                let src = center * dim + chunk_start;
                cur_pivot_data[center * chunk_size..(center + 1) * chunk_size]
                    .copy_from_slice(&full_pivot_data[src..src + chunk_size]);
            }

            let mut closest_center = vec![0u32; cur_blk_size];
            compute_closest_centers(
                &cur_data,
                cur_blk_size,
                chunk_size,
                &cur_pivot_data,
                num_centers,
                &mut closest_center,
                None,
                None,
            )?;

            for (row, &center) in closest_center.iter().enumerate() {
                compressed[row * num_pq_chunks + chunk] = center;
            }
        }

        if num_centers > 256 {
            writer.write_all(bytemuck::must_cast_slice(compressed))?;
        } else {
            let narrowed = convert_types(&*compressed, |x| x as u8);
            writer.write_all(&narrowed)?;
        }
    }

    writer.flush()?;
    info!(
        "Wrote {} compressed points to {}",
        num_points,
        pq_storage.compressed_path().display()
    );
    Ok(())
}

/// Encode one full-precision vector against a loaded pivot table.
///
/// The vector is shifted by `-μ` (and rotated for OPQ tables) and each
/// chunk is assigned its closest of the table's 256 centers by brute-force
/// scan. `pq_out` must hold exactly one byte per chunk.
pub fn encode_vector_into(
    table: &FixedChunkPQTable,
    vector: &[f32],
    pq_out: &mut [u8],
) -> AnnResult<()> {
    let dim = table.get_dim();
    let num_chunks = table.get_num_chunks();
    if vector.len() != dim {
        return Err(AnnError::invalid_config(format_args!(
            "vector has {} dimensions, the table expects {}",
            vector.len(),
            dim
        )));
    }
    if pq_out.len() != num_chunks {
        return Err(AnnError::invalid_config(format_args!(
            "output buffer holds {} codes, the table produces {}",
            pq_out.len(),
            num_chunks
        )));
    }

    let mut shifted = vector.to_vec();
    table.preprocess_query(&mut shifted);

    let tables = table.get_tables();
    let offsets = table.get_chunk_offsets();
    for (chunk, code) in pq_out.iter_mut().enumerate() {
        let start = offsets[chunk];
        let stop = offsets[chunk + 1];
        let query_chunk = &shifted[start..stop];

        let mut best = 0usize;
        let mut best_dist = f32::MAX;
        for center in 0..crate::table::NUM_PQ_CENTROIDS {
            let pivot_chunk = &tables[center * dim + start..center * dim + stop];
            let dist = squared_l2(query_chunk, pivot_chunk);
            if dist < best_dist {
                best_dist = dist;
                best = center;
            }
        }
        *code = best as u8;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use halite::{utils::load_bin, AnnErrorKind};
    use rand::{rngs::StdRng, SeedableRng};
    use tempfile::TempDir;

    use super::*;
    use crate::train::{generate_pq_pivots, PivotTrainingParameters};

    fn write_base_file<T: bytemuck::Pod>(path: &std::path::Path, data: &[T], npts: usize, dim: usize) {
        let mut file = File::create(path).unwrap();
        file.write_all(&(npts as u32).to_le_bytes()).unwrap();
        file.write_all(&(dim as u32).to_le_bytes()).unwrap();
        file.write_all(bytemuck::must_cast_slice(data)).unwrap();
    }

    // Five 8-dimensional points in three tight groups; the compressed
    // codes must agree within a group and differ across far groups.
    #[test]
    fn codes_cluster_like_the_data() {
        let dir = TempDir::new().unwrap();
        let data_path = dir.path().join("base.bin");
        let train_data: Vec<f32> = vec![
            1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, //
            2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, //
            2.1, 2.1, 2.1, 2.1, 2.1, 2.1, 2.1, 2.1, //
            2.2, 2.2, 2.2, 2.2, 2.2, 2.2, 2.2, 2.2, //
            100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 100.0,
        ];
        write_base_file(&data_path, &train_data, 5, 8);

        let storage = PQStorage::new(
            dir.path().join("pivots.bin"),
            dir.path().join("compressed.bin"),
        );
        let params = PivotTrainingParameters {
            num_centers: 2,
            num_pq_chunks: 2,
            max_k_means_reps: 5,
            make_zero_mean: true,
        };
        generate_pq_pivots(
            &train_data,
            5,
            8,
            &params,
            &storage,
            &mut StdRng::seed_from_u64(42),
        )
        .unwrap();

        generate_pq_data_from_pivots::<f32>(&data_path, 2, 2, &storage, false).unwrap();

        let mut reader = File::open(storage.compressed_path()).unwrap();
        let (codes, nr, nc) = load_bin::<u8>(&mut reader, 0).unwrap();
        assert_eq!((nr, nc), (5, 2));
        // Points 1 and 2 (2.0 vs 2.1) share a code; the outlier at 100 does
        // not match point 0.
        assert_eq!(codes[2], codes[4]);
        assert_eq!(codes[3], codes[5]);
        assert_ne!(codes[0..2], codes[8..10]);
    }

    #[test]
    fn integer_element_types_round_trip() {
        let dir = TempDir::new().unwrap();
        let data_path = dir.path().join("base_u8.bin");
        let base: Vec<u8> = vec![
            0, 0, 0, 0, //
            0, 0, 200, 200, //
            200, 200, 0, 0, //
            200, 200, 200, 200,
        ];
        write_base_file(&data_path, &base, 4, 4);

        let train_data: Vec<f32> = base.iter().map(|&x| x as f32).collect();
        let storage = PQStorage::new(
            dir.path().join("pivots.bin"),
            dir.path().join("compressed.bin"),
        );
        let params = PivotTrainingParameters {
            num_centers: 2,
            num_pq_chunks: 2,
            max_k_means_reps: 8,
            make_zero_mean: false,
        };
        generate_pq_pivots(
            &train_data,
            4,
            4,
            &params,
            &storage,
            &mut StdRng::seed_from_u64(7),
        )
        .unwrap();

        generate_pq_data_from_pivots::<u8>(&data_path, 2, 2, &storage, false).unwrap();

        let mut reader = File::open(storage.compressed_path()).unwrap();
        let (codes, nr, nc) = load_bin::<u8>(&mut reader, 0).unwrap();
        assert_eq!((nr, nc), (4, 2));
        // The four points hit all four code combinations.
        let mut rows: Vec<&[u8]> = codes.chunks(2).collect();
        rows.sort();
        rows.dedup();
        assert_eq!(rows.len(), 4);
    }

    #[test]
    fn missing_pivots_fail_up_front() {
        let dir = TempDir::new().unwrap();
        let data_path = dir.path().join("base.bin");
        write_base_file(&data_path, &[0.0f32; 8], 1, 8);

        let storage = PQStorage::new(
            dir.path().join("nope.bin"),
            dir.path().join("compressed.bin"),
        );
        let err =
            generate_pq_data_from_pivots::<f32>(&data_path, 2, 2, &storage, false).unwrap_err();
        assert_eq!(err.kind(), AnnErrorKind::MissingPivotFile);
    }
}

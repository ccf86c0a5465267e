/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! The query-time PQ pivot table.

use std::{fs::File, path::Path};

use halite::{
    utils::{convert_types, file_exists, load_bin, IntoUsize},
    AnnError, AnnResult,
};
use halite_linalg::{sgemm, Transpose};
use tracing::info;

use crate::storage::rotation_matrix_path;

/// Number of PQ centroids per chunk. The one-byte code representation and
/// the distance-table layout are hardcoded against this value.
pub const NUM_PQ_CENTROIDS: usize = 256;

/// A loaded PQ pivot table.
///
/// Holds the `K x D` pivot matrix, its transposed `D x K` view (the hot
/// path walks one contiguous K-vector per axis), the chunk offsets, the
/// global translation `μ` and, for OPQ tables, the rotation matrix stored
/// pre-transposed so query rotation is a plain row-vector product.
///
/// The table is immutable after load and may be shared freely across
/// worker threads.
#[derive(Debug, Clone)]
pub struct FixedChunkPQTable {
    ndims: usize,
    /// Pivots, row-major `NUM_PQ_CENTROIDS x ndims`.
    tables: Vec<f32>,
    /// Transposed pivots, row-major `ndims x NUM_PQ_CENTROIDS`.
    tables_tr: Vec<f32>,
    /// Chunk boundaries, `n_chunks + 1` strictly increasing entries from
    /// `0` to `ndims`.
    chunk_offsets: Vec<usize>,
    /// Global translation `μ`; all-zero unless the pivots were trained with
    /// zero centering.
    centroid: Vec<f32>,
    /// OPQ rotation, row-major `ndims x ndims`, already transposed.
    rotmat_tr: Option<Vec<f32>>,
}

impl FixedChunkPQTable {
    /// Assemble a table from its in-memory parts, validating every shape
    /// invariant. The transposed pivot view is materialised here.
    pub fn from_parts(
        ndims: usize,
        tables: Vec<f32>,
        centroid: Vec<f32>,
        chunk_offsets: Vec<usize>,
        rotmat_tr: Option<Vec<f32>>,
    ) -> AnnResult<Self> {
        if ndims == 0 || tables.len() != NUM_PQ_CENTROIDS * ndims {
            return Err(AnnError::malformed_pivot_file(format_args!(
                "pivot table must hold {} x {} values, got {}",
                NUM_PQ_CENTROIDS,
                ndims,
                tables.len()
            )));
        }
        if centroid.len() != ndims {
            return Err(AnnError::malformed_pivot_file(format_args!(
                "centroid has {} entries but the table has {} dimensions",
                centroid.len(),
                ndims
            )));
        }
        if chunk_offsets.len() < 2
            || chunk_offsets[0] != 0
            || *chunk_offsets.last().unwrap() != ndims
            || chunk_offsets.windows(2).any(|pair| pair[1] <= pair[0])
        {
            return Err(AnnError::malformed_pivot_file(format_args!(
                "chunk offsets {:?} are not a strictly increasing cover of [0, {}]",
                chunk_offsets, ndims
            )));
        }
        if let Some(rotmat) = rotmat_tr.as_ref() {
            if rotmat.len() != ndims * ndims {
                return Err(AnnError::malformed_pivot_file(format_args!(
                    "rotation matrix must hold {} x {} values, got {}",
                    ndims,
                    ndims,
                    rotmat.len()
                )));
            }
        }

        let mut tables_tr = vec![0.0f32; NUM_PQ_CENTROIDS * ndims];
        for i in 0..NUM_PQ_CENTROIDS {
            for j in 0..ndims {
                tables_tr[j * NUM_PQ_CENTROIDS + i] = tables[i * ndims + j];
            }
        }

        Ok(Self {
            ndims,
            tables,
            tables_tr,
            chunk_offsets,
            centroid,
            rotmat_tr,
        })
    }

    /// Load a pivot container (see the `storage` module for the layout) and
    /// the sibling rotation matrix file when one exists.
    ///
    /// `num_chunks` is the expected chunk count; pass `0` to infer it from
    /// the file. Every shape mismatch is a `MalformedPivotFile` error.
    pub fn load_pivot_bin(pq_table_file: &Path, num_chunks: usize) -> AnnResult<Self> {
        let mut reader = File::open(pq_table_file).map_err(|err| {
            AnnError::missing_pivot_file(format_args!(
                "cannot open pivot file {}: {}",
                pq_table_file.display(),
                err
            ))
        })?;

        let (file_offsets, nr, nc) = load_bin::<u64>(&mut reader, 0)?;
        let use_old_filetype = match (nr, nc) {
            (4, 1) => false,
            (5, 1) => true,
            _ => {
                return Err(AnnError::malformed_pivot_file(format_args!(
                    "offset table of {} is {} x {}, expected 4 or 5 entries in one column",
                    pq_table_file.display(),
                    nr,
                    nc
                )));
            }
        };
        let file_offsets = convert_types(&file_offsets, |x: u64| x.into_usize());

        if use_old_filetype {
            info!(
                "Offsets: {} {} {} {} {}",
                file_offsets[0], file_offsets[1], file_offsets[2], file_offsets[3], file_offsets[4]
            );
        } else {
            info!(
                "Offsets: {} {} {} {}",
                file_offsets[0], file_offsets[1], file_offsets[2], file_offsets[3]
            );
        }

        let (tables, nr, nc) = load_bin::<f32>(&mut reader, file_offsets[0])?;
        if nr != NUM_PQ_CENTROIDS {
            return Err(AnnError::malformed_pivot_file(format_args!(
                "{} holds {} pivot rows, expected {} centers",
                pq_table_file.display(),
                nr,
                NUM_PQ_CENTROIDS
            )));
        }
        let ndims = nc;

        let (centroid, nr, nc) = load_bin::<f32>(&mut reader, file_offsets[1])?;
        if nr != ndims || nc != 1 {
            return Err(AnnError::malformed_pivot_file(format_args!(
                "centroid block of {} is {} x {}, expected {} x 1",
                pq_table_file.display(),
                nr,
                nc,
                ndims
            )));
        }

        // Legacy 5-entry containers carry an extra block between the
        // centroid and the chunk offsets; honouring the explicit offsets
        // skips it.
        let chunk_offsets_index = if use_old_filetype { 3 } else { 2 };
        let (raw_chunk_offsets, nr, nc) =
            load_bin::<u32>(&mut reader, file_offsets[chunk_offsets_index])?;
        if nc != 1 || (num_chunks != 0 && nr != num_chunks + 1) {
            return Err(AnnError::malformed_pivot_file(format_args!(
                "chunk offset block of {} is {} x {}, expected {} x 1 (or any length when inferring)",
                pq_table_file.display(),
                nr,
                nc,
                num_chunks + 1
            )));
        }
        let chunk_offsets = convert_types(&raw_chunk_offsets, |x: u32| x.into_usize());

        let rotmat_file = rotation_matrix_path(pq_table_file);
        let rotmat_tr = if file_exists(&rotmat_file) {
            let mut rotmat_reader = File::open(&rotmat_file).map_err(AnnError::io_open_failed)?;
            let (rotmat, nr, nc) = load_bin::<f32>(&mut rotmat_reader, 0)?;
            if nr != ndims || nc != ndims {
                return Err(AnnError::malformed_pivot_file(format_args!(
                    "rotation matrix {} is {} x {}, expected {} x {}",
                    rotmat_file.display(),
                    nr,
                    nc,
                    ndims,
                    ndims
                )));
            }
            Some(rotmat)
        } else {
            None
        };

        let table = Self::from_parts(ndims, tables, centroid, chunk_offsets, rotmat_tr)?;
        info!(
            "Loaded PQ pivots: #ctrs: {}, #dims: {}, #chunks: {}, rotation: {}",
            NUM_PQ_CENTROIDS,
            table.ndims,
            table.get_num_chunks(),
            table.rotmat_tr.is_some()
        );
        Ok(table)
    }

    /// Number of PQ chunks `M`.
    pub fn get_num_chunks(&self) -> usize {
        self.chunk_offsets.len() - 1
    }

    /// Full vector dimension `D`.
    pub fn get_dim(&self) -> usize {
        self.ndims
    }

    /// The chunk boundary array `O[0..=M]`.
    pub fn get_chunk_offsets(&self) -> &[usize] {
        &self.chunk_offsets
    }

    /// The global translation `μ`.
    pub fn get_centroid(&self) -> &[f32] {
        &self.centroid
    }

    /// Pivots, row-major `K x D`.
    pub fn get_tables(&self) -> &[f32] {
        &self.tables
    }

    /// Transposed pivots, row-major `D x K`.
    pub fn get_tables_tr(&self) -> &[f32] {
        &self.tables_tr
    }

    /// Whether an OPQ rotation is attached.
    pub fn has_rotation(&self) -> bool {
        self.rotmat_tr.is_some()
    }

    /// Shift (and for OPQ tables rotate) a query into the table's frame:
    /// `q ← (q − μ) · R`. Must be called exactly once per query before any
    /// distance-table population. Stateless with respect to other calls.
    pub fn preprocess_query(&self, query_vec: &mut [f32]) {
        for (q, &c) in query_vec.iter_mut().zip(self.centroid.iter()) {
            *q -= c;
        }

        if let Some(rotmat_tr) = &self.rotmat_tr {
            let shifted = query_vec[..self.ndims].to_vec();
            sgemm(
                Transpose::None,
                Transpose::None,
                1,
                self.ndims,
                self.ndims,
                1.0,
                &shifted,
                rotmat_tr,
                None,
                &mut query_vec[..self.ndims],
            );
        }
    }

    /// Fill the asymmetric distance table for a preprocessed query:
    /// `dist_vec[chunk * K + c]` becomes the squared L2 distance between the
    /// query restricted to `chunk` and center `c` of that chunk.
    ///
    /// `dist_vec` must hold at least `K * M` entries.
    pub fn populate_chunk_distances(&self, query_vec: &[f32], dist_vec: &mut [f32]) {
        let n_chunks = self.get_num_chunks();
        assert!(dist_vec.len() >= NUM_PQ_CENTROIDS * n_chunks);
        dist_vec[..NUM_PQ_CENTROIDS * n_chunks].fill(0.0);

        for chunk in 0..n_chunks {
            let chunk_dists =
                &mut dist_vec[NUM_PQ_CENTROIDS * chunk..NUM_PQ_CENTROIDS * (chunk + 1)];
            for j in self.chunk_offsets[chunk]..self.chunk_offsets[chunk + 1] {
                let centers_dim_vec =
                    &self.tables_tr[NUM_PQ_CENTROIDS * j..NUM_PQ_CENTROIDS * (j + 1)];
                let q = query_vec[j];
                for (dist, &center) in chunk_dists.iter_mut().zip(centers_dim_vec.iter()) {
                    let diff = (center - q) as f64;
                    *dist += (diff * diff) as f32;
                }
            }
        }
    }

    /// Fill the distance table with negated inner products, converting
    /// max-inner-product search into min-distance search downstream.
    ///
    /// Valid only for tables trained in MIPS mode (`μ = 0`); translation
    /// does not preserve inner products, and the trainer enforces the zero
    /// centroid.
    pub fn populate_chunk_inner_products(&self, query_vec: &[f32], dist_vec: &mut [f32]) {
        let n_chunks = self.get_num_chunks();
        assert!(dist_vec.len() >= NUM_PQ_CENTROIDS * n_chunks);
        dist_vec[..NUM_PQ_CENTROIDS * n_chunks].fill(0.0);

        for chunk in 0..n_chunks {
            let chunk_dists =
                &mut dist_vec[NUM_PQ_CENTROIDS * chunk..NUM_PQ_CENTROIDS * (chunk + 1)];
            for j in self.chunk_offsets[chunk]..self.chunk_offsets[chunk + 1] {
                let centers_dim_vec =
                    &self.tables_tr[NUM_PQ_CENTROIDS * j..NUM_PQ_CENTROIDS * (j + 1)];
                let q = query_vec[j];
                for (dist, &center) in chunk_dists.iter_mut().zip(centers_dim_vec.iter()) {
                    let prod = (center * q) as f64;
                    *dist -= prod as f32;
                }
            }
        }
    }

    /// Asymmetric squared L2 distance between a preprocessed query and one
    /// compressed vector.
    pub fn l2_distance(&self, query_vec: &[f32], base_vec: &[u8]) -> f32 {
        debug_assert_eq!(base_vec.len(), self.get_num_chunks());
        let mut res = 0.0f32;
        for (chunk, &code) in base_vec.iter().enumerate() {
            for j in self.chunk_offsets[chunk]..self.chunk_offsets[chunk + 1] {
                let center = self.tables_tr[NUM_PQ_CENTROIDS * j + code.into_usize()];
                let diff = center - query_vec[j];
                res += diff * diff;
            }
        }
        res
    }

    /// Asymmetric negated inner product between a query and one compressed
    /// vector. Assumes `μ = 0` (see [`Self::populate_chunk_inner_products`]).
    pub fn inner_product(&self, query_vec: &[f32], base_vec: &[u8]) -> f32 {
        debug_assert_eq!(base_vec.len(), self.get_num_chunks());
        let mut res = 0.0f32;
        for (chunk, &code) in base_vec.iter().enumerate() {
            for j in self.chunk_offsets[chunk]..self.chunk_offsets[chunk + 1] {
                let center = self.tables_tr[NUM_PQ_CENTROIDS * j + code.into_usize()];
                res += center * query_vec[j];
            }
        }
        // Negated so that smaller still means more similar.
        -res
    }

    /// Reconstruct the vector a code stands for: per axis, the selected
    /// center plus `μ`. Not applicable to OPQ tables, whose codes live in
    /// the rotated frame.
    pub fn inflate_vector_into(&self, base_vec: &[u8], out_vec: &mut [f32]) {
        debug_assert!(
            self.rotmat_tr.is_none(),
            "inflation is undefined for rotated (OPQ) tables"
        );
        debug_assert_eq!(base_vec.len(), self.get_num_chunks());
        debug_assert_eq!(out_vec.len(), self.ndims);

        for (chunk, &code) in base_vec.iter().enumerate() {
            for j in self.chunk_offsets[chunk]..self.chunk_offsets[chunk + 1] {
                let center = self.tables_tr[NUM_PQ_CENTROIDS * j + code.into_usize()];
                out_vec[j] = center + self.centroid[j];
            }
        }
    }

    /// Allocating variant of [`Self::inflate_vector_into`].
    pub fn inflate_vector(&self, base_vec: &[u8]) -> Vec<f32> {
        let mut out_vec = vec![0.0; self.ndims];
        self.inflate_vector_into(base_vec, &mut out_vec);
        out_vec
    }

    pub(crate) fn rotmat_tr(&self) -> Option<&[f32]> {
        self.rotmat_tr.as_deref()
    }
}

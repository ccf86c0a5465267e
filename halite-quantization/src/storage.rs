/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! The on-disk pivot container and canonical PQ file naming.
//!
//! A pivot container is a single file:
//!
//! ```text
//! byte 0            : u64[4] offset table (one blob: <4, 1> header + payload)
//! byte off[0] = 4096: pivots   <K, D>  f32 row-major
//! byte off[1]       : centroid <D, 1>  f32
//! byte off[2]       : chunk offsets <M+1, 1> u32
//! ```
//!
//! `off[3]` is the end of the last blob. Legacy containers carry a fifth
//! offset and an extra intermediate blob; readers skip it by honouring the
//! explicit offsets (see `FixedChunkPQTable::load_pivot_bin`). The writer
//! always produces the new 4-entry layout.
//!
//! The rotation matrix of an OPQ table lives in a sibling file named
//! `<pivots>_rotation_matrix.bin`, a single `<D, D>` f32 blob.

use std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom},
    path::{Path, PathBuf},
};

use halite::{
    utils::{convert_types, file_exists, load_bin, save_bin, IntoUsize},
    AnnError, AnnResult,
};
use tracing::info;

/// Bytes reserved at the head of a pivot container for the offset table.
/// Far larger than the table needs; the slack keeps the layout stable if
/// more regions are ever added.
pub const METADATA_SIZE: usize = 4096;

/// Derive the sibling rotation matrix path for a pivot file.
pub fn rotation_matrix_path(pq_pivots_path: &Path) -> PathBuf {
    let mut name = pq_pivots_path.as_os_str().to_os_string();
    name.push("_rotation_matrix.bin");
    PathBuf::from(name)
}

/// Canonical file names for the PQ artifacts of an index, derived from a
/// common prefix.
#[derive(Debug, Clone)]
pub struct PQPathNames {
    pub pivots: PathBuf,
    pub compressed_data: PathBuf,
}

impl PQPathNames {
    /// Names used while building an index.
    pub fn new(prefix: &str) -> Self {
        PQPathNames {
            pivots: PathBuf::from(format!("{}_build_pq_pivots.bin", prefix)),
            compressed_data: PathBuf::from(format!("{}_build_pq_compressed.bin", prefix)),
        }
    }

    /// Names used by a finished disk index.
    pub fn for_disk_index(prefix: &str) -> Self {
        PQPathNames {
            pivots: PathBuf::from(format!("{}_pq_pivots.bin", prefix)),
            compressed_data: PathBuf::from(format!("{}_pq_compressed.bin", prefix)),
        }
    }
}

/// Paths of the PQ artifacts plus the read/write operations against them.
#[derive(Debug, Clone)]
pub struct PQStorage {
    pq_pivots_path: PathBuf,
    pq_compressed_path: PathBuf,
}

impl PQStorage {
    pub fn new(pq_pivots_path: impl Into<PathBuf>, pq_compressed_path: impl Into<PathBuf>) -> Self {
        Self {
            pq_pivots_path: pq_pivots_path.into(),
            pq_compressed_path: pq_compressed_path.into(),
        }
    }

    pub fn pivots_path(&self) -> &Path {
        &self.pq_pivots_path
    }

    pub fn compressed_path(&self) -> &Path {
        &self.pq_compressed_path
    }

    pub fn rotation_matrix_path(&self) -> PathBuf {
        rotation_matrix_path(&self.pq_pivots_path)
    }

    /// Whether a pivot container already exists at the pivot path.
    pub fn pivot_data_exists(&self) -> bool {
        file_exists(&self.pq_pivots_path)
    }

    /// Read `(num_centers, dim)` from an existing pivot container without
    /// loading the payload. Used for the train-skip check.
    pub fn read_pivot_metadata(&self) -> AnnResult<(usize, usize)> {
        let mut reader = File::open(&self.pq_pivots_path)?;
        reader.seek(SeekFrom::Start(METADATA_SIZE as u64))?;
        let metadata = halite::utils::read_metadata(&mut reader)?;
        Ok((metadata.npoints, metadata.ndims))
    }

    /// Write a complete pivot container: the three payload blobs at
    /// cumulative offsets starting at [`METADATA_SIZE`], then the 4-entry
    /// offset table at byte 0.
    pub fn write_pivot_data(
        &self,
        full_pivot_data: &[f32],
        centroid: &[f32],
        chunk_offsets: &[usize],
        num_centers: usize,
        dim: usize,
    ) -> AnnResult<()> {
        let mut writer = File::create(&self.pq_pivots_path)?;

        let chunk_offsets_u32 = convert_types(chunk_offsets, |x| x as u32);

        let mut cumul_bytes = [0usize; 4];
        cumul_bytes[0] = METADATA_SIZE;
        cumul_bytes[1] = cumul_bytes[0]
            + save_bin(&mut writer, full_pivot_data, num_centers, dim, cumul_bytes[0])?;
        cumul_bytes[2] =
            cumul_bytes[1] + save_bin(&mut writer, centroid, dim, 1, cumul_bytes[1])?;
        cumul_bytes[3] = cumul_bytes[2]
            + save_bin(
                &mut writer,
                &chunk_offsets_u32,
                chunk_offsets_u32.len(),
                1,
                cumul_bytes[2],
            )?;

        let cumul_bytes_u64 = convert_types(&cumul_bytes, |x| x as u64);
        save_bin(&mut writer, &cumul_bytes_u64, cumul_bytes_u64.len(), 1, 0)?;

        info!(
            "Saved PQ pivot data to {} of size {}B",
            self.pq_pivots_path.display(),
            cumul_bytes[3]
        );
        Ok(())
    }

    /// Write the OPQ rotation matrix to the sibling rotation file.
    pub fn write_rotation_matrix_data(&self, rotmat_tr: &[f32], dim: usize) -> AnnResult<()> {
        let path = self.rotation_matrix_path();
        let mut writer = File::create(&path)?;
        save_bin(&mut writer, rotmat_tr, dim, dim, 0)?;
        info!("Saved OPQ rotation matrix to {}", path.display());
        Ok(())
    }

    /// Load the pivot payloads for the encoder, validating every shape
    /// against the encoder's expectations. The encoder only accepts the new
    /// 4-entry container; re-train to migrate a legacy file.
    ///
    /// Returns `(pivots, centroid, chunk_offsets, rotation)`; the rotation
    /// is only read (and required) when `use_opq` is set.
    #[allow(clippy::type_complexity)]
    pub fn load_pivot_data(
        &self,
        num_pq_chunks: usize,
        num_centers: usize,
        dim: usize,
        use_opq: bool,
    ) -> AnnResult<(Vec<f32>, Vec<f32>, Vec<usize>, Option<Vec<f32>>)> {
        let mut reader = File::open(&self.pq_pivots_path).map_err(|err| {
            AnnError::missing_pivot_file(format_args!(
                "PQ k-means pivot file {} not found: {}",
                self.pq_pivots_path.display(),
                err
            ))
        })?;

        let (file_offsets, nr, nc) = load_bin::<u64>(&mut reader, 0)?;
        if nr != 4 || nc != 1 {
            return Err(AnnError::malformed_pivot_file(format_args!(
                "offset table of {} is {} x {}, expected 4 x 1",
                self.pq_pivots_path.display(),
                nr,
                nc
            )));
        }
        let file_offsets = convert_types(&file_offsets, |x: u64| x.into_usize());

        let (full_pivot_data, nr, nc) = load_bin::<f32>(&mut reader, file_offsets[0])?;
        if nr != num_centers || nc != dim {
            return Err(AnnError::malformed_pivot_file(format_args!(
                "pivot block of {} is {} x {}, expected {} centers in {} dimensions",
                self.pq_pivots_path.display(),
                nr,
                nc,
                num_centers,
                dim
            )));
        }

        let (centroid, nr, nc) = load_bin::<f32>(&mut reader, file_offsets[1])?;
        if nr != dim || nc != 1 {
            return Err(AnnError::malformed_pivot_file(format_args!(
                "centroid block of {} is {} x {}, expected {} x 1",
                self.pq_pivots_path.display(),
                nr,
                nc,
                dim
            )));
        }

        let (raw_chunk_offsets, nr, nc) = load_bin::<u32>(&mut reader, file_offsets[2])?;
        if nr != num_pq_chunks + 1 || nc != 1 {
            return Err(AnnError::malformed_pivot_file(format_args!(
                "chunk offset block of {} is {} x {}, expected {} x 1",
                self.pq_pivots_path.display(),
                nr,
                nc,
                num_pq_chunks + 1
            )));
        }
        let chunk_offsets = convert_types(&raw_chunk_offsets, |x: u32| x.into_usize());

        let rotmat_tr = if use_opq {
            let rotmat_path = self.rotation_matrix_path();
            let mut rotmat_reader = File::open(&rotmat_path).map_err(|err| {
                AnnError::missing_rotation_file(format_args!(
                    "rotation matrix {} not found: {}",
                    rotmat_path.display(),
                    err
                ))
            })?;
            let (rotmat, nr, nc) = load_bin::<f32>(&mut rotmat_reader, 0)?;
            if nr != dim || nc != dim {
                return Err(AnnError::malformed_pivot_file(format_args!(
                    "rotation matrix {} is {} x {}, expected {} x {}",
                    rotmat_path.display(),
                    nr,
                    nc,
                    dim,
                    dim
                )));
            }
            Some(rotmat)
        } else {
            None
        };

        info!("Loaded PQ pivot information");
        Ok((full_pivot_data, centroid, chunk_offsets, rotmat_tr))
    }

    /// Open the compressed code file for writing.
    pub fn create_compressed_writer(&self) -> AnnResult<File> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.pq_compressed_path)?;
        Ok(file)
    }
}

/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Binary matrix I/O.
//!
//! Every on-disk artifact in this workspace is a sequence of typed 2-D
//! blobs, each a little-endian `<u32 rows, u32 cols>` header followed by a
//! row-major payload, placed at a caller-specified byte offset within one
//! file. The pivot container (offset table, pivots, centroid, chunk
//! offsets), rotation matrix and compressed code file are all written
//! through [`save_bin`] and read back through [`load_bin`].

use std::{
    io::{Read, Seek, SeekFrom, Write},
    mem::size_of,
    path::Path,
};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::AnnResult;

/// The `<rows, cols>` header of a binary blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    /// Number of rows (points).
    pub npoints: usize,
    /// Number of columns (dimensions).
    pub ndims: usize,
}

/// Read the two-`u32` header at the reader's current position.
pub fn read_metadata(reader: &mut impl Read) -> std::io::Result<Metadata> {
    let npoints = reader.read_u32::<LittleEndian>()? as usize;
    let ndims = reader.read_u32::<LittleEndian>()? as usize;
    Ok(Metadata { npoints, ndims })
}

/// Load one typed blob at `file_offset`.
///
/// Returns the payload together with its row and column counts. The payload
/// is copied out of the byte buffer, so the element type only needs to be
/// `Pod`; no alignment requirement is imposed on the file contents.
pub fn load_bin<T: bytemuck::Pod>(
    reader: &mut (impl Read + Seek),
    file_offset: usize,
) -> AnnResult<(Vec<T>, usize, usize)> {
    reader.seek(SeekFrom::Start(file_offset as u64))?;
    let Metadata { npoints, ndims } = read_metadata(reader)?;

    let mut buf = vec![0u8; npoints * ndims * size_of::<T>()];
    reader.read_exact(&mut buf)?;

    let data = bytemuck::pod_collect_to_vec::<u8, T>(&buf);
    Ok((data, npoints, ndims))
}

/// Write one typed blob at `file_offset`: the `<rows, cols>` header followed
/// by `data` in row-major order.
///
/// Returns the number of bytes written (header included) so callers can
/// accumulate the offset table of a multi-blob container.
pub fn save_bin<T: bytemuck::Pod>(
    writer: &mut (impl Write + Seek),
    data: &[T],
    npoints: usize,
    ndims: usize,
    file_offset: usize,
) -> AnnResult<usize> {
    debug_assert_eq!(data.len(), npoints * ndims);

    writer.seek(SeekFrom::Start(file_offset as u64))?;
    writer.write_all(&(npoints as u32).to_le_bytes())?;
    writer.write_all(&(ndims as u32).to_le_bytes())?;
    writer.write_all(bytemuck::must_cast_slice(data))?;

    Ok(2 * size_of::<u32>() + data.len() * size_of::<T>())
}

/// Whether `path` names an existing file.
pub fn file_exists(path: &Path) -> bool {
    path.exists()
}

/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use halite::{AnnError, AnnResult};

/// Required alignment, in bytes, of every read's offset, length and buffer
/// address. Direct I/O bypasses the page cache, so transfers must match the
/// device sector.
pub const DISK_IO_ALIGNMENT: usize = 512;

/// One read request: file offset plus the destination buffer.
///
/// Construction validates the full alignment contract; a request that
/// exists is a request the kernel will accept. Buffers come from an
/// over-aligned allocation such as `halite::utils::AlignedBoxWithSlice`.
#[derive(Debug)]
pub struct AlignedRead<'a> {
    /// Where to read from; a multiple of [`DISK_IO_ALIGNMENT`].
    offset: u64,
    /// Where to read into; address and length both aligned.
    aligned_buf: &'a mut [u8],
}

impl<'a> AlignedRead<'a> {
    pub fn new(offset: u64, aligned_buf: &'a mut [u8]) -> AnnResult<Self> {
        Self::check_aligned(offset as usize, "offset")?;
        Self::check_aligned(aligned_buf.len(), "length")?;
        Self::check_aligned(aligned_buf.as_ptr() as usize, "buffer address")?;

        Ok(Self {
            offset,
            aligned_buf,
        })
    }

    fn check_aligned(value: usize, what: &str) -> AnnResult<()> {
        if value.is_multiple_of(DISK_IO_ALIGNMENT) {
            Ok(())
        } else {
            Err(AnnError::alignment_error(format_args!(
                "read request {} {} is not {}-byte aligned",
                what, value, DISK_IO_ALIGNMENT
            )))
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn aligned_buf(&self) -> &[u8] {
        self.aligned_buf
    }

    pub fn aligned_buf_mut(&mut self) -> &mut [u8] {
        self.aligned_buf
    }
}

#[cfg(test)]
mod tests {
    use halite::{utils::AlignedBoxWithSlice, AnnErrorKind};

    use super::*;

    #[test]
    fn aligned_requests_are_accepted() {
        let mut buffer = AlignedBoxWithSlice::<u8>::new(2 * 512, 512).unwrap();
        let read = AlignedRead::new(512, buffer.as_mut_slice()).unwrap();
        assert_eq!(read.offset(), 512);
        assert_eq!(read.aligned_buf().len(), 1024);
    }

    #[test]
    fn misaligned_offset_is_rejected() {
        let mut buffer = AlignedBoxWithSlice::<u8>::new(512, 512).unwrap();
        let err = AlignedRead::new(100, buffer.as_mut_slice()).unwrap_err();
        assert_eq!(err.kind(), AnnErrorKind::AlignmentError);
    }

    #[test]
    fn misaligned_length_is_rejected() {
        let mut buffer = AlignedBoxWithSlice::<u8>::new(1000, 512).unwrap();
        let err = AlignedRead::new(0, buffer.as_mut_slice()).unwrap_err();
        assert_eq!(err.kind(), AnnErrorKind::AlignmentError);
    }

    #[test]
    fn misaligned_buffer_address_is_rejected() {
        let mut buffer = AlignedBoxWithSlice::<u8>::new(2 * 512, 512).unwrap();
        // Offset the slice by one byte so the address alignment breaks while
        // the length stays aligned.
        let err = AlignedRead::new(0, &mut buffer.as_mut_slice()[1..513]).unwrap_err();
        assert_eq!(err.kind(), AnnErrorKind::AlignmentError);
    }
}

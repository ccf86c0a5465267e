/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::{
    fs::{File, OpenOptions},
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    path::Path,
    sync::{Arc, Mutex},
    thread::{self, ThreadId},
};

use hashbrown::HashMap;
use io_uring::IoUring;
use tracing::{info, warn};

use halite::{AnnError, AnnResult};

use crate::aligned_read::AlignedRead;

/// Capacity of each per-thread submission context. Batches larger than this
/// are processed in windows of `MAX_EVENTS` requests.
pub const MAX_EVENTS: usize = 1024;

/// Additional attempts granted to a window whose submission or completion
/// comes back short. Interruption-class errors retry without consuming the
/// budget; exceeding it is fatal to the read call.
const N_RETRIES: usize = 10;

/// A handle to one thread's kernel submission context.
///
/// Only the registering thread issues reads through its context, so the
/// inner mutex is uncontended; it exists to make handing the ring across
/// the registry sound.
#[derive(Clone)]
pub struct IoContext {
    ring: Arc<Mutex<IoUring>>,
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext").finish_non_exhaustive()
    }
}

/// Batched sector-aligned reads against one file opened for direct I/O.
///
/// The reader owns the descriptor for the file's lifetime and a map from
/// thread identity to kernel submission context. Worker threads call
/// [`Self::register_thread`] once, fetch their context with
/// [`Self::get_ctx`], and pass it to every [`Self::read`]. The map's mutex
/// guards registration, removal and lookup only; it is not held during I/O.
#[derive(Debug)]
pub struct LinuxAlignedFileReader {
    file: Option<File>,
    ctx_map: Mutex<HashMap<ThreadId, IoContext>>,
}

/// Errors the kernel reports transiently; callers retry these without
/// consuming the retry budget. `EBUSY` is io_uring's completion-queue
/// backpressure signal.
fn is_interruption(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EBUSY)
    )
}

impl LinuxAlignedFileReader {
    /// Open `path` read-only with `O_DIRECT`, bypassing the page cache.
    pub fn open(path: &Path) -> AnnResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECT | libc::O_LARGEFILE)
            .open(path)
            .map_err(AnnError::io_open_failed)?;

        info!("Opened file {} for direct io", path.display());
        Ok(Self {
            file: Some(file),
            ctx_map: Mutex::new(HashMap::new()),
        })
    }

    /// Close the file descriptor. Safe to call more than once; subsequent
    /// reads are refused.
    pub fn close(&mut self) {
        self.file.take();
    }

    /// Create a kernel submission context with [`MAX_EVENTS`] entries and
    /// bind it to the calling thread.
    ///
    /// Registering twice from the same thread is a warning no-op. When the
    /// kernel refuses another context the error kind is `IoSetupExhausted`;
    /// the thread is left without a context and its reads are refused, but
    /// other threads are unaffected.
    pub fn register_thread(&self) -> AnnResult<()> {
        let my_id = thread::current().id();
        let mut ctx_map = lock_map(&self.ctx_map)?;

        if ctx_map.contains_key(&my_id) {
            warn!("multiple calls to register_thread from thread {:?}", my_id);
            return Ok(());
        }

        let ring = IoUring::new(MAX_EVENTS as u32).map_err(|err| match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::ENOMEM) | Some(libc::EMFILE) | Some(libc::ENFILE) => {
                AnnError::io_setup_exhausted(format_args!(
                    "io context setup failed ({}); consider raising the kernel async io limits",
                    err
                ))
            }
            _ => AnnError::io_error(err),
        })?;

        info!("allocating io context to thread {:?}", my_id);
        ctx_map.insert(
            my_id,
            IoContext {
                ring: Arc::new(Mutex::new(ring)),
            },
        );
        Ok(())
    }

    /// Destroy the calling thread's context and remove it from the map.
    pub fn deregister_thread(&self) -> AnnResult<()> {
        let my_id = thread::current().id();
        let mut ctx_map = lock_map(&self.ctx_map)?;
        match ctx_map.remove(&my_id) {
            Some(_) => info!("returned io context from thread {:?}", my_id),
            None => warn!("deregister_thread from unregistered thread {:?}", my_id),
        }
        Ok(())
    }

    /// Destroy every remaining context.
    pub fn deregister_all_threads(&self) -> AnnResult<()> {
        let mut ctx_map = lock_map(&self.ctx_map)?;
        let count = ctx_map.len();
        ctx_map.clear();
        info!("returned {} io contexts", count);
        Ok(())
    }

    /// The context previously bound to the calling thread.
    ///
    /// An unregistered thread gets a `BadIoContext` error; its reads are
    /// refused rather than silently serialised onto another context.
    pub fn get_ctx(&self) -> AnnResult<IoContext> {
        let ctx_map = lock_map(&self.ctx_map)?;
        ctx_map
            .get(&thread::current().id())
            .cloned()
            .ok_or_else(|| {
                AnnError::bad_io_context(format_args!(
                    "bad thread access: no io context registered for thread {:?}",
                    thread::current().id()
                ))
            })
    }

    /// Execute a batch of aligned reads through `ctx`, blocking until every
    /// request in the batch has completed.
    ///
    /// The batch is split into windows of at most [`MAX_EVENTS`] requests.
    /// Each window is fully submitted (partial submission retries up to
    /// [`N_RETRIES`] times) and fully drained (same discipline) before the
    /// next window starts. Within one call there is no ordering guarantee
    /// among the requests' buffer writes beyond all being complete on
    /// return.
    ///
    /// `async_io` is accepted for interface compatibility and ignored; the
    /// call always runs synchronously.
    pub fn read(
        &self,
        read_reqs: &mut [AlignedRead<'_>],
        ctx: &IoContext,
        async_io: bool,
    ) -> AnnResult<()> {
        if async_io {
            warn!("asynchronous mode is not supported; executing the batch synchronously");
        }

        let fd = self
            .file
            .as_ref()
            .ok_or_else(|| {
                AnnError::io_open_failed(std::io::Error::other("file is not open"))
            })?
            .as_raw_fd();

        let mut ring = ctx
            .ring
            .lock()
            .map_err(|_| AnnError::lock_poisoned("io context mutex poisoned"))?;

        let n_requests = read_reqs.len();
        let n_windows = n_requests.div_ceil(MAX_EVENTS);

        for window in 0..n_windows {
            let window_start = window * MAX_EVENTS;
            let n_ops = MAX_EVENTS.min(n_requests - window_start);

            // Queue one SQE per request, identified by its absolute index
            // in the batch.
            for j in 0..n_ops {
                let read_id = window_start + j;
                let req = &mut read_reqs[read_id];
                let buf = req.aligned_buf_mut();
                let entry = io_uring::opcode::Read::new(
                    io_uring::types::Fd(fd),
                    buf.as_mut_ptr(),
                    buf.len() as u32,
                )
                .offset(req.offset())
                .build()
                .user_data(read_id as u64);

                // SAFETY: the destination buffers are borrowed for the whole
                // call and the window is drained before the call returns, so
                // the kernel never writes into freed memory. The queue was
                // created with MAX_EVENTS entries and receives at most
                // MAX_EVENTS pushes per window.
                unsafe {
                    ring.submission().push(&entry).map_err(|err| {
                        AnnError::io_submit_failed(format_args!(
                            "submission queue rejected request {}: {}",
                            read_id, err
                        ))
                    })?;
                }
            }

            submit_window(&mut ring, n_ops)?;
            drain_window(&mut ring, read_reqs, window_start, n_ops)?;
        }

        Ok(())
    }
}

/// Submit every queued request of the current window, retrying partial
/// submission.
fn submit_window(ring: &mut IoUring, n_ops: usize) -> AnnResult<()> {
    let mut num_submitted = 0usize;
    let mut submit_retry = 0usize;

    while num_submitted < n_ops {
        let submitted = loop {
            match ring.submit() {
                Ok(n) => break n,
                Err(err) if is_interruption(&err) => continue,
                Err(err) => {
                    return Err(AnnError::io_submit_failed(format_args!(
                        "unknown error in io submission: {}",
                        err
                    )));
                }
            }
        };

        num_submitted += submitted;
        if num_submitted < n_ops {
            submit_retry += 1;
            if submit_retry <= N_RETRIES {
                warn!(
                    "io submission incomplete; submitted: {}, expected: {}, retry: {}",
                    num_submitted, n_ops, submit_retry
                );
            } else {
                return Err(AnnError::io_submit_failed(format_args!(
                    "io submission failed after {} retries",
                    N_RETRIES
                )));
            }
        }
    }

    Ok(())
}

/// Block until the current window's `n_ops` completions have been drained,
/// checking each completion's status.
fn drain_window(
    ring: &mut IoUring,
    read_reqs: &[AlignedRead<'_>],
    window_start: usize,
    n_ops: usize,
) -> AnnResult<()> {
    let mut num_read = 0usize;
    let mut read_retry = 0usize;

    while num_read < n_ops {
        let wait_result = ring.submitter().submit_and_wait(n_ops - num_read);

        // Drain whatever arrived regardless of how the wait ended.
        let mut drained = 0usize;
        for cqe in ring.completion() {
            let read_id = cqe.user_data() as usize;
            debug_assert!(read_id >= window_start && read_id < window_start + n_ops);
            let req = &read_reqs[read_id];

            // A failed or short transfer fails the whole batch; callers
            // cannot recover individual requests.
            if cqe.result() < 0 {
                return Err(AnnError::io_read_failed(format_args!(
                    "read at offset {} failed: {}",
                    req.offset(),
                    std::io::Error::from_raw_os_error(-cqe.result())
                )));
            }
            if cqe.result() as usize != req.aligned_buf().len() {
                return Err(AnnError::io_read_failed(format_args!(
                    "short read at offset {}: {} of {} bytes",
                    req.offset(),
                    cqe.result(),
                    req.aligned_buf().len()
                )));
            }
            drained += 1;
        }
        num_read += drained;

        match wait_result {
            // An interrupted wait retries without consuming the budget.
            Err(err) if is_interruption(&err) => continue,
            Err(err) => {
                return Err(AnnError::io_getevents_failed(format_args!(
                    "unknown error waiting for io completions: {}",
                    err
                )));
            }
            Ok(_) => {}
        }

        if num_read < n_ops {
            read_retry += 1;
            if read_retry <= N_RETRIES {
                warn!(
                    "io completion incomplete; read: {}, expected: {}, retry: {}",
                    num_read, n_ops, read_retry
                );
            } else {
                return Err(AnnError::io_getevents_failed(format_args!(
                    "io completion failed after {} retries",
                    N_RETRIES
                )));
            }
        }
    }

    Ok(())
}

fn lock_map(
    map: &Mutex<HashMap<ThreadId, IoContext>>,
) -> AnnResult<std::sync::MutexGuard<'_, HashMap<ThreadId, IoContext>>> {
    map.lock()
        .map_err(|_| AnnError::lock_poisoned("io context map mutex poisoned"))
}

#[cfg(test)]
mod tests {
    use std::{io::Write, sync::Arc};

    use halite::{utils::AlignedBoxWithSlice, AnnErrorKind};
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use tempfile::NamedTempFile;

    use super::*;
    use crate::aligned_read::DISK_IO_ALIGNMENT;

    const SECTOR: usize = DISK_IO_ALIGNMENT;
    const NUM_SECTORS: usize = 4 * MAX_EVENTS;

    fn sector_byte(sector: usize, index: usize) -> u8 {
        ((sector * 131 + index * 7) % 251) as u8
    }

    // A deterministic file of NUM_SECTORS sectors, created on the same
    // filesystem as the sources: direct io needs a real (non-tmpfs) mount.
    fn test_file() -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .prefix(".aligned_reader_test_")
            .tempfile_in(env!("CARGO_MANIFEST_DIR"))
            .unwrap();

        let mut sector = vec![0u8; SECTOR];
        for s in 0..NUM_SECTORS {
            for (i, byte) in sector.iter_mut().enumerate() {
                *byte = sector_byte(s, i);
            }
            file.write_all(&sector).unwrap();
        }
        file.flush().unwrap();
        // Push the data all the way to the device; direct io reads bypass
        // the page cache.
        file.as_file().sync_all().unwrap();
        file
    }

    fn check_sector(buf: &[u8], sector: usize) {
        for (i, &byte) in buf.iter().enumerate() {
            assert_eq!(
                byte,
                sector_byte(sector, i),
                "byte {} of sector {} does not match the file",
                i,
                sector
            );
        }
    }

    #[test]
    fn sequential_sectors_read_back_exactly() {
        let file = test_file();
        let reader = LinuxAlignedFileReader::open(file.path()).unwrap();
        reader.register_thread().unwrap();
        let ctx = reader.get_ctx().unwrap();

        let num_reads = 10;
        let mut memory = AlignedBoxWithSlice::<u8>::new(num_reads * SECTOR, SECTOR).unwrap();
        let slices = memory
            .split_into_nonoverlapping_mut_slices(0..num_reads * SECTOR, SECTOR)
            .unwrap();

        let mut reads: Vec<AlignedRead<'_>> = slices
            .into_iter()
            .enumerate()
            .map(|(i, slice)| AlignedRead::new((i * SECTOR) as u64, slice).unwrap())
            .collect();

        reader.read(&mut reads, &ctx, false).unwrap();

        for (i, read) in reads.iter().enumerate() {
            check_sector(read.aligned_buf(), i);
        }
        reader.deregister_thread().unwrap();
    }

    // More requests than one submission window holds, at shuffled offsets:
    // exercises the windowed submit/drain path end to end.
    #[test]
    fn batches_larger_than_one_window_complete() {
        let file = test_file();
        let reader = LinuxAlignedFileReader::open(file.path()).unwrap();
        reader.register_thread().unwrap();
        let ctx = reader.get_ctx().unwrap();

        let num_reads = MAX_EVENTS + 5;
        let mut rng = StdRng::seed_from_u64(0xa11d);
        let sectors: Vec<usize> = (0..num_reads)
            .map(|_| rng.random_range(0..NUM_SECTORS))
            .collect();

        let mut memory = AlignedBoxWithSlice::<u8>::new(num_reads * SECTOR, SECTOR).unwrap();
        let slices = memory
            .split_into_nonoverlapping_mut_slices(0..num_reads * SECTOR, SECTOR)
            .unwrap();

        let mut reads: Vec<AlignedRead<'_>> = slices
            .into_iter()
            .zip(sectors.iter())
            .map(|(slice, &sector)| {
                AlignedRead::new((sector * SECTOR) as u64, slice).unwrap()
            })
            .collect();

        reader.read(&mut reads, &ctx, false).unwrap();

        for (read, &sector) in reads.iter().zip(sectors.iter()) {
            check_sector(read.aligned_buf(), sector);
        }
        reader.deregister_all_threads().unwrap();
    }

    #[test]
    fn concurrent_threads_read_disjoint_ranges() {
        let file = test_file();
        let reader = Arc::new(LinuxAlignedFileReader::open(file.path()).unwrap());

        let mut handles = Vec::new();
        for worker in 0..4usize {
            let reader = Arc::clone(&reader);
            handles.push(std::thread::spawn(move || {
                reader.register_thread().unwrap();
                let ctx = reader.get_ctx().unwrap();

                // Each worker owns every fourth sector of the first window.
                let sectors: Vec<usize> = (0..64).map(|i| worker + 4 * i).collect();
                let mut memory =
                    AlignedBoxWithSlice::<u8>::new(sectors.len() * SECTOR, SECTOR).unwrap();
                let slices = memory
                    .split_into_nonoverlapping_mut_slices(0..sectors.len() * SECTOR, SECTOR)
                    .unwrap();

                let mut reads: Vec<AlignedRead<'_>> = slices
                    .into_iter()
                    .zip(sectors.iter())
                    .map(|(slice, &sector)| {
                        AlignedRead::new((sector * SECTOR) as u64, slice).unwrap()
                    })
                    .collect();

                reader.read(&mut reads, &ctx, false).unwrap();

                for (read, &sector) in reads.iter().zip(sectors.iter()) {
                    check_sector(read.aligned_buf(), sector);
                }
                reader.deregister_thread().unwrap();
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn unregistered_thread_is_refused() {
        let file = test_file();
        let reader = LinuxAlignedFileReader::open(file.path()).unwrap();
        let err = reader.get_ctx().unwrap_err();
        assert_eq!(err.kind(), AnnErrorKind::BadIoContext);
    }

    #[test]
    fn duplicate_registration_is_a_noop() {
        let file = test_file();
        let reader = LinuxAlignedFileReader::open(file.path()).unwrap();
        reader.register_thread().unwrap();
        reader.register_thread().unwrap();
        reader.deregister_thread().unwrap();
        assert_eq!(
            reader.get_ctx().unwrap_err().kind(),
            AnnErrorKind::BadIoContext
        );
    }

    #[test]
    fn opening_a_missing_file_fails() {
        let err =
            LinuxAlignedFileReader::open(Path::new("/definitely/not/here.bin")).unwrap_err();
        assert_eq!(err.kind(), AnnErrorKind::IoOpenFailed);
    }

    #[test]
    fn reads_after_close_are_refused() {
        let file = test_file();
        let mut reader = LinuxAlignedFileReader::open(file.path()).unwrap();
        reader.register_thread().unwrap();
        let ctx = reader.get_ctx().unwrap();

        reader.close();
        reader.close(); // idempotent

        let mut memory = AlignedBoxWithSlice::<u8>::new(SECTOR, SECTOR).unwrap();
        let mut reads = vec![AlignedRead::new(0, memory.as_mut_slice()).unwrap()];
        let err = reader.read(&mut reads, &ctx, false).unwrap_err();
        assert_eq!(err.kind(), AnnErrorKind::IoOpenFailed);
    }

    #[test]
    fn empty_batches_are_trivially_complete() {
        let file = test_file();
        let reader = LinuxAlignedFileReader::open(file.path()).unwrap();
        reader.register_thread().unwrap();
        let ctx = reader.get_ctx().unwrap();
        let mut reads: Vec<AlignedRead<'_>> = Vec::new();
        reader.read(&mut reads, &ctx, false).unwrap();
    }

    #[test]
    fn async_flag_is_ignored_but_accepted() {
        let file = test_file();
        let reader = LinuxAlignedFileReader::open(file.path()).unwrap();
        reader.register_thread().unwrap();
        let ctx = reader.get_ctx().unwrap();

        let mut memory = AlignedBoxWithSlice::<u8>::new(SECTOR, SECTOR).unwrap();
        let mut reads = vec![AlignedRead::new(0, memory.as_mut_slice()).unwrap()];
        reader.read(&mut reads, &ctx, true).unwrap();
        check_sector(reads[0].aligned_buf(), 0);
    }
}

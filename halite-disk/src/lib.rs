/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Sector-aligned batched direct I/O.
//!
//! [`LinuxAlignedFileReader`] owns one file opened with `O_DIRECT` and a
//! registry of per-thread kernel submission contexts. Worker threads
//! register once, then issue batches of [`AlignedRead`] requests that are
//! submitted and drained in windows of at most [`MAX_EVENTS`] operations.

mod aligned_read;
mod reader;

pub use aligned_read::{AlignedRead, DISK_IO_ALIGNMENT};
pub use reader::{IoContext, LinuxAlignedFileReader, MAX_EVENTS};

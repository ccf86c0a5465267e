/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Core types shared across the halite workspace.
//!
//! This crate carries the workspace-wide error type ([`AnnError`]), the
//! `<u32 rows, u32 cols, payload>` binary matrix reader/writer used by every
//! on-disk artifact, and the aligned allocation helper required at the
//! direct-I/O boundary.

pub mod error;
pub mod utils;

pub use error::{AnnError, AnnErrorKind, AnnResult};

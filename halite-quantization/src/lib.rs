/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Product Quantization for the halite disk-resident ANN engine.
//!
//! The crate covers the full PQ lifecycle:
//!
//! * offline training of PQ and OPQ pivot tables ([`train`]),
//! * the on-disk pivot container and its canonical paths ([`storage`]),
//! * streaming compression of a base-vector file into codes ([`encode`]),
//! * query-time use: distance-table population and asymmetric distances
//!   ([`table`]), plus the code-gather and table-lookup hot path
//!   ([`lookup`]).
//!
//! Training leans on the in-crate k-means primitives ([`kmeans`], [`math`])
//! and on `halite-linalg` for the OPQ rotation updates.

pub mod encode;
pub mod kmeans;
pub mod lookup;
pub mod math;
pub mod partition;
pub mod storage;
pub mod table;
pub mod train;

pub use table::{FixedChunkPQTable, NUM_PQ_CENTROIDS};

/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! The `faer`-backed implementations. Size invariants are checked by the
//! public wrappers in `lib.rs`.

use faer::{self, Par};
use rand::Rng;
use rand_distr::StandardNormal;

use super::{SvdError, Transpose};

#[allow(clippy::too_many_arguments)]
pub(super) fn sgemm_impl(
    atranspose: Transpose,
    btranspose: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    b: &[f32],
    beta: Option<f32>,
    c: &mut [f32],
) {
    let a = match atranspose {
        Transpose::None => faer::mat::MatRef::from_row_major_slice(a, m, k),
        Transpose::Ordinary => faer::mat::MatRef::from_row_major_slice(a, k, m).transpose(),
    };

    let b = match btranspose {
        Transpose::None => faer::mat::MatRef::from_row_major_slice(b, k, n),
        Transpose::Ordinary => faer::mat::MatRef::from_row_major_slice(b, n, k).transpose(),
    };

    let mut c = faer::mat::MatMut::from_row_major_slice_mut(c, m, n);

    // faer only accumulates with a unit factor, so a general `beta` scales
    // the destination up front.
    let accum = match beta {
        Some(scale) => {
            if scale != 1.0 {
                c *= faer::Scale(scale);
            }
            faer::Accum::Add
        }
        None => faer::Accum::Replace,
    };

    faer::linalg::matmul::matmul(c, accum, a, b, alpha, Par::Seq)
}

pub(super) fn svd_into_impl(
    m: usize,
    n: usize,
    a: &[f32],
    singular_values: &mut [f32],
    u: &mut [f32],
    vt: &mut [f32],
) -> Result<(), SvdError> {
    let a = faer::mat::MatRef::from_row_major_slice(a, m, n);
    let svd = a.svd().map_err(|_| SvdError)?;

    let mut singular_values = faer::col::ColMut::from_slice_mut(singular_values);
    singular_values.copy_from(svd.S().column_vector());

    let mut u = faer::mat::MatMut::from_row_major_slice_mut(u, m, m);
    u.copy_from(svd.U());

    // Writing V through the transpose of the row-major buffer leaves the
    // buffer holding Vᵀ, the layout the callers expect.
    let mut vt = faer::mat::MatMut::from_row_major_slice_mut(vt, n, n).transpose_mut();
    vt.copy_from(svd.V());

    Ok(())
}

pub(super) fn random_orthogonal_impl<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> Vec<f32> {
    let mut data: Vec<f32> = (0..dim * dim).map(|_| rng.sample(StandardNormal)).collect();

    let mut a = faer::mat::MatMut::from_row_major_slice_mut(&mut data, dim, dim);

    // Q of the QR decomposition of a Gaussian matrix is Haar-distributed
    // once the signs are pinned to R's diagonal.
    let qr = a.qr();
    let mut q = qr.compute_Q();
    let r = qr.R();

    for i in 0..dim {
        if r[(i, i)] < 0.0 {
            for j in 0..dim {
                q[(j, i)] = -q[(j, i)];
            }
        }
    }

    a.copy_from(q);
    data
}

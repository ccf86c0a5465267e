/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

//! Dense linear algebra for the halite workspace.
//!
//! A deliberately small, cblas-flavoured surface over [`faer`]: row-major
//! matrix multiply, full singular value decomposition, and a random
//! orthogonal matrix generator. The rest of the workspace never touches the
//! backing library directly, so swapping the provider stays a one-file
//! change.

mod backend;

use rand::Rng;

/// Whether a matrix operand should be read as an in-place transpose.
#[derive(Debug, Clone, Copy)]
pub enum Transpose {
    /// Use the matrix as stored.
    None,
    /// Use the transpose of the stored matrix.
    Ordinary,
}

impl Transpose {
    /// Whether the operand is transposed.
    pub fn is_transpose(&self) -> bool {
        matches!(self, Self::Ordinary)
    }
}

/// The singular value decomposition failed to converge.
#[derive(Debug, thiserror::Error)]
#[error("singular value decomposition did not converge")]
pub struct SvdError;

/// Row-major matrix-matrix multiply:
///
/// ```ignore
/// c = [beta * c] + alpha * op(a) * op(b)
/// ```
///
/// where `op(x)` is `x` or its transpose according to the corresponding
/// [`Transpose`] flag. With `beta = None` the destination is overwritten
/// entirely; with `Some(scale)` it is scaled and accumulated into.
///
/// * `m`: rows of `c` (and of `op(a)`).
/// * `n`: columns of `c` (and of `op(b)`).
/// * `k`: columns of `op(a)` and rows of `op(b)`.
///
/// Only dense row-major operands with unit strides are supported; that is
/// the only case the workspace has.
///
/// # Panics
///
/// Panics if any slice length disagrees with the stated dimensions.
#[allow(clippy::too_many_arguments)]
pub fn sgemm(
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
    assert_eq!(a.len(), m * k, "matrix `a` must have {}x{} elements", m, k);
    assert_eq!(b.len(), k * n, "matrix `b` must have {}x{} elements", k, n);
    assert_eq!(c.len(), m * n, "matrix `c` must have {}x{} elements", m, n);

    backend::sgemm_impl(atranspose, btranspose, m, n, k, alpha, a, b, beta, c)
}

/// Full SVD of the row-major `m x n` matrix `a`.
///
/// On success:
///
/// * `singular_values` holds `min(m, n)` values in descending order,
/// * `u` holds the `m x m` left singular vectors in row-major order,
/// * `vt` holds the `n x n` right singular vectors in **column-major**
///   order (i.e. the buffer reads as `Vᵀ` row-major), keeping the layout
///   lapack's `gesdd` established so `u * vt` is a straight row-major
///   product.
///
/// # Panics
///
/// Panics if any slice length disagrees with the stated dimensions.
pub fn svd_into(
    m: usize,
    n: usize,
    a: &[f32],
    singular_values: &mut [f32],
    u: &mut [f32],
    vt: &mut [f32],
) -> Result<(), SvdError> {
    assert_eq!(a.len(), m * n);
    assert_eq!(singular_values.len(), m.min(n));
    assert_eq!(u.len(), m * m);
    assert_eq!(vt.len(), n * n);

    backend::svd_into_impl(m, n, a, singular_values, u, vt)
}

/// Sample a random `dim x dim` orthogonal matrix (determinant +1 or -1),
/// returned row-major.
///
/// Applying it to a vector preserves the L2 norm, which makes it a
/// distance-preserving transform for synthesising rotated test data.
pub fn random_distance_preserving_matrix<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> Vec<f32> {
    backend::random_orthogonal_impl(dim, rng)
}

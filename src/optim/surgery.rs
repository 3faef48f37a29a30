//! # Gradient Surgery
//!
//! Pairwise projection pass run over the gradient snapshot before the AdamW update.
//!
//! For every pair `(i, j)` with `i < j`, visited in ascending `i` then ascending
//! `j`, gradients of identical shape with a positive dot product `d` have the
//! component along `g[j]` removed from `g[i]`:
//!
//! ```text
//! g[i] <- g[i] - (d / |g[j]|^2) * g[j]
//! ```
//!
//! `g[j]` is never modified by its own pair, and later pairs see the already
//! projected `g[i]`.
//!
//! Two properties of this pass are easy to misread. It compares the gradients of
//! *different parameters*, which rarely share a shape in a real model, and it
//! projects when `d > 0`, i.e. for aligned gradients, whereas PCGrad-style
//! methods project conflicting (`d < 0`) ones. Both are kept as-is; callers
//! that want a plain AdamW disable the pass with
//! [`AdamWConfig::gradient_surgery`](super::AdamWConfig).

use crate::tensor::{ops, TensorData};
use ndarray::ArrayD;

/// Counts of what one pass did, for logging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SurgeryReport {
    /// Pairs where `g[i]` was projected.
    pub projected: usize,
    /// Pairs skipped because the shapes differ.
    pub shape_mismatch: usize,
    /// Pairs with `d > 0` skipped because `|g[j]|^2` underflowed or overflowed.
    pub degenerate: usize,
}

/// Runs the projection pass in place over the ordered present gradients.
pub fn gradient_surgery(grads: &mut [&mut ArrayD<TensorData>]) -> SurgeryReport {
    let mut report = SurgeryReport::default();
    let n = grads.len();
    for i in 0..n {
        for j in (i + 1)..n {
            let (head, tail) = grads.split_at_mut(j);
            let g_i: &mut ArrayD<TensorData> = &mut *head[i];
            let g_j: &ArrayD<TensorData> = &*tail[0];

            let Ok(dot) = ops::dot(g_i, g_j) else {
                report.shape_mismatch += 1;
                continue;
            };
            if !(dot > 0.0) {
                continue;
            }

            // d > 0 implies g[j] != 0, so this only trips on float range limits.
            let norm_sq = ops::squared_norm(g_j);
            if !(norm_sq > 0.0 && norm_sq.is_finite()) {
                tracing::trace!(i, j, dot, norm_sq, "skipping projection onto degenerate gradient");
                report.degenerate += 1;
                continue;
            }

            if ops::sub_scaled(g_i, dot / norm_sq, g_j).is_ok() {
                tracing::trace!(i, j, dot, "projected gradient");
                report.projected += 1;
            }
        }
    }
    report
}

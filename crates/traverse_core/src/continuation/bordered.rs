//! Bordered linear systems arising from arclength augmentation:
//!
//! ```text
//! [ J          ∂F/∂p    ] [ u ]   [ rhs_x ]
//! [ θ·dxᵀ/N    (1−θ)·dp ] [ v ] = [ rhs_p ]
//! ```
//!
//! `DenseBordered` assembles the full (N+1)×(N+1) matrix and LU-solves it.
//! `BorderingLemma` never forms the augmented matrix: it runs two inner
//! solves with J alone and recombines, which preserves the caller's
//! preconditioner structure on J when the inner solver is iterative.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};

use crate::linsolve::{LinearSolver, SolveStats};
use crate::vector::VectorOps;

/// Solver for the θ-weighted bordered system above.
pub trait BorderedSolver<J, V> {
    #[allow(clippy::too_many_arguments)]
    fn solve_bordered(
        &mut self,
        jac: &J,
        dfdp: &V,
        border_dx: &V,
        border_dp: f64,
        theta: f64,
        rhs_x: &V,
        rhs_p: f64,
    ) -> Result<(V, f64, SolveStats)>;
}

/// Explicit (N+1)×(N+1) assembly for concrete dense Jacobians.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenseBordered;

impl DenseBordered {
    pub fn new() -> Self {
        DenseBordered
    }
}

impl BorderedSolver<DMatrix<f64>, DVector<f64>> for DenseBordered {
    fn solve_bordered(
        &mut self,
        jac: &DMatrix<f64>,
        dfdp: &DVector<f64>,
        border_dx: &DVector<f64>,
        border_dp: f64,
        theta: f64,
        rhs_x: &DVector<f64>,
        rhs_p: f64,
    ) -> Result<(DVector<f64>, f64, SolveStats)> {
        let n = jac.nrows();
        if jac.ncols() != n || dfdp.nrows() != n || border_dx.nrows() != n || rhs_x.nrows() != n {
            bail!("bordered system blocks have mismatched dimensions");
        }
        let nn = n as f64;

        let mut a = DMatrix::zeros(n + 1, n + 1);
        a.view_mut((0, 0), (n, n)).copy_from(jac);
        for i in 0..n {
            a[(i, n)] = dfdp[i];
            a[(n, i)] = theta * border_dx[i] / nn;
        }
        a[(n, n)] = (1.0 - theta) * border_dp;

        let mut rhs = DVector::zeros(n + 1);
        rhs.rows_mut(0, n).copy_from(rhs_x);
        rhs[n] = rhs_p;

        let Some(solution) = a.lu().solve(&rhs) else {
            bail!("bordered matrix is singular");
        };
        let u = solution.rows(0, n).into_owned();
        Ok((u, solution[n], SolveStats::direct()))
    }
}

/// Block elimination: solve J·u₁ = rhs_x and J·u₂ = ∂F/∂p, then
/// v = (rhs_p − θ·⟨u₁, dx⟩/N) / ((1−θ)·dp − θ·⟨u₂, dx⟩/N) and
/// u = u₁ − v·u₂.
///
/// Relies on J itself being regular; use `DenseBordered` when stepping
/// exactly onto a singular point matters.
pub struct BorderingLemma<S> {
    pub inner: S,
}

impl<S> BorderingLemma<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<J, V, S> BorderedSolver<J, V> for BorderingLemma<S>
where
    V: VectorOps,
    S: LinearSolver<J, V>,
{
    fn solve_bordered(
        &mut self,
        jac: &J,
        dfdp: &V,
        border_dx: &V,
        border_dp: f64,
        theta: f64,
        rhs_x: &V,
        rhs_p: f64,
    ) -> Result<(V, f64, SolveStats)> {
        let nn = rhs_x.len() as f64;
        let (u1, stats1) = self.inner.solve(jac, rhs_x)?;
        let (u2, stats2) = self.inner.solve(jac, dfdp)?;

        let denom = (1.0 - theta) * border_dp - theta * u2.dot(border_dx) / nn;
        if denom.abs() < f64::EPSILON {
            bail!("bordered reduction is singular");
        }
        let v = (rhs_p - theta * u1.dot(border_dx) / nn) / denom;
        let mut u = u1;
        u.axpy(-v, &u2);

        Ok((
            u,
            v,
            SolveStats {
                iterations: stats1.iterations + stats2.iterations,
                final_residual: stats1.final_residual.max(stats2.final_residual),
                converged: stats1.converged && stats2.converged,
            },
        ))
    }
}

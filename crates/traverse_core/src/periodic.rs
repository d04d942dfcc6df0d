//! Periodic orbits by trapezoidal collocation.
//!
//! The unknown is a flat vector of M contiguous phase-space slices of
//! length N followed by the period T. Interior rows are the trapezoidal
//! recurrence, the first block row closes the orbit, and the final scalar
//! row is the phase condition pinning rotational invariance. The Jacobian
//! is available both as a matrix-free action and as a block-sparse
//! assembly; both share the same finite-difference period column, so they
//! agree to rounding when applied to the same vector.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};
use sprs::{CsMat, TriMat};

use crate::linsolve::{LinOp, LinearSolver, SolveStats};
use crate::FD_PARAM_STEP;

/// Trapezoidal collocation problem for ẋ = F(x).
///
/// The phase anchor `x_pi` and direction `phi` are fixed at construction,
/// as is the linear solver used against the frozen Jacobian; `gamma`
/// scales the identity block on the first slice of the periodicity row
/// (1 for the plain problem, other values for shifted solves).
pub struct PeriodicOrbitTrap<F, J, S> {
    f: F,
    jac: J,
    linsolve: S,
    phi: DVector<f64>,
    x_pi: DVector<f64>,
    slices: usize,
    gamma: f64,
}

impl<F, J, S> PeriodicOrbitTrap<F, J, S>
where
    F: Fn(&DVector<f64>) -> Result<DVector<f64>>,
    J: Fn(&DVector<f64>) -> Result<DMatrix<f64>>,
{
    pub fn new(
        f: F,
        jac: J,
        phi: DVector<f64>,
        x_pi: DVector<f64>,
        slices: usize,
        linsolve: S,
    ) -> Result<Self> {
        if slices < 2 {
            bail!("periodic orbit meshes require at least 2 time slices");
        }
        if phi.nrows() != x_pi.nrows() {
            bail!("phase direction and anchor must match in dimension");
        }
        let norm = phi.norm();
        if norm == 0.0 {
            bail!("phase direction must be non-zero");
        }
        Ok(Self {
            f,
            jac,
            linsolve,
            phi: phi / norm,
            x_pi,
            slices,
            gamma: 1.0,
        })
    }

    pub fn with_gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma;
        self
    }

    pub fn slices(&self) -> usize {
        self.slices
    }

    /// Total unknowns M·N + 1.
    pub fn unknowns(&self) -> usize {
        self.slices * self.phi.nrows() + 1
    }

    /// Phase-space dimension, checked against the state layout: the
    /// length must be exactly M·N + 1.
    fn check_dims(&self, u: &DVector<f64>) -> Result<usize> {
        let n = self.phi.nrows();
        if u.nrows() != self.slices * n + 1 {
            bail!(
                "state length {} does not match {} slices of dimension {} plus the period",
                u.nrows(),
                self.slices,
                n
            );
        }
        Ok(n)
    }

    /// Collocation residual of length M·N + 1.
    pub fn residual(&self, u: &DVector<f64>) -> Result<DVector<f64>> {
        let n = self.check_dims(u)?;
        let m = self.slices;
        let t = u[m * n];
        let h = t / m as f64;
        let mut r = DVector::zeros(m * n + 1);

        let mut f_prev = (self.f)(&u.rows(0, n).into_owned())?;
        for i in 1..m {
            let f_i = (self.f)(&u.rows(i * n, n).into_owned())?;
            for k in 0..n {
                r[i * n + k] =
                    u[i * n + k] - u[(i - 1) * n + k] - 0.5 * h * (f_i[k] + f_prev[k]);
            }
            f_prev = f_i;
        }

        for k in 0..n {
            r[k] = u[(m - 1) * n + k] - self.gamma * u[k];
        }

        let mut phase = 0.0;
        for k in 0..n {
            phase += (u[k] - self.x_pi[k]) * self.phi[k];
        }
        r[m * n] = phase;
        Ok(r)
    }

    /// Freeze the Jacobian at `u`: per-slice Jacobians plus the
    /// finite-difference period column, shared by the action and the
    /// sparse assembly.
    pub fn jacobian_op(&self, u: &DVector<f64>) -> Result<TrapJacobian> {
        let n = self.check_dims(u)?;
        let m = self.slices;
        let t = u[m * n];
        let h = t / m as f64;

        let mut jacs = Vec::with_capacity(m);
        for i in 0..m {
            let j_i = (self.jac)(&u.rows(i * n, n).into_owned())?;
            if j_i.nrows() != n || j_i.ncols() != n {
                bail!("slice Jacobian must be {n}×{n}");
            }
            jacs.push(j_i);
        }

        let mut u_plus = u.clone();
        u_plus[m * n] += FD_PARAM_STEP;
        let r = self.residual(u)?;
        let r_plus = self.residual(&u_plus)?;
        let fd_col = (r_plus - r) / FD_PARAM_STEP;

        Ok(TrapJacobian {
            n,
            m,
            h,
            gamma: self.gamma,
            phi: self.phi.clone(),
            jacs,
            fd_col,
        })
    }

    /// Solve (J(u) + σ·I)·δ = rhs with the attached linear solver acting
    /// on the frozen Jacobian; σ = 0 gives the plain system. As with the
    /// solvers themselves, non-convergence is reported through the stats,
    /// not as an error.
    pub fn solve_jacobian(
        &mut self,
        u: &DVector<f64>,
        rhs: &DVector<f64>,
        sigma: f64,
    ) -> Result<(DVector<f64>, SolveStats)>
    where
        S: LinearSolver<TrapJacobian, DVector<f64>>,
    {
        let op = self.jacobian_op(u)?;
        if rhs.nrows() != op.dim() {
            bail!(
                "right-hand side length {} does not match {} unknowns",
                rhs.nrows(),
                op.dim()
            );
        }
        let (delta, stats) = self.linsolve.solve_shifted(&op, rhs, sigma)?;
        Ok((delta, stats))
    }

    /// Matrix-free Jacobian action on (δu, δT), the last entry of `du`
    /// being δT.
    pub fn jacobian_action(&self, u: &DVector<f64>, du: &DVector<f64>) -> Result<DVector<f64>> {
        let op = self.jacobian_op(u)?;
        if du.nrows() != op.dim() {
            bail!("direction length {} does not match {} unknowns", du.nrows(), op.dim());
        }
        let mut y = DVector::zeros(op.dim());
        op.apply(du, &mut y);
        Ok(y)
    }

    /// Block-sparse Jacobian assembly, one equation per unknown.
    pub fn sparse_jacobian(&self, u: &DVector<f64>) -> Result<CsMat<f64>> {
        let op = self.jacobian_op(u)?;
        let (n, m, h) = (op.n, op.m, op.h);
        let dim = m * n + 1;
        let mut tri = TriMat::with_capacity((dim, dim), 2 * n * n * m + 3 * n + dim);

        // Periodicity blocks: −γI on slice 1, I on slice M.
        for k in 0..n {
            tri.add_triplet(k, k, -op.gamma);
            tri.add_triplet(k, (m - 1) * n + k, 1.0);
        }

        // Interior block rows i = 2..M: Iₙ − (h/2)·J(Uᵢ) on the diagonal,
        // −Iₙ − (h/2)·J(Uᵢ₋₁) on the subdiagonal.
        for i in 1..m {
            for r0 in 0..n {
                for c0 in 0..n {
                    let identity = if r0 == c0 { 1.0 } else { 0.0 };
                    let diag = identity - 0.5 * h * op.jacs[i][(r0, c0)];
                    if diag != 0.0 {
                        tri.add_triplet(i * n + r0, i * n + c0, diag);
                    }
                    let sub = -identity - 0.5 * h * op.jacs[i - 1][(r0, c0)];
                    if sub != 0.0 {
                        tri.add_triplet(i * n + r0, (i - 1) * n + c0, sub);
                    }
                }
            }
        }

        // Finite-difference period column.
        for r0 in 0..dim {
            if op.fd_col[r0] != 0.0 {
                tri.add_triplet(r0, dim - 1, op.fd_col[r0]);
            }
        }

        // Phase row: ϕ against the first slice; the period entry is the
        // T-derivative of the phase condition, which vanishes.
        for k in 0..n {
            tri.add_triplet(dim - 1, k, op.phi[k]);
        }

        Ok(tri.to_csr())
    }
}

/// Jacobian of the collocation system frozen at one point, applied
/// action-only. Plugs into the iterative linear solvers as a [`LinOp`].
pub struct TrapJacobian {
    n: usize,
    m: usize,
    h: f64,
    gamma: f64,
    phi: DVector<f64>,
    jacs: Vec<DMatrix<f64>>,
    fd_col: DVector<f64>,
}

impl LinOp<DVector<f64>> for TrapJacobian {
    fn apply(&self, du: &DVector<f64>, y: &mut DVector<f64>) {
        let (n, m) = (self.n, self.m);
        let dt = du[m * n];
        y.fill(0.0);

        // Periodicity row.
        for k in 0..n {
            y[k] = du[(m - 1) * n + k] - self.gamma * du[k];
        }

        // Trapezoidal recurrence with J·δU replacing the F-evaluations.
        let mut jdu_prev = &self.jacs[0] * du.rows(0, n);
        for i in 1..m {
            let jdu_i = &self.jacs[i] * du.rows(i * n, n);
            for k in 0..n {
                y[i * n + k] = du[i * n + k]
                    - du[(i - 1) * n + k]
                    - 0.5 * self.h * (jdu_i[k] + jdu_prev[k]);
            }
            jdu_prev = jdu_i;
        }

        // Phase row.
        let mut phase = 0.0;
        for k in 0..n {
            phase += du[k] * self.phi[k];
        }
        y[m * n] = phase;

        // Shared period column.
        y.axpy(dt, &self.fd_col, 1.0);
    }

    fn dim(&self) -> usize {
        self.m * self.n + 1
    }
}

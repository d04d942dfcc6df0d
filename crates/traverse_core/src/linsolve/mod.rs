//! Linear-solver abstraction bridging dense factorisation and iterative
//! Krylov methods, including shifted systems (J + σI)·x = b.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

pub mod direct;
pub mod gmres;

pub use direct::DenseLu;
pub use gmres::{Gmres, GmresOptions, Preconditioning};

/// Unified error type for the linear-solver layer.
#[derive(Error, Debug)]
pub enum LinearError {
    #[error("factorization error: {0}")]
    Factor(String),
    #[error("solve error: {0}")]
    Solve(String),
}

/// Matrix action y ← J·x without forming J.
pub trait LinOp<V> {
    fn apply(&self, x: &V, y: &mut V);

    /// Number of rows (equal to columns; operators here are square).
    fn dim(&self) -> usize;
}

impl LinOp<DVector<f64>> for DMatrix<f64> {
    fn apply(&self, x: &DVector<f64>, y: &mut DVector<f64>) {
        y.gemv(1.0, self, x, 0.0);
    }

    fn dim(&self) -> usize {
        self.nrows()
    }
}

/// Approximate inverse applied to a residual: z ≈ M⁻¹·r.
pub trait Preconditioner<V> {
    fn apply(&self, r: &V, z: &mut V) -> Result<(), LinearError>;
}

/// Iteration stats reported by every solve.
#[derive(Clone, Debug)]
pub struct SolveStats {
    pub iterations: usize,
    pub final_residual: f64,
    pub converged: bool,
}

impl SolveStats {
    pub fn direct() -> Self {
        Self {
            iterations: 1,
            final_residual: 0.0,
            converged: true,
        }
    }
}

/// Common interface for direct and iterative solvers.
///
/// Non-convergence of an iterative method is not an error: the solver
/// returns its current iterate with `converged = false` and the caller
/// decides whether that is fatal. `Err` is reserved for structural
/// failure such as a singular factorisation.
pub trait LinearSolver<J, V> {
    /// Solve J·x = b.
    fn solve(&mut self, j: &J, b: &V) -> Result<(V, SolveStats), LinearError>;

    /// Solve (J + σ·I)·x = b. σ = 0 must fall through to the plain solve.
    fn solve_shifted(&mut self, j: &J, b: &V, sigma: f64) -> Result<(V, SolveStats), LinearError>;
}

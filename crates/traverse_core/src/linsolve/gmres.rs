//! Restarted GMRES over an action-only operator.
//!
//! Modified Gram-Schmidt with one re-orthogonalisation pass, Givens
//! rotations for the least-squares update, happy-breakdown detection and
//! zero-pivot protection in the back-substitution. Supports left and right
//! preconditioning. The shifted form wraps the operator as v ↦ J·v + σ·v;
//! no matrix is formed.

use log::debug;
use serde::{Deserialize, Serialize};

use super::{LinOp, LinearError, LinearSolver, Preconditioner, SolveStats};
use crate::vector::VectorOps;

const BREAKDOWN_EPS: f64 = 1e-14;

/// Preconditioning side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preconditioning {
    None,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GmresOptions {
    /// Relative tolerance on the residual norm.
    pub rtol: f64,
    /// Absolute tolerance on the residual norm.
    pub atol: f64,
    /// Krylov dimension before restart.
    pub restart: usize,
    /// Total iteration cap across restarts.
    pub max_iter: usize,
    pub preconditioning: Preconditioning,
    pub verbose: bool,
}

impl Default for GmresOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-8,
            atol: 1e-12,
            restart: 30,
            max_iter: 200,
            preconditioning: Preconditioning::None,
            verbose: false,
        }
    }
}

/// Restarted GMRES solver; the operator is used action-only.
pub struct Gmres<V> {
    pub opts: GmresOptions,
    pc: Option<Box<dyn Preconditioner<V>>>,
}

impl<V: VectorOps> Gmres<V> {
    pub fn new(opts: GmresOptions) -> Self {
        Self { opts, pc: None }
    }

    pub fn with_preconditioner(mut self, pc: Box<dyn Preconditioner<V>>) -> Self {
        self.pc = Some(pc);
        self
    }

    fn precondition(&self, r: &V) -> Result<V, LinearError> {
        let mut z = r.zeros_like();
        match &self.pc {
            Some(pc) => pc.apply(r, &mut z)?,
            None => z = r.clone(),
        }
        Ok(z)
    }

    fn run<A: LinOp<V>>(&self, a: &A, b: &V) -> Result<(V, SolveStats), LinearError> {
        let restart = self.opts.restart.max(1);
        let norm_b = b.norm();
        let target = self.opts.atol.max(self.opts.rtol * norm_b);
        let mut x = b.zeros_like();

        if norm_b <= self.opts.atol {
            return Ok((
                x,
                SolveStats {
                    iterations: 0,
                    final_residual: norm_b,
                    converged: true,
                },
            ));
        }

        let left = matches!(self.opts.preconditioning, Preconditioning::Left) && self.pc.is_some();
        let right = matches!(self.opts.preconditioning, Preconditioning::Right) && self.pc.is_some();

        let mut iteration = 0usize;
        let mut true_residual = norm_b;

        while iteration < self.opts.max_iter {
            // r = b − A·x, preconditioned when running left-preconditioned.
            let mut ax = b.zeros_like();
            a.apply(&x, &mut ax);
            let mut r = b.clone();
            r.axpy(-1.0, &ax);
            true_residual = r.norm();
            if true_residual <= target {
                break;
            }
            if left {
                r = self.precondition(&r)?;
            }
            let beta = r.norm();
            if beta < BREAKDOWN_EPS {
                break;
            }

            let mut v_basis: Vec<V> = Vec::with_capacity(restart + 1);
            let mut v0 = r;
            v0.scale(1.0 / beta);
            v_basis.push(v0);

            let mut h = vec![vec![0.0; restart]; restart + 1];
            let mut g = vec![0.0; restart + 1];
            g[0] = beta;
            let mut cs = vec![0.0; restart];
            let mut sn = vec![0.0; restart];
            let mut m = 0usize;

            for j in 0..restart {
                iteration += 1;

                // w = (M⁻¹A, A·M⁻¹ or A) v_j depending on the side.
                let mut w = b.zeros_like();
                if right {
                    let z = self.precondition(&v_basis[j])?;
                    a.apply(&z, &mut w);
                } else {
                    a.apply(&v_basis[j], &mut w);
                    if left {
                        w = self.precondition(&w)?;
                    }
                }

                // Modified Gram-Schmidt with one refinement pass.
                for i in 0..=j {
                    h[i][j] = w.dot(&v_basis[i]);
                    w.axpy(-h[i][j], &v_basis[i]);
                }
                for i in 0..=j {
                    let correction = w.dot(&v_basis[i]);
                    h[i][j] += correction;
                    w.axpy(-correction, &v_basis[i]);
                }
                h[j + 1][j] = w.norm();

                let breakdown = h[j + 1][j].abs() < BREAKDOWN_EPS;
                if !breakdown {
                    w.scale(1.0 / h[j + 1][j]);
                    v_basis.push(w);
                }

                apply_givens(&mut h, &mut g, &mut cs, &mut sn, j);
                m = j + 1;
                let res_norm = g[j + 1].abs();
                if self.opts.verbose {
                    debug!("gmres iter {iteration}: residual {res_norm:.3e}");
                }
                if breakdown || res_norm <= target || iteration >= self.opts.max_iter {
                    break;
                }
            }

            // Least-squares coefficients, then the solution update.
            let mut y = vec![0.0; m];
            back_substitute(&h, &g, &mut y, m);
            if right {
                let mut z = b.zeros_like();
                for (yj, vj) in y.iter().zip(v_basis.iter()) {
                    z.axpy(*yj, vj);
                }
                let zt = self.precondition(&z)?;
                x.axpy(1.0, &zt);
            } else {
                for (yj, vj) in y.iter().zip(v_basis.iter()) {
                    x.axpy(*yj, vj);
                }
            }
        }

        // Authoritative convergence check on the true residual.
        let mut ax = b.zeros_like();
        a.apply(&x, &mut ax);
        let mut r = b.clone();
        r.axpy(-1.0, &ax);
        true_residual = r.norm();

        Ok((
            x,
            SolveStats {
                iterations: iteration,
                final_residual: true_residual,
                converged: true_residual <= target,
            },
        ))
    }
}

impl<A, V> LinearSolver<A, V> for Gmres<V>
where
    A: LinOp<V>,
    V: VectorOps,
{
    fn solve(&mut self, j: &A, b: &V) -> Result<(V, SolveStats), LinearError> {
        self.run(j, b)
    }

    fn solve_shifted(&mut self, j: &A, b: &V, sigma: f64) -> Result<(V, SolveStats), LinearError> {
        if sigma == 0.0 {
            return self.run(j, b);
        }
        let shifted = ShiftedOp { inner: j, sigma };
        self.run(&shifted, b)
    }
}

/// v ↦ J·v + σ·v, the action of J + σI.
struct ShiftedOp<'a, A> {
    inner: &'a A,
    sigma: f64,
}

impl<A: LinOp<V>, V: VectorOps> LinOp<V> for ShiftedOp<'_, A> {
    fn apply(&self, x: &V, y: &mut V) {
        self.inner.apply(x, y);
        y.axpy(self.sigma, x);
    }

    fn dim(&self) -> usize {
        self.inner.dim()
    }
}

fn apply_givens(h: &mut [Vec<f64>], g: &mut [f64], cs: &mut [f64], sn: &mut [f64], j: usize) {
    for i in 0..j {
        let temp = cs[i] * h[i][j] + sn[i] * h[i + 1][j];
        h[i + 1][j] = -sn[i] * h[i][j] + cs[i] * h[i + 1][j];
        h[i][j] = temp;
    }
    let h_kk = h[j][j];
    let h_k1k = h[j + 1][j];
    let r = (h_kk * h_kk + h_k1k * h_k1k).sqrt();
    if r.abs() < BREAKDOWN_EPS {
        cs[j] = 1.0;
        sn[j] = 0.0;
    } else {
        cs[j] = h_kk / r;
        sn[j] = h_k1k / r;
    }
    h[j][j] = cs[j] * h_kk + sn[j] * h_k1k;
    h[j + 1][j] = 0.0;
    let temp = cs[j] * g[j] + sn[j] * g[j + 1];
    g[j + 1] = -sn[j] * g[j] + cs[j] * g[j + 1];
    g[j] = temp;
}

fn back_substitute(h: &[Vec<f64>], g: &[f64], y: &mut [f64], m: usize) {
    for i in (0..m).rev() {
        y[i] = g[i];
        for j in (i + 1)..m {
            y[i] -= h[i][j] * y[j];
        }
        if h[i][i].abs() > BREAKDOWN_EPS {
            y[i] /= h[i][i];
        } else {
            y[i] = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, DVector};

    struct DiagScaling {
        inv_diag: DVector<f64>,
    }

    impl Preconditioner<DVector<f64>> for DiagScaling {
        fn apply(&self, r: &DVector<f64>, z: &mut DVector<f64>) -> Result<(), LinearError> {
            z.copy_from(&r.component_mul(&self.inv_diag));
            Ok(())
        }
    }

    fn test_system() -> (DMatrix<f64>, DVector<f64>, DVector<f64>) {
        let a = DMatrix::from_row_slice(
            4,
            4,
            &[
                4.0, 1.0, 0.0, 0.0, //
                1.0, 3.0, 1.0, 0.0, //
                0.0, 1.0, 2.0, 1.0, //
                0.0, 0.0, 1.0, 3.0,
            ],
        );
        let x_true = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        let b = &a * &x_true;
        (a, x_true, b)
    }

    #[test]
    fn gmres_solves_well_conditioned_nonsym() {
        let (a, x_true, b) = test_system();
        let mut solver = Gmres::new(GmresOptions {
            rtol: 1e-12,
            ..GmresOptions::default()
        });
        let (x, stats) = solver.solve(&a, &b).unwrap();
        assert!(stats.converged, "GMRES did not converge: {stats:?}");
        assert!((x - x_true).norm() < 1e-8);
    }

    #[test]
    fn gmres_with_diagonal_preconditioner() {
        let (a, x_true, b) = test_system();
        let inv_diag = DVector::from_iterator(4, (0..4).map(|i| 1.0 / a[(i, i)]));
        for side in [Preconditioning::Left, Preconditioning::Right] {
            let mut solver = Gmres::new(GmresOptions {
                rtol: 1e-12,
                preconditioning: side,
                ..GmresOptions::default()
            })
            .with_preconditioner(Box::new(DiagScaling {
                inv_diag: inv_diag.clone(),
            }));
            let (x, stats) = solver.solve(&a, &b).unwrap();
            assert!(stats.converged, "side {side:?} did not converge");
            assert!((x - &x_true).norm() < 1e-8, "side {side:?} inaccurate");
        }
    }

    #[test]
    fn shifted_solve_matches_explicitly_shifted_matrix() {
        let (a, _, b) = test_system();
        let sigma = 0.35;
        let mut solver = Gmres::new(GmresOptions {
            rtol: 1e-12,
            ..GmresOptions::default()
        });
        let (x, stats) = solver.solve_shifted(&a, &b, sigma).unwrap();
        assert!(stats.converged);

        let mut shifted = a.clone();
        for i in 0..4 {
            shifted[(i, i)] += sigma;
        }
        let expected = shifted.lu().solve(&b).unwrap();
        assert!((x - expected).norm() < 1e-7);
    }

    #[test]
    fn non_convergence_reports_current_iterate() {
        let (a, _, b) = test_system();
        let mut solver = Gmres::new(GmresOptions {
            rtol: 1e-15,
            atol: 0.0,
            restart: 2,
            max_iter: 2,
            ..GmresOptions::default()
        });
        let (x, stats) = solver.solve(&a, &b).unwrap();
        assert!(!stats.converged);
        assert!(stats.iterations <= 2);
        assert!(VectorOps::is_finite(&x));
    }
}

//! Minimally augmented refinement of fold points.
//!
//! A fold satisfies F(x, p) = 0 together with singularity of the Jacobian.
//! The singularity is measured through the bordered system
//!
//! ```text
//! [ J   a ] [ w ]   [ 0 ]
//! [ bᵀ  0 ] [ σ ] = [ 1 ]
//! ```
//!
//! whose multiplier σ vanishes exactly where J loses rank, so Newton on
//! G(x, p) = (F(x, p); σ(x, p)) converges to the fold as a regular root.
//! The borders a, b are fixed approximate null/left-null vectors taken
//! from the detected fold. Fold continuation in a second parameter reuses
//! the continuation loop with G in place of F; Hopf refinement follows
//! the same pattern with unknowns (x, p, ω) in complex arithmetic.

use anyhow::{anyhow, bail, Result};
use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::continuation::{BifurcationKind, Branch};
use crate::newton::NewtonOptions;
use crate::{FD_FOLD_STEP, FD_PARAM_STEP};

/// Refined fold point. `ell` is the bordered multiplier σ, zero at the
/// exact fold.
#[derive(Debug, Clone)]
pub struct FoldPoint {
    pub x: DVector<f64>,
    pub p: f64,
    pub ell: f64,
}

/// User-supplied second-derivative action (∂J(x, p)[δx])·w.
pub type SecondDerivative<'a> =
    dyn Fn(&DVector<f64>, f64, &DVector<f64>, &DVector<f64>) -> DVector<f64> + 'a;

/// Adjoint Jacobian Jᵀ(x, p), used to re-condition the left border.
pub type AdjointJacobian<'a> = dyn Fn(&DVector<f64>, f64) -> Result<DMatrix<f64>> + 'a;

/// The augmented system G(x, p) = (F; σ) whose regular root is a fold.
pub struct FoldProblem<FR, JF> {
    f: FR,
    jac: JF,
    a: DVector<f64>,
    b: DVector<f64>,
}

impl<FR, JF> FoldProblem<FR, JF>
where
    FR: FnMut(&DVector<f64>, f64) -> Result<DVector<f64>>,
    JF: FnMut(&DVector<f64>, f64) -> Result<DMatrix<f64>>,
{
    /// Build the problem with explicit border vectors.
    pub fn new(f: FR, jac: JF, a: DVector<f64>, b: DVector<f64>) -> Result<Self> {
        if a.nrows() != b.nrows() {
            bail!("border vectors must share a dimension");
        }
        if a.norm() == 0.0 || b.norm() == 0.0 {
            bail!("border vectors must be non-zero");
        }
        Ok(Self { f, jac, a, b })
    }

    /// Seed the problem from a fold marker on a branch: borders come from
    /// the SVD null/left-null vectors of J at the marked point, the
    /// initial guess from the marked solution and the bracketed parameter.
    pub fn from_marker(
        f: FR,
        mut jac: JF,
        branch: &Branch<DVector<f64>>,
        marker_index: usize,
    ) -> Result<(Self, DVector<f64>, f64)> {
        let marker = branch
            .markers
            .get(marker_index)
            .ok_or_else(|| anyhow!("branch has no marker with index {marker_index}"))?;
        if marker.kind != BifurcationKind::Fold {
            bail!("marker {marker_index} is not a fold");
        }
        let point = branch
            .points
            .get(marker.index)
            .ok_or_else(|| anyhow!("marker points past the end of the branch"))?;

        let x0 = point.x.clone();
        let p0 = marker.bracketed_param;
        let j = jac(&x0, p0)?;
        let (a, b) = null_borders(&j)?;
        Ok((Self { f, jac, a, b }, x0, p0))
    }

    /// G(x, p) stacked as an (N+1)-vector, for plugging the fold system
    /// into an outer continuation run.
    pub fn residual(&mut self, x: &DVector<f64>, p: f64) -> Result<DVector<f64>> {
        let fx = (self.f)(x, p)?;
        let j = (self.jac)(x, p)?;
        let (sigma, _) = self.sigma(&j)?;
        let n = fx.nrows();
        let mut g = DVector::zeros(n + 1);
        g.rows_mut(0, n).copy_from(&fx);
        g[n] = sigma;
        Ok(g)
    }

    /// Solve the bordered system for (w, σ) at a given Jacobian.
    fn sigma(&self, j: &DMatrix<f64>) -> Result<(f64, DVector<f64>)> {
        let n = j.nrows();
        let mut bordered = DMatrix::zeros(n + 1, n + 1);
        bordered.view_mut((0, 0), (n, n)).copy_from(j);
        for i in 0..n {
            bordered[(i, n)] = self.a[i];
            bordered[(n, i)] = self.b[i];
        }
        let mut rhs = DVector::zeros(n + 1);
        rhs[n] = 1.0;
        let Some(solution) = bordered.lu().solve(&rhs) else {
            bail!("fold bordered system is singular");
        };
        Ok((solution[n], solution.rows(0, n).into_owned()))
    }

    /// Adjoint bordered solve for the left vector u with ⟨a, u⟩ = 1.
    fn sigma_adjoint(&self, jt: &DMatrix<f64>) -> Result<DVector<f64>> {
        let n = jt.nrows();
        let mut bordered = DMatrix::zeros(n + 1, n + 1);
        bordered.view_mut((0, 0), (n, n)).copy_from(jt);
        for i in 0..n {
            bordered[(i, n)] = self.b[i];
            bordered[(n, i)] = self.a[i];
        }
        let mut rhs = DVector::zeros(n + 1);
        rhs[n] = 1.0;
        let Some(solution) = bordered.lu().solve(&rhs) else {
            bail!("adjoint fold bordered system is singular");
        };
        Ok(solution.rows(0, n).into_owned())
    }

    /// Newton refinement of the fold from (x0, p0).
    ///
    /// The σ-row of the Newton matrix uses one-sided finite differences
    /// with step [`FD_FOLD_STEP`] unless `d2f` supplies the exact
    /// second-derivative action. A supplied adjoint refreshes the left
    /// border each iteration, conditioning the bordered solves.
    pub fn refine(
        &mut self,
        x0: DVector<f64>,
        p0: f64,
        opts: &NewtonOptions,
        jadj: Option<&AdjointJacobian<'_>>,
        d2f: Option<&SecondDerivative<'_>>,
    ) -> Result<(FoldPoint, Vec<f64>, bool)> {
        let n = x0.nrows();
        let mut x = x0;
        let mut p = p0;
        let mut history = Vec::new();

        for iteration in 0..=opts.max_iter {
            let j = (self.jac)(&x, p)?;

            if let Some(adj) = jadj {
                let jt = adj(&x, p)?;
                if let Ok(u) = self.sigma_adjoint(&jt) {
                    let norm = u.norm();
                    if norm > 0.0 && u.iter().all(|v| v.is_finite()) {
                        self.b = u / norm;
                    }
                }
            }

            let fx = (self.f)(&x, p)?;
            let (sigma, w) = self.sigma(&j)?;
            let g_norm = (fx.norm_squared() + sigma * sigma).sqrt();
            if !g_norm.is_finite() {
                bail!("fold residual became non-finite");
            }
            history.push(g_norm);
            if opts.verbose {
                debug!("fold refine iter {iteration}: ||G|| = {g_norm:.3e}");
            }
            if g_norm <= opts.tol {
                return Ok((FoldPoint { x, p, ell: sigma }, history, true));
            }
            if iteration == opts.max_iter {
                break;
            }

            // Assemble the (N+1)² Newton matrix on (x, p).
            let mut system = DMatrix::zeros(n + 1, n + 1);
            system.view_mut((0, 0), (n, n)).copy_from(&j);

            let f_shifted = (self.f)(&x, p + FD_PARAM_STEP)?;
            for i in 0..n {
                system[(i, n)] = (f_shifted[i] - fx[i]) / FD_PARAM_STEP;
            }

            match d2f {
                Some(hessian) => {
                    let u = self.sigma_adjoint(&j.transpose())?;
                    let mut e = DVector::zeros(n);
                    for i in 0..n {
                        e[i] = 1.0;
                        let jw = hessian(&x, p, &w, &e);
                        system[(n, i)] = -u.dot(&jw);
                        e[i] = 0.0;
                    }
                }
                None => {
                    for i in 0..n {
                        let mut x_pert = x.clone();
                        x_pert[i] += FD_FOLD_STEP;
                        let j_pert = (self.jac)(&x_pert, p)?;
                        let (sigma_pert, _) = self.sigma(&j_pert)?;
                        system[(n, i)] = (sigma_pert - sigma) / FD_FOLD_STEP;
                    }
                }
            }
            let j_p = (self.jac)(&x, p + FD_FOLD_STEP)?;
            let (sigma_p, _) = self.sigma(&j_p)?;
            system[(n, n)] = (sigma_p - sigma) / FD_FOLD_STEP;

            let mut rhs = DVector::zeros(n + 1);
            for i in 0..n {
                rhs[i] = -fx[i];
            }
            rhs[n] = -sigma;

            let Some(delta) = system.lu().solve(&rhs) else {
                debug!("fold refinement linear solve failed at iteration {iteration}");
                return Ok((FoldPoint { x, p, ell: sigma }, history, false));
            };
            for i in 0..n {
                x[i] += delta[i];
            }
            p += delta[n];
        }

        let j = (self.jac)(&x, p)?;
        let (sigma, _) = self.sigma(&j)?;
        Ok((FoldPoint { x, p, ell: sigma }, history, false))
    }
}

/// Newton refinement of the `marker_index`-th fold marker on `branch`.
///
/// The optional adjoint Jacobian improves the conditioning of the
/// bordered solves; it is not required for convergence.
pub fn newton_fold<FR, JF>(
    f: FR,
    jac: JF,
    jadj: Option<&AdjointJacobian<'_>>,
    branch: &Branch<DVector<f64>>,
    marker_index: usize,
    opts: &NewtonOptions,
) -> Result<(FoldPoint, Vec<f64>, bool)>
where
    FR: FnMut(&DVector<f64>, f64) -> Result<DVector<f64>>,
    JF: FnMut(&DVector<f64>, f64) -> Result<DMatrix<f64>>,
{
    let (mut problem, x0, p0) = FoldProblem::from_marker(f, jac, branch, marker_index)?;
    problem.refine(x0, p0, opts, jadj, None)
}

/// Approximate null and left-null vectors of J from its smallest singular
/// triplet.
fn null_borders(j: &DMatrix<f64>) -> Result<(DVector<f64>, DVector<f64>)> {
    let n = j.nrows();
    if n == 0 {
        bail!("cannot initialise borders for an empty Jacobian");
    }
    let svd = j.clone().svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        bail!("SVD failed while initialising fold borders");
    };
    let mut min_idx = 0usize;
    let mut min_val = f64::INFINITY;
    for (i, &value) in svd.singular_values.iter().enumerate() {
        if value.is_finite() && value < min_val {
            min_val = value;
            min_idx = i;
        }
    }
    let a: DVector<f64> = v_t.row(min_idx).transpose();
    let b: DVector<f64> = u.column(min_idx).into_owned();
    let (a_norm, b_norm) = (a.norm(), b.norm());
    if a_norm == 0.0 || b_norm == 0.0 {
        bail!("degenerate singular vectors while initialising fold borders");
    }
    Ok((a / a_norm, b / b_norm))
}

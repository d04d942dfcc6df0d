//! Pseudo-arclength continuation of F(x, p) = 0.
//!
//! The loop follows the classical predictor/corrector scheme: extrapolate
//! along the branch tangent, correct with Newton on the bordered system
//! (the residual stacked with the arclength equation), adapt the step on
//! acceptance or rejection, update the tangent, and watch the parameter
//! component of the tangent for fold crossings.

pub mod bordered;
pub mod tangent;
pub mod types;

pub use bordered::{BorderedSolver, BorderingLemma, DenseBordered};
pub use tangent::Tangent;
pub use types::{
    BifurcationKind, BifurcationMarker, Branch, BranchPoint, ContinuationOptions,
    ContinuationRun, TangentAlgorithm, Termination,
};

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};

use crate::newton::NewtonOptions;
use crate::vector::VectorOps;
use crate::FD_PARAM_STEP;

/// Per-step user hook: (x, tangent, point index, branch so far) → keep
/// going? Returning false ends the run cleanly after the current point.
pub type FinaliseHook<'a, V> = dyn FnMut(&V, &Tangent<V>, usize, &Branch<V>) -> bool + 'a;

/// Trace the solution branch of F(x, p) = 0 through (x0, p0).
///
/// `x0` is corrected at fixed `p0` first; the sign of `opts.ds0` selects
/// the initial direction along the branch. Ordinary numerical trouble
/// (corrector or linear-solver non-convergence) is folded into step
/// rejection and, ultimately, a [`Termination`] tag; `Err` is reserved
/// for a failed initial solve, invalid options and non-finite residuals.
#[allow(clippy::too_many_arguments)]
pub fn continuation<V, J, FR, JF, B>(
    mut f: FR,
    mut jac: JF,
    x0: V,
    p0: f64,
    opts: &ContinuationOptions,
    solver: &mut B,
    mut finalise: Option<&mut FinaliseHook<'_, V>>,
    norm: Option<&dyn Fn(&V) -> f64>,
) -> Result<ContinuationRun<V>>
where
    V: VectorOps,
    FR: FnMut(&V, f64) -> Result<V>,
    JF: FnMut(&V, f64) -> Result<J>,
    B: BorderedSolver<J, V>,
{
    opts.validate()?;
    let mut theta = opts.theta;

    // Correct the starting guess at fixed p0. A zero border row on x with
    // a unit entry on p pins the parameter, so the same bordered machinery
    // serves as a plain Newton solve.
    let fixed_border = Tangent {
        dx: x0.zeros_like(),
        dp: 1.0,
    };
    let init = correct(
        &mut f,
        &mut jac,
        x0.clone(),
        p0,
        &fixed_border,
        &x0,
        p0,
        0.0,
        theta,
        &opts.newton,
        solver,
        norm,
    )
    .context("initial Newton solve failed")?;
    if !init.converged {
        bail!(
            "initial Newton solve did not converge at p = {p0} ({} iterations)",
            init.iterations
        );
    }
    let mut x = init.x;
    let mut p = init.p;

    // First tangent: one-shot bordered solve against the seed (0, 1).
    let seed = Tangent::seed(&x);
    let (j0, dfdp0) = jacobian_and_dfdp(&mut f, &mut jac, &x, p)?;
    let mut branch_tangent = tangent::bordered(&j0, &dfdp0, &seed, theta, solver)
        .context("initial tangent computation failed")?;
    if opts.arclength_scaling {
        theta = tangent::rebalanced_theta(&branch_tangent);
        branch_tangent.normalize(theta)?;
    }

    let mut branch = Branch::new();
    branch.points.push(BranchPoint {
        x: x.clone(),
        p,
        ds: 0.0,
        norm_x: x.norm(),
    });

    let mut tau_prev = branch_tangent.dp;
    let mut ds = clamp_step(opts.ds0, opts);
    let mut floor_rejections = 0usize;
    let mut accepted = 0usize;
    let mut reason = Termination::MaxSteps;

    while accepted < opts.max_steps {
        // Predict.
        let mut x_pred = x.clone();
        x_pred.axpy(ds, &branch_tangent.dx);
        let p_pred = p + ds * branch_tangent.dp;

        // Correct against the arclength equation.
        let outcome = correct(
            &mut f,
            &mut jac,
            x_pred,
            p_pred,
            &branch_tangent,
            &x,
            p,
            ds,
            theta,
            &opts.newton,
            solver,
            norm,
        )?;

        let accept = outcome.converged && outcome.iterations <= opts.desired_newton_iters;
        if !accept {
            debug!(
                "step rejected at ds = {ds:.3e} ({} iterations, converged: {})",
                outcome.iterations, outcome.converged
            );
            if ds.abs() <= opts.ds_min * (1.0 + 1e-12) {
                floor_rejections += 1;
                if floor_rejections >= 2 {
                    warn!("continuation stopped: step size floor reached near p = {p:.6}");
                    reason = Termination::StepSizeFloor;
                    break;
                }
            } else {
                floor_rejections = 0;
            }
            ds = clamp_step(ds * opts.step_shrink, opts);
            continue;
        }

        floor_rejections = 0;
        let x_prev = std::mem::replace(&mut x, outcome.x);
        let p_prev = p;
        p = outcome.p;
        accepted += 1;

        // Tangent update.
        let prev_tangent = branch_tangent.clone();
        branch_tangent = match opts.tangent_algorithm {
            TangentAlgorithm::Secant => {
                tangent::secant(&x, p, &x_prev, p_prev, ds, theta, &prev_tangent)?
            }
            TangentAlgorithm::Bordered => {
                let (j_new, dfdp_new) = jacobian_and_dfdp(&mut f, &mut jac, &x, p)?;
                tangent::bordered(&j_new, &dfdp_new, &prev_tangent, theta, solver)?
            }
        };
        if opts.arclength_scaling {
            let rebalanced = tangent::rebalanced_theta(&branch_tangent);
            if (rebalanced - theta).abs() > 1e-12 {
                theta = rebalanced;
                branch_tangent.normalize(theta)?;
            }
        }

        branch.points.push(BranchPoint {
            x: x.clone(),
            p,
            ds,
            norm_x: x.norm(),
        });
        debug!(
            "step {accepted}: p = {p:.6}, ds = {ds:.3e}, {} corrector iterations",
            outcome.iterations
        );

        // Fold detection: the parameter component of the tangent changes
        // sign across a fold.
        let tau = branch_tangent.dp;
        if opts.detect_fold && tau_prev * tau < 0.0 {
            let bracketed = p_prev - tau_prev * (p - p_prev) / (tau - tau_prev);
            info!("fold bracketed near p = {bracketed:.6}");
            branch.markers.push(BifurcationMarker {
                index: branch.points.len() - 1,
                kind: BifurcationKind::Fold,
                bracketed_param: bracketed,
                eigenvalues: None,
            });
        }
        tau_prev = tau;

        if let Some(hook) = finalise.as_mut() {
            if !hook(&x, &branch_tangent, branch.points.len() - 1, &branch) {
                info!("continuation stopped by finalise hook at p = {p:.6}");
                reason = Termination::UserAbort;
                break;
            }
        }

        if p < opts.p_min || p > opts.p_max {
            info!("parameter left [{}, {}] at p = {p:.6}", opts.p_min, opts.p_max);
            reason = Termination::ParameterBound;
            break;
        }

        ds = clamp_step(ds * opts.step_growth, opts);
    }

    Ok(ContinuationRun {
        branch,
        x,
        p,
        reason,
    })
}

struct CorrectorOutcome<V> {
    x: V,
    p: f64,
    iterations: usize,
    converged: bool,
}

/// Newton iteration on the bordered residual
/// R̃(x, p) = [F(x, p); θ·⟨x − x_ref, dx⟩/N + (1−θ)·(p − p_ref)·dp − ds].
///
/// ∂F/∂p is taken by forward difference with step [`FD_PARAM_STEP`].
/// Linear-solve failure and the iteration cap come back as
/// `converged = false`; non-finite residuals are hard errors.
#[allow(clippy::too_many_arguments)]
fn correct<V, J, FR, JF, B>(
    f: &mut FR,
    jac: &mut JF,
    x_start: V,
    p_start: f64,
    border: &Tangent<V>,
    x_ref: &V,
    p_ref: f64,
    ds: f64,
    theta: f64,
    opts: &NewtonOptions,
    solver: &mut B,
    norm: Option<&dyn Fn(&V) -> f64>,
) -> Result<CorrectorOutcome<V>>
where
    V: VectorOps,
    FR: FnMut(&V, f64) -> Result<V>,
    JF: FnMut(&V, f64) -> Result<J>,
    B: BorderedSolver<J, V>,
{
    let nn = x_ref.len() as f64;
    let norm_of = |r: &V| match norm {
        Some(func) => func(r),
        None => r.norm(),
    };
    let constraint = |x: &V, p: f64| {
        let mut d = x.clone();
        d.axpy(-1.0, x_ref);
        theta * d.dot(&border.dx) / nn + (1.0 - theta) * (p - p_ref) * border.dp - ds
    };

    let mut x = x_start;
    let mut p = p_start;
    let mut r = f(&x, p)?;
    let mut c = constraint(&x, p);
    let mut res = (norm_of(&r).powi(2) + c * c).sqrt();
    if !res.is_finite() {
        bail!("corrector residual is non-finite at the predicted point");
    }
    let mut iterations = 0usize;

    loop {
        if res <= opts.tol {
            return Ok(CorrectorOutcome {
                x,
                p,
                iterations,
                converged: true,
            });
        }
        if iterations >= opts.max_iter {
            return Ok(CorrectorOutcome {
                x,
                p,
                iterations,
                converged: false,
            });
        }

        let j = jac(&x, p)?;
        let r_shifted = f(&x, p + FD_PARAM_STEP)?;
        let mut dfdp = r_shifted;
        dfdp.axpby(-1.0 / FD_PARAM_STEP, &r, 1.0 / FD_PARAM_STEP);

        let (du, dv, stats) = match solver.solve_bordered(
            &j,
            &dfdp,
            &border.dx,
            border.dp,
            theta,
            &r,
            c,
        ) {
            Ok(solved) => solved,
            Err(err) => {
                debug!("corrector linear solve failed: {err}");
                return Ok(CorrectorOutcome {
                    x,
                    p,
                    iterations,
                    converged: false,
                });
            }
        };
        if !stats.converged {
            debug!(
                "corrector linear solver stalled ({} iterations, residual {:.3e})",
                stats.iterations, stats.final_residual
            );
            return Ok(CorrectorOutcome {
                x,
                p,
                iterations,
                converged: false,
            });
        }

        let mut alpha = 1.0;
        let mut x_trial = x.clone();
        x_trial.axpy(-alpha, &du);
        let mut p_trial = p - alpha * dv;
        let mut r_trial = f(&x_trial, p_trial)?;
        let mut c_trial = constraint(&x_trial, p_trial);
        let mut res_trial = (norm_of(&r_trial).powi(2) + c_trial * c_trial).sqrt();
        if opts.linesearch {
            for _ in 0..5 {
                if res_trial < res {
                    break;
                }
                alpha *= 0.5;
                x_trial = x.clone();
                x_trial.axpy(-alpha, &du);
                p_trial = p - alpha * dv;
                r_trial = f(&x_trial, p_trial)?;
                c_trial = constraint(&x_trial, p_trial);
                res_trial = (norm_of(&r_trial).powi(2) + c_trial * c_trial).sqrt();
            }
        }

        x = x_trial;
        p = p_trial;
        r = r_trial;
        c = c_trial;
        res = res_trial;
        if !res.is_finite() {
            bail!("corrector residual became non-finite at iteration {}", iterations + 1);
        }
        iterations += 1;
    }
}

fn jacobian_and_dfdp<V, J, FR, JF>(
    f: &mut FR,
    jac: &mut JF,
    x: &V,
    p: f64,
) -> Result<(J, V)>
where
    V: VectorOps,
    FR: FnMut(&V, f64) -> Result<V>,
    JF: FnMut(&V, f64) -> Result<J>,
{
    let j = jac(x, p)?;
    let r = f(x, p)?;
    let r_shifted = f(x, p + FD_PARAM_STEP)?;
    let mut dfdp = r_shifted;
    dfdp.axpby(-1.0 / FD_PARAM_STEP, &r, 1.0 / FD_PARAM_STEP);
    Ok((j, dfdp))
}

/// Clamp the magnitude of a signed step into [ds_min, ds_max].
fn clamp_step(ds: f64, opts: &ContinuationOptions) -> f64 {
    ds.signum() * ds.abs().clamp(opts.ds_min, opts.ds_max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newton::NewtonOptions;
    use nalgebra::{DMatrix, DVector};

    fn quad_f(x: &DVector<f64>, p: f64) -> Result<DVector<f64>> {
        Ok(DVector::from_vec(vec![x[0] * x[0] - p]))
    }

    fn quad_j(x: &DVector<f64>, _p: f64) -> Result<DMatrix<f64>> {
        Ok(DMatrix::from_row_slice(1, 1, &[2.0 * x[0]]))
    }

    fn quad_opts() -> ContinuationOptions {
        ContinuationOptions {
            ds0: -0.01,
            ds_min: 1e-6,
            ds_max: 0.02,
            p_min: -1.0,
            p_max: 4.0,
            max_steps: 600,
            newton: NewtonOptions {
                tol: 1e-10,
                max_iter: 10,
                ..NewtonOptions::default()
            },
            ..ContinuationOptions::default()
        }
    }

    #[test]
    fn scalar_quadratic_traverses_the_fold() {
        let mut solver = DenseBordered::new();
        let run = continuation(
            quad_f,
            quad_j,
            DVector::from_vec(vec![1.0]),
            1.0,
            &quad_opts(),
            &mut solver,
            None,
            None,
        )
        .unwrap();

        assert!(
            run.branch.points.iter().any(|pt| pt.x[0] < -1.0),
            "branch never reached the x < 0 side"
        );

        let folds: Vec<_> = run
            .branch
            .markers
            .iter()
            .filter(|m| m.kind == BifurcationKind::Fold)
            .collect();
        assert_eq!(folds.len(), 1, "expected one fold marker, got {folds:?}");
        assert!(
            folds[0].bracketed_param.abs() <= 1e-3,
            "fold bracketed at p = {}, expected |p| <= 1e-3",
            folds[0].bracketed_param
        );
        assert!(folds[0].index >= 1);
        assert_eq!(run.reason, Termination::ParameterBound);
        assert!(run.p > 4.0);
    }

    #[test]
    fn accepted_steps_satisfy_the_arclength_equation() {
        let theta = 0.5;
        let mut records: Vec<(f64, f64)> = Vec::new();
        let mut hook = |_x: &DVector<f64>,
                        t: &Tangent<DVector<f64>>,
                        _idx: usize,
                        _branch: &Branch<DVector<f64>>| {
            records.push((t.dx[0], t.dp));
            true
        };

        let mut solver = DenseBordered::new();
        let opts = ContinuationOptions {
            theta,
            max_steps: 50,
            ..quad_opts()
        };
        let run = continuation(
            quad_f,
            quad_j,
            DVector::from_vec(vec![1.0]),
            1.0,
            &opts,
            &mut solver,
            Some(&mut hook),
            None,
        )
        .unwrap();
        drop(hook);

        // Tangent normalisation along the whole branch.
        for (dx, dp) in &records {
            let arc = theta * dx * dx + (1.0 - theta) * dp * dp;
            assert!((arc - 1.0).abs() < 1e-10, "tangent not normalised: {arc}");
        }

        // Records hold the tangent at points 1, 2, ...; check the step
        // from point k to k+1 against the tangent at point k.
        for k in 1..run.branch.points.len() - 1 {
            let (dx, dp) = records[k - 1];
            let a = &run.branch.points[k];
            let b = &run.branch.points[k + 1];
            let lhs = theta * (b.x[0] - a.x[0]) * dx + (1.0 - theta) * (b.p - a.p) * dp;
            assert!(
                (lhs - b.ds).abs() < 1e-8,
                "arclength equation off at step {k}: {lhs} vs {}",
                b.ds
            );
        }
    }

    #[test]
    fn fold_marker_sits_between_opposite_tangent_signs() {
        let mut taus: Vec<f64> = Vec::new();
        let mut hook = |_x: &DVector<f64>,
                        t: &Tangent<DVector<f64>>,
                        _idx: usize,
                        _branch: &Branch<DVector<f64>>| {
            taus.push(t.dp);
            true
        };
        let mut solver = DenseBordered::new();
        let run = continuation(
            quad_f,
            quad_j,
            DVector::from_vec(vec![1.0]),
            1.0,
            &quad_opts(),
            &mut solver,
            Some(&mut hook),
            None,
        )
        .unwrap();
        drop(hook);

        for marker in &run.branch.markers {
            // taus[k - 1] is the tangent dp at point k.
            let before = taus[marker.index - 2];
            let after = taus[marker.index - 1];
            assert!(
                before * after < 0.0,
                "marker at index {} not bracketed by a sign change",
                marker.index
            );
            let p_lo = run.branch.points[marker.index - 1].p.min(run.branch.points[marker.index].p);
            let p_hi = run.branch.points[marker.index - 1].p.max(run.branch.points[marker.index].p);
            let tol = 1e-9;
            assert!(
                marker.bracketed_param >= p_lo - tol && marker.bracketed_param <= p_hi + tol,
                "bracketed parameter {} outside [{p_lo}, {p_hi}]",
                marker.bracketed_param
            );
        }
        assert!(!run.branch.markers.is_empty());
    }

    #[test]
    fn finalise_hook_aborts_cleanly() {
        let mut calls = 0usize;
        let mut hook = |_x: &DVector<f64>,
                        _t: &Tangent<DVector<f64>>,
                        _idx: usize,
                        _branch: &Branch<DVector<f64>>| {
            calls += 1;
            calls < 5
        };
        let mut solver = DenseBordered::new();
        let run = continuation(
            quad_f,
            quad_j,
            DVector::from_vec(vec![1.0]),
            1.0,
            &quad_opts(),
            &mut solver,
            Some(&mut hook),
            None,
        )
        .unwrap();
        assert_eq!(run.reason, Termination::UserAbort);
        // Seed point plus the five accepted steps, the last of which
        // triggered the abort.
        assert_eq!(run.branch.points.len(), 6);
    }

    #[test]
    fn repeated_rejection_at_the_floor_terminates() {
        let opts = ContinuationOptions {
            ds0: 0.5,
            ds_min: 0.25,
            ds_max: 0.5,
            max_steps: 20,
            newton: NewtonOptions {
                tol: 1e-12,
                max_iter: 1,
                ..NewtonOptions::default()
            },
            ..ContinuationOptions::default()
        };
        let mut solver = DenseBordered::new();
        let run = continuation(
            quad_f,
            quad_j,
            DVector::from_vec(vec![1.0]),
            1.0,
            &opts,
            &mut solver,
            None,
            None,
        )
        .unwrap();
        assert_eq!(run.reason, Termination::StepSizeFloor);
        assert_eq!(run.branch.points.len(), 1);
    }

    #[test]
    fn bordering_lemma_path_matches_the_dense_assembly() {
        let mut lemma = BorderingLemma::new(crate::linsolve::DenseLu::new());
        let run = continuation(
            quad_f,
            quad_j,
            DVector::from_vec(vec![1.0]),
            1.0,
            &quad_opts(),
            &mut lemma,
            None,
            None,
        )
        .unwrap();
        assert!(run.branch.points.iter().any(|pt| pt.x[0] < -1.0));
        assert_eq!(run.branch.markers.len(), 1);
        assert!(run.branch.markers[0].bracketed_param.abs() <= 1e-3);
    }

    #[test]
    fn bordered_tangent_algorithm_matches_secant_on_a_smooth_branch() {
        for algorithm in [TangentAlgorithm::Secant, TangentAlgorithm::Bordered] {
            let opts = ContinuationOptions {
                tangent_algorithm: algorithm,
                max_steps: 40,
                ..quad_opts()
            };
            let mut solver = DenseBordered::new();
            let run = continuation(
                quad_f,
                quad_j,
                DVector::from_vec(vec![1.0]),
                1.0,
                &opts,
                &mut solver,
                None,
                None,
            )
            .unwrap();
            // Every accepted point sits on the branch x² = p.
            for pt in &run.branch.points {
                assert!(
                    (pt.x[0] * pt.x[0] - pt.p).abs() < 1e-8,
                    "{algorithm:?} left the branch: x = {}, p = {}",
                    pt.x[0],
                    pt.p
                );
            }
        }
    }

    // Bratu-like boundary value problem, discretised to N = 100. The
    // branch folds twice between p = 3 and p = 4.1.
    pub(crate) const BRATU_N: usize = 100;

    pub(crate) fn bratu_f(x: &DVector<f64>, p: f64) -> Result<DVector<f64>> {
        let n = x.len();
        let h2 = ((n - 1) as f64).powi(2);
        let mut r = DVector::zeros(n);
        r[0] = x[0] - 0.01;
        r[n - 1] = x[n - 1] - 0.01;
        for i in 1..n - 1 {
            let xi = x[i];
            let source = (1.0 + xi + 0.5 * xi * xi) / (1.0 + 0.01 * xi * xi);
            r[i] = (x[i - 1] - 2.0 * xi + x[i + 1]) * h2 + p * source;
        }
        Ok(r)
    }

    pub(crate) fn bratu_j(x: &DVector<f64>, p: f64) -> Result<DMatrix<f64>> {
        let n = x.len();
        let h2 = ((n - 1) as f64).powi(2);
        let mut j = DMatrix::zeros(n, n);
        j[(0, 0)] = 1.0;
        j[(n - 1, n - 1)] = 1.0;
        for i in 1..n - 1 {
            let xi = x[i];
            let denom = 1.0 + 0.01 * xi * xi;
            let dsource =
                ((1.0 + xi) * denom - (1.0 + xi + 0.5 * xi * xi) * 0.02 * xi) / (denom * denom);
            j[(i, i - 1)] = h2;
            j[(i, i + 1)] = h2;
            j[(i, i)] = -2.0 * h2 + p * dsource;
        }
        Ok(j)
    }

    pub(crate) fn bratu_start() -> DVector<f64> {
        let n = BRATU_N;
        DVector::from_iterator(
            n,
            (0..n).map(|i| {
                let s = i as f64 * (n - 1 - i) as f64 / ((n - 1) as f64).powi(2);
                0.01 + s
            }),
        )
    }

    pub(crate) fn bratu_opts() -> ContinuationOptions {
        ContinuationOptions {
            ds0: 0.005,
            ds_min: 1e-5,
            ds_max: 0.05,
            theta: 0.91,
            p_min: 0.0,
            p_max: 4.1,
            max_steps: 500,
            newton: NewtonOptions {
                tol: 1e-9,
                max_iter: 12,
                linesearch: true,
                ..NewtonOptions::default()
            },
            desired_newton_iters: 12,
            ..ContinuationOptions::default()
        }
    }

    #[test]
    fn bratu_branch_has_two_folds() {
        let mut solver = DenseBordered::new();
        let run = continuation(
            bratu_f,
            bratu_j,
            bratu_start(),
            3.0,
            &bratu_opts(),
            &mut solver,
            None,
            None,
        )
        .unwrap();

        let folds: Vec<f64> = run
            .branch
            .markers
            .iter()
            .filter(|m| m.kind == BifurcationKind::Fold)
            .map(|m| m.bracketed_param)
            .collect();
        assert!(
            folds.len() >= 2,
            "expected two folds, found {}: {folds:?}",
            folds.len()
        );
        for p_fold in folds.iter().take(2) {
            assert!(
                (3.0..=4.1).contains(p_fold),
                "fold at p = {p_fold} outside [3.0, 4.1]"
            );
        }
    }
}

//! Damped Newton iteration over a user-supplied residual and Jacobian.

use anyhow::{bail, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::linsolve::LinearSolver;
use crate::vector::VectorOps;

const MAX_HALVINGS: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NewtonOptions {
    /// Residual norm threshold.
    pub tol: f64,
    pub max_iter: usize,
    /// Backtracking halving line search.
    pub linesearch: bool,
    pub verbose: bool,
}

impl Default for NewtonOptions {
    fn default() -> Self {
        Self {
            tol: 1e-10,
            max_iter: 25,
            linesearch: false,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewtonResult<V> {
    pub x: V,
    /// Residual norm at the start of every iteration, initial point included.
    pub residuals: Vec<f64>,
    pub iterations: usize,
    pub converged: bool,
}

/// Solve R(x) = 0 from `x0`.
///
/// An already-solved starting point returns unchanged after zero
/// iterations. Non-convergence (iteration cap, failed linear solve) is
/// reported through the `converged` flag with the last iterate attached;
/// a non-finite residual norm is a hard error.
pub fn newton<V, J, R, Jf, S>(
    mut residual: R,
    mut jacobian: Jf,
    x0: V,
    opts: &NewtonOptions,
    solver: &mut S,
    norm: Option<&dyn Fn(&V) -> f64>,
) -> Result<NewtonResult<V>>
where
    V: VectorOps,
    R: FnMut(&V) -> Result<V>,
    Jf: FnMut(&V) -> Result<J>,
    S: LinearSolver<J, V>,
{
    if opts.max_iter == 0 {
        bail!("max_iter must be greater than zero.");
    }
    if opts.tol <= 0.0 {
        bail!("tolerance must be positive.");
    }

    let norm_of = |r: &V| match norm {
        Some(f) => f(r),
        None => r.norm(),
    };

    let mut x = x0;
    let mut r = residual(&x)?;
    let mut res_norm = norm_of(&r);
    if !res_norm.is_finite() {
        bail!("Newton residual is non-finite at the initial guess.");
    }
    let mut residuals = vec![res_norm];
    let mut iterations = 0usize;

    while res_norm > opts.tol {
        if iterations >= opts.max_iter {
            if opts.verbose {
                info!("newton: no convergence in {} iterations (||r|| = {res_norm:.3e})", opts.max_iter);
            }
            return Ok(NewtonResult {
                x,
                residuals,
                iterations,
                converged: false,
            });
        }

        let j = jacobian(&x)?;
        let (delta, stats) = match solver.solve(&j, &r) {
            Ok(solved) => solved,
            Err(err) => {
                warn!("newton: linear solve failed ({err})");
                return Ok(NewtonResult {
                    x,
                    residuals,
                    iterations,
                    converged: false,
                });
            }
        };
        if !stats.converged {
            warn!(
                "newton: linear solver stalled after {} iterations (residual {:.3e})",
                stats.iterations, stats.final_residual
            );
            return Ok(NewtonResult {
                x,
                residuals,
                iterations,
                converged: false,
            });
        }

        let (x_next, r_next) = if opts.linesearch {
            line_search(&mut residual, &x, &delta, res_norm, &norm_of)?
        } else {
            let mut x_next = x.clone();
            x_next.axpy(-1.0, &delta);
            let r_next = residual(&x_next)?;
            (x_next, r_next)
        };
        x = x_next;
        r = r_next;

        res_norm = norm_of(&r);
        if !res_norm.is_finite() {
            bail!("Newton residual became non-finite at iteration {}.", iterations + 1);
        }
        iterations += 1;
        residuals.push(res_norm);
        if opts.verbose {
            debug!("newton iter {iterations}: ||r|| = {res_norm:.3e}");
        }
    }

    Ok(NewtonResult {
        x,
        residuals,
        iterations,
        converged: true,
    })
}

/// Backtracking halving until the residual norm drops below the current
/// one, capped at `MAX_HALVINGS`; past the cap the last trial is taken.
fn line_search<V, R>(
    residual: &mut R,
    x: &V,
    delta: &V,
    current_norm: f64,
    norm_of: &dyn Fn(&V) -> f64,
) -> Result<(V, V)>
where
    V: VectorOps,
    R: FnMut(&V) -> Result<V>,
{
    let mut alpha = 1.0;
    let mut trial = x.clone();
    trial.axpy(-alpha, delta);
    let mut r_trial = residual(&trial)?;

    for _ in 0..MAX_HALVINGS {
        if norm_of(&r_trial) < current_norm {
            break;
        }
        alpha *= 0.5;
        trial = x.clone();
        trial.axpy(-alpha, delta);
        r_trial = residual(&trial)?;
    }

    Ok((trial, r_trial))
}

//! Tangent predictors along a continuation branch.
//!
//! A tangent (dx, dp) is kept normalised in the θ-weighted arclength
//! metric θ·‖dx‖²/N + (1−θ)·dp² = 1 and oriented so consecutive tangents
//! never flip direction.

use anyhow::{bail, Result};

use super::bordered::BorderedSolver;
use crate::vector::VectorOps;

/// Branch direction in (x, p)-space.
#[derive(Debug, Clone)]
pub struct Tangent<V> {
    pub dx: V,
    pub dp: f64,
}

impl<V: VectorOps> Tangent<V> {
    /// The conventional seed (0, 1) used before any branch data exists.
    pub fn seed(like: &V) -> Self {
        Self {
            dx: like.zeros_like(),
            dp: 1.0,
        }
    }

    /// Norm in the θ-weighted arclength metric.
    pub fn arc_norm(&self, theta: f64) -> f64 {
        let n = self.dx.len() as f64;
        let dx_norm = self.dx.norm();
        (theta * dx_norm * dx_norm / n + (1.0 - theta) * self.dp * self.dp).sqrt()
    }

    pub fn normalize(&mut self, theta: f64) -> Result<()> {
        let scale = self.arc_norm(theta);
        if !(scale.is_finite() && scale > 0.0) {
            bail!("degenerate tangent: arclength norm is {scale}");
        }
        self.dx.scale(1.0 / scale);
        self.dp /= scale;
        Ok(())
    }

    /// Plain Euclidean inner product in (x, p)-space.
    pub fn dot(&self, other: &Self) -> f64 {
        self.dx.dot(&other.dx) + self.dp * other.dp
    }

    pub fn flip(&mut self) {
        self.dx.scale(-1.0);
        self.dp = -self.dp;
    }

    /// Flip so ⟨self, prev⟩ > 0, preventing the branch from backtracking.
    pub fn orient_against(&mut self, prev: &Self) {
        if self.dot(prev) < 0.0 {
            self.flip();
        }
    }
}

/// Secant tangent from the two last accepted points; `ds` is the signed
/// arclength step that separated them.
pub fn secant<V: VectorOps>(
    x: &V,
    p: f64,
    x_prev: &V,
    p_prev: f64,
    ds: f64,
    theta: f64,
    prev: &Tangent<V>,
) -> Result<Tangent<V>> {
    if ds == 0.0 {
        bail!("secant tangent requires a non-zero previous step");
    }
    let mut dx = x.clone();
    dx.axpby(-1.0 / ds, x_prev, 1.0 / ds);
    let mut tangent = Tangent {
        dx,
        dp: (p - p_prev) / ds,
    };
    tangent.normalize(theta)?;
    tangent.orient_against(prev);
    Ok(tangent)
}

/// Bordered tangent: solve the augmented system with the previous tangent
/// as the border row and right-hand side (0, 1).
pub fn bordered<V, J, B>(
    jac: &J,
    dfdp: &V,
    prev: &Tangent<V>,
    theta: f64,
    solver: &mut B,
) -> Result<Tangent<V>>
where
    V: VectorOps,
    B: BorderedSolver<J, V>,
{
    let rhs_x = prev.dx.zeros_like();
    let (dx, dp, stats) =
        solver.solve_bordered(jac, dfdp, &prev.dx, prev.dp, theta, &rhs_x, 1.0)?;
    if !stats.converged {
        bail!("bordered tangent solve did not converge");
    }
    let mut tangent = Tangent { dx, dp };
    tangent.normalize(theta)?;
    tangent.orient_against(prev);
    Ok(tangent)
}

/// Rebalance θ so the state and parameter contributions to the arclength
/// metric stay comparable; clamped away from the degenerate endpoints.
pub fn rebalanced_theta<V: VectorOps>(tangent: &Tangent<V>) -> f64 {
    let n = tangent.dx.len() as f64;
    let dx_norm = tangent.dx.norm();
    let state_part = dx_norm * dx_norm / n;
    let param_part = tangent.dp * tangent.dp;
    (param_part / (state_part + param_part)).clamp(0.05, 0.95)
}

//! Core types for branch continuation.

use num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::newton::NewtonOptions;

/// Tangent predictor algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TangentAlgorithm {
    /// Finite difference of the two last accepted points.
    Secant,
    /// Bordered linear solve at the current point.
    Bordered,
}

/// Classification of codimension-1 events detected along a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BifurcationKind {
    Fold,
    Hopf,
    Unknown,
}

/// A detected bifurcation, attached to the branch point that closed the
/// sign-change bracket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BifurcationMarker {
    /// Index into `Branch::points` of the bracket's right endpoint.
    pub index: usize,
    pub kind: BifurcationKind,
    /// Parameter estimate from linear interpolation across the bracket.
    pub bracketed_param: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eigenvalues: Option<Vec<Complex<f64>>>,
}

/// One accepted point on a branch. Immutable once appended.
#[derive(Debug, Clone)]
pub struct BranchPoint<V> {
    pub x: V,
    pub p: f64,
    /// Arclength step that produced this point (0 for the seed point).
    pub ds: f64,
    /// Euclidean norm of `x`, kept as a plottable scalar summary.
    pub norm_x: f64,
}

/// Ordered sequence of accepted points plus detected bifurcations.
#[derive(Debug, Clone)]
pub struct Branch<V> {
    pub points: Vec<BranchPoint<V>>,
    pub markers: Vec<BifurcationMarker>,
}

impl<V> Branch<V> {
    pub fn new() -> Self {
        Self {
            points: Vec::new(),
            markers: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last(&self) -> Option<&BranchPoint<V>> {
        self.points.last()
    }
}

impl<V> Default for Branch<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a continuation run stopped. Ordinary numerical trouble ends a run
/// through one of these tags rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    MaxSteps,
    /// The parameter left [p_min, p_max].
    ParameterBound,
    /// Two consecutive rejections with the step already at `ds_min`.
    StepSizeFloor,
    /// The finalise hook returned false.
    UserAbort,
}

/// Result of a continuation run: the accumulated branch, the last
/// solution and the reason the loop ended.
#[derive(Debug, Clone)]
pub struct ContinuationRun<V> {
    pub branch: Branch<V>,
    pub x: V,
    pub p: f64,
    pub reason: Termination,
}

/// Settings controlling the pseudo-arclength continuation loop.
///
/// Value-typed; mutate a copy, never a record shared between runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContinuationOptions {
    /// Initial arclength step.
    pub ds0: f64,
    pub ds_min: f64,
    pub ds_max: f64,
    /// Step multiplier after a successful step (> 1).
    pub step_growth: f64,
    /// Step multiplier after a rejection (< 1).
    pub step_shrink: f64,
    /// Arclength-scaling weight θ ∈ (0, 1).
    pub theta: f64,
    pub p_min: f64,
    pub p_max: f64,
    /// Cap on accepted steps.
    pub max_steps: usize,
    /// A corrector converging in more iterations than this is rejected.
    pub desired_newton_iters: usize,
    pub detect_fold: bool,
    /// Automatic rebalancing of θ along the branch.
    pub arclength_scaling: bool,
    pub tangent_algorithm: TangentAlgorithm,
    pub newton: NewtonOptions,
}

impl Default for ContinuationOptions {
    fn default() -> Self {
        Self {
            ds0: 0.01,
            ds_min: 1e-5,
            ds_max: 0.1,
            step_growth: 2.0,
            step_shrink: 0.5,
            theta: 0.5,
            p_min: f64::NEG_INFINITY,
            p_max: f64::INFINITY,
            max_steps: 100,
            desired_newton_iters: 8,
            detect_fold: true,
            arclength_scaling: false,
            tangent_algorithm: TangentAlgorithm::Secant,
            newton: NewtonOptions::default(),
        }
    }
}

impl ContinuationOptions {
    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if !(self.ds_min > 0.0 && self.ds_min <= self.ds_max) {
            anyhow::bail!("step bounds must satisfy 0 < ds_min <= ds_max");
        }
        if self.ds0 == 0.0 {
            anyhow::bail!("ds0 must be non-zero; its sign selects the branch direction");
        }
        if self.step_growth < 1.0 {
            anyhow::bail!("step_growth must be at least 1");
        }
        if !(self.step_shrink > 0.0 && self.step_shrink < 1.0) {
            anyhow::bail!("step_shrink must lie in (0, 1)");
        }
        if !(self.theta > 0.0 && self.theta < 1.0) {
            anyhow::bail!("theta must lie in (0, 1)");
        }
        if self.p_min >= self.p_max {
            anyhow::bail!("parameter bounds must satisfy p_min < p_max");
        }
        if self.max_steps == 0 {
            anyhow::bail!("max_steps must be greater than zero");
        }
        if self.desired_newton_iters == 0 {
            anyhow::bail!("desired_newton_iters must be greater than zero");
        }
        Ok(())
    }
}

//! The `traverse_core` crate is a pseudo-arclength continuation engine
//! for parameterised nonlinear equations F(x, p) = 0: it traces solution
//! branches past fold points, detects codimension-1 bifurcations along
//! the way, and refines detected folds to high accuracy.
//!
//! Key components:
//! - **Vector**: the [`vector::VectorOps`] capability trait every
//!   numerical routine is written against.
//! - **Linear solvers**: dense LU and restarted GMRES behind one
//!   interface, with shifted variants ([`linsolve`]).
//! - **Newton**: damped/line-search iteration ([`newton`]).
//! - **Continuation**: predictor/corrector loop with adaptive steps,
//!   tangent updates and fold detection ([`continuation`]).
//! - **Fold**: minimally augmented refinement of fold points ([`fold`]).
//! - **Periodic orbits**: trapezoidal collocation with matrix-free and
//!   block-sparse Jacobians ([`periodic`]).

pub mod continuation;
pub mod fold;
pub mod linsolve;
pub mod newton;
pub mod periodic;
pub mod vector;

/// Finite-difference step for ∂F/∂p and the period derivative of the
/// collocation residual. Adequate for well-scaled problems; Newton
/// tolerances should stay well above it.
pub const FD_PARAM_STEP: f64 = 1e-9;

/// Finite-difference step for the singularity row of the fold system.
pub const FD_FOLD_STEP: f64 = 1e-8;

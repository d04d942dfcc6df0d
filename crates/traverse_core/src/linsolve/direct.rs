//! Dense direct solver backed by nalgebra's LU factorisation.

use nalgebra::{DMatrix, DVector};

use super::{LinearError, LinearSolver, SolveStats};

/// LU solver for concrete dense Jacobians.
///
/// The shifted form builds J + σI explicitly; σ = 0 takes the unshifted
/// fast path.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenseLu;

impl DenseLu {
    pub fn new() -> Self {
        DenseLu
    }
}

impl LinearSolver<DMatrix<f64>, DVector<f64>> for DenseLu {
    fn solve(
        &mut self,
        j: &DMatrix<f64>,
        b: &DVector<f64>,
    ) -> Result<(DVector<f64>, SolveStats), LinearError> {
        let x = j
            .clone()
            .lu()
            .solve(b)
            .ok_or_else(|| LinearError::Factor("LU factorisation is singular".into()))?;
        Ok((x, SolveStats::direct()))
    }

    fn solve_shifted(
        &mut self,
        j: &DMatrix<f64>,
        b: &DVector<f64>,
        sigma: f64,
    ) -> Result<(DVector<f64>, SolveStats), LinearError> {
        if sigma == 0.0 {
            return self.solve(j, b);
        }
        let mut shifted = j.clone();
        for i in 0..shifted.nrows().min(shifted.ncols()) {
            shifted[(i, i)] += sigma;
        }
        let x = shifted
            .lu()
            .solve(b)
            .ok_or_else(|| LinearError::Factor("shifted LU factorisation is singular".into()))?;
        Ok((x, SolveStats::direct()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lu_solves_dense_system() {
        let a = DMatrix::from_row_slice(3, 3, &[2.0, 1.0, 1.0, 1.0, 3.0, 2.0, 1.0, 0.0, 0.0]);
        let b = DVector::from_vec(vec![4.0, 5.0, 6.0]);
        let mut solver = DenseLu::new();
        let (x, stats) = solver.solve(&a, &b).unwrap();
        let expected = [6.0, 15.0, -23.0];
        for (xi, ei) in x.iter().zip(expected.iter()) {
            assert!((xi - ei).abs() < 1e-10, "xi = {xi}, expected = {ei}");
        }
        assert!(stats.converged);
    }

    #[test]
    fn shifted_solve_matches_explicit_shift() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 2.0, 3.0]);
        let b = DVector::from_vec(vec![1.0, -1.0]);
        let sigma = 0.7;

        let mut solver = DenseLu::new();
        let (x, _) = solver.solve_shifted(&a, &b, sigma).unwrap();

        let mut shifted = a.clone();
        shifted[(0, 0)] += sigma;
        shifted[(1, 1)] += sigma;
        let expected = shifted.lu().solve(&b).unwrap();

        assert!((x - expected).norm() < 1e-12);
    }

    #[test]
    fn singular_matrix_is_reported() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        let b = DVector::from_vec(vec![1.0, 2.0]);
        let mut solver = DenseLu::new();
        assert!(solver.solve(&a, &b).is_err());
    }
}

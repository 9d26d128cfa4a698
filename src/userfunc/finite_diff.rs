/*
    Nyx, blazing fast astrodynamics
    Copyright (C) 2023 Christopher Rabotin <christopher.rabotin@gmail.com>

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use crate::linalg::{DMatrix, DVector};
use rand::Rng;
use rand_pcg::Pcg64Mcg;

/// Relative perturbation of the central differences
pub const FD_REL_STEP: f64 = 1e-6;

/// Number of random points sampled inside the bounds when discovering dependencies.
pub const NUM_RANDOM_SAMPLES: usize = 5;

/// Seed of the dependency sampling, fixed so that sparsity patterns are reproducible.
pub const DEPENDENCY_SEED: u128 = 0x6e79_785f_636f_6c6c_6f63_6174_696f_6e;

/// Half width of the sampling box of a variable without finite bounds.
const UNBOUNDED_HALF_WIDTH: f64 = 1.0;

pub fn fd_step(x: f64) -> f64 {
    FD_REL_STEP * (1.0 + x.abs())
}

/// Central differences of `func` around `x`, one column per entry of `x`.
///
/// `func` must return `num_outputs` values for every input.
pub fn central_difference<F, E>(x: &[f64], num_outputs: usize, mut func: F) -> Result<DMatrix<f64>, E>
where
    F: FnMut(&[f64]) -> Result<DVector<f64>, E>,
{
    let mut jac = DMatrix::zeros(num_outputs, x.len());
    let mut work = x.to_vec();
    for j in 0..x.len() {
        let h = fd_step(x[j]);
        work[j] = x[j] + h;
        let plus = func(&work)?;
        work[j] = x[j] - h;
        let minus = func(&work)?;
        work[j] = x[j];
        jac.set_column(j, &((plus - minus) / (2.0 * h)));
    }
    Ok(jac)
}

/// Marks every entry of `jac` which is not exactly zero.
pub fn accumulate_nonzeros(pattern: &mut DMatrix<bool>, jac: &DMatrix<f64>) {
    debug_assert_eq!(pattern.shape(), jac.shape());
    for (flag, value) in pattern.iter_mut().zip(jac.iter()) {
        if *value != 0.0 {
            *flag = true;
        }
    }
}

/// An all-false dependency matrix.
pub fn no_dependencies(nrows: usize, ncols: usize) -> DMatrix<bool> {
    DMatrix::from_element(nrows, ncols, false)
}

/// Finite sampling interval of a variable given its (possibly infinite) bounds.
pub fn sampling_interval(lower: f64, upper: f64) -> (f64, f64) {
    match (lower.is_finite(), upper.is_finite()) {
        (true, true) => (lower, upper),
        (true, false) => (lower, lower + 2.0 * UNBOUNDED_HALF_WIDTH),
        (false, true) => (upper - 2.0 * UNBOUNDED_HALF_WIDTH, upper),
        (false, false) => (-UNBOUNDED_HALF_WIDTH, UNBOUNDED_HALF_WIDTH),
    }
}

/// Draws a point uniformly inside the sampling box of the provided bounds.
pub fn sample_within(rng: &mut Pcg64Mcg, lower: &[f64], upper: &[f64]) -> Vec<f64> {
    lower
        .iter()
        .zip(upper)
        .map(|(l, u)| {
            let (lo, hi) = sampling_interval(*l, *u);
            if hi > lo {
                rng.gen_range(lo..=hi)
            } else {
                lo
            }
        })
        .collect()
}

/// Clamps a point into the sampling box of the provided bounds.
pub fn clamp_within(point: &[f64], lower: &[f64], upper: &[f64]) -> Vec<f64> {
    point
        .iter()
        .zip(lower.iter().zip(upper))
        .map(|(x, (l, u))| {
            let (lo, hi) = sampling_interval(*l, *u);
            x.clamp(lo, hi.max(lo))
        })
        .collect()
}

#[cfg(test)]
mod ut_finite_diff {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    #[test]
    fn central_difference_of_polynomial() {
        let jac = central_difference(&[2.0, -1.0], 2, |x| {
            Ok::<_, ()>(DVector::from_column_slice(&[
                x[0] * x[0] * x[1],
                3.0 * x[1] + x[0],
            ]))
        })
        .unwrap();
        assert_relative_eq!(jac[(0, 0)], -4.0, epsilon = 1e-8);
        assert_relative_eq!(jac[(0, 1)], 4.0, epsilon = 1e-8);
        assert_relative_eq!(jac[(1, 0)], 1.0, epsilon = 1e-8);
        assert_relative_eq!(jac[(1, 1)], 3.0, epsilon = 1e-8);
    }

    #[test]
    fn sampling_respects_bounds() {
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        let lower = [0.0, f64::NEG_INFINITY, 3.0, 5.0];
        let upper = [1.0, f64::INFINITY, f64::INFINITY, 5.0];
        for _ in 0..20 {
            let x = sample_within(&mut rng, &lower, &upper);
            assert!((0.0..=1.0).contains(&x[0]));
            assert!((-1.0..=1.0).contains(&x[1]));
            assert!((3.0..=5.0).contains(&x[2]));
            assert_eq!(x[3], 5.0);
        }
        assert_eq!(
            clamp_within(&[9.0, 9.0, 0.0, 0.0], &lower, &upper),
            vec![1.0, 1.0, 3.0, 5.0]
        );
    }
}

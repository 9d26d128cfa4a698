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

use super::{barycentric_weights, differentiation_matrix, CollocationScheme, IntervalRule, Piece};
use crate::linalg::DMatrix;
use std::f64::consts::PI;
use std::fmt;

/// Minimum number of collocation points per interval used by mesh refinement
pub const MIN_POINTS: usize = 3;
/// Maximum number of collocation points per interval used by mesh refinement
pub const MAX_POINTS: usize = 15;

const MAX_NEWTON_ITER: usize = 100;

/// Returns `(P_{n-1}(x), P_n(x))` using the three term recurrence.
pub fn legendre_pair(n: usize, x: f64) -> (f64, f64) {
    if n == 0 {
        return (0.0, 1.0);
    }
    let mut prev = 1.0;
    let mut cur = x;
    for k in 2..=n {
        let kf = k as f64;
        let next = ((2.0 * kf - 1.0) * x * cur - (kf - 1.0) * prev) / kf;
        prev = cur;
        cur = next;
    }
    (prev, cur)
}

/// Legendre-Gauss-Radau points and quadrature weights on `[-1, 1)`.
///
/// The points are the roots of `P_{n-1} + P_n`, the first one being fixed at -1. They are found
/// by Newton iterations from the Chebyshev-Gauss-Radau points.
pub fn lgr_points(n: usize) -> (Vec<f64>, Vec<f64>) {
    assert!(n > 0, "at least one LGR point is needed");
    let nf = n as f64;
    let mut points: Vec<f64> = (0..n)
        .map(|j| -(2.0 * PI * (j as f64) / (2.0 * nf - 1.0)).cos())
        .collect();
    points[0] = -1.0;

    for x in points.iter_mut().skip(1) {
        for _ in 0..MAX_NEWTON_ITER {
            let (p_nm1, p_n) = legendre_pair(n, *x);
            let delta = ((1.0 - *x) / nf) * (p_nm1 + p_n) / (p_nm1 - p_n);
            *x -= delta;
            if delta.abs() <= f64::EPSILON {
                break;
            }
        }
    }

    let weights = points
        .iter()
        .enumerate()
        .map(|(j, x)| {
            if j == 0 {
                2.0 / (nf * nf)
            } else {
                let (p_nm1, _) = legendre_pair(n, *x);
                (1.0 - x) / (nf * p_nm1).powi(2)
            }
        })
        .collect();

    (points, weights)
}

/// Radau pseudospectral collocation: the state is a polynomial through the LGR points of each
/// interval and the interval end point, and the dynamics are collocated at the LGR points.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct RadauScheme;

impl CollocationScheme for RadauScheme {
    fn point_range(&self) -> (usize, usize) {
        (MIN_POINTS, MAX_POINTS)
    }

    fn interval_rule(&self, num_points: usize) -> IntervalRule {
        let (mut support, mut weights) = lgr_points(num_points);
        support.push(1.0);
        weights.push(0.0);
        let barycentric = barycentric_weights(&support);
        let diff = differentiation_matrix(&support, &barycentric, num_points);
        let mut integration = DMatrix::zeros(num_points, num_points + 1);
        integration.fill_diagonal(1.0);
        // The end point is not collocated, so the final control of the phase is free.
        IntervalRule {
            support,
            weights,
            diff,
            integration,
            pieces: vec![Piece {
                support: 0..num_points + 1,
                controls: 0..num_points,
            }],
        }
    }
}

impl fmt::Display for RadauScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Radau (LGR)")
    }
}

#[cfg(test)]
mod ut_radau {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn three_point_rule() {
        let (points, weights) = lgr_points(3);
        let s6 = 6.0_f64.sqrt();
        assert_eq!(points[0], -1.0);
        assert_relative_eq!(points[1], (1.0 - s6) / 5.0, epsilon = 1e-14);
        assert_relative_eq!(points[2], (1.0 + s6) / 5.0, epsilon = 1e-14);
        assert_relative_eq!(weights[0], 2.0 / 9.0, epsilon = 1e-14);
        assert_relative_eq!(weights[1], (16.0 + s6) / 18.0, epsilon = 1e-14);
        assert_relative_eq!(weights[2], (16.0 - s6) / 18.0, epsilon = 1e-14);
    }

    #[test]
    fn quadrature_is_exact() {
        // An n point Radau rule integrates polynomials up to degree 2n - 2 exactly.
        for n in MIN_POINTS..=MAX_POINTS {
            let (points, weights) = lgr_points(n);
            let total: f64 = weights.iter().sum();
            assert_relative_eq!(total, 2.0, epsilon = 1e-12);
            let deg = 2 * n - 2;
            let integral: f64 = points
                .iter()
                .zip(&weights)
                .map(|(x, w)| w * x.powi(deg as i32))
                .sum();
            let exact = if deg % 2 == 0 {
                2.0 / (deg as f64 + 1.0)
            } else {
                0.0
            };
            assert_relative_eq!(integral, exact, epsilon = 1e-11);
            assert!(points.windows(2).all(|p| p[1] > p[0]));
            assert!(*points.last().unwrap() < 1.0);
        }
    }

    #[test]
    fn differentiation_is_exact() {
        let rule = RadauScheme.interval_rule(5);
        assert_eq!(rule.diff.nrows(), 5);
        assert_eq!(rule.diff.ncols(), 6);
        // Derivative of s^5 on 6 support points is exact.
        let values: Vec<f64> = rule.support.iter().map(|s| s.powi(5)).collect();
        for i in 0..5 {
            let d: f64 = (0..6).map(|j| rule.diff[(i, j)] * values[j]).sum();
            assert_relative_eq!(d, 5.0 * rule.support[i].powi(4), epsilon = 1e-10);
            assert_eq!(rule.integration[(i, i)], 1.0);
        }
        assert_eq!(rule.weights[5], 0.0);
        assert_eq!(rule.integration.column(5).sum(), 0.0);
    }
}

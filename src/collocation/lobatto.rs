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
use super::{CollocationScheme, IntervalRule, Piece};
use crate::errors::{ConfigError, InvalidMeshSnafu, InvalidValueSnafu};
use crate::linalg::DMatrix;
use snafu::ensure;
use std::fmt;

/// Maximum number of Runge-Kutta steps per interval used by mesh refinement.
pub const MAX_STEPS: usize = 10;

/// Lobatto IIIA implicit Runge-Kutta collocation.
///
/// Each interval is split in equal steps. Within a step, the states at the `stages` Lobatto
/// points are linked by the Butcher table of the method, so consecutive steps share their end
/// points and an interval with `n` points holds `n / (stages - 1)` steps. Controls live at every
/// node, the final one included.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LobattoIIIA {
    stages: usize,
}

impl LobattoIIIA {
    pub fn new(stages: usize) -> Result<Self, ConfigError> {
        ensure!(
            (2..=5).contains(&stages),
            InvalidValueSnafu {
                field: "Lobatto IIIA stages",
                value: stages.to_string(),
                expected: "between 2 and 5 stages",
            }
        );
        Ok(Self { stages })
    }

    /// Second order, two stages.
    pub fn trapezoid() -> Self {
        Self { stages: 2 }
    }

    /// Fourth order, three stages.
    pub fn hermite_simpson() -> Self {
        Self { stages: 3 }
    }

    pub fn sixth_order() -> Self {
        Self { stages: 4 }
    }

    pub fn eighth_order() -> Self {
        Self { stages: 5 }
    }

    pub fn stages(&self) -> usize {
        self.stages
    }

    pub fn order(&self) -> usize {
        2 * (self.stages - 1)
    }

    /// Lobatto points on `[-1, 1]`.
    pub fn nodes(&self) -> Vec<f64> {
        match self.stages {
            2 => vec![-1.0, 1.0],
            3 => vec![-1.0, 0.0, 1.0],
            4 => {
                let c = 1.0 / 5.0_f64.sqrt();
                vec![-1.0, -c, c, 1.0]
            }
            _ => {
                let c = (3.0_f64 / 7.0).sqrt();
                vec![-1.0, -c, 0.0, c, 1.0]
            }
        }
    }

    /// Butcher matrix on `[-1, 1]`: entry `(r, l)` is the integral of the Lagrange polynomial of
    /// node `l` from -1 to node `r`. The last row holds the quadrature weights.
    pub fn butcher_matrix(&self) -> DMatrix<f64> {
        let nodes = self.nodes();
        let s = nodes.len();
        let mut table = DMatrix::zeros(s, s);
        for l in 0..s {
            let coeffs = lagrange_coefficients(&nodes, l);
            for r in 0..s {
                table[(r, l)] = integrate(&coeffs, -1.0, nodes[r]);
            }
        }
        table
    }

    fn step_points(&self) -> usize {
        self.stages - 1
    }
}

/// Monomial coefficients, lowest degree first, of the Lagrange polynomial of node `l`.
fn lagrange_coefficients(nodes: &[f64], l: usize) -> Vec<f64> {
    let mut coeffs = vec![1.0];
    for (k, ck) in nodes.iter().enumerate() {
        if k == l {
            continue;
        }
        let scale = 1.0 / (nodes[l] - ck);
        let mut next = vec![0.0; coeffs.len() + 1];
        for (m, a) in coeffs.iter().enumerate() {
            next[m + 1] += a * scale;
            next[m] -= a * ck * scale;
        }
        coeffs = next;
    }
    coeffs
}

fn integrate(coeffs: &[f64], from: f64, to: f64) -> f64 {
    coeffs
        .iter()
        .enumerate()
        .map(|(m, a)| {
            let p = m as i32 + 1;
            a * (to.powi(p) - from.powi(p)) / f64::from(p)
        })
        .sum()
}

impl CollocationScheme for LobattoIIIA {
    fn point_range(&self) -> (usize, usize) {
        let per_step = self.step_points();
        (self.admissible_points(2), MAX_STEPS * per_step)
    }

    fn interval_rule(&self, num_points: usize) -> IntervalRule {
        let per_step = self.step_points();
        let steps = (num_points / per_step).max(1);
        let n = steps * per_step;
        let nodes = self.nodes();
        let table = self.butcher_matrix();
        let inv_steps = 1.0 / steps as f64;

        let mut support = Vec::with_capacity(n + 1);
        for q in 0..steps {
            for c in &nodes[..per_step] {
                support.push(-1.0 + (2.0 * q as f64 + c + 1.0) * inv_steps);
            }
        }
        support.push(1.0);

        let mut weights = vec![0.0; n + 1];
        let mut diff = DMatrix::zeros(n, n + 1);
        let mut integration = DMatrix::zeros(n, n + 1);
        let mut pieces = Vec::with_capacity(steps);
        for q in 0..steps {
            let first = q * per_step;
            for l in 0..self.stages {
                weights[first + l] += table[(self.stages - 1, l)] * inv_steps;
            }
            // The first stage is the step start, its row of the table is zero.
            for r in 1..self.stages {
                let row = first + r - 1;
                diff[(row, first + r)] = 1.0;
                diff[(row, first)] = -1.0;
                for l in 0..self.stages {
                    integration[(row, first + l)] = table[(r, l)] * inv_steps;
                }
            }
            pieces.push(Piece {
                support: first..first + self.stages,
                controls: first..first + self.stages,
            });
        }

        IntervalRule {
            support,
            weights,
            diff,
            integration,
            pieces,
        }
    }

    fn validate_points(&self, points: &[usize]) -> Result<(), ConfigError> {
        let per_step = self.step_points();
        for (k, n) in points.iter().enumerate() {
            ensure!(
                *n >= per_step && n % per_step == 0,
                InvalidMeshSnafu {
                    reason: format!(
                        "interval {k} has {n} points but {self} needs a positive multiple of {per_step}"
                    )
                }
            );
        }
        Ok(())
    }

    fn admissible_points(&self, num_points: usize) -> usize {
        let per_step = self.step_points();
        num_points.div_ceil(per_step).max(1) * per_step
    }
}

impl fmt::Display for LobattoIIIA {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.stages {
            2 => "trapezoid",
            3 => "Hermite-Simpson",
            4 => "6th order",
            _ => "8th order",
        };
        write!(f, "Lobatto IIIA ({name})")
    }
}

#[cfg(test)]
mod ut_lobatto {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn hermite_simpson_table() {
        let table = LobattoIIIA::hermite_simpson().butcher_matrix();
        let expected = [
            [0.0, 0.0, 0.0],
            [5.0 / 12.0, 2.0 / 3.0, -1.0 / 12.0],
            [1.0 / 3.0, 4.0 / 3.0, 1.0 / 3.0],
        ];
        for r in 0..3 {
            for l in 0..3 {
                assert_relative_eq!(table[(r, l)], expected[r][l], epsilon = 1e-14);
            }
        }
    }

    #[test]
    fn stage_integrals_are_exact() {
        // Row r integrates polynomials up to degree stages - 1 exactly from -1 to c_r.
        for stages in 2..=5 {
            let scheme = LobattoIIIA::new(stages).unwrap();
            let nodes = scheme.nodes();
            let table = scheme.butcher_matrix();
            let deg = (stages - 1) as i32;
            for r in 0..stages {
                let quad: f64 = (0..stages)
                    .map(|l| table[(r, l)] * nodes[l].powi(deg - 1))
                    .sum();
                let exact = (nodes[r].powi(deg) - (-1.0_f64).powi(deg)) / f64::from(deg);
                assert_relative_eq!(quad, exact, epsilon = 1e-13);
            }
            let total: f64 = table.row(stages - 1).sum();
            assert_relative_eq!(total, 2.0, epsilon = 1e-14);
        }
        assert!(LobattoIIIA::new(6).is_err());
    }

    #[test]
    fn trapezoid_steps() {
        let rule = LobattoIIIA::trapezoid().interval_rule(4);
        assert_eq!(rule.num_points(), 4);
        assert_eq!(rule.support, vec![-1.0, -0.5, 0.0, 0.5, 1.0]);
        assert_eq!(rule.pieces.len(), 4);
        // Each defect is x_{k+1} - x_k - h/4 (f_k + f_{k+1}).
        assert_eq!(rule.diff[(2, 2)], -1.0);
        assert_eq!(rule.diff[(2, 3)], 1.0);
        assert_relative_eq!(rule.integration[(2, 2)], 0.25, epsilon = 1e-15);
        assert_relative_eq!(rule.integration[(2, 3)], 0.25, epsilon = 1e-15);
        let total: f64 = rule.weights.iter().sum();
        assert_relative_eq!(total, 2.0, epsilon = 1e-14);
        assert_relative_eq!(rule.weights[0], 0.25, epsilon = 1e-15);
        assert_relative_eq!(rule.weights[1], 0.5, epsilon = 1e-15);
    }

    #[test]
    fn point_counts() {
        let hs = LobattoIIIA::hermite_simpson();
        assert!(hs.validate_points(&[2, 4, 6]).is_ok());
        assert!(matches!(
            hs.validate_points(&[4, 3]),
            Err(ConfigError::InvalidMesh { .. })
        ));
        assert_eq!(hs.admissible_points(5), 6);
        assert_eq!(hs.point_range(), (2, 20));
        let rk8 = LobattoIIIA::eighth_order();
        assert_eq!(rk8.admissible_points(2), 4);
        assert_eq!(rk8.point_range().0, 4);
    }
}

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

use crate::errors::{ConfigError, UnsupportedOptionSnafu};
use crate::linalg::DMatrix;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

pub mod mesh;
pub use mesh::Mesh;

/// Lobatto IIIA implicit Runge-Kutta collocation.
pub mod lobatto;
pub use lobatto::LobattoIIIA;

/// Legendre-Gauss-Radau collocation.
pub mod radau;
pub use radau::RadauScheme;

/// Mesh refinement policies.
pub mod refinement;
pub use refinement::{MeshRefinement, RefinementDecision, ResidualRefinement};

/// Support points of an interval sharing one interpolating polynomial.
#[derive(Clone, Debug, PartialEq)]
pub struct Piece {
    /// Support points of the state polynomial.
    pub support: Range<usize>,
    /// Support points whose controls are interpolated on this piece.
    pub controls: Range<usize>,
}

/// Defect and quadrature rule of one mesh interval, on the local variable `s ∈ [-1, 1]`.
///
/// Defect row `r` of an interval reads `Σ_j diff[r, j] X_j - h Σ_l integration[r, l] F_l = 0`
/// where `X` and `F` are the states and dynamics at the support points and `h` is `dt/ds`.
#[derive(Clone, Debug, PartialEq)]
pub struct IntervalRule {
    /// Support points: the interval nodes followed by `s = 1`, which is the first node of the
    /// next interval.
    pub support: Vec<f64>,
    /// Quadrature weights of the support points.
    pub weights: Vec<f64>,
    /// One row per interval node, one column per support point.
    pub diff: DMatrix<f64>,
    /// Same shape as `diff`.
    pub integration: DMatrix<f64>,
    /// Ordered, covering the whole support.
    pub pieces: Vec<Piece>,
}

impl IntervalRule {
    /// Number of nodes of the interval, which is also its number of defect rows.
    pub fn num_points(&self) -> usize {
        self.support.len() - 1
    }

    /// Piece containing a local time, the last one for `s = 1`.
    pub fn piece_at(&self, s: f64) -> &Piece {
        let k = self
            .pieces
            .iter()
            .rposition(|piece| s >= self.support[piece.support.start])
            .unwrap_or(0);
        &self.pieces[k]
    }

    /// Index of the first support point and values of the state basis at `s`.
    pub fn state_basis(&self, s: f64) -> (usize, Vec<f64>) {
        let range = self.piece_at(s).support.clone();
        (range.start, self.basis_on(range, s))
    }

    /// Index of the first support point and values of the control basis at `s`.
    pub fn control_basis(&self, s: f64) -> (usize, Vec<f64>) {
        let range = self.piece_at(s).controls.clone();
        (range.start, self.basis_on(range, s))
    }

    /// Index of the first support point and derivatives of the state basis at `s`.
    pub fn state_basis_derivative(&self, s: f64) -> (usize, Vec<f64>) {
        let range = self.piece_at(s).support.clone();
        let points = &self.support[range.clone()];
        let bary = barycentric_weights(points);
        (range.start, lagrange_basis_derivative(points, &bary, s))
    }

    fn basis_on(&self, range: Range<usize>, s: f64) -> Vec<f64> {
        let points = &self.support[range];
        lagrange_basis(points, &barycentric_weights(points), s)
    }
}

/// One mesh interval once discretized.
#[derive(Clone, Debug, PartialEq)]
pub struct IntervalBlock {
    /// Normalized phase time at the start of the interval
    pub start: f64,
    /// Normalized phase time at the end of the interval
    pub end: f64,
    /// Index of the first node of this interval in the phase.
    pub first_node: usize,
    pub rule: IntervalRule,
}

impl IntervalBlock {
    /// `dτ/ds`
    pub fn half_width(&self) -> f64 {
        0.5 * (self.end - self.start)
    }

    /// Maps the local variable onto the normalized phase time.
    pub fn to_phase_tau(&self, s: f64) -> f64 {
        self.start + (s + 1.0) * self.half_width()
    }

    /// Maps normalized phase time onto the local variable.
    pub fn to_local(&self, tau: f64) -> f64 {
        (tau - self.start) / self.half_width() - 1.0
    }
}

/// A phase mesh turned into nodes, quadrature and defect blocks.
#[derive(Clone, Debug, PartialEq)]
pub struct Discretization {
    /// Normalized phase time of every node, final node included.
    pub taus: Vec<f64>,
    pub intervals: Vec<IntervalBlock>,
    /// For each defect row block, its interval and its row within that interval. Row block `p`
    /// belongs to node `p`, the final node has none.
    pub collocation: Vec<(usize, usize)>,
}

impl Discretization {
    pub fn total_nodes(&self) -> usize {
        self.taus.len()
    }

    pub fn num_collocation_nodes(&self) -> usize {
        self.collocation.len()
    }

    /// Index of the interval containing that normalized time, the last one for τ = 1.
    pub fn interval_of(&self, tau: f64) -> usize {
        self.intervals
            .iter()
            .rposition(|block| tau >= block.start)
            .unwrap_or(0)
    }
}

/// A transcription scheme: how a mesh interval is turned into nodes and defect constraints.
pub trait CollocationScheme: Send + Sync + fmt::Debug + fmt::Display {
    /// Allowed range of points per interval, used by mesh refinement.
    fn point_range(&self) -> (usize, usize);

    /// Builds the rule of an interval with `num_points` nodes.
    fn interval_rule(&self, num_points: usize) -> IntervalRule;

    /// Checks that every interval may carry its number of points.
    fn validate_points(&self, _points: &[usize]) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Smallest number of points at least `num_points` that an interval may carry.
    fn admissible_points(&self, num_points: usize) -> usize {
        num_points
    }

    /// Discretizes the whole mesh.
    fn discretize(&self, mesh: &Mesh) -> Discretization {
        let mut taus = Vec::with_capacity(mesh.total_nodes());
        let mut intervals = Vec::with_capacity(mesh.num_intervals());
        let mut collocation = Vec::with_capacity(mesh.num_collocation_nodes());
        for (k, num_points) in mesh.points().iter().enumerate() {
            let block = IntervalBlock {
                start: mesh.fractions()[k],
                end: mesh.fractions()[k + 1],
                first_node: taus.len(),
                rule: self.interval_rule(*num_points),
            };
            let n = block.rule.num_points();
            for (i, s) in block.rule.support[..n].iter().enumerate() {
                taus.push(block.to_phase_tau(*s));
                collocation.push((k, i));
            }
            intervals.push(block);
        }
        taus.push(1.0);
        Discretization {
            taus,
            intervals,
            collocation,
        }
    }
}

/// Transcription schemes selectable by name in configuration files.
pub const SUPPORTED_SCHEMES: &str =
    "`RadauPseudospectral`, `Trapezoid`, `HermiteSimpson`, `RungeKutta4`, `RungeKutta6`, `RungeKutta8`";

/// Parses the name of a transcription scheme.
pub fn scheme_from_name(name: &str) -> Result<Arc<dyn CollocationScheme>, ConfigError> {
    let scheme: Arc<dyn CollocationScheme> = match name {
        "RadauPseudospectral" => Arc::new(RadauScheme),
        "Trapezoid" => Arc::new(LobattoIIIA::trapezoid()),
        "HermiteSimpson" | "RungeKutta4" => Arc::new(LobattoIIIA::hermite_simpson()),
        "RungeKutta6" => Arc::new(LobattoIIIA::sixth_order()),
        "RungeKutta8" => Arc::new(LobattoIIIA::eighth_order()),
        _ => {
            return UnsupportedOptionSnafu {
                field: "transcription",
                value: name,
                supported: SUPPORTED_SCHEMES,
            }
            .fail()
        }
    };
    Ok(scheme)
}

/// Barycentric weights `b_j = 1 / Π_{k≠j} (x_j - x_k)`.
pub fn barycentric_weights(points: &[f64]) -> Vec<f64> {
    points
        .iter()
        .enumerate()
        .map(|(j, xj)| {
            let prod: f64 = points
                .iter()
                .enumerate()
                .filter(|(k, _)| *k != j)
                .map(|(_, xk)| xj - xk)
                .product();
            1.0 / prod
        })
        .collect()
}

/// Values of every Lagrange basis polynomial at `x`.
pub fn lagrange_basis(points: &[f64], barycentric: &[f64], x: f64) -> Vec<f64> {
    if let Some(j) = points.iter().position(|p| *p == x) {
        let mut basis = vec![0.0; points.len()];
        basis[j] = 1.0;
        return basis;
    }
    let terms: Vec<f64> = points
        .iter()
        .zip(barycentric)
        .map(|(p, b)| b / (x - p))
        .collect();
    let denom: f64 = terms.iter().sum();
    terms.iter().map(|t| t / denom).collect()
}

/// Derivatives of every Lagrange basis polynomial at `x`.
pub fn lagrange_basis_derivative(points: &[f64], barycentric: &[f64], x: f64) -> Vec<f64> {
    let n = points.len();
    if let Some(i) = points.iter().position(|p| *p == x) {
        // Same rows as the differentiation matrix.
        let mut deriv = vec![0.0; n];
        let mut diag = 0.0;
        for j in 0..n {
            if j != i {
                deriv[j] = (barycentric[j] / barycentric[i]) / (points[i] - points[j]);
                diag -= deriv[j];
            }
        }
        deriv[i] = diag;
        return deriv;
    }
    let basis = lagrange_basis(points, barycentric, x);
    (0..n)
        .map(|j| {
            let sum: f64 = (0..n)
                .filter(|k| *k != j)
                .map(|k| 1.0 / (x - points[k]))
                .sum();
            basis[j] * sum
        })
        .collect()
}

/// Differentiation matrix of the polynomial through `support`, evaluated at the first `rows` support points.
pub fn differentiation_matrix(support: &[f64], barycentric: &[f64], rows: usize) -> DMatrix<f64> {
    let n = support.len();
    let mut diff = DMatrix::zeros(rows, n);
    for i in 0..rows {
        let mut diag = 0.0;
        for j in 0..n {
            if i != j {
                let dij = (barycentric[j] / barycentric[i]) / (support[i] - support[j]);
                diff[(i, j)] = dij;
                diag -= dij;
            }
        }
        diff[(i, i)] = diag;
    }
    diff
}

#[cfg(test)]
mod ut_lagrange {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn quadratic_interpolation() {
        let points = [-1.0, 0.0, 0.5, 1.0];
        let bary = barycentric_weights(&points);
        let values: Vec<f64> = points.iter().map(|x| x * x - 2.0 * x).collect();
        for x in [-0.7, 0.25, 0.9, 0.5] {
            let basis = lagrange_basis(&points, &bary, x);
            let interp: f64 = basis.iter().zip(&values).map(|(b, v)| b * v).sum();
            assert_relative_eq!(interp, x * x - 2.0 * x, epsilon = 1e-13);

            let dbasis = lagrange_basis_derivative(&points, &bary, x);
            let deriv: f64 = dbasis.iter().zip(&values).map(|(b, v)| b * v).sum();
            assert_relative_eq!(deriv, 2.0 * x - 2.0, epsilon = 1e-12);
        }
    }
}

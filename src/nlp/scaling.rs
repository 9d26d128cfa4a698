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
use crate::errors::ConfigError;
use crate::linalg::DVector;
use crate::sparse::SparsityPattern;
use crate::trajectory::{ProblemBounds, Trajectory};

/// Constraint weights outside of this range are replaced by one.
pub const CONSTRAINT_WEIGHT_RANGE: (f64, f64) = (1e-4, 1e10);

/// Scaling of the transcribed problem seen by the solver.
///
/// A variable with finite bounds is mapped affinely onto `[-0.5, 0.5]` by `x_s = w x + shift`.
/// Defect rows are weighted like the state they constrain, and every other constraint by the
/// inverse norm of its row of the Jacobian in scaled variables. The cost is multiplied by a user
/// weight.
#[derive(Clone, Debug, PartialEq)]
pub struct NlpScaling {
    var_weights: DVector<f64>,
    var_shifts: DVector<f64>,
    con_weights: DVector<f64>,
    cost_weight: f64,
}

impl NlpScaling {
    /// No scaling at all.
    pub fn identity(num_variables: usize, num_constraints: usize) -> Self {
        Self {
            var_weights: DVector::from_element(num_variables, 1.0),
            var_shifts: DVector::zeros(num_variables),
            con_weights: DVector::from_element(num_constraints, 1.0),
            cost_weight: 1.0,
        }
    }

    /// Builds the scaling from the bounds and the Jacobian at the current decision vector.
    ///
    /// If the Jacobian cannot be evaluated there, the non defect constraints are left unscaled.
    pub fn from_trajectory(traj: &mut Trajectory, cost_weight: f64) -> Result<Self, ConfigError> {
        let bounds = traj.bounds()?;
        let defect_columns = traj.defect_state_columns()?;
        let pattern = traj.jacobian_sparsity_pattern()?.clone();
        let values = match traj.constraint_jacobian_values() {
            Ok(values) => Some(values),
            Err(e) => {
                warn!("constraint scaling skipped, jacobian unavailable at the initial guess: {e}");
                None
            }
        };
        Ok(Self::from_parts(
            &bounds,
            &defect_columns,
            &pattern,
            values.as_deref(),
            cost_weight,
        ))
    }

    /// Builds the scaling from its ingredients. `defect_columns[r]` is the state variable
    /// constrained by row `r` if that row is a defect.
    pub fn from_parts(
        bounds: &ProblemBounds,
        defect_columns: &[Option<usize>],
        pattern: &SparsityPattern,
        jacobian: Option<&[f64]>,
        cost_weight: f64,
    ) -> Self {
        let n = bounds.x_lower.len();
        let m = bounds.g_lower.len();
        let mut me = Self::identity(n, m);
        me.cost_weight = cost_weight;
        for i in 0..n {
            let (lower, upper) = (bounds.x_lower[i], bounds.x_upper[i]);
            if lower.is_finite() && upper.is_finite() && upper > lower {
                let w = 1.0 / (upper - lower);
                me.var_weights[i] = w;
                me.var_shifts[i] = 0.5 - upper * w;
            }
        }

        let mut row_norms = vec![0.0; m];
        if let Some(values) = jacobian {
            for ((r, c), v) in pattern.iter().zip(values) {
                row_norms[r] += (v / me.var_weights[c]).powi(2);
            }
        }
        let (min_weight, max_weight) = CONSTRAINT_WEIGHT_RANGE;
        for r in 0..m {
            me.con_weights[r] = match defect_columns.get(r).copied().flatten() {
                Some(col) => me.var_weights[col],
                None if jacobian.is_some() => {
                    let w = 1.0 / row_norms[r].sqrt();
                    if (min_weight..=max_weight).contains(&w) {
                        w
                    } else {
                        1.0
                    }
                }
                None => 1.0,
            };
        }
        me
    }

    pub fn var_weights(&self) -> &DVector<f64> {
        &self.var_weights
    }

    pub fn var_shifts(&self) -> &DVector<f64> {
        &self.var_shifts
    }

    pub fn con_weights(&self) -> &DVector<f64> {
        &self.con_weights
    }

    pub fn cost_weight(&self) -> f64 {
        self.cost_weight
    }

    pub fn num_variables(&self) -> usize {
        self.var_weights.len()
    }

    pub fn num_constraints(&self) -> usize {
        self.con_weights.len()
    }

    pub fn scale_decision(&self, x: &[f64]) -> DVector<f64> {
        DVector::from_iterator(
            x.len(),
            x.iter()
                .enumerate()
                .map(|(i, v)| v * self.var_weights[i] + self.var_shifts[i]),
        )
    }

    pub fn unscale_decision(&self, xs: &[f64]) -> DVector<f64> {
        DVector::from_iterator(
            xs.len(),
            xs.iter()
                .enumerate()
                .map(|(i, v)| (v - self.var_shifts[i]) / self.var_weights[i]),
        )
    }

    /// Bounds seen by the solver. Infinite bounds stay infinite.
    pub fn scale_bounds(&self, bounds: &ProblemBounds) -> ProblemBounds {
        let scale_g = |g: &DVector<f64>| g.component_mul(&self.con_weights);
        ProblemBounds {
            x_lower: self.scale_decision(bounds.x_lower.as_slice()),
            x_upper: self.scale_decision(bounds.x_upper.as_slice()),
            g_lower: scale_g(&bounds.g_lower),
            g_upper: scale_g(&bounds.g_upper),
        }
    }

    pub fn scale_cost(&self, cost: f64) -> f64 {
        cost * self.cost_weight
    }

    pub fn unscale_cost(&self, cost: f64) -> f64 {
        cost / self.cost_weight
    }

    /// Gradient of the scaled cost with respect to the scaled variables.
    pub fn scale_gradient(&self, grad: &DVector<f64>) -> DVector<f64> {
        grad.component_div(&self.var_weights) * self.cost_weight
    }

    pub fn scale_constraints(&self, g: &DVector<f64>) -> DVector<f64> {
        g.component_mul(&self.con_weights)
    }

    /// Jacobian values of the scaled constraints with respect to the scaled variables.
    pub fn scale_jacobian(&self, pattern: &SparsityPattern, values: &[f64]) -> Vec<f64> {
        pattern
            .iter()
            .zip(values)
            .map(|((r, c), v)| self.con_weights[r] * v / self.var_weights[c])
            .collect()
    }

    /// Objective factor and multipliers of the unscaled Lagrangian equal to the scaled one.
    pub fn unscale_multipliers(&self, obj_factor: f64, lambda: &[f64]) -> (f64, Vec<f64>) {
        let lambda = lambda
            .iter()
            .zip(self.con_weights.iter())
            .map(|(l, w)| l * w)
            .collect();
        (obj_factor * self.cost_weight, lambda)
    }

    /// Hessian values with respect to the scaled variables.
    pub fn scale_hessian(&self, pattern: &SparsityPattern, values: &[f64]) -> Vec<f64> {
        pattern
            .iter()
            .zip(values)
            .map(|((r, c), v)| v / (self.var_weights[r] * self.var_weights[c]))
            .collect()
    }
}

#[cfg(test)]
mod ut_scaling {
    use super::*;
    use approx::assert_relative_eq;

    fn bounds() -> ProblemBounds {
        ProblemBounds {
            x_lower: DVector::from_column_slice(&[0.0, -2.0, f64::NEG_INFINITY]),
            x_upper: DVector::from_column_slice(&[10.0, 2.0, f64::INFINITY]),
            g_lower: DVector::from_column_slice(&[0.0, -1.0, 5.0]),
            g_upper: DVector::from_column_slice(&[0.0, 1.0, f64::INFINITY]),
        }
    }

    #[test]
    fn variables_map_onto_unit_box() {
        let scaling = NlpScaling::from_parts(
            &bounds(),
            &[None, None, None],
            &SparsityPattern::new(3, 3),
            None,
            2.0,
        );
        let scaled = scaling.scale_bounds(&bounds());
        assert_relative_eq!(scaled.x_lower[0], -0.5);
        assert_relative_eq!(scaled.x_upper[0], 0.5);
        assert_relative_eq!(scaled.x_lower[1], -0.5);
        assert_relative_eq!(scaled.x_upper[1], 0.5);
        assert_eq!(scaled.x_upper[2], f64::INFINITY);
        let x = [3.0, 1.5, 7.0];
        let back = scaling.unscale_decision(scaling.scale_decision(&x).as_slice());
        for (a, b) in back.iter().zip(x.iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-14);
        }
        assert_eq!(scaling.scale_cost(3.0), 6.0);
        assert_eq!(scaling.unscale_cost(6.0), 3.0);
    }

    #[test]
    fn constraint_weights_from_jacobian_rows() {
        let mut pattern = SparsityPattern::new(3, 3);
        pattern.insert(0, 0);
        pattern.insert(1, 0);
        pattern.insert(1, 1);
        pattern.insert(2, 2);
        // Ranges of 10 and 4, so the scaled partials of row 1 are 30 and 16.
        let values = [1.0, 3.0, 4.0, 1e-12];
        let scaling =
            NlpScaling::from_parts(&bounds(), &[Some(1), None, None], &pattern, Some(&values), 1.0);
        // Defect rows take the weight of their state.
        assert_relative_eq!(scaling.con_weights()[0], 0.25);
        let norm = ((3.0_f64 * 10.0).powi(2) + (4.0_f64 * 4.0).powi(2)).sqrt();
        assert_relative_eq!(scaling.con_weights()[1], 1.0 / norm, epsilon = 1e-14);
        // A weight of 1e12 is out of range.
        assert_eq!(scaling.con_weights()[2], 1.0);

        let scaled = scaling.scale_jacobian(&pattern, &values);
        assert_relative_eq!(scaled[1], 3.0 * 10.0 / norm, epsilon = 1e-14);
        let (sigma, lambda) = scaling.unscale_multipliers(0.5, &[1.0, 1.0, 1.0]);
        assert_eq!(sigma, 0.5);
        assert_relative_eq!(lambda[0], 0.25);
    }
}

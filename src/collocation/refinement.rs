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

use super::Mesh;
use crate::errors::{CollocationError, SizeMismatchSnafu, UninitializedSnafu};
use crate::phase::Phase;
use serde_derive::{Deserialize, Serialize};
use snafu::prelude::*;
use std::fmt;

/// Default tolerance on the relative dynamics residual.
pub const DEFAULT_REFINEMENT_TOLERANCE: f64 = 1e-5;

/// Outcome of a mesh refinement check.
#[derive(Clone, Debug, PartialEq)]
pub enum RefinementDecision {
    /// The mesh is accurate enough.
    Converged { max_error: f64 },
    /// The phase should be solved again on this mesh.
    Refine { max_error: f64, mesh: Mesh },
}

impl RefinementDecision {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }

    pub fn max_error(&self) -> f64 {
        match self {
            Self::Converged { max_error } | Self::Refine { max_error, .. } => *max_error,
        }
    }
}

/// A mesh refinement policy, called on each phase after a successful solve.
pub trait MeshRefinement: Send + Sync + fmt::Debug {
    fn refine(&self, phase: &Phase, decision: &[f64])
        -> Result<RefinementDecision, CollocationError>;
}

/// Refines the intervals where the dynamics residual between the support points is too large.
///
/// The error of an interval is the largest `|dX/ds - h F| / (1 + max|X|)` at the midpoints between
/// consecutive support points. A failing interval with `n` points gets
/// `n + ceil(log(e / tol) / log(n))` points, and is split in subintervals of the minimum number
/// of points when that exceeds the maximum allowed by the scheme.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResidualRefinement {
    pub tolerance: f64,
}

impl Default for ResidualRefinement {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_REFINEMENT_TOLERANCE,
        }
    }
}

impl ResidualRefinement {
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    /// Relative residual of each interval of the phase.
    pub fn interval_errors(
        &self,
        phase: &Phase,
        x: &[f64],
    ) -> Result<Vec<f64>, CollocationError> {
        let disc = phase.discretization().context(UninitializedSnafu {
            action: "refining the mesh",
        })?;
        ensure!(
            x.len() == phase.num_decision_variables(),
            SizeMismatchSnafu {
                left: "phase decision vector",
                left_len: x.len(),
                right: "phase decision variables",
                right_len: phase.num_decision_variables(),
            }
        );
        let (nx, total) = (phase.num_states(), phase.total_nodes());
        let scale: Vec<f64> = (0..nx)
            .map(|i| {
                1.0 + (0..total)
                    .map(|p| x[phase.state_offset(p) + i].abs())
                    .fold(0.0, f64::max)
            })
            .collect();

        let mut errors = Vec::with_capacity(disc.intervals.len());
        for block in &disc.intervals {
            let rule = &block.rule;
            let hh = 0.5 * (x[1] - x[0]) * block.half_width();
            let mut error: f64 = 0.0;
            for piece in &rule.pieces {
                for pair in rule.support[piece.support.clone()].windows(2) {
                    let s = 0.5 * (pair[0] + pair[1]);
                    let tau = block.to_phase_tau(s);
                    let (state, control) = phase.interpolate(x, tau)?;
                    let (first, dbasis) = rule.state_basis_derivative(s);
                    let eval = phase.evaluate_point(
                        state.as_slice(),
                        control.as_slice(),
                        Phase::node_time(x, tau),
                    )?;
                    for i in 0..nx {
                        let deriv: f64 = dbasis
                            .iter()
                            .enumerate()
                            .map(|(j, b)| {
                                b * x[phase.state_offset(block.first_node + first + j) + i]
                            })
                            .sum();
                        error = error.max((deriv - hh * eval.dynamics[i]).abs() / scale[i]);
                    }
                }
            }
            errors.push(error);
        }
        Ok(errors)
    }
}

impl MeshRefinement for ResidualRefinement {
    fn refine(
        &self,
        phase: &Phase,
        decision: &[f64],
    ) -> Result<RefinementDecision, CollocationError> {
        let errors = self.interval_errors(phase, decision)?;
        let max_error = errors.iter().copied().fold(0.0, f64::max);
        if errors.iter().all(|e| *e <= self.tolerance) {
            return Ok(RefinementDecision::Converged { max_error });
        }

        let mesh = phase.mesh().context(UninitializedSnafu {
            action: "refining the mesh",
        })?;
        let scheme = phase.scheme();
        let (min_points, max_points) = scheme.point_range();
        let mut fractions = vec![mesh.fractions()[0]];
        let mut points = Vec::with_capacity(mesh.num_intervals());
        for (k, error) in errors.iter().enumerate() {
            let (start, end) = (mesh.fractions()[k], mesh.fractions()[k + 1]);
            let n = mesh.points()[k];
            if *error <= self.tolerance {
                fractions.push(end);
                points.push(n);
                continue;
            }
            let growth = ((error / self.tolerance).ln() / (n as f64).ln()).ceil();
            let wanted = scheme.admissible_points(n + growth.clamp(1.0, max_points as f64) as usize);
            if wanted <= max_points {
                fractions.push(end);
                points.push(wanted);
            } else {
                let num_sub = 2.max((wanted as f64 / min_points as f64).ceil() as usize);
                for sub in 1..=num_sub {
                    fractions.push(start + (end - start) * sub as f64 / num_sub as f64);
                    points.push(min_points);
                }
            }
        }
        let mesh = Mesh::new(fractions, points)?;
        info!(
            "phase {}: max dynamics residual {max_error:.3e} > {:.1e}, refined to {mesh}",
            phase.index(),
            self.tolerance
        );
        Ok(RefinementDecision::Refine { max_error, mesh })
    }
}

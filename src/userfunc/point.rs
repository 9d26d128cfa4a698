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

use crate::errors::{FailedSnafu, UnknownPhaseSnafu, UserFunctionError};
use crate::linalg::{DMatrix, DVector};
use snafu::ensure;

/// Boundary quantities of a phase exposed to point functions.
#[derive(Clone, Debug, PartialEq)]
pub struct PhaseEndpoints {
    pub initial_time: f64,
    pub final_time: f64,
    pub initial_state: DVector<f64>,
    pub final_state: DVector<f64>,
}

impl PhaseEndpoints {
    /// Number of endpoint quantities: both times and both states.
    pub fn len(&self) -> usize {
        2 + 2 * self.initial_state.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub(crate) fn from_flat(flat: &[f64], num_states: usize) -> Self {
        Self {
            initial_time: flat[0],
            final_time: flat[1],
            initial_state: DVector::from_column_slice(&flat[2..2 + num_states]),
            final_state: DVector::from_column_slice(&flat[2 + num_states..2 + 2 * num_states]),
        }
    }
}

/// Which boundary quantity of a phase a partial derivative is taken with respect to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    InitialTime,
    FinalTime,
    InitialState,
    FinalState,
}

/// Read-only evaluation context of a point function: the boundary quantities of every phase.
#[derive(Clone, Debug)]
pub struct PointInput<'a> {
    phases: &'a [PhaseEndpoints],
}

impl<'a> PointInput<'a> {
    pub fn new(phases: &'a [PhaseEndpoints]) -> Self {
        Self { phases }
    }

    pub fn num_phases(&self) -> usize {
        self.phases.len()
    }

    fn phase(&self, phase: usize) -> Result<&'a PhaseEndpoints, UserFunctionError> {
        self.phases.get(phase).ok_or_else(|| {
            UnknownPhaseSnafu {
                phase,
                num_phases: self.phases.len(),
            }
            .build()
        })
    }

    pub fn initial_state(&self, phase: usize) -> Result<&'a [f64], UserFunctionError> {
        Ok(self.phase(phase)?.initial_state.as_slice())
    }

    pub fn final_state(&self, phase: usize) -> Result<&'a [f64], UserFunctionError> {
        Ok(self.phase(phase)?.final_state.as_slice())
    }

    pub fn initial_time(&self, phase: usize) -> Result<f64, UserFunctionError> {
        Ok(self.phase(phase)?.initial_time)
    }

    pub fn final_time(&self, phase: usize) -> Result<f64, UserFunctionError> {
        Ok(self.phase(phase)?.final_time)
    }
}

/// Outputs of a point function.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PointOutput {
    pub(crate) functions: Option<DVector<f64>>,
    pub(crate) bounds: Option<(DVector<f64>, DVector<f64>)>,
    pub(crate) cost: Option<f64>,
}

impl PointOutput {
    /// Sets the boundary (or linkage) constraint values.
    pub fn set_functions(&mut self, values: &[f64]) {
        self.functions = Some(DVector::from_column_slice(values));
    }

    /// Sets the bounds of the boundary constraints. Only read when the trajectory is initialized.
    pub fn set_function_bounds(&mut self, lower: &[f64], upper: &[f64]) {
        self.bounds = Some((
            DVector::from_column_slice(lower),
            DVector::from_column_slice(upper),
        ));
    }

    /// Sets the cost contribution, added to the integrated phase costs.
    pub fn set_cost(&mut self, cost: f64) {
        self.cost = Some(cost);
    }

    pub fn functions(&self) -> Option<&DVector<f64>> {
        self.functions.as_ref()
    }

    pub fn cost(&self) -> Option<f64> {
        self.cost
    }
}

/// Partials of the point function outputs with respect to the flattened endpoints of all phases.
///
/// The columns of phase `p` are `[t0, tf, x0, xf]`, after the columns of the phases before it.
#[derive(Clone, Debug, PartialEq)]
pub struct PointJacobians {
    pub functions: DMatrix<f64>,
    pub cost: DVector<f64>,
    offsets: Vec<usize>,
    num_states: Vec<usize>,
}

impl PointJacobians {
    pub(crate) fn zeros(num_functions: usize, num_states: &[usize]) -> Self {
        let mut offsets = Vec::with_capacity(num_states.len());
        let mut total = 0;
        for nx in num_states {
            offsets.push(total);
            total += 2 + 2 * nx;
        }
        Self {
            functions: DMatrix::zeros(num_functions, total),
            cost: DVector::zeros(total),
            offsets,
            num_states: num_states.to_vec(),
        }
    }

    /// Column range of that endpoint quantity.
    pub fn columns(
        &self,
        phase: usize,
        wrt: Endpoint,
    ) -> Result<std::ops::Range<usize>, UserFunctionError> {
        let offset = *self.offsets.get(phase).ok_or_else(|| {
            UnknownPhaseSnafu {
                phase,
                num_phases: self.offsets.len(),
            }
            .build()
        })?;
        let nx = self.num_states[phase];
        Ok(match wrt {
            Endpoint::InitialTime => offset..offset + 1,
            Endpoint::FinalTime => offset + 1..offset + 2,
            Endpoint::InitialState => offset + 2..offset + 2 + nx,
            Endpoint::FinalState => offset + 2 + nx..offset + 2 + 2 * nx,
        })
    }

    /// Copies a block of partials of the functions with respect to one endpoint quantity.
    pub fn set_functions_wrt(
        &mut self,
        phase: usize,
        wrt: Endpoint,
        block: &DMatrix<f64>,
    ) -> Result<(), UserFunctionError> {
        let cols = self.columns(phase, wrt)?;
        ensure!(
            block.nrows() == self.functions.nrows() && block.ncols() == cols.len(),
            FailedSnafu {
                msg: format!(
                    "point jacobian block for {wrt:?} of phase {phase} is {:?}, expected {:?}",
                    block.shape(),
                    (self.functions.nrows(), cols.len())
                )
            }
        );
        self.functions
            .view_mut((0, cols.start), (block.nrows(), block.ncols()))
            .copy_from(block);
        Ok(())
    }

    /// Copies the gradient of the cost with respect to one endpoint quantity.
    pub fn set_cost_wrt(
        &mut self,
        phase: usize,
        wrt: Endpoint,
        gradient: &[f64],
    ) -> Result<(), UserFunctionError> {
        let cols = self.columns(phase, wrt)?;
        ensure!(
            gradient.len() == cols.len(),
            FailedSnafu {
                msg: format!(
                    "point cost gradient for {wrt:?} of phase {phase} has {} entries, expected {}",
                    gradient.len(),
                    cols.len()
                )
            }
        );
        for (i, col) in cols.enumerate() {
            self.cost[col] = gradient[i];
        }
        Ok(())
    }
}

/// A problem-specific function evaluated once per evaluation, on the phase boundaries.
///
/// Point functions carry the boundary conditions, the linkage between phases and any cost term
/// that is not an integral.
pub trait UserPointFunction: Send + Sync {
    fn evaluate_functions(
        &self,
        input: &PointInput,
        output: &mut PointOutput,
    ) -> Result<(), UserFunctionError>;

    /// Writes the analytic partials. Only called when [`Self::has_analytic_jacobians`] returns true.
    fn evaluate_jacobians(
        &self,
        _input: &PointInput,
        _jacobians: &mut PointJacobians,
    ) -> Result<(), UserFunctionError> {
        Ok(())
    }

    /// When false, partials are estimated with central finite differences (slower, less accurate).
    fn has_analytic_jacobians(&self) -> bool {
        false
    }
}

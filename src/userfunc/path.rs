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

use crate::errors::UserFunctionError;
use crate::linalg::{DMatrix, DVector};

/// Read-only evaluation context handed to a path function at one node.
#[derive(Copy, Clone, Debug)]
pub struct PathInput<'a> {
    state: &'a [f64],
    control: &'a [f64],
    time: f64,
    phase: usize,
}

impl<'a> PathInput<'a> {
    pub fn new(state: &'a [f64], control: &'a [f64], time: f64, phase: usize) -> Self {
        Self {
            state,
            control,
            time,
            phase,
        }
    }

    pub fn state(&self) -> &'a [f64] {
        self.state
    }

    pub fn control(&self) -> &'a [f64] {
        self.control
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Index of the phase in its trajectory.
    pub fn phase_index(&self) -> usize {
        self.phase
    }
}

/// Outputs of a path function, written through the setters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PathOutput {
    pub(crate) dynamics: Option<DVector<f64>>,
    pub(crate) algebraic: Option<DVector<f64>>,
    pub(crate) algebraic_bounds: Option<(DVector<f64>, DVector<f64>)>,
    pub(crate) cost: Option<f64>,
}

impl PathOutput {
    /// Sets the right hand side of the dynamics, one entry per state.
    pub fn set_dynamics(&mut self, rhs: &[f64]) {
        self.dynamics = Some(DVector::from_column_slice(rhs));
    }

    /// Sets the algebraic path constraint values.
    pub fn set_algebraic(&mut self, values: &[f64]) {
        self.algebraic = Some(DVector::from_column_slice(values));
    }

    /// Sets the bounds of the algebraic path constraints. Only read when the phase is initialized.
    pub fn set_algebraic_bounds(&mut self, lower: &[f64], upper: &[f64]) {
        self.algebraic_bounds = Some((
            DVector::from_column_slice(lower),
            DVector::from_column_slice(upper),
        ));
    }

    /// Sets the integrand of the cost.
    pub fn set_cost(&mut self, integrand: f64) {
        self.cost = Some(integrand);
    }

    pub fn dynamics(&self) -> Option<&DVector<f64>> {
        self.dynamics.as_ref()
    }

    pub fn algebraic(&self) -> Option<&DVector<f64>> {
        self.algebraic.as_ref()
    }

    pub fn cost(&self) -> Option<f64> {
        self.cost
    }
}

/// Partial derivatives of the path function outputs with respect to the node state, control and time.
///
/// All blocks are allocated with the sizes discovered at initialization; user code only writes entries.
#[derive(Clone, Debug, PartialEq)]
pub struct PathJacobians {
    pub dynamics_state: DMatrix<f64>,
    pub dynamics_control: DMatrix<f64>,
    pub dynamics_time: DVector<f64>,
    pub algebraic_state: DMatrix<f64>,
    pub algebraic_control: DMatrix<f64>,
    pub algebraic_time: DVector<f64>,
    pub cost_state: DVector<f64>,
    pub cost_control: DVector<f64>,
    pub cost_time: f64,
}

impl PathJacobians {
    pub fn zeros(
        num_states: usize,
        num_controls: usize,
        num_dynamics: usize,
        num_algebraic: usize,
    ) -> Self {
        Self {
            dynamics_state: DMatrix::zeros(num_dynamics, num_states),
            dynamics_control: DMatrix::zeros(num_dynamics, num_controls),
            dynamics_time: DVector::zeros(num_dynamics),
            algebraic_state: DMatrix::zeros(num_algebraic, num_states),
            algebraic_control: DMatrix::zeros(num_algebraic, num_controls),
            algebraic_time: DVector::zeros(num_algebraic),
            cost_state: DVector::zeros(num_states),
            cost_control: DVector::zeros(num_controls),
            cost_time: 0.0,
        }
    }

    /// Stacks all partials in one matrix: rows are the dynamics, the algebraic constraints and the
    /// cost; columns are the states, the controls and the time.
    pub(crate) fn to_stacked(&self) -> DMatrix<f64> {
        let nd = self.dynamics_state.nrows();
        let na = self.algebraic_state.nrows();
        let nx = self.cost_state.len();
        let nu = self.cost_control.len();
        let mut stacked = DMatrix::zeros(nd + na + 1, nx + nu + 1);
        stacked.view_mut((0, 0), (nd, nx)).copy_from(&self.dynamics_state);
        stacked
            .view_mut((0, nx), (nd, nu))
            .copy_from(&self.dynamics_control);
        stacked
            .view_mut((0, nx + nu), (nd, 1))
            .copy_from(&self.dynamics_time);
        stacked
            .view_mut((nd, 0), (na, nx))
            .copy_from(&self.algebraic_state);
        stacked
            .view_mut((nd, nx), (na, nu))
            .copy_from(&self.algebraic_control);
        stacked
            .view_mut((nd, nx + nu), (na, 1))
            .copy_from(&self.algebraic_time);
        for m in 0..nx {
            stacked[(nd + na, m)] = self.cost_state[m];
        }
        for m in 0..nu {
            stacked[(nd + na, nx + m)] = self.cost_control[m];
        }
        stacked[(nd + na, nx + nu)] = self.cost_time;
        stacked
    }

    /// Splits a stacked matrix, as built by finite differencing, back into the named blocks.
    pub(crate) fn from_stacked(
        stacked: &DMatrix<f64>,
        num_states: usize,
        num_controls: usize,
        num_dynamics: usize,
        num_algebraic: usize,
    ) -> Self {
        let (nx, nu, nd, na) = (num_states, num_controls, num_dynamics, num_algebraic);
        let cost_row = nd + na;
        Self {
            dynamics_state: stacked.view((0, 0), (nd, nx)).into_owned(),
            dynamics_control: stacked.view((0, nx), (nd, nu)).into_owned(),
            dynamics_time: stacked.view((0, nx + nu), (nd, 1)).column(0).into_owned(),
            algebraic_state: stacked.view((nd, 0), (na, nx)).into_owned(),
            algebraic_control: stacked.view((nd, nx), (na, nu)).into_owned(),
            algebraic_time: stacked.view((nd, nx + nu), (na, 1)).column(0).into_owned(),
            cost_state: DVector::from_iterator(nx, (0..nx).map(|m| stacked[(cost_row, m)])),
            cost_control: DVector::from_iterator(
                nu,
                (0..nu).map(|m| stacked[(cost_row, nx + m)]),
            ),
            cost_time: stacked[(cost_row, nx + nu)],
        }
    }

    /// Returns the first shape mismatch against the expected sizes, if any.
    pub(crate) fn shape_error(&self, expected: &Self) -> Option<String> {
        let blocks = [
            ("dynamics state", &self.dynamics_state, &expected.dynamics_state),
            (
                "dynamics control",
                &self.dynamics_control,
                &expected.dynamics_control,
            ),
            (
                "algebraic state",
                &self.algebraic_state,
                &expected.algebraic_state,
            ),
            (
                "algebraic control",
                &self.algebraic_control,
                &expected.algebraic_control,
            ),
        ];
        for (name, actual, wanted) in blocks {
            if actual.shape() != wanted.shape() {
                return Some(format!(
                    "{name} jacobian is {:?}, expected {:?}",
                    actual.shape(),
                    wanted.shape()
                ));
            }
        }
        let vectors = [
            ("dynamics time", &self.dynamics_time, &expected.dynamics_time),
            (
                "algebraic time",
                &self.algebraic_time,
                &expected.algebraic_time,
            ),
            ("cost state", &self.cost_state, &expected.cost_state),
            ("cost control", &self.cost_control, &expected.cost_control),
        ];
        for (name, actual, wanted) in vectors {
            if actual.len() != wanted.len() {
                return Some(format!(
                    "{name} jacobian has {} entries, expected {}",
                    actual.len(),
                    wanted.len()
                ));
            }
        }
        None
    }

    /// True if every entry is finite.
    pub(crate) fn is_finite(&self) -> bool {
        self.dynamics_state.iter().all(|v| v.is_finite())
            && self.dynamics_control.iter().all(|v| v.is_finite())
            && self.dynamics_time.iter().all(|v| v.is_finite())
            && self.algebraic_state.iter().all(|v| v.is_finite())
            && self.algebraic_control.iter().all(|v| v.is_finite())
            && self.algebraic_time.iter().all(|v| v.is_finite())
            && self.cost_state.iter().all(|v| v.is_finite())
            && self.cost_control.iter().all(|v| v.is_finite())
            && self.cost_time.is_finite()
    }
}

/// A problem-specific function evaluated at every node of a phase.
///
/// It produces the right hand side of the dynamics, the algebraic path constraints and the cost
/// integrand. The same function may be shared by several phases, and it is called from several
/// threads at once, hence it must not rely on interior mutability.
pub trait UserPathFunction: Send + Sync {
    /// Evaluates the functions at the provided node. Setting outputs is the only allowed side effect.
    fn evaluate_functions(
        &self,
        input: &PathInput,
        output: &mut PathOutput,
    ) -> Result<(), UserFunctionError>;

    /// Writes the analytic partials. Only called when [`Self::has_analytic_jacobians`] returns true.
    fn evaluate_jacobians(
        &self,
        _input: &PathInput,
        _jacobians: &mut PathJacobians,
    ) -> Result<(), UserFunctionError> {
        Ok(())
    }

    /// When false, the phase estimates the partials with central finite differences, which is
    /// slower and less accurate than analytic partials.
    fn has_analytic_jacobians(&self) -> bool {
        false
    }
}

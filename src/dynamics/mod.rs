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

use crate::linalg::{Matrix6x3, Vector3, Vector6};
use std::fmt;

/// Two-body dynamics on modified equinoctial elements.
pub mod modeq;
pub use self::modeq::ModEqDynamics;

/// Two-body dynamics on the inertial Cartesian position and velocity.
pub mod cartesian;
pub use self::cartesian::CartesianDynamics;

/// Element-space equations of motion of a body subject to a central gravity field and a
/// perturbing acceleration.
///
/// All implementations are pure functions of their inputs and may be called concurrently.
/// They do not guard against the singularities of their representation: a physically invalid
/// state yields non-finite derivatives, which must be caught by the caller.
pub trait OrbitDynamics: Send + Sync + fmt::Debug + fmt::Display {
    /// Derivatives of the elements when no perturbing acceleration is applied.
    fn unforced_rates(&self, state: &Vector6<f64>) -> Vector6<f64>;

    /// Linear map from the perturbing acceleration (in the frame documented by the implementor)
    /// to the element derivatives.
    fn control_matrix(&self, state: &Vector6<f64>) -> Matrix6x3<f64>;

    /// Computes the time derivative of the elements given the perturbing acceleration.
    fn compute_orbit_derivatives(
        &self,
        state: &Vector6<f64>,
        perturbation: &Vector3<f64>,
    ) -> Vector6<f64> {
        self.unforced_rates(state) + self.control_matrix(state) * perturbation
    }
}

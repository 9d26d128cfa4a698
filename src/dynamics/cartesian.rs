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

use super::OrbitDynamics;
use crate::linalg::{Matrix6x3, Vector3, Vector6};
use std::fmt;

/// Point mass gravity on the inertial state `[x, y, z, vx, vy, vz]`.
///
/// The perturbing acceleration is expressed in the same inertial axes. Singular at the origin.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CartesianDynamics {
    pub mu: f64,
}

impl CartesianDynamics {
    pub fn new(mu: f64) -> Self {
        Self { mu }
    }

    pub fn canonical() -> Self {
        Self { mu: 1.0 }
    }
}

impl OrbitDynamics for CartesianDynamics {
    fn unforced_rates(&self, state: &Vector6<f64>) -> Vector6<f64> {
        let radius = state.fixed_rows::<3>(0).into_owned();
        let velocity = state.fixed_rows::<3>(3).into_owned();
        let rmag = radius.norm();
        let accel: Vector3<f64> = -self.mu / rmag.powi(3) * radius;
        Vector6::new(
            velocity[0],
            velocity[1],
            velocity[2],
            accel[0],
            accel[1],
            accel[2],
        )
    }

    fn control_matrix(&self, _state: &Vector6<f64>) -> Matrix6x3<f64> {
        let mut b = Matrix6x3::zeros();
        b.fixed_view_mut::<3, 3>(3, 0).fill_with_identity();
        b
    }
}

impl fmt::Display for CartesianDynamics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cartesian two-body dynamics (mu = {})", self.mu)
    }
}

#[test]
fn cartesian_circular_acceleration() {
    use approx::assert_relative_eq;
    let dynamics = CartesianDynamics::canonical();
    let state = Vector6::new(2.0, 0.0, 0.0, 0.0, (0.5_f64).sqrt(), 0.0);
    let rates = dynamics.compute_orbit_derivatives(&state, &Vector3::new(0.0, 0.0, 0.1));
    assert_relative_eq!(rates[1], (0.5_f64).sqrt());
    assert_relative_eq!(rates[3], -0.25);
    assert_relative_eq!(rates[5], 0.1);
}

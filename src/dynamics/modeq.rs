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

/// Gauss variational equations on the modified equinoctial elements `[p, f, g, h, k, L]`.
///
/// The perturbing acceleration is expressed in the RSW frame of the orbit: radial (along the
/// position vector), transverse (completing the right handed triad in the orbit plane) and
/// normal (along the orbit angular momentum, i.e. "north" is the orbit normal).
///
/// With `w = 1 + f cos L + g sin L` and `s² = 1 + h² + k²`, the equations are singular when
/// `p <= 0` (no square root of `p / μ`) and when `w = 0` (infinite radius, only reachable for
/// hyperbolic `f, g`). Neither case is guarded here.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ModEqDynamics {
    /// Gravitational parameter in the units of the elements (one when non-dimensional).
    pub mu: f64,
}

impl ModEqDynamics {
    pub fn new(mu: f64) -> Self {
        Self { mu }
    }

    /// Non-dimensional dynamics, i.e. μ = 1.
    pub fn canonical() -> Self {
        Self { mu: 1.0 }
    }
}

impl OrbitDynamics for ModEqDynamics {
    fn unforced_rates(&self, state: &Vector6<f64>) -> Vector6<f64> {
        let p = state[0];
        let (sin_l, cos_l) = state[5].sin_cos();
        let w = 1.0 + state[1] * cos_l + state[2] * sin_l;
        let mut rates = Vector6::zeros();
        rates[5] = (self.mu * p).sqrt() * (w / p).powi(2);
        rates
    }

    fn control_matrix(&self, state: &Vector6<f64>) -> Matrix6x3<f64> {
        let p = state[0];
        let f = state[1];
        let g = state[2];
        let h = state[3];
        let k = state[4];
        let (sin_l, cos_l) = state[5].sin_cos();

        let w = 1.0 + f * cos_l + g * sin_l;
        let s2 = 1.0 + h * h + k * k;
        let sqrt_p_mu = (p / self.mu).sqrt();
        let hk = h * sin_l - k * cos_l;

        let mut b = Matrix6x3::zeros();
        // p
        b[(0, 1)] = 2.0 * p / w * sqrt_p_mu;
        // f
        b[(1, 0)] = sqrt_p_mu * sin_l;
        b[(1, 1)] = sqrt_p_mu * ((w + 1.0) * cos_l + f) / w;
        b[(1, 2)] = -sqrt_p_mu * g * hk / w;
        // g
        b[(2, 0)] = -sqrt_p_mu * cos_l;
        b[(2, 1)] = sqrt_p_mu * ((w + 1.0) * sin_l + g) / w;
        b[(2, 2)] = sqrt_p_mu * f * hk / w;
        // h and k
        b[(3, 2)] = sqrt_p_mu * s2 * cos_l / (2.0 * w);
        b[(4, 2)] = sqrt_p_mu * s2 * sin_l / (2.0 * w);
        // L
        b[(5, 2)] = sqrt_p_mu * hk / w;
        b
    }
}

impl fmt::Display for ModEqDynamics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "modified equinoctial dynamics (mu = {})", self.mu)
    }
}

/// Converts modified equinoctial elements into a Cartesian position and velocity.
pub fn modeq_to_cartesian(state: &Vector6<f64>, mu: f64) -> (Vector3<f64>, Vector3<f64>) {
    let p = state[0];
    let f = state[1];
    let g = state[2];
    let h = state[3];
    let k = state[4];
    let (sin_l, cos_l) = state[5].sin_cos();

    let alpha2 = h * h - k * k;
    let s2 = 1.0 + h * h + k * k;
    let w = 1.0 + f * cos_l + g * sin_l;
    let r = p / w;
    let smp = (mu / p).sqrt();

    let pos = Vector3::new(
        r / s2 * (cos_l + alpha2 * cos_l + 2.0 * h * k * sin_l),
        r / s2 * (sin_l - alpha2 * sin_l + 2.0 * h * k * cos_l),
        2.0 * r / s2 * (h * sin_l - k * cos_l),
    );
    let vel = Vector3::new(
        -smp / s2 * (sin_l + alpha2 * sin_l - 2.0 * h * k * cos_l + g - 2.0 * f * h * k + alpha2 * g),
        -smp / s2 * (-cos_l + alpha2 * cos_l + 2.0 * h * k * sin_l - f + 2.0 * g * h * k + alpha2 * f),
        2.0 * smp / s2 * (h * cos_l + k * sin_l + f * h + g * k),
    );
    (pos, vel)
}

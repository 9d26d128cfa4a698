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

use serde_derive::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// Options of the [`InteriorPointSolver`](super::InteriorPointSolver), named after their IPOPT
/// counterparts.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(doc)]
#[serde(default)]
pub struct SolverOptions {
    /// Convergence tolerance on the scaled optimality error.
    #[builder(default = 1e-8)]
    pub tol: f64,
    /// Tolerance of the "acceptable" termination.
    #[builder(default = 1e-6)]
    pub acceptable_tol: f64,
    /// Number of consecutive acceptable iterations before stopping with an acceptable status.
    #[builder(default = 15)]
    pub acceptable_iter: usize,
    /// Absolute tolerance on the constraint violation.
    #[builder(default = 1e-6)]
    pub constr_viol_tol: f64,
    #[builder(default = 3000)]
    pub max_iter: usize,
    /// Initial barrier parameter.
    #[builder(default = 0.1)]
    pub mu_init: f64,
    /// Minimal relative distance of the starting point to its bounds.
    #[builder(default = 1e-2)]
    pub bound_push: f64,
    /// Largest allowed gradient norm before the objective is scaled down.
    #[builder(default = 100.0)]
    pub nlp_scaling_max_gradient: f64,
    /// Iterates larger than this are considered diverging.
    #[builder(default = 1e20)]
    pub diverging_iterates_tol: f64,
    /// Log every iteration at the info level instead of the debug level.
    #[builder(default = false)]
    pub print_iterations: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod ut_options {
    use super::SolverOptions;

    #[test]
    fn builder_defaults() {
        let opts = SolverOptions::builder().max_iter(50).build();
        assert_eq!(opts.max_iter, 50);
        assert_eq!(opts.tol, 1e-8);
        assert_eq!(SolverOptions::default().acceptable_iter, 15);

        let yaml = "tol: 1.0e-10\nprint_iterations: true\n";
        let opts: SolverOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(opts.tol, 1e-10);
        assert!(opts.print_iterations);
        assert_eq!(opts.max_iter, 3000);
    }
}

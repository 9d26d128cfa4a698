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

/*! # nyx-collocation

Direct collocation transcription of multi-phase optimal control problems.

A [`Trajectory`] is a sequence of [`Phase`]s, each one discretized on a mesh of Radau or Lobatto
IIIA collocation intervals, optionally linked by a [`UserPointFunction`]. The transcription is exposed as a sparse
nonlinear program through [`NlpAdapter`], which any IPOPT-like solver may drive; a dense
[`InteriorPointSolver`] is provided for small and medium problems.
*/

/// Scale units of non-dimensional problems.
pub mod units;

/// Sparsity patterns and triplet matrices.
pub mod sparse;

/// Orbital dynamics in Cartesian and modified equinoctial elements.
pub mod dynamics;

/// Meshes, collocation schemes and mesh refinement.
pub mod collocation;

/// Contracts of the problem-specific path and point functions.
pub mod userfunc;

/// A single phase of the trajectory and its transcription.
pub mod phase;

/// Multi-phase transcription, evaluation and optimization.
pub mod trajectory;

/// Nonlinear programming interface and the reference interior point solver.
pub mod nlp;

/// YAML configuration and solution export.
pub mod io;

mod errors;
/// Functions which may fail return one of these errors, this library (almost) never panics.
pub use self::errors::{CollocationError, ConfigError, EvaluationError, UserFunctionError};

pub use self::nlp::{InteriorPointSolver, NlpAdapter, NlpSolver, SolveStatus, SolverOptions};
pub use self::phase::Phase;
pub use self::trajectory::{MeshGuessMode, OptimizationResult, Trajectory};
pub use self::userfunc::{UserPathFunction, UserPointFunction};

#[macro_use]
extern crate log;
extern crate nalgebra as na;

/// Re-export nalgebra
pub mod linalg {
    pub use na::base::*;
}

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

use crate::linalg::DVector;
use serde_derive::{Deserialize, Serialize};
use std::fmt;

mod adapter;
pub use adapter::{BestSolution, NlpAdapter, FEASIBILITY_TOL};

mod ipm;
pub use ipm::InteriorPointSolver;

mod options;
pub use options::SolverOptions;

mod scaling;
pub use scaling::{NlpScaling, CONSTRAINT_WEIGHT_RANGE};

/// Index base of the sparse structures exchanged with the solver.
///
/// Every structure produced by this crate is zero based; solvers expecting one based indices
/// must convert at their boundary.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexStyle {
    #[default]
    CStyle,
    FortranStyle,
}

/// Sizes of the nonlinear program.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NlpInfo {
    pub num_variables: usize,
    pub num_constraints: usize,
    pub nnz_jacobian: usize,
    pub nnz_hessian: usize,
    pub index_style: IndexStyle,
}

/// A sparse matrix request: either its structure or its values, never both.
#[derive(Debug)]
pub enum SparseEval<'a> {
    Structure {
        rows: &'a mut [usize],
        cols: &'a mut [usize],
    },
    Values {
        x: &'a [f64],
        new_x: bool,
        values: &'a mut [f64],
    },
}

/// A request on the Hessian of the Lagrangian `σ ∇²f + Σ λ_i ∇²g_i`, lower triangle only.
#[derive(Debug)]
pub enum HessianEval<'a> {
    Structure {
        rows: &'a mut [usize],
        cols: &'a mut [usize],
    },
    Values {
        x: &'a [f64],
        new_x: bool,
        obj_factor: f64,
        lambda: &'a [f64],
        new_lambda: bool,
        values: &'a mut [f64],
    },
}

/// Summary of one solver iteration, handed to the intermediate callback.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct IterationStats {
    pub iteration: usize,
    pub objective: f64,
    pub primal_infeasibility: f64,
    pub dual_infeasibility: f64,
    pub barrier: f64,
    pub step_size: f64,
    pub regularization: f64,
}

impl fmt::Display for IterationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>4} {:>+14.7e} {:>9.2e} {:>9.2e} {:>7.1e} {:>8.2e} {:>7.1e}",
            self.iteration,
            self.objective,
            self.primal_infeasibility,
            self.dual_infeasibility,
            self.barrier,
            self.step_size,
            self.regularization
        )
    }
}

/// Termination status of a solve, named after the IPOPT return codes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    SolveSucceeded,
    SolvedToAcceptableLevel,
    FeasiblePointFound,
    InfeasibleProblemDetected,
    SearchDirectionBecomesTooSmall,
    DivergingIterates,
    UserRequestedStop,
    MaximumIterationsExceeded,
    RestorationFailed,
    ErrorInStepComputation,
    InvalidNumberDetected,
    InternalError,
}

impl SolveStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::SolveSucceeded | Self::SolvedToAcceptableLevel)
    }

    /// Mesh refinement only follows a solution close to optimal, never an infeasible problem or a
    /// failure of the solver.
    pub fn allows_mesh_refinement(&self) -> bool {
        matches!(
            self,
            Self::SolveSucceeded
                | Self::SolvedToAcceptableLevel
                | Self::FeasiblePointFound
                | Self::SearchDirectionBecomesTooSmall
        )
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::SolveSucceeded => "optimal solution found",
            Self::SolvedToAcceptableLevel => "solved to acceptable level",
            Self::FeasiblePointFound => "feasible point found",
            Self::InfeasibleProblemDetected => "infeasible problem detected",
            Self::SearchDirectionBecomesTooSmall => "search direction becomes too small",
            Self::DivergingIterates => "diverging iterates",
            Self::UserRequestedStop => "stopped by the user",
            Self::MaximumIterationsExceeded => "maximum number of iterations exceeded",
            Self::RestorationFailed => "restoration failed",
            Self::ErrorInStepComputation => "error in step computation",
            Self::InvalidNumberDetected => "invalid number detected",
            Self::InternalError => "internal error",
        };
        write!(f, "{msg}")
    }
}

/// Final iterate of a solve, handed to [`NlpProblem::finalize_solution`].
#[derive(Copy, Clone, Debug)]
pub struct FinalSolution<'a> {
    pub status: SolveStatus,
    pub x: &'a [f64],
    pub z_lower: &'a [f64],
    pub z_upper: &'a [f64],
    pub g: &'a [f64],
    pub lambda: &'a [f64],
    pub objective: f64,
}

/// Callback set of a sparse nonlinear program, in the form expected by IPOPT-like solvers.
///
/// Evaluation callbacks return `false` when the problem cannot be evaluated at the provided
/// point; the solver is then expected to try another iterate.
pub trait NlpProblem {
    fn get_nlp_info(&self) -> NlpInfo;

    fn get_bounds_info(
        &self,
        x_lower: &mut [f64],
        x_upper: &mut [f64],
        g_lower: &mut [f64],
        g_upper: &mut [f64],
    ) -> bool;

    fn get_starting_point(&self, x: &mut [f64]) -> bool;

    fn eval_f(&mut self, x: &[f64], new_x: bool, obj_value: &mut f64) -> bool;

    fn eval_grad_f(&mut self, x: &[f64], new_x: bool, grad_f: &mut [f64]) -> bool;

    fn eval_g(&mut self, x: &[f64], new_x: bool, g: &mut [f64]) -> bool;

    fn eval_jac_g(&mut self, request: SparseEval) -> bool;

    fn eval_h(&mut self, request: HessianEval) -> bool;

    /// Called once per iteration, returning false stops the solve.
    fn intermediate_callback(&mut self, _stats: &IterationStats) -> bool {
        true
    }

    fn finalize_solution(&mut self, _solution: &FinalSolution) {}
}

/// Outcome of a solve.
#[derive(Clone, Debug, PartialEq)]
pub struct SolveReport {
    pub status: SolveStatus,
    pub x: DVector<f64>,
    pub objective: f64,
    pub iterations: usize,
    /// Largest violation of the constraint bounds at `x`.
    pub constraint_violation: f64,
}

/// A nonlinear programming solver driving an [`NlpProblem`].
pub trait NlpSolver {
    fn solve(&self, problem: &mut dyn NlpProblem) -> SolveReport;
}

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

use crate::collocation::{MeshRefinement, RefinementDecision, ResidualRefinement};
use crate::errors::{
    CollocationError, ConfigError, DecisionVectorSizeSnafu, EvaluationError, InvalidValueSnafu,
    MissingConfigurationSnafu, MultiplierSizeSnafu, NotInitializedSnafu, UninitializedSnafu,
    UnsupportedOptionSnafu,
};
use crate::linalg::{DMatrix, DVector};
use crate::nlp::{NlpAdapter, NlpSolver, SolveReport, SolveStatus};
use crate::phase::Phase;
use crate::sparse::{SparsityPattern, TripletMatrix};
use crate::userfunc::UserPointFunction;
use serde_derive::{Deserialize, Serialize};
use snafu::prelude::*;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;

mod boundary;
use boundary::{PointEvaluation, PointInfo};

mod solution;
pub use solution::OptimizationResult;

/// Relative step of the forward differences of the Lagrangian gradient.
pub const HESSIAN_FD_STEP: f64 = 1e-6;

/// Default maximum number of mesh refinements after the first solve.
pub const DEFAULT_MAX_MESH_REFINEMENT_COUNT: usize = 5;

/// Decision vector from which the next mesh is refined and warm started.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeshGuessMode {
    /// The iterate returned by the solver.
    #[default]
    CurrentSolution,
    /// The best iterate evaluated during the solve, see [`crate::nlp::BestSolution`].
    BestSolution,
}

impl FromStr for MeshGuessMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CurrentSolution" => Ok(Self::CurrentSolution),
            "BestSolution" => Ok(Self::BestSolution),
            _ => UnsupportedOptionSnafu {
                field: "mesh guess mode",
                value: s,
                supported: "`CurrentSolution`, `BestSolution`",
            }
            .fail(),
        }
    }
}

/// How much of the problem is evaluated at the current decision vector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum CacheLevel {
    Stale,
    Functions,
    Jacobians,
}

/// Global layout of the transcribed problem, built by [`Trajectory::initialize`].
#[derive(Clone, Debug)]
struct Layout {
    var_offsets: Vec<usize>,
    con_offsets: Vec<usize>,
    num_variables: usize,
    num_constraints: usize,
    point_row_offset: usize,
    point: Option<PointInfo>,
    jacobian: SparsityPattern,
    hessian: SparsityPattern,
    /// Global Jacobian position of every entry of each phase pattern.
    phase_positions: Vec<Vec<usize>>,
    /// (function row, flattened endpoint, global Jacobian position) of the point function partials.
    point_positions: Vec<(usize, usize, usize)>,
}

/// Variable and constraint bounds of the whole problem.
#[derive(Clone, Debug, PartialEq)]
pub struct ProblemBounds {
    pub x_lower: DVector<f64>,
    pub x_upper: DVector<f64>,
    pub g_lower: DVector<f64>,
    pub g_upper: DVector<f64>,
}

/// A sequence of phases, optionally linked by a point function, transcribed into one sparse NLP.
///
/// The decision vector is the concatenation of the phase decision vectors, phase 0 first. The
/// constraints are the phase constraints in the same order, followed by the point functions.
pub struct Trajectory {
    phases: Vec<Phase>,
    point_function: Option<Arc<dyn UserPointFunction>>,
    cost_lower: f64,
    cost_upper: f64,
    max_mesh_refinement_count: usize,
    refinement: Arc<dyn MeshRefinement>,
    allow_failed_mesh_optimizations: bool,
    mesh_guess_mode: MeshGuessMode,
    auto_scaling: bool,
    cost_scaling: f64,
    layout: Option<Layout>,
    decision: DVector<f64>,
    cache: CacheLevel,
    point_eval: Option<PointEvaluation>,
}

impl Default for Trajectory {
    fn default() -> Self {
        Self::new()
    }
}

impl Trajectory {
    pub fn new() -> Self {
        Self {
            phases: Vec::new(),
            point_function: None,
            cost_lower: f64::NEG_INFINITY,
            cost_upper: f64::INFINITY,
            max_mesh_refinement_count: DEFAULT_MAX_MESH_REFINEMENT_COUNT,
            refinement: Arc::new(ResidualRefinement::default()),
            allow_failed_mesh_optimizations: false,
            mesh_guess_mode: MeshGuessMode::default(),
            auto_scaling: false,
            cost_scaling: 1.0,
            layout: None,
            decision: DVector::zeros(0),
            cache: CacheLevel::Stale,
            point_eval: None,
        }
    }

    fn invalidate(&mut self) {
        self.layout = None;
        self.cache = CacheLevel::Stale;
        self.point_eval = None;
    }

    /// Appends a phase and returns its index.
    pub fn add_phase(&mut self, phase: Phase) -> usize {
        self.phases.push(phase);
        self.invalidate();
        self.phases.len() - 1
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn phase(&self, index: usize) -> Option<&Phase> {
        self.phases.get(index)
    }

    /// Mutable access to a phase. The trajectory must be initialized again afterwards.
    pub fn phase_mut(&mut self, index: usize) -> Option<&mut Phase> {
        self.invalidate();
        self.phases.get_mut(index)
    }

    pub fn num_phases(&self) -> usize {
        self.phases.len()
    }

    pub fn set_point_function(&mut self, func: Arc<dyn UserPointFunction>) {
        self.point_function = Some(func);
        self.invalidate();
    }

    pub fn set_cost_bounds(&mut self, lower: f64, upper: f64) -> Result<(), ConfigError> {
        ensure!(
            !lower.is_nan() && !upper.is_nan() && lower <= upper,
            InvalidValueSnafu {
                field: "cost bounds",
                value: format!("[{lower}, {upper}]"),
                expected: "lower <= upper",
            }
        );
        self.cost_lower = lower;
        self.cost_upper = upper;
        Ok(())
    }

    pub fn cost_bounds(&self) -> (f64, f64) {
        (self.cost_lower, self.cost_upper)
    }

    /// Maximum number of mesh refinements after the first solve, zero disables refinement.
    pub fn set_max_mesh_refinement_count(&mut self, count: usize) {
        self.max_mesh_refinement_count = count;
    }

    pub fn max_mesh_refinement_count(&self) -> usize {
        self.max_mesh_refinement_count
    }

    pub fn set_mesh_refinement(&mut self, policy: Arc<dyn MeshRefinement>) {
        self.refinement = policy;
    }

    /// Whether the mesh is still refined after a solve which neither converged nor found a
    /// feasible point. Off by default.
    pub fn set_failed_mesh_optimization_allowance(&mut self, allow: bool) {
        self.allow_failed_mesh_optimizations = allow;
    }

    pub fn failed_mesh_optimization_allowance(&self) -> bool {
        self.allow_failed_mesh_optimizations
    }

    pub fn set_mesh_guess_mode(&mut self, mode: MeshGuessMode) {
        self.mesh_guess_mode = mode;
    }

    pub fn mesh_guess_mode(&self) -> MeshGuessMode {
        self.mesh_guess_mode
    }

    /// Scales the variables and the constraints seen by the solver, see [`crate::nlp::NlpScaling`].
    pub fn set_auto_scaling(&mut self, enabled: bool) {
        self.auto_scaling = enabled;
    }

    pub fn auto_scaling(&self) -> bool {
        self.auto_scaling
    }

    /// Weight of the cost when the problem is scaled.
    pub fn set_cost_scaling(&mut self, weight: f64) -> Result<(), ConfigError> {
        ensure!(
            weight.is_finite() && weight > 0.0,
            InvalidValueSnafu {
                field: "cost scaling",
                value: weight.to_string(),
                expected: "a positive weight",
            }
        );
        self.cost_scaling = weight;
        Ok(())
    }

    pub fn cost_scaling(&self) -> f64 {
        self.cost_scaling
    }

    pub fn is_initialized(&self) -> bool {
        self.layout.is_some()
    }

    /// Initializes every phase, discovers the point function and builds the global sparsity patterns.
    ///
    /// The decision vector is reset to the phase initial guesses.
    pub fn initialize(&mut self) -> Result<(), CollocationError> {
        self.invalidate();
        ensure!(
            !self.phases.is_empty(),
            MissingConfigurationSnafu {
                what: "at least one phase",
                action: "initializing a trajectory",
            }
        );

        let mut var_offsets = Vec::with_capacity(self.phases.len());
        let mut con_offsets = Vec::with_capacity(self.phases.len());
        let (mut num_variables, mut num_constraints) = (0, 0);
        for (i, phase) in self.phases.iter_mut().enumerate() {
            phase.set_index(i);
            if !phase.is_initialized() {
                phase.initialize()?;
            }
            var_offsets.push(num_variables);
            con_offsets.push(num_constraints);
            num_variables += phase.num_decision_variables();
            num_constraints += phase.num_constraints();
        }

        let mut decision = DVector::zeros(num_variables);
        let mut x_lower = DVector::zeros(num_variables);
        let mut x_upper = DVector::zeros(num_variables);
        for (i, phase) in self.phases.iter().enumerate() {
            let n = phase.num_decision_variables();
            decision
                .rows_mut(var_offsets[i], n)
                .copy_from(phase.initial_guess()?);
            let (lower, upper) = phase.decision_bounds()?;
            x_lower.rows_mut(var_offsets[i], n).copy_from(&lower);
            x_upper.rows_mut(var_offsets[i], n).copy_from(&upper);
        }

        let point = match &self.point_function {
            Some(func) => {
                let mut columns = Vec::new();
                let mut num_states = Vec::with_capacity(self.phases.len());
                for (i, phase) in self.phases.iter().enumerate() {
                    columns.extend(phase.endpoint_columns().iter().map(|c| c + var_offsets[i]));
                    num_states.push(phase.num_states());
                }
                let guess: Vec<f64> = columns.iter().map(|c| decision[*c]).collect();
                let lower: Vec<f64> = columns.iter().map(|c| x_lower[*c]).collect();
                let upper: Vec<f64> = columns.iter().map(|c| x_upper[*c]).collect();
                Some(boundary::discover(
                    func.as_ref(),
                    &guess,
                    (&lower, &upper),
                    num_states,
                    columns,
                )?)
            }
            None => None,
        };
        let point_row_offset = num_constraints;
        num_constraints += point.as_ref().map(|p| p.num_functions).unwrap_or(0);

        let mut jacobian = SparsityPattern::new(num_constraints, num_variables);
        let mut hessian = SparsityPattern::new(num_variables, num_variables);
        let mut phase_positions = Vec::with_capacity(self.phases.len());
        for (i, phase) in self.phases.iter().enumerate() {
            let positions = phase
                .jacobian_pattern()?
                .iter()
                .map(|(r, c)| jacobian.insert(r + con_offsets[i], c + var_offsets[i]))
                .collect();
            phase_positions.push(positions);
            for block in phase.hessian_blocks()? {
                let global: Vec<usize> = block.iter().map(|c| c + var_offsets[i]).collect();
                hessian.insert_lower_triangle(&global);
            }
        }
        let mut point_positions = Vec::new();
        if let Some(info) = &point {
            for f in 0..info.num_functions {
                for (k, col) in info.columns.iter().enumerate() {
                    if info.dependencies[(f, k)] {
                        let pos = jacobian.insert(point_row_offset + f, *col);
                        point_positions.push((f, k, pos));
                    }
                }
            }
            hessian.insert_lower_triangle(&info.columns);
        }

        info!(
            "trajectory initialized: {} phase(s), {num_variables} variables, {num_constraints} constraints, {} jacobian and {} hessian non-zeros",
            self.phases.len(),
            jacobian.nnz(),
            hessian.nnz()
        );

        self.layout = Some(Layout {
            var_offsets,
            con_offsets,
            num_variables,
            num_constraints,
            point_row_offset,
            point,
            jacobian,
            hessian,
            phase_positions,
            point_positions,
        });
        self.decision = decision;
        self.cache = CacheLevel::Stale;
        Ok(())
    }

    fn layout(&self, action: &'static str) -> Result<&Layout, ConfigError> {
        self.layout.as_ref().context(NotInitializedSnafu {
            what: "trajectory",
            action,
        })
    }

    pub fn num_variables(&self) -> usize {
        self.layout.as_ref().map(|l| l.num_variables).unwrap_or(0)
    }

    pub fn num_constraints(&self) -> usize {
        self.layout.as_ref().map(|l| l.num_constraints).unwrap_or(0)
    }

    /// Range of the decision vector covered by a phase.
    pub fn phase_variables(&self, index: usize) -> Option<Range<usize>> {
        let layout = self.layout.as_ref()?;
        let phase = self.phases.get(index)?;
        let start = layout.var_offsets[index];
        Some(start..start + phase.num_decision_variables())
    }

    /// Range of the constraint vector covered by a phase.
    pub fn phase_constraints(&self, index: usize) -> Option<Range<usize>> {
        let layout = self.layout.as_ref()?;
        let phase = self.phases.get(index)?;
        let start = layout.con_offsets[index];
        Some(start..start + phase.num_constraints())
    }

    pub fn decision_vector(&self) -> &DVector<f64> {
        &self.decision
    }

    /// Overwrites the whole decision vector.
    pub fn set_decision_vector(&mut self, x: &[f64]) -> Result<(), EvaluationError> {
        let expected = self.num_variables();
        ensure!(
            self.layout.is_some(),
            UninitializedSnafu {
                action: "setting the decision vector",
            }
        );
        ensure!(
            x.len() == expected,
            DecisionVectorSizeSnafu {
                expected,
                actual: x.len(),
            }
        );
        self.decision.copy_from_slice(x);
        self.cache = CacheLevel::Stale;
        self.point_eval = None;
        Ok(())
    }

    /// Variable and constraint bounds.
    pub fn bounds(&self) -> Result<ProblemBounds, ConfigError> {
        let layout = self.layout("building the bounds")?;
        let mut bounds = ProblemBounds {
            x_lower: DVector::zeros(layout.num_variables),
            x_upper: DVector::zeros(layout.num_variables),
            g_lower: DVector::zeros(layout.num_constraints),
            g_upper: DVector::zeros(layout.num_constraints),
        };
        for (i, phase) in self.phases.iter().enumerate() {
            let (xl, xu) = phase.decision_bounds()?;
            bounds.x_lower.rows_mut(layout.var_offsets[i], xl.len()).copy_from(&xl);
            bounds.x_upper.rows_mut(layout.var_offsets[i], xu.len()).copy_from(&xu);
            let (gl, gu) = phase.constraint_bounds()?;
            bounds.g_lower.rows_mut(layout.con_offsets[i], gl.len()).copy_from(&gl);
            bounds.g_upper.rows_mut(layout.con_offsets[i], gu.len()).copy_from(&gu);
        }
        if let Some(info) = &layout.point {
            let nf = info.num_functions;
            bounds
                .g_lower
                .rows_mut(layout.point_row_offset, nf)
                .copy_from(&info.lower);
            bounds
                .g_upper
                .rows_mut(layout.point_row_offset, nf)
                .copy_from(&info.upper);
        }
        Ok(bounds)
    }

    /// For each constraint row, the global state variable it constrains if it is a defect.
    pub fn defect_state_columns(&self) -> Result<Vec<Option<usize>>, ConfigError> {
        let layout = self.layout("listing the defect constraints")?;
        let mut columns = vec![None; layout.num_constraints];
        for (i, phase) in self.phases.iter().enumerate() {
            let nx = phase.num_states();
            let num_defects = phase
                .discretization()
                .map(|d| d.num_collocation_nodes())
                .unwrap_or(0);
            for p in 0..num_defects {
                for d in 0..nx {
                    columns[layout.con_offsets[i] + p * nx + d] =
                        Some(layout.var_offsets[i] + phase.state_offset(p) + d);
                }
            }
        }
        Ok(columns)
    }

    /// Constraints shifted by their lower bound and divided by the width of their bounds, along
    /// with whether each one is an equality. Equalities and half bounded constraints are only
    /// shifted.
    pub fn scaled_constraint_functions(
        &mut self,
    ) -> Result<(DVector<f64>, Vec<bool>), CollocationError> {
        let (_, g) = self.cost_constraint_functions()?;
        let bounds = self.bounds()?;
        let mut equality = vec![false; g.len()];
        let mut scaled = DVector::zeros(g.len());
        for (r, v) in g.iter().enumerate() {
            let (lower, upper) = (bounds.g_lower[r], bounds.g_upper[r]);
            equality[r] = lower == upper;
            scaled[r] = match (lower.is_finite(), upper.is_finite()) {
                (true, true) if upper > lower => (v - lower) / (upper - lower),
                (true, _) => v - lower,
                (false, true) => v - upper,
                (false, false) => *v,
            };
        }
        Ok((scaled, equality))
    }

    /// Brings the cached evaluation up to the requested level.
    fn evaluate(&mut self, level: CacheLevel) -> Result<(), EvaluationError> {
        if self.cache >= level {
            return Ok(());
        }
        let layout = self.layout.as_ref().context(UninitializedSnafu {
            action: "evaluating the trajectory",
        })?;
        let with_jacobians = level == CacheLevel::Jacobians;
        for (i, phase) in self.phases.iter_mut().enumerate() {
            let start = layout.var_offsets[i];
            let x = &self.decision.as_slice()[start..start + phase.num_decision_variables()];
            phase.evaluate(x, with_jacobians)?;
        }
        self.point_eval = match (&self.point_function, &layout.point) {
            (Some(func), Some(info)) => {
                let flat: Vec<f64> = info.columns.iter().map(|c| self.decision[*c]).collect();
                Some(boundary::evaluate(
                    func.as_ref(),
                    &flat,
                    info,
                    with_jacobians,
                )?)
            }
            _ => None,
        };
        self.cache = level;
        trace!("trajectory evaluated ({level:?})");
        Ok(())
    }

    fn phase_slice(&self, layout: &Layout, index: usize) -> &[f64] {
        let start = layout.var_offsets[index];
        &self.decision.as_slice()[start..start + self.phases[index].num_decision_variables()]
    }

    /// Cost and constraint values at the current decision vector, in one pass.
    pub fn cost_constraint_functions(&mut self) -> Result<(f64, DVector<f64>), EvaluationError> {
        self.evaluate(CacheLevel::Functions)?;
        let layout = self.layout.as_ref().context(UninitializedSnafu {
            action: "evaluating the trajectory",
        })?;
        let mut cost = 0.0;
        let mut g = DVector::zeros(layout.num_constraints);
        for (i, phase) in self.phases.iter().enumerate() {
            let x = self.phase_slice(layout, i);
            cost += phase.cost(x)?;
            let gi = phase.constraint_values(x)?;
            g.rows_mut(layout.con_offsets[i], gi.len()).copy_from(&gi);
        }
        if let Some(point) = &self.point_eval {
            cost += point.cost;
            g.rows_mut(layout.point_row_offset, point.functions.len())
                .copy_from(&point.functions);
        }
        Ok((cost, g))
    }

    /// Dense gradient of the cost with respect to the decision vector.
    pub fn cost_gradient(&mut self) -> Result<DVector<f64>, EvaluationError> {
        self.evaluate(CacheLevel::Jacobians)?;
        let layout = self.layout.as_ref().context(UninitializedSnafu {
            action: "evaluating the trajectory",
        })?;
        let mut grad = DVector::zeros(layout.num_variables);
        for (i, phase) in self.phases.iter().enumerate() {
            let gi = phase.cost_gradient(self.phase_slice(layout, i))?;
            grad.rows_mut(layout.var_offsets[i], gi.len())
                .copy_from(&gi);
        }
        if let (Some(point), Some(info)) = (&self.point_eval, &layout.point) {
            if let Some(jac) = &point.jacobian {
                for (k, col) in info.columns.iter().enumerate() {
                    grad[*col] += jac[(info.num_functions, k)];
                }
            }
        }
        Ok(grad)
    }

    /// Constraint Jacobian values, in the order of [`Trajectory::jacobian_sparsity_pattern`].
    pub fn constraint_jacobian_values(&mut self) -> Result<Vec<f64>, EvaluationError> {
        self.evaluate(CacheLevel::Jacobians)?;
        let layout = self.layout.as_ref().context(UninitializedSnafu {
            action: "evaluating the trajectory",
        })?;
        let mut values = vec![0.0; layout.jacobian.nnz()];
        for (i, phase) in self.phases.iter().enumerate() {
            let local = phase.jacobian_values(self.phase_slice(layout, i))?;
            for (value, pos) in local.iter().zip(&layout.phase_positions[i]) {
                values[*pos] += value;
            }
        }
        if let Some(jac) = self.point_eval.as_ref().and_then(|p| p.jacobian.as_ref()) {
            for (f, k, pos) in &layout.point_positions {
                values[*pos] += jac[(*f, *k)];
            }
        }
        Ok(values)
    }

    /// Constraint Jacobian at the current decision vector.
    pub fn constraint_jacobian(&mut self) -> Result<TripletMatrix, EvaluationError> {
        let values = self.constraint_jacobian_values()?;
        let layout = self.layout.as_ref().context(UninitializedSnafu {
            action: "assembling the jacobian",
        })?;
        let mut jac = TripletMatrix::new(layout.num_constraints, layout.num_variables);
        for ((r, c), v) in layout.jacobian.iter().zip(values) {
            jac.push(r, c, v);
        }
        Ok(jac)
    }

    /// Cached Jacobian structure, rebuilt only by [`Trajectory::initialize`].
    pub fn jacobian_sparsity_pattern(&self) -> Result<&SparsityPattern, ConfigError> {
        Ok(&self.layout("querying the jacobian structure")?.jacobian)
    }

    /// Lower triangle of the Hessian of the Lagrangian.
    pub fn hessian_sparsity_pattern(&self) -> Result<&SparsityPattern, ConfigError> {
        Ok(&self.layout("querying the hessian structure")?.hessian)
    }

    /// `σ ∇f + Jᵀ λ` at the current decision vector.
    pub fn lagrangian_gradient(
        &mut self,
        obj_factor: f64,
        lambda: &[f64],
    ) -> Result<DVector<f64>, EvaluationError> {
        let expected = self.num_constraints();
        ensure!(
            lambda.len() == expected,
            MultiplierSizeSnafu {
                expected,
                actual: lambda.len(),
            }
        );
        let grad = self.cost_gradient()?;
        let jac = self.constraint_jacobian()?;
        Ok(grad * obj_factor + jac.transpose_mul_vector(lambda))
    }

    /// Values of the Hessian of the Lagrangian `σ ∇²f + Σ λ_i ∇²g_i` on the Hessian pattern.
    ///
    /// Columns are forward differences of the Lagrangian gradient, then symmetrized. The decision
    /// vector is restored afterwards, even on failure.
    pub fn compute_hessian_contraction(
        &mut self,
        obj_factor: f64,
        lambda: &[f64],
    ) -> Result<Vec<f64>, EvaluationError> {
        let x0 = self.decision.clone();
        let base = self.lagrangian_gradient(obj_factor, lambda)?;
        let n = x0.len();
        let mut hess = DMatrix::zeros(n, n);
        for c in 0..n {
            let h = HESSIAN_FD_STEP * (1.0 + x0[c].abs());
            let mut xp = x0.clone();
            xp[c] += h;
            let perturbed = self
                .set_decision_vector(xp.as_slice())
                .and_then(|_| self.lagrangian_gradient(obj_factor, lambda));
            match perturbed {
                Ok(grad) => hess.set_column(c, &((grad - &base) / h)),
                Err(e) => {
                    self.set_decision_vector(x0.as_slice())?;
                    return Err(e);
                }
            }
        }
        self.set_decision_vector(x0.as_slice())?;
        let layout = self.layout.as_ref().context(UninitializedSnafu {
            action: "computing the hessian",
        })?;
        Ok(layout
            .hessian
            .iter()
            .map(|(r, c)| 0.5 * (hess[(r, c)] + hess[(c, r)]))
            .collect())
    }

    /// Largest violation of the constraint bounds at the current decision vector.
    pub fn max_constraint_violation(&mut self) -> Result<f64, CollocationError> {
        Ok(self.cost_and_violation()?.1)
    }

    fn cost_and_violation(&mut self) -> Result<(f64, f64), CollocationError> {
        let (cost, g) = self.cost_constraint_functions()?;
        let bounds = self.bounds()?;
        let violation = g
            .iter()
            .zip(bounds.g_lower.iter().zip(bounds.g_upper.iter()))
            .map(|(g, (l, u))| (l - g).max(g - u).max(0.0))
            .fold(0.0, f64::max);
        Ok((cost, violation))
    }

    /// Solves the problem, then refines the mesh and solves again until the refinement policy is
    /// satisfied or the maximum refinement count is reached.
    ///
    /// Only configuration errors are returned. A failure to evaluate the final point is recorded
    /// in the result, along with the status of the last solve.
    pub fn optimize(
        &mut self,
        solver: &dyn NlpSolver,
    ) -> Result<OptimizationResult, CollocationError> {
        if !self.is_initialized() {
            self.initialize()?;
        }
        let mut refinement_count = 0;
        let mut num_solves = 0;
        loop {
            let (auto_scaling, cost_scaling) = (self.auto_scaling, self.cost_scaling);
            let (report, best) = {
                let mut adapter = if auto_scaling {
                    NlpAdapter::with_scaling(self, cost_scaling)?
                } else {
                    NlpAdapter::new(self)
                };
                let report = solver.solve(&mut adapter);
                (
                    adapter.unscale_report(report),
                    adapter.best_solution().cloned(),
                )
            };
            num_solves += 1;
            if report.x.len() == self.num_variables() {
                self.set_decision_vector(report.x.as_slice())?;
            }
            if report.status.is_converged() {
                info!(
                    "solve #{num_solves}: {} after {} iterations, cost = {:.9e}",
                    report.status, report.iterations, report.objective
                );
            } else {
                warn!(
                    "solve #{num_solves}: {} after {} iterations, cost = {:.9e}",
                    report.status, report.iterations, report.objective
                );
            }

            if report.status == SolveStatus::UserRequestedStop {
                warn!("solve stopped on request, no mesh refinement");
                return Ok(self.result(&report, false, refinement_count, num_solves));
            }
            if !report.status.allows_mesh_refinement() {
                if !self.allow_failed_mesh_optimizations {
                    warn!("no mesh refinement after status `{}`", report.status);
                    return Ok(self.result(&report, false, refinement_count, num_solves));
                }
                warn!(
                    "refining the mesh after status `{}`, failed mesh optimizations are allowed",
                    report.status
                );
            }
            if refinement_count >= self.max_mesh_refinement_count {
                if self.max_mesh_refinement_count > 0 {
                    warn!(
                        "maximum mesh refinement count ({}) reached, solution is not mesh converged",
                        self.max_mesh_refinement_count
                    );
                }
                return Ok(self.result(&report, false, refinement_count, num_solves));
            }

            if self.mesh_guess_mode == MeshGuessMode::BestSolution {
                if let Some(best) = best.filter(|b| b.decision_vector.len() == self.num_variables())
                {
                    debug!(
                        "mesh guess from the best iterate: cost = {:.9e}, max violation = {:.3e}",
                        best.cost, best.max_violation
                    );
                    self.set_decision_vector(best.decision_vector.as_slice())?;
                }
            }

            let mut decisions = Vec::with_capacity(self.phases.len());
            for (i, phase) in self.phases.iter().enumerate() {
                let range = self.phase_variables(i).context(UninitializedSnafu {
                    action: "refining the mesh",
                })?;
                decisions.push(
                    self.refinement
                        .refine(phase, &self.decision.as_slice()[range])?,
                );
            }
            if decisions.iter().all(|d| d.is_converged()) {
                info!("mesh converged after {refinement_count} refinement(s)");
                return Ok(self.result(&report, true, refinement_count, num_solves));
            }

            for (i, decision) in decisions.into_iter().enumerate() {
                let range = self.phase_variables(i).context(UninitializedSnafu {
                    action: "refining the mesh",
                })?;
                let x = self.decision.as_slice()[range].to_vec();
                let phase = &mut self.phases[i];
                match decision {
                    RefinementDecision::Refine { mesh, .. } => {
                        let warm = phase.interpolate_onto(&x, &mesh)?;
                        phase.refine_mesh(mesh, warm);
                    }
                    RefinementDecision::Converged { .. } => {
                        phase.set_warm_start(DVector::from_vec(x));
                    }
                }
            }
            refinement_count += 1;
            self.initialize()?;
        }
    }

    fn result(
        &mut self,
        report: &SolveReport,
        mesh_converged: bool,
        refinement_count: usize,
        num_solves: usize,
    ) -> OptimizationResult {
        let (cost, max_violation, evaluation_error) = match self.cost_and_violation() {
            Ok((cost, violation)) => (cost, violation, None),
            Err(e) => {
                warn!(
                    "final point could not be evaluated, keeping status `{}`: {e}",
                    report.status
                );
                (f64::NAN, f64::INFINITY, Some(e))
            }
        };
        if cost < self.cost_lower || cost > self.cost_upper {
            warn!(
                "cost {cost} is outside of its bounds [{}, {}]",
                self.cost_lower, self.cost_upper
            );
        }
        OptimizationResult {
            status: report.status,
            mesh_converged,
            refinement_count,
            num_solves,
            iterations: report.iterations,
            cost,
            max_violation,
            decision_vector: self.decision.clone(),
            evaluation_error,
        }
    }
}

impl fmt::Debug for Trajectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trajectory")
            .field("phases", &self.phases)
            .field("has_point_function", &self.point_function.is_some())
            .field("cost_bounds", &(self.cost_lower, self.cost_upper))
            .field("max_mesh_refinement_count", &self.max_mesh_refinement_count)
            .field("refinement", &self.refinement)
            .field("mesh_guess_mode", &self.mesh_guess_mode)
            .field("auto_scaling", &self.auto_scaling)
            .field("num_variables", &self.num_variables())
            .field("num_constraints", &self.num_constraints())
            .finish()
    }
}

impl fmt::Display for Trajectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "trajectory with {} phase(s), {} variables, {} constraints",
            self.phases.len(),
            self.num_variables(),
            self.num_constraints()
        )?;
        for phase in &self.phases {
            writeln!(f, "  {phase}")?;
        }
        Ok(())
    }
}

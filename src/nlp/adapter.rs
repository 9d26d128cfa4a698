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

use super::{
    FinalSolution, HessianEval, IndexStyle, IterationStats, NlpInfo, NlpProblem, NlpScaling,
    SolveReport, SolveStatus, SparseEval,
};
use crate::errors::{BufferSizeSnafu, ConfigError, EvaluationError, MultiplierSizeSnafu};
use crate::linalg::DVector;
use crate::trajectory::{ProblemBounds, Trajectory};
use snafu::ensure;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Maximum constraint violation of an iterate considered feasible when tracking the best one.
pub const FEASIBILITY_TOL: f64 = 1e-6;

/// Best iterate evaluated during a solve: the cheapest feasible one, or the least infeasible one
/// while none is feasible.
#[derive(Clone, Debug, PartialEq)]
pub struct BestSolution {
    pub decision_vector: DVector<f64>,
    pub cost: f64,
    pub max_violation: f64,
}

impl BestSolution {
    fn is_improved_by(&self, cost: f64, max_violation: f64) -> bool {
        if max_violation < FEASIBILITY_TOL {
            self.max_violation >= FEASIBILITY_TOL
                || cost < self.cost
                || (cost == self.cost && max_violation < self.max_violation)
        } else {
            max_violation < self.max_violation
        }
    }
}

/// Exposes a [`Trajectory`] through the callback set of an IPOPT-like solver.
///
/// The adapter forwards every iterate to the trajectory, which only re-evaluates when the iterate
/// changed. Evaluation failures are logged and reported to the solver as a failed evaluation.
/// With a [`NlpScaling`], the solver only sees scaled variables, cost and constraints.
pub struct NlpAdapter<'a> {
    traj: &'a mut Trajectory,
    abort: Arc<AtomicBool>,
    final_status: Option<SolveStatus>,
    scaling: Option<NlpScaling>,
    bounds: Option<ProblemBounds>,
    best: Option<BestSolution>,
}

impl<'a> NlpAdapter<'a> {
    pub fn new(traj: &'a mut Trajectory) -> Self {
        let bounds = traj.bounds().ok();
        Self {
            traj,
            abort: Arc::new(AtomicBool::new(false)),
            final_status: None,
            scaling: None,
            bounds,
            best: None,
        }
    }

    /// An adapter scaling the problem from its bounds and its Jacobian at the current decision
    /// vector, see [`NlpScaling::from_trajectory`].
    pub fn with_scaling(traj: &'a mut Trajectory, cost_weight: f64) -> Result<Self, ConfigError> {
        let scaling = NlpScaling::from_trajectory(traj, cost_weight)?;
        let mut me = Self::new(traj);
        me.scaling = Some(scaling);
        Ok(me)
    }

    pub fn scaling(&self) -> Option<&NlpScaling> {
        self.scaling.as_ref()
    }

    /// Flag that may be set from another thread to stop the solve at the next iteration.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    /// Stops the solve at the next intermediate callback.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Status handed to [`NlpProblem::finalize_solution`], if the solve finished.
    pub fn final_status(&self) -> Option<SolveStatus> {
        self.final_status
    }

    /// Best iterate whose constraints were evaluated so far.
    pub fn best_solution(&self) -> Option<&BestSolution> {
        self.best.as_ref()
    }

    pub fn trajectory(&self) -> &Trajectory {
        self.traj
    }

    /// Decision vector of the trajectory from a solver iterate.
    pub fn unscale_decision(&self, x: &[f64]) -> DVector<f64> {
        match &self.scaling {
            Some(scaling) if scaling.num_variables() == x.len() => scaling.unscale_decision(x),
            _ => DVector::from_column_slice(x),
        }
    }

    /// Maps a report of the solver back to the unscaled problem.
    pub fn unscale_report(&self, report: SolveReport) -> SolveReport {
        let objective = match &self.scaling {
            Some(scaling) => scaling.unscale_cost(report.objective),
            None => report.objective,
        };
        SolveReport {
            x: self.unscale_decision(report.x.as_slice()),
            objective,
            ..report
        }
    }

    fn update(&mut self, x: &[f64], new_x: bool) -> Result<(), EvaluationError> {
        let x = self.unscale_decision(x);
        if new_x || x != *self.traj.decision_vector() {
            self.traj.set_decision_vector(x.as_slice())?;
        }
        Ok(())
    }

    fn track_best(&mut self, cost: f64, g: &DVector<f64>) {
        let Some(bounds) = &self.bounds else {
            return;
        };
        if g.len() != bounds.g_lower.len() {
            return;
        }
        let max_violation = g
            .iter()
            .zip(bounds.g_lower.iter().zip(bounds.g_upper.iter()))
            .map(|(g, (l, u))| (l - g).max(g - u).max(0.0))
            .fold(0.0, f64::max);
        let improved = match &self.best {
            Some(best) => best.is_improved_by(cost, max_violation),
            None => true,
        };
        if improved {
            self.best = Some(BestSolution {
                decision_vector: self.traj.decision_vector().clone(),
                cost,
                max_violation,
            });
        }
    }

    fn report(&self, callback: &str, result: Result<(), EvaluationError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("{callback} failed: {e}");
                false
            }
        }
    }
}

/// Checks the length of a buffer provided by the solver.
fn check_len(quantity: &'static str, expected: usize, actual: usize) -> Result<(), EvaluationError> {
    ensure!(
        expected == actual,
        BufferSizeSnafu {
            quantity,
            expected,
            actual,
        }
    );
    Ok(())
}

impl<'a> NlpProblem for NlpAdapter<'a> {
    fn get_nlp_info(&self) -> NlpInfo {
        let nnz_jacobian = self
            .traj
            .jacobian_sparsity_pattern()
            .map(|p| p.nnz())
            .unwrap_or(0);
        let nnz_hessian = self
            .traj
            .hessian_sparsity_pattern()
            .map(|p| p.nnz())
            .unwrap_or(0);
        NlpInfo {
            num_variables: self.traj.num_variables(),
            num_constraints: self.traj.num_constraints(),
            nnz_jacobian,
            nnz_hessian,
            index_style: IndexStyle::CStyle,
        }
    }

    fn get_bounds_info(
        &self,
        x_lower: &mut [f64],
        x_upper: &mut [f64],
        g_lower: &mut [f64],
        g_upper: &mut [f64],
    ) -> bool {
        let Some(bounds) = &self.bounds else {
            warn!("get_bounds_info failed: the trajectory is not initialized");
            return false;
        };
        let bounds = match &self.scaling {
            Some(scaling) => scaling.scale_bounds(bounds),
            None => bounds.clone(),
        };
        if x_lower.len() != bounds.x_lower.len()
            || x_upper.len() != bounds.x_upper.len()
            || g_lower.len() != bounds.g_lower.len()
            || g_upper.len() != bounds.g_upper.len()
        {
            warn!("bounds requested with inconsistent sizes");
            return false;
        }
        x_lower.copy_from_slice(bounds.x_lower.as_slice());
        x_upper.copy_from_slice(bounds.x_upper.as_slice());
        g_lower.copy_from_slice(bounds.g_lower.as_slice());
        g_upper.copy_from_slice(bounds.g_upper.as_slice());
        true
    }

    fn get_starting_point(&self, x: &mut [f64]) -> bool {
        let start = match &self.scaling {
            Some(scaling) => scaling.scale_decision(self.traj.decision_vector().as_slice()),
            None => self.traj.decision_vector().clone(),
        };
        if x.len() != start.len() {
            warn!(
                "starting point requested with {} entries, expected {}",
                x.len(),
                start.len()
            );
            return false;
        }
        x.copy_from_slice(start.as_slice());
        true
    }

    fn eval_f(&mut self, x: &[f64], new_x: bool, obj_value: &mut f64) -> bool {
        let result = self.update(x, new_x).and_then(|_| {
            let (cost, _) = self.traj.cost_constraint_functions()?;
            *obj_value = match &self.scaling {
                Some(scaling) => scaling.scale_cost(cost),
                None => cost,
            };
            Ok(())
        });
        self.report("eval_f", result)
    }

    fn eval_grad_f(&mut self, x: &[f64], new_x: bool, grad_f: &mut [f64]) -> bool {
        let result = self.update(x, new_x).and_then(|_| {
            let grad = self.traj.cost_gradient()?;
            check_len("cost gradient", grad.len(), grad_f.len())?;
            let grad = match &self.scaling {
                Some(scaling) => scaling.scale_gradient(&grad),
                None => grad,
            };
            grad_f.copy_from_slice(grad.as_slice());
            Ok(())
        });
        self.report("eval_grad_f", result)
    }

    fn eval_g(&mut self, x: &[f64], new_x: bool, g: &mut [f64]) -> bool {
        let result = self.update(x, new_x).and_then(|_| {
            let (cost, values) = self.traj.cost_constraint_functions()?;
            check_len("constraints", values.len(), g.len())?;
            self.track_best(cost, &values);
            let values = match &self.scaling {
                Some(scaling) => scaling.scale_constraints(&values),
                None => values,
            };
            g.copy_from_slice(values.as_slice());
            Ok(())
        });
        self.report("eval_g", result)
    }

    fn eval_jac_g(&mut self, request: SparseEval) -> bool {
        match request {
            SparseEval::Structure { rows, cols } => match self.traj.jacobian_sparsity_pattern() {
                Ok(pattern) if rows.len() == pattern.nnz() && cols.len() == pattern.nnz() => {
                    rows.copy_from_slice(pattern.rows());
                    cols.copy_from_slice(pattern.cols());
                    true
                }
                Ok(_) => {
                    warn!("jacobian structure requested with inconsistent sizes");
                    false
                }
                Err(e) => {
                    warn!("eval_jac_g failed: {e}");
                    false
                }
            },
            SparseEval::Values { x, new_x, values } => {
                let result = self.update(x, new_x).and_then(|_| {
                    let jac = self.traj.constraint_jacobian_values()?;
                    check_len("jacobian values", jac.len(), values.len())?;
                    match (&self.scaling, self.traj.jacobian_sparsity_pattern()) {
                        (Some(scaling), Ok(pattern)) => {
                            values.copy_from_slice(&scaling.scale_jacobian(pattern, &jac))
                        }
                        _ => values.copy_from_slice(&jac),
                    }
                    Ok(())
                });
                self.report("eval_jac_g", result)
            }
        }
    }

    fn eval_h(&mut self, request: HessianEval) -> bool {
        match request {
            HessianEval::Structure { rows, cols } => match self.traj.hessian_sparsity_pattern() {
                Ok(pattern) if rows.len() == pattern.nnz() && cols.len() == pattern.nnz() => {
                    rows.copy_from_slice(pattern.rows());
                    cols.copy_from_slice(pattern.cols());
                    true
                }
                Ok(_) => {
                    warn!("hessian structure requested with inconsistent sizes");
                    false
                }
                Err(e) => {
                    warn!("eval_h failed: {e}");
                    false
                }
            },
            HessianEval::Values {
                x,
                new_x,
                obj_factor,
                lambda,
                values,
                ..
            } => {
                let result = self.update(x, new_x).and_then(|_| {
                    let expected = self.traj.num_constraints();
                    ensure!(
                        lambda.len() == expected,
                        MultiplierSizeSnafu {
                            expected,
                            actual: lambda.len(),
                        }
                    );
                    let hess = match &self.scaling {
                        Some(scaling) => {
                            let (sigma, lambda) = scaling.unscale_multipliers(obj_factor, lambda);
                            let hess = self.traj.compute_hessian_contraction(sigma, &lambda)?;
                            match self.traj.hessian_sparsity_pattern() {
                                Ok(pattern) => scaling.scale_hessian(pattern, &hess),
                                Err(_) => hess,
                            }
                        }
                        None => self.traj.compute_hessian_contraction(obj_factor, lambda)?,
                    };
                    check_len("hessian values", hess.len(), values.len())?;
                    values.copy_from_slice(&hess);
                    Ok(())
                });
                self.report("eval_h", result)
            }
        }
    }

    fn intermediate_callback(&mut self, stats: &IterationStats) -> bool {
        trace!("iteration {stats}");
        if self.abort.load(Ordering::SeqCst) {
            info!("solve aborted at iteration {}", stats.iteration);
            return false;
        }
        true
    }

    /// Stores the final iterate in the trajectory and evaluates the cost, the constraints and
    /// the Jacobian there. Failures are logged, the solver status is kept.
    fn finalize_solution(&mut self, solution: &FinalSolution) {
        self.final_status = Some(solution.status);
        let x = self.unscale_decision(solution.x);
        if let Err(e) = self.traj.set_decision_vector(x.as_slice()) {
            warn!("could not store the final solution: {e}");
            return;
        }
        match self.traj.cost_constraint_functions() {
            Ok((cost, g)) => self.track_best(cost, &g),
            Err(e) => warn!("final cost and constraints could not be evaluated: {e}"),
        }
        if let Err(e) = self.traj.constraint_jacobian_values() {
            warn!("final jacobian could not be evaluated: {e}");
        }
    }
}

#[cfg(test)]
mod ut_adapter {
    use super::*;
    use crate::phase::Phase;
    use crate::userfunc::{
        OutOfDomainSnafu, PathInput, PathOutput, UserFunctionError, UserPathFunction,
    };
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc as StdArc;

    struct Drift;

    /// Same as [`Drift`], counting its calls and failing above a control magnitude.
    struct CountedDrift {
        calls: StdArc<AtomicUsize>,
        max_control: f64,
    }

    impl UserPathFunction for CountedDrift {
        fn evaluate_functions(
            &self,
            input: &PathInput,
            output: &mut PathOutput,
        ) -> Result<(), UserFunctionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let u = input.control()[0];
            if u.abs() > self.max_control {
                return OutOfDomainSnafu {
                    msg: format!("control {u} too large"),
                }
                .fail();
            }
            output.set_dynamics(&[u]);
            output.set_cost(u * u);
            Ok(())
        }
    }

    impl UserPathFunction for Drift {
        fn evaluate_functions(
            &self,
            input: &PathInput,
            output: &mut PathOutput,
        ) -> Result<(), UserFunctionError> {
            output.set_dynamics(&[input.control()[0]]);
            output.set_cost(input.control()[0].powi(2));
            Ok(())
        }
    }

    fn trajectory() -> Trajectory {
        trajectory_with(StdArc::new(Drift))
    }

    fn trajectory_with(func: StdArc<dyn UserPathFunction>) -> Trajectory {
        let mut phase = Phase::new();
        phase.set_path_function(func);
        phase.set_num_states(1);
        phase.set_num_controls(1);
        phase.set_state_lower_bound(&[-10.0]);
        phase.set_state_upper_bound(&[10.0]);
        phase.set_control_lower_bound(&[-5.0]);
        phase.set_control_upper_bound(&[5.0]);
        phase.set_time_bounds(0.0, 1.0).unwrap();
        phase.set_time_guess(0.0, 1.0).unwrap();
        phase.set_state_initial_guess(&[0.0]);
        phase.set_state_final_guess(&[1.0]);
        phase.set_mesh_interval_fractions(&[-1.0, 1.0]).unwrap();
        phase.set_mesh_interval_num_points(&[4]).unwrap();
        let mut traj = Trajectory::new();
        traj.add_phase(phase);
        traj.initialize().unwrap();
        traj
    }

    #[test]
    fn callbacks_follow_the_trajectory() {
        let mut traj = trajectory();
        let n = traj.num_variables();
        let m = traj.num_constraints();
        let mut adapter = NlpAdapter::new(&mut traj);
        let info = adapter.get_nlp_info();
        assert_eq!(info.num_variables, n);
        assert_eq!(info.num_constraints, m);
        assert_eq!(info.index_style, IndexStyle::CStyle);

        let mut x = vec![0.0; n];
        assert!(adapter.get_starting_point(&mut x));
        let mut rows = vec![0; info.nnz_jacobian];
        let mut cols = vec![0; info.nnz_jacobian];
        assert!(adapter.eval_jac_g(SparseEval::Structure {
            rows: &mut rows,
            cols: &mut cols,
        }));
        assert!(rows.iter().all(|r| *r < m) && cols.iter().all(|c| *c < n));

        let mut g = vec![0.0; m];
        assert!(adapter.eval_g(&x, true, &mut g));
        // Wrong sizes are reported as a failed evaluation, never a panic.
        assert!(!adapter.eval_g(&x[1..], true, &mut g));
    }

    #[test]
    fn abort_stops_at_next_iteration() {
        let mut traj = trajectory();
        let mut adapter = NlpAdapter::new(&mut traj);
        let stats = IterationStats::default();
        assert!(adapter.intermediate_callback(&stats));
        let handle = adapter.abort_handle();
        handle.store(true, Ordering::SeqCst);
        assert!(!adapter.intermediate_callback(&stats));
        adapter.request_abort();
        assert!(!adapter.intermediate_callback(&stats));
    }

    fn final_solution(x: &[f64]) -> FinalSolution<'_> {
        FinalSolution {
            status: SolveStatus::SolveSucceeded,
            x,
            z_lower: &[],
            z_upper: &[],
            g: &[],
            lambda: &[],
            objective: 0.0,
        }
    }

    #[test]
    fn final_solution_is_evaluated() {
        let calls = StdArc::new(AtomicUsize::new(0));
        let mut traj = trajectory_with(StdArc::new(CountedDrift {
            calls: calls.clone(),
            max_control: 5.0,
        }));
        let mut x = traj.decision_vector().clone();
        // Controls sit after the single state of every node.
        for p in 0..5 {
            x[2 + 2 * p + 1] = 0.5;
        }
        let mut adapter = NlpAdapter::new(&mut traj);
        let before = calls.load(Ordering::SeqCst);
        adapter.finalize_solution(&final_solution(x.as_slice()));
        assert!(calls.load(Ordering::SeqCst) > before);
        assert_eq!(adapter.final_status(), Some(SolveStatus::SolveSucceeded));
        let best = adapter.best_solution().unwrap();
        assert_eq!(best.decision_vector, x);
        // u = 0.5 over a unit time span.
        assert!((best.cost - 0.25).abs() < 1e-12);
        assert_eq!(*traj.decision_vector(), x);
    }

    #[test]
    fn failed_final_evaluation_keeps_status() {
        let calls = StdArc::new(AtomicUsize::new(0));
        let mut traj = trajectory_with(StdArc::new(CountedDrift {
            calls,
            max_control: 1.0,
        }));
        let mut x = traj.decision_vector().clone();
        x[3] = 2.0;
        let mut adapter = NlpAdapter::new(&mut traj);
        adapter.finalize_solution(&final_solution(x.as_slice()));
        assert_eq!(adapter.final_status(), Some(SolveStatus::SolveSucceeded));
        assert!(adapter.best_solution().is_none());
        assert_eq!(*traj.decision_vector(), x);
        assert!(traj.cost_constraint_functions().is_err());
    }

    #[test]
    fn mis_sized_buffers_fail_the_evaluation() {
        let mut traj = trajectory();
        let n = traj.num_variables();
        let m = traj.num_constraints();
        let x = traj.decision_vector().as_slice().to_vec();
        let mut adapter = NlpAdapter::new(&mut traj);
        let info = adapter.get_nlp_info();

        let mut short = vec![0.0; n - 1];
        assert!(!adapter.get_starting_point(&mut short));
        assert!(!adapter.eval_grad_f(&x, true, &mut short));
        let mut grad = vec![0.0; n];
        assert!(adapter.eval_grad_f(&x, false, &mut grad));

        let (mut xl, mut xu) = (vec![0.0; n], vec![0.0; n]);
        let (mut gl, mut gu) = (vec![0.0; m], vec![0.0; m + 1]);
        assert!(!adapter.get_bounds_info(&mut xl, &mut xu, &mut gl, &mut gu));

        let mut jac = vec![0.0; info.nnz_jacobian + 1];
        assert!(!adapter.eval_jac_g(SparseEval::Values {
            x: &x,
            new_x: false,
            values: &mut jac,
        }));
        let mut jac = vec![0.0; info.nnz_jacobian];
        assert!(adapter.eval_jac_g(SparseEval::Values {
            x: &x,
            new_x: false,
            values: &mut jac,
        }));

        let lambda = vec![0.0; m];
        let mut hess = vec![0.0; info.nnz_hessian.saturating_sub(1)];
        assert!(!adapter.eval_h(HessianEval::Values {
            x: &x,
            new_x: false,
            obj_factor: 1.0,
            lambda: &lambda,
            new_lambda: true,
            values: &mut hess,
        }));
        let mut rows = vec![0; info.nnz_hessian + 2];
        let mut cols = vec![0; info.nnz_hessian + 2];
        assert!(!adapter.eval_h(HessianEval::Structure {
            rows: &mut rows,
            cols: &mut cols,
        }));
    }

    #[test]
    fn scaled_adapter_sees_the_unit_box() {
        let mut traj = trajectory();
        let n = traj.num_variables();
        let m = traj.num_constraints();
        let x0 = traj.decision_vector().clone();
        let (cost, _) = traj.cost_constraint_functions().unwrap();
        let mut adapter = NlpAdapter::with_scaling(&mut traj, 10.0).unwrap();

        let (mut xl, mut xu) = (vec![0.0; n], vec![0.0; n]);
        let (mut gl, mut gu) = (vec![0.0; m], vec![0.0; m]);
        assert!(adapter.get_bounds_info(&mut xl, &mut xu, &mut gl, &mut gu));
        for i in 0..n {
            if xl[i] < xu[i] {
                assert!((xl[i] + 0.5).abs() < 1e-12, "lower bound of {i}");
                assert!((xu[i] - 0.5).abs() < 1e-12, "upper bound of {i}");
            }
        }

        let mut xs = vec![0.0; n];
        assert!(adapter.get_starting_point(&mut xs));
        let back = adapter.unscale_decision(&xs);
        for (a, b) in back.iter().zip(x0.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
        let mut obj = 0.0;
        assert!(adapter.eval_f(&xs, true, &mut obj));
        assert!((obj - 10.0 * cost).abs() < 1e-12);

        let report = adapter.unscale_report(SolveReport {
            status: SolveStatus::SolveSucceeded,
            x: DVector::from_vec(xs),
            objective: obj,
            iterations: 0,
            constraint_violation: 0.0,
        });
        assert!((report.objective - cost).abs() < 1e-12);
        assert!((report.x[2] - x0[2]).abs() < 1e-12);
    }

    #[test]
    fn best_iterate_prefers_feasible_points() {
        let mut traj = trajectory();
        let m = traj.num_constraints();
        let infeasible = traj.decision_vector().as_slice().to_vec();
        // Constant state and zero control satisfy every defect.
        let mut feasible = infeasible.clone();
        for p in 0..5 {
            feasible[2 + 2 * p] = 0.0;
            feasible[2 + 2 * p + 1] = 0.0;
        }
        let mut adapter = NlpAdapter::new(&mut traj);
        let mut g = vec![0.0; m];
        assert!(adapter.eval_g(&infeasible, true, &mut g));
        assert!(adapter.best_solution().unwrap().max_violation > FEASIBILITY_TOL);
        assert!(adapter.eval_g(&feasible, true, &mut g));
        assert!(adapter.eval_g(&infeasible, true, &mut g));
        let best = adapter.best_solution().unwrap();
        assert!(best.max_violation < FEASIBILITY_TOL);
        assert_eq!(best.decision_vector.as_slice(), feasible.as_slice());
    }
}

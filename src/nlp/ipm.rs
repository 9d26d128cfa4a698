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
    FinalSolution, HessianEval, IndexStyle, IterationStats, NlpProblem, NlpSolver, SolveReport,
    SolveStatus, SolverOptions, SparseEval,
};
use crate::linalg::{DMatrix, DVector};
use nalgebra::{Cholesky, Dyn};

/// Safeguard of the bound multipliers against the primal barrier multipliers.
const KAPPA_SIGMA: f64 = 1e10;
/// The barrier parameter decreases once the barrier problem is solved to this multiple of it.
const KAPPA_EPSILON: f64 = 10.0;
const KAPPA_MU: f64 = 0.2;
const THETA_MU: f64 = 1.5;
const TAU_MIN: f64 = 0.99;
const ARMIJO: f64 = 1e-4;
const MIN_STEP: f64 = 1e-14;
/// Scaling threshold of the optimality error.
const S_MAX: f64 = 100.0;
const FIRST_REGULARIZATION: f64 = 1e-4;
const MIN_REGULARIZATION: f64 = 1e-20;
const MAX_REGULARIZATION: f64 = 1e40;
const FIRST_CONSTRAINT_REGULARIZATION: f64 = 1e-8;
const MAX_CONSTRAINT_REGULARIZATION: f64 = 1e2;

/// A dense primal-dual interior point solver, in the spirit of IPOPT.
///
/// Fixed variables are removed, inequality constraints receive slack variables, and the Newton
/// step is computed from the Schur complement of the regularized KKT system. Globalization
/// relies on an l1 merit function with a backtracking line search and one second order
/// correction. It is meant for small to medium problems: everything is factorized densely.
#[derive(Copy, Clone, Debug, Default)]
pub struct InteriorPointSolver {
    options: SolverOptions,
}

impl InteriorPointSolver {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }
}

/// The NLP restated with free variables and slacks: `min f` subject to `c(w) = 0` and `l <= w <= u`.
struct Reformulation {
    n: usize,
    m: usize,
    /// Full size decision vector holding the values of the fixed variables.
    x_fixed: DVector<f64>,
    free: Vec<usize>,
    free_pos: Vec<Option<usize>>,
    row_slack: Vec<Option<usize>>,
    g_lower: DVector<f64>,
    g_upper: DVector<f64>,
    lower: DVector<f64>,
    upper: DVector<f64>,
    jac_rows: Vec<usize>,
    jac_cols: Vec<usize>,
    hess_rows: Vec<usize>,
    hess_cols: Vec<usize>,
}

impl Reformulation {
    /// Builds the reformulation and returns it with the starting point of the free variables.
    fn new(problem: &mut dyn NlpProblem) -> Result<(Self, DVector<f64>), SolveStatus> {
        let info = problem.get_nlp_info();
        let (n, m) = (info.num_variables, info.num_constraints);
        let mut x_lower = vec![0.0; n];
        let mut x_upper = vec![0.0; n];
        let mut g_lower = vec![0.0; m];
        let mut g_upper = vec![0.0; m];
        if !problem.get_bounds_info(&mut x_lower, &mut x_upper, &mut g_lower, &mut g_upper) {
            error!("could not get the problem bounds");
            return Err(SolveStatus::InternalError);
        }
        let mut x0 = vec![0.0; n];
        if !problem.get_starting_point(&mut x0) {
            error!("could not get the starting point");
            return Err(SolveStatus::InternalError);
        }

        let mut jac_rows = vec![0; info.nnz_jacobian];
        let mut jac_cols = vec![0; info.nnz_jacobian];
        if info.nnz_jacobian > 0
            && !problem.eval_jac_g(SparseEval::Structure {
                rows: &mut jac_rows,
                cols: &mut jac_cols,
            })
        {
            error!("could not get the jacobian structure");
            return Err(SolveStatus::InternalError);
        }
        let mut hess_rows = vec![0; info.nnz_hessian];
        let mut hess_cols = vec![0; info.nnz_hessian];
        if info.nnz_hessian > 0
            && !problem.eval_h(HessianEval::Structure {
                rows: &mut hess_rows,
                cols: &mut hess_cols,
            })
        {
            error!("could not get the hessian structure");
            return Err(SolveStatus::InternalError);
        }
        if info.index_style == IndexStyle::FortranStyle {
            for idx in jac_rows
                .iter_mut()
                .chain(jac_cols.iter_mut())
                .chain(hess_rows.iter_mut())
                .chain(hess_cols.iter_mut())
            {
                *idx = idx.saturating_sub(1);
            }
        }
        if jac_rows.iter().any(|r| *r >= m)
            || jac_cols.iter().chain(&hess_rows).chain(&hess_cols).any(|c| *c >= n)
        {
            error!("sparse structure refers to entries outside of the problem");
            return Err(SolveStatus::InternalError);
        }

        for i in 0..n {
            if x_lower[i] > x_upper[i] {
                warn!(
                    "variable {i} has inconsistent bounds [{}, {}]",
                    x_lower[i], x_upper[i]
                );
                return Err(SolveStatus::InfeasibleProblemDetected);
            }
        }
        for r in 0..m {
            if g_lower[r] > g_upper[r] {
                warn!(
                    "constraint {r} has inconsistent bounds [{}, {}]",
                    g_lower[r], g_upper[r]
                );
                return Err(SolveStatus::InfeasibleProblemDetected);
            }
        }

        let mut x_fixed = DVector::from_vec(x0.clone());
        let mut free = Vec::with_capacity(n);
        let mut free_pos = vec![None; n];
        for i in 0..n {
            if x_lower[i] == x_upper[i] {
                x_fixed[i] = x_lower[i];
            } else {
                free_pos[i] = Some(free.len());
                free.push(i);
            }
        }
        let mut row_slack = vec![None; m];
        let mut slack_rows = Vec::new();
        for r in 0..m {
            if g_lower[r] != g_upper[r] {
                row_slack[r] = Some(slack_rows.len());
                slack_rows.push(r);
            }
        }

        let nw = free.len() + slack_rows.len();
        let lower = DVector::from_iterator(
            nw,
            free.iter()
                .map(|i| x_lower[*i])
                .chain(slack_rows.iter().map(|r| g_lower[*r])),
        );
        let upper = DVector::from_iterator(
            nw,
            free.iter()
                .map(|i| x_upper[*i])
                .chain(slack_rows.iter().map(|r| g_upper[*r])),
        );
        let w0 = DVector::from_iterator(
            nw,
            free.iter()
                .map(|i| x0[*i])
                .chain(slack_rows.iter().map(|_| 0.0)),
        );
        debug!(
            "{n} variables ({} fixed), {m} constraints ({} inequalities)",
            n - free.len(),
            slack_rows.len()
        );

        Ok((
            Self {
                n,
                m,
                x_fixed,
                free,
                free_pos,
                row_slack,
                g_lower: DVector::from_vec(g_lower),
                g_upper: DVector::from_vec(g_upper),
                lower,
                upper,
                jac_rows,
                jac_cols,
                hess_rows,
                hess_cols,
            },
            w0,
        ))
    }

    fn num_free(&self) -> usize {
        self.free.len()
    }

    fn len(&self) -> usize {
        self.lower.len()
    }

    fn expand(&self, w: &DVector<f64>) -> DVector<f64> {
        let mut x = self.x_fixed.clone();
        for (j, i) in self.free.iter().enumerate() {
            x[*i] = w[j];
        }
        x
    }

    /// Sets the slacks to the constraint values.
    fn init_slacks(&self, w: &mut DVector<f64>, g: &DVector<f64>) {
        for (r, slack) in self.row_slack.iter().enumerate() {
            if let Some(k) = slack {
                w[self.num_free() + k] = g[r];
            }
        }
    }

    fn eval_functions(
        &self,
        problem: &mut dyn NlpProblem,
        w: &DVector<f64>,
    ) -> Option<(f64, DVector<f64>)> {
        let x = self.expand(w);
        let mut f = 0.0;
        if !problem.eval_f(x.as_slice(), true, &mut f) || !f.is_finite() {
            return None;
        }
        let mut g = DVector::zeros(self.m);
        if !problem.eval_g(x.as_slice(), false, g.as_mut_slice()) || !all_finite(&g) {
            return None;
        }
        Some((f, g))
    }

    /// Gradient of the objective and constraint Jacobian with respect to `w`.
    fn eval_derivatives(
        &self,
        problem: &mut dyn NlpProblem,
        w: &DVector<f64>,
    ) -> Option<(DVector<f64>, DMatrix<f64>)> {
        let x = self.expand(w);
        let mut grad = DVector::zeros(self.n);
        if !problem.eval_grad_f(x.as_slice(), false, grad.as_mut_slice()) || !all_finite(&grad) {
            return None;
        }
        let mut values = vec![0.0; self.jac_rows.len()];
        if !values.is_empty()
            && !problem.eval_jac_g(SparseEval::Values {
                x: x.as_slice(),
                new_x: false,
                values: &mut values,
            })
        {
            return None;
        }
        if values.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let nw = self.len();
        let mut grad_w = DVector::zeros(nw);
        for (j, i) in self.free.iter().enumerate() {
            grad_w[j] = grad[*i];
        }
        let mut a = DMatrix::zeros(self.m, nw);
        for ((r, c), v) in self.jac_rows.iter().zip(&self.jac_cols).zip(values) {
            if let Some(j) = self.free_pos[*c] {
                a[(*r, j)] += v;
            }
        }
        for (r, slack) in self.row_slack.iter().enumerate() {
            if let Some(k) = slack {
                a[(r, self.num_free() + k)] = -1.0;
            }
        }
        Some((grad_w, a))
    }

    /// Full symmetric Hessian of the Lagrangian with respect to `w`.
    fn eval_hessian(
        &self,
        problem: &mut dyn NlpProblem,
        w: &DVector<f64>,
        obj_factor: f64,
        lambda: &DVector<f64>,
    ) -> Option<DMatrix<f64>> {
        let nw = self.len();
        let mut hess = DMatrix::zeros(nw, nw);
        if self.hess_rows.is_empty() {
            return Some(hess);
        }
        let x = self.expand(w);
        let mut values = vec![0.0; self.hess_rows.len()];
        if !problem.eval_h(HessianEval::Values {
            x: x.as_slice(),
            new_x: false,
            obj_factor,
            lambda: lambda.as_slice(),
            new_lambda: true,
            values: &mut values,
        }) {
            return None;
        }
        for ((r, c), v) in self.hess_rows.iter().zip(&self.hess_cols).zip(values) {
            if let (Some(i), Some(j)) = (self.free_pos[*r], self.free_pos[*c]) {
                hess[(i, j)] += v;
                if i != j {
                    hess[(j, i)] += v;
                }
            }
        }
        if hess.iter().all(|v| v.is_finite()) {
            Some(hess)
        } else {
            None
        }
    }

    /// Equality residuals `c(w)`.
    fn residual(&self, w: &DVector<f64>, g: &DVector<f64>) -> DVector<f64> {
        DVector::from_iterator(
            self.m,
            (0..self.m).map(|r| match self.row_slack[r] {
                Some(k) => g[r] - w[self.num_free() + k],
                None => g[r] - self.g_lower[r],
            }),
        )
    }

    /// Largest violation of the original constraint bounds.
    fn violation(&self, g: &DVector<f64>) -> f64 {
        g.iter()
            .zip(self.g_lower.iter().zip(self.g_upper.iter()))
            .map(|(g, (l, u))| (l - g).max(g - u).max(0.0))
            .fold(0.0, f64::max)
    }

    /// Distances to the finite lower and upper bounds, zero where the bound is infinite.
    fn distances(&self, w: &DVector<f64>) -> (DVector<f64>, DVector<f64>) {
        let nw = self.len();
        let dl = DVector::from_iterator(
            nw,
            (0..nw).map(|i| {
                if self.lower[i].is_finite() {
                    w[i] - self.lower[i]
                } else {
                    0.0
                }
            }),
        );
        let du = DVector::from_iterator(
            nw,
            (0..nw).map(|i| {
                if self.upper[i].is_finite() {
                    self.upper[i] - w[i]
                } else {
                    0.0
                }
            }),
        );
        (dl, du)
    }

    /// Moves the point strictly inside its bounds.
    fn push_inside(&self, w: &mut DVector<f64>, push: f64) {
        for i in 0..self.len() {
            let (lo, up) = (self.lower[i], self.upper[i]);
            if lo.is_finite() {
                let mut p = push * lo.abs().max(1.0);
                if up.is_finite() {
                    p = p.min(push * (up - lo));
                }
                w[i] = w[i].max(lo + p);
            }
            if up.is_finite() {
                let mut p = push * up.abs().max(1.0);
                if lo.is_finite() {
                    p = p.min(push * (up - lo));
                }
                w[i] = w[i].min(up - p);
            }
        }
    }

    /// Barrier objective with the l1 penalty of the constraints.
    fn merit(&self, f: f64, w: &DVector<f64>, c: &DVector<f64>, mu: f64, nu: f64) -> f64 {
        let mut phi = f + nu * c.lp_norm(1);
        for i in 0..self.len() {
            if self.lower[i].is_finite() {
                phi -= mu * (w[i] - self.lower[i]).ln();
            }
            if self.upper[i].is_finite() {
                phi -= mu * (self.upper[i] - w[i]).ln();
            }
        }
        phi
    }

    /// Largest step in `(0, 1]` keeping `w + α dw` at least `1 - τ` of its distance from the bounds.
    fn primal_step(&self, dl: &DVector<f64>, du: &DVector<f64>, dw: &DVector<f64>, tau: f64) -> f64 {
        let mut alpha: f64 = 1.0;
        for i in 0..self.len() {
            if self.lower[i].is_finite() && dw[i] < 0.0 {
                alpha = alpha.min(-tau * dl[i] / dw[i]);
            }
            if self.upper[i].is_finite() && dw[i] > 0.0 {
                alpha = alpha.min(tau * du[i] / dw[i]);
            }
        }
        alpha
    }
}

/// Factorizations of one Newton system, reused by the second order correction.
struct NewtonSystem {
    minv_r: DVector<f64>,
    minv_at: DMatrix<f64>,
    a: DMatrix<f64>,
    schur: Option<Cholesky<f64, Dyn>>,
}

impl NewtonSystem {
    /// Primal and multiplier steps for the equality residual `c`.
    fn step(&self, c: &DVector<f64>) -> (DVector<f64>, DVector<f64>) {
        match &self.schur {
            Some(schur) => {
                let rhs = c - &self.a * &self.minv_r;
                let dlambda = schur.solve(&rhs);
                let dw = -(&self.minv_r + &self.minv_at * &dlambda);
                (dw, dlambda)
            }
            None => (-self.minv_r.clone(), DVector::zeros(c.len())),
        }
    }
}

fn all_finite(v: &DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

fn inf_norm(v: &DVector<f64>) -> f64 {
    v.iter().fold(0.0, |acc, x| acc.max(x.abs()))
}

/// Factorizes `W + Σ + δ I` with the smallest regularization making it positive definite.
fn factorize(
    hess: &DMatrix<f64>,
    sigma: &DVector<f64>,
    last_regularization: f64,
) -> Option<(Cholesky<f64, Dyn>, f64)> {
    let mut reg = 0.0;
    loop {
        let mut mat = hess.clone();
        for i in 0..sigma.len() {
            mat[(i, i)] += sigma[i] + reg;
        }
        if let Some(chol) = mat.cholesky() {
            return Some((chol, reg));
        }
        reg = if reg == 0.0 {
            if last_regularization == 0.0 {
                FIRST_REGULARIZATION
            } else {
                (last_regularization / 3.0).max(MIN_REGULARIZATION)
            }
        } else if last_regularization == 0.0 {
            100.0 * reg
        } else {
            8.0 * reg
        };
        if reg > MAX_REGULARIZATION {
            return None;
        }
    }
}

/// Factorizes the Schur complement `A M⁻¹ Aᵀ`, regularized if the constraints are degenerate.
fn factorize_schur(schur: DMatrix<f64>) -> Option<Cholesky<f64, Dyn>> {
    let mut reg = 0.0;
    loop {
        let mut mat = schur.clone();
        for i in 0..mat.nrows() {
            mat[(i, i)] += reg;
        }
        if let Some(chol) = mat.cholesky() {
            if reg > 0.0 {
                debug!("constraint jacobian regularized with {reg:.1e}");
            }
            return Some(chol);
        }
        reg = if reg == 0.0 {
            FIRST_CONSTRAINT_REGULARIZATION
        } else {
            10.0 * reg
        };
        if reg > MAX_CONSTRAINT_REGULARIZATION {
            return None;
        }
    }
}

/// Primal-dual iterate on the reformulated problem.
struct Iterate {
    w: DVector<f64>,
    lambda: DVector<f64>,
    z_lower: DVector<f64>,
    z_upper: DVector<f64>,
    /// Unscaled objective
    f: f64,
    g: DVector<f64>,
    grad: DVector<f64>,
    a: DMatrix<f64>,
}

impl NlpSolver for InteriorPointSolver {
    fn solve(&self, problem: &mut dyn NlpProblem) -> SolveReport {
        let opts = &self.options;
        let (nlp, mut w) = match Reformulation::new(problem) {
            Ok(setup) => setup,
            Err(status) => {
                return SolveReport {
                    status,
                    x: DVector::zeros(0),
                    objective: f64::NAN,
                    iterations: 0,
                    constraint_violation: f64::INFINITY,
                }
            }
        };
        let nw = nlp.len();

        if let Some((_, g)) = nlp.eval_functions(problem, &w) {
            nlp.init_slacks(&mut w, &g);
        }
        nlp.push_inside(&mut w, opts.bound_push);

        let evaluated = nlp.eval_functions(problem, &w).and_then(|(f, g)| {
            nlp.eval_derivatives(problem, &w)
                .map(|(grad, a)| (f, g, grad, a))
        });
        let (f, g, grad, a) = match evaluated {
            Some(eval) => eval,
            None => {
                error!("problem cannot be evaluated at the starting point");
                return self.finish(
                    problem,
                    &nlp,
                    SolveStatus::InvalidNumberDetected,
                    0,
                    &Iterate {
                        w: w.clone(),
                        lambda: DVector::zeros(nlp.m),
                        z_lower: DVector::zeros(nw),
                        z_upper: DVector::zeros(nw),
                        f: f64::NAN,
                        g: DVector::from_element(nlp.m, f64::NAN),
                        grad: DVector::zeros(nw),
                        a: DMatrix::zeros(nlp.m, nw),
                    },
                    1.0,
                );
            }
        };

        let grad_max = inf_norm(&grad);
        let obj_scale = if grad_max > opts.nlp_scaling_max_gradient {
            opts.nlp_scaling_max_gradient / grad_max
        } else {
            1.0
        };
        if obj_scale < 1.0 {
            debug!("objective scaled by {obj_scale:.3e}");
        }

        let has_lower: Vec<bool> = nlp.lower.iter().map(|v| v.is_finite()).collect();
        let has_upper: Vec<bool> = nlp.upper.iter().map(|v| v.is_finite()).collect();
        let mut it = Iterate {
            z_lower: DVector::from_iterator(nw, has_lower.iter().map(|h| if *h { 1.0 } else { 0.0 })),
            z_upper: DVector::from_iterator(nw, has_upper.iter().map(|h| if *h { 1.0 } else { 0.0 })),
            lambda: DVector::zeros(nlp.m),
            w,
            f,
            g,
            grad,
            a,
        };

        let mut mu = opts.mu_init;
        let mut nu: f64 = 1.0;
        let mut last_regularization = 0.0;
        let mut regularization = 0.0;
        let mut step_size = 0.0;
        let mut acceptable_count = 0;
        let mut tiny_steps = 0;
        let mut iteration = 0;

        let header = format!(
            "{:>4} {:>14} {:>9} {:>9} {:>7} {:>8} {:>7}",
            "iter", "objective", "inf_pr", "inf_du", "lg(mu)", "alpha", "lg(rg)"
        );
        if opts.print_iterations {
            info!("{header}");
        } else {
            debug!("{header}");
        }

        let status = loop {
            let grad = &it.grad * obj_scale;
            let c = nlp.residual(&it.w, &it.g);
            let (dl, du) = nlp.distances(&it.w);
            let dual = &grad + it.a.transpose() * &it.lambda - &it.z_lower + &it.z_upper;
            let primal_inf = inf_norm(&c);
            let dual_inf = inf_norm(&dual);
            let z_norm = it.z_lower.lp_norm(1) + it.z_upper.lp_norm(1);
            let s_d = (S_MAX.max((it.lambda.lp_norm(1) + z_norm) / (nlp.m + nw).max(1) as f64)) / S_MAX;
            let s_c = (S_MAX.max(z_norm / nw.max(1) as f64)) / S_MAX;
            let complementarity = |mu: f64| -> f64 {
                (0..nw).fold(0.0, |acc: f64, i| {
                    let mut worst = acc;
                    if has_lower[i] {
                        worst = worst.max((it.z_lower[i] * dl[i] - mu).abs());
                    }
                    if has_upper[i] {
                        worst = worst.max((it.z_upper[i] * du[i] - mu).abs());
                    }
                    worst
                })
            };
            let error = |mu: f64| -> f64 {
                (dual_inf / s_d).max(primal_inf).max(complementarity(mu) / s_c)
            };

            let stats = IterationStats {
                iteration,
                objective: it.f,
                primal_infeasibility: primal_inf,
                dual_infeasibility: dual_inf,
                barrier: mu,
                step_size,
                regularization,
            };
            if opts.print_iterations {
                info!("{stats}");
            } else {
                debug!("{stats}");
            }

            let x_max = inf_norm(&it.w);
            if !x_max.is_finite() {
                break SolveStatus::InvalidNumberDetected;
            }
            if x_max > opts.diverging_iterates_tol {
                break SolveStatus::DivergingIterates;
            }
            let overall_error = error(0.0);
            if overall_error <= opts.tol && primal_inf <= opts.constr_viol_tol {
                break SolveStatus::SolveSucceeded;
            }
            let acceptable =
                overall_error <= opts.acceptable_tol && primal_inf <= opts.constr_viol_tol;
            if acceptable {
                acceptable_count += 1;
                if acceptable_count >= opts.acceptable_iter {
                    break SolveStatus::SolvedToAcceptableLevel;
                }
            } else {
                acceptable_count = 0;
            }
            if !problem.intermediate_callback(&stats) {
                break SolveStatus::UserRequestedStop;
            }
            if iteration >= opts.max_iter {
                break SolveStatus::MaximumIterationsExceeded;
            }

            // Barrier update
            let mu_min = opts.tol / 10.0;
            while mu > mu_min && error(mu) <= KAPPA_EPSILON * mu {
                mu = mu_min.max((KAPPA_MU * mu).min(mu.powf(THETA_MU)));
                trace!("barrier parameter decreased to {mu:.3e}");
            }
            let tau = TAU_MIN.max(1.0 - mu);

            // Newton step
            let hess = match nlp.eval_hessian(problem, &it.w, obj_scale, &it.lambda) {
                Some(hess) => hess,
                None => {
                    warn!("hessian evaluation failed, using the barrier terms only");
                    DMatrix::zeros(nw, nw)
                }
            };
            let mut sigma = DVector::zeros(nw);
            let mut rtilde = &grad + it.a.transpose() * &it.lambda;
            for i in 0..nw {
                if has_lower[i] {
                    sigma[i] += it.z_lower[i] / dl[i];
                    rtilde[i] -= mu / dl[i];
                }
                if has_upper[i] {
                    sigma[i] += it.z_upper[i] / du[i];
                    rtilde[i] += mu / du[i];
                }
            }
            let (chol, reg) = match factorize(&hess, &sigma, last_regularization) {
                Some(factors) => factors,
                None => break SolveStatus::ErrorInStepComputation,
            };
            regularization = reg;
            if reg > 0.0 {
                last_regularization = reg;
            }
            let minv_r = chol.solve(&rtilde);
            let (minv_at, schur) = if nlp.m > 0 {
                let minv_at = chol.solve(&it.a.transpose());
                match factorize_schur(&it.a * &minv_at) {
                    Some(schur) => (minv_at, Some(schur)),
                    None => break SolveStatus::ErrorInStepComputation,
                }
            } else {
                (DMatrix::zeros(nw, 0), None)
            };
            let system = NewtonSystem {
                minv_r,
                minv_at,
                a: it.a.clone(),
                schur,
            };
            let (dw, dlambda) = system.step(&c);
            if !all_finite(&dw) || !all_finite(&dlambda) {
                break SolveStatus::ErrorInStepComputation;
            }

            let mut dz_lower = DVector::zeros(nw);
            let mut dz_upper = DVector::zeros(nw);
            let mut alpha_z: f64 = 1.0;
            for i in 0..nw {
                if has_lower[i] {
                    dz_lower[i] = mu / dl[i] - it.z_lower[i] - it.z_lower[i] / dl[i] * dw[i];
                    if dz_lower[i] < 0.0 {
                        alpha_z = alpha_z.min(-tau * it.z_lower[i] / dz_lower[i]);
                    }
                }
                if has_upper[i] {
                    dz_upper[i] = mu / du[i] - it.z_upper[i] + it.z_upper[i] / du[i] * dw[i];
                    if dz_upper[i] < 0.0 {
                        alpha_z = alpha_z.min(-tau * it.z_upper[i] / dz_upper[i]);
                    }
                }
            }
            let alpha_max = nlp.primal_step(&dl, &du, &dw, tau);

            // Line search on the l1 merit function
            nu = nu.max(1.1 * inf_norm(&(&it.lambda + &dlambda)));
            let mut grad_phi = grad.clone();
            for i in 0..nw {
                if has_lower[i] {
                    grad_phi[i] -= mu / dl[i];
                }
                if has_upper[i] {
                    grad_phi[i] += mu / du[i];
                }
            }
            let slope = (grad_phi.dot(&dw) - nu * c.lp_norm(1)).min(0.0);
            let phi0 = nlp.merit(it.f * obj_scale, &it.w, &c, mu, nu);

            let tiny = dw
                .iter()
                .zip(it.w.iter())
                .all(|(d, v)| d.abs() <= 10.0 * f64::EPSILON * (1.0 + v.abs()));
            if tiny {
                tiny_steps += 1;
                if tiny_steps >= 2 {
                    break SolveStatus::SearchDirectionBecomesTooSmall;
                }
            } else {
                tiny_steps = 0;
            }

            let mut alpha = alpha_max;
            let mut soc_tried = false;
            let mut accepted = None;
            while alpha >= MIN_STEP {
                let trial = &it.w + &dw * alpha;
                if let Some((ft, gt)) = nlp.eval_functions(problem, &trial) {
                    let ct = nlp.residual(&trial, &gt);
                    let bound = phi0 + ARMIJO * alpha * slope;
                    if tiny || nlp.merit(ft * obj_scale, &trial, &ct, mu, nu) <= bound {
                        accepted = Some((trial, ft, gt));
                        break;
                    }
                    if !soc_tried && nlp.m > 0 {
                        soc_tried = true;
                        let c_soc = &c * alpha + &ct;
                        let (dw_soc, _) = system.step(&c_soc);
                        let alpha_soc = nlp.primal_step(&dl, &du, &dw_soc, tau);
                        let trial_soc = &it.w + &dw_soc * alpha_soc;
                        if let Some((fs, gs)) = nlp.eval_functions(problem, &trial_soc) {
                            let cs = nlp.residual(&trial_soc, &gs);
                            if nlp.merit(fs * obj_scale, &trial_soc, &cs, mu, nu) <= bound {
                                trace!("second order correction accepted");
                                accepted = Some((trial_soc, fs, gs));
                                break;
                            }
                        }
                    }
                } else {
                    trace!("evaluation failed at step {alpha:.3e}, backtracking");
                }
                alpha *= 0.5;
            }

            let (w_new, f_new, g_new) = match accepted {
                Some(trial) => trial,
                None => {
                    warn!("line search failed at iteration {iteration}");
                    break if acceptable {
                        SolveStatus::SolvedToAcceptableLevel
                    } else {
                        SolveStatus::RestorationFailed
                    };
                }
            };

            it.w = w_new;
            it.lambda += &dlambda * alpha;
            it.z_lower += &dz_lower * alpha_z;
            it.z_upper += &dz_upper * alpha_z;
            let (dl_new, du_new) = nlp.distances(&it.w);
            for i in 0..nw {
                if has_lower[i] {
                    it.z_lower[i] = it.z_lower[i].clamp(
                        mu / (KAPPA_SIGMA * dl_new[i]),
                        KAPPA_SIGMA * mu / dl_new[i],
                    );
                }
                if has_upper[i] {
                    it.z_upper[i] = it.z_upper[i].clamp(
                        mu / (KAPPA_SIGMA * du_new[i]),
                        KAPPA_SIGMA * mu / du_new[i],
                    );
                }
            }
            it.f = f_new;
            it.g = g_new;
            match nlp.eval_derivatives(problem, &it.w) {
                Some((grad, a)) => {
                    it.grad = grad;
                    it.a = a;
                }
                None => break SolveStatus::InvalidNumberDetected,
            }
            step_size = alpha;
            iteration += 1;
        };

        self.finish(problem, &nlp, status, iteration, &it, obj_scale)
    }
}

impl InteriorPointSolver {
    /// Maps the iterate back to the original problem and hands it to the problem.
    fn finish(
        &self,
        problem: &mut dyn NlpProblem,
        nlp: &Reformulation,
        status: SolveStatus,
        iterations: usize,
        it: &Iterate,
        obj_scale: f64,
    ) -> SolveReport {
        let x = nlp.expand(&it.w);
        let mut z_lower = vec![0.0; nlp.n];
        let mut z_upper = vec![0.0; nlp.n];
        for (j, i) in nlp.free.iter().enumerate() {
            z_lower[*i] = it.z_lower[j] / obj_scale;
            z_upper[*i] = it.z_upper[j] / obj_scale;
        }
        let lambda = &it.lambda / obj_scale;
        problem.finalize_solution(&FinalSolution {
            status,
            x: x.as_slice(),
            z_lower: &z_lower,
            z_upper: &z_upper,
            g: it.g.as_slice(),
            lambda: lambda.as_slice(),
            objective: it.f,
        });
        let constraint_violation = nlp.violation(&it.g);
        if status.is_converged() {
            info!("{status} in {iterations} iterations: f = {:.9e}, max violation = {constraint_violation:.3e}", it.f);
        } else {
            warn!("{status} after {iterations} iterations: f = {:.9e}, max violation = {constraint_violation:.3e}", it.f);
        }
        SolveReport {
            status,
            x,
            objective: it.f,
            iterations,
            constraint_violation,
        }
    }
}

#[cfg(test)]
mod ut_ipm {
    use super::*;
    use crate::nlp::NlpInfo;

    /// `min (x0 - 1)² + (x1 - 2)²` subject to `x0 + x1 = 1` and `x0 >= 0.5`, solution (0.5, 0.5).
    ///
    /// A third variable is fixed and a second constraint `x0 - x1 <= 10` is never active.
    struct Quadratic;

    impl NlpProblem for Quadratic {
        fn get_nlp_info(&self) -> NlpInfo {
            NlpInfo {
                num_variables: 3,
                num_constraints: 2,
                nnz_jacobian: 4,
                nnz_hessian: 2,
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
            x_lower.copy_from_slice(&[0.5, f64::NEG_INFINITY, 3.0]);
            x_upper.copy_from_slice(&[f64::INFINITY, f64::INFINITY, 3.0]);
            g_lower.copy_from_slice(&[1.0, f64::NEG_INFINITY]);
            g_upper.copy_from_slice(&[1.0, 10.0]);
            true
        }

        fn get_starting_point(&self, x: &mut [f64]) -> bool {
            x.copy_from_slice(&[2.0, 2.0, 0.0]);
            true
        }

        fn eval_f(&mut self, x: &[f64], _new_x: bool, obj_value: &mut f64) -> bool {
            *obj_value = (x[0] - 1.0).powi(2) + (x[1] - 2.0).powi(2);
            true
        }

        fn eval_grad_f(&mut self, x: &[f64], _new_x: bool, grad_f: &mut [f64]) -> bool {
            grad_f.copy_from_slice(&[2.0 * (x[0] - 1.0), 2.0 * (x[1] - 2.0), 0.0]);
            true
        }

        fn eval_g(&mut self, x: &[f64], _new_x: bool, g: &mut [f64]) -> bool {
            g.copy_from_slice(&[x[0] + x[1], x[0] - x[1]]);
            true
        }

        fn eval_jac_g(&mut self, request: SparseEval) -> bool {
            match request {
                SparseEval::Structure { rows, cols } => {
                    rows.copy_from_slice(&[0, 0, 1, 1]);
                    cols.copy_from_slice(&[0, 1, 0, 1]);
                }
                SparseEval::Values { values, .. } => {
                    values.copy_from_slice(&[1.0, 1.0, 1.0, -1.0]);
                }
            }
            true
        }

        fn eval_h(&mut self, request: HessianEval) -> bool {
            match request {
                HessianEval::Structure { rows, cols } => {
                    rows.copy_from_slice(&[0, 1]);
                    cols.copy_from_slice(&[0, 1]);
                }
                HessianEval::Values {
                    obj_factor, values, ..
                } => {
                    values.copy_from_slice(&[2.0 * obj_factor, 2.0 * obj_factor]);
                }
            }
            true
        }
    }

    #[test]
    fn bound_constrained_quadratic() {
        let solver = InteriorPointSolver::default();
        let report = solver.solve(&mut Quadratic);
        assert_eq!(report.status, SolveStatus::SolveSucceeded);
        approx::assert_abs_diff_eq!(report.x[0], 0.5, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(report.x[1], 0.5, epsilon = 1e-6);
        assert_eq!(report.x[2], 3.0);
        approx::assert_abs_diff_eq!(report.objective, 2.5, epsilon = 1e-6);
        assert!(report.constraint_violation < 1e-8);
    }

    #[test]
    fn iteration_limit() {
        let solver = InteriorPointSolver::new(SolverOptions::builder().max_iter(1).build());
        let report = solver.solve(&mut Quadratic);
        assert_eq!(report.status, SolveStatus::MaximumIterationsExceeded);
        assert_eq!(report.iterations, 1);
    }
}

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

use super::Phase;
use crate::collocation::{Discretization, IntervalBlock};
use crate::errors::{
    panic_message, CollocationError, EvaluationError, InvalidValueSnafu,
    MissingConfigurationSnafu, NodesFailedSnafu, NonFiniteSnafu, OutputSizeSnafu,
    SizeMismatchSnafu, UserPanicSnafu,
};
use crate::linalg::{DMatrix, DVector};
use crate::sparse::SparsityPattern;
use crate::userfunc::finite_diff::{
    accumulate_nonzeros, central_difference, clamp_within, no_dependencies, sample_within,
    sampling_interval, DEPENDENCY_SEED, NUM_RANDOM_SAMPLES,
};
use crate::userfunc::{PathInput, PathJacobians, PathOutput, UserFunctionError, UserPathFunction};
use rand::Rng;
use rand_pcg::Pcg64Mcg;
use rayon::prelude::*;
use snafu::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Sizes, bounds and dependencies of a path function, discovered at initialization.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PathInfo {
    pub num_states: usize,
    pub num_controls: usize,
    pub num_algebraic: usize,
    pub algebraic_lower: DVector<f64>,
    pub algebraic_upper: DVector<f64>,
    pub has_cost: bool,
    pub analytic: bool,
    /// Rows: dynamics, algebraic constraints, cost. Columns: states, controls, time.
    pub dependencies: DMatrix<bool>,
}

impl PathInfo {
    fn time_column(&self) -> usize {
        self.num_states + self.num_controls
    }
}

/// Outputs of the path function at one node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeEvaluation {
    pub time: f64,
    pub dynamics: DVector<f64>,
    pub algebraic: DVector<f64>,
    /// Cost integrand, zero if the path function sets none.
    pub cost: f64,
    pub jacobians: Option<PathJacobians>,
}

fn call_function(
    func: &dyn UserPathFunction,
    input: &PathInput,
    node: usize,
) -> Result<PathOutput, EvaluationError> {
    let phase = input.phase_index();
    let mut output = PathOutput::default();
    match catch_unwind(AssertUnwindSafe(|| {
        func.evaluate_functions(input, &mut output)
    })) {
        Ok(Ok(())) => Ok(output),
        Ok(Err(source)) => Err(EvaluationError::UserFunction {
            phase,
            node,
            source,
        }),
        Err(payload) => UserPanicSnafu {
            phase,
            node,
            msg: panic_message(payload),
        }
        .fail(),
    }
}

/// Calls the path function and checks the sizes and finiteness of its outputs.
fn outputs(
    func: &dyn UserPathFunction,
    input: &PathInput,
    node: usize,
    info: &PathInfo,
) -> Result<(DVector<f64>, DVector<f64>, f64), EvaluationError> {
    let phase = input.phase_index();
    let output = call_function(func, input, node)?;
    let dynamics = output.dynamics.context(OutputSizeSnafu {
        phase,
        node,
        quantity: "dynamics",
        expected: info.num_states,
        actual: 0_usize,
    })?;
    ensure!(
        dynamics.len() == info.num_states,
        OutputSizeSnafu {
            phase,
            node,
            quantity: "dynamics",
            expected: info.num_states,
            actual: dynamics.len(),
        }
    );
    let algebraic = output.algebraic.unwrap_or_else(|| DVector::zeros(0));
    ensure!(
        algebraic.len() == info.num_algebraic,
        OutputSizeSnafu {
            phase,
            node,
            quantity: "algebraic path constraints",
            expected: info.num_algebraic,
            actual: algebraic.len(),
        }
    );
    let cost = output.cost.unwrap_or(0.0);
    ensure!(
        dynamics.iter().all(|v| v.is_finite()),
        NonFiniteSnafu {
            phase,
            node,
            quantity: "dynamics",
        }
    );
    ensure!(
        algebraic.iter().all(|v| v.is_finite()),
        NonFiniteSnafu {
            phase,
            node,
            quantity: "algebraic path constraint",
        }
    );
    ensure!(
        cost.is_finite(),
        NonFiniteSnafu {
            phase,
            node,
            quantity: "cost integrand",
        }
    );
    Ok((dynamics, algebraic, cost))
}

/// Partials of the path function at one node, analytic if available, by central differences otherwise.
fn jacobians(
    func: &dyn UserPathFunction,
    input: &PathInput,
    node: usize,
    info: &PathInfo,
) -> Result<PathJacobians, EvaluationError> {
    let (nx, nu, na) = (info.num_states, info.num_controls, info.num_algebraic);
    let phase = input.phase_index();

    if info.analytic {
        let expected = PathJacobians::zeros(nx, nu, nx, na);
        let mut jac = expected.clone();
        match catch_unwind(AssertUnwindSafe(|| {
            func.evaluate_jacobians(input, &mut jac)
        })) {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                return Err(EvaluationError::UserFunction {
                    phase,
                    node,
                    source,
                })
            }
            Err(payload) => {
                return UserPanicSnafu {
                    phase,
                    node,
                    msg: panic_message(payload),
                }
                .fail()
            }
        }
        if let Some(msg) = jac.shape_error(&expected) {
            return Err(EvaluationError::UserFunction {
                phase,
                node,
                source: UserFunctionError::Failed { msg },
            });
        }
        ensure!(
            jac.is_finite(),
            NonFiniteSnafu {
                phase,
                node,
                quantity: "jacobian",
            }
        );
        return Ok(jac);
    }

    let mut z = Vec::with_capacity(nx + nu + 1);
    z.extend_from_slice(input.state());
    z.extend_from_slice(input.control());
    z.push(input.time());
    let stacked = central_difference(&z, nx + na + 1, |z| {
        let perturbed = PathInput::new(&z[..nx], &z[nx..nx + nu], z[nx + nu], phase);
        let (dynamics, algebraic, cost) = outputs(func, &perturbed, node, info)?;
        let mut values = DVector::zeros(nx + na + 1);
        values.rows_mut(0, nx).copy_from(&dynamics);
        values.rows_mut(nx, na).copy_from(&algebraic);
        values[nx + na] = cost;
        Ok(values)
    })?;
    Ok(PathJacobians::from_stacked(&stacked, nx, nu, nx, na))
}

/// Evaluates the path function, and optionally its partials, at one node.
pub(crate) fn evaluate_node(
    func: &dyn UserPathFunction,
    input: &PathInput,
    node: usize,
    info: &PathInfo,
    with_jacobians: bool,
) -> Result<NodeEvaluation, EvaluationError> {
    let (dynamics, algebraic, cost) = outputs(func, input, node, info)?;
    let jacobians = if with_jacobians {
        Some(jacobians(func, input, node, info)?)
    } else {
        None
    };
    Ok(NodeEvaluation {
        time: input.time(),
        dynamics,
        algebraic,
        cost,
        jacobians,
    })
}

/// Evaluates every node in parallel. All nodes are attempted, and the failures are reported together.
#[allow(clippy::too_many_arguments)]
pub(crate) fn evaluate_nodes(
    func: &dyn UserPathFunction,
    phase: usize,
    nx: usize,
    nu: usize,
    disc: &Discretization,
    info: &PathInfo,
    x: &[f64],
    with_jacobians: bool,
) -> Result<Vec<NodeEvaluation>, EvaluationError> {
    let results: Vec<Result<NodeEvaluation, EvaluationError>> = disc
        .taus
        .par_iter()
        .enumerate()
        .map(|(p, tau)| {
            let so = 2 + p * (nx + nu);
            let input = PathInput::new(
                &x[so..so + nx],
                &x[so + nx..so + nx + nu],
                Phase::node_time(x, *tau),
                phase,
            );
            evaluate_node(func, &input, p, info, with_jacobians)
        })
        .collect();

    let total = results.len();
    let mut nodes = Vec::with_capacity(total);
    let mut failed = 0_usize;
    let mut first = None;
    for result in results {
        match result {
            Ok(node) => nodes.push(node),
            Err(e) => {
                failed += 1;
                if first.is_none() {
                    first = Some(e.to_string());
                }
            }
        }
    }
    if let Some(first) = first {
        return NodesFailedSnafu {
            phase,
            failed,
            total,
            first,
        }
        .fail();
    }
    Ok(nodes)
}

/// Discovers the number of path constraints, their bounds and the dependency pattern of the path
/// function by evaluating it at a few guess nodes and at random points within the bounds.
#[allow(clippy::too_many_arguments)]
pub(crate) fn discover(
    func: &dyn UserPathFunction,
    phase: usize,
    nx: usize,
    nu: usize,
    disc: &Discretization,
    guess: &DVector<f64>,
    state_bounds: (&DVector<f64>, &DVector<f64>),
    control_bounds: (&DVector<f64>, &DVector<f64>),
    time_span: (f64, f64),
) -> Result<PathInfo, CollocationError> {
    let action = "initializing a phase";
    let guess = guess.as_slice();
    let (sl, su) = (state_bounds.0.as_slice(), state_bounds.1.as_slice());
    let (cl, cu) = (control_bounds.0.as_slice(), control_bounds.1.as_slice());
    let guess_point = |p: usize| {
        let so = 2 + p * (nx + nu);
        (
            guess[so..so + nx].to_vec(),
            guess[so + nx..so + nx + nu].to_vec(),
            Phase::node_time(guess, disc.taus[p]),
        )
    };

    let (state, control, time) = guess_point(0);
    let output = call_function(func, &PathInput::new(&state, &control, time, phase), 0)?;
    let dynamics = output.dynamics.as_ref().context(MissingConfigurationSnafu {
        what: "path function dynamics",
        action,
    })?;
    ensure!(
        dynamics.len() == nx,
        SizeMismatchSnafu {
            left: "path function dynamics",
            left_len: dynamics.len(),
            right: "states",
            right_len: nx,
        }
    );
    let (algebraic_lower, algebraic_upper) = match output.algebraic.as_ref() {
        Some(algebraic) if !algebraic.is_empty() => {
            let (lower, upper) =
                output
                    .algebraic_bounds
                    .clone()
                    .context(MissingConfigurationSnafu {
                        what: "algebraic path constraint bounds",
                        action,
                    })?;
            ensure!(
                lower.len() == algebraic.len(),
                SizeMismatchSnafu {
                    left: "algebraic lower bounds",
                    left_len: lower.len(),
                    right: "algebraic path constraints",
                    right_len: algebraic.len(),
                }
            );
            ensure!(
                upper.len() == algebraic.len(),
                SizeMismatchSnafu {
                    left: "algebraic upper bounds",
                    left_len: upper.len(),
                    right: "algebraic path constraints",
                    right_len: algebraic.len(),
                }
            );
            for (l, u) in lower.iter().zip(upper.iter()) {
                ensure!(
                    l <= u,
                    InvalidValueSnafu {
                        field: "algebraic path constraint bounds",
                        value: format!("[{l}, {u}]"),
                        expected: "lower <= upper",
                    }
                );
            }
            (lower, upper)
        }
        _ => (DVector::zeros(0), DVector::zeros(0)),
    };
    let na = algebraic_lower.len();

    let mut info = PathInfo {
        num_states: nx,
        num_controls: nu,
        num_algebraic: na,
        algebraic_lower,
        algebraic_upper,
        has_cost: output.cost.is_some(),
        analytic: func.has_analytic_jacobians(),
        dependencies: no_dependencies(nx + na + 1, nx + nu + 1),
    };

    let total = disc.total_nodes();
    let mut samples: Vec<(Vec<f64>, Vec<f64>, f64)> = [0, total / 2, total - 1]
        .iter()
        .map(|p| {
            let (state, control, time) = guess_point(*p);
            (
                clamp_within(&state, sl, su),
                clamp_within(&control, cl, cu),
                time,
            )
        })
        .collect();
    let (t_lo, t_hi) = sampling_interval(time_span.0, time_span.1);
    let corner = |lower: &[f64], upper: &[f64], high: bool| -> Vec<f64> {
        lower
            .iter()
            .zip(upper)
            .map(|(l, u)| {
                let (lo, hi) = sampling_interval(*l, *u);
                if high {
                    hi
                } else {
                    lo
                }
            })
            .collect()
    };
    samples.push((corner(sl, su, false), corner(cl, cu, false), t_lo));
    samples.push((corner(sl, su, true), corner(cl, cu, true), t_hi));
    let mut rng = Pcg64Mcg::new(DEPENDENCY_SEED);
    for _ in 0..NUM_RANDOM_SAMPLES {
        let state = sample_within(&mut rng, sl, su);
        let control = sample_within(&mut rng, cl, cu);
        let time = if t_hi > t_lo {
            rng.gen_range(t_lo..=t_hi)
        } else {
            t_lo
        };
        samples.push((state, control, time));
    }

    let mut dependencies = info.dependencies.clone();
    let mut first_failure = None;
    let mut successes = 0;
    for (k, (state, control, time)) in samples.iter().enumerate() {
        let input = PathInput::new(state, control, *time, phase);
        match jacobians(func, &input, k, &info) {
            Ok(jac) => {
                accumulate_nonzeros(&mut dependencies, &jac.to_stacked());
                successes += 1;
            }
            Err(e) => {
                debug!("phase {phase}: skipping dependency sample {k}: {e}");
                first_failure.get_or_insert(e);
            }
        }
    }
    if successes == 0 {
        if let Some(e) = first_failure {
            return Err(e.into());
        }
    }
    debug!(
        "phase {phase}: {} path function dependencies from {successes} samples",
        dependencies.iter().filter(|d| **d).count()
    );
    info.dependencies = dependencies;
    Ok(info)
}

/// Defect row block `p` of interval `block`: the nonzero columns of its difference row and the
/// support points whose dynamics it integrates.
fn defect_terms(block: &IntervalBlock, i: usize) -> (Vec<(usize, f64)>, Vec<(usize, f64)>) {
    let support = block.rule.support.len();
    let diff = (0..support)
        .map(|j| (block.first_node + j, block.rule.diff[(i, j)]))
        .filter(|(_, d)| *d != 0.0)
        .collect();
    let integration = (0..support)
        .map(|l| (block.first_node + l, block.rule.integration[(i, l)]))
        .filter(|(_, a)| *a != 0.0)
        .collect();
    (diff, integration)
}

/// Nodes of an interval with their quadrature weight, zero weights skipped.
fn quadrature_terms(block: &IntervalBlock) -> impl Iterator<Item = (usize, f64)> + '_ {
    block
        .rule
        .weights
        .iter()
        .enumerate()
        .filter(|(_, w)| **w != 0.0)
        .map(|(l, w)| (block.first_node + l, *w))
}

/// Sparsity of the phase constraints with respect to the phase decision vector.
pub(crate) fn jacobian_pattern(
    disc: &Discretization,
    info: &PathInfo,
    nx: usize,
    nu: usize,
) -> SparsityPattern {
    let nc = disc.num_collocation_nodes();
    let na = info.num_algebraic;
    let total = disc.total_nodes();
    let deps = &info.dependencies;
    let offset = |p: usize| 2 + p * (nx + nu);
    let mut pattern = SparsityPattern::new(nx * nc + na * total, 2 + (nx + nu) * total);

    for (p, (k, i)) in disc.collocation.iter().enumerate() {
        let (diff, integration) = defect_terms(&disc.intervals[*k], *i);
        for d in 0..nx {
            let row = p * nx + d;
            pattern.insert(row, 0);
            pattern.insert(row, 1);
            for (node, _) in &diff {
                pattern.insert(row, offset(*node) + d);
            }
            for (node, _) in &integration {
                for m in 0..nx + nu {
                    if deps[(d, m)] {
                        pattern.insert(row, offset(*node) + m);
                    }
                }
            }
        }
    }

    for p in 0..total {
        for a in 0..na {
            let row = nx * nc + p * na + a;
            if deps[(nx + a, info.time_column())] {
                pattern.insert(row, 0);
                pattern.insert(row, 1);
            }
            for m in 0..nx + nu {
                if deps[(nx + a, m)] {
                    pattern.insert(row, offset(p) + m);
                }
            }
        }
    }
    pattern
}

pub(crate) fn constraint_values(
    disc: &Discretization,
    info: &PathInfo,
    nodes: &[NodeEvaluation],
    nx: usize,
    nu: usize,
    x: &[f64],
) -> DVector<f64> {
    let nc = disc.num_collocation_nodes();
    let na = info.num_algebraic;
    let mut g = DVector::zeros(nx * nc + na * disc.total_nodes());
    for (p, (k, i)) in disc.collocation.iter().enumerate() {
        let block = &disc.intervals[*k];
        let hh = 0.5 * (x[1] - x[0]) * block.half_width();
        let (diff, integration) = defect_terms(block, *i);
        for (node, dij) in diff {
            let so = 2 + node * (nx + nu);
            for d in 0..nx {
                g[p * nx + d] += dij * x[so + d];
            }
        }
        for (node, a) in integration {
            for d in 0..nx {
                g[p * nx + d] -= hh * a * nodes[node].dynamics[d];
            }
        }
    }
    for (p, node) in nodes.iter().enumerate() {
        for a in 0..na {
            g[nx * nc + p * na + a] = node.algebraic[a];
        }
    }
    g
}

pub(crate) fn cost(
    disc: &Discretization,
    _info: &PathInfo,
    nodes: &[NodeEvaluation],
    x: &[f64],
) -> f64 {
    disc.intervals
        .iter()
        .map(|block| {
            let hh = 0.5 * (x[1] - x[0]) * block.half_width();
            quadrature_terms(block)
                .map(|(node, w)| hh * w * nodes[node].cost)
                .sum::<f64>()
        })
        .sum()
}

pub(crate) fn cost_gradient(
    disc: &Discretization,
    _info: &PathInfo,
    nodes: &[NodeEvaluation],
    nx: usize,
    nu: usize,
    x: &[f64],
) -> DVector<f64> {
    let mut grad = DVector::zeros(2 + (nx + nu) * disc.total_nodes());
    for block in &disc.intervals {
        let hw = block.half_width();
        let hh = 0.5 * (x[1] - x[0]) * hw;
        for (p, w) in quadrature_terms(block) {
            let tau = disc.taus[p];
            let node = &nodes[p];
            grad[0] -= 0.5 * hw * w * node.cost;
            grad[1] += 0.5 * hw * w * node.cost;
            if let Some(jac) = &node.jacobians {
                grad[0] += hh * w * jac.cost_time * 0.5 * (1.0 - tau);
                grad[1] += hh * w * jac.cost_time * 0.5 * (1.0 + tau);
                let so = 2 + p * (nx + nu);
                for m in 0..nx {
                    grad[so + m] += hh * w * jac.cost_state[m];
                }
                for m in 0..nu {
                    grad[so + nx + m] += hh * w * jac.cost_control[m];
                }
            }
        }
    }
    grad
}

/// Jacobian values in the order of the pattern built by [`jacobian_pattern`].
pub(crate) fn jacobian_values(
    disc: &Discretization,
    info: &PathInfo,
    pattern: &SparsityPattern,
    nodes: &[NodeEvaluation],
    nx: usize,
    nu: usize,
    x: &[f64],
) -> Vec<f64> {
    let nc = disc.num_collocation_nodes();
    let na = info.num_algebraic;
    let deps = &info.dependencies;
    let offset = |p: usize| 2 + p * (nx + nu);
    let mut values = vec![0.0; pattern.nnz()];
    let mut add = |row: usize, col: usize, value: f64| {
        if let Some(pos) = pattern.position(row, col) {
            values[pos] += value;
        }
    };

    for (p, (k, i)) in disc.collocation.iter().enumerate() {
        let block = &disc.intervals[*k];
        let hw = block.half_width();
        let hh = 0.5 * (x[1] - x[0]) * hw;
        let (diff, integration) = defect_terms(block, *i);
        for d in 0..nx {
            let row = p * nx + d;
            for (node, dij) in &diff {
                add(row, offset(*node) + d, *dij);
            }
        }
        for (l, a) in integration {
            let node = &nodes[l];
            let Some(jac) = node.jacobians.as_ref() else {
                continue;
            };
            let tau = disc.taus[l];
            for d in 0..nx {
                let row = p * nx + d;
                let f = node.dynamics[d];
                let ft = jac.dynamics_time[d];
                add(row, 0, a * (0.5 * hw * f - hh * ft * 0.5 * (1.0 - tau)));
                add(row, 1, a * (-0.5 * hw * f - hh * ft * 0.5 * (1.0 + tau)));
                for m in 0..nx {
                    if deps[(d, m)] {
                        add(row, offset(l) + m, -hh * a * jac.dynamics_state[(d, m)]);
                    }
                }
                for m in 0..nu {
                    if deps[(d, nx + m)] {
                        add(row, offset(l) + nx + m, -hh * a * jac.dynamics_control[(d, m)]);
                    }
                }
            }
        }
    }

    for (p, node) in nodes.iter().enumerate() {
        let Some(jac) = node.jacobians.as_ref() else {
            continue;
        };
        let tau = disc.taus[p];
        for a in 0..na {
            let row = nx * nc + p * na + a;
            let r = nx + a;
            if deps[(r, info.time_column())] {
                add(row, 0, 0.5 * (1.0 - tau) * jac.algebraic_time[a]);
                add(row, 1, 0.5 * (1.0 + tau) * jac.algebraic_time[a]);
            }
            for m in 0..nx {
                if deps[(r, m)] {
                    add(row, offset(p) + m, jac.algebraic_state[(a, m)]);
                }
            }
            for m in 0..nu {
                if deps[(r, nx + m)] {
                    add(row, offset(p) + nx + m, jac.algebraic_control[(a, m)]);
                }
            }
        }
    }
    values
}

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

use crate::errors::{
    panic_message, CollocationError, EvaluationError, InvalidValueSnafu,
    MissingConfigurationSnafu, PointOutputSnafu, PointPanicSnafu, SizeMismatchSnafu,
};
use crate::linalg::{DMatrix, DVector};
use crate::userfunc::finite_diff::{
    accumulate_nonzeros, central_difference, clamp_within, no_dependencies, sample_within,
    DEPENDENCY_SEED, NUM_RANDOM_SAMPLES,
};
use crate::userfunc::{PhaseEndpoints, PointInput, PointJacobians, PointOutput, UserPointFunction};
use rand_pcg::Pcg64Mcg;
use snafu::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Sizes and dependencies of the point function, discovered at initialization.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PointInfo {
    pub num_functions: usize,
    pub lower: DVector<f64>,
    pub upper: DVector<f64>,
    pub analytic: bool,
    pub num_states: Vec<usize>,
    /// Global decision vector column of each flattened endpoint quantity.
    pub columns: Vec<usize>,
    /// Rows: the functions then the cost. Columns: the flattened endpoints.
    pub dependencies: DMatrix<bool>,
}

/// Point function outputs at the current decision vector.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PointEvaluation {
    pub functions: DVector<f64>,
    pub cost: f64,
    /// Rows: the functions then the cost. Columns: the flattened endpoints.
    pub jacobian: Option<DMatrix<f64>>,
}

pub(crate) fn unflatten(flat: &[f64], num_states: &[usize]) -> Vec<PhaseEndpoints> {
    let mut offset = 0;
    num_states
        .iter()
        .map(|nx| {
            let endpoints = PhaseEndpoints::from_flat(&flat[offset..], *nx);
            offset += 2 + 2 * nx;
            endpoints
        })
        .collect()
}

fn call(
    func: &dyn UserPointFunction,
    flat: &[f64],
    num_states: &[usize],
) -> Result<PointOutput, EvaluationError> {
    let phases = unflatten(flat, num_states);
    let input = PointInput::new(&phases);
    let mut output = PointOutput::default();
    match catch_unwind(AssertUnwindSafe(|| {
        func.evaluate_functions(&input, &mut output)
    })) {
        Ok(Ok(())) => Ok(output),
        Ok(Err(source)) => Err(EvaluationError::PointFunction { source }),
        Err(payload) => PointPanicSnafu {
            msg: panic_message(payload),
        }
        .fail(),
    }
}

fn outputs(
    func: &dyn UserPointFunction,
    flat: &[f64],
    info: &PointInfo,
) -> Result<(DVector<f64>, f64), EvaluationError> {
    let output = call(func, flat, &info.num_states)?;
    let functions = output.functions.unwrap_or_else(|| DVector::zeros(0));
    ensure!(
        functions.len() == info.num_functions,
        PointOutputSnafu {
            quantity: "functions",
            msg: format!(
                "{} values set, expected {}",
                functions.len(),
                info.num_functions
            ),
        }
    );
    let cost = output.cost.unwrap_or(0.0);
    ensure!(
        functions.iter().all(|v| v.is_finite()) && cost.is_finite(),
        PointOutputSnafu {
            quantity: "value",
            msg: "non-finite output",
        }
    );
    Ok((functions, cost))
}

fn jacobian(
    func: &dyn UserPointFunction,
    flat: &[f64],
    info: &PointInfo,
) -> Result<DMatrix<f64>, EvaluationError> {
    let nf = info.num_functions;
    if info.analytic {
        let phases = unflatten(flat, &info.num_states);
        let input = PointInput::new(&phases);
        let mut jac = PointJacobians::zeros(nf, &info.num_states);
        match catch_unwind(AssertUnwindSafe(|| {
            func.evaluate_jacobians(&input, &mut jac)
        })) {
            Ok(Ok(())) => {}
            Ok(Err(source)) => return Err(EvaluationError::PointFunction { source }),
            Err(payload) => {
                return PointPanicSnafu {
                    msg: panic_message(payload),
                }
                .fail()
            }
        }
        ensure!(
            jac.functions.shape() == (nf, flat.len()) && jac.cost.len() == flat.len(),
            PointOutputSnafu {
                quantity: "jacobian",
                msg: format!(
                    "functions jacobian is {:?} and cost gradient has {} entries, expected {:?}",
                    jac.functions.shape(),
                    jac.cost.len(),
                    (nf, flat.len())
                ),
            }
        );
        let mut stacked = DMatrix::zeros(nf + 1, flat.len());
        stacked.rows_mut(0, nf).copy_from(&jac.functions);
        stacked.set_row(nf, &jac.cost.transpose());
        ensure!(
            stacked.iter().all(|v| v.is_finite()),
            PointOutputSnafu {
                quantity: "jacobian",
                msg: "non-finite partial",
            }
        );
        return Ok(stacked);
    }

    central_difference(flat, nf + 1, |z| {
        let (functions, cost) = outputs(func, z, info)?;
        let mut values = DVector::zeros(nf + 1);
        values.rows_mut(0, nf).copy_from(&functions);
        values[nf] = cost;
        Ok(values)
    })
}

pub(crate) fn evaluate(
    func: &dyn UserPointFunction,
    flat: &[f64],
    info: &PointInfo,
    with_jacobian: bool,
) -> Result<PointEvaluation, EvaluationError> {
    let (functions, cost) = outputs(func, flat, info)?;
    let jacobian = if with_jacobian {
        Some(jacobian(func, flat, info)?)
    } else {
        None
    };
    Ok(PointEvaluation {
        functions,
        cost,
        jacobian,
    })
}

/// Discovers the number of point functions, their bounds and their dependencies on the endpoints.
pub(crate) fn discover(
    func: &dyn UserPointFunction,
    guess: &[f64],
    bounds: (&[f64], &[f64]),
    num_states: Vec<usize>,
    columns: Vec<usize>,
) -> Result<PointInfo, CollocationError> {
    let action = "initializing the trajectory point function";
    let output = call(func, guess, &num_states)?;
    let nf = output.functions.as_ref().map(|f| f.len()).unwrap_or(0);
    let (lower, upper) = if nf > 0 {
        let (lower, upper) = output.bounds.clone().context(MissingConfigurationSnafu {
            what: "point function bounds",
            action,
        })?;
        ensure!(
            lower.len() == nf,
            SizeMismatchSnafu {
                left: "point function lower bounds",
                left_len: lower.len(),
                right: "point functions",
                right_len: nf,
            }
        );
        ensure!(
            upper.len() == nf,
            SizeMismatchSnafu {
                left: "point function upper bounds",
                left_len: upper.len(),
                right: "point functions",
                right_len: nf,
            }
        );
        for (l, u) in lower.iter().zip(upper.iter()) {
            ensure!(
                l <= u,
                InvalidValueSnafu {
                    field: "point function bounds",
                    value: format!("[{l}, {u}]"),
                    expected: "lower <= upper",
                }
            );
        }
        (lower, upper)
    } else {
        (DVector::zeros(0), DVector::zeros(0))
    };

    let mut info = PointInfo {
        num_functions: nf,
        lower,
        upper,
        analytic: func.has_analytic_jacobians(),
        num_states,
        dependencies: no_dependencies(nf + 1, guess.len()),
        columns,
    };
    if !info.analytic {
        warn!("point function provides no analytic jacobians, using central finite differences (slower and less accurate)");
    }

    let mut samples = vec![clamp_within(guess, bounds.0, bounds.1)];
    let mut rng = Pcg64Mcg::new(DEPENDENCY_SEED);
    for _ in 0..NUM_RANDOM_SAMPLES {
        samples.push(sample_within(&mut rng, bounds.0, bounds.1));
    }
    let mut dependencies = info.dependencies.clone();
    let mut first_failure = None;
    let mut successes = 0;
    for (k, sample) in samples.iter().enumerate() {
        match jacobian(func, sample, &info) {
            Ok(jac) => {
                accumulate_nonzeros(&mut dependencies, &jac);
                successes += 1;
            }
            Err(e) => {
                debug!("skipping point function dependency sample {k}: {e}");
                first_failure.get_or_insert(e);
            }
        }
    }
    if successes == 0 {
        if let Some(e) = first_failure {
            return Err(e.into());
        }
    }
    info.dependencies = dependencies;
    Ok(info)
}

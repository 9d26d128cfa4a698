extern crate nyx_collocation as nyx;

use crate::{drift_phase, FixedEnds};
use approx::assert_abs_diff_eq;
use nyx::linalg::{DMatrix, DVector};
use nyx::collocation::scheme_from_name;
use nyx::{ConfigError, EvaluationError, Trajectory};
use rand::Rng;
use rand_pcg::Pcg64Mcg;
use rstest::*;
use std::sync::Arc;

#[fixture]
fn traj() -> Trajectory {
    let _ = pretty_env_logger::try_init();
    let mut traj = Trajectory::new();
    traj.add_phase(drift_phase(2, 4));
    traj.set_point_function(Arc::new(FixedEnds {
        initial: 0.0,
        last: 1.0,
    }));
    traj.initialize().unwrap();
    traj
}

#[rstest]
#[case(1, 3)]
#[case(2, 4)]
#[case(5, 6)]
fn decision_vector_size(#[case] num_intervals: usize, #[case] num_points: usize) {
    let mut traj = Trajectory::new();
    traj.add_phase(drift_phase(num_intervals, num_points));
    traj.initialize().unwrap();

    let num_collocation = num_intervals * num_points;
    // Times, then a state and a control at every collocation node and at the final mesh point.
    assert_eq!(traj.num_variables(), 2 + 2 * (num_collocation + 1));
    // One defect per collocation node and no path constraint.
    assert_eq!(traj.num_constraints(), num_collocation);
    assert_eq!(traj.decision_vector().len(), traj.num_variables());
}

#[rstest]
fn linear_initial_guess(traj: Trajectory) {
    let x = traj.decision_vector();
    let phase = traj.phase(0).unwrap();
    assert_eq!(x[0], 0.0);
    assert_eq!(x[1], 1.0);
    assert_abs_diff_eq!(x[phase.state_offset(0)], 0.0);
    assert_abs_diff_eq!(
        x[phase.state_offset(phase.total_nodes() - 1)],
        0.5,
        epsilon = 1e-12
    );
}

#[rstest]
fn decision_vector_round_trip(mut traj: Trajectory) {
    let mut rng = Pcg64Mcg::new(7);
    let n = traj.num_variables();
    let x: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
    traj.set_decision_vector(&x).unwrap();
    assert_eq!(traj.decision_vector().as_slice(), x.as_slice());

    let err = traj.set_decision_vector(&x[1..]).unwrap_err();
    assert_eq!(
        err,
        EvaluationError::DecisionVectorSize {
            expected: n,
            actual: n - 1
        }
    );
    // A rejected vector leaves the previous one in place.
    assert_eq!(traj.decision_vector().as_slice(), x.as_slice());
}

#[rstest]
fn point_functions_follow_the_phases(traj: Trajectory) {
    let phase_rows = traj.phase_constraints(0).unwrap();
    assert_eq!(phase_rows, 0..8);
    assert_eq!(traj.num_constraints(), 10);

    let bounds = traj.bounds().unwrap();
    assert_eq!(bounds.g_lower.as_slice()[8..], [0.0, 1.0]);
    assert_eq!(bounds.g_upper.as_slice()[8..], [0.0, 1.0]);
    assert_eq!(bounds.x_lower[0], bounds.x_upper[0]);
}

#[rstest]
fn jacobian_structure_is_stable(mut traj: Trajectory) {
    let pattern = traj.jacobian_sparsity_pattern().unwrap().clone();
    let mut rng = Pcg64Mcg::new(42);
    for _ in 0..5 {
        let x: Vec<f64> = (0..traj.num_variables())
            .map(|_| rng.gen_range(-2.0..2.0))
            .collect();
        traj.set_decision_vector(&x).unwrap();
        let values = traj.constraint_jacobian_values().unwrap();
        assert_eq!(values.len(), pattern.nnz());
        assert_eq!(traj.jacobian_sparsity_pattern().unwrap(), &pattern);
    }
}

#[rstest]
fn jacobian_matches_finite_differences(mut traj: Trajectory) {
    let x0 = traj.decision_vector().clone();
    let analytic = traj.constraint_jacobian().unwrap().to_dense();
    let (_, g0) = traj.cost_constraint_functions().unwrap();

    let h = 1e-6;
    let mut numeric = DMatrix::zeros(traj.num_constraints(), traj.num_variables());
    for c in 0..x0.len() {
        let mut x = x0.clone();
        x[c] += h;
        traj.set_decision_vector(x.as_slice()).unwrap();
        let (_, g) = traj.cost_constraint_functions().unwrap();
        numeric.set_column(c, &((g - &g0) / h));
    }
    // The problem is linear in the decision variables apart from the time scaling.
    assert_abs_diff_eq!(analytic, numeric, epsilon = 1e-5);
}

#[rstest]
fn hessian_structure_is_lower_triangular(mut traj: Trajectory) {
    let pattern = traj.hessian_sparsity_pattern().unwrap().clone();
    assert!(pattern.iter().all(|(r, c)| r >= c));

    let lambda = vec![0.0; traj.num_constraints()];
    let x0 = traj.decision_vector().clone();
    let values = traj.compute_hessian_contraction(1.0, &lambda).unwrap();
    assert_eq!(values.len(), pattern.nnz());
    assert_eq!(traj.decision_vector(), &x0);

    // The running cost u² integrated over a fixed unit time span has a diagonal hessian in the
    // controls, with the quadrature weights scaled by the half span.
    let phase = traj.phase(0).unwrap();
    let control = phase.control_offset(0);
    let pos = pattern.position(control, control).unwrap();
    assert!(values[pos] > 0.0);

    let wrong = traj.compute_hessian_contraction(1.0, &lambda[1..]);
    assert!(matches!(
        wrong,
        Err(EvaluationError::MultiplierSize { .. })
    ));
}

#[test]
fn uninitialized_trajectory_reports_errors() {
    let mut traj = Trajectory::new();
    assert!(traj.initialize().is_err());
    traj.add_phase(drift_phase(1, 3));
    assert!(!traj.is_initialized());
    assert!(traj.jacobian_sparsity_pattern().is_err());
    assert!(traj.cost_constraint_functions().is_err());
    assert_eq!(traj.decision_vector(), &DVector::<f64>::zeros(0));
}

#[rstest]
fn endpoints_are_size_checked(traj: Trajectory) {
    let x = traj.decision_vector().as_slice();
    let phase = traj.phase(0).unwrap();
    let ends = phase.endpoints(x).unwrap();
    assert_eq!(ends.initial_time, 0.0);
    assert_eq!(ends.final_time, 1.0);
    assert_abs_diff_eq!(ends.final_state[0], 0.5, epsilon = 1e-12);
    assert!(matches!(
        phase.endpoints(&x[1..]),
        Err(ConfigError::SizeMismatch { .. })
    ));
}

#[rstest]
fn final_radau_control_stays_out_of_the_phase(mut traj: Trajectory) {
    let n = traj.num_variables();
    let phase = traj.phase(0).unwrap();
    let last = phase.total_nodes() - 1;
    let mut x = traj.decision_vector().as_slice().to_vec();
    for p in 0..=last {
        x[phase.control_offset(p)] = 1.0;
    }
    x[phase.control_offset(last)] = 100.0;
    assert_eq!(x.len(), n);

    for tau in [-0.9, 0.2, 0.75, 0.99] {
        let (_, control) = phase.interpolate(&x, tau).unwrap();
        assert_abs_diff_eq!(control[0], 1.0, epsilon = 1e-12);
    }

    traj.set_decision_vector(&x).unwrap();
    let (cost, g) = traj.cost_constraint_functions().unwrap();
    let last_control = traj.phase(0).unwrap().control_offset(last);
    x[last_control] = -3.0;
    traj.set_decision_vector(&x).unwrap();
    let (cost_after, g_after) = traj.cost_constraint_functions().unwrap();
    assert_eq!(cost, cost_after);
    assert_eq!(g, g_after);
}

#[rstest]
fn defect_rows_map_to_their_states(traj: Trajectory) {
    let columns = traj.defect_state_columns().unwrap();
    assert_eq!(columns.len(), traj.num_constraints());
    let phase = traj.phase(0).unwrap();
    for p in 0..8 {
        assert_eq!(columns[p], Some(phase.state_offset(p)));
    }
    // Point function rows are not defects.
    assert_eq!(columns[8..], [None, None]);
}

#[rstest]
fn scaled_constraints_shift_by_their_bounds(mut traj: Trajectory) {
    let (_, g) = traj.cost_constraint_functions().unwrap();
    let (scaled, equality) = traj.scaled_constraint_functions().unwrap();
    assert!(equality.iter().all(|e| *e));
    // Defects are bounded by zero, the final state by one.
    assert_eq!(scaled.as_slice()[..8], g.as_slice()[..8]);
    assert_abs_diff_eq!(scaled[9], g[9] - 1.0, epsilon = 1e-15);
}

#[test]
fn schemes_by_name() {
    for name in ["RadauPseudospectral", "Trapezoid", "HermiteSimpson", "RungeKutta8"] {
        assert!(scheme_from_name(name).is_ok(), "{name}");
    }
    let scheme = scheme_from_name("HermiteSimpson").unwrap();
    assert_eq!(scheme.to_string(), "Lobatto IIIA (Hermite-Simpson)");
    assert!(matches!(
        scheme_from_name("Euler"),
        Err(ConfigError::UnsupportedOption { .. })
    ));
}

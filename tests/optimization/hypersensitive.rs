extern crate nyx_collocation as nyx;

use nyx::linalg::DMatrix;
use nyx::userfunc::{
    Endpoint, PathInput, PathJacobians, PathOutput, PointInput, PointJacobians, PointOutput,
};
use nyx::{
    InteriorPointSolver, Phase, Trajectory, UserFunctionError, UserPathFunction,
    UserPointFunction,
};
use rstest::*;
use std::sync::Arc;

/// x' = -x³ + u with the running cost (x² + u²) / 2.
struct Hypersensitive;

impl UserPathFunction for Hypersensitive {
    fn evaluate_functions(
        &self,
        input: &PathInput,
        output: &mut PathOutput,
    ) -> Result<(), UserFunctionError> {
        let x = input.state()[0];
        let u = input.control()[0];
        output.set_dynamics(&[-x.powi(3) + u]);
        output.set_cost(0.5 * (x * x + u * u));
        Ok(())
    }
}

/// x(t0) = 1 and x(tf) = 1.5, with analytic partials.
struct Boundary;

impl UserPointFunction for Boundary {
    fn evaluate_functions(
        &self,
        input: &PointInput,
        output: &mut PointOutput,
    ) -> Result<(), UserFunctionError> {
        output.set_functions(&[input.initial_state(0)?[0], input.final_state(0)?[0]]);
        output.set_function_bounds(&[1.0, 1.5], &[1.0, 1.5]);
        Ok(())
    }

    fn evaluate_jacobians(
        &self,
        _input: &PointInput,
        jacobians: &mut PointJacobians,
    ) -> Result<(), UserFunctionError> {
        jacobians.set_functions_wrt(
            0,
            Endpoint::InitialState,
            &DMatrix::from_row_slice(2, 1, &[1.0, 0.0]),
        )?;
        jacobians.set_functions_wrt(
            0,
            Endpoint::FinalState,
            &DMatrix::from_row_slice(2, 1, &[0.0, 1.0]),
        )
    }

    fn has_analytic_jacobians(&self) -> bool {
        true
    }
}

fn hypersensitive() -> Trajectory {
    let mut phase = Phase::new();
    phase.set_path_function(Arc::new(Hypersensitive));
    phase.set_num_states(1);
    phase.set_num_controls(1);
    phase.set_state_lower_bound(&[-50.0]);
    phase.set_state_upper_bound(&[50.0]);
    phase.set_control_lower_bound(&[-50.0]);
    phase.set_control_upper_bound(&[50.0]);
    phase.set_initial_time_bounds(0.0, 0.0).unwrap();
    phase.set_final_time_bounds(10.0, 10.0).unwrap();
    phase.set_time_guess(0.0, 10.0).unwrap();
    phase.set_state_initial_guess(&[1.0]);
    phase.set_state_final_guess(&[1.5]);
    phase
        .set_mesh_interval_fractions(&[-1.0, -0.5, 0.0, 0.5, 1.0])
        .unwrap();
    phase.set_mesh_interval_num_points(&[5, 5, 5, 5]).unwrap();

    let mut traj = Trajectory::new();
    traj.add_phase(phase);
    traj.set_point_function(Arc::new(Boundary));
    traj
}

#[fixture]
fn traj() -> Trajectory {
    let _ = pretty_env_logger::try_init();
    hypersensitive()
}

#[rstest]
fn single_solve_without_refinement(mut traj: Trajectory) {
    traj.set_max_mesh_refinement_count(0);
    let rslt = traj.optimize(&InteriorPointSolver::default()).unwrap();
    println!("{rslt}");

    assert!(rslt.is_success(), "{}", rslt.status);
    assert_eq!(rslt.num_solves, 1);
    assert_eq!(rslt.refinement_count, 0);
    // No refinement allowed means the mesh is never checked, hence never declared converged.
    assert!(!rslt.mesh_converged);
    assert!(rslt.max_violation < 1e-6);
    assert!(rslt.cost > 0.0);

    let x = rslt.decision_vector.as_slice();
    let phase = traj.phase(0).unwrap();
    let last = phase.state_offset(phase.total_nodes() - 1);
    assert!((x[phase.state_offset(0)] - 1.0).abs() < 1e-6);
    assert!((x[last] - 1.5).abs() < 1e-6);
}

#[rstest]
fn refinement_loop_is_bounded(mut traj: Trajectory) {
    traj.set_max_mesh_refinement_count(2);
    let rslt = traj.optimize(&InteriorPointSolver::default()).unwrap();
    println!("{rslt}");

    assert!(rslt.is_success(), "{}", rslt.status);
    assert_eq!(rslt.num_solves, rslt.refinement_count + 1);
    // Either the mesh converged early or every allowed refinement was used.
    assert!(rslt.mesh_converged || rslt.refinement_count == 2);
    assert!(rslt.refinement_count <= 2);
    // The layout follows the refined meshes.
    assert_eq!(traj.decision_vector().len(), traj.num_variables());
    let phase = traj.phase(0).unwrap();
    assert_eq!(
        traj.num_variables(),
        2 + 2 * phase.mesh().unwrap().total_nodes()
    );
}

#[test]
fn analytic_path_partials_are_optional() {
    struct Analytic;

    impl UserPathFunction for Analytic {
        fn evaluate_functions(
            &self,
            input: &PathInput,
            output: &mut PathOutput,
        ) -> Result<(), UserFunctionError> {
            Hypersensitive.evaluate_functions(input, output)
        }

        fn evaluate_jacobians(
            &self,
            input: &PathInput,
            jacobians: &mut PathJacobians,
        ) -> Result<(), UserFunctionError> {
            let x = input.state()[0];
            let u = input.control()[0];
            jacobians.dynamics_state[(0, 0)] = -3.0 * x * x;
            jacobians.dynamics_control[(0, 0)] = 1.0;
            jacobians.cost_state[0] = x;
            jacobians.cost_control[0] = u;
            Ok(())
        }

        fn has_analytic_jacobians(&self) -> bool {
            true
        }
    }

    let mut numeric = hypersensitive();
    let mut analytic = hypersensitive();
    analytic
        .phase_mut(0)
        .unwrap()
        .set_path_function(Arc::new(Analytic));
    numeric.initialize().unwrap();
    analytic.initialize().unwrap();
    assert_eq!(
        numeric.jacobian_sparsity_pattern().unwrap(),
        analytic.jacobian_sparsity_pattern().unwrap()
    );

    let jac_n = numeric.constraint_jacobian_values().unwrap();
    let jac_a = analytic.constraint_jacobian_values().unwrap();
    for (n, a) in jac_n.iter().zip(jac_a.iter()) {
        assert!((n - a).abs() < 1e-6, "{n} != {a}");
    }
    let grad_n = numeric.cost_gradient().unwrap();
    let grad_a = analytic.cost_gradient().unwrap();
    assert!((grad_n - grad_a).amax() < 1e-6);
}

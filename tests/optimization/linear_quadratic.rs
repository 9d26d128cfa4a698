extern crate nyx_collocation as nyx;

use crate::{drift_phase, FixedEnds};
use approx::assert_abs_diff_eq;
use nyx::collocation::LobattoIIIA;
use nyx::linalg::DVector;
use nyx::nlp::{NlpProblem, SolveReport};
use nyx::phase::Phase;
use nyx::trajectory::MeshGuessMode;
use nyx::userfunc::{OutOfDomainSnafu, PathInput, PathOutput};
use nyx::{
    InteriorPointSolver, NlpSolver, SolveStatus, SolverOptions, Trajectory, UserFunctionError,
    UserPathFunction,
};
use rstest::*;
use std::sync::atomic::{AtomicBool, Ordering};
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
    traj
}

/// Moving a single integrator from 0 to 1 in unit time: u = 1 and x = t, for a cost of one. Both
/// are polynomials the collocation reproduces exactly.
#[rstest]
fn minimum_energy_transfer(mut traj: Trajectory) {
    let solver = InteriorPointSolver::default();
    let rslt = traj.optimize(&solver).unwrap();
    println!("{rslt}");

    assert!(rslt.is_success(), "{}", rslt.status);
    assert!(rslt.mesh_converged);
    assert_eq!(rslt.refinement_count, 0);
    assert_eq!(rslt.num_solves, 1);
    assert_abs_diff_eq!(rslt.cost, 1.0, epsilon = 1e-6);
    assert!(rslt.max_violation < 1e-6);

    let x = rslt.decision_vector.as_slice();
    let phase = traj.phase(0).unwrap();
    let disc = phase.discretization().unwrap();
    for (p, tau) in disc.taus.iter().enumerate() {
        let so = phase.state_offset(p);
        let t = Phase::node_time(x, *tau);
        assert_abs_diff_eq!(x[so], t, epsilon = 1e-6);
        // The final control of a Radau phase only enters the path constraints, of which there are
        // none here.
        if p < disc.num_collocation_nodes() {
            assert_abs_diff_eq!(x[so + 1], 1.0, epsilon = 1e-5);
        }
    }
    // The trajectory holds the solution after the solve.
    assert_eq!(traj.decision_vector(), &rslt.decision_vector);
}

#[rstest]
fn longer_transfer_is_cheaper(mut traj: Trajectory) {
    // Over [0, 2], u = 1/2 for a cost of one half.
    traj.phase_mut(0)
        .unwrap()
        .set_final_time_bounds(2.0, 2.0)
        .unwrap();
    traj.phase_mut(0).unwrap().set_time_guess(0.0, 2.0).unwrap();
    let rslt = traj.optimize(&InteriorPointSolver::default()).unwrap();
    assert!(rslt.is_success());
    assert_abs_diff_eq!(rslt.cost, 0.5, epsilon = 1e-6);
}

#[rstest]
fn iteration_limit_stops_before_refinement(mut traj: Trajectory) {
    let solver = InteriorPointSolver::new(SolverOptions::builder().max_iter(1).build());
    let rslt = traj.optimize(&solver).unwrap();
    assert_eq!(rslt.status, SolveStatus::MaximumIterationsExceeded);
    assert!(!rslt.is_success());
    assert!(!rslt.mesh_converged);
    assert_eq!(rslt.num_solves, 1);
    assert_eq!(rslt.refinement_count, 0);
}

#[rstest]
fn cost_bounds_are_validated(mut traj: Trajectory) {
    assert!(traj.set_cost_bounds(1.0, -1.0).is_err());
    traj.set_cost_bounds(0.0, 10.0).unwrap();
    assert_eq!(traj.cost_bounds(), (0.0, 10.0));
}

#[rstest]
fn hermite_simpson_transfer(mut traj: Trajectory) {
    traj.phase_mut(0)
        .unwrap()
        .set_scheme(Arc::new(LobattoIIIA::hermite_simpson()));
    let rslt = traj.optimize(&InteriorPointSolver::default()).unwrap();
    println!("{rslt}");

    assert!(rslt.is_success(), "{}", rslt.status);
    assert!(rslt.mesh_converged);
    assert_abs_diff_eq!(rslt.cost, 1.0, epsilon = 1e-6);

    let x = rslt.decision_vector.as_slice();
    let phase = traj.phase(0).unwrap();
    let disc = phase.discretization().unwrap();
    // Two Simpson steps per interval, the midpoints are nodes too.
    assert_eq!(disc.total_nodes(), 9);
    for (p, tau) in disc.taus.iter().enumerate() {
        let so = phase.state_offset(p);
        assert_abs_diff_eq!(x[so], Phase::node_time(x, *tau), epsilon = 1e-6);
        assert_abs_diff_eq!(x[so + 1], 1.0, epsilon = 1e-5);
    }
}

#[rstest]
fn hermite_simpson_rejects_odd_points(mut traj: Trajectory) {
    let phase = traj.phase_mut(0).unwrap();
    phase.set_scheme(Arc::new(LobattoIIIA::hermite_simpson()));
    phase.set_mesh_interval_num_points(&[3, 4]).unwrap();
    assert!(traj.initialize().is_err());
}

#[rstest]
fn no_iteration_still_reports_the_guess(mut traj: Trajectory) {
    let solver = InteriorPointSolver::new(SolverOptions::builder().max_iter(0).build());
    let rslt = traj.optimize(&solver).unwrap();
    assert_eq!(rslt.status, SolveStatus::MaximumIterationsExceeded);
    assert!(!rslt.mesh_converged);
    assert_eq!(rslt.num_solves, 1);
    assert_eq!(rslt.refinement_count, 0);
    assert_eq!(rslt.iterations, 0);
    assert!(rslt.cost.is_finite());
    assert!(rslt.evaluation_error.is_none());
    // The guess goes from 0 to 0.5 but the final state is fixed at 1.
    assert!(rslt.max_violation > 0.1);
}

#[rstest]
fn scaled_transfer(mut traj: Trajectory) {
    traj.set_auto_scaling(true);
    traj.set_cost_scaling(4.0).unwrap();
    assert!(traj.set_cost_scaling(0.0).is_err());
    assert!(traj.set_cost_scaling(f64::NAN).is_err());
    assert_eq!(traj.cost_scaling(), 4.0);

    let rslt = traj.optimize(&InteriorPointSolver::default()).unwrap();
    println!("{rslt}");
    assert!(rslt.is_success(), "{}", rslt.status);
    // Costs and violations are reported unscaled.
    assert_abs_diff_eq!(rslt.cost, 1.0, epsilon = 1e-4);
    assert!(rslt.max_violation < 1e-4);
}

#[rstest]
fn failed_solves_may_refine(mut traj: Trajectory) {
    traj.set_failed_mesh_optimization_allowance(true);
    traj.set_max_mesh_refinement_count(2);
    let solver = InteriorPointSolver::new(SolverOptions::builder().max_iter(1).build());
    let rslt = traj.optimize(&solver).unwrap();
    println!("{rslt}");
    assert_eq!(rslt.num_solves, rslt.refinement_count + 1);
    assert!(rslt.mesh_converged || rslt.refinement_count == 2);
}

#[rstest]
fn best_iterate_guides_refinement(mut traj: Trajectory) {
    assert_eq!(traj.mesh_guess_mode(), MeshGuessMode::CurrentSolution);
    traj.set_mesh_guess_mode(MeshGuessMode::BestSolution);
    assert_eq!("BestSolution".parse::<MeshGuessMode>().unwrap(), MeshGuessMode::BestSolution);
    assert!("Cheapest".parse::<MeshGuessMode>().is_err());

    let rslt = traj.optimize(&InteriorPointSolver::default()).unwrap();
    assert!(rslt.is_success(), "{}", rslt.status);
    assert!(rslt.mesh_converged);
    assert_abs_diff_eq!(rslt.cost, 1.0, epsilon = 1e-5);
}

/// The single integrator, failing once `broken` is set.
struct Fragile {
    broken: Arc<AtomicBool>,
}

impl UserPathFunction for Fragile {
    fn evaluate_functions(
        &self,
        input: &PathInput,
        output: &mut PathOutput,
    ) -> Result<(), UserFunctionError> {
        if self.broken.load(Ordering::SeqCst) {
            return OutOfDomainSnafu { msg: "broken" }.fail();
        }
        let u = input.control()[0];
        output.set_dynamics(&[u]);
        output.set_cost(u * u);
        Ok(())
    }
}

/// Claims success at the starting point, breaking the path function before returning.
struct Breaking {
    broken: Arc<AtomicBool>,
}

impl NlpSolver for Breaking {
    fn solve(&self, problem: &mut dyn NlpProblem) -> SolveReport {
        let mut x = vec![0.0; problem.get_nlp_info().num_variables];
        problem.get_starting_point(&mut x);
        self.broken.store(true, Ordering::SeqCst);
        SolveReport {
            status: SolveStatus::SolveSucceeded,
            x: DVector::from_vec(x),
            objective: 0.0,
            iterations: 0,
            constraint_violation: 0.0,
        }
    }
}

#[rstest]
fn failed_final_evaluation_keeps_the_status(mut traj: Trajectory) {
    let broken = Arc::new(AtomicBool::new(false));
    traj.phase_mut(0).unwrap().set_path_function(Arc::new(Fragile {
        broken: broken.clone(),
    }));
    traj.set_max_mesh_refinement_count(0);
    let rslt = traj.optimize(&Breaking { broken }).unwrap();
    println!("{rslt}");

    assert_eq!(rslt.status, SolveStatus::SolveSucceeded);
    assert!(rslt.cost.is_nan());
    assert_eq!(rslt.max_violation, f64::INFINITY);
    assert!(rslt.evaluation_error.is_some());
    assert!(format!("{rslt}").contains("final evaluation failed"));
}

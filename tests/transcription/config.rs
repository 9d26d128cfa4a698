extern crate nyx_collocation as nyx;

use crate::{Drift, FixedEnds};
use nyx::io::{ConfigRepr, PhaseConfig, TrajectoryConfig};
use nyx::phase::PhaseStatus;
use nyx::{CollocationError, ConfigError, Phase, UserPathFunction};
use std::sync::Arc;

const DRIFT_TRAJECTORY: &str = r#"
phases:
  - num_states: 1
    num_controls: 1
    state_lower_bound: [-10]
    state_upper_bound: [10]
    control_lower_bound: [-10]
    control_upper_bound: [10]
    initial_time_bounds: [0, 0]
    final_time_bounds: [1, 1]
    initial_state_guess: [0]
    final_state_guess: [1]
    time_guess: [0, 1]
    mesh_interval_fractions: [-1, 0, 1]
    mesh_interval_num_points: [4, 4]
cost_bounds: [0, 100]
max_mesh_refinement_count: 2
refinement_tolerance: 1.0e-6
solver:
  tol: 1.0e-9
  max_iter: 200
"#;

#[test]
fn trajectory_from_yaml() {
    let _ = pretty_env_logger::try_init();
    let cfg = TrajectoryConfig::loads(DRIFT_TRAJECTORY).unwrap();
    let opts = cfg.solver_options();
    assert_eq!(opts.tol, 1e-9);
    assert_eq!(opts.max_iter, 200);
    // Unset options keep their defaults.
    assert_eq!(opts.acceptable_iter, 15);

    let paths: Vec<Arc<dyn UserPathFunction>> = vec![Arc::new(Drift)];
    let mut traj = cfg
        .into_trajectory(
            &paths,
            Some(Arc::new(FixedEnds {
                initial: 0.0,
                last: 1.0,
            })),
        )
        .unwrap();
    assert_eq!(traj.num_phases(), 1);
    assert_eq!(traj.cost_bounds(), (0.0, 100.0));
    assert_eq!(traj.max_mesh_refinement_count(), 2);
    assert_eq!(traj.phase(0).unwrap().status(), PhaseStatus::Configured);

    traj.initialize().unwrap();
    assert_eq!(traj.num_variables(), 2 + 2 * 9);
    assert_eq!(traj.num_constraints(), 8 + 2);
}

#[test]
fn several_phases_in_one_document() {
    let docs = r#"
- num_states: 1
  num_controls: 0
- num_states: 7
  num_controls: 3
"#;
    let phases = PhaseConfig::loads_many(docs).unwrap();
    assert_eq!(phases.len(), 2);
    assert_eq!(phases[1].num_controls, Some(3));
    assert_eq!(phases[0].orbit, None);
}

#[test]
fn unknown_thrust_mode() {
    let mut phase = Phase::orbital(6378.1363, 1000.0, 398_600.4415);
    let err = phase.set_thrust_mode("Cruise").unwrap_err();
    assert!(matches!(err, ConfigError::UnsupportedOption { .. }));
    assert!(phase.set_thrust_mode("Coast").is_ok());
    assert!(phase.set_thrust_mode("coast").is_err());
}

#[test]
fn thrust_settings_require_an_orbit_phase() {
    let mut phase = Phase::new();
    assert!(phase.set_thrust_mode("Thrust").is_err());
    assert!(phase.set_isp(3000.0).is_err());
}

#[test]
fn invalid_mesh_is_rejected() {
    let mut phase = Phase::new();
    assert!(matches!(
        phase.set_mesh_interval_fractions(&[-1.0, 0.5, 0.2, 1.0]),
        Err(ConfigError::InvalidMesh { .. })
    ));
    assert!(matches!(
        phase.set_mesh_interval_fractions(&[-1.0]),
        Err(ConfigError::InvalidMesh { .. })
    ));
    assert!(phase.set_mesh_interval_num_points(&[0]).is_err());
    assert!(phase.set_time_guess(1.0, 1.0).is_err());
    assert!(phase.set_initial_time_bounds(2.0, 1.0).is_err());
}

#[test]
fn unconfigured_phase_fails_to_initialize() {
    let mut phase = Phase::new();
    phase.set_path_function(Arc::new(Drift));
    phase.set_num_states(1);
    let err = phase.initialize().unwrap_err();
    assert!(matches!(
        err,
        CollocationError::Configuration {
            source: ConfigError::MissingConfiguration { .. }
        }
    ));
}

#[test]
fn mismatched_bounds_fail_to_initialize() {
    let mut phase = crate::drift_phase(1, 3);
    phase.set_state_lower_bound(&[-1.0, -1.0]);
    let err = phase.initialize().unwrap_err();
    assert!(matches!(
        err,
        CollocationError::Configuration {
            source: ConfigError::SizeMismatch { .. }
        }
    ));
}

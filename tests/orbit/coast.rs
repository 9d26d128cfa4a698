extern crate nyx_collocation as nyx;

use nyx::dynamics::{ModEqDynamics, OrbitDynamics};
use nyx::linalg::Vector6;
use nyx::phase::{OrbitModel, ThrustMode};
use nyx::userfunc::{PathInput, PathOutput};
use nyx::UserPathFunction;
use rand::Rng;
use rand_pcg::Pcg64Mcg;
use rstest::*;

#[fixture]
fn coasting() -> OrbitModel {
    let _ = pretty_env_logger::try_init();
    let mut model = OrbitModel::new(6378.1363, 1000.0, 398_600.4415);
    model.set_state_representation("ModifiedEquinoctial");
    model.set_control_representation("UnitVector");
    model.set_thrust_mode("Coast").unwrap();
    // A coasting model needs neither thrust nor Isp.
    model.initialize().unwrap();
    model
}

#[rstest]
fn coast_ignores_the_controls(coasting: OrbitModel) {
    assert_eq!(coasting.thrust_mode(), ThrustMode::Coast);
    assert_eq!(coasting.control_magnitude_bounds(), (0.0, 0.0));
    let func = coasting.path_function().unwrap();
    let dynamics = ModEqDynamics::canonical();

    let state = [1.1, 0.05, -0.02, 0.01, 0.03, 2.0, 0.9];
    let unforced = dynamics.unforced_rates(&Vector6::from_column_slice(&state[..6]));

    let mut rng = Pcg64Mcg::new(0xC0A57);
    for _ in 0..5 {
        let control: Vec<f64> = (0..3).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let thrust = coasting.compute_thrust(&control).unwrap();
        assert_eq!(thrust.mass_flow, 0.0);
        assert_eq!(thrust.thrust.norm(), 0.0);

        let mut output = PathOutput::default();
        func.evaluate_functions(&PathInput::new(&state, &control, 0.0, 0), &mut output)
            .unwrap();
        let rhs = output.dynamics().unwrap();
        for i in 0..6 {
            assert_eq!(rhs[i], unforced[i]);
        }
        assert_eq!(rhs[6], 0.0);
        // The control magnitude is still reported, and bounded to zero.
        let u2: f64 = control.iter().map(|u| u * u).sum();
        assert_eq!(output.algebraic().unwrap()[0], u2);
    }
}

#[rstest]
fn thrusting_consumes_mass() {
    let mut model = OrbitModel::new(6378.1363, 1000.0, 398_600.4415);
    model.set_thrust_mode("Thrust").unwrap();
    // Thrust and Isp are required to thrust.
    assert!(model.initialize().is_err());
    model.set_available_thrust(0.5).unwrap();
    model.set_isp(3000.0).unwrap();
    model.initialize().unwrap();
    assert_eq!(model.control_magnitude_bounds(), (1.0, 1.0));

    let func = model.path_function().unwrap();
    let state = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
    let mut output = PathOutput::default();
    func.evaluate_functions(&PathInput::new(&state, &[0.0, 1.0, 0.0], 0.0, 0), &mut output)
        .unwrap();
    let rhs = output.dynamics().unwrap();
    assert!(rhs[6] < 0.0);
    // Along-track thrust raises the semi-latus rectum.
    assert!(rhs[0] > 0.0);
}

#[rstest]
fn invalid_states_are_reported() {
    let mut model = OrbitModel::new(6378.1363, 1000.0, 398_600.4415);
    model.set_thrust_mode("Coast").unwrap();
    model.initialize().unwrap();
    let func = model.path_function().unwrap();
    let mut output = PathOutput::default();
    let negative_mass = [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, -1.0];
    assert!(func
        .evaluate_functions(
            &PathInput::new(&negative_mass, &[0.0; 3], 0.0, 0),
            &mut output
        )
        .is_err());
    let negative_p = [-1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0];
    assert!(func
        .evaluate_functions(&PathInput::new(&negative_p, &[0.0; 3], 0.0, 0), &mut output)
        .is_err());
}

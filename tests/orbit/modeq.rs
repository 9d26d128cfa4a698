extern crate nyx_collocation as nyx;

use approx::assert_abs_diff_eq;
use nyx::dynamics::modeq::modeq_to_cartesian;
use nyx::dynamics::{CartesianDynamics, ModEqDynamics, OrbitDynamics};
use nyx::linalg::{Vector3, Vector6};
use rstest::*;
use std::f64::consts::PI;

/// Fixed step fourth order Runge Kutta, enough for a few smooth revolutions.
fn rk4(dynamics: &dyn OrbitDynamics, state: Vector6<f64>, duration: f64, steps: usize) -> Vector6<f64> {
    let h = duration / steps as f64;
    let thrust = Vector3::zeros();
    let mut x = state;
    for _ in 0..steps {
        let k1 = dynamics.compute_orbit_derivatives(&x, &thrust);
        let k2 = dynamics.compute_orbit_derivatives(&(x + k1 * (h / 2.0)), &thrust);
        let k3 = dynamics.compute_orbit_derivatives(&(x + k2 * (h / 2.0)), &thrust);
        let k4 = dynamics.compute_orbit_derivatives(&(x + k3 * h), &thrust);
        x += (k1 + k2 * 2.0 + k3 * 2.0 + k4) * (h / 6.0);
    }
    x
}

#[rstest]
#[case(0.0, 0.0)]
#[case(0.1, 0.0)]
#[case(0.05, -0.2)]
fn three_revolutions(#[case] f: f64, #[case] g: f64) {
    let _ = pretty_env_logger::try_init();
    let dynamics = ModEqDynamics::canonical();
    let p = 1.2;
    let ecc2 = f * f + g * g;
    let sma = p / (1.0 - ecc2);
    let period = 2.0 * PI * sma.powf(1.5);

    let initial = Vector6::new(p, f, g, 0.1, -0.05, 0.3);
    let last = rk4(&dynamics, initial, 3.0 * period, 6000);

    // Only the true longitude moves without a perturbation, by exactly three revolutions.
    for i in 0..5 {
        assert_eq!(last[i], initial[i], "element {i} changed");
    }
    assert_abs_diff_eq!(last[5] - initial[5], 6.0 * PI, epsilon = 1e-7);

    // The specific orbital energy is that of the semi-major axis.
    let (r, v) = modeq_to_cartesian(&last, dynamics.mu);
    let energy = v.norm_squared() / 2.0 - dynamics.mu / r.norm();
    assert_abs_diff_eq!(energy, -dynamics.mu / (2.0 * sma), epsilon = 1e-12);
}

#[test]
fn agrees_with_cartesian_propagation() {
    let modeq = ModEqDynamics::canonical();
    let cartesian = CartesianDynamics::canonical();
    let initial = Vector6::new(1.1, 0.08, 0.03, 0.2, 0.1, 0.0);
    let (r0, v0) = modeq_to_cartesian(&initial, modeq.mu);
    let cart0 = Vector6::new(r0[0], r0[1], r0[2], v0[0], v0[1], v0[2]);

    let duration = 2.5;
    let modeq_last = rk4(&modeq, initial, duration, 2000);
    let cart_last = rk4(&cartesian, cart0, duration, 2000);
    let (r, v) = modeq_to_cartesian(&modeq_last, modeq.mu);

    assert_abs_diff_eq!(r, cart_last.fixed_rows::<3>(0).into_owned(), epsilon = 1e-9);
    assert_abs_diff_eq!(v, cart_last.fixed_rows::<3>(3).into_owned(), epsilon = 1e-9);
}

#[test]
fn radial_thrust_leaves_p_constant() {
    let dynamics = ModEqDynamics::canonical();
    let state = Vector6::new(1.0, 0.1, 0.2, 0.0, 0.0, 1.0);
    let radial = dynamics.compute_orbit_derivatives(&state, &Vector3::new(1e-3, 0.0, 0.0));
    assert_eq!(radial[0], 0.0);
    // Out of plane thrust is the only one to change the orientation of the plane.
    assert_eq!(radial[3], 0.0);
    assert_eq!(radial[4], 0.0);
    let normal = dynamics.compute_orbit_derivatives(&state, &Vector3::new(0.0, 0.0, 1e-3));
    assert!(normal[3].abs() > 0.0);
}

extern crate nyx_collocation as nyx;

use crate::{drift_phase, FixedEnds};
use nyx::{InteriorPointSolver, OptimizationResult, Trajectory};
use rstest::*;
use std::sync::Arc;

#[fixture]
fn solved() -> (Trajectory, OptimizationResult) {
    let _ = pretty_env_logger::try_init();
    let mut traj = Trajectory::new();
    traj.add_phase(drift_phase(1, 4));
    traj.set_point_function(Arc::new(FixedEnds {
        initial: 0.0,
        last: 1.0,
    }));
    let rslt = traj.optimize(&InteriorPointSolver::default()).unwrap();
    (traj, rslt)
}

#[rstest]
fn solution_to_csv(solved: (Trajectory, OptimizationResult)) {
    let (traj, rslt) = solved;
    let mut buf = Vec::new();
    rslt.to_csv(&traj, &mut buf).unwrap();

    let mut rdr = csv::Reader::from_reader(buf.as_slice());
    let headers = rdr.headers().unwrap().clone();
    assert_eq!(
        headers.iter().collect::<Vec<&str>>(),
        vec!["phase", "node", "time", "x0", "u0"]
    );

    let rows: Vec<Vec<f64>> = rdr
        .records()
        .map(|r| r.unwrap().iter().map(|v| v.parse().unwrap()).collect())
        .collect();
    // Four collocation points and the final mesh point.
    assert_eq!(rows.len(), 5);
    assert!(rows.windows(2).all(|w| w[1][2] > w[0][2]));
    assert_eq!(rows[0][2], 0.0);
    assert!((rows[4][2] - 1.0).abs() < 1e-12);
    assert!((rows[4][3] - 1.0).abs() < 1e-6);
}

#[rstest]
fn solution_to_file(solved: (Trajectory, OptimizationResult)) {
    let (traj, rslt) = solved;
    let path = std::env::temp_dir().join("nyx_collocation_drift.csv");
    rslt.to_csv_file(&traj, &path).unwrap();
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().count(), 6);

    // A result which does not match the trajectory is reported, not written partially.
    let mut other = Trajectory::new();
    other.add_phase(drift_phase(3, 4));
    other.initialize().unwrap();
    assert!(rslt.to_csv(&other, Vec::new()).is_err());
}

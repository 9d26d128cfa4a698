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

use super::Trajectory;
use crate::errors::CollocationError;
use crate::io::{CsvSnafu, InputOutputError, MissingDataSnafu, StdIOSnafu};
use crate::linalg::DVector;
use crate::nlp::SolveStatus;
use crate::phase::Phase;
use snafu::prelude::*;
use std::fmt;
use std::io::Write;
use std::path::Path;

/// Outcome of [`Trajectory::optimize`].
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizationResult {
    /// Status of the last solve.
    pub status: SolveStatus,
    /// Whether the mesh refinement policy accepted the last mesh of every phase.
    pub mesh_converged: bool,
    pub refinement_count: usize,
    pub num_solves: usize,
    /// Iterations of the last solve.
    pub iterations: usize,
    pub cost: f64,
    pub max_violation: f64,
    pub decision_vector: DVector<f64>,
    /// Why the cost and the violation could not be evaluated at the final point, in which case
    /// they are NaN and infinite.
    pub evaluation_error: Option<CollocationError>,
}

impl OptimizationResult {
    pub fn is_success(&self) -> bool {
        self.status.is_converged()
    }

    /// Writes one row per node of every phase: phase index, node index, time, states and controls.
    ///
    /// Phases may have different numbers of states and controls, so rows are not all the same
    /// length. The header covers the widest phase.
    pub fn to_csv<W: Write>(&self, traj: &Trajectory, writer: W) -> Result<(), InputOutputError> {
        let mut wtr = csv::WriterBuilder::new().flexible(true).from_writer(writer);
        let nx = traj.phases().iter().map(|p| p.num_states()).max().unwrap_or(0);
        let nu = traj.phases().iter().map(|p| p.num_controls()).max().unwrap_or(0);
        let mut headers = vec!["phase".to_string(), "node".to_string(), "time".to_string()];
        headers.extend((0..nx).map(|i| format!("x{i}")));
        headers.extend((0..nu).map(|i| format!("u{i}")));
        wtr.write_record(&headers).context(CsvSnafu {
            action: "writing the solution headers",
        })?;
        for (i, phase) in traj.phases().iter().enumerate() {
            let range = traj.phase_variables(i).context(MissingDataSnafu {
                which: format!("layout of phase {i}"),
            })?;
            ensure!(
                range.end <= self.decision_vector.len(),
                MissingDataSnafu {
                    which: format!("decision variables of phase {i}"),
                }
            );
            let x = &self.decision_vector.as_slice()[range];
            for record in node_records(phase, i, x)? {
                wtr.write_record(&record).context(CsvSnafu {
                    action: "writing a solution row",
                })?;
            }
        }
        wtr.flush().context(StdIOSnafu {
            action: "flushing the solution",
        })
    }

    /// Writes [`OptimizationResult::to_csv`] to a file.
    pub fn to_csv_file<P: AsRef<Path>>(
        &self,
        traj: &Trajectory,
        path: P,
    ) -> Result<(), InputOutputError> {
        let file = std::fs::File::create(&path).context(StdIOSnafu {
            action: "creating the solution file",
        })?;
        self.to_csv(traj, file)?;
        info!("solution written to {}", path.as_ref().display());
        Ok(())
    }
}

fn node_records(phase: &Phase, index: usize, x: &[f64]) -> Result<Vec<Vec<String>>, InputOutputError> {
    let disc = phase.discretization().context(MissingDataSnafu {
        which: format!("discretization of phase {index}"),
    })?;
    let (nx, nu) = (phase.num_states(), phase.num_controls());
    Ok(disc
        .taus
        .iter()
        .enumerate()
        .map(|(p, tau)| {
            let so = phase.state_offset(p);
            let mut record = vec![
                index.to_string(),
                p.to_string(),
                Phase::node_time(x, *tau).to_string(),
            ];
            record.extend(x[so..so + nx + nu].iter().map(|v| v.to_string()));
            record
        })
        .collect())
}

impl fmt::Display for OptimizationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} solve(s) and {} mesh refinement(s), mesh {}converged: cost = {:.9e}, max violation = {:.3e}",
            self.status,
            self.num_solves,
            self.refinement_count,
            if self.mesh_converged { "" } else { "not " },
            self.cost,
            self.max_violation
        )?;
        if let Some(e) = &self.evaluation_error {
            write!(f, ", final evaluation failed: {e}")?;
        }
        Ok(())
    }
}

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

use crate::collocation::{scheme_from_name, ResidualRefinement};
use crate::errors::{ConfigError, ConfigFileSnafu};
use crate::nlp::SolverOptions;
use crate::phase::{CostFunction, GuessMode, Phase};
use crate::trajectory::{MeshGuessMode, Trajectory};
use crate::userfunc::{UserPathFunction, UserPointFunction};
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Errors while writing or reading solution files.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InputOutputError {
    #[snafu(display("{action} encountered an IO error: {source}"))]
    StdIO {
        action: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("{action} encountered a CSV error: {source}"))]
    Csv {
        action: &'static str,
        source: csv::Error,
    },
    #[snafu(display("missing {which}"))]
    MissingData { which: String },
}

impl PartialEq for InputOutputError {
    /// No two IO errors match
    fn eq(&self, _other: &Self) -> bool {
        false
    }
}

fn read_file<P: AsRef<Path>>(path: &P) -> Result<BufReader<File>, ConfigError> {
    File::open(path).map(BufReader::new).map_err(|e| {
        ConfigFileSnafu {
            path: path.as_ref().display().to_string(),
            msg: e.to_string(),
        }
        .build()
    })
}

fn parse_error(path: &str, e: serde_yaml::Error) -> ConfigError {
    ConfigFileSnafu {
        path,
        msg: e.to_string(),
    }
    .build()
}

pub trait ConfigRepr: Debug + Sized + serde::Serialize + DeserializeOwned {
    /// Builds the configuration representation from the path to a yaml
    fn load<P>(path: P) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
    {
        let reader = read_file(&path)?;
        serde_yaml::from_reader(reader)
            .map_err(|e| parse_error(&path.as_ref().display().to_string(), e))
    }

    /// Builds a sequence of "Selves" from the provided path to a yaml
    fn load_many<P>(path: P) -> Result<Vec<Self>, ConfigError>
    where
        P: AsRef<Path>,
    {
        let reader = read_file(&path)?;
        serde_yaml::from_reader(reader)
            .map_err(|e| parse_error(&path.as_ref().display().to_string(), e))
    }

    /// Builds a map of names to "selves" from the provided path to a yaml
    fn load_named<P>(path: P) -> Result<BTreeMap<String, Self>, ConfigError>
    where
        P: AsRef<Path>,
    {
        let reader = read_file(&path)?;
        serde_yaml::from_reader(reader)
            .map_err(|e| parse_error(&path.as_ref().display().to_string(), e))
    }

    /// Builds "Self" from the provided string of a yaml
    fn loads(data: &str) -> Result<Self, ConfigError> {
        debug!("Loading YAML:\n{data}");
        serde_yaml::from_str(data).map_err(|e| parse_error("<string>", e))
    }

    /// Builds a sequence of "Selves" from the provided string of a yaml
    fn loads_many(data: &str) -> Result<Vec<Self>, ConfigError> {
        debug!("Loading YAML:\n{data}");
        serde_yaml::from_str(data).map_err(|e| parse_error("<string>", e))
    }
}

/// Propulsion and scaling of an orbit phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrbitConfig {
    pub distance_unit_km: f64,
    pub mass_unit_kg: f64,
    pub mu_km3_s2: f64,
    pub state_representation: String,
    pub control_representation: String,
    #[serde(default = "default_thrust_mode")]
    pub thrust_mode: String,
    pub available_thrust_n: Option<f64>,
    pub isp_s: Option<f64>,
    pub cost: Option<CostFunction>,
}

fn default_thrust_mode() -> String {
    "Thrust".to_string()
}

/// Serializable description of a phase. The path function is provided in code, except for orbit
/// phases which build their own.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub num_states: Option<usize>,
    pub num_controls: Option<usize>,
    pub state_lower_bound: Option<Vec<f64>>,
    pub state_upper_bound: Option<Vec<f64>>,
    pub control_lower_bound: Option<Vec<f64>>,
    pub control_upper_bound: Option<Vec<f64>>,
    pub initial_time_bounds: Option<[f64; 2]>,
    pub final_time_bounds: Option<[f64; 2]>,
    pub initial_state_guess: Option<Vec<f64>>,
    pub final_state_guess: Option<Vec<f64>>,
    pub time_guess: Option<[f64; 2]>,
    pub guess_mode: Option<GuessMode>,
    /// Name of the transcription, Radau if unset.
    pub transcription: Option<String>,
    pub mesh_interval_fractions: Option<Vec<f64>>,
    pub mesh_interval_num_points: Option<Vec<usize>>,
    pub orbit: Option<OrbitConfig>,
}

impl ConfigRepr for PhaseConfig {}

impl PhaseConfig {
    /// Builds the phase through its setters, so the configuration is validated exactly as in code.
    pub fn into_phase(
        self,
        path_function: Option<Arc<dyn UserPathFunction>>,
    ) -> Result<Phase, ConfigError> {
        let mut phase = match &self.orbit {
            Some(orbit) => {
                let mut phase =
                    Phase::orbital(orbit.distance_unit_km, orbit.mass_unit_kg, orbit.mu_km3_s2);
                phase.set_state_representation(&orbit.state_representation)?;
                phase.set_control_representation(&orbit.control_representation)?;
                phase.set_thrust_mode(&orbit.thrust_mode)?;
                if let Some(thrust) = orbit.available_thrust_n {
                    phase.set_available_thrust(thrust)?;
                }
                if let Some(isp) = orbit.isp_s {
                    phase.set_isp(isp)?;
                }
                phase.set_orbit_cost(orbit.cost)?;
                phase
            }
            None => Phase::new(),
        };
        if let Some(name) = &self.transcription {
            phase.set_scheme(scheme_from_name(name)?);
        }
        if let Some(func) = path_function {
            phase.set_path_function(func);
        }
        if let Some(nx) = self.num_states {
            phase.set_num_states(nx);
        }
        if let Some(nu) = self.num_controls {
            phase.set_num_controls(nu);
        }
        if let Some(lower) = &self.state_lower_bound {
            phase.set_state_lower_bound(lower);
        }
        if let Some(upper) = &self.state_upper_bound {
            phase.set_state_upper_bound(upper);
        }
        if let Some(lower) = &self.control_lower_bound {
            phase.set_control_lower_bound(lower);
        }
        if let Some(upper) = &self.control_upper_bound {
            phase.set_control_upper_bound(upper);
        }
        if let Some([lower, upper]) = self.initial_time_bounds {
            phase.set_initial_time_bounds(lower, upper)?;
        }
        if let Some([lower, upper]) = self.final_time_bounds {
            phase.set_final_time_bounds(lower, upper)?;
        }
        if let Some(guess) = &self.initial_state_guess {
            phase.set_state_initial_guess(guess);
        }
        if let Some(guess) = &self.final_state_guess {
            phase.set_state_final_guess(guess);
        }
        if let Some([initial, final_]) = self.time_guess {
            phase.set_time_guess(initial, final_)?;
        }
        if let Some(mode) = self.guess_mode {
            phase.set_guess_mode(mode);
        }
        if let Some(fractions) = &self.mesh_interval_fractions {
            phase.set_mesh_interval_fractions(fractions)?;
        }
        if let Some(points) = &self.mesh_interval_num_points {
            phase.set_mesh_interval_num_points(points)?;
        }
        Ok(phase)
    }
}

/// Serializable description of a trajectory and of the options of its solve.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryConfig {
    pub phases: Vec<PhaseConfig>,
    pub cost_bounds: Option<[f64; 2]>,
    pub max_mesh_refinement_count: Option<usize>,
    pub refinement_tolerance: Option<f64>,
    #[serde(default)]
    pub allow_failed_mesh_optimizations: bool,
    pub mesh_guess_mode: Option<MeshGuessMode>,
    #[serde(default)]
    pub auto_scaling: bool,
    pub cost_scaling: Option<f64>,
    pub solver: Option<SolverOptions>,
}

impl ConfigRepr for TrajectoryConfig {}

impl TrajectoryConfig {
    /// Builds the trajectory. Phase `i` receives `path_functions[i]` when provided.
    pub fn into_trajectory(
        self,
        path_functions: &[Arc<dyn UserPathFunction>],
        point_function: Option<Arc<dyn UserPointFunction>>,
    ) -> Result<Trajectory, ConfigError> {
        let mut traj = Trajectory::new();
        for (i, phase) in self.phases.into_iter().enumerate() {
            traj.add_phase(phase.into_phase(path_functions.get(i).cloned())?);
        }
        if let Some(func) = point_function {
            traj.set_point_function(func);
        }
        if let Some([lower, upper]) = self.cost_bounds {
            traj.set_cost_bounds(lower, upper)?;
        }
        if let Some(count) = self.max_mesh_refinement_count {
            traj.set_max_mesh_refinement_count(count);
        }
        if let Some(tol) = self.refinement_tolerance {
            ensure!(
                tol > 0.0,
                crate::errors::InvalidValueSnafu {
                    field: "refinement tolerance",
                    value: tol.to_string(),
                    expected: "a positive tolerance",
                }
            );
            traj.set_mesh_refinement(Arc::new(ResidualRefinement::new(tol)));
        }
        traj.set_failed_mesh_optimization_allowance(self.allow_failed_mesh_optimizations);
        if let Some(mode) = self.mesh_guess_mode {
            traj.set_mesh_guess_mode(mode);
        }
        traj.set_auto_scaling(self.auto_scaling);
        if let Some(weight) = self.cost_scaling {
            traj.set_cost_scaling(weight)?;
        }
        Ok(traj)
    }

    /// Solver options of this configuration, the defaults if unset.
    pub fn solver_options(&self) -> SolverOptions {
        self.solver.unwrap_or_default()
    }
}

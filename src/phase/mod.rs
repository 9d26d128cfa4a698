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

use crate::collocation::mesh::{validate_fractions, validate_points};
use crate::collocation::{CollocationScheme, Discretization, Mesh, RadauScheme};
use crate::errors::{
    CollocationError, ConfigError, EvaluationError, InvalidValueSnafu, MissingConfigurationSnafu,
    NotInitializedSnafu, SizeMismatchSnafu,
};
use crate::linalg::{DMatrix, DVector};
use crate::sparse::SparsityPattern;
use crate::userfunc::{PathInput, PhaseEndpoints, UserPathFunction};
use serde_derive::{Deserialize, Serialize};
use snafu::prelude::*;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

mod evaluation;
pub use evaluation::NodeEvaluation;
pub(crate) use evaluation::PathInfo;

/// Orbit phases: scaling, representations and propulsion.
pub mod orbit;
pub use orbit::{
    ControlRepresentation, CostFunction, OrbitModel, OrbitPathFunction, StateRepresentation,
    ThrustMode, ThrustOutput,
};

/// Lifecycle of a phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PhaseStatus {
    /// Some required setting is missing.
    Unconfigured,
    /// Mesh, bounds and guesses are set.
    Configured,
    /// Scale units, sizes and sparsity are derived.
    Initialized,
    /// At least one evaluation was performed on the current mesh.
    Evaluating,
}

/// How the initial guess is built from the initial and final state guesses.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuessMode {
    /// States linearly interpolated between the guesses, controls set to zero.
    #[default]
    LinearNoControl,
    /// States linearly interpolated between the guesses, controls set to one.
    LinearUnityControl,
}

impl FromStr for GuessMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LinearNoControl" => Ok(Self::LinearNoControl),
            "LinearUnityControl" => Ok(Self::LinearUnityControl),
            _ => crate::errors::UnsupportedOptionSnafu {
                field: "guess mode",
                value: s,
                supported: "`LinearNoControl`, `LinearUnityControl`",
            }
            .fail(),
        }
    }
}

/// Data derived by [`Phase::initialize`].
#[derive(Clone, Debug)]
struct Derived {
    mesh: Mesh,
    disc: Discretization,
    info: PathInfo,
    jac_pattern: SparsityPattern,
    guess: DVector<f64>,
}

/// One continuous arc of the trajectory, transcribed with a collocation scheme.
///
/// The phase decision vector is `[t0, tf, x_0, u_0, x_1, u_1, ..., x_N, u_N]` where `N + 1` is the
/// number of nodes of the mesh (the collocation points and the final mesh point). Its constraints
/// are the defects at every collocation node (node major) followed by the algebraic path
/// constraints at every node.
pub struct Phase {
    index: usize,
    scheme: Arc<dyn CollocationScheme>,
    path_function: Option<Arc<dyn UserPathFunction>>,
    /// True if the path function was provided rather than built from the orbit model.
    custom_path_function: bool,
    orbit: Option<OrbitModel>,
    num_states: Option<usize>,
    num_controls: Option<usize>,
    state_lower: Option<DVector<f64>>,
    state_upper: Option<DVector<f64>>,
    control_lower: Option<DVector<f64>>,
    control_upper: Option<DVector<f64>>,
    initial_time_bounds: Option<(f64, f64)>,
    final_time_bounds: Option<(f64, f64)>,
    initial_state_guess: Option<DVector<f64>>,
    final_state_guess: Option<DVector<f64>>,
    time_guess: Option<(f64, f64)>,
    guess_mode: GuessMode,
    mesh_fractions: Option<Vec<f64>>,
    mesh_points: Option<Vec<usize>>,
    warm_start: Option<DVector<f64>>,
    status: PhaseStatus,
    derived: Option<Derived>,
    nodes: Vec<NodeEvaluation>,
    nodes_have_jacobians: bool,
}

impl Default for Phase {
    fn default() -> Self {
        Self::new()
    }
}

impl Phase {
    /// A phase transcribed with Radau collocation, with no path function yet.
    pub fn new() -> Self {
        Self::with_scheme(Arc::new(RadauScheme))
    }

    pub fn with_scheme(scheme: Arc<dyn CollocationScheme>) -> Self {
        Self {
            index: 0,
            scheme,
            path_function: None,
            custom_path_function: false,
            orbit: None,
            num_states: None,
            num_controls: None,
            state_lower: None,
            state_upper: None,
            control_lower: None,
            control_upper: None,
            initial_time_bounds: None,
            final_time_bounds: None,
            initial_state_guess: None,
            final_state_guess: None,
            time_guess: None,
            guess_mode: GuessMode::default(),
            mesh_fractions: None,
            mesh_points: None,
            warm_start: None,
            status: PhaseStatus::Unconfigured,
            derived: None,
            nodes: Vec::new(),
            nodes_have_jacobians: false,
        }
    }

    /// An orbit phase with seven states (six elements and the mass) and three controls. The path
    /// function is built from the orbit model at initialization unless one is provided.
    pub fn orbital(distance_unit_km: f64, mass_unit_kg: f64, mu_km3_s2: f64) -> Self {
        let mut me = Self::new();
        me.orbit = Some(OrbitModel::new(distance_unit_km, mass_unit_kg, mu_km3_s2));
        me.num_states = Some(orbit::ORBIT_NUM_STATES);
        me.num_controls = Some(orbit::ORBIT_NUM_CONTROLS);
        me
    }

    /// Any setter invalidates the derived data.
    fn touch(&mut self) {
        self.derived = None;
        self.nodes.clear();
        self.nodes_have_jacobians = false;
        self.status = if self.is_configured() {
            PhaseStatus::Configured
        } else {
            PhaseStatus::Unconfigured
        };
    }

    fn is_configured(&self) -> bool {
        (self.path_function.is_some() || self.orbit.is_some())
            && self.num_states.is_some()
            && self.num_controls.is_some()
            && self.state_lower.is_some()
            && self.state_upper.is_some()
            && self.control_lower.is_some()
            && self.control_upper.is_some()
            && self.initial_time_bounds.is_some()
            && self.final_time_bounds.is_some()
            && self.initial_state_guess.is_some()
            && self.final_state_guess.is_some()
            && self.time_guess.is_some()
            && self.mesh_fractions.is_some()
            && self.mesh_points.is_some()
    }

    pub fn status(&self) -> PhaseStatus {
        self.status
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        if self.index != index {
            self.index = index;
            self.touch();
        }
    }

    pub fn set_path_function(&mut self, func: Arc<dyn UserPathFunction>) {
        self.path_function = Some(func);
        self.custom_path_function = true;
        self.touch();
    }

    pub fn set_num_states(&mut self, num_states: usize) {
        self.num_states = Some(num_states);
        self.touch();
    }

    pub fn set_num_controls(&mut self, num_controls: usize) {
        self.num_controls = Some(num_controls);
        self.touch();
    }

    pub fn set_state_lower_bound(&mut self, lower: &[f64]) {
        self.state_lower = Some(DVector::from_column_slice(lower));
        self.touch();
    }

    pub fn set_state_upper_bound(&mut self, upper: &[f64]) {
        self.state_upper = Some(DVector::from_column_slice(upper));
        self.touch();
    }

    pub fn set_control_lower_bound(&mut self, lower: &[f64]) {
        self.control_lower = Some(DVector::from_column_slice(lower));
        self.touch();
    }

    pub fn set_control_upper_bound(&mut self, upper: &[f64]) {
        self.control_upper = Some(DVector::from_column_slice(upper));
        self.touch();
    }

    fn check_interval(field: &'static str, lower: f64, upper: f64) -> Result<(), ConfigError> {
        ensure!(
            !lower.is_nan() && !upper.is_nan() && lower <= upper,
            InvalidValueSnafu {
                field,
                value: format!("[{lower}, {upper}]"),
                expected: "lower <= upper",
            }
        );
        Ok(())
    }

    /// Sets the same bounds on the initial and the final time.
    pub fn set_time_bounds(&mut self, lower: f64, upper: f64) -> Result<(), ConfigError> {
        Self::check_interval("time bounds", lower, upper)?;
        self.initial_time_bounds = Some((lower, upper));
        self.final_time_bounds = Some((lower, upper));
        self.touch();
        Ok(())
    }

    pub fn set_initial_time_bounds(&mut self, lower: f64, upper: f64) -> Result<(), ConfigError> {
        Self::check_interval("initial time bounds", lower, upper)?;
        self.initial_time_bounds = Some((lower, upper));
        self.touch();
        Ok(())
    }

    pub fn set_final_time_bounds(&mut self, lower: f64, upper: f64) -> Result<(), ConfigError> {
        Self::check_interval("final time bounds", lower, upper)?;
        self.final_time_bounds = Some((lower, upper));
        self.touch();
        Ok(())
    }

    pub fn set_state_initial_guess(&mut self, guess: &[f64]) {
        self.initial_state_guess = Some(DVector::from_column_slice(guess));
        self.touch();
    }

    pub fn set_state_final_guess(&mut self, guess: &[f64]) {
        self.final_state_guess = Some(DVector::from_column_slice(guess));
        self.touch();
    }

    pub fn set_time_guess(&mut self, initial: f64, final_: f64) -> Result<(), ConfigError> {
        ensure!(
            initial.is_finite() && final_.is_finite() && final_ > initial,
            InvalidValueSnafu {
                field: "time guess",
                value: format!("[{initial}, {final_}]"),
                expected: "finite times with the final time after the initial time",
            }
        );
        self.time_guess = Some((initial, final_));
        self.touch();
        Ok(())
    }

    pub fn set_guess_mode(&mut self, mode: GuessMode) {
        self.guess_mode = mode;
        self.touch();
    }

    /// Replaces the transcription scheme, e.g. with [`crate::collocation::LobattoIIIA`].
    pub fn set_scheme(&mut self, scheme: Arc<dyn CollocationScheme>) {
        self.scheme = scheme;
        self.warm_start = None;
        self.touch();
    }

    /// Sets the interval breakpoints in normalized time, strictly increasing from -1 to 1.
    pub fn set_mesh_interval_fractions(&mut self, fractions: &[f64]) -> Result<(), ConfigError> {
        validate_fractions(fractions)?;
        self.mesh_fractions = Some(fractions.to_vec());
        self.touch();
        Ok(())
    }

    /// Sets the number of collocation points of each interval, at least two each.
    pub fn set_mesh_interval_num_points(&mut self, points: &[usize]) -> Result<(), ConfigError> {
        validate_points(points)?;
        self.mesh_points = Some(points.to_vec());
        self.touch();
        Ok(())
    }

    fn orbit_mut(&mut self, action: &'static str) -> Result<&mut OrbitModel, ConfigError> {
        self.orbit.as_mut().context(MissingConfigurationSnafu {
            what: "orbit model",
            action,
        })
    }

    /// Sets the orbit state representation tag, validated at initialization.
    pub fn set_state_representation(&mut self, tag: &str) -> Result<(), ConfigError> {
        self.orbit_mut("setting the state representation")?
            .set_state_representation(tag);
        self.touch();
        Ok(())
    }

    /// Sets the orbit control representation tag, validated at initialization.
    pub fn set_control_representation(&mut self, tag: &str) -> Result<(), ConfigError> {
        self.orbit_mut("setting the control representation")?
            .set_control_representation(tag);
        self.touch();
        Ok(())
    }

    /// Sets the thrust mode, exactly "Thrust" or "Coast".
    pub fn set_thrust_mode(&mut self, mode: &str) -> Result<(), ConfigError> {
        // Reject invalid modes even on a phase without an orbit model.
        let parsed: ThrustMode = mode.parse()?;
        self.orbit_mut("setting the thrust mode")?
            .set_thrust_mode(&parsed.to_string())?;
        self.touch();
        Ok(())
    }

    /// Sets the available thrust in newtons.
    pub fn set_available_thrust(&mut self, thrust_n: f64) -> Result<(), ConfigError> {
        self.orbit_mut("setting the available thrust")?
            .set_available_thrust(thrust_n)?;
        self.touch();
        Ok(())
    }

    /// Sets the specific impulse in seconds.
    pub fn set_isp(&mut self, isp_s: f64) -> Result<(), ConfigError> {
        self.orbit_mut("setting the Isp")?.set_isp(isp_s)?;
        self.touch();
        Ok(())
    }

    /// Sets the integrand cost of the orbit path function.
    pub fn set_orbit_cost(&mut self, cost: Option<CostFunction>) -> Result<(), ConfigError> {
        self.orbit_mut("setting the cost function")?
            .set_cost_function(cost);
        self.touch();
        Ok(())
    }

    pub fn orbit_model(&self) -> Option<&OrbitModel> {
        self.orbit.as_ref()
    }

    /// Computes the non-dimensional thrust and mass flow rate for these controls.
    pub fn compute_thrust(&self, control: &[f64]) -> Result<ThrustOutput, ConfigError> {
        self.orbit
            .as_ref()
            .context(MissingConfigurationSnafu {
                what: "orbit model",
                action: "computing the thrust",
            })?
            .compute_thrust(control)
    }

    /// Replaces the mesh, used by mesh refinement. The phase goes back to `Configured` and the
    /// provided decision vector is used as the next initial guess.
    pub fn refine_mesh(&mut self, mesh: Mesh, warm_start: DVector<f64>) {
        self.mesh_fractions = Some(mesh.fractions().to_vec());
        self.mesh_points = Some(mesh.points().to_vec());
        self.set_warm_start(warm_start);
    }

    /// Uses this phase decision vector as the initial guess of the next initialization, instead of
    /// the guess mode. It is ignored if its length does not match the mesh.
    pub fn set_warm_start(&mut self, guess: DVector<f64>) {
        self.touch();
        self.warm_start = Some(guess);
    }

    /// Derives the scale units, validates the configuration, discovers the path function outputs
    /// and builds the Jacobian sparsity pattern of this mesh.
    pub fn initialize(&mut self) -> Result<(), CollocationError> {
        let action = "initializing a phase";
        if let Some(orbit) = self.orbit.as_mut() {
            orbit.initialize()?;
            if !self.custom_path_function {
                self.path_function = Some(Arc::new(orbit.path_function()?));
            }
        }
        let func = self
            .path_function
            .clone()
            .context(MissingConfigurationSnafu {
                what: "path function",
                action,
            })?;
        let nx = self.num_states.context(MissingConfigurationSnafu {
            what: "number of states",
            action,
        })?;
        let nu = self.num_controls.context(MissingConfigurationSnafu {
            what: "number of controls",
            action,
        })?;
        ensure!(
            nx > 0,
            InvalidValueSnafu {
                field: "number of states",
                value: "0",
                expected: "at least one state",
            }
        );

        let state_lower = Self::sized(&self.state_lower, "state lower bound", nx, "states")?;
        let state_upper = Self::sized(&self.state_upper, "state upper bound", nx, "states")?;
        let control_lower =
            Self::sized(&self.control_lower, "control lower bound", nu, "controls")?;
        let control_upper =
            Self::sized(&self.control_upper, "control upper bound", nu, "controls")?;
        for i in 0..nx {
            Self::check_interval("state bounds", state_lower[i], state_upper[i])?;
        }
        for i in 0..nu {
            Self::check_interval("control bounds", control_lower[i], control_upper[i])?;
        }
        let x0_guess = Self::sized(
            &self.initial_state_guess,
            "initial state guess",
            nx,
            "states",
        )?;
        let xf_guess = Self::sized(&self.final_state_guess, "final state guess", nx, "states")?;
        ensure!(
            self.initial_time_bounds.is_some() && self.final_time_bounds.is_some(),
            MissingConfigurationSnafu {
                what: "time bounds",
                action,
            }
        );
        let (t0_guess, tf_guess) = self.time_guess.context(MissingConfigurationSnafu {
            what: "time guess",
            action,
        })?;

        let fractions = self
            .mesh_fractions
            .clone()
            .context(MissingConfigurationSnafu {
                what: "mesh interval fractions",
                action,
            })?;
        let points = self
            .mesh_points
            .clone()
            .context(MissingConfigurationSnafu {
                what: "mesh interval point counts",
                action,
            })?;
        let mesh = Mesh::new(fractions, points)?;
        self.scheme.validate_points(mesh.points())?;
        let disc = self.scheme.discretize(&mesh);
        let total_nodes = disc.total_nodes();

        let num_vars = 2 + (nx + nu) * total_nodes;
        let guess = match self.warm_start.take() {
            Some(warm) if warm.len() == num_vars => warm,
            Some(warm) => {
                warn!(
                    "phase {}: ignoring warm start of {} entries, expected {num_vars}",
                    self.index,
                    warm.len()
                );
                self.linear_guess(&disc, &x0_guess, &xf_guess, t0_guess, tf_guess, nu)
            }
            None => self.linear_guess(&disc, &x0_guess, &xf_guess, t0_guess, tf_guess, nu),
        };

        let info = evaluation::discover(
            func.as_ref(),
            self.index,
            nx,
            nu,
            &disc,
            &guess,
            (&state_lower, &state_upper),
            (&control_lower, &control_upper),
            self.time_span(),
        )?;
        if !info.analytic {
            warn!(
                "phase {}: path function provides no analytic jacobians, using central finite differences (slower and less accurate)",
                self.index
            );
        }

        let jac_pattern = evaluation::jacobian_pattern(&disc, &info, nx, nu);
        info!(
            "phase {} initialized with {} ({}): {} variables, {} constraints, {} jacobian non-zeros",
            self.index,
            mesh,
            self.scheme,
            num_vars,
            nx * disc.num_collocation_nodes() + info.num_algebraic * total_nodes,
            jac_pattern.nnz()
        );

        self.derived = Some(Derived {
            mesh,
            disc,
            info,
            jac_pattern,
            guess,
        });
        self.nodes.clear();
        self.nodes_have_jacobians = false;
        self.status = PhaseStatus::Initialized;
        Ok(())
    }

    fn sized(
        value: &Option<DVector<f64>>,
        name: &'static str,
        expected: usize,
        expected_name: &'static str,
    ) -> Result<DVector<f64>, ConfigError> {
        let vec = value.clone().context(MissingConfigurationSnafu {
            what: name,
            action: "initializing a phase",
        })?;
        ensure!(
            vec.len() == expected,
            SizeMismatchSnafu {
                left: name,
                left_len: vec.len(),
                right: expected_name,
                right_len: expected,
            }
        );
        Ok(vec)
    }

    fn linear_guess(
        &self,
        disc: &Discretization,
        x0: &DVector<f64>,
        xf: &DVector<f64>,
        t0: f64,
        tf: f64,
        nu: usize,
    ) -> DVector<f64> {
        let nx = x0.len();
        let mut guess = DVector::zeros(2 + (nx + nu) * disc.total_nodes());
        guess[0] = t0;
        guess[1] = tf;
        let control = match self.guess_mode {
            GuessMode::LinearNoControl => 0.0,
            GuessMode::LinearUnityControl => 1.0,
        };
        for (p, tau) in disc.taus.iter().enumerate() {
            let frac = 0.5 * (tau + 1.0);
            let offset = 2 + p * (nx + nu);
            for i in 0..nx {
                guess[offset + i] = x0[i] + (xf[i] - x0[i]) * frac;
            }
            for j in 0..nu {
                guess[offset + nx + j] = control;
            }
        }
        guess
    }

    /// Widest span of time allowed by the time bounds.
    fn time_span(&self) -> (f64, f64) {
        let (t0l, t0u) = self.initial_time_bounds.unwrap_or((0.0, 0.0));
        let (tfl, tfu) = self.final_time_bounds.unwrap_or((0.0, 0.0));
        (t0l.min(tfl), t0u.max(tfu))
    }

    fn derived(&self, action: &'static str) -> Result<&Derived, ConfigError> {
        self.derived.as_ref().context(NotInitializedSnafu {
            what: "phase",
            action,
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.derived.is_some()
    }

    pub fn num_states(&self) -> usize {
        self.num_states.unwrap_or(0)
    }

    pub fn num_controls(&self) -> usize {
        self.num_controls.unwrap_or(0)
    }

    /// Number of algebraic path constraints per node, known after initialization.
    pub fn num_algebraic(&self) -> usize {
        self.derived
            .as_ref()
            .map(|d| d.info.num_algebraic)
            .unwrap_or(0)
    }

    pub fn mesh(&self) -> Option<&Mesh> {
        self.derived.as_ref().map(|d| &d.mesh)
    }

    pub fn discretization(&self) -> Option<&Discretization> {
        self.derived.as_ref().map(|d| &d.disc)
    }

    pub fn scheme(&self) -> &Arc<dyn CollocationScheme> {
        &self.scheme
    }

    pub fn total_nodes(&self) -> usize {
        self.derived
            .as_ref()
            .map(|d| d.disc.total_nodes())
            .unwrap_or(0)
    }

    /// Length of the phase decision vector: `2 + (nx + nu) * total_nodes`.
    pub fn num_decision_variables(&self) -> usize {
        2 + (self.num_states() + self.num_controls()) * self.total_nodes()
    }

    /// Number of defect constraints followed by the path constraints.
    pub fn num_constraints(&self) -> usize {
        match self.derived.as_ref() {
            Some(d) => {
                self.num_states() * d.disc.num_collocation_nodes()
                    + d.info.num_algebraic * d.disc.total_nodes()
            }
            None => 0,
        }
    }

    /// Offset of the state of a node in the phase decision vector.
    pub fn state_offset(&self, node: usize) -> usize {
        2 + node * (self.num_states() + self.num_controls())
    }

    /// Offset of the control of a node in the phase decision vector.
    pub fn control_offset(&self, node: usize) -> usize {
        self.state_offset(node) + self.num_states()
    }

    /// Initial guess of the phase decision vector.
    pub fn initial_guess(&self) -> Result<&DVector<f64>, ConfigError> {
        Ok(&self.derived("building the initial guess")?.guess)
    }

    /// Lower and upper bounds of the phase decision vector.
    pub fn decision_bounds(&self) -> Result<(DVector<f64>, DVector<f64>), ConfigError> {
        let d = self.derived("building the decision vector bounds")?;
        let n = self.num_decision_variables();
        let (nx, nu) = (self.num_states(), self.num_controls());
        let mut lower = DVector::zeros(n);
        let mut upper = DVector::zeros(n);
        let (t0l, t0u) = self.initial_time_bounds.unwrap_or((0.0, 0.0));
        let (tfl, tfu) = self.final_time_bounds.unwrap_or((0.0, 0.0));
        lower[0] = t0l;
        upper[0] = t0u;
        lower[1] = tfl;
        upper[1] = tfu;
        let sl = self.state_lower.as_ref();
        let su = self.state_upper.as_ref();
        let cl = self.control_lower.as_ref();
        let cu = self.control_upper.as_ref();
        for p in 0..d.disc.total_nodes() {
            let so = self.state_offset(p);
            for i in 0..nx {
                lower[so + i] = sl.map(|v| v[i]).unwrap_or(f64::NEG_INFINITY);
                upper[so + i] = su.map(|v| v[i]).unwrap_or(f64::INFINITY);
            }
            for j in 0..nu {
                lower[so + nx + j] = cl.map(|v| v[j]).unwrap_or(f64::NEG_INFINITY);
                upper[so + nx + j] = cu.map(|v| v[j]).unwrap_or(f64::INFINITY);
            }
        }
        Ok((lower, upper))
    }

    /// Lower and upper bounds of the phase constraints: zero for the defects, the user bounds
    /// for the path constraints.
    pub fn constraint_bounds(&self) -> Result<(DVector<f64>, DVector<f64>), ConfigError> {
        let d = self.derived("building the constraint bounds")?;
        let m = self.num_constraints();
        let mut lower = DVector::zeros(m);
        let mut upper = DVector::zeros(m);
        let num_defects = self.num_states() * d.disc.num_collocation_nodes();
        let na = d.info.num_algebraic;
        for p in 0..d.disc.total_nodes() {
            for a in 0..na {
                lower[num_defects + p * na + a] = d.info.algebraic_lower[a];
                upper[num_defects + p * na + a] = d.info.algebraic_upper[a];
            }
        }
        Ok((lower, upper))
    }

    /// Cached Jacobian pattern, local to the phase decision vector and constraints.
    pub fn jacobian_pattern(&self) -> Result<&SparsityPattern, ConfigError> {
        Ok(&self.derived("querying the jacobian pattern")?.jac_pattern)
    }

    /// Sets of local decision indices whose second derivatives may be coupled, one per node.
    pub fn hessian_blocks(&self) -> Result<Vec<Vec<usize>>, ConfigError> {
        let d = self.derived("querying the hessian blocks")?;
        let (nx, nu) = (self.num_states(), self.num_controls());
        Ok((0..d.disc.total_nodes())
            .map(|p| {
                let so = self.state_offset(p);
                let mut block = vec![0, 1];
                block.extend(so..so + nx + nu);
                block
            })
            .collect())
    }

    /// Local indices of `[t0, tf, x_0, x_N]`, in the order of the point function endpoints.
    pub fn endpoint_columns(&self) -> Vec<usize> {
        let nx = self.num_states();
        let last = self.state_offset(self.total_nodes().saturating_sub(1));
        let mut cols = vec![0, 1];
        cols.extend(2..2 + nx);
        cols.extend(last..last + nx);
        cols
    }

    /// Time of a normalized time given the phase decision vector.
    pub fn node_time(x: &[f64], tau: f64) -> f64 {
        0.5 * (x[1] - x[0]) * tau + 0.5 * (x[1] + x[0])
    }

    /// Interpolates the states and the controls at a normalized time.
    ///
    /// Controls are only interpolated through the nodes where they enter the dynamics, so the
    /// free control of the final Radau node never leaks into the interior of the phase.
    pub fn interpolate(
        &self,
        x: &[f64],
        tau: f64,
    ) -> Result<(DVector<f64>, DVector<f64>), ConfigError> {
        let d = self.derived("interpolating the phase")?;
        let (nx, nu) = (self.num_states(), self.num_controls());
        ensure!(
            x.len() == self.num_decision_variables(),
            SizeMismatchSnafu {
                left: "phase decision vector",
                left_len: x.len(),
                right: "phase decision variables",
                right_len: self.num_decision_variables(),
            }
        );
        let block = &d.disc.intervals[d.disc.interval_of(tau)];
        let s = block.to_local(tau);
        let mut state = DVector::zeros(nx);
        let (first, basis) = block.rule.state_basis(s);
        for (j, b) in basis.iter().enumerate() {
            let so = self.state_offset(block.first_node + first + j);
            for i in 0..nx {
                state[i] += b * x[so + i];
            }
        }
        let mut control = DVector::zeros(nu);
        let (first, basis) = block.rule.control_basis(s);
        for (j, b) in basis.iter().enumerate() {
            let co = self.control_offset(block.first_node + first + j);
            for i in 0..nu {
                control[i] += b * x[co + i];
            }
        }
        Ok((state, control))
    }

    /// Interpolates a phase decision vector onto the nodes of another mesh of this phase.
    pub fn interpolate_onto(&self, x: &[f64], mesh: &Mesh) -> Result<DVector<f64>, ConfigError> {
        let disc = self.scheme.discretize(mesh);
        let (nx, nu) = (self.num_states(), self.num_controls());
        let mut out = DVector::zeros(2 + (nx + nu) * disc.total_nodes());
        for (p, tau) in disc.taus.iter().enumerate() {
            let (state, control) = self.interpolate(x, *tau)?;
            let offset = 2 + p * (nx + nu);
            out.rows_mut(offset, nx).copy_from(&state);
            out.rows_mut(offset + nx, nu).copy_from(&control);
        }
        // Sizes were checked by the interpolation.
        out[0] = x[0];
        out[1] = x[1];
        Ok(out)
    }

    /// Endpoints `[t0, tf, x_0, x_N]` of a phase decision vector.
    pub fn endpoints(&self, x: &[f64]) -> Result<PhaseEndpoints, ConfigError> {
        ensure!(
            x.len() == self.num_decision_variables(),
            SizeMismatchSnafu {
                left: "phase decision vector",
                left_len: x.len(),
                right: "phase decision variables",
                right_len: self.num_decision_variables(),
            }
        );
        let flat: Vec<f64> = self.endpoint_columns().iter().map(|c| x[*c]).collect();
        Ok(PhaseEndpoints::from_flat(&flat, self.num_states()))
    }

    /// Evaluates the path function at every node of the phase decision vector `x`.
    ///
    /// Nodes are evaluated in parallel; all of them are attempted before reporting a failure.
    pub fn evaluate(&mut self, x: &[f64], with_jacobians: bool) -> Result<(), EvaluationError> {
        let (nx, nu) = (self.num_states(), self.num_controls());
        let d = self
            .derived
            .as_ref()
            .context(crate::errors::UninitializedSnafu {
                action: "evaluating a phase",
            })?;
        let func = match self.path_function.as_ref() {
            Some(func) => func.clone(),
            None => {
                return crate::errors::UninitializedSnafu {
                    action: "evaluating a phase without path function",
                }
                .fail()
            }
        };
        ensure!(
            x.len() == self.num_decision_variables(),
            crate::errors::DecisionVectorSizeSnafu {
                expected: self.num_decision_variables(),
                actual: x.len(),
            }
        );
        let nodes = evaluation::evaluate_nodes(
            func.as_ref(),
            self.index,
            nx,
            nu,
            &d.disc,
            &d.info,
            x,
            with_jacobians,
        )?;
        self.nodes = nodes;
        self.nodes_have_jacobians = with_jacobians;
        self.status = PhaseStatus::Evaluating;
        Ok(())
    }

    /// Node evaluations of the last call to [`Phase::evaluate`].
    pub fn node_evaluations(&self) -> &[NodeEvaluation] {
        &self.nodes
    }

    fn evaluated(&self, with_jacobians: bool) -> Result<&Derived, EvaluationError> {
        let d = self
            .derived
            .as_ref()
            .context(crate::errors::UninitializedSnafu {
                action: "assembling a phase",
            })?;
        ensure!(
            self.nodes.len() == d.disc.total_nodes()
                && (!with_jacobians || self.nodes_have_jacobians),
            crate::errors::UninitializedSnafu {
                action: "assembling a phase before evaluating it",
            }
        );
        Ok(d)
    }

    /// Defects followed by the path constraints, from the last evaluation.
    pub fn constraint_values(&self, x: &[f64]) -> Result<DVector<f64>, EvaluationError> {
        let d = self.evaluated(false)?;
        Ok(evaluation::constraint_values(
            &d.disc,
            &d.info,
            &self.nodes,
            self.num_states(),
            self.num_controls(),
            x,
        ))
    }

    /// Quadrature of the cost integrand, from the last evaluation.
    pub fn cost(&self, x: &[f64]) -> Result<f64, EvaluationError> {
        let d = self.evaluated(false)?;
        Ok(evaluation::cost(&d.disc, &d.info, &self.nodes, x))
    }

    /// Dense gradient of the integrated cost with respect to the phase decision vector.
    pub fn cost_gradient(&self, x: &[f64]) -> Result<DVector<f64>, EvaluationError> {
        let d = self.evaluated(true)?;
        Ok(evaluation::cost_gradient(
            &d.disc,
            &d.info,
            &self.nodes,
            self.num_states(),
            self.num_controls(),
            x,
        ))
    }

    /// Jacobian values, in the order of [`Phase::jacobian_pattern`].
    pub fn jacobian_values(&self, x: &[f64]) -> Result<Vec<f64>, EvaluationError> {
        let d = self.evaluated(true)?;
        Ok(evaluation::jacobian_values(
            &d.disc,
            &d.info,
            &d.jac_pattern,
            &self.nodes,
            self.num_states(),
            self.num_controls(),
            x,
        ))
    }

    /// Evaluates the path function at an arbitrary point, e.g. between nodes.
    pub fn evaluate_point(
        &self,
        state: &[f64],
        control: &[f64],
        time: f64,
    ) -> Result<NodeEvaluation, EvaluationError> {
        let d = self
            .derived
            .as_ref()
            .context(crate::errors::UninitializedSnafu {
                action: "evaluating a phase",
            })?;
        let func = match self.path_function.as_ref() {
            Some(func) => func.clone(),
            None => {
                return crate::errors::UninitializedSnafu {
                    action: "evaluating a phase without path function",
                }
                .fail()
            }
        };
        let input = PathInput::new(state, control, time, self.index);
        evaluation::evaluate_node(func.as_ref(), &input, 0, &d.info, false)
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("index", &self.index)
            .field("scheme", &self.scheme)
            .field("status", &self.status)
            .field("num_states", &self.num_states)
            .field("num_controls", &self.num_controls)
            .field("orbit", &self.orbit)
            .field("mesh_fractions", &self.mesh_fractions)
            .field("mesh_points", &self.mesh_points)
            .finish()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase {} ({:?}", self.index, self.status)?;
        if let Some(mesh) = self.mesh() {
            write!(f, ", {mesh}")?;
        }
        if let Some(orbit) = &self.orbit {
            write!(f, ", {orbit}")?;
        }
        write!(f, ")")
    }
}

/// Matrix with the Jacobian pattern of a phase expanded to booleans, mostly useful for debugging.
pub fn pattern_to_dense(pattern: &SparsityPattern) -> DMatrix<bool> {
    let mut dense = DMatrix::from_element(pattern.nrows(), pattern.ncols(), false);
    for (r, c) in pattern.iter() {
        dense[(r, c)] = true;
    }
    dense
}

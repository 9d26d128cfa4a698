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

use crate::dynamics::{CartesianDynamics, ModEqDynamics, OrbitDynamics};
use crate::errors::{
    ConfigError, FailedSnafu, InvalidValueSnafu, MissingConfigurationSnafu, NotInitializedSnafu,
    OutOfDomainSnafu, SizeMismatchSnafu, UnsupportedOptionSnafu, UserFunctionError,
};
use crate::linalg::{Vector3, Vector6};
use crate::units::{UnitRegistry, STD_GRAVITY};
use crate::userfunc::{PathInput, PathOutput, UserPathFunction};
use enum_iterator::{all, Sequence};
use serde_derive::{Deserialize, Serialize};
use snafu::prelude::*;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Number of states of an orbit phase: six orbital elements and the mass.
pub const ORBIT_NUM_STATES: usize = 7;
/// Number of controls of an orbit phase: the three components of the thrust direction.
pub const ORBIT_NUM_CONTROLS: usize = 3;

fn supported<T: Sequence + fmt::Display>() -> String {
    all::<T>()
        .map(|v| format!("`{v}`"))
        .collect::<Vec<String>>()
        .join(", ")
}

/// Whether the engine may fire during the phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Sequence, Serialize, Deserialize)]
pub enum ThrustMode {
    Thrust,
    /// Zero thrust and zero mass flow whatever the controls. The control magnitude is also
    /// constrained to zero by the path constraint: both enforce the same coast.
    Coast,
}

impl fmt::Display for ThrustMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thrust => write!(f, "Thrust"),
            Self::Coast => write!(f, "Coast"),
        }
    }
}

impl FromStr for ThrustMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Thrust" => Ok(Self::Thrust),
            "Coast" => Ok(Self::Coast),
            _ => UnsupportedOptionSnafu {
                field: "thrust mode",
                value: s,
                supported: supported::<Self>(),
            }
            .fail(),
        }
    }
}

/// Orbital element set of the first six states.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Sequence, Serialize, Deserialize)]
pub enum StateRepresentation {
    /// Inertial position and velocity, in DU and VU.
    Cartesian,
    /// `[p, f, g, h, k, L]` with `p` in DU and `L` in radians.
    ModifiedEquinoctial,
}

impl fmt::Display for StateRepresentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cartesian => write!(f, "Cartesian"),
            Self::ModifiedEquinoctial => write!(f, "ModifiedEquinoctial"),
        }
    }
}

impl FromStr for StateRepresentation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Cartesian" => Ok(Self::Cartesian),
            "ModifiedEquinoctial" | "ModEquinoctial" => Ok(Self::ModifiedEquinoctial),
            _ => UnsupportedOptionSnafu {
                field: "state representation",
                value: s,
                supported: supported::<Self>(),
            }
            .fail(),
        }
    }
}

/// Meaning of the three controls.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Sequence, Serialize, Deserialize)]
pub enum ControlRepresentation {
    /// Thrust direction, constrained to unit norm when thrusting: the engine is always at full thrust.
    UnitVector,
    /// Thrust direction scaled by the throttle, its norm is constrained between 0 and 1.
    VectorMagnitude,
}

impl fmt::Display for ControlRepresentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnitVector => write!(f, "UnitVector"),
            Self::VectorMagnitude => write!(f, "VectorMagnitude"),
        }
    }
}

impl FromStr for ControlRepresentation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UnitVector" => Ok(Self::UnitVector),
            "VectorMagnitude" => Ok(Self::VectorMagnitude),
            _ => UnsupportedOptionSnafu {
                field: "control representation",
                value: s,
                supported: supported::<Self>(),
            }
            .fail(),
        }
    }
}

/// Built-in cost functions to minimize
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CostFunction {
    /// J = ∫ \vec{u}^T\vec{u} dt
    MinimumEnergy,
    /// J = ∫ |\vec{u}| dt -- Warning, this may lead to loads to bang-coast-bang solutions
    MinimumFuel,
}

/// Non-dimensional thrust and mass flow rate of a node.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ThrustOutput {
    /// Thrust force, in THRU, expressed in the frame of the dynamics.
    pub thrust: Vector3<f64>,
    /// Mass consumed per unit time, in MFU (non-negative).
    pub mass_flow: f64,
}

impl ThrustOutput {
    pub fn zero() -> Self {
        Self {
            thrust: Vector3::zeros(),
            mass_flow: 0.0,
        }
    }
}

/// Physical model of an orbit phase: scaling, representations and the propulsion system.
///
/// Representation tags are stored as provided and only validated by [`OrbitModel::initialize`],
/// the thrust mode, thrust and Isp are validated by their setters.
#[derive(Clone, Debug, PartialEq)]
pub struct OrbitModel {
    distance_unit_km: f64,
    mass_unit_kg: f64,
    mu_km3_s2: f64,
    state_rep_tag: String,
    control_rep_tag: String,
    thrust_mode: ThrustMode,
    available_thrust_n: Option<f64>,
    isp_s: Option<f64>,
    cost: Option<CostFunction>,
    units: Option<UnitRegistry>,
    state_rep: Option<StateRepresentation>,
    control_rep: Option<ControlRepresentation>,
}

impl OrbitModel {
    /// Builds a model scaled by the characteristic distance (km), mass (kg) and gravitational parameter (km^3/s^2).
    pub fn new(distance_unit_km: f64, mass_unit_kg: f64, mu_km3_s2: f64) -> Self {
        Self {
            distance_unit_km,
            mass_unit_kg,
            mu_km3_s2,
            state_rep_tag: StateRepresentation::ModifiedEquinoctial.to_string(),
            control_rep_tag: ControlRepresentation::UnitVector.to_string(),
            thrust_mode: ThrustMode::Thrust,
            available_thrust_n: None,
            isp_s: None,
            cost: None,
            units: None,
            state_rep: None,
            control_rep: None,
        }
    }

    fn reset(&mut self) {
        self.units = None;
        self.state_rep = None;
        self.control_rep = None;
    }

    pub fn set_state_representation(&mut self, tag: &str) {
        self.state_rep_tag = tag.to_string();
        self.reset();
    }

    pub fn set_control_representation(&mut self, tag: &str) {
        self.control_rep_tag = tag.to_string();
        self.reset();
    }

    /// Sets the thrust mode, which must be exactly "Thrust" or "Coast".
    pub fn set_thrust_mode(&mut self, mode: &str) -> Result<(), ConfigError> {
        self.thrust_mode = mode.parse()?;
        self.reset();
        Ok(())
    }

    /// Sets the available thrust in newtons, must be strictly positive.
    pub fn set_available_thrust(&mut self, thrust_n: f64) -> Result<(), ConfigError> {
        ensure!(
            thrust_n.is_finite() && thrust_n > 0.0,
            InvalidValueSnafu {
                field: "available thrust",
                value: format!("{thrust_n} N"),
                expected: "a strictly positive thrust",
            }
        );
        self.available_thrust_n = Some(thrust_n);
        self.reset();
        Ok(())
    }

    /// Sets the specific impulse in seconds, must be strictly positive.
    pub fn set_isp(&mut self, isp_s: f64) -> Result<(), ConfigError> {
        ensure!(
            isp_s.is_finite() && isp_s > 0.0,
            InvalidValueSnafu {
                field: "Isp",
                value: format!("{isp_s} s"),
                expected: "a strictly positive specific impulse",
            }
        );
        self.isp_s = Some(isp_s);
        self.reset();
        Ok(())
    }

    pub fn set_cost_function(&mut self, cost: Option<CostFunction>) {
        self.cost = cost;
    }

    /// Derives the unit registry and validates the representation tags.
    pub fn initialize(&mut self) -> Result<(), ConfigError> {
        let state_rep: StateRepresentation = self.state_rep_tag.parse()?;
        let control_rep: ControlRepresentation = self.control_rep_tag.parse()?;
        if self.thrust_mode == ThrustMode::Thrust {
            ensure!(
                self.available_thrust_n.is_some(),
                MissingConfigurationSnafu {
                    what: "available thrust",
                    action: "initializing a thrusting orbit phase",
                }
            );
            ensure!(
                self.isp_s.is_some(),
                MissingConfigurationSnafu {
                    what: "Isp",
                    action: "initializing a thrusting orbit phase",
                }
            );
        }
        let units = UnitRegistry::from_characteristics(
            self.distance_unit_km,
            self.mass_unit_kg,
            self.mu_km3_s2,
        )?;
        debug!("orbit model units\n{units}");
        self.units = Some(units);
        self.state_rep = Some(state_rep);
        self.control_rep = Some(control_rep);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.units.is_some()
    }

    pub fn units(&self) -> Option<&UnitRegistry> {
        self.units.as_ref()
    }

    pub fn thrust_mode(&self) -> ThrustMode {
        self.thrust_mode
    }

    pub fn state_representation(&self) -> Option<StateRepresentation> {
        self.state_rep
    }

    pub fn control_representation(&self) -> Option<ControlRepresentation> {
        self.control_rep
    }

    /// Computes the non-dimensional thrust and mass flow for the provided controls.
    ///
    /// A coasting model always returns zero thrust and zero mass flow.
    pub fn compute_thrust(&self, control: &[f64]) -> Result<ThrustOutput, ConfigError> {
        let units = self.units.as_ref().context(NotInitializedSnafu {
            what: "orbit model",
            action: "computing the thrust",
        })?;
        ensure!(
            control.len() == ORBIT_NUM_CONTROLS,
            SizeMismatchSnafu {
                left: "control vector",
                left_len: control.len(),
                right: "thrust direction",
                right_len: ORBIT_NUM_CONTROLS,
            }
        );
        if self.thrust_mode == ThrustMode::Coast {
            return Ok(ThrustOutput::zero());
        }
        let thrust_n = self.available_thrust_n.context(MissingConfigurationSnafu {
            what: "available thrust",
            action: "computing the thrust",
        })?;
        let isp_s = self.isp_s.context(MissingConfigurationSnafu {
            what: "Isp",
            action: "computing the thrust",
        })?;

        let direction = Vector3::from_column_slice(control);
        let throttle = match self.control_rep {
            Some(ControlRepresentation::VectorMagnitude) => direction.norm(),
            _ => 1.0,
        };
        let max_thrust = units.scale("THRU", thrust_n)?;
        let mass_flow_kg_s = throttle * thrust_n / (isp_s * STD_GRAVITY);
        Ok(ThrustOutput {
            thrust: max_thrust * direction,
            mass_flow: units.scale("MFU", mass_flow_kg_s)?,
        })
    }

    /// Bounds of the squared control magnitude path constraint.
    pub fn control_magnitude_bounds(&self) -> (f64, f64) {
        match (self.thrust_mode, self.control_rep) {
            (ThrustMode::Coast, _) => (0.0, 0.0),
            (ThrustMode::Thrust, Some(ControlRepresentation::VectorMagnitude)) => (0.0, 1.0),
            (ThrustMode::Thrust, _) => (1.0, 1.0),
        }
    }

    /// Builds the path function of this model, which must be initialized.
    pub fn path_function(&self) -> Result<OrbitPathFunction, ConfigError> {
        let state_rep = self.state_rep.context(NotInitializedSnafu {
            what: "orbit model",
            action: "building its path function",
        })?;
        let dynamics: Arc<dyn OrbitDynamics> = match state_rep {
            StateRepresentation::Cartesian => Arc::new(CartesianDynamics::canonical()),
            StateRepresentation::ModifiedEquinoctial => Arc::new(ModEqDynamics::canonical()),
        };
        Ok(OrbitPathFunction {
            model: self.clone(),
            dynamics,
        })
    }
}

impl fmt::Display for OrbitModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {} / {}",
            self.state_rep_tag, self.control_rep_tag, self.thrust_mode
        )?;
        if let (Some(thrust), Some(isp)) = (self.available_thrust_n, self.isp_s) {
            write!(f, " ({thrust} N, {isp} s)")?;
        }
        Ok(())
    }
}

/// Path function of an orbit phase, in canonical units (μ = 1).
///
/// States are the six elements of the representation and the mass (MU), controls are the thrust
/// direction expressed in the frame of the dynamics (RSW for modified equinoctial elements, inertial
/// for Cartesian). The single algebraic path constraint is the squared control magnitude.
#[derive(Clone, Debug)]
pub struct OrbitPathFunction {
    model: OrbitModel,
    dynamics: Arc<dyn OrbitDynamics>,
}

impl OrbitPathFunction {
    pub fn model(&self) -> &OrbitModel {
        &self.model
    }
}

impl UserPathFunction for OrbitPathFunction {
    fn evaluate_functions(
        &self,
        input: &PathInput,
        output: &mut PathOutput,
    ) -> Result<(), UserFunctionError> {
        let state = input.state();
        let control = input.control();
        ensure!(
            state.len() == ORBIT_NUM_STATES,
            FailedSnafu {
                msg: format!(
                    "orbit phase expects {ORBIT_NUM_STATES} states, got {}",
                    state.len()
                )
            }
        );
        let mass = state[6];
        ensure!(
            mass > 0.0,
            OutOfDomainSnafu {
                msg: format!("mass must be positive, got {mass}")
            }
        );
        if self.model.state_rep == Some(StateRepresentation::ModifiedEquinoctial) {
            ensure!(
                state[0] > 0.0,
                OutOfDomainSnafu {
                    msg: format!("semi-latus rectum must be positive, got {}", state[0])
                }
            );
        }

        let thrust = self
            .model
            .compute_thrust(control)
            .map_err(|e| FailedSnafu { msg: e.to_string() }.build())?;
        let accel = thrust.thrust / mass;
        let elements = Vector6::from_column_slice(&state[..6]);
        let rates = self.dynamics.compute_orbit_derivatives(&elements, &accel);

        let mut rhs = [0.0; ORBIT_NUM_STATES];
        rhs[..6].copy_from_slice(rates.as_slice());
        rhs[6] = -thrust.mass_flow;
        output.set_dynamics(&rhs);

        let u2: f64 = control.iter().map(|u| u * u).sum();
        let (lower, upper) = self.model.control_magnitude_bounds();
        output.set_algebraic(&[u2]);
        output.set_algebraic_bounds(&[lower], &[upper]);

        match self.model.cost {
            Some(CostFunction::MinimumEnergy) => output.set_cost(u2),
            Some(CostFunction::MinimumFuel) => output.set_cost(u2.sqrt()),
            None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod ut_orbit {
    use super::*;

    #[test]
    fn thrust_mode_parsing() {
        assert_eq!("Coast".parse::<ThrustMode>(), Ok(ThrustMode::Coast));
        let err = "Cruise".parse::<ThrustMode>().unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedOption { .. }));
        assert!(format!("{err}").contains("`Thrust`, `Coast`"));
    }

    #[test]
    fn representation_validated_at_initialize() {
        let mut model = OrbitModel::new(6378.1363, 1000.0, 398_600.4415);
        model.set_thrust_mode("Coast").unwrap();
        model.set_state_representation("Keplerian");
        assert!(matches!(
            model.initialize(),
            Err(ConfigError::UnsupportedOption { .. })
        ));
        model.set_state_representation("ModEquinoctial");
        model.initialize().unwrap();
        assert_eq!(
            model.state_representation(),
            Some(StateRepresentation::ModifiedEquinoctial)
        );
    }

    #[test]
    fn thrust_scaling() {
        let mut model = OrbitModel::new(6378.1363, 1000.0, 398_600.4415);
        assert!(model.set_available_thrust(0.0).is_err());
        assert!(model.set_isp(-1.0).is_err());
        model.set_available_thrust(1.0).unwrap();
        model.set_isp(3000.0).unwrap();
        assert!(model.compute_thrust(&[1.0, 0.0, 0.0]).is_err());
        model.initialize().unwrap();
        let out = model.compute_thrust(&[0.0, 1.0, 0.0]).unwrap();
        let units = model.units().unwrap();
        approx::assert_relative_eq!(
            units.unscale("THRU", out.thrust[1]).unwrap(),
            1.0,
            max_relative = 1e-12
        );
        approx::assert_relative_eq!(
            units.unscale("MFU", out.mass_flow).unwrap(),
            1.0 / (3000.0 * STD_GRAVITY),
            max_relative = 1e-12
        );
    }
}

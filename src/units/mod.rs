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

use crate::errors::{ConfigError, InvalidValueSnafu, UnknownUnitSnafu};
use serde_derive::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::BTreeMap;
use std::fmt;

/// Standard gravity in m/s^2, used to convert a specific impulse into an exhaust velocity.
pub const STD_GRAVITY: f64 = 9.80665;

/// A named unit: `scaled = (value - shift) / factor` and `value = scaled * factor + shift`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaleUnit {
    pub factor: f64,
    pub shift: f64,
}

impl ScaleUnit {
    pub fn scale(&self, value: f64) -> f64 {
        (value - self.shift) / self.factor
    }

    pub fn unscale(&self, scaled: f64) -> f64 {
        scaled * self.factor + self.shift
    }
}

/// Registry of the named units used to non-dimensionalize an orbit phase.
///
/// The canonical units are derived from a characteristic distance `DU` (km), a characteristic
/// mass `MU` (kg) and the gravitational parameter μ (km^3/s^2):
///
/// + `TU = sqrt(DU^3 / μ)` seconds
/// + `VU = DU / TU` km/s
/// + `ACCU = DU / TU^2` km/s^2
/// + `MFU = MU / TU` kg/s
/// + `THRU = MU * ACCU * 1000` newtons, with a zero shift
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitRegistry {
    units: BTreeMap<String, ScaleUnit>,
}

impl UnitRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the canonical registry from the characteristic distance, mass and gravitational parameter.
    pub fn from_characteristics(
        distance_km: f64,
        mass_kg: f64,
        mu_km3_s2: f64,
    ) -> Result<Self, ConfigError> {
        for (field, value) in [
            ("characteristic distance", distance_km),
            ("characteristic mass", mass_kg),
            ("gravitational parameter", mu_km3_s2),
        ] {
            ensure!(
                value.is_finite() && value > 0.0,
                InvalidValueSnafu {
                    field,
                    value: format!("{value}"),
                    expected: "a strictly positive finite number",
                }
            );
        }

        let tu = (distance_km.powi(3) / mu_km3_s2).sqrt();
        let vu = distance_km / tu;
        let accu = distance_km / tu.powi(2);
        let mfu = mass_kg / tu;

        let mut me = Self::new();
        me.add_unit("DU", distance_km, 0.0)?;
        me.add_unit("MU", mass_kg, 0.0)?;
        me.add_unit("TU", tu, 0.0)?;
        me.add_unit("VU", vu, 0.0)?;
        me.add_unit("ACCU", accu, 0.0)?;
        me.add_unit("MFU", mfu, 0.0)?;
        me.add_unit("THRU", mass_kg * accu * 1000.0, 0.0)?;
        Ok(me)
    }

    /// Adds (or replaces) a named unit with an explicit additive shift.
    pub fn add_unit(&mut self, name: &str, factor: f64, shift: f64) -> Result<(), ConfigError> {
        ensure!(
            factor.is_finite() && factor != 0.0,
            InvalidValueSnafu {
                field: "unit factor",
                value: format!("{name} = {factor}"),
                expected: "a finite non-zero factor",
            }
        );
        ensure!(
            shift.is_finite(),
            InvalidValueSnafu {
                field: "unit shift",
                value: format!("{name} = {shift}"),
                expected: "a finite shift",
            }
        );
        if self
            .units
            .insert(name.to_string(), ScaleUnit { factor, shift })
            .is_some()
        {
            debug!("replaced unit {name}");
        }
        Ok(())
    }

    pub fn unit(&self, name: &str) -> Result<ScaleUnit, ConfigError> {
        self.units
            .get(name)
            .copied()
            .context(UnknownUnitSnafu { name })
    }

    /// Returns the multiplicative factor of that unit.
    pub fn factor(&self, name: &str) -> Result<f64, ConfigError> {
        Ok(self.unit(name)?.factor)
    }

    /// Non-dimensionalizes a value expressed in the physical unit behind `name`.
    pub fn scale(&self, name: &str, value: f64) -> Result<f64, ConfigError> {
        Ok(self.unit(name)?.scale(value))
    }

    /// Re-dimensionalizes a value.
    pub fn unscale(&self, name: &str, scaled: f64) -> Result<f64, ConfigError> {
        Ok(self.unit(name)?.unscale(scaled))
    }

    /// Scales each value with the unit of the same index.
    pub fn scale_all(&self, names: &[&str], values: &[f64]) -> Result<Vec<f64>, ConfigError> {
        ensure!(
            names.len() == values.len(),
            crate::errors::SizeMismatchSnafu {
                left: "unit names",
                left_len: names.len(),
                right: "values",
                right_len: values.len(),
            }
        );
        names
            .iter()
            .zip(values)
            .map(|(name, value)| self.scale(name, *value))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl fmt::Display for UnitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, unit) in &self.units {
            if unit.shift == 0.0 {
                writeln!(f, "{name:>5} = {:e}", unit.factor)?;
            } else {
                writeln!(f, "{name:>5} = {:e} (shift {:e})", unit.factor, unit.shift)?;
            }
        }
        Ok(())
    }
}

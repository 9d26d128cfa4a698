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

use crate::errors::{ConfigError, InvalidMeshSnafu, SizeMismatchSnafu};
use serde_derive::{Deserialize, Serialize};
use snafu::ensure;
use std::fmt;

/// Tolerance on the end points of the normalized time span.
const ENDPOINT_TOL: f64 = 1e-12;

/// Checks that the interval fractions are strictly increasing from -1 to 1.
pub fn validate_fractions(fractions: &[f64]) -> Result<(), ConfigError> {
    ensure!(
        fractions.len() >= 2,
        InvalidMeshSnafu {
            reason: format!(
                "at least two interval fractions are needed, got {}",
                fractions.len()
            )
        }
    );
    ensure!(
        fractions.iter().all(|f| f.is_finite()),
        InvalidMeshSnafu {
            reason: format!("interval fractions must be finite, got {fractions:?}")
        }
    );
    ensure!(
        (fractions[0] + 1.0).abs() <= ENDPOINT_TOL,
        InvalidMeshSnafu {
            reason: format!("first interval fraction must be -1, got {}", fractions[0])
        }
    );
    let last = fractions[fractions.len() - 1];
    ensure!(
        (last - 1.0).abs() <= ENDPOINT_TOL,
        InvalidMeshSnafu {
            reason: format!("last interval fraction must be 1, got {last}")
        }
    );
    for (i, pair) in fractions.windows(2).enumerate() {
        ensure!(
            pair[1] > pair[0],
            InvalidMeshSnafu {
                reason: format!(
                    "interval fractions must be strictly increasing, but fraction {} = {} and fraction {} = {}",
                    i,
                    pair[0],
                    i + 1,
                    pair[1]
                )
            }
        );
    }
    Ok(())
}

/// Checks that each interval has at least two collocation points.
pub fn validate_points(points: &[usize]) -> Result<(), ConfigError> {
    ensure!(
        !points.is_empty(),
        InvalidMeshSnafu {
            reason: "at least one interval is needed"
        }
    );
    for (i, n) in points.iter().enumerate() {
        ensure!(
            *n >= 2,
            InvalidMeshSnafu {
                reason: format!("interval {i} has {n} points but at least 2 are needed")
            }
        );
    }
    Ok(())
}

/// Mesh of one phase, in normalized time `τ ∈ [-1, 1]`.
///
/// Interval `k` spans `[fractions[k], fractions[k + 1]]` and carries `points[k]` collocation points.
/// The final mesh point (τ = 1) is a node without collocation, hence the phase has
/// `sum(points) + 1` nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    fractions: Vec<f64>,
    points: Vec<usize>,
}

impl Mesh {
    pub fn new(mut fractions: Vec<f64>, points: Vec<usize>) -> Result<Self, ConfigError> {
        validate_fractions(&fractions)?;
        validate_points(&points)?;
        ensure!(
            points.len() + 1 == fractions.len(),
            SizeMismatchSnafu {
                left: "mesh interval fractions",
                left_len: fractions.len(),
                right: "mesh interval point counts (plus one)",
                right_len: points.len() + 1,
            }
        );
        // Snap the end points, the tolerance only absorbs user rounding.
        let last = fractions.len() - 1;
        fractions[0] = -1.0;
        fractions[last] = 1.0;
        Ok(Self { fractions, points })
    }

    /// Equally spaced intervals with the same number of points.
    pub fn uniform(num_intervals: usize, points: usize) -> Result<Self, ConfigError> {
        ensure!(
            num_intervals > 0,
            InvalidMeshSnafu {
                reason: "at least one interval is needed"
            }
        );
        let fractions = (0..=num_intervals)
            .map(|k| -1.0 + 2.0 * (k as f64) / (num_intervals as f64))
            .collect();
        Self::new(fractions, vec![points; num_intervals])
    }

    pub fn fractions(&self) -> &[f64] {
        &self.fractions
    }

    pub fn points(&self) -> &[usize] {
        &self.points
    }

    pub fn num_intervals(&self) -> usize {
        self.points.len()
    }

    /// Number of nodes where the dynamics are collocated.
    pub fn num_collocation_nodes(&self) -> usize {
        self.points.iter().sum()
    }

    /// Number of nodes carrying a state and a control, including the final one.
    pub fn total_nodes(&self) -> usize {
        self.num_collocation_nodes() + 1
    }
}

impl fmt::Display for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} intervals, {} nodes, points {:?}",
            self.num_intervals(),
            self.total_nodes(),
            self.points
        )
    }
}

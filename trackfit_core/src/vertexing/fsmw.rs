//! Fraction-sample-mode with weights (FSMW) estimator of a 1D mode.
//!
//! The sorted sample is repeatedly narrowed to the window holding a fixed
//! fraction of the points with the smallest extent per unit weight, until
//! at most three points are left.

use serde::{Deserialize, Serialize};

use super::error::VertexingError;

/// Configuration for the [`FsmwMode1dFinder`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsmwConfig {
    /// Share of the points kept by the first narrowing (default: 0.5)
    pub first_fraction: f64,

    /// Share kept by every later narrowing (default: 0.5)
    pub fraction: f64,
}

impl Default for FsmwConfig {
    fn default() -> Self {
        Self {
            first_fraction: 0.5,
            fraction: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FsmwMode1dFinder {
    config: FsmwConfig,
}

impl FsmwMode1dFinder {
    /// # Errors
    /// [`VertexingError::InvalidInput`] if a fraction is outside (0, 1].
    pub fn new(config: FsmwConfig) -> Result<Self, VertexingError> {
        let valid = |f: f64| f > 0.0 && f <= 1.0;
        if !valid(config.first_fraction) || !valid(config.fraction) {
            return Err(VertexingError::InvalidInput);
        }
        Ok(Self { config })
    }

    /// Mode of weighted `(value, weight)` points.
    ///
    /// # Errors
    /// [`VertexingError::EmptyInput`] for an empty sample.
    pub fn get_mode(&self, points: &[(f64, f64)]) -> Result<f64, VertexingError> {
        match points {
            [] => return Err(VertexingError::EmptyInput),
            [(value, _)] => return Ok(*value),
            _ => {}
        }

        let mut sorted = points.to_vec();
        sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut window: &[(f64, f64)] = &sorted;
        let mut fraction = self.config.first_fraction;

        while window.len() > 3 {
            let n = window.len();
            let size = ((fraction * n as f64).floor() as usize).clamp(2, n - 1);
            let mut best_start = 0;
            let mut best_density = f64::INFINITY;
            for start in 0..=(n - size) {
                let slice = &window[start..start + size];
                let weight: f64 = slice.iter().map(|p| p.1).sum();
                let extent = slice[size - 1].0 - slice[0].0;
                let density = if weight > 0.0 {
                    extent / weight
                } else {
                    f64::INFINITY
                };
                if density < best_density {
                    best_density = density;
                    best_start = start;
                }
            }
            window = &window[best_start..best_start + size];
            fraction = self.config.fraction;
        }

        if let [a, b, c] = window {
            let lower = (b.0 - a.0) / (a.1 + b.1);
            let upper = (c.0 - b.0) / (b.1 + c.1);
            return Ok(if lower < upper {
                0.5 * (a.0 + b.0)
            } else if upper < lower {
                0.5 * (b.0 + c.0)
            } else {
                b.0
            });
        }
        Ok(0.5 * (window[0].0 + window[window.len() - 1].0))
    }
}

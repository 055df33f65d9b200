//! Deterministic annealing of track-to-vertex weights.
//!
//! A track's weight at a vertex is its Gaussian compatibility at the current
//! temperature, normalized against its compatibilities with the competing
//! vertices and a cut-off term:
//!
//! ```text
//! w = exp(-χ²/2T) / (exp(-χ²_cut/2T) + Σ_k exp(-χ²_k/2T))
//! ```
//!
//! The temperature walks down a fixed schedule; the state lives in
//! [`AnnealingState`] so one utility serves any number of fits.

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::error::VertexingError;

/// Configuration for the [`AnnealingUtility`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnealingConfig {
    /// Chi2 at which a track is equally likely to belong to the vertex or
    /// to nothing (default: 9)
    pub cut_off: f64,

    /// Temperature schedule, last entry is equilibrium
    /// (default: [64, 16, 4, 2, 1.5, 1])
    pub temperatures: Vec<f64>,
}

impl Default for AnnealingConfig {
    fn default() -> Self {
        Self {
            cut_off: 9.0,
            temperatures: vec![64.0, 16.0, 4.0, 2.0, 1.5, 1.0],
        }
    }
}

/// Position in the temperature schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnealingState {
    pub current_temperature_index: usize,
    pub equilibrium_reached: bool,
}

#[derive(Debug, Clone)]
pub struct AnnealingUtility {
    config: AnnealingConfig,
}

impl AnnealingUtility {
    /// # Errors
    /// [`VertexingError::InvalidInput`] for an empty schedule or a
    /// non-positive temperature.
    pub fn new(config: AnnealingConfig) -> Result<Self, VertexingError> {
        if config.temperatures.is_empty() || config.temperatures.iter().any(|t| *t <= 0.0) {
            return Err(VertexingError::InvalidInput);
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &AnnealingConfig {
        &self.config
    }

    pub fn current_temperature(&self, state: &AnnealingState) -> f64 {
        let last = self.config.temperatures.len() - 1;
        self.config.temperatures[state.current_temperature_index.min(last)]
    }

    /// Steps the temperature down; at the last entry equilibrium is reached.
    pub fn anneal(&self, state: &mut AnnealingState) {
        if state.current_temperature_index + 1 < self.config.temperatures.len() {
            state.current_temperature_index += 1;
        } else {
            state.equilibrium_reached = true;
        }
        trace!(
            "Annealing temperature {} (equilibrium: {})",
            self.current_temperature(state),
            state.equilibrium_reached
        );
    }

    /// Weight of a track with compatibility `chi2` at one vertex, given its
    /// compatibilities with all vertices competing for it (including this
    /// one).
    pub fn weight(&self, state: &AnnealingState, chi2: f64, all_chi2: &[f64]) -> f64 {
        let temperature = self.current_temperature(state);
        let denominator = gauss(self.config.cut_off, temperature)
            + all_chi2.iter().map(|c| gauss(*c, temperature)).sum::<f64>();
        gauss(chi2, temperature) / denominator
    }

    /// Weight of a track competing with nothing but the cut-off.
    pub fn single_weight(&self, state: &AnnealingState, chi2: f64) -> f64 {
        let temperature = self.current_temperature(state);
        let g = gauss(chi2, temperature);
        g / (gauss(self.config.cut_off, temperature) + g)
    }
}

fn gauss(chi2: f64, temperature: f64) -> f64 {
    (-chi2 / (2.0 * temperature)).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn utility() -> AnnealingUtility {
        AnnealingUtility::new(AnnealingConfig::default()).unwrap()
    }

    #[test]
    fn test_schedule_reaches_equilibrium() {
        let util = utility();
        let mut state = AnnealingState::default();
        assert_relative_eq!(util.current_temperature(&state), 64.0);
        for _ in 0..5 {
            assert!(!state.equilibrium_reached);
            util.anneal(&mut state);
        }
        assert_relative_eq!(util.current_temperature(&state), 1.0);
        assert!(!state.equilibrium_reached);
        util.anneal(&mut state);
        assert!(state.equilibrium_reached);
        assert_eq!(state.current_temperature_index, 5);
    }

    #[test]
    fn test_weight_at_cut_off_is_half() {
        let util = utility();
        let mut state = AnnealingState::default();
        for _ in 0..6 {
            assert_relative_eq!(util.single_weight(&state, 9.0), 0.5, epsilon = 1e-12);
            util.anneal(&mut state);
        }
    }

    #[test]
    fn test_competing_vertices_share_the_track() {
        let util = utility();
        let state = AnnealingState {
            current_temperature_index: 5,
            equilibrium_reached: true,
        };
        let all = [1.0, 1.0];
        let w = util.weight(&state, 1.0, &all);
        assert!(w < 0.5);
        assert_relative_eq!(2.0 * w + gauss(9.0, 1.0) * w / gauss(1.0, 1.0), 1.0, epsilon = 1e-12);

        // An incompatible competitor hardly matters
        let lone = util.single_weight(&state, 1.0);
        assert_relative_eq!(util.weight(&state, 1.0, &[1.0, 200.0]), lone, epsilon = 1e-12);
    }

    #[test]
    fn test_cooling_sharpens_weights() {
        let util = utility();
        let hot = AnnealingState::default();
        let cold = AnnealingState {
            current_temperature_index: 5,
            equilibrium_reached: false,
        };
        assert!(util.single_weight(&cold, 2.0) > util.single_weight(&hot, 2.0));
        assert!(util.single_weight(&cold, 20.0) < util.single_weight(&hot, 20.0));
    }

    #[test]
    fn test_rejects_empty_schedule() {
        let config = AnnealingConfig {
            temperatures: Vec::new(),
            ..AnnealingConfig::default()
        };
        assert_eq!(
            AnnealingUtility::new(config).unwrap_err(),
            VertexingError::InvalidInput
        );
    }
}

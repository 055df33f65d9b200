//! Vertex seeding from the mode of the track z0 distribution.
//!
//! - **z0**: taken relative to the beam constraint when one takes part in
//!   the fit, else the z of the track's reference point
//! - **Weights**: a logistic cut on the transverse IP chi2 and an optional
//!   (log) transverse momentum factor
//! - **Mode**: [`FsmwMode1dFinder`] over the weighted z0 values

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::error::VertexingError;
use super::fsmw::{FsmwConfig, FsmwMode1dFinder};
use super::impact_point::ImpactPointEstimator;
use super::vertex::{Vertex, VertexingOptions};
use crate::track_parameters::BoundTrackParameters;

/// Proposes vertex positions from a pool of tracks.
pub trait VertexSeedFinder: Send + Sync {
    /// Seeds for `tracks`; an empty result means no seed could be formed.
    fn find(
        &self,
        tracks: &[BoundTrackParameters],
        options: &VertexingOptions,
    ) -> Result<Vec<Vertex>, VertexingError>;
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the [`ZScanVertexFinder`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZScanConfig {
    /// Give every track unit IP weight (default: false)
    pub disable_all_weights: bool,

    /// IP chi2 at which the logistic weight is one half (default: 9)
    pub constraint_cutoff: f64,

    /// Width of the logistic weight (default: 1)
    pub constraint_temp: f64,

    /// Multiply by ln(pT / min_pt) (default: true)
    pub use_log_pt: bool,

    /// Multiply by pT^exp_pt; takes precedence over `use_log_pt`
    /// (default: false)
    pub use_pt: bool,

    /// Below this pT the log weight is zero (default: 0.4 GeV)
    pub min_pt: f64,

    /// Exponent for `use_pt` (default: 1)
    pub exp_pt: f64,

    /// Points below this weight are dropped (default: 0.01)
    pub min_weight: f64,

    pub fsmw: FsmwConfig,
}

impl Default for ZScanConfig {
    fn default() -> Self {
        Self {
            disable_all_weights: false,
            constraint_cutoff: 9.0,
            constraint_temp: 1.0,
            use_log_pt: true,
            use_pt: false,
            min_pt: 0.4,
            exp_pt: 1.0,
            min_weight: 0.01,
            fsmw: FsmwConfig::default(),
        }
    }
}

// ============================================================================
// FINDER
// ============================================================================

#[derive(Debug, Clone)]
pub struct ZScanVertexFinder {
    config: ZScanConfig,
    ip_estimator: ImpactPointEstimator,
    mode_finder: FsmwMode1dFinder,
}

impl ZScanVertexFinder {
    /// # Errors
    /// [`VertexingError::InvalidInput`] for a non-positive temperature or
    /// minimum pT, or invalid FSMW fractions.
    pub fn new(config: ZScanConfig, ip_estimator: ImpactPointEstimator) -> Result<Self, VertexingError> {
        if config.constraint_temp <= 0.0 || config.min_pt <= 0.0 {
            return Err(VertexingError::InvalidInput);
        }
        let mode_finder = FsmwMode1dFinder::new(config.fsmw.clone())?;
        Ok(Self {
            config,
            ip_estimator,
            mode_finder,
        })
    }

    pub fn config(&self) -> &ZScanConfig {
        &self.config
    }

    /// z0 and weight of one track.
    fn z0_and_weight(&self, params: &BoundTrackParameters, options: &VertexingOptions) -> (f64, f64) {
        let constraint = &options.constraint;
        let (z0, mut weight) = if options.use_constraint_in_fit && constraint.covariance[(0, 0)] != 0.0 {
            match self.ip_estimator.impact_parameters_and_sigma(
                &options.geometry_context,
                &options.magnetic_field_context,
                params,
                constraint,
                false,
            ) {
                Ok(ip) => {
                    let chi2 = (ip.d0 / ip.sigma_d0).powi(2);
                    let mut weight = 1.0;
                    if !self.config.disable_all_weights {
                        weight = 1.0
                            / (1.0 + ((chi2 - self.config.constraint_cutoff) / self.config.constraint_temp).exp());
                        if !weight.is_normal() {
                            weight = 0.0;
                        }
                    }
                    (ip.z0 + constraint.position.z, weight)
                }
                Err(e) => {
                    debug!("Impact parameters unavailable ({}), using the track z", e);
                    (params.position(&options.geometry_context).z, 1.0)
                }
            }
        } else {
            (params.position(&options.geometry_context).z, 1.0)
        };

        let pt = params.qop().recip().abs() * params.theta().sin();
        if self.config.use_pt {
            weight *= pt.powf(self.config.exp_pt);
        } else if self.config.use_log_pt {
            weight *= if pt >= self.config.min_pt {
                (pt / self.config.min_pt).ln()
            } else {
                0.0
            };
        }
        (z0, weight)
    }
}

impl VertexSeedFinder for ZScanVertexFinder {
    fn find(
        &self,
        tracks: &[BoundTrackParameters],
        options: &VertexingOptions,
    ) -> Result<Vec<Vertex>, VertexingError> {
        let points: Vec<(f64, f64)> = tracks
            .iter()
            .map(|params| self.z0_and_weight(params, options))
            .filter(|(_, weight)| *weight >= self.config.min_weight)
            .collect();
        trace!("Z scan over {} of {} tracks", points.len(), tracks.len());
        if points.is_empty() {
            return Ok(Vec::new());
        }

        let z = self
            .mode_finder
            .get_mode(&points)
            .map_err(|_| VertexingError::SeedingError)?;
        let mut position = options.constraint.position;
        position.z = z;
        debug!("Z scan seed at z = {:.3} mm", z);
        Ok(vec![Vertex::new(position)])
    }
}

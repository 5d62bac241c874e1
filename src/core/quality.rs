//! Quality assessment of the inverted time series.
//!
//! Temporal coherence per pixel, threshold gating, and the per-epoch
//! residual RMS used for reference-epoch selection.

use crate::core::epochs::EpochRegistry;
use crate::types::{InsarError, InsarResult, PixelStatus};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array2, Array3, Axis};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

/// Normalised magnitude of the complex sum of unit-phase residuals
///
/// NaN residuals (invalid observations) are skipped; returns NaN when no
/// residual is finite.
pub fn temporal_coherence(residuals: &[f64]) -> f64 {
    let mut sum = Complex64::new(0.0, 0.0);
    let mut count = 0usize;
    for &r in residuals.iter().filter(|r| r.is_finite()) {
        sum += Complex64::from_polar(1.0, r);
        count += 1;
    }
    if count == 0 {
        return f64::NAN;
    }
    (sum.norm() / count as f64).min(1.0)
}

/// Polynomial surface removed before the per-epoch RMS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RampType {
    None,
    /// a + b*x + c*y
    Plane,
    /// a + b*x + c*y + d*x^2 + e*y^2 + f*x*y
    Quadratic,
}

impl RampType {
    pub fn from_name(name: &str) -> InsarResult<Self> {
        match name.trim().to_lowercase().as_str() {
            "no" | "none" => Ok(RampType::None),
            "plane" | "linear" => Ok(RampType::Plane),
            "quadratic" | "auto" => Ok(RampType::Quadratic),
            other => Err(InsarError::Configuration(format!(
                "Unknown ramp type: {} (expected no, plane or quadratic)",
                other
            ))),
        }
    }

    fn num_terms(&self) -> usize {
        match self {
            RampType::None => 1,
            RampType::Plane => 3,
            RampType::Quadratic => 6,
        }
    }

    fn terms(&self, x: f64, y: f64, out: &mut [f64]) {
        out[0] = 1.0;
        if *self == RampType::None {
            return;
        }
        out[1] = x;
        out[2] = y;
        if *self == RampType::Quadratic {
            out[3] = x * x;
            out[4] = y * y;
            out[5] = x * y;
        }
    }
}

/// Quality gating parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityParams {
    /// Pixels below this temporal coherence are not trustworthy
    pub min_temporal_coherence: f64,
    /// Minimum number of trustworthy pixels for the run to continue
    pub min_num_pixel: usize,
    /// Ramp removed from each epoch's residual before the RMS
    pub ramp: RampType,
    /// Epochs above this RMS are reported as exclusion candidates
    pub rms_threshold: Option<f64>,
}

impl Default for QualityParams {
    fn default() -> Self {
        Self {
            min_temporal_coherence: 0.7,
            min_num_pixel: 100,
            ramp: RampType::None,
            rms_threshold: None,
        }
    }
}

impl QualityParams {
    pub fn validate(&self) -> InsarResult<()> {
        if !(0.0..=1.0).contains(&self.min_temporal_coherence) {
            return Err(InsarError::Configuration(format!(
                "networkInversion.minTempCoh must be within [0, 1], got {}",
                self.min_temporal_coherence
            )));
        }
        if let Some(threshold) = self.rms_threshold {
            if !(threshold > 0.0) {
                return Err(InsarError::Configuration(format!(
                    "residualRms.threshold must be positive, got {}",
                    threshold
                )));
            }
        }
        Ok(())
    }
}

/// Quality estimator
pub struct QualityEstimator {
    params: QualityParams,
}

impl QualityEstimator {
    /// Create a new quality estimator with default parameters
    pub fn new() -> Self {
        Self {
            params: QualityParams::default(),
        }
    }

    /// Create a quality estimator with custom parameters
    pub fn with_params(params: QualityParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &QualityParams {
        &self.params
    }

    /// Demote inverted pixels below the threshold; estimates are kept.
    /// Returns the number of trustworthy pixels.
    pub fn apply_threshold(
        &self,
        temporal_coherence: &Array2<f32>,
        status: &mut Array2<PixelStatus>,
    ) -> InsarResult<usize> {
        if temporal_coherence.dim() != status.dim() {
            return Err(InsarError::InvalidFormat(format!(
                "Temporal coherence shape {:?} does not match status shape {:?}",
                temporal_coherence.dim(),
                status.dim()
            )));
        }

        let threshold = self.params.min_temporal_coherence;
        let mut trusted = 0usize;
        ndarray::Zip::from(status)
            .and(temporal_coherence)
            .for_each(|s, &coh| {
                if !s.has_estimate() {
                    return;
                }
                if (coh as f64) >= threshold {
                    *s = PixelStatus::Valid;
                    trusted += 1;
                } else {
                    *s = PixelStatus::BelowCoherenceThreshold;
                }
            });

        log::info!(
            "{} pixels with temporal coherence >= {}",
            trusted,
            threshold
        );
        Ok(trusted)
    }

    /// Fail the run when too few pixels are trustworthy
    pub fn check_min_num_pixel(&self, trusted: usize) -> InsarResult<()> {
        if trusted < self.params.min_num_pixel {
            return Err(InsarError::InsufficientCoherentPixels {
                found: trusted,
                required: self.params.min_num_pixel,
            });
        }
        Ok(())
    }

    /// RMS of each epoch's residual layer over trustworthy pixels,
    /// after removing the configured ramp. NaN where nothing contributes.
    pub fn epoch_residual_rms(
        &self,
        epoch_residual: &Array3<f32>,
        status: &Array2<PixelStatus>,
    ) -> InsarResult<Vec<f64>> {
        let (num_epochs, rows, cols) = epoch_residual.dim();
        if (rows, cols) != status.dim() {
            return Err(InsarError::InvalidFormat(format!(
                "Residual stack grid {:?} does not match status shape {:?}",
                (rows, cols),
                status.dim()
            )));
        }

        let mut rms = Vec::with_capacity(num_epochs);
        for layer in epoch_residual.axis_iter(Axis(0)) {
            let samples: Vec<(usize, usize, f64)> = layer
                .indexed_iter()
                .filter(|&((r, c), v)| status[[r, c]] == PixelStatus::Valid && v.is_finite())
                .map(|((r, c), &v)| (r, c, v as f64))
                .collect();

            if samples.is_empty() {
                rms.push(f64::NAN);
                continue;
            }

            let values = match self.params.ramp {
                RampType::None => samples.iter().map(|s| s.2).collect(),
                ramp => remove_ramp(&samples, ramp, rows, cols),
            };
            let sum_sq: f64 = values.iter().map(|v| v * v).sum();
            rms.push((sum_sq / values.len() as f64).sqrt());
        }

        log::debug!("Per-epoch residual RMS: {:?}", rms);
        Ok(rms)
    }

    /// Labels of active epochs whose residual RMS exceeds the threshold
    pub fn exclude_date_candidates(&self, rms: &[f64], epochs: &EpochRegistry) -> Vec<String> {
        let Some(threshold) = self.params.rms_threshold else {
            return Vec::new();
        };
        let candidates: Vec<String> = epochs
            .active_indices()
            .into_iter()
            .filter(|&e| rms.get(e).map_or(false, |&v| v > threshold))
            .map(|e| epochs.epochs()[e].label())
            .collect();
        if !candidates.is_empty() {
            log::warn!(
                "Epochs with residual RMS above {}: {}",
                threshold,
                candidates.join(", ")
            );
        }
        candidates
    }
}

impl Default for QualityEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of the smallest finite RMS among the given epochs
pub fn min_rms_epoch(rms: &[f64], candidates: &[usize]) -> Option<usize> {
    candidates
        .iter()
        .copied()
        .filter(|&e| rms.get(e).map_or(false, |v| v.is_finite()))
        .min_by(|&a, &b| rms[a].total_cmp(&rms[b]))
}

/// Least-squares polynomial surface fit, returns the detrended values
fn remove_ramp(samples: &[(usize, usize, f64)], ramp: RampType, rows: usize, cols: usize) -> Vec<f64> {
    let n = ramp.num_terms();
    let originals: Vec<f64> = samples.iter().map(|s| s.2).collect();
    if samples.len() <= n {
        return originals;
    }

    let scale_x = cols.max(1) as f64;
    let scale_y = rows.max(1) as f64;
    let mut normal = DMatrix::<f64>::zeros(n, n);
    let mut rhs = DVector::<f64>::zeros(n);
    let mut terms = vec![0.0; n];

    for &(r, c, v) in samples {
        ramp.terms(c as f64 / scale_x, r as f64 / scale_y, &mut terms);
        for i in 0..n {
            rhs[i] += terms[i] * v;
            for j in 0..n {
                normal[(i, j)] += terms[i] * terms[j];
            }
        }
    }

    let Some(coeffs) = normal.cholesky().map(|chol| chol.solve(&rhs)) else {
        log::warn!("Ramp fit is singular, residual RMS computed without deramping");
        return originals;
    };

    samples
        .iter()
        .map(|&(r, c, v)| {
            ramp.terms(c as f64 / scale_x, r as f64 / scale_y, &mut terms);
            let model: f64 = terms.iter().zip(coeffs.iter()).map(|(t, k)| t * k).sum();
            v - model
        })
        .collect()
}

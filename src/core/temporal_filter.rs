use crate::types::{InsarError, InsarResult};
use ndarray::{Array3, Axis};
use serde::{Deserialize, Serialize};

/// Temporal smoothing parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalFilterParams {
    /// Gaussian sigma in years
    pub time_window: f64,
}

impl Default for TemporalFilterParams {
    fn default() -> Self {
        Self { time_window: 0.3 }
    }
}

impl TemporalFilterParams {
    pub fn validate(&self) -> InsarResult<()> {
        if !(self.time_window > 0.0) {
            return Err(InsarError::Configuration(format!(
                "Temporal filter time window must be positive, got {}",
                self.time_window
            )));
        }
        Ok(())
    }
}

/// Gaussian low-pass filter along the time axis
pub struct TemporalFilter {
    params: TemporalFilterParams,
}

impl TemporalFilter {
    /// Create a new temporal filter with default parameters
    pub fn new() -> Self {
        Self {
            params: TemporalFilterParams::default(),
        }
    }

    /// Create a temporal filter with custom parameters
    pub fn with_params(params: TemporalFilterParams) -> Self {
        Self { params }
    }

    /// Normalised Gaussian kernel over the active epochs, one row per active epoch
    fn kernel(&self, years: &[f64], active: &[usize]) -> Vec<Vec<f64>> {
        let sigma = self.params.time_window;
        active
            .iter()
            .map(|&i| {
                let row: Vec<f64> = active
                    .iter()
                    .map(|&j| {
                        let dt = (years[j] - years[i]) / sigma;
                        (-0.5 * dt * dt).exp()
                    })
                    .collect();
                let total: f64 = row.iter().sum();
                row.into_iter().map(|w| w / total).collect()
            })
            .collect()
    }

    /// Smooth the active epochs of a (epoch, row, col) stack in place and
    /// re-anchor each pixel on the reference epoch. Excluded epochs are untouched.
    pub fn apply(
        &self,
        timeseries: &mut Array3<f32>,
        years: &[f64],
        active: &[usize],
        reference_epoch: usize,
    ) -> InsarResult<()> {
        self.params.validate()?;
        let (num_epochs, rows, cols) = timeseries.dim();
        if years.len() != num_epochs {
            return Err(InsarError::InvalidFormat(format!(
                "{} epoch times for a stack of {} epochs",
                years.len(),
                num_epochs
            )));
        }
        let Some(ref_pos) = active.iter().position(|&e| e == reference_epoch) else {
            return Err(InsarError::ReferenceSelection(format!(
                "Reference epoch {} is not active",
                reference_epoch
            )));
        };

        log::info!(
            "Temporal Gaussian filter: sigma {} years over {} epochs",
            self.params.time_window,
            active.len()
        );

        let kernel = self.kernel(years, active);
        let mut series = vec![0.0f64; active.len()];
        let mut smoothed = vec![0.0f64; active.len()];

        for r in 0..rows {
            for c in 0..cols {
                for (k, &e) in active.iter().enumerate() {
                    series[k] = timeseries[[e, r, c]] as f64;
                }
                if series.iter().all(|v| !v.is_finite()) {
                    continue;
                }

                for (k, weights) in kernel.iter().enumerate() {
                    let mut sum = 0.0;
                    let mut norm = 0.0;
                    for (w, v) in weights.iter().zip(series.iter()) {
                        if v.is_finite() {
                            sum += w * v;
                            norm += w;
                        }
                    }
                    smoothed[k] = if norm > 0.0 { sum / norm } else { f64::NAN };
                }

                let anchor = smoothed[ref_pos];
                for (k, &e) in active.iter().enumerate() {
                    timeseries[[e, r, c]] = (smoothed[k] - anchor) as f32;
                }
            }
        }

        log::debug!(
            "Filtered {} x {} pixels, {} epochs untouched",
            rows,
            cols,
            timeseries.len_of(Axis(0)) - active.len()
        );
        Ok(())
    }
}

impl Default for TemporalFilter {
    fn default() -> Self {
        Self::new()
    }
}

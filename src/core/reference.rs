//! Spatial reference pixel and temporal reference epoch.

use crate::core::epochs::{format_date8, EpochRegistry};
use crate::core::quality::min_rms_epoch;
use crate::types::{InsarError, InsarResult, Mask, PixelIndex, PixelStatus};
use chrono::NaiveDate;
use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

/// How the reference epoch is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceDate {
    /// First active epoch
    First,
    /// Explicit acquisition date
    Date(NaiveDate),
    /// Active epoch with the smallest residual RMS
    MinRms,
}

/// Reference selection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceParams {
    /// Explicit reference pixel (row, col); automatic selection when None
    pub pixel: Option<PixelIndex>,
    /// Minimum coherence at the reference pixel
    pub min_coherence: f64,
    /// Half-size of the averaging window around the reference pixel
    pub window_radius: usize,
    pub date: ReferenceDate,
}

impl Default for ReferenceParams {
    fn default() -> Self {
        Self {
            pixel: None,
            min_coherence: 0.85,
            window_radius: 0,
            date: ReferenceDate::MinRms,
        }
    }
}

impl ReferenceParams {
    pub fn validate(&self) -> InsarResult<()> {
        if !(0.0..=1.0).contains(&self.min_coherence) {
            return Err(InsarError::Configuration(format!(
                "reference.minCoherence must be within [0, 1], got {}",
                self.min_coherence
            )));
        }
        Ok(())
    }
}

/// Anchor of every emitted time series, fixed once per run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencePoint {
    pub pixel: PixelIndex,
    pub window_radius: usize,
    /// Coherence of the reference pixel in the selection raster
    pub coherence: f64,
    pub epoch: usize,
    pub date: NaiveDate,
}

/// Masks and layers constraining the reference pixel
#[derive(Debug, Clone, Copy)]
pub struct PixelCandidates<'a> {
    /// Coherence used for ranking and for the minimum-coherence check
    pub coherence: &'a Array2<f32>,
    pub status: &'a Array2<PixelStatus>,
    pub aoi: Option<&'a Mask>,
    pub validity: Option<&'a Mask>,
}

impl PixelCandidates<'_> {
    fn allowed(&self, pixel: PixelIndex) -> bool {
        self.status[pixel].has_estimate()
            && self.aoi.map_or(true, |m| m[pixel])
            && self.validity.map_or(true, |m| m[pixel])
    }
}

pub struct ReferenceSelector {
    params: ReferenceParams,
}

impl ReferenceSelector {
    /// Create a new reference selector with default parameters
    pub fn new() -> Self {
        Self {
            params: ReferenceParams::default(),
        }
    }

    /// Create a reference selector with custom parameters
    pub fn with_params(params: ReferenceParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ReferenceParams {
        &self.params
    }

    /// Reference pixel: the explicit coordinate if it satisfies every
    /// constraint, otherwise the highest-coherence eligible pixel
    pub fn select_pixel(&self, candidates: &PixelCandidates<'_>) -> InsarResult<PixelIndex> {
        let (rows, cols) = candidates.coherence.dim();
        if candidates.status.dim() != (rows, cols) {
            return Err(InsarError::InvalidFormat(format!(
                "Status shape {:?} does not match coherence shape {:?}",
                candidates.status.dim(),
                (rows, cols)
            )));
        }
        for mask in [candidates.aoi, candidates.validity].into_iter().flatten() {
            if mask.dim() != (rows, cols) {
                return Err(InsarError::InvalidFormat(format!(
                    "Mask shape {:?} does not match grid {:?}",
                    mask.dim(),
                    (rows, cols)
                )));
            }
        }

        let min_coherence = self.params.min_coherence;

        if let Some(pixel) = self.params.pixel {
            if pixel.0 >= rows || pixel.1 >= cols {
                return Err(InsarError::ReferenceSelection(format!(
                    "Reference pixel ({}, {}) outside grid {} x {}",
                    pixel.0, pixel.1, rows, cols
                )));
            }
            if !candidates.allowed(pixel) {
                return Err(InsarError::ReferenceSelection(format!(
                    "Reference pixel ({}, {}) is masked out or has no estimate ({})",
                    pixel.0, pixel.1, candidates.status[pixel]
                )));
            }
            let coh = candidates.coherence[pixel] as f64;
            if !(coh >= min_coherence) {
                return Err(InsarError::ReferenceSelection(format!(
                    "Reference pixel ({}, {}) coherence {:.3} below {}",
                    pixel.0, pixel.1, coh, min_coherence
                )));
            }
            log::info!("Using reference pixel ({}, {}), coherence {:.3}", pixel.0, pixel.1, coh);
            return Ok(pixel);
        }

        let mut best: Option<(PixelIndex, f32)> = None;
        for (pixel, &coh) in candidates.coherence.indexed_iter() {
            if !coh.is_finite() || (coh as f64) < min_coherence || !candidates.allowed(pixel) {
                continue;
            }
            if best.map_or(true, |(_, b)| coh > b) {
                best = Some((pixel, coh));
            }
        }

        match best {
            Some((pixel, coh)) => {
                log::info!(
                    "Selected reference pixel ({}, {}) with coherence {:.3}",
                    pixel.0,
                    pixel.1,
                    coh
                );
                Ok(pixel)
            }
            None => Err(InsarError::ReferenceSelection(format!(
                "No eligible pixel with coherence >= {}",
                min_coherence
            ))),
        }
    }

    /// Reference epoch by explicit date, minimum residual RMS, or first active epoch
    pub fn select_epoch(&self, epochs: &EpochRegistry, residual_rms: &[f64]) -> InsarResult<usize> {
        let active = epochs.active_indices();
        match self.params.date {
            ReferenceDate::First => active.first().copied().ok_or_else(|| {
                InsarError::ReferenceSelection("No active epoch to reference".to_string())
            }),
            ReferenceDate::Date(date) => {
                let label = format_date8(date);
                let index = epochs.index_of(date).ok_or_else(|| {
                    InsarError::ReferenceSelection(format!("Reference date {} not acquired", label))
                })?;
                if epochs.is_excluded(index) {
                    return Err(InsarError::ReferenceSelection(format!(
                        "Reference date {} is excluded from the network",
                        label
                    )));
                }
                Ok(index)
            }
            ReferenceDate::MinRms => {
                let index = min_rms_epoch(residual_rms, &active).ok_or_else(|| {
                    InsarError::ReferenceSelection(
                        "No epoch has a finite residual RMS".to_string(),
                    )
                })?;
                log::info!(
                    "Reference epoch {} (minimum residual RMS {:.4})",
                    format_date8(epochs.date(index)),
                    residual_rms[index]
                );
                Ok(index)
            }
        }
    }

    /// Select pixel and epoch once
    pub fn select(
        &self,
        candidates: &PixelCandidates<'_>,
        epochs: &EpochRegistry,
        residual_rms: &[f64],
    ) -> InsarResult<ReferencePoint> {
        let pixel = self.select_pixel(candidates)?;
        let epoch = self.select_epoch(epochs, residual_rms)?;
        Ok(ReferencePoint {
            pixel,
            window_radius: self.params.window_radius,
            coherence: candidates.coherence[pixel] as f64,
            epoch,
            date: epochs.date(epoch),
        })
    }

    /// Re-anchor the stack on the reference point: subtract the reference
    /// pixel (window mean) series from every pixel, then each pixel's value at
    /// the reference epoch. Idempotent.
    pub fn apply(
        &self,
        point: &ReferencePoint,
        timeseries: &mut Array3<f32>,
        status: &Array2<PixelStatus>,
    ) -> InsarResult<()> {
        let (num_epochs, rows, cols) = timeseries.dim();
        if status.dim() != (rows, cols) {
            return Err(InsarError::InvalidFormat(format!(
                "Status shape {:?} does not match time series grid {:?}",
                status.dim(),
                (rows, cols)
            )));
        }
        if point.epoch >= num_epochs {
            return Err(InsarError::ReferenceSelection(format!(
                "Reference epoch index {} outside stack of {} epochs",
                point.epoch, num_epochs
            )));
        }

        let (r0, c0) = point.pixel;
        let rad = point.window_radius;
        let row_range = r0.saturating_sub(rad)..(r0 + rad + 1).min(rows);
        let col_range = c0.saturating_sub(rad)..(c0 + rad + 1).min(cols);

        let mut offsets = vec![f32::NAN; num_epochs];
        for (e, offset) in offsets.iter_mut().enumerate() {
            let mut sum = 0.0f64;
            let mut count = 0usize;
            for r in row_range.clone() {
                for c in col_range.clone() {
                    let v = timeseries[[e, r, c]];
                    if status[[r, c]].has_estimate() && v.is_finite() {
                        sum += v as f64;
                        count += 1;
                    }
                }
            }
            if count > 0 {
                *offset = (sum / count as f64) as f32;
            }
        }
        if !offsets[point.epoch].is_finite() {
            return Err(InsarError::ReferenceSelection(format!(
                "Reference pixel ({}, {}) has no value at the reference epoch",
                r0, c0
            )));
        }

        for (e, mut layer) in timeseries.axis_iter_mut(Axis(0)).enumerate() {
            let offset = offsets[e];
            if offset.is_finite() {
                layer.mapv_inplace(|v| v - offset);
            }
        }

        let anchor = timeseries.index_axis(Axis(0), point.epoch).to_owned();
        for mut layer in timeseries.axis_iter_mut(Axis(0)) {
            layer -= &anchor;
        }

        log::debug!(
            "Re-anchored {} epochs on pixel ({}, {}) and epoch {}",
            num_epochs,
            r0,
            c0,
            point.epoch
        );
        Ok(())
    }
}

impl Default for ReferenceSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_stack() -> Array3<f32> {
        Array3::from_shape_fn((3, 4, 4), |(e, r, c)| e as f32 * (1.0 + r as f32 + 0.5 * c as f32) + 2.0)
    }

    #[test]
    fn test_auto_pixel_picks_highest_coherence() {
        let mut coherence = Array2::from_elem((4, 4), 0.9f32);
        coherence[[2, 3]] = 0.99;
        coherence[[1, 1]] = 0.999;
        let mut status = Array2::from_elem((4, 4), PixelStatus::Valid);
        status[[1, 1]] = PixelStatus::RankDeficient;

        let selector = ReferenceSelector::new();
        let candidates = PixelCandidates {
            coherence: &coherence,
            status: &status,
            aoi: None,
            validity: None,
        };
        assert_eq!(selector.select_pixel(&candidates).unwrap(), (2, 3));

        let mut aoi = Mask::from_elem((4, 4), false);
        aoi[[0, 0]] = true;
        let candidates = PixelCandidates { aoi: Some(&aoi), ..candidates };
        assert_eq!(selector.select_pixel(&candidates).unwrap(), (0, 0));
    }

    #[test]
    fn test_explicit_pixel_failing_constraint_is_an_error() {
        let mut coherence = Array2::from_elem((4, 4), 0.95f32);
        coherence[[0, 1]] = 0.3;
        let status = Array2::from_elem((4, 4), PixelStatus::Valid);
        let candidates = PixelCandidates {
            coherence: &coherence,
            status: &status,
            aoi: None,
            validity: None,
        };

        let selector = ReferenceSelector::with_params(ReferenceParams {
            pixel: Some((0, 1)),
            ..Default::default()
        });
        assert!(matches!(
            selector.select_pixel(&candidates),
            Err(InsarError::ReferenceSelection(_))
        ));

        let selector = ReferenceSelector::with_params(ReferenceParams {
            pixel: Some((9, 9)),
            ..Default::default()
        });
        assert!(selector.select_pixel(&candidates).is_err());
    }

    #[test]
    fn test_reanchoring_is_idempotent() {
        let mut ts = ramp_stack();
        let status = Array2::from_elem((4, 4), PixelStatus::Valid);
        let point = ReferencePoint {
            pixel: (1, 2),
            window_radius: 1,
            coherence: 0.9,
            epoch: 1,
            date: NaiveDate::from_ymd_opt(2010, 1, 13).unwrap(),
        };
        let selector = ReferenceSelector::new();

        selector.apply(&point, &mut ts, &status).unwrap();
        for r in 0..4 {
            for c in 0..4 {
                assert!(ts[[1, r, c]].abs() < 1e-5);
            }
        }
        for e in 0..3 {
            assert!(ts[[e, 1, 2]].abs() < 1e-5);
        }

        let once = ts.clone();
        selector.apply(&point, &mut ts, &status).unwrap();
        for (a, b) in once.iter().zip(ts.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_reference_epoch_policies() {
        let mut epochs =
            EpochRegistry::from_date_strings(&["20100101", "20100113", "20100125"]).unwrap();
        let rms = vec![0.3, 0.1, 0.2];

        assert_eq!(ReferenceSelector::new().select_epoch(&epochs, &rms).unwrap(), 1);

        let date = NaiveDate::from_ymd_opt(2010, 1, 25).unwrap();
        let explicit = ReferenceSelector::with_params(ReferenceParams {
            date: ReferenceDate::Date(date),
            ..Default::default()
        });
        assert_eq!(explicit.select_epoch(&epochs, &rms).unwrap(), 2);

        epochs.mark_excluded(2, crate::core::epochs::ExclusionReason::ExcludedDate);
        assert!(explicit.select_epoch(&epochs, &rms).is_err());
    }
}

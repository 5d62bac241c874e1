//! End-to-end network inversion run.
//!
//! filter network -> design matrix -> block inversion -> quality gating ->
//! reference selection (barrier) -> unit conversion and temporal filter

use crate::config::TimeseriesConfig;
use crate::core::design_matrix::DesignMatrixBuilder;
use crate::core::epochs::{format_date8, EpochRegistry};
use crate::core::inversion::{CancellationToken, WeightedInverter};
use crate::core::network::NetworkGraph;
use crate::core::network_filter::{FilterReport, NetworkFilter};
use crate::core::quality::QualityEstimator;
use crate::core::reference::{PixelCandidates, ReferenceDate, ReferencePoint, ReferenceSelector};
use crate::core::temporal_filter::TemporalFilter;
use crate::types::{InsarError, InsarResult, Mask, PairStack, PixelStatus, Raster, RasterStack};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Optional rasters and controls accompanying the observation stack
#[derive(Debug, Clone, Copy, Default)]
pub struct RunInputs<'a> {
    /// Validity / water mask, false pixels are never inverted
    pub validity_mask: Option<&'a Mask>,
    /// Coherence-threshold mask, combined with the validity mask
    pub coherence_mask: Option<&'a Mask>,
    /// Area of interest for automatic reference pixel selection
    pub aoi_mask: Option<&'a Mask>,
    /// Average spatial coherence used to rank reference pixel candidates;
    /// temporal coherence is used when absent
    pub avg_spatial_coherence: Option<&'a Raster>,
    pub cancel: Option<&'a CancellationToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplacementUnit {
    Radians,
    Meters,
}

/// Everything a run hands to downstream consumers
#[derive(Debug, Clone)]
pub struct TimeseriesProduct {
    pub epochs: EpochRegistry,
    /// (epoch, row, col), anchored on the reference point
    pub timeseries: RasterStack,
    pub temporal_coherence: Raster,
    pub residual_rms: Raster,
    pub num_valid_pairs: Array2<u32>,
    pub status: Array2<PixelStatus>,
    /// One value per registry epoch, NaN for excluded epochs
    pub epoch_residual_rms: Vec<f64>,
    /// Epochs whose residual RMS exceeds the configured threshold
    pub exclude_date_candidates: Vec<String>,
    /// None only when the run was cancelled before the reference barrier
    pub reference: Option<ReferencePoint>,
    pub filter_report: FilterReport,
    pub unit: DisplacementUnit,
    pub cancelled: bool,
}

impl TimeseriesProduct {
    pub fn status_codes(&self) -> Array2<u8> {
        self.status.mapv(|s| s.code())
    }

    /// Time series of one pixel
    pub fn pixel_series(&self, row: usize, col: usize) -> Vec<f32> {
        self.timeseries.slice(ndarray::s![.., row, col]).to_vec()
    }

    pub fn date_labels(&self) -> Vec<String> {
        self.epochs.epochs().iter().map(|e| e.label()).collect()
    }
}

/// Network inversion processor, owns the network and the design matrix cache
pub struct NetworkInversionProcessor {
    network: NetworkGraph,
    config: TimeseriesConfig,
    design_builder: DesignMatrixBuilder,
}

impl NetworkInversionProcessor {
    /// Create a processor for a candidate network, validating the configuration
    pub fn new(network: NetworkGraph, config: TimeseriesConfig) -> InsarResult<Self> {
        config.validate()?;
        Ok(Self {
            network,
            config,
            design_builder: DesignMatrixBuilder::new(),
        })
    }

    pub fn network(&self) -> &NetworkGraph {
        &self.network
    }

    pub fn config(&self) -> &TimeseriesConfig {
        &self.config
    }

    pub fn run(&mut self, stack: &PairStack, inputs: &RunInputs<'_>) -> InsarResult<TimeseriesProduct> {
        self.config.validate()?;
        stack.validate()?;
        self.check_inputs(stack, inputs)?;

        log::info!("Modifying network of {} pairs", self.network.num_pairs());
        let filter_report = NetworkFilter::with_params(self.config.network.clone()).apply(&mut self.network)?;

        let design_reference = match self.config.reference.date {
            ReferenceDate::Date(date) => {
                let index = self.network.epochs().index_of(date).ok_or_else(|| {
                    InsarError::ReferenceSelection(format!(
                        "Reference date {} not acquired",
                        format_date8(date)
                    ))
                })?;
                Some(index)
            }
            _ => None,
        };
        let design = self.design_builder.get_or_build(&self.network, design_reference)?;

        let pixel_mask = combine_masks(inputs.validity_mask, inputs.coherence_mask);
        let inverter = WeightedInverter::new(design, &self.network, self.config.inversion.clone());
        let mut result = inverter.invert_stack(stack, pixel_mask.as_ref(), inputs.cancel)?;

        let unit = match self.config.wavelength {
            Some(wavelength) => {
                let factor = (-wavelength / (4.0 * PI)) as f32;
                log::info!("Converting phase to range change, wavelength {} m", wavelength);
                result.timeseries.mapv_inplace(|v| v * factor);
                result.epoch_residual.mapv_inplace(|v| v * factor.abs());
                result.residual_rms.mapv_inplace(|v| v * factor.abs());
                DisplacementUnit::Meters
            }
            None => DisplacementUnit::Radians,
        };

        let epochs = self.network.epochs().clone();
        if result.cancelled {
            log::warn!("Run cancelled, skipping quality gating and reference selection");
            return Ok(TimeseriesProduct {
                epoch_residual_rms: vec![f64::NAN; epochs.len()],
                epochs,
                timeseries: result.timeseries,
                temporal_coherence: result.temporal_coherence,
                residual_rms: result.residual_rms,
                num_valid_pairs: result.num_valid_pairs,
                status: result.status,
                exclude_date_candidates: Vec::new(),
                reference: None,
                filter_report,
                unit,
                cancelled: true,
            });
        }

        log::info!("Quality assessment");
        let quality = QualityEstimator::with_params(self.config.quality.clone());
        let trusted = quality.apply_threshold(&result.temporal_coherence, &mut result.status)?;
        quality.check_min_num_pixel(trusted)?;
        let epoch_residual_rms = quality.epoch_residual_rms(&result.epoch_residual, &result.status)?;
        let exclude_date_candidates = quality.exclude_date_candidates(&epoch_residual_rms, &epochs);

        log::info!("Reference selection");
        let selector = ReferenceSelector::with_params(self.config.reference.clone());
        let candidates = PixelCandidates {
            coherence: inputs.avg_spatial_coherence.unwrap_or(&result.temporal_coherence),
            status: &result.status,
            aoi: inputs.aoi_mask,
            validity: pixel_mask.as_ref(),
        };
        let reference = selector.select(&candidates, &epochs, &epoch_residual_rms)?;
        selector.apply(&reference, &mut result.timeseries, &result.status)?;

        if let Some(params) = &self.config.temporal_filter {
            TemporalFilter::with_params(params.clone()).apply(
                &mut result.timeseries,
                &epochs.decimal_years(),
                &epochs.active_indices(),
                reference.epoch,
            )?;
        }

        log::info!(
            "Time series ready: {} epochs, reference pixel ({}, {}), reference date {}",
            epochs.num_active(),
            reference.pixel.0,
            reference.pixel.1,
            format_date8(reference.date)
        );

        Ok(TimeseriesProduct {
            epochs,
            timeseries: result.timeseries,
            temporal_coherence: result.temporal_coherence,
            residual_rms: result.residual_rms,
            num_valid_pairs: result.num_valid_pairs,
            status: result.status,
            epoch_residual_rms,
            exclude_date_candidates,
            reference: Some(reference),
            filter_report,
            unit,
            cancelled: false,
        })
    }

    fn check_inputs(&self, stack: &PairStack, inputs: &RunInputs<'_>) -> InsarResult<()> {
        if stack.num_pairs() != self.network.num_pairs() {
            return Err(InsarError::InvalidFormat(format!(
                "Stack has {} layers but the network has {} pairs",
                stack.num_pairs(),
                self.network.num_pairs()
            )));
        }
        let shape = stack.shape();
        let masks = [
            ("validity", inputs.validity_mask.map(|m| m.dim())),
            ("coherence", inputs.coherence_mask.map(|m| m.dim())),
            ("area of interest", inputs.aoi_mask.map(|m| m.dim())),
            ("average coherence", inputs.avg_spatial_coherence.map(|r| r.dim())),
        ];
        for (name, dim) in masks {
            if let Some(dim) = dim {
                if dim != shape {
                    return Err(InsarError::InvalidFormat(format!(
                        "{} raster shape {:?} does not match grid {:?}",
                        name, dim, shape
                    )));
                }
            }
        }
        Ok(())
    }
}

fn combine_masks(first: Option<&Mask>, second: Option<&Mask>) -> Option<Mask> {
    match (first, second) {
        (None, None) => None,
        (Some(m), None) | (None, Some(m)) => Some(m.clone()),
        (Some(a), Some(b)) => {
            let mut combined = a.clone();
            ndarray::Zip::from(&mut combined).and(b).for_each(|x, &y| *x = *x && y);
            Some(combined)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::epochs::parse_date;
    use crate::core::network::PairMetadata;
    use crate::core::reference::ReferenceParams;
    use ndarray::{s, Array3};

    fn chain_network() -> (NetworkGraph, Vec<f64>) {
        let dates = ["20100101", "20100113", "20100125", "20100206"];
        let pairs = [(0, 1), (1, 2), (2, 3), (0, 2), (1, 3)];
        let records: Vec<PairMetadata> = pairs
            .iter()
            .map(|&(i, j)| PairMetadata {
                date1: parse_date(dates[i]).unwrap(),
                date2: parse_date(dates[j]).unwrap(),
                perp_baseline: 0.0,
                avg_coherence: 0.9,
            })
            .collect();
        let truth = [0.0, 0.5, 1.5, 2.0];
        let obs = pairs.iter().map(|&(i, j)| truth[j] - truth[i]).collect();
        (NetworkGraph::from_metadata(&records).unwrap(), obs)
    }

    fn stack(obs: &[f64], rows: usize, cols: usize) -> PairStack {
        let mut phase = Array3::<f32>::zeros((obs.len(), rows, cols));
        for (k, &v) in obs.iter().enumerate() {
            phase.slice_mut(s![k, .., ..]).fill(v as f32);
        }
        PairStack::new(phase)
    }

    fn config() -> TimeseriesConfig {
        let mut config = TimeseriesConfig::default();
        config.quality.min_num_pixel = 1;
        config.reference = ReferenceParams {
            min_coherence: 0.5,
            date: ReferenceDate::First,
            ..Default::default()
        };
        config
    }

    #[test]
    fn test_run_produces_anchored_series() {
        let (network, obs) = chain_network();
        let mut processor = NetworkInversionProcessor::new(network, config()).unwrap();
        let product = processor.run(&stack(&obs, 3, 3), &RunInputs::default()).unwrap();

        let reference = product.reference.clone().unwrap();
        assert_eq!(reference.epoch, 0);
        assert_eq!(product.unit, DisplacementUnit::Radians);
        assert!(product.status.iter().all(|&s| s == PixelStatus::Valid));

        let series = product.pixel_series(1, 1);
        assert!(series.iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn test_wavelength_conversion_and_layer_mismatch() {
        let (network, obs) = chain_network();
        let mut cfg = config();
        cfg.wavelength = Some(0.0555);
        cfg.reference.pixel = Some((0, 0));
        let mut processor = NetworkInversionProcessor::new(network, cfg).unwrap();

        let mut st = stack(&obs, 2, 2);
        st.phase.slice_mut(s![.., 0, 0]).fill(0.0);
        let product = processor.run(&st, &RunInputs::default()).unwrap();
        assert_eq!(product.unit, DisplacementUnit::Meters);

        let expected = -(2.0 * 0.0555 / (4.0 * PI)) as f32;
        assert!((product.timeseries[[3, 1, 1]] - expected).abs() < 1e-6);

        let short = stack(&obs[..4], 2, 2);
        assert!(matches!(
            processor.run(&short, &RunInputs::default()),
            Err(InsarError::InvalidFormat(_))
        ));
    }

    /// Displacement proportional to `1 + row + col`
    fn scaled_stack(obs: &[f64], rows: usize, cols: usize) -> PairStack {
        let phase = Array3::from_shape_fn((obs.len(), rows, cols), |(k, r, c)| {
            (obs[k] * (1 + r + c) as f64) as f32
        });
        PairStack::new(phase)
    }

    #[test]
    fn test_run_inputs_constrain_masking_and_reference() {
        let (network, obs) = chain_network();
        let mut processor = NetworkInversionProcessor::new(network, config()).unwrap();

        let mut avg_coherence = Raster::from_elem((3, 3), 0.6);
        avg_coherence[[0, 0]] = 0.99;
        avg_coherence[[2, 2]] = 0.95;
        let mut aoi = Mask::from_elem((3, 3), true);
        aoi[[0, 0]] = false;
        let mut coherent = Mask::from_elem((3, 3), true);
        coherent[[1, 0]] = false;

        let inputs = RunInputs {
            coherence_mask: Some(&coherent),
            aoi_mask: Some(&aoi),
            avg_spatial_coherence: Some(&avg_coherence),
            ..Default::default()
        };
        let product = processor.run(&stack(&obs, 3, 3), &inputs).unwrap();

        let reference = product.reference.clone().unwrap();
        assert_eq!(reference.pixel, (2, 2));
        assert!((reference.coherence - 0.95).abs() < 1e-6);
        assert_eq!(product.status[[1, 0]], PixelStatus::MaskedOut);
        assert!(product.timeseries[[3, 1, 0]].is_nan());
        assert_eq!(product.status[[0, 0]], PixelStatus::Valid);

        let wrong_shape = Mask::from_elem((2, 3), true);
        let inputs = RunInputs {
            aoi_mask: Some(&wrong_shape),
            ..Default::default()
        };
        assert!(matches!(
            processor.run(&stack(&obs, 3, 3), &inputs),
            Err(InsarError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_reference_window_averages_neighbours() {
        let (network, obs) = chain_network();
        let mut cfg = config();
        cfg.reference.pixel = Some((0, 0));
        cfg.reference.window_radius = 1;
        let mut processor = NetworkInversionProcessor::new(network, cfg).unwrap();
        let product = processor.run(&scaled_stack(&obs, 3, 3), &RunInputs::default()).unwrap();

        assert_eq!(product.reference.as_ref().unwrap().window_radius, 1);
        // window mean of the scale over rows/cols 0..=1 is 2
        assert!((product.timeseries[[3, 0, 0]] + 2.0).abs() < 1e-4);
        assert!((product.timeseries[[3, 2, 2]] - 6.0).abs() < 1e-4);
        assert!(product.timeseries.index_axis(ndarray::Axis(0), 0).iter().all(|v| v.abs() < 1e-5));
    }

    #[test]
    fn test_run_with_temporal_filter() {
        use crate::core::temporal_filter::TemporalFilterParams;

        let (network, obs) = chain_network();
        let mut cfg = config();
        cfg.reference.pixel = Some((0, 0));
        let mut processor = NetworkInversionProcessor::new(network.clone(), cfg.clone()).unwrap();
        let raw = processor.run(&scaled_stack(&obs, 3, 3), &RunInputs::default()).unwrap();
        assert!((raw.timeseries[[3, 2, 2]] - 8.0).abs() < 1e-4);

        cfg.temporal_filter = Some(TemporalFilterParams { time_window: 0.3 });
        let mut processor = NetworkInversionProcessor::new(network, cfg).unwrap();
        let smoothed = processor.run(&scaled_stack(&obs, 3, 3), &RunInputs::default()).unwrap();

        // a 36-day span under a 0.3-year kernel collapses towards the mean
        let last = smoothed.timeseries[[3, 2, 2]];
        assert!(last > 0.0 && last < 1.0, "filtered value {}", last);
        assert!(smoothed.timeseries[[0, 2, 2]].abs() < 1e-5);
        assert!(smoothed.pixel_series(0, 0).iter().all(|v| v.abs() < 1e-5));
    }
}

//! Run configuration aggregated over all processing stages.

use crate::core::inversion::{InversionParams, ObservationMask, ResidualNorm};
use crate::core::network_filter::NetworkFilterParams;
use crate::core::quality::{QualityParams, RampType};
use crate::core::reference::{ReferenceDate, ReferenceParams};
use crate::core::temporal_filter::TemporalFilterParams;
use crate::core::weights::WeightFunction;
use crate::core::epochs::parse_date;
use crate::io::network_file::read_date12_list;
use crate::io::template::{parse_date_list, parse_index_list, parse_yx, read_template, Template};
use crate::types::{InsarError, InsarResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete configuration of one time-series inversion run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeseriesConfig {
    pub network: NetworkFilterParams,
    pub inversion: InversionParams,
    pub quality: QualityParams,
    pub reference: ReferenceParams,
    /// Gaussian smoothing of the output in time, off when None
    pub temporal_filter: Option<TemporalFilterParams>,
    /// Radar wavelength in meters; output stays in radians when None
    pub wavelength: Option<f64>,
}

impl TimeseriesConfig {
    /// Reject contradictory or out-of-range settings before any computation
    pub fn validate(&self) -> InsarResult<()> {
        self.network.validate()?;
        self.inversion.validate()?;
        self.quality.validate()?;
        self.reference.validate()?;
        if let Some(filter) = &self.temporal_filter {
            filter.validate()?;
        }
        if let Some(wavelength) = self.wavelength {
            if !(wavelength > 0.0) {
                return Err(InsarError::Configuration(format!(
                    "Wavelength must be positive, got {}",
                    wavelength
                )));
            }
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> InsarResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> InsarResult<Self> {
        let path = path.as_ref();
        let config = Self::from_json_str(&std::fs::read_to_string(path)?)?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn to_json_string(&self) -> InsarResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read a template file; relative file references resolve against its directory
    pub fn from_template_file<P: AsRef<Path>>(path: P) -> InsarResult<Self> {
        let path = path.as_ref();
        let template = read_template(path)?;
        Self::from_template(&template, path.parent())
    }

    /// Apply template options over the defaults; `auto` keeps the default
    pub fn from_template(template: &Template, base_dir: Option<&Path>) -> InsarResult<Self> {
        let mut config = Self::default();

        let network = &mut config.network;
        if let Some(v) = template.get_bool("network.coherenceBased")? {
            network.coherence_based = v;
        }
        if let Some(v) = template.get_bool("network.keepMinSpanTree")? {
            network.keep_min_span_tree = v;
        }
        if let Some(v) = template.get_bool("network.keepSeasonal")? {
            network.keep_seasonal = v;
        }
        if let Some(v) = template.get_bool("network.allowDisconnected")? {
            network.allow_disconnected = v;
        }
        if let Some(v) = template.get_f64("network.minCoherence")? {
            network.min_coherence = v;
        }
        if template.get_optional("network.tempBaseMax").is_some() {
            network.max_temporal_baseline = template.get_f64("network.tempBaseMax")?;
        }
        if template.get_optional("network.perpBaseMax").is_some() {
            network.max_perp_baseline = template.get_f64("network.perpBaseMax")?;
        }
        if let Some(v) = template.get_optional("network.excludeDate") {
            network.exclude_dates = parse_date_list(v)?;
        }
        if let Some(v) = template.get_optional("network.excludeIfgIndex") {
            network.exclude_pair_indices = parse_index_list(v)?;
        }
        if let Some(v) = template.get_optional("network.startDate") {
            network.start_date = Some(parse_date(v)?);
        }
        if let Some(v) = template.get_optional("network.endDate") {
            network.end_date = Some(parse_date(v)?);
        }
        if let Some(v) = template.get_optional("network.referenceFile") {
            let mut path = PathBuf::from(v);
            if path.is_relative() {
                if let Some(dir) = base_dir {
                    path = dir.join(path);
                }
            }
            network.reference_pairs = read_date12_list(&path)?;
        }

        let inversion = &mut config.inversion;
        if let Some(v) = template.get("networkInversion.weightFunc") {
            inversion.weight_func = WeightFunction::from_name(v)?;
        }
        if let Some(v) = template.get("networkInversion.residualNorm") {
            inversion.residual_norm = ResidualNorm::from_name(v)?;
        }
        if let Some(v) = template.get("networkInversion.maskDataset") {
            inversion.mask_dataset = ObservationMask::from_name(v)?;
        }
        if let Some(v) = template.get_f64("networkInversion.maskThreshold")? {
            inversion.mask_threshold = v;
        }
        if let Some(v) = template.get_usize("networkInversion.minNumPair")? {
            inversion.min_num_pairs = v;
        }
        if let Some(v) = template.get_f64("networkInversion.numLooks")? {
            inversion.num_looks = v;
        }

        let quality = &mut config.quality;
        if let Some(v) = template.get_f64("networkInversion.minTempCoh")? {
            quality.min_temporal_coherence = v;
        }
        if let Some(v) = template.get_usize("networkInversion.minNumPixel")? {
            quality.min_num_pixel = v;
        }
        if let Some(v) = template.get("residualRms.ramp") {
            quality.ramp = RampType::from_name(v)?;
        }
        if template.get_optional("residualRms.threshold").is_some() {
            quality.rms_threshold = template.get_f64("residualRms.threshold")?;
        }

        let reference = &mut config.reference;
        if let Some(v) = template.get_optional("reference.yx") {
            reference.pixel = Some(parse_yx(v)?);
        }
        if let Some(v) = template.get_f64("reference.minCoherence")? {
            reference.min_coherence = v;
        }
        if let Some(v) = template.get_usize("reference.windowRadius")? {
            reference.window_radius = v;
        }
        if let Some(v) = template.get("reference.date") {
            reference.date = match v.to_lowercase().as_str() {
                "minrms" => ReferenceDate::MinRms,
                "no" | "first" => ReferenceDate::First,
                _ => ReferenceDate::Date(parse_date(v)?),
            };
        }

        match template.get("temporalFilter.timeWindow") {
            None => {}
            Some("no") => config.temporal_filter = None,
            Some(_) => {
                config.temporal_filter = Some(TemporalFilterParams {
                    time_window: template.get_f64("temporalFilter.timeWindow")?.unwrap_or(0.3),
                });
            }
        }
        if let Some(v) = template.get_f64("wavelength")? {
            config.wavelength = Some(v);
        }

        config.validate()?;
        log::debug!("Configuration from template: {:?}", config);
        Ok(config)
    }
}

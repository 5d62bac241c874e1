use crate::types::{InsarError, InsarResult};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Coherence is clipped to [EPSILON, 1 - EPSILON] before variance mappings
pub const COHERENCE_EPSILON: f64 = 1e-3;

/// Samples used for integrating the phase PDF over [-pi, pi]
const PDF_SAMPLES: usize = 2001;

/// How a pair's coherence turns into its least-squares weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightFunction {
    /// Uniform weights, plain least squares
    Sbas,
    /// Weight proportional to coherence
    Coh,
    /// Inverse phase variance derived from the phase PDF
    Var,
    /// Fisher information, 2L * coh^2 / (1 - coh^2)
    Fim,
}

impl Default for WeightFunction {
    fn default() -> Self {
        WeightFunction::Fim
    }
}

impl std::fmt::Display for WeightFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl WeightFunction {
    pub fn from_name(name: &str) -> InsarResult<Self> {
        match name.trim().to_lowercase().as_str() {
            "sbas" | "no" | "uniform" => Ok(WeightFunction::Sbas),
            "coh" | "coherence" => Ok(WeightFunction::Coh),
            "var" | "variance" => Ok(WeightFunction::Var),
            "fim" | "auto" => Ok(WeightFunction::Fim),
            other => Err(InsarError::Configuration(format!(
                "Unknown weight function: {} (expected fim, var, coh or sbas)",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WeightFunction::Sbas => "sbas",
            WeightFunction::Coh => "coh",
            WeightFunction::Var => "var",
            WeightFunction::Fim => "fim",
        }
    }

    /// Whether per-pixel coherence is needed to evaluate the weights
    pub fn requires_coherence(&self) -> bool {
        !matches!(self, WeightFunction::Sbas)
    }

    /// Weight of an observation with the given coherence
    pub fn weight(&self, coherence: f64, num_looks: f64) -> f64 {
        match self {
            WeightFunction::Sbas => 1.0,
            WeightFunction::Coh => coherence.clamp(COHERENCE_EPSILON, 1.0),
            WeightFunction::Var => {
                let coh = coherence.clamp(COHERENCE_EPSILON, 1.0 - COHERENCE_EPSILON);
                num_looks / single_look_phase_variance(coh)
            }
            WeightFunction::Fim => {
                let coh = coherence.clamp(COHERENCE_EPSILON, 1.0 - COHERENCE_EPSILON);
                2.0 * num_looks * coh * coh / (1.0 - coh * coh)
            }
        }
    }
}

/// Probability density of single-look interferometric phase
pub fn single_look_phase_pdf(phase: f64, coherence: f64) -> f64 {
    let beta = coherence * phase.cos();
    let one_minus_beta2 = (1.0 - beta * beta).max(f64::MIN_POSITIVE);
    let gain = 1.0 + beta * (-beta).acos() / one_minus_beta2.sqrt();
    (1.0 - coherence * coherence) / (2.0 * PI) / one_minus_beta2 * gain
}

/// Phase variance of a single-look observation, by Simpson integration of the PDF
pub fn single_look_phase_variance(coherence: f64) -> f64 {
    let n = PDF_SAMPLES - 1;
    let h = 2.0 * PI / n as f64;

    let mut sum = 0.0;
    let mut norm = 0.0;
    for i in 0..=n {
        let phase = -PI + i as f64 * h;
        let factor = if i == 0 || i == n {
            1.0
        } else if i % 2 == 1 {
            4.0
        } else {
            2.0
        };
        let pdf = single_look_phase_pdf(phase, coherence);
        sum += factor * phase * phase * pdf;
        norm += factor * pdf;
    }

    // normalising absorbs the quadrature error of the peaked PDF near coh = 1
    if norm > 0.0 {
        sum / norm
    } else {
        PI * PI / 3.0
    }
}

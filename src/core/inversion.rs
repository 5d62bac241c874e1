//! Per-pixel weighted network inversion.
//!
//! The design matrix is built once and shared by reference; every pixel is
//! solved independently, so blocks of rows run on separate workers.

use crate::core::design_matrix::DesignMatrix;
use crate::core::network::NetworkGraph;
use crate::core::quality::temporal_coherence;
use crate::core::weights::WeightFunction;
use crate::types::{InsarError, InsarResult, Mask, PairStack, PixelIndex, PixelStatus};
use nalgebra::{Cholesky, DMatrix, DVector};
use ndarray::{s, Array2, Array3};
use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Residuals below this magnitude are capped in the L1 re-weighting
const IRLS_DELTA: f64 = 1e-6;

/// Norm minimised by the inversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResidualNorm {
    /// Closed-form weighted least squares
    L2,
    /// Iteratively re-weighted least squares approximating least absolute deviation
    L1,
}

impl ResidualNorm {
    pub fn from_name(name: &str) -> InsarResult<Self> {
        match name.trim().to_uppercase().as_str() {
            "L2" | "AUTO" => Ok(ResidualNorm::L2),
            "L1" => Ok(ResidualNorm::L1),
            other => Err(InsarError::Configuration(format!(
                "Unknown residual norm: {} (expected L2 or L1)",
                other
            ))),
        }
    }
}

/// Which per-pair layer invalidates individual observations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservationMask {
    None,
    /// Drop observations with spatial coherence below the mask threshold
    Coherence,
    /// Drop observations with connected component label 0
    ConnectComponent,
}

impl ObservationMask {
    pub fn from_name(name: &str) -> InsarResult<Self> {
        match name.trim().to_lowercase().as_str() {
            "no" | "none" | "auto" => Ok(ObservationMask::None),
            "coherence" => Ok(ObservationMask::Coherence),
            "connectcomponent" | "conncomp" => Ok(ObservationMask::ConnectComponent),
            other => Err(InsarError::Configuration(format!(
                "Unknown mask dataset: {} (expected coherence, connectComponent or no)",
                other
            ))),
        }
    }
}

/// Network inversion parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InversionParams {
    pub weight_func: WeightFunction,
    pub residual_norm: ResidualNorm,
    pub mask_dataset: ObservationMask,
    /// Coherence below which an observation is dropped (coherence mask)
    pub mask_threshold: f64,
    /// Minimum number of valid pairs for a pixel to be inverted
    pub min_num_pairs: usize,
    /// Number of looks of the interferograms (variance-based weights)
    pub num_looks: f64,
    /// L1 re-weighting iterations
    pub max_iterations: usize,
    /// L1 convergence on the largest change of the solution
    pub tolerance: f64,
    /// Rows per work block
    pub block_rows: usize,
}

impl Default for InversionParams {
    fn default() -> Self {
        Self {
            weight_func: WeightFunction::Fim,
            residual_norm: ResidualNorm::L2,
            mask_dataset: ObservationMask::None,
            mask_threshold: 0.4,
            min_num_pairs: 1,
            num_looks: 1.0,
            max_iterations: 50,
            tolerance: 1e-8,
            block_rows: 32,
        }
    }
}

impl InversionParams {
    pub fn validate(&self) -> InsarResult<()> {
        if !(0.0..=1.0).contains(&self.mask_threshold) {
            return Err(InsarError::Configuration(format!(
                "networkInversion.maskThreshold must be within [0, 1], got {}",
                self.mask_threshold
            )));
        }
        if self.min_num_pairs == 0 {
            return Err(InsarError::Configuration(
                "Minimum number of valid pairs must be at least 1".to_string(),
            ));
        }
        if !(self.num_looks >= 1.0) {
            return Err(InsarError::Configuration(format!(
                "Number of looks must be >= 1, got {}",
                self.num_looks
            )));
        }
        if self.residual_norm == ResidualNorm::L1 && self.max_iterations == 0 {
            return Err(InsarError::Configuration(
                "L1 inversion needs at least one iteration".to_string(),
            ));
        }
        Ok(())
    }
}

/// Run-level abort flag shared between the caller and the workers
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Observations of one pixel, aligned with the design matrix rows
#[derive(Debug, Clone)]
pub struct PixelObservation {
    /// Unwrapped phase, NaN where the observation is invalid
    pub phase: Vec<f64>,
    /// Weight per pair, zero or non-finite marks the observation invalid
    pub weights: Vec<f64>,
}

impl PixelObservation {
    pub fn is_valid(&self, row: usize) -> bool {
        let phase = self.phase.get(row).copied().unwrap_or(f64::NAN);
        let weight = self.weights.get(row).copied().unwrap_or(0.0);
        phase.is_finite() && weight.is_finite() && weight > 0.0
    }

    pub fn num_valid(&self) -> usize {
        (0..self.phase.len()).filter(|&k| self.is_valid(k)).count()
    }
}

/// Inverted time series of one pixel
#[derive(Debug, Clone)]
pub struct PixelTimeSeries {
    /// One value per registry epoch: 0 at the reference, NaN at excluded epochs
    pub values: Vec<f64>,
    /// Observation minus model per design row, NaN where invalid
    pub residuals: Vec<f64>,
    pub num_valid: usize,
    pub residual_rms: f64,
    pub temporal_coherence: f64,
    pub iterations: usize,
}

/// Outcome of a single pixel inversion
#[derive(Debug, Clone)]
pub enum PixelEstimate {
    Solved(PixelTimeSeries),
    Rejected(PixelStatus),
}

/// Stack-level inversion output
#[derive(Debug, Clone)]
pub struct InversionResult {
    /// (epoch, row, col), NaN where no estimate exists
    pub timeseries: Array3<f32>,
    pub temporal_coherence: Array2<f32>,
    /// RMS of each pixel's pair residuals
    pub residual_rms: Array2<f32>,
    /// (epoch, row, col) RMS of the residuals of pairs touching each epoch
    pub epoch_residual: Array3<f32>,
    pub num_valid_pairs: Array2<u32>,
    pub status: Array2<PixelStatus>,
    pub cancelled: bool,
}

impl InversionResult {
    pub fn count_status(&self, status: PixelStatus) -> usize {
        self.status.iter().filter(|&&s| s == status).count()
    }
}

struct BlockResult {
    row_start: usize,
    timeseries: Array3<f32>,
    temporal_coherence: Array2<f32>,
    residual_rms: Array2<f32>,
    epoch_residual: Array3<f32>,
    num_valid_pairs: Array2<u32>,
    status: Array2<PixelStatus>,
}

/// Weighted least-squares / robust inverter over a frozen design matrix
pub struct WeightedInverter {
    design: Arc<DesignMatrix>,
    params: InversionParams,
    /// Average coherence of each design row, fallback when no per-pixel coherence
    pair_coherence: Vec<f64>,
}

impl WeightedInverter {
    /// Create an inverter over a shared design matrix
    pub fn new(design: Arc<DesignMatrix>, network: &NetworkGraph, params: InversionParams) -> Self {
        let pair_coherence = design
            .pair_indices()
            .iter()
            .map(|&i| network.pairs()[i].avg_coherence)
            .collect();
        Self {
            design,
            params,
            pair_coherence,
        }
    }

    pub fn design(&self) -> &DesignMatrix {
        &self.design
    }

    pub fn params(&self) -> &InversionParams {
        &self.params
    }

    /// Map per-row coherence to weights; NaN coherence falls back to the pair average
    pub fn row_weights(&self, coherence: &[f64]) -> Vec<f64> {
        self.pair_coherence
            .iter()
            .enumerate()
            .map(|(k, &avg)| {
                let coh = coherence.get(k).copied().filter(|c| c.is_finite()).unwrap_or(avg);
                self.params.weight_func.weight(coh, self.params.num_looks)
            })
            .collect()
    }

    /// Invert one pixel; rejection carries the status to record
    pub fn invert_pixel(&self, obs: &PixelObservation) -> PixelEstimate {
        let m = self.design.nrows();
        let valid: Vec<bool> = (0..m).map(|k| obs.is_valid(k)).collect();
        let num_valid = valid.iter().filter(|&&v| v).count();

        if num_valid < self.params.min_num_pairs.max(1) {
            return PixelEstimate::Rejected(PixelStatus::InsufficientObservations);
        }
        if num_valid < self.design.ncols() || !self.spans_all_epochs(&valid) {
            return PixelEstimate::Rejected(PixelStatus::RankDeficient);
        }

        let uniform = num_valid == m && {
            let w0 = obs.weights[0];
            obs.weights.iter().all(|&w| (w - w0).abs() <= 1e-12 * w0.abs())
        };

        let mut solution = if uniform {
            let d = DVector::from_column_slice(&obs.phase[..m]);
            self.design.pseudo_inverse() * d
        } else {
            match self.solve_weighted(&valid, &obs.phase, &obs.weights) {
                Some(x) => x,
                None => return PixelEstimate::Rejected(PixelStatus::RankDeficient),
            }
        };

        let mut iterations = 1;
        if self.params.residual_norm == ResidualNorm::L1 {
            for _ in 0..self.params.max_iterations {
                let residuals = self.residuals(&valid, &obs.phase, &solution);
                let irls: Vec<f64> = (0..m)
                    .map(|k| {
                        if valid[k] {
                            obs.weights[k] / residuals[k].abs().max(IRLS_DELTA)
                        } else {
                            0.0
                        }
                    })
                    .collect();

                let Some(next) = self.solve_weighted(&valid, &obs.phase, &irls) else {
                    break;
                };
                iterations += 1;
                let change = (&next - &solution).amax();
                solution = next;
                if change < self.params.tolerance {
                    break;
                }
            }
        }

        let residuals = self.residuals(&valid, &obs.phase, &solution);
        let sum_sq: f64 = residuals.iter().filter(|r| r.is_finite()).map(|r| r * r).sum();

        PixelEstimate::Solved(PixelTimeSeries {
            values: self.design.expand(&solution),
            temporal_coherence: temporal_coherence(&residuals),
            residual_rms: (sum_sq / num_valid as f64).sqrt(),
            residuals,
            num_valid,
            iterations,
        })
    }

    /// Invert one pixel, surfacing a singular system as an error
    pub fn invert_pixel_at(
        &self,
        obs: &PixelObservation,
        pixel: PixelIndex,
    ) -> InsarResult<PixelTimeSeries> {
        match self.invert_pixel(obs) {
            PixelEstimate::Solved(ts) => Ok(ts),
            PixelEstimate::Rejected(PixelStatus::RankDeficient) => Err(InsarError::SingularSystem {
                row: pixel.0,
                col: pixel.1,
            }),
            PixelEstimate::Rejected(status) => Err(InsarError::Processing(format!(
                "Pixel ({}, {}) not inverted: {}",
                pixel.0, pixel.1, status
            ))),
        }
    }

    /// Valid rows must connect every unknown epoch to the reference epoch
    fn spans_all_epochs(&self, valid: &[bool]) -> bool {
        let mut uf = UnionFind::new(self.design.num_epochs());
        for (k, &(p, s)) in self.design.row_epochs().iter().enumerate() {
            if valid[k] {
                uf.union(p, s);
            }
        }
        let reference = self.design.reference_epoch();
        self.design
            .epoch_columns()
            .iter()
            .all(|&e| uf.equiv(e, reference))
    }

    /// Solve the weighted normal equations, exploiting two non-zeros per row
    fn solve_weighted(&self, valid: &[bool], phase: &[f64], weights: &[f64]) -> Option<DVector<f64>> {
        let n = self.design.ncols();
        let mut normal = DMatrix::<f64>::zeros(n, n);
        let mut rhs = DVector::<f64>::zeros(n);

        for (k, &(p, s)) in self.design.row_epochs().iter().enumerate() {
            if !valid[k] {
                continue;
            }
            let w = weights[k];
            let entries = [
                (self.design.column_of(p), -1.0),
                (self.design.column_of(s), 1.0),
            ];
            for &(ci, ai) in &entries {
                let Some(i) = ci else { continue };
                rhs[i] += w * ai * phase[k];
                for &(cj, aj) in &entries {
                    if let Some(j) = cj {
                        normal[(i, j)] += w * ai * aj;
                    }
                }
            }
        }

        Cholesky::new(normal).map(|chol| chol.solve(&rhs))
    }

    fn residuals(&self, valid: &[bool], phase: &[f64], solution: &DVector<f64>) -> Vec<f64> {
        self.design
            .row_epochs()
            .iter()
            .enumerate()
            .map(|(k, &(p, s))| {
                if !valid[k] {
                    return f64::NAN;
                }
                let at = |e: usize| self.design.column_of(e).map_or(0.0, |c| solution[c]);
                phase[k] - (at(s) - at(p))
            })
            .collect()
    }

    /// Assemble the observation vector of one pixel from the stack
    pub fn gather_pixel(&self, stack: &PairStack, row: usize, col: usize) -> PixelObservation {
        let m = self.design.nrows();
        let mut phase = Vec::with_capacity(m);
        let mut coherence = Vec::with_capacity(m);

        for &p in self.design.pair_indices() {
            let mut value = stack.phase[[p, row, col]] as f64;
            let coh = stack
                .coherence
                .as_ref()
                .map_or(f64::NAN, |c| c[[p, row, col]] as f64);

            match self.params.mask_dataset {
                ObservationMask::None => {}
                ObservationMask::Coherence => {
                    if !(coh >= self.params.mask_threshold) {
                        value = f64::NAN;
                    }
                }
                ObservationMask::ConnectComponent => {
                    let label = stack.conn_comp.as_ref().map_or(1, |cc| cc[[p, row, col]]);
                    if label == 0 {
                        value = f64::NAN;
                    }
                }
            }

            phase.push(value);
            coherence.push(coh);
        }

        let weights = self.row_weights(&coherence);
        PixelObservation { phase, weights }
    }

    /// Invert every pixel of the stack in row blocks
    pub fn invert_stack(
        &self,
        stack: &PairStack,
        validity_mask: Option<&Mask>,
        cancel: Option<&CancellationToken>,
    ) -> InsarResult<InversionResult> {
        self.params.validate()?;
        stack.validate()?;
        let (rows, cols) = stack.shape();

        if let Some(&bad) = self.design.pair_indices().iter().find(|&&p| p >= stack.num_pairs()) {
            return Err(InsarError::InvalidFormat(format!(
                "Pair {} has no layer in a stack of {} pairs",
                bad,
                stack.num_pairs()
            )));
        }
        if let Some(mask) = validity_mask {
            if mask.dim() != (rows, cols) {
                return Err(InsarError::InvalidFormat(format!(
                    "Validity mask shape {:?} does not match grid {:?}",
                    mask.dim(),
                    (rows, cols)
                )));
            }
        }
        match self.params.mask_dataset {
            ObservationMask::Coherence if stack.coherence.is_none() => {
                return Err(InsarError::Configuration(
                    "Coherence masking requested but no coherence stack was provided".to_string(),
                ))
            }
            ObservationMask::ConnectComponent if stack.conn_comp.is_none() => {
                return Err(InsarError::Configuration(
                    "Connected component masking requested but no labels were provided"
                        .to_string(),
                ))
            }
            _ => {}
        }

        log::info!(
            "Inverting {} x {} pixels: {} pairs, {} unknown epochs, weight {}, norm {:?}",
            rows,
            cols,
            self.design.nrows(),
            self.design.ncols(),
            self.params.weight_func,
            self.params.residual_norm
        );

        let block_rows = self.params.block_rows.max(1);
        let blocks: Vec<(usize, usize)> = (0..rows)
            .step_by(block_rows)
            .map(|r0| (r0, (r0 + block_rows).min(rows)))
            .collect();

        let block_results = self.dispatch_blocks(&blocks, stack, validity_mask, cancel);

        let num_epochs = self.design.num_epochs();
        let mut result = InversionResult {
            timeseries: Array3::from_elem((num_epochs, rows, cols), f32::NAN),
            temporal_coherence: Array2::from_elem((rows, cols), f32::NAN),
            residual_rms: Array2::from_elem((rows, cols), f32::NAN),
            epoch_residual: Array3::from_elem((num_epochs, rows, cols), f32::NAN),
            num_valid_pairs: Array2::zeros((rows, cols)),
            status: Array2::from_elem((rows, cols), PixelStatus::NotProcessed),
            cancelled: false,
        };

        for block in block_results {
            let Some(block) = block else {
                result.cancelled = true;
                continue;
            };
            let r0 = block.row_start;
            let r1 = r0 + block.status.nrows();
            result.timeseries.slice_mut(s![.., r0..r1, ..]).assign(&block.timeseries);
            result.epoch_residual.slice_mut(s![.., r0..r1, ..]).assign(&block.epoch_residual);
            result.temporal_coherence.slice_mut(s![r0..r1, ..]).assign(&block.temporal_coherence);
            result.residual_rms.slice_mut(s![r0..r1, ..]).assign(&block.residual_rms);
            result.num_valid_pairs.slice_mut(s![r0..r1, ..]).assign(&block.num_valid_pairs);
            result.status.slice_mut(s![r0..r1, ..]).assign(&block.status);
        }

        if result.cancelled {
            log::warn!(
                "Inversion cancelled, {} pixels not processed",
                result.count_status(PixelStatus::NotProcessed)
            );
        }
        log::info!(
            "Inversion finished: {} inverted, {} masked, {} insufficient, {} rank deficient",
            result.count_status(PixelStatus::Valid),
            result.count_status(PixelStatus::MaskedOut),
            result.count_status(PixelStatus::InsufficientObservations),
            result.count_status(PixelStatus::RankDeficient)
        );

        Ok(result)
    }

    #[cfg(feature = "parallel")]
    fn dispatch_blocks(
        &self,
        blocks: &[(usize, usize)],
        stack: &PairStack,
        validity_mask: Option<&Mask>,
        cancel: Option<&CancellationToken>,
    ) -> Vec<Option<BlockResult>> {
        use rayon::prelude::*;

        blocks
            .par_iter()
            .map(|&(r0, r1)| {
                if cancel.map_or(false, CancellationToken::is_cancelled) {
                    return None;
                }
                Some(self.process_block(r0, r1, stack, validity_mask))
            })
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn dispatch_blocks(
        &self,
        blocks: &[(usize, usize)],
        stack: &PairStack,
        validity_mask: Option<&Mask>,
        cancel: Option<&CancellationToken>,
    ) -> Vec<Option<BlockResult>> {
        blocks
            .iter()
            .map(|&(r0, r1)| {
                if cancel.map_or(false, CancellationToken::is_cancelled) {
                    return None;
                }
                Some(self.process_block(r0, r1, stack, validity_mask))
            })
            .collect()
    }

    fn process_block(
        &self,
        r0: usize,
        r1: usize,
        stack: &PairStack,
        validity_mask: Option<&Mask>,
    ) -> BlockResult {
        let (_, cols) = stack.shape();
        let nrows = r1 - r0;
        let num_epochs = self.design.num_epochs();

        let mut block = BlockResult {
            row_start: r0,
            timeseries: Array3::from_elem((num_epochs, nrows, cols), f32::NAN),
            temporal_coherence: Array2::from_elem((nrows, cols), f32::NAN),
            residual_rms: Array2::from_elem((nrows, cols), f32::NAN),
            epoch_residual: Array3::from_elem((num_epochs, nrows, cols), f32::NAN),
            num_valid_pairs: Array2::zeros((nrows, cols)),
            status: Array2::from_elem((nrows, cols), PixelStatus::MaskedOut),
        };

        let mut sum_sq = vec![0.0f64; num_epochs];
        let mut count = vec![0usize; num_epochs];

        for row in r0..r1 {
            let local = row - r0;
            for col in 0..cols {
                if validity_mask.map_or(false, |mask| !mask[[row, col]]) {
                    continue;
                }

                let obs = self.gather_pixel(stack, row, col);
                block.num_valid_pairs[[local, col]] = obs.num_valid() as u32;

                let ts = match self.invert_pixel(&obs) {
                    PixelEstimate::Solved(ts) => ts,
                    PixelEstimate::Rejected(status) => {
                        block.status[[local, col]] = status;
                        continue;
                    }
                };

                for (e, &v) in ts.values.iter().enumerate() {
                    block.timeseries[[e, local, col]] = v as f32;
                }
                block.temporal_coherence[[local, col]] = ts.temporal_coherence as f32;
                block.residual_rms[[local, col]] = ts.residual_rms as f32;
                block.status[[local, col]] = PixelStatus::Valid;

                sum_sq.iter_mut().for_each(|v| *v = 0.0);
                count.iter_mut().for_each(|v| *v = 0);
                for (k, &(p, s)) in self.design.row_epochs().iter().enumerate() {
                    let r = ts.residuals[k];
                    if r.is_finite() {
                        for e in [p, s] {
                            sum_sq[e] += r * r;
                            count[e] += 1;
                        }
                    }
                }
                for e in 0..num_epochs {
                    if count[e] > 0 {
                        block.epoch_residual[[e, local, col]] =
                            (sum_sq[e] / count[e] as f64).sqrt() as f32;
                    }
                }
            }
        }

        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::design_matrix::DesignMatrixBuilder;
    use crate::core::epochs::parse_date;
    use crate::core::network::PairMetadata;

    fn complete_network(n: usize) -> NetworkGraph {
        let dates: Vec<_> = (0..n)
            .map(|i| parse_date("20100101").unwrap() + chrono::Duration::days(12 * i as i64))
            .collect();
        let mut records = Vec::new();
        for i in 0..n {
            for j in (i + 1)..n {
                records.push(PairMetadata {
                    date1: dates[i],
                    date2: dates[j],
                    perp_baseline: 0.0,
                    avg_coherence: 0.8,
                });
            }
        }
        NetworkGraph::from_metadata(&records).unwrap()
    }

    fn inverter(network: &NetworkGraph, params: InversionParams) -> WeightedInverter {
        let design = Arc::new(DesignMatrixBuilder::build(network, None).unwrap());
        WeightedInverter::new(design, network, params)
    }

    fn observe(network: &NetworkGraph, truth: &[f64]) -> Vec<f64> {
        network
            .pairs()
            .iter()
            .map(|p| truth[p.secondary] - truth[p.primary])
            .collect()
    }

    #[test]
    fn test_noise_free_recovery() {
        let network = complete_network(5);
        let inv = inverter(&network, InversionParams::default());
        let truth = [0.0, 1.0, -0.5, 2.0, 3.5];
        let obs = PixelObservation {
            phase: observe(&network, &truth),
            weights: inv.row_weights(&[]),
        };

        let ts = inv.invert_pixel_at(&obs, (0, 0)).unwrap();
        for (est, t) in ts.values.iter().zip(truth.iter()) {
            assert!((est - t).abs() < 1e-9);
        }
        assert!((ts.temporal_coherence - 1.0).abs() < 1e-9);
        assert!(ts.residual_rms < 1e-9);
    }

    #[test]
    fn test_weighted_path_matches_truth() {
        let network = complete_network(4);
        let inv = inverter(&network, InversionParams::default());
        let truth = [0.0, 0.3, 0.9, 1.2];
        let coherence = vec![0.9, 0.3, 0.5, 0.7, 0.2, 0.6];
        let obs = PixelObservation {
            phase: observe(&network, &truth),
            weights: inv.row_weights(&coherence),
        };

        let ts = inv.invert_pixel_at(&obs, (0, 0)).unwrap();
        assert!((ts.values[3] - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_l1_beats_l2_with_outlier() {
        let network = complete_network(5);
        let truth = [0.0, 1.0, 2.0, 3.0, 4.0];
        let mut phase = observe(&network, &truth);
        phase[4] += 6.0;

        let l2 = inverter(&network, InversionParams {
            weight_func: WeightFunction::Sbas,
            ..Default::default()
        });
        let l1 = inverter(&network, InversionParams {
            weight_func: WeightFunction::Sbas,
            residual_norm: ResidualNorm::L1,
            ..Default::default()
        });
        let obs = PixelObservation {
            weights: vec![1.0; phase.len()],
            phase,
        };

        let ts2 = l2.invert_pixel_at(&obs, (0, 0)).unwrap();
        let ts1 = l1.invert_pixel_at(&obs, (0, 0)).unwrap();

        let err = |v: &[f64]| -> f64 {
            v.iter().zip(truth.iter()).map(|(a, b)| (a - b).abs()).sum()
        };
        assert!(ts2.residual_rms > 0.5);
        assert!(ts2.temporal_coherence < 0.99);
        assert!(err(&ts1.values) < err(&ts2.values));
        assert!(err(&ts1.values) < 1e-3);
    }

    #[test]
    fn test_insufficient_and_rank_deficient() {
        let network = complete_network(4);
        let inv = inverter(&network, InversionParams {
            min_num_pairs: 4,
            ..Default::default()
        });
        let truth = [0.0, 1.0, 2.0, 3.0];
        let mut phase = observe(&network, &truth);
        let weights = inv.row_weights(&[]);

        phase[0] = f64::NAN;
        phase[1] = f64::NAN;
        phase[2] = f64::NAN;
        let obs = PixelObservation { phase: phase.clone(), weights: weights.clone() };
        assert!(matches!(
            inv.invert_pixel(&obs),
            PixelEstimate::Rejected(PixelStatus::InsufficientObservations)
        ));

        // every pair touching epoch 3 missing
        let mut phase = observe(&network, &truth);
        phase[2] = f64::NAN;
        phase[4] = f64::NAN;
        phase[5] = f64::NAN;
        let obs = PixelObservation { phase, weights };
        let inv = inverter(&network, InversionParams::default());
        assert!(matches!(
            inv.invert_pixel(&obs),
            PixelEstimate::Rejected(PixelStatus::RankDeficient)
        ));
        assert!(matches!(
            inv.invert_pixel_at(&obs, (3, 7)),
            Err(InsarError::SingularSystem { row: 3, col: 7 })
        ));
    }

    #[test]
    fn test_invert_stack_with_mask_and_cancel() {
        let network = complete_network(4);
        let inv = inverter(&network, InversionParams {
            block_rows: 1,
            ..Default::default()
        });
        let truth = [0.0, 1.0, 2.0, 3.0];
        let obs = observe(&network, &truth);

        let mut phase = Array3::<f32>::zeros((obs.len(), 3, 2));
        for (k, &v) in obs.iter().enumerate() {
            phase.slice_mut(s![k, .., ..]).fill(v as f32);
        }
        let stack = PairStack::new(phase);
        let mut mask = Mask::from_elem((3, 2), true);
        mask[[1, 1]] = false;

        let result = inv.invert_stack(&stack, Some(&mask), None).unwrap();
        assert!(!result.cancelled);
        assert_eq!(result.status[[1, 1]], PixelStatus::MaskedOut);
        assert!(result.timeseries[[2, 1, 1]].is_nan());
        assert_eq!(result.status[[0, 0]], PixelStatus::Valid);
        assert!((result.timeseries[[3, 2, 0]] - 3.0).abs() < 1e-5);
        assert_eq!(result.num_valid_pairs[[0, 0]], 6);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = inv.invert_stack(&stack, None, Some(&cancel)).unwrap();
        assert!(result.cancelled);
        assert_eq!(result.count_status(PixelStatus::NotProcessed), 6);
    }

    /// Three epochs, pairs 0-1, 0-2, 1-2, identical phase in every pixel
    fn triangle_stack(cols: usize) -> (NetworkGraph, PairStack) {
        let network = complete_network(3);
        let obs = observe(&network, &[0.0, 1.0, 2.0]);
        let mut phase = Array3::<f32>::zeros((obs.len(), 1, cols));
        for (k, &v) in obs.iter().enumerate() {
            phase.slice_mut(s![k, .., ..]).fill(v as f32);
        }
        (network, PairStack::new(phase))
    }

    #[test]
    fn test_coherence_observation_mask() {
        let (network, stack) = triangle_stack(2);
        let mut coherence = Array3::<f32>::from_elem((3, 1, 2), 0.9);
        coherence[[1, 0, 0]] = 0.1;

        let params = InversionParams {
            mask_dataset: ObservationMask::Coherence,
            mask_threshold: 0.4,
            ..Default::default()
        };
        let inv = inverter(&network, params);
        assert!(matches!(
            inv.invert_stack(&stack, None, None),
            Err(InsarError::Configuration(_))
        ));

        let stack = stack.with_coherence(coherence);
        let result = inv.invert_stack(&stack, None, None).unwrap();

        assert_eq!(result.num_valid_pairs[[0, 0]], 2);
        assert_eq!(result.num_valid_pairs[[0, 1]], 3);
        assert_eq!(result.status[[0, 0]], PixelStatus::Valid);
        for (e, t) in [0.0f32, 1.0, 2.0].iter().enumerate() {
            assert!((result.timeseries[[e, 0, 0]] - t).abs() < 1e-5);
        }
    }

    #[test]
    fn test_connect_component_observation_mask() {
        let (network, stack) = triangle_stack(3);
        let mut labels = Array3::<u16>::from_elem((3, 1, 3), 1);
        // pixel 0 loses pair 0-2; pixel 2 loses both pairs touching epoch 0
        labels[[1, 0, 0]] = 0;
        labels[[0, 0, 2]] = 0;
        labels[[1, 0, 2]] = 0;
        labels[[2, 0, 1]] = 2;
        let stack = stack.with_conn_comp(labels);

        let inv = inverter(&network, InversionParams {
            mask_dataset: ObservationMask::ConnectComponent,
            ..Default::default()
        });
        let result = inv.invert_stack(&stack, None, None).unwrap();

        assert_eq!(result.num_valid_pairs.row(0).to_vec(), vec![2, 3, 1]);
        assert_eq!(result.status[[0, 0]], PixelStatus::Valid);
        assert_eq!(result.status[[0, 1]], PixelStatus::Valid);
        assert_eq!(result.status[[0, 2]], PixelStatus::RankDeficient);
        assert!((result.timeseries[[2, 0, 0]] - 2.0).abs() < 1e-5);
        assert!(result.timeseries[[2, 0, 2]].is_nan());
    }
}

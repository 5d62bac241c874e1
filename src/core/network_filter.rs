use crate::core::epochs::{format_date12, format_date8, ExclusionReason};
use crate::core::network::{NetworkGraph, PairExclusion};
use crate::types::{InsarError, InsarResult};
use chrono::NaiveDate;
use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Network modification parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkFilterParams {
    /// Acquisitions to drop together with all their pairs
    pub exclude_dates: Vec<NaiveDate>,
    /// Candidate pair indices to drop (0-based)
    pub exclude_pair_indices: Vec<usize>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Maximum temporal baseline in days
    pub max_temporal_baseline: Option<f64>,
    /// Keep 11-12 month pairs even above the temporal baseline limit
    pub keep_seasonal: bool,
    /// Maximum absolute perpendicular baseline in meters
    pub max_perp_baseline: Option<f64>,
    /// Exclude pairs with average coherence below `min_coherence`
    pub coherence_based: bool,
    pub min_coherence: f64,
    /// Restore excluded pairs when filtering disconnects the network
    pub keep_min_span_tree: bool,
    /// Accept a disconnected network by dropping orphaned epochs
    pub allow_disconnected: bool,
    /// Backbone pairs kept regardless of pair-level rules
    pub reference_pairs: Vec<(NaiveDate, NaiveDate)>,
}

impl Default for NetworkFilterParams {
    fn default() -> Self {
        Self {
            exclude_dates: Vec::new(),
            exclude_pair_indices: Vec::new(),
            start_date: None,
            end_date: None,
            max_temporal_baseline: None,
            keep_seasonal: false,
            max_perp_baseline: None,
            coherence_based: false,
            min_coherence: 0.5,
            keep_min_span_tree: true,
            allow_disconnected: false,
            reference_pairs: Vec::new(),
        }
    }
}

impl NetworkFilterParams {
    pub fn validate(&self) -> InsarResult<()> {
        if !(0.0..=1.0).contains(&self.min_coherence) {
            return Err(InsarError::Configuration(format!(
                "network.minCoherence must be within [0, 1], got {}",
                self.min_coherence
            )));
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(InsarError::Configuration(format!(
                    "network.startDate {} is after network.endDate {}",
                    format_date8(start),
                    format_date8(end)
                )));
            }
        }
        if let Some(max) = self.max_temporal_baseline {
            if !(max > 0.0) {
                return Err(InsarError::Configuration(format!(
                    "network.tempBaseMax must be positive, got {}",
                    max
                )));
            }
        }
        if let Some(max) = self.max_perp_baseline {
            if !(max > 0.0) {
                return Err(InsarError::Configuration(format!(
                    "network.perpBaseMax must be positive, got {}",
                    max
                )));
            }
        }
        Ok(())
    }
}

/// Audit trail of one filtering run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterReport {
    pub num_candidates: usize,
    pub num_retained: usize,
    /// (pair index, reason) for every pair left out
    pub excluded: Vec<(usize, PairExclusion)>,
    /// Pairs brought back to keep the network connected
    pub restored: Vec<usize>,
    /// Reference-network pairs kept against pair-level rules
    pub forced_reference: Vec<usize>,
    /// Epochs unreachable from the main network (YYYYMMDD)
    pub orphaned_epochs: Vec<String>,
}

impl FilterReport {
    /// The per-epoch disconnection as an error value, if any epoch was orphaned
    pub fn disconnection(&self) -> Option<InsarError> {
        if self.orphaned_epochs.is_empty() {
            None
        } else {
            Some(InsarError::DisconnectedNetwork {
                epochs: self.orphaned_epochs.clone(),
            })
        }
    }
}

/// Seasonal pair: temporal baseline of 11 or 12 whole months
fn is_seasonal(temporal_baseline: f64) -> bool {
    let months = (temporal_baseline / 30.0).floor();
    months == 11.0 || months == 12.0
}

/// Applies exclusion rules while keeping the epoch graph connected
pub struct NetworkFilter {
    params: NetworkFilterParams,
}

impl NetworkFilter {
    /// Create a new network filter with default parameters
    pub fn new() -> Self {
        Self {
            params: NetworkFilterParams::default(),
        }
    }

    /// Create a network filter with custom parameters
    pub fn with_params(params: NetworkFilterParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &NetworkFilterParams {
        &self.params
    }

    /// Filter the network in place and return what was changed
    pub fn apply(&self, network: &mut NetworkGraph) -> InsarResult<FilterReport> {
        log::info!(
            "Modifying network of {} interferograms over {} epochs",
            network.num_pairs(),
            network.epochs().len()
        );
        log::debug!("Network filter parameters: {:?}", self.params);

        self.params.validate()?;
        if let Some(&bad) = self
            .params
            .exclude_pair_indices
            .iter()
            .find(|&&i| i >= network.num_pairs())
        {
            return Err(InsarError::Configuration(format!(
                "network.excludeIfgIndex {} out of range (network has {} pairs)",
                bad,
                network.num_pairs()
            )));
        }

        network.reset();
        self.exclude_epochs(network);
        self.exclude_pairs(network);
        let forced_reference = self.merge_reference_network(network);

        let mut restored = Vec::new();
        if network.components().len() > 1 && self.params.keep_min_span_tree {
            restored = self.repair_connectivity(network);
        }

        let orphaned_epochs = self.drop_orphans(network)?;

        if network.epochs().num_active() < 2 || network.num_included() == 0 {
            return Err(InsarError::DisconnectedNetwork {
                epochs: network
                    .epochs()
                    .epochs()
                    .iter()
                    .filter(|e| e.is_excluded())
                    .map(|e| e.label())
                    .collect(),
            });
        }

        let excluded = network
            .pairs()
            .iter()
            .filter_map(|p| p.exclusion.map(|r| (p.index, r)))
            .collect::<Vec<_>>();

        let report = FilterReport {
            num_candidates: network.num_pairs(),
            num_retained: network.num_included(),
            excluded,
            restored,
            forced_reference,
            orphaned_epochs,
        };

        log::info!(
            "Network modified: {} of {} pairs retained ({} restored for connectivity)",
            report.num_retained,
            report.num_candidates,
            report.restored.len()
        );
        Ok(report)
    }

    fn exclude_epochs(&self, network: &mut NetworkGraph) {
        let exclude: HashSet<NaiveDate> = self.params.exclude_dates.iter().copied().collect();

        for date in &exclude {
            if network.epochs().index_of(*date).is_none() {
                log::warn!("Excluded date {} is not in the network", format_date8(*date));
            }
        }

        let dates: Vec<NaiveDate> = network.epochs().epochs().iter().map(|e| e.date).collect();
        for (index, date) in dates.into_iter().enumerate() {
            if exclude.contains(&date) {
                network.epochs_mut().mark_excluded(index, ExclusionReason::ExcludedDate);
            } else if self.params.start_date.map_or(false, |start| date < start)
                || self.params.end_date.map_or(false, |end| date > end)
            {
                network
                    .epochs_mut()
                    .mark_excluded(index, ExclusionReason::OutsideDateRange);
            }
        }
    }

    fn exclude_pairs(&self, network: &mut NetworkGraph) {
        let exclude_idx: HashSet<usize> = self.params.exclude_pair_indices.iter().copied().collect();

        for index in 0..network.num_pairs() {
            let pair = &network.pairs()[index];
            let reason = if network.epochs().is_excluded(pair.primary)
                || network.epochs().is_excluded(pair.secondary)
            {
                Some(PairExclusion::ExcludedEpoch)
            } else if exclude_idx.contains(&index) {
                Some(PairExclusion::ExcludedIndex)
            } else if self.params.max_temporal_baseline.map_or(false, |max| {
                pair.temporal_baseline > max
                    && !(self.params.keep_seasonal && is_seasonal(pair.temporal_baseline))
            }) {
                Some(PairExclusion::TemporalBaseline)
            } else if self
                .params
                .max_perp_baseline
                .map_or(false, |max| pair.perp_baseline.abs() > max)
            {
                Some(PairExclusion::PerpBaseline)
            } else if self.params.coherence_based && pair.avg_coherence < self.params.min_coherence {
                Some(PairExclusion::Coherence)
            } else {
                None
            };

            if let Some(reason) = reason {
                network.exclude(index, reason);
            }
        }
    }

    /// Re-include backbone pairs; epoch-level exclusions still apply
    fn merge_reference_network(&self, network: &mut NetworkGraph) -> Vec<usize> {
        let mut forced = Vec::new();
        for &(date1, date2) in &self.params.reference_pairs {
            let Some(index) = network.pair_index(date1, date2) else {
                log::warn!(
                    "Reference network pair {} not found among candidates",
                    format_date12(date1, date2)
                );
                continue;
            };

            let pair = &network.pairs()[index];
            if pair.exclusion == Some(PairExclusion::ExcludedEpoch) {
                log::warn!(
                    "Reference network pair {} touches an excluded epoch, skipped",
                    network.date12(pair)
                );
                continue;
            }
            if !pair.included {
                network.include(index);
                forced.push(index);
            }
        }
        forced
    }

    /// Restore the fewest excluded pairs that reconnect the active epochs,
    /// shortest temporal baseline first, then shortest perpendicular baseline
    fn repair_connectivity(&self, network: &mut NetworkGraph) -> Vec<usize> {
        let epochs = network.epochs();
        let mut uf = UnionFind::new(epochs.len());
        for pair in network.pairs().iter().filter(|p| p.included) {
            uf.union(pair.primary, pair.secondary);
        }

        let mut candidates: Vec<usize> = network
            .pairs()
            .iter()
            .filter(|p| {
                !p.included && !epochs.is_excluded(p.primary) && !epochs.is_excluded(p.secondary)
            })
            .map(|p| p.index)
            .collect();

        let pairs = network.pairs();
        candidates.sort_by(|&a, &b| {
            let (pa, pb) = (&pairs[a], &pairs[b]);
            pa.temporal_baseline
                .total_cmp(&pb.temporal_baseline)
                .then(pa.perp_baseline.abs().total_cmp(&pb.perp_baseline.abs()))
                .then(a.cmp(&b))
        });

        let mut restored = Vec::new();
        for index in candidates {
            let pair = &network.pairs()[index];
            if uf.union(pair.primary, pair.secondary) {
                log::warn!(
                    "Restoring pair {} ({:?}) to keep the network connected",
                    network.date12(pair),
                    pair.exclusion
                );
                restored.push(index);
            }
        }

        for &index in &restored {
            network.include(index);
        }
        restored
    }

    /// Exclude epochs outside the main component, or fail when that is not accepted
    fn drop_orphans(&self, network: &mut NetworkGraph) -> InsarResult<Vec<String>> {
        let components = network.components();
        if components.len() <= 1 {
            return Ok(Vec::new());
        }

        let mut orphans: Vec<usize> = components[1..].iter().flatten().copied().collect();
        orphans.sort_unstable();
        let labels = network.epochs().labels(&orphans);

        if !self.params.keep_min_span_tree && !self.params.allow_disconnected {
            return Err(InsarError::DisconnectedNetwork { epochs: labels });
        }

        log::warn!(
            "Network is disconnected, dropping unreachable epochs: {}",
            labels.join(", ")
        );

        for &epoch in &orphans {
            network
                .epochs_mut()
                .mark_excluded(epoch, ExclusionReason::Disconnected);
        }
        let touching: Vec<usize> = network
            .pairs()
            .iter()
            .filter(|p| orphans.contains(&p.primary) || orphans.contains(&p.secondary))
            .map(|p| p.index)
            .collect();
        for index in touching {
            network.exclude(index, PairExclusion::ExcludedEpoch);
        }

        Ok(labels)
    }
}

impl Default for NetworkFilter {
    fn default() -> Self {
        Self::new()
    }
}

//! Interferogram network: epochs as nodes, pairs as edges.
//!
//! Pairs are never deleted. Exclusion is a flag plus a reason so every
//! filtering decision stays auditable.

use crate::core::epochs::{format_date12, EpochRegistry};
use crate::types::{InsarError, InsarResult};
use chrono::NaiveDate;
use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Pair metadata as delivered by the interferogram loader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairMetadata {
    pub date1: NaiveDate,
    pub date2: NaiveDate,
    /// Perpendicular baseline in meters
    pub perp_baseline: f64,
    /// Spatially averaged coherence, 0-1
    pub avg_coherence: f64,
}

/// Why a pair was left out of the retained network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairExclusion {
    ExcludedIndex,
    ExcludedEpoch,
    TemporalBaseline,
    PerpBaseline,
    Coherence,
}

/// Interferogram between two epochs (an edge of the network)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pair {
    /// Position in the candidate list, also the layer in the phase stack
    pub index: usize,
    pub primary: usize,
    pub secondary: usize,
    /// Temporal baseline in days
    pub temporal_baseline: f64,
    /// Perpendicular baseline in meters
    pub perp_baseline: f64,
    pub avg_coherence: f64,
    pub included: bool,
    pub exclusion: Option<PairExclusion>,
}

impl Pair {
    pub fn touches(&self, epoch: usize) -> bool {
        self.primary == epoch || self.secondary == epoch
    }
}

/// Epoch/pair graph with per-edge attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkGraph {
    epochs: EpochRegistry,
    pairs: Vec<Pair>,
}

impl NetworkGraph {
    /// Build the network from loader metadata, enumerating epochs from the pairs
    pub fn from_metadata(records: &[PairMetadata]) -> InsarResult<Self> {
        let dates: Vec<(NaiveDate, NaiveDate)> =
            records.iter().map(|r| (r.date1, r.date2)).collect();
        let epochs = EpochRegistry::from_pairs(&dates)?;
        Self::new(epochs, records)
    }

    /// Build the network over an existing epoch registry
    pub fn new(epochs: EpochRegistry, records: &[PairMetadata]) -> InsarResult<Self> {
        if records.is_empty() {
            return Err(InsarError::InvalidFormat(
                "Network has no interferograms".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut pairs = Vec::with_capacity(records.len());

        for (index, record) in records.iter().enumerate() {
            let label = format_date12(record.date1, record.date2);
            if record.date1 >= record.date2 {
                return Err(InsarError::InvalidFormat(format!(
                    "Pair {} ({}): primary date must precede secondary date",
                    index, label
                )));
            }

            let primary = epochs.index_of(record.date1).ok_or_else(|| {
                InsarError::InvalidFormat(format!("Pair {}: unknown date {}", index, record.date1))
            })?;
            let secondary = epochs.index_of(record.date2).ok_or_else(|| {
                InsarError::InvalidFormat(format!("Pair {}: unknown date {}", index, record.date2))
            })?;

            if !seen.insert((primary, secondary)) {
                return Err(InsarError::InvalidFormat(format!(
                    "Duplicate pair {} at index {}",
                    label, index
                )));
            }

            pairs.push(Pair {
                index,
                primary,
                secondary,
                temporal_baseline: epochs.temporal_baseline_days(primary, secondary) as f64,
                perp_baseline: record.perp_baseline,
                avg_coherence: record.avg_coherence,
                included: true,
                exclusion: None,
            });
        }

        log::debug!(
            "Network built: {} epochs, {} pairs",
            epochs.len(),
            pairs.len()
        );

        Ok(Self { epochs, pairs })
    }

    pub fn epochs(&self) -> &EpochRegistry {
        &self.epochs
    }

    pub fn epochs_mut(&mut self) -> &mut EpochRegistry {
        &mut self.epochs
    }

    pub fn pairs(&self) -> &[Pair] {
        &self.pairs
    }

    pub fn pair(&self, index: usize) -> Option<&Pair> {
        self.pairs.get(index)
    }

    pub fn num_pairs(&self) -> usize {
        self.pairs.len()
    }

    pub fn num_included(&self) -> usize {
        self.pairs.iter().filter(|p| p.included).count()
    }

    /// Indices of retained pairs, in candidate order
    pub fn included_indices(&self) -> Vec<usize> {
        self.pairs
            .iter()
            .filter(|p| p.included)
            .map(|p| p.index)
            .collect()
    }

    pub fn pair_index(&self, date1: NaiveDate, date2: NaiveDate) -> Option<usize> {
        let (first, second) = if date1 <= date2 { (date1, date2) } else { (date2, date1) };
        let primary = self.epochs.index_of(first)?;
        let secondary = self.epochs.index_of(second)?;
        self.pairs
            .iter()
            .position(|p| p.primary == primary && p.secondary == secondary)
    }

    /// `YYMMDD-YYMMDD` labels of the (retained) pairs
    pub fn date12_list(&self, included_only: bool) -> Vec<String> {
        self.pairs
            .iter()
            .filter(|p| !included_only || p.included)
            .map(|p| self.date12(p))
            .collect()
    }

    pub fn date12(&self, pair: &Pair) -> String {
        format_date12(self.epochs.date(pair.primary), self.epochs.date(pair.secondary))
    }

    pub(crate) fn include(&mut self, index: usize) {
        let pair = &mut self.pairs[index];
        pair.included = true;
        pair.exclusion = None;
    }

    pub(crate) fn exclude(&mut self, index: usize, reason: PairExclusion) {
        let pair = &mut self.pairs[index];
        if pair.included {
            pair.included = false;
            pair.exclusion = Some(reason);
        }
    }

    /// Restore the unfiltered network
    pub fn reset(&mut self) {
        self.epochs.reset_exclusions();
        for pair in &mut self.pairs {
            pair.included = true;
            pair.exclusion = None;
        }
    }

    /// Union-find over epochs joined by the given pairs (active epochs only)
    fn union_find<'a, I>(&self, pairs: I) -> UnionFind<usize>
    where
        I: IntoIterator<Item = &'a Pair>,
    {
        let mut uf = UnionFind::new(self.epochs.len());
        for pair in pairs {
            if !self.epochs.is_excluded(pair.primary) && !self.epochs.is_excluded(pair.secondary) {
                uf.union(pair.primary, pair.secondary);
            }
        }
        uf
    }

    /// Connected components of active epochs over retained pairs,
    /// largest first (ties broken by earliest epoch)
    pub fn components(&self) -> Vec<Vec<usize>> {
        let uf = self.union_find(self.pairs.iter().filter(|p| p.included));
        self.group_components(&uf)
    }

    /// Connected components of active epochs over every candidate pair
    pub fn full_components(&self) -> Vec<Vec<usize>> {
        let uf = self.union_find(self.pairs.iter());
        self.group_components(&uf)
    }

    fn group_components(&self, uf: &UnionFind<usize>) -> Vec<Vec<usize>> {
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for idx in self.epochs.active_indices() {
            groups.entry(uf.find(idx)).or_default().push(idx);
        }
        let mut components: Vec<Vec<usize>> = groups.into_values().collect();
        components.sort_by(|a, b| b.len().cmp(&a.len()).then(a[0].cmp(&b[0])));
        components
    }

    /// Whether every active epoch is reachable over retained pairs
    pub fn is_connected(&self) -> bool {
        self.components().len() <= 1
    }
}

use crate::core::network::NetworkGraph;
use crate::types::{InsarError, InsarResult};
use nalgebra::{DMatrix, DVector};
use std::sync::Arc;

/// Incidence matrix of the retained network
///
/// One row per retained pair, one column per active epoch except the
/// reference epoch. Row k holds -1 at the primary and +1 at the secondary
/// epoch column. Frozen after construction and shared read-only.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    matrix: DMatrix<f64>,
    /// Candidate pair index of each row
    pair_indices: Vec<usize>,
    /// Epoch index of each column
    epoch_columns: Vec<usize>,
    /// Column of each epoch, None for the reference and excluded epochs
    column_lookup: Vec<Option<usize>>,
    /// (primary, secondary) epoch of each row
    row_epochs: Vec<(usize, usize)>,
    reference_epoch: usize,
    /// Unweighted pseudo-inverse, reused for fully observed pixels
    pseudo_inverse: DMatrix<f64>,
}

impl DesignMatrix {
    pub fn nrows(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn pseudo_inverse(&self) -> &DMatrix<f64> {
        &self.pseudo_inverse
    }

    pub fn pair_indices(&self) -> &[usize] {
        &self.pair_indices
    }

    pub fn epoch_columns(&self) -> &[usize] {
        &self.epoch_columns
    }

    pub fn row_epochs(&self) -> &[(usize, usize)] {
        &self.row_epochs
    }

    pub fn reference_epoch(&self) -> usize {
        self.reference_epoch
    }

    /// Total number of epochs in the registry, excluded ones included
    pub fn num_epochs(&self) -> usize {
        self.column_lookup.len()
    }

    pub fn column_of(&self, epoch: usize) -> Option<usize> {
        self.column_lookup.get(epoch).copied().flatten()
    }

    /// Coefficient of any epoch in a row; zero for the reference epoch
    pub fn coefficient(&self, row: usize, epoch: usize) -> f64 {
        match self.column_of(epoch) {
            Some(col) => self.matrix[(row, col)],
            None => 0.0,
        }
    }

    /// Whether this matrix was built from the network's current retained pairs
    pub fn matches_topology(&self, network: &NetworkGraph) -> bool {
        self.pair_indices == network.included_indices()
    }

    /// Spread a solution vector over all epochs: zero at the reference,
    /// NaN at excluded epochs
    pub fn expand(&self, solution: &DVector<f64>) -> Vec<f64> {
        let mut full = vec![f64::NAN; self.num_epochs()];
        full[self.reference_epoch] = 0.0;
        for (col, &epoch) in self.epoch_columns.iter().enumerate() {
            full[epoch] = solution[col];
        }
        full
    }
}

/// Builds the design matrix once per retained-pair topology
#[derive(Debug, Default)]
pub struct DesignMatrixBuilder {
    cached: Option<Arc<DesignMatrix>>,
}

impl DesignMatrixBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self { cached: None }
    }

    /// Return the cached matrix unless the retained pairs or the reference changed
    pub fn get_or_build(
        &mut self,
        network: &NetworkGraph,
        reference_epoch: Option<usize>,
    ) -> InsarResult<Arc<DesignMatrix>> {
        if let Some(cached) = &self.cached {
            let same_reference =
                reference_epoch.map_or(true, |r| r == cached.reference_epoch());
            if same_reference && cached.matches_topology(network) {
                log::debug!("Reusing design matrix ({} x {})", cached.nrows(), cached.ncols());
                return Ok(Arc::clone(cached));
            }
        }

        let built = Arc::new(Self::build(network, reference_epoch)?);
        self.cached = Some(Arc::clone(&built));
        Ok(built)
    }

    /// Pure construction from the retained pairs
    pub fn build(network: &NetworkGraph, reference_epoch: Option<usize>) -> InsarResult<DesignMatrix> {
        let epochs = network.epochs();
        let active = epochs.active_indices();

        let reference_epoch = match reference_epoch {
            Some(r) => r,
            None => *active.first().ok_or_else(|| {
                InsarError::Processing("No active epochs to build a design matrix".to_string())
            })?,
        };
        if epochs.is_excluded(reference_epoch) {
            return Err(InsarError::ReferenceSelection(format!(
                "Reference epoch index {} is excluded from the network",
                reference_epoch
            )));
        }

        let components = network.components();
        if components.len() > 1 {
            let orphans: Vec<usize> = components[1..].iter().flatten().copied().collect();
            return Err(InsarError::DisconnectedNetwork {
                epochs: epochs.labels(&orphans),
            });
        }

        let mut column_lookup = vec![None; epochs.len()];
        let epoch_columns: Vec<usize> = active
            .iter()
            .copied()
            .filter(|&e| e != reference_epoch)
            .collect();
        for (col, &epoch) in epoch_columns.iter().enumerate() {
            column_lookup[epoch] = Some(col);
        }

        let retained: Vec<_> = network.pairs().iter().filter(|p| p.included).collect();
        let mut matrix = DMatrix::<f64>::zeros(retained.len(), epoch_columns.len());
        let mut row_epochs = Vec::with_capacity(retained.len());

        for (row, pair) in retained.iter().enumerate() {
            if let Some(col) = column_lookup[pair.primary] {
                matrix[(row, col)] = -1.0;
            }
            if let Some(col) = column_lookup[pair.secondary] {
                matrix[(row, col)] = 1.0;
            }
            row_epochs.push((pair.primary, pair.secondary));
        }

        let pseudo_inverse = matrix
            .clone()
            .pseudo_inverse(1e-10)
            .map_err(|e| InsarError::Processing(format!("Pseudo-inverse failed: {}", e)))?;

        log::info!(
            "Design matrix built: {} pairs x {} epochs (reference epoch {})",
            matrix.nrows(),
            matrix.ncols(),
            epochs.date(reference_epoch)
        );

        Ok(DesignMatrix {
            matrix,
            pair_indices: retained.iter().map(|p| p.index).collect(),
            epoch_columns,
            column_lookup,
            row_epochs,
            reference_epoch,
            pseudo_inverse,
        })
    }
}

//! Network inversion stages

pub mod epochs;
pub mod network;
pub mod network_filter;
pub mod pair_selection;
pub mod design_matrix;
pub mod weights;
pub mod inversion;
pub mod quality;
pub mod reference;
pub mod temporal_filter;
pub mod processor;

// Re-export main types
pub use epochs::{Epoch, EpochRegistry, ExclusionReason};
pub use network::{NetworkGraph, Pair, PairExclusion, PairMetadata};
pub use network_filter::{FilterReport, NetworkFilter, NetworkFilterParams};
pub use pair_selection::{select_pairs, PairSelectionMethod};
pub use design_matrix::{DesignMatrix, DesignMatrixBuilder};
pub use weights::WeightFunction;
pub use inversion::{
    CancellationToken, InversionParams, InversionResult, ObservationMask, PixelEstimate,
    PixelObservation, PixelTimeSeries, ResidualNorm, WeightedInverter,
};
pub use quality::{QualityEstimator, QualityParams, RampType};
pub use reference::{PixelCandidates, ReferenceDate, ReferenceParams, ReferencePoint, ReferenceSelector};
pub use temporal_filter::{TemporalFilter, TemporalFilterParams};
pub use processor::{DisplacementUnit, NetworkInversionProcessor, RunInputs, TimeseriesProduct};

//! sbas: small-baseline subset network inversion for InSAR time series
//!
//! Turns a redundant network of unwrapped interferograms into per-pixel
//! displacement time series: network filtering with spanning-tree repair,
//! weighted L2 / robust L1 inversion over a shared design matrix, temporal
//! coherence gating and reference point anchoring.

pub mod types;
pub mod io;
pub mod core;
pub mod config;

#[cfg(feature = "python")]
mod python;

// Re-export main types
pub use crate::types::{InsarError, InsarResult, Mask, PairStack, PixelIndex, PixelStatus, Raster, RasterStack};
pub use crate::config::TimeseriesConfig;
pub use crate::core::{
    CancellationToken, EpochRegistry, NetworkFilter, NetworkGraph, NetworkInversionProcessor,
    PairMetadata, RunInputs, TimeseriesProduct, WeightFunction, WeightedInverter,
};

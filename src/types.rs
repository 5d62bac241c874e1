use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};

/// Unwrapped interferometric phase in radians
pub type Phase = f32;

/// 2D real raster (row x col)
pub type Raster = Array2<f32>;

/// 3D stack of rasters (layer x row x col), layers are pairs or epochs
pub type RasterStack = Array3<f32>;

/// 2D boolean mask aligned with the observation grid
pub type Mask = Array2<bool>;

/// Pixel location as (row, col)
pub type PixelIndex = (usize, usize);

/// Per-pixel outcome of the network inversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelStatus {
    /// Inverted and above the temporal coherence threshold
    Valid,
    /// Outside the validity / water mask, never inverted
    MaskedOut,
    /// Fewer valid observing pairs than the configured minimum
    InsufficientObservations,
    /// Valid pairs do not connect every epoch (singular per-pixel system)
    RankDeficient,
    /// Inverted, but temporal coherence is under the trust threshold
    BelowCoherenceThreshold,
    /// Run was cancelled before this pixel's block was dispatched
    NotProcessed,
}

impl PixelStatus {
    /// Whether a numeric estimate exists for this pixel
    pub fn has_estimate(&self) -> bool {
        matches!(self, PixelStatus::Valid | PixelStatus::BelowCoherenceThreshold)
    }

    /// Compact code used when the status raster is exported as integers
    pub fn code(&self) -> u8 {
        match self {
            PixelStatus::Valid => 0,
            PixelStatus::MaskedOut => 1,
            PixelStatus::InsufficientObservations => 2,
            PixelStatus::RankDeficient => 3,
            PixelStatus::BelowCoherenceThreshold => 4,
            PixelStatus::NotProcessed => 5,
        }
    }
}

impl std::fmt::Display for PixelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelStatus::Valid => write!(f, "valid"),
            PixelStatus::MaskedOut => write!(f, "masked-out"),
            PixelStatus::InsufficientObservations => write!(f, "insufficient-observations"),
            PixelStatus::RankDeficient => write!(f, "rank-deficient"),
            PixelStatus::BelowCoherenceThreshold => write!(f, "below-coherence-threshold"),
            PixelStatus::NotProcessed => write!(f, "not-processed"),
        }
    }
}

/// Per-pair observation stack produced by the interferogram loader
#[derive(Debug, Clone)]
pub struct PairStack {
    /// Unwrapped phase, one layer per candidate pair (NaN = no data)
    pub phase: RasterStack,
    /// Spatial coherence, one layer per candidate pair
    pub coherence: Option<RasterStack>,
    /// Connected component labels from unwrapping (0 = unreliable)
    pub conn_comp: Option<Array3<u16>>,
}

impl PairStack {
    /// Create a pair stack from unwrapped phase only
    pub fn new(phase: RasterStack) -> Self {
        Self {
            phase,
            coherence: None,
            conn_comp: None,
        }
    }

    /// Attach per-pair spatial coherence
    pub fn with_coherence(mut self, coherence: RasterStack) -> Self {
        self.coherence = Some(coherence);
        self
    }

    /// Attach connected component labels
    pub fn with_conn_comp(mut self, conn_comp: Array3<u16>) -> Self {
        self.conn_comp = Some(conn_comp);
        self
    }

    pub fn num_pairs(&self) -> usize {
        self.phase.dim().0
    }

    /// Grid dimensions (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.phase.dim();
        (rows, cols)
    }

    /// Check that all layers agree with the phase stack
    pub fn validate(&self) -> InsarResult<()> {
        let dim = self.phase.dim();
        if let Some(coh) = &self.coherence {
            if coh.dim() != dim {
                return Err(InsarError::InvalidFormat(format!(
                    "Coherence stack shape {:?} does not match phase stack {:?}",
                    coh.dim(),
                    dim
                )));
            }
        }
        if let Some(cc) = &self.conn_comp {
            if cc.dim() != dim {
                return Err(InsarError::InvalidFormat(format!(
                    "Connected component stack shape {:?} does not match phase stack {:?}",
                    cc.dim(),
                    dim
                )));
            }
        }
        Ok(())
    }
}

/// Error types for network inversion
#[derive(Debug, thiserror::Error)]
pub enum InsarError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Disconnected network, unreachable epochs: {}", .epochs.join(", "))]
    DisconnectedNetwork { epochs: Vec<String> },

    #[error("Singular system at pixel ({row}, {col})")]
    SingularSystem { row: usize, col: usize },

    #[error("Reference selection failed: {0}")]
    ReferenceSelection(String),

    #[error("Not enough coherent pixels: found {found}, need at least {required}")]
    InsufficientCoherentPixels { found: usize, required: usize },

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for network inversion operations
pub type InsarResult<T> = Result<T, InsarError>;

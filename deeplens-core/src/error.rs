//! Error taxonomy for the pipeline and its stages.

use deeplens_utils::tensor::SpecError;
use thiserror::Error;

/// Everything that can go wrong between a camera frame and its results.
///
/// The pipeline boundary (`Pipeline::process`) never lets these escape: they
/// are logged once, rendered as an error overlay, and latch the pipeline into
/// its error state until the next reconfiguration.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A tensor-spec string failed to parse. Surfaced at configuration time;
    /// the pipeline stays idle.
    #[error("malformed tensor spec: {0}")]
    MalformedSpec(#[from] SpecError),

    /// The anchor parameter does not line up with the raw YOLO output layers.
    #[error("anchor mismatch: {0}")]
    AnchorMismatch(String),

    /// Input blobs handed to the network differ from its declared attributes.
    #[error("tensor shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The pre-processor produced blobs that differ from what the network
    /// declared.
    #[error("blob shape mismatch: {0}")]
    BlobShapeMismatch(String),

    /// The network was asked to run before its weights finished loading.
    /// Recovered locally: the frame is skipped and a loading overlay shown.
    #[error("network model is not loaded yet")]
    ModelNotLoaded,

    /// A backend SDK call failed; carries a short message from the backend.
    #[error("backend failure: {0}")]
    BackendFailure(String),

    /// The zoo file could not be read, parsed, or did not contain the
    /// requested pipe.
    #[error("zoo error: {0}")]
    ZooParse(String),

    /// A parameter value was rejected (bad value, or the parameter is frozen
    /// while the pipeline runs).
    #[error("parameter error: {0}")]
    Param(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

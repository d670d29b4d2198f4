//! Deep-neural-network inference pipeline for embedded smart cameras.
//!
//! A pipeline turns a camera frame into structured results by composing three
//! stages: a pre-processor that converts the image into input tensors
//! ("blobs"), a network that runs inference on one of several backends, and a
//! post-processor that decodes the outputs into labels, boxes, or masks and
//! renders them. The [`pipeline::Pipeline`] controller builds the stages from
//! a declarative zoo file and sequences per-frame execution, synchronously or
//! with the network overlapped one frame behind the camera.

/// Typed tensor buffers handed between stages.
pub mod blob;
/// The error taxonomy shared by all stages.
pub mod error;
/// Network backends and the shared load/readiness machinery.
pub mod network;
/// Overlay drawing on output frames.
pub mod overlay;
/// The pipeline controller.
pub mod pipeline;
/// Decoders from output blobs to results.
pub mod postproc;
/// Frame-to-blobs conversion.
pub mod preproc;
/// Serial-style result reporting.
pub mod report;
/// The declarative model-zoo catalog.
pub mod zoo;

pub use blob::{Blob, BlobData};
pub use error::{PipelineError, Result};
pub use network::{Backend, Network, NetworkRunner, NpuBackend, OnnxBackend, TpuBackend};
pub use pipeline::{NetKind, Pipeline, PipelineState, PostProcKind, PreProcKind, Processing};
pub use postproc::{ClassifyPost, DetectPost, DetectType, Detection, PostProcessor, SegType, SegmentPost};
pub use preproc::{BlobPreProcessor, PreProcessor, PreprocContext};
pub use report::{LogSink, ReportSink, VecSink};
pub use zoo::{Filter, Zoo, ZooEntry};

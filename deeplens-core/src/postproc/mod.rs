//! Post-processing: output blobs → labeled results and overlays.

mod classify;
mod detect;
mod segment;

pub use classify::ClassifyPost;
pub use detect::{DetectPost, DetectType, Detection};
pub use segment::{SegType, SegmentPost};

use std::collections::BTreeMap;
use std::sync::Arc;

use ab_glyph::FontVec;
use image::RgbImage;

use crate::{
    blob::Blob,
    error::Result,
    preproc::PreprocContext,
    report::ReportSink,
};

/// Outputs-to-results stage contract.
///
/// `process` decodes the most recent output set and stores the results;
/// `report` emits the stored results to the host sink and, when requested,
/// draws them on the output frame. The split exists for asynchronous
/// operation, where the overlay shows the previous frame's decoded results
/// while the current inference is still in flight.
pub trait PostProcessor: Send {
    fn process(&mut self, outs: &[Blob], preproc: &PreprocContext) -> Result<()>;

    fn report(
        &mut self,
        sink: &mut dyn ReportSink,
        outimg: Option<&mut RgbImage>,
        overlay: bool,
        idle: bool,
    );

    /// Apply one zoo parameter. Returns `Ok(true)` when the key was consumed.
    fn set_param(&mut self, _key: &str, _value: &str) -> Result<bool> {
        Ok(false)
    }

    /// Lock parameters that define the post-processing identity.
    fn freeze(&mut self, _doit: bool) {}

    /// Install the shared overlay font, when one is configured.
    fn set_font(&mut self, _font: Option<Arc<FontVec>>) {}
}

/// Label map shared by the built-in post-processors.
pub(crate) type LabelMap = BTreeMap<i32, String>;

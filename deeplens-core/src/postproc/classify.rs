//! Classification post-processor.

use std::sync::Arc;

use ab_glyph::FontVec;
use image::RgbImage;

use deeplens_utils::{labels::get_label, load_labels, math::softmax};

use crate::{
    blob::Blob,
    error::{PipelineError, Result},
    overlay,
    preproc::{parse_bool, PreprocContext},
    report::{class_msg, ReportSink},
};

use super::{LabelMap, PostProcessor};

/// Decodes a 1-D score vector into the top scoring classes.
pub struct ClassifyPost {
    labels: LabelMap,
    classoffset: i32,
    top: usize,
    /// Reporting threshold in percent.
    thresh: f32,
    softmax: bool,
    scorescale: f32,
    font: Option<Arc<FontVec>>,
    frozen: bool,
    /// (mapped id, label, score in [0,1]) of the last processed frame.
    results: Vec<(i32, String, f32)>,
}

impl Default for ClassifyPost {
    fn default() -> Self {
        Self {
            labels: LabelMap::new(),
            classoffset: 0,
            top: 5,
            thresh: 20.0,
            softmax: false,
            scorescale: 1.0,
            font: None,
            frozen: false,
            results: Vec::new(),
        }
    }
}

impl ClassifyPost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last decoded results, for tests and custom reporters.
    pub fn results(&self) -> &[(i32, String, f32)] {
        &self.results
    }
}

impl PostProcessor for ClassifyPost {
    fn process(&mut self, outs: &[Blob], _preproc: &PreprocContext) -> Result<()> {
        let blob = match outs {
            [one] => one,
            _ => {
                return Err(PipelineError::ShapeMismatch(format!(
                    "classification expects a single output, got {}",
                    outs.len()
                )))
            }
        };
        let scores = blob.to_f32_vec();

        let scores = if self.softmax {
            softmax(&scores, 1.0)
        } else {
            scores
        };

        let cutoff = self.thresh / 100.0;
        let mut ranked: Vec<(usize, f32)> = scores
            .iter()
            .enumerate()
            .map(|(i, &s)| (i, s * self.scorescale))
            .filter(|&(_, s)| s >= cutoff)
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        ranked.truncate(self.top);

        self.results = ranked
            .into_iter()
            .map(|(i, s)| {
                let id = i as i32 + self.classoffset;
                (id, get_label(&self.labels, id), s)
            })
            .collect();
        Ok(())
    }

    fn report(
        &mut self,
        sink: &mut dyn ReportSink,
        outimg: Option<&mut RgbImage>,
        overlay_on: bool,
        idle: bool,
    ) {
        for (id, name, score) in &self.results {
            sink.send(&class_msg(*id, name, *score));
        }

        if idle || !overlay_on {
            return;
        }
        if let Some(img) = outimg {
            let lines: Vec<String> = if self.results.is_empty() {
                vec!["(no detections above threshold)".into()]
            } else {
                self.results
                    .iter()
                    .map(|(id, name, score)| format!("{id}: {name}: {:.1}%", score * 100.0))
                    .collect()
            };
            overlay::draw_info(img, &lines, self.font.as_deref());
        }
    }

    fn set_param(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "classes" => {
                if self.frozen {
                    return Err(PipelineError::Param("classes is frozen while running".into()));
                }
                self.labels = load_labels(value)
                    .map_err(|e| PipelineError::Param(format!("cannot load classes: {e}")))?;
            }
            "classoffset" => {
                self.classoffset = value
                    .trim()
                    .parse()
                    .map_err(|_| PipelineError::Param(format!("bad classoffset `{value}`")))?;
            }
            "top" => {
                self.top = value
                    .trim()
                    .parse()
                    .map_err(|_| PipelineError::Param(format!("bad top `{value}`")))?;
            }
            "thresh" => {
                self.thresh = parse_percent(value)?;
            }
            "softmax" => self.softmax = parse_bool(value)?,
            "scorescale" => {
                self.scorescale = value
                    .trim()
                    .parse()
                    .map_err(|_| PipelineError::Param(format!("bad scorescale `{value}`")))?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn freeze(&mut self, doit: bool) {
        self.frozen = doit;
    }

    fn set_font(&mut self, font: Option<Arc<FontVec>>) {
        self.font = font;
    }
}

/// Parse a percentage parameter, rejecting values outside 0..=100.
pub(crate) fn parse_percent(value: &str) -> Result<f32> {
    let v: f32 = value
        .trim()
        .parse()
        .map_err(|_| PipelineError::Param(format!("bad percentage `{value}`")))?;
    if !(0.0..=100.0).contains(&v) {
        return Err(PipelineError::Param(format!(
            "percentage `{value}` outside 0..100"
        )));
    }
    Ok(v)
}

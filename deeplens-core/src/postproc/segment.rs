//! Semantic-segmentation post-processor.

use image::RgbImage;

use deeplens_utils::labels::{get_label, label_color};
use deeplens_utils::load_labels;

use crate::{
    blob::Blob,
    error::{PipelineError, Result},
    overlay,
    preproc::PreprocContext,
    report::ReportSink,
};

use super::{LabelMap, PostProcessor};

/// Shape of the segmentation network output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegType {
    /// `[H, W, C]` of per-class scores; argmax over the trailing axis.
    Classes,
    /// `[C, H, W]` of per-class scores; argmax over the leading axis.
    Classes2,
    /// `[H, W]` of class ids.
    ArgMax,
}

impl SegType {
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "Classes" => SegType::Classes,
            "Classes2" => SegType::Classes2,
            "ArgMax" => SegType::ArgMax,
            other => return Err(PipelineError::Param(format!("unknown segtype `{other}`"))),
        })
    }
}

/// Decodes class maps and renders them as a colorized overlay.
pub struct SegmentPost {
    segtype: SegType,
    alpha: u8,
    /// Class id rendered fully transparent.
    bgid: i32,
    labels: LabelMap,
    frozen: bool,
    /// RGBA overlay of the last processed frame, `mask_size` pixels.
    mask: Vec<u8>,
    mask_size: (u32, u32),
}

impl Default for SegmentPost {
    fn default() -> Self {
        Self {
            segtype: SegType::Classes,
            alpha: 64,
            bgid: 0,
            labels: LabelMap::new(),
            frozen: false,
            mask: Vec::new(),
            mask_size: (0, 0),
        }
    }
}

impl SegmentPost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Class-id grid of the last frame (row-major), for tests.
    pub fn mask_size(&self) -> (u32, u32) {
        self.mask_size
    }

    /// Per-pixel class ids for `outs[0]` according to the configured layout.
    fn class_map(&self, blob: &Blob) -> Result<(Vec<i32>, usize, usize)> {
        // tolerate a leading batch dimension
        let expected = match self.segtype {
            SegType::ArgMax => 2,
            _ => 3,
        };
        let mut dims = blob.attr().dims.as_slice();
        while dims.len() > expected && dims[0] == 1 {
            dims = &dims[1..];
        }
        let data = blob.to_f32_vec();

        match (self.segtype, dims) {
            (SegType::ArgMax, [h, w]) => {
                let ids = data.iter().map(|&v| v as i32).collect();
                Ok((ids, *w, *h))
            }
            (SegType::Classes, [h, w, c]) => {
                let mut ids = Vec::with_capacity(h * w);
                for px in 0..h * w {
                    let row = &data[px * c..(px + 1) * c];
                    ids.push(argmax(row));
                }
                Ok((ids, *w, *h))
            }
            (SegType::Classes2, [c, h, w]) => {
                let plane = h * w;
                let mut ids = Vec::with_capacity(plane);
                for px in 0..plane {
                    let mut best = 0usize;
                    let mut best_v = f32::NEG_INFINITY;
                    for ch in 0..*c {
                        let v = data[ch * plane + px];
                        if v > best_v {
                            best_v = v;
                            best = ch;
                        }
                    }
                    ids.push(best as i32);
                }
                Ok((ids, *w, *h))
            }
            (_, other) => Err(PipelineError::ShapeMismatch(format!(
                "segmentation output {other:?} does not match segtype {:?}",
                self.segtype
            ))),
        }
    }
}

fn argmax(row: &[f32]) -> i32 {
    let mut best = 0usize;
    let mut best_v = f32::NEG_INFINITY;
    for (i, &v) in row.iter().enumerate() {
        if v > best_v {
            best_v = v;
            best = i;
        }
    }
    best as i32
}

impl PostProcessor for SegmentPost {
    fn process(&mut self, outs: &[Blob], _preproc: &PreprocContext) -> Result<()> {
        let blob = match outs {
            [one] => one,
            _ => {
                return Err(PipelineError::ShapeMismatch(format!(
                    "segmentation expects a single output, got {}",
                    outs.len()
                )))
            }
        };

        let (ids, w, h) = self.class_map(blob)?;

        let mut mask = vec![0u8; w * h * 4];
        for (i, &id) in ids.iter().enumerate() {
            if id == self.bgid {
                continue; // stays transparent
            }
            let color = label_color(&get_label(&self.labels, id), self.alpha);
            mask[i * 4..i * 4 + 4].copy_from_slice(&color);
        }
        self.mask = mask;
        self.mask_size = (w as u32, h as u32);
        Ok(())
    }

    fn report(
        &mut self,
        _sink: &mut dyn ReportSink,
        outimg: Option<&mut RgbImage>,
        overlay_on: bool,
        idle: bool,
    ) {
        // segmentation has no serial message; the overlay is the result
        if idle || !overlay_on {
            return;
        }
        if let Some(img) = outimg {
            overlay::draw_mask(img, &self.mask, self.mask_size.0, self.mask_size.1);
        }
    }

    fn set_param(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "segtype" => {
                if self.frozen {
                    return Err(PipelineError::Param("segtype is frozen while running".into()));
                }
                self.segtype = SegType::from_name(value.trim())?;
            }
            "classes" => {
                if self.frozen {
                    return Err(PipelineError::Param("classes is frozen while running".into()));
                }
                self.labels = load_labels(value)
                    .map_err(|e| PipelineError::Param(format!("cannot load classes: {e}")))?;
            }
            "alpha" => {
                self.alpha = value
                    .trim()
                    .parse()
                    .map_err(|_| PipelineError::Param(format!("bad alpha `{value}`")))?;
            }
            "bgid" => {
                self.bgid = value
                    .trim()
                    .parse()
                    .map_err(|_| PipelineError::Param(format!("bad bgid `{value}`")))?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn freeze(&mut self, doit: bool) {
        self.frozen = doit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobData;
    use deeplens_utils::tensor::{ElemType, Layout, Quant, TensorAttr};

    fn f32_blob(dims: Vec<usize>, data: Vec<f32>) -> Blob {
        let attr = TensorAttr::new(Layout::Na, ElemType::F32, dims, Quant::None).unwrap();
        Blob::new(attr, BlobData::F32(data)).unwrap()
    }

    fn mask_pixel(post: &SegmentPost, x: usize, y: usize) -> [u8; 4] {
        let (w, _) = post.mask_size;
        let at = (y * w as usize + x) * 4;
        post.mask[at..at + 4].try_into().unwrap()
    }

    #[test]
    fn classes_layout_argmaxes_trailing_axis() {
        // 1x2 image, 3 classes: pixel0 → class 2, pixel1 → class 0 (bg)
        let blob = f32_blob(vec![1, 2, 3], vec![0.1, 0.2, 0.9, 0.8, 0.1, 0.1]);
        let mut post = SegmentPost::new();
        post.process(&[blob], &PreprocContext::default()).unwrap();
        assert_eq!(post.mask_size(), (2, 1));
        assert_ne!(mask_pixel(&post, 0, 0)[3], 0);
        assert_eq!(mask_pixel(&post, 1, 0)[3], 0, "background is transparent");
    }

    #[test]
    fn classes2_layout_argmaxes_leading_axis() {
        // 3 classes over a 2x1 image, planar
        let blob = f32_blob(
            vec![3, 1, 2],
            vec![
                0.1, 0.8, // class 0 plane
                0.2, 0.1, // class 1
                0.9, 0.1, // class 2
            ],
        );
        let mut post = SegmentPost::new();
        post.set_param("segtype", "Classes2").unwrap();
        post.process(&[blob], &PreprocContext::default()).unwrap();
        // pixel0 → class 2 (colored), pixel1 → class 0 (bg)
        assert_ne!(mask_pixel(&post, 0, 0)[3], 0);
        assert_eq!(mask_pixel(&post, 1, 0)[3], 0);
    }

    #[test]
    fn argmax_layout_reads_ids_directly() {
        let blob = f32_blob(vec![2, 2], vec![0.0, 5.0, 7.0, 0.0]);
        let mut post = SegmentPost::new();
        post.set_param("segtype", "ArgMax").unwrap();
        post.process(&[blob], &PreprocContext::default()).unwrap();
        assert_eq!(mask_pixel(&post, 0, 0)[3], 0);
        assert_ne!(mask_pixel(&post, 1, 0)[3], 0);
        assert_ne!(mask_pixel(&post, 0, 1)[3], 0);
    }

    #[test]
    fn equal_ids_share_a_color() {
        let blob = f32_blob(vec![1, 2], vec![5.0, 5.0]);
        let mut post = SegmentPost::new();
        post.set_param("segtype", "ArgMax").unwrap();
        post.process(&[blob], &PreprocContext::default()).unwrap();
        assert_eq!(mask_pixel(&post, 0, 0), mask_pixel(&post, 1, 0));
    }

    #[test]
    fn bgid_can_be_remapped() {
        let blob = f32_blob(vec![1, 2], vec![0.0, 3.0]);
        let mut post = SegmentPost::new();
        post.set_param("segtype", "ArgMax").unwrap();
        post.set_param("bgid", "3").unwrap();
        post.process(&[blob], &PreprocContext::default()).unwrap();
        assert_ne!(mask_pixel(&post, 0, 0)[3], 0, "class 0 is now foreground");
        assert_eq!(mask_pixel(&post, 1, 0)[3], 0, "class 3 is background");
    }

    #[test]
    fn shape_and_segtype_must_agree() {
        let blob = f32_blob(vec![2, 2], vec![0.0; 4]);
        let mut post = SegmentPost::new(); // expects Classes [H,W,C]
        let err = post
            .process(&[blob], &PreprocContext::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch(_)));
    }
}

//! Object-detection post-processor.
//!
//! Supports networks that decode their own boxes (SSD variants, FasterRCNN,
//! decoded YOLO) and raw YOLO grids, where anchors, sigmoids, and strides are
//! applied here. All boxes come out clamped in original image coordinates.

use std::sync::Arc;

use ab_glyph::FontVec;
use image::RgbImage;

use deeplens_utils::{
    labels::{get_label, label_color},
    load_labels,
    rect::Rect,
};

use crate::{
    blob::Blob,
    error::{PipelineError, Result},
    overlay,
    preproc::PreprocContext,
    report::{object_msg, ReportSink},
};

use super::classify::parse_percent;
use super::{LabelMap, PostProcessor};

/// Output format of the detection network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectType {
    Ssd,
    TpuSsd,
    FasterRcnn,
    Yolo,
    RawYoloFace,
    RawYoloV2,
    RawYoloV3,
    RawYoloV4,
    RawYoloV3Tiny,
}

impl DetectType {
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "SSD" => DetectType::Ssd,
            "TPUSSD" => DetectType::TpuSsd,
            "FasterRCNN" => DetectType::FasterRcnn,
            "YOLO" => DetectType::Yolo,
            "RAWYOLOface" => DetectType::RawYoloFace,
            "RAWYOLOv2" => DetectType::RawYoloV2,
            "RAWYOLOv3" => DetectType::RawYoloV3,
            "RAWYOLOv4" => DetectType::RawYoloV4,
            "RAWYOLOv3tiny" => DetectType::RawYoloV3Tiny,
            other => {
                return Err(PipelineError::Param(format!(
                    "unknown detecttype `{other}`"
                )))
            }
        })
    }

    fn is_raw(self) -> bool {
        matches!(
            self,
            DetectType::RawYoloFace
                | DetectType::RawYoloV2
                | DetectType::RawYoloV3
                | DetectType::RawYoloV4
                | DetectType::RawYoloV3Tiny
        )
    }

    /// v2-lineage layers softmax their class scores and keep anchors in
    /// grid-cell units (scaled by the stride at decode time); v3 and later
    /// sigmoid each class and use input-pixel anchors.
    fn is_v2_family(self) -> bool {
        matches!(self, DetectType::RawYoloFace | DetectType::RawYoloV2)
    }
}

/// One detection in original image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub id: i32,
    pub score: f32,
    pub rect: Rect,
}

/// Candidate box in float image coordinates, before NMS and clamping.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: i32,
    score: f32,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

impl Candidate {
    fn iou(&self, other: &Candidate) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);
        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        let inter = (x2 - x1) * (y2 - y1);
        let a = (self.x2 - self.x1) * (self.y2 - self.y1);
        let b = (other.x2 - other.x1) * (other.y2 - other.y1);
        let union = a + b - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Parse the `anchors` parameter: semicolon-separated groups, one per raw
/// output layer, widths and heights alternating within each group.
fn parse_anchors(value: &str) -> Result<Vec<Vec<(f32, f32)>>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let mut groups = Vec::new();
    for group in trimmed.split(';') {
        let nums: Vec<f32> = group
            .split(',')
            .flat_map(str::split_whitespace)
            .map(|t| t.parse::<f32>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| PipelineError::AnchorMismatch(format!("bad anchor list `{group}`")))?;
        if nums.is_empty() || nums.len() % 2 != 0 {
            return Err(PipelineError::AnchorMismatch(format!(
                "anchor group `{group}` must hold w,h pairs"
            )));
        }
        groups.push(nums.chunks(2).map(|c| (c[0], c[1])).collect());
    }
    Ok(groups)
}

/// Per-class greedy non-maximum suppression.
///
/// Candidates are sorted by descending score (stable, so the lower input
/// index wins ties); a candidate is suppressed when its IoU with an already
/// accepted candidate of the same class exceeds `thresh`.
fn nms(mut candidates: Vec<Candidate>, thresh: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut keep: Vec<Candidate> = Vec::with_capacity(candidates.len());
    'next: for cand in candidates {
        for accepted in &keep {
            if accepted.id == cand.id && accepted.iou(&cand) > thresh {
                continue 'next;
            }
        }
        keep.push(cand);
    }
    keep
}

/// Decodes detection outputs, runs NMS, renders boxes.
pub struct DetectPost {
    dtype: DetectType,
    /// Detection threshold in percent.
    thresh: f32,
    /// NMS IoU threshold in percent.
    nms: f32,
    anchors: Vec<Vec<(f32, f32)>>,
    labels: LabelMap,
    classoffset: i32,
    alpha: u8,
    font: Option<Arc<FontVec>>,
    frozen: bool,
    results: Vec<Detection>,
}

impl Default for DetectPost {
    fn default() -> Self {
        Self {
            dtype: DetectType::Yolo,
            thresh: 50.0,
            nms: 45.0,
            anchors: Vec::new(),
            labels: LabelMap::new(),
            classoffset: 0,
            alpha: 64,
            font: None,
            frozen: false,
            results: Vec::new(),
        }
    }
}

impl DetectPost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> &[Detection] {
        &self.results
    }

    fn decode_ssd(&self, outs: &[Blob], ctx: &PreprocContext, tpu: bool) -> Result<Vec<Candidate>> {
        let [scores, boxes, classes] = match outs {
            [s, b, c] => [s, b, c],
            _ => {
                return Err(PipelineError::ShapeMismatch(format!(
                    "SSD expects 3 outputs (scores, boxes, classes), got {}",
                    outs.len()
                )))
            }
        };
        let scores = scores.to_f32_vec();
        let boxes = boxes.to_f32_vec();
        let classes = classes.to_f32_vec();
        let n = scores.len();
        if boxes.len() != n * 4 || classes.len() != n {
            return Err(PipelineError::ShapeMismatch(format!(
                "SSD outputs disagree: {n} scores, {} box values, {} classes",
                boxes.len(),
                classes.len()
            )));
        }

        let cutoff = self.thresh / 100.0;
        let mut candidates = Vec::new();
        for i in 0..n {
            let score = scores[i];
            if score < cutoff {
                continue;
            }
            // TPU SSD rows are (y1, x1, y2, x2); the general SSD seat gets
            // (x1, y1, x2, y2).
            let row = &boxes[i * 4..i * 4 + 4];
            let (nx1, ny1, nx2, ny2) = if tpu {
                (row[1], row[0], row[3], row[2])
            } else {
                (row[0], row[1], row[2], row[3])
            };
            let (x1, y1) = ctx.n2i(nx1, ny1, 0);
            let (x2, y2) = ctx.n2i(nx2, ny2, 0);
            candidates.push(Candidate {
                id: classes[i].round() as i32,
                score,
                x1,
                y1,
                x2,
                y2,
            });
        }
        Ok(candidates)
    }

    fn decode_faster_rcnn(&self, outs: &[Blob], ctx: &PreprocContext) -> Result<Vec<Candidate>> {
        let rows = match outs {
            [one] => one.to_f32_vec(),
            _ => {
                return Err(PipelineError::ShapeMismatch(format!(
                    "FasterRCNN expects a single output, got {}",
                    outs.len()
                )))
            }
        };
        if rows.len() % 7 != 0 {
            return Err(PipelineError::ShapeMismatch(format!(
                "FasterRCNN output length {} is not a multiple of 7",
                rows.len()
            )));
        }

        let cutoff = self.thresh / 100.0;
        let mut candidates = Vec::new();
        for row in rows.chunks(7) {
            let score = row[2];
            if score < cutoff {
                continue;
            }
            let (x1, y1) = ctx.n2i(row[3], row[4], 0);
            let (x2, y2) = ctx.n2i(row[5], row[6], 0);
            candidates.push(Candidate {
                id: row[1].round() as i32,
                score,
                x1,
                y1,
                x2,
                y2,
            });
        }
        Ok(candidates)
    }

    /// Networks whose output rows are already decoded detections, in
    /// normalized coordinates. Two row layouts exist in the wild and are told
    /// apart by the column count: exactly 6 columns is
    /// `(x1, y1, x2, y2, score, class)` with an integer class id; 7 or more
    /// is `(cx, cy, w, h, conf, class_probs…)` with one probability per
    /// class.
    fn decode_yolo(&self, outs: &[Blob], ctx: &PreprocContext) -> Result<Vec<Candidate>> {
        let cutoff = self.thresh / 100.0;
        let mut candidates = Vec::new();
        for blob in outs {
            let dims = &blob.attr().dims;
            let cols = *dims.last().ok_or_else(|| {
                PipelineError::ShapeMismatch("YOLO output has no shape".into())
            })?;
            if cols < 6 {
                return Err(PipelineError::ShapeMismatch(format!(
                    "YOLO output rows of {cols} values cannot hold decoded detections"
                )));
            }
            let data = blob.to_f32_vec();

            if cols == 6 {
                // corner box plus class id
                for row in data.chunks(cols) {
                    let score = row[4];
                    if score < cutoff {
                        continue;
                    }
                    let (x1, y1) = ctx.n2i(row[0], row[1], 0);
                    let (x2, y2) = ctx.n2i(row[2], row[3], 0);
                    candidates.push(Candidate {
                        id: row[5].round() as i32,
                        score,
                        x1,
                        y1,
                        x2,
                        y2,
                    });
                }
                continue;
            }

            // center box plus per-class probabilities
            for row in data.chunks(cols) {
                let conf = row[4];
                let (best_class, best_prob) = row[5..]
                    .iter()
                    .enumerate()
                    .fold((0usize, 0f32), |acc, (i, &p)| {
                        if p > acc.1 {
                            (i, p)
                        } else {
                            acc
                        }
                    });
                let score = conf * best_prob;
                if score < cutoff {
                    continue;
                }
                let (cx, cy) = ctx.n2i(row[0], row[1], 0);
                let crop = ctx.crops.first().copied().unwrap_or_default();
                let w = row[2] * crop.width as f32;
                let h = row[3] * crop.height as f32;
                candidates.push(Candidate {
                    id: best_class as i32,
                    score,
                    x1: cx - w / 2.0,
                    y1: cy - h / 2.0,
                    x2: cx + w / 2.0,
                    y2: cy + h / 2.0,
                });
            }
        }
        Ok(candidates)
    }

    /// Raw YOLO grids: one output per detection layer, each shaped
    /// `[A*(5+C), Gy, Gx]` (a leading batch dimension is tolerated).
    fn decode_raw_yolo(&self, outs: &[Blob], ctx: &PreprocContext) -> Result<Vec<Candidate>> {
        if self.anchors.is_empty() {
            return Err(PipelineError::AnchorMismatch(
                "raw YOLO decoding needs the anchors parameter".into(),
            ));
        }
        if self.anchors.len() != 1 && self.anchors.len() != outs.len() {
            return Err(PipelineError::AnchorMismatch(format!(
                "{} anchor groups for {} raw output layers",
                self.anchors.len(),
                outs.len()
            )));
        }

        let (net_w, net_h) = ctx
            .blob_sizes
            .first()
            .copied()
            .unwrap_or((0, 0));
        if net_w == 0 || net_h == 0 {
            return Err(PipelineError::ShapeMismatch(
                "raw YOLO decoding needs the network input size from the pre-processor".into(),
            ));
        }

        let cutoff = self.thresh / 100.0;
        let v2 = self.dtype.is_v2_family();
        let mut candidates = Vec::new();

        for (layer, blob) in outs.iter().enumerate() {
            let dims = &blob.attr().dims;
            let (ch, gy, gx) = match dims.as_slice() {
                [c, h, w] => (*c, *h, *w),
                [1, c, h, w] => (*c, *h, *w),
                [a, c, h, w] => (*a * *c, *h, *w),
                other => {
                    return Err(PipelineError::ShapeMismatch(format!(
                        "raw YOLO layer {layer} has shape {other:?}"
                    )))
                }
            };
            let group = if self.anchors.len() == 1 {
                &self.anchors[0]
            } else {
                &self.anchors[layer]
            };
            let n_anchors = group.len();
            if n_anchors == 0 || ch % n_anchors != 0 || ch / n_anchors < 5 {
                return Err(PipelineError::AnchorMismatch(format!(
                    "layer {layer} has {ch} channels which does not split into {n_anchors} anchors of 5+C values"
                )));
            }
            let per_anchor = ch / n_anchors;
            let n_classes = per_anchor - 5;
            let stride_x = net_w as f32 / gx as f32;
            let stride_y = net_h as f32 / gy as f32;

            let data = blob.to_f32_vec();
            let plane = gy * gx;
            let at = |a: usize, k: usize, y: usize, x: usize| -> f32 {
                data[(a * per_anchor + k) * plane + y * gx + x]
            };

            for a in 0..n_anchors {
                let (mut aw, mut ah) = group[a];
                if v2 {
                    // Darknet v2 lineage keeps anchors in grid-cell units.
                    aw *= stride_x;
                    ah *= stride_y;
                }
                for cy in 0..gy {
                    for cx in 0..gx {
                        let obj = sigmoid(at(a, 4, cy, cx));
                        if obj < cutoff {
                            continue;
                        }

                        let (best_class, class_score) = if n_classes == 0 {
                            (0, 1.0)
                        } else if v2 {
                            let logits: Vec<f32> =
                                (0..n_classes).map(|c| at(a, 5 + c, cy, cx)).collect();
                            let probs = deeplens_utils::math::softmax(&logits, 1.0);
                            probs
                                .iter()
                                .enumerate()
                                .fold((0usize, 0f32), |acc, (i, &p)| {
                                    if p > acc.1 {
                                        (i, p)
                                    } else {
                                        acc
                                    }
                                })
                        } else {
                            (0..n_classes)
                                .map(|c| (c, sigmoid(at(a, 5 + c, cy, cx))))
                                .fold((0usize, 0f32), |acc, (i, p)| {
                                    if p > acc.1 {
                                        (i, p)
                                    } else {
                                        acc
                                    }
                                })
                        };

                        let score = obj * class_score;
                        if score < cutoff {
                            continue;
                        }

                        let bx = (sigmoid(at(a, 0, cy, cx)) + cx as f32) * stride_x;
                        let by = (sigmoid(at(a, 1, cy, cx)) + cy as f32) * stride_y;
                        let bw = at(a, 2, cy, cx).exp() * aw;
                        let bh = at(a, 3, cy, cx).exp() * ah;

                        let (ix1, iy1) = ctx.b2i(bx - bw / 2.0, by - bh / 2.0, 0);
                        let (ix2, iy2) = ctx.b2i(bx + bw / 2.0, by + bh / 2.0, 0);
                        candidates.push(Candidate {
                            id: best_class as i32,
                            score,
                            x1: ix1,
                            y1: iy1,
                            x2: ix2,
                            y2: iy2,
                        });
                    }
                }
            }
        }
        Ok(candidates)
    }
}

impl PostProcessor for DetectPost {
    fn process(&mut self, outs: &[Blob], preproc: &PreprocContext) -> Result<()> {
        let candidates = match self.dtype {
            DetectType::Ssd => self.decode_ssd(outs, preproc, false)?,
            DetectType::TpuSsd => self.decode_ssd(outs, preproc, true)?,
            DetectType::FasterRcnn => self.decode_faster_rcnn(outs, preproc)?,
            DetectType::Yolo => self.decode_yolo(outs, preproc)?,
            raw if raw.is_raw() => self.decode_raw_yolo(outs, preproc)?,
            _ => unreachable!(),
        };

        let kept = nms(candidates, self.nms / 100.0);

        let (src_w, src_h) = preproc.src_size;
        self.results = kept
            .into_iter()
            .map(|c| Detection {
                id: c.id,
                score: c.score,
                rect: Rect::from_corners_f32(c.x1, c.y1, c.x2, c.y2).clamp(src_w, src_h),
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
        for det in &self.results {
            let id = det.id + self.classoffset;
            let name = get_label(&self.labels, id);
            sink.send(&object_msg(id, &name, det.score, det.rect));
        }

        if idle || !overlay_on {
            return;
        }
        if let Some(img) = outimg {
            for det in &self.results {
                if det.rect.is_empty() {
                    continue;
                }
                let id = det.id + self.classoffset;
                let name = get_label(&self.labels, id);
                let color = label_color(&name, self.alpha);
                let label = format!("{name}: {:.1}%", det.score * 100.0);
                overlay::draw_detection(img, det.rect, color, &label, self.font.as_deref());
            }
        }
    }

    fn set_param(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "detecttype" => {
                if self.frozen {
                    return Err(PipelineError::Param(
                        "detecttype is frozen while running".into(),
                    ));
                }
                self.dtype = DetectType::from_name(value.trim())?;
            }
            "anchors" => {
                if self.frozen {
                    return Err(PipelineError::Param("anchors is frozen while running".into()));
                }
                self.anchors = parse_anchors(value)?;
            }
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
            "thresh" => self.thresh = parse_percent(value)?,
            "nms" => self.nms = parse_percent(value)?,
            "alpha" => {
                self.alpha = value
                    .trim()
                    .parse()
                    .map_err(|_| PipelineError::Param(format!("bad alpha `{value}`")))?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::BlobData;
    use deeplens_utils::tensor::{ElemType, Layout, Quant, TensorAttr};

    fn f32_blob(dims: Vec<usize>, data: Vec<f32>) -> Blob {
        let attr = TensorAttr::new(Layout::Na, ElemType::F32, dims, Quant::None).unwrap();
        Blob::new(attr, BlobData::F32(data)).unwrap()
    }

    fn identity_ctx(w: u32, h: u32) -> PreprocContext {
        PreprocContext {
            src_size: (w, h),
            crops: vec![Rect::new(0, 0, w as i32, h as i32)],
            blob_sizes: vec![(w, h)],
        }
    }

    fn cand(score: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> Candidate {
        Candidate {
            id: 0,
            score,
            x1,
            y1,
            x2,
            y2,
        }
    }

    #[test]
    fn nms_suppresses_by_iou_threshold() {
        // IoU of these two boxes is 81/119 ≈ 0.68
        let a = cand(0.9, 0.0, 0.0, 10.0, 10.0);
        let b = cand(0.8, 1.0, 1.0, 11.0, 11.0);

        let kept = nms(vec![a, b], 0.5);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].score, 0.9);

        let kept = nms(vec![a, b], 0.7);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn nms_is_idempotent() {
        let boxes = vec![
            cand(0.9, 0.0, 0.0, 10.0, 10.0),
            cand(0.8, 1.0, 1.0, 11.0, 11.0),
            cand(0.7, 50.0, 50.0, 60.0, 60.0),
        ];
        let once = nms(boxes, 0.5);
        let twice = nms(once.clone(), 0.5);
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.score, b.score);
        }
    }

    #[test]
    fn nms_keeps_other_classes() {
        let mut a = cand(0.9, 0.0, 0.0, 10.0, 10.0);
        let mut b = cand(0.8, 1.0, 1.0, 11.0, 11.0);
        a.id = 0;
        b.id = 1;
        let kept = nms(vec![a, b], 0.5);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn anchors_parse_groups_and_pairs() {
        let groups = parse_anchors("10,14, 23,27, 37,58; 81,82, 135,169, 344,319").unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0], vec![(10.0, 14.0), (23.0, 27.0), (37.0, 58.0)]);
        assert_eq!(groups[1][2], (344.0, 319.0));

        assert!(parse_anchors("10,14,23").is_err());
        assert!(parse_anchors("ten,14").is_err());
        assert!(parse_anchors("").unwrap().is_empty());
    }

    #[test]
    fn anchor_group_count_must_match_layers() {
        let mut post = DetectPost::new();
        post.set_param("detecttype", "RAWYOLOv3").unwrap();
        post.set_param("anchors", "10,14; 23,27").unwrap();
        let ctx = identity_ctx(416, 416);
        // three layers but two groups
        let layer = f32_blob(vec![6, 13, 13], vec![0.0; 6 * 13 * 13]);
        let err = post
            .process(&[layer.clone(), layer.clone(), layer], &ctx)
            .unwrap_err();
        assert!(matches!(err, PipelineError::AnchorMismatch(_)));
    }

    #[test]
    fn raw_yolo_decodes_reference_cell() {
        // 13x13 grid, 3 anchors, 1 class, stride 32 (416 net input)
        let anchors = "10,14, 23,27, 37,58";
        let (gy, gx) = (13usize, 13usize);
        let per_anchor = 6;
        let mut data = vec![-20.0f32; 3 * per_anchor * gy * gx]; // σ(-20) ≈ 0
        let plane = gy * gx;
        // anchor 0, cell (0,0): tx=ty=tw=th=0, t_obj=+5, t_cls0=+5
        data[0] = 0.0;
        data[plane] = 0.0;
        data[2 * plane] = 0.0;
        data[3 * plane] = 0.0;
        data[4 * plane] = 5.0;
        data[5 * plane] = 5.0;

        let mut post = DetectPost::new();
        post.set_param("detecttype", "RAWYOLOv3").unwrap();
        post.set_param("anchors", anchors).unwrap();
        post.set_param("thresh", "50").unwrap();

        let ctx = identity_ctx(416, 416);
        post.process(&[f32_blob(vec![3 * per_anchor, gy, gx], data)], &ctx)
            .unwrap();

        let results = post.results();
        assert_eq!(results.len(), 1);
        let det = &results[0];
        assert_eq!(det.id, 0);
        assert!((det.score - 0.99).abs() < 0.01, "score {}", det.score);
        // centered at (16,16) with the first anchor's size (10x14)
        assert_eq!(det.rect, Rect::new(11, 9, 10, 14));
    }

    #[test]
    fn raw_yolo_v2_scales_anchors_by_stride() {
        let (gy, gx) = (4usize, 4usize);
        let per_anchor = 6;
        let mut data = vec![-20.0f32; per_anchor * gy * gx];
        let plane = gy * gx;
        data[0] = 0.0;
        data[plane] = 0.0;
        data[2 * plane] = 0.0;
        data[3 * plane] = 0.0;
        data[4 * plane] = 9.0;
        data[5 * plane] = 9.0;

        let mut post = DetectPost::new();
        post.set_param("detecttype", "RAWYOLOv2").unwrap();
        post.set_param("anchors", "1,1").unwrap();
        post.set_param("thresh", "50").unwrap();

        // 128 input over a 4-cell grid: stride 32, so a 1x1 anchor is 32px
        let ctx = identity_ctx(128, 128);
        post.process(&[f32_blob(vec![per_anchor, gy, gx], data)], &ctx)
            .unwrap();

        let det = &post.results()[0];
        assert_eq!(det.rect.width, 32);
        assert_eq!(det.rect.height, 32);
    }

    #[test]
    fn ssd_filters_scales_and_clamps() {
        let scores = f32_blob(vec![2], vec![0.9, 0.3]);
        let boxes = f32_blob(
            vec![2, 4],
            vec![
                0.25, 0.25, 0.5, 0.75, // kept
                0.0, 0.0, 1.0, 1.0, // below threshold
            ],
        );
        let classes = f32_blob(vec![2], vec![7.0, 1.0]);

        let mut post = DetectPost::new();
        post.set_param("detecttype", "SSD").unwrap();
        post.set_param("thresh", "50").unwrap();

        let ctx = identity_ctx(100, 100);
        post.process(&[scores, boxes, classes], &ctx).unwrap();
        let results = post.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 7);
        assert_eq!(results[0].rect, Rect::new(25, 25, 25, 50));
    }

    #[test]
    fn yolo_corner_rows_carry_integer_class_ids() {
        // 6 columns: (x1, y1, x2, y2, score, class)
        let rows = f32_blob(
            vec![2, 6],
            vec![
                0.25, 0.25, 0.5, 0.75, 0.9, 7.0, // kept
                0.0, 0.0, 1.0, 1.0, 0.2, 1.0, // below threshold
            ],
        );
        let mut post = DetectPost::new();
        post.set_param("detecttype", "YOLO").unwrap();
        post.set_param("thresh", "50").unwrap();

        let ctx = identity_ctx(100, 100);
        post.process(&[rows], &ctx).unwrap();
        let results = post.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 7);
        assert!((results[0].score - 0.9).abs() < 1e-6);
        assert_eq!(results[0].rect, Rect::new(25, 25, 25, 50));
    }

    #[test]
    fn yolo_center_rows_argmax_class_probs() {
        // 7 columns: (cx, cy, w, h, conf, p0, p1)
        let rows = f32_blob(vec![1, 7], vec![0.5, 0.5, 0.5, 0.5, 0.9, 0.1, 0.8]);
        let mut post = DetectPost::new();
        post.set_param("detecttype", "YOLO").unwrap();
        post.set_param("thresh", "50").unwrap();

        let ctx = identity_ctx(100, 100);
        post.process(&[rows], &ctx).unwrap();
        let results = post.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 1);
        assert!((results[0].score - 0.72).abs() < 1e-5);
        assert_eq!(results[0].rect, Rect::new(25, 25, 50, 50));
    }

    #[test]
    fn yolo_rejects_rows_too_narrow_to_decode() {
        let rows = f32_blob(vec![1, 5], vec![0.5, 0.5, 0.2, 0.2, 0.9]);
        let mut post = DetectPost::new();
        post.set_param("detecttype", "YOLO").unwrap();
        let err = post.process(&[rows], &identity_ctx(100, 100)).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch(_)));
    }

    #[test]
    fn faster_rcnn_reads_seven_wide_rows() {
        let rows = f32_blob(
            vec![2, 7],
            vec![
                0.0, 3.0, 0.9, 0.0, 0.0, 0.5, 0.5, //
                0.0, 1.0, 0.1, 0.5, 0.5, 1.0, 1.0,
            ],
        );
        let mut post = DetectPost::new();
        post.set_param("detecttype", "FasterRCNN").unwrap();
        post.set_param("thresh", "50").unwrap();

        let ctx = identity_ctx(200, 100);
        post.process(&[rows], &ctx).unwrap();
        let results = post.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, 3);
        assert_eq!(results[0].rect, Rect::new(0, 0, 100, 50));
    }

    #[test]
    fn boxes_clamp_to_image_bounds() {
        let scores = f32_blob(vec![1], vec![0.9]);
        let boxes = f32_blob(vec![1, 4], vec![-0.2, -0.2, 0.5, 1.4]);
        let classes = f32_blob(vec![1], vec![0.0]);

        let mut post = DetectPost::new();
        post.set_param("detecttype", "SSD").unwrap();
        let ctx = identity_ctx(100, 100);
        post.process(&[scores, boxes, classes], &ctx).unwrap();
        let r = post.results()[0].rect;
        assert!(r.x >= 0 && r.y >= 0);
        assert!(r.x + r.width <= 100 && r.y + r.height <= 100);
    }
}

//! Pre-processing: camera frame → input blobs.
//!
//! The built-in [`BlobPreProcessor`] crops, resizes, normalizes, quantizes,
//! and packs pixels to match whatever the network declared for its inputs.
//! Custom pre-processors implement the same [`PreProcessor`] trait and are
//! installed through the pipeline's custom seat.

use image::{imageops, imageops::FilterType, RgbImage};

use deeplens_utils::{
    rect::Rect,
    tensor::{quantize_affine, quantize_dfp, ElemType, Layout, Quant, TensorAttr},
};
use half::f16;

use crate::{
    blob::{Blob, BlobData},
    error::{PipelineError, Result},
};

/// Inverse-mapping context captured while pre-processing one frame.
///
/// Post-processors use this to express results in original image
/// coordinates: network outputs are in blob-pixel (or normalized) space, and
/// the context knows which source region each blob was cut from.
#[derive(Debug, Clone, Default)]
pub struct PreprocContext {
    /// Source frame size in pixels.
    pub src_size: (u32, u32),
    /// Source region mapped into each blob, in source coordinates.
    pub crops: Vec<Rect>,
    /// Model input size (width, height) per blob.
    pub blob_sizes: Vec<(u32, u32)>,
}

impl PreprocContext {
    /// Map blob-pixel coordinates of blob `i` back to source coordinates.
    pub fn b2i(&self, x: f32, y: f32, i: usize) -> (f32, f32) {
        let (crop, (bw, bh)) = match (self.crops.get(i), self.blob_sizes.get(i)) {
            (Some(c), Some(s)) => (c, s),
            _ => return (x, y),
        };
        (
            crop.x as f32 + x * crop.width as f32 / *bw as f32,
            crop.y as f32 + y * crop.height as f32 / *bh as f32,
        )
    }

    /// Map normalized `[0,1]` coordinates back to source coordinates.
    pub fn n2i(&self, x: f32, y: f32, i: usize) -> (f32, f32) {
        let crop = match self.crops.get(i) {
            Some(c) => c,
            None => return (x, y),
        };
        (
            crop.x as f32 + x * crop.width as f32,
            crop.y as f32 + y * crop.height as f32,
        )
    }

    /// Scale a blob-pixel width/height of blob `i` to source pixels.
    pub fn s2i(&self, w: f32, h: f32, i: usize) -> (f32, f32) {
        let (crop, (bw, bh)) = match (self.crops.get(i), self.blob_sizes.get(i)) {
            (Some(c), Some(s)) => (c, s),
            _ => return (w, h),
        };
        (
            w * crop.width as f32 / *bw as f32,
            h * crop.height as f32 / *bh as f32,
        )
    }
}

/// Frame-to-blobs stage contract.
pub trait PreProcessor: Send {
    /// Convert `src` into one blob per entry of `attrs`.
    fn process(&mut self, src: &RgbImage, attrs: &[TensorAttr]) -> Result<Vec<Blob>>;

    /// Inverse-mapping context of the most recent [`process`](Self::process).
    fn context(&self) -> &PreprocContext;

    /// Apply one zoo parameter. Returns `Ok(true)` when the key was consumed.
    fn set_param(&mut self, _key: &str, _value: &str) -> Result<bool> {
        Ok(false)
    }

    /// Lock parameters that define the pre-processing identity.
    fn freeze(&mut self, _doit: bool) {}

    /// Human-readable lines for the info overlay (`* ` header, `- ` bullets).
    fn info(&self) -> Vec<String> {
        Vec::new()
    }
}

/// The built-in pre-processor.
pub struct BlobPreProcessor {
    /// Per-channel mean subtracted before scaling, in RGB order.
    mean: [f32; 3],
    /// Scale factor applied after mean subtraction.
    scale: f32,
    /// True when the model expects RGB channel order; false for BGR.
    rgb: bool,
    /// True to resize the full frame; false to center-crop to the model's
    /// aspect ratio first.
    resize_full: bool,
    frozen: bool,
    ctx: PreprocContext,
}

impl Default for BlobPreProcessor {
    fn default() -> Self {
        Self {
            mean: [0.0; 3],
            scale: 1.0,
            rgb: true,
            resize_full: false,
            frozen: false,
            ctx: PreprocContext::default(),
        }
    }
}

impl BlobPreProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source region to feed one blob: a center crop of the model's aspect
    /// ratio, or the full frame when `resize_full` is set.
    fn crop_rect(&self, src_w: u32, src_h: u32, model_w: usize, model_h: usize) -> Rect {
        if self.resize_full || model_w == 0 || model_h == 0 {
            return Rect::new(0, 0, src_w as i32, src_h as i32);
        }
        let src_aspect = src_w as f32 / src_h as f32;
        let model_aspect = model_w as f32 / model_h as f32;
        let crop = if src_aspect > model_aspect {
            let w = (src_h as f32 * model_aspect).round() as i32;
            Rect::new((src_w as i32 - w) / 2, 0, w, src_h as i32)
        } else {
            let h = (src_w as f32 / model_aspect).round() as i32;
            Rect::new(0, (src_h as i32 - h) / 2, src_w as i32, h)
        };
        crop.clamp(src_w, src_h)
    }

    fn make_blob(&self, src: &RgbImage, attr: &TensorAttr, crop: Rect) -> Result<Blob> {
        let (model_w, model_h) = attr.image_size().ok_or_else(|| {
            PipelineError::BlobShapeMismatch(format!(
                "input attr {} is not image shaped",
                attr.shape_str()
            ))
        })?;
        let channels = attr.channels().unwrap_or(1);
        if channels != 1 && channels != 3 {
            return Err(PipelineError::BlobShapeMismatch(format!(
                "unsupported channel count {channels} in input attr {}",
                attr.shape_str()
            )));
        }

        let region = imageops::crop_imm(
            src,
            crop.x as u32,
            crop.y as u32,
            crop.width.max(1) as u32,
            crop.height.max(1) as u32,
        )
        .to_image();
        let resized = imageops::resize(
            &region,
            model_w as u32,
            model_h as u32,
            FilterType::Triangle,
        );

        // Normalized per-pixel channel values in the model's channel order.
        let plane = model_w * model_h;
        let mut values = vec![0f32; plane * channels];
        for (y, x, px) in pixels(&resized) {
            let idx = y * model_w + x;
            if channels == 1 {
                let luma =
                    0.299 * f32::from(px[0]) + 0.587 * f32::from(px[1]) + 0.114 * f32::from(px[2]);
                values[idx] = (luma - self.mean[0]) * self.scale;
            } else {
                for c in 0..3 {
                    // Source pixels are RGB; mirror them for BGR models.
                    let s = if self.rgb { c } else { 2 - c };
                    let v = (f32::from(px[s]) - self.mean[s]) * self.scale;
                    let at = match attr.layout {
                        Layout::Nhwc => idx * 3 + c,
                        _ => c * plane + idx,
                    };
                    values[at] = v;
                }
            }
        }

        let data = cast_values(&values, attr)?;
        Blob::new(attr.clone(), data)
    }
}

fn pixels(img: &RgbImage) -> impl Iterator<Item = (usize, usize, &image::Rgb<u8>)> + '_ {
    img.enumerate_pixels()
        .map(|(x, y, px)| (y as usize, x as usize, px))
}

/// Cast normalized f32 values to the declared element type, applying the
/// declared quantization with saturation.
fn cast_values(values: &[f32], attr: &TensorAttr) -> Result<BlobData> {
    let quantize = |x: f32, lo: i64, hi: i64| -> i64 {
        match &attr.quant {
            Quant::AffineAsymmetric { scale, zero_point } => {
                quantize_affine(x, *scale, *zero_point, lo, hi)
            }
            Quant::DynamicFixedPoint { fl } => quantize_dfp(x, *fl, lo, hi),
            _ => (x.round() as i64).clamp(lo, hi),
        }
    };

    Ok(match attr.elem {
        ElemType::F32 => BlobData::F32(values.to_vec()),
        ElemType::F16 => BlobData::F16(values.iter().map(|&v| f16::from_f32(v)).collect()),
        ElemType::U8 => BlobData::U8(
            values
                .iter()
                .map(|&v| quantize(v, 0, u8::MAX as i64) as u8)
                .collect(),
        ),
        ElemType::I8 => BlobData::I8(
            values
                .iter()
                .map(|&v| quantize(v, i8::MIN as i64, i8::MAX as i64) as i8)
                .collect(),
        ),
        ElemType::U16 => BlobData::U16(
            values
                .iter()
                .map(|&v| quantize(v, 0, u16::MAX as i64) as u16)
                .collect(),
        ),
        ElemType::I16 => BlobData::I16(
            values
                .iter()
                .map(|&v| quantize(v, i16::MIN as i64, i16::MAX as i64) as i16)
                .collect(),
        ),
        ElemType::U32 => BlobData::U32(
            values
                .iter()
                .map(|&v| quantize(v, 0, u32::MAX as i64) as u32)
                .collect(),
        ),
        ElemType::I32 => BlobData::I32(
            values
                .iter()
                .map(|&v| quantize(v, i32::MIN as i64, i32::MAX as i64) as i32)
                .collect(),
        ),
        ElemType::Bool => {
            return Err(PipelineError::BlobShapeMismatch(
                "bool input tensors are not supported by the blob pre-processor".into(),
            ))
        }
    })
}

impl PreProcessor for BlobPreProcessor {
    fn process(&mut self, src: &RgbImage, attrs: &[TensorAttr]) -> Result<Vec<Blob>> {
        let (src_w, src_h) = src.dimensions();
        self.ctx = PreprocContext {
            src_size: (src_w, src_h),
            crops: Vec::with_capacity(attrs.len()),
            blob_sizes: Vec::with_capacity(attrs.len()),
        };

        let mut blobs = Vec::with_capacity(attrs.len());
        for attr in attrs {
            let (model_w, model_h) = attr.image_size().ok_or_else(|| {
                PipelineError::BlobShapeMismatch(format!(
                    "input attr {} is not image shaped",
                    attr.shape_str()
                ))
            })?;
            let crop = self.crop_rect(src_w, src_h, model_w, model_h);
            let blob = self.make_blob(src, attr, crop)?;
            self.ctx.crops.push(crop);
            self.ctx.blob_sizes.push((model_w as u32, model_h as u32));
            blobs.push(blob);
        }
        Ok(blobs)
    }

    fn context(&self) -> &PreprocContext {
        &self.ctx
    }

    fn set_param(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "mean" => {
                if self.frozen {
                    return Err(PipelineError::Param("mean is frozen while running".into()));
                }
                self.mean = parse_mean(value)?;
            }
            "scale" => {
                if self.frozen {
                    return Err(PipelineError::Param("scale is frozen while running".into()));
                }
                self.scale = value
                    .trim()
                    .parse()
                    .map_err(|_| PipelineError::Param(format!("bad scale `{value}`")))?;
            }
            "rgb" => self.rgb = parse_bool(value)?,
            "resize" => self.resize_full = parse_bool(value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn freeze(&mut self, doit: bool) {
        self.frozen = doit;
    }

    fn info(&self) -> Vec<String> {
        vec![
            "* PreProcessor: Blob".into(),
            format!(
                "- mean {:.1} {:.1} {:.1}, scale {}",
                self.mean[0], self.mean[1], self.mean[2], self.scale
            ),
            format!(
                "- {} input, {}",
                if self.rgb { "RGB" } else { "BGR" },
                if self.resize_full {
                    "full-frame resize"
                } else {
                    "center crop"
                }
            ),
        ]
    }
}

/// Parse `"R G B"` (or a single value broadcast to all channels).
fn parse_mean(value: &str) -> Result<[f32; 3]> {
    let parts: Vec<f32> = value
        .split_whitespace()
        .map(|p| p.parse::<f32>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| PipelineError::Param(format!("bad mean `{value}`")))?;
    match parts.as_slice() {
        [m] => Ok([*m; 3]),
        [r, g, b] => Ok([*r, *g, *b]),
        _ => Err(PipelineError::Param(format!("bad mean `{value}`"))),
    }
}

/// Parse the boolean spellings accepted in zoo files.
pub(crate) fn parse_bool(value: &str) -> Result<bool> {
    match value.trim() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(PipelineError::Param(format!("bad boolean `{other}`"))),
    }
}

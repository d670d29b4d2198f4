//! Cross-runtime tensor descriptors.
//!
//! Every inference backend speaks its own dialect of tensor metadata. The
//! [`TensorAttr`] type is the single canonical descriptor used throughout the
//! pipeline; backend adapters convert to and from their native enumerations
//! once at load time. The module also implements the textual tensor-spec
//! grammar used by zoo files, e.g. `NCHW:8U:1x3x224x224:AA:0.017:114`.

use std::fmt;

use half::f16;
use thiserror::Error;

/// Maximum tensor rank accepted by any stage.
pub const MAX_RANK: usize = 8;

/// Errors produced while parsing a tensor-spec string or validating a
/// [`TensorAttr`].
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("unrecognized layout `{0}` in tensor spec")]
    BadLayout(String),
    #[error("unrecognized element type `{0}` in tensor spec")]
    BadType(String),
    #[error("invalid shape `{0}` in tensor spec")]
    BadShape(String),
    #[error("invalid quantization `{0}` in tensor spec")]
    BadQuant(String),
    #[error("quantization {quant} is not allowed on element type {elem}")]
    QuantOnFloat { quant: String, elem: ElemType },
    #[error("tensor rank {0} is out of range 1..=8")]
    BadRank(usize),
    #[error("per-channel quantization axis {axis} out of range for rank {rank}")]
    BadAxis { axis: usize, rank: usize },
    #[error("per-channel quantization has {scales} scales and {zps} zero points for {dim} channels")]
    ChannelCountMismatch { scales: usize, zps: usize, dim: usize },
}

/// Element types shared by every supported runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F16,
    F32,
    Bool,
}

impl ElemType {
    /// Size of one element in bytes.
    pub const fn size_of(self) -> usize {
        match self {
            ElemType::U8 | ElemType::I8 | ElemType::Bool => 1,
            ElemType::U16 | ElemType::I16 | ElemType::F16 => 2,
            ElemType::U32 | ElemType::I32 | ElemType::F32 => 4,
        }
    }

    /// True for the integer types that may carry quantization metadata.
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            ElemType::U8 | ElemType::I8 | ElemType::U16 | ElemType::I16 | ElemType::U32 | ElemType::I32
        )
    }

    /// Parse the short code used in tensor-spec strings (`8U`, `32F`, ...).
    pub fn from_code(code: &str) -> Result<Self, SpecError> {
        match code {
            "8U" => Ok(ElemType::U8),
            "8S" => Ok(ElemType::I8),
            "16U" => Ok(ElemType::U16),
            "16S" => Ok(ElemType::I16),
            "32U" => Ok(ElemType::U32),
            "32S" => Ok(ElemType::I32),
            "16F" => Ok(ElemType::F16),
            "32F" => Ok(ElemType::F32),
            "BOOL" => Ok(ElemType::Bool),
            other => Err(SpecError::BadType(other.to_string())),
        }
    }

    /// The short code used in tensor-spec strings.
    pub const fn code(self) -> &'static str {
        match self {
            ElemType::U8 => "8U",
            ElemType::I8 => "8S",
            ElemType::U16 => "16U",
            ElemType::I16 => "16S",
            ElemType::U32 => "32U",
            ElemType::I32 => "32S",
            ElemType::F16 => "16F",
            ElemType::F32 => "32F",
            ElemType::Bool => "BOOL",
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Memory layout of an image-shaped tensor. Informational only: it never
/// reorders data, it tells the pre-processor how to pack pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Layout {
    #[default]
    Nchw,
    Nhwc,
    /// Not an image-shaped tensor.
    Na,
}

impl Layout {
    pub fn from_code(code: &str) -> Result<Self, SpecError> {
        match code {
            "NCHW" => Ok(Layout::Nchw),
            "NHWC" => Ok(Layout::Nhwc),
            "NA" => Ok(Layout::Na),
            other => Err(SpecError::BadLayout(other.to_string())),
        }
    }

    pub const fn code(self) -> &'static str {
        match self {
            Layout::Nchw => "NCHW",
            Layout::Nhwc => "NHWC",
            Layout::Na => "NA",
        }
    }
}

/// Quantization descriptor attached to integer tensors.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Quant {
    #[default]
    None,
    /// Dynamic fixed point: `real = raw * 2^-fl`.
    DynamicFixedPoint { fl: i8 },
    /// Affine asymmetric: `real = (raw - zero_point) * scale`.
    AffineAsymmetric { scale: f32, zero_point: i32 },
    /// Affine with one (scale, zero point) pair per channel along `axis`.
    AffinePerChannel {
        axis: usize,
        scales: Vec<f32>,
        zero_points: Vec<i32>,
    },
}

impl Quant {
    pub fn is_none(&self) -> bool {
        matches!(self, Quant::None)
    }

    fn kind(&self) -> &'static str {
        match self {
            Quant::None => "none",
            Quant::DynamicFixedPoint { .. } => "DFP",
            Quant::AffineAsymmetric { .. } => "AA",
            Quant::AffinePerChannel { .. } => "APC",
        }
    }
}

/// Canonical descriptor of one tensor: layout, element type, shape, and
/// quantization. See the module docs for the spec-string grammar.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorAttr {
    pub layout: Layout,
    pub elem: ElemType,
    pub dims: Vec<usize>,
    pub quant: Quant,
}

impl TensorAttr {
    /// Build a descriptor, validating rank, quantization/type compatibility,
    /// and per-channel bookkeeping.
    pub fn new(
        layout: Layout,
        elem: ElemType,
        dims: Vec<usize>,
        quant: Quant,
    ) -> Result<Self, SpecError> {
        let attr = Self {
            layout,
            elem,
            dims,
            quant,
        };
        attr.validate()?;
        Ok(attr)
    }

    /// Shorthand for an unquantized tensor.
    pub fn plain(layout: Layout, elem: ElemType, dims: Vec<usize>) -> Result<Self, SpecError> {
        Self::new(layout, elem, dims, Quant::None)
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        let rank = self.dims.len();
        if rank == 0 || rank > MAX_RANK {
            return Err(SpecError::BadRank(rank));
        }
        if !self.quant.is_none() && !self.elem.is_integer() {
            return Err(SpecError::QuantOnFloat {
                quant: self.quant.kind().to_string(),
                elem: self.elem,
            });
        }
        if let Quant::AffinePerChannel {
            axis,
            scales,
            zero_points,
        } = &self.quant
        {
            if *axis >= rank {
                return Err(SpecError::BadAxis { axis: *axis, rank });
            }
            let dim = self.dims[*axis];
            if scales.len() != dim || zero_points.len() != dim {
                return Err(SpecError::ChannelCountMismatch {
                    scales: scales.len(),
                    zps: zero_points.len(),
                    dim,
                });
            }
        }
        Ok(())
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements (product of all dimensions).
    pub fn elem_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Total payload size in bytes.
    pub fn byte_len(&self) -> usize {
        self.elem_count() * self.elem.size_of()
    }

    /// Width and height of an image-shaped tensor, honoring the layout.
    ///
    /// Returns `None` for tensors that do not look like `N…HW`/`N…HWC` images.
    pub fn image_size(&self) -> Option<(usize, usize)> {
        match (self.layout, self.dims.as_slice()) {
            (Layout::Nchw, [_, _, h, w]) => Some((*w, *h)),
            (Layout::Nhwc, [_, h, w, _]) => Some((*w, *h)),
            (_, [h, w]) => Some((*w, *h)),
            _ => None,
        }
    }

    /// Channel count of an image-shaped tensor, honoring the layout.
    pub fn channels(&self) -> Option<usize> {
        match (self.layout, self.dims.as_slice()) {
            (Layout::Nchw, [_, c, _, _]) => Some(*c),
            (Layout::Nhwc, [_, _, _, c]) => Some(*c),
            _ => None,
        }
    }

    /// Human-readable shape summary, e.g. `4D 1x3x224x224 8U`.
    pub fn shape_str(&self) -> String {
        format!("{}D {} {}", self.rank(), dims_to_string(&self.dims), self.elem)
    }
}

impl fmt::Display for TensorAttr {
    /// Formats back to the spec-string grammar so that parse∘format
    /// round-trips.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.layout.code(),
            self.elem.code(),
            dims_to_string(&self.dims)
        )?;
        match &self.quant {
            Quant::None => Ok(()),
            Quant::DynamicFixedPoint { fl } => write!(f, ":DFP:{fl}"),
            Quant::AffineAsymmetric { scale, zero_point } => {
                write!(f, ":AA:{scale}:{zero_point}")
            }
            Quant::AffinePerChannel { axis, scales, .. } => {
                // Per-channel parameters come from backend SDKs, never from
                // spec strings; summarize instead of dumping every channel.
                write!(f, ":APC:axis{axis}:{}ch", scales.len())
            }
        }
    }
}

fn dims_to_string(dims: &[usize]) -> String {
    dims.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("x")
}

/// Parse an `AxBxC...` shape string.
pub fn parse_shape(s: &str) -> Result<Vec<usize>, SpecError> {
    let dims: Vec<usize> = s
        .split('x')
        .map(|d| d.trim().parse::<usize>())
        .collect::<Result<_, _>>()
        .map_err(|_| SpecError::BadShape(s.to_string()))?;
    if dims.is_empty() || dims.iter().any(|&d| d == 0) {
        return Err(SpecError::BadShape(s.to_string()));
    }
    Ok(dims)
}

/// Parse a comma-separated list of tensor descriptors.
///
/// Each descriptor is a colon-separated sequence `LAYOUT:TYPE:SHAPE[:QUANT…]`
/// where `QUANT` is `AA:<scale>:<zero_point>` or `DFP:<fl>`. An empty input
/// yields an empty list.
pub fn parse_tensor_specs(specs: &str) -> Result<Vec<TensorAttr>, SpecError> {
    let trimmed = specs.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    trimmed.split(',').map(|s| parse_one_spec(s.trim())).collect()
}

fn parse_one_spec(spec: &str) -> Result<TensorAttr, SpecError> {
    let mut fields = spec.split(':');

    let layout = Layout::from_code(fields.next().unwrap_or_default().trim())?;
    let elem = ElemType::from_code(
        fields
            .next()
            .ok_or_else(|| SpecError::BadType(String::new()))?
            .trim(),
    )?;
    let dims = parse_shape(
        fields
            .next()
            .ok_or_else(|| SpecError::BadShape(String::new()))?
            .trim(),
    )?;

    let quant = match fields.next().map(str::trim) {
        None => Quant::None,
        Some("AA") => {
            let scale = next_number::<f32>(&mut fields, spec)?;
            let zero_point = next_number::<i32>(&mut fields, spec)?;
            Quant::AffineAsymmetric { scale, zero_point }
        }
        Some("DFP") => {
            let fl = next_number::<i8>(&mut fields, spec)?;
            Quant::DynamicFixedPoint { fl }
        }
        Some(other) => return Err(SpecError::BadQuant(other.to_string())),
    };

    if fields.next().is_some() {
        return Err(SpecError::BadQuant(spec.to_string()));
    }

    TensorAttr::new(layout, elem, dims, quant)
}

fn next_number<T: std::str::FromStr>(
    fields: &mut std::str::Split<'_, char>,
    spec: &str,
) -> Result<T, SpecError> {
    fields
        .next()
        .and_then(|v| v.trim().parse::<T>().ok())
        .ok_or_else(|| SpecError::BadQuant(spec.to_string()))
}

/// Affine dequantization: `real = (raw - zero_point) * scale`.
pub fn dequantize_affine<T: Copy + Into<i64>>(raw: &[T], scale: f32, zero_point: i32) -> Vec<f32> {
    raw.iter()
        .map(|&v| (v.into() - zero_point as i64) as f32 * scale)
        .collect()
}

/// Dynamic-fixed-point dequantization: `real = raw * 2^-fl`.
pub fn dequantize_dfp<T: Copy + Into<i64>>(raw: &[T], fl: i8) -> Vec<f32> {
    let factor = (-f32::from(fl)).exp2();
    raw.iter().map(|&v| v.into() as f32 * factor).collect()
}

/// Affine quantization with saturation: `raw = round(x / scale) + zero_point`.
pub fn quantize_affine(x: f32, scale: f32, zero_point: i32, lo: i64, hi: i64) -> i64 {
    let q = (x / scale).round() as i64 + zero_point as i64;
    q.clamp(lo, hi)
}

/// DFP quantization with saturation: `raw = round(x * 2^fl)`.
pub fn quantize_dfp(x: f32, fl: i8, lo: i64, hi: i64) -> i64 {
    let q = (x * f32::from(fl).exp2()).round() as i64;
    q.clamp(lo, hi)
}

/// Widen a raw f16 bit pattern to f32.
pub fn f16_bits_to_f32(bits: u16) -> f32 {
    f16::from_bits(bits).to_f32()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quantized_u8_spec() {
        let attrs = parse_tensor_specs("NCHW:8U:1x3x224x224:AA:0.017:114").unwrap();
        assert_eq!(attrs.len(), 1);
        let attr = &attrs[0];
        assert_eq!(attr.layout, Layout::Nchw);
        assert_eq!(attr.elem, ElemType::U8);
        assert_eq!(attr.dims, vec![1, 3, 224, 224]);
        assert_eq!(
            attr.quant,
            Quant::AffineAsymmetric {
                scale: 0.017,
                zero_point: 114
            }
        );
        assert_eq!(attr.elem_count(), 3 * 224 * 224);
        assert_eq!(attr.image_size(), Some((224, 224)));
        assert_eq!(attr.channels(), Some(3));
    }

    #[test]
    fn parses_multiple_specs() {
        let attrs =
            parse_tensor_specs("NCHW:8U:1x3x224x224:AA:0.017:114, NHWC:32F:1x300x300x3").unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[1].layout, Layout::Nhwc);
        assert_eq!(attrs[1].elem, ElemType::F32);
        assert!(attrs[1].quant.is_none());
    }

    #[test]
    fn empty_spec_is_valid_and_empty() {
        assert!(parse_tensor_specs("").unwrap().is_empty());
        assert!(parse_tensor_specs("   ").unwrap().is_empty());
    }

    #[test]
    fn round_trips_through_display() {
        for spec in [
            "NCHW:8U:1x3x224x224:AA:0.017:114",
            "NHWC:32F:1x300x300x3",
            "NA:32S:10",
            "NCHW:8S:1x255x13x13:DFP:7",
        ] {
            let attrs = parse_tensor_specs(spec).unwrap();
            let formatted = attrs[0].to_string();
            let reparsed = parse_tensor_specs(&formatted).unwrap();
            assert_eq!(attrs, reparsed, "round trip failed for {spec}");
        }
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!(matches!(
            parse_tensor_specs("NCWH:8U:1x3x4x4"),
            Err(SpecError::BadLayout(_))
        ));
        assert!(matches!(
            parse_tensor_specs("NCHW:9U:1x3x4x4"),
            Err(SpecError::BadType(_))
        ));
        assert!(matches!(
            parse_tensor_specs("NCHW:8U:1x3xx4"),
            Err(SpecError::BadShape(_))
        ));
        // AA without its numeric fields
        assert!(matches!(
            parse_tensor_specs("NCHW:8U:1x3x4x4:AA"),
            Err(SpecError::BadQuant(_))
        ));
        assert!(matches!(
            parse_tensor_specs("NCHW:8U:1x3x4x4:AA:0.5"),
            Err(SpecError::BadQuant(_))
        ));
        // quantization on a float tensor
        assert!(matches!(
            parse_tensor_specs("NCHW:32F:1x3x4x4:AA:0.5:0"),
            Err(SpecError::QuantOnFloat { .. })
        ));
        // trailing junk
        assert!(matches!(
            parse_tensor_specs("NCHW:8U:1x3x4x4:AA:0.5:0:junk"),
            Err(SpecError::BadQuant(_))
        ));
    }

    #[test]
    fn per_channel_quant_is_validated() {
        let bad_axis = TensorAttr::new(
            Layout::Nchw,
            ElemType::I8,
            vec![1, 4, 2, 2],
            Quant::AffinePerChannel {
                axis: 4,
                scales: vec![1.0; 4],
                zero_points: vec![0; 4],
            },
        );
        assert!(matches!(bad_axis, Err(SpecError::BadAxis { .. })));

        let bad_count = TensorAttr::new(
            Layout::Nchw,
            ElemType::I8,
            vec![1, 4, 2, 2],
            Quant::AffinePerChannel {
                axis: 1,
                scales: vec![1.0; 3],
                zero_points: vec![0; 4],
            },
        );
        assert!(matches!(bad_count, Err(SpecError::ChannelCountMismatch { .. })));

        let ok = TensorAttr::new(
            Layout::Nchw,
            ElemType::I8,
            vec![1, 4, 2, 2],
            Quant::AffinePerChannel {
                axis: 1,
                scales: vec![1.0; 4],
                zero_points: vec![0; 4],
            },
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn dequantization_matches_definitions() {
        let raw: [u8; 3] = [114, 115, 113];
        let deq = dequantize_affine(&raw, 0.017, 114);
        assert!(deq[0].abs() < 1e-6);
        assert!((deq[1] - 0.017).abs() < 1e-6);
        assert!((deq[2] + 0.017).abs() < 1e-6);

        let raw: [i8; 2] = [64, -64];
        let deq = dequantize_dfp(&raw, 7);
        assert!((deq[0] - 0.5).abs() < 1e-6);
        assert!((deq[1] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn quantization_saturates() {
        assert_eq!(quantize_affine(10_000.0, 0.017, 114, 0, 255), 255);
        assert_eq!(quantize_affine(-10_000.0, 0.017, 114, 0, 255), 0);
        assert_eq!(quantize_affine(0.0, 0.017, 114, 0, 255), 114);
        assert_eq!(quantize_dfp(0.5, 7, -128, 127), 64);
    }

    #[test]
    fn shape_str_matches_convention() {
        let attr = TensorAttr::plain(Layout::Nchw, ElemType::U8, vec![1, 3, 224, 224]).unwrap();
        assert_eq!(attr.shape_str(), "4D 1x3x224x224 8U");
    }
}

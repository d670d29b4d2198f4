//! The buffers handed between pipeline stages.
//!
//! A [`Blob`] couples a typed flat buffer with its [`TensorAttr`] descriptor.
//! Blobs are created by the pre-processor, owned by the pipeline for the
//! duration of one frame, and passed by shared reference to the network.

use deeplens_utils::tensor::{
    dequantize_affine, dequantize_dfp, ElemType, Layout, Quant, TensorAttr,
};
use half::f16;

use crate::error::{PipelineError, Result};

/// Typed payload of a blob. One variant per [`ElemType`].
#[derive(Debug, Clone, PartialEq)]
pub enum BlobData {
    U8(Vec<u8>),
    I8(Vec<i8>),
    U16(Vec<u16>),
    I16(Vec<i16>),
    U32(Vec<u32>),
    I32(Vec<i32>),
    F16(Vec<f16>),
    F32(Vec<f32>),
    Bool(Vec<u8>),
}

impl BlobData {
    pub fn len(&self) -> usize {
        match self {
            BlobData::U8(v) | BlobData::Bool(v) => v.len(),
            BlobData::I8(v) => v.len(),
            BlobData::U16(v) => v.len(),
            BlobData::I16(v) => v.len(),
            BlobData::U32(v) => v.len(),
            BlobData::I32(v) => v.len(),
            BlobData::F16(v) => v.len(),
            BlobData::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn elem_type(&self) -> ElemType {
        match self {
            BlobData::U8(_) => ElemType::U8,
            BlobData::I8(_) => ElemType::I8,
            BlobData::U16(_) => ElemType::U16,
            BlobData::I16(_) => ElemType::I16,
            BlobData::U32(_) => ElemType::U32,
            BlobData::I32(_) => ElemType::I32,
            BlobData::F16(_) => ElemType::F16,
            BlobData::F32(_) => ElemType::F32,
            BlobData::Bool(_) => ElemType::Bool,
        }
    }

    /// Allocate a zeroed buffer for `elem` with `count` elements.
    pub fn zeros(elem: ElemType, count: usize) -> Self {
        match elem {
            ElemType::U8 => BlobData::U8(vec![0; count]),
            ElemType::I8 => BlobData::I8(vec![0; count]),
            ElemType::U16 => BlobData::U16(vec![0; count]),
            ElemType::I16 => BlobData::I16(vec![0; count]),
            ElemType::U32 => BlobData::U32(vec![0; count]),
            ElemType::I32 => BlobData::I32(vec![0; count]),
            ElemType::F16 => BlobData::F16(vec![f16::ZERO; count]),
            ElemType::F32 => BlobData::F32(vec![0.0; count]),
            ElemType::Bool => BlobData::Bool(vec![0; count]),
        }
    }
}

/// A logically n-dimensional numeric buffer with its tensor descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    attr: TensorAttr,
    data: BlobData,
}

impl Blob {
    /// Couple a buffer with its descriptor, checking element type and count.
    pub fn new(attr: TensorAttr, data: BlobData) -> Result<Self> {
        if data.elem_type() != attr.elem {
            return Err(PipelineError::ShapeMismatch(format!(
                "blob payload is {} but attr declares {}",
                data.elem_type(),
                attr.elem
            )));
        }
        if data.len() != attr.elem_count() {
            return Err(PipelineError::ShapeMismatch(format!(
                "blob has {} elements but attr {} declares {}",
                data.len(),
                attr.shape_str(),
                attr.elem_count()
            )));
        }
        Ok(Self { attr, data })
    }

    /// A zero-filled blob matching `attr`.
    pub fn zeros(attr: TensorAttr) -> Self {
        let data = BlobData::zeros(attr.elem, attr.elem_count());
        Self { attr, data }
    }

    /// Reinterpret a raw byte buffer (e.g. straight from a backend SDK)
    /// according to `attr`.
    pub fn from_bytes(attr: TensorAttr, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != attr.byte_len() {
            return Err(PipelineError::ShapeMismatch(format!(
                "{} bytes for attr {} which needs {}",
                bytes.len(),
                attr.shape_str(),
                attr.byte_len()
            )));
        }
        let data = match attr.elem {
            ElemType::U8 => BlobData::U8(bytes.to_vec()),
            ElemType::Bool => BlobData::Bool(bytes.to_vec()),
            ElemType::I8 => BlobData::I8(bytemuck::cast_slice::<u8, i8>(bytes).to_vec()),
            ElemType::U16 => BlobData::U16(bytemuck::cast_slice::<u8, u16>(bytes).to_vec()),
            ElemType::I16 => BlobData::I16(bytemuck::cast_slice::<u8, i16>(bytes).to_vec()),
            ElemType::U32 => BlobData::U32(bytemuck::cast_slice::<u8, u32>(bytes).to_vec()),
            ElemType::I32 => BlobData::I32(bytemuck::cast_slice::<u8, i32>(bytes).to_vec()),
            ElemType::F16 => BlobData::F16(bytemuck::cast_slice::<u8, f16>(bytes).to_vec()),
            ElemType::F32 => BlobData::F32(bytemuck::cast_slice::<u8, f32>(bytes).to_vec()),
        };
        Ok(Self { attr, data })
    }

    pub fn attr(&self) -> &TensorAttr {
        &self.attr
    }

    pub fn data(&self) -> &BlobData {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The payload viewed as raw bytes (for handing to backend SDKs).
    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            BlobData::U8(v) | BlobData::Bool(v) => v.as_slice(),
            BlobData::I8(v) => bytemuck::cast_slice(v),
            BlobData::U16(v) => bytemuck::cast_slice(v),
            BlobData::I16(v) => bytemuck::cast_slice(v),
            BlobData::U32(v) => bytemuck::cast_slice(v),
            BlobData::I32(v) => bytemuck::cast_slice(v),
            BlobData::F16(v) => bytemuck::cast_slice(v),
            BlobData::F32(v) => bytemuck::cast_slice(v),
        }
    }

    /// Borrow the payload as f32, if it is f32.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            BlobData::F32(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Plain numeric widening to f32, ignoring quantization metadata.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            BlobData::U8(v) | BlobData::Bool(v) => v.iter().map(|&x| f32::from(x)).collect(),
            BlobData::I8(v) => v.iter().map(|&x| f32::from(x)).collect(),
            BlobData::U16(v) => v.iter().map(|&x| f32::from(x)).collect(),
            BlobData::I16(v) => v.iter().map(|&x| f32::from(x)).collect(),
            BlobData::U32(v) => v.iter().map(|&x| x as f32).collect(),
            BlobData::I32(v) => v.iter().map(|&x| x as f32).collect(),
            BlobData::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
            BlobData::F32(v) => v.clone(),
        }
    }

    /// Convert to an f32 blob, applying the declared quantization.
    ///
    /// Unquantized integer payloads are widened numerically; float payloads
    /// pass through (f16 widened).
    pub fn dequantized(&self) -> Result<Blob> {
        let values = match (&self.attr.quant, &self.data) {
            (Quant::AffineAsymmetric { scale, zero_point }, data) => {
                affine_all(data, *scale, *zero_point)?
            }
            (Quant::DynamicFixedPoint { fl }, data) => dfp_all(data, *fl)?,
            (Quant::AffinePerChannel {
                axis,
                scales,
                zero_points,
            }, _) => self.dequantize_per_channel(*axis, scales, zero_points),
            (Quant::None, _) => self.to_f32_vec(),
        };

        let attr = TensorAttr::new(
            self.attr.layout,
            ElemType::F32,
            self.attr.dims.clone(),
            Quant::None,
        )?;
        Blob::new(attr, BlobData::F32(values))
    }

    fn dequantize_per_channel(&self, axis: usize, scales: &[f32], zero_points: &[i32]) -> Vec<f32> {
        let raw = self.to_f32_vec();
        let inner: usize = self.attr.dims[axis + 1..].iter().product();
        let channels = self.attr.dims[axis];
        raw.iter()
            .enumerate()
            .map(|(i, &x)| {
                let c = (i / inner) % channels;
                (x - zero_points[c] as f32) * scales[c]
            })
            .collect()
    }

    /// A 1-D f32 blob concatenating `blobs` in order.
    pub fn concat_f32(blobs: &[Blob]) -> Result<Blob> {
        let mut all = Vec::new();
        for b in blobs {
            match b.as_f32() {
                Some(s) => all.extend_from_slice(s),
                None => all.extend(b.to_f32_vec()),
            }
        }
        let len = all.len().max(1);
        let attr = TensorAttr::new(Layout::Na, ElemType::F32, vec![len], Quant::None)?;
        let mut data = all;
        data.resize(len, 0.0);
        Blob::new(attr, BlobData::F32(data))
    }
}

fn affine_all(data: &BlobData, scale: f32, zp: i32) -> Result<Vec<f32>> {
    Ok(match data {
        BlobData::U8(v) | BlobData::Bool(v) => dequantize_affine(v, scale, zp),
        BlobData::I8(v) => dequantize_affine(v, scale, zp),
        BlobData::U16(v) => dequantize_affine(v, scale, zp),
        BlobData::I16(v) => dequantize_affine(v, scale, zp),
        BlobData::U32(v) => dequantize_affine(v, scale, zp),
        BlobData::I32(v) => dequantize_affine(v, scale, zp),
        BlobData::F16(_) | BlobData::F32(_) => {
            return Err(PipelineError::ShapeMismatch(
                "affine quantization on a float blob".into(),
            ))
        }
    })
}

fn dfp_all(data: &BlobData, fl: i8) -> Result<Vec<f32>> {
    Ok(match data {
        BlobData::U8(v) | BlobData::Bool(v) => dequantize_dfp(v, fl),
        BlobData::I8(v) => dequantize_dfp(v, fl),
        BlobData::U16(v) => dequantize_dfp(v, fl),
        BlobData::I16(v) => dequantize_dfp(v, fl),
        BlobData::U32(v) => dequantize_dfp(v, fl),
        BlobData::I32(v) => dequantize_dfp(v, fl),
        BlobData::F16(_) | BlobData::F32(_) => {
            return Err(PipelineError::ShapeMismatch(
                "DFP quantization on a float blob".into(),
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use deeplens_utils::tensor::Layout;

    fn u8_attr(quant: Quant) -> TensorAttr {
        TensorAttr::new(Layout::Na, ElemType::U8, vec![4], quant).unwrap()
    }

    #[test]
    fn rejects_wrong_payload_length() {
        let attr = u8_attr(Quant::None);
        assert!(Blob::new(attr, BlobData::U8(vec![1, 2, 3])).is_err());
    }

    #[test]
    fn rejects_wrong_payload_type() {
        let attr = u8_attr(Quant::None);
        assert!(Blob::new(attr, BlobData::F32(vec![0.0; 4])).is_err());
    }

    #[test]
    fn dequantizes_affine_u8() {
        let attr = u8_attr(Quant::AffineAsymmetric {
            scale: 0.5,
            zero_point: 10,
        });
        let blob = Blob::new(attr, BlobData::U8(vec![10, 12, 8, 10])).unwrap();
        let deq = blob.dequantized().unwrap();
        assert_eq!(deq.attr().elem, ElemType::F32);
        assert_eq!(deq.as_f32().unwrap(), &[0.0, 1.0, -1.0, 0.0]);
        assert!(deq.attr().quant.is_none());
    }

    #[test]
    fn dequantizes_per_channel() {
        let attr = TensorAttr::new(
            Layout::Nchw,
            ElemType::I8,
            vec![1, 2, 1, 2],
            Quant::AffinePerChannel {
                axis: 1,
                scales: vec![1.0, 0.5],
                zero_points: vec![0, 2],
            },
        )
        .unwrap();
        let blob = Blob::new(attr, BlobData::I8(vec![1, 2, 4, 6])).unwrap();
        let deq = blob.dequantized().unwrap();
        assert_eq!(deq.as_f32().unwrap(), &[1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn round_trips_through_bytes() {
        let attr = TensorAttr::plain(Layout::Na, ElemType::F32, vec![3]).unwrap();
        let blob = Blob::new(attr.clone(), BlobData::F32(vec![1.0, -2.0, 0.5])).unwrap();
        let rebuilt = Blob::from_bytes(attr, blob.as_bytes()).unwrap();
        assert_eq!(blob, rebuilt);
    }

    #[test]
    fn concatenates_outputs_in_order() {
        let a = Blob::new(
            TensorAttr::plain(Layout::Na, ElemType::F32, vec![2]).unwrap(),
            BlobData::F32(vec![1.0, 2.0]),
        )
        .unwrap();
        let b = Blob::new(
            TensorAttr::plain(Layout::Na, ElemType::F32, vec![2]).unwrap(),
            BlobData::F32(vec![3.0, 4.0]),
        )
        .unwrap();
        let cat = Blob::concat_f32(&[a, b]).unwrap();
        assert_eq!(cat.as_f32().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(cat.attr().dims, vec![4]);
    }
}

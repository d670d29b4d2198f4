//! General-purpose CPU backend running ONNX graphs through tract.
//!
//! This plays the "general-purpose" seat of the pipeline: no accelerator
//! required, any ONNX model. Zoo files written for the OpenCV seat keep
//! working (`nettype: OpenCV` is accepted as an alias by the pipeline).

use std::path::{Path, PathBuf};

use log::{debug, warn};
use tract_onnx::prelude::{
    Datum, DatumType, Framework, Graph, InferenceFact, InferenceModelExt, IntoTensor, SimplePlan,
    TValue, Tensor, TypedFact, TypedOp, tvec,
};

use deeplens_utils::tensor::{parse_tensor_specs, ElemType, Layout, Quant, TensorAttr};

use crate::{
    blob::{Blob, BlobData},
    error::{PipelineError, Result},
    network::Backend,
};

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// tract-onnx backend.
pub struct OnnxBackend {
    dataroot: PathBuf,
    model: Option<PathBuf>,
    intensors: String,
    outtensors: String,
    target: String,
    plan: Option<RunnableModel>,
    in_attrs: Vec<TensorAttr>,
    out_attrs: Vec<TensorAttr>,
    frozen: bool,
}

impl Default for OnnxBackend {
    fn default() -> Self {
        Self {
            dataroot: PathBuf::from("."),
            model: None,
            intensors: String::new(),
            outtensors: String::new(),
            target: "CPU".into(),
            plan: None,
            in_attrs: Vec::new(),
            out_attrs: Vec::new(),
            frozen: false,
        }
    }
}

impl OnnxBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn model_path(&self) -> Result<PathBuf> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| PipelineError::BackendFailure("no model file configured".into()))?;
        Ok(if model.is_absolute() {
            model.clone()
        } else {
            self.dataroot.join(model)
        })
    }
}

fn load_runnable(path: &Path, input_facts: &[TensorAttr], optimized: bool) -> Result<RunnableModel> {
    let mut model = tract_onnx::onnx()
        .model_for_path(path)
        .map_err(|e| PipelineError::BackendFailure(format!("cannot parse {}: {e}", path.display())))?;

    // Pin declared input shapes so the optimizer can specialize the graph.
    for (i, attr) in input_facts.iter().enumerate() {
        let dt = elem_to_datum(attr.elem);
        let fact = InferenceFact::dt_shape(dt, attr.dims.clone());
        model = model
            .with_input_fact(i, fact)
            .map_err(|e| PipelineError::BackendFailure(format!("bad input fact {i}: {e}")))?;
    }

    if optimized {
        model
            .into_optimized()
            .map_err(|e| PipelineError::BackendFailure(format!("unable to optimize graph: {e}")))?
            .into_runnable()
            .map_err(|e| PipelineError::BackendFailure(format!("unable to plan graph: {e}")))
    } else {
        model
            .into_typed()
            .map_err(|e| PipelineError::BackendFailure(format!("unable to type graph: {e}")))?
            .into_decluttered()
            .map_err(|e| PipelineError::BackendFailure(format!("unable to declutter graph: {e}")))?
            .into_runnable()
            .map_err(|e| PipelineError::BackendFailure(format!("unable to plan graph: {e}")))
    }
}

/// Derive canonical attrs for the plan's outputs, for when no `outtensors`
/// spec was declared.
fn derive_output_attrs(plan: &RunnableModel) -> Result<Vec<TensorAttr>> {
    let model = plan.model();
    let mut attrs = Vec::new();
    for (i, outlet) in model.outputs.iter().enumerate() {
        let fact = model
            .outlet_fact(*outlet)
            .map_err(|e| PipelineError::BackendFailure(format!("output {i} fact: {e}")))?;
        let dims = fact.shape.as_concrete().ok_or_else(|| {
            PipelineError::BackendFailure(format!(
                "output {i} has a symbolic shape; declare it with an outtensors spec"
            ))
        })?;
        let elem = datum_to_elem(fact.datum_type).unwrap_or(ElemType::F32);
        let layout = if dims.len() == 4 { Layout::Nchw } else { Layout::Na };
        attrs.push(TensorAttr::new(layout, elem, dims.to_vec(), Quant::None)?);
    }
    Ok(attrs)
}

impl Backend for OnnxBackend {
    fn name(&self) -> &'static str {
        "Onnx"
    }

    fn load(&mut self) -> Result<()> {
        let path = self.model_path()?;
        if !path.exists() {
            return Err(PipelineError::BackendFailure(format!(
                "model file not found: {}",
                path.display()
            )));
        }

        self.in_attrs = parse_tensor_specs(&self.intensors)?;
        if self.in_attrs.is_empty() {
            return Err(PipelineError::BackendFailure(
                "the Onnx backend needs an intensors spec".into(),
            ));
        }

        // Optimized load first, decluttered fallback for graphs tract cannot
        // fully specialize (the fallback runs, just slower).
        let plan = match load_runnable(&path, &self.in_attrs, true) {
            Ok(plan) => {
                debug!("onnx graph {} optimized", path.display());
                plan
            }
            Err(opt_err) => {
                warn!(
                    "onnx graph {} failed optimized load ({opt_err}); falling back to decluttered graph",
                    path.display()
                );
                load_runnable(&path, &self.in_attrs, false)?
            }
        };

        self.out_attrs = parse_tensor_specs(&self.outtensors)?;
        if self.out_attrs.is_empty() {
            self.out_attrs = derive_output_attrs(&plan)?;
        }
        self.plan = Some(plan);
        Ok(())
    }

    fn input_attrs(&self) -> Result<Vec<TensorAttr>> {
        if self.in_attrs.is_empty() {
            // Declared specs are known before load; absent ones are not.
            let declared = parse_tensor_specs(&self.intensors)?;
            if declared.is_empty() {
                return Err(PipelineError::ModelNotLoaded);
            }
            return Ok(declared);
        }
        Ok(self.in_attrs.clone())
    }

    fn output_attrs(&self) -> Result<Vec<TensorAttr>> {
        if self.out_attrs.is_empty() {
            return Err(PipelineError::ModelNotLoaded);
        }
        Ok(self.out_attrs.clone())
    }

    fn forward(&mut self, blobs: &[Blob], info: &mut Vec<String>) -> Result<Vec<Blob>> {
        let plan = self.plan.as_ref().ok_or(PipelineError::ModelNotLoaded)?;

        let inputs: Vec<_> = blobs
            .iter()
            .map(blob_to_tensor)
            .collect::<Result<Vec<Tensor>>>()?;
        let mut feed: tract_onnx::prelude::TVec<TValue> = tvec!();
        for t in inputs {
            feed.push(t.into());
        }

        let outputs = plan
            .run(feed)
            .map_err(|e| PipelineError::BackendFailure(format!("onnx run failed: {e}")))?;

        info.push(format!("* Onnx ({})", self.target));
        let mut outs = Vec::with_capacity(outputs.len());
        for (i, value) in outputs.into_iter().enumerate() {
            let tensor = value.into_tensor();
            let declared = self.out_attrs.get(i);
            let blob = tensor_to_blob(&tensor, declared)?;
            info.push(format!("- out {i}: {}", blob.attr().shape_str()));
            outs.push(blob);
        }

        if outs.len() != self.out_attrs.len() {
            return Err(PipelineError::ShapeMismatch(format!(
                "model produced {} outputs, declared {}",
                outs.len(),
                self.out_attrs.len()
            )));
        }
        Ok(outs)
    }

    fn set_param(&mut self, key: &str, value: &str) -> Result<bool> {
        let identity = matches!(key, "model" | "config" | "dataroot" | "intensors" | "outtensors");
        if identity && self.frozen {
            return Err(PipelineError::Param(format!("{key} is frozen while running")));
        }
        match key {
            "model" => self.model = Some(PathBuf::from(value)),
            "dataroot" => self.dataroot = PathBuf::from(value),
            "intensors" => {
                parse_tensor_specs(value)?; // malformed specs fail at configuration time
                self.intensors = value.to_string();
            }
            "outtensors" => {
                parse_tensor_specs(value)?;
                self.outtensors = value.to_string();
            }
            // OpenCV-era knobs: accepted so zoo files keep working, echoed in
            // the info channel, but everything runs on the CPU plan.
            "target" | "backend" => self.target = value.to_string(),
            "config" => {}
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn freeze(&mut self, doit: bool) {
        self.frozen = doit;
    }
}

fn elem_to_datum(elem: ElemType) -> DatumType {
    match elem {
        ElemType::U8 => DatumType::U8,
        ElemType::I8 => DatumType::I8,
        ElemType::U16 => DatumType::U16,
        ElemType::I16 => DatumType::I16,
        ElemType::U32 => DatumType::U32,
        ElemType::I32 => DatumType::I32,
        // f16 blobs are widened at this boundary
        ElemType::F16 | ElemType::F32 => DatumType::F32,
        ElemType::Bool => DatumType::Bool,
    }
}

fn datum_to_elem(dt: DatumType) -> Option<ElemType> {
    Some(match dt {
        DatumType::U8 => ElemType::U8,
        DatumType::I8 => ElemType::I8,
        DatumType::U16 => ElemType::U16,
        DatumType::I16 => ElemType::I16,
        DatumType::U32 => ElemType::U32,
        DatumType::I32 => ElemType::I32,
        DatumType::F32 => ElemType::F32,
        DatumType::Bool => ElemType::Bool,
        _ => return None,
    })
}

fn blob_to_tensor(blob: &Blob) -> Result<Tensor> {
    let dims = blob.attr().dims.clone();
    let tensor = match blob.data() {
        BlobData::U8(v) => from_shape(&dims, v)?,
        BlobData::I8(v) => from_shape(&dims, v)?,
        BlobData::U16(v) => from_shape(&dims, v)?,
        BlobData::I16(v) => from_shape(&dims, v)?,
        BlobData::U32(v) => from_shape(&dims, v)?,
        BlobData::I32(v) => from_shape(&dims, v)?,
        BlobData::F32(v) => from_shape(&dims, v)?,
        BlobData::F16(_) => {
            // widen; the plan was built with an f32 fact for this input
            let wide = blob.to_f32_vec();
            from_shape(&dims, &wide)?
        }
        BlobData::Bool(v) => {
            let bools: Vec<bool> = v.iter().map(|&b| b != 0).collect();
            from_shape(&dims, &bools)?
        }
    };
    Ok(tensor)
}

fn from_shape<T: Datum + Copy>(dims: &[usize], data: &[T]) -> Result<Tensor> {
    Tensor::from_shape(dims, data)
        .map_err(|e| PipelineError::BackendFailure(format!("tensor build failed: {e}")))
}

/// Convert a tract output tensor to a blob, preferring the declared attr
/// (which may carry quantization metadata) when its geometry matches.
fn tensor_to_blob(tensor: &Tensor, declared: Option<&TensorAttr>) -> Result<Blob> {
    let dims: Vec<usize> = tensor.shape().to_vec();

    let native = |t: &Tensor| -> Result<BlobData> {
        Ok(match t.datum_type() {
            DatumType::U8 => BlobData::U8(slice_of::<u8>(t)?.to_vec()),
            DatumType::I8 => BlobData::I8(slice_of::<i8>(t)?.to_vec()),
            DatumType::U16 => BlobData::U16(slice_of::<u16>(t)?.to_vec()),
            DatumType::I16 => BlobData::I16(slice_of::<i16>(t)?.to_vec()),
            DatumType::U32 => BlobData::U32(slice_of::<u32>(t)?.to_vec()),
            DatumType::I32 => BlobData::I32(slice_of::<i32>(t)?.to_vec()),
            DatumType::F32 => BlobData::F32(slice_of::<f32>(t)?.to_vec()),
            DatumType::Bool => BlobData::Bool(
                slice_of::<bool>(t)?.iter().map(|&b| u8::from(b)).collect(),
            ),
            // everything else (i64 class ids, f64, f16) goes through f32
            other => {
                let cast = t.cast_to::<f32>().map_err(|e| {
                    PipelineError::BackendFailure(format!("cannot cast {other:?} output: {e}"))
                })?;
                BlobData::F32(slice_of::<f32>(cast.as_ref())?.to_vec())
            }
        })
    };

    let data = native(tensor)?;
    let attr = match declared {
        Some(attr) if attr.dims == dims && attr.elem == data.elem_type() => attr.clone(),
        Some(attr) if attr.elem_count() == data.len() && attr.elem == data.elem_type() => {
            attr.clone()
        }
        Some(attr) => {
            return Err(PipelineError::ShapeMismatch(format!(
                "output is {:?} {} but outtensors declares {}",
                dims,
                data.elem_type(),
                attr
            )))
        }
        None => {
            let layout = if dims.len() == 4 { Layout::Nchw } else { Layout::Na };
            TensorAttr::new(layout, data.elem_type(), dims, Quant::None)?
        }
    };
    Blob::new(attr, data)
}

fn slice_of<'t, T: Datum>(tensor: &'t Tensor) -> Result<&'t [T]> {
    tensor
        .as_slice::<T>()
        .map_err(|e| PipelineError::BackendFailure(format!("output view failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_without_model_fails() {
        let mut backend = OnnxBackend::new();
        let err = backend.load().unwrap_err();
        assert!(matches!(err, PipelineError::BackendFailure(_)));
    }

    #[test]
    fn load_with_missing_file_fails() {
        let mut backend = OnnxBackend::new();
        backend.set_param("model", "does-not-exist.onnx").unwrap();
        backend
            .set_param("intensors", "NCHW:32F:1x3x8x8")
            .unwrap();
        let err = backend.load().unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("not found"), "unexpected error: {msg}");
    }

    #[test]
    fn declared_intensors_are_available_before_load() {
        let mut backend = OnnxBackend::new();
        backend
            .set_param("intensors", "NCHW:8U:1x3x224x224:AA:0.017:114")
            .unwrap();
        let attrs = backend.input_attrs().unwrap();
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].dims, vec![1, 3, 224, 224]);
    }

    #[test]
    fn frozen_identity_params_are_rejected() {
        let mut backend = OnnxBackend::new();
        backend.freeze(true);
        assert!(backend.set_param("model", "x.onnx").is_err());
        // non-identity knobs stay settable
        assert!(backend.set_param("target", "CPU").is_ok());
        backend.freeze(false);
        assert!(backend.set_param("model", "x.onnx").is_ok());
    }
}

//! Coral EdgeTPU backend over the TensorFlow Lite C API.
//!
//! Both `libtensorflowlite_c.so` and `libedgetpu.so.1` are external
//! collaborators resolved at `load()` time with `libloading`. The delegate is
//! optional: without an attached accelerator the interpreter still runs on
//! the CPU and says so in the info channel. `tpunum` picks among enumerated
//! EdgeTPU devices when more than one is present.

use std::ffi::{c_char, c_void, CString};
use std::path::PathBuf;
use std::ptr;

use libloading::Library;
use log::warn;

use deeplens_utils::tensor::{ElemType, Layout, Quant, TensorAttr};

use crate::{
    blob::Blob,
    error::{PipelineError, Result},
    network::Backend,
};

const DEFAULT_TFLITE_LIB: &str = "libtensorflowlite_c.so";
const DEFAULT_EDGETPU_LIB: &str = "libedgetpu.so.1";

#[repr(C)]
#[derive(Clone, Copy)]
struct TfLiteQuantizationParams {
    scale: f32,
    zero_point: i32,
}

#[repr(C)]
struct EdgeTpuDevice {
    ty: i32,
    path: *const c_char,
}

/// Function table resolved from the TFLite C library.
struct TfLiteApi {
    _lib: Library,
    model_create_from_file: unsafe extern "C" fn(*const c_char) -> *mut c_void,
    model_delete: unsafe extern "C" fn(*mut c_void),
    options_create: unsafe extern "C" fn() -> *mut c_void,
    options_delete: unsafe extern "C" fn(*mut c_void),
    options_add_delegate: unsafe extern "C" fn(*mut c_void, *mut c_void),
    interpreter_create: unsafe extern "C" fn(*mut c_void, *mut c_void) -> *mut c_void,
    interpreter_delete: unsafe extern "C" fn(*mut c_void),
    allocate_tensors: unsafe extern "C" fn(*mut c_void) -> i32,
    input_tensor_count: unsafe extern "C" fn(*mut c_void) -> i32,
    input_tensor: unsafe extern "C" fn(*mut c_void, i32) -> *mut c_void,
    invoke: unsafe extern "C" fn(*mut c_void) -> i32,
    output_tensor_count: unsafe extern "C" fn(*mut c_void) -> i32,
    output_tensor: unsafe extern "C" fn(*mut c_void, i32) -> *const c_void,
    tensor_type: unsafe extern "C" fn(*const c_void) -> i32,
    tensor_num_dims: unsafe extern "C" fn(*const c_void) -> i32,
    tensor_dim: unsafe extern "C" fn(*const c_void, i32) -> i32,
    tensor_byte_size: unsafe extern "C" fn(*const c_void) -> usize,
    tensor_copy_from_buffer: unsafe extern "C" fn(*mut c_void, *const c_void, usize) -> i32,
    tensor_copy_to_buffer: unsafe extern "C" fn(*const c_void, *mut c_void, usize) -> i32,
    tensor_quantization_params: unsafe extern "C" fn(*const c_void) -> TfLiteQuantizationParams,
}

impl TfLiteApi {
    fn open(path: &str) -> Result<Self> {
        unsafe {
            let lib = Library::new(path).map_err(|e| {
                PipelineError::BackendFailure(format!("cannot open TFLite runtime {path}: {e}"))
            })?;
            macro_rules! sym {
                ($name:literal) => {
                    *lib.get($name).map_err(|e| {
                        PipelineError::BackendFailure(format!("TFLite runtime lacks symbol: {e}"))
                    })?
                };
            }
            Ok(Self {
                model_create_from_file: sym!(b"TfLiteModelCreateFromFile\0"),
                model_delete: sym!(b"TfLiteModelDelete\0"),
                options_create: sym!(b"TfLiteInterpreterOptionsCreate\0"),
                options_delete: sym!(b"TfLiteInterpreterOptionsDelete\0"),
                options_add_delegate: sym!(b"TfLiteInterpreterOptionsAddDelegate\0"),
                interpreter_create: sym!(b"TfLiteInterpreterCreate\0"),
                interpreter_delete: sym!(b"TfLiteInterpreterDelete\0"),
                allocate_tensors: sym!(b"TfLiteInterpreterAllocateTensors\0"),
                input_tensor_count: sym!(b"TfLiteInterpreterGetInputTensorCount\0"),
                input_tensor: sym!(b"TfLiteInterpreterGetInputTensor\0"),
                invoke: sym!(b"TfLiteInterpreterInvoke\0"),
                output_tensor_count: sym!(b"TfLiteInterpreterGetOutputTensorCount\0"),
                output_tensor: sym!(b"TfLiteInterpreterGetOutputTensor\0"),
                tensor_type: sym!(b"TfLiteTensorType\0"),
                tensor_num_dims: sym!(b"TfLiteTensorNumDims\0"),
                tensor_dim: sym!(b"TfLiteTensorDim\0"),
                tensor_byte_size: sym!(b"TfLiteTensorByteSize\0"),
                tensor_copy_from_buffer: sym!(b"TfLiteTensorCopyFromBuffer\0"),
                tensor_copy_to_buffer: sym!(b"TfLiteTensorCopyToBuffer\0"),
                tensor_quantization_params: sym!(b"TfLiteTensorQuantizationParams\0"),
                _lib: lib,
            })
        }
    }
}

/// Function table resolved from the EdgeTPU delegate library.
struct EdgeTpuApi {
    _lib: Library,
    list_devices: unsafe extern "C" fn(*mut usize) -> *mut EdgeTpuDevice,
    free_devices: unsafe extern "C" fn(*mut EdgeTpuDevice),
    create_delegate:
        unsafe extern "C" fn(i32, *const c_char, *const c_void, usize) -> *mut c_void,
    free_delegate: unsafe extern "C" fn(*mut c_void),
}

impl EdgeTpuApi {
    fn open(path: &str) -> Result<Self> {
        unsafe {
            let lib = Library::new(path).map_err(|e| {
                PipelineError::BackendFailure(format!("cannot open EdgeTPU library {path}: {e}"))
            })?;
            macro_rules! sym {
                ($name:literal) => {
                    *lib.get($name).map_err(|e| {
                        PipelineError::BackendFailure(format!("EdgeTPU library lacks symbol: {e}"))
                    })?
                };
            }
            Ok(Self {
                list_devices: sym!(b"edgetpu_list_devices\0"),
                free_devices: sym!(b"edgetpu_free_devices\0"),
                create_delegate: sym!(b"edgetpu_create_delegate\0"),
                free_delegate: sym!(b"edgetpu_free_delegate\0"),
                _lib: lib,
            })
        }
    }
}

/// Convert a TfLiteType to the canonical element type. Mirrors the original
/// cross-runtime conversion tables.
fn elem_from_tflite(ty: i32) -> Result<ElemType> {
    Ok(match ty {
        1 => ElemType::F32,
        2 => ElemType::I32,
        3 => ElemType::U8,
        6 => ElemType::Bool,
        7 => ElemType::I16,
        9 => ElemType::I8,
        10 => ElemType::F16,
        other => {
            return Err(PipelineError::BackendFailure(format!(
                "unsupported TFLite tensor type {other}"
            )))
        }
    })
}

struct TpuContext {
    api: TfLiteApi,
    edgetpu: Option<(EdgeTpuApi, *mut c_void)>,
    model: *mut c_void,
    options: *mut c_void,
    interpreter: *mut c_void,
    in_attrs: Vec<TensorAttr>,
    out_attrs: Vec<TensorAttr>,
    on_tpu: bool,
}

impl Drop for TpuContext {
    fn drop(&mut self) {
        unsafe {
            (self.api.interpreter_delete)(self.interpreter);
            (self.api.options_delete)(self.options);
            (self.api.model_delete)(self.model);
            if let Some((api, delegate)) = self.edgetpu.take() {
                (api.free_delegate)(delegate);
            }
        }
    }
}

/// EdgeTPU backend.
pub struct TpuBackend {
    dataroot: PathBuf,
    model: Option<PathBuf>,
    tflite_lib: String,
    edgetpu_lib: String,
    tpunum: usize,
    context: Option<TpuContext>,
    frozen: bool,
}

impl Default for TpuBackend {
    fn default() -> Self {
        Self {
            dataroot: PathBuf::from("."),
            model: None,
            tflite_lib: DEFAULT_TFLITE_LIB.into(),
            edgetpu_lib: DEFAULT_EDGETPU_LIB.into(),
            tpunum: 0,
            context: None,
            frozen: false,
        }
    }
}

impl TpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a delegate for EdgeTPU device `tpunum`, if the library and the
    /// device exist.
    fn make_delegate(&self) -> Option<(EdgeTpuApi, *mut c_void)> {
        let api = match EdgeTpuApi::open(&self.edgetpu_lib) {
            Ok(api) => api,
            Err(e) => {
                warn!("EdgeTPU unavailable ({e}); running TFLite on CPU");
                return None;
            }
        };
        unsafe {
            let mut count = 0usize;
            let devices = (api.list_devices)(&mut count);
            if devices.is_null() || self.tpunum >= count {
                if !devices.is_null() {
                    (api.free_devices)(devices);
                }
                warn!(
                    "EdgeTPU device {} not present ({count} found); running TFLite on CPU",
                    self.tpunum
                );
                return None;
            }
            let device = &*devices.add(self.tpunum);
            let delegate = (api.create_delegate)(device.ty, device.path, ptr::null(), 0);
            (api.free_devices)(devices);
            if delegate.is_null() {
                warn!("EdgeTPU delegate creation failed; running TFLite on CPU");
                return None;
            }
            Some((api, delegate))
        }
    }

    fn tensor_attr(api: &TfLiteApi, tensor: *const c_void) -> Result<TensorAttr> {
        unsafe {
            let rank = (api.tensor_num_dims)(tensor);
            if rank <= 0 {
                return Err(PipelineError::BackendFailure(format!(
                    "TFLite reported tensor rank {rank}"
                )));
            }
            let dims: Vec<usize> = (0..rank)
                .map(|d| (api.tensor_dim)(tensor, d) as usize)
                .collect();
            let elem = elem_from_tflite((api.tensor_type)(tensor))?;
            let qp = (api.tensor_quantization_params)(tensor);
            let quant = if elem.is_integer() && qp.scale != 0.0 {
                Quant::AffineAsymmetric {
                    scale: qp.scale,
                    zero_point: qp.zero_point,
                }
            } else {
                Quant::None
            };
            let layout = if dims.len() == 4 { Layout::Nhwc } else { Layout::Na };
            Ok(TensorAttr::new(layout, elem, dims, quant)?)
        }
    }
}

impl Backend for TpuBackend {
    fn name(&self) -> &'static str {
        "TPU"
    }

    fn load(&mut self) -> Result<()> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| PipelineError::BackendFailure("no model file configured".into()))?;
        let path = if model.is_absolute() {
            model.clone()
        } else {
            self.dataroot.join(model)
        };
        if !path.exists() {
            return Err(PipelineError::BackendFailure(format!(
                "model file not found: {}",
                path.display()
            )));
        }

        let api = TfLiteApi::open(&self.tflite_lib)?;
        let c_path = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| PipelineError::BackendFailure("model path contains NUL".into()))?;

        unsafe {
            let model_ptr = (api.model_create_from_file)(c_path.as_ptr());
            if model_ptr.is_null() {
                return Err(PipelineError::BackendFailure(format!(
                    "TFLite could not parse {}",
                    path.display()
                )));
            }

            let options = (api.options_create)();
            let edgetpu = self.make_delegate();
            let on_tpu = edgetpu.is_some();
            if let Some((_, delegate)) = &edgetpu {
                (api.options_add_delegate)(options, *delegate);
            }

            let interpreter = (api.interpreter_create)(model_ptr, options);
            if interpreter.is_null() {
                (api.options_delete)(options);
                (api.model_delete)(model_ptr);
                return Err(PipelineError::BackendFailure(
                    "TFLite interpreter creation failed".into(),
                ));
            }
            let ret = (api.allocate_tensors)(interpreter);
            if ret != 0 {
                (api.interpreter_delete)(interpreter);
                (api.options_delete)(options);
                (api.model_delete)(model_ptr);
                return Err(PipelineError::BackendFailure(format!(
                    "TfLiteInterpreterAllocateTensors returned {ret}"
                )));
            }

            let n_in = (api.input_tensor_count)(interpreter);
            let mut in_attrs = Vec::with_capacity(n_in.max(0) as usize);
            for i in 0..n_in {
                let t = (api.input_tensor)(interpreter, i);
                in_attrs.push(Self::tensor_attr(&api, t)?);
            }
            let n_out = (api.output_tensor_count)(interpreter);
            let mut out_attrs = Vec::with_capacity(n_out.max(0) as usize);
            for i in 0..n_out {
                let t = (api.output_tensor)(interpreter, i);
                out_attrs.push(Self::tensor_attr(&api, t)?);
            }

            self.context = Some(TpuContext {
                api,
                edgetpu,
                model: model_ptr,
                options,
                interpreter,
                in_attrs,
                out_attrs,
                on_tpu,
            });
        }
        Ok(())
    }

    fn input_attrs(&self) -> Result<Vec<TensorAttr>> {
        self.context
            .as_ref()
            .map(|c| c.in_attrs.clone())
            .ok_or(PipelineError::ModelNotLoaded)
    }

    fn output_attrs(&self) -> Result<Vec<TensorAttr>> {
        self.context
            .as_ref()
            .map(|c| c.out_attrs.clone())
            .ok_or(PipelineError::ModelNotLoaded)
    }

    fn forward(&mut self, blobs: &[Blob], info: &mut Vec<String>) -> Result<Vec<Blob>> {
        let ctx = self.context.as_ref().ok_or(PipelineError::ModelNotLoaded)?;

        unsafe {
            for (i, blob) in blobs.iter().enumerate() {
                let tensor = (ctx.api.input_tensor)(ctx.interpreter, i as i32);
                let expected = (ctx.api.tensor_byte_size)(tensor);
                let bytes = blob.as_bytes();
                if bytes.len() != expected {
                    return Err(PipelineError::ShapeMismatch(format!(
                        "input {i} is {} bytes, interpreter expects {expected}",
                        bytes.len()
                    )));
                }
                let ret = (ctx.api.tensor_copy_from_buffer)(
                    tensor,
                    bytes.as_ptr() as *const c_void,
                    bytes.len(),
                );
                if ret != 0 {
                    return Err(PipelineError::BackendFailure(format!(
                        "TfLiteTensorCopyFromBuffer returned {ret}"
                    )));
                }
            }

            let ret = (ctx.api.invoke)(ctx.interpreter);
            if ret != 0 {
                return Err(PipelineError::BackendFailure(format!(
                    "TfLiteInterpreterInvoke returned {ret}"
                )));
            }

            info.push(format!(
                "* TPU ({})",
                if ctx.on_tpu {
                    format!("EdgeTPU {}", self.tpunum)
                } else {
                    "CPU fallback".to_string()
                }
            ));

            let mut outs = Vec::with_capacity(ctx.out_attrs.len());
            for (i, attr) in ctx.out_attrs.iter().enumerate() {
                let tensor = (ctx.api.output_tensor)(ctx.interpreter, i as i32);
                let size = (ctx.api.tensor_byte_size)(tensor);
                let mut bytes = vec![0u8; size];
                let ret = (ctx.api.tensor_copy_to_buffer)(
                    tensor,
                    bytes.as_mut_ptr() as *mut c_void,
                    size,
                );
                if ret != 0 {
                    return Err(PipelineError::BackendFailure(format!(
                        "TfLiteTensorCopyToBuffer returned {ret}"
                    )));
                }
                let blob = Blob::from_bytes(attr.clone(), &bytes)?;
                info.push(format!("- out {i}: {}", attr.shape_str()));
                outs.push(blob);
            }
            Ok(outs)
        }
    }

    fn set_param(&mut self, key: &str, value: &str) -> Result<bool> {
        let identity = matches!(key, "model" | "dataroot" | "tpunum");
        if identity && self.frozen {
            return Err(PipelineError::Param(format!("{key} is frozen while running")));
        }
        match key {
            "model" => self.model = Some(PathBuf::from(value)),
            "dataroot" => self.dataroot = PathBuf::from(value),
            "tpunum" => {
                self.tpunum = value
                    .trim()
                    .parse()
                    .map_err(|_| PipelineError::Param(format!("bad tpunum `{value}`")))?;
            }
            "intensors" | "outtensors" | "config" => {}
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn freeze(&mut self, doit: bool) {
        self.frozen = doit;
    }
}

// Raw interpreter pointers move with the backend to the loader thread; the
// network wrapper's mutex serializes every call into the C API.
unsafe impl Send for TpuBackend {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fails_cleanly_without_runtime() {
        let mut backend = TpuBackend::new();
        backend.set_param("model", "missing.tflite").unwrap();
        let err = backend.load().unwrap_err();
        assert!(matches!(err, PipelineError::BackendFailure(_)));
    }

    #[test]
    fn tflite_type_table_matches_canonical_set() {
        assert_eq!(elem_from_tflite(1).unwrap(), ElemType::F32);
        assert_eq!(elem_from_tflite(3).unwrap(), ElemType::U8);
        assert_eq!(elem_from_tflite(9).unwrap(), ElemType::I8);
        assert_eq!(elem_from_tflite(10).unwrap(), ElemType::F16);
        assert!(elem_from_tflite(5).is_err()); // strings have no seat here
    }

    #[test]
    fn tpunum_parses_and_freezes() {
        let mut backend = TpuBackend::new();
        backend.set_param("tpunum", "1").unwrap();
        assert_eq!(backend.tpunum, 1);
        assert!(backend.set_param("tpunum", "x").is_err());
        backend.freeze(true);
        assert!(backend.set_param("tpunum", "0").is_err());
    }
}

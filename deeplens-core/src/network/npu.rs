//! Rockchip-style NPU backend.
//!
//! The vendor runtime (`librknnrt.so`) is an external collaborator: it is
//! resolved at `load()` time with `libloading`, never linked. On hardware
//! without the library (or without the NPU) loading fails with a
//! `BackendFailure` and the rest of the pipeline keeps working.
//!
//! Native tensor attributes are converted to the canonical [`TensorAttr`]
//! exactly once, at load time.

use std::ffi::c_void;
use std::path::PathBuf;
use std::ptr;

use libloading::Library;

use deeplens_utils::tensor::{ElemType, Layout, Quant, TensorAttr};

use crate::{
    blob::Blob,
    error::{PipelineError, Result},
    network::Backend,
};

const DEFAULT_LIB: &str = "/usr/lib/librknnrt.so";

const RKNN_MAX_DIMS: usize = 16;
const RKNN_MAX_NAME_LEN: usize = 256;

const RKNN_QUERY_IN_OUT_NUM: u32 = 0;
const RKNN_QUERY_INPUT_ATTR: u32 = 1;
const RKNN_QUERY_OUTPUT_ATTR: u32 = 2;

// rknn_tensor_format
const RKNN_FMT_NCHW: i32 = 0;
const RKNN_FMT_NHWC: i32 = 1;

// rknn_tensor_qnt_type
const RKNN_QNT_NONE: i32 = 0;
const RKNN_QNT_DFP: i32 = 1;
const RKNN_QNT_AFFINE: i32 = 2;

#[repr(C)]
#[derive(Clone, Copy)]
struct RknnInputOutputNum {
    n_input: u32,
    n_output: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RknnTensorAttr {
    index: u32,
    n_dims: u32,
    dims: [u32; RKNN_MAX_DIMS],
    name: [u8; RKNN_MAX_NAME_LEN],
    n_elems: u32,
    size: u32,
    fmt: i32,
    ty: i32,
    qnt_type: i32,
    fl: i8,
    zp: i32,
    scale: f32,
    w_stride: u32,
    size_with_stride: u32,
    pass_through: u8,
    h_stride: u32,
}

#[repr(C)]
struct RknnInput {
    index: u32,
    buf: *const c_void,
    size: u32,
    pass_through: u8,
    ty: i32,
    fmt: i32,
}

#[repr(C)]
struct RknnOutput {
    want_float: u8,
    is_prealloc: u8,
    index: u32,
    buf: *mut c_void,
    size: u32,
}

/// Function table resolved from the vendor runtime.
struct RknnApi {
    _lib: Library,
    init: unsafe extern "C" fn(*mut u64, *const c_void, u32, u32, *const c_void) -> i32,
    destroy: unsafe extern "C" fn(u64) -> i32,
    query: unsafe extern "C" fn(u64, u32, *mut c_void, u32) -> i32,
    inputs_set: unsafe extern "C" fn(u64, u32, *mut RknnInput) -> i32,
    run: unsafe extern "C" fn(u64, *const c_void) -> i32,
    outputs_get: unsafe extern "C" fn(u64, u32, *mut RknnOutput, *const c_void) -> i32,
    outputs_release: unsafe extern "C" fn(u64, u32, *mut RknnOutput) -> i32,
}

impl RknnApi {
    fn open(path: &str) -> Result<Self> {
        unsafe {
            let lib = Library::new(path).map_err(|e| {
                PipelineError::BackendFailure(format!("cannot open NPU runtime {path}: {e}"))
            })?;
            macro_rules! sym {
                ($name:literal) => {
                    *lib.get($name).map_err(|e| {
                        PipelineError::BackendFailure(format!(
                            "NPU runtime lacks {}: {e}",
                            String::from_utf8_lossy(&$name[..$name.len() - 1])
                        ))
                    })?
                };
            }
            Ok(Self {
                init: sym!(b"rknn_init\0"),
                destroy: sym!(b"rknn_destroy\0"),
                query: sym!(b"rknn_query\0"),
                inputs_set: sym!(b"rknn_inputs_set\0"),
                run: sym!(b"rknn_run\0"),
                outputs_get: sym!(b"rknn_outputs_get\0"),
                outputs_release: sym!(b"rknn_outputs_release\0"),
                _lib: lib,
            })
        }
    }
}

fn elem_from_rknn(ty: i32) -> Result<ElemType> {
    Ok(match ty {
        0 => ElemType::F32,
        1 => ElemType::F16,
        2 => ElemType::I8,
        3 => ElemType::U8,
        4 => ElemType::I16,
        5 => ElemType::U16,
        6 => ElemType::I32,
        7 => ElemType::U32,
        9 => ElemType::Bool,
        other => {
            return Err(PipelineError::BackendFailure(format!(
                "unsupported NPU tensor type {other}"
            )))
        }
    })
}

fn elem_to_rknn(elem: ElemType) -> i32 {
    match elem {
        ElemType::F32 => 0,
        ElemType::F16 => 1,
        ElemType::I8 => 2,
        ElemType::U8 => 3,
        ElemType::I16 => 4,
        ElemType::U16 => 5,
        ElemType::I32 => 6,
        ElemType::U32 => 7,
        ElemType::Bool => 9,
    }
}

/// One-time conversion of a native attribute to the canonical descriptor.
fn attr_from_rknn(raw: &RknnTensorAttr) -> Result<TensorAttr> {
    let rank = raw.n_dims as usize;
    if rank == 0 || rank > RKNN_MAX_DIMS {
        return Err(PipelineError::BackendFailure(format!(
            "NPU reported tensor rank {rank}"
        )));
    }
    let dims: Vec<usize> = raw.dims[..rank].iter().map(|&d| d as usize).collect();
    let elem = elem_from_rknn(raw.ty)?;
    let layout = match raw.fmt {
        RKNN_FMT_NCHW => Layout::Nchw,
        RKNN_FMT_NHWC => Layout::Nhwc,
        _ => Layout::Na,
    };
    let quant = match raw.qnt_type {
        RKNN_QNT_NONE => Quant::None,
        RKNN_QNT_DFP => Quant::DynamicFixedPoint { fl: raw.fl },
        RKNN_QNT_AFFINE => Quant::AffineAsymmetric {
            scale: raw.scale,
            zero_point: raw.zp,
        },
        other => {
            return Err(PipelineError::BackendFailure(format!(
                "unsupported NPU quantization type {other}"
            )))
        }
    };
    // float attrs occasionally carry stale quant fields; drop them
    let quant = if elem.is_integer() { quant } else { Quant::None };
    Ok(TensorAttr::new(layout, elem, dims, quant)?)
}

/// NPU backend state once loaded.
struct NpuContext {
    api: RknnApi,
    ctx: u64,
    in_attrs: Vec<TensorAttr>,
    out_attrs: Vec<TensorAttr>,
}

impl Drop for NpuContext {
    fn drop(&mut self) {
        unsafe {
            (self.api.destroy)(self.ctx);
        }
    }
}

/// NPU backend.
pub struct NpuBackend {
    dataroot: PathBuf,
    model: Option<PathBuf>,
    library: String,
    context: Option<NpuContext>,
    frozen: bool,
}

impl Default for NpuBackend {
    fn default() -> Self {
        Self {
            dataroot: PathBuf::from("."),
            model: None,
            library: DEFAULT_LIB.into(),
            context: None,
            frozen: false,
        }
    }
}

impl NpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn query_attrs(api: &RknnApi, ctx: u64, cmd: u32, count: u32) -> Result<Vec<TensorAttr>> {
        let mut attrs = Vec::with_capacity(count as usize);
        for index in 0..count {
            let mut raw: RknnTensorAttr = unsafe { std::mem::zeroed() };
            raw.index = index;
            let ret = unsafe {
                (api.query)(
                    ctx,
                    cmd,
                    &mut raw as *mut RknnTensorAttr as *mut c_void,
                    std::mem::size_of::<RknnTensorAttr>() as u32,
                )
            };
            if ret != 0 {
                return Err(PipelineError::BackendFailure(format!(
                    "rknn_query(attr {index}) returned {ret}"
                )));
            }
            attrs.push(attr_from_rknn(&raw)?);
        }
        Ok(attrs)
    }
}

impl Backend for NpuBackend {
    fn name(&self) -> &'static str {
        "NPU"
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
        let bytes = std::fs::read(&path).map_err(|e| {
            PipelineError::BackendFailure(format!("cannot read {}: {e}", path.display()))
        })?;

        let api = RknnApi::open(&self.library)?;

        let mut ctx = 0u64;
        let ret = unsafe {
            (api.init)(
                &mut ctx,
                bytes.as_ptr() as *const c_void,
                bytes.len() as u32,
                0,
                ptr::null(),
            )
        };
        if ret != 0 {
            return Err(PipelineError::BackendFailure(format!(
                "rknn_init returned {ret}"
            )));
        }

        let mut io_num = RknnInputOutputNum {
            n_input: 0,
            n_output: 0,
        };
        let ret = unsafe {
            (api.query)(
                ctx,
                RKNN_QUERY_IN_OUT_NUM,
                &mut io_num as *mut RknnInputOutputNum as *mut c_void,
                std::mem::size_of::<RknnInputOutputNum>() as u32,
            )
        };
        if ret != 0 {
            unsafe { (api.destroy)(ctx) };
            return Err(PipelineError::BackendFailure(format!(
                "rknn_query(io num) returned {ret}"
            )));
        }

        let in_attrs = Self::query_attrs(&api, ctx, RKNN_QUERY_INPUT_ATTR, io_num.n_input)
            .inspect_err(|_| unsafe {
                (api.destroy)(ctx);
            })?;
        let out_attrs = Self::query_attrs(&api, ctx, RKNN_QUERY_OUTPUT_ATTR, io_num.n_output)
            .inspect_err(|_| unsafe {
                (api.destroy)(ctx);
            })?;

        self.context = Some(NpuContext {
            api,
            ctx,
            in_attrs,
            out_attrs,
        });
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

        let mut inputs: Vec<RknnInput> = blobs
            .iter()
            .enumerate()
            .map(|(i, blob)| {
                let bytes = blob.as_bytes();
                RknnInput {
                    index: i as u32,
                    buf: bytes.as_ptr() as *const c_void,
                    size: bytes.len() as u32,
                    pass_through: 0,
                    ty: elem_to_rknn(blob.attr().elem),
                    fmt: match blob.attr().layout {
                        Layout::Nhwc => RKNN_FMT_NHWC,
                        _ => RKNN_FMT_NCHW,
                    },
                }
            })
            .collect();

        let ret = unsafe { (ctx.api.inputs_set)(ctx.ctx, inputs.len() as u32, inputs.as_mut_ptr()) };
        if ret != 0 {
            return Err(PipelineError::BackendFailure(format!(
                "rknn_inputs_set returned {ret}"
            )));
        }

        let ret = unsafe { (ctx.api.run)(ctx.ctx, ptr::null()) };
        if ret != 0 {
            return Err(PipelineError::BackendFailure(format!(
                "rknn_run returned {ret}"
            )));
        }

        // Native (still quantized) outputs; dequantization is the wrapper's
        // job when the `dequant` parameter asks for it.
        let n_out = ctx.out_attrs.len();
        let mut raw_outs: Vec<RknnOutput> = (0..n_out)
            .map(|i| RknnOutput {
                want_float: 0,
                is_prealloc: 0,
                index: i as u32,
                buf: ptr::null_mut(),
                size: 0,
            })
            .collect();
        let ret = unsafe {
            (ctx.api.outputs_get)(ctx.ctx, n_out as u32, raw_outs.as_mut_ptr(), ptr::null())
        };
        if ret != 0 {
            return Err(PipelineError::BackendFailure(format!(
                "rknn_outputs_get returned {ret}"
            )));
        }

        info.push("* NPU".into());
        let mut outs = Vec::with_capacity(n_out);
        let mut copy_error = None;
        for (raw, attr) in raw_outs.iter().zip(ctx.out_attrs.iter()) {
            let expected = attr.byte_len();
            if raw.buf.is_null() || (raw.size as usize) < expected {
                copy_error = Some(PipelineError::BackendFailure(format!(
                    "NPU output {} returned {} bytes, expected {expected}",
                    raw.index, raw.size
                )));
                break;
            }
            let bytes = unsafe { std::slice::from_raw_parts(raw.buf as *const u8, expected) };
            match Blob::from_bytes(attr.clone(), bytes) {
                Ok(blob) => {
                    info.push(format!("- out {}: {}", raw.index, attr.shape_str()));
                    outs.push(blob);
                }
                Err(e) => {
                    copy_error = Some(e);
                    break;
                }
            }
        }
        unsafe {
            (ctx.api.outputs_release)(ctx.ctx, n_out as u32, raw_outs.as_mut_ptr());
        }
        match copy_error {
            Some(e) => Err(e),
            None => Ok(outs),
        }
    }

    fn set_param(&mut self, key: &str, value: &str) -> Result<bool> {
        let identity = matches!(key, "model" | "dataroot" | "library");
        if identity && self.frozen {
            return Err(PipelineError::Param(format!("{key} is frozen while running")));
        }
        match key {
            "model" => self.model = Some(PathBuf::from(value)),
            "dataroot" => self.dataroot = PathBuf::from(value),
            "library" => self.library = value.to_string(),
            // declared specs are ignored: the SDK reports exact attrs
            "intensors" | "outtensors" | "config" => {}
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn freeze(&mut self, doit: bool) {
        self.frozen = doit;
    }
}

// The context handle and resolved function pointers may move to the loader
// thread; the vendor runtime allows cross-thread use of one context as long
// as calls do not overlap, which the network wrapper's mutex guarantees.
unsafe impl Send for NpuBackend {}

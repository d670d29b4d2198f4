//! Networks: weight loading, forward passes, output shaping.
//!
//! A [`Backend`] wraps one runtime (tract-onnx, an NPU, an EdgeTPU, or a
//! user-supplied custom engine). The [`Network`] wrapper owns the backend and
//! adds the machinery every backend shares: background weight loading with an
//! atomic readiness signal, input validation, and post-network shaping
//! (dequantization and flattening).

mod npu;
mod onnx;
mod tpu;

pub use npu::NpuBackend;
pub use onnx::OnnxBackend;
pub use tpu::TpuBackend;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::thread::JoinHandle;

use deeplens_utils::tensor::TensorAttr;

use crate::{
    blob::Blob,
    error::{PipelineError, Result},
    preproc::parse_bool,
};

/// One inference runtime.
///
/// `load()` is called at most once per instance, from a background thread.
/// `input_attrs`/`output_attrs` may be answered from declared tensor specs
/// before loading, or must return [`PipelineError::ModelNotLoaded`] until the
/// runtime knows its shapes.
pub trait Backend: Send {
    fn name(&self) -> &'static str;

    /// Read the model file into backend memory.
    fn load(&mut self) -> Result<()>;

    fn input_attrs(&self) -> Result<Vec<TensorAttr>>;

    fn output_attrs(&self) -> Result<Vec<TensorAttr>>;

    /// Run one forward pass. Implementations may push human-readable lines
    /// into `info`: a line starting with `* ` is a header, `- ` a bullet.
    fn forward(&mut self, blobs: &[Blob], info: &mut Vec<String>) -> Result<Vec<Blob>>;

    /// Apply one zoo parameter. Returns `Ok(true)` when the key was consumed.
    fn set_param(&mut self, _key: &str, _value: &str) -> Result<bool> {
        Ok(false)
    }

    /// Lock parameters that define the model identity.
    fn freeze(&mut self, _doit: bool) {}
}

struct NetInner {
    backend: Mutex<Box<dyn Backend>>,
    /// True only while the background load is running. `loading` implies
    /// `!loaded` and vice versa; consumers read `loaded` alone.
    loading: AtomicBool,
    loaded: AtomicBool,
    load_error: Mutex<Option<PipelineError>>,
    dequant: AtomicBool,
    flatten: AtomicBool,
}

/// Cheap cloneable handle used to run inference from a worker thread.
#[derive(Clone)]
pub struct NetworkRunner {
    inner: Arc<NetInner>,
}

impl NetworkRunner {
    /// Run one forward pass through the backend, with validation and
    /// post-network shaping.
    pub fn process(&self, blobs: &[Blob], info: &mut Vec<String>) -> Result<Vec<Blob>> {
        if !self.inner.loaded.load(Ordering::Acquire) {
            if let Some(err) = self.inner.load_error.lock().expect("poisoned").take() {
                return Err(err);
            }
            return Err(PipelineError::ModelNotLoaded);
        }

        let mut backend = self.inner.backend.lock().expect("poisoned");

        let declared = backend.input_attrs()?;
        if declared.len() != blobs.len() {
            return Err(PipelineError::ShapeMismatch(format!(
                "network expects {} input tensors, got {}",
                declared.len(),
                blobs.len()
            )));
        }
        for (i, (blob, attr)) in blobs.iter().zip(declared.iter()).enumerate() {
            if blob.attr() != attr {
                return Err(PipelineError::ShapeMismatch(format!(
                    "input {i}: blob is {} but network declares {}",
                    blob.attr(),
                    attr
                )));
            }
        }

        let mut outs = backend.forward(blobs, info)?;
        drop(backend);

        if self.inner.dequant.load(Ordering::Relaxed) {
            let mut n = 0usize;
            for out in &mut outs {
                if out.attr().elem.is_integer() && !out.attr().quant.is_none() {
                    *out = out.dequantized()?;
                    n += 1;
                }
            }
            if n > 0 {
                info.push(format!("- Dequantized {n} output(s) to f32"));
            }
            if self.inner.flatten.load(Ordering::Relaxed) {
                let flat = Blob::concat_f32(&outs)?;
                info.push(format!("- Flattened outputs to {} values", flat.len()));
                outs = vec![flat];
            }
        }

        Ok(outs)
    }
}

/// A backend plus the shared load/readiness machinery.
pub struct Network {
    inner: Arc<NetInner>,
    load_handle: Option<JoinHandle<()>>,
}

impl Network {
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            inner: Arc::new(NetInner {
                backend: Mutex::new(backend),
                loading: AtomicBool::new(false),
                loaded: AtomicBool::new(false),
                load_error: Mutex::new(None),
                dequant: AtomicBool::new(true),
                flatten: AtomicBool::new(false),
            }),
            load_handle: None,
        }
    }

    /// Kick off the one-time background load. Idempotent.
    pub fn start_load(&mut self) {
        if self.inner.loaded.load(Ordering::Acquire)
            || self.inner.loading.swap(true, Ordering::AcqRel)
        {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.load_handle = Some(std::thread::spawn(move || {
            let result = inner.backend.lock().expect("poisoned").load();
            match result {
                Ok(()) => {
                    // clear `loading` first so the two flags are never both set
                    inner.loading.store(false, Ordering::Release);
                    inner.loaded.store(true, Ordering::Release);
                }
                Err(err) => {
                    log::error!("network load failed: {err}");
                    *inner.load_error.lock().expect("poisoned") = Some(err);
                    inner.loading.store(false, Ordering::Release);
                }
            }
        }));
    }

    /// True when the network is ready to run (loaded and initialized).
    pub fn ready(&self) -> bool {
        self.inner.loaded.load(Ordering::Acquire)
    }

    /// True while the background load is still running.
    pub fn loading(&self) -> bool {
        self.inner.loading.load(Ordering::Acquire)
    }

    /// Take the load failure, if the background load ended in one.
    pub fn take_load_error(&self) -> Option<PipelineError> {
        if self.loading() {
            return None;
        }
        self.inner.load_error.lock().expect("poisoned").take()
    }

    pub fn input_attrs(&self) -> Result<Vec<TensorAttr>> {
        self.inner.backend.lock().expect("poisoned").input_attrs()
    }

    pub fn output_attrs(&self) -> Result<Vec<TensorAttr>> {
        self.inner.backend.lock().expect("poisoned").output_attrs()
    }

    /// Handle for running inference, possibly from a worker thread.
    pub fn runner(&self) -> NetworkRunner {
        NetworkRunner {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Synchronous forward pass (see [`NetworkRunner::process`]).
    pub fn process(&self, blobs: &[Blob], info: &mut Vec<String>) -> Result<Vec<Blob>> {
        self.runner().process(blobs, info)
    }

    pub fn set_param(&mut self, key: &str, value: &str) -> Result<bool> {
        match key {
            "dequant" => {
                self.inner.dequant.store(parse_bool(value)?, Ordering::Relaxed);
                Ok(true)
            }
            "flattenoutputs" => {
                self.inner.flatten.store(parse_bool(value)?, Ordering::Relaxed);
                Ok(true)
            }
            _ => self
                .inner
                .backend
                .lock()
                .expect("poisoned")
                .set_param(key, value),
        }
    }

    pub fn freeze(&mut self, doit: bool) {
        self.inner.backend.lock().expect("poisoned").freeze(doit);
    }

    /// Block until a load in progress has finished. Must run before the
    /// backend is torn down; `Drop` calls it.
    pub fn wait_before_destroy(&mut self) {
        if let Some(handle) = self.load_handle.take() {
            let _ = handle.join();
        }
    }

    /// Recover the backend, e.g. to return a custom implementation to its
    /// seat across a pipeline rebuild. Returns `None` while a runner handle
    /// is still alive somewhere.
    pub fn into_backend(mut self) -> Option<Box<dyn Backend>> {
        self.wait_before_destroy();
        let inner = Arc::clone(&self.inner);
        drop(self);
        let inner = Arc::try_unwrap(inner).ok()?;
        inner.backend.into_inner().ok()
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.wait_before_destroy();
    }
}

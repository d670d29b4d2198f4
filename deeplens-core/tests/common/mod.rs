//! Shared scripted stages for pipeline integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use image::RgbImage;

use deeplens_core::{
    Backend, Blob, BlobData, PipelineError, Pipeline, PostProcessor, PreprocContext, ReportSink,
};
use deeplens_utils::tensor::{parse_tensor_specs, ElemType, Layout, Quant, TensorAttr};

/// Counters shared between a test and its scripted backend.
#[derive(Default)]
pub struct BackendProbe {
    pub forwards: AtomicU32,
    pub active: AtomicU32,
    pub overlap_seen: AtomicBool,
    pub fail_forward: AtomicBool,
}

/// Backend that echoes the first element of its input blob as its output.
///
/// `load()` takes a little while so tests observe the loading state
/// deterministically. An optional gate blocks each forward pass until the
/// test sends a token, emulating a network slower than the camera.
pub struct ScriptedBackend {
    pub probe: Arc<BackendProbe>,
    pub gate: Option<Mutex<mpsc::Receiver<()>>>,
}

impl ScriptedBackend {
    pub fn instant(probe: Arc<BackendProbe>) -> Self {
        Self { probe, gate: None }
    }

    pub fn gated(probe: Arc<BackendProbe>) -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                probe,
                gate: Some(Mutex::new(rx)),
            },
            tx,
        )
    }

    fn attrs() -> Vec<TensorAttr> {
        parse_tensor_specs("NCHW:32F:1x3x2x2").unwrap()
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "Scripted"
    }

    fn load(&mut self) -> Result<(), PipelineError> {
        std::thread::sleep(Duration::from_millis(50));
        Ok(())
    }

    fn input_attrs(&self) -> Result<Vec<TensorAttr>, PipelineError> {
        Ok(Self::attrs())
    }

    fn output_attrs(&self) -> Result<Vec<TensorAttr>, PipelineError> {
        Ok(vec![
            TensorAttr::new(Layout::Na, ElemType::F32, vec![1], Quant::None).unwrap(),
        ])
    }

    fn forward(
        &mut self,
        blobs: &[Blob],
        _info: &mut Vec<String>,
    ) -> Result<Vec<Blob>, PipelineError> {
        if self.probe.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.probe.overlap_seen.store(true, Ordering::SeqCst);
        }
        if let Some(gate) = &self.gate {
            let _ = gate.lock().unwrap().recv();
        }
        let result = if self.probe.fail_forward.load(Ordering::SeqCst) {
            Err(PipelineError::BackendFailure("scripted failure".into()))
        } else {
            let echo = blobs[0].as_f32().unwrap()[0];
            let attr = TensorAttr::new(Layout::Na, ElemType::F32, vec![1], Quant::None).unwrap();
            Ok(vec![Blob::new(attr, BlobData::F32(vec![echo])).unwrap()])
        };
        self.probe.forwards.fetch_add(1, Ordering::SeqCst);
        self.probe.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Post-processor that records every decoded value and reports the current
/// one, so tests can check decode order and overlay latency.
pub struct RecordingPost {
    pub decoded: Arc<Mutex<Vec<f32>>>,
    current: Option<f32>,
}

impl RecordingPost {
    pub fn new(decoded: Arc<Mutex<Vec<f32>>>) -> Self {
        Self {
            decoded,
            current: None,
        }
    }
}

impl PostProcessor for RecordingPost {
    fn process(&mut self, outs: &[Blob], _preproc: &PreprocContext) -> Result<(), PipelineError> {
        let value = outs[0].as_f32().unwrap()[0];
        self.decoded.lock().unwrap().push(value);
        self.current = Some(value);
        Ok(())
    }

    fn report(
        &mut self,
        sink: &mut dyn ReportSink,
        _outimg: Option<&mut RgbImage>,
        _overlay: bool,
        _idle: bool,
    ) {
        match self.current {
            Some(v) => sink.send(&format!("SEEN {v}")),
            None => sink.send("SEEN none"),
        }
    }
}

/// A 2x2 frame whose red channel encodes `value`.
pub fn frame(value: u8) -> RgbImage {
    RgbImage::from_pixel(2, 2, image::Rgb([value, 0, 0]))
}

/// Write a zoo file selecting custom network + post-processor and return a
/// configured pipeline (not yet processed, so not yet built).
pub fn custom_pipeline(
    dir: &tempfile::TempDir,
    processing: &str,
    backend: Box<dyn Backend>,
    post: Box<dyn PostProcessor>,
) -> Pipeline {
    let zoo = "testpipe:\n  preproc: Blob\n  nettype: Custom\n  postproc: Custom\n";
    std::fs::write(dir.path().join("models.yml"), zoo).unwrap();

    let mut pipe = Pipeline::new();
    pipe.set_param("zooroot", dir.path().to_str().unwrap())
        .unwrap();
    pipe.set_param("processing", processing).unwrap();
    pipe.set_custom_network(backend);
    pipe.set_custom_postprocessor(post);
    pipe.select_pipe("testpipe").unwrap();
    pipe
}

/// Spin until the pipeline reports ready (the background load finished).
pub fn wait_ready(pipe: &Pipeline) {
    for _ in 0..500 {
        if pipe.ready() {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("pipeline never became ready");
}

//! The pipeline controller.
//!
//! Owns the three stages, the zoo selection, and all timing/threading state.
//! Parameter changes only raise a dirty flag; the actual rebuild happens at
//! the top of the next [`process`](Pipeline::process) call so no frame ever
//! observes a half-built pipeline. `process` itself never returns an error:
//! failures are logged once, drawn as an overlay, and latch the error state
//! until the next reconfiguration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ab_glyph::FontVec;
use image::RgbImage;
use log::{error, info, warn};

use deeplens_utils::timing::StageTimer;

use crate::{
    blob::Blob,
    error::{PipelineError, Result},
    network::{Backend, Network, NpuBackend, OnnxBackend, TpuBackend},
    overlay,
    postproc::{ClassifyPost, DetectPost, PostProcessor, SegmentPost},
    preproc::{parse_bool, BlobPreProcessor, PreProcessor, PreprocContext},
    report::ReportSink,
    zoo::{resolve_path, Filter, Zoo},
};

/// Pre-processor selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreProcKind {
    Blob,
    Custom,
}

impl PreProcKind {
    fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "Blob" => PreProcKind::Blob,
            "Custom" => PreProcKind::Custom,
            other => return Err(PipelineError::Param(format!("unknown preproc `{other}`"))),
        })
    }
}

/// Network runtime selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetKind {
    Onnx,
    Npu,
    Tpu,
    Custom,
}

impl NetKind {
    fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            // `OpenCV` is the historical zoo spelling of the general-purpose
            // CPU seat, which this crate runs through tract-onnx.
            "Onnx" | "OpenCV" => NetKind::Onnx,
            "NPU" => NetKind::Npu,
            "TPU" => NetKind::Tpu,
            "Custom" => NetKind::Custom,
            other => return Err(PipelineError::Param(format!("unknown nettype `{other}`"))),
        })
    }
}

/// Post-processor selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostProcKind {
    Classify,
    Detect,
    Segment,
    Custom,
}

impl PostProcKind {
    fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "Classify" => PostProcKind::Classify,
            "Detect" => PostProcKind::Detect,
            "Segment" => PostProcKind::Segment,
            "Custom" => PostProcKind::Custom,
            other => return Err(PipelineError::Param(format!("unknown postproc `{other}`"))),
        })
    }
}

/// Per-frame execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Processing {
    Sync,
    #[default]
    Async,
}

impl Processing {
    fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "Sync" => Processing::Sync,
            "Async" => Processing::Async,
            other => return Err(PipelineError::Param(format!("unknown processing `{other}`"))),
        })
    }
}

/// Observable pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    /// No pipe selected.
    #[default]
    Idle,
    /// Weights loading in the background.
    Loading,
    /// All three stages ready.
    Ready,
    /// A synchronous frame is being processed.
    RunningSync,
    /// An asynchronous inference is in flight.
    AsyncInflight,
    /// A stage failed; cleared by reconfiguration.
    Error,
}

struct NetResult {
    outs: Result<Vec<Blob>>,
    info: Vec<String>,
    elapsed: Duration,
}

/// The single in-flight inference slot.
struct NetJob {
    rx: mpsc::Receiver<NetResult>,
    handle: JoinHandle<()>,
    /// Inverse-mapping context captured when the job's blobs were made.
    ctx: PreprocContext,
}

/// Neural processing pipeline: pre-processor → network → post-processor.
pub struct Pipeline {
    // parameters
    zooroot: PathBuf,
    zoo_file: String,
    filter: Filter,
    pipe: String,
    processing: Processing,
    overlay_on: bool,
    preproc_kind: PreProcKind,
    net_kind: NetKind,
    post_kind: PostProcKind,
    font: Option<Arc<FontVec>>,
    frozen: bool,

    // stages
    preproc: Option<Box<dyn PreProcessor>>,
    network: Option<Network>,
    postproc: Option<Box<dyn PostProcessor>>,
    active_kinds: Option<(PreProcKind, NetKind, PostProcKind)>,

    // custom seats, reclaimed across rebuilds
    custom_preproc: Option<Box<dyn PreProcessor>>,
    custom_backend: Option<Box<dyn Backend>>,
    custom_postproc: Option<Box<dyn PostProcessor>>,

    // execution state
    state: PipelineState,
    zoo_dirty: bool,
    job: Option<NetJob>,
    pre_timer: StageTimer,
    net_timer: StageTimer,
    post_timer: StageTimer,
    net_info: Vec<String>,
    threw: bool,
    last_error: Option<String>,
    accelerators: BTreeMap<String, usize>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            zooroot: PathBuf::from("."),
            zoo_file: "models.yml".into(),
            filter: Filter::All,
            pipe: String::new(),
            processing: Processing::Async,
            overlay_on: true,
            preproc_kind: PreProcKind::Blob,
            net_kind: NetKind::Onnx,
            post_kind: PostProcKind::Classify,
            font: None,
            frozen: false,
            preproc: None,
            network: None,
            postproc: None,
            active_kinds: None,
            custom_preproc: None,
            custom_backend: None,
            custom_postproc: None,
            state: PipelineState::Idle,
            zoo_dirty: false,
            job: None,
            pre_timer: StageTimer::new("PreProc"),
            net_timer: StageTimer::new("Network"),
            post_timer: StageTimer::new("PstProc"),
            net_info: Vec::new(),
            threw: false,
            last_error: None,
            accelerators: BTreeMap::new(),
        }
    }

    /// Apply one pipeline-level parameter.
    ///
    /// Identity-forming parameters (zoo selection and stage kinds) only raise
    /// the rebuild flag here; the structural change happens at the top of the
    /// next `process()` call, on the processing thread.
    pub fn set_param(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "zooroot" | "zoo" | "filter" | "pipe" | "preproc" | "nettype" | "postproc" => {
                if self.frozen {
                    return Err(PipelineError::Param(format!(
                        "{key} is frozen while running"
                    )));
                }
                match key {
                    "zooroot" => self.zooroot = PathBuf::from(value),
                    "zoo" => self.zoo_file = value.to_string(),
                    "filter" => self.filter = Filter::from_name(value)?,
                    "pipe" => self.pipe = value.to_string(),
                    "preproc" => self.preproc_kind = PreProcKind::from_name(value)?,
                    "nettype" => self.net_kind = NetKind::from_name(value)?,
                    _ => self.post_kind = PostProcKind::from_name(value)?,
                }
                self.zoo_dirty = true;
                Ok(())
            }
            "processing" => {
                self.processing = Processing::from_name(value)?;
                Ok(())
            }
            "overlay" => {
                self.overlay_on = parse_bool(value)?;
                Ok(())
            }
            "font" => {
                let font = Arc::new(overlay::load_font(value)?);
                self.font = Some(Arc::clone(&font));
                if let Some(post) = self.postproc.as_mut() {
                    post.set_font(Some(font));
                }
                Ok(())
            }
            other => Err(PipelineError::Param(format!(
                "unknown pipeline parameter `{other}`"
            ))),
        }
    }

    /// Select a pipe from the zoo (shorthand for `set_param("pipe", …)`).
    pub fn select_pipe(&mut self, name: &str) -> Result<()> {
        self.set_param("pipe", name)
    }

    /// Install a custom pre-processor; used when `preproc` is `Custom`.
    pub fn set_custom_preprocessor(&mut self, pp: Box<dyn PreProcessor>) {
        self.custom_preproc = Some(pp);
        self.zoo_dirty = true;
    }

    /// Install a custom network backend; used when `nettype` is `Custom`.
    pub fn set_custom_network(&mut self, backend: Box<dyn Backend>) {
        self.custom_backend = Some(backend);
        self.zoo_dirty = true;
    }

    /// Install a custom post-processor; used when `postproc` is `Custom`.
    pub fn set_custom_postprocessor(&mut self, pp: Box<dyn PostProcessor>) {
        self.custom_postproc = Some(pp);
        self.zoo_dirty = true;
    }

    /// Freeze/unfreeze parameters users should not change while running.
    pub fn freeze(&mut self, doit: bool) {
        self.frozen = doit;
        if let Some(pre) = self.preproc.as_mut() {
            pre.freeze(doit);
        }
        if let Some(net) = self.network.as_mut() {
            net.freeze(doit);
        }
        if let Some(post) = self.postproc.as_mut() {
            post.freeze(doit);
        }
    }

    /// True when all three stages are constructed and the network is loaded.
    pub fn ready(&self) -> bool {
        self.preproc.is_some()
            && self.postproc.is_some()
            && self.network.as_ref().is_some_and(Network::ready)
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Names of the zoo entries matching the current filter.
    pub fn scan_zoo(&self) -> Result<Vec<String>> {
        let path = resolve_path(&self.zooroot, &self.zoo_file);
        let zoo = Zoo::load(&path)?;
        Ok(zoo
            .scan(self.filter)
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    /// Process one frame. Never fails: errors latch the error state and are
    /// rendered on `outimg` until the next reconfiguration.
    pub fn process(
        &mut self,
        img: &RgbImage,
        sink: &mut dyn ReportSink,
        mut outimg: Option<&mut RgbImage>,
        idle: bool,
    ) {
        if self.zoo_dirty {
            if let Err(err) = self.reconfigure() {
                self.fail(err, outimg.as_deref_mut());
                return;
            }
        }

        match self.state {
            PipelineState::Error => {
                if let Some(img) = outimg {
                    let msg = self.last_error.as_deref().unwrap_or("pipeline error");
                    overlay::draw_error(img, msg, self.font.as_deref());
                }
                return;
            }
            PipelineState::Idle => return,
            _ => {}
        }

        // readiness gate: skip frames while weights load in the background
        let net_ready = self.network.as_ref().is_some_and(Network::ready);
        if !net_ready {
            if let Some(err) = self.network.as_ref().and_then(Network::take_load_error) {
                self.fail(err, outimg.as_deref_mut());
                return;
            }
            self.state = PipelineState::Loading;
            if let Some(img) = outimg {
                overlay::draw_info(
                    img,
                    &["Network loading...".to_string()],
                    self.font.as_deref(),
                );
            }
            return;
        }
        if self.state == PipelineState::Loading {
            info!("pipe `{}` ready", self.pipe);
            self.state = PipelineState::Ready;
        }

        let result = match self.processing {
            Processing::Sync => self.run_sync(img, sink, outimg.as_deref_mut(), idle),
            Processing::Async => self.run_async(img, sink, outimg.as_deref_mut(), idle),
        };
        match result {
            Ok(()) => {
                if self.overlay_on && !idle {
                    if let Some(img) = outimg {
                        let lines = self.info_lines();
                        overlay::draw_info_bottom(img, &lines, self.font.as_deref());
                    }
                }
            }
            Err(err) => self.fail(err, outimg),
        }
    }

    fn run_sync(
        &mut self,
        img: &RgbImage,
        sink: &mut dyn ReportSink,
        mut outimg: Option<&mut RgbImage>,
        idle: bool,
    ) -> Result<()> {
        self.state = PipelineState::RunningSync;

        let network = self.network.as_ref().ok_or(PipelineError::ModelNotLoaded)?;
        let attrs = network.input_attrs()?;

        let preproc = self
            .preproc
            .as_mut()
            .ok_or_else(|| PipelineError::Param("no pre-processor".into()))?;
        self.pre_timer.start();
        let blobs = preproc.process(img, &attrs)?;
        self.pre_timer.stop();
        check_blob_count(&blobs, attrs.len())?;
        let ctx = preproc.context().clone();

        let mut net_info = Vec::new();
        self.net_timer.start();
        let outs = network.process(&blobs, &mut net_info)?;
        self.net_timer.stop();
        self.net_info = net_info;

        let postproc = self
            .postproc
            .as_mut()
            .ok_or_else(|| PipelineError::Param("no post-processor".into()))?;
        self.post_timer.start();
        postproc.process(&outs, &ctx)?;
        self.post_timer.stop();
        postproc.report(sink, outimg.as_deref_mut(), self.overlay_on, idle);

        self.state = PipelineState::Ready;
        Ok(())
    }

    fn run_async(
        &mut self,
        img: &RgbImage,
        sink: &mut dyn ReportSink,
        mut outimg: Option<&mut RgbImage>,
        idle: bool,
    ) -> Result<()> {
        // poll the in-flight inference; never block here
        if let Some(job) = self.job.take() {
            match job.rx.try_recv() {
                Ok(res) => {
                    let _ = job.handle.join();
                    self.net_timer.record(res.elapsed);
                    self.net_info = res.info;
                    let outs = res.outs?;
                    let postproc = self
                        .postproc
                        .as_mut()
                        .ok_or_else(|| PipelineError::Param("no post-processor".into()))?;
                    self.post_timer.start();
                    postproc.process(&outs, &job.ctx)?;
                    self.post_timer.stop();
                }
                Err(mpsc::TryRecvError::Empty) => self.job = Some(job),
                Err(mpsc::TryRecvError::Disconnected) => {
                    let _ = job.handle.join();
                    return Err(PipelineError::BackendFailure(
                        "inference worker disappeared".into(),
                    ));
                }
            }
        }

        // launch the next inference when the slot is free
        if self.job.is_none() {
            let network = self.network.as_ref().ok_or(PipelineError::ModelNotLoaded)?;
            let attrs = network.input_attrs()?;
            let runner = network.runner();

            let preproc = self
                .preproc
                .as_mut()
                .ok_or_else(|| PipelineError::Param("no pre-processor".into()))?;
            self.pre_timer.start();
            let blobs = preproc.process(img, &attrs)?;
            self.pre_timer.stop();
            check_blob_count(&blobs, attrs.len())?;
            let ctx = preproc.context().clone();

            let (tx, rx) = mpsc::channel();
            let handle = std::thread::spawn(move || {
                let mut info = Vec::new();
                let start = Instant::now();
                let outs = runner.process(&blobs, &mut info);
                let _ = tx.send(NetResult {
                    outs,
                    info,
                    elapsed: start.elapsed(),
                });
            });
            self.job = Some(NetJob { rx, handle, ctx });
        }
        self.state = PipelineState::AsyncInflight;

        // draw the previous frame's decoded results
        let postproc = self
            .postproc
            .as_mut()
            .ok_or_else(|| PipelineError::Param("no post-processor".into()))?;
        postproc.report(sink, outimg.as_deref_mut(), self.overlay_on, idle);
        Ok(())
    }

    /// Rebuild the pipeline from the selected zoo entry. Runs in a single
    /// critical section at the top of `process()`.
    fn reconfigure(&mut self) -> Result<()> {
        self.zoo_dirty = false;

        if self.pipe.is_empty() {
            self.drain_job();
            self.teardown();
            self.reset_frame_state();
            self.state = PipelineState::Idle;
            return Ok(());
        }

        // Resolve the new configuration before touching the running stages:
        // a zoo error must leave the previous pipe active.
        let zoo_path = resolve_path(&self.zooroot, &self.zoo_file);
        let entry = match Zoo::load(&zoo_path).and_then(|zoo| {
            zoo.entry(&self.pipe).cloned().ok_or_else(|| {
                PipelineError::ZooParse(format!(
                    "no pipe `{}` in {}",
                    self.pipe,
                    zoo_path.display()
                ))
            })
        }) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("zoo selection failed: {err}; keeping previous pipe");
                self.last_error = Some(err.to_string());
                return Ok(());
            }
        };

        self.drain_job();
        self.teardown();
        self.reset_frame_state();
        self.state = PipelineState::Idle;

        if let Some(v) = entry.get("preproc") {
            self.preproc_kind = PreProcKind::from_name(v)?;
        }
        if let Some(v) = entry.get("nettype") {
            self.net_kind = NetKind::from_name(v)?;
        }
        if let Some(v) = entry.get("postproc") {
            self.post_kind = PostProcKind::from_name(v)?;
        }
        let dataroot = match entry.get("dataroot") {
            Some(v) => resolve_path(&self.zooroot, v),
            None => self.zooroot.clone(),
        };

        // construct in order: pre-processor, network, post-processor
        let mut preproc: Box<dyn PreProcessor> = match self.preproc_kind {
            PreProcKind::Blob => Box::new(BlobPreProcessor::new()),
            PreProcKind::Custom => self.custom_preproc.take().ok_or_else(|| {
                PipelineError::Param("preproc is Custom but none was installed".into())
            })?,
        };
        let mut network = match self.net_kind {
            NetKind::Onnx => Network::new(Box::new(OnnxBackend::new())),
            NetKind::Npu => Network::new(Box::new(NpuBackend::new())),
            NetKind::Tpu => Network::new(Box::new(TpuBackend::new())),
            NetKind::Custom => Network::new(self.custom_backend.take().ok_or_else(|| {
                PipelineError::Param("nettype is Custom but none was installed".into())
            })?),
        };
        let mut postproc: Box<dyn PostProcessor> = match self.post_kind {
            PostProcKind::Classify => Box::new(ClassifyPost::new()),
            PostProcKind::Detect => Box::new(DetectPost::new()),
            PostProcKind::Segment => Box::new(SegmentPost::new()),
            PostProcKind::Custom => self.custom_postproc.take().ok_or_else(|| {
                PipelineError::Param("postproc is Custom but none was installed".into())
            })?,
        };

        network.set_param("dataroot", &dataroot.to_string_lossy())?;

        // apply every entry parameter to whichever stage takes it
        for (key, value) in &entry.params {
            match key.as_str() {
                "preproc" | "nettype" | "postproc" | "dataroot" => continue,
                "accelerator" => {
                    let next = self.accelerators.len();
                    let idx = *self.accelerators.entry(value.clone()).or_insert(next);
                    network.set_param("tpunum", &idx.to_string())?;
                    continue;
                }
                _ => {}
            }
            // stage-level paths resolve against dataroot
            let resolved;
            let value = if matches!(key.as_str(), "model" | "config" | "classes") {
                resolved = resolve_path(&dataroot, value).to_string_lossy().into_owned();
                &resolved
            } else {
                value
            };

            let consumed = preproc.set_param(key, value)?
                || network.set_param(key, value)?
                || postproc.set_param(key, value)?;
            if !consumed {
                warn!("pipe `{}`: no stage takes parameter `{key}`", self.pipe);
            }
        }

        postproc.set_font(self.font.clone());
        network.start_load();

        self.preproc = Some(preproc);
        self.network = Some(network);
        self.postproc = Some(postproc);
        self.active_kinds = Some((self.preproc_kind, self.net_kind, self.post_kind));
        self.state = PipelineState::Loading;
        info!("pipe `{}` selected, loading network", self.pipe);
        Ok(())
    }

    fn reset_frame_state(&mut self) {
        self.pre_timer.reset();
        self.net_timer.reset();
        self.post_timer.reset();
        self.net_info.clear();
        self.threw = false;
        self.last_error = None;
    }

    /// Tear down stages in reverse construction order, returning custom
    /// implementations to their seats for the next rebuild.
    fn teardown(&mut self) {
        let kinds = self.active_kinds.take();
        let (pre_kind, net_kind, post_kind) = match kinds {
            Some(k) => k,
            None => {
                self.postproc = None;
                self.network = None;
                self.preproc = None;
                return;
            }
        };
        if post_kind == PostProcKind::Custom {
            self.custom_postproc = self.postproc.take();
        } else {
            self.postproc = None;
        }
        if net_kind == NetKind::Custom {
            self.custom_backend = self.network.take().and_then(Network::into_backend);
        } else {
            self.network = None;
        }
        if pre_kind == PreProcKind::Custom {
            self.custom_preproc = self.preproc.take();
        } else {
            self.preproc = None;
        }
    }

    /// Synchronous drain of the in-flight inference; its result is discarded.
    fn drain_job(&mut self) {
        if let Some(job) = self.job.take() {
            let _ = job.rx.recv();
            let _ = job.handle.join();
        }
    }

    fn fail(&mut self, err: PipelineError, outimg: Option<&mut RgbImage>) {
        if matches!(err, PipelineError::ModelNotLoaded) {
            // recovered locally: skip the frame, keep waiting
            if let Some(img) = outimg {
                overlay::draw_info(
                    img,
                    &["Network loading...".to_string()],
                    self.font.as_deref(),
                );
            }
            return;
        }
        if !self.threw {
            error!("pipeline error: {err}");
            self.threw = true;
        }
        self.last_error = Some(err.to_string());
        self.state = PipelineState::Error;
        if let Some(img) = outimg {
            overlay::draw_error(img, &err.to_string(), self.font.as_deref());
        }
    }

    /// Overlay lines describing the pipeline and its stage timings.
    fn info_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("* Pipeline: {}", self.pipe)];
        lines.push(format!("- {}", self.pre_timer.display()));
        lines.push(format!("- {}", self.net_timer.display()));
        lines.push(format!("- {}", self.post_timer.display()));
        if let Some(pre) = self.preproc.as_ref() {
            lines.extend(pre.info());
        }
        lines.extend(self.net_info.iter().cloned());
        lines
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // drain the in-flight inference, then stages drop in reverse
        // construction order inside teardown()
        self.drain_job();
        self.teardown();
    }
}

fn check_blob_count(blobs: &[Blob], expected: usize) -> Result<()> {
    if blobs.len() != expected {
        return Err(PipelineError::BlobShapeMismatch(format!(
            "pre-processor produced {} blobs for {} declared inputs",
            blobs.len(),
            expected
        )));
    }
    Ok(())
}

//! The model zoo: a declarative YAML catalog of pipeline configurations.
//!
//! The top level is a mapping of pipeline name → settings map. Top-level
//! scalar keys act as defaults applied to every entry. Values are kept as
//! strings; each stage parses its own parameters.
//!
//! ```yaml
//! dataroot: /opt/models
//!
//! yolo-coco:
//!   preproc: Blob
//!   nettype: NPU
//!   postproc: Detect
//!   detecttype: RAWYOLOv3
//!   model: yolov3.rknn
//!   classes: coco.txt
//!   anchors: "10,14, 23,27, 37,58"
//! ```

use std::path::{Path, PathBuf};

use log::warn;
use serde_yaml::Value;

use crate::error::{PipelineError, Result};

/// Keys the schema recognizes; anything else draws a warning and is skipped.
const KNOWN_KEYS: &[&str] = &[
    "preproc", "nettype", "postproc", "model", "config", "intensors", "outtensors", "mean",
    "scale", "rgb", "resize", "classes", "anchors", "detecttype", "nms", "thresh", "top",
    "classoffset", "softmax", "scorescale", "dequant", "flattenoutputs", "target", "backend",
    "tpunum", "alpha", "bgid", "segtype", "dataroot", "library", "accelerator", "extramodel",
    "comment",
];

/// Keys that are recognized but deliberately not applied to any stage.
const IGNORED_KEYS: &[&str] = &["extramodel", "comment"];

/// Narrows which zoo entries are offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Filter {
    #[default]
    All,
    OpenCv,
    Tpu,
    Npu,
    Vpu,
}

impl Filter {
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "All" => Filter::All,
            "OpenCV" => Filter::OpenCv,
            "TPU" => Filter::Tpu,
            "NPU" => Filter::Npu,
            "VPU" => Filter::Vpu,
            other => return Err(PipelineError::Param(format!("unknown filter `{other}`"))),
        })
    }
}

/// One named pipeline configuration: ordered key/value settings.
#[derive(Debug, Clone)]
pub struct ZooEntry {
    pub name: String,
    pub params: Vec<(String, String)>,
}

impl ZooEntry {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Which accelerator class this entry belongs to, for filtering.
    fn class(&self) -> Filter {
        match self.get("nettype").unwrap_or("OpenCV") {
            "NPU" => Filter::Npu,
            "TPU" => Filter::Tpu,
            "OpenCV" | "Onnx" => {
                if self.get("target").is_some_and(|t| t.contains("Myriad")) {
                    Filter::Vpu
                } else {
                    Filter::OpenCv
                }
            }
            _ => Filter::All,
        }
    }

    fn matches(&self, filter: Filter) -> bool {
        filter == Filter::All || self.class() == filter
    }
}

/// A parsed zoo file.
#[derive(Debug, Clone, Default)]
pub struct Zoo {
    entries: Vec<ZooEntry>,
}

impl Zoo {
    /// Load and validate a zoo file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::ZooParse(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&contents).map_err(|e| match e {
            PipelineError::ZooParse(msg) => {
                PipelineError::ZooParse(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Parse zoo YAML text.
    pub fn parse(contents: &str) -> Result<Self> {
        let doc: Value = serde_yaml::from_str(contents)
            .map_err(|e| PipelineError::ZooParse(format!("bad YAML: {e}")))?;
        let Value::Mapping(top) = doc else {
            return Err(PipelineError::ZooParse(
                "top level must be a mapping of pipeline names".into(),
            ));
        };

        // First pass: top-level scalars become defaults for every entry.
        let mut defaults: Vec<(String, String)> = Vec::new();
        for (key, value) in &top {
            let Some(key) = key.as_str() else { continue };
            if let Some(v) = scalar_to_string(value) {
                if check_key(key, "zoo defaults") {
                    defaults.push((key.to_string(), v));
                }
            }
        }

        let mut entries = Vec::new();
        for (key, value) in &top {
            let Some(name) = key.as_str() else {
                return Err(PipelineError::ZooParse("pipeline names must be strings".into()));
            };
            let Value::Mapping(settings) = value else {
                continue; // a default, handled above
            };

            let mut params = defaults.clone();
            for (k, v) in settings {
                let Some(k) = k.as_str() else {
                    return Err(PipelineError::ZooParse(format!(
                        "non-string key in pipe `{name}`"
                    )));
                };
                let Some(v) = scalar_to_string(v) else {
                    return Err(PipelineError::ZooParse(format!(
                        "value of `{k}` in pipe `{name}` must be a scalar"
                    )));
                };
                if !check_key(k, name) {
                    continue;
                }
                // entry values override defaults
                params.retain(|(dk, _)| dk != k);
                params.push((k.to_string(), v));
            }
            entries.push(ZooEntry {
                name: name.to_string(),
                params,
            });
        }

        Ok(Self { entries })
    }

    /// Names of the entries matching `filter`, in file order.
    pub fn scan(&self, filter: Filter) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.matches(filter))
            .map(|e| e.name.as_str())
            .collect()
    }

    pub fn entry(&self, name: &str) -> Option<&ZooEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn check_key(key: &str, context: &str) -> bool {
    if !KNOWN_KEYS.contains(&key) {
        warn!("unknown zoo key `{key}` in {context}; skipped");
        return false;
    }
    !IGNORED_KEYS.contains(&key)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Resolve a possibly-relative path against a root directory.
pub fn resolve_path(root: &Path, value: &str) -> PathBuf {
    let p = Path::new(value);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
dataroot: /opt/models

classify-mobilenet:
  preproc: Blob
  nettype: OpenCV
  postproc: Classify
  model: mobilenet.onnx
  intensors: "NCHW:32F:1x3x224x224"
  thresh: 15

detect-tpu:
  preproc: Blob
  nettype: TPU
  postproc: Detect
  detecttype: TPUSSD
  model: ssd_edgetpu.tflite
  dataroot: /opt/tpu-models

segment-vpu:
  preproc: Blob
  nettype: OpenCV
  target: Myriad
  postproc: Segment
  model: deeplab.onnx
"#;

    #[test]
    fn parses_entries_and_defaults() {
        let zoo = Zoo::parse(SAMPLE).unwrap();
        let entry = zoo.entry("classify-mobilenet").unwrap();
        assert_eq!(entry.get("model"), Some("mobilenet.onnx"));
        assert_eq!(entry.get("thresh"), Some("15"));
        // the top-level scalar became a default
        assert_eq!(entry.get("dataroot"), Some("/opt/models"));
        // per-entry values override defaults
        let tpu = zoo.entry("detect-tpu").unwrap();
        assert_eq!(tpu.get("dataroot"), Some("/opt/tpu-models"));
    }

    #[test]
    fn scan_honors_the_filter() {
        let zoo = Zoo::parse(SAMPLE).unwrap();
        assert_eq!(zoo.scan(Filter::All).len(), 3);
        assert_eq!(zoo.scan(Filter::Tpu), vec!["detect-tpu"]);
        assert_eq!(zoo.scan(Filter::Vpu), vec!["segment-vpu"]);
        assert_eq!(zoo.scan(Filter::OpenCv), vec!["classify-mobilenet"]);
        assert!(zoo.scan(Filter::Npu).is_empty());
    }

    #[test]
    fn unknown_keys_are_skipped_not_fatal() {
        let zoo = Zoo::parse("pipe:\n  nettype: NPU\n  frobnicate: 12\n").unwrap();
        let entry = zoo.entry("pipe").unwrap();
        assert_eq!(entry.get("frobnicate"), None);
        assert_eq!(entry.get("nettype"), Some("NPU"));
    }

    #[test]
    fn comment_keys_are_ignored() {
        let zoo = Zoo::parse("pipe:\n  comment: hello\n  model: m.onnx\n").unwrap();
        let entry = zoo.entry("pipe").unwrap();
        assert_eq!(entry.get("comment"), None);
        assert_eq!(entry.get("model"), Some("m.onnx"));
    }

    #[test]
    fn bad_yaml_is_a_zoo_error() {
        assert!(matches!(
            Zoo::parse(": : :"),
            Err(PipelineError::ZooParse(_))
        ));
        assert!(matches!(
            Zoo::parse("- a\n- b\n"),
            Err(PipelineError::ZooParse(_))
        ));
    }

    #[test]
    fn resolve_path_honors_absolute_values() {
        let root = Path::new("/opt/models");
        assert_eq!(
            resolve_path(root, "m.onnx"),
            PathBuf::from("/opt/models/m.onnx")
        );
        assert_eq!(resolve_path(root, "/abs/m.onnx"), PathBuf::from("/abs/m.onnx"));
    }
}

//! Common helpers shared across deeplens crates.

/// Label-file loading and stable label coloring.
pub mod labels;
/// Softmax and top-k selection over score vectors.
pub mod math;
/// Integer rectangles, clamping, and intersection-over-union.
pub mod rect;
/// Rolling per-stage wall-time averages.
pub mod timing;
/// Cross-runtime tensor descriptors and the tensor-spec string grammar.
pub mod tensor;

use anyhow::Result;
use log::LevelFilter;

pub use labels::{get_label, label_color, load_labels};
pub use math::{softmax, top_k};
pub use rect::Rect;
pub use tensor::{parse_tensor_specs, ElemType, Layout, Quant, SpecError, TensorAttr};
pub use timing::StageTimer;

/// Initialize logging once for CLI and test environments.
///
/// This function respects the `RUST_LOG` environment variable if it is set.
/// Otherwise, it falls back to the provided default filter level.
pub fn init_logging(default_filter: LevelFilter) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    );

    if builder.try_init().is_err() {
        // Logger already initialized; nothing to do.
    }
    Ok(())
}

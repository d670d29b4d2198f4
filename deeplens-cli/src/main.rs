//! Command-line front end for the deeplens pipeline.
//!
//! Loads a zoo entry, feeds image files through the pipeline, prints the
//! serial-style result messages to stdout, and optionally writes annotated
//! frames. Stands in for the camera firmware on a development machine.

mod args;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, LevelFilter};

use deeplens_core::{Pipeline, ReportSink};
use deeplens_utils::init_logging;

use args::Args;

/// Prints serial-style messages the way the camera would emit them.
struct StdoutSink;

impl ReportSink for StdoutSink {
    fn send(&mut self, line: &str) {
        println!("{line}");
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    init_logging(level)?;

    let mut pipeline = Pipeline::new();
    pipeline.set_param("zooroot", &args.zooroot.to_string_lossy())?;
    pipeline.set_param("zoo", &args.zoo)?;
    pipeline.set_param("filter", &args.filter)?;
    pipeline.set_param("processing", &args.processing)?;
    if args.no_overlay {
        pipeline.set_param("overlay", "false")?;
    }
    if let Some(font) = &args.font {
        pipeline.set_param("font", &font.to_string_lossy())?;
    }

    if args.list {
        for name in pipeline.scan_zoo()? {
            println!("{name}");
        }
        return Ok(());
    }

    let pipe = match &args.pipe {
        Some(p) => p.clone(),
        None => bail!("--pipe is required unless --list is given"),
    };
    let input = match &args.input {
        Some(i) => i.clone(),
        None => bail!("--input is required unless --list is given"),
    };
    pipeline.select_pipe(&pipe)?;

    let frames = collect_frames(&input)?;
    if frames.is_empty() {
        bail!("no images found under {}", input.display());
    }
    if let Some(dir) = &args.output {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create {}", dir.display()))?;
    }

    let mut sink = StdoutSink;
    let mut frame_no = 0u32;
    for pass in 0..args.loops.max(1) {
        for path in &frames {
            let img = image::open(path)
                .with_context(|| format!("cannot read image {}", path.display()))?
                .to_rgb8();

            // first frames simply report "loading" until the weights are in;
            // keep re-feeding until one frame ran through a ready pipeline
            let mut out = img.clone();
            loop {
                let was_ready = pipeline.ready();
                pipeline.process(&img, &mut sink, Some(&mut out), false);
                if was_ready || pipeline.last_error().is_some() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            if let Some(err) = pipeline.last_error() {
                bail!("pipeline failed on {}: {err}", path.display());
            }

            if let Some(dir) = &args.output {
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| frame_no.to_string());
                let target = dir.join(format!("{name}-{pass}-{frame_no}.png"));
                out.save(&target)
                    .with_context(|| format!("cannot write {}", target.display()))?;
            }
            frame_no += 1;
        }
    }
    info!("processed {frame_no} frame(s) through pipe `{pipe}`");
    Ok(())
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "ppm"];

/// A single image file, or every image directly inside a directory.
fn collect_frames(input: &Path) -> Result<Vec<PathBuf>> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    if !input.is_dir() {
        bail!("input {} does not exist", input.display());
    }
    let mut frames: Vec<PathBuf> = std::fs::read_dir(input)
        .with_context(|| format!("cannot list {}", input.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    frames.sort();
    Ok(frames)
}

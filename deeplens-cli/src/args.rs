//! Command-line arguments.

use std::path::PathBuf;

use clap::Parser;

/// Run a deeplens zoo pipeline over image files.
#[derive(Debug, Parser)]
#[command(name = "deeplens", version, about)]
pub struct Args {
    /// Zoo file (.yml); relative paths resolve against --zooroot
    #[arg(long, default_value = "models.yml")]
    pub zoo: String,

    /// Directory holding zoo files and (by default) model data
    #[arg(long, default_value = ".")]
    pub zooroot: PathBuf,

    /// Pipeline to run; a top-level entry of the zoo file
    #[arg(long)]
    pub pipe: Option<String>,

    /// Only consider zoo entries for this accelerator class
    #[arg(long, default_value = "All")]
    pub filter: String,

    /// List matching zoo entries and exit
    #[arg(long)]
    pub list: bool,

    /// Input image file, or a directory of images
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// Where to write annotated frames (directory)
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Per-frame execution mode
    #[arg(long, default_value = "Sync")]
    pub processing: String,

    /// TTF/OTF font for overlay text; without it overlays are boxes only
    #[arg(long)]
    pub font: Option<PathBuf>,

    /// Process the input this many times (to exercise async mode)
    #[arg(long, default_value_t = 1)]
    pub loops: u32,

    /// Disable the result/info overlay
    #[arg(long)]
    pub no_overlay: bool,

    /// Verbose logging (repeat for debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

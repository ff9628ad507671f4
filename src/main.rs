// SPDX-License-Identifier: GPL-3.0-only

use clap::{Args, Parser, Subcommand};
use picam::config::{SourceKind, WindowRect};
use picam::constants::exit_code;
use picam::errors::AppError;
use picam::scenes::SceneKind;
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

#[derive(Parser)]
#[command(name = "picam")]
#[command(about = "Camera preview through a GPU scene pipeline")]
#[command(version = env!("GIT_VERSION"))]
#[command(subcommand_required = false)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    preview: PreviewArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the preview (default)
    Preview(PreviewArgs),

    /// List V4L2 capture devices
    List,
}

#[derive(Args, Clone, Debug, Default)]
pub struct PreviewArgs {
    /// Run time in ms; 0 runs until Ctrl+C, negative uses the default (5000)
    #[arg(short, long, allow_hyphen_values = true)]
    pub timeout: Option<i64>,

    /// Generate the preview from the full sensor resolution
    #[arg(long = "fullpreview")]
    pub full_res_preview: bool,

    /// Preview rectangle: x,y,width,height
    #[arg(short, long, value_name = "x,y,w,h")]
    pub preview: Option<WindowRect>,

    /// GL window rectangle: x,y,width,height
    #[arg(long = "glwin", value_name = "x,y,w,h")]
    pub gl_window: Option<WindowRect>,

    /// Scene to render
    #[arg(short, long, value_enum)]
    pub scene: Option<SceneKind>,

    /// Frame source
    #[arg(long, value_enum)]
    pub source: Option<SourceKind>,

    /// V4L2 device node for the v4l2 source
    #[arg(short, long)]
    pub device: Option<String>,

    /// End the virtual stream after this many frames
    #[arg(long = "frames")]
    pub frame_limit: Option<u64>,

    /// Show the preview in the terminal
    #[arg(long)]
    pub terminal: bool,

    /// Save the first rendered frame as PNG (a directory, or none, gets a
    /// timestamped name under ~/Pictures/picam)
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    pub snapshot: Option<Option<PathBuf>>,

    /// Overlay rectangle in preview pixels: x,y,width,height (repeatable)
    #[arg(long = "rect", value_name = "x,y,w,h")]
    pub rects: Vec<WindowRect>,

    /// Configuration file (default: ~/.config/picam/config.json)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    pub verbose: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(exit_code::USAGE as u8)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let args = match &cli.command {
        Some(Commands::Preview(args)) => args.clone(),
        _ => cli.preview.clone(),
    };

    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=picam=trace, RUST_LOG=info
    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Some(Commands::List) => cli::list_devices(),
        _ => cli::run_preview(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("picam: {}", e);
            let code = match e {
                AppError::Config(_) => exit_code::USAGE,
                _ => exit_code::SOFTWARE,
            };
            ExitCode::from(code as u8)
        }
    }
}

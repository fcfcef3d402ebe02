//! Configuration for the inpainting driver.
//!
//! CLI flags are translated once into an `InpaintingConfig`; the fixed
//! numbers the frame loop relies on live here as named constants.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;

/// Graph input stream carrying RGB frames.
pub const INPUT_STREAM: &str = "input_video";
/// Composited RGB frame.
pub const OUTPUT_VIDEO: &str = "output_video";
/// Three-channel corpus mask.
pub const OUTPUT_CORPUS_MASK: &str = "output_corpus_mask";
/// Three-channel face outline mask.
pub const OUTPUT_FACE_MASK: &str = "output_face_mask";
/// Single-channel float selfie probability in `[0, 1]`.
pub const OUTPUT_SELFIE_MASK: &str = "output_selfie_mask";

/// Title of the preview window.
pub const WINDOW_NAME: &str = "Inpainting";
/// Recording stops after this many frames have been written.
pub const RECORD_FRAME_LIMIT: usize = 100;
/// Selfie intensities strictly above this become foreground.
pub const SELFIE_MASK_THRESHOLD: f64 = 192.0;
/// Capture format requested for interactive previews.
pub const PREVIEW_WIDTH: i32 = 640;
pub const PREVIEW_HEIGHT: i32 = 480;
pub const PREVIEW_FPS: f64 = 30.0;
/// How long each preview iteration waits for a key press.
pub const KEY_POLL_INTERVAL_MS: i32 = 5;
/// Key code some highgui backends report when nothing was pressed.
pub const NO_KEY_SENTINEL: i32 = 255;
/// Emit a debug heartbeat every N frames.
pub const HEARTBEAT_INTERVAL: u64 = 30;

#[derive(Clone, Debug)]
/// Canonical configuration for a single run.
pub struct InpaintingConfig {
    /// Text-format graph description.
    pub graph_config_path: PathBuf,
    /// Video file to read; `None` selects the default camera.
    pub input_video_path: Option<PathBuf>,
    /// Recording destination; `None` selects the preview window.
    pub output_video_path: Option<PathBuf>,
    /// Tracing options.
    pub telemetry: TelemetryOptions,
}

impl InpaintingConfig {
    /// Whether frames are written to disk rather than shown.
    pub fn records(&self) -> bool {
        self.output_video_path.is_some()
    }
}

#[derive(Clone, Debug, Default)]
/// Optional tracing outputs.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing per-frame spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// Flags accepted by the `inpainting` binary.
#[derive(Debug, Args)]
pub struct InpaintingCliArgs {
    /// Name of file containing a text format graph config.
    #[arg(long = "calculator_graph_config_file", value_name = "PATH")]
    pub calculator_graph_config_file: Option<PathBuf>,
    /// Full path of video to load. If not provided, use the webcam.
    #[arg(long = "input_video_path", value_name = "PATH")]
    pub input_video_path: Option<PathBuf>,
    /// Full path of where to save the result (.mp4). If not provided, show
    /// the result in a window.
    #[arg(long = "output_video_path", value_name = "PATH")]
    pub output_video_path: Option<PathBuf>,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<InpaintingCliArgs> for InpaintingConfig {
    type Error = anyhow::Error;

    fn try_from(args: InpaintingCliArgs) -> Result<Self> {
        let Some(graph_config_path) = non_empty(args.calculator_graph_config_file) else {
            bail!("Missing graph config. Provide --calculator_graph_config_file <path>.");
        };

        Ok(Self {
            graph_config_path,
            input_video_path: non_empty(args.input_video_path),
            output_video_path: non_empty(args.output_video_path),
            telemetry: TelemetryOptions {
                chrome_trace_path: non_empty(args.chrome_trace),
            },
        })
    }
}

/// An explicitly empty flag (`--input_video_path=`) means "not given".
fn non_empty(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|p| !p.as_os_str().is_empty())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: InpaintingCliArgs,
    }

    fn parse(argv: &[&str]) -> Result<InpaintingConfig> {
        let cli = TestCli::try_parse_from(std::iter::once("inpainting").chain(argv.iter().copied()))?;
        InpaintingConfig::try_from(cli.args)
    }

    #[test]
    fn minimal_flags_select_camera_and_window() {
        let config = parse(&["--calculator_graph_config_file", "graph.pbtxt"]).unwrap();
        assert_eq!(config.graph_config_path, PathBuf::from("graph.pbtxt"));
        assert!(config.input_video_path.is_none());
        assert!(!config.records());
    }

    #[test]
    fn empty_paths_count_as_absent() {
        let config = parse(&[
            "--calculator_graph_config_file=graph.pbtxt",
            "--input_video_path=",
            "--output_video_path=",
        ])
        .unwrap();
        assert!(config.input_video_path.is_none());
        assert!(config.output_video_path.is_none());
    }

    #[test]
    fn output_path_selects_recording() {
        let config = parse(&[
            "--calculator_graph_config_file=graph.pbtxt",
            "--input_video_path=clip.mp4",
            "--output_video_path=out.mp4",
        ])
        .unwrap();
        assert!(config.records());
        assert_eq!(config.input_video_path, Some(PathBuf::from("clip.mp4")));
    }

    #[test]
    fn graph_config_is_required() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--calculator_graph_config_file="]).is_err());
    }
}

//! The capture → graph → composite → sink loop and its shutdown sequence.

use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result};
use graph_runtime::{CalculatorGraphConfig, CalculatorRegistry};
use tracing::{debug, info, info_span, warn};
use video_ingest::{FrameSource, SourceKind, VideoFileWriter, VideoSource, to_graph_frame};

use crate::inpainting::{
    clock::FrameClock,
    config::{
        HEARTBEAT_INTERVAL, InpaintingConfig, PREVIEW_FPS, PREVIEW_HEIGHT, PREVIEW_WIDTH,
        WINDOW_NAME,
    },
    frames::mat_to_frame,
    masks,
    session::GraphSession,
    sink::{FrameSink, HighguiWindow, RecordingSink, SinkControl, WindowSink},
    telemetry,
};

/// Why the frame loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopExit {
    /// A video file ran out of frames.
    EndOfStream,
    /// An output stream closed before delivering all four packets.
    StreamClosed,
    /// The recording hit its frame cap.
    FrameLimit,
    /// The viewer pressed a key.
    KeyPressed,
    /// Ctrl+C was received.
    Interrupted,
}

/// Run the driver with only the built-in calculators available.
pub fn run(config: InpaintingConfig) -> Result<()> {
    run_with_registry(config, &CalculatorRegistry::with_builtins())
}

/// Run the driver, resolving graph nodes against `registry`.
pub fn run_with_registry(config: InpaintingConfig, registry: &CalculatorRegistry) -> Result<()> {
    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let shutdown = install_ctrl_handler();

    let run_span = info_span!(
        "inpainting",
        graph = %config.graph_config_path.display(),
        recording = config.records(),
    );
    let _run_span_guard = run_span.enter();

    let graph_config = CalculatorGraphConfig::from_file(&config.graph_config_path)
        .with_context(|| {
            format!(
                "loading graph config {}",
                config.graph_config_path.display()
            )
        })?;
    info!(
        "Loaded calculator graph config: {} node(s), inputs {:?}, outputs {:?}",
        graph_config.nodes.len(),
        graph_config.input_streams,
        graph_config.output_streams
    );
    let mut session = GraphSession::initialize(graph_config, registry)?;

    info!("Initialize the camera or load the video.");
    let mut source = VideoSource::open(config.input_video_path.as_deref())
        .context("opening video source")?;

    let mut sink = match open_sink(&config, &mut source) {
        Ok(sink) => sink,
        Err(err) => {
            if let Err(release_err) = source.release() {
                warn!("Failed to release {}: {release_err}", source.uri());
            }
            return Err(err);
        }
    };

    let exit = drive(&mut source, &mut session, sink.as_mut(), &shutdown)?;
    info!("Frame loop ended: {exit:?}");
    info!("Success!");
    Ok(())
}

/// Pick the output mode. Interactive previews also ask the camera for the
/// preview format.
fn open_sink(config: &InpaintingConfig, source: &mut VideoSource) -> Result<Box<dyn FrameSink>> {
    match config.output_video_path.clone() {
        Some(path) => {
            let fps = source.frame_rate();
            Ok(Box::new(RecordingSink::new(move |size| {
                VideoFileWriter::open(&path, fps, size)
            })))
        }
        None => {
            let window = HighguiWindow::open(WINDOW_NAME)?;
            source.request_format(PREVIEW_WIDTH, PREVIEW_HEIGHT, PREVIEW_FPS);
            Ok(Box::new(WindowSink::new(window)))
        }
    }
}

/// Process-wide stop flag set by Ctrl+C. The handler is installed once;
/// every run gets the same flag, cleared on entry.
fn install_ctrl_handler() -> Arc<AtomicBool> {
    static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let shutdown = SHUTDOWN.get_or_init(|| {
        let shutdown = Arc::new(AtomicBool::new(false));
        let handler_shutdown = shutdown.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
        shutdown
    });
    shutdown.store(false, Ordering::SeqCst);
    shutdown.clone()
}

/// Start the graph, run the loop, then release every resource regardless
/// of how the loop ended. Loop errors take precedence over shutdown errors.
pub(crate) fn drive(
    source: &mut dyn FrameSource,
    session: &mut GraphSession,
    sink: &mut dyn FrameSink,
    stop: &AtomicBool,
) -> Result<LoopExit> {
    let outcome = match session.start_run() {
        Ok(()) => run_loop(source, session, sink, stop),
        Err(err) => Err(err),
    };
    let closed = shutdown_all(source, session, sink);

    match (outcome, closed) {
        (Ok(exit), Ok(())) => Ok(exit),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(shutdown_err)) => {
            warn!("Shutdown also failed: {shutdown_err:#}");
            Err(err)
        }
    }
}

fn run_loop(
    source: &mut dyn FrameSource,
    session: &mut GraphSession,
    sink: &mut dyn FrameSink,
    stop: &AtomicBool,
) -> Result<LoopExit> {
    info!("Start grabbing and processing frames.");
    let kind = source.kind();
    let mut clock = FrameClock::start();
    let mut frame_index: u64 = 0;

    loop {
        if stop.load(Ordering::SeqCst) {
            info!("Interrupted after {frame_index} frame(s).");
            return Ok(LoopExit::Interrupted);
        }

        let Some(raw) = source.grab().context("grabbing frame")? else {
            match kind {
                SourceKind::Camera => {
                    debug!("Ignore empty frames from camera.");
                    continue;
                }
                SourceKind::File => {
                    info!("Empty frame, end of video reached.");
                    return Ok(LoopExit::EndOfStream);
                }
            }
        };

        let frame_span = info_span!("frame", index = frame_index);
        let _frame_guard = frame_span.enter();

        let rgb = to_graph_frame(&raw, kind).context("preparing graph input")?;
        let input = mat_to_frame(&rgb)?;
        session.submit(input, clock.next())?;

        let Some(outputs) = session.next_outputs() else {
            info!("Output stream closed after {frame_index} frame(s).");
            return Ok(LoopExit::StreamClosed);
        };
        let composed = masks::compose(&outputs.to_mats()?)
            .with_context(|| format!("compositing frame {frame_index}"))?;

        frame_index += 1;
        if frame_index % HEARTBEAT_INTERVAL == 0 {
            debug!("Processed {frame_index} frame(s)");
        }

        match sink.consume(&composed)? {
            SinkControl::Continue => {}
            SinkControl::FrameLimit => return Ok(LoopExit::FrameLimit),
            SinkControl::KeyPressed => return Ok(LoopExit::KeyPressed),
        }
    }
}

/// Finalise the sink, release the capture, then drain the graph. Every
/// step runs even if an earlier one fails; the first error is returned.
fn shutdown_all(
    source: &mut dyn FrameSource,
    session: &mut GraphSession,
    sink: &mut dyn FrameSink,
) -> Result<()> {
    info!("Shutting down.");
    let results = [
        sink.finish(),
        source.release().context("releasing video source"),
        session.shutdown(),
    ];
    let mut first = None;
    for result in results {
        if let Err(err) = result {
            if first.is_none() {
                first = Some(err);
            } else {
                warn!("Additional shutdown failure: {err:#}");
            }
        }
    }
    first.map_or(Ok(()), Err)
}

//! The graph handle the frame loop talks to.

use anyhow::{Context, Result};
use graph_runtime::{
    CalculatorGraph, CalculatorGraphConfig, CalculatorRegistry, ImageFrame, OutputStreamPoller,
    Packet, Timestamp,
};
use tracing::{debug, info};

use crate::inpainting::{
    config::{
        INPUT_STREAM, OUTPUT_CORPUS_MASK, OUTPUT_FACE_MASK, OUTPUT_SELFIE_MASK, OUTPUT_VIDEO,
    },
    frames::frame_to_mat,
    masks::OutputMats,
};

/// One packet from each output stream, all for the same submitted frame.
pub struct GraphOutputs {
    pub video: Packet,
    pub corpus_mask: Packet,
    pub face_mask: Packet,
    pub selfie_mask: Packet,
}

impl GraphOutputs {
    /// Copy every payload out of its packet into an OpenCV matrix.
    pub fn to_mats(&self) -> Result<OutputMats> {
        Ok(OutputMats {
            video: packet_mat(&self.video, OUTPUT_VIDEO)?,
            corpus_mask: packet_mat(&self.corpus_mask, OUTPUT_CORPUS_MASK)?,
            face_mask: packet_mat(&self.face_mask, OUTPUT_FACE_MASK)?,
            selfie_mask: packet_mat(&self.selfie_mask, OUTPUT_SELFIE_MASK)?,
        })
    }
}

fn packet_mat(packet: &Packet, stream: &str) -> Result<opencv::core::Mat> {
    let frame = packet
        .get::<ImageFrame>()
        .with_context(|| format!("reading {stream} at {}", packet.timestamp()))?;
    frame_to_mat(frame).with_context(|| format!("converting {stream}"))
}

/// A started or startable graph with its four output pollers attached.
pub struct GraphSession {
    graph: CalculatorGraph,
    video: OutputStreamPoller,
    corpus_mask: OutputStreamPoller,
    face_mask: OutputStreamPoller,
    selfie_mask: OutputStreamPoller,
    started: bool,
    shut_down: bool,
}

impl GraphSession {
    /// Build the graph and attach pollers for the four named outputs.
    pub fn initialize(config: CalculatorGraphConfig, registry: &CalculatorRegistry) -> Result<Self> {
        info!("Initialize the calculator graph.");
        let mut graph = CalculatorGraph::new();
        graph
            .initialize(config, registry)
            .context("initialising calculator graph")?;

        let mut poller = |stream: &str| {
            graph
                .add_output_stream_poller(stream)
                .with_context(|| format!("attaching poller to {stream}"))
        };
        let video = poller(OUTPUT_VIDEO)?;
        let corpus_mask = poller(OUTPUT_CORPUS_MASK)?;
        let face_mask = poller(OUTPUT_FACE_MASK)?;
        let selfie_mask = poller(OUTPUT_SELFIE_MASK)?;

        Ok(Self {
            graph,
            video,
            corpus_mask,
            face_mask,
            selfie_mask,
            started: false,
            shut_down: false,
        })
    }

    pub fn start_run(&mut self) -> Result<()> {
        info!("Start running the calculator graph.");
        self.graph.start_run().context("starting calculator graph")?;
        self.started = true;
        Ok(())
    }

    /// Hand one RGB frame to the graph's input stream.
    pub fn submit(&mut self, frame: ImageFrame, timestamp: Timestamp) -> Result<()> {
        self.graph
            .add_packet_to_input_stream(INPUT_STREAM, Packet::adopt(frame, timestamp))
            .with_context(|| format!("submitting frame at {timestamp}"))
    }

    /// Block for one packet on each output, in order. `None` once any
    /// stream has closed; the remaining pollers are not read.
    pub fn next_outputs(&mut self) -> Option<GraphOutputs> {
        let video = self.video.next()?;
        let corpus_mask = self.corpus_mask.next()?;
        let face_mask = self.face_mask.next()?;
        let selfie_mask = self.selfie_mask.next()?;
        debug!("Received outputs for {}", video.timestamp());
        Some(GraphOutputs {
            video,
            corpus_mask,
            face_mask,
            selfie_mask,
        })
    }

    /// Close the input stream and wait for the graph to drain. Runs at most
    /// once; later calls are no-ops.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down || !self.started {
            return Ok(());
        }
        self.shut_down = true;
        self.graph
            .close_input_stream(INPUT_STREAM)
            .context("closing input stream")?;
        self.graph
            .wait_until_done()
            .context("waiting for calculator graph to finish")
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Calculators that stand in for the segmentation models in tests.

    use graph_runtime::{
        Calculator, CalculatorContext, CalculatorGraphConfig, CalculatorRegistry, GraphError,
        ImageFormat, ImageFrame, Packet,
    };

    pub const GRAPH: &str = r#"
        input_stream: "input_video"
        output_stream: "output_video"
        output_stream: "output_corpus_mask"
        output_stream: "output_face_mask"
        output_stream: "output_selfie_mask"

        node {
          calculator: "PassThroughCalculator"
          input_stream: "input_video"
          output_stream: "output_video"
        }
        node {
          calculator: "ConstantMaskCalculator"
          input_stream: "IMAGE:input_video"
          output_stream: "CORPUS:output_corpus_mask"
          output_stream: "FACE:output_face_mask"
          output_stream: "SELFIE:output_selfie_mask"
        }
    "#;

    /// Full-frame corpus, empty face outline, fully confident selfie.
    pub struct ConstantMaskCalculator;

    impl Calculator for ConstantMaskCalculator {
        fn process(&mut self, cc: &mut CalculatorContext<'_>) -> Result<(), GraphError> {
            let image = cc
                .tagged_input("IMAGE", 0)
                .ok_or_else(|| cc.fail("missing IMAGE"))?
                .get::<ImageFrame>()?;
            let (w, h) = image.dimensions();
            let ts = cc.timestamp();

            let mut corpus = ImageFrame::new(ImageFormat::Srgb, w, h)?;
            corpus.data_mut().fill(255);
            let face = ImageFrame::new(ImageFormat::Srgb, w, h)?;
            let selfie = ImageFrame::from_f32(w, h, &vec![1.0; (w * h) as usize])?;

            cc.set_tagged_output("CORPUS", 0, Packet::adopt(corpus, ts))?;
            cc.set_tagged_output("FACE", 0, Packet::adopt(face, ts))?;
            cc.set_tagged_output("SELFIE", 0, Packet::adopt(selfie, ts))
        }
    }

    pub fn registry() -> CalculatorRegistry {
        let mut registry = CalculatorRegistry::with_builtins();
        registry.register("ConstantMaskCalculator", |_| Ok(Box::new(ConstantMaskCalculator)));
        registry
    }

    pub fn config() -> CalculatorGraphConfig {
        GRAPH.parse().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use graph_runtime::ImageFormat;
    use opencv::{core::Vec3b, prelude::*};

    use super::{test_support::*, *};

    fn frame(w: u32, h: u32) -> ImageFrame {
        let mut frame = ImageFrame::new(ImageFormat::Srgb, w, h).unwrap();
        frame.data_mut().fill(7);
        frame
    }

    #[test]
    fn each_submission_yields_four_matching_outputs() {
        let mut session = GraphSession::initialize(config(), &registry()).unwrap();
        session.start_run().unwrap();

        for ts in 1..=3 {
            session.submit(frame(4, 2), Timestamp::from_micros(ts)).unwrap();
            let outputs = session.next_outputs().unwrap();
            assert_eq!(outputs.video.timestamp(), Timestamp::from_micros(ts));
            let mats = outputs.to_mats().unwrap();
            mats.ensure_same_size().unwrap();
            assert_eq!(*mats.video.at_2d::<Vec3b>(1, 3).unwrap(), Vec3b::from([7; 3]));
            assert_eq!(*mats.selfie_mask.at_2d::<f32>(0, 0).unwrap(), 1.0);
        }

        session.shutdown().unwrap();
        assert!(session.next_outputs().is_none());
        session.shutdown().unwrap();
    }

    #[test]
    fn missing_output_stream_fails_initialisation() {
        let config: CalculatorGraphConfig = r#"
            input_stream: "input_video"
            output_stream: "output_video"
            node { calculator: "PassThroughCalculator" input_stream: "input_video" output_stream: "output_video" }
        "#
        .parse()
        .unwrap();
        let err = GraphSession::initialize(config, &registry()).err().unwrap();
        assert!(format!("{err:#}").contains(OUTPUT_CORPUS_MASK), "{err:#}");
    }

    #[test]
    fn shutdown_before_start_is_a_no_op() {
        let mut session = GraphSession::initialize(config(), &registry()).unwrap();
        session.shutdown().unwrap();
    }
}

use graph_runtime::{
    Calculator, CalculatorContext, CalculatorGraph, CalculatorGraphConfig, CalculatorRegistry,
    GraphError, ImageFormat, ImageFrame, Packet, Timestamp,
};

const GRAPH: &str = r#"
input_stream: "input_video"
output_stream: "output_video"
output_stream: "output_mask"

node {
  calculator: "PassThroughCalculator"
  input_stream: "input_video"
  output_stream: "output_video"
}

node {
  calculator: "GrayMaskCalculator"
  input_stream: "IMAGE:input_video"
  output_stream: "MASK:output_mask"
}
"#;

/// Emits a single-channel mask with the input's geometry.
struct GrayMaskCalculator;

impl Calculator for GrayMaskCalculator {
    fn process(&mut self, cc: &mut CalculatorContext<'_>) -> Result<(), GraphError> {
        let frame = cc
            .tagged_input("IMAGE", 0)
            .ok_or_else(|| cc.fail("missing IMAGE"))?
            .get::<ImageFrame>()?;
        let mask = ImageFrame::new(ImageFormat::Gray8, frame.width(), frame.height())?;
        let packet = Packet::adopt(mask, cc.timestamp());
        cc.set_tagged_output("MASK", 0, packet)
    }
}

/// Fails on the second frame.
struct FlakyCalculator {
    seen: usize,
}

impl Calculator for FlakyCalculator {
    fn process(&mut self, cc: &mut CalculatorContext<'_>) -> Result<(), GraphError> {
        self.seen += 1;
        if self.seen == 2 {
            return Err(cc.fail("model crashed"));
        }
        let packet = cc.input(0).cloned().ok_or_else(|| cc.fail("no input"))?;
        cc.set_output(0, packet)
    }
}

fn registry() -> CalculatorRegistry {
    let mut registry = CalculatorRegistry::with_builtins();
    registry
        .register("GrayMaskCalculator", |_| Ok(Box::new(GrayMaskCalculator)))
        .register("FlakyCalculator", |_| Ok(Box::new(FlakyCalculator { seen: 0 })));
    registry
}

fn frame_packet(micros: i64) -> Packet {
    let frame = ImageFrame::new(ImageFormat::Srgb, 4, 3).unwrap();
    Packet::adopt(frame, Timestamp::from_micros(micros))
}

#[test]
fn one_submission_yields_one_packet_per_output() {
    let config: CalculatorGraphConfig = GRAPH.parse().unwrap();
    let mut graph = CalculatorGraph::new();
    graph.initialize(config, &registry()).unwrap();
    let mut video = graph.add_output_stream_poller("output_video").unwrap();
    let mut mask = graph.add_output_stream_poller("output_mask").unwrap();
    graph.start_run().unwrap();

    for ts in [10, 20, 30] {
        graph
            .add_packet_to_input_stream("input_video", frame_packet(ts))
            .unwrap();
        let v = video.next().unwrap();
        let m = mask.next().unwrap();
        assert_eq!(v.timestamp(), Timestamp::from_micros(ts));
        assert_eq!(m.timestamp(), v.timestamp());
        let v = v.get::<ImageFrame>().unwrap();
        let m = m.get::<ImageFrame>().unwrap();
        assert_eq!(v.dimensions(), m.dimensions());
        assert_eq!(m.format(), ImageFormat::Gray8);
    }

    graph.close_input_stream("input_video").unwrap();
    graph.wait_until_done().unwrap();
    assert!(video.next().is_none());
    assert!(mask.next().is_none());
}

#[test]
fn duplicate_and_stale_timestamps_are_rejected() {
    let mut graph = CalculatorGraph::new();
    graph.initialize(GRAPH.parse().unwrap(), &registry()).unwrap();
    graph.start_run().unwrap();

    graph
        .add_packet_to_input_stream("input_video", frame_packet(100))
        .unwrap();
    for stale in [100, 99] {
        let err = graph
            .add_packet_to_input_stream("input_video", frame_packet(stale))
            .unwrap_err();
        assert!(matches!(err, GraphError::TimestampOutOfOrder { .. }), "{err}");
    }
    graph
        .add_packet_to_input_stream("input_video", frame_packet(101))
        .unwrap();

    graph.close_all_input_streams();
    graph.wait_until_done().unwrap();
}

#[test]
fn submissions_after_close_fail() {
    let mut graph = CalculatorGraph::new();
    graph.initialize(GRAPH.parse().unwrap(), &registry()).unwrap();
    graph.start_run().unwrap();
    graph.close_input_stream("input_video").unwrap();

    let err = graph
        .add_packet_to_input_stream("input_video", frame_packet(1))
        .unwrap_err();
    assert!(matches!(err, GraphError::StreamClosed(_)));
    assert!(matches!(
        graph.add_packet_to_input_stream("other", frame_packet(1)),
        Err(GraphError::UnknownStream(_))
    ));
    graph.wait_until_done().unwrap();
}

#[test]
fn calculator_failure_closes_pollers_and_surfaces_on_wait() {
    let config: CalculatorGraphConfig = r#"
        input_stream: "in"
        output_stream: "out"
        node { name: "flaky" calculator: "FlakyCalculator" input_stream: "in" output_stream: "out" }
    "#
    .parse()
    .unwrap();
    let mut graph = CalculatorGraph::new();
    graph.initialize(config, &registry()).unwrap();
    let mut out = graph.add_output_stream_poller("out").unwrap();
    graph.start_run().unwrap();

    graph.add_packet_to_input_stream("in", frame_packet(1)).unwrap();
    assert!(out.next().is_some());
    graph.add_packet_to_input_stream("in", frame_packet(2)).unwrap();
    assert!(out.next().is_none());

    graph.close_input_stream("in").unwrap();
    let err = graph.wait_until_done().unwrap_err();
    assert!(err.to_string().contains("model crashed"), "{err}");
}

#[test]
fn unknown_calculators_fail_initialisation() {
    let config: CalculatorGraphConfig = r#"
        input_stream: "in"
        node { calculator: "SelfieSegmentationCpu" input_stream: "in" output_stream: "mask" }
    "#
    .parse()
    .unwrap();
    let mut graph = CalculatorGraph::new();
    let err = graph
        .initialize(config, &CalculatorRegistry::with_builtins())
        .unwrap_err();
    assert!(matches!(err, GraphError::UnknownCalculator(name) if name == "SelfieSegmentationCpu"));
}

#[test]
fn pollers_require_declared_outputs() {
    let mut graph = CalculatorGraph::new();
    graph.initialize(GRAPH.parse().unwrap(), &registry()).unwrap();
    assert!(matches!(
        graph.add_output_stream_poller("output_face_mask"),
        Err(GraphError::UnknownStream(_))
    ));
}

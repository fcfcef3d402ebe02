//! Graph lifecycle and the scheduler thread.
//!
//! A run looks like: `initialize` → `add_output_stream_poller`* →
//! `start_run` → `add_packet_to_input_stream`* → `close_input_stream` →
//! `wait_until_done`. Each submitted input packet is one tick: nodes execute
//! in topological order on the scheduler thread and the packets produced on
//! graph output streams are pushed to every poller of that stream.

use std::{
    collections::HashMap,
    io,
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender, unbounded};
use petgraph::{algo::toposort, graph::DiGraph};
use tracing::{debug, info, trace, warn};

use crate::{
    calculator::{Calculator, CalculatorContext, CalculatorRegistry},
    config::{CalculatorGraphConfig, NodeConfig},
    error::GraphError,
    packet::{Packet, Timestamp},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Uninitialized,
    Initialized,
    Running,
    Failed,
    Done,
}

impl RunState {
    fn label(self) -> &'static str {
        match self {
            RunState::Uninitialized => "uninitialized",
            RunState::Initialized => "initialized",
            RunState::Running => "running",
            RunState::Failed => "failed",
            RunState::Done => "done",
        }
    }
}

struct InputStream {
    name: String,
    last: Option<Timestamp>,
    closed: bool,
}

/// A node ready to execute, in scheduling order.
struct ScheduledNode {
    display: String,
    config: NodeConfig,
    calculator: Box<dyn Calculator>,
}

/// Blocking reader for one graph output stream.
pub struct OutputStreamPoller {
    stream: String,
    rx: Receiver<Packet>,
}

impl OutputStreamPoller {
    /// Wait for the next packet. `None` once the run has finished or failed
    /// and everything already produced has been drained.
    pub fn next(&mut self) -> Option<Packet> {
        match self.rx.recv() {
            Ok(packet) => Some(packet),
            Err(_) => {
                debug!("Output stream {:?} closed", self.stream);
                None
            }
        }
    }
}

/// In-process host for a text-configured calculator graph.
pub struct CalculatorGraph {
    state: RunState,
    inputs: Vec<InputStream>,
    output_streams: Vec<String>,
    nodes: Vec<ScheduledNode>,
    pollers: HashMap<String, Vec<Sender<Packet>>>,
    input_tx: Option<Sender<(usize, Packet)>>,
    scheduler: Option<JoinHandle<Result<(), GraphError>>>,
}

impl Default for CalculatorGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl CalculatorGraph {
    pub fn new() -> Self {
        Self {
            state: RunState::Uninitialized,
            inputs: Vec::new(),
            output_streams: Vec::new(),
            nodes: Vec::new(),
            pollers: HashMap::new(),
            input_tx: None,
            scheduler: None,
        }
    }

    /// Validate the topology and instantiate one calculator per node.
    pub fn initialize(
        &mut self,
        config: CalculatorGraphConfig,
        registry: &CalculatorRegistry,
    ) -> Result<(), GraphError> {
        self.expect_state(RunState::Uninitialized)?;

        let order = execution_order(&config)?;
        let mut slots: Vec<Option<NodeConfig>> = config.nodes.into_iter().map(Some).collect();
        let mut nodes = Vec::with_capacity(slots.len());
        for position in order {
            let Some(node) = slots[position].take() else {
                continue;
            };
            let calculator = registry.create(&node)?;
            nodes.push(ScheduledNode {
                display: node.display_name(position),
                config: node,
                calculator,
            });
        }

        info!(
            "Graph initialised: {} node(s), inputs {:?}, outputs {:?}",
            nodes.len(),
            config.input_streams,
            config.output_streams
        );

        self.inputs = config
            .input_streams
            .into_iter()
            .map(|name| InputStream {
                name,
                last: None,
                closed: false,
            })
            .collect();
        self.output_streams = config.output_streams;
        self.nodes = nodes;
        self.state = RunState::Initialized;
        Ok(())
    }

    /// Attach a poller to a declared output stream. Must precede `start_run`.
    pub fn add_output_stream_poller(
        &mut self,
        stream: &str,
    ) -> Result<OutputStreamPoller, GraphError> {
        self.expect_state(RunState::Initialized)?;
        if !self.output_streams.iter().any(|s| s == stream) {
            return Err(GraphError::UnknownStream(stream.to_string()));
        }
        let (tx, rx) = unbounded();
        self.pollers.entry(stream.to_string()).or_default().push(tx);
        Ok(OutputStreamPoller {
            stream: stream.to_string(),
            rx,
        })
    }

    /// Open every calculator and start the scheduler thread.
    pub fn start_run(&mut self) -> Result<(), GraphError> {
        self.expect_state(RunState::Initialized)?;

        for node in &mut self.nodes {
            node.calculator.open().map_err(|err| GraphError::Calculator {
                node: node.display.clone(),
                message: format!("open failed: {err}"),
            })?;
        }

        let (tx, rx) = unbounded();
        let scheduler = Scheduler {
            input_names: self.inputs.iter().map(|s| s.name.clone()).collect(),
            nodes: std::mem::take(&mut self.nodes),
            pollers: std::mem::take(&mut self.pollers),
        };
        let handle = spawn_thread("graph-scheduler", move || scheduler.run(rx))?;

        self.input_tx = Some(tx);
        self.scheduler = Some(handle);
        self.state = RunState::Running;
        info!("Graph run started");
        Ok(())
    }

    /// Submit one packet. Timestamps on a stream must strictly increase.
    pub fn add_packet_to_input_stream(
        &mut self,
        stream: &str,
        packet: Packet,
    ) -> Result<(), GraphError> {
        self.expect_state(RunState::Running)?;
        let index = self.input_index(stream)?;
        let input = &mut self.inputs[index];
        if input.closed {
            return Err(GraphError::StreamClosed(stream.to_string()));
        }
        let timestamp = packet.timestamp();
        if let Some(previous) = input.last {
            if timestamp <= previous {
                return Err(GraphError::TimestampOutOfOrder {
                    stream: stream.to_string(),
                    previous,
                    got: timestamp,
                });
            }
        }

        let sent = self
            .input_tx
            .as_ref()
            .is_some_and(|tx| tx.send((index, packet)).is_ok());
        if !sent {
            // The scheduler exited early; `wait_until_done` reports why.
            self.state = RunState::Failed;
            return Err(GraphError::InvalidState {
                expected: RunState::Running.label(),
                actual: RunState::Failed.label(),
            });
        }
        input.last = Some(timestamp);
        Ok(())
    }

    pub fn close_input_stream(&mut self, stream: &str) -> Result<(), GraphError> {
        let index = self.input_index(stream)?;
        self.inputs[index].closed = true;
        debug!("Input stream {stream:?} closed");
        self.release_input_if_drained();
        Ok(())
    }

    pub fn close_all_input_streams(&mut self) {
        for input in &mut self.inputs {
            input.closed = true;
        }
        self.release_input_if_drained();
    }

    /// Block until the scheduler drains and exits, then return the first
    /// error recorded by the run. Input streams must be closed first or this
    /// never returns.
    pub fn wait_until_done(&mut self) -> Result<(), GraphError> {
        let Some(handle) = self.scheduler.take() else {
            return Ok(());
        };
        let outcome = handle.join().map_err(|_| GraphError::SchedulerPanicked)?;
        self.state = if outcome.is_ok() {
            RunState::Done
        } else {
            RunState::Failed
        };
        info!("Graph run finished ({})", self.state.label());
        outcome
    }

    fn release_input_if_drained(&mut self) {
        if self.inputs.iter().all(|s| s.closed) {
            self.input_tx = None;
        }
    }

    fn input_index(&self, stream: &str) -> Result<usize, GraphError> {
        self.inputs
            .iter()
            .position(|s| s.name == stream)
            .ok_or_else(|| GraphError::UnknownStream(stream.to_string()))
    }

    fn expect_state(&self, expected: RunState) -> Result<(), GraphError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(GraphError::InvalidState {
                expected: expected.label(),
                actual: self.state.label(),
            })
        }
    }
}

impl Drop for CalculatorGraph {
    fn drop(&mut self) {
        self.input_tx = None;
        if let Some(handle) = self.scheduler.take() {
            if let Ok(Err(err)) = handle.join() {
                warn!("Graph dropped after failed run: {err}");
            }
        }
    }
}

/// Determine node execution order from producer/consumer edges, ignoring
/// back edges. Also validates that every consumed stream has exactly one
/// producer.
fn execution_order(config: &CalculatorGraphConfig) -> Result<Vec<usize>, GraphError> {
    enum Producer {
        GraphInput,
        Node(usize),
    }

    let mut producers: HashMap<&str, Producer> = HashMap::new();
    for name in &config.input_streams {
        if producers.insert(name, Producer::GraphInput).is_some() {
            return Err(GraphError::InvalidConfig(format!(
                "graph input {name:?} declared twice"
            )));
        }
    }
    for (position, node) in config.nodes.iter().enumerate() {
        for output in &node.output_streams {
            if producers
                .insert(&output.name, Producer::Node(position))
                .is_some()
            {
                return Err(GraphError::InvalidConfig(format!(
                    "stream {:?} has more than one producer",
                    output.name
                )));
            }
        }
    }

    let mut dag = DiGraph::<usize, ()>::with_capacity(config.nodes.len(), 0);
    let indices: Vec<_> = (0..config.nodes.len()).map(|i| dag.add_node(i)).collect();
    for (position, node) in config.nodes.iter().enumerate() {
        for (slot, input) in node.input_streams.iter().enumerate() {
            match producers.get(input.name.as_str()) {
                None => {
                    return Err(GraphError::InvalidConfig(format!(
                        "{} consumes stream {:?} which nothing produces",
                        node.display_name(position),
                        input.name
                    )));
                }
                Some(_) if node.back_edges.contains(&slot) => {}
                Some(Producer::GraphInput) => {}
                Some(Producer::Node(from)) => {
                    dag.add_edge(indices[*from], indices[position], ());
                }
            }
        }
    }
    for name in &config.output_streams {
        if !producers.contains_key(name.as_str()) {
            return Err(GraphError::InvalidConfig(format!(
                "graph output {name:?} is not produced by any node"
            )));
        }
    }

    toposort(&dag, None)
        .map(|sorted| sorted.into_iter().map(|ix| dag[ix]).collect())
        .map_err(|cycle| {
            let position = dag[cycle.node_id()];
            GraphError::InvalidConfig(format!(
                "cycle through {}; mark feedback inputs with back_edge",
                config.nodes[position].display_name(position)
            ))
        })
}

struct Scheduler {
    input_names: Vec<String>,
    nodes: Vec<ScheduledNode>,
    pollers: HashMap<String, Vec<Sender<Packet>>>,
}

impl Scheduler {
    fn run(mut self, rx: Receiver<(usize, Packet)>) -> Result<(), GraphError> {
        let mut outcome = Ok(());
        for (index, packet) in rx {
            if let Err(err) = self.tick(index, packet) {
                warn!("Graph run aborted: {err}");
                outcome = Err(err);
                break;
            }
        }

        // Pollers observe end-of-stream once their senders are gone.
        self.pollers.clear();

        for node in &mut self.nodes {
            if let Err(err) = node.calculator.close() {
                warn!("Closing {} failed: {err}", node.display);
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }
        outcome
    }

    fn tick(&mut self, input_index: usize, packet: Packet) -> Result<(), GraphError> {
        let timestamp = packet.timestamp();
        trace!(timestamp = timestamp.micros(), "graph tick");

        let mut values: HashMap<String, Packet> = HashMap::new();
        values.insert(self.input_names[input_index].clone(), packet);

        for node in &mut self.nodes {
            let inputs: Vec<Option<Packet>> = node
                .config
                .input_streams
                .iter()
                .enumerate()
                .map(|(slot, r)| {
                    if node.config.back_edges.contains(&slot) {
                        None
                    } else {
                        values.get(&r.name).cloned()
                    }
                })
                .collect();
            if inputs.iter().all(Option::is_none) {
                continue;
            }

            let mut cc = CalculatorContext::new(
                &node.display,
                timestamp,
                &node.config.input_streams,
                inputs,
                &node.config.output_streams,
            );
            node.calculator.process(&mut cc)?;
            for (output, produced) in node.config.output_streams.iter().zip(cc.into_outputs()) {
                if let Some(produced) = produced {
                    values.insert(output.name.clone(), produced);
                }
            }
        }

        for (stream, senders) in &self.pollers {
            if let Some(packet) = values.get(stream) {
                for tx in senders {
                    // A dropped poller only means nobody is listening.
                    let _ = tx.send(packet.clone());
                }
            }
        }
        Ok(())
    }
}

/// Spawn a thread that inherits the current tracing dispatcher.
fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(text: &str) -> CalculatorGraphConfig {
        text.parse().unwrap()
    }

    #[test]
    fn orders_nodes_by_dependency() {
        let cfg = config(
            r#"
            input_stream: "in"
            output_stream: "out"
            node { calculator: "PassThroughCalculator" input_stream: "mid" output_stream: "out" }
            node { calculator: "PassThroughCalculator" input_stream: "in" output_stream: "mid" }
            "#,
        );
        assert_eq!(execution_order(&cfg).unwrap(), vec![1, 0]);
    }

    #[test]
    fn rejects_cycles_without_back_edges() {
        let cfg = config(
            r#"
            input_stream: "in"
            node { calculator: "A" input_stream: "in" input_stream: "b" output_stream: "a" }
            node { calculator: "B" input_stream: "a" output_stream: "b" }
            "#,
        );
        let err = execution_order(&cfg).unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");
    }

    #[test]
    fn back_edges_break_cycles() {
        let cfg = config(
            r#"
            input_stream: "in"
            output_stream: "b"
            node {
              calculator: "A"
              input_stream: "in"
              input_stream: "LOOP:b"
              input_stream_info: { tag_index: "LOOP" back_edge: true }
              output_stream: "a"
            }
            node { calculator: "B" input_stream: "a" output_stream: "b" }
            "#,
        );
        assert_eq!(execution_order(&cfg).unwrap(), vec![0, 1]);
    }

    #[test]
    fn rejects_unproduced_streams() {
        let cfg = config(
            r#"
            input_stream: "in"
            output_stream: "missing"
            node { calculator: "A" input_stream: "in" output_stream: "a" }
            "#,
        );
        assert!(execution_order(&cfg).is_err());

        let cfg = config(r#"node { calculator: "A" input_stream: "nowhere" }"#);
        assert!(execution_order(&cfg).is_err());
    }

    #[test]
    fn rejects_duplicate_producers() {
        let cfg = config(
            r#"
            input_stream: "in"
            node { calculator: "A" input_stream: "in" output_stream: "x" }
            node { calculator: "B" input_stream: "in" output_stream: "x" }
            "#,
        );
        let err = execution_order(&cfg).unwrap_err();
        assert!(err.to_string().contains("more than one producer"));
    }

    #[test]
    fn lifecycle_order_is_enforced() {
        let mut graph = CalculatorGraph::new();
        assert!(matches!(
            graph.add_output_stream_poller("out"),
            Err(GraphError::InvalidState { .. })
        ));
        assert!(graph.start_run().is_err());
        assert!(graph.wait_until_done().is_ok());
    }
}

//! Node logic plug-in point.
//!
//! The host does not know what a node computes. Embedders register a factory
//! per calculator name; the graph instantiates one calculator per node.

use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    config::{NodeConfig, StreamRef},
    error::GraphError,
    packet::{Packet, Timestamp},
};

/// Per-invocation view of a node's streams.
pub struct CalculatorContext<'a> {
    node: &'a str,
    timestamp: Timestamp,
    input_refs: &'a [StreamRef],
    inputs: Vec<Option<Packet>>,
    output_refs: &'a [StreamRef],
    outputs: Vec<Option<Packet>>,
}

impl<'a> CalculatorContext<'a> {
    pub(crate) fn new(
        node: &'a str,
        timestamp: Timestamp,
        input_refs: &'a [StreamRef],
        inputs: Vec<Option<Packet>>,
        output_refs: &'a [StreamRef],
    ) -> Self {
        Self {
            node,
            timestamp,
            input_refs,
            inputs,
            output_refs,
            outputs: vec![None; output_refs.len()],
        }
    }

    pub fn node_name(&self) -> &str {
        self.node
    }

    /// Timestamp of the input set being processed.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Packet on input `index`, if one arrived at this timestamp.
    pub fn input(&self, index: usize) -> Option<&Packet> {
        self.inputs.get(index).and_then(Option::as_ref)
    }

    /// Packet on the input declared as `TAG` (index 0) or `TAG:index`.
    pub fn tagged_input(&self, tag: &str, index: usize) -> Option<&Packet> {
        position_of(self.input_refs, tag, index).and_then(|pos| self.input(pos))
    }

    /// Emit `packet` on output `index`.
    pub fn set_output(&mut self, index: usize, packet: Packet) -> Result<(), GraphError> {
        let slot = self.outputs.get_mut(index).ok_or_else(|| GraphError::Calculator {
            node: self.node.to_string(),
            message: format!("output index {index} out of range"),
        })?;
        *slot = Some(packet);
        Ok(())
    }

    pub fn set_tagged_output(
        &mut self,
        tag: &str,
        index: usize,
        packet: Packet,
    ) -> Result<(), GraphError> {
        let pos = position_of(self.output_refs, tag, index).ok_or_else(|| {
            GraphError::Calculator {
                node: self.node.to_string(),
                message: format!("no output tagged {tag}:{index}"),
            }
        })?;
        self.set_output(pos, packet)
    }

    /// Convenience for calculators that report their own failures.
    pub fn fail(&self, message: impl fmt::Display) -> GraphError {
        GraphError::Calculator {
            node: self.node.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn into_outputs(self) -> Vec<Option<Packet>> {
        self.outputs
    }
}

fn position_of(refs: &[StreamRef], tag: &str, index: usize) -> Option<usize> {
    refs.iter()
        .position(|r| r.tag.as_deref() == Some(tag) && r.index == index)
}

/// Node implementation. One instance per node; only the scheduler thread
/// touches it.
pub trait Calculator: Send {
    fn open(&mut self) -> Result<(), GraphError> {
        Ok(())
    }

    fn process(&mut self, cc: &mut CalculatorContext<'_>) -> Result<(), GraphError>;

    fn close(&mut self) -> Result<(), GraphError> {
        Ok(())
    }
}

type Factory = dyn Fn(&NodeConfig) -> Result<Box<dyn Calculator>, GraphError> + Send + Sync;

/// Calculator name to factory lookup.
#[derive(Clone, Default)]
pub struct CalculatorRegistry {
    factories: HashMap<String, Arc<Factory>>,
}

impl CalculatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the routing calculators shipped by the host.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("PassThroughCalculator", |_| Ok(Box::new(PassThroughCalculator)));
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&NodeConfig) -> Result<Box<dyn Calculator>, GraphError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub(crate) fn create(&self, node: &NodeConfig) -> Result<Box<dyn Calculator>, GraphError> {
        let factory = self
            .factories
            .get(&node.calculator)
            .ok_or_else(|| GraphError::UnknownCalculator(node.calculator.clone()))?;
        factory(node)
    }
}

impl fmt::Debug for CalculatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("CalculatorRegistry")
            .field("calculators", &names)
            .finish()
    }
}

/// Forwards input `i` to output `i` unchanged.
pub struct PassThroughCalculator;

impl Calculator for PassThroughCalculator {
    fn process(&mut self, cc: &mut CalculatorContext<'_>) -> Result<(), GraphError> {
        let forwarded: Vec<(usize, Packet)> = (0..cc.input_count().min(cc.output_count()))
            .filter_map(|i| cc.input(i).map(|p| (i, p.clone())))
            .collect();
        for (index, packet) in forwarded {
            cc.set_output(index, packet)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(specs: &[&str]) -> Vec<StreamRef> {
        specs.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn pass_through_forwards_present_inputs() {
        let inputs = refs(&["a", "b"]);
        let outputs = refs(&["c", "d"]);
        let ts = Timestamp::from_micros(5);
        let mut cc = CalculatorContext::new(
            "pass",
            ts,
            &inputs,
            vec![Some(Packet::adopt(1_u8, ts)), None],
            &outputs,
        );
        PassThroughCalculator.process(&mut cc).unwrap();
        let out = cc.into_outputs();
        assert_eq!(*out[0].as_ref().unwrap().get::<u8>().unwrap(), 1);
        assert!(out[1].is_none());
    }

    #[test]
    fn tagged_lookup_respects_index() {
        let inputs = refs(&["IMAGE:frame", "MASK:0:m0", "MASK:1:m1"]);
        let outputs = refs(&["OUT:x"]);
        let ts = Timestamp::from_micros(1);
        let mut cc = CalculatorContext::new(
            "node",
            ts,
            &inputs,
            vec![None, Some(Packet::adopt(0_u8, ts)), Some(Packet::adopt(1_u8, ts))],
            &outputs,
        );
        assert_eq!(*cc.tagged_input("MASK", 1).unwrap().get::<u8>().unwrap(), 1);
        assert!(cc.tagged_input("IMAGE", 0).is_none());
        assert!(cc.set_tagged_output("MISSING", 0, Packet::adopt((), ts)).is_err());
        cc.set_tagged_output("OUT", 0, Packet::adopt((), ts)).unwrap();
    }

    #[test]
    fn registry_rejects_unknown_calculators() {
        let registry = CalculatorRegistry::with_builtins();
        assert!(registry.contains("PassThroughCalculator"));
        let node = NodeConfig {
            name: None,
            calculator: "FaceMeshCalculator".into(),
            input_streams: Vec::new(),
            output_streams: Vec::new(),
            back_edges: Vec::new(),
            raw: Default::default(),
        };
        assert!(matches!(
            registry.create(&node),
            Err(GraphError::UnknownCalculator(name)) if name == "FaceMeshCalculator"
        ));
    }
}

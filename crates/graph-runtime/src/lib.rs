//! In-process host for text-configured frame processing graphs.
//!
//! The host loads a graph description, wires named streams between
//! registered calculators, and runs them on a scheduler thread. Callers feed
//! timestamped packets into input streams and read results back through
//! blocking [`OutputStreamPoller`]s.

pub mod calculator;
pub mod config;
pub mod error;
pub mod graph;
pub mod image_frame;
pub mod packet;

pub use calculator::{Calculator, CalculatorContext, CalculatorRegistry, PassThroughCalculator};
pub use config::{CalculatorGraphConfig, NodeConfig, StreamRef};
pub use error::GraphError;
pub use graph::{CalculatorGraph, OutputStreamPoller};
pub use image_frame::{ImageFormat, ImageFrame};
pub use packet::{Packet, Timestamp};

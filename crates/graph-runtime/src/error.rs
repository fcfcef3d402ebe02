use std::{io, path::PathBuf};

use thiserror::Error;

use crate::packet::Timestamp;

/// Errors surfaced while loading or running a calculator graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("failed to read graph config {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("graph config parse error on line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("invalid graph config: {0}")]
    InvalidConfig(String),
    #[error("calculator {0:?} is not registered")]
    UnknownCalculator(String),
    #[error("stream {0:?} is not declared by the graph")]
    UnknownStream(String),
    #[error("input stream {0:?} is already closed")]
    StreamClosed(String),
    #[error(
        "packet timestamp {got} on stream {stream:?} must be greater than the previous {previous}"
    )]
    TimestampOutOfOrder {
        stream: String,
        previous: Timestamp,
        got: Timestamp,
    },
    #[error("packet holds {actual}, requested {requested}")]
    PacketType {
        requested: &'static str,
        actual: &'static str,
    },
    #[error("invalid image frame: {0}")]
    ImageFrame(String),
    #[error("calculator {node:?} failed: {message}")]
    Calculator { node: String, message: String },
    #[error("graph is {actual}, operation requires {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("graph scheduler thread panicked")]
    SchedulerPanicked,
    #[error(transparent)]
    Spawn(#[from] io::Error),
}

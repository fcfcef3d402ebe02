//! Inpainting overlay driver: grab frames, run them through the calculator
//! graph, combine the returned masks and show or record the result.

pub mod clock;
pub mod config;
pub mod frames;
pub mod masks;
pub mod pipeline;
pub mod session;
pub mod sink;
mod telemetry;

pub use config::{InpaintingCliArgs, InpaintingConfig};
pub use pipeline::run;

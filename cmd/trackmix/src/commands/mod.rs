//! CLI commands module.

mod mix;
mod pipeline;
mod play;
mod util;

pub use mix::MixCommand;
pub use pipeline::PipelineCommand;
pub use play::PlayCommand;

pub(crate) use util::*;

pub mod config;
pub mod consume;
pub mod error;
pub mod fetch;
pub mod handoff;
pub mod normalize;
pub mod parser;
pub mod pipeline;
pub mod publish;
pub mod store;
pub mod vocab;

pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, PollSummary, RunSummary};

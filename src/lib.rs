//! Side-by-side LLM comparison for dataset metadata: N models stream
//! descriptions in parallel, a judge model scores them, token usage is
//! tracked per slot.

pub mod backend;
pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod judge;
pub mod models;
pub mod orchestrator;
pub mod output;
pub mod pricing;
pub mod prompts;
pub mod runner;
pub mod stream;
pub mod usage;

#[cfg(test)]
mod test_fixtures;

pub use error::{Error, Result};

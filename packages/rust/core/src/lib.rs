//! Query-answering pipeline for indexed documentation repositories.
//!
//! A query runs through five steps (relevance check, query analysis,
//! context validation, repository search, response generation) under the
//! [`orchestrator::Orchestrator`], which owns retries, failure
//! classification and routing between steps. [`ingest`] fills the index the
//! searcher reads from.

pub mod backends;
pub mod cache;
pub mod classifier;
pub mod compress;
pub mod git;
pub mod ingest;
pub mod orchestrator;
pub mod retry;
pub mod schema;
pub mod sink;
pub mod state;
pub mod steps;
pub mod tool;

#[cfg(test)]
mod testing;

pub use orchestrator::{
    Backends, CancellationFlag, Orchestrator, RunOutcome, RunRequest, RunStatus,
};

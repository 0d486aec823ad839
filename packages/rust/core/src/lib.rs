//! Crawl orchestration: wires the renderer, model, discovery, and
//! extraction components into the end-to-end pipeline.

mod pipeline;
mod report;

pub use pipeline::{Orchestrator, ProgressReporter, SilentProgress};
pub use report::DomainReport;

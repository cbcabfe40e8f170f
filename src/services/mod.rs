//! Processing services.
//!
//! [`EmailPipeline`] is the entry point; it orders emails within reply
//! threads and hands extracted candidates to the deduplication engine.

pub mod deduplication;
pub mod ordering;
mod pipeline;

pub use pipeline::EmailPipeline;

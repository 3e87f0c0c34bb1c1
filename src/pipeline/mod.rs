//! Producer/consumer ingest pipeline.
//!
//! One producer loads the input, validates rows and emits fixed-size batches
//! into a bounded queue; one consumer writes each batch to a [`BatchSink`]
//! before popping the next, so store writes follow production order.

pub mod batcher;
pub mod coordinator;

pub use batcher::Batcher;
pub use coordinator::{
    BatchSink, Pipeline, PipelineProgress, PipelineReport, PipelineSettings, QueueMessage,
};

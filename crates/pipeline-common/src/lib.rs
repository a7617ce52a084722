//! Common abstractions for the media processing chains.
//!
//! A recording session is a pull pipeline of stateful operators. Each
//! operator implements [`Processor`] over some item type (FLV data, HLS
//! segments) and is composed into a [`Pipeline`] that drives items from a
//! source iterator into a sink closure. Cancellation flows from the sink
//! back to the source through a shared [`CancellationToken`].

use thiserror::Error;

mod cancellation;
mod context;
mod pipeline;
mod processor;
mod template;

pub use cancellation::CancellationToken;
pub use context::{StreamerContext, test_context};
pub use pipeline::Pipeline;
pub use processor::Processor;
pub use template::{PathTemplateError, expand_path_template, sanitize_filename};

/// Common error type for pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("{0}")]
    Source(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl PipelineError {
    /// Wrap an arbitrary upstream error.
    pub fn source(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        PipelineError::Source(Box::new(err))
    }

    /// True when the error signals cooperative shutdown rather than failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

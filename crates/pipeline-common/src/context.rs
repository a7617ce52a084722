use std::sync::Arc;

use crate::cancellation::CancellationToken;

/// Shared context for one processing pipeline: a display name used in log
/// lines and the cancellation token observed by every stage.
#[derive(Debug, Clone)]
pub struct StreamerContext {
    pub name: String,
    pub token: CancellationToken,
}

impl StreamerContext {
    pub fn new(name: impl Into<String>, token: CancellationToken) -> Self {
        Self {
            name: name.into(),
            token,
        }
    }

    pub fn arc_new(name: impl Into<String>, token: CancellationToken) -> Arc<Self> {
        Arc::new(Self::new(name, token))
    }
}

/// A throwaway context for unit tests.
pub fn test_context() -> Arc<StreamerContext> {
    StreamerContext::arc_new("test", CancellationToken::new())
}

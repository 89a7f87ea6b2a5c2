use std::sync::Arc;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly (e.g. `println!`) is not acceptable for
/// production. Instead, callers can provide an implementation that forwards these events to
/// `tracing`, `log`, metrics, or custom sinks.
pub trait EventListener: std::fmt::Debug {
    fn on_event(&self, event: DbEvent);
}

/// Structured events emitted by the engine.
#[derive(Debug, Clone)]
pub enum DbEvent {
    /// Points were serialized and appended to the backend.
    PointsAppended { count: usize },

    /// The index stopped reflecting storage and reads will fall back to scans
    /// until the next rebuild.
    IndexInvalidated { reason: InvalidationReason },

    /// The index was rebuilt from a full storage scan.
    IndexRebuilt { rows: usize },

    /// The backend was atomically replaced by a staged rewrite.
    StorageRewritten { rows: usize },
}

/// Why the index was invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    /// An insert carried a timestamp earlier than the maximum seen so far.
    OutOfOrderInsert,
    /// A bulk update or remove rewrote the backend.
    BulkRewrite,
}

#[derive(Debug)]
pub struct NoopEventListener;

impl EventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: DbEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn EventListener> {
    Arc::new(NoopEventListener)
}

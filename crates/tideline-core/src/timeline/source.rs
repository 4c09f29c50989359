//! Network-backed history, consumed through a trait.

use async_trait::async_trait;

use crate::event::Event;
use crate::timeline::segment::Direction;

/// One page of history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationChunk {
    /// Events in traversal order: newest first when paging backward.
    pub events: Vec<Event>,
    /// Token to continue from. `None` means that edge is exhausted.
    pub end: Option<String>,
}

/// History surrounding one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub event: Event,
    /// Older events, nearest first.
    pub events_before: Vec<Event>,
    /// Newer events, nearest first.
    pub events_after: Vec<Event>,
    /// Token for paging backward from the oldest returned event.
    pub start: Option<String>,
    /// Token for paging forward from the newest returned event.
    pub end: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("event '{event_id}' not found")]
    NotFound { event_id: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Where windows fetch history they do not hold locally.
#[async_trait]
pub trait TimelineSource: Send + Sync {
    /// Fetch up to `limit` events from `token` in `direction`.
    async fn fetch_timeline(
        &self,
        room_id: &str,
        token: &str,
        direction: Direction,
        limit: usize,
    ) -> Result<PaginationChunk, SourceError>;

    /// Fetch an event together with up to `limit` events around it.
    async fn fetch_event_context(
        &self,
        room_id: &str,
        event_id: &str,
        limit: usize,
    ) -> Result<EventContext, SourceError>;
}

//! Segmented room history and windows over it.
//!
//! A room's known history is a set of [`TimelineSegment`]s held in a
//! [`RoomTimeline`] arena. Each segment is a contiguous run; gaps between
//! runs are bridged by pagination tokens until a fetch finds the runs meet,
//! at which point they are linked. Exactly one segment is live and receives
//! events from sync.
//!
//! [`TimelineCursor`] walks across linked segments and
//! [`TimelineWindow`] keeps a bounded view that grows by local steps first
//! and by fetching from a [`TimelineSource`] second.

pub mod arena;
pub mod cursor;
pub mod segment;
pub mod source;
pub mod window;

pub use arena::{RoomTimeline, SegmentError, TimelineUpdate};
pub use cursor::TimelineCursor;
pub use segment::{Direction, Edge, SegmentId, TimelineSegment};
pub use source::{EventContext, PaginationChunk, SourceError, TimelineSource};
pub use window::{PaginateOptions, TimelineWindow, WindowError};

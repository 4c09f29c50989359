//! Well-known event type strings.
//!
//! Event types are open-ended strings on the wire; these are the ones the
//! engine interprets.

pub const ENCRYPTED: &str = "m.room.encrypted";
pub const REDACTION: &str = "m.room.redaction";
pub const MESSAGE: &str = "m.room.message";
pub const REACTION: &str = "m.reaction";
pub const TYPING: &str = "m.typing";
pub const RECEIPT: &str = "m.receipt";
pub const FULLY_READ: &str = "m.fully_read";

/// Thread id used by receipts addressed to the main timeline.
pub const MAIN_THREAD: &str = "main";

/// `msgtype` of the placeholder content shown for undecryptable events.
pub const BAD_ENCRYPTED_MSGTYPE: &str = "m.bad.encrypted";

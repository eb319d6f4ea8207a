//! Realtime (WebSocket) channel and its wire protocol.

pub mod channel;
pub mod protocol;

pub use channel::{ConnectionState, RealtimeChannel};
pub use protocol::{ClientEvent, DeadLetter, RagMode, ResponseContent, ServerEvent};

/// Outbound side of the realtime channel as seen by chat and documents.
pub trait EventSink: Send + Sync {
    fn is_open(&self) -> bool;

    /// Fire-and-forget. Returns false when the event was dropped (channel not open).
    fn send(&self, event: ClientEvent) -> bool;

    /// Identifies the current socket; changes every time the channel (re)opens.
    /// Replies to frames sent on an earlier socket never arrive.
    fn connection(&self) -> u64;
}

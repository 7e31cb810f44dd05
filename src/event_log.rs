//! Room event broadcasting
//!
//! The auction runtime only ever writes here, fire-and-forget: a sink
//! failing to deliver must never undo auction state.
mod in_memory;

pub use self::in_memory::*;

use crate::auction::{RoomId, RoomIdRef};
use crate::event::Event;
use serde::Serialize;
use std::sync::Arc;

pub type Offset = u64;

pub trait BroadcastSink {
    fn publish(&self, room_id: RoomIdRef, event: Event);
}

pub type SharedBroadcastSink = Arc<dyn BroadcastSink + Send + Sync + 'static>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub offset: Offset,
    pub room_id: RoomId,
    pub event: Event,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WithOffset<T> {
    /// Where the next read should continue from
    pub offset: Offset,
    pub data: T,
}

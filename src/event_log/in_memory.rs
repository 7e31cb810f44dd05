use super::*;
use anyhow::Result;
use parking_lot::RwLock;
#[cfg(test)]
use parking_lot::RwLockReadGuard;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Events kept by default; a few minutes of ticks for a busy server
pub const DEFAULT_CAPACITY: usize = 10_000;

/// The retained tail of the log
#[derive(Debug, Default)]
pub struct InMemoryLogInner {
    /// Offset of `events[0]`
    base: Offset,
    events: VecDeque<LogEvent>,
}

impl InMemoryLogInner {
    /// Offset the next published event will get
    pub fn end(&self) -> Offset {
        self.base + self.events.len() as Offset
    }

    /// Oldest offset still readable
    #[cfg(test)]
    pub fn base(&self) -> Offset {
        self.base
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &LogEvent> {
        self.events.iter()
    }
}

/// Event log kept in process memory
///
/// Every published event gets a global offset; readers follow a
/// single room by filtering on it. Only the last `capacity` events are
/// kept: a reader behind that continues from the oldest retained one.
pub struct InMemoryEventLog {
    inner: RwLock<InMemoryLogInner>,
    capacity: usize,
    // end offset of `inner`, to wake up long-polling readers
    end: watch::Sender<Offset>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(InMemoryLogInner::default()),
            capacity: capacity.max(1),
            end: watch::channel(0).0,
        }
    }

    #[cfg(test)]
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    #[cfg(test)]
    pub fn read(&self) -> RwLockReadGuard<'_, InMemoryLogInner> {
        self.inner.read()
    }

    /// Retained events of `room_id`
    #[cfg(test)]
    pub fn room_events(&self, room_id: RoomIdRef) -> Vec<Event> {
        self.read()
            .iter()
            .filter(|e| e.room_id == room_id)
            .map(|e| e.event.clone())
            .collect()
    }

    /// Read up to `limit` events of `room_id` starting at `offset`
    ///
    /// If nothing was published at or after `offset` yet, waits for a
    /// new event (at most `timeout`, if given) first. An `offset` that
    /// was already dropped reads from the oldest retained event.
    pub async fn read_room(
        &self,
        room_id: RoomIdRef<'_>,
        offset: Offset,
        limit: usize,
        timeout: Option<Duration>,
    ) -> Result<WithOffset<Vec<LogEvent>>> {
        if limit == 0 {
            return Ok(WithOffset {
                offset,
                data: vec![],
            });
        }

        let mut changes = self.end.subscribe();
        if *changes.borrow() <= offset {
            let changed = changes.changed();
            match timeout {
                Some(timeout) => {
                    let _ = tokio::time::timeout(timeout, changed).await;
                }
                None => {
                    let _ = changed.await;
                }
            }
        }

        let read = self.inner.read();
        let mut next = offset.clamp(read.base, read.end());
        let mut data = vec![];
        for event in read.events.iter().skip(usize::try_from(next - read.base)?) {
            next += 1;
            if event.room_id == room_id {
                data.push(event.clone());
                if data.len() == limit {
                    break;
                }
            }
        }

        Ok(WithOffset { offset: next, data })
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastSink for InMemoryEventLog {
    fn publish(&self, room_id: RoomIdRef, event: Event) {
        debug!(%room_id, kind = event.kind(), ?event, "event");
        let end = {
            let mut write = self.inner.write();
            let offset = write.end();
            write.events.push_back(LogEvent {
                offset,
                room_id: room_id.to_owned(),
                event,
            });
            while write.events.len() > self.capacity {
                write.events.pop_front();
                write.base += 1;
            }
            write.end()
        };
        self.end.send_replace(end);
    }
}

//! Per-room countdown
//!
//! Every live room has at most one schedule: a task emitting countdown
//! ticks and firing the room's close once its deadline passes. Starting
//! a new schedule aborts the previous one before anything else happens.
use crate::auction::{ItemId, ItemIdRef, RoomId, RoomIdRef, UserId, UserIdRef};
use crate::event::Event;
use crate::event_log::SharedBroadcastSink;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimerSettings {
    /// Full countdown, granted to every bid outside the anti-snipe window
    pub bid_window: Duration,
    /// A bid landing with this much time (or less) left only extends the clock
    pub anti_snipe_threshold: Duration,
    pub anti_snipe_extension: Duration,
    pub tick_interval: Duration,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            bid_window: Duration::from_secs(10),
            anti_snipe_threshold: Duration::from_secs(3),
            anti_snipe_extension: Duration::from_secs(5),
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl TimerSettings {
    /// Deadline for a schedule starting `now`, given the current one (if any)
    pub fn next_deadline(&self, now: Instant, current: Option<Instant>) -> Instant {
        let remaining = current.map(|deadline| deadline.saturating_duration_since(now));
        match remaining {
            Some(remaining) if !remaining.is_zero() && remaining <= self.anti_snipe_threshold => {
                now + self.anti_snipe_extension
            }
            _ => now + self.bid_window,
        }
    }
}

/// What to do when a room's countdown runs out
#[async_trait]
pub trait DeadlineHandler: Send + Sync {
    /// Close `item_id`, on behalf of the room's host
    async fn on_deadline(&self, room_id: RoomId, host_id: UserId, item_id: ItemId) -> Result<()>;
}

pub type WeakDeadlineHandler = Weak<dyn DeadlineHandler + 'static>;

struct Schedule {
    generation: u64,
    deadline: Instant,
    task: tokio::task::JoinHandle<()>,
}

struct TimerShared {
    settings: TimerSettings,
    broadcast: SharedBroadcastSink,
    handler: WeakDeadlineHandler,
    schedules: Mutex<HashMap<RoomId, Schedule>>,
    next_generation: AtomicU64,
}

impl TimerShared {
    /// Take the schedule out of the map if it is still the current one
    ///
    /// A schedule that claimed itself can't be aborted anymore, so the
    /// close it is about to run is never cut in half.
    fn claim(&self, room_id: RoomIdRef, generation: u64) -> bool {
        let mut schedules = self.schedules.lock();
        match schedules.get(room_id) {
            Some(schedule) if schedule.generation == generation => {
                schedules.remove(room_id);
                true
            }
            _ => false,
        }
    }

    async fn run(
        self: Arc<Self>,
        room_id: RoomId,
        host_id: UserId,
        item_id: ItemId,
        deadline: Instant,
        generation: u64,
    ) {
        let tick_interval = self.settings.tick_interval;
        let mut ticks = tokio::time::interval_at(Instant::now() + tick_interval, tick_interval);
        loop {
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => break,
                _ = ticks.tick() => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    self.broadcast.publish(
                        &room_id,
                        Event::CountdownTick {
                            item_id: item_id.clone(),
                            remaining_secs: whole_secs_up(remaining),
                        },
                    );
                }
            }
        }

        if !self.claim(&room_id, generation) {
            return;
        }
        let Some(handler) = self.handler.upgrade() else {
            debug!(%room_id, "deadline handler gone");
            return;
        };

        info!(%room_id, %item_id, "deadline reached, closing item");
        match handler
            .on_deadline(room_id.clone(), host_id, item_id.clone())
            .await
        {
            Ok(()) => debug!(%room_id, %item_id, "auto-close done"),
            // not retried: the room waits for a manual close
            Err(e) => error!(%room_id, %item_id, error = %e, "auto-close failed"),
        }
    }
}

fn whole_secs_up(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Owns the countdown of every live room
pub struct TimerEngine {
    shared: Arc<TimerShared>,
}

impl TimerEngine {
    pub fn new(
        settings: TimerSettings,
        broadcast: SharedBroadcastSink,
        handler: WeakDeadlineHandler,
    ) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                settings,
                broadcast,
                handler,
                schedules: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// (Re)start the countdown of `room_id` for `item_id`
    ///
    /// Returns the new deadline. Must be called from within a tokio runtime.
    pub fn start(&self, room_id: RoomIdRef, host_id: UserIdRef, item_id: ItemIdRef) -> Instant {
        let now = Instant::now();
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);

        let mut schedules = self.shared.schedules.lock();
        let previous = schedules.remove(room_id);
        if let Some(previous) = &previous {
            previous.task.abort();
        }
        let deadline = self
            .shared
            .settings
            .next_deadline(now, previous.map(|s| s.deadline));

        let task = tokio::spawn(self.shared.clone().run(
            room_id.to_owned(),
            host_id.to_owned(),
            item_id.to_owned(),
            deadline,
            generation,
        ));
        schedules.insert(
            room_id.to_owned(),
            Schedule {
                generation,
                deadline,
                task,
            },
        );
        debug!(%room_id, %item_id, in_ms = (deadline - now).as_millis() as u64, "countdown started");
        deadline
    }

    /// Stop the countdown of `room_id`, forgetting its deadline
    pub fn cancel(&self, room_id: RoomIdRef) {
        if let Some(schedule) = self.shared.schedules.lock().remove(room_id) {
            schedule.task.abort();
            debug!(%room_id, "countdown cancelled");
        }
    }

    pub fn deadline(&self, room_id: RoomIdRef) -> Option<Instant> {
        self.shared.schedules.lock().get(room_id).map(|s| s.deadline)
    }

    #[cfg(test)]
    pub fn scheduled_rooms(&self) -> usize {
        self.shared.schedules.lock().len()
    }

    /// Abort every countdown
    pub fn shutdown(&self) {
        for (_, schedule) in self.shared.schedules.lock().drain() {
            schedule.task.abort();
        }
    }
}

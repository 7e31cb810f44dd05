//! Auction runtime
//!
//! Validates and commits bids, runs each room's countdown and moves rooms
//! from item to item. Every operation on a room runs under that room's
//! lock, so bids and closes of one room never interleave, while different
//! rooms proceed independently.
mod close;
mod recovery;
mod state;

pub use self::close::CloseOutcome;
pub use self::state::*;

use crate::auction::validator::{self, Rejection};
use crate::auction::*;
use crate::event::Event;
use crate::event_log::SharedBroadcastSink;
use crate::persistence::{
    ItemUpdate, OwnedTransaction, RoomUpdate, SharedPersistence, Transaction,
};
use crate::service::timer::{DeadlineHandler, TimerEngine, TimerSettings, WeakDeadlineHandler};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum AuctionError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    /// The winner can't pay anymore; the item stays up
    #[error("winning bidder {bidder} can't cover {price} (budget {budget})")]
    BudgetConflict {
        bidder: BidderId,
        price: Amount,
        budget: Amount,
    },
    #[error("internal consistency failure: {0}")]
    Inconsistent(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl AuctionError {
    #[cfg(test)]
    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            AuctionError::Rejected(rejection) => Some(*rejection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BidAccepted {
    pub bid_id: u64,
    pub highest_bid: Amount,
    pub highest_bidder: BidderId,
    pub deadline_in_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuctionStarted {
    pub item_id: ItemId,
    pub deadline_in_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuctionSnapshot {
    pub room_id: RoomId,
    pub item_id: ItemId,
    pub standing: Standing,
    pub remaining_ms: Option<u64>,
}

fn millis_until(deadline: Instant) -> u64 {
    deadline.saturating_duration_since(Instant::now()).as_millis() as u64
}

/// Commit `res`'s transaction if it succeeded, roll it back otherwise
async fn finish<R>(tx: OwnedTransaction, res: Result<R, AuctionError>) -> Result<R, AuctionError> {
    match res {
        Ok(r) => {
            tx.commit().await?;
            Ok(r)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            Err(e)
        }
    }
}

pub struct AuctionRuntimeShared {
    persistence: SharedPersistence,
    broadcast: SharedBroadcastSink,
    registry: RoomRegistry,
    timer: TimerEngine,
}

impl AuctionRuntimeShared {
    async fn place_bid(
        &self,
        user_id: UserIdRef<'_>,
        room_id: RoomIdRef<'_>,
        amount: Amount,
    ) -> Result<BidAccepted, AuctionError> {
        let room = self
            .persistence
            .load_room(room_id)
            .await?
            .ok_or(Rejection::RoomNotFound)?;
        let item = match room.current_item.as_deref() {
            Some(item_id) => self.persistence.load_item(item_id).await?,
            None => None,
        };
        let bidder = self
            .persistence
            .load_bidder_in_room(room_id, user_id)
            .await?;
        let (item, bidder) = validator::check_bid(&room, item.as_ref(), bidder.as_ref(), amount)?;

        let state = self.registry.get(room_id).ok_or_else(|| {
            AuctionError::Inconsistent(format!("no auction state for live room {room_id}"))
        })?;
        let mut state = state.lock().await;
        // the snapshots above may be stale by now
        state.evaluate_bid(item, &bidder.id, amount)?;

        let mut tx = self.persistence.start_transaction().await?;
        let res = Self::record_bid(
            &mut *tx,
            NewBid {
                room_id: room_id.to_owned(),
                item_id: item.id.clone(),
                bidder_id: bidder.id.clone(),
                amount,
                placed_at: Utc::now(),
            },
        )
        .await;
        let record = finish(tx, res).await?;

        state.accept_bid(bidder.id.clone(), amount);
        let deadline = self.timer.start(room_id, state.host(), &item.id);
        drop(state);

        debug!(%room_id, item_id = %item.id, bidder_id = %bidder.id, amount, "bid accepted");
        let deadline_in_ms = millis_until(deadline);
        self.broadcast.publish(
            room_id,
            Event::BidAccepted {
                item_id: item.id.clone(),
                bidder_id: bidder.id.clone(),
                amount,
                deadline_in_ms,
            },
        );

        Ok(BidAccepted {
            bid_id: record.id,
            highest_bid: amount,
            highest_bidder: bidder.id.clone(),
            deadline_in_ms,
        })
    }

    /// Append the bid and mirror it on the room, for recovery
    async fn record_bid(tx: &mut dyn Transaction, bid: NewBid) -> Result<BidRecord, AuctionError> {
        let room_id = bid.room_id.clone();
        let standing = Standing::Leading {
            amount: bid.amount,
            bidder: bid.bidder_id.clone(),
        };
        let record = tx.insert_bid(bid).await?;
        tx.update_room(&room_id, RoomUpdate::standing(standing))
            .await?;
        Ok(record)
    }

    async fn start_auction(
        &self,
        user_id: UserIdRef<'_>,
        room_id: RoomIdRef<'_>,
    ) -> Result<AuctionStarted, AuctionError> {
        let room = self
            .persistence
            .load_room(room_id)
            .await?
            .ok_or(Rejection::RoomNotFound)?;
        validator::ensure_host(&room, user_id)?;
        if room.status != RoomStatus::Waiting {
            return Err(Rejection::AlreadyStarted.into());
        }

        // registered and locked before the room turns LIVE, so requests
        // right after the commit wait for it; the item is set once known
        let (entry, mut state) = self
            .registry
            .reserve(
                room_id,
                RoomAuctionState::new(ItemId::new(), room.host_id.clone(), Standing::Open),
            )
            .await
            .ok_or(Rejection::AlreadyStarted)?;

        let activated: Result<Item, AuctionError> = async {
            let mut tx = self.persistence.start_transaction().await?;
            let res = Self::activate_first_item(&mut *tx, room_id).await;
            finish(tx, res).await
        }
        .await;
        let item = match activated {
            Ok(item) => item,
            Err(e) => {
                state.close();
                self.registry.remove_if_same(room_id, &entry);
                return Err(e);
            }
        };

        state.advance(item.id.clone());
        self.timer.cancel(room_id);
        let deadline = self.timer.start(room_id, state.host(), state.item());
        drop(state);

        info!(%room_id, item_id = %item.id, "auction started");
        let deadline_in_ms = millis_until(deadline);
        self.broadcast.publish(
            room_id,
            Event::AuctionStarted {
                item_id: item.id.clone(),
                deadline_in_ms,
            },
        );
        Ok(AuctionStarted {
            item_id: item.id,
            deadline_in_ms,
        })
    }

    async fn activate_first_item(
        tx: &mut dyn Transaction,
        room_id: RoomIdRef<'_>,
    ) -> Result<Item, AuctionError> {
        // checked again, under the transaction, against a concurrent start
        let room = tx.load_room(room_id).await?.ok_or(Rejection::RoomNotFound)?;
        if room.status != RoomStatus::Waiting {
            return Err(Rejection::AlreadyStarted.into());
        }
        let mut item = tx
            .next_upcoming_item(room_id)
            .await?
            .ok_or(Rejection::NoItems)?;
        tx.update_item(&item.id, ItemUpdate::status(ItemStatus::Active))
            .await?;
        tx.update_room(room_id, RoomUpdate::activate(&item.id))
            .await?;
        item.status = ItemStatus::Active;
        Ok(item)
    }

    async fn snapshot(&self, room_id: RoomIdRef<'_>) -> Option<AuctionSnapshot> {
        let state = self.registry.get(room_id)?;
        let state = state.lock().await;
        if state.is_closed() {
            return None;
        }
        Some(AuctionSnapshot {
            room_id: room_id.to_owned(),
            item_id: state.item().to_owned(),
            standing: state.standing().clone(),
            remaining_ms: self.timer.deadline(room_id).map(millis_until),
        })
    }
}

#[async_trait]
impl DeadlineHandler for AuctionRuntimeShared {
    async fn on_deadline(&self, room_id: RoomId, host_id: UserId, item_id: ItemId) -> Result<()> {
        let outcome = self.close_item(&host_id, &room_id, Some(&item_id)).await?;
        debug!(%room_id, ?outcome, "closed on deadline");
        Ok(())
    }
}

/// Handle to the auction runtime; cheap to clone
#[derive(Clone)]
pub struct AuctionRuntime {
    shared: Arc<AuctionRuntimeShared>,
}

impl AuctionRuntime {
    pub fn new(
        persistence: SharedPersistence,
        broadcast: SharedBroadcastSink,
        settings: TimerSettings,
    ) -> Self {
        let shared = Arc::new_cyclic(|me: &Weak<AuctionRuntimeShared>| {
            let handler: WeakDeadlineHandler = me.clone();
            AuctionRuntimeShared {
                timer: TimerEngine::new(settings, broadcast.clone(), handler),
                persistence,
                broadcast,
                registry: RoomRegistry::default(),
            }
        });
        Self { shared }
    }

    pub async fn place_bid(
        &self,
        user_id: UserIdRef<'_>,
        room_id: RoomIdRef<'_>,
        amount: Amount,
    ) -> Result<BidAccepted, AuctionError> {
        self.shared.place_bid(user_id, room_id, amount).await
    }

    /// Open the room's first item for bidding; host only
    pub async fn start_auction(
        &self,
        user_id: UserIdRef<'_>,
        room_id: RoomIdRef<'_>,
    ) -> Result<AuctionStarted, AuctionError> {
        self.shared.start_auction(user_id, room_id).await
    }

    /// Sell (or pass on) the current item and move on; host only
    pub async fn close_current_item(
        &self,
        user_id: UserIdRef<'_>,
        room_id: RoomIdRef<'_>,
    ) -> Result<CloseOutcome, AuctionError> {
        self.shared.close_item(user_id, room_id, None).await
    }

    /// Resume the auctions of all `LIVE` rooms; returns how many resumed
    pub async fn recover_live_rooms(&self) -> Result<usize> {
        self.shared.recover_live_rooms().await
    }

    pub async fn snapshot(&self, room_id: RoomIdRef<'_>) -> Option<AuctionSnapshot> {
        self.shared.snapshot(room_id).await
    }

    #[cfg(test)]
    pub fn is_live(&self, room_id: RoomIdRef) -> bool {
        self.shared.registry.contains(room_id)
    }

    #[cfg(test)]
    pub fn live_rooms(&self) -> usize {
        self.shared.registry.len()
    }

    #[cfg(test)]
    pub fn deadline(&self, room_id: RoomIdRef) -> Option<Instant> {
        self.shared.timer.deadline(room_id)
    }

    /// Stop all countdowns; rooms stay `LIVE` in the store for recovery
    pub fn shutdown(&self) {
        self.shared.timer.shutdown();
    }
}

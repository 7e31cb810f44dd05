use crate::auction::validator::{self, Rejection};
use crate::auction::*;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// The live auction of one room
///
/// Exists only while the room is `LIVE` with an `ACTIVE` item. The
/// countdown belongs to the timer engine, not to this record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomAuctionState {
    item: ItemId,
    host: UserId,
    standing: Standing,
    /// Set when the room completes; anyone still holding this record
    /// must treat it as gone
    closed: bool,
}

impl RoomAuctionState {
    pub fn new(item: ItemId, host: UserId, standing: Standing) -> Self {
        Self {
            item,
            host,
            standing,
            closed: false,
        }
    }

    pub fn item(&self) -> ItemIdRef<'_> {
        &self.item
    }

    pub fn host(&self) -> UserIdRef<'_> {
        &self.host
    }

    pub fn standing(&self) -> &Standing {
        &self.standing
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Last check of a bid, against the latest state, right before commit
    pub fn evaluate_bid(&self, item: &Item, bidder: BidderIdRef, amount: Amount) -> Result<(), Rejection> {
        if self.closed || self.item != item.id {
            return Err(Rejection::ItemChanged);
        }
        validator::check_standing(&self.standing, item, bidder, amount)
    }

    pub fn accept_bid(&mut self, bidder: BidderId, amount: Amount) {
        debug_assert!(amount > self.standing.amount());
        self.standing = Standing::Leading { amount, bidder };
    }

    /// Move on to the next item, with no bids on it
    pub fn advance(&mut self, item: ItemId) {
        self.item = item;
        self.standing = Standing::Open;
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

pub type SharedRoomState = Arc<tokio::sync::Mutex<RoomAuctionState>>;

/// Auction states of all the live rooms of one runtime
///
/// The map lock is only held to look entries up; everything done to a
/// room happens under that room's own (async) lock.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomId, SharedRoomState>>,
}

impl RoomRegistry {
    pub fn insert(&self, room_id: RoomIdRef, state: RoomAuctionState) -> SharedRoomState {
        let state = Arc::new(tokio::sync::Mutex::new(state));
        self.rooms.lock().insert(room_id.to_owned(), state.clone());
        state
    }

    /// Insert `state` for `room_id`, already locked, unless the room has one
    pub async fn reserve(
        &self,
        room_id: RoomIdRef<'_>,
        state: RoomAuctionState,
    ) -> Option<(SharedRoomState, OwnedMutexGuard<RoomAuctionState>)> {
        let state = Arc::new(tokio::sync::Mutex::new(state));
        let guard = state.clone().lock_owned().await;
        match self.rooms.lock().entry(room_id.to_owned()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                entry.insert(state.clone());
                Some((state, guard))
            }
        }
    }

    pub fn get(&self, room_id: RoomIdRef) -> Option<SharedRoomState> {
        self.rooms.lock().get(room_id).cloned()
    }

    pub fn remove(&self, room_id: RoomIdRef) -> Option<SharedRoomState> {
        self.rooms.lock().remove(room_id)
    }

    /// Remove the entry of `room_id` if it is still `state`
    pub fn remove_if_same(&self, room_id: RoomIdRef, state: &SharedRoomState) {
        let mut rooms = self.rooms.lock();
        if rooms.get(room_id).map_or(false, |s| Arc::ptr_eq(s, state)) {
            rooms.remove(room_id);
        }
    }

    #[cfg(test)]
    pub fn contains(&self, room_id: RoomIdRef) -> bool {
        self.rooms.lock().contains_key(room_id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rooms.lock().len()
    }
}

use super::*;
use anyhow::{bail, format_err};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// All the rows of an [`InMemoryPersistence`]
///
/// `Room::bidders` is always empty in `rooms`; it gets filled in on load.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub rooms: BTreeMap<RoomId, Room>,
    pub items: BTreeMap<ItemId, Item>,
    pub bidders: BTreeMap<BidderId, Bidder>,
    pub bids: Vec<BidRecord>,
    pub ownerships: Vec<Ownership>,
}

impl Tables {
    fn room(&self, room_id: RoomIdRef) -> Option<Room> {
        self.rooms.get(room_id).map(|room| Room {
            bidders: self
                .bidders
                .values()
                .filter(|b| b.room_id == room.id)
                .cloned()
                .collect(),
            ..room.clone()
        })
    }

    fn next_upcoming_item(&self, room_id: RoomIdRef) -> Option<Item> {
        self.items
            .values()
            .filter(|i| i.room_id == room_id && i.status == ItemStatus::Upcoming)
            .min_by_key(|i| i.position)
            .cloned()
    }

    fn update_room(&mut self, room_id: RoomIdRef, update: RoomUpdate) -> Result<()> {
        let room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| format_err!("room {room_id} not found"))?;
        if let Some(status) = update.status {
            room.status = status;
        }
        if let Some(current_item) = update.current_item {
            room.current_item = current_item;
        }
        if let Some(standing) = update.standing {
            room.standing = standing;
        }
        Ok(())
    }
}

/// Fake in-memory persistence.
///
/// Useful for unit-tests and for running without a database. A
/// transaction holds the only lock on all the tables and works on a copy
/// of the mutable ones, plus the rows it appends, so rolling back is just
/// dropping those.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPersistence {
    tables: Arc<Mutex<Tables>>,
    fail_next_commit: Arc<AtomicBool>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current (committed) rows
    #[cfg(test)]
    pub async fn tables(&self) -> Tables {
        self.tables.lock().await.clone()
    }

    /// Run `f` directly on the committed rows
    pub async fn with_tables<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        f(&mut *self.tables.lock().await)
    }

    /// Make the next transaction commit fail, leaving the rows untouched
    #[cfg(test)]
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub async fn add_room(&self, room_id: RoomIdRef<'_>, host_id: UserIdRef<'_>) {
        self.with_tables(|t| {
            t.rooms.insert(
                room_id.to_owned(),
                Room {
                    id: room_id.to_owned(),
                    host_id: host_id.to_owned(),
                    status: RoomStatus::Waiting,
                    current_item: None,
                    standing: Standing::Open,
                    bidders: vec![],
                },
            );
        })
        .await
    }

    pub async fn add_bidder(
        &self,
        room_id: RoomIdRef<'_>,
        bidder_id: BidderIdRef<'_>,
        user_id: UserIdRef<'_>,
        budget: Amount,
    ) {
        self.with_tables(|t| {
            t.bidders.insert(
                bidder_id.to_owned(),
                Bidder {
                    id: bidder_id.to_owned(),
                    room_id: room_id.to_owned(),
                    user_id: user_id.to_owned(),
                    budget,
                },
            );
        })
        .await
    }

    /// Add an `UPCOMING` item, last in the room's auction order
    pub async fn add_item(&self, room_id: RoomIdRef<'_>, item_id: ItemIdRef<'_>, base_price: Amount) {
        self.with_tables(|t| {
            let position = t.items.len() as u64;
            t.items.insert(
                item_id.to_owned(),
                Item {
                    id: item_id.to_owned(),
                    room_id: room_id.to_owned(),
                    position,
                    status: ItemStatus::Upcoming,
                    base_price,
                    sale: None,
                },
            );
        })
        .await
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn load_room(&self, room_id: &str) -> Result<Option<Room>> {
        Ok(self.tables.lock().await.room(room_id))
    }

    async fn load_item(&self, item_id: &str) -> Result<Option<Item>> {
        Ok(self.tables.lock().await.items.get(item_id).cloned())
    }

    async fn load_bidder_in_room(&self, room_id: &str, user_id: &str) -> Result<Option<Bidder>> {
        Ok(self
            .tables
            .lock()
            .await
            .bidders
            .values()
            .find(|b| b.room_id == room_id && b.user_id == user_id)
            .cloned())
    }

    async fn list_live_rooms(&self) -> Result<Vec<Room>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .rooms
            .values()
            .filter(|r| r.status == RoomStatus::Live)
            .filter_map(|r| tables.room(&r.id))
            .collect())
    }

    async fn start_transaction(&self) -> Result<OwnedTransaction> {
        let guard = self.tables.clone().lock_owned().await;
        Ok(Box::new(InMemoryTransaction {
            working: Tables {
                rooms: guard.rooms.clone(),
                items: guard.items.clone(),
                bidders: guard.bidders.clone(),
                bids: vec![],
                ownerships: vec![],
            },
            guard,
            fail_commit: self.fail_next_commit.swap(false, Ordering::SeqCst),
        }))
    }
}

#[derive(Debug)]
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    /// `bids` and `ownerships` only hold the rows appended here
    working: Tables,
    fail_commit: bool,
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn load_room(&mut self, room_id: &str) -> Result<Option<Room>> {
        Ok(self.working.room(room_id))
    }

    async fn load_bidder(&mut self, bidder_id: &str) -> Result<Option<Bidder>> {
        Ok(self.working.bidders.get(bidder_id).cloned())
    }

    async fn next_upcoming_item(&mut self, room_id: &str) -> Result<Option<Item>> {
        Ok(self.working.next_upcoming_item(room_id))
    }

    async fn update_item(&mut self, item_id: &str, update: ItemUpdate) -> Result<()> {
        let item = self
            .working
            .items
            .get_mut(item_id)
            .ok_or_else(|| format_err!("item {item_id} not found"))?;
        item.status = update.status;
        item.sale = update.sale;
        Ok(())
    }

    async fn update_bidder_budget(&mut self, bidder_id: &str, budget: Amount) -> Result<()> {
        self.working
            .bidders
            .get_mut(bidder_id)
            .ok_or_else(|| format_err!("bidder {bidder_id} not found"))?
            .budget = budget;
        Ok(())
    }

    async fn update_room(&mut self, room_id: &str, update: RoomUpdate) -> Result<()> {
        self.working.update_room(room_id, update)
    }

    async fn insert_ownership(&mut self, ownership: Ownership) -> Result<()> {
        if self
            .guard
            .ownerships
            .iter()
            .chain(&self.working.ownerships)
            .any(|o| o.bidder_id == ownership.bidder_id && o.item_id == ownership.item_id)
        {
            bail!(
                "item {} already owned by bidder {}",
                ownership.item_id,
                ownership.bidder_id
            );
        }
        self.working.ownerships.push(ownership);
        Ok(())
    }

    async fn insert_bid(&mut self, bid: NewBid) -> Result<BidRecord> {
        let record = BidRecord {
            id: (self.guard.bids.len() + self.working.bids.len()) as u64 + 1,
            room_id: bid.room_id,
            item_id: bid.item_id,
            bidder_id: bid.bidder_id,
            amount: bid.amount,
            placed_at: bid.placed_at,
        };
        self.working.bids.push(record.clone());
        Ok(record)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryTransaction {
            mut guard,
            working,
            fail_commit,
        } = *self;
        if fail_commit {
            bail!("commit failed (injected)");
        }
        let Tables {
            rooms,
            items,
            bidders,
            bids,
            ownerships,
        } = working;
        guard.rooms = rooms;
        guard.items = items;
        guard.bidders = bidders;
        guard.bids.extend(bids);
        guard.ownerships.extend(ownerships);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

//! Store traits
//!
//! The auction only needs simple reads outside of transactions, and a
//! handful of writes that must land together (closing a round moves an
//! item, a budget, an ownership and the room pointer at once). So the
//! writes live on [`Transaction`] only, and callers pass the transaction
//! around explicitly.
//!
//! Some discussion on transactions in hexagonal architecture:
//!
//! * https://www.reddit.com/r/rust/comments/p9amqt/hexagonal_architecture_in_rust_1/h9ypjoo
//! * https://www.reddit.com/r/golang/comments/i1vy4s/ddd_vs_db_transactions_how_to_reconcile/
pub mod in_memory;
pub mod postgres;

pub use self::in_memory::InMemoryPersistence;
pub use self::postgres::PostgresPersistence;

use crate::auction::*;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// A store holding rooms, items, bidders and the bid log
///
/// Must be thread-safe.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Load a room along with its bidders
    async fn load_room(&self, room_id: &str) -> Result<Option<Room>>;
    async fn load_item(&self, item_id: &str) -> Result<Option<Item>>;
    async fn load_bidder_in_room(&self, room_id: &str, user_id: &str) -> Result<Option<Bidder>>;
    async fn list_live_rooms(&self) -> Result<Vec<Room>>;

    async fn start_transaction(&self) -> Result<OwnedTransaction>;
}

pub type SharedPersistence = Arc<dyn Persistence + Send + Sync + 'static>;

/// A database transaction
///
/// Dropping it without calling [`Transaction::commit`] must discard all
/// the changes made through it.
#[async_trait]
pub trait Transaction: Send {
    /// Load a room, locking it for the rest of the transaction
    async fn load_room(&mut self, room_id: &str) -> Result<Option<Room>>;
    /// Load a bidder, locking it for the rest of the transaction
    async fn load_bidder(&mut self, bidder_id: &str) -> Result<Option<Bidder>>;
    /// First `UPCOMING` item of the room in creation order
    async fn next_upcoming_item(&mut self, room_id: &str) -> Result<Option<Item>>;

    async fn update_item(&mut self, item_id: &str, update: ItemUpdate) -> Result<()>;
    async fn update_bidder_budget(&mut self, bidder_id: &str, budget: Amount) -> Result<()>;
    async fn update_room(&mut self, room_id: &str, update: RoomUpdate) -> Result<()>;
    async fn insert_ownership(&mut self, ownership: Ownership) -> Result<()>;
    async fn insert_bid(&mut self, bid: NewBid) -> Result<BidRecord>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

pub type OwnedTransaction = Box<dyn Transaction>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemUpdate {
    pub status: ItemStatus,
    pub sale: Option<Sale>,
}

impl ItemUpdate {
    pub fn status(status: ItemStatus) -> Self {
        Self { status, sale: None }
    }

    pub fn sold(sale: Sale) -> Self {
        Self {
            status: ItemStatus::Sold,
            sale: Some(sale),
        }
    }
}

/// Room fields to change; `None` leaves a field as it is
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomUpdate {
    pub status: Option<RoomStatus>,
    pub current_item: Option<Option<ItemId>>,
    pub standing: Option<Standing>,
}

impl RoomUpdate {
    pub fn standing(standing: Standing) -> Self {
        Self {
            standing: Some(standing),
            ..Self::default()
        }
    }

    /// Point the room at a new item, with no bids on it yet
    pub fn activate(item_id: ItemIdRef) -> Self {
        Self {
            status: Some(RoomStatus::Live),
            current_item: Some(Some(item_id.to_owned())),
            standing: Some(Standing::Open),
        }
    }

    pub fn complete() -> Self {
        Self {
            status: Some(RoomStatus::Completed),
            current_item: Some(None),
            standing: Some(Standing::Open),
        }
    }
}

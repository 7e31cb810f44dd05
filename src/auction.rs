//! Auction domain: rooms, items, bidders and the price rules between them.
pub mod ladder;
pub mod validator;

pub use self::ladder::minimum_increment;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type RoomId = String;
pub type RoomIdRef<'s> = &'s str;
pub type ItemId = String;
pub type ItemIdRef<'s> = &'s str;
pub type BidderId = String;
pub type BidderIdRef<'s> = &'s str;
pub type UserId = String;
pub type UserIdRef<'s> = &'s str;
pub type Amount = u64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(String);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomStatus {
    Waiting,
    Live,
    Completed,
}

impl RoomStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RoomStatus::Waiting => "WAITING",
            RoomStatus::Live => "LIVE",
            RoomStatus::Completed => "COMPLETED",
        }
    }
}

impl FromStr for RoomStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "WAITING" => RoomStatus::Waiting,
            "LIVE" => RoomStatus::Live,
            "COMPLETED" => RoomStatus::Completed,
            other => return Err(UnknownStatus(other.to_owned())),
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Upcoming,
    Active,
    Sold,
    Unsold,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Upcoming => "UPCOMING",
            ItemStatus::Active => "ACTIVE",
            ItemStatus::Sold => "SOLD",
            ItemStatus::Unsold => "UNSOLD",
        }
    }
}

impl FromStr for ItemStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "UPCOMING" => ItemStatus::Upcoming,
            "ACTIVE" => ItemStatus::Active,
            "SOLD" => ItemStatus::Sold,
            "UNSOLD" => ItemStatus::Unsold,
            other => return Err(UnknownStatus(other.to_owned())),
        })
    }
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A participant of a room (a "team") holding a budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bidder {
    pub id: BidderId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub budget: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Room {
    pub id: RoomId,
    pub host_id: UserId,
    pub status: RoomStatus,
    pub current_item: Option<ItemId>,
    /// Last accepted bid, mirrored from memory so it survives a restart
    pub standing: Standing,
    pub bidders: Vec<Bidder>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sale {
    pub price: Amount,
    pub buyer: BidderId,
}

/// A single lot (a "player")
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Item {
    pub id: ItemId,
    pub room_id: RoomId,
    /// Creation order within the room; items are auctioned in this order
    pub position: u64,
    pub status: ItemStatus,
    pub base_price: Amount,
    pub sale: Option<Sale>,
}

/// A bid about to be appended to the bid log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBid {
    pub room_id: RoomId,
    pub item_id: ItemId,
    pub bidder_id: BidderId,
    pub amount: Amount,
    pub placed_at: DateTime<Utc>,
}

/// An immutable entry of the bid log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BidRecord {
    pub id: u64,
    pub room_id: RoomId,
    pub item_id: ItemId,
    pub bidder_id: BidderId,
    pub amount: Amount,
    pub placed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ownership {
    pub bidder_id: BidderId,
    pub item_id: ItemId,
    pub price: Amount,
}

/// The best bid on the item currently under the hammer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Standing {
    /// Nobody bid yet
    #[default]
    Open,
    Leading { amount: Amount, bidder: BidderId },
}

impl Standing {
    /// Rebuild from the persisted `(highest_bid, highest_bidder)` pair.
    ///
    /// A zero amount or a missing bidder both mean no bid was made.
    pub fn from_mirror(amount: Amount, bidder: Option<BidderId>) -> Self {
        match bidder {
            Some(bidder) if amount > 0 => Standing::Leading { amount, bidder },
            _ => Standing::Open,
        }
    }

    /// The `(highest_bid, highest_bidder)` pair to persist
    pub fn to_mirror(&self) -> (Amount, Option<BidderIdRef<'_>>) {
        match self {
            Standing::Open => (0, None),
            Standing::Leading { amount, bidder } => (*amount, Some(bidder)),
        }
    }

    pub fn amount(&self) -> Amount {
        self.to_mirror().0
    }

    pub fn leader(&self) -> Option<BidderIdRef<'_>> {
        self.to_mirror().1
    }

    /// Lowest acceptable next bid
    pub fn floor(&self, base_price: Amount) -> Amount {
        match self {
            Standing::Open => base_price,
            Standing::Leading { amount, .. } => amount.saturating_add(minimum_increment(*amount)),
        }
    }
}

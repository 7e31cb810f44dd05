use crate::auction::*;
use serde::Serialize;

/// Something that happened in a room, pushed to connected clients
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Event {
    AuctionStarted {
        item_id: ItemId,
        deadline_in_ms: u64,
    },
    BidAccepted {
        item_id: ItemId,
        bidder_id: BidderId,
        amount: Amount,
        deadline_in_ms: u64,
    },
    /// Display only, carries no state authority
    CountdownTick {
        item_id: ItemId,
        remaining_secs: u64,
    },
    ItemAdvanced {
        resolution: Resolution,
        next_item_id: ItemId,
        deadline_in_ms: u64,
    },
    RoomCompleted {
        resolution: Resolution,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::AuctionStarted { .. } => "auction-started",
            Event::BidAccepted { .. } => "bid-accepted",
            Event::CountdownTick { .. } => "countdown-tick",
            Event::ItemAdvanced { .. } => "item-advanced",
            Event::RoomCompleted { .. } => "room-completed",
        }
    }
}

/// How an item left the block
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Resolution {
    Sold {
        item_id: ItemId,
        buyer: BidderId,
        price: Amount,
    },
    Unsold {
        item_id: ItemId,
    },
}

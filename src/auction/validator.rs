//! Bid and round preconditions
//!
//! Everything here is a pure decision over snapshots. The caller is
//! responsible for reading the snapshots and for serializing the
//! final [`check_standing`] with the commit of the bid.
use super::*;

/// A request the auction refuses, reported back to the caller as is
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("bid amount must be positive")]
    InvalidAmount,
    #[error("room not found")]
    RoomNotFound,
    #[error("auction is not live")]
    NotLive,
    #[error("no item is up for auction")]
    NoActiveItem,
    #[error("item is not active")]
    ItemNotActive,
    #[error("user is not part of this room")]
    NotInRoom,
    #[error("insufficient budget")]
    InsufficientBudget,
    #[error("already the highest bidder")]
    AlreadyHighestBidder,
    #[error("bid must be at least {floor}")]
    BelowFloor { floor: Amount },
    #[error("item changed while the request was in flight")]
    ItemChanged,
    #[error("only the host can do this")]
    NotHost,
    #[error("auction already started")]
    AlreadyStarted,
    #[error("no items available to auction")]
    NoItems,
}

impl Rejection {
    /// Stable machine-readable reason
    pub fn code(&self) -> &'static str {
        use Rejection::*;
        match self {
            InvalidAmount => "invalid_amount",
            RoomNotFound => "room_not_found",
            NotLive => "auction_not_live",
            NoActiveItem => "no_active_item",
            ItemNotActive => "item_not_active",
            NotInRoom => "not_in_room",
            InsufficientBudget => "insufficient_budget",
            AlreadyHighestBidder => "already_highest_bidder",
            BelowFloor { .. } => "below_minimum_bid",
            ItemChanged => "item_changed",
            NotHost => "not_host",
            AlreadyStarted => "already_started",
            NoItems => "no_items",
        }
    }
}

pub fn ensure_host(room: &Room, user_id: UserIdRef) -> Result<(), Rejection> {
    if room.host_id != user_id {
        return Err(Rejection::NotHost);
    }
    Ok(())
}

/// The checks that only need store snapshots, in the order they are reported
///
/// `item` is the item the room points at (if any was found) and
/// `bidder` is the caller's bidder in this room (if any).
pub fn check_bid<'a>(
    room: &Room,
    item: Option<&'a Item>,
    bidder: Option<&'a Bidder>,
    amount: Amount,
) -> Result<(&'a Item, &'a Bidder), Rejection> {
    use Rejection::*;

    if amount == 0 {
        return Err(InvalidAmount);
    }
    if room.status != RoomStatus::Live {
        return Err(NotLive);
    }
    let Some(current_item) = room.current_item.as_deref() else {
        return Err(NoActiveItem);
    };
    let item = match item {
        Some(item) if item.id == current_item && item.status == ItemStatus::Active => item,
        _ => return Err(ItemNotActive),
    };
    let bidder = match bidder {
        Some(bidder) if bidder.room_id == room.id => bidder,
        _ => return Err(NotInRoom),
    };
    if bidder.budget < amount {
        return Err(InsufficientBudget);
    }
    Ok((item, bidder))
}

/// The checks against the room's live standing
pub fn check_standing(
    standing: &Standing,
    item: &Item,
    bidder: BidderIdRef,
    amount: Amount,
) -> Result<(), Rejection> {
    if standing.leader() == Some(bidder) {
        return Err(Rejection::AlreadyHighestBidder);
    }
    let floor = standing.floor(item.base_price);
    if amount < floor {
        return Err(Rejection::BelowFloor { floor });
    }
    Ok(())
}

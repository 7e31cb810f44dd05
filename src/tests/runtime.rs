use super::*;
use crate::auction::validator::Rejection;
use crate::event::Resolution;
use crate::persistence::{
    ItemUpdate, OwnedTransaction, Persistence, RoomUpdate, Transaction,
};
use crate::service::{AuctionError, CloseOutcome};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;

fn rejection<T: std::fmt::Debug>(res: Result<T, AuctionError>) -> Option<Rejection> {
    res.expect_err("request must fail").rejection()
}

#[tokio::test(start_paused = true)]
async fn rooms_move_from_item_to_item_until_done() -> Result<()> {
    let f = Fixture::new().await;

    let started = f.runtime.start_auction(HOST, ROOM).await?;
    assert_eq!(started.item_id, ITEM_1);
    assert_eq!(started.deadline_in_ms, 10_000);
    assert!(f.runtime.is_live(ROOM));
    assert_eq!(f.item(ITEM_1).await.status, ItemStatus::Active);
    assert_eq!(f.room().await.status, RoomStatus::Live);

    let accepted = f.runtime.place_bid(USER_X, ROOM, 150).await?;
    assert_eq!(accepted.highest_bid, 150);
    assert_eq!(accepted.highest_bidder, BIDDER_X);

    let outcome = f.runtime.close_current_item(HOST, ROOM).await?;
    let sold = Resolution::Sold {
        item_id: ITEM_1.to_owned(),
        buyer: BIDDER_X.to_owned(),
        price: 150,
    };
    assert_eq!(
        outcome,
        CloseOutcome::Advanced {
            resolution: sold.clone(),
            next_item_id: ITEM_2.to_owned(),
        }
    );

    let item_1 = f.item(ITEM_1).await;
    assert_eq!(item_1.status, ItemStatus::Sold);
    assert_eq!(
        item_1.sale,
        Some(Sale {
            price: 150,
            buyer: BIDDER_X.to_owned()
        })
    );
    assert_eq!(f.item(ITEM_2).await.status, ItemStatus::Active);
    assert_eq!(f.budget(BIDDER_X).await, BUDGET - 150);
    assert_eq!(f.budget(BIDDER_Y).await, BUDGET);

    let room = f.room().await;
    assert_eq!(room.current_item.as_deref(), Some(ITEM_2));
    assert_eq!(room.standing, Standing::Open);

    let snapshot = f.runtime.snapshot(ROOM).await.expect("room is live");
    assert_eq!(snapshot.item_id, ITEM_2);
    assert_eq!(snapshot.standing, Standing::Open);
    assert_eq!(snapshot.remaining_ms, Some(10_000));

    let outcome = f.runtime.close_current_item(HOST, ROOM).await?;
    let unsold = Resolution::Unsold {
        item_id: ITEM_2.to_owned(),
    };
    assert_eq!(
        outcome,
        CloseOutcome::Completed {
            resolution: unsold.clone()
        }
    );
    assert_eq!(f.item(ITEM_2).await.status, ItemStatus::Unsold);
    assert_eq!(f.item(ITEM_2).await.sale, None);

    let room = f.room().await;
    assert_eq!(room.status, RoomStatus::Completed);
    assert_eq!(room.current_item, None);
    assert!(!f.runtime.is_live(ROOM));
    assert_eq!(f.runtime.live_rooms(), 0);
    assert_eq!(f.runtime.deadline(ROOM), None);
    assert!(f.runtime.snapshot(ROOM).await.is_none());

    let tables = f.persistence.tables().await;
    assert_eq!(
        tables.ownerships,
        vec![Ownership {
            bidder_id: BIDDER_X.to_owned(),
            item_id: ITEM_1.to_owned(),
            price: 150,
        }]
    );

    assert_eq!(
        f.events(),
        vec![
            Event::AuctionStarted {
                item_id: ITEM_1.to_owned(),
                deadline_in_ms: 10_000,
            },
            Event::BidAccepted {
                item_id: ITEM_1.to_owned(),
                bidder_id: BIDDER_X.to_owned(),
                amount: 150,
                deadline_in_ms: 10_000,
            },
            Event::ItemAdvanced {
                resolution: sold,
                next_item_id: ITEM_2.to_owned(),
                deadline_in_ms: 10_000,
            },
            Event::RoomCompleted { resolution: unsold },
        ]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn bids_climb_the_ladder() -> Result<()> {
    let f = Fixture::new().await;
    f.runtime.start_auction(HOST, ROOM).await?;

    f.runtime.place_bid(USER_X, ROOM, 100).await?;
    assert_eq!(
        rejection(f.runtime.place_bid(USER_Y, ROOM, 105).await),
        Some(Rejection::BelowFloor { floor: 110 })
    );
    let accepted = f.runtime.place_bid(USER_Y, ROOM, 110).await?;
    assert_eq!(accepted.highest_bidder, BIDDER_Y);

    // Y leads now, so Y can't go again
    assert_eq!(
        rejection(f.runtime.place_bid(USER_Y, ROOM, 300).await),
        Some(Rejection::AlreadyHighestBidder)
    );

    let room = f.room().await;
    assert_eq!(
        room.standing,
        Standing::Leading {
            amount: 110,
            bidder: BIDDER_Y.to_owned()
        }
    );
    let tables = f.persistence.tables().await;
    assert_eq!(
        tables
            .bids
            .iter()
            .map(|b| (b.bidder_id.as_str(), b.amount))
            .collect::<Vec<_>>(),
        vec![(BIDDER_X, 100), (BIDDER_Y, 110)]
    );
    assert_eq!(tables.bids[1].id, accepted.bid_id);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn bids_are_checked_against_the_room() -> Result<()> {
    let f = Fixture::new().await;

    assert_eq!(
        rejection(f.runtime.place_bid(USER_X, ROOM, 100).await),
        Some(Rejection::NotLive)
    );
    assert_eq!(
        rejection(f.runtime.place_bid(USER_X, "no-such-room", 100).await),
        Some(Rejection::RoomNotFound)
    );

    f.runtime.start_auction(HOST, ROOM).await?;

    assert_eq!(
        rejection(f.runtime.place_bid(USER_X, ROOM, 0).await),
        Some(Rejection::InvalidAmount)
    );
    assert_eq!(
        rejection(f.runtime.place_bid("stranger", ROOM, 100).await),
        Some(Rejection::NotInRoom)
    );
    assert_eq!(
        rejection(f.runtime.place_bid(USER_X, ROOM, BUDGET + 1).await),
        Some(Rejection::InsufficientBudget)
    );
    assert_eq!(
        rejection(f.runtime.place_bid(USER_X, ROOM, 99).await),
        Some(Rejection::BelowFloor { floor: 100 })
    );

    assert!(f.persistence.tables().await.bids.is_empty());
    assert_eq!(f.events().len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn starting_needs_a_waiting_room_with_items() -> Result<()> {
    let f = Fixture::new().await;

    assert_eq!(
        rejection(f.runtime.start_auction(USER_X, ROOM).await),
        Some(Rejection::NotHost)
    );
    assert_eq!(
        rejection(f.runtime.start_auction(HOST, "no-such-room").await),
        Some(Rejection::RoomNotFound)
    );
    f.runtime.start_auction(HOST, ROOM).await?;
    assert_eq!(
        rejection(f.runtime.start_auction(HOST, ROOM).await),
        Some(Rejection::AlreadyStarted)
    );

    let empty = Fixture::with_items(&[]).await;
    assert_eq!(
        rejection(empty.runtime.start_auction(HOST, ROOM).await),
        Some(Rejection::NoItems)
    );
    assert_eq!(empty.room().await.status, RoomStatus::Waiting);
    assert!(!empty.runtime.is_live(ROOM));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn only_the_host_closes_items() -> Result<()> {
    let f = Fixture::new().await;
    assert_eq!(
        rejection(f.runtime.close_current_item(HOST, ROOM).await),
        Some(Rejection::NotLive)
    );

    f.runtime.start_auction(HOST, ROOM).await?;
    assert_eq!(
        rejection(f.runtime.close_current_item(USER_X, ROOM).await),
        Some(Rejection::NotHost)
    );
    assert_eq!(f.item(ITEM_1).await.status, ItemStatus::Active);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn closing_a_completed_room_changes_nothing() -> Result<()> {
    let f = Fixture::with_items(&[(ITEM_1, 100)]).await;
    f.runtime.start_auction(HOST, ROOM).await?;
    f.runtime.place_bid(USER_Y, ROOM, 100).await?;

    let outcome = f.runtime.close_current_item(HOST, ROOM).await?;
    assert!(matches!(outcome, CloseOutcome::Completed { .. }));
    let before = f.persistence.tables().await;

    assert_eq!(
        rejection(f.runtime.close_current_item(HOST, ROOM).await),
        Some(Rejection::NotLive)
    );
    let after = f.persistence.tables().await;
    assert_eq!(after.ownerships, before.ownerships);
    assert_eq!(after.ownerships.len(), 1);
    assert_eq!(f.budget(BIDDER_Y).await, BUDGET - 100);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn winner_short_on_budget_keeps_the_item_up() -> Result<()> {
    let f = Fixture::new().await;
    f.runtime.start_auction(HOST, ROOM).await?;
    f.runtime.place_bid(USER_X, ROOM, 500).await?;

    // budget spent elsewhere since the bid
    f.persistence
        .with_tables(|t| {
            if let Some(x) = t.bidders.get_mut(BIDDER_X) {
                x.budget = 100;
            }
        })
        .await;

    let err = f
        .runtime
        .close_current_item(HOST, ROOM)
        .await
        .expect_err("winner can't pay");
    assert!(matches!(
        err,
        AuctionError::BudgetConflict {
            price: 500,
            budget: 100,
            ..
        }
    ));

    assert_eq!(f.item(ITEM_1).await.status, ItemStatus::Active);
    assert_eq!(f.item(ITEM_2).await.status, ItemStatus::Upcoming);
    assert_eq!(f.budget(BIDDER_X).await, 100);
    assert!(f.persistence.tables().await.ownerships.is_empty());
    assert!(f.runtime.is_live(ROOM));
    assert_eq!(
        f.runtime.snapshot(ROOM).await.map(|s| s.standing),
        Some(Standing::Leading {
            amount: 500,
            bidder: BIDDER_X.to_owned()
        })
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_close_leaves_nothing_behind() -> Result<()> {
    let f = Fixture::new().await;
    f.runtime.start_auction(HOST, ROOM).await?;
    f.runtime.place_bid(USER_X, ROOM, 200).await?;
    let before = f.persistence.tables().await;

    f.persistence.fail_next_commit();
    let err = f
        .runtime
        .close_current_item(HOST, ROOM)
        .await
        .expect_err("commit fails");
    assert!(matches!(err, AuctionError::Store(_)));

    let after = f.persistence.tables().await;
    assert_eq!(after.items, before.items);
    assert_eq!(after.bidders, before.bidders);
    assert_eq!(after.rooms, before.rooms);
    assert!(after.ownerships.is_empty());
    assert!(f.runtime.is_live(ROOM));

    // and the room can still be closed
    let outcome = f.runtime.close_current_item(HOST, ROOM).await?;
    assert!(matches!(outcome, CloseOutcome::Advanced { .. }));
    assert_eq!(f.budget(BIDDER_X).await, BUDGET - 200);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_bid_commit_is_not_accepted() -> Result<()> {
    let f = Fixture::new().await;
    f.runtime.start_auction(HOST, ROOM).await?;

    f.persistence.fail_next_commit();
    let err = f
        .runtime
        .place_bid(USER_X, ROOM, 100)
        .await
        .expect_err("commit fails");
    assert!(matches!(err, AuctionError::Store(_)));
    assert!(f.persistence.tables().await.bids.is_empty());
    assert_eq!(f.room().await.standing, Standing::Open);
    assert_eq!(
        f.runtime.snapshot(ROOM).await.map(|s| s.standing),
        Some(Standing::Open)
    );

    f.runtime.place_bid(USER_X, ROOM, 100).await?;
    assert_eq!(f.persistence.tables().await.bids.len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn live_room_without_state_is_reported() -> Result<()> {
    let f = Fixture::new().await;
    // LIVE in the store, but never started (or recovered) by this runtime
    f.persistence
        .with_tables(|t| {
            if let Some(room) = t.rooms.get_mut(ROOM) {
                room.status = RoomStatus::Live;
                room.current_item = Some(ITEM_1.to_owned());
            }
            if let Some(item) = t.items.get_mut(ITEM_1) {
                item.status = ItemStatus::Active;
            }
        })
        .await;

    let err = f
        .runtime
        .place_bid(USER_X, ROOM, 100)
        .await
        .expect_err("no state");
    assert!(matches!(err, AuctionError::Inconsistent(_)));
    let err = f
        .runtime
        .close_current_item(HOST, ROOM)
        .await
        .expect_err("no state");
    assert!(matches!(err, AuctionError::Inconsistent(_)));
    assert!(f.persistence.tables().await.bids.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn concurrent_bids_see_each_other() -> Result<()> {
    let f = Fixture::new().await;
    f.runtime.start_auction(HOST, ROOM).await?;

    // both clear the floor on their own snapshot; only one may win it
    let (x, y) = tokio::join!(
        f.runtime.place_bid(USER_X, ROOM, 100),
        f.runtime.place_bid(USER_Y, ROOM, 100),
    );
    let accepted = [x.is_ok(), y.is_ok()];
    assert_eq!(accepted.iter().filter(|ok| **ok).count(), 1);
    let loser = if x.is_ok() { y } else { x };
    assert_eq!(
        rejection(loser),
        Some(Rejection::BelowFloor { floor: 110 })
    );
    assert_eq!(f.persistence.tables().await.bids.len(), 1);
    Ok(())
}

/// Commits through the wrapped store, then takes a second to report back
struct SlowCommitStore(InMemoryPersistence);

struct SlowCommit(OwnedTransaction);

#[async_trait]
impl Persistence for SlowCommitStore {
    async fn load_room(&self, room_id: &str) -> Result<Option<Room>> {
        self.0.load_room(room_id).await
    }

    async fn load_item(&self, item_id: &str) -> Result<Option<Item>> {
        self.0.load_item(item_id).await
    }

    async fn load_bidder_in_room(&self, room_id: &str, user_id: &str) -> Result<Option<Bidder>> {
        self.0.load_bidder_in_room(room_id, user_id).await
    }

    async fn list_live_rooms(&self) -> Result<Vec<Room>> {
        self.0.list_live_rooms().await
    }

    async fn start_transaction(&self) -> Result<OwnedTransaction> {
        Ok(Box::new(SlowCommit(self.0.start_transaction().await?)))
    }
}

#[async_trait]
impl Transaction for SlowCommit {
    async fn load_room(&mut self, room_id: &str) -> Result<Option<Room>> {
        self.0.load_room(room_id).await
    }

    async fn load_bidder(&mut self, bidder_id: &str) -> Result<Option<Bidder>> {
        self.0.load_bidder(bidder_id).await
    }

    async fn next_upcoming_item(&mut self, room_id: &str) -> Result<Option<Item>> {
        self.0.next_upcoming_item(room_id).await
    }

    async fn update_item(&mut self, item_id: &str, update: ItemUpdate) -> Result<()> {
        self.0.update_item(item_id, update).await
    }

    async fn update_bidder_budget(&mut self, bidder_id: &str, budget: Amount) -> Result<()> {
        self.0.update_bidder_budget(bidder_id, budget).await
    }

    async fn update_room(&mut self, room_id: &str, update: RoomUpdate) -> Result<()> {
        self.0.update_room(room_id, update).await
    }

    async fn insert_ownership(&mut self, ownership: Ownership) -> Result<()> {
        self.0.insert_ownership(ownership).await
    }

    async fn insert_bid(&mut self, bid: NewBid) -> Result<BidRecord> {
        self.0.insert_bid(bid).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.0.commit().await?;
        sleep(Duration::from_secs(1)).await;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.0.rollback().await
    }
}

#[tokio::test(start_paused = true)]
async fn requests_right_after_the_start_commit_wait_for_it() -> Result<()> {
    let f = Fixture::new().await;
    let runtime = AuctionRuntime::new(
        Arc::new(SlowCommitStore(f.persistence.clone())),
        f.events.clone(),
        TimerSettings::default(),
    );

    let start = tokio::spawn({
        let runtime = runtime.clone();
        async move { runtime.start_auction(HOST, ROOM).await }
    });
    sleep(Duration::from_millis(500)).await;
    // committed, but the start hasn't returned yet
    assert_eq!(f.room().await.status, RoomStatus::Live);
    assert!(runtime.is_live(ROOM));

    let accepted = runtime.place_bid(USER_X, ROOM, 100).await?;
    assert_eq!(accepted.highest_bidder, BIDDER_X);
    assert_eq!(start.await??.item_id, ITEM_1);
    assert_eq!(
        runtime.snapshot(ROOM).await.map(|s| s.standing),
        Some(Standing::Leading {
            amount: 100,
            bidder: BIDDER_X.to_owned()
        })
    );
    runtime.shutdown();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn concurrent_starts_start_once() -> Result<()> {
    let f = Fixture::new().await;
    let (a, b) = tokio::join!(
        f.runtime.start_auction(HOST, ROOM),
        f.runtime.start_auction(HOST, ROOM),
    );
    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    let loser = if a.is_ok() { b } else { a };
    assert_eq!(rejection(loser), Some(Rejection::AlreadyStarted));

    assert_eq!(f.room().await.status, RoomStatus::Live);
    assert!(f.runtime.is_live(ROOM));
    assert_eq!(f.runtime.live_rooms(), 1);
    f.runtime.place_bid(USER_X, ROOM, 100).await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_start_commit_leaves_the_room_waiting() -> Result<()> {
    let f = Fixture::new().await;

    f.persistence.fail_next_commit();
    let err = f
        .runtime
        .start_auction(HOST, ROOM)
        .await
        .expect_err("commit fails");
    assert!(matches!(err, AuctionError::Store(_)));
    assert_eq!(f.room().await.status, RoomStatus::Waiting);
    assert!(!f.runtime.is_live(ROOM));
    assert_eq!(f.runtime.deadline(ROOM), None);
    assert!(f.events().is_empty());

    // nothing left behind to block a retry
    f.runtime.start_auction(HOST, ROOM).await?;
    assert!(f.runtime.is_live(ROOM));
    Ok(())
}

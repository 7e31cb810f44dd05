//! Closing the current item of a room
use super::*;
use crate::event::Resolution;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CloseOutcome {
    Advanced {
        resolution: Resolution,
        next_item_id: ItemId,
    },
    Completed {
        resolution: Resolution,
    },
}

impl AuctionRuntimeShared {
    /// Close the room's current item
    ///
    /// With `expected_item`, only that item may be closed: a countdown
    /// firing for an item that already left the block is rejected.
    pub(super) async fn close_item(
        &self,
        user_id: UserIdRef<'_>,
        room_id: RoomIdRef<'_>,
        expected_item: Option<ItemIdRef<'_>>,
    ) -> Result<CloseOutcome, AuctionError> {
        let room = self
            .persistence
            .load_room(room_id)
            .await?
            .ok_or(Rejection::RoomNotFound)?;
        validator::ensure_host(&room, user_id)?;
        if room.status != RoomStatus::Live {
            return Err(Rejection::NotLive.into());
        }
        let item_id = room.current_item.as_deref().ok_or(Rejection::NoActiveItem)?;
        let item = match self.persistence.load_item(item_id).await? {
            Some(item) if item.status == ItemStatus::Active => item,
            _ => return Err(Rejection::ItemNotActive.into()),
        };
        if expected_item.map_or(false, |expected| expected != item.id) {
            return Err(Rejection::ItemChanged.into());
        }

        let state = self.registry.get(room_id).ok_or_else(|| {
            AuctionError::Inconsistent(format!("no auction state for live room {room_id}"))
        })?;
        let mut state = state.lock().await;
        // a concurrent close may have won the race for the lock
        if state.is_closed() || state.item() != item.id {
            return Err(Rejection::ItemChanged.into());
        }

        let mut tx = self.persistence.start_transaction().await?;
        let res = Self::settle(&mut *tx, &room, &item, state.standing()).await;
        let (resolution, next_item) = finish(tx, res).await.map_err(|e| {
            warn!(%room_id, item_id = %item.id, error = %e, "closing item failed");
            e
        })?;

        match next_item {
            Some(next_item) => {
                state.advance(next_item.id.clone());
                self.timer.cancel(room_id);
                let deadline = self.timer.start(room_id, state.host(), &next_item.id);
                drop(state);

                info!(%room_id, ?resolution, next_item_id = %next_item.id, "item closed, moving on");
                self.broadcast.publish(
                    room_id,
                    Event::ItemAdvanced {
                        resolution: resolution.clone(),
                        next_item_id: next_item.id.clone(),
                        deadline_in_ms: millis_until(deadline),
                    },
                );
                Ok(CloseOutcome::Advanced {
                    resolution,
                    next_item_id: next_item.id,
                })
            }
            None => {
                state.close();
                self.registry.remove(room_id);
                self.timer.cancel(room_id);
                drop(state);

                info!(%room_id, ?resolution, "last item closed, auction completed");
                self.broadcast.publish(
                    room_id,
                    Event::RoomCompleted {
                        resolution: resolution.clone(),
                    },
                );
                Ok(CloseOutcome::Completed { resolution })
            }
        }
    }

    /// All store writes of a close; they land together or not at all
    async fn settle(
        tx: &mut dyn Transaction,
        room: &Room,
        item: &Item,
        standing: &Standing,
    ) -> Result<(Resolution, Option<Item>), AuctionError> {
        let resolution = match standing {
            Standing::Open => {
                tx.update_item(&item.id, ItemUpdate::status(ItemStatus::Unsold))
                    .await?;
                Resolution::Unsold {
                    item_id: item.id.clone(),
                }
            }
            Standing::Leading { amount, bidder } => {
                let winner = tx.load_bidder(bidder).await?.ok_or_else(|| {
                    AuctionError::Inconsistent(format!("winning bidder {bidder} not found"))
                })?;
                // budgets may have moved since the bid was accepted
                if winner.budget < *amount {
                    return Err(AuctionError::BudgetConflict {
                        bidder: winner.id,
                        price: *amount,
                        budget: winner.budget,
                    });
                }
                tx.update_item(
                    &item.id,
                    ItemUpdate::sold(Sale {
                        price: *amount,
                        buyer: winner.id.clone(),
                    }),
                )
                .await?;
                tx.update_bidder_budget(&winner.id, winner.budget - amount)
                    .await?;
                tx.insert_ownership(Ownership {
                    bidder_id: winner.id.clone(),
                    item_id: item.id.clone(),
                    price: *amount,
                })
                .await?;
                Resolution::Sold {
                    item_id: item.id.clone(),
                    buyer: winner.id,
                    price: *amount,
                }
            }
        };

        let next_item = tx.next_upcoming_item(&room.id).await?;
        match &next_item {
            Some(next_item) => {
                tx.update_item(&next_item.id, ItemUpdate::status(ItemStatus::Active))
                    .await?;
                tx.update_room(&room.id, RoomUpdate::activate(&next_item.id))
                    .await?;
            }
            None => {
                tx.update_room(&room.id, RoomUpdate::complete()).await?;
            }
        }

        Ok((
            resolution,
            next_item.map(|item| Item {
                status: ItemStatus::Active,
                ..item
            }),
        ))
    }
}

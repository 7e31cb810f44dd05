//! Resuming live auctions after a restart
//!
//! Only the standing is persisted, not the deadline: a recovered room
//! gets a fresh full countdown on its current item.
use super::*;
use futures::future::join_all;
use tracing::error;

impl AuctionRuntimeShared {
    pub(super) async fn recover_live_rooms(&self) -> Result<usize> {
        let rooms = self.persistence.list_live_rooms().await?;
        let total = rooms.len();

        let mut recovered = 0;
        for (room_id, res) in join_all(rooms.into_iter().map(|room| async move {
            let room_id = room.id.clone();
            (room_id, self.recover_room(room).await)
        }))
        .await
        {
            match res {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(e) => error!(%room_id, error = %e, "failed to recover room"),
            }
        }

        info!(recovered, total, "live rooms recovered");
        Ok(recovered)
    }

    async fn recover_room(&self, room: Room) -> Result<bool> {
        let Some(item_id) = room.current_item else {
            warn!(room_id = %room.id, "live room without a current item, skipping");
            return Ok(false);
        };
        match self.persistence.load_item(&item_id).await? {
            Some(item) if item.status == ItemStatus::Active => {}
            _ => {
                warn!(room_id = %room.id, %item_id, "current item is not active, skipping");
                return Ok(false);
            }
        }

        let state = self.registry.insert(
            &room.id,
            RoomAuctionState::new(item_id.clone(), room.host_id.clone(), room.standing.clone()),
        );
        let _state = state.lock().await;
        self.timer.cancel(&room.id);
        self.timer.start(&room.id, &room.host_id, &item_id);

        info!(room_id = %room.id, %item_id, standing = ?room.standing, "room recovered");
        Ok(true)
    }
}

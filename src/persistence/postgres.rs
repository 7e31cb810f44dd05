//! PostgreSQL persistence
//!
//! Built on the synchronous `postgres` client and an `r2d2` pool. All
//! calls go through [`tokio::task::block_in_place`], so this store
//! requires the multi-threaded tokio runtime.
use super::*;
use ::postgres::{NoTls, Row};
use anyhow::{format_err, Context};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

pub type PostgresPool = r2d2::Pool<r2d2_postgres::PostgresConnectionManager<NoTls>>;
pub type PostgresConnection =
    r2d2::PooledConnection<r2d2_postgres::PostgresConnectionManager<NoTls>>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS auction_rooms (
    id TEXT PRIMARY KEY,
    host_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'WAITING',
    current_item_id TEXT,
    highest_bid BIGINT NOT NULL DEFAULT 0,
    highest_bidder_id TEXT
);
CREATE TABLE IF NOT EXISTS bidders (
    id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL REFERENCES auction_rooms (id),
    user_id TEXT NOT NULL,
    budget BIGINT NOT NULL CHECK (budget >= 0),
    UNIQUE (room_id, user_id)
);
CREATE TABLE IF NOT EXISTS room_items (
    id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL REFERENCES auction_rooms (id),
    position BIGSERIAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'UPCOMING',
    base_price BIGINT NOT NULL,
    sold_price BIGINT,
    sold_to_bidder_id TEXT REFERENCES bidders (id)
);
CREATE TABLE IF NOT EXISTS bids (
    id BIGSERIAL PRIMARY KEY,
    room_id TEXT NOT NULL REFERENCES auction_rooms (id),
    item_id TEXT NOT NULL REFERENCES room_items (id),
    bidder_id TEXT NOT NULL REFERENCES bidders (id),
    amount BIGINT NOT NULL,
    placed_at TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS ownerships (
    bidder_id TEXT NOT NULL REFERENCES bidders (id),
    item_id TEXT NOT NULL REFERENCES room_items (id),
    price BIGINT NOT NULL,
    PRIMARY KEY (bidder_id, item_id)
);
"#;

const ROOM_COLUMNS: &str = "id, host_id, status, current_item_id, highest_bid, highest_bidder_id";
const ITEM_COLUMNS: &str = "id, room_id, position, status, base_price, sold_price, sold_to_bidder_id";
const BIDDER_COLUMNS: &str = "id, room_id, user_id, budget";

fn amount(row: &Row, column: &str) -> Result<Amount> {
    Ok(u64::try_from(row.try_get::<_, i64>(column)?)?)
}

fn db_amount(amount: Amount) -> Result<i64> {
    i64::try_from(amount).with_context(|| format!("amount {amount} out of range"))
}

fn room_from_row(row: &Row, bidders: Vec<Bidder>) -> Result<Room> {
    Ok(Room {
        id: row.try_get("id")?,
        host_id: row.try_get("host_id")?,
        status: row.try_get::<_, &str>("status")?.parse()?,
        current_item: row.try_get("current_item_id")?,
        standing: Standing::from_mirror(amount(row, "highest_bid")?, row.try_get("highest_bidder_id")?),
        bidders,
    })
}

fn item_from_row(row: &Row) -> Result<Item> {
    let sold_price: Option<i64> = row.try_get("sold_price")?;
    let sold_to: Option<String> = row.try_get("sold_to_bidder_id")?;
    Ok(Item {
        id: row.try_get("id")?,
        room_id: row.try_get("room_id")?,
        position: u64::try_from(row.try_get::<_, i64>("position")?)?,
        status: row.try_get::<_, &str>("status")?.parse()?,
        base_price: amount(row, "base_price")?,
        sale: match (sold_price, sold_to) {
            (Some(price), Some(buyer)) => Some(Sale {
                price: u64::try_from(price)?,
                buyer,
            }),
            _ => None,
        },
    })
}

fn bidder_from_row(row: &Row) -> Result<Bidder> {
    Ok(Bidder {
        id: row.try_get("id")?,
        room_id: row.try_get("room_id")?,
        user_id: row.try_get("user_id")?,
        budget: amount(row, "budget")?,
    })
}

/// Load a room row and its bidders; `lock` makes it `SELECT ... FOR UPDATE`
fn query_room(client: &mut ::postgres::Client, room_id: &str, lock: bool) -> Result<Option<Room>> {
    let lock = if lock { " FOR UPDATE" } else { "" };
    let Some(row) = client.query_opt(
        &format!("SELECT {ROOM_COLUMNS} FROM auction_rooms WHERE id = $1{lock}"),
        &[&room_id],
    )?
    else {
        return Ok(None);
    };
    let bidders = client
        .query(
            &format!("SELECT {BIDDER_COLUMNS} FROM bidders WHERE room_id = $1 ORDER BY id"),
            &[&room_id],
        )?
        .iter()
        .map(bidder_from_row)
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(room_from_row(&row, bidders)?))
}

#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PostgresPool,
}

impl PostgresPersistence {
    /// Connect to `database_url` and make sure the schema exists
    ///
    /// Blocking; call before entering the async runtime.
    pub fn connect(database_url: &str) -> Result<Self> {
        let manager = r2d2_postgres::PostgresConnectionManager::new(
            database_url.parse().context("invalid database url")?,
            NoTls,
        );
        let pool = r2d2::Pool::new(manager).context("failed to create connection pool")?;
        pool.get()?
            .batch_execute(SCHEMA)
            .context("failed to create schema")?;
        info!("postgres schema ready");
        Ok(Self { pool })
    }

    fn with_connection<R>(&self, f: impl FnOnce(&mut PostgresConnection) -> Result<R>) -> Result<R> {
        tokio::task::block_in_place(|| f(&mut self.pool.get()?))
    }
}

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn load_room(&self, room_id: &str) -> Result<Option<Room>> {
        self.with_connection(|conn| query_room(conn, room_id, false))
    }

    async fn load_item(&self, item_id: &str) -> Result<Option<Item>> {
        self.with_connection(|conn| {
            conn.query_opt(
                &format!("SELECT {ITEM_COLUMNS} FROM room_items WHERE id = $1"),
                &[&item_id],
            )?
            .as_ref()
            .map(item_from_row)
            .transpose()
        })
    }

    async fn load_bidder_in_room(&self, room_id: &str, user_id: &str) -> Result<Option<Bidder>> {
        self.with_connection(|conn| {
            conn.query_opt(
                &format!("SELECT {BIDDER_COLUMNS} FROM bidders WHERE room_id = $1 AND user_id = $2"),
                &[&room_id, &user_id],
            )?
            .as_ref()
            .map(bidder_from_row)
            .transpose()
        })
    }

    async fn list_live_rooms(&self) -> Result<Vec<Room>> {
        self.with_connection(|conn| {
            let ids: Vec<String> = conn
                .query(
                    "SELECT id FROM auction_rooms WHERE status = $1 ORDER BY id",
                    &[&RoomStatus::Live.as_str()],
                )?
                .iter()
                .map(|row| row.try_get("id"))
                .collect::<Result<_, _>>()?;
            let mut rooms = Vec::with_capacity(ids.len());
            for id in ids {
                // a room may have completed in between
                if let Some(room) = query_room(conn, &id, false)? {
                    rooms.push(room);
                }
            }
            Ok(rooms)
        })
    }

    async fn start_transaction(&self) -> Result<OwnedTransaction> {
        let conn = tokio::task::block_in_place(|| -> Result<_> {
            let mut conn = self.pool.get()?;
            conn.batch_execute("BEGIN")?;
            Ok(conn)
        })?;
        Ok(Box::new(PostgresTransaction { conn: Some(conn) }))
    }
}

/// A transaction running on a connection taken out of the pool
///
/// `BEGIN`/`COMMIT` are issued by hand, as `::postgres::Transaction`
/// borrows its client and could not be held across `.await`s.
pub struct PostgresTransaction {
    conn: Option<PostgresConnection>,
}

impl PostgresTransaction {
    fn run<R>(&mut self, f: impl FnOnce(&mut PostgresConnection) -> Result<R>) -> Result<R> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| format_err!("transaction already finished"))?;
        tokio::task::block_in_place(|| f(conn))
    }

    fn finish(mut self: Box<Self>, statement: &str) -> Result<()> {
        let mut conn = self
            .conn
            .take()
            .ok_or_else(|| format_err!("transaction already finished"))?;
        tokio::task::block_in_place(|| Ok(conn.batch_execute(statement)?))
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = tokio::task::block_in_place(|| conn.batch_execute("ROLLBACK")) {
                warn!(error = %e, "rollback of abandoned transaction failed");
            }
        }
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn load_room(&mut self, room_id: &str) -> Result<Option<Room>> {
        self.run(|conn| query_room(conn, room_id, true))
    }

    async fn load_bidder(&mut self, bidder_id: &str) -> Result<Option<Bidder>> {
        self.run(|conn| {
            conn.query_opt(
                &format!("SELECT {BIDDER_COLUMNS} FROM bidders WHERE id = $1 FOR UPDATE"),
                &[&bidder_id],
            )?
            .as_ref()
            .map(bidder_from_row)
            .transpose()
        })
    }

    async fn next_upcoming_item(&mut self, room_id: &str) -> Result<Option<Item>> {
        self.run(|conn| {
            conn.query_opt(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM room_items WHERE room_id = $1 AND status = $2 \
                     ORDER BY position LIMIT 1 FOR UPDATE"
                ),
                &[&room_id, &ItemStatus::Upcoming.as_str()],
            )?
            .as_ref()
            .map(item_from_row)
            .transpose()
        })
    }

    async fn update_item(&mut self, item_id: &str, update: ItemUpdate) -> Result<()> {
        let (sold_price, sold_to) = match update.sale {
            Some(sale) => (Some(db_amount(sale.price)?), Some(sale.buyer)),
            None => (None, None),
        };
        self.run(|conn| {
            let updated = conn.execute(
                "UPDATE room_items SET status = $2, sold_price = $3, sold_to_bidder_id = $4 WHERE id = $1",
                &[&item_id, &update.status.as_str(), &sold_price, &sold_to],
            )?;
            if updated != 1 {
                return Err(format_err!("item {item_id} not found"));
            }
            Ok(())
        })
    }

    async fn update_bidder_budget(&mut self, bidder_id: &str, budget: Amount) -> Result<()> {
        let budget = db_amount(budget)?;
        self.run(|conn| {
            let updated = conn.execute(
                "UPDATE bidders SET budget = $2 WHERE id = $1",
                &[&bidder_id, &budget],
            )?;
            if updated != 1 {
                return Err(format_err!("bidder {bidder_id} not found"));
            }
            Ok(())
        })
    }

    async fn update_room(&mut self, room_id: &str, update: RoomUpdate) -> Result<()> {
        let status = update.status.map(RoomStatus::as_str);
        let set_item = update.current_item.is_some();
        let item = update.current_item.flatten();
        let set_standing = update.standing.is_some();
        let (highest_bid, highest_bidder) = match &update.standing {
            Some(standing) => {
                let (amount, bidder) = standing.to_mirror();
                (db_amount(amount)?, bidder.map(str::to_owned))
            }
            None => (0, None),
        };
        self.run(|conn| {
            let updated = conn.execute(
                "UPDATE auction_rooms SET \
                   status = COALESCE($2, status), \
                   current_item_id = CASE WHEN $3 THEN $4 ELSE current_item_id END, \
                   highest_bid = CASE WHEN $5 THEN $6 ELSE highest_bid END, \
                   highest_bidder_id = CASE WHEN $5 THEN $7 ELSE highest_bidder_id END \
                 WHERE id = $1",
                &[
                    &room_id,
                    &status,
                    &set_item,
                    &item,
                    &set_standing,
                    &highest_bid,
                    &highest_bidder,
                ],
            )?;
            if updated != 1 {
                return Err(format_err!("room {room_id} not found"));
            }
            Ok(())
        })
    }

    async fn insert_ownership(&mut self, ownership: Ownership) -> Result<()> {
        let price = db_amount(ownership.price)?;
        self.run(|conn| {
            conn.execute(
                "INSERT INTO ownerships (bidder_id, item_id, price) VALUES ($1, $2, $3)",
                &[&ownership.bidder_id, &ownership.item_id, &price],
            )?;
            Ok(())
        })
    }

    async fn insert_bid(&mut self, bid: NewBid) -> Result<BidRecord> {
        let amount = db_amount(bid.amount)?;
        let placed_at: DateTime<Utc> = bid.placed_at;
        let id: i64 = self.run(|conn| {
            Ok(conn
                .query_one(
                    "INSERT INTO bids (room_id, item_id, bidder_id, amount, placed_at) \
                     VALUES ($1, $2, $3, $4, $5) RETURNING id",
                    &[&bid.room_id, &bid.item_id, &bid.bidder_id, &amount, &placed_at],
                )?
                .try_get("id")?)
        })?;
        Ok(BidRecord {
            id: u64::try_from(id)?,
            room_id: bid.room_id,
            item_id: bid.item_id,
            bidder_id: bid.bidder_id,
            amount: bid.amount,
            placed_at,
        })
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.finish("COMMIT").context("commit failed")
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK")
    }
}

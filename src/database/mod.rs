pub mod db_models;

use crate::config::CONFIG;
use crate::models::{Player, Ship};
use crate::util::{now_ts, parse_ts};
use crate::{Error, Result};
use diesel::ExpressionMethods as _;
use diesel::OptionalExtension as _;
use diesel::QueryDsl as _;
use diesel::SelectableHelper as _;
use diesel::sqlite::SqliteConnection;
use diesel::upsert::excluded;
use diesel_async::AsyncConnection as _;
use diesel_async::AsyncPgConnection;
use diesel_async::RunQueryDsl as _;
use diesel_async::SimpleAsyncConnection as _;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::pooled_connection::deadpool::Pool;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use log::*;
use std::sync::Arc;
use std::time::Duration;

/// Waiting on a connection (pool checkout or the single sqlite writer) is
/// bounded so a stuck consumer can't wedge the whole daemon.
pub(crate) const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) enum Backend {
    Postgres(Pool<AsyncPgConnection>),
    // sqlite is a single-writer database, so one wrapped connection behind an
    // async mutex serialises access instead of a pool
    Sqlite(tokio::sync::Mutex<SyncConnectionWrapper<SqliteConnection>>),
}

/// Runs a read-only query block against whichever backend is configured.
/// The block is expanded once per backend so the same diesel DSL type-checks
/// against both.
macro_rules! with_conn {
    ($self:expr, $conn:ident => $body:block) => {
        match $self.backend.as_ref() {
            $crate::database::Backend::Postgres(pool) => {
                let mut pooled =
                    tokio::time::timeout($crate::database::CONNECTION_TIMEOUT, pool.get())
                        .await
                        .map_err(|_| {
                            $crate::Error::Database(
                                "timed out waiting for a database connection".to_string(),
                            )
                        })?
                        .map_err(|e| $crate::Error::Database(e.to_string()))?;
                let $conn = &mut *pooled;
                $body
            }
            $crate::database::Backend::Sqlite(mutex) => {
                let mut guard =
                    tokio::time::timeout($crate::database::CONNECTION_TIMEOUT, mutex.lock())
                        .await
                        .map_err(|_| {
                            $crate::Error::Database(
                                "timed out waiting for a database connection".to_string(),
                            )
                        })?;
                let $conn = &mut *guard;
                $body
            }
        }
    };
}

/// Runs a read-write block inside a transaction: commit on clean exit, roll
/// back on any error, connection released either way.
macro_rules! with_txn {
    ($self:expr, $conn:ident => $body:block) => {
        match $self.backend.as_ref() {
            $crate::database::Backend::Postgres(pool) => {
                let mut pooled =
                    tokio::time::timeout($crate::database::CONNECTION_TIMEOUT, pool.get())
                        .await
                        .map_err(|_| {
                            $crate::Error::Database(
                                "timed out waiting for a database connection".to_string(),
                            )
                        })?
                        .map_err(|e| $crate::Error::Database(e.to_string()))?;
                pooled
                    .transaction::<_, $crate::Error, _>(|$conn| {
                        async move { $body }.scope_boxed()
                    })
                    .await
            }
            $crate::database::Backend::Sqlite(mutex) => {
                let mut guard =
                    tokio::time::timeout($crate::database::CONNECTION_TIMEOUT, mutex.lock())
                        .await
                        .map_err(|_| {
                            $crate::Error::Database(
                                "timed out waiting for a database connection".to_string(),
                            )
                        })?;
                guard
                    .transaction::<_, $crate::Error, _>(|$conn| {
                        async move { $body }.scope_boxed()
                    })
                    .await
            }
        }
    };
}

pub(crate) use {with_conn, with_txn};

mod assignments;
mod containers;
mod contracts;
mod experiments;
mod markets;
mod waypoints;
mod work_queue;

pub use assignments::{AssignmentInfo, STATUS_ACTIVE, STATUS_IDLE};
pub use containers::LogDeduper;
pub use experiments::ExperimentTransaction;
pub use markets::trade_good_from_row;
pub use work_queue::{
    MarketPair, STATUS_CLAIMED, STATUS_COMPLETED, STATUS_FAILED, STATUS_PENDING,
};

#[derive(Clone)]
pub struct DbClient {
    pub(crate) backend: Arc<Backend>,
    pub(crate) log_deduper: Arc<LogDeduper>,
}

impl DbClient {
    /// Backend selection: a postgres `DATABASE_URL` means the remote backend,
    /// anything else falls back to a local sqlite file.
    pub async fn connect() -> Result<DbClient> {
        match &CONFIG.database_url {
            Some(url) if CONFIG.use_postgres() => Self::connect_postgres(url).await,
            _ => Self::connect_sqlite(&CONFIG.storage_path).await,
        }
    }

    pub async fn connect_postgres(database_url: &str) -> Result<DbClient> {
        info!("Using postgres backend");
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder(manager)
            .max_size(5)
            .build()
            .map_err(|e| Error::Database(e.to_string()))?;
        let db = DbClient {
            backend: Arc::new(Backend::Postgres(pool)),
            log_deduper: Arc::new(LogDeduper::new()),
        };
        db.run_migrations(include_str!("schema_postgres.sql")).await?;
        Ok(db)
    }

    pub async fn connect_sqlite(path: &str) -> Result<DbClient> {
        info!("Using sqlite backend at {}", path);
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = SyncConnectionWrapper::<SqliteConnection>::establish(path).await?;
        let db = DbClient {
            backend: Arc::new(Backend::Sqlite(tokio::sync::Mutex::new(conn))),
            log_deduper: Arc::new(LogDeduper::new()),
        };
        db.run_migrations(include_str!("schema_sqlite.sql")).await?;
        Ok(db)
    }

    /// In-memory sqlite database, for tests.
    pub async fn connect_in_memory() -> Result<DbClient> {
        Self::connect_sqlite(":memory:").await
    }

    /// Idempotent schema setup: create-if-missing DDL followed by
    /// column-addition probes whose failures mean the column already exists.
    async fn run_migrations(&self, ddl: &str) -> Result<()> {
        with_conn!(self, conn => {
            conn.batch_execute(ddl).await?;
            let probes = [
                "ALTER TABLE containers ADD COLUMN command_type TEXT NOT NULL DEFAULT ''",
                "ALTER TABLE containers ADD COLUMN exit_reason TEXT",
                "ALTER TABLE experiment_work_queue ADD COLUMN error_message TEXT",
                "ALTER TABLE market_experiments ADD COLUMN minutes_since_last_trade DOUBLE PRECISION",
            ];
            for probe in probes {
                if conn.batch_execute(probe).await.is_ok() {
                    debug!("migration applied: {}", probe);
                }
            }
            Ok::<_, Error>(())
        })
    }
}

/// Players
impl DbClient {
    pub async fn upsert_player(&self, agent_symbol: &str, token: &str) -> Result<Player> {
        use crate::schema::players;
        let created_at = now_ts();
        with_conn!(self, conn => {
            diesel::insert_into(players::table)
                .values(db_models::NewPlayer {
                    agent_symbol,
                    token,
                    created_at: &created_at,
                    credits: 0,
                })
                .on_conflict(players::agent_symbol)
                .do_update()
                .set(players::token.eq(token))
                .execute(conn)
                .await?;
            Ok::<_, Error>(())
        })?;
        self.find_player_by_agent(agent_symbol)
            .await?
            .ok_or_else(|| Error::NotFound(format!("player {}", agent_symbol)))
    }

    pub async fn find_player(&self, player_id: i64) -> Result<Option<Player>> {
        use crate::schema::players;
        let row: Option<db_models::PlayerRow> = with_conn!(self, conn => {
            players::table
                .filter(players::id.eq(player_id))
                .select(db_models::PlayerRow::as_select())
                .first(conn)
                .await
                .optional()
                .map_err(Error::from)
        })?;
        Ok(row.map(player_from_row))
    }

    pub async fn find_player_by_agent(&self, agent_symbol: &str) -> Result<Option<Player>> {
        use crate::schema::players;
        let row: Option<db_models::PlayerRow> = with_conn!(self, conn => {
            players::table
                .filter(players::agent_symbol.eq(agent_symbol))
                .select(db_models::PlayerRow::as_select())
                .first(conn)
                .await
                .optional()
                .map_err(Error::from)
        })?;
        Ok(row.map(player_from_row))
    }

    pub async fn list_players(&self) -> Result<Vec<Player>> {
        use crate::schema::players;
        let rows: Vec<db_models::PlayerRow> = with_conn!(self, conn => {
            players::table
                .order(players::id.asc())
                .select(db_models::PlayerRow::as_select())
                .load(conn)
                .await
                .map_err(Error::from)
        })?;
        Ok(rows.into_iter().map(player_from_row).collect())
    }

    pub async fn touch_player(&self, player_id: i64) -> Result<()> {
        use crate::schema::players;
        let ts = now_ts();
        with_conn!(self, conn => {
            diesel::update(players::table.filter(players::id.eq(player_id)))
                .set(players::last_active.eq(&ts))
                .execute(conn)
                .await?;
            Ok(())
        })
    }

    /// Cached display-only mirror; the remote agent stays authoritative.
    pub async fn update_player_credits(&self, player_id: i64, credits: i64) -> Result<()> {
        use crate::schema::players;
        with_conn!(self, conn => {
            diesel::update(players::table.filter(players::id.eq(player_id)))
                .set(players::credits.eq(credits))
                .execute(conn)
                .await?;
            Ok(())
        })
    }
}

/// Ship cache. Ships are fetched from the remote per read; these rows exist
/// for convenience lookups only (existence checks, listings).
impl DbClient {
    pub async fn save_ship(&self, player_id: i64, ship: &Ship) -> Result<()> {
        use crate::schema::ships;
        let cargo_json = serde_json::to_string(&ship.cargo)?;
        let ts = now_ts();
        with_conn!(self, conn => {
            diesel::insert_into(ships::table)
                .values((
                    ships::symbol.eq(&ship.symbol),
                    ships::player_id.eq(player_id),
                    ships::waypoint_symbol.eq(ship.nav.waypoint_symbol.to_string()),
                    ships::nav_status.eq(ship.nav.status.to_string()),
                    ships::fuel_current.eq(ship.fuel.current),
                    ships::fuel_capacity.eq(ship.fuel.capacity),
                    ships::cargo_capacity.eq(ship.cargo.capacity),
                    ships::cargo_units.eq(ship.cargo.units),
                    ships::cargo.eq(&cargo_json),
                    ships::engine_speed.eq(ship.engine.speed),
                    ships::updated_at.eq(&ts),
                ))
                .on_conflict((ships::symbol, ships::player_id))
                .do_update()
                .set((
                    ships::waypoint_symbol.eq(excluded(ships::waypoint_symbol)),
                    ships::nav_status.eq(excluded(ships::nav_status)),
                    ships::fuel_current.eq(excluded(ships::fuel_current)),
                    ships::fuel_capacity.eq(excluded(ships::fuel_capacity)),
                    ships::cargo_capacity.eq(excluded(ships::cargo_capacity)),
                    ships::cargo_units.eq(excluded(ships::cargo_units)),
                    ships::cargo.eq(excluded(ships::cargo)),
                    ships::engine_speed.eq(excluded(ships::engine_speed)),
                    ships::updated_at.eq(excluded(ships::updated_at)),
                ))
                .execute(conn)
                .await?;
            Ok(())
        })
    }

    pub async fn get_cached_ship(
        &self,
        player_id: i64,
        symbol: &str,
    ) -> Result<Option<db_models::ShipRow>> {
        use crate::schema::ships;
        with_conn!(self, conn => {
            ships::table
                .filter(ships::symbol.eq(symbol))
                .filter(ships::player_id.eq(player_id))
                .select(db_models::ShipRow::as_select())
                .first(conn)
                .await
                .optional()
                .map_err(Error::from)
        })
    }

    pub async fn list_cached_ships(&self, player_id: i64) -> Result<Vec<db_models::ShipRow>> {
        use crate::schema::ships;
        with_conn!(self, conn => {
            ships::table
                .filter(ships::player_id.eq(player_id))
                .order(ships::symbol.asc())
                .select(db_models::ShipRow::as_select())
                .load(conn)
                .await
                .map_err(Error::from)
        })
    }
}

fn player_from_row(row: db_models::PlayerRow) -> Player {
    Player {
        id: row.id,
        agent_symbol: row.agent_symbol,
        token: row.token,
        created_at: parse_ts(&row.created_at).unwrap_or_default(),
        last_active: row.last_active.as_deref().and_then(parse_ts),
        credits: row.credits,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_player_round_trip() {
        let db = DbClient::connect_in_memory().await.unwrap();
        let player = db.upsert_player("AGENT_A", "token-1").await.unwrap();
        assert_eq!(player.agent_symbol, "AGENT_A");

        // token refresh keeps the same row
        let again = db.upsert_player("AGENT_A", "token-2").await.unwrap();
        assert_eq!(again.id, player.id);
        assert_eq!(again.token, "token-2");

        let listed = db.list_players().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(db.find_player(player.id).await.unwrap().is_some());
        assert!(db.find_player(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ship_cache_upsert() {
        let db = DbClient::connect_in_memory().await.unwrap();
        let mut ship: Ship = crate::ship_controller::test_support::docked_ship("TEST-1", 40, 100);
        db.save_ship(1, &ship).await.unwrap();

        ship.fuel.current = 10;
        db.save_ship(1, &ship).await.unwrap();

        let cached = db.get_cached_ship(1, "TEST-1").await.unwrap().unwrap();
        assert_eq!(cached.fuel_current, 10);
        assert_eq!(db.list_cached_ships(1).await.unwrap().len(), 1);
        assert!(db.get_cached_ship(2, "TEST-1").await.unwrap().is_none());
    }
}

//! Ship assignment registry: the database is the single arbiter of which
//! container may operate a ship. At most one `active` row can exist per
//! (ship_symbol, player_id) thanks to the table's composite primary key and
//! the check-then-upsert transaction in `assign_ship`.

use super::db_models::ShipAssignmentRow;
use super::{DbClient, with_conn, with_txn};
use crate::util::now_ts;
use crate::{Error, Result};
use diesel::ExpressionMethods as _;
use diesel::OptionalExtension as _;
use diesel::QueryDsl as _;
use diesel::SelectableHelper as _;
use diesel_async::AsyncConnection as _;
use diesel_async::RunQueryDsl as _;
use diesel_async::scoped_futures::ScopedFutureExt as _;
use log::*;

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_IDLE: &str = "idle";

#[derive(Debug, Clone)]
pub struct AssignmentInfo {
    pub ship_symbol: String,
    pub player_id: i64,
    pub container_id: String,
    pub operation: String,
    pub status: String,
    pub release_reason: Option<String>,
}

impl From<ShipAssignmentRow> for AssignmentInfo {
    fn from(row: ShipAssignmentRow) -> Self {
        AssignmentInfo {
            ship_symbol: row.ship_symbol,
            player_id: row.player_id,
            container_id: row.container_id,
            operation: row.operation,
            status: row.status,
            release_reason: row.release_reason,
        }
    }
}

impl DbClient {
    /// Claim a ship for a container. Returns false without touching the row
    /// when the ship already has an active assignment.
    pub async fn assign_ship(
        &self,
        player_id: i64,
        ship_symbol: &str,
        container_id: &str,
        operation: &str,
    ) -> Result<bool> {
        use crate::schema::ship_assignments as sa;
        let assigned_at = now_ts();
        let assigned = with_txn!(self, conn => {
            let current: Option<(String, String)> = sa::table
                .filter(sa::ship_symbol.eq(ship_symbol))
                .filter(sa::player_id.eq(player_id))
                .select((sa::status, sa::container_id))
                .first(conn)
                .await
                .optional()?;

            if let Some((status, holder)) = current {
                if status == STATUS_ACTIVE {
                    warn!("Ship {} already assigned to {}", ship_symbol, holder);
                    return Ok(false);
                }
            }

            diesel::insert_into(sa::table)
                .values((
                    sa::ship_symbol.eq(ship_symbol),
                    sa::player_id.eq(player_id),
                    sa::container_id.eq(container_id),
                    sa::operation.eq(operation),
                    sa::status.eq(STATUS_ACTIVE),
                    sa::assigned_at.eq(&assigned_at),
                ))
                .on_conflict((sa::ship_symbol, sa::player_id))
                .do_update()
                .set((
                    sa::container_id.eq(container_id),
                    sa::operation.eq(operation),
                    sa::status.eq(STATUS_ACTIVE),
                    sa::assigned_at.eq(&assigned_at),
                    sa::released_at.eq(None::<String>),
                    sa::release_reason.eq(None::<String>),
                ))
                .execute(conn)
                .await?;
            Ok(true)
        })?;
        if assigned {
            info!("Assigned {} to {}", ship_symbol, container_id);
        }
        Ok(assigned)
    }

    pub async fn release_ship(
        &self,
        player_id: i64,
        ship_symbol: &str,
        reason: &str,
    ) -> Result<()> {
        use crate::schema::ship_assignments as sa;
        let released_at = now_ts();
        with_conn!(self, conn => {
            diesel::update(
                sa::table
                    .filter(sa::ship_symbol.eq(ship_symbol))
                    .filter(sa::player_id.eq(player_id)),
            )
            .set((
                sa::status.eq(STATUS_IDLE),
                sa::released_at.eq(&released_at),
                sa::release_reason.eq(reason),
            ))
            .execute(conn)
            .await?;
            Ok::<_, Error>(())
        })?;
        info!("Released {}: {}", ship_symbol, reason);
        Ok(())
    }

    pub async fn check_ship_available(&self, player_id: i64, ship_symbol: &str) -> Result<bool> {
        use crate::schema::ship_assignments as sa;
        let status: Option<String> = with_conn!(self, conn => {
            sa::table
                .filter(sa::ship_symbol.eq(ship_symbol))
                .filter(sa::player_id.eq(player_id))
                .select(sa::status)
                .first(conn)
                .await
                .optional()
                .map_err(Error::from)
        })?;
        Ok(status.as_deref() != Some(STATUS_ACTIVE))
    }

    pub async fn get_assignment(
        &self,
        player_id: i64,
        ship_symbol: &str,
    ) -> Result<Option<AssignmentInfo>> {
        use crate::schema::ship_assignments as sa;
        let row: Option<ShipAssignmentRow> = with_conn!(self, conn => {
            sa::table
                .filter(sa::ship_symbol.eq(ship_symbol))
                .filter(sa::player_id.eq(player_id))
                .select(ShipAssignmentRow::as_select())
                .first(conn)
                .await
                .optional()
                .map_err(Error::from)
        })?;
        Ok(row.map(AssignmentInfo::from))
    }

    /// Conditional handover that only succeeds while the ship is still held
    /// by `old_container_id`; used when a restart mints a new container id.
    pub async fn reassign_ship(
        &self,
        player_id: i64,
        ship_symbol: &str,
        old_container_id: &str,
        new_container_id: &str,
    ) -> Result<bool> {
        use crate::schema::ship_assignments as sa;
        let assigned_at = now_ts();
        let updated = with_conn!(self, conn => {
            diesel::update(
                sa::table
                    .filter(sa::ship_symbol.eq(ship_symbol))
                    .filter(sa::player_id.eq(player_id))
                    .filter(sa::container_id.eq(old_container_id)),
            )
            .set((
                sa::container_id.eq(new_container_id),
                sa::status.eq(STATUS_ACTIVE),
                sa::assigned_at.eq(&assigned_at),
                sa::released_at.eq(None::<String>),
                sa::release_reason.eq(None::<String>),
            ))
            .execute(conn)
            .await
            .map_err(Error::from)
        })?;
        if updated > 0 {
            info!(
                "Reassigned {} from {} to {}",
                ship_symbol, old_container_id, new_container_id
            );
        } else {
            warn!(
                "Failed to reassign {}: not assigned to {}",
                ship_symbol, old_container_id
            );
        }
        Ok(updated > 0)
    }

    /// Startup zombie sweep: any assignment still active belongs to a
    /// previous daemon instance. Returns the number released.
    pub async fn release_all_active_assignments(&self, reason: &str) -> Result<usize> {
        use crate::schema::ship_assignments as sa;
        let released_at = now_ts();
        let count = with_conn!(self, conn => {
            diesel::update(sa::table.filter(sa::status.eq(STATUS_ACTIVE)))
                .set((
                    sa::status.eq(STATUS_IDLE),
                    sa::released_at.eq(&released_at),
                    sa::release_reason.eq(reason),
                ))
                .execute(conn)
                .await
                .map_err(Error::from)
        })?;
        if count > 0 {
            info!("Released {} zombie assignment(s) on daemon startup", count);
        }
        Ok(count)
    }

    pub async fn get_all_active_assignments(&self) -> Result<Vec<AssignmentInfo>> {
        use crate::schema::ship_assignments as sa;
        let rows: Vec<ShipAssignmentRow> = with_conn!(self, conn => {
            sa::table
                .filter(sa::status.eq(STATUS_ACTIVE))
                .select(ShipAssignmentRow::as_select())
                .load(conn)
                .await
                .map_err(Error::from)
        })?;
        Ok(rows.into_iter().map(AssignmentInfo::from).collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_assign_is_mutually_exclusive() {
        let db = DbClient::connect_in_memory().await.unwrap();
        assert!(db.assign_ship(1, "SHIP-1", "c1", "navigation").await.unwrap());
        // second claim while active is refused
        assert!(!db.assign_ship(1, "SHIP-1", "c2", "navigation").await.unwrap());
        assert!(!db.check_ship_available(1, "SHIP-1").await.unwrap());

        // same symbol for another player is independent
        assert!(db.assign_ship(2, "SHIP-1", "c3", "navigation").await.unwrap());

        db.release_ship(1, "SHIP-1", "stopped").await.unwrap();
        assert!(db.check_ship_available(1, "SHIP-1").await.unwrap());
        assert!(db.assign_ship(1, "SHIP-1", "c2", "navigation").await.unwrap());

        let info = db.get_assignment(1, "SHIP-1").await.unwrap().unwrap();
        assert_eq!(info.container_id, "c2");
        assert_eq!(info.status, STATUS_ACTIVE);
    }

    #[tokio::test]
    async fn test_zombie_sweep_on_startup() {
        let db = DbClient::connect_in_memory().await.unwrap();
        db.assign_ship(1, "SHIP-1", "ghost", "navigation").await.unwrap();
        db.assign_ship(1, "SHIP-2", "ghost", "scouting").await.unwrap();

        let released = db.release_all_active_assignments("daemon_restart").await.unwrap();
        assert_eq!(released, 2);

        let info = db.get_assignment(1, "SHIP-1").await.unwrap().unwrap();
        assert_eq!(info.status, STATUS_IDLE);
        assert_eq!(info.release_reason.as_deref(), Some("daemon_restart"));
        assert!(db.get_all_active_assignments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reassign_requires_current_holder() {
        let db = DbClient::connect_in_memory().await.unwrap();
        db.assign_ship(1, "SHIP-1", "old", "navigation").await.unwrap();

        assert!(!db.reassign_ship(1, "SHIP-1", "wrong", "new").await.unwrap());
        assert!(db.reassign_ship(1, "SHIP-1", "old", "new").await.unwrap());

        let info = db.get_assignment(1, "SHIP-1").await.unwrap().unwrap();
        assert_eq!(info.container_id, "new");
    }
}

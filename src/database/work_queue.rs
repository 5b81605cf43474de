//! Distributed work queue for market experiments. Claims use a
//! compare-and-swap update guarded on PENDING status inside a transaction, so
//! at most one worker ever observes each pair.

use super::db_models::WorkQueueRow;
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
use std::collections::BTreeMap;

pub const STATUS_PENDING: &str = "PENDING";
pub const STATUS_CLAIMED: &str = "CLAIMED";
pub const STATUS_COMPLETED: &str = "COMPLETED";
pub const STATUS_FAILED: &str = "FAILED";

/// One buy/sell market pair to test for a good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketPair {
    pub queue_id: i64,
    pub pair_id: String,
    pub good_symbol: String,
    pub buy_market: String,
    pub sell_market: String,
}

impl DbClient {
    /// Bulk insert all pairs as PENDING.
    pub async fn enqueue_pairs(
        &self,
        run_id: &str,
        player_id: i64,
        pairs: &[(String, String, String, String)],
    ) -> Result<usize> {
        use crate::schema::experiment_work_queue as wq;
        if pairs.is_empty() {
            return Ok(0);
        }
        let created_at = now_ts();
        let inserts: Vec<_> = pairs
            .iter()
            .map(|(pair_id, good_symbol, buy_market, sell_market)| {
                (
                    wq::run_id.eq(run_id),
                    wq::player_id.eq(player_id),
                    wq::pair_id.eq(pair_id),
                    wq::good_symbol.eq(good_symbol),
                    wq::buy_market.eq(buy_market),
                    wq::sell_market.eq(sell_market),
                    wq::status.eq(STATUS_PENDING),
                    wq::attempts.eq(0),
                    wq::created_at.eq(&created_at),
                )
            })
            .collect();
        with_conn!(self, conn => {
            diesel::insert_into(wq::table)
                .values(&inserts)
                .execute(conn)
                .await
                .map_err(Error::from)
        })
    }

    /// Atomically claim the oldest PENDING pair for the run (FIFO by
    /// queue_id). Returns None when the queue is drained.
    pub async fn claim_next_pair(
        &self,
        run_id: &str,
        ship_symbol: &str,
    ) -> Result<Option<MarketPair>> {
        use crate::schema::experiment_work_queue as wq;
        loop {
            let claimed_at = now_ts();
            let claimed = with_txn!(self, conn => {
                let row: Option<WorkQueueRow> = wq::table
                    .filter(wq::run_id.eq(run_id))
                    .filter(wq::status.eq(STATUS_PENDING))
                    .order(wq::queue_id.asc())
                    .select(WorkQueueRow::as_select())
                    .first(conn)
                    .await
                    .optional()?;

                let Some(row) = row else {
                    return Ok(None);
                };

                // guard on PENDING so a concurrent claimant loses the race
                // instead of double-claiming
                let updated = diesel::update(
                    wq::table
                        .filter(wq::queue_id.eq(row.queue_id))
                        .filter(wq::status.eq(STATUS_PENDING)),
                )
                .set((
                    wq::status.eq(STATUS_CLAIMED),
                    wq::claimed_by.eq(ship_symbol),
                    wq::claimed_at.eq(&claimed_at),
                    wq::attempts.eq(wq::attempts + 1),
                ))
                .execute(conn)
                .await?;

                if updated == 1 {
                    Ok(Some(MarketPair {
                        queue_id: row.queue_id,
                        pair_id: row.pair_id,
                        good_symbol: row.good_symbol,
                        buy_market: row.buy_market,
                        sell_market: row.sell_market,
                    }))
                } else {
                    Ok(None)
                }
            })?;
            match claimed {
                Some(pair) => return Ok(Some(pair)),
                None => {
                    // lost the race; check whether anything is left
                    let remaining: i64 = with_conn!(self, conn => {
                        wq::table
                            .filter(wq::run_id.eq(run_id))
                            .filter(wq::status.eq(STATUS_PENDING))
                            .count()
                            .get_result(conn)
                            .await
                            .map_err(Error::from)
                    })?;
                    if remaining == 0 {
                        return Ok(None);
                    }
                }
            }
        }
    }

    pub async fn mark_pair_complete(&self, queue_id: i64) -> Result<()> {
        use crate::schema::experiment_work_queue as wq;
        let completed_at = now_ts();
        with_conn!(self, conn => {
            diesel::update(wq::table.filter(wq::queue_id.eq(queue_id)))
                .set((
                    wq::status.eq(STATUS_COMPLETED),
                    wq::completed_at.eq(&completed_at),
                ))
                .execute(conn)
                .await?;
            Ok(())
        })
    }

    pub async fn mark_pair_failed(&self, queue_id: i64, error: &str) -> Result<()> {
        use crate::schema::experiment_work_queue as wq;
        let completed_at = now_ts();
        with_conn!(self, conn => {
            diesel::update(wq::table.filter(wq::queue_id.eq(queue_id)))
                .set((
                    wq::status.eq(STATUS_FAILED),
                    wq::error_message.eq(error),
                    wq::completed_at.eq(&completed_at),
                ))
                .execute(conn)
                .await?;
            Ok(())
        })
    }

    /// status -> count for a run
    pub async fn get_queue_status(&self, run_id: &str) -> Result<BTreeMap<String, i64>> {
        use crate::schema::experiment_work_queue as wq;
        let rows: Vec<(String, i64)> = with_conn!(self, conn => {
            wq::table
                .filter(wq::run_id.eq(run_id))
                .group_by(wq::status)
                .select((wq::status, diesel::dsl::count_star()))
                .load(conn)
                .await
                .map_err(Error::from)
        })?;
        Ok(rows.into_iter().collect())
    }

    /// ship -> completed pair count for a run
    pub async fn get_ship_progress(&self, run_id: &str) -> Result<BTreeMap<String, i64>> {
        use crate::schema::experiment_work_queue as wq;
        let rows: Vec<(Option<String>, i64)> = with_conn!(self, conn => {
            wq::table
                .filter(wq::run_id.eq(run_id))
                .filter(wq::status.eq(STATUS_COMPLETED))
                .group_by(wq::claimed_by)
                .select((wq::claimed_by, diesel::dsl::count_star()))
                .load(conn)
                .await
                .map_err(Error::from)
        })?;
        Ok(rows
            .into_iter()
            .filter_map(|(ship, count)| ship.map(|s| (s, count)))
            .collect())
    }
}

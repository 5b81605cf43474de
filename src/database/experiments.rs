use super::{DbClient, with_conn};
use crate::util::{format_ts, parse_ts};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use diesel::ExpressionMethods as _;
use diesel::OptionalExtension as _;
use diesel::QueryDsl as _;
use diesel::SelectableHelper as _;
use diesel_async::RunQueryDsl as _;

/// Dense record of one experiment BUY or SELL, capturing market state on
/// both sides of the trade.
#[derive(Debug, Clone)]
pub struct ExperimentTransaction {
    pub run_id: String,
    pub player_id: i64,
    pub ship_symbol: String,
    pub pair_id: String,
    pub good_symbol: String,
    pub buy_market: String,
    pub sell_market: String,
    pub operation: String,
    pub iteration: i32,
    pub batch_size_fraction: f64,
    pub units: i64,
    pub price_per_unit: i64,
    pub total_credits: i64,
    pub supply_before: String,
    pub activity_before: Option<String>,
    pub trade_volume_before: i64,
    pub price_before: i64,
    pub supply_after: String,
    pub price_after: i64,
    pub supply_change: String,
    pub price_impact_percent: f64,
    pub ship_cargo_capacity: i64,
    pub ship_cargo_used: i64,
    pub minutes_since_last_trade: Option<f64>,
    pub market_poll_timestamp: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl DbClient {
    pub async fn record_experiment_transaction(
        &self,
        tx: &ExperimentTransaction,
    ) -> Result<()> {
        use crate::schema::market_experiments as me;
        let market_poll_timestamp = format_ts(tx.market_poll_timestamp);
        let timestamp = format_ts(tx.timestamp);
        with_conn!(self, conn => {
            diesel::insert_into(me::table)
                .values((
                    me::run_id.eq(&tx.run_id),
                    me::player_id.eq(tx.player_id),
                    me::ship_symbol.eq(&tx.ship_symbol),
                    me::pair_id.eq(&tx.pair_id),
                    me::good_symbol.eq(&tx.good_symbol),
                    me::buy_market.eq(&tx.buy_market),
                    me::sell_market.eq(&tx.sell_market),
                    me::operation.eq(&tx.operation),
                    me::iteration.eq(tx.iteration),
                    me::batch_size_fraction.eq(tx.batch_size_fraction),
                    me::units.eq(tx.units),
                    me::price_per_unit.eq(tx.price_per_unit),
                    me::total_credits.eq(tx.total_credits),
                    me::supply_before.eq(&tx.supply_before),
                    me::activity_before.eq(tx.activity_before.as_deref()),
                    me::trade_volume_before.eq(tx.trade_volume_before),
                    me::price_before.eq(tx.price_before),
                    me::supply_after.eq(&tx.supply_after),
                    me::price_after.eq(tx.price_after),
                    me::supply_change.eq(&tx.supply_change),
                    me::price_impact_percent.eq(tx.price_impact_percent),
                    me::ship_cargo_capacity.eq(tx.ship_cargo_capacity),
                    me::ship_cargo_used.eq(tx.ship_cargo_used),
                    me::minutes_since_last_trade.eq(tx.minutes_since_last_trade),
                    me::market_poll_timestamp.eq(&market_poll_timestamp),
                    me::timestamp.eq(&timestamp),
                ))
                .execute(conn)
                .await?;
            Ok(())
        })
    }

    /// Most recent experiment trade on (market, good, operation) for this
    /// player, used to derive time-since-last-trade.
    pub async fn last_experiment_timestamp(
        &self,
        player_id: i64,
        market: &str,
        good_symbol: &str,
        operation: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        use crate::schema::market_experiments as me;
        let ts: Option<String> = with_conn!(self, conn => {
            let mut query = me::table
                .filter(me::player_id.eq(player_id))
                .filter(me::good_symbol.eq(good_symbol))
                .filter(me::operation.eq(operation))
                .into_boxed();
            query = if operation == "BUY" {
                query.filter(me::buy_market.eq(market))
            } else {
                query.filter(me::sell_market.eq(market))
            };
            query
                .order(me::timestamp.desc())
                .select(me::timestamp)
                .first(conn)
                .await
                .optional()
                .map_err(Error::from)
        })?;
        Ok(ts.as_deref().and_then(parse_ts))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tx(operation: &str, market: &str, ts: DateTime<Utc>) -> ExperimentTransaction {
        ExperimentTransaction {
            run_id: "run-1".to_string(),
            player_id: 1,
            ship_symbol: "SHIP-1".to_string(),
            pair_id: "IRON_ORE:A:B".to_string(),
            good_symbol: "IRON_ORE".to_string(),
            buy_market: if operation == "BUY" { market.to_string() } else { "X1-S1-A1".to_string() },
            sell_market: if operation == "SELL" { market.to_string() } else { "X1-S1-B1".to_string() },
            operation: operation.to_string(),
            iteration: 1,
            batch_size_fraction: 0.25,
            units: 10,
            price_per_unit: 25,
            total_credits: 250,
            supply_before: "MODERATE".to_string(),
            activity_before: Some("WEAK".to_string()),
            trade_volume_before: 100,
            price_before: 25,
            supply_after: "LIMITED".to_string(),
            price_after: 27,
            supply_change: "MODERATE→LIMITED".to_string(),
            price_impact_percent: 8.0,
            ship_cargo_capacity: 40,
            ship_cargo_used: 10,
            minutes_since_last_trade: None,
            market_poll_timestamp: ts,
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_last_experiment_timestamp() {
        let db = DbClient::connect_in_memory().await.unwrap();
        let t1 = Utc::now() - chrono::Duration::minutes(30);
        let t2 = Utc::now() - chrono::Duration::minutes(5);
        db.record_experiment_transaction(&tx("BUY", "X1-S1-A1", t1))
            .await
            .unwrap();
        db.record_experiment_transaction(&tx("BUY", "X1-S1-A1", t2))
            .await
            .unwrap();

        let last = db
            .last_experiment_timestamp(1, "X1-S1-A1", "IRON_ORE", "BUY")
            .await
            .unwrap()
            .unwrap();
        assert!((last - t2).num_seconds().abs() < 1);

        // different operation on the same market is tracked separately
        assert!(
            db.last_experiment_timestamp(1, "X1-S1-A1", "IRON_ORE", "SELL")
                .await
                .unwrap()
                .is_none()
        );
    }
}

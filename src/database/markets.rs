use super::db_models::MarketDataRow;
use super::{DbClient, with_conn};
use crate::models::{Market, MarketTradeGood, WaypointSymbol};
use crate::util::now_ts;
use crate::{Error, Result};
use diesel::ExpressionMethods as _;
use diesel::OptionalExtension as _;
use diesel::QueryDsl as _;
use diesel::SelectableHelper as _;
use diesel::TextExpressionMethods as _;
use diesel::upsert::excluded;
use diesel_async::RunQueryDsl as _;
use std::collections::BTreeMap;

/// Market data store.
///
/// The column polarity is frozen and intentionally the inverse of the remote
/// field names: persisted `purchase_price` is what the market pays when the
/// ship sells (remote `sellPrice`), persisted `sell_price` is what the market
/// charges when the ship buys (remote `purchasePrice`).
impl DbClient {
    pub async fn update_market_data(&self, market: &Market) -> Result<()> {
        use crate::schema::market_data as md;
        let waypoint = market.symbol.to_string();
        let ts = now_ts();
        with_conn!(self, conn => {
            for good in &market.trade_goods {
                diesel::insert_into(md::table)
                    .values((
                        md::waypoint_symbol.eq(&waypoint),
                        md::good_symbol.eq(&good.symbol),
                        md::supply.eq(&good.supply),
                        md::activity.eq(good.activity.as_deref()),
                        md::purchase_price.eq(good.sell_price),
                        md::sell_price.eq(good.purchase_price),
                        md::trade_volume.eq(good.trade_volume),
                        md::updated_at.eq(&ts),
                    ))
                    .on_conflict((md::waypoint_symbol, md::good_symbol))
                    .do_update()
                    .set((
                        md::supply.eq(excluded(md::supply)),
                        md::activity.eq(excluded(md::activity)),
                        md::purchase_price.eq(excluded(md::purchase_price)),
                        md::sell_price.eq(excluded(md::sell_price)),
                        md::trade_volume.eq(excluded(md::trade_volume)),
                        md::updated_at.eq(excluded(md::updated_at)),
                    ))
                    .execute(conn)
                    .await?;
            }
            Ok(())
        })
    }

    pub async fn get_market_data(
        &self,
        waypoint_symbol: &WaypointSymbol,
    ) -> Result<Vec<MarketDataRow>> {
        use crate::schema::market_data as md;
        with_conn!(self, conn => {
            md::table
                .filter(md::waypoint_symbol.eq(waypoint_symbol.to_string()))
                .order(md::good_symbol.asc())
                .select(MarketDataRow::as_select())
                .load(conn)
                .await
                .map_err(Error::from)
        })
    }

    /// All cached market rows in a system, grouped by waypoint.
    pub async fn list_markets_in_system(
        &self,
        system_prefix: &str,
    ) -> Result<BTreeMap<WaypointSymbol, Vec<MarketDataRow>>> {
        use crate::schema::market_data as md;
        let pattern = format!("{}-%", system_prefix);
        let rows: Vec<MarketDataRow> = with_conn!(self, conn => {
            md::table
                .filter(md::waypoint_symbol.like(&pattern))
                .select(MarketDataRow::as_select())
                .load(conn)
                .await
                .map_err(Error::from)
        })?;
        let mut markets: BTreeMap<WaypointSymbol, Vec<MarketDataRow>> = BTreeMap::new();
        for row in rows {
            markets
                .entry(WaypointSymbol(row.waypoint_symbol.clone()))
                .or_default()
                .push(row);
        }
        Ok(markets)
    }

    /// Cheapest market in the system where the ship can buy `good_symbol`
    /// (lowest persisted sell_price, i.e. what the ship pays).
    pub async fn find_cheapest_market_selling(
        &self,
        system_prefix: &str,
        good_symbol: &str,
    ) -> Result<Option<(WaypointSymbol, i64, i64)>> {
        use crate::schema::market_data as md;
        let pattern = format!("{}-%", system_prefix);
        let row: Option<MarketDataRow> = with_conn!(self, conn => {
            md::table
                .filter(md::waypoint_symbol.like(&pattern))
                .filter(md::good_symbol.eq(good_symbol))
                .order(md::sell_price.asc())
                .select(MarketDataRow::as_select())
                .first(conn)
                .await
                .optional()
                .map_err(Error::from)
        })?;
        Ok(row.map(|r| (WaypointSymbol(r.waypoint_symbol), r.sell_price, r.trade_volume)))
    }

    /// The per-transaction unit ceiling for a good at a market.
    pub async fn get_trade_volume(
        &self,
        waypoint_symbol: &WaypointSymbol,
        good_symbol: &str,
    ) -> Result<Option<i64>> {
        use crate::schema::market_data as md;
        with_conn!(self, conn => {
            md::table
                .filter(md::waypoint_symbol.eq(waypoint_symbol.to_string()))
                .filter(md::good_symbol.eq(good_symbol))
                .select(md::trade_volume)
                .first(conn)
                .await
                .optional()
                .map_err(Error::from)
        })
    }
}

pub fn trade_good_from_row(row: &MarketDataRow) -> MarketTradeGood {
    MarketTradeGood {
        symbol: row.good_symbol.clone(),
        trade_volume: row.trade_volume,
        trade_type: "EXCHANGE".to_string(),
        supply: row.supply.clone(),
        activity: row.activity.clone(),
        // restore the remote polarity when reading back
        purchase_price: row.sell_price,
        sell_price: row.purchase_price,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn market(symbol: &str, good: &str, purchase_price: i64, sell_price: i64) -> Market {
        Market {
            symbol: WaypointSymbol::new(symbol),
            trade_goods: vec![MarketTradeGood {
                symbol: good.to_string(),
                trade_volume: 100,
                trade_type: "EXCHANGE".to_string(),
                supply: "MODERATE".to_string(),
                activity: Some("WEAK".to_string()),
                purchase_price,
                sell_price,
            }],
        }
    }

    #[tokio::test]
    async fn test_price_polarity_is_swapped_in_store() {
        let db = DbClient::connect_in_memory().await.unwrap();
        // remote: ship pays 25 to buy, receives 22 when selling
        db.update_market_data(&market("X1-S1-A1", "IRON_ORE", 25, 22))
            .await
            .unwrap();

        let rows = db
            .get_market_data(&WaypointSymbol::new("X1-S1-A1"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        // persisted sell_price = what the ship pays; purchase_price = what it receives
        assert_eq!(rows[0].sell_price, 25);
        assert_eq!(rows[0].purchase_price, 22);

        // reading back restores the remote view
        let good = trade_good_from_row(&rows[0]);
        assert_eq!(good.purchase_price, 25);
        assert_eq!(good.sell_price, 22);
    }

    #[tokio::test]
    async fn test_cheapest_market_uses_buy_cost() {
        let db = DbClient::connect_in_memory().await.unwrap();
        db.update_market_data(&market("X1-S1-A1", "IRON_ORE", 25, 22))
            .await
            .unwrap();
        db.update_market_data(&market("X1-S1-B1", "IRON_ORE", 18, 15))
            .await
            .unwrap();

        let (waypoint, buy_cost, volume) = db
            .find_cheapest_market_selling("X1-S1", "IRON_ORE")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(waypoint, WaypointSymbol::new("X1-S1-B1"));
        assert_eq!(buy_cost, 18);
        assert_eq!(volume, 100);

        let markets = db.list_markets_in_system("X1-S1").await.unwrap();
        assert_eq!(markets.len(), 2);
    }

    #[tokio::test]
    async fn test_upsert_replaces_prices() {
        let db = DbClient::connect_in_memory().await.unwrap();
        db.update_market_data(&market("X1-S1-A1", "IRON_ORE", 25, 22))
            .await
            .unwrap();
        db.update_market_data(&market("X1-S1-A1", "IRON_ORE", 30, 27))
            .await
            .unwrap();

        let rows = db
            .get_market_data(&WaypointSymbol::new("X1-S1-A1"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sell_price, 30);
        assert_eq!(
            db.get_trade_volume(&WaypointSymbol::new("X1-S1-A1"), "IRON_ORE")
                .await
                .unwrap(),
            Some(100)
        );
    }
}

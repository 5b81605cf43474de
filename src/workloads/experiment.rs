//! Market liquidity experiments: a coordinator enqueues (good, buy market,
//! sell market) pairs, and one worker per ship drains the queue, recording
//! dense before/after market state around every trade.

use super::{WorkloadConfig, WorkloadContext};
use crate::database::db_models::MarketDataRow;
use crate::database::{ExperimentTransaction, MarketPair};
use crate::models::{LogLevel, RestartPolicy, SystemSymbol, WaypointSymbol};
use crate::ship_controller::ShipController;
use crate::{Error, Result};
use chrono::Utc;
use log::*;
use std::collections::BTreeMap;
use uuid::Uuid;

/// At most this many representative markets per good: the cheapest, the
/// median, and the priciest place to buy it.
const REPRESENTATIVE_MARKETS: usize = 3;

pub async fn run_coordinator(
    ctx: &WorkloadContext,
    ship_symbols: &[String],
    system_symbol: &SystemSymbol,
    iterations_per_batch: u32,
    batch_size_fractions: &[f64],
) -> Result<()> {
    if ship_symbols.is_empty() {
        return Err(Error::InvalidState("no ships given for experiment".to_string()));
    }
    ctx.check_cancelled()?;

    let run_id = Uuid::new_v4().to_string();
    ctx.log(
        LogLevel::Info,
        &format!(
            "Starting liquidity experiment run {} with {} ship(s) in {}",
            run_id,
            ship_symbols.len(),
            system_symbol
        ),
    )
    .await;

    let markets = ctx
        .db
        .list_markets_in_system(&system_symbol.to_string())
        .await?;
    if markets.is_empty() {
        return Err(Error::NotFound(format!(
            "market data for system {} (scout it first)",
            system_symbol
        )));
    }

    let goods = discover_goods(&markets);
    ctx.log(
        LogLevel::Info,
        &format!("Discovered {} good(s) across {} market(s)", goods.len(), markets.len()),
    )
    .await;

    let mut pairs: Vec<(String, String, String, String)> = Vec::new();
    for good in &goods {
        let representative = select_representative_markets(&markets, good);
        for buy_market in &representative {
            for sell_market in &representative {
                if buy_market == sell_market {
                    continue;
                }
                pairs.push((
                    format!("{}:{}:{}", good, buy_market, sell_market),
                    good.clone(),
                    buy_market.to_string(),
                    sell_market.to_string(),
                ));
            }
        }
    }
    let enqueued = ctx.db.enqueue_pairs(&run_id, ctx.player_id, &pairs).await?;
    ctx.log(
        LogLevel::Info,
        &format!("Work queue populated: {} PENDING pair(s)", enqueued),
    )
    .await;

    for ship_symbol in ship_symbols {
        let container_id = format!(
            "experiment-worker-{}-{}",
            ship_symbol.to_lowercase(),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let config = WorkloadConfig::MarketLiquidityExperimentWorker {
            run_id: run_id.clone(),
            ship_symbol: ship_symbol.clone(),
            iterations_per_batch,
            batch_size_fractions: batch_size_fractions.to_vec(),
        };
        ctx.spawn_ship_container(&container_id, &config, RestartPolicy::No)
            .await?;
        ctx.log(
            LogLevel::Info,
            &format!("Created worker container {} for {}", container_id, ship_symbol),
        )
        .await;
    }
    Ok(())
}

/// Worker loop: claim pairs until the queue is dry; a failed pair is marked
/// and the loop continues.
pub async fn run_worker(
    ctx: &WorkloadContext,
    run_id: &str,
    ship_symbol: &str,
    iterations_per_batch: u32,
    batch_size_fractions: &[f64],
) -> Result<()> {
    let ship = ctx.ship_controller(ship_symbol).await?;
    let mut completed = 0;
    let mut failed = 0;

    loop {
        ctx.check_cancelled()?;
        let Some(pair) = ctx.db.claim_next_pair(run_id, ship_symbol).await? else {
            break;
        };
        ctx.log(LogLevel::Info, &format!("Starting pair {}", pair.pair_id)).await;
        match execute_pair(ctx, &ship, run_id, &pair, iterations_per_batch, batch_size_fractions)
            .await
        {
            Ok(()) => {
                ctx.db.mark_pair_complete(pair.queue_id).await?;
                completed += 1;
                ctx.log(
                    LogLevel::Info,
                    &format!("Completed {} ({} total)", pair.pair_id, completed),
                )
                .await;
            }
            Err(e) => {
                ctx.db.mark_pair_failed(pair.queue_id, &e.to_string()).await?;
                failed += 1;
                ctx.log(
                    LogLevel::Error,
                    &format!("Failed {}: {}", pair.pair_id, e),
                )
                .await;
            }
        }
    }
    ctx.log(
        LogLevel::Info,
        &format!("Queue empty: {} completed, {} failed", completed, failed),
    )
    .await;
    Ok(())
}

/// Run the full buy/sell grid for one pair. Buys proceed until the hold is
/// full, then everything of the good is sold in one transaction at the sell
/// market so each measured sell covers the whole cycle.
async fn execute_pair(
    ctx: &WorkloadContext,
    ship: &ShipController,
    run_id: &str,
    pair: &MarketPair,
    iterations_per_batch: u32,
    batch_size_fractions: &[f64],
) -> Result<()> {
    let buy_market = WaypointSymbol::new(&pair.buy_market);
    let sell_market = WaypointSymbol::new(&pair.sell_market);

    let mut pending_buys: Vec<(f64, u32)> = batch_size_fractions
        .iter()
        .flat_map(|&fraction| (1..=iterations_per_batch).map(move |iteration| (fraction, iteration)))
        .collect();

    while !pending_buys.is_empty() {
        ctx.check_cancelled()?;

        // buy phase
        navigate_and_dock(ship, &buy_market).await?;
        ship.sync().await?;
        let cargo = ship.cargo();
        let mut cargo_used = cargo.units;
        let cargo_capacity = cargo.capacity;

        let rows = fetch_and_update_market(ctx, &buy_market).await?;
        let trade_volume = good_row(&rows, &pair.good_symbol)?.trade_volume;

        let mut completed_this_cycle: Vec<(f64, u32)> = Vec::new();
        let mut units_bought_this_cycle = 0i64;
        let mut first_buy_label: Option<(f64, u32)> = None;
        let mut cargo_full = false;

        for &(fraction, iteration) in pending_buys.iter() {
            if cargo_full {
                break;
            }
            ctx.check_cancelled()?;
            let units_to_buy = (trade_volume as f64 * fraction) as i64;
            if units_to_buy == 0 {
                completed_this_cycle.push((fraction, iteration));
                continue;
            }
            if units_to_buy > cargo_capacity - cargo_used {
                debug!(
                    "Cargo full: need {} units, {} space left",
                    units_to_buy,
                    cargo_capacity - cargo_used
                );
                cargo_full = true;
                break;
            }

            let poll_time = Utc::now();
            let before_rows = ctx.db.get_market_data(&buy_market).await?;
            let before = good_row(&before_rows, &pair.good_symbol)?.clone();
            let minutes_since_last = minutes_since_last_trade(ctx, &pair.buy_market, &pair.good_symbol, "BUY").await?;

            let trade = match ship.purchase_cargo(&pair.good_symbol, units_to_buy).await {
                Ok(trade) => trade,
                Err(e) => {
                    let message = e.to_string().to_lowercase();
                    if message.contains("cargo") || message.contains("capacity") {
                        cargo_full = true;
                        break;
                    }
                    warn!("Buy failed at {}: {}", pair.buy_market, e);
                    completed_this_cycle.push((fraction, iteration));
                    continue;
                }
            };
            cargo_used = trade.cargo.units;
            units_bought_this_cycle += trade.transaction.units;
            first_buy_label.get_or_insert((fraction, iteration));
            completed_this_cycle.push((fraction, iteration));

            let after_rows = fetch_and_update_market(ctx, &buy_market).await?;
            let after = good_row(&after_rows, &pair.good_symbol)?;

            // BUY impact is on the price the ship pays (persisted sell_price)
            let price_impact = percent_change(before.sell_price, after.sell_price);
            ctx.db
                .record_experiment_transaction(&ExperimentTransaction {
                    run_id: run_id.to_string(),
                    player_id: ctx.player_id,
                    ship_symbol: ship.ship_symbol.clone(),
                    pair_id: pair.pair_id.clone(),
                    good_symbol: pair.good_symbol.clone(),
                    buy_market: pair.buy_market.clone(),
                    sell_market: pair.sell_market.clone(),
                    operation: "BUY".to_string(),
                    iteration: iteration as i32,
                    batch_size_fraction: fraction,
                    units: trade.transaction.units,
                    price_per_unit: trade.transaction.price_per_unit,
                    total_credits: trade.transaction.total_price,
                    supply_before: before.supply.clone(),
                    activity_before: before.activity.clone(),
                    trade_volume_before: before.trade_volume,
                    price_before: before.sell_price,
                    supply_after: after.supply.clone(),
                    price_after: after.sell_price,
                    supply_change: format!("{}→{}", before.supply, after.supply),
                    price_impact_percent: price_impact,
                    ship_cargo_capacity: trade.cargo.capacity,
                    ship_cargo_used: trade.cargo.units,
                    minutes_since_last_trade: minutes_since_last,
                    market_poll_timestamp: poll_time,
                    timestamp: Utc::now(),
                })
                .await?;
        }
        pending_buys.retain(|buy| !completed_this_cycle.contains(buy));

        // sell phase: everything of the good, leftovers included
        navigate_and_dock(ship, &sell_market).await?;
        ship.sync().await?;
        let total_units = ship.cargo().units_of(&pair.good_symbol);
        if total_units == 0 {
            debug!("No {} cargo to sell, skipping sell phase", pair.good_symbol);
            continue;
        }
        info!(
            "Selling {} units of {} (bought this cycle: {})",
            total_units, pair.good_symbol, units_bought_this_cycle
        );

        let poll_time = Utc::now();
        let before_rows = ctx.db.get_market_data(&sell_market).await?;
        let before = good_row(&before_rows, &pair.good_symbol)?.clone();
        let minutes_since_last =
            minutes_since_last_trade(ctx, &pair.sell_market, &pair.good_symbol, "SELL").await?;

        let trade = ship.sell_cargo(&pair.good_symbol, total_units).await?;

        let after_rows = fetch_and_update_market(ctx, &sell_market).await?;
        let after = good_row(&after_rows, &pair.good_symbol)?;

        // SELL impact is on the price the ship receives (persisted
        // purchase_price); the consolidated record carries the first buy's
        // labels
        let (fraction_label, iteration_label) = first_buy_label.unwrap_or((0.0, 0));
        let price_impact = percent_change(before.purchase_price, after.purchase_price);
        ctx.db
            .record_experiment_transaction(&ExperimentTransaction {
                run_id: run_id.to_string(),
                player_id: ctx.player_id,
                ship_symbol: ship.ship_symbol.clone(),
                pair_id: pair.pair_id.clone(),
                good_symbol: pair.good_symbol.clone(),
                buy_market: pair.buy_market.clone(),
                sell_market: pair.sell_market.clone(),
                operation: "SELL".to_string(),
                iteration: iteration_label as i32,
                batch_size_fraction: fraction_label,
                units: total_units,
                price_per_unit: trade.transaction.price_per_unit,
                total_credits: trade.transaction.total_price,
                supply_before: before.supply.clone(),
                activity_before: before.activity.clone(),
                trade_volume_before: before.trade_volume,
                price_before: before.purchase_price,
                supply_after: after.supply.clone(),
                price_after: after.purchase_price,
                supply_change: format!("{}→{}", before.supply, after.supply),
                price_impact_percent: price_impact,
                ship_cargo_capacity: trade.cargo.capacity,
                ship_cargo_used: trade.cargo.units,
                minutes_since_last_trade: minutes_since_last,
                market_poll_timestamp: poll_time,
                timestamp: Utc::now(),
            })
            .await?;
    }
    Ok(())
}

async fn navigate_and_dock(ship: &ShipController, waypoint: &WaypointSymbol) -> Result<()> {
    ship.navigate(waypoint).await?;
    ship.ensure_docked().await?;
    Ok(())
}

async fn fetch_and_update_market(
    ctx: &WorkloadContext,
    waypoint: &WaypointSymbol,
) -> Result<Vec<MarketDataRow>> {
    let market = ctx.api_client.get_market(waypoint).await?;
    ctx.db.update_market_data(&market).await?;
    ctx.db.get_market_data(waypoint).await
}

async fn minutes_since_last_trade(
    ctx: &WorkloadContext,
    market: &str,
    good_symbol: &str,
    operation: &str,
) -> Result<Option<f64>> {
    let last = ctx
        .db
        .last_experiment_timestamp(ctx.player_id, market, good_symbol, operation)
        .await?;
    Ok(last.map(|ts| (Utc::now() - ts).num_seconds() as f64 / 60.0))
}

fn good_row<'a>(rows: &'a [MarketDataRow], good_symbol: &str) -> Result<&'a MarketDataRow> {
    rows.iter()
        .find(|row| row.good_symbol == good_symbol)
        .ok_or_else(|| Error::NotFound(format!("good {} at market", good_symbol)))
}

fn percent_change(before: i64, after: i64) -> f64 {
    if before == 0 {
        return 0.0;
    }
    (after - before) as f64 / before as f64 * 100.0
}

fn discover_goods(markets: &BTreeMap<WaypointSymbol, Vec<MarketDataRow>>) -> Vec<String> {
    let mut goods: Vec<String> = markets
        .values()
        .flatten()
        .map(|row| row.good_symbol.clone())
        .collect();
    goods.sort();
    goods.dedup();
    goods
}

/// Markets trading the good, reduced to up to three spread across the price
/// range of what the ship would pay there.
fn select_representative_markets(
    markets: &BTreeMap<WaypointSymbol, Vec<MarketDataRow>>,
    good_symbol: &str,
) -> Vec<WaypointSymbol> {
    let mut trading: Vec<(WaypointSymbol, i64)> = markets
        .iter()
        .filter_map(|(waypoint, rows)| {
            rows.iter()
                .find(|row| row.good_symbol == good_symbol)
                .map(|row| (waypoint.clone(), row.sell_price))
        })
        .collect();
    trading.sort_by_key(|(_, price)| *price);
    if trading.len() <= REPRESENTATIVE_MARKETS {
        return trading.into_iter().map(|(waypoint, _)| waypoint).collect();
    }
    let mid = trading.len() / 2;
    let picks = [0, mid, trading.len() - 1];
    picks
        .iter()
        .map(|&idx| trading[idx].0.clone())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn row(good: &str, sell_price: i64) -> MarketDataRow {
        MarketDataRow {
            waypoint_symbol: String::new(),
            good_symbol: good.to_string(),
            supply: "MODERATE".to_string(),
            activity: None,
            purchase_price: sell_price - 3,
            sell_price,
            trade_volume: 100,
            updated_at: String::new(),
        }
    }

    fn markets(entries: &[(&str, i64)]) -> BTreeMap<WaypointSymbol, Vec<MarketDataRow>> {
        entries
            .iter()
            .map(|(symbol, price)| {
                (WaypointSymbol::new(symbol), vec![row("IRON_ORE", *price)])
            })
            .collect()
    }

    #[test]
    fn test_representative_markets_span_price_range() {
        let markets = markets(&[
            ("X1-S1-A1", 10),
            ("X1-S1-B1", 20),
            ("X1-S1-C1", 30),
            ("X1-S1-D1", 40),
            ("X1-S1-E1", 50),
        ]);
        let picked = select_representative_markets(&markets, "IRON_ORE");
        assert_eq!(picked.len(), 3);
        assert_eq!(picked[0], WaypointSymbol::new("X1-S1-A1"));
        assert_eq!(picked[2], WaypointSymbol::new("X1-S1-E1"));
    }

    #[test]
    fn test_representative_markets_small_set() {
        let markets = markets(&[("X1-S1-A1", 10), ("X1-S1-B1", 20)]);
        let picked = select_representative_markets(&markets, "IRON_ORE");
        assert_eq!(picked.len(), 2);
        assert!(select_representative_markets(&markets, "GOLD").is_empty());
    }

    #[test]
    fn test_percent_change() {
        assert_eq!(percent_change(100, 108), 8.0);
        assert_eq!(percent_change(100, 92), -8.0);
        assert_eq!(percent_change(0, 50), 0.0);
    }

    #[test]
    fn test_discover_goods_dedups() {
        let mut all = markets(&[("X1-S1-A1", 10), ("X1-S1-B1", 20)]);
        all.get_mut(&WaypointSymbol::new("X1-S1-A1"))
            .unwrap()
            .push(row("FUEL", 60));
        let goods = discover_goods(&all);
        assert_eq!(goods, vec!["FUEL".to_string(), "IRON_ORE".to_string()]);
    }
}

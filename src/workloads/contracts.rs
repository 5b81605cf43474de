//! Contract grinding: negotiate (or resume), always accept, source the
//! goods, deliver in cargo-sized trips, fulfill. A failed iteration is
//! recorded and the batch moves on.

use super::WorkloadContext;
use crate::error::ERROR_ACTIVE_CONTRACT;
use crate::models::{Contract, ContractDelivery, LogLevel};
use crate::ship_controller::ShipController;
use crate::{Error, Result};
use log::*;

#[derive(Debug, Default)]
struct BatchStats {
    negotiated: u32,
    accepted: u32,
    fulfilled: u32,
    failed: u32,
    trips: u32,
    errors: Vec<String>,
}

pub async fn run_batch_contract(
    ctx: &WorkloadContext,
    ship_symbol: &str,
    iterations: u32,
) -> Result<()> {
    let ship = ctx.ship_controller(ship_symbol).await?;
    let mut stats = BatchStats::default();

    for iteration in 1..=iterations {
        ctx.check_cancelled()?;
        match run_single_contract(ctx, &ship, iteration, &mut stats).await {
            Ok(()) => {}
            Err(e) => {
                stats.failed += 1;
                let message = format!("Iteration {}: {}", iteration, e);
                stats.errors.push(message.clone());
                ctx.log(LogLevel::Error, &message).await;
            }
        }
    }

    ctx.log(
        LogLevel::Info,
        &format!(
            "Batch contracts done: {} negotiated, {} accepted, {} fulfilled, {} failed, {} trips",
            stats.negotiated, stats.accepted, stats.fulfilled, stats.failed, stats.trips
        ),
    )
    .await;
    Ok(())
}

async fn run_single_contract(
    ctx: &WorkloadContext,
    ship: &ShipController,
    iteration: u32,
    stats: &mut BatchStats,
) -> Result<()> {
    // resume an in-flight contract before negotiating a new one
    let mut contract = match ctx.db.get_active_contracts(ctx.player_id).await?.into_iter().next() {
        Some(contract) => {
            ctx.log(
                LogLevel::Info,
                &format!("Iteration {}: resuming contract {}", iteration, contract.id),
            )
            .await;
            contract
        }
        None => negotiate_or_fetch(ctx, ship, stats).await?,
    };
    ctx.db.upsert_contract(ctx.player_id, &contract).await?;

    // contracts are accepted even when unprofitable: an idle contract slot
    // costs more than a small loss
    if !contract.accepted {
        if let Some(profit) = estimate_profit(ctx, &contract).await? {
            if profit < 0 {
                ctx.log(
                    LogLevel::Warning,
                    &format!(
                        "Contract {} estimated at {} credits, accepting anyway",
                        contract.id, profit
                    ),
                )
                .await;
            }
        }
        let response = ctx.api_client.accept_contract(&contract.id).await?;
        contract = response.contract;
        ctx.db.update_player_credits(ctx.player_id, response.agent.credits).await?;
        ctx.db.upsert_contract(ctx.player_id, &contract).await?;
        stats.accepted += 1;
    }

    let deliveries: Vec<ContractDelivery> = contract
        .remaining_deliveries()
        .into_iter()
        .cloned()
        .collect();
    for delivery in deliveries {
        ctx.check_cancelled()?;
        contract = run_delivery(ctx, ship, &contract, &delivery, stats).await?;
        ctx.db.upsert_contract(ctx.player_id, &contract).await?;
    }

    if contract.remaining_deliveries().is_empty() && !contract.fulfilled {
        let response = ctx.api_client.fulfill_contract(&contract.id).await?;
        ctx.db.update_player_credits(ctx.player_id, response.agent.credits).await?;
        ctx.db.upsert_contract(ctx.player_id, &response.contract).await?;
        stats.fulfilled += 1;
        ctx.log(
            LogLevel::Info,
            &format!("Iteration {}: fulfilled contract {}", iteration, contract.id),
        )
        .await;
    }
    Ok(())
}

/// Negotiating with an active contract outstanding trips remote error 4511;
/// recover by fetching the contract the remote says we already have.
async fn negotiate_or_fetch(
    ctx: &WorkloadContext,
    ship: &ShipController,
    stats: &mut BatchStats,
) -> Result<Contract> {
    ship.wait_for_arrival().await?;
    ship.ensure_docked().await?;
    match ctx.api_client.negotiate_contract(&ship.ship_symbol).await {
        Ok(contract) => {
            stats.negotiated += 1;
            Ok(contract)
        }
        Err(e) if e.remote_code() == Some(ERROR_ACTIVE_CONTRACT) => {
            debug!("Active contract exists, fetching it instead");
            let contracts = ctx.api_client.get_contracts().await?;
            let existing = contracts
                .into_iter()
                .find(|contract| !contract.fulfilled)
                .ok_or_else(|| Error::NotFound("active contract".to_string()))?;
            let contract = ctx.api_client.get_contract(&existing.id).await?;
            Ok(contract)
        }
        Err(e) => Err(e),
    }
}

/// Move `units_required - units_fulfilled` of the good to its destination,
/// buying from the cheapest known market, splitting purchases by the
/// market's trade volume and trips by cargo capacity.
async fn run_delivery(
    ctx: &WorkloadContext,
    ship: &ShipController,
    contract: &Contract,
    delivery: &ContractDelivery,
    stats: &mut BatchStats,
) -> Result<Contract> {
    let good = &delivery.trade_symbol;
    let system = ship.system();
    let mut contract = contract.clone();
    let mut units_remaining = delivery.units_required - delivery.units_fulfilled;

    let (market, _, _) = ctx
        .db
        .find_cheapest_market_selling(&system.to_string(), good)
        .await?
        .ok_or_else(|| Error::NotFound(format!("market selling {}", good)))?;

    while units_remaining > 0 {
        ctx.check_cancelled()?;
        ship.sync().await?;
        let cargo = ship.cargo();
        let mut holding = cargo.units_of(good);

        // unrelated cargo blocks contract loads
        for item in cargo.other_items(good) {
            ctx.log(
                LogLevel::Warning,
                &format!("Jettisoning {} x{}", item.symbol, item.units),
            )
            .await;
            ship.jettison_cargo(&item.symbol, item.units).await?;
        }

        if holding < units_remaining.min(cargo.capacity) {
            let to_buy = (units_remaining - holding).min(cargo.capacity - holding);
            ship.navigate(&market).await?;
            ship.ensure_docked().await?;
            refresh_market(ctx, ship).await?;
            let trade_volume = ctx
                .db
                .get_trade_volume(&market, good)
                .await?
                .unwrap_or(to_buy)
                .max(1);
            let mut outstanding = to_buy;
            while outstanding > 0 {
                ctx.check_cancelled()?;
                let chunk = outstanding.min(trade_volume);
                ship.purchase_cargo(good, chunk).await?;
                outstanding -= chunk;
            }
            holding = ship.cargo().units_of(good);
        }

        ship.navigate(&delivery.destination_symbol).await?;
        ship.ensure_docked().await?;
        let to_deliver = holding.min(units_remaining);
        let response = ctx
            .api_client
            .deliver_contract(&contract.id, &ship.ship_symbol, good, to_deliver)
            .await?;
        contract = response.contract;
        ship.sync().await?;
        stats.trips += 1;

        units_remaining = contract
            .terms
            .deliver
            .iter()
            .find(|d| d.trade_symbol == *good && d.destination_symbol == delivery.destination_symbol)
            .map(|d| d.units_required - d.units_fulfilled)
            .unwrap_or(0);
        ctx.log(
            LogLevel::Info,
            &format!(
                "Delivered {} x{} ({} remaining)",
                good, to_deliver, units_remaining
            ),
        )
        .await;
    }
    Ok(contract)
}

/// Expected payout minus sourcing cost, using cached market prices. Logging
/// only; acceptance does not depend on it.
async fn estimate_profit(ctx: &WorkloadContext, contract: &Contract) -> Result<Option<i64>> {
    let mut cost = 0i64;
    for delivery in &contract.terms.deliver {
        let system = delivery.destination_symbol.system();
        match ctx
            .db
            .find_cheapest_market_selling(&system.to_string(), &delivery.trade_symbol)
            .await?
        {
            Some((_, unit_cost, _)) => {
                cost += unit_cost * (delivery.units_required - delivery.units_fulfilled);
            }
            None => return Ok(None),
        }
    }
    let payout = contract.terms.payment.on_accepted + contract.terms.payment.on_fulfilled;
    Ok(Some(payout - cost))
}

async fn refresh_market(ctx: &WorkloadContext, ship: &ShipController) -> Result<()> {
    let market = ctx.api_client.get_market(&ship.waypoint()).await?;
    ctx.db.update_market_data(&market).await?;
    Ok(())
}

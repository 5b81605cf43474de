//! Single-shot ship commands: each acquires the ship, applies one idempotent
//! operation, and reports through the container log.

use super::WorkloadContext;
use crate::Result;
use crate::models::{LogLevel, WaypointSymbol};

pub async fn run_navigate(
    ctx: &WorkloadContext,
    ship_symbol: &str,
    destination: &WaypointSymbol,
) -> Result<()> {
    ctx.check_cancelled()?;
    let ship = ctx.ship_controller(ship_symbol).await?;
    ctx.log(
        LogLevel::Info,
        &format!("Navigating {} to {}", ship_symbol, destination),
    )
    .await;
    let route = ship.navigate(destination).await?;
    if route.segments.is_empty() {
        ctx.log(
            LogLevel::Info,
            &format!("{} already at {}", ship_symbol, destination),
        )
        .await;
    } else {
        ctx.log(
            LogLevel::Info,
            &format!(
                "Arrived at {} ({} segment(s), {}s, {} fuel)",
                destination,
                route.segments.len(),
                route.total_time,
                route.total_fuel
            ),
        )
        .await;
    }
    Ok(())
}

pub async fn run_dock(ctx: &WorkloadContext, ship_symbol: &str) -> Result<()> {
    ctx.check_cancelled()?;
    let ship = ctx.ship_controller(ship_symbol).await?;
    ship.wait_for_arrival().await?;
    let changed = ship.ensure_docked().await?;
    ctx.log(
        LogLevel::Info,
        if changed {
            "Docked"
        } else {
            "Already docked"
        },
    )
    .await;
    Ok(())
}

pub async fn run_orbit(ctx: &WorkloadContext, ship_symbol: &str) -> Result<()> {
    ctx.check_cancelled()?;
    let ship = ctx.ship_controller(ship_symbol).await?;
    ship.wait_for_arrival().await?;
    let changed = ship.ensure_in_orbit().await?;
    ctx.log(
        LogLevel::Info,
        if changed {
            "Moved to orbit"
        } else {
            "Already in orbit"
        },
    )
    .await;
    Ok(())
}

pub async fn run_refuel(
    ctx: &WorkloadContext,
    ship_symbol: &str,
    units: Option<i64>,
) -> Result<()> {
    ctx.check_cancelled()?;
    let ship = ctx.ship_controller(ship_symbol).await?;
    ship.wait_for_arrival().await?;
    ship.ensure_docked().await?;
    let outcome = ship.refuel(units).await?;
    ctx.log(
        LogLevel::Info,
        &format!(
            "Refueled {} units for {} credits",
            outcome.fuel_added, outcome.cost
        ),
    )
    .await;
    Ok(())
}

pub async fn run_purchase_cargo(
    ctx: &WorkloadContext,
    ship_symbol: &str,
    good_symbol: &str,
    units: i64,
) -> Result<()> {
    ctx.check_cancelled()?;
    let ship = ctx.ship_controller(ship_symbol).await?;
    ship.wait_for_arrival().await?;
    let response = ship.purchase_cargo(good_symbol, units).await?;
    ctx.log(
        LogLevel::Info,
        &format!(
            "Bought {} x{} for {} credits",
            good_symbol, response.transaction.units, response.transaction.total_price
        ),
    )
    .await;
    Ok(())
}

pub async fn run_sell_cargo(
    ctx: &WorkloadContext,
    ship_symbol: &str,
    good_symbol: &str,
    units: i64,
) -> Result<()> {
    ctx.check_cancelled()?;
    let ship = ctx.ship_controller(ship_symbol).await?;
    ship.wait_for_arrival().await?;
    let response = ship.sell_cargo(good_symbol, units).await?;
    ctx.log(
        LogLevel::Info,
        &format!(
            "Sold {} x{} for {} credits",
            good_symbol, response.transaction.units, response.transaction.total_price
        ),
    )
    .await;
    Ok(())
}


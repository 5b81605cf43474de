use super::WorkloadContext;
use crate::models::{LogLevel, Ship, WaypointSymbol};
use crate::{Error, Result};
use log::*;

/// Buy one ship, auto-discovering the nearest shipyard selling the type when
/// none is given. Credits are validated against the live remote agent, never
/// the cached mirror.
pub async fn run_purchase_ship(
    ctx: &WorkloadContext,
    purchasing_ship: &str,
    ship_type: &str,
    shipyard_waypoint: Option<&WaypointSymbol>,
) -> Result<Ship> {
    ctx.check_cancelled()?;
    let ship = ctx.ship_controller(purchasing_ship).await?;

    let shipyard_waypoint = match shipyard_waypoint {
        Some(waypoint) => waypoint.clone(),
        None => discover_shipyard(ctx, &ship.waypoint(), ship_type).await?,
    };

    if ship.waypoint() != shipyard_waypoint {
        ctx.log(
            LogLevel::Info,
            &format!("Navigating to shipyard {}", shipyard_waypoint),
        )
        .await;
        ship.navigate(&shipyard_waypoint).await?;
    }
    ship.ensure_docked().await?;

    // re-read listings at the dock; prices move
    let listings = ctx.api_client.get_shipyard(&shipyard_waypoint).await?;
    let listing = listings
        .ships
        .iter()
        .find(|listing| listing.ship_type == ship_type)
        .ok_or_else(|| {
            Error::NotFound(format!(
                "ship type {} at shipyard {}",
                ship_type, shipyard_waypoint
            ))
        })?;
    let price = listing.purchase_price;

    let agent = ctx.api_client.get_agent().await?;
    if agent.credits < price {
        return Err(Error::InvalidState(format!(
            "insufficient credits: have {}, ship {} costs {}",
            agent.credits, ship_type, price
        )));
    }

    let response = ctx
        .api_client
        .purchase_ship(ship_type, &shipyard_waypoint)
        .await?;
    ctx.db.save_ship(ctx.player_id, &response.ship).await?;
    ctx.db
        .update_player_credits(ctx.player_id, response.agent.credits)
        .await?;
    ctx.log(
        LogLevel::Info,
        &format!(
            "Purchased {} ({}) for {} credits",
            response.ship.symbol, ship_type, response.transaction.price
        ),
    )
    .await;
    Ok(response.ship)
}

/// Buy up to `quantity` ships, bounded by budget and live credits. Failures
/// are recorded and the batch continues.
pub async fn run_batch_purchase_ships(
    ctx: &WorkloadContext,
    purchasing_ship: &str,
    ship_type: &str,
    quantity: i64,
    max_budget: i64,
) -> Result<()> {
    ctx.check_cancelled()?;
    let ship = ctx.ship_controller(purchasing_ship).await?;
    let shipyard_waypoint = discover_shipyard(ctx, &ship.waypoint(), ship_type).await?;

    let listings = ctx.api_client.get_shipyard(&shipyard_waypoint).await?;
    let price = listings
        .ships
        .iter()
        .find(|listing| listing.ship_type == ship_type)
        .map(|listing| listing.purchase_price)
        .ok_or_else(|| {
            Error::NotFound(format!(
                "ship type {} at shipyard {}",
                ship_type, shipyard_waypoint
            ))
        })?;
    let credits = ctx.api_client.get_agent().await?.credits;
    let purchasable = quantity.min(max_budget / price).min(credits / price);
    ctx.log(
        LogLevel::Info,
        &format!(
            "Planning to buy {} x {} at ~{} credits each (budget {}, credits {})",
            purchasable, ship_type, price, max_budget, credits
        ),
    )
    .await;

    let mut bought = 0;
    let mut errors: Vec<String> = Vec::new();
    for _ in 0..purchasable {
        ctx.check_cancelled()?;
        match run_purchase_ship(ctx, purchasing_ship, ship_type, Some(&shipyard_waypoint)).await {
            Ok(new_ship) => {
                bought += 1;
                debug!("Bought ship {}", new_ship.symbol);
            }
            Err(e) => {
                errors.push(e.to_string());
                ctx.log(LogLevel::Warning, &format!("Purchase failed: {}", e)).await;
            }
        }
    }
    ctx.log(
        LogLevel::Info,
        &format!(
            "Batch purchase finished: {} bought, {} failed",
            bought,
            errors.len()
        ),
    )
    .await;
    Ok(())
}

/// Nearest shipyard in the ship's system whose listings include `ship_type`.
/// Waypoints come from the cache, refreshed through the graph provider's TTL.
async fn discover_shipyard(
    ctx: &WorkloadContext,
    from: &WaypointSymbol,
    ship_type: &str,
) -> Result<WaypointSymbol> {
    let system = from.system();
    // warms/refreshes the waypoint cache for the system
    let graph = ctx.universe.get_system_graph(&system).await?;
    let origin = graph
        .get(from)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("waypoint {}", from)))?;

    let shipyards = ctx
        .universe
        .find_waypoints_with_trait(&system, "SHIPYARD")
        .await?;
    let mut candidates: Vec<(WaypointSymbol, f64)> = Vec::new();
    for (symbol, waypoint) in &shipyards {
        match ctx.api_client.get_shipyard(symbol).await {
            Ok(shipyard) => {
                if shipyard
                    .ship_types
                    .iter()
                    .any(|entry| entry.ship_type == ship_type)
                {
                    candidates.push((symbol.clone(), origin.distance_to(waypoint)));
                }
            }
            // skip shipyards we cannot read listings for
            Err(e) => debug!("Skipping shipyard {}: {}", symbol, e),
        }
    }
    candidates
        .into_iter()
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(symbol, _)| symbol)
        .ok_or_else(|| {
            Error::NotFound(format!(
                "no shipyard in system {} sells {}",
                system, ship_type
            ))
        })
}

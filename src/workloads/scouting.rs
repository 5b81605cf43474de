use super::{WorkloadConfig, WorkloadContext};
use crate::models::{LogLevel, RestartPolicy, WaypointSymbol};
use crate::{Error, Result};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Coordinator: partition the markets across the fleet with the routing
/// engine, then hand each ship its subset as a dedicated tour container.
pub async fn run_scout_markets(
    ctx: &WorkloadContext,
    ship_symbols: &[String],
    markets: &[WaypointSymbol],
    iterations: u32,
    return_to_start: bool,
) -> Result<()> {
    if ship_symbols.is_empty() {
        return Err(Error::InvalidState("no ships given to scout with".to_string()));
    }
    ctx.check_cancelled()?;

    let ships = futures::future::try_join_all(
        ship_symbols
            .iter()
            .map(|ship_symbol| ctx.api_client.get_ship(ship_symbol)),
    )
    .await?;
    let mut ship_locations: BTreeMap<String, WaypointSymbol> = BTreeMap::new();
    let mut fuel_capacity = 0;
    let mut engine_speed = 1;
    for ship in ships {
        ctx.db.save_ship(ctx.player_id, &ship).await?;
        fuel_capacity = fuel_capacity.max(ship.fuel.capacity);
        engine_speed = engine_speed.max(ship.engine.speed);
        ship_locations.insert(ship.symbol.clone(), ship.nav.waypoint_symbol);
    }

    let system = ship_locations
        .values()
        .next()
        .expect("at least one ship")
        .system();
    let graph = ctx.universe.get_system_graph(&system).await?;

    let assignments = ctx.routing.optimize_fleet_tour(
        &graph,
        markets,
        &ship_locations,
        fuel_capacity,
        engine_speed,
    )?;

    let mut spawned = 0;
    for (ship_symbol, assigned_markets) in assignments {
        if assigned_markets.is_empty() {
            ctx.log(
                LogLevel::Warning,
                &format!("{} received no markets", ship_symbol),
            )
            .await;
            continue;
        }
        let container_id = format!(
            "scout-{}-{}",
            ship_symbol.to_lowercase(),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let config = WorkloadConfig::ScoutTour {
            ship_symbol: ship_symbol.clone(),
            markets: assigned_markets.clone(),
            iterations,
            return_to_start,
        };
        ctx.spawn_ship_container(&container_id, &config, RestartPolicy::No)
            .await?;
        ctx.log(
            LogLevel::Info,
            &format!(
                "Spawned {} for {} covering {} market(s)",
                container_id,
                ship_symbol,
                assigned_markets.len()
            ),
        )
        .await;
        spawned += 1;
    }
    ctx.log(
        LogLevel::Info,
        &format!("Scouting started with {} worker container(s)", spawned),
    )
    .await;
    Ok(())
}

/// Per-ship tour worker: repeatedly visit the assigned markets in optimized
/// order, refreshing market data at each stop.
pub async fn run_scout_tour(
    ctx: &WorkloadContext,
    ship_symbol: &str,
    markets: &[WaypointSymbol],
    iterations: u32,
    return_to_start: bool,
) -> Result<()> {
    let ship = ctx.ship_controller(ship_symbol).await?;
    let start = ship.waypoint();
    let system = ship.system();
    let graph = ctx.universe.get_system_graph(&system).await?;

    for iteration in 1..=iterations {
        ctx.check_cancelled()?;
        let fuel = ship.fuel();
        let tour = ctx.routing.optimize_fueled_tour(
            &graph,
            markets,
            &ship.waypoint(),
            return_to_start.then_some(&start),
            fuel.current,
            fuel.capacity,
            ship.engine_speed(),
        )?;
        ctx.log(
            LogLevel::Info,
            &format!(
                "Iteration {}/{}: touring {} waypoint(s), est {}s",
                iteration,
                iterations,
                tour.ordered_waypoints.len(),
                tour.total_time
            ),
        )
        .await;

        for leg in &tour.legs {
            ctx.check_cancelled()?;
            ship.navigate(&leg.to_waypoint).await?;
            if graph
                .get(&leg.to_waypoint)
                .map(|wp| wp.has_trait("MARKETPLACE"))
                .unwrap_or(false)
            {
                let market = ctx.api_client.get_market(&leg.to_waypoint).await?;
                ctx.db.update_market_data(&market).await?;
                ctx.log(
                    LogLevel::Info,
                    &format!("Refreshed market {}", leg.to_waypoint),
                )
                .await;
            }
        }
    }
    Ok(())
}

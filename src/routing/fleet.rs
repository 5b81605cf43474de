use super::RoutingEngine;
use super::tour::PLAN_HORIZON;
use crate::models::{SystemGraph, WaypointSymbol};
use crate::{Error, Result};
use log::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use vrp_core::models::common::*;
use vrp_core::models::problem::*;
use vrp_core::prelude::*;
use vrp_core::rosomaxa::prelude::TelemetryMode;

const UNREACHABLE_COST: i64 = 1_000_000;

impl RoutingEngine {
    /// Partition markets across ships, minimizing the longest assigned route.
    /// Every market must land on exactly one ship; a dropped market is an
    /// error, and a ship parked on a market is pre-assigned that market
    /// because depot nodes never appear in solver routes.
    pub fn optimize_fleet_tour(
        &self,
        graph: &SystemGraph,
        markets: &[WaypointSymbol],
        ship_locations: &BTreeMap<String, WaypointSymbol>,
        fuel_capacity: i64,
        engine_speed: i64,
    ) -> Result<BTreeMap<String, Vec<WaypointSymbol>>> {
        let mut assignments: BTreeMap<String, Vec<WaypointSymbol>> = ship_locations
            .keys()
            .map(|ship| (ship.clone(), Vec::new()))
            .collect();
        if markets.is_empty() || ship_locations.is_empty() {
            return Ok(assignments);
        }

        // node list: markets first, then any ship start not already present
        let mut nodes: Vec<WaypointSymbol> = markets.to_vec();
        let mut node_index: BTreeMap<WaypointSymbol, usize> = nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (node.clone(), idx))
            .collect();
        let ships: Vec<String> = ship_locations.keys().cloned().collect();
        let mut starts: Vec<usize> = Vec::new();
        for ship in &ships {
            let waypoint = &ship_locations[ship];
            let idx = *node_index.entry(waypoint.clone()).or_insert_with(|| {
                nodes.push(waypoint.clone());
                nodes.len() - 1
            });
            starts.push(idx);
        }

        let n = nodes.len();
        let mut matrix = vec![vec![UNREACHABLE_COST; n]; n];
        let mut cache_hits = 0;
        let mut cache_misses = 0;
        for (i, origin) in nodes.iter().enumerate() {
            for (j, target) in nodes.iter().enumerate() {
                if i == j {
                    matrix[i][j] = 0;
                    continue;
                }
                if !graph.contains_key(origin) || !graph.contains_key(target) {
                    continue;
                }
                let key = (origin.clone(), target.clone(), fuel_capacity, engine_speed);
                let cached = self.path_cache.contains_key(&key);
                if cached {
                    cache_hits += 1;
                } else {
                    cache_misses += 1;
                }
                if let Some(plan) =
                    self.cached_full_tank_path(graph, origin, target, fuel_capacity, engine_speed)
                {
                    matrix[i][j] = plan.total_time;
                }
            }
        }
        debug!(
            "Fleet matrix cache: {} hits, {} misses",
            cache_hits, cache_misses
        );

        let solution = match solve_fleet(&matrix, &ships, &starts, self.vrp_time_limit) {
            Ok(solution) => solution,
            Err(e) => {
                // no solution: hand back empty assignments so the caller can
                // retry with different parameters
                warn!("Fleet solver returned no solution: {}", e);
                return Ok(assignments);
            }
        };

        let market_set: BTreeSet<&WaypointSymbol> = markets.iter().collect();
        let mut assigned: BTreeSet<WaypointSymbol> = BTreeSet::new();
        for (vehicle_idx, ship) in ships.iter().enumerate() {
            // depot pre-assignment
            let start_waypoint = &nodes[starts[vehicle_idx]];
            if market_set.contains(start_waypoint) && !assigned.contains(start_waypoint) {
                assignments
                    .get_mut(ship)
                    .expect("ship present in assignments")
                    .push(start_waypoint.clone());
                assigned.insert(start_waypoint.clone());
            }
            for &node_idx in &solution[vehicle_idx] {
                let waypoint = &nodes[node_idx];
                if market_set.contains(waypoint) && !assigned.contains(waypoint) {
                    assignments
                        .get_mut(ship)
                        .expect("ship present in assignments")
                        .push(waypoint.clone());
                    assigned.insert(waypoint.clone());
                }
            }
        }

        let dropped: Vec<&WaypointSymbol> = markets
            .iter()
            .filter(|market| !assigned.contains(*market))
            .collect();
        if !dropped.is_empty() {
            return Err(Error::Solver(format!(
                "fleet partition dropped {} market(s): {:?}",
                dropped.len(),
                dropped
            )));
        }
        Ok(assignments)
    }
}

/// Multi-vehicle solve over the cost matrix. Returns, per vehicle, the node
/// indices it visits in order (excluding its depot).
fn solve_fleet(
    matrix: &[Vec<i64>],
    ships: &[String],
    starts: &[usize],
    time_limit: std::time::Duration,
) -> Result<Vec<Vec<usize>>> {
    let n = matrix.len();
    let durations: Vec<f64> = matrix.iter().flatten().map(|&cost| cost as f64).collect();
    let distances = durations.clone();
    let transport = Arc::new(
        SimpleTransportCost::new(durations, distances)
            .map_err(|e| Error::Solver(e.to_string()))?,
    );

    let start_set: BTreeSet<usize> = starts.iter().copied().collect();
    let jobs = (0..n)
        .filter(|idx| !start_set.contains(idx))
        .map(|idx| {
            SingleBuilder::default()
                .id(&format!("visit-{}", idx))
                .location(idx)
                .map_err(|e| Error::Solver(e.to_string()))?
                .times(vec![TimeWindow::new(0.0, PLAN_HORIZON)])
                .map_err(|e| Error::Solver(e.to_string()))?
                .build_as_job()
                .map_err(|e| Error::Solver(e.to_string()))
        })
        .collect::<Result<Vec<Job>>>()?;

    let vehicles = ships
        .iter()
        .zip(starts.iter())
        .map(|(ship, &start)| {
            VehicleBuilder::default()
                .id(ship)
                .add_detail(
                    VehicleDetailBuilder::default()
                        .set_start_location(start)
                        .set_start_time(0.0)
                        .build()
                        .map_err(|e| Error::Solver(e.to_string()))?,
                )
                .capacity(SingleDimLoad::new(i32::MAX))
                .build()
                .map_err(|e| Error::Solver(e.to_string()))
        })
        .collect::<Result<Vec<Vehicle>>>()?;

    let transport_feature = TransportFeatureBuilder::new("min-duration")
        .set_transport_cost(transport.clone())
        .set_time_constrained(true)
        .build_minimize_duration()
        .map_err(|e| Error::Solver(e.to_string()))?;
    let minimize_unassigned = MinimizeUnassignedBuilder::new("min-unassigned")
        .build()
        .map_err(|e| Error::Solver(e.to_string()))?;
    let balance_span = balance_span_feature()?;
    let goal =
        GoalContextBuilder::with_features(&[minimize_unassigned, balance_span, transport_feature])
            .map_err(|e| Error::Solver(e.to_string()))?
            .build()
            .map_err(|e| Error::Solver(e.to_string()))?;

    let problem = ProblemBuilder::default()
        .add_jobs(jobs.into_iter())
        .add_vehicles(vehicles.into_iter())
        .with_goal(goal)
        .with_transport_cost(transport.clone())
        .build()
        .map_err(|e| Error::Solver(e.to_string()))?;
    let problem = Arc::new(problem);

    let config = VrpConfigBuilder::new(problem.clone())
        .set_telemetry_mode(TelemetryMode::None)
        .prebuild()
        .map_err(|e| Error::Solver(e.to_string()))?
        .with_max_time(Some(std::cmp::max(1, time_limit.as_secs() as usize)))
        .with_max_generations(Some(3000))
        .build()
        .map_err(|e| Error::Solver(e.to_string()))?;

    let solution = Solver::new(problem.clone(), config)
        .solve()
        .map_err(|e| Error::Solver(e.to_string()))?;

    let mut routes: Vec<Vec<usize>> = vec![Vec::new(); ships.len()];
    for route in &solution.routes {
        let vehicle_id = route
            .actor
            .vehicle
            .dimens
            .get_vehicle_id()
            .ok_or_else(|| Error::Solver("route without vehicle id".to_string()))?;
        let Some(vehicle_idx) = ships.iter().position(|ship| ship == vehicle_id) else {
            continue;
        };
        for activity in route.tour.all_activities() {
            if activity.job.is_some() {
                routes[vehicle_idx].push(activity.place.location);
            }
        }
    }
    Ok(routes)
}

/// Keeps vehicle workloads level: the objective is the arrival time of the
/// latest-finishing route, ranked above raw transport cost.
fn balance_span_feature() -> Result<Feature> {
    FeatureBuilder::default()
        .with_name("balance-span")
        .with_objective(MinimizeSpanObjective)
        .build()
        .map_err(|e| Error::Solver(e.to_string()))
}

struct MinimizeSpanObjective;

impl FeatureObjective for MinimizeSpanObjective {
    fn fitness(&self, solution: &InsertionContext) -> Cost {
        solution
            .solution
            .routes
            .iter()
            .map(|route_ctx| {
                route_ctx
                    .route()
                    .tour
                    .all_activities()
                    .last()
                    .map(|activity| activity.schedule.arrival)
                    .unwrap_or(0.0)
            })
            .fold(0.0, f64::max)
    }

    fn estimate(&self, _move_ctx: &MoveContext<'_>) -> Cost {
        Cost::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::routing::pathfind::test_support::{graph, symbol};
    use std::time::Duration;

    #[test]
    fn test_fleet_partition_assigns_every_market() {
        // two ships on opposite ends; each should take its nearby pair
        let g = graph(&[
            ("X1-S1-A1", 0.0, 0.0, true),
            ("X1-S1-A2", 10.0, 0.0, true),
            ("X1-S1-A3", 20.0, 0.0, true),
            ("X1-S1-Z1", 1000.0, 0.0, true),
            ("X1-S1-Z2", 1010.0, 0.0, true),
        ]);
        let engine = RoutingEngine::with_time_limits(
            Duration::from_secs(1),
            Duration::from_secs(2),
        );
        let markets = vec![
            symbol("X1-S1-A2"),
            symbol("X1-S1-A3"),
            symbol("X1-S1-Z2"),
        ];
        let ship_locations: BTreeMap<String, WaypointSymbol> = [
            ("SHIP-A".to_string(), symbol("X1-S1-A1")),
            ("SHIP-Z".to_string(), symbol("X1-S1-Z1")),
        ]
        .into_iter()
        .collect();

        let assignments = engine
            .optimize_fleet_tour(&g, &markets, &ship_locations, 400, 30)
            .unwrap();

        let total: usize = assignments.values().map(Vec::len).sum();
        assert_eq!(total, 3);

        // no market appears twice
        let mut seen = BTreeSet::new();
        for market in assignments.values().flatten() {
            assert!(seen.insert(market.clone()));
        }
        // the far market belongs to the far ship
        assert!(assignments["SHIP-Z"].contains(&symbol("X1-S1-Z2")));
    }

    #[test]
    fn test_ship_parked_on_market_gets_it() {
        let g = graph(&[
            ("X1-S1-A1", 0.0, 0.0, true),
            ("X1-S1-B1", 50.0, 0.0, true),
        ]);
        let engine = RoutingEngine::with_time_limits(
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let markets = vec![symbol("X1-S1-A1"), symbol("X1-S1-B1")];
        let ship_locations: BTreeMap<String, WaypointSymbol> =
            [("SHIP-A".to_string(), symbol("X1-S1-A1"))].into_iter().collect();

        let assignments = engine
            .optimize_fleet_tour(&g, &markets, &ship_locations, 400, 30)
            .unwrap();
        // depot market is pre-assigned even though the solver never emits it
        assert!(assignments["SHIP-A"].contains(&symbol("X1-S1-A1")));
        assert!(assignments["SHIP-A"].contains(&symbol("X1-S1-B1")));
    }

    #[test]
    fn test_empty_inputs() {
        let g = graph(&[("X1-S1-A1", 0.0, 0.0, true)]);
        let engine = RoutingEngine::new();
        let ship_locations: BTreeMap<String, WaypointSymbol> =
            [("SHIP-A".to_string(), symbol("X1-S1-A1"))].into_iter().collect();
        let assignments = engine
            .optimize_fleet_tour(&g, &[], &ship_locations, 400, 30)
            .unwrap();
        assert_eq!(assignments["SHIP-A"].len(), 0);
    }
}

use super::{
    ORBITAL_HOP_TIME, PathPlan, RouteStep, RoutingEngine, SAFETY_MARGIN, fuel_cost, travel_time,
};
use crate::models::{ShipFlightMode, SystemGraph, WaypointSymbol, is_orbital_hop};
use crate::{Error, Result};
use log::*;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use vrp_core::models::common::*;
use vrp_core::models::problem::*;
use vrp_core::prelude::*;
use vrp_core::rosomaxa::prelude::TelemetryMode;

/// Arc costs are integer-scaled distance; orbital hops cost a single unit so
/// the solver still prefers them over any real flight.
const DISTANCE_SCALE: f64 = 100.0;
pub(crate) const PLAN_HORIZON: f64 = 1e9;
const UNREACHABLE_COST: i64 = 1_000_000;

#[derive(Debug, Clone, Serialize)]
pub struct RefuelStop {
    pub waypoint: WaypointSymbol,
    pub refuel_amount: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TourLeg {
    pub from_waypoint: WaypointSymbol,
    pub to_waypoint: WaypointSymbol,
    pub flight_mode: ShipFlightMode,
    pub fuel_cost: i64,
    pub time_seconds: i64,
    pub distance: f64,
    pub refuel_before: bool,
    pub refuel_amount: i64,
    pub intermediate_stops: Vec<RefuelStop>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct TourPlan {
    pub ordered_waypoints: Vec<WaypointSymbol>,
    pub legs: Vec<TourLeg>,
    pub total_distance: f64,
    pub total_fuel_cost: i64,
    pub total_time: i64,
    pub refuel_stops: usize,
}

impl RoutingEngine {
    /// Visit-order optimization over integer-scaled distances. Legs assume a
    /// full tank; `optimize_fueled_tour` is the variant that tracks fuel.
    pub fn optimize_tour(
        &self,
        graph: &SystemGraph,
        targets: &[WaypointSymbol],
        start: &WaypointSymbol,
        fuel_capacity: i64,
        engine_speed: i64,
        return_to_start: bool,
    ) -> Result<TourPlan> {
        let mut nodes: Vec<WaypointSymbol> = vec![start.clone()];
        nodes.extend(targets.iter().cloned());
        for node in &nodes {
            if !graph.contains_key(node) {
                return Err(Error::Routing(format!("waypoint {} not in graph", node)));
            }
        }
        if nodes.len() == 1 {
            return Ok(TourPlan {
                ordered_waypoints: vec![start.clone()],
                ..TourPlan::default()
            });
        }

        let n = nodes.len();
        let mut matrix = vec![vec![0i64; n]; n];
        for (i, from_symbol) in nodes.iter().enumerate() {
            let from = &graph[from_symbol];
            for (j, to_symbol) in nodes.iter().enumerate() {
                if i == j {
                    continue;
                }
                let to = &graph[to_symbol];
                matrix[i][j] = if is_orbital_hop(from_symbol, from, to_symbol, to) {
                    1
                } else {
                    (from.distance_to(to) * DISTANCE_SCALE).round() as i64
                };
            }
        }

        let order = solve_node_order(&matrix, self.tsp_time_limit, return_to_start)?;
        let ordered_nodes: Vec<WaypointSymbol> =
            order.iter().map(|&idx| nodes[idx].clone()).collect();

        let mut plan = TourPlan {
            ordered_waypoints: ordered_nodes.clone(),
            ..TourPlan::default()
        };
        let mut hops: Vec<(WaypointSymbol, WaypointSymbol)> = ordered_nodes
            .iter()
            .zip(ordered_nodes.iter().skip(1))
            .map(|(a, b)| (a.clone(), b.clone()))
            .collect();
        if return_to_start {
            if let Some(last) = ordered_nodes.last() {
                if last != start {
                    hops.push((last.clone(), start.clone()));
                }
            }
        }
        for (from_symbol, to_symbol) in hops {
            let from = &graph[&from_symbol];
            let to = &graph[&to_symbol];
            let leg = if is_orbital_hop(&from_symbol, from, &to_symbol, to) {
                TourLeg {
                    from_waypoint: from_symbol,
                    to_waypoint: to_symbol,
                    flight_mode: ShipFlightMode::Cruise,
                    fuel_cost: 0,
                    time_seconds: ORBITAL_HOP_TIME,
                    distance: 0.0,
                    refuel_before: false,
                    refuel_amount: 0,
                    intermediate_stops: Vec::new(),
                }
            } else {
                let distance = from.distance_to(to);
                let mode = full_tank_mode(distance, fuel_capacity);
                TourLeg {
                    from_waypoint: from_symbol,
                    to_waypoint: to_symbol,
                    flight_mode: mode,
                    fuel_cost: fuel_cost(mode, distance),
                    time_seconds: travel_time(mode, distance, engine_speed),
                    distance,
                    refuel_before: false,
                    refuel_amount: 0,
                    intermediate_stops: Vec::new(),
                }
            };
            plan.total_distance += leg.distance;
            plan.total_fuel_cost += leg.fuel_cost;
            plan.total_time += leg.time_seconds;
            plan.legs.push(leg);
        }
        Ok(plan)
    }

    /// Tour optimization with real fuel state: arc costs come from full-tank
    /// pathfinding, then the chosen order is replayed leg by leg with the
    /// actual tank, inserting refuels where the plan demands them.
    #[allow(clippy::too_many_arguments)]
    pub fn optimize_fueled_tour(
        &self,
        graph: &SystemGraph,
        targets: &[WaypointSymbol],
        start: &WaypointSymbol,
        return_waypoint: Option<&WaypointSymbol>,
        current_fuel: i64,
        fuel_capacity: i64,
        engine_speed: i64,
    ) -> Result<TourPlan> {
        let mut nodes: Vec<WaypointSymbol> = vec![start.clone()];
        nodes.extend(targets.iter().cloned());
        if let Some(ret) = return_waypoint {
            if !nodes.contains(ret) {
                nodes.push(ret.clone());
            }
        }
        for node in &nodes {
            if !graph.contains_key(node) {
                return Err(Error::Routing(format!("waypoint {} not in graph", node)));
            }
        }
        if targets.is_empty() {
            return Ok(TourPlan {
                ordered_waypoints: vec![start.clone()],
                ..TourPlan::default()
            });
        }

        let n = nodes.len();
        debug!("Building {n}x{n} fuel-aware cost matrix");
        let mut matrix = vec![vec![0i64; n]; n];
        for (i, from_symbol) in nodes.iter().enumerate() {
            for (j, to_symbol) in nodes.iter().enumerate() {
                if i == j {
                    continue;
                }
                match self.cached_full_tank_path(
                    graph,
                    from_symbol,
                    to_symbol,
                    fuel_capacity,
                    engine_speed,
                ) {
                    Some(plan) => matrix[i][j] = plan.total_time,
                    None => {
                        warn!("No path found from {} to {}", from_symbol, to_symbol);
                        matrix[i][j] = UNREACHABLE_COST;
                    }
                }
            }
        }

        let order = solve_node_order(&matrix, self.tsp_time_limit, false)?;
        let mut ordered_nodes: Vec<WaypointSymbol> =
            order.iter().map(|&idx| nodes[idx].clone()).collect();
        if let Some(ret) = return_waypoint {
            if ordered_nodes.last() != Some(ret) {
                ordered_nodes.push(ret.clone());
            }
        }
        debug!("Tour solution: {:?}", ordered_nodes);

        let mut plan = TourPlan {
            ordered_waypoints: ordered_nodes
                .iter()
                .filter(|node| *node != start && Some(*node) != return_waypoint)
                .cloned()
                .collect(),
            ..TourPlan::default()
        };

        let mut fuel_state = current_fuel;
        for i in 0..ordered_nodes.len() - 1 {
            let from_symbol = &ordered_nodes[i];
            let to_symbol = &ordered_nodes[i + 1];

            // the first leg reflects the actual tank, not the full-tank
            // matrix assumption
            let mut leg_plan: PathPlan = if i == 0 {
                self.find_optimal_path(
                    graph,
                    from_symbol,
                    to_symbol,
                    fuel_state,
                    fuel_capacity,
                    engine_speed,
                    false,
                    false,
                )?
            } else {
                self.cached_full_tank_path(graph, from_symbol, to_symbol, fuel_capacity, engine_speed)
                    .ok_or_else(|| {
                        Error::Routing(format!("no route from {} to {}", from_symbol, to_symbol))
                    })?
            };

            let mut refuel_before = false;
            let mut refuel_amount = 0;
            if fuel_state < leg_plan.total_fuel_cost {
                if graph[from_symbol].has_fuel {
                    refuel_before = true;
                    refuel_amount = fuel_capacity - fuel_state;
                    fuel_state = fuel_capacity;
                    plan.refuel_stops += 1;
                } else {
                    // replan with what is actually in the tank; the route may
                    // reach a pump on the way
                    leg_plan = self.find_optimal_path(
                        graph,
                        from_symbol,
                        to_symbol,
                        fuel_state,
                        fuel_capacity,
                        engine_speed,
                        false,
                        false,
                    )?;
                }
            }

            let mut flight_mode = ShipFlightMode::Cruise;
            let mut intermediate_stops = Vec::new();
            for step in &leg_plan.steps {
                match step {
                    RouteStep::Travel { mode, .. } => flight_mode = *mode,
                    RouteStep::Refuel {
                        waypoint,
                        refuel_amount,
                    } => {
                        intermediate_stops.push(RefuelStop {
                            waypoint: waypoint.clone(),
                            refuel_amount: *refuel_amount,
                        });
                        plan.refuel_stops += 1;
                    }
                }
            }
            fuel_state -= leg_plan.total_fuel_cost;

            plan.total_time += leg_plan.total_time;
            plan.total_fuel_cost += leg_plan.total_fuel_cost;
            plan.total_distance += leg_plan.total_distance;
            plan.legs.push(TourLeg {
                from_waypoint: from_symbol.clone(),
                to_waypoint: to_symbol.clone(),
                flight_mode,
                fuel_cost: leg_plan.total_fuel_cost,
                time_seconds: leg_plan.total_time,
                distance: leg_plan.total_distance,
                refuel_before,
                refuel_amount,
                intermediate_stops,
            });
        }
        Ok(plan)
    }
}

fn full_tank_mode(distance: f64, fuel_capacity: i64) -> ShipFlightMode {
    let burn = fuel_cost(ShipFlightMode::Burn, distance);
    let cruise = fuel_cost(ShipFlightMode::Cruise, distance);
    if fuel_capacity >= burn + SAFETY_MARGIN {
        ShipFlightMode::Burn
    } else if fuel_capacity >= cruise + SAFETY_MARGIN {
        ShipFlightMode::Cruise
    } else {
        // the tour model does not insert refuels; the caller tops up between
        // legs
        ShipFlightMode::Cruise
    }
}

/// Single-vehicle visit ordering over a cost matrix. Node 0 is the start;
/// the result always begins with it.
pub(crate) fn solve_node_order(
    matrix: &[Vec<i64>],
    time_limit: Duration,
    return_to_start: bool,
) -> Result<Vec<usize>> {
    let n = matrix.len();
    if n <= 1 {
        return Ok(vec![0]);
    }
    if n == 2 {
        return Ok(vec![0, 1]);
    }

    let durations: Vec<f64> = matrix.iter().flatten().map(|&cost| cost as f64).collect();
    let distances = durations.clone();
    let transport = Arc::new(
        SimpleTransportCost::new(durations, distances)
            .map_err(|e| Error::Solver(e.to_string()))?,
    );

    let jobs = (1..n)
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

    let mut detail = VehicleDetailBuilder::default();
    detail = detail.set_start_location(0).set_start_time(0.0);
    if return_to_start {
        detail = detail.set_end_location(0);
    }
    let vehicle = VehicleBuilder::default()
        .id("tour")
        .add_detail(detail.build().map_err(|e| Error::Solver(e.to_string()))?)
        .capacity(SingleDimLoad::new(i32::MAX))
        .build()
        .map_err(|e| Error::Solver(e.to_string()))?;

    let transport_feature = TransportFeatureBuilder::new("min-duration")
        .set_transport_cost(transport.clone())
        .set_time_constrained(true)
        .build_minimize_duration()
        .map_err(|e| Error::Solver(e.to_string()))?;
    let minimize_unassigned = MinimizeUnassignedBuilder::new("min-unassigned")
        .build()
        .map_err(|e| Error::Solver(e.to_string()))?;
    let goal = GoalContextBuilder::with_features(&[minimize_unassigned, transport_feature])
        .map_err(|e| Error::Solver(e.to_string()))?
        .build()
        .map_err(|e| Error::Solver(e.to_string()))?;

    let problem = ProblemBuilder::default()
        .add_jobs(jobs.into_iter())
        .add_vehicles(std::iter::once(vehicle))
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

    let route = solution
        .routes
        .first()
        .ok_or_else(|| Error::Solver("tour solution has no route".to_string()))?;
    let mut order = vec![0usize];
    for activity in route.tour.all_activities() {
        if activity.job.is_some() {
            order.push(activity.place.location);
        }
    }
    Ok(order)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::routing::pathfind::test_support::{graph, symbol};

    #[test]
    fn test_tour_visits_collinear_points_in_order() {
        let g = graph(&[
            ("X1-S1-A1", 0.0, 0.0, true),
            ("X1-S1-B1", 100.0, 0.0, true),
            ("X1-S1-C1", 200.0, 0.0, true),
            ("X1-S1-D1", 300.0, 0.0, true),
        ]);
        let engine = RoutingEngine::with_time_limits(
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let plan = engine
            .optimize_tour(
                &g,
                &[symbol("X1-S1-C1"), symbol("X1-S1-B1"), symbol("X1-S1-D1")],
                &symbol("X1-S1-A1"),
                400,
                30,
                false,
            )
            .unwrap();
        assert_eq!(
            plan.ordered_waypoints,
            vec![
                symbol("X1-S1-A1"),
                symbol("X1-S1-B1"),
                symbol("X1-S1-C1"),
                symbol("X1-S1-D1"),
            ]
        );
        assert_eq!(plan.legs.len(), 3);
        assert_eq!(plan.total_distance, 300.0);
    }

    #[test]
    fn test_tour_with_return_leg() {
        let g = graph(&[
            ("X1-S1-A1", 0.0, 0.0, true),
            ("X1-S1-B1", 50.0, 0.0, true),
        ]);
        let engine = RoutingEngine::with_time_limits(
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let plan = engine
            .optimize_tour(&g, &[symbol("X1-S1-B1")], &symbol("X1-S1-A1"), 400, 30, true)
            .unwrap();
        assert_eq!(plan.legs.len(), 2);
        assert_eq!(plan.legs[1].to_waypoint, symbol("X1-S1-A1"));
    }

    #[test]
    fn test_trivial_tour() {
        let g = graph(&[("X1-S1-A1", 0.0, 0.0, true)]);
        let engine = RoutingEngine::new();
        let plan = engine
            .optimize_tour(&g, &[], &symbol("X1-S1-A1"), 400, 30, false)
            .unwrap();
        assert_eq!(plan.ordered_waypoints, vec![symbol("X1-S1-A1")]);
        assert!(plan.legs.is_empty());
    }

    #[test]
    fn test_fueled_tour_replays_real_fuel_state() {
        // small tank: every leg needs a refuel at its fuel-station origin
        let g = graph(&[
            ("X1-S1-A1", 0.0, 0.0, true),
            ("X1-S1-B1", 60.0, 0.0, true),
            ("X1-S1-C1", 120.0, 0.0, true),
        ]);
        let engine = RoutingEngine::with_time_limits(
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let plan = engine
            .optimize_fueled_tour(
                &g,
                &[symbol("X1-S1-B1"), symbol("X1-S1-C1")],
                &symbol("X1-S1-A1"),
                None,
                80,
                80,
                30,
            )
            .unwrap();
        assert_eq!(plan.legs.len(), 2);
        // second leg starts with 20 fuel left; B sells fuel, so the replay
        // inserts a refuel before departing
        assert!(plan.legs[1].refuel_before || plan.legs[1].intermediate_stops.len() > 0);
        assert!(plan.refuel_stops >= 1);
    }

    #[test]
    fn test_fueled_tour_respects_return_waypoint() {
        let g = graph(&[
            ("X1-S1-A1", 0.0, 0.0, true),
            ("X1-S1-B1", 50.0, 0.0, true),
        ]);
        let engine = RoutingEngine::with_time_limits(
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let plan = engine
            .optimize_fueled_tour(
                &g,
                &[symbol("X1-S1-B1")],
                &symbol("X1-S1-A1"),
                Some(&symbol("X1-S1-A1")),
                400,
                400,
                30,
            )
            .unwrap();
        let last = plan.legs.last().unwrap();
        assert_eq!(last.to_waypoint, symbol("X1-S1-A1"));
    }
}

use super::{
    DRIFT_TIME_PENALTY, ORBITAL_HOP_TIME, PathPlan, REFUEL_THRESHOLD, RouteStep, RoutingEngine,
    SAFETY_MARGIN, fuel_cost, travel_time,
};
use crate::models::{ShipFlightMode, SystemGraph, WaypointSymbol, is_orbital_hop};
use crate::{Error, Result};
use log::*;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// A search state over (waypoint, fuel). Ordered by cumulative time; among
/// equal times the most recently enqueued state is explored first, which
/// keeps refuel-then-travel plans ahead of equal-time plans that skip the
/// refuel.
struct SearchNode {
    total_time: i64,
    counter: u64,
    waypoint: WaypointSymbol,
    fuel_remaining: i64,
    fuel_used: i64,
    path: Vec<RouteStep>,
}

impl Ord for SearchNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_time
            .cmp(&other.total_time)
            .then_with(|| other.counter.cmp(&self.counter))
    }
}

impl PartialOrd for SearchNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SearchNode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SearchNode {}

impl RoutingEngine {
    /// Minimum-time sequence of TRAVEL and REFUEL steps from `start` to
    /// `goal`, holding `SAFETY_MARGIN` fuel in reserve everywhere except the
    /// final hop. DRIFT is only emitted when neither BURN nor CRUISE fits,
    /// and carries a large time penalty unless `fuel_efficient` is set.
    #[allow(clippy::too_many_arguments)]
    pub fn find_optimal_path(
        &self,
        graph: &SystemGraph,
        start: &WaypointSymbol,
        goal: &WaypointSymbol,
        current_fuel: i64,
        fuel_capacity: i64,
        engine_speed: i64,
        fuel_efficient: bool,
        prefer_cruise: bool,
    ) -> Result<PathPlan> {
        debug!(
            "Finding path: {} -> {}, fuel={}/{}, fuel_efficient={}, prefer_cruise={}",
            start, goal, current_fuel, fuel_capacity, fuel_efficient, prefer_cruise
        );

        if !graph.contains_key(start) || !graph.contains_key(goal) {
            return Err(self.no_path_error(graph, start, goal, current_fuel, fuel_capacity));
        }
        if start == goal {
            return Ok(PathPlan::default());
        }
        // probes without tanks skip all fuel logic
        if fuel_capacity == 0 {
            return self.find_path_no_fuel(graph, start, goal, engine_speed);
        }

        let refuel_threshold = (fuel_capacity as f64 * REFUEL_THRESHOLD) as i64;
        let goal_wp = &graph[goal];

        let mut heap: BinaryHeap<std::cmp::Reverse<SearchNode>> = BinaryHeap::new();
        let mut counter: u64 = 0;
        heap.push(std::cmp::Reverse(SearchNode {
            total_time: 0,
            counter,
            waypoint: start.clone(),
            fuel_remaining: current_fuel,
            fuel_used: 0,
            path: Vec::new(),
        }));
        counter += 1;

        // best time seen per (waypoint, fuel bucket)
        let mut visited: HashMap<(WaypointSymbol, i64), i64> = HashMap::new();

        while let Some(std::cmp::Reverse(node)) = heap.pop() {
            let SearchNode {
                total_time,
                waypoint: current,
                fuel_remaining,
                fuel_used,
                path,
                ..
            } = node;

            if current == *goal {
                let total_distance = path
                    .iter()
                    .map(|step| match step {
                        RouteStep::Travel { distance, .. } => *distance,
                        RouteStep::Refuel { .. } => 0.0,
                    })
                    .sum();
                return Ok(PathPlan {
                    steps: path,
                    total_fuel_cost: fuel_used,
                    total_time,
                    total_distance,
                });
            }

            let state = (current.clone(), fuel_remaining / 10);
            if let Some(best) = visited.get(&state) {
                if *best <= total_time {
                    continue;
                }
            }
            visited.insert(state, total_time);

            let current_wp = &graph[&current];

            // 90% rule at the start node: a ship at a fuel station departs
            // with a full tank, and never departs at all with less fuel than
            // a direct cruise to the goal would take
            let at_start_low_fuel = current == *start
                && path.is_empty()
                && current_wp.has_fuel
                && fuel_remaining < fuel_capacity;
            if at_start_low_fuel {
                let cruise_to_goal = fuel_cost(ShipFlightMode::Cruise, current_wp.distance_to(goal_wp));
                if fuel_remaining < refuel_threshold || fuel_remaining < cruise_to_goal {
                    heap.push(std::cmp::Reverse(SearchNode {
                        total_time,
                        counter,
                        waypoint: current.clone(),
                        fuel_remaining: fuel_capacity,
                        fuel_used,
                        path: push_step(
                            &path,
                            RouteStep::Refuel {
                                waypoint: current.clone(),
                                refuel_amount: fuel_capacity - fuel_remaining,
                            },
                        ),
                    }));
                    counter += 1;
                    continue;
                }
            }

            // Mid-path refuel branch, enqueued alongside the travel options
            // so the search compares refueling against pressing on. Triggered
            // by the 90% threshold or by having less than a direct cruise to
            // the goal left in the tank.
            if !path.is_empty() && current_wp.has_fuel && fuel_remaining < fuel_capacity {
                let cruise_to_goal = fuel_cost(ShipFlightMode::Cruise, current_wp.distance_to(goal_wp));
                if fuel_remaining < refuel_threshold || fuel_remaining < cruise_to_goal {
                    heap.push(std::cmp::Reverse(SearchNode {
                        total_time,
                        counter,
                        waypoint: current.clone(),
                        fuel_remaining: fuel_capacity,
                        fuel_used,
                        path: push_step(
                            &path,
                            RouteStep::Refuel {
                                waypoint: current.clone(),
                                refuel_amount: fuel_capacity - fuel_remaining,
                            },
                        ),
                    }));
                    counter += 1;
                }
            }

            for (neighbor_symbol, neighbor) in graph.iter() {
                if *neighbor_symbol == current {
                    continue;
                }
                let distance = current_wp.distance_to(neighbor);

                if is_orbital_hop(&current, current_wp, neighbor_symbol, neighbor) {
                    heap.push(std::cmp::Reverse(SearchNode {
                        total_time: total_time + ORBITAL_HOP_TIME,
                        counter,
                        waypoint: neighbor_symbol.clone(),
                        fuel_remaining,
                        fuel_used,
                        path: push_step(
                            &path,
                            RouteStep::Travel {
                                waypoint: neighbor_symbol.clone(),
                                distance: 0.0,
                                fuel_cost: 0,
                                time: ORBITAL_HOP_TIME,
                                mode: ShipFlightMode::Cruise,
                            },
                        ),
                    }));
                    counter += 1;
                    continue;
                }

                let is_goal = neighbor_symbol == goal;
                let burn_cost = fuel_cost(ShipFlightMode::Burn, distance);
                let cruise_cost = fuel_cost(ShipFlightMode::Cruise, distance);

                let mut viable_modes: Vec<(ShipFlightMode, i64)> = Vec::new();
                if !prefer_cruise
                    && (fuel_remaining >= burn_cost + SAFETY_MARGIN
                        || (is_goal && fuel_remaining >= burn_cost))
                {
                    viable_modes.push((ShipFlightMode::Burn, burn_cost));
                }
                if fuel_remaining >= cruise_cost + SAFETY_MARGIN
                    || (is_goal && fuel_remaining >= cruise_cost)
                {
                    viable_modes.push((ShipFlightMode::Cruise, cruise_cost));
                }
                if viable_modes.is_empty() {
                    let drift_cost = fuel_cost(ShipFlightMode::Drift, distance);
                    if fuel_remaining >= drift_cost {
                        viable_modes.push((ShipFlightMode::Drift, drift_cost));
                    }
                }

                for (mode, cost) in viable_modes {
                    let mut time = travel_time(mode, distance, engine_speed);
                    if mode == ShipFlightMode::Drift && !fuel_efficient {
                        time += DRIFT_TIME_PENALTY;
                    }
                    heap.push(std::cmp::Reverse(SearchNode {
                        total_time: total_time + time,
                        counter,
                        waypoint: neighbor_symbol.clone(),
                        fuel_remaining: fuel_remaining - cost,
                        fuel_used: fuel_used + cost,
                        path: push_step(
                            &path,
                            RouteStep::Travel {
                                waypoint: neighbor_symbol.clone(),
                                distance,
                                fuel_cost: cost,
                                time,
                                mode,
                            },
                        ),
                    }));
                    counter += 1;
                }
            }
        }

        Err(self.no_path_error(graph, start, goal, current_fuel, fuel_capacity))
    }

    /// Zero-capacity ships ignore fuel entirely: shortest time path over the
    /// complete graph, cruising every non-orbital leg.
    fn find_path_no_fuel(
        &self,
        graph: &SystemGraph,
        start: &WaypointSymbol,
        goal: &WaypointSymbol,
        engine_speed: i64,
    ) -> Result<PathPlan> {
        use pathfinding::directed::dijkstra::dijkstra;

        let result = dijkstra(
            start,
            |symbol| {
                let wp = &graph[symbol];
                graph
                    .iter()
                    .filter(|&(other_symbol, _)| other_symbol != symbol)
                    .map(|(other_symbol, other)| {
                        let time = if is_orbital_hop(symbol, wp, other_symbol, other) {
                            ORBITAL_HOP_TIME
                        } else {
                            travel_time(ShipFlightMode::Cruise, wp.distance_to(other), engine_speed)
                        };
                        (other_symbol.clone(), time)
                    })
                    .collect::<Vec<_>>()
            },
            |symbol| symbol == goal,
        );

        let (nodes, total_time) = result.ok_or_else(|| {
            self.no_path_error(graph, start, goal, 0, 0)
        })?;

        let mut steps = Vec::new();
        let mut total_distance = 0.0;
        for (from_symbol, to_symbol) in nodes.iter().zip(nodes.iter().skip(1)) {
            let from = &graph[from_symbol];
            let to = &graph[to_symbol];
            let (distance, time) = if is_orbital_hop(from_symbol, from, to_symbol, to) {
                (0.0, ORBITAL_HOP_TIME)
            } else {
                let distance = from.distance_to(to);
                (
                    distance,
                    travel_time(ShipFlightMode::Cruise, distance, engine_speed),
                )
            };
            total_distance += distance;
            steps.push(RouteStep::Travel {
                waypoint: to_symbol.clone(),
                distance,
                fuel_cost: 0,
                time,
                mode: ShipFlightMode::Cruise,
            });
        }
        Ok(PathPlan {
            steps,
            total_fuel_cost: 0,
            total_time,
            total_distance,
        })
    }

    /// Cached pathfinding used by the tour and fleet matrix builders: always
    /// planned with a full tank.
    pub fn cached_full_tank_path(
        &self,
        graph: &SystemGraph,
        origin: &WaypointSymbol,
        target: &WaypointSymbol,
        fuel_capacity: i64,
        engine_speed: i64,
    ) -> Option<PathPlan> {
        let key = (
            origin.clone(),
            target.clone(),
            fuel_capacity,
            engine_speed,
        );
        if let Some(cached) = self.path_cache.get(&key) {
            return cached.value().clone();
        }
        let plan = self
            .find_optimal_path(
                graph,
                origin,
                target,
                fuel_capacity,
                fuel_capacity,
                engine_speed,
                false,
                false,
            )
            .ok();
        self.path_cache.insert(key, plan.clone());
        plan
    }

    fn no_path_error(
        &self,
        graph: &SystemGraph,
        start: &WaypointSymbol,
        goal: &WaypointSymbol,
        current_fuel: i64,
        fuel_capacity: i64,
    ) -> Error {
        let fuel_stations = graph.values().filter(|wp| wp.has_fuel).count();
        Error::Routing(format!(
            "no route from {} to {}: {} waypoints cached, {} fuel stations, fuel {}/{}",
            start,
            goal,
            graph.len(),
            fuel_stations,
            current_fuel,
            fuel_capacity
        ))
    }
}

fn push_step(path: &[RouteStep], step: RouteStep) -> Vec<RouteStep> {
    let mut new_path = Vec::with_capacity(path.len() + 1);
    new_path.extend_from_slice(path);
    new_path.push(step);
    new_path
}

#[cfg(test)]
pub mod test_support {
    use crate::models::{SystemGraph, Waypoint, WaypointSymbol};
    use std::collections::BTreeSet;

    pub fn graph(waypoints: &[(&str, f64, f64, bool)]) -> SystemGraph {
        waypoints
            .iter()
            .map(|(symbol, x, y, has_fuel)| {
                (
                    WaypointSymbol::new(symbol),
                    Waypoint {
                        x: *x,
                        y: *y,
                        waypoint_type: "PLANET".to_string(),
                        traits: if *has_fuel {
                            ["MARKETPLACE".to_string()].into_iter().collect()
                        } else {
                            BTreeSet::new()
                        },
                        has_fuel: *has_fuel,
                        orbitals: BTreeSet::new(),
                    },
                )
            })
            .collect()
    }

    pub fn symbol(s: &str) -> WaypointSymbol {
        WaypointSymbol::new(s)
    }
}

#[cfg(test)]
mod test {
    use super::test_support::{graph, symbol};
    use super::*;

    fn travel_steps(plan: &PathPlan) -> Vec<(String, ShipFlightMode, i64)> {
        plan.steps
            .iter()
            .filter_map(|step| match step {
                RouteStep::Travel {
                    waypoint,
                    mode,
                    fuel_cost,
                    ..
                } => Some((waypoint.to_string(), *mode, *fuel_cost)),
                RouteStep::Refuel { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_low_fuel_start_refuels_then_cruises() {
        // A has fuel; 40/100 is below both the 90% threshold and the 60 fuel
        // a direct cruise to C needs
        let g = graph(&[
            ("X1-S1-A1", 0.0, 0.0, true),
            ("X1-S1-B1", 30.0, 0.0, false),
            ("X1-S1-C1", 60.0, 0.0, false),
        ]);
        let engine = RoutingEngine::new();
        let plan = engine
            .find_optimal_path(&g, &symbol("X1-S1-A1"), &symbol("X1-S1-C1"), 40, 100, 30, false, true)
            .unwrap();

        assert!(matches!(
            plan.steps.first(),
            Some(RouteStep::Refuel { refuel_amount: 60, .. })
        ));
        assert_eq!(
            travel_steps(&plan),
            vec![
                ("X1-S1-B1".to_string(), ShipFlightMode::Cruise, 30),
                ("X1-S1-C1".to_string(), ShipFlightMode::Cruise, 30),
            ]
        );
        assert_eq!(plan.total_fuel_cost, 60);
        assert_eq!(plan.total_time, 62);
    }

    #[test]
    fn test_orbital_sibling_is_free() {
        let mut g = graph(&[("X1-S1-A1", 5.0, 5.0, false), ("X1-S1-A2", 40.0, 40.0, false)]);
        g.get_mut(&symbol("X1-S1-A1"))
            .unwrap()
            .orbitals
            .insert(symbol("X1-S1-A2"));
        let engine = RoutingEngine::new();
        let plan = engine
            .find_optimal_path(&g, &symbol("X1-S1-A1"), &symbol("X1-S1-A2"), 10, 100, 30, false, false)
            .unwrap();
        assert_eq!(plan.total_time, 1);
        assert_eq!(plan.total_fuel_cost, 0);
        assert_eq!(plan.steps.len(), 1);
    }

    #[test]
    fn test_identical_coordinates_are_orbital_siblings() {
        let g = graph(&[("X1-S1-A1", 5.0, 5.0, false), ("X1-S1-B1", 5.0, 5.0, false)]);
        let engine = RoutingEngine::new();
        let plan = engine
            .find_optimal_path(&g, &symbol("X1-S1-A1"), &symbol("X1-S1-B1"), 0, 100, 30, false, false)
            .unwrap();
        assert_eq!(plan.total_time, 1);
        assert_eq!(plan.total_fuel_cost, 0);
    }

    #[test]
    fn test_start_equals_goal_is_empty() {
        let g = graph(&[("X1-S1-A1", 0.0, 0.0, true)]);
        let engine = RoutingEngine::new();
        let plan = engine
            .find_optimal_path(&g, &symbol("X1-S1-A1"), &symbol("X1-S1-A1"), 10, 100, 30, false, false)
            .unwrap();
        assert!(plan.steps.is_empty());
        assert_eq!(plan.total_time, 0);
    }

    #[test]
    fn test_ninety_percent_boundary() {
        let g = graph(&[("X1-S1-A1", 0.0, 0.0, true), ("X1-S1-B1", 30.0, 0.0, false)]);
        let engine = RoutingEngine::new();

        // exactly 90% of capacity: no refuel inserted
        let plan = engine
            .find_optimal_path(&g, &symbol("X1-S1-A1"), &symbol("X1-S1-B1"), 90, 100, 30, false, true)
            .unwrap();
        assert!(matches!(plan.steps.first(), Some(RouteStep::Travel { .. })));

        // one unit below: the 90% rule fires
        let plan = engine
            .find_optimal_path(&g, &symbol("X1-S1-A1"), &symbol("X1-S1-B1"), 89, 100, 30, false, true)
            .unwrap();
        assert!(matches!(plan.steps.first(), Some(RouteStep::Refuel { .. })));
    }

    #[test]
    fn test_goal_leg_waives_safety_margin() {
        // 30 fuel reaches the goal at exactly the cruise cost; the start has
        // no fuel station so no refuel is possible
        let g = graph(&[("X1-S1-A1", 0.0, 0.0, false), ("X1-S1-B1", 30.0, 0.0, false)]);
        let engine = RoutingEngine::new();
        let plan = engine
            .find_optimal_path(&g, &symbol("X1-S1-A1"), &symbol("X1-S1-B1"), 30, 100, 30, false, true)
            .unwrap();
        assert_eq!(
            travel_steps(&plan),
            vec![("X1-S1-B1".to_string(), ShipFlightMode::Cruise, 30)]
        );
    }

    #[test]
    fn test_drift_only_as_last_resort() {
        // 20 fuel cannot cruise 30 even with the goal waiver; drift is the
        // only option and is taken despite the penalty
        let g = graph(&[("X1-S1-A1", 0.0, 0.0, false), ("X1-S1-B1", 30.0, 0.0, false)]);
        let engine = RoutingEngine::new();
        let plan = engine
            .find_optimal_path(&g, &symbol("X1-S1-A1"), &symbol("X1-S1-B1"), 20, 100, 30, false, false)
            .unwrap();
        assert_eq!(travel_steps(&plan)[0].1, ShipFlightMode::Drift);
        assert!(plan.total_time > DRIFT_TIME_PENALTY);
    }

    #[test]
    fn test_refuel_preferred_over_drift() {
        // when the start is a fuel station, a refuel beats limping away in
        // drift mode
        let g = graph(&[("X1-S1-A1", 0.0, 0.0, true), ("X1-S1-B1", 30.0, 0.0, false)]);
        let engine = RoutingEngine::new();
        let plan = engine
            .find_optimal_path(&g, &symbol("X1-S1-A1"), &symbol("X1-S1-B1"), 10, 100, 30, false, true)
            .unwrap();
        assert!(matches!(plan.steps.first(), Some(RouteStep::Refuel { .. })));
        for (_, mode, _) in travel_steps(&plan) {
            assert_ne!(mode, ShipFlightMode::Drift);
        }
    }

    #[test]
    fn test_burn_used_when_cruise_not_preferred() {
        let g = graph(&[("X1-S1-A1", 0.0, 0.0, false), ("X1-S1-B1", 30.0, 0.0, false)]);
        let engine = RoutingEngine::new();
        let plan = engine
            .find_optimal_path(&g, &symbol("X1-S1-A1"), &symbol("X1-S1-B1"), 100, 100, 30, false, false)
            .unwrap();
        assert_eq!(travel_steps(&plan)[0].1, ShipFlightMode::Burn);

        let plan = engine
            .find_optimal_path(&g, &symbol("X1-S1-A1"), &symbol("X1-S1-B1"), 100, 100, 30, false, true)
            .unwrap();
        assert_eq!(travel_steps(&plan)[0].1, ShipFlightMode::Cruise);
    }

    #[test]
    fn test_probe_routes_without_fuel() {
        let g = graph(&[
            ("X1-S1-A1", 0.0, 0.0, false),
            ("X1-S1-B1", 300.0, 0.0, false),
        ]);
        let engine = RoutingEngine::new();
        let plan = engine
            .find_optimal_path(&g, &symbol("X1-S1-A1"), &symbol("X1-S1-B1"), 0, 0, 30, false, false)
            .unwrap();
        assert_eq!(plan.total_fuel_cost, 0);
        assert_eq!(
            travel_steps(&plan),
            vec![("X1-S1-B1".to_string(), ShipFlightMode::Cruise, 0)]
        );
    }

    #[test]
    fn test_no_path_reports_diagnostics() {
        // zero fuel, no stations anywhere: even drift cannot move
        let g = graph(&[("X1-S1-A1", 0.0, 0.0, false), ("X1-S1-B1", 30.0, 0.0, false)]);
        let engine = RoutingEngine::new();
        let err = engine
            .find_optimal_path(&g, &symbol("X1-S1-A1"), &symbol("X1-S1-B1"), 0, 100, 30, false, false)
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("2 waypoints"));
        assert!(message.contains("0 fuel stations"));
        assert!(message.contains("0/100"));
    }

    #[test]
    fn test_mid_path_refuel_station_used() {
        // too far for one tank, reachable with a stop at the midpoint market
        let g = graph(&[
            ("X1-S1-A1", 0.0, 0.0, true),
            ("X1-S1-B1", 80.0, 0.0, true),
            ("X1-S1-C1", 160.0, 0.0, false),
        ]);
        let engine = RoutingEngine::new();
        let plan = engine
            .find_optimal_path(&g, &symbol("X1-S1-A1"), &symbol("X1-S1-C1"), 100, 100, 30, false, true)
            .unwrap();
        let refuels: Vec<_> = plan
            .steps
            .iter()
            .filter(|step| matches!(step, RouteStep::Refuel { .. }))
            .collect();
        assert_eq!(refuels.len(), 1);
        for (_, mode, _) in travel_steps(&plan) {
            assert_eq!(mode, ShipFlightMode::Cruise);
        }
        assert_eq!(plan.total_fuel_cost, 160);
    }
}

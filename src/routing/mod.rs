pub mod fleet;
pub mod pathfind;
pub mod tour;

use crate::models::{ShipFlightMode, WaypointSymbol};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;

/// Fuel units reserved beyond a segment's minimum requirement, waived only on
/// the final hop to the goal.
pub const SAFETY_MARGIN: i64 = 4;
/// Additive penalty keeping DRIFT out of plans unless nothing else fits.
pub const DRIFT_TIME_PENALTY: i64 = 100_000;
pub const ORBITAL_HOP_TIME: i64 = 1;
/// Below this fraction of capacity, a ship at a fuel station refuels before
/// departing.
pub const REFUEL_THRESHOLD: f64 = 0.9;

const DEFAULT_TSP_TIME_LIMIT: Duration = Duration::from_secs(5);
const DEFAULT_VRP_TIME_LIMIT: Duration = Duration::from_secs(30);

pub fn time_multiplier(mode: ShipFlightMode) -> i64 {
    match mode {
        ShipFlightMode::Cruise => 31,
        ShipFlightMode::Drift => 26,
        ShipFlightMode::Burn => 15,
        ShipFlightMode::Stealth => 50,
    }
}

pub fn fuel_rate(mode: ShipFlightMode) -> f64 {
    match mode {
        ShipFlightMode::Cruise => 1.0,
        ShipFlightMode::Drift => 0.003,
        ShipFlightMode::Burn => 2.0,
        ShipFlightMode::Stealth => 1.0,
    }
}

pub fn fuel_cost(mode: ShipFlightMode, distance: f64) -> i64 {
    if distance <= 0.0 {
        return 0;
    }
    std::cmp::max(1, (distance * fuel_rate(mode)).ceil() as i64)
}

pub fn travel_time(mode: ShipFlightMode, distance: f64, engine_speed: i64) -> i64 {
    if distance <= 0.0 {
        return 0;
    }
    let speed = std::cmp::max(1, engine_speed) as f64;
    std::cmp::max(
        1,
        ((distance * time_multiplier(mode) as f64) / speed) as i64,
    )
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action")]
pub enum RouteStep {
    #[serde(rename = "TRAVEL")]
    Travel {
        waypoint: WaypointSymbol,
        distance: f64,
        fuel_cost: i64,
        time: i64,
        mode: ShipFlightMode,
    },
    #[serde(rename = "REFUEL")]
    Refuel {
        waypoint: WaypointSymbol,
        refuel_amount: i64,
    },
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct PathPlan {
    pub steps: Vec<RouteStep>,
    pub total_fuel_cost: i64,
    pub total_time: i64,
    pub total_distance: f64,
}

/// An executable route: ordered travel segments, optionally preceded by a
/// refuel at the origin, with mid-route refuels attached to the segment they
/// follow.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Route {
    pub segments: Vec<RouteSegment>,
    pub refuel_before_departure: bool,
    pub total_time: i64,
    pub total_fuel: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteSegment {
    pub from_waypoint: WaypointSymbol,
    pub to_waypoint: WaypointSymbol,
    pub distance: f64,
    pub fuel_required: i64,
    pub travel_time: i64,
    pub flight_mode: ShipFlightMode,
    pub requires_refuel_before_next: bool,
}

impl Route {
    pub fn from_plan(plan: &PathPlan, start: &WaypointSymbol) -> Route {
        let mut segments: Vec<RouteSegment> = Vec::new();
        let mut refuel_before_departure = false;
        for step in &plan.steps {
            match step {
                RouteStep::Travel {
                    waypoint,
                    distance,
                    fuel_cost,
                    time,
                    mode,
                } => {
                    let from_waypoint = segments
                        .last()
                        .map(|segment| segment.to_waypoint.clone())
                        .unwrap_or_else(|| start.clone());
                    segments.push(RouteSegment {
                        from_waypoint,
                        to_waypoint: waypoint.clone(),
                        distance: *distance,
                        fuel_required: *fuel_cost,
                        travel_time: *time,
                        flight_mode: *mode,
                        requires_refuel_before_next: false,
                    });
                }
                RouteStep::Refuel { .. } => match segments.last_mut() {
                    Some(segment) => segment.requires_refuel_before_next = true,
                    None => refuel_before_departure = true,
                },
            }
        }
        Route {
            segments,
            refuel_before_departure,
            total_time: plan.total_time,
            total_fuel: plan.total_fuel_cost,
        }
    }
}

type PathCacheKey = (WaypointSymbol, WaypointSymbol, i64, i64);

/// Shared routing engine: single-ship pathfinding plus the tour and fleet
/// optimizers, with a pathfinding cache keyed on
/// (origin, target, fuel_capacity, engine_speed).
pub struct RoutingEngine {
    pub(crate) tsp_time_limit: Duration,
    pub(crate) vrp_time_limit: Duration,
    pub(crate) path_cache: DashMap<PathCacheKey, Option<PathPlan>>,
}

impl Default for RoutingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingEngine {
    pub fn new() -> RoutingEngine {
        RoutingEngine {
            tsp_time_limit: DEFAULT_TSP_TIME_LIMIT,
            vrp_time_limit: DEFAULT_VRP_TIME_LIMIT,
            path_cache: DashMap::new(),
        }
    }

    pub fn with_time_limits(tsp: Duration, vrp: Duration) -> RoutingEngine {
        RoutingEngine {
            tsp_time_limit: tsp,
            vrp_time_limit: vrp,
            path_cache: DashMap::new(),
        }
    }

    pub fn clear_cache(&self) {
        self.path_cache.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fuel_cost_per_mode() {
        assert_eq!(fuel_cost(ShipFlightMode::Cruise, 30.0), 30);
        assert_eq!(fuel_cost(ShipFlightMode::Burn, 30.0), 60);
        assert_eq!(fuel_cost(ShipFlightMode::Drift, 30.0), 1);
        assert_eq!(fuel_cost(ShipFlightMode::Stealth, 30.0), 30);
        // minimum one unit for any positive distance
        assert_eq!(fuel_cost(ShipFlightMode::Drift, 0.5), 1);
        assert_eq!(fuel_cost(ShipFlightMode::Cruise, 0.0), 0);
    }

    #[test]
    fn test_travel_time_per_mode() {
        assert_eq!(travel_time(ShipFlightMode::Cruise, 30.0, 30), 31);
        assert_eq!(travel_time(ShipFlightMode::Burn, 30.0, 30), 15);
        assert_eq!(travel_time(ShipFlightMode::Drift, 30.0, 30), 26);
        assert_eq!(travel_time(ShipFlightMode::Stealth, 30.0, 30), 50);
        // engine speed is clamped to at least one
        assert_eq!(travel_time(ShipFlightMode::Cruise, 10.0, 0), 310);
        assert_eq!(travel_time(ShipFlightMode::Cruise, 0.0, 30), 0);
    }

    #[test]
    fn test_route_from_plan_marks_refuels() {
        let a = WaypointSymbol::new("X1-S1-A1");
        let b = WaypointSymbol::new("X1-S1-B1");
        let c = WaypointSymbol::new("X1-S1-C1");
        let plan = PathPlan {
            steps: vec![
                RouteStep::Refuel {
                    waypoint: a.clone(),
                    refuel_amount: 60,
                },
                RouteStep::Travel {
                    waypoint: b.clone(),
                    distance: 30.0,
                    fuel_cost: 30,
                    time: 31,
                    mode: ShipFlightMode::Cruise,
                },
                RouteStep::Refuel {
                    waypoint: b.clone(),
                    refuel_amount: 30,
                },
                RouteStep::Travel {
                    waypoint: c.clone(),
                    distance: 30.0,
                    fuel_cost: 30,
                    time: 31,
                    mode: ShipFlightMode::Cruise,
                },
            ],
            total_fuel_cost: 60,
            total_time: 62,
            total_distance: 60.0,
        };
        let route = Route::from_plan(&plan, &a);
        assert!(route.refuel_before_departure);
        assert_eq!(route.segments.len(), 2);
        assert_eq!(route.segments[0].from_waypoint, a);
        assert_eq!(route.segments[0].to_waypoint, b);
        assert!(route.segments[0].requires_refuel_before_next);
        assert!(!route.segments[1].requires_refuel_before_next);
    }
}

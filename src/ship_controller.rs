use crate::api_client::api_models::TradeResponse;
use crate::api_client::{ApiClient, ShipOpsApi};
use crate::database::DbClient;
use crate::models::*;
use crate::routing::{REFUEL_THRESHOLD, Route, RoutingEngine};
use crate::universe::Universe;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use log::*;
use std::sync::{Arc, Mutex};

/// Extra wait after the reported arrival time, covering clock skew between
/// us and the remote.
pub const ARRIVAL_BUFFER_SECONDS: i64 = 3;

pub fn arrival_wait_seconds(arrival: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    std::cmp::max(0, (arrival - now).num_seconds()) + ARRIVAL_BUFFER_SECONDS
}

#[derive(Debug, Clone)]
pub struct RefuelOutcome {
    pub ship: Ship,
    pub fuel_added: i64,
    pub cost: i64,
}

/// Orchestrates one ship's state against the remote: idempotent dock/orbit
/// transitions, transit waits, and the navigation workflow. Every
/// side-effecting call is followed by a full resync because the remote's
/// transition endpoints return partial state.
#[derive(Clone)]
pub struct ShipController {
    pub ship_symbol: String,
    pub player_id: i64,
    ship: Arc<Mutex<Ship>>,

    api: Arc<dyn ShipOpsApi>,
    pub universe: Universe,
    pub db: DbClient,
    pub routing: Arc<RoutingEngine>,
}

impl ShipController {
    pub async fn acquire(
        api_client: &ApiClient,
        universe: &Universe,
        db: &DbClient,
        routing: &Arc<RoutingEngine>,
        player_id: i64,
        ship_symbol: &str,
    ) -> Result<ShipController> {
        let api: Arc<dyn ShipOpsApi> = Arc::new(api_client.clone());
        let ship = api.get_ship(ship_symbol).await?;
        db.save_ship(player_id, &ship).await?;
        Ok(ShipController {
            ship_symbol: ship_symbol.to_string(),
            player_id,
            ship: Arc::new(Mutex::new(ship)),
            api,
            universe: universe.clone(),
            db: db.clone(),
            routing: routing.clone(),
        })
    }

    pub fn ship(&self) -> Ship {
        self.ship.lock().unwrap().clone()
    }
    pub fn nav_status(&self) -> ShipNavStatus {
        self.ship.lock().unwrap().nav.status
    }
    pub fn flight_mode(&self) -> ShipFlightMode {
        self.ship.lock().unwrap().nav.flight_mode
    }
    pub fn waypoint(&self) -> WaypointSymbol {
        self.ship.lock().unwrap().nav.waypoint_symbol.clone()
    }
    pub fn system(&self) -> SystemSymbol {
        self.ship.lock().unwrap().nav.system_symbol.clone()
    }
    pub fn fuel(&self) -> ShipFuel {
        self.ship.lock().unwrap().fuel.clone()
    }
    pub fn engine_speed(&self) -> i64 {
        self.ship.lock().unwrap().engine.speed
    }
    pub fn cargo(&self) -> ShipCargo {
        self.ship.lock().unwrap().cargo.clone()
    }
    pub fn fuel_percentage(&self) -> f64 {
        self.ship.lock().unwrap().fuel_percentage()
    }

    fn update_nav(&self, nav: ShipNav) {
        self.ship.lock().unwrap().nav = nav;
    }
    fn update_fuel(&self, fuel: ShipFuel) {
        self.ship.lock().unwrap().fuel = fuel;
    }
    fn update_cargo(&self, cargo: ShipCargo) {
        self.ship.lock().unwrap().cargo = cargo;
    }

    /// Full resync from the remote, refreshing the convenience cache row.
    pub async fn sync(&self) -> Result<Ship> {
        let ship = self.api.get_ship(&self.ship_symbol).await?;
        self.db.save_ship(self.player_id, &ship).await?;
        *self.ship.lock().unwrap() = ship.clone();
        Ok(ship)
    }

    /// No-op when already orbiting; refuses while in transit. Returns true
    /// when a remote transition happened.
    pub async fn ensure_in_orbit(&self) -> Result<bool> {
        match self.nav_status() {
            ShipNavStatus::InOrbit => Ok(false),
            ShipNavStatus::Docked => {
                let response = self.api.orbit_ship(&self.ship_symbol).await?;
                self.update_nav(response.nav);
                self.sync().await?;
                Ok(true)
            }
            ShipNavStatus::InTransit => Err(Error::InvalidState(format!(
                "ship {} is in transit",
                self.ship_symbol
            ))),
        }
    }

    /// No-op when already docked; refuses while in transit.
    pub async fn ensure_docked(&self) -> Result<bool> {
        match self.nav_status() {
            ShipNavStatus::Docked => Ok(false),
            ShipNavStatus::InOrbit => {
                let response = self.api.dock_ship(&self.ship_symbol).await?;
                self.update_nav(response.nav);
                self.sync().await?;
                Ok(true)
            }
            ShipNavStatus::InTransit => Err(Error::InvalidState(format!(
                "ship {} is in transit",
                self.ship_symbol
            ))),
        }
    }

    /// Sleeps out a transit (arrival time plus buffer), then resyncs. Called
    /// on every entry path so repeated commands simply wait the first
    /// transit out.
    pub async fn wait_for_arrival(&self) -> Result<()> {
        if self.nav_status() != ShipNavStatus::InTransit {
            return Ok(());
        }
        let arrival = self.ship.lock().unwrap().nav.route.arrival;
        let wait = arrival_wait_seconds(arrival, Utc::now());
        debug!("[{}] Waiting {}s for arrival", self.ship_symbol, wait);
        tokio::time::sleep(std::time::Duration::from_secs(wait as u64)).await;
        self.sync().await?;
        Ok(())
    }

    pub async fn set_flight_mode(&self, mode: ShipFlightMode) -> Result<()> {
        if self.flight_mode() == mode {
            return Ok(());
        }
        debug!("[{}] Setting flight mode to {}", self.ship_symbol, mode);
        let response = self.api.set_flight_mode(&self.ship_symbol, mode).await?;
        self.update_nav(response.nav);
        Ok(())
    }

    /// Only valid while docked at a waypoint selling fuel. Fills the tank
    /// (or adds `units`), refreshing the credits mirror from the response.
    pub async fn refuel(&self, units: Option<i64>) -> Result<RefuelOutcome> {
        if self.nav_status() != ShipNavStatus::Docked {
            return Err(Error::InvalidState(format!(
                "ship {} must be docked to refuel",
                self.ship_symbol
            )));
        }
        let waypoint = self.universe.get_waypoint(&self.waypoint()).await?;
        if !waypoint.has_fuel {
            return Err(Error::InvalidState(format!(
                "waypoint {} has no fuel for sale",
                self.waypoint()
            )));
        }
        let before = self.fuel().current;
        let response = self.api.refuel_ship(&self.ship_symbol, units).await?;
        self.update_fuel(response.fuel.clone());
        self.db
            .update_player_credits(self.player_id, response.agent.credits)
            .await?;
        let ship = self.sync().await?;
        info!(
            "[{}] Refueled {} units for {} credits",
            self.ship_symbol,
            response.fuel.current - before,
            response.transaction.total_price
        );
        Ok(RefuelOutcome {
            ship,
            fuel_added: response.fuel.current - before,
            cost: response.transaction.total_price,
        })
    }

    async fn dock_refuel_orbit(&self) -> Result<()> {
        self.ensure_docked().await?;
        self.refuel(None).await?;
        self.ensure_in_orbit().await?;
        Ok(())
    }

    /// Navigate to a destination in the ship's system, planning with the
    /// route engine and executing segment by segment. Idempotent: already
    /// being there is an empty completed route, and an in-progress transit is
    /// waited out first.
    pub async fn navigate(&self, destination: &WaypointSymbol) -> Result<Route> {
        self.sync().await?;
        if self.waypoint() == *destination {
            return Ok(Route::default());
        }

        let system = self.system();
        let graph = self.universe.get_system_graph(&system).await?;
        if graph.is_empty() {
            return Err(Error::Routing(format!(
                "no waypoints cached for system {}",
                system
            )));
        }

        let start = self.waypoint();
        let fuel = self.fuel();
        let plan = self.routing.find_optimal_path(
            &graph,
            &start,
            destination,
            fuel.current,
            fuel.capacity,
            self.engine_speed(),
            false,
            true,
        )?;
        let route = Route::from_plan(&plan, &start);

        if self.nav_status() == ShipNavStatus::InTransit {
            info!(
                "[{}] In transit from a previous command, waiting for arrival",
                self.ship_symbol
            );
            self.wait_for_arrival().await?;
        }

        if route.refuel_before_departure {
            self.dock_refuel_orbit().await?;
        }

        for segment in &route.segments {
            self.ensure_in_orbit().await?;

            // a DRIFT departure from a fuel station on a low tank means the
            // planner had nothing better; top up and let the mode stand
            let at_station = graph
                .get(&self.waypoint())
                .map(|wp| wp.has_fuel)
                .unwrap_or(false);
            if segment.flight_mode == ShipFlightMode::Drift
                && self.fuel_percentage() < REFUEL_THRESHOLD
                && segment.from_waypoint == self.waypoint()
                && at_station
            {
                info!(
                    "[{}] Pre-departure refuel at {} before DRIFT leg",
                    self.ship_symbol,
                    self.waypoint()
                );
                self.dock_refuel_orbit().await?;
            }

            self.set_flight_mode(segment.flight_mode).await?;
            let response = self
                .api
                .navigate_ship(&self.ship_symbol, &segment.to_waypoint)
                .await?;
            self.update_nav(response.nav);
            self.update_fuel(response.fuel);
            self.sync().await?;
            if self.nav_status() == ShipNavStatus::InTransit {
                self.wait_for_arrival().await?;
            }

            // opportunistic refuel on arrival (90% rule)
            let arrived_at_station = graph
                .get(&self.waypoint())
                .map(|wp| wp.has_fuel)
                .unwrap_or(false);
            if self.fuel().capacity > 0
                && arrived_at_station
                && self.fuel_percentage() < REFUEL_THRESHOLD
                && !segment.requires_refuel_before_next
            {
                info!(
                    "[{}] Opportunistic refuel at {} ({:.0}%)",
                    self.ship_symbol,
                    self.waypoint(),
                    self.fuel_percentage() * 100.0
                );
                self.dock_refuel_orbit().await?;
            }

            if segment.requires_refuel_before_next {
                self.dock_refuel_orbit().await?;
            }
        }

        Ok(route)
    }

    pub async fn purchase_cargo(&self, good_symbol: &str, units: i64) -> Result<TradeResponse> {
        self.ensure_docked().await?;
        let response = self
            .api
            .purchase_cargo(&self.ship_symbol, good_symbol, units)
            .await?;
        self.update_cargo(response.cargo.clone());
        self.db
            .update_player_credits(self.player_id, response.agent.credits)
            .await?;
        self.db.save_ship(self.player_id, &self.ship()).await?;
        info!(
            "[{}] Bought {} x{} for {} credits",
            self.ship_symbol, good_symbol, response.transaction.units, response.transaction.total_price
        );
        Ok(response)
    }

    pub async fn sell_cargo(&self, good_symbol: &str, units: i64) -> Result<TradeResponse> {
        self.ensure_docked().await?;
        let response = self
            .api
            .sell_cargo(&self.ship_symbol, good_symbol, units)
            .await?;
        self.update_cargo(response.cargo.clone());
        self.db
            .update_player_credits(self.player_id, response.agent.credits)
            .await?;
        self.db.save_ship(self.player_id, &self.ship()).await?;
        info!(
            "[{}] Sold {} x{} for {} credits",
            self.ship_symbol, good_symbol, response.transaction.units, response.transaction.total_price
        );
        Ok(response)
    }

    pub async fn jettison_cargo(&self, good_symbol: &str, units: i64) -> Result<()> {
        let response = self
            .api
            .jettison_cargo(&self.ship_symbol, good_symbol, units)
            .await?;
        self.update_cargo(response.cargo);
        self.db.save_ship(self.player_id, &self.ship()).await?;
        info!("[{}] Jettisoned {} x{}", self.ship_symbol, good_symbol, units);
        Ok(())
    }
}

#[cfg(test)]
impl ShipController {
    pub(crate) fn new_for_test(
        api: Arc<dyn ShipOpsApi>,
        universe: Universe,
        db: DbClient,
        ship: Ship,
    ) -> ShipController {
        ShipController {
            ship_symbol: ship.symbol.clone(),
            player_id: 1,
            ship: Arc::new(Mutex::new(ship)),
            api,
            universe,
            db,
            routing: Arc::new(RoutingEngine::new()),
        }
    }
}

#[cfg(test)]
pub mod test_support {
    use crate::models::*;
    use chrono::Utc;

    pub fn docked_ship(symbol: &str, cargo_capacity: i64, fuel_capacity: i64) -> Ship {
        let waypoint = ShipNavRouteWaypoint {
            symbol: WaypointSymbol::new("X1-S1-A1"),
            waypoint_type: "PLANET".to_string(),
            system_symbol: SystemSymbol::new("X1-S1"),
            x: 0,
            y: 0,
        };
        Ship {
            symbol: symbol.to_string(),
            nav: ShipNav {
                system_symbol: SystemSymbol::new("X1-S1"),
                waypoint_symbol: WaypointSymbol::new("X1-S1-A1"),
                route: ShipNavRoute {
                    origin: waypoint.clone(),
                    destination: waypoint,
                    arrival: Utc::now(),
                    departure_time: Utc::now(),
                },
                status: ShipNavStatus::Docked,
                flight_mode: ShipFlightMode::Cruise,
            },
            fuel: ShipFuel {
                current: fuel_capacity,
                capacity: fuel_capacity,
            },
            engine: ShipEngine {
                symbol: "ENGINE_ION_DRIVE_II".to_string(),
                speed: 30,
            },
            cargo: ShipCargo {
                capacity: cargo_capacity,
                units: 0,
                inventory: vec![],
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::test_support::docked_ship;
    use super::*;
    use crate::api_client::MockShipOpsApi;
    use crate::api_client::api_models::{NavResponse, NavigateResponse, RefuelTransaction};
    use chrono::Duration;
    use mockall::Sequence;

    #[test]
    fn test_arrival_wait_includes_buffer() {
        let now = Utc::now();
        assert_eq!(arrival_wait_seconds(now + Duration::seconds(60), now), 63);
    }

    #[test]
    fn test_arrival_in_past_still_waits_buffer() {
        // a stale transit record still gets the buffer, never a negative wait
        let now = Utc::now();
        assert_eq!(arrival_wait_seconds(now - Duration::seconds(120), now), 3);
        assert_eq!(arrival_wait_seconds(now, now), 3);
    }

    async fn offline_universe() -> (DbClient, Universe) {
        let db = DbClient::connect_in_memory().await.unwrap();
        let universe = Universe::new(&ApiClient::new(), &db);
        (db, universe)
    }

    /// Seed the waypoint store and graph cache so navigation never needs the
    /// remote.
    async fn seed_system(db: &DbClient, waypoints: &[(&str, f64, f64, bool)]) {
        let graph = crate::routing::pathfind::test_support::graph(waypoints);
        let system = SystemSymbol::new("X1-S1");
        let rows: Vec<(WaypointSymbol, Waypoint)> =
            graph.iter().map(|(s, w)| (s.clone(), w.clone())).collect();
        db.save_waypoints(&system, &rows).await.unwrap();
        db.save_system_graph(&system, &graph).await.unwrap();
    }

    fn nav(status: ShipNavStatus, waypoint: &str, arrival: DateTime<Utc>) -> ShipNav {
        let route_waypoint = ShipNavRouteWaypoint {
            symbol: WaypointSymbol::new(waypoint),
            waypoint_type: "PLANET".to_string(),
            system_symbol: SystemSymbol::new("X1-S1"),
            x: 0,
            y: 0,
        };
        ShipNav {
            system_symbol: SystemSymbol::new("X1-S1"),
            waypoint_symbol: WaypointSymbol::new(waypoint),
            route: ShipNavRoute {
                origin: route_waypoint.clone(),
                destination: route_waypoint,
                arrival,
                departure_time: Utc::now(),
            },
            status,
            flight_mode: ShipFlightMode::Cruise,
        }
    }

    fn agent(credits: i64) -> Agent {
        Agent {
            symbol: "AGENT_A".to_string(),
            headquarters: WaypointSymbol::new("X1-S1-A1"),
            credits,
            starting_faction: "CORSAIRS".to_string(),
            ship_count: 1,
        }
    }

    #[tokio::test]
    async fn test_ensure_in_orbit_is_noop_without_remote_calls() {
        let (db, universe) = offline_universe().await;
        let mut ship = docked_ship("TEST-1", 40, 100);
        ship.nav.status = ShipNavStatus::InOrbit;
        // no expectations: any remote call panics the test
        let api = MockShipOpsApi::new();
        let controller = ShipController::new_for_test(Arc::new(api), universe, db, ship);
        assert!(!controller.ensure_in_orbit().await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_docked_is_noop_without_remote_calls() {
        let (db, universe) = offline_universe().await;
        let ship = docked_ship("TEST-1", 40, 100);
        let api = MockShipOpsApi::new();
        let controller = ShipController::new_for_test(Arc::new(api), universe, db, ship);
        assert!(!controller.ensure_docked().await.unwrap());
    }

    #[tokio::test]
    async fn test_transitions_refused_while_in_transit() {
        let (db, universe) = offline_universe().await;
        let mut ship = docked_ship("TEST-1", 40, 100);
        ship.nav.status = ShipNavStatus::InTransit;
        let api = MockShipOpsApi::new();
        let controller = ShipController::new_for_test(Arc::new(api), universe, db, ship);
        assert!(matches!(
            controller.ensure_in_orbit().await.unwrap_err(),
            Error::InvalidState(_)
        ));
        assert!(matches!(
            controller.ensure_docked().await.unwrap_err(),
            Error::InvalidState(_)
        ));
    }

    #[tokio::test]
    async fn test_navigate_to_current_location_is_empty_route() {
        let (db, universe) = offline_universe().await;
        let ship = docked_ship("TEST-1", 40, 100);
        let mut api = MockShipOpsApi::new();
        let resynced = ship.clone();
        api.expect_get_ship()
            .times(1)
            .returning(move |_| Ok(resynced.clone()));
        let controller = ShipController::new_for_test(Arc::new(api), universe, db, ship);
        let route = controller
            .navigate(&WaypointSymbol::new("X1-S1-A1"))
            .await
            .unwrap();
        assert!(route.segments.is_empty());
        assert!(!route.refuel_before_departure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigate_twice_is_idempotent() {
        let (db, universe) = offline_universe().await;
        seed_system(
            &db,
            &[("X1-S1-A1", 0.0, 0.0, false), ("X1-S1-B1", 30.0, 0.0, false)],
        )
        .await;

        let destination = WaypointSymbol::new("X1-S1-B1");
        let ship_at_a = docked_ship("TEST-1", 40, 100);
        let mut in_orbit_a = ship_at_a.clone();
        in_orbit_a.nav.status = ShipNavStatus::InOrbit;
        let arrival = Utc::now() + Duration::seconds(31);
        let mut in_transit = ship_at_a.clone();
        in_transit.nav = nav(ShipNavStatus::InTransit, "X1-S1-B1", arrival);
        in_transit.fuel.current = 70;
        let mut at_b = in_transit.clone();
        at_b.nav.status = ShipNavStatus::InOrbit;

        let mut api = MockShipOpsApi::new();
        let mut seq = Sequence::new();
        // first command: resync, orbit, depart, arrive
        {
            let ship = ship_at_a.clone();
            api.expect_get_ship()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(ship.clone()));
        }
        {
            let nav = nav(ShipNavStatus::InOrbit, "X1-S1-A1", Utc::now());
            api.expect_orbit_ship()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(NavResponse { nav: nav.clone() }));
        }
        {
            let ship = in_orbit_a.clone();
            api.expect_get_ship()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(ship.clone()));
        }
        {
            let response_nav = nav(ShipNavStatus::InTransit, "X1-S1-B1", arrival);
            api.expect_navigate_ship()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_, _| {
                    Ok(NavigateResponse {
                        nav: response_nav.clone(),
                        fuel: ShipFuel {
                            current: 70,
                            capacity: 100,
                        },
                    })
                });
        }
        {
            let ship = in_transit.clone();
            api.expect_get_ship()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(ship.clone()));
        }
        {
            let ship = at_b.clone();
            api.expect_get_ship()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(ship.clone()));
        }
        // second command: a single resync shows the ship already there
        {
            let ship = at_b.clone();
            api.expect_get_ship()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(ship.clone()));
        }

        let controller =
            ShipController::new_for_test(Arc::new(api), universe, db, ship_at_a.clone());

        let route = controller.navigate(&destination).await.unwrap();
        assert_eq!(route.segments.len(), 1);
        assert_eq!(route.segments[0].to_waypoint, destination);
        assert_eq!(route.segments[0].flight_mode, ShipFlightMode::Cruise);
        assert_eq!(controller.nav_status(), ShipNavStatus::InOrbit);
        assert_eq!(controller.waypoint(), destination);

        // the second navigate waits nothing out and changes nothing
        let route = controller.navigate(&destination).await.unwrap();
        assert!(route.segments.is_empty());
        assert_eq!(controller.waypoint(), destination);
    }

    #[tokio::test]
    async fn test_refuel_requires_docked_state() {
        let (db, universe) = offline_universe().await;
        let mut ship = docked_ship("TEST-1", 40, 100);
        ship.nav.status = ShipNavStatus::InOrbit;
        let api = MockShipOpsApi::new();
        let controller = ShipController::new_for_test(Arc::new(api), universe, db, ship);
        assert!(matches!(
            controller.refuel(None).await.unwrap_err(),
            Error::InvalidState(_)
        ));
    }

    #[tokio::test]
    async fn test_refuel_requires_fuel_station() {
        let (db, universe) = offline_universe().await;
        seed_system(&db, &[("X1-S1-A1", 0.0, 0.0, false)]).await;
        let ship = docked_ship("TEST-1", 40, 100);
        let api = MockShipOpsApi::new();
        let controller = ShipController::new_for_test(Arc::new(api), universe, db, ship);
        assert!(matches!(
            controller.refuel(None).await.unwrap_err(),
            Error::InvalidState(_)
        ));
    }

    #[tokio::test]
    async fn test_refuel_fills_tank_and_reports_cost() {
        let (db, universe) = offline_universe().await;
        seed_system(&db, &[("X1-S1-A1", 0.0, 0.0, true)]).await;
        let mut ship = docked_ship("TEST-1", 40, 100);
        ship.fuel.current = 40;
        let mut full = ship.clone();
        full.fuel.current = 100;

        let mut api = MockShipOpsApi::new();
        api.expect_refuel_ship().times(1).returning(move |_, _| {
            Ok(crate::api_client::api_models::RefuelResponse {
                agent: agent(99_863),
                fuel: ShipFuel {
                    current: 100,
                    capacity: 100,
                },
                transaction: RefuelTransaction {
                    waypoint_symbol: WaypointSymbol::new("X1-S1-A1"),
                    ship_symbol: "TEST-1".to_string(),
                    trade_symbol: "FUEL".to_string(),
                    units: 60,
                    price_per_unit: 2,
                    total_price: 137,
                },
            })
        });
        {
            let full = full.clone();
            api.expect_get_ship()
                .times(1)
                .returning(move |_| Ok(full.clone()));
        }

        let controller = ShipController::new_for_test(Arc::new(api), universe, db, ship);
        let outcome = controller.refuel(None).await.unwrap();
        assert_eq!(outcome.fuel_added, 60);
        assert_eq!(outcome.cost, 137);
        assert_eq!(controller.fuel().current, 100);
    }
}

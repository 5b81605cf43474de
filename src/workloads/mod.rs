mod contracts;
mod experiment;
mod navigation;
mod scouting;
mod shipyard;

use crate::api_client::ApiClient;
use crate::daemon::supervisor::{CancelSignal, ContainerSupervisor, CreateContainerRequest};
use crate::database::DbClient;
use crate::models::{LogLevel, RestartPolicy, SystemSymbol, WaypointSymbol};
use crate::routing::RoutingEngine;
use crate::ship_controller::ShipController;
use crate::universe::Universe;
use crate::{Error, Result};
use log::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

fn default_iterations_per_batch() -> u32 {
    3
}

fn default_batch_size_fractions() -> Vec<f64> {
    vec![0.1, 0.25, 0.5, 1.0]
}

/// Typed container configs, dispatched on `command_type`. Unknown tags fail
/// deserialization and therefore fail `container.create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command_type", content = "params")]
pub enum WorkloadConfig {
    NavigateShip {
        ship_symbol: String,
        destination: WaypointSymbol,
    },
    DockShip {
        ship_symbol: String,
    },
    OrbitShip {
        ship_symbol: String,
    },
    RefuelShip {
        ship_symbol: String,
        #[serde(default)]
        units: Option<i64>,
    },
    PurchaseCargo {
        ship_symbol: String,
        good_symbol: String,
        units: i64,
    },
    SellCargo {
        ship_symbol: String,
        good_symbol: String,
        units: i64,
    },
    PurchaseShip {
        ship_symbol: String,
        ship_type: String,
        #[serde(default)]
        shipyard_waypoint: Option<WaypointSymbol>,
    },
    BatchPurchaseShips {
        ship_symbol: String,
        ship_type: String,
        quantity: i64,
        max_budget: i64,
    },
    BatchContract {
        ship_symbol: String,
        iterations: u32,
    },
    ScoutMarkets {
        ship_symbols: Vec<String>,
        markets: Vec<WaypointSymbol>,
        iterations: u32,
        #[serde(default)]
        return_to_start: bool,
    },
    ScoutTour {
        ship_symbol: String,
        markets: Vec<WaypointSymbol>,
        iterations: u32,
        #[serde(default)]
        return_to_start: bool,
    },
    MarketLiquidityExperiment {
        ship_symbols: Vec<String>,
        system_symbol: SystemSymbol,
        #[serde(default = "default_iterations_per_batch")]
        iterations_per_batch: u32,
        #[serde(default = "default_batch_size_fractions")]
        batch_size_fractions: Vec<f64>,
    },
    MarketLiquidityExperimentWorker {
        run_id: String,
        ship_symbol: String,
        #[serde(default = "default_iterations_per_batch")]
        iterations_per_batch: u32,
        #[serde(default = "default_batch_size_fractions")]
        batch_size_fractions: Vec<f64>,
    },
}

impl WorkloadConfig {
    pub fn command_type(&self) -> &'static str {
        match self {
            WorkloadConfig::NavigateShip { .. } => "NavigateShip",
            WorkloadConfig::DockShip { .. } => "DockShip",
            WorkloadConfig::OrbitShip { .. } => "OrbitShip",
            WorkloadConfig::RefuelShip { .. } => "RefuelShip",
            WorkloadConfig::PurchaseCargo { .. } => "PurchaseCargo",
            WorkloadConfig::SellCargo { .. } => "SellCargo",
            WorkloadConfig::PurchaseShip { .. } => "PurchaseShip",
            WorkloadConfig::BatchPurchaseShips { .. } => "BatchPurchaseShips",
            WorkloadConfig::BatchContract { .. } => "BatchContract",
            WorkloadConfig::ScoutMarkets { .. } => "ScoutMarkets",
            WorkloadConfig::ScoutTour { .. } => "ScoutTour",
            WorkloadConfig::MarketLiquidityExperiment { .. } => "MarketLiquidityExperiment",
            WorkloadConfig::MarketLiquidityExperimentWorker { .. } => {
                "MarketLiquidityExperimentWorker"
            }
        }
    }

    /// The ship this workload needs exclusive hold of, when it needs one.
    /// Coordinators claim per-worker ships as they spawn the workers.
    pub fn ship_symbol(&self) -> Option<&str> {
        match self {
            WorkloadConfig::NavigateShip { ship_symbol, .. }
            | WorkloadConfig::DockShip { ship_symbol }
            | WorkloadConfig::OrbitShip { ship_symbol }
            | WorkloadConfig::RefuelShip { ship_symbol, .. }
            | WorkloadConfig::PurchaseCargo { ship_symbol, .. }
            | WorkloadConfig::SellCargo { ship_symbol, .. }
            | WorkloadConfig::PurchaseShip { ship_symbol, .. }
            | WorkloadConfig::BatchPurchaseShips { ship_symbol, .. }
            | WorkloadConfig::BatchContract { ship_symbol, .. }
            | WorkloadConfig::ScoutTour { ship_symbol, .. }
            | WorkloadConfig::MarketLiquidityExperimentWorker { ship_symbol, .. } => {
                Some(ship_symbol)
            }
            WorkloadConfig::ScoutMarkets { .. }
            | WorkloadConfig::MarketLiquidityExperiment { .. } => None,
        }
    }

    pub async fn run(&self, ctx: &WorkloadContext) -> Result<()> {
        match self {
            WorkloadConfig::NavigateShip {
                ship_symbol,
                destination,
            } => navigation::run_navigate(ctx, ship_symbol, destination).await,
            WorkloadConfig::DockShip { ship_symbol } => {
                navigation::run_dock(ctx, ship_symbol).await
            }
            WorkloadConfig::OrbitShip { ship_symbol } => {
                navigation::run_orbit(ctx, ship_symbol).await
            }
            WorkloadConfig::RefuelShip { ship_symbol, units } => {
                navigation::run_refuel(ctx, ship_symbol, *units).await
            }
            WorkloadConfig::PurchaseCargo {
                ship_symbol,
                good_symbol,
                units,
            } => navigation::run_purchase_cargo(ctx, ship_symbol, good_symbol, *units).await,
            WorkloadConfig::SellCargo {
                ship_symbol,
                good_symbol,
                units,
            } => navigation::run_sell_cargo(ctx, ship_symbol, good_symbol, *units).await,
            WorkloadConfig::PurchaseShip {
                ship_symbol,
                ship_type,
                shipyard_waypoint,
            } => {
                shipyard::run_purchase_ship(ctx, ship_symbol, ship_type, shipyard_waypoint.as_ref())
                    .await
                    .map(|_| ())
            }
            WorkloadConfig::BatchPurchaseShips {
                ship_symbol,
                ship_type,
                quantity,
                max_budget,
            } => {
                shipyard::run_batch_purchase_ships(ctx, ship_symbol, ship_type, *quantity, *max_budget)
                    .await
            }
            WorkloadConfig::BatchContract {
                ship_symbol,
                iterations,
            } => contracts::run_batch_contract(ctx, ship_symbol, *iterations).await,
            WorkloadConfig::ScoutMarkets {
                ship_symbols,
                markets,
                iterations,
                return_to_start,
            } => {
                scouting::run_scout_markets(ctx, ship_symbols, markets, *iterations, *return_to_start)
                    .await
            }
            WorkloadConfig::ScoutTour {
                ship_symbol,
                markets,
                iterations,
                return_to_start,
            } => {
                scouting::run_scout_tour(ctx, ship_symbol, markets, *iterations, *return_to_start)
                    .await
            }
            WorkloadConfig::MarketLiquidityExperiment {
                ship_symbols,
                system_symbol,
                iterations_per_batch,
                batch_size_fractions,
            } => {
                experiment::run_coordinator(
                    ctx,
                    ship_symbols,
                    system_symbol,
                    *iterations_per_batch,
                    batch_size_fractions,
                )
                .await
            }
            WorkloadConfig::MarketLiquidityExperimentWorker {
                run_id,
                ship_symbol,
                iterations_per_batch,
                batch_size_fractions,
            } => {
                experiment::run_worker(
                    ctx,
                    run_id,
                    ship_symbol,
                    *iterations_per_batch,
                    batch_size_fractions,
                )
                .await
            }
        }
    }
}

/// Everything a running container composes its work from.
#[derive(Clone)]
pub struct WorkloadContext {
    pub container_id: String,
    pub player_id: i64,
    pub db: DbClient,
    pub api_client: ApiClient,
    pub universe: Universe,
    pub routing: Arc<RoutingEngine>,
    pub supervisor: ContainerSupervisor,
    pub cancel: CancelSignal,
}

impl WorkloadContext {
    /// Container-scoped logging: persisted through the dedup filter, mirrored
    /// to the process log.
    pub async fn log(&self, level: LogLevel, message: &str) {
        match self
            .db
            .log_container(&self.container_id, self.player_id, level, message)
            .await
        {
            Ok(_) => info!("[{}] [{}] {}", self.container_id, level, message),
            Err(e) => {
                error!("Failed to write log to database: {}", e);
                info!("[{}] [{}] {}", self.container_id, level, message);
            }
        }
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::InvalidState("container cancelled".to_string()))
        } else {
            Ok(())
        }
    }

    pub async fn ship_controller(&self, ship_symbol: &str) -> Result<ShipController> {
        ShipController::acquire(
            &self.api_client,
            &self.universe,
            &self.db,
            &self.routing,
            self.player_id,
            ship_symbol,
        )
        .await
    }

    /// Coordinator path for spawning a per-ship worker container: claim the
    /// ship, create the container, and roll the claim back if creation
    /// fails. The same admission rule the control server applies.
    pub async fn spawn_ship_container(
        &self,
        container_id: &str,
        config: &WorkloadConfig,
        restart_policy: RestartPolicy,
    ) -> Result<String> {
        let ship_symbol = config.ship_symbol().ok_or_else(|| {
            Error::InvalidState("worker config does not name a ship".to_string())
        })?;
        let assigned = self
            .db
            .assign_ship(self.player_id, ship_symbol, container_id, config.command_type())
            .await?;
        if !assigned {
            return Err(Error::Conflict(format!(
                "ship {} already assigned",
                ship_symbol
            )));
        }
        let request = CreateContainerRequest {
            container_id: container_id.to_string(),
            player_id: self.player_id,
            container_type: "command".to_string(),
            config: serde_json::to_value(config)?,
            restart_policy,
            max_restarts: crate::daemon::supervisor::DEFAULT_MAX_RESTARTS,
        };
        match self.supervisor.create(request).await {
            Ok(descriptor) => Ok(descriptor.container_id),
            Err(e) => {
                self.db
                    .release_ship(self.player_id, ship_symbol, "create_failed")
                    .await?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_config_round_trip_with_tag() {
        let raw = r#"{
            "command_type": "NavigateShip",
            "params": {"ship_symbol": "SHIP-1", "destination": "X1-S1-B1"}
        }"#;
        let config: WorkloadConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.command_type(), "NavigateShip");
        assert_eq!(config.ship_symbol(), Some("SHIP-1"));

        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["command_type"], "NavigateShip");
        assert_eq!(value["params"]["ship_symbol"], "SHIP-1");
    }

    #[test]
    fn test_unknown_command_type_fails() {
        let raw = r#"{"command_type": "LaunchMissiles", "params": {}}"#;
        assert!(serde_json::from_str::<WorkloadConfig>(raw).is_err());
    }

    #[test]
    fn test_experiment_defaults() {
        let raw = r#"{
            "command_type": "MarketLiquidityExperimentWorker",
            "params": {"run_id": "r-1", "ship_symbol": "SHIP-1"}
        }"#;
        let config: WorkloadConfig = serde_json::from_str(raw).unwrap();
        match config {
            WorkloadConfig::MarketLiquidityExperimentWorker {
                iterations_per_batch,
                batch_size_fractions,
                ..
            } => {
                assert_eq!(iterations_per_batch, 3);
                assert_eq!(batch_size_fractions, vec![0.1, 0.25, 0.5, 1.0]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_coordinator_has_no_exclusive_ship() {
        let raw = r#"{
            "command_type": "ScoutMarkets",
            "params": {"ship_symbols": ["S-1", "S-2"], "markets": ["X1-S1-A1"], "iterations": 2}
        }"#;
        let config: WorkloadConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.ship_symbol(), None);
    }
}

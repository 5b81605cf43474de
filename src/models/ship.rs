use crate::models::{SystemSymbol, WaypointSymbol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ship {
    pub symbol: String,
    pub nav: ShipNav,
    pub fuel: ShipFuel,
    pub engine: ShipEngine,
    pub cargo: ShipCargo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipNav {
    pub system_symbol: SystemSymbol,
    pub waypoint_symbol: WaypointSymbol,
    pub route: ShipNavRoute,
    pub status: ShipNavStatus,
    pub flight_mode: ShipFlightMode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ShipFlightMode {
    #[serde(rename = "CRUISE")]
    Cruise,
    #[serde(rename = "DRIFT")]
    Drift,
    #[serde(rename = "BURN")]
    Burn,
    #[serde(rename = "STEALTH")]
    Stealth,
}

impl std::fmt::Display for ShipFlightMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShipFlightMode::Cruise => "CRUISE",
            ShipFlightMode::Drift => "DRIFT",
            ShipFlightMode::Burn => "BURN",
            ShipFlightMode::Stealth => "STEALTH",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ShipNavStatus {
    #[serde(rename = "DOCKED")]
    Docked,
    #[serde(rename = "IN_TRANSIT")]
    InTransit,
    #[serde(rename = "IN_ORBIT")]
    InOrbit,
}

impl std::fmt::Display for ShipNavStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ShipNavStatus::Docked => "DOCKED",
            ShipNavStatus::InTransit => "IN_TRANSIT",
            ShipNavStatus::InOrbit => "IN_ORBIT",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipNavRoute {
    pub origin: ShipNavRouteWaypoint,
    pub destination: ShipNavRouteWaypoint,
    pub arrival: DateTime<Utc>,
    pub departure_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipNavRouteWaypoint {
    pub symbol: WaypointSymbol,
    #[serde(rename = "type")]
    pub waypoint_type: String,
    pub system_symbol: SystemSymbol,
    pub x: i64,
    pub y: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipFuel {
    pub current: i64,
    pub capacity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipEngine {
    pub symbol: String,
    pub speed: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipCargo {
    pub capacity: i64,
    pub units: i64,
    pub inventory: Vec<ShipCargoItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipCargoItem {
    pub symbol: String,
    pub units: i64,
}

impl ShipCargo {
    pub fn units_of(&self, good: &str) -> i64 {
        self.inventory
            .iter()
            .find(|item| item.symbol == good)
            .map(|item| item.units)
            .unwrap_or(0)
    }

    pub fn space_available(&self) -> i64 {
        self.capacity - self.units
    }

    /// Items other than `good`, largest stacks first.
    pub fn other_items(&self, good: &str) -> Vec<ShipCargoItem> {
        let mut items: Vec<ShipCargoItem> = self
            .inventory
            .iter()
            .filter(|item| item.symbol != good && item.units > 0)
            .cloned()
            .collect();
        items.sort_by_key(|item| -item.units);
        items
    }
}

impl Ship {
    pub fn fuel_percentage(&self) -> f64 {
        if self.fuel.capacity == 0 {
            return 1.0;
        }
        self.fuel.current as f64 / self.fuel.capacity as f64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cargo_units_of() {
        let cargo = ShipCargo {
            capacity: 40,
            units: 15,
            inventory: vec![
                ShipCargoItem {
                    symbol: "IRON_ORE".to_string(),
                    units: 10,
                },
                ShipCargoItem {
                    symbol: "FUEL".to_string(),
                    units: 5,
                },
            ],
        };
        assert_eq!(cargo.units_of("IRON_ORE"), 10);
        assert_eq!(cargo.units_of("GOLD_ORE"), 0);
        assert_eq!(cargo.space_available(), 25);
        let other = cargo.other_items("IRON_ORE");
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].symbol, "FUEL");
    }

    #[test]
    fn test_deserialise_ship() {
        let json = r#"{
            "symbol": "AGENT-1",
            "nav": {
                "systemSymbol": "X1-TZ26",
                "waypointSymbol": "X1-TZ26-A1",
                "route": {
                    "origin": {"symbol":"X1-TZ26-A1","type":"PLANET","systemSymbol":"X1-TZ26","x":23,"y":7},
                    "destination": {"symbol":"X1-TZ26-A1","type":"PLANET","systemSymbol":"X1-TZ26","x":23,"y":7},
                    "arrival": "2024-02-04T11:37:29.703Z",
                    "departureTime": "2024-02-04T11:37:29.703Z"
                },
                "status": "DOCKED",
                "flightMode": "CRUISE"
            },
            "fuel": {"current": 400, "capacity": 400},
            "engine": {"symbol": "ENGINE_ION_DRIVE_II", "speed": 30},
            "cargo": {"capacity": 40, "units": 0, "inventory": []}
        }"#;
        let ship: Ship = serde_json::from_str(json).unwrap();
        assert_eq!(ship.symbol, "AGENT-1");
        assert_eq!(ship.nav.status, ShipNavStatus::Docked);
        assert_eq!(ship.engine.speed, 30);
    }
}

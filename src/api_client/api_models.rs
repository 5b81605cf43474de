use crate::models::{
    Agent, Contract, ShipCargo, ShipFuel, ShipNav, SystemSymbol, WaypointSymbol,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub symbol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaypointDetailed {
    pub system_symbol: SystemSymbol,
    pub symbol: WaypointSymbol,
    #[serde(rename = "type")]
    pub waypoint_type: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub orbitals: Vec<Symbol>,
    #[serde(default)]
    pub traits: Vec<Symbol>,
}

impl WaypointDetailed {
    pub fn has_trait(&self, trait_symbol: &str) -> bool {
        self.traits.iter().any(|t| t.symbol == trait_symbol)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NavResponse {
    pub nav: ShipNav,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NavigateResponse {
    pub nav: ShipNav,
    pub fuel: ShipFuel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefuelTransaction {
    pub waypoint_symbol: WaypointSymbol,
    pub ship_symbol: String,
    pub trade_symbol: String,
    pub units: i64,
    pub price_per_unit: i64,
    pub total_price: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefuelResponse {
    pub agent: Agent,
    pub fuel: ShipFuel,
    pub transaction: RefuelTransaction,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeTransaction {
    pub waypoint_symbol: WaypointSymbol,
    pub ship_symbol: String,
    pub trade_symbol: String,
    #[serde(rename = "type")]
    pub transaction_type: String,
    pub units: i64,
    pub price_per_unit: i64,
    pub total_price: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradeResponse {
    pub agent: Agent,
    pub cargo: ShipCargo,
    pub transaction: TradeTransaction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JettisonResponse {
    pub cargo: ShipCargo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipyardTransaction {
    pub waypoint_symbol: WaypointSymbol,
    pub ship_type: String,
    pub price: i64,
    pub agent_symbol: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PurchaseShipResponse {
    pub agent: Agent,
    pub ship: crate::models::Ship,
    pub transaction: ShipyardTransaction,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractResponse {
    pub contract: Contract,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcceptContractResponse {
    pub agent: Agent,
    pub contract: Contract,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliverContractResponse {
    pub contract: Contract,
    pub cargo: ShipCargo,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{Data, PaginatedList};

    #[test]
    fn test_deserialise_waypoint_page() {
        let json = r#"{"data":[{"systemSymbol":"X1-HN18","symbol":"X1-HN18-ZX1B","type":"GAS_GIANT","x":16,"y":3,"orbitals":[{"symbol":"X1-HN18-ZX1C"}],"traits":[{"symbol":"MARKETPLACE","name":"Marketplace","description":""}],"isUnderConstruction":false}],"meta":{"total":1,"page":1,"limit":20}}"#;
        let page: PaginatedList<WaypointDetailed> = serde_json::from_str(json).unwrap();
        assert_eq!(page.data.len(), 1);
        assert!(page.data[0].has_trait("MARKETPLACE"));
        assert_eq!(page.data[0].orbitals[0].symbol, "X1-HN18-ZX1C");
    }

    #[test]
    fn test_deserialise_navigate_response() {
        let json = r#"{"data":{
            "nav": {
                "systemSymbol": "X1-TZ26",
                "waypointSymbol": "X1-TZ26-A1",
                "route": {
                    "origin": {"symbol":"X1-TZ26-A1","type":"PLANET","systemSymbol":"X1-TZ26","x":23,"y":7},
                    "destination": {"symbol":"X1-TZ26-B2","type":"PLANET","systemSymbol":"X1-TZ26","x":50,"y":7},
                    "arrival": "2024-02-04T11:40:29.703Z",
                    "departureTime": "2024-02-04T11:37:29.703Z"
                },
                "status": "IN_TRANSIT",
                "flightMode": "CRUISE"
            },
            "fuel": {"current": 370, "capacity": 400}
        }}"#;
        let response: Data<NavigateResponse> = serde_json::from_str(json).unwrap();
        assert_eq!(response.data.fuel.current, 370);
    }
}

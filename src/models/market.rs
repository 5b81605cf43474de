use crate::models::WaypointSymbol;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Market {
    pub symbol: WaypointSymbol,
    #[serde(default)]
    pub trade_goods: Vec<MarketTradeGood>,
}

/// Remote price polarity: `purchase_price` is what the ship pays to buy,
/// `sell_price` is what the ship receives. The persisted columns swap these
/// names (see the market store); this struct always carries the remote view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketTradeGood {
    pub symbol: String,
    pub trade_volume: i64,
    #[serde(rename = "type")]
    pub trade_type: String,
    pub supply: String,
    pub activity: Option<String>,
    pub purchase_price: i64,
    pub sell_price: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shipyard {
    pub symbol: WaypointSymbol,
    pub ship_types: Vec<ShipTypeEntry>,
    #[serde(default)]
    pub ships: Vec<ShipyardShip>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipTypeEntry {
    #[serde(rename = "type")]
    pub ship_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipyardShip {
    #[serde(rename = "type")]
    pub ship_type: String,
    pub name: String,
    pub purchase_price: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketTransaction {
    pub waypoint_symbol: WaypointSymbol,
    pub ship_symbol: String,
    pub trade_symbol: String,
    #[serde(rename = "type")]
    pub transaction_type: String,
    pub units: i64,
    pub price_per_unit: i64,
    pub total_price: i64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_deserialise_market() {
        let json = r#"{
            "symbol": "X1-TZ26-A1",
            "tradeGoods": [
                {"symbol":"IRON_ORE","tradeVolume":100,"type":"EXCHANGE","supply":"MODERATE","activity":"WEAK","purchasePrice":25,"sellPrice":22}
            ]
        }"#;
        let market: Market = serde_json::from_str(json).unwrap();
        assert_eq!(market.trade_goods.len(), 1);
        let good = &market.trade_goods[0];
        assert_eq!(good.purchase_price, 25);
        assert_eq!(good.sell_price, 22);
    }

    #[test]
    fn test_deserialise_shipyard() {
        let json = r#"{
            "symbol": "X1-TZ26-B2",
            "shipTypes": [{"type": "SHIP_PROBE"}],
            "ships": [{"type": "SHIP_PROBE", "name": "Probe", "purchasePrice": 24500}]
        }"#;
        let shipyard: Shipyard = serde_json::from_str(json).unwrap();
        assert_eq!(shipyard.ship_types[0].ship_type, "SHIP_PROBE");
        assert_eq!(shipyard.ships[0].purchase_price, 24500);
    }
}

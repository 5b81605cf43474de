use crate::models::WaypointSymbol;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub id: String,
    pub faction_symbol: String,
    #[serde(rename = "type")]
    pub contract_type: String,
    pub terms: ContractTerms,
    pub accepted: bool,
    pub fulfilled: bool,
    pub deadline_to_accept: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractTerms {
    pub deadline: DateTime<Utc>,
    pub payment: ContractPayment,
    #[serde(default)]
    pub deliver: Vec<ContractDelivery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractPayment {
    pub on_accepted: i64,
    pub on_fulfilled: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractDelivery {
    pub trade_symbol: String,
    pub destination_symbol: WaypointSymbol,
    pub units_required: i64,
    pub units_fulfilled: i64,
}

impl Contract {
    pub fn is_active(&self) -> bool {
        self.accepted && !self.fulfilled
    }

    pub fn remaining_deliveries(&self) -> Vec<&ContractDelivery> {
        self.terms
            .deliver
            .iter()
            .filter(|d| d.units_fulfilled < d.units_required)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_deserialise_contract() {
        let json = r#"{
            "id": "cls7fi0q2rns0s60cgvarxu6v",
            "factionSymbol": "CORSAIRS",
            "type": "PROCUREMENT",
            "terms": {
                "deadline": "2024-02-11T11:37:29.626Z",
                "payment": {"onAccepted": 1391, "onFulfilled": 10466},
                "deliver": [
                    {"tradeSymbol":"ALUMINUM_ORE","destinationSymbol":"X1-TZ26-H51","unitsRequired":46,"unitsFulfilled":0}
                ]
            },
            "accepted": false,
            "fulfilled": false,
            "deadlineToAccept": "2024-02-05T11:37:29.626Z"
        }"#;
        let contract: Contract = serde_json::from_str(json).unwrap();
        assert_eq!(contract.id, "cls7fi0q2rns0s60cgvarxu6v");
        assert!(!contract.is_active());
        assert_eq!(contract.remaining_deliveries().len(), 1);
    }
}

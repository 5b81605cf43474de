mod container;
mod contract;
mod market;
mod ship;
mod symbols;
mod waypoint;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use container::*;
pub use contract::*;
pub use market::*;
pub use ship::*;
pub use symbols::*;
pub use waypoint::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub symbol: String,
    pub headquarters: WaypointSymbol,
    pub credits: i64,
    pub starting_faction: String,
    pub ship_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Data<T> {
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedList<T> {
    pub data: Vec<T>,
    pub meta: Meta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub page: u32,
    pub limit: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithTimestamp<T> {
    pub timestamp: DateTime<Utc>,
    pub data: T,
}

/// Identity for the remote API. `credits` is a cached display-only mirror;
/// the authoritative value always comes from the remote agent.
#[derive(Debug, Clone)]
pub struct Player {
    pub id: i64,
    pub agent_symbol: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub last_active: Option<DateTime<Utc>>,
    pub credits: i64,
}

use diesel::prelude::*;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::players)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct PlayerRow {
    pub id: i64,
    pub agent_symbol: String,
    pub token: String,
    pub created_at: String,
    pub last_active: Option<String>,
    pub credits: i64,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::players)]
pub struct NewPlayer<'a> {
    pub agent_symbol: &'a str,
    pub token: &'a str,
    pub created_at: &'a str,
    pub credits: i64,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::ships)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct ShipRow {
    pub symbol: String,
    pub player_id: i64,
    pub waypoint_symbol: String,
    pub nav_status: String,
    pub fuel_current: i64,
    pub fuel_capacity: i64,
    pub cargo_capacity: i64,
    pub cargo_units: i64,
    pub cargo: String,
    pub engine_speed: i64,
    pub updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::containers)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct ContainerRow {
    pub container_id: String,
    pub player_id: i64,
    pub container_type: String,
    pub command_type: String,
    pub status: String,
    pub restart_policy: String,
    pub restart_count: i32,
    pub max_restarts: i32,
    pub config: String,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
    pub exit_code: Option<i32>,
    pub exit_reason: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::container_logs)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct ContainerLogRow {
    pub log_id: i64,
    pub container_id: String,
    pub player_id: i64,
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::ship_assignments)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct ShipAssignmentRow {
    pub ship_symbol: String,
    pub player_id: i64,
    pub container_id: String,
    pub operation: String,
    pub status: String,
    pub assigned_at: String,
    pub released_at: Option<String>,
    pub release_reason: Option<String>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::waypoints)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct WaypointRow {
    pub symbol: String,
    pub system_symbol: String,
    pub waypoint_type: String,
    pub x: f64,
    pub y: f64,
    pub traits: String,
    pub has_fuel: bool,
    pub orbitals: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::market_data)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct MarketDataRow {
    pub waypoint_symbol: String,
    pub good_symbol: String,
    pub supply: String,
    pub activity: Option<String>,
    pub purchase_price: i64,
    pub sell_price: i64,
    pub trade_volume: i64,
    pub updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::contracts)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct ContractRow {
    pub contract_id: String,
    pub player_id: i64,
    pub contract: String,
    pub accepted: bool,
    pub fulfilled: bool,
    pub updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = crate::schema::experiment_work_queue)]
#[diesel(check_for_backend(diesel::pg::Pg, diesel::sqlite::Sqlite))]
pub struct WorkQueueRow {
    pub queue_id: i64,
    pub run_id: String,
    pub player_id: i64,
    pub pair_id: String,
    pub good_symbol: String,
    pub buy_market: String,
    pub sell_market: String,
    pub status: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<String>,
    pub completed_at: Option<String>,
    pub attempts: i32,
    pub error_message: Option<String>,
    pub created_at: String,
}

pub mod api_models;

use crate::config::CONFIG;
use crate::models::*;
use crate::{Error, Result};
use api_models::*;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use log::*;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::{Value, json};
use std::num::NonZeroU32;
use std::sync::{Arc, RwLock};
use std::time::Duration;

const RATE_LIMIT_PER_SECOND: u32 = 2;
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
    agent_token: Arc<RwLock<Option<String>>>,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl Default for ApiClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiClient {
    pub fn new() -> ApiClient {
        let user_agent = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        let client = reqwest::ClientBuilder::new()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .https_only(true)
            .http1_only()
            .build()
            .expect("Failed to construct http client");
        let quota = Quota::per_second(NonZeroU32::new(RATE_LIMIT_PER_SECOND).unwrap());
        ApiClient {
            client,
            base_url: CONFIG.api_base_url.clone(),
            agent_token: Arc::new(RwLock::new(None)),
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    pub fn with_token(token: &str) -> ApiClient {
        let client = ApiClient::new();
        client.set_agent_token(token);
        client
    }

    pub fn set_agent_token(&self, token: &str) {
        let mut agent_token = self.agent_token.write().unwrap();
        *agent_token = Some(token.to_string());
    }

    pub fn agent_token(&self) -> Option<String> {
        self.agent_token.read().unwrap().clone()
    }

    pub async fn register(&self, faction: &str, callsign: &str) -> Result<(String, Agent)> {
        let mut body: Value = self
            .post(
                "/register",
                &json!({
                    "faction": faction,
                    "symbol": callsign,
                }),
            )
            .await?;
        let token: String = serde_json::from_value(body["data"]["token"].take())?;
        let agent: Agent = serde_json::from_value(body["data"]["agent"].take())?;
        Ok((token, agent))
    }

    pub async fn get_agent(&self) -> Result<Agent> {
        let response: Data<Agent> = self.get("/my/agent").await?;
        Ok(response.data)
    }

    pub async fn get_ship(&self, ship_symbol: &str) -> Result<Ship> {
        let response: Data<Ship> = self.get(&format!("/my/ships/{}", ship_symbol)).await?;
        Ok(response.data)
    }

    pub async fn get_all_ships(&self) -> Result<Vec<Ship>> {
        self.get_all_pages("/my/ships").await
    }

    /// One page of system waypoints. Waypoint sync deliberately paginates
    /// until an empty page rather than trusting `meta.total`.
    pub async fn list_waypoints(
        &self,
        system_symbol: &SystemSymbol,
        page: u32,
        limit: u32,
    ) -> Result<PaginatedList<WaypointDetailed>> {
        self.get(&format!(
            "/systems/{}/waypoints?page={}&limit={}",
            system_symbol, page, limit
        ))
        .await
    }

    pub async fn get_market(&self, symbol: &WaypointSymbol) -> Result<Market> {
        let response: Data<Market> = self
            .get(&format!(
                "/systems/{}/waypoints/{}/market",
                symbol.system(),
                symbol
            ))
            .await?;
        Ok(response.data)
    }

    pub async fn get_shipyard(&self, symbol: &WaypointSymbol) -> Result<Shipyard> {
        let response: Data<Shipyard> = self
            .get(&format!(
                "/systems/{}/waypoints/{}/shipyard",
                symbol.system(),
                symbol
            ))
            .await?;
        Ok(response.data)
    }

    pub async fn orbit_ship(&self, ship_symbol: &str) -> Result<NavResponse> {
        let response: Data<NavResponse> = self
            .post(&format!("/my/ships/{}/orbit", ship_symbol), &json!({}))
            .await?;
        Ok(response.data)
    }

    pub async fn dock_ship(&self, ship_symbol: &str) -> Result<NavResponse> {
        let response: Data<NavResponse> = self
            .post(&format!("/my/ships/{}/dock", ship_symbol), &json!({}))
            .await?;
        Ok(response.data)
    }

    pub async fn navigate_ship(
        &self,
        ship_symbol: &str,
        waypoint_symbol: &WaypointSymbol,
    ) -> Result<NavigateResponse> {
        let response: Data<NavigateResponse> = self
            .post(
                &format!("/my/ships/{}/navigate", ship_symbol),
                &json!({ "waypointSymbol": waypoint_symbol }),
            )
            .await?;
        Ok(response.data)
    }

    pub async fn set_flight_mode(
        &self,
        ship_symbol: &str,
        mode: ShipFlightMode,
    ) -> Result<NavResponse> {
        let response: Data<NavResponse> = self
            .patch(
                &format!("/my/ships/{}/nav", ship_symbol),
                &json!({ "flightMode": mode }),
            )
            .await?;
        Ok(response.data)
    }

    pub async fn refuel_ship(&self, ship_symbol: &str, units: Option<i64>) -> Result<RefuelResponse> {
        let body = match units {
            Some(units) => json!({ "units": units }),
            None => json!({}),
        };
        let response: Data<RefuelResponse> = self
            .post(&format!("/my/ships/{}/refuel", ship_symbol), &body)
            .await?;
        Ok(response.data)
    }

    pub async fn purchase_ship(
        &self,
        ship_type: &str,
        waypoint_symbol: &WaypointSymbol,
    ) -> Result<PurchaseShipResponse> {
        let response: Data<PurchaseShipResponse> = self
            .post(
                "/my/ships",
                &json!({ "shipType": ship_type, "waypointSymbol": waypoint_symbol }),
            )
            .await?;
        Ok(response.data)
    }

    pub async fn purchase_cargo(
        &self,
        ship_symbol: &str,
        good_symbol: &str,
        units: i64,
    ) -> Result<TradeResponse> {
        let response: Data<TradeResponse> = self
            .post(
                &format!("/my/ships/{}/purchase", ship_symbol),
                &json!({ "symbol": good_symbol, "units": units }),
            )
            .await?;
        Ok(response.data)
    }

    pub async fn sell_cargo(
        &self,
        ship_symbol: &str,
        good_symbol: &str,
        units: i64,
    ) -> Result<TradeResponse> {
        let response: Data<TradeResponse> = self
            .post(
                &format!("/my/ships/{}/sell", ship_symbol),
                &json!({ "symbol": good_symbol, "units": units }),
            )
            .await?;
        Ok(response.data)
    }

    pub async fn jettison_cargo(
        &self,
        ship_symbol: &str,
        good_symbol: &str,
        units: i64,
    ) -> Result<JettisonResponse> {
        let response: Data<JettisonResponse> = self
            .post(
                &format!("/my/ships/{}/jettison", ship_symbol),
                &json!({ "symbol": good_symbol, "units": units }),
            )
            .await?;
        Ok(response.data)
    }

    pub async fn get_contracts(&self) -> Result<Vec<Contract>> {
        self.get_all_pages("/my/contracts").await
    }

    pub async fn get_contract(&self, contract_id: &str) -> Result<Contract> {
        let response: Data<Contract> = self.get(&format!("/my/contracts/{}", contract_id)).await?;
        Ok(response.data)
    }

    pub async fn negotiate_contract(&self, ship_symbol: &str) -> Result<Contract> {
        let response: Data<ContractResponse> = self
            .post(
                &format!("/my/ships/{}/negotiate/contract", ship_symbol),
                &json!({}),
            )
            .await?;
        Ok(response.data.contract)
    }

    pub async fn accept_contract(&self, contract_id: &str) -> Result<AcceptContractResponse> {
        let response: Data<AcceptContractResponse> = self
            .post(&format!("/my/contracts/{}/accept", contract_id), &json!({}))
            .await?;
        Ok(response.data)
    }

    pub async fn deliver_contract(
        &self,
        contract_id: &str,
        ship_symbol: &str,
        trade_symbol: &str,
        units: i64,
    ) -> Result<DeliverContractResponse> {
        let response: Data<DeliverContractResponse> = self
            .post(
                &format!("/my/contracts/{}/deliver", contract_id),
                &json!({
                    "shipSymbol": ship_symbol,
                    "tradeSymbol": trade_symbol,
                    "units": units,
                }),
            )
            .await?;
        Ok(response.data)
    }

    pub async fn fulfill_contract(&self, contract_id: &str) -> Result<AcceptContractResponse> {
        let response: Data<AcceptContractResponse> = self
            .post(&format!("/my/contracts/{}/fulfill", contract_id), &json!({}))
            .await?;
        Ok(response.data)
    }

    pub async fn get_all_pages<T>(&self, path: &str) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let page_size = 20;
        let mut page = 1;
        let mut vec = Vec::new();
        loop {
            let response: PaginatedList<T> = self
                .get(&format!("{}?page={}&limit={}", path, page, page_size))
                .await?;
            vec.extend(response.data);
            if response.meta.page * page_size >= response.meta.total {
                break;
            }
            page += 1;
        }
        Ok(vec)
    }
}

/// Request core
impl ApiClient {
    pub async fn get<T>(&self, path: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.request(Method::GET, path, None::<&()>).await
    }

    pub async fn post<T, U>(&self, path: &str, json_body: &U) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
        U: Serialize,
    {
        self.request(Method::POST, path, Some(json_body)).await
    }

    pub async fn patch<T, U>(&self, path: &str, json_body: &U) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
        U: Serialize,
    {
        self.request(Method::PATCH, path, Some(json_body)).await
    }

    /// Every call takes a token from the shared bucket (2/s). 429s retry up
    /// to three times with exponential backoff; a transport error retries
    /// once after one second; other failures parse the remote error body and
    /// surface its code unchanged.
    async fn request<T, U>(&self, method: Method, path: &str, json_body: Option<&U>) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
        U: Serialize,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut rate_limit_attempt = 0;
        let mut transport_retried = false;
        loop {
            self.limiter.until_ready().await;

            let mut request = self.client.request(method.clone(), &url);
            if let Some(body) = json_body {
                request = request.json(body);
            }
            if let Some(token) = self.agent_token() {
                request = request.header("Authorization", format!("Bearer {}", token));
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    if transport_retried {
                        return Err(Error::Transient(e.to_string()));
                    }
                    transport_retried = true;
                    warn!("Request failed, retrying: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let status = response.status();
            debug!("{} {} {}", status.as_u16(), method, path);

            if status == StatusCode::TOO_MANY_REQUESTS {
                if rate_limit_attempt >= MAX_RATE_LIMIT_RETRIES {
                    return Err(Error::RateLimited(format!("{} {}", method, path)));
                }
                let wait = Duration::from_secs(1 << rate_limit_attempt);
                warn!("Rate limited, waiting {:?}", wait);
                tokio::time::sleep(wait).await;
                rate_limit_attempt += 1;
                continue;
            }

            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => return Err(Error::Transient(e.to_string())),
            };

            if status.is_success() {
                return serde_json::from_str::<T>(&body).map_err(Error::from);
            }
            return Err(parse_error_body(status, &body));
        }
    }
}

/// The ship-operation surface the state orchestrator drives. Split from the
/// concrete client so ship behavior can be exercised against a scripted
/// remote.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ShipOpsApi: Send + Sync {
    async fn get_ship(&self, ship_symbol: &str) -> Result<Ship>;
    async fn orbit_ship(&self, ship_symbol: &str) -> Result<NavResponse>;
    async fn dock_ship(&self, ship_symbol: &str) -> Result<NavResponse>;
    async fn navigate_ship(
        &self,
        ship_symbol: &str,
        waypoint_symbol: &WaypointSymbol,
    ) -> Result<NavigateResponse>;
    async fn set_flight_mode(&self, ship_symbol: &str, mode: ShipFlightMode)
    -> Result<NavResponse>;
    async fn refuel_ship(&self, ship_symbol: &str, units: Option<i64>) -> Result<RefuelResponse>;
    async fn purchase_cargo(
        &self,
        ship_symbol: &str,
        good_symbol: &str,
        units: i64,
    ) -> Result<TradeResponse>;
    async fn sell_cargo(
        &self,
        ship_symbol: &str,
        good_symbol: &str,
        units: i64,
    ) -> Result<TradeResponse>;
    async fn jettison_cargo(
        &self,
        ship_symbol: &str,
        good_symbol: &str,
        units: i64,
    ) -> Result<JettisonResponse>;
}

#[async_trait::async_trait]
impl ShipOpsApi for ApiClient {
    async fn get_ship(&self, ship_symbol: &str) -> Result<Ship> {
        ApiClient::get_ship(self, ship_symbol).await
    }
    async fn orbit_ship(&self, ship_symbol: &str) -> Result<NavResponse> {
        ApiClient::orbit_ship(self, ship_symbol).await
    }
    async fn dock_ship(&self, ship_symbol: &str) -> Result<NavResponse> {
        ApiClient::dock_ship(self, ship_symbol).await
    }
    async fn navigate_ship(
        &self,
        ship_symbol: &str,
        waypoint_symbol: &WaypointSymbol,
    ) -> Result<NavigateResponse> {
        ApiClient::navigate_ship(self, ship_symbol, waypoint_symbol).await
    }
    async fn set_flight_mode(
        &self,
        ship_symbol: &str,
        mode: ShipFlightMode,
    ) -> Result<NavResponse> {
        ApiClient::set_flight_mode(self, ship_symbol, mode).await
    }
    async fn refuel_ship(&self, ship_symbol: &str, units: Option<i64>) -> Result<RefuelResponse> {
        ApiClient::refuel_ship(self, ship_symbol, units).await
    }
    async fn purchase_cargo(
        &self,
        ship_symbol: &str,
        good_symbol: &str,
        units: i64,
    ) -> Result<TradeResponse> {
        ApiClient::purchase_cargo(self, ship_symbol, good_symbol, units).await
    }
    async fn sell_cargo(
        &self,
        ship_symbol: &str,
        good_symbol: &str,
        units: i64,
    ) -> Result<TradeResponse> {
        ApiClient::sell_cargo(self, ship_symbol, good_symbol, units).await
    }
    async fn jettison_cargo(
        &self,
        ship_symbol: &str,
        good_symbol: &str,
        units: i64,
    ) -> Result<JettisonResponse> {
        ApiClient::jettison_cargo(self, ship_symbol, good_symbol, units).await
    }
}

/// Non-2xx bodies carry `{"error": {"code": ..., "message": ...}}` where the
/// remote produced a structured error; fall back to the raw body otherwise.
fn parse_error_body(status: StatusCode, body: &str) -> Error {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(error) = value.get("error") {
            let code = error
                .get("code")
                .and_then(Value::as_i64)
                .unwrap_or(status.as_u16() as i64);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown remote error")
                .to_string();
            return Error::Remote { code, message };
        }
    }
    Error::Remote {
        code: status.as_u16() as i64,
        message: body.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ERROR_ACTIVE_CONTRACT;

    #[test]
    fn test_parse_structured_error_body() {
        let body = r#"{"error":{"message":"an agent can only have 1 active contract at a time","code":4511}}"#;
        let err = parse_error_body(StatusCode::BAD_REQUEST, body);
        assert_eq!(err.remote_code(), Some(ERROR_ACTIVE_CONTRACT));
    }

    #[test]
    fn test_parse_unstructured_error_body() {
        let err = parse_error_body(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert_eq!(err.remote_code(), Some(500));
    }
}

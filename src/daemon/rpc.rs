use crate::models::{LogLevel, RestartPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Option<Value>, code: i64, message: String) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: "2.0",
            result: None,
            error: Some(JsonRpcError { code, message }),
            id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateParams {
    pub container_id: String,
    pub player_id: i64,
    pub container_type: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub restart_policy: Option<RestartPolicy>,
    #[serde(default)]
    pub max_restarts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopParams {
    pub container_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InspectParams {
    pub container_id: String,
    #[serde(default)]
    pub log_limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ListParams {
    #[serde(default)]
    pub player_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveParams {
    pub container_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogsParams {
    pub container_id: String,
    pub player_id: i64,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_create_request() {
        let raw = r#"{
            "jsonrpc": "2.0",
            "method": "container.create",
            "params": {
                "container_id": "nav-1",
                "player_id": 1,
                "container_type": "command",
                "config": {"command_type": "NavigateShip", "params": {"ship_symbol": "S-1", "destination": "X1-S1-B1"}},
                "restart_policy": "on-failure"
            },
            "id": 7
        }"#;
        let request: JsonRpcRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.method, "container.create");
        let params: CreateParams = serde_json::from_value(request.params).unwrap();
        assert_eq!(params.container_id, "nav-1");
        assert_eq!(params.restart_policy, Some(RestartPolicy::OnFailure));
        assert_eq!(params.max_restarts, None);
    }

    #[test]
    fn test_response_shape() {
        let ok = JsonRpcResponse::success(
            Some(Value::from(1)),
            serde_json::json!({"container_id": "c1"}),
        );
        let raw = serde_json::to_string(&ok).unwrap();
        assert!(raw.contains("\"result\""));
        assert!(!raw.contains("\"error\""));

        let err = JsonRpcResponse::failure(None, INTERNAL_ERROR, "boom".to_string());
        let raw = serde_json::to_string(&err).unwrap();
        assert!(raw.contains("-32603"));
        assert!(!raw.contains("\"result\""));
    }
}

pub mod rpc;
pub mod supervisor;

use crate::api_client::ApiClient;
use crate::config::CONFIG;
use crate::database::DbClient;
use crate::models::ContainerStatus;
use crate::routing::RoutingEngine;
use crate::universe::Universe;
use crate::workloads::WorkloadConfig;
use crate::{Error, Result};
use dashmap::DashMap;
use log::*;
use rpc::*;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt as _;
use std::path::PathBuf;
use std::sync::Arc;
use supervisor::{ContainerSupervisor, CreateContainerRequest, DEFAULT_MAX_RESTARTS};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

const HEALTH_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_LOG_LIMIT: i64 = 100;
const DEFAULT_INSPECT_LOG_LIMIT: i64 = 50;

/// One remote client (and universe view) per player, so all of a player's
/// containers share a single token bucket.
#[derive(Clone)]
pub struct ApiClientPool {
    db: DbClient,
    clients: Arc<DashMap<i64, (ApiClient, Universe)>>,
}

impl ApiClientPool {
    pub fn new(db: &DbClient) -> ApiClientPool {
        ApiClientPool {
            db: db.clone(),
            clients: Arc::new(DashMap::new()),
        }
    }

    pub async fn for_player(&self, player_id: i64) -> Result<(ApiClient, Universe)> {
        if let Some(entry) = self.clients.get(&player_id) {
            return Ok(entry.value().clone());
        }
        let player = self
            .db
            .find_player(player_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("player {}", player_id)))?;
        let api_client = ApiClient::with_token(&player.token);
        let universe = Universe::new(&api_client, &self.db);
        self.clients
            .insert(player_id, (api_client.clone(), universe.clone()));
        self.db.touch_player(player_id).await?;
        Ok((api_client, universe))
    }
}

/// The control server: JSON-RPC 2.0 over a filesystem socket, one request
/// per connection, response framed by closing the write side.
pub struct DaemonServer {
    db: DbClient,
    supervisor: ContainerSupervisor,
    api_clients: ApiClientPool,
    socket_path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
}

impl DaemonServer {
    pub fn new(db: &DbClient) -> DaemonServer {
        let routing = Arc::new(RoutingEngine::new());
        let api_clients = ApiClientPool::new(db);
        let supervisor = ContainerSupervisor::new(db, &routing, &api_clients);
        let (shutdown_tx, _) = watch::channel(false);
        DaemonServer {
            db: db.clone(),
            supervisor,
            api_clients,
            socket_path: PathBuf::from(&CONFIG.socket_path),
            shutdown_tx,
        }
    }

    pub fn supervisor(&self) -> &ContainerSupervisor {
        &self.supervisor
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o660))?;

        // zombie assignments from a crashed daemon instance are cleared
        // before any container can be admitted
        let released = self
            .db
            .release_all_active_assignments("daemon_restart")
            .await?;
        if released > 0 {
            info!("Released {} zombie assignment(s) on daemon startup", released);
        }

        info!("Daemon server started on {}", self.socket_path.display());

        let health = {
            let server = self.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                    HEALTH_INTERVAL_SECONDS,
                ));
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = interval.tick() => {
                            let count = server.supervisor.container_count().await;
                            if count > 0 {
                                debug!("Health check: {} container(s) tracked", count);
                            }
                            server.cleanup_stale_assignments().await;
                        }
                    }
                }
            })
        };

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received");
                    break;
                }
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    error!("Error handling connection: {}", e);
                                }
                            });
                        }
                        Err(e) => error!("Accept failed: {}", e),
                    }
                }
            }
        }

        info!("Shutting down daemon server...");
        let _ = self.shutdown_tx.send(true);
        self.supervisor.stop_all().await;
        let _ = health.await;
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        info!("Daemon server stopped");
        Ok(())
    }

    async fn handle_connection(&self, mut stream: UnixStream) -> Result<()> {
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await?;

        let response = match serde_json::from_slice::<JsonRpcRequest>(&raw) {
            Ok(request) => {
                let id = request.id.clone();
                match self.dispatch(request).await {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(e) => JsonRpcResponse::failure(id, error_code(&e), e.to_string()),
                }
            }
            Err(e) => JsonRpcResponse::failure(None, PARSE_ERROR, e.to_string()),
        };

        let body = serde_json::to_vec(&response)?;
        stream.write_all(&body).await?;
        // closing the write side frames the response
        stream.shutdown().await?;
        Ok(())
    }

    async fn dispatch(&self, request: JsonRpcRequest) -> Result<Value> {
        debug!("rpc: {}", request.method);
        match request.method.as_str() {
            "container.create" => {
                let params: CreateParams = parse_params(request.params)?;
                self.create_container(params).await
            }
            "container.stop" => {
                let params: StopParams = parse_params(request.params)?;
                self.stop_container(params).await
            }
            "container.inspect" => {
                let params: InspectParams = parse_params(request.params)?;
                self.inspect_container(params).await
            }
            "container.list" => {
                let params: ListParams = if request.params.is_null() {
                    ListParams::default()
                } else {
                    parse_params(request.params)?
                };
                self.list_containers(params).await
            }
            "container.remove" => {
                let params: RemoveParams = parse_params(request.params)?;
                self.supervisor.remove(&params.container_id).await?;
                Ok(json!({ "container_id": params.container_id }))
            }
            "container.logs" => {
                let params: LogsParams = parse_params(request.params)?;
                self.container_logs(params).await
            }
            method => Err(Error::InvalidState(format!("unknown method: {}", method))),
        }
    }

    /// Admission: when the workload names a ship, the ship must exist for the
    /// player and its assignment must be claimed before the container is
    /// created. A failed creation rolls the claim back.
    async fn create_container(&self, params: CreateParams) -> Result<Value> {
        let workload: WorkloadConfig = serde_json::from_value(params.config.clone())
            .map_err(|e| Error::InvalidState(format!("invalid container config: {}", e)))?;

        let claimed_ship = match workload.ship_symbol() {
            Some(ship_symbol) => {
                self.ensure_ship_exists(params.player_id, ship_symbol).await?;
                let assigned = self
                    .db
                    .assign_ship(
                        params.player_id,
                        ship_symbol,
                        &params.container_id,
                        workload.command_type(),
                    )
                    .await?;
                if !assigned {
                    return Err(Error::Conflict(format!(
                        "ship {} already assigned",
                        ship_symbol
                    )));
                }
                Some(ship_symbol.to_string())
            }
            None => None,
        };

        let request = CreateContainerRequest {
            container_id: params.container_id.clone(),
            player_id: params.player_id,
            container_type: params.container_type,
            config: params.config,
            restart_policy: params.restart_policy.unwrap_or_default(),
            max_restarts: params.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS),
        };
        match self.supervisor.create(request).await {
            Ok(descriptor) => Ok(json!({
                "container_id": descriptor.container_id,
                "status": descriptor.status,
            })),
            Err(e) => {
                if let Some(ship_symbol) = claimed_ship {
                    self.db
                        .release_ship(params.player_id, &ship_symbol, "create_failed")
                        .await?;
                }
                Err(e)
            }
        }
    }

    async fn ensure_ship_exists(&self, player_id: i64, ship_symbol: &str) -> Result<()> {
        if self
            .db
            .get_cached_ship(player_id, ship_symbol)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let (api_client, _) = self.api_clients.for_player(player_id).await?;
        match api_client.get_ship(ship_symbol).await {
            Ok(ship) => {
                self.db.save_ship(player_id, &ship).await?;
                Ok(())
            }
            Err(_) => Err(Error::NotFound(format!("ship {}", ship_symbol))),
        }
    }

    async fn stop_container(&self, params: StopParams) -> Result<Value> {
        let descriptor = self.supervisor.stop(&params.container_id).await?;
        if let Ok(workload) =
            serde_json::from_value::<WorkloadConfig>(descriptor.config.clone())
        {
            if let Some(ship_symbol) = workload.ship_symbol() {
                self.db
                    .release_ship(descriptor.player_id, ship_symbol, "stopped")
                    .await?;
            }
        }
        Ok(json!({
            "container_id": params.container_id,
            "status": "stopped",
        }))
    }

    async fn inspect_container(&self, params: InspectParams) -> Result<Value> {
        let log_limit = params.log_limit.unwrap_or(DEFAULT_INSPECT_LOG_LIMIT);
        let (descriptor_json, player_id) = match self.supervisor.get(&params.container_id).await {
            Some(descriptor) => (serde_json::to_value(&descriptor)?, descriptor.player_id),
            None => {
                // not in memory: fall back to the persisted descriptor
                let row = self
                    .db
                    .get_container_row(&params.container_id)
                    .await?
                    .ok_or_else(|| {
                        Error::NotFound(format!("container {}", params.container_id))
                    })?;
                let player_id = row.player_id;
                (
                    json!({
                        "container_id": row.container_id,
                        "player_id": row.player_id,
                        "container_type": row.container_type,
                        "command_type": row.command_type,
                        "status": row.status,
                        "restart_policy": row.restart_policy,
                        "restart_count": row.restart_count,
                        "max_restarts": row.max_restarts,
                        "config": serde_json::from_str::<Value>(&row.config).unwrap_or(Value::Null),
                        "started_at": row.started_at,
                        "stopped_at": row.stopped_at,
                        "exit_code": row.exit_code,
                        "exit_reason": row.exit_reason,
                    }),
                    player_id,
                )
            }
        };
        let logs = self
            .db
            .get_container_logs(&params.container_id, player_id, log_limit, None, None)
            .await?;
        let mut result = descriptor_json;
        result["logs"] = serde_json::to_value(&logs)?;
        Ok(result)
    }

    async fn list_containers(&self, params: ListParams) -> Result<Value> {
        let containers = self.supervisor.list(params.player_id).await;
        Ok(json!({
            "containers": containers
                .iter()
                .map(|descriptor| {
                    json!({
                        "container_id": descriptor.container_id,
                        "player_id": descriptor.player_id,
                        "type": descriptor.container_type,
                        "status": descriptor.status,
                    })
                })
                .collect::<Vec<_>>(),
        }))
    }

    async fn container_logs(&self, params: LogsParams) -> Result<Value> {
        let logs = self
            .db
            .get_container_logs(
                &params.container_id,
                params.player_id,
                params.limit.unwrap_or(DEFAULT_LOG_LIMIT),
                params.level,
                params.since,
            )
            .await?;
        Ok(json!({
            "container_id": params.container_id,
            "player_id": params.player_id,
            "logs": logs,
        }))
    }

    /// Release assignments whose container the supervisor no longer tracks:
    /// crashed containers, force-kills, or a daemon that died mid-operation.
    pub async fn cleanup_stale_assignments(&self) {
        let active = match self.db.get_all_active_assignments().await {
            Ok(active) => active,
            Err(e) => {
                error!("Error reading active assignments: {}", e);
                return;
            }
        };
        if active.is_empty() {
            return;
        }
        let tracked: HashSet<String> = self.supervisor.container_ids().await.into_iter().collect();
        let mut stale = 0;
        for assignment in active {
            if !tracked.contains(&assignment.container_id) {
                warn!(
                    "Cleaning up stale assignment: {} was assigned to {} (not running)",
                    assignment.ship_symbol, assignment.container_id
                );
                if let Err(e) = self
                    .db
                    .release_ship(assignment.player_id, &assignment.ship_symbol, "stale_cleanup")
                    .await
                {
                    error!("Error releasing {}: {}", assignment.ship_symbol, e);
                    continue;
                }
                stale += 1;
            }
        }
        if stale > 0 {
            info!("Cleaned up {} stale ship assignment(s)", stale);
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| Error::InvalidState(format!("invalid params: {}", e)))
}

fn error_code(error: &Error) -> i64 {
    match error {
        Error::InvalidState(message) if message.starts_with("unknown method") => METHOD_NOT_FOUND,
        Error::InvalidState(message) if message.starts_with("invalid params") => INVALID_PARAMS,
        _ => INTERNAL_ERROR,
    }
}

/// True when a status string read back from the store is terminal.
pub fn is_terminal_status(status: &str) -> bool {
    status
        .parse::<ContainerStatus>()
        .map(|status| status.is_terminal())
        .unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            error_code(&Error::InvalidState("unknown method: x".to_string())),
            METHOD_NOT_FOUND
        );
        assert_eq!(
            error_code(&Error::InvalidState("invalid params: y".to_string())),
            INVALID_PARAMS
        );
        assert_eq!(
            error_code(&Error::Conflict("ship taken".to_string())),
            INTERNAL_ERROR
        );
    }

    #[test]
    fn test_terminal_status_parse() {
        assert!(is_terminal_status("STOPPED"));
        assert!(is_terminal_status("FAILED"));
        assert!(!is_terminal_status("RUNNING"));
        assert!(!is_terminal_status("garbage"));
    }
}

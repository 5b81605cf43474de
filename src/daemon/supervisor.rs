use crate::daemon::ApiClientPool;
use crate::database::DbClient;
use crate::models::{
    ContainerDescriptor, ContainerStatus, LogLevel, RestartPolicy,
};
use crate::routing::RoutingEngine;
use crate::workloads::{WorkloadConfig, WorkloadContext};
use crate::{Error, Result};
use chrono::Utc;
use log::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

pub const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Cooperative cancellation signal, observed by container workloads at their
/// suspension points.
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> (watch::Sender<bool>, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, CancelSignal { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub fn should_restart(
    policy: RestartPolicy,
    exit_code: i32,
    restart_count: u32,
    max_restarts: u32,
    user_stopped: bool,
) -> bool {
    if user_stopped || restart_count >= max_restarts {
        return false;
    }
    match policy {
        RestartPolicy::No => false,
        RestartPolicy::OnFailure => exit_code != 0,
        RestartPolicy::Always | RestartPolicy::UnlessStopped => true,
    }
}

pub fn restart_backoff(restart_count: u32) -> Duration {
    let seconds = 2u64.saturating_pow(restart_count).min(60);
    Duration::from_secs(seconds)
}

struct ContainerEntry {
    descriptor: ContainerDescriptor,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    user_stopped: bool,
}

#[derive(Debug, Clone)]
pub struct CreateContainerRequest {
    pub container_id: String,
    pub player_id: i64,
    pub container_type: String,
    pub config: serde_json::Value,
    pub restart_policy: RestartPolicy,
    pub max_restarts: u32,
}

/// Owns every container's lifecycle: creation, cancellation, restart policy
/// and status bookkeeping. All table mutations go through one async mutex.
#[derive(Clone)]
pub struct ContainerSupervisor {
    containers: Arc<Mutex<HashMap<String, ContainerEntry>>>,
    db: DbClient,
    routing: Arc<RoutingEngine>,
    api_clients: ApiClientPool,
}

impl ContainerSupervisor {
    pub fn new(db: &DbClient, routing: &Arc<RoutingEngine>, api_clients: &ApiClientPool) -> Self {
        ContainerSupervisor {
            containers: Arc::new(Mutex::new(HashMap::new())),
            db: db.clone(),
            routing: routing.clone(),
            api_clients: api_clients.clone(),
        }
    }

    /// Create and start a container. The config must parse as a known
    /// workload; duplicate ids are refused before any task is spawned.
    pub async fn create(&self, request: CreateContainerRequest) -> Result<ContainerDescriptor> {
        if request.container_type != "command" {
            return Err(Error::InvalidState(format!(
                "unknown container type: {}",
                request.container_type
            )));
        }
        let workload: WorkloadConfig = serde_json::from_value(request.config.clone())
            .map_err(|e| Error::InvalidState(format!("invalid container config: {}", e)))?;

        let mut containers = self.containers.lock().await;
        if containers.contains_key(&request.container_id) {
            return Err(Error::Conflict(format!(
                "container {} already exists",
                request.container_id
            )));
        }

        let descriptor = ContainerDescriptor {
            container_id: request.container_id.clone(),
            player_id: request.player_id,
            container_type: request.container_type.clone(),
            command_type: workload.command_type().to_string(),
            status: ContainerStatus::Starting,
            restart_policy: request.restart_policy,
            restart_count: 0,
            max_restarts: request.max_restarts,
            config: request.config,
            started_at: Some(Utc::now()),
            stopped_at: None,
            exit_code: None,
            exit_reason: None,
        };
        self.db.upsert_container(&descriptor).await?;

        let (cancel_tx, cancel_signal) = CancelSignal::new();
        let task = tokio::spawn(run_container(
            self.clone(),
            descriptor.clone(),
            workload,
            cancel_signal,
        ));

        containers.insert(
            request.container_id.clone(),
            ContainerEntry {
                descriptor: descriptor.clone(),
                cancel: cancel_tx,
                task: Some(task),
                user_stopped: false,
            },
        );
        info!(
            "Created container {} (type={})",
            descriptor.container_id, descriptor.command_type
        );
        Ok(descriptor)
    }

    /// Signal cancellation and await the task. The map lock is dropped while
    /// waiting so the running task can still report its status.
    pub async fn stop(&self, container_id: &str) -> Result<ContainerDescriptor> {
        let task = {
            let mut containers = self.containers.lock().await;
            let entry = containers
                .get_mut(container_id)
                .ok_or_else(|| Error::NotFound(format!("container {}", container_id)))?;
            if entry.descriptor.status.is_terminal() {
                return Ok(entry.descriptor.clone());
            }
            entry.user_stopped = true;
            entry.descriptor.status = ContainerStatus::Stopping;
            let _ = entry.cancel.send(true);
            entry.task.take()
        };

        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Container {} task panicked: {}", container_id, e);
            }
        }

        let descriptor = {
            let mut containers = self.containers.lock().await;
            let entry = containers
                .get_mut(container_id)
                .ok_or_else(|| Error::NotFound(format!("container {}", container_id)))?;
            if !entry.descriptor.status.is_terminal() {
                entry.descriptor.status = ContainerStatus::Stopped;
            }
            entry.descriptor.stopped_at = Some(Utc::now());
            entry.descriptor.clone()
        };
        self.db.upsert_container(&descriptor).await?;
        info!("Stopped container {}", container_id);
        Ok(descriptor)
    }

    /// Remove a terminal container from the table.
    pub async fn remove(&self, container_id: &str) -> Result<()> {
        let mut containers = self.containers.lock().await;
        let entry = containers
            .get(container_id)
            .ok_or_else(|| Error::NotFound(format!("container {}", container_id)))?;
        if !entry.descriptor.status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "cannot remove running container {} (status={})",
                container_id, entry.descriptor.status
            )));
        }
        containers.remove(container_id);
        info!("Removed container {}", container_id);
        Ok(())
    }

    pub async fn get(&self, container_id: &str) -> Option<ContainerDescriptor> {
        let containers = self.containers.lock().await;
        containers
            .get(container_id)
            .map(|entry| entry.descriptor.clone())
    }

    pub async fn list(&self, player_id: Option<i64>) -> Vec<ContainerDescriptor> {
        let containers = self.containers.lock().await;
        let mut list: Vec<ContainerDescriptor> = containers
            .values()
            .map(|entry| entry.descriptor.clone())
            .filter(|descriptor| player_id.is_none_or(|id| descriptor.player_id == id))
            .collect();
        list.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        list
    }

    pub async fn container_ids(&self) -> Vec<String> {
        let containers = self.containers.lock().await;
        containers.keys().cloned().collect()
    }

    pub async fn container_count(&self) -> usize {
        self.containers.lock().await.len()
    }

    /// Stop every container; used during daemon shutdown.
    pub async fn stop_all(&self) {
        for container_id in self.container_ids().await {
            if let Err(e) = self.stop(&container_id).await {
                error!("Error stopping container {}: {}", container_id, e);
            }
        }
    }

    async fn update_descriptor<F>(&self, container_id: &str, update: F)
    where
        F: FnOnce(&mut ContainerDescriptor),
    {
        let descriptor = {
            let mut containers = self.containers.lock().await;
            match containers.get_mut(container_id) {
                Some(entry) => {
                    update(&mut entry.descriptor);
                    Some(entry.descriptor.clone())
                }
                None => None,
            }
        };
        if let Some(descriptor) = descriptor {
            if let Err(e) = self.db.upsert_container(&descriptor).await {
                error!("Failed to persist container {}: {}", container_id, e);
            }
        }
    }

    async fn was_user_stopped(&self, container_id: &str) -> bool {
        let containers = self.containers.lock().await;
        containers
            .get(container_id)
            .map(|entry| entry.user_stopped)
            .unwrap_or(true)
    }

    async fn build_context(
        &self,
        descriptor: &ContainerDescriptor,
        cancel: CancelSignal,
    ) -> Result<WorkloadContext> {
        let (api_client, universe) = self.api_clients.for_player(descriptor.player_id).await?;
        self.db.touch_player(descriptor.player_id).await?;
        Ok(WorkloadContext {
            container_id: descriptor.container_id.clone(),
            player_id: descriptor.player_id,
            db: self.db.clone(),
            api_client,
            universe,
            routing: self.routing.clone(),
            supervisor: self.clone(),
            cancel,
        })
    }
}

/// Per-container driver: runs the workload, applies exit bookkeeping and the
/// restart policy, and releases the ship assignment on final exit.
async fn run_container(
    supervisor: ContainerSupervisor,
    descriptor: ContainerDescriptor,
    workload: WorkloadConfig,
    cancel: CancelSignal,
) {
    let container_id = descriptor.container_id.clone();
    let player_id = descriptor.player_id;
    let ship_symbol = workload.ship_symbol().map(str::to_string);
    let policy = descriptor.restart_policy;
    let max_restarts = descriptor.max_restarts;
    let mut restart_count = 0u32;

    let exit_reason = loop {
        supervisor
            .update_descriptor(&container_id, |d| {
                d.status = ContainerStatus::Running;
                d.restart_count = restart_count;
            })
            .await;

        let context = match supervisor.build_context(&descriptor, cancel.clone()).await {
            Ok(context) => context,
            Err(e) => {
                supervisor
                    .update_descriptor(&container_id, |d| {
                        d.status = ContainerStatus::Failed;
                        d.exit_code = Some(1);
                        d.exit_reason = Some(e.to_string());
                    })
                    .await;
                break Some(e.to_string());
            }
        };
        context.log(LogLevel::Info, "Container started").await;

        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            result = workload.run(&context) => Some(result),
        };

        let (exit_code, reason) = match &result {
            None => {
                context.log(LogLevel::Warning, "Container cancelled").await;
                supervisor
                    .update_descriptor(&container_id, |d| {
                        d.status = ContainerStatus::Stopped;
                        d.exit_code = Some(0);
                        d.exit_reason = Some("cancelled".to_string());
                    })
                    .await;
                (0, "cancelled".to_string())
            }
            Some(Ok(())) => {
                context.log(LogLevel::Info, "Container completed").await;
                supervisor
                    .update_descriptor(&container_id, |d| {
                        d.status = ContainerStatus::Stopped;
                        d.exit_code = Some(0);
                        d.exit_reason = None;
                    })
                    .await;
                (0, "completed".to_string())
            }
            Some(Err(e)) => {
                context
                    .log(LogLevel::Error, &format!("Container failed: {}", e))
                    .await;
                let message = e.to_string();
                supervisor
                    .update_descriptor(&container_id, |d| {
                        d.status = ContainerStatus::Failed;
                        d.exit_code = Some(1);
                        d.exit_reason = Some(message.clone());
                    })
                    .await;
                (1, message)
            }
        };

        let user_stopped =
            cancel.is_cancelled() || supervisor.was_user_stopped(&container_id).await;
        if !should_restart(policy, exit_code, restart_count, max_restarts, user_stopped) {
            break Some(reason);
        }

        let backoff = restart_backoff(restart_count);
        info!(
            "Restarting container {} in {:?} (attempt {}/{})",
            container_id,
            backoff,
            restart_count + 1,
            max_restarts
        );
        tokio::select! {
            _ = cancel.cancelled() => break Some("cancelled".to_string()),
            _ = tokio::time::sleep(backoff) => {}
        }
        restart_count += 1;
        supervisor
            .update_descriptor(&container_id, |d| {
                d.status = ContainerStatus::Starting;
                d.restart_count = restart_count;
            })
            .await;
    };

    supervisor
        .update_descriptor(&container_id, |d| {
            d.stopped_at = Some(Utc::now());
        })
        .await;

    // the assignment is held across restarts and released exactly once, here
    if let Some(ship_symbol) = ship_symbol {
        let reason = exit_reason.unwrap_or_else(|| "completed".to_string());
        if let Err(e) = supervisor
            .db
            .release_ship(player_id, &ship_symbol, &reason)
            .await
        {
            error!("Failed to release ship {}: {}", ship_symbol, e);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_restart_policy_matrix() {
        use RestartPolicy::*;
        // no policy never restarts
        assert!(!should_restart(No, 1, 0, 3, false));
        // on-failure restarts only failures, bounded by max_restarts
        assert!(should_restart(OnFailure, 1, 0, 3, false));
        assert!(!should_restart(OnFailure, 0, 0, 3, false));
        assert!(!should_restart(OnFailure, 1, 3, 3, false));
        // always restarts clean exits too
        assert!(should_restart(Always, 0, 0, 3, false));
        // a user stop suppresses every policy
        assert!(!should_restart(Always, 1, 0, 3, true));
        assert!(!should_restart(UnlessStopped, 1, 0, 3, true));
        assert!(should_restart(UnlessStopped, 0, 1, 3, false));
    }

    #[test]
    fn test_restart_backoff_caps_at_sixty() {
        assert_eq!(restart_backoff(0), Duration::from_secs(1));
        assert_eq!(restart_backoff(1), Duration::from_secs(2));
        assert_eq!(restart_backoff(5), Duration::from_secs(32));
        assert_eq!(restart_backoff(6), Duration::from_secs(60));
        assert_eq!(restart_backoff(30), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_cancel_signal() {
        let (tx, signal) = CancelSignal::new();
        assert!(!signal.is_cancelled());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move {
                signal.cancelled().await;
            })
        };
        tx.send(true).unwrap();
        waiter.await.unwrap();
        assert!(signal.is_cancelled());
    }

    async fn test_supervisor() -> ContainerSupervisor {
        let db = DbClient::connect_in_memory().await.unwrap();
        db.upsert_player("AGENT_A", "token").await.unwrap();
        let routing = Arc::new(RoutingEngine::new());
        let pool = crate::daemon::ApiClientPool::new(&db);
        ContainerSupervisor::new(&db, &routing, &pool)
    }

    fn dock_request(container_id: &str) -> CreateContainerRequest {
        CreateContainerRequest {
            container_id: container_id.to_string(),
            player_id: 1,
            container_type: "command".to_string(),
            config: serde_json::json!({
                "command_type": "DockShip",
                "params": {"ship_symbol": "SHIP-1"},
            }),
            restart_policy: RestartPolicy::No,
            max_restarts: DEFAULT_MAX_RESTARTS,
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_unknown_configs() {
        let supervisor = test_supervisor().await;

        let descriptor = supervisor.create(dock_request("c1")).await.unwrap();
        assert_eq!(descriptor.status, ContainerStatus::Starting);
        assert_eq!(descriptor.command_type, "DockShip");

        let err = supervisor.create(dock_request("c1")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let mut bad_tag = dock_request("c2");
        bad_tag.config = serde_json::json!({"command_type": "LaunchMissiles", "params": {}});
        assert!(supervisor.create(bad_tag).await.is_err());

        let mut bad_type = dock_request("c3");
        bad_type.container_type = "pod".to_string();
        assert!(supervisor.create(bad_type).await.is_err());

        // only c1 made it into the table
        assert_eq!(supervisor.list(None).await.len(), 1);
        assert_eq!(supervisor.container_count().await, 1);

        supervisor.stop("c1").await.unwrap();
        supervisor.remove("c1").await.unwrap();
        assert!(supervisor.get("c1").await.is_none());
    }

    #[tokio::test]
    async fn test_stop_unknown_container_is_not_found() {
        let supervisor = test_supervisor().await;
        assert!(matches!(
            supervisor.stop("missing").await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            supervisor.remove("missing").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_remove_requires_terminal_status() {
        let supervisor = test_supervisor().await;
        supervisor.create(dock_request("c1")).await.unwrap();
        match supervisor.remove("c1").await {
            // still running: the removal is refused
            Err(Error::InvalidState(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
            // the workload already failed and was legitimately removable
            Ok(()) => return,
        }
        supervisor.stop("c1").await.unwrap();
        supervisor.remove("c1").await.unwrap();
    }
}

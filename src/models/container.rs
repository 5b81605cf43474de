use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ContainerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerStatus::Stopped | ContainerStatus::Failed)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    OnFailure,
    Always,
    UnlessStopped,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::No
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Supervisor-owned view of one container. Mutated only by the supervisor
/// while the container task is live.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerDescriptor {
    pub container_id: String,
    pub player_id: i64,
    pub container_type: String,
    pub command_type: String,
    pub status: ContainerStatus,
    pub restart_policy: RestartPolicy,
    pub restart_count: u32,
    pub max_restarts: u32,
    pub config: serde_json::Value,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub exit_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerLogEntry {
    pub log_id: i64,
    pub container_id: String,
    pub player_id: i64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr as _;

    #[test]
    fn test_status_strings() {
        assert_eq!(ContainerStatus::Starting.to_string(), "STARTING");
        assert_eq!(
            ContainerStatus::from_str("FAILED").unwrap(),
            ContainerStatus::Failed
        );
        assert!(ContainerStatus::Failed.is_terminal());
        assert!(!ContainerStatus::Running.is_terminal());
    }

    #[test]
    fn test_restart_policy_strings() {
        assert_eq!(RestartPolicy::OnFailure.to_string(), "on-failure");
        assert_eq!(
            RestartPolicy::from_str("unless-stopped").unwrap(),
            RestartPolicy::UnlessStopped
        );
        assert_eq!(
            serde_json::from_str::<RestartPolicy>("\"always\"").unwrap(),
            RestartPolicy::Always
        );
    }

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warning < LogLevel::Error);
        assert_eq!(LogLevel::Warning.to_string(), "WARNING");
    }
}

use super::db_models::{ContainerLogRow, ContainerRow};
use super::{DbClient, with_conn};
use crate::models::{ContainerDescriptor, ContainerLogEntry, LogLevel};
use crate::util::{format_ts, parse_ts};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use diesel::ExpressionMethods as _;
use diesel::OptionalExtension as _;
use diesel::QueryDsl as _;
use diesel::SelectableHelper as _;
use diesel::upsert::excluded;
use diesel_async::RunQueryDsl as _;
use log::*;
use std::collections::HashMap;
use std::sync::Mutex;

const DEDUP_WINDOW_SECONDS: i64 = 60;
const DEDUP_MAX_ENTRIES: usize = 10_000;

/// Time-windowed log deduplication: a (container_id, message) pair is
/// suppressed if the same pair was persisted within the last 60 seconds.
pub struct LogDeduper {
    cache: Mutex<HashMap<(String, String), DateTime<Utc>>>,
}

impl LogDeduper {
    pub fn new() -> LogDeduper {
        LogDeduper {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true when the entry should be persisted, updating the cache.
    /// Compaction runs under the same lock once the cache passes its size
    /// threshold, dropping entries older than the window.
    pub fn should_log(&self, container_id: &str, message: &str, now: DateTime<Utc>) -> bool {
        let window = Duration::seconds(DEDUP_WINDOW_SECONDS);
        let key = (container_id.to_string(), message.to_string());
        let mut cache = self.cache.lock().unwrap();
        if let Some(last) = cache.get(&key) {
            if now - *last < window {
                return false;
            }
        }
        if cache.len() >= DEDUP_MAX_ENTRIES {
            let cutoff = now - window;
            cache.retain(|_, ts| *ts >= cutoff);
            debug!("Compacted log dedup cache to {} entries", cache.len());
        }
        cache.insert(key, now);
        true
    }
}

impl Default for LogDeduper {
    fn default() -> Self {
        Self::new()
    }
}

/// Containers & container logs
impl DbClient {
    pub async fn upsert_container(&self, descriptor: &ContainerDescriptor) -> Result<()> {
        use crate::schema::containers as c;
        let config_json = serde_json::to_string(&descriptor.config)?;
        let started_at = descriptor.started_at.map(format_ts);
        let stopped_at = descriptor.stopped_at.map(format_ts);
        with_conn!(self, conn => {
            diesel::insert_into(c::table)
                .values((
                    c::container_id.eq(&descriptor.container_id),
                    c::player_id.eq(descriptor.player_id),
                    c::container_type.eq(&descriptor.container_type),
                    c::command_type.eq(&descriptor.command_type),
                    c::status.eq(descriptor.status.to_string()),
                    c::restart_policy.eq(descriptor.restart_policy.to_string()),
                    c::restart_count.eq(descriptor.restart_count as i32),
                    c::max_restarts.eq(descriptor.max_restarts as i32),
                    c::config.eq(&config_json),
                    c::started_at.eq(started_at.as_deref()),
                    c::stopped_at.eq(stopped_at.as_deref()),
                    c::exit_code.eq(descriptor.exit_code),
                    c::exit_reason.eq(descriptor.exit_reason.as_deref()),
                ))
                .on_conflict(c::container_id)
                .do_update()
                .set((
                    c::status.eq(excluded(c::status)),
                    c::restart_count.eq(excluded(c::restart_count)),
                    c::started_at.eq(excluded(c::started_at)),
                    c::stopped_at.eq(excluded(c::stopped_at)),
                    c::exit_code.eq(excluded(c::exit_code)),
                    c::exit_reason.eq(excluded(c::exit_reason)),
                ))
                .execute(conn)
                .await?;
            Ok(())
        })
    }

    pub async fn get_container_row(&self, container_id: &str) -> Result<Option<ContainerRow>> {
        use crate::schema::containers as c;
        with_conn!(self, conn => {
            c::table
                .filter(c::container_id.eq(container_id))
                .select(ContainerRow::as_select())
                .first(conn)
                .await
                .optional()
                .map_err(Error::from)
        })
    }

    /// Append a container log entry through the dedup filter. Returns true
    /// when a row was written.
    pub async fn log_container(
        &self,
        container_id: &str,
        player_id: i64,
        level: LogLevel,
        message: &str,
    ) -> Result<bool> {
        use crate::schema::container_logs as cl;
        let now = Utc::now();
        if !self.log_deduper.should_log(container_id, message, now) {
            return Ok(false);
        }
        let ts = format_ts(now);
        with_conn!(self, conn => {
            diesel::insert_into(cl::table)
                .values((
                    cl::container_id.eq(container_id),
                    cl::player_id.eq(player_id),
                    cl::timestamp.eq(&ts),
                    cl::level.eq(level.to_string()),
                    cl::message.eq(message),
                ))
                .execute(conn)
                .await?;
            Ok(true)
        })
    }

    pub async fn get_container_logs(
        &self,
        container_id: &str,
        player_id: i64,
        limit: i64,
        level: Option<LogLevel>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ContainerLogEntry>> {
        use crate::schema::container_logs as cl;
        let since_ts = since.map(format_ts);
        let level_str = level.map(|l| l.to_string());
        let rows: Vec<ContainerLogRow> = with_conn!(self, conn => {
            let mut query = cl::table
                .filter(cl::container_id.eq(container_id))
                .filter(cl::player_id.eq(player_id))
                .into_boxed();
            if let Some(level) = &level_str {
                query = query.filter(cl::level.eq(level));
            }
            if let Some(since) = &since_ts {
                query = query.filter(cl::timestamp.ge(since));
            }
            query
                .order(cl::timestamp.desc())
                .limit(limit)
                .select(ContainerLogRow::as_select())
                .load(conn)
                .await
                .map_err(Error::from)
        })?;
        Ok(rows
            .into_iter()
            .map(|row| ContainerLogEntry {
                log_id: row.log_id,
                container_id: row.container_id,
                player_id: row.player_id,
                timestamp: parse_ts(&row.timestamp).unwrap_or_default(),
                level: row.level.parse().unwrap_or(LogLevel::Info),
                message: row.message,
            })
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone as _;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    #[test]
    fn test_dedup_window() {
        // identical message at t=0, 10, 55, 70: only t=0 and t=70 survive
        let deduper = LogDeduper::new();
        assert!(deduper.should_log("c1", "step 1", at(0)));
        assert!(!deduper.should_log("c1", "step 1", at(10)));
        assert!(!deduper.should_log("c1", "step 1", at(55)));
        assert!(deduper.should_log("c1", "step 1", at(70)));
    }

    #[test]
    fn test_dedup_keyed_per_container_and_message() {
        let deduper = LogDeduper::new();
        assert!(deduper.should_log("c1", "step 1", at(0)));
        assert!(deduper.should_log("c2", "step 1", at(0)));
        assert!(deduper.should_log("c1", "step 2", at(0)));
    }

    #[test]
    fn test_dedup_compaction() {
        let deduper = LogDeduper::new();
        for i in 0..DEDUP_MAX_ENTRIES {
            assert!(deduper.should_log("c1", &format!("msg {}", i), at(0)));
        }
        // cache is full of expired entries; the next insert compacts them
        assert!(deduper.should_log("c1", "overflow", at(120)));
        let len = deduper.cache.lock().unwrap().len();
        assert!(len < DEDUP_MAX_ENTRIES, "cache not compacted: {}", len);
    }

    #[tokio::test]
    async fn test_log_persistence_dedups() {
        let db = DbClient::connect_in_memory().await.unwrap();
        assert!(db.log_container("c1", 1, LogLevel::Info, "hello").await.unwrap());
        assert!(!db.log_container("c1", 1, LogLevel::Info, "hello").await.unwrap());
        assert!(db.log_container("c1", 1, LogLevel::Error, "boom").await.unwrap());

        let logs = db.get_container_logs("c1", 1, 50, None, None).await.unwrap();
        assert_eq!(logs.len(), 2);

        let errors = db
            .get_container_logs("c1", 1, 50, Some(LogLevel::Error), None)
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "boom");
    }
}

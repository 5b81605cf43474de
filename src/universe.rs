use crate::api_client::ApiClient;
use crate::database::DbClient;
use crate::models::{SystemGraph, SystemSymbol, Waypoint, WaypointSymbol};
use crate::{Error, Result};
use chrono::{Duration, Utc};
use log::*;
use moka::future::Cache;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Cached system graphs go stale after two hours, both in process and in the
/// database row backing them.
const GRAPH_TTL_HOURS: i64 = 2;
const WAYPOINT_PAGE_LIMIT: u32 = 20;

/// System graph provider: in-process TTL cache over the `system_graphs`
/// table, lazily synced from the remote. `has_fuel` always comes from the
/// waypoint store, which is authoritative for traits.
#[derive(Clone)]
pub struct Universe {
    api_client: ApiClient,
    db: DbClient,
    graphs: Cache<SystemSymbol, Arc<SystemGraph>>,
}

impl Universe {
    pub fn new(api_client: &ApiClient, db: &DbClient) -> Universe {
        let graphs = Cache::builder()
            .max_capacity(64)
            .time_to_live(std::time::Duration::from_secs(
                (GRAPH_TTL_HOURS * 3600) as u64,
            ))
            .build();
        Universe {
            api_client: api_client.clone(),
            db: db.clone(),
            graphs,
        }
    }

    /// The navigation graph for a system: process cache, then a fresh-enough
    /// database row, then a full remote sync.
    pub async fn get_system_graph(&self, system_symbol: &SystemSymbol) -> Result<Arc<SystemGraph>> {
        if let Some(graph) = self.graphs.get(system_symbol).await {
            return Ok(graph);
        }
        let graph = self.load_or_sync_graph(system_symbol).await?;
        let graph = Arc::new(graph);
        self.graphs
            .insert(system_symbol.clone(), graph.clone())
            .await;
        Ok(graph)
    }

    async fn load_or_sync_graph(&self, system_symbol: &SystemSymbol) -> Result<SystemGraph> {
        if let Some((graph, updated_at)) = self.db.get_system_graph(system_symbol).await? {
            if Utc::now() - updated_at < Duration::hours(GRAPH_TTL_HOURS) {
                return self.enrich_fuel_traits(system_symbol, graph).await;
            }
            debug!("System graph for {} is stale, re-syncing", system_symbol);
        }
        let graph = self.sync_system_waypoints(system_symbol).await?;
        Ok(graph)
    }

    /// Fetch every waypoint in the system from the remote, paginating until a
    /// page comes back empty (`meta.total` is not authoritative for the set
    /// being paged), then persist both the waypoint rows and the graph.
    pub async fn sync_system_waypoints(
        &self,
        system_symbol: &SystemSymbol,
    ) -> Result<SystemGraph> {
        let mut page = 1;
        let mut waypoints: Vec<(WaypointSymbol, Waypoint)> = Vec::new();
        loop {
            let response = self
                .api_client
                .list_waypoints(system_symbol, page, WAYPOINT_PAGE_LIMIT)
                .await?;
            if response.data.is_empty() {
                break;
            }
            for detailed in response.data {
                let traits: BTreeSet<String> = detailed
                    .traits
                    .iter()
                    .map(|t| t.symbol.clone())
                    .collect();
                let orbitals: BTreeSet<WaypointSymbol> = detailed
                    .orbitals
                    .iter()
                    .map(|o| WaypointSymbol::new(&o.symbol))
                    .collect();
                let has_fuel = traits.contains("MARKETPLACE");
                waypoints.push((
                    detailed.symbol,
                    Waypoint {
                        x: detailed.x,
                        y: detailed.y,
                        waypoint_type: detailed.waypoint_type,
                        traits,
                        has_fuel,
                        orbitals,
                    },
                ));
            }
            page += 1;
        }
        info!(
            "Synced {} waypoints for system {} across {} page(s)",
            waypoints.len(),
            system_symbol,
            page - 1
        );

        self.db.save_waypoints(system_symbol, &waypoints).await?;
        let graph: SystemGraph = waypoints.into_iter().collect();
        self.db.save_system_graph(system_symbol, &graph).await?;
        Ok(graph)
    }

    /// Overlay `has_fuel` from the waypoint store onto a graph loaded from
    /// the graph cache table.
    async fn enrich_fuel_traits(
        &self,
        system_symbol: &SystemSymbol,
        mut graph: SystemGraph,
    ) -> Result<SystemGraph> {
        let stored = self.db.get_system_waypoints(system_symbol).await?;
        for (symbol, waypoint) in stored {
            if let Some(node) = graph.get_mut(&symbol) {
                node.has_fuel = waypoint.has_fuel;
                node.traits = waypoint.traits;
            }
        }
        Ok(graph)
    }

    /// Waypoints in the system carrying a trait, from the store; syncs from
    /// the remote when the cache is empty.
    pub async fn find_waypoints_with_trait(
        &self,
        system_symbol: &SystemSymbol,
        trait_symbol: &str,
    ) -> Result<Vec<(WaypointSymbol, Waypoint)>> {
        let cached = self.db.get_system_waypoints(system_symbol).await?;
        if cached.is_empty() {
            self.sync_system_waypoints(system_symbol).await?;
        }
        self.db
            .find_waypoints_with_trait(system_symbol, trait_symbol)
            .await
    }

    pub async fn get_waypoint(
        &self,
        waypoint_symbol: &WaypointSymbol,
    ) -> Result<Waypoint> {
        let system = waypoint_symbol.system();
        let graph = self.get_system_graph(&system).await?;
        graph
            .get(waypoint_symbol)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("waypoint {}", waypoint_symbol)))
    }

    /// Drop a cached graph so the next read re-syncs.
    pub async fn invalidate_system(&self, system_symbol: &SystemSymbol) {
        self.graphs.invalidate(system_symbol).await;
    }
}

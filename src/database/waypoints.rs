use super::db_models::WaypointRow;
use super::{DbClient, with_conn};
use crate::models::{SystemGraph, SystemSymbol, Waypoint, WaypointSymbol};
use crate::util::{now_ts, parse_ts};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use diesel::ExpressionMethods as _;
use diesel::OptionalExtension as _;
use diesel::QueryDsl as _;
use diesel::SelectableHelper as _;
use diesel::upsert::excluded;
use diesel_async::RunQueryDsl as _;
use std::collections::BTreeSet;

/// Waypoint store & cached system graphs
impl DbClient {
    pub async fn save_waypoints(
        &self,
        system_symbol: &SystemSymbol,
        waypoints: &[(WaypointSymbol, Waypoint)],
    ) -> Result<()> {
        use crate::schema::waypoints as wp;
        let mut inserts = Vec::with_capacity(waypoints.len());
        for (symbol, waypoint) in waypoints {
            let traits = serde_json::to_string(&waypoint.traits)?;
            let orbitals = serde_json::to_string(&waypoint.orbitals)?;
            inserts.push((
                symbol.to_string(),
                waypoint.waypoint_type.clone(),
                waypoint.x,
                waypoint.y,
                traits,
                waypoint.has_fuel,
                orbitals,
            ));
        }
        let system = system_symbol.to_string();
        with_conn!(self, conn => {
            for (symbol, waypoint_type, x, y, traits, has_fuel, orbitals) in &inserts {
                diesel::insert_into(wp::table)
                    .values((
                        wp::symbol.eq(symbol),
                        wp::system_symbol.eq(&system),
                        wp::waypoint_type.eq(waypoint_type),
                        wp::x.eq(x),
                        wp::y.eq(y),
                        wp::traits.eq(traits),
                        wp::has_fuel.eq(has_fuel),
                        wp::orbitals.eq(orbitals),
                    ))
                    .on_conflict(wp::symbol)
                    .do_update()
                    .set((
                        wp::waypoint_type.eq(excluded(wp::waypoint_type)),
                        wp::x.eq(excluded(wp::x)),
                        wp::y.eq(excluded(wp::y)),
                        wp::traits.eq(excluded(wp::traits)),
                        wp::has_fuel.eq(excluded(wp::has_fuel)),
                        wp::orbitals.eq(excluded(wp::orbitals)),
                    ))
                    .execute(conn)
                    .await?;
            }
            Ok(())
        })
    }

    pub async fn get_system_waypoints(
        &self,
        system_symbol: &SystemSymbol,
    ) -> Result<Vec<(WaypointSymbol, Waypoint)>> {
        use crate::schema::waypoints as wp;
        let rows: Vec<WaypointRow> = with_conn!(self, conn => {
            wp::table
                .filter(wp::system_symbol.eq(system_symbol.to_string()))
                .order(wp::symbol.asc())
                .select(WaypointRow::as_select())
                .load(conn)
                .await
                .map_err(Error::from)
        })?;
        rows.into_iter().map(waypoint_from_row).collect()
    }

    pub async fn find_waypoints_with_trait(
        &self,
        system_symbol: &SystemSymbol,
        trait_symbol: &str,
    ) -> Result<Vec<(WaypointSymbol, Waypoint)>> {
        let waypoints = self.get_system_waypoints(system_symbol).await?;
        Ok(waypoints
            .into_iter()
            .filter(|(_, waypoint)| waypoint.has_trait(trait_symbol))
            .collect())
    }

    pub async fn save_system_graph(
        &self,
        system_symbol: &SystemSymbol,
        graph: &SystemGraph,
    ) -> Result<()> {
        use crate::schema::system_graphs as sg;
        let graph_json = serde_json::to_string(graph)?;
        let ts = now_ts();
        with_conn!(self, conn => {
            diesel::insert_into(sg::table)
                .values((
                    sg::system_symbol.eq(system_symbol.to_string()),
                    sg::graph.eq(&graph_json),
                    sg::updated_at.eq(&ts),
                ))
                .on_conflict(sg::system_symbol)
                .do_update()
                .set((
                    sg::graph.eq(excluded(sg::graph)),
                    sg::updated_at.eq(excluded(sg::updated_at)),
                ))
                .execute(conn)
                .await?;
            Ok(())
        })
    }

    pub async fn get_system_graph(
        &self,
        system_symbol: &SystemSymbol,
    ) -> Result<Option<(SystemGraph, DateTime<Utc>)>> {
        use crate::schema::system_graphs as sg;
        let row: Option<(String, String)> = with_conn!(self, conn => {
            sg::table
                .filter(sg::system_symbol.eq(system_symbol.to_string()))
                .select((sg::graph, sg::updated_at))
                .first(conn)
                .await
                .optional()
                .map_err(Error::from)
        })?;
        match row {
            Some((graph_json, updated_at)) => {
                let graph: SystemGraph = serde_json::from_str(&graph_json)?;
                let updated_at = parse_ts(&updated_at)
                    .ok_or_else(|| Error::Database("bad graph timestamp".to_string()))?;
                Ok(Some((graph, updated_at)))
            }
            None => Ok(None),
        }
    }
}

fn waypoint_from_row(row: WaypointRow) -> Result<(WaypointSymbol, Waypoint)> {
    let traits: BTreeSet<String> = serde_json::from_str(&row.traits)?;
    let orbitals: BTreeSet<WaypointSymbol> = serde_json::from_str(&row.orbitals)?;
    Ok((
        WaypointSymbol(row.symbol),
        Waypoint {
            x: row.x,
            y: row.y,
            waypoint_type: row.waypoint_type,
            traits,
            has_fuel: row.has_fuel,
            orbitals,
        },
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    fn waypoint(x: f64, y: f64, traits: &[&str]) -> Waypoint {
        Waypoint {
            x,
            y,
            waypoint_type: "PLANET".to_string(),
            traits: traits.iter().map(|t| t.to_string()).collect(),
            has_fuel: traits.contains(&"MARKETPLACE"),
            orbitals: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn test_waypoint_store_round_trip() {
        let db = DbClient::connect_in_memory().await.unwrap();
        let system = SystemSymbol::new("X1-S1");
        let waypoints = vec![
            (
                WaypointSymbol::new("X1-S1-A1"),
                waypoint(0.0, 0.0, &["MARKETPLACE", "SHIPYARD"]),
            ),
            (WaypointSymbol::new("X1-S1-B1"), waypoint(30.0, 0.0, &[])),
        ];
        db.save_waypoints(&system, &waypoints).await.unwrap();
        // upsert is idempotent
        db.save_waypoints(&system, &waypoints).await.unwrap();

        let loaded = db.get_system_waypoints(&system).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded[0].1.has_fuel);

        let shipyards = db
            .find_waypoints_with_trait(&system, "SHIPYARD")
            .await
            .unwrap();
        assert_eq!(shipyards.len(), 1);
        assert_eq!(shipyards[0].0, WaypointSymbol::new("X1-S1-A1"));
    }

    #[tokio::test]
    async fn test_system_graph_round_trip() {
        let db = DbClient::connect_in_memory().await.unwrap();
        let system = SystemSymbol::new("X1-S1");
        let mut graph: SystemGraph = BTreeMap::new();
        graph.insert(WaypointSymbol::new("X1-S1-A1"), waypoint(1.0, 2.0, &[]));

        assert!(db.get_system_graph(&system).await.unwrap().is_none());
        db.save_system_graph(&system, &graph).await.unwrap();
        let (loaded, updated_at) = db.get_system_graph(&system).await.unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(chrono::Utc::now() - updated_at < chrono::Duration::seconds(10));
    }
}

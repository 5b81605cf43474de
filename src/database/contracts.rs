use super::db_models::ContractRow;
use super::{DbClient, with_conn};
use crate::models::Contract;
use crate::util::now_ts;
use crate::{Error, Result};
use diesel::ExpressionMethods as _;
use diesel::OptionalExtension as _;
use diesel::QueryDsl as _;
use diesel::SelectableHelper as _;
use diesel::upsert::excluded;
use diesel_async::RunQueryDsl as _;

/// Contract mirror, refreshed by the batch-contract workflow.
impl DbClient {
    pub async fn upsert_contract(&self, player_id: i64, contract: &Contract) -> Result<()> {
        use crate::schema::contracts as c;
        let contract_json = serde_json::to_string(contract)?;
        let ts = now_ts();
        with_conn!(self, conn => {
            diesel::insert_into(c::table)
                .values((
                    c::contract_id.eq(&contract.id),
                    c::player_id.eq(player_id),
                    c::contract.eq(&contract_json),
                    c::accepted.eq(contract.accepted),
                    c::fulfilled.eq(contract.fulfilled),
                    c::updated_at.eq(&ts),
                ))
                .on_conflict((c::contract_id, c::player_id))
                .do_update()
                .set((
                    c::contract.eq(excluded(c::contract)),
                    c::accepted.eq(excluded(c::accepted)),
                    c::fulfilled.eq(excluded(c::fulfilled)),
                    c::updated_at.eq(excluded(c::updated_at)),
                ))
                .execute(conn)
                .await?;
            Ok(())
        })
    }

    pub async fn get_active_contracts(&self, player_id: i64) -> Result<Vec<Contract>> {
        use crate::schema::contracts as c;
        let rows: Vec<ContractRow> = with_conn!(self, conn => {
            c::table
                .filter(c::player_id.eq(player_id))
                .filter(c::accepted.eq(true))
                .filter(c::fulfilled.eq(false))
                .select(ContractRow::as_select())
                .load(conn)
                .await
                .map_err(Error::from)
        })?;
        rows.into_iter()
            .map(|row| serde_json::from_str(&row.contract).map_err(Error::from))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{ContractPayment, ContractTerms};

    fn contract(id: &str, accepted: bool, fulfilled: bool) -> Contract {
        Contract {
            id: id.to_string(),
            faction_symbol: "CORSAIRS".to_string(),
            contract_type: "PROCUREMENT".to_string(),
            terms: ContractTerms {
                deadline: chrono::Utc::now() + chrono::Duration::days(7),
                payment: ContractPayment {
                    on_accepted: 1000,
                    on_fulfilled: 10000,
                },
                deliver: vec![],
            },
            accepted,
            fulfilled,
            deadline_to_accept: None,
        }
    }

    #[tokio::test]
    async fn test_active_contract_filtering() {
        let db = DbClient::connect_in_memory().await.unwrap();
        db.upsert_contract(1, &contract("c-1", true, false)).await.unwrap();
        db.upsert_contract(1, &contract("c-2", false, false)).await.unwrap();
        db.upsert_contract(1, &contract("c-3", true, true)).await.unwrap();
        db.upsert_contract(2, &contract("c-4", true, false)).await.unwrap();

        let active = db.get_active_contracts(1).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "c-1");

        // fulfilling updates the row in place
        db.upsert_contract(1, &contract("c-1", true, true)).await.unwrap();
        assert!(db.get_active_contracts(1).await.unwrap().is_empty());
    }
}

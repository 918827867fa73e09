//! C4: Serializer.
//!
//! Promotes every dirty application row into `Store`, drains the
//! `DeletedModels`/`HardDeletedModels` queues, then raises `DatabaseMaxCounter`
//! to the freshly-minted counter. One redb write transaction for the whole
//! run, grounded on the original `_serialize_into_store`.

use morango_core::{Filter, InstanceAndCounter, Profile, StoreId};
use morango_store::tables::StoreRecord;
use morango_store::{deleted_models, fsic_ops, hard_deleted_models, store, Database};
use snafu::ResultExt as _;

use crate::schema::DirtyRow;
use crate::{SchemaRegistry, StoreSnafu, SyncResult};

/// Run the Serializer for `profile`, restricted to `filter` if given.
///
/// Returns the `(instance_id, counter)` this run authored everything under.
pub async fn serialize_into_store(
    db: &Database,
    registry: &dyn SchemaRegistry,
    profile: &Profile,
    filter: Option<&Filter>,
) -> SyncResult<InstanceAndCounter> {
    let models = registry.models(profile);
    let dirty_by_model: Vec<(String, Vec<DirtyRow>)> = models
        .iter()
        .map(|m| {
            (
                m.model_name().to_string(),
                m.dirty_rows(filter.unwrap_or(&Filter::everything())),
            )
        })
        .collect();

    let profile = profile.clone();
    let filter = filter.cloned();
    let current_id = db
        .write_with(move |tx| {
            let current_id = Database::current_instance_and_increment_tx(tx)?;

            for (model_name, rows) in &dirty_by_model {
                for row in rows {
                    apply_dirty_row_tx(tx, model_name, &profile, current_id, row)?;
                }
            }

            drain_deleted_models_tx(tx, &profile, current_id)?;
            drain_hard_deleted_models_tx(tx, &profile)?;

            match &filter {
                None => {
                    fsic_ops::upsert_dmc_tx(
                        tx,
                        current_id.instance_id,
                        morango_core::Partition::new(""),
                        current_id.counter,
                    )?;
                }
                Some(f) if f.is_everything() => {
                    fsic_ops::upsert_dmc_tx(
                        tx,
                        current_id.instance_id,
                        morango_core::Partition::new(""),
                        current_id.counter,
                    )?;
                }
                Some(f) => {
                    for prefix in f.prefixes() {
                        fsic_ops::upsert_dmc_tx(
                            tx,
                            current_id.instance_id,
                            prefix.clone(),
                            current_id.counter,
                        )?;
                    }
                }
            }

            Ok(current_id)
        })
        .await
        .context(StoreSnafu)?;

    for (model, rows) in models.iter().zip(dirty_by_model.iter().map(|(_, r)| r)) {
        let store_ids: Vec<StoreId> = rows.iter().map(|r| r.store_id).collect();
        model.clear_dirty_bits(&store_ids);
    }

    Ok(current_id)
}

fn apply_dirty_row_tx(
    tx: &morango_store::WriteTransactionCtx,
    model_name: &str,
    profile: &Profile,
    current_id: InstanceAndCounter,
    row: &DirtyRow,
) -> morango_store::DbResult<()> {
    let mut store_tbl = tx.open_table(&store::TABLE)?;
    let existing = store_tbl.get(&row.store_id)?.map(|g| g.value());

    let self_ref_fk = row
        .self_ref_fk
        .map(|id| id.to_string())
        .unwrap_or_default();

    let record = match existing {
        Some(mut rec) => {
            if rec.dirty_bit {
                rec.conflicting_serialized_data =
                    format!("{}\n{}", rec.serialized, rec.conflicting_serialized_data);
                rec.dirty_bit = false;
            }

            let mut merged: serde_json::Map<String, serde_json::Value> = if rec.serialized.is_empty() {
                serde_json::Map::new()
            } else {
                serde_json::from_str(&rec.serialized).unwrap_or_default()
            };
            for (k, v) in &row.serialized {
                merged.insert(k.clone(), v.clone());
            }
            rec.serialized = serde_json::Value::Object(merged).to_string();

            rec.last_saved_instance = current_id.instance_id;
            rec.last_saved_counter = current_id.counter;
            rec.deleted = false;
            rec.hard_delete = false;
            rec.self_ref_fk = self_ref_fk;
            rec
        }
        None => StoreRecord {
            serialized: serde_json::Value::Object(row.serialized.clone()).to_string(),
            conflicting_serialized_data: String::new(),
            last_saved_instance: current_id.instance_id,
            last_saved_counter: current_id.counter,
            deleted: false,
            hard_delete: false,
            model_name: model_name.to_string(),
            profile: profile.clone(),
            partition: row.partition.clone(),
            source_id: row.source_id.clone(),
            self_ref_fk,
            dirty_bit: false,
            last_transfer_session_id: None,
        },
    };
    store_tbl.insert(&row.store_id, &record)?;
    drop(store_tbl);

    let mut rmc_tbl = tx.open_table(&morango_store::record_max_counter::TABLE)?;
    rmc_tbl.insert(&(row.store_id, current_id.instance_id), &current_id.counter)?;
    Ok(())
}

fn drain_deleted_models_tx(
    tx: &morango_store::WriteTransactionCtx,
    profile: &Profile,
    current_id: InstanceAndCounter,
) -> morango_store::DbResult<()> {
    let ids: Vec<StoreId> = {
        let tbl = tx.open_table(&deleted_models::TABLE)?;
        tbl.range(
            &(profile.clone(), StoreId::ZERO)..=&(profile.clone(), StoreId::MAX),
        )?
        .map(|e| e.map(|e| e.0.value().1))
        .collect::<Result<_, _>>()?
    };

    for store_id in &ids {
        let mut store_tbl = tx.open_table(&store::TABLE)?;
        if let Some(mut rec) = store_tbl.get(store_id)?.map(|g| g.value()) {
            rec.deleted = true;
            rec.dirty_bit = false;
            rec.last_saved_instance = current_id.instance_id;
            rec.last_saved_counter = current_id.counter;
            store_tbl.insert(store_id, &rec)?;
            drop(store_tbl);

            let mut rmc_tbl = tx.open_table(&morango_store::record_max_counter::TABLE)?;
            rmc_tbl.insert(&(*store_id, current_id.instance_id), &current_id.counter)?;
        }
    }

    let mut tbl = tx.open_table(&deleted_models::TABLE)?;
    for store_id in ids {
        tbl.remove(&(profile.clone(), store_id))?;
    }
    Ok(())
}

fn drain_hard_deleted_models_tx(
    tx: &morango_store::WriteTransactionCtx,
    profile: &Profile,
) -> morango_store::DbResult<()> {
    let ids: Vec<StoreId> = {
        let tbl = tx.open_table(&hard_deleted_models::TABLE)?;
        tbl.range(
            &(profile.clone(), StoreId::ZERO)..=&(profile.clone(), StoreId::MAX),
        )?
        .map(|e| e.map(|e| e.0.value().1))
        .collect::<Result<_, _>>()?
    };

    for store_id in &ids {
        let mut store_tbl = tx.open_table(&store::TABLE)?;
        if let Some(mut rec) = store_tbl.get(store_id)?.map(|g| g.value()) {
            let (serialized, conflicting_serialized_data) = StoreRecord::hard_deleted_payload();
            rec.hard_delete = true;
            rec.serialized = serialized;
            rec.conflicting_serialized_data = conflicting_serialized_data;
            store_tbl.insert(store_id, &rec)?;
        }
    }

    let mut tbl = tx.open_table(&hard_deleted_models::TABLE)?;
    for store_id in ids {
        tbl.remove(&(profile.clone(), store_id))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use morango_core::Partition;

    use super::*;
    use crate::schema::ModelSchema;

    struct FakeModel {
        name: &'static str,
        rows: Mutex<Vec<DirtyRow>>,
        cleared: Mutex<Vec<StoreId>>,
    }

    impl ModelSchema for FakeModel {
        fn model_name(&self) -> &str {
            self.name
        }

        fn dependencies(&self) -> &[String] {
            &[]
        }

        fn has_self_ref_fk(&self) -> bool {
            false
        }

        fn dirty_rows(&self, _filter: &Filter) -> Vec<DirtyRow> {
            self.rows.lock().unwrap().clone()
        }

        fn clear_dirty_bits(&self, store_ids: &[StoreId]) {
            self.cleared.lock().unwrap().extend_from_slice(store_ids);
        }

        fn deserialize_row(&self, _store_id: StoreId, _serialized: &str) -> SyncResult<()> {
            Ok(())
        }
    }

    struct FakeRegistry(Vec<Box<dyn ModelSchema>>);

    impl SchemaRegistry for FakeRegistry {
        fn models(&self, _profile: &Profile) -> Vec<&dyn ModelSchema> {
            self.0.iter().map(|m| m.as_ref()).collect()
        }
    }

    #[test_log::test(tokio::test)]
    async fn promotes_dirty_row_into_store() -> Result<(), Box<dyn std::error::Error>> {
        let db = Database::new_in_memory().await?;
        db.ensure_identity(Some("node")).await?;

        let store_id = StoreId::random();
        let mut fields = serde_json::Map::new();
        fields.insert("name".into(), serde_json::json!("widget"));

        let model = FakeModel {
            name: "widget",
            rows: Mutex::new(vec![DirtyRow {
                store_id,
                source_id: "src".into(),
                partition: Partition::new("facility/1"),
                self_ref_fk: None,
                serialized: fields,
            }]),
            cleared: Mutex::new(vec![]),
        };
        let registry = FakeRegistry(vec![Box::new(model)]);

        let profile = Profile::new("test");
        serialize_into_store(&db, &registry, &profile, None).await?;

        let stored = db
            .read_with(|tx| {
                let tbl = tx.open_table(&store::TABLE)?;
                Ok(tbl.get(&store_id)?.expect("promoted").value())
            })
            .await?;
        assert!(stored.serialized.contains("widget"));
        assert!(!stored.dirty_bit);

        let dmc = db
            .read_with(|tx| {
                let tbl = tx.open_table(&morango_store::database_max_counter::TABLE)?;
                Ok(fsic_ops::read_dmc_for_filter_tx(&tbl, &Filter::everything())?)
            })
            .await?;
        assert_eq!(dmc.len(), 1);

        Ok(())
    }
}

//! C5: Deserializer.
//!
//! Integrates every dirty `Store` row back into the application schema, one
//! model at a time in the registry's leaves-first order. A model with a
//! self-referential FK gets its own topological pass so a child row is never
//! handed to the embedder before its parent.
//!
//! Runs the Serializer with no filter first, so any locally dirty app rows
//! are promoted into `Store` (and therefore survive) before this pass reads
//! `Store` back out - otherwise a local edit racing a dequeue could be
//! silently dropped.

use std::collections::HashSet;

use morango_core::{Profile, StoreId};
use morango_store::{store, Database};
use snafu::ResultExt as _;

use crate::schema::ModelSchema;
use crate::{SchemaRegistry, StoreSnafu, SyncResult, LOG_TARGET};

#[derive(Debug, Default, Clone)]
pub struct DeserializeStats {
    pub integrated: u64,
    /// Rows that failed application-level validation, or sat in an
    /// unresolvable self-ref-FK cycle. Left dirty for a future pass.
    pub excluded: Vec<StoreId>,
}

pub async fn deserialize_from_store(
    db: &Database,
    registry: &dyn SchemaRegistry,
    profile: &Profile,
) -> SyncResult<DeserializeStats> {
    crate::serializer::serialize_into_store(db, registry, profile, None).await?;

    let models = registry.models(profile);
    let mut stats = DeserializeStats::default();

    let profile = profile.clone();
    db.write_with(move |tx| {
        for model in &models {
            if model.has_self_ref_fk() {
                deserialize_self_ref_model_tx(tx, *model, &profile, &mut stats)?;
            } else {
                deserialize_simple_model_tx(tx, *model, &profile, &mut stats)?;
            }
        }
        Ok(())
    })
    .await
    .context(StoreSnafu)?;

    Ok(stats)
}

struct DirtyStoreRow {
    store_id: StoreId,
    self_ref_fk: Option<StoreId>,
    serialized: String,
}

fn dirty_rows_for_model_tx(
    tx: &morango_store::WriteTransactionCtx,
    model: &dyn ModelSchema,
    profile: &Profile,
) -> morango_store::DbResult<Vec<DirtyStoreRow>> {
    let store_tbl = tx.open_table(&store::TABLE)?;
    let mut out = Vec::new();
    for entry in store_tbl.range(..)? {
        let entry = entry?;
        let store_id = entry.0.value();
        let row = entry.1.value();
        if !row.dirty_bit || &row.profile != profile || row.model_name != model.model_name() {
            continue;
        }
        let self_ref_fk = (!row.self_ref_fk.is_empty())
            .then(|| row.self_ref_fk.parse().ok())
            .flatten();
        out.push(DirtyStoreRow {
            store_id,
            self_ref_fk,
            serialized: row.serialized,
        });
    }
    Ok(out)
}

fn clear_store_dirty_bit_tx(
    tx: &morango_store::WriteTransactionCtx,
    store_id: StoreId,
) -> morango_store::DbResult<()> {
    let mut store_tbl = tx.open_table(&store::TABLE)?;
    if let Some(mut rec) = store_tbl.get(&store_id)?.map(|g| g.value()) {
        rec.dirty_bit = false;
        store_tbl.insert(&store_id, &rec)?;
    }
    Ok(())
}

fn deserialize_simple_model_tx(
    tx: &morango_store::WriteTransactionCtx,
    model: &dyn ModelSchema,
    profile: &Profile,
    stats: &mut DeserializeStats,
) -> morango_store::DbResult<()> {
    for row in dirty_rows_for_model_tx(tx, model, profile)? {
        match model.deserialize_row(row.store_id, &row.serialized) {
            Ok(()) => {
                clear_store_dirty_bit_tx(tx, row.store_id)?;
                stats.integrated += 1;
            }
            Err(err) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    store_id = %row.store_id,
                    model = model.model_name(),
                    %err,
                    "row failed application-level validation"
                );
                stats.excluded.push(row.store_id);
            }
        }
    }
    Ok(())
}

/// Self-ref-FK model: repeatedly integrate every row whose parent (if any)
/// is not itself still waiting. A pass that integrates nothing means the
/// remainder is an unresolvable cycle (or points outside the dirty set
/// entirely, which `dirty_rows_for_model_tx` already filtered out).
fn deserialize_self_ref_model_tx(
    tx: &morango_store::WriteTransactionCtx,
    model: &dyn ModelSchema,
    profile: &Profile,
    stats: &mut DeserializeStats,
) -> morango_store::DbResult<()> {
    let mut pending = dirty_rows_for_model_tx(tx, model, profile)?;

    loop {
        if pending.is_empty() {
            return Ok(());
        }

        let waiting_ids: HashSet<StoreId> = pending.iter().map(|r| r.store_id).collect();
        let mut next_pending = Vec::new();
        let mut progressed = false;

        for row in pending {
            let ready = match row.self_ref_fk {
                Some(parent) => !waiting_ids.contains(&parent),
                None => true,
            };
            if !ready {
                next_pending.push(row);
                continue;
            }
            progressed = true;

            match model.deserialize_row(row.store_id, &row.serialized) {
                Ok(()) => {
                    clear_store_dirty_bit_tx(tx, row.store_id)?;
                    stats.integrated += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        store_id = %row.store_id,
                        model = model.model_name(),
                        %err,
                        "row failed application-level validation"
                    );
                    stats.excluded.push(row.store_id);
                }
            }
        }

        if !progressed {
            tracing::warn!(
                target: LOG_TARGET,
                model = model.model_name(),
                count = next_pending.len(),
                "self-ref-FK cycle detected, leaving remainder dirty"
            );
            stats
                .excluded
                .extend(next_pending.into_iter().map(|r| r.store_id));
            return Ok(());
        }
        pending = next_pending;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use morango_core::Filter;

    use super::*;
    use crate::schema::DirtyRow;

    struct RecordingModel {
        name: &'static str,
        has_self_ref: bool,
        integrated: Mutex<Vec<StoreId>>,
        fail: HashSet<StoreId>,
    }

    impl ModelSchema for RecordingModel {
        fn model_name(&self) -> &str {
            self.name
        }

        fn dependencies(&self) -> &[String] {
            &[]
        }

        fn has_self_ref_fk(&self) -> bool {
            self.has_self_ref
        }

        fn dirty_rows(&self, _filter: &Filter) -> Vec<DirtyRow> {
            Vec::new()
        }

        fn clear_dirty_bits(&self, _store_ids: &[StoreId]) {}

        fn deserialize_row(&self, store_id: StoreId, _serialized: &str) -> SyncResult<()> {
            if self.fail.contains(&store_id) {
                return Err(crate::DeserializationErrorSnafu {
                    store_id,
                    reason: "rejected in test".to_string(),
                }
                .build());
            }
            self.integrated.lock().unwrap().push(store_id);
            Ok(())
        }
    }

    struct FixedRegistry(Vec<Box<dyn ModelSchema>>);

    impl SchemaRegistry for FixedRegistry {
        fn models(&self, _profile: &Profile) -> Vec<&dyn ModelSchema> {
            self.0.iter().map(|m| m.as_ref()).collect()
        }
    }

    fn insert_dirty_row(
        tx: &morango_store::WriteTransactionCtx,
        profile: &Profile,
        model_name: &str,
        self_ref_fk: Option<StoreId>,
    ) -> morango_store::DbResult<StoreId> {
        let store_id = StoreId::random();
        let mut tbl = tx.open_table(&store::TABLE)?;
        tbl.insert(
            &store_id,
            &morango_store::tables::StoreRecord {
                serialized: "{}".into(),
                conflicting_serialized_data: String::new(),
                last_saved_instance: morango_core::InstanceId::random(),
                last_saved_counter: 1,
                deleted: false,
                hard_delete: false,
                model_name: model_name.to_string(),
                profile: profile.clone(),
                partition: morango_core::Partition::new(""),
                source_id: "src".into(),
                self_ref_fk: self_ref_fk.map(|id| id.to_string()).unwrap_or_default(),
                dirty_bit: true,
                last_transfer_session_id: None,
            },
        )?;
        Ok(store_id)
    }

    #[test_log::test(tokio::test)]
    async fn integrates_dirty_rows_and_clears_bit() -> Result<(), Box<dyn std::error::Error>> {
        let db = Database::new_in_memory().await?;
        db.ensure_identity(Some("node")).await?;
        let profile = Profile::new("test");

        let store_id = db
            .write_with(|tx| insert_dirty_row(tx, &profile, "widget", None))
            .await?;

        let registry = FixedRegistry(vec![Box::new(RecordingModel {
            name: "widget",
            has_self_ref: false,
            integrated: Mutex::new(vec![]),
            fail: HashSet::new(),
        })]);

        let stats = deserialize_from_store(&db, &registry, &profile).await?;
        assert_eq!(stats.integrated, 1);
        assert!(stats.excluded.is_empty());

        let still_dirty = db
            .read_with(|tx| {
                let tbl = tx.open_table(&store::TABLE)?;
                Ok(tbl.get(&store_id)?.expect("present").value().dirty_bit)
            })
            .await?;
        assert!(!still_dirty);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn self_ref_children_wait_for_parents() -> Result<(), Box<dyn std::error::Error>> {
        let db = Database::new_in_memory().await?;
        db.ensure_identity(Some("node")).await?;
        let profile = Profile::new("test");

        let (parent, child) = db
            .write_with(|tx| {
                let parent = insert_dirty_row(tx, &profile, "node", None)?;
                let child = insert_dirty_row(tx, &profile, "node", Some(parent))?;
                Ok((parent, child))
            })
            .await?;

        let registry = FixedRegistry(vec![Box::new(RecordingModel {
            name: "node",
            has_self_ref: true,
            integrated: Mutex::new(vec![]),
            fail: HashSet::new(),
        })]);

        let stats = deserialize_from_store(&db, &registry, &profile).await?;
        assert_eq!(stats.integrated, 2);
        assert!(stats.excluded.is_empty());
        let _ = (parent, child);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn unresolvable_cycle_is_excluded() -> Result<(), Box<dyn std::error::Error>> {
        let db = Database::new_in_memory().await?;
        db.ensure_identity(Some("node")).await?;
        let profile = Profile::new("test");

        let ids = db
            .write_with(|tx| {
                let a = StoreId::random();
                let b = StoreId::random();
                let mut tbl = tx.open_table(&store::TABLE)?;
                tbl.insert(
                    &a,
                    &morango_store::tables::StoreRecord {
                        serialized: "{}".into(),
                        conflicting_serialized_data: String::new(),
                        last_saved_instance: morango_core::InstanceId::random(),
                        last_saved_counter: 1,
                        deleted: false,
                        hard_delete: false,
                        model_name: "node".into(),
                        profile: profile.clone(),
                        partition: morango_core::Partition::new(""),
                        source_id: "src".into(),
                        self_ref_fk: b.to_string(),
                        dirty_bit: true,
                        last_transfer_session_id: None,
                    },
                )?;
                tbl.insert(
                    &b,
                    &morango_store::tables::StoreRecord {
                        serialized: "{}".into(),
                        conflicting_serialized_data: String::new(),
                        last_saved_instance: morango_core::InstanceId::random(),
                        last_saved_counter: 1,
                        deleted: false,
                        hard_delete: false,
                        model_name: "node".into(),
                        profile: profile.clone(),
                        partition: morango_core::Partition::new(""),
                        source_id: "src".into(),
                        self_ref_fk: a.to_string(),
                        dirty_bit: true,
                        last_transfer_session_id: None,
                    },
                )?;
                Ok((a, b))
            })
            .await?;

        let registry = FixedRegistry(vec![Box::new(RecordingModel {
            name: "node",
            has_self_ref: true,
            integrated: Mutex::new(vec![]),
            fail: HashSet::new(),
        })]);

        let stats = deserialize_from_store(&db, &registry, &profile).await?;
        assert_eq!(stats.integrated, 0);
        assert_eq!(stats.excluded.len(), 2);
        let (a, b) = ids;
        assert!(stats.excluded.contains(&a));
        assert!(stats.excluded.contains(&b));
        Ok(())
    }
}

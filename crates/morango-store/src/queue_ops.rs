//! C6: Queue (outgoing).
//!
//! Selects the `Store` rows owed to the peer under an FSIC delta and stages
//! them, plus their `RecordMaxCounter` rows, into `Buffer`/`RecordMaxCounterBuffer`
//! for this transfer session.
//!
//! The select is a single pass over `store` inside one write transaction -
//! matching the spec's "must be a single SQL statement for throughput"
//! discipline as closely as a key-value store allows. Every predicate
//! (instance id, partition prefix) comes from already-typed values, never
//! from interpolated strings, so there is nothing here equivalent to the
//! injection risk the spec's open question flags in the original.

use morango_core::{Filter, Fsic, Profile, TransferSessionId};

use crate::{buffer, record_max_counter, record_max_counter_buffer, store, DbResult, WriteTransactionCtx};

/// Run the queue stage for `transfer_session_id`.
///
/// `anti_echo_transfer_session_id`, when set, suppresses rows whose
/// `last_transfer_session_id` equals it - the row was written to us by a
/// dequeue from that exact session, so echoing it straight back would be
/// pointless churn (used on resume/repeat syncs with the same peer).
///
/// Returns the number of rows staged (the session's `records_total`).
pub fn queue_tx(
    tx: &WriteTransactionCtx,
    transfer_session_id: TransferSessionId,
    profile: &Profile,
    filter: &Filter,
    delta: &Fsic,
    anti_echo_transfer_session_id: Option<morango_core::TransferSessionId>,
) -> DbResult<u64> {
    if delta.is_empty() {
        return Ok(0);
    }

    let store_tbl = tx.open_table(&store::TABLE)?;
    let rmc_tbl = tx.open_table(&record_max_counter::TABLE)?;
    let mut buffer_tbl = tx.open_table(&buffer::TABLE)?;
    let mut rmcb_tbl = tx.open_table(&record_max_counter_buffer::TABLE)?;

    let mut records_total = 0u64;

    for entry in store_tbl.range(..)? {
        let entry = entry?;
        let store_id = entry.0.value();
        let row = entry.1.value();

        if &row.profile != profile {
            continue;
        }
        if !filter.matches(row.partition.as_str()) {
            continue;
        }
        if anti_echo_transfer_session_id.is_some()
            && row.last_transfer_session_id == anti_echo_transfer_session_id
        {
            continue;
        }

        let owed = delta
            .get(&row.last_saved_instance)
            .is_some_and(|&threshold| row.last_saved_counter > threshold);
        if !owed {
            continue;
        }

        buffer_tbl.insert(
            &(transfer_session_id, store_id),
            &crate::tables::BufferRecord {
                serialized: row.serialized.clone(),
                conflicting_serialized_data: row.conflicting_serialized_data.clone(),
                last_saved_instance: row.last_saved_instance,
                last_saved_counter: row.last_saved_counter,
                deleted: row.deleted,
                hard_delete: row.hard_delete,
                model_name: row.model_name.clone(),
                profile: row.profile.clone(),
                partition: row.partition.clone(),
                source_id: row.source_id.clone(),
                self_ref_fk: row.self_ref_fk.clone(),
            },
        )?;
        records_total += 1;

        for rmc_entry in rmc_tbl.range(
            &(store_id, morango_core::InstanceId::ZERO)..=&(store_id, morango_core::InstanceId::MAX),
        )? {
            let rmc_entry = rmc_entry?;
            let (_, rmc_instance_id) = rmc_entry.0.value();
            let counter = rmc_entry.1.value();
            rmcb_tbl.insert(
                &(transfer_session_id, store_id, rmc_instance_id),
                &counter,
            )?;
        }
    }

    Ok(records_total)
}

#[cfg(test)]
mod tests {
    use morango_core::{InstanceId, Partition, Profile, StoreId};

    use super::*;
    use crate::tables::StoreRecord;
    use crate::Database;

    fn store_row(profile: &Profile, partition: &str, instance: InstanceId, counter: i64) -> StoreRecord {
        StoreRecord {
            serialized: "{}".into(),
            conflicting_serialized_data: String::new(),
            last_saved_instance: instance,
            last_saved_counter: counter,
            deleted: false,
            hard_delete: false,
            model_name: "widget".into(),
            profile: profile.clone(),
            partition: Partition::new(partition),
            source_id: "src".into(),
            self_ref_fk: String::new(),
            dirty_bit: false,
            last_transfer_session_id: None,
        }
    }

    #[test_log::test(tokio::test)]
    async fn empty_delta_queues_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let db = Database::new_in_memory().await?;
        let profile = Profile::new("test");
        let t = morango_core::TransferSessionId::random();

        let total = db
            .write_with(|tx| {
                queue_tx(tx, t, &profile, &Filter::everything(), &Fsic::new(), None)
            })
            .await?;
        assert_eq!(total, 0);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn queues_rows_owed_under_delta() -> Result<(), Box<dyn std::error::Error>> {
        let db = Database::new_in_memory().await?;
        let profile = Profile::new("test");
        let a = InstanceId::from_bytes([1; 16]);
        let store_id_owed = StoreId::from_bytes([2; 16]);
        let store_id_not_owed = StoreId::from_bytes([3; 16]);

        db.write_with(|tx| {
            let mut store_tbl = tx.open_table(&store::TABLE)?;
            store_tbl.insert(&store_id_owed, &store_row(&profile, "facility", a, 5))?;
            store_tbl.insert(&store_id_not_owed, &store_row(&profile, "facility", a, 1))?;
            let mut rmc_tbl = tx.open_table(&record_max_counter::TABLE)?;
            rmc_tbl.insert(&(store_id_owed, a), &5)?;
            rmc_tbl.insert(&(store_id_not_owed, a), &1)?;
            Ok(())
        })
        .await?;

        let t = morango_core::TransferSessionId::random();
        let delta = Fsic::from([(a, 2)]);
        let total = db
            .write_with(|tx| queue_tx(tx, t, &profile, &Filter::everything(), &delta, None))
            .await?;
        assert_eq!(total, 1);

        let staged = db
            .read_with(|tx| {
                let buffer_tbl = tx.open_table(&buffer::TABLE)?;
                Ok(buffer_tbl.get(&(t, store_id_owed))?.is_some())
            })
            .await?;
        assert!(staged);
        Ok(())
    }
}

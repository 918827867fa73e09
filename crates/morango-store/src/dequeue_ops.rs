//! C7: Dequeue (incoming) - the merge engine.
//!
//! Merges every Buffer/RecordMaxCounterBuffer row staged under one
//! `transfer_session_id` back into `Store`/`RecordMaxCounter`, then drains
//! the staging tables for that session.
//!
//! # Classifying a row
//!
//! For a given `store_id`, let `local` be this node's current RMC row plus
//! the Store row's own `(last_saved_instance, last_saved_counter)`, and
//! `incoming` be the buffered RMCB rows plus the Buffer row's own last-saved
//! pair. A row is a **fast-forward** if the incoming side's RMC already
//! covers the local side's last write (`incoming_rmc[local.last_saved_instance]
//! >= local.last_saved_counter`) - the peer has already seen everything we
//! wrote, so their copy is strictly newer and we adopt it outright.
//!
//! It is a **reverse fast-forward** (a no-op for Store content) if the
//! opposite holds: our own RMC already covers the incoming side's last write.
//! We already know about that write; nothing in `Store` changes, but we still
//! union in any RMC entries for instances we hadn't heard of yet, since that
//! is new causal information regardless of which side "wins".
//!
//! Otherwise - neither side's last write is known to the other - it's a
//! genuine **merge conflict**: both are kept, with the loser's `serialized`
//! pushed onto `conflicting_serialized_data`.
//!
//! No separate pass deletes "fully dominated" rows ahead of time; that case
//! is just the reverse-fast-forward path with an incoming RMC set that
//! brings nothing new, which naturally leaves Store untouched.

use morango_core::{Fsic, InstanceAndCounter, StoreId};

use crate::tables::StoreRecord;
use crate::{
    buffer, record_max_counter, record_max_counter_buffer, store, Database, DbResult,
    MergeInvariantViolatedSnafu, WriteTransactionCtx,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct DequeueStats {
    pub fast_forwarded: u64,
    pub reverse_fast_forwarded: u64,
    pub merge_conflicts: u64,
}

/// Run the dequeue stage for `transfer_session_id`, then verify Buffer/RMCB
/// are fully drained (post-condition **D5** / property **P3**).
pub fn dequeue_tx(
    tx: &WriteTransactionCtx,
    transfer_session_id: morango_core::TransferSessionId,
) -> DbResult<DequeueStats> {
    let mut stats = DequeueStats::default();

    let store_ids: Vec<StoreId> = {
        let buffer_tbl = tx.open_table(&buffer::TABLE)?;
        buffer_tbl
            .range(
                &(transfer_session_id, StoreId::ZERO)..=&(transfer_session_id, StoreId::MAX),
            )?
            .map(|entry| entry.map(|e| e.0.value().1))
            .collect::<Result<_, _>>()?
    };

    for store_id in store_ids {
        merge_one_tx(tx, transfer_session_id, store_id, &mut stats)?;
    }

    let (buffer_residue, rmcb_residue) = {
        let buffer_tbl = tx.open_table(&buffer::TABLE)?;
        let rmcb_tbl = tx.open_table(&record_max_counter_buffer::TABLE)?;
        let buffer_residue = buffer_tbl
            .range(&(transfer_session_id, StoreId::ZERO)..=&(transfer_session_id, StoreId::MAX))?
            .count();
        let rmcb_residue = rmcb_tbl
            .range(
                &(transfer_session_id, StoreId::ZERO, morango_core::InstanceId::ZERO)
                    ..=&(transfer_session_id, StoreId::MAX, morango_core::InstanceId::MAX),
            )?
            .count();
        (buffer_residue, rmcb_residue)
    };
    if buffer_residue != 0 || rmcb_residue != 0 {
        return MergeInvariantViolatedSnafu {
            reason: format!(
                "buffer residue after dequeue of {transfer_session_id}: buffer={buffer_residue} rmcb={rmcb_residue}"
            ),
        }
        .fail();
    }

    Ok(stats)
}

fn merge_one_tx(
    tx: &WriteTransactionCtx,
    transfer_session_id: morango_core::TransferSessionId,
    store_id: StoreId,
    stats: &mut DequeueStats,
) -> DbResult<()> {
    let incoming = {
        let buffer_tbl = tx.open_table(&buffer::TABLE)?;
        buffer_tbl
            .get(&(transfer_session_id, store_id))?
            .expect("store_id came from a scan of this very table")
            .value()
    };

    let incoming_rmc: Fsic = {
        let rmcb_tbl = tx.open_table(&record_max_counter_buffer::TABLE)?;
        rmcb_tbl
            .range(
                &(transfer_session_id, store_id, morango_core::InstanceId::ZERO)
                    ..=&(transfer_session_id, store_id, morango_core::InstanceId::MAX),
            )?
            .map(|entry| entry.map(|e| (e.0.value().2, e.1.value())))
            .collect::<Result<_, _>>()?
    };

    let existing = {
        let store_tbl = tx.open_table(&store::TABLE)?;
        store_tbl.get(&store_id)?.map(|g| g.value())
    };

    let local_rmc: Fsic = {
        let rmc_tbl = tx.open_table(&record_max_counter::TABLE)?;
        rmc_tbl
            .range(
                &(store_id, morango_core::InstanceId::ZERO)
                    ..=&(store_id, morango_core::InstanceId::MAX),
            )?
            .map(|entry| entry.map(|e| (e.0.value().1, e.1.value())))
            .collect::<Result<_, _>>()?
    };

    let merged_rmc = union_max(&local_rmc, &incoming_rmc);

    let Some(existing) = existing else {
        // No local row at all: trivially a fast-forward.
        let mut record = incoming_fast_forward_record(&incoming);
        record.last_transfer_session_id = Some(transfer_session_id);
        write_store_tx(tx, store_id, record)?;
        write_rmc_tx(tx, store_id, &incoming_rmc)?;
        drain_buffered_row_tx(tx, transfer_session_id, store_id)?;
        stats.fast_forwarded += 1;
        return Ok(());
    };

    let incoming_dominates_local = incoming_rmc
        .get(&existing.last_saved_instance)
        .copied()
        .unwrap_or(0)
        >= existing.last_saved_counter;
    let local_dominates_incoming = local_rmc
        .get(&incoming.last_saved_instance)
        .copied()
        .unwrap_or(0)
        >= incoming.last_saved_counter;

    if local_dominates_incoming && !incoming_dominates_local {
        // Reverse fast-forward: nothing new to apply to Store, but absorb
        // any RMC entries for instances we hadn't heard of.
        write_rmc_tx(tx, store_id, &merged_rmc)?;
        drain_buffered_row_tx(tx, transfer_session_id, store_id)?;
        stats.reverse_fast_forwarded += 1;
        return Ok(());
    }

    if incoming_dominates_local {
        let mut record = incoming_fast_forward_record(&incoming);
        record.last_transfer_session_id = Some(transfer_session_id);
        write_store_tx(tx, store_id, record)?;
        write_rmc_tx(tx, store_id, &merged_rmc)?;
        drain_buffered_row_tx(tx, transfer_session_id, store_id)?;
        stats.fast_forwarded += 1;
        return Ok(());
    }

    // Merge conflict: neither side's last write is known to the other.
    let InstanceAndCounter {
        instance_id: iid,
        counter: c,
    } = Database::current_instance_and_increment_tx(tx)?;

    let mut conflicting_serialized_data = format!("{}\n{}", existing.serialized, existing.conflicting_serialized_data);
    if !incoming.conflicting_serialized_data.is_empty() {
        conflicting_serialized_data.push('\n');
        conflicting_serialized_data.push_str(&incoming.conflicting_serialized_data);
    }

    let serialized = if incoming.hard_delete {
        existing.serialized.clone()
    } else {
        incoming.serialized.clone()
    };

    let hard_delete = existing.hard_delete || incoming.hard_delete;

    // P7: hard delete absorbs - it always wins over whatever conflict stack
    // would otherwise have been recorded.
    let (serialized, conflicting_serialized_data) = if hard_delete {
        let (s, c) = StoreRecord::hard_deleted_payload();
        (s, c)
    } else {
        (serialized, conflicting_serialized_data)
    };

    let merged = StoreRecord {
        serialized,
        conflicting_serialized_data,
        last_saved_instance: iid,
        last_saved_counter: c,
        deleted: existing.deleted || incoming.deleted,
        hard_delete,
        model_name: existing.model_name,
        profile: existing.profile,
        partition: existing.partition,
        source_id: existing.source_id,
        self_ref_fk: if incoming.hard_delete {
            existing.self_ref_fk.clone()
        } else {
            incoming.self_ref_fk.clone()
        },
        dirty_bit: true,
        last_transfer_session_id: Some(transfer_session_id),
    };
    write_store_tx(tx, store_id, merged)?;

    let mut merged_rmc = merged_rmc;
    merged_rmc
        .entry(iid)
        .and_modify(|v| *v = (*v).max(c))
        .or_insert(c);
    write_rmc_tx(tx, store_id, &merged_rmc)?;

    drain_buffered_row_tx(tx, transfer_session_id, store_id)?;
    stats.merge_conflicts += 1;
    Ok(())
}

fn incoming_fast_forward_record(incoming: &crate::tables::BufferRecord) -> StoreRecord {
    StoreRecord {
        serialized: incoming.serialized.clone(),
        conflicting_serialized_data: incoming.conflicting_serialized_data.clone(),
        last_saved_instance: incoming.last_saved_instance,
        last_saved_counter: incoming.last_saved_counter,
        deleted: incoming.deleted,
        hard_delete: incoming.hard_delete,
        model_name: incoming.model_name.clone(),
        profile: incoming.profile.clone(),
        partition: incoming.partition.clone(),
        source_id: incoming.source_id.clone(),
        self_ref_fk: incoming.self_ref_fk.clone(),
        dirty_bit: true,
        last_transfer_session_id: None,
    }
}

fn union_max(a: &Fsic, b: &Fsic) -> Fsic {
    let mut out = a.clone();
    for (iid, counter) in b {
        out.entry(*iid)
            .and_modify(|v| *v = (*v).max(*counter))
            .or_insert(*counter);
    }
    out
}

fn write_store_tx(tx: &WriteTransactionCtx, store_id: StoreId, record: StoreRecord) -> DbResult<()> {
    let mut store_tbl = tx.open_table(&store::TABLE)?;
    store_tbl.insert(&store_id, &record)?;
    Ok(())
}

fn write_rmc_tx(tx: &WriteTransactionCtx, store_id: StoreId, rmc: &Fsic) -> DbResult<()> {
    let mut rmc_tbl = tx.open_table(&record_max_counter::TABLE)?;
    for (iid, counter) in rmc {
        rmc_tbl.insert(&(store_id, *iid), counter)?;
    }
    Ok(())
}

fn drain_buffered_row_tx(
    tx: &WriteTransactionCtx,
    transfer_session_id: morango_core::TransferSessionId,
    store_id: StoreId,
) -> DbResult<()> {
    let mut buffer_tbl = tx.open_table(&buffer::TABLE)?;
    buffer_tbl.remove(&(transfer_session_id, store_id))?;
    drop(buffer_tbl);

    let to_remove: Vec<_> = {
        let rmcb_tbl = tx.open_table(&record_max_counter_buffer::TABLE)?;
        rmcb_tbl
            .range(
                &(transfer_session_id, store_id, morango_core::InstanceId::ZERO)
                    ..=&(transfer_session_id, store_id, morango_core::InstanceId::MAX),
            )?
            .map(|entry| entry.map(|e| e.0.value()))
            .collect::<Result<_, _>>()?
    };
    let mut rmcb_tbl = tx.open_table(&record_max_counter_buffer::TABLE)?;
    for key in to_remove {
        rmcb_tbl.remove(&key)?;
    }
    Ok(())
}

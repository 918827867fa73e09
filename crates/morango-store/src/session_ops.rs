//! Session bookkeeping: CRUD for [`SyncSessionRecord`]/[`TransferSessionRecord`].
//!
//! The state machine itself (stage transitions, resume, signals) lives one
//! layer up in `morango-sync`, which holds the `Database` and calls these
//! helpers plus [`crate::queue_ops`]/[`crate::dequeue_ops`] from each stage.

use morango_core::{Filter, Fsic, Profile, SyncSessionId, Timestamp, TransferSessionId};
use snafu::OptionExt as _;

use crate::tables::{SyncSessionRecord, TransferSessionRecord, TransferStage};
use crate::{
    sync_session, transfer_session, DbError, DbResult, MergeInvariantViolatedSnafu,
    WriteTransactionCtx,
};

pub fn create_sync_session_tx(
    tx: &WriteTransactionCtx,
    id: SyncSessionId,
    profile: Profile,
    peer_instance_id: Option<morango_core::InstanceId>,
    now: Timestamp,
) -> DbResult<()> {
    let mut tbl = tx.open_table(&sync_session::TABLE)?;
    tbl.insert(
        &id,
        &SyncSessionRecord {
            profile,
            peer_instance_id,
            started_at: now,
            last_activity_timestamp: now,
        },
    )?;
    Ok(())
}

pub fn touch_sync_session_tx(tx: &WriteTransactionCtx, id: SyncSessionId, now: Timestamp) -> DbResult<()> {
    let mut tbl = tx.open_table(&sync_session::TABLE)?;
    let mut rec = tbl
        .get(&id)?
        .map(|g| g.value())
        .context(MergeInvariantViolatedSnafu {
            reason: format!("sync session {id} not found"),
        })?;
    rec.last_activity_timestamp = now;
    tbl.insert(&id, &rec)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn create_transfer_session_tx(
    tx: &WriteTransactionCtx,
    id: TransferSessionId,
    sync_session_id: SyncSessionId,
    push: bool,
    filter: Filter,
    server_fsic: Fsic,
    client_fsic: Fsic,
    now: Timestamp,
) -> DbResult<()> {
    let mut tbl = tx.open_table(&transfer_session::TABLE)?;
    tbl.insert(
        &id,
        &TransferSessionRecord {
            sync_session_id,
            push,
            filter,
            records_total: 0,
            records_transferred: 0,
            active: true,
            stage: TransferStage::Initializing,
            server_fsic,
            client_fsic,
            last_activity_timestamp: now,
        },
    )?;
    Ok(())
}

pub fn get_transfer_session_tx(
    tx: &impl transfer_session::ReadableTable,
    id: TransferSessionId,
) -> DbResult<Option<TransferSessionRecord>> {
    Ok(tx.get(&id)?.map(|g| g.value()))
}

fn load_transfer_session_tx(
    tx: &WriteTransactionCtx,
    id: TransferSessionId,
) -> DbResult<TransferSessionRecord> {
    let tbl = tx.open_table(&transfer_session::TABLE)?;
    tbl.get(&id)?
        .map(|g| g.value())
        .context(MergeInvariantViolatedSnafu {
            reason: format!("transfer session {id} not found"),
        })
}

pub fn set_stage_tx(
    tx: &WriteTransactionCtx,
    id: TransferSessionId,
    stage: TransferStage,
    now: Timestamp,
) -> DbResult<()> {
    let mut rec = load_transfer_session_tx(tx, id)?;
    rec.stage = stage;
    rec.last_activity_timestamp = now;
    let mut tbl = tx.open_table(&transfer_session::TABLE)?;
    tbl.insert(&id, &rec)?;
    Ok(())
}

pub fn set_records_total_tx(tx: &WriteTransactionCtx, id: TransferSessionId, records_total: u64) -> DbResult<()> {
    let mut rec = load_transfer_session_tx(tx, id)?;
    rec.records_total = records_total;
    let mut tbl = tx.open_table(&transfer_session::TABLE)?;
    tbl.insert(&id, &rec)?;
    Ok(())
}

pub fn advance_records_transferred_tx(
    tx: &WriteTransactionCtx,
    id: TransferSessionId,
    by: u64,
    now: Timestamp,
) -> DbResult<()> {
    let mut rec = load_transfer_session_tx(tx, id)?;
    rec.records_transferred = rec
        .records_transferred
        .checked_add(by)
        .ok_or(DbError::Overflow)?;
    rec.last_activity_timestamp = now;
    let mut tbl = tx.open_table(&transfer_session::TABLE)?;
    tbl.insert(&id, &rec)?;
    Ok(())
}

/// Finalize a session, marking it terminal. `stage` must be
/// [`TransferStage::Completed`] or [`TransferStage::Aborted`].
pub fn finalize_transfer_session_tx(
    tx: &WriteTransactionCtx,
    id: TransferSessionId,
    stage: TransferStage,
    now: Timestamp,
) -> DbResult<()> {
    debug_assert!(matches!(stage, TransferStage::Completed | TransferStage::Aborted));
    let mut rec = load_transfer_session_tx(tx, id)?;
    rec.stage = stage;
    rec.active = false;
    rec.last_activity_timestamp = now;
    let mut tbl = tx.open_table(&transfer_session::TABLE)?;
    tbl.insert(&id, &rec)?;
    Ok(())
}

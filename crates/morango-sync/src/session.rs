//! C8: TransferSession state machine.
//!
//! `morango-store` already persists `TransferSessionRecord.stage`; this
//! module is the driver loop that walks a session through
//! initializing → queuing → transferring → dequeuing → cleanup → completed,
//! resuming at whatever stage a previous crash left it in.
//!
//! A `TransferSession` is always one-directional once past `initializing`:
//! [`run_push`] queues local rows and streams them out; [`run_pull`] streams
//! incoming rows in and dequeues them. Which one an embedder calls is a
//! deployment choice outside this crate (typically: the node that opened the
//! connection pushes first, then pulls).

use morango_core::{Filter, Profile, SyncSessionId, Timestamp, TransferSessionId};
use morango_store::tables::TransferStage;
use morango_store::{database_max_counter, dequeue_ops, fsic_ops, queue_ops, session_ops, Database};
use snafu::ResultExt as _;

use crate::transport::{rmc_map_to_wire, wire_fsic_to_fsic, Transport, WireBufferRow, WireFsic};
use crate::{deserializer, serializer, MorangoConfig, SchemaRegistry, StoreSnafu, SyncResult};

/// Open a fresh `TransferSession` under a caller-supplied id, recording it at
/// [`TransferStage::Initializing`].
///
/// A `TransferSession` is always a *pair* of these calls, one per peer, and
/// both sides must agree on `id` for [`Transport::send_fsic`]/`recv_fsic` and
/// `send_chunk`/`recv_chunk` to correlate - `id` is not itself authenticated
/// or negotiated here, it travels alongside whatever out-of-band handshake
/// establishes the `SyncSession` in the first place (the initiating peer
/// mints it with `TransferSessionId::random()` and the responding peer
/// receives that same value before calling this function).
///
/// The caller still has to drive the session to completion with [`run_push`]
/// or [`run_pull`]; a crashed-and-resumed session re-enters the same call
/// with the same `id` and picks up where `stage` says it left off.
pub async fn open_transfer_session(
    db: &Database,
    id: TransferSessionId,
    sync_session_id: SyncSessionId,
    push: bool,
    filter: Filter,
) -> SyncResult<()> {
    let now = Timestamp::now();
    db.write_with(move |tx| {
        session_ops::create_transfer_session_tx(
            tx,
            id,
            sync_session_id,
            push,
            filter,
            morango_core::Fsic::new(),
            morango_core::Fsic::new(),
            now,
        )
    })
    .await
    .context(StoreSnafu)
}

/// Retry `f` while it keeps failing with a transient [`crate::SyncError::TransportError`],
/// up to `config.transport_max_retries` times, sleeping `config.transport_retry_backoff`
/// between attempts. Any other error (or a non-transient transport error) is
/// returned immediately.
///
/// This is what backs the chunk- and FSIC-exchange-level retry promised by
/// `SyncError::TransportError`'s documentation: a `Transport` impl is allowed
/// to report "nothing has arrived yet" as a transient error instead of
/// blocking, and the state machine is the layer that turns that into a
/// bounded poll loop.
pub(crate) async fn with_transport_retry<T, F, Fut>(config: &MorangoConfig, mut f: F) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = SyncResult<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(crate::SyncError::TransportError { transient: true, .. }) if attempt < config.transport_max_retries => {
                attempt += 1;
                tokio::time::sleep(config.transport_retry_backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn exchange_fsic_tx(
    db: &Database,
    transport: &dyn Transport,
    config: &MorangoConfig,
    id: TransferSessionId,
    filter: &Filter,
) -> SyncResult<()> {
    let local_fsic = db
        .read_with(|tx| {
            let tbl = tx.open_table(&database_max_counter::TABLE)?;
            fsic_ops::read_dmc_for_filter_tx(&tbl, filter)
        })
        .await
        .context(StoreSnafu)?;

    with_transport_retry(config, || transport.send_fsic(id, WireFsic::from(&local_fsic))).await?;
    let remote_wire = with_transport_retry(config, || transport.recv_fsic(id)).await?;
    let remote_fsic = wire_fsic_to_fsic(&remote_wire)?;

    let now = Timestamp::now();
    db.write_with(move |tx| {
        let mut rec = session_ops::get_transfer_session_tx(
            &tx.open_table(&morango_store::transfer_session::TABLE)?,
            id,
        )?
        .expect("session just created by open_transfer_session");
        if rec.push {
            rec.client_fsic = local_fsic;
            rec.server_fsic = remote_fsic;
        } else {
            rec.server_fsic = remote_fsic;
            rec.client_fsic = local_fsic;
        }
        let mut tbl = tx.open_table(&morango_store::transfer_session::TABLE)?;
        tbl.insert(&id, &rec)?;
        session_ops::set_stage_tx(tx, id, TransferStage::Queuing, now)
    })
    .await
    .context(StoreSnafu)?;
    Ok(())
}

/// Drive the sending half of a session: queue everything owed under the
/// exchanged FSIC delta, then stream it out in `config.chunk_size` batches.
pub async fn run_push(
    db: &Database,
    registry: &dyn SchemaRegistry,
    transport: &dyn Transport,
    config: &MorangoConfig,
    id: TransferSessionId,
    profile: &Profile,
) -> SyncResult<()> {
    let rec = current_record(db, id).await?;

    if rec.stage == TransferStage::Initializing {
        serializer::serialize_into_store(db, registry, profile, Some(&rec.filter)).await?;
        exchange_fsic_tx(db, transport, config, id, &rec.filter).await?;
    }

    let rec = current_record(db, id).await?;
    if rec.stage == TransferStage::Queuing {
        let delta = fsic_ops::delta(rec.sender_fsic(), rec.receiver_fsic());
        let profile = profile.clone();
        let total = db
            .write_with(move |tx| queue_ops::queue_tx(tx, id, &profile, &rec.filter, &delta, None))
            .await
            .context(StoreSnafu)?;
        let now = Timestamp::now();
        db.write_with(move |tx| {
            session_ops::set_records_total_tx(tx, id, total)?;
            session_ops::set_stage_tx(tx, id, TransferStage::Transferring, now)
        })
        .await
        .context(StoreSnafu)?;
    }

    let rec = current_record(db, id).await?;
    if rec.stage == TransferStage::Transferring {
        send_all_chunks(db, transport, config, id).await?;
        let now = Timestamp::now();
        db.write_with(move |tx| session_ops::set_stage_tx(tx, id, TransferStage::Cleanup, now))
            .await
            .context(StoreSnafu)?;
    }

    let rec = current_record(db, id).await?;
    if rec.stage == TransferStage::Cleanup {
        drain_own_buffer(db, id).await?;
        let now = Timestamp::now();
        db.write_with(move |tx| session_ops::finalize_transfer_session_tx(tx, id, TransferStage::Completed, now))
            .await
            .context(StoreSnafu)?;
    }

    Ok(())
}

/// Drive the receiving half of a session: pull chunks until the sender
/// signals EOF, dequeue them into `Store`, then optionally deserialize.
pub async fn run_pull(
    db: &Database,
    registry: &dyn SchemaRegistry,
    transport: &dyn Transport,
    config: &MorangoConfig,
    id: TransferSessionId,
    profile: &Profile,
) -> SyncResult<()> {
    let rec = current_record(db, id).await?;

    if rec.stage == TransferStage::Initializing {
        exchange_fsic_tx(db, transport, config, id, &rec.filter).await?;
        let now = Timestamp::now();
        db.write_with(move |tx| session_ops::set_stage_tx(tx, id, TransferStage::Transferring, now))
            .await
            .context(StoreSnafu)?;
    }

    let rec = current_record(db, id).await?;
    if rec.stage == TransferStage::Transferring {
        recv_all_chunks(db, transport, config, id).await?;
        let now = Timestamp::now();
        db.write_with(move |tx| session_ops::set_stage_tx(tx, id, TransferStage::Dequeuing, now))
            .await
            .context(StoreSnafu)?;
    }

    let rec = current_record(db, id).await?;
    if rec.stage == TransferStage::Dequeuing {
        let stats = db
            .write_with(move |tx| dequeue_ops::dequeue_tx(tx, id))
            .await
            .context(StoreSnafu)?;
        tracing::info!(
            target: crate::LOG_TARGET,
            transfer_session_id = %id,
            fast_forwarded = stats.fast_forwarded,
            reverse_fast_forwarded = stats.reverse_fast_forwarded,
            merge_conflicts = stats.merge_conflicts,
            "dequeue complete"
        );
        let now = Timestamp::now();
        db.write_with(move |tx| session_ops::set_stage_tx(tx, id, TransferStage::Cleanup, now))
            .await
            .context(StoreSnafu)?;
    }

    let rec = current_record(db, id).await?;
    if rec.stage == TransferStage::Cleanup {
        if config.deserialize_after_dequeue {
            deserializer::deserialize_from_store(db, registry, profile).await?;
        }
        let now = Timestamp::now();
        db.write_with(move |tx| session_ops::finalize_transfer_session_tx(tx, id, TransferStage::Completed, now))
            .await
            .context(StoreSnafu)?;
    }

    Ok(())
}

async fn current_record(
    db: &Database,
    id: TransferSessionId,
) -> SyncResult<morango_store::tables::TransferSessionRecord> {
    db.read_with(move |tx| {
        session_ops::get_transfer_session_tx(&tx.open_table(&morango_store::transfer_session::TABLE)?, id)
    })
    .await
    .context(StoreSnafu)?
    .ok_or_else(|| {
        morango_store::MergeInvariantViolatedSnafu {
            reason: format!("transfer session {id} not found"),
        }
        .build()
    })
    .context(StoreSnafu)
}

async fn send_all_chunks(
    db: &Database,
    transport: &dyn Transport,
    config: &MorangoConfig,
    id: TransferSessionId,
) -> SyncResult<()> {
    let store_ids: Vec<morango_core::StoreId> = db
        .read_with(move |tx| {
            let tbl = tx.open_table(&morango_store::buffer::TABLE)?;
            tbl.range(
                &(id, morango_core::StoreId::ZERO)..=&(id, morango_core::StoreId::MAX),
            )?
            .map(|e| e.map(|e| e.0.value().1))
            .collect::<Result<_, _>>()
        })
        .await
        .context(StoreSnafu)?;

    for batch in store_ids.chunks(config.chunk_size.max(1)) {
        let rows: Vec<WireBufferRow> = db
            .read_with(move |tx| {
                let buffer_tbl = tx.open_table(&morango_store::buffer::TABLE)?;
                let rmcb_tbl = tx.open_table(&morango_store::record_max_counter_buffer::TABLE)?;
                let mut rows = Vec::with_capacity(batch.len());
                for store_id in batch {
                    let row = buffer_tbl
                        .get(&(id, *store_id))?
                        .expect("store_id came from a scan of this very buffer")
                        .value();
                    let rmcb: Vec<(morango_core::InstanceId, i64)> = rmcb_tbl
                        .range(
                            &(id, *store_id, morango_core::InstanceId::ZERO)
                                ..=&(id, *store_id, morango_core::InstanceId::MAX),
                        )?
                        .map(|e| e.map(|e| (e.0.value().2, e.1.value())))
                        .collect::<Result<_, _>>()?;
                    rows.push(WireBufferRow {
                        model_uuid: *store_id,
                        serialized: row.serialized,
                        deleted: row.deleted,
                        last_saved_instance: row.last_saved_instance,
                        last_saved_counter: row.last_saved_counter,
                        hard_delete: row.hard_delete,
                        model_name: row.model_name,
                        profile: row.profile,
                        partition: row.partition,
                        source_id: row.source_id,
                        conflicting_serialized_data: row.conflicting_serialized_data,
                        self_ref_fk: row.self_ref_fk,
                        rmcb: rmc_map_to_wire(&rmcb),
                    });
                }
                Ok(rows)
            })
            .await
            .context(StoreSnafu)?;

        let transferred = rows.len() as u64;
        with_transport_retry(config, || transport.send_chunk(id, rows.clone(), false)).await?;

        let now = Timestamp::now();
        db.write_with(move |tx| session_ops::advance_records_transferred_tx(tx, id, transferred, now))
            .await
            .context(StoreSnafu)?;
    }

    with_transport_retry(config, || transport.send_chunk(id, vec![], true)).await?;
    Ok(())
}

async fn recv_all_chunks(
    db: &Database,
    transport: &dyn Transport,
    config: &MorangoConfig,
    id: TransferSessionId,
) -> SyncResult<()> {
    loop {
        let chunk = with_transport_retry(config, || transport.recv_chunk(id)).await?;
        let received = chunk.rows.len() as u64;

        db.write_with(move |tx| {
            let mut buffer_tbl = tx.open_table(&morango_store::buffer::TABLE)?;
            let mut rmcb_tbl = tx.open_table(&morango_store::record_max_counter_buffer::TABLE)?;
            for row in &chunk.rows {
                buffer_tbl.insert(
                    &(id, row.model_uuid),
                    &morango_store::tables::BufferRecord {
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
                for entry in &row.rmcb {
                    rmcb_tbl.insert(&(id, row.model_uuid, entry.instance_id), &entry.counter)?;
                }
            }
            Ok(())
        })
        .await
        .context(StoreSnafu)?;

        let now = Timestamp::now();
        db.write_with(move |tx| session_ops::advance_records_transferred_tx(tx, id, received, now))
            .await
            .context(StoreSnafu)?;

        if chunk.eof {
            return Ok(());
        }
    }
}

/// The sender's own outbound `Buffer` rows are left in place once
/// transferred (see the `morango-store` queue test note) - they are
/// evidence of what was last sent under this session, useful for a future
/// anti-echo resume. This stage is where we finally drop them.
async fn drain_own_buffer(db: &Database, id: TransferSessionId) -> SyncResult<()> {
    db.write_with(move |tx| {
        let store_ids: Vec<morango_core::StoreId> = {
            let tbl = tx.open_table(&morango_store::buffer::TABLE)?;
            tbl.range(
                &(id, morango_core::StoreId::ZERO)..=&(id, morango_core::StoreId::MAX),
            )?
            .map(|e| e.map(|e| e.0.value().1))
            .collect::<Result<_, _>>()?
        };

        let mut buffer_tbl = tx.open_table(&morango_store::buffer::TABLE)?;
        for store_id in &store_ids {
            buffer_tbl.remove(&(id, *store_id))?;
        }
        drop(buffer_tbl);

        let to_remove: Vec<_> = {
            let rmcb_tbl = tx.open_table(&morango_store::record_max_counter_buffer::TABLE)?;
            store_ids
                .iter()
                .map(|store_id| {
                    rmcb_tbl
                        .range(
                            &(id, *store_id, morango_core::InstanceId::ZERO)
                                ..=&(id, *store_id, morango_core::InstanceId::MAX),
                        )?
                        .map(|e| e.map(|e| e.0.value()))
                        .collect::<Result<Vec<_>, _>>()
                })
                .collect::<Result<Vec<Vec<_>>, _>>()?
                .into_iter()
                .flatten()
                .collect()
        };
        let mut rmcb_tbl = tx.open_table(&morango_store::record_max_counter_buffer::TABLE)?;
        for key in to_remove {
            rmcb_tbl.remove(&key)?;
        }
        Ok(())
    })
    .await
    .context(StoreSnafu)
}

#[cfg(test)]
mod tests {
    use morango_core::{Partition, StoreId};

    use super::*;
    use crate::schema::{DirtyRow, ModelSchema};
    use crate::transport::LocalTransport;

    struct NoopModel;
    impl ModelSchema for NoopModel {
        fn model_name(&self) -> &str {
            "widget"
        }
        fn dependencies(&self) -> &[String] {
            &[]
        }
        fn has_self_ref_fk(&self) -> bool {
            false
        }
        fn dirty_rows(&self, _filter: &Filter) -> Vec<DirtyRow> {
            Vec::new()
        }
        fn clear_dirty_bits(&self, _store_ids: &[StoreId]) {}
        fn deserialize_row(&self, _store_id: StoreId, _serialized: &str) -> SyncResult<()> {
            Ok(())
        }
    }

    struct EmptyRegistry;
    impl SchemaRegistry for EmptyRegistry {
        fn models(&self, _profile: &Profile) -> Vec<&dyn ModelSchema> {
            vec![]
        }
    }

    async fn seed_row(db: &Database, profile: &Profile) -> StoreId {
        let store_id = StoreId::random();
        let morango_core::InstanceAndCounter { instance_id, counter } =
            db.current_instance_and_increment().await.unwrap();
        db.write_with(move |tx| {
            let mut tbl = tx.open_table(&morango_store::store::TABLE)?;
            tbl.insert(
                &store_id,
                &morango_store::tables::StoreRecord {
                    serialized: "{\"v\":1}".into(),
                    conflicting_serialized_data: String::new(),
                    last_saved_instance: instance_id,
                    last_saved_counter: counter,
                    deleted: false,
                    hard_delete: false,
                    model_name: "widget".into(),
                    profile: profile.clone(),
                    partition: Partition::new(""),
                    source_id: "src".into(),
                    self_ref_fk: String::new(),
                    dirty_bit: false,
                    last_transfer_session_id: None,
                },
            )?;
            let mut rmc_tbl = tx.open_table(&morango_store::record_max_counter::TABLE)?;
            rmc_tbl.insert(&(store_id, instance_id), &counter)?;
            Ok(())
        })
        .await
        .unwrap();
        store_id
    }

    #[test_log::test(tokio::test)]
    async fn push_then_pull_converges_one_record() -> Result<(), Box<dyn std::error::Error>> {
        let sender = Database::new_in_memory().await?;
        sender.ensure_identity(Some("sender")).await?;
        let receiver = Database::new_in_memory().await?;
        receiver.ensure_identity(Some("receiver")).await?;

        let profile = Profile::new("facility");
        let store_id = seed_row(&sender, &profile).await;

        let (sender_transport, receiver_transport) = LocalTransport::pair();
        let sync_session_id = SyncSessionId::random();
        let config = MorangoConfig::default();
        let registry = EmptyRegistry;

        let id = TransferSessionId::random();
        open_transfer_session(&sender, id, sync_session_id, true, Filter::everything()).await?;
        open_transfer_session(&receiver, id, sync_session_id, false, Filter::everything()).await?;

        // Both sides poll the same `LocalTransport` pair under the same id, so
        // they must run concurrently: whichever side reaches a rendezvous
        // point first retries (transiently) until the other side catches up.
        let (push_result, pull_result) = tokio::join!(
            run_push(&sender, &registry, &sender_transport, &config, id, &profile),
            run_pull(&receiver, &registry, &receiver_transport, &config, id, &profile),
        );
        push_result?;
        pull_result?;

        let received = receiver
            .read_with(move |tx| {
                let tbl = tx.open_table(&morango_store::store::TABLE)?;
                Ok(tbl.get(&store_id)?.map(|g| g.value()))
            })
            .await?
            .expect("merged");
        assert_eq!(received.serialized, "{\"v\":1}");

        let sender_rec = current_record(&sender, id).await?;
        assert_eq!(sender_rec.stage, TransferStage::Completed);
        let receiver_rec = current_record(&receiver, id).await?;
        assert_eq!(receiver_rec.stage, TransferStage::Completed);

        Ok(())
    }
}

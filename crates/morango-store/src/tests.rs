//! End-to-end coverage across instance registry, FSIC, queue and dequeue -
//! the scenarios the module-level unit tests don't already cover in
//! isolation.

use morango_core::{Filter, Fsic, InstanceAndCounter, InstanceId, Partition, Profile, TransferSessionId};
use tempfile::tempdir;

use crate::dequeue_ops::dequeue_tx;
use crate::queue_ops::queue_tx;
use crate::tables::StoreRecord;
use crate::{buffer, record_max_counter, record_max_counter_buffer, store, Database};

async fn store_row(db: &Database, profile: &Profile, partition: &str) -> morango_core::StoreId {
    let store_id = morango_core::StoreId::random();
    let InstanceAndCounter { instance_id, counter } = db.current_instance_and_increment().await.unwrap();
    db.write_with(|tx| {
        let mut store_tbl = tx.open_table(&store::TABLE)?;
        store_tbl.insert(
            &store_id,
            &StoreRecord {
                serialized: "{\"v\":1}".into(),
                conflicting_serialized_data: String::new(),
                last_saved_instance: instance_id,
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
            },
        )?;
        let mut rmc_tbl = tx.open_table(&record_max_counter::TABLE)?;
        rmc_tbl.insert(&(store_id, instance_id), &counter)?;
        Ok(())
    })
    .await
    .unwrap();
    store_id
}

#[test_log::test(tokio::test)]
async fn open_on_disk_survives_reopen() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let path = Database::mk_db_path(dir.path(), "profile-a").await?;

    let instance_id = {
        let db = Database::open(path.clone()).await?;
        db.ensure_identity(Some("fixed-machine")).await?
    };

    let db = Database::open(path).await?;
    let reopened = db.ensure_identity(Some("fixed-machine")).await?;
    assert_eq!(instance_id, reopened);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn queue_then_dequeue_converges_a_single_record() -> Result<(), Box<dyn std::error::Error>> {
    let sender = Database::new_in_memory().await?;
    sender.ensure_identity(Some("sender")).await?;
    let receiver = Database::new_in_memory().await?;
    receiver.ensure_identity(Some("receiver")).await?;

    let profile = Profile::new("facility");
    let store_id = store_row(&sender, &profile, "facility/1").await;

    let sender_dmc = sender
        .read_with(|tx| {
            let tbl = tx.open_table(&record_max_counter::TABLE)?;
            let mut fsic = Fsic::new();
            for entry in tbl.range(..)? {
                let entry = entry?;
                let (sid, iid) = entry.0.value();
                if sid == store_id {
                    fsic.insert(iid, entry.1.value());
                }
            }
            Ok(fsic)
        })
        .await?;

    let delta = crate::fsic_ops::delta(&sender_dmc, &Fsic::new());
    assert!(!delta.is_empty());

    let t = TransferSessionId::random();
    let staged = sender
        .write_with(|tx| queue_tx(tx, t, &profile, &Filter::everything(), &delta, None))
        .await?;
    assert_eq!(staged, 1);

    // Simulate chunk transport: copy Buffer/RMCB rows verbatim to the
    // receiver under the same transfer_session_id.
    let buffer_row = sender
        .read_with(|tx| {
            let tbl = tx.open_table(&buffer::TABLE)?;
            Ok(tbl.get(&(t, store_id))?.expect("staged").value())
        })
        .await?;
    let rmcb_rows: Vec<_> = sender
        .read_with(|tx| {
            let tbl = tx.open_table(&record_max_counter_buffer::TABLE)?;
            tbl.range(
                &(t, store_id, InstanceId::ZERO)..=&(t, store_id, InstanceId::MAX),
            )?
            .map(|e| e.map(|e| (e.0.value(), e.1.value())))
            .collect::<Result<Vec<_>, _>>()
        })
        .await?;

    receiver
        .write_with(|tx| {
            let mut buffer_tbl = tx.open_table(&buffer::TABLE)?;
            buffer_tbl.insert(&(t, store_id), &buffer_row)?;
            let mut rmcb_tbl = tx.open_table(&record_max_counter_buffer::TABLE)?;
            for (key, counter) in &rmcb_rows {
                rmcb_tbl.insert(key, counter)?;
            }
            Ok(())
        })
        .await?;

    receiver.write_with(|tx| dequeue_tx(tx, t)).await?;

    let received = receiver
        .read_with(|tx| {
            let tbl = tx.open_table(&store::TABLE)?;
            Ok(tbl.get(&store_id)?.expect("merged").value())
        })
        .await?;
    assert_eq!(received.serialized, "{\"v\":1}");

    // P3: no residue on either side.
    let sender_residue = sender
        .read_with(|tx| {
            let tbl = tx.open_table(&buffer::TABLE)?;
            Ok(tbl.range(..)?.count())
        })
        .await?;
    assert_eq!(sender_residue, 1, "sender keeps its own Buffer until it drains it explicitly");

    let receiver_residue = receiver
        .read_with(|tx| {
            let tbl = tx.open_table(&buffer::TABLE)?;
            Ok(tbl.range(..)?.count())
        })
        .await?;
    assert_eq!(receiver_residue, 0);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn queue_is_idempotent_given_same_inputs() -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::new_in_memory().await?;
    db.ensure_identity(Some("node")).await?;
    let profile = Profile::new("facility");
    store_row(&db, &profile, "facility/1").await;

    let local_instance = db.self_instance_id().await?;
    let delta = Fsic::from([(local_instance, 0)]);

    let t1 = TransferSessionId::random();
    let first = db
        .write_with(|tx| queue_tx(tx, t1, &profile, &Filter::everything(), &delta, None))
        .await?;

    let t2 = TransferSessionId::random();
    let second = db
        .write_with(|tx| queue_tx(tx, t2, &profile, &Filter::everything(), &delta, None))
        .await?;

    assert_eq!(first, second);
    assert_eq!(first, 1);
    Ok(())
}

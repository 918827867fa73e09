//! C9: FSIC Calculator.
//!
//! `delta(local, remote) = { iid -> remote[iid] | local[iid] > remote.get(iid, 0) }`
//!
//! An empty delta means "nothing to send". The *sender's* FSIC is read from
//! local `DatabaseMaxCounter` restricted to the session filter; the
//! *receiver's* FSIC arrives over the wire at session init (see
//! `morango-sync`'s transport module) and is just data by the time it gets
//! here.

use morango_core::{Counter, Filter, Fsic, InstanceId};

use crate::{database_max_counter, DbResult, WriteTransactionCtx};

/// `delta(local, remote)`: everything `local` has written past what `remote`
/// is known to have. Pure - no I/O, no transaction.
pub fn delta(local: &Fsic, remote: &Fsic) -> Fsic {
    local
        .iter()
        .filter_map(|(iid, counter)| {
            let remote_counter = remote.get(iid).copied().unwrap_or(0);
            (remote_counter < *counter).then_some((*iid, remote_counter))
        })
        .collect()
}

/// Monotonically raise `DatabaseMaxCounter(instance_id, partition)` to
/// `counter` (never lowers it - invariant **D1**).
pub fn upsert_dmc_tx(
    tx: &WriteTransactionCtx,
    instance_id: InstanceId,
    partition: morango_core::Partition,
    counter: Counter,
) -> DbResult<()> {
    let mut tbl = tx.open_table(&database_max_counter::TABLE)?;
    let key = (instance_id, partition);
    let existing = tbl.get(&key)?.map(|g| g.value()).unwrap_or(0);
    if existing < counter {
        tbl.insert(&key, &counter)?;
    }
    Ok(())
}

/// Read this node's FSIC restricted to `filter`: for each instance, the
/// lowest counter recorded across every partition prefix in the filter (or,
/// for an unfiltered sync, the `""` global marker written by the
/// serializer). Conservative by construction - an instance with no recorded
/// counter for one of the requested prefixes contributes nothing for that
/// prefix, never an overstated one.
pub fn read_dmc_for_filter_tx(
    tx: &impl database_max_counter::ReadableTable,
    filter: &Filter,
) -> DbResult<Fsic> {
    let mut acc: Fsic = Fsic::new();
    let wants_global = filter.is_everything();

    for entry in tx.range(..)? {
        let entry = entry?;
        let (instance_id, partition) = entry.0.value();
        let counter = entry.1.value();

        let included = if wants_global {
            partition.as_str().is_empty()
        } else {
            filter.prefixes().iter().any(|p| *p == partition)
        };

        if included {
            acc.entry(instance_id)
                .and_modify(|c| *c = (*c).min(counter))
                .or_insert(counter);
        }
    }

    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_is_empty_when_remote_dominates() {
        let local = Fsic::from([(InstanceId::from_bytes([1; 16]), 5)]);
        let remote = Fsic::from([(InstanceId::from_bytes([1; 16]), 5)]);
        assert!(delta(&local, &remote).is_empty());
    }

    #[test]
    fn delta_picks_up_missing_remote_counter_as_zero() {
        let a = InstanceId::from_bytes([1; 16]);
        let local = Fsic::from([(a, 3)]);
        let remote = Fsic::new();
        assert_eq!(delta(&local, &remote), Fsic::from([(a, 0)]));
    }

    #[test]
    fn delta_uses_remote_counter_as_threshold() {
        let a = InstanceId::from_bytes([1; 16]);
        let local = Fsic::from([(a, 10)]);
        let remote = Fsic::from([(a, 4)]);
        assert_eq!(delta(&local, &remote), Fsic::from([(a, 4)]));
    }
}

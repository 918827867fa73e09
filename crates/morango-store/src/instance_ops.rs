//! C1: Instance & Counter Registry.
//!
//! Issues monotonic `(instance_id, counter)` pairs and persists this node's
//! identity. The increment and whatever Store/RMC writes cite the returned
//! counter must happen in the *same* redb write transaction - otherwise a
//! crash between the two could leave a record_max_counter entry referencing a
//! counter value nothing else ever recorded. [`Database::current_instance_and_increment_tx`]
//! exists precisely so callers compose it into their own transaction instead
//! of each stage opening its own.

use morango_core::{Counter, InstanceAndCounter, InstanceId};
use snafu::ResultExt as _;

use crate::tables::{DatabaseIdRecord, InstanceIdRecord};
use crate::{
    database_id, instance_id, Database, DbResult, IdentityUnavailableSnafu, WriteTransactionCtx,
};

/// Where this node's machine id comes from.
///
/// Out of scope per the spec (§1): we consume whatever the embedder passes
/// in, or fall back to the hostname. Tests and migrations can pin an exact
/// value via `system_id_override`.
pub fn default_machine_id() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

fn derive_instance_id(database_id: [u8; 16], machine_id: &str, system_id_override: Option<&str>) -> InstanceId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&database_id);
    hasher.update(machine_id.as_bytes());
    if let Some(ov) = system_id_override {
        hasher.update(b"|override|");
        hasher.update(ov.as_bytes());
    }
    let hash = hasher.finalize();
    InstanceId::from_bytes(hash.as_bytes()[..16].try_into().expect("16 bytes"))
}

impl Database {
    /// Ensure persisted identity exists, deriving it on first run.
    ///
    /// Idempotent: a second call on an already-initialized database is a
    /// no-op (it just re-validates, it never re-derives).
    pub async fn ensure_identity(&self, system_id_override: Option<&str>) -> DbResult<InstanceId> {
        if let Some(cached) = *self.self_instance_id.lock().expect("locking failed") {
            return Ok(cached);
        }

        let machine_id = default_machine_id();
        let instance_id = self
            .write_with(move |tx| Self::ensure_identity_tx(tx, &machine_id, system_id_override.as_deref()))
            .await?;

        *self.self_instance_id.lock().expect("locking failed") = Some(instance_id);
        Ok(instance_id)
    }

    fn ensure_identity_tx(
        tx: &WriteTransactionCtx,
        machine_id: &str,
        system_id_override: Option<&str>,
    ) -> DbResult<InstanceId> {
        let mut database_id_tbl = tx.open_table(&database_id::TABLE)?;
        let database_id = match database_id_tbl.first()?.map(|g| g.1.value()) {
            Some(rec) => rec.database_id,
            None => {
                let id = morango_core::InstanceId::random();
                let bytes = *id.as_bytes();
                database_id_tbl.insert(&(), &DatabaseIdRecord { database_id: bytes })?;
                bytes
            }
        };
        drop(database_id_tbl);

        let mut instance_tbl = tx.open_table(&instance_id::TABLE)?;
        if let Some(rec) = instance_tbl.first()?.map(|g| g.1.value()) {
            return Ok(rec.instance_id);
        }

        let instance_id = derive_instance_id(database_id, machine_id, system_id_override);
        instance_tbl.insert(
            &(),
            &InstanceIdRecord {
                instance_id,
                counter: 0,
            },
        )?;
        Ok(instance_id)
    }

    /// Invalidate the process-local identity cache (tests only, per spec
    /// §4.1: "invalidation occurs only on explicit `clear_cache`").
    pub fn clear_cache(&self) {
        *self.self_instance_id.lock().expect("locking failed") = None;
    }

    /// C1: atomically mint a fresh `(instance_id, counter)` pair, to be used
    /// for whatever Store/RMC writes this same transaction performs.
    ///
    /// Must be called after [`Database::ensure_identity`] has run at least
    /// once (normally guaranteed by the caller holding a `Database` that
    /// completed `open`/`new_in_memory` and an explicit identity setup step).
    pub fn current_instance_and_increment_tx(
        tx: &WriteTransactionCtx,
    ) -> DbResult<InstanceAndCounter> {
        let mut instance_tbl = tx.open_table(&instance_id::TABLE)?;
        let Some(rec) = instance_tbl.first()?.map(|g| g.1.value()) else {
            return IdentityUnavailableSnafu {
                reason: "instance identity not initialized; call ensure_identity first".to_string(),
            }
            .fail();
        };

        let next_counter: Counter = rec
            .counter
            .checked_add(1)
            .ok_or(crate::DbError::Overflow)?;

        instance_tbl.insert(
            &(),
            &InstanceIdRecord {
                instance_id: rec.instance_id,
                counter: next_counter,
            },
        )?;

        Ok(InstanceAndCounter {
            instance_id: rec.instance_id,
            counter: next_counter,
        })
    }

    pub async fn current_instance_and_increment(&self) -> DbResult<InstanceAndCounter> {
        self.write_with(|tx| Self::current_instance_and_increment_tx(tx))
            .await
    }

    pub async fn self_instance_id(&self) -> DbResult<InstanceId> {
        if let Some(cached) = *self.self_instance_id.lock().expect("locking failed") {
            return Ok(cached);
        }
        self.ensure_identity(None).await
    }
}

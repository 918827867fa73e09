//! Database table definitions.
//!
//! # Data model overview
//!
//! [`store`] is the canonical, transport-ready snapshot of every syncable
//! application row. [`record_max_counter`] is its per-record vector clock:
//! `(store_id, instance_id) -> counter` means "this node knows of writes to
//! `store_id` by `instance_id` up to `counter`".
//!
//! [`buffer`] and [`record_max_counter_buffer`] are wire-staging mirrors of
//! the two tables above, scoped by `transfer_session_id` - rows land there
//! from the peer, get merged into `store`/`record_max_counter` by dequeue,
//! and are deleted once merged (see [`crate::dequeue_ops`]).
//!
//! [`database_max_counter`] summarizes, per `(instance_id, partition)`, the
//! highest counter this node has ever integrated - it drives the FSIC
//! exchanged at the start of a sync (see [`crate::fsic_ops`]).

use bincode::{Decode, Encode};
use morango_core::{Counter, Filter, InstanceId, Partition, Profile, StoreId, SyncSessionId, TransferSessionId};

#[macro_export]
macro_rules! def_table {
    ($(#[$outer:meta])*
        $name:ident : $k:ty => $v:ty) => {
        #[allow(unused)]
        $(#[$outer])*
        pub mod $name {
            use super::*;
            pub type Key = $k;
            pub type Value = $v;
            pub type Definition<'a> = redb_bincode::TableDefinition<'a, Key, Value>;
            pub trait ReadableTable: redb_bincode::ReadableTable<Key, Value> {}
            impl<RT> ReadableTable for RT where RT: redb_bincode::ReadableTable<Key, Value> {}
            pub type Table<'a> = redb_bincode::Table<'a, Key, Value>;
            pub const TABLE: Definition = redb_bincode::TableDefinition::new(stringify!($name));
        }
    };
}

// ============================================================================
// SYSTEM TABLES
// ============================================================================

def_table! {
    /// Tracks database/schema version for migrations.
    db_version: () => u64
}

def_table! {
    /// The system-wide database id this instance id was derived from.
    ///
    /// Generated once, on first open, and never changed afterwards.
    database_id: () => DatabaseIdRecord
}

def_table! {
    /// This node's own instance identity and write counter.
    ///
    /// Updated every time [`crate::instance_ops`] mints a fresh
    /// `(instance_id, counter)` pair.
    instance_id: () => InstanceIdRecord
}

#[derive(Debug, Encode, Decode, Clone, Copy, serde::Serialize)]
pub struct DatabaseIdRecord {
    pub database_id: [u8; 16],
}

#[derive(Debug, Encode, Decode, Clone, Copy, serde::Serialize)]
pub struct InstanceIdRecord {
    pub instance_id: InstanceId,
    pub counter: Counter,
}

// ============================================================================
// STORE / RMC
// ============================================================================

def_table! {
    /// Canonical per-record snapshot - see module docs.
    store: StoreId => StoreRecord
}

def_table! {
    /// Per-record vector clock: `(store_id, instance_id) -> counter`.
    record_max_counter: (StoreId, InstanceId) => Counter
}

/// A syncable application record, promoted from the app schema by the
/// serializer and merged by dequeue.
///
/// Invariant **S1**: for every row there is at least one `record_max_counter`
/// entry with `(store_id, last_saved_instance)` whose counter is `>=
/// last_saved_counter`.
/// Invariant **S2**: `hard_delete == true` implies `serialized == "{}"` and
/// `conflicting_serialized_data == ""`.
#[derive(Debug, Encode, Decode, Clone, serde::Serialize)]
pub struct StoreRecord {
    pub serialized: String,
    pub conflicting_serialized_data: String,
    pub last_saved_instance: InstanceId,
    pub last_saved_counter: Counter,
    pub deleted: bool,
    pub hard_delete: bool,
    pub model_name: String,
    pub profile: Profile,
    pub partition: Partition,
    pub source_id: String,
    pub self_ref_fk: String,
    pub dirty_bit: bool,
    pub last_transfer_session_id: Option<TransferSessionId>,
}

impl StoreRecord {
    pub fn hard_deleted_payload() -> (String, String) {
        ("{}".to_string(), String::new())
    }
}

// ============================================================================
// BUFFER / RMCB (wire staging, scoped by transfer_session_id)
// ============================================================================

def_table! {
    /// Wire-staging mirror of [`store`], scoped by `transfer_session_id`.
    ///
    /// Keyed by `(transfer_session_id, model_uuid)` so a given row can only
    /// ever be buffered once per session - this is what gives the transport
    /// its exactly-once-per-`(transfer_session_id, model_uuid)` guarantee.
    buffer: (TransferSessionId, StoreId) => BufferRecord
}

def_table! {
    /// Wire-staging mirror of [`record_max_counter`].
    record_max_counter_buffer: (TransferSessionId, StoreId, InstanceId) => Counter
}

/// Same fields as [`StoreRecord`] minus `dirty_bit`/`last_transfer_session_id`
/// (those are store-local bookkeeping, meaningless on the wire).
#[derive(Debug, Encode, Decode, Clone, serde::Serialize, serde::Deserialize)]
pub struct BufferRecord {
    pub serialized: String,
    pub conflicting_serialized_data: String,
    pub last_saved_instance: InstanceId,
    pub last_saved_counter: Counter,
    pub deleted: bool,
    pub hard_delete: bool,
    pub model_name: String,
    pub profile: Profile,
    pub partition: Partition,
    pub source_id: String,
    pub self_ref_fk: String,
}

// ============================================================================
// DATABASE MAX COUNTER
// ============================================================================

def_table! {
    /// Per-filter summary of what this node holds from every known instance.
    ///
    /// Invariant **D1**: monotonically non-decreasing per `(instance_id,
    /// partition)`.
    database_max_counter: (InstanceId, Partition) => Counter
}

// ============================================================================
// DELETION QUEUES (drained by the serializer)
// ============================================================================

def_table! {
    /// Application-layer soft deletions not yet folded into `store`.
    deleted_models: (Profile, StoreId) => ()
}

def_table! {
    /// Application-layer hard deletions not yet folded into `store`.
    hard_deleted_models: (Profile, StoreId) => ()
}

// ============================================================================
// SESSIONS
// ============================================================================

def_table! {
    /// Authenticated, long-lived pairing between two nodes.
    sync_session: SyncSessionId => SyncSessionRecord
}

def_table! {
    /// One directional batch within a `SyncSession`.
    transfer_session: TransferSessionId => TransferSessionRecord
}

#[derive(Debug, Encode, Decode, Clone, serde::Serialize)]
pub struct SyncSessionRecord {
    pub profile: Profile,
    pub peer_instance_id: Option<InstanceId>,
    pub started_at: morango_core::Timestamp,
    pub last_activity_timestamp: morango_core::Timestamp,
}

/// Lifecycle stage of a [`TransferSessionRecord`], mirroring the state
/// machine in the sync crate. Persisted so a crash-resumed client can re-enter
/// at the first incomplete stage.
#[derive(Debug, Encode, Decode, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum TransferStage {
    Initializing,
    Queuing,
    Transferring,
    Dequeuing,
    Cleanup,
    Completed,
    Aborted,
}

#[derive(Debug, Encode, Decode, Clone, serde::Serialize)]
pub struct TransferSessionRecord {
    pub sync_session_id: SyncSessionId,
    /// `true` for push (we are the sender), `false` for pull (we are the
    /// receiver).
    pub push: bool,
    pub filter: Filter,
    pub records_total: u64,
    pub records_transferred: u64,
    pub active: bool,
    pub stage: TransferStage,
    pub server_fsic: morango_core::Fsic,
    pub client_fsic: morango_core::Fsic,
    pub last_activity_timestamp: morango_core::Timestamp,
}

impl TransferSessionRecord {
    /// The FSIC delta (§4.4) this session's sender should queue against.
    ///
    /// On push, the delta is computed from `(client_fsic, server_fsic)` -
    /// the client is the sender; on pull it is the reverse.
    pub fn sender_fsic(&self) -> &morango_core::Fsic {
        if self.push {
            &self.client_fsic
        } else {
            &self.server_fsic
        }
    }

    pub fn receiver_fsic(&self) -> &morango_core::Fsic {
        if self.push {
            &self.server_fsic
        } else {
            &self.client_fsic
        }
    }
}

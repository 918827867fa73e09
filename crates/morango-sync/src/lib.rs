//! Serializer, Deserializer and transfer-session orchestration.
//!
//! `morango-store` only ever touches the Store/Buffer/DMC/session tables; it
//! has no notion of the application's own tables. This crate is the seam
//! where the application schema enters: [`ModelSchema`] is what an embedder
//! implements once per syncable model, and [`SchemaRegistry`] groups those by
//! profile in FK-dependency order (leaves first), matching how the teacher's
//! connection layer takes a capability trait from the caller rather than
//! assuming a concrete transport.

pub mod deserializer;
pub mod schema;
pub mod serializer;
pub mod session;
pub mod transport;

use snafu::{Location, Snafu};

pub use schema::{DirtyRow, ModelSchema, SchemaRegistry};

const LOG_TARGET: &str = "morango::sync";

/// Runtime-configurable knobs, all optional per the external-interfaces
/// contract - every field has the stated default.
#[derive(Debug, Clone)]
pub struct MorangoConfig {
    /// Run the Deserializer at the end of a TransferSession's `cleanup`
    /// stage. Default `true`.
    pub deserialize_after_dequeue: bool,
    /// Rows per transport chunk during `transferring`.
    pub chunk_size: usize,
    /// Overrides the machine-derived component of instance identity.
    pub system_id_override: Option<String>,
    /// How many times a transient `Transport` failure is retried before the
    /// stage gives up and surfaces the error. Default `20`.
    pub transport_max_retries: usize,
    /// Delay between transient-failure retries. Default `50ms`.
    pub transport_retry_backoff: std::time::Duration,
}

impl Default for MorangoConfig {
    fn default() -> Self {
        Self {
            deserialize_after_dequeue: true,
            chunk_size: 500,
            system_id_override: None,
            transport_max_retries: 20,
            transport_retry_backoff: std::time::Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum SyncError {
    /// Anything from the storage layer: identity unavailable, a post-dequeue
    /// `MergeInvariantViolated` self-check failure, or a plain I/O/codec
    /// error. `morango-store` already distinguishes these at its own layer;
    /// match on `source` when the distinction matters here.
    #[snafu(transparent)]
    Store { source: morango_store::DbError },

    /// The peer rejected the requested filter under its current
    /// certificates. Surfaced to the caller; never retried.
    #[snafu(display("peer rejected filter"))]
    FilterRejected {
        #[snafu(implicit)]
        location: Location,
    },

    /// Transport-level failure. `transient` ones are retried by the state
    /// machine (`session::with_transport_retry`), up to
    /// `MorangoConfig::transport_max_retries` times with
    /// `transport_retry_backoff` between attempts, before being surfaced
    /// here; non-transient ones abort the TransferSession immediately,
    /// leaving it `active=true` for a later resume.
    #[snafu(display("transport error: {message} (transient={transient})"))]
    TransportError {
        message: String,
        transient: bool,
        #[snafu(implicit)]
        location: Location,
    },

    /// A single row failed application-level validation during
    /// deserialization. Logged and added to the caller's `excluded` set;
    /// never aborts the batch.
    #[snafu(display("row {store_id} failed to deserialize: {reason}"))]
    DeserializationError {
        store_id: morango_core::StoreId,
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    /// The sync session's certificate or timeout has expired; requires
    /// re-authentication upstream.
    #[snafu(display("sync session expired"))]
    SessionExpired {
        #[snafu(implicit)]
        location: Location,
    },
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

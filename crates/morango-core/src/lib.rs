//! Shared value types for the morango sync engine: identifiers, counters,
//! timestamps and partition filters. No I/O, no storage - just the vocabulary
//! the store and sync crates build on.

pub mod counter;
pub mod filter;
pub mod ids;
mod macros;
pub mod timestamp;

pub use counter::{Counter, Fsic, InstanceAndCounter};
pub use filter::{Filter, Partition, Profile};
pub use ids::{HexIdParseError, InstanceId, ModelUuid, StoreId, SyncSessionId, TransferSessionId};
pub use timestamp::Timestamp;

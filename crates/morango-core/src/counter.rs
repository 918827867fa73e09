use std::collections::BTreeMap;

use crate::ids::InstanceId;

/// Monotonically increasing per-instance write counter.
pub type Counter = i64;

/// `(instance_id, counter)` pair returned by the instance registry each time
/// it is asked to mint a fresh write stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceAndCounter {
    pub instance_id: InstanceId,
    pub counter: Counter,
}

/// Filtered Set Inclusion Counter: `{ instance_id -> counter }`.
///
/// A `BTreeMap` rather than `HashMap` so wire encoding (and test assertions)
/// are deterministic regardless of insertion order.
pub type Fsic = BTreeMap<InstanceId, Counter>;

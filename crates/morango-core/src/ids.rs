//! Identifier types shared by the whole sync stack.
//!
//! [`InstanceId`] names a single database replica. [`StoreId`],
//! [`SyncSessionId`] and [`TransferSessionId`] are the 32-hex-char UUIDs the
//! spec requires for every primary key other than counters.

use crate::define_hex_array_type;

define_hex_array_type!(
    /// 128-bit identity of a single morango-backed database instance.
    ///
    /// Derived once at first run from persisted system parameters (machine
    /// id, database id, optional override) and never regenerated in place -
    /// see [`crate::counter::InstanceAndCounter`] for the value it is paired
    /// with.
    struct InstanceId, 16
);

define_hex_array_type!(
    /// Opaque primary key of a `Store`/`Buffer` row.
    ///
    /// Typically computed by the application layer from `(partition,
    /// source_id, model_name)`; morango treats it as an opaque 16-byte value.
    struct StoreId, 16
);

define_hex_array_type!(
    /// Primary key of a `SyncSession`.
    struct SyncSessionId, 16
);

define_hex_array_type!(
    /// Primary key of a `TransferSession`.
    struct TransferSessionId, 16
);

/// Alias used in contexts (buffer rows, wire format) where the field is
/// named `model_uuid` rather than `store_id`, but is the very same key space.
pub type ModelUuid = StoreId;

#[derive(Debug, snafu::Snafu, Clone, Copy, PartialEq, Eq)]
pub enum HexIdParseError {
    #[snafu(display("not valid hex"))]
    InvalidHex,
    #[snafu(display("expected {expected} bytes after hex-decoding"))]
    InvalidLength { expected: usize },
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn roundtrip_hex() {
        let id = InstanceId::random();
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        let parsed = InstanceId::from_str(&s).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            InstanceId::from_str("ab"),
            Err(HexIdParseError::InvalidLength { expected: 16 })
        ));
    }

    #[test]
    fn rejects_non_hex() {
        assert!(matches!(
            InstanceId::from_str("zz"),
            Err(HexIdParseError::InvalidHex)
        ));
    }
}

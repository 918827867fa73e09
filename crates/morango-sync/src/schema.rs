//! The application schema registry, consumed but never defined here (§6).
//!
//! An embedder implements [`ModelSchema`] once per syncable model and groups
//! them behind a [`SchemaRegistry`], ordered leaves-first by FK dependency -
//! the same shape the Deserializer's topological pass expects.

use morango_core::{Filter, Partition, Profile, StoreId};

use crate::SyncError;

/// One dirty application row, as handed to the Serializer.
///
/// `serialized` is already the output of the app row's own `serialize()` -
/// this crate only ever does the JSON field-overlay merge, never app-level
/// encoding.
#[derive(Debug, Clone)]
pub struct DirtyRow {
    pub store_id: StoreId,
    pub source_id: String,
    pub partition: Partition,
    pub self_ref_fk: Option<StoreId>,
    pub serialized: serde_json::Map<String, serde_json::Value>,
}

/// Capabilities an embedder must supply for one syncable model class.
pub trait ModelSchema: Send + Sync {
    fn model_name(&self) -> &str;

    /// Other model names this one's self-ref-free deserialization depends
    /// on, in no particular order (the registry's overall ordering is what
    /// carries the leaves-first guarantee).
    fn dependencies(&self) -> &[String];

    fn has_self_ref_fk(&self) -> bool;

    /// Application rows with `_morango_dirty_bit = true`, optionally
    /// restricted by `filter`.
    fn dirty_rows(&self, filter: &Filter) -> Vec<DirtyRow>;

    /// Clear `_morango_dirty_bit` on the application side for rows the
    /// Serializer has just promoted into Store.
    fn clear_dirty_bits(&self, store_ids: &[StoreId]);

    /// Integrate one Store payload into the application table. `Err` means
    /// app-level validation failed (e.g. a missing parent row); the caller
    /// adds `store_id` to `excluded` and leaves its Store dirty bit set.
    fn deserialize_row(&self, store_id: StoreId, serialized: &str) -> Result<(), SyncError>;
}

/// Per-profile set of [`ModelSchema`]s, ordered leaves-first by FK
/// dependency - the order the Deserializer's non-self-ref pass uses
/// directly, and the order the self-ref pass seeds `clean_parents` from.
pub trait SchemaRegistry: Send + Sync {
    fn models(&self, profile: &Profile) -> Vec<&dyn ModelSchema>;
}

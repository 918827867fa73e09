//! Wire types and the [`Transport`] seam a `TransferSession` drives.
//!
//! `morango-sync` never opens a socket itself - an embedder supplies a
//! [`Transport`] impl (HTTP, QUIC, whatever carries the bytes) the same way
//! the sync engine takes a `SchemaRegistry` rather than owning the
//! application's tables. [`LocalTransport`] is an in-process loopback used by
//! this crate's own tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use morango_core::{Filter, Fsic, InstanceId, Partition, Profile, StoreId, TransferSessionId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{SyncResult, TransportErrorSnafu};

/// One `(instance_id, counter)` pair of a buffered row's vector clock, as it
/// crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRmcbEntry {
    pub instance_id: InstanceId,
    pub counter: i64,
}

/// One `Buffer`/`RecordMaxCounterBuffer` row, serialized per the wire schema
/// in the external-interfaces contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireBufferRow {
    pub model_uuid: StoreId,
    pub serialized: String,
    pub deleted: bool,
    pub last_saved_instance: InstanceId,
    pub last_saved_counter: i64,
    pub hard_delete: bool,
    pub model_name: String,
    pub profile: Profile,
    pub partition: Partition,
    pub source_id: String,
    pub conflicting_serialized_data: String,
    #[serde(rename = "_self_ref_fk")]
    pub self_ref_fk: String,
    pub rmcb: Vec<WireRmcbEntry>,
}

/// A Filtered Set Inclusion Counter, as exchanged at session init: a flat
/// `{instance_id_hex: counter}` object, one entry per instance this node has
/// ever integrated writes from.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WireFsic(pub BTreeMap<String, i64>);

impl From<&Fsic> for WireFsic {
    fn from(fsic: &Fsic) -> Self {
        Self(
            fsic.iter()
                .map(|(iid, counter)| (iid.to_string(), *counter))
                .collect(),
        )
    }
}

impl TryFrom<&WireFsic> for Fsic {
    type Error = morango_core::HexIdParseError;

    fn try_from(wire: &WireFsic) -> Result<Self, Self::Error> {
        wire.0
            .iter()
            .map(|(hex, counter)| Ok((hex.parse()?, *counter)))
            .collect()
    }
}

/// One chunk of buffered rows, plus whether the sender has nothing further
/// to send for this `transfer_session_id`.
pub struct RecvChunk {
    pub rows: Vec<WireBufferRow>,
    pub eof: bool,
}

/// Carries the bytes between two nodes. Every method is keyed by
/// `transfer_session_id` so a single `Transport` can multiplex several
/// concurrent sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_fsic(&self, transfer_session_id: TransferSessionId, fsic: WireFsic) -> SyncResult<()>;

    async fn recv_fsic(&self, transfer_session_id: TransferSessionId) -> SyncResult<WireFsic>;

    async fn request_filter(
        &self,
        transfer_session_id: TransferSessionId,
        filter: Filter,
    ) -> SyncResult<bool>;

    async fn send_chunk(
        &self,
        transfer_session_id: TransferSessionId,
        rows: Vec<WireBufferRow>,
        eof: bool,
    ) -> SyncResult<()>;

    async fn recv_chunk(&self, transfer_session_id: TransferSessionId) -> SyncResult<RecvChunk>;
}

#[derive(Default)]
struct Mailbox {
    fsic: Vec<WireFsic>,
    chunks: Vec<(Vec<WireBufferRow>, bool)>,
}

/// In-process loopback: two [`LocalTransport`] handles sharing the same
/// `peer_inbox`/`own_inbox` pair form a direct channel, each side's sends
/// landing in the other's receive queue.
#[derive(Clone)]
pub struct LocalTransport {
    outbox: Arc<Mutex<BTreeMap<TransferSessionId, Mailbox>>>,
    inbox: Arc<Mutex<BTreeMap<TransferSessionId, Mailbox>>>,
}

impl LocalTransport {
    /// Build a connected pair: whatever `a` sends, `b` receives, and vice
    /// versa.
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Mutex::new(BTreeMap::new()));
        let b_to_a = Arc::new(Mutex::new(BTreeMap::new()));
        (
            Self {
                outbox: a_to_b.clone(),
                inbox: b_to_a.clone(),
            },
            Self {
                outbox: b_to_a,
                inbox: a_to_b,
            },
        )
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send_fsic(&self, transfer_session_id: TransferSessionId, fsic: WireFsic) -> SyncResult<()> {
        self.outbox
            .lock()
            .await
            .entry(transfer_session_id)
            .or_default()
            .fsic
            .push(fsic);
        Ok(())
    }

    async fn recv_fsic(&self, transfer_session_id: TransferSessionId) -> SyncResult<WireFsic> {
        let mut inbox = self.inbox.lock().await;
        let mailbox = inbox.entry(transfer_session_id).or_default();
        if mailbox.fsic.is_empty() {
            return TransportErrorSnafu {
                message: "no FSIC available yet".to_string(),
                transient: true,
            }
            .fail();
        }
        Ok(mailbox.fsic.remove(0))
    }

    async fn request_filter(
        &self,
        _transfer_session_id: TransferSessionId,
        _filter: Filter,
    ) -> SyncResult<bool> {
        // Filter certificate negotiation is an embedder policy this
        // loopback doesn't model - always grant.
        Ok(true)
    }

    async fn send_chunk(
        &self,
        transfer_session_id: TransferSessionId,
        rows: Vec<WireBufferRow>,
        eof: bool,
    ) -> SyncResult<()> {
        self.outbox
            .lock()
            .await
            .entry(transfer_session_id)
            .or_default()
            .chunks
            .push((rows, eof));
        Ok(())
    }

    async fn recv_chunk(&self, transfer_session_id: TransferSessionId) -> SyncResult<RecvChunk> {
        let mut inbox = self.inbox.lock().await;
        let mailbox = inbox.entry(transfer_session_id).or_default();
        if mailbox.chunks.is_empty() {
            return TransportErrorSnafu {
                message: "no chunk available yet".to_string(),
                transient: true,
            }
            .fail();
        }
        let (rows, eof) = mailbox.chunks.remove(0);
        Ok(RecvChunk { rows, eof })
    }
}

pub fn rmc_map_to_wire(rmcb: &[(InstanceId, i64)]) -> Vec<WireRmcbEntry> {
    rmcb.iter()
        .map(|(instance_id, counter)| WireRmcbEntry {
            instance_id: *instance_id,
            counter: *counter,
        })
        .collect()
}

pub fn wire_fsic_to_fsic(wire: &WireFsic) -> SyncResult<Fsic> {
    Fsic::try_from(wire).map_err(|_| {
        TransportErrorSnafu {
            message: "malformed FSIC instance id".to_string(),
            transient: false,
        }
        .build()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn paired_transports_deliver_to_each_other() -> Result<(), Box<dyn std::error::Error>> {
        let (a, b) = LocalTransport::pair();
        let t = TransferSessionId::random();

        a.send_fsic(t, WireFsic::default()).await?;
        let received = b.recv_fsic(t).await?;
        assert!(received.0.is_empty());

        b.send_chunk(t, vec![], true).await?;
        let chunk = a.recv_chunk(t).await?;
        assert!(chunk.eof);
        Ok(())
    }

    #[test]
    fn wire_fsic_roundtrips() {
        let iid = InstanceId::from_bytes([7; 16]);
        let fsic = Fsic::from([(iid, 42)]);
        let wire = WireFsic::from(&fsic);
        let back = Fsic::try_from(&wire).unwrap();
        assert_eq!(fsic, back);
    }
}

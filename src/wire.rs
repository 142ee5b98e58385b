//! Wire frames exchanged between peer-service instances.
//!
//! Generalizes the teacher's `wire.rs` (`Join`/`ForwardJoin`/`Neighbor`/
//! `Shuffle`/`ShuffleReply`/`Disconnect`, collected under an `Action`
//! enum) to the spec's frame set, with `PeerSpec` replacing
//! `AddressablePeer` and disconnect ids replacing libp2p-level "graceful"
//! booleans.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
  epoch::{DisconnectId, Epoch},
  peer::{PeerSpec, Tag},
};

/// Priority of a NEIGHBOR_REQUEST. `High` is an eager replacement request
/// that must always be accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
  High,
  Normal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Join {
  pub peer: PeerSpec,
  pub tag: Option<Tag>,
  pub epoch: Epoch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardJoin {
  pub peer: PeerSpec,
  pub tag: Option<Tag>,
  pub epoch: Epoch,
  pub ttl: u16,
  pub sender: PeerSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neighbor {
  pub peer: PeerSpec,
  pub tag: Option<Tag>,
  pub last_disconnect_id: DisconnectId,
  pub target: PeerSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborRequest {
  pub peer: PeerSpec,
  pub priority: Priority,
  pub tag: Option<Tag>,
  pub disconnect_id: DisconnectId,
  pub exchange: Vec<PeerSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborAccepted {
  pub peer: PeerSpec,
  pub tag: Option<Tag>,
  pub last_disconnect_id: DisconnectId,
  pub exchange: Vec<PeerSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborRejected {
  pub peer: PeerSpec,
  pub exchange: Vec<PeerSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disconnect {
  pub peer: PeerSpec,
  pub disconnect_id: DisconnectId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shuffle {
  pub exchange: Vec<PeerSpec>,
  pub ttl: u16,
  pub sender: PeerSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShuffleReply {
  pub exchange: Vec<PeerSpec>,
  pub sender: PeerSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
  pub target: PeerSpec,
  pub inner: Bytes,
  pub ttl: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectPartition {
  pub reference: String,
  pub origin: PeerSpec,
  pub ttl: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvePartition {
  pub reference: String,
}

/// Top-level tagged-variant frame type. Inbound frames are matched
/// exhaustively by [`crate::handlers::dispatch`]; an unrecognized tag
/// cannot occur at this type but can occur when decoding raw bytes (see
/// `Coordinator::receive_raw`), which logs and drops rather than
/// panicking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
  Join(Join),
  ForwardJoin(ForwardJoin),
  Neighbor(Neighbor),
  NeighborRequest(NeighborRequest),
  NeighborAccepted(NeighborAccepted),
  NeighborRejected(NeighborRejected),
  Disconnect(Disconnect),
  Shuffle(Shuffle),
  ShuffleReply(ShuffleReply),
  RelayMessage(RelayMessage),
  InjectPartition(InjectPartition),
  ResolvePartition(ResolvePartition),
}

impl Frame {
  /// Human-readable tag, used in logging/metrics labels, mirroring the
  /// symbolic names fixed in the spec's frame table.
  pub fn tag(&self) -> &'static str {
    match self {
      Frame::Join(_) => "join",
      Frame::ForwardJoin(_) => "forward_join",
      Frame::Neighbor(_) => "neighbor",
      Frame::NeighborRequest(_) => "neighbor_request",
      Frame::NeighborAccepted(_) => "neighbor_accepted",
      Frame::NeighborRejected(_) => "neighbor_rejected",
      Frame::Disconnect(_) => "disconnect",
      Frame::Shuffle(_) => "shuffle",
      Frame::ShuffleReply(_) => "shuffle_reply",
      Frame::RelayMessage(_) => "relay_message",
      Frame::InjectPartition(_) => "inject_partition",
      Frame::ResolvePartition(_) => "resolve_partition",
    }
  }
}

/// The calling application's own payload, carried by `send_message` /
/// `forward_message` / `RELAY_MESSAGE`. Opaque to this crate.
pub type AppMessage = Bytes;

/// Options accompanying `forward_message`. The channel/server-ref
/// argument this carries in the source is documented there as ignored;
/// this crate preserves that (Open Question (c)).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardOptions {
  pub server_ref: Option<String>,
}

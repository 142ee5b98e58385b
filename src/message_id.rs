//! Per-peer sent/received disconnect-id bookkeeping, and the admission
//! predicates that use it to discard stale protocol frames.

use std::collections::HashMap;

use crate::{
  epoch::{DisconnectId, IncomingId},
  peer::PeerSpec,
};

/// `PeerSpec -> DisconnectId`: the last disconnect id we sent to, or
/// accepted from, each peer.
#[derive(Debug, Default, Clone)]
pub struct MessageIdMap {
  ids: HashMap<String, DisconnectId>,
}

impl MessageIdMap {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, peer: &PeerSpec) -> Option<DisconnectId> {
    self.ids.get(&peer.name).copied()
  }

  pub fn set(&mut self, peer: &PeerSpec, id: DisconnectId) {
    self.ids.insert(peer.name.clone(), id);
  }

  pub fn remove(&mut self, peer: &PeerSpec) {
    self.ids.remove(&peer.name);
  }
}

/// Returns true iff there is no record for `peer` in `sent`, or `id` is
/// greater than or equal to the stored id under lexicographic order.
///
/// This is the defence against old disconnect frames overtaking newer
/// joins: a `JOIN`/`NEIGHBOR`/`NEIGHBOR_REQUEST`/`NEIGHBOR_ACCEPTED` is
/// admitted only if its id is not older than the last disconnect we sent
/// that peer.
pub fn is_addable(
  id: impl Into<IncomingId>,
  peer: &PeerSpec,
  sent: &MessageIdMap,
) -> bool {
  match sent.get(peer) {
    None => true,
    Some(stored) => id.into().at_least(&stored),
  }
}

/// Returns true iff there is no record for `peer` in `recv`, or `id` is
/// strictly greater than the stored id. Ties are discarded as duplicates.
pub fn is_valid_disconnect(
  peer: &PeerSpec,
  id: DisconnectId,
  recv: &MessageIdMap,
) -> bool {
  match recv.get(peer) {
    None => true,
    Some(stored) => id > stored,
  }
}

/// Computes the next disconnect id to send to `peer`, per §4.3 step 3:
/// `(self_epoch, Sent[p].counter + 1 or 1)`.
pub fn next_disconnect_id(
  self_epoch: crate::epoch::Epoch,
  peer: &PeerSpec,
  sent: &MessageIdMap,
) -> DisconnectId {
  let counter = match sent.get(peer) {
    Some(prev) if prev.epoch == self_epoch => prev.counter + 1,
    _ => 1,
  };
  DisconnectId::new(self_epoch, counter)
}
